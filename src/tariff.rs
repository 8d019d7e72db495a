//! Published rate table and quote arithmetic.
//!
//! All money math is decimal. Credits are rounded up to the next whole credit.

use alloy_primitives::keccak256;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::timestamp::now_millis;

/// Credits charged per unit when a plan entry names no known endpoint.
pub const DEFAULT_CREDITS_PER_UNIT: Decimal = Decimal::from_parts(4, 0, 0, false, 5);

/// How long a quote stays valid.
pub const QUOTE_VALIDITY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rate {
    pub endpoint: String,
    pub units_per_call: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub credits_per_unit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTable {
    pub version: String,
    pub rates: Vec<Rate>,
}

impl RateTable {
    pub fn v1() -> Self {
        Self {
            version: "v1".to_string(),
            rates: vec![Rate {
                endpoint: "llm.chat.v1".to_string(),
                units_per_call: 12_000,
                credits_per_unit: DEFAULT_CREDITS_PER_UNIT,
            }],
        }
    }
}

/// One line of a quote request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PlanEntry {
    #[serde(default)]
    pub endpoint_id: Option<String>,
    /// Estimated units. When absent, the endpoint's units-per-call is used.
    #[serde(default)]
    pub est_units: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub estimated_credits: u64,
    pub tariff_hash: String,
    pub expires_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TariffError {
    #[error("plan entry {index} has negative est_units")]
    NegativeUnits { index: usize },
    #[error("quote total out of range")]
    Overflow,
    #[error("failed to encode rate table: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A rate table together with its content hash.
#[derive(Debug, Clone)]
pub struct Tariff {
    table: RateTable,
    hash: String,
}

#[derive(Serialize)]
struct PublishedTariff<'a> {
    #[serde(flatten)]
    table: &'a RateTable,
    hash: &'a str,
}

impl Tariff {
    pub fn new(table: RateTable) -> Result<Self, TariffError> {
        let canonical = serde_json::to_vec(&table)?;
        let hash = format!("0x{}", hex::encode(keccak256(&canonical)));
        Ok(Self { table, hash })
    }

    pub fn v1() -> Result<Self, TariffError> {
        Self::new(RateTable::v1())
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn table(&self) -> &RateTable {
        &self.table
    }

    /// The table as served on `GET /v1/tariff`.
    pub fn published(&self) -> Result<serde_json::Value, TariffError> {
        Ok(serde_json::to_value(PublishedTariff {
            table: &self.table,
            hash: &self.hash,
        })?)
    }

    pub fn rate_for(&self, endpoint: Option<&str>) -> Option<&Rate> {
        let endpoint = endpoint?;
        self.table.rates.iter().find(|r| r.endpoint == endpoint)
    }

    /// Prices `plan` as `ceil(sum(units * credits_per_unit))`.
    pub fn quote(&self, plan: &[PlanEntry]) -> Result<Quote, TariffError> {
        let mut total = Decimal::ZERO;
        for (index, entry) in plan.iter().enumerate() {
            let rate = self.rate_for(entry.endpoint_id.as_deref());
            let units = match entry.est_units {
                Some(units) => units,
                None => Decimal::from(rate.map_or(0, |r| r.units_per_call)),
            };
            if units.is_sign_negative() && !units.is_zero() {
                return Err(TariffError::NegativeUnits { index });
            }
            let per_unit = rate.map_or(DEFAULT_CREDITS_PER_UNIT, |r| r.credits_per_unit);
            let line = units.checked_mul(per_unit).ok_or(TariffError::Overflow)?;
            total = total.checked_add(line).ok_or(TariffError::Overflow)?;
        }
        let estimated_credits = total.ceil().to_u64().ok_or(TariffError::Overflow)?;
        Ok(Quote {
            estimated_credits,
            tariff_hash: self.hash.clone(),
            expires_ms: now_millis() + QUOTE_VALIDITY.as_millis() as u64,
        })
    }
}
