//! Usage credentials: issuance, verification and the accepted wire formats.
//!
//! The gateway issues [`CredentialFormat::Hmac`] tokens:
//!
//! ```text
//! base64url(claims_json) "." base64url(HMAC-SHA256(secret, claims_json))
//! ```
//!
//! Two further formats are understood on input. [`CredentialFormat::WalletSigned`] is a
//! base64 CBOR envelope `{payload, sig, signer}` signed with an EIP-191 personal
//! signature. [`CredentialFormat::LegacyJson`] is unsigned base64 JSON carrying only a job
//! id and an expiry, accepted only when the security policy lists it.
//!
//! Decoding walks an ordered list of formats. The first format that recognises the
//! token's shape decides the outcome, so a wallet token with a bad signature is rejected
//! outright instead of being retried as legacy JSON.

use alloy_primitives::Address;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::auth::signer::{self, SignerError};
use crate::timestamp::UnixTimestamp;
use crate::util::Base64Bytes;

type HmacSha256 = Hmac<Sha256>;

/// Validity window for credentials minted on a successful lock.
pub const DEFAULT_CREDENTIAL_VALIDITY: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialFormat {
    Hmac,
    WalletSigned,
    LegacyJson,
}

/// Claims carried by a gateway-issued usage credential.
///
/// Field order is the canonical serialization order and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageClaims {
    pub job_id: String,
    pub locked_budget_apic: u64,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub exp: UnixTimestamp,
}

/// Claims of an unsigned development token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyClaims {
    pub job_id: String,
    pub expires_at: UnixTimestamp,
}

/// A usage credential that passed verification, tagged by the format it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    Hmac(UsageClaims),
    WalletSigned { signer: Address, payload: Value },
    LegacyJson(LegacyClaims),
}

impl Credential {
    pub fn format(&self) -> CredentialFormat {
        match self {
            Credential::Hmac(_) => CredentialFormat::Hmac,
            Credential::WalletSigned { .. } => CredentialFormat::WalletSigned,
            Credential::LegacyJson(_) => CredentialFormat::LegacyJson,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Credential::Hmac(claims) => Some(&claims.job_id),
            Credential::WalletSigned { payload, .. } => payload
                .get("job_id")
                .or_else(|| payload.get("job"))
                .and_then(Value::as_str),
            Credential::LegacyJson(claims) => Some(&claims.job_id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The token does not have the shape of the format being tried.
    #[error("token not recognised")]
    Unrecognized,
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("credential signature mismatch")]
    BadSignature,
    #[error("credential expired at {0}")]
    Expired(UnixTimestamp),
    #[error("signing key rejected")]
    InvalidKey,
    #[error("failed to serialize claims: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SignerError> for CredentialError {
    fn from(error: SignerError) -> Self {
        match error {
            SignerError::Mismatch { .. } => CredentialError::BadSignature,
            other => CredentialError::Malformed(other.to_string()),
        }
    }
}

/// Issues and verifies usage credentials under the process-wide shared secret.
///
/// Every operation is a pure function of the secret and its input.
#[derive(Clone)]
pub struct CredentialCodec {
    secret: SecretString,
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec").finish_non_exhaustive()
    }
}

impl CredentialCodec {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256, CredentialError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| CredentialError::InvalidKey)
    }

    /// Signs `claims` into an opaque token.
    ///
    /// The expiry is normalized to seconds first. No check is made that it lies in the
    /// future; use [`CredentialCodec::mint`] for that.
    pub fn issue(&self, claims: &UsageClaims) -> Result<String, CredentialError> {
        let mut claims = claims.clone();
        claims.exp = UnixTimestamp::normalized(claims.exp.as_secs());
        let payload = serde_json::to_vec(&claims)?;
        let mut mac = self.mac()?;
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            Base64Bytes::encode(&payload),
            Base64Bytes::encode(signature)
        ))
    }

    /// Mints a fresh credential valid for `validity` from now.
    pub fn mint(
        &self,
        job_id: impl Into<String>,
        locked_budget_apic: u64,
        endpoints: Vec<String>,
        validity: Duration,
    ) -> Result<(String, UsageClaims), CredentialError> {
        let claims = UsageClaims {
            job_id: job_id.into(),
            locked_budget_apic,
            endpoints,
            exp: UnixTimestamp::now() + validity.as_secs().max(1),
        };
        let token = self.issue(&claims)?;
        Ok((token, claims))
    }

    /// Verifies a token produced by [`CredentialCodec::issue`].
    ///
    /// Fails on any shape problem, a signature mismatch, or once the expiry has passed.
    pub fn verify(&self, token: &str) -> Result<UsageClaims, CredentialError> {
        let (payload_b64, signature_b64) = token
            .trim()
            .split_once('.')
            .ok_or(CredentialError::Unrecognized)?;
        if signature_b64.contains('.') {
            return Err(CredentialError::Unrecognized);
        }
        let payload = Base64Bytes::from(payload_b64)
            .decode()
            .map_err(|_| CredentialError::Unrecognized)?;
        let signature = Base64Bytes::from(signature_b64)
            .decode()
            .map_err(|_| CredentialError::Unrecognized)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        let expected = mac.finalize().into_bytes();
        if !bool::from(expected.as_slice().ct_eq(&signature)) {
            return Err(CredentialError::BadSignature);
        }

        let claims: UsageClaims = serde_json::from_slice(&payload)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if claims.exp.is_past() {
            return Err(CredentialError::Expired(claims.exp));
        }
        Ok(claims)
    }

    /// Decodes `token` by trying `formats` in order.
    pub fn decode(
        &self,
        token: &str,
        formats: &[CredentialFormat],
    ) -> Result<Credential, CredentialError> {
        for format in formats {
            match self.decode_as(*format, token) {
                Ok(credential) => return Ok(credential),
                Err(CredentialError::Unrecognized) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(CredentialError::Unrecognized)
    }

    fn decode_as(&self, format: CredentialFormat, token: &str) -> Result<Credential, CredentialError> {
        match format {
            CredentialFormat::Hmac => self.verify(token).map(Credential::Hmac),
            CredentialFormat::WalletSigned => decode_wallet_signed(token),
            CredentialFormat::LegacyJson => decode_legacy_json(token).map(Credential::LegacyJson),
        }
    }
}

/// CBOR envelope of a wallet-signed credential.
#[derive(Debug, Serialize, Deserialize)]
pub struct WalletEnvelope {
    #[serde(default)]
    pub payload: Value,
    pub sig: String,
    pub signer: String,
}

fn decode_wallet_signed(token: &str) -> Result<Credential, CredentialError> {
    if token.contains('.') {
        return Err(CredentialError::Unrecognized);
    }
    let bytes = Base64Bytes::from(token)
        .decode()
        .map_err(|_| CredentialError::Unrecognized)?;
    let envelope: WalletEnvelope =
        ciborium::from_reader(bytes.as_slice()).map_err(|_| CredentialError::Unrecognized)?;

    let signer = signer::parse_address(&envelope.signer)?;
    let message = serde_json::to_string(&envelope.payload)?;
    signer::verify_personal_signature(message.as_bytes(), &envelope.sig, signer)?;

    let expiry = envelope
        .payload
        .get("exp")
        .or_else(|| envelope.payload.get("expires_at"));
    if let Some(expiry) = expiry {
        let expiry = parse_expiry(expiry)?;
        if expiry.is_past() {
            return Err(CredentialError::Expired(expiry));
        }
    }
    Ok(Credential::WalletSigned {
        signer,
        payload: envelope.payload,
    })
}

#[derive(Deserialize)]
struct RawLegacyClaims {
    job_id: String,
    expires_at: Value,
}

fn decode_legacy_json(token: &str) -> Result<LegacyClaims, CredentialError> {
    let bytes = Base64Bytes::from(token)
        .decode()
        .map_err(|_| CredentialError::Unrecognized)?;
    let raw: RawLegacyClaims =
        serde_json::from_slice(&bytes).map_err(|_| CredentialError::Unrecognized)?;
    if raw.job_id.is_empty() {
        return Err(CredentialError::Unrecognized);
    }
    let expires_at = parse_expiry(&raw.expires_at)?;
    if expires_at.is_past() {
        return Err(CredentialError::Expired(expires_at));
    }
    Ok(LegacyClaims {
        job_id: raw.job_id,
        expires_at,
    })
}

/// Reads an expiry given as RFC 3339 text, unix seconds, or unix milliseconds.
fn parse_expiry(value: &Value) -> Result<UnixTimestamp, CredentialError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(UnixTimestamp::normalized)
            .ok_or_else(|| CredentialError::Malformed(format!("bad expiry {n}"))),
        Value::String(s) => {
            if let Ok(raw) = s.parse::<u64>() {
                return Ok(UnixTimestamp::normalized(raw));
            }
            let parsed = DateTime::parse_from_rfc3339(s)
                .map_err(|e| CredentialError::Malformed(format!("bad expiry {s}: {e}")))?;
            let secs = u64::try_from(parsed.timestamp()).unwrap_or_default();
            Ok(UnixTimestamp::from_secs(secs))
        }
        other => Err(CredentialError::Malformed(format!("bad expiry {other}"))),
    }
}
