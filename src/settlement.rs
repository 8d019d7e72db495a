//! Downstream side effect performed for each drained queue item.
//!
//! Settlement is at-most-once: the drainer does not re-queue an item whose settlement
//! failed, it only logs and counts the failure.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::queue::{ItemKind, QueueItem};

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Failed to construct billing URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Billing rejected item with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Settlement: Send + Sync {
    fn name(&self) -> &'static str;
    async fn settle(&self, item: &QueueItem) -> Result<(), SettlementError>;
}

/// Logs each item. Used when no billing service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSettlement;

#[async_trait]
impl Settlement for LogSettlement {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn settle(&self, item: &QueueItem) -> Result<(), SettlementError> {
        tracing::info!(
            id = %item.id,
            kind = item.kind.as_str(),
            lag_ms = item.lag().as_millis() as u64,
            "Settled queue item"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct InvoiceRequest<'a> {
    job: Option<&'a str>,
    id: &'a str,
    kind: ItemKind,
    payload: &'a Value,
}

/// Posts each item to the billing service's `/invoice` endpoint.
#[derive(Debug, Clone)]
pub struct BillingSettlement {
    client: Client,
    invoice_url: Url,
    timeout: Duration,
}

impl BillingSettlement {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn try_new(base_url: &Url) -> Result<Self, SettlementError> {
        let mut base = base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let invoice_url = base.join("./invoice")?;
        Ok(Self {
            client: Client::new(),
            invoice_url,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn invoice_url(&self) -> &Url {
        &self.invoice_url
    }
}

#[async_trait]
impl Settlement for BillingSettlement {
    fn name(&self) -> &'static str {
        "billing"
    }

    async fn settle(&self, item: &QueueItem) -> Result<(), SettlementError> {
        let job = item
            .payload
            .get("job_id")
            .or_else(|| item.payload.get("job"))
            .and_then(Value::as_str);
        let request = InvoiceRequest {
            job,
            id: &item.id,
            kind: item.kind,
            payload: &item.payload,
        };
        let response = self
            .client
            .post(self.invoice_url.clone())
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SettlementError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn usage_item() -> QueueItem {
        QueueItem::new(
            ItemKind::Usage,
            Some("rx-0000001".into()),
            json!({"job_id": "job-9", "units": 11840}),
        )
    }

    #[test]
    fn test_invoice_url_keeps_base_path() {
        let base: Url = "http://billing.internal/api".parse().unwrap();
        let settlement = BillingSettlement::try_new(&base).unwrap();
        assert_eq!(
            settlement.invoice_url().as_str(),
            "http://billing.internal/api/invoice"
        );
    }

    #[tokio::test]
    async fn test_billing_settlement_posts_invoice() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoice"))
            .and(body_partial_json(json!({
                "job": "job-9",
                "id": "rx-0000001",
                "kind": "usage",
                "payload": {"units": 11840},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let settlement = BillingSettlement::try_new(&mock_server.uri().parse().unwrap()).unwrap();
        settlement.settle(&usage_item()).await.unwrap();
    }

    #[tokio::test]
    async fn test_billing_settlement_non_success_is_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoice"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let settlement = BillingSettlement::try_new(&mock_server.uri().parse().unwrap()).unwrap();
        let result = settlement.settle(&usage_item()).await;
        assert!(matches!(
            result,
            Err(SettlementError::Rejected { status: 500, ref body }) if body == "boom"
        ));
    }

    #[tokio::test]
    async fn test_log_settlement_always_succeeds() {
        LogSettlement.settle(&usage_item()).await.unwrap();
    }
}
