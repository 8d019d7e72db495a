//! HTTP endpoints of the gateway.
//!
//! - `POST /v1/jobs/quote` prices a plan against the tariff.
//! - `POST /v1/jobs/lock` authorizes the caller and mints a usage credential.
//! - `POST /v1/execute` reports usage for a paid action.
//! - `POST /v1/usage/emit` and `POST /v1/oracle/receipt` enqueue items for settlement.
//! - `GET /v1/tariff`, `GET /health` and `GET /metrics` are read-only.
//!
//! Every JSON body rejection is answered with `400`, auth failures with a bare `401`.
//! Internal errors and handler panics become a bare `500`. Their detail is logged in
//! development only.

use axum::body::Bytes;
use axum::extract::{FromRequest, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::instrument;

use crate::auth::credential::DEFAULT_CREDENTIAL_VALIDITY;
use crate::auth::{
    AuthError, AuthGate, AuthRequest, CredentialCodec, CredentialError, ReplayCache, SecurityPolicy,
};
use crate::config::GatewayMode;
use crate::metrics::{GatewayMetrics, MetricsError, MetricsRecorder};
use crate::queue::{Durability, DurableQueue, ItemKind, QueueDrainer, QueueItem};
use crate::settlement::Settlement;
use crate::tariff::{PlanEntry, Tariff, TariffError};
use crate::timestamp::UnixTimestamp;

pub const USAGE_AUTH_HEADER: &str = "usage-auth";
pub const DPOP_HEADER: &str = "dpop";
pub const LOCK_HANDLE_HEADER: &str = "x-lock-handle";

/// Usage reported by `POST /v1/execute`.
pub const EXECUTE_USAGE_UNITS: u64 = 11_840;
pub const EXECUTE_USAGE_CREDITS: u64 = 474;

/// Shared state behind every handler.
pub struct GatewayState {
    mode: GatewayMode,
    auth: AuthGate,
    queue: Arc<DurableQueue>,
    drainer: QueueDrainer,
    tariff: Tariff,
    metrics: Arc<GatewayMetrics>,
}

impl GatewayState {
    /// Wires the components together and starts the queue drainer.
    pub fn new(
        mode: GatewayMode,
        codec: CredentialCodec,
        replay_cache: Arc<dyn ReplayCache>,
        queue: Arc<DurableQueue>,
        settlement: Arc<dyn Settlement>,
        tariff: Tariff,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let policy = SecurityPolicy::from_mode(mode);
        let auth = AuthGate::new(codec, policy, replay_cache, metrics.clone());
        let drainer = QueueDrainer::spawn(queue.clone(), settlement, metrics.clone());
        Self {
            mode,
            auth,
            queue,
            drainer,
            tariff,
            metrics,
        }
    }

    pub fn drainer(&self) -> &QueueDrainer {
        &self.drainer
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing or invalid auth")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing or invalid auth" })),
            )
                .into_response(),
            GatewayError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            GatewayError::Internal(detail) => {
                let mut response = (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response();
                response.extensions_mut().insert(InternalErrorDetail(detail));
                response
            }
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(_: AuthError) -> Self {
        GatewayError::Unauthorized
    }
}

impl From<CredentialError> for GatewayError {
    fn from(error: CredentialError) -> Self {
        GatewayError::Internal(error.to_string())
    }
}

impl From<MetricsError> for GatewayError {
    fn from(error: MetricsError) -> Self {
        GatewayError::Internal(error.to_string())
    }
}

impl From<TariffError> for GatewayError {
    fn from(error: TariffError) -> Self {
        match error {
            TariffError::NegativeUnits { .. } => GatewayError::Validation(error.to_string()),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

/// JSON body extractor whose rejections are [`GatewayError::Validation`].
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| GatewayError::Validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::Validation(e.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Cause of a `500`, carried on the response for [`log_internal_errors`].
#[derive(Debug, Clone)]
struct InternalErrorDetail(String);

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    GatewayError::Internal(format!("handler panicked: {detail}")).into_response()
}

/// The part of an internal error's cause that may be logged in `mode`.
fn loggable_detail(mode: GatewayMode, detail: &str) -> Option<&str> {
    (!mode.is_production()).then_some(detail)
}

/// Logs every internal error once. Production logs the route only.
async fn log_internal_errors(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let response = next.run(request).await;
    if let Some(InternalErrorDetail(detail)) = response.extensions().get::<InternalErrorDetail>() {
        match loggable_detail(state.mode, detail) {
            Some(detail) => {
                tracing::error!(%method, %path, error = %detail, "Request failed with an internal error")
            }
            None => tracing::error!(%method, %path, "Request failed with an internal error"),
        }
    }
    response
}

/// Installs panic recovery and internal-error logging around `routes`.
fn with_error_handling(routes: Router<Arc<GatewayState>>, state: Arc<GatewayState>) -> Router {
    routes
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(state.clone(), log_internal_errors))
        .with_state(state)
}

/// The gateway's routes bound to `state`.
pub fn router(state: Arc<GatewayState>) -> Router {
    with_error_handling(routes(), state)
}

pub fn routes() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/v1/jobs/quote", post(post_quote))
        .route("/v1/jobs/lock", post(post_lock))
        .route("/v1/execute", post(post_execute))
        .route("/v1/usage/emit", post(post_usage_emit))
        .route("/v1/oracle/receipt", post(post_oracle_receipt))
        .route("/v1/tariff", get(get_tariff))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    #[serde(default)]
    pub plan: Vec<PlanEntry>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// `POST /v1/jobs/quote`: prices a plan. Stateless.
#[instrument(skip_all)]
pub async fn post_quote(
    State(state): State<Arc<GatewayState>>,
    ValidJson(body): ValidJson<QuoteRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    state.metrics.record_request("quote");
    let quote = state.tariff.quote(&body.plan)?;
    tracing::debug!(
        tenant_id = body.tenant_id.as_deref().unwrap_or("-"),
        estimated_credits = quote.estimated_credits,
        "Quoted plan"
    );
    Ok(Json(quote))
}

#[derive(Debug, Deserialize)]
pub struct LockRequest {
    pub job_id: String,
    #[serde(default, alias = "estimated_credits")]
    pub budget_apic: u64,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct LockResponse {
    pub job_id: String,
    pub locked_budget_apic: u64,
    pub usage_auth_token: String,
    pub expires_at: UnixTimestamp,
}

/// `POST /v1/jobs/lock`: authorizes via `Usage-Auth` or `DPoP`, then mints a credential.
///
/// Authorization runs before the body is parsed, so an unauthenticated caller gets
/// `401` whatever it sent.
#[instrument(skip_all, fields(job_id = tracing::field::Empty))]
pub async fn post_lock(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, GatewayError> {
    state.metrics.record_request("lock");
    let request = AuthRequest {
        method: method.as_str(),
        path: uri.path(),
        usage_auth: header_str(&headers, USAGE_AUTH_HEADER),
        dpop: header_str(&headers, DPOP_HEADER),
    };
    state.auth.authorize(&request).await?;

    let body: LockRequest = parse_body(&body)?;
    if body.job_id.is_empty() {
        return Err(GatewayError::Validation("job_id must not be empty".into()));
    }
    tracing::Span::current().record("job_id", body.job_id.as_str());
    let lock_handle = HeaderValue::from_str(&format!("lock-{}", body.job_id))
        .map_err(|_| GatewayError::Validation("job_id is not a valid header value".into()))?;

    let (token, claims) = state.auth.codec().mint(
        body.job_id,
        body.budget_apic,
        body.endpoints,
        DEFAULT_CREDENTIAL_VALIDITY,
    )?;
    let response = LockResponse {
        job_id: claims.job_id,
        locked_budget_apic: claims.locked_budget_apic,
        usage_auth_token: token,
        expires_at: claims.exp,
    };
    Ok(([(LOCK_HANDLE_HEADER, lock_handle)], Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// `POST /v1/execute`: reports a fixed usage figure.
///
/// The locked budget is not checked against the reported usage.
#[instrument(skip_all)]
pub async fn post_execute(
    State(state): State<Arc<GatewayState>>,
    ValidJson(body): ValidJson<ExecuteRequest>,
) -> impl IntoResponse {
    state.metrics.record_request("execute");
    tracing::debug!(
        endpoint = body.endpoint.as_deref().unwrap_or("-"),
        method = body.method.as_deref().unwrap_or("-"),
        has_body = body.body.is_some(),
        "Execute"
    );
    Json(json!({
        "ok": true,
        "usage": { "units": EXECUTE_USAGE_UNITS, "credits": EXECUTE_USAGE_CREDITS },
    }))
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub ok: bool,
    pub id: String,
    pub durability: Durability,
}

async fn enqueue(state: &GatewayState, kind: ItemKind, payload: Value) -> EnqueueResponse {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let item = QueueItem::new(kind, id, payload);
    let id = item.id.clone();
    let durability = state.queue.push(item).await;
    state.drainer.trigger();
    EnqueueResponse {
        ok: true,
        id,
        durability,
    }
}

/// `POST /v1/usage/emit`: enqueues a usage record.
#[instrument(skip_all)]
pub async fn post_usage_emit(
    State(state): State<Arc<GatewayState>>,
    ValidJson(payload): ValidJson<Value>,
) -> impl IntoResponse {
    state.metrics.record_request("usage_emit");
    Json(enqueue(&state, ItemKind::Usage, payload).await)
}

/// `POST /v1/oracle/receipt`: enqueues an oracle receipt.
#[instrument(skip_all)]
pub async fn post_oracle_receipt(
    State(state): State<Arc<GatewayState>>,
    ValidJson(payload): ValidJson<Value>,
) -> impl IntoResponse {
    state.metrics.record_request("oracle_receipt");
    Json(enqueue(&state, ItemKind::OracleReceipt, payload).await)
}

#[instrument(skip_all)]
pub async fn get_tariff(
    State(state): State<Arc<GatewayState>>,
) -> Result<impl IntoResponse, GatewayError> {
    state.metrics.record_request("tariff");
    Ok(Json(state.tariff.published()?))
}

/// `GET /health`: liveness plus the queue's durability state.
#[instrument(skip_all)]
pub async fn get_health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let depth = state.queue.size().await;
    Json(json!({
        "ok": true,
        "service": "gateway",
        "mode": state.mode,
        "queue": {
            "backend": state.queue.backend_name(),
            "degraded": state.queue.is_degraded(),
            "depth": depth,
        },
    }))
}

#[instrument(skip_all)]
pub async fn get_metrics(
    State(state): State<Arc<GatewayState>>,
) -> Result<impl IntoResponse, GatewayError> {
    let text = state.metrics.encode_text()?;
    Ok((
        [(CONTENT_TYPE, HeaderValue::from_static(state.metrics.content_type()))],
        text,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryReplayCache;
    use crate::settlement::LogSettlement;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use axum::body::Body;
    use axum::http;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use http_body_util::BodyExt;
    use secrecy::SecretString;
    use std::time::Duration;
    use tower::ServiceExt;

    fn codec() -> CredentialCodec {
        CredentialCodec::new(SecretString::from("handler-test-secret"))
    }

    fn state(mode: GatewayMode) -> Arc<GatewayState> {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let queue = Arc::new(DurableQueue::in_memory(metrics.clone()));
        Arc::new(GatewayState::new(
            mode,
            codec(),
            Arc::new(MemoryReplayCache::new()),
            queue,
            Arc::new(LogSettlement),
            Tariff::v1().unwrap(),
            metrics,
        ))
    }

    fn app(state: Arc<GatewayState>) -> Router {
        router(state)
    }

    fn post_json(uri: &str) -> axum::http::request::Builder {
        http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
    }

    fn signed_proof(path: &str, jti: &str) -> String {
        let wallet = PrivateKeySigner::random();
        let iat = UnixTimestamp::now().as_secs();
        let htu = format!("http://localhost:8080{path}");
        let sig = wallet
            .sign_message_sync(format!("POST:{htu}:{iat}").as_bytes())
            .unwrap();
        STANDARD.encode(
            json!({
                "htm": "POST",
                "htu": htu,
                "iat": iat,
                "jti": jti,
                "sig": format!("0x{}", hex::encode(sig.as_bytes())),
                "signer": wallet.address().to_string(),
            })
            .to_string(),
        )
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        post_json(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_quote_rounds_up_to_whole_credit() {
        let app = app(state(GatewayMode::Production));
        let (status, _, body) = send(
            &app,
            json_request(
                "/v1/jobs/quote",
                json!({"plan": [{"est_units": 1000}], "tenant_id": "t-1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["estimated_credits"], 1);
        assert!(body["tariff_hash"].as_str().unwrap().starts_with("0x"));
        assert!(body["expires_ms"].as_u64().unwrap() > crate::timestamp::now_millis());
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let app = app(state(GatewayMode::Production));
        let request = http::Request::builder()
            .method("POST")
            .uri("/v1/jobs/quote")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{\"plan\": ["))
            .unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_lock_with_signed_proof_then_execute() {
        let state = state(GatewayMode::Production);
        let app = app(state.clone());
        let request = post_json("/v1/jobs/lock")
            .header("DPoP", signed_proof("/v1/jobs/lock", "e2e-jti"))
            .body(Body::from(
                json!({"job_id": "job-42", "budget_apic": 500, "endpoints": ["llm.chat.v1"]})
                    .to_string(),
            ))
            .unwrap();
        let (status, headers, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[LOCK_HANDLE_HEADER], "lock-job-42");
        assert_eq!(body["job_id"], "job-42");
        assert_eq!(body["locked_budget_apic"], 500);

        let token = body["usage_auth_token"].as_str().unwrap();
        let claims = codec().verify(token).unwrap();
        assert_eq!(claims.job_id, "job-42");
        assert_eq!(claims.endpoints, vec!["llm.chat.v1".to_string()]);
        assert_eq!(body["expires_at"], claims.exp.as_secs());

        let request = post_json("/v1/execute")
            .header("Usage-Auth", token)
            .body(Body::from(
                json!({"endpoint": "llm.chat.v1", "method": "POST", "body": {}}).to_string(),
            ))
            .unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["usage"]["units"], EXECUTE_USAGE_UNITS);
        assert_eq!(body["usage"]["credits"], EXECUTE_USAGE_CREDITS);
    }

    #[tokio::test]
    async fn test_lock_without_auth_in_production_is_unauthorized() {
        let app = app(state(GatewayMode::Production));
        let (status, headers, body) = send(
            &app,
            json_request("/v1/jobs/lock", json!({"job_id": "job-1", "budget_apic": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"error": "missing or invalid auth"}));
        assert!(headers.get(LOCK_HANDLE_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_lock_with_replayed_proof_is_unauthorized() {
        let app = app(state(GatewayMode::Production));
        let proof = signed_proof("/v1/jobs/lock", "once");
        let lock = |proof: &str| {
            post_json("/v1/jobs/lock")
                .header("DPoP", proof)
                .body(Body::from(json!({"job_id": "job-r"}).to_string()))
                .unwrap()
        };
        let (first, _, _) = send(&app, lock(&proof)).await;
        assert_eq!(first, StatusCode::OK);
        let (second, _, _) = send(&app, lock(&proof)).await;
        assert_eq!(second, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_relock_with_issued_credential() {
        let app = app(state(GatewayMode::Production));
        let (token, _) = codec()
            .mint("job-7", 100, vec![], DEFAULT_CREDENTIAL_VALIDITY)
            .unwrap();
        let request = post_json("/v1/jobs/lock")
            .header("Usage-Auth", token)
            .body(Body::from(
                json!({"job_id": "job-7", "estimated_credits": 3}).to_string(),
            ))
            .unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["locked_budget_apic"], 3);
    }

    #[tokio::test]
    async fn test_authorized_lock_without_job_id_is_bad_request() {
        let app = app(state(GatewayMode::Production));
        let request = post_json("/v1/jobs/lock")
            .header("DPoP", signed_proof("/v1/jobs/lock", "no-job"))
            .body(Body::from(json!({"budget_apic": 1}).to_string()))
            .unwrap();
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_development_accepts_unsigned_proof() {
        let app = app(state(GatewayMode::Development));
        let proof = STANDARD.encode(
            json!({
                "htm": "POST",
                "htu": "http://localhost:8080/v1/jobs/lock",
                "iat": UnixTimestamp::now().as_secs(),
                "jti": "dev-jti",
                "sig": "dev-signature",
                "signer": null,
            })
            .to_string(),
        );
        let request = post_json("/v1/jobs/lock")
            .header("DPoP", proof.clone())
            .body(Body::from(json!({"job_id": "dev-job"}).to_string()))
            .unwrap();
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);

        let production = self::app(state(GatewayMode::Production));
        let request = post_json("/v1/jobs/lock")
            .header("DPoP", proof)
            .body(Body::from(json!({"job_id": "dev-job"}).to_string()))
            .unwrap();
        let (status, _, _) = send(&production, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_usage_emit_assigns_id_and_drains() {
        let state = state(GatewayMode::Development);
        let app = app(state.clone());
        let (status, _, body) = send(
            &app,
            json_request("/v1/usage/emit", json!({"job_id": "job-1", "units": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert!(body["id"].as_str().unwrap().starts_with("rx-"));
        assert_eq!(body["durability"], "best_effort");

        for _ in 0..50 {
            if state.queue().size().await == 0 && !state.drainer().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.queue().size().await, 0);
    }

    #[tokio::test]
    async fn test_oracle_receipt_keeps_supplied_id() {
        let state = state(GatewayMode::Development);
        let app = app(state.clone());
        let (_, _, body) = send(
            &app,
            json_request("/v1/oracle/receipt", json!({"id": "rc-custom", "price": 1})),
        )
        .await;
        assert_eq!(body["id"], "rc-custom");

        let (_, _, body) = send(&app, json_request("/v1/oracle/receipt", json!({"price": 2}))).await;
        assert!(body["id"].as_str().unwrap().starts_with("rc-"));
        state.drainer().shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reports_queue_state() {
        let app = app(state(GatewayMode::Production));
        let request = http::Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["service"], "gateway");
        assert_eq!(body["mode"], "production");
        assert_eq!(body["queue"]["backend"], "memory");
        assert_eq!(body["queue"]["degraded"], false);
    }

    #[tokio::test]
    async fn test_tariff_endpoint_matches_quote_hash() {
        let state = state(GatewayMode::Production);
        let app = app(state.clone());
        let request = http::Request::builder().uri("/v1/tariff").body(Body::empty()).unwrap();
        let (_, _, body) = send(&app, request).await;
        assert_eq!(body["version"], "v1");
        assert_eq!(body["hash"], state.tariff.hash());
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let app = app(state(GatewayMode::Production));
        send(&app, json_request("/v1/jobs/quote", json!({"plan": []}))).await;
        let response = app
            .clone()
            .oneshot(http::Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("gateway_requests_total{route=\"quote\"} 1"));
        assert!(text.contains("queue_depth"));
    }

    async fn panicking() -> StatusCode {
        panic!("settlement ledger exploded")
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        for mode in [GatewayMode::Production, GatewayMode::Development] {
            let app = with_error_handling(
                routes().route("/panic", get(panicking)),
                state(mode),
            );
            let request = http::Request::builder().uri("/panic").body(Body::empty()).unwrap();
            let (status, _, body) = send(&app, request).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, json!({"error": "internal error"}));
        }
    }

    #[test]
    fn test_internal_error_detail_stays_off_the_wire() {
        let response = GatewayError::Internal("redis: broken pipe".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let detail = response.extensions().get::<InternalErrorDetail>().unwrap();
        assert_eq!(detail.0, "redis: broken pipe");
    }

    #[test]
    fn test_internal_error_detail_logged_in_development_only() {
        assert_eq!(loggable_detail(GatewayMode::Production, "stack"), None);
        assert_eq!(loggable_detail(GatewayMode::Development, "stack"), Some("stack"));
    }

    #[tokio::test]
    async fn test_panic_detail_is_recorded_for_logging() {
        let response = panic_response(Box::new("boom"));
        let detail = response.extensions().get::<InternalErrorDetail>().unwrap();
        assert_eq!(detail.0, "handler panicked: boom");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!String::from_utf8_lossy(&bytes).contains("boom"));
    }
}
