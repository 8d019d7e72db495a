//! Gateway HTTP entrypoint.
//!
//! Endpoints:
//! - `POST /v1/jobs/quote` – Price a plan
//! - `POST /v1/jobs/lock` – Authorize and mint a usage credential
//! - `POST /v1/execute` – Report usage for a paid action
//! - `POST /v1/usage/emit` – Enqueue a usage record
//! - `POST /v1/oracle/receipt` – Enqueue an oracle receipt
//! - `GET /v1/tariff`, `GET /health`, `GET /metrics`
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `GATEWAY_MODE`, `USAGE_AUTH_SECRET`, `REDIS_URL`, `QUEUE_KEY`, `BILLING_URL`
//! - `OTEL_*` variables enable span export

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use metergate::auth::{CredentialCodec, SecurityPolicy};
use metergate::backends::Backends;
use metergate::config::Config;
use metergate::handlers::{self, GatewayState};
use metergate::metrics::GatewayMetrics;
use metergate::settlement::{BillingSettlement, LogSettlement, Settlement};
use metergate::tariff::Tariff;
use metergate::util::{SigDown, Telemetry};

/// Starts the gateway.
///
/// - Loads `.env` variables and configuration.
/// - Logs the effective security policy.
/// - Connects to Redis when `REDIS_URL` is set. Development falls back to process
///   memory when it is unreachable, production refuses to start.
/// - Serves until SIGTERM/SIGINT, then drains the receipt queue one last time.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load().inspect_err(|error| {
        tracing::error!(%error, "Invalid configuration, refusing to start");
    })?;
    let mode = config.mode();
    let policy = SecurityPolicy::from_mode(mode);
    policy.log(mode);

    let codec = CredentialCodec::new(config.usage_auth_secret()?);
    let metrics = Arc::new(GatewayMetrics::new()?);

    let Backends {
        replay_cache,
        queue,
    } = Backends::connect(config.redis_url(), config.queue_key(), &policy, metrics.clone()).await?;

    let settlement: Arc<dyn Settlement> = match config.billing_url() {
        Some(url) => Arc::new(BillingSettlement::try_new(url)?),
        None => Arc::new(LogSettlement),
    };
    tracing::info!(settlement = settlement.name(), "Settlement sink configured");

    let state = Arc::new(GatewayState::new(
        mode,
        codec,
        replay_cache,
        Arc::new(queue),
        settlement,
        Tariff::v1()?,
        metrics,
    ));

    let http_endpoints = Router::new()
        .merge(handlers::router(state.clone()))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!(%mode, "Starting gateway at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let sig_down = SigDown::try_new()?;
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(sig_down.graceful())
        .await?;

    state.drainer().shutdown().await;
    sig_down.recv().await;
    tracing::info!("Gateway stopped");

    Ok(())
}
