//! Metered-usage gateway.
//!
//! A client asks for a price quote, locks a budget to obtain a short-lived usage
//! credential bound to its identity, executes the paid action, and the gateway later
//! settles the usage and oracle receipts it queued along the way.
//!
//! # Modules
//!
//! - [`auth`] - Usage credentials, proof-of-possession verification, replay protection,
//!   and the [`AuthGate`](auth::AuthGate) that composes them under a
//!   [`SecurityPolicy`](auth::SecurityPolicy).
//! - [`backends`] - Startup choice between Redis and in-process stores.
//! - [`queue`] - The [`DurableQueue`](queue::DurableQueue) of receipts and its
//!   single-flight [`QueueDrainer`](queue::QueueDrainer).
//! - [`settlement`] - What happens to a drained item: logged, or invoiced to billing.
//! - [`tariff`] - Rate table and quote arithmetic.
//! - [`handlers`] - Axum routes and the shared [`GatewayState`](handlers::GatewayState).
//! - [`metrics`] - The [`MetricsRecorder`](metrics::MetricsRecorder) seam and its
//!   Prometheus implementation.
//! - [`config`] - Server configuration from file, environment and defaults.
//! - [`timestamp`] - Unix timestamps with seconds/milliseconds normalization.
//! - [`util`] - Base64 helpers, telemetry setup, and signal handling.

pub mod auth;
pub mod backends;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod queue;
pub mod settlement;
pub mod tariff;
pub mod timestamp;
pub mod util;
