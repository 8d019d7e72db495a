//! Utility types used throughout the gateway.
//!
//! - [`b64`] - Lenient base64 decoding for header-borne tokens
//! - [`sig_down`] - Signal-driven shutdown sequencing
//! - [`telemetry`] - Logging and OpenTelemetry setup

pub mod b64;
pub mod sig_down;
pub mod telemetry;

pub use b64::*;
pub use sig_down::*;
pub use telemetry::*;
