//! Configuration module for the gateway server.

use clap::Parser;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

/// CLI arguments for the gateway server.
#[derive(Parser, Debug)]
#[command(name = "metergate")]
#[command(about = "Metered-usage gateway HTTP server")]
struct CliArgs {
    /// Path to an optional JSON configuration file
    #[arg(long, short, env = "CONFIG")]
    config: Option<PathBuf>,
}

/// Deployment mode. Production tightens the acceptance policy, see
/// [`SecurityPolicy`](crate::auth::SecurityPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    Production,
    Development,
}

impl GatewayMode {
    pub fn is_production(&self) -> bool {
        matches!(self, GatewayMode::Production)
    }
}

impl Display for GatewayMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayMode::Production => write!(f, "production"),
            GatewayMode::Development => write!(f, "development"),
        }
    }
}

impl FromStr for GatewayMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(GatewayMode::Production),
            "development" | "dev" => Ok(GatewayMode::Development),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    /// Resolved from the environment after deserialization when the file omits it.
    #[serde(default)]
    mode: Option<GatewayMode>,
    #[serde(default = "config_defaults::default_usage_auth_secret")]
    usage_auth_secret: Option<SecretString>,
    #[serde(default = "config_defaults::default_redis_url")]
    redis_url: Option<Url>,
    #[serde(default = "config_defaults::default_queue_key")]
    queue_key: String,
    #[serde(default = "config_defaults::default_billing_url")]
    billing_url: Option<Url>,
}

pub mod config_defaults {
    use super::{ConfigError, GatewayMode};
    use secrecy::SecretString;
    use std::env;
    use std::net::{IpAddr, Ipv4Addr};
    use url::Url;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    pub const DEFAULT_QUEUE_KEY: &str = "gateway:queue";

    /// Returns the default port value with fallback: $PORT env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Returns the default host value with fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HOST)
    }

    /// Returns the mode from $GATEWAY_MODE and $NODE_ENV, see [`resolve_mode`].
    pub fn default_mode() -> Result<GatewayMode, ConfigError> {
        resolve_mode(
            env::var("GATEWAY_MODE").ok().as_deref(),
            env::var("NODE_ENV").ok().as_deref(),
        )
    }

    /// A non-empty `gateway_mode` must name a mode. Otherwise production is selected
    /// when `node_env` is `production` in any case, and development in every other case.
    pub fn resolve_mode(
        gateway_mode: Option<&str>,
        node_env: Option<&str>,
    ) -> Result<GatewayMode, ConfigError> {
        if let Some(raw) = gateway_mode.filter(|s| !s.trim().is_empty()) {
            return raw.parse();
        }
        match node_env.map(str::trim) {
            Some(env) if env.eq_ignore_ascii_case("production") => Ok(GatewayMode::Production),
            _ => Ok(GatewayMode::Development),
        }
    }

    pub fn default_usage_auth_secret() -> Option<SecretString> {
        env::var("USAGE_AUTH_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from)
    }

    pub fn default_redis_url() -> Option<Url> {
        env::var("REDIS_URL").ok().and_then(|s| s.parse().ok())
    }

    pub fn default_queue_key() -> String {
        env::var("QUEUE_KEY").unwrap_or_else(|_| DEFAULT_QUEUE_KEY.to_string())
    }

    pub fn default_billing_url() -> Option<Url> {
        env::var("BILLING_URL").ok().and_then(|s| s.parse().ok())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Unknown gateway mode: {0}")]
    InvalidMode(String),
    #[error("USAGE_AUTH_SECRET must be set in production mode")]
    MissingSecret,
}

/// Secret used when development mode runs without `USAGE_AUTH_SECRET`.
const DEV_FALLBACK_SECRET: &str = "metergate-dev-secret";

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn mode(&self) -> GatewayMode {
        self.mode.unwrap_or(GatewayMode::Production)
    }

    /// Durable backend address. `None` selects the in-memory queue and replay cache.
    pub fn redis_url(&self) -> Option<&Url> {
        self.redis_url.as_ref()
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn billing_url(&self) -> Option<&Url> {
        self.billing_url.as_ref()
    }

    /// The shared signing secret for usage credentials.
    ///
    /// Production refuses to start without one. Development substitutes a fixed
    /// placeholder so local flows work out of the box.
    pub fn usage_auth_secret(&self) -> Result<SecretString, ConfigError> {
        match (&self.usage_auth_secret, self.mode()) {
            (Some(secret), _) => Ok(secret.clone()),
            (None, GatewayMode::Production) => Err(ConfigError::MissingSecret),
            (None, GatewayMode::Development) => {
                tracing::warn!("USAGE_AUTH_SECRET not set, using the development placeholder");
                Ok(SecretString::from(DEV_FALLBACK_SECRET))
            }
        }
    }

    /// Load configuration from CLI arguments and an optional JSON file.
    ///
    /// Values not present in the config file (or all values, when no file is given)
    /// are resolved via environment variables or defaults during deserialization.
    /// An unrecognised mode is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        match cli_args.config {
            Some(path) => {
                let config_path = Path::new(&path)
                    .canonicalize()
                    .map_err(|e| ConfigError::FileRead(path, e))?;
                Self::load_from_path(config_path)
            }
            None => Self::from_json("{}"),
        }
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(content)?;
        if config.mode.is_none() {
            config.mode = Some(config_defaults::default_mode()?);
        }
        Ok(config)
    }
}
