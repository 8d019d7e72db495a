use serde::Serialize;

use crate::auth::credential::CredentialFormat;
use crate::config::GatewayMode;

/// Acceptance rules shared by the auth components.
///
/// Derived once from the [`GatewayMode`] at startup and handed to the verifiers at
/// construction. Nothing inside verification reads the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityPolicy {
    /// Accept proofs that carry neither `signer` nor `sig`.
    pub allow_unsigned_proofs: bool,
    /// Credential formats tried, in order, against the `Usage-Auth` header.
    pub credential_formats: Vec<CredentialFormat>,
    /// Accept a nonce when the replay cache cannot be reached.
    pub replay_backend_fail_open: bool,
}

impl SecurityPolicy {
    pub fn production() -> Self {
        Self {
            allow_unsigned_proofs: false,
            credential_formats: vec![CredentialFormat::Hmac, CredentialFormat::WalletSigned],
            replay_backend_fail_open: false,
        }
    }

    pub fn development() -> Self {
        Self {
            allow_unsigned_proofs: true,
            credential_formats: vec![
                CredentialFormat::Hmac,
                CredentialFormat::WalletSigned,
                CredentialFormat::LegacyJson,
            ],
            replay_backend_fail_open: true,
        }
    }

    pub fn from_mode(mode: GatewayMode) -> Self {
        match mode {
            GatewayMode::Production => Self::production(),
            GatewayMode::Development => Self::development(),
        }
    }

    pub fn accepts(&self, format: CredentialFormat) -> bool {
        self.credential_formats.contains(&format)
    }

    /// Emits the effective policy so deployments can audit it from the logs.
    pub fn log(&self, mode: GatewayMode) {
        tracing::info!(
            %mode,
            allow_unsigned_proofs = self.allow_unsigned_proofs,
            credential_formats = ?self.credential_formats,
            replay_backend_fail_open = self.replay_backend_fail_open,
            "Security policy in effect"
        );
        if self.accepts(CredentialFormat::LegacyJson) {
            tracing::warn!("Unsigned legacy credentials are accepted; do not expose this instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_excludes_unsigned_paths() {
        let policy = SecurityPolicy::from_mode(GatewayMode::Production);
        assert!(!policy.allow_unsigned_proofs);
        assert!(!policy.replay_backend_fail_open);
        assert!(!policy.accepts(CredentialFormat::LegacyJson));
        assert_eq!(policy.credential_formats[0], CredentialFormat::Hmac);
    }

    #[test]
    fn test_policy_serializes_for_audit() {
        let json = serde_json::to_value(SecurityPolicy::development()).unwrap();
        assert_eq!(
            json["credential_formats"],
            serde_json::json!(["hmac", "wallet_signed", "legacy_json"])
        );
        assert_eq!(json["allow_unsigned_proofs"], true);
    }
}
