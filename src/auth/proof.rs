//! Per-request proof-of-possession (DPoP-style) verification.
//!
//! A proof binds an HTTP method, a target URL and an issue time to a caller key.
//! Two wire shapes are accepted:
//!
//! - compact: `base64(header).base64(payload_json).signature`, where the third segment
//!   is used as the signature when the payload carries none;
//! - blob: `base64(payload_json)` with the signature inline.
//!
//! The payload fields are `htm`, `htu`, `iat`, and optionally `jti`, `sig`, `signer`.
//! The signed message is `"{htm}:{htu}:{iat}"` under EIP-191.

use alloy_primitives::Address;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::SecurityPolicy;
use crate::auth::replay::{REPLAY_TTL, ReplayCache};
use crate::auth::signer;
use crate::timestamp::UnixTimestamp;
use crate::util::Base64Bytes;

/// Allowed distance between the proof's `iat` and the verifier clock.
pub const MAX_CLOCK_SKEW_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("malformed proof: {0}")]
    Malformed(String),
    #[error("proof is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("proof iat {iat} outside the allowed skew window (now {now})")]
    ClockSkew { iat: u64, now: u64 },
    #[error("proof method {proof} does not match request method {request}")]
    MethodMismatch { proof: String, request: String },
    #[error("proof target {htu} does not end with request path {path}")]
    UrlMismatch { htu: String, path: String },
    #[error("proof signature invalid: {0}")]
    BadSignature(String),
    #[error("unsigned proof rejected by policy")]
    UnsignedRejected,
    #[error("proof nonce {0} already used")]
    Replay(String),
    #[error("replay cache unavailable: {0}")]
    ReplayCacheUnavailable(String),
}

#[derive(Debug, Clone, Deserialize)]
struct RawProof {
    htm: Option<String>,
    htu: Option<String>,
    iat: Option<u64>,
    jti: Option<String>,
    sig: Option<String>,
    signer: Option<String>,
}

/// Proof fields once the required ones are known to be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofClaims {
    pub htm: String,
    pub htu: String,
    pub iat: u64,
    pub jti: Option<String>,
    pub sig: Option<String>,
    pub signer: Option<String>,
}

impl ProofClaims {
    /// Parses either accepted wire shape.
    pub fn parse(header: &str) -> Result<Self, ProofError> {
        let header = header.trim();
        let segments: Vec<&str> = header.split('.').collect();
        let raw = match segments.as_slice() {
            [_, payload, detached] => {
                let mut raw = decode_payload(payload)?;
                if raw.sig.is_none() && !detached.is_empty() {
                    raw.sig = Some(detached.to_string());
                }
                raw
            }
            [blob] => decode_payload(blob)?,
            _ => {
                return Err(ProofError::Malformed(format!(
                    "expected 1 or 3 segments, got {}",
                    segments.len()
                )));
            }
        };
        Ok(Self {
            htm: raw.htm.filter(|s| !s.is_empty()).ok_or(ProofError::MissingField("htm"))?,
            htu: raw.htu.filter(|s| !s.is_empty()).ok_or(ProofError::MissingField("htu"))?,
            iat: raw.iat.filter(|v| *v > 0).ok_or(ProofError::MissingField("iat"))?,
            jti: raw.jti.filter(|s| !s.is_empty()),
            sig: raw.sig.filter(|s| !s.is_empty()),
            signer: raw.signer.filter(|s| !s.is_empty()),
        })
    }

    pub fn signing_message(&self) -> String {
        format!("{}:{}:{}", self.htm, self.htu, self.iat)
    }
}

fn decode_payload(segment: &str) -> Result<RawProof, ProofError> {
    let bytes = Base64Bytes::from(segment)
        .decode()
        .map_err(|e| ProofError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ProofError::Malformed(e.to_string()))
}

/// A proof that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedProof {
    pub claims: ProofClaims,
    /// `None` when accepted through the unsigned development branch.
    pub signer: Option<Address>,
}

/// Verifies proofs against the actual request and consumes their nonces.
#[derive(Clone)]
pub struct ProofOfPossessionVerifier {
    policy: SecurityPolicy,
    replay_cache: Arc<dyn ReplayCache>,
    replay_ttl: Duration,
}

impl ProofOfPossessionVerifier {
    pub fn new(policy: SecurityPolicy, replay_cache: Arc<dyn ReplayCache>) -> Self {
        Self {
            policy,
            replay_cache,
            replay_ttl: REPLAY_TTL,
        }
    }

    /// Checks `header` against the request's method and path.
    ///
    /// Checks run in order: shape, required fields, clock skew, method/URL binding,
    /// then either signature recovery or the unsigned-policy gate, and finally nonce
    /// consumption. A nonce is only consumed by a proof that passed everything else.
    pub async fn verify(
        &self,
        header: &str,
        request_method: &str,
        request_path: &str,
    ) -> Result<VerifiedProof, ProofError> {
        let claims = ProofClaims::parse(header)?;

        let now = UnixTimestamp::now().as_secs();
        if now.abs_diff(claims.iat) > MAX_CLOCK_SKEW_SECS {
            return Err(ProofError::ClockSkew {
                iat: claims.iat,
                now,
            });
        }

        if !claims.htm.eq_ignore_ascii_case(request_method) {
            return Err(ProofError::MethodMismatch {
                proof: claims.htm.clone(),
                request: request_method.to_string(),
            });
        }
        if !claims.htu.ends_with(request_path) {
            return Err(ProofError::UrlMismatch {
                htu: claims.htu.clone(),
                path: request_path.to_string(),
            });
        }

        let signer = match (&claims.signer, &claims.sig) {
            (Some(signer), Some(sig)) => {
                let expected = signer::parse_address(signer)
                    .map_err(|e| ProofError::BadSignature(e.to_string()))?;
                signer::verify_personal_signature(
                    claims.signing_message().as_bytes(),
                    sig,
                    expected,
                )
                .map_err(|e| ProofError::BadSignature(e.to_string()))?;
                Some(expected)
            }
            _ if self.policy.allow_unsigned_proofs => {
                tracing::debug!("accepting unsigned proof under development policy");
                None
            }
            _ => return Err(ProofError::UnsignedRejected),
        };

        if let Some(jti) = &claims.jti {
            self.consume_nonce(jti).await?;
        }

        Ok(VerifiedProof { claims, signer })
    }

    async fn consume_nonce(&self, jti: &str) -> Result<(), ProofError> {
        match self.replay_cache.set_if_absent(jti, self.replay_ttl).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProofError::Replay(jti.to_string())),
            Err(error) if self.policy.replay_backend_fail_open => {
                tracing::warn!(%error, "replay cache unavailable, accepting nonce under policy");
                Ok(())
            }
            Err(error) => Err(ProofError::ReplayCacheUnavailable(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::replay::{MemoryReplayCache, ReplayCacheError};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use serde_json::{Value, json};

    const LOCK_URL: &str = "http://127.0.0.1:8080/v1/jobs/lock";

    struct FailingReplayCache;

    #[async_trait]
    impl ReplayCache for FailingReplayCache {
        async fn set_if_absent(&self, _: &str, _: Duration) -> Result<bool, ReplayCacheError> {
            Err(ReplayCacheError::Backend(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
    }

    fn verifier(policy: SecurityPolicy) -> ProofOfPossessionVerifier {
        ProofOfPossessionVerifier::new(policy, Arc::new(MemoryReplayCache::new()))
    }

    fn now() -> u64 {
        UnixTimestamp::now().as_secs()
    }

    fn signed_proof(wallet: &PrivateKeySigner, htm: &str, htu: &str, iat: u64, jti: &str) -> Value {
        let message = format!("{htm}:{htu}:{iat}");
        let sig = wallet.sign_message_sync(message.as_bytes()).unwrap();
        json!({
            "htm": htm,
            "htu": htu,
            "iat": iat,
            "jti": jti,
            "sig": format!("0x{}", hex::encode(sig.as_bytes())),
            "signer": wallet.address().to_string(),
        })
    }

    fn blob(value: &Value) -> String {
        STANDARD.encode(value.to_string())
    }

    #[tokio::test]
    async fn test_signed_proof_accepted_then_replay_rejected() {
        let wallet = PrivateKeySigner::random();
        let verifier = verifier(SecurityPolicy::production());
        let header = blob(&signed_proof(&wallet, "POST", LOCK_URL, now(), "jti-1"));

        let verified = verifier.verify(&header, "POST", "/v1/jobs/lock").await.unwrap();
        assert_eq!(verified.signer, Some(wallet.address()));

        let replay = verifier.verify(&header, "POST", "/v1/jobs/lock").await;
        assert!(matches!(replay, Err(ProofError::Replay(_))));
    }

    #[tokio::test]
    async fn test_method_mismatch_rejected_even_when_signed() {
        let wallet = PrivateKeySigner::random();
        let verifier = verifier(SecurityPolicy::production());
        let header = blob(&signed_proof(&wallet, "GET", LOCK_URL, now(), "jti-m"));
        let result = verifier.verify(&header, "POST", "/v1/jobs/lock").await;
        assert!(matches!(result, Err(ProofError::MethodMismatch { .. })));
    }

    #[tokio::test]
    async fn test_method_comparison_is_case_insensitive() {
        let wallet = PrivateKeySigner::random();
        let verifier = verifier(SecurityPolicy::production());
        let header = blob(&signed_proof(&wallet, "post", LOCK_URL, now(), "jti-c"));
        verifier.verify(&header, "POST", "/v1/jobs/lock").await.unwrap();
    }

    #[tokio::test]
    async fn test_url_must_end_with_request_path() {
        let wallet = PrivateKeySigner::random();
        let verifier = verifier(SecurityPolicy::production());
        let header = blob(&signed_proof(&wallet, "POST", LOCK_URL, now(), "jti-u"));
        let result = verifier.verify(&header, "POST", "/v1/execute").await;
        assert!(matches!(result, Err(ProofError::UrlMismatch { .. })));
    }

    #[tokio::test]
    async fn test_clock_skew_rejected() {
        let wallet = PrivateKeySigner::random();
        let verifier = verifier(SecurityPolicy::production());
        let stale = blob(&signed_proof(&wallet, "POST", LOCK_URL, now() - 120, "jti-s"));
        let result = verifier.verify(&stale, "POST", "/v1/jobs/lock").await;
        assert!(matches!(result, Err(ProofError::ClockSkew { .. })));

        let future = blob(&signed_proof(&wallet, "POST", LOCK_URL, now() + 120, "jti-f"));
        let result = verifier.verify(&future, "POST", "/v1/jobs/lock").await;
        assert!(matches!(result, Err(ProofError::ClockSkew { .. })));
    }

    #[tokio::test]
    async fn test_signature_from_other_key_rejected() {
        let wallet = PrivateKeySigner::random();
        let impostor = PrivateKeySigner::random();
        let verifier = verifier(SecurityPolicy::development());
        let mut proof = signed_proof(&impostor, "POST", LOCK_URL, now(), "jti-i");
        proof["signer"] = json!(wallet.address().to_string());
        let result = verifier.verify(&blob(&proof), "POST", "/v1/jobs/lock").await;
        assert!(matches!(result, Err(ProofError::BadSignature(_))));
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let verifier = verifier(SecurityPolicy::development());
        let header = blob(&json!({"htm": "POST", "htu": LOCK_URL}));
        let result = verifier.verify(&header, "POST", "/v1/jobs/lock").await;
        assert!(matches!(result, Err(ProofError::MissingField("iat"))));
    }

    #[tokio::test]
    async fn test_unparseable_rejected() {
        let verifier = verifier(SecurityPolicy::development());
        for header in ["", "a.b", "!!!", "a.b.c.d"] {
            let result = verifier.verify(header, "POST", "/v1/jobs/lock").await;
            assert!(result.is_err(), "{header:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_unsigned_proof_depends_on_policy() {
        let header = blob(&json!({
            "htm": "POST",
            "htu": LOCK_URL,
            "iat": now(),
            "sig": "dev-signature",
            "signer": null,
            "jti": "jti-dev",
        }));

        let production = verifier(SecurityPolicy::production());
        let result = production.verify(&header, "POST", "/v1/jobs/lock").await;
        assert!(matches!(result, Err(ProofError::UnsignedRejected)));

        let development = verifier(SecurityPolicy::development());
        let verified = development.verify(&header, "POST", "/v1/jobs/lock").await.unwrap();
        assert_eq!(verified.signer, None);

        let replay = development.verify(&header, "POST", "/v1/jobs/lock").await;
        assert!(matches!(replay, Err(ProofError::Replay(_))));
    }

    #[tokio::test]
    async fn test_compact_form_with_detached_signature() {
        let wallet = PrivateKeySigner::random();
        let iat = now();
        let message = format!("POST:{LOCK_URL}:{iat}");
        let sig = wallet.sign_message_sync(message.as_bytes()).unwrap();
        let header_segment = URL_SAFE_NO_PAD.encode(r#"{"typ":"dpop+jwt"}"#);
        let payload_segment = URL_SAFE_NO_PAD.encode(
            json!({
                "htm": "POST",
                "htu": LOCK_URL,
                "iat": iat,
                "jti": "jti-compact",
                "signer": wallet.address().to_string(),
            })
            .to_string(),
        );
        let compact = format!(
            "{header_segment}.{payload_segment}.0x{}",
            hex::encode(sig.as_bytes())
        );
        let verifier = verifier(SecurityPolicy::production());
        let verified = verifier.verify(&compact, "POST", "/v1/jobs/lock").await.unwrap();
        assert_eq!(verified.claims.jti.as_deref(), Some("jti-compact"));
    }

    #[tokio::test]
    async fn test_replay_backend_failure_follows_policy() {
        let wallet = PrivateKeySigner::random();
        let header = blob(&signed_proof(&wallet, "POST", LOCK_URL, now(), "jti-b"));

        let closed = ProofOfPossessionVerifier::new(
            SecurityPolicy::production(),
            Arc::new(FailingReplayCache),
        );
        let result = closed.verify(&header, "POST", "/v1/jobs/lock").await;
        assert!(matches!(result, Err(ProofError::ReplayCacheUnavailable(_))));

        let open = ProofOfPossessionVerifier::new(
            SecurityPolicy::development(),
            Arc::new(FailingReplayCache),
        );
        open.verify(&header, "POST", "/v1/jobs/lock").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_proof_does_not_consume_nonce() {
        let wallet = PrivateKeySigner::random();
        let verifier = verifier(SecurityPolicy::production());
        let header = blob(&signed_proof(&wallet, "POST", LOCK_URL, now(), "jti-keep"));
        assert!(verifier.verify(&header, "GET", "/v1/jobs/lock").await.is_err());
        verifier.verify(&header, "POST", "/v1/jobs/lock").await.unwrap();
    }
}
