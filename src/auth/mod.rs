//! Authentication and authorization for protected gateway routes.
//!
//! [`AuthGate`] composes the [`CredentialCodec`] and the [`ProofOfPossessionVerifier`]
//! into one accept/reject decision. The usage credential is tried first because it
//! costs no I/O; the proof is the fallback. Accepted credentials are remembered for a
//! few seconds in a process-local [`PositiveCache`].

pub mod credential;
pub mod policy;
pub mod proof;
pub mod replay;
pub mod signer;

pub use credential::{Credential, CredentialCodec, CredentialError, CredentialFormat, UsageClaims};
pub use policy::SecurityPolicy;
pub use proof::{ProofError, ProofOfPossessionVerifier, VerifiedProof};
pub use replay::{MemoryReplayCache, RedisReplayCache, ReplayCache, ReplayCacheError};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::metrics::MetricsRecorder;

pub const POSITIVE_CACHE_TTL: Duration = Duration::from_secs(5);
pub const POSITIVE_CACHE_CAPACITY: usize = 1000;

/// Request attributes the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Raw `Usage-Auth` header.
    pub usage_auth: Option<&'a str>,
    /// Raw `DPoP` header.
    pub dpop: Option<&'a str>,
}

/// How a request got authorized.
#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    Credential(Credential),
    Proof(VerifiedProof),
}

impl Authorization {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Authorization::Credential(credential) => credential.job_id(),
            Authorization::Proof(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no usage credential or proof supplied")]
    Missing,
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Proof(#[from] ProofError),
}

impl AuthError {
    fn outcome(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Credential(_) => "bad_credential",
            AuthError::Proof(ProofError::Replay(_)) => "replay",
            AuthError::Proof(_) => "bad_proof",
        }
    }
}

struct CacheEntry {
    inserted: Instant,
    seq: u64,
    credential: Credential,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Short-lived, bounded memo of accepted credential strings.
///
/// At capacity the oldest-inserted entry is evicted, which approximates LRU without
/// tracking reads.
pub struct PositiveCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl PositiveCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Credential> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = inner
            .entries
            .get(key)
            .map(|entry| entry.inserted.elapsed() < self.ttl)?;
        if fresh {
            inner.entries.get(key).map(|entry| entry.credential.clone())
        } else {
            inner.entries.remove(key);
            None
        }
    }

    pub fn insert(&self, key: &str, credential: Credential) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.entries.contains_key(key) {
            while inner.entries.len() >= self.capacity {
                let Some((oldest, seq)) = inner.order.pop_front() else {
                    break;
                };
                if inner.entries.get(&oldest).is_some_and(|e| e.seq == seq) {
                    inner.entries.remove(&oldest);
                }
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                inserted: Instant::now(),
                seq,
                credential,
            },
        );
        inner.order.push_back((key.to_string(), seq));
        if inner.order.len() > self.capacity * 2 {
            let CacheInner { entries, order, .. } = &mut *inner;
            order.retain(|(k, s)| entries.get(k).is_some_and(|e| e.seq == *s));
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PositiveCache {
    fn default() -> Self {
        Self::new(POSITIVE_CACHE_TTL, POSITIVE_CACHE_CAPACITY)
    }
}

/// Single accept/reject decision for protected routes.
pub struct AuthGate {
    codec: CredentialCodec,
    proofs: ProofOfPossessionVerifier,
    policy: SecurityPolicy,
    cache: PositiveCache,
    metrics: Arc<dyn MetricsRecorder>,
}

impl AuthGate {
    pub fn new(
        codec: CredentialCodec,
        policy: SecurityPolicy,
        replay_cache: Arc<dyn ReplayCache>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let proofs = ProofOfPossessionVerifier::new(policy.clone(), replay_cache);
        Self {
            codec,
            proofs,
            policy,
            cache: PositiveCache::default(),
            metrics,
        }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn codec(&self) -> &CredentialCodec {
        &self.codec
    }

    pub fn cached_credentials(&self) -> usize {
        self.cache.len()
    }

    #[instrument(skip_all, fields(method = request.method, path = request.path))]
    pub async fn authorize(&self, request: &AuthRequest<'_>) -> Result<Authorization, AuthError> {
        let started = Instant::now();
        let result = self.authorize_inner(request).await;
        let outcome = match &result {
            Ok(Authorization::Credential(_)) => "credential",
            Ok(Authorization::Proof(_)) => "proof",
            Err(error) => {
                tracing::debug!(%error, "authorization rejected");
                error.outcome()
            }
        };
        self.metrics.record_auth(outcome, started.elapsed());
        result
    }

    async fn authorize_inner(&self, request: &AuthRequest<'_>) -> Result<Authorization, AuthError> {
        let usage_auth = request.usage_auth.map(str::trim).filter(|s| !s.is_empty());
        let dpop = request.dpop.map(str::trim).filter(|s| !s.is_empty());

        let credential_error = match usage_auth {
            Some(token) => {
                if let Some(credential) = self.cache.get(token) {
                    return Ok(Authorization::Credential(credential));
                }
                match self.codec.decode(token, &self.policy.credential_formats) {
                    Ok(credential) => {
                        if credential.format() == CredentialFormat::LegacyJson {
                            tracing::warn!("accepted unsigned legacy credential");
                        }
                        self.cache.insert(token, credential.clone());
                        return Ok(Authorization::Credential(credential));
                    }
                    Err(error) => Some(error),
                }
            }
            None => None,
        };

        match (dpop, credential_error) {
            (Some(proof), _) => {
                let verified = self.proofs.verify(proof, request.method, request.path).await?;
                Ok(Authorization::Proof(verified))
            }
            (None, Some(error)) => Err(AuthError::Credential(error)),
            (None, None) => Err(AuthError::Missing),
        }
    }
}
