//! Set-once-with-TTL store used to reject reused proof nonces (`jti`).
//!
//! The one primitive every backend must provide is an atomic "set if absent, with
//! expiry". Two concurrent verifications of the same nonce race on that primitive and
//! exactly one of them wins.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How long a consumed nonce stays blocked.
pub const REPLAY_TTL: Duration = Duration::from_secs(120);

/// Key prefix for nonce markers in a shared backend.
pub const JTI_KEY_PREFIX: &str = "dpop_jti:";

/// Sweep expired entries every this many inserts into [`MemoryReplayCache`].
const SWEEP_EVERY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ReplayCacheError {
    #[error("replay cache backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

#[async_trait]
pub trait ReplayCache: Send + Sync {
    /// Atomically records `key` for `ttl`.
    ///
    /// Returns `Ok(true)` when the key was absent and is now set, `Ok(false)` when it
    /// was already present (a replay).
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, ReplayCacheError>;
}

/// Shared replay cache backed by Redis `SET NX PX`.
#[derive(Clone)]
pub struct RedisReplayCache {
    connection: ConnectionManager,
}

impl RedisReplayCache {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ReplayCache for RedisReplayCache {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, ReplayCacheError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{JTI_KEY_PREFIX}{key}"))
            .arg("1")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }
}

/// Process-local replay cache.
///
/// Suitable for a single instance or for development. Nonces are not shared across
/// instances, so a proof replayed against a different instance is not caught.
#[derive(Debug, Default)]
pub struct MemoryReplayCache {
    entries: DashMap<String, Instant>,
    inserts: AtomicUsize,
}

impl MemoryReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self, now: Instant) {
        self.entries.retain(|_, deadline| *deadline > now);
    }
}

#[async_trait]
impl ReplayCache for MemoryReplayCache {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, ReplayCacheError> {
        let now = Instant::now();
        let inserted = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    false
                } else {
                    occupied.insert(now + ttl);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                true
            }
        };
        if inserted && self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1
        {
            self.sweep(now);
        }
        Ok(inserted)
    }
}
