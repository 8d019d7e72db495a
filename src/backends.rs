//! Startup selection of the replay cache and receipt queue stores.
//!
//! With a Redis URL both stores live in Redis. Without one both live in process memory.
//! When Redis is configured but unreachable, the outcome depends on the
//! [`SecurityPolicy`]: a fail-closed policy refuses to start, because a process-local
//! replay cache cannot see nonces consumed by other instances.

use redis::aio::ConnectionManager;
use std::sync::Arc;
use url::Url;

use crate::auth::{MemoryReplayCache, RedisReplayCache, ReplayCache, SecurityPolicy};
use crate::metrics::MetricsRecorder;
use crate::queue::{DurableQueue, RedisQueueBackend};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Redis is unreachable and the security policy requires a shared replay cache: {0}")]
    SharedReplayUnavailable(#[source] redis::RedisError),
}

pub struct Backends {
    pub replay_cache: Arc<dyn ReplayCache>,
    pub queue: DurableQueue,
}

async fn connect_redis(url: &Url) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url.as_str())?;
    ConnectionManager::new(client).await
}

impl Backends {
    fn in_memory(metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            replay_cache: Arc::new(MemoryReplayCache::new()),
            queue: DurableQueue::in_memory(metrics),
        }
    }

    pub async fn connect(
        redis_url: Option<&Url>,
        queue_key: &str,
        policy: &SecurityPolicy,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, BackendError> {
        let Some(url) = redis_url else {
            tracing::info!("REDIS_URL not set, using in-memory replay cache and queue");
            return Ok(Self::in_memory(metrics));
        };
        match connect_redis(url).await {
            Ok(connection) => {
                tracing::info!(queue_key, "Using Redis for replay cache and queue");
                let backend = RedisQueueBackend::new(connection.clone(), queue_key);
                Ok(Self {
                    replay_cache: Arc::new(RedisReplayCache::new(connection)),
                    queue: DurableQueue::with_backend(Arc::new(backend), metrics),
                })
            }
            Err(error) if !policy.replay_backend_fail_open => {
                tracing::error!(%error, "Redis unreachable, refusing to start with a process-local replay cache");
                Err(BackendError::SharedReplayUnavailable(error))
            }
            Err(error) => {
                tracing::warn!(%error, "Redis unreachable, using in-memory replay cache and queue");
                let backends = Self::in_memory(metrics);
                backends.queue.mark_degraded(&error.to_string());
                Ok(backends)
            }
        }
    }
}
