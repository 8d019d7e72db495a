//! FIFO store for usage and oracle-receipt items awaiting settlement.
//!
//! [`DurableQueue`] writes through a [`QueueBackend`] when one is configured and falls
//! back to an in-process buffer whenever the backend is absent or failing. Every
//! `push` reports which of the two took the item, so durability is observable rather
//! than implied. Items that land in the buffer are lost on restart.

pub mod drainer;

pub use drainer::{DrainOutcome, QueueDrainer};

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::metrics::MetricsRecorder;
use crate::timestamp::now_millis;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Usage,
    OracleReceipt,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Usage => "usage",
            ItemKind::OracleReceipt => "oracle_receipt",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            ItemKind::Usage => "rx-",
            ItemKind::OracleReceipt => "rc-",
        }
    }

    /// Generates an identifier such as `rx-k3f9a0z`.
    pub fn generate_id(&self) -> String {
        let mut rng = rand::rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
            .collect();
        format!("{}{suffix}", self.id_prefix())
    }
}

/// A pending receipt or usage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub kind: ItemKind,
    /// Unix milliseconds at enqueue.
    pub enqueued_at: u64,
    pub payload: Value,
}

impl QueueItem {
    /// Wraps `payload`, generating an id when `id` is absent or empty.
    pub fn new(kind: ItemKind, id: Option<String>, payload: Value) -> Self {
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| kind.generate_id());
        Self {
            id,
            kind,
            enqueued_at: now_millis(),
            payload,
        }
    }

    /// Time elapsed since enqueue.
    pub fn lag(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.enqueued_at))
    }
}

/// Where an accepted item ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Written to the shared backend.
    Durable,
    /// Held in process memory only.
    BestEffort,
}

impl Durability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Durability::Durable => "durable",
            Durability::BestEffort => "best_effort",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueBackendError {
    #[error("queue backend error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
}

/// Atomic list operations on encoded items.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn push(&self, encoded: String) -> Result<(), QueueBackendError>;
    async fn pop(&self) -> Result<Option<String>, QueueBackendError>;
    async fn len(&self) -> Result<usize, QueueBackendError>;
}

/// Redis list (`RPUSH`/`LPOP`/`LLEN`) under a single key.
#[derive(Clone)]
pub struct RedisQueueBackend {
    connection: ConnectionManager,
    key: String,
}

impl RedisQueueBackend {
    pub fn new(connection: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            connection,
            key: key.into(),
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, encoded: String) -> Result<(), QueueBackendError> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(encoded)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, QueueBackendError> {
        let mut connection = self.connection.clone();
        let item: Option<String> = redis::cmd("LPOP")
            .arg(&self.key)
            .query_async(&mut connection)
            .await?;
        Ok(item)
    }

    async fn len(&self) -> Result<usize, QueueBackendError> {
        let mut connection = self.connection.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut connection)
            .await?;
        Ok(len)
    }
}

/// Queue with a pluggable durable backend and an in-process fallback buffer.
pub struct DurableQueue {
    backend: Option<Arc<dyn QueueBackend>>,
    buffer: Mutex<VecDeque<QueueItem>>,
    degraded: AtomicBool,
    metrics: Arc<dyn MetricsRecorder>,
}

impl DurableQueue {
    /// In-process queue with no durable backend.
    pub fn in_memory(metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            backend: None,
            buffer: Mutex::new(VecDeque::new()),
            degraded: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn with_backend(backend: Arc<dyn QueueBackend>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::in_memory(metrics)
        }
    }

    /// `"memory"` when no backend is configured.
    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map_or("memory", |b| b.name())
    }

    /// True while the configured backend is failing and items go to the buffer.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Marks the backend as failing from the start, e.g. when it could not be reached
    /// at startup.
    pub fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(reason, "Queue backend degraded, buffering in memory");
            self.metrics.set_backend_degraded(true);
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("Queue backend recovered");
            self.metrics.set_backend_degraded(false);
        }
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<QueueItem>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn push(&self, item: QueueItem) -> Durability {
        let durability = match &self.backend {
            Some(backend) => match serde_json::to_string(&item) {
                Ok(encoded) => match backend.push(encoded).await {
                    Ok(()) => {
                        self.mark_healthy();
                        Durability::Durable
                    }
                    Err(error) => {
                        self.mark_degraded(&error.to_string());
                        self.buffer().push_back(item);
                        Durability::BestEffort
                    }
                },
                Err(error) => {
                    tracing::warn!(%error, id = %item.id, "Failed to encode queue item");
                    self.buffer().push_back(item);
                    Durability::BestEffort
                }
            },
            None => {
                self.buffer().push_back(item);
                Durability::BestEffort
            }
        };
        self.metrics.record_enqueue(durability.as_str());
        durability
    }

    /// Pops the oldest item, preferring the backend over the buffer.
    pub async fn pop(&self) -> Option<QueueItem> {
        if let Some(backend) = &self.backend {
            loop {
                match backend.pop().await {
                    Ok(Some(encoded)) => {
                        self.mark_healthy();
                        match serde_json::from_str::<QueueItem>(&encoded) {
                            Ok(item) => return Some(item),
                            Err(error) => {
                                tracing::warn!(%error, "Skipping undecodable queue item");
                                continue;
                            }
                        }
                    }
                    Ok(None) => {
                        self.mark_healthy();
                        break;
                    }
                    Err(error) => {
                        self.mark_degraded(&error.to_string());
                        break;
                    }
                }
            }
        }
        self.buffer().pop_front()
    }

    /// Backend length (when reachable) plus buffered items.
    pub async fn size(&self) -> usize {
        let backend_len = match &self.backend {
            Some(backend) => match backend.len().await {
                Ok(len) => len,
                Err(error) => {
                    self.mark_degraded(&error.to_string());
                    0
                }
            },
            None => 0,
        };
        backend_len + self.buffer().len()
    }
}
