//! Cache-store abstraction.
//!
//! Everything the hub shares across instances — presence hashes, content
//! snapshots, queue lists, rate-limit windows, and the fan-out channels —
//! goes through this trait. The contract is deliberately Redis-shaped so a
//! networked backend is a thin client; [`memory::MemoryCache`] is the
//! in-process backend used by the all-in-one deployment and the test suite.
//!
//! Durability is best-effort. Callers on read paths must treat a miss (or a
//! backend error) as a degraded answer, never as a reason to fail the
//! operation outright.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

pub use memory::MemoryCache;

pub type CacheResult<T> = anyhow::Result<T>;

/// Shared handle to whichever cache backend the process was built with.
pub type SharedCache = Arc<dyn CacheStore>;

#[async_trait]
pub trait CacheStore: Send + Sync {
    // Plain keys.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;
    async fn del(&self, key: &str) -> CacheResult<bool>;
    /// Refresh (or set) the TTL on an existing key. Returns false when the
    /// key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;
    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>>;

    // Hashes.
    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()>;
    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>>;
    /// Returns true when the field existed and was removed.
    async fn hdel(&self, key: &str, field: &str) -> CacheResult<bool>;
    async fn hexists(&self, key: &str, field: &str) -> CacheResult<bool>;
    async fn hlen(&self, key: &str) -> CacheResult<usize>;

    // Sorted sets, scored by caller-supplied f64 (epoch milliseconds for
    // every use in this crate).
    async fn zadd(&self, key: &str, score: f64, member: &str) -> CacheResult<()>;
    async fn zcount(&self, key: &str, min: f64, max: f64) -> CacheResult<usize>;
    async fn zcard(&self, key: &str) -> CacheResult<usize>;
    /// Remove members with scores in `[min, max]`; returns how many went.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CacheResult<usize>;

    // Lists.
    async fn rpush(&self, key: &str, value: &str) -> CacheResult<usize>;
    async fn lpush(&self, key: &str, value: &str) -> CacheResult<usize>;
    async fn lpop(&self, key: &str) -> CacheResult<Option<String>>;
    async fn llen(&self, key: &str) -> CacheResult<usize>;
    /// Inclusive range in Redis semantics: negative indices count from the
    /// tail, `stop = -1` means "through the end".
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CacheResult<Vec<String>>;
    /// Remove every occurrence of `value`; returns how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> CacheResult<usize>;

    // Pub/sub.
    async fn publish(&self, channel: &str, payload: &str) -> CacheResult<usize>;
    async fn subscribe(&self, channel: &str) -> CacheResult<Subscription>;
}

/// A live subscription to a named channel.
///
/// Dropping the subscription unsubscribes. Receivers that fall behind lose
/// the overwritten messages (the bus contract is at-least-once for attached,
/// keeping-up subscribers — there is no replay).
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(channel: String, receiver: broadcast::Receiver<String>) -> Self {
        Self { channel, receiver }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload on the channel, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %self.channel,
                        skipped,
                        "subscription lagged; dropped messages"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
