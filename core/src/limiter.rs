//! Sliding-window rate limiting with temporary blocks.
//!
//! Each `(principal, message type)` pair keeps a sorted set of request
//! timestamps in the cache store; crossing the configured ceiling inside the
//! window puts a blocked-until marker in place for the configured duration.
//! Message types without a configured rule are unlimited.
//!
//! The limiter protects shared infrastructure, not correctness: when the
//! cache store is unreachable it fails open and admits the message.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::epoch_ms;
use crate::ids::PrincipalId;

const WINDOW_KEY_PREFIX: &str = "rate_limit:";
const BLOCK_KEY_PREFIX: &str = "rate_limit_block:";

/// Timestamps older than this are garbage during collection.
const GC_HORIZON: Duration = Duration::from_secs(3600);

fn window_key(principal_id: &PrincipalId, message_type: &str) -> String {
    format!("{WINDOW_KEY_PREFIX}{principal_id}:{message_type}")
}

fn block_key(principal_id: &PrincipalId, message_type: &str) -> String {
    format!("{BLOCK_KEY_PREFIX}{principal_id}:{message_type}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    pub max_messages: u32,
    pub window_ms: u64,
    pub block_ms: u64,
}

impl RateLimitRule {
    pub const fn new(max_messages: u32, window_ms: u64, block_ms: u64) -> Self {
        Self {
            max_messages,
            window_ms,
            block_ms,
        }
    }
}

/// Per-message-type rules. Types absent from the table are unlimited.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    rules: HashMap<String, RateLimitRule>,
}

impl RateLimitConfig {
    pub const DEFAULT_CRDT: RateLimitRule = RateLimitRule::new(50, 1000, 5000);
    pub const DEFAULT_AWARENESS: RateLimitRule = RateLimitRule::new(30, 1000, 3000);

    pub fn new(crdt: RateLimitRule, awareness: RateLimitRule) -> Self {
        let mut rules = HashMap::new();
        rules.insert("crdt-update".to_owned(), crdt);
        rules.insert("awareness-update".to_owned(), awareness);
        Self { rules }
    }

    pub fn with_rule(mut self, message_type: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(message_type.into(), rule);
        self
    }

    pub fn rule(&self, message_type: &str) -> Option<&RateLimitRule> {
        self.rules.get(message_type)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CRDT, Self::DEFAULT_AWARENESS)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub admitted: bool,
    /// Messages left in the current window after this one.
    pub remaining: u32,
    /// Epoch ms at which the current window no longer counts this message.
    pub reset_at: i64,
    /// Set when the principal is (now) blocked.
    pub blocked_until: Option<i64>,
}

impl RateLimitDecision {
    fn admitted(remaining: u32, reset_at: i64) -> Self {
        Self {
            admitted: true,
            remaining,
            reset_at,
            blocked_until: None,
        }
    }

    fn rejected(reset_at: i64, blocked_until: i64) -> Self {
        Self {
            admitted: false,
            remaining: 0,
            reset_at,
            blocked_until: Some(blocked_until),
        }
    }

    fn unlimited(now: i64) -> Self {
        Self {
            admitted: true,
            remaining: u32::MAX,
            reset_at: now,
            blocked_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterGcReport {
    pub buckets_scanned: usize,
    pub buckets_dropped: usize,
    pub timestamps_removed: usize,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: SharedCache,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: SharedCache, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Admit or reject one message *before* it consumes anything else.
    ///
    /// Admission appends the current timestamp to the window; rejection is
    /// side-effect free beyond (re)arming the block marker. Store failures
    /// admit the message.
    pub async fn check_and_admit(
        &self,
        principal_id: &PrincipalId,
        message_type: &str,
    ) -> RateLimitDecision {
        let now = epoch_ms();
        let Some(rule) = self.config.rule(message_type) else {
            return RateLimitDecision::unlimited(now);
        };

        match self.evaluate(principal_id, message_type, *rule, now).await {
            Ok(decision) => decision,
            Err(error) => {
                warn!(
                    principal_id = %principal_id,
                    message_type,
                    %error,
                    "rate limiter store unavailable; admitting"
                );
                RateLimitDecision::admitted(rule.max_messages, now + rule.window_ms as i64)
            }
        }
    }

    async fn evaluate(
        &self,
        principal_id: &PrincipalId,
        message_type: &str,
        rule: RateLimitRule,
        now: i64,
    ) -> Result<RateLimitDecision> {
        let block = block_key(principal_id, message_type);
        if let Some(raw) = self.store.get(&block).await? {
            if let Ok(until) = raw.parse::<i64>() {
                if until > now {
                    return Ok(RateLimitDecision::rejected(until, until));
                }
            }
            self.store.del(&block).await?;
        }

        let window = window_key(principal_id, message_type);
        let window_start = now - rule.window_ms as i64;
        let in_window = self
            .store
            .zcount(&window, window_start as f64, now as f64)
            .await?;

        if in_window >= rule.max_messages as usize {
            let until = now + rule.block_ms as i64;
            self.store
                .set(
                    &block,
                    &until.to_string(),
                    Some(Duration::from_millis(rule.block_ms)),
                )
                .await?;
            debug!(
                principal_id = %principal_id,
                message_type,
                until,
                "rate limit exceeded; principal blocked"
            );
            return Ok(RateLimitDecision::rejected(until, until));
        }

        // Members need only be unique; the score carries the timestamp.
        let member = format!("{now}:{}", Uuid::new_v4().simple());
        self.store.zadd(&window, now as f64, &member).await?;

        let remaining = rule.max_messages - in_window as u32 - 1;
        Ok(RateLimitDecision::admitted(
            remaining,
            now + rule.window_ms as i64,
        ))
    }

    /// Drop timestamps older than an hour and delete emptied buckets.
    /// Intended to run periodically from the gateway process.
    pub async fn collect_garbage(&self) -> Result<LimiterGcReport> {
        let horizon = (epoch_ms() - GC_HORIZON.as_millis() as i64) as f64;
        let mut report = LimiterGcReport::default();

        for key in self.store.keys_with_prefix(WINDOW_KEY_PREFIX).await? {
            report.buckets_scanned += 1;
            report.timestamps_removed += self
                .store
                .zremrangebyscore(&key, f64::MIN, horizon)
                .await?;
            if self.store.zcard(&key).await? == 0 {
                self.store.del(&key).await?;
                report.buckets_dropped += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCache};
    use std::sync::Arc;

    fn limiter_with(rule: RateLimitRule) -> RateLimiter {
        let config = RateLimitConfig::default().with_rule("crdt-update", rule);
        RateLimiter::new(Arc::new(MemoryCache::new()), config)
    }

    #[tokio::test]
    async fn admits_up_to_the_ceiling_then_blocks() {
        let limiter = limiter_with(RateLimitRule::new(3, 1000, 2000));
        let principal = PrincipalId::from("p1");

        for i in 0..3 {
            let decision = limiter.check_and_admit(&principal, "crdt-update").await;
            assert!(decision.admitted, "message {i} should be admitted");
            assert_eq!(decision.remaining, 2 - i);
        }

        let fourth = limiter.check_and_admit(&principal, "crdt-update").await;
        assert!(!fourth.admitted);
        let blocked_until = fourth.blocked_until.expect("block marker");
        assert!(blocked_until > epoch_ms());

        // Still rejected while the block is armed, even though the window
        // itself has room (rejections do not append).
        let fifth = limiter.check_and_admit(&principal, "crdt-update").await;
        assert!(!fifth.admitted);
        assert_eq!(fifth.blocked_until, Some(blocked_until));
    }

    #[tokio::test]
    async fn block_expires_after_configured_duration() {
        let limiter = limiter_with(RateLimitRule::new(1, 50, 60));
        let principal = PrincipalId::from("p1");

        assert!(limiter.check_and_admit(&principal, "crdt-update").await.admitted);
        assert!(!limiter.check_and_admit(&principal, "crdt-update").await.admitted);

        // Wait out both the block and the original window.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.check_and_admit(&principal, "crdt-update").await.admitted);
    }

    #[tokio::test]
    async fn unconfigured_types_are_unlimited() {
        let limiter = limiter_with(RateLimitRule::new(1, 1000, 1000));
        let principal = PrincipalId::from("p1");

        for _ in 0..50 {
            assert!(limiter.check_and_admit(&principal, "join-document").await.admitted);
        }
    }

    #[tokio::test]
    async fn principals_do_not_share_windows() {
        let limiter = limiter_with(RateLimitRule::new(1, 1000, 1000));

        assert!(limiter
            .check_and_admit(&PrincipalId::from("a"), "crdt-update")
            .await
            .admitted);
        assert!(limiter
            .check_and_admit(&PrincipalId::from("b"), "crdt-update")
            .await
            .admitted);
        assert!(!limiter
            .check_and_admit(&PrincipalId::from("a"), "crdt-update")
            .await
            .admitted);
    }

    #[tokio::test]
    async fn garbage_collection_drops_emptied_buckets() {
        let store = Arc::new(MemoryCache::new());
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());
        let principal = PrincipalId::from("p1");

        // Plant an ancient timestamp directly.
        let key = window_key(&principal, "crdt-update");
        let ancient = (epoch_ms() - 2 * GC_HORIZON.as_millis() as i64) as f64;
        store.zadd(&key, ancient, "old").await.unwrap();

        let report = limiter.collect_garbage().await.unwrap();
        assert_eq!(report.buckets_scanned, 1);
        assert_eq!(report.timestamps_removed, 1);
        assert_eq!(report.buckets_dropped, 1);
        assert!(store.keys_with_prefix(WINDOW_KEY_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_timestamps_survive_garbage_collection() {
        let store = Arc::new(MemoryCache::new());
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());
        let principal = PrincipalId::from("p1");

        limiter.check_and_admit(&principal, "crdt-update").await;
        let report = limiter.collect_garbage().await.unwrap();
        assert_eq!(report.timestamps_removed, 0);
        assert_eq!(report.buckets_dropped, 0);
    }
}
