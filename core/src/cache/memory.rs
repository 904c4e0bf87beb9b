//! Process-local cache backend.
//!
//! Implements the full [`CacheStore`](super::CacheStore) surface on top of a
//! concurrent map, with real TTL bookkeeping (lazy expiry on access) and
//! pub/sub via per-channel broadcast senders. Several hub instances inside
//! one process can share a single `MemoryCache`, which is exactly how the
//! cross-instance tests run.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{CacheResult, CacheStore, Subscription};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Sorted(HashMap<String, f64>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Text(_) => "string",
            Value::Hash(_) => "hash",
            Value::Sorted(_) => "zset",
            Value::List(_) => "list",
        }
    }
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

fn wrong_type<T>(key: &str, expected: &str, found: &str) -> CacheResult<T> {
    bail!("key '{key}' holds a {found} value, {expected} operation not applicable")
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to a live (non-expired) entry. Expired entries are
    /// reaped on the way through.
    fn with_live<R>(&self, key: &str, f: impl FnOnce(&Value) -> R) -> Option<R> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(f(&entry.value));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    /// Mutate a live entry, creating it with `make` when absent or expired.
    /// `f` may leave the collection empty; empty collections are removed
    /// afterwards, matching the networked-store behavior.
    fn upsert<R>(
        &self,
        key: &str,
        make: impl Fn() -> Value,
        f: impl FnOnce(&mut Entry) -> CacheResult<R>,
    ) -> CacheResult<R> {
        let result = {
            let mut entry = self
                .entries
                .entry(key.to_owned())
                .or_insert_with(|| Entry::new(make()));
            if entry.is_expired() {
                *entry = Entry::new(make());
            }
            f(&mut entry)?
        };
        self.entries.remove_if(key, |_, entry| {
            matches!(&entry.value, Value::Hash(h) if h.is_empty())
                || matches!(&entry.value, Value::Sorted(s) if s.is_empty())
                || matches!(&entry.value, Value::List(l) if l.is_empty())
        });
        Ok(result)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match self.with_live(key, |value| match value {
            Value::Text(text) => Ok(Some(text.clone())),
            other => wrong_type(key, "string", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut entry = Entry::new(Value::Text(value.to_owned()));
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = Some(Instant::now() + ttl);
                return Ok(true);
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(false)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let keys = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired() && entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.upsert(
            key,
            || Value::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                Value::Hash(hash) => {
                    hash.insert(field.to_owned(), value.to_owned());
                    Ok(())
                }
                other => wrong_type(key, "hash", other.kind()),
            },
        )
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        match self.with_live(key, |value| match value {
            Value::Hash(hash) => Ok(hash.get(field).cloned()),
            other => wrong_type(key, "hash", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        match self.with_live(key, |value| match value {
            Value::Hash(hash) => Ok(hash.clone()),
            other => wrong_type(key, "hash", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(HashMap::new()),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> CacheResult<bool> {
        if self.with_live(key, |_| ()).is_none() {
            return Ok(false);
        }
        self.upsert(
            key,
            || Value::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                Value::Hash(hash) => Ok(hash.remove(field).is_some()),
                other => wrong_type(key, "hash", other.kind()),
            },
        )
    }

    async fn hexists(&self, key: &str, field: &str) -> CacheResult<bool> {
        match self.with_live(key, |value| match value {
            Value::Hash(hash) => Ok(hash.contains_key(field)),
            other => wrong_type(key, "hash", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(false),
        }
    }

    async fn hlen(&self, key: &str) -> CacheResult<usize> {
        match self.with_live(key, |value| match value {
            Value::Hash(hash) => Ok(hash.len()),
            other => wrong_type(key, "hash", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(0),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CacheResult<()> {
        self.upsert(
            key,
            || Value::Sorted(HashMap::new()),
            |entry| match &mut entry.value {
                Value::Sorted(set) => {
                    set.insert(member.to_owned(), score);
                    Ok(())
                }
                other => wrong_type(key, "zset", other.kind()),
            },
        )
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> CacheResult<usize> {
        match self.with_live(key, |value| match value {
            Value::Sorted(set) => Ok(set
                .values()
                .filter(|score| **score >= min && **score <= max)
                .count()),
            other => wrong_type(key, "zset", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(0),
        }
    }

    async fn zcard(&self, key: &str) -> CacheResult<usize> {
        match self.with_live(key, |value| match value {
            Value::Sorted(set) => Ok(set.len()),
            other => wrong_type(key, "zset", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(0),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CacheResult<usize> {
        if self.with_live(key, |_| ()).is_none() {
            return Ok(0);
        }
        self.upsert(
            key,
            || Value::Sorted(HashMap::new()),
            |entry| match &mut entry.value {
                Value::Sorted(set) => {
                    let before = set.len();
                    set.retain(|_, score| *score < min || *score > max);
                    Ok(before - set.len())
                }
                other => wrong_type(key, "zset", other.kind()),
            },
        )
    }

    async fn rpush(&self, key: &str, value: &str) -> CacheResult<usize> {
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => {
                    list.push_back(value.to_owned());
                    Ok(list.len())
                }
                other => wrong_type(key, "list", other.kind()),
            },
        )
    }

    async fn lpush(&self, key: &str, value: &str) -> CacheResult<usize> {
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => {
                    list.push_front(value.to_owned());
                    Ok(list.len())
                }
                other => wrong_type(key, "list", other.kind()),
            },
        )
    }

    async fn lpop(&self, key: &str) -> CacheResult<Option<String>> {
        if self.with_live(key, |_| ()).is_none() {
            return Ok(None);
        }
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => Ok(list.pop_front()),
                other => wrong_type(key, "list", other.kind()),
            },
        )
    }

    async fn llen(&self, key: &str) -> CacheResult<usize> {
        match self.with_live(key, |value| match value {
            Value::List(list) => Ok(list.len()),
            other => wrong_type(key, "list", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(0),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CacheResult<Vec<String>> {
        match self.with_live(key, |value| match value {
            Value::List(list) => {
                let len = list.len() as i64;
                let normalize = |index: i64| -> i64 {
                    if index < 0 {
                        (len + index).max(0)
                    } else {
                        index
                    }
                };
                let start = normalize(start);
                let stop = normalize(stop).min(len - 1);
                if start > stop || len == 0 {
                    return Ok(Vec::new());
                }
                Ok(list
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect())
            }
            other => wrong_type(key, "list", other.kind()),
        }) {
            Some(result) => result,
            None => Ok(Vec::new()),
        }
    }

    async fn lrem(&self, key: &str, value: &str) -> CacheResult<usize> {
        if self.with_live(key, |_| ()).is_none() {
            return Ok(0);
        }
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => {
                    let before = list.len();
                    list.retain(|item| item != value);
                    Ok(before - list.len())
                }
                other => wrong_type(key, "list", other.kind()),
            },
        )
    }

    async fn publish(&self, channel: &str, payload: &str) -> CacheResult<usize> {
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(payload.to_owned()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            // Nobody listening; drop the channel so idle topics do not pile up.
            self.channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<Subscription> {
        let receiver = self
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(Subscription::new(channel.to_owned(), receiver))
    }
}
