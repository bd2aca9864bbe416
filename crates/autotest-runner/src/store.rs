//! Shared coordination store.
//!
//! Every component that coordinates across worker processes (tester pool,
//! script version pointers, pop telemetry, job queues) goes through the
//! [`SharedStore`] trait. [`RedisStore`] is the production backend;
//! [`MemoryStore`] keeps the same semantics in-process, including the
//! blocking list pop.

use redis::Commands;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to decode stored value for {key}: {message}")]
    Decode { key: String, message: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value, hash and list primitives shared by all workers.
///
/// Hash and list operations are atomic per call. `blpop` blocks the caller
/// until the list has an element; there is no timeout.
pub trait SharedStore: Send + Sync {
    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    /// Set `field` only if it is absent. Returns whether the value was written.
    fn hsetnx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool>;
    fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;
    fn hdel(&self, key: &str, field: &str) -> StoreResult<()>;

    fn rpush(&self, key: &str, value: &str) -> StoreResult<()>;
    fn lpop(&self, key: &str) -> StoreResult<Option<String>>;
    fn blpop(&self, key: &str) -> StoreResult<String>;
    fn llen(&self, key: &str) -> StoreResult<usize>;
    fn lrange(&self, key: &str) -> StoreResult<Vec<String>>;
}

/// Redis backend. Opens a connection per call so a blocked `blpop` on one
/// thread never stalls hash updates on another.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn open(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    fn conn(&self) -> StoreResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl SharedStore for RedisStore {
    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.conn()?.hget(key, field)?)
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.conn()?.hset::<_, _, _, ()>(key, field, value)?;
        Ok(())
    }

    fn hsetnx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        Ok(self.conn()?.hset_nx(key, field, value)?)
    }

    fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        Ok(self.conn()?.hincr(key, field, delta)?)
    }

    fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        self.conn()?.hdel::<_, _, ()>(key, field)?;
        Ok(())
    }

    fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn()?.rpush::<_, _, ()>(key, value)?;
        Ok(())
    }

    fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn()?;
        Ok(redis::cmd("LPOP").arg(key).query(&mut conn)?)
    }

    fn blpop(&self, key: &str) -> StoreResult<String> {
        let mut conn = self.conn()?;
        // A zero timeout blocks until an element arrives.
        let popped: Option<(String, String)> =
            redis::cmd("BLPOP").arg(key).arg(0).query(&mut conn)?;
        popped
            .map(|(_, value)| value)
            .ok_or_else(|| StoreError::Unavailable(format!("BLPOP on {} returned nothing", key)))
    }

    fn llen(&self, key: &str) -> StoreResult<usize> {
        Ok(self.conn()?.llen(key)?)
    }

    fn lrange(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.conn()?.lrange(key, 0, -1)?)
    }
}

#[derive(Default)]
struct MemoryInner {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// In-process store with the same blocking semantics as [`RedisStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    pushed: Condvar,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl SharedStore for MemoryStore {
    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let inner = self.lock()?;
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hsetnx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut inner = self.lock()?;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|e| StoreError::Decode {
                key: format!("{}/{}", key, field),
                message: e.to_string(),
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        drop(inner);
        self.pushed.notify_all();
        Ok(())
    }

    fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    fn blpop(&self, key: &str) -> StoreResult<String> {
        let mut inner = self.lock()?;
        loop {
            if let Some(value) = inner.lists.get_mut(key).and_then(|l| l.pop_front()) {
                return Ok(value);
            }
            inner = self
                .pushed
                .wait(inner)
                .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        }
    }

    fn llen(&self, key: &str) -> StoreResult<usize> {
        let inner = self.lock()?;
        Ok(inner.lists.get(key).map_or(0, |l| l.len()))
    }

    fn lrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn hsetnx_only_writes_missing_fields() {
        let store = MemoryStore::new();
        assert!(store.hsetnx("h", "f", "1").expect("first"));
        assert!(!store.hsetnx("h", "f", "2").expect("second"));
        assert_eq!(store.hget("h", "f").expect("get").as_deref(), Some("1"));
    }

    #[test]
    fn hincrby_starts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.hincrby("h", "n", 1).expect("incr"), 1);
        assert_eq!(store.hincrby("h", "n", 2).expect("incr"), 3);
        store.hdel("h", "n").expect("del");
        assert_eq!(store.hget("h", "n").expect("get"), None);
    }

    #[test]
    fn blpop_waits_for_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = store.clone();
            thread::spawn(move || store.blpop("list").expect("blpop"))
        };
        thread::sleep(Duration::from_millis(50));
        store.rpush("list", "item").expect("push");
        assert_eq!(waiter.join().expect("join"), "item");
        assert_eq!(store.llen("list").expect("len"), 0);
    }

    #[test]
    fn lists_are_fifo() {
        let store = MemoryStore::new();
        store.rpush("l", "a").expect("push");
        store.rpush("l", "b").expect("push");
        assert_eq!(store.lrange("l").expect("range"), vec!["a", "b"]);
        assert_eq!(store.lpop("l").expect("pop").as_deref(), Some("a"));
        assert_eq!(store.lpop("l").expect("pop").as_deref(), Some("b"));
        assert_eq!(store.lpop("l").expect("pop"), None);
    }
}
