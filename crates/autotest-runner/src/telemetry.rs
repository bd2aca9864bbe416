//! Pop cadence per queue during the current burst.
//!
//! A burst starts with the first pop after a queue was last seen empty and
//! ends when cleanup observes it empty again. Only the burst's first pop
//! time, last pop time and pop count are kept.

use crate::store::SharedStore;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct QueueTelemetry {
    store: Arc<dyn SharedStore>,
    hash_key: String,
}

impl QueueTelemetry {
    pub fn new(store: Arc<dyn SharedStore>, hash_key: impl Into<String>) -> Self {
        Self {
            store,
            hash_key: hash_key.into(),
        }
    }

    pub fn record_pop(&self, queue: &str) -> Result<()> {
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        self.record_pop_at(queue, now)
    }

    /// Record a pop at `now`, in seconds since the epoch.
    pub fn record_pop_at(&self, queue: &str, now: f64) -> Result<()> {
        let now = now.to_string();
        self.store
            .hsetnx(&self.hash_key, &field(queue, "start"), &now)?;
        self.store.hset(&self.hash_key, &field(queue, "last"), &now)?;
        let count = self
            .store
            .hincrby(&self.hash_key, &field(queue, "count"), 1)?;
        debug!(queue, count, "queue pop recorded");
        Ok(())
    }

    /// Forget the current burst for `queue`.
    pub fn clear(&self, queue: &str) -> Result<()> {
        for suffix in ["start", "last", "count"] {
            self.store.hdel(&self.hash_key, &field(queue, suffix))?;
        }
        Ok(())
    }

    /// Mean time between pops in the current burst. `None` when no burst is
    /// in progress.
    pub fn average_interval(&self, queue: &str) -> Result<Option<Duration>> {
        let start = self.read_f64(queue, "start")?;
        let last = self.read_f64(queue, "last")?;
        let count = self
            .store
            .hget(&self.hash_key, &field(queue, "count"))?
            .and_then(|raw| raw.parse::<i64>().ok());
        let (Some(start), Some(last), Some(count)) = (start, last, count) else {
            return Ok(None);
        };
        if count < 1 {
            return Ok(None);
        }
        if count == 1 {
            return Ok(Some(Duration::ZERO));
        }
        let secs = ((last - start) / (count - 1) as f64).max(0.0);
        Ok(Some(Duration::from_secs_f64(secs)))
    }

    fn read_f64(&self, queue: &str, suffix: &str) -> Result<Option<f64>> {
        Ok(self
            .store
            .hget(&self.hash_key, &field(queue, suffix))?
            .and_then(|raw| raw.parse::<f64>().ok()))
    }
}

fn field(queue: &str, suffix: &str) -> String {
    format!("{}_{}", queue, suffix)
}
