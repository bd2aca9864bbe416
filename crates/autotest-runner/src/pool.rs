//! Sandbox identities borrowed from a shared list.
//!
//! The pool is a list in the shared store holding one JSON blob per
//! [`TesterIdentity`]. Acquiring pops the head (blocking while the list is
//! empty), releasing pushes the identical blob back onto the tail. The list
//! discipline is what makes an identity exclusive across worker processes;
//! nothing in this process locks.

use crate::store::{SharedStore, StoreError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesterIdentity {
    #[serde(default)]
    pub username: Option<String>,
    pub working_dir: PathBuf,
}

#[derive(Clone)]
pub struct TesterPool {
    store: Arc<dyn SharedStore>,
    key: String,
}

impl TesterPool {
    pub fn new(store: Arc<dyn SharedStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Block until an identity is free and take it out of the pool.
    ///
    /// The identity goes back when the returned lease is dropped.
    pub fn acquire(&self) -> Result<TesterLease> {
        let raw = self
            .store
            .blpop(&self.key)
            .with_context(|| format!("acquire tester from {}", self.key))?;
        let identity = match serde_json::from_str::<TesterIdentity>(&raw) {
            Ok(identity) => identity,
            Err(e) => {
                // The blob is out of the list already; put it back before failing.
                if let Err(push_err) = self.store.rpush(&self.key, &raw) {
                    error!(pool = %self.key, error = %push_err, "failed to return undecodable tester entry");
                }
                return Err(StoreError::Decode {
                    key: self.key.clone(),
                    message: e.to_string(),
                }
                .into());
            }
        };
        debug!(
            pool = %self.key,
            tester = identity.username.as_deref().unwrap_or("-"),
            working_dir = %identity.working_dir.display(),
            "tester acquired"
        );
        Ok(TesterLease {
            store: self.store.clone(),
            key: self.key.clone(),
            raw,
            identity,
        })
    }

    /// Add a pre-provisioned identity to the pool.
    pub fn register(&self, identity: &TesterIdentity) -> Result<()> {
        let raw = serde_json::to_string(identity)?;
        self.store.rpush(&self.key, &raw)?;
        Ok(())
    }

    /// Number of identities currently idle in the pool.
    pub fn available(&self) -> Result<usize> {
        Ok(self.store.llen(&self.key)?)
    }

    /// Identities currently idle in the pool, in pop order.
    pub fn list(&self) -> Result<Vec<TesterIdentity>> {
        self.store
            .lrange(&self.key)?
            .iter()
            .map(|raw| {
                serde_json::from_str(raw)
                    .with_context(|| format!("decode tester entry in {}: {}", self.key, raw))
            })
            .collect()
    }
}

/// Exclusive hold on one [`TesterIdentity`]. Dropping the lease returns the
/// identity to the pool on every exit path.
pub struct TesterLease {
    store: Arc<dyn SharedStore>,
    key: String,
    raw: String,
    identity: TesterIdentity,
}

impl TesterLease {
    pub fn username(&self) -> Option<&str> {
        self.identity.username.as_deref()
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.identity.working_dir
    }
}

impl Drop for TesterLease {
    fn drop(&mut self) {
        match self.store.rpush(&self.key, &self.raw) {
            Ok(()) => debug!(
                pool = %self.key,
                tester = self.identity.username.as_deref().unwrap_or("-"),
                "tester released"
            ),
            Err(e) => error!(
                pool = %self.key,
                tester = self.identity.username.as_deref().unwrap_or("-"),
                error = %e,
                "failed to return tester to pool"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::thread;
    use std::time::Duration;

    fn pool_with(n: usize) -> (Arc<MemoryStore>, TesterPool) {
        let store = Arc::new(MemoryStore::new());
        let pool = TesterPool::new(store.clone(), "testers");
        for i in 0..n {
            pool.register(&TesterIdentity {
                username: Some(format!("tester{}", i)),
                working_dir: PathBuf::from(format!("/tmp/tester{}", i)),
            })
            .expect("register");
        }
        (store, pool)
    }

    #[test]
    fn lease_returns_identity_on_drop() {
        let (_store, pool) = pool_with(2);
        {
            let lease = pool.acquire().expect("acquire");
            assert_eq!(lease.username(), Some("tester0"));
            assert_eq!(pool.available().expect("available"), 1);
        }
        assert_eq!(pool.available().expect("available"), 2);
    }

    #[test]
    fn pool_size_is_conserved_when_holders_fail() {
        let (_store, pool) = pool_with(3);
        for round in 0..10 {
            let outcome: Result<()> = (|| {
                let _lease = pool.acquire()?;
                if round % 2 == 0 {
                    anyhow::bail!("simulated staging failure");
                }
                Ok(())
            })();
            assert_eq!(outcome.is_err(), round % 2 == 0);
        }
        let panicking = {
            let pool = pool.clone();
            thread::spawn(move || {
                let _lease = pool.acquire().expect("acquire");
                panic!("simulated crash while holding a tester");
            })
        };
        assert!(panicking.join().is_err());
        assert_eq!(pool.available().expect("available"), 3);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let (_store, pool) = pool_with(1);
        let first = pool.acquire().expect("acquire");
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let lease = pool.acquire().expect("acquire");
                lease.username().map(str::to_string)
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(first);
        assert_eq!(waiter.join().expect("join").as_deref(), Some("tester0"));
        assert_eq!(pool.available().expect("available"), 1);
    }

    #[test]
    fn undecodable_entry_is_put_back() {
        let (store, pool) = pool_with(0);
        store.rpush("testers", "not json").expect("push");
        assert!(pool.acquire().is_err());
        assert_eq!(pool.available().expect("available"), 1);
    }

    #[test]
    fn identity_without_username_runs_as_current_user() {
        let identity: TesterIdentity =
            serde_json::from_str(r#"{"working_dir": "/srv/work"}"#).expect("decode");
        assert_eq!(identity.username, None);
        assert_eq!(identity.working_dir, PathBuf::from("/srv/work"));
    }
}
