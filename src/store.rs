//! Rendezvous key-value store interface and reference implementations.
//!
//! The process group consumes a user-supplied store for full-mesh
//! rendezvous. Keys and values are arbitrary byte strings. Each transport
//! context rendezvouses through a [`PrefixStore`] so contexts never collide
//! on keys.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CohortError, Result};

/// Default timeout for `get` and `wait` when none is given explicitly.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Key-value store used for transport rendezvous.
pub trait Store: Send + Sync {
    /// Set `key` to `value`, overwriting any previous value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Get the value for `key`, waiting up to the store's default timeout
    /// for it to appear.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Wait until all `keys` exist, using the store's default timeout.
    fn wait(&self, keys: &[String]) -> Result<()> {
        self.wait_timeout(keys, DEFAULT_STORE_TIMEOUT)
    }

    /// Wait until all `keys` exist or `timeout` elapses.
    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()>;
}

/// Store adapter that prefixes every key, giving each transport context a
/// private key namespace within the group's store.
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl Store for PrefixStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.set(&self.full_key(key), value)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(&self.full_key(key))
    }

    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()> {
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.inner.wait_timeout(&full, timeout)
    }
}

/// In-process store backed by a hash map.
///
/// One instance is shared by every rank of a single-process group, playing
/// the role a TCP- or file-backed store plays across processes.
#[derive(Default)]
pub struct HashStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
    cv: Condvar,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wait_for(&self, keys: &[String], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut map = self
            .map
            .lock()
            .map_err(|_| CohortError::LockPoisoned("store map"))?;
        loop {
            if keys.iter().all(|k| map.contains_key(k)) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CohortError::Timeout {
                    what: "store wait",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .cv
                .wait_timeout(map, deadline - now)
                .map_err(|_| CohortError::LockPoisoned("store map"))?;
            map = guard;
        }
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| CohortError::LockPoisoned("store map"))?;
        map.insert(key.to_string(), value);
        self.cv.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.wait_for(std::slice::from_ref(&key.to_string()), DEFAULT_STORE_TIMEOUT)?;
        let map = self
            .map
            .lock()
            .map_err(|_| CohortError::LockPoisoned("store map"))?;
        map.get(key)
            .cloned()
            .ok_or_else(|| CohortError::Store(format!("key {key} disappeared")))
    }

    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()> {
        self.wait_for(keys, timeout)
    }
}
