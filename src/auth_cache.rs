//! Authentication result cache
//!
//! Maps an identity fingerprint (hash of the Cookie and Authorization
//! headers) to the last result returned by the auth service. Entries are
//! advisory: an expired or negative entry never blocks a request, it only
//! means the gateway asks the auth service again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;

/// How often expired entries are evicted
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Longest lifetime an entry is given; larger TTLs are clamped
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct AuthEntry {
    valid: bool,
    expires_at: Instant,
}

/// TTL map of fingerprint to last auth result
pub struct AuthCache {
    entries: RwLock<HashMap<String, AuthEntry>>,
    ttl: RwLock<Duration>,
}

impl AuthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: RwLock::new(ttl),
        }
    }

    /// Returns `Some(valid)` for a live entry, `None` when absent or expired
    pub fn get(&self, key: &str) -> Option<bool> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.valid)
    }

    pub fn set(&self, key: impl Into<String>, valid: bool) {
        let ttl = *self.ttl.read();
        self.set_with_ttl(key, valid, ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, valid: bool, ttl: Duration) {
        let Some(expires_at) = Instant::now().checked_add(ttl.min(MAX_TTL)) else {
            debug!("Auth cache TTL {:?} out of range, entry not cached", ttl);
            return;
        };
        self.entries.write().insert(key.into(), AuthEntry { valid, expires_at });
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.read()
    }

    /// Change the lifetime applied to future entries
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write() = ttl;
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Evict expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Spawn the periodic sweep; abort the handle to stop it
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!("Auth cache sweep evicted {} entries", evicted);
                }
            }
        })
    }
}

/// Collision-resistant fingerprint of the identity headers
///
/// A NUL separator is hashed between the parts so ("ab", "c") and
/// ("a", "bc") never collide.
pub fn fingerprint(cookie: &str, authorization: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cookie.as_bytes());
    hasher.update([0u8]);
    hasher.update(authorization.as_bytes());
    hex::encode(hasher.finalize())
}
