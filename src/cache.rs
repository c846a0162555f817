//! TTL-keyed store of last-known verification results.
//!
//! Two TTL classes: a short one for unresolved results so that unknown or
//! failed tracks are retried promptly, and a long one for confirmed matches,
//! since a physical identity does not change mid-session. Expiry is lazy:
//! entries are checked against `now` when they are read.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::clock::Timestamp;
use crate::config::CacheConfig;
use crate::verify::VerificationResult;

#[derive(Debug, Clone)]
enum EntryState {
    Ready(VerificationResult),
    /// A verification call for this key is in flight.
    Pending,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    state: EntryState,
    expires_at: Timestamp,
}

impl CacheEntry {
    #[inline]
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Result of a plain lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(VerificationResult),
    Pending,
    Miss,
}

/// Result of [`VerificationCache::try_claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Unexpired result available; no call needed.
    Hit(VerificationResult),
    /// Someone else is already verifying this key.
    Pending,
    /// The caller now owns the in-flight marker and should verify, or release.
    Claimed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pending: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub stores: u64,
}

pub struct VerificationCache<K> {
    entries: DashMap<K, CacheEntry>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    stores: AtomicU64,
}

impl<K> VerificationCache<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// TTL class for a result.
    pub fn ttl_for(&self, result: &VerificationResult) -> Duration {
        if result.is_confirmed(self.config.min_match_confidence) {
            self.config.long_ttl()
        } else {
            self.config.short_ttl()
        }
    }

    pub fn lookup(&self, key: &K, now: Timestamp) -> Lookup {
        let found = self.entries.get(key).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.state.clone())
            }
        });

        match found {
            Some(Some(EntryState::Ready(result))) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Hit(result.as_cached())
            }
            Some(Some(EntryState::Pending)) => Lookup::Pending,
            Some(None) => {
                if self
                    .entries
                    .remove_if(key, |_, entry| entry.is_expired(now))
                    .is_some()
                {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
        }
    }

    /// Look up `key` and, on a miss, atomically mark it in flight.
    ///
    /// The marker expires after `pending_ttl` so a lost task cannot wedge the key.
    pub fn try_claim(&self, key: &K, now: Timestamp, pending_ttl: Duration) -> Claim {
        let pending = CacheEntry {
            state: EntryState::Pending,
            expires_at: now + pending_ttl,
        };

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut o) => {
                if o.get().is_expired(now) {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    o.insert(pending);
                    return Claim::Claimed;
                }
                match &o.get().state {
                    EntryState::Ready(result) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Claim::Hit(result.as_cached())
                    }
                    EntryState::Pending => Claim::Pending,
                }
            }
            Entry::Vacant(v) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                v.insert(pending);
                Claim::Claimed
            }
        }
    }

    /// Drop an in-flight marker without storing a result.
    pub fn release(&self, key: &K) {
        self.entries
            .remove_if(key, |_, entry| matches!(entry.state, EntryState::Pending));
    }

    pub fn store(&self, key: K, result: VerificationResult, ttl: Duration, now: Timestamp) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            CacheEntry {
                state: EntryState::Ready(result),
                expires_at: now + ttl,
            },
        );
    }

    /// Store with the TTL class picked from the result. Returns the TTL used.
    pub fn store_result(&self, key: K, result: VerificationResult, now: Timestamp) -> Duration {
        let ttl = self.ttl_for(&result);
        self.store(key, result, ttl, now);
        ttl
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let pending = self
            .entries
            .iter()
            .filter(|e| matches!(e.value().state, EntryState::Pending))
            .count();
        CacheStats {
            entries: self.entries.len(),
            pending,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }
}
