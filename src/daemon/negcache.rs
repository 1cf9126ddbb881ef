//! Negative connection cache.
//!
//! Remembers which (domain, controller) pairs recently failed so repeated
//! establish attempts skip them instead of re-burning the connect timeout.
//! Entries decay after a TTL; nothing here is persistent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// Why a candidate was written down as bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    ConnectTimeout,
    AuthRejected,
    ShareUnavailable,
    TransportDied,
}

#[derive(Debug)]
struct Entry {
    reason: FailReason,
    expires_at: Instant,
}

/// TTL map of failed (domain, controller) pairs.
pub struct NegativeConnCache {
    ttl: Duration,
    entries: HashMap<(String, String), Entry>,
}

impl NegativeConnCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, domain: &str, candidate: &str, reason: FailReason) {
        debug!(domain, candidate, ?reason, "negative-caching controller");
        self.entries.insert(
            (domain.to_uppercase(), candidate.to_uppercase()),
            Entry {
                reason,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// The cached failure reason, if the entry has not decayed.
    pub fn get(&self, domain: &str, candidate: &str) -> Option<FailReason> {
        let entry = self
            .entries
            .get(&(domain.to_uppercase(), candidate.to_uppercase()))?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.reason)
    }

    pub fn contains(&self, domain: &str, candidate: &str) -> bool {
        self.get(domain, candidate).is_some()
    }

    /// Forget every entry for a domain. Called when an operator asks for an
    /// immediate reconnect, so decayed knowledge cannot veto it.
    pub fn clear_domain(&mut self, domain: &str) {
        let domain = domain.to_uppercase();
        self.entries.retain(|(d, _), _| *d != domain);
    }

    /// Drop expired entries. Called opportunistically from the state loop.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn insert_with_ttl(&mut self, domain: &str, candidate: &str, reason: FailReason, ttl: Duration) {
        self.entries.insert(
            (domain.to_uppercase(), candidate.to_uppercase()),
            Entry {
                reason,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss() {
        let mut cache = NegativeConnCache::new(Duration::from_secs(120));
        cache.insert("CORP", "dc01", FailReason::AuthRejected);
        assert_eq!(cache.get("corp", "DC01"), Some(FailReason::AuthRejected));
        assert!(cache.get("CORP", "dc02").is_none());
    }

    #[test]
    fn entries_decay() {
        let mut cache = NegativeConnCache::new(Duration::from_secs(120));
        cache.insert_with_ttl("CORP", "dc01", FailReason::ConnectTimeout, Duration::ZERO);
        assert!(cache.get("CORP", "dc01").is_none());
        cache.sweep();
        assert!(!cache.contains("CORP", "dc01"));
    }

    #[test]
    fn clear_domain_is_scoped() {
        let mut cache = NegativeConnCache::new(Duration::from_secs(120));
        cache.insert("CORP", "dc01", FailReason::ConnectTimeout);
        cache.insert("EURO", "dc01", FailReason::ConnectTimeout);
        cache.clear_domain("CORP");
        assert!(!cache.contains("CORP", "dc01"));
        assert!(cache.contains("EURO", "dc01"));
    }
}
