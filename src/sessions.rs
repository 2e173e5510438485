//! Per-user keyshare protocol session state
//!
//! Bridges the two-step commitment/response exchange: after a commitments
//! call the server remembers, per username, which public key the response
//! will be produced under and which commitment record to use. Entries are
//! ephemeral by design; losing one only forces the client to restart the
//! protocol.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::idemix::PublicKeyIdentifier;

#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// First public key of the commitments request; the response's `P`
    /// component is produced under it.
    pub key_id: PublicKeyIdentifier,
    /// Commitment record handle inside the core.
    pub commit_id: u64,
    expires_at: Instant,
}

pub struct SessionStore {
    entries: DashMap<String, SessionEntry>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Store session state for a user, replacing any prior entry.
    pub fn add(&self, username: &str, key_id: PublicKeyIdentifier, commit_id: u64) {
        self.entries.insert(
            username.to_string(),
            SessionEntry {
                key_id,
                commit_id,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Current session state for a user; expired entries read as absent.
    pub fn get(&self, username: &str) -> Option<SessionEntry> {
        let entry = self.entries.get(username)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.clone())
    }

    /// Evict expired entries; returns how many were dropped.
    pub fn flush(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Flush expired session entries on a fixed interval until shutdown.
pub fn spawn_flush_task(
    store: Arc<SessionStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = store.flush();
                    if removed > 0 {
                        debug!(removed, "Flushed expired session entries");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Session flush task stopped");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkid(issuer: &str) -> PublicKeyIdentifier {
        PublicKeyIdentifier::new(issuer, 2)
    }

    #[test]
    fn test_add_replaces_prior_entry() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.add("user", pkid("demo.RU"), 1);
        store.add("user", pkid("demo.MO"), 2);

        let entry = store.get("user").unwrap();
        assert_eq!(entry.commit_id, 2);
        assert_eq!(entry.key_id, pkid("demo.MO"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let store = SessionStore::new(Duration::from_millis(10));
        store.add("user", pkid("demo.RU"), 1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(store.get("user").is_none());
    }

    #[test]
    fn test_flush_evicts_expired() {
        let store = SessionStore::new(Duration::from_millis(30));
        store.add("stale", pkid("demo.RU"), 1);
        std::thread::sleep(Duration::from_millis(60));
        store.add("fresh", pkid("demo.MO"), 2);

        assert_eq!(store.flush(), 1);
        assert!(store.get("stale").is_none());
        assert!(store.get("fresh").is_some());
    }
}
