//! In-core table of live commitment randomness
//!
//! Every `generate_commitments` call parks its per-key randomness here under
//! a random 64-bit identifier. Records are strictly single-use and expire
//! after a short TTL; a background sweeper evicts leftovers from abandoned
//! sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::watch;
use tracing::debug;

use crate::idemix::PublicKeyIdentifier;

pub(crate) struct CommitmentRecord {
    /// Randomness per requested public key, in request order.
    pub randomizers: Vec<(PublicKeyIdentifier, BigUint)>,
    created: Instant,
}

pub(crate) struct CommitmentTable {
    entries: DashMap<u64, CommitmentRecord>,
    ttl: Duration,
}

impl CommitmentTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Store randomness and return the commitment identifier binding a later
    /// response to it.
    pub fn insert(&self, randomizers: Vec<(PublicKeyIdentifier, BigUint)>) -> u64 {
        let record = CommitmentRecord {
            randomizers,
            created: Instant::now(),
        };
        loop {
            let id = OsRng.next_u64();
            if id == 0 {
                continue;
            }
            match self.entries.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    return id;
                }
            }
        }
    }

    /// Remove and return a record. Expired records are dropped on lookup, so
    /// a late caller sees the same absence as a wrong identifier.
    pub fn take(&self, id: u64) -> Option<CommitmentRecord> {
        let (_, record) = self.entries.remove(&id)?;
        if record.created.elapsed() > self.ttl {
            return None;
        }
        Some(record)
    }

    /// Evict expired records; returns how many were dropped.
    pub fn flush(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, record| record.created.elapsed() <= ttl);
        before - self.entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Sweep expired commitment records until shutdown is signalled.
pub(crate) fn spawn_sweeper(
    table: Arc<CommitmentTable>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = table.flush();
                    if removed > 0 {
                        debug!(removed, "Swept expired commitment records");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Commitment sweeper stopped");
                    return;
                }
            }
        }
    });
}
