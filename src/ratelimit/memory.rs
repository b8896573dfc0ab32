//! In-process TAT store.
//!
//! Evaluations for one key are serialized by the map's entry lock, which
//! gives the same admit/reject outcomes as the Redis script. State is not
//! shared across processes, so this store only suits single-node deployments
//! and tests.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{StoreError, TatStore};
use super::gcra::{evaluate, Evaluation};

#[derive(Debug, Clone, Copy)]
struct Slot {
    tat: u64,
    expires_at: u64,
}

impl Slot {
    fn admitted(tat: u64, ttl: Duration, now_ns: u64) -> Self {
        let ttl_ns = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
        Self {
            tat,
            expires_at: now_ns.saturating_add(ttl_ns),
        }
    }
}

/// A TAT store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored TAT for `key`, ignoring expiry.
    pub fn tat(&self, key: &str) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.tat)
    }

    /// Number of keys currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every key whose expiry is at or before `now_ns`.
    pub fn purge_expired(&self, now_ns: u64) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now_ns);
        let purged = before.saturating_sub(self.slots.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired rate limit keys");
        }
        purged
    }

    fn evaluate_locked(&self, key: &str, burst: u32, period_ns: u64, now_ns: u64) -> i64 {
        // The entry guard holds the shard lock until the evaluation is written.
        let (tat, evaluation) = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().expires_at > now_ns;
                let tat = if live { occupied.get().tat } else { 0 };
                let evaluation = evaluate(tat, burst, period_ns, now_ns);
                match evaluation {
                    Evaluation::Admit { new_tat, ttl } => {
                        occupied.insert(Slot::admitted(new_tat, ttl, now_ns));
                    }
                    Evaluation::Reject { .. } if !live => {
                        occupied.remove();
                    }
                    Evaluation::Reject { .. } => {}
                }
                (tat, evaluation)
            }
            Entry::Vacant(vacant) => {
                let evaluation = evaluate(0, burst, period_ns, now_ns);
                if let Evaluation::Admit { new_tat, ttl } = evaluation {
                    vacant.insert(Slot::admitted(new_tat, ttl, now_ns));
                }
                (0, evaluation)
            }
        };

        trace!(key = %key, tat = tat, outcome = ?evaluation, "Evaluated in-memory GCRA");
        evaluation.to_reply()
    }
}

#[async_trait]
impl TatStore for MemoryStore {
    async fn evaluate(
        &self,
        key: &str,
        burst: u32,
        period_ns: u64,
        now_ns: u64,
    ) -> Result<i64, StoreError> {
        Ok(self.evaluate_locked(key, burst, period_ns, now_ns))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
