//! The pending/retry data model shared by the send pipeline (C6) and the
//! ack/retry tracker (C7) (§3 "Pending record", §4.7).
//!
//! Invariants enforced here: an Id is in `pending` iff a `SEND OK` has been
//! observed for it and no reply has arrived yet; `retries_used <=
//! MAX_RETRIES`; `|pending| <= WINDOW_SIZE`. Presence in `pending` and
//! presence in `retries_used` are treated as disjoint signals (§9): the
//! former means "awaiting reply", the latter "has failed at least once".

use std::collections::HashMap;

/// Per in-flight Id bookkeeping (§3 "Pending record").
#[derive(Debug, Clone, Copy)]
pub struct PendingRecord {
    pub send_ts_ms: u64,
    pub retries_used: u32,
}

/// The bounded window of in-flight sends plus the retry counters, guarded
/// by a single owner (the ack/retry tracker task) per §5.
pub struct PendingSet {
    window_size: usize,
    pending: HashMap<i64, PendingRecord>,
    retries_used: HashMap<i64, u32>,
}

impl PendingSet {
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self { window_size, pending: HashMap::new(), retries_used: HashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.window_size
    }

    /// Record a successful `SEND OK` for `id` (§4.6 step 8).
    pub fn mark_sent(&mut self, id: i64, send_ts_ms: u64) {
        let retries_used = self.retries_used.get(&id).copied().unwrap_or(0);
        self.pending.insert(id, PendingRecord { send_ts_ms, retries_used });
    }

    /// A reply arrived for `id`: remove it from `pending` and clear its
    /// retry count (happy path, §4.7).
    pub fn acknowledge(&mut self, id: i64) {
        if self.pending.remove(&id).is_some() {
            self.retries_used.remove(&id);
        }
    }

    /// Sweep for Ids whose ack deadline has passed. Returns `(id,
    /// retries_used)` for each: the caller bumps `retries_used` and either
    /// re-enqueues (if `retries_used <= max_retries`) or abandons.
    pub fn sweep_expired(&mut self, now_ms: u64, ack_timeout_ms: u64) -> Vec<(i64, u32)> {
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, rec)| now_ms.saturating_sub(rec.send_ts_ms) > ack_timeout_ms)
            .map(|(&id, _)| id)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            self.pending.remove(&id);
            let retries = self.retries_used.entry(id).or_insert(0);
            *retries += 1;
            out.push((id, *retries));
        }
        out
    }

    /// Drop all bookkeeping for `id` after retries are exhausted.
    pub fn abandon(&mut self, id: i64) {
        self.pending.remove(&id);
        self.retries_used.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_sent_then_acknowledge_clears_both_maps() {
        let mut set = PendingSet::new(4);
        set.mark_sent(1, 100);
        assert_eq!(set.len(), 1);
        set.acknowledge(1);
        assert_eq!(set.len(), 0);
        assert!(!set.retries_used.contains_key(&1));
    }

    #[test]
    fn window_is_full_at_capacity() {
        let mut set = PendingSet::new(2);
        set.mark_sent(1, 0);
        set.mark_sent(2, 0);
        assert!(set.is_full());
    }

    #[test]
    fn sweep_expired_increments_retry_count_and_clears_pending() {
        let mut set = PendingSet::new(4);
        set.mark_sent(7, 0);
        let expired = set.sweep_expired(10_000, 5_000);
        assert_eq!(expired, vec![(7, 1)]);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn sweep_before_deadline_is_a_no_op() {
        let mut set = PendingSet::new(4);
        set.mark_sent(7, 9_000);
        let expired = set.sweep_expired(10_000, 5_000);
        assert!(expired.is_empty());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn s5_retry_bound_abandons_after_max_retries() {
        let mut set = PendingSet::new(4);
        set.mark_sent(7, 0);
        let max_retries = 2;
        let mut last = set.sweep_expired(10_000, 5_000);
        for _ in 0..max_retries {
            let (id, retries) = last[0];
            assert_eq!(id, 7);
            set.mark_sent(7, 10_000); // re-sent
            last = set.sweep_expired(20_000, 5_000);
            if retries > max_retries {
                set.abandon(7);
                break;
            }
        }
        assert_eq!(set.len(), 0);
    }
}
