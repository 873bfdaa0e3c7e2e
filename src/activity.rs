//! In-memory `success_q`/`error_q` logs (§7): "Application handlers surface
//! user-visible failures by appending a descriptive line to the in-memory
//! `error_q`; success messages go to `success_q`."
//!
//! Implemented as a bounded ring buffer with a monotonic id, the same shape as
//! the teacher's activity journal, minus the broadcast fan-out — nothing here
//! has live subscribers, only a queue callers can drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

/// A single queued log line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp_ms: u64,
    pub message: String,
}

/// Bounded ring buffer of log lines. Oldest entries are dropped once `cap`
/// is reached.
pub struct LogQueue {
    entries: RwLock<VecDeque<LogEntry>>,
    next_id: AtomicU64,
    cap: usize,
}

impl LogQueue {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(cap)),
            next_id: AtomicU64::new(1),
            cap,
        }
    }

    pub async fn push(&self, timestamp_ms: u64, message: String) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        if entries.len() >= self.cap {
            entries.pop_front();
        }
        entries.push_back(LogEntry { id, timestamp_ms, message });
        id
    }

    pub async fn drain_since(&self, since_id: u64) -> Vec<LogEntry> {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.id > since_id).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Paired success/error logs shared by the orchestrator, send pipeline, and
/// ack/retry tracker.
pub struct OutcomeLog {
    pub success_q: LogQueue,
    pub error_q: LogQueue,
}

impl OutcomeLog {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self { success_q: LogQueue::new(cap), error_q: LogQueue::new(cap) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_past_capacity() {
        let q = LogQueue::new(2);
        q.push(0, "a".into()).await;
        q.push(0, "b".into()).await;
        q.push(0, "c".into()).await;
        let all = q.drain_since(0).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "b");
        assert_eq!(all[1].message, "c");
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_drain_since_filters() {
        let q = LogQueue::new(10);
        let id1 = q.push(0, "a".into()).await;
        let id2 = q.push(0, "b".into()).await;
        assert!(id2 > id1);
        let since = q.drain_since(id1).await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].message, "b");
    }
}
