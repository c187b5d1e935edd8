//! Pending-request tracking: perceived-latency feedback between sending a
//! message and the bot's reply.
//!
//! Correlation is FIFO by arrival order, not echo matching: the backend does
//! not thread a correlation id through chat replies, so the oldest pending
//! entry is resolved by whichever content frame arrives next. Each entry arms
//! a staleness timer; on expiry the entry is dropped and the caller surfaces
//! a "service busy" notice without touching the connection.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

/// How long a message may wait for a reply before it is reported stale.
pub const STALENESS_TIMEOUT: Duration = Duration::from_secs(120);

struct PendingEntry {
    local_id: i64,
    created_at: Instant,
    timer: JoinHandle<()>,
}

/// Insertion-ordered set of in-flight messages. At most one entry per
/// localId; timers are always aborted before an entry is dropped.
#[derive(Default)]
pub struct PendingTracker {
    entries: VecDeque<PendingEntry>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly sent message. `expiry_tx` receives the localId when
    /// the staleness timer fires.
    pub fn insert(&mut self, local_id: i64, expiry_tx: mpsc::UnboundedSender<i64>) {
        if self.entries.iter().any(|entry| entry.local_id == local_id) {
            return;
        }
        let timer = tokio::spawn(async move {
            sleep(STALENESS_TIMEOUT).await;
            let _ = expiry_tx.send(local_id);
        });
        self.entries.push_back(PendingEntry {
            local_id,
            created_at: Instant::now(),
            timer,
        });
    }

    /// Resolve the oldest pending entry, canceling its timer.
    pub fn resolve_oldest(&mut self) -> Option<i64> {
        let entry = self.entries.pop_front()?;
        entry.timer.abort();
        tracing::debug!(
            target: "skiff::pending",
            local_id = entry.local_id,
            waited_ms = entry.created_at.elapsed().as_millis() as u64,
            "pending entry resolved"
        );
        Some(entry.local_id)
    }

    /// Remove an entry whose timer already fired. Returns false when the
    /// entry was resolved in the meantime (the expiry is then ignored).
    pub fn expire(&mut self, local_id: i64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.local_id != local_id);
        self.entries.len() != before
    }

    /// Drop every entry and timer, unconditionally. Used on connection close.
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            entry.timer.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for PendingTracker {
    fn drop(&mut self) {
        self.clear();
    }
}
