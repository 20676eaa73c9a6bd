//! Deadline watch timers for outstanding offers.
//!
//! Every sent or discovered offer gets a single-shot timer that nudges
//! the resolution loop even if the platform never produces another
//! state-change event. Timers are plain spawned sleeps held by handle so
//! an offer that resolves early can cancel its timer instead of leaking a
//! stale callback. Firing is a notification, never an invocation: the
//! timer pushes the offer id onto the engine's check channel and the
//! worker decides whether the offer is still worth looking at.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use swap_common::OfferId;

pub struct WatchTimers {
    tx: mpsc::UnboundedSender<OfferId>,
    timers: DashMap<OfferId, JoinHandle<()>>,
}

impl WatchTimers {
    pub fn new(tx: mpsc::UnboundedSender<OfferId>) -> Self {
        Self {
            tx,
            timers: DashMap::new(),
        }
    }

    /// Arm (or re-arm) the single-shot deadline for an offer.
    pub fn schedule(&self, id: OfferId, delay: Duration) {
        let tx = self.tx.clone();
        let notify_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(notify_id);
        });
        if let Some(previous) = self.timers.insert(id, handle) {
            previous.abort();
        }
    }

    /// Drop the timer for a resolved offer.
    pub fn cancel(&self, id: &OfferId) {
        if let Some((_, handle)) = self.timers.remove(id) {
            handle.abort();
        }
    }

    pub fn armed(&self, id: &OfferId) -> bool {
        self.timers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Abort every pending timer (worker shutdown).
    pub fn shutdown(&self) {
        self.timers.retain(|_, handle| {
            handle.abort();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> OfferId {
        OfferId::from(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_only_after_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = WatchTimers::new(tx);

        timers.schedule(id("1"), Duration::from_secs(330));
        tokio::task::yield_now().await;

        // Scheduling must not invoke the check immediately, nor anywhere
        // short of the deadline.
        tokio::time::advance(Duration::from_secs(329)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(id("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = WatchTimers::new(tx);

        timers.schedule(id("1"), Duration::from_secs(10));
        tokio::task::yield_now().await;
        timers.cancel(&id("1"));
        assert!(!timers.armed(&id("1")));

        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = WatchTimers::new(tx);

        timers.schedule(id("1"), Duration::from_secs(10));
        tokio::task::yield_now().await;
        timers.schedule(id("1"), Duration::from_secs(100));
        tokio::task::yield_now().await;
        assert_eq!(timers.len(), 1);

        // The original deadline passes silently.
        tokio::time::advance(Duration::from_secs(50)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(rx.recv().await, Some(id("1")));
    }
}
