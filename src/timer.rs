//! Timer requests and wall-clock access.
//!
//! Managers never sleep. They ask a [`Scheduler`] for a callback and receive
//! it later as a [`TimerFired`] through their `on_timer` handler. Each request
//! returns a [`TimerId`]; a firing whose id no longer matches what the manager
//! has armed is stale and ignored.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Unanswered-ring auto-cancel.
    RingTimeout,
    /// Periodic duration update while a session is active.
    DurationTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub id: TimerId,
    pub kind: TimerKind,
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, kind: TimerKind, after: Duration) -> TimerId;

    /// Cancelling an unknown or already-fired id is a no-op.
    fn cancel(&self, id: TimerId);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Scheduler backed by `tokio::time::sleep` tasks.
pub struct TokioScheduler {
    next_id: AtomicU64,
    tasks: Arc<DashMap<TimerId, JoinHandle<()>>>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl TokioScheduler {
    /// Must be called inside a tokio runtime.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            next_id: AtomicU64::new(1),
            tasks: Arc::new(DashMap::new()),
            fired_tx,
        });
        (scheduler, fired_rx)
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, kind: TimerKind, after: Duration) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tasks = self.tasks.clone();
        let fired_tx = self.fired_tx.clone();

        // Slot stays locked until the handle is stored; a zero delay may fire first.
        if let Entry::Vacant(slot) = self.tasks.entry(id) {
            slot.insert(tokio::spawn(async move {
                tokio::time::sleep(after).await;
                tasks.remove(&id);
                trace!("Timer {:?} ({:?}) fired", id, kind);
                let _ = fired_tx.send(TimerFired { id, kind });
            }));
        }
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some((_, handle)) = self.tasks.remove(&id) {
            handle.abort();
            trace!("Timer {:?} cancelled", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (scheduler, mut fired) = TokioScheduler::new();
        let id = scheduler.schedule(TimerKind::RingTimeout, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(31)).await;
        let event = fired.recv().await.unwrap();

        assert_eq!(event.id, id);
        assert_eq!(event.kind, TimerKind::RingTimeout);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (scheduler, mut fired) = TokioScheduler::new();
        let cancelled = scheduler.schedule(TimerKind::RingTimeout, Duration::from_secs(5));
        let kept = scheduler.schedule(TimerKind::DurationTick, Duration::from_secs(10));
        scheduler.cancel(cancelled);
        scheduler.cancel(cancelled);

        tokio::time::advance(Duration::from_secs(11)).await;
        let event = fired.recv().await.unwrap();
        assert_eq!(event.id, kept);
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_timers_leave_no_handles_behind() {
        let (scheduler, mut fired) = TokioScheduler::new();
        for _ in 0..200 {
            scheduler.schedule(TimerKind::DurationTick, Duration::ZERO);
        }

        for _ in 0..200 {
            fired.recv().await.unwrap();
        }

        assert_eq!(scheduler.pending(), 0);
    }
}
