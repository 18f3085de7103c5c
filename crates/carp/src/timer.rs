//! Timer scheduling.
//!
//! The engine never sleeps. It arms timers through a [`Scheduler`] and is
//! called back with the [`TimerHandle`] when one expires. A handle carries
//! the coordinator generation and the vhost set epoch it was armed for, so
//! callbacks for destroyed or rebuilt hosts are recognised and ignored.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Stable reference to a coordinator slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinatorKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Per-vhost timer class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Advertisement,
    MasterDownV4,
    MasterDownV6,
}

impl TimerKind {
    pub(crate) fn slot(self) -> usize {
        match self {
            TimerKind::Advertisement => 0,
            TimerKind::MasterDownV4 => 1,
            TimerKind::MasterDownV6 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub coordinator: CoordinatorKey,
    /// Vhost set epoch of the coordinator when armed
    pub epoch: u64,
    pub vhid: u8,
    pub kind: TimerKind,
}

/// A pending timer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub id: TimerId,
    pub(crate) seq: u64,
}

/// Arms and cancels one-shot timers.
///
/// Expired handles must be passed back to the engine's `on_expire`.
pub trait Scheduler: Send {
    fn arm(&mut self, id: TimerId, after: Duration) -> TimerHandle;
    fn cancel(&mut self, handle: &TimerHandle);
}

/// Virtual clock for deterministic tests and simulations
#[derive(Debug, Default)]
pub struct ManualScheduler {
    now: Duration,
    next_seq: u64,
    pending: BTreeMap<(Duration, u64), TimerHandle>,
    deadlines: HashMap<u64, Duration>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time since creation
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove the earliest timer due at or before `until` and move the clock to it.
    pub fn pop_due(&mut self, until: Duration) -> Option<TimerHandle> {
        let (&(deadline, seq), _) = self.pending.iter().next()?;
        if deadline > until {
            return None;
        }
        self.deadlines.remove(&seq);
        let handle = self.pending.remove(&(deadline, seq))?;
        self.now = self.now.max(deadline);
        Some(handle)
    }

    /// Move the clock forward without firing anything
    pub fn set_now(&mut self, now: Duration) {
        self.now = self.now.max(now);
    }
}

impl Scheduler for ManualScheduler {
    fn arm(&mut self, id: TimerId, after: Duration) -> TimerHandle {
        self.next_seq += 1;
        let handle = TimerHandle { id, seq: self.next_seq };
        let deadline = self.now + after;
        self.pending.insert((deadline, handle.seq), handle);
        self.deadlines.insert(handle.seq, deadline);
        handle
    }

    fn cancel(&mut self, handle: &TimerHandle) {
        if let Some(deadline) = self.deadlines.remove(&handle.seq) {
            self.pending.remove(&(deadline, handle.seq));
        }
    }
}

/// Scheduler backed by tokio sleeps.
///
/// Expired handles are delivered on the channel given to [`TokioScheduler::new`].
/// Must be used from within a tokio runtime.
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerHandle>,
    next_seq: u64,
    tasks: HashMap<u64, JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::UnboundedSender<TimerHandle>) -> Self {
        Self {
            tx,
            next_seq: 0,
            tasks: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn arm(&mut self, id: TimerId, after: Duration) -> TimerHandle {
        self.tasks.retain(|_, task| !task.is_finished());

        self.next_seq += 1;
        let handle = TimerHandle { id, seq: self.next_seq };
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if tx.send(handle).is_err() {
                trace!("timer fired after the engine went away");
            }
        });
        self.tasks.insert(handle.seq, task);
        handle
    }

    fn cancel(&mut self, handle: &TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle.seq) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: TimerKind) -> TimerId {
        TimerId {
            coordinator: CoordinatorKey { index: 0, generation: 1 },
            epoch: 1,
            vhid: 1,
            kind,
        }
    }

    #[test]
    fn test_manual_scheduler_orders_by_deadline() {
        let mut sched = ManualScheduler::new();
        let late = sched.arm(id(TimerKind::MasterDownV4), Duration::from_secs(3));
        let early = sched.arm(id(TimerKind::Advertisement), Duration::from_secs(1));
        assert_eq!(sched.pending(), 2);
        assert_eq!(sched.next_deadline(), Some(Duration::from_secs(1)));

        assert_eq!(sched.pop_due(Duration::from_millis(500)), None);
        assert_eq!(sched.pop_due(Duration::from_secs(5)), Some(early));
        assert_eq!(sched.now(), Duration::from_secs(1));
        assert_eq!(sched.pop_due(Duration::from_secs(5)), Some(late));
        assert_eq!(sched.now(), Duration::from_secs(3));
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_manual_scheduler_cancel() {
        let mut sched = ManualScheduler::new();
        let h = sched.arm(id(TimerKind::Advertisement), Duration::from_secs(1));
        sched.cancel(&h);
        sched.cancel(&h);
        assert_eq!(sched.pending(), 0);
        assert_eq!(sched.pop_due(Duration::from_secs(10)), None);
    }

    #[test]
    fn test_handles_are_unique_per_arm() {
        let mut sched = ManualScheduler::new();
        let a = sched.arm(id(TimerKind::Advertisement), Duration::from_secs(1));
        let b = sched.arm(id(TimerKind::Advertisement), Duration::from_secs(1));
        assert_eq!(a.id, b.id);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_fires_and_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sched = TokioScheduler::new(tx);

        let cancelled = sched.arm(id(TimerKind::MasterDownV6), Duration::from_millis(50));
        let fired = sched.arm(id(TimerKind::Advertisement), Duration::from_millis(100));
        sched.cancel(&cancelled);

        let got = rx.recv().await.unwrap();
        assert_eq!(got, fired);
        assert!(rx.try_recv().is_err());
    }
}
