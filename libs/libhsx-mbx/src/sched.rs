//! Suspend/wake seam between the mailbox engine and the host scheduler
//!
//! A blocking call registers itself as a waiter while the engine lock is
//! still held, then suspends after the lock is released. A wake that lands
//! in between is never lost: the waiter's slot already exists.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::namespace::MailboxId;

/// Event a blocked caller is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitCondition {
    /// Data on a mailbox's primary queue
    Readable(MailboxId),
    /// Data on a fan-out or tap subscriber ring
    Subscriber(MailboxId),
    /// Space for a sender
    Writable(MailboxId),
}

impl WaitCondition {
    pub fn mailbox(self) -> MailboxId {
        match self {
            Self::Readable(id) | Self::Subscriber(id) | Self::Writable(id) => id,
        }
    }

    /// Every condition that can be pending on `mailbox`
    pub fn all(mailbox: MailboxId) -> [Self; 3] {
        [
            Self::Readable(mailbox),
            Self::Subscriber(mailbox),
            Self::Writable(mailbox),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeScope {
    /// Oldest live waiter only
    One,
    All,
}

/// A wake the engine wants delivered once its state change is visible
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wakeup {
    pub condition: WaitCondition,
    pub scope: WakeScope,
}

impl Wakeup {
    pub fn one(condition: WaitCondition) -> Self {
        Self { condition, scope: WakeScope::One }
    }

    pub fn all(condition: WaitCondition) -> Self {
        Self { condition, scope: WakeScope::All }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    Woke,
    TimedOut,
}

/// A registered waiter, not yet suspended
pub struct Parked {
    rx: oneshot::Receiver<()>,
}

impl Parked {
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Suspend until woken or until `deadline` passes
    pub async fn suspend(self, deadline: Option<Instant>) -> WakeReason {
        match deadline {
            // A dropped sender means the queue was torn down; re-check
            None => {
                let _ = self.rx.await;
                WakeReason::Woke
            }
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx).await {
                Ok(_) => WakeReason::Woke,
                Err(_) => WakeReason::TimedOut,
            },
        }
    }
}

impl fmt::Debug for Parked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parked").finish_non_exhaustive()
    }
}

/// Host scheduler primitive used for blocking SEND/RECV
pub trait Scheduler: Send + Sync {
    /// Register the caller as waiting on `condition`
    fn park(&self, condition: WaitCondition) -> Parked;

    /// Release waiters on `condition`, returning how many were woken
    fn wake(&self, condition: WaitCondition, scope: WakeScope) -> usize;
}

/// Default scheduler: FIFO wait queues keyed by condition
///
/// Waiters are released oldest first. Waiters whose call was abandoned
/// (timed out or dropped) are skipped.
#[derive(Default)]
pub struct WaitQueues {
    queues: Mutex<HashMap<WaitCondition, VecDeque<oneshot::Sender<()>>>>,
}

impl WaitQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live waiters on `condition`
    pub fn waiting(&self, condition: WaitCondition) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .get(&condition)
            .map_or(0, |q| q.iter().filter(|tx| !tx.is_closed()).count())
    }
}

impl Scheduler for WaitQueues {
    fn park(&self, condition: WaitCondition) -> Parked {
        let (tx, rx) = oneshot::channel();
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(condition).or_default();
        queue.retain(|tx| !tx.is_closed());
        queue.push_back(tx);
        Parked::new(rx)
    }

    fn wake(&self, condition: WaitCondition, scope: WakeScope) -> usize {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get_mut(&condition) else {
            return 0;
        };

        let mut woken = 0;
        while let Some(tx) = queue.pop_front() {
            if tx.send(()).is_ok() {
                woken += 1;
                if scope == WakeScope::One {
                    break;
                }
            }
        }

        if queue.is_empty() {
            queues.remove(&condition);
        }
        woken
    }
}

impl fmt::Debug for WaitQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("WaitQueues")
            .field("conditions", &queues.len())
            .finish()
    }
}
