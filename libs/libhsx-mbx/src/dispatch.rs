//! Blocking and timeout policy over the non-blocking core
//!
//! Every call takes the single engine lock for the duration of one attempt.
//! A call that cannot proceed registers with the [`Scheduler`] before the
//! lock is released and suspends afterwards; on wake it retries from the
//! top. Deadlines are measured from call entry.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::abi::Timeout;
use crate::config::MailboxConfig;
use crate::error::{MailboxError, Result};
use crate::event::{BlockingOp, EventBus, MailboxEvent};
use crate::manager::{MailboxManager, MailboxSnapshot, PeekInfo, StdioHandles};
use crate::message::Received;
use crate::sched::{Scheduler, WaitCondition, WaitQueues, WakeReason};
use crate::{HandleId, Pid};

/// Shared entry point to one mailbox engine instance
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<Mutex<MailboxManager>>,
    scheduler: Arc<dyn Scheduler>,
    events: EventBus,
}

impl Dispatcher {
    /// Engine backed by the built-in FIFO wait queues
    pub fn new(config: MailboxConfig) -> Self {
        Self::with_scheduler(config, Arc::new(WaitQueues::new()))
    }

    /// Engine that parks callers through a host-provided scheduler
    pub fn with_scheduler(config: MailboxConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let manager = MailboxManager::new(config);
        let events = manager.events().clone();
        Self {
            manager: Arc::new(Mutex::new(manager)),
            scheduler,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    pub async fn open(&self, pid: Pid, name: &str, mode: u16) -> Result<HandleId> {
        self.with_manager(|m| m.open(pid, name, mode)).await
    }

    pub async fn bind(&self, pid: Pid, name: &str, capacity: u16, mode: u16) -> Result<HandleId> {
        self.with_manager(|m| m.bind(pid, name, capacity, mode)).await
    }

    /// SEND, blocking while the mailbox (or a blocking fan-out subscriber) is full
    pub async fn send(
        &self,
        pid: Pid,
        handle: HandleId,
        payload: &[u8],
        flags: u16,
        channel: u16,
        timeout: Timeout,
    ) -> Result<usize> {
        self.blocking(
            pid,
            BlockingOp::Send,
            timeout,
            |m| m.try_send(pid, handle, payload, flags, channel),
            |m| m.send_condition(pid, handle),
        )
        .await
    }

    /// RECV, blocking while the handle's view is empty
    pub async fn recv(
        &self,
        pid: Pid,
        handle: HandleId,
        max_len: usize,
        timeout: Timeout,
    ) -> Result<Received> {
        self.blocking(
            pid,
            BlockingOp::Recv,
            timeout,
            |m| m.try_recv(pid, handle, max_len),
            |m| m.recv_condition(pid, handle),
        )
        .await
    }

    pub async fn peek(&self, pid: Pid, handle: HandleId) -> Result<PeekInfo> {
        self.with_manager(|m| m.peek(pid, handle)).await
    }

    pub async fn tap(&self, pid: Pid, handle: HandleId, enable: bool) -> Result<()> {
        self.with_manager(|m| m.tap(pid, handle, enable)).await
    }

    pub async fn close(&self, pid: Pid, handle: HandleId) -> Result<()> {
        self.with_manager(|m| m.close(pid, handle)).await
    }

    pub async fn register_task(&self, pid: Pid) -> Result<StdioHandles> {
        self.with_manager(|m| m.register_task(pid)).await
    }

    pub async fn reap_task(&self, pid: Pid) -> Result<usize> {
        self.with_manager(|m| m.reap_task(pid)).await
    }

    pub async fn snapshot(&self) -> Vec<MailboxSnapshot> {
        self.manager.lock().await.snapshot()
    }

    pub async fn is_halted(&self) -> bool {
        self.manager.lock().await.is_halted()
    }

    /// Clear a halted engine; blocked callers are released and re-check
    pub async fn reset(&self) {
        let mut manager = self.manager.lock().await;
        manager.reset();
        self.flush(&mut manager);
    }

    async fn with_manager<T>(&self, op: impl FnOnce(&mut MailboxManager) -> Result<T>) -> Result<T> {
        let mut manager = self.manager.lock().await;
        let result = op(&mut *manager);
        self.flush(&mut manager);
        result
    }

    /// Deliver wakes queued by the last operation, still under the lock
    fn flush(&self, manager: &mut MailboxManager) {
        for wakeup in manager.drain_wakeups() {
            self.scheduler.wake(wakeup.condition, wakeup.scope);
        }
    }

    async fn blocking<T>(
        &self,
        pid: Pid,
        op: BlockingOp,
        timeout: Timeout,
        mut attempt: impl FnMut(&mut MailboxManager) -> Result<T>,
        wait_on: impl Fn(&mut MailboxManager) -> Result<WaitCondition>,
    ) -> Result<T> {
        let deadline = timeout.duration().map(|d| Instant::now() + d);
        let unavailable = match op {
            BlockingOp::Send => MailboxError::WouldBlock,
            BlockingOp::Recv => MailboxError::NoData,
        };

        loop {
            let (parked, condition) = {
                let mut manager = self.manager.lock().await;
                let result = attempt(&mut *manager);
                let must_wait = matches!(&result, Err(err) if *err == unavailable);
                if !must_wait || timeout.is_poll() {
                    self.flush(&mut manager);
                    return result;
                }

                let condition = match wait_on(&mut *manager) {
                    Ok(condition) => condition,
                    Err(err) => {
                        self.flush(&mut manager);
                        return Err(err);
                    }
                };
                (self.scheduler.park(condition), condition)
            };

            let mailbox = condition.mailbox();
            debug!("pid {} waiting on {:?} ({:?})", pid, condition, op);
            self.events.emit(MailboxEvent::Wait { pid, mailbox, op });

            match parked.suspend(deadline).await {
                WakeReason::Woke => {
                    self.events.emit(MailboxEvent::Wake { pid, mailbox, op });
                }
                WakeReason::TimedOut => {
                    // One last attempt: a wake may have raced the deadline
                    let mut manager = self.manager.lock().await;
                    let result = attempt(&mut *manager);
                    self.flush(&mut manager);
                    return match result {
                        Err(err) if err == unavailable => {
                            debug!("pid {} timed out on {:?} ({:?})", pid, condition, op);
                            self.events.emit(MailboxEvent::Timeout { pid, mailbox, op });
                            Err(MailboxError::Timeout)
                        }
                        other => other,
                    };
                }
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
