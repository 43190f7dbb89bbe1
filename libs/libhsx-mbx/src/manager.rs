//! Non-blocking mailbox core
//!
//! [`MailboxManager`] owns the registry and the handle tables and performs
//! every operation without ever waiting. Operations that would block report
//! `WouldBlock`/`NoData`; the [`Dispatcher`](crate::Dispatcher) turns those
//! into suspensions. State changes that may release a waiter queue a
//! [`Wakeup`], collected with [`MailboxManager::drain_wakeups`].

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::abi::{stdio, DeliveryPolicy, MessageFlags, Mode};
use crate::config::MailboxConfig;
use crate::error::{MailboxError, Result};
use crate::event::{EventBus, ExhaustionReason, MailboxEvent};
use crate::fanout::SubscriberKey;
use crate::handle::{Binding, HandleTable};
use crate::mailbox::{Mailbox, View};
use crate::message::Received;
use crate::namespace::{MailboxId, MailboxName, Namespace, Registry};
use crate::sched::{WaitCondition, Wakeup};
use crate::{HandleId, Pid};

/// PEEK result for one handle's view
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeekInfo {
    /// Messages waiting
    pub depth: usize,
    /// Framed bytes queued
    pub bytes_used: usize,
    pub capacity: usize,
    /// Payload length of the next message, 0 when empty
    pub next_len: u16,
}

/// Handles opened for a task by [`MailboxManager::register_task`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioHandles {
    pub stdin: HandleId,
    pub stdout: HandleId,
    pub stderr: HandleId,
}

/// Point-in-time description of one mailbox
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSnapshot {
    pub id: MailboxId,
    pub name: String,
    pub namespace: Namespace,
    pub owner: Option<Pid>,
    pub creator: Pid,
    pub capacity: u16,
    pub bytes_used: usize,
    pub depth: usize,
    pub policy: DeliveryPolicy,
    pub refs: usize,
    pub persistent: bool,
    pub subscribers: usize,
    pub taps: usize,
}

impl From<&Mailbox> for MailboxSnapshot {
    fn from(mbx: &Mailbox) -> Self {
        Self {
            id: mbx.id(),
            name: mbx.name().to_string(),
            namespace: mbx.name().namespace,
            owner: mbx.name().owner,
            creator: mbx.creator(),
            capacity: mbx.capacity(),
            bytes_used: mbx.queue().used(),
            depth: mbx.queue().depth(),
            policy: mbx.policy(),
            refs: mbx.refs(),
            persistent: mbx.is_persistent(),
            subscribers: mbx.subscribers().fanout_count(),
            taps: mbx.subscribers().tap_count(),
        }
    }
}

#[derive(Debug)]
pub struct MailboxManager {
    config: MailboxConfig,
    registry: Registry,
    handles: HandleTable,
    events: EventBus,
    wakeups: Vec<Wakeup>,
    /// Set by the first invariant violation; every later call fails
    halted: Option<String>,
}

impl MailboxManager {
    pub fn new(config: MailboxConfig) -> Self {
        let config = config.normalized();
        let events = EventBus::new(config.event_capacity);
        Self::with_events(config, events)
    }

    pub fn with_events(config: MailboxConfig, events: EventBus) -> Self {
        let config = config.normalized();
        Self {
            registry: Registry::new(config.max_descriptors),
            handles: HandleTable::new(config.handle_limit_per_pid),
            config,
            events,
            wakeups: Vec::new(),
            halted: None,
        }
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Stop the engine after an invariant violation
    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("Mailbox engine halted: {}", reason);
        self.halted.get_or_insert(reason);
    }

    /// Discard every mailbox and handle and resume service
    pub fn reset(&mut self) {
        let ids: Vec<MailboxId> = self.registry.iter().map(Mailbox::id).collect();
        for id in ids {
            self.destroy(id);
        }
        self.handles.clear();
        self.halted = None;
        info!("Mailbox engine reset");
    }

    /// Wakes queued by operations since the last drain
    pub fn drain_wakeups(&mut self) -> Vec<Wakeup> {
        std::mem::take(&mut self.wakeups)
    }

    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if let Some(reason) = &self.halted {
            return Err(MailboxError::Internal(format!("engine halted: {}", reason)));
        }
        let result = op(self);
        if let Err(err) = &result {
            if err.is_fatal() {
                self.halt(err.to_string());
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Trap operations
    // ------------------------------------------------------------------

    /// OPEN: attach to an existing mailbox, binding well-known names on demand
    pub fn open(&mut self, pid: Pid, name: &str, mode: u16) -> Result<HandleId> {
        self.guarded(|m| {
            let mode = Mode::parse(mode)?;
            let name = MailboxName::parse(name, pid)?;
            m.check_handle_room(pid)?;

            let id = match m.registry.resolve(&name) {
                Some(id) => id,
                None if name.is_well_known() => {
                    let capacity = m.config.default_capacity;
                    m.create(pid, name, capacity, mode.policy(), true)?
                }
                None => return Err(MailboxError::NotFound(name.to_string())),
            };

            m.attach(pid, id, mode)
        })
    }

    /// BIND: create a mailbox, or re-bind an identical one
    pub fn bind(&mut self, pid: Pid, name: &str, capacity: u16, mode: u16) -> Result<HandleId> {
        self.guarded(|m| {
            let mode = Mode::parse(mode)?;
            let name = MailboxName::parse(name, pid)?;
            if capacity == 0 || capacity > m.config.max_capacity {
                return Err(MailboxError::InvalidCapacity(capacity.into()));
            }
            m.check_handle_room(pid)?;

            let id = match m.registry.resolve(&name) {
                Some(id) => {
                    let existing = m.mailbox(id)?;
                    if existing.capacity() != capacity || existing.policy() != mode.policy() {
                        return Err(MailboxError::AlreadyExists(name.to_string()));
                    }
                    id
                }
                None => {
                    let persistent = name.is_well_known();
                    m.create(pid, name, capacity, mode.policy(), persistent)?
                }
            };

            m.attach(pid, id, mode)
        })
    }

    /// SEND without blocking; returns the number of payload bytes accepted
    pub fn try_send(
        &mut self,
        pid: Pid,
        handle: HandleId,
        payload: &[u8],
        flags: u16,
        channel: u16,
    ) -> Result<usize> {
        self.guarded(|m| {
            let binding = m.handles.get(pid, handle)?;
            if !binding.mode.can_write() {
                return Err(MailboxError::PermissionDenied { handle, direction: "write" });
            }

            // OVERRUN is engine-owned
            let flags = MessageFlags::from_bits_truncate(flags) - MessageFlags::OVERRUN;
            let mailbox = m.mailbox_mut(binding.mailbox)?;
            let admission = mailbox.admit(SubscriberKey::new(pid, handle), flags, channel, payload)?;
            let id = mailbox.id();

            debug!(
                "pid {} sent {} bytes to {} (seq {})",
                pid,
                payload.len(),
                mailbox.name(),
                admission.seq
            );

            if admission.queued {
                m.wakeups.push(Wakeup::one(WaitCondition::Readable(id)));
            }
            if admission.fanout.fed_anyone() || admission.taps.fed_anyone() {
                m.wakeups.push(Wakeup::all(WaitCondition::Subscriber(id)));
            }
            for key in admission.fanout.overrun.iter().chain(&admission.taps.overrun) {
                m.events.emit(MailboxEvent::Overrun {
                    mailbox: id,
                    pid: key.pid,
                    handle: key.handle,
                });
            }
            m.events.emit(MailboxEvent::Send {
                pid,
                mailbox: id,
                bytes: payload.len(),
                channel,
            });

            Ok(payload.len())
        })
    }

    /// RECV without blocking
    pub fn try_recv(&mut self, pid: Pid, handle: HandleId, max_len: usize) -> Result<Received> {
        self.guarded(|m| {
            let (binding, view) = m.readable_view(pid, handle)?;
            let mailbox = m.mailbox_mut(binding.mailbox)?;
            let msg = mailbox.take(view, max_len)?.ok_or(MailboxError::NoData)?;

            if view.frees_sender_space() {
                m.wakeups.push(Wakeup::all(WaitCondition::Writable(binding.mailbox)));
            }
            m.events.emit(MailboxEvent::Recv {
                pid,
                mailbox: binding.mailbox,
                bytes: msg.len(),
                overrun: msg.overrun(),
            });
            Ok(msg)
        })
    }

    /// PEEK: inspect the handle's view without consuming
    pub fn peek(&mut self, pid: Pid, handle: HandleId) -> Result<PeekInfo> {
        self.guarded(|m| {
            let (binding, view) = m.readable_view(pid, handle)?;
            let stat = m.mailbox(binding.mailbox)?.stat(view)?;
            Ok(PeekInfo {
                depth: stat.depth,
                bytes_used: stat.bytes_used,
                capacity: stat.capacity,
                next_len: stat.next_len.unwrap_or(0),
            })
        })
    }

    /// TAP: enable or disable copies for a tap-mode handle
    pub fn tap(&mut self, pid: Pid, handle: HandleId, enable: bool) -> Result<()> {
        self.guarded(|m| {
            let binding = m.handles.get(pid, handle)?;
            if !binding.mode.is_tap() {
                return Err(MailboxError::TapUnsupported(handle));
            }

            let key = SubscriberKey::new(pid, handle);
            m.mailbox_mut(binding.mailbox)?
                .subscribers_mut()
                .set_tap(&key, enable)?;

            m.events.emit(MailboxEvent::Tap {
                pid,
                mailbox: binding.mailbox,
                handle,
                enabled: enable,
            });
            Ok(())
        })
    }

    /// CLOSE: invalidate the handle, tearing the mailbox down if it was the last one
    pub fn close(&mut self, pid: Pid, handle: HandleId) -> Result<()> {
        self.guarded(|m| {
            let binding = m.handles.remove(pid, handle)?;
            m.detach(pid, handle, binding)
        })
    }

    // ------------------------------------------------------------------
    // Blocking support
    // ------------------------------------------------------------------

    /// Condition a blocked RECV on `handle` waits for
    pub fn recv_condition(&mut self, pid: Pid, handle: HandleId) -> Result<WaitCondition> {
        self.guarded(|m| {
            let (binding, view) = m.readable_view(pid, handle)?;
            Ok(match view {
                View::Queue => WaitCondition::Readable(binding.mailbox),
                View::Subscriber(_) | View::Tap(_) => WaitCondition::Subscriber(binding.mailbox),
            })
        })
    }

    /// Condition a blocked SEND on `handle` waits for
    pub fn send_condition(&mut self, pid: Pid, handle: HandleId) -> Result<WaitCondition> {
        self.guarded(|m| {
            let binding = m.handles.get(pid, handle)?;
            Ok(WaitCondition::Writable(binding.mailbox))
        })
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Bind a new task's stdio and control mailboxes and open its stdio handles
    pub fn register_task(&mut self, pid: Pid) -> Result<StdioHandles> {
        let control = self.guarded(|m| {
            let name = MailboxName::control(pid);
            if m.registry.resolve(&name).is_none() {
                let capacity = m.config.default_capacity;
                m.create(pid, name, capacity, DeliveryPolicy::Queue, true)?;
            }
            Ok(())
        });
        control?;

        let mut opened = Vec::with_capacity(stdio::BASES.len());
        for stream in [stdio::IN, stdio::OUT, stdio::ERR] {
            match self.open(pid, stream, Mode::RDWR.bits()) {
                Ok(handle) => opened.push(handle),
                Err(err) => {
                    for handle in opened {
                        let _ = self.close(pid, handle);
                    }
                    return Err(err);
                }
            }
        }

        info!("Registered task {} (stdio handles {:?})", pid, opened);
        Ok(StdioHandles {
            stdin: opened[0],
            stdout: opened[1],
            stderr: opened[2],
        })
    }

    /// Release everything a task holds; returns the number of handles closed
    pub fn reap_task(&mut self, pid: Pid) -> Result<usize> {
        self.guarded(|m| {
            let held = m.handles.take_task(pid);
            let count = held.len();

            for (handle, binding) in held {
                // Blocked calls through this handle must observe the close
                for condition in WaitCondition::all(binding.mailbox) {
                    m.wakeups.push(Wakeup::all(condition));
                }
                m.detach(pid, handle, binding)?;
            }

            let owned: Vec<MailboxId> = m
                .registry
                .iter()
                .filter(|mbx| mbx.is_persistent() && mbx.name().owner == Some(pid))
                .map(Mailbox::id)
                .collect();
            for id in owned {
                let mailbox = m.mailbox_mut(id)?;
                mailbox.set_persistent(false);
                if mailbox.is_unreferenced() {
                    m.destroy(id);
                }
            }

            info!("Reaped task {} ({} handles closed)", pid, count);
            Ok(count)
        })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<MailboxSnapshot> {
        self.registry.iter().map(MailboxSnapshot::from).collect()
    }

    pub fn mailbox_count(&self) -> usize {
        self.registry.len()
    }

    pub fn handle_count(&self, pid: Pid) -> usize {
        self.handles.count(pid)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn mailbox(&self, id: MailboxId) -> Result<&Mailbox> {
        self.registry
            .get(id)
            .ok_or_else(|| MailboxError::Internal(format!("dangling binding to {}", id)))
    }

    fn mailbox_mut(&mut self, id: MailboxId) -> Result<&mut Mailbox> {
        self.registry
            .get_mut(id)
            .ok_or_else(|| MailboxError::Internal(format!("dangling binding to {}", id)))
    }

    fn readable_view(&self, pid: Pid, handle: HandleId) -> Result<(Binding, View)> {
        let binding = self.handles.get(pid, handle)?;
        if !binding.mode.can_read() && !binding.mode.is_tap() {
            return Err(MailboxError::PermissionDenied { handle, direction: "read" });
        }
        let view = self
            .mailbox(binding.mailbox)?
            .view(SubscriberKey::new(pid, handle), binding.mode);
        Ok((binding, view))
    }

    fn check_handle_room(&self, pid: Pid) -> Result<()> {
        self.handles.ensure_room(pid).map_err(|err| {
            warn!("Task {} reached its handle limit", pid);
            self.events.emit(MailboxEvent::Exhausted {
                pid,
                reason: ExhaustionReason::HandleLimit,
            });
            err
        })
    }

    fn create(
        &mut self,
        creator: Pid,
        name: MailboxName,
        capacity: u16,
        policy: DeliveryPolicy,
        persistent: bool,
    ) -> Result<MailboxId> {
        let label = name.to_string();
        let id = self
            .registry
            .insert(|id| Mailbox::new(id, name, capacity, policy, creator, persistent))
            .map_err(|err| {
                if err == MailboxError::DescriptorsExhausted {
                    warn!("Descriptor pool full, cannot create {}", label);
                    self.events.emit(MailboxEvent::Exhausted {
                        pid: creator,
                        reason: ExhaustionReason::DescriptorPoolFull,
                    });
                }
                err
            })?;

        info!("Created mailbox {} ({}, {} bytes, {:?})", label, id, capacity, policy);
        self.events.emit(MailboxEvent::Created {
            mailbox: id,
            name: label,
            capacity,
            policy,
            creator,
        });
        Ok(id)
    }

    fn attach(&mut self, pid: Pid, id: MailboxId, mode: Mode) -> Result<HandleId> {
        let handle = self.handles.insert(pid, Binding { mailbox: id, mode })?;
        let mailbox = self.mailbox_mut(id)?;
        mailbox.attach(SubscriberKey::new(pid, handle), mode);
        debug!("pid {} opened {} as handle {} ({:?})", pid, mailbox.name(), handle, mode);
        Ok(handle)
    }

    fn detach(&mut self, pid: Pid, handle: HandleId, binding: Binding) -> Result<()> {
        let mailbox = self.mailbox_mut(binding.mailbox)?;
        mailbox.detach(SubscriberKey::new(pid, handle))?;
        debug!("pid {} closed handle {} on {}", pid, handle, mailbox.name());

        if mailbox.is_unreferenced() {
            self.destroy(binding.mailbox);
        } else {
            // Calls parked on the closed handle must observe the close, and a
            // departed fan-out subscriber may have been holding senders back.
            // Waiters on other handles re-check and park again.
            for condition in WaitCondition::all(binding.mailbox) {
                self.wakeups.push(Wakeup::all(condition));
            }
        }
        Ok(())
    }

    fn destroy(&mut self, id: MailboxId) {
        let Some(mut mailbox) = self.registry.remove(id) else {
            return;
        };
        let discarded = mailbox.discard();
        info!("Destroyed mailbox {} ({} messages discarded)", mailbox.name(), discarded);

        for condition in WaitCondition::all(id) {
            self.wakeups.push(Wakeup::all(condition));
        }
        self.events.emit(MailboxEvent::Destroyed {
            mailbox: id,
            name: mailbox.name().to_string(),
            discarded,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::WakeScope;

    const RDWR: u16 = 0x03;
    const RDONLY: u16 = 0x01;
    const WRONLY: u16 = 0x02;
    const TAP: u16 = 0x04;

    fn manager() -> MailboxManager {
        MailboxManager::new(MailboxConfig::default())
    }

    #[test]
    fn test_bind_open_send_recv() {
        let mut m = manager();
        let owner = m.bind(1, "app:demo", 64, RDWR).unwrap();
        let writer = m.open(2, "app:demo", WRONLY).unwrap();
        assert_eq!(m.try_send(2, writer, b"0123456789", 0, 0).unwrap(), 10);

        let reader = m.open(3, "app:demo", RDONLY).unwrap();
        let msg = m.try_recv(3, reader, 192).unwrap();
        assert_eq!(msg.payload, b"0123456789");
        assert_eq!(msg.header.length, 10);
        assert!(msg.header.flags.is_empty());
        assert_eq!(msg.header.src_id, 2);

        assert_eq!(m.try_recv(1, owner, 64), Err(MailboxError::NoData));
    }

    #[test]
    fn test_open_unknown_name_fails() {
        let mut m = manager();
        assert!(matches!(m.open(1, "app:missing", RDONLY), Err(MailboxError::NotFound(_))));
        assert!(matches!(m.open(1, "bogus", RDONLY), Err(MailboxError::InvalidName(_))));
        assert_eq!(m.mailbox_count(), 0);
    }

    #[test]
    fn test_implicit_stdio_bind_shares_ring() {
        let mut m = manager();
        let a = m.open(5, "svc:stdio.in", RDWR).unwrap();
        let b = m.open(5, "svc:stdio.in", RDWR).unwrap();
        assert_ne!(a, b);
        assert_eq!(m.mailbox_count(), 1);

        m.try_send(5, a, b"line", MessageFlags::STDOUT.bits(), 0).unwrap();
        assert_eq!(m.try_recv(5, b, 64).unwrap().payload, b"line");

        let snap = &m.snapshot()[0];
        assert_eq!(snap.capacity, 64);
        assert!(snap.persistent);
        assert_eq!(snap.refs, 2);
    }

    #[test]
    fn test_rebind_rules() {
        let mut m = manager();
        m.bind(1, "shared:bus", 128, RDWR).unwrap();
        m.bind(2, "shared:bus", 128, RDWR).unwrap();
        assert!(matches!(
            m.bind(2, "shared:bus", 64, RDWR),
            Err(MailboxError::AlreadyExists(_))
        ));
        assert!(matches!(
            m.bind(2, "shared:bus", 128, RDWR | Mode::FANOUT.bits()),
            Err(MailboxError::AlreadyExists(_))
        ));
        assert_eq!(m.mailbox_count(), 1);
    }

    #[test]
    fn test_bind_capacity_bounds() {
        let mut m = manager();
        assert_eq!(m.bind(1, "app:a", 0, RDWR), Err(MailboxError::InvalidCapacity(0)));
        assert_eq!(
            m.bind(1, "app:a", 16385, RDWR),
            Err(MailboxError::InvalidCapacity(16385))
        );
        assert_eq!(m.bind(1, "app:a", 16384, RDWR).unwrap(), 1);
    }

    #[test]
    fn test_direction_enforced() {
        let mut m = manager();
        let reader = m.bind(1, "app:dir", 64, RDONLY).unwrap();
        let err = m.try_send(1, reader, b"x", 0, 0).unwrap_err();
        assert_eq!(err, MailboxError::PermissionDenied { handle: reader, direction: "write" });

        let writer = m.open(1, "app:dir", WRONLY).unwrap();
        assert!(matches!(
            m.try_recv(1, writer, 8),
            Err(MailboxError::PermissionDenied { .. })
        ));
        assert!(matches!(m.peek(1, writer), Err(MailboxError::PermissionDenied { .. })));
        assert_eq!(m.snapshot()[0].depth, 0);
    }

    #[test]
    fn test_close_tears_down_and_double_close_fails() {
        let mut m = manager();
        let h = m.bind(1, "app:tmp", 64, RDWR).unwrap();
        m.try_send(1, h, b"queued", 0, 0).unwrap();
        m.close(1, h).unwrap();
        assert_eq!(m.mailbox_count(), 0);
        assert_eq!(m.close(1, h), Err(MailboxError::InvalidHandle { pid: 1, handle: h }));
        assert!(m.try_send(1, h, b"x", 0, 0).is_err());

        // A fresh bind starts empty
        let h = m.bind(1, "app:tmp", 64, RDWR).unwrap();
        assert_eq!(m.try_recv(1, h, 64), Err(MailboxError::NoData));
    }

    #[test]
    fn test_message_too_large() {
        let mut m = manager();
        let h = m.bind(1, "app:small", 16, RDWR).unwrap();
        let err = m.try_send(1, h, &[0u8; 9], 0, 0).unwrap_err();
        assert_eq!(err.status(), crate::Status::MsgTooLarge);
        assert_eq!(m.peek(1, h).unwrap().depth, 0);
    }

    #[test]
    fn test_truncation_discards_tail() {
        let mut m = manager();
        let h = m.bind(1, "app:trunc", 64, RDWR).unwrap();
        m.try_send(1, h, b"abcdefgh", 0, 0).unwrap();
        m.try_send(1, h, b"next", 0, 0).unwrap();

        let msg = m.try_recv(1, h, 3).unwrap();
        assert_eq!(msg.payload, b"abc");
        assert!(msg.overrun());

        let msg = m.try_recv(1, h, 64).unwrap();
        assert_eq!(msg.payload, b"next");
        assert!(!msg.overrun());
    }

    #[test]
    fn test_caller_cannot_set_overrun() {
        let mut m = manager();
        let h = m.bind(1, "app:flags", 64, RDWR).unwrap();
        let flags = (MessageFlags::OOB | MessageFlags::OVERRUN).bits();
        m.try_send(1, h, b"x", flags, 9).unwrap();
        let msg = m.try_recv(1, h, 64).unwrap();
        assert_eq!(msg.header.flags, MessageFlags::OOB);
        assert_eq!(msg.header.channel, 9);
    }

    #[test]
    fn test_peek() {
        let mut m = manager();
        let h = m.bind(1, "app:peek", 64, RDWR).unwrap();
        assert_eq!(
            m.peek(1, h).unwrap(),
            PeekInfo { depth: 0, bytes_used: 0, capacity: 64, next_len: 0 }
        );
        m.try_send(1, h, b"12345", 0, 0).unwrap();
        m.try_send(1, h, b"1", 0, 0).unwrap();
        assert_eq!(
            m.peek(1, h).unwrap(),
            PeekInfo { depth: 2, bytes_used: 22, capacity: 64, next_len: 5 }
        );
        // Peeking does not consume
        assert_eq!(m.try_recv(1, h, 64).unwrap().payload, b"12345");
    }

    #[test]
    fn test_tap_mode() {
        let mut m = manager();
        let owner = m.bind(1, "app:traced", 64, RDWR).unwrap();
        let tap = m.open(9, "app:traced", TAP).unwrap();

        assert_eq!(m.tap(1, owner, true), Err(MailboxError::TapUnsupported(owner)));

        m.try_send(1, owner, b"before", 0, 0).unwrap();
        assert_eq!(m.try_recv(9, tap, 64), Err(MailboxError::NoData));

        m.tap(9, tap, true).unwrap();
        m.try_send(1, owner, b"after", 0, 0).unwrap();
        assert_eq!(m.try_recv(9, tap, 64).unwrap().payload, b"after");

        // The primary queue is untouched by the tap
        assert_eq!(m.try_recv(1, owner, 64).unwrap().payload, b"before");
        assert_eq!(m.try_recv(1, owner, 64).unwrap().payload, b"after");
    }

    #[test]
    fn test_send_queues_wakeups() {
        let mut m = manager();
        let h = m.bind(1, "app:wake", 64, RDWR).unwrap();
        m.drain_wakeups();

        m.try_send(1, h, b"x", 0, 0).unwrap();
        let wakes = m.drain_wakeups();
        assert_eq!(wakes.len(), 1);
        assert_eq!(wakes[0].scope, WakeScope::One);
        assert!(matches!(wakes[0].condition, WaitCondition::Readable(_)));

        m.try_recv(1, h, 64).unwrap();
        assert!(matches!(
            m.drain_wakeups()[0].condition,
            WaitCondition::Writable(_)
        ));
    }

    #[test]
    fn test_close_wakes_every_waiter_on_a_live_mailbox() {
        let mut m = manager();
        m.bind(1, "app:live", 64, RDWR).unwrap();
        let h = m.open(2, "app:live", RDONLY).unwrap();
        m.drain_wakeups();

        m.close(2, h).unwrap();
        let conditions: Vec<WaitCondition> =
            m.drain_wakeups().into_iter().map(|w| w.condition).collect();
        assert_eq!(m.mailbox_count(), 1);
        assert!(conditions.iter().any(|c| matches!(c, WaitCondition::Readable(_))));
        assert!(conditions.iter().any(|c| matches!(c, WaitCondition::Subscriber(_))));
        assert!(conditions.iter().any(|c| matches!(c, WaitCondition::Writable(_))));
    }

    #[test]
    fn test_register_and_reap_task() {
        let mut m = manager();
        let stdio = m.register_task(4).unwrap();
        assert_eq!((stdio.stdin, stdio.stdout, stdio.stderr), (1, 2, 3));
        // Three stdio channels plus the control mailbox
        assert_eq!(m.mailbox_count(), 4);

        let peer = m.open(5, "svc:stdio.out@4", RDONLY).unwrap();
        m.try_send(4, stdio.stdout, b"hello", MessageFlags::STDOUT.bits(), 0).unwrap();

        assert_eq!(m.reap_task(4).unwrap(), 3);
        assert_eq!(m.handle_count(4), 0);
        // stdout survives while task 5 still reads it
        assert_eq!(m.mailbox_count(), 1);
        assert_eq!(m.try_recv(5, peer, 64).unwrap().payload, b"hello");

        m.close(5, peer).unwrap();
        assert_eq!(m.mailbox_count(), 0);
    }

    #[test]
    fn test_descriptor_exhaustion() {
        let config = MailboxConfig { max_descriptors: 1, ..MailboxConfig::default() };
        let mut m = MailboxManager::new(config);
        let mut events = m.events().subscribe();

        m.bind(1, "app:one", 64, RDWR).unwrap();
        let err = m.bind(1, "app:two", 64, RDWR).unwrap_err();
        assert_eq!(err, MailboxError::DescriptorsExhausted);
        assert_eq!(err.status(), crate::Status::NoDescriptor);

        let mut saw_exhausted = false;
        while let Ok(event) = events.try_recv() {
            if let MailboxEvent::Exhausted { reason, .. } = event {
                assert_eq!(reason, ExhaustionReason::DescriptorPoolFull);
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[test]
    fn test_handle_quota() {
        let config = MailboxConfig { handle_limit_per_pid: 2, ..MailboxConfig::default() };
        let mut m = MailboxManager::new(config);
        let first = m.bind(1, "app:q", 64, RDWR).unwrap();
        m.open(1, "app:q", RDONLY).unwrap();
        assert_eq!(m.open(1, "app:q", RDONLY), Err(MailboxError::HandleQuota(1)));
        // A quota failure never leaves a fresh mailbox behind
        assert_eq!(m.bind(1, "app:other", 64, RDWR), Err(MailboxError::HandleQuota(1)));
        assert_eq!(m.mailbox_count(), 1);

        m.close(1, first).unwrap();
        m.open(1, "app:q", RDONLY).unwrap();
    }

    #[test]
    fn test_halt_is_sticky() {
        let mut m = manager();
        let h = m.bind(1, "app:x", 64, RDWR).unwrap();
        m.halt("ring corrupted");
        assert!(m.try_send(1, h, b"x", 0, 0).unwrap_err().is_fatal());
        assert!(m.open(1, "app:x", RDONLY).unwrap_err().is_fatal());

        m.reset();
        assert!(!m.is_halted());
        assert_eq!(m.mailbox_count(), 0);
        m.bind(1, "app:x", 64, RDWR).unwrap();
    }
}
