//! A single mailbox: primary FIFO plus its subscriber set

use crate::abi::{DeliveryPolicy, MessageFlags, Mode};
use crate::error::{MailboxError, Result};
use crate::fanout::{Replication, SubscriberKey, Subscribers};
use crate::message::{Frame, MessageHeader, Received};
use crate::namespace::{MailboxId, MailboxName};
use crate::ring::RingBuffer;
use crate::Pid;

/// Which ring a handle reads from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum View {
    /// The shared primary queue
    Queue,
    /// The handle's own fan-out ring
    Subscriber(SubscriberKey),
    /// The handle's tap ring
    Tap(SubscriberKey),
}

impl View {
    /// Whether consuming from this view frees space a sender may wait for
    pub fn frees_sender_space(self) -> bool {
        !matches!(self, Self::Tap(_))
    }
}

/// Outcome of admitting one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub seq: u64,
    /// Whether the frame landed on the primary queue
    pub queued: bool,
    pub fanout: Replication,
    pub taps: Replication,
}

/// Summary of one ring as seen through a handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStat {
    pub depth: usize,
    pub bytes_used: usize,
    pub capacity: usize,
    pub next_len: Option<u16>,
}

impl RingStat {
    fn of(ring: &RingBuffer) -> Self {
        Self {
            depth: ring.depth(),
            bytes_used: ring.used(),
            capacity: ring.capacity(),
            next_len: ring.front_header().map(|h| h.length),
        }
    }
}

#[derive(Debug)]
pub struct Mailbox {
    id: MailboxId,
    name: MailboxName,
    capacity: u16,
    policy: DeliveryPolicy,
    creator: Pid,
    /// Kept alive with no open handles (well-known channels)
    persistent: bool,
    /// Open handles referencing this mailbox
    refs: usize,
    next_seq: u64,
    queue: RingBuffer,
    subscribers: Subscribers,
}

impl Mailbox {
    pub fn new(
        id: MailboxId,
        name: MailboxName,
        capacity: u16,
        policy: DeliveryPolicy,
        creator: Pid,
        persistent: bool,
    ) -> Self {
        Self {
            id,
            name,
            capacity,
            policy,
            creator,
            persistent,
            refs: 0,
            next_seq: 0,
            queue: RingBuffer::new(capacity as usize),
            subscribers: Subscribers::default(),
        }
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    pub fn name(&self) -> &MailboxName {
        &self.name
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    pub fn creator(&self) -> Pid {
        self.creator
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn queue(&self) -> &RingBuffer {
        &self.queue
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    pub fn subscribers_mut(&mut self) -> &mut Subscribers {
        &mut self.subscribers
    }

    /// Whether nothing keeps this mailbox alive any more
    pub fn is_unreferenced(&self) -> bool {
        self.refs == 0 && !self.persistent
    }

    /// Ring a handle opened with `mode` reads from
    pub fn view(&self, key: SubscriberKey, mode: Mode) -> View {
        if mode.is_tap() {
            View::Tap(key)
        } else if self.policy == DeliveryPolicy::Queue {
            View::Queue
        } else {
            View::Subscriber(key)
        }
    }

    /// Account for a new handle and create its subscription if it has one
    pub fn attach(&mut self, key: SubscriberKey, mode: Mode) {
        self.refs += 1;
        let capacity = self.capacity as usize;
        match self.view(key, mode) {
            View::Tap(key) => self.subscribers.add_tap(key, capacity),
            View::Subscriber(key) if mode.can_read() => self.subscribers.add_fanout(key, capacity),
            View::Subscriber(_) | View::Queue => {}
        }
    }

    /// Drop a handle's reference and subscription
    pub fn detach(&mut self, key: SubscriberKey) -> Result<()> {
        self.subscribers.remove(&key);
        self.refs = self.refs.checked_sub(1).ok_or_else(|| {
            MailboxError::Internal(format!("{} reference count underflow", self.name))
        })?;
        Ok(())
    }

    /// Admit one message according to the delivery policy.
    ///
    /// Nothing is stored unless the whole message is accepted.
    pub fn admit(
        &mut self,
        from: SubscriberKey,
        flags: MessageFlags,
        channel: u16,
        payload: &[u8],
    ) -> Result<Admission> {
        let cost = self.queue.check_size(payload.len())?;
        let length = u16::try_from(payload.len()).map_err(|_| MailboxError::MessageTooLarge {
            size: cost,
            capacity: self.queue.capacity(),
        })?;

        if self.policy != DeliveryPolicy::Queue {
            self.subscribers.mark_sender(&from);
        }

        match self.policy {
            DeliveryPolicy::Queue if !self.queue.has_room(cost) => {
                return Err(MailboxError::WouldBlock)
            }
            DeliveryPolicy::FanoutBlock if !self.subscribers.all_have_room(cost) => {
                return Err(MailboxError::WouldBlock)
            }
            _ => {}
        }

        let frame = Frame {
            seq: self.next_seq,
            header: MessageHeader::new(length, flags, from.pid, channel),
            payload: payload.to_vec(),
        };
        self.next_seq += 1;

        let taps = self.subscribers.replicate_taps(&frame)?;
        let seq = frame.seq;
        let (queued, fanout) = match self.policy {
            DeliveryPolicy::Queue => {
                self.queue.push(frame)?;
                (true, Replication::default())
            }
            DeliveryPolicy::FanoutDrop => (false, self.subscribers.replicate_fanout(&frame)?),
            DeliveryPolicy::FanoutBlock => {
                let fanout = self.subscribers.replicate_fanout(&frame)?;
                if !fanout.overrun.is_empty() {
                    return Err(MailboxError::Internal(format!(
                        "{} lost a blocking fan-out copy after the room check",
                        self.name
                    )));
                }
                (false, fanout)
            }
        };

        Ok(Admission { seq, queued, fanout, taps })
    }

    /// Take the next message visible through `view`
    pub fn take(&mut self, view: View, max_len: usize) -> Result<Option<Received>> {
        match view {
            View::Queue => Ok(self.queue.pop()?.map(|frame| frame.deliver(max_len))),
            View::Subscriber(key) | View::Tap(key) => self.subscribers.take(&key, max_len),
        }
    }

    pub fn stat(&self, view: View) -> Result<RingStat> {
        match view {
            View::Queue => Ok(RingStat::of(&self.queue)),
            View::Subscriber(key) | View::Tap(key) => self
                .subscribers
                .get(&key)
                .map(|sub| RingStat::of(sub.ring()))
                .ok_or_else(|| {
                    MailboxError::Internal(format!(
                        "pid {} handle {} has no subscription on {}",
                        key.pid, key.handle, self.name
                    ))
                }),
        }
    }

    /// Discard everything queued, returning the number of dropped frames
    pub fn discard(&mut self) -> usize {
        self.queue.clear() + self.subscribers.clear()
    }
}
