//! Tap and fan-out subscribers
//!
//! Subscribers never own the mailbox they observe. Each one has a private
//! ring sized like the mailbox's primary ring. Loss on a subscriber ring is
//! reported on that subscriber's next delivery via `OVERRUN`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::abi::MessageFlags;
use crate::error::{MailboxError, Result};
use crate::message::{Frame, Received};
use crate::ring::RingBuffer;
use crate::{HandleId, Pid};

/// Identifies a subscriber by the handle it reads through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberKey {
    pub pid: Pid,
    pub handle: HandleId,
}

impl SubscriberKey {
    pub fn new(pid: Pid, handle: HandleId) -> Self {
        Self { pid, handle }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Passive observer, toggled by the TAP call
    Tap { enabled: bool },
    /// Independent consumer of a fan-out mailbox
    Fanout,
}

#[derive(Debug)]
pub struct Subscription {
    pub kind: SubscriptionKind,
    ring: RingBuffer,
    /// A message was lost; flag the next delivery
    pending_overrun: bool,
    /// Messages lost over the subscription's lifetime
    dropped: u64,
    /// The handle has sent into this mailbox; producers never gate or
    /// receive fan-out copies
    sender: bool,
}

impl Subscription {
    fn new(kind: SubscriptionKind, capacity: usize) -> Self {
        Self {
            kind,
            ring: RingBuffer::new(capacity),
            pending_overrun: false,
            dropped: 0,
            sender: false,
        }
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_sender(&self) -> bool {
        self.sender
    }

    fn is_tap(&self) -> bool {
        matches!(self.kind, SubscriptionKind::Tap { .. })
    }

    fn is_reader(&self) -> bool {
        matches!(self.kind, SubscriptionKind::Fanout) && !self.sender
    }

    fn accepts_copies(&self) -> bool {
        match self.kind {
            SubscriptionKind::Tap { enabled } => enabled,
            SubscriptionKind::Fanout => true,
        }
    }

    /// Push a copy, or record the loss. Returns false if the copy was lost.
    fn offer(&mut self, frame: &Frame) -> Result<bool> {
        match self.ring.push(frame.clone()) {
            Ok(()) => Ok(true),
            Err(MailboxError::WouldBlock) => {
                self.pending_overrun = true;
                self.dropped += 1;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn take(&mut self, max_len: usize) -> Result<Option<Received>> {
        let Some(frame) = self.ring.pop()? else {
            return Ok(None);
        };
        let mut msg = frame.deliver(max_len);
        if std::mem::take(&mut self.pending_overrun) {
            msg.header.flags |= MessageFlags::OVERRUN;
        }
        Ok(Some(msg))
    }
}

/// Result of replicating one admitted frame to a subscriber set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Replication {
    /// Subscribers that received a copy
    pub delivered: usize,
    /// Subscribers that lost this message
    pub overrun: Vec<SubscriberKey>,
}

impl Replication {
    pub fn fed_anyone(&self) -> bool {
        self.delivered > 0
    }
}

/// Subscriber set attached to one mailbox
#[derive(Debug, Default)]
pub struct Subscribers {
    entries: BTreeMap<SubscriberKey, Subscription>,
}

impl Subscribers {
    pub fn add_tap(&mut self, key: SubscriberKey, capacity: usize) {
        // Taps start disabled until the owner turns them on
        self.entries
            .insert(key, Subscription::new(SubscriptionKind::Tap { enabled: false }, capacity));
    }

    pub fn add_fanout(&mut self, key: SubscriberKey, capacity: usize) {
        self.entries
            .insert(key, Subscription::new(SubscriptionKind::Fanout, capacity));
    }

    pub fn remove(&mut self, key: &SubscriberKey) -> Option<Subscription> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &SubscriberKey) -> Option<&Subscription> {
        self.entries.get(key)
    }

    pub fn set_tap(&mut self, key: &SubscriberKey, enable: bool) -> Result<()> {
        let sub = self.entries.get_mut(key).ok_or(MailboxError::TapUnsupported(key.handle))?;
        match &mut sub.kind {
            SubscriptionKind::Tap { enabled } => {
                *enabled = enable;
                Ok(())
            }
            SubscriptionKind::Fanout => Err(MailboxError::TapUnsupported(key.handle)),
        }
    }

    /// Record that `key` produces into this mailbox. Its ring stops taking
    /// copies and no longer holds back blocking sends.
    pub fn mark_sender(&mut self, key: &SubscriberKey) {
        if let Some(sub) = self.entries.get_mut(key) {
            if matches!(sub.kind, SubscriptionKind::Fanout) && !sub.sender {
                sub.sender = true;
                sub.ring.clear();
                sub.pending_overrun = false;
            }
        }
    }

    pub fn tap_count(&self) -> usize {
        self.entries.values().filter(|s| s.is_tap()).count()
    }

    /// Fan-out readers, producers excluded
    pub fn fanout_count(&self) -> usize {
        self.readers().count()
    }

    fn readers(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values().filter(|s| s.is_reader())
    }

    /// Whether every fan-out subscriber can take a frame of `cost` bytes
    pub fn all_have_room(&self, cost: usize) -> bool {
        self.readers().all(|s| s.ring.has_room(cost))
    }

    /// Copy `frame` into every fan-out reader's ring; full rings drop it
    pub fn replicate_fanout(&mut self, frame: &Frame) -> Result<Replication> {
        self.replicate(frame, Subscription::is_reader)
    }

    /// Copy `frame` into every enabled tap; a disabled tap ignores it
    pub fn replicate_taps(&mut self, frame: &Frame) -> Result<Replication> {
        self.replicate(frame, |s| s.is_tap() && s.accepts_copies())
    }

    fn replicate(
        &mut self,
        frame: &Frame,
        wanted: impl Fn(&Subscription) -> bool,
    ) -> Result<Replication> {
        let mut out = Replication::default();
        for (key, sub) in self.entries.iter_mut().filter(|(_, s)| wanted(s)) {
            if sub.offer(frame)? {
                out.delivered += 1;
            } else {
                out.overrun.push(*key);
            }
        }
        Ok(out)
    }

    /// Pop the next message from one subscriber's ring
    pub fn take(&mut self, key: &SubscriberKey, max_len: usize) -> Result<Option<Received>> {
        let sub = self.entries.get_mut(key).ok_or_else(|| {
            MailboxError::Internal(format!(
                "pid {} handle {} has no subscription",
                key.pid, key.handle
            ))
        })?;
        sub.take(max_len)
    }

    /// Drop every queued copy, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        self.entries.values_mut().map(|s| s.ring.clear()).sum()
    }
}
