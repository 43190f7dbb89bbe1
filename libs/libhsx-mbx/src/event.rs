//! Engine event stream
//!
//! Every significant engine action is published on a broadcast channel for
//! tracing tools. Publishing never blocks and never fails the operation.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::abi::DeliveryPolicy;
use crate::namespace::MailboxId;
use crate::{HandleId, Pid};

/// Blocking operation a waiter is parked in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingOp {
    Send,
    Recv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionReason {
    DescriptorPoolFull,
    HandleLimit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailboxEvent {
    Created {
        mailbox: MailboxId,
        name: String,
        capacity: u16,
        policy: DeliveryPolicy,
        creator: Pid,
    },
    Destroyed {
        mailbox: MailboxId,
        name: String,
        discarded: usize,
    },
    Send {
        pid: Pid,
        mailbox: MailboxId,
        bytes: usize,
        channel: u16,
    },
    Recv {
        pid: Pid,
        mailbox: MailboxId,
        bytes: usize,
        overrun: bool,
    },
    Wait {
        pid: Pid,
        mailbox: MailboxId,
        op: BlockingOp,
    },
    Wake {
        pid: Pid,
        mailbox: MailboxId,
        op: BlockingOp,
    },
    Timeout {
        pid: Pid,
        mailbox: MailboxId,
        op: BlockingOp,
    },
    Overrun {
        mailbox: MailboxId,
        pid: Pid,
        handle: HandleId,
    },
    Tap {
        pid: Pid,
        mailbox: MailboxId,
        handle: HandleId,
        enabled: bool,
    },
    Exhausted {
        pid: Pid,
        reason: ExhaustionReason,
    },
}

/// Cloneable publisher for [`MailboxEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<MailboxEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: MailboxEvent) {
        // No subscribers is the common case
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new(4);
        bus.emit(MailboxEvent::Exhausted {
            pid: 1,
            reason: ExhaustionReason::HandleLimit,
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(MailboxEvent::Send {
            pid: 2,
            mailbox: MailboxId(7),
            bytes: 10,
            channel: 0,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            MailboxEvent::Send { pid: 2, mailbox: MailboxId(7), bytes: 10, channel: 0 }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = MailboxEvent::Exhausted {
            pid: 3,
            reason: ExhaustionReason::DescriptorPoolFull,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "exhausted");
        assert_eq!(json["reason"], "descriptor_pool_full");
    }
}
