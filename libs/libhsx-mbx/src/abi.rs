//! Mailbox ABI constants shared with the executive and user space
//!
//! Values here are part of the trap contract and must stay in sync with
//! the C header consumed by the toolchain.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MailboxError;

/// SVC module selector for the mailbox subsystem
pub const MODULE_ID: u8 = 0x05;

/// Maximum mailbox name length in bytes (prefix included)
pub const MAX_NAME_BYTES: usize = 32;

/// Maximum namespace prefix length in bytes
pub const MAX_PREFIX_BYTES: usize = 8;

/// Ring capacity used for implicit binds
pub const DEFAULT_RING_CAPACITY: u16 = 64;

/// Namespace prefixes
pub mod prefix {
    pub const PID: &str = "pid:";
    pub const SVC: &str = "svc:";
    pub const APP: &str = "app:";
    pub const SHARED: &str = "shared:";
}

/// Well-known stdio channels (per task, service namespace)
pub mod stdio {
    pub const IN: &str = "svc:stdio.in";
    pub const OUT: &str = "svc:stdio.out";
    pub const ERR: &str = "svc:stdio.err";

    /// Base names without the `svc:` prefix
    pub const BASES: [&str; 3] = ["stdio.in", "stdio.out", "stdio.err"];
}

/// Function selectors within module `0x05`
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Open = 0x00,
    Bind = 0x01,
    Send = 0x02,
    Recv = 0x03,
    Peek = 0x04,
    Tap = 0x05,
    Close = 0x06,
}

impl TryFrom<u8> for Function {
    type Error = MailboxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Open,
            0x01 => Self::Bind,
            0x02 => Self::Send,
            0x03 => Self::Recv,
            0x04 => Self::Peek,
            0x05 => Self::Tap,
            0x06 => Self::Close,
            other => return Err(MailboxError::UnknownFunction(other)),
        })
    }
}

bitflags::bitflags! {
    /// Access mode mask for BIND/OPEN
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Mode: u16 {
        const RDONLY = 0x01;
        const WRONLY = 0x02;
        const RDWR = 0x03;
        /// Passive observer of the mailbox's traffic
        const TAP = 0x04;
        /// One ring per subscriber, fed by a single send
        const FANOUT = 0x08;
        /// Fan-out: full subscribers miss the message and see OVERRUN
        const FANOUT_DROP = 0x10;
        /// Fan-out: the sender waits until every subscriber has room
        const FANOUT_BLOCK = 0x20;
    }
}

/// How a mailbox distributes admitted messages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Single shared FIFO; each message goes to exactly one receiver
    #[default]
    Queue,
    /// Per-subscriber rings, overflowing subscribers drop
    FanoutDrop,
    /// Per-subscriber rings, sender waits for the slowest subscriber
    FanoutBlock,
}

impl Mode {
    /// Validate a raw mode word coming across the trap boundary
    pub fn parse(raw: u16) -> Result<Self, MailboxError> {
        let mode = Self::from_bits(raw).ok_or(MailboxError::InvalidMode(raw.into()))?;

        if !mode.intersects(Self::RDWR | Self::TAP) {
            return Err(MailboxError::InvalidMode(raw.into()));
        }
        if mode.contains(Self::FANOUT_DROP | Self::FANOUT_BLOCK) {
            return Err(MailboxError::InvalidMode(raw.into()));
        }
        if mode.intersects(Self::FANOUT_DROP | Self::FANOUT_BLOCK) && !mode.contains(Self::FANOUT) {
            return Err(MailboxError::InvalidMode(raw.into()));
        }

        Ok(mode)
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::RDONLY)
    }

    pub fn can_write(self) -> bool {
        self.contains(Self::WRONLY)
    }

    pub fn is_tap(self) -> bool {
        self.contains(Self::TAP)
    }

    /// Delivery policy requested by this mode (fan-out defaults to drop)
    pub fn policy(self) -> DeliveryPolicy {
        if !self.contains(Self::FANOUT) {
            DeliveryPolicy::Queue
        } else if self.contains(Self::FANOUT_BLOCK) {
            DeliveryPolicy::FanoutBlock
        } else {
            DeliveryPolicy::FanoutDrop
        }
    }
}

bitflags::bitflags! {
    /// Message header flag bits
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MessageFlags: u16 {
        const STDOUT = 0x0001;
        const STDERR = 0x0002;
        /// Out-of-band
        const OOB = 0x0004;
        /// Truncation or loss occurred before this delivery
        const OVERRUN = 0x0008;
    }
}

/// Blocking policy for SEND/RECV
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// Never block
    Poll,
    /// Relative deadline in milliseconds (1..=0xFFFE)
    Millis(u16),
    /// Block until satisfied
    Infinite,
}

impl Timeout {
    pub const RAW_POLL: u16 = 0x0000;
    pub const RAW_INFINITE: u16 = 0xFFFF;

    pub fn from_raw(raw: u16) -> Self {
        match raw {
            Self::RAW_POLL => Self::Poll,
            Self::RAW_INFINITE => Self::Infinite,
            ms => Self::Millis(ms),
        }
    }

    pub fn as_raw(self) -> u16 {
        match self {
            Self::Poll => Self::RAW_POLL,
            Self::Millis(ms) => ms,
            Self::Infinite => Self::RAW_INFINITE,
        }
    }

    pub fn is_poll(self) -> bool {
        matches!(self, Self::Poll | Self::Millis(0))
    }

    /// Relative wait bound, `None` for infinite
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Poll => Some(Duration::ZERO),
            Self::Millis(ms) => Some(Duration::from_millis(ms as u64)),
            Self::Infinite => None,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::Poll
    }
}

/// Trap status codes returned in R0
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok = 0x0000,
    WouldBlock = 0x0001,
    InvalidHandle = 0x0002,
    NoData = 0x0003,
    MsgTooLarge = 0x0004,
    NoDescriptor = 0x0005,
    // 0x0006 reserved
    Timeout = 0x0007,
    InternalError = 0x00FF,
}

impl Status {
    pub fn as_raw(self) -> u16 {
        self as u16
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0000 => Self::Ok,
            0x0001 => Self::WouldBlock,
            0x0002 => Self::InvalidHandle,
            0x0003 => Self::NoData,
            0x0004 => Self::MsgTooLarge,
            0x0005 => Self::NoDescriptor,
            0x0007 => Self::Timeout,
            0x00FF => Self::InternalError,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Whether a caller may reasonably retry
    pub fn is_transient(self) -> bool {
        matches!(self, Self::WouldBlock | Self::Timeout | Self::NoData)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::WouldBlock => "would block",
            Self::InvalidHandle => "invalid handle",
            Self::NoData => "no data",
            Self::MsgTooLarge => "message too large",
            Self::NoDescriptor => "no descriptor",
            Self::Timeout => "timeout",
            Self::InternalError => "internal error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
