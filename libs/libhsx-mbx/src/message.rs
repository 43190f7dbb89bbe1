//! Mailbox message framing
//!
//! Internally messages are tagged records; byte layouts only exist at the
//! trap boundary (`encode`/`decode`).

use serde::{Deserialize, Serialize};

use crate::abi::{MessageFlags, Status};
use crate::error::{MailboxError, Result};
use crate::Pid;

/// Message header, 8 bytes on the wire (little-endian)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Payload bytes following this header
    pub length: u16,
    /// `MessageFlags` bits
    pub flags: MessageFlags,
    /// Sender identity
    pub src_id: Pid,
    /// Logical channel
    pub channel: u16,
}

impl MessageHeader {
    pub const SIZE: usize = 8;

    pub fn new(length: u16, flags: MessageFlags, src_id: Pid, channel: u16) -> Self {
        Self { length, flags, src_id, channel }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.length.to_le_bytes());
        out[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[4..6].copy_from_slice(&self.src_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.channel.to_le_bytes());
        out
    }

    /// Decode a header; unknown flag bits are preserved
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(MailboxError::Internal(format!(
                "short header: {} bytes",
                bytes.len()
            )));
        }
        let word = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Ok(Self {
            length: word(0),
            flags: MessageFlags::from_bits_retain(word(2)),
            src_id: word(4),
            channel: word(6),
        })
    }
}

/// Ring-buffer cost of a message with `payload_len` bytes
pub fn framed_size(payload_len: usize) -> usize {
    MessageHeader::SIZE + payload_len
}

/// A queued message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Per-mailbox sequence number, assigned at admission
    pub seq: u64,
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Bytes this frame occupies in a ring
    pub fn cost(&self) -> usize {
        framed_size(self.payload.len())
    }

    /// Hand the frame to a receiver whose buffer holds `max_len` bytes.
    ///
    /// Bytes past `max_len` are discarded and OVERRUN is set.
    pub fn deliver(self, max_len: usize) -> Received {
        let mut header = self.header;
        let mut payload = self.payload;

        if payload.len() > max_len {
            payload.truncate(max_len);
            header.flags |= MessageFlags::OVERRUN;
        }
        header.length = payload.len() as u16;

        Received { header, payload }
    }
}

/// A message as handed to a receiver
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Received {
    /// Header snapshot; `length` is the number of delivered bytes
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Received {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn overrun(&self) -> bool {
        self.header.flags.contains(MessageFlags::OVERRUN)
    }
}

/// RECV out-parameter block: `{i32 status, i32 length, u32 flags, u32 channel, u32 src_id}`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvInfo {
    pub status: u16,
    pub length: u16,
    pub flags: u16,
    pub channel: u16,
    pub src_id: Pid,
}

impl RecvInfo {
    pub const SIZE: usize = 20;

    pub fn failed(status: Status) -> Self {
        Self { status: status.as_raw(), ..Self::default() }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&(self.status as i32).to_le_bytes());
        out[4..8].copy_from_slice(&(self.length as i32).to_le_bytes());
        out[8..12].copy_from_slice(&(self.flags as u32).to_le_bytes());
        out[12..16].copy_from_slice(&(self.channel as u32).to_le_bytes());
        out[16..20].copy_from_slice(&(self.src_id as u32).to_le_bytes());
        out
    }
}

impl From<&Received> for RecvInfo {
    fn from(msg: &Received) -> Self {
        Self {
            status: Status::Ok.as_raw(),
            length: msg.header.length,
            flags: msg.header.flags.bits(),
            channel: msg.header.channel,
            src_id: msg.header.src_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Frame {
        Frame {
            seq: 0,
            header: MessageHeader::new(payload.len() as u16, MessageFlags::STDOUT, 7, 3),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_header_wire_layout() {
        let header = MessageHeader::new(10, MessageFlags::OOB, 0x0102, 0x0304);
        let bytes = header.encode();
        assert_eq!(bytes, [10, 0, 0x04, 0, 0x02, 0x01, 0x04, 0x03]);
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
        assert!(MessageHeader::decode(&bytes[..6]).is_err());
    }

    #[test]
    fn test_deliver_truncates_and_flags_overrun() {
        let msg = frame(b"0123456789").deliver(4);
        assert_eq!(msg.payload, b"0123");
        assert_eq!(msg.header.length, 4);
        assert!(msg.overrun());
        assert!(msg.header.flags.contains(MessageFlags::STDOUT));
    }

    #[test]
    fn test_deliver_fits() {
        let msg = frame(b"hello").deliver(192);
        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.header.length, 5);
        assert!(!msg.overrun());
    }

    #[test]
    fn test_recv_info_layout() {
        let info = RecvInfo { status: 0, length: 5, flags: 8, channel: 2, src_id: 9 };
        let bytes = info.encode();
        assert_eq!(&bytes[4..8], &5i32.to_le_bytes());
        assert_eq!(&bytes[16..20], &9u32.to_le_bytes());
        assert_eq!(RecvInfo::failed(Status::Timeout).encode()[0], 7);
    }
}
