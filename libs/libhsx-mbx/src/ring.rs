//! Mailbox ring buffer store
//!
//! Fixed-capacity FIFO of framed messages. Capacity is accounted in framed
//! bytes (header + payload) and never changes after creation.

use std::collections::VecDeque;

use crate::error::{MailboxError, Result};
use crate::message::{framed_size, Frame, MessageHeader};

/// Ring buffer holding whole frames
#[derive(Debug, Clone)]
pub struct RingBuffer {
    /// Total capacity in framed bytes
    capacity: usize,
    /// Framed bytes currently queued
    used: usize,
    /// Queued frames, oldest first
    frames: VecDeque<Frame>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            frames: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.capacity - self.used
    }

    /// Number of queued messages
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether a frame of `cost` bytes can be admitted right now
    pub fn has_room(&self, cost: usize) -> bool {
        cost <= self.free()
    }

    /// Check a payload against capacity without touching the ring
    pub fn check_size(&self, payload_len: usize) -> Result<usize> {
        let cost = framed_size(payload_len);
        if cost > self.capacity {
            return Err(MailboxError::MessageTooLarge {
                size: cost,
                capacity: self.capacity,
            });
        }
        Ok(cost)
    }

    /// Append a frame. All or nothing: a frame that does not fit is refused
    /// with `WouldBlock` (or `MessageTooLarge` if it can never fit).
    pub fn push(&mut self, frame: Frame) -> Result<()> {
        if frame.header.length as usize != frame.payload.len() {
            return Err(MailboxError::Internal(format!(
                "header length {} does not match payload of {} bytes",
                frame.header.length,
                frame.payload.len()
            )));
        }

        let cost = self.check_size(frame.payload.len())?;
        if !self.has_room(cost) {
            return Err(MailboxError::WouldBlock);
        }

        self.used += cost;
        self.frames.push_back(frame);
        Ok(())
    }

    /// Remove the oldest frame
    pub fn pop(&mut self) -> Result<Option<Frame>> {
        let Some(frame) = self.frames.pop_front() else {
            return Ok(None);
        };

        self.used = self.used.checked_sub(frame.cost()).ok_or_else(|| {
            MailboxError::Internal(format!(
                "ring accounting underflow: used {} < frame {}",
                self.used,
                frame.cost()
            ))
        })?;

        Ok(Some(frame))
    }

    /// Oldest frame without removing it
    pub fn front(&self) -> Option<&Frame> {
        self.frames.front()
    }

    /// Header of the oldest frame
    pub fn front_header(&self) -> Option<MessageHeader> {
        self.frames.front().map(|f| f.header)
    }

    /// Drop every queued frame, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        self.used = 0;
        dropped
    }
}
