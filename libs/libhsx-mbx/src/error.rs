//! Mailbox errors and their mapping onto trap status codes

use crate::abi::Status;
use crate::{HandleId, Pid};

/// Mailbox errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("operation would block")]
    WouldBlock,
    #[error("timed out")]
    Timeout,
    #[error("invalid handle {handle} for pid {pid}")]
    InvalidHandle { pid: Pid, handle: HandleId },
    #[error("handle {handle} not opened for {direction}")]
    PermissionDenied { handle: HandleId, direction: &'static str },
    #[error("handle {0} was not opened in tap mode")]
    TapUnsupported(HandleId),
    #[error("no data")]
    NoData,
    #[error("message of {size} bytes exceeds mailbox capacity {capacity}")]
    MessageTooLarge { size: usize, capacity: usize },
    #[error("invalid mailbox name: {0}")]
    InvalidName(String),
    #[error("invalid mode 0x{0:04x}")]
    InvalidMode(u32),
    #[error("invalid capacity {0}")]
    InvalidCapacity(u32),
    #[error("unknown mailbox {0}")]
    NotFound(String),
    #[error("mailbox {0} already bound with a different configuration")]
    AlreadyExists(String),
    #[error("descriptor pool exhausted")]
    DescriptorsExhausted,
    #[error("handle limit reached for pid {0}")]
    HandleQuota(Pid),
    #[error("bad user address 0x{0:04x}")]
    BadAddress(u32),
    #[error("unknown trap selector 0x{0:02x}")]
    UnknownFunction(u8),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MailboxError {
    /// Status class reported to the caller
    pub fn status(&self) -> Status {
        match self {
            Self::WouldBlock => Status::WouldBlock,
            Self::Timeout => Status::Timeout,
            Self::InvalidHandle { .. } | Self::PermissionDenied { .. } | Self::TapUnsupported(_) => {
                Status::InvalidHandle
            }
            Self::NoData => Status::NoData,
            Self::MessageTooLarge { .. } => Status::MsgTooLarge,
            Self::InvalidName(_)
            | Self::InvalidMode(_)
            | Self::InvalidCapacity(_)
            | Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::DescriptorsExhausted
            | Self::HandleQuota(_)
            | Self::BadAddress(_) => Status::NoDescriptor,
            Self::UnknownFunction(_) | Self::Internal(_) => Status::InternalError,
        }
    }

    /// Invariant violations that must halt the engine
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, MailboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(
            MailboxError::PermissionDenied { handle: 1, direction: "write" }.status(),
            Status::InvalidHandle
        );
        assert_eq!(MailboxError::AlreadyExists("app:x".into()).status(), Status::NoDescriptor);
        assert_eq!(MailboxError::HandleQuota(3).status(), Status::NoDescriptor);
        assert_eq!(
            MailboxError::MessageTooLarge { size: 80, capacity: 64 }.status(),
            Status::MsgTooLarge
        );
        assert!(MailboxError::Internal("ring accounting".into()).is_fatal());
        assert!(!MailboxError::Timeout.is_fatal());
    }
}
