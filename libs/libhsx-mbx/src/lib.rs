//! # libhsx-mbx
//!
//! Executive-side mailbox engine for the HSX runtime (SVC module `0x05`).
//!
//! Tasks exchange framed byte messages through named, capacity-bounded
//! mailboxes. The engine is split into:
//! - [`message`] - wire header and framed messages
//! - [`ring`] - fixed-capacity FIFO store per mailbox
//! - [`namespace`] - name parsing and the mailbox registry
//! - [`handle`] - per-task handle tables
//! - [`mailbox`] - a single mailbox: primary queue plus subscribers
//! - [`fanout`] - tap and fan-out subscriber rings
//! - [`manager`] - the non-blocking core that ties the above together
//! - [`sched`] - the suspend/wake seam used for blocking calls
//! - [`dispatch`] - blocking/timeout policy on top of the core
//! - [`trap`] - register-level trap ABI marshalling
//!
//! ## Usage
//!
//! ```rust,no_run
//! use libhsx_mbx::{Dispatcher, MailboxConfig, Mode, Timeout};
//!
//! # async fn demo() -> libhsx_mbx::Result<()> {
//! let mbx = Dispatcher::new(MailboxConfig::default());
//! let owner = mbx.bind(1, "app:demo", 64, Mode::RDWR.bits()).await?;
//! let reader = mbx.open(2, "app:demo", Mode::RDONLY.bits()).await?;
//! mbx.send(1, owner, b"ping", 0, 0, Timeout::Poll).await?;
//! let msg = mbx.recv(2, reader, 64, Timeout::Infinite).await?;
//! assert_eq!(msg.payload, b"ping");
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod fanout;
pub mod handle;
pub mod mailbox;
pub mod manager;
pub mod message;
pub mod namespace;
pub mod ring;
pub mod sched;
pub mod trap;

pub use abi::{Function, MessageFlags, Mode, Status, Timeout};
pub use config::{MailboxConfig, Profile};
pub use dispatch::Dispatcher;
pub use error::{MailboxError, Result};
pub use event::{EventBus, MailboxEvent};
pub use manager::{MailboxManager, MailboxSnapshot, PeekInfo, StdioHandles};
pub use message::{MessageHeader, Received, RecvInfo};
pub use namespace::{MailboxId, MailboxName, Namespace};
pub use sched::{Scheduler, WaitCondition, WaitQueues, WakeReason, WakeScope};
pub use trap::{TrapCall, TrapFrame, UserMemory};

/// Caller (task) identity as carried in message headers
pub type Pid = u16;

/// Caller-local handle number
pub type HandleId = u16;
