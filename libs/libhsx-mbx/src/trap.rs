//! Register-level trap ABI for SVC module `0x05`
//!
//! | Call  | Inputs                                               | Outputs                  |
//! |-------|------------------------------------------------------|--------------------------|
//! | OPEN  | R1 name ptr, R2 mode                                 | R1 handle                |
//! | BIND  | R1 name ptr, R2 capacity, R3 mode                    | R1 handle                |
//! | SEND  | R1 handle, R2 ptr, R3 len, R4 flags, R5 chan, R6 tmo | R1 bytes accepted        |
//! | RECV  | R1 handle, R2 buf, R3 max, R4 tmo, R5 info ptr       | R1 len, R2 flags, R3 chan, R4 src |
//! | PEEK  | R1 handle                                            | R1 depth, R2 used, R3 next len |
//! | TAP   | R1 handle, R2 bit0 enable                            |                          |
//! | CLOSE | R1 handle                                            |                          |
//!
//! R0 always carries the status. Byte layouts are only touched here.

use tracing::debug;

use crate::abi::{Function, Status, Timeout, MAX_NAME_BYTES, MODULE_ID};
use crate::dispatch::Dispatcher;
use crate::error::{MailboxError, Result};
use crate::message::RecvInfo;
use crate::{HandleId, Pid};

/// Caller address space as seen by the trap handler
pub trait UserMemory {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Validate that `[addr, addr + len)` lies inside caller memory
    fn check(&self, addr: u32, len: usize) -> Result<()> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes().len() => Ok(()),
            _ => Err(MailboxError::BadAddress(addr)),
        }
    }

    fn read(&self, addr: u32, len: usize) -> Result<&[u8]> {
        self.check(addr, len)?;
        let start = addr as usize;
        Ok(&self.bytes()[start..start + len])
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.check(addr, data.len())?;
        let start = addr as usize;
        self.bytes_mut()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    fn read_c_string(&self, addr: u32, max_len: usize) -> Result<String> {
        let start = addr as usize;
        let memory = self.bytes();
        if start >= memory.len() {
            return Err(MailboxError::BadAddress(addr));
        }

        let window = &memory[start..memory.len().min(start + max_len + 1)];
        let Some(end) = window.iter().position(|&b| b == 0) else {
            if window.len() > max_len {
                return Err(MailboxError::InvalidName(format!("name exceeds {} bytes", max_len)));
            }
            // Ran off the end of caller memory
            return Err(MailboxError::BadAddress(addr));
        };

        String::from_utf8(window[..end].to_vec())
            .map_err(|_| MailboxError::InvalidName("name is not valid UTF-8".into()))
    }
}

impl UserMemory for [u8] {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl UserMemory for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// Trap context: selectors plus the general registers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub module: u8,
    pub function: u8,
    pub regs: [u32; 8],
}

impl TrapFrame {
    pub fn new(function: Function, args: &[u32]) -> Self {
        let mut regs = [0u32; 8];
        for (slot, arg) in regs[1..].iter_mut().zip(args) {
            *slot = *arg;
        }
        Self {
            module: MODULE_ID,
            function: function as u8,
            regs,
        }
    }

    pub fn status(&self) -> Option<Status> {
        u16::try_from(self.regs[0]).ok().and_then(Status::from_raw)
    }

    fn set_status(&mut self, status: Status) {
        self.regs[0] = status.as_raw() as u32;
    }

    fn set_results(&mut self, values: &[u32]) {
        for (slot, value) in self.regs[1..].iter_mut().zip(values) {
            *slot = *value;
        }
    }
}

/// A decoded trap request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrapCall {
    Open {
        name: String,
        mode: u16,
    },
    Bind {
        name: String,
        capacity: u16,
        mode: u16,
    },
    Send {
        handle: HandleId,
        payload: Vec<u8>,
        flags: u16,
        channel: u16,
        timeout: Timeout,
    },
    Recv {
        handle: HandleId,
        buffer: u32,
        max_len: usize,
        timeout: Timeout,
        /// Out-parameter block address, 0 for none
        info: u32,
    },
    Peek {
        handle: HandleId,
    },
    Tap {
        handle: HandleId,
        enable: bool,
    },
    Close {
        handle: HandleId,
    },
}

impl TrapCall {
    /// Decode registers (and any caller memory they point at)
    pub fn decode<M: UserMemory + ?Sized>(pid: Pid, frame: &TrapFrame, mem: &M) -> Result<Self> {
        if frame.module != MODULE_ID {
            return Err(MailboxError::Internal(format!(
                "trap for module 0x{:02x} routed to mailbox",
                frame.module
            )));
        }

        let r = &frame.regs;
        let handle = |reg: u32| {
            HandleId::try_from(reg).map_err(|_| MailboxError::InvalidHandle {
                pid,
                handle: HandleId::MAX,
            })
        };
        let mode = |reg: u32| u16::try_from(reg).map_err(|_| MailboxError::InvalidMode(reg));
        let half = |reg: u32| (reg & 0xFFFF) as u16;
        // Out-of-range timeouts saturate to "wait forever"
        let timeout = |reg: u32| u16::try_from(reg).map_or(Timeout::Infinite, Timeout::from_raw);

        Ok(match Function::try_from(frame.function)? {
            Function::Open => Self::Open {
                name: mem.read_c_string(r[1], MAX_NAME_BYTES)?,
                mode: mode(r[2])?,
            },
            Function::Bind => Self::Bind {
                name: mem.read_c_string(r[1], MAX_NAME_BYTES)?,
                capacity: u16::try_from(r[2]).map_err(|_| MailboxError::InvalidCapacity(r[2]))?,
                mode: mode(r[3])?,
            },
            Function::Send => Self::Send {
                handle: handle(r[1])?,
                payload: mem.read(r[2], r[3] as usize)?.to_vec(),
                flags: half(r[4]),
                channel: half(r[5]),
                timeout: timeout(r[6]),
            },
            Function::Recv => Self::Recv {
                handle: handle(r[1])?,
                buffer: r[2],
                max_len: r[3] as usize,
                timeout: timeout(r[4]),
                info: r[5],
            },
            Function::Peek => Self::Peek { handle: handle(r[1])? },
            Function::Tap => Self::Tap {
                handle: handle(r[1])?,
                enable: r[2] & 1 != 0,
            },
            Function::Close => Self::Close { handle: handle(r[1])? },
        })
    }
}

impl Dispatcher {
    /// Service one mailbox trap for `pid`, writing results back into `frame`
    pub async fn handle_trap<M: UserMemory + ?Sized>(
        &self,
        pid: Pid,
        frame: &mut TrapFrame,
        mem: &mut M,
    ) -> Status {
        let call = match TrapCall::decode(pid, frame, &*mem) {
            Ok(call) => call,
            Err(err) => {
                debug!("pid {} trap 0x{:02x} rejected: {}", pid, frame.function, err);
                // RECV reports failures through its info block too
                if frame.function == Function::Recv as u8 && frame.module == MODULE_ID {
                    let _ = write_info(mem, frame.regs[5], RecvInfo::failed(err.status()));
                }
                return finish(frame, Err(err));
            }
        };

        let outcome = match call {
            TrapCall::Open { name, mode } => self.open(pid, &name, mode).await.map(|h| vec![h as u32]),
            TrapCall::Bind { name, capacity, mode } => self
                .bind(pid, &name, capacity, mode)
                .await
                .map(|h| vec![h as u32]),
            TrapCall::Send { handle, payload, flags, channel, timeout } => self
                .send(pid, handle, &payload, flags, channel, timeout)
                .await
                .map(|n| vec![n as u32]),
            TrapCall::Recv { handle, buffer, max_len, timeout, info } => {
                self.recv_trap(pid, mem, handle, buffer, max_len, timeout, info).await
            }
            TrapCall::Peek { handle } => self.peek(pid, handle).await.map(|p| {
                vec![p.depth as u32, p.bytes_used as u32, p.next_len as u32]
            }),
            TrapCall::Tap { handle, enable } => self.tap(pid, handle, enable).await.map(|_| vec![]),
            TrapCall::Close { handle } => self.close(pid, handle).await.map(|_| vec![]),
        };

        finish(frame, outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn recv_trap<M: UserMemory + ?Sized>(
        &self,
        pid: Pid,
        mem: &mut M,
        handle: HandleId,
        buffer: u32,
        max_len: usize,
        timeout: Timeout,
        info: u32,
    ) -> Result<Vec<u32>> {
        // Validate destinations before anything is consumed
        let checked = mem.check(buffer, max_len).and_then(|_| match info {
            0 => Ok(()),
            addr => mem.check(addr, RecvInfo::SIZE),
        });
        if let Err(err) = checked {
            let _ = write_info(mem, info, RecvInfo::failed(err.status()));
            return Err(err);
        }

        match self.recv(pid, handle, max_len, timeout).await {
            Ok(msg) => {
                mem.write(buffer, &msg.payload)?;
                write_info(mem, info, RecvInfo::from(&msg))?;
                Ok(vec![
                    msg.header.length as u32,
                    msg.header.flags.bits() as u32,
                    msg.header.channel as u32,
                    msg.header.src_id as u32,
                ])
            }
            Err(err) => {
                write_info(mem, info, RecvInfo::failed(err.status()))?;
                Err(err)
            }
        }
    }
}

fn write_info<M: UserMemory + ?Sized>(mem: &mut M, addr: u32, info: RecvInfo) -> Result<()> {
    if addr == 0 {
        return Ok(());
    }
    mem.write(addr, &info.encode())
}

fn finish(frame: &mut TrapFrame, outcome: Result<Vec<u32>>) -> Status {
    let status = match outcome {
        Ok(values) => {
            frame.set_results(&values);
            Status::Ok
        }
        Err(err) => err.status(),
    };
    frame.set_status(status);
    status
}
