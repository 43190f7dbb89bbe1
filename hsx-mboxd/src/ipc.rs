//! IPC interface for the mailbox daemon
//!
//! Newline-delimited JSON over a Unix socket, one request per line.

use anyhow::{anyhow, Context, Result};
use libhsx_mbx::{
    HandleId, MailboxError, MailboxSnapshot, PeekInfo, Pid, Received, Status, StdioHandles,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Request payload encodings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// UTF-8 text, sent as-is
    Text(String),
    /// Hex-encoded bytes
    Hex(String),
}

impl Payload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RequestError> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Hex(digits) => Ok(hex::decode(digits)?),
        }
    }
}

/// Requests the daemon rejects before reaching the engine
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid hex payload: {0}")]
    BadHex(#[from] hex::FromHexError),
}

/// IPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Bind stdio and control mailboxes for a new task
    RegisterTask { pid: Pid },

    /// Release everything a task holds
    ReapTask { pid: Pid },

    /// Open an existing (or well-known) mailbox
    Open { pid: Pid, name: String, mode: u16 },

    /// Create or re-bind a mailbox
    Bind {
        pid: Pid,
        name: String,
        capacity: u16,
        mode: u16,
    },

    /// Send a message; `timeout` uses the trap encoding (0 = poll, 0xFFFF = forever)
    Send {
        pid: Pid,
        handle: HandleId,
        payload: Payload,
        #[serde(default)]
        flags: u16,
        #[serde(default)]
        channel: u16,
        #[serde(default)]
        timeout: u16,
    },

    /// Receive one message
    Recv {
        pid: Pid,
        handle: HandleId,
        #[serde(default = "default_max_len")]
        max_len: usize,
        #[serde(default)]
        timeout: u16,
    },

    /// Inspect a handle's queue
    Peek { pid: Pid, handle: HandleId },

    /// Toggle a tap handle
    Tap {
        pid: Pid,
        handle: HandleId,
        enable: bool,
    },

    /// Close a handle
    Close { pid: Pid, handle: HandleId },

    /// List every mailbox
    Snapshot,

    /// Clear a halted engine, dropping every mailbox and handle
    Reset,
}

fn default_max_len() -> usize {
    u16::MAX as usize
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Successful response with data
    Success { data: serde_json::Value },

    /// Error response; `code` is the trap status code
    Error { message: String, code: u16 },
}

impl IpcResponse {
    /// Create success response
    pub fn success<T: Serialize>(data: T) -> Self {
        Self::Success {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Create error response
    pub fn error(message: impl Into<String>, status: Status) -> Self {
        Self::Error {
            message: message.into(),
            code: status.as_raw(),
        }
    }

    /// Map an engine result onto a response
    pub fn from_result<T: Serialize>(result: Result<T, MailboxError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::error(e.to_string(), e.status()),
        }
    }
}

/// Handle returned by open/bind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleReply {
    pub handle: HandleId,
}

/// Bytes accepted by a send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReply {
    pub accepted: usize,
}

/// Outcome of a reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetReply {
    /// The engine had halted on an internal fault before the reset
    pub was_halted: bool,
}

/// A received message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvReply {
    pub length: u16,
    pub flags: u16,
    pub channel: u16,
    pub src_id: Pid,
    pub overrun: bool,
    /// Payload as hex
    pub hex: String,
    /// Payload as text, when it is valid UTF-8
    pub text: Option<String>,
    /// Daemon receive time (ISO 8601)
    pub received_at: String,
}

impl From<Received> for RecvReply {
    fn from(msg: Received) -> Self {
        Self {
            length: msg.header.length,
            flags: msg.header.flags.bits(),
            channel: msg.header.channel,
            src_id: msg.header.src_id,
            overrun: msg.overrun(),
            hex: hex::encode(&msg.payload),
            text: String::from_utf8(msg.payload).ok(),
            received_at: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
        }
    }
}

/// Handler for processing IPC requests
pub trait IpcHandler: Send + Sync {
    /// Handle an IPC request
    fn handle(&self, request: IpcRequest) -> impl std::future::Future<Output = IpcResponse> + Send;
}

/// Bind the daemon socket, replacing one left behind by an earlier run
fn bind_listener(socket_path: &Path) -> Result<UnixListener> {
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating socket directory {:?}", dir))?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!("Removed stale socket {:?}", socket_path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    UnixListener::bind(socket_path).with_context(|| format!("binding {:?}", socket_path))
}

/// Write one JSON frame and its terminating newline
async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode one request line; a malformed line gets an error reply instead
/// of dropping the connection
fn decode_request(line: &str) -> Result<IpcRequest, IpcResponse> {
    serde_json::from_str(line).map_err(|e| {
        IpcResponse::error(format!("Invalid request: {}", e), Status::NoDescriptor)
    })
}

/// IPC server
pub struct IpcServer<H: IpcHandler> {
    socket_path: PathBuf,
    handler: Arc<H>,
}

impl<H: IpcHandler + 'static> IpcServer<H> {
    pub fn new(socket_path: impl Into<PathBuf>, handler: H) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler: Arc::new(handler),
        }
    }

    /// Accept connections until the process exits; each gets its own task
    /// so a caller parked in a blocking recv never stalls the others
    pub async fn run(&self) -> Result<()> {
        let listener = bind_listener(&self.socket_path)?;
        info!("mboxd IPC listening on {:?}", self.socket_path);

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, handler).await {
                    error!("Connection dropped: {}", e);
                }
            });
        }
    }
}

/// Answer requests on one connection in order, one reply line per request line
async fn serve_connection<H: IpcHandler>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match decode_request(&line) {
            Ok(request) => {
                debug!("Request {:?}", request);
                handler.handle(request).await
            }
            Err(rejection) => rejection,
        };
        write_frame(&mut writer, &response).await?;
    }

    Ok(())
}

/// IPC client for connecting to mboxd
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// One request per connection; the daemon answers with a single line
    pub async fn exchange(&self, request: &IpcRequest) -> Result<IpcResponse> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connecting to mboxd at {:?}", self.socket_path))?;
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, request).await?;

        let reply = BufReader::new(reader)
            .lines()
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("mboxd closed the connection without replying"))?;
        Ok(serde_json::from_str(&reply)?)
    }

    /// Send a request and decode its data
    async fn call<T: serde::de::DeserializeOwned>(&self, request: IpcRequest) -> Result<T> {
        match self.exchange(&request).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { message, code } => {
                let status = Status::from_raw(code)
                    .map(|s| s.as_str())
                    .unwrap_or("unknown status");
                Err(anyhow!("{} ({})", message, status))
            }
        }
    }

    pub async fn register_task(&self, pid: Pid) -> Result<StdioHandles> {
        self.call(IpcRequest::RegisterTask { pid }).await
    }

    pub async fn reap_task(&self, pid: Pid) -> Result<usize> {
        self.call(IpcRequest::ReapTask { pid }).await
    }

    pub async fn open(&self, pid: Pid, name: &str, mode: u16) -> Result<HandleId> {
        let reply: HandleReply = self
            .call(IpcRequest::Open {
                pid,
                name: name.to_string(),
                mode,
            })
            .await?;
        Ok(reply.handle)
    }

    pub async fn bind(&self, pid: Pid, name: &str, capacity: u16, mode: u16) -> Result<HandleId> {
        let reply: HandleReply = self
            .call(IpcRequest::Bind {
                pid,
                name: name.to_string(),
                capacity,
                mode,
            })
            .await?;
        Ok(reply.handle)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        pid: Pid,
        handle: HandleId,
        payload: Payload,
        flags: u16,
        channel: u16,
        timeout: u16,
    ) -> Result<usize> {
        let reply: SendReply = self
            .call(IpcRequest::Send {
                pid,
                handle,
                payload,
                flags,
                channel,
                timeout,
            })
            .await?;
        Ok(reply.accepted)
    }

    pub async fn recv(
        &self,
        pid: Pid,
        handle: HandleId,
        max_len: usize,
        timeout: u16,
    ) -> Result<RecvReply> {
        self.call(IpcRequest::Recv {
            pid,
            handle,
            max_len,
            timeout,
        })
        .await
    }

    pub async fn peek(&self, pid: Pid, handle: HandleId) -> Result<PeekInfo> {
        self.call(IpcRequest::Peek { pid, handle }).await
    }

    pub async fn tap(&self, pid: Pid, handle: HandleId, enable: bool) -> Result<()> {
        let _: serde_json::Value = self.call(IpcRequest::Tap { pid, handle, enable }).await?;
        Ok(())
    }

    pub async fn close(&self, pid: Pid, handle: HandleId) -> Result<()> {
        let _: serde_json::Value = self.call(IpcRequest::Close { pid, handle }).await?;
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<Vec<MailboxSnapshot>> {
        self.call(IpcRequest::Snapshot).await
    }

    /// Returns whether the engine had halted
    pub async fn reset(&self) -> Result<bool> {
        let reply: ResetReply = self.call(IpcRequest::Reset).await?;
        Ok(reply.was_halted)
    }
}
