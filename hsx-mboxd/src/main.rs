//! mboxd - HSX mailbox daemon
//!
//! Hosts one mailbox engine instance and exposes it to host-side tooling
//! (shell, debugger, test harness) over a Unix socket.

mod config;
mod ipc;

use crate::config::MboxdConfig;
use crate::ipc::{
    HandleReply, IpcHandler, IpcRequest, IpcResponse, IpcServer, RecvReply, ResetReply,
    SendReply,
};
use anyhow::Result;
use clap::Parser;
use libhsx_mbx::{Dispatcher, MailboxEvent, Profile, Status, Timeout};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// HSX mailbox daemon
#[derive(Parser, Debug)]
#[command(name = "mboxd", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/hsx/mboxd.toml")]
    config: PathBuf,

    /// Resource profile (desktop, embedded); overrides [mailbox] limits
    #[arg(short, long, env = "HSX_MAILBOX_PROFILE")]
    profile: Option<Profile>,

    /// Socket path (overrides configuration)
    #[arg(short, long)]
    socket: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

/// IPC handler implementation
struct MboxdHandler {
    mbx: Dispatcher,
}

impl IpcHandler for MboxdHandler {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::RegisterTask { pid } => {
                IpcResponse::from_result(self.mbx.register_task(pid).await)
            }

            IpcRequest::ReapTask { pid } => IpcResponse::from_result(self.mbx.reap_task(pid).await),

            IpcRequest::Open { pid, name, mode } => IpcResponse::from_result(
                self.mbx
                    .open(pid, &name, mode)
                    .await
                    .map(|handle| HandleReply { handle }),
            ),

            IpcRequest::Bind {
                pid,
                name,
                capacity,
                mode,
            } => IpcResponse::from_result(
                self.mbx
                    .bind(pid, &name, capacity, mode)
                    .await
                    .map(|handle| HandleReply { handle }),
            ),

            IpcRequest::Send {
                pid,
                handle,
                payload,
                flags,
                channel,
                timeout,
            } => {
                let bytes = match payload.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => return IpcResponse::error(e.to_string(), Status::NoDescriptor),
                };
                IpcResponse::from_result(
                    self.mbx
                        .send(pid, handle, &bytes, flags, channel, Timeout::from_raw(timeout))
                        .await
                        .map(|accepted| SendReply { accepted }),
                )
            }

            IpcRequest::Recv {
                pid,
                handle,
                max_len,
                timeout,
            } => IpcResponse::from_result(
                self.mbx
                    .recv(pid, handle, max_len, Timeout::from_raw(timeout))
                    .await
                    .map(RecvReply::from),
            ),

            IpcRequest::Peek { pid, handle } => {
                IpcResponse::from_result(self.mbx.peek(pid, handle).await)
            }

            IpcRequest::Tap {
                pid,
                handle,
                enable,
            } => IpcResponse::from_result(
                self.mbx
                    .tap(pid, handle, enable)
                    .await
                    .map(|()| serde_json::json!({ "enabled": enable })),
            ),

            IpcRequest::Close { pid, handle } => IpcResponse::from_result(
                self.mbx
                    .close(pid, handle)
                    .await
                    .map(|()| serde_json::json!({ "closed": handle })),
            ),

            IpcRequest::Snapshot => IpcResponse::success(self.mbx.snapshot().await),

            IpcRequest::Reset => {
                let was_halted = self.mbx.is_halted().await;
                if was_halted {
                    warn!("Resetting halted engine");
                } else {
                    info!("Resetting engine");
                }
                self.mbx.reset().await;
                IpcResponse::success(ResetReply { was_halted })
            }
        }
    }
}

/// Log the engine event stream until the engine goes away
async fn trace_events(mut events: tokio::sync::broadcast::Receiver<MailboxEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(target: "mboxd::events", "{}", json),
                Err(e) => warn!("Unserializable event {:?}: {}", event, e),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event tracer lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// The config file with command-line overrides applied
fn effective_config(args: &Args) -> Result<MboxdConfig> {
    let mut config = MboxdConfig::load(&args.config)?;
    if let Some(profile) = args.profile {
        config.apply_profile(profile);
    }
    if let Some(socket) = &args.socket {
        config.daemon.socket_path = socket.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = effective_config(&args)?;

    if args.init_config {
        config.save(&args.config)?;
        println!("Wrote {}", args.config.display());
        return Ok(());
    }

    // Initialize logging
    let log_level = if args.debug {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .init();

    info!("mboxd v{} starting", VERSION);
    info!("Configuration loaded from {:?}", args.config);
    info!(
        "Limits: {} descriptors, {} handles per task, capacity {}..={} bytes",
        config.mailbox.max_descriptors,
        config.mailbox.handle_limit_per_pid,
        config.mailbox.default_capacity,
        config.mailbox.max_capacity
    );

    let mbx = Dispatcher::new(config.mailbox.clone());

    if config.daemon.trace_events {
        tokio::spawn(trace_events(mbx.subscribe_events()));
    }

    let handler = MboxdHandler { mbx };
    let server = IpcServer::new(&config.daemon.socket_path, handler);

    info!("mboxd ready");
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Payload;
    use libhsx_mbx::{MailboxConfig, Mode};

    fn handler() -> MboxdHandler {
        MboxdHandler {
            mbx: Dispatcher::new(MailboxConfig::default()),
        }
    }

    fn data(response: IpcResponse) -> serde_json::Value {
        match response {
            IpcResponse::Success { data } => data,
            IpcResponse::Error { message, code } => panic!("error {}: {}", code, message),
        }
    }

    #[tokio::test]
    async fn test_send_and_recv_through_handler() {
        let h = handler();
        let owner = data(
            h.handle(IpcRequest::Bind {
                pid: 1,
                name: "app:demo".into(),
                capacity: 64,
                mode: Mode::RDWR.bits(),
            })
            .await,
        )["handle"]
            .as_u64()
            .unwrap() as u16;

        let sent = data(
            h.handle(IpcRequest::Send {
                pid: 1,
                handle: owner,
                payload: Payload::Text("hello".into()),
                flags: 0,
                channel: 4,
                timeout: 0,
            })
            .await,
        );
        assert_eq!(sent["accepted"], 5);

        let msg = data(
            h.handle(IpcRequest::Recv {
                pid: 1,
                handle: owner,
                max_len: 64,
                timeout: 0,
            })
            .await,
        );
        assert_eq!(msg["text"], "hello");
        assert_eq!(msg["hex"], "68656c6c6f");
        assert_eq!(msg["channel"], 4);
        assert_eq!(msg["overrun"], false);
    }

    #[tokio::test]
    async fn test_errors_carry_trap_status() {
        let h = handler();
        let response = h
            .handle(IpcRequest::Recv {
                pid: 1,
                handle: 9,
                max_len: 64,
                timeout: 0,
            })
            .await;
        match response {
            IpcResponse::Error { code, .. } => assert_eq!(code, Status::InvalidHandle.as_raw()),
            other => panic!("unexpected {:?}", other),
        }

        let response = h
            .handle(IpcRequest::Send {
                pid: 1,
                handle: 1,
                payload: Payload::Hex("not hex".into()),
                flags: 0,
                channel: 0,
                timeout: 0,
            })
            .await;
        assert!(matches!(response, IpcResponse::Error { code: 5, .. }));
    }

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let h = handler();
        let stdio = data(h.handle(IpcRequest::RegisterTask { pid: 7 }).await);
        assert_eq!(stdio["stdout"], 2);

        let snapshot = data(h.handle(IpcRequest::Snapshot).await);
        let names: Vec<&str> = snapshot
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"pid:7"));
        assert!(names.contains(&"svc:stdio.err@7"));

        let closed = data(h.handle(IpcRequest::ReapTask { pid: 7 }).await);
        assert_eq!(closed, 3);
        assert!(data(h.handle(IpcRequest::Snapshot).await)
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_engine() {
        let h = handler();
        data(h.handle(IpcRequest::RegisterTask { pid: 3 }).await);
        assert!(!data(h.handle(IpcRequest::Snapshot).await)
            .as_array()
            .unwrap()
            .is_empty());

        let reply = data(h.handle(IpcRequest::Reset).await);
        assert_eq!(reply["was_halted"], false);
        assert!(data(h.handle(IpcRequest::Snapshot).await)
            .as_array()
            .unwrap()
            .is_empty());

        // Handles from before the reset are gone
        let response = h.handle(IpcRequest::Close { pid: 3, handle: 1 }).await;
        assert!(matches!(response, IpcResponse::Error { .. }));
    }

    #[test]
    fn test_init_config_writes_effective_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mboxd.toml");
        let args = Args::try_parse_from([
            "mboxd",
            "--init-config",
            "--profile",
            "embedded",
            "--socket",
            "/tmp/mboxd-init.sock",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();
        assert!(args.init_config);

        effective_config(&args).unwrap().save(&args.config).unwrap();
        let written = MboxdConfig::load(&path).unwrap();
        assert_eq!(written.mailbox, Profile::Embedded.config());
        assert_eq!(written.daemon.socket_path, "/tmp/mboxd-init.sock");
    }
}
