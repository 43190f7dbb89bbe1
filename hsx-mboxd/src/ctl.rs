//! mboxctl - mailbox daemon control utility

mod ipc;

use crate::ipc::{IpcClient, Payload};
use anyhow::Result;
use clap::{Parser, Subcommand};
use libhsx_mbx::{MessageFlags, Mode};

/// Mailbox daemon control utility
#[derive(Parser)]
#[command(name = "mboxctl", version, about = "Control the HSX mailbox daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/hsx/mboxd.sock")]
    socket: String,

    /// Task identity to act as
    #[arg(long, default_value_t = 0)]
    pid: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// List every mailbox
    List,

    /// Task lifecycle
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Open an existing or well-known mailbox
    Open {
        name: String,
        /// Access mode (r, w, rw, tap)
        #[arg(short, long, default_value = "rw")]
        mode: String,
    },

    /// Create a mailbox
    Bind {
        name: String,
        /// Ring capacity in bytes
        #[arg(short, long, default_value_t = 64)]
        capacity: u16,
        /// Access mode (r, w, rw, tap)
        #[arg(short, long, default_value = "rw")]
        mode: String,
        /// Fan-out delivery (drop or block)
        #[arg(long)]
        fanout: Option<String>,
    },

    /// Send a message
    Send {
        handle: u16,
        /// Payload text (or hex digits with --hex)
        payload: String,
        #[arg(long)]
        hex: bool,
        #[arg(long, default_value_t = 0)]
        channel: u16,
        /// Mark as stdout/stderr/oob
        #[arg(long)]
        flag: Vec<String>,
        /// Timeout in ms (0 = poll, 65535 = forever)
        #[arg(short, long, default_value_t = 0)]
        timeout: u16,
    },

    /// Receive one message
    Recv {
        handle: u16,
        #[arg(long, default_value_t = 1024)]
        max_len: usize,
        /// Timeout in ms (0 = poll, 65535 = forever)
        #[arg(short, long, default_value_t = 0)]
        timeout: u16,
    },

    /// Show queue state for a handle
    Peek { handle: u16 },

    /// Enable or disable a tap handle
    Tap {
        handle: u16,
        #[arg(long)]
        off: bool,
    },

    /// Close a handle
    Close { handle: u16 },

    /// Drop every mailbox and clear a halted engine
    Reset,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Bind stdio and control mailboxes for a task
    Register { pid: u16 },

    /// Release everything a task holds
    Reap { pid: u16 },
}

fn parse_mode(mode: &str) -> Result<Mode> {
    Ok(match mode {
        "r" | "ro" | "rdonly" => Mode::RDONLY,
        "w" | "wo" | "wronly" => Mode::WRONLY,
        "rw" | "rdwr" => Mode::RDWR,
        "tap" => Mode::TAP,
        other => anyhow::bail!("unknown mode: {}", other),
    })
}

fn parse_fanout(policy: &str) -> Result<Mode> {
    Ok(match policy {
        "drop" => Mode::FANOUT | Mode::FANOUT_DROP,
        "block" => Mode::FANOUT | Mode::FANOUT_BLOCK,
        other => anyhow::bail!("unknown fan-out policy: {}", other),
    })
}

fn parse_flags(flags: &[String]) -> Result<MessageFlags> {
    flags.iter().try_fold(MessageFlags::empty(), |acc, flag| {
        Ok(acc
            | match flag.as_str() {
                "stdout" => MessageFlags::STDOUT,
                "stderr" => MessageFlags::STDERR,
                "oob" => MessageFlags::OOB,
                other => anyhow::bail!("unknown flag: {}", other),
            })
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);
    let pid = cli.pid;

    match cli.command {
        Commands::List => {
            let mailboxes = client.snapshot().await?;
            println!(
                "{:<6} {:<24} {:>6} {:>6} {:>5} {:>4} {:<12} {}",
                "ID", "NAME", "CAP", "USED", "DEPTH", "REFS", "POLICY", "FLAGS"
            );
            for mbx in &mailboxes {
                let mut flags = Vec::new();
                if mbx.persistent {
                    flags.push("persistent".to_string());
                }
                if mbx.subscribers > 0 {
                    flags.push(format!("subs={}", mbx.subscribers));
                }
                if mbx.taps > 0 {
                    flags.push(format!("taps={}", mbx.taps));
                }
                println!(
                    "{:<6} {:<24} {:>6} {:>6} {:>5} {:>4} {:<12} {}",
                    mbx.id.0,
                    mbx.name,
                    mbx.capacity,
                    mbx.bytes_used,
                    mbx.depth,
                    mbx.refs,
                    format!("{:?}", mbx.policy),
                    flags.join(",")
                );
            }
            println!("\nTotal: {} mailboxes", mailboxes.len());
        }

        Commands::Task { command } => match command {
            TaskCommands::Register { pid } => {
                let stdio = client.register_task(pid).await?;
                println!("Task {} registered", pid);
                println!("  stdin:  handle {}", stdio.stdin);
                println!("  stdout: handle {}", stdio.stdout);
                println!("  stderr: handle {}", stdio.stderr);
            }

            TaskCommands::Reap { pid } => {
                let closed = client.reap_task(pid).await?;
                println!("Task {} reaped ({} handles closed)", pid, closed);
            }
        },

        Commands::Open { name, mode } => {
            let handle = client.open(pid, &name, parse_mode(&mode)?.bits()).await?;
            println!("{}", handle);
        }

        Commands::Bind {
            name,
            capacity,
            mode,
            fanout,
        } => {
            let mut mode = parse_mode(&mode)?;
            if let Some(policy) = fanout {
                mode |= parse_fanout(&policy)?;
            }
            let handle = client.bind(pid, &name, capacity, mode.bits()).await?;
            println!("{}", handle);
        }

        Commands::Send {
            handle,
            payload,
            hex,
            channel,
            flag,
            timeout,
        } => {
            let payload = if hex {
                Payload::Hex(payload)
            } else {
                Payload::Text(payload)
            };
            let flags = parse_flags(&flag)?;
            let accepted = client
                .send_message(pid, handle, payload, flags.bits(), channel, timeout)
                .await?;
            println!("Sent {} bytes", accepted);
        }

        Commands::Recv {
            handle,
            max_len,
            timeout,
        } => {
            let msg = client.recv(pid, handle, max_len, timeout).await?;
            println!("From:      pid {}", msg.src_id);
            println!("Channel:   {}", msg.channel);
            println!("Flags:     0x{:04x}", msg.flags);
            println!("Length:    {}", msg.length);
            if msg.overrun {
                println!("Overrun:   yes");
            }
            match msg.text {
                Some(ref text) => println!("Payload:   {}", text),
                None => println!("Payload:   {} (hex)", msg.hex),
            }
        }

        Commands::Peek { handle } => {
            let peek = client.peek(pid, handle).await?;
            println!("Depth:     {}", peek.depth);
            println!("Used:      {} / {} bytes", peek.bytes_used, peek.capacity);
            println!("Next:      {} bytes", peek.next_len);
        }

        Commands::Tap { handle, off } => {
            client.tap(pid, handle, !off).await?;
            println!("Tap {}", if off { "disabled" } else { "enabled" });
        }

        Commands::Close { handle } => {
            client.close(pid, handle).await?;
            println!("Closed handle {}", handle);
        }

        Commands::Reset => {
            if client.reset().await? {
                println!("Engine was halted; reset");
            } else {
                println!("Engine reset");
            }
        }
    }

    Ok(())
}
