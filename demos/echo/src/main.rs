//! Echo demo for Tern.
//!
//! Run a server in one terminal and point clients at it from another:
//!
//! ```text
//! cargo run -p echo -- server --bind 127.0.0.1:9000
//! cargo run -p echo -- client --addr 127.0.0.1:9000 --message hi --count 3
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tern::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PROTOCOL: &str = "tern.demo.Echo";
const MAX_MESSAGE_LEN: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "echo")]
#[command(about = "Echo server and client over the Hadoop IPC wire protocol")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve echo calls until killed.
    Server {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9000")]
        bind: SocketAddr,

        /// Number of handler threads
        #[arg(long, default_value = "4")]
        handlers: usize,

        /// Number of reader threads
        #[arg(long, default_value = "1")]
        readers: usize,
    },

    /// Send messages to a running server.
    Client {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:9000")]
        addr: SocketAddr,

        /// Message to send
        #[arg(short, long, default_value = "world")]
        message: String,

        /// Number of calls to make
        #[arg(short, long, default_value = "1")]
        count: usize,

        /// Identity to present in the connection header
        #[arg(long)]
        identity: Option<String>,

        /// Per-call timeout in milliseconds (0 waits forever)
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

fn main() -> Result<(), IpcError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    match Args::parse().command {
        Command::Server {
            bind,
            handlers,
            readers,
        } => serve(bind, handlers, readers),
        Command::Client {
            addr,
            message,
            count,
            identity,
            timeout_ms,
        } => send(addr, &message, count, identity.as_deref(), Duration::from_millis(timeout_ms)),
    }
}

fn serve(bind: SocketAddr, handlers: usize, readers: usize) -> Result<(), IpcError> {
    let served = Arc::new(AtomicU64::new(0));
    let config = ServerConfig::default()
        .bind_addr(bind)
        .handler_count(handlers)
        .reader_count(readers);

    let server = Server::bind(config, StringCodec, StringCodec, {
        let served = served.clone();
        move |ctx: &CallContext, message: String| -> Result<String, DispatchError> {
            if message.is_empty() {
                return Err(DispatchError::with_class("EmptyMessage", "message cannot be empty"));
            }
            if message.len() > MAX_MESSAGE_LEN {
                return Err(DispatchError::with_class(
                    "MessageTooLong",
                    format!("message too long: {} bytes (max {MAX_MESSAGE_LEN})", message.len()),
                ));
            }

            let count = served.fetch_add(1, Ordering::Relaxed) + 1;
            let who = ctx.identity.as_deref().unwrap_or("anonymous");
            Ok(format!("#{count} {message} (from {who} at {})", ctx.peer))
        }
    })?;
    server.start()?;
    info!(addr = %server.local_addr(), handlers, readers, "Echo server listening");

    loop {
        thread::park();
    }
}

fn send(
    addr: SocketAddr,
    message: &str,
    count: usize,
    identity: Option<&str>,
    timeout: Duration,
) -> Result<(), IpcError> {
    let client = Client::new(ClientConfig::default(), StringCodec, StringCodec);

    for i in 0..count {
        let started = Instant::now();
        match client.call(&message.to_string(), addr, Some(PROTOCOL), identity, timeout) {
            Ok(reply) => info!(call = i, elapsed = ?started.elapsed(), %reply, "Reply"),
            Err(IpcError::Remote { class, message, fatal: false }) => {
                info!(call = i, %class, %message, "Server rejected the call");
            }
            Err(e) => {
                client.stop();
                return Err(e);
            }
        }
    }

    info!(connections = client.connection_count(), "Done");
    client.stop();
    Ok(())
}
