//! Reload bridge
//!
//! Reloading the reverse proxy needs privileges the reconciliation process
//! usually does not have. The bridge is a loopback-only control socket run
//! by a privileged process: it accepts newline-terminated ASCII commands
//! (`reload`, `exit`, `stop`) and answers with a one-line status. The
//! unprivileged side talks to it through [`BridgeClient`]; a process that
//! is itself privileged can skip the socket and use [`CommandReloader`]
//! directly. Both sides are stateless and every command is idempotent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::runtime::{CommandRunner, RuntimeError};

/// Default bound for the privileged reload command.
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("reload bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),

    #[error("proxy reload timed out after {0}s")]
    Timeout(u64),

    #[error("reload bridge refused: {0}")]
    Refused(String),
}

/// The one capability the engine needs from the proxy: reload it.
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    async fn reload(&self) -> Result<(), BridgeError>;
}

/// Runs the privileged reload command directly.
pub struct CommandReloader {
    runner: Arc<dyn CommandRunner>,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReloader {
    /// Build from a whitespace-separated command line, e.g. `nginx -s reload`.
    pub fn new(runner: Arc<dyn CommandRunner>, command_line: &str, timeout: Duration) -> Self {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "nginx".to_string());
        Self {
            runner,
            program,
            args: parts.collect(),
            timeout,
        }
    }
}

#[async_trait]
impl ProxyReloader for CommandReloader {
    async fn reload(&self) -> Result<(), BridgeError> {
        match self
            .runner
            .run(&self.program, &self.args, None, self.timeout)
            .await
        {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                let stderr = output.stderr.trim();
                Err(BridgeError::ReloadFailed(if stderr.is_empty() {
                    format!("exit status {}", output.status)
                } else {
                    stderr.to_string()
                }))
            }
            Err(RuntimeError::Timeout { timeout_secs, .. }) => Err(BridgeError::Timeout(timeout_secs)),
            Err(e) => Err(BridgeError::ReloadFailed(e.to_string())),
        }
    }
}

/// Client side of the bridge socket protocol. The whole exchange is
/// bounded by a timeout; a stalled bridge must not hang the caller.
pub struct BridgeClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_RELOAD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self) -> Result<(), BridgeError> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(b"reload\n").await?;
        let mut reply = String::new();
        BufReader::new(&mut stream).read_line(&mut reply).await?;
        match reply.trim() {
            "reloaded" => Ok(()),
            "" => Err(BridgeError::Refused("connection closed".to_string())),
            other => Err(BridgeError::Refused(other.to_string())),
        }
    }
}

#[async_trait]
impl ProxyReloader for BridgeClient {
    async fn reload(&self) -> Result<(), BridgeError> {
        tokio::time::timeout(self.timeout, self.exchange())
            .await
            .map_err(|_| BridgeError::Timeout(self.timeout.as_secs()))?
    }
}

/// Serve the bridge protocol until a `stop` command arrives. Connections
/// whose peer is not loopback are dropped without a reply.
pub async fn serve(
    listener: TcpListener,
    reloader: Arc<dyn ProxyReloader>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        if !peer.ip().is_loopback() {
            warn!("rejecting reload bridge connection from {}", peer);
            continue;
        }
        if handle_connection(stream, reloader.as_ref()).await? {
            info!("reload bridge stopping");
            return Ok(());
        }
    }
}

/// Handle one connection; returns true when the service should stop.
async fn handle_connection(
    stream: TcpStream,
    reloader: &dyn ProxyReloader,
) -> std::io::Result<bool> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        let reply = match command {
            "reload" => match reloader.reload().await {
                Ok(()) => "reloaded".to_string(),
                Err(e) => e.to_string(),
            },
            "exit" => "exiting".to_string(),
            "stop" => "stopping".to_string(),
            other => format!("unknown command: {}", other),
        };
        writer.write_all(format!("{}\n", reply).as_bytes()).await?;
        match command {
            "exit" => return Ok(false),
            "stop" => return Ok(true),
            _ => {}
        }
    }
    Ok(false)
}
