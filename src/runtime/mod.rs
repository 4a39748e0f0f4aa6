//! External process invocation
//!
//! Every shell command the engine issues (runtime queries, scale commands,
//! proxy reloads) goes through the [`CommandRunner`] trait so tests can
//! substitute a scripted collaborator. Invocations are synchronous from the
//! caller's point of view and bounded by a timeout; a command that exceeds
//! it is a failure, not something to ignore.

pub mod probe;

pub use probe::{parse_listing, ComposeProbe, ServiceInstance};

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Default bound for external commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from external processes and their output.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("unrecognized process listing line: `{0}`")]
    MalformedListing(String),
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Injected collaborator that runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError>;
}

/// Production runner backed by `tokio::process`.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        let rendered = render_command(command, args);
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => Err(RuntimeError::Timeout {
                command: rendered,
                timeout_secs: timeout.as_secs(),
            }),
            Ok(Err(source)) => Err(RuntimeError::Spawn {
                command: rendered,
                source,
            }),
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }
}

/// One-line rendering of a command for log and error messages.
pub fn render_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}
