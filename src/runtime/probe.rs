//! Runtime status probe
//!
//! Queries the container runtime for the worker processes of one service
//! and maps runtime-reported ports back to logical node indices via the
//! `<project>_<service>_<index>` container naming convention. An empty
//! listing means zero instances - that is how a stage looks before its
//! first scale-up and must not be an error. A non-empty line that does not
//! match the convention means the runtime's output format changed, which is
//! fatal: operators must be alerted rather than nodes silently dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use super::{render_command, CommandRunner, RuntimeError, DEFAULT_COMMAND_TIMEOUT};

/// One running worker of a service: logical index plus published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInstance {
    pub index: u32,
    pub port: u16,
}

/// Probe and scale commands against a compose project directory.
pub struct ComposeProbe {
    runner: Arc<dyn CommandRunner>,
    compose_dir: PathBuf,
    timeout: Duration,
}

impl ComposeProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, compose_dir: PathBuf) -> Self {
        Self {
            runner,
            compose_dir,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// List the running instances of a service, sorted by index.
    pub async fn list_instances(
        &self,
        service: &str,
    ) -> Result<Vec<ServiceInstance>, RuntimeError> {
        let args: Vec<String> = vec!["compose".into(), "ps".into(), service.into()];
        let output = self
            .runner
            .run("docker", &args, Some(&self.compose_dir), self.timeout)
            .await?;
        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                command: render_command("docker", &args),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        let instances = parse_listing(&output.stdout, service)?;
        debug!(
            "{} instance(s) of `{}` running",
            instances.len(),
            service
        );
        Ok(instances)
    }

    /// Ask the runtime to converge a service to the desired count. Always
    /// declarative - callers re-query instead of assuming the count was
    /// achieved.
    pub async fn scale(&self, service: &str, count: u32) -> Result<(), RuntimeError> {
        let args: Vec<String> = vec![
            "compose".into(),
            "up".into(),
            "-d".into(),
            "--scale".into(),
            format!("{}={}", service, count),
            service.into(),
        ];
        let output = self
            .runner
            .run("docker", &args, Some(&self.compose_dir), self.timeout)
            .await?;
        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                command: render_command("docker", &args),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Parse the tabular process listing for one service. Pure function - no I/O.
pub fn parse_listing(output: &str, service: &str) -> Result<Vec<ServiceInstance>, RuntimeError> {
    let name_re = Regex::new(&format!(
        r"^\S+_{}_(\d+)$",
        regex::escape(service)
    ))
    .unwrap();
    let port_re = Regex::new(r"(?:\d{1,3}(?:\.\d{1,3}){3}|\[[0-9A-Fa-f:.]+\]):(\d+)->\d+/tcp")
        .unwrap();

    let mut instances = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || is_header(line) {
            continue;
        }
        let name = line.split_whitespace().next().unwrap_or_default();
        let index: u32 = name_re
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| RuntimeError::MalformedListing(line.to_string()))?;
        let port: u16 = port_re
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| RuntimeError::MalformedListing(line.to_string()))?;
        instances.push(ServiceInstance { index, port });
    }
    instances.sort_by_key(|i| i.index);
    Ok(instances)
}

fn is_header(line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or_default();
    first.eq_ignore_ascii_case("name") || line.bytes().all(|b| b == b'-' || b == b' ')
}
