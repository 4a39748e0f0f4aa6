//! Scripted collaborators shared by the integration tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use shepherd::bridge::{BridgeError, ProxyReloader};
use shepherd::deployer::{Deployer, DeployerError, Deployment};
use shepherd::runtime::{CommandOutput, CommandRunner, RuntimeError};

/// In-memory compose runtime. Holds per-service instance tables, answers
/// `docker compose ps` with a tabular listing and applies `--scale` by
/// rewriting the table, keeping the ports of surviving indices stable.
pub struct MockRuntime {
    services: Mutex<HashMap<String, Vec<(u32, u16)>>>,
    scale_calls: Mutex<Vec<(String, u32)>>,
    /// When set, `ps` output for any service is this text verbatim.
    pub broken_listing: Mutex<Option<String>>,
    /// Total `ps` invocations, incremented before any gating.
    pub ps_calls: AtomicUsize,
    ps_gate: Mutex<Option<Arc<Semaphore>>>,
    next_port: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            scale_calls: Mutex::new(Vec::new()),
            broken_listing: Mutex::new(None),
            ps_calls: AtomicUsize::new(0),
            ps_gate: Mutex::new(None),
            next_port: AtomicUsize::new(49000),
        }
    }

    /// Make every `ps` invocation wait for a permit on the returned
    /// semaphore, so a test can park a pass mid-flight.
    pub fn hold_ps(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.ps_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn set_instances(&self, service: &str, instances: Vec<(u32, u16)>) {
        self.services
            .lock()
            .unwrap()
            .insert(service.to_string(), instances);
    }

    pub fn scale_calls(&self) -> Vec<(String, u32)> {
        self.scale_calls.lock().unwrap().clone()
    }

    fn listing(&self, service: &str) -> String {
        if let Some(broken) = self.broken_listing.lock().unwrap().clone() {
            return broken;
        }
        let services = self.services.lock().unwrap();
        let mut out = String::from("NAME                COMMAND        STATE   PORTS\n");
        for (index, port) in services.get(service).into_iter().flatten() {
            out.push_str(&format!(
                "web_{}_{}   /usr/bin/run   Up      0.0.0.0:{}->8080/tcp\n",
                service, index, port
            ));
        }
        out
    }

    fn apply_scale(&self, service: &str, count: u32) {
        let mut services = self.services.lock().unwrap();
        let instances = services.entry(service.to_string()).or_default();
        instances.retain(|(index, _)| *index <= count);
        for index in 1..=count {
            if !instances.iter().any(|(i, _)| *i == index) {
                let port = self.next_port.fetch_add(1, Ordering::SeqCst) as u16;
                instances.push((index, port));
            }
        }
        instances.sort_by_key(|(i, _)| *i);
    }
}

#[async_trait]
impl CommandRunner for MockRuntime {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        _cwd: Option<&Path>,
        _timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        assert_eq!(command, "docker");
        assert_eq!(args[0], "compose");
        let stdout = match args[1].as_str() {
            "ps" => {
                self.ps_calls.fetch_add(1, Ordering::SeqCst);
                let gate = self.ps_gate.lock().unwrap().clone();
                if let Some(gate) = gate {
                    gate.acquire().await.expect("gate closed").forget();
                }
                self.listing(&args[2])
            }
            "up" => {
                let spec = args
                    .iter()
                    .skip_while(|a| *a != "--scale")
                    .nth(1)
                    .expect("scale spec");
                let (service, count) = spec.split_once('=').expect("service=count");
                let count: u32 = count.parse().unwrap();
                self.scale_calls
                    .lock()
                    .unwrap()
                    .push((service.to_string(), count));
                self.apply_scale(service, count);
                String::new()
            }
            other => panic!("unexpected compose subcommand {}", other),
        };
        Ok(CommandOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

/// Counts reloads; flips to failure on demand.
pub struct CountingReloader {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl CountingReloader {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyReloader for CountingReloader {
    async fn reload(&self) -> Result<(), BridgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            Err(BridgeError::ReloadFailed("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Records deployer calls in order; `set_version` additionally snapshots
/// the proxy config file so tests can assert what the proxy was serving
/// at the moment the version switched.
pub struct MockDeployer {
    pub events: Mutex<Vec<String>>,
    pub deployments: HashMap<String, Deployment>,
    pub versions: Vec<String>,
    pub snapshot_path: PathBuf,
    pub snapshots: Mutex<Vec<String>>,
}

impl MockDeployer {
    pub fn new(snapshot_path: PathBuf) -> Self {
        let mut deployments = HashMap::new();
        deployments.insert(
            "shop-ui".to_string(),
            Deployment {
                group: "com.example.shop".to_string(),
                artifact: "shop-ui".to_string(),
                version: "1.4.2".to_string(),
                kind: "war".to_string(),
                error: None,
            },
        );
        Self {
            events: Mutex::new(Vec::new()),
            deployments,
            versions: vec!["1.4.2".to_string(), "2.0.0".to_string()],
            snapshot_path,
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    async fn deployments(
        &self,
        _base_url: &str,
    ) -> Result<HashMap<String, Deployment>, DeployerError> {
        self.events.lock().unwrap().push("deployments".to_string());
        Ok(self.deployments.clone())
    }

    async fn versions(
        &self,
        _base_url: &str,
        _group: &str,
        _artifact: &str,
    ) -> Result<Vec<String>, DeployerError> {
        self.events.lock().unwrap().push("versions".to_string());
        Ok(self.versions.clone())
    }

    async fn set_version(
        &self,
        _base_url: &str,
        name: &str,
        version: &str,
    ) -> Result<(), DeployerError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("set_version {} {}", name, version));
        let config = std::fs::read_to_string(&self.snapshot_path).unwrap_or_default();
        self.snapshots.lock().unwrap().push(config);
        Ok(())
    }

    async fn undeploy(&self, _base_url: &str, name: &str) -> Result<(), DeployerError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("undeploy {}", name));
        Ok(())
    }
}
