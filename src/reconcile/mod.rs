//! Reconciliation engine
//!
//! One pass re-derives everything from scratch: the declared topology, the
//! proxy config on disk, and the runtime's actual instances. Divergences
//! are corrected in this order - scale each stage to its declared count,
//! bring the stage's aggregate upstream and every deployment upstream in
//! line with the live endpoints, drop stale entries - and only if the
//! resulting config text differs from what was read is the file written
//! and the proxy reloaded. A pass that changes nothing touches nothing.
//!
//! Failures abort the pass; whatever was already applied stays applied and
//! the next pass self-heals.

pub mod watch;

pub use watch::spawn_watch_loop;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bridge::{BridgeError, ProxyReloader};
use crate::proxy::{FileLock, ProxyConfig, ProxyError, Upstream};
use crate::runtime::{ComposeProbe, RuntimeError};
use crate::topology::{Endpoint, Stage, TopologyError, TopologyFile};

/// Selection method for aggregate upstreams the engine creates itself.
pub const DEFAULT_AGGREGATE_METHOD: &str = "least_conn";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("proxy reload failed: {0}")]
    Reload(#[from] BridgeError),
}

/// What one pass did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Scale commands issued, as (service, desired count)
    pub scaled: Vec<(String, u32)>,
    pub written: bool,
    pub reloaded: bool,
}

/// The control loop core. Shares a lock with the deployment workflow so
/// that proxy-config read-modify-write cycles never interleave.
pub struct Reconciler {
    topology_path: PathBuf,
    proxy_path: PathBuf,
    probe: ComposeProbe,
    reloader: Arc<dyn ProxyReloader>,
    lock: Arc<Mutex<()>>,
}

/// Actual state of one declared stage, gathered up front.
struct StageState {
    cluster_key: String,
    stage: Stage,
    aggregate: String,
    /// index -> endpoint with the declared hostname and the live port
    live: Vec<(u32, Endpoint)>,
}

impl Reconciler {
    pub fn new(
        topology_path: PathBuf,
        proxy_path: PathBuf,
        probe: ComposeProbe,
        reloader: Arc<dyn ProxyReloader>,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            topology_path,
            proxy_path,
            probe,
            reloader,
            lock,
        }
    }

    /// Run one full pass. Serialized against concurrent workflow
    /// operations; a second trigger arriving mid-pass waits here.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _guard = self.lock.lock().await;
        self.pass().await
    }

    async fn pass(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        // operator commands run as separate processes against the same
        // config file; hold the cross-process lock for the whole cycle
        let _config_lock = FileLock::acquire(&self.proxy_path)
            .await
            .map_err(ProxyError::Io)?;

        let topology = TopologyFile::load(&self.topology_path)?;
        let clusters = topology.clusters()?;
        let original = std::fs::read_to_string(&self.proxy_path).map_err(ProxyError::Io)?;
        let mut config = ProxyConfig::parse(&original)?;

        // gather actual state, scaling each stage to its declared count
        // where it diverges
        let mut states = Vec::new();
        for cluster in &clusters {
            for stage in &cluster.stages {
                let service = cluster.service_name(stage);
                let mut instances = self.probe.list_instances(&service).await?;
                if needs_scaling(&instances, stage.count) {
                    info!(
                        "scaling `{}` to {} (currently {} running)",
                        service,
                        stage.count,
                        instances.len()
                    );
                    self.probe.scale(&service, stage.count).await?;
                    // the runtime decides what actually happened
                    instances = self.probe.list_instances(&service).await?;
                    report.scaled.push((service.clone(), stage.count));
                }
                let live = instances
                    .iter()
                    .map(|i| (i.index, Endpoint::new(stage.node_hostname(i.index), i.port)))
                    .collect();
                states.push(StageState {
                    cluster_key: cluster.key.clone(),
                    stage: stage.clone(),
                    aggregate: cluster.aggregate_upstream(stage),
                    live,
                });
            }
        }

        for state in &states {
            config = sync_stage(config, state, &topology);
        }

        let rendered = config.render();
        if rendered != original {
            std::fs::write(&self.proxy_path, &rendered).map_err(ProxyError::Io)?;
            report.written = true;
            self.reloader.reload().await?;
            report.reloaded = true;
            info!("proxy config updated, proxy reloaded");
        } else {
            debug!("proxy config unchanged, skipping write and reload");
        }

        Ok(report)
    }
}

/// Whether a stage diverges from its declared count: wrong total, or a
/// declared index without a running instance.
fn needs_scaling(instances: &[crate::runtime::ServiceInstance], desired: u32) -> bool {
    if instances.len() as u32 != desired {
        return true;
    }
    (1..=desired).any(|i| !instances.iter().any(|inst| inst.index == i))
}

/// Bring every upstream touching one stage in line with its live
/// endpoints.
fn sync_stage(config: ProxyConfig, state: &StageState, topology: &TopologyFile) -> ProxyConfig {
    let mut config = sync_aggregate(config, state);

    // deployment upstreams are recognized by membership: any upstream
    // (other than the aggregate) holding a host shaped like one of this
    // stage's nodes routes a deployment of this stage
    let names: Vec<String> = config
        .upstreams()
        .filter(|u| u.name != state.aggregate)
        .filter(|u| {
            u.servers
                .iter()
                .any(|s| state.stage.hostname_index(&s.host).is_some())
        })
        .map(|u| u.name.clone())
        .collect();

    for name in names {
        let Some(upstream) = config.upstream(&name) else {
            continue;
        };
        let mut upstream = upstream.clone();
        for (index, endpoint) in &state.live {
            if topology.is_unbalanced(&state.cluster_key, &state.stage.name, *index, &name) {
                // taken out of traffic on purpose, keep it out
                if upstream.contains_host(&endpoint.host) {
                    debug!(
                        "dropping unbalanced node {} from upstream `{}`",
                        endpoint.host, name
                    );
                    upstream = upstream.retain_servers(|s| s.host != endpoint.host);
                }
            } else {
                upstream = upstream.with_updated(endpoint.clone());
            }
        }
        upstream = drop_stale(upstream, state);
        config = if upstream.is_empty() {
            info!("removing empty upstream `{}`", name);
            config.without_upstream(&name)
        } else {
            config.with_upstream(upstream)
        };
    }

    config
}

/// The aggregate upstream mirrors every live endpoint of the stage,
/// regardless of balance status - it serves fleet-wide routing, not
/// per-deployment traffic.
fn sync_aggregate(config: ProxyConfig, state: &StageState) -> ProxyConfig {
    let existing = config.upstream(&state.aggregate).cloned();
    if existing.is_none() && state.live.is_empty() {
        return config;
    }
    let mut upstream = existing
        .unwrap_or_else(|| Upstream::new(&state.aggregate).with_method(DEFAULT_AGGREGATE_METHOD));
    for (_, endpoint) in &state.live {
        upstream = upstream.with_updated(endpoint.clone());
    }
    upstream = drop_stale(upstream, state);
    if upstream.is_empty() {
        info!("removing empty upstream `{}`", state.aggregate);
        config.without_upstream(&state.aggregate)
    } else {
        config.with_upstream(upstream)
    }
}

/// Remove entries for this stage's hosts that have no live instance.
/// Entries not matching the stage's naming template are left alone.
fn drop_stale(upstream: Upstream, state: &StageState) -> Upstream {
    upstream.retain_servers(|server| match state.stage.hostname_index(&server.host) {
        Some(index) => state.live.iter().any(|(live, _)| *live == index),
        None => true,
    })
}
