//! Deployment workflow
//!
//! Operator-triggered, single-node operations that sequence proxy
//! membership around version changes: `unbalance` takes a node out of a
//! deployment's upstream and persists a marker so reconciliation keeps it
//! out, `balance` reverses both, and `deploy`/`undeploy` wrap the external
//! deployer call between them so a node never serves traffic mid-switch.
//!
//! Proxy-config access is a read-modify-write critical section shared with
//! the reconciliation engine. Reload failure is the one case where a
//! partial mutation is actively undone: the on-disk config is restored to
//! its pre-operation snapshot, because the file must never silently
//! diverge from what the live proxy is running.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bridge::{BridgeError, ProxyReloader};
use crate::deployer::{Deployer, DeployerError};
use crate::proxy::{FileLock, ProxyConfig, ProxyError};
use crate::runtime::{ComposeProbe, RuntimeError};
use crate::topology::{ClusterNode, NodeRef, TopologyError, TopologyFile};

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("no upstream named `{0}` in the proxy config")]
    UnknownDeployment(String),

    #[error("node {0} has no running instance")]
    NotRunning(NodeRef),

    #[error("version {version} is not offered for {group}:{artifact}")]
    UnknownVersion {
        group: String,
        artifact: String,
        version: String,
    },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Deployer(#[from] DeployerError),

    #[error("proxy reload failed: {0}")]
    Reload(BridgeError),
}

pub struct DeployWorkflow {
    topology_path: PathBuf,
    proxy_path: PathBuf,
    probe: ComposeProbe,
    reloader: Arc<dyn ProxyReloader>,
    deployer: Arc<dyn Deployer>,
    lock: Arc<Mutex<()>>,
}

impl DeployWorkflow {
    pub fn new(
        topology_path: PathBuf,
        proxy_path: PathBuf,
        probe: ComposeProbe,
        reloader: Arc<dyn ProxyReloader>,
        deployer: Arc<dyn Deployer>,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            topology_path,
            proxy_path,
            probe,
            reloader,
            deployer,
            lock,
        }
    }

    /// Persist the `unbalanced` marker for the node, then take its
    /// endpoint out of the deployment's upstream and reload. Idempotent:
    /// an already-unbalanced, already-absent node is a no-op.
    pub async fn unbalance(&self, node: &NodeRef, deployment: &str) -> Result<(), WorkflowError> {
        let _guard = self.lock.lock().await;
        self.unbalance_locked(node, deployment).await
    }

    async fn unbalance_locked(&self, node: &NodeRef, deployment: &str) -> Result<(), WorkflowError> {
        let mut topology = TopologyFile::load(&self.topology_path)?;
        let member = topology.resolve(node)?;

        let _config_lock = FileLock::acquire(&self.proxy_path)
            .await
            .map_err(ProxyError::Io)?;
        let original = std::fs::read_to_string(&self.proxy_path).map_err(ProxyError::Io)?;
        let config = ProxyConfig::parse(&original)?;
        // a rejected request must leave no trace, so validate the
        // deployment before the marker is persisted
        let upstream = config
            .upstream(deployment)
            .ok_or_else(|| WorkflowError::UnknownDeployment(deployment.to_string()))?;

        if topology.set_unbalanced(node, deployment)? {
            topology.store(&self.topology_path)?;
            info!("marked {} unbalanced for `{}`", node, deployment);
        }

        let hostname = member.hostname();
        if !upstream.contains_host(&hostname) {
            debug!("{} already absent from upstream `{}`", hostname, deployment);
            return Ok(());
        }

        let updated = config.with_upstream(upstream.without_server(&hostname)?);
        self.write_and_reload(&original, &updated).await?;
        info!("took {} out of upstream `{}`", hostname, deployment);
        Ok(())
    }

    /// Clear the balance marker, then put the node's current endpoint back
    /// into the deployment's upstream and reload.
    pub async fn balance(&self, node: &NodeRef, deployment: &str) -> Result<(), WorkflowError> {
        let _guard = self.lock.lock().await;
        self.balance_locked(node, deployment).await
    }

    async fn balance_locked(&self, node: &NodeRef, deployment: &str) -> Result<(), WorkflowError> {
        let mut topology = TopologyFile::load(&self.topology_path)?;
        let member = topology.resolve(node)?;

        let _config_lock = FileLock::acquire(&self.proxy_path)
            .await
            .map_err(ProxyError::Io)?;
        let original = std::fs::read_to_string(&self.proxy_path).map_err(ProxyError::Io)?;
        let config = ProxyConfig::parse(&original)?;
        let upstream = config
            .upstream(deployment)
            .ok_or_else(|| WorkflowError::UnknownDeployment(deployment.to_string()))?;

        let endpoint = member.endpoint(self.live_port(&member, node).await?);

        // the rejection paths are behind us, the marker may go
        if topology.clear_unbalanced(node, deployment)? {
            topology.store(&self.topology_path)?;
            info!("cleared unbalanced marker of {} for `{}`", node, deployment);
        }

        let updated = match upstream.server_for_host(&endpoint.host) {
            Some(existing) if existing.port == endpoint.port => {
                debug!("{} already a member of upstream `{}`", endpoint, deployment);
                return Ok(());
            }
            // restarted since it was unbalanced, pick up the new port
            Some(_) => config.with_upstream(upstream.with_updated(endpoint.clone())),
            None => config.with_upstream(upstream.with_server(endpoint.clone())?),
        };
        self.write_and_reload(&original, &updated).await?;
        info!("put {} back into upstream `{}`", endpoint, deployment);
        Ok(())
    }

    /// Switch a node's deployment to a new version without ever exposing
    /// it mid-switch: unbalance, switch, balance.
    pub async fn deploy(
        &self,
        node: &NodeRef,
        deployment: &str,
        version: &str,
    ) -> Result<(), WorkflowError> {
        let member = self.resolve(node)?;
        let url = member.deployer_url();

        // if the node already knows the deployable, insist the requested
        // version actually exists before taking the node out of traffic
        let deployed = self.deployer.deployments(&url).await?;
        if let Some(current) = deployed.get(deployment) {
            let offered = self
                .deployer
                .versions(&url, &current.group, &current.artifact)
                .await?;
            if !offered.iter().any(|v| v == version) {
                return Err(WorkflowError::UnknownVersion {
                    group: current.group.clone(),
                    artifact: current.artifact.clone(),
                    version: version.to_string(),
                });
            }
        }

        self.unbalance(node, deployment).await?;
        self.deployer.set_version(&url, deployment, version).await?;
        self.balance(node, deployment).await?;
        info!("deployed `{}` {} on {}", deployment, version, node);
        Ok(())
    }

    /// Remove a deployment from a node: unbalance, then undeploy. No
    /// re-balance - the node no longer hosts the deployment.
    pub async fn undeploy(&self, node: &NodeRef, deployment: &str) -> Result<(), WorkflowError> {
        let member = self.resolve(node)?;
        self.unbalance(node, deployment).await?;
        self.deployer
            .undeploy(&member.deployer_url(), deployment)
            .await?;
        info!("undeployed `{}` from {}", deployment, node);
        Ok(())
    }

    fn resolve(&self, node: &NodeRef) -> Result<ClusterNode, WorkflowError> {
        Ok(TopologyFile::load(&self.topology_path)?.resolve(node)?)
    }

    async fn live_port(&self, member: &ClusterNode, node: &NodeRef) -> Result<u16, WorkflowError> {
        let instances = self.probe.list_instances(&member.service_name()).await?;
        instances
            .iter()
            .find(|i| i.index == member.index)
            .map(|i| i.port)
            .ok_or_else(|| WorkflowError::NotRunning(node.clone()))
    }

    async fn write_and_reload(
        &self,
        original: &str,
        updated: &ProxyConfig,
    ) -> Result<(), WorkflowError> {
        std::fs::write(&self.proxy_path, updated.render()).map_err(ProxyError::Io)?;
        if let Err(e) = self.reloader.reload().await {
            // the live proxy still runs the old config; put the file back
            // before surfacing the reload failure
            std::fs::write(&self.proxy_path, original).map_err(ProxyError::Io)?;
            return Err(WorkflowError::Reload(e));
        }
        Ok(())
    }
}
