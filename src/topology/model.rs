//! Desired-topology value types
//!
//! Immutable descriptions of what the fleet should look like: clusters,
//! their stages, and the numbered worker nodes each stage declares. The
//! reconciliation engine compares these against what the container runtime
//! actually reports.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The port pair shared by every stage of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    /// Plain HTTP listener port
    pub plain: u16,
    /// TLS listener port
    pub secure: u16,
}

/// A deployment environment (PROD, QA, ...) within a cluster.
///
/// The prefix/suffix templates plus the zero-padded index produce each
/// node's DNS hostname, so a `Stage` can both generate hostnames and
/// recognize them again.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    /// Desired number of worker nodes
    pub count: u32,
    pub prefix: String,
    pub suffix: String,
    /// Zero-padding width for the node index in hostnames
    pub index_length: usize,
    /// Opaque load-balancer settings, passed through untouched
    pub load_balancer: BTreeMap<String, String>,
}

impl Stage {
    /// Hostname of the node with the given index, e.g. `shop-prod-01.example.com`.
    pub fn node_hostname(&self, index: u32) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.index_length
        )
    }

    /// Map a hostname back to a node index, if it matches this stage's
    /// naming template. Returns `None` for hosts that belong to other
    /// stages or to backends the engine does not manage.
    pub fn hostname_index(&self, host: &str) -> Option<u32> {
        let digits = host.strip_prefix(&self.prefix)?.strip_suffix(&self.suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// A logical application instance, identified by host + slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Topology-file key, `<host>/<slot-name>`
    pub key: String,
    pub host: String,
    pub slot: Slot,
    pub stages: Vec<Stage>,
    pub health_check: Option<String>,
}

impl Cluster {
    /// First label of the cluster host, used to derive service names.
    pub fn host_base(&self) -> &str {
        self.host.split('.').next().unwrap_or(&self.host)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Container-runtime service name for one stage, e.g. `shop-prod`.
    pub fn service_name(&self, stage: &Stage) -> String {
        format!("{}-{}", self.host_base(), stage.name.to_lowercase())
    }

    /// Name of the fleet-wide upstream that mirrors every live endpoint of
    /// a stage. Identical to the service name by convention.
    pub fn aggregate_upstream(&self, stage: &Stage) -> String {
        self.service_name(stage)
    }

    /// Every node this cluster should have, across all stages.
    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.stages
            .iter()
            .flat_map(|stage| {
                (1..=stage.count).map(move |index| ClusterNode {
                    cluster: self.key.clone(),
                    host: self.host.clone(),
                    slot: self.slot.clone(),
                    stage: stage.clone(),
                    index,
                })
            })
            .collect()
    }
}

/// One numbered replica of a stage.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Topology-file key of the owning cluster
    pub cluster: String,
    pub host: String,
    pub slot: Slot,
    pub stage: Stage,
    pub index: u32,
}

impl ClusterNode {
    pub fn hostname(&self) -> String {
        self.stage.node_hostname(self.index)
    }

    /// Container-runtime service name, e.g. `shop-prod`.
    pub fn service_name(&self) -> String {
        let base = self.host.split('.').next().unwrap_or(&self.host);
        format!("{}-{}", base, self.stage.name.to_lowercase())
    }

    /// Advertised endpoint once a concrete runtime port is known.
    pub fn endpoint(&self, port: u16) -> Endpoint {
        Endpoint {
            host: self.hostname(),
            port,
        }
    }

    /// Base URL of the node's deployer service.
    pub fn deployer_url(&self) -> String {
        format!("http://{}:{}", self.hostname(), self.slot.plain)
    }

    /// Key under the stage's `status` section for a balance marker.
    pub fn status_key(&self, deployment: &str) -> String {
        format!("{}:{}", self.index, deployment)
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            cluster: self.cluster.clone(),
            stage: self.stage.name.clone(),
            index: self.index,
        }
    }
}

// Two nodes are the same worker iff stage name and index match.
impl PartialEq for ClusterNode {
    fn eq(&self, other: &Self) -> bool {
        self.stage.name == other.stage.name && self.index == other.index
    }
}

/// Reference to a node by coordinates, as accepted from operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Topology-file cluster key, `<host>/<slot-name>`
    pub cluster: String,
    pub stage: String,
    pub index: u32,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.stage, self.index)
    }
}

/// A reachable host:port address of a running node. The unit exchanged
/// with the proxy and runtime layers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
