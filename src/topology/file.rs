//! The YAML topology config file
//!
//! The document is a map keyed by `<host>/<slot-name>`, one entry per
//! cluster, nested by stage. Unknown keys are captured into `extra` maps so
//! that a read-modify-write cycle never drops what other tools put there.
//! The per-stage `status` section holds the balance markers the deployment
//! workflow persists; it is the only engine-owned state that survives
//! restarts.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{Cluster, ClusterNode, NodeRef, Slot, Stage};

/// Marker value in the `status` section.
pub const UNBALANCED: &str = "unbalanced";

fn default_index_length() -> usize {
    2
}

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("failed to read topology file: {0}")]
    Io(#[from] std::io::Error),

    #[error("topology parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("cluster key `{0}` is not of the form <host>/<slot-name>")]
    ClusterKey(String),

    #[error("unknown cluster `{0}`")]
    UnknownCluster(String),

    #[error("cluster `{cluster}` has no stage `{stage}`")]
    UnknownStage { cluster: String, stage: String },

    #[error("stage `{stage}` declares {count} node(s), index {index} is out of range")]
    IndexOutOfRange {
        stage: String,
        count: u32,
        index: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub plain: u16,
    pub secure: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub count: u32,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(rename = "index-length", default = "default_index_length")]
    pub index_length: usize,
    #[serde(
        rename = "load-balancer",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub load_balancer: BTreeMap<String, String>,
    /// Balance markers, `<index>:<deployment>` -> `unbalanced`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub slot: SlotConfig,
    #[serde(rename = "health-check", default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
    pub stages: BTreeMap<String, StageConfig>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// The whole topology document. Read fresh on every reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopologyFile {
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl TopologyFile {
    /// Parse a YAML document. Pure function - no I/O.
    pub fn from_str(content: &str) -> Result<Self, TopologyError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Serialize back to YAML. Pure function - no I/O.
    pub fn to_string(&self) -> Result<String, TopologyError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn store(&self, path: &Path) -> Result<(), TopologyError> {
        std::fs::write(path, self.to_string()?)?;
        Ok(())
    }

    /// Materialize the declared clusters as model values.
    pub fn clusters(&self) -> Result<Vec<Cluster>, TopologyError> {
        self.clusters
            .iter()
            .map(|(key, config)| {
                let (host, slot_name) = split_cluster_key(key)?;
                Ok(Cluster {
                    key: key.clone(),
                    host: host.to_string(),
                    slot: Slot {
                        name: slot_name.to_string(),
                        plain: config.slot.plain,
                        secure: config.slot.secure,
                    },
                    stages: config
                        .stages
                        .iter()
                        .map(|(name, s)| Stage {
                            name: name.clone(),
                            count: s.count,
                            prefix: s.prefix.clone(),
                            suffix: s.suffix.clone(),
                            index_length: s.index_length,
                            load_balancer: s.load_balancer.clone(),
                        })
                        .collect(),
                    health_check: config.health_check.clone(),
                })
            })
            .collect()
    }

    /// Resolve an operator-supplied node reference against the declared
    /// topology. Unknown coordinates are user input errors.
    pub fn resolve(&self, node: &NodeRef) -> Result<ClusterNode, TopologyError> {
        let config = self
            .clusters
            .get(&node.cluster)
            .ok_or_else(|| TopologyError::UnknownCluster(node.cluster.clone()))?;
        let (host, slot_name) = split_cluster_key(&node.cluster)?;
        let stage_config =
            config
                .stages
                .get(&node.stage)
                .ok_or_else(|| TopologyError::UnknownStage {
                    cluster: node.cluster.clone(),
                    stage: node.stage.clone(),
                })?;
        if node.index == 0 || node.index > stage_config.count {
            return Err(TopologyError::IndexOutOfRange {
                stage: node.stage.clone(),
                count: stage_config.count,
                index: node.index,
            });
        }
        Ok(ClusterNode {
            cluster: node.cluster.clone(),
            host: host.to_string(),
            slot: Slot {
                name: slot_name.to_string(),
                plain: config.slot.plain,
                secure: config.slot.secure,
            },
            stage: Stage {
                name: node.stage.clone(),
                count: stage_config.count,
                prefix: stage_config.prefix.clone(),
                suffix: stage_config.suffix.clone(),
                index_length: stage_config.index_length,
                load_balancer: stage_config.load_balancer.clone(),
            },
            index: node.index,
        })
    }

    /// Whether a node carries an `unbalanced` marker for a deployment.
    pub fn is_unbalanced(&self, cluster: &str, stage: &str, index: u32, deployment: &str) -> bool {
        self.clusters
            .get(cluster)
            .and_then(|c| c.stages.get(stage))
            .and_then(|s| s.status.get(&format!("{}:{}", index, deployment)))
            .map(|v| v == UNBALANCED)
            .unwrap_or(false)
    }

    /// Persist an `unbalanced` marker. Returns whether anything changed,
    /// so callers can skip the write for an already-unbalanced node.
    pub fn set_unbalanced(
        &mut self,
        node: &NodeRef,
        deployment: &str,
    ) -> Result<bool, TopologyError> {
        let stage = self.stage_config_mut(node)?;
        let key = format!("{}:{}", node.index, deployment);
        Ok(stage.status.insert(key, UNBALANCED.to_string()).is_none())
    }

    /// Remove a balance marker. Returns whether anything changed.
    pub fn clear_unbalanced(
        &mut self,
        node: &NodeRef,
        deployment: &str,
    ) -> Result<bool, TopologyError> {
        let stage = self.stage_config_mut(node)?;
        let key = format!("{}:{}", node.index, deployment);
        Ok(stage.status.remove(&key).is_some())
    }

    fn stage_config_mut(&mut self, node: &NodeRef) -> Result<&mut StageConfig, TopologyError> {
        let config = self
            .clusters
            .get_mut(&node.cluster)
            .ok_or_else(|| TopologyError::UnknownCluster(node.cluster.clone()))?;
        config
            .stages
            .get_mut(&node.stage)
            .ok_or_else(|| TopologyError::UnknownStage {
                cluster: node.cluster.clone(),
                stage: node.stage.clone(),
            })
    }
}

fn split_cluster_key(key: &str) -> Result<(&str, &str), TopologyError> {
    key.split_once('/')
        .filter(|(host, slot)| !host.is_empty() && !slot.is_empty())
        .ok_or_else(|| TopologyError::ClusterKey(key.to_string()))
}
