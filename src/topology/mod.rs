pub mod file;
pub mod model;

pub use file::{ClusterConfig, SlotConfig, StageConfig, TopologyError, TopologyFile, UNBALANCED};
pub use model::{Cluster, ClusterNode, Endpoint, NodeRef, Slot, Stage};
