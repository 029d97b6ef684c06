use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entry::Entry;

/// Lifecycle of a node within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Enumerating the local tree after startup.
    #[serde(rename = "Initial Scan")]
    InitialScan,
    /// Scan complete; catalog exchange pending or needed files outstanding.
    #[serde(rename = "Joining Cluster")]
    JoiningCluster,
    #[serde(rename = "Online")]
    Online,
}

/// One node as the manager describes it to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(rename = "ClusterKey")]
    pub cluster_key: String,

    #[serde(rename = "Name")]
    pub name: String,

    /// host:port the node's HTTP surface listens on.
    #[serde(rename = "Address")]
    pub address: String,

    #[serde(rename = "Status")]
    pub status: NodeStatus,

    #[serde(rename = "CurrentState", default)]
    pub current_state: Vec<Entry>,

    #[serde(rename = "PreviousState", default)]
    pub previous_state: Vec<Entry>,
}

impl NodeDescriptor {
    pub fn new(
        cluster_key: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            cluster_key: cluster_key.into(),
            name: name.into(),
            address: address.into(),
            status: NodeStatus::InitialScan,
            current_state: Vec::new(),
            previous_state: Vec::new(),
        }
    }
}

/// The authoritative node map the manager broadcasts.
pub type NodeMap = HashMap<String, NodeDescriptor>;
