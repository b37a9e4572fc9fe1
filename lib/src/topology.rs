//! The machine-readable cluster description (`topology.yaml`).

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::discovery::{DatabaseInstance, NodeRole};
use crate::exec::Executor;

/// File name of the serialized description under the cluster root.
pub const TOPOLOGY_FILE: &str = "topology.yaml";

/// One node entry in the description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNode {
    /// Host the node runs on.
    pub host: String,
    /// Port the node listens on.
    pub port: u16,
    /// Replica-set name, for members of one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<String>,
}

/// Cluster-wide paths and the administrative user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GlobalSection {
    /// Administrative database user.
    pub user: String,
    /// Cluster root on the target host.
    pub deploy_dir: Utf8PathBuf,
    /// Data-symlink directory.
    pub data_dir: Utf8PathBuf,
    /// Log directory (through the `current` pointer).
    pub log_dir: Utf8PathBuf,
    /// Config directory (through the `current` pointer).
    pub config_dir: Utf8PathBuf,
}

impl GlobalSection {
    /// Derive the fixed paths from a cluster root.
    pub fn for_cluster_root(root: &Utf8Path, user: &str) -> Self {
        Self {
            user: user.to_string(),
            deploy_dir: root.to_owned(),
            data_dir: root.join("data"),
            log_dir: root.join("current/logs"),
            config_dir: root.join("current/conf"),
        }
    }
}

/// The serialized cluster description: three ordered node collections
/// plus the global section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Paths and administrative user.
    pub global: GlobalSection,
    /// Data-bearing nodes (shard members, replica-set members,
    /// standalones).
    pub mongod: Vec<TopologyNode>,
    /// Query routers.
    pub mongos: Vec<TopologyNode>,
    /// Config-server members.
    pub config_svr: Vec<TopologyNode>,
}

impl ClusterTopology {
    /// Classify discovered instances into the three collections.
    /// Routers and config members get their own; everything else,
    /// including instances whose role could not be determined, is a
    /// database node with its replica-set name preserved.
    pub fn classify(instances: &[DatabaseInstance], global: GlobalSection) -> Self {
        let mut topology = Self {
            global,
            mongod: Vec::new(),
            mongos: Vec::new(),
            config_svr: Vec::new(),
        };
        for instance in instances {
            let node = TopologyNode {
                host: instance.host.clone(),
                port: instance.port,
                replica_set: instance.replica_set.clone(),
            };
            match instance.role {
                NodeRole::ShardedRouter => topology.mongos.push(node),
                NodeRole::ConfigMember => topology.config_svr.push(node),
                _ => topology.mongod.push(node),
            }
        }
        topology
    }

    /// All nodes, in the database/router/config order used elsewhere.
    pub fn all_nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.mongod
            .iter()
            .chain(self.mongos.iter())
            .chain(self.config_svr.iter())
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing topology")
    }

    /// Write `topology.yaml` under the cluster root, creating parent
    /// directories as needed.
    #[context("Writing topology under {cluster_dir}")]
    pub fn write(&self, exec: &dyn Executor, cluster_dir: &Utf8Path) -> Result<Utf8PathBuf> {
        let path = cluster_dir.join(TOPOLOGY_FILE);
        exec.upload_content(self.to_yaml()?.as_bytes(), &path)?;
        Ok(path)
    }

    /// Read a previously written description back.
    #[context("Reading topology under {cluster_dir}")]
    pub fn read(exec: &dyn Executor, cluster_dir: &Utf8Path) -> Result<Self> {
        let raw = exec.read_file(&cluster_dir.join(TOPOLOGY_FILE))?;
        serde_yaml::from_slice(&raw).context("Parsing topology")
    }
}
