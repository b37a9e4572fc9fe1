//! The on-disk cluster metadata store.
//!
//! A tiny document database under `<home>/.mup/storage/clusters`: one
//! directory per cluster holding a `meta.yaml`. This lives on the
//! machine running mup (not on the target hosts), so it uses the local
//! filesystem directly.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::import::ImportResult;
use crate::topology::{ClusterTopology, TopologyNode};

/// File name of the per-cluster document.
const META_FILE: &str = "meta.yaml";

/// The persisted description of a managed cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterMeta {
    /// Cluster name (also the storage directory name).
    pub name: String,
    /// Adopted server version.
    pub version: String,
    /// Vendor label.
    pub variant: String,
    /// When the cluster was adopted.
    pub created_at: DateTime<Utc>,
    /// Lifecycle status (`imported`, `running`, `stopped`).
    pub status: String,
    /// How the cluster came under management (`import` for adoption).
    pub deploy_mode: String,
    /// The cluster description at adoption time.
    pub topology: ClusterTopology,
    /// Flat node list, database/router/config order.
    pub nodes: Vec<TopologyNode>,
}

impl ClusterMeta {
    /// Build the document for a committed import.
    pub fn from_import(name: &str, result: &ImportResult) -> Self {
        Self {
            name: name.to_string(),
            version: result.version.clone(),
            variant: result.variant.clone(),
            created_at: Utc::now(),
            status: "imported".to_string(),
            deploy_mode: "import".to_string(),
            topology: result.topology.clone(),
            nodes: result.topology.all_nodes().cloned().collect(),
        }
    }
}

/// Store rooted at a clusters directory.
#[derive(Debug, Clone)]
pub struct MetaStore {
    root: Utf8PathBuf,
}

impl MetaStore {
    /// The store under the user's home directory.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().context("No home directory")?;
        let home = Utf8PathBuf::from_path_buf(home)
            .map_err(|p| anyhow::anyhow!("Non-UTF8 home directory {p:?}"))?;
        Ok(Self::with_root(home.join(".mup/storage/clusters")))
    }

    /// A store rooted at an explicit directory.
    pub fn with_root(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn meta_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name).join(META_FILE)
    }

    /// Persist (or replace) a cluster document.
    #[context("Saving metadata for {}", meta.name)]
    pub fn save(&self, meta: &ClusterMeta) -> Result<()> {
        let path = self.meta_path(&meta.name);
        std::fs::create_dir_all(path.parent().expect("meta path has a parent"))?;
        let yaml = serde_yaml::to_string(meta).context("Serializing metadata")?;
        std::fs::write(&path, yaml).with_context(|| format!("Writing {path}"))?;
        Ok(())
    }

    /// Load a cluster document by name.
    #[context("Loading metadata for {name}")]
    pub fn load(&self, name: &str) -> Result<ClusterMeta> {
        let path = self.meta_path(name);
        let raw = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        serde_yaml::from_str(&raw).context("Parsing metadata")
    }

    /// Names of all stored clusters, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("Listing {}", self.root)),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if self.root.join(name).join(META_FILE).is_file() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a cluster document (and its directory).
    #[context("Removing metadata for {name}")]
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.root.join(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Removing {dir}")),
        }
    }
}
