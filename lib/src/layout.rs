//! Construction of the adopted on-disk layout.
//!
//! A cluster root holds one versioned subtree per adopted server
//! version, a `current` pointer, and a `data/` directory of symlinks to
//! the instances' original data directories. Data files are never moved
//! or copied; adoption overlays them. Every operation here is
//! idempotent so re-running an import converges instead of failing.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::exec::Executor;

/// Directory mode for everything the builder creates.
const DIR_MODE: u32 = 0o755;

/// Children of a versioned subtree.
const VERSION_SUBDIRS: &[&str] = &["bin", "conf", "logs"];

/// Builds and validates the adopted layout through the substrate.
pub struct StructureBuilder<'a> {
    exec: &'a dyn Executor,
}

/// The versioned subtree for `version` under `cluster_dir`.
pub fn version_root(cluster_dir: &Utf8Path, version: &str) -> Utf8PathBuf {
    cluster_dir.join(format!("v{version}"))
}

/// The data-symlink directory under `cluster_dir`.
pub fn data_root(cluster_dir: &Utf8Path) -> Utf8PathBuf {
    cluster_dir.join("data")
}

impl<'a> StructureBuilder<'a> {
    /// A builder acting through the given substrate.
    pub fn new(exec: &'a dyn Executor) -> Self {
        Self { exec }
    }

    /// Create `cluster_dir/v<version>` with its `bin/`, `conf/` and
    /// `logs/` children. Existing directories are left as they are.
    #[context("Creating versioned layout for {version} under {cluster_dir}")]
    pub fn create_version_dirs(
        &self,
        cluster_dir: &Utf8Path,
        version: &str,
    ) -> Result<Utf8PathBuf> {
        let root = version_root(cluster_dir, version);
        self.exec.mkdir(&root, DIR_MODE)?;
        for sub in VERSION_SUBDIRS {
            self.exec.mkdir(&root.join(sub), DIR_MODE)?;
        }
        Ok(root)
    }

    /// Symlink `data_dir/<node_id>` at the instance's original data
    /// directory.
    ///
    /// Order of precedence: if the candidate path and the target resolve
    /// to the same place (the data already lives inside the layout),
    /// nothing happens; a symlink already pointing at the target is kept;
    /// anything else at the candidate path is removed and replaced with
    /// a fresh symlink.
    #[context("Linking data for {node_id}")]
    pub fn link_data(
        &self,
        data_dir: &Utf8Path,
        node_id: &str,
        existing_data_dir: &Utf8Path,
    ) -> Result<()> {
        self.exec.mkdir(data_dir, DIR_MODE)?;
        let candidate = data_dir.join(node_id);
        let target_abs = self
            .exec
            .canonicalize(existing_data_dir)
            .unwrap_or_else(|_| existing_data_dir.to_owned());
        let candidate_abs = self
            .exec
            .canonicalize(&candidate)
            .unwrap_or_else(|_| candidate.clone());
        if candidate_abs == target_abs {
            tracing::debug!("{candidate} already is {target_abs}");
            return Ok(());
        }
        if self.exec.file_exists(&candidate)? {
            if let Ok(link_target) = self.exec.read_link(&candidate) {
                if link_target == existing_data_dir || link_target == target_abs {
                    tracing::debug!("{candidate} already links to {link_target}");
                    return Ok(());
                }
            }
            self.exec
                .remove_file(&candidate)
                .with_context(|| format!("Replacing stale {candidate}"))?;
        }
        self.exec.symlink(existing_data_dir, &candidate)
    }

    /// Point `cluster_dir/current` at `v<version>`, replacing any
    /// previous pointer. The link is relative so the cluster root can
    /// be relocated wholesale.
    pub fn link_current(&self, cluster_dir: &Utf8Path, version: &str) -> Result<()> {
        let target = Utf8PathBuf::from(format!("v{version}"));
        self.exec.symlink(&target, &cluster_dir.join("current"))
    }

    /// Point `cluster_dir/previous` at `v<version>`. Used on upgrades,
    /// not during initial adoption.
    pub fn link_previous(&self, cluster_dir: &Utf8Path, version: &str) -> Result<()> {
        let target = Utf8PathBuf::from(format!("v{version}"));
        self.exec.symlink(&target, &cluster_dir.join("previous"))
    }

    /// Check the built layout: every instance's data symlink must
    /// resolve to its recorded original directory and `current` must
    /// exist.
    #[context("Validating layout under {cluster_dir}")]
    pub fn validate(
        &self,
        cluster_dir: &Utf8Path,
        entries: &[(String, Utf8PathBuf)],
    ) -> Result<()> {
        let data_dir = data_root(cluster_dir);
        for (node_id, original) in entries {
            let candidate = data_dir.join(node_id);
            let resolved = self
                .exec
                .canonicalize(&candidate)
                .with_context(|| format!("Resolving {candidate}"))?;
            let expected = self
                .exec
                .canonicalize(original)
                .unwrap_or_else(|_| original.clone());
            anyhow::ensure!(
                resolved == expected,
                "data link {candidate} resolves to {resolved}, expected {expected}"
            );
        }
        let current = cluster_dir.join("current");
        anyhow::ensure!(
            self.exec.file_exists(&current)?,
            "missing current pointer {current}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::LocalExecutor;

    fn fixture() -> (tempfile::TempDir, Utf8PathBuf, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let cluster = root.join("cluster");
        let original = root.join("var-lib-mongodb");
        std::fs::create_dir_all(&original).unwrap();
        (td, cluster, original)
    }

    #[test]
    fn test_create_version_dirs() {
        let (_td, cluster, _orig) = fixture();
        let exec = LocalExecutor::new();
        let builder = StructureBuilder::new(&exec);
        let root = builder.create_version_dirs(&cluster, "7.0.5").unwrap();
        assert_eq!(root, cluster.join("v7.0.5"));
        for sub in ["bin", "conf", "logs"] {
            assert!(root.join(sub).is_dir());
        }
        // Idempotent
        builder.create_version_dirs(&cluster, "7.0.5").unwrap();
    }

    #[test]
    fn test_link_data_creates_and_keeps() {
        let (_td, cluster, original) = fixture();
        let exec = LocalExecutor::new();
        let builder = StructureBuilder::new(&exec);
        let data = data_root(&cluster);
        builder.link_data(&data, "localhost-27017", &original).unwrap();
        let link = data.join("localhost-27017");
        assert_eq!(link.read_link_utf8().unwrap(), original);
        // Second run is a no-op on the correct link
        builder.link_data(&data, "localhost-27017", &original).unwrap();
        assert_eq!(link.read_link_utf8().unwrap(), original);
    }

    #[test]
    fn test_link_data_replaces_stale_link() {
        let (_td, cluster, original) = fixture();
        let exec = LocalExecutor::new();
        let builder = StructureBuilder::new(&exec);
        let data = data_root(&cluster);
        let stale = cluster.join("elsewhere");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::create_dir_all(&data).unwrap();
        exec.symlink(&stale, &data.join("localhost-27017")).unwrap();
        builder.link_data(&data, "localhost-27017", &original).unwrap();
        assert_eq!(
            data.join("localhost-27017").read_link_utf8().unwrap(),
            original
        );
    }

    #[test]
    fn test_link_data_skips_identical_real_directory() {
        let (_td, cluster, _orig) = fixture();
        let exec = LocalExecutor::new();
        let builder = StructureBuilder::new(&exec);
        let data = data_root(&cluster);
        // The "original" data dir already lives at the candidate path
        let inside = data.join("localhost-27017");
        std::fs::create_dir_all(&inside).unwrap();
        builder.link_data(&data, "localhost-27017", &inside).unwrap();
        // Still a real directory, not a symlink to itself
        assert!(inside.symlink_metadata().unwrap().is_dir());
    }

    #[test]
    fn test_link_current_replaces() {
        let (_td, cluster, _orig) = fixture();
        let exec = LocalExecutor::new();
        let builder = StructureBuilder::new(&exec);
        builder.create_version_dirs(&cluster, "6.0.4").unwrap();
        builder.create_version_dirs(&cluster, "7.0.5").unwrap();
        builder.link_current(&cluster, "6.0.4").unwrap();
        builder.link_current(&cluster, "7.0.5").unwrap();
        assert_eq!(
            cluster.join("current").read_link_utf8().unwrap(),
            Utf8PathBuf::from("v7.0.5")
        );
    }

    #[test]
    fn test_link_previous_for_upgrade() {
        let (_td, cluster, _orig) = fixture();
        let exec = LocalExecutor::new();
        let builder = StructureBuilder::new(&exec);
        builder.create_version_dirs(&cluster, "6.0.4").unwrap();
        builder.create_version_dirs(&cluster, "7.0.5").unwrap();
        builder.link_current(&cluster, "7.0.5").unwrap();
        builder.link_previous(&cluster, "6.0.4").unwrap();
        assert_eq!(
            cluster.join("previous").read_link_utf8().unwrap(),
            Utf8PathBuf::from("v6.0.4")
        );
    }

    #[test]
    fn test_validate() {
        let (_td, cluster, original) = fixture();
        let exec = LocalExecutor::new();
        let builder = StructureBuilder::new(&exec);
        builder.create_version_dirs(&cluster, "7.0.5").unwrap();
        builder.link_current(&cluster, "7.0.5").unwrap();
        let data = data_root(&cluster);
        builder.link_data(&data, "localhost-27017", &original).unwrap();
        let entries = vec![("localhost-27017".to_string(), original.clone())];
        builder.validate(&cluster, &entries).unwrap();

        // A wrong link target must fail validation
        let other = cluster.join("other");
        std::fs::create_dir_all(&other).unwrap();
        exec.symlink(&other, &data.join("localhost-27017")).unwrap();
        assert!(builder.validate(&cluster, &entries).is_err());
    }
}
