//! The import orchestrator: adopt running database processes into the
//! supervised layout.
//!
//! Phases run strictly in order: discovery, structure construction,
//! configuration import, topology emission, init-system takeover,
//! commit. The first failure with persistent effects halts the import
//! and rolls the init-system journal back; filesystem artifacts are
//! idempotent and left for the next attempt. Cancellation is explicit:
//! the flag is honoured between phases and between unit takeovers, and
//! triggers the same rollback path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;

use crate::dbconfig::{self, AdoptedPaths};
use crate::discovery::{
    DatabaseInstance, Discovery, DiscoveryError, InstanceEnricher, ManualInstance, NodeRole,
};
use crate::exec::Executor;
use crate::exporters::{
    ExporterRegistry, ScrapeConfig, DEFAULT_DB_METRICS_PORT_BASE, DEFAULT_HOST_METRICS_PORT,
};
use crate::initsystem::InitUnitManager;
use crate::layout::{self, StructureBuilder};
use crate::supervisor;
use crate::sysunit::InitUnit;
use crate::topology::{ClusterTopology, GlobalSection};

/// Fallback version directory name when enrichment could not tell.
const UNKNOWN_VERSION: &str = "unknown";

/// Default scrape interval for the generated metrics configuration.
const SCRAPE_INTERVAL: &str = "15s";

/// How instances are identified.
#[derive(Debug, Clone)]
pub enum DiscoveryMode {
    /// Inspect the host's process table.
    Auto,
    /// Trust caller-supplied identities.
    Manual(Vec<ManualInstance>),
}

/// Caller configuration for one import.
#[derive(Debug, Clone)]
pub struct ImportOpts {
    /// Cluster name, used for metadata and scrape labels.
    pub cluster_name: String,
    /// Cluster root on the target host.
    pub cluster_dir: Utf8PathBuf,
    /// Host identity recorded for discovered instances.
    pub host: String,
    /// Administrative database user for the topology's global section.
    pub admin_user: String,
    /// Discovery mode.
    pub mode: DiscoveryMode,
    /// Discover and classify only; skip every persistent effect.
    pub dry_run: bool,
}

/// Summary of a committed (or dry-run) import.
#[derive(Debug, Clone)]
pub struct ImportResult {
    /// The adopted instances.
    pub instances: Vec<DatabaseInstance>,
    /// Adopted server version (layout directory name).
    pub version: String,
    /// Vendor label.
    pub variant: String,
    /// The written cluster description.
    pub topology: ClusterTopology,
    /// Init units transitioned to disabled.
    pub disabled_units: Vec<String>,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

/// Sequences the import phases over one substrate.
pub struct ImportOrchestrator<'a> {
    exec: &'a dyn Executor,
    enricher: &'a dyn InstanceEnricher,
    cancel: Arc<AtomicBool>,
}

impl<'a> ImportOrchestrator<'a> {
    /// An orchestrator over the given substrate and enricher.
    pub fn new(exec: &'a dyn Executor, enricher: &'a dyn InstanceEnricher) -> Self {
        Self {
            exec,
            enricher,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The cancellation flag; set it from another context to abort the
    /// import at the next check point.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        anyhow::ensure!(!self.cancel.load(Ordering::Relaxed), "import cancelled");
        Ok(())
    }

    /// Run the whole import.
    #[context("Importing cluster {}", opts.cluster_name)]
    pub fn run(&self, opts: &ImportOpts) -> Result<ImportResult> {
        // Phase 1: discovery
        let discovery = Discovery::new(self.exec, self.enricher);
        let instances = match &opts.mode {
            DiscoveryMode::Auto => discovery.auto(&opts.host),
            DiscoveryMode::Manual(identities) => {
                if identities.is_empty() {
                    Err(DiscoveryError::NothingFound.into())
                } else {
                    identities.iter().map(|i| discovery.manual(i)).collect()
                }
            }
        }
        .context("import phase: discovery")?;
        let units = discovery
            .find_units()
            .context("import phase: discovery")?;
        let version = instances
            .iter()
            .map(|i| i.version.as_str())
            .find(|v| !v.is_empty())
            .unwrap_or(UNKNOWN_VERSION)
            .to_string();
        let variant = instances
            .iter()
            .map(|i| i.variant.as_str())
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_string();
        tracing::info!(
            "discovered {} instance(s), version {version} {variant}, {} init unit(s)",
            instances.len(),
            units.len()
        );
        self.ensure_not_cancelled()?;

        // Data directories are needed by both the structure and config
        // phases; resolve them once. Routers carry no data.
        let mut data_dirs: Vec<Option<Utf8PathBuf>> = Vec::with_capacity(instances.len());
        for instance in &instances {
            data_dirs.push(
                self.resolve_data_dir(instance)
                    .with_context(|| format!("import phase: discovery ({})", instance.node_id()))?,
            );
        }

        // Phase 2: structure construction
        let builder = StructureBuilder::new(self.exec);
        if !opts.dry_run {
            self.build_structure(&builder, opts, &version, &instances, &data_dirs)
                .context("import phase: structure construction")?;
        }
        self.ensure_not_cancelled()?;

        // Phase 3: configuration import
        if !opts.dry_run {
            self.import_configs(opts, &version, &instances)
                .context("import phase: configuration import")?;
        }

        // Phase 4: topology emission
        let global = GlobalSection::for_cluster_root(&opts.cluster_dir, &opts.admin_user);
        let topology = ClusterTopology::classify(&instances, global);
        if !opts.dry_run {
            topology
                .write(self.exec, &opts.cluster_dir)
                .context("import phase: topology emission")?;
        }
        self.ensure_not_cancelled()?;

        // Phase 5: init-system takeover
        let mut manager = InitUnitManager::new(self.exec);
        let mut disabled_units = Vec::new();
        if !opts.dry_run {
            if let Err(takeover_err) = self.take_over_units(&mut manager, &units) {
                return Err(match manager.rollback_all() {
                    Ok(()) => takeover_err.context("import phase: init-system takeover (rolled back)"),
                    Err(rollback_err) => takeover_err.context(format!(
                        "import phase: init-system takeover (rollback incomplete: {rollback_err:#})"
                    )),
                });
            }
            disabled_units = manager.journal().to_vec();
        }

        // Phase 6: commit
        manager.clear_journal();
        tracing::info!("import of {} committed", opts.cluster_name);
        Ok(ImportResult {
            instances,
            version,
            variant,
            topology,
            disabled_units,
            dry_run: opts.dry_run,
        })
    }

    /// Derive the exporter fleet for an imported topology, and persist
    /// the scrape configuration plus the supervisor fragment beside it.
    #[context("Preparing observability for {}", opts.cluster_name)]
    pub fn prepare_observability(
        &self,
        opts: &ImportOpts,
        topology: &ClusterTopology,
    ) -> Result<ExporterRegistry> {
        let registry = ExporterRegistry::derive(
            topology,
            DEFAULT_HOST_METRICS_PORT,
            DEFAULT_DB_METRICS_PORT_BASE,
        );
        let scrape = ScrapeConfig::build(topology, &registry, &opts.cluster_name, SCRAPE_INTERVAL);
        if !opts.dry_run {
            scrape.write(self.exec, &opts.cluster_dir)?;
            supervisor::write_fragment(self.exec, &opts.cluster_dir, &registry)?;
        }
        Ok(registry)
    }

    /// Where an instance's data lives, from discovery or its config
    /// file. `None` for routers, which are dataless.
    fn resolve_data_dir(&self, instance: &DatabaseInstance) -> Result<Option<Utf8PathBuf>> {
        if instance.role == NodeRole::ShardedRouter {
            return Ok(None);
        }
        if let Some(dir) = instance.data_dir.as_ref() {
            return Ok(Some(dir.clone()));
        }
        if let Some(config_path) = instance.config_path.as_ref() {
            let raw = self.exec.read_file(config_path)?;
            let parsed = dbconfig::parse_config(&String::from_utf8_lossy(&raw))?;
            if let Some(db_path) = parsed.storage.and_then(|s| s.db_path) {
                return Ok(Some(Utf8PathBuf::from(db_path)));
            }
        }
        anyhow::bail!(
            "cannot determine data directory for {}",
            instance.node_id()
        )
    }

    fn build_structure(
        &self,
        builder: &StructureBuilder<'_>,
        opts: &ImportOpts,
        version: &str,
        instances: &[DatabaseInstance],
        data_dirs: &[Option<Utf8PathBuf>],
    ) -> Result<()> {
        builder.create_version_dirs(&opts.cluster_dir, version)?;
        let data_root = layout::data_root(&opts.cluster_dir);
        let mut entries = Vec::new();
        for (instance, data_dir) in instances.iter().zip(data_dirs) {
            if let Some(data_dir) = data_dir {
                builder.link_data(&data_root, &instance.node_id(), data_dir)?;
                entries.push((instance.node_id(), data_dir.clone()));
            }
        }
        builder.link_current(&opts.cluster_dir, version)?;
        builder.validate(&opts.cluster_dir, &entries)
    }

    fn import_configs(
        &self,
        opts: &ImportOpts,
        version: &str,
        instances: &[DatabaseInstance],
    ) -> Result<()> {
        let version_root = layout::version_root(&opts.cluster_dir, version);
        for instance in instances {
            let Some(config_path) = instance.config_path.as_ref() else {
                tracing::debug!("{} has no config file; skipping", instance.node_id());
                continue;
            };
            let node_id = instance.node_id();
            let raw = self
                .exec
                .read_file(config_path)
                .with_context(|| format!("Reading config of {node_id}"))?;
            let paths = AdoptedPaths {
                data_dir: layout::data_root(&opts.cluster_dir).join(&node_id),
                log_path: version_root.join("logs").join(format!("{node_id}.log")),
            };
            let adopted = dbconfig::transform_text(&String::from_utf8_lossy(&raw), &paths)
                .with_context(|| format!("Transforming config of {node_id}"))?;
            self.exec.upload_content(
                adopted.as_bytes(),
                &version_root.join("conf").join(format!("{node_id}.conf")),
            )?;
        }
        Ok(())
    }

    fn take_over_units(
        &self,
        manager: &mut InitUnitManager<'_>,
        units: &[InitUnit],
    ) -> Result<()> {
        for unit in units {
            self.ensure_not_cancelled()?;
            manager
                .disable_and_stop(&unit.name)
                .with_context(|| format!("Disabling unit {}", unit.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ScriptedExec, StubEnricher};
    use indoc::indoc;

    struct Fixture {
        _td: tempfile::TempDir,
        root: Utf8PathBuf,
        cluster: Utf8PathBuf,
        data: Utf8PathBuf,
        config: Utf8PathBuf,
    }

    fn fixture() -> Fixture {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let cluster = root.join("cluster/std");
        let data = root.join("var-lib-mongodb");
        std::fs::create_dir_all(&data).unwrap();
        let config = root.join("etc/mongod.conf");
        std::fs::create_dir_all(config.parent().unwrap()).unwrap();
        std::fs::write(
            &config,
            indoc! { "
                storage:
                  dbPath: /var/lib/mongodb
                systemLog:
                  destination: file
                  path: /var/log/mongodb/mongod.log
                net:
                  port: 27017
            " },
        )
        .unwrap();
        Fixture {
            _td: td,
            root,
            cluster,
            data,
            config,
        }
    }

    fn stub_units(exec: &ScriptedExec, fixture: &Fixture, names: &[&str]) {
        let mut listing = String::new();
        for name in names {
            listing.push_str(&format!(
                "  {name}.service  loaded active running MongoDB Database Server\n"
            ));
            let unit_path = fixture.root.join(format!("{name}.service"));
            std::fs::write(
                &unit_path,
                format!(
                    "[Service]\nUser=mongodb\nExecStart=/usr/bin/mongod --config {}\n",
                    fixture.config
                ),
            )
            .unwrap();
            exec.stub(
                &format!("systemctl show -p FragmentPath {name}.service"),
                &format!("FragmentPath={unit_path}\n"),
            );
        }
        exec.stub("systemctl list-units", &listing);
    }

    fn opts(fixture: &Fixture, dry_run: bool) -> ImportOpts {
        ImportOpts {
            cluster_name: "std".into(),
            cluster_dir: fixture.cluster.clone(),
            host: "localhost".into(),
            admin_user: "mongodb".into(),
            mode: DiscoveryMode::Manual(vec![ManualInstance {
                host: "localhost".into(),
                port: 27017,
                config_path: fixture.config.clone(),
                data_dir: fixture.data.clone(),
                role_hint: None,
            }]),
            dry_run,
        }
    }

    #[test]
    fn test_standalone_adoption() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        stub_units(&exec, &fixture, &["mongod"]);
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);

        let result = orchestrator.run(&opts(&fixture, false)).unwrap();

        assert_eq!(result.version, "7.0.5");
        assert_eq!(result.instances.len(), 1);
        assert_eq!(result.disabled_units, ["mongod"]);
        assert_eq!(result.topology.mongod.len(), 1);

        let vdir = fixture.cluster.join("v7.0.5");
        for sub in ["bin", "conf", "logs"] {
            assert!(vdir.join(sub).is_dir(), "{sub} missing");
        }
        assert_eq!(
            fixture
                .cluster
                .join("data/localhost-27017")
                .read_link_utf8()
                .unwrap(),
            fixture.data
        );
        assert_eq!(
            fixture.cluster.join("current").read_link_utf8().unwrap(),
            Utf8PathBuf::from("v7.0.5")
        );
        assert!(fixture.cluster.join("topology.yaml").is_file());

        // The adopted config points into the layout
        let conf = std::fs::read_to_string(vdir.join("conf/localhost-27017.conf")).unwrap();
        assert!(conf.contains(&format!("dbPath: {}", fixture.cluster.join("data/localhost-27017"))));
        assert!(conf.contains("fork: false"));

        assert!(exec
            .commands()
            .iter()
            .any(|c| c == "systemctl disable mongod"));
        assert!(exec.commands().iter().any(|c| c == "systemctl stop mongod"));
    }

    #[test]
    fn test_rollback_on_disable_failure() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        stub_units(&exec, &fixture, &["mongod-a", "mongod-b"]);
        exec.fail("systemctl disable mongod-b", 1, "permission denied");
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);

        let err = orchestrator.run(&opts(&fixture, false)).unwrap_err();
        assert!(format!("{err:#}").contains("mongod-b"));

        let cmds = exec.commands();
        // The successfully disabled unit was restored...
        assert!(cmds.iter().any(|c| c == "systemctl enable mongod-a"));
        assert!(cmds.iter().any(|c| c == "systemctl start mongod-a"));
        // ...and the never-disabled one was left alone
        assert!(!cmds.iter().any(|c| c == "systemctl enable mongod-b"));
    }

    #[test]
    fn test_idempotent_reimport() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        stub_units(&exec, &fixture, &["mongod"]);
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);

        orchestrator.run(&opts(&fixture, false)).unwrap();
        let topology_first =
            std::fs::read(fixture.cluster.join("topology.yaml")).unwrap();
        let result = orchestrator.run(&opts(&fixture, false)).unwrap();
        let topology_second =
            std::fs::read(fixture.cluster.join("topology.yaml")).unwrap();
        similar_asserts::assert_eq!(
            String::from_utf8(topology_first).unwrap(),
            String::from_utf8(topology_second).unwrap()
        );
        assert_eq!(
            fixture
                .cluster
                .join("data/localhost-27017")
                .read_link_utf8()
                .unwrap(),
            fixture.data
        );
        assert!(!result.dry_run);
    }

    #[test]
    fn test_dry_run_leaves_no_trace() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        stub_units(&exec, &fixture, &["mongod"]);
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);

        let result = orchestrator.run(&opts(&fixture, true)).unwrap();
        assert!(result.dry_run);
        assert!(result.disabled_units.is_empty());
        assert!(!fixture.cluster.exists());
        assert!(!exec
            .commands()
            .iter()
            .any(|c| c.starts_with("systemctl disable")));
    }

    #[test]
    fn test_manual_mode_requires_instances() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);
        let mut o = opts(&fixture, false);
        o.mode = DiscoveryMode::Manual(Vec::new());
        let err = orchestrator.run(&o).unwrap_err();
        assert!(err
            .chain()
            .any(|c| c.downcast_ref::<DiscoveryError>().is_some()));
    }

    #[test]
    fn test_cancellation_before_mutation() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        stub_units(&exec, &fixture, &["mongod"]);
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);
        orchestrator.cancel_flag().store(true, Ordering::Relaxed);

        let err = orchestrator.run(&opts(&fixture, false)).unwrap_err();
        assert!(format!("{err:#}").contains("cancelled"));
        assert!(!fixture.cluster.join("topology.yaml").exists());
        assert!(!exec
            .commands()
            .iter()
            .any(|c| c.starts_with("systemctl disable")));
    }

    #[test]
    fn test_prepare_observability() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        stub_units(&exec, &fixture, &["mongod"]);
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);
        let o = opts(&fixture, false);
        let result = orchestrator.run(&o).unwrap();

        let registry = orchestrator
            .prepare_observability(&o, &result.topology)
            .unwrap();
        assert_eq!(registry.host_exporters.len(), 1);
        assert_eq!(registry.db_exporters.len(), 1);
        assert!(fixture.cluster.join("prometheus.yaml").is_file());
        assert!(fixture.cluster.join("monitoring-supervisor.ini").is_file());
    }

    #[test]
    fn test_resolve_data_dir_from_config() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);
        let mut instance = DatabaseInstance::new("localhost", 27017).unwrap();
        instance.config_path = Some(fixture.config.clone());
        let resolved = orchestrator.resolve_data_dir(&instance).unwrap();
        assert_eq!(resolved, Some(Utf8PathBuf::from("/var/lib/mongodb")));
    }

    #[test]
    fn test_routers_are_dataless() {
        let fixture = fixture();
        let exec = ScriptedExec::new();
        let enricher = StubEnricher::standalone("7.0.5");
        let orchestrator = ImportOrchestrator::new(&exec, &enricher);
        let mut router = DatabaseInstance::new("localhost", 27017).unwrap();
        router.role = NodeRole::ShardedRouter;
        assert_eq!(orchestrator.resolve_data_dir(&router).unwrap(), None);
        let _ = fixture;
    }
}
