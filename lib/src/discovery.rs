//! Discovery of running MongoDB processes and their init-system units.
//!
//! Discovery never mutates host state. It lists processes through the
//! execution substrate, parses their command lines, and then enriches
//! each instance over a short-lived direct driver connection. Enrichment
//! is strictly best-effort: a database that refuses connections is still
//! adoptable, it just loses version/role detail.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, ServerAddress};
use mongodb::sync::Client;
use regex::Regex;

use crate::exec::Executor;
use crate::sysunit::{self, InitUnit, UnitStatus};

/// Per-operation deadline for enrichment driver calls.
const ENRICH_TIMEOUT: Duration = Duration::from_secs(2);

/// Default port a mongod listens on.
pub const DEFAULT_PORT: u16 = 27017;

/// Typed discovery failures the orchestrator matches on.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Auto discovery found no database processes at all.
    #[error("no running database processes found")]
    NothingFound,
}

/// What a database process does within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeRole {
    /// Not part of any replica set or sharded cluster.
    Standalone,
    /// Member of a replica set.
    ReplicaSetMember,
    /// A mongos query router.
    ShardedRouter,
    /// A shard's data-bearing member.
    ShardMember,
    /// A config-server member.
    ConfigMember,
    /// Enrichment has not run or could not tell.
    #[default]
    Unknown,
}

/// An adopted (or adoptable) database process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseInstance {
    /// Host the process runs on.
    pub host: String,
    /// Port the process listens on.
    pub port: u16,
    /// Pid, when discovered from the process table.
    pub pid: Option<u32>,
    /// Config file the process was started with.
    pub config_path: Option<Utf8PathBuf>,
    /// Data directory.
    pub data_dir: Option<Utf8PathBuf>,
    /// Log file.
    pub log_path: Option<Utf8PathBuf>,
    /// Server version, from `buildInfo`.
    pub version: String,
    /// Vendor label (`mongodb`, `percona`, `enterprise`).
    pub variant: String,
    /// Topology role.
    pub role: NodeRole,
    /// Replica-set name, when the role implies membership.
    pub replica_set: Option<String>,
}

impl DatabaseInstance {
    /// A skeletal instance for `host:port`. Fails on port 0; the upper
    /// bound is carried by the type.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        anyhow::ensure!(port != 0, "port must be in 1..65535");
        Ok(Self {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Stable identifier used for layout entries: `host-port`.
    pub fn node_id(&self) -> String {
        format!("{}-{}", self.host, self.port)
    }

    /// The address to dial for driver connections. Wildcard binds are
    /// reachable on the loopback.
    pub fn connect_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" => "localhost",
            other => other,
        }
    }
}

/// Caller-supplied identity for manual-mode discovery.
#[derive(Debug, Clone)]
pub struct ManualInstance {
    /// Host the process runs on.
    pub host: String,
    /// Port the process listens on.
    pub port: u16,
    /// Config file path.
    pub config_path: Utf8PathBuf,
    /// Data directory.
    pub data_dir: Utf8PathBuf,
    /// Topology role, when the caller knows it. Config-server and shard
    /// members answer `isMaster` like any replica-set member, and manual
    /// mode has no command line to refine from, so without this hint
    /// they classify as plain replica-set members.
    pub role_hint: Option<NodeRole>,
}

/// Fills version, variant, and role on a skeletal instance.
///
/// Kept behind a trait so the engine can be driven without a live
/// database; the production implementation is [`DriverEnricher`].
pub trait InstanceEnricher {
    /// Enrich `instance` in place. Errors are swallowed by the engine.
    fn enrich(&self, instance: &mut DatabaseInstance) -> Result<()>;
}

/// Enrichment over a direct driver connection with aggressive timeouts.
#[derive(Debug, Default)]
pub struct DriverEnricher {}

impl DriverEnricher {
    fn client(host: &str, port: u16) -> Result<Client> {
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::Tcp {
                host: host.to_string(),
                port: Some(port),
            }])
            .direct_connection(true)
            .connect_timeout(ENRICH_TIMEOUT)
            .server_selection_timeout(ENRICH_TIMEOUT)
            .build();
        Client::with_options(options).context("Building driver client")
    }
}

impl InstanceEnricher for DriverEnricher {
    #[context("Enriching {}:{}", instance.host, instance.port)]
    fn enrich(&self, instance: &mut DatabaseInstance) -> Result<()> {
        let client = Self::client(instance.connect_host(), instance.port)?;
        let admin = client.database("admin");

        let build_info = admin
            .run_command(doc! { "buildInfo": 1 })
            .run()
            .context("buildInfo")?;
        if let Ok(version) = build_info.get_str("version") {
            instance.version = version.to_string();
        }
        instance.variant = detect_variant(&build_info);

        // The modern spelling first, then the legacy one.
        let is_master = match admin.run_command(doc! { "isMaster": 1 }).run() {
            Ok(reply) => reply,
            Err(_) => admin
                .run_command(doc! { "ismaster": 1 })
                .run()
                .context("ismaster")?,
        };
        if is_master.get_str("msg").ok() == Some("isdbgrid") {
            instance.role = NodeRole::ShardedRouter;
            instance.replica_set = None;
            return Ok(());
        }
        let set_name = is_master.get_str("setName").unwrap_or("");
        if !set_name.is_empty() {
            instance.role = NodeRole::ReplicaSetMember;
            instance.replica_set = Some(set_name.to_string());
        } else {
            instance.role = NodeRole::Standalone;
        }
        Ok(())
    }
}

/// Pick the vendor label out of a `buildInfo` reply: the modules array
/// and the version string are both searched for vendor substrings.
fn detect_variant(build_info: &mongodb::bson::Document) -> String {
    let mut haystack = build_info.get_str("version").unwrap_or("").to_lowercase();
    if let Ok(modules) = build_info.get_array("modules") {
        for module in modules {
            if let Some(s) = module.as_str() {
                haystack.push(' ');
                haystack.push_str(&s.to_lowercase());
            }
        }
    }
    if haystack.contains("percona") {
        "percona".to_string()
    } else if haystack.contains("enterprise") {
        "enterprise".to_string()
    } else {
        "mongodb".to_string()
    }
}

/// The discovery engine: read-only queries against one host.
pub struct Discovery<'a> {
    exec: &'a dyn Executor,
    enricher: &'a dyn InstanceEnricher,
}

impl<'a> Discovery<'a> {
    /// Create an engine over the given substrate and enricher.
    pub fn new(exec: &'a dyn Executor, enricher: &'a dyn InstanceEnricher) -> Self {
        Self { exec, enricher }
    }

    /// Manual mode: trust the caller's identity, then enrich
    /// best-effort.
    pub fn manual(&self, identity: &ManualInstance) -> Result<DatabaseInstance> {
        let mut instance = DatabaseInstance::new(identity.host.clone(), identity.port)?;
        instance.config_path = Some(identity.config_path.clone());
        instance.data_dir = Some(identity.data_dir.clone());
        if let Err(e) = self.enricher.enrich(&mut instance) {
            tracing::debug!("enrichment skipped for {}: {e:#}", instance.node_id());
        }
        if let Some(role) = identity.role_hint {
            instance.role = role;
        }
        Ok(instance)
    }

    /// Auto mode: find every mongod/mongos in the process table, parse
    /// its command line, and enrich. Zero hits is an error.
    #[context("Discovering database processes on {host}")]
    pub fn auto(&self, host: &str) -> Result<Vec<DatabaseInstance>> {
        let ps = self
            .exec
            .run("ps aux | grep -E 'mongod|mongos' | grep -v grep")
            .unwrap_or_default();
        let mut instances = Vec::new();
        for line in ps.lines() {
            if let Some(mut instance) = parse_process_line(host, line)? {
                if let Err(e) = self.enricher.enrich(&mut instance) {
                    tracing::debug!("enrichment skipped for {}: {e:#}", instance.node_id());
                }
                refine_role_from_command(&mut instance, line);
                instances.push(instance);
            }
        }
        if instances.is_empty() {
            return Err(DiscoveryError::NothingFound.into());
        }
        Ok(instances)
    }

    /// Enumerate the host's init units that belong to mongod/mongos
    /// processes, with their unit files parsed and status recorded.
    #[context("Enumerating database init units")]
    pub fn find_units(&self) -> Result<Vec<InitUnit>> {
        let listing = self
            .exec
            .run("systemctl list-units --type=service --all | grep -E 'mongo[ds]'")
            .unwrap_or_default();
        let mut units = Vec::new();
        for line in listing.lines() {
            let Some((unit_name, status)) = parse_unit_listing_line(line) else {
                continue;
            };
            let show = self
                .exec
                .run(&format!("systemctl show -p FragmentPath {unit_name}"))
                .unwrap_or_default();
            let fragment = Utf8PathBuf::from(
                show.trim().strip_prefix("FragmentPath=").unwrap_or(""),
            );
            let mut unit = if fragment.as_str().is_empty() {
                InitUnit {
                    name: sysunit::normalize_unit_name(&unit_name).to_string(),
                    ..Default::default()
                }
            } else {
                let text = self
                    .exec
                    .read_file(&fragment)
                    .with_context(|| format!("Reading unit file {fragment}"))?;
                let mut unit = sysunit::parse_unit(&unit_name, &String::from_utf8_lossy(&text));
                unit.fragment_path = Some(fragment);
                unit
            };
            unit.status = status;
            units.push(unit);
        }
        Ok(units)
    }
}

/// Flag regexes applied to discovered command lines; whitespace and
/// equals-sign separators both occur in the wild.
fn flag_value(cmd: &str, flag: &str) -> Option<String> {
    // Compiled per call; discovery runs once per import.
    let re = Regex::new(&format!(r"--{flag}(?:=|\s+)(\S+)")).expect("static regex");
    re.captures(cmd).map(|c| c[1].to_string())
}

/// Parse one `ps aux` line into a skeletal instance. Lines that are not
/// database processes (stray grep, other matches) yield `None`.
fn parse_process_line(host: &str, line: &str) -> Result<Option<DatabaseInstance>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 11 {
        return Ok(None);
    }
    let command = fields[10..].join(" ");
    let executable = fields[10];
    if !(executable.contains("mongod") || executable.contains("mongos")) {
        return Ok(None);
    }
    let port = match flag_value(&command, "port") {
        Some(v) => v
            .parse::<u16>()
            .with_context(|| format!("Parsing port from {command:?}"))?,
        None => DEFAULT_PORT,
    };
    let mut instance = DatabaseInstance::new(host, port)?;
    if executable.contains("mongos") {
        // Routers are recognizable without a driver round-trip
        instance.role = NodeRole::ShardedRouter;
    }
    instance.pid = fields[1].parse::<u32>().ok();
    instance.config_path = flag_value(&command, "config").map(Utf8PathBuf::from);
    instance.data_dir = flag_value(&command, "dbpath").map(Utf8PathBuf::from);
    instance.log_path = flag_value(&command, "logpath").map(Utf8PathBuf::from);
    if let Some(bind) = flag_value(&command, "bind_ip") {
        if !matches!(bind.as_str(), "0.0.0.0" | "::") {
            instance.host = bind;
        }
    }
    Ok(Some(instance))
}

/// Sharded-cluster roles the driver reply cannot always distinguish are
/// visible on the command line.
fn refine_role_from_command(instance: &mut DatabaseInstance, command: &str) {
    if command.contains("--configsvr") {
        instance.role = NodeRole::ConfigMember;
    } else if command.contains("--shardsvr") {
        instance.role = NodeRole::ShardMember;
    }
}

/// Pull `(unit, status)` from one `systemctl list-units` row; the
/// leading state bullet is dropped when present.
fn parse_unit_listing_line(line: &str) -> Option<(String, UnitStatus)> {
    let mut tokens = line.split_whitespace().peekable();
    if matches!(tokens.peek(), Some(&"●") | Some(&"*")) {
        let _ = tokens.next();
    }
    let unit = tokens.next()?;
    if !unit.ends_with(".service") {
        return None;
    }
    let _load = tokens.next()?;
    let active = tokens.next()?;
    Some((unit.to_string(), UnitStatus::from_column(active)))
}
