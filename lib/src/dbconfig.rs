//! Parsing and transformation of MongoDB configuration files.
//!
//! Handles both the structured (YAML) format and the legacy flat
//! `key=value` format, rewrites paths to the adopted layout, strips
//! daemonisation (the supervisor owns the process lifetime), and carries
//! the operator's custom settings over. Everything here is pure; reading
//! and writing the files is the caller's business.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// The two on-disk config formats mongod has used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// Hierarchical YAML document (2.6+).
    Structured,
    /// Flat `key=value` lines.
    Legacy,
}

/// `net` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Net {
    /// Listen port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Listen address(es).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    /// Connection cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_incoming_connections: Option<i64>,
    /// Transport security settings, copied wholesale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<Value>,
}

/// `storage` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Journal settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<Value>,
    /// Storage engine name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Engine-specific tuning, copied wholesale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wired_tiger: Option<Value>,
}

/// `systemLog` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemLog {
    /// `file` or `syslog`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Log file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Append instead of truncating on restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_append: Option<bool>,
}

/// `processManagement` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessManagement {
    /// Daemonise; always disabled after adoption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork: Option<bool>,
    /// Pid file; dropped after adoption, the supervisor tracks pids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file_path: Option<String>,
}

/// `replication` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replication {
    /// Replica set name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repl_set_name: Option<String>,
    /// Oplog size in megabytes.
    #[serde(rename = "oplogSizeMB", skip_serializing_if = "Option::is_none")]
    pub oplog_size_mb: Option<i64>,
}

/// `sharding` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sharding {
    /// `shardsvr` or `configsvr`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_role: Option<String>,
    /// Config-server connection string (mongos).
    #[serde(rename = "configDB", skip_serializing_if = "Option::is_none")]
    pub config_db: Option<String>,
}

/// The fixed schema mup understands. Sections it does not model are not
/// round-tripped; the custom-setting merge below covers the free-form
/// ones operators actually tune.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoConfig {
    /// `net` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<Net>,
    /// `storage` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
    /// `systemLog` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_log: Option<SystemLog>,
    /// `processManagement` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_management: Option<ProcessManagement>,
    /// `replication` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<Replication>,
    /// `sharding` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharding: Option<Sharding>,
    /// Free-form `setParameter` map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_parameter: Option<BTreeMap<String, Value>>,
    /// `operationProfiling`, copied wholesale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_profiling: Option<Value>,
    /// `security`, copied wholesale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Value>,
}

/// Post-adoption filesystem locations for one instance.
#[derive(Debug, Clone)]
pub struct AdoptedPaths {
    /// Where the instance's data lives (the symlink under the layout).
    pub data_dir: Utf8PathBuf,
    /// Where the instance logs after adoption.
    pub log_path: Utf8PathBuf,
}

/// Decide which format a config file is in. The first line that
/// contains `:` but not `=` (or the reverse) decides; ambiguous files
/// default to structured.
pub fn detect_format(text: &str) -> ConfigFormat {
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let has_colon = line.contains(':');
        let has_equals = line.contains('=');
        if has_colon && !has_equals {
            return ConfigFormat::Structured;
        }
        if has_equals && !has_colon {
            return ConfigFormat::Legacy;
        }
    }
    ConfigFormat::Structured
}

/// Parse a config file in either format.
pub fn parse_config(text: &str) -> Result<MongoConfig> {
    match detect_format(text) {
        ConfigFormat::Structured => {
            serde_yaml::from_str(text).context("Parsing structured database config")
        }
        ConfigFormat::Legacy => parse_legacy(text),
    }
}

fn parse_bool(v: &str) -> bool {
    v.eq_ignore_ascii_case("true")
}

/// The legacy flat format, mapped key by key onto the structured schema.
fn parse_legacy(text: &str) -> Result<MongoConfig> {
    let mut config = MongoConfig::default();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "port" => {
                config.net.get_or_insert_with(Default::default).port =
                    Some(value.parse().with_context(|| format!("Parsing port {value:?}"))?)
            }
            "bind_ip" => {
                config.net.get_or_insert_with(Default::default).bind_ip = Some(value.to_string())
            }
            "maxConns" => {
                config
                    .net
                    .get_or_insert_with(Default::default)
                    .max_incoming_connections =
                    Some(value.parse().with_context(|| format!("Parsing maxConns {value:?}"))?)
            }
            "dbpath" => {
                config.storage.get_or_insert_with(Default::default).db_path =
                    Some(value.to_string())
            }
            "journal" => {
                let mut journal = serde_yaml::Mapping::new();
                journal.insert("enabled".into(), Value::Bool(parse_bool(value)));
                config.storage.get_or_insert_with(Default::default).journal =
                    Some(Value::Mapping(journal));
            }
            "storageEngine" => {
                config.storage.get_or_insert_with(Default::default).engine =
                    Some(value.to_string())
            }
            "logpath" => {
                let log = config.system_log.get_or_insert_with(Default::default);
                log.destination = Some("file".to_string());
                log.path = Some(value.to_string());
            }
            "logappend" => {
                config
                    .system_log
                    .get_or_insert_with(Default::default)
                    .log_append = Some(parse_bool(value))
            }
            "fork" => {
                config
                    .process_management
                    .get_or_insert_with(Default::default)
                    .fork = Some(parse_bool(value))
            }
            "pidfilepath" => {
                config
                    .process_management
                    .get_or_insert_with(Default::default)
                    .pid_file_path = Some(value.to_string())
            }
            "replSet" => {
                config
                    .replication
                    .get_or_insert_with(Default::default)
                    .repl_set_name = Some(value.to_string())
            }
            "oplogSize" => {
                config
                    .replication
                    .get_or_insert_with(Default::default)
                    .oplog_size_mb =
                    Some(value.parse().with_context(|| format!("Parsing oplogSize {value:?}"))?)
            }
            "shardsvr" if parse_bool(value) => {
                config
                    .sharding
                    .get_or_insert_with(Default::default)
                    .cluster_role = Some("shardsvr".to_string())
            }
            "configsvr" if parse_bool(value) => {
                config
                    .sharding
                    .get_or_insert_with(Default::default)
                    .cluster_role = Some("configsvr".to_string())
            }
            "configdb" => {
                config
                    .sharding
                    .get_or_insert_with(Default::default)
                    .config_db = Some(value.to_string())
            }
            "auth" if parse_bool(value) => {
                let mut security = serde_yaml::Mapping::new();
                security.insert("authorization".into(), Value::String("enabled".into()));
                config.security = Some(Value::Mapping(security));
            }
            "setParameter" => {
                if let Some((k, v)) = value.split_once('=') {
                    config
                        .set_parameter
                        .get_or_insert_with(Default::default)
                        .insert(k.trim().to_string(), Value::String(v.trim().to_string()));
                }
            }
            other => tracing::debug!("ignoring legacy config key {other}"),
        }
    }
    Ok(config)
}

/// Produce the adopted form of a config: paths moved to the adopted
/// layout, daemonisation stripped, then the operator's custom settings
/// merged back on top.
pub fn transform(original: &MongoConfig, paths: &AdoptedPaths) -> MongoConfig {
    let original_net = original.net.clone().unwrap_or_default();
    let original_storage = original.storage.clone().unwrap_or_default();
    let original_log = original.system_log.clone().unwrap_or_default();

    let mut adopted = MongoConfig {
        net: Some(Net {
            port: original_net.port,
            bind_ip: original_net.bind_ip.clone(),
            max_incoming_connections: None,
            tls: None,
        }),
        storage: Some(Storage {
            db_path: Some(paths.data_dir.to_string()),
            journal: original_storage.journal.clone(),
            engine: original_storage.engine.clone(),
            wired_tiger: None,
        }),
        system_log: Some(SystemLog {
            destination: Some(original_log.destination.unwrap_or_else(|| "file".to_string())),
            path: Some(paths.log_path.to_string()),
            log_append: Some(original_log.log_append.unwrap_or(true)),
        }),
        process_management: Some(ProcessManagement {
            fork: Some(false),
            pid_file_path: None,
        }),
        replication: original
            .replication
            .as_ref()
            .and_then(|r| r.repl_set_name.clone())
            .map(|name| Replication {
                repl_set_name: Some(name),
                oplog_size_mb: None,
            }),
        sharding: original.sharding.clone(),
        set_parameter: None,
        operation_profiling: None,
        security: None,
    };
    merge_custom(original, &mut adopted);
    adopted
}

/// Merge the operator's custom settings from `original` onto the
/// rewritten form. The original wins on setParameter key collisions.
fn merge_custom(original: &MongoConfig, adopted: &mut MongoConfig) {
    if let Some(params) = original.set_parameter.as_ref() {
        let merged = adopted.set_parameter.get_or_insert_with(Default::default);
        for (k, v) in params {
            merged.insert(k.clone(), v.clone());
        }
    }
    if let Some(profiling) = original.operation_profiling.as_ref() {
        adopted.operation_profiling = Some(profiling.clone());
    }
    if let Some(security) = original.security.as_ref() {
        adopted.security = Some(security.clone());
    }
    if let Some(tls) = original.net.as_ref().and_then(|n| n.tls.as_ref()) {
        adopted.net.get_or_insert_with(Default::default).tls = Some(tls.clone());
    }
    if let Some(wt) = original.storage.as_ref().and_then(|s| s.wired_tiger.as_ref()) {
        adopted
            .storage
            .get_or_insert_with(Default::default)
            .wired_tiger = Some(wt.clone());
    }
    if let Some(oplog) = original
        .replication
        .as_ref()
        .and_then(|r| r.oplog_size_mb)
        .filter(|v| *v > 0)
    {
        adopted
            .replication
            .get_or_insert_with(Default::default)
            .oplog_size_mb = Some(oplog);
    }
    if let Some(max) = original
        .net
        .as_ref()
        .and_then(|n| n.max_incoming_connections)
        .filter(|v| *v > 0)
    {
        adopted
            .net
            .get_or_insert_with(Default::default)
            .max_incoming_connections = Some(max);
    }
}

/// Serialize a config back to YAML.
pub fn to_yaml(config: &MongoConfig) -> Result<String> {
    serde_yaml::to_string(config).context("Serializing database config")
}

/// Parse, transform, and re-serialize a config file's text.
pub fn transform_text(text: &str, paths: &AdoptedPaths) -> Result<String> {
    let original = parse_config(text)?;
    to_yaml(&transform(&original, paths))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const STRUCTURED: &str = indoc! { r#"
        # mongod.conf
        storage:
          dbPath: /var/lib/mongodb
          journal:
            enabled: true
          wiredTiger:
            engineConfig:
              cacheSizeGB: 4
        systemLog:
          destination: file
          path: /var/log/mongodb/mongod.log
        net:
          port: 27017
          bindIp: 0.0.0.0
          maxIncomingConnections: 2048
        processManagement:
          fork: true
          pidFilePath: /var/run/mongod.pid
        replication:
          replSetName: rs0
          oplogSizeMB: 1024
        setParameter:
          enableLocalhostAuthBypass: false
        security:
          authorization: enabled
    "# };

    const LEGACY: &str = indoc! { r#"
        # old-style config
        dbpath=/data/db
        logpath=/var/log/mongodb.log
        logappend=true
        port=27018
        bind_ip=127.0.0.1
        fork=true
        replSet=rs1
        oplogSize=512
        journal=true
        maxConns=500
    "# };

    fn paths() -> AdoptedPaths {
        AdoptedPaths {
            data_dir: "/opt/c/data/localhost-27017".into(),
            log_path: "/opt/c/current/logs/localhost-27017.log".into(),
        }
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(STRUCTURED), ConfigFormat::Structured);
        assert_eq!(detect_format(LEGACY), ConfigFormat::Legacy);
        assert_eq!(detect_format("# only comments\n"), ConfigFormat::Structured);
    }

    #[test]
    fn test_parse_structured() {
        let config = parse_config(STRUCTURED).unwrap();
        let net = config.net.as_ref().unwrap();
        assert_eq!(net.port, Some(27017));
        assert_eq!(net.bind_ip.as_deref(), Some("0.0.0.0"));
        assert_eq!(
            config.storage.as_ref().unwrap().db_path.as_deref(),
            Some("/var/lib/mongodb")
        );
        assert_eq!(
            config
                .replication
                .as_ref()
                .unwrap()
                .repl_set_name
                .as_deref(),
            Some("rs0")
        );
        assert!(config.security.is_some());
    }

    #[test]
    fn test_parse_legacy_maps_keys() {
        let config = parse_config(LEGACY).unwrap();
        let net = config.net.as_ref().unwrap();
        assert_eq!(net.port, Some(27018));
        assert_eq!(net.bind_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(net.max_incoming_connections, Some(500));
        assert_eq!(
            config.storage.as_ref().unwrap().db_path.as_deref(),
            Some("/data/db")
        );
        let log = config.system_log.as_ref().unwrap();
        assert_eq!(log.destination.as_deref(), Some("file"));
        assert_eq!(log.log_append, Some(true));
        assert_eq!(
            config
                .replication
                .as_ref()
                .unwrap()
                .repl_set_name
                .as_deref(),
            Some("rs1")
        );
        assert_eq!(config.replication.as_ref().unwrap().oplog_size_mb, Some(512));
    }

    #[test]
    fn test_transform_rewrites_paths_and_strips_fork() {
        let original = parse_config(STRUCTURED).unwrap();
        let adopted = transform(&original, &paths());
        assert_eq!(
            adopted.storage.as_ref().unwrap().db_path.as_deref(),
            Some("/opt/c/data/localhost-27017")
        );
        let log = adopted.system_log.as_ref().unwrap();
        assert_eq!(log.destination.as_deref(), Some("file"));
        assert_eq!(
            log.path.as_deref(),
            Some("/opt/c/current/logs/localhost-27017.log")
        );
        assert_eq!(log.log_append, Some(true));
        let pm = adopted.process_management.as_ref().unwrap();
        assert_eq!(pm.fork, Some(false));
        assert_eq!(pm.pid_file_path, None);
    }

    #[test]
    fn test_transform_preserves_custom_settings() {
        let original = parse_config(STRUCTURED).unwrap();
        let adopted = transform(&original, &paths());
        // Wholesale copies
        assert_eq!(adopted.security, original.security);
        assert!(adopted.storage.as_ref().unwrap().wired_tiger.is_some());
        // Positive values carried
        assert_eq!(
            adopted.replication.as_ref().unwrap().oplog_size_mb,
            Some(1024)
        );
        assert_eq!(
            adopted.net.as_ref().unwrap().max_incoming_connections,
            Some(2048)
        );
        // setParameter union, original wins
        let params = adopted.set_parameter.as_ref().unwrap();
        assert_eq!(
            params.get("enableLocalhostAuthBypass"),
            Some(&Value::Bool(false))
        );
        // Port and replica set survive
        assert_eq!(adopted.net.as_ref().unwrap().port, Some(27017));
        assert_eq!(
            adopted
                .replication
                .as_ref()
                .unwrap()
                .repl_set_name
                .as_deref(),
            Some("rs0")
        );
    }

    #[test]
    fn test_roundtrip_structural_equality() {
        let original = parse_config(STRUCTURED).unwrap();
        let adopted = transform(&original, &paths());
        let text = to_yaml(&adopted).unwrap();
        let reparsed = parse_config(&text).unwrap();
        similar_asserts::assert_eq!(adopted, reparsed);
    }

    #[test]
    fn test_transform_is_deterministic() {
        let a = transform_text(STRUCTURED, &paths()).unwrap();
        let b = transform_text(STRUCTURED, &paths()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_legacy_transform() {
        let text = transform_text(LEGACY, &paths()).unwrap();
        let adopted = parse_config(&text).unwrap();
        assert_eq!(
            adopted.net.as_ref().unwrap().max_incoming_connections,
            Some(500)
        );
        assert_eq!(adopted.process_management.as_ref().unwrap().fork, Some(false));
    }
}
