//! Derivation of the telemetry sidecar fleet and the metrics store's
//! scrape configuration.
//!
//! One host-local-metrics exporter per unique host in the topology, one
//! database-metrics exporter per database process. Derivation is pure;
//! the scrape document is only written when explicitly asked.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::exec::Executor;
use crate::topology::ClusterTopology;

/// Conventional listen port for host-local-metrics exporters.
pub const DEFAULT_HOST_METRICS_PORT: u16 = 9100;

/// Conventional base port for database-metrics exporters.
pub const DEFAULT_DB_METRICS_PORT_BASE: u16 = 9216;

/// File name of the scrape configuration under the cluster root.
pub const SCRAPE_CONFIG_FILE: &str = "prometheus.yaml";

/// A host-local-metrics sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostExporter {
    /// Host the exporter runs on.
    pub host: String,
    /// Port it serves metrics on.
    pub listen_port: u16,
}

/// A database-metrics sidecar, bound to one database process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbExporter {
    /// Host the exporter (and its database) runs on.
    pub host: String,
    /// Port it serves metrics on; auto-assigned from the base.
    pub listen_port: u16,
    /// Port of the database process it watches.
    pub db_port: u16,
}

/// The derived exporter fleet for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExporterRegistry {
    /// One per unique host in the topology.
    pub host_exporters: Vec<HostExporter>,
    /// One per database process.
    pub db_exporters: Vec<DbExporter>,
}

impl ExporterRegistry {
    /// Walk the topology (database nodes, then routers, then config
    /// nodes) and derive the fleet. Listen ports for database-metrics
    /// exporters are `port_base + k` with `k` advancing for every
    /// emitted exporter, never reset per host.
    pub fn derive(
        topology: &ClusterTopology,
        host_metrics_port: u16,
        db_metrics_port_base: u16,
    ) -> Self {
        let mut registry = Self::default();
        let mut seen_hosts: Vec<&str> = Vec::new();
        let mut k = 0u16;
        for node in topology.all_nodes() {
            if !seen_hosts.contains(&node.host.as_str()) {
                seen_hosts.push(&node.host);
                registry.host_exporters.push(HostExporter {
                    host: node.host.clone(),
                    listen_port: host_metrics_port,
                });
            }
            registry.db_exporters.push(DbExporter {
                host: node.host.clone(),
                listen_port: db_metrics_port_base + k,
                db_port: node.port,
            });
            k += 1;
        }
        registry
    }
}

/// `global` section of the scrape document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeGlobal {
    /// How often the store polls targets.
    pub scrape_interval: String,
    /// Labels attached to everything scraped, carrying the cluster name.
    pub external_labels: BTreeMap<String, String>,
}

/// One `static_configs` entry: targets plus their labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    /// `host:port` scrape endpoints.
    pub targets: Vec<String>,
    /// Labels attached to these targets.
    pub labels: BTreeMap<String, String>,
}

/// One scrape job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    /// Job name.
    pub job_name: String,
    /// Target groups.
    pub static_configs: Vec<StaticConfig>,
}

/// The metrics store's scrape configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Global scrape settings.
    pub global: ScrapeGlobal,
    /// The host-local and database jobs.
    pub scrape_configs: Vec<ScrapeJob>,
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Role label for a database target, cross-referenced against the
/// topology collections.
fn role_label(topology: &ClusterTopology, host: &str, port: u16) -> &'static str {
    let matches = |nodes: &[crate::topology::TopologyNode]| {
        nodes.iter().any(|n| n.host == host && n.port == port)
    };
    if matches(&topology.mongos) {
        "router"
    } else if matches(&topology.config_svr) {
        "config-node"
    } else {
        "database-node"
    }
}

impl ScrapeConfig {
    /// Build the two scrape jobs for a derived fleet.
    pub fn build(
        topology: &ClusterTopology,
        registry: &ExporterRegistry,
        cluster: &str,
        scrape_interval: &str,
    ) -> Self {
        let host_job = ScrapeJob {
            job_name: "node".to_string(),
            static_configs: registry
                .host_exporters
                .iter()
                .map(|e| StaticConfig {
                    targets: vec![format!("{}:{}", e.host, e.listen_port)],
                    labels: labels(&[("host", &e.host), ("role", "database-host")]),
                })
                .collect(),
        };
        let db_job = ScrapeJob {
            job_name: "mongodb".to_string(),
            static_configs: registry
                .db_exporters
                .iter()
                .map(|e| {
                    let mut l = labels(&[
                        ("host", &e.host),
                        ("port", &e.db_port.to_string()),
                        ("role", role_label(topology, &e.host, e.db_port)),
                    ]);
                    let member = topology
                        .all_nodes()
                        .find(|n| n.host == e.host && n.port == e.db_port)
                        .and_then(|n| n.replica_set.clone());
                    if let Some(set) = member {
                        l.insert("replica_set".to_string(), set);
                    }
                    StaticConfig {
                        targets: vec![format!("{}:{}", e.host, e.listen_port)],
                        labels: l,
                    }
                })
                .collect(),
        };
        Self {
            global: ScrapeGlobal {
                scrape_interval: scrape_interval.to_string(),
                external_labels: labels(&[("cluster", cluster)]),
            },
            scrape_configs: vec![host_job, db_job],
        }
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing scrape config")
    }

    /// Write the document under the cluster root.
    pub fn write(&self, exec: &dyn Executor, cluster_dir: &Utf8Path) -> Result<()> {
        let path = cluster_dir.join(SCRAPE_CONFIG_FILE);
        exec.upload_content(self.to_yaml()?.as_bytes(), &path)
    }
}
