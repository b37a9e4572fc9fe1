//! Generation of the process-supervisor configuration fragment.
//!
//! The supervisor itself is an external program; mup only emits the
//! per-program stanzas for the exporter fleet plus a group stanza, and
//! places the fragment under the cluster root. Programs never autostart:
//! bring-up is an explicit operator action.

use anyhow::Result;
use camino::Utf8Path;
use tini::Ini;

use crate::exec::Executor;
use crate::exporters::ExporterRegistry;

/// File name of the fragment under the cluster root.
pub const SUPERVISOR_FRAGMENT_FILE: &str = "monitoring-supervisor.ini";

/// Start/stop tuning for a class of programs.
struct ProgramClass {
    startsecs: u32,
    startretries: u32,
    stopwaitsecs: u32,
}

/// Host-metrics exporters start instantly and stop fast.
const HOST_CLASS: ProgramClass = ProgramClass {
    startsecs: 2,
    startretries: 3,
    stopwaitsecs: 5,
};

/// Database-metrics exporters dial their database on startup, so they
/// get more slack.
const DB_CLASS: ProgramClass = ProgramClass {
    startsecs: 3,
    startretries: 5,
    stopwaitsecs: 10,
};

fn program_section(ini: Ini, name: &str, command: String, class: &ProgramClass) -> Ini {
    ini.section(format!("program:{name}"))
        .item("command", command)
        .item("autostart", "false")
        .item("autorestart", "unexpected")
        .item("stopsignal", "TERM")
        .item("startsecs", class.startsecs)
        .item("startretries", class.startretries)
        .item("stopwaitsecs", class.stopwaitsecs)
}

/// Render the fragment for a derived exporter fleet. `deploy_dir` is the
/// cluster root on the target host; binaries are addressed through its
/// `current` pointer.
pub fn render_fragment(registry: &ExporterRegistry, deploy_dir: &Utf8Path) -> String {
    let bin = deploy_dir.join("current/bin");
    let mut programs = Vec::new();
    let mut ini = Ini::new();
    for exporter in &registry.host_exporters {
        let name = format!("node-exporter-{}", exporter.host);
        let command = format!(
            "{bin}/node_exporter --web.listen-address=:{}",
            exporter.listen_port
        );
        ini = program_section(ini, &name, command, &HOST_CLASS);
        programs.push(name);
    }
    for exporter in &registry.db_exporters {
        let name = format!("mongodb-exporter-{}-{}", exporter.host, exporter.db_port);
        let command = format!(
            "{bin}/mongodb_exporter --web.listen-address=:{} --mongodb.uri=mongodb://{}:{}",
            exporter.listen_port, exporter.host, exporter.db_port
        );
        ini = program_section(ini, &name, command, &DB_CLASS);
        programs.push(name);
    }
    ini = ini
        .section("group:monitoring")
        .item("programs", programs.join(","));
    ini.to_string()
}

/// Write the fragment under the cluster root.
pub fn write_fragment(
    exec: &dyn Executor,
    cluster_dir: &Utf8Path,
    registry: &ExporterRegistry,
) -> Result<()> {
    let fragment = render_fragment(registry, cluster_dir);
    exec.upload_content(
        fragment.as_bytes(),
        &cluster_dir.join(SUPERVISOR_FRAGMENT_FILE),
    )
}
