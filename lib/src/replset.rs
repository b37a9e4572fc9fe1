//! Replica-set primitives: status, stepdown, replication-lag probe.
//!
//! These are exposed to higher-level workflows (health display, rolling
//! maintenance) and are not part of the import itself. All of them talk
//! to a single member over a direct connection.

use std::time::Duration;

use anyhow::{Context, Result};
use fn_error_context::context;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, ServerAddress};
use mongodb::sync::Client;

use crate::discovery::DatabaseInstance;

/// Connect and server-selection deadline for these operations.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// One member row out of `replSetGetStatus`.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberStatus {
    /// Member host.
    pub host: String,
    /// Member port.
    pub port: u16,
    /// Numeric member state.
    pub state: i32,
    /// Human-readable state name, from the fixed table.
    pub state_string: String,
    /// Health indicator (1.0 = healthy).
    pub health: f64,
    /// Last applied op time, as milliseconds since the epoch.
    pub optime_millis: Option<i64>,
}

/// Parsed `replSetGetStatus` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSetStatus {
    /// Replica-set name.
    pub set: String,
    /// Member rows in server order.
    pub members: Vec<MemberStatus>,
}

/// The fixed member-state name table.
pub fn state_name(state: i32) -> String {
    match state {
        0 => "STARTUP".to_string(),
        1 => "PRIMARY".to_string(),
        2 => "SECONDARY".to_string(),
        3 => "RECOVERING".to_string(),
        5 => "STARTUP2".to_string(),
        6 => "UNKNOWN".to_string(),
        7 => "ARBITER".to_string(),
        8 => "DOWN".to_string(),
        9 => "ROLLBACK".to_string(),
        10 => "REMOVED".to_string(),
        other => format!("UNKNOWN({other})"),
    }
}

fn client(instance: &DatabaseInstance) -> Result<Client> {
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::Tcp {
            host: instance.connect_host().to_string(),
            port: Some(instance.port),
        }])
        .direct_connection(true)
        .connect_timeout(OPERATION_TIMEOUT)
        .server_selection_timeout(OPERATION_TIMEOUT)
        .build();
    Client::with_options(options).context("Building driver client")
}

fn int_field(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

/// Parse the member array of a raw `replSetGetStatus` reply.
pub fn parse_status(reply: &Document) -> Result<ReplicaSetStatus> {
    let set = reply.get_str("set").unwrap_or("").to_string();
    let mut members = Vec::new();
    for entry in reply.get_array("members").context("Missing members array")? {
        let member = entry
            .as_document()
            .context("Malformed member entry")?;
        let name = member.get_str("name").unwrap_or("");
        let (host, port) = match name.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .with_context(|| format!("Parsing member address {name:?}"))?,
            ),
            None => (name.to_string(), crate::discovery::DEFAULT_PORT),
        };
        let state = int_field(member, "state").unwrap_or(6) as i32;
        let health = match member.get("health") {
            Some(Bson::Double(v)) => *v,
            Some(Bson::Int32(v)) => *v as f64,
            Some(Bson::Int64(v)) => *v as f64,
            _ => 0.0,
        };
        let optime_millis = member
            .get_datetime("optimeDate")
            .ok()
            .map(|dt| dt.timestamp_millis());
        members.push(MemberStatus {
            host,
            port,
            state,
            state_string: state_name(state),
            health,
            optime_millis,
        });
    }
    Ok(ReplicaSetStatus { set, members })
}

/// Fetch and parse the set status from one member.
#[context("Querying replica-set status via {}:{}", instance.host, instance.port)]
pub fn status(instance: &DatabaseInstance) -> Result<ReplicaSetStatus> {
    let reply = client(instance)?
        .database("admin")
        .run_command(doc! { "replSetGetStatus": 1 })
        .run()
        .context("replSetGetStatus")?;
    parse_status(&reply)
}

/// Ask the connected member to step down for `timeout_secs`, never
/// forcing. The server closes the connection while replying, so an I/O
/// error on the reply is the expected success path.
#[context("Stepping down {}:{}", instance.host, instance.port)]
pub fn step_down(instance: &DatabaseInstance, timeout_secs: i64) -> Result<()> {
    let result = client(instance)?
        .database("admin")
        .run_command(doc! { "replSetStepDown": timeout_secs, "force": false })
        .run();
    match result {
        Ok(_) => Ok(()),
        Err(e) if matches!(*e.kind, ErrorKind::Io(_)) => {
            tracing::debug!("connection closed during stepdown reply (expected)");
            Ok(())
        }
        Err(e) => Err(e).context("replSetStepDown"),
    }
}

/// Check that no secondary trails the primary's optime by more than
/// `max_lag_secs`, using one status snapshot.
pub fn ensure_lag_within(status: &ReplicaSetStatus, max_lag_secs: i64) -> Result<()> {
    let primary = status
        .members
        .iter()
        .find(|m| m.state == 1)
        .context("Replica set has no primary")?;
    let primary_optime = primary
        .optime_millis
        .context("Primary reports no optime")?;
    let mut laggards = Vec::new();
    for member in status.members.iter().filter(|m| m.state == 2) {
        let Some(optime) = member.optime_millis else {
            laggards.push(format!("{}:{} has no optime", member.host, member.port));
            continue;
        };
        let lag_secs = (primary_optime - optime) / 1000;
        if lag_secs > max_lag_secs {
            laggards.push(format!(
                "{}:{} lags {lag_secs}s (limit {max_lag_secs}s)",
                member.host, member.port
            ));
        }
    }
    anyhow::ensure!(laggards.is_empty(), "replication lag: {}", laggards.join("; "));
    Ok(())
}

/// Fetch status and verify lag in one call.
pub fn check_replication_lag(instance: &DatabaseInstance, max_lag_secs: i64) -> Result<()> {
    ensure_lag_within(&status(instance)?, max_lag_secs)
}
