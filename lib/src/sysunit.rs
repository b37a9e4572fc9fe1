//! Parsing of host init-system (systemd) unit files.
//!
//! This is a pure text parser: it recognizes the `[Unit]` and
//! `[Service]` sections, lifts out the fields the import cares about,
//! and digs the config-file path and command-line overrides out of the
//! start command. No I/O happens here.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

/// Activation state of a unit as reported by the init system.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UnitStatus {
    /// The unit is running.
    Active,
    /// The unit is loaded but stopped.
    Inactive,
    /// Any other state string (failed, activating, ...).
    Other(String),
    /// Not yet queried.
    #[default]
    Unknown,
}

impl UnitStatus {
    /// Map the `ACTIVE` column of `systemctl list-units` output.
    pub fn from_column(s: &str) -> Self {
        match s {
            "active" => UnitStatus::Active,
            "inactive" => UnitStatus::Inactive,
            other => UnitStatus::Other(other.to_string()),
        }
    }
}

/// A parsed init-system unit for a database process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitUnit {
    /// Unit name with any trailing `.service` stripped.
    pub name: String,
    /// `Description=` from the `[Unit]` section.
    pub description: String,
    /// `User=` the service runs as.
    pub user: String,
    /// `Group=` the service runs as.
    pub group: String,
    /// The literal `ExecStart=` command.
    pub exec_start: String,
    /// All `ExecStartPre=` commands, in order.
    pub exec_start_pre: Vec<String>,
    /// `Environment=` entries, quotes stripped.
    pub environment: BTreeMap<String, String>,
    /// `EnvironmentFile=` paths, optional-file `-` prefix stripped.
    pub environment_files: Vec<String>,
    /// `PIDFile=` if declared.
    pub pid_file: String,
    /// `Type=` (simple, forking, ...).
    pub service_type: String,
    /// `Restart=` policy.
    pub restart: String,
    /// Activation state; filled in by discovery, not by the parser.
    pub status: UnitStatus,
    /// Unit file location, from `systemctl show -p FragmentPath`.
    pub fragment_path: Option<Utf8PathBuf>,
    /// Config path extracted from the start command.
    pub config_path: Option<Utf8PathBuf>,
    /// Long-form flags of the start command; short `-f` is recorded
    /// under `config`.
    pub flags: BTreeMap<String, String>,
}

/// Strip a trailing `.service` from a unit name.
pub fn normalize_unit_name(name: &str) -> &str {
    name.strip_suffix(".service").unwrap_or(name)
}

/// Parse one unit file's text.
pub fn parse_unit(name: &str, text: &str) -> InitUnit {
    let mut unit = InitUnit {
        name: normalize_unit_name(name).to_string(),
        ..Default::default()
    };
    let mut section = "";
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = match header {
                "Unit" => "Unit",
                "Service" => "Service",
                _ => "",
            };
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match (section, key) {
            ("Unit", "Description") => unit.description = value.to_string(),
            ("Service", "User") => unit.user = value.to_string(),
            ("Service", "Group") => unit.group = value.to_string(),
            ("Service", "ExecStart") => {
                // An empty assignment resets previous ones
                if value.is_empty() {
                    unit.exec_start.clear();
                } else {
                    unit.exec_start = value.to_string();
                }
            }
            ("Service", "ExecStartPre") => unit.exec_start_pre.push(value.to_string()),
            ("Service", "Environment") => {
                for (k, v) in parse_environment(value) {
                    unit.environment.insert(k, v);
                }
            }
            ("Service", "EnvironmentFile") => {
                let path = value.strip_prefix('-').unwrap_or(value);
                unit.environment_files.push(path.to_string());
            }
            ("Service", "PIDFile") => unit.pid_file = value.to_string(),
            ("Service", "Type") => unit.service_type = value.to_string(),
            ("Service", "Restart") => unit.restart = value.to_string(),
            _ => {}
        }
    }
    unit.config_path = extract_config_path(&unit.exec_start);
    unit.flags = extract_flags(&unit.exec_start);
    unit
}

/// Split an `Environment=` value into `KEY=VALUE` entries, stripping
/// surrounding double quotes. systemd allows several quoted assignments
/// on one line.
fn parse_environment(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = value.trim();
    while !rest.is_empty() {
        let word;
        if let Some(stripped) = rest.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    word = &stripped[..end];
                    rest = stripped[end + 1..].trim_start();
                }
                None => {
                    word = stripped;
                    rest = "";
                }
            }
        } else {
            match rest.find(char::is_whitespace) {
                Some(end) => {
                    word = &rest[..end];
                    rest = rest[end..].trim_start();
                }
                None => {
                    word = rest;
                    rest = "";
                }
            }
        }
        if let Some((k, v)) = word.split_once('=') {
            let v = v.trim_matches('"');
            out.push((k.to_string(), v.to_string()));
        }
    }
    out
}

/// Extract the config file path from a start command: the first of
/// `--config VAL`, `--config=VAL`, `-f VAL`, `-f=VAL`.
pub fn extract_config_path(cmd: &str) -> Option<Utf8PathBuf> {
    let mut tokens = cmd.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        for flag in ["--config", "-f"] {
            if token == flag {
                if let Some(value) = tokens.peek() {
                    return Some(Utf8PathBuf::from(*value));
                }
            } else if let Some(value) = token
                .strip_prefix(flag)
                .and_then(|rest| rest.strip_prefix('='))
            {
                return Some(Utf8PathBuf::from(value));
            }
        }
    }
    None
}

/// Collect all long-form flags (`--name VAL` or `--name=VAL`) of a start
/// command into a map. Value-less flags map to the empty string; the
/// short form `-f VAL` is recorded under `config`.
pub fn extract_flags(cmd: &str) -> BTreeMap<String, String> {
    let mut flags = BTreeMap::new();
    let mut tokens = cmd.split_whitespace().peekable();
    // argv[0]
    let _ = tokens.next();
    while let Some(token) = tokens.next() {
        if let Some(rest) = token.strip_prefix("--") {
            if let Some((name, value)) = rest.split_once('=') {
                flags.insert(name.to_string(), value.to_string());
            } else {
                let value = match tokens.peek() {
                    Some(next) if !next.starts_with('-') => tokens.next().unwrap_or(""),
                    _ => "",
                };
                flags.insert(rest.to_string(), value.to_string());
            }
        } else if token == "-f" {
            if let Some(next) = tokens.peek() {
                if !next.starts_with('-') {
                    let value = tokens.next().unwrap_or("");
                    flags.insert("config".to_string(), value.to_string());
                }
            }
        } else if let Some(value) = token.strip_prefix("-f=") {
            flags.insert("config".to_string(), value.to_string());
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const MONGOD_UNIT: &str = indoc! { r#"
        [Unit]
        Description=MongoDB Database Server
        Documentation=https://docs.mongodb.org/manual
        After=network-online.target

        [Service]
        User=mongodb
        Group=mongodb
        Environment="OPTIONS=-f /etc/mongod.conf" "GLIBC_TUNABLES=glibc.pthread.rseq=0"
        EnvironmentFile=-/etc/sysconfig/mongod
        ExecStartPre=/usr/bin/mkdir -p /var/run/mongodb
        ExecStartPre=/usr/bin/chown mongod:mongod /var/run/mongodb
        ExecStart=/usr/bin/mongod --config /etc/mongod.conf --port 27017
        PIDFile=/var/run/mongodb/mongod.pid
        Type=forking
        Restart=on-failure

        [Install]
        WantedBy=multi-user.target
    "# };

    #[test]
    fn test_parse_unit() {
        let unit = parse_unit("mongod.service", MONGOD_UNIT);
        assert_eq!(unit.name, "mongod");
        assert_eq!(unit.description, "MongoDB Database Server");
        assert_eq!(unit.user, "mongodb");
        assert_eq!(unit.group, "mongodb");
        assert_eq!(
            unit.exec_start,
            "/usr/bin/mongod --config /etc/mongod.conf --port 27017"
        );
        assert_eq!(unit.exec_start_pre.len(), 2);
        assert_eq!(
            unit.environment.get("OPTIONS").map(|s| s.as_str()),
            Some("-f /etc/mongod.conf")
        );
        assert_eq!(
            unit.environment.get("GLIBC_TUNABLES").map(|s| s.as_str()),
            Some("glibc.pthread.rseq=0")
        );
        assert_eq!(unit.environment_files, vec!["/etc/sysconfig/mongod"]);
        assert_eq!(unit.pid_file, "/var/run/mongodb/mongod.pid");
        assert_eq!(unit.service_type, "forking");
        assert_eq!(unit.restart, "on-failure");
        assert_eq!(
            unit.config_path.as_deref(),
            Some(camino::Utf8Path::new("/etc/mongod.conf"))
        );
        assert_eq!(unit.flags.get("port").map(|s| s.as_str()), Some("27017"));
    }

    #[test]
    fn test_config_path_forms() {
        for cmd in [
            "/usr/bin/mongod --config /etc/mongod.conf",
            "/usr/bin/mongod --config=/etc/mongod.conf",
            "/usr/bin/mongod -f /etc/mongod.conf",
            "/usr/bin/mongod -f=/etc/mongod.conf",
        ] {
            assert_eq!(
                extract_config_path(cmd).as_deref(),
                Some(camino::Utf8Path::new("/etc/mongod.conf")),
                "{cmd}"
            );
        }
        assert_eq!(extract_config_path("/usr/bin/mongod --port 27017"), None);
    }

    #[test]
    fn test_extract_flags() {
        let flags =
            extract_flags("/usr/bin/mongod --port=27018 --fork --dbpath /data/db -f /etc/m.conf");
        assert_eq!(flags.get("port").map(|s| s.as_str()), Some("27018"));
        assert_eq!(flags.get("fork").map(|s| s.as_str()), Some(""));
        assert_eq!(flags.get("dbpath").map(|s| s.as_str()), Some("/data/db"));
        assert_eq!(flags.get("config").map(|s| s.as_str()), Some("/etc/m.conf"));
    }

    #[test]
    fn test_exec_start_reset() {
        let text = indoc! { "
            [Service]
            ExecStart=/usr/bin/old
            ExecStart=
            ExecStart=/usr/bin/mongos --configdb rs/cfg:27019
        " };
        let unit = parse_unit("mongos", text);
        assert_eq!(unit.exec_start, "/usr/bin/mongos --configdb rs/cfg:27019");
    }

    #[test]
    fn test_normalize_unit_name() {
        assert_eq!(normalize_unit_name("mongod.service"), "mongod");
        assert_eq!(normalize_unit_name("mongod"), "mongod");
    }
}
