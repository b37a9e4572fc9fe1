//! Test doubles shared across the crate's unit tests.
//!
//! `ScriptedExec` answers `run()` from a table of canned replies while
//! delegating real filesystem operations to a [`LocalExecutor`], so
//! layout and orchestrator tests exercise genuine symlink handling in a
//! tempdir without a systemd or a live database anywhere near them.

use std::cell::RefCell;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::discovery::{DatabaseInstance, InstanceEnricher, NodeRole};
use crate::exec::{ExecError, Executor, LocalExecutor, OsInfo};

struct Rule {
    prefix: String,
    output: String,
    status: i32,
    stderr: String,
}

pub(crate) struct ScriptedExec {
    local: LocalExecutor,
    rules: RefCell<Vec<Rule>>,
    log: RefCell<Vec<String>>,
}

impl ScriptedExec {
    pub(crate) fn new() -> Self {
        Self {
            local: LocalExecutor::new(),
            rules: RefCell::new(Vec::new()),
            log: RefCell::new(Vec::new()),
        }
    }

    /// Commands starting with `prefix` succeed with `output`.
    pub(crate) fn stub(&self, prefix: &str, output: &str) {
        self.rules.borrow_mut().push(Rule {
            prefix: prefix.to_string(),
            output: output.to_string(),
            status: 0,
            stderr: String::new(),
        });
    }

    /// Commands starting with `prefix` fail with the given status.
    pub(crate) fn fail(&self, prefix: &str, status: i32, stderr: &str) {
        self.rules.borrow_mut().push(Rule {
            prefix: prefix.to_string(),
            output: String::new(),
            status,
            stderr: stderr.to_string(),
        });
    }

    /// Every command dispatched so far, in order.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    fn dispatch(&self, cmd: &str) -> Result<String> {
        self.log.borrow_mut().push(cmd.to_string());
        for rule in self.rules.borrow().iter() {
            if cmd.starts_with(&rule.prefix) {
                if rule.status == 0 {
                    return Ok(rule.output.clone());
                }
                let err = ExecError::CommandFailed {
                    status: rule.status,
                    stderr: rule.stderr.clone(),
                };
                return Err(anyhow::Error::new(err).context(format!("Running `{cmd}`")));
            }
        }
        // Unscripted commands succeed silently
        Ok(String::new())
    }
}

impl Executor for ScriptedExec {
    fn run(&self, cmd: &str) -> Result<String> {
        self.dispatch(cmd)
    }
    fn run_with_stdin(&self, cmd: &str, _input: &[u8]) -> Result<String> {
        self.dispatch(cmd)
    }
    fn start_background(&self, cmd: &str) -> Result<u32> {
        let _ = self.dispatch(cmd)?;
        Ok(4242)
    }
    fn is_running(&self, _pid: u32) -> Result<bool> {
        Ok(true)
    }
    fn kill(&self, _pid: u32) -> Result<()> {
        Ok(())
    }
    fn signal_interrupt(&self, _pid: u32) -> Result<()> {
        Ok(())
    }
    fn mkdir(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        self.local.mkdir(path, mode)
    }
    fn file_exists(&self, path: &Utf8Path) -> Result<bool> {
        self.local.file_exists(path)
    }
    fn remove_file(&self, path: &Utf8Path) -> Result<()> {
        self.local.remove_file(path)
    }
    fn remove_tree(&self, path: &Utf8Path) -> Result<()> {
        self.local.remove_tree(path)
    }
    fn upload_content(&self, content: &[u8], path: &Utf8Path) -> Result<()> {
        self.local.upload_content(content, path)
    }
    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        self.local.read_file(path)
    }
    fn upload_file(&self, local: &Utf8Path, remote: &Utf8Path) -> Result<()> {
        self.local.upload_file(local, remote)
    }
    fn download_file(&self, remote: &Utf8Path, local: &Utf8Path) -> Result<()> {
        self.local.download_file(remote, local)
    }
    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> Result<()> {
        self.local.symlink(target, link)
    }
    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        self.local.read_link(path)
    }
    fn canonicalize(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        self.local.canonicalize(path)
    }
    fn disk_available(&self, path: &Utf8Path) -> Result<u64> {
        self.local.disk_available(path)
    }
    fn os_info(&self) -> Result<OsInfo> {
        self.local.os_info()
    }
    fn user_exists(&self, name: &str) -> Result<bool> {
        self.local.user_exists(name)
    }
    fn port_available(&self, port: u16) -> Result<bool> {
        self.local.port_available(port)
    }
    fn check_reachable(&self) -> Result<()> {
        Ok(())
    }
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Canned enrichment for discovery and orchestrator tests.
#[derive(Default)]
pub(crate) struct StubEnricher {
    version: String,
    role: NodeRole,
    replica_set: Option<String>,
    fail: bool,
}

impl StubEnricher {
    pub(crate) fn standalone(version: &str) -> Self {
        Self {
            version: version.to_string(),
            role: NodeRole::Standalone,
            ..Default::default()
        }
    }

    pub(crate) fn with_replica_set(version: &str, set: &str) -> Self {
        Self {
            version: version.to_string(),
            role: NodeRole::ReplicaSetMember,
            replica_set: Some(set.to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

impl InstanceEnricher for StubEnricher {
    fn enrich(&self, instance: &mut DatabaseInstance) -> Result<()> {
        if self.fail {
            anyhow::bail!("connection refused");
        }
        instance.version = self.version.clone();
        instance.variant = "mongodb".to_string();
        instance.role = self.role;
        instance.replica_set = self.replica_set.clone();
        Ok(())
    }
}
