//! Taking over (and giving back) the host's init-system units.
//!
//! The manager shells out to `systemctl` through the substrate and
//! keeps a journal of every unit it transitioned from enabled to
//! disabled. That journal is the single source of truth for what must
//! be reversed when an import fails partway.

use anyhow::{Context, Result};
use fn_error_context::context;

use crate::exec::Executor;
use crate::sysunit::normalize_unit_name;

/// Wraps the host init system's enable/disable/start/stop surface and
/// journals disables for rollback.
pub struct InitUnitManager<'a> {
    exec: &'a dyn Executor,
    journal: Vec<String>,
}

impl<'a> InitUnitManager<'a> {
    /// A manager with an empty journal.
    pub fn new(exec: &'a dyn Executor) -> Self {
        Self {
            exec,
            journal: Vec::new(),
        }
    }

    fn systemctl(&self, verb: &str, unit: &str) -> Result<String> {
        self.exec
            .run(&format!("systemctl {verb} {unit}"))
            .with_context(|| format!("systemctl {verb} {unit}"))
    }

    /// Units disabled so far, in disable order.
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    /// Disable a unit and record it in the journal.
    pub fn disable(&mut self, unit: &str) -> Result<()> {
        let unit = normalize_unit_name(unit).to_string();
        self.systemctl("disable", &unit)?;
        if !self.journal.contains(&unit) {
            self.journal.push(unit);
        }
        Ok(())
    }

    /// Stop a unit, best-effort. The service may already be stopped, or
    /// stopping may race its own shutdown; either way the import goes
    /// on.
    pub fn stop(&self, unit: &str) {
        let unit = normalize_unit_name(unit);
        if let Err(e) = self.systemctl("stop", unit) {
            tracing::warn!("stopping {unit} failed (continuing): {e:#}");
        }
    }

    /// Disable then stop a unit.
    pub fn disable_and_stop(&mut self, unit: &str) -> Result<()> {
        self.disable(unit)?;
        self.stop(unit);
        Ok(())
    }

    /// Re-enable a unit.
    pub fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl("enable", normalize_unit_name(unit))?;
        Ok(())
    }

    /// Start a unit.
    pub fn start(&self, unit: &str) -> Result<()> {
        self.systemctl("start", normalize_unit_name(unit))?;
        Ok(())
    }

    /// Enable then start a unit.
    pub fn enable_and_start(&self, unit: &str) -> Result<()> {
        self.enable(unit)?;
        self.start(unit)
    }

    /// Whether the init system reports the unit as active.
    pub fn is_active(&self, unit: &str) -> Result<bool> {
        match self.systemctl("is-active", normalize_unit_name(unit)) {
            Ok(out) => Ok(out.trim() == "active"),
            // is-active exits non-zero for every state but "active"
            Err(_) => Ok(false),
        }
    }

    /// Undo every journaled disable: re-enable and restart each unit in
    /// append order, attempting all entries even when some fail, then
    /// report the aggregate outcome. The journal is drained.
    #[context("Rolling back init-unit changes")]
    pub fn rollback_all(&mut self) -> Result<()> {
        let units = std::mem::take(&mut self.journal);
        let mut failures = Vec::new();
        for unit in &units {
            tracing::info!("restoring init unit {unit}");
            if let Err(e) = self.enable_and_start(unit) {
                tracing::warn!("restoring {unit} failed: {e:#}");
                failures.push(format!("{unit}: {e:#}"));
            }
        }
        if !failures.is_empty() {
            anyhow::bail!(
                "failed to restore {} of {} unit(s): {}",
                failures.len(),
                units.len(),
                failures.join("; ")
            );
        }
        Ok(())
    }

    /// Drop the journal after a successfully committed import.
    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }
}
