//! Run context
//!
//! Everything a phase needs is reached through a [`RunContext`]: the selected machines and
//! the ignored set on the mutable [`Fleet`] side, configuration, options, backends and the
//! status log on the read-only [`RunEnv`] side. Per-machine tasks borrow one machine
//! mutably and the environment immutably, and phases fold their outcomes back into the
//! fleet once every task has finished.

use crate::config::FleetConfig;
use crate::console::StatusLog;
use crate::lifecycle::Launcher;
use crate::machine::Machine;
use crate::remote::Connector;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Operator options of one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// VNC keyboard layout passed to QEMU with `-k`
    pub keyboard_layout: Option<String>,

    /// Whether host acceleration may be used
    pub accelerate: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            keyboard_layout: None,
            accelerate: true,
        }
    }
}

/// Process and network backends
#[derive(Clone)]
pub struct Backend {
    /// Opens SSH sessions
    pub connector: Arc<dyn Connector>,

    /// Launches hypervisor processes and QEMU tools
    pub launcher: Arc<dyn Launcher>,
}

/// Read-only environment of a run
pub struct RunEnv {
    /// Fleet configuration
    pub config: FleetConfig,

    /// Operator options
    pub options: RunOptions,

    /// Process and network backends
    pub backend: Backend,

    /// Status output
    pub log: StatusLog,
}

/// Selected machines and their exclusion state
#[derive(Debug, Default)]
pub struct Fleet {
    /// Selected machines, in selection order
    pub machines: Vec<Machine>,

    /// Keys of machines excluded from further phases
    pub ignored: BTreeSet<String>,
}

impl Fleet {
    /// Fleet of freshly selected machines
    #[must_use]
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            machines,
            ignored: BTreeSet::new(),
        }
    }

    /// Exclude a machine from further phases
    pub fn ignore(&mut self, key: impl Into<String>) {
        self.ignored.insert(key.into());
    }

    /// Whether a machine is excluded
    #[must_use]
    pub fn is_ignored(&self, key: &str) -> bool {
        self.ignored.contains(key)
    }

    /// Whether any machine was excluded
    #[must_use]
    pub fn has_ignored(&self) -> bool {
        !self.ignored.is_empty()
    }

    /// Whether this run booted any machine
    #[must_use]
    pub fn any_started(&self) -> bool {
        self.machines.iter().any(|m| m.started)
    }

    /// Machines still taking part in the run
    pub fn active(&self) -> impl Iterator<Item = &Machine> {
        let ignored = &self.ignored;
        self.machines.iter().filter(move |m| !ignored.contains(&m.key))
    }

    /// Machines still taking part in the run, mutably
    pub fn active_mut(&mut self) -> impl Iterator<Item = &mut Machine> {
        let ignored = &self.ignored;
        self.machines
            .iter_mut()
            .filter(move |m| !ignored.contains(&m.key))
    }

    /// Display names, in selection order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.machines.iter().map(|m| m.name.as_str()).collect()
    }

    /// Exclude every machine whose outcome failed
    ///
    /// # Returns
    ///
    /// `true` when every outcome succeeded
    pub fn absorb<I>(&mut self, outcomes: I) -> bool
    where
        I: IntoIterator<Item = (String, bool)>,
    {
        let mut success = true;
        for (key, ok) in outcomes {
            if !ok {
                self.ignored.insert(key);
                success = false;
            }
        }
        success
    }
}

/// State threaded through every phase of one invocation
pub struct RunContext {
    /// Selected machines
    pub fleet: Fleet,

    /// Read-only environment
    pub env: RunEnv,
}

impl RunContext {
    /// Build the context of a run, the status log aligns on the selected names
    #[must_use]
    pub fn new(
        machines: Vec<Machine>,
        config: FleetConfig,
        options: RunOptions,
        backend: Backend,
    ) -> Self {
        let log = StatusLog::new(machines.iter().map(|m| m.name.clone()));
        Self::with_log(machines, config, options, backend, log)
    }

    /// Build the context of a run with a given status log
    #[must_use]
    pub fn with_log(
        machines: Vec<Machine>,
        config: FleetConfig,
        options: RunOptions,
        backend: Backend,
        log: StatusLog,
    ) -> Self {
        Self {
            fleet: Fleet::new(machines),
            env: RunEnv {
                config,
                options,
                backend,
                log,
            },
        }
    }

    /// Status output
    pub fn log(&self) -> &StatusLog {
        &self.env.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineSpec;

    fn machine(key: &str) -> Machine {
        let spec: MachineSpec = serde_json::from_str(r#"{ "platform": "linux" }"#).unwrap();
        Machine::from_spec(key, spec)
    }

    #[test]
    fn test_active_skips_ignored() {
        let mut fleet = Fleet::new(vec![machine("a"), machine("b"), machine("c")]);
        fleet.ignore("b");

        let keys: Vec<_> = fleet.active().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(fleet.active_mut().count(), 2);
        assert_eq!(fleet.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_absorb_outcomes() {
        let mut fleet = Fleet::new(vec![machine("a"), machine("b")]);

        assert!(fleet.absorb(vec![("a".to_string(), true)]));
        assert!(!fleet.has_ignored());

        assert!(!fleet.absorb(vec![("a".to_string(), true), ("b".to_string(), false)]));
        assert!(fleet.is_ignored("b"));
        assert!(!fleet.is_ignored("a"));
    }
}
