// Fleet Configuration
//
// *La Configuration* (The Configuration) - Paths, timings and transfer settings for a fleet run

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file name, looked up in the tool directory
pub const DEFAULT_CONFIG_FILE: &str = "qemu.toml";

/// Fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// Filesystem layout
    pub paths: PathConfig,

    /// Waits and retry budgets
    pub timings: TimingConfig,

    /// Transfer concurrency
    pub transfer: TransferConfig,

    /// Source snapshot filter
    pub snapshot: SnapshotConfig,

    /// Distributable package layout
    pub package: PackageConfig,
}

impl FleetConfig {
    /// Load configuration for a tool directory
    ///
    /// Reads `qemu.toml` from the tool directory when present, applies environment
    /// overrides, resolves relative paths against the tool directory and validates
    /// the result.
    ///
    /// # Arguments
    ///
    /// * `tool_dir` - Directory holding the registry and machine files
    ///
    /// # Returns
    ///
    /// `Result<FleetConfig>` - Loaded or default configuration
    pub fn load<P: AsRef<Path>>(tool_dir: P) -> Result<Self> {
        let tool_dir = tool_dir.as_ref();
        let config_path = tool_dir.join(DEFAULT_CONFIG_FILE);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?
        } else {
            FleetConfig::default()
        };

        config.apply_env();
        config.paths = config.paths.resolve(tool_dir);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment overrides
    ///
    /// Environment variables:
    /// - `QEMU_FLEET_ROOT` - Source tree root
    /// - `QEMU_FLEET_REGISTRY` - Registry file
    /// - `QEMU_FLEET_BUILD_DIR` - Build directory (snapshot, dist)
    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("QEMU_FLEET_ROOT") {
            self.paths.root = PathBuf::from(root);
        }

        if let Ok(registry) = std::env::var("QEMU_FLEET_REGISTRY") {
            self.paths.registry = PathBuf::from(registry);
        }

        if let Ok(build) = std::env::var("QEMU_FLEET_BUILD_DIR") {
            self.paths.build = PathBuf::from(build);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timings.boot_tries == 0 || self.timings.probe_tries == 0 {
            bail!("Connection tries must be greater than zero");
        }

        if self.timings.delete_retries == 0 {
            bail!("Delete retries must be greater than zero");
        }

        if self.transfer.concurrency == 0
            || self.transfer.windows_host_concurrency == 0
            || self.transfer.fetch_concurrency == 0
        {
            bail!("Transfer concurrency must be greater than zero");
        }

        if self.paths.component.as_os_str().is_empty() {
            bail!("Component path cannot be empty");
        }

        Ok(())
    }
}

/// Filesystem layout, relative paths are resolved against the tool directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Source tree root
    pub root: PathBuf,

    /// Machine registry
    pub registry: PathBuf,

    /// Local machine directories, one per registry key
    pub machines: PathBuf,

    /// Build directory receiving the snapshot and the distributable
    pub build: PathBuf,

    /// Component being built and packaged, relative to the source root
    pub component: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("../../.."),
            registry: PathBuf::from(crate::registry::DEFAULT_REGISTRY_PATH),
            machines: PathBuf::from("qemu"),
            build: PathBuf::from("../build"),
            component: PathBuf::from("src/koffi"),
        }
    }
}

impl PathConfig {
    fn resolve(self, tool_dir: &Path) -> Self {
        Self {
            root: tool_dir.join(self.root),
            registry: tool_dir.join(self.registry),
            machines: tool_dir.join(self.machines),
            build: tool_dir.join(self.build),
            component: self.component,
        }
    }

    /// Local directory of a machine
    #[must_use]
    pub fn machine_dir(&self, key: &str) -> PathBuf {
        self.machines.join(key)
    }

    /// Component directory in the source tree
    #[must_use]
    pub fn component_dir(&self) -> PathBuf {
        self.root.join(&self.component)
    }

    /// Component path as used on remote machines
    #[must_use]
    pub fn component_remote(&self) -> String {
        self.component.to_string_lossy().replace('\\', "/")
    }

    /// Snapshot directory
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.build.join("snapshot")
    }

    /// Distributable package directory
    #[must_use]
    pub fn dist_dir(&self) -> PathBuf {
        self.build.join("dist")
    }
}

/// Waits and retry budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after spawning the hypervisor, in milliseconds
    pub settle_ms: u64,

    /// Pause between connection attempts, in milliseconds
    pub connect_retry_delay_ms: u64,

    /// Connection attempts after a boot
    pub boot_tries: u32,

    /// Connection attempts when probing for a running machine
    pub probe_tries: u32,

    /// Attempts at removing a remote directory
    pub delete_retries: u32,

    /// Pause between remote directory removals, in milliseconds
    pub delete_retry_delay_ms: u64,

    /// Time allowed for a machine to drop its connection after shutdown, in seconds
    pub shutdown_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            connect_retry_delay_ms: 10_000,
            boot_tries: 30,
            probe_tries: 2,
            delete_retries: 10,
            delete_retry_delay_ms: 1_000,
            shutdown_timeout_secs: 60,
        }
    }
}

impl TimingConfig {
    /// Wait after spawning the hypervisor
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Pause between connection attempts
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    /// Pause between remote directory removals
    pub fn delete_retry_delay(&self) -> Duration {
        Duration::from_millis(self.delete_retry_delay_ms)
    }

    /// Shutdown wait
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Zero waits, for scripted runs
    #[must_use]
    pub fn instant() -> Self {
        Self {
            settle_ms: 0,
            connect_retry_delay_ms: 0,
            delete_retry_delay_ms: 0,
            shutdown_timeout_secs: 1,
            ..Self::default()
        }
    }
}

/// Transfer concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Files in flight per upload
    pub concurrency: usize,

    /// Files in flight per upload when the host runs Windows
    pub windows_host_concurrency: usize,

    /// Files in flight per artifact download
    pub fetch_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            windows_host_concurrency: 1,
            fetch_concurrency: 4,
        }
    }
}

impl TransferConfig {
    /// Upload concurrency for the running host
    #[must_use]
    pub fn upload_concurrency(&self) -> usize {
        if cfg!(windows) {
            self.windows_host_concurrency
        } else {
            self.concurrency
        }
    }
}

/// Source snapshot filter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Path prefixes copied into the snapshot
    pub include: Vec<String>,

    /// Path prefixes dropped even when included
    pub exclude: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            include: [
                "src/core/libcc",
                "src/cnoke",
                "src/koffi",
                "tools",
                "vendor/node-addon-api",
                "vendor/raylib",
                "vendor/sqlite3",
                "vendor/sqlite3mc",
                "web/koffi.dev",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclude: vec!["tools/qemu".to_string()],
        }
    }
}

/// Distributable package layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Snapshot path prefixes copied into the package
    pub include: Vec<String>,

    /// Path prefixes dropped even when included
    pub exclude: Vec<String>,

    /// Component files moved to the package root
    pub hoist: Vec<String>,

    /// Documentation tree inside the package
    pub docs_source: String,

    /// Final documentation directory
    pub docs_target: String,

    /// Install script, `{component}` is replaced by the component path
    pub install_script: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            include: vec![
                "src".to_string(),
                "vendor/node-addon-api".to_string(),
                "web".to_string(),
            ],
            exclude: vec![
                "src/koffi/benchmark".to_string(),
                "src/koffi/test".to_string(),
                "src/koffi/tools".to_string(),
            ],
            hoist: vec![
                "README.md".to_string(),
                "LICENSE.txt".to_string(),
                "CHANGELOG.md".to_string(),
            ],
            docs_source: "web/koffi.dev".to_string(),
            docs_target: "doc".to_string(),
            install_script: "node src/cnoke/cnoke.js --prebuild -d {component}".to_string(),
        }
    }
}

impl PackageConfig {
    /// Install script for a component
    #[must_use]
    pub fn install_script_for(&self, component: &str) -> String {
        self.install_script.replace("{component}", component)
    }
}
