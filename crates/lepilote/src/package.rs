//! Distributable package assembly
//!
//! The package directory is a filtered copy of the snapshot with the prebuilt binaries
//! of every platform dropped into the component build tree, and a manifest rewritten so
//! the package installs from its root.

use crate::snapshot::{copy_tree, unlink_recursive, PathFilter};
use anyhow::{bail, Context, Result};
use leflotte::console::StatusLog;
use leflotte::FleetConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manifest file of the component
pub const MANIFEST_FILE: &str = "package.json";

/// Component manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Package name
    pub name: String,

    /// Package version
    pub version: String,

    document: Map<String, Value>,
}

impl Manifest {
    /// Read the manifest of a component directory
    pub fn load(component_dir: &Path) -> Result<Self> {
        let path = component_dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Invalid manifest {:?}", path))
    }

    /// Parse manifest text
    pub fn parse(text: &str) -> Result<Self> {
        let document: Map<String, Value> = serde_json::from_str(text)?;

        let field = |key: &str| -> Result<String> {
            match document.get(key) {
                Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
                _ => bail!("Missing `{key}` field"),
            }
        };
        let name = field("name")?;
        let version = field("version")?;

        Ok(Self {
            name,
            version,
            document,
        })
    }

    /// Name without its scope, as used in binary and directory names
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Local directory holding the binaries of one build
    #[must_use]
    pub fn artifact_dir(&self, component_dir: &Path, platform: &str, arch: &str) -> PathBuf {
        component_dir
            .join("build")
            .join("qemu")
            .join(&self.version)
            .join(format!("{}_{platform}_{arch}", self.short_name()))
    }

    /// File whose presence marks a build as done
    #[must_use]
    pub fn binary_name(&self) -> String {
        format!("{}.node", self.short_name())
    }

    /// Manifest of the package root.
    ///
    /// Entry points move under the component path, scripts are replaced by the install
    /// hook and development dependencies are dropped.
    #[must_use]
    pub fn rewrite(&self, component: &str, install_script: &str) -> Value {
        let mut document = self.document.clone();
        let under_component = |path: &str| format!("{component}/{}", path.trim_start_matches("./"));

        for key in ["main", "types"] {
            if let Some(Value::String(path)) = document.get(key) {
                let moved = under_component(path);
                document.insert(key.to_string(), Value::String(moved));
            }
        }

        let mut scripts = Map::new();
        scripts.insert("install".to_string(), Value::String(install_script.to_string()));
        document.insert("scripts".to_string(), Value::Object(scripts));
        document.remove("devDependencies");

        if let Some(Value::Object(cnoke)) = document.get_mut("cnoke") {
            cnoke.insert(
                "output".to_string(),
                Value::String(format!(
                    "{component}/build/qemu/{{{{ version }}}}/{}_{{{{ platform }}}}_{{{{ arch }}}}",
                    self.short_name()
                )),
            );
            if let Some(Value::String(require)) = cnoke.get("require") {
                let moved = format!("./{}", under_component(require));
                cnoke.insert("require".to_string(), Value::String(moved));
            }
        }

        Value::Object(document)
    }
}

/// Serialize JSON with four-space indentation
pub fn to_pretty_json(value: &Value) -> Result<String> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(buffer)?)
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

/// Assemble the package directory.
///
/// # Arguments
///
/// * `config` - Fleet configuration, for paths and the package layout
/// * `snapshot` - Snapshot directory the package is filtered from
/// * `manifest` - Component manifest
/// * `artifacts` - Local build directories, one per platform and architecture
/// * `log` - Status output
///
/// # Returns
///
/// `Result<PathBuf>` - Package directory
pub fn assemble(
    config: &FleetConfig,
    snapshot: &Path,
    manifest: &Manifest,
    artifacts: &[PathBuf],
    log: &StatusLog,
) -> Result<PathBuf> {
    let layout = &config.package;
    let dist = config.paths.dist_dir();
    log.phase("Prepare NPM package");

    unlink_recursive(&dist)?;
    fs::create_dir_all(&dist).with_context(|| format!("Failed to create {:?}", dist))?;

    let filter = PathFilter::new(&layout.include, &layout.exclude);
    copy_tree(snapshot, &dist, &filter, &HashSet::new())?;

    let component = config.paths.component_remote();
    let component_dir = dist.join(&config.paths.component);
    let binary_dir = component_dir.join("build").join("qemu").join(&manifest.version);
    fs::create_dir_all(&binary_dir).with_context(|| format!("Failed to create {:?}", binary_dir))?;

    for artifact in artifacts {
        let name = artifact
            .file_name()
            .with_context(|| format!("Invalid artifact directory {:?}", artifact))?;
        let dest = binary_dir.join(name);
        fs::create_dir_all(&dest).with_context(|| format!("Failed to create {:?}", dest))?;
        copy_tree(artifact, &dest, &PathFilter::everything(), &HashSet::new())
            .with_context(|| format!("Failed to copy build artifacts {:?}", artifact))?;
    }
    debug!(dist = %dist.display(), artifacts = artifacts.len(), "Binaries copied");

    let rewritten = manifest.rewrite(&component, &layout.install_script_for(&component));
    let manifest_path = dist.join(MANIFEST_FILE);
    fs::write(&manifest_path, to_pretty_json(&rewritten)?)
        .with_context(|| format!("Failed to write {:?}", manifest_path))?;

    fs::remove_file(component_dir.join(MANIFEST_FILE))
        .with_context(|| format!("Failed to remove component manifest in {:?}", component_dir))?;
    remove_file_if_present(&component_dir.join(".gitignore"))?;

    for file in &layout.hoist {
        let from = component_dir.join(file);
        if from.exists() {
            fs::rename(&from, dist.join(file)).with_context(|| format!("Failed to move {:?}", from))?;
        }
    }

    let docs = dist.join(&layout.docs_source);
    if docs.is_dir() {
        let target = dist.join(&layout.docs_target);
        fs::rename(&docs, &target).with_context(|| format!("Failed to move {:?}", docs))?;

        if let Some(parent) = Path::new(&layout.docs_source).parent() {
            let parent = dist.join(parent);
            if parent != dist && fs::read_dir(&parent).map(|mut d| d.next().is_none()).unwrap_or(false) {
                fs::remove_dir(&parent).with_context(|| format!("Failed to remove {:?}", parent))?;
            }
        }
    }

    Ok(dist)
}
