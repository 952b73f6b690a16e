//! Source snapshot and filtered tree copies
//!
//! Machines never see the working tree directly: it is first copied into the build
//! directory through a path filter, minus everything git reports as ignored, and the
//! copy is what gets uploaded.

use crate::tools::Tool;
use anyhow::{Context, Result};
use leflotte::console::StatusLog;
use leflotte::FleetConfig;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;
use walkdir::WalkDir;

/// Prefix filter over `/`-separated relative paths.
///
/// A path passes when it lies under an included prefix, or is a directory on the way to
/// one, and does not lie under an excluded prefix.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Vec<String>>,
    exclude: Vec<Vec<String>>,
}

fn split(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_prefix(prefix: &[String], parts: &[&str]) -> bool {
    prefix.len() <= parts.len() && prefix.iter().zip(parts).all(|(a, b)| a == b)
}

fn is_ancestor(parts: &[&str], prefix: &[String]) -> bool {
    parts.len() < prefix.len() && parts.iter().zip(prefix).all(|(a, b)| a == b)
}

impl PathFilter {
    /// Filter from include and exclude prefixes
    #[must_use]
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        Self {
            include: include.iter().map(|p| split(p.as_ref())).collect(),
            exclude: exclude.iter().map(|p| split(p.as_ref())).collect(),
        }
    }

    /// Filter letting every path through
    #[must_use]
    pub fn everything() -> Self {
        Self {
            include: vec![Vec::new()],
            exclude: Vec::new(),
        }
    }

    /// Whether a relative path passes
    #[must_use]
    pub fn accepts(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();

        if self.exclude.iter().any(|prefix| is_prefix(prefix, &parts)) {
            return false;
        }
        self.include
            .iter()
            .any(|prefix| is_prefix(prefix, &parts) || is_ancestor(&parts, prefix))
    }
}

/// Parse `git ls-files -i -o --directory` output into relative paths
#[must_use]
pub fn parse_ignored(stdout: &str) -> HashSet<String> {
    stdout
        .lines()
        .map(|line| {
            line.trim()
                .trim_end_matches(['/', '\\'])
                .replace('\\', "/")
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Paths git ignores under `root`, empty when git is unavailable or `root` is not a
/// repository
#[must_use]
pub fn git_ignored(root: &Path) -> HashSet<String> {
    let output = Tool::Git
        .command()
        .args(["ls-files", "-i", "-o", "--exclude-standard", "--directory"])
        .current_dir(root)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();

    match output {
        Ok(output) if output.status.success() => parse_ignored(&String::from_utf8_lossy(&output.stdout)),
        Ok(output) => {
            debug!(root = %root.display(), status = %output.status, "git did not list ignored files");
            HashSet::new()
        }
        Err(err) => {
            debug!(root = %root.display(), error = %err, "git is not available");
            HashSet::new()
        }
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Copy a directory tree through a filter.
///
/// Regular files and directories are copied, symbolic links are skipped. The
/// destination is never copied into itself when it lies inside the source.
///
/// # Arguments
///
/// * `src` - Source directory
/// * `dest` - Existing destination directory
/// * `filter` - Relative paths to keep
/// * `ignored` - Relative paths to drop regardless of the filter
///
/// # Returns
///
/// `Result<usize>` - Number of files copied
pub fn copy_tree(
    src: &Path,
    dest: &Path,
    filter: &PathFilter,
    ignored: &HashSet<String>,
) -> Result<usize> {
    let src = src
        .canonicalize()
        .with_context(|| format!("Failed to resolve {:?}", src))?;
    let dest = dest
        .canonicalize()
        .with_context(|| format!("Failed to resolve {:?}", dest))?;

    let walker = WalkDir::new(&src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            if entry.path() == dest {
                return false;
            }
            relative_name(&src, entry.path())
                .is_some_and(|name| !ignored.contains(&name) && filter.accepts(&name))
        });

    let mut copied = 0;
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", src))?;
        let Some(name) = relative_name(&src, entry.path()) else {
            continue;
        };
        let target = dest.join(&name);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory {:?}", target))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {:?}", entry.path()))?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Remove a directory tree, a missing tree is fine
pub fn unlink_recursive(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

/// Copy the source tree into a fresh snapshot directory
///
/// # Returns
///
/// `Result<PathBuf>` - Snapshot directory
pub fn snapshot(config: &FleetConfig, log: &StatusLog) -> Result<PathBuf> {
    let root = &config.paths.root;
    let dir = config.paths.snapshot_dir();
    log.phase("Snapshot source code...");

    unlink_recursive(&dir)?;
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;

    let filter = PathFilter::new(&config.snapshot.include, &config.snapshot.exclude);
    let ignored = git_ignored(root);
    let copied = copy_tree(root, &dir, &filter, &ignored)?;
    debug!(root = %root.display(), snapshot = %dir.display(), copied, ignored = ignored.len(), "Snapshot ready");

    Ok(dir)
}
