//! Module discovery and dependency ordering
//!
//! A module is any directory under the modules root that contains a
//! `module.json` descriptor. Directories without one are walked through.
//! A module's identity is its path relative to the root with `/` replaced by
//! `.`, so `api/users` becomes `api.users`.
//!
//! The root may hold a `config.json` with an `ignore` list of identities to
//! skip entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use super::error::ResolveError;

/// Per-module descriptor file name, also the marker that makes a directory a module
pub const DESCRIPTOR_FILE: &str = "module.json";

/// Top-level configuration file name
pub const ROOT_CONFIG_FILE: &str = "config.json";

/// On-disk shape of `module.json` and `config.json`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DescriptorFile {
    dependencies: Vec<String>,
    load_subdirectories: Vec<String>,
    ignore: Vec<String>,
    settings: Value,
}

/// A discovered module, immutable for one load pass
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    /// Dotted identity, e.g. `api.users`
    pub identity: String,

    /// Directory the module was found in
    pub path: PathBuf,

    /// Declared plus implicit (parent namespace) dependencies
    pub dependencies: BTreeSet<String>,

    /// Extra subdirectories scanned for nested modules
    pub load_subdirectories: Vec<String>,

    /// Free-form settings handed to the module's setup
    pub settings: Value,
}

fn read_descriptor(path: &Path) -> Result<DescriptorFile, ResolveError> {
    if !path.exists() {
        return Ok(DescriptorFile::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| ResolveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ResolveError::Descriptor {
        path: path.to_path_buf(),
        source,
    })
}

/// Directory entries sorted by name so discovery is deterministic.
fn sorted_subdirectories(dir: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    let io_err = |source: std::io::Error| ResolveError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn identity_of(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(".")
}

/// Walk `root` and return every module descriptor in discovery order.
pub fn discover(root: &Path) -> Result<Vec<ModuleDescriptor>, ResolveError> {
    let root_config = read_descriptor(&root.join(ROOT_CONFIG_FILE))?;
    let ignore: BTreeSet<String> = root_config.ignore.into_iter().collect();

    let mut found: Vec<ModuleDescriptor> = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if !dir.is_dir() {
            tracing::warn!(path = ?dir, "Skipping missing module subdirectory");
            continue;
        }
        for item in sorted_subdirectories(&dir)? {
            let identity = identity_of(root, &item);
            if ignore.contains(&identity) {
                tracing::debug!(module = %identity, "Ignoring module");
                continue;
            }

            let descriptor_path = item.join(DESCRIPTOR_FILE);
            if !descriptor_path.exists() {
                stack.push(item);
                continue;
            }

            let file = read_descriptor(&descriptor_path)?;
            let mut dependencies: BTreeSet<String> = file.dependencies.into_iter().collect();

            // A nested module loads after every namespace it sits under
            for known in &found {
                if identity.starts_with(&known.identity) {
                    dependencies.insert(known.identity.clone());
                }
            }

            let subdirs: BTreeSet<&String> = file.load_subdirectories.iter().collect();
            stack.extend(subdirs.into_iter().map(|s| item.join(s)));

            found.push(ModuleDescriptor {
                identity,
                path: item,
                dependencies,
                load_subdirectories: file.load_subdirectories,
                settings: file.settings,
            });
        }
    }

    Ok(found)
}

/// Order descriptors so every module comes after all of its dependencies.
///
/// Works in passes: each pass extracts every module whose dependency set is
/// empty, in discovery order, and drops it from the other sets immediately.
pub fn order(descriptors: Vec<ModuleDescriptor>) -> Result<Vec<ModuleDescriptor>, ResolveError> {
    let known: BTreeSet<&str> = descriptors.iter().map(|d| d.identity.as_str()).collect();
    for descriptor in &descriptors {
        if let Some(missing) = descriptor
            .dependencies
            .iter()
            .find(|dep| !known.contains(dep.as_str()))
        {
            return Err(ResolveError::MissingDependency {
                module: descriptor.identity.clone(),
                dependency: missing.clone(),
            });
        }
    }

    let mut pending: Vec<(ModuleDescriptor, BTreeSet<String>)> = descriptors
        .into_iter()
        .map(|d| {
            let deps = d.dependencies.clone();
            (d, deps)
        })
        .collect();
    let mut ordered = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let mut extracted = vec![false; pending.len()];
        for index in 0..pending.len() {
            if !pending[index].1.is_empty() {
                continue;
            }
            let identity = pending[index].0.identity.clone();
            for (_, deps) in pending.iter_mut() {
                deps.remove(&identity);
            }
            extracted[index] = true;
        }

        if !extracted.contains(&true) {
            let remaining = pending
                .into_iter()
                .map(|(d, deps)| (d.identity, deps))
                .collect();
            return Err(ResolveError::CircularDependency { remaining });
        }

        let mut rest = Vec::with_capacity(pending.len());
        for (entry, done) in pending.into_iter().zip(extracted) {
            if done {
                ordered.push(entry.0);
            } else {
                rest.push(entry);
            }
        }
        pending = rest;
    }

    Ok(ordered)
}

/// Discover and order the modules under `root`.
pub fn scan_modules(root: &Path) -> Result<Vec<ModuleDescriptor>, ResolveError> {
    let ordered = order(discover(root)?)?;
    tracing::debug!(
        modules = ?ordered.iter().map(|d| d.identity.as_str()).collect::<Vec<_>>(),
        "Resolved module load order"
    );
    Ok(ordered)
}
