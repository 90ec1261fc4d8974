//! Plugin discovery: a compiled-in catalog of packages, enabled through manifests in the module
//! directory.
//!
//! A manifest is a TOML file such as
//!
//! ```toml
//! package = "forge.builtin"
//! enabled = true
//! ```

use forge_core::Module;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point of a package: returns fresh instances of every module it provides.
pub type PluginEntry = fn() -> Vec<Arc<dyn Module>>;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PluginManifest {
    pub package: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Reads every `*.toml` manifest directly inside `dir`, in file name order.
/// A missing directory or a malformed manifest is logged and skipped.
pub fn scan_directory(dir: &Path) -> Vec<(PathBuf, PluginManifest)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Module directory not readable, no plugins loaded");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut manifests = Vec::new();
    for path in paths {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read plugin manifest");
                continue;
            }
        };
        match toml::from_str::<PluginManifest>(&content) {
            Ok(manifest) => manifests.push((path, manifest)),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed plugin manifest"),
        }
    }
    manifests
}

/// Packages this host binary knows how to instantiate.
#[derive(Default, Clone)]
pub struct PluginCatalog {
    packages: BTreeMap<String, PluginEntry>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the packages shipped with the host
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        crate::builtin::register(&mut catalog);
        catalog
    }

    /// Adds a package. Returns false and keeps the existing entry if the name is taken.
    pub fn register(&mut self, package: &str, entry: PluginEntry) -> bool {
        if self.packages.contains_key(package) {
            warn!(package, "Plugin package already registered");
            return false;
        }
        self.packages.insert(package.to_string(), entry);
        true
    }

    pub fn contains(&self, package: &str) -> bool {
        self.packages.contains_key(package)
    }

    pub fn packages(&self) -> Vec<&str> {
        self.packages.keys().map(String::as_str).collect()
    }

    /// Module candidates from every enabled manifest in `dir`, in manifest order.
    pub fn discover(&self, dir: &Path) -> Vec<Arc<dyn Module>> {
        let mut candidates = Vec::new();
        for (path, manifest) in scan_directory(dir) {
            if !manifest.enabled {
                debug!(package = %manifest.package, "Plugin package disabled");
                continue;
            }
            let Some(entry) = self.packages.get(&manifest.package) else {
                warn!(
                    package = %manifest.package,
                    path = %path.display(),
                    "Unknown plugin package, skipping"
                );
                continue;
            };
            let modules = entry();
            info!(package = %manifest.package, count = modules.len(), "Discovered plugin package");
            candidates.extend(modules);
        }
        candidates
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("packages", &self.packages())
            .finish()
    }
}
