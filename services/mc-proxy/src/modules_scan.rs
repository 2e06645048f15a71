//! Startup module auto-import (SPEC_FULL.md §6 `modules_dir`, §9 "module
//! plug-in ABI").
//!
//! There is no dynamic code loader here (§1 Non-goal): a module is
//! "installed" by registering its [`mp_modules::ModuleFactory`] into the
//! binary ahead of time, under a stable key. This scan stands in for
//! "import module class from path" by reading a directory of small TOML
//! manifests, each naming the factory key to import. Unlike
//! `ModuleRegistry::import`/`load` themselves — which propagate failure
//! straight to their caller, per the registry's own error-handling
//! contract — a bad manifest here is logged and skipped so one
//! misconfigured module doesn't prevent the rest of the service from
//! starting.

use mp_modules::ModuleRegistry;
use serde::Deserialize;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

#[derive(Debug, Deserialize)]
struct ManifestFile {
    module: ManifestModule,
}

#[derive(Debug, Deserialize)]
struct ManifestModule {
    factory: String,
}

/// Scan `dir` for `*.toml` manifests and import (but do not load) the
/// factory each one names. Returns the names of modules successfully
/// imported.
pub fn scan_and_import(registry: &Rc<RefCell<ModuleRegistry>>, dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "modules directory unreadable, skipping scan");
            return Vec::new();
        }
    };

    let mut imported = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        match import_manifest(registry, &path) {
            Ok(name) => {
                tracing::info!(manifest = %path.display(), module = %name, "module imported from manifest");
                imported.push(name);
            }
            Err(reason) => {
                tracing::warn!(manifest = %path.display(), %reason, "skipping module manifest");
            }
        }
    }
    imported
}

fn import_manifest(registry: &Rc<RefCell<ModuleRegistry>>, path: &Path) -> Result<String, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let manifest: ManifestFile = toml::from_str(&raw).map_err(|e| e.to_string())?;
    registry
        .borrow_mut()
        .import(&manifest.module.factory)
        .map_err(|e| e.to_string())
}
