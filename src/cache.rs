//! Persisted results of dependency scanning.
//!
//! Scanning a source for its module identity spawns two subprocesses, so the
//! result is memoized in a json sidecar per source. A sidecar is trusted as
//! long as it is newer than both the source and the builder's compile-option
//! fingerprint; any option that affects scanning (include paths, definitions,
//! language mode) is part of that fingerprint.

use crate::{compilers::Driver, error::Result, utils};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything the graph builder needs to know about one source file.
///
/// Produced by the driver's scanners or loaded from a sidecar; never mutated
/// after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Canonicalized source path.
    pub input: PathBuf,
    /// Whether the unit is a module interface and produces a bmi.
    pub exported: bool,
    /// Logical module name, empty for classical units.
    #[serde(default)]
    pub module_name: String,
    /// Headers the unit depends on.
    #[serde(default)]
    pub include_deps: Vec<PathBuf>,
    /// Imported module names, in declared order.
    #[serde(default)]
    pub module_deps: Vec<String>,
}

/// Loads units from sidecars under one builder's cache directory, falling
/// back to the driver's scanners.
pub struct UnitCache<'a> {
    /// `<ctx>/cache/<builder>/units`
    dir: PathBuf,
    /// The builder's compile-option fingerprint file.
    fingerprint: &'a Path,
    driver: &'a dyn Driver,
    /// Compile options handed to the scanners.
    compile_opts: &'a str,
    /// Base the sidecar names are expressed against.
    base: PathBuf,
}

impl<'a> UnitCache<'a> {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        fingerprint: &'a Path,
        driver: &'a dyn Driver,
        compile_opts: &'a str,
    ) -> Self {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self { dir: cache_dir.into().join("units"), fingerprint, driver, compile_opts, base }
    }

    /// The sidecar path for a source file.
    fn sidecar(&self, source: &Path) -> PathBuf {
        let mut rel = utils::rel_source_path(source, &self.base).into_os_string();
        rel.push(".json");
        self.dir.join(rel)
    }

    /// Returns the unit of `source`, reusing the sidecar when it is still
    /// fresh.
    pub fn unit(&self, source: &Path) -> Result<Unit> {
        let sidecar = self.sidecar(source);
        if self.is_fresh(&sidecar, source) {
            match utils::read_json_file(&sidecar) {
                Ok(unit) => {
                    trace!(source = %source.display(), "unit sidecar hit");
                    return Ok(unit);
                }
                Err(err) => {
                    trace!(source = %source.display(), %err, "discarding unreadable sidecar");
                }
            }
        }
        self.scan(source, &sidecar)
    }

    fn is_fresh(&self, sidecar: &Path, source: &Path) -> bool {
        let Ok(cached) = utils::mtime(sidecar) else { return false };
        let newer_than = |path: &Path| matches!(utils::mtime(path), Ok(mtime) if cached > mtime);
        newer_than(source) && newer_than(self.fingerprint)
    }

    fn scan(&self, source: &Path, sidecar: &Path) -> Result<Unit> {
        debug!(source = %source.display(), "scanning");
        let info = self.driver.scan_module(source, self.compile_opts)?;
        let include_deps = self.driver.scan_includes(source, self.compile_opts)?;
        let unit = Unit {
            input: source.to_path_buf(),
            exported: info.exported,
            module_name: info.name,
            include_deps,
            module_deps: info.deps,
        };
        // a sidecar that cannot be written would poison every later build
        utils::write_json_file(&unit, sidecar)?;
        Ok(unit)
    }
}
