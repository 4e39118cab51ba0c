//! Utilities for creating and testing of (temporary) module projects.
//!
//! The [`MockDriver`] stands in for a real toolchain: it derives module
//! identity from a tiny textual scan, writes deterministic placeholder
//! artifacts and records every invocation, so tests can assert exactly which
//! subprocesses a build would have spawned.

use crate::{
    builder::{ExeBuilder, LibBuilder},
    compilers::{Driver, ModuleInfo, ModuleMap, ProcessOutput},
    config::Context,
    error::{BuildError, Result},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

static RE_MODULE_DECL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*export\s+module\s+([\w.:]+)\s*;").unwrap());

static RE_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:export\s+)?import\s+([\w.:]+|:[\w.]+)\s*;").unwrap());

static RE_INCLUDE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"#include\s*"([^"]+)""#).unwrap());

/// A driver that fakes a compiler toolchain for tests.
///
/// Artifacts are plain text files derived from their inputs, so rebuilds are
/// observable through both the invocation log and file mtimes.
#[derive(Debug, Default)]
pub struct MockDriver {
    calls: Mutex<Vec<String>>,
    fail_matching: Mutex<Option<String>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything the driver was asked to do, in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("mock lock poisoned").clear();
    }

    /// Number of recorded calls whose entry starts with `prefix`.
    pub fn count_of(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(prefix)).count()
    }

    /// Position of the first recorded call containing `needle`.
    pub fn position_of(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|call| call.contains(needle))
    }

    /// Makes every compile/link step whose output path contains `needle`
    /// fail with a non-zero status.
    pub fn fail_matching(&self, needle: &str) {
        *self.fail_matching.lock().expect("mock lock poisoned") = Some(needle.to_string());
    }

    fn record(&self, entry: String) {
        self.calls.lock().expect("mock lock poisoned").push(entry);
    }

    fn result_for(&self, kind: &str, out: &Path) -> ProcessOutput {
        let fails = self
            .fail_matching
            .lock()
            .expect("mock lock poisoned")
            .as_ref()
            .is_some_and(|needle| out.to_string_lossy().contains(needle.as_str()));
        ProcessOutput {
            command: format!("mock-{kind} {}", out.display()),
            output: if fails { "mock failure".to_string() } else { String::new() },
            status: i32::from(fails),
        }
    }

    fn read(path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|err| BuildError::io(err, path))
    }

    fn write(out: &Path, content: &str) -> Result<()> {
        utils::create_parent_dir_all(out)?;
        fs::write(out, content).map_err(|err| BuildError::io(err, out))
    }

    fn render_map(module_map: &ModuleMap) -> String {
        module_map
            .iter()
            .map(|(name, path)| format!("{name}={}", path.display()))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn concat(inputs: &[PathBuf]) -> Result<String> {
        let mut content = String::new();
        for input in inputs {
            content.push_str(&Self::read(input)?);
            content.push('\n');
        }
        Ok(content)
    }
}

impl Driver for MockDriver {
    fn scan_module(&self, src: &Path, _extra_opts: &str) -> Result<ModuleInfo> {
        self.record(format!("scan {}", src.display()));
        let content = Self::read(src)?;
        let mut info = ModuleInfo::default();
        if let Some(decl) = RE_MODULE_DECL.captures(&content) {
            info.exported = true;
            info.name = decl[1].to_string();
        }
        for import in RE_IMPORT.captures_iter(&content) {
            let name = &import[1];
            if let Some(partition) = name.strip_prefix(':') {
                // partition imports resolve within the owning module
                let owner = info.name.split(':').next().unwrap_or_default();
                info.deps.push(format!("{owner}:{partition}"));
            } else {
                info.deps.push(name.to_string());
            }
        }
        Ok(info)
    }

    fn scan_includes(&self, src: &Path, _extra_opts: &str) -> Result<Vec<PathBuf>> {
        self.record(format!("scan-includes {}", src.display()));
        let content = Self::read(src)?;
        let dir = src.parent().unwrap_or_else(|| Path::new("."));
        Ok(RE_INCLUDE
            .captures_iter(&content)
            .map(|capture| dir.join(&capture[1]))
            .filter(|path| path.exists())
            .collect())
    }

    fn compile_bmi(
        &self,
        src: &Path,
        out: &Path,
        module_map: &ModuleMap,
        _extra_opts: &str,
    ) -> Result<ProcessOutput> {
        self.record(format!("bmi {} [{}]", out.display(), Self::render_map(module_map)));
        let result = self.result_for("bmi", out);
        if result.success() {
            Self::write(out, &format!("bmi:{}", Self::read(src)?))?;
        }
        Ok(result)
    }

    fn compile_object(
        &self,
        src: &Path,
        out: &Path,
        _debug: bool,
        module_map: &ModuleMap,
        _extra_opts: &str,
    ) -> Result<ProcessOutput> {
        self.record(format!(
            "obj {} <- {} [{}]",
            out.display(),
            src.display(),
            Self::render_map(module_map)
        ));
        let result = self.result_for("obj", out);
        if result.success() {
            Self::write(out, &format!("obj:{}", Self::read(src)?))?;
        }
        Ok(result)
    }

    fn archive(&self, objects: &[PathBuf], out: &Path) -> Result<ProcessOutput> {
        self.record(format!("archive {}", out.display()));
        let result = self.result_for("archive", out);
        if result.success() {
            Self::write(out, &format!("archive:{}", Self::concat(objects)?))?;
        }
        Ok(result)
    }

    fn link(
        &self,
        objects: &[PathBuf],
        out: &Path,
        _debug: bool,
        extra_opts: &str,
    ) -> Result<ProcessOutput> {
        let objs =
            objects.iter().map(|obj| obj.display().to_string()).collect::<Vec<_>>().join(",");
        self.record(format!("link {} objs=[{objs}] opts={extra_opts}", out.display()));
        let result = self.result_for("link", out);
        if result.success() {
            Self::write(out, &format!("link:{}", Self::concat(objects)?))?;
        }
        Ok(result)
    }

    fn shared_link(
        &self,
        objects: &[PathBuf],
        out: &Path,
        _extra_opts: &str,
    ) -> Result<ProcessOutput> {
        self.record(format!("shared {}", out.display()));
        let result = self.result_for("shared", out);
        if result.success() {
            Self::write(out, &format!("shared:{}", Self::concat(objects)?))?;
        }
        Ok(result)
    }

    fn compile_command(
        &self,
        src: &Path,
        out: &Path,
        _debug: bool,
        _module_map: &ModuleMap,
        extra_opts: &str,
    ) -> String {
        format!("mock-cc {extra_opts} -c {} -o {}", src.display(), out.display())
    }
}

/// A scratch project directory wired to a [`MockDriver`].
pub struct TempProject {
    root: tempfile::TempDir,
    driver: Arc<MockDriver>,
}

impl TempProject {
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir().map_err(|err| BuildError::io(err, "tempdir"))?;
        Ok(Self { root, driver: MockDriver::new() })
    }

    /// Creates a project populated from an on-disk template directory.
    pub fn from_template(template: impl AsRef<Path>) -> Result<Self> {
        let project = Self::new()?;
        let mut options = fs_extra::dir::CopyOptions::new();
        options.content_only = true;
        fs_extra::dir::copy(template.as_ref(), project.root(), &options)
            .map_err(BuildError::msg)?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn driver(&self) -> &Arc<MockDriver> {
        &self.driver
    }

    /// Writes a file under the project root, creating parent directories.
    pub fn add_file(&self, rel: impl AsRef<Path>, content: &str) -> PathBuf {
        let path = self.root().join(rel);
        utils::create_parent_dir_all(&path).expect("create source dir");
        fs::write(&path, content).expect("write source");
        path
    }

    /// Rewrites the file with its current content, bumping its mtime past
    /// every artifact built so far.
    pub fn touch(&self, rel: impl AsRef<Path>) {
        let path = self.root().join(rel);
        let content = fs::read(&path).expect("read file");
        self.settle();
        fs::write(&path, content).expect("rewrite file");
    }

    /// Sleeps long enough that subsequent writes get strictly newer mtimes.
    pub fn settle(&self) {
        std::thread::sleep(std::time::Duration::from_millis(15));
    }

    /// A build context rooted under the project's `out/` directory.
    pub fn context(&self, name: &str) -> Result<Context> {
        Context::with_jobs(name, self.root().join("out"), 2)
    }

    /// An executable builder driving the mock toolchain.
    pub fn exe(&self, name: &str) -> ExeBuilder {
        let mut builder = ExeBuilder::new(name);
        builder.set_driver(Arc::clone(&self.driver) as Arc<dyn Driver>);
        builder
    }

    /// A library builder driving the mock toolchain.
    pub fn lib(&self, name: &str) -> LibBuilder {
        let mut builder = LibBuilder::new(name);
        builder.set_driver(Arc::clone(&self.driver) as Arc<dyn Driver>);
        builder
    }
}
