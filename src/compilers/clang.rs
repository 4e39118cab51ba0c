//! Driver implementation for clang toolchains.
//!
//! Module identity comes from `clang-scan-deps` in p1689 format, include
//! dependencies from `clang++ -MM`, bmis from `--precompile` and archives
//! from `ar`.

use super::{run_command, Driver, ModuleInfo, ModuleMap, ProcessOutput};
use crate::{
    error::{BuildError, Result},
    utils,
};
use semver::Version;
use std::{
    path::{Path, PathBuf},
    process::Command,
};

/// First clang release with usable standard C++ modules support.
pub const CLANG_FIRST_MODULES: Version = Version::new(16, 0, 0);

/// Diagnostics flags passed to every clang invocation so captured output
/// stays readable in a terminal.
const DIAG_ARGS: &[&str] = &["-fansi-escape-codes", "-fcolor-diagnostics"];

/// A clang toolchain on the search path (or at explicit locations).
#[derive(Clone, Debug)]
pub struct Clang {
    /// The `clang++` executable.
    cxx: PathBuf,
    /// The `clang-scan-deps` executable.
    scan_deps: PathBuf,
    /// The `ar` executable.
    ar: PathBuf,
    /// Compile options baked into the driver itself.
    compile_options: Vec<String>,
    /// Link options baked into the driver itself.
    link_options: Vec<String>,
}

impl Default for Clang {
    fn default() -> Self {
        Self::new("clang++")
    }
}

impl Clang {
    pub fn new(cxx: impl Into<PathBuf>) -> Self {
        Self {
            cxx: cxx.into(),
            scan_deps: "clang-scan-deps".into(),
            ar: "ar".into(),
            compile_options: Vec::new(),
            link_options: Vec::new(),
        }
    }

    /// Overrides the `clang-scan-deps` executable.
    pub fn with_scanner(mut self, scan_deps: impl Into<PathBuf>) -> Self {
        self.scan_deps = scan_deps.into();
        self
    }

    /// Overrides the `ar` executable.
    pub fn with_archiver(mut self, ar: impl Into<PathBuf>) -> Self {
        self.ar = ar.into();
        self
    }

    /// Appends driver-level compile options, e.g. `-std=c++20 -Wall`.
    pub fn option(&mut self, options: &str) -> &mut Self {
        self.compile_options.extend(options.split_whitespace().map(str::to_string));
        self
    }

    /// Appends driver-level link options.
    pub fn link_option(&mut self, options: &str) -> &mut Self {
        self.link_options.extend(options.split_whitespace().map(str::to_string));
        self
    }

    /// Invokes `clang++ --version` and parses the output as a SemVer
    /// [`Version`].
    pub fn version(&self) -> Result<Version> {
        let mut cmd = Command::new(&self.cxx);
        cmd.arg("--version");
        let output = run_command(cmd)?.into_result()?;
        parse_version(&output.output)
            .ok_or_else(|| BuildError::msg(format!("cannot parse version from: {}", output.output)))
    }

    /// Whether this clang is recent enough to compile named modules.
    pub fn supports_modules(&self) -> Result<bool> {
        Ok(self.version()? >= CLANG_FIRST_MODULES)
    }

    fn module_map_args(cmd: &mut Command, module_map: &ModuleMap) {
        for (name, path) in module_map {
            cmd.arg(format!("-fmodule-file={}={}", name, path.display()));
        }
    }

    fn extra_args(cmd: &mut Command, extra_opts: &str) {
        cmd.args(extra_opts.split_whitespace());
    }

    fn object_cmd(
        &self,
        src: &Path,
        out: &Path,
        debug: bool,
        module_map: &ModuleMap,
        extra_opts: &str,
    ) -> Command {
        let mut cmd = Command::new(&self.cxx);
        cmd.args(DIAG_ARGS);
        if debug {
            cmd.arg("-g");
        }
        cmd.args(&self.compile_options);
        Self::module_map_args(&mut cmd, module_map);
        Self::extra_args(&mut cmd, extra_opts);
        cmd.arg("-c").arg(src).arg("-o").arg(out);
        cmd
    }
}

impl Driver for Clang {
    fn scan_module(&self, src: &Path, extra_opts: &str) -> Result<ModuleInfo> {
        let mut cmd = Command::new(&self.scan_deps);
        cmd.arg("-format=p1689").arg("--");
        // the scanner wants the full compile command line it should analyze
        let compile = self.object_cmd(src, &src.with_extension("obj"), false, &ModuleMap::new(), extra_opts);
        cmd.arg(compile.get_program());
        cmd.args(compile.get_args());
        let output = run_command(cmd)?;
        if !output.success() {
            return Err(BuildError::Scan { input: src.to_path_buf(), detail: output.output });
        }
        parse_p1689(&output.output)
            .map_err(|err| BuildError::Scan { input: src.to_path_buf(), detail: err.to_string() })
    }

    fn scan_includes(&self, src: &Path, extra_opts: &str) -> Result<Vec<PathBuf>> {
        let mut cmd = Command::new(&self.cxx);
        cmd.args(&self.compile_options);
        Self::extra_args(&mut cmd, extra_opts);
        cmd.arg("-MM").arg(src);
        let output = run_command(cmd)?;
        if !output.success() {
            return Err(BuildError::Scan { input: src.to_path_buf(), detail: output.output });
        }
        Ok(parse_make_deps(&output.output))
    }

    fn compile_bmi(
        &self,
        src: &Path,
        out: &Path,
        module_map: &ModuleMap,
        extra_opts: &str,
    ) -> Result<ProcessOutput> {
        utils::create_parent_dir_all(out)?;
        let mut cmd = Command::new(&self.cxx);
        cmd.args(DIAG_ARGS);
        cmd.arg("-std=c++20").arg("--precompile");
        cmd.args(&self.compile_options);
        Self::module_map_args(&mut cmd, module_map);
        Self::extra_args(&mut cmd, extra_opts);
        cmd.arg("-c").arg(src).arg("-o").arg(out);
        run_command(cmd)
    }

    fn compile_object(
        &self,
        src: &Path,
        out: &Path,
        debug: bool,
        module_map: &ModuleMap,
        extra_opts: &str,
    ) -> Result<ProcessOutput> {
        utils::create_parent_dir_all(out)?;
        run_command(self.object_cmd(src, out, debug, module_map, extra_opts))
    }

    fn archive(&self, objects: &[PathBuf], out: &Path) -> Result<ProcessOutput> {
        utils::create_parent_dir_all(out)?;
        let mut cmd = Command::new(&self.ar);
        cmd.arg("r").arg(out);
        cmd.args(objects);
        run_command(cmd)
    }

    fn link(
        &self,
        objects: &[PathBuf],
        out: &Path,
        debug: bool,
        extra_opts: &str,
    ) -> Result<ProcessOutput> {
        utils::create_parent_dir_all(out)?;
        let mut cmd = Command::new(&self.cxx);
        cmd.args(DIAG_ARGS);
        if debug {
            cmd.arg("-g");
        }
        cmd.args(&self.link_options);
        Self::extra_args(&mut cmd, extra_opts);
        cmd.args(objects);
        cmd.arg("-o").arg(out);
        run_command(cmd)
    }

    fn shared_link(
        &self,
        objects: &[PathBuf],
        out: &Path,
        extra_opts: &str,
    ) -> Result<ProcessOutput> {
        utils::create_parent_dir_all(out)?;
        let mut cmd = Command::new(&self.cxx);
        cmd.args(DIAG_ARGS);
        cmd.arg("-shared");
        if cfg!(windows) {
            cmd.arg("-Wl,--export-all-symbols");
        }
        cmd.args(&self.link_options);
        Self::extra_args(&mut cmd, extra_opts);
        cmd.args(objects);
        cmd.arg("-o").arg(out);
        run_command(cmd)
    }

    fn compile_command(
        &self,
        src: &Path,
        out: &Path,
        debug: bool,
        module_map: &ModuleMap,
        extra_opts: &str,
    ) -> String {
        super::render_command(&self.object_cmd(src, out, debug, module_map, extra_opts))
    }
}

/// Parses a p1689 dependency scan into the module info of the first rule.
fn parse_p1689(json: &str) -> Result<ModuleInfo> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let rule = value
        .get("rules")
        .and_then(|rules| rules.get(0))
        .ok_or_else(|| BuildError::msg("p1689 output has no rules"))?;

    let mut info = ModuleInfo::default();
    if let Some(provides) = rule.get("provides").and_then(|p| p.get(0)) {
        info.exported = true;
        info.name = provides
            .get("logical-name")
            .and_then(|name| name.as_str())
            .ok_or_else(|| BuildError::msg("p1689 provides entry has no logical-name"))?
            .to_string();
    }
    if let Some(requires) = rule.get("requires").and_then(|r| r.as_array()) {
        for dep in requires {
            if let Some(name) = dep.get("logical-name").and_then(|name| name.as_str()) {
                info.deps.push(name.to_string());
            }
        }
    }
    Ok(info)
}

/// Parses the make-style rule emitted by `-MM` into its dependency paths.
///
/// The rule starts after the first `:`; backslash-newline pairs continue it.
fn parse_make_deps(output: &str) -> Vec<PathBuf> {
    let Some(colon) = output.find(':') else { return Vec::new() };
    output[colon + 1..]
        .replace("\\\r\n", " ")
        .replace("\\\n", " ")
        .split_whitespace()
        .filter(|token| *token != "\\")
        .map(PathBuf::from)
        .collect()
}

fn parse_version(output: &str) -> Option<Version> {
    let start = output.find("version ")? + "version ".len();
    let digits: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    Version::parse(digits.trim_end_matches('.')).ok()
}
