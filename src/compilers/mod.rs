//! The abstract capability set a compiler driver has to provide.
//!
//! The core never parses the source language itself: module identity and
//! include dependencies always come from the driver's scanners, and every
//! compile/archive/link step is a driver invocation returning a
//! [`ProcessOutput`] record.

use crate::error::{BuildError, Result};
use std::{
    collections::BTreeMap,
    fmt::Debug,
    path::{Path, PathBuf},
    process::Command,
};

pub mod clang;
pub use clang::Clang;

/// The `name -> bmi path` table passed to every compile step so the compiler
/// can resolve imports.
///
/// Ordered so rendered command lines are deterministic.
pub type ModuleMap = BTreeMap<String, PathBuf>;

/// What the module scanner learned about one source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Logical module name, empty for classical units.
    pub name: String,
    /// Whether the unit is a module interface (or partition) and produces a
    /// bmi.
    pub exported: bool,
    /// Imported module names, in declared order.
    pub deps: Vec<String>,
}

/// Captured result of one driver subprocess.
#[derive(Clone, Debug)]
pub struct ProcessOutput {
    /// The rendered command line.
    pub command: String,
    /// Combined stderr/stdout of the subprocess.
    pub output: String,
    /// Exit status; zero is success.
    pub status: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turns a non-zero status into [`BuildError::Compile`], preserving the
    /// command and captured output.
    pub fn into_result(self) -> Result<ProcessOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(BuildError::Compile {
                command: self.command,
                output: self.output,
                status: self.status,
            })
        }
    }
}

/// Abstraction over a compiler toolchain able to build module projects.
///
/// Implementations format their own command lines; `extra_opts` strings
/// accumulate the option fragments contributed by builders and exports.
/// Output parent directories are created by the driver before it runs.
pub trait Driver: Debug + Send + Sync {
    /// Determines module identity and imports of a source, in declared
    /// order.
    fn scan_module(&self, src: &Path, extra_opts: &str) -> Result<ModuleInfo>;

    /// Returns the headers the source depends on.
    fn scan_includes(&self, src: &Path, extra_opts: &str) -> Result<Vec<PathBuf>>;

    /// Precompiles a module interface unit into a bmi.
    fn compile_bmi(
        &self,
        src: &Path,
        out: &Path,
        module_map: &ModuleMap,
        extra_opts: &str,
    ) -> Result<ProcessOutput>;

    /// Compiles a source (or a bmi) into an object file.
    fn compile_object(
        &self,
        src: &Path,
        out: &Path,
        debug: bool,
        module_map: &ModuleMap,
        extra_opts: &str,
    ) -> Result<ProcessOutput>;

    /// Archives objects into a static library.
    fn archive(&self, objects: &[PathBuf], out: &Path) -> Result<ProcessOutput>;

    /// Links objects (and libraries) into an executable.
    fn link(
        &self,
        objects: &[PathBuf],
        out: &Path,
        debug: bool,
        extra_opts: &str,
    ) -> Result<ProcessOutput>;

    /// Links objects into a shared library, exporting all symbols on
    /// platforms that require it.
    fn shared_link(
        &self,
        objects: &[PathBuf],
        out: &Path,
        extra_opts: &str,
    ) -> Result<ProcessOutput>;

    /// The command line `compile_object` would run, for the compilation
    /// database.
    fn compile_command(
        &self,
        src: &Path,
        out: &Path,
        debug: bool,
        module_map: &ModuleMap,
        extra_opts: &str,
    ) -> String;
}

/// Renders a command the way it is recorded in [`ProcessOutput::command`]
/// and `compile_commands.json`.
pub(crate) fn render_command(cmd: &Command) -> String {
    let mut rendered = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

/// Runs the command, capturing combined output.
pub(crate) fn run_command(mut cmd: Command) -> Result<ProcessOutput> {
    let rendered = render_command(&cmd);
    trace!(command = %rendered, "spawning");
    let program = PathBuf::from(cmd.get_program());
    let output = cmd.output().map_err(|err| BuildError::io(err, program))?;
    let mut combined = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.stdout.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(&output.stdout));
    }
    Ok(ProcessOutput {
        command: rendered,
        output: combined,
        status: output.status.code().unwrap_or(-1),
    })
}
