use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// An `io::Error` annotated with the path that triggered it.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", .path.display())]
pub struct IoError {
    io: io::Error,
    path: PathBuf,
}

impl IoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`
    pub fn inner(&self) -> &io::Error {
        &self.io
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        err.io
    }
}

/// Various errors raised while planning or executing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The module/include scanner failed on a source file.
    #[error("failed to scan {}: {detail}", .input.display())]
    Scan { input: PathBuf, detail: String },
    /// A module reference could not be resolved against local units or any export.
    #[error("module '{name}' imported by {} was not found", .importer.display())]
    ModuleNotFound { importer: PathBuf, name: String },
    /// The module import graph contains a cycle.
    #[error("cyclic module dependency: {}", .0.join(" -> "))]
    CyclicModuleDependency(Vec<String>),
    /// The package usage graph contains a cycle.
    #[error("cyclic package dependency: {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> "))]
    CyclicPackageDependency(Vec<PathBuf>),
    /// Two local units claim the same exported module name.
    #[error("module '{name}' is exported by both {} and {}", .first.display(), .second.display())]
    DuplicateModule { name: String, first: PathBuf, second: PathBuf },
    /// A compiler subprocess exited with a non-zero status.
    #[error("command exited with status {status}: {command}\n{output}")]
    Compile { command: String, output: String, status: i32 },
    /// A dependency file was required for a staleness check but does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    /// A package advertised no buildable usage.
    #[error("package '{0}' is not built")]
    PackageNotBuilt(String),
    /// Malformed project description.
    #[error("invalid project description: {0}")]
    Config(String),
    /// The task's graph was terminated before the task completed.
    #[error("build terminated")]
    Terminated,
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        IoError::new(err, path).into()
    }

    pub(crate) fn msg(msg: impl std::fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    /// Whether this error is the poison value of a terminated graph rather
    /// than an originating failure.
    pub fn is_terminated(&self) -> bool {
        matches!(self, BuildError::Terminated)
    }
}
