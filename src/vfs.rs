//! The planned-output set backing all staleness decisions.

use crate::{
    error::{BuildError, Result},
    utils,
};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::SystemTime,
};

/// A modification time as seen through the [`Vfs`].
///
/// Outputs that were planned this invocation do not exist on disk yet but
/// must compare newer than anything that does, so downstream checks schedule
/// their own rebuilds unconditionally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mtime {
    /// On-disk modification time.
    Disk(SystemTime),
    /// Planned this invocation, infinitely fresh.
    Planned,
}

/// The set of output paths planned during one build invocation.
///
/// Populated at planning time only; execution never mutates it. Child plan
/// contexts (spawned when a proxy re-enters another context) share the same
/// set, so outputs planned on either side are visible to both.
#[derive(Debug, Default)]
pub struct Vfs {
    planned: HashSet<PathBuf>,
}

impl Vfs {
    /// Records that `path` will be produced by a planned action.
    pub fn add_file(&mut self, path: impl Into<PathBuf>) {
        self.planned.insert(path.into());
    }

    /// Whether the path is planned or already exists on disk.
    pub fn exists(&self, path: &Path) -> bool {
        self.planned.contains(path) || path.exists()
    }

    /// The modification time of `path`, treating planned outputs as
    /// infinitely fresh.
    pub fn mtime(&self, path: &Path) -> Result<Mtime> {
        if self.planned.contains(path) {
            return Ok(Mtime::Planned);
        }
        Ok(Mtime::Disk(utils::mtime(path)?))
    }

    /// Whether `output` must be (re)built given its dependencies.
    ///
    /// True iff the output is absent or any dependency is strictly newer. A
    /// missing dependency is a hard error: nothing scheduled so far produces
    /// it, and the compiler would fail on it anyway.
    pub fn needs_update<I, P>(&self, output: &Path, deps: I) -> Result<bool>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        if !self.exists(output) {
            trace!(output = %output.display(), "output missing");
            return Ok(true);
        }
        let output_mtime = self.mtime(output)?;
        for dep in deps {
            let dep = dep.as_ref();
            if !self.exists(dep) {
                return Err(BuildError::FileNotFound(dep.to_path_buf()));
            }
            if self.mtime(dep)? > output_mtime {
                trace!(output = %output.display(), dep = %dep.display(), "dependency is newer");
                return Ok(true);
            }
        }
        Ok(false)
    }
}
