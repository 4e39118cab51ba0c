use crate::{
    error::{BuildError, Result},
    graph::DepGraph,
    utils,
};
use serde::{Deserialize, Serialize};
use std::{fmt, ops::Deref, path::PathBuf, sync::Arc};

/// Where a build context keeps its artifacts.
///
/// All artifacts of one context live under `<output>/<name>/`:
///
/// ```text
/// <output>/<name>/module/<module>.pcm      precompiled module interfaces
/// <output>/<name>/obj/<source>.obj         object files
/// <output>/<name>/cache/<builder>/...      unit sidecars and option fingerprints
/// <output>/<name>/<artifact>               final binaries, archives, shared libs
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLayout {
    /// Name of the build context, used as the directory under the output root.
    pub name: String,
    /// The output root all context directories live under.
    pub output: PathBuf,
    /// Whether compiles and links carry debug info.
    pub debug: bool,
}

impl OutputLayout {
    pub fn new(name: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), output: utils::canonicalized(output.into()), debug: false }
    }

    /// The directory holding everything this context produces.
    pub fn out_dir(&self) -> PathBuf {
        self.output.join(&self.name)
    }

    /// The directory precompiled module interfaces are written to.
    pub fn pcm_path(&self) -> PathBuf {
        self.out_dir().join("module")
    }

    /// The directory object files are written to.
    pub fn obj_path(&self) -> PathBuf {
        self.out_dir().join("obj")
    }

    /// The cache directory of a single builder within this context.
    ///
    /// Namespaced by builder name since several builders may share one
    /// context.
    pub fn cache_dir(&self, builder: &str) -> PathBuf {
        self.out_dir().join("cache").join(builder)
    }

    /// Path of the compilation database emitted for this context.
    pub fn compile_commands_path(&self) -> PathBuf {
        self.out_dir().join("compile_commands.json")
    }
}

impl fmt::Display for OutputLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.name, self.out_dir().display())
    }
}

/// The per-build-invocation bundle: output layout, task graph and worker
/// pool.
///
/// One `Context` is shared by every builder of a build invocation. Planning
/// happens single-threaded on the caller; parallelism starts when planned
/// nodes are posted to the pool. Invoking `build` concurrently on the same
/// context is not supported.
#[derive(Clone)]
pub struct Context {
    layout: OutputLayout,
    /// The shared task graph all builders of this invocation plan into.
    pub graph: DepGraph,
    /// The worker pool scheduler nodes are posted to.
    pub pool: Arc<rayon::ThreadPool>,
}

impl Context {
    /// Creates a context with a worker pool sized to the number of available
    /// cpus.
    pub fn new(name: impl Into<String>, output: impl Into<PathBuf>) -> Result<Self> {
        Self::with_jobs(name, output, num_cpus::get())
    }

    /// Creates a context with a worker pool of exactly `jobs` threads.
    pub fn with_jobs(
        name: impl Into<String>,
        output: impl Into<PathBuf>,
        jobs: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs.max(1))
            .build()
            .map_err(BuildError::msg)?;
        Ok(Self {
            layout: OutputLayout::new(name, output),
            graph: DepGraph::default(),
            pool: Arc::new(pool),
        })
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn set_debug(&mut self, debug: bool) -> &mut Self {
        self.layout.debug = debug;
        self
    }

    /// Posts every ready node of the graph to the worker pool.
    pub fn run(&self) {
        self.graph.run_on(&self.pool);
    }

    /// Makes sure the context's output directory exists.
    pub fn ensure_out_dir(&self) -> Result<()> {
        let dir = self.layout.out_dir();
        std::fs::create_dir_all(&dir).map_err(|err| BuildError::io(err, dir))
    }

    /// Removes everything this context has built.
    pub fn clean(&self) -> Result<()> {
        let dir = self.layout.out_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|err| BuildError::io(err, dir))?;
        }
        Ok(())
    }
}

impl Deref for Context {
    type Target = OutputLayout;

    fn deref(&self) -> &Self::Target {
        &self.layout
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("layout", &self.layout)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl AsRef<OutputLayout> for Context {
    fn as_ref(&self) -> &OutputLayout {
        &self.layout
    }
}
