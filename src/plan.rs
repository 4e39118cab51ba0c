//! Single-threaded planning state shared by every target of one build call.
//!
//! A [`PlanCtx`] owns the staleness oracle and the scheduler handle; targets
//! receive it in `build` and emit at most one node each. Proxies re-entering
//! another context get a scoped child that shares the same state but swaps
//! the layout and options.

use crate::{
    compilers::{Driver, ModuleMap},
    config::OutputLayout,
    error::{BuildError, Result},
    graph::{DepGraph, FutureList, NodeId},
    targets::Target,
    vfs::Vfs,
};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

/// The compile and link option strings a compile step runs with.
///
/// Accumulates fragments contributed by the builder itself and by every
/// export depended on; the exact strings are fingerprinted on disk and feed
/// staleness.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompilerOptions {
    pub compile: String,
    pub link: String,
}

impl CompilerOptions {
    pub fn push_compile(&mut self, fragment: &str) {
        push_fragment(&mut self.compile, fragment);
    }

    pub fn push_link(&mut self, fragment: &str) {
        push_fragment(&mut self.link, fragment);
    }
}

fn push_fragment(options: &mut String, fragment: &str) {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        return;
    }
    if !options.is_empty() {
        options.push(' ');
    }
    options.push_str(fragment);
}

/// Mutable planning state of one build call: the vfs, the futures of planned
/// actions and the per-target memo.
pub(crate) struct PlanState {
    pub vfs: Vfs,
    pub graph: DepGraph,
    pub futures: FutureList,
    /// `build` results by target identity; a target plans at most once.
    built: HashMap<usize, Option<NodeId>>,
    /// Targets currently planning, for import cycle detection.
    in_flight: HashSet<usize>,
    /// Human-readable plan stack backing cycle chains.
    stack: Vec<String>,
    next_action: usize,
}

impl PlanState {
    pub(crate) fn new(graph: DepGraph) -> Self {
        Self {
            vfs: Vfs::default(),
            graph,
            futures: FutureList::default(),
            built: HashMap::new(),
            in_flight: HashSet::new(),
            stack: Vec::new(),
            next_action: 1,
        }
    }
}

/// Read-only planning handle passed to every target's `build`.
pub struct PlanCtx<'a> {
    pub layout: &'a OutputLayout,
    pub driver: &'a Arc<dyn Driver>,
    pub opts: &'a CompilerOptions,
    pub(crate) state: &'a mut PlanState,
}

impl<'a> PlanCtx<'a> {
    pub(crate) fn new(
        layout: &'a OutputLayout,
        driver: &'a Arc<dyn Driver>,
        opts: &'a CompilerOptions,
        state: &'a mut PlanState,
    ) -> Self {
        Self { layout, driver, opts, state }
    }

    /// Runs `f` with a child plan context that overrides layout and/or
    /// options but shares this plan's vfs, graph and memo.
    pub fn scoped<R>(
        &mut self,
        layout: Option<&OutputLayout>,
        opts: Option<&CompilerOptions>,
        f: impl FnOnce(&mut PlanCtx<'_>) -> R,
    ) -> R {
        let mut child = PlanCtx {
            layout: layout.unwrap_or(self.layout),
            driver: self.driver,
            opts: opts.unwrap_or(self.opts),
            state: &mut *self.state,
        };
        f(&mut child)
    }

    /// Plans the target, memoized by target identity.
    ///
    /// Re-entering a target that is still planning means the module import
    /// graph is cyclic.
    pub fn build_target(&mut self, target: &Rc<dyn Target>) -> Result<Option<NodeId>> {
        let key = Rc::as_ptr(target) as *const () as usize;
        if let Some(node) = self.state.built.get(&key) {
            return Ok(*node);
        }
        if self.state.in_flight.contains(&key) {
            let mut chain = self.state.stack.clone();
            chain.push(target.describe(self.layout));
            return Err(BuildError::CyclicModuleDependency(chain));
        }
        self.state.in_flight.insert(key);
        self.state.stack.push(target.describe(self.layout));
        let result = target.build(self);
        self.state.stack.pop();
        self.state.in_flight.remove(&key);
        let node = result?;
        self.state.built.insert(key, node);
        Ok(node)
    }

    /// Whether `output` must be rebuilt given its dependency paths.
    pub fn needs_update<I, P>(&self, output: &Path, deps: I) -> Result<bool>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.state.vfs.needs_update(output, deps)
    }

    fn emit(&mut self, output: &Path, task: crate::graph::Task, deps: Vec<NodeId>) -> NodeId {
        self.state.vfs.add_file(output);
        let mut handle = self.state.graph.add_node(task, deps);
        self.state.futures.push(handle.take_future());
        handle.id()
    }

    fn next_action(&mut self) -> usize {
        let id = self.state.next_action;
        self.state.next_action += 1;
        id
    }

    /// Plans a bmi compile of `input` into `output`.
    pub fn compile_bmi(
        &mut self,
        input: PathBuf,
        output: PathBuf,
        module_map: ModuleMap,
        deps: Vec<NodeId>,
    ) -> NodeId {
        let action = self.next_action();
        let driver = Arc::clone(self.driver);
        let opts = self.opts.compile.clone();
        let out = output.clone();
        let task = Box::new(move || {
            info!("[{action}] compiling bmi {}", output.display());
            let result = driver.compile_bmi(&input, &output, &module_map, &opts)?.into_result()?;
            log_process(&result);
            Ok(())
        });
        self.emit(&out, task, deps)
    }

    /// Plans an object compile of `input` (a source or a bmi) into `output`.
    pub fn compile_object(
        &mut self,
        input: PathBuf,
        output: PathBuf,
        module_map: ModuleMap,
        deps: Vec<NodeId>,
    ) -> NodeId {
        let action = self.next_action();
        let driver = Arc::clone(self.driver);
        let opts = self.opts.compile.clone();
        let debug = self.layout.debug;
        let out = output.clone();
        let task = Box::new(move || {
            info!("[{action}] compiling obj {}", output.display());
            let result = driver
                .compile_object(&input, &output, debug, &module_map, &opts)?
                .into_result()?;
            log_process(&result);
            Ok(())
        });
        self.emit(&out, task, deps)
    }

    /// Plans an archive step.
    pub fn archive(&mut self, objects: Vec<PathBuf>, output: PathBuf, deps: Vec<NodeId>) -> NodeId {
        let action = self.next_action();
        let driver = Arc::clone(self.driver);
        let out = output.clone();
        let task = Box::new(move || {
            info!("[{action}] archiving {}", output.display());
            let result = driver.archive(&objects, &output)?.into_result()?;
            log_process(&result);
            Ok(())
        });
        self.emit(&out, task, deps)
    }

    /// Plans an executable link.
    pub fn link(&mut self, objects: Vec<PathBuf>, output: PathBuf, deps: Vec<NodeId>) -> NodeId {
        let action = self.next_action();
        let driver = Arc::clone(self.driver);
        let opts = self.opts.link.clone();
        let debug = self.layout.debug;
        let out = output.clone();
        let task = Box::new(move || {
            info!("[{action}] linking {}", output.display());
            let result = driver.link(&objects, &output, debug, &opts)?.into_result()?;
            log_process(&result);
            Ok(())
        });
        self.emit(&out, task, deps)
    }

    /// Plans a shared-library link.
    pub fn shared_link(
        &mut self,
        objects: Vec<PathBuf>,
        output: PathBuf,
        deps: Vec<NodeId>,
    ) -> NodeId {
        let action = self.next_action();
        let driver = Arc::clone(self.driver);
        let opts = self.opts.link.clone();
        let out = output.clone();
        let task = Box::new(move || {
            info!("[{action}] linking shared {}", output.display());
            let result = driver.shared_link(&objects, &output, &opts)?.into_result()?;
            log_process(&result);
            Ok(())
        });
        self.emit(&out, task, deps)
    }
}

fn log_process(result: &crate::compilers::ProcessOutput) {
    debug!(command = %result.command);
    if !result.output.is_empty() {
        info!("{}", result.output.trim_end());
    }
}
