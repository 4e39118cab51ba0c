//! The typed nodes of the action graph.
//!
//! Every target knows its deterministic output path and how to plan itself:
//! `build` emits at most one scheduler node and returns its id, or `None`
//! when the output is up to date. Planning is memoized per target by the
//! [`PlanCtx`], so shared dependencies plan exactly once.

use crate::{
    compilers::ModuleMap,
    config::OutputLayout,
    error::{BuildError, Result},
    graph::NodeId,
    plan::{CompilerOptions, PlanCtx},
    utils,
};
use std::{
    cell::RefCell,
    collections::HashSet,
    fmt,
    path::PathBuf,
    rc::Rc,
};

/// A node of the target graph.
pub trait Target: fmt::Debug {
    /// The expected output path, deterministic even before building.
    fn output(&self, layout: &OutputLayout) -> PathBuf;

    /// Plans the target into the graph, returning the emitted node if the
    /// output is stale.
    fn build(&self, plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>>;

    /// How the target shows up in cycle chains and logs.
    fn describe(&self, layout: &OutputLayout) -> String {
        self.output(layout).display().to_string()
    }
}

/// A target that provides a named module's bmi.
pub trait ModuleTarget: Target {
    /// The logical module name, e.g. `m` or `m:part`.
    fn module_name(&self) -> &str;

    /// The module targets this bmi itself imports.
    fn module_deps(&self) -> Vec<Rc<dyn ModuleTarget>> {
        Vec::new()
    }

    /// The layout the target's subtree resolves its outputs under, if it
    /// pins one (proxies into another context do).
    fn pinned_layout(&self) -> Option<&OutputLayout> {
        None
    }

    fn as_target(self: Rc<Self>) -> Rc<dyn Target>;
}

/// Collects `(name, bmi path)` pairs for a module target and everything it
/// imports, parent before children; the first provider of a name wins.
///
/// `visiting` tracks in-flight targets: revisiting one means the import
/// graph is cyclic.
pub(crate) fn collect_module_map(
    target: &Rc<dyn ModuleTarget>,
    layout: &OutputLayout,
    map: &mut ModuleMap,
    visiting: &mut HashSet<usize>,
    chain: &mut Vec<String>,
) -> Result<()> {
    let layout = target.pinned_layout().unwrap_or(layout);
    let key = Rc::as_ptr(target) as *const () as usize;
    if visiting.contains(&key) {
        let mut cycle = chain.clone();
        cycle.push(target.module_name().to_string());
        return Err(BuildError::CyclicModuleDependency(cycle));
    }
    if map.contains_key(target.module_name()) {
        return Ok(());
    }
    visiting.insert(key);
    chain.push(target.module_name().to_string());
    map.insert(target.module_name().to_string(), target.output(layout));
    for dep in target.module_deps() {
        collect_module_map(&dep, layout, map, visiting, chain)?;
    }
    chain.pop();
    visiting.remove(&key);
    Ok(())
}

/// The module map a target's compile step needs: every module reachable
/// through its module deps.
fn module_map_of(
    deps: &[Rc<dyn ModuleTarget>],
    layout: &OutputLayout,
) -> Result<ModuleMap> {
    let mut map = ModuleMap::new();
    let mut visiting = HashSet::new();
    let mut chain = Vec::new();
    for dep in deps {
        collect_module_map(dep, layout, &mut map, &mut visiting, &mut chain)?;
    }
    Ok(map)
}

/// A precompiled module interface under the context's `module/` directory.
pub struct BmiTarget {
    name: String,
    input: PathBuf,
    /// File name under `module/`, `:` sanitized to `-`.
    file_name: String,
    include_deps: Vec<PathBuf>,
    module_deps: RefCell<Vec<Rc<dyn ModuleTarget>>>,
    file_deps: RefCell<Vec<PathBuf>>,
}

impl BmiTarget {
    pub fn new(name: impl Into<String>, input: PathBuf, include_deps: Vec<PathBuf>) -> Self {
        let name = name.into();
        let file_name = format!("{}.pcm", utils::sanitize_module_name(&name));
        Self {
            name,
            input,
            file_name,
            include_deps,
            module_deps: RefCell::new(Vec::new()),
            file_deps: RefCell::new(Vec::new()),
        }
    }

    pub fn depend_on_module(&self, target: Rc<dyn ModuleTarget>) {
        self.module_deps.borrow_mut().push(target);
    }

    pub fn depend_on_file(&self, path: PathBuf) {
        self.file_deps.borrow_mut().push(path);
    }
}

impl fmt::Debug for BmiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmiTarget")
            .field("name", &self.name)
            .field("input", &self.input)
            .finish()
    }
}

impl Target for BmiTarget {
    fn output(&self, layout: &OutputLayout) -> PathBuf {
        layout.pcm_path().join(&self.file_name)
    }

    fn build(&self, plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>> {
        let module_deps = self.module_deps.borrow().clone();
        let mut nodes = Vec::new();
        for dep in &module_deps {
            if let Some(node) = plan.build_target(&dep.clone().as_target())? {
                nodes.push(node);
            }
        }

        let output = self.output(plan.layout);
        let mut stale_deps = vec![self.input.clone()];
        stale_deps.extend(self.include_deps.iter().cloned());
        stale_deps.extend(self.file_deps.borrow().iter().cloned());
        stale_deps.extend(module_deps.iter().map(|dep| {
            dep.output(dep.pinned_layout().unwrap_or(plan.layout))
        }));

        if !plan.needs_update(&output, &stale_deps)? {
            return Ok(None);
        }
        let map = module_map_of(&module_deps, plan.layout)?;
        Ok(Some(plan.compile_bmi(self.input.clone(), output, map, nodes)))
    }

    fn describe(&self, _layout: &OutputLayout) -> String {
        self.name.clone()
    }
}

impl ModuleTarget for BmiTarget {
    fn module_name(&self) -> &str {
        &self.name
    }

    fn module_deps(&self) -> Vec<Rc<dyn ModuleTarget>> {
        self.module_deps.borrow().clone()
    }

    fn as_target(self: Rc<Self>) -> Rc<dyn Target> {
        self
    }
}

/// How an object file is produced.
pub enum ObjectKind {
    /// A classical translation unit compiled straight from its source.
    Classical {
        input: PathBuf,
        include_deps: Vec<PathBuf>,
        module_deps: RefCell<Vec<Rc<dyn ModuleTarget>>>,
        file_deps: RefCell<Vec<PathBuf>>,
    },
    /// A module interface unit: the object is compiled from the bmi, not
    /// from the original source.
    ModuleInterface { bmi: Rc<BmiTarget> },
}

/// An object file under the context's `obj/` directory.
pub struct ObjectTarget {
    /// Path under `obj/`, derived from the source path.
    rel_output: PathBuf,
    kind: ObjectKind,
}

impl ObjectTarget {
    pub fn classical(input: PathBuf, include_deps: Vec<PathBuf>, rel_output: PathBuf) -> Self {
        Self {
            rel_output,
            kind: ObjectKind::Classical {
                input,
                include_deps,
                module_deps: RefCell::new(Vec::new()),
                file_deps: RefCell::new(Vec::new()),
            },
        }
    }

    pub fn module_interface(bmi: Rc<BmiTarget>, rel_output: PathBuf) -> Self {
        Self { rel_output, kind: ObjectKind::ModuleInterface { bmi } }
    }

    /// The bmi this object is compiled from, if it is a module interface.
    pub fn bmi(&self) -> Option<&Rc<BmiTarget>> {
        match &self.kind {
            ObjectKind::Classical { .. } => None,
            ObjectKind::ModuleInterface { bmi } => Some(bmi),
        }
    }

    /// Wires a resolved module dependency. For module interface units the
    /// import belongs to the bmi compile, not the object compile.
    pub fn depend_on_module(&self, target: Rc<dyn ModuleTarget>) {
        match &self.kind {
            ObjectKind::Classical { module_deps, .. } => module_deps.borrow_mut().push(target),
            ObjectKind::ModuleInterface { bmi } => bmi.depend_on_module(target),
        }
    }

    pub fn depend_on_file(&self, path: PathBuf) {
        match &self.kind {
            ObjectKind::Classical { file_deps, .. } => file_deps.borrow_mut().push(path),
            ObjectKind::ModuleInterface { bmi } => bmi.depend_on_file(path),
        }
    }
}

impl fmt::Debug for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ObjectKind::Classical { .. } => "classical",
            ObjectKind::ModuleInterface { .. } => "module-interface",
        };
        f.debug_struct("ObjectTarget")
            .field("output", &self.rel_output)
            .field("kind", &kind)
            .finish()
    }
}

impl Target for ObjectTarget {
    fn output(&self, layout: &OutputLayout) -> PathBuf {
        layout.obj_path().join(&self.rel_output)
    }

    fn build(&self, plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>> {
        let output = self.output(plan.layout);
        match &self.kind {
            ObjectKind::Classical { input, include_deps, module_deps, file_deps } => {
                let module_deps = module_deps.borrow().clone();
                let mut nodes = Vec::new();
                for dep in &module_deps {
                    if let Some(node) = plan.build_target(&dep.clone().as_target())? {
                        nodes.push(node);
                    }
                }

                let mut stale_deps = vec![input.clone()];
                stale_deps.extend(include_deps.iter().cloned());
                stale_deps.extend(file_deps.borrow().iter().cloned());
                stale_deps.extend(module_deps.iter().map(|dep| {
                    dep.output(dep.pinned_layout().unwrap_or(plan.layout))
                }));

                if !plan.needs_update(&output, &stale_deps)? {
                    return Ok(None);
                }
                let map = module_map_of(&module_deps, plan.layout)?;
                Ok(Some(plan.compile_object(input.clone(), output, map, nodes)))
            }
            ObjectKind::ModuleInterface { bmi } => {
                let node = plan.build_target(&(Rc::clone(bmi) as Rc<dyn Target>))?;
                let bmi_output = bmi.output(plan.layout);
                if !plan.needs_update(&output, [&bmi_output])? {
                    return Ok(None);
                }
                let nodes = node.into_iter().collect();
                Ok(Some(plan.compile_object(bmi_output, output, ModuleMap::new(), nodes)))
            }
        }
    }
}

/// A bmi already built by an upstream package; planning never emits a node
/// for it.
#[derive(Debug)]
pub struct ExternalBmi {
    name: String,
    output: PathBuf,
}

impl ExternalBmi {
    pub fn new(name: impl Into<String>, output: PathBuf) -> Self {
        Self { name: name.into(), output }
    }
}

impl Target for ExternalBmi {
    fn output(&self, _layout: &OutputLayout) -> PathBuf {
        self.output.clone()
    }

    fn build(&self, _plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>> {
        Ok(None)
    }

    fn describe(&self, _layout: &OutputLayout) -> String {
        self.name.clone()
    }
}

impl ModuleTarget for ExternalBmi {
    fn module_name(&self) -> &str {
        &self.name
    }

    fn as_target(self: Rc<Self>) -> Rc<dyn Target> {
        self
    }
}

/// Re-interprets a module target under another build context.
///
/// Outputs resolve in the override context's directory layout while
/// scheduling still occurs in the downstream graph.
pub struct TargetProxy {
    inner: Rc<dyn ModuleTarget>,
    layout: OutputLayout,
    opts: CompilerOptions,
}

impl TargetProxy {
    pub fn new(inner: Rc<dyn ModuleTarget>, layout: OutputLayout, opts: CompilerOptions) -> Self {
        Self { inner, layout, opts }
    }
}

impl fmt::Debug for TargetProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetProxy")
            .field("module", &self.inner.module_name())
            .field("layout", &self.layout)
            .finish()
    }
}

impl Target for TargetProxy {
    fn output(&self, _layout: &OutputLayout) -> PathBuf {
        self.inner.output(&self.layout)
    }

    fn build(&self, plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>> {
        let inner = Rc::clone(&self.inner).as_target();
        plan.scoped(Some(&self.layout), Some(&self.opts), |child| child.build_target(&inner))
    }

    fn describe(&self, _layout: &OutputLayout) -> String {
        self.inner.module_name().to_string()
    }
}

impl ModuleTarget for TargetProxy {
    fn module_name(&self) -> &str {
        self.inner.module_name()
    }

    fn module_deps(&self) -> Vec<Rc<dyn ModuleTarget>> {
        self.inner.module_deps()
    }

    fn pinned_layout(&self) -> Option<&OutputLayout> {
        Some(&self.layout)
    }

    fn as_target(self: Rc<Self>) -> Rc<dyn Target> {
        self
    }
}

/// Common body of the archive/link root targets: plan all deps, gather
/// their outputs and decide staleness against them plus the file deps.
struct LinkInputs {
    nodes: Vec<NodeId>,
    objects: Vec<PathBuf>,
    stale: bool,
}

fn link_inputs(
    deps: &[Rc<dyn Target>],
    file_deps: &[PathBuf],
    output: &std::path::Path,
    plan: &mut PlanCtx<'_>,
) -> Result<Option<LinkInputs>> {
    let mut nodes = Vec::new();
    for dep in deps {
        if let Some(node) = plan.build_target(dep)? {
            nodes.push(node);
        }
    }
    let objects: Vec<PathBuf> = deps.iter().map(|dep| dep.output(plan.layout)).collect();
    if objects.is_empty() {
        return Ok(None);
    }
    let stale = plan.needs_update(output, objects.iter().chain(file_deps))?;
    Ok(Some(LinkInputs { nodes, objects, stale }))
}

/// An executable linked from every object of its builder plus the library
/// artifacts of its exports.
pub struct ExeTarget {
    file_name: String,
    deps: RefCell<Vec<Rc<dyn Target>>>,
    file_deps: RefCell<Vec<PathBuf>>,
}

impl ExeTarget {
    pub fn new(name: &str) -> Self {
        Self {
            file_name: format!("{}{}", name, utils::EXE_SUFFIX),
            deps: RefCell::new(Vec::new()),
            file_deps: RefCell::new(Vec::new()),
        }
    }

    pub fn depend_on(&self, target: Rc<dyn Target>) {
        self.deps.borrow_mut().push(target);
    }

    pub fn depend_on_file(&self, path: PathBuf) {
        self.file_deps.borrow_mut().push(path);
    }
}

impl fmt::Debug for ExeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExeTarget").field("output", &self.file_name).finish()
    }
}

impl Target for ExeTarget {
    fn output(&self, layout: &OutputLayout) -> PathBuf {
        layout.out_dir().join(&self.file_name)
    }

    fn build(&self, plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>> {
        let output = self.output(plan.layout);
        let deps = self.deps.borrow().clone();
        let Some(inputs) = link_inputs(&deps, &*self.file_deps.borrow(), &output, plan)? else {
            return Ok(None);
        };
        if !inputs.stale {
            return Ok(None);
        }
        Ok(Some(plan.link(inputs.objects, output, inputs.nodes)))
    }
}

/// A static library archived from the objects of its builder.
///
/// Carries the owning builder's options (and, for external exports, its
/// context) so its subtree plans under them no matter which builder pulls
/// it in.
pub struct ArchiveTarget {
    file_name: String,
    deps: RefCell<Vec<Rc<dyn Target>>>,
    file_deps: RefCell<Vec<PathBuf>>,
    opts: CompilerOptions,
    layout: Option<OutputLayout>,
}

impl ArchiveTarget {
    pub fn new(name: &str, opts: CompilerOptions, layout: Option<OutputLayout>) -> Self {
        Self {
            file_name: format!("lib{name}.a"),
            deps: RefCell::new(Vec::new()),
            file_deps: RefCell::new(Vec::new()),
            opts,
            layout,
        }
    }

    pub fn depend_on(&self, target: Rc<dyn Target>) {
        self.deps.borrow_mut().push(target);
    }

    pub fn depend_on_file(&self, path: PathBuf) {
        self.file_deps.borrow_mut().push(path);
    }
}

impl fmt::Debug for ArchiveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveTarget").field("output", &self.file_name).finish()
    }
}

impl Target for ArchiveTarget {
    fn output(&self, layout: &OutputLayout) -> PathBuf {
        self.layout.as_ref().unwrap_or(layout).out_dir().join(&self.file_name)
    }

    fn build(&self, plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>> {
        plan.scoped(self.layout.as_ref(), Some(&self.opts), |child| {
            let output = self.output(child.layout);
            let deps = self.deps.borrow().clone();
            let Some(inputs) = link_inputs(&deps, &*self.file_deps.borrow(), &output, child)?
            else {
                return Ok(None);
            };
            if !inputs.stale {
                return Ok(None);
            }
            Ok(Some(child.archive(inputs.objects, output, inputs.nodes)))
        })
    }
}

/// A shared library linked from the objects of its builder.
pub struct SharedLibTarget {
    file_name: String,
    deps: RefCell<Vec<Rc<dyn Target>>>,
    file_deps: RefCell<Vec<PathBuf>>,
    opts: CompilerOptions,
    layout: Option<OutputLayout>,
}

impl SharedLibTarget {
    pub fn new(name: &str, opts: CompilerOptions, layout: Option<OutputLayout>) -> Self {
        Self {
            file_name: format!(
                "{}{}{}",
                utils::SHARED_LIB_PREFIX,
                name,
                utils::SHARED_LIB_SUFFIX
            ),
            deps: RefCell::new(Vec::new()),
            file_deps: RefCell::new(Vec::new()),
            opts,
            layout,
        }
    }

    pub fn depend_on(&self, target: Rc<dyn Target>) {
        self.deps.borrow_mut().push(target);
    }

    pub fn depend_on_file(&self, path: PathBuf) {
        self.file_deps.borrow_mut().push(path);
    }
}

impl fmt::Debug for SharedLibTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLibTarget").field("output", &self.file_name).finish()
    }
}

impl Target for SharedLibTarget {
    fn output(&self, layout: &OutputLayout) -> PathBuf {
        self.layout.as_ref().unwrap_or(layout).out_dir().join(&self.file_name)
    }

    fn build(&self, plan: &mut PlanCtx<'_>) -> Result<Option<NodeId>> {
        plan.scoped(self.layout.as_ref(), Some(&self.opts), |child| {
            let output = self.output(child.layout);
            let deps = self.deps.borrow().clone();
            let Some(inputs) = link_inputs(&deps, &*self.file_deps.borrow(), &output, child)?
            else {
                return Ok(None);
            };
            if !inputs.stale {
                return Ok(None);
            }
            Ok(Some(child.shared_link(inputs.objects, output, inputs.nodes)))
        })
    }
}
