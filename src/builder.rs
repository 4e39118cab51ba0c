//! Turns a source set plus a set of dependency exports into a buildable
//! root target.
//!
//! [`Builder`] carries the shared configuration; [`ExeBuilder`] and
//! [`LibBuilder`] put an executable or library root on top of the object
//! targets it derives from the scanned units.

use crate::{
    cache::{Unit, UnitCache},
    compilers::{Clang, Driver},
    config::{Context, OutputLayout},
    error::{BuildError, Result},
    export::{Export, ExportSet, ExternalExport, LibExport},
    graph::FutureList,
    plan::{CompilerOptions, PlanCtx, PlanState},
    targets::{
        ArchiveTarget, BmiTarget, ExeTarget, ModuleTarget, ObjectTarget, SharedLibTarget, Target,
    },
    utils,
};
use serde::Serialize;
use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap},
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

/// File name of the compile-option fingerprint within a builder's cache
/// directory.
pub const COMPILE_OPTIONS_FILE: &str = "compileOptions.txt";
/// File name of the link-option fingerprint.
pub const LINK_OPTIONS_FILE: &str = "linkOptions.txt";

/// The outcome of planning and posting one builder's actions.
///
/// The output path is deterministic; whether anything actually runs depends
/// on staleness. `get` blocks until every planned action finished.
pub struct BuildResult {
    pub output: PathBuf,
    pub futures: FutureList,
}

impl std::fmt::Debug for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildResult").field("output", &self.output).finish_non_exhaustive()
    }
}

impl BuildResult {
    /// Blocks until all planned actions finished or were terminated.
    pub fn wait(&self) {
        self.futures.wait();
    }

    /// Blocks and returns the output path, re-raising the first error.
    pub fn get(self) -> Result<PathBuf> {
        self.futures.get()?;
        Ok(self.output)
    }
}

/// Shared configuration of one buildable thing: name, sources, include
/// paths, definitions and dependency exports.
pub struct Builder {
    name: String,
    driver: Arc<dyn Driver>,
    sources: Vec<PathBuf>,
    exports: ExportSet,
    own_opts: CompilerOptions,
}

impl Builder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: Arc::new(Clang::default()),
            sources: Vec::new(),
            exports: Vec::new(),
            own_opts: CompilerOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn set_driver(&mut self, driver: Arc<dyn Driver>) -> &mut Self {
        self.driver = driver;
        self
    }

    /// Adds a single source file.
    pub fn add_src(&mut self, src: impl Into<PathBuf>) -> &mut Self {
        self.sources.push(src.into());
        self
    }

    /// Adds every source matching the glob pattern.
    pub fn add_src_glob(&mut self, pattern: &str) -> Result<&mut Self> {
        for entry in glob::glob(pattern).map_err(BuildError::msg)? {
            self.sources.push(entry.map_err(BuildError::msg)?);
        }
        Ok(self)
    }

    /// Adds every source found under the directory.
    pub fn add_src_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.sources.extend(utils::source_files(dir));
        self
    }

    /// Adds an include directory to the compile options.
    pub fn include(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.own_opts.push_compile(&format!("-I {}", utils::slashed(dir.as_ref())));
        self
    }

    /// Adds a preprocessor definition to the compile options.
    pub fn define(&mut self, definition: &str) -> &mut Self {
        self.own_opts.push_compile(&format!("-D {definition}"));
        self
    }

    pub fn compile_option(&mut self, fragment: &str) -> &mut Self {
        self.own_opts.push_compile(fragment);
        self
    }

    pub fn link_option(&mut self, fragment: &str) -> &mut Self {
        self.own_opts.push_link(fragment);
        self
    }

    /// Depends on an upstream export. Module resolution consults exports in
    /// the order they were added.
    pub fn depend(&mut self, export: Rc<dyn Export>) -> &mut Self {
        self.exports.push(export);
        self
    }

    /// The options this builder compiles and links with: fragments of every
    /// export first, then the builder's own.
    pub fn compiler_options(&self) -> CompilerOptions {
        let mut opts = CompilerOptions::default();
        for export in &self.exports {
            opts.push_compile(&export.compile_option());
            opts.push_link(&export.link_option());
        }
        opts.push_compile(&self.own_opts.compile);
        opts.push_link(&self.own_opts.link);
        opts
    }

    /// The deduplicated, canonicalized source set, in deterministic order.
    fn input_set(&self) -> Result<BTreeSet<PathBuf>> {
        self.sources.iter().map(utils::canonicalize).collect()
    }

    /// Writes both option fingerprints, touching them only on change, and
    /// returns their paths.
    fn write_fingerprints(&self, layout: &OutputLayout) -> Result<(PathBuf, PathBuf)> {
        let cache_dir = layout.cache_dir(&self.name);
        let opts = self.compiler_options();
        let compile = cache_dir.join(COMPILE_OPTIONS_FILE);
        let link = cache_dir.join(LINK_OPTIONS_FILE);
        utils::write_if_changed(&compile, &opts.compile)?;
        utils::write_if_changed(&link, &opts.link)?;
        Ok((compile, link))
    }

    /// Scans (or loads) the unit of every input.
    fn units(&self, layout: &OutputLayout, compile_fingerprint: &Path) -> Result<Vec<Unit>> {
        let opts = self.compiler_options();
        let cache = UnitCache::new(
            layout.cache_dir(&self.name),
            compile_fingerprint,
            &*self.driver,
            &opts.compile,
        );
        self.input_set()?.iter().map(|input| cache.unit(input)).collect()
    }

    /// Builds the object (and bmi) targets of every unit and resolves all
    /// module imports.
    ///
    /// Returns the objects plus the index of locally exported modules.
    fn build_objects(
        &self,
        layout: &OutputLayout,
        compile_fingerprint: &Path,
    ) -> Result<(Vec<Rc<ObjectTarget>>, HashMap<String, Rc<dyn ModuleTarget>>)> {
        let units = self.units(layout, compile_fingerprint)?;
        let base = std::env::current_dir().map_err(|err| BuildError::io(err, "."))?;

        let mut objects = Vec::with_capacity(units.len());
        let mut local: HashMap<String, Rc<dyn ModuleTarget>> = HashMap::new();
        let mut providers: HashMap<String, PathBuf> = HashMap::new();

        for unit in &units {
            let mut rel = utils::rel_source_path(&unit.input, &base).into_os_string();
            rel.push(".obj");
            let rel: PathBuf = rel.into();

            let object = if unit.exported {
                let bmi = Rc::new(BmiTarget::new(
                    &unit.module_name,
                    unit.input.clone(),
                    unit.include_deps.clone(),
                ));
                if let Some(first) = providers.insert(unit.module_name.clone(), unit.input.clone())
                {
                    return Err(BuildError::DuplicateModule {
                        name: unit.module_name.clone(),
                        first,
                        second: unit.input.clone(),
                    });
                }
                local.insert(unit.module_name.clone(), Rc::clone(&bmi) as _);
                Rc::new(ObjectTarget::module_interface(bmi, rel))
            } else {
                Rc::new(ObjectTarget::classical(
                    unit.input.clone(),
                    unit.include_deps.clone(),
                    rel,
                ))
            };
            object.depend_on_file(compile_fingerprint.to_path_buf());
            objects.push(object);
        }

        // resolve imports: local modules first, then exports in the order
        // they were depended on
        let mut resolved = local.clone();
        for (object, unit) in objects.iter().zip(&units) {
            for dep in &unit.module_deps {
                let target = match resolved.get(dep) {
                    Some(target) => Rc::clone(target),
                    None => {
                        let found = self
                            .exports
                            .iter()
                            .find_map(|export| export.find_bmi(dep));
                        let Some(target) = found else {
                            return Err(BuildError::ModuleNotFound {
                                importer: unit.input.clone(),
                                name: dep.clone(),
                            });
                        };
                        resolved.insert(dep.clone(), Rc::clone(&target));
                        target
                    }
                };
                object.depend_on_module(target);
            }
        }

        Ok((objects, local))
    }

    /// Library artifacts advertised by the exports, in order.
    fn export_lib_targets(&self) -> Vec<Rc<dyn Target>> {
        self.exports.iter().filter_map(|export| export.library_target()).collect()
    }

    /// Emits `compile_commands.json` for this builder's inputs.
    pub fn write_compile_commands(&self, layout: &OutputLayout) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct CompileCommand {
            directory: String,
            command: String,
            file: String,
            output: String,
        }

        let opts = self.compiler_options();
        let base = std::env::current_dir().map_err(|err| BuildError::io(err, "."))?;
        let commands: Vec<CompileCommand> = self
            .input_set()?
            .iter()
            .map(|input| {
                let mut rel = utils::rel_source_path(input, &base).into_os_string();
                rel.push(".obj");
                let output = layout.obj_path().join(PathBuf::from(rel));
                CompileCommand {
                    directory: utils::slashed(&layout.out_dir()),
                    command: self.driver.compile_command(
                        input,
                        &output,
                        layout.debug,
                        &Default::default(),
                        &opts.compile,
                    ),
                    file: utils::slashed(input),
                    output: utils::slashed(&output),
                }
            })
            .collect();

        let path = layout.compile_commands_path();
        utils::write_json_file(&commands, &path)?;
        Ok(path)
    }

    /// Plans the root target into the context's graph and posts ready work.
    fn run_root(&self, ctx: &Context, root: &Rc<dyn Target>) -> Result<BuildResult> {
        let opts = self.compiler_options();
        let mut state = PlanState::new(ctx.graph.clone());
        {
            let mut plan = PlanCtx::new(ctx.layout(), &self.driver, &opts, &mut state);
            plan.build_target(root)?;
        }
        ctx.run();
        Ok(BuildResult { output: root.output(ctx.layout()), futures: state.futures })
    }
}

/// Builds an executable from the configured sources and exports.
pub struct ExeBuilder {
    builder: Builder,
}

impl ExeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { builder: Builder::new(name) }
    }

    /// The expected output path, before building.
    pub fn output(&self, layout: &OutputLayout) -> PathBuf {
        layout.out_dir().join(format!("{}{}", self.builder.name, utils::EXE_SUFFIX))
    }

    /// Plans the executable and posts all stale actions.
    pub fn build(&self, ctx: &Context) -> Result<BuildResult> {
        ctx.ensure_out_dir()?;
        let (compile_fp, link_fp) = self.builder.write_fingerprints(ctx.layout())?;
        let (objects, _) = self.builder.build_objects(ctx.layout(), &compile_fp)?;

        let root = Rc::new(ExeTarget::new(&self.builder.name));
        for object in objects {
            root.depend_on(object as Rc<dyn Target>);
        }
        for lib in self.builder.export_lib_targets() {
            root.depend_on(lib);
        }
        root.depend_on_file(link_fp);

        self.builder.run_root(ctx, &(root as Rc<dyn Target>))
    }
}

impl Deref for ExeBuilder {
    type Target = Builder;

    fn deref(&self) -> &Builder {
        &self.builder
    }
}

impl DerefMut for ExeBuilder {
    fn deref_mut(&mut self) -> &mut Builder {
        &mut self.builder
    }
}

/// Builds a static archive or shared library and can export it to
/// downstream builders.
pub struct LibBuilder {
    builder: Builder,
    shared: bool,
    /// Exports by layout; `get_export` is idempotent per context.
    exports_cache: RefCell<Vec<(OutputLayout, Rc<dyn Export>)>>,
}

impl LibBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { builder: Builder::new(name), shared: false, exports_cache: RefCell::new(Vec::new()) }
    }

    /// Switches between a static archive (default) and a shared library.
    pub fn set_shared(&mut self, shared: bool) -> &mut Self {
        self.shared = shared;
        self
    }

    fn file_name(&self) -> String {
        if self.shared {
            format!(
                "{}{}{}",
                utils::SHARED_LIB_PREFIX,
                self.builder.name,
                utils::SHARED_LIB_SUFFIX
            )
        } else {
            format!("lib{}.a", self.builder.name)
        }
    }

    /// The expected output path, before building.
    pub fn output(&self, layout: &OutputLayout) -> PathBuf {
        layout.out_dir().join(self.file_name())
    }

    /// Assembles the library root and its object tree for the given layout.
    fn make_targets(
        &self,
        layout: &OutputLayout,
        pinned: Option<OutputLayout>,
    ) -> Result<(Rc<dyn Target>, HashMap<String, Rc<dyn ModuleTarget>>)> {
        let (compile_fp, link_fp) = self.builder.write_fingerprints(layout)?;
        let (objects, modules) = self.builder.build_objects(layout, &compile_fp)?;
        let opts = self.builder.compiler_options();

        let root: Rc<dyn Target> = if self.shared {
            let target = Rc::new(SharedLibTarget::new(&self.builder.name, opts, pinned));
            for object in objects {
                target.depend_on(object as Rc<dyn Target>);
            }
            for lib in self.builder.export_lib_targets() {
                target.depend_on(lib);
            }
            target.depend_on_file(link_fp);
            target
        } else {
            let target = Rc::new(ArchiveTarget::new(&self.builder.name, opts, pinned));
            for object in objects {
                target.depend_on(object as Rc<dyn Target>);
            }
            for lib in self.builder.export_lib_targets() {
                target.depend_on(lib);
            }
            target.depend_on_file(link_fp);
            target
        };
        Ok((root, modules))
    }

    /// Plans the library and posts all stale actions.
    pub fn build(&self, ctx: &Context) -> Result<BuildResult> {
        ctx.ensure_out_dir()?;
        let (root, _) = self.make_targets(ctx.layout(), None)?;
        self.builder.run_root(ctx, &root)
    }

    /// The export downstream builders consume. Idempotent: successive calls
    /// for the same context return the same export.
    pub fn get_export(&self, ctx: &Context) -> Result<Rc<dyn Export>> {
        if let Some((_, export)) = self
            .exports_cache
            .borrow()
            .iter()
            .find(|(layout, _)| layout == ctx.layout())
        {
            return Ok(Rc::clone(export));
        }
        let (root, modules) = self.make_targets(ctx.layout(), None)?;
        let export: Rc<dyn Export> = Rc::new(LibExport {
            compile_option: self.builder.own_opts.compile.clone(),
            link_option: self.builder.own_opts.link.clone(),
            modules,
            library: root,
        });
        self.exports_cache.borrow_mut().push((ctx.layout().clone(), Rc::clone(&export)));
        Ok(export)
    }

    /// An export whose targets live under a different output root, for
    /// consumption from another project's context.
    pub fn create_external_export(&self, output_root: impl Into<PathBuf>) -> Result<Rc<dyn Export>> {
        let layout = OutputLayout::new(self.builder.name.clone(), output_root);
        let (root, modules) = self.make_targets(&layout, Some(layout.clone()))?;
        let opts = self.builder.compiler_options();
        let inner = LibExport {
            compile_option: self.builder.own_opts.compile.clone(),
            link_option: self.builder.own_opts.link.clone(),
            modules,
            library: root,
        };
        Ok(Rc::new(ExternalExport::new(inner, layout, opts)))
    }
}

impl Deref for LibBuilder {
    type Target = Builder;

    fn deref(&self) -> &Builder {
        &self.builder
    }
}

impl DerefMut for LibBuilder {
    fn deref_mut(&mut self) -> &mut Builder {
        &mut self.builder
    }
}
