//! The `project.json` description and the package layer on top of it.
//!
//! A project names its runtime packages, a dev section describing how to
//! compile its build script, and optionally a `usage` telling downstream
//! projects how to consume it: either prebuilt artifacts (flag fragments,
//! libraries and a directory of bmis) or a custom build script this crate
//! cannot execute itself.

use crate::{
    builder::{BuildResult, LibBuilder},
    compilers::Clang,
    config::Context,
    error::{BuildError, Result},
    export::{Export, ExportSet, UsageExport},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

/// File name a project is described by.
pub const PROJECT_FILE: &str = "project.json";

/// Environment variable naming the default packages root.
pub const PACKAGES_ROOT_ENV: &str = "MODBUILD_PACKAGES";

/// Top-level contents of a `project.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDesc {
    pub name: String,
    /// Runtime dependencies, resolved against the packages root.
    #[serde(default)]
    pub packages: Vec<PackageRef>,
    #[serde(default)]
    pub dev: DevSection,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ProjectDesc {
    /// Reads the description at `path`, which may be the json file itself or
    /// the directory containing it. Returns the description and the project
    /// directory.
    pub fn read(path: impl AsRef<Path>) -> Result<(Self, PathBuf)> {
        let json = project_json_path(path.as_ref())?;
        let desc: Self = utils::read_json_file(&json)
            .map_err(|err| BuildError::Config(format!("{}: {err}", json.display())))?;
        let dir = json
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BuildError::Config(format!("{} has no parent", json.display())))?;
        Ok((desc, dir))
    }
}

/// Canonical path of the `project.json` for a package path.
pub fn project_json_path(path: &Path) -> Result<PathBuf> {
    let path = utils::canonicalize(path)?;
    Ok(if path.is_dir() { path.join(PROJECT_FILE) } else { path })
}

/// Reference to a dependency package: a name looked up under the packages
/// root, or an explicit path.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum PackageRef {
    Name(String),
    Path { path: PathBuf },
}

impl PackageRef {
    /// Resolves the reference to a package directory.
    pub fn resolve(&self, project_dir: &Path, packages_root: &Path) -> PathBuf {
        match self {
            PackageRef::Name(name) => packages_root.join(name),
            PackageRef::Path { path } => {
                if path.is_absolute() {
                    path.clone()
                } else {
                    project_dir.join(path)
                }
            }
        }
    }
}

/// The dev-only section: how the project's build script is compiled.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevSection {
    pub build_file: BuildFiles,
    pub compiler: String,
    pub debug: bool,
    pub packages: Vec<PackageRef>,
}

impl Default for DevSection {
    fn default() -> Self {
        Self {
            build_file: BuildFiles::One(PathBuf::from("build.cpp")),
            compiler: "clang++".to_string(),
            debug: false,
            packages: Vec::new(),
        }
    }
}

/// One or several build script sources.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum BuildFiles {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl BuildFiles {
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            BuildFiles::One(path) => vec![path.clone()],
            BuildFiles::Many(paths) => paths.clone(),
        }
    }
}

/// How downstream projects consume this one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Usage {
    /// A custom build script produces the export; executing it is the
    /// loader's business, not this crate's.
    Script(PathBuf),
    Scripts(Vec<PathBuf>),
    Desc(UsageDesc),
}

/// Prebuilt usage: flag fragments, libraries and a bmi directory.
///
/// Templated strings may reference the package's own project directory via
/// `{}` or `{0}` placeholders.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageDesc {
    pub pcm_path: Option<String>,
    pub compile_option: String,
    pub link_option: String,
    pub libs: Vec<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl UsageDesc {
    /// Whether this usage describes prebuilt artifacts (as opposed to a
    /// custom script).
    pub fn is_prebuilt(&self) -> bool {
        !matches!(self.kind.as_deref(), Some("custom"))
    }

    /// Instantiates the export, expanding template placeholders against the
    /// package's project directory.
    pub fn to_export(&self, project_dir: &Path) -> UsageExport {
        UsageExport::new(
            expand_template(&self.compile_option, project_dir),
            expand_template(&self.link_option, project_dir),
            self.libs.clone(),
            self.pcm_path
                .as_ref()
                .map(|path| PathBuf::from(expand_template(path, project_dir))),
        )
    }
}

static TEMPLATE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{0?\}").unwrap());

/// Expands `{}`/`{0}` placeholders to the project directory.
fn expand_template(template: &str, project_dir: &Path) -> String {
    let dir = utils::slashed(project_dir);
    TEMPLATE_PLACEHOLDER.replace_all(template, regex::NoExpand(&dir)).into_owned()
}

/// Loads package descriptions and derives export sets, caching both.
///
/// A package's export set is its own usage export plus the export sets of
/// every package it references, deduplicated, discovered depth-first with
/// cycle detection.
pub struct PackageStore {
    packages_root: PathBuf,
    descs: RefCell<HashMap<PathBuf, Rc<(ProjectDesc, PathBuf)>>>,
    built: RefCell<HashMap<PathBuf, ExportSet>>,
}

impl PackageStore {
    pub fn new(packages_root: impl Into<PathBuf>) -> Self {
        Self {
            packages_root: packages_root.into(),
            descs: RefCell::new(HashMap::new()),
            built: RefCell::new(HashMap::new()),
        }
    }

    pub fn packages_root(&self) -> &Path {
        &self.packages_root
    }

    /// Resolves a package reference against the packages root.
    pub fn resolve(&self, package: &PackageRef, project_dir: &Path) -> PathBuf {
        package.resolve(project_dir, &self.packages_root)
    }

    fn desc(&self, json: &Path) -> Result<Rc<(ProjectDesc, PathBuf)>> {
        if let Some(cached) = self.descs.borrow().get(json) {
            return Ok(Rc::clone(cached));
        }
        let loaded = Rc::new(ProjectDesc::read(json)?);
        self.descs.borrow_mut().insert(json.to_path_buf(), Rc::clone(&loaded));
        Ok(loaded)
    }

    /// The export set of the package at `path`.
    pub fn exports(&self, path: &Path) -> Result<ExportSet> {
        let mut visiting = Vec::new();
        self.exports_inner(path, &mut visiting)
    }

    fn exports_inner(&self, path: &Path, visiting: &mut Vec<PathBuf>) -> Result<ExportSet> {
        let json = project_json_path(path)?;
        if let Some(cached) = self.built.borrow().get(&json).cloned() {
            return Ok(cached);
        }
        if visiting.contains(&json) {
            let mut chain = visiting.clone();
            chain.push(json);
            return Err(BuildError::CyclicPackageDependency(chain));
        }
        visiting.push(json.clone());

        let entry = self.desc(&json)?;
        let (desc, project_dir) = &*entry;
        trace!(package = %desc.name, "collecting exports");

        let export: Rc<dyn Export> = match &desc.usage {
            Some(Usage::Desc(usage)) if usage.is_prebuilt() => {
                Rc::new(usage.to_export(project_dir))
            }
            // custom scripts need the loader to run them first
            _ => return Err(BuildError::PackageNotBuilt(desc.name.clone())),
        };

        let mut set: ExportSet = vec![export];
        for package in &desc.packages {
            let dep_path = self.resolve(package, project_dir);
            for dep in self.exports_inner(&dep_path, visiting)? {
                if !set.iter().any(|existing| Rc::ptr_eq(existing, &dep)) {
                    set.push(dep);
                }
            }
        }

        visiting.pop();
        self.built.borrow_mut().insert(json, set.clone());
        Ok(set)
    }
}

/// Compiles a project's build script into a loadable shared library.
///
/// This is everything the core does for the meta layer: the produced
/// artifact exports the `build` entry point, and actually loading it is the
/// host's business.
pub struct ScriptProject {
    ctx: Context,
    builder: LibBuilder,
    package_exports: Vec<(String, ExportSet)>,
}

impl std::fmt::Debug for ScriptProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptProject").finish_non_exhaustive()
    }
}

/// Host-side knobs for [`ScriptProject`], usually taken from the CLI.
#[derive(Debug, Default)]
pub struct ScriptConfig {
    /// Overrides the output root (default `<project>/.build`).
    pub output: Option<PathBuf>,
    /// The packages root directory.
    pub packages_root: PathBuf,
    /// Overrides the compiler named by the dev section.
    pub compiler: Option<String>,
    /// Forces debug info regardless of the dev section.
    pub debug: bool,
}

impl ScriptProject {
    pub fn new(path: impl AsRef<Path>, config: ScriptConfig) -> Result<Self> {
        let (desc, project_dir) = ProjectDesc::read(path.as_ref())?;
        let store = PackageStore::new(&config.packages_root);

        let output = config.output.unwrap_or_else(|| project_dir.join(".build"));
        let mut ctx = Context::new("build", output)?;
        ctx.set_debug(config.debug || desc.dev.debug);

        let compiler = config.compiler.as_deref().unwrap_or(&desc.dev.compiler);
        let mut clang = Clang::new(compiler);
        clang.option("-march=native -std=c++20 -Wall");
        if cfg!(windows) {
            clang.option("-D _WIN32");
        }

        let mut builder = LibBuilder::new(desc.name.clone());
        builder.set_shared(true);
        builder.set_driver(Arc::new(clang));
        for file in desc.dev.build_file.paths() {
            let file = if file.is_absolute() { file } else { project_dir.join(file) };
            builder.add_src(file);
        }

        // dev packages feed the script compile itself
        for package in &desc.dev.packages {
            for export in store.exports(&store.resolve(package, &project_dir))? {
                builder.depend(export);
            }
        }

        // runtime packages are resolved eagerly so a broken reference fails
        // before any compile runs; the loaded script consumes them later
        let mut package_exports = Vec::new();
        for package in &desc.packages {
            let dep_path = store.resolve(package, &project_dir);
            let entry = store.desc(&project_json_path(&dep_path)?)?;
            let name = entry.0.name.clone();
            package_exports.push((name, store.exports(&dep_path)?));
        }

        Ok(Self { ctx, builder, package_exports })
    }

    /// The expected script artifact path.
    pub fn output(&self) -> PathBuf {
        self.builder.output(self.ctx.layout())
    }

    /// Compiles the build script shared library.
    pub fn build(&self) -> Result<BuildResult> {
        self.builder.build(&self.ctx)
    }

    /// The export sets of the project's runtime packages, by package name.
    pub fn package_exports(&self) -> &[(String, ExportSet)] {
        &self.package_exports
    }

    /// Emits the compilation database for the script sources.
    pub fn write_compile_commands(&self) -> Result<PathBuf> {
        self.builder.write_compile_commands(self.ctx.layout())
    }

    /// Removes the script build directory.
    pub fn clean(&self) -> Result<()> {
        self.ctx.clean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn parses_full_description() {
        let json = r#"{
            "name": "app",
            "packages": ["glob", {"path": "../vendored/fmt"}],
            "dev": {
                "buildFile": ["build.cpp", "extra.cpp"],
                "compiler": "clang++-18",
                "debug": true,
                "packages": ["make-dot-cpp"]
            },
            "usage": {
                "pcmPath": "{}/output/module",
                "compileOption": "-I {0}/include",
                "libs": ["app"]
            }
        }"#;
        let desc: ProjectDesc = serde_json::from_str(json).unwrap();
        assert_eq!(desc.name, "app");
        assert_eq!(desc.packages.len(), 2);
        assert!(matches!(&desc.packages[0], PackageRef::Name(name) if name == "glob"));
        assert!(matches!(&desc.packages[1], PackageRef::Path { .. }));
        assert_eq!(desc.dev.compiler, "clang++-18");
        assert!(desc.dev.debug);
        assert_eq!(desc.dev.build_file.paths().len(), 2);
        let Some(Usage::Desc(usage)) = &desc.usage else { panic!("expected usage desc") };
        assert!(usage.is_prebuilt());
        assert_eq!(usage.libs, vec!["app".to_string()]);
    }

    #[test]
    fn dev_section_defaults_apply() {
        let desc: ProjectDesc = serde_json::from_str(r#"{"name": "bare"}"#).unwrap();
        assert_eq!(desc.dev.compiler, "clang++");
        assert!(!desc.dev.debug);
        assert_eq!(desc.dev.build_file.paths(), vec![PathBuf::from("build.cpp")]);
        assert!(desc.usage.is_none());
    }

    #[test]
    fn usage_script_variants_parse() {
        let one: Usage = serde_json::from_str(r#""usage.cpp""#).unwrap();
        assert!(matches!(one, Usage::Script(_)));
        let many: Usage = serde_json::from_str(r#"["a.cpp", "b.cpp"]"#).unwrap();
        assert!(matches!(many, Usage::Scripts(paths) if paths.len() == 2));
        let custom: Usage = serde_json::from_str(r#"{"type": "custom"}"#).unwrap();
        assert!(matches!(&custom, Usage::Desc(desc) if !desc.is_prebuilt()));
    }

    #[test]
    fn template_placeholders_expand_to_project_dir() {
        let dir = Path::new("/pkgs/fmt");
        assert_eq!(expand_template("-I {}/include", dir), "-I /pkgs/fmt/include");
        assert_eq!(expand_template("{0}/lib/libfmt.a", dir), "/pkgs/fmt/lib/libfmt.a");
        assert_eq!(expand_template("-lfmt", dir), "-lfmt");
    }

    fn write_package(dir: &Path, name: &str, packages: &[&str]) {
        fs::create_dir_all(dir.join(name)).unwrap();
        let packages_json: Vec<String> =
            packages.iter().map(|p| format!("\"{p}\"")).collect();
        fs::write(
            dir.join(name).join(PROJECT_FILE),
            format!(
                r#"{{
                    "name": "{name}",
                    "packages": [{}],
                    "usage": {{"compileOption": "-I {{}}/include"}}
                }}"#,
                packages_json.join(", ")
            ),
        )
        .unwrap();
    }

    #[test]
    fn package_exports_union_transitively() {
        let root = tempfile::tempdir().unwrap();
        write_package(root.path(), "a", &["b"]);
        write_package(root.path(), "b", &["c"]);
        write_package(root.path(), "c", &[]);

        let store = PackageStore::new(root.path());
        let exports = store.exports(&root.path().join("a")).unwrap();
        assert_eq!(exports.len(), 3);

        // cached set is reused
        let again = store.exports(&root.path().join("a")).unwrap();
        assert!(Rc::ptr_eq(&exports[0], &again[0]));
    }

    #[test]
    fn cyclic_packages_are_detected() {
        let root = tempfile::tempdir().unwrap();
        write_package(root.path(), "x", &["y"]);
        write_package(root.path(), "y", &["x"]);

        let store = PackageStore::new(root.path());
        let err = store.exports(&root.path().join("x")).unwrap_err();
        assert!(matches!(err, BuildError::CyclicPackageDependency(_)));
    }

    #[test]
    fn package_without_usage_is_not_built() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("p")).unwrap();
        fs::write(root.path().join("p").join(PROJECT_FILE), r#"{"name": "p"}"#).unwrap();

        let store = PackageStore::new(root.path());
        let err = store.exports(&root.path().join("p")).unwrap_err();
        assert!(matches!(err, BuildError::PackageNotBuilt(name) if name == "p"));
    }
}
