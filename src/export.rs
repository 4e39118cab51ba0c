//! What one builder advertises to downstream builders.
//!
//! An export bundles compile/link flag fragments, a library artifact and a
//! bmi lookup. Local exports hand out direct target refs; external exports
//! (whose targets belong to another context) wrap every module target in a
//! [`TargetProxy`] so outputs resolve in the upstream layout while
//! scheduling happens in the downstream graph.

use crate::{
    config::OutputLayout,
    plan::CompilerOptions,
    targets::{ExternalBmi, ModuleTarget, Target, TargetProxy},
    utils,
};
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    path::PathBuf,
    rc::Rc,
};

/// A planning-time view of what an upstream dependency offers.
pub trait Export: fmt::Debug {
    /// Compile option fragment every dependent compiles with.
    fn compile_option(&self) -> String {
        String::new()
    }

    /// Link option fragment every dependent links with.
    fn link_option(&self) -> String {
        String::new()
    }

    /// Looks up the bmi provider of a module name.
    fn find_bmi(&self, _name: &str) -> Option<Rc<dyn ModuleTarget>> {
        None
    }

    /// The library artifact dependents link against, if any.
    fn library_target(&self) -> Option<Rc<dyn Target>> {
        None
    }
}

/// Exports in the order they were depended on; module resolution consults
/// them in exactly this order.
pub type ExportSet = Vec<Rc<dyn Export>>;

/// The export of a library builder within the same build context.
///
/// Constructed once per context by the builder; `find_bmi` returns direct
/// refs into the library's target graph.
pub struct LibExport {
    pub(crate) compile_option: String,
    pub(crate) link_option: String,
    pub(crate) modules: HashMap<String, Rc<dyn ModuleTarget>>,
    pub(crate) library: Rc<dyn Target>,
}

impl fmt::Debug for LibExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibExport")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("library", &self.library)
            .finish()
    }
}

impl Export for LibExport {
    fn compile_option(&self) -> String {
        self.compile_option.clone()
    }

    fn link_option(&self) -> String {
        self.link_option.clone()
    }

    fn find_bmi(&self, name: &str) -> Option<Rc<dyn ModuleTarget>> {
        self.modules.get(name).cloned()
    }

    fn library_target(&self) -> Option<Rc<dyn Target>> {
        Some(Rc::clone(&self.library))
    }
}

/// A library export whose targets live in a different context.
///
/// Every module target handed out is wrapped in a [`TargetProxy`] carrying
/// the upstream layout and options; proxies are cached by identity of the
/// inner target so repeated lookups share one plan.
pub struct ExternalExport {
    inner: LibExport,
    layout: OutputLayout,
    opts: CompilerOptions,
    proxies: RefCell<HashMap<usize, Rc<TargetProxy>>>,
}

impl ExternalExport {
    pub(crate) fn new(inner: LibExport, layout: OutputLayout, opts: CompilerOptions) -> Self {
        Self { inner, layout, opts, proxies: RefCell::new(HashMap::new()) }
    }

    fn proxy(&self, target: Rc<dyn ModuleTarget>) -> Rc<TargetProxy> {
        let key = Rc::as_ptr(&target) as *const () as usize;
        Rc::clone(self.proxies.borrow_mut().entry(key).or_insert_with(|| {
            Rc::new(TargetProxy::new(target, self.layout.clone(), self.opts.clone()))
        }))
    }
}

impl fmt::Debug for ExternalExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalExport")
            .field("layout", &self.layout)
            .field("inner", &self.inner)
            .finish()
    }
}

impl Export for ExternalExport {
    fn compile_option(&self) -> String {
        self.inner.compile_option()
    }

    fn link_option(&self) -> String {
        self.inner.link_option()
    }

    fn find_bmi(&self, name: &str) -> Option<Rc<dyn ModuleTarget>> {
        let target = self.inner.find_bmi(name)?;
        Some(self.proxy(target))
    }

    fn library_target(&self) -> Option<Rc<dyn Target>> {
        // the library target already carries the external layout
        self.inner.library_target()
    }
}

/// An export described by a package's `usage` entry: flag fragments, `-l`
/// libraries and a directory of prebuilt bmis.
pub struct UsageExport {
    compile_option: String,
    link_option: String,
    libs: Vec<String>,
    pcm_path: Option<PathBuf>,
    /// Probed bmis by module name.
    cache: RefCell<HashMap<String, Option<Rc<ExternalBmi>>>>,
}

impl UsageExport {
    pub fn new(
        compile_option: String,
        link_option: String,
        libs: Vec<String>,
        pcm_path: Option<PathBuf>,
    ) -> Self {
        Self { compile_option, link_option, libs, pcm_path, cache: RefCell::new(HashMap::new()) }
    }
}

impl fmt::Debug for UsageExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageExport")
            .field("compile_option", &self.compile_option)
            .field("link_option", &self.link_option)
            .field("libs", &self.libs)
            .field("pcm_path", &self.pcm_path)
            .finish()
    }
}

impl Export for UsageExport {
    fn compile_option(&self) -> String {
        self.compile_option.clone()
    }

    fn link_option(&self) -> String {
        let mut option = self.link_option.clone();
        for lib in &self.libs {
            if !option.is_empty() {
                option.push(' ');
            }
            option.push_str("-l");
            option.push_str(lib);
        }
        option
    }

    fn find_bmi(&self, name: &str) -> Option<Rc<dyn ModuleTarget>> {
        let pcm_path = self.pcm_path.as_ref()?;
        let mut cache = self.cache.borrow_mut();
        let entry = cache.entry(name.to_string()).or_insert_with(|| {
            let path = pcm_path.join(format!("{}.pcm", utils::sanitize_module_name(name)));
            path.exists().then(|| Rc::new(ExternalBmi::new(name, path)))
        });
        entry.clone().map(|bmi| bmi as Rc<dyn ModuleTarget>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn usage_export_appends_libs_to_link_option() {
        let export = UsageExport::new(
            "-I /pkg/include".to_string(),
            "-L /pkg/lib".to_string(),
            vec!["m".to_string(), "pthread".to_string()],
            None,
        );
        assert_eq!(export.link_option(), "-L /pkg/lib -lm -lpthread");
        assert!(export.find_bmi("anything").is_none());
    }

    #[test]
    fn usage_export_probes_pcm_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("p.pcm"), "bmi").unwrap();
        fs::write(dir.path().join("p-part.pcm"), "bmi").unwrap();

        let export = UsageExport::new(
            String::new(),
            String::new(),
            Vec::new(),
            Some(dir.path().to_path_buf()),
        );
        let layout = crate::config::OutputLayout::new("down", "/tmp/down-out");

        let bmi = export.find_bmi("p").expect("p.pcm exists");
        assert_eq!(bmi.module_name(), "p");
        assert_eq!(bmi.output(&layout), dir.path().join("p.pcm"));

        // partition names are sanitized on disk but keep their logical name
        let part = export.find_bmi("p:part").expect("p-part.pcm exists");
        assert_eq!(part.module_name(), "p:part");
        assert_eq!(part.output(&layout), dir.path().join("p-part.pcm"));

        assert!(export.find_bmi("q").is_none());
    }
}
