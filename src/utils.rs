//! Utility functions

use crate::error::{BuildError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};
use walkdir::WalkDir;

/// Extensions acceptable as translation units of a module project.
pub const SOURCE_EXTENSIONS: &[&str] = &["cpp", "cc", "cxx", "ixx", "cppm", "mpp"];

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        /// Suffix appended to executable outputs.
        pub const EXE_SUFFIX: &str = ".exe";
        /// Prefix of shared library outputs.
        pub const SHARED_LIB_PREFIX: &str = "";
        /// Suffix of shared library outputs.
        pub const SHARED_LIB_SUFFIX: &str = ".dll";
    } else if #[cfg(target_os = "macos")] {
        pub const EXE_SUFFIX: &str = "";
        pub const SHARED_LIB_PREFIX: &str = "lib";
        pub const SHARED_LIB_SUFFIX: &str = ".dylib";
    } else {
        pub const EXE_SUFFIX: &str = "";
        pub const SHARED_LIB_PREFIX: &str = "lib";
        pub const SHARED_LIB_SUFFIX: &str = ".so";
    }
}

/// Canonicalize the path, returning an error annotated with the path itself.
///
/// On windows this transforms the path into a non-UNC path.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| BuildError::io(err, path))
}

/// Returns the same path but canonicalized if possible, leaving it untouched
/// when canonicalization fails (e.g. the file does not exist yet).
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Creates the parent directory of the given file path, recursively.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
    }
    Ok(())
}

/// Reads and deserializes the json file at the given path.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| BuildError::io(err, path))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Serializes the value as pretty json and writes it to the given path,
/// creating parent directories as needed.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let file = fs::File::create(path).map_err(|err| BuildError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| BuildError::io(err, path))?;
    Ok(())
}

/// Returns the modification time of the file at the given path.
pub fn mtime(path: impl AsRef<Path>) -> Result<SystemTime> {
    let path = path.as_ref();
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|err| BuildError::io(err, path))
}

/// Writes `content` to `path` only when the file is missing or its current
/// content differs.
///
/// Returns `true` if the file was (re)written. Leaving an unchanged file
/// untouched preserves its mtime, which is what makes option fingerprints
/// usable as staleness inputs.
pub fn write_if_changed(path: impl AsRef<Path>, content: &str) -> Result<bool> {
    let path = path.as_ref();
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == content {
            return Ok(false);
        }
    }
    create_parent_dir_all(path)?;
    fs::write(path, content).map_err(|err| BuildError::io(err, path))?;
    Ok(true)
}

/// Returns all source files under the given directory that carry one of the
/// [`SOURCE_EXTENSIONS`].
pub fn source_files(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| SOURCE_EXTENSIONS.iter().any(|e| *e == ext))
                .unwrap_or_default()
        })
        .map(|e| e.path().into())
        .collect()
}

/// Expresses `path` relative to the longest prefix it shares with `base`.
///
/// This is the identifier used for objects and unit sidecars: two absolute
/// source paths never collide under it, and sources inside the project tree
/// get their natural project-relative name.
pub fn rel_source_path(path: &Path, base: &Path) -> PathBuf {
    let mut path_components = path.components().peekable();
    let mut base_components = base.components();
    while let (Some(p), Some(b)) = (path_components.peek().copied(), base_components.next()) {
        if p != b {
            break;
        }
        path_components.next();
    }
    let rel: PathBuf = path_components
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    if rel.as_os_str().is_empty() {
        path.file_name().map(PathBuf::from).unwrap_or_default()
    } else {
        rel
    }
}

/// Sanitizes a module name for use as a file stem.
///
/// Module partition names contain `:` which is not a legal path character
/// everywhere, so `m:part` maps to the file stem `m-part`. The logical name
/// is untouched; only artifact paths use the sanitized form.
pub fn sanitize_module_name(name: &str) -> String {
    name.replace(':', "-")
}

/// Returns the path rendered with forward slashes, the form emitted into
/// json files.
pub fn slashed(path: &Path) -> String {
    use path_slash::PathExt;
    path.to_slash_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn can_sanitize_module_names() {
        assert_eq!(sanitize_module_name("m"), "m");
        assert_eq!(sanitize_module_name("m:part"), "m-part");
        assert_eq!(sanitize_module_name("a.b:c"), "a.b-c");
    }

    #[test]
    fn rel_source_path_strips_common_prefix() {
        let rel = rel_source_path(Path::new("/home/me/proj/src/a.cpp"), Path::new("/home/me/proj"));
        assert_eq!(rel, PathBuf::from("src/a.cpp"));
    }

    #[test]
    fn rel_source_path_keeps_distinct_siblings_apart() {
        let base = Path::new("/home/me/proj");
        let a = rel_source_path(Path::new("/home/me/other/src/a.cpp"), base);
        let b = rel_source_path(Path::new("/home/me/proj/src/a.cpp"), base);
        assert_eq!(a, PathBuf::from("other/src/a.cpp"));
        assert_eq!(b, PathBuf::from("src/a.cpp"));
    }

    #[test]
    fn rel_source_path_never_returns_empty() {
        let rel = rel_source_path(Path::new("/proj"), Path::new("/proj"));
        assert_eq!(rel, PathBuf::from("proj"));
    }

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("options.txt");
        assert!(write_if_changed(&file, "-O2").unwrap());
        assert!(!write_if_changed(&file, "-O2").unwrap());
        assert!(write_if_changed(&file, "-O3").unwrap());
        assert_eq!(fs::read_to_string(&file).unwrap(), "-O3");
    }
}
