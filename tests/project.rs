//! End-to-end build scenarios on a mocked toolchain.

use modbuild::{
    project::PROJECT_FILE,
    project_util::TempProject,
    BuildError, ScriptConfig, ScriptProject, UsageExport,
};
use pretty_assertions::assert_eq;
use std::{fs, path::PathBuf, rc::Rc};

/// S1: a single classical unit produces one object and one link; a second
/// invocation spawns nothing at all.
#[test]
fn classical_hello_builds_once() {
    let project = TempProject::new().unwrap();
    project.add_file("src/main.cpp", "int main() { return 0; }\n");
    project.settle();

    let ctx = project.context("hello").unwrap();
    let mut exe = project.exe("hello");
    exe.add_src(project.root().join("src/main.cpp"));

    let output = exe.build(&ctx).unwrap().get().unwrap();
    assert!(output.ends_with(format!("hello{}", modbuild::utils::EXE_SUFFIX)));
    assert!(output.exists());

    let driver = project.driver();
    assert_eq!(driver.count_of("obj"), 1);
    assert_eq!(driver.count_of("link"), 1);
    assert_eq!(driver.count_of("bmi"), 0);

    // second invocation performs zero subprocesses, scans included
    project.settle();
    driver.clear();
    let again = exe.build(&ctx).unwrap().get().unwrap();
    assert_eq!(again, output);
    assert_eq!(driver.calls(), Vec::<String>::new());
}

/// S2: a module interface builds bmi -> object-from-bmi -> importer ->
/// link, and edits trigger exactly the affected subset.
#[test]
fn single_module_rebuilds_affected_subset() {
    let project = TempProject::new().unwrap();
    project.add_file("src/a.ixx", "export module a;\nexport constexpr int answer = 42;\n");
    project.add_file("src/main.cpp", "import a;\nint main() { return answer; }\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.ixx"));
    exe.add_src(project.root().join("src/main.cpp"));

    exe.build(&ctx).unwrap().get().unwrap();
    let driver = project.driver();
    assert_eq!(driver.count_of("bmi"), 1);
    assert_eq!(driver.count_of("obj"), 2);
    assert_eq!(driver.count_of("link"), 1);

    // the bmi compiles before both objects, the link comes last
    let bmi = driver.position_of("bmi ").unwrap();
    let link = driver.position_of("link ").unwrap();
    let calls = driver.calls();
    for (index, call) in calls.iter().enumerate() {
        if call.starts_with("obj") {
            assert!(bmi < index && index < link, "unexpected order: {calls:#?}");
        }
    }

    // touching the interface rebuilds all four artifacts
    project.touch("src/a.ixx");
    driver.clear();
    exe.build(&ctx).unwrap().get().unwrap();
    assert_eq!(driver.count_of("bmi"), 1);
    assert_eq!(driver.count_of("obj"), 2);
    assert_eq!(driver.count_of("link"), 1);

    // touching only the importer rebuilds its object and the link
    project.touch("src/main.cpp");
    driver.clear();
    exe.build(&ctx).unwrap().get().unwrap();
    assert_eq!(driver.count_of("bmi"), 0);
    assert_eq!(driver.count_of("obj"), 1);
    assert_eq!(driver.count_of("link"), 1);
}

/// S3: partitions sanitize `:` to `-` on disk while the module map keeps
/// the logical name.
#[test]
fn module_partition_is_sanitized_in_paths_only() {
    let project = TempProject::new().unwrap();
    project.add_file("src/m_part.ixx", "export module m:part;\n");
    project.add_file("src/m.ixx", "export module m;\nimport :part;\n");
    project.add_file("src/main.cpp", "import m;\nint main() {}\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/m_part.ixx"));
    exe.add_src(project.root().join("src/m.ixx"));
    exe.add_src(project.root().join("src/main.cpp"));

    exe.build(&ctx).unwrap().get().unwrap();
    let driver = project.driver();

    let part = driver.position_of("m-part.pcm").expect("partition bmi was built");
    let full_bmi = driver
        .calls()
        .iter()
        .position(|call| call.starts_with("bmi") && call.contains("m.pcm"))
        .expect("m bmi was built");
    assert!(part < full_bmi, "partition bmi must precede the module bmi");

    // the moduleMap entry uses the logical name, the path the sanitized stem
    let m_bmi = driver.calls()[full_bmi].clone();
    assert!(m_bmi.contains("m:part="), "module map keeps `m:part`: {m_bmi}");
    assert!(m_bmi.contains("m-part.pcm"), "path is sanitized: {m_bmi}");
}

/// S4: a package advertising prebuilt bmis emits no action for them; its
/// paths and library flow into downstream compiles and links untouched.
#[test]
fn external_package_usage_is_consumed_in_place() {
    let project = TempProject::new().unwrap();
    let upstream = project.root().join("pkg");
    let pcm_dir = upstream.join("output").join("module");
    fs::create_dir_all(&pcm_dir).unwrap();
    fs::write(pcm_dir.join("P.pcm"), "prebuilt bmi").unwrap();
    let lib = upstream.join("output").join("libP.a");
    fs::write(&lib, "prebuilt lib").unwrap();

    project.add_file("src/main.cpp", "import P;\nint main() {}\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/main.cpp"));
    exe.depend(Rc::new(UsageExport::new(
        String::new(),
        lib.display().to_string(),
        Vec::new(),
        Some(pcm_dir.clone()),
    )));

    exe.build(&ctx).unwrap().get().unwrap();
    let driver = project.driver();

    assert_eq!(driver.count_of("bmi"), 0, "the prebuilt bmi must not be rebuilt");
    let obj = driver.calls().into_iter().find(|call| call.starts_with("obj")).unwrap();
    assert!(
        obj.contains(&format!("P={}", pcm_dir.join("P.pcm").display())),
        "module map points into the upstream package: {obj}"
    );
    let link = driver.calls().into_iter().find(|call| call.starts_with("link")).unwrap();
    assert!(link.contains("libP.a"), "upstream library joins the link: {link}");
}

/// S4 (external context): an external export re-evaluates its targets under
/// the upstream layout while scheduling them in the downstream graph.
#[test]
fn external_export_plans_into_upstream_layout() {
    let project = TempProject::new().unwrap();
    project.add_file("up/src/p.ixx", "export module p;\n");
    project.add_file("down/src/main.cpp", "import p;\nint main() {}\n");
    project.settle();

    let mut lib = project.lib("p");
    lib.add_src(project.root().join("up/src/p.ixx"));
    let upstream_out = project.root().join("up/out");
    let export = lib.create_external_export(&upstream_out).unwrap();

    let ctx = project.context("down").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("down/src/main.cpp"));
    exe.depend(export);

    exe.build(&ctx).unwrap().get().unwrap();
    let driver = project.driver();

    let expected_pcm = upstream_out.join("p").join("module").join("p.pcm");
    let bmi = driver.calls().into_iter().find(|call| call.starts_with("bmi")).unwrap();
    assert!(
        bmi.contains(&expected_pcm.display().to_string()),
        "upstream bmi builds under the upstream output root: {bmi}"
    );
    assert!(expected_pcm.exists());

    let obj = driver.calls().into_iter().find(|call| call.starts_with("obj")).unwrap();
    assert!(
        obj.contains(&format!("p={}", expected_pcm.display())),
        "downstream compile resolves the import upstream: {obj}"
    );
    let link = driver.calls().into_iter().find(|call| call.starts_with("link")).unwrap();
    assert!(link.contains("libp.a"), "upstream archive joins the link: {link}");
}

/// S5: a cyclic import graph fails during planning; nothing is spawned.
#[test]
fn cyclic_imports_fail_before_any_compile() {
    let project = TempProject::new().unwrap();
    project.add_file("src/x.ixx", "export module x;\nimport y;\n");
    project.add_file("src/y.ixx", "export module y;\nimport x;\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/x.ixx"));
    exe.add_src(project.root().join("src/y.ixx"));

    let err = exe.build(&ctx).unwrap_err();
    assert!(matches!(err, BuildError::CyclicModuleDependency(_)), "got: {err}");

    let driver = project.driver();
    assert_eq!(driver.count_of("bmi"), 0);
    assert_eq!(driver.count_of("obj"), 0);
    assert_eq!(driver.count_of("link"), 0);
}

/// S6: changing only the compile options rebuilds every object.
#[test]
fn option_change_rebuilds_everything() {
    let project = TempProject::new().unwrap();
    project.add_file("src/a.cpp", "int a() { return 0; }\n");
    project.add_file("src/b.cpp", "int b() { return 0; }\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.cpp"));
    exe.add_src(project.root().join("src/b.cpp"));
    exe.define("FOO=1");
    exe.build(&ctx).unwrap().get().unwrap();

    let driver = project.driver();
    assert_eq!(driver.count_of("obj"), 2);

    // same sources, different define: the fingerprint invalidates all units
    project.settle();
    driver.clear();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.cpp"));
    exe.add_src(project.root().join("src/b.cpp"));
    exe.define("FOO=2");
    exe.build(&ctx).unwrap().get().unwrap();

    assert_eq!(driver.count_of("scan "), 2, "option change re-scans every unit");
    assert_eq!(driver.count_of("obj"), 2);
    assert_eq!(driver.count_of("link"), 1);
}

/// Two local units claiming one module name fail before anything runs.
#[test]
fn duplicate_module_names_are_rejected() {
    let project = TempProject::new().unwrap();
    project.add_file("src/a.ixx", "export module dup;\n");
    project.add_file("src/b.ixx", "export module dup;\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.ixx"));
    exe.add_src(project.root().join("src/b.ixx"));

    let err = exe.build(&ctx).unwrap_err();
    assert!(matches!(err, BuildError::DuplicateModule { name, .. } if name == "dup"));
    assert_eq!(project.driver().count_of("bmi"), 0);
}

/// An unresolvable import is a hard planning error.
#[test]
fn missing_module_is_reported_with_its_importer() {
    let project = TempProject::new().unwrap();
    let main = project.add_file("src/main.cpp", "import nowhere;\nint main() {}\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(&main);

    let err = exe.build(&ctx).unwrap_err();
    let BuildError::ModuleNotFound { importer, name } = err else { panic!("got: {err}") };
    assert_eq!(name, "nowhere");
    assert!(importer.ends_with("src/main.cpp"));
}

/// Local modules win over exports; exports resolve in construction order.
#[test]
fn resolution_prefers_local_then_export_order() {
    let project = TempProject::new().unwrap();
    project.add_file("src/m.ixx", "export module m;\n");
    project.add_file("src/main.cpp", "import m;\nimport q;\nint main() {}\n");

    let first = project.root().join("first");
    fs::create_dir_all(&first).unwrap();
    fs::write(first.join("m.pcm"), "shadowed").unwrap();
    fs::write(first.join("q.pcm"), "first q").unwrap();
    let second = project.root().join("second");
    fs::create_dir_all(&second).unwrap();
    fs::write(second.join("q.pcm"), "second q").unwrap();
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/m.ixx"));
    exe.add_src(project.root().join("src/main.cpp"));
    exe.depend(Rc::new(UsageExport::new(String::new(), String::new(), vec![], Some(first.clone()))));
    exe.depend(Rc::new(UsageExport::new(String::new(), String::new(), vec![], Some(second))));

    exe.build(&ctx).unwrap().get().unwrap();

    let obj = project
        .driver()
        .calls()
        .into_iter()
        .find(|call| call.starts_with("obj") && call.contains("main.cpp"))
        .unwrap();
    // the local bmi shadows the export's m.pcm
    let local_m = ctx.pcm_path().join("m.pcm");
    assert!(obj.contains(&format!("m={}", local_m.display())), "local module wins: {obj}");
    // the first export added wins for q
    assert!(obj.contains(&format!("q={}", first.join("q.pcm").display())), "got: {obj}");
}

/// A shared module interface plans exactly one bmi compile no matter how
/// many units import it.
#[test]
fn shared_bmi_is_planned_once() {
    let project = TempProject::new().unwrap();
    project.add_file("src/a.ixx", "export module a;\n");
    project.add_file("src/b.cpp", "import a;\nint b() { return 0; }\n");
    project.add_file("src/c.cpp", "import a;\nint c() { return 0; }\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.ixx"));
    exe.add_src(project.root().join("src/b.cpp"));
    exe.add_src(project.root().join("src/c.cpp"));

    exe.build(&ctx).unwrap().get().unwrap();
    assert_eq!(project.driver().count_of("bmi"), 1);
}

/// Include dependencies participate in staleness.
#[test]
fn touched_header_rebuilds_its_includer() {
    let project = TempProject::new().unwrap();
    project.add_file("src/util.h", "#define UTIL 1\n");
    project.add_file("src/a.cpp", "#include \"util.h\"\nint a() { return UTIL; }\n");
    project.add_file("src/b.cpp", "int b() { return 0; }\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.cpp"));
    exe.add_src(project.root().join("src/b.cpp"));
    exe.build(&ctx).unwrap().get().unwrap();

    let driver = project.driver();
    project.touch("src/util.h");
    driver.clear();
    exe.build(&ctx).unwrap().get().unwrap();

    // a.cpp sees the header change; b.cpp does not
    assert_eq!(driver.count_of("obj"), 1);
    let obj = driver.calls().into_iter().find(|call| call.starts_with("obj")).unwrap();
    assert!(obj.contains("a.cpp"), "only the includer rebuilds: {obj}");
    assert_eq!(driver.count_of("link"), 1);
}

/// The first failing compile terminates the build; dependents never run and
/// the originating error surfaces from `get`.
#[test]
fn compile_failure_terminates_the_build() {
    let project = TempProject::new().unwrap();
    project.add_file("src/main.cpp", "int main() {}\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/main.cpp"));

    let driver = project.driver();
    driver.fail_matching("main.cpp.obj");

    let err = exe.build(&ctx).unwrap().get().unwrap_err();
    let BuildError::Compile { output, status, .. } = err else { panic!("got: {err}") };
    assert_eq!(status, 1);
    assert_eq!(output, "mock failure");
    assert_eq!(driver.count_of("link"), 0, "the link must never start");
}

/// Library builders archive (or shared-link) their objects and export their
/// modules to downstream builders in the same context.
#[test]
fn library_export_feeds_downstream_builder() {
    let project = TempProject::new().unwrap();
    project.add_file("lib/api.ixx", "export module api;\n");
    project.add_file("src/main.cpp", "import api;\nint main() {}\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut lib = project.lib("api");
    lib.add_src(project.root().join("lib/api.ixx"));

    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/main.cpp"));
    exe.depend(lib.get_export(&ctx).unwrap());

    // get_export is idempotent per context
    assert!(Rc::ptr_eq(&lib.get_export(&ctx).unwrap(), &lib.get_export(&ctx).unwrap()));

    exe.build(&ctx).unwrap().get().unwrap();
    let driver = project.driver();
    assert_eq!(driver.count_of("bmi"), 1);
    assert_eq!(driver.count_of("archive"), 1);
    assert_eq!(driver.count_of("link"), 1);
    let link = driver.calls().into_iter().find(|call| call.starts_with("link")).unwrap();
    assert!(link.contains("libapi.a"), "archive joins the link: {link}");
}

/// A shared library build drives the shared-link capability.
#[test]
fn shared_library_uses_shared_link() {
    let project = TempProject::new().unwrap();
    project.add_file("lib/impl.cpp", "int impl() { return 0; }\n");
    project.settle();

    let ctx = project.context("libs").unwrap();
    let mut lib = project.lib("impl");
    lib.set_shared(true);
    lib.add_src(project.root().join("lib/impl.cpp"));

    let output = lib.build(&ctx).unwrap().get().unwrap();
    assert_eq!(project.driver().count_of("shared"), 1);
    let name = output.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.contains("impl"));
    assert!(name.ends_with(modbuild::utils::SHARED_LIB_SUFFIX));
}

/// The compilation database lists every input with its object output.
#[test]
fn compile_commands_cover_all_inputs() {
    let project = TempProject::new().unwrap();
    project.add_file("src/a.cpp", "int a;\n");
    project.add_file("src/b.cpp", "int b;\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.cpp"));
    exe.add_src(project.root().join("src/b.cpp"));
    exe.include("include");

    let path = exe.write_compile_commands(ctx.layout()).unwrap();
    let database: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let entries = database.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    for entry in entries {
        assert!(entry["file"].as_str().unwrap().ends_with(".cpp"));
        assert!(entry["output"].as_str().unwrap().ends_with(".obj"));
        assert!(entry["command"].as_str().unwrap().contains("-I include"));
        assert!(!entry["directory"].as_str().unwrap().is_empty());
    }
}

/// A script project resolves its packages and reports a deterministic
/// artifact path without compiling anything.
#[test]
fn script_project_resolves_packages_eagerly() {
    let project = TempProject::new().unwrap();
    let packages = project.root().join("packages");
    fs::create_dir_all(packages.join("dep")).unwrap();
    fs::write(
        packages.join("dep").join(PROJECT_FILE),
        r#"{"name": "dep", "usage": {"compileOption": "-I {}/include"}}"#,
    )
    .unwrap();

    project.add_file("build.cpp", "extern \"C\" int build() { return 0; }\n");
    project.add_file(
        PROJECT_FILE,
        r#"{"name": "demo", "packages": ["dep"], "dev": {"buildFile": "build.cpp"}}"#,
    );

    let script = ScriptProject::new(
        project.root(),
        ScriptConfig {
            output: None,
            packages_root: packages,
            compiler: None,
            debug: false,
        },
    )
    .unwrap();

    let output = script.output();
    assert!(output.starts_with(project.root().join(".build")));
    let file_name = output.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.contains("demo"));
    assert!(file_name.ends_with(modbuild::utils::SHARED_LIB_SUFFIX));

    let exports = script.package_exports();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].0, "dep");
    assert_eq!(exports[0].1.len(), 1);
}

/// A broken package reference fails script-project construction before any
/// compile could run.
#[test]
fn script_project_rejects_unbuildable_packages() {
    let project = TempProject::new().unwrap();
    let packages = project.root().join("packages");
    fs::create_dir_all(packages.join("raw")).unwrap();
    // no usage: nothing downstream can consume
    fs::write(packages.join("raw").join(PROJECT_FILE), r#"{"name": "raw"}"#).unwrap();

    project.add_file("build.cpp", "extern \"C\" int build() { return 0; }\n");
    project.add_file(PROJECT_FILE, r#"{"name": "demo", "packages": ["raw"]}"#);

    let err = ScriptProject::new(
        project.root(),
        ScriptConfig {
            output: None,
            packages_root: packages,
            compiler: None,
            debug: false,
        },
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::PackageNotBuilt(name) if name == "raw"));
}

/// Outputs live exactly where the layout promises.
#[test]
fn on_disk_layout_matches_contract() {
    let project = TempProject::new().unwrap();
    project.add_file("src/a.ixx", "export module a;\n");
    project.add_file("src/main.cpp", "import a;\nint main() {}\n");
    project.settle();

    let ctx = project.context("app").unwrap();
    let mut exe = project.exe("app");
    exe.add_src(project.root().join("src/a.ixx"));
    exe.add_src(project.root().join("src/main.cpp"));
    exe.build(&ctx).unwrap().get().unwrap();

    let out_dir = project.root().join("out").join("app");
    assert!(out_dir.join("module").join("a.pcm").exists());
    assert!(out_dir.join("cache").join("app").join("compileOptions.txt").exists());
    assert!(out_dir.join("cache").join("app").join("linkOptions.txt").exists());
    let units: Vec<PathBuf> = walk_files(&out_dir.join("cache").join("app").join("units"));
    assert_eq!(units.len(), 2, "one sidecar per source: {units:#?}");
    assert!(units.iter().all(|unit| unit.extension().is_some_and(|ext| ext == "json")));
}

fn walk_files(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}
