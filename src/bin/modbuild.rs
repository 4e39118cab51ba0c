//! Compiles a project's build script into its loadable artifact.

use clap::Parser;
use modbuild::project::PACKAGES_ROOT_ENV;
use modbuild::{ScriptConfig, ScriptProject};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use yansi::Paint;

#[derive(Debug, Parser)]
#[command(name = "modbuild", version, about = "Build orchestration for C++ module projects")]
struct Opts {
    /// Project directory or path to its project.json
    #[arg(default_value = ".")]
    project: PathBuf,

    /// Output directory (default: <project>/.build)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Packages root directory (default: $MODBUILD_PACKAGES)
    #[arg(short, long)]
    packages: Option<PathBuf>,

    /// Compile and link with debug info
    #[arg(short = 'g', long)]
    debug: bool,

    /// Only report the expected artifact path, build nothing
    #[arg(long)]
    no_build: bool,

    /// Emit compile_commands.json for the build script sources
    #[arg(long)]
    compile_commands: bool,

    /// Compiler executable to drive
    #[arg(long)]
    compiler: Option<String>,

    /// Remove the output directory and exit
    #[arg(long)]
    clean: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    if let Err(err) = run(Opts::parse()) {
        eprintln!("{}", Paint::red(format!("error: {err}")));
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> modbuild::Result<()> {
    let packages_root = opts
        .packages
        .or_else(|| std::env::var_os(PACKAGES_ROOT_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("packages"));

    let project = ScriptProject::new(
        &opts.project,
        ScriptConfig {
            output: opts.output,
            packages_root,
            compiler: opts.compiler,
            debug: opts.debug,
        },
    )?;

    if opts.clean {
        project.clean()?;
        println!("{}", Paint::green("Cleaned"));
        return Ok(());
    }

    if opts.compile_commands {
        let path = project.write_compile_commands()?;
        println!("{}", Paint::green(format!("Wrote {}", path.display())));
    }

    if opts.no_build {
        println!("{}", project.output().display());
        return Ok(());
    }

    let output = project.build()?.get()?;
    println!("{}", Paint::green(format!("Built {}", output.display())));
    // loading the script and running its `build` entry point is the
    // host's business; see the project-level docs
    Ok(())
}
