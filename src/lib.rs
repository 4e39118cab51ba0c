#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, IoError, Result};

pub mod utils;

pub mod config;
pub use config::{Context, OutputLayout};

pub mod vfs;
pub use vfs::Vfs;

pub mod graph;
pub use graph::{DepGraph, FutureList, NodeId, TaskFuture};

pub mod compilers;
pub use compilers::{Clang, Driver, ModuleInfo, ModuleMap, ProcessOutput};

pub mod cache;
pub use cache::Unit;

pub mod plan;
pub use plan::{CompilerOptions, PlanCtx};

pub mod targets;
pub use targets::{
    ArchiveTarget, BmiTarget, ExeTarget, ExternalBmi, ModuleTarget, ObjectKind, ObjectTarget,
    SharedLibTarget, Target, TargetProxy,
};

pub mod export;
pub use export::{Export, ExportSet, ExternalExport, LibExport, UsageExport};

pub mod builder;
pub use builder::{BuildResult, Builder, ExeBuilder, LibBuilder};

pub mod project;
pub use project::{PackageRef, PackageStore, ProjectDesc, ScriptConfig, ScriptProject, Usage};

/// Utilities for creating and testing of (temporary) module projects
#[cfg(feature = "project-util")]
pub mod project_util;
