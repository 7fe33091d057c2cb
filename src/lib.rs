#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod compiler;
mod context;
mod core;
mod error;
mod graph;
mod hooks;
mod options;
mod pipeline;
mod progress;
mod scheduler;
mod task;
mod transform;
mod utils;
#[cfg(feature = "live")]
mod watch;

pub use crate::cache::{ArtifactEntry, ArtifactFile, CompileCache, KEY_ENV, KEY_GRAPH};
pub use crate::compiler::{Compiler, IMG_TYPE, IncrementHandle, State};
pub use crate::context::{CompileContext, FileContext, TaskContext};
pub use crate::core::Hash32;
pub use crate::error::*;
pub use crate::graph::{DependencyGraph, GraphNode, GraphSnapshot, SnapshotNode};
pub use crate::hooks::{HookBus, HookEvent, HookFuture, HookHandler, Phase, UnknownPhase, handler};
pub use crate::options::{CACHE_DIR, Options, ResolvedOptions};
pub use crate::pipeline::{Plan, finalize};
pub use crate::progress::Progress;
pub use crate::scheduler::{JobHandle, SerialQueue};
pub use crate::task::{
    DeclarativeDecl, FunctionalTask, OptionsFactory, PatternFactory, Patterns, Task, TaskDecl,
    TaskRegistry, TaskSpec, TransformOptions, UseEntry, UseSpec, normalize_task, normalize_tasks,
};
pub use crate::transform::{Pipeline, Plugin, Registry, SourceFile, Stage, StageFactory, Transformers};
pub use crate::utils::as_overhead;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
#[cfg(feature = "live")]
pub use crate::watch::Watcher;
