//! Views of the build handed to tasks, transformers and hooks.
//!
//! [`CompileContext`] is assembled by the compiler for every build run and
//! shared behind an `Arc`. Task and file contexts hold a handle to it next
//! to their own mutable state.

use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::CompileCache;
use crate::error::CacheError;
use crate::graph::{DependencyGraph, GraphNode};
use crate::hooks::{HookBus, HookEvent, Phase};
use crate::options::{ResolvedOptions, normalize};
use crate::utils::lock;

pub struct CompileContext {
    pub options: Arc<ResolvedOptions>,
    cache: Arc<Mutex<CompileCache>>,
    graph: Arc<Mutex<DependencyGraph>>,
    hooks: Arc<HookBus>,
}

impl CompileContext {
    pub fn new(
        options: Arc<ResolvedOptions>,
        cache: Arc<Mutex<CompileCache>>,
        graph: Arc<Mutex<DependencyGraph>>,
        hooks: Arc<HookBus>,
    ) -> Self {
        Self {
            options,
            cache,
            graph,
            hooks,
        }
    }

    pub fn source_dir(&self) -> &Utf8Path {
        &self.options.source_dir
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.options.output_dir
    }

    /// Resolve a module request made by `from` (or by the source root).
    ///
    /// * `/x` resolves under the source directory.
    /// * `./x` and `../x` resolve against the directory of `from`.
    /// * `@alias/x` resolves under a configured alias.
    /// * anything else resolves under the source directory.
    pub fn resolve(&self, request: &str, from: Option<&Utf8Path>) -> Utf8PathBuf {
        let source_dir = &self.options.source_dir;

        if let Some(rooted) = request.strip_prefix('/') {
            return normalize(&source_dir.join(rooted));
        }

        if request.starts_with("./") || request.starts_with("../") {
            let dir = from.and_then(Utf8Path::parent).unwrap_or(source_dir);
            return normalize(&dir.join(request));
        }

        for (name, target) in &self.options.alias {
            if request == name {
                return target.clone();
            }
            let rest = request
                .strip_prefix(name.as_str())
                .and_then(|rest| rest.strip_prefix('/'));
            if let Some(rest) = rest {
                return normalize(&target.join(rest));
            }
        }

        normalize(&source_dir.join(request))
    }

    pub fn query<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.cache().query(key, default)
    }

    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.cache().set(key, value)
    }

    /// Register a handler for the next time `phase` fires.
    pub fn tap<F, Fut>(&self, phase: Phase, f: F)
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.install_once(phase, f);
    }

    pub fn add_dependency(&self, dependent: impl AsRef<Utf8Path>, dependency: impl AsRef<Utf8Path>) {
        self.graph().add_edge(dependent, dependency);
    }

    pub fn remove_dependency(
        &self,
        dependent: impl AsRef<Utf8Path>,
        dependency: impl AsRef<Utf8Path>,
    ) -> bool {
        self.graph().remove_edge(dependent, dependency)
    }

    pub fn graph_node(&self, path: impl AsRef<Utf8Path>) -> Option<GraphNode> {
        self.graph().get_node(path)
    }

    pub(crate) fn cache(&self) -> MutexGuard<'_, CompileCache> {
        lock(&self.cache)
    }

    pub(crate) fn graph(&self) -> MutexGuard<'_, DependencyGraph> {
        lock(&self.graph)
    }

    /// Fresh per-file context for a file entering a pipeline.
    pub fn file_context(self: &Arc<Self>, path: &Utf8Path) -> FileContext {
        FileContext {
            shared: self.clone(),
            original_path: path.to_owned(),
            custom_deps: Vec::new(),
            depended: false,
        }
    }

    pub fn task_context(self: &Arc<Self>, task_name: &str) -> TaskContext {
        TaskContext {
            shared: self.clone(),
            task_name: task_name.to_string(),
        }
    }
}

/// Context of a functional task run.
#[derive(Clone)]
pub struct TaskContext {
    pub shared: Arc<CompileContext>,
    pub task_name: String,
}

/// Per-file state carried through a transform chain.
#[derive(Clone)]
pub struct FileContext {
    pub shared: Arc<CompileContext>,
    /// The source path the file had when it entered the pipeline.
    pub original_path: Utf8PathBuf,
    /// Extra dependencies discovered by transformers, absolute.
    pub custom_deps: Vec<Utf8PathBuf>,
    /// The file is only depended upon, nothing is emitted for it.
    pub depended: bool,
}

impl FileContext {
    /// Record that this file depends on `request`, resolved relative to it.
    pub fn depend_on(&mut self, request: &str) -> Utf8PathBuf {
        let path = self.shared.resolve(request, Some(&self.original_path));
        if !self.custom_deps.contains(&path) {
            self.custom_deps.push(path.clone());
        }
        path
    }
}
