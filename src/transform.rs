//! Transformers, plugins and the registry that holds them.
//!
//! A transformer is a named factory which turns options into a [`Stage`].
//! Stages of a task's chain are composed into a [`Pipeline`]: every file the
//! previous stage emits is fed to the next one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::context::FileContext;
use crate::error::BuildError;
use crate::hooks::{HookBus, HookEvent, HookHandler, Phase};
use crate::task::TaskDecl;

/// A file travelling through a transform chain.
#[derive(Clone)]
pub struct SourceFile {
    /// Current absolute path, stages may rename the file.
    pub path: Utf8PathBuf,
    /// Root the output path is computed against.
    pub base: Utf8PathBuf,
    pub contents: Vec<u8>,
    pub context: FileContext,
}

impl SourceFile {
    /// Path relative to `base`, or just the file name when the file was
    /// moved outside of it.
    pub fn relative(&self) -> Utf8PathBuf {
        match self.path.strip_prefix(&self.base) {
            Ok(relative) => relative.to_owned(),
            Err(_) => self
                .path
                .file_name()
                .map(Utf8PathBuf::from)
                .unwrap_or_default(),
        }
    }

    pub fn text(&self) -> anyhow::Result<&str> {
        Ok(std::str::from_utf8(&self.contents)?)
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.path.set_extension(extension);
        self
    }

    pub fn with_contents(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.contents = contents.into();
        self
    }
}

impl Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("path", &self.path)
            .field("base", &self.base)
            .field("len", &self.contents.len())
            .finish()
    }
}

/// One step of a transform chain. A stage may rewrite, rename, drop or fan
/// out the file it receives.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn process(&self, file: SourceFile) -> anyhow::Result<Vec<SourceFile>>;
}

#[async_trait]
impl<F, Fut> Stage for F
where
    F: Fn(SourceFile) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<SourceFile>>> + Send + 'static,
{
    async fn process(&self, file: SourceFile) -> anyhow::Result<Vec<SourceFile>> {
        (self)(file).await
    }
}

pub type StageFactory =
    Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<Box<dyn Stage>> + Send + Sync>;

/// Named transformer factories.
#[derive(Clone, Default)]
pub struct Transformers {
    factories: BTreeMap<String, StageFactory>,
}

impl Transformers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<F, S>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> anyhow::Result<S> + Send + Sync + 'static,
        S: Stage + 'static,
    {
        let factory: StageFactory = Arc::new(move |options| {
            let stage = factory(options)?;
            Ok(Box::new(stage) as Box<dyn Stage>)
        });
        self.factories.insert(name.into(), factory);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<StageFactory> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(&self, name: &str, options: &serde_json::Value) -> Result<Box<dyn Stage>, BuildError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BuildError::UnknownTransformer(name.to_string()))?;

        factory(options).map_err(|e| BuildError::TransformerOptions(name.to_string(), e))
    }
}

/// A composed transform chain.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn build(
        transformers: &Transformers,
        chain: &[(String, serde_json::Value)],
    ) -> Result<Self, BuildError> {
        let stages = chain
            .iter()
            .map(|(name, options)| transformers.build(name, options))
            .collect::<Result<_, _>>()?;

        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run(&self, file: SourceFile) -> anyhow::Result<Vec<SourceFile>> {
        let mut files = vec![file];

        for stage in &self.stages {
            let mut next = Vec::with_capacity(files.len());
            for file in files {
                next.extend(stage.process(file).await?);
            }
            files = next;
        }

        Ok(files)
    }
}

/// Something that extends a compiler with transformers, hooks or tasks.
pub trait Plugin {
    /// Plugins are installed at most once per registry, keyed by name.
    fn name(&self) -> &str;

    fn install(&self, registry: &mut Registry);
}

/// Everything a compiler can be extended with, owned per compiler.
pub struct Registry {
    pub transformers: Transformers,
    hooks: Arc<HookBus>,
    tasks: BTreeMap<String, TaskDecl>,
    plugins: BTreeSet<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            transformers: Transformers::new(),
            hooks: Arc::new(HookBus::new()),
            tasks: BTreeMap::new(),
            plugins: BTreeSet::new(),
        }
    }

    /// Install a plugin, returns `false` if one with the same name already is.
    pub fn use_plugin(&mut self, plugin: impl Plugin) -> bool {
        if self.plugins.contains(plugin.name()) {
            return false;
        }

        self.plugins.insert(plugin.name().to_string());
        plugin.install(self);
        true
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains(name)
    }

    pub fn set_transformer<F, S>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> anyhow::Result<S> + Send + Sync + 'static,
        S: Stage + 'static,
    {
        self.transformers.set(name, factory);
        self
    }

    pub fn remove_transformer(&mut self, name: &str) -> bool {
        self.transformers.remove(name)
    }

    pub fn install_hook<F, Fut>(&mut self, phase: Phase, f: F) -> &mut Self
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.install(phase, f);
        self
    }

    pub fn install_hooks(&mut self, hooks: impl IntoIterator<Item = (Phase, HookHandler)>) -> &mut Self {
        self.hooks.install_all(hooks);
        self
    }

    /// Register a framework task. These run before user tasks and shadow
    /// user tasks of the same type during incremental compiles.
    pub fn add_task(&mut self, name: impl Into<String>, task: TaskDecl) -> &mut Self {
        self.tasks.insert(name.into(), task);
        self
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn tasks(&self) -> &BTreeMap<String, TaskDecl> {
        &self.tasks
    }

    pub(crate) fn into_parts(self) -> (Transformers, Arc<HookBus>, BTreeMap<String, TaskDecl>) {
        (self.transformers, self.hooks, self.tasks)
    }
}
