//! The incremental compile controller.
//!
//! A full build goes `Idle → Initializing → Cleaning → Compiling → Idle`:
//! the `init` hook fires once per compiler, files which disappeared from disk
//! are pruned from the graph and the cache, then the task groups run and the
//! graph is persisted. Watch-triggered increments skip cleanup, bypass the
//! cache and wait on a serial queue in `QueuedIncrement`. Full builds and
//! increments share a build lock, so no two pipelines ever run at the same
//! time.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::cache::{CompileCache, KEY_GRAPH};
use crate::context::CompileContext;
use crate::error::{BuildError, CacheError, ConfigError};
use crate::graph::{DependencyGraph, GraphSnapshot};
use crate::hooks::{HookBus, HookEvent, Phase};
use crate::options::{Options, ResolvedOptions, normalize};
use crate::pipeline::{Plan, finalize};
use crate::progress::Progress;
use crate::scheduler::{JobHandle, SerialQueue};
use crate::task::{Task, TaskDecl, TaskRegistry, TaskSpec};
use crate::transform::{Registry, Transformers};
use crate::utils::{as_overhead, lock};

/// Logical task type shared by every configured image extension.
pub const IMG_TYPE: &str = "img";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Initializing,
    Cleaning,
    Compiling,
    /// An increment waits on the serial queue, nothing is compiling.
    QueuedIncrement,
}

/// Handle to a queued incremental compile.
pub type IncrementHandle = JobHandle<Result<(), BuildError>>;

/// The build orchestrator. Cloning is cheap, clones share all state.
#[derive(Clone)]
pub struct Compiler {
    inner: Arc<Inner>,
}

struct Inner {
    options: Arc<ResolvedOptions>,
    internal_tasks: BTreeMap<String, TaskDecl>,
    user_tasks: BTreeMap<String, TaskDecl>,
    transformers: Transformers,
    hooks: Arc<HookBus>,
    cache: Arc<Mutex<CompileCache>>,
    graph: Arc<Mutex<DependencyGraph>>,
    /// Tasks normalized by the latest full build.
    tasks: Mutex<Option<Arc<TaskRegistry>>>,
    context: Mutex<Arc<CompileContext>>,
    state: Mutex<State>,
    running: AtomicBool,
    compiling: AtomicBool,
    init: OnceCell<()>,
    build_lock: tokio::sync::Mutex<()>,
    queue: SerialQueue,
    progress: Mutex<Option<Arc<Progress>>>,
    #[cfg(feature = "live")]
    watchers: Mutex<Vec<crate::watch::Watcher>>,
}

impl Compiler {
    /// Validate the options and every task declaration, then open the
    /// persisted cache and graph. Nothing touches the disk before the
    /// declarations are known to be valid.
    pub fn new(options: Options, registry: Registry) -> Result<Self, ConfigError> {
        let (options, user_tasks) = options.resolve()?;
        let (transformers, hooks, internal_tasks) = registry.into_parts();

        let tasks = TaskRegistry::new(&internal_tasks, &user_tasks, &options)?;

        fs::create_dir_all(&options.cache_dir)
            .map_err(|e| ConfigError::CacheDir(options.cache_dir.clone(), e))?;

        let cache = CompileCache::open(&options.cache_dir)?;
        let graph = cache
            .get::<GraphSnapshot>(KEY_GRAPH)
            .map(|snapshot| DependencyGraph::from_snapshot(&snapshot))
            .unwrap_or_default();

        let options = Arc::new(options);
        let cache = Arc::new(Mutex::new(cache));
        let graph = Arc::new(Mutex::new(graph));
        let context = CompileContext::new(options.clone(), cache.clone(), graph.clone(), hooks.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                internal_tasks,
                user_tasks,
                transformers,
                hooks,
                cache,
                graph,
                tasks: Mutex::new(Some(Arc::new(tasks))),
                context: Mutex::new(Arc::new(context)),
                state: Mutex::new(State::Idle),
                running: AtomicBool::new(false),
                compiling: AtomicBool::new(false),
                init: OnceCell::new(),
                build_lock: tokio::sync::Mutex::new(()),
                queue: SerialQueue::new(),
                progress: Mutex::new(None),
                #[cfg(feature = "live")]
                watchers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Load the options from a JSON configuration file.
    pub fn from_config(path: impl AsRef<Utf8Path>, registry: Registry) -> Result<Self, ConfigError> {
        Self::new(Options::load(path)?, registry)
    }

    pub fn options(&self) -> &Arc<ResolvedOptions> {
        &self.inner.options
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.inner.hooks
    }

    pub fn state(&self) -> State {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: State) {
        *lock(&self.inner.state) = state;
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_compiling(&self) -> bool {
        self.inner.compiling.load(Ordering::SeqCst)
    }

    /// The compile context of the latest build.
    pub fn context(&self) -> Arc<CompileContext> {
        lock(&self.inner.context).clone()
    }

    fn refresh_context(&self) -> Arc<CompileContext> {
        let context = Arc::new(CompileContext::new(
            self.inner.options.clone(),
            self.inner.cache.clone(),
            self.inner.graph.clone(),
            self.inner.hooks.clone(),
        ));
        *lock(&self.inner.context) = context.clone();
        context
    }

    pub fn query<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        lock(&self.inner.cache).query(key, default)
    }

    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        lock(&self.inner.cache).set(key, value)
    }

    /// Task type of a file: its extension, with every image extension
    /// collapsed into [`IMG_TYPE`].
    pub fn task_type(&self, path: impl AsRef<Utf8Path>) -> String {
        let extension = path.as_ref().extension().unwrap_or_default();

        if self.inner.options.img_type.iter().any(|t| t == extension) {
            IMG_TYPE.to_string()
        } else {
            extension.to_string()
        }
    }

    fn task_registry(&self) -> Result<Arc<TaskRegistry>, ConfigError> {
        if let Some(tasks) = lock(&self.inner.tasks).as_ref() {
            return Ok(tasks.clone());
        }
        self.normalize_tasks()
    }

    fn normalize_tasks(&self) -> Result<Arc<TaskRegistry>, ConfigError> {
        let tasks = Arc::new(TaskRegistry::new(
            &self.inner.internal_tasks,
            &self.inner.user_tasks,
            &self.inner.options,
        )?);
        *lock(&self.inner.tasks) = Some(tasks.clone());
        Ok(tasks)
    }

    /// The task registered for a type, internal tasks first.
    pub fn task_config(&self, task_type: &str) -> Result<Option<Task>, ConfigError> {
        Ok(self.task_registry()?.get(task_type).cloned())
    }

    /// Like [`Compiler::task_config`], with the [`TaskSpec`] adjusted by
    /// `overrides`. Functional tasks are returned as they are.
    pub fn task_config_with<F>(&self, task_type: &str, overrides: F) -> Result<Option<Task>, ConfigError>
    where
        F: FnOnce(&mut TaskSpec),
    {
        let task = match self.task_config(task_type)? {
            Some(Task::Declarative(spec)) => {
                let mut spec = TaskSpec::clone(&spec);
                overrides(&mut spec);
                Some(Task::Declarative(Arc::new(spec)))
            }
            other => other,
        };
        Ok(task)
    }

    /// Run a full build. Rejected while another full build is running.
    pub async fn run(&self) -> Result<(), BuildError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(BuildError::AlreadyRunning);
        }

        let result = self.full_build().await;
        self.inner.running.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            self.log_error(e);
        }
        result
    }

    async fn full_build(&self) -> Result<(), BuildError> {
        let _guard = self.inner.build_lock.lock().await;
        let result = self.build().await;
        self.settle(0);
        result
    }

    /// Leave the build state while the build lock is still held. `own` is the
    /// number of queued jobs belonging to the caller itself.
    fn settle(&self, own: usize) {
        let state = if self.inner.queue.pending() > own {
            State::QueuedIncrement
        } else {
            State::Idle
        };
        self.set_state(state);
    }

    async fn build(&self) -> Result<(), BuildError> {
        let start = Instant::now();

        self.ensure_init().await?;
        let tasks = self.normalize_tasks()?;
        let ctx = self.refresh_context();

        self.clean(&ctx).await?;
        self.run_tasks(&ctx, &tasks.internal, &tasks.user, "Compiling")
            .await?;

        tracing::info!("build finished {}", as_overhead(start));
        Ok(())
    }

    async fn ensure_init(&self) -> Result<(), BuildError> {
        self.inner
            .init
            .get_or_try_init(|| async {
                self.set_state(State::Initializing);
                let event = HookEvent::new(Phase::Init, self.context());
                self.inner.hooks.invoke(event).await
            })
            .await?;
        Ok(())
    }

    /// Drop graph nodes and cache entries of files no longer on disk.
    async fn clean(&self, ctx: &Arc<CompileContext>) -> Result<(), BuildError> {
        self.set_state(State::Cleaning);

        let mut expired: BTreeSet<Utf8PathBuf> = ctx.graph().expired().into_iter().collect();
        let cached = ctx.cache().artifact_sources();
        expired.extend(cached.into_iter().filter(|path| !path.exists()));
        let expired: Vec<_> = expired.into_iter().collect();

        let event = HookEvent::new(Phase::Clean, ctx.clone()).with_expired(&expired);
        self.inner.hooks.invoke(event).await?;

        if expired.is_empty() {
            return Ok(());
        }

        let snapshot = {
            let mut graph = ctx.graph();
            for path in &expired {
                graph.remove_node(path);
            }
            graph.snapshot()
        };
        ctx.save(KEY_GRAPH, &snapshot)?;
        ctx.cache().remove_artifacts(&expired)?;

        tracing::info!("pruned {} expired files", expired.len());
        Ok(())
    }

    async fn run_tasks(
        &self,
        ctx: &Arc<CompileContext>,
        internal: &BTreeMap<String, Task>,
        user: &BTreeMap<String, Task>,
        message: &str,
    ) -> Result<(), BuildError> {
        let plan = Plan::new(internal, user)?;
        let progress = Arc::new(Progress::new(message));
        *lock(&self.inner.progress) = Some(progress.clone());

        self.inner.compiling.store(true, Ordering::SeqCst);
        self.set_state(State::Compiling);

        let span = progress.span().clone();
        let result = self
            .compile(ctx, &plan, &progress)
            .instrument(span)
            .await;

        self.inner.compiling.store(false, Ordering::SeqCst);

        if result.is_err()
            && let Err(e) = ctx.cache().flush()
        {
            tracing::warn!("couldn't save the compile cache: {e}");
        }
        result
    }

    async fn compile(
        &self,
        ctx: &Arc<CompileContext>,
        plan: &Plan,
        progress: &Progress,
    ) -> Result<(), BuildError> {
        progress.append(plan.work());

        let hooks = &self.inner.hooks;
        hooks
            .invoke(HookEvent::new(Phase::BeforeCompile, ctx.clone()))
            .await?;

        if !plan.is_empty() {
            plan.execute(ctx, &self.inner.transformers, progress).await?;
            finalize(ctx)?;
        }

        hooks
            .invoke(HookEvent::new(Phase::AfterCompile, ctx.clone()))
            .await?;

        Ok(())
    }

    /// Queue a rebuild of `paths`. Relative paths are taken from the source
    /// directory. Files whose task asks for ancestor propagation pull in
    /// everything that transitively depends on them. Types without a task
    /// are skipped with a warning. Returns `None` when nothing is left to
    /// compile.
    pub fn increment_compile<P>(
        &self,
        paths: impl IntoIterator<Item = P>,
    ) -> Result<Option<IncrementHandle>, BuildError>
    where
        P: AsRef<Utf8Path>,
    {
        let registry = self.task_registry()?;
        let source_dir = &self.inner.options.source_dir;

        let changed: Vec<Utf8PathBuf> = paths
            .into_iter()
            .map(|path| normalize(&source_dir.join(path.as_ref())))
            .collect();

        let mut expanded = BTreeSet::new();
        {
            let graph = lock(&self.inner.graph);
            for path in changed {
                let propagate = registry
                    .get(&self.task_type(&path))
                    .and_then(Task::spec)
                    .is_some_and(|spec| spec.propagate_to_ancestors);

                if propagate {
                    expanded.extend(graph.trace_reverse_dependents(&path));
                }
                expanded.insert(path);
            }
        }

        let mut groups: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
        for path in expanded {
            groups.entry(self.task_type(&path)).or_default().push(path);
        }

        let mut tasks = BTreeMap::new();
        for (task_type, paths) in groups {
            match registry.get(&task_type) {
                Some(Task::Declarative(spec)) => {
                    let spec = spec.restricted_to(&paths);
                    tasks.insert(task_type, Task::Declarative(Arc::new(spec)));
                }
                Some(task @ Task::Functional(_)) => {
                    tasks.insert(task_type, task.clone());
                }
                None => {
                    let message = format!("Compiling .{task_type} files is not supported!");
                    tracing::warn!("{}", style(message).yellow());
                }
            }
        }

        if tasks.is_empty() {
            return Ok(None);
        }

        {
            let mut state = lock(&self.inner.state);
            if *state == State::Idle {
                *state = State::QueuedIncrement;
            }
        }

        let compiler = self.clone();
        let handle = self
            .inner
            .queue
            .push(async move { compiler.run_increment(tasks).await })
            .inspect_err(|_| {
                let mut state = lock(&self.inner.state);
                if *state == State::QueuedIncrement && self.inner.queue.pending() == 0 {
                    *state = State::Idle;
                }
            })?;

        Ok(Some(handle))
    }

    async fn run_increment(&self, tasks: BTreeMap<String, Task>) -> Result<(), BuildError> {
        let _guard = self.inner.build_lock.lock().await;
        let start = Instant::now();

        let result = self.increment(&tasks).await;
        self.settle(1);

        match &result {
            Ok(()) => tracing::info!("recompiled {} {}", names(&tasks), as_overhead(start)),
            Err(e) => self.log_error(e),
        }
        result
    }

    async fn increment(&self, tasks: &BTreeMap<String, Task>) -> Result<(), BuildError> {
        self.ensure_init().await?;
        let ctx = self.refresh_context();
        self.run_tasks(&ctx, &BTreeMap::new(), tasks, "Recompiling")
            .await
    }

    /// The single sink for errors raised by builds, increments and watchers.
    /// Stops the progress bar of the current build.
    pub fn log_error(&self, error: &dyn std::error::Error) {
        if let Some(progress) = lock(&self.inner.progress).as_ref() {
            progress.stop();
        }
        tracing::error!("{}", style(error).red());
    }

    /// Build once, then keep rebuilding on changes until [`Compiler::stop`].
    /// A failing initial build is logged and the watchers are attached
    /// regardless, so fixing the file triggers a new attempt.
    #[cfg(feature = "live")]
    pub async fn watch(&self) -> Result<(), crate::error::WatchError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(BuildError::AlreadyRunning.into());
        }

        // run() would reject itself while the flag is held
        let result = self.full_build().await;
        self.inner.running.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            self.log_error(e);
        }

        let source = crate::watch::source_watcher(self)?;
        let package = crate::watch::package_watcher(self)?;
        lock(&self.inner.watchers).extend([source, package]);

        Ok(())
    }

    /// Detach every watcher. A build in progress runs to completion.
    #[cfg(feature = "live")]
    pub fn stop(&self) {
        let watchers = std::mem::take(&mut *lock(&self.inner.watchers));
        if !watchers.is_empty() {
            tracing::info!("stopped {} watchers", watchers.len());
        }
    }

    #[cfg(feature = "live")]
    pub fn is_watching(&self) -> bool {
        !lock(&self.inner.watchers).is_empty()
    }
}

fn names(tasks: &BTreeMap<String, Task>) -> String {
    tasks.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KEY_ENV;
    use crate::transform::{SourceFile, Stage};
    use async_trait::async_trait;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records `start`/`end` of every file, turns `@import x` lines into
    /// dependencies.
    struct Record {
        log: Log,
        delay: u64,
    }

    #[async_trait]
    impl Stage for Record {
        async fn process(&self, mut file: SourceFile) -> anyhow::Result<Vec<SourceFile>> {
            let name = file.relative().to_string();
            self.log.lock().unwrap().push(format!("start {name}"));

            if self.delay > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay)).await;
            }

            let imports: Vec<String> = file
                .text()?
                .lines()
                .filter_map(|line| line.strip_prefix("@import "))
                .map(|request| request.trim().to_string())
                .collect();

            for request in imports {
                file.context.depend_on(&request);
            }

            self.log.lock().unwrap().push(format!("end {name}"));
            Ok(vec![file])
        }
    }

    struct Project {
        _temp: tempfile::TempDir,
        root: Utf8PathBuf,
        log: Log,
    }

    impl Project {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
            Self {
                _temp: temp,
                root,
                log: Log::default(),
            }
        }

        fn src(&self, name: &str) -> Utf8PathBuf {
            self.root.join("src").join(name)
        }

        fn dist(&self, name: &str) -> Utf8PathBuf {
            self.root.join("dist").join(name)
        }

        fn write(&self, name: &str, text: &str) {
            let path = self.src(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }

        fn options(&self, tasks: &[(&str, TaskDecl)]) -> Options {
            Options {
                config: self.root.join("tsumiki.json"),
                source: "src".into(),
                output: Some("dist".into()),
                tasks: tasks
                    .iter()
                    .map(|(name, decl)| (name.to_string(), decl.clone()))
                    .collect(),
                ..Default::default()
            }
        }

        fn registry(&self) -> Registry {
            let mut registry = Registry::new();
            let log = self.log.clone();
            registry.set_transformer("record", move |options: &serde_json::Value| {
                Ok(Record {
                    log: log.clone(),
                    delay: options["delay"].as_u64().unwrap_or(0),
                })
            });
            registry
        }

        fn compiler(&self, tasks: &[(&str, TaskDecl)]) -> Compiler {
            Compiler::new(self.options(tasks), self.registry()).unwrap()
        }

        /// Files that entered the transform chain, drained.
        fn compiled(&self) -> BTreeSet<String> {
            self.log
                .lock()
                .unwrap()
                .drain(..)
                .filter_map(|entry| entry.strip_prefix("start ").map(String::from))
                .collect()
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().drain(..).collect()
        }
    }

    fn less(ancestors: bool) -> TaskDecl {
        TaskDecl::new()
            .test("**/*.less")
            .transform("record")
            .compile_ancestor(ancestors)
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// a.less, b.less importing a.less, and an independent c.less.
    fn diamond(project: &Project) {
        project.write("a.less", "@a: 1;");
        project.write("b.less", "@import ./a.less\n.b {}");
        project.write("c.less", ".c {}");
    }

    #[tokio::test]
    async fn test_unchanged_files_hit_the_cache() {
        let project = Project::new();
        diamond(&project);
        let compiler = project.compiler(&[("less", less(false))]);

        compiler.run().await.unwrap();
        assert_eq!(project.compiled(), set(&["a.less", "b.less", "c.less"]));
        let first = fs::read(project.dist("b.less")).unwrap();

        compiler.run().await.unwrap();
        assert!(project.compiled().is_empty());
        assert_eq!(fs::read(project.dist("b.less")).unwrap(), first);

        assert_eq!(compiler.state(), State::Idle);
        assert!(!compiler.is_running());
        assert!(!compiler.is_compiling());
    }

    #[tokio::test]
    async fn test_changed_dependency_invalidates_dependent() {
        let project = Project::new();
        diamond(&project);
        let compiler = project.compiler(&[("less", less(false))]);

        compiler.run().await.unwrap();
        project.compiled();

        project.write("a.less", "@a: 2;");
        compiler.run().await.unwrap();

        assert_eq!(project.compiled(), set(&["a.less", "b.less"]));
    }

    #[tokio::test]
    async fn test_ancestor_propagation() {
        let project = Project::new();
        diamond(&project);
        let compiler = project.compiler(&[("less", less(true))]);

        compiler.run().await.unwrap();
        project.compiled();

        let handle = compiler
            .increment_compile([project.src("a.less")])
            .unwrap()
            .unwrap();
        handle.wait().await.unwrap().unwrap();

        assert_eq!(project.compiled(), set(&["a.less", "b.less"]));
    }

    #[tokio::test]
    async fn test_no_ancestor_propagation() {
        let project = Project::new();
        diamond(&project);
        let compiler = project.compiler(&[("less", less(false))]);

        compiler.run().await.unwrap();
        project.compiled();

        let handle = compiler.increment_compile(["a.less"]).unwrap().unwrap();
        handle.wait().await.unwrap().unwrap();

        assert_eq!(project.compiled(), set(&["a.less"]));
    }

    #[tokio::test]
    async fn test_increment_bypasses_cache() {
        let project = Project::new();
        diamond(&project);
        let compiler = project.compiler(&[("less", less(false))]);

        compiler.run().await.unwrap();
        project.compiled();

        // unchanged on disk, still recompiled
        let handle = compiler.increment_compile(["c.less"]).unwrap().unwrap();
        handle.wait().await.unwrap().unwrap();

        assert_eq!(project.compiled(), set(&["c.less"]));
    }

    #[tokio::test]
    async fn test_stale_cleanup() {
        let project = Project::new();
        diamond(&project);

        let expired = Arc::new(Mutex::new(Vec::new()));
        let mut registry = project.registry();
        let seen = expired.clone();
        registry.install_hook(Phase::Clean, move |event| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().extend(event.expired.iter().cloned());
                Ok::<_, anyhow::Error>(())
            }
        });

        let options = project.options(&[("less", less(false))]);
        let compiler = Compiler::new(options, registry).unwrap();
        compiler.run().await.unwrap();

        let a = project.src("a.less");
        let b = project.src("b.less");
        let ctx = compiler.context();
        assert!(ctx.graph_node(&b).unwrap().dependencies.contains(&a));
        assert!(ctx.cache().artifact(&a).is_some());

        fs::remove_file(&a).unwrap();
        compiler.run().await.unwrap();

        assert_eq!(*expired.lock().unwrap(), vec![a.clone()]);
        let ctx = compiler.context();
        assert!(ctx.graph_node(&a).is_none());
        assert!(ctx.graph_node(&b).unwrap().dependencies.is_empty());
        assert!(ctx.cache().artifact(&a).is_none());

        let snapshot: GraphSnapshot = compiler.query(KEY_GRAPH, GraphSnapshot::default());
        assert!(!snapshot.nodes.contains_key(&a));
    }

    #[tokio::test]
    async fn test_increments_never_overlap() {
        let project = Project::new();
        diamond(&project);
        let decl = TaskDecl::new()
            .test("**/*.less")
            .transform_with("record", serde_json::json!({ "delay": 30 }));
        let compiler = project.compiler(&[("less", decl)]);

        let first = compiler.increment_compile(["a.less"]).unwrap().unwrap();
        let second = compiler.increment_compile(["c.less"]).unwrap().unwrap();

        second.wait().await.unwrap().unwrap();
        first.wait().await.unwrap().unwrap();

        assert_eq!(
            project.entries(),
            ["start a.less", "end a.less", "start c.less", "end c.less"]
        );
    }

    /// Collects formatted log lines of the current thread.
    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Logs {
        fn capture(&self) -> tracing::subscriber::DefaultGuard {
            let logs = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer(move || logs.clone())
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_unsupported_type_is_skipped() {
        let project = Project::new();
        project.write("a.xyz", "?");
        project.write("b.js", "let b;");
        let js = TaskDecl::new().test("**/*.js").transform("record");
        let compiler = project.compiler(&[("js", js)]);

        let logs = Logs::default();
        let _guard = logs.capture();

        let handle = compiler
            .increment_compile(["a.xyz", "b.js"])
            .unwrap()
            .unwrap();
        handle.wait().await.unwrap().unwrap();

        assert!(logs.text().contains("WARN"));
        assert!(logs.text().contains("Compiling .xyz files is not supported!"));
        assert!(!logs.text().contains("Compiling .js files"));

        assert_eq!(project.compiled(), set(&["b.js"]));
        assert!(project.dist("b.js").exists());
        assert!(!project.dist("a.xyz").exists());

        assert!(compiler.increment_compile(["a.xyz"]).unwrap().is_none());
        assert_eq!(compiler.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_reverted_source_after_increment() {
        let project = Project::new();
        project.write("a.less", "v1");
        let compiler = project.compiler(&[("less", less(false))]);
        let output = project.dist("a.less");

        compiler.run().await.unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "v1");

        project.write("a.less", "v2");
        let handle = compiler.increment_compile(["a.less"]).unwrap().unwrap();
        handle.wait().await.unwrap().unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "v2");
        assert!(compiler.context().cache().artifact(&project.src("a.less")).is_none());

        project.write("a.less", "v1");
        compiler.run().await.unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_cache_hit_replaces_stale_output() {
        let project = Project::new();
        project.write("a.less", "v1");
        let compiler = project.compiler(&[("less", less(false))]);
        let output = project.dist("a.less");

        compiler.run().await.unwrap();
        fs::write(&output, "edited by hand").unwrap();
        project.compiled();

        compiler.run().await.unwrap();

        assert!(project.compiled().is_empty());
        assert_eq!(fs::read_to_string(&output).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_queued_increment_state() {
        let project = Project::new();
        diamond(&project);
        let decl = TaskDecl::new()
            .test("**/*.less")
            .transform_with("record", serde_json::json!({ "delay": 40 }));
        let compiler = project.compiler(&[("less", decl)]);

        let (built, handle) = tokio::join!(compiler.run(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let handle = compiler.increment_compile(["c.less"]).unwrap().unwrap();
            assert_eq!(compiler.state(), State::Compiling);
            handle
        });

        built.unwrap();
        assert_eq!(compiler.state(), State::QueuedIncrement);

        handle.wait().await.unwrap().unwrap();
        assert_eq!(compiler.state(), State::Idle);
    }

    #[test]
    fn test_missing_use_fails_before_io() {
        let project = Project::new();
        let options = project.options(&[("js", TaskDecl::new().test("**/*.js"))]);

        let result = Compiler::new(options, project.registry());

        assert!(matches!(result, Err(ConfigError::MissingUse(name)) if name == "js"));
        assert!(!project.root.join(".tsumiki").exists());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let project = Project::new();
        diamond(&project);
        let compiler = project.compiler(&[("less", less(false))]);

        let (first, second) = tokio::join!(compiler.run(), compiler.run());

        assert!(first.is_ok());
        assert!(matches!(second, Err(BuildError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_hook_phases_in_order() {
        let project = Project::new();
        diamond(&project);

        let phases = Log::default();
        let mut registry = project.registry();
        for phase in Phase::ALL {
            let phases = phases.clone();
            registry.install_hook(phase, move |event| {
                let phases = phases.clone();
                async move {
                    phases.lock().unwrap().push(event.phase.to_string());
                    Ok::<_, anyhow::Error>(())
                }
            });
        }

        let compiler = Compiler::new(project.options(&[("less", less(false))]), registry).unwrap();
        compiler.run().await.unwrap();
        compiler.run().await.unwrap();

        assert_eq!(
            *phases.lock().unwrap(),
            [
                "init",
                "clean",
                "beforeCompile",
                "afterCompile",
                "clean",
                "beforeCompile",
                "afterCompile"
            ]
        );
    }

    #[tokio::test]
    async fn test_tap_fires_once() {
        let project = Project::new();
        diamond(&project);
        let compiler = project.compiler(&[("less", less(false))]);

        let phases = Log::default();
        let tapped = phases.clone();
        compiler.context().tap(Phase::AfterCompile, move |event| {
            let tapped = tapped.clone();
            async move {
                tapped.lock().unwrap().push(event.phase.to_string());
                Ok::<_, anyhow::Error>(())
            }
        });

        compiler.run().await.unwrap();
        compiler.run().await.unwrap();

        assert_eq!(*phases.lock().unwrap(), ["afterCompile"]);
    }

    #[tokio::test]
    async fn test_failing_hook_aborts_build() {
        let project = Project::new();
        diamond(&project);

        let mut registry = project.registry();
        registry.install_hook(Phase::BeforeCompile, |_| async {
            Err::<(), _>(anyhow::anyhow!("no network"))
        });

        let compiler = Compiler::new(project.options(&[("less", less(false))]), registry).unwrap();
        let err = compiler.run().await.unwrap_err();

        assert!(matches!(err, BuildError::Hook(ref e) if e.phase == Phase::BeforeCompile));
        assert!(project.compiled().is_empty());
        assert!(!compiler.is_running());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let project = Project::new();
        diamond(&project);

        let compiler = project.compiler(&[("less", less(false))]);
        compiler.run().await.unwrap();
        compiler.save("custom", &[1, 2, 3]).unwrap();
        drop(compiler);
        project.compiled();

        let compiler = project.compiler(&[("less", less(true))]);
        assert_eq!(compiler.query(KEY_ENV, String::new()), "development");
        assert_eq!(compiler.query("custom", Vec::<u32>::new()), [1, 2, 3]);

        // the restored graph drives propagation before any full build
        let handle = compiler.increment_compile(["a.less"]).unwrap().unwrap();
        handle.wait().await.unwrap().unwrap();
        assert_eq!(project.compiled(), set(&["a.less", "b.less"]));
    }

    #[test]
    fn test_task_types() {
        let project = Project::new();
        let compiler = project.compiler(&[]);

        assert_eq!(compiler.task_type("/p/src/logo.png"), IMG_TYPE);
        assert_eq!(compiler.task_type("/p/src/icon.svg"), IMG_TYPE);
        assert_eq!(compiler.task_type("/p/src/app.less"), "less");
        assert_eq!(compiler.task_type("/p/src/Makefile"), "");
    }

    #[test]
    fn test_task_config_overrides() {
        let project = Project::new();
        let compiler = project.compiler(&[("less", less(true))]);

        let task = compiler
            .task_config_with("less", |spec| spec.cacheable = false)
            .unwrap()
            .unwrap();
        assert!(!task.spec().unwrap().cacheable);

        let original = compiler.task_config("less").unwrap().unwrap();
        assert!(original.spec().unwrap().cacheable);
        assert!(compiler.task_config("wxml").unwrap().is_none());
    }
}
