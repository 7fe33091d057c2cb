//! Task declarations and their normalization.
//!
//! A task is declared either as data ([`DeclarativeDecl`], usually read from
//! the configuration file) or as an opaque async callable
//! ([`FunctionalTask`]). Declarations are normalized once per build run into
//! a [`Task`], which is directly executable: patterns are anchored under the
//! source directory and every transform chain entry carries concrete options.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::Deserialize;

use crate::context::TaskContext;
use crate::error::{BuildError, ConfigError};
use crate::options::{ResolvedOptions, normalize};

/// Produces match patterns from the resolved options.
pub type PatternFactory = Arc<dyn Fn(&ResolvedOptions) -> Vec<String> + Send + Sync>;

/// Produces transformer options from the resolved options.
pub type OptionsFactory = Arc<dyn Fn(&ResolvedOptions) -> serde_json::Value + Send + Sync>;

/// Build work that bypasses the file pipeline and the compile cache.
#[async_trait]
pub trait FunctionalTask: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> FunctionalTask for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Match patterns of a declarative task.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum Patterns {
    One(String),
    Many(Vec<String>),
    #[serde(skip)]
    Factory(PatternFactory),
}

/// Options for a single transform chain entry.
#[derive(Clone, Default)]
pub enum TransformOptions {
    /// Receive the whole resolved options object.
    #[default]
    Inherit,
    Value(serde_json::Value),
    Factory(OptionsFactory),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUse {
    Name(String),
    Pair(String, serde_json::Value),
}

/// One `(transformer name, options)` element of a transform chain.
#[derive(Clone, Deserialize)]
#[serde(from = "RawUse")]
pub struct UseEntry {
    pub name: String,
    pub options: TransformOptions,
}

impl From<RawUse> for UseEntry {
    fn from(raw: RawUse) -> Self {
        match raw {
            RawUse::Name(name) => UseEntry {
                name,
                options: TransformOptions::Inherit,
            },
            RawUse::Pair(name, serde_json::Value::Null) => UseEntry {
                name,
                options: TransformOptions::Inherit,
            },
            RawUse::Pair(name, value) => UseEntry {
                name,
                options: TransformOptions::Value(value),
            },
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum UseSpec {
    Many(Vec<UseEntry>),
    One(UseEntry),
}

impl UseSpec {
    fn into_entries(self) -> Vec<UseEntry> {
        match self {
            UseSpec::Many(entries) => entries,
            UseSpec::One(entry) => vec![entry],
        }
    }
}

fn yes() -> bool {
    true
}

/// A task declared as data: `{ test, use, compileAncestor?, cache?, output? }`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclarativeDecl {
    #[serde(default)]
    pub test: Option<Patterns>,
    #[serde(default, rename = "use")]
    pub uses: Option<UseSpec>,
    #[serde(default)]
    pub compile_ancestor: bool,
    #[serde(default = "yes")]
    pub cache: bool,
    #[serde(default = "yes")]
    pub output: bool,
}

impl Default for DeclarativeDecl {
    fn default() -> Self {
        Self {
            test: None,
            uses: None,
            compile_ancestor: false,
            cache: true,
            output: true,
        }
    }
}

/// A raw task declaration as registered under a task name.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum TaskDecl {
    Declarative(DeclarativeDecl),
    #[serde(skip)]
    Functional(Arc<dyn FunctionalTask>),
}

impl TaskDecl {
    /// Start an empty declarative task.
    pub fn new() -> Self {
        TaskDecl::Declarative(DeclarativeDecl::default())
    }

    pub fn functional<F>(task: F) -> Self
    where
        F: FunctionalTask + 'static,
    {
        TaskDecl::Functional(Arc::new(task))
    }

    fn decl(&mut self) -> Option<&mut DeclarativeDecl> {
        match self {
            TaskDecl::Declarative(decl) => Some(decl),
            TaskDecl::Functional(_) => None,
        }
    }

    /// Append a match pattern, relative to the source directory.
    pub fn test(mut self, pattern: impl Into<String>) -> Self {
        if let Some(decl) = self.decl() {
            decl.test = Some(match decl.test.take() {
                None => Patterns::One(pattern.into()),
                Some(Patterns::One(first)) => Patterns::Many(vec![first, pattern.into()]),
                Some(Patterns::Many(mut all)) => {
                    all.push(pattern.into());
                    Patterns::Many(all)
                }
                Some(Patterns::Factory(_)) => Patterns::One(pattern.into()),
            });
        }
        self
    }

    /// Compute the match patterns from the resolved options.
    pub fn test_with<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ResolvedOptions) -> Vec<String> + Send + Sync + 'static,
    {
        if let Some(decl) = self.decl() {
            decl.test = Some(Patterns::Factory(Arc::new(factory)));
        }
        self
    }

    fn push_use(mut self, entry: UseEntry) -> Self {
        if let Some(decl) = self.decl() {
            let mut entries = decl.uses.take().map(UseSpec::into_entries).unwrap_or_default();
            entries.push(entry);
            decl.uses = Some(UseSpec::Many(entries));
        }
        self
    }

    /// Append a transformer which receives the whole options object.
    pub fn transform(self, name: impl Into<String>) -> Self {
        self.push_use(UseEntry {
            name: name.into(),
            options: TransformOptions::Inherit,
        })
    }

    pub fn transform_with(self, name: impl Into<String>, options: serde_json::Value) -> Self {
        self.push_use(UseEntry {
            name: name.into(),
            options: TransformOptions::Value(options),
        })
    }

    pub fn transform_factory<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ResolvedOptions) -> serde_json::Value + Send + Sync + 'static,
    {
        self.push_use(UseEntry {
            name: name.into(),
            options: TransformOptions::Factory(Arc::new(factory)),
        })
    }

    pub fn compile_ancestor(mut self, yes: bool) -> Self {
        if let Some(decl) = self.decl() {
            decl.compile_ancestor = yes;
        }
        self
    }

    pub fn cache(mut self, yes: bool) -> Self {
        if let Some(decl) = self.decl() {
            decl.cache = yes;
        }
        self
    }

    pub fn output(mut self, yes: bool) -> Self {
        if let Some(decl) = self.decl() {
            decl.output = yes;
        }
        self
    }
}

impl Default for TaskDecl {
    fn default() -> Self {
        Self::new()
    }
}

/// A normalized declarative task, ready to be composed into a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    /// Absolute, forward-slash glob patterns. A leading `!` excludes.
    pub patterns: Vec<String>,
    pub transforms: Vec<(String, serde_json::Value)>,
    pub propagate_to_ancestors: bool,
    pub cacheable: bool,
    pub emits_output: bool,
}

impl TaskSpec {
    /// A copy of this task restricted to exactly `paths`, bypassing the cache.
    pub fn restricted_to(&self, paths: &[Utf8PathBuf]) -> TaskSpec {
        TaskSpec {
            patterns: paths
                .iter()
                .map(|path| Pattern::escape(&to_glob_path(path)))
                .collect(),
            cacheable: false,
            ..self.clone()
        }
    }

    /// Enumerate the files matched by this task, sorted and deduplicated.
    pub fn select(&self) -> Result<Vec<Utf8PathBuf>, BuildError> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();

        for pattern in &self.patterns {
            match pattern.strip_prefix('!') {
                Some(negated) => exclude.push(Pattern::new(negated)?),
                None => include.push(pattern),
            }
        }

        let mut files = Vec::new();
        for pattern in include {
            for path in glob::glob(pattern)? {
                let path = Utf8PathBuf::try_from(path?)?;
                if !path.is_file() {
                    continue;
                }
                if exclude.iter().any(|p| p.matches(&to_glob_path(&path))) {
                    continue;
                }
                files.push(path);
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// An executable task: either an opaque callable or a declarative spec.
#[derive(Clone)]
pub enum Task {
    Functional(Arc<dyn FunctionalTask>),
    Declarative(Arc<TaskSpec>),
}

impl Task {
    pub fn spec(&self) -> Option<&TaskSpec> {
        match self {
            Task::Declarative(spec) => Some(spec),
            Task::Functional(_) => None,
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Functional(_) => write!(f, "Task::Functional(*)"),
            Task::Declarative(spec) => f.debug_tuple("Task::Declarative").field(spec).finish(),
        }
    }
}

/// Convert a path into a portable glob string.
pub(crate) fn to_glob_path(path: &Utf8Path) -> String {
    path.as_str().replace('\\', "/")
}

fn anchor(source_dir: &Utf8Path, pattern: &str) -> String {
    let (negated, pattern) = match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let path = to_glob_path(&normalize(&source_dir.join(pattern)));

    if negated { format!("!{path}") } else { path }
}

/// Normalize a single declaration registered under `name`.
pub fn normalize_task(
    name: &str,
    decl: &TaskDecl,
    options: &ResolvedOptions,
    inherited: &serde_json::Value,
) -> Result<Task, ConfigError> {
    let decl = match decl {
        TaskDecl::Functional(task) => return Ok(Task::Functional(task.clone())),
        TaskDecl::Declarative(decl) => decl,
    };

    let test = decl
        .test
        .as_ref()
        .ok_or_else(|| ConfigError::MissingTest(name.to_string()))?;
    let uses = decl
        .uses
        .clone()
        .ok_or_else(|| ConfigError::MissingUse(name.to_string()))?
        .into_entries();

    if uses.is_empty() {
        return Err(ConfigError::MissingUse(name.to_string()));
    }

    let patterns = match test {
        Patterns::One(one) => vec![one.clone()],
        Patterns::Many(many) => many.clone(),
        Patterns::Factory(factory) => factory(options),
    };

    if patterns.is_empty() {
        return Err(ConfigError::MissingTest(name.to_string()));
    }

    let patterns = patterns
        .iter()
        .map(|p| anchor(&options.source_dir, p))
        .collect();

    let transforms = uses
        .into_iter()
        .map(|entry| {
            let options = match entry.options {
                TransformOptions::Inherit => inherited.clone(),
                TransformOptions::Value(value) => value,
                TransformOptions::Factory(factory) => factory(options),
            };
            (entry.name, options)
        })
        .collect();

    Ok(Task::Declarative(Arc::new(TaskSpec {
        name: name.to_string(),
        patterns,
        transforms,
        propagate_to_ancestors: decl.compile_ancestor,
        cacheable: decl.cache,
        emits_output: decl.output,
    })))
}

/// Normalize every declaration, failing on the first invalid one.
pub fn normalize_tasks(
    decls: &BTreeMap<String, TaskDecl>,
    options: &ResolvedOptions,
) -> Result<BTreeMap<String, Task>, ConfigError> {
    let inherited = options.to_value()?;

    decls
        .iter()
        .map(|(name, decl)| -> Result<_, ConfigError> {
            Ok((name.clone(), normalize_task(name, decl, options, &inherited)?))
        })
        .collect()
}

/// Normalized tasks of one build run, internal (framework) and user ones.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    pub internal: BTreeMap<String, Task>,
    pub user: BTreeMap<String, Task>,
}

impl TaskRegistry {
    pub fn new(
        internal: &BTreeMap<String, TaskDecl>,
        user: &BTreeMap<String, TaskDecl>,
        options: &ResolvedOptions,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            internal: normalize_tasks(internal, options)?,
            user: normalize_tasks(user, options)?,
        })
    }

    /// Look a task up by type, internal tasks shadow user ones.
    pub fn get(&self, task_type: &str) -> Option<&Task> {
        self.internal
            .get(task_type)
            .or_else(|| self.user.get(task_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn resolved() -> ResolvedOptions {
        let options = Options {
            config: "/project/tsumiki.json".into(),
            source: "src".into(),
            output: Some("dist".into()),
            ..Default::default()
        };
        options.resolve().unwrap().0
    }

    fn normalize_one(decl: TaskDecl) -> Result<Task, ConfigError> {
        let options = resolved();
        let inherited = options.to_value().unwrap();
        normalize_task("less", &decl, &options, &inherited)
    }

    #[test]
    fn test_missing_use_is_fatal() {
        let decl = TaskDecl::new().test("**/*.less");
        assert!(matches!(normalize_one(decl), Err(ConfigError::MissingUse(name)) if name == "less"));
    }

    #[test]
    fn test_missing_test_is_fatal() {
        let decl = TaskDecl::new().transform("less");
        assert!(matches!(normalize_one(decl), Err(ConfigError::MissingTest(_))));
    }

    #[test]
    fn test_single_pattern_is_anchored() {
        let decl = TaskDecl::new().test("**/*.less").transform("less");
        let task = normalize_one(decl).unwrap();
        let spec = task.spec().unwrap();

        assert_eq!(spec.patterns, vec!["/project/src/**/*.less".to_string()]);
        assert!(spec.cacheable);
        assert!(spec.emits_output);
        assert!(!spec.propagate_to_ancestors);
    }

    #[test]
    fn test_negated_pattern_keeps_marker() {
        let decl = TaskDecl::new()
            .test("**/*.less")
            .test("!**/_*.less")
            .transform("less");
        let task = normalize_one(decl).unwrap();

        assert_eq!(
            task.spec().unwrap().patterns,
            vec![
                "/project/src/**/*.less".to_string(),
                "!/project/src/**/_*.less".to_string()
            ]
        );
    }

    #[test]
    fn test_pattern_factory_receives_options() {
        let decl = TaskDecl::new()
            .test_with(|opts| vec![format!("**/*.{}", opts.img_type[0])])
            .transform("img");
        let task = normalize_one(decl).unwrap();

        assert_eq!(task.spec().unwrap().patterns, vec!["/project/src/**/*.png".to_string()]);
    }

    #[test]
    fn test_transform_options_default_to_build_options() {
        let decl = TaskDecl::new()
            .test("**/*.js")
            .transform("babel")
            .transform_with("minify", serde_json::json!({ "level": 2 }))
            .transform_factory("env", |opts| serde_json::json!(opts.env));
        let task = normalize_one(decl).unwrap();
        let transforms = &task.spec().unwrap().transforms;

        assert_eq!(transforms[0].0, "babel");
        assert_eq!(transforms[0].1["sourceDir"], "/project/src");
        assert_eq!(transforms[1].1, serde_json::json!({ "level": 2 }));
        assert_eq!(transforms[2].1, serde_json::json!("development"));
    }

    #[test]
    fn test_functional_passes_through() {
        let decl = TaskDecl::functional(|_ctx: TaskContext| async { Ok::<_, anyhow::Error>(()) });
        assert!(matches!(normalize_one(decl), Ok(Task::Functional(_))));
    }

    #[test]
    fn test_deserialize_declaration_shapes() {
        let tasks: BTreeMap<String, TaskDecl> = serde_json::from_str(
            r#"{
                "wxml": { "test": "**/*.wxml", "use": "wxml" },
                "less": {
                    "test": ["**/*.less", "!**/_*.less"],
                    "use": [["less", { "strict": true }], "px2rpx"],
                    "compileAncestor": true,
                    "cache": false
                },
                "json": { "test": "**/*.json", "use": ["json", null] }
            }"#,
        )
        .unwrap();

        let registry = TaskRegistry::new(&BTreeMap::new(), &tasks, &resolved()).unwrap();

        let less = registry.get("less").unwrap().spec().unwrap();
        assert_eq!(less.patterns.len(), 2);
        assert_eq!(less.transforms[0].1, serde_json::json!({ "strict": true }));
        assert_eq!(less.transforms[1].0, "px2rpx");
        assert!(less.propagate_to_ancestors);
        assert!(!less.cacheable);

        let json = registry.get("json").unwrap().spec().unwrap();
        assert_eq!(json.transforms[0].0, "json");
        assert_eq!(json.transforms[0].1["env"], "development");

        let wxml = registry.get("wxml").unwrap().spec().unwrap();
        assert_eq!(wxml.transforms.len(), 1);
    }

    #[test]
    fn test_restricted_to_bypasses_cache() {
        let decl = TaskDecl::new().test("**/*.less").transform("less");
        let task = normalize_one(decl).unwrap();
        let spec = task.spec().unwrap();

        let restricted = spec.restricted_to(&["/project/src/a[1].less".into()]);

        assert!(!restricted.cacheable);
        assert_eq!(restricted.patterns, vec!["/project/src/a[[]1[]].less".to_string()]);
        assert_eq!(restricted.transforms, spec.transforms);
    }
}
