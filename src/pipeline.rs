//! Turns normalized tasks into an executable build plan.
//!
//! A [`Plan`] has two groups, framework tasks first and user tasks second.
//! Tasks inside a group run concurrently; the second group starts only after
//! the first has finished. A declarative task streams each of its files
//! through: cache check, transform chain, output. Every input file reports
//! exactly one progress tick, whether it was a cache hit or not.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::try_join_all;
use futures::stream::{self, TryStreamExt};

use crate::cache::{ArtifactEntry, ArtifactFile, KEY_ENV, KEY_GRAPH};
use crate::context::CompileContext;
use crate::core::Hash32;
use crate::error::{BuildError, CacheError};
use crate::progress::Progress;
use crate::task::{Task, TaskSpec};
use crate::transform::{Pipeline, SourceFile, Transformers};

/// A task together with the files it was matched against.
struct Unit {
    name: String,
    task: Task,
    files: Vec<Utf8PathBuf>,
}

impl Unit {
    fn new(name: &str, task: &Task) -> Result<Self, BuildError> {
        let files = match task {
            Task::Declarative(spec) => spec.select()?,
            Task::Functional(_) => Vec::new(),
        };

        Ok(Self {
            name: name.to_string(),
            task: task.clone(),
            files,
        })
    }

    fn work(&self) -> u64 {
        match self.task {
            Task::Declarative(_) => self.files.len() as u64,
            Task::Functional(_) => 1,
        }
    }
}

pub struct Plan {
    internal: Vec<Unit>,
    user: Vec<Unit>,
}

impl Plan {
    /// Select the files of every declarative task.
    pub fn new(
        internal: &BTreeMap<String, Task>,
        user: &BTreeMap<String, Task>,
    ) -> Result<Self, BuildError> {
        let units = |tasks: &BTreeMap<String, Task>| -> Result<Vec<Unit>, BuildError> {
            tasks.iter().map(|(name, task)| Unit::new(name, task)).collect()
        };

        Ok(Self {
            internal: units(internal)?,
            user: units(user)?,
        })
    }

    /// Progress ticks this plan will report.
    pub fn work(&self) -> u64 {
        self.internal.iter().chain(&self.user).map(Unit::work).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.user.is_empty()
    }

    /// Number of input files per task, for logging and tests.
    pub fn files(&self) -> BTreeMap<&str, &[Utf8PathBuf]> {
        self.internal
            .iter()
            .chain(&self.user)
            .map(|unit| (unit.name.as_str(), unit.files.as_slice()))
            .collect()
    }

    /// Run the internal group to completion, then the user group.
    pub async fn execute(
        &self,
        ctx: &Arc<CompileContext>,
        transformers: &Transformers,
        progress: &Progress,
    ) -> Result<(), BuildError> {
        for group in [&self.internal, &self.user] {
            if group.is_empty() {
                continue;
            }

            try_join_all(
                group
                    .iter()
                    .map(|unit| run_unit(ctx, transformers, progress, unit)),
            )
            .await?;
        }

        Ok(())
    }
}

/// Persist the dependency graph and the build environment.
pub fn finalize(ctx: &CompileContext) -> Result<(), CacheError> {
    let snapshot = ctx.graph().snapshot();
    let mut cache = ctx.cache();
    cache.set(KEY_GRAPH, &snapshot)?;
    cache.set(KEY_ENV, &ctx.options.env)?;
    Ok(())
}

async fn run_unit(
    ctx: &Arc<CompileContext>,
    transformers: &Transformers,
    progress: &Progress,
    unit: &Unit,
) -> Result<(), BuildError> {
    match &unit.task {
        Task::Functional(task) => {
            task.run(ctx.task_context(&unit.name))
                .await
                .map_err(|e| BuildError::Task(unit.name.clone(), e))?;
            progress.increment();
            Ok(())
        }
        Task::Declarative(spec) => {
            let chain = Pipeline::build(transformers, &spec.transforms)?;
            let chain_hash = chain_fingerprint(spec);

            stream::iter(unit.files.iter().map(Ok::<_, BuildError>))
                .try_for_each_concurrent(ctx.options.concurrency, |path| {
                    let chain = &chain;
                    async move {
                        compile_file(ctx, spec, chain, chain_hash, path).await?;
                        progress.increment();
                        Ok(())
                    }
                })
                .await
        }
    }
}

/// Identity of a transform chain, part of every file fingerprint.
fn chain_fingerprint(spec: &TaskSpec) -> Hash32 {
    let chain = serde_json::to_vec(&spec.transforms).unwrap_or_default();
    Hash32::hash_parts([spec.name.as_bytes(), chain.as_slice()])
}

async fn compile_file(
    ctx: &Arc<CompileContext>,
    spec: &TaskSpec,
    chain: &Pipeline,
    chain_hash: Hash32,
    path: &Utf8Path,
) -> Result<(), BuildError> {
    let contents = tokio::fs::read(path).await?;
    let fingerprint = Hash32::hash_parts([chain_hash.as_bytes().as_slice(), contents.as_slice()]);

    if spec.cacheable && restore_cached(ctx, spec, path, fingerprint).await? {
        tracing::debug!("cache hit {path}");
        return Ok(());
    }

    let file = SourceFile {
        path: path.to_owned(),
        base: ctx.options.source_dir.clone(),
        contents,
        context: ctx.file_context(path),
    };

    let outputs = chain
        .run(file)
        .await
        .map_err(|source| BuildError::Transform {
            task: spec.name.clone(),
            file: path.to_owned(),
            source,
        })?;

    let mut custom_deps = BTreeSet::new();
    let mut depended = false;
    for output in &outputs {
        custom_deps.extend(output.context.custom_deps.iter().cloned());
        depended |= output.context.depended;
    }

    // only files that exist become graph nodes
    let deps: Vec<_> = custom_deps
        .into_iter()
        .filter(|dep| dep.as_path() != path && dep.is_file())
        .collect();

    ctx.graph().replace_dependencies(path, &deps);

    let files: Vec<_> = if spec.emits_output && !depended {
        outputs
            .into_iter()
            .map(|output| ArtifactFile {
                path: output.relative(),
                contents: output.contents,
            })
            .collect()
    } else {
        Vec::new()
    };

    write_outputs(&ctx.options.output_dir, &files).await?;

    if !spec.cacheable {
        // the output dir no longer matches the cached entry
        ctx.cache().forget_artifact(path);
    } else {
        let mut dep_hashes = BTreeMap::new();
        for dep in deps {
            let bytes = tokio::fs::read(&dep).await?;
            dep_hashes.insert(dep, Hash32::hash(bytes));
        }

        ctx.cache()
            .store_artifact(path, &spec.name, fingerprint, dep_hashes, &files)?;
    }

    Ok(())
}

/// Restore the outputs of `path` from the cache if nothing it was compiled
/// from has changed.
async fn restore_cached(
    ctx: &CompileContext,
    spec: &TaskSpec,
    path: &Utf8Path,
    fingerprint: Hash32,
) -> Result<bool, BuildError> {
    let Some(entry) = ctx.cache().artifact(path) else {
        return Ok(false);
    };

    if entry.task != spec.name || entry.fingerprint != fingerprint {
        return Ok(false);
    }

    if !dependencies_unchanged(&entry).await {
        return Ok(false);
    }

    let Some(files) = ctx.cache().load_artifact(&entry) else {
        return Ok(false);
    };

    ctx.graph()
        .replace_dependencies(path, entry.dependencies.keys());

    write_outputs(&ctx.options.output_dir, &files).await?;
    Ok(true)
}

async fn dependencies_unchanged(entry: &ArtifactEntry) -> bool {
    for (dep, hash) in &entry.dependencies {
        match tokio::fs::read(dep).await {
            Ok(bytes) if Hash32::hash(&bytes) == *hash => continue,
            _ => return false,
        }
    }
    true
}

/// Write emitted files under `output_dir`, replacing what is there.
async fn write_outputs(output_dir: &Utf8Path, files: &[ArtifactFile]) -> Result<(), BuildError> {
    for file in files {
        let target = output_dir.join(&file.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &file.contents).await?;
    }

    Ok(())
}
