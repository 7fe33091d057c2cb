//! Watch mode.
//!
//! Two debounced watchers are attached once the initial build is done:
//!
//! 1. **Source watcher**: recursive over the source directory and every alias
//!    root outside of it. Created and modified files are handed to
//!    [`Compiler::increment_compile`], which queues them behind any build in
//!    progress.
//! 2. **Package watcher**: non-recursive over the base directory, a change to
//!    `package.json` triggers a full rebuild.
//!
//! Debouncer callbacks run on the notify thread, they only forward events
//! into the tokio runtime.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::compiler::Compiler;
use crate::error::{BuildError, WatchError};
use crate::utils::is_hidden;

const DEBOUNCE: Duration = Duration::from_millis(250);

const PACKAGE_JSON: &str = "package.json";

/// A live debouncer and the task consuming its events. Dropping it stops both.
pub struct Watcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    task: JoinHandle<()>,
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn debounced() -> Result<
    (
        Debouncer<RecommendedWatcher, RecommendedCache>,
        mpsc::UnboundedReceiver<DebounceEventResult>,
    ),
    WatchError,
> {
    let (tx, rx) = mpsc::unbounded_channel();
    let debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
        // receiver gone means the watcher is being dropped
        let _ = tx.send(result);
    })?;
    Ok((debouncer, rx))
}

pub(crate) fn source_watcher(compiler: &Compiler) -> Result<Watcher, WatchError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
    let (mut debouncer, mut rx) = debounced()?;

    let options = compiler.options();
    let roots: HashSet<_> = std::iter::once(options.source_dir.clone())
        .chain(options.alias.values().cloned())
        .filter(|path| path.is_dir())
        .collect();
    let roots = collapse_watch_paths(roots);

    for root in &roots {
        tracing::info!("watching {root}");
        debouncer.watch(root, RecursiveMode::Recursive)?;
    }

    let compiler = compiler.clone();
    let task = runtime.spawn(async move {
        while let Some(result) = rx.recv().await {
            let events = match result {
                Ok(events) => events,
                Err(errors) => {
                    for error in errors {
                        compiler.log_error(&WatchError::from(error));
                    }
                    continue;
                }
            };

            let changes = classify(events.iter().map(|de| &de.event), &roots);
            for path in &changes.removed {
                tracing::info!("removed {path}");
            }

            if changes.changed.is_empty() {
                continue;
            }

            tracing::info!("{} files changed", changes.changed.len());
            // the queued job logs its own failure
            if let Err(e) = compiler.increment_compile(&changes.changed) {
                compiler.log_error(&e);
            }
        }
    });

    Ok(Watcher {
        _debouncer: debouncer,
        task,
    })
}

pub(crate) fn package_watcher(compiler: &Compiler) -> Result<Watcher, WatchError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
    let (mut debouncer, mut rx) = debounced()?;

    let base_dir = compiler.options().base_dir.clone();
    debouncer.watch(&base_dir, RecursiveMode::NonRecursive)?;

    let compiler = compiler.clone();
    let task = runtime.spawn(async move {
        while let Some(result) = rx.recv().await {
            let events = match result {
                Ok(events) => events,
                Err(errors) => {
                    for error in errors {
                        compiler.log_error(&WatchError::from(error));
                    }
                    continue;
                }
            };

            let touched = events.iter().any(|de| {
                is_content_change(&de.event.kind)
                    && de
                        .event
                        .paths
                        .iter()
                        .any(|path| path.file_name().is_some_and(|name| name == PACKAGE_JSON))
            });

            if !touched {
                continue;
            }

            tracing::info!("{PACKAGE_JSON} changed, rebuilding...");
            match compiler.run().await {
                Err(BuildError::AlreadyRunning) => tracing::info!("a build is already running"),
                // run() logs everything else itself
                Ok(()) | Err(_) => {}
            }
        }
    });

    Ok(Watcher {
        _debouncer: debouncer,
        task,
    })
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(..) | EventKind::Modify(..))
}

#[derive(Debug, Default, PartialEq)]
struct Changes {
    changed: BTreeSet<Utf8PathBuf>,
    removed: BTreeSet<Utf8PathBuf>,
}

/// Sort raw events into files to recompile and files that are gone. Paths
/// hidden below their watch root are ignored.
fn classify<'a>(events: impl IntoIterator<Item = &'a Event>, roots: &[Utf8PathBuf]) -> Changes {
    let mut changes = Changes::default();

    for event in events {
        let removal = matches!(event.kind, EventKind::Remove(..));
        if !removal && !is_content_change(&event.kind) {
            continue;
        }

        for path in &event.paths {
            let Some(path) = Utf8Path::from_path(path) else {
                continue;
            };

            let Some(relative) = roots.iter().find_map(|root| path.strip_prefix(root).ok()) else {
                continue;
            };

            if is_hidden(relative) {
                continue;
            }

            if removal || !path.exists() {
                changes.changed.remove(path);
                changes.removed.insert(path.to_owned());
            } else if path.is_file() {
                changes.removed.remove(path);
                changes.changed.insert(path.to_owned());
            }
        }
    }

    changes
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// Watching `/a` recursively covers `/a/b`, so after sorting every path
/// nested in a previously accepted one is dropped.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
