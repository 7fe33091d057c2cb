//! Lifecycle hooks.
//!
//! Four extension points fire around every build: [`Phase::Init`] once per
//! compiler, then [`Phase::Clean`], [`Phase::BeforeCompile`] and
//! [`Phase::AfterCompile`] for every full build or increment. Handlers of a
//! phase are awaited one after another in registration order, the first
//! failure aborts the rest of the chain and the phase itself.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use futures::future::BoxFuture;

use crate::context::CompileContext;
use crate::error::HookError;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Clean,
    BeforeCompile,
    AfterCompile,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Init,
        Phase::Clean,
        Phase::BeforeCompile,
        Phase::AfterCompile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Clean => "clean",
            Phase::BeforeCompile => "beforeCompile",
            Phase::AfterCompile => "afterCompile",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown hook phase '{0}'")]
pub struct UnknownPhase(String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

/// What a handler receives.
#[derive(Clone)]
pub struct HookEvent {
    pub phase: Phase,
    /// Files removed by the cleanup step, only populated for `clean`.
    pub expired: Arc<[Utf8PathBuf]>,
    pub context: Arc<CompileContext>,
}

impl HookEvent {
    pub fn new(phase: Phase, context: Arc<CompileContext>) -> Self {
        Self {
            phase,
            expired: Arc::from([]),
            context,
        }
    }

    pub fn with_expired(mut self, expired: &[Utf8PathBuf]) -> Self {
        self.expired = Arc::from(expired);
        self
    }
}

pub type HookFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A type-erased hook handler.
pub type HookHandler = Arc<dyn Fn(HookEvent) -> HookFuture + Send + Sync>;

/// Erase an async closure into a [`HookHandler`].
pub fn handler<F, Fut>(f: F) -> HookHandler
where
    F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

struct Entry {
    handler: HookHandler,
    once: bool,
}

/// Ordered handler lists per phase.
#[derive(Default)]
pub struct HookBus {
    phases: Mutex<BTreeMap<Phase, Vec<Entry>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install<F, Fut>(&self, phase: Phase, f: F)
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(phase, handler(f), false);
    }

    /// Install a handler which is dropped after it fires once.
    pub fn install_once<F, Fut>(&self, phase: Phase, f: F)
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(phase, handler(f), true);
    }

    /// Install a whole mapping of handlers at once.
    pub fn install_all(&self, hooks: impl IntoIterator<Item = (Phase, HookHandler)>) {
        for (phase, handler) in hooks {
            self.push(phase, handler, false);
        }
    }

    fn push(&self, phase: Phase, handler: HookHandler, once: bool) {
        lock(&self.phases)
            .entry(phase)
            .or_default()
            .push(Entry { handler, once });
    }

    pub fn len(&self, phase: Phase) -> usize {
        lock(&self.phases).get(&phase).map_or(0, Vec::len)
    }

    /// Run the handlers of `event.phase` strictly in order. Resolves
    /// immediately when the phase has no handlers.
    pub async fn invoke(&self, event: HookEvent) -> Result<(), HookError> {
        let phase = event.phase;

        let handlers: Vec<HookHandler> = {
            let mut phases = lock(&self.phases);
            match phases.get_mut(&phase) {
                Some(entries) => {
                    let handlers = entries.iter().map(|e| e.handler.clone()).collect();
                    entries.retain(|e| !e.once);
                    handlers
                }
                None => Vec::new(),
            }
        };

        for handler in handlers {
            handler(event.clone())
                .await
                .map_err(|source| HookError { phase, source })?;
        }

        Ok(())
    }
}
