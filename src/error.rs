use camino::Utf8PathBuf;
use thiserror::Error;

use crate::hooks::Phase;

/// Problems with task declarations or compiler options. These are fatal: the
/// compiler refuses to start a build when one is raised.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("task '{0}': `test` is required")]
    MissingTest(String),

    #[error("task '{0}': `use` is required")]
    MissingUse(String),

    #[error("output dir is required")]
    MissingOutput,

    #[error("couldn't read configuration file '{0}':\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("couldn't parse configuration file '{0}':\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),

    #[error("couldn't serialize options:\n{0}")]
    Serialize(#[from] serde_json::Error),

    #[error("couldn't resolve the current directory:\n{0}")]
    CurrentDir(std::io::Error),

    #[error("path is not valid UTF-8: {0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("couldn't create cache directory '{0}':\n{1}")]
    CacheDir(Utf8PathBuf, std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache IO error at '{0}':\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("couldn't encode cache value for key '{0}':\n{1}")]
    Encode(String, serde_json::Error),

    #[error("couldn't encode artifact '{0}':\n{1}")]
    ArtifactEncode(Utf8PathBuf, String),
}

#[derive(Debug, Error)]
#[error("hook '{phase}' failed:\n{source}")]
pub struct HookError {
    pub phase: Phase,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("path is not valid UTF-8: {0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("transformer '{0}' is not registered")]
    UnknownTransformer(String),

    #[error("transformer '{0}' rejected its options:\n{1}")]
    TransformerOptions(String, anyhow::Error),

    #[error("task '{task}' failed on '{file}':\n{source}")]
    Transform {
        task: String,
        file: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("a build is already running")]
    AlreadyRunning,

    #[error("the serial build queue has shut down")]
    QueueClosed,
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("path is not valid UTF-8: {0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("watch mode needs a running tokio runtime")]
    NoRuntime,
}
