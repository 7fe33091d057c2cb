//! Compiler options and their resolution against the project layout.
//!
//! [`Options`] is the user-facing record, usually loaded from a JSON
//! configuration file. It is resolved once into [`ResolvedOptions`], which
//! carries absolute directories and is what every context and transformer
//! sees.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::task::TaskDecl;

/// Name of the project-local cache directory.
pub const CACHE_DIR: &str = ".tsumiki";

fn default_env() -> String {
    "development".to_string()
}

fn default_img_type() -> Vec<String> {
    ["png", "jpg", "jpeg", "gif", "svg", "webp"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_concurrency() -> usize {
    16
}

/// Options as declared by the user.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Path of the configuration file, its parent directory is the project
    /// base directory. Relative paths resolve against the current directory.
    #[serde(default)]
    pub config: Utf8PathBuf,
    /// Source directory, relative to the base directory.
    #[serde(default)]
    pub source: Utf8PathBuf,
    /// Output directory, relative to the base directory.
    #[serde(default)]
    pub output: Option<Utf8PathBuf>,
    /// Build environment label, persisted after every successful build.
    #[serde(default = "default_env")]
    pub env: String,
    /// Extensions which are all compiled by the single `img` task.
    #[serde(default = "default_img_type")]
    pub img_type: Vec<String>,
    /// Module aliases, relative to the base directory.
    #[serde(default)]
    pub alias: BTreeMap<String, Utf8PathBuf>,
    /// How many files of one task are processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// User task declarations.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDecl>,
    /// Anything else, forwarded verbatim to transformers.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: Utf8PathBuf::new(),
            source: Utf8PathBuf::new(),
            output: None,
            env: default_env(),
            img_type: default_img_type(),
            alias: BTreeMap::new(),
            concurrency: default_concurrency(),
            tasks: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Options {
    /// Read options from a JSON configuration file. The `config` field is set
    /// to the file path, so the base directory is the file's directory.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        let mut options: Options =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))?;
        options.config = path.to_owned();
        Ok(options)
    }

    /// Anchor every directory under the base directory.
    pub fn resolve(self) -> Result<(ResolvedOptions, BTreeMap<String, TaskDecl>), ConfigError> {
        let output = self.output.ok_or(ConfigError::MissingOutput)?;

        let config = absolute(&self.config)?;
        let base_dir = match config.parent() {
            Some(parent) if !self.config.as_str().is_empty() => parent.to_owned(),
            _ => config.clone(),
        };

        let alias = self
            .alias
            .into_iter()
            .map(|(k, v)| (k, normalize(&base_dir.join(v))))
            .collect();

        let resolved = ResolvedOptions {
            cache_dir: base_dir.join(CACHE_DIR),
            source_dir: normalize(&base_dir.join(&self.source)),
            output_dir: normalize(&base_dir.join(output)),
            base_dir,
            config,
            env: self.env,
            img_type: self.img_type,
            alias,
            concurrency: self.concurrency.max(1),
            extra: self.extra,
        };

        Ok((resolved, self.tasks))
    }
}

/// Options with every directory made absolute.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedOptions {
    pub config: Utf8PathBuf,
    pub base_dir: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub source_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub env: String,
    pub img_type: Vec<String>,
    pub alias: BTreeMap<String, Utf8PathBuf>,
    pub concurrency: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResolvedOptions {
    /// The JSON view handed to transformers without options of their own.
    pub fn to_value(&self) -> Result<serde_json::Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(normalize(path));
    }

    let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
    let cwd = Utf8PathBuf::try_from(cwd)?;
    Ok(normalize(&cwd.join(path)))
}

/// Lexically resolve `.` and `..` components without touching the disk.
pub(crate) fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    use camino::Utf8Component;

    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }
    out
}
