//! Persistent compile cache.
//!
//! A small key/value database stored as `db.json` inside the project cache
//! directory, plus content-addressed CBOR blobs holding the emitted files of
//! each cached source. [`CompileCache::set`] and [`CompileCache::remove`]
//! write through before returning, so a crash leaves either the old or the
//! new value on disk. Artifact entries are batched in memory and land with
//! the next write or [`CompileCache::flush`]; losing one costs a recompile.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::CacheError;

const DB_FILE: &str = "db.json";
const ARTIFACT_DIR: &str = "artifacts";
const ARTIFACT_PREFIX: &str = "artifact:";

/// Well-known key: the environment label of the last successful build.
pub const KEY_ENV: &str = "env";
/// Well-known key: the persisted dependency graph.
pub const KEY_GRAPH: &str = "graph";

/// Cache bookkeeping for one compiled source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Name of the task that compiled the file.
    pub task: String,
    /// Fingerprint of the file contents together with the task's chain.
    pub fingerprint: Hash32,
    /// Content fingerprints of the file's recorded dependencies.
    pub dependencies: BTreeMap<Utf8PathBuf, Hash32>,
    /// Emitted files, relative to the output directory.
    pub outputs: Vec<Utf8PathBuf>,
    /// Key of the blob holding the emitted files.
    pub blob: Hash32,
}

/// One emitted file as stored in an artifact blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the output directory.
    pub path: Utf8PathBuf,
    pub contents: Vec<u8>,
}

pub struct CompileCache {
    dir: Utf8PathBuf,
    data: BTreeMap<String, serde_json::Value>,
    dirty: bool,
}

impl CompileCache {
    /// Open the cache stored in `dir`, creating the directory if needed. A
    /// missing or unreadable database yields an empty cache.
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::Io(dir.clone(), e))?;

        let path = dir.join(DB_FILE);
        let data = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("discarding corrupt compile cache {path}: {e}");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(CacheError::Io(path, e)),
        };

        Ok(Self {
            dir,
            data,
            dirty: false,
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Read a value, `None` when absent or when it has a different shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn query<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Store a value and write the database through to disk.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), CacheError> {
        if key.is_empty() {
            return Ok(());
        }

        let value =
            serde_json::to_value(value).map_err(|e| CacheError::Encode(key.to_string(), e))?;
        self.data.insert(key.to_string(), value);
        self.write()
    }

    /// Remove keys, writing through only when something was removed.
    pub fn remove<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) -> Result<bool, CacheError> {
        let mut removed = false;
        for key in keys {
            removed |= self.data.remove(key).is_some();
        }

        if removed {
            self.write()?;
        }

        Ok(removed)
    }

    /// Write batched artifact entries, if there are any.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if self.dirty {
            self.write()?;
        }
        Ok(())
    }

    fn write(&mut self) -> Result<(), CacheError> {
        let path = self.dir.join(DB_FILE);
        let temp = self.dir.join(format!("{DB_FILE}.tmp"));

        let bytes = serde_json::to_vec(&self.data)
            .map_err(|e| CacheError::Encode(DB_FILE.to_string(), e))?;

        write_durable(&temp, &bytes)?;
        fs::rename(&temp, &path).map_err(|e| CacheError::Io(path, e))?;

        self.dirty = false;
        Ok(())
    }

    fn artifact_key(source: &Utf8Path) -> String {
        format!("{ARTIFACT_PREFIX}{source}")
    }

    pub fn artifact(&self, source: &Utf8Path) -> Option<ArtifactEntry> {
        self.get(&Self::artifact_key(source))
    }

    /// Sources with a cached artifact entry.
    pub fn artifact_sources(&self) -> Vec<Utf8PathBuf> {
        self.data
            .keys()
            .filter_map(|key| key.strip_prefix(ARTIFACT_PREFIX))
            .map(Utf8PathBuf::from)
            .collect()
    }

    /// Persist the emitted files of `source`. The blob is written right away,
    /// the entry referencing it is batched.
    pub fn store_artifact(
        &mut self,
        source: &Utf8Path,
        task: &str,
        fingerprint: Hash32,
        dependencies: BTreeMap<Utf8PathBuf, Hash32>,
        files: &[ArtifactFile],
    ) -> Result<ArtifactEntry, CacheError> {
        let mut encoded = Vec::new();
        ciborium::into_writer(files, &mut encoded)
            .map_err(|e| CacheError::ArtifactEncode(source.to_owned(), e.to_string()))?;

        let blob = Hash32::hash(&encoded);
        let dir = self.dir.join(ARTIFACT_DIR);
        let path = dir.join(blob.to_hex()).with_extension("cbor");

        if !path.exists() {
            fs::create_dir_all(&dir).map_err(|e| CacheError::Io(dir.clone(), e))?;
            let temp = path.with_extension("cbor.tmp");
            write_durable(&temp, &encoded)?;
            fs::rename(&temp, &path).map_err(|e| CacheError::Io(path.clone(), e))?;
        }

        let entry = ArtifactEntry {
            task: task.to_string(),
            fingerprint,
            dependencies,
            outputs: files.iter().map(|file| file.path.clone()).collect(),
            blob,
        };

        let value = serde_json::to_value(&entry)
            .map_err(|e| CacheError::Encode(Self::artifact_key(source), e))?;
        self.data.insert(Self::artifact_key(source), value);
        self.dirty = true;

        Ok(entry)
    }

    /// Drop the entry of `source` without writing through.
    pub fn forget_artifact(&mut self, source: &Utf8Path) {
        if self.data.remove(&Self::artifact_key(source)).is_some() {
            self.dirty = true;
        }
    }

    /// Load the emitted files of an entry, `None` if the blob is gone or
    /// unreadable.
    pub fn load_artifact(&self, entry: &ArtifactEntry) -> Option<Vec<ArtifactFile>> {
        let path = self
            .dir
            .join(ARTIFACT_DIR)
            .join(entry.blob.to_hex())
            .with_extension("cbor");

        let bytes = fs::read(&path).ok()?;
        if Hash32::hash(&bytes) != entry.blob {
            tracing::warn!("artifact {path} failed its checksum");
            return None;
        }

        ciborium::from_reader(bytes.as_slice()).ok()
    }

    /// Drop the artifact entries of `sources`.
    pub fn remove_artifacts(&mut self, sources: &[Utf8PathBuf]) -> Result<bool, CacheError> {
        let keys: Vec<_> = sources.iter().map(|s| Self::artifact_key(s)).collect();
        self.remove(keys.iter().map(String::as_str))
    }
}

fn write_durable(path: &Utf8Path, bytes: &[u8]) -> Result<(), CacheError> {
    let io = |e| CacheError::Io(path.to_owned(), e);

    let mut file = fs::File::create(path).map_err(io)?;
    file.write_all(bytes).map_err(io)?;
    file.sync_all().map_err(io)?;

    Ok(())
}
