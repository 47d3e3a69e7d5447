use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{resolve_default_executor, GenieConfig};
use crate::executor::normalize_executor_key;
use crate::migration::{classify, normalize};

pub const STORE_VERSION: u32 = 4;
pub const PROMPT_PREVIEW_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize store: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Session,
    Task,
}

impl StoreKind {
    /// Field that carried the attempt id before records were keyed by it.
    pub fn legacy_id_field(self) -> &'static str {
        match self {
            StoreKind::Session => "taskId",
            StoreKind::Task => "sessionId",
        }
    }

    pub fn noun(self) -> &'static str {
        match self {
            StoreKind::Session => "session",
            StoreKind::Task => "task",
        }
    }

    pub fn title_plural(self) -> &'static str {
        match self {
            StoreKind::Session => "Sessions",
            StoreKind::Task => "Tasks",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Session => "sessions",
            StoreKind::Task => "tasks",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "session" | "sessions" => Ok(StoreKind::Session),
            "task" | "tasks" => Ok(StoreKind::Task),
            other => Err(format!("unknown store kind: {other} (expected sessions|tasks)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreLocation {
    pub primary: Option<PathBuf>,
    /// Older task registries lived in a sessions file.
    pub legacy: Option<PathBuf>,
}

impl StoreLocation {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            primary: Some(path.into()),
            legacy: None,
        }
    }

    pub fn read_path(&self) -> Option<&Path> {
        let primary = self.primary.as_deref();
        let primary_exists = primary.map(Path::exists).unwrap_or(false);
        match self.legacy.as_deref() {
            Some(legacy) if !primary_exists && legacy.exists() => Some(legacy),
            _ => primary,
        }
    }

    pub fn write_path(&self) -> Option<&Path> {
        self.primary.as_deref().or(self.legacy.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forge_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_pid: Option<u32>,
    /// Fields this version does not model, written back untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Self::default()
        }
    }

    pub fn touch(&mut self, now: &str) {
        if self.created.is_none() {
            self.created = Some(now.to_string());
        }
        self.last_used = Some(now.to_string());
    }

    pub fn set_mode(&mut self, mode: impl Into<String>) {
        let mode = mode.into();
        self.preset = Some(mode.clone());
        self.mode = Some(mode);
    }

    /// Fill whichever of `mode`/`preset` is missing from the other.
    fn sync_mode_and_preset(&mut self) {
        let mode_set = self.mode.as_deref().is_some_and(|value| !value.is_empty());
        let preset_set = self.preset.as_deref().is_some_and(|value| !value.is_empty());
        if !mode_set && preset_set {
            self.mode = self.preset.clone();
        }
        if !preset_set && mode_set {
            self.preset = self.mode.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreFile {
    pub version: u32,
    pub sessions: BTreeMap<String, Record>,
}

impl StoreFile {
    pub fn empty() -> Self {
        Self {
            version: STORE_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl Default for StoreFile {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedStore {
    pub store: StoreFile,
    pub warnings: Vec<String>,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Character-based so multi-byte prompts never split mid-codepoint.
pub fn truncate_prompt(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Parse raw file content into a v4 store. Never fails: unparsable or
/// unrecognized content yields an empty store plus a warning where useful.
pub fn parse_store(content: &str, source: &Path, kind: StoreKind) -> LoadedStore {
    let mut warnings = Vec::new();
    let data = if content.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str::<Value>(content) {
            Ok(value) => value,
            Err(err) => {
                warnings.push(format!(
                    "Could not parse JSON from {}: {err}",
                    source.display()
                ));
                Value::Object(Default::default())
            }
        }
    };
    let normalized = normalize(classify(&data), kind);
    warnings.extend(normalized.warnings);
    LoadedStore {
        store: normalized.store,
        warnings,
    }
}

pub fn apply_defaults(store: &mut StoreFile, default_executor: &str) {
    for record in store.sessions.values_mut() {
        record.sync_mode_and_preset();
        let normalized = record.executor.as_deref().and_then(normalize_executor_key);
        record.executor = Some(normalized.unwrap_or_else(|| default_executor.to_string()));
    }
}

pub fn load(
    location: &StoreLocation,
    kind: StoreKind,
    config: &GenieConfig,
    defaults: &GenieConfig,
) -> Result<LoadedStore, StoreError> {
    let mut loaded = match location.read_path() {
        Some(path) if path.exists() => {
            let content = fs::read_to_string(path).map_err(|source| StoreError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            parse_store(&content, path, kind)
        }
        _ => LoadedStore {
            store: StoreFile::empty(),
            warnings: Vec::new(),
        },
    };

    let default_executor = resolve_default_executor(config, defaults);
    apply_defaults(&mut loaded.store, &default_executor);
    for warning in &loaded.warnings {
        warn!(kind = %kind, "{warning}");
    }
    Ok(loaded)
}

/// Atomically replace the store file. Returns the written path, or `None`
/// when the location has nowhere to write.
pub fn save(location: &StoreLocation, store: &StoreFile) -> Result<Option<PathBuf>, StoreError> {
    let Some(path) = location.write_path() else {
        return Ok(None);
    };
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let payload = serde_json::to_string_pretty(store)?;
    let tmp = sibling_path(path, "tmp");
    fs::write(&tmp, payload).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    debug!(path = %path.display(), records = store.sessions.len(), "saved store");
    Ok(Some(path.to_path_buf()))
}

/// Locked read-modify-write of the whole store. The file is only rewritten
/// when `mutate` returns `Some`.
pub fn update<T>(
    location: &StoreLocation,
    kind: StoreKind,
    config: &GenieConfig,
    defaults: &GenieConfig,
    mutate: impl FnOnce(&mut StoreFile) -> Option<T>,
) -> Result<(LoadedStore, Option<T>), StoreError> {
    let _lock = match location.write_path() {
        Some(path) => Some(StoreLock::acquire(path)?),
        None => None,
    };
    let mut loaded = load(location, kind, config, defaults)?;
    let output = mutate(&mut loaded.store);
    if output.is_some() {
        save(location, &loaded.store)?;
    }
    Ok((loaded, output))
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Exclusive advisory lock on `<store>.lock`, released on drop.
struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store_path: &Path) -> Result<Self, StoreError> {
        let path = sibling_path(store_path, "lock");
        let lock_err = |source| StoreError::Lock {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(lock_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_err)?;
        FileExt::lock_exclusive(&file).map_err(lock_err)?;
        debug!(path = %path.display(), "acquired store lock");
        Ok(Self { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "failed to release store lock: {err}");
        }
    }
}
