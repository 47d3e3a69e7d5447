use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{normalize_executor_key_or_default, DEFAULT_EXECUTOR_KEY};
use crate::store::{StoreKind, StoreLocation};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDefaults {
    pub executor: Option<String>,
    pub executor_variant: Option<String>,
    pub background: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PathsConfig {
    pub base_dir: Option<String>,
    pub tasks_file: Option<String>,
    /// Older configs name the task registry `sessionsFile`.
    pub sessions_file: Option<String>,
    pub legacy_sessions_file: Option<String>,
    pub logs_dir: Option<String>,
    pub background_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenieConfig {
    #[serde(default)]
    pub defaults: ExecutionDefaults,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl GenieConfig {
    /// Packaged defaults, consulted after the project config.
    pub fn builtin() -> Self {
        Self {
            defaults: ExecutionDefaults {
                executor: Some(DEFAULT_EXECUTOR_KEY.to_string()),
                executor_variant: Some("DEFAULT".to_string()),
                background: Some(false),
            },
            paths: PathsConfig {
                tasks_file: Some(".genie/state/tasks.json".to_string()),
                ..PathsConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub base_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub sessions_file: PathBuf,
    pub legacy_sessions_file: Option<PathBuf>,
    pub logs_dir: PathBuf,
    pub background_dir: PathBuf,
}

impl ResolvedPaths {
    pub fn store_location(&self, kind: StoreKind) -> StoreLocation {
        match kind {
            StoreKind::Task => StoreLocation {
                primary: Some(self.tasks_file.clone()),
                legacy: self.legacy_sessions_file.clone(),
            },
            StoreKind::Session => StoreLocation {
                primary: Some(self.sessions_file.clone()),
                legacy: None,
            },
        }
    }
}

pub fn config_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".genie").join("config.yaml")
}

/// Nearest ancestor of `start` that holds a `.genie/` directory.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|candidate| candidate.join(".genie").is_dir())
        .map(Path::to_path_buf)
}

/// `GENIE_HOME` wins, then the nearest `.genie/` ancestor, then `start` itself.
pub fn resolve_workspace_root(start: &Path) -> PathBuf {
    if let Ok(value) = std::env::var("GENIE_HOME") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    find_workspace_root(start).unwrap_or_else(|| start.to_path_buf())
}

pub fn load_config(workspace_root: &Path) -> Result<GenieConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.is_file() {
        return Ok(GenieConfig::default());
    }
    let text = fs::read_to_string(&path)?;
    if text.trim().is_empty() {
        return Ok(GenieConfig::default());
    }
    serde_yaml::from_str::<GenieConfig>(&text).map_err(|source| ConfigError::Parse { path, source })
}

/// Project config first, then the packaged defaults, then the registry fallback.
pub fn resolve_default_executor(config: &GenieConfig, defaults: &GenieConfig) -> String {
    let preferred = config
        .defaults
        .executor
        .as_deref()
        .or(defaults.defaults.executor.as_deref())
        .unwrap_or(DEFAULT_EXECUTOR_KEY);
    normalize_executor_key_or_default(Some(preferred), DEFAULT_EXECUTOR_KEY)
}

pub fn resolve_paths(workspace_root: &Path, paths: &PathsConfig) -> ResolvedPaths {
    let base_dir = paths
        .base_dir
        .as_deref()
        .map(|dir| join_relative(workspace_root, dir))
        .unwrap_or_else(|| workspace_root.to_path_buf());
    let state_dir = base_dir.join(".genie").join("state");

    let tasks_file = paths
        .tasks_file
        .as_deref()
        .or(paths.sessions_file.as_deref())
        .map(|file| join_relative(&base_dir, file))
        .unwrap_or_else(|| state_dir.join("tasks.json"));
    let sessions_file = paths
        .sessions_file
        .as_deref()
        .map(|file| join_relative(&base_dir, file))
        .unwrap_or_else(|| tasks_file.clone());
    let legacy_sessions_file = paths
        .legacy_sessions_file
        .as_deref()
        .map(|file| join_relative(&base_dir, file));
    let logs_dir = paths
        .logs_dir
        .as_deref()
        .map(|dir| join_relative(&base_dir, dir))
        .unwrap_or_else(|| state_dir.join("agents").join("logs"));
    let background_dir = paths
        .background_dir
        .as_deref()
        .map(|dir| join_relative(&base_dir, dir))
        .unwrap_or_else(|| state_dir.join("agents").join("background"));

    ResolvedPaths {
        base_dir,
        tasks_file,
        sessions_file,
        legacy_sessions_file,
        logs_dir,
        background_dir,
    }
}

fn join_relative(base: &Path, value: &str) -> PathBuf {
    let candidate = PathBuf::from(value);
    if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    }
}
