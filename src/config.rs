use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONFIG_FILENAME: &str = ".rockskip.json";
pub const GLOBAL_CONFIG_DIR: &str = "rockskip";
pub const GLOBAL_CONFIG_FILENAME: &str = "config.json";
pub const DB_FILENAME: &str = "rockskip.db";

#[derive(Debug)]
pub enum ConfigError {
    NotFound {
        path: PathBuf,
    },
    InvalidJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NotFound { path } => {
                write!(f, "no config found at {}", path.display())
            }
            ConfigError::InvalidJson { path, source } => {
                write!(f, "invalid config in {}: {}", path.display(), source)
            }
            ConfigError::IoError { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidJson { source, .. } => Some(source),
            ConfigError::IoError { source, .. } => Some(source),
            ConfigError::NotFound { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub service: ServiceConfig,
    pub indexer: IndexerConfig,
    pub fetcher: FetcherConfig,
    pub parser: ParserConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Database file. Defaults to the platform cache dir.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Long-lived indexing workers, each with its own queue
    pub index_workers: usize,
    /// Capacity of each worker queue
    pub queue_size: usize,
    /// Repositories retained before least-recently-used eviction kicks in
    pub max_repos: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    pub rev_list_page_size: usize,
    pub path_symbols_cache_size: usize,
    pub symbol_id_cache_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetcherConfig {
    pub max_concurrent_fetches: usize,
    /// Upper bound on the summed length of paths sent in one archive request
    pub max_total_paths_length: usize,
    /// Archive entries above this size are reported with empty content
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParserConfig {
    pub pool_size: usize,
    pub max_file_size: u64,
    /// Files producing more symbols than this are treated as noise
    pub max_symbols: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// Applied to searches that carry no timeout of their own; 0 disables it
    pub default_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            index_workers: 4,
            queue_size: 64,
            max_repos: 1000,
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            rev_list_page_size: 100,
            path_symbols_cache_size: 100_000,
            symbol_id_cache_size: 100_000,
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            max_total_paths_length: 100_000,
            max_file_size: 1_048_576, // 1 MiB
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_file_size: 1_048_576,
            max_symbols: 2_000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_timeout_secs: 60,
        }
    }
}

impl SearchConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        cache_dir.join(GLOBAL_CONFIG_DIR).join(DB_FILENAME)
    }
}

/// Returns the path to the global config file, if the platform config dir exists.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(GLOBAL_CONFIG_DIR).join(GLOBAL_CONFIG_FILENAME))
}

/// Reads a JSON file as a `serde_json::Value`. Returns empty `{}` if the file doesn't exist.
fn load_json_file(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::InvalidJson {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Objects merge key-by-key; anything else in `overlay` replaces `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Global config errors are logged and skipped; local config errors propagate.
pub fn load_and_merge(
    global_path: Option<&Path>,
    local_path: &Path,
) -> Result<Config, ConfigError> {
    let global_value = match global_path {
        Some(path) => match load_json_file(path) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load global config, skipping");
                Value::Object(serde_json::Map::new())
            }
        },
        None => Value::Object(serde_json::Map::new()),
    };

    let local_value = load_json_file(local_path)?;
    let merged = deep_merge(global_value, local_value);

    let config: Config =
        serde_json::from_value(merged).map_err(|e| ConfigError::InvalidJson {
            path: local_path.to_path_buf(),
            source: e,
        })?;
    Ok(config.normalized())
}

impl Config {
    /// Loads the global config merged with `.rockskip.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let local_path = dir.join(CONFIG_FILENAME);
        load_and_merge(global_config_path().as_deref(), &local_path)
    }

    pub fn validate_file(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::InvalidJson {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Zero-sized pools and queues would deadlock; clamp them to one.
    fn normalized(mut self) -> Self {
        self.service.index_workers = self.service.index_workers.max(1);
        self.service.queue_size = self.service.queue_size.max(1);
        self.service.max_repos = self.service.max_repos.max(1);
        self.indexer.rev_list_page_size = self.indexer.rev_list_page_size.max(1);
        self.indexer.path_symbols_cache_size = self.indexer.path_symbols_cache_size.max(1);
        self.indexer.symbol_id_cache_size = self.indexer.symbol_id_cache_size.max(1);
        self.fetcher.max_concurrent_fetches = self.fetcher.max_concurrent_fetches.max(1);
        self.parser.pool_size = self.parser.pool_size.max(1);
        self
    }
}
