//! Runtime configuration, read from `QHARNESS_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_QUERY_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_SCRUB_WAKE_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SCRUB_THROTTLE: Duration = Duration::from_secs(2 * 60 * 60);

const HISTORY_FILE_NAME: &str = "workspace-query-history.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },
}

#[derive(Debug, Clone)]
pub struct QueryServerConfig {
    /// Server executable. `None` means the client is attached to an existing transport.
    pub server_path: Option<PathBuf>,
    pub server_args: Vec<String>,
    /// Evaluation timeout forwarded to the server with every run.
    pub timeout_secs: u64,
    /// How long a cancelled request waits for the server to acknowledge.
    pub cancel_grace: Duration,
    /// Whether the server supports per-query structured evaluator logs.
    pub per_query_eval_log: bool,
}

impl Default for QueryServerConfig {
    fn default() -> Self {
        Self {
            server_path: None,
            server_args: vec!["execute".into(), "query-server2".into()],
            timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            per_query_eval_log: true,
        }
    }
}

impl QueryServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("QHARNESS_SERVER_PATH") {
            config.server_path = Some(PathBuf::from(path));
        }
        if let Ok(args) = std::env::var("QHARNESS_SERVER_ARGS") {
            config.server_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(secs) = env_parse::<u64>("QHARNESS_QUERY_TIMEOUT_SECS")? {
            config.timeout_secs = secs;
        }
        if let Some(ms) = env_parse::<u64>("QHARNESS_CANCEL_GRACE_MS")? {
            config.cancel_grace = Duration::from_millis(ms);
        }
        if let Some(enabled) = env_parse::<bool>("QHARNESS_PER_QUERY_EVAL_LOG")? {
            config.per_query_eval_log = enabled;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Root of all persisted artifacts.
    pub storage_dir: PathBuf,
    pub max_query_age: Duration,
    pub scrub_wake_interval: Duration,
    pub scrub_throttle: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".qharness"),
            max_query_age: DEFAULT_MAX_QUERY_AGE,
            scrub_wake_interval: DEFAULT_SCRUB_WAKE_INTERVAL,
            scrub_throttle: DEFAULT_SCRUB_THROTTLE,
        }
    }
}

impl HistoryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("QHARNESS_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(days) = env_parse::<u64>("QHARNESS_HISTORY_TTL_DAYS")? {
            config.max_query_age = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(secs) = env_parse::<u64>("QHARNESS_SCRUB_WAKE_SECS")? {
            config.scrub_wake_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("QHARNESS_SCRUB_THROTTLE_SECS")? {
            config.scrub_throttle = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Per-evaluation output directories live here.
    pub fn queries_dir(&self) -> PathBuf {
        self.storage_dir.join("queries")
    }

    /// Scratch space for compiled upgrades.
    pub fn upgrades_dir(&self) -> PathBuf {
        self.storage_dir.join("upgrades")
    }

    pub fn history_path(&self) -> PathBuf {
        self.storage_dir.join(HISTORY_FILE_NAME)
    }

    /// Directories the scrubber walks.
    pub fn scrub_roots(&self) -> Vec<PathBuf> {
        vec![self.queries_dir()]
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    pub server: QueryServerConfig,
    pub history: HistoryConfig,
    /// SQLite file backing cross-process state such as the last scrub time.
    pub state_path: Option<PathBuf>,
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: QueryServerConfig::from_env()?,
            history: HistoryConfig::from_env()?,
            state_path: std::env::var("QHARNESS_STATE_PATH").ok().map(PathBuf::from),
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| default_state_path(&self.history.storage_dir))
    }
}

pub fn default_state_path(storage_dir: &Path) -> PathBuf {
    storage_dir.join("global-state.sqlite")
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let server = QueryServerConfig::default();
        assert_eq!(server.timeout_secs, 600);
        assert_eq!(server.cancel_grace, Duration::from_secs(5));

        let history = HistoryConfig::default();
        assert_eq!(history.max_query_age, Duration::from_secs(30 * 86_400));
        assert_eq!(history.scrub_wake_interval, Duration::from_secs(3_600));
        assert_eq!(history.scrub_throttle, Duration::from_secs(7_200));
    }

    #[test]
    fn layout_is_rooted_at_storage_dir() {
        let history = HistoryConfig::default().with_storage_dir("/tmp/qh");
        assert_eq!(history.queries_dir(), PathBuf::from("/tmp/qh/queries"));
        assert_eq!(
            history.history_path(),
            PathBuf::from("/tmp/qh/workspace-query-history.json")
        );
    }

    #[test]
    fn bad_numbers_are_reported_with_their_variable() {
        let err = parse_value::<u64>("QHARNESS_QUERY_TIMEOUT_SECS", "ten").unwrap_err();
        assert!(err.to_string().contains("QHARNESS_QUERY_TIMEOUT_SECS"));
        assert_eq!(parse_value::<u64>("X", " 42 ").unwrap(), 42);
    }
}
