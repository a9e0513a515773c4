use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::ConfigError;
use crate::core::reply::ReplyRules;
use crate::core::sync::{RetryPolicy, SyncOptions, DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE};

/// Runtime config. Every field has a default, so a partial `config.json`
/// is fine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root of the per-pattern file cache.
    pub storage_dir: PathBuf,
    pub database_path: PathBuf,
    pub page_size: usize,
    pub concurrency: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub sync_deadline_secs: Option<u64>,
    /// Rows in the top-sender / top-domain tables.
    pub top_n: usize,
    /// Extra reply attribution regexes, appended to the built-in rules.
    pub reply_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailmirror");
        Config {
            storage_dir: data.join("emails"),
            database_path: data.join("emails.db"),
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry_attempts: 5,
            retry_base_delay_ms: 500,
            sync_deadline_secs: None,
            top_n: 10,
            reply_patterns: Vec::new(),
        }
    }
}

/// `MAILMIRROR_CONFIG` if set, else `<config dir>/mailmirror/config.json`.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("MAILMIRROR_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailmirror")
        .join("config.json")
}

impl Config {
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(cfg))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, data).map_err(write_err)
    }

    /// Resolution order: env vars → config file → defaults. The result is
    /// validated before it is returned.
    pub fn resolve() -> Result<Self, ConfigError> {
        let path = config_path();
        let mut config = match Self::load(&path)? {
            Some(config) => {
                log::debug!("Loaded config from {}", path.display());
                config
            }
            None => Config::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `MAILMIRROR_*` variables found by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("MAILMIRROR_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MAILMIRROR_DATABASE") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = parse_env(&lookup, "MAILMIRROR_PAGE_SIZE")? {
            self.page_size = v;
        }
        if let Some(v) = parse_env(&lookup, "MAILMIRROR_CONCURRENCY")? {
            self.concurrency = v;
        }
        if let Some(v) = parse_env(&lookup, "MAILMIRROR_RETRY_ATTEMPTS")? {
            self.retry_attempts = v;
        }
        if let Some(v) = parse_env(&lookup, "MAILMIRROR_RETRY_DELAY_MS")? {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "MAILMIRROR_SYNC_DEADLINE_SECS")? {
            self.sync_deadline_secs = Some(v);
        }
        if let Some(v) = parse_env(&lookup, "MAILMIRROR_TOP_N")? {
            self.top_n = v;
        }
        // One regex per line.
        if let Some(v) = lookup("MAILMIRROR_REPLY_PATTERNS") {
            self.reply_patterns = v
                .lines()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".into()));
        }
        if self.sync_deadline_secs == Some(0) {
            return Err(ConfigError::Invalid("sync_deadline_secs must be positive".into()));
        }
        self.reply_rules()?;
        Ok(())
    }

    pub fn reply_rules(&self) -> Result<ReplyRules, ConfigError> {
        ReplyRules::with_extra_patterns(&self.reply_patterns).map_err(|e| {
            // Report the first pattern that does not compile.
            let pattern = self
                .reply_patterns
                .iter()
                .find(|p| regex::Regex::new(p).is_err())
                .cloned()
                .unwrap_or_default();
            ConfigError::ReplyPattern {
                pattern,
                reason: e.to_string(),
            }
        })
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            page_size: self.page_size,
            concurrency: self.concurrency,
            retry: RetryPolicy {
                attempts: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
            deadline: self.sync_deadline_secs.map(Duration::from_secs),
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}
