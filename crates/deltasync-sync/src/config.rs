//! Layered settings: defaults, then `deltasync.yaml`, then environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use deltasync_core::BackoffPolicy;
use deltasync_source::{FetcherConfig, RateLimit, SourceApiConfig};
use deltasync_store::PgStoreConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::writer::WriterConfig;

pub const CONFIG_FILE: &str = "deltasync.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub list_path: String,
    pub attribute_path: String,
    pub page_size: u64,
    pub fetch_batch_size: usize,
    pub min_batch_interval_ms: u64,
    pub fetch_max_retries: usize,
    pub http_timeout_secs: u64,
    pub attribute_ids_per_request: usize,
    /// Row limit per attribute request; a full page is treated as truncated.
    pub attribute_limit: u32,
    pub write_batch_size: usize,
    pub wave_width: usize,
    pub write_max_retries: usize,
    pub contention_threshold: usize,
    /// Zero disables the run deadline.
    pub run_timeout_secs: u64,
    pub max_records: u64,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub web_port: u16,
    #[serde(skip)]
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            api_base_url: None,
            api_key: None,
            list_path: "/records".to_string(),
            attribute_path: "/attributes".to_string(),
            page_size: 100,
            fetch_batch_size: 5,
            min_batch_interval_ms: 1000,
            fetch_max_retries: 3,
            http_timeout_secs: 20,
            attribute_ids_per_request: 50,
            attribute_limit: 1000,
            write_batch_size: 200,
            wave_width: 4,
            write_max_retries: 5,
            contention_threshold: 3,
            run_timeout_secs: 1800,
            max_records: 1000,
            reports_dir: None,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            user_agent: "deltasync/0.1".to_string(),
            web_port: 8080,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(".", |key| std::env::var(key).ok())
    }

    /// Defaults, overlaid by `<root>/deltasync.yaml` when present, overlaid by
    /// whatever `lookup` returns for the `DELTASYNC_*` keys.
    pub fn load(
        workspace_root: impl Into<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let workspace_root = workspace_root.into();
        let path = workspace_root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::from_yaml_file(&path)?
        } else {
            Self::default()
        };
        config.workspace_root = workspace_root;
        config.apply_env(lookup);
        Ok(config)
    }

    fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = &lookup;
        set_text(&mut self.database_url, "DATABASE_URL", lookup);
        set_text(&mut self.api_base_url, "DELTASYNC_API_BASE_URL", lookup);
        set_text(&mut self.api_key, "DELTASYNC_API_KEY", lookup);
        if let Some(path) = non_empty(lookup("DELTASYNC_LIST_PATH")) {
            self.list_path = path;
        }
        if let Some(path) = non_empty(lookup("DELTASYNC_ATTRIBUTE_PATH")) {
            self.attribute_path = path;
        }
        set_parsed(&mut self.page_size, "DELTASYNC_PAGE_SIZE", lookup);
        set_parsed(&mut self.fetch_batch_size, "DELTASYNC_FETCH_BATCH_SIZE", lookup);
        set_parsed(&mut self.min_batch_interval_ms, "DELTASYNC_MIN_BATCH_INTERVAL_MS", lookup);
        set_parsed(&mut self.fetch_max_retries, "DELTASYNC_FETCH_MAX_RETRIES", lookup);
        set_parsed(&mut self.http_timeout_secs, "DELTASYNC_HTTP_TIMEOUT_SECS", lookup);
        set_parsed(
            &mut self.attribute_ids_per_request,
            "DELTASYNC_ATTRIBUTE_IDS_PER_REQUEST",
            lookup,
        );
        set_parsed(&mut self.attribute_limit, "DELTASYNC_ATTRIBUTE_LIMIT", lookup);
        set_parsed(&mut self.write_batch_size, "DELTASYNC_WRITE_BATCH_SIZE", lookup);
        set_parsed(&mut self.wave_width, "DELTASYNC_WAVE_WIDTH", lookup);
        set_parsed(&mut self.write_max_retries, "DELTASYNC_WRITE_MAX_RETRIES", lookup);
        set_parsed(&mut self.contention_threshold, "DELTASYNC_CONTENTION_THRESHOLD", lookup);
        set_parsed(&mut self.run_timeout_secs, "DELTASYNC_RUN_TIMEOUT_SECS", lookup);
        set_parsed(&mut self.max_records, "DELTASYNC_MAX_RECORDS", lookup);
        if let Some(dir) = non_empty(lookup("DELTASYNC_REPORTS_DIR")) {
            self.reports_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = lookup("DELTASYNC_SCHEDULER_ENABLED") {
            self.scheduler_enabled = matches!(flag.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(cron) = non_empty(lookup("DELTASYNC_SYNC_CRON")) {
            self.sync_cron = cron;
        }
        if let Some(agent) = non_empty(lookup("DELTASYNC_USER_AGENT")) {
            self.user_agent = agent;
        }
        set_parsed(&mut self.web_port, "DELTASYNC_WEB_PORT", lookup);
    }

    /// Pre-flight check run before any I/O.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if blank(&self.api_base_url) {
            return Err(ConfigError::Missing("DELTASYNC_API_BASE_URL"));
        }
        if blank(&self.api_key) {
            return Err(ConfigError::Missing("DELTASYNC_API_KEY"));
        }
        let sizes = [
            ("DELTASYNC_PAGE_SIZE", self.page_size as usize),
            ("DELTASYNC_FETCH_BATCH_SIZE", self.fetch_batch_size),
            ("DELTASYNC_ATTRIBUTE_IDS_PER_REQUEST", self.attribute_ids_per_request),
            ("DELTASYNC_ATTRIBUTE_LIMIT", self.attribute_limit as usize),
            ("DELTASYNC_WRITE_BATCH_SIZE", self.write_batch_size),
            ("DELTASYNC_WAVE_WIDTH", self.wave_width),
        ];
        for (key, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        match self.database_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url),
            _ => Err(ConfigError::Missing("DATABASE_URL")),
        }
    }

    pub fn pg_store_config(&self) -> Result<PgStoreConfig, ConfigError> {
        let mut store = PgStoreConfig::new(self.database_url()?);
        // Leave headroom above the widest write wave for ledger and fingerprint statements.
        store.max_connections = (self.wave_width as u32).saturating_add(2).max(5);
        Ok(store)
    }

    pub fn source_api_config(&self) -> Result<SourceApiConfig, ConfigError> {
        self.validate()?;
        Ok(SourceApiConfig {
            base_url: self.api_base_url.clone().unwrap_or_default(),
            api_key: self.api_key.clone().unwrap_or_default(),
            list_path: self.list_path.clone(),
            attribute_path: self.attribute_path.clone(),
            attribute_limit: self.attribute_limit,
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            rate_limit: RateLimit {
                batch_size: self.fetch_batch_size.max(1),
                min_batch_interval: Duration::from_millis(self.min_batch_interval_ms),
            },
            retry: BackoffPolicy {
                max_retries: self.fetch_max_retries,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                max_jitter: Duration::ZERO,
            },
            request_timeout: self.http_timeout(),
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.write_batch_size.max(1),
            initial_wave_width: self.wave_width.max(1),
            retry: BackoffPolicy {
                max_retries: self.write_max_retries,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                max_jitter: Duration::from_secs(1),
            },
            contention_threshold: self.contention_threshold,
            ..WriterConfig::default()
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn reports_root(&self) -> Option<PathBuf> {
        self.reports_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.workspace_root.join(dir)
            }
        })
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn set_text(slot: &mut Option<String>, key: &str, lookup: &impl Fn(&str) -> Option<String>) {
    if let Some(value) = non_empty(lookup(key)) {
        *slot = Some(value);
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, lookup: &impl Fn(&str) -> Option<String>) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparsable setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults_and_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(
            dir.path(),
            env(&[
                ("DELTASYNC_API_BASE_URL", "https://api.example.test/v2"),
                ("DELTASYNC_API_KEY", "secret"),
                ("DELTASYNC_PAGE_SIZE", "250"),
                ("DELTASYNC_ATTRIBUTE_LIMIT", "300"),
                ("DELTASYNC_WAVE_WIDTH", "lots"),
                ("DELTASYNC_SCHEDULER_ENABLED", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(config.page_size, 250);
        assert_eq!(config.source_api_config().unwrap().attribute_limit, 300);
        assert_eq!(config.wave_width, 4);
        assert!(config.scheduler_enabled);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn yaml_file_sits_between_defaults_and_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "api_base_url: https://yaml.example.test\nwrite_batch_size: 50\npage_size: 20\n",
        )
        .unwrap();

        let config = SyncConfig::load(dir.path(), env(&[("DELTASYNC_PAGE_SIZE", "40")])).unwrap();
        assert_eq!(config.api_base_url.as_deref(), Some("https://yaml.example.test"));
        assert_eq!(config.write_batch_size, 50);
        assert_eq!(config.page_size, 40);
        assert_eq!(config.fetch_batch_size, 5);
    }

    #[test]
    fn validation_names_the_missing_setting() {
        let mut config = SyncConfig {
            api_base_url: Some("https://api.example.test".into()),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Missing("DELTASYNC_API_KEY")));

        config.api_key = Some("k".into());
        config.write_batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "DELTASYNC_WRITE_BATCH_SIZE", .. })
        ));
        assert_eq!(config.database_url(), Err(ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn zero_timeout_disables_the_deadline() {
        let config = SyncConfig {
            run_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.run_timeout(), None);
        assert_eq!(
            SyncConfig::default().run_timeout(),
            Some(Duration::from_secs(1800))
        );
    }
}
