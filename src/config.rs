//! Run configuration: YAML settings, context table, and topic list.
//!
//! A minimal configuration only lists contexts; every other section has
//! defaults matching the collection cadence the pipeline was tuned for.
//!
//! ```yaml
//! backends: [google_news, bing_news]
//! sessions:
//!   google_news: config/google_news/sessions.json
//! contexts:
//!   - label: us-west-1
//!     unit:
//!       identity: arn:aws:lambda:us-west-1:000000000000:function:scraper_1
//!       endpoint: https://abc.lambda-url.us-west-1.on.aws/
//!       location: us-west-1
//! ```
//!
//! Relative paths are resolved against the directory holding the config file.

use crate::errors::ConfigError;
use crate::models::{Backend, Context, ContextLabel, ExecutionUnit, Topic};
use crate::retry::{DelayWindow, MAX_DELAY_SECS, RetryPolicy};
use crate::scrapers::SearchKind;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Upper bound on concurrent workers per topic.
pub const MAX_WORKERS_CAP: usize = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_datasets_dir")]
    pub datasets_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Dataset path segment naming the collection mode.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_backends")]
    pub backends: Vec<Backend>,
    #[serde(default = "default_topics_file")]
    pub topics_file: PathBuf,
    pub contexts: Vec<ContextConfig>,
    /// Session index file per backend (see `session`).
    #[serde(default)]
    pub sessions: BTreeMap<Backend, PathBuf>,
    #[serde(default)]
    pub search_kind: SearchKind,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
    /// Endpoint receiving fire-and-forget redeploy signals.
    #[serde(default)]
    pub redeploy_webhook: Option<String>,
    #[serde(default)]
    pub content: ContentSettings,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    pub label: String,
    #[serde(default)]
    pub unit: Option<ExecutionUnit>,
    /// Session entry override; defaults to the label.
    #[serde(default)]
    pub session: Option<String>,
}

/// Knobs of the per-context pagination loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub items_per_page: u32,
    pub record_threshold: usize,
    pub page_limit: u32,
    pub page_delay: DelayWindow,
    pub recovery_cooldown: DelayWindow,
    pub max_recoveries: u32,
    pub max_duration_secs: Option<u64>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            items_per_page: 10,
            record_threshold: 50,
            page_limit: 5,
            page_delay: DelayWindow::new(60.0, 90.0),
            recovery_cooldown: DelayWindow::new(60.0, 90.0),
            max_recoveries: 10,
            max_duration_secs: None,
        }
    }
}

impl FetchSettings {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub topic_delay: DelayWindow,
    pub max_workers: Option<usize>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            topic_delay: DelayWindow::new(3.0, 7.0),
            max_workers: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter: Duration::from_millis(s.jitter_ms),
        }
    }
}

/// Settings of the article-content stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContentSettings {
    pub max_workers: usize,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub cache_file: PathBuf,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

const DEFAULT_CONTENT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:78.0) Gecko/20100101 Firefox/78.0";

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            max_workers: 10,
            request_timeout_secs: 10,
            user_agent: DEFAULT_CONTENT_USER_AGENT.to_string(),
            cache_file: PathBuf::from("url_content_cache.json"),
            max_attempts: 3,
            base_delay_ms: 2_000,
        }
    }
}

impl ContentSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }
}

fn default_datasets_dir() -> PathBuf {
    PathBuf::from("datasets")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_mode() -> String {
    "region".to_string()
}

fn default_backends() -> Vec<Backend> {
    vec![Backend::GoogleNews]
}

fn default_topics_file() -> PathBuf {
    PathBuf::from("topic.csv")
}

fn default_invoke_timeout_secs() -> u64 {
    120
}

impl CollectorConfig {
    /// Load and validate a YAML configuration file.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: CollectorConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.validate()?;
        info!(
            contexts = config.contexts.len(),
            backends = config.backends.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contexts.is_empty() {
            return Err(ConfigError::NoContexts);
        }
        let mut seen = HashSet::new();
        for ctx in &self.contexts {
            if !ContextLabel::is_valid(&ctx.label) {
                return Err(ConfigError::InvalidContextLabel(ctx.label.clone()));
            }
            if !seen.insert(ctx.label.as_str()) {
                return Err(ConfigError::DuplicateContext(ctx.label.clone()));
            }
            match &ctx.unit {
                Some(unit)
                    if !unit.identity.trim().is_empty() && !unit.endpoint.trim().is_empty() => {}
                _ => return Err(ConfigError::MissingUnit(ctx.label.clone())),
            }
        }
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid {
                field: "backends",
                reason: "at least one backend is required".into(),
            });
        }
        if self.fetch.items_per_page == 0 || self.fetch.page_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch",
                reason: "items_per_page and page_limit must be positive".into(),
            });
        }
        for (field, window) in [
            ("fetch.page_delay", self.fetch.page_delay),
            ("fetch.recovery_cooldown", self.fetch.recovery_cooldown),
            ("dispatch.topic_delay", self.dispatch.topic_delay),
        ] {
            if !window.is_valid() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!(
                        "{}..{} is not a valid window (0..={MAX_DELAY_SECS} seconds)",
                        window.min_secs, window.max_secs
                    ),
                });
            }
        }
        if self.mode.is_empty() || self.mode.contains(['/', '\\']) {
            return Err(ConfigError::Invalid {
                field: "mode",
                reason: format!("{:?} cannot be used as a directory name", self.mode),
            });
        }
        Ok(())
    }

    /// Resolve a path from the config against the config file's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn contexts(&self) -> Vec<Context> {
        self.contexts
            .iter()
            .map(|c| {
                let mut ctx = Context::new(c.label.clone());
                if let Some(key) = &c.session {
                    ctx.session_key = key.clone();
                }
                ctx
            })
            .collect()
    }

    /// Context label to execution unit table for the registry.
    pub fn unit_table(&self) -> BTreeMap<ContextLabel, ExecutionUnit> {
        self.contexts
            .iter()
            .filter_map(|c| {
                c.unit
                    .clone()
                    .map(|unit| (ContextLabel::new(c.label.clone()), unit))
            })
            .collect()
    }

    pub fn sessions_file(&self, backend: Backend) -> Option<PathBuf> {
        self.sessions.get(&backend).map(|p| self.resolve_path(p))
    }

    pub fn topics_path(&self) -> PathBuf {
        self.resolve_path(&self.topics_file)
    }

    pub fn datasets_path(&self) -> PathBuf {
        self.resolve_path(&self.datasets_dir)
    }

    pub fn results_path(&self) -> PathBuf {
        self.resolve_path(&self.results_dir)
    }

    pub fn content_cache_path(&self) -> PathBuf {
        self.resolve_path(&self.content.cache_file)
    }

    /// Worker pool width for one topic.
    pub fn worker_width(&self) -> usize {
        self.dispatch
            .max_workers
            .unwrap_or(self.contexts.len())
            .clamp(1, MAX_WORKERS_CAP)
    }
}

/// Load the topic list from a CSV file with a `query` column.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_topics(path: &Path) -> Result<Vec<Topic>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let csv_err = |source| ConfigError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let column = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .position(|h| h.trim() == "query")
        .ok_or_else(|| ConfigError::MissingQueryColumn(path.to_path_buf()))?;

    let mut topics = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        match row.get(column).map(str::trim) {
            Some(query) if !query.is_empty() => topics.push(Topic::new(query)),
            _ => debug!("Skipping empty topic row"),
        }
    }
    info!(count = topics.len(), "Loaded topics");
    Ok(topics)
}
