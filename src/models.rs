//! Data models shared across the collection pipeline.
//!
//! This module defines the core data structures:
//! - [`Topic`] and [`ContextLabel`]: the two coordinates of a unit of work
//! - [`Context`] and [`ExecutionUnit`]: the execution environment of a request
//! - [`SessionMaterial`]: cookies and headers presented by a context
//! - [`ResultRecord`]: one scraped search result
//! - [`CollectionRun`] and [`TerminationReason`]: the outcome of one fetch loop
//! - [`Backend`]: the search engine being scraped

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A search query. Immutable, identifies a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(query: impl Into<String>) -> Self {
        Self(query.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity label of an execution context, e.g. `us-west-1`.
///
/// Labels are validated at config load to `[A-Za-z0-9.-]+`, which keeps
/// dataset file names injective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextLabel(String);

impl ContextLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(label: &str) -> bool {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    }
}

impl fmt::Display for ContextLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote invocable capability bound to one context.
///
/// Health is not tracked here; it is inferred from invocation outcomes and
/// acted on through the registry's redeploy signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    /// Opaque identity, e.g. a function ARN.
    pub identity: String,
    /// Invocation endpoint URL.
    pub endpoint: String,
    /// Geographic or network region the unit runs in.
    #[serde(default)]
    pub location: String,
}

/// An execution environment used to vary the apparent origin of a request.
///
/// The label doubles as the reference to the context's execution unit,
/// resolved through the unit registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub label: ContextLabel,
    /// Entry of the session source file to use; defaults to the label.
    pub session_key: String,
}

impl Context {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            session_key: label.clone(),
            label: ContextLabel::new(label),
        }
    }
}

/// Cookies and headers establishing a browsing identity. Read-only after load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMaterial {
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl SessionMaterial {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.headers.is_empty()
    }

    /// Case-insensitive `User-Agent` lookup.
    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .map(|(_, v)| v.as_str())
    }
}

/// Search engine being scraped. One backend is one cookie domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    GoogleNews,
    BingNews,
}

impl Backend {
    /// Name used in dataset paths and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::GoogleNews => "google_news",
            Backend::BingNews => "bing_news",
        }
    }

    pub fn cookie_domain(&self) -> &'static str {
        match self {
            Backend::GoogleNews => "google.com",
            Backend::BingNews => "bing.com",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One scraped search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub title: String,
    /// Unique key within a (topic, context) collection.
    pub url: String,
    pub snippet: String,
    /// Publication name, empty when the backend does not show one.
    pub source: String,
    /// 1-based page number.
    pub page: u32,
    /// 1-based rank within its page.
    pub rank: u32,
    pub topic: Topic,
    pub context: ContextLabel,
    pub collected_at: DateTime<Utc>,
}

/// Why a fetch loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    ThresholdReached,
    PageLimitReached,
    /// An empty page followed a non-empty one.
    NaturalEnd,
    /// Page 0 stayed empty after its single recovery.
    NoResults,
    RecoveryExhausted,
    Interrupted,
    Failed,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::ThresholdReached => "threshold-reached",
            TerminationReason::PageLimitReached => "page-limit-reached",
            TerminationReason::NaturalEnd => "natural-end",
            TerminationReason::NoResults => "no-results",
            TerminationReason::RecoveryExhausted => "recovery-exhausted",
            TerminationReason::Interrupted => "interrupted",
            TerminationReason::Failed => "failed",
        }
    }

    /// Whether the loop ended on its own terms rather than by giving up.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminationReason::ThresholdReached
                | TerminationReason::PageLimitReached
                | TerminationReason::NaturalEnd
                | TerminationReason::NoResults
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one (topic, context) fetch loop. Flushed then discarded.
#[derive(Debug, Clone)]
pub struct CollectionRun {
    pub topic: Topic,
    pub context: ContextLabel,
    pub records: Vec<ResultRecord>,
    pub pages_fetched: u32,
    pub recoveries: u32,
    pub reason: TerminationReason,
    /// Human readable detail for `failed` and `recovery-exhausted`.
    pub detail: Option<String>,
}

impl CollectionRun {
    pub fn failed(topic: Topic, context: ContextLabel, detail: impl Into<String>) -> Self {
        Self {
            topic,
            context,
            records: Vec::new(),
            pages_fetched: 0,
            recoveries: 0,
            reason: TerminationReason::Failed,
            detail: Some(detail.into()),
        }
    }
}

/// Per-context bookkeeping kept by the dispatcher after records are flushed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextOutcome {
    pub topic: Topic,
    pub context: ContextLabel,
    pub records: usize,
    pub pages_fetched: u32,
    pub recoveries: u32,
    pub reason: TerminationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&CollectionRun> for ContextOutcome {
    fn from(run: &CollectionRun) -> Self {
        Self {
            topic: run.topic.clone(),
            context: run.context.clone(),
            records: run.records.len(),
            pages_fetched: run.pages_fetched,
            recoveries: run.recoveries,
            reason: run.reason.clone(),
            detail: run.detail.clone(),
        }
    }
}
