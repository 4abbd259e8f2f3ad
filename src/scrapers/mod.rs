//! Search backend parsers.
//!
//! Each backend implements [`ResultParser`]: it builds the request for a
//! results page and turns the returned HTML into [`ResultRecord`]s. Parsers
//! are selected once per backend with [`parser_for`].
//!
//! # Extraction
//!
//! Result containers are located by trying a list of selector strategies in
//! a fixed priority order; the first strategy that matches anything wins.
//! Within a container every field also has an ordered selector list. Missing
//! fields become empty strings, and items with neither a title nor a link are
//! dropped. At most [`MAX_RESULTS_PER_PAGE`] items are read per page.

pub mod bing_news;
pub mod google_news;

use crate::models::{Backend, ContextLabel, ResultRecord, Topic};
use crate::utils::clean_text;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub use bing_news::BingNewsParser;
pub use google_news::GoogleNewsParser;

/// Upper bound of items read from one results page.
pub const MAX_RESULTS_PER_PAGE: usize = 20;

/// Kind of search issued against a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    /// News vertical search.
    #[default]
    News,
    /// Plain web search used to accumulate search history on a session.
    SearchHistory,
}

/// Backend-specific request for one results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    pub url: String,
    pub params: BTreeMap<String, String>,
}

/// Composes a [`SearchRequest`] from base, mode and pagination groups.
#[derive(Debug, Clone)]
pub struct SearchRequestBuilder {
    url: String,
    params: BTreeMap<String, String>,
}

impl SearchRequestBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn query(mut self, topic: &Topic) -> Self {
        self.params.insert("q".into(), topic.as_str().to_string());
        self
    }

    pub fn mode(mut self, pairs: &[(&str, &str)]) -> Self {
        for (k, v) in pairs {
            self.params.insert((*k).to_string(), (*v).to_string());
        }
        self
    }

    /// Offset parameter `name = page_index * items_per_page`, omitted on the
    /// first page.
    pub fn paginate(mut self, name: &str, page_index: u32, items_per_page: u32) -> Self {
        if page_index > 0 {
            self.params
                .insert(name.to_string(), (page_index * items_per_page).to_string());
        }
        self
    }

    pub fn build(self) -> SearchRequest {
        SearchRequest {
            url: self.url,
            params: self.params,
        }
    }
}

/// Coordinates of the page being parsed.
#[derive(Debug, Clone)]
pub struct ParseContext<'a> {
    pub topic: &'a Topic,
    pub context: &'a ContextLabel,
    /// 0-based page index.
    pub page_index: u32,
    /// Whether the session presents a mobile browser.
    pub mobile: bool,
    pub collected_at: DateTime<Utc>,
}

/// Polymorphic per-backend parsing capability.
pub trait ResultParser: Send + Sync {
    fn backend(&self) -> Backend;

    /// Request for page `page_index` (0-based) of `topic`.
    fn build_request(&self, topic: &Topic, page_index: u32, items_per_page: u32) -> SearchRequest;

    fn parse_results(&self, body: &str, ctx: &ParseContext<'_>) -> Vec<ResultRecord>;

    /// Whether the body is a bot challenge rather than a results page.
    fn is_challenge(&self, body: &str) -> bool;
}

/// Parser for a backend, chosen once at configuration time.
pub fn parser_for(backend: Backend, kind: SearchKind) -> Arc<dyn ResultParser> {
    match backend {
        Backend::GoogleNews => Arc::new(GoogleNewsParser::new(kind)),
        Backend::BingNews => Arc::new(BingNewsParser::new(kind)),
    }
}

/// Ordered selector lists for one page layout.
#[derive(Debug)]
pub(crate) struct SelectorProfile {
    containers: Vec<Selector>,
    title: Vec<Selector>,
    source: Vec<Selector>,
    snippet: Vec<Selector>,
    link: Vec<Selector>,
}

fn compile(list: &[&str]) -> Vec<Selector> {
    list.iter()
        .map(|css| Selector::parse(css).unwrap())
        .collect()
}

impl SelectorProfile {
    /// Build a profile from constant CSS selectors.
    pub(crate) fn new(
        containers: &[&str],
        title: &[&str],
        source: &[&str],
        snippet: &[&str],
        link: &[&str],
    ) -> Self {
        Self {
            containers: compile(containers),
            title: compile(title),
            source: compile(source),
            snippet: compile(snippet),
            link: compile(link),
        }
    }

    /// First container strategy with a non-empty match set, capped.
    fn items<'a>(&self, doc: &'a Html) -> Vec<ElementRef<'a>> {
        for (strategy, selector) in self.containers.iter().enumerate() {
            let found: Vec<_> = doc.select(selector).take(MAX_RESULTS_PER_PAGE).collect();
            if !found.is_empty() {
                debug!(strategy, count = found.len(), "Matched result containers");
                return found;
            }
        }
        Vec::new()
    }

    /// Extract records from a document; `resolve_link` turns a raw href into
    /// an absolute target url.
    pub(crate) fn extract(
        &self,
        body: &str,
        ctx: &ParseContext<'_>,
        resolve_link: impl Fn(&str) -> Option<String>,
    ) -> Vec<ResultRecord> {
        let doc = Html::parse_document(body);
        let mut records = Vec::new();

        for item in self.items(&doc) {
            let title = first_text(item, &self.title);
            let url = first_attr(item, &self.link, "href")
                .and_then(|href| resolve_link(&href))
                .unwrap_or_default();
            if title.is_empty() && url.is_empty() {
                continue;
            }
            records.push(ResultRecord {
                title,
                url,
                snippet: first_text(item, &self.snippet),
                source: first_text(item, &self.source),
                page: ctx.page_index + 1,
                rank: records.len() as u32 + 1,
                topic: ctx.topic.clone(),
                context: ctx.context.clone(),
                collected_at: ctx.collected_at,
            });
        }
        records
    }
}

/// Cleaned text of the first selector that matches inside `item`.
pub(crate) fn first_text(item: ElementRef<'_>, selectors: &[Selector]) -> String {
    selectors
        .iter()
        .find_map(|s| item.select(s).next())
        .map(|el| clean_text(&el.text().collect::<Vec<_>>().join(" ")))
        .unwrap_or_default()
}

/// Attribute of the first element that matches inside `item` and carries it.
pub(crate) fn first_attr(
    item: ElementRef<'_>,
    selectors: &[Selector],
    attr: &str,
) -> Option<String> {
    selectors.iter().find_map(|s| {
        item.select(s)
            .find_map(|el| el.value().attr(attr))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Case-insensitive search for any of `markers` in `body`.
pub(crate) fn contains_marker(body: &str, markers: &[&str]) -> bool {
    let lower = body.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}
