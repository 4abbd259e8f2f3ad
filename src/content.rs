//! Article content extraction for collected datasets.
//!
//! Reads every dataset CSV of a `{date}/{backend}/{mode}` directory, fetches
//! each url with bounded concurrency, and writes the same rows with an extra
//! `Article_Content` column under the results directory.
//!
//! MSN article pages (`.../ar-{id}`) are read through the MSN detail API,
//! which returns the article HTML in the `body` field of a JSON document.
//! Extracted text is kept in a JSON cache keyed by url, so reruns only fetch
//! what is missing.

use crate::errors::{ContentError, PersistenceError};
use crate::outputs::write_atomic;
use crate::retry::RetryPolicy;
use crate::utils::clean_article_text;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Name of the column appended to every dataset.
pub const CONTENT_COLUMN: &str = "Article_Content";
/// The cache is flushed to disk after this many new entries.
pub const CACHE_SAVE_EVERY: usize = 25;

static MSN_ARTICLE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/ar-([^?/#]+)").unwrap());
static ARTICLE_PARAGRAPHS: Lazy<Selector> = Lazy::new(|| Selector::parse("article p").unwrap());
static ARTICLE: Lazy<Selector> = Lazy::new(|| Selector::parse("article").unwrap());
static PARAGRAPHS: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());

/// MSN detail API url for an MSN article url.
pub fn msn_detail_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    if !parsed.host_str().is_some_and(|h| h.ends_with("msn.com")) {
        return None;
    }
    MSN_ARTICLE_ID
        .captures(parsed.path())
        .map(|c| format!("https://assets.msn.com/content/view/v2/Detail/en-us/{}", &c[1]))
}

/// Main text of an article page: paragraphs inside `<article>`, else the
/// `<article>` text, else every paragraph on the page.
pub fn extract_article_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let join = |parts: Vec<String>| {
        parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut text = join(
        doc.select(&ARTICLE_PARAGRAPHS)
            .map(|p| p.text().collect::<String>())
            .collect(),
    );
    if text.trim().is_empty() {
        text = join(
            doc.select(&ARTICLE)
                .map(|a| a.text().collect::<Vec<_>>().join(" "))
                .collect(),
        );
    }
    if text.trim().is_empty() {
        text = join(
            doc.select(&PARAGRAPHS)
                .map(|p| p.text().collect::<String>())
                .collect(),
        );
    }
    clean_article_text(&text)
}

/// Fetches a page body.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, ContentError>;
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, ContentError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, ContentError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ContentError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp.text().await?)
    }
}

/// Url to article text, persisted as JSON.
#[derive(Debug)]
pub struct ContentCache {
    path: PathBuf,
    inner: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<String, String>,
    unsaved: usize,
}

impl ContentCache {
    /// Load the cache at `path`; a missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Content cache unreadable; starting empty"
                );
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        info!(path = %path.display(), entries = entries.len(), "Loaded content cache");
        Self {
            path,
            inner: Mutex::new(CacheState {
                entries,
                unsaved: 0,
            }),
        }
    }

    pub fn get(&self, url: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(url)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Store an entry, flushing every [`CACHE_SAVE_EVERY`] new entries.
    pub fn insert(&self, url: &str, content: &str) -> Result<(), PersistenceError> {
        let snapshot = {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if state
                .entries
                .insert(url.to_string(), content.to_string())
                .is_none()
            {
                state.unsaved += 1;
            }
            if state.unsaved < CACHE_SAVE_EVERY {
                return Ok(());
            }
            state.unsaved = 0;
            state.entries.clone()
        };
        self.write(&snapshot)
    }

    pub fn save(&self) -> Result<(), PersistenceError> {
        let snapshot = {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.unsaved = 0;
            state.entries.clone()
        };
        self.write(&snapshot)
    }

    fn write(&self, entries: &BTreeMap<String, String>) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec(entries).map_err(|source| PersistenceError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json)?;
        debug!(path = %self.path.display(), entries = entries.len(), "Saved content cache");
        Ok(())
    }
}

#[derive(Deserialize)]
struct MsnDetail {
    body: String,
}

/// Counts for one processed directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContentReport {
    pub files: usize,
    pub urls: usize,
    pub extracted: usize,
}

pub struct ContentExtractor {
    fetcher: Arc<dyn PageFetcher>,
    cache: Arc<ContentCache>,
    retry: RetryPolicy,
    max_workers: usize,
}

impl ContentExtractor {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        cache: Arc<ContentCache>,
        retry: RetryPolicy,
        max_workers: usize,
    ) -> Self {
        Self {
            fetcher,
            cache,
            retry,
            max_workers: max_workers.max(1),
        }
    }

    async fn extract(&self, url: &str) -> Result<String, ContentError> {
        url::Url::parse(url).map_err(|_| ContentError::BadUrl(url.to_string()))?;
        let html = match msn_detail_url(url) {
            Some(api) => {
                let raw = self.fetcher.fetch(&api).await?;
                serde_json::from_str::<MsnDetail>(&raw)
                    .map_err(|_| ContentError::Empty(url.to_string()))?
                    .body
            }
            None => self.fetcher.fetch(url).await?,
        };
        let text = extract_article_text(&html);
        if text.is_empty() {
            return Err(ContentError::Empty(url.to_string()));
        }
        Ok(text)
    }

    /// Article text for `url`, from the cache when possible.
    pub async fn content_for(&self, url: &str) -> Option<String> {
        if let Some(hit) = self.cache.get(url) {
            debug!(%url, "Content cache hit");
            return Some(hit);
        }
        match self
            .retry
            .run(url, ContentError::is_transient, || self.extract(url))
            .await
        {
            Ok(text) => {
                if let Err(e) = self.cache.insert(url, &text) {
                    warn!(error = %e, "Could not persist content cache");
                }
                Some(text)
            }
            Err(e) => {
                warn!(%url, error = %e, "Content extraction failed");
                None
            }
        }
    }

    /// Add the content column to one dataset file.
    ///
    /// Returns `(urls, extracted)`; files without a `url` column are skipped.
    #[instrument(level = "info", skip_all, fields(input = %input.display()))]
    pub async fn process_file(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<(usize, usize), ContentError> {
        let read_err = |source| {
            ContentError::Persistence(PersistenceError::Csv {
                path: input.to_path_buf(),
                source,
            })
        };
        let mut reader = csv::Reader::from_path(input).map_err(read_err)?;
        let headers = reader.headers().map_err(read_err)?.clone();
        let Some(url_col) = headers.iter().position(|h| h == "url") else {
            warn!("No url column; skipping file");
            return Ok((0, 0));
        };
        let rows: Vec<csv::StringRecord> = reader
            .records()
            .collect::<Result<_, _>>()
            .map_err(read_err)?;

        let mut urls: Vec<&str> = rows
            .iter()
            .filter_map(|r| r.get(url_col))
            .filter(|u| !u.trim().is_empty())
            .collect();
        urls.sort_unstable();
        urls.dedup();

        let contents: HashMap<&str, Option<String>> = stream::iter(urls.iter().copied())
            .map(|url| async move { (url, self.content_for(url).await) })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;
        let extracted = contents.values().filter(|c| c.is_some()).count();

        let write_err = |source| {
            ContentError::Persistence(PersistenceError::Csv {
                path: output.to_path_buf(),
                source,
            })
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut out_headers = headers.clone();
        out_headers.push_field(CONTENT_COLUMN);
        writer.write_record(&out_headers).map_err(write_err)?;
        for row in &rows {
            let content = row
                .get(url_col)
                .and_then(|u| contents.get(u))
                .and_then(|c| c.as_deref())
                .unwrap_or("");
            let mut out = row.clone();
            out.push_field(content);
            writer.write_record(&out).map_err(write_err)?;
        }
        let bytes = writer.into_inner().map_err(|e| {
            ContentError::Persistence(PersistenceError::Io {
                path: output.to_path_buf(),
                source: e.into_error(),
            })
        })?;
        write_atomic(output, &bytes)?;

        info!(
            output = %output.display(),
            urls = urls.len(),
            extracted,
            "Wrote content dataset"
        );
        Ok((urls.len(), extracted))
    }

    /// Process every `*.csv` in `input_dir` into `output_dir`.
    #[instrument(level = "info", skip_all, fields(input = %input_dir.display()))]
    pub async fn process_dir(
        &self,
        input_dir: &Path,
        output_dir: &Path,
    ) -> Result<ContentReport, ContentError> {
        let dir_err = |source| {
            ContentError::Persistence(PersistenceError::Io {
                path: input_dir.to_path_buf(),
                source,
            })
        };
        let mut files: Vec<PathBuf> = std::fs::read_dir(input_dir)
            .map_err(dir_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        files.sort();

        let mut report = ContentReport::default();
        for file in &files {
            let Some(name) = file.file_name() else { continue };
            match self.process_file(file, &output_dir.join(name)).await {
                Ok((urls, extracted)) => {
                    report.files += 1;
                    report.urls += urls;
                    report.extracted += extracted;
                }
                Err(e) => warn!(file = %file.display(), error = %e, "Failed to process dataset"),
            }
        }
        self.cache.save()?;
        info!(
            files = report.files,
            urls = report.urls,
            extracted = report.extracted,
            cached = self.cache.len(),
            "Content extraction finished"
        );
        Ok(report)
    }
}
