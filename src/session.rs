//! Per-context session material (cookies and headers).
//!
//! A session index is a JSON object keyed by session key (the context label
//! unless configured otherwise), with an optional `default` entry used by
//! contexts that have no entry of their own. Each entry points at a cookie
//! jar and carries the headers to present:
//!
//! ```json
//! {
//!   "default":   { "cookie_file": "profiles/neutral.txt", "headers": { "User-Agent": "..." } },
//!   "us-west-1": { "cookie_file": "profiles/us.json", "headers": { "Accept-Language": "en-US" } }
//! }
//! ```
//!
//! Relative `cookie_file` paths resolve against the index's directory. A jar
//! is either a Netscape `cookies.txt` or a JSON array of
//! `{ "domain", "name", "value" }` objects; only cookies for the backend's
//! cookie domain are presented.
//!
//! Indexes and jars are each loaded once per path and shared through a
//! [`SessionCache`], so contexts (and backends) pointing at the same jar
//! share one load. A file that cannot be loaded is cached as empty and its
//! contexts run unauthenticated rather than failing.

use crate::errors::ConfigError;
use crate::models::{Backend, Context, SessionMaterial};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Entry used when a context has no session of its own.
pub const DEFAULT_ENTRY: &str = "default";

const NETSCAPE_HTTP_ONLY: &str = "#HttpOnly_";

/// One entry of a session index.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionEntry {
    pub cookie_file: Option<PathBuf>,
    pub headers: BTreeMap<String, String>,
}

/// Parsed session index file.
#[derive(Debug, Default)]
pub struct SessionIndex {
    base: PathBuf,
    entries: BTreeMap<String, SessionEntry>,
}

impl SessionIndex {
    /// Parse the index at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = read_source(path)?;
        let entries = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            base: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entry for `key`, falling back to the `default` entry.
    fn entry(&self, key: &str) -> Option<&SessionEntry> {
        self.entries
            .get(key)
            .or_else(|| self.entries.get(DEFAULT_ENTRY))
    }

    fn cookie_path(&self, entry: &SessionEntry) -> Option<PathBuf> {
        entry.cookie_file.as_ref().map(|file| self.base.join(file))
    }

    /// Every distinct cookie jar the index references.
    pub fn cookie_files(&self) -> BTreeSet<PathBuf> {
        self.entries
            .values()
            .filter_map(|entry| self.cookie_path(entry))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoredCookie {
    pub domain: String,
    pub name: String,
    pub value: String,
}

/// Cookies read from one jar file, across every domain it holds.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Vec<StoredCookie>,
}

impl CookieJar {
    /// Parse the jar at `path`; JSON when the content is an array, Netscape
    /// `cookies.txt` otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = read_source(path)?;
        if raw.trim_start().starts_with('[') {
            let cookies = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
            return Ok(Self { cookies });
        }
        let (jar, skipped) = Self::parse_netscape(&raw);
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "Ignored malformed cookie lines");
        }
        Ok(jar)
    }

    /// Tab-separated `domain, subdomains, path, secure, expiry, name, value`
    /// lines. Returns the jar and the number of malformed lines skipped.
    fn parse_netscape(raw: &str) -> (Self, usize) {
        let mut skipped = 0;
        let cookies = raw
            .lines()
            .filter_map(|line| {
                let line = line.strip_prefix(NETSCAPE_HTTP_ONLY).unwrap_or(line);
                if line.trim().is_empty() || line.starts_with('#') {
                    return None;
                }
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() != 7 {
                    skipped += 1;
                    return None;
                }
                Some(StoredCookie {
                    domain: fields[0].to_string(),
                    name: fields[5].to_string(),
                    value: fields[6].trim_end_matches('\r').to_string(),
                })
            })
            .collect();
        (Self { cookies }, skipped)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// `name -> value` for cookies set on `domain` or any of its subdomains.
    pub fn for_domain(&self, domain: &str) -> BTreeMap<String, String> {
        self.cookies
            .iter()
            .filter(|c| domain_matches(&c.domain, domain))
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }
}

fn domain_matches(cookie_domain: &str, domain: &str) -> bool {
    let host = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn read_source(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

type Shelf<T> = RwLock<HashMap<PathBuf, Arc<T>>>;

/// Shared value for `path`, loading it on first use.
///
/// Lookups take a shared lock; the first load of a path happens under the
/// write lock so concurrent first requests load once.
fn cached<T>(shelf: &Shelf<T>, path: &Path, load: impl FnOnce() -> T) -> Arc<T> {
    if let Some(hit) = shelf
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(path)
    {
        return Arc::clone(hit);
    }
    let mut shelf = shelf.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(
        shelf
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(load())),
    )
}

/// Process-wide cache of parsed session indexes and cookie jars, keyed by
/// path.
#[derive(Debug, Default)]
pub struct SessionCache {
    indexes: Shelf<SessionIndex>,
    jars: Shelf<CookieJar>,
    jar_loads: AtomicUsize,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, path: &Path) -> Arc<SessionIndex> {
        cached(&self.indexes, path, || match SessionIndex::load(path) {
            Ok(index) => {
                info!(path = %path.display(), entries = index.len(), "Loaded session index");
                index
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Session index unavailable; continuing without session material"
                );
                SessionIndex::default()
            }
        })
    }

    fn jar(&self, path: &Path) -> Arc<CookieJar> {
        cached(&self.jars, path, || {
            self.jar_loads.fetch_add(1, Ordering::SeqCst);
            match CookieJar::load(path) {
                Ok(jar) => {
                    info!(path = %path.display(), cookies = jar.len(), "Loaded cookie jar");
                    jar
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Cookie jar unavailable; continuing without cookies"
                    );
                    CookieJar::default()
                }
            }
        })
    }

    /// Number of distinct cookie jars read so far.
    pub fn jar_loads(&self) -> usize {
        self.jar_loads.load(Ordering::SeqCst)
    }
}

/// Session material for one backend's contexts.
#[derive(Debug, Clone)]
pub struct SessionProvider {
    backend: Backend,
    source: Option<PathBuf>,
    cache: Arc<SessionCache>,
}

impl SessionProvider {
    pub fn new(backend: Backend, source: Option<PathBuf>, cache: Arc<SessionCache>) -> Self {
        Self {
            backend,
            source,
            cache,
        }
    }

    /// Material for `context`: its own entry, else the `default` entry, else
    /// empty material. Cookies are limited to the backend's cookie domain.
    pub fn session_material(&self, context: &Context) -> SessionMaterial {
        let Some(source) = &self.source else {
            debug!(
                backend = %self.backend,
                context = %context.label,
                "No session source configured"
            );
            return SessionMaterial::default();
        };
        let index = self.cache.index(source);
        let Some(entry) = index.entry(&context.session_key) else {
            debug!(
                backend = %self.backend,
                context = %context.label,
                key = %context.session_key,
                "No session entry for context"
            );
            return SessionMaterial::default();
        };
        let cookies = index
            .cookie_path(entry)
            .map(|path| self.cache.jar(&path).for_domain(self.backend.cookie_domain()))
            .unwrap_or_default();
        SessionMaterial {
            cookies,
            headers: entry.headers.clone(),
        }
    }
}
