//! Test doubles shared by the fetcher, dispatcher and pipeline tests.
//!
//! The scripted transport answers by page index, which [`ScriptedParser`]
//! encodes into every request, so contexts sharing one transport see the
//! same script independently.

use crate::config::FetchSettings;
use crate::errors::TransportError;
use crate::fetcher::PaginatedFetcher;
use crate::models::{Backend, ContextLabel, ExecutionUnit, ResultRecord, Topic};
use crate::retry::{DelayWindow, RetryPolicy};
use crate::scrapers::{ParseContext, ResultParser, SearchRequest, SearchRequestBuilder};
use crate::session::{SessionCache, SessionProvider};
use crate::units::{InvocationRequest, InvocationResponse, Redeployer, UnitRegistry, UnitTransport};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CHALLENGE_BODY: &str = "challenge";

pub fn unit(identity: &str) -> ExecutionUnit {
    ExecutionUnit {
        identity: identity.to_string(),
        endpoint: format!("https://{identity}.test/invoke"),
        location: "test".to_string(),
    }
}

/// Production cadence with every delay set to zero.
pub fn fast_settings() -> FetchSettings {
    FetchSettings {
        page_delay: DelayWindow::zero(),
        recovery_cooldown: DelayWindow::zero(),
        max_recoveries: 3,
        ..FetchSettings::default()
    }
}

enum Script {
    Pages(Vec<usize>),
    Failing,
    Status(u16, String),
}

/// Unit transport answering from a script.
pub struct ScriptedTransport {
    script: Script,
    challenges: AtomicUsize,
    panic_unit: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn with(script: Script) -> Self {
        Self {
            script,
            challenges: AtomicUsize::new(0),
            panic_unit: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Page `i` yields `counts[i]` results; pages past the end are empty.
    pub fn pages(counts: Vec<usize>) -> Self {
        Self::with(Script::Pages(counts))
    }

    /// The first `n` calls answer with a challenge page.
    pub fn challenge_then_pages(n: usize, counts: Vec<usize>) -> Self {
        let transport = Self::pages(counts);
        transport.challenges.store(n, Ordering::SeqCst);
        transport
    }

    /// Every call fails with a transient transport error.
    pub fn failing() -> Self {
        Self::with(Script::Failing)
    }

    pub fn status(code: u16, body: &str) -> Self {
        Self::with(Script::Status(code, body.to_string()))
    }

    /// Panic whenever `identity` is invoked.
    pub fn panic_for(mut self, identity: &str) -> Self {
        self.panic_unit = Some(identity.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitTransport for ScriptedTransport {
    async fn invoke(
        &self,
        unit: &ExecutionUnit,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_unit.as_deref() == Some(unit.identity.as_str()) {
            panic!("scripted crash for {}", unit.identity);
        }
        let ok = |body: String| InvocationResponse {
            status_code: 200,
            body,
        };
        match &self.script {
            Script::Failing => Err(TransportError::Status(503)),
            Script::Status(code, body) => Ok(InvocationResponse {
                status_code: *code,
                body: body.clone(),
            }),
            Script::Pages(counts) => {
                let pending = self.challenges.load(Ordering::SeqCst);
                if pending > 0 {
                    self.challenges.store(pending - 1, Ordering::SeqCst);
                    return Ok(ok(CHALLENGE_BODY.to_string()));
                }
                let page: usize = request
                    .params
                    .get("page")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                Ok(ok(format!("items:{}", counts.get(page).copied().unwrap_or(0))))
            }
        }
    }
}

/// Redeployer whose redeploys never complete.
#[derive(Default)]
pub struct BlockingRedeployer {
    calls: AtomicUsize,
}

impl BlockingRedeployer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Redeployer for BlockingRedeployer {
    async fn redeploy(
        &self,
        _unit: &ExecutionUnit,
        _label: &ContextLabel,
    ) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Parser for `items:N` bodies, producing `N` distinct records.
#[derive(Debug, Default)]
pub struct ScriptedParser;

impl ScriptedParser {
    pub fn new() -> Self {
        Self
    }
}

impl ResultParser for ScriptedParser {
    fn backend(&self) -> Backend {
        Backend::GoogleNews
    }

    fn build_request(&self, topic: &Topic, page_index: u32, _items_per_page: u32) -> SearchRequest {
        let page = page_index.to_string();
        SearchRequestBuilder::new("https://search.test/news")
            .query(topic)
            .mode(&[("page", page.as_str())])
            .build()
    }

    fn parse_results(&self, body: &str, ctx: &ParseContext<'_>) -> Vec<ResultRecord> {
        let count: usize = body
            .strip_prefix("items:")
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        (0..count)
            .map(|i| ResultRecord {
                title: format!("Story {i} about {}", ctx.topic),
                url: format!(
                    "https://news.test/{}/{}/{}/{i}",
                    ctx.topic, ctx.context, ctx.page_index
                ),
                snippet: format!("snippet {i}"),
                source: format!("Source {}", i % 3),
                page: ctx.page_index + 1,
                rank: i as u32 + 1,
                topic: ctx.topic.clone(),
                context: ctx.context.clone(),
                collected_at: ctx.collected_at,
            })
            .collect()
    }

    fn is_challenge(&self, body: &str) -> bool {
        body == CHALLENGE_BODY
    }
}

fn build_fetcher(
    units: BTreeMap<ContextLabel, ExecutionUnit>,
    transport: Arc<ScriptedTransport>,
    redeployer: Arc<BlockingRedeployer>,
    parser: ScriptedParser,
    settings: FetchSettings,
) -> PaginatedFetcher {
    let registry = UnitRegistry::new(units, transport, redeployer, RetryPolicy::immediate(2));
    let sessions = SessionProvider::new(Backend::GoogleNews, None, Arc::new(SessionCache::new()));
    PaginatedFetcher::new(Arc::new(parser), Arc::new(registry), sessions, settings)
}

/// Fetcher where each label has its own unit named `unit-{label}`.
pub fn fetcher_with(
    transport: Arc<ScriptedTransport>,
    redeployer: Arc<BlockingRedeployer>,
    parser: ScriptedParser,
    labels: &[&str],
    settings: FetchSettings,
) -> PaginatedFetcher {
    let units = labels
        .iter()
        .map(|l| (ContextLabel::new(*l), unit(&format!("unit-{l}"))))
        .collect();
    build_fetcher(units, transport, redeployer, parser, settings)
}

/// Fetcher where every label resolves to the same unit.
pub fn fetcher_sharing_unit(
    transport: Arc<ScriptedTransport>,
    redeployer: Arc<BlockingRedeployer>,
    parser: ScriptedParser,
    labels: &[&str],
    identity: &str,
    settings: FetchSettings,
) -> PaginatedFetcher {
    let units = labels
        .iter()
        .map(|l| (ContextLabel::new(*l), unit(identity)))
        .collect();
    build_fetcher(units, transport, redeployer, parser, settings)
}
