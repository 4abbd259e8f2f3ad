//! Per-context pagination loop.
//!
//! One [`PaginatedFetcher::run`] collects one topic through one context:
//!
//! ```text
//! Fetching(p) --records--> Deciding --continue--> Sleeping --> Fetching(p+1)
//!      |                       \--stop--> Done
//!      +--anomaly--> Recovering --cooldown--> Fetching(p)
//!      +--empty----> Done(natural-end | no-results) or Recovering (page 0, once)
//! ```
//!
//! Anomalies are transport failures, non-2xx unit statuses, and empty pages
//! carrying a challenge marker. Each recovery asks the registry to redeploy
//! the unit and waits a randomized cooldown before retrying the same page.
//! The loop never returns an error: every outcome is a [`CollectionRun`].

use crate::config::FetchSettings;
use crate::models::{
    Backend, CollectionRun, Context, ExecutionUnit, ResultRecord, TerminationReason, Topic,
};
use crate::scrapers::{ParseContext, ResultParser};
use crate::session::SessionProvider;
use crate::units::{InvocationRequest, UnitRegistry};
use crate::utils::{is_mobile_user_agent, user_agent_env};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug)]
enum State {
    Fetching(u32),
    Recovering { page: u32, cause: String },
    Sleeping(u32),
    Done(TerminationReason),
}

/// Result of fetching and parsing one page.
#[derive(Debug)]
enum PageOutcome {
    Records(Vec<ResultRecord>),
    Empty,
    Anomaly(String),
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `true` when interrupted. A dropped sender never interrupts.
pub(crate) async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    if duration.is_zero() {
        return false;
    }
    let stop = async {
        let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
        if signalled {
            true
        } else {
            std::future::pending().await
        }
    };
    tokio::select! {
        _ = sleep(duration) => false,
        stopped = stop => stopped,
    }
}

pub struct PaginatedFetcher {
    backend: Backend,
    parser: Arc<dyn ResultParser>,
    registry: Arc<UnitRegistry>,
    sessions: SessionProvider,
    settings: FetchSettings,
}

impl PaginatedFetcher {
    pub fn new(
        parser: Arc<dyn ResultParser>,
        registry: Arc<UnitRegistry>,
        sessions: SessionProvider,
        settings: FetchSettings,
    ) -> Self {
        Self {
            backend: parser.backend(),
            parser,
            registry,
            sessions,
            settings,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Collect `topic` through `context` until a stop condition is met.
    #[instrument(
        level = "info",
        skip_all,
        fields(backend = %self.backend, topic = %topic, context = %context.label)
    )]
    pub async fn run(
        &self,
        topic: &Topic,
        context: &Context,
        mut shutdown: watch::Receiver<bool>,
    ) -> CollectionRun {
        let unit = match self.registry.resolve(&context.label) {
            Ok(unit) => unit.clone(),
            Err(e) => {
                error!(error = %e, "Cannot collect without a unit");
                return CollectionRun::failed(topic.clone(), context.label.clone(), e.to_string());
            }
        };

        let session = self.sessions.session_material(context);
        let user_agent = session.user_agent().unwrap_or_default();
        let mobile = is_mobile_user_agent(user_agent);
        info!(
            unit = %unit.identity,
            location = %unit.location,
            env = %user_agent_env(user_agent),
            mobile,
            has_session = !session.is_empty(),
            "Starting collection"
        );

        let started = Instant::now();
        let mut run = CollectionRun {
            topic: topic.clone(),
            context: context.label.clone(),
            records: Vec::new(),
            pages_fetched: 0,
            recoveries: 0,
            reason: TerminationReason::Failed,
            detail: None,
        };
        let mut retried_empty_first_page = false;
        let mut state = State::Fetching(0);

        loop {
            state = match state {
                State::Fetching(page) => {
                    if *shutdown.borrow() {
                        State::Done(TerminationReason::Interrupted)
                    } else {
                        let request = InvocationRequest::new(
                            self.parser
                                .build_request(topic, page, self.settings.items_per_page),
                            &session,
                        );
                        match self.fetch_page(&unit, &request, &run, page, mobile).await {
                            PageOutcome::Records(records) => {
                                run.pages_fetched = page + 1;
                                run.records.extend(records);
                                self.decide(page, run.records.len())
                            }
                            PageOutcome::Empty if page == 0 && !retried_empty_first_page => {
                                retried_empty_first_page = true;
                                State::Recovering {
                                    page,
                                    cause: "empty first page".into(),
                                }
                            }
                            PageOutcome::Empty => {
                                run.pages_fetched = page + 1;
                                if run.records.is_empty() {
                                    State::Done(TerminationReason::NoResults)
                                } else {
                                    State::Done(TerminationReason::NaturalEnd)
                                }
                            }
                            PageOutcome::Anomaly(cause) => State::Recovering { page, cause },
                        }
                    }
                }
                State::Recovering { page, cause } => {
                    if self.recovery_exhausted(run.recoveries, started) {
                        error!(
                            page,
                            recoveries = run.recoveries,
                            %cause,
                            "Giving up on context"
                        );
                        run.detail = Some(cause);
                        State::Done(TerminationReason::RecoveryExhausted)
                    } else {
                        run.recoveries += 1;
                        let requested = self.registry.request_redeploy(&unit, &context.label);
                        let cooldown = self.settings.recovery_cooldown.sample();
                        warn!(
                            page,
                            recovery = run.recoveries,
                            %cause,
                            redeploy_requested = requested,
                            redeploys_in_flight = self.registry.redeploys_in_flight(),
                            ?cooldown,
                            "Recovering"
                        );
                        if pause(cooldown, &mut shutdown).await {
                            State::Done(TerminationReason::Interrupted)
                        } else {
                            State::Fetching(page)
                        }
                    }
                }
                State::Sleeping(next) => {
                    let delay = self.settings.page_delay.sample();
                    debug!(next_page = next, ?delay, "Waiting before next page");
                    if pause(delay, &mut shutdown).await {
                        State::Done(TerminationReason::Interrupted)
                    } else {
                        State::Fetching(next)
                    }
                }
                State::Done(reason) => {
                    run.reason = reason;
                    break;
                }
            };
        }

        info!(
            reason = %run.reason,
            records = run.records.len(),
            pages = run.pages_fetched,
            recoveries = run.recoveries,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collection finished"
        );
        run
    }

    async fn fetch_page(
        &self,
        unit: &ExecutionUnit,
        request: &InvocationRequest,
        run: &CollectionRun,
        page: u32,
        mobile: bool,
    ) -> PageOutcome {
        let response = match self.registry.invoke(unit, request).await {
            Ok(response) => response,
            Err(e) => return PageOutcome::Anomaly(format!("transport: {e}")),
        };
        if !response.is_success() {
            return PageOutcome::Anomaly(format!("unit status {}", response.status_code));
        }

        let html = response.html();
        let ctx = ParseContext {
            topic: &run.topic,
            context: &run.context,
            page_index: page,
            mobile,
            collected_at: Utc::now(),
        };
        let records = self.parser.parse_results(&html, &ctx);
        if !records.is_empty() {
            PageOutcome::Records(records)
        } else if self.parser.is_challenge(&html) {
            PageOutcome::Anomaly("challenge page".into())
        } else {
            PageOutcome::Empty
        }
    }

    /// Stop rule applied after a non-empty page.
    fn decide(&self, page: u32, accumulated: usize) -> State {
        if accumulated >= self.settings.record_threshold {
            State::Done(TerminationReason::ThresholdReached)
        } else if page + 1 >= self.settings.page_limit {
            State::Done(TerminationReason::PageLimitReached)
        } else {
            State::Sleeping(page + 1)
        }
    }

    fn recovery_exhausted(&self, recoveries: u32, started: Instant) -> bool {
        if recoveries >= self.settings.max_recoveries {
            return true;
        }
        self.settings
            .max_duration()
            .is_some_and(|limit| started.elapsed() >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextLabel;
    use crate::retry::DelayWindow;
    use crate::testing::{
        BlockingRedeployer, ScriptedParser, ScriptedTransport, fast_settings, fetcher_with,
    };

    fn gun() -> Topic {
        Topic::new("gun")
    }

    #[tokio::test]
    async fn test_threshold_reached_on_fifth_page() {
        let transport = Arc::new(ScriptedTransport::pages((0..10).map(|_| 10).collect()));
        let fetcher = fetcher_with(
            transport,
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            fast_settings(),
        );
        let (_tx, rx) = watch::channel(false);

        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert_eq!(run.records.len(), 50);
        assert_eq!(run.pages_fetched, 5);
        assert_eq!(run.reason, TerminationReason::ThresholdReached);
        assert_eq!(run.records[49].page, 5);
    }

    #[tokio::test]
    async fn test_page_limit_reached_below_threshold() {
        let transport = Arc::new(ScriptedTransport::pages(vec![3, 3, 3, 3, 3, 3]));
        let mut settings = fast_settings();
        settings.page_limit = 3;
        let fetcher = fetcher_with(
            transport,
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            settings,
        );
        let (_tx, rx) = watch::channel(false);

        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert_eq!(run.records.len(), 9);
        assert_eq!(run.pages_fetched, 3);
        assert_eq!(run.reason, TerminationReason::PageLimitReached);
    }

    #[tokio::test]
    async fn test_empty_page_after_results_is_natural_end() {
        let transport = Arc::new(ScriptedTransport::pages(vec![12, 0]));
        let fetcher = fetcher_with(
            Arc::clone(&transport),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            fast_settings(),
        );
        let (_tx, rx) = watch::channel(false);

        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert_eq!(run.records.len(), 12);
        assert_eq!(run.reason, TerminationReason::NaturalEnd);
        assert_eq!(run.recoveries, 0);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_first_page_recovers_once() {
        let transport = Arc::new(ScriptedTransport::pages(vec![0]));
        let redeployer = Arc::new(BlockingRedeployer::default());
        let fetcher = fetcher_with(
            Arc::clone(&transport),
            Arc::clone(&redeployer),
            ScriptedParser::new(),
            &["us-west-1"],
            fast_settings(),
        );
        let (_tx, rx) = watch::channel(false);

        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert!(run.records.is_empty());
        assert_eq!(run.reason, TerminationReason::NoResults);
        assert_eq!(run.recoveries, 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_challenge_page_is_recovered_then_collected() {
        let transport = Arc::new(ScriptedTransport::challenge_then_pages(2, vec![4, 0]));
        let fetcher = fetcher_with(
            Arc::clone(&transport),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            fast_settings(),
        );
        let (_tx, rx) = watch::channel(false);

        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert_eq!(run.recoveries, 2);
        assert_eq!(run.records.len(), 4);
        assert_eq!(run.reason, TerminationReason::NaturalEnd);
    }

    #[tokio::test]
    async fn test_failing_unit_exhausts_recoveries() {
        let transport = Arc::new(ScriptedTransport::failing());
        let redeployer = Arc::new(BlockingRedeployer::default());
        let mut settings = fast_settings();
        settings.max_recoveries = 4;
        let fetcher = fetcher_with(
            transport,
            Arc::clone(&redeployer),
            ScriptedParser::new(),
            &["us-west-1"],
            settings,
        );
        let (_tx, rx) = watch::channel(false);

        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert_eq!(run.reason, TerminationReason::RecoveryExhausted);
        assert_eq!(run.recoveries, 4);
        assert!(run.detail.as_deref().unwrap_or_default().contains("transport"));
        // the first redeploy never completes, so later requests are suppressed
        tokio::task::yield_now().await;
        assert!(redeployer.calls() <= 1);
    }

    #[tokio::test]
    async fn test_unknown_context_fails_without_panicking() {
        let fetcher = fetcher_with(
            Arc::new(ScriptedTransport::pages(vec![10])),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            fast_settings(),
        );
        let (_tx, rx) = watch::channel(false);
        let run = fetcher.run(&gun(), &Context::new("sa-east-1"), rx).await;
        assert_eq!(run.reason, TerminationReason::Failed);
        assert_eq!(run.context, ContextLabel::new("sa-east-1"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_next_page() {
        let fetcher = fetcher_with(
            Arc::new(ScriptedTransport::pages(vec![10, 10, 10])),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            fast_settings(),
        );
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert_eq!(run.reason, TerminationReason::Interrupted);
        assert!(run.records.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_after_page_keeps_records() {
        let transport = Arc::new(ScriptedTransport::pages(vec![7, 7, 7]));
        let mut settings = fast_settings();
        settings.page_delay = DelayWindow::new(3600.0, 3600.0);
        let fetcher = Arc::new(fetcher_with(
            Arc::clone(&transport),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            settings,
        ));
        let (tx, rx) = watch::channel(false);

        let worker = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.run(&gun(), &Context::new("us-west-1"), rx).await })
        };
        while transport.calls() < 1 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();

        let run = worker.await.unwrap();
        assert_eq!(run.reason, TerminationReason::Interrupted);
        assert_eq!(run.records.len(), 7);
        assert_eq!(run.pages_fetched, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_duration_ceiling_exhausts_recovery() {
        let mut settings = fast_settings();
        settings.max_recoveries = 100;
        settings.max_duration_secs = Some(1);
        settings.recovery_cooldown = DelayWindow::new(1.0, 1.0);
        let fetcher = fetcher_with(
            Arc::new(ScriptedTransport::failing()),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &["us-west-1"],
            settings,
        );
        let (_tx, rx) = watch::channel(false);

        let run = fetcher.run(&gun(), &Context::new("us-west-1"), rx).await;
        assert_eq!(run.reason, TerminationReason::RecoveryExhausted);
        assert_eq!(run.recoveries, 1);
        assert!(run.records.is_empty());
    }

    #[tokio::test]
    async fn test_pause_is_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { pause(Duration::from_secs(3600), &mut rx).await });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_survives_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!pause(Duration::from_millis(5), &mut rx).await);
    }
}
