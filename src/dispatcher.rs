//! Fan-out of topics across contexts.
//!
//! Topics run one after another; within a topic every context runs as its own
//! task on a bounded pool. A panicking worker only loses its own context.

use crate::fetcher::{PaginatedFetcher, pause};
use crate::models::{
    CollectionRun, Context, ContextLabel, ContextOutcome, ResultRecord, Topic,
};
use crate::retry::DelayWindow;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Everything a dispatch produced, for reporting.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub records: Vec<ResultRecord>,
    pub outcomes: Vec<ContextOutcome>,
    /// Whether topics were skipped because of shutdown.
    pub interrupted: bool,
}

pub struct Dispatcher {
    fetcher: Arc<PaginatedFetcher>,
    width: usize,
    topic_delay: DelayWindow,
}

impl Dispatcher {
    pub fn new(fetcher: Arc<PaginatedFetcher>, width: usize, topic_delay: DelayWindow) -> Self {
        Self {
            fetcher,
            width: width.max(1),
            topic_delay,
        }
    }

    /// Collect every topic through every context.
    ///
    /// `on_context_complete` runs as soon as each (topic, context) worker
    /// finishes, before the rest of the topic is done.
    #[instrument(
        level = "info",
        skip_all,
        fields(
            backend = %self.fetcher.backend(),
            topics = topics.len(),
            contexts = contexts.len()
        )
    )]
    pub async fn dispatch<F>(
        &self,
        topics: &[Topic],
        contexts: &[Context],
        mut on_context_complete: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> DispatchReport
    where
        F: FnMut(&[ResultRecord], &Topic, &ContextLabel),
    {
        let mut report = DispatchReport::default();
        let width = self.width.min(contexts.len().max(1));

        for (i, topic) in topics.iter().enumerate() {
            if *shutdown.borrow() {
                warn!(
                    remaining = topics.len() - i,
                    "Shutdown requested; skipping remaining topics"
                );
                report.interrupted = true;
                break;
            }
            info!(topic = %topic, index = i + 1, of = topics.len(), "Dispatching topic");

            let worker_shutdown = shutdown.clone();
            let mut finished = stream::iter(contexts.iter().cloned())
                .map(|context| self.spawn_worker(topic.clone(), context, worker_shutdown.clone()))
                .buffer_unordered(width);

            let mut collected = 0usize;
            while let Some(run) = finished.next().await {
                on_context_complete(&run.records, &run.topic, &run.context);
                collected += run.records.len();
                report.outcomes.push(ContextOutcome::from(&run));
                report.records.extend(run.records);
            }
            info!(topic = %topic, records = collected, "Topic finished");

            if i + 1 < topics.len() && pause(self.topic_delay.sample(), &mut shutdown).await {
                warn!("Shutdown requested during topic delay");
                report.interrupted = true;
                break;
            }
        }
        report
    }

    /// Run one context on its own task, turning a panic into a failed run.
    async fn spawn_worker(
        &self,
        topic: Topic,
        context: Context,
        shutdown: watch::Receiver<bool>,
    ) -> CollectionRun {
        let fetcher = Arc::clone(&self.fetcher);
        let label = context.label.clone();
        let task_topic = topic.clone();
        let handle =
            tokio::spawn(async move { fetcher.run(&task_topic, &context, shutdown).await });
        match handle.await {
            Ok(run) => run,
            Err(e) => {
                error!(topic = %topic, context = %label, error = %e, "Worker crashed");
                CollectionRun::failed(topic, label, format!("worker crashed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TerminationReason;
    use crate::testing::{
        BlockingRedeployer, ScriptedParser, ScriptedTransport, fast_settings, fetcher_sharing_unit,
        fetcher_with,
    };
    use std::collections::HashSet;

    const REGIONS: [&str; 6] = [
        "us-west-1",
        "us-east-2",
        "eu-west-2",
        "ap-south-1",
        "sa-east-1",
        "ca-central-1",
    ];

    fn contexts(labels: &[&str]) -> Vec<Context> {
        labels.iter().map(|l| Context::new(*l)).collect()
    }

    #[tokio::test]
    async fn test_panicking_context_is_isolated() {
        let transport =
            Arc::new(ScriptedTransport::pages(vec![10, 0]).panic_for("unit-ap-south-1"));
        let fetcher = fetcher_with(
            transport,
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &REGIONS,
            fast_settings(),
        );
        let dispatcher = Dispatcher::new(Arc::new(fetcher), 6, DelayWindow::zero());
        let (_tx, rx) = watch::channel(false);

        let mut completed = Vec::new();
        let report = dispatcher
            .dispatch(
                &[Topic::new("gun")],
                &contexts(&REGIONS),
                |records, _topic, label| completed.push((label.clone(), records.len())),
                rx,
            )
            .await;

        assert_eq!(completed.len(), 6);
        let non_empty = completed.iter().filter(|(_, n)| *n > 0).count();
        assert_eq!(non_empty, 5);
        let crashed: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| o.reason == TerminationReason::Failed)
            .collect();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].context.as_str(), "ap-south-1");
        assert_eq!(report.records.len(), 50);
    }

    #[tokio::test]
    async fn test_shared_unit_redeploys_at_most_once_in_flight() {
        let redeployer = Arc::new(BlockingRedeployer::default());
        let labels = ["us-west-1", "us-east-2", "eu-west-2"];
        let fetcher = fetcher_sharing_unit(
            Arc::new(ScriptedTransport::failing()),
            Arc::clone(&redeployer),
            ScriptedParser::new(),
            &labels,
            "shared-unit",
            fast_settings(),
        );
        let dispatcher = Dispatcher::new(Arc::new(fetcher), 3, DelayWindow::zero());
        let (_tx, rx) = watch::channel(false);

        let report = dispatcher
            .dispatch(&[Topic::new("gun")], &contexts(&labels), |_, _, _| {}, rx)
            .await;

        let total_recoveries: u32 = report.outcomes.iter().map(|o| o.recoveries).sum();
        assert!(total_recoveries >= 3);
        assert!(redeployer.calls() <= 1);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.reason == TerminationReason::RecoveryExhausted));
    }

    #[tokio::test]
    async fn test_topics_run_in_order_and_cover_all_contexts() {
        let fetcher = fetcher_with(
            Arc::new(ScriptedTransport::pages(vec![2, 0])),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &REGIONS[..3],
            fast_settings(),
        );
        let dispatcher = Dispatcher::new(Arc::new(fetcher), 60, DelayWindow::zero());
        let (_tx, rx) = watch::channel(false);
        let topics = [Topic::new("gun"), Topic::new("abortion")];

        let mut seen = Vec::new();
        let report = dispatcher
            .dispatch(
                &topics,
                &contexts(&REGIONS[..3]),
                |_, topic, label| seen.push((topic.clone(), label.clone())),
                rx,
            )
            .await;

        assert_eq!(seen.len(), 6);
        assert!(seen[..3].iter().all(|(t, _)| t.as_str() == "gun"));
        assert!(seen[3..].iter().all(|(t, _)| t.as_str() == "abortion"));
        let pairs: HashSet<_> = seen.into_iter().collect();
        assert_eq!(pairs.len(), 6);
        assert_eq!(report.records.len(), 12);
        assert!(!report.interrupted);
    }

    #[tokio::test]
    async fn test_interrupt_mid_topic_still_delivers_records() {
        let transport = Arc::new(ScriptedTransport::pages(vec![7, 7, 7]));
        let mut settings = fast_settings();
        settings.page_delay = DelayWindow::new(3600.0, 3600.0);
        let fetcher = fetcher_with(
            Arc::clone(&transport),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &REGIONS[..2],
            settings,
        );
        let dispatcher = Dispatcher::new(Arc::new(fetcher), 2, DelayWindow::zero());
        let (tx, rx) = watch::channel(false);
        let topics = [Topic::new("gun"), Topic::new("abortion")];

        let ctxs = contexts(&REGIONS[..2]);
        let mut delivered = Vec::new();
        let dispatch = dispatcher.dispatch(
            &topics,
            &ctxs,
            |records, topic, label| delivered.push((topic.clone(), label.clone(), records.len())),
            rx,
        );
        let interrupt = async {
            while transport.calls() < 2 {
                tokio::task::yield_now().await;
            }
            tx.send(true).unwrap();
        };
        let (report, ()) = tokio::join!(dispatch, interrupt);

        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|(t, _, n)| t.as_str() == "gun" && *n == 7));
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.reason == TerminationReason::Interrupted));
        assert_eq!(report.records.len(), 14);
        assert!(report.interrupted);
    }

    #[tokio::test]
    async fn test_shutdown_skips_topics() {
        let fetcher = fetcher_with(
            Arc::new(ScriptedTransport::pages(vec![2, 0])),
            Arc::new(BlockingRedeployer::default()),
            ScriptedParser::new(),
            &REGIONS[..1],
            fast_settings(),
        );
        let dispatcher = Dispatcher::new(Arc::new(fetcher), 1, DelayWindow::zero());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let mut calls = 0;
        let report = dispatcher
            .dispatch(&[Topic::new("gun")], &contexts(&REGIONS[..1]), |_, _, _| calls += 1, rx)
            .await;
        assert_eq!(calls, 0);
        assert!(report.interrupted);
    }
}
