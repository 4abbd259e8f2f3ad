//! Run summary report.
//!
//! [`summarize`] is a pure aggregation over what a dispatch returned;
//! [`write_summary`] stores it as `summary_{HHMMSS}.json` next to the CSVs.

use super::write_atomic;
use crate::errors::PersistenceError;
use crate::models::{Backend, ContextLabel, ContextOutcome, ResultRecord, Topic};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

const TOP_SOURCES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: usize,
}

/// Per-context tally; each (topic, context) pair lands in exactly one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextStatus {
    pub succeeded: usize,
    pub failed: usize,
    /// Runs whose dataset could not be written, whatever their reason.
    pub save_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryReport {
    pub backend: Backend,
    pub mode: String,
    pub date: NaiveDate,
    pub total_records: usize,
    pub unique_urls: usize,
    pub unique_sources: usize,
    pub topics_processed: usize,
    pub top_sources: Vec<SourceCount>,
    pub per_topic: BTreeMap<String, usize>,
    pub per_context: BTreeMap<String, usize>,
    pub context_status: BTreeMap<String, ContextStatus>,
    pub datasets_failed: usize,
    pub termination_reasons: BTreeMap<String, usize>,
    pub collection_window: Option<CollectionWindow>,
}

/// Aggregate a run's records and per-context outcomes. `save_failures` are
/// the (topic, context) pairs whose dataset was lost.
pub fn summarize(
    records: &[ResultRecord],
    outcomes: &[ContextOutcome],
    save_failures: &[(Topic, ContextLabel)],
    backend: Backend,
    mode: &str,
    date: NaiveDate,
) -> SummaryReport {
    let sources = records
        .iter()
        .map(|r| r.source.as_str())
        .filter(|s| !s.is_empty())
        .counts();
    let top_sources = sources
        .iter()
        .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
        .take(TOP_SOURCES)
        .map(|(source, count)| SourceCount {
            source: (*source).to_string(),
            count: *count,
        })
        .collect();

    let per_topic: BTreeMap<String, usize> = records
        .iter()
        .map(|r| r.topic.to_string())
        .counts()
        .into_iter()
        .collect();
    let per_context: BTreeMap<String, usize> = records
        .iter()
        .map(|r| r.context.to_string())
        .counts()
        .into_iter()
        .collect();

    let mut context_status: BTreeMap<String, ContextStatus> = BTreeMap::new();
    for outcome in outcomes {
        let status = context_status.entry(outcome.context.to_string()).or_default();
        let lost = save_failures
            .iter()
            .any(|(topic, context)| *topic == outcome.topic && *context == outcome.context);
        if lost {
            status.save_failed += 1;
        } else if outcome.reason.is_success() {
            status.succeeded += 1;
        } else {
            status.failed += 1;
        }
    }
    let termination_reasons: BTreeMap<String, usize> = outcomes
        .iter()
        .map(|o| o.reason.as_str().to_string())
        .counts()
        .into_iter()
        .collect();

    let collection_window = records
        .iter()
        .map(|r| r.collected_at)
        .minmax()
        .into_option()
        .map(|(start, end)| CollectionWindow { start, end });

    SummaryReport {
        backend,
        mode: mode.to_string(),
        date,
        total_records: records.len(),
        unique_urls: records.iter().map(|r| r.url.as_str()).unique().count(),
        unique_sources: sources.len(),
        topics_processed: outcomes.iter().map(|o| &o.topic).unique().count(),
        top_sources,
        per_topic,
        per_context,
        context_status,
        datasets_failed: save_failures.len(),
        termination_reasons,
        collection_window,
    }
}

/// Write `report` into `dir` as `summary_{HHMMSS}.json`.
#[instrument(level = "info", skip_all, fields(dir = %dir.display()))]
pub fn write_summary(
    report: &SummaryReport,
    dir: &Path,
    at: NaiveTime,
) -> Result<PathBuf, PersistenceError> {
    let path = dir.join(format!("summary_{}.json", at.format("%H%M%S")));
    let json = serde_json::to_vec_pretty(report).map_err(|source| PersistenceError::Serialize {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &json)?;
    info!(
        path = %path.display(),
        total = report.total_records,
        sources = report.unique_sources,
        "Wrote summary report"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TerminationReason;
    use chrono::TimeZone;

    fn record(topic: &str, context: &str, source: &str, url: &str, minute: u32) -> ResultRecord {
        ResultRecord {
            title: "t".into(),
            url: url.into(),
            snippet: String::new(),
            source: source.into(),
            page: 1,
            rank: 1,
            topic: Topic::new(topic),
            context: ContextLabel::new(context),
            collected_at: Utc.with_ymd_and_hms(2025, 5, 6, 12, minute, 0).unwrap(),
        }
    }

    fn outcome(topic: &str, context: &str, reason: TerminationReason) -> ContextOutcome {
        ContextOutcome {
            topic: Topic::new(topic),
            context: ContextLabel::new(context),
            records: 0,
            pages_fetched: 1,
            recoveries: 0,
            reason,
            detail: None,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 6).unwrap()
    }

    #[test]
    fn test_summarize_counts() {
        let records = vec![
            record("gun", "us-west-1", "Times", "u1", 5),
            record("gun", "us-west-1", "Post", "u2", 1),
            record("gun", "eu-west-2", "Times", "u1", 9),
            record("abortion", "eu-west-2", "", "u3", 3),
        ];
        let outcomes = vec![
            outcome("gun", "us-west-1", TerminationReason::NaturalEnd),
            outcome("gun", "eu-west-2", TerminationReason::ThresholdReached),
            outcome("abortion", "eu-west-2", TerminationReason::RecoveryExhausted),
        ];

        let report = summarize(&records, &outcomes, &[], Backend::BingNews, "region", date());
        assert_eq!(report.total_records, 4);
        assert_eq!(report.unique_urls, 3);
        assert_eq!(report.unique_sources, 2);
        assert_eq!(report.topics_processed, 2);
        assert_eq!(
            report.top_sources[0],
            SourceCount { source: "Times".into(), count: 2 }
        );
        assert_eq!(report.per_topic["gun"], 3);
        assert_eq!(report.per_context["eu-west-2"], 2);
        assert_eq!(
            report.context_status["eu-west-2"],
            ContextStatus { succeeded: 1, failed: 1, save_failed: 0 }
        );
        assert_eq!(report.datasets_failed, 0);
        assert_eq!(report.termination_reasons["recovery-exhausted"], 1);

        let window = report.collection_window.unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2025, 5, 6, 12, 1, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2025, 5, 6, 12, 9, 0).unwrap());
    }

    #[test]
    fn test_lost_dataset_is_not_a_success() {
        let records = vec![
            record("gun", "us-west-1", "Times", "u1", 1),
            record("gun", "eu-west-2", "Post", "u2", 2),
        ];
        let outcomes = vec![
            outcome("gun", "us-west-1", TerminationReason::NaturalEnd),
            outcome("gun", "eu-west-2", TerminationReason::NaturalEnd),
        ];
        let lost = [(Topic::new("gun"), ContextLabel::new("us-west-1"))];

        let report = summarize(&records, &outcomes, &lost, Backend::GoogleNews, "region", date());
        assert_eq!(
            report.context_status["us-west-1"],
            ContextStatus { succeeded: 0, failed: 0, save_failed: 1 }
        );
        assert_eq!(report.context_status["eu-west-2"].succeeded, 1);
        assert_eq!(report.datasets_failed, 1);
    }

    #[test]
    fn test_summarize_empty_run() {
        let report = summarize(&[], &[], &[], Backend::GoogleNews, "region", date());
        assert_eq!(report.total_records, 0);
        assert!(report.top_sources.is_empty());
        assert!(report.collection_window.is_none());
    }

    #[test]
    fn test_write_summary_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let report = summarize(&[], &[], &[], Backend::GoogleNews, "region", date());
        let at = NaiveTime::from_hms_opt(14, 25, 1).unwrap();
        let path = write_summary(&report, tmp.path(), at).unwrap();
        assert_eq!(path.file_name().unwrap(), "summary_142501.json");

        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed["backend"], "google_news");
        assert_eq!(parsed["date"], "2025-05-06");
    }
}
