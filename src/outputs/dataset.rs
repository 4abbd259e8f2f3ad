//! Per-(topic, context) CSV datasets.
//!
//! Files live at `{root}/{date}/{backend}/{mode}/{topic}_{context}.csv` with
//! the columns `page, rank, source, title, content, url`. The topic is
//! percent-encoded and context labels are restricted at config load, so the
//! file name is a collision-free function of its key and reruns on the same
//! day overwrite rather than duplicate.

use super::write_atomic;
use crate::errors::PersistenceError;
use crate::models::{Backend, ContextLabel, ResultRecord, Topic};
use crate::utils::encode_file_component;
use chrono::NaiveDate;
use itertools::Itertools;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

#[derive(Debug, Serialize)]
struct DatasetRow<'a> {
    page: u32,
    rank: u32,
    source: &'a str,
    title: &'a str,
    content: &'a str,
    url: &'a str,
}

impl<'a> From<&'a ResultRecord> for DatasetRow<'a> {
    fn from(r: &'a ResultRecord) -> Self {
        Self {
            page: r.page,
            rank: r.rank,
            source: &r.source,
            title: &r.title,
            content: &r.snippet,
            url: &r.url,
        }
    }
}

/// Records that survive persistence: non-empty title and url, first
/// occurrence of each url.
pub fn retained_records(records: &[ResultRecord]) -> Vec<&ResultRecord> {
    records
        .iter()
        .filter(|r| !r.title.trim().is_empty() && !r.url.trim().is_empty())
        .unique_by(|r| r.url.clone())
        .collect()
}

/// Writes datasets for one backend and one run date.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    root: PathBuf,
    date: NaiveDate,
    backend: Backend,
    mode: String,
}

impl DatasetWriter {
    pub fn new(
        root: impl Into<PathBuf>,
        date: NaiveDate,
        backend: Backend,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            date,
            backend,
            mode: mode.into(),
        }
    }

    /// `{root}/{date}/{backend}/{mode}`
    pub fn dir(&self) -> PathBuf {
        dataset_dir(&self.root, self.date, self.backend, &self.mode)
    }

    pub fn path_for(&self, topic: &Topic, context: &ContextLabel) -> PathBuf {
        self.dir().join(format!(
            "{}_{}.csv",
            encode_file_component(topic.as_str()),
            context
        ))
    }

    /// Deduplicate and write one (topic, context) dataset.
    ///
    /// Returns `None` when nothing survives filtering; an existing file for
    /// the key is then left untouched.
    #[instrument(level = "info", skip_all, fields(topic = %topic, context = %context))]
    pub fn save(
        &self,
        records: &[ResultRecord],
        topic: &Topic,
        context: &ContextLabel,
    ) -> Result<Option<PathBuf>, PersistenceError> {
        let rows = retained_records(records);
        if rows.is_empty() {
            warn!(received = records.len(), "No records to save");
            return Ok(None);
        }

        let path = self.path_for(topic, context);
        let csv_err = |source| PersistenceError::Csv {
            path: path.clone(),
            source,
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &rows {
            writer.serialize(DatasetRow::from(*record)).map_err(csv_err)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| PersistenceError::Io {
                path: path.clone(),
                source: e.into_error(),
            })?;

        write_atomic(&path, &bytes)?;
        info!(
            path = %path.display(),
            rows = rows.len(),
            dropped = records.len() - rows.len(),
            "Saved dataset"
        );
        Ok(Some(path))
    }
}

pub fn dataset_dir(root: &Path, date: NaiveDate, backend: Backend, mode: &str) -> PathBuf {
    root.join(date.format("%Y-%m-%d").to_string())
        .join(backend.name())
        .join(mode)
}
