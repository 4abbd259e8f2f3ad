//! Output generation for collected results.
//!
//! # Submodules
//!
//! - [`dataset`]: Writes one CSV per (topic, context) as workers finish
//! - [`summary`]: Aggregates a run into a JSON summary report
//!
//! # Output Structure
//!
//! ```text
//! datasets/
//! └── 2025-05-06/
//!     └── google_news/
//!         └── region/
//!             ├── gun_us-west-1.csv
//!             ├── gun_eu-west-2.csv
//!             └── summary_142501.json
//! ```

pub mod dataset;
pub mod summary;

use crate::errors::PersistenceError;
use std::fs;
use std::path::Path;

/// Replace `path` with `bytes` through a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PersistenceError::Io { path, source }
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));
    fs::write(&temp_path, bytes).map_err(io_err(&temp_path))?;
    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
