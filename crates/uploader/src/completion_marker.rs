//! Completion marker module for recording published work items.
//!
//! A `done.json` file inside an item folder marks it as published. Its mere
//! presence excludes the folder from future scans; the content is a record of
//! what was published and when it goes live.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the completion marker inside an item folder.
pub const COMPLETION_MARKER_NAME: &str = "done.json";

/// Status recorded for items published with a future visibility time.
pub const STATUS_SCHEDULED: &str = "Scheduled";

/// Errors that can occur while writing or reading a completion marker.
#[derive(Debug, Error)]
pub enum MarkerError {
    /// A marker already exists; markers are never overwritten.
    #[error("Completion marker already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Failed to access completion marker: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode completion marker: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Content of a completion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Identifier the publishing service assigned to the item.
    pub remote_id: String,
    pub status: String,
    /// When the item becomes publicly visible.
    pub scheduled_time: DateTime<FixedOffset>,
    /// Account the item was published with.
    pub account_key: String,
    /// When the upload finished.
    pub recorded_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Record for an item uploaded with a scheduled visibility transition.
    pub fn scheduled(
        remote_id: impl Into<String>,
        scheduled_time: DateTime<FixedOffset>,
        account_key: impl Into<String>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            status: STATUS_SCHEDULED.to_string(),
            scheduled_time,
            account_key: account_key.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Constructs the completion marker path for an item folder.
///
/// For example: `/videos/ep01` -> `/videos/ep01/done.json`
pub fn completion_marker_path(folder: &Path) -> PathBuf {
    folder.join(COMPLETION_MARKER_NAME)
}

/// Checks if a completion marker exists for the given item folder.
pub fn has_completion_marker(folder: &Path) -> bool {
    completion_marker_path(folder).exists()
}

/// Creates the completion marker for an item folder.
///
/// The file is created with `create_new`, so an existing marker is never
/// edited or replaced.
///
/// # Arguments
///
/// * `folder` - Item folder to mark
/// * `record` - Published item details to store in the marker
///
/// # Returns
///
/// * `Ok(PathBuf)` with the marker path if it was created
/// * `Err(MarkerError::AlreadyExists)` if the folder is already marked
/// * `Err(MarkerError)` if the marker could not be written
pub fn write_completion_marker(
    folder: &Path,
    record: &CompletionRecord,
) -> Result<PathBuf, MarkerError> {
    let marker_path = completion_marker_path(folder);
    let json = serde_json::to_string_pretty(record)?;

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker_path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(MarkerError::AlreadyExists(marker_path));
        }
        Err(e) => return Err(MarkerError::Io(e)),
    };

    writeln!(file, "{}", json)?;
    file.sync_all()?;
    Ok(marker_path)
}

/// Reads the completion marker of an item folder.
pub fn read_completion_marker(folder: &Path) -> Result<CompletionRecord, MarkerError> {
    let content = std::fs::read_to_string(completion_marker_path(folder))?;
    Ok(serde_json::from_str(&content)?)
}
