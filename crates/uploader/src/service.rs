//! Publishing Service abstraction.
//!
//! The remote media host is reached only through [`PublishingService`]. A
//! concrete client is produced by a [`ServiceConnector`] from an authorized
//! credential, which keeps vendor wire details out of the core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::credentials::AuthorizedCredential;

/// Reasons the host reports when a daily or per-project quota is spent.
pub const QUOTA_REASONS: &[&str] = &["quotaExceeded", "dailyLimitExceeded", "uploadLimitExceeded"];

/// HTTP status codes treated as recoverable.
pub const TRANSIENT_STATUS_CODES: &[u16] = &[500, 502, 503, 504];

/// Failure reported by the Publishing Service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    /// Recoverable; the same request may be retried.
    #[error("transient failure (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Non-recoverable, e.g. permission or validation failure.
    #[error("request rejected (status {status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },
}

impl ServiceError {
    /// Classifies an HTTP failure by status code and error reason.
    pub fn from_status(status: u16, reason: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        if reason.is_some_and(|r| QUOTA_REASONS.contains(&r)) {
            return Self::QuotaExceeded(message);
        }
        if TRANSIENT_STATUS_CODES.contains(&status) {
            Self::Transient {
                status: Some(status),
                message,
            }
        } else {
            Self::Rejected {
                status: Some(status),
                message,
            }
        }
    }

    /// Generic network failure (connection reset, timeout, DNS).
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Geographic location attached to a published item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingLocation {
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Everything the host needs to create one scheduled item.
///
/// Items are uploaded private and become public at `publish_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishRequest {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub language: String,
    pub privacy_status: String,
    pub publish_at: DateTime<Utc>,
    pub made_for_kids: bool,
    pub contains_synthetic_media: bool,
    pub location: Option<RecordingLocation>,
    pub media_file: PathBuf,
    pub media_size: u64,
}

/// Resumable upload session opened by [`PublishingService::start_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub id: String,
}

/// Result of sending one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    InProgress { fraction: f32 },
    Done { remote_id: String },
}

/// Remote media host operations used by the upload executor.
#[async_trait]
pub trait PublishingService: Send + Sync {
    /// Opens a resumable upload session for `request`.
    async fn start_upload(&self, request: &PublishRequest) -> Result<UploadHandle, ServiceError>;

    /// Sends `chunk` starting at byte `offset` of the media file.
    async fn upload_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        chunk: &[u8],
    ) -> Result<ChunkOutcome, ServiceError>;

    async fn set_thumbnail(&self, remote_id: &str, image: &std::path::Path)
        -> Result<(), ServiceError>;

    /// Playlists of the authenticated channel, title to id.
    async fn list_playlists(&self) -> Result<HashMap<String, String>, ServiceError>;

    async fn add_to_playlist(&self, remote_id: &str, playlist_id: &str) -> Result<(), ServiceError>;
}

/// Builds a Publishing Service client bound to one credential.
pub trait ServiceConnector: Send + Sync {
    fn connect(&self, credential: &AuthorizedCredential) -> Arc<dyn PublishingService>;
}
