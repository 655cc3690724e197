//! Upload Executor.
//!
//! Publishes one work item: opens a resumable session, sends the media file
//! in fixed-size chunks with bounded retry on transient failures, then
//! attaches the thumbnail and playlist on a best-effort basis.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use channel_uploader_config::PublishConfig;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::events::{EventSink, JobRunState};
use crate::pause::PauseToken;
use crate::scan::WorkItem;
use crate::service::{
    ChunkOutcome, PublishRequest, PublishingService, RecordingLocation, ServiceError,
};

/// Privacy of freshly uploaded items; they go public at `publish_at`.
pub const UPLOAD_PRIVACY: &str = "private";

/// Category value meaning "use the configured default".
const DEFAULT_CATEGORY_KEYWORD: &str = "default";

/// Error type for publish operations
#[derive(Debug, Error)]
pub enum PublishError {
    /// Quota spent; the job must stop.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Non-retryable rejection of this item.
    #[error("Request rejected: {0}")]
    ApiRejected(ServiceError),

    #[error("Upload failed after {attempts} transient failures: {last_error}")]
    UploadExhausted { attempts: u32, last_error: ServiceError },

    #[error("Failed to read media file: {0}")]
    Media(#[from] std::io::Error),

    /// Every byte was sent but the service never reported completion.
    #[error("Upload did not complete after sending {sent_bytes} bytes")]
    TransferStalled { sent_bytes: u64 },
}

/// Explicit publish configuration threaded into every upload.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub default_category: String,
    pub language: String,
    pub location: Option<RecordingLocation>,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub playlist_settle: Duration,
    pub contains_synthetic_media: bool,
    pub made_for_kids: bool,
}

impl From<&PublishConfig> for PublishSettings {
    fn from(config: &PublishConfig) -> Self {
        Self {
            default_category: config.default_category.clone(),
            language: config.language.clone(),
            location: config.location.as_ref().map(|l| RecordingLocation {
                description: l.description.clone(),
                latitude: l.latitude,
                longitude: l.longitude,
            }),
            chunk_size: config.chunk_size_bytes.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            playlist_settle: Duration::from_millis(config.playlist_settle_ms),
            contains_synthetic_media: config.contains_synthetic_media,
            made_for_kids: config.made_for_kids,
        }
    }
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self::from(&PublishConfig::default())
    }
}

/// Picks the override when it names a real category, otherwise the default.
pub fn resolve_category(category_override: Option<&str>, default_category: &str) -> String {
    match category_override.map(str::trim) {
        Some(category)
            if !category.is_empty() && !category.eq_ignore_ascii_case(DEFAULT_CATEGORY_KEYWORD) =>
        {
            category.to_string()
        }
        _ => default_category.to_string(),
    }
}

pub fn build_publish_request(
    item: &WorkItem,
    publish_at: DateTime<Utc>,
    category_id: String,
    settings: &PublishSettings,
    media_size: u64,
) -> PublishRequest {
    PublishRequest {
        title: item.metadata.title.clone(),
        description: item.metadata.description.clone(),
        tags: item.metadata.tags.clone(),
        category_id,
        language: settings.language.clone(),
        privacy_status: UPLOAD_PRIVACY.to_string(),
        publish_at,
        made_for_kids: settings.made_for_kids,
        contains_synthetic_media: settings.contains_synthetic_media,
        location: settings.location.clone(),
        media_file: item.media_file.clone(),
        media_size,
    }
}

/// Transient-failure counter shared by every request of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    /// Records one transient failure; returns false once the budget is spent.
    pub fn record_failure(&mut self) -> bool {
        self.used = self.used.saturating_add(1);
        self.used < self.max
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Publishes work items for one channel job.
pub struct UploadExecutor {
    service: Arc<dyn PublishingService>,
    settings: PublishSettings,
    pause: PauseToken,
    events: EventSink,
}

impl UploadExecutor {
    pub fn new(
        service: Arc<dyn PublishingService>,
        settings: PublishSettings,
        pause: PauseToken,
        events: EventSink,
    ) -> Self {
        Self {
            service,
            settings,
            pause,
            events,
        }
    }

    pub fn settings(&self) -> &PublishSettings {
        &self.settings
    }

    /// Blocks while the job is paused, reporting the state change.
    pub async fn pause_point(&self) {
        if self.pause.is_paused() {
            info!(channel = self.events.channel(), "paused");
            self.events.state(JobRunState::Paused);
            self.pause.wait_until_resumed().await;
            info!(channel = self.events.channel(), "resumed");
            self.events.state(JobRunState::Uploading);
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        budget: &mut RetryBudget,
        operation: &str,
        mut call: F,
    ) -> Result<T, PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(ServiceError::QuotaExceeded(message)) => {
                    return Err(PublishError::QuotaExceeded(message))
                }
                Err(error @ ServiceError::Rejected { .. }) => {
                    return Err(PublishError::ApiRejected(error))
                }
                Err(error) => {
                    if !budget.record_failure() {
                        return Err(PublishError::UploadExhausted {
                            attempts: budget.used(),
                            last_error: error,
                        });
                    }
                    warn!(
                        channel = self.events.channel(),
                        operation,
                        attempt = budget.used(),
                        error = %error,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
            }
        }
    }

    /// Publishes `item` scheduled to go public at `publish_at`.
    ///
    /// # Arguments
    ///
    /// * `item` - Work item to upload
    /// * `publish_at` - Scheduled visibility transition
    /// * `category_override` - Channel category; `None` or `"default"` uses
    ///   the configured default
    /// * `playlist` - Playlist title or id to attach the item to
    ///
    /// # Returns
    ///
    /// * `Ok(String)` with the remote id assigned by the service
    /// * `Err(PublishError)` if the item was not published
    pub async fn publish(
        &self,
        item: &WorkItem,
        publish_at: DateTime<Utc>,
        category_override: Option<&str>,
        playlist: Option<&str>,
    ) -> Result<String, PublishError> {
        let mut file = tokio::fs::File::open(&item.media_file).await?;
        let media_size = file.metadata().await?.len();
        let category = resolve_category(category_override, &self.settings.default_category);
        let request = build_publish_request(item, publish_at, category, &self.settings, media_size);

        let mut budget = RetryBudget::new(self.settings.max_retries);
        let handle = self
            .with_retry(&mut budget, "start_upload", || {
                self.service.start_upload(&request)
            })
            .await?;
        debug!(channel = self.events.channel(), session = %handle.id, media_size, "upload session opened");

        let mut offset = 0u64;
        let mut chunk = Vec::with_capacity(self.settings.chunk_size);
        let remote_id = loop {
            self.pause_point().await;

            chunk.clear();
            (&mut file)
                .take(self.settings.chunk_size as u64)
                .read_to_end(&mut chunk)
                .await?;

            let outcome = self
                .with_retry(&mut budget, "upload_chunk", || {
                    self.service.upload_chunk(&handle, offset, &chunk)
                })
                .await?;
            offset += chunk.len() as u64;

            match outcome {
                ChunkOutcome::Done { remote_id } => {
                    self.events.progress(1.0);
                    break remote_id;
                }
                ChunkOutcome::InProgress { .. } if offset >= media_size => {
                    return Err(PublishError::TransferStalled { sent_bytes: offset });
                }
                ChunkOutcome::InProgress { fraction } => self.events.progress(fraction),
            }
        };
        info!(channel = self.events.channel(), remote_id = %remote_id, "upload finished");

        if let Some(thumbnail) = &item.thumbnail_file {
            match self.service.set_thumbnail(&remote_id, thumbnail).await {
                Ok(()) => debug!(channel = self.events.channel(), remote_id = %remote_id, "thumbnail set"),
                Err(e) => warn!(
                    channel = self.events.channel(),
                    remote_id = %remote_id,
                    error = %e,
                    "thumbnail upload failed"
                ),
            }
        }

        if let Some(playlist) = playlist.map(str::trim).filter(|p| !p.is_empty()) {
            tokio::time::sleep(self.settings.playlist_settle).await;
            self.attach_to_playlist(&remote_id, playlist).await;
        }

        Ok(remote_id)
    }

    /// Adds the item to a playlist given by title or id. Failures are logged.
    async fn attach_to_playlist(&self, remote_id: &str, playlist: &str) {
        let playlists = match self.service.list_playlists().await {
            Ok(playlists) => playlists,
            Err(e) => {
                warn!(channel = self.events.channel(), playlist, error = %e, "could not list playlists");
                return;
            }
        };

        let playlist_id = playlists
            .get(playlist)
            .or_else(|| playlists.values().find(|id| id.as_str() == playlist));
        let Some(playlist_id) = playlist_id else {
            warn!(channel = self.events.channel(), playlist, "playlist not found");
            return;
        };

        match self.service.add_to_playlist(remote_id, playlist_id).await {
            Ok(()) => info!(channel = self.events.channel(), remote_id, playlist, "added to playlist"),
            Err(e) => warn!(
                channel = self.events.channel(),
                remote_id,
                playlist,
                error = %e,
                "could not add to playlist"
            ),
        }
    }
}
