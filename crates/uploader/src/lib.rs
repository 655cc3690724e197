//! Channel Uploader
//!
//! Publishing orchestration core: credentials, folder scanning, scheduling,
//! chunked uploads and per-channel job runs with completion tracking.

pub mod completion_marker;
pub mod credentials;
pub mod events;
pub mod job_runner;
pub mod metadata;
pub mod oauth;
pub mod orchestrator;
pub mod pause;
pub mod publish;
pub mod scan;
pub mod schedule;
pub mod service;
pub mod status;
pub mod status_server;

#[cfg(test)]
mod test_support;

pub use channel_uploader_config as config;
pub use channel_uploader_config::Config;
pub use completion_marker::{
    completion_marker_path, has_completion_marker, read_completion_marker,
    write_completion_marker, CompletionRecord, MarkerError, COMPLETION_MARKER_NAME,
};
pub use credentials::{
    normalize_account_key, AuthorizationExchange, AuthorizedCredential, ClientProfile,
    ConsentError, CredentialError, CredentialRecord, CredentialStore, RefreshError,
    TokenMaterial, TokenRefresher, UnusableReason,
};
pub use events::{event_channel, EventSink, JobEvent, JobEventKind, JobRunState};
pub use job_runner::{ChannelJob, JobReport, JobRunner, RunnerError};
pub use metadata::{
    parse_metadata, parse_sidecar_text, write_sidecar_template, VideoMetadata, SIDECAR_FILE_NAME,
    SIDECAR_TEMPLATE,
};
pub use oauth::OAuthRefresher;
pub use orchestrator::{validate_jobs, JobHandle, Orchestrator, OrchestratorError, RunningJobs};
pub use pause::PauseToken;
pub use publish::{PublishError, PublishSettings, UploadExecutor};
pub use scan::{list_pending_work, ScanError, WorkItem};
pub use schedule::{next_publish_time, Cadence, ScheduleCursor};
pub use service::{
    ChunkOutcome, PublishRequest, PublishingService, ServiceConnector, ServiceError, UploadHandle,
};
pub use status::{new_shared_status, ChannelStatus, SharedStatus, StatusSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError};
