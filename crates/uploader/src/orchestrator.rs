//! Orchestrator: validates the channel set and runs one job task per channel.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use channel_uploader_config::Config;
use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::credentials::{
    normalize_account_key, AuthorizationExchange, ClientProfile, CredentialError, CredentialRecord,
    CredentialStore,
};
use crate::events::{event_channel, EventSink, JobEvent, JobEventKind, JobRunState};
use crate::job_runner::{ChannelJob, JobReport, JobRunner};
use crate::oauth::OAuthRefresher;
use crate::pause::PauseToken;
use crate::publish::PublishSettings;
use crate::service::ServiceConnector;
use crate::status::{new_shared_status, spawn_status_updater, SharedStatus};
use crate::status_server::run_status_server;

/// Upper bound for the configured refresh skew (one day).
const MAX_REFRESH_SKEW_SECS: i64 = 86_400;

/// Error type for orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Two enabled channels share a display name; status rows and pause
    /// handles are looked up by name
    #[error("Channel name {0:?} is used by more than one enabled channel")]
    DuplicateName(String),

    /// Two enabled channels would publish with the same credential
    #[error("Channels {first:?} and {second:?} share credential {credential:?}")]
    DuplicateCredential {
        credential: String,
        first: String,
        second: String,
    },

    /// Two enabled channels would scan the same folder
    #[error("Channels {first:?} and {second:?} share folder {}", .folder.display())]
    DuplicateFolder {
        folder: PathBuf,
        first: String,
        second: String,
    },
}

/// Control handle of one running channel job.
pub struct JobHandle {
    pub channel: String,
    pub pause: PauseToken,
    task: JoinHandle<JobReport>,
}

/// The set of jobs started by [`Orchestrator::start`].
pub struct RunningJobs {
    handles: Vec<JobHandle>,
    status: SharedStatus,
    updater: JoinHandle<()>,
}

impl RunningJobs {
    pub fn handles(&self) -> &[JobHandle] {
        &self.handles
    }

    pub fn pause_token(&self, channel: &str) -> Option<PauseToken> {
        self.handles
            .iter()
            .find(|h| h.channel == channel)
            .map(|h| h.pause.clone())
    }

    /// Waits for every job; a panicked job is reported as `Crashed`.
    pub async fn wait_all(self) -> Vec<JobReport> {
        let mut reports = Vec::with_capacity(self.handles.len());
        let mut crashed = Vec::new();

        for handle in self.handles {
            let report = match handle.task.await {
                Ok(report) => report,
                Err(e) => {
                    error!(channel = %handle.channel, error = %e, "job task failed");
                    crashed.push(handle.channel.clone());
                    let mut report = JobReport::new(handle.channel);
                    report.state = JobRunState::Crashed;
                    report.error = Some(e.to_string());
                    report.finished_at = Some(Utc::now());
                    report
                }
            };
            reports.push(report);
        }

        // Every event sender is gone once the jobs are done
        let _ = self.updater.await;

        let mut snapshot = self.status.write().await;
        for channel in crashed {
            snapshot.apply_event(&JobEvent {
                channel,
                kind: JobEventKind::StateChanged {
                    state: JobRunState::Crashed,
                },
            });
        }
        drop(snapshot);

        reports
    }
}

fn credential_identity(credential: &str) -> String {
    normalize_account_key(credential).unwrap_or_else(|_| credential.trim().to_string())
}

fn folder_identity(folder: &Path) -> PathBuf {
    std::fs::canonicalize(folder).unwrap_or_else(|_| folder.to_path_buf())
}

/// Rejects channel sets where two jobs share a name, a credential or a folder.
pub fn validate_jobs(jobs: &[ChannelJob]) -> Result<(), OrchestratorError> {
    let mut names: HashSet<&str> = HashSet::new();
    let mut credentials: HashMap<String, &str> = HashMap::new();
    let mut folders: HashMap<PathBuf, &str> = HashMap::new();

    for job in jobs {
        if !names.insert(&job.name) {
            return Err(OrchestratorError::DuplicateName(job.name.clone()));
        }

        let credential = credential_identity(&job.credential);
        if let Some(first) = credentials.insert(credential.clone(), &job.name) {
            return Err(OrchestratorError::DuplicateCredential {
                credential,
                first: first.to_string(),
                second: job.name.clone(),
            });
        }

        let folder = folder_identity(&job.folder);
        if let Some(first) = folders.insert(folder.clone(), &job.name) {
            return Err(OrchestratorError::DuplicateFolder {
                folder,
                first: first.to_string(),
                second: job.name.clone(),
            });
        }
    }
    Ok(())
}

/// Runs every enabled channel of a configuration concurrently.
pub struct Orchestrator {
    config: Config,
    store: Arc<CredentialStore>,
    connector: Arc<dyn ServiceConnector>,
    status: SharedStatus,
}

impl Orchestrator {
    /// Builds an orchestrator refreshing tokens over OAuth.
    pub fn new(config: Config, connector: Arc<dyn ServiceConnector>) -> Self {
        let store = CredentialStore::new(
            config.paths.token_dir.clone(),
            Arc::new(OAuthRefresher::new()),
        )
        .with_refresh_skew(TimeDelta::seconds(
            i64::try_from(config.auth.refresh_skew_secs)
                .unwrap_or(i64::MAX)
                .min(MAX_REFRESH_SKEW_SECS),
        ));
        Self::with_store(config, Arc::new(store), connector)
    }

    pub fn with_store(
        config: Config,
        store: Arc<CredentialStore>,
        connector: Arc<dyn ServiceConnector>,
    ) -> Self {
        let names: Vec<String> = config
            .enabled_channels()
            .map(|c| c.display_name().to_string())
            .collect();
        Self {
            config,
            store,
            connector,
            status: new_shared_status(names),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<CredentialStore> {
        self.store.clone()
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Enabled channels as validated jobs.
    pub fn jobs(&self) -> Result<Vec<ChannelJob>, OrchestratorError> {
        let jobs: Vec<ChannelJob> = self
            .config
            .enabled_channels()
            .map(|c| ChannelJob::from_config(c, &self.config.paths.client_profile_dir))
            .collect();
        validate_jobs(&jobs)?;
        Ok(jobs)
    }

    /// Validates the channel set and spawns one task per job.
    pub fn start(&self) -> Result<RunningJobs, OrchestratorError> {
        let jobs = self.jobs()?;
        let settings = PublishSettings::from(&self.config.publish);
        let item_failure_delay = Duration::from_millis(self.config.publish.item_failure_delay_ms);

        let (tx, rx) = event_channel();
        let updater = spawn_status_updater(self.status.clone(), rx);

        let handles = jobs
            .into_iter()
            .map(|job| {
                let channel = job.name.clone();
                let pause = PauseToken::new();
                let runner = JobRunner::new(
                    job,
                    self.store.clone(),
                    self.connector.clone(),
                    settings.clone(),
                )
                .with_item_failure_delay(item_failure_delay)
                .with_pause(pause.clone())
                .with_events(EventSink::new(channel.clone(), tx.clone()));

                info!(channel = %channel, "starting job");
                JobHandle {
                    channel,
                    pause,
                    task: tokio::spawn(runner.run()),
                }
            })
            .collect();

        Ok(RunningJobs {
            handles,
            status: self.status.clone(),
            updater,
        })
    }

    /// Adds an account through interactive consent, requesting the configured
    /// scopes. `client_profile` is resolved against the client profile
    /// directory unless it is absolute.
    pub async fn add_account(
        &self,
        client_profile: &Path,
        exchange: &dyn AuthorizationExchange,
    ) -> Result<CredentialRecord, CredentialError> {
        let path = self.config.paths.client_profile_dir.join(client_profile);
        let profile = ClientProfile::load(&path)?;
        let record = self
            .store
            .create_credential(&profile, &self.config.auth.scopes, exchange)
            .await?;
        info!(account = %record.account_key, client_id = %profile.client_id, "account added");
        Ok(record)
    }

    /// Spawns the status HTTP server as a background task.
    pub fn start_status_server(&self) -> JoinHandle<()> {
        let status = self.status.clone();
        let listen = self.config.status.listen.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(status, &listen).await {
                error!(error = %e, "status server error");
            }
        })
    }

    /// Runs every enabled channel to completion.
    ///
    /// Starts the status server first when it is enabled.
    pub async fn run(&self) -> Result<Vec<JobReport>, OrchestratorError> {
        let server = self
            .config
            .status
            .enabled
            .then(|| self.start_status_server());

        let reports = self.start()?.wait_all().await;

        if let Some(server) = server {
            server.abort();
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AuthorizedCredential;
    use crate::service::PublishingService;
    use crate::test_support::{Fixture, ScriptedExchange};
    use channel_uploader_config::PathsConfig;

    fn config(fixture: &Fixture, channels: Vec<channel_uploader_config::ChannelConfig>) -> Config {
        let mut config = Config {
            paths: PathsConfig {
                token_dir: fixture.dir.path().join("tokens"),
                client_profile_dir: fixture.profile_dir(),
            },
            channels,
            ..Config::default()
        };
        config.publish.chunk_size_bytes = 4;
        config.publish.retry_backoff_ms = 0;
        config.publish.playlist_settle_ms = 0;
        config.publish.item_failure_delay_ms = 0;
        config
    }

    fn orchestrator(fixture: &Fixture, config: Config) -> Orchestrator {
        Orchestrator::with_store(config, fixture.store.clone(), fixture.connector.clone())
    }

    #[test]
    fn test_duplicate_credential_rejected() {
        let fixture = Fixture::new();
        let a = fixture.channel_root("a", &[]);
        let b = fixture.channel_root("b", &[]);
        let config = config(
            &fixture,
            vec![
                fixture.channel_config("news", "owner@example.com", &a),
                fixture.channel_config("music", "owner@example.com.json", &b),
            ],
        );

        let err = orchestrator(&fixture, config).jobs().unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateCredential { .. }));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let fixture = Fixture::new();
        let a = fixture.channel_root("a", &[]);
        let b = fixture.channel_root("b", &[]);
        let config = config(
            &fixture,
            vec![
                fixture.channel_config("news", "one@example.com", &a),
                fixture.channel_config("news", "two@example.com", &b),
            ],
        );

        let orchestrator = orchestrator(&fixture, config);
        let err = orchestrator.jobs().unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateName(ref name) if name == "news"));
        assert!(orchestrator.start().is_err());
    }

    #[tokio::test]
    async fn test_add_account_requests_configured_scopes() {
        let fixture = Fixture::new();
        let mut config = config(&fixture, Vec::new());
        config.auth.scopes = vec!["upload".to_string(), "email".to_string()];
        let exchange = ScriptedExchange::granting("New.Owner@Example.com");

        let record = orchestrator(&fixture, config)
            .add_account(Path::new("app.json"), &exchange)
            .await
            .unwrap();

        assert_eq!(record.client_id, "client-a.apps");
        assert_eq!(
            exchange.requested_scopes(),
            vec![vec!["upload".to_string(), "email".to_string()]]
        );
        let accounts = fixture
            .store
            .list_accounts(&ClientProfile::new("client-a.apps"))
            .unwrap();
        assert_eq!(accounts, vec![record.account_key]);
    }

    #[tokio::test]
    async fn test_add_account_with_missing_profile_fails() {
        let fixture = Fixture::new();
        let exchange = ScriptedExchange::granting("owner@example.com");

        let err = orchestrator(&fixture, config(&fixture, Vec::new()))
            .add_account(Path::new("absent.json"), &exchange)
            .await
            .unwrap_err();

        assert!(matches!(err, CredentialError::InvalidProfile(_)));
        assert!(exchange.requested_scopes().is_empty());
    }

    #[test]
    fn test_duplicate_folder_rejected() {
        let fixture = Fixture::new();
        let root = fixture.channel_root("shared", &[]);
        let config = config(
            &fixture,
            vec![
                fixture.channel_config("news", "one@example.com", &root),
                fixture.channel_config("music", "two@example.com", &root.join(".")),
            ],
        );

        let err = orchestrator(&fixture, config).jobs().unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateFolder { .. }));
    }

    #[test]
    fn test_disabled_channels_are_skipped() {
        let fixture = Fixture::new();
        let root = fixture.channel_root("shared", &[]);
        let mut disabled = fixture.channel_config("music", "one@example.com", &root);
        disabled.enabled = false;
        let config = config(
            &fixture,
            vec![fixture.channel_config("news", "one@example.com", &root), disabled],
        );

        let jobs = orchestrator(&fixture, config).jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "news");
        assert_eq!(jobs[0].client_profile, fixture.profile_dir().join("app.json"));
    }

    #[tokio::test]
    async fn test_jobs_run_independently() {
        let fixture = Fixture::new();
        fixture.add_account("one@example.com", "client-a.apps");
        fixture.add_account("two@example.com", "client-other.apps");
        let news = fixture.channel_root("news", &["ep01", "ep02"]);
        let music = fixture.channel_root("music", &["song01"]);
        let config = config(
            &fixture,
            vec![
                fixture.channel_config("news", "one@example.com", &news),
                fixture.channel_config("music", "two@example.com", &music),
            ],
        );

        let orchestrator = orchestrator(&fixture, config);
        let reports = orchestrator.run().await.unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].channel, "news");
        assert_eq!(reports[0].state, JobRunState::Completed);
        assert_eq!(reports[0].published, 2);
        assert_eq!(reports[1].state, JobRunState::Error);

        let snapshot = orchestrator.status().read().await.clone();
        let news_status = snapshot.channel("news").unwrap();
        assert_eq!(news_status.state, JobRunState::Completed);
        assert_eq!(news_status.published, 2);
        assert_eq!(snapshot.channel("music").unwrap().state, JobRunState::Error);
    }

    struct PanickingConnector;

    impl ServiceConnector for PanickingConnector {
        fn connect(&self, _credential: &AuthorizedCredential) -> Arc<dyn PublishingService> {
            panic!("connector blew up")
        }
    }

    #[tokio::test]
    async fn test_panicked_job_reported_as_crashed() {
        let fixture = Fixture::new();
        fixture.add_account("one@example.com", "client-a.apps");
        let news = fixture.channel_root("news", &["ep01"]);
        let config = config(
            &fixture,
            vec![fixture.channel_config("news", "one@example.com", &news)],
        );

        let orchestrator =
            Orchestrator::with_store(config, fixture.store.clone(), Arc::new(PanickingConnector));
        let reports = orchestrator.start().unwrap().wait_all().await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, JobRunState::Crashed);
        assert!(reports[0].error.is_some());
        let snapshot = orchestrator.status().read().await.clone();
        assert_eq!(snapshot.channel("news").unwrap().state, JobRunState::Crashed);
    }

    #[tokio::test]
    async fn test_pause_tokens_are_per_channel() {
        let fixture = Fixture::new();
        fixture.add_account("one@example.com", "client-a.apps");
        let news = fixture.channel_root("news", &["ep01"]);
        let config = config(
            &fixture,
            vec![fixture.channel_config("news", "one@example.com", &news)],
        );

        let orchestrator = orchestrator(&fixture, config);
        let running = orchestrator.start().unwrap();
        assert!(running.pause_token("news").is_some());
        assert!(running.pause_token("music").is_none());
        assert_eq!(running.handles().len(), 1);

        let reports = running.wait_all().await;
        assert_eq!(reports[0].state, JobRunState::Completed);
    }
}
