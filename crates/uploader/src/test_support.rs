//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use channel_uploader_config::{ChannelConfig, SlotList};
use chrono::{TimeDelta, Utc};
use tempfile::TempDir;

use crate::credentials::{
    AuthorizationExchange, AuthorizedCredential, ClientProfile, ConsentError, CredentialRecord,
    CredentialStore, RefreshError, TokenMaterial, TokenRefresher,
};
use crate::job_runner::ChannelJob;
use crate::metadata::{VideoMetadata, SIDECAR_FILE_NAME};
use crate::publish::PublishSettings;
use crate::scan::WorkItem;
use crate::schedule::Cadence;
use crate::service::{
    ChunkOutcome, PublishRequest, PublishingService, ServiceConnector, ServiceError, UploadHandle,
};

/// Fast settings: 4-byte chunks, 3 retries, no waiting.
pub fn test_settings() -> PublishSettings {
    PublishSettings {
        chunk_size: 4,
        max_retries: 3,
        retry_backoff: Duration::ZERO,
        playlist_settle: Duration::ZERO,
        ..PublishSettings::default()
    }
}

/// Creates `<root>/<name>/video.mp4` holding `size` bytes.
pub fn work_item(root: &Path, name: &str, size: usize) -> WorkItem {
    let folder = root.join(name);
    std::fs::create_dir_all(&folder).unwrap();
    let media_file = folder.join("video.mp4");
    std::fs::write(&media_file, vec![7u8; size]).unwrap();
    WorkItem {
        path: folder,
        media_file,
        thumbnail_file: None,
        metadata: VideoMetadata {
            title: name.to_string(),
            ..VideoMetadata::default()
        },
    }
}

/// Publishing service double driven by scripted failures.
///
/// Each `start_upload` or `upload_chunk` call first pops the next scripted
/// outcome, if any. Uploads finish once the last byte of the media file has
/// been sent and get remote ids `vid-1`, `vid-2`, ...
#[derive(Default)]
pub struct ScriptedService {
    start_script: Mutex<VecDeque<Option<ServiceError>>>,
    chunk_script: Mutex<VecDeque<Option<ServiceError>>>,
    sizes: Mutex<HashMap<String, u64>>,
    next_id: AtomicUsize,
    never_finish: AtomicBool,
    thumbnails_fail: AtomicBool,
    playlists: Mutex<HashMap<String, String>>,
    pub requests: Mutex<Vec<PublishRequest>>,
    /// Offset of every chunk attempt, failed ones included.
    pub chunk_attempts: Mutex<Vec<u64>>,
    /// `(offset, len)` of every accepted chunk.
    pub chunks: Mutex<Vec<(u64, usize)>>,
    pub thumbnail_attempts: Mutex<Vec<(String, PathBuf)>>,
    pub playlist_adds: Mutex<Vec<(String, String)>>,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_starts(&self, errors: impl IntoIterator<Item = ServiceError>) {
        self.script_starts(errors.into_iter().map(Some));
    }

    pub fn fail_chunks(&self, errors: impl IntoIterator<Item = ServiceError>) {
        self.script_chunks(errors.into_iter().map(Some));
    }

    /// Queues per-call outcomes for `start_upload`; `None` lets a call pass.
    pub fn script_starts(&self, outcomes: impl IntoIterator<Item = Option<ServiceError>>) {
        self.start_script.lock().unwrap().extend(outcomes);
    }

    pub fn script_chunks(&self, outcomes: impl IntoIterator<Item = Option<ServiceError>>) {
        self.chunk_script.lock().unwrap().extend(outcomes);
    }

    pub fn never_finish(&self) {
        self.never_finish.store(true, Ordering::SeqCst);
    }

    pub fn fail_thumbnails(&self) {
        self.thumbnails_fail.store(true, Ordering::SeqCst);
    }

    pub fn set_playlists<'a>(&self, playlists: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut map = self.playlists.lock().unwrap();
        for (name, id) in playlists {
            map.insert(name.to_string(), id.to_string());
        }
    }

    pub fn published_titles(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.title.clone())
            .collect()
    }
}

#[async_trait]
impl PublishingService for ScriptedService {
    async fn start_upload(&self, request: &PublishRequest) -> Result<UploadHandle, ServiceError> {
        if let Some(Some(error)) = self.start_script.lock().unwrap().pop_front() {
            return Err(error);
        }
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.sizes
            .lock()
            .unwrap()
            .insert(id.clone(), request.media_size);
        self.requests.lock().unwrap().push(request.clone());
        Ok(UploadHandle { id })
    }

    async fn upload_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        chunk: &[u8],
    ) -> Result<ChunkOutcome, ServiceError> {
        self.chunk_attempts.lock().unwrap().push(offset);
        if let Some(Some(error)) = self.chunk_script.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.chunks.lock().unwrap().push((offset, chunk.len()));

        let size = self.sizes.lock().unwrap().get(&handle.id).copied().unwrap_or(0);
        let sent = offset + chunk.len() as u64;
        if sent >= size && !self.never_finish.load(Ordering::SeqCst) {
            Ok(ChunkOutcome::Done {
                remote_id: format!("vid-{}", handle.id),
            })
        } else {
            Ok(ChunkOutcome::InProgress {
                fraction: sent as f32 / size.max(1) as f32,
            })
        }
    }

    async fn set_thumbnail(&self, remote_id: &str, image: &Path) -> Result<(), ServiceError> {
        self.thumbnail_attempts
            .lock()
            .unwrap()
            .push((remote_id.to_string(), image.to_path_buf()));
        if self.thumbnails_fail.load(Ordering::SeqCst) {
            return Err(ServiceError::from_status(400, Some("invalidImage"), "bad image"));
        }
        Ok(())
    }

    async fn list_playlists(&self) -> Result<HashMap<String, String>, ServiceError> {
        Ok(self.playlists.lock().unwrap().clone())
    }

    async fn add_to_playlist(&self, remote_id: &str, playlist_id: &str) -> Result<(), ServiceError> {
        self.playlist_adds
            .lock()
            .unwrap()
            .push((remote_id.to_string(), playlist_id.to_string()));
        Ok(())
    }
}

/// Hands out one shared [`ScriptedService`] per account key.
#[derive(Default)]
pub struct ScriptedConnector {
    services: Mutex<HashMap<String, Arc<ScriptedService>>>,
    pub connections: AtomicUsize,
}

impl ScriptedConnector {
    pub fn with_service(account_key: &str, service: Arc<ScriptedService>) -> Self {
        let connector = Self::default();
        connector
            .services
            .lock()
            .unwrap()
            .insert(account_key.to_string(), service);
        connector
    }

    pub fn service(&self, account_key: &str) -> Arc<ScriptedService> {
        self.services
            .lock()
            .unwrap()
            .entry(account_key.to_string())
            .or_insert_with(ScriptedService::new)
            .clone()
    }
}

impl ServiceConnector for ScriptedConnector {
    fn connect(&self, credential: &AuthorizedCredential) -> Arc<dyn PublishingService> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.service(&credential.account_key)
    }
}

/// Refresher that returns a fixed token or always fails.
pub struct StaticRefresher {
    access_token: Option<String>,
    pub calls: AtomicUsize,
}

impl StaticRefresher {
    pub fn ok(access_token: &str) -> Self {
        Self {
            access_token: Some(access_token.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            access_token: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenRefresher for StaticRefresher {
    async fn refresh(
        &self,
        _profile: &ClientProfile,
        _token: &TokenMaterial,
    ) -> Result<TokenMaterial, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window for concurrent callers to race on the lock
        tokio::time::sleep(Duration::from_millis(10)).await;
        match &self.access_token {
            Some(token) => Ok(TokenMaterial::new(
                token.clone(),
                None,
                Some(Utc::now() + TimeDelta::hours(1)),
            )),
            None => Err(RefreshError::Rejected("invalid_grant".to_string())),
        }
    }
}

/// Consent double: grants (or refuses) consent and reports a scripted owner
/// identity. Records the scopes of every consent request.
pub struct ScriptedExchange {
    consent_error: Mutex<Option<ConsentError>>,
    identity: Result<Option<String>, String>,
    scopes: Mutex<Vec<Vec<String>>>,
    pub identity_lookups: AtomicUsize,
}

impl ScriptedExchange {
    fn scripted(
        consent_error: Option<ConsentError>,
        identity: Result<Option<String>, String>,
    ) -> Self {
        Self {
            consent_error: Mutex::new(consent_error),
            identity,
            scopes: Mutex::new(Vec::new()),
            identity_lookups: AtomicUsize::new(0),
        }
    }

    pub fn granting(identity: &str) -> Self {
        Self::scripted(None, Ok(Some(identity.to_string())))
    }

    pub fn refusing(error: ConsentError) -> Self {
        Self::scripted(Some(error), Ok(Some("owner@example.com".to_string())))
    }

    pub fn anonymous() -> Self {
        Self::scripted(None, Ok(None))
    }

    pub fn identity_lookup_failing() -> Self {
        Self::scripted(None, Err("userinfo unavailable".to_string()))
    }

    pub fn requested_scopes(&self) -> Vec<Vec<String>> {
        self.scopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthorizationExchange for ScriptedExchange {
    async fn begin_interactive_consent(
        &self,
        _profile: &ClientProfile,
        scopes: &[String],
    ) -> Result<TokenMaterial, ConsentError> {
        self.scopes.lock().unwrap().push(scopes.to_vec());
        if let Some(error) = self.consent_error.lock().unwrap().take() {
            return Err(error);
        }
        Ok(TokenMaterial::new(
            "consent-access",
            Some("consent-refresh".to_string()),
            Some(Utc::now() + TimeDelta::hours(1)),
        ))
    }

    async fn resolve_owner_identity(
        &self,
        _token: &TokenMaterial,
    ) -> Result<Option<String>, ConsentError> {
        self.identity_lookups.fetch_add(1, Ordering::SeqCst);
        self.identity.clone().map_err(ConsentError::Failed)
    }
}

/// Temp directory holding a token dir, one client profile (`app.json`, client
/// id `client-a.apps`) and channel roots.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<CredentialStore>,
    pub connector: Arc<ScriptedConnector>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let profiles = dir.path().join("profiles");
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(
            profiles.join("app.json"),
            r#"{"installed":{"client_id":"client-a.apps","client_secret":"s"}}"#,
        )
        .unwrap();

        let store = CredentialStore::new(
            dir.path().join("tokens"),
            Arc::new(StaticRefresher::ok("refreshed")),
        );
        Self {
            dir,
            store: Arc::new(store),
            connector: Arc::new(ScriptedConnector::default()),
        }
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.dir.path().join("profiles")
    }

    /// Stores a fresh credential record owned by `client_id`.
    pub fn add_account(&self, account_key: &str, client_id: &str) {
        let record = CredentialRecord {
            token: TokenMaterial::new(
                format!("access-{account_key}"),
                Some("refresh".to_string()),
                Some(Utc::now() + TimeDelta::hours(1)),
            ),
            client_id: client_id.to_string(),
            account_key: account_key.to_string(),
            created_at: Utc::now(),
        };
        self.store.save_record(&record).unwrap();
    }

    /// Creates a channel root with one 4-byte item folder per name. Each
    /// folder gets an `info.txt` titling the item after its folder.
    pub fn channel_root(&self, channel: &str, items: &[&str]) -> PathBuf {
        let root = self.dir.path().join("channels").join(channel);
        std::fs::create_dir_all(&root).unwrap();
        for item in items {
            let work = work_item(&root, item, 4);
            std::fs::write(
                work.path.join(SIDECAR_FILE_NAME),
                format!("Title: {item}\n"),
            )
            .unwrap();
        }
        root
    }

    pub fn job(&self, name: &str, credential: &str, root: &Path) -> ChannelJob {
        ChannelJob {
            name: name.to_string(),
            credential: credential.to_string(),
            client_profile: self.profile_dir().join("app.json"),
            folder: root.to_path_buf(),
            cadence: Cadence::from_entries(["08:00", "19:00"], 0),
            category: None,
            playlist: None,
        }
    }

    pub fn channel_config(&self, name: &str, credential: &str, root: &Path) -> ChannelConfig {
        ChannelConfig {
            name: Some(name.to_string()),
            credential: credential.to_string(),
            client_profile: "app.json".to_string(),
            folder: root.to_path_buf(),
            slots: SlotList::default(),
            day_gap: 0,
            category: None,
            playlist: None,
            enabled: true,
        }
    }
}
