//! Credential Store.
//!
//! One JSON record per authenticated account lives in the token directory as
//! `<account_key>.json`. A record belongs to exactly one client profile; a
//! record whose owner client id differs from the requesting profile is never
//! handed out. Expired tokens are refreshed under a per-account lock so two
//! jobs sharing a record never lose each other's rotated token.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::service::{PublishingService, ServiceConnector};

const RECORD_EXTENSION: &str = "json";

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// Why a credential cannot be used by a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnusableReason {
    #[error("no credential record")]
    Missing,

    #[error("invalid account key")]
    InvalidKey,

    #[error("record belongs to client {found}, expected {expected}")]
    OwnerMismatch { expected: String, found: String },

    #[error("record unreadable: {0}")]
    Unreadable(String),

    #[error("token expired and no refresh token is available")]
    NotRefreshable,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Errors returned by the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The record exists but cannot back a job (maps to `AuthFailure`).
    #[error("credential {account} is unusable: {reason}")]
    Unusable {
        account: String,
        reason: UnusableReason,
    },

    #[error("client profile has no usable client id: {0}")]
    InvalidProfile(String),

    #[error("could not resolve the account owner identity")]
    IdentityUnresolved,

    #[error("authorization timed out")]
    AuthTimeout,

    #[error("authorization denied: {0}")]
    AuthDenied(String),

    /// The consent exchange broke down before the user could decide.
    #[error("authorization failed: {0}")]
    AuthFailed(String),

    #[error("invalid account key: {0:?}")]
    InvalidAccountKey(String),

    #[error("credential store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("credential serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CredentialError {
    fn unusable(account: &str, reason: UnusableReason) -> Self {
        Self::Unusable {
            account: account.to_string(),
            reason,
        }
    }
}

/// A registered application identity.
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub token_uri: Option<String>,
}

#[derive(Deserialize)]
struct ProfileFile {
    installed: Option<ProfileSection>,
    web: Option<ProfileSection>,
}

#[derive(Deserialize)]
struct ProfileSection {
    client_id: Option<String>,
    client_secret: Option<String>,
    token_uri: Option<String>,
}

impl ClientProfile {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            token_uri: None,
        }
    }

    /// Parses an application-registration JSON document.
    ///
    /// The `installed` section is preferred over `web`; the first one carrying
    /// a non-empty `client_id` is used.
    pub fn from_json(content: &str) -> Result<Self, CredentialError> {
        let file: ProfileFile = serde_json::from_str(content)
            .map_err(|e| CredentialError::InvalidProfile(e.to_string()))?;

        [file.installed, file.web]
            .into_iter()
            .flatten()
            .find_map(|section| {
                let client_id = section.client_id?.trim().to_string();
                if client_id.is_empty() {
                    return None;
                }
                Some(Self {
                    client_id,
                    client_secret: section.client_secret.map(Secret::new),
                    token_uri: section.token_uri,
                })
            })
            .ok_or_else(|| CredentialError::InvalidProfile("missing client_id".to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CredentialError::InvalidProfile(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }
}

/// Refreshable secret bundle of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMaterial {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<Secret<String>>,
    /// `None` means the token carries no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenMaterial {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: refresh_token.map(Secret::new),
            expires_at,
        }
    }

    /// True when the token stays valid for at least `skew` after `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: TimeDelta) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now + skew,
            None => true,
        }
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().is_empty())
    }
}

/// Persisted credential of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub token: TokenMaterial,
    /// Client id of the profile that created this record.
    pub client_id: String,
    pub account_key: String,
    pub created_at: DateTime<Utc>,
}

/// A validated, fresh credential ready to build a publishing client.
#[derive(Debug, Clone)]
pub struct AuthorizedCredential {
    pub account_key: String,
    pub client_id: String,
    pub access_token: Secret<String>,
}

impl AuthorizedCredential {
    fn from_record(record: &CredentialRecord) -> Self {
        Self {
            account_key: record.account_key.clone(),
            client_id: record.client_id.clone(),
            access_token: record.token.access_token.clone(),
        }
    }
}

/// Failure of a token refresh.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no refresh token")]
    MissingRefreshToken,

    /// The authorization server refused the grant (revoked or expired).
    #[error("refresh rejected: {0}")]
    Rejected(String),

    #[error("refresh transport error: {0}")]
    Transport(String),

    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        profile: &ClientProfile,
        token: &TokenMaterial,
    ) -> Result<TokenMaterial, RefreshError>;
}

/// Failure of an interactive consent exchange.
#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("consent timed out")]
    Timeout,

    #[error("consent denied: {0}")]
    Denied(String),

    #[error("consent failed: {0}")]
    Failed(String),
}

/// Interactive authorization collaborator.
#[async_trait]
pub trait AuthorizationExchange: Send + Sync {
    async fn begin_interactive_consent(
        &self,
        profile: &ClientProfile,
        scopes: &[String],
    ) -> Result<TokenMaterial, ConsentError>;

    /// Externally verifiable owner identity, e.g. the account email.
    async fn resolve_owner_identity(
        &self,
        token: &TokenMaterial,
    ) -> Result<Option<String>, ConsentError>;
}

/// Turns a credential reference (`owner@example.com` or
/// `owner@example.com.json`) into an account key usable as a file stem.
pub fn normalize_account_key(reference: &str) -> Result<String, CredentialError> {
    let trimmed = reference.trim();
    let key = trimmed
        .strip_suffix(".json")
        .unwrap_or(trimmed)
        .to_string();

    let invalid = key.is_empty()
        || key.starts_with('.')
        || key.contains("..")
        || key.contains(['/', '\\'])
        || key.chars().any(char::is_control);
    if invalid {
        return Err(CredentialError::InvalidAccountKey(reference.to_string()));
    }
    Ok(key)
}

/// File-backed credential store.
pub struct CredentialStore {
    token_dir: PathBuf,
    refresher: Arc<dyn TokenRefresher>,
    refresh_skew: TimeDelta,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(token_dir: impl Into<PathBuf>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            token_dir: token_dir.into(),
            refresher,
            refresh_skew: TimeDelta::seconds(60),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Tokens expiring within `skew` are treated as expired.
    pub fn with_refresh_skew(mut self, skew: TimeDelta) -> Self {
        self.refresh_skew = skew;
        self
    }

    pub fn token_dir(&self) -> &Path {
        &self.token_dir
    }

    pub fn record_path(&self, account_key: &str) -> PathBuf {
        self.token_dir
            .join(format!("{account_key}.{RECORD_EXTENSION}"))
    }

    async fn account_lock(&self, account_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(account_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reads a record; `Ok(None)` when the file does not exist.
    pub fn load_record(&self, account_key: &str) -> Result<Option<CredentialRecord>, CredentialError> {
        let path = self.record_path(account_key);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(account = account_key, path = %path.display(), "credential record not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Writes a record through a temp file and rename so readers never see a
    /// partially written token.
    pub fn save_record(&self, record: &CredentialRecord) -> Result<PathBuf, CredentialError> {
        std::fs::create_dir_all(&self.token_dir)?;

        let path = self.record_path(&record.account_key);
        let tmp_path = self
            .token_dir
            .join(format!(".{}.{RECORD_EXTENSION}.tmp", record.account_key));

        let data = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp_path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, &path)?;
        Ok(path)
    }

    fn load_owned_record(
        &self,
        account_key: &str,
        profile: &ClientProfile,
    ) -> Result<CredentialRecord, CredentialError> {
        let record = match self.load_record(account_key) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(CredentialError::unusable(account_key, UnusableReason::Missing)),
            Err(e) => {
                return Err(CredentialError::unusable(
                    account_key,
                    UnusableReason::Unreadable(e.to_string()),
                ))
            }
        };

        if record.client_id != profile.client_id {
            return Err(CredentialError::unusable(
                account_key,
                UnusableReason::OwnerMismatch {
                    expected: profile.client_id.clone(),
                    found: record.client_id,
                },
            ));
        }
        Ok(record)
    }

    /// Resolves a credential into a fresh authorization.
    ///
    /// Every failure is reported as [`CredentialError::Unusable`]. An expired
    /// token is refreshed under the account's lock and the rotated token is
    /// persisted; the record is re-read under the lock so a refresh finished
    /// by another job is reused.
    pub async fn authorize(
        &self,
        credential_ref: &str,
        profile: &ClientProfile,
    ) -> Result<AuthorizedCredential, CredentialError> {
        let account_key = normalize_account_key(credential_ref)
            .map_err(|_| CredentialError::unusable(credential_ref, UnusableReason::InvalidKey))?;

        let record = self.load_owned_record(&account_key, profile)?;
        if record.token.is_fresh(Utc::now(), self.refresh_skew) {
            return Ok(AuthorizedCredential::from_record(&record));
        }
        if !record.token.is_refreshable() {
            return Err(CredentialError::unusable(&account_key, UnusableReason::NotRefreshable));
        }

        let lock = self.account_lock(&account_key).await;
        let _guard = lock.lock().await;

        let mut record = self.load_owned_record(&account_key, profile)?;
        if record.token.is_fresh(Utc::now(), self.refresh_skew) {
            debug!(account = %account_key, "token already refreshed by another job");
            return Ok(AuthorizedCredential::from_record(&record));
        }
        if !record.token.is_refreshable() {
            return Err(CredentialError::unusable(&account_key, UnusableReason::NotRefreshable));
        }

        let mut rotated = self
            .refresher
            .refresh(profile, &record.token)
            .await
            .map_err(|e| {
                warn!(account = %account_key, error = %e, "token refresh failed");
                CredentialError::unusable(&account_key, UnusableReason::RefreshFailed(e.to_string()))
            })?;

        // Servers usually omit the refresh token when it did not rotate
        if rotated.refresh_token.is_none() {
            rotated.refresh_token = record.token.refresh_token.take();
        }
        record.token = rotated;

        match self.save_record(&record) {
            Ok(_) => info!(account = %account_key, "token refreshed"),
            Err(e) => warn!(
                account = %account_key,
                error = %e,
                "token refreshed but could not be persisted"
            ),
        }

        Ok(AuthorizedCredential::from_record(&record))
    }

    /// Resolves a credential and builds a publishing client bound to it.
    pub async fn get_authenticated_client(
        &self,
        credential_ref: &str,
        profile: &ClientProfile,
        connector: &dyn ServiceConnector,
    ) -> Result<Arc<dyn PublishingService>, CredentialError> {
        let credential = self.authorize(credential_ref, profile).await?;
        Ok(connector.connect(&credential))
    }

    /// Runs an interactive consent exchange and persists the new record,
    /// named after the owner identity.
    pub async fn create_credential(
        &self,
        profile: &ClientProfile,
        scopes: &[String],
        exchange: &dyn AuthorizationExchange,
    ) -> Result<CredentialRecord, CredentialError> {
        if profile.client_id.trim().is_empty() {
            return Err(CredentialError::InvalidProfile("missing client_id".to_string()));
        }

        let token = exchange
            .begin_interactive_consent(profile, scopes)
            .await
            .map_err(|e| match e {
                ConsentError::Timeout => CredentialError::AuthTimeout,
                ConsentError::Denied(msg) => CredentialError::AuthDenied(msg),
                ConsentError::Failed(msg) => CredentialError::AuthFailed(msg),
            })?;

        let identity = match exchange.resolve_owner_identity(&token).await {
            Ok(Some(identity)) if !identity.trim().is_empty() => identity,
            Ok(_) => return Err(CredentialError::IdentityUnresolved),
            Err(e) => {
                warn!(error = %e, "owner identity lookup failed");
                return Err(CredentialError::IdentityUnresolved);
            }
        };

        let account_key = normalize_account_key(&identity)?;
        let record = CredentialRecord {
            token,
            client_id: profile.client_id.clone(),
            account_key,
            created_at: Utc::now(),
        };

        let lock = self.account_lock(&record.account_key).await;
        let _guard = lock.lock().await;
        let path = self.save_record(&record)?;
        info!(account = %record.account_key, path = %path.display(), "credential created");
        Ok(record)
    }

    /// Account keys of every readable record owned by `profile`, sorted.
    pub fn list_accounts(&self, profile: &ClientProfile) -> Result<Vec<String>, CredentialError> {
        let entries = match std::fs::read_dir(&self.token_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut accounts = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(RECORD_EXTENSION));
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_record || stem.starts_with('.') {
                continue;
            }

            match std::fs::read_to_string(&path)
                .map_err(CredentialError::from)
                .and_then(|c| Ok(serde_json::from_str::<CredentialRecord>(&c)?))
            {
                Ok(record) if record.client_id == profile.client_id => {
                    accounts.push(stem.to_string())
                }
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }

        accounts.sort();
        Ok(accounts)
    }

    /// Deletes a record. Returns `false` when there was nothing to delete.
    pub async fn remove_account(&self, credential_ref: &str) -> Result<bool, CredentialError> {
        let account_key = normalize_account_key(credential_ref)?;
        let lock = self.account_lock(&account_key).await;
        let _guard = lock.lock().await;

        match std::fs::remove_file(self.record_path(&account_key)) {
            Ok(()) => {
                info!(account = %account_key, "credential removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
