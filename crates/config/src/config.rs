//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// On-disk locations for credential records and client profiles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory holding one `<account>.json` credential record per account
    #[serde(default = "default_token_dir")]
    pub token_dir: PathBuf,
    /// Directory holding registered client profile files
    #[serde(default = "default_client_profile_dir")]
    pub client_profile_dir: PathBuf,
}

fn default_token_dir() -> PathBuf {
    PathBuf::from("user_tokens")
}

fn default_client_profile_dir() -> PathBuf {
    PathBuf::from("client_secrets")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            token_dir: default_token_dir(),
            client_profile_dir: default_client_profile_dir(),
        }
    }
}

/// Authorization-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Capability scopes requested during consent
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Tokens expiring within this many seconds are treated as expired
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "email".to_string()]
}

fn default_refresh_skew_secs() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            scopes: default_scopes(),
            refresh_skew_secs: default_refresh_skew_secs(),
        }
    }
}

/// Geographic location attached to published items
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationConfig {
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Settings applied to every publish request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Category used when a channel does not override it
    #[serde(default = "default_category")]
    pub default_category: String,
    /// Default audio language code
    #[serde(default = "default_language")]
    pub language: String,
    /// Optional recording location
    #[serde(default)]
    pub location: Option<LocationConfig>,
    /// Upper bound on the size of one transferred chunk
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    /// Transient failures tolerated per item before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed wait between a failed chunk and its retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Wait between a finished upload and the playlist attachment
    #[serde(default = "default_playlist_settle_ms")]
    pub playlist_settle_ms: u64,
    /// Wait after a failed item before the runner moves on
    #[serde(default = "default_item_failure_delay_ms")]
    pub item_failure_delay_ms: u64,
    #[serde(default = "default_contains_synthetic_media")]
    pub contains_synthetic_media: bool,
    #[serde(default)]
    pub made_for_kids: bool,
}

fn default_category() -> String {
    "22".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_chunk_size_bytes() -> usize {
    1024 * 1024
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

fn default_playlist_settle_ms() -> u64 {
    2_000
}

fn default_item_failure_delay_ms() -> u64 {
    3_000
}

fn default_contains_synthetic_media() -> bool {
    true
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            default_category: default_category(),
            language: default_language(),
            location: None,
            chunk_size_bytes: default_chunk_size_bytes(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            playlist_settle_ms: default_playlist_settle_ms(),
            item_failure_delay_ms: default_item_failure_delay_ms(),
            contains_synthetic_media: default_contains_synthetic_media(),
            made_for_kids: false,
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_status_listen")]
    pub listen: String,
}

fn default_status_listen() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_status_listen(),
        }
    }
}

/// Daily time-of-day slots, written either as a list or as one
/// comma-separated string (`"08:00, 19:00"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SlotList {
    List(Vec<String>),
    Joined(String),
}

impl SlotList {
    /// Individual slot strings, trimmed, empty entries dropped
    pub fn entries(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            SlotList::List(items) => items.iter().map(String::as_str).collect(),
            SlotList::Joined(joined) => joined.split(',').collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for SlotList {
    fn default() -> Self {
        SlotList::Joined("08:00, 19:00".to_string())
    }
}

/// One channel's orchestration input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Display name; falls back to the credential reference
    #[serde(default)]
    pub name: Option<String>,
    /// Account key of the credential record to publish with
    pub credential: String,
    /// File name of the owning client profile
    pub client_profile: String,
    /// Root folder holding this channel's pending items
    pub folder: PathBuf,
    #[serde(default)]
    pub slots: SlotList,
    /// Extra days inserted once a day's slots are used up
    #[serde(default)]
    pub day_gap: u32,
    /// Category override; `"default"` means use the publish default
    #[serde(default)]
    pub category: Option<String>,
    /// Playlist name or id to attach published items to
    #[serde(default)]
    pub playlist: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ChannelConfig {
    /// Name used in logs and status output
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.credential)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - UPLOADER_TOKEN_DIR -> paths.token_dir
    /// - UPLOADER_CLIENT_PROFILE_DIR -> paths.client_profile_dir
    /// - UPLOADER_DEFAULT_CATEGORY -> publish.default_category
    /// - UPLOADER_LANGUAGE -> publish.language
    /// - UPLOADER_MAX_RETRIES -> publish.max_retries
    /// - UPLOADER_CHUNK_SIZE_BYTES -> publish.chunk_size_bytes
    /// - UPLOADER_STATUS_ENABLED -> status.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("UPLOADER_TOKEN_DIR") {
            if !val.trim().is_empty() {
                self.paths.token_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("UPLOADER_CLIENT_PROFILE_DIR") {
            if !val.trim().is_empty() {
                self.paths.client_profile_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("UPLOADER_DEFAULT_CATEGORY") {
            if !val.trim().is_empty() {
                self.publish.default_category = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("UPLOADER_LANGUAGE") {
            if !val.trim().is_empty() {
                self.publish.language = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("UPLOADER_MAX_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.publish.max_retries = retries;
            }
        }

        if let Ok(val) = env::var("UPLOADER_CHUNK_SIZE_BYTES") {
            if let Ok(size) = val.parse::<usize>() {
                if size > 0 {
                    self.publish.chunk_size_bytes = size;
                }
            }
        }

        if let Ok(val) = env::var("UPLOADER_STATUS_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.status.enabled = true,
                "false" | "0" | "no" => self.status.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Channels that should run
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }
}
