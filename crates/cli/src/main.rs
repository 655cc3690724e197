//! CLI entry point for the channel uploader
//!
//! Operator commands over the publishing core: preview schedules, inspect
//! and check credentials, and write sidecar templates.

use channel_uploader::credentials::CredentialStore;
use channel_uploader::{
    list_pending_work, write_sidecar_template, ChannelJob, ClientProfile, Config, OAuthRefresher,
    ScheduleCursor, SIDECAR_FILE_NAME,
};
use chrono::{Local, TimeDelta};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Channel Uploader - scheduled bulk publishing to multiple channels
#[derive(Parser, Debug)]
#[command(name = "channel-uploader")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show pending items of every enabled channel and when each would go live
    Plan,
    /// List credential records owned by a client profile
    Accounts {
        /// Client profile file (resolved against the client profile directory)
        #[arg(short, long)]
        profile: PathBuf,
    },
    /// Resolve every enabled channel's credential, refreshing when needed
    Check,
    /// Delete a credential record
    RemoveAccount {
        /// Account key, with or without the `.json` suffix
        account: String,
    },
    /// Write a sample sidecar file
    Template {
        /// Target file, or a folder to write `info.txt` into
        path: PathBuf,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn credential_store(config: &Config) -> CredentialStore {
    let skew = i64::try_from(config.auth.refresh_skew_secs).unwrap_or(i64::MAX).min(86_400);
    CredentialStore::new(config.paths.token_dir.clone(), Arc::new(OAuthRefresher::new()))
        .with_refresh_skew(TimeDelta::seconds(skew))
}

fn resolve_profile_path(config: &Config, profile: &Path) -> PathBuf {
    if profile.exists() {
        profile.to_path_buf()
    } else {
        config.paths.client_profile_dir.join(profile)
    }
}

fn plan(config: &Config) -> ExitCode {
    let mut status = ExitCode::SUCCESS;

    for channel in config.enabled_channels() {
        let job = ChannelJob::from_config(channel, &config.paths.client_profile_dir);
        println!("{} ({})", job.name, job.folder.display());

        let items = match list_pending_work(&job.folder) {
            Ok(items) => items,
            Err(e) => {
                eprintln!("  scan failed: {}", e);
                status = ExitCode::FAILURE;
                continue;
            }
        };
        if items.is_empty() {
            println!("  nothing pending");
            continue;
        }

        let mut cursor = ScheduleCursor::<Local>::new();
        let now = Local::now();
        for item in &items {
            let publish_at = cursor.advance(&job.cadence, now);
            println!(
                "  {}  {}  {}",
                publish_at.format("%Y-%m-%d %H:%M"),
                item.folder_name(),
                item.metadata.title
            );
        }
    }

    status
}

fn accounts(config: &Config, profile: &Path) -> ExitCode {
    let path = resolve_profile_path(config, profile);
    let profile = match ClientProfile::load(&path) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("Failed to load client profile: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match credential_store(config).list_accounts(&profile) {
        Ok(accounts) if accounts.is_empty() => {
            println!("No accounts for client {}", profile.client_id);
            ExitCode::SUCCESS
        }
        Ok(accounts) => {
            for account in accounts {
                println!("{}", account);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to list accounts: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn check(config: &Config) -> ExitCode {
    let store = credential_store(config);
    let mut status = ExitCode::SUCCESS;

    for channel in config.enabled_channels() {
        let job = ChannelJob::from_config(channel, &config.paths.client_profile_dir);
        let result = match ClientProfile::load(&job.client_profile) {
            Ok(profile) => store.authorize(&job.credential, &profile).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => println!("{:<24} usable", job.name),
            Err(e) => {
                println!("{:<24} unusable: {}", job.name, e);
                status = ExitCode::FAILURE;
            }
        }
    }

    status
}

async fn remove_account(config: &Config, account: &str) -> ExitCode {
    match credential_store(config).remove_account(account).await {
        Ok(true) => {
            println!("Removed {}", account);
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("No record for {}", account);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to remove {}: {}", account, e);
            ExitCode::FAILURE
        }
    }
}

fn template(path: &Path) -> ExitCode {
    let target = if path.is_dir() {
        path.join(SIDECAR_FILE_NAME)
    } else {
        path.to_path_buf()
    };

    match write_sidecar_template(&target) {
        Ok(()) => {
            println!("Wrote {}", target.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to write {}: {}", target.display(), e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    if let Command::Template { path } = &args.command {
        return template(path);
    }

    debug!(config = %args.config.display(), "loading configuration");
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if config.enabled_channels().next().is_none() {
        warn!("no enabled channels configured");
    }

    match &args.command {
        Command::Plan => plan(&config),
        Command::Accounts { profile } => accounts(&config, profile),
        Command::Check => check(&config).await,
        Command::RemoveAccount { account } => remove_account(&config, account).await,
        Command::Template { .. } => ExitCode::SUCCESS,
    }
}
