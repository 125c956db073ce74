use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parcel_crypto::{EncryptedFileStore, Engine, SystemClock};
use tracing::info;
use zeroize::Zeroizing;

mod commands;
mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "parcel", about = "Parcel end-to-end encryption key custody tool")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory, overrides config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Store file name inside the data directory, overrides config
    #[arg(long)]
    store_file: Option<String>,

    /// Passphrase protecting the local key store
    #[arg(long, env = "PARCEL_STORE_PASSPHRASE", hide_env_values = true)]
    passphrase: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the store and identity key pair if missing
    Init,
    /// Show this device's fingerprint and verification payload
    Fingerprint,
    /// Encrypt a message for a peer, printing the record as JSON
    Encrypt {
        #[arg(long)]
        peer_id: String,
        /// Peer public key (base64)
        #[arg(long)]
        peer_key: String,
        /// Message text; read from stdin when omitted
        #[arg(long)]
        message: Option<String>,
    },
    /// Decrypt a record (JSON) from a sender
    Decrypt {
        #[arg(long)]
        sender_id: String,
        /// Record JSON; read from stdin when omitted
        #[arg(long)]
        record: Option<String>,
    },
    /// Export the active key pair as a password-protected backup
    ExportBackup {
        #[arg(long, env = "PARCEL_BACKUP_PASSWORD", hide_env_values = true)]
        password: String,
        /// Write the backup here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Restore a key pair from a backup and make it active
    ImportBackup {
        #[arg(long, env = "PARCEL_BACKUP_PASSWORD", hide_env_values = true)]
        password: String,
        /// Backup file; read from stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Check a scanned verification payload against a peer's public key
    Verify {
        #[arg(long)]
        payload: String,
        /// Expected public key (base64)
        #[arg(long)]
        expected_key: String,
    },
    /// Remove expired sessions
    Sweep,
    /// Generate a new identity key pair and drop all sessions
    Rotate,
    /// List stored key pairs and peers due for rotation
    Status,
    /// Set or clear a key pair's device label
    Label {
        #[arg(long)]
        id: String,
        #[arg(long)]
        label: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parcel=info,parcel_crypto=info".into()),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        CliConfig::load(config_path)?
    } else {
        CliConfig::default()
    };

    // CLI overrides
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(store_file) = args.store_file {
        config.store_file = store_file;
    }

    let passphrase = Zeroizing::new(args.passphrase);
    let store_path = config.store_path();
    info!(store = %store_path.display(), "opening key store");

    let store = Arc::new(EncryptedFileStore::new(
        &store_path,
        &passphrase,
        config.crypto.pbkdf2_iterations,
    ));
    let engine = Engine::new(
        store.clone(),
        store,
        Arc::new(SystemClock),
        config.crypto.clone(),
    );
    engine
        .start()
        .await
        .with_context(|| format!("failed to open key store {}", store_path.display()))?;

    let outcome = commands::run(&engine, args.command).await;
    engine.shutdown().await.context("failed to close key store")?;
    outcome
}
