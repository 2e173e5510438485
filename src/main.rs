//! Keyshare server binary

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyshare_server::config::Args;
use keyshare_server::core::Core;
use keyshare_server::db::MemoryDb;
use keyshare_server::email::{EmailTemplates, LogSender};
use keyshare_server::idemix::{IssuerPublicKey, PublicKeyIdentifier};
use keyshare_server::issuance::HttpIssuanceServer;
use keyshare_server::server::{self, AppState, EmailContext};
use keyshare_server::sessions::{self, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keyshare_server={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("Keyshare server starting");
    info!("Listen: {}", args.listen);
    info!("Database: {}", args.database);
    info!("Issuance server: {}", args.issuance_server_url);
    info!(
        "PIN policy: {} attempts, {}s base block",
        args.pin_max_attempts, args.pin_base_block_seconds
    );

    // Key material. Anything not configured is drawn fresh, which means blobs
    // and tokens do not survive a restart.
    let mac_key = match args.mac_key_bytes()? {
        Some(key) => key,
        None => {
            warn!("MAC_KEY not configured; user secrets will not survive a restart");
            random_key()
        }
    };
    let token_key = match args.token_key_bytes() {
        Some(key) => key,
        None => {
            warn!("JWT_SECRET not configured; tokens will not survive a restart");
            random_key()
        }
    };
    let aes_key = match args.aes_key_bytes()? {
        Some(key) => key,
        None => {
            warn!("AES_KEY not configured; user secrets will not survive a restart");
            random_key()
        }
    };

    let core = Arc::new(Core::new(args.core_config(), mac_key, token_key));
    core.dangerous_set_aes_encryption_key(args.aes_key_id, aes_key);

    if let Some(path) = &args.trusted_keys_file {
        let count = load_trusted_keys(&core, path)?;
        info!("Loaded {} trusted issuer public keys from {}", count, path.display());
    } else {
        warn!("No trusted issuer public keys configured; commitment requests will fail");
    }

    let db = Arc::new(MemoryDb::new(args.pin_policy()));
    let sessions_store = Arc::new(SessionStore::new(Duration::from_secs(
        args.session_ttl_seconds,
    )));
    let issuance = Arc::new(HttpIssuanceServer::new(args.issuance_server_url.clone()));
    let email = args.email_verification_url.as_ref().map(|url| EmailContext {
        sender: Arc::new(LogSender),
        templates: default_templates(url, &args.default_language),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    core.spawn_commitment_sweeper(shutdown_rx.clone());
    sessions::spawn_flush_task(
        Arc::clone(&sessions_store),
        Duration::from_secs(args.session_flush_seconds),
        shutdown_rx.clone(),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = Arc::new(AppState::new(
        args,
        core,
        db,
        sessions_store,
        issuance,
        email,
    ));
    server::run(state, shutdown_rx).await?;
    Ok(())
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

fn default_templates(verification_url: &str, language: &str) -> EmailTemplates {
    EmailTemplates::new(language).with_language(
        language,
        "Complete your registration",
        "Welcome! Verify your email address by visiting {url}",
        verification_url,
    )
}

/// One trusted key as stored in the startup file.
#[derive(Deserialize)]
struct TrustedKeyEntry {
    issuer: String,
    counter: u32,
    #[serde(flatten)]
    key: IssuerPublicKey,
}

fn load_trusted_keys(core: &Core, path: &std::path::Path) -> anyhow::Result<usize> {
    let raw = fs::read_to_string(path)?;
    let entries: Vec<TrustedKeyEntry> = serde_json::from_str(&raw)?;
    let count = entries.len();
    for entry in entries {
        core.dangerous_add_trusted_public_key(
            PublicKeyIdentifier::new(entry.issuer, entry.counter),
            entry.key,
        );
    }
    Ok(count)
}
