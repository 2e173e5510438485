//! Configuration for the keyshare server
//!
//! CLI arguments and environment variable handling using clap.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sha2::{Digest, Sha256};

use crate::core::CoreConfig;
use crate::db::PinPolicy;
use crate::types::{KeyshareError, Result};

/// Keyshare server for distributed attribute-based credentials
#[derive(Parser, Debug, Clone)]
#[command(name = "keyshare-server")]
#[command(about = "Keyshare server holding user shares of credential master secrets")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Database backend; only "memory" ships in-tree
    #[arg(long, env = "DATABASE", default_value = "memory")]
    pub database: String,

    /// Secret for signing authorization and response tokens.
    /// Generated per process when absent (tokens then die with the process).
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Current blob encryption key, 32 bytes hex.
    /// Generated per process when absent (blobs then die with the process).
    #[arg(long, env = "AES_KEY")]
    pub aes_key: Option<String>,

    /// Key id the current encryption key is installed under
    #[arg(long, env = "AES_KEY_ID", default_value = "1")]
    pub aes_key_id: u32,

    /// Blob authentication key, 32 bytes hex. Generated when absent.
    #[arg(long, env = "MAC_KEY")]
    pub mac_key: Option<String>,

    /// Authorization token lifetime in seconds
    #[arg(long, env = "TOKEN_LIFETIME_SECONDS", default_value = "300")]
    pub token_lifetime_seconds: u64,

    /// Keyshare session entry lifetime in seconds
    #[arg(long, env = "SESSION_TTL_SECONDS", default_value = "60")]
    pub session_ttl_seconds: u64,

    /// Interval of the session flush task in seconds
    #[arg(long, env = "SESSION_FLUSH_SECONDS", default_value = "10")]
    pub session_flush_seconds: u64,

    /// Commitment record lifetime in seconds
    #[arg(long, env = "COMMITMENT_TTL_SECONDS", default_value = "10")]
    pub commitment_ttl_seconds: u64,

    /// Longest accepted PIN in bytes
    #[arg(long, env = "PIN_LENGTH_LIMIT", default_value = "64")]
    pub pin_length_limit: usize,

    /// Failed PIN checks allowed per window
    #[arg(long, env = "PIN_MAX_ATTEMPTS", default_value = "3")]
    pub pin_max_attempts: u32,

    /// First lock-out duration in seconds; doubles per exhausted window
    #[arg(long, env = "PIN_BASE_BLOCK_SECONDS", default_value = "60")]
    pub pin_base_block_seconds: i64,

    /// Upper bound on lock-out durations in seconds
    #[arg(long, env = "PIN_MAX_BLOCK_SECONDS", default_value = "86400")]
    pub pin_max_block_seconds: i64,

    /// Base URL for email verification links; mail is disabled when absent
    #[arg(long, env = "EMAIL_VERIFICATION_URL")]
    pub email_verification_url: Option<String>,

    /// Fallback language for mail templates
    #[arg(long, env = "DEFAULT_LANGUAGE", default_value = "en")]
    pub default_language: String,

    /// Base URL of the companion issuance server
    #[arg(long, env = "ISSUANCE_SERVER_URL", default_value = "http://localhost:8088")]
    pub issuance_server_url: String,

    /// Credential type issued at registration
    #[arg(long, env = "KEYSHARE_CREDENTIAL", default_value = "test.test.keyshare")]
    pub keyshare_credential: String,

    /// Attribute of that credential carrying the username
    #[arg(long, env = "KEYSHARE_ATTRIBUTE", default_value = "username")]
    pub keyshare_attribute: String,

    /// Server name used as `iss` on signed responses
    #[arg(long, env = "SERVER_NAME", default_value = "keyshare_server")]
    pub server_name: String,

    /// JSON file with trusted issuer public keys, loaded at startup
    #[arg(long, env = "TRUSTED_KEYS_FILE")]
    pub trusted_keys_file: Option<PathBuf>,
}

impl Args {
    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database != "memory" {
            return Err(KeyshareError::Config(format!(
                "unknown database backend: {}",
                self.database
            )));
        }
        if self.pin_max_attempts == 0 {
            return Err(KeyshareError::Config(
                "PIN_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.pin_base_block_seconds <= 0
            || self.pin_max_block_seconds < self.pin_base_block_seconds
        {
            return Err(KeyshareError::Config(
                "PIN block durations must be positive and non-decreasing".into(),
            ));
        }
        if self.session_flush_seconds == 0 {
            return Err(KeyshareError::Config(
                "SESSION_FLUSH_SECONDS must be at least 1".into(),
            ));
        }
        // Surface key format problems at startup rather than on first use
        self.aes_key_bytes()?;
        self.mac_key_bytes()?;
        Ok(())
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            token_lifetime: Duration::from_secs(self.token_lifetime_seconds),
            commitment_ttl: Duration::from_secs(self.commitment_ttl_seconds),
            pin_length_limit: self.pin_length_limit,
            issuer_name: self.server_name.clone(),
        }
    }

    pub fn pin_policy(&self) -> PinPolicy {
        PinPolicy {
            max_attempts: self.pin_max_attempts,
            base_block_seconds: self.pin_base_block_seconds,
            max_block_seconds: self.pin_max_block_seconds,
        }
    }

    pub fn aes_key_bytes(&self) -> Result<Option<[u8; 32]>> {
        parse_hex_key("AES_KEY", self.aes_key.as_deref())
    }

    pub fn mac_key_bytes(&self) -> Result<Option<[u8; 32]>> {
        parse_hex_key("MAC_KEY", self.mac_key.as_deref())
    }

    /// Token signing key, derived from the configured secret.
    pub fn token_key_bytes(&self) -> Option<[u8; 32]> {
        self.jwt_secret
            .as_deref()
            .map(|secret| Sha256::digest(secret.as_bytes()).into())
    }
}

fn parse_hex_key(label: &str, value: Option<&str>) -> Result<Option<[u8; 32]>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let bytes = hex::decode(value)
        .map_err(|e| KeyshareError::Config(format!("{label} is not valid hex: {e}")))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KeyshareError::Config(format!("{label} must be 32 bytes")))?;
    Ok(Some(key))
}
