//! Database contract for the keyshare server
//!
//! The server only ever talks to the `Db` trait; the reference implementation
//! is in-memory. The PIN-retry reservation is the one operation with real
//! semantics: it is the server's only rate limit and must be atomic per user.

pub mod memory;

use async_trait::async_trait;

use crate::types::Result;

pub use memory::MemoryDb;

/// A keyshare account as persisted.
#[derive(Debug, Clone)]
pub struct User {
    /// Opaque 12-character alphanumeric account name.
    pub username: String,
    /// Language tag chosen at registration, used for mail templates.
    pub language: String,
    /// Encrypted secrets blob; only the core reads or rewrites it.
    pub secrets: Vec<u8>,
    /// Consecutive failed PIN checks since the last success.
    pub pin_counter: u32,
    /// Epoch seconds until which PIN checks are refused; 0 when unblocked.
    pub block_until: i64,
    /// Epoch seconds of the last observed activity.
    pub last_seen: i64,
}

impl User {
    pub fn new(username: String, language: String, secrets: Vec<u8>) -> Self {
        Self {
            username,
            language,
            secrets,
            pin_counter: 0,
            block_until: 0,
            last_seen: 0,
        }
    }
}

/// Kinds of append-only audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    PinCheckSuccess,
    PinCheckFailed,
    PinCheckBlocked,
    PinCheckRefused,
    IrmaSession,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PinCheckSuccess => "PIN_CHECK_SUCCESS",
            Self::PinCheckFailed => "PIN_CHECK_FAILED",
            Self::PinCheckBlocked => "PIN_CHECK_BLOCKED",
            Self::PinCheckRefused => "PIN_CHECK_REFUSED",
            Self::IrmaSession => "IRMA_SESSION",
        }
    }
}

/// Outcome of a PIN-retry reservation.
#[derive(Debug, Clone, Copy)]
pub struct PinTryReservation {
    /// Whether a check may proceed.
    pub allowed: bool,
    /// Attempts left in the window after this one is consumed.
    pub remaining_attempts: u32,
    /// When refused: seconds until the block lifts. When allowed and this was
    /// the window's last attempt: the lock-out that starts if the check fails.
    pub wait_seconds: i64,
}

/// Lock-out policy for failed PIN checks.
#[derive(Debug, Clone)]
pub struct PinPolicy {
    /// Attempts per window before a lock-out starts.
    pub max_attempts: u32,
    /// First lock-out duration; doubles with every exhausted window.
    pub base_block_seconds: i64,
    /// Upper bound on any lock-out duration.
    pub max_block_seconds: i64,
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_block_seconds: 60,
            max_block_seconds: 24 * 3600,
        }
    }
}

impl PinPolicy {
    /// Lock-out duration after `exhausted_windows` consecutive exhausted
    /// windows (1-based). Doubles per window, capped.
    pub fn block_duration(&self, exhausted_windows: u32) -> i64 {
        let doublings = exhausted_windows.saturating_sub(1).min(30);
        (self.base_block_seconds << doublings).min(self.max_block_seconds)
    }
}

#[async_trait]
pub trait Db: Send + Sync {
    /// Insert a new user; fails with `UserAlreadyExists` on a username
    /// collision (callers retry with a fresh random username).
    async fn add_user(&self, user: &User) -> Result<()>;

    async fn user(&self, username: &str) -> Result<User>;

    /// Overwrite a user record (secrets blob changes go through here).
    async fn update_user(&self, user: &User) -> Result<()>;

    /// Update last-activity. Best-effort at call sites; failures are logged
    /// but not surfaced to users.
    async fn set_seen(&self, username: &str) -> Result<()>;

    /// Append an audit record. Failures here are a correctness problem and
    /// must be propagated by callers on the session path.
    async fn add_log(&self, username: &str, event: AuditEvent, param: Option<i64>) -> Result<()>;

    /// Atomically reserve a PIN-check slot; see `PinTryReservation`.
    async fn reserve_pin_try(&self, username: &str) -> Result<PinTryReservation>;

    /// Clear the retry counter and block window after a successful check.
    async fn reset_pin_tries(&self, username: &str) -> Result<()>;

    /// Record an out-of-band email verification token.
    async fn add_email_verification(&self, username: &str, email: &str, token: &str)
        -> Result<()>;
}
