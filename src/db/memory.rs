//! Reference in-memory database
//!
//! Holds everything behind a single mutex, which trivially gives the
//! PIN-retry reservation its required per-user atomicity. Audit logs and
//! email verifications are kept so tests can read them back.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{KeyshareError, Result};

use super::{AuditEvent, Db, PinPolicy, PinTryReservation, User};

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub username: String,
    pub time: i64,
    pub event: AuditEvent,
    pub param: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct EmailVerification {
    pub username: String,
    pub email: String,
    pub token: String,
    pub time: i64,
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    logs: Vec<LogEntry>,
    email_verifications: Vec<EmailVerification>,
}

pub struct MemoryDb {
    tables: Mutex<Tables>,
    policy: PinPolicy,
}

impl MemoryDb {
    pub fn new(policy: PinPolicy) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            policy,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| KeyshareError::Database("memory db lock poisoned".into()))
    }

    /// Audit entries for a user, oldest first. Not part of the `Db` contract;
    /// used by tests and diagnostics.
    pub fn logs_for(&self, username: &str) -> Vec<LogEntry> {
        self.lock()
            .map(|t| {
                t.logs
                    .iter()
                    .filter(|entry| entry.username == username)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Recorded email verifications. Same caveat as `logs_for`.
    pub fn email_verifications(&self) -> Vec<EmailVerification> {
        self.lock()
            .map(|t| t.email_verifications.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn unblock(&self, username: &str) {
        let mut tables = self.lock().unwrap();
        tables.users.get_mut(username).unwrap().block_until = 0;
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new(PinPolicy::default())
    }
}

#[async_trait]
impl Db for MemoryDb {
    async fn add_user(&self, user: &User) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.users.contains_key(&user.username) {
            return Err(KeyshareError::UserAlreadyExists);
        }
        tables.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn user(&self, username: &str) -> Result<User> {
        let tables = self.lock()?;
        tables
            .users
            .get(username)
            .cloned()
            .ok_or(KeyshareError::UserNotRegistered)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.users.get_mut(&user.username) {
            Some(stored) => {
                *stored = user.clone();
                Ok(())
            }
            None => Err(KeyshareError::UserNotRegistered),
        }
    }

    async fn set_seen(&self, username: &str) -> Result<()> {
        let mut tables = self.lock()?;
        let user = tables
            .users
            .get_mut(username)
            .ok_or(KeyshareError::UserNotRegistered)?;
        user.last_seen = chrono::Utc::now().timestamp();
        Ok(())
    }

    async fn add_log(&self, username: &str, event: AuditEvent, param: Option<i64>) -> Result<()> {
        let mut tables = self.lock()?;
        tables.logs.push(LogEntry {
            username: username.to_string(),
            time: chrono::Utc::now().timestamp(),
            event,
            param,
        });
        Ok(())
    }

    async fn reserve_pin_try(&self, username: &str) -> Result<PinTryReservation> {
        let policy = self.policy.clone();
        let mut tables = self.lock()?;
        let user = tables
            .users
            .get_mut(username)
            .ok_or(KeyshareError::UserNotRegistered)?;

        let now = chrono::Utc::now().timestamp();
        if now < user.block_until {
            return Ok(PinTryReservation {
                allowed: false,
                remaining_attempts: 0,
                wait_seconds: user.block_until - now,
            });
        }

        let used_in_window = user.pin_counter % policy.max_attempts;
        let remaining = policy.max_attempts - used_in_window - 1;
        user.pin_counter += 1;

        let mut wait_seconds = 0;
        if remaining == 0 {
            // Window exhausted: a lock-out starts now. A subsequent success
            // clears it via reset_pin_tries.
            let exhausted_windows = user.pin_counter / policy.max_attempts;
            wait_seconds = policy.block_duration(exhausted_windows);
            user.block_until = now + wait_seconds;
        }

        Ok(PinTryReservation {
            allowed: true,
            remaining_attempts: remaining,
            wait_seconds,
        })
    }

    async fn reset_pin_tries(&self, username: &str) -> Result<()> {
        let mut tables = self.lock()?;
        let user = tables
            .users
            .get_mut(username)
            .ok_or(KeyshareError::UserNotRegistered)?;
        user.pin_counter = 0;
        user.block_until = 0;
        Ok(())
    }

    async fn add_email_verification(
        &self,
        username: &str,
        email: &str,
        token: &str,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        tables.email_verifications.push(EmailVerification {
            username: username.to_string(),
            email: email.to_string(),
            token: token.to_string(),
            time: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db_with_user(policy: PinPolicy) -> MemoryDb {
        let db = MemoryDb::new(policy);
        let user = User::new("testuser".into(), "en".into(), vec![1, 2, 3]);
        db.add_user(&user).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_add_user_collision() {
        let db = db_with_user(PinPolicy::default()).await;
        let dup = User::new("testuser".into(), "en".into(), vec![]);
        assert!(matches!(
            db.add_user(&dup).await,
            Err(KeyshareError::UserAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let db = MemoryDb::default();
        assert!(matches!(
            db.user("missing").await,
            Err(KeyshareError::UserNotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_reservation_counts_down_window() {
        let db = db_with_user(PinPolicy::default()).await;

        let first = db.reserve_pin_try("testuser").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining_attempts, 2);

        let second = db.reserve_pin_try("testuser").await.unwrap();
        assert_eq!(second.remaining_attempts, 1);

        let third = db.reserve_pin_try("testuser").await.unwrap();
        assert_eq!(third.remaining_attempts, 0);
        assert_eq!(third.wait_seconds, 60);

        // Window exhausted: further reservations are refused
        let refused = db.reserve_pin_try("testuser").await.unwrap();
        assert!(!refused.allowed);
        assert_eq!(refused.remaining_attempts, 0);
        assert!(refused.wait_seconds > 0);
    }

    #[tokio::test]
    async fn test_block_growth_is_monotonic() {
        let policy = PinPolicy {
            max_attempts: 2,
            base_block_seconds: 60,
            max_block_seconds: 300,
        };
        let db = db_with_user(policy).await;

        let mut last_wait = 0;
        for _ in 0..5 {
            db.reserve_pin_try("testuser").await.unwrap();
            let exhausting = db.reserve_pin_try("testuser").await.unwrap();
            assert_eq!(exhausting.remaining_attempts, 0);
            assert!(exhausting.wait_seconds >= last_wait);
            last_wait = exhausting.wait_seconds;
            db.unblock("testuser");
        }
        // 60, 120, 240, then capped
        assert_eq!(last_wait, 300);
    }

    #[tokio::test]
    async fn test_refusal_does_not_consume_attempts() {
        let db = db_with_user(PinPolicy {
            max_attempts: 1,
            base_block_seconds: 60,
            max_block_seconds: 60,
        })
        .await;

        db.reserve_pin_try("testuser").await.unwrap();
        let before = db.user("testuser").await.unwrap().pin_counter;
        // Repeated refused reservations leave the counter untouched
        for _ in 0..3 {
            let refused = db.reserve_pin_try("testuser").await.unwrap();
            assert!(!refused.allowed);
        }
        let after = db.user("testuser").await.unwrap().pin_counter;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_reset_clears_window_and_block() {
        let db = db_with_user(PinPolicy::default()).await;
        for _ in 0..3 {
            db.reserve_pin_try("testuser").await.unwrap();
        }
        assert!(!db.reserve_pin_try("testuser").await.unwrap().allowed);

        db.reset_pin_tries("testuser").await.unwrap();
        let fresh = db.reserve_pin_try("testuser").await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining_attempts, 2);
    }

    #[tokio::test]
    async fn test_set_seen_and_logs() {
        let db = db_with_user(PinPolicy::default()).await;
        db.set_seen("testuser").await.unwrap();
        assert!(db.user("testuser").await.unwrap().last_seen > 0);

        db.add_log("testuser", AuditEvent::PinCheckFailed, Some(2))
            .await
            .unwrap();
        db.add_log("testuser", AuditEvent::IrmaSession, None)
            .await
            .unwrap();
        let logs = db.logs_for("testuser");
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].event, AuditEvent::PinCheckFailed);
        assert_eq!(logs[0].param, Some(2));
    }
}
