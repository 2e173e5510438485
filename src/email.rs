//! Registration mail: templates per language and the sender seam
//!
//! The actual transport is an external collaborator; the trait here is all
//! the server knows about it. The shipped `LogSender` only logs, which keeps
//! local setups working without an SMTP relay.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tracing::info;

use crate::types::Result;

/// Length of email verification tokens.
const VERIFICATION_TOKEN_LEN: usize = 32;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Sender that records the mail in the server log instead of delivering it.
pub struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!(to, subject, body, "Registration mail (log-only sender)");
        Ok(())
    }
}

/// Per-language registration mail templates. Bodies carry a `{url}`
/// placeholder for the verification link.
#[derive(Debug, Clone)]
pub struct EmailTemplates {
    subjects: HashMap<String, String>,
    bodies: HashMap<String, String>,
    verification_urls: HashMap<String, String>,
    default_language: String,
}

impl EmailTemplates {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            subjects: HashMap::new(),
            bodies: HashMap::new(),
            verification_urls: HashMap::new(),
            default_language: default_language.into(),
        }
    }

    pub fn with_language(
        mut self,
        language: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        verification_url: impl Into<String>,
    ) -> Self {
        let language = language.into();
        self.subjects.insert(language.clone(), subject.into());
        self.bodies.insert(language.clone(), body.into());
        self.verification_urls
            .insert(language, verification_url.into());
        self
    }

    fn translate<'a>(&self, map: &'a HashMap<String, String>, language: &str) -> Option<&'a str> {
        map.get(language)
            .or_else(|| map.get(&self.default_language))
            .map(String::as_str)
    }

    /// Render subject and body for a language, falling back to the default
    /// language. Returns `None` when no template covers either language.
    pub fn render(&self, language: &str, token: &str) -> Option<(String, String)> {
        let subject = self.translate(&self.subjects, language)?;
        let body = self.translate(&self.bodies, language)?;
        let base_url = self.translate(&self.verification_urls, language)?;
        let url = format!("{base_url}{token}");
        Some((subject.to_string(), body.replace("{url}", &url)))
    }
}

/// Draw a fresh URL-safe verification token.
pub fn new_verification_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(VERIFICATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates() -> EmailTemplates {
        EmailTemplates::new("en")
            .with_language(
                "en",
                "Verify your address",
                "Visit {url} to verify.",
                "https://example.com/verify/en/",
            )
            .with_language(
                "nl",
                "Verifieer je adres",
                "Bezoek {url} om te verifiëren.",
                "https://example.com/verify/nl/",
            )
    }

    #[test]
    fn test_render_known_language() {
        let (subject, body) = templates().render("nl", "tok123").unwrap();
        assert_eq!(subject, "Verifieer je adres");
        assert!(body.contains("https://example.com/verify/nl/tok123"));
    }

    #[test]
    fn test_render_falls_back_to_default() {
        let (subject, body) = templates().render("de", "tok123").unwrap();
        assert_eq!(subject, "Verify your address");
        assert!(body.contains("/verify/en/tok123"));
    }

    #[test]
    fn test_render_without_templates() {
        let empty = EmailTemplates::new("en");
        assert!(empty.render("en", "tok").is_none());
    }

    #[test]
    fn test_verification_tokens_are_unique() {
        let a = new_verification_token();
        let b = new_verification_token();
        assert_eq!(a.len(), VERIFICATION_TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
