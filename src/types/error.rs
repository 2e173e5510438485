//! Error types for the keyshare server
//!
//! Core-internal error kinds are variants here; only three names ever reach
//! the wire (`InvalidRequest`, `Internal`, `UserNotRegistered`), carried in
//! the system-wide JSON error envelope.

use hyper::StatusCode;
use serde::{Deserialize, Serialize};

/// Main error type for keyshare server operations
#[derive(Debug, thiserror::Error)]
pub enum KeyshareError {
    /// The supplied PIN does not match the one in the user's secrets blob.
    /// Never surfaced as an HTTP error; the PIN endpoints encode it in their
    /// status body instead.
    #[error("invalid pin")]
    InvalidPin,

    #[error("pin too long")]
    PinTooLong,

    /// Authorization token failed signature, expiry, or blob binding.
    #[error("invalid jwt token")]
    InvalidJwt,

    /// Commitment reference absent, expired, or malformed.
    #[error("invalid challenge")]
    InvalidChallenge,

    /// Secrets blob failed MAC verification or parsing.
    #[error("invalid user secrets blob")]
    InvalidBlob,

    /// Encryption key id or issuer public key identifier is not trusted.
    #[error("unknown key")]
    UnknownKey,

    #[error("missing previous call to getCommitments")]
    MissingCommitment,

    #[error("user is not registered")]
    UserNotRegistered,

    #[error("username already taken")]
    UserAlreadyExists,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("issuance server error: {0}")]
    Issuance(String),

    #[error("email error: {0}")]
    Email(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire-visible error names, mirroring the system-wide error scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorName {
    InvalidRequest,
    Internal,
    UserNotRegistered,
}

impl ErrorName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::Internal => "Internal",
            Self::UserNotRegistered => "UserNotRegistered",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Malformed input",
            Self::Internal => "Internal server error",
            Self::UserNotRegistered => "User is not registered at this keyshare server",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UserNotRegistered => StatusCode::FORBIDDEN,
        }
    }
}

impl KeyshareError {
    /// Map an error to the wire-visible name. `InvalidPin` is deliberately
    /// mapped to `Internal`: PIN endpoints must intercept it before it gets
    /// this far, so reaching here is a server bug, not client input.
    pub fn error_name(&self) -> ErrorName {
        match self {
            Self::PinTooLong
            | Self::InvalidJwt
            | Self::InvalidChallenge
            | Self::MissingCommitment
            | Self::InvalidRequest(_) => ErrorName::InvalidRequest,
            Self::UserNotRegistered => ErrorName::UserNotRegistered,
            _ => ErrorName::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.error_name().status()
    }

    /// Build the JSON error envelope for this error.
    pub fn remote(&self) -> RemoteError {
        let name = self.error_name();
        RemoteError {
            status: name.status().as_u16(),
            error_name: name.as_str().to_string(),
            description: name.description().to_string(),
            message: self.to_string(),
            stacktrace: String::new(),
        }
    }
}

/// JSON error envelope shared with the rest of the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub status: u16,
    #[serde(rename = "errorName")]
    pub error_name: String,
    pub description: String,
    pub message: String,
    pub stacktrace: String,
}

impl From<std::io::Error> for KeyshareError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for KeyshareError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("invalid JSON: {err}"))
    }
}

impl From<hyper::Error> for KeyshareError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("http error: {err}"))
    }
}

impl From<reqwest::Error> for KeyshareError {
    fn from(err: reqwest::Error) -> Self {
        Self::Issuance(err.to_string())
    }
}

/// Result type alias for keyshare server operations
pub type Result<T> = std::result::Result<T, KeyshareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_name_mapping() {
        assert_eq!(
            KeyshareError::PinTooLong.error_name(),
            ErrorName::InvalidRequest
        );
        assert_eq!(
            KeyshareError::InvalidJwt.error_name(),
            ErrorName::InvalidRequest
        );
        assert_eq!(
            KeyshareError::MissingCommitment.error_name(),
            ErrorName::InvalidRequest
        );
        assert_eq!(
            KeyshareError::UserNotRegistered.error_name(),
            ErrorName::UserNotRegistered
        );
        assert_eq!(
            KeyshareError::InvalidBlob.error_name(),
            ErrorName::Internal
        );
        assert_eq!(KeyshareError::UnknownKey.error_name(), ErrorName::Internal);
        // InvalidPin never becomes a client-visible error name other than Internal
        assert_eq!(KeyshareError::InvalidPin.error_name(), ErrorName::Internal);
    }

    #[test]
    fn test_remote_envelope() {
        let remote = KeyshareError::MissingCommitment.remote();
        assert_eq!(remote.status, 400);
        assert_eq!(remote.error_name, "InvalidRequest");
        assert!(remote.message.contains("missing previous call to getCommitments"));

        let json = serde_json::to_value(&remote).unwrap();
        assert!(json.get("errorName").is_some());
        assert!(json.get("stacktrace").is_some());
    }
}
