//! Companion issuance server: interface and HTTP client
//!
//! At registration the keyshare server starts an issuance session for the
//! keyshare-username credential on a companion server and mounts that
//! server's client endpoints under `/irma/`. Only the interface lives here;
//! the issuance server itself is external.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{KeyshareError, Result};

/// Pointer the client app follows to pick up an issuance session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPointer {
    /// URL of the session on the issuance server.
    pub u: String,
    /// Session type discriminator, `"issuing"` for our purposes.
    pub irmaqr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub credential: String,
    pub attributes: HashMap<String, String>,
}

/// Session request for issuing credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub credentials: Vec<CredentialRequest>,
}

impl IssuanceRequest {
    /// Request issuing one credential with a single attribute.
    pub fn single_attribute(
        credential_type: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(attribute.into(), value.into());
        Self {
            kind: "issuing".to_string(),
            credentials: vec![CredentialRequest {
                credential: credential_type.into(),
                attributes,
            }],
        }
    }
}

/// Response to a proxied `/irma/*` request.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

#[async_trait]
pub trait IssuanceServer: Send + Sync {
    /// Start a session; the returned pointer goes straight to the client.
    async fn start_session(&self, request: &IssuanceRequest) -> Result<SessionPointer>;

    /// Forward a client request mounted under `/irma/` to the issuance
    /// server. `path` is relative to the issuance server root.
    async fn proxy(&self, method: &str, path: &str, body: Bytes) -> Result<ProxiedResponse>;
}

/// HTTP client against a remote issuance server.
pub struct HttpIssuanceServer {
    base_url: String,
    client: reqwest::Client,
}

/// Shape of the issuance server's session-start response; only the pointer
/// matters to us.
#[derive(Deserialize)]
struct StartSessionResponse {
    #[serde(rename = "sessionPtr")]
    session_ptr: SessionPointer,
}

impl HttpIssuanceServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IssuanceServer for HttpIssuanceServer {
    async fn start_session(&self, request: &IssuanceRequest) -> Result<SessionPointer> {
        let url = format!("{}/session", self.base_url);
        debug!(%url, "Starting issuance session");
        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(KeyshareError::Issuance(format!(
                "issuance server returned {}",
                response.status()
            )));
        }
        let parsed: StartSessionResponse = response.json().await?;
        Ok(parsed.session_ptr)
    }

    async fn proxy(&self, method: &str, path: &str, body: Bytes) -> Result<ProxiedResponse> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| KeyshareError::InvalidRequest(format!("bad method: {method}")))?;
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let response = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.bytes().await?;
        Ok(ProxiedResponse {
            status,
            content_type,
            body,
        })
    }
}
