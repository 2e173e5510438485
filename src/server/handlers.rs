//! Endpoint handlers for the keyshare protocol
//!
//! Each HTTP handler parses the request and delegates to a logic function;
//! the logic functions are what the integration tests drive. Error mapping
//! follows one rule everywhere: an invalid PIN is never an HTTP error, it is
//! a `failure`/`error` status in the response body.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{HeaderMap, Request, Response, StatusCode};
use num_bigint::BigUint;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::db::{AuditEvent, PinTryReservation, User};
use crate::email::new_verification_token;
use crate::idemix::{ProofPCommitmentMap, PublicKeyIdentifier};
use crate::issuance::{IssuanceRequest, SessionPointer};
use crate::types::{KeyshareError, Result};

use super::http::{AppState, BoxBody, EmailContext};

const MAX_BODY_BYTES: usize = 64 * 1024;
const USERNAME_LEN: usize = 12;
const USERNAME_HEADER: &str = "X-IRMA-Keyshare-Username";

// =============================================================================
// Wire messages
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegistrationMessage {
    pub pin: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PinMessage {
    #[serde(alias = "id")]
    pub username: String,
    pub pin: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePinMessage {
    #[serde(alias = "id")]
    pub username: String,
    #[serde(rename = "oldPin", alias = "oldpin")]
    pub old_pin: String,
    #[serde(rename = "newPin", alias = "newpin")]
    pub new_pin: String,
}

/// Body of the PIN endpoints' responses. `message` carries the token on
/// success, the remaining attempts on failure, and the lock-out seconds on
/// error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PinStatus {
    pub fn success(message: Option<String>) -> Self {
        Self {
            status: "success".to_string(),
            message,
        }
    }

    pub fn failure(remaining_attempts: u32) -> Self {
        Self {
            status: "failure".to_string(),
            message: Some(remaining_attempts.to_string()),
        }
    }

    pub fn blocked(wait_seconds: i64) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(wait_seconds.to_string()),
        }
    }
}

/// Typed per-request context for the session endpoints, built from the
/// user-lookup and authorization headers. Authorization validity is recorded
/// but not enforced here; each handler decides.
#[derive(Debug)]
pub struct RequestContext {
    pub user: User,
    pub authorization: String,
    pub has_valid_authorization: bool,
}

// =============================================================================
// Response helpers
// =============================================================================

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response<T: Serialize>(body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(full_body(json))
        .unwrap()
}

fn text_response(body: String) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(full_body(body))
        .unwrap()
}

pub(crate) fn error_response(err: &KeyshareError) -> Response<BoxBody> {
    let remote = err.remote();
    let json = serde_json::to_string(&remote).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .body(full_body(json))
        .unwrap()
}

pub(crate) fn not_found(path: &str) -> Response<BoxBody> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
    });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

async fn read_body(body: Incoming) -> Result<Bytes> {
    let bytes = body.collect().await?.to_bytes();
    if bytes.len() > MAX_BODY_BYTES {
        return Err(KeyshareError::InvalidRequest("request body too large".into()));
    }
    Ok(bytes)
}

async fn parse_json_body<T: DeserializeOwned>(body: Incoming) -> Result<T> {
    let bytes = read_body(body).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The challenge arrives as a bare decimal big integer, quoted or not.
pub(crate) fn parse_challenge(body: &[u8]) -> Result<BigUint> {
    let text = std::str::from_utf8(body)
        .map_err(|_| KeyshareError::InvalidRequest("challenge is not UTF-8".into()))?;
    let trimmed = text.trim().trim_matches('"');
    if trimmed.is_empty() {
        return Err(KeyshareError::InvalidRequest("missing challenge".into()));
    }
    BigUint::parse_bytes(trimmed.as_bytes(), 10)
        .ok_or_else(|| KeyshareError::InvalidRequest(format!("invalid challenge: {trimmed}")))
}

fn random_username() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(USERNAME_LEN)
        .map(char::from)
        .collect()
}

// =============================================================================
// Middleware equivalents
// =============================================================================

/// User lookup plus authorization extraction for the session endpoints.
pub async fn session_context(state: &AppState, headers: &HeaderMap) -> Result<RequestContext> {
    let username = headers
        .get(USERNAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let user = state.db.user(username).await.map_err(|e| {
        warn!(username, error = %e, "Could not find user in db");
        KeyshareError::UserNotRegistered
    })?;

    let mut authorization = headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if let Some(stripped) = authorization.strip_prefix("Bearer ") {
        authorization = stripped.to_string();
    }

    // Deliberately no rejection here: commitments may be issued on a suspect
    // token (the core rejects it itself), while the response endpoint refuses
    // so it does not reveal whether a session is ongoing.
    let has_valid_authorization = state
        .core
        .validate_jwt(&user.secrets, &authorization)
        .is_ok();

    Ok(RequestContext {
        user,
        authorization,
        has_valid_authorization,
    })
}

// =============================================================================
// Registration
// =============================================================================

/// POST /client/register
pub(crate) async fn handle_register(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let msg: RegistrationMessage = match parse_json_body(req.into_body()).await {
        Ok(msg) => msg,
        Err(e) => return error_response(&e),
    };
    match register(&state, msg).await {
        Ok(pointer) => json_response(&pointer),
        Err(e) => error_response(&e),
    }
}

/// Create a keyshare account and start issuance of the keyshare credential.
pub async fn register(state: &AppState, msg: RegistrationMessage) -> Result<SessionPointer> {
    let secrets = state.core.new_user_secrets(&msg.pin)?;

    // Usernames are random; on the rare collision, draw again
    let mut user = None;
    for _ in 0..3 {
        let candidate = User::new(random_username(), msg.language.clone(), secrets.clone());
        match state.db.add_user(&candidate).await {
            Ok(()) => {
                user = Some(candidate);
                break;
            }
            Err(KeyshareError::UserAlreadyExists) => continue,
            Err(e) => {
                error!(error = %e, "Could not store new user in database");
                return Err(e);
            }
        }
    }
    let user = user.ok_or_else(|| {
        KeyshareError::Database("could not allocate an unused username".into())
    })?;
    info!(username = %user.username, "Registered new user");

    if let Some(email) = msg.email.as_deref().filter(|e| !e.is_empty()) {
        if let Some(email_ctx) = &state.email {
            send_registration_email(state, email_ctx, &user, email).await?;
        }
    }

    let request = IssuanceRequest::single_attribute(
        state.args.keyshare_credential.clone(),
        state.args.keyshare_attribute.clone(),
        user.username.clone(),
    );
    state.issuance.start_session(&request).await.map_err(|e| {
        error!(error = %e, "Could not start keyshare credential issuance session");
        e
    })
}

async fn send_registration_email(
    state: &AppState,
    email_ctx: &EmailContext,
    user: &User,
    email: &str,
) -> Result<()> {
    let token = new_verification_token();
    state
        .db
        .add_email_verification(&user.username, email, &token)
        .await
        .map_err(|e| {
            error!(error = %e, "Could not store email verification record");
            e
        })?;
    let (subject, body) = email_ctx
        .templates
        .render(&user.language, &token)
        .ok_or_else(|| {
            KeyshareError::Email(format!("no mail template for language {}", user.language))
        })?;
    email_ctx.sender.send(email, &subject, &body).await
}

// =============================================================================
// PIN endpoints
// =============================================================================

/// POST /users/verify/pin
pub(crate) async fn handle_verify_pin(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let msg: PinMessage = match parse_json_body(req.into_body()).await {
        Ok(msg) => msg,
        Err(e) => return error_response(&e),
    };
    let user = match state.db.user(&msg.username).await {
        Ok(user) => user,
        Err(e) => {
            warn!(username = %msg.username, error = %e, "Could not find user in db");
            return error_response(&KeyshareError::UserNotRegistered);
        }
    };
    match verify_pin(&state, &user, &msg.pin).await {
        Ok(status) => json_response(&status),
        Err(e) => error_response(&e),
    }
}

/// Check a PIN under the retry reservation and mint a token on success.
pub async fn verify_pin(state: &AppState, user: &User, pin: &str) -> Result<PinStatus> {
    let reservation = reserve_pin_check(state, user).await?;
    if !reservation.allowed {
        return Ok(PinStatus::blocked(reservation.wait_seconds));
    }

    match state.core.validate_pin(&user.secrets, pin) {
        Ok(token) => {
            // Both best-effort: the user holds a valid token either way
            if let Err(e) = state.db.reset_pin_tries(&user.username).await {
                warn!(error = %e, "Could not reset pin check state");
            }
            if let Err(e) = state.db.set_seen(&user.username).await {
                warn!(error = %e, "Could not indicate user activity");
            }
            add_log(state, user, AuditEvent::PinCheckSuccess, None).await?;
            Ok(PinStatus::success(Some(token)))
        }
        Err(KeyshareError::InvalidPin) => {
            add_log(
                state,
                user,
                AuditEvent::PinCheckFailed,
                Some(reservation.remaining_attempts as i64),
            )
            .await?;
            if reservation.remaining_attempts == 0 {
                add_log(
                    state,
                    user,
                    AuditEvent::PinCheckBlocked,
                    Some(reservation.wait_seconds),
                )
                .await?;
                Ok(PinStatus::blocked(reservation.wait_seconds))
            } else {
                Ok(PinStatus::failure(reservation.remaining_attempts))
            }
        }
        Err(e) => {
            error!(error = %e, "Could not validate pin");
            Err(e)
        }
    }
}

/// POST /users/change/pin
pub(crate) async fn handle_change_pin(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let msg: ChangePinMessage = match parse_json_body(req.into_body()).await {
        Ok(msg) => msg,
        Err(e) => return error_response(&e),
    };
    let user = match state.db.user(&msg.username).await {
        Ok(user) => user,
        Err(e) => {
            warn!(username = %msg.username, error = %e, "Could not find user in db");
            return error_response(&KeyshareError::UserNotRegistered);
        }
    };
    match change_pin(&state, user, &msg.old_pin, &msg.new_pin).await {
        Ok(status) => json_response(&status),
        Err(e) => error_response(&e),
    }
}

/// Verify the old PIN and rewrite the secrets blob under the new one.
///
/// Unlike `verify_pin`, exhausting the window here opens no new lock-out and
/// emits no blocked audit event; the legacy protocol behaves this way and
/// clients depend on the wire shape.
pub async fn change_pin(
    state: &AppState,
    mut user: User,
    old_pin: &str,
    new_pin: &str,
) -> Result<PinStatus> {
    let reservation = reserve_pin_check(state, &user).await?;
    if !reservation.allowed {
        return Ok(PinStatus::blocked(reservation.wait_seconds));
    }

    match state.core.change_pin(&user.secrets, old_pin, new_pin) {
        Ok(secrets) => {
            user.secrets = secrets;
            if let Err(e) = state.db.reset_pin_tries(&user.username).await {
                warn!(error = %e, "Could not reset pin check state");
            }
            state.db.update_user(&user).await.map_err(|e| {
                error!(error = %e, "Could not write updated user to database");
                e
            })?;
            Ok(PinStatus::success(None))
        }
        Err(KeyshareError::InvalidPin) => {
            if reservation.remaining_attempts == 0 {
                Ok(PinStatus::blocked(reservation.wait_seconds))
            } else {
                Ok(PinStatus::failure(reservation.remaining_attempts))
            }
        }
        Err(e) => {
            error!(error = %e, "Could not change pin");
            Err(e)
        }
    }
}

async fn reserve_pin_check(state: &AppState, user: &User) -> Result<PinTryReservation> {
    let reservation = state
        .db
        .reserve_pin_try(&user.username)
        .await
        .map_err(|e| {
            error!(error = %e, "Could not reserve pin check slot");
            e
        })?;
    if !reservation.allowed {
        add_log(state, user, AuditEvent::PinCheckRefused, None).await?;
    }
    Ok(reservation)
}

async fn add_log(
    state: &AppState,
    user: &User,
    event: AuditEvent,
    param: Option<i64>,
) -> Result<()> {
    state
        .db
        .add_log(&user.username, event, param)
        .await
        .map_err(|e| {
            error!(error = %e, "Could not add log entry for user");
            e
        })
}

// =============================================================================
// Keyshare session endpoints
// =============================================================================

/// POST /prove/getCommitments
pub(crate) async fn handle_commitments(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let (parts, body) = req.into_parts();
    let ctx = match session_context(&state, &parts.headers).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    let keys: Vec<PublicKeyIdentifier> = match parse_json_body(body).await {
        Ok(keys) => keys,
        Err(e) => return error_response(&e),
    };
    if keys.is_empty() {
        info!("Malformed request: no keys for commitment specified");
        return error_response(&KeyshareError::InvalidRequest("no key specified".into()));
    }
    match generate_commitments(&state, &ctx, &keys).await {
        Ok(commitments) => json_response(&commitments),
        Err(e) => error_response(&e),
    }
}

/// Produce commitments for the requested keys and remember the session
/// handoff.
///
/// The key order is load-bearing: the client puts the public key of the
/// credential being issued at index 0, and only that key is bound into the
/// session entry. `getResponse` produces its `P` component under it; the
/// remaining keys only feed commitments back to the client's proof builders.
pub async fn generate_commitments(
    state: &AppState,
    ctx: &RequestContext,
    keys: &[PublicKeyIdentifier],
) -> Result<ProofPCommitmentMap> {
    let (commitments, commit_id) = state
        .core
        .generate_commitments(&ctx.user.secrets, &ctx.authorization, keys)
        .map_err(|e| {
            warn!(error = %e, "Could not generate commitments for request");
            e
        })?;

    state
        .sessions
        .add(&ctx.user.username, keys[0].clone(), commit_id);

    Ok(ProofPCommitmentMap {
        commitments: keys.iter().cloned().zip(commitments).collect(),
    })
}

/// POST /prove/getResponse
pub(crate) async fn handle_response(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let (parts, body) = req.into_parts();
    let ctx = match session_context(&state, &parts.headers).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&e),
    };
    let challenge = match parse_challenge(&bytes) {
        Ok(challenge) => challenge,
        Err(e) => return error_response(&e),
    };

    // Refuse before touching session state, so unauthorized callers cannot
    // learn whether a session is ongoing
    if !ctx.has_valid_authorization {
        warn!("Could not generate keyshare response due to invalid authorization");
        return error_response(&KeyshareError::InvalidRequest("invalid authorization".into()));
    }

    match generate_response(&state, &ctx, &challenge).await {
        Ok(token) => text_response(token),
        Err(e) => error_response(&e),
    }
}

/// Complete the Schnorr exchange using the stored session handoff.
pub async fn generate_response(
    state: &AppState,
    ctx: &RequestContext,
    challenge: &BigUint,
) -> Result<String> {
    let entry = state.sessions.get(&ctx.user.username).ok_or_else(|| {
        warn!("Request for response without previous call to get commitments");
        KeyshareError::MissingCommitment
    })?;

    if let Err(e) = state.db.set_seen(&ctx.user.username).await {
        warn!(error = %e, "Could not mark user as seen recently");
    }
    // Audit failure is fatal here: nobody gets to use the server while
    // logging is broken
    add_log(state, &ctx.user, AuditEvent::IrmaSession, None).await?;

    state
        .core
        .generate_response(
            &ctx.user.secrets,
            &ctx.authorization,
            entry.commit_id,
            challenge,
            &entry.key_id,
        )
        .map_err(|e| {
            error!(error = %e, "Could not generate response for request");
            e
        })
}

// =============================================================================
// Issuance server mount
// =============================================================================

/// Forward `/irma/*` to the companion issuance server.
pub(crate) async fn handle_irma_proxy(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let method = req.method().as_str().to_string();
    let path = match req.uri().path_and_query() {
        Some(pq) => pq.as_str().to_string(),
        None => req.uri().path().to_string(),
    };
    let relative = path.strip_prefix("/irma").unwrap_or(&path).to_string();

    let body = match read_body(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&e),
    };

    match state.issuance.proxy(&method, &relative, body).await {
        Ok(proxied) => Response::builder()
            .status(StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY))
            .header("Content-Type", proxied.content_type)
            .body(full_body(proxied.body))
            .unwrap(),
        Err(e) => {
            error!(error = %e, "Could not proxy request to issuance server");
            error_response(&e)
        }
    }
}
