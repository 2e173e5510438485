//! HTTP server implementation
//!
//! hyper http1 with TokioIo; routing is a single match over method and path.
//! The session endpoints build a typed request context from the user-lookup
//! and authorization headers before their handlers run.

use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::Args;
use crate::core::Core;
use crate::db::Db;
use crate::email::{EmailSender, EmailTemplates};
use crate::issuance::IssuanceServer;
use crate::sessions::SessionStore;
use crate::types::Result;

use super::handlers;

pub(crate) type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Mail collaborators, present only when registration mail is configured.
pub struct EmailContext {
    pub sender: Arc<dyn EmailSender>,
    pub templates: EmailTemplates,
}

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub core: Arc<Core>,
    pub db: Arc<dyn Db>,
    pub sessions: Arc<SessionStore>,
    pub issuance: Arc<dyn IssuanceServer>,
    pub email: Option<EmailContext>,
}

impl AppState {
    pub fn new(
        args: Args,
        core: Arc<Core>,
        db: Arc<dyn Db>,
        sessions: Arc<SessionStore>,
        issuance: Arc<dyn IssuanceServer>,
        email: Option<EmailContext>,
    ) -> Self {
        Self {
            args,
            core,
            db,
            sessions,
            issuance,
            email,
        }
    }
}

/// Start the HTTP server; returns when shutdown is signalled.
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("Keyshare server listening on {}", state.args.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move { handle_request(state, req).await }
                            });
                            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                                debug!("Error serving connection from {}: {:?}", addr, err);
                            }
                        });
                    }
                    Err(e) => error!("Error accepting connection: {:?}", e),
                }
            }
            _ = shutdown.changed() => {
                info!("Shutdown signal received, closing listener");
                return Ok(());
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let response = match (method, path.as_str()) {
        // Registration
        (Method::POST, "/client/register") => handlers::handle_register(state, req).await,

        // Pin logic
        (Method::POST, "/users/verify/pin") => handlers::handle_verify_pin(state, req).await,
        (Method::POST, "/users/change/pin") => handlers::handle_change_pin(state, req).await,

        // Keyshare sessions (user + authorization context)
        (Method::POST, "/prove/getCommitments") => handlers::handle_commitments(state, req).await,
        (Method::POST, "/prove/getResponse") => handlers::handle_response(state, req).await,

        // Issuance server for the keyshare credential issued at registration
        (_, p) if p.starts_with("/irma/") => handlers::handle_irma_proxy(state, req).await,

        _ => handlers::not_found(&path),
    };

    Ok(response)
}
