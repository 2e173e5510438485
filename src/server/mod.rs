//! Protocol server: HTTP plumbing and endpoint handlers

pub mod handlers;
pub mod http;

pub use http::{run, AppState, EmailContext};
