//! Keyshare server for distributed attribute-based credentials.
//!
//! Each user's share of an Idemix master secret lives here, encrypted under a
//! PIN the server never sees in plaintext. Credential transactions run a
//! two-message Schnorr sub-protocol against this server, gated by a PIN check
//! and a short-lived authorization token.

pub mod config;
pub mod core;
pub mod db;
pub mod email;
pub mod idemix;
pub mod issuance;
pub mod server;
pub mod sessions;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{KeyshareError, Result};
