//! Shared types for the keyshare server

pub mod error;

pub use error::{KeyshareError, RemoteError, Result};
