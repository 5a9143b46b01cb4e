//! Error types for Docrelay Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid document name: {0}")]
    InvalidDocName(String),

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Presence error: {0}")]
    Presence(String),
}

/// Result type alias for Docrelay Core operations
pub type Result<T> = std::result::Result<T, Error>;
