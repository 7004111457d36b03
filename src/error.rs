//! Error types for ArenaCache

use thiserror::Error;

/// Main error type for ArenaCache
#[derive(Error, Debug)]
pub enum ArenaCacheError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Protocol parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid flags")]
    InvalidFlags,

    #[error("Invalid exptime")]
    InvalidExptime,

    #[error("Invalid bytes length")]
    InvalidBytesLength,

    #[error("Invalid numeric value")]
    InvalidNumericValue,

    #[error("Invalid cas unique")]
    InvalidCasUnique,

    #[error("Key too long (max 250 bytes)")]
    KeyTooLong,

    /// Carries the announced data length, which the connection discards
    #[error("Value too large ({0} bytes)")]
    ValueTooLarge(usize),

    #[error("Unexpected data")]
    UnexpectedData,
}

/// Storage engine errors
///
/// Absent keys and CAS conflicts are not errors: they surface as
/// `StoreResponse`/`DeleteResponse` codes or `None`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Out of space: requested {requested} bytes, {available} bytes free")]
    OutOfSpace { requested: usize, available: usize },

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Not a numeric value")]
    NotANumber,

    #[error("Element decoding error: {0}")]
    Decoding(String),

    #[error("Storage is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ArenaCacheError>;
