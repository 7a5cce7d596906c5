//! Error types for the linkage protocol.
//!
//! One enum per layer; [`ProtocolError`] is what round handlers return.

use thiserror::Error;

use crate::round::RoundPhase;

/// Errors talking to the matching engine over HTTP.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Engine answered with a status the contract treats as a hard failure.
    #[error("engine rejected {operation} with status {status}")]
    Rejected { operation: &'static str, status: u16 },

    #[error("could not encode engine request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed engine response for {operation}: {detail}")]
    Malformed { operation: &'static str, detail: String },

    /// Health poll exhausted its deadline.
    #[error("engine at {url} not healthy after {waited_secs}s")]
    Unavailable { url: String, waited_secs: u64 },
}

/// Errors starting or stopping the engine and its backing store.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("could not write engine config: {0}")]
    Config(#[from] ConfigError),
}

/// Errors loading or validating linkage settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Errors persisting a node's result slice.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reading a node's local tabular data.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("delimited text error: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: expected {expected} columns, found {found}")]
    ColumnCount { line: usize, expected: usize, found: usize },

    #[error("dataset has no header row")]
    MissingHeader,
}

/// Errors surfaced by a round handler. A returned error means the party's round failed.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Message does not belong to the phase the party is in.
    #[error("unexpected {message} while in phase {phase:?}")]
    UnexpectedMessage { phase: RoundPhase, message: &'static str },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
