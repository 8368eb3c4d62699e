//! Error types for statekeep.

use std::time::Duration;

use uuid::Uuid;

use crate::engine::EngineState;

/// Top-level error type for the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Engine lifecycle and tick errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine {name} tick failed: {reason}")]
    TickFailed { name: String, reason: String },

    #[error("Engine {name} panicked during tick: {reason}")]
    TickPanicked { name: String, reason: String },

    #[error("Engine {name} cannot {action} from state {state}")]
    InvalidState {
        name: String,
        action: &'static str,
        state: EngineState,
    },

    #[error("Engine {name} did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },

    #[error("No async runtime available to start engine {name}")]
    NoRuntime { name: String },
}

/// Errors raised by submitted operations.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("Operation {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },

    #[error("Operation {id} panicked: {reason}")]
    Panicked { id: Uuid, reason: String },

    #[error("Operation {id} on queue {queue} timed out after {timeout:?}")]
    Timeout {
        id: Uuid,
        queue: String,
        timeout: Duration,
    },
}

/// Durable object store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error on {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Write rejected for {key}: {reason}")]
    WriteRejected { key: String, reason: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Checkpoint save/restore errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to persist auxiliary data")]
    AuxiliarySaveFailed,

    #[error("No mapping registered for unit kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("Stack slot {depth} is missing or corrupt")]
    CorruptSlot { depth: usize },

    #[error("Root slot has kind '{found}', expected '{expected}'")]
    UnexpectedRoot { found: String, expected: String },

    #[error("Restore refused: {0}")]
    Refused(String),
}

/// Result type alias for the core.
pub type Result<T> = std::result::Result<T, Error>;
