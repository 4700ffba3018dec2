//! Error types shared by the worker and the CLI
//!
//! Per-task failures (build failures, compile errors, timeouts, worker
//! faults) are recorded on the task record, never raised. The variants here
//! cover what must reach the caller: invalid configuration, an invalid batch,
//! pool exhaustion, and artifact I/O.

use thiserror::Error;

/// Invalid or inconsistent configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("parallelism must be at least 1")]
    ZeroParallelism,

    #[error("{0} must be positive")]
    ZeroTimeout(&'static str),

    #[error("isolation strategy {isolation} is not available in {mode} mode")]
    UnsupportedIsolation { mode: String, isolation: String },
}

/// Batch-level evaluation failures
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("duplicate task id in batch: {0}")]
    DuplicateTaskId(String),

    /// Every worker was retired; the batch holds partial results
    #[error("worker pool exhausted: {completed} tasks completed, {pending} tasks never ran")]
    PoolExhausted { completed: usize, pending: usize },
}

/// Result artifact read/write failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed summary line {line}: {reason}")]
    MalformedSummary { line: usize, reason: String },
}
