//! Typed error hierarchy for the steward engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `LeaseError` — resource lease pool failures
//! - `StateError` — run state store failures
//! - `ChainError` — chain resolution and executor failures
//!
//! Phase-level failures (tool crashes, phantom merges, data-integrity
//! mismatches) are deliberately *not* represented here: they are recorded
//! as tagged outcomes on the run's phase history, never raised as errors
//! that could be caught and dropped.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the resource lease pool.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease pool exhausted ({capacity} slots in use)")]
    Exhausted { capacity: usize },

    #[error("failed to create workspace at {path}: {source}")]
    WorkspaceCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to access lease table at {path}: {source}")]
    TableIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lease table at {path} is corrupt: {source}")]
    CorruptTable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("run {run_id} does not hold a lease")]
    NotHeld { run_id: String },
}

impl LeaseError {
    /// Exhaustion is the only lease failure a caller should retry;
    /// everything else needs operator attention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Errors from the run state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("run {run_id} not found")]
    NotFound { run_id: String },

    #[error("stale save for run {run_id}: expected version {expected}, store has {found}")]
    Conflict {
        run_id: String,
        expected: u64,
        found: u64,
    },

    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state record at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    /// A version conflict means the caller holds a stale copy: reload
    /// and retry. All other state errors are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors from chain resolution and the chain executor.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unknown chain '{name}'")]
    UnknownChain { name: String },

    #[error("chain '{chain}' references unknown phase '{phase}'")]
    UnknownPhase { chain: String, phase: String },

    #[error("run {run_id} is already terminal ({status})")]
    AlreadyTerminal { run_id: String, status: String },

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
