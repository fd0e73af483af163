//! Typed error hierarchy for the Greenlight engine.
//!
//! `EngineError` is the single taxonomy shared by the run controller, the
//! checkpoint manager, and the resume dispatcher. The HTTP layer maps these
//! onto status codes; the engine itself never surfaces a raw database error
//! for a condition that has a named variant here.

use thiserror::Error;

use crate::engine::models::DecisionStatus;

/// Errors from the engine subsystem (controller, checkpoint, resume).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Checkpoint {checkpoint_name} not found for run {run_id}")]
    CheckpointNotFound {
        run_id: String,
        checkpoint_name: String,
    },

    /// Resume was called against a checkpoint that is no longer pending.
    /// Carries the status it was found in so callers can tell a stale retry
    /// from a genuinely wrong identifier.
    #[error("Checkpoint {checkpoint_name} for run {run_id} already decided ({status})")]
    AlreadyDecided {
        run_id: String,
        checkpoint_name: String,
        status: DecisionStatus,
    },

    #[error("Checkpoint {checkpoint_name} for run {run_id} is {status}, no longer actionable")]
    CheckpointExpired {
        run_id: String,
        checkpoint_name: String,
        status: DecisionStatus,
    },

    /// A second pending decision was inserted for the same (run, checkpoint)
    /// pair. The checkpoint manager cancels the prior row before inserting,
    /// so hitting this means a concurrency bug, not a recoverable condition.
    #[error("Duplicate pending checkpoint {checkpoint_name} for run {run_id}")]
    DuplicateCheckpoint {
        run_id: String,
        checkpoint_name: String,
    },

    /// A conditional update matched zero rows: another invocation already
    /// performed the transition. Resolved by re-reading, never retried as a
    /// blind overwrite.
    #[error("Stale transition on run {run_id}: {detail}")]
    StaleTransition { run_id: String, detail: String },

    #[error("Phase {phase} failed for run {run_id}: {message}")]
    PhaseExecution {
        run_id: String,
        phase: String,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
