//! Greenlight engine — durable checkpoint-and-resume state machine.
//!
//! ## Overview
//!
//! The engine drives a fixed sequence of phase executors for each run.
//! A phase may run to completion and hand off to the next phase, or request
//! suspension at a named checkpoint. On suspension the full state snapshot
//! and a pending-decision record are persisted and the hosting process can
//! release every compute resource: the waiting state is not a parked thread,
//! it is the complete absence of a running process. A later resume call
//! reconstructs the execution context from the store and continues with the
//! phase after the one that suspended.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────┐  POST /api/resume  ┌────────────────────────────────────────┐
//! │ Approval│ ─────────────────> │ resume.rs   (ResumeDispatcher)         │
//! │   UI    │ <───────────────── │   │ normalize decision, CAS the row    │
//! └─────────┘  notify callback   │   v                                    │
//!      ^                        │ controller.rs (RunController::advance)  │
//!      │                        │   │ sequential phase loop               │
//!      │                        │   v                                    │
//!      │                        │ phase.rs    (PhaseExecutor contract)    │
//!      │                        │   │ Suspend outcome                     │
//!      │                        │   v                                    │
//!      └─────────────────────── │ checkpoint.rs (CheckpointManager)       │
//!         notify.rs (reqwest)   │   cancel-then-insert + pause, one tx    │
//!                               └────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `models`     | `Run`, `Decision`, `RunEvent`, status enums, normalize  |
//! | `store`      | SQLite access via `StoreHandle` (thin `Arc<Mutex<_>>`)  |
//! | `sweep`      | expiry + stuck-run reconciliation                       |
//!
//! All writes to run and decision status go through conditional updates;
//! a matched-zero-rows result always means "someone else already did this"
//! and resolves by re-reading, never by overwriting.

pub mod checkpoint;
pub mod controller;
pub mod models;
pub mod notify;
pub mod phase;
pub mod resume;
pub mod store;
pub mod sweep;

use std::sync::Arc;

use checkpoint::CheckpointManager;
use controller::RunController;
use notify::NotificationGateway;
use phase::Pipeline;
use resume::ResumeDispatcher;
use store::StoreHandle;

/// Wires the store, pipeline, and gateway into the three engine components.
/// Each piece stays independently constructible for tests; this is just the
/// standard assembly.
pub struct Engine {
    store: StoreHandle,
    controller: Arc<RunController>,
    dispatcher: ResumeDispatcher,
}

impl Engine {
    pub fn new(
        store: StoreHandle,
        pipeline: Pipeline,
        notifier: NotificationGateway,
        decision_ttl: chrono::Duration,
    ) -> Self {
        let checkpoints = CheckpointManager::new(store.clone(), notifier, decision_ttl);
        let controller = Arc::new(RunController::new(store.clone(), pipeline, checkpoints));
        let dispatcher = ResumeDispatcher::new(store.clone(), Arc::clone(&controller));
        Self {
            store,
            controller,
            dispatcher,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn controller(&self) -> &Arc<RunController> {
        &self.controller
    }

    pub fn dispatcher(&self) -> &ResumeDispatcher {
        &self.dispatcher
    }
}
