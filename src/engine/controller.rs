use std::time::Instant;

use uuid::Uuid;

use crate::errors::EngineError;

use super::checkpoint::CheckpointManager;
use super::models::{EventStatus, Run, RunStatus, merge_snapshots};
use super::phase::{PhaseOutcome, Pipeline};
use super::store::StoreHandle;

/// The state machine core. Loads a run's current state, invokes the
/// appropriate phase executor, and either advances to the next phase, marks
/// the run terminal, or emits a suspend checkpoint.
///
/// Every invocation is stateless: `start`, `advance`, and resume may each
/// execute on a different compute unit, so all coordination happens through
/// conditional updates in the store.
pub struct RunController {
    store: StoreHandle,
    pipeline: Pipeline,
    checkpoints: CheckpointManager,
}

impl RunController {
    pub fn new(store: StoreHandle, pipeline: Pipeline, checkpoints: CheckpointManager) -> Self {
        Self {
            store,
            pipeline,
            checkpoints,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Create a run in `pending`, seeded with `initial_input` as the state
    /// snapshot. Returns immediately; the caller drives execution by
    /// invoking `advance` (typically on a background task).
    pub async fn start(
        &self,
        project_id: &str,
        user_id: &str,
        initial_input: serde_json::Value,
    ) -> Result<Run, EngineError> {
        let run_id = Uuid::new_v4().to_string();
        let id = run_id.clone();
        let project = project_id.to_string();
        let user = user_id.to_string();
        let run = self
            .store
            .call(move |db| db.create_run(&id, &project, &user, &initial_input))
            .await?;
        tracing::info!(run_id = %run_id, project_id, "run submitted");
        Ok(run)
    }

    pub async fn load(&self, run_id: &str) -> Result<Run, EngineError> {
        let id = run_id.to_string();
        self.store
            .call(move |db| db.get_run(&id))
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Drive the phase sequence from the run's current position until it
    /// completes, fails, or suspends. Safe to invoke concurrently for the
    /// same run: every transition is a conditional update, and the loser of
    /// a race observes the post-transition state and no-ops.
    pub async fn advance(&self, run_id: &str) -> Result<RunStatus, EngineError> {
        let mut run = self.load(run_id).await?;

        if run.status == RunStatus::Pending {
            let id = run.id.clone();
            self.store.call(move |db| db.mark_run_started(&id)).await?;
            run = self.load(run_id).await?;
        }

        loop {
            if run.status != RunStatus::Running {
                // Paused or terminal: nothing for this invocation to do.
                return Ok(run.status);
            }

            let index = run.current_phase;
            let Some(executor) = self.pipeline.get(index as usize).cloned() else {
                let id = run.id.clone();
                let n = self.store.call(move |db| db.complete_run(&id)).await?;
                if n == 0 {
                    run = self.load(run_id).await?;
                    return Ok(run.status);
                }
                tracing::info!(run_id, "run completed");
                return Ok(RunStatus::Completed);
            };

            let label = executor.name();
            self.record(run_id, index, label, EventStatus::Started, None, None)
                .await?;

            let started = Instant::now();
            let result = executor.execute(&run.id, &run.state).await;
            let duration_ms = started.elapsed().as_millis() as i64;

            match result {
                Ok(PhaseOutcome::Advance(patch)) => {
                    let mut state = run.state.clone();
                    merge_snapshots(&mut state, &patch);
                    let id = run.id.clone();
                    let snapshot = state.clone();
                    let n = self
                        .store
                        .call(move |db| db.advance_run_phase(&id, index, &snapshot))
                        .await?;
                    if n == 0 {
                        tracing::warn!(
                            run_id,
                            phase = index,
                            "phase transition already performed elsewhere, yielding"
                        );
                        run = self.load(run_id).await?;
                        return Ok(run.status);
                    }
                    self.record(
                        run_id,
                        index,
                        label,
                        EventStatus::Completed,
                        Some(duration_ms),
                        None,
                    )
                    .await?;
                    run.current_phase = index + 1;
                    run.state = state;
                }
                Ok(PhaseOutcome::Suspend { state: patch, checkpoint }) => {
                    let mut state = run.state.clone();
                    merge_snapshots(&mut state, &patch);
                    let checkpoint_name = checkpoint.name.clone();
                    match self
                        .checkpoints
                        .suspend(&run.id, index, state, checkpoint)
                        .await
                    {
                        Ok(_) => {
                            self.record(
                                run_id,
                                index,
                                label,
                                EventStatus::Completed,
                                Some(duration_ms),
                                None,
                            )
                            .await?;
                            tracing::info!(
                                run_id,
                                phase = index,
                                checkpoint = %checkpoint_name,
                                "run paused awaiting decision"
                            );
                            return Ok(RunStatus::Paused);
                        }
                        Err(EngineError::StaleTransition { .. }) => {
                            run = self.load(run_id).await?;
                            return Ok(run.status);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    // Phase-boundary conversion: executor errors become a
                    // terminal run failure, never a raw error out of advance.
                    let message = EngineError::PhaseExecution {
                        run_id: run.id.clone(),
                        phase: label.to_string(),
                        message: format!("{:#}", e),
                    }
                    .to_string();
                    let id = run.id.clone();
                    let msg = message.clone();
                    self.store.call(move |db| db.fail_run(&id, &msg)).await?;
                    self.record(
                        run_id,
                        index,
                        label,
                        EventStatus::Failed,
                        Some(duration_ms),
                        Some(message.clone()),
                    )
                    .await?;
                    tracing::warn!(run_id, phase = index, error = %message, "phase failed");
                    return Ok(RunStatus::Failed);
                }
            }
        }
    }

    pub(crate) async fn record(
        &self,
        run_id: &str,
        phase_index: i64,
        label: &str,
        status: EventStatus,
        duration_ms: Option<i64>,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let id = run_id.to_string();
        let label = label.to_string();
        self.store
            .call(move |db| {
                db.record_event(
                    &id,
                    phase_index,
                    &label,
                    &status,
                    None,
                    None,
                    error.as_deref(),
                    duration_ms,
                )
            })
            .await?;
        Ok(())
    }
}
