use std::sync::Arc;

use crate::errors::EngineError;

use super::controller::RunController;
use super::models::{DecisionStatus, EventStatus, RunStatus, merge_snapshots, normalize_decision};
use super::store::StoreHandle;

/// Entry point for external approval events. Validates the decision against
/// the pending checkpoint, normalizes it, records it, and hands control back
/// to the run controller.
pub struct ResumeDispatcher {
    store: StoreHandle,
    controller: Arc<RunController>,
}

impl ResumeDispatcher {
    pub fn new(store: StoreHandle, controller: Arc<RunController>) -> Self {
        Self { store, controller }
    }

    /// Supply a decision for a pending checkpoint and continue execution.
    ///
    /// The conditional update on the decision row is the exactly-once
    /// linearization point: of two near-simultaneous resume calls, one wins
    /// the update and performs the transition, the other observes a consumed
    /// row and gets `AlreadyDecided`. Execution continues with the phase
    /// *after* the one that suspended, except the `"iterate"` decision which
    /// deliberately re-enters the same phase with the decision merged into
    /// state.
    pub async fn resume(
        &self,
        run_id: &str,
        checkpoint_name: &str,
        decision_value: &str,
        feedback: Option<String>,
        decided_by: &str,
    ) -> Result<RunStatus, EngineError> {
        // Confirm the run exists so an unknown run id reports as such rather
        // than as a missing checkpoint.
        let run = self.controller.load(run_id).await?;

        let id = run_id.to_string();
        let name = checkpoint_name.to_string();
        let existing = self
            .store
            .call(move |db| db.get_decision(&id, &name))
            .await?;
        if existing.is_none() {
            return Err(EngineError::CheckpointNotFound {
                run_id: run_id.to_string(),
                checkpoint_name: checkpoint_name.to_string(),
            });
        }

        let status = normalize_decision(decision_value);

        let id = run_id.to_string();
        let name = checkpoint_name.to_string();
        let value = decision_value.to_string();
        let fb = feedback.clone();
        let by = decided_by.to_string();
        let matched = self
            .store
            .call(move |db| db.decide(&id, &name, &status, &value, fb.as_deref(), &by))
            .await?;

        if matched == 0 {
            return Err(self.classify_not_pending(run_id, checkpoint_name).await);
        }

        // Linearization won; from here the transition happens exactly once.
        let id = run_id.to_string();
        let name = checkpoint_name.to_string();
        let decision = self
            .store
            .call(move |db| db.get_decision(&id, &name))
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound {
                run_id: run_id.to_string(),
                checkpoint_name: checkpoint_name.to_string(),
            })?;

        let mut state = run.state.clone();
        merge_snapshots(
            &mut state,
            &serde_json::json!({
                "decisions": {
                    checkpoint_name: {
                        "decision": decision_value,
                        "feedback": feedback,
                        "decided_by": decided_by,
                        "decided_at": decision.decided_at,
                    }
                }
            }),
        );

        if status == DecisionStatus::Rejected {
            let error = format!("rejected at checkpoint {}", checkpoint_name);
            let id = run_id.to_string();
            let msg = error.clone();
            self.store.call(move |db| db.fail_run(&id, &msg)).await?;
            self.controller
                .record(
                    run_id,
                    decision.phase_index,
                    checkpoint_name,
                    EventStatus::Failed,
                    None,
                    Some(format!("rejected by {}", decided_by)),
                )
                .await?;
            tracing::info!(run_id, checkpoint = checkpoint_name, "run rejected");
            return Ok(RunStatus::Failed);
        }

        // "iterate" re-enters the suspending phase; everything else moves on.
        let next_phase = if status == DecisionStatus::Pending {
            decision.phase_index
        } else {
            decision.phase_index + 1
        };

        let id = run_id.to_string();
        let resumed = self
            .store
            .call(move |db| db.resume_run(&id, next_phase, &state))
            .await?;
        if resumed == 0 {
            // The run was not paused: a prior resume crashed between the run
            // update and advance, or a sweep got here first. Advance below
            // is idempotent either way.
            tracing::warn!(
                run_id,
                checkpoint = checkpoint_name,
                "resume found run not paused, re-driving advance"
            );
        } else {
            tracing::info!(
                run_id,
                checkpoint = checkpoint_name,
                decision = decision_value,
                "run resumed"
            );
        }

        self.controller.advance(run_id).await
    }

    /// Classify why the decision row refused the conditional update.
    async fn classify_not_pending(&self, run_id: &str, checkpoint_name: &str) -> EngineError {
        let id = run_id.to_string();
        let name = checkpoint_name.to_string();
        let decision = match self.store.call(move |db| db.get_decision(&id, &name)).await {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                return EngineError::CheckpointNotFound {
                    run_id: run_id.to_string(),
                    checkpoint_name: checkpoint_name.to_string(),
                };
            }
            Err(e) => return EngineError::Other(e),
        };
        match decision.status {
            DecisionStatus::Expired | DecisionStatus::Cancelled => EngineError::CheckpointExpired {
                run_id: run_id.to_string(),
                checkpoint_name: checkpoint_name.to_string(),
                status: decision.status,
            },
            status => EngineError::AlreadyDecided {
                run_id: run_id.to_string(),
                checkpoint_name: checkpoint_name.to_string(),
                status,
            },
        }
    }
}
