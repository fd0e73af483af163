use chrono::{Duration, Utc};

use crate::errors::EngineError;

use super::models::{Checkpoint, Decision};
use super::notify::NotificationGateway;
use super::store::StoreHandle;

/// Persists suspend checkpoints. On suspend the run's full snapshot and a
/// pending-decision row land in the store in one transaction; after that the
/// hosting process owes nothing further and may be torn down.
pub struct CheckpointManager {
    store: StoreHandle,
    notifier: NotificationGateway,
    decision_ttl: Duration,
}

impl CheckpointManager {
    pub fn new(store: StoreHandle, notifier: NotificationGateway, decision_ttl: Duration) -> Self {
        Self {
            store,
            notifier,
            decision_ttl,
        }
    }

    /// Suspend `run_id` at `phase_index` under the given checkpoint.
    ///
    /// Any prior `pending` decision for the same (run, checkpoint name) is
    /// cancelled in the same transaction before the new row is inserted;
    /// skipping that step would hit the partial unique index on the very
    /// next suspend for this checkpoint. Notification is fired after commit,
    /// best-effort: persistence is the source of truth, the decision-maker
    /// can always poll the store.
    pub async fn suspend(
        &self,
        run_id: &str,
        phase_index: i64,
        state: serde_json::Value,
        checkpoint: Checkpoint,
    ) -> Result<Decision, EngineError> {
        let expires_at = (Utc::now() + self.decision_ttl)
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let id = run_id.to_string();
        let cp = checkpoint.clone();
        let result = self
            .store
            .call(move |db| db.suspend_run(&id, phase_index, &state, &cp, &expires_at))
            .await;

        let decision = match result {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                return Err(EngineError::StaleTransition {
                    run_id: run_id.to_string(),
                    detail: format!("run moved past phase {} before suspend", phase_index),
                });
            }
            Err(e) if e.to_string().contains("duplicate pending checkpoint") => {
                // Cancel-then-insert makes this unreachable unless the
                // controller has a concurrency bug; surface it loudly.
                tracing::error!(
                    run_id,
                    checkpoint = %checkpoint.name,
                    "duplicate pending checkpoint despite cancel-then-insert"
                );
                return Err(EngineError::DuplicateCheckpoint {
                    run_id: run_id.to_string(),
                    checkpoint_name: checkpoint.name,
                });
            }
            Err(e) => return Err(EngineError::Other(e)),
        };

        self.notifier.decision_requested(&decision);
        Ok(decision)
    }
}
