use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::errors::EngineError;

use super::controller::RunController;
use super::store::{StoreHandle, now_rfc3339};

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub expired: usize,
    pub readvanced: usize,
}

/// Periodic reconciliation over the store.
///
/// Two jobs: close out pending decisions whose expiry passed (failing the
/// abandoned run), and re-drive `advance` for runs left in `running` with no
/// recent progress event — the stuck state a crash between resume and
/// advance leaves behind. Both lean on the same conditional updates as the
/// live path, so racing a concurrent resume is harmless.
pub struct Sweeper {
    store: StoreHandle,
    controller: Arc<RunController>,
    stale_after: Duration,
}

impl Sweeper {
    pub fn new(store: StoreHandle, controller: Arc<RunController>, stale_after: Duration) -> Self {
        Self {
            store,
            controller,
            stale_after,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();

        let now = now_rfc3339();
        let overdue = self
            .store
            .call(move |db| db.overdue_pending_decisions(&now))
            .await?;
        for decision in overdue {
            let decision_id = decision.id;
            let changed = self
                .store
                .call(move |db| db.expire_decision(decision_id))
                .await?;
            if changed == 0 {
                // Decided between the select and the update; leave it be.
                continue;
            }
            let run_id = decision.run_id.clone();
            let error = format!("checkpoint {} expired", decision.checkpoint_name);
            self.store
                .call(move |db| db.fail_run(&run_id, &error))
                .await?;
            tracing::info!(
                run_id = %decision.run_id,
                checkpoint = %decision.checkpoint_name,
                "expired pending decision, run failed"
            );
            report.expired += 1;
        }

        let cutoff = (Utc::now() - self.stale_after)
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let stuck = self
            .store
            .call(move |db| db.stale_running_runs(&cutoff))
            .await?;
        for run_id in stuck {
            tracing::info!(%run_id, "re-driving advance for stuck run");
            match self.controller.advance(&run_id).await {
                Ok(_) => report.readvanced += 1,
                Err(e) => {
                    tracing::warn!(%run_id, error = %e, "sweep advance failed");
                }
            }
        }

        Ok(report)
    }

    /// Loop `run_once` forever on an interval; used by the server.
    pub async fn run_forever(self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(report) if report.expired > 0 || report.readvanced > 0 => {
                    tracing::info!(
                        expired = report.expired,
                        readvanced = report.readvanced,
                        "sweep pass"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "sweep pass failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::checkpoint::CheckpointManager;
    use crate::engine::models::{Checkpoint, DecisionStatus, RunStatus};
    use crate::engine::notify::NotificationGateway;
    use crate::engine::phase::{PhaseExecutor, PhaseOutcome, Pipeline};
    use crate::engine::store::EngineDb;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    struct Step;

    #[async_trait]
    impl PhaseExecutor for Step {
        fn name(&self) -> &'static str {
            "step"
        }

        async fn execute(&self, _run_id: &str, _state: &serde_json::Value) -> Result<PhaseOutcome> {
            Ok(PhaseOutcome::Advance(json!({"step": "done"})))
        }
    }

    fn fixture() -> (StoreHandle, Arc<RunController>) {
        let store = StoreHandle::new(EngineDb::new_in_memory().unwrap());
        let checkpoints = CheckpointManager::new(
            store.clone(),
            NotificationGateway::new(None),
            Duration::days(7),
        );
        let controller = Arc::new(RunController::new(
            store.clone(),
            Pipeline::new(vec![Arc::new(Step)]),
            checkpoints,
        ));
        (store, controller)
    }

    #[tokio::test]
    async fn expires_overdue_decisions_and_fails_their_runs() {
        let (store, controller) = fixture();
        store
            .call(|db| {
                db.create_run("run-1", "p", "u", &json!({}))?;
                db.mark_run_started("run-1")?;
                db.suspend_run(
                    "run-1",
                    0,
                    &json!({}),
                    &Checkpoint {
                        name: "gate_a".into(),
                        title: "t".into(),
                        description: String::new(),
                        context: json!({}),
                        options: vec![],
                        recommended_option: None,
                    },
                    "2000-01-01T00:00:00.000000Z",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let sweeper = Sweeper::new(store.clone(), controller, Duration::minutes(30));
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.expired, 1);

        let run = store.call(|db| db.get_run("run-1")).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let decision = store
            .call(|db| db.get_decision("run-1", "gate_a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.status, DecisionStatus::Expired);

        // Second pass finds nothing.
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn readvances_stuck_running_runs() {
        let (store, controller) = fixture();
        store
            .call(|db| {
                db.create_run("run-1", "p", "u", &json!({}))?;
                db.mark_run_started("run-1")?;
                Ok(())
            })
            .await
            .unwrap();

        // Zero staleness window: anything without a newer event counts.
        let sweeper = Sweeper::new(store.clone(), controller, Duration::zero());
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.readvanced, 1);

        let run = store.call(|db| db.get_run("run-1")).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }
}
