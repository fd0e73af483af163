use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::phase::{PhaseExecutor, PhaseOutcome};

/// Technical feasibility assessment. No gate: this phase always advances.
pub struct FeasibilityPhase;

#[async_trait]
impl PhaseExecutor for FeasibilityPhase {
    fn name(&self) -> &'static str {
        "feasibility"
    }

    async fn execute(&self, _run_id: &str, state: &serde_json::Value) -> Result<PhaseOutcome> {
        let idea = state["onboarding"]["idea"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("feasibility requires the onboarding profile"))?;
        let channel = state["desirability"]["plan"]["channel"]
            .as_str()
            .unwrap_or("landing_page");

        Ok(PhaseOutcome::Advance(json!({
            "feasibility": {
                "subject": idea,
                "mvp_scope": format!("{} + waitlist + manual fulfilment", channel),
                "build_complexity": "medium",
                "risks": ["single-channel demand signal", "manual fulfilment ceiling"],
            }
        })))
    }
}
