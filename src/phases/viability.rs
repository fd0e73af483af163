use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::models::{Checkpoint, DecisionOption};
use crate::engine::phase::{PhaseExecutor, PhaseOutcome};

pub const LAUNCH_CHECKPOINT: &str = "approve-launch";

/// Financial viability model and the final launch gate. Approval here is the
/// last decision before the run completes.
pub struct ViabilityPhase;

#[async_trait]
impl PhaseExecutor for ViabilityPhase {
    fn name(&self) -> &'static str {
        "viability"
    }

    async fn execute(&self, _run_id: &str, state: &serde_json::Value) -> Result<PhaseOutcome> {
        let idea = state["onboarding"]["idea"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("viability requires the onboarding profile"))?;
        let target_conversion = state["desirability"]["plan"]["target_conversion_pct"]
            .as_i64()
            .unwrap_or(5);

        // Placeholder unit economics; the real modeling lives in the
        // external phase executor this default stands in for.
        let model = json!({
            "price_point_usd": 29,
            "assumed_conversion_pct": target_conversion,
            "monthly_break_even_customers": 120,
            "verdict": "viable_if_conversion_holds",
        });

        Ok(PhaseOutcome::Suspend {
            state: json!({"viability": {"model": model.clone()}}),
            checkpoint: Checkpoint {
                name: LAUNCH_CHECKPOINT.to_string(),
                title: "Approve launch".to_string(),
                description: format!("Final go/no-go for '{}'", idea),
                context: json!({"model": model}),
                options: vec![
                    DecisionOption::new("approved", "Launch", "complete the run"),
                    DecisionOption::new("iterate", "Iterate", "re-model with feedback"),
                    DecisionOption::new("rejected", "Reject", "stop the run"),
                ],
                recommended_option: Some("approved".to_string()),
            },
        })
    }
}
