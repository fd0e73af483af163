use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::models::{Checkpoint, DecisionOption};
use crate::engine::phase::{PhaseExecutor, PhaseOutcome};

use super::discovery::SEGMENT_CHECKPOINT;

pub const PLAN_CHECKPOINT: &str = "approve-validation-plan";

/// Drafts a demand-validation plan for the chosen segment and suspends for
/// plan approval.
pub struct DesirabilityPhase;

#[async_trait]
impl PhaseExecutor for DesirabilityPhase {
    fn name(&self) -> &'static str {
        "desirability"
    }

    async fn execute(&self, _run_id: &str, state: &serde_json::Value) -> Result<PhaseOutcome> {
        let idea = state["onboarding"]["idea"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("desirability requires the onboarding profile"))?;

        // The verbatim decision value from the segment gate; "custom_segment"
        // pivots to whatever the feedback described.
        let segment = state["decisions"][SEGMENT_CHECKPOINT]["decision"]
            .as_str()
            .unwrap_or("segment_1")
            .to_string();
        let segment_label = if segment == "custom_segment" {
            state["decisions"][SEGMENT_CHECKPOINT]["feedback"]
                .as_str()
                .unwrap_or("custom segment")
                .to_string()
        } else {
            lookup_segment_label(state, &segment).unwrap_or_else(|| segment.clone())
        };

        let plan = json!({
            "channel": "landing_page",
            "hypothesis": format!("'{}' buyers in '{}' will sign up for early access", idea, segment_label),
            "success_metric": "signup_conversion",
            "target_conversion_pct": 5,
        });

        Ok(PhaseOutcome::Suspend {
            state: json!({
                "desirability": {
                    "segment": segment.clone(),
                    "segment_label": segment_label.clone(),
                    "plan": plan.clone(),
                }
            }),
            checkpoint: Checkpoint {
                name: PLAN_CHECKPOINT.to_string(),
                title: "Approve the validation plan".to_string(),
                description: format!("Landing-page test targeting {}", segment_label),
                context: json!({"plan": plan, "segment": segment}),
                options: vec![
                    DecisionOption::new("approved", "Approve", "run the test as drafted"),
                    DecisionOption::new("iterate", "Iterate", "redraft with feedback"),
                    DecisionOption::new("rejected", "Reject", "stop the run"),
                ],
                recommended_option: Some("approved".to_string()),
            },
        })
    }
}

fn lookup_segment_label(state: &serde_json::Value, segment_id: &str) -> Option<String> {
    state["discovery"]["segments"]
        .as_array()?
        .iter()
        .find(|s| s["id"].as_str() == Some(segment_id))
        .and_then(|s| s["label"].as_str())
        .map(str::to_string)
}
