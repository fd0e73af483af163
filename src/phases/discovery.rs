use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::models::{Checkpoint, DecisionOption};
use crate::engine::phase::{PhaseExecutor, PhaseOutcome};

pub const SEGMENT_CHECKPOINT: &str = "select-target-segment";

/// Market discovery: proposes candidate customer segments and suspends for
/// the founder to pick one. An `"iterate"` decision re-enters this phase
/// with the feedback merged into state, bumping `discovery.iteration`.
pub struct DiscoveryPhase;

#[async_trait]
impl PhaseExecutor for DiscoveryPhase {
    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn execute(&self, _run_id: &str, state: &serde_json::Value) -> Result<PhaseOutcome> {
        let idea = state["onboarding"]["idea"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("discovery requires the onboarding profile"))?;

        let iteration = state["discovery"]["iteration"].as_i64().unwrap_or(0) + 1;
        let feedback = state["decisions"][SEGMENT_CHECKPOINT]["feedback"]
            .as_str()
            .unwrap_or_default();

        let segments = json!([
            {"id": "segment_1", "label": format!("Early adopters of {}", idea)},
            {"id": "segment_2", "label": format!("Small teams buying {}", idea)},
            {"id": "segment_3", "label": format!("Enterprise buyers of {}", idea)},
        ]);

        let mut description = format!("Candidate segments for '{}', iteration {}.", idea, iteration);
        if !feedback.is_empty() {
            description.push_str(&format!(" Prior feedback: {}", feedback));
        }

        Ok(PhaseOutcome::Suspend {
            state: json!({
                "discovery": {"segments": segments.clone(), "iteration": iteration}
            }),
            checkpoint: Checkpoint {
                name: SEGMENT_CHECKPOINT.to_string(),
                title: "Select a target segment".to_string(),
                description,
                context: json!({"segments": segments, "iteration": iteration}),
                options: vec![
                    DecisionOption::new("segment_1", "Segment 1", "early adopters"),
                    DecisionOption::new("segment_2", "Segment 2", "small teams"),
                    DecisionOption::new("segment_3", "Segment 3", "enterprise"),
                    DecisionOption::new("custom_segment", "Custom", "describe your own in feedback"),
                    DecisionOption::new("iterate", "Iterate", "regenerate segments with feedback"),
                ],
                recommended_option: Some("segment_1".to_string()),
            },
        })
    }
}
