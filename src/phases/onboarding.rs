use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::phase::{PhaseExecutor, PhaseOutcome};

/// Validates the submitted input and seeds the idea profile every later
/// phase reads from.
pub struct OnboardingPhase;

#[async_trait]
impl PhaseExecutor for OnboardingPhase {
    fn name(&self) -> &'static str {
        "onboarding"
    }

    async fn execute(&self, _run_id: &str, state: &serde_json::Value) -> Result<PhaseOutcome> {
        let idea = state["input"]["idea"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("onboarding requires a non-empty input.idea"))?
            .to_string();

        let problem = state["input"]["problem"].as_str().unwrap_or("unspecified");

        Ok(PhaseOutcome::Advance(json!({
            "onboarding": {
                "idea": idea,
                "problem": problem,
                "profile": format!("Validation run for '{}'", idea),
            }
        })))
    }
}
