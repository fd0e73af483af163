//! Default validation pipeline: Onboarding → Discovery → Desirability →
//! Feasibility → Viability.
//!
//! Each phase is a thin, deterministic implementation of the executor
//! contract: it structures the run's state snapshot and raises the domain's
//! named checkpoints. The engine itself is phase-count-agnostic; swap this
//! list for any other ordered set of executors.

pub mod desirability;
pub mod discovery;
pub mod feasibility;
pub mod onboarding;
pub mod viability;

use std::sync::Arc;

use crate::engine::phase::Pipeline;

pub use desirability::DesirabilityPhase;
pub use discovery::DiscoveryPhase;
pub use feasibility::FeasibilityPhase;
pub use onboarding::OnboardingPhase;
pub use viability::ViabilityPhase;

pub fn default_pipeline() -> Pipeline {
    Pipeline::new(vec![
        Arc::new(OnboardingPhase),
        Arc::new(DiscoveryPhase),
        Arc::new(DesirabilityPhase),
        Arc::new(FeasibilityPhase),
        Arc::new(ViabilityPhase),
    ])
}
