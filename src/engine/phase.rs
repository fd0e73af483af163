use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::models::Checkpoint;

/// What a phase executor asks the engine to do next.
///
/// The third contractual outcome, Fail, is the `Err` arm of the executor's
/// return type: any error crossing the phase boundary is converted into a
/// terminal run failure by the controller, never propagated raw.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    /// Merge the returned snapshot patch and continue with the next phase.
    Advance(serde_json::Value),
    /// Merge the patch, persist a pending decision, pause the run. The
    /// hosting process may be torn down after this; nothing about the phase
    /// survives in memory.
    Suspend {
        state: serde_json::Value,
        checkpoint: Checkpoint,
    },
}

/// Contract each phase module implements: a pure function from (run id,
/// state snapshot) to an outcome. Executors run to completion every time
/// they are invoked; there is no partial-phase suspension.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Stable name, used for progress-event labels.
    fn name(&self) -> &'static str;

    async fn execute(&self, run_id: &str, state: &serde_json::Value) -> Result<PhaseOutcome>;
}

/// Fixed, statically known ordered list of phase executors. The engine is
/// phase-count-agnostic; indices are ordinals into this sequence.
#[derive(Clone)]
pub struct Pipeline {
    executors: Vec<Arc<dyn PhaseExecutor>>,
}

impl Pipeline {
    pub fn new(executors: Vec<Arc<dyn PhaseExecutor>>) -> Self {
        Self { executors }
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn PhaseExecutor>> {
        self.executors.get(index)
    }

    pub fn phase_name(&self, index: usize) -> Option<&'static str> {
        self.executors.get(index).map(|e| e.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl PhaseExecutor for Noop {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn execute(&self, _run_id: &str, _state: &serde_json::Value) -> Result<PhaseOutcome> {
            Ok(PhaseOutcome::Advance(serde_json::json!({})))
        }
    }

    #[test]
    fn pipeline_indexing() {
        let pipeline = Pipeline::new(vec![Arc::new(Noop("a")), Arc::new(Noop("b"))]);
        assert_eq!(pipeline.len(), 2);
        assert!(!pipeline.is_empty());
        assert_eq!(pipeline.phase_name(0), Some("a"));
        assert_eq!(pipeline.phase_name(1), Some("b"));
        assert_eq!(pipeline.phase_name(2), None);
        assert!(pipeline.get(2).is_none());
    }
}
