//! Execution engine - runs an ordered plan of stage tasks.
//!
//! The orchestrator only depends on [`ExecutionEngine`]; the default
//! implementation is [`LlmEngine`], which talks to an [`LlmClient`] and
//! charges the shared ledger per request.
//!
//! [`LlmClient`]: crate::llm::LlmClient

mod output;
mod sequential;

pub use output::{EngineOutput, StructuredOutput, TaskOutput};
pub use sequential::LlmEngine;

use async_trait::async_trait;
use thiserror::Error;

use crate::agents::{create_stage_task, Stage, StageContext, StageModels, StageTask};
use crate::budget::BudgetError;
use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("Invalid execution plan: {0}")]
    InvalidPlan(String),
}

/// Ordered, acyclic list of stage tasks.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    tasks: Vec<StageTask>,
}

impl ExecutionPlan {
    /// Every task may only consume stages placed before it.
    pub fn new(tasks: Vec<StageTask>) -> Result<Self, EngineError> {
        for (i, task) in tasks.iter().enumerate() {
            if tasks[..i].iter().any(|t| t.stage == task.stage) {
                return Err(EngineError::InvalidPlan(format!(
                    "stage {} appears twice",
                    task.stage
                )));
            }
            for up in &task.upstream {
                if !tasks[..i].iter().any(|t| t.stage == *up) {
                    return Err(EngineError::InvalidPlan(format!(
                        "{} depends on {}, which does not run before it",
                        task.stage, up
                    )));
                }
            }
        }
        Ok(Self { tasks })
    }

    /// The five-stage research chain for `niche`.
    pub fn research(niche: &str, models: &StageModels) -> Result<Self, EngineError> {
        let tasks = Stage::ALL
            .iter()
            .map(|stage| create_stage_task(*stage, niche, stage.upstream(), models.get(*stage)))
            .collect();
        Self::new(tasks)
    }

    pub fn tasks(&self) -> &[StageTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Runs a plan to completion or fails.
///
/// # Contract
/// - Tasks run in plan order; a task starts only after its predecessor finished.
/// - One [`AgentResult`](crate::agents::AgentResult) is reported on the
///   context per stage that started.
/// - Cancellation via `ctx.cancel_token` is honored between stages.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, plan: ExecutionPlan, ctx: StageContext) -> Result<EngineOutput, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn research_plan_has_five_ordered_stages() {
        let plan = ExecutionPlan::research("Rust WASM for real-time audio", &StageModels::default()).unwrap();
        assert_eq!(plan.len(), 5);
        let stages: Vec<Stage> = plan.tasks().iter().map(|t| t.stage).collect();
        assert_eq!(stages, Stage::ALL.to_vec());
        assert_eq!(plan.tasks()[4].model, "gpt-5");
    }

    #[test]
    fn rejects_forward_dependency() {
        let tasks = vec![
            create_stage_task(Stage::LiteratureResearcher, "x", &[Stage::NicheAnalyst], "gpt-4o"),
            create_stage_task(Stage::NicheAnalyst, "x", &[], "gpt-4o"),
        ];
        assert!(matches!(
            ExecutionPlan::new(tasks),
            Err(EngineError::InvalidPlan(_))
        ));
    }

    #[test]
    fn rejects_duplicate_stage() {
        let tasks = vec![
            create_stage_task(Stage::NicheAnalyst, "x", &[], "gpt-4o"),
            create_stage_task(Stage::NicheAnalyst, "x", &[], "gpt-4o"),
        ];
        assert!(ExecutionPlan::new(tasks).is_err());
    }
}
