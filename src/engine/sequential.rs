//! Sequential LLM-backed engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{EngineError, EngineOutput, ExecutionEngine, ExecutionPlan, StructuredOutput, TaskOutput};
use crate::agents::{AgentResult, Stage, StageContext, StageTask};
use crate::llm::{ChatOptions, LlmClient, LlmError, LlmErrorKind};

/// Runs each stage against an LLM, one after another.
pub struct LlmEngine {
    llm: Arc<dyn LlmClient>,
    max_retries: u32,
    retry_base_delay: Duration,
    options: ChatOptions,
}

/// A stage that produced output.
struct StageRun {
    model: String,
    output: String,
    credits: f64,
    retries: u32,
    ledger_error: Option<String>,
}

/// A stage that gave up.
struct StageFailure {
    error: EngineError,
    retries: u32,
}

impl StageFailure {
    fn new(error: impl Into<EngineError>, retries: u32) -> Self {
        Self {
            error: error.into(),
            retries,
        }
    }
}

impl LlmEngine {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            options: ChatOptions {
                temperature: Some(0.7),
                max_tokens: None,
            },
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// The requested model if affordable, otherwise its fallback.
    async fn select_model(&self, requested: &str, ctx: &StageContext) -> Result<String, EngineError> {
        if ctx.ledger.can_use_model(requested).await? {
            return Ok(requested.to_string());
        }
        let fallback = ctx.ledger.get_fallback_model(requested).await?;
        tracing::warn!(
            requested = %requested,
            fallback = %fallback,
            niche = %ctx.niche,
            "Requested model over budget, using fallback"
        );
        Ok(fallback)
    }

    async fn run_stage(
        &self,
        task: &StageTask,
        outputs: &BTreeMap<Stage, String>,
        ctx: &StageContext,
    ) -> Result<StageRun, StageFailure> {
        let model = self
            .select_model(&task.model, ctx)
            .await
            .map_err(|e| StageFailure::new(e, 0))?;
        let (route, credits) = {
            let cost = ctx
                .ledger
                .registry()
                .cost_of(&model)
                .map_err(|_| StageFailure::new(crate::budget::BudgetError::UnknownModel(model.clone()), 0))?;
            (cost.route.clone(), cost.credits_per_request)
        };

        let messages = task.messages(outputs);
        let mut retries = 0u32;

        loop {
            let result = tokio::select! {
                _ = ctx.cancel_token.cancelled() => {
                    return Err(StageFailure::new(EngineError::Cancelled, retries));
                }
                r = self.llm.chat_completion(&route, &messages, &self.options) => r,
            };

            let err = match result {
                Ok(response) => match response.content {
                    Some(content) if !content.trim().is_empty() => {
                        let ledger_error = self
                            .charge(task, &model, credits, retries, response.usage.as_ref(), ctx)
                            .await;
                        return Ok(StageRun {
                            model,
                            output: content,
                            credits,
                            retries,
                            ledger_error,
                        });
                    }
                    _ => LlmError::new(LlmErrorKind::MalformedResponse, "Model returned empty content"),
                },
                Err(e) => e,
            };

            if !err.is_retryable() || retries >= self.max_retries {
                return Err(StageFailure::new(err, retries));
            }
            retries += 1;
            let delay = self.retry_base_delay * retries;
            tracing::warn!(
                stage = %task.stage,
                model = %model,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Stage call failed, retrying"
            );
            tokio::select! {
                _ = ctx.cancel_token.cancelled() => {
                    return Err(StageFailure::new(EngineError::Cancelled, retries));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Record the request in the ledger. A failed write is returned as a
    /// message, not swallowed.
    async fn charge(
        &self,
        task: &StageTask,
        model: &str,
        credits: f64,
        retries: u32,
        usage: Option<&crate::llm::TokenUsage>,
        ctx: &StageContext,
    ) -> Option<String> {
        let metadata = serde_json::json!({
            "stage": task.stage,
            "niche": ctx.niche,
            "requested_model": task.model,
            "retries": retries,
            "prompt_tokens": usage.map(|u| u.prompt_tokens),
            "completion_tokens": usage.map(|u| u.completion_tokens),
        });
        match ctx.ledger.record_usage(model, credits, metadata).await {
            Ok(_) => None,
            Err(e) => {
                tracing::error!(
                    stage = %task.stage,
                    model = %model,
                    credits = credits,
                    error = %e,
                    "Usage not recorded in budget ledger"
                );
                Some(format!("Usage not recorded: {}", e))
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for LlmEngine {
    async fn execute(&self, plan: ExecutionPlan, ctx: StageContext) -> Result<EngineOutput, EngineError> {
        let mut outputs: BTreeMap<Stage, String> = BTreeMap::new();
        let mut tasks_output = Vec::with_capacity(plan.len());

        for task in plan.tasks() {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            tracing::info!(stage = %task.stage, model = %task.model, "Stage started");
            let started = Instant::now();

            match self.run_stage(task, &outputs, &ctx).await {
                Ok(run) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    tracing::info!(
                        stage = %task.stage,
                        model = %run.model,
                        duration_secs = elapsed,
                        credits = run.credits,
                        retries = run.retries,
                        "Stage finished"
                    );
                    let mut result = AgentResult::success(task.stage.name(), run.output.clone())
                        .with_duration(elapsed)
                        .with_credits(run.credits)
                        .with_retries(run.retries);
                    result.error = run.ledger_error;
                    ctx.report(result);

                    outputs.insert(task.stage, run.output.clone());
                    tasks_output.push(TaskOutput {
                        stage: task.stage,
                        model: run.model,
                        output: run.output,
                    });
                }
                Err(failure) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    let message = failure.error.to_string();
                    tracing::error!(stage = %task.stage, error = %message, "Stage failed");
                    ctx.report(
                        AgentResult::failure(task.stage.name(), message.clone())
                            .with_duration(elapsed)
                            .with_retries(failure.retries),
                    );
                    return Err(match failure.error {
                        EngineError::Cancelled => EngineError::Cancelled,
                        _ => EngineError::Stage {
                            stage: task.stage,
                            message,
                        },
                    });
                }
            }
        }

        let raw = tasks_output.last().map(|t| t.output.clone());
        Ok(EngineOutput::Structured(StructuredOutput {
            raw,
            final_output: None,
            tasks_output,
        }))
    }
}
