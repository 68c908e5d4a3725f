//! Analysis pipeline orchestrator.
//!
//! # Run protocol
//! 1. Validate the niche (no execution on failure)
//! 2. Advisory budget check (warning only)
//! 3. Build the five-stage plan
//! 4. Execute behind the circuit breaker and one global deadline
//! 5. Normalize the engine output into a report
//! 6. Attribute credits spent since the run started
//! 7. Persist: remote on success, local disk on every other path

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::field::Empty;
use tracing::{Instrument, Span};

use super::breaker::{CircuitBreaker, ConsecutiveFailureBreaker, NoopBreaker};
use super::normalize::normalize_output;
use super::persistence::ResultPersistence;
use super::types::{PipelineResult, PipelineStatus};
use super::validate::validate_niche;
use super::PipelineError;
use crate::agents::{StageContext, StageModels};
use crate::budget::BudgetLedger;
use crate::engine::{EngineOutput, ExecutionEngine, ExecutionPlan};
use crate::storage::RecordStore;

/// Per-pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Deadline for the whole multi-stage execution.
    pub timeout: Duration,
    /// Resolved once at construction; disabled means a no-op breaker.
    pub circuit_breaker: bool,
    /// Remaining credits below this produce a low-balance warning.
    pub estimated_run_cost: f64,
    pub output_dir: PathBuf,
    pub models: StageModels,
    /// Wrap each run in an `analysis_pipeline` span; disabled runs get
    /// `Span::none()`.
    pub telemetry: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90 * 60),
            circuit_breaker: true,
            estimated_run_cost: 5.0,
            output_dir: PathBuf::from("outputs"),
            models: StageModels::default(),
            telemetry: true,
        }
    }
}

/// Drives runs. One instance is shared by every run in the process, so
/// the breaker state is shared too.
pub struct AnalysisPipeline {
    engine: Arc<dyn ExecutionEngine>,
    ledger: Arc<BudgetLedger>,
    breaker: Arc<dyn CircuitBreaker>,
    persistence: ResultPersistence,
    options: PipelineOptions,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

impl AnalysisPipeline {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        ledger: Arc<BudgetLedger>,
        remote: Arc<dyn RecordStore>,
        options: PipelineOptions,
    ) -> Self {
        let breaker: Arc<dyn CircuitBreaker> = if options.circuit_breaker {
            Arc::new(ConsecutiveFailureBreaker::default())
        } else {
            Arc::new(NoopBreaker)
        };
        Self {
            engine,
            ledger,
            breaker,
            persistence: ResultPersistence::new(remote, options.output_dir.clone()),
            options,
        }
    }

    /// Replace the breaker, e.g. to share one across pipelines.
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &Arc<dyn CircuitBreaker> {
        &self.breaker
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the pipeline for `niche`. Never fails: every outcome, including
    /// a panic inside the engine, is reported through the result.
    pub async fn run(&self, niche: &str) -> PipelineResult {
        self.run_with_cancel(niche, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but cancelling `cancel` stops the run
    /// early. A stopped run is saved locally like any other failure.
    pub async fn run_with_cancel(&self, niche: &str, cancel: CancellationToken) -> PipelineResult {
        let span = self.run_span(niche);
        let result = self.run_guarded(niche, cancel).instrument(span.clone()).await;

        span.record("status", result.status.as_str());
        span.record("duration_seconds", result.duration_seconds);
        span.record("credits_used", result.total_credits_used);
        result
    }

    fn run_span(&self, niche: &str) -> Span {
        if self.options.telemetry {
            tracing::info_span!(
                "analysis_pipeline",
                niche = %niche,
                status = Empty,
                duration_seconds = Empty,
                credits_used = Empty,
            )
        } else {
            Span::none()
        }
    }

    async fn run_guarded(&self, niche: &str, cancel: CancellationToken) -> PipelineResult {
        let mut result = PipelineResult::new(niche);
        result.status = PipelineStatus::Running;

        tracing::info!(
            niche = %niche,
            timeout_secs = self.options.timeout.as_secs(),
            circuit = ?self.breaker.state(),
            "Pipeline started"
        );

        let outcome = AssertUnwindSafe(self.run_inner(&mut result, cancel))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            self.breaker.release();
            let err = PipelineError::Unexpected(panic_message(payload.as_ref()));
            tracing::error!(niche = %niche, error = %err, "Pipeline crashed");
            result.status = PipelineStatus::Failed;
            result.errors.push(err.to_string());
            result.finish_clock();
            self.persistence.save_local(&mut result).await;
        }

        tracing::info!(
            niche = %niche,
            status = %result.status,
            duration_secs = result.duration_seconds,
            credits_used = result.total_credits_used,
            supabase_saved = result.supabase_saved,
            local_backup = ?result.local_backup_path,
            "Pipeline finished"
        );
        result
    }

    async fn run_inner(&self, result: &mut PipelineResult, cancel: CancellationToken) {
        let niche = result.niche.clone();

        if let Err(msg) = validate_niche(&niche) {
            let err = PipelineError::Validation(msg);
            tracing::error!(niche = %niche, error = %err, "Input validation failed");
            result.status = PipelineStatus::Failed;
            result.errors.push(err.to_string());
            result.finish_clock();
            return;
        }

        self.check_budget(result).await;

        let plan = match ExecutionPlan::research(&niche, &self.options.models) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(result, PipelineError::Unexpected(e.to_string()), 0).await;
                return;
            }
        };
        let planned = plan.len();
        tracing::info!(niche = %niche, stages = planned, "Execution plan built");

        let (ctx, mut reports) = StageContext::new(niche.clone(), Arc::clone(&self.ledger), cancel.clone());
        let outcome = self.execute(plan, ctx, &cancel).await;
        while let Ok(report) = reports.try_recv() {
            result.agent_results.push(report);
        }

        let output = match outcome {
            Ok(output) => output,
            Err(err) => {
                self.fail(result, err, planned).await;
                return;
            }
        };

        match normalize_output(&output) {
            Some(report) => {
                tracing::info!(niche = %niche, report_size = report.len(), "Final report extracted");
                result.final_report = Some(report);
                result.status = PipelineStatus::Completed;
            }
            None => {
                self.fail(result, PipelineError::NoOutput, planned).await;
                return;
            }
        }

        result.finish_clock();
        self.attribute_credits(result).await;
        self.persistence.persist_completed(result).await;
    }

    /// Advisory only: a low balance degrades models downstream, it never
    /// blocks the run.
    async fn check_budget(&self, result: &mut PipelineResult) {
        let needed = self.options.estimated_run_cost;
        match self.ledger.get_remaining_credits().await {
            Ok(available) if available < needed => {
                tracing::warn!(available, needed, "Low credits, stages will fall back to cheaper models");
                result.warnings.push(format!(
                    "Low credits: {:.2} available, ~{} needed. Using free fallback models.",
                    available, needed
                ));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Budget check failed, continuing");
                result.warnings.push(format!("Budget check failed: {}", e));
            }
        }
    }

    async fn execute(
        &self,
        plan: ExecutionPlan,
        ctx: StageContext,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, PipelineError> {
        if !self.breaker.allow() {
            return Err(PipelineError::CircuitOpen);
        }

        let deadline = tokio::time::timeout(self.options.timeout, self.engine.execute(plan, ctx));
        let outcome = tokio::select! {
            outcome = deadline => outcome,
            _ = cancel.cancelled() => {
                self.breaker.release();
                return Err(PipelineError::Stopped);
            }
        };

        match outcome {
            Ok(Ok(output)) => {
                self.breaker.record_success();
                Ok(output)
            }
            Ok(Err(_)) if cancel.is_cancelled() => {
                self.breaker.release();
                Err(PipelineError::Stopped)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(PipelineError::Execution(e.to_string()))
            }
            Err(_) => {
                cancel.cancel();
                self.breaker.release();
                Err(PipelineError::Timeout(self.options.timeout))
            }
        }
    }

    async fn attribute_credits(&self, result: &mut PipelineResult) {
        match self.ledger.get_usage_since(result.start_time).await {
            Ok(credits) => result.total_credits_used = credits,
            Err(e) => {
                tracing::warn!(error = %e, "Could not attribute credits to run");
                result.warnings.push(format!("Credit attribution failed: {}", e));
            }
        }
    }

    /// Terminal failure after validation: record, attribute, save locally.
    async fn fail(&self, result: &mut PipelineResult, err: PipelineError, planned: usize) {
        result.status = match err {
            PipelineError::Timeout(_) => PipelineStatus::Timeout,
            _ => PipelineStatus::Failed,
        };
        match &err {
            PipelineError::Timeout(d) => {
                tracing::error!(niche = %result.niche, timeout_secs = d.as_secs(), "Pipeline timeout")
            }
            other => tracing::error!(niche = %result.niche, error = %other, "Pipeline execution failed"),
        }
        result.errors.push(err.to_string());
        self.attribute_credits(result).await;
        self.persistence.persist_partial(result, planned).await;
    }
}
