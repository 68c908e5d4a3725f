//! Pipeline orchestration.
//!
//! [`AnalysisPipeline::run`] drives one niche through validation, the
//! advisory budget check, the five-stage plan, normalization and
//! persistence, and always hands back a [`PipelineResult`].

mod breaker;
mod normalize;
mod orchestrator;
mod persistence;
mod types;
mod validate;

use std::time::Duration;

use thiserror::Error;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ConsecutiveFailureBreaker, NoopBreaker};
pub use normalize::normalize_output;
pub use orchestrator::{AnalysisPipeline, PipelineOptions};
pub use persistence::ResultPersistence;
pub use types::{PipelineResult, PipelineStatus};
pub use validate::validate_niche;

/// Why a run did not complete. The orchestrator picks the terminal state
/// from the variant.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Input validation failed: {0}")]
    Validation(String),

    #[error("Pipeline timeout after {}", humanize(.0))]
    Timeout(Duration),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Execution rejected: circuit breaker is open")]
    CircuitOpen,

    #[error("Execution stopped: emergency stop requested")]
    Stopped,

    #[error("No output from execution engine")]
    NoOutput,

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// "90 minutes", "1 second", "1.5 seconds".
fn humanize(d: &Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_nanos() != 0 {
        format!("{:.1} seconds", d.as_secs_f64())
    } else if secs >= 60 && secs % 60 == 0 {
        plural(secs / 60, "minute")
    } else {
        plural(secs, "second")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_duration() {
        assert_eq!(
            PipelineError::Timeout(Duration::from_secs(90 * 60)).to_string(),
            "Pipeline timeout after 90 minutes"
        );
        assert_eq!(
            PipelineError::Timeout(Duration::from_secs(1)).to_string(),
            "Pipeline timeout after 1 second"
        );
        assert_eq!(humanize(&Duration::from_secs(61)), "61 seconds");
        assert_eq!(humanize(&Duration::from_millis(1500)), "1.5 seconds");
    }
}
