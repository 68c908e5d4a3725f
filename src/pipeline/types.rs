use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentResult;
use crate::storage::AnalysisRecord;

/// Run state. `Completed`, `Failed`, `Partial` and `Timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Partial,
    Timeout,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate record of one run, owned by the run that created it.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub niche: String,
    pub status: PipelineStatus,
    pub final_report: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub total_credits_used: f64,
    pub agent_results: Vec<AgentResult>,
    pub supabase_saved: bool,
    pub supabase_record_id: Option<String>,
    pub local_backup_path: Option<PathBuf>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PipelineResult {
    pub fn new(niche: impl Into<String>) -> Self {
        Self {
            niche: niche.into(),
            status: PipelineStatus::NotStarted,
            final_report: None,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: 0.0,
            total_credits_used: 0.0,
            agent_results: Vec::new(),
            supabase_saved: false,
            supabase_record_id: None,
            local_backup_path: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Stamp the end time and duration.
    pub fn finish_clock(&mut self) {
        let end = Utc::now();
        self.duration_seconds = (end - self.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.end_time = Some(end);
    }

    pub fn succeeded_stages(&self) -> usize {
        self.agent_results.iter().filter(|r| r.is_success()).count()
    }

    /// Plain key-value form used for local backups and API responses.
    pub fn to_record(&self) -> serde_json::Value {
        serde_json::json!({
            "niche": self.niche,
            "status": self.status,
            "final_report": self.final_report,
            "start_time": self.start_time.to_rfc3339(),
            "end_time": self.end_time.map(|t| t.to_rfc3339()),
            "duration_seconds": self.duration_seconds,
            "total_credits_used": self.total_credits_used,
            "agent_results": self.agent_results.iter().map(AgentResult::to_record).collect::<Vec<_>>(),
            "supabase_saved": self.supabase_saved,
            "supabase_record_id": self.supabase_record_id,
            "local_backup_path": self.local_backup_path.as_ref().map(|p| p.display().to_string()),
            "errors": self.errors,
            "warnings": self.warnings,
        })
    }

    /// Row shape for the remote store.
    pub fn to_analysis_record(&self) -> AnalysisRecord {
        let agent_results: Vec<serde_json::Value> = self
            .agent_results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "agent_name": r.agent_name,
                    "status": r.status,
                    "duration_seconds": r.duration_seconds,
                    "credits_used": r.credits_used,
                    "retries": r.retries,
                })
            })
            .collect();

        AnalysisRecord {
            niche_name: self.niche.clone(),
            status: self.status.as_str().to_string(),
            report_markdown: self.final_report.clone(),
            metadata: serde_json::json!({
                "start_time": self.start_time.to_rfc3339(),
                "end_time": self.end_time.map(|t| t.to_rfc3339()),
                "duration_seconds": self.duration_seconds,
                "duration_minutes": self.duration_seconds / 60.0,
                "total_credits_used": self.total_credits_used,
                "agent_results": agent_results,
                "errors": self.errors,
                "warnings": self.warnings,
            }),
        }
    }
}
