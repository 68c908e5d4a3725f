//! Agents module - the five research stages and their task factories.
//!
//! # Stages
//! - **NicheAnalyst**: viability, trends and sub-niches
//! - **LiteratureResearcher**: academic papers, gaps and trends
//! - **TechnicalArchitect**: architecture, stack and design patterns
//! - **ImplementationSpecialist**: implementation plan and libraries
//! - **ContentSynthesizer**: final long-form report from all upstream outputs
//!
//! A [`StageTask`] is an opaque unit of work: it knows its role, its
//! instructions and which upstream stages it consumes. Running it is the
//! execution engine's job.

mod context;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;

pub use context::StageContext;

/// One stage of the research pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NicheAnalyst,
    LiteratureResearcher,
    TechnicalArchitect,
    ImplementationSpecialist,
    ContentSynthesizer,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::NicheAnalyst,
        Stage::LiteratureResearcher,
        Stage::TechnicalArchitect,
        Stage::ImplementationSpecialist,
        Stage::ContentSynthesizer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::NicheAnalyst => "niche_analyst",
            Self::LiteratureResearcher => "literature_researcher",
            Self::TechnicalArchitect => "technical_architect",
            Self::ImplementationSpecialist => "implementation_specialist",
            Self::ContentSynthesizer => "content_synthesizer",
        }
    }

    /// Suffix used by the `ARA_MODEL_<STAGE>` override variables.
    pub fn env_suffix(self) -> &'static str {
        match self {
            Self::NicheAnalyst => "NICHE_ANALYST",
            Self::LiteratureResearcher => "LITERATURE_RESEARCHER",
            Self::TechnicalArchitect => "TECHNICAL_ARCHITECT",
            Self::ImplementationSpecialist => "IMPLEMENTATION_SPECIALIST",
            Self::ContentSynthesizer => "CONTENT_SYNTHESIZER",
        }
    }

    pub fn role(self) -> &'static str {
        match self {
            Self::NicheAnalyst => "Niche Analyst",
            Self::LiteratureResearcher => "Literature Researcher",
            Self::TechnicalArchitect => "Technical Architect",
            Self::ImplementationSpecialist => "Implementation Specialist",
            Self::ContentSynthesizer => "Content Synthesizer",
        }
    }

    /// Stages whose outputs this stage receives as context.
    pub fn upstream(self) -> &'static [Stage] {
        match self {
            Self::NicheAnalyst => &[],
            Self::LiteratureResearcher => &[Stage::NicheAnalyst],
            Self::TechnicalArchitect => &[Stage::NicheAnalyst, Stage::LiteratureResearcher],
            Self::ImplementationSpecialist => &[Stage::TechnicalArchitect],
            Self::ContentSynthesizer => &[
                Stage::NicheAnalyst,
                Stage::LiteratureResearcher,
                Stage::TechnicalArchitect,
                Stage::ImplementationSpecialist,
            ],
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::NicheAnalyst => "gemini-2.5-pro",
            Self::LiteratureResearcher => "claude-haiku-4.5",
            Self::TechnicalArchitect => "claude-sonnet-4.5",
            Self::ImplementationSpecialist => "deepseek-v3",
            Self::ContentSynthesizer => "gpt-5",
        }
    }

    fn goal(self) -> &'static str {
        match self {
            Self::NicheAnalyst => {
                "Assess the viability of the niche: demand signals, active communities, \
                 emerging trends and promising sub-niches."
            }
            Self::LiteratureResearcher => {
                "Survey the academic and technical literature for the niche: key papers, \
                 recurring findings, open problems and research gaps."
            }
            Self::TechnicalArchitect => {
                "Design a technical architecture for a product in the niche: components, \
                 technology stack, design patterns and security considerations."
            }
            Self::ImplementationSpecialist => {
                "Turn the architecture into an implementation plan: milestones, user \
                 stories, concrete libraries and setup instructions."
            }
            Self::ContentSynthesizer => {
                "Synthesize every upstream finding into one long-form Markdown report \
                 with an executive summary, starting with a level-one heading."
            }
        }
    }

    fn expected_output(self) -> &'static str {
        match self {
            Self::NicheAnalyst => "A structured viability analysis in Markdown.",
            Self::LiteratureResearcher => "An annotated literature review in Markdown.",
            Self::TechnicalArchitect => "An architecture document in Markdown.",
            Self::ImplementationSpecialist => "A step-by-step implementation plan in Markdown.",
            Self::ContentSynthesizer => "The complete research report in Markdown.",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which registry model each stage asks for first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageModels(BTreeMap<Stage, String>);

impl Default for StageModels {
    fn default() -> Self {
        Self(
            Stage::ALL
                .iter()
                .map(|s| (*s, s.default_model().to_string()))
                .collect(),
        )
    }
}

impl StageModels {
    pub fn get(&self, stage: Stage) -> &str {
        self.0
            .get(&stage)
            .map(String::as_str)
            .unwrap_or_else(|| stage.default_model())
    }

    pub fn set(&mut self, stage: Stage, model: impl Into<String>) {
        self.0.insert(stage, model.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &str)> {
        self.0.iter().map(|(s, m)| (*s, m.as_str()))
    }
}

/// Executable unit for one stage.
#[derive(Debug, Clone)]
pub struct StageTask {
    pub stage: Stage,
    pub role: String,
    pub instructions: String,
    pub expected_output: String,
    /// Requested model; the engine may substitute a cheaper one.
    pub model: String,
    /// Stages whose outputs are injected as context.
    pub upstream: Vec<Stage>,
}

impl StageTask {
    /// Chat messages for this task, given the upstream outputs it declared.
    ///
    /// Outputs for stages not in `upstream` are ignored.
    pub fn messages(&self, outputs: &BTreeMap<Stage, String>) -> Vec<ChatMessage> {
        let mut prompt = self.instructions.clone();
        for stage in &self.upstream {
            if let Some(output) = outputs.get(stage) {
                prompt.push_str(&format!(
                    "\n\n## Context from {}\n\n{}",
                    stage.role(),
                    output
                ));
            }
        }
        prompt.push_str(&format!("\n\nExpected output: {}", self.expected_output));

        vec![
            ChatMessage::system(format!(
                "You are the {} of a technology research team. Be specific, cite sources \
                 when you have them and answer in Markdown.",
                self.role
            )),
            ChatMessage::user(prompt),
        ]
    }
}

/// Build the task for `stage` on `niche`, consuming `upstream` outputs.
pub fn create_stage_task(stage: Stage, niche: &str, upstream: &[Stage], model: &str) -> StageTask {
    StageTask {
        stage,
        role: stage.role().to_string(),
        instructions: format!("Niche: {}\n\n{}", niche, stage.goal()),
        expected_output: stage.expected_output().to_string(),
        model: model.to_string(),
        upstream: upstream.to_vec(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Failed,
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_name: String,
    pub status: AgentStatus,
    pub output: Option<String>,
    pub duration_seconds: f64,
    pub credits_used: f64,
    pub retries: u32,
    pub error: Option<String>,
}

impl AgentResult {
    pub fn success(agent_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Success,
            output: Some(output.into()),
            duration_seconds: 0.0,
            credits_used: 0.0,
            retries: 0,
            error: None,
        }
    }

    pub fn failure(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Failed,
            output: None,
            duration_seconds: 0.0,
            credits_used: 0.0,
            retries: 0,
            error: Some(error.into()),
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn with_credits(mut self, credits: f64) -> Self {
        self.credits_used = credits;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }

    /// Record-shaped view: output size instead of the output itself.
    pub fn to_record(&self) -> serde_json::Value {
        serde_json::json!({
            "agent_name": self.agent_name,
            "status": self.status,
            "output_size": self.output.as_ref().map(|o| o.len()).unwrap_or(0),
            "duration_seconds": self.duration_seconds,
            "credits_used": self.credits_used,
            "retries": self.retries,
            "error": self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_only_names_earlier_stages() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            for up in stage.upstream() {
                let pos = Stage::ALL.iter().position(|s| s == up).unwrap();
                assert!(pos < i, "{stage} depends on later stage {up}");
            }
        }
        assert_eq!(Stage::ContentSynthesizer.upstream().len(), 4);
    }

    #[test]
    fn default_models_are_registry_models() {
        let registry = crate::budget::ModelRegistry::default();
        for (stage, model) in StageModels::default().iter() {
            assert!(registry.contains(model), "{stage} -> {model}");
        }
    }

    #[test]
    fn messages_inject_declared_upstream_only() {
        let task = create_stage_task(
            Stage::ImplementationSpecialist,
            "Rust WASM for real-time audio",
            Stage::ImplementationSpecialist.upstream(),
            "deepseek-v3",
        );
        let mut outputs = BTreeMap::new();
        outputs.insert(Stage::NicheAnalyst, "niche notes".to_string());
        outputs.insert(Stage::TechnicalArchitect, "arch notes".to_string());

        let messages = task.messages(&outputs);
        assert_eq!(messages.len(), 2);
        let prompt = &messages[1].content;
        assert!(prompt.contains("Rust WASM for real-time audio"));
        assert!(prompt.contains("arch notes"));
        assert!(!prompt.contains("niche notes"));
    }

    #[test]
    fn agent_result_record_reports_size() {
        let record = AgentResult::success("niche_analyst", "abcd")
            .with_credits(0.5)
            .to_record();
        assert_eq!(record["output_size"], 4);
        assert_eq!(record["status"], "success");
        assert_eq!(record["credits_used"], 0.5);
    }
}
