use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::agents::Stage;

/// Output of a single task inside a structured result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub stage: Stage,
    pub model: String,
    pub output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredOutput {
    pub raw: Option<String>,
    pub final_output: Option<String>,
    #[serde(default)]
    pub tasks_output: Vec<TaskOutput>,
}

/// The shapes an engine may hand back.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    Structured(StructuredOutput),
    Text(String),
    Bytes(Bytes),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl From<String> for EngineOutput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for EngineOutput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Bytes> for EngineOutput {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<StructuredOutput> for EngineOutput {
    fn from(s: StructuredOutput) -> Self {
        Self::Structured(s)
    }
}

impl fmt::Display for EngineOutput {
    /// Whole-value string form, used when no canonical field is present.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured(s) => {
                let mut first = true;
                for task in &s.tasks_output {
                    if !first {
                        f.write_str("\n\n")?;
                    }
                    first = false;
                    f.write_str(&task.output)?;
                }
                Ok(())
            }
            Self::Text(s) => f.write_str(s),
            Self::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Self::Map(m) => write!(f, "{}", serde_json::Value::Object(m.clone())),
        }
    }
}
