//! Reduce an engine result to one report string.

use crate::engine::EngineOutput;

const CANONICAL_KEYS: [&str; 3] = ["raw", "final_output", "output"];

/// Extract the report text from `output`.
///
/// Canonical fields win in the order `raw`, `final_output`, `output`;
/// bytes are UTF-8 with a Latin-1 fallback; anything else is stringified.
/// Returns `None` when nothing but whitespace is left.
pub fn normalize_output(output: &EngineOutput) -> Option<String> {
    let text = match output {
        EngineOutput::Structured(s) => s
            .raw
            .as_deref()
            .filter(|v| !v.is_empty())
            .or_else(|| s.final_output.as_deref().filter(|v| !v.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| output.to_string()),
        EngineOutput::Text(s) => s.clone(),
        EngineOutput::Bytes(b) => decode_bytes(b),
        EngineOutput::Map(map) => CANONICAL_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(value_text))
            .unwrap_or_else(|| output.to_string()),
    };

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn decode_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        // Latin-1 maps every byte to the code point of the same value.
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::agents::Stage;
    use crate::engine::{StructuredOutput, TaskOutput};

    fn map(value: serde_json::Value) -> EngineOutput {
        match value {
            serde_json::Value::Object(m) => EngineOutput::Map(m),
            _ => unreachable!(),
        }
    }

    #[test]
    fn plain_text_is_unchanged() {
        let text = "# Report\n\nBody  \n";
        let once = normalize_output(&EngineOutput::from(text)).unwrap();
        assert_eq!(once, text);
        let twice = normalize_output(&EngineOutput::Text(once.clone())).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn mapping_key_priority() {
        assert_eq!(normalize_output(&map(json!({ "raw": "X" }))).unwrap(), "X");
        assert_eq!(
            normalize_output(&map(json!({ "final_output": "Y" }))).unwrap(),
            "Y"
        );
        assert_eq!(
            normalize_output(&map(json!({ "output": "Z", "final_output": "Y" }))).unwrap(),
            "Y"
        );
        assert_eq!(
            normalize_output(&map(json!({ "raw": "", "output": "Z" }))).unwrap(),
            "Z"
        );
    }

    #[test]
    fn mapping_without_canonical_key_is_stringified() {
        let text = normalize_output(&map(json!({ "report": "R" }))).unwrap();
        assert_eq!(text, r#"{"report":"R"}"#);
    }

    #[test]
    fn structured_prefers_raw_then_final_output() {
        let structured = StructuredOutput {
            raw: Some("raw text".into()),
            final_output: Some("final".into()),
            tasks_output: vec![],
        };
        assert_eq!(normalize_output(&structured.into()).unwrap(), "raw text");

        let structured = StructuredOutput {
            raw: None,
            final_output: Some("final".into()),
            tasks_output: vec![],
        };
        assert_eq!(normalize_output(&structured.into()).unwrap(), "final");
    }

    #[test]
    fn structured_without_fields_joins_task_outputs() {
        let structured = StructuredOutput {
            raw: None,
            final_output: None,
            tasks_output: vec![
                TaskOutput {
                    stage: Stage::NicheAnalyst,
                    model: "gpt-4o".into(),
                    output: "a".into(),
                },
                TaskOutput {
                    stage: Stage::LiteratureResearcher,
                    model: "gpt-4o".into(),
                    output: "b".into(),
                },
            ],
        };
        assert_eq!(normalize_output(&structured.into()).unwrap(), "a\n\nb");
    }

    #[test]
    fn bytes_decode_with_latin1_fallback() {
        let utf8 = Bytes::from("héllo".as_bytes().to_vec());
        assert_eq!(normalize_output(&utf8.into()).unwrap(), "héllo");

        let latin1 = Bytes::from(vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(normalize_output(&latin1.into()).unwrap(), "café");
    }

    #[test]
    fn empty_output_is_none() {
        assert!(normalize_output(&EngineOutput::from("")).is_none());
        assert!(normalize_output(&EngineOutput::from("  \n")).is_none());
        assert!(normalize_output(&StructuredOutput::default().into()).is_none());
        assert!(normalize_output(&EngineOutput::Bytes(Bytes::new())).is_none());
    }
}
