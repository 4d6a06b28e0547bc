use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::prompt::Tool;

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub name: String,
    pub input: String,
}

/// Validates the raw tool-message bytes accumulated after the `|` delimiter.
///
/// The buffer is truncated at the last `]` (the model may trail punctuation
/// after the array), parsed as a JSON array of `{name, input}` objects, and
/// filtered to elements with non-empty trimmed fields whose name is a
/// configured tool. Returns the marshalled valid subset, or `None` when
/// nothing valid remains.
pub fn validate_tool_message(raw: &str, available: &[Tool]) -> Option<String> {
    let truncated = match raw.rfind(']') {
        Some(last) => &raw[..=last],
        None => raw,
    };

    let parsed: Vec<ToolMessage> = match serde_json::from_str(truncated) {
        Ok(messages) => messages,
        Err(e) => {
            debug!(%e, "Invalid tool message JSON");
            return None;
        }
    };

    let known: HashSet<&str> = available.iter().map(|t| t.name.as_str()).collect();

    let valid: Vec<ToolMessage> = parsed
        .into_iter()
        .filter_map(|message| {
            let name = message.name.trim();
            let input = message.input.trim();
            if name.is_empty() || input.is_empty() {
                debug!("Tool message with empty name or input dropped");
                return None;
            }
            if !known.contains(name) {
                debug!(name, "Tool message names an unavailable tool");
                return None;
            }
            Some(ToolMessage {
                name: name.to_string(),
                input: input.to_string(),
            })
        })
        .collect();

    if valid.is_empty() {
        return None;
    }
    serde_json::to_string(&valid).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(names: &[&str]) -> Vec<Tool> {
        names
            .iter()
            .map(|name| Tool {
                name: (*name).to_string(),
                description: String::new(),
                input_guide: String::new(),
                output_guide: String::new(),
            })
            .collect()
    }

    #[test]
    fn valid_message_round_trips() {
        let raw = r#"[{ "name": "Weather", "input": "now" }]"#;
        let validated = validate_tool_message(raw, &tools(&["Weather"])).unwrap();
        let parsed: Vec<ToolMessage> = serde_json::from_str(&validated).unwrap();
        assert_eq!(
            parsed,
            vec![ToolMessage {
                name: "Weather".into(),
                input: "now".into()
            }]
        );
    }

    #[test]
    fn trailing_text_after_last_bracket_is_truncated() {
        let raw = r#"[{ "name": "Weather", "input": "now" }]."#;
        assert!(validate_tool_message(raw, &tools(&["Weather"])).is_some());
    }

    #[test]
    fn unknown_tools_are_filtered_out() {
        let raw = r#"[{"name":"Weather","input":"now"},{"name":"Missiles","input":"launch"}]"#;
        let validated = validate_tool_message(raw, &tools(&["Weather"])).unwrap();
        let parsed: Vec<ToolMessage> = serde_json::from_str(&validated).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "Weather");
    }

    #[test]
    fn empty_fields_invalidate_the_element() {
        let raw = r#"[{"name":"  ","input":"now"},{"name":"Weather","input":""}]"#;
        assert!(validate_tool_message(raw, &tools(&["Weather"])).is_none());
    }

    #[test]
    fn malformed_json_yields_nothing() {
        assert!(validate_tool_message("[{not json", &tools(&["Weather"])).is_none());
        assert!(validate_tool_message("", &tools(&["Weather"])).is_none());
    }
}
