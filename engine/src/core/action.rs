//! Actor actions: the closed set of operations the engine will execute.
//!
//! The actor names a tool by string; dispatch happens over a closed enum
//! with an explicit rejection path for unrecognized names. Malformed
//! provider output goes through a best-effort structural salvage before
//! being counted as a failed step.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire form of a proposed action, as returned by the inference provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// An action the engine knows how to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    RunCommand { command: String },
    Verify,
    Complete { summary: String },
}

impl Action {
    /// Stable signature used for repeated-action detection. Identical
    /// action + arguments produce identical signatures.
    pub fn signature(&self) -> String {
        match self {
            Action::ReadFile { path } => format!("read_file:{path}"),
            Action::WriteFile { path, content } => {
                format!("write_file:{path}:{}", content.len())
            }
            Action::RunCommand { command } => format!("run_command:{command}"),
            Action::Verify => "verify".to_string(),
            Action::Complete { .. } => "complete".to_string(),
        }
    }
}

/// Result of interpreting a provider action request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAction {
    Known(Action),
    /// The actor named a tool that does not exist. Rejected, not a crash.
    Unrecognized { name: String },
}

/// Interpret an [`ActionRequest`] against the known action set.
///
/// Unknown names yield [`ParsedAction::Unrecognized`]; known names with
/// missing required arguments are an error (counted as a failed step).
pub fn parse_action(request: &ActionRequest) -> Result<ParsedAction> {
    let args = &request.arguments;
    let action = match request.name.as_str() {
        "read_file" => Action::ReadFile {
            path: required_str(args, "path")?,
        },
        "write_file" => Action::WriteFile {
            path: required_str(args, "path")?,
            content: required_str(args, "content")?,
        },
        "run_command" => Action::RunCommand {
            command: required_str(args, "command")?,
        },
        "verify" => Action::Verify,
        "complete" => Action::Complete {
            summary: optional_str(args, "summary").unwrap_or_default(),
        },
        other => {
            return Ok(ParsedAction::Unrecognized {
                name: other.to_string(),
            });
        }
    };
    Ok(ParsedAction::Known(action))
}

fn required_str(args: &Value, key: &str) -> Result<String> {
    optional_str(args, key).ok_or_else(|| anyhow!("missing required argument '{key}'"))
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Best-effort structural repair of a raw provider reply.
///
/// Strips markdown code fences and extracts the first balanced JSON object.
/// Returns `None` when no parseable object can be recovered.
pub fn salvage_json(raw: &str) -> Option<Value> {
    let mut text = raw.trim();
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            text = after[..end].trim();
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    extract_first_object(text).and_then(|chunk| serde_json::from_str(chunk).ok())
}

/// Find the first balanced `{...}` region, respecting string literals.
fn extract_first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_actions() {
        let request = ActionRequest {
            name: "write_file".to_string(),
            arguments: json!({"path": "a.txt", "content": "hi"}),
        };
        let parsed = parse_action(&request).expect("parse");
        assert_eq!(
            parsed,
            ParsedAction::Known(Action::WriteFile {
                path: "a.txt".to_string(),
                content: "hi".to_string(),
            })
        );
    }

    #[test]
    fn unknown_tool_is_rejected_not_an_error() {
        let request = ActionRequest {
            name: "launch_rockets".to_string(),
            arguments: json!({}),
        };
        let parsed = parse_action(&request).expect("parse");
        assert_eq!(
            parsed,
            ParsedAction::Unrecognized {
                name: "launch_rockets".to_string()
            }
        );
    }

    #[test]
    fn missing_argument_is_an_error() {
        let request = ActionRequest {
            name: "read_file".to_string(),
            arguments: json!({}),
        };
        assert!(parse_action(&request).is_err());
    }

    #[test]
    fn signature_is_stable_for_identical_actions() {
        let a = Action::RunCommand {
            command: "ls".to_string(),
        };
        let b = Action::RunCommand {
            command: "ls".to_string(),
        };
        assert_eq!(a.signature(), b.signature());
        let c = Action::RunCommand {
            command: "ls -la".to_string(),
        };
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn salvage_strips_markdown_fences() {
        let raw = "Here is my action:\n```json\n{\"name\": \"verify\", \"arguments\": {}}\n```\nDone.";
        let value = salvage_json(raw).expect("salvage");
        assert_eq!(value["name"], "verify");
    }

    #[test]
    fn salvage_extracts_embedded_object() {
        let raw = "I will now {\"name\": \"verify\", \"arguments\": {\"note\": \"{not json}\"}} proceed";
        let value = salvage_json(raw).expect("salvage");
        assert_eq!(value["name"], "verify");
    }

    #[test]
    fn salvage_gives_up_on_garbage() {
        assert!(salvage_json("no json here at all").is_none());
        assert!(salvage_json("{truncated").is_none());
    }
}
