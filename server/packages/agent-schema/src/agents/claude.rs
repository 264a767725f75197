use serde_json::Value;

use crate::AgentMessage;

/// Convert one Claude Code `stream-json` record to typed messages.
///
/// `assistant` records fan out into one message per content block, `user`
/// records carry tool results, and `result` records end the run. Anything
/// else (`system` init, stream deltas) has no typed counterpart.
pub fn line_to_messages(value: &Value) -> Vec<AgentMessage> {
    let record_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match record_type {
        "assistant" => assistant_to_messages(value),
        "user" => user_to_messages(value),
        "result" => vec![result_to_message(value)],
        _ => Vec::new(),
    }
}

fn content_blocks(value: &Value) -> &[Value] {
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn assistant_to_messages(value: &Value) -> Vec<AgentMessage> {
    content_blocks(value)
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                if text.is_empty() {
                    None
                } else {
                    Some(AgentMessage::AssistantText {
                        text: text.to_string(),
                    })
                }
            }
            Some("tool_use") => Some(AgentMessage::ToolInvocation {
                id: string_field(block, "id"),
                name: string_field(block, "name"),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        })
        .collect()
}

fn user_to_messages(value: &Value) -> Vec<AgentMessage> {
    content_blocks(value)
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| AgentMessage::ToolResult {
            tool_use_id: string_field(block, "tool_use_id"),
            output: tool_result_text(block.get("content")),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
        .collect()
}

fn result_to_message(value: &Value) -> AgentMessage {
    let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let result = value
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string);
    if subtype == "success" && !is_error {
        AgentMessage::RunComplete {
            result,
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        }
    } else {
        // Keep the runtime's own wording; fall back to the subtype.
        let message = result.unwrap_or_else(|| {
            if subtype.is_empty() {
                "agent run failed".to_string()
            } else {
                subtype.to_string()
            }
        });
        AgentMessage::RunError { message }
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}
