//! Typed messages produced by an agent run.
//!
//! The agent runtime writes one JSON object per line. Two dialects are
//! accepted: the native tagged form (`{"type":"toolInvocation",...}`) and the
//! Claude Code `stream-json` output, which is converted in [`agents::claude`].

use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub mod agents;

/// One event of an agent run, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    ToolInvocation {
        id: String,
        name: String,
        #[schema(value_type = Object)]
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_use_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    AssistantText { text: String },
    #[serde(rename_all = "camelCase")]
    RunComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    RunError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum AgentMessageKind {
    ToolInvocation,
    ToolResult,
    AssistantText,
    RunComplete,
    RunError,
}

impl AgentMessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMessageKind::ToolInvocation => "toolInvocation",
            AgentMessageKind::ToolResult => "toolResult",
            AgentMessageKind::AssistantText => "assistantText",
            AgentMessageKind::RunComplete => "runComplete",
            AgentMessageKind::RunError => "runError",
        }
    }
}

/// How a tool invocation affects a file in the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTouch {
    Added,
    Changed,
    Removed,
}

impl AgentMessage {
    pub fn kind(&self) -> AgentMessageKind {
        match self {
            AgentMessage::ToolInvocation { .. } => AgentMessageKind::ToolInvocation,
            AgentMessage::ToolResult { .. } => AgentMessageKind::ToolResult,
            AgentMessage::AssistantText { .. } => AgentMessageKind::AssistantText,
            AgentMessage::RunComplete { .. } => AgentMessageKind::RunComplete,
            AgentMessage::RunError { .. } => AgentMessageKind::RunError,
        }
    }

    /// `RunComplete` and `RunError` end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentMessage::RunComplete { .. } | AgentMessage::RunError { .. }
        )
    }

    /// File path and touch kind for tool invocations that edit the tree.
    pub fn touched_file(&self) -> Option<(String, FileTouch)> {
        let AgentMessage::ToolInvocation { name, input, .. } = self else {
            return None;
        };
        let touch = match name.as_str() {
            "Write" | "Create" | "CreateFile" => FileTouch::Added,
            "Edit" | "MultiEdit" | "NotebookEdit" | "StrReplace" => FileTouch::Changed,
            "Delete" | "DeleteFile" | "Remove" => FileTouch::Removed,
            _ => return None,
        };
        let path = ["file_path", "filePath", "notebook_path", "path"]
            .iter()
            .find_map(|key| input.get(*key).and_then(Value::as_str))?;
        Some((path.to_string(), touch))
    }
}

/// A frame read from the runtime stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeFrame {
    Message(AgentMessage),
    /// Remote liveness signal; carries no content.
    Heartbeat,
}

/// Decodes one line of runtime output.
///
/// Blank lines and dialect lines with no typed counterpart (`system` init
/// records, for example) yield an empty vector. A line that is not JSON at all
/// is a validation error so the caller can log and skip it.
pub fn parse_frame_line(line: &str) -> Result<Vec<RuntimeFrame>, SandboxError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| SandboxError::validation("agentMessage", err.to_string()))?;
    let frame_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match frame_type {
        "heartbeat" => Ok(vec![RuntimeFrame::Heartbeat]),
        "toolInvocation" | "toolResult" | "assistantText" | "runComplete" | "runError" => {
            let message: AgentMessage = serde_json::from_value(value)
                .map_err(|err| SandboxError::validation("agentMessage", err.to_string()))?;
            Ok(vec![RuntimeFrame::Message(message)])
        }
        _ => Ok(agents::claude::line_to_messages(&value)
            .into_iter()
            .map(RuntimeFrame::Message)
            .collect()),
    }
}
