//! Control directives: `Send` fan-out and the resume `Command`

use crate::messages::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Router directive targeting a named node with an overridden payload
///
/// Conditional routers return one `Send` per branch to fan a step out;
/// the canonical use is one `Send` per tool call so every tool node sees
/// only its own call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Send {
    /// Target node name
    pub node: String,

    /// Payload delivered to the target instead of the shared state
    pub input: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, input: Value) -> Self {
        Self {
            node: node.into(),
            input,
        }
    }
}

/// Resume/navigation envelope carried by a run-create request
///
/// `resume` is the opaque payload handed back to whichever hook raised the
/// interrupt (HITL decisions, a client tool response, or free-form data).
/// `update` applies channel updates before execution continues and
/// `tool_calls` rewrites the last assistant message's calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<HashMap<String, Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resume(mut self, resume: Value) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn with_update(mut self, update: HashMap<String, Value>) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_goto(mut self, node: impl Into<String>) -> Self {
        self.goto = Some(node.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    /// True when the command carries nothing
    pub fn is_empty(&self) -> bool {
        self.resume.is_none()
            && self.update.is_none()
            && self.goto.is_none()
            && self.tool_calls.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_uses_camel_case_wire_format() {
        let cmd: Command = serde_json::from_value(serde_json::json!({
            "resume": {"decisions": []},
            "toolCalls": [{"id": "t1", "name": "add", "args": {"a": 1}}]
        }))
        .unwrap();
        assert!(cmd.resume.is_some());
        assert_eq!(cmd.tool_calls.unwrap()[0].name, "add");
    }

    #[test]
    fn empty_command_detection() {
        assert!(Command::new().is_empty());
        assert!(!Command::new().with_goto("node").is_empty());
    }
}
