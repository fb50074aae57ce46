//! Chat message types and the message-list reducer
//!
//! [`Message`] is the unit of conversation state. Assistant messages carry
//! [`ToolCall`]s; tool messages answer them through `tool_call_id`, which
//! must survive end-to-end so results can be correlated with the call that
//! produced them.
//!
//! [`add_messages`] is the reducer behind every `messages`-style channel:
//! it preserves insertion order, de-duplicates by id (an update with an
//! existing id replaces the original in place), and honors
//! [`RemoveMessage`] markers including the remove-all sentinel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of the message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions and context for the model
    System,
    /// End-user input
    Human,
    /// Model output; may carry tool calls
    Assistant,
    /// Result of a tool invocation
    Tool,
}

/// One part of a multimodal message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

/// Message content: plain text or multimodal parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl MessageContent {
    /// Flatten to a display string; multimodal parts keep text parts only
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A request from the model to invoke a tool
///
/// The `id` is assigned by the model and must be preserved unchanged until
/// the matching tool message is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// Outcome status on a tool message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMessageStatus {
    Success,
    Error,
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub role: MessageRole,

    pub content: MessageContent,

    /// Tool name, set on tool messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls emitted by an assistant message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Id of the call a tool message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Outcome status on tool messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolMessageStatus>,

    /// Provider metadata (model, usage, finish reason)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            status: None,
            metadata: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn human(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Human, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Alias for [`Message::assistant`]
    pub fn ai(content: impl Into<MessageContent>) -> Self {
        Self::assistant(content)
    }

    pub fn tool(content: impl Into<MessageContent>, tool_call_id: impl Into<String>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            role: MessageRole::Tool,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            status: Some(ToolMessageStatus::Success),
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn with_status(mut self, status: ToolMessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Text content, flattened
    pub fn text(&self) -> String {
        self.content.to_text()
    }

    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }

    /// Tool calls on this message, empty when absent
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn ensure_id(&mut self) {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
    }
}

/// Marker deleting a message by id from a message channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveMessage {
    pub remove: String,
}

impl RemoveMessage {
    /// Sentinel id that clears the whole channel
    pub const REMOVE_ALL: &'static str = "__remove_all__";

    pub fn new(id: impl Into<String>) -> Self {
        Self { remove: id.into() }
    }

    pub fn remove_all() -> Self {
        Self {
            remove: Self::REMOVE_ALL.to_string(),
        }
    }
}

/// An entry in a message-channel update: a message or a removal marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageUpdate {
    Remove(RemoveMessage),
    Message(Message),
}

impl From<Message> for MessageUpdate {
    fn from(m: Message) -> Self {
        Self::Message(m)
    }
}

impl From<RemoveMessage> for MessageUpdate {
    fn from(r: RemoveMessage) -> Self {
        Self::Remove(r)
    }
}

/// Reducer for message channels
///
/// Order is preserved; an update whose id matches an existing message
/// replaces it in place; removal markers delete their target. Messages
/// without ids get one assigned so later replacement is possible.
pub fn add_messages(mut existing: Vec<Message>, updates: Vec<MessageUpdate>) -> Vec<Message> {
    for update in updates {
        match update {
            MessageUpdate::Remove(marker) => {
                if marker.remove == RemoveMessage::REMOVE_ALL {
                    existing.clear();
                } else {
                    existing.retain(|m| m.id.as_deref() != Some(marker.remove.as_str()));
                }
            }
            MessageUpdate::Message(mut message) => {
                message.ensure_id();
                let id = message.id.clone();
                match existing
                    .iter_mut()
                    .find(|m| m.id.is_some() && m.id == id)
                {
                    Some(slot) => *slot = message,
                    None => existing.push(message),
                }
            }
        }
    }
    existing
}
