//! The chat model seam
//!
//! The runtime never talks to a provider SDK directly: agents call a
//! [`ChatModel`] resolved from the [`ModelRegistry`] by name. Models
//! receive the fully prepared [`ModelRequest`] (system prompt, history,
//! tool descriptors, structured-output choice), stream token deltas
//! through the run's event bus and must honor the cancellation signal.
//!
//! [`ScriptedModel`] is the deterministic implementation used by the test
//! suites and the builtin `mock` plugin: it replays a fixed sequence of
//! responses and records every request it sees.

use crate::cancel::CancelToken;
use crate::error::{GraphError, Result};
use crate::event::{AgentEvent, EventBus};
use crate::messages::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A named function tool exposed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Entry in a model request's tool list
///
/// Besides named function tools, providers accept opaque dicts (builtin
/// search, code interpreters). Those pass through filtering untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestTool {
    Function(ToolDescriptor),
    Provider(Value),
}

impl RequestTool {
    /// Name for function tools; provider dicts are unnamed
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Function(descriptor) => Some(&descriptor.name),
            Self::Provider(_) => None,
        }
    }
}

/// A fully prepared model invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Registry name of the model to call
    pub model: String,

    /// Agent whose turn this is
    pub agent_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    pub messages: Vec<Message>,

    #[serde(default)]
    pub tools: Vec<RequestTool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    /// Snapshot of the agent channel for middleware inspection
    #[serde(default)]
    pub state: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Token accounting reported by a model call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Result of one model call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub message: Message,

    #[serde(default)]
    pub usage: TokenUsage,
}

/// Side context for a model call
#[derive(Clone)]
pub struct ModelEnv {
    pub events: EventBus,
    pub signal: CancelToken,
}

impl ModelEnv {
    pub fn detached() -> Self {
        Self {
            events: EventBus::sink(),
            signal: CancelToken::never(),
        }
    }
}

/// Provider-agnostic chat model interface
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Run one completion; stream deltas through `env.events` and honor
    /// `env.signal`
    async fn generate(&self, request: ModelRequest, env: &ModelEnv) -> Result<ModelResponse>;
}

impl std::fmt::Debug for dyn ChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatModel").field("name", &self.name()).finish()
    }
}

/// Model registry keyed by string names; chosen at startup
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn ChatModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: Arc<dyn ChatModel>) {
        self.models.insert(model.name().to_string(), model);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ChatModel>> {
        self.models.get(name).cloned().ok_or_else(|| {
            GraphError::Configuration(format!("model '{name}' is not registered"))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }
}

/// One scripted turn of a [`ScriptedModel`]
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Return this assistant message
    Message(Message),
    /// Fail the call with a model error
    Error(String),
}

/// Deterministic model replaying a fixed script
///
/// When the script runs dry it echoes the last human message, so idle
/// turns still terminate. Every request is recorded for assertions.
pub struct ScriptedModel {
    name: String,
    script: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(name: impl Into<String>, steps: Vec<ScriptedStep>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script that answers every turn with the same message
    pub fn repeating(name: impl Into<String>, message: Message) -> Self {
        let model = Self::new(name, Vec::new());
        *model.script.lock() = VecDeque::from(vec![ScriptedStep::Message(message)]);
        model
    }

    /// Requests observed so far
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    fn next_step(&self) -> Option<ScriptedStep> {
        let mut script = self.script.lock();
        if script.len() == 1 {
            // Keep replaying the final step so looping graphs stay scripted.
            script.front().cloned()
        } else {
            script.pop_front()
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: ModelRequest, env: &ModelEnv) -> Result<ModelResponse> {
        if env.signal.is_cancelled() {
            return Err(GraphError::Aborted);
        }
        self.requests.lock().push(request.clone());

        let message = match self.next_step() {
            Some(ScriptedStep::Message(message)) => message,
            Some(ScriptedStep::Error(error)) => {
                return Err(GraphError::Model {
                    agent: request.agent_key,
                    error,
                });
            }
            None => {
                let echo = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == crate::messages::MessageRole::Human)
                    .map(|m| m.text())
                    .unwrap_or_default();
                Message::assistant(echo)
            }
        };

        let text = message.text();
        if !text.is_empty() {
            for token in text.split_inclusive(' ') {
                env.events.emit(AgentEvent::ChatMessageChunk {
                    agent_key: request.agent_key.clone(),
                    delta: token.to_string(),
                    message_id: message.id.clone(),
                });
            }
        }

        Ok(ModelResponse {
            message,
            usage: TokenUsage {
                input_tokens: request.messages.len() as u64 * 8,
                output_tokens: text.split_whitespace().count() as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ToolCall;

    fn request(messages: Vec<Message>) -> ModelRequest {
        ModelRequest {
            model: "scripted".into(),
            agent_key: "planner".into(),
            system: None,
            messages,
            tools: vec![],
            tool_choice: None,
            state: Value::Null,
            language: None,
        }
    }

    #[tokio::test]
    async fn scripted_model_replays_steps_in_order() {
        let model = ScriptedModel::new(
            "scripted",
            vec![
                ScriptedStep::Message(
                    Message::assistant("").with_tool_calls(vec![ToolCall::new(
                        "t1",
                        "add",
                        serde_json::json!({"a": 2, "b": 3}),
                    )]),
                ),
                ScriptedStep::Message(Message::assistant("5")),
            ],
        );
        let env = ModelEnv::detached();

        let first = model.generate(request(vec![]), &env).await.unwrap();
        assert_eq!(first.message.tool_calls().len(), 1);

        let second = model.generate(request(vec![]), &env).await.unwrap();
        assert_eq!(second.message.text(), "5");

        // Final step keeps replaying.
        let third = model.generate(request(vec![]), &env).await.unwrap();
        assert_eq!(third.message.text(), "5");
        assert_eq!(model.requests().len(), 3);
    }

    #[tokio::test]
    async fn scripted_model_emits_chunks() {
        let model = ScriptedModel::new(
            "scripted",
            vec![ScriptedStep::Message(Message::assistant("hello world"))],
        );
        let (bus, mut rx) = EventBus::channel(Default::default());
        let env = ModelEnv {
            events: bus,
            signal: CancelToken::never(),
        };
        model.generate(request(vec![]), &env).await.unwrap();

        let mut deltas = String::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::ChatMessageChunk { delta, .. } = event {
                deltas.push_str(&delta);
            }
        }
        assert_eq!(deltas, "hello world");
    }

    #[tokio::test]
    async fn cancelled_signal_aborts_generation() {
        let model = ScriptedModel::new("scripted", vec![]);
        let (handle, token) = crate::cancel::cancel_pair();
        handle.cancel();
        let env = ModelEnv {
            events: EventBus::sink(),
            signal: token,
        };
        let err = model.generate(request(vec![]), &env).await.unwrap_err();
        assert!(matches!(err, GraphError::Aborted));
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = ModelRegistry::new();
        registry.register(Arc::new(ScriptedModel::new("m1", vec![])));
        assert!(registry.get("m1").is_ok());
        assert!(matches!(
            registry.get("missing").unwrap_err(),
            GraphError::Configuration(_)
        ));
    }
}
