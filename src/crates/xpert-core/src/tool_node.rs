//! Tool node execution
//!
//! Executes one tool call emitted by an assistant message: runs the
//! invocation through the `wrap_tool_call` chain, normalizes whatever
//! comes back into a ToolMessage plus channel writes, applies variable
//! assigners, and converts failures into error ToolMessages the model can
//! recover from, unless the tool opted out of error handling or the
//! failure is an interrupt, which always escalates.

use crate::compile::CompiledTool;
use crate::error::{GraphError, Result};
use crate::event::AgentEvent;
use crate::messages::{Message, ToolCall, ToolMessageStatus};
use crate::middleware::{wrap_tool_chain, Middleware, ToolCallRequest, ToolHandler};
use crate::state::agent_channel_name;
use crate::toolset::{ToolOutput, ToolRuntime};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Result of one tool-node turn
#[derive(Debug, Clone)]
pub struct ToolNodeOutput {
    /// ToolMessages to append to the conversation
    pub messages: Vec<Message>,

    /// Additional channel writes (assigners and command updates)
    pub updates: Vec<(String, Value)>,
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Execute one tool call through the wrap chain and normalize the result
pub async fn execute_tool_call(
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    compiled: &CompiledTool,
    call: ToolCall,
    runtime: ToolRuntime,
    resume: Option<Value>,
) -> Result<ToolNodeOutput> {
    let events = runtime.events.clone();
    let agent_key = runtime.agent_key.clone();
    events.emit(AgentEvent::ToolStart { call: call.clone() });

    let timeout_ms = compiled.timeout_ms;
    let core: ToolHandler = Arc::new(move |req: ToolCallRequest| {
        Box::pin(async move {
            let signal = req.runtime.signal.clone();
            let name = req.tool_call.name.clone();
            let invocation = req.tool.invoke(req.tool_call.args.clone(), req.runtime);
            let guarded = async {
                tokio::select! {
                    result = invocation => result,
                    _ = signal.cancelled() => Err(GraphError::Aborted),
                }
            };
            match timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), guarded)
                    .await
                    .map_err(|_| GraphError::Timeout {
                        operation: format!("tool:{name}"),
                        duration_ms: ms,
                        language: None,
                    })?,
                None => guarded.await,
            }
        })
    });

    let request = ToolCallRequest {
        tool_call: call.clone(),
        tool: compiled.tool.clone(),
        runtime,
        resume,
    };

    let result = wrap_tool_chain(middlewares, request, core).await;
    let output = match result {
        Ok(output) => output,
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => {
            if !compiled.handle_errors {
                return Err(GraphError::tool(call.name.clone(), err.to_string()));
            }
            events.emit(AgentEvent::ToolError {
                call_id: call.id.clone(),
                name: call.name.clone(),
                error: err.to_string(),
            });
            // Recoverable: the model sees the failure and may retry.
            let message = Message::tool(format!("Error: {err}"), call.id.clone())
                .with_name(call.name.clone())
                .with_status(ToolMessageStatus::Error);
            return Ok(ToolNodeOutput {
                messages: vec![message],
                updates: Vec::new(),
            });
        }
    };

    let mut updates: Vec<(String, Value)> = Vec::new();
    let (message, artifact) = match output {
        ToolOutput::Message(mut message) => {
            if message.tool_call_id.is_none() {
                message.tool_call_id = Some(call.id.clone());
            }
            if message.name.is_none() {
                message.name = Some(call.name.clone());
            }
            message.ensure_id();
            let artifact = message
                .metadata
                .as_ref()
                .and_then(|m| m.get("artifact"))
                .cloned();
            (message, artifact)
        }
        ToolOutput::Command(command) => {
            if let Some(update) = &command.update {
                for (channel, value) in update {
                    if channel == crate::state::MESSAGES_CHANNEL {
                        // Message updates land in the caller's agent channel.
                        updates.push((
                            agent_channel_name(&agent_key),
                            serde_json::json!({"messages": value}),
                        ));
                        updates.push((channel.clone(), value.clone()));
                    } else {
                        updates.push((channel.clone(), value.clone()));
                    }
                }
            }
            let content = command
                .update
                .as_ref()
                .map(|u| serde_json::to_string(u).unwrap_or_default())
                .unwrap_or_default();
            let message = Message::tool(content, call.id.clone()).with_name(call.name.clone());
            (message, None)
        }
        ToolOutput::Content(value) => {
            let message =
                Message::tool(stringify(&value), call.id.clone()).with_name(call.name.clone());
            (message, Some(value))
        }
    };

    for assigner in &compiled.variables {
        let value = match &assigner.source {
            crate::graph::AssignSource::Content => Value::String(message.text()),
            crate::graph::AssignSource::Artifact => artifact.clone().unwrap_or(Value::Null),
            crate::graph::AssignSource::Constant { value } => value.clone(),
        };
        updates.push((assigner.channel.clone(), value));
    }

    events.emit(AgentEvent::ToolEnd {
        call_id: call.id.clone(),
        name: call.name.clone(),
        output: Value::String(message.text()),
    });

    Ok(ToolNodeOutput {
        messages: vec![message],
        updates,
    })
}
