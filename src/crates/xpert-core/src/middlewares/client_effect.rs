//! Client-effect middleware
//!
//! Fire-and-forget counterpart to client tools: the call is streamed to
//! the client as an `on_client_effect` event, no interrupt is raised, and
//! the model immediately receives a statically configured result.

use crate::error::Result;
use crate::event::AgentEvent;
use crate::middleware::{Middleware, ToolCallRequest, ToolNext};
use crate::toolset::ToolOutput;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Streams selected tool calls to the client as effects
pub struct ClientEffectMiddleware {
    /// Tool name → static result returned to the model
    effects: HashMap<String, Value>,
}

impl ClientEffectMiddleware {
    pub fn new(effects: HashMap<String, Value>) -> Self {
        Self { effects }
    }
}

#[async_trait]
impl Middleware for ClientEffectMiddleware {
    fn name(&self) -> &str {
        "client_effect"
    }

    async fn wrap_tool_call(&self, request: ToolCallRequest, next: ToolNext) -> Result<ToolOutput> {
        let Some(result) = self.effects.get(&request.tool_call.name) else {
            return next(request).await;
        };
        request.runtime.events.emit(AgentEvent::ClientEffect {
            payload: serde_json::json!({
                "tool": request.tool_call.name,
                "args": request.tool_call.args,
                "call_id": request.tool_call.id,
            }),
        });
        Ok(ToolOutput::Content(result.clone()))
    }
}
