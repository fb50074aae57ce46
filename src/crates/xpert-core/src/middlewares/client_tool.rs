//! Client-side tool middleware
//!
//! Tools listed here execute in the calling UI, not on the server. The
//! wrapper never calls `next`: it raises a client-tool interrupt carrying
//! the call, and on resume injects the client's ToolMessage as the tool's
//! return value. The returned `tool_call_id` must match the original call
//! exactly; a mismatch or a missing id fails the run.

use crate::error::{GraphError, Result};
use crate::interrupt::{ClientToolResponse, Interrupt, InterruptKind};
use crate::messages::ToolMessageStatus;
use crate::middleware::{Middleware, MiddlewareHooks, ToolCallRequest, ToolNext};
use crate::toolset::ToolOutput;
use async_trait::async_trait;
use std::collections::HashSet;

/// Routes selected tools to the client
pub struct ClientToolMiddleware {
    client_tools: HashSet<String>,
}

impl ClientToolMiddleware {
    pub fn new(client_tools: impl IntoIterator<Item = String>) -> Self {
        Self {
            client_tools: client_tools.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Middleware for ClientToolMiddleware {
    fn name(&self) -> &str {
        "client_tool"
    }

    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks::default()
    }

    async fn wrap_tool_call(&self, request: ToolCallRequest, next: ToolNext) -> Result<ToolOutput> {
        if !self.client_tools.contains(&request.tool_call.name) {
            return next(request).await;
        }

        match &request.resume {
            Some(resume) => {
                let response: ClientToolResponse = serde_json::from_value(resume.clone())
                    .map_err(|e| {
                        GraphError::Input(format!("invalid client tool response: {e}"))
                    })?;
                if response.tool_messages.len() != 1 {
                    return Err(GraphError::Input(format!(
                        "client tool response must carry exactly one tool message, got {}",
                        response.tool_messages.len()
                    )));
                }
                let mut message = response.tool_messages.into_iter().next().expect("len checked");
                match message.tool_call_id.as_deref() {
                    Some(id) if id == request.tool_call.id => {}
                    Some(id) => {
                        return Err(GraphError::Input(format!(
                            "client tool response answers call '{id}' but '{}' is pending",
                            request.tool_call.id
                        )));
                    }
                    None => {
                        return Err(GraphError::Input(
                            "client tool response is missing tool_call_id".to_string(),
                        ));
                    }
                }
                message.ensure_id();
                if message.status.is_none() {
                    message.status = Some(ToolMessageStatus::Success);
                }
                if message.name.is_none() {
                    message.name = Some(request.tool_call.name.clone());
                }
                Ok(ToolOutput::Message(message))
            }
            None => Err(GraphError::Interrupt(Interrupt::new(
                InterruptKind::ClientTool,
                serde_json::json!({"clientToolCalls": [request.tool_call]}),
                vec![request.tool_call],
            ))),
        }
    }
}
