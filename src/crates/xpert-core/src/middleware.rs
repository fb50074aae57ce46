//! Middleware pipeline
//!
//! A middleware may declare state channels, contribute tools, transform
//! state at four hook points (`before_agent`, `before_model`,
//! `after_model`, `after_agent`), and wrap the model call and every tool
//! invocation. Hooks return partial channel updates plus an optional
//! [`JumpTo`] directive that overrides the router on the very next
//! transition.
//!
//! Wrappers compose right-to-left: the last registered middleware is
//! outermost, wrapping everything down to the core handler. Composition is
//! driven by [`wrap_model_chain`] and [`wrap_tool_chain`]; each wrapper
//! receives the request and a `next` continuation it may call zero or one
//! times.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::event::EventBus;
use crate::messages::ToolCall;
use crate::model::{ModelRequest, ModelResponse};
use crate::state::{AgentChannelState, ChannelSpec};
use crate::store::Store;
use crate::toolset::{Tool, ToolOutput, ToolRuntime};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Router override emitted by a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpTo {
    /// Re-enter the model call
    Model,
    /// Route straight to the tool fan-out
    Tools,
    /// Skip to the agent's exit chain
    End,
}

/// Result of a state-transformer hook
#[derive(Debug, Clone, Default)]
pub struct HookUpdate {
    /// Channel name → update value
    pub update: HashMap<String, Value>,

    /// Overrides the router on the next transition only
    pub jump_to: Option<JumpTo>,
}

impl HookUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: impl Into<String>, update: Value) -> Self {
        self.update.insert(channel.into(), update);
        self
    }

    pub fn with_jump(mut self, jump: JumpTo) -> Self {
        self.jump_to = Some(jump);
        self
    }
}

/// Read-only context handed to hooks
#[derive(Clone)]
pub struct HookContext {
    pub agent_key: String,
    pub thread_id: String,
    pub run_id: String,

    /// Typed view of the agent's channel
    pub channel: AgentChannelState,

    /// Raw agent channel value
    pub state: Value,

    /// Resume payload, present only when this hook raised the pending
    /// interrupt and the run is resuming
    pub resume: Option<Value>,

    pub store: Option<Arc<dyn Store>>,
    pub events: EventBus,
    pub signal: CancelToken,
    pub language: Option<String>,
}

/// Which hook points a middleware participates in
///
/// The compiler creates one hook node per declared point, so middlewares
/// must advertise them up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiddlewareHooks {
    pub before_agent: bool,
    pub before_model: bool,
    pub after_model: bool,
    pub after_agent: bool,
}

/// A tool invocation travelling through the wrap chain
#[derive(Clone)]
pub struct ToolCallRequest {
    pub tool_call: ToolCall,
    pub tool: Arc<Tool>,
    pub runtime: ToolRuntime,

    /// Resume payload when a client-tool interrupt is being answered
    pub resume: Option<Value>,
}

/// Continuation handed to a model wrapper
pub type ModelNext =
    Box<dyn FnOnce(ModelRequest) -> BoxFuture<'static, Result<ModelResponse>> + Send>;

/// Continuation handed to a tool wrapper
pub type ToolNext =
    Box<dyn FnOnce(ToolCallRequest) -> BoxFuture<'static, Result<ToolOutput>> + Send>;

/// Core model handler type at the bottom of the wrap chain
pub type ModelHandler =
    Arc<dyn Fn(ModelRequest) -> BoxFuture<'static, Result<ModelResponse>> + Send + Sync>;

/// Core tool handler type at the bottom of the wrap chain
pub type ToolHandler =
    Arc<dyn Fn(ToolCallRequest) -> BoxFuture<'static, Result<ToolOutput>> + Send + Sync>;

/// Pluggable hooks wrapping the agent lifecycle
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unique name; duplicates fail compilation
    fn name(&self) -> &str;

    /// Channels this middleware contributes to the state
    fn channels(&self) -> Vec<ChannelSpec> {
        Vec::new()
    }

    /// Tools merged into the agent's tool set at compile time
    fn tools(&self) -> Vec<Arc<Tool>> {
        Vec::new()
    }

    /// Hook points this middleware declares
    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks::default()
    }

    async fn before_agent(&self, _ctx: &HookContext) -> Result<Option<HookUpdate>> {
        Ok(None)
    }

    async fn before_model(&self, _ctx: &HookContext) -> Result<Option<HookUpdate>> {
        Ok(None)
    }

    async fn after_model(&self, _ctx: &HookContext) -> Result<Option<HookUpdate>> {
        Ok(None)
    }

    async fn after_agent(&self, _ctx: &HookContext) -> Result<Option<HookUpdate>> {
        Ok(None)
    }

    /// Wrap the model call; default passes through
    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        next: ModelNext,
    ) -> Result<ModelResponse> {
        next(request).await
    }

    /// Wrap a tool invocation; default passes through
    async fn wrap_tool_call(&self, request: ToolCallRequest, next: ToolNext) -> Result<ToolOutput> {
        next(request).await
    }
}

fn model_chain_step(
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    depth: usize,
    request: ModelRequest,
    core: ModelHandler,
) -> BoxFuture<'static, Result<ModelResponse>> {
    Box::pin(async move {
        if depth == 0 {
            return (core)(request).await;
        }
        let middleware = middlewares[depth - 1].clone();
        let next: ModelNext = {
            let middlewares = middlewares.clone();
            let core = core.clone();
            Box::new(move |req| model_chain_step(middlewares, depth - 1, req, core))
        };
        middleware.wrap_model_call(request, next).await
    })
}

/// Run a model request through the wrap chain
///
/// The last registered middleware is outermost; index 0 sits directly on
/// the core handler.
pub async fn wrap_model_chain(
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    request: ModelRequest,
    core: ModelHandler,
) -> Result<ModelResponse> {
    let depth = middlewares.len();
    model_chain_step(middlewares, depth, request, core).await
}

fn tool_chain_step(
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    depth: usize,
    request: ToolCallRequest,
    core: ToolHandler,
) -> BoxFuture<'static, Result<ToolOutput>> {
    Box::pin(async move {
        if depth == 0 {
            return (core)(request).await;
        }
        let middleware = middlewares[depth - 1].clone();
        let next: ToolNext = {
            let middlewares = middlewares.clone();
            let core = core.clone();
            Box::new(move |req| tool_chain_step(middlewares, depth - 1, req, core))
        };
        middleware.wrap_tool_call(request, next).await
    })
}

/// Run a tool invocation through the wrap chain
pub async fn wrap_tool_chain(
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    request: ToolCallRequest,
    core: ToolHandler,
) -> Result<ToolOutput> {
    let depth = middlewares.len();
    tool_chain_step(middlewares, depth, request, core).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;
    use crate::model::TokenUsage;
    use parking_lot::Mutex;

    struct Tagger {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tagger {
        fn name(&self) -> &str {
            &self.name
        }

        async fn wrap_model_call(
            &self,
            request: ModelRequest,
            next: ModelNext,
        ) -> Result<ModelResponse> {
            self.log.lock().push(format!("enter:{}", self.name));
            let response = next(request).await?;
            self.log.lock().push(format!("exit:{}", self.name));
            Ok(response)
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: "m".into(),
            agent_key: "a".into(),
            system: None,
            messages: vec![],
            tools: vec![],
            tool_choice: None,
            state: Value::Null,
            language: None,
        }
    }

    #[tokio::test]
    async fn model_chain_composes_right_to_left() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Arc<Vec<Arc<dyn Middleware>>> = Arc::new(vec![
            Arc::new(Tagger {
                name: "first".into(),
                log: log.clone(),
            }),
            Arc::new(Tagger {
                name: "second".into(),
                log: log.clone(),
            }),
        ]);
        let core: ModelHandler = {
            let log = log.clone();
            Arc::new(move |_req| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().push("core".into());
                    Ok(ModelResponse {
                        message: Message::assistant("ok"),
                        usage: TokenUsage::default(),
                    })
                })
            })
        };

        wrap_model_chain(middlewares, request(), core).await.unwrap();

        // Last registered is outermost.
        assert_eq!(
            log.lock().clone(),
            vec!["enter:second", "enter:first", "core", "exit:first", "exit:second"]
        );
    }

    struct Rewriter;

    #[async_trait]
    impl Middleware for Rewriter {
        fn name(&self) -> &str {
            "rewriter"
        }

        async fn wrap_model_call(
            &self,
            mut request: ModelRequest,
            next: ModelNext,
        ) -> Result<ModelResponse> {
            request.system = Some("rewritten".into());
            next(request).await
        }
    }

    #[tokio::test]
    async fn wrappers_may_alter_the_request() {
        let middlewares: Arc<Vec<Arc<dyn Middleware>>> = Arc::new(vec![Arc::new(Rewriter)]);
        let core: ModelHandler = Arc::new(|req| {
            Box::pin(async move {
                assert_eq!(req.system.as_deref(), Some("rewritten"));
                Ok(ModelResponse {
                    message: Message::assistant("ok"),
                    usage: TokenUsage::default(),
                })
            })
        });
        wrap_model_chain(middlewares, request(), core).await.unwrap();
    }
}
