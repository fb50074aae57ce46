//! # xpert-core - agent graph runtime
//!
//! A checkpointed, streaming state-machine executor for LLM-powered agent
//! teams. A declarative [`Xpert`] graph of agents, toolsets,
//! knowledgebases and workflow nodes compiles into a [`CompiledGraph`];
//! the [`GraphRunner`] drives it step by step: execute ready nodes, merge
//! their channel writes atomically, persist a checkpoint, route to
//! successors. Middleware hooks wrap the agent lifecycle and every
//! model/tool invocation; interrupts pause a run for human review or
//! client-side tool execution and resumes pick up at the exact
//! checkpoint.
//!
//! ## Module map
//!
//! - [`state`] - channels, reducers and the per-run [`ChannelStore`]
//! - [`messages`] - chat messages, tool calls, the `add_messages` reducer
//! - [`graph`] - the declarative model ([`Xpert`], agents, workflow nodes)
//! - [`compile`] - subgraph compiler producing [`CompiledGraph`]
//! - [`middleware`] / [`middlewares`] - the hook pipeline and the
//!   first-party middlewares (HITL, client tools, selector, summarization)
//! - [`runner`] - the cooperative scheduler
//! - [`tool_node`] - tool execution and result normalization
//! - [`interrupt`] - interrupt records and the resume manager
//! - [`event`] - the per-run event bus with mute/unmute filtering
//! - [`ledger`] - runs and the append-only execution ledger
//! - [`model`] - the [`ChatModel`] seam and registry
//! - [`toolset`] - the [`Toolset`] abstraction
//! - [`store`] - namespaced key-value storage

pub mod cancel;
pub mod command;
pub mod compile;
pub mod error;
pub mod event;
pub mod graph;
pub mod interrupt;
pub mod ledger;
pub mod messages;
pub mod middleware;
pub mod middlewares;
pub mod model;
pub mod retry;
pub mod runner;
pub mod state;
pub mod store;
pub mod tool_node;
pub mod toolset;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use command::{Command, Send};
pub use compile::{
    compile, CompileContext, CompiledGraph, CompiledNode, CompiledTool, NodeKind, CALL_MODEL, END,
    KNOWLEDGEBASE_CHANNEL, PARAMETERS_CHANNEL, SUMMARIZE_NODE, TITLE_CHANNEL, TITLE_NODE,
};
pub use error::{GraphError, Result};
pub use event::{AgentEvent, EventBus, MutePolicy};
pub use graph::{
    AgentOptions, AssignSource, ChannelDecl, Connection, ConnectionKind, ErrorHandling, GraphNode,
    GraphNodeKind, MemoryWrite, Navigator, OutputVariable, ParameterDef, StructuredOutputMethod,
    ToolOverride, VariableAssigner, WorkflowKind, WorkflowNode, WorkflowTask, Xpert, XpertAgent,
    XpertGraph, XpertOptions,
};
pub use interrupt::{
    ActionRequest, ClientToolResponse, HitlDecision, HitlResume, Interrupt, InterruptKind,
    InterruptManager, InterruptRecord, ReviewConfig, ReviewDecisionKind,
};
pub use ledger::{ExecutionClose, ExecutionLedger, ExecutionRow, Run, RunStatus, RunStore};
pub use messages::{
    add_messages, ContentPart, Message, MessageContent, MessageRole, MessageUpdate, RemoveMessage,
    ToolCall, ToolMessageStatus,
};
pub use middleware::{
    wrap_model_chain, wrap_tool_chain, HookContext, HookUpdate, JumpTo, Middleware,
    MiddlewareHooks, ModelHandler, ModelNext, ToolCallRequest, ToolHandler, ToolNext,
};
pub use model::{
    ChatModel, ModelEnv, ModelRegistry, ModelRequest, ModelResponse, RequestTool, ScriptedModel,
    ScriptedStep, TokenUsage, ToolDescriptor,
};
pub use retry::RetryPolicy;
pub use runner::{GraphRunner, RunInput, RunOptions, RunOutcome, RunnerServices};
pub use state::{
    agent_channel_name, AgentChannelState, ChannelSpec, ChannelStore, Reducer, MESSAGES_CHANNEL,
};
pub use store::{InMemoryStore, Store, StoreError, StoreItem};
pub use tool_node::{execute_tool_call, ToolNodeOutput};
pub use toolset::{
    knowledge_tool, RecallOptions, Retriever, SimpleToolset, StateVariable, Tool, ToolOutput,
    ToolRuntime, Toolset,
};
