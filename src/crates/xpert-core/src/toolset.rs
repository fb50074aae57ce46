//! Toolsets and tools
//!
//! A [`Toolset`] is the unit of tool discovery: it owns a set of [`Tool`]s,
//! optional display titles, and state variables its tools write into. Tools
//! are stateless from the scheduler's point of view: everything they need
//! arrives in the [`ToolRuntime`] handed to `invoke`, and their arguments
//! are validated against the declared JSON Schema before invocation.

use crate::cancel::CancelToken;
use crate::command::Command;
use crate::error::{GraphError, Result};
use crate::event::EventBus;
use crate::messages::Message;
use crate::state::Reducer;
use crate::store::Store;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What a tool invocation may return
#[derive(Debug, Clone)]
pub enum ToolOutput {
    /// Raw content; the tool node wraps it into a ToolMessage
    Content(Value),
    /// A ready-made message (normally role=tool)
    Message(Message),
    /// A control command; `messages` updates are rewritten into the
    /// caller's agent channel by the tool node
    Command(Command),
}

/// Execution context injected into every tool invocation
#[derive(Clone)]
pub struct ToolRuntime {
    /// Toolset that owns the tool, when applicable
    pub toolset_id: Option<String>,

    /// Agent whose turn produced the call
    pub agent_key: String,

    pub thread_id: String,
    pub run_id: String,

    /// Environment values visible to tools
    pub env: HashMap<String, Value>,

    /// Long-term store, when configured
    pub store: Option<Arc<dyn Store>>,

    /// Run-level cancellation signal; tools must honor it
    pub signal: CancelToken,

    /// Per-run event bus
    pub events: EventBus,

    /// Snapshot of the caller's agent channel
    pub state: Value,
}

impl std::fmt::Debug for ToolRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRuntime")
            .field("toolset_id", &self.toolset_id)
            .field("agent_key", &self.agent_key)
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

/// Tool executor function type
pub type ToolExecutor =
    Arc<dyn Fn(Value, ToolRuntime) -> BoxFuture<'static, Result<ToolOutput>> + Send + Sync>;

/// A single invokable tool
pub struct Tool {
    pub name: String,
    pub description: String,

    /// JSON Schema for the arguments object
    pub schema: Value,

    executor: ToolExecutor,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        executor: ToolExecutor,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            executor,
        }
    }

    /// Build a tool from an async closure returning raw content
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value, ToolRuntime) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::new(
            name,
            description,
            schema,
            Arc::new(move |args, runtime| {
                let f = f.clone();
                Box::pin(async move { f(args, runtime).await })
            }),
        )
    }

    /// Validate arguments against the declared schema
    ///
    /// A schema that fails to compile is a configuration error; arguments
    /// that fail validation are an input error carrying every violation.
    pub fn validate_args(&self, args: &Value) -> Result<()> {
        if !args.is_object() {
            return Err(GraphError::Input(format!(
                "arguments for tool '{}' must be an object",
                self.name
            )));
        }
        let compiled = jsonschema::JSONSchema::compile(&self.schema).map_err(|e| {
            GraphError::Configuration(format!("invalid JSON Schema for tool '{}': {e}", self.name))
        })?;
        let violations: Vec<String> = match compiled.validate(args) {
            Ok(()) => return Ok(()),
            Err(errors) => errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect(),
        };
        Err(GraphError::Input(format!(
            "invalid arguments for tool '{}': {}",
            self.name,
            violations.join("; ")
        )))
    }

    /// Validate and execute
    pub async fn invoke(&self, args: Value, runtime: ToolRuntime) -> Result<ToolOutput> {
        self.validate_args(&args)?;
        (self.executor)(args, runtime).await
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// A state variable a toolset contributes to the run's channel set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVariable {
    pub name: String,

    #[serde(default = "default_variable_reducer")]
    pub reducer: Reducer,

    #[serde(default)]
    pub default: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_variable_reducer() -> Reducer {
    Reducer::LastValue
}

/// A discoverable collection of tools
#[async_trait]
pub trait Toolset: Send + Sync {
    /// Stable identifier referenced by agent definitions
    fn id(&self) -> &str;

    /// Human-readable provider name
    fn provider_name(&self) -> &str;

    /// Display title for one tool, if the provider defines one
    fn tool_title(&self, _name: &str) -> Option<String> {
        None
    }

    /// Instantiate the tools; called once per run at compile time
    async fn init_tools(&self) -> Result<Vec<Arc<Tool>>>;

    /// State variables this toolset contributes
    fn variables(&self) -> Vec<StateVariable> {
        Vec::new()
    }

    /// Release resources; called on run finalize or abort
    async fn close(&self) {}
}

/// Toolset assembled from a fixed list of tools
pub struct SimpleToolset {
    id: String,
    provider: String,
    tools: Vec<Arc<Tool>>,
    titles: HashMap<String, String>,
    variables: Vec<StateVariable>,
}

impl SimpleToolset {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, tools: Vec<Arc<Tool>>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            tools,
            titles: HashMap::new(),
            variables: Vec::new(),
        }
    }

    pub fn with_title(mut self, tool: impl Into<String>, title: impl Into<String>) -> Self {
        self.titles.insert(tool.into(), title.into());
        self
    }

    pub fn with_variable(mut self, variable: StateVariable) -> Self {
        self.variables.push(variable);
        self
    }
}

#[async_trait]
impl Toolset for SimpleToolset {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn tool_title(&self, name: &str) -> Option<String> {
        self.titles.get(name).cloned()
    }

    async fn init_tools(&self) -> Result<Vec<Arc<Tool>>> {
        Ok(self.tools.clone())
    }

    fn variables(&self) -> Vec<StateVariable> {
        self.variables.clone()
    }
}

/// Recall parameters for knowledge retrieval tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallOptions {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_threshold: Option<f64>,
}

fn default_top_k() -> usize {
    4
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: None,
        }
    }
}

/// Knowledge retrieval seam; concrete retrievers live outside the core
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn recall(
        &self,
        knowledgebase_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<Value>>;
}

/// Build the synthetic retriever tool for one knowledgebase
pub fn knowledge_tool(
    knowledgebase_id: &str,
    retriever: Arc<dyn Retriever>,
    options: RecallOptions,
) -> Arc<Tool> {
    let kb = knowledgebase_id.to_string();
    let name = format!("knowledge_retriever_{kb}");
    Arc::new(Tool::from_fn(
        name,
        format!("Retrieve relevant passages from knowledgebase '{kb}'"),
        serde_json::json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {"type": "string", "description": "What to look up"}
            }
        }),
        move |args, _runtime| {
            let retriever = retriever.clone();
            let kb = kb.clone();
            let options = options.clone();
            async move {
                let query = args["query"].as_str().unwrap_or_default().to_string();
                let passages = retriever.recall(&kb, &query, &options).await?;
                Ok(ToolOutput::Content(Value::Array(passages)))
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_tool() -> Arc<Tool> {
        Arc::new(Tool::from_fn(
            "add",
            "Add two numbers",
            serde_json::json!({
                "type": "object",
                "required": ["a", "b"],
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number"}
                }
            }),
            |args, _runtime| async move {
                let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
                Ok(ToolOutput::Content(serde_json::json!(sum)))
            },
        ))
    }

    fn runtime() -> ToolRuntime {
        ToolRuntime {
            toolset_id: None,
            agent_key: "planner".into(),
            thread_id: "t1".into(),
            run_id: "r1".into(),
            env: HashMap::new(),
            store: None,
            signal: CancelToken::never(),
            events: EventBus::sink(),
            state: Value::Null,
        }
    }

    #[tokio::test]
    async fn invoke_validates_then_executes() {
        let tool = add_tool();
        let out = tool
            .invoke(serde_json::json!({"a": 2, "b": 3}), runtime())
            .await
            .unwrap();
        match out {
            ToolOutput::Content(v) => assert_eq!(v, serde_json::json!(5.0)),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_args_are_rejected_before_execution() {
        let tool = add_tool();
        let err = tool
            .invoke(serde_json::json!({"a": "two"}), runtime())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn non_object_args_are_rejected() {
        let tool = add_tool();
        let err = tool.invoke(serde_json::json!([1, 2]), runtime()).await.unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn simple_toolset_exposes_tools_and_titles() {
        let toolset = SimpleToolset::new("calc", "Calculator", vec![add_tool()])
            .with_title("add", "Addition");
        assert_eq!(toolset.id(), "calc");
        assert_eq!(toolset.tool_title("add").as_deref(), Some("Addition"));
        assert_eq!(toolset.init_tools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn knowledge_tool_queries_retriever() {
        struct FixedRetriever;
        #[async_trait]
        impl Retriever for FixedRetriever {
            async fn recall(
                &self,
                knowledgebase_id: &str,
                query: &str,
                _options: &RecallOptions,
            ) -> Result<Vec<Value>> {
                Ok(vec![serde_json::json!({"kb": knowledgebase_id, "q": query})])
            }
        }

        let tool = knowledge_tool("kb1", Arc::new(FixedRetriever), RecallOptions::default());
        assert_eq!(tool.name, "knowledge_retriever_kb1");
        let out = tool
            .invoke(serde_json::json!({"query": "rust"}), runtime())
            .await
            .unwrap();
        match out {
            ToolOutput::Content(Value::Array(items)) => {
                assert_eq!(items[0]["kb"], "kb1");
                assert_eq!(items[0]["q"], "rust");
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }
}
