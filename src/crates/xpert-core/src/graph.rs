//! Declarative graph model
//!
//! An [`Xpert`] is the versioned, declarative description of an agent team:
//! typed nodes (agent / knowledge / toolset / xpert / workflow) plus typed
//! connections. The subgraph compiler turns it into an executable
//! [`CompiledGraph`](crate::compile::CompiledGraph) rooted at one agent.
//!
//! References between xperts, agents and toolsets are by id; resolution
//! happens at compile time, never at definition time.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Versioned declarative definition of an agent team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Xpert {
    pub id: String,
    pub slug: String,
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// At most one version per (slug, workspace) carries this flag
    #[serde(default)]
    pub latest: bool,

    pub graph: XpertGraph,

    #[serde(default)]
    pub options: XpertOptions,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1".to_string()
}

/// Team-level options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpertOptions {
    /// Append a conversation-summary step before the run ends
    #[serde(default)]
    pub summarize_conversation: bool,

    /// Append a conversation-title step before the run ends
    #[serde(default)]
    pub title_conversation: bool,
}

/// The user-declared topology
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XpertGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,

    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// One node in the declarative graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: String,

    #[serde(flatten)]
    pub kind: GraphNodeKind,
}

/// Node payload by type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GraphNodeKind {
    Agent(XpertAgent),
    Knowledge { knowledgebase_id: String },
    Toolset { toolset_id: String },
    Xpert { xpert_id: String },
    Workflow(WorkflowNode),
}

/// Edge type between declarative nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Edge,
    Agent,
    Toolset,
    Knowledge,
    Xpert,
    Workflow,
}

/// A typed connection between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,

    #[serde(rename = "type")]
    pub kind: ConnectionKind,
}

/// A single agent inside an xpert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpertAgent {
    /// Unique within the xpert
    pub key: String,

    pub name: String,

    /// System prompt; `{{param}}` placeholders are filled from run input
    pub prompt: String,

    /// Registry name of the chat model; the compile context's default
    /// applies when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Declared input parameters
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,

    /// Structured output schema; non-empty enables structured output
    #[serde(default)]
    pub output_variables: Vec<OutputVariable>,

    #[serde(default)]
    pub toolset_ids: Vec<String>,

    #[serde(default)]
    pub knowledgebase_ids: Vec<String>,

    /// Sub-agents in the same team, by agent key
    #[serde(default)]
    pub followers: Vec<String>,

    /// External xperts called as tools, by xpert id
    #[serde(default)]
    pub collaborators: Vec<String>,

    /// Downstream node keys after this agent completes
    #[serde(default)]
    pub next: Vec<String>,

    /// Node routed to when the fail branch is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,

    #[serde(default)]
    pub options: AgentOptions,
}

/// One declared input parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,
}

/// One declared structured-output field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputVariable {
    pub name: String,

    #[serde(rename = "type", default = "default_output_type")]
    pub var_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_output_type() -> String {
    "string".to_string()
}

/// Per-agent execution options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Registry name of the model tried after retries are exhausted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<StructuredOutputMethod>,

    #[serde(default)]
    pub vision: bool,

    /// Long-term memory namespace written on successful completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryWrite>,

    /// Exclude prior conversation turns from the model prompt
    #[serde(default)]
    pub disable_message_history: bool,

    /// Per-run deadline in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Allow-list restricting which collected tools the agent may call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_tools: Option<Vec<String>>,

    /// Per-tool configuration overrides, keyed by tool name
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,

    /// Tools that end the agent's turn instead of looping back
    #[serde(default)]
    pub end_nodes: Vec<String>,
}

/// Model error policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ErrorHandling {
    /// Substitute an assistant message with this content
    DefaultValue { content: String },
    /// Route to the agent's declared fail node
    FailBranch,
}

/// How structured output is requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StructuredOutputMethod {
    FunctionCall,
    JsonMode,
}

/// Memory write target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub namespace: Vec<String>,
}

/// Per-tool overrides within an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Per-tool deadline in milliseconds, overriding the run deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Sensitive tools interrupt for confirmation before running
    #[serde(default)]
    pub sensitive: bool,

    /// Convert tool failures into error ToolMessages (default true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_errors: Option<bool>,

    /// Assign parts of the result into named channels
    #[serde(default)]
    pub variables: Vec<VariableAssigner>,
}

/// Writes a part of a tool result into a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableAssigner {
    pub channel: String,
    pub source: AssignSource,
}

/// What part of the result an assigner copies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssignSource {
    /// The stringified tool content
    Content,
    /// The structured artifact, when the tool returned one
    Artifact,
    /// A fixed value
    Constant { value: Value },
}

/// What a workflow node does when it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkflowKind {
    /// Write a value into a channel
    Assign { channel: String, value: Value },
    /// Emit an assistant message rendered from channel values
    Answer { template: String },
}

/// Deterministic or conditional routing out of a workflow node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Navigator {
    /// Fixed successor set
    Next { nodes: Vec<String> },
    /// Route on the string value of a channel (or a field inside it)
    Conditional {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        cases: HashMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
}

/// Channel declared by a workflow node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDecl {
    pub name: String,

    #[serde(default)]
    pub default: Value,
}

/// Surface a workflow node exposes as a callable tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// A workflow node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub key: String,

    pub kind: WorkflowKind,

    pub navigator: Navigator,

    /// Adds END to the successor set (never replaces it)
    #[serde(default)]
    pub is_end: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelDecl>,

    /// Present when the node also emits a callable tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<WorkflowTask>,
}

impl Xpert {
    /// Minimal single-agent xpert; the usual test fixture
    pub fn single_agent(agent: XpertAgent) -> Self {
        let key = agent.key.clone();
        Self {
            id: format!("xpert-{key}"),
            slug: key.clone(),
            name: key.clone(),
            version: default_version(),
            latest: true,
            graph: XpertGraph {
                nodes: vec![GraphNode {
                    key,
                    kind: GraphNodeKind::Agent(agent),
                }],
                connections: Vec::new(),
            },
            options: XpertOptions::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn agent(&self, key: &str) -> Option<&XpertAgent> {
        self.graph.nodes.iter().find_map(|node| match &node.kind {
            GraphNodeKind::Agent(agent) if agent.key == key => Some(agent),
            _ => None,
        })
    }

    pub fn workflow(&self, key: &str) -> Option<&WorkflowNode> {
        self.graph.nodes.iter().find_map(|node| match &node.kind {
            GraphNodeKind::Workflow(wf) if wf.key == key => Some(wf),
            _ => None,
        })
    }

    /// First declared agent; the default entry point
    pub fn first_agent(&self) -> Option<&XpertAgent> {
        self.graph.nodes.iter().find_map(|node| match &node.kind {
            GraphNodeKind::Agent(agent) => Some(agent),
            _ => None,
        })
    }

    /// Connections of one kind leaving a node
    pub fn connections_from(&self, from: &str, kind: ConnectionKind) -> Vec<&Connection> {
        self.graph
            .connections
            .iter()
            .filter(|c| c.from == from && c.kind == kind)
            .collect()
    }
}

impl XpertAgent {
    /// Bare agent with a key, prompt and model
    pub fn new(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            prompt: prompt.into(),
            model: None,
            parameters: Vec::new(),
            output_variables: Vec::new(),
            toolset_ids: Vec::new(),
            knowledgebase_ids: Vec::new(),
            followers: Vec::new(),
            collaborators: Vec::new(),
            next: Vec::new(),
            fail: None,
            options: AgentOptions::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_toolsets(mut self, ids: Vec<String>) -> Self {
        self.toolset_ids = ids;
        self
    }

    pub fn with_output_variables(mut self, vars: Vec<OutputVariable>) -> Self {
        self.output_variables = vars;
        self
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }
}
