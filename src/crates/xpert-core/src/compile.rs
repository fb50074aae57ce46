//! Subgraph compiler: declarative [`Xpert`] → executable [`CompiledGraph`]
//!
//! Compilation resolves every by-id reference (toolsets, knowledgebases,
//! followers, collaborators), builds the node set around one entry agent,
//! wires hook chains in their required order, collects channels from all
//! contributors, and validates conditional routers' path maps. Followers
//! and collaborators compile recursively into sub-graphs exposed to the
//! model as synthetic tools.
//!
//! Everything that can fail here is a configuration error and fails before
//! a run starts; the runner assumes a compiled graph is internally
//! consistent.

use crate::error::{GraphError, Result};
use crate::graph::{
    ConnectionKind, GraphNodeKind, Navigator, ToolOverride, VariableAssigner, WorkflowNode, Xpert,
    XpertAgent,
};
use crate::middleware::Middleware;
use crate::model::{ChatModel, ModelRegistry, RequestTool, ToolDescriptor};
use crate::state::{ChannelSpec, Reducer};
use crate::toolset::{knowledge_tool, RecallOptions, Retriever, Tool, ToolOutput, Toolset};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Terminal node name
pub const END: &str = "__end__";

/// The agent's model-call node
pub const CALL_MODEL: &str = "call_model";

/// Conversation-summary terminal node
pub const SUMMARIZE_NODE: &str = "summarize_conversation";

/// Conversation-title terminal node
pub const TITLE_NODE: &str = "title_conversation";

/// Channel receiving retrieved knowledge passages
pub const KNOWLEDGEBASE_CHANNEL: &str = "knowledgebase_channel";

/// Channel holding the run's input parameters
pub const PARAMETERS_CHANNEL: &str = "parameters";

/// Channel holding the conversation title
pub const TITLE_CHANNEL: &str = "title";

/// Executable behavior of one compiled node
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// `before_agent` hook of middleware at this registry index
    BeforeAgent(usize),
    /// `before_model` hook
    BeforeModel(usize),
    /// The agent's model call
    CallModel,
    /// `after_model` hook
    AfterModel(usize),
    /// `after_agent` hook
    AfterAgent(usize),
    /// Executes the named tool
    Tool(String),
    /// Runs a compiled sub-graph to completion
    SubAgent(String),
    /// Runs a workflow node
    Workflow(String),
    /// Summarize-conversation terminal
    Summarize,
    /// Title-conversation terminal
    Title,
    /// Terminal sink
    End,
}

/// One executable node
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub name: String,
    pub kind: NodeKind,

    /// Deferred join: runs only after all same-step predecessors complete
    pub defer: bool,
}

/// A tool bound into a compiled graph with its per-agent configuration
#[derive(Clone)]
pub struct CompiledTool {
    pub tool: Arc<Tool>,
    pub toolset_id: Option<String>,

    /// Per-agent description override
    pub description: Option<String>,

    pub title: Option<String>,
    pub sensitive: bool,

    /// Ends the agent's turn instead of looping back to the model
    pub end_node: bool,

    pub handle_errors: bool,
    pub timeout_ms: Option<u64>,
    pub variables: Vec<VariableAssigner>,
}

impl CompiledTool {
    fn from_override(tool: Arc<Tool>, toolset_id: Option<String>, cfg: Option<&ToolOverride>, end_node: bool, title: Option<String>) -> Self {
        Self {
            tool,
            toolset_id,
            description: cfg.and_then(|c| c.description.clone()),
            title,
            sensitive: cfg.map(|c| c.sensitive).unwrap_or(false),
            end_node,
            handle_errors: cfg.and_then(|c| c.handle_errors).unwrap_or(true),
            timeout_ms: cfg.and_then(|c| c.timeout),
            variables: cfg.map(|c| c.variables.clone()).unwrap_or_default(),
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.tool.name.clone(),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| self.tool.description.clone()),
            schema: self.tool.schema.clone(),
        }
    }
}

impl std::fmt::Debug for CompiledTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTool")
            .field("name", &self.tool.name)
            .field("sensitive", &self.sensitive)
            .field("end_node", &self.end_node)
            .finish()
    }
}

/// Resolution context for compilation
pub struct CompileContext {
    pub toolsets: Vec<Arc<dyn Toolset>>,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub models: Arc<ModelRegistry>,

    /// Model used when an agent declares none
    pub default_model: Option<String>,

    pub retriever: Option<Arc<dyn Retriever>>,

    /// External xperts available as collaborators, by xpert id
    pub collaborators: HashMap<String, Arc<Xpert>>,
}

impl Default for CompileContext {
    fn default() -> Self {
        Self {
            toolsets: Vec::new(),
            middlewares: Vec::new(),
            models: Arc::new(ModelRegistry::new()),
            default_model: None,
            retriever: None,
            collaborators: HashMap::new(),
        }
    }
}

/// Runtime form of an xpert subgraph rooted at one agent
pub struct CompiledGraph {
    pub xpert: Arc<Xpert>,
    pub agent: XpertAgent,

    pub entry: String,
    pub nodes: HashMap<String, CompiledNode>,

    /// Static successors
    pub edges: HashMap<String, Vec<String>>,

    pub channels: Vec<ChannelSpec>,

    pub interrupt_before: HashSet<String>,
    pub interrupt_after: HashSet<String>,

    pub tools: HashMap<String, CompiledTool>,
    pub sub_agents: HashMap<String, Arc<CompiledGraph>>,
    pub workflows: HashMap<String, WorkflowNode>,

    pub middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    pub toolsets: Vec<Arc<dyn Toolset>>,

    pub model: Arc<dyn ChatModel>,
    pub fallback_model: Option<Arc<dyn ChatModel>>,

    /// Node whose output feeds the after-model router
    pub router_source: String,

    /// First node of the agent's model loop (tool returns come back here)
    pub loop_entry: String,

    /// First node of the agent's exit chain
    pub exit_entry: String,

    /// Full successor set of the exit decision: the after-agent chain
    /// head when hooks exist, otherwise every next target
    pub exit_targets: Vec<String>,

    /// Where END-bound edges land (summarize/title sit on this path)
    pub end_entry: String,

    /// Resolved fail-branch target when error handling routes to one
    pub fail_target: Option<String>,

    /// Conditional routers' declared destination sets
    pub path_maps: HashMap<String, Vec<String>>,
}

impl CompiledGraph {
    /// Tool list shown to the model: bound tools plus sub-agent tools
    pub fn tool_descriptors(&self) -> Vec<RequestTool> {
        let mut descriptors: Vec<RequestTool> = Vec::new();
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        for name in names {
            descriptors.push(RequestTool::Function(self.tools[name].descriptor()));
        }
        let mut subs: Vec<&String> = self.sub_agents.keys().collect();
        subs.sort();
        for name in subs {
            let sub = &self.sub_agents[name];
            descriptors.push(RequestTool::Function(ToolDescriptor {
                name: name.clone(),
                description: format!("Delegate a task to the '{}' agent", sub.agent.name),
                schema: serde_json::json!({
                    "type": "object",
                    "required": ["input"],
                    "properties": {
                        "input": {"type": "string", "description": "Task for the sub-agent"}
                    }
                }),
            }));
        }
        descriptors
    }

    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        self.channels.clone()
    }

    /// Close every toolset; called on run finalize or abort
    pub async fn close_toolsets(&self) {
        for toolset in &self.toolsets {
            toolset.close().await;
        }
        for sub in self.sub_agents.values() {
            Box::pin(sub.close_toolsets()).await;
        }
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("agent", &self.agent.key)
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.len())
            .field("tools", &self.tools.len())
            .field("sub_agents", &self.sub_agents.len())
            .finish()
    }
}

/// Compile an xpert subgraph rooted at `entry_agent`
pub async fn compile(
    xpert: Arc<Xpert>,
    entry_agent: &str,
    ctx: Arc<CompileContext>,
) -> Result<Arc<CompiledGraph>> {
    compile_inner(xpert, entry_agent.to_string(), ctx, Vec::new()).await
}

fn compile_inner(
    xpert: Arc<Xpert>,
    entry_agent: String,
    ctx: Arc<CompileContext>,
    stack: Vec<String>,
) -> BoxFuture<'static, Result<Arc<CompiledGraph>>> {
    Box::pin(async move {
        if stack.contains(&entry_agent) {
            return Err(GraphError::Configuration(format!(
                "follower cycle through agent '{entry_agent}'"
            )));
        }
        let agent = xpert
            .agent(&entry_agent)
            .ok_or_else(|| {
                GraphError::Configuration(format!("agent '{entry_agent}' not found in xpert '{}'", xpert.slug))
            })?
            .clone();

        validate_middlewares(&ctx.middlewares)?;

        // Model resolution; a missing model is fatal here, not mid-run.
        let model_name = agent
            .model
            .clone()
            .or_else(|| ctx.default_model.clone())
            .ok_or_else(|| {
                GraphError::Configuration(format!("agent '{}' has no model configured", agent.key))
            })?;
        let model = ctx.models.get(&model_name)?;
        let fallback_model = match &agent.options.fallback_model {
            Some(name) => Some(ctx.models.get(name).map_err(|_| {
                GraphError::Configuration(format!(
                    "fallback model '{name}' for agent '{}' is not registered",
                    agent.key
                ))
            })?),
            None => None,
        };

        let mut child_stack = stack.clone();
        child_stack.push(entry_agent.clone());

        // Followers become sub-agent tools keyed by their agent name.
        let mut sub_agents: HashMap<String, Arc<CompiledGraph>> = HashMap::new();
        let mut follower_keys: Vec<String> = agent.followers.clone();
        for conn in xpert.connections_from(&agent.key, ConnectionKind::Agent) {
            if !follower_keys.contains(&conn.to) {
                follower_keys.push(conn.to.clone());
            }
        }
        for follower_key in follower_keys {
            let sub = compile_inner(
                xpert.clone(),
                follower_key.clone(),
                ctx.clone(),
                child_stack.clone(),
            )
            .await?;
            sub_agents.insert(sub.agent.name.clone(), sub);
        }

        // Collaborators become sub-agent tools keyed by their xpert id.
        let mut collaborator_ids: Vec<String> = agent.collaborators.clone();
        for conn in xpert.connections_from(&agent.key, ConnectionKind::Xpert) {
            if !collaborator_ids.contains(&conn.to) {
                collaborator_ids.push(conn.to.clone());
            }
        }
        for collab_id in collaborator_ids {
            let collab = ctx.collaborators.get(&collab_id).ok_or_else(|| {
                GraphError::Configuration(format!("collaborator xpert '{collab_id}' is unknown"))
            })?;
            let collab_entry = collab
                .first_agent()
                .ok_or_else(|| {
                    GraphError::Configuration(format!(
                        "collaborator xpert '{collab_id}' has no agents"
                    ))
                })?
                .key
                .clone();
            let sub = compile_inner(collab.clone(), collab_entry, ctx.clone(), child_stack.clone())
                .await?;
            sub_agents.insert(collab_id, sub);
        }

        // Collect toolsets referenced by id or by connection.
        let mut toolset_ids: Vec<String> = agent.toolset_ids.clone();
        for conn in xpert.connections_from(&agent.key, ConnectionKind::Toolset) {
            let id = match xpert.graph.nodes.iter().find(|n| n.key == conn.to) {
                Some(node) => match &node.kind {
                    GraphNodeKind::Toolset { toolset_id } => toolset_id.clone(),
                    _ => conn.to.clone(),
                },
                None => conn.to.clone(),
            };
            if !toolset_ids.contains(&id) {
                toolset_ids.push(id);
            }
        }

        let mut tools: HashMap<String, CompiledTool> = HashMap::new();
        let mut channels: Vec<ChannelSpec> = vec![
            ChannelSpec::messages(),
            ChannelSpec::agent(&agent.key),
            ChannelSpec::new(
                PARAMETERS_CHANNEL,
                Reducer::LastValue,
                Value::Object(Default::default()),
            ),
        ];
        if xpert.options.title_conversation {
            push_channel(
                &mut channels,
                ChannelSpec::new(TITLE_CHANNEL, Reducer::LastValue, Value::Null),
            )?;
        }
        let mut interrupt_before: HashSet<String> = HashSet::new();
        let mut used_toolsets: Vec<Arc<dyn Toolset>> = Vec::new();

        let allow_list = agent.options.available_tools.as_ref();
        for toolset_id in &toolset_ids {
            let toolset = ctx
                .toolsets
                .iter()
                .find(|t| t.id() == toolset_id)
                .cloned()
                .ok_or_else(|| {
                    GraphError::Configuration(format!("toolset '{toolset_id}' is not available"))
                })?;
            for tool in toolset.init_tools().await? {
                if let Some(allowed) = allow_list {
                    if !allowed.contains(&tool.name) {
                        continue;
                    }
                }
                let cfg = agent.options.tools.get(&tool.name);
                let end_node = agent.options.end_nodes.contains(&tool.name);
                let title = toolset.tool_title(&tool.name);
                let compiled =
                    CompiledTool::from_override(tool, Some(toolset_id.clone()), cfg, end_node, title);
                if compiled.sensitive {
                    interrupt_before.insert(compiled.tool.name.clone());
                }
                tools.insert(compiled.tool.name.clone(), compiled);
            }
            for variable in toolset.variables() {
                push_channel(
                    &mut channels,
                    ChannelSpec::new(variable.name.clone(), variable.reducer, variable.default.clone()),
                )?;
            }
            used_toolsets.push(toolset);
        }

        // Knowledge retriever tools, one per knowledgebase.
        let mut kb_ids: Vec<String> = agent.knowledgebase_ids.clone();
        for conn in xpert.connections_from(&agent.key, ConnectionKind::Knowledge) {
            let id = match xpert.graph.nodes.iter().find(|n| n.key == conn.to) {
                Some(node) => match &node.kind {
                    GraphNodeKind::Knowledge { knowledgebase_id } => knowledgebase_id.clone(),
                    _ => conn.to.clone(),
                },
                None => conn.to.clone(),
            };
            if !kb_ids.contains(&id) {
                kb_ids.push(id);
            }
        }
        if !kb_ids.is_empty() {
            let retriever = ctx.retriever.clone().ok_or_else(|| {
                GraphError::Configuration(format!(
                    "agent '{}' references knowledgebases but no retriever is configured",
                    agent.key
                ))
            })?;
            for kb_id in &kb_ids {
                let tool = knowledge_tool(kb_id, retriever.clone(), RecallOptions::default());
                let cfg = agent.options.tools.get(&tool.name);
                let compiled = CompiledTool::from_override(tool, None, cfg, false, None);
                tools.insert(compiled.tool.name.clone(), compiled);
            }
            push_channel(
                &mut channels,
                ChannelSpec::new(KNOWLEDGEBASE_CHANNEL, Reducer::Append, Value::Array(Vec::new())),
            )?;
        }

        // Middleware tools merge into the agent's tool set.
        for middleware in &ctx.middlewares {
            for tool in middleware.tools() {
                let cfg = agent.options.tools.get(&tool.name);
                let end_node = agent.options.end_nodes.contains(&tool.name);
                let compiled = CompiledTool::from_override(tool, None, cfg, end_node, None);
                if compiled.sensitive {
                    interrupt_before.insert(compiled.tool.name.clone());
                }
                tools.insert(compiled.tool.name.clone(), compiled);
            }
        }

        // Reachable workflow nodes, walked from the agent's next set and
        // the fail branch.
        let mut next_targets: Vec<String> = agent.next.clone();
        for conn in xpert.connections_from(&agent.key, ConnectionKind::Edge) {
            if !next_targets.contains(&conn.to) {
                next_targets.push(conn.to.clone());
            }
        }
        let mut workflow_roots = next_targets.clone();
        if let Some(fail) = &agent.fail {
            workflow_roots.push(fail.clone());
        }
        let workflows = reachable_workflows(&xpert, &workflow_roots);
        for wf in workflows.values() {
            if let Some(decl) = &wf.channel {
                push_channel(
                    &mut channels,
                    ChannelSpec::new(decl.name.clone(), Reducer::LastValue, decl.default.clone()),
                )?;
            }
            if let Some(task) = &wf.task {
                let compiled = CompiledTool::from_override(
                    workflow_task_tool(wf, task.name.clone(), task.description.clone(), task.schema.clone()),
                    None,
                    agent.options.tools.get(&task.name),
                    false,
                    None,
                );
                tools.insert(compiled.tool.name.clone(), compiled);
            }
        }

        // Middleware-declared channels; reducer conflicts fail compilation.
        for middleware in &ctx.middlewares {
            for spec in middleware.channels() {
                push_channel(&mut channels, spec)?;
            }
        }

        // Hook chains. after_* chains run in reverse registration order.
        let hook_nodes = |prefix: &str, indices: &[usize]| -> Vec<String> {
            indices
                .iter()
                .map(|i| format!("{prefix}:{}", ctx.middlewares[*i].name()))
                .collect()
        };
        let before_agent_idx: Vec<usize> = declared(&ctx.middlewares, |h| h.before_agent);
        let before_model_idx: Vec<usize> = declared(&ctx.middlewares, |h| h.before_model);
        let mut after_model_idx: Vec<usize> = declared(&ctx.middlewares, |h| h.after_model);
        after_model_idx.reverse();
        let mut after_agent_idx: Vec<usize> = declared(&ctx.middlewares, |h| h.after_agent);
        after_agent_idx.reverse();

        let before_agent_names = hook_nodes("before_agent", &before_agent_idx);
        let before_model_names = hook_nodes("before_model", &before_model_idx);
        let after_model_names = hook_nodes("after_model", &after_model_idx);
        let after_agent_names = hook_nodes("after_agent", &after_agent_idx);

        let mut nodes: HashMap<String, CompiledNode> = HashMap::new();
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let add_node = |nodes: &mut HashMap<String, CompiledNode>, name: String, kind: NodeKind| {
            nodes.insert(
                name.clone(),
                CompiledNode {
                    name,
                    kind,
                    defer: false,
                },
            );
        };

        for (name, idx) in before_agent_names.iter().zip(&before_agent_idx) {
            add_node(&mut nodes, name.clone(), NodeKind::BeforeAgent(*idx));
        }
        for (name, idx) in before_model_names.iter().zip(&before_model_idx) {
            add_node(&mut nodes, name.clone(), NodeKind::BeforeModel(*idx));
        }
        add_node(&mut nodes, CALL_MODEL.to_string(), NodeKind::CallModel);
        for (name, idx) in after_model_names.iter().zip(&after_model_idx) {
            add_node(&mut nodes, name.clone(), NodeKind::AfterModel(*idx));
        }
        for (name, idx) in after_agent_names.iter().zip(&after_agent_idx) {
            add_node(&mut nodes, name.clone(), NodeKind::AfterAgent(*idx));
        }
        for name in tools.keys() {
            add_node(&mut nodes, name.clone(), NodeKind::Tool(name.clone()));
        }
        for name in sub_agents.keys() {
            add_node(&mut nodes, name.clone(), NodeKind::SubAgent(name.clone()));
        }
        for key in workflows.keys() {
            add_node(&mut nodes, key.clone(), NodeKind::Workflow(key.clone()));
        }
        if xpert.options.summarize_conversation {
            add_node(&mut nodes, SUMMARIZE_NODE.to_string(), NodeKind::Summarize);
        }
        if xpert.options.title_conversation {
            add_node(&mut nodes, TITLE_NODE.to_string(), NodeKind::Title);
        }
        add_node(&mut nodes, END.to_string(), NodeKind::End);

        // The path every END-bound edge takes: summarize → title → END.
        let end_entry = if xpert.options.summarize_conversation {
            SUMMARIZE_NODE.to_string()
        } else if xpert.options.title_conversation {
            TITLE_NODE.to_string()
        } else {
            END.to_string()
        };
        if xpert.options.summarize_conversation {
            let after = if xpert.options.title_conversation {
                TITLE_NODE.to_string()
            } else {
                END.to_string()
            };
            edges.insert(SUMMARIZE_NODE.to_string(), vec![after]);
        }
        if xpert.options.title_conversation {
            edges.insert(TITLE_NODE.to_string(), vec![END.to_string()]);
        }

        let agent_loop_entry = before_model_names
            .first()
            .cloned()
            .unwrap_or_else(|| CALL_MODEL.to_string());
        let entry = before_agent_names
            .first()
            .cloned()
            .unwrap_or_else(|| agent_loop_entry.clone());

        chain(&mut edges, &before_agent_names, Some(agent_loop_entry.clone()));
        chain(&mut edges, &before_model_names, Some(CALL_MODEL.to_string()));
        chain(&mut edges, &after_model_names, None);
        if let Some(first) = after_model_names.first() {
            edges
                .entry(CALL_MODEL.to_string())
                .or_default()
                .push(first.clone());
        }
        let router_source = after_model_names
            .last()
            .cloned()
            .unwrap_or_else(|| CALL_MODEL.to_string());

        // Exit chain: after_agent hooks, then next targets or the END path.
        let exit_targets: Vec<String> = if next_targets.is_empty() {
            vec![end_entry.clone()]
        } else {
            next_targets
                .iter()
                .map(|t| if t == END { end_entry.clone() } else { t.clone() })
                .collect()
        };
        let exit_entry = after_agent_names
            .first()
            .cloned()
            .unwrap_or_else(|| exit_targets[0].clone());
        chain(&mut edges, &after_agent_names, None);
        if let Some(last) = after_agent_names.last() {
            edges.entry(last.clone()).or_default().extend(exit_targets.clone());
        }

        // Tool and sub-agent returns.
        for (name, tool) in &tools {
            let targets = if tool.end_node {
                exit_targets.clone()
            } else {
                vec![agent_loop_entry.clone()]
            };
            edges.entry(name.clone()).or_default().extend(targets);
        }
        for name in sub_agents.keys() {
            edges
                .entry(name.clone())
                .or_default()
                .push(agent_loop_entry.clone());
        }

        // Workflow navigators.
        let mut path_maps: HashMap<String, Vec<String>> = HashMap::new();
        for (key, wf) in &workflows {
            match &wf.navigator {
                Navigator::Next { nodes: next } => {
                    let mut targets: Vec<String> = next
                        .iter()
                        .map(|t| if t == END { end_entry.clone() } else { t.clone() })
                        .collect();
                    if wf.is_end || targets.is_empty() {
                        // is_end adds END to the successor set.
                        if !targets.contains(&end_entry) {
                            targets.push(end_entry.clone());
                        }
                    }
                    edges.entry(key.clone()).or_default().extend(targets);
                }
                Navigator::Conditional { cases, default, .. } => {
                    let mut destinations: Vec<String> = cases
                        .values()
                        .map(|t| if t == END { end_entry.clone() } else { t.clone() })
                        .collect();
                    if let Some(default) = default {
                        let default = if default == END { end_entry.clone() } else { default.clone() };
                        if !destinations.contains(&default) {
                            destinations.push(default);
                        }
                    }
                    if wf.is_end && !destinations.contains(&end_entry) {
                        destinations.push(end_entry.clone());
                    }
                    path_maps.insert(key.clone(), destinations);
                }
            }
        }

        // Fail branch must resolve at compile time, not mid-run.
        let fail_target = match (&agent.options.error_handling, &agent.fail) {
            (Some(crate::graph::ErrorHandling::FailBranch), Some(fail)) => {
                let target = if fail == END { end_entry.clone() } else { fail.clone() };
                if !nodes.contains_key(&target) {
                    return Err(GraphError::Configuration(format!(
                        "agent '{}' fail branch targets unknown node '{fail}'",
                        agent.key
                    )));
                }
                Some(target)
            }
            (Some(crate::graph::ErrorHandling::FailBranch), None) => {
                return Err(GraphError::Configuration(format!(
                    "agent '{}' declares a fail branch but no fail node",
                    agent.key
                )));
            }
            _ => None,
        };

        // The successor set of the exit decision.
        let exit_fanout: Vec<String> = match after_agent_names.first() {
            Some(first) => vec![first.clone()],
            None => exit_targets.clone(),
        };

        // The after-model router's declared path map.
        let mut router_destinations: Vec<String> = tools.keys().cloned().collect();
        router_destinations.extend(sub_agents.keys().cloned());
        router_destinations.extend(exit_fanout.clone());
        path_maps.insert(router_source.clone(), router_destinations);

        // Every declared destination must exist; a miss is fatal now.
        for (source, destinations) in &path_maps {
            for destination in destinations {
                if !nodes.contains_key(destination) {
                    return Err(GraphError::Configuration(format!(
                        "router '{source}' declares unknown destination '{destination}'"
                    )));
                }
            }
        }
        for (source, targets) in &edges {
            for target in targets {
                if !nodes.contains_key(target) {
                    return Err(GraphError::Configuration(format!(
                        "edge '{source}' → '{target}' targets an unknown node"
                    )));
                }
            }
        }

        // Deferred joins: in-degree over static edges plus router fans.
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for targets in edges.values() {
            for target in targets {
                *in_degree.entry(target.as_str()).or_default() += 1;
            }
        }
        for destinations in path_maps.values() {
            for destination in destinations {
                *in_degree.entry(destination.as_str()).or_default() += 1;
            }
        }
        let deferred: HashSet<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 1)
            .map(|(name, _)| name.to_string())
            .collect();
        for name in &deferred {
            if let Some(node) = nodes.get_mut(name) {
                node.defer = true;
            }
        }

        tracing::debug!(
            agent = %agent.key,
            nodes = nodes.len(),
            tools = tools.len(),
            sub_agents = sub_agents.len(),
            "compiled subgraph"
        );

        Ok(Arc::new(CompiledGraph {
            xpert,
            agent,
            entry,
            nodes,
            edges,
            channels,
            interrupt_before,
            interrupt_after: HashSet::new(),
            tools,
            sub_agents,
            workflows,
            middlewares: Arc::new(ctx.middlewares.clone()),
            toolsets: used_toolsets,
            model,
            fallback_model,
            router_source,
            loop_entry: agent_loop_entry,
            exit_entry,
            exit_targets: exit_fanout,
            end_entry,
            fail_target,
            path_maps,
        }))
    })
}

fn declared(
    middlewares: &[Arc<dyn Middleware>],
    select: impl Fn(&crate::middleware::MiddlewareHooks) -> bool,
) -> Vec<usize> {
    middlewares
        .iter()
        .enumerate()
        .filter(|(_, mw)| select(&mw.hooks()))
        .map(|(i, _)| i)
        .collect()
}

fn validate_middlewares(middlewares: &[Arc<dyn Middleware>]) -> Result<()> {
    let mut seen = HashSet::new();
    for middleware in middlewares {
        if !seen.insert(middleware.name().to_string()) {
            return Err(GraphError::Configuration(format!(
                "duplicate middleware name '{}'",
                middleware.name()
            )));
        }
    }
    Ok(())
}

fn push_channel(channels: &mut Vec<ChannelSpec>, spec: ChannelSpec) -> Result<()> {
    if let Some(existing) = channels.iter().find(|c| c.name == spec.name) {
        if existing.reducer != spec.reducer {
            return Err(GraphError::Configuration(format!(
                "channel '{}' declared twice with different reducers",
                spec.name
            )));
        }
        return Ok(());
    }
    channels.push(spec);
    Ok(())
}

fn chain(edges: &mut HashMap<String, Vec<String>>, names: &[String], tail: Option<String>) {
    for window in names.windows(2) {
        edges
            .entry(window[0].clone())
            .or_default()
            .push(window[1].clone());
    }
    if let (Some(last), Some(tail)) = (names.last(), tail) {
        edges.entry(last.clone()).or_default().push(tail);
    }
}

fn reachable_workflows(xpert: &Xpert, roots: &[String]) -> HashMap<String, WorkflowNode> {
    let mut found: HashMap<String, WorkflowNode> = HashMap::new();
    let mut queue: Vec<String> = roots.to_vec();
    while let Some(key) = queue.pop() {
        if key == END || found.contains_key(&key) {
            continue;
        }
        let Some(wf) = xpert.workflow(&key) else {
            continue;
        };
        let successors: Vec<String> = match &wf.navigator {
            Navigator::Next { nodes } => nodes.clone(),
            Navigator::Conditional { cases, default, .. } => {
                let mut all: Vec<String> = cases.values().cloned().collect();
                if let Some(default) = default {
                    all.push(default.clone());
                }
                all
            }
        };
        found.insert(key, wf.clone());
        queue.extend(successors);
    }
    found
}

/// Render `{{name}}` placeholders from a value map
pub fn render_template(template: &str, values: &HashMap<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (name, value) in values {
        let needle = format!("{{{{{name}}}}}");
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&needle, &replacement);
    }
    rendered
}

fn workflow_task_tool(
    wf: &WorkflowNode,
    name: String,
    description: String,
    schema: Value,
) -> Arc<Tool> {
    let wf = wf.clone();
    Arc::new(Tool::from_fn(name, description, schema, move |args, _runtime| {
        let wf = wf.clone();
        async move {
            match &wf.kind {
                crate::graph::WorkflowKind::Assign { channel, value } => {
                    let mut update = HashMap::new();
                    update.insert(channel.clone(), value.clone());
                    Ok(ToolOutput::Command(
                        crate::command::Command::new().with_update(update),
                    ))
                }
                crate::graph::WorkflowKind::Answer { template } => {
                    let values: HashMap<String, Value> = match args {
                        Value::Object(map) => map.into_iter().collect(),
                        _ => HashMap::new(),
                    };
                    Ok(ToolOutput::Content(Value::String(render_template(
                        template, &values,
                    ))))
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphNode, WorkflowKind};
    use crate::middlewares::TodoListMiddleware;
    use crate::model::ScriptedModel;
    use crate::toolset::SimpleToolset;

    fn base_context() -> CompileContext {
        let mut models = ModelRegistry::new();
        models.register(Arc::new(ScriptedModel::new("mock", vec![])));
        CompileContext {
            models: Arc::new(models),
            default_model: Some("mock".to_string()),
            ..Default::default()
        }
    }

    fn add_tool() -> Arc<Tool> {
        Arc::new(Tool::from_fn(
            "add",
            "Add numbers",
            serde_json::json!({"type": "object"}),
            |_args, _rt| async move { Ok(ToolOutput::Content(serde_json::json!(0))) },
        ))
    }

    #[tokio::test]
    async fn single_agent_compiles_to_model_loop() {
        let xpert = Arc::new(Xpert::single_agent(XpertAgent::new("planner", "plan")));
        let graph = compile(xpert, "planner", Arc::new(base_context())).await.unwrap();

        assert_eq!(graph.entry, CALL_MODEL);
        assert_eq!(graph.router_source, CALL_MODEL);
        assert!(graph.nodes.contains_key(END));
        // Router path map must point at the exit chain.
        assert!(graph.path_maps[CALL_MODEL].contains(&graph.exit_entry));
    }

    #[tokio::test]
    async fn unknown_agent_is_configuration_error() {
        let xpert = Arc::new(Xpert::single_agent(XpertAgent::new("planner", "plan")));
        let err = compile(xpert, "ghost", Arc::new(base_context())).await.unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_model_is_configuration_error() {
        let mut ctx = base_context();
        ctx.default_model = None;
        let xpert = Arc::new(Xpert::single_agent(XpertAgent::new("planner", "plan")));
        let err = compile(xpert, "planner", Arc::new(ctx)).await.unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn tools_become_nodes_that_loop_back() {
        let other = Arc::new(Tool::from_fn(
            "sub",
            "Subtract",
            serde_json::json!({"type": "object"}),
            |_a, _r| async move { Ok(ToolOutput::Content(serde_json::json!(0))) },
        ));
        let mut ctx = base_context();
        ctx.toolsets = vec![Arc::new(SimpleToolset::new(
            "calc",
            "Calc",
            vec![add_tool(), other],
        ))];
        let agent = XpertAgent::new("planner", "plan").with_toolsets(vec!["calc".into()]);
        let xpert = Arc::new(Xpert::single_agent(agent));

        let graph = compile(xpert, "planner", Arc::new(ctx)).await.unwrap();
        assert!(graph.tools.contains_key("add"));
        assert!(matches!(graph.nodes["add"].kind, NodeKind::Tool(_)));
        assert_eq!(graph.edges["add"], vec![CALL_MODEL.to_string()]);
        // Two tools fan back in, so the loop entry is a deferred join.
        assert!(graph.nodes[CALL_MODEL].defer);
    }

    #[tokio::test]
    async fn sensitive_tools_register_interrupt_before() {
        let mut ctx = base_context();
        ctx.toolsets = vec![Arc::new(SimpleToolset::new("calc", "Calc", vec![add_tool()]))];
        let mut agent = XpertAgent::new("planner", "plan").with_toolsets(vec!["calc".into()]);
        agent.options.tools.insert(
            "add".to_string(),
            ToolOverride {
                sensitive: true,
                ..Default::default()
            },
        );
        let xpert = Arc::new(Xpert::single_agent(agent));
        let graph = compile(xpert, "planner", Arc::new(ctx)).await.unwrap();
        assert!(graph.interrupt_before.contains("add"));
    }

    #[tokio::test]
    async fn allow_list_filters_tools() {
        let other = Arc::new(Tool::from_fn(
            "sub",
            "Subtract",
            serde_json::json!({"type": "object"}),
            |_a, _r| async move { Ok(ToolOutput::Content(serde_json::json!(0))) },
        ));
        let mut ctx = base_context();
        ctx.toolsets = vec![Arc::new(SimpleToolset::new(
            "calc",
            "Calc",
            vec![add_tool(), other],
        ))];
        let mut agent = XpertAgent::new("planner", "plan").with_toolsets(vec!["calc".into()]);
        agent.options.available_tools = Some(vec!["add".to_string()]);
        let xpert = Arc::new(Xpert::single_agent(agent));
        let graph = compile(xpert, "planner", Arc::new(ctx)).await.unwrap();
        assert!(graph.tools.contains_key("add"));
        assert!(!graph.tools.contains_key("sub"));
    }

    #[tokio::test]
    async fn followers_compile_into_sub_agents() {
        let mut lead = XpertAgent::new("lead", "lead the team");
        lead.followers = vec!["researcher".to_string()];
        let mut xpert = Xpert::single_agent(lead);
        let mut follower = XpertAgent::new("researcher", "research");
        follower.name = "researcher".to_string();
        xpert.graph.nodes.push(GraphNode {
            key: "researcher".into(),
            kind: GraphNodeKind::Agent(follower),
        });

        let graph = compile(Arc::new(xpert), "lead", Arc::new(base_context()))
            .await
            .unwrap();
        assert!(graph.sub_agents.contains_key("researcher"));
        assert!(matches!(
            graph.nodes["researcher"].kind,
            NodeKind::SubAgent(_)
        ));
        // Sub-agent appears in the model's tool list.
        let descriptors = graph.tool_descriptors();
        assert!(descriptors.iter().any(|t| t.name() == Some("researcher")));
    }

    #[tokio::test]
    async fn follower_cycle_is_rejected() {
        let mut a = XpertAgent::new("a", "a");
        a.followers = vec!["b".to_string()];
        let mut b = XpertAgent::new("b", "b");
        b.followers = vec!["a".to_string()];
        let mut xpert = Xpert::single_agent(a);
        xpert.graph.nodes.push(GraphNode {
            key: "b".into(),
            kind: GraphNodeKind::Agent(b),
        });
        let err = compile(Arc::new(xpert), "a", Arc::new(base_context()))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn conditional_workflow_with_unknown_destination_fails() {
        let mut agent = XpertAgent::new("planner", "plan");
        agent.next = vec!["route".to_string()];
        let mut xpert = Xpert::single_agent(agent);
        let mut cases = HashMap::new();
        cases.insert("yes".to_string(), "missing_node".to_string());
        xpert.graph.nodes.push(GraphNode {
            key: "route".into(),
            kind: GraphNodeKind::Workflow(WorkflowNode {
                key: "route".into(),
                kind: WorkflowKind::Assign {
                    channel: "route".into(),
                    value: serde_json::json!("x"),
                },
                navigator: Navigator::Conditional {
                    channel: "route".into(),
                    field: None,
                    cases,
                    default: None,
                },
                is_end: false,
                channel: Some(crate::graph::ChannelDecl {
                    name: "route".into(),
                    default: Value::Null,
                }),
                task: None,
            }),
        });
        let err = compile(Arc::new(xpert), "planner", Arc::new(base_context()))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn middleware_channel_conflict_fails_compilation() {
        struct Conflicting;
        #[async_trait::async_trait]
        impl Middleware for Conflicting {
            fn name(&self) -> &str {
                "conflicting"
            }
            fn channels(&self) -> Vec<ChannelSpec> {
                // Same name as the todo middleware, different reducer.
                vec![ChannelSpec::new("todos", Reducer::LastValue, Value::Null)]
            }
        }

        let mut ctx = base_context();
        ctx.middlewares = vec![Arc::new(TodoListMiddleware), Arc::new(Conflicting)];
        let xpert = Arc::new(Xpert::single_agent(XpertAgent::new("planner", "plan")));
        let err = compile(xpert, "planner", Arc::new(ctx)).await.unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn summarize_and_title_sit_on_the_end_path() {
        let mut xpert = Xpert::single_agent(XpertAgent::new("planner", "plan"));
        xpert.options.summarize_conversation = true;
        xpert.options.title_conversation = true;
        let graph = compile(Arc::new(xpert), "planner", Arc::new(base_context()))
            .await
            .unwrap();
        assert_eq!(graph.exit_entry, SUMMARIZE_NODE);
        assert_eq!(graph.edges[SUMMARIZE_NODE], vec![TITLE_NODE.to_string()]);
        assert_eq!(graph.edges[TITLE_NODE], vec![END.to_string()]);
    }

    #[test]
    fn render_template_substitutes_placeholders() {
        let mut values = HashMap::new();
        values.insert("city".to_string(), Value::String("Paris".into()));
        values.insert("count".to_string(), serde_json::json!(3));
        assert_eq!(
            render_template("{{count}} days in {{city}}", &values),
            "3 days in Paris"
        );
    }
}
