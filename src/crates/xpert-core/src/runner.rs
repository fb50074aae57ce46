//! Cooperative scheduler
//!
//! One [`GraphRunner`] drives one compiled graph against a thread. A run is
//! a single-threaded cooperative loop: take the frontier, execute every
//! ready node (bounded intra-step parallelism, deterministic write order),
//! record tentative writes, merge them atomically into the channel store,
//! persist a checkpoint, and route to successors. `Send` directives fan a
//! step out with per-branch payloads; deferred nodes collapse fan-in back
//! to one execution.
//!
//! Interrupts raised anywhere inside a step leave the store untouched: the
//! pre-interrupt writes are parked as pending writes on the last
//! checkpoint, an interrupt record is stored, and the run finishes as
//! `INTERRUPTED`. A later run on the same thread carrying a resume command
//! re-hydrates from that checkpoint and re-enters the recorded node,
//! including nodes nested inside sub-agent namespaces.

use crate::cancel::CancelToken;
use crate::command::Command;
use crate::compile::{
    render_template, CompiledGraph, NodeKind, END, PARAMETERS_CHANNEL, TITLE_CHANNEL,
};
use crate::error::{GraphError, Result};
use crate::event::{AgentEvent, EventBus};
use crate::graph::ErrorHandling;
use crate::interrupt::{Interrupt, InterruptKind, InterruptManager, InterruptRecord};
use crate::ledger::{ExecutionClose, ExecutionLedger, Run, RunStatus, RunStore};
use crate::messages::{Message, MessageRole, ToolCall};
use crate::middleware::{wrap_model_chain, HookContext, JumpTo, ModelHandler};
use crate::model::{ModelEnv, ModelRequest, ModelResponse, TokenUsage};
use crate::retry::RetryPolicy;
use crate::state::{agent_channel_name, ChannelStore, MESSAGES_CHANNEL};
use crate::store::Store;
use crate::tool_node::execute_tool_call;
use crate::toolset::ToolRuntime;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use xpert_checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSaver, PendingWrite, ROOT_NS};

/// Synthetic frontier node used to continue after an interrupt-after gate
const CONTINUE_NODE: &str = "__continue__";

/// Shared services a runner needs
#[derive(Clone)]
pub struct RunnerServices {
    pub checkpointer: Arc<dyn CheckpointSaver>,
    pub ledger: Arc<ExecutionLedger>,
    pub runs: Arc<RunStore>,
    pub interrupts: Arc<InterruptManager>,
    pub store: Option<Arc<dyn Store>>,
}

/// Per-run execution limits
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Hard ceiling on step transitions
    pub recursion_limit: usize,

    /// Cap on parallel node executions within a step
    pub max_concurrency: Option<usize>,

    /// Run deadline in milliseconds; agent options override this
    pub timeout_ms: Option<u64>,

    /// Language for user-facing error messages
    pub language: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            recursion_limit: 25,
            max_concurrency: None,
            timeout_ms: None,
            language: None,
        }
    }
}

/// Input for one run: a chat turn and/or a resume command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    #[serde(default)]
    pub files: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
}

/// Final result of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,

    /// Snapshot of every channel at the end of the run
    pub state: HashMap<String, Value>,

    /// Agent output: structured output when declared, else the last
    /// assistant message content; the interrupt payload for paused runs
    pub output: Value,
}

#[derive(Clone)]
struct ExecEnv {
    graph: Arc<CompiledGraph>,
    services: RunnerServices,
    options: RunOptions,
    events: EventBus,
    signal: CancelToken,
    thread_id: String,
    ns: String,
    run_id: String,
    parent_execution: Option<String>,
}

#[derive(Debug, Clone)]
struct Task {
    node: String,

    /// Per-branch payload (the tool call for fan-out targets)
    payload: Option<Value>,

    /// Resume payload routed to the node that raised the interrupt
    resume: Option<Value>,

    /// Remaining node path for resumes nested in sub-agents
    sub_path: Vec<String>,

    /// Payloads matching `sub_path`
    sub_payloads: Vec<Option<Value>>,
}

impl Task {
    fn plain(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            payload: None,
            resume: None,
            sub_path: Vec::new(),
            sub_payloads: Vec::new(),
        }
    }

    fn with_payload(node: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::plain(node)
        }
    }
}

#[derive(Default)]
struct NodeOutcome {
    writes: Vec<(String, Value)>,
    jump: Option<JumpTo>,
    usage: TokenUsage,

    /// Overrides routing when present
    explicit_next: Option<Vec<Task>>,
}

enum ExecOutcome {
    Done(NodeOutcome),
    Interrupted {
        path: Vec<String>,
        payloads: Vec<Option<Value>>,
        interrupt: Interrupt,
        usage: TokenUsage,
    },
}

enum GraphResult {
    Complete {
        snapshot: HashMap<String, Value>,
        output: Value,
        checkpoint_id: Option<String>,
        usage: TokenUsage,
    },
    Interrupted {
        snapshot: HashMap<String, Value>,
        path: Vec<String>,
        payloads: Vec<Option<Value>>,
        interrupt: Interrupt,
        usage: TokenUsage,
    },
}

enum Seed {
    /// A user turn, possibly resuming a pending interrupt
    Turn {
        input: Option<String>,
        parameters: HashMap<String, Value>,
        files: Vec<Value>,
        command: Option<Command>,
        record: Option<InterruptRecord>,
    },
    /// A sub-agent task delegated through a tool call
    SubTask { input: String },
    /// Continuation of an interrupted node inside this subgraph
    ResumeSub {
        path: Vec<String>,
        payloads: Vec<Option<Value>>,
        resume: Option<Value>,
    },
}

/// Executes one compiled graph against threads
pub struct GraphRunner {
    graph: Arc<CompiledGraph>,
    services: RunnerServices,
    options: RunOptions,
}

impl GraphRunner {
    pub fn new(graph: Arc<CompiledGraph>, services: RunnerServices, options: RunOptions) -> Self {
        Self {
            graph,
            services,
            options,
        }
    }

    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    /// Register the Run row for an invocation before executing it
    ///
    /// The HTTP layer answers background run-creation requests with this
    /// row and then drives [`GraphRunner::run_prepared`] in a task.
    pub fn prepare_run(&self, thread_id: &str, input: &RunInput) -> Result<Run> {
        let run = Run::new(thread_id, serde_json::to_value(input)?);
        self.services.runs.insert(run.clone());
        Ok(run)
    }

    /// Execute one run against a thread
    pub async fn run(
        &self,
        thread_id: &str,
        input: RunInput,
        events: EventBus,
        signal: CancelToken,
    ) -> Result<RunOutcome> {
        let run = self.prepare_run(thread_id, &input)?;
        self.run_prepared(run, input, events, signal).await
    }

    /// Execute a run previously registered with [`GraphRunner::prepare_run`]
    pub async fn run_prepared(
        &self,
        run: Run,
        input: RunInput,
        events: EventBus,
        signal: CancelToken,
    ) -> Result<RunOutcome> {
        let thread_id = run.thread_id.clone();
        let run_id = run.id.clone();
        events.emit(AgentEvent::RunStart {
            run_id: run_id.clone(),
            thread_id: thread_id.clone(),
        });

        let result = self
            .drive(&thread_id, &run_id, input, events.clone(), signal)
            .await;
        self.finalize(&thread_id, &run_id, result, &events).await
    }

    async fn drive(
        &self,
        thread_id: &str,
        run_id: &str,
        input: RunInput,
        events: EventBus,
        signal: CancelToken,
    ) -> Result<GraphResult> {
        let wants_resume = input
            .command
            .as_ref()
            .map(|c| c.resume.is_some())
            .unwrap_or(false);
        let record = if wants_resume {
            match self.services.interrupts.take(thread_id) {
                Some(record) => Some(record),
                None => {
                    // Repeated resume: the interrupt was already consumed, so
                    // the command is a no-op returning the thread's state.
                    let tuple = self
                        .services
                        .checkpointer
                        .get_tuple(thread_id, ROOT_NS, None)
                        .await?;
                    return match tuple {
                        Some(tuple) => {
                            let store = ChannelStore::restore(
                                self.graph.channel_specs(),
                                &tuple.checkpoint.values,
                            )?;
                            let output = final_output(&self.graph, &store)?;
                            Ok(GraphResult::Complete {
                                snapshot: store.snapshot(),
                                output,
                                checkpoint_id: Some(tuple.checkpoint.id),
                                usage: TokenUsage::default(),
                            })
                        }
                        None => Err(GraphError::Input(format!(
                            "thread '{thread_id}' has no pending interrupt to resume"
                        ))),
                    };
                }
            }
        } else {
            None
        };

        let env = ExecEnv {
            graph: self.graph.clone(),
            services: self.services.clone(),
            options: self.options.clone(),
            events,
            signal,
            thread_id: thread_id.to_string(),
            ns: ROOT_NS.to_string(),
            run_id: run_id.to_string(),
            parent_execution: None,
        };
        let seed = Seed::Turn {
            input: input.input,
            parameters: input.parameters,
            files: input.files,
            command: input.command,
            record,
        };

        let deadline = self
            .graph
            .agent
            .options
            .timeout
            .or(self.options.timeout_ms);
        let fut = run_graph(env, seed);
        match deadline {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                Ok(result) => result,
                Err(_) => Err(GraphError::Timeout {
                    operation: "run".to_string(),
                    duration_ms: ms,
                    language: self.options.language.clone(),
                }),
            },
            None => fut.await,
        }
    }

    async fn finalize(
        &self,
        thread_id: &str,
        run_id: &str,
        result: Result<GraphResult>,
        events: &EventBus,
    ) -> Result<RunOutcome> {
        self.graph.close_toolsets().await;
        match result {
            Ok(GraphResult::Complete {
                snapshot,
                output,
                checkpoint_id,
                usage,
            }) => {
                self.services.runs.update(run_id, |run| {
                    run.status = RunStatus::Success;
                    run.outputs = Some(output.clone());
                    run.checkpoint_id = checkpoint_id.clone();
                    run.elapsed_ms =
                        Some((chrono::Utc::now() - run.created_at).num_milliseconds().max(0) as u64);
                    run.metadata = serde_json::json!({
                        "model": self.graph.model.name(),
                        "usage": usage,
                    });
                });
                if let (Some(memory), Some(store)) =
                    (&self.graph.agent.options.memory, &self.services.store)
                {
                    // Memory writes are best-effort; the run already succeeded.
                    if let Err(error) = store
                        .put(&memory.namespace, run_id, output.clone())
                        .await
                    {
                        tracing::warn!(%error, "memory write failed");
                    }
                }
                events.emit(AgentEvent::RunEnd {
                    run_id: run_id.to_string(),
                    outputs: output.clone(),
                });
                Ok(RunOutcome {
                    run: self.services.runs.get(run_id).expect("run registered"),
                    state: snapshot,
                    output,
                })
            }
            Ok(GraphResult::Interrupted {
                snapshot,
                path,
                payloads,
                interrupt,
                usage,
            }) => {
                self.services.interrupts.insert(InterruptRecord {
                    thread_id: thread_id.to_string(),
                    run_id: run_id.to_string(),
                    node: path.join("/"),
                    node_payloads: payloads,
                    kind: interrupt.kind,
                    payload: interrupt.payload.clone(),
                    pending_tool_calls: interrupt.pending_tool_calls.clone(),
                });
                self.services.runs.update(run_id, |run| {
                    run.status = RunStatus::Interrupted;
                    run.metadata = serde_json::json!({
                        "model": self.graph.model.name(),
                        "usage": usage,
                    });
                });
                events.emit(AgentEvent::Interrupt {
                    kind: interrupt.kind,
                    payload: interrupt.payload.clone(),
                });
                Ok(RunOutcome {
                    run: self.services.runs.get(run_id).expect("run registered"),
                    state: snapshot,
                    output: interrupt.payload,
                })
            }
            Err(error) => {
                let status = match &error {
                    GraphError::Aborted | GraphError::Checkpoint(_) => RunStatus::Aborted,
                    _ => RunStatus::Error,
                };
                self.services.runs.update(run_id, |run| {
                    run.status = status;
                    run.error = Some(error.to_string());
                });
                events.emit(AgentEvent::RunError {
                    run_id: run_id.to_string(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }
}

fn run_graph(
    env: ExecEnv,
    seed: Seed,
) -> futures::future::BoxFuture<'static, Result<GraphResult>> {
    Box::pin(async move {
        let tuple = env
            .services
            .checkpointer
            .get_tuple(&env.thread_id, &env.ns, None)
            .await?;
        let mut store = match &tuple {
            Some(tuple) => ChannelStore::restore(env.graph.channel_specs(), &tuple.checkpoint.values)?,
            None => ChannelStore::initialize(env.graph.channel_specs())?,
        };
        let mut last_checkpoint: Option<String> = tuple.map(|t| t.checkpoint.id);
        let mut usage_total = TokenUsage::default();
        let mut frontier: Vec<Task> = Vec::new();

        match seed {
            Seed::Turn {
                input,
                parameters,
                files,
                command,
                record,
            } => {
                let mut writes: Vec<(String, Value)> = vec![(
                    PARAMETERS_CHANNEL.to_string(),
                    serde_json::to_value(&parameters)?,
                )];
                if let Some(text) = input {
                    let mut human = Message::human(text);
                    if !files.is_empty() {
                        human.metadata = Some(serde_json::json!({"files": files}));
                    }
                    writes.push((
                        MESSAGES_CHANNEL.to_string(),
                        serde_json::json!([human.clone()]),
                    ));
                    writes.push((
                        agent_channel_name(&env.graph.agent.key),
                        serde_json::json!({"messages": [human]}),
                    ));
                }
                let resume = command.as_ref().and_then(|c| c.resume.clone());
                if let Some(command) = command {
                    if let Some(update) = command.update {
                        let mut entries: Vec<(String, Value)> = update.into_iter().collect();
                        entries.sort_by(|a, b| a.0.cmp(&b.0));
                        writes.extend(entries);
                    }
                    if let Some(calls) = command.tool_calls {
                        writes.extend(rewrite_tool_calls(&store, &env.graph.agent.key, calls)?);
                    }
                }
                store.apply(&writes)?;
                last_checkpoint =
                    Some(persist(&env, &store, last_checkpoint.take(), -1).await?);

                match record {
                    Some(record) => {
                        let mut path: Vec<String> =
                            record.node.split('/').map(String::from).collect();
                        let first = path.remove(0);
                        let mut payloads = record.node_payloads.clone();
                        let payload = if payloads.is_empty() {
                            None
                        } else {
                            payloads.remove(0)
                        };
                        frontier.push(Task {
                            node: first,
                            payload,
                            resume,
                            sub_path: path,
                            sub_payloads: payloads,
                        });
                    }
                    None => frontier.push(Task::plain(env.graph.entry.clone())),
                }
            }
            Seed::SubTask { input } => {
                let human = Message::human(input);
                let writes = vec![
                    (
                        MESSAGES_CHANNEL.to_string(),
                        serde_json::json!([human.clone()]),
                    ),
                    (
                        agent_channel_name(&env.graph.agent.key),
                        serde_json::json!({"messages": [human]}),
                    ),
                ];
                store.apply(&writes)?;
                last_checkpoint =
                    Some(persist(&env, &store, last_checkpoint.take(), -1).await?);
                frontier.push(Task::plain(env.graph.entry.clone()));
            }
            Seed::ResumeSub {
                mut path,
                mut payloads,
                resume,
            } => {
                if path.is_empty() {
                    return Err(GraphError::Input(
                        "resume path exhausted before reaching the interrupted node".to_string(),
                    ));
                }
                let first = path.remove(0);
                let payload = if payloads.is_empty() {
                    None
                } else {
                    payloads.remove(0)
                };
                frontier.push(Task {
                    node: first,
                    payload,
                    resume,
                    sub_path: path,
                    sub_payloads: payloads,
                });
            }
        }

        let mut step: i64 = 0;
        while !frontier.is_empty() {
            if env.signal.is_cancelled() {
                return Err(GraphError::Aborted);
            }
            step += 1;
            if step as usize > env.options.recursion_limit {
                return Err(GraphError::RecursionLimit {
                    limit: env.options.recursion_limit,
                    language: env.options.language.clone(),
                });
            }

            let tasks = std::mem::take(&mut frontier);

            // Confirmation gates fire before their node runs.
            for task in &tasks {
                if env.graph.interrupt_before.contains(&task.node) && task.resume.is_none() {
                    let pending: Vec<ToolCall> = task
                        .payload
                        .as_ref()
                        .and_then(|p| serde_json::from_value(p.clone()).ok())
                        .map(|call| vec![call])
                        .unwrap_or_default();
                    let interrupt = Interrupt::new(
                        InterruptKind::Confirm,
                        serde_json::json!({"node": task.node, "toolCalls": pending}),
                        pending,
                    );
                    return finish_interrupted(
                        &env,
                        &store,
                        &last_checkpoint,
                        Vec::new(),
                        vec![task.node.clone()],
                        vec![task.payload.clone()],
                        interrupt,
                        usage_total,
                    )
                    .await;
                }
            }

            let limit = env
                .options
                .max_concurrency
                .unwrap_or_else(|| tasks.len().max(1))
                .max(1);
            let step_store = store.clone();
            let futures: Vec<futures::future::BoxFuture<'_, Result<ExecOutcome>>> = tasks
                .iter()
                .map(|task| Box::pin(execute_node(&env, &step_store, task)) as futures::future::BoxFuture<'_, Result<ExecOutcome>>)
                .collect();
            let results: Vec<Result<ExecOutcome>> =
                stream::iter(futures).buffered(limit).collect().await;

            let mut outcomes: Vec<(Task, NodeOutcome)> = Vec::new();
            let mut pending: Vec<PendingWrite> = Vec::new();
            for (task, result) in tasks.into_iter().zip(results) {
                match result? {
                    ExecOutcome::Done(outcome) => {
                        usage_total.add(outcome.usage);
                        for (channel, value) in &outcome.writes {
                            pending.push((
                                format!("{step}:{}", task.node),
                                channel.clone(),
                                value.clone(),
                            ));
                        }
                        outcomes.push((task, outcome));
                    }
                    ExecOutcome::Interrupted {
                        path,
                        payloads,
                        interrupt,
                        usage,
                    } => {
                        usage_total.add(usage);
                        // Writes from nodes that completed earlier in this
                        // step stay pending; nothing is merged.
                        return finish_interrupted(
                            &env,
                            &store,
                            &last_checkpoint,
                            pending,
                            path,
                            payloads,
                            interrupt,
                            usage_total,
                        )
                        .await;
                    }
                }
            }

            // Barrier: record tentative writes, merge, checkpoint.
            if let Some(checkpoint_id) = &last_checkpoint {
                if !pending.is_empty() {
                    env.services
                        .checkpointer
                        .put_writes(&env.thread_id, &env.ns, checkpoint_id, pending.clone())
                        .await?;
                }
            }
            let all_writes: Vec<(String, Value)> = pending
                .iter()
                .map(|(_, channel, value)| (channel.clone(), value.clone()))
                .collect();
            if env.signal.is_cancelled() {
                // Drop the step atomically; the previous checkpoint stays valid.
                return Err(GraphError::Aborted);
            }
            store.apply(&all_writes)?;
            last_checkpoint = Some(persist(&env, &store, last_checkpoint.take(), step).await?);

            // Route to successors; deferred joins collapse duplicate entries.
            let mut next: Vec<Task> = Vec::new();
            for (task, outcome) in &outcomes {
                for successor in compute_successors(&env, &store, task, outcome)? {
                    if successor.node == END {
                        continue;
                    }
                    let plain = successor.payload.is_none();
                    let duplicate = plain
                        && next
                            .iter()
                            .any(|t| t.node == successor.node && t.payload.is_none());
                    if !duplicate {
                        next.push(successor);
                    }
                }
            }

            // Interrupt-after gates pause before successors are scheduled.
            if let Some((task, _)) = outcomes.iter().find(|(task, _)| {
                env.graph.interrupt_after.contains(&task.node) && task.resume.is_none()
            }) {
                let interrupt = Interrupt::new(
                    InterruptKind::Confirm,
                    serde_json::json!({"node": task.node, "after": true}),
                    Vec::new(),
                );
                let continuation = serde_json::to_value(
                    next.iter()
                        .map(|t| serde_json::json!({"node": t.node, "payload": t.payload}))
                        .collect::<Vec<_>>(),
                )?;
                return finish_interrupted(
                    &env,
                    &store,
                    &last_checkpoint,
                    Vec::new(),
                    vec![CONTINUE_NODE.to_string()],
                    vec![Some(continuation)],
                    interrupt,
                    usage_total,
                )
                .await;
            }

            frontier = next;
        }

        let snapshot = store.snapshot();
        let output = final_output(&env.graph, &store)?;
        Ok(GraphResult::Complete {
            snapshot,
            output,
            checkpoint_id: last_checkpoint,
            usage: usage_total,
        })
    })
}

async fn persist(
    env: &ExecEnv,
    store: &ChannelStore,
    parent: Option<String>,
    step: i64,
) -> Result<String> {
    let checkpoint = Checkpoint::new(
        env.thread_id.clone(),
        env.ns.clone(),
        parent,
        store.snapshot(),
    );
    let reference = env
        .services
        .checkpointer
        .put(
            checkpoint,
            CheckpointMetadata::new()
                .with_step(step)
                .with_run_id(env.run_id.clone()),
        )
        .await?;
    env.events.emit(AgentEvent::Checkpoint {
        checkpoint_id: reference.id.clone(),
    });
    Ok(reference.id)
}

#[allow(clippy::too_many_arguments)]
async fn finish_interrupted(
    env: &ExecEnv,
    store: &ChannelStore,
    last_checkpoint: &Option<String>,
    pending: Vec<PendingWrite>,
    path: Vec<String>,
    payloads: Vec<Option<Value>>,
    interrupt: Interrupt,
    usage: TokenUsage,
) -> Result<GraphResult> {
    if let Some(checkpoint_id) = last_checkpoint {
        env.services
            .checkpointer
            .put_writes(&env.thread_id, &env.ns, checkpoint_id, pending)
            .await?;
    }
    Ok(GraphResult::Interrupted {
        snapshot: store.snapshot(),
        path,
        payloads,
        interrupt,
        usage,
    })
}

fn rewrite_tool_calls(
    store: &ChannelStore,
    agent_key: &str,
    calls: Vec<ToolCall>,
) -> Result<Vec<(String, Value)>> {
    let channel = store.agent_channel(agent_key)?;
    let Some(last_ai) = channel.last_assistant() else {
        return Err(GraphError::Input(
            "cannot rewrite tool calls: no assistant message in the channel".to_string(),
        ));
    };
    let mut fresh = last_ai.clone();
    fresh.tool_calls = Some(calls);
    Ok(vec![
        (
            MESSAGES_CHANNEL.to_string(),
            serde_json::json!([fresh.clone()]),
        ),
        (
            agent_channel_name(agent_key),
            serde_json::json!({"messages": [fresh]}),
        ),
    ])
}

fn final_output(graph: &CompiledGraph, store: &ChannelStore) -> Result<Value> {
    let channel = store.agent_channel(&graph.agent.key)?;
    if let Some(output) = &channel.output {
        return Ok(output.clone());
    }
    Ok(channel
        .last_assistant()
        .map(|m| Value::String(m.text()))
        .unwrap_or(Value::Null))
}

async fn execute_node(env: &ExecEnv, store: &ChannelStore, task: &Task) -> Result<ExecOutcome> {
    if env.signal.is_cancelled() {
        return Err(GraphError::Aborted);
    }

    if task.node == CONTINUE_NODE {
        // Continuation after an interrupt-after gate: the payload carries
        // the successor set computed before the pause.
        let tasks: Vec<Task> = task
            .payload
            .as_ref()
            .and_then(|p| p.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .map(|entry| Task {
                node: entry["node"].as_str().unwrap_or_default().to_string(),
                payload: match &entry["payload"] {
                    Value::Null => None,
                    other => Some(other.clone()),
                },
                resume: None,
                sub_path: Vec::new(),
                sub_payloads: Vec::new(),
            })
            .collect();
        return Ok(ExecOutcome::Done(NodeOutcome {
            explicit_next: Some(tasks),
            ..Default::default()
        }));
    }

    let node = env.graph.nodes.get(&task.node).ok_or_else(|| {
        GraphError::Input(format!("frontier references unknown node '{}'", task.node))
    })?;

    if let NodeKind::SubAgent(name) = node.kind.clone() {
        // Sub-agents surface their own (possibly nested) interrupt paths.
        return run_sub_agent(env, task, &name).await;
    }

    let result = match node.kind.clone() {
        NodeKind::BeforeAgent(i) | NodeKind::BeforeModel(i) | NodeKind::AfterModel(i)
        | NodeKind::AfterAgent(i) => run_hook(env, store, task, &node.kind, i).await,
        NodeKind::CallModel => run_call_model(env, store).await,
        NodeKind::Tool(name) => run_tool_node(env, store, task, &name).await,
        NodeKind::Workflow(key) => run_workflow(env, store, &key),
        NodeKind::Summarize => run_summarize(env, store).await,
        NodeKind::Title => run_title(env, store).await,
        NodeKind::SubAgent(_) => unreachable!("handled above"),
        NodeKind::End => Ok(NodeOutcome::default()),
    };

    match result {
        Ok(outcome) => Ok(ExecOutcome::Done(outcome)),
        Err(GraphError::Interrupt(interrupt)) => Ok(ExecOutcome::Interrupted {
            path: vec![task.node.clone()],
            payloads: vec![task.payload.clone()],
            interrupt,
            usage: TokenUsage::default(),
        }),
        Err(other) => Err(other),
    }
}

async fn run_hook(
    env: &ExecEnv,
    store: &ChannelStore,
    task: &Task,
    kind: &NodeKind,
    index: usize,
) -> Result<NodeOutcome> {
    let middleware = env.graph.middlewares[index].clone();
    let ctx = HookContext {
        agent_key: env.graph.agent.key.clone(),
        thread_id: env.thread_id.clone(),
        run_id: env.run_id.clone(),
        channel: store.agent_channel(&env.graph.agent.key)?,
        state: store
            .read(&agent_channel_name(&env.graph.agent.key))?
            .clone(),
        resume: task.resume.clone(),
        store: env.services.store.clone(),
        events: env.events.clone(),
        signal: env.signal.clone(),
        language: env.options.language.clone(),
    };
    let update = match kind {
        NodeKind::BeforeAgent(_) => middleware.before_agent(&ctx).await?,
        NodeKind::BeforeModel(_) => middleware.before_model(&ctx).await?,
        NodeKind::AfterModel(_) => middleware.after_model(&ctx).await?,
        NodeKind::AfterAgent(_) => middleware.after_agent(&ctx).await?,
        _ => None,
    };
    let mut outcome = NodeOutcome::default();
    if let Some(update) = update {
        let mut writes: Vec<(String, Value)> = update.update.into_iter().collect();
        writes.sort_by(|a, b| a.0.cmp(&b.0));
        outcome.writes = writes;
        outcome.jump = update.jump_to;
    }
    Ok(outcome)
}

fn core_model_handler(
    graph: Arc<CompiledGraph>,
    events: EventBus,
    signal: CancelToken,
) -> ModelHandler {
    Arc::new(move |request: ModelRequest| {
        let graph = graph.clone();
        let env = ModelEnv {
            events: events.clone(),
            signal: signal.clone(),
        };
        Box::pin(async move {
            let policy = graph
                .agent
                .options
                .retry
                .clone()
                .unwrap_or_else(RetryPolicy::none);
            let mut attempt = 0u32;
            let primary_error = loop {
                attempt += 1;
                match graph.model.generate(request.clone(), &env).await {
                    Ok(response) => return Ok(response),
                    Err(error)
                        if error.is_interrupt() || matches!(error, GraphError::Aborted) =>
                    {
                        return Err(error)
                    }
                    Err(error) => {
                        if policy.should_retry(attempt) {
                            tracing::debug!(%error, attempt, "model call failed, retrying");
                            tokio::time::sleep(policy.delay(attempt)).await;
                            continue;
                        }
                        break error;
                    }
                }
            };
            if let Some(fallback) = &graph.fallback_model {
                tracing::warn!(
                    error = %primary_error,
                    fallback = fallback.name(),
                    "primary model exhausted retries, using fallback"
                );
                return fallback.generate(request, &env).await;
            }
            Err(primary_error)
        })
    })
}

async fn run_call_model(env: &ExecEnv, store: &ChannelStore) -> Result<NodeOutcome> {
    let agent = &env.graph.agent;
    let channel = store.agent_channel(&agent.key)?;
    let parameters: HashMap<String, Value> = match store.read(PARAMETERS_CHANNEL)? {
        Value::Object(map) => map.clone().into_iter().collect(),
        _ => HashMap::new(),
    };

    let mut system = render_template(&agent.prompt, &parameters);
    if let Some(summary) = &channel.summary {
        system.push_str(&format!("\n\nConversation summary so far:\n{summary}"));
    }
    if !agent.output_variables.is_empty() {
        let fields: Vec<String> = agent
            .output_variables
            .iter()
            .map(|v| {
                format!(
                    "  \"{}\" ({}){}",
                    v.name,
                    v.var_type,
                    v.description
                        .as_ref()
                        .map(|d| format!(": {d}"))
                        .unwrap_or_default()
                )
            })
            .collect();
        system.push_str(&format!(
            "\n\nRespond with a single JSON object containing exactly these fields:\n{}",
            fields.join("\n")
        ));
    }

    // With history disabled only the current human turn reaches the model.
    let messages: Vec<Message> = if agent.options.disable_message_history {
        channel
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Human)
            .cloned()
            .into_iter()
            .collect()
    } else {
        channel
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .cloned()
            .collect()
    };

    let request = ModelRequest {
        model: env.graph.model.name().to_string(),
        agent_key: agent.key.clone(),
        system: Some(system),
        messages,
        tools: env.graph.tool_descriptors(),
        tool_choice: None,
        state: store
            .read(&agent_channel_name(&agent.key))?
            .clone(),
        language: env.options.language.clone(),
    };

    let execution_id = env.services.ledger.open(
        &env.run_id,
        &env.thread_id,
        &agent.key,
        &env.ns,
        env.parent_execution.clone(),
        None,
        serde_json::json!({"messages": request.messages.len()}),
    );
    env.events.emit(AgentEvent::AgentStart {
        execution_id: execution_id.clone(),
        agent_key: agent.key.clone(),
    });

    let core = core_model_handler(env.graph.clone(), env.events.clone(), env.signal.clone());
    let result = wrap_model_chain(env.graph.middlewares.clone(), request, core).await;

    let (message, usage) = match result {
        Ok(ModelResponse { mut message, usage }) => {
            message.ensure_id();
            (message, usage)
        }
        Err(error) if error.is_interrupt() || matches!(error, GraphError::Aborted) => {
            env.services.ledger.close(
                &execution_id,
                ExecutionClose {
                    status: Some(RunStatus::Interrupted),
                    ..Default::default()
                },
            );
            return Err(error);
        }
        Err(error) => {
            return handle_model_error(env, store, &execution_id, error).await;
        }
    };

    let mut writes: Vec<(String, Value)> = Vec::new();
    let mut channel_update = serde_json::json!({"messages": [message]});
    if !agent.output_variables.is_empty() {
        if let Ok(parsed) = serde_json::from_str::<Value>(&message.text()) {
            channel_update["output"] = parsed;
        }
    }
    writes.push((agent_channel_name(&agent.key), channel_update));
    writes.push((
        MESSAGES_CHANNEL.to_string(),
        serde_json::json!([message]),
    ));

    let row = env.services.ledger.close(
        &execution_id,
        ExecutionClose {
            status: Some(RunStatus::Success),
            outputs: Some(Value::String(message.text())),
            metadata: Some(serde_json::json!({
                "model": env.graph.model.name(),
                "usage": usage,
            })),
            ..Default::default()
        },
    );
    if let Some(row) = row {
        env.events.emit(AgentEvent::AgentEnd { execution: row });
    }

    Ok(NodeOutcome {
        writes,
        usage,
        ..Default::default()
    })
}

async fn handle_model_error(
    env: &ExecEnv,
    _store: &ChannelStore,
    execution_id: &str,
    error: GraphError,
) -> Result<NodeOutcome> {
    let agent = &env.graph.agent;
    match &agent.options.error_handling {
        Some(ErrorHandling::DefaultValue { content }) => {
            env.services.ledger.close(
                execution_id,
                ExecutionClose {
                    status: Some(RunStatus::Success),
                    error: Some(error.to_string()),
                    outputs: Some(Value::String(content.clone())),
                    ..Default::default()
                },
            );
            let message = Message::assistant(content.clone());
            Ok(NodeOutcome {
                writes: vec![
                    (
                        agent_channel_name(&agent.key),
                        serde_json::json!({"messages": [message], "error": error.to_string()}),
                    ),
                    (
                        MESSAGES_CHANNEL.to_string(),
                        serde_json::json!([message]),
                    ),
                ],
                ..Default::default()
            })
        }
        Some(ErrorHandling::FailBranch) => {
            env.services.ledger.close(
                execution_id,
                ExecutionClose {
                    status: Some(RunStatus::Error),
                    error: Some(error.to_string()),
                    ..Default::default()
                },
            );
            let fail_target = env
                .graph
                .fail_target
                .clone()
                .expect("fail branch resolved at compile time");
            Ok(NodeOutcome {
                writes: vec![(
                    agent_channel_name(&agent.key),
                    serde_json::json!({"error": error.to_string()}),
                )],
                explicit_next: Some(vec![Task::plain(fail_target)]),
                ..Default::default()
            })
        }
        None => {
            env.services.ledger.close(
                execution_id,
                ExecutionClose {
                    status: Some(RunStatus::Error),
                    error: Some(error.to_string()),
                    ..Default::default()
                },
            );
            Err(GraphError::Model {
                agent: agent.key.clone(),
                error: error.to_string(),
            })
        }
    }
}

fn tool_runtime(env: &ExecEnv, store: &ChannelStore, toolset_id: Option<String>) -> Result<ToolRuntime> {
    let mut vars = HashMap::new();
    vars.insert(
        "thread_id".to_string(),
        Value::String(env.thread_id.clone()),
    );
    vars.insert("run_id".to_string(), Value::String(env.run_id.clone()));
    if let Some(language) = &env.options.language {
        vars.insert("language".to_string(), Value::String(language.clone()));
    }
    Ok(ToolRuntime {
        toolset_id,
        agent_key: env.graph.agent.key.clone(),
        thread_id: env.thread_id.clone(),
        run_id: env.run_id.clone(),
        env: vars,
        store: env.services.store.clone(),
        signal: env.signal.clone(),
        events: env.events.clone(),
        state: store
            .read(&agent_channel_name(&env.graph.agent.key))?
            .clone(),
    })
}

async fn run_tool_node(
    env: &ExecEnv,
    store: &ChannelStore,
    task: &Task,
    name: &str,
) -> Result<NodeOutcome> {
    let compiled = env
        .graph
        .tools
        .get(name)
        .ok_or_else(|| GraphError::Input(format!("unknown tool node '{name}'")))?;

    // Fan-out delivers the call as the branch payload; a bare entry falls
    // back to the last assistant message's matching calls.
    let calls: Vec<ToolCall> = match &task.payload {
        Some(payload) => vec![serde_json::from_value(payload.clone())?],
        None => store
            .agent_channel(&env.graph.agent.key)?
            .last_assistant()
            .map(|m| {
                m.tool_calls()
                    .iter()
                    .filter(|c| c.name == name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default(),
    };

    let mut outcome = NodeOutcome::default();
    for call in calls {
        let execution_id = env.services.ledger.open(
            &env.run_id,
            &env.thread_id,
            &call.name,
            &env.ns,
            env.parent_execution.clone(),
            Some(env.graph.agent.key.clone()),
            call.args.clone(),
        );
        let runtime = tool_runtime(env, store, compiled.toolset_id.clone())?;
        let result = execute_tool_call(
            env.graph.middlewares.clone(),
            compiled,
            call.clone(),
            runtime,
            task.resume.clone(),
        )
        .await;
        match result {
            Ok(output) => {
                env.services.ledger.close(
                    &execution_id,
                    ExecutionClose {
                        status: Some(RunStatus::Success),
                        outputs: Some(Value::String(
                            output
                                .messages
                                .first()
                                .map(|m| m.text())
                                .unwrap_or_default(),
                        )),
                        ..Default::default()
                    },
                );
                for message in &output.messages {
                    outcome.writes.push((
                        agent_channel_name(&env.graph.agent.key),
                        serde_json::json!({"messages": [message]}),
                    ));
                    outcome
                        .writes
                        .push((MESSAGES_CHANNEL.to_string(), serde_json::json!([message])));
                }
                outcome.writes.extend(output.updates);
            }
            Err(error) => {
                env.services.ledger.close(
                    &execution_id,
                    ExecutionClose {
                        status: Some(if error.is_interrupt() {
                            RunStatus::Interrupted
                        } else {
                            RunStatus::Error
                        }),
                        error: Some(error.to_string()),
                        ..Default::default()
                    },
                );
                return Err(error);
            }
        }
    }
    Ok(outcome)
}

async fn run_sub_agent(env: &ExecEnv, task: &Task, name: &str) -> Result<ExecOutcome> {
    let sub = env
        .graph
        .sub_agents
        .get(name)
        .ok_or_else(|| GraphError::Input(format!("unknown sub-agent '{name}'")))?
        .clone();

    let call: Option<ToolCall> = task
        .payload
        .as_ref()
        .and_then(|p| serde_json::from_value(p.clone()).ok());

    let sub_ns = if env.ns.is_empty() {
        name.to_string()
    } else {
        format!("{}.{name}", env.ns)
    };

    let mut child_run = Run::new(
        env.thread_id.clone(),
        call.as_ref()
            .map(|c| c.args.clone())
            .unwrap_or(Value::Null),
    );
    child_run.parent_id = Some(env.run_id.clone());
    child_run.predecessor = Some(env.graph.agent.key.clone());
    child_run.checkpoint_ns = sub_ns.clone();
    let child_run_id = child_run.id.clone();
    env.services.runs.insert(child_run);

    let execution_id = env.services.ledger.open(
        &child_run_id,
        &env.thread_id,
        &sub.agent.key,
        &sub_ns,
        env.parent_execution.clone(),
        Some(env.graph.agent.key.clone()),
        call.as_ref()
            .map(|c| c.args.clone())
            .unwrap_or(Value::Null),
    );
    env.events.emit(AgentEvent::AgentStart {
        execution_id: execution_id.clone(),
        agent_key: sub.agent.key.clone(),
    });

    let seed = if !task.sub_path.is_empty() {
        Seed::ResumeSub {
            path: task.sub_path.clone(),
            payloads: task.sub_payloads.clone(),
            resume: task.resume.clone(),
        }
    } else {
        let input = call
            .as_ref()
            .and_then(|c| c.args.get("input"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Seed::SubTask { input }
    };

    let sub_env = ExecEnv {
        graph: sub.clone(),
        services: env.services.clone(),
        options: env.options.clone(),
        events: env.events.clone(),
        signal: env.signal.clone(),
        thread_id: env.thread_id.clone(),
        ns: sub_ns,
        run_id: child_run_id.clone(),
        parent_execution: Some(execution_id.clone()),
    };

    match run_graph(sub_env, seed).await? {
        GraphResult::Complete {
            output,
            usage,
            checkpoint_id,
            ..
        } => {
            env.services.runs.update(&child_run_id, |run| {
                run.status = RunStatus::Success;
                run.outputs = Some(output.clone());
                run.checkpoint_id = checkpoint_id.clone();
            });
            let row = env.services.ledger.close(
                &execution_id,
                ExecutionClose {
                    status: Some(RunStatus::Success),
                    outputs: Some(output.clone()),
                    checkpoint_id,
                    metadata: Some(serde_json::json!({"usage": usage})),
                    ..Default::default()
                },
            );
            if let Some(row) = row {
                env.events.emit(AgentEvent::AgentEnd { execution: row });
            }

            let content = match &output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let call_id = call
                .map(|c| c.id)
                .unwrap_or_else(|| format!("{name}-result"));
            let message = Message::tool(content, call_id).with_name(name.to_string());
            Ok(ExecOutcome::Done(NodeOutcome {
                writes: vec![
                    (
                        agent_channel_name(&env.graph.agent.key),
                        serde_json::json!({"messages": [message]}),
                    ),
                    (
                        MESSAGES_CHANNEL.to_string(),
                        serde_json::json!([message]),
                    ),
                ],
                usage,
                ..Default::default()
            }))
        }
        GraphResult::Interrupted {
            path,
            payloads,
            interrupt,
            usage,
            ..
        } => {
            env.services.runs.update(&child_run_id, |run| {
                run.status = RunStatus::Interrupted;
            });
            env.services.ledger.close(
                &execution_id,
                ExecutionClose {
                    status: Some(RunStatus::Interrupted),
                    ..Default::default()
                },
            );
            let mut full_path = vec![name.to_string()];
            full_path.extend(path);
            let mut full_payloads = vec![task.payload.clone()];
            full_payloads.extend(payloads);
            Ok(ExecOutcome::Interrupted {
                path: full_path,
                payloads: full_payloads,
                interrupt,
                usage,
            })
        }
    }
}

fn run_workflow(env: &ExecEnv, store: &ChannelStore, key: &str) -> Result<NodeOutcome> {
    let wf = env
        .graph
        .workflows
        .get(key)
        .ok_or_else(|| GraphError::Input(format!("unknown workflow node '{key}'")))?;
    let mut outcome = NodeOutcome::default();
    match &wf.kind {
        crate::graph::WorkflowKind::Assign { channel, value } => {
            outcome.writes.push((channel.clone(), value.clone()));
        }
        crate::graph::WorkflowKind::Answer { template } => {
            let values: HashMap<String, Value> = store.snapshot().into_iter().collect();
            let message = Message::assistant(render_template(template, &values));
            outcome.writes.push((
                agent_channel_name(&env.graph.agent.key),
                serde_json::json!({"messages": [message]}),
            ));
            outcome
                .writes
                .push((MESSAGES_CHANNEL.to_string(), serde_json::json!([message])));
        }
    }
    Ok(outcome)
}

async fn run_summarize(env: &ExecEnv, store: &ChannelStore) -> Result<NodeOutcome> {
    let messages = store.messages()?;
    let transcript: String = messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.text()))
        .collect::<Vec<_>>()
        .join("\n");
    let request = ModelRequest {
        model: env.graph.model.name().to_string(),
        agent_key: env.graph.agent.key.clone(),
        system: Some("Summarize the conversation in a short paragraph.".to_string()),
        messages: vec![Message::human(transcript)],
        tools: vec![],
        tool_choice: None,
        state: Value::Null,
        language: env.options.language.clone(),
    };
    let response = env
        .graph
        .model
        .generate(
            request,
            &ModelEnv {
                events: EventBus::sink(),
                signal: env.signal.clone(),
            },
        )
        .await?;
    Ok(NodeOutcome {
        writes: vec![(
            agent_channel_name(&env.graph.agent.key),
            serde_json::json!({"summary": response.message.text()}),
        )],
        usage: response.usage,
        ..Default::default()
    })
}

async fn run_title(env: &ExecEnv, store: &ChannelStore) -> Result<NodeOutcome> {
    let messages = store.messages()?;
    let transcript: String = messages
        .iter()
        .take(6)
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join("\n");
    let request = ModelRequest {
        model: env.graph.model.name().to_string(),
        agent_key: env.graph.agent.key.clone(),
        system: Some("Produce a short title (max 8 words) for this conversation.".to_string()),
        messages: vec![Message::human(transcript)],
        tools: vec![],
        tool_choice: None,
        state: Value::Null,
        language: env.options.language.clone(),
    };
    let response = env
        .graph
        .model
        .generate(
            request,
            &ModelEnv {
                events: EventBus::sink(),
                signal: env.signal.clone(),
            },
        )
        .await?;
    Ok(NodeOutcome {
        writes: vec![(
            TITLE_CHANNEL.to_string(),
            Value::String(response.message.text()),
        )],
        usage: response.usage,
        ..Default::default()
    })
}

fn compute_successors(
    env: &ExecEnv,
    store: &ChannelStore,
    task: &Task,
    outcome: &NodeOutcome,
) -> Result<Vec<Task>> {
    if let Some(next) = &outcome.explicit_next {
        return Ok(next.clone());
    }
    if let Some(jump) = outcome.jump {
        return match jump {
            JumpTo::Model => Ok(vec![Task::plain(env.graph.loop_entry.clone())]),
            JumpTo::Tools => route_tool_fanout(env, store),
            JumpTo::End => Ok(exit_tasks(env)),
        };
    }
    if task.node == env.graph.router_source {
        return route_after_model(env, store);
    }
    if let Some(node) = env.graph.nodes.get(&task.node) {
        if let NodeKind::Workflow(key) = &node.kind {
            let wf = &env.graph.workflows[key];
            if let crate::graph::Navigator::Conditional {
                channel,
                field,
                cases,
                default,
            } = &wf.navigator
            {
                let value = store.read(channel)?;
                let discriminant = match field {
                    Some(field) => value.get(field).cloned().unwrap_or(Value::Null),
                    None => value.clone(),
                };
                let key_str = match &discriminant {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let target = cases
                    .get(&key_str)
                    .cloned()
                    .or_else(|| default.clone())
                    .ok_or_else(|| {
                        GraphError::Input(format!(
                            "workflow '{key}' has no route for value '{key_str}'"
                        ))
                    })?;
                let target = if target == END {
                    // is_end and bare END both land on the end path.
                    env.graph.end_entry.clone()
                } else {
                    target
                };
                return Ok(vec![Task::plain(target)]);
            }
        }
    }
    Ok(env
        .graph
        .edges
        .get(&task.node)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(Task::plain)
        .collect())
}

fn exit_tasks(env: &ExecEnv) -> Vec<Task> {
    env.graph
        .exit_targets
        .iter()
        .map(|target| Task::plain(target.clone()))
        .collect()
}

fn route_after_model(env: &ExecEnv, store: &ChannelStore) -> Result<Vec<Task>> {
    let channel = store.agent_channel(&env.graph.agent.key)?;
    let Some(last_ai) = channel.last_assistant() else {
        return Ok(exit_tasks(env));
    };
    if last_ai.tool_calls().is_empty() {
        return Ok(exit_tasks(env));
    }
    route_tool_fanout(env, store)
}

fn route_tool_fanout(env: &ExecEnv, store: &ChannelStore) -> Result<Vec<Task>> {
    let channel = store.agent_channel(&env.graph.agent.key)?;
    let Some(last_ai) = channel.last_assistant() else {
        return Ok(exit_tasks(env));
    };
    let mut tasks = Vec::new();
    for call in last_ai.tool_calls() {
        if !env.graph.tools.contains_key(&call.name)
            && !env.graph.sub_agents.contains_key(&call.name)
        {
            return Err(GraphError::Input(format!(
                "model requested unknown tool '{}'",
                call.name
            )));
        }
        tasks.push(Task::with_payload(
            call.name.clone(),
            serde_json::to_value(call)?,
        ));
    }
    Ok(tasks)
}
