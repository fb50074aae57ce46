//! Streaming event bus
//!
//! Every run owns one bus. Nodes, the model layer and the tool node emit
//! typed [`AgentEvent`]s; the transport side (SSE in the server crate)
//! consumes the receiver. Events carry hierarchical tag paths checked
//! against a mute/unmute policy before emission: an event is dropped when
//! some prefix of its tag path is muted and no more specific unmute
//! overrides it.

use crate::interrupt::InterruptKind;
use crate::ledger::ExecutionRow;
use crate::messages::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    #[serde(rename = "on_run_start")]
    RunStart { run_id: String, thread_id: String },

    #[serde(rename = "on_run_end")]
    RunEnd { run_id: String, outputs: Value },

    #[serde(rename = "on_run_error")]
    RunError { run_id: String, error: String },

    #[serde(rename = "on_agent_start")]
    AgentStart {
        execution_id: String,
        agent_key: String,
    },

    #[serde(rename = "on_agent_end")]
    AgentEnd { execution: ExecutionRow },

    #[serde(rename = "on_chat_message_chunk")]
    ChatMessageChunk {
        agent_key: String,
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    #[serde(rename = "on_tool_start")]
    ToolStart { call: ToolCall },

    #[serde(rename = "on_tool_end")]
    ToolEnd {
        call_id: String,
        name: String,
        output: Value,
    },

    #[serde(rename = "on_tool_error")]
    ToolError {
        call_id: String,
        name: String,
        error: String,
    },

    #[serde(rename = "on_interrupt")]
    Interrupt {
        kind: InterruptKind,
        payload: Value,
    },

    #[serde(rename = "on_client_effect")]
    ClientEffect { payload: Value },

    #[serde(rename = "on_checkpoint")]
    Checkpoint { checkpoint_id: String },
}

impl AgentEvent {
    /// Hierarchical tag path used by the mute policy
    pub fn tags(&self) -> Vec<String> {
        match self {
            Self::RunStart { .. } => vec!["run".into(), "start".into()],
            Self::RunEnd { .. } => vec!["run".into(), "end".into()],
            Self::RunError { .. } => vec!["run".into(), "error".into()],
            Self::AgentStart { agent_key, .. } => {
                vec!["agent".into(), agent_key.clone(), "start".into()]
            }
            Self::AgentEnd { execution } => {
                vec!["agent".into(), execution.agent_key.clone(), "end".into()]
            }
            Self::ChatMessageChunk { agent_key, .. } => {
                vec!["agent".into(), agent_key.clone(), "chunk".into()]
            }
            Self::ToolStart { call } => vec!["tool".into(), call.name.clone(), "start".into()],
            Self::ToolEnd { name, .. } => vec!["tool".into(), name.clone(), "end".into()],
            Self::ToolError { name, .. } => vec!["tool".into(), name.clone(), "error".into()],
            Self::Interrupt { .. } => vec!["interrupt".into()],
            Self::ClientEffect { .. } => vec!["client_effect".into()],
            Self::Checkpoint { .. } => vec!["checkpoint".into()],
        }
    }
}

/// Tag-path filter applied before emission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutePolicy {
    #[serde(default)]
    pub mute: Vec<Vec<String>>,

    #[serde(default)]
    pub unmute: Vec<Vec<String>>,
}

impl MutePolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// True when the event should be emitted
    ///
    /// An event is emitted iff no prefix of its tag path is muted without
    /// a more specific (at least as long) matching unmute.
    pub fn allows(&self, tags: &[String]) -> bool {
        let longest = |paths: &[Vec<String>]| {
            paths
                .iter()
                .filter(|path| path.len() <= tags.len() && tags.starts_with(path))
                .map(Vec::len)
                .max()
        };
        match longest(&self.mute) {
            None => true,
            Some(mute_len) => longest(&self.unmute).map_or(false, |u| u >= mute_len),
        }
    }
}

/// Per-run event emitter
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<AgentEvent>,
    policy: Arc<MutePolicy>,
}

impl EventBus {
    /// Create a bus and hand back its receiver for the transport side
    pub fn channel(policy: MutePolicy) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                policy: Arc::new(policy),
            },
            rx,
        )
    }

    /// A bus with no consumer; emissions are dropped
    pub fn sink() -> Self {
        let (bus, _rx) = Self::channel(MutePolicy::allow_all());
        bus
    }

    /// Emit an event if the mute policy allows it
    ///
    /// A closed receiver is not an error; late emissions after the client
    /// went away are silently dropped.
    pub fn emit(&self, event: AgentEvent) {
        if self.policy.allows(&event.tags()) {
            let _ = self.tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = MutePolicy::allow_all();
        assert!(policy.allows(&tags(&["tool", "search", "start"])));
    }

    #[test]
    fn mute_prefix_drops_event() {
        let policy = MutePolicy {
            mute: vec![tags(&["tool"])],
            unmute: vec![],
        };
        assert!(!policy.allows(&tags(&["tool", "search", "start"])));
        assert!(policy.allows(&tags(&["agent", "planner", "chunk"])));
    }

    #[test]
    fn more_specific_unmute_overrides_mute() {
        let policy = MutePolicy {
            mute: vec![tags(&["tool"])],
            unmute: vec![tags(&["tool", "search"])],
        };
        assert!(policy.allows(&tags(&["tool", "search", "start"])));
        assert!(!policy.allows(&tags(&["tool", "calc", "start"])));
    }

    #[test]
    fn less_specific_unmute_does_not_override() {
        let policy = MutePolicy {
            mute: vec![tags(&["tool", "search"])],
            unmute: vec![tags(&["tool"])],
        };
        assert!(!policy.allows(&tags(&["tool", "search", "start"])));
    }

    #[tokio::test]
    async fn bus_applies_policy() {
        let policy = MutePolicy {
            mute: vec![tags(&["checkpoint"])],
            unmute: vec![],
        };
        let (bus, mut rx) = EventBus::channel(policy);
        bus.emit(AgentEvent::Checkpoint {
            checkpoint_id: "c1".into(),
        });
        bus.emit(AgentEvent::RunStart {
            run_id: "r1".into(),
            thread_id: "t1".into(),
        });
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, AgentEvent::RunStart { .. }));
    }

    #[test]
    fn event_serializes_with_event_and_data() {
        let event = AgentEvent::RunStart {
            run_id: "r1".into(),
            thread_id: "t1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "on_run_start");
        assert_eq!(json["data"]["run_id"], "r1");
    }
}
