//! State channels: reducers and the per-run channel store
//!
//! The accumulated state of a run lives in named channels. Each channel
//! declares a [`Reducer`] and a default; nodes emit `(channel, update)`
//! pairs and the store folds them in. Writes are atomic per step: either
//! every update from a step lands or none do, and updates naming unknown
//! channels are rejected before anything is committed.
//!
//! The default semantics are last-writer-wins at field level and append
//! for message lists; deviations are declared per channel through the
//! reducer.

use crate::error::{GraphError, Result};
use crate::messages::{add_messages, Message, MessageUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Name of an agent's private channel
pub fn agent_channel_name(agent_key: &str) -> String {
    format!("{agent_key}_channel")
}

/// Name of the shared conversation channel
pub const MESSAGES_CHANNEL: &str = "messages";

/// Reduction strategy for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    /// Replace; objects merge field-wise (last writer wins per field)
    LastValue,
    /// Message list semantics: append, id-dedup, removal markers
    Messages,
    /// Agent channel `{system, messages, summary, error, output}`;
    /// `messages` reduces as a message list, other fields last-writer-wins
    AgentChannel,
    /// Array concatenation
    Append,
}

impl Reducer {
    /// Fold one update into the previous value
    pub fn apply(&self, prev: &Value, update: Value) -> Result<Value> {
        match self {
            Reducer::LastValue => Ok(merge_field_level(prev, update)),
            Reducer::Messages => reduce_messages(prev, update),
            Reducer::AgentChannel => reduce_agent_channel(prev, update),
            Reducer::Append => {
                let mut items = match prev {
                    Value::Array(items) => items.clone(),
                    Value::Null => Vec::new(),
                    other => vec![other.clone()],
                };
                match update {
                    Value::Array(more) => items.extend(more),
                    other => items.push(other),
                }
                Ok(Value::Array(items))
            }
        }
    }
}

fn merge_field_level(prev: &Value, update: Value) -> Value {
    match (prev, update) {
        (Value::Object(prev_map), Value::Object(update_map)) => {
            let mut merged = prev_map.clone();
            for (key, value) in update_map {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, update) => update,
    }
}

fn reduce_messages(prev: &Value, update: Value) -> Result<Value> {
    let existing: Vec<Message> = match prev {
        Value::Null => Vec::new(),
        other => serde_json::from_value(other.clone())?,
    };
    let updates: Vec<MessageUpdate> = match update {
        Value::Array(_) => serde_json::from_value(update)?,
        Value::Null => Vec::new(),
        single => vec![serde_json::from_value(single)?],
    };
    Ok(serde_json::to_value(add_messages(existing, updates))?)
}

fn reduce_agent_channel(prev: &Value, update: Value) -> Result<Value> {
    let Value::Object(update_map) = update else {
        return Err(GraphError::Input(
            "agent channel update must be an object".to_string(),
        ));
    };
    let mut merged = match prev {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (key, value) in update_map {
        if key == "messages" {
            let prev_messages = merged.get("messages").cloned().unwrap_or(Value::Null);
            merged.insert(key, reduce_messages(&prev_messages, value)?);
        } else {
            merged.insert(key, value);
        }
    }
    Ok(Value::Object(merged))
}

/// Declaration of one channel
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub reducer: Reducer,
    pub default: Value,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, reducer: Reducer, default: Value) -> Self {
        Self {
            name: name.into(),
            reducer,
            default,
        }
    }

    /// The shared `messages` channel
    pub fn messages() -> Self {
        Self::new(MESSAGES_CHANNEL, Reducer::Messages, Value::Array(Vec::new()))
    }

    /// An agent's private channel
    pub fn agent(agent_key: &str) -> Self {
        Self::new(
            agent_channel_name(agent_key),
            Reducer::AgentChannel,
            serde_json::json!({"messages": []}),
        )
    }
}

/// Typed view of an agent channel value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentChannelState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl AgentChannelState {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }

    /// Most recent assistant message, if any
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_assistant())
    }
}

/// The keyed channel map holding the state of one run
#[derive(Debug, Clone)]
pub struct ChannelStore {
    specs: BTreeMap<String, ChannelSpec>,
    values: BTreeMap<String, Value>,
}

impl ChannelStore {
    /// Fill defaults for every declared channel
    pub fn initialize(specs: Vec<ChannelSpec>) -> Result<Self> {
        let mut spec_map = BTreeMap::new();
        let mut values = BTreeMap::new();
        for spec in specs {
            if spec_map.contains_key(&spec.name) {
                return Err(GraphError::Configuration(format!(
                    "duplicate channel '{}'",
                    spec.name
                )));
            }
            values.insert(spec.name.clone(), spec.default.clone());
            spec_map.insert(spec.name.clone(), spec);
        }
        Ok(Self {
            specs: spec_map,
            values,
        })
    }

    /// Rebuild a store from checkpointed values, filling defaults for
    /// channels the snapshot predates
    pub fn restore(specs: Vec<ChannelSpec>, snapshot: &HashMap<String, Value>) -> Result<Self> {
        let mut store = Self::initialize(specs)?;
        for (name, value) in snapshot {
            if store.values.contains_key(name) {
                store.values.insert(name.clone(), value.clone());
            }
        }
        Ok(store)
    }

    pub fn read(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| GraphError::Input(format!("unknown channel '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Apply a step's writes atomically
    ///
    /// All updates are validated and folded into a staging map first;
    /// nothing is committed if any update names an unknown channel or its
    /// reducer rejects the value. Multiple updates to the same channel
    /// within a step fold in the order given.
    pub fn apply(&mut self, updates: &[(String, Value)]) -> Result<Vec<String>> {
        let mut staged: BTreeMap<String, Value> = BTreeMap::new();
        for (name, update) in updates {
            let spec = self.specs.get(name).ok_or_else(|| {
                GraphError::Input(format!("write to undeclared channel '{name}'"))
            })?;
            let prev = staged
                .get(name)
                .or_else(|| self.values.get(name))
                .cloned()
                .unwrap_or(Value::Null);
            let next = spec.reducer.apply(&prev, update.clone())?;
            staged.insert(name.clone(), next);
        }
        let updated: Vec<String> = staged.keys().cloned().collect();
        for (name, value) in staged {
            self.values.insert(name, value);
        }
        Ok(updated)
    }

    /// Deep snapshot of all channel values
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Typed read of an agent channel
    pub fn agent_channel(&self, agent_key: &str) -> Result<AgentChannelState> {
        AgentChannelState::from_value(self.read(&agent_channel_name(agent_key))?)
    }

    /// Typed read of the shared messages channel
    pub fn messages(&self) -> Result<Vec<Message>> {
        match self.read(MESSAGES_CHANNEL)? {
            Value::Null => Ok(Vec::new()),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RemoveMessage;

    fn store() -> ChannelStore {
        ChannelStore::initialize(vec![
            ChannelSpec::messages(),
            ChannelSpec::agent("planner"),
            ChannelSpec::new("counter", Reducer::LastValue, Value::Null),
        ])
        .unwrap()
    }

    #[test]
    fn initialize_fills_defaults() {
        let store = store();
        assert_eq!(store.read("messages").unwrap(), &serde_json::json!([]));
        assert_eq!(
            store.read("planner_channel").unwrap(),
            &serde_json::json!({"messages": []})
        );
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let err = ChannelStore::initialize(vec![ChannelSpec::messages(), ChannelSpec::messages()])
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[test]
    fn unknown_channel_rejects_whole_batch() {
        let mut store = store();
        let updates = vec![
            ("counter".to_string(), serde_json::json!(1)),
            ("nope".to_string(), serde_json::json!(2)),
        ];
        assert!(store.apply(&updates).is_err());
        // First write must not have leaked through.
        assert_eq!(store.read("counter").unwrap(), &Value::Null);
    }

    #[test]
    fn last_value_merges_objects_field_wise() {
        let mut store = store();
        store
            .apply(&[("counter".to_string(), serde_json::json!({"a": 1, "b": 2}))])
            .unwrap();
        store
            .apply(&[("counter".to_string(), serde_json::json!({"b": 3}))])
            .unwrap();
        assert_eq!(
            store.read("counter").unwrap(),
            &serde_json::json!({"a": 1, "b": 3})
        );
    }

    #[test]
    fn messages_reducer_appends_and_dedups() {
        let mut store = store();
        let m1 = Message::human("hi").with_id("1");
        store
            .apply(&[(MESSAGES_CHANNEL.to_string(), serde_json::json!([m1]))])
            .unwrap();
        let m1b = Message::human("edited").with_id("1");
        let m2 = Message::assistant("hello").with_id("2");
        store
            .apply(&[(MESSAGES_CHANNEL.to_string(), serde_json::json!([m1b, m2]))])
            .unwrap();

        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "edited");
        assert_eq!(messages[1].id.as_deref(), Some("2"));
    }

    #[test]
    fn messages_reducer_honors_remove_marker() {
        let mut store = store();
        let m1 = Message::human("hi").with_id("1");
        let m2 = Message::assistant("yo").with_id("2");
        store
            .apply(&[(MESSAGES_CHANNEL.to_string(), serde_json::json!([m1, m2]))])
            .unwrap();
        store
            .apply(&[(
                MESSAGES_CHANNEL.to_string(),
                serde_json::json!([RemoveMessage::new("1")]),
            )])
            .unwrap();
        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.as_deref(), Some("2"));
    }

    #[test]
    fn agent_channel_reduces_field_wise() {
        let mut store = store();
        store
            .apply(&[(
                "planner_channel".to_string(),
                serde_json::json!({"system": "be helpful", "messages": [Message::human("q").with_id("1")]}),
            )])
            .unwrap();
        store
            .apply(&[(
                "planner_channel".to_string(),
                serde_json::json!({"summary": "short", "messages": [Message::assistant("a").with_id("2")]}),
            )])
            .unwrap();

        let channel = store.agent_channel("planner").unwrap();
        assert_eq!(channel.system.as_deref(), Some("be helpful"));
        assert_eq!(channel.summary.as_deref(), Some("short"));
        assert_eq!(channel.messages.len(), 2);
    }

    #[test]
    fn same_step_writes_fold_in_order() {
        let mut store = store();
        let updates = vec![
            ("counter".to_string(), serde_json::json!({"v": 1})),
            ("counter".to_string(), serde_json::json!({"v": 2})),
        ];
        store.apply(&updates).unwrap();
        assert_eq!(store.read("counter").unwrap(), &serde_json::json!({"v": 2}));
    }

    #[test]
    fn snapshot_restores_identically() {
        let mut store = store();
        store
            .apply(&[(
                MESSAGES_CHANNEL.to_string(),
                serde_json::json!([Message::human("hi").with_id("1")]),
            )])
            .unwrap();
        let snapshot = store.snapshot();

        let restored = ChannelStore::restore(
            vec![
                ChannelSpec::messages(),
                ChannelSpec::agent("planner"),
                ChannelSpec::new("counter", Reducer::LastValue, Value::Null),
            ],
            &snapshot,
        )
        .unwrap();
        assert_eq!(restored.snapshot(), snapshot);
    }
}
