//! Todo-list middleware
//!
//! Small demonstration of a middleware-declared state channel: contributes
//! a `todos` channel plus a `write_todo` tool the model can call to push
//! items onto it.

use crate::error::Result;
use crate::middleware::{Middleware, MiddlewareHooks};
use crate::state::{ChannelSpec, Reducer};
use crate::toolset::{Tool, ToolOutput};
use crate::command::Command;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Channel name contributed by this middleware
pub const TODOS_CHANNEL: &str = "todos";

/// Adds a `todos` channel and a tool writing into it
pub struct TodoListMiddleware;

#[async_trait]
impl Middleware for TodoListMiddleware {
    fn name(&self) -> &str {
        "todo_list"
    }

    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks::default()
    }

    fn channels(&self) -> Vec<ChannelSpec> {
        vec![ChannelSpec::new(
            TODOS_CHANNEL,
            Reducer::Append,
            Value::Array(Vec::new()),
        )]
    }

    fn tools(&self) -> Vec<Arc<Tool>> {
        vec![Arc::new(Tool::from_fn(
            "write_todo",
            "Record a todo item for later follow-up",
            serde_json::json!({
                "type": "object",
                "required": ["item"],
                "properties": {
                    "item": {"type": "string"}
                }
            }),
            |args, _runtime| async move {
                let item = args["item"].clone();
                let mut update = HashMap::new();
                update.insert(TODOS_CHANNEL.to_string(), serde_json::json!([item]));
                Ok(ToolOutput::Command(Command::new().with_update(update)))
            },
        ))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::event::EventBus;
    use crate::toolset::ToolRuntime;

    #[tokio::test]
    async fn write_todo_returns_channel_command() {
        let mw = TodoListMiddleware;
        assert_eq!(mw.channels()[0].name, TODOS_CHANNEL);

        let tool = mw.tools().pop().unwrap();
        let runtime = ToolRuntime {
            toolset_id: None,
            agent_key: "a".into(),
            thread_id: "t".into(),
            run_id: "r".into(),
            env: HashMap::new(),
            store: None,
            signal: CancelToken::never(),
            events: EventBus::sink(),
            state: Value::Null,
        };
        let output = tool
            .invoke(serde_json::json!({"item": "ship it"}), runtime)
            .await
            .unwrap();
        match output {
            ToolOutput::Command(command) => {
                let update = command.update.unwrap();
                assert_eq!(update[TODOS_CHANNEL], serde_json::json!(["ship it"]));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }
}
