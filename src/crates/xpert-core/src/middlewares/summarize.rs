//! Conversation summarization middleware
//!
//! Keeps an agent's channel inside a message budget: when the count
//! exceeds `max_messages`, everything but the `retain_messages` most
//! recent turns is folded into the channel's `summary` field and removed
//! via removal markers. The shared `messages` channel keeps the full
//! transcript; only the agent's working set shrinks.

use crate::error::Result;
use crate::messages::{Message, MessageUpdate, RemoveMessage};
use crate::model::{ChatModel, ModelEnv, ModelRequest};
use crate::middleware::{HookContext, HookUpdate, Middleware, MiddlewareHooks};
use crate::state::agent_channel_name;
use async_trait::async_trait;
use std::sync::Arc;

/// Message-budget guard for agent channels
pub struct SummarizationMiddleware {
    model: Arc<dyn ChatModel>,
    max_messages: usize,
    retain_messages: usize,
}

impl SummarizationMiddleware {
    pub fn new(model: Arc<dyn ChatModel>, max_messages: usize, retain_messages: usize) -> Self {
        Self {
            model,
            max_messages,
            retain_messages: retain_messages.min(max_messages),
        }
    }
}

#[async_trait]
impl Middleware for SummarizationMiddleware {
    fn name(&self) -> &str {
        "summarization"
    }

    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks {
            before_model: true,
            ..Default::default()
        }
    }

    async fn before_model(&self, ctx: &HookContext) -> Result<Option<HookUpdate>> {
        let messages = &ctx.channel.messages;
        if messages.len() <= self.max_messages {
            return Ok(None);
        }

        let split = messages.len() - self.retain_messages;
        let old = &messages[..split];

        let transcript: String = old
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.text()))
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = String::from(
            "Summarize the following conversation so it can replace the original messages. Keep decisions, facts and open questions.\n\n",
        );
        if let Some(previous) = &ctx.channel.summary {
            prompt.push_str(&format!("Previous summary:\n{previous}\n\n"));
        }
        prompt.push_str(&transcript);

        let response = self
            .model
            .generate(
                ModelRequest {
                    model: self.model.name().to_string(),
                    agent_key: ctx.agent_key.clone(),
                    system: None,
                    messages: vec![Message::human(prompt)],
                    tools: vec![],
                    tool_choice: None,
                    state: serde_json::Value::Null,
                    language: ctx.language.clone(),
                },
                &ModelEnv {
                    events: ctx.events.clone(),
                    signal: ctx.signal.clone(),
                },
            )
            .await?;
        let summary = response.message.text();

        let removals: Vec<MessageUpdate> = old
            .iter()
            .filter_map(|m| m.id.clone())
            .map(|id| RemoveMessage::new(id).into())
            .collect();

        tracing::debug!(
            agent = %ctx.agent_key,
            dropped = removals.len(),
            retained = self.retain_messages,
            "summarized agent channel"
        );

        Ok(Some(HookUpdate::new().with_channel(
            agent_channel_name(&ctx.agent_key),
            serde_json::json!({
                "summary": summary,
                "messages": serde_json::to_value(removals)?,
            }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::event::EventBus;
    use crate::model::{ScriptedModel, ScriptedStep};
    use crate::state::AgentChannelState;

    fn ctx(messages: Vec<Message>) -> HookContext {
        let channel = AgentChannelState {
            messages,
            ..Default::default()
        };
        HookContext {
            agent_key: "planner".into(),
            thread_id: "t1".into(),
            run_id: "r1".into(),
            state: serde_json::to_value(&channel).unwrap(),
            channel,
            resume: None,
            store: None,
            events: EventBus::sink(),
            signal: CancelToken::never(),
            language: None,
        }
    }

    fn turns(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::human(format!("turn {i}")).with_id(format!("m{i}")))
            .collect()
    }

    #[tokio::test]
    async fn under_budget_is_untouched() {
        let model = Arc::new(ScriptedModel::new("sum", vec![]));
        let mw = SummarizationMiddleware::new(model, 5, 2);
        assert!(mw.before_model(&ctx(turns(5))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn over_budget_summarizes_and_removes_old_messages() {
        let model = Arc::new(ScriptedModel::new(
            "sum",
            vec![ScriptedStep::Message(Message::assistant("the gist"))],
        ));
        let mw = SummarizationMiddleware::new(model, 4, 2);

        let update = mw.before_model(&ctx(turns(6))).await.unwrap().unwrap();
        let channel_update = &update.update["planner_channel"];
        assert_eq!(channel_update["summary"], "the gist");

        let removals = channel_update["messages"].as_array().unwrap();
        // 6 messages, retain 2 → drop 4.
        assert_eq!(removals.len(), 4);
        assert_eq!(removals[0]["remove"], "m0");
        assert_eq!(removals[3]["remove"], "m3");
    }
}
