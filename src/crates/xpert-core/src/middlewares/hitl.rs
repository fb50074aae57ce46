//! Human-in-the-loop review middleware
//!
//! Watches the last assistant message after each model call. Tool calls
//! whose name matches `interrupt_on` are collected into one interrupt
//! carrying an [`ActionRequest`] per call; the resume must carry exactly
//! one decision per intercepted call, paired by position.
//!
//! Decision semantics: `approve` keeps the call, `edit` replaces name and
//! args keeping the original id, `reject` drops it and appends a synthetic
//! error ToolMessage. When any call was rejected the assistant message is
//! rewritten to carry only the rejected calls and the router is overridden
//! with `jump_to = model`, so the model sees the rejections and recovers.
//! The rewritten message is a fresh object sharing the original id: the
//! reducer replaces it in place and checkpoints only ever observe the
//! rewritten form.

use crate::error::{GraphError, Result};
use crate::interrupt::{
    ActionRequest, HitlDecision, HitlResume, Interrupt, InterruptKind, ReviewConfig,
};
use crate::messages::{Message, MessageUpdate, ToolCall, ToolMessageStatus};
use crate::middleware::{HookContext, HookUpdate, JumpTo, Middleware, MiddlewareHooks};
use crate::state::{agent_channel_name, MESSAGES_CHANNEL};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Review gate over selected tool names
pub struct HumanInTheLoop {
    interrupt_on: HashMap<String, ReviewConfig>,
}

impl HumanInTheLoop {
    pub fn new(interrupt_on: HashMap<String, ReviewConfig>) -> Self {
        Self { interrupt_on }
    }

    fn matched_calls(&self, message: &Message) -> Vec<ToolCall> {
        message
            .tool_calls()
            .iter()
            .filter(|call| self.interrupt_on.contains_key(&call.name))
            .cloned()
            .collect()
    }

    fn raise(&self, matched: Vec<ToolCall>) -> GraphError {
        let requests: Vec<ActionRequest> = matched
            .iter()
            .map(|call| ActionRequest {
                name: call.name.clone(),
                args: call.args.clone(),
                description: None,
            })
            .collect();
        let review: HashMap<&String, &ReviewConfig> = matched
            .iter()
            .filter_map(|call| self.interrupt_on.get_key_value(&call.name))
            .collect();
        let payload = serde_json::json!({
            "requests": requests,
            "review": review,
        });
        GraphError::Interrupt(Interrupt::new(InterruptKind::Hitl, payload, matched))
    }

    fn apply_decisions(
        &self,
        ctx: &HookContext,
        last_ai: &Message,
        matched: Vec<ToolCall>,
        resume: &Value,
    ) -> Result<HookUpdate> {
        let resume: HitlResume = serde_json::from_value(resume.clone())
            .map_err(|e| GraphError::Input(format!("invalid HITL resume payload: {e}")))?;
        if resume.decisions.len() != matched.len() {
            return Err(GraphError::Input(format!(
                "expected {} decisions, got {}",
                matched.len(),
                resume.decisions.len()
            )));
        }

        let mut kept: HashMap<String, ToolCall> = HashMap::new();
        let mut rejected: Vec<ToolCall> = Vec::new();
        let mut synthetic: Vec<Message> = Vec::new();

        for (call, decision) in matched.iter().zip(resume.decisions.iter()) {
            let config = self
                .interrupt_on
                .get(&call.name)
                .expect("matched call has a review config");
            if !config.allowed_decisions.contains(&decision.kind()) {
                return Err(GraphError::Input(format!(
                    "decision '{:?}' is not allowed for tool '{}'",
                    decision.kind(),
                    call.name
                )));
            }
            match decision {
                HitlDecision::Approve => {
                    kept.insert(call.id.clone(), call.clone());
                }
                HitlDecision::Edit { name, args } => {
                    kept.insert(
                        call.id.clone(),
                        ToolCall::new(call.id.clone(), name.clone(), args.clone()),
                    );
                }
                HitlDecision::Reject { message } => {
                    rejected.push(call.clone());
                    synthetic.push(
                        Message::tool(
                            message.clone().unwrap_or_else(|| "Tool call rejected".to_string()),
                            call.id.clone(),
                        )
                        .with_name(call.name.clone())
                        .with_status(ToolMessageStatus::Error),
                    );
                }
            }
        }

        let (new_tool_calls, jump) = if rejected.is_empty() {
            // Matched calls replaced in position, untouched calls kept.
            let calls = last_ai
                .tool_calls()
                .iter()
                .map(|call| kept.get(&call.id).cloned().unwrap_or_else(|| call.clone()))
                .collect::<Vec<_>>();
            (calls, None)
        } else {
            (rejected, Some(JumpTo::Model))
        };

        let mut fresh = last_ai.clone();
        fresh.tool_calls = Some(new_tool_calls);

        let mut updates: Vec<MessageUpdate> = vec![fresh.into()];
        updates.extend(synthetic.into_iter().map(MessageUpdate::from));
        let updates = serde_json::to_value(updates)?;

        let mut hook = HookUpdate::new()
            .with_channel(
                agent_channel_name(&ctx.agent_key),
                serde_json::json!({"messages": updates.clone()}),
            )
            .with_channel(MESSAGES_CHANNEL, updates);
        hook.jump_to = jump;
        Ok(hook)
    }
}

#[async_trait]
impl Middleware for HumanInTheLoop {
    fn name(&self) -> &str {
        "human_in_the_loop"
    }

    fn hooks(&self) -> MiddlewareHooks {
        MiddlewareHooks {
            after_model: true,
            ..Default::default()
        }
    }

    async fn after_model(&self, ctx: &HookContext) -> Result<Option<HookUpdate>> {
        let Some(last_ai) = ctx.channel.last_assistant() else {
            return Ok(None);
        };
        let matched = self.matched_calls(last_ai);
        if matched.is_empty() {
            return Ok(None);
        }
        match &ctx.resume {
            Some(resume) => {
                let update = self.apply_decisions(ctx, last_ai, matched, resume)?;
                Ok(Some(update))
            }
            None => Err(self.raise(matched)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::event::EventBus;
    use crate::interrupt::ReviewDecisionKind;
    use crate::state::AgentChannelState;

    fn middleware() -> HumanInTheLoop {
        let mut interrupt_on = HashMap::new();
        interrupt_on.insert(
            "dangerous".to_string(),
            ReviewConfig {
                allowed_decisions: vec![ReviewDecisionKind::Approve, ReviewDecisionKind::Reject],
                args_schema: None,
            },
        );
        HumanInTheLoop::new(interrupt_on)
    }

    fn ctx_with(message: Message, resume: Option<Value>) -> HookContext {
        let channel = AgentChannelState {
            messages: vec![message],
            ..Default::default()
        };
        HookContext {
            agent_key: "planner".into(),
            thread_id: "t1".into(),
            run_id: "r1".into(),
            state: serde_json::to_value(&channel).unwrap(),
            channel,
            resume,
            store: None,
            events: EventBus::sink(),
            signal: CancelToken::never(),
            language: None,
        }
    }

    fn dangerous_call() -> Message {
        Message::assistant("")
            .with_id("ai-1")
            .with_tool_calls(vec![ToolCall::new(
                "t9",
                "dangerous",
                serde_json::json!({"x": 1}),
            )])
    }

    #[tokio::test]
    async fn matching_call_raises_hitl_interrupt() {
        let mw = middleware();
        let err = mw.after_model(&ctx_with(dangerous_call(), None)).await.unwrap_err();
        match err {
            GraphError::Interrupt(interrupt) => {
                assert_eq!(interrupt.kind, InterruptKind::Hitl);
                assert_eq!(interrupt.pending_tool_calls.len(), 1);
                assert_eq!(interrupt.payload["requests"][0]["name"], "dangerous");
            }
            other => panic!("expected interrupt, got {other}"),
        }
    }

    #[tokio::test]
    async fn non_matching_calls_pass_through() {
        let mw = middleware();
        let message = Message::assistant("").with_tool_calls(vec![ToolCall::new(
            "t1",
            "safe",
            serde_json::json!({}),
        )]);
        let update = mw.after_model(&ctx_with(message, None)).await.unwrap();
        assert!(update.is_none());
    }

    #[tokio::test]
    async fn reject_rewrites_message_and_jumps_to_model() {
        let mw = middleware();
        let resume = serde_json::json!({"decisions": [{"type": "reject", "message": "nope"}]});
        let update = mw
            .after_model(&ctx_with(dangerous_call(), Some(resume)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(update.jump_to, Some(JumpTo::Model));
        let messages = update.update[MESSAGES_CHANNEL].as_array().unwrap();
        // Rewritten assistant message plus one synthetic tool message.
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["id"], "ai-1");
        assert_eq!(messages[0]["tool_calls"][0]["id"], "t9");
        assert_eq!(messages[1]["status"], "error");
        assert_eq!(messages[1]["content"], "nope");
        assert_eq!(messages[1]["tool_call_id"], "t9");
    }

    #[tokio::test]
    async fn approve_keeps_call_without_jump() {
        let mw = middleware();
        let resume = serde_json::json!({"decisions": [{"type": "approve"}]});
        let update = mw
            .after_model(&ctx_with(dangerous_call(), Some(resume)))
            .await
            .unwrap()
            .unwrap();
        assert!(update.jump_to.is_none());
        let messages = update.update[MESSAGES_CHANNEL].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["tool_calls"][0]["name"], "dangerous");
    }

    #[tokio::test]
    async fn wrong_decision_count_is_fatal() {
        let mw = middleware();
        let resume = serde_json::json!({"decisions": []});
        let err = mw
            .after_model(&ctx_with(dangerous_call(), Some(resume)))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn disallowed_decision_is_fatal() {
        let mw = middleware();
        // "edit" is not in allowed_decisions for "dangerous".
        let resume = serde_json::json!({
            "decisions": [{"type": "edit", "name": "dangerous", "args": {"x": 2}}]
        });
        let err = mw
            .after_model(&ctx_with(dangerous_call(), Some(resume)))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn edit_replaces_name_and_args_keeping_id() {
        let mut interrupt_on = HashMap::new();
        interrupt_on.insert("dangerous".to_string(), ReviewConfig::default());
        let mw = HumanInTheLoop::new(interrupt_on);

        let resume = serde_json::json!({
            "decisions": [{"type": "edit", "name": "harmless", "args": {"x": 2}}]
        });
        let update = mw
            .after_model(&ctx_with(dangerous_call(), Some(resume)))
            .await
            .unwrap()
            .unwrap();
        let messages = update.update[MESSAGES_CHANNEL].as_array().unwrap();
        let call = &messages[0]["tool_calls"][0];
        assert_eq!(call["id"], "t9");
        assert_eq!(call["name"], "harmless");
        assert_eq!(call["args"]["x"], 2);
    }
}
