//! LLM-driven tool selection
//!
//! When an agent carries more tools than a model handles well, this
//! wrapper asks a (possibly smaller) selector model for the relevant
//! subset before the real call. The selection is truncated to `max_tools`,
//! the `always_include` set is appended, provider-specific tool dicts pass
//! through untouched, and a selection naming an unknown tool fails the
//! run.

use crate::error::{GraphError, Result};
use crate::messages::Message;
use crate::model::{ChatModel, ModelEnv, ModelRequest, RequestTool};
use crate::middleware::{Middleware, ModelNext};
use crate::model::ModelResponse;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Filters the tool list through a selector model
pub struct LlmToolSelector {
    selector: Arc<dyn ChatModel>,
    max_tools: usize,
    always_include: Vec<String>,
}

impl LlmToolSelector {
    pub fn new(selector: Arc<dyn ChatModel>, max_tools: usize, always_include: Vec<String>) -> Self {
        Self {
            selector,
            max_tools,
            always_include,
        }
    }

    fn parse_selection(content: &str) -> Result<Vec<String>> {
        if let Ok(names) = serde_json::from_str::<Vec<String>>(content) {
            return Ok(names);
        }
        // Tolerate prose around the array.
        if let (Some(start), Some(end)) = (content.find('['), content.rfind(']')) {
            if start < end {
                if let Ok(names) = serde_json::from_str::<Vec<String>>(&content[start..=end]) {
                    return Ok(names);
                }
            }
        }
        Err(GraphError::Input(format!(
            "tool selector returned unparseable selection: {content}"
        )))
    }
}

#[async_trait]
impl Middleware for LlmToolSelector {
    fn name(&self) -> &str {
        "llm_tool_selector"
    }

    async fn wrap_model_call(
        &self,
        mut request: ModelRequest,
        next: ModelNext,
    ) -> Result<ModelResponse> {
        let function_tools: Vec<_> = request
            .tools
            .iter()
            .filter_map(|t| match t {
                RequestTool::Function(d) => Some(d.clone()),
                RequestTool::Provider(_) => None,
            })
            .collect();
        if function_tools.len() <= self.max_tools {
            return next(request).await;
        }

        let catalog: String = function_tools
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n");
        let question = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::messages::MessageRole::Human)
            .map(|m| m.text())
            .unwrap_or_default();
        let prompt = format!(
            "Select the tools needed to answer the user. Available tools:\n{catalog}\n\nUser request: {question}\n\nRespond with a JSON array of tool names only."
        );

        let selector_request = ModelRequest {
            model: self.selector.name().to_string(),
            agent_key: request.agent_key.clone(),
            system: None,
            messages: vec![Message::human(prompt)],
            tools: vec![],
            tool_choice: None,
            state: serde_json::Value::Null,
            language: request.language.clone(),
        };
        let response = self
            .selector
            .generate(selector_request, &ModelEnv::detached())
            .await?;
        let selection = Self::parse_selection(&response.message.text())?;

        let known: HashSet<&str> = function_tools.iter().map(|d| d.name.as_str()).collect();
        for name in &selection {
            if !known.contains(name.as_str()) {
                return Err(GraphError::Input(format!(
                    "tool selector chose unknown tool '{name}'"
                )));
            }
        }

        let mut chosen: Vec<String> = selection;
        chosen.truncate(self.max_tools);
        for name in &self.always_include {
            if known.contains(name.as_str()) && !chosen.contains(name) {
                chosen.push(name.clone());
            }
        }

        let mut tools: Vec<RequestTool> = chosen
            .iter()
            .filter_map(|name| {
                function_tools
                    .iter()
                    .find(|d| &d.name == name)
                    .cloned()
                    .map(RequestTool::Function)
            })
            .collect();
        // Provider dicts survive filtering untouched.
        tools.extend(
            request
                .tools
                .iter()
                .filter(|t| matches!(t, RequestTool::Provider(_)))
                .cloned(),
        );

        tracing::debug!(
            agent = %request.agent_key,
            selected = chosen.len(),
            available = function_tools.len(),
            "tool selector filtered tool list"
        );
        request.tools = tools;
        next(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScriptedModel, ScriptedStep, ToolDescriptor};
    use parking_lot::Mutex;

    fn descriptor(name: &str) -> RequestTool {
        RequestTool::Function(ToolDescriptor {
            name: name.to_string(),
            description: format!("tool {name}"),
            schema: serde_json::json!({"type": "object"}),
        })
    }

    fn request_with_tools(names: &[&str]) -> ModelRequest {
        let mut tools: Vec<RequestTool> = names.iter().map(|n| descriptor(n)).collect();
        tools.push(RequestTool::Provider(
            serde_json::json!({"type": "web_search"}),
        ));
        ModelRequest {
            model: "main".into(),
            agent_key: "planner".into(),
            system: None,
            messages: vec![Message::human("do things")],
            tools,
            tool_choice: None,
            state: serde_json::Value::Null,
            language: None,
        }
    }

    fn capture_next(seen: Arc<Mutex<Option<ModelRequest>>>) -> ModelNext {
        Box::new(move |req| {
            Box::pin(async move {
                *seen.lock() = Some(req);
                Ok(ModelResponse {
                    message: Message::assistant("done"),
                    usage: Default::default(),
                })
            })
        })
    }

    #[tokio::test]
    async fn selection_is_truncated_and_always_include_appended() {
        let selector = Arc::new(ScriptedModel::new(
            "selector",
            vec![ScriptedStep::Message(Message::assistant(
                r#"["a","b","c","d"]"#,
            ))],
        ));
        let mw = LlmToolSelector::new(selector, 3, vec!["search".to_string()]);
        let request = request_with_tools(&[
            "a", "b", "c", "d", "e", "f", "g", "h", "i", "search",
        ]);

        let seen = Arc::new(Mutex::new(None));
        mw.wrap_model_call(request, capture_next(seen.clone()))
            .await
            .unwrap();

        let inner = seen.lock().clone().unwrap();
        let names: Vec<_> = inner.tools.iter().filter_map(|t| t.name().map(String::from)).collect();
        assert_eq!(names, vec!["a", "b", "c", "search"]);
        // Provider dict preserved.
        assert!(inner
            .tools
            .iter()
            .any(|t| matches!(t, RequestTool::Provider(_))));
    }

    #[tokio::test]
    async fn unknown_selection_fails_the_run() {
        let selector = Arc::new(ScriptedModel::new(
            "selector",
            vec![ScriptedStep::Message(Message::assistant(r#"["zz"]"#))],
        ));
        let mw = LlmToolSelector::new(selector, 2, vec![]);
        let request = request_with_tools(&["a", "b", "c"]);
        let err = mw
            .wrap_model_call(request, capture_next(Arc::new(Mutex::new(None))))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Input(_)));
    }

    #[tokio::test]
    async fn small_tool_sets_skip_selection() {
        let selector = Arc::new(ScriptedModel::new("selector", vec![]));
        let mw = LlmToolSelector::new(selector.clone(), 5, vec![]);
        let request = request_with_tools(&["a", "b"]);

        let seen = Arc::new(Mutex::new(None));
        mw.wrap_model_call(request, capture_next(seen.clone()))
            .await
            .unwrap();
        // Selector never consulted.
        assert!(selector.requests().is_empty());
        assert_eq!(seen.lock().clone().unwrap().tools.len(), 3);
    }
}
