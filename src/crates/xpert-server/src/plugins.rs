//! Plugin loading
//!
//! The `PLUGINS` environment variable names which built-in plugins to
//! activate. Each plugin contributes models, toolsets or middlewares to
//! the compile context; unknown identifiers are logged and skipped so a
//! stale deployment variable never prevents startup.

use serde_json::json;
use std::sync::Arc;
use xpert_core::middlewares::TodoListMiddleware;
use xpert_core::{
    CompileContext, Message, ModelRegistry, ScriptedModel, SimpleToolset, Tool, ToolOutput,
};

/// Build a compile context from the configured plugin list
pub fn build_compile_context(plugins: &[String]) -> CompileContext {
    let mut models = ModelRegistry::new();
    let mut ctx = CompileContext::default();

    for plugin in plugins {
        match plugin.as_str() {
            "mock" => {
                // Echo model: replies with the last human message. The
                // default model for demos and tests.
                models.register(Arc::new(ScriptedModel::new("mock", vec![])));
                tracing::info!("loaded plugin 'mock'");
            }
            "calculator" => {
                ctx.toolsets.push(Arc::new(calculator_toolset()));
                tracing::info!("loaded plugin 'calculator'");
            }
            "todo" => {
                ctx.middlewares.push(Arc::new(TodoListMiddleware));
                tracing::info!("loaded plugin 'todo'");
            }
            other => {
                tracing::warn!(plugin = other, "unknown plugin identifier, skipping");
            }
        }
    }

    if models.names().is_empty() {
        models.register(Arc::new(ScriptedModel::repeating(
            "mock",
            Message::assistant("no model plugin configured"),
        )));
    }
    ctx.default_model = Some("mock".to_string());
    ctx.models = Arc::new(models);
    ctx
}

fn calculator_toolset() -> SimpleToolset {
    let add = Arc::new(Tool::from_fn(
        "add",
        "Add two numbers",
        json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
        }),
        |args, _runtime| async move {
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            Ok(ToolOutput::Content(json!(sum)))
        },
    ));
    let multiply = Arc::new(Tool::from_fn(
        "multiply",
        "Multiply two numbers",
        json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
        }),
        |args, _runtime| async move {
            let product = args["a"].as_f64().unwrap_or(0.0) * args["b"].as_f64().unwrap_or(0.0);
            Ok(ToolOutput::Content(json!(product)))
        },
    ));
    SimpleToolset::new("calculator", "Calculator", vec![add, multiply])
}
