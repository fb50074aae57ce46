//! Assistant endpoints

use crate::error::ApiResult;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use xpert_core::Xpert;

/// `POST /assistants/search` body
#[derive(Debug, Default, Deserialize)]
pub struct SearchAssistantsRequest {
    #[serde(default)]
    pub graph_id: Option<String>,

    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub limit: Option<usize>,
}

/// Wire shape of an assistant
#[derive(Debug, Serialize)]
pub struct AssistantResponse {
    pub assistant_id: String,
    pub graph_id: String,
    pub name: String,
    pub version: String,
    pub latest: bool,
    pub metadata: HashMap<String, Value>,
}

impl From<&Arc<Xpert>> for AssistantResponse {
    fn from(xpert: &Arc<Xpert>) -> Self {
        Self {
            assistant_id: xpert.id.clone(),
            graph_id: xpert.slug.clone(),
            name: xpert.name.clone(),
            version: xpert.version.clone(),
            latest: xpert.latest,
            metadata: xpert.metadata.clone(),
        }
    }
}

pub async fn search_assistants(
    State(state): State<AppState>,
    Json(req): Json<SearchAssistantsRequest>,
) -> ApiResult<Json<Vec<AssistantResponse>>> {
    let mut found = state
        .assistants
        .search(req.graph_id.as_deref(), &req.metadata);
    if let Some(limit) = req.limit {
        found.truncate(limit);
    }
    Ok(Json(found.iter().map(AssistantResponse::from).collect()))
}

pub async fn get_assistant(
    State(state): State<AppState>,
    Path(assistant_id): Path<String>,
) -> ApiResult<Json<AssistantResponse>> {
    let xpert = state.assistants.get(&assistant_id)?;
    Ok(Json(AssistantResponse::from(&xpert)))
}
