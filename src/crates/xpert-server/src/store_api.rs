//! Memory KV store endpoints (`/store/items`)

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use xpert_core::{Store, StoreItem};

fn store(state: &AppState) -> ApiResult<std::sync::Arc<dyn xpert_core::Store>> {
    state
        .services
        .store
        .clone()
        .ok_or_else(|| ApiError::Internal("no store configured".to_string()))
}

/// `PUT /store/items` body
#[derive(Debug, Deserialize)]
pub struct PutItemRequest {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
}

pub async fn put_item(
    State(state): State<AppState>,
    Json(req): Json<PutItemRequest>,
) -> ApiResult<StatusCode> {
    store(&state)?
        .put(&req.namespace, &req.key, req.value)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /store/items` / `DELETE /store/items` query
#[derive(Debug, Deserialize)]
pub struct ItemQuery {
    /// Dotted namespace path
    pub namespace: String,
    pub key: String,
}

fn parse_namespace(raw: &str) -> Vec<String> {
    raw.split('.')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub async fn get_item(
    State(state): State<AppState>,
    Query(query): Query<ItemQuery>,
) -> ApiResult<Json<StoreItem>> {
    let namespace = parse_namespace(&query.namespace);
    let item = store(&state)?
        .get(&namespace, &query.key)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| {
            ApiError::NotFound(format!("item '{}' in '{}'", query.key, query.namespace))
        })?;
    Ok(Json(item))
}

pub async fn delete_item(
    State(state): State<AppState>,
    Query(query): Query<ItemQuery>,
) -> ApiResult<StatusCode> {
    let namespace = parse_namespace(&query.namespace);
    store(&state)?
        .delete(&namespace, &query.key)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /store/items/search` body
#[derive(Debug, Default, Deserialize)]
pub struct SearchItemsRequest {
    #[serde(default)]
    pub namespace_prefix: Vec<String>,

    #[serde(default)]
    pub query: Option<String>,

    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn search_items(
    State(state): State<AppState>,
    Json(req): Json<SearchItemsRequest>,
) -> ApiResult<Json<Vec<StoreItem>>> {
    let items = store(&state)?
        .search(&req.namespace_prefix, req.query.as_deref(), req.limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(items))
}
