//! Namespaced key-value store
//!
//! Long-lived memory shared across runs: agent memory writes, the
//! `/store/items` HTTP surface, and knowledge stubs all go through the
//! [`Store`] trait. Namespaces are string vectors (`["memories", "user-1"]`)
//! so tenants and agents can partition keys without coordination.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store item not found: {0}")]
    NotFound(String),

    #[error("Invalid store operation: {0}")]
    Invalid(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// One stored item with its namespace and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreItem {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Namespaced key-value storage
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace an item
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<(), StoreError>;

    /// Fetch an item
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<StoreItem>, StoreError>;

    /// Delete an item; missing keys are not an error
    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError>;

    /// List items under a namespace prefix, optionally filtering on a
    /// substring of the serialized value
    async fn search(
        &self,
        namespace_prefix: &[String],
        query: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StoreItem>, StoreError>;
}

/// Process-local store used by tests and the dev server
#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: DashMap<(Vec<String>, String), StoreItem>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<(), StoreError> {
        if namespace.is_empty() {
            return Err(StoreError::Invalid("namespace must not be empty".into()));
        }
        let map_key = (namespace.to_vec(), key.to_string());
        let now = Utc::now();
        match self.items.get(&map_key).map(|item| item.created_at) {
            Some(created_at) => {
                self.items.insert(
                    map_key,
                    StoreItem {
                        namespace: namespace.to_vec(),
                        key: key.to_string(),
                        value,
                        created_at,
                        updated_at: now,
                    },
                );
            }
            None => {
                self.items.insert(
                    map_key,
                    StoreItem {
                        namespace: namespace.to_vec(),
                        key: key.to_string(),
                        value,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<StoreItem>, StoreError> {
        let map_key = (namespace.to_vec(), key.to_string());
        Ok(self.items.get(&map_key).map(|item| item.clone()))
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError> {
        let map_key = (namespace.to_vec(), key.to_string());
        self.items.remove(&map_key);
        Ok(())
    }

    async fn search(
        &self,
        namespace_prefix: &[String],
        query: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StoreItem>, StoreError> {
        let mut matches: Vec<StoreItem> = self
            .items
            .iter()
            .filter(|entry| entry.key().0.starts_with(namespace_prefix))
            .filter(|entry| match query {
                Some(q) => entry.value().value.to_string().contains(q),
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = InMemoryStore::new();
        let namespace = ns(&["memories", "u1"]);
        store
            .put(&namespace, "likes", serde_json::json!({"coffee": true}))
            .await
            .unwrap();

        let item = store.get(&namespace, "likes").await.unwrap().unwrap();
        assert_eq!(item.value["coffee"], serde_json::json!(true));

        store.delete(&namespace, "likes").await.unwrap();
        assert!(store.get(&namespace, "likes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_namespace_is_rejected() {
        let store = InMemoryStore::new();
        let err = store.put(&[], "k", serde_json::json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn search_filters_by_prefix_and_query() {
        let store = InMemoryStore::new();
        store
            .put(&ns(&["memories", "u1"]), "a", serde_json::json!("coffee fan"))
            .await
            .unwrap();
        store
            .put(&ns(&["memories", "u2"]), "b", serde_json::json!("tea fan"))
            .await
            .unwrap();

        let all = store.search(&ns(&["memories"]), None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let u1 = store.search(&ns(&["memories", "u1"]), None, None).await.unwrap();
        assert_eq!(u1.len(), 1);

        let coffee = store
            .search(&ns(&["memories"]), Some("coffee"), None)
            .await
            .unwrap();
        assert_eq!(coffee.len(), 1);
        assert_eq!(coffee[0].key, "a");
    }

    #[tokio::test]
    async fn put_preserves_created_at_on_update() {
        let store = InMemoryStore::new();
        let namespace = ns(&["n"]);
        store.put(&namespace, "k", serde_json::json!(1)).await.unwrap();
        let first = store.get(&namespace, "k").await.unwrap().unwrap();
        store.put(&namespace, "k", serde_json::json!(2)).await.unwrap();
        let second = store.get(&namespace, "k").await.unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.value, serde_json::json!(2));
    }
}
