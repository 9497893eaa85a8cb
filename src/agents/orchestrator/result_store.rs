//! Task result persistence (spec.md §4 optional `TaskStore` port). Live
//! task state lives in the [`super::TaskQueue`]; this store only holds
//! finished-task records, kept indefinitely by default until a host
//! calls `cleanup`. A host can supply any other [`TaskStore`]
//! implementation (database, object storage) without the orchestrator
//! noticing.

use crate::error::Result;
use crate::models::TaskResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_result(&self, id: String, result: TaskResult) -> Result<()>;
    async fn find_result(&self, id: &str) -> Result<Option<TaskResult>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn all_results(&self) -> Result<Vec<TaskResult>>;
    /// Drops results older than `older_than_ms`. Returns how many were
    /// removed.
    async fn cleanup(&self, older_than_ms: i64, now: chrono::DateTime<chrono::Utc>) -> Result<usize>;
}

#[derive(Clone)]
pub struct InMemoryTaskStore {
    results: Arc<Mutex<HashMap<String, TaskResult>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            results: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    pub async fn clear(&self) {
        let mut results = self.results.lock().await;
        let count = results.len();
        results.clear();
        info!(count, "cleared result store");
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_result(&self, id: String, result: TaskResult) -> Result<()> {
        let mut results = self.results.lock().await;
        debug!(task_id = %id, "stored task result");
        results.insert(id, result);
        Ok(())
    }

    async fn find_result(&self, id: &str) -> Result<Option<TaskResult>> {
        Ok(self.results.lock().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.results.lock().await.remove(id);
        Ok(())
    }

    async fn all_results(&self) -> Result<Vec<TaskResult>> {
        Ok(self.results.lock().await.values().cloned().collect())
    }

    async fn cleanup(&self, older_than_ms: i64, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let mut results = self.results.lock().await;
        let before = results.len();
        results.retain(|_, r| (now - r.completed_at).num_milliseconds() <= older_than_ms);
        let removed = before - results.len();
        if removed > 0 {
            info!(removed, "cleaned up old task results");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskExecutionResult, TaskStatus};

    fn result(id: &str, completed_at: chrono::DateTime<chrono::Utc>) -> TaskResult {
        TaskResult {
            task_id: id.to_string(),
            status: TaskStatus::Completed,
            result: Some(TaskExecutionResult::Success {
                output: serde_json::json!({"ok": true}),
            }),
            error: None,
            duration_ms: 42,
            completed_at,
        }
    }

    #[tokio::test]
    async fn store_and_retrieve_roundtrip() {
        let store = InMemoryTaskStore::new();
        let now = chrono::Utc::now();
        store.save_result("t1".into(), result("t1", now)).await.unwrap();

        let retrieved = store.find_result("t1").await.unwrap().unwrap();
        assert_eq!(retrieved.task_id, "t1");
    }

    #[tokio::test]
    async fn results_are_kept_indefinitely_until_cleanup() {
        let store = InMemoryTaskStore::new();
        let now = chrono::Utc::now();
        for i in 0..50 {
            store
                .save_result(format!("t{i}"), result(&format!("t{i}"), now))
                .await
                .unwrap();
        }
        assert_eq!(store.len().await, 50);
    }

    #[tokio::test]
    async fn cleanup_drops_only_results_older_than_threshold() {
        let store = InMemoryTaskStore::new();
        let now = chrono::Utc::now();
        store
            .save_result("old".into(), result("old", now - chrono::Duration::hours(2)))
            .await
            .unwrap();
        store.save_result("new".into(), result("new", now)).await.unwrap();

        let removed = store.cleanup(3_600_000, now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_result("old").await.unwrap().is_none());
        assert!(store.find_result("new").await.unwrap().is_some());
    }
}
