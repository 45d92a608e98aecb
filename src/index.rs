//! Sandbox Index: which workload is the live sandbox of each user.
//!
//! The lock guarding the map is only ever held for the map operation itself,
//! never across a cluster call.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Index entry for one user's live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxEntry {
    pub namespace: String,
    pub workload: String,
    pub template_id: String,
}

/// Repository of user → sandbox mappings.
#[async_trait]
pub trait SandboxIndex: Send + Sync {
    /// Insert or overwrite the entry for `user_id`. Last writer wins.
    async fn put(&self, user_id: &str, entry: SandboxEntry);
    async fn get(&self, user_id: &str) -> Option<SandboxEntry>;
    /// Remove and return the entry for `user_id`.
    async fn delete(&self, user_id: &str) -> Option<SandboxEntry>;
    /// Remove the entry only if it still points at `workload`.
    async fn delete_if(&self, user_id: &str, workload: &str) -> Option<SandboxEntry>;
}

/// In-process index backed by a single mutex-guarded map.
#[derive(Default)]
pub struct InMemoryIndex {
    entries: Mutex<HashMap<String, SandboxEntry>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxIndex for InMemoryIndex {
    async fn put(&self, user_id: &str, entry: SandboxEntry) {
        self.entries.lock().await.insert(user_id.to_string(), entry);
    }

    async fn get(&self, user_id: &str) -> Option<SandboxEntry> {
        self.entries.lock().await.get(user_id).cloned()
    }

    async fn delete(&self, user_id: &str) -> Option<SandboxEntry> {
        self.entries.lock().await.remove(user_id)
    }

    async fn delete_if(&self, user_id: &str, workload: &str) -> Option<SandboxEntry> {
        let mut entries = self.entries.lock().await;
        match entries.get(user_id) {
            Some(entry) if entry.workload == workload => entries.remove(user_id),
            _ => None,
        }
    }
}
