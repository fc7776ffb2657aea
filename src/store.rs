use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::instrument;

use crate::runner::Runner;

const RUNNER_KEY_PREFIX: &str = "runners:";
const MANAGER_RUNNING_KEY: &str = "manager:running";

fn runner_key(name: &str) -> String {
    format!("{RUNNER_KEY_PREFIX}{name}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("failed to (de)serialize runner record: {0}")]
    Serialization(String),
}

/// Persistent mapping from runner name to `Runner` record, plus the
/// process-wide `manager_running` kill switch.
///
/// Reads and writes are independent operations with last-writer-wins
/// semantics within a single runner key; no cross-key transactions are
/// required (see spec §5, Shared resources).
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Runner>, StoreError>;
    async fn put(&self, runner: &Runner) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<Runner>, StoreError>;
    async fn manager_running(&self) -> Result<bool, StoreError>;
    async fn set_manager_running(&self, running: bool) -> Result<(), StoreError>;
}

/// Redis-backed `Store`. Keys `runners:{name}` hold JSON-serialized `Runner`
/// records; `manager:running` is a singleton boolean key.
///
/// `list` uses `KEYS runners:*`, which is fine at this pool's scale (tens to
/// low hundreds of runners) and avoids the extra cursor bookkeeping a `SCAN`
/// loop would need for no real benefit here.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    #[instrument(skip(self), fields(runner = %name))]
    async fn get(&self, name: &str) -> Result<Option<Runner>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(runner_key(name))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        raw.map(|s| {
            serde_json::from_str(&s).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self, runner), fields(runner = %runner.name))]
    async fn put(&self, runner: &Runner) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let raw =
            serde_json::to_string(runner).map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.set(runner_key(&runner.name), raw)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    #[instrument(skip(self), fields(runner = %name))]
    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del(runner_key(name))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Runner>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(format!("{RUNNER_KEY_PREFIX}*"))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut runners = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str(&raw) {
                Ok(runner) => runners.push(runner),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping corrupt runner record"),
            }
        }
        Ok(runners)
    }

    #[instrument(skip(self))]
    async fn manager_running(&self) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(MANAGER_RUNNING_KEY)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(raw.map(|s| s == "true").unwrap_or(true))
    }

    #[instrument(skip(self))]
    async fn set_manager_running(&self, running: bool) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set(MANAGER_RUNNING_KEY, if running { "true" } else { "false" })
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

/// In-memory `Store` used by tests and the fake-client integration scenarios
/// in `reconciler.rs`. Not used in production -- the Redis backend is.
#[derive(Default)]
pub struct InMemoryStore {
    runners: Mutex<HashMap<String, Runner>>,
    manager_running: Mutex<bool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            manager_running: Mutex::new(true),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Runner>, StoreError> {
        Ok(self.runners.lock().unwrap().get(name).cloned())
    }

    async fn put(&self, runner: &Runner) -> Result<(), StoreError> {
        self.runners
            .lock()
            .unwrap()
            .insert(runner.name.clone(), runner.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.runners.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Runner>, StoreError> {
        Ok(self.runners.lock().unwrap().values().cloned().collect())
    }

    async fn manager_running(&self) -> Result<bool, StoreError> {
        Ok(*self.manager_running.lock().unwrap())
    }

    async fn set_manager_running(&self, running: bool) -> Result<(), StoreError> {
        *self.manager_running.lock().unwrap() = running;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Runner, Status};
    use crate::vm_type::{CloudConfig, Quantity, VmType};

    fn sample_runner(name: &str) -> Runner {
        let vm_type = VmType::new(
            vec!["small".into()],
            CloudConfig {
                image: "img".into(),
                flavor: "flv".into(),
                network: "net".into(),
                key_name: "key".into(),
                runner_user: "runner".into(),
                runner_group: "runner".into(),
            },
            Quantity { min: 1, max: 2 },
        );
        let mut runner = Runner::new(name.into(), vm_type);
        runner.status = Status::Online;
        runner.status_history = vec![Status::Creating, Status::Offline];
        runner.action_id = Some(42);
        runner
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_runner() {
        let store = InMemoryStore::new();
        let runner = sample_runner("runner-os-org-abc-0");
        store.put(&runner).await.unwrap();

        let loaded = store.get(&runner.name).await.unwrap().unwrap();
        assert_eq!(loaded.name, runner.name);
        assert_eq!(loaded.status, runner.status);
        assert_eq!(loaded.status_history, runner.status_history);
        assert_eq!(loaded.action_id, runner.action_id);
    }

    #[tokio::test]
    async fn delete_removes_entry_and_list_reflects_it() {
        let store = InMemoryStore::new();
        let runner = sample_runner("runner-os-org-abc-0");
        store.put(&runner).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&runner.name).await.unwrap();
        assert!(store.get(&runner.name).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manager_running_defaults_true_and_is_settable() {
        let store = InMemoryStore::new();
        assert!(store.manager_running().await.unwrap());
        store.set_manager_running(false).await.unwrap();
        assert!(!store.manager_running().await.unwrap());
    }

    #[test]
    fn runner_json_round_trip_preserves_symbolic_status_names() {
        let runner = sample_runner("runner-os-org-abc-0");
        let raw = serde_json::to_string(&runner).unwrap();
        assert!(raw.contains("\"online\""));
        assert!(raw.contains("\"creating\""));
        let restored: Runner = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored.status, runner.status);
        assert_eq!(restored.status_history, runner.status_history);
    }
}
