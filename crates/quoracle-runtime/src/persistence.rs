//! Persistence contract (§6 "Persisted AgentState (restore contract)").
//!
//! Per §1, the persistence *store schema* is an external collaborator —
//! only the save/restore contract is specified here. `PersistenceRecord` is
//! exactly the field list §6 names; `system_prompt`, `capability_groups`,
//! and `max_refinement_rounds` are deliberately absent (derived on restore,
//! never persisted, per invariant 5 and the Restore algorithm in §4.9).

use crate::history::{AgentConfig, AgentState, ChildRef};
use async_trait::async_trait;
use quoracle_llm::ModelSpec;
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Everything required for a faithful restore, per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub agent_id: String,
    pub task_id: String,
    pub parent_id: Option<String>,
    pub profile_name: String,
    pub prompt_fields: crate::history::PromptFields,
    pub model_pool: Vec<ModelSpec>,
    pub model_histories: HashMap<ModelSpec, Vec<crate::history::HistoryEntry>>,
    pub context_lessons: HashMap<ModelSpec, Vec<crate::history::Lesson>>,
    pub model_states: HashMap<ModelSpec, String>,
    pub todos: Vec<serde_json::Value>,
    pub children: Vec<ChildRef>,
    /// JSON bag that round-trips atom-keyed config through string keys (§6).
    pub config: serde_json::Value,
}

impl PersistenceRecord {
    /// Build the persisted record from live state. `capability_groups` and
    /// `max_refinement_rounds` are intentionally excluded (§4.9 Restore:
    /// "re-resolve ... from the profile catalog (not persisted)").
    pub fn from_state(state: &AgentState) -> Self {
        Self {
            agent_id: state.config.agent_id.clone(),
            task_id: state.config.task_id.clone(),
            parent_id: state.config.parent_id.clone(),
            profile_name: state.config.profile_name.clone(),
            prompt_fields: state.config.prompt_fields.clone(),
            model_pool: state.config.model_pool.clone(),
            model_histories: state.model_histories.clone(),
            context_lessons: state.context_lessons.clone(),
            model_states: state.model_states.clone(),
            todos: state.todos.clone(),
            children: state.children.clone(),
            config: serde_json::json!({}),
        }
    }

    /// Rebuild an `AgentState` from a persisted record (§4.9 Restore).
    /// `capability_groups` and `max_refinement_rounds` must be re-resolved
    /// by the caller from the current profile catalog — they are not on
    /// this record at all, so staleness is structurally impossible.
    pub fn restore(
        self,
        capability_groups: Vec<String>,
        max_refinement_rounds: u32,
    ) -> AgentState {
        let config = AgentConfig {
            agent_id: self.agent_id,
            task_id: self.task_id,
            parent_id: self.parent_id,
            profile_name: self.profile_name,
            model_pool: self.model_pool,
            capability_groups,
            prompt_fields: self.prompt_fields,
            max_refinement_rounds,
        };
        let mut state = AgentState::new(config);
        state.model_histories = self.model_histories;
        state.context_lessons = self.context_lessons;
        state.model_states = self.model_states;
        state.todos = self.todos;
        state.children = self.children;
        // §9 "restoration_mode": suppresses the first re-persist so restore
        // doesn't storm the store on the very next event.
        state.restoration_mode = true;
        state
    }
}

/// Save/restore/delete contract. The runtime depends only on this trait;
/// concrete backends (sqlite here, or a remote KV store) are swappable.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save(&self, record: &PersistenceRecord) -> anyhow::Result<()>;
    async fn load(&self, agent_id: &str) -> anyhow::Result<Option<PersistenceRecord>>;
    async fn delete(&self, agent_id: &str) -> anyhow::Result<()>;
    /// Delete an agent's persisted logs/messages alongside its record
    /// (§4.9 Dismiss tree: "delete persisted records (agent, logs, messages)").
    async fn delete_agent_logs(&self, agent_id: &str) -> anyhow::Result<()> {
        let _ = agent_id;
        Ok(())
    }
}

/// In-memory store for tests and single-process deployments without a
/// durable backend requirement.
#[derive(Default)]
pub struct InMemoryPersistenceStore {
    records: Mutex<HashMap<String, PersistenceRecord>>,
}

impl InMemoryPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryPersistenceStore {
    async fn save(&self, record: &PersistenceRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.agent_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, agent_id: &str) -> anyhow::Result<Option<PersistenceRecord>> {
        Ok(self.records.lock().unwrap().get(agent_id).cloned())
    }

    async fn delete(&self, agent_id: &str) -> anyhow::Result<()> {
        self.records.lock().unwrap().remove(agent_id);
        Ok(())
    }
}

const MIGRATIONS: &[M] = &[M::up(
    "CREATE TABLE agents (
        agent_id TEXT PRIMARY KEY,
        record_json TEXT NOT NULL
    );",
)];

/// `rusqlite` backend, grounded on the teacher's `SqliteSessionStore`
/// (`crates/agent/src/session/sqlite.rs`): a single connection behind a
/// blocking-task boundary, schema applied via `rusqlite_migration`. The
/// table is a single JSON blob column — §1 scopes the store *schema* out;
/// this crate only needs the save/restore round-trip to work.
pub struct SqlitePersistenceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistenceStore {
    pub async fn connect(path: &Path) -> anyhow::Result<Self> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
            let mut conn = Connection::open(path)?;
            Migrations::new(MIGRATIONS.to_vec()).to_latest(&mut conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            f(&conn)
        })
        .await?
        .map_err(anyhow::Error::from)
    }
}

#[async_trait]
impl PersistenceStore for SqlitePersistenceStore {
    async fn save(&self, record: &PersistenceRecord) -> anyhow::Result<()> {
        let agent_id = record.agent_id.clone();
        let json = serde_json::to_string(record)?;
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO agents (agent_id, record_json) VALUES (?1, ?2)
                 ON CONFLICT(agent_id) DO UPDATE SET record_json = excluded.record_json",
                rusqlite::params![agent_id, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, agent_id: &str) -> anyhow::Result<Option<PersistenceRecord>> {
        let agent_id = agent_id.to_string();
        let json: Option<String> = self
            .run_blocking(move |conn| {
                conn.query_row(
                    "SELECT record_json FROM agents WHERE agent_id = ?1",
                    rusqlite::params![agent_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(e),
                })
            })
            .await?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    async fn delete(&self, agent_id: &str) -> anyhow::Result<()> {
        let agent_id = agent_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM agents WHERE agent_id = ?1", rusqlite::params![agent_id])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::PromptFields;

    fn sample_state() -> AgentState {
        let config = AgentConfig {
            agent_id: "a1".into(),
            task_id: "t1".into(),
            parent_id: None,
            profile_name: "default".into(),
            model_pool: vec![ModelSpec::new("mA")],
            capability_groups: vec!["core".into()],
            prompt_fields: PromptFields {
                role: "assistant".into(),
                style: "terse".into(),
                constraints: vec![],
            },
            max_refinement_rounds: 4,
        };
        let mut state = AgentState::new(config);
        state.append_to_all_histories(crate::history::HistoryEntry::event("hi", 1));
        state
    }

    #[tokio::test]
    async fn in_memory_round_trip_preserves_histories() {
        let store = InMemoryPersistenceStore::new();
        let state = sample_state();
        let record = PersistenceRecord::from_state(&state);
        store.save(&record).await.unwrap();

        let loaded = store.load("a1").await.unwrap().expect("record present");
        let restored = loaded.restore(vec!["core".into()], 4);
        assert_eq!(
            restored.model_histories[&ModelSpec::new("mA")].len(),
            state.model_histories[&ModelSpec::new("mA")].len()
        );
        assert!(restored.restoration_mode);
    }

    #[tokio::test]
    async fn missing_record_loads_as_none() {
        let store = InMemoryPersistenceStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_via_tempfile() {
        let dir = std::env::temp_dir().join(format!("quoracle-test-{}", uuid::Uuid::new_v4()));
        let store = SqlitePersistenceStore::connect(&dir).await.unwrap();
        let state = sample_state();
        let record = PersistenceRecord::from_state(&state);
        store.save(&record).await.unwrap();
        let loaded = store.load("a1").await.unwrap().expect("present");
        assert_eq!(loaded.agent_id, "a1");
        store.delete("a1").await.unwrap();
        assert!(store.load("a1").await.unwrap().is_none());
        let _ = std::fs::remove_file(&dir);
    }
}
