//! Best-effort persistence of job executions.
//!
//! A run writes one [`Execution`] under its id and appends that id to an
//! [`ExecutionIndex`] kept under the job name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::state::{JobState, StateTable};
use crate::task::TaskState;
use crate::DagflowError;

/// Key/value persistence consumed by the coordinator.
#[async_trait]
pub trait Store: Send + Sync {
    async fn set(&self, key: &str, value: Value) -> Result<(), DagflowError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, DagflowError>;
}

/// Typed wrappers over [`Store`].
pub async fn put<T: Serialize + ?Sized>(
    store: &dyn Store,
    key: &str,
    value: &T,
) -> Result<(), DagflowError> {
    let value = serde_json::to_value(value).map_err(|e| DagflowError::Store(e.to_string()))?;
    store.set(key, value).await
}

pub async fn fetch<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<T>, DagflowError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| DagflowError::Store(e.to_string())),
        None => Ok(None),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(&self, key: &str, value: Value) -> Result<(), DagflowError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, DagflowError> {
        Ok(self.entries.read().await.get(key).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub name: String,
    pub state: TaskState,
}

/// The persisted record of one job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    #[serde(rename = "job")]
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub tasks: Vec<TaskExecution>,
}

impl Execution {
    pub fn new(job_name: &str, table: &StateTable) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            state: table.job_state(),
            tasks: table
                .records()
                .iter()
                .map(|r| TaskExecution {
                    name: r.name.clone(),
                    state: r.state,
                })
                .collect(),
        }
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }

    /// Copies the job state and one task's new state into the record.
    pub fn sync(&mut self, job_state: JobState, task: &str, state: TaskState) {
        self.state = job_state;
        if let Some(t) = self.tasks.iter_mut().find(|t| t.name == task) {
            t.state = state;
        }
    }

    /// Copies every task state and the job state from `table`.
    pub fn sync_all(&mut self, table: &StateTable) {
        self.state = table.job_state();
        for task in &mut self.tasks {
            if let Some(state) = table.state_of(&task.name) {
                task.state = state;
            }
        }
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.tasks.iter().find(|t| t.name == name).map(|t| t.state)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIndex {
    pub executions: Vec<Uuid>,
}

/// Writes a new execution and records it in its job's index.
pub async fn persist_new_execution(
    store: &dyn Store,
    execution: &Execution,
) -> Result<(), DagflowError> {
    put(store, &execution.key(), execution).await?;

    let mut index: ExecutionIndex = fetch(store, &execution.job_name)
        .await?
        .unwrap_or_default();
    index.executions.push(execution.id);
    put(store, &execution.job_name, &index).await
}

pub async fn save_execution(store: &dyn Store, execution: &Execution) -> Result<(), DagflowError> {
    put(store, &execution.key(), execution).await
}

/// Reads every persisted execution of `job_name`, oldest first.
pub async fn read_executions(
    store: &dyn Store,
    job_name: &str,
) -> Result<Vec<Execution>, DagflowError> {
    let index: ExecutionIndex = fetch(store, job_name).await?.unwrap_or_default();

    let mut executions = Vec::with_capacity(index.executions.len());
    for id in index.executions {
        if let Some(execution) = fetch(store, &id.to_string()).await? {
            executions.push(execution);
        }
    }
    Ok(executions)
}
