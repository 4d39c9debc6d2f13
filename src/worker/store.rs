//! # Task Storage
//!
//! The worker only needs two questions answered by storage: which tasks are
//! stale, and "complete this one if nobody else settled it first". The
//! [`TaskStore`] trait captures exactly that; [`MemoryTaskStore`] is the
//! in-process implementation used by tests and demos.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Opaque task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wraps an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not started.
    Pending,
    /// Someone is working on it.
    InProgress,
    /// Done.
    Completed,
}

impl TaskStatus {
    /// `true` for states the worker must never touch.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A stored task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier.
    pub id: TaskId,
    /// Title.
    pub title: String,
    /// Current state.
    pub status: TaskStatus,
    /// Creation time; staleness is measured from here.
    pub created_at: DateTime<Utc>,
}

/// Result of a conditional completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The task was still open and is now completed.
    Completed,
    /// The task was already completed or no longer exists.
    AlreadySettled,
}

/// Storage operations the completion worker relies on.
pub trait TaskStore: Send + Sync {
    /// Ids of non-terminal tasks created more than `older_than` ago, oldest first.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the query fails.
    fn stale_pending(&self, older_than: Duration) -> Result<Vec<TaskId>, StoreError>;

    /// Marks `id` completed only if it is not already in a terminal state.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the update fails.
    fn complete_if_pending(&self, id: &TaskId) -> Result<CompletionOutcome, StoreError>;
}

/// In-memory [`TaskStore`].
///
/// ```rust
/// use std::time::Duration;
/// use tasker::{CompletionOutcome, MemoryTaskStore, TaskStore};
///
/// let store = MemoryTaskStore::new();
/// let id = store.create("write report");
///
/// assert!(store.stale_pending(Duration::from_secs(60)).unwrap().is_empty());
/// assert_eq!(store.complete_if_pending(&id).unwrap(), CompletionOutcome::Completed);
/// assert_eq!(store.complete_if_pending(&id).unwrap(), CompletionOutcome::AlreadySettled);
/// ```
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a task.
    pub fn insert(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    /// Creates a pending task with a random id.
    pub fn create(&self, title: impl Into<String>) -> TaskId {
        let id = TaskId::new(uuid::Uuid::new_v4().to_string());
        self.insert(Task {
            id: id.clone(),
            title: title.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        });
        id
    }

    /// Copy of a task.
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    /// Sets a task's status unconditionally, as a user edit would.
    ///
    /// Returns `false` if the task does not exist.
    pub fn set_status(&self, id: &TaskId, status: TaskStatus) -> bool {
        match self.tasks.lock().get_mut(id) {
            Some(task) => {
                task.status = status;
                true
            }
            None => false,
        }
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// `true` if no tasks are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStore for MemoryTaskStore {
    fn stale_pending(&self, older_than: Duration) -> Result<Vec<TaskId>, StoreError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|err| StoreError::Operation(format!("age out of range: {err}")))?;
        let cutoff = Utc::now() - age;

        let tasks = self.tasks.lock();
        let mut stale: Vec<&Task> = tasks
            .values()
            .filter(|task| !task.status.is_terminal() && task.created_at < cutoff)
            .collect();
        stale.sort_by_key(|task| task.created_at);
        Ok(stale.into_iter().map(|task| task.id.clone()).collect())
    }

    fn complete_if_pending(&self, id: &TaskId) -> Result<CompletionOutcome, StoreError> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Completed;
                Ok(CompletionOutcome::Completed)
            }
            _ => Ok(CompletionOutcome::AlreadySettled),
        }
    }
}
