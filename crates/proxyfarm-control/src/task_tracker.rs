//! Per-agent background task tracking
//!
//! The controller runs one dial loop per known agent. Replacing or removing an
//! agent aborts its loop.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

pub struct TaskTracker {
    /// agent_id -> dial loop
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Track a task, aborting any previous task for the same agent
    pub fn register(&self, agent_id: String, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old_handle) = tasks.insert(agent_id, handle) {
                old_handle.abort();
            }
        }
    }

    /// Abort and forget the task for an agent
    pub fn unregister(&self, agent_id: &str) -> bool {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(agent_id) {
                handle.abort();
                return true;
            }
        }
        false
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(agent_id))
            .unwrap_or(false)
    }

    /// Tracked agent ids
    pub fn ids(&self) -> Vec<String> {
        self.tasks
            .lock()
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
