use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::ChronosError;
use crate::task::handle::Task;

/// Fan the outcome channels of `tasks` into one channel of errors.
///
/// Each task contributes at most one value: its first outcome, forwarded only
/// when it is an error. Once every task has finished cleanly the returned
/// channel closes. Tasks whose outcome receiver was already taken are skipped.
pub fn first_error(tasks: &[Arc<Task>]) -> mpsc::Receiver<ChronosError> {
    let (tx, rx) = mpsc::channel(tasks.len().max(1));

    for task in tasks {
        let Some(mut outcomes) = task.take_outcomes() else {
            warn!(task = %task.id(), "Task outcomes already taken");
            continue;
        };
        let tx = tx.clone();
        let id = task.id().to_string();

        tokio::spawn(async move {
            if let Some(Err(e)) = outcomes.recv().await {
                debug!(task = %id, error = %e, "Task reported an error");
                let _ = tx.send(e).await;
            }
        });
    }

    rx
}

/// Registry of the tasks running for the current agent role.
#[derive(Default)]
pub struct TaskManager {
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: Arc<Task>) {
        self.tasks.lock().push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .map(|task| task.id().to_string())
            .collect()
    }

    /// Stop every registered task concurrently and wait for all of them, then
    /// clear the registry.
    pub async fn stop_all_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        let count = tasks.len();
        let mut stopping = JoinSet::new();
        for task in tasks {
            stopping.spawn(async move {
                task.stop().await;
            });
        }

        while let Some(result) = stopping.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Task stop panicked");
            }
        }
        debug!(count, "All tasks stopped");
    }
}
