use std::{borrow::Cow, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owns the long-lived worker tasks so shutdown can give each one a grace
/// window before aborting it.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn extend<I>(&mut self, tasks: I)
    where
        I: IntoIterator<Item = TaskHandle>,
    {
        for task in tasks {
            self.push(task);
        }
    }

    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            let name = task.name.into_owned();
            let mut handle = task.handle;
            if grace.is_zero() {
                handle.abort();
                let _ = handle.await;
                continue;
            }
            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        debug!(task = %name, ?err, "task join after abort failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grace_window_lets_tasks_finish() {
        let mut mgr = TaskManager::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        mgr.push(TaskHandle::new(
            "finishes",
            tokio::spawn(async move {
                let _ = rx.await;
            }),
        ));
        tx.send(()).unwrap();
        mgr.shutdown_with_grace(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn zero_grace_aborts_stuck_tasks() {
        let mut mgr = TaskManager::new();
        mgr.push(TaskHandle::new(
            "stuck",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        ));
        mgr.shutdown_with_grace(Duration::ZERO).await;
    }
}
