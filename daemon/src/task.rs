//! Single-flight background tasks keyed by `<class>-<name>`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{event, Instrument, Level};

pub const INITIALIZE_VM: &str = "initialize-vm";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task already exists: {0}")]
    AlreadyExists(String),

    #[error("timeout after {timeout:?} waiting for task {key} to terminate")]
    Timeout { key: String, timeout: Duration },
}

pub fn task_key(class: &str, name: &str) -> String {
    format!("{class}-{name}")
}

pub struct TaskMgr {
    tasks: Mutex<HashMap<String, CancellationToken>>,
    poll: Duration,
}

impl TaskMgr {
    pub fn new(poll: Duration) -> Arc<Self> {
        Arc::new(TaskMgr {
            tasks: Mutex::new(HashMap::new()),
            poll,
        })
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn running(&self, key: &str) -> bool {
        self.tasks().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tasks().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run `task` in the background unless a task with the same key is
    /// already running. The task gets a token that [`TaskMgr::terminate`]
    /// cancels.
    pub fn send<F, Fut>(self: &Arc<Self>, class: &str, name: &str, task: F) -> Result<(), TaskError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let key = task_key(class, name);
        let cancel = CancellationToken::new();
        {
            let mut tasks = self.tasks();
            if tasks.contains_key(&key) {
                return Err(TaskError::AlreadyExists(key));
            }
            tasks.insert(key.clone(), cancel.clone());
        }

        let fut = task(cancel);
        let this = self.clone();
        let span = tracing::info_span!("task", %key);
        tokio::spawn(
            async move {
                event!(Level::INFO, "Task started");
                match fut.await {
                    Ok(()) => event!(Level::INFO, "Task finished"),
                    Err(e) => event!(Level::WARN, "Task failed: {e:#}"),
                }
                this.tasks().remove(&key);
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Cancel the task under `key` and wait until it is gone. Returns
    /// immediately if no such task runs.
    pub async fn terminate(&self, key: &str, timeout: Duration) -> Result<(), TaskError> {
        let Some(cancel) = self.tasks().get(key).cloned() else {
            return Ok(());
        };
        cancel.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.poll);
        loop {
            ticker.tick().await;
            if !self.running(key) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TaskError::Timeout {
                    key: key.to_string(),
                    timeout,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_single_flight() {
        let mgr = TaskMgr::new(Duration::from_millis(10));
        let (tx, rx) = oneshot::channel::<()>();

        mgr.send(INITIALIZE_VM, "vm1", |_| async move {
            let _ = rx.await;
            Ok(())
        })
        .unwrap();
        assert!(mgr.running("initialize-vm-vm1"));

        let err = mgr
            .send(INITIALIZE_VM, "vm1", |_| async { Ok(()) })
            .unwrap_err();
        assert_eq!(err, TaskError::AlreadyExists("initialize-vm-vm1".into()));
        assert_eq!(err.to_string(), "task already exists: initialize-vm-vm1");

        // Other keys are independent:
        mgr.send(INITIALIZE_VM, "vm2", |_| async { Ok(()) }).unwrap();

        tx.send(()).unwrap();
        for _ in 0..100 {
            if mgr.keys().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mgr.keys().is_empty());
        mgr.send(INITIALIZE_VM, "vm1", |_| async { Ok(()) }).unwrap();
    }

    #[tokio::test]
    async fn test_terminate() {
        let mgr = TaskMgr::new(Duration::from_millis(10));
        mgr.send(INITIALIZE_VM, "vm1", |cancel| async move {
            cancel.cancelled().await;
            anyhow::bail!("cancelled")
        })
        .unwrap();

        mgr.terminate("initialize-vm-vm1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!mgr.running("initialize-vm-vm1"));
        // Nothing to terminate:
        mgr.terminate("initialize-vm-vm1", Duration::from_millis(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminate_timeout() {
        let mgr = TaskMgr::new(Duration::from_millis(10));
        mgr.send(INITIALIZE_VM, "stubborn", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .unwrap();

        let err = mgr
            .terminate("initialize-vm-stubborn", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Timeout { .. }));
    }
}
