//! Per-machine port forwarding.
//!
//! A [`ForwardMgr`] owns a set of [`Forwarder`]s keyed by their canonical
//! rule string. Each forwarder binds a host endpoint and splices every
//! accepted connection to its forward endpoint, which is either another host
//! socket or a guest vsock port reached through a backend [`Dialer`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{error, warn};
use tokio::task::JoinHandle;

mod dialer;
mod forwarder;
mod rule;

pub use dialer::{BoxStream, Dialer, DirectDialer, Stream};
pub use forwarder::{bicopy, Forwarder, Listener, DEFAULT_RETRY};
pub use rule::{Endpoint, Network, Rule, RuleError};

struct Entry {
    forwarder: Arc<Forwarder>,
    task: JoinHandle<()>,
}

impl Entry {
    async fn shutdown(self) {
        self.forwarder.stop();
        if let Err(e) = self.task.await {
            error!("forwarder task for {} failed: {e}", self.forwarder.rule());
        }
    }
}

pub struct ForwardMgr {
    fwd: Mutex<HashMap<String, Entry>>,
    retry: Duration,
}

impl Default for ForwardMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardMgr {
    pub fn new() -> Self {
        ForwardMgr {
            fwd: Mutex::new(HashMap::new()),
            retry: DEFAULT_RETRY,
        }
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    fn fwd(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.fwd.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Parse `rule` and start forwarding it. See [`ForwardMgr::add`].
    pub async fn add_by(&self, rule: &str, dialer: Option<Arc<dyn Dialer>>) -> Result<()> {
        let rule: Rule = rule.parse()?;
        let forwarder = Forwarder::new(rule, dialer)?.with_retry(self.retry);
        self.add(forwarder).await
    }

    /// Bind `forwarder` and serve it in the background. A forwarder already
    /// registered for the same rule is stopped, and its listener closed,
    /// before the new one binds.
    pub async fn add(&self, forwarder: Forwarder) -> Result<()> {
        let key = forwarder.rule().key();

        let previous = self.fwd().remove(&key);
        if let Some(previous) = previous {
            warn!("duplicated forward rule: {}", previous.forwarder.bind_addr());
            previous.shutdown().await;
        }

        let listener = forwarder.listen().await?;
        let forwarder = Arc::new(forwarder);
        let task_forwarder = forwarder.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = task_forwarder.serve(listener).await {
                error!("request forwarder: {e:#}");
            }
        });

        let raced = self.fwd().insert(key, Entry { forwarder, task });
        if let Some(raced) = raced {
            raced.shutdown().await;
        }
        Ok(())
    }

    /// Stop and forget the forwarder for `key`. Returns whether one existed.
    pub async fn remove(&self, key: &str) -> bool {
        let entry = self.fwd().remove(key);
        match entry {
            Some(entry) => {
                entry.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.fwd().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.fwd().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn stop_all(&self) {
        let entries: Vec<Entry> = self.fwd().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.shutdown().await;
        }
    }
}

impl fmt::Display for ForwardMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fwd = self.fwd();
        let binds: Vec<String> = fwd
            .values()
            .take(10)
            .map(|e| e.forwarder.bind_addr().to_string())
            .collect();
        write!(f, "total[{}] forward rule: {:?}", fwd.len(), binds)
    }
}
