use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::queue::DelayQueue;

/// Pool size a new [`WorkerMgr`] starts with.
pub const DEFAULT_QUEUE_SIZE: usize = 10;

/// One unit of work handed to a [`Handler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub key: String,
    pub worker_id: String,
    pub queue_name: String,
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process `req`. `cancel` fires when the key is cancelled through
    /// [`WorkerMgr::cancel_by`], or when the worker itself is removed.
    async fn handle(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerMgrConfig {
    pub size: usize,
    /// Pause between two lifetimes of a worker.
    pub restart_interval: Duration,
    /// How long a worker sleeps while the [`Action`] is frozen.
    pub frozen_sleep: Duration,
}

impl Default for WorkerMgrConfig {
    fn default() -> Self {
        WorkerMgrConfig {
            size: DEFAULT_QUEUE_SIZE,
            restart_interval: Duration::from_secs(5),
            frozen_sleep: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Current {
    key: Option<String>,
    cancel: Option<CancellationToken>,
}

struct Thread {
    cancel: CancellationToken,
    current: Arc<Mutex<Current>>,
}

struct Pool {
    enabled: bool,
    workers: HashMap<String, Thread>,
    /// Worker IDs, oldest first.
    order: Vec<String>,
    queue: DelayQueue<String>,
}

/// A named, resizable pool of workers draining a [`DelayQueue`] of keys.
pub struct WorkerMgr {
    name: String,
    handler: Arc<dyn Handler>,
    action: Arc<Action>,
    config: WorkerMgrConfig,
    pool: Mutex<Pool>,
    this: Weak<WorkerMgr>,
}

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkerMgr {
    /// Create the pool and start `config.size` workers. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        action: Arc<Action>,
        config: WorkerMgrConfig,
    ) -> Arc<Self> {
        let name = name.into();
        log::info!("worker manager name: {name}");
        let size = config.size;
        let mgr = Arc::new_cyclic(|this| WorkerMgr {
            name: name.clone(),
            handler,
            action,
            config,
            pool: Mutex::new(Pool {
                enabled: false,
                workers: HashMap::new(),
                order: Vec::new(),
                queue: DelayQueue::new(name.clone()),
            }),
            this: this.clone(),
        });
        mgr.resize_worker(size);
        mgr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &Arc<Action> {
        &self.action
    }

    pub fn thread_count(&self) -> usize {
        lock(&self.pool).workers.len()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.pool).queue.len()
    }

    pub fn enabled(&self) -> bool {
        lock(&self.pool).enabled
    }

    fn id(&self, key: &str) -> String {
        format!("{}.{}", self.name, key)
    }

    /// Cancel every worker, drop all queued keys and disable the pool.
    /// [`WorkerMgr::resize_worker`] brings it back.
    pub fn reset(&self) {
        let mut pool = lock(&self.pool);
        pool.enabled = false;
        log::info!("[{}] reset worker", self.name);
        for (id, thread) in pool.workers.drain() {
            thread.cancel.cancel();
            log::info!("[{}] reset worker thread", self.id(&id));
        }
        pool.order.clear();
        pool.queue.shut_down();
        pool.queue = DelayQueue::new(self.name.clone());
    }

    pub fn enqueue(&self, key: impl Into<String>) {
        let key = key.into();
        let pool = lock(&self.pool);
        if !pool.enabled {
            log::info!("worker [{}] is not enabled, dropping {key}", self.name);
            return;
        }
        pool.queue.add(key);
    }

    pub fn enqueue_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        let pool = lock(&self.pool);
        if !pool.enabled {
            log::info!("worker [{}] is not enabled, dropping {key}", self.name);
            return;
        }
        pool.queue.add_after(key, delay);
    }

    /// Grow or shrink the pool to `size` workers. Shrinking cancels the
    /// oldest workers first; `0` disables enqueueing.
    pub fn resize_worker(&self, size: usize) {
        let mut pool = lock(&self.pool);
        pool.enabled = size > 0;
        log::info!("[{}] worker manager resize to {size}", self.name);

        let current = pool.workers.len();
        if size > current {
            for _ in current..size {
                let id = random_id(10);
                self.run_worker(&mut pool, id);
            }
        } else if size < current {
            let remove: Vec<String> = pool.order.drain(..current - size).collect();
            for id in remove {
                if let Some(thread) = pool.workers.remove(&id) {
                    thread.cancel.cancel();
                    log::info!("[{}] cancel worker", self.id(&id));
                }
            }
        }
    }

    /// `[id:key]` for every worker, `NoExecutionPlan` when idle.
    pub fn worker_info(&self) -> String {
        let pool = lock(&self.pool);
        pool.order
            .iter()
            .filter_map(|id| pool.workers.get(id).map(|t| (id, t)))
            .map(|(id, thread)| {
                let current = lock(&thread.current);
                format!(
                    "[{}:{}]",
                    id,
                    current.key.as_deref().unwrap_or("NoExecutionPlan")
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Cancel the in-flight handler of whichever worker currently holds
    /// `key`. Returns how many handlers were cancelled.
    pub fn cancel_by(&self, key: &str) -> usize {
        let pool = lock(&self.pool);
        let mut cancelled = 0;
        for (id, thread) in pool.workers.iter() {
            let current = lock(&thread.current);
            if current.key.as_deref() == Some(key) {
                if let Some(ref cancel) = current.cancel {
                    cancel.cancel();
                    cancelled += 1;
                    log::info!("cancel thread {} for {key}", self.id(id));
                }
            }
        }
        cancelled
    }

    fn run_worker(&self, pool: &mut Pool, id: String) {
        let cancel = CancellationToken::new();
        let current = Arc::new(Mutex::new(Current::default()));
        pool.workers.insert(
            id.clone(),
            Thread {
                cancel: cancel.clone(),
                current: current.clone(),
            },
        );
        pool.order.push(id.clone());
        log::debug!("[{}] start worker thread", self.id(&id));

        let this = self.this.clone();
        let restart_interval = self.config.restart_interval;
        tokio::spawn(async move {
            // Supervising loop: every lifetime of the worker processes at
            // most one key, then the worker is restarted after
            // `restart_interval`.
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(mgr) = this.upgrade() else {
                    break;
                };
                mgr.poll_once(&id, &cancel, &current).await;
                std::mem::drop(mgr);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(restart_interval) => (),
                }
            }
            log::debug!("worker {id} exited");
        });
    }

    async fn poll_once(&self, id: &str, cancel: &CancellationToken, current: &Mutex<Current>) {
        let queue = loop {
            if cancel.is_cancelled() {
                return;
            }
            if self.action.frozen() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.frozen_sleep) => continue,
                }
            }
            break lock(&self.pool).queue.clone();
        };

        let key = tokio::select! {
            _ = cancel.cancelled() => return,
            key = queue.get() => match key {
                Some(key) => key,
                None => return,
            },
        };

        let call_cancel = cancel.child_token();
        {
            let mut current = lock(current);
            current.key = Some(key.clone());
            current.cancel = Some(call_cancel.clone());
        }

        let req = Request {
            key: key.clone(),
            worker_id: id.to_string(),
            queue_name: self.name.clone(),
        };
        let res = self.handler.handle(call_cancel, req).await;

        *lock(current) = Current::default();
        queue.done(&key);

        match res {
            Ok(()) => log::info!("[{}] done: {key}", self.id(id)),
            Err(e) => log::error!("[{}] run task {key} error: {e:#}", self.id(id)),
        }
    }
}

impl Drop for WorkerMgr {
    fn drop(&mut self) {
        let pool = lock(&self.pool);
        for thread in pool.workers.values() {
            thread.cancel.cancel();
        }
        pool.queue.shut_down();
    }
}
