//! A de-duplicating work queue with delayed insertion.
//!
//! An item that is already waiting is not queued twice. An item that is
//! being processed (handed out by [`DelayQueue::get`] and not yet marked
//! [`DelayQueue::done`]) is remembered and queued again once it is done, so
//! that one key is never processed by two workers at the same time.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
}

pub struct DelayQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DelayQueue<T> {
    fn clone(&self) -> Self {
        DelayQueue {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> DelayQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        DelayQueue {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // No critical section below can panic halfway:
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            // Re-queued by `done`.
            return;
        }
        state.queue.push_back(item);
        std::mem::drop(state);
        self.shared.notify.notify_one();
    }

    /// Add `item` once `delay` has passed. Must be called from within a
    /// Tokio runtime.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    // Wake another waiter if there's more work.
                    if !state.queue.is_empty() {
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as processed.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            std::mem::drop(state);
            self.shared.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and release every waiter of `get`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_dedup_and_fifo() {
        let q = DelayQueue::new("test");
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
    }

    #[tokio::test]
    async fn test_readd_while_processing() {
        let q = DelayQueue::new("test");
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
        // Added while in flight: not handed out until `done`.
        q.add("a");
        assert_eq!(q.len(), 0);
        q.done(&"a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after() {
        let q = DelayQueue::new("test");
        q.add_after("late", Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(q.len(), 0);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q: DelayQueue<&'static str> = DelayQueue::new("test");
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("ignored");
        assert_eq!(q.len(), 0);
    }
}
