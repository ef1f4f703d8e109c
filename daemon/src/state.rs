//! In-memory runtime state of every machine.
//!
//! Each machine gets its own async mutex, so lifecycle operations on the
//! same machine queue up behind each other while operations on different
//! machines proceed independently. The name map has a separate, short-held
//! lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use meridian_rs::machine::Machine;

pub struct VmState {
    pub machine: Machine,

    /// `true` while a start is in flight, i.e. from launching the host
    /// agent until the start health poll finished.
    pub starting: watch::Sender<bool>,

    /// Cancels the in-flight start health poll.
    pub start_cancel: Option<CancellationToken>,

    /// Start the machine as soon as its initialization completes.
    pub run_after_init: bool,

    /// Consecutive failed health sweeps.
    pub failures: u32,

    /// When the health sweep last re-enqueued this machine.
    pub last_heal: Option<Instant>,
}

impl VmState {
    pub fn new(machine: Machine) -> Self {
        let (starting, _) = watch::channel(false);
        VmState {
            machine,
            starting,
            start_cancel: None,
            run_after_init: false,
            failures: 0,
            last_heal: None,
        }
    }

    pub fn is_starting(&self) -> bool {
        *self.starting.borrow()
    }

    /// Mark a start as in flight and return the token cancelling it.
    pub fn begin_start(&mut self) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.start_cancel = Some(cancel.clone());
        self.starting.send_replace(true);
        cancel
    }

    pub fn end_start(&mut self) {
        self.start_cancel = None;
        self.starting.send_replace(false);
    }

    /// Cancel an in-flight start, returning a receiver that turns `false`
    /// once it has quiesced.
    pub fn cancel_start(&self) -> watch::Receiver<bool> {
        if let Some(ref cancel) = self.start_cancel {
            cancel.cancel();
        }
        self.starting.subscribe()
    }
}

pub type SharedVmState = Arc<tokio::sync::Mutex<VmState>>;

#[derive(Default)]
pub struct VmStateMgr {
    states: Mutex<HashMap<String, SharedVmState>>,
}

impl VmStateMgr {
    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedVmState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<SharedVmState> {
        self.states().get(name).cloned()
    }

    /// Insert a new machine. Returns `None` if the name is taken.
    pub fn insert(&self, machine: Machine) -> Option<SharedVmState> {
        let mut states = self.states();
        if states.contains_key(&machine.name) {
            return None;
        }
        let state = Arc::new(tokio::sync::Mutex::new(VmState::new(machine.clone())));
        states.insert(machine.name, state.clone());
        Some(state)
    }

    pub fn remove(&self, name: &str) -> Option<SharedVmState> {
        self.states().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.states().contains_key(name)
    }

    /// Snapshot of every machine state handle, sorted by name.
    pub fn all(&self) -> Vec<(String, SharedVmState)> {
        let mut all: Vec<(String, SharedVmState)> = self
            .states()
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use meridian_rs::spec::VmSpec;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_start_waits_for_quiesce() {
        let mgr = VmStateMgr::default();
        let state = mgr.insert(Machine::new("vm1", VmSpec::default())).unwrap();
        assert!(mgr.insert(Machine::new("vm1", VmSpec::default())).is_none());

        let cancel = state.lock().await.begin_start();
        assert!(state.lock().await.is_starting());

        let poller = state.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            poller.lock().await.end_start();
        });

        let mut starting = state.lock().await.cancel_start();
        tokio::time::timeout(Duration::from_secs(5), starting.wait_for(|s| !*s))
            .await
            .unwrap()
            .unwrap();
        assert!(!state.lock().await.is_starting());

        assert_eq!(mgr.all().len(), 1);
        assert!(mgr.remove("vm1").is_some());
        assert!(!mgr.contains("vm1"));
    }
}
