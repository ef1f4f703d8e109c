//! Periodic health sweep and self-heal.
//!
//! The sweep checks every running machine's host agent. After
//! `failure_threshold` consecutive failures the machine's name is enqueued
//! on the `vm-heal` worker pool, whose handler restarts it. A machine is
//! re-enqueued at most once per `backoff`.

use std::sync::Weak;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use mdn_workqueue::{Handler, Request};
use meridian_rs::machine::MachineState;
use meridian_rs::util::fmt_message;

use crate::error::VmError;
use crate::manager::VmMgr;

pub struct HealHandler {
    mgr: Weak<VmMgr>,
}

impl HealHandler {
    pub fn new(mgr: Weak<VmMgr>) -> Self {
        HealHandler { mgr }
    }
}

#[async_trait]
impl Handler for HealHandler {
    async fn handle(&self, cancel: CancellationToken, req: Request) -> anyhow::Result<()> {
        let Some(mgr) = self.mgr.upgrade() else {
            return Ok(());
        };

        #[rustfmt::skip]
        tokio::select! {
            res = mgr.heal(&req.key) => res.map_err(anyhow::Error::from),
            _ = cancel.cancelled() => {
                event!(Level::INFO, machine = %req.key, worker = %req.worker_id, "Heal cancelled");
                Ok(())
            }
        }
    }
}

impl VmMgr {
    /// Check every running machine once. Checks run concurrently, each
    /// bounded by `health.timeout`, so one wedged host agent cannot hold up
    /// the others.
    pub async fn health_sweep(&self) {
        let threshold = self.config.health.failure_threshold;
        let backoff = self.config.health.backoff;
        let check_timeout = self.config.health.timeout;

        let mut checks = JoinSet::new();
        for (name, state) in self.states.all() {
            // Machines busy with a lifecycle operation are looked at next time.
            let Ok(mut vm) = state.try_lock() else {
                continue;
            };
            if vm.machine.state != MachineState::Running {
                vm.failures = 0;
                continue;
            }
            drop(vm);

            let sandbox = self.sandbox.clone();
            let dir = self.dir(&name);
            checks.spawn(async move {
                let res = match tokio::time::timeout(check_timeout, sandbox.healthz(&dir)).await {
                    Ok(res) => res.map(|_| ()),
                    Err(_) => Err(anyhow!("no answer after {check_timeout:?}")),
                };
                (name, state, res)
            });
        }

        while let Some(joined) = checks.join_next().await {
            let (name, state, res) = match joined {
                Ok(check) => check,
                Err(e) => {
                    event!(Level::ERROR, ?e, "Health check task failed");
                    continue;
                }
            };

            let mut vm = state.lock().await;
            if vm.machine.state != MachineState::Running {
                continue;
            }
            match res {
                Ok(()) => {
                    vm.failures = 0;
                    continue;
                }
                Err(e) => {
                    vm.failures += 1;
                    event!(
                        Level::WARN,
                        machine = %name,
                        failures = vm.failures,
                        "Health check failed: {}",
                        fmt_message(&e)
                    );
                }
            }

            if vm.failures < threshold {
                continue;
            }
            if let Some(last) = vm.last_heal {
                if last.elapsed() < backoff {
                    event!(Level::DEBUG, machine = %name, "Self-heal backing off");
                    continue;
                }
            }
            vm.last_heal = Some(Instant::now());
            vm.failures = 0;
            drop(vm);

            event!(Level::WARN, machine = %name, "Enqueueing machine for self-heal");
            self.workers().enqueue(name);
        }
    }

    /// Bring a machine back: finish its initialization, or restart it if it
    /// was running.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn heal(&self, name: &str) -> Result<(), VmError> {
        let state = self.state(name)?;
        let mut vm = state.lock().await;

        if !vm.machine.initialized() {
            drop(vm);
            return match self.initialize(name) {
                Ok(()) | Err(VmError::Initializing(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }
        if vm.machine.state != MachineState::Running {
            return Ok(());
        }

        vm.machine
            .set_state(MachineState::Error, "health check failed");
        self.persist_logged(&vm.machine).await;
        drop(vm);

        // The host agent may still be around but wedged.
        self.stop(name).await?;
        self.start(name).await?;
        Ok(())
    }
}
