//! VM state manager: create, run, start, stop and destroy machines.
//!
//! The on-disk records are authoritative. Every transition is written back
//! through the machine store before the operation returns, so the in-memory
//! [`VmStateMgr`] is only a cache that [`VmMgr::new`] rebuilds from disk.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use mdn_workqueue::{Action, WorkerMgr, WorkerMgrConfig};
use meridian_rs::config::MeridianConfig;
use meridian_rs::machine::{
    load_pid, signal_stop, wait_stop, Machine, MachineDir, MachineState, StageFile, StagePhase,
};
use meridian_rs::spec::{PortForward, VmSpec};
use meridian_rs::util::fmt_message;

use crate::allocate::allocate;
use crate::error::VmError;
use crate::health::HealHandler;
use crate::hypervisor::Hypervisor;
use crate::pull::ImageMgr;
use crate::sandbox::SandboxControl;
use crate::state::{SharedVmState, VmState, VmStateMgr};
use crate::store::{check_name, Store, StoreError};
use crate::task::{task_key, TaskError, TaskMgr, INITIALIZE_VM};

/// How often `Stop` looks at the PID file while waiting for the host agent
/// to exit.
const PID_WAIT_INTERVAL: Duration = Duration::from_millis(500);

pub struct VmMgr {
    pub(crate) config: MeridianConfig,
    store: Arc<dyn Store<Machine>>,
    images: Arc<ImageMgr>,
    hypervisor: Arc<dyn Hypervisor>,
    pub(crate) sandbox: Arc<dyn SandboxControl>,
    pub(crate) states: VmStateMgr,
    tasks: Arc<TaskMgr>,
    workers: Arc<WorkerMgr>,
    /// Serializes address allocation across machines.
    alloc: tokio::sync::Mutex<()>,
    this: Weak<VmMgr>,
}

fn store_error(name: &str, err: anyhow::Error) -> VmError {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::AlreadyExists(_)) => VmError::AlreadyExists(name.to_string()),
        Some(StoreError::NotFound(_)) => VmError::NotFound(name.to_string()),
        Some(StoreError::InvalidName(_)) => VmError::InvalidSpec(err),
        None => VmError::Internal(err),
    }
}

impl VmMgr {
    /// Load every machine record and reconcile it with what is actually
    /// running. Must be called from within a Tokio runtime.
    pub async fn new(
        config: MeridianConfig,
        store: Arc<dyn Store<Machine>>,
        images: Arc<ImageMgr>,
        hypervisor: Arc<dyn Hypervisor>,
        sandbox: Arc<dyn SandboxControl>,
    ) -> anyhow::Result<Arc<Self>> {
        let machines = store.list().await.context("load machine records")?;
        let tasks = TaskMgr::new(config.timeouts.task_terminate_poll);
        let worker_config = WorkerMgrConfig {
            size: config.daemon.workers,
            ..Default::default()
        };

        let mgr = Arc::new_cyclic(|this: &Weak<VmMgr>| {
            let handler = Arc::new(HealHandler::new(this.clone()));
            VmMgr {
                config,
                store,
                images,
                hypervisor,
                sandbox,
                states: VmStateMgr::default(),
                tasks,
                workers: WorkerMgr::new("vm-heal", handler, Arc::new(Action::new()), worker_config),
                alloc: tokio::sync::Mutex::new(()),
                this: this.clone(),
            }
        });

        for machine in machines {
            let machine = mgr.recover(machine).await;
            mgr.states.insert(machine);
        }
        Ok(mgr)
    }

    pub fn dir(&self, name: &str) -> MachineDir {
        MachineDir::new(&self.config.daemon.vms_dir(), name)
    }

    pub fn images(&self) -> &Arc<ImageMgr> {
        &self.images
    }

    pub fn workers(&self) -> &Arc<WorkerMgr> {
        &self.workers
    }

    pub fn tasks(&self) -> &Arc<TaskMgr> {
        &self.tasks
    }

    pub(crate) fn state(&self, name: &str) -> Result<SharedVmState, VmError> {
        self.states
            .get(name)
            .ok_or_else(|| VmError::NotFound(name.to_string()))
    }

    async fn persist(&self, machine: &Machine) -> Result<(), VmError> {
        self.store
            .update(machine)
            .await
            .map_err(|e| store_error(&machine.name, e))
    }

    /// Persist, logging instead of failing. For background paths that have
    /// nobody to report to.
    pub(crate) async fn persist_logged(&self, machine: &Machine) {
        if let Err(e) = self.persist(machine).await {
            event!(Level::ERROR, machine = %machine.name, "Failed to persist machine: {e:#}");
        }
    }

    /// Bring a record loaded at startup in line with reality: transitions
    /// interrupted by a daemon restart are resolved from the PID file, and
    /// half-done disk preparation starts over.
    async fn recover(&self, mut machine: Machine) -> Machine {
        let dir = self.dir(&machine.name);
        let alive = match load_pid(&dir.pid_file()).await {
            Ok(pid) => pid,
            Err(e) => {
                event!(Level::WARN, machine = %machine.name, "Failed to read pid file: {e:#}");
                None
            }
        };

        let before = (machine.state, machine.stage());
        match (machine.state, alive) {
            (MachineState::Running | MachineState::Starting, Some(info)) => {
                machine.sandbox_pid = Some(info.pid);
                machine.set_state(MachineState::Running, "");
            }
            (MachineState::Running | MachineState::Starting | MachineState::Stopping, None) => {
                machine.sandbox_pid = None;
                machine.set_state(MachineState::Stopped, "host agent exited while the daemon was down");
            }
            (MachineState::Stopping, Some(_)) => {
                machine.set_state(MachineState::Error, "stop interrupted by daemon restart");
            }
            _ => (),
        }

        match StageFile::read(&dir.stage_file()).await {
            Ok(StageFile::Initializing) if !machine.initialized() => {
                machine.push_stage(StagePhase::Pending, Some("restarting initialization".into()));
                if let Err(e) = StageFile::Pending.write(&dir.stage_file()).await {
                    event!(Level::WARN, machine = %machine.name, "{e:#}");
                }
            }
            Ok(_) => (),
            Err(e) => event!(Level::WARN, machine = %machine.name, "{e:#}"),
        }

        if before != (machine.state, machine.stage()) {
            event!(
                Level::INFO,
                machine = %machine.name,
                from = %before.0,
                to = %machine.state,
                "Recovered machine state"
            );
            self.persist_logged(&machine).await;
        }
        machine
    }

    pub async fn list(&self) -> Vec<Machine> {
        let mut machines = Vec::new();
        for (_, state) in self.states.all() {
            machines.push(state.lock().await.machine.clone());
        }
        machines
    }

    pub async fn get(&self, name: &str) -> Result<Machine, VmError> {
        let state = self.state(name)?;
        let machine = state.lock().await.machine.clone();
        Ok(machine)
    }

    /// Persist a new machine and send its initialize task.
    #[instrument(skip(self, spec), err(Debug, level = Level::WARN))]
    pub async fn create(&self, name: &str, spec: VmSpec) -> Result<Machine, VmError> {
        check_name(name).map_err(|e| VmError::InvalidSpec(e.into()))?;

        let alloc = self.alloc.lock().await;
        if self.states.contains(name) {
            return Err(VmError::AlreadyExists(name.to_string()));
        }

        let dir = self.dir(name);
        let mut machine = Machine::new(name, spec);
        machine.spec.set_default(
            &self.config.defaults,
            &dir.guest_sock(),
            &self.config.daemon.data_root.join(name),
        );
        machine.spec.validate().map_err(VmError::InvalidSpec)?;
        if self.images.source(&machine.spec.image.name).is_none() {
            return Err(VmError::UnknownImage(machine.spec.image.name.clone()));
        }

        let others = self.store.list().await?;
        allocate(&mut machine, &others)?;

        self.store
            .create(&machine)
            .await
            .map_err(|e| store_error(name, e))?;
        StageFile::Pending.write(&dir.stage_file()).await?;
        self.states
            .insert(machine.clone())
            .ok_or_else(|| VmError::AlreadyExists(name.to_string()))?;
        drop(alloc);
        event!(Level::INFO, machine = %name, "Machine created");

        match self.initialize(name) {
            Ok(()) | Err(VmError::Initializing(_)) => (),
            Err(e) => return Err(e),
        }
        Ok(machine)
    }

    /// Send the initialize task for `name`. Fails with
    /// [`VmError::Initializing`] while one is already running.
    pub fn initialize(&self, name: &str) -> Result<(), VmError> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow!("machine manager is shutting down"))?;
        let owned = name.to_string();
        self.tasks
            .send(INITIALIZE_VM, name, move |cancel| async move {
                this.run_initialize(&owned, cancel).await
            })
            .map_err(|e| match e {
                TaskError::AlreadyExists(_) => VmError::Initializing(name.to_string()),
                other => VmError::Internal(other.into()),
            })
    }

    async fn push_stage(
        &self,
        name: &str,
        phase: StagePhase,
        message: Option<String>,
    ) -> Result<Machine, VmError> {
        let state = self.state(name)?;
        let mut vm = state.lock().await;
        vm.machine.push_stage(phase, message);
        self.persist(&vm.machine).await?;
        Ok(vm.machine.clone())
    }

    async fn run_initialize(&self, name: &str, cancel: CancellationToken) -> anyhow::Result<()> {
        let dir = self.dir(name);
        if !self.get(name).await?.initialized() {
            if let Err(e) = self.do_initialize(name, &dir, &cancel).await {
                let message = fmt_message(&e);
                if let Ok(state) = self.state(name) {
                    let mut vm = state.lock().await;
                    vm.machine.push_stage(StagePhase::Error, Some(message.clone()));
                    vm.machine.message = message;
                    self.persist_logged(&vm.machine).await;
                }
                StageFile::Pending.write(&dir.stage_file()).await?;
                return Err(e);
            }
        }

        let run = {
            let state = self.state(name)?;
            let mut vm = state.lock().await;
            std::mem::take(&mut vm.run_after_init)
        };
        if run {
            self.start(name).await?;
        }
        Ok(())
    }

    async fn do_initialize(
        &self,
        name: &str,
        dir: &MachineDir,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        StageFile::Initializing.write(&dir.stage_file()).await?;
        self.push_stage(name, StagePhase::Initializing, None).await?;

        let machine = self.push_stage(name, StagePhase::PullingImage, None).await?;
        self.hypervisor.pull_image(&machine, cancel).await?;
        self.push_stage(name, StagePhase::ImagePulled, None).await?;

        let machine = self.push_stage(name, StagePhase::PrepareDisk, None).await?;
        #[rustfmt::skip]
        tokio::select! {
            res = self.hypervisor.prepare_disk(&machine) => res?,
            _ = cancel.cancelled() => bail!("initialization of {name} cancelled"),
        }
        self.push_stage(name, StagePhase::DiskPrepared, None).await?;

        self.push_stage(name, StagePhase::Initialized, None).await?;
        StageFile::Initialized.write(&dir.stage_file()).await?;
        event!(Level::INFO, machine = %name, "Machine initialized");
        Ok(())
    }

    /// Create (if needed) and start. A machine that is still initializing
    /// is started as soon as its initialization completes.
    #[instrument(skip(self, spec), err(Debug, level = Level::WARN))]
    pub async fn run(&self, name: &str, spec: VmSpec) -> Result<Machine, VmError> {
        match self.create(name, spec).await {
            Ok(_) | Err(VmError::AlreadyExists(_)) => (),
            Err(e) => return Err(e),
        }

        let state = self.state(name)?;
        let mut vm = state.lock().await;
        let current = vm.machine.state;
        if matches!(
            current,
            MachineState::Running | MachineState::Starting | MachineState::Stopping
        ) {
            return Err(VmError::invalid_transition(name, current, "run"));
        }
        if !vm.machine.initialized() {
            vm.run_after_init = true;
            let machine = vm.machine.clone();
            drop(vm);
            match self.initialize(name) {
                Ok(()) | Err(VmError::Initializing(_)) => (),
                Err(e) => return Err(e),
            }
            event!(Level::INFO, machine = %name, "Still initializing, starting once initialized");
            return Ok(machine);
        }
        drop(vm);

        self.start(name).await
    }

    /// Launch the host agent (or adopt one that is still running) and poll
    /// the guest agent in the background until it answers.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn start(&self, name: &str) -> Result<Machine, VmError> {
        let state = self.state(name)?;
        let mut vm = state.lock().await;

        if !vm.machine.initialized() {
            return Err(VmError::Initializing(name.to_string()));
        }
        match vm.machine.state {
            MachineState::Created | MachineState::Error | MachineState::Stopped => (),
            other => return Err(VmError::invalid_transition(name, other, "start")),
        }

        let dir = self.dir(name);
        let pid = match load_pid(&dir.pid_file()).await? {
            Some(info) => {
                event!(Level::INFO, machine = %name, pid = info.pid, "Host agent still running, resuming");
                info.pid
            }
            None => match self.hypervisor.launch(&vm.machine).await {
                Ok(pid) => pid,
                Err(e) => {
                    vm.machine.set_state(MachineState::Error, fmt_message(&e));
                    self.persist(&vm.machine).await?;
                    return Err(e.into());
                }
            },
        };

        vm.machine.sandbox_pid = Some(pid);
        vm.machine
            .set_state(MachineState::Starting, "waiting for the guest agent");
        self.persist(&vm.machine).await?;
        let cancel = vm.begin_start();
        let machine = vm.machine.clone();
        drop(vm);

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow!("machine manager is shutting down"))?;
        tokio::spawn(this.await_healthy(name.to_string(), state, cancel));
        Ok(machine)
    }

    async fn await_healthy(self: Arc<Self>, name: String, state: SharedVmState, cancel: CancellationToken) {
        let interval = self.config.timeouts.start_health_interval;
        let timeout = self.config.timeouts.start_health_timeout;
        let dir = self.dir(&name);
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(interval);
        let mut last = String::from("no answer yet");

        let outcome = loop {
            #[rustfmt::skip]
            tokio::select! {
                _ = cancel.cancelled() => break Err(anyhow!("start of {name} cancelled")),
                _ = ticker.tick() => (),
            }
            // A host agent that never answers must not outlive the deadline.
            let check = tokio::time::timeout_at(deadline, self.sandbox.guest_health(&dir));
            #[rustfmt::skip]
            let res = tokio::select! {
                _ = cancel.cancelled() => break Err(anyhow!("start of {name} cancelled")),
                res = check => res,
            };
            match res {
                Ok(Ok(health)) if health.healthy => break Ok(()),
                Ok(Ok(health)) => last = format!("guest agent unhealthy: {}", health.detail),
                Ok(Err(e)) => last = fmt_message(&e),
                Err(_) => last = "guest agent health check did not answer".to_string(),
            }
            if Instant::now() >= deadline {
                break Err(anyhow!(
                    "timeout after {timeout:?} waiting for the guest agent: {last}"
                ));
            }
        };

        let mut vm = state.lock().await;
        match outcome {
            Ok(()) if vm.machine.state == MachineState::Starting => {
                vm.machine.set_state(MachineState::Running, "");
                vm.failures = 0;
                event!(Level::INFO, machine = %name, "Machine running");
            }
            Ok(()) => (),
            // Whoever cancelled takes over the machine state.
            Err(e) if cancel.is_cancelled() => event!(Level::INFO, machine = %name, "{e:#}"),
            Err(e) => {
                event!(Level::WARN, machine = %name, "Start failed: {e:#}");
                vm.machine.set_state(MachineState::Error, fmt_message(&e));
            }
        }
        self.persist_logged(&vm.machine).await;
        vm.end_start();
    }

    /// Stop a machine. An in-flight start is cancelled first; if it does not
    /// quiesce in time the machine goes to `Error`.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn stop(&self, name: &str) -> Result<Machine, VmError> {
        let state = self.state(name)?;
        let mut starting = {
            let vm = state.lock().await;
            match vm.machine.state {
                MachineState::Running
                | MachineState::Starting
                | MachineState::Stopping
                | MachineState::Error => (),
                other => return Err(VmError::invalid_transition(name, other, "stop")),
            }
            vm.cancel_start()
        };

        let wait = self.config.timeouts.stop_wait_starting;
        if tokio::time::timeout(wait, starting.wait_for(|s| !*s))
            .await
            .is_err()
        {
            let message = format!("timeout after {wait:?} waiting for the start to finish");
            let mut vm = state.lock().await;
            vm.machine.set_state(MachineState::Error, message.clone());
            self.persist(&vm.machine).await?;
            return Err(VmError::Timeout(message));
        }

        let mut vm = state.lock().await;
        if vm.machine.state == MachineState::Stopped {
            // A concurrent stop got here first.
            return Ok(vm.machine.clone());
        }
        self.stop_locked(&mut vm).await?;
        Ok(vm.machine.clone())
    }

    async fn stop_locked(&self, vm: &mut VmState) -> Result<(), VmError> {
        vm.machine.set_state(MachineState::Stopping, "stopping");
        self.persist(&vm.machine).await?;

        match self.shutdown(&vm.machine).await {
            Ok(()) => {
                vm.machine.sandbox_pid = None;
                vm.machine.set_state(MachineState::Stopped, "");
                vm.failures = 0;
                self.persist(&vm.machine).await?;
                event!(Level::INFO, machine = %vm.machine.name, "Machine stopped");
                Ok(())
            }
            Err(e) => {
                vm.machine.set_state(MachineState::Error, fmt_message(&e));
                self.persist(&vm.machine).await?;
                Err(e.into())
            }
        }
    }

    /// Stop the host agent through its sandbox socket, wait for its PID file
    /// to go away, then stop the backend.
    async fn shutdown(&self, machine: &Machine) -> anyhow::Result<()> {
        let timeouts = &self.config.timeouts;
        let dir = self.dir(&machine.name);

        if let Some(info) = load_pid(&dir.pid_file()).await? {
            let stop = tokio::time::timeout(timeouts.stop_control, self.sandbox.stop(&dir)).await;
            let failure = match stop {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(fmt_message(&e)),
                Err(_) => Some(format!("no answer within {:?}", timeouts.stop_control)),
            };
            if let Some(failure) = failure {
                event!(
                    Level::WARN,
                    machine = %machine.name,
                    pid = info.pid,
                    "Sandbox stop failed ({failure}), sending SIGTERM"
                );
                signal_stop(info.pid)?;
            }
            wait_stop(&dir.pid_file(), PID_WAIT_INTERVAL, timeouts.stop_pid_wait).await?;
        }

        self.hypervisor
            .stop_backend(machine)
            .await
            .context("stop backend")
    }

    /// Stop and delete a machine together with its directory.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn destroy(&self, name: &str) -> Result<(), VmError> {
        let state = self.state(name)?;
        self.check_destroy(name, &*state.lock().await)?;

        // The initialize task takes the machine lock, so it must be gone
        // before we hold it for the rest of the teardown.
        self.tasks
            .terminate(
                &task_key(INITIALIZE_VM, name),
                self.config.timeouts.stop_control,
            )
            .await
            .map_err(|e| VmError::Internal(e.into()))?;

        let mut vm = state.lock().await;
        self.check_destroy(name, &vm)?;
        if let Err(e) = self.shutdown(&vm.machine).await {
            vm.machine.message = fmt_message(&e);
            self.persist(&vm.machine).await?;
            return Err(e.into());
        }

        self.store
            .delete(name)
            .await
            .map_err(|e| store_error(name, e))?;
        drop(vm);
        self.states.remove(name);
        event!(Level::INFO, machine = %name, "Machine destroyed");
        Ok(())
    }

    fn check_destroy(&self, name: &str, vm: &VmState) -> Result<(), VmError> {
        if vm.machine.state.is_transitional() || vm.is_starting() {
            return Err(VmError::invalid_transition(name, vm.machine.state, "destroy"));
        }
        if vm.machine.protected {
            return Err(VmError::Protected(name.to_string()));
        }
        Ok(())
    }

    pub async fn protect(&self, name: &str, protected: bool) -> Result<Machine, VmError> {
        let state = self.state(name)?;
        let mut vm = state.lock().await;
        vm.machine.protected = protected;
        self.persist(&vm.machine).await?;
        Ok(vm.machine.clone())
    }

    /// Add (or with `add == false`, remove) port forwards. The change is
    /// recorded in the spec and, on a running machine, applied live.
    #[instrument(skip(self, forwards), err(Debug, level = Level::WARN))]
    pub async fn forward(
        &self,
        name: &str,
        forwards: Vec<PortForward>,
        add: bool,
    ) -> Result<Machine, VmError> {
        let state = self.state(name)?;
        let mut vm = state.lock().await;
        if add {
            for forward in forwards.iter() {
                vm.machine.spec.set_forward(forward.clone());
            }
        } else {
            vm.machine.spec.remove_forward(&forwards);
        }
        vm.machine.spec.validate().map_err(VmError::InvalidSpec)?;
        self.persist(&vm.machine).await?;

        if vm.machine.state == MachineState::Running {
            let dir = self.dir(name);
            let res = if add {
                self.sandbox.forward(&dir, &forwards).await
            } else {
                self.sandbox.unforward(&dir, &forwards).await
            };
            res.context("apply forwards to the running machine")?;
        }
        Ok(vm.machine.clone())
    }

    /// Re-send the initialize task of every machine that is not initialized
    /// yet.
    pub async fn reinit_tick(&self) {
        for (name, state) in self.states.all() {
            let Ok(vm) = state.try_lock() else {
                continue;
            };
            if vm.machine.initialized() {
                continue;
            }
            drop(vm);

            match self.initialize(&name) {
                Ok(()) => event!(Level::INFO, machine = %name, "Re-sent initialize task"),
                Err(VmError::Initializing(_)) => {
                    event!(Level::DEBUG, machine = %name, "Initialize task still running")
                }
                Err(e) => event!(Level::WARN, machine = %name, "Failed to send initialize task: {e}"),
            }
        }
    }

    /// Run the periodic re-initialization tick and the health sweep until
    /// `shutdown` fires.
    pub fn spawn_background(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut reinit = tokio::time::interval(this.config.timeouts.reinit_interval);
            let mut health = tokio::time::interval(this.config.health.interval);
            loop {
                #[rustfmt::skip]
                tokio::select! {
                    _ = reinit.tick() => this.reinit_tick().await,
                    _ = health.tick() => this.health_sweep().await,
                    _ = shutdown.cancelled() => break,
                }
            }
            this.workers.reset();
        })
    }
}
