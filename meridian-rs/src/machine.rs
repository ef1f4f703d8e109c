//! Persisted machine record and the on-disk layout of a machine directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::VmSpec;

/// Interval at which a running host agent refreshes its PID file stamp.
pub const PID_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// A PID file whose stamp is older than this is considered stale.
pub const PID_STALE_AFTER: Duration = Duration::from_secs(30);

/// Run/stop lifecycle state of a machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MachineState {
    #[default]
    #[serde(rename = "UnKnown")]
    Unknown,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl MachineState {
    pub fn state_name(&self) -> &'static str {
        match self {
            MachineState::Unknown => "UnKnown",
            MachineState::Created => "Created",
            MachineState::Starting => "Starting",
            MachineState::Running => "Running",
            MachineState::Stopping => "Stopping",
            MachineState::Stopped => "Stopped",
            MachineState::Error => "Error",
        }
    }

    /// Whether a lifecycle transition is currently in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, MachineState::Starting | MachineState::Stopping)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// One-time preparation phase of a machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagePhase {
    #[default]
    Pending,
    Initializing,
    PullingImage,
    ImagePulled,
    PrepareDisk,
    DiskPrepared,
    Initialized,
    Error,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub phase: StagePhase,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub name: String,
    pub spec: VmSpec,
    #[serde(default)]
    pub state: MachineState,
    /// Last human-readable status.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_pid: Option<u32>,
    /// Protected machines refuse `Destroy`.
    #[serde(default)]
    pub protected: bool,
    pub created_at: DateTime<Utc>,
}

impl Machine {
    /// A freshly created machine, in state `Created` and stage `Pending`.
    pub fn new(name: impl Into<String>, spec: VmSpec) -> Self {
        let mut machine = Machine {
            name: name.into(),
            spec,
            state: MachineState::Created,
            message: String::new(),
            stages: Vec::new(),
            sandbox_pid: None,
            protected: false,
            created_at: Utc::now(),
        };
        machine.push_stage(StagePhase::Pending, None);
        machine
    }

    /// Most recent stage phase.
    pub fn stage(&self) -> StagePhase {
        self.stages.last().map(|s| s.phase).unwrap_or_default()
    }

    pub fn initialized(&self) -> bool {
        self.stage() == StagePhase::Initialized
    }

    pub fn push_stage(&mut self, phase: StagePhase, message: Option<String>) {
        self.stages.push(Stage {
            phase,
            time: Utc::now(),
            message,
        });
    }

    pub fn set_state(&mut self, state: MachineState, message: impl Into<String>) {
        self.state = state;
        self.message = message.into();
    }
}

/// Coarse initialization marker kept as plain text next to `machine.json`.
///
/// It is written before and after the initialize task so that a daemon
/// restarted in the middle of disk preparation starts over instead of
/// trusting a half-written disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFile {
    Pending,
    Initializing,
    Initialized,
}

impl StageFile {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageFile::Pending => "pending",
            StageFile::Initializing => "initializing",
            StageFile::Initialized => "initialized",
        }
    }

    /// Read the marker. A missing file reads as `Pending`.
    pub async fn read(path: &Path) -> Result<StageFile> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => match s.trim() {
                "pending" | "" => Ok(StageFile::Pending),
                "initializing" => Ok(StageFile::Initializing),
                "initialized" => Ok(StageFile::Initialized),
                other => bail!("unknown stage {other:?} in {path:?}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StageFile::Pending),
            Err(e) => Err(e).with_context(|| format!("read stage file {path:?}")),
        }
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.as_str())
            .await
            .with_context(|| format!("write stage file {path:?}"))
    }
}

/// Paths of every file inside a machine directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDir {
    dir: PathBuf,
    name: String,
}

impl MachineDir {
    pub fn new(vms_root: &Path, name: &str) -> Self {
        MachineDir {
            dir: vms_root.join(name),
            name: name.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> PathBuf {
        self.dir.join("machine.json")
    }

    pub fn base_disk(&self) -> PathBuf {
        self.dir.join("base.img")
    }

    pub fn diff_disk(&self) -> PathBuf {
        self.dir.join("diff.img")
    }

    pub fn cidata_iso(&self) -> PathBuf {
        self.dir.join("cidata.iso")
    }

    pub fn cidata_dmg(&self) -> PathBuf {
        self.dir.join("cidata.dmg")
    }

    /// Unpacked boot data, used where no disk image is attached.
    pub fn cidata_dir(&self) -> PathBuf {
        self.dir.join("cidata")
    }

    pub fn serial_log(&self) -> PathBuf {
        self.dir.join("serial.log")
    }

    pub fn host_agent_stdout(&self) -> PathBuf {
        self.dir.join("meridian-vm.stdout.log")
    }

    pub fn host_agent_stderr(&self) -> PathBuf {
        self.dir.join("meridian-vm.stderr.log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("meridian-vm.pid")
    }

    pub fn sandbox_sock(&self) -> PathBuf {
        self.dir.join("sandbox.sock")
    }

    pub fn guest_sock(&self) -> PathBuf {
        self.dir.join(format!("{}.sock", self.name))
    }

    pub fn stage_file(&self) -> PathBuf {
        self.dir.join("stage")
    }

    /// Directory holding downloaded guest-agent binaries.
    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join("bin")
    }

    /// Host side unix socket backing a guest vsock port.
    pub fn vsock_sock(&self, port: u32) -> PathBuf {
        self.dir.join(format!("vsock-{port}.sock"))
    }

    /// Output of the hypervisor process.
    pub fn vmm_log(&self) -> PathBuf {
        self.dir.join("vmm.log")
    }

    /// Control endpoint of the hypervisor process itself.
    pub fn vmm_sock(&self) -> PathBuf {
        self.dir.join("vmm.sock")
    }
}

/// Contents of the host agent's PID file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PidInfo {
    pub pid: u32,
    pub stamp: DateTime<Utc>,
}

impl PidInfo {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (now - self.stamp).to_std() {
            Ok(age) => age <= PID_STALE_AFTER,
            // Stamp in the future, clock skew:
            Err(_) => true,
        }
    }
}

/// Whether a process with this PID currently exists.
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists, but belongs to someone else:
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Load a PID file, returning `None` (and removing the file) if the process
/// is gone or the stamp is stale.
pub async fn load_pid(path: &Path) -> Result<Option<PidInfo>> {
    let contents = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read pid file {path:?}")),
    };

    let info: PidInfo = match serde_json::from_slice(&contents) {
        Ok(info) => info,
        Err(e) => {
            tracing::event!(tracing::Level::WARN, ?path, ?e, "Removing unparseable pid file");
            remove_pid(path).await?;
            return Ok(None);
        }
    };

    if !process_alive(info.pid) || !info.is_fresh(Utc::now()) {
        tracing::event!(
            tracing::Level::DEBUG,
            ?path,
            pid = info.pid,
            stamp = %info.stamp,
            "Removing stale pid file"
        );
        remove_pid(path).await?;
        return Ok(None);
    }

    Ok(Some(info))
}

/// Write (or refresh) a PID file with the current time as stamp.
pub async fn save_pid(path: &Path, pid: u32) -> Result<()> {
    let info = PidInfo {
        pid,
        stamp: Utc::now(),
    };
    let tmp = path.with_extension("pid.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec(&info)?)
        .await
        .with_context(|| format!("write pid file {tmp:?}"))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename pid file into {path:?}"))
}

pub async fn remove_pid(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove pid file {path:?}")),
    }
}

/// Poll the PID file until it disappears (or goes stale), or `timeout`
/// passes.
pub async fn wait_stop(path: &Path, interval: Duration, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if load_pid(path).await?.is_none() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timeout after {timeout:?} waiting for process in {path:?} to stop");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Ask a process to terminate with `SIGTERM`.
pub fn signal_stop(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .with_context(|| format!("send SIGTERM to process {pid}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new_machine_is_pending() {
        let m = Machine::new("vm1", VmSpec::default());
        assert_eq!(m.state, MachineState::Created);
        assert_eq!(m.stage(), StagePhase::Pending);
        assert!(!m.initialized());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&MachineState::Unknown).unwrap(),
            "\"UnKnown\""
        );
        assert_eq!(
            serde_json::from_str::<MachineState>("\"Stopping\"").unwrap(),
            MachineState::Stopping
        );
    }

    #[test]
    fn test_machine_dir_layout() {
        let dir = MachineDir::new(Path::new("/r/vms"), "vm1");
        assert_eq!(dir.record(), PathBuf::from("/r/vms/vm1/machine.json"));
        assert_eq!(dir.guest_sock(), PathBuf::from("/r/vms/vm1/vm1.sock"));
        assert_eq!(dir.vsock_sock(10443), PathBuf::from("/r/vms/vm1/vsock-10443.sock"));
    }

    #[tokio::test]
    async fn test_stage_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage");
        assert_eq!(StageFile::read(&path).await.unwrap(), StageFile::Pending);
        StageFile::Initializing.write(&path).await.unwrap();
        assert_eq!(StageFile::read(&path).await.unwrap(), StageFile::Initializing);
    }

    #[tokio::test]
    async fn test_pid_file_of_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        save_pid(&path, std::process::id()).await.unwrap();
        let info = load_pid(&path).await.unwrap().unwrap();
        assert_eq!(info.pid, std::process::id());
        // Already fresh and alive, so waiting returns a timeout:
        assert!(wait_stop(&path, Duration::from_millis(10), Duration::from_millis(50))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stale_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        let stale = PidInfo {
            pid: std::process::id(),
            stamp: Utc::now() - chrono::Duration::seconds(120),
        };
        tokio::fs::write(&path, serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();
        assert!(load_pid(&path).await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dead_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        save_pid(&path, pid).await.unwrap();
        assert!(load_pid(&path).await.unwrap().is_none());
        wait_stop(&path, Duration::from_millis(10), Duration::from_millis(50))
            .await
            .unwrap();
    }
}
