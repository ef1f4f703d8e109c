//! Virtualization backends.
//!
//! A [`Driver`] maps a [`Machine`] onto one concrete hypervisor. The variant
//! is picked once per machine by [`select_driver`] from the spec's `vmType`:
//!
//! - [`vz::VzDriver`]: Apple Virtualization.framework, driven through a
//!   `vfkit` child process,
//! - [`wsl2::Wsl2Driver`]: Windows Subsystem for Linux,
//! - [`qemu::QemuDriver`]: QEMU full-system emulation.
//!
//! Every driver exposes a vsock-equivalent stream channel into the guest
//! through [`Driver::dialer`], which the forward manager and the guest
//! health check build on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;

use meridian_rs::api::GUEST_AGENT_VSOCK_PORT;
use meridian_rs::config::{BackendConfig, MeridianConfig, Timeouts};
use meridian_rs::image::ImageSource;
use meridian_rs::machine::{Machine, MachineDir};
use meridian_rs::spec::{Arch, VmSpec, VmType};

use mdn_forward::{BoxStream, Dialer, Endpoint, Network};

pub mod cidata;
pub mod disk;
mod process;
pub mod qemu;
pub mod sshkey;
pub mod vsock;
pub mod vz;
pub mod wsl2;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{driver} driver requires {requirement}")]
    Requirement {
        driver: VmType,
        requirement: String,
    },

    #[error("`{option}` configuration is not supported for the {driver} driver")]
    Unsupported { driver: VmType, option: String },

    #[error("unsupported arch: {0:?}")]
    UnsupportedArch(Arch),

    #[error("no socket device configured for vsock port {0}")]
    NoSocketDevice(u32),

    #[error("{0} driver has no running machine")]
    NotRunning(VmType),
}

/// Fires exactly once, when the machine exits or the driver detects a fatal
/// backend fault.
pub type ExitReceiver = oneshot::Receiver<anyhow::Error>;

#[async_trait]
pub trait Driver: Send + Sync {
    fn vm_type(&self) -> VmType;

    fn base(&self) -> &BaseDriver;

    /// Check the driver's own preconditions. Errors here are fatal and block
    /// [`Driver::start`].
    async fn validate(&self) -> Result<(), DriverError>;

    /// Ensure the base disk and the writable diff disk exist.
    async fn create_disk(&self) -> Result<()>;

    /// Boot the machine. Faults after a successful start are delivered on
    /// the returned channel; [`Driver::stop`] must still be callable after
    /// one fired.
    async fn start(&self) -> Result<ExitReceiver>;

    /// Request a graceful shutdown and wait (bounded) until the machine is
    /// stopped.
    async fn stop(&self) -> Result<()>;

    /// Dialer reaching guest vsock ports.
    fn dialer(&self) -> Result<Arc<dyn Dialer>>;

    /// A stream to the guest agent.
    async fn guest_agent_conn(&self) -> Result<BoxStream> {
        let dialer = self.dialer()?;
        let target = Endpoint::new(Network::Vsock, GUEST_AGENT_VSOCK_PORT.to_string());
        Ok(dialer.dial(&target).await?)
    }

    fn can_run_gui(&self) -> bool {
        false
    }

    /// Blocks while the graphical console is open.
    async fn run_gui(&self) -> Result<()> {
        bail!(
            "RunGUI is not supported for the given driver '{}' and display '{}'",
            self.vm_type(),
            self.base().spec().video.display
        )
    }
}

/// Everything a driver needs to know about the machine it runs.
#[derive(Debug, Clone)]
pub struct BaseDriver {
    pub machine: Machine,
    pub dir: MachineDir,
    pub backend: BackendConfig,
    pub timeouts: Timeouts,

    /// Where the base disk comes from, if it still has to be fetched.
    pub image: Option<ImageSource>,

    pub cache_dir: Option<PathBuf>,
}

impl BaseDriver {
    pub fn new(machine: Machine, vms_root: &Path, config: &MeridianConfig) -> Self {
        let dir = MachineDir::new(vms_root, &machine.name);
        let image = config.images.get(&machine.spec.image.name).cloned();
        BaseDriver {
            machine,
            dir,
            backend: config.backend.clone(),
            timeouts: config.timeouts.clone(),
            image,
            cache_dir: Some(config.daemon.cache_dir()),
        }
    }

    pub fn spec(&self) -> &VmSpec {
        &self.machine.spec
    }

    /// Every guest vsock port a socket device is configured for: the guest
    /// agent plus the targets of vsock port forwards.
    pub fn vsock_ports(&self) -> Vec<u32> {
        let mut ports: Vec<u32> = std::iter::once(GUEST_AGENT_VSOCK_PORT)
            .chain(self.spec().port_forwards.iter().filter_map(|f| f.vsock_port))
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

pub fn select_driver(base: BaseDriver) -> Arc<dyn Driver> {
    match base.spec().vm_type() {
        VmType::Vz => Arc::new(vz::VzDriver::new(base)),
        VmType::Wsl2 => Arc::new(wsl2::Wsl2Driver::new(base)),
        VmType::Qemu => Arc::new(qemu::QemuDriver::new(base)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use meridian_rs::spec::PortForward;

    #[test]
    fn test_vsock_ports_and_selection() {
        let mut spec = VmSpec {
            vm_type: Some(VmType::Qemu),
            ..Default::default()
        };
        spec.set_forward(PortForward::unix_to_vsock("/tmp/a.sock", 40443));
        spec.set_forward(PortForward::unix_to_vsock("/tmp/b.sock", GUEST_AGENT_VSOCK_PORT));
        let machine = Machine::new("vm1", spec);
        let base = BaseDriver::new(machine, Path::new("/r/vms"), &MeridianConfig::default());

        assert_eq!(base.vsock_ports(), vec![GUEST_AGENT_VSOCK_PORT, 40443]);
        assert_eq!(base.dir.path(), Path::new("/r/vms/vm1"));

        let driver = select_driver(base);
        assert_eq!(driver.vm_type(), VmType::Qemu);
        assert!(!driver.can_run_gui());
    }
}
