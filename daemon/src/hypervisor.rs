//! Everything the state manager needs from the host to prepare and run a
//! machine.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use mdn_backend::cidata::ensure_guest_binary;
use mdn_backend::sshkey::SshKeyMgr;
use mdn_backend::{select_driver, BaseDriver, Driver};
use meridian_rs::config::MeridianConfig;
use meridian_rs::machine::{Machine, MachineDir};

use crate::pull::ImageMgr;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Make sure the machine's image is in the download cache.
    async fn pull_image(&self, machine: &Machine, cancel: &CancellationToken) -> Result<()>;

    /// Check the backend's preconditions and create the machine's disks and
    /// guest binary.
    async fn prepare_disk(&self, machine: &Machine) -> Result<()>;

    /// Spawn the host agent for `machine`, returning its PID.
    async fn launch(&self, machine: &Machine) -> Result<u32>;

    /// Backend stop, after the host agent is gone.
    async fn stop_backend(&self, machine: &Machine) -> Result<()>;
}

/// Runs machines on this host through `meridian-vm` processes.
pub struct LocalHypervisor {
    config: MeridianConfig,
    config_path: Option<PathBuf>,
    images: Arc<ImageMgr>,
    keys: SshKeyMgr,
}

impl LocalHypervisor {
    pub fn new(config: MeridianConfig, config_path: Option<PathBuf>, images: Arc<ImageMgr>) -> Self {
        let keys = SshKeyMgr::new(&config.daemon.config_dir());
        LocalHypervisor {
            config,
            config_path,
            images,
            keys,
        }
    }

    fn vms_dir(&self) -> PathBuf {
        self.config.daemon.vms_dir()
    }

    fn driver(&self, machine: &Machine) -> Arc<dyn Driver> {
        select_driver(BaseDriver::new(machine.clone(), &self.vms_dir(), &self.config))
    }
}

fn log_file(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {path:?}"))
}

#[async_trait]
impl Hypervisor for LocalHypervisor {
    #[instrument(skip(self, machine, cancel), fields(machine = %machine.name), err(Debug, level = Level::WARN))]
    async fn pull_image(&self, machine: &Machine, cancel: &CancellationToken) -> Result<()> {
        let pulling = self.images.pull(&machine.spec.image.name)?;

        #[rustfmt::skip]
        tokio::select! {
            res = pulling.wait() => res,
            _ = cancel.cancelled() => Err(anyhow!("pull of image {} cancelled", machine.spec.image.name)),
        }
    }

    #[instrument(skip(self, machine), fields(machine = %machine.name), err(Debug, level = Level::WARN))]
    async fn prepare_disk(&self, machine: &Machine) -> Result<()> {
        let driver = self.driver(machine);
        driver.validate().await?;

        let spec = &machine.spec;
        ensure_guest_binary(
            &driver.base().dir,
            self.config.guest_binary(spec.os(), spec.arch()),
            spec.os(),
            spec.arch(),
            Some(self.config.daemon.cache_dir().as_path()),
        )
        .await?;
        self.keys.ensure().await?;
        driver.create_disk().await
    }

    #[instrument(skip(self, machine), fields(machine = %machine.name), err(Debug, level = Level::WARN))]
    async fn launch(&self, machine: &Machine) -> Result<u32> {
        let dir = MachineDir::new(&self.vms_dir(), &machine.name);
        let binary = self.config.daemon.host_agent_binary();

        let mut cmd = Command::new(&binary);
        cmd.arg("start")
            .arg(&machine.name)
            .arg("-c")
            .arg(dir.record())
            .stdin(Stdio::null())
            .stdout(log_file(&dir.host_agent_stdout())?)
            .stderr(log_file(&dir.host_agent_stderr())?)
            // Survives the daemon and its terminal's signals:
            .process_group(0);
        if let Some(ref path) = self.config_path {
            cmd.env("MERIDIAN_CONFIG", path);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn host agent {binary:?}"))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("host agent exited immediately"))?;
        event!(Level::INFO, pid, ?binary, "Launched host agent");

        let name = machine.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => event!(Level::INFO, machine = %name, %status, "Host agent exited"),
                Err(e) => event!(Level::WARN, machine = %name, ?e, "Failed to wait on host agent"),
            }
        });
        Ok(pid)
    }

    async fn stop_backend(&self, machine: &Machine) -> Result<()> {
        self.driver(machine).stop().await
    }
}
