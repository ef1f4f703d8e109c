//! Apple Virtualization.framework driver, driven through a `vfkit` child
//! process.
//!
//! vfkit exposes a small REST API (`--restful-uri`) that is used for a
//! graceful stop. Guest vsock ports are bridged to per-port unix sockets in
//! the machine directory, which [`SocketDialer`] connects to.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{event, instrument, Level};

use meridian_rs::spec::{Arch, NetworkMode, Os, VmType};
use meridian_rs::util::expand_home;
use mdn_forward::Dialer;

use crate::disk::{ensure_disk, is_iso9660};
use crate::process::{find_binary, log_stdio, raise_nofile_limit, run_tool, VmProcess};
use crate::vsock::SocketDialer;
use crate::{BaseDriver, Driver, DriverError, ExitReceiver};

const VFKIT_FALLBACKS: &[&str] = &["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"];
const MIN_MACOS_MAJOR: u32 = 13;
const GUI_WIDTH: u32 = 1920;
const GUI_HEIGHT: u32 = 1200;

struct Running {
    process: VmProcess,
    rest_port: u16,
}

pub struct VzDriver {
    base: BaseDriver,
    running: Mutex<Option<Arc<Running>>>,
}

fn requirement(requirement: impl Into<String>) -> DriverError {
    DriverError::Requirement {
        driver: VmType::Vz,
        requirement: requirement.into(),
    }
}

fn unsupported(option: impl Into<String>) -> DriverError {
    DriverError::Unsupported {
        driver: VmType::Vz,
        option: option.into(),
    }
}

/// Grab an unused localhost TCP port for the REST endpoint.
fn free_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).context("allocate vfkit REST port")?;
    Ok(listener.local_addr()?.port())
}

async fn macos_major_version() -> Result<u32> {
    let output = run_tool(Command::new("sw_vers").arg("-productVersion")).await?;
    let version = String::from_utf8_lossy(&output);
    version
        .trim()
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .ok_or_else(|| anyhow!("unexpected macOS version {:?}", version.trim()))
}

impl VzDriver {
    pub fn new(base: BaseDriver) -> Self {
        VzDriver {
            base,
            running: Mutex::new(None),
        }
    }

    fn vfkit(&self) -> Option<PathBuf> {
        match self.base.backend.vfkit_binary {
            Some(ref bin) => Some(bin.clone()),
            None => find_binary("vfkit", VFKIT_FALLBACKS),
        }
    }

    fn running(&self) -> Option<Arc<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn gui_display(&self) -> bool {
        matches!(self.base.spec().video.display.as_str(), "vz" | "default")
    }

    /// Command line for vfkit. `base_is_iso` attaches the base image as an
    /// installer medium next to the (empty) data disk.
    fn vfkit_args(&self, rest_port: u16, base_is_iso: bool) -> Result<Vec<String>> {
        let spec = self.base.spec();
        let dir = &self.base.dir;
        let memory_mib = spec.memory_bytes()? >> 20;
        if memory_mib == 0 {
            bail!("vz driver needs a memory size, got {:?}", spec.memory);
        }

        let mut args: Vec<String> = vec![
            "--cpus".into(),
            spec.cpus().to_string(),
            "--memory".into(),
            memory_mib.to_string(),
            "--bootloader".into(),
            format!(
                "efi,variable-store={},create",
                dir.path().join("efi-variable-store").display()
            ),
            "--restful-uri".into(),
            format!("tcp://localhost:{rest_port}"),
        ];

        let mut device = |d: String| {
            args.push("--device".into());
            args.push(d);
        };

        if base_is_iso {
            device(format!(
                "usb-mass-storage,path={},readonly",
                dir.base_disk().display()
            ));
        }
        device(format!("virtio-blk,path={}", dir.diff_disk().display()));
        device(format!("virtio-blk,path={}", dir.cidata_iso().display()));

        for network in spec.networks.iter() {
            device(format!("virtio-net,nat,mac={}", network.mac_address));
        }

        device(format!(
            "virtio-serial,logFilePath={}",
            dir.serial_log().display()
        ));
        device("virtio-rng".into());

        for (i, mount) in spec.mounts.iter().enumerate() {
            let location = expand_home(&mount.location);
            let mut share = format!("virtio-fs,sharedDir={},mountTag=mount{i}", location.display());
            if !mount.writable {
                // vfkit shares are writable unless told otherwise:
                share.push_str(",readonly");
            }
            device(share);
        }

        for port in self.base.vsock_ports() {
            device(format!(
                "virtio-vsock,port={port},socketURL={},listen",
                dir.vsock_sock(port).display()
            ));
        }

        match spec.audio.device.as_str() {
            "" | "none" => (),
            "vz" | "default" => {
                event!(Level::DEBUG, "vfkit has no sound device, audio is ignored");
            }
            other => bail!("unexpected audio device {other:?}"),
        }

        let gui = match spec.video.display.as_str() {
            "vz" | "default" => {
                device(format!("virtio-gpu,width={GUI_WIDTH},height={GUI_HEIGHT}"));
                device("virtio-input,keyboard".into());
                device("virtio-input,pointing".into());
                true
            }
            "" | "none" => false,
            other => bail!("unexpected video display {other:?}"),
        };
        if gui {
            args.push("--gui".into());
        }

        Ok(args)
    }

    async fn request_stop(rest_port: u16) -> Result<()> {
        let url = format!("http://localhost:{rest_port}/vm/state");
        let response = reqwest::Client::new()
            .put(&url)
            .json(&serde_json::json!({"state": "Stop"}))
            .send()
            .await
            .with_context(|| format!("PUT {url}"))?;
        if !response.status().is_success() {
            bail!("vfkit refused stop request: HTTP {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for VzDriver {
    fn vm_type(&self) -> VmType {
        VmType::Vz
    }

    fn base(&self) -> &BaseDriver {
        &self.base
    }

    async fn validate(&self) -> Result<(), DriverError> {
        if !cfg!(target_os = "macos") {
            return Err(requirement(format!("macOS {MIN_MACOS_MAJOR} or higher")));
        }
        match macos_major_version().await {
            Ok(major) if major >= MIN_MACOS_MAJOR => (),
            Ok(major) => {
                return Err(requirement(format!(
                    "macOS {MIN_MACOS_MAJOR} or higher, running {major}"
                )))
            }
            Err(e) => {
                return Err(requirement(format!(
                    "macOS {MIN_MACOS_MAJOR} or higher ({e:#})"
                )))
            }
        }

        let spec = self.base.spec();
        if spec.firmware.legacy_bios {
            return Err(unsupported("firmware.legacyBIOS"));
        }
        if !spec.firmware.images.is_empty() {
            return Err(unsupported("firmware.images"));
        }
        if spec.os() == Os::Darwin {
            return Err(unsupported("os: Darwin"));
        }
        if spec.arch() != Arch::native() {
            return Err(DriverError::UnsupportedArch(spec.arch()));
        }
        if let Some(i) = spec
            .networks
            .iter()
            .position(|n| n.mode == NetworkMode::Bridged)
        {
            return Err(unsupported(format!("networks[{i}].mode: bridged")));
        }

        match spec.audio.device.as_str() {
            "" | "vz" | "default" | "none" => (),
            other => event!(
                Level::INFO,
                "field `audio.device` must be \"vz\", \"default\", or \"none\" for VZ driver, got {other:?}"
            ),
        }
        match spec.video.display.as_str() {
            "" | "vz" | "default" | "none" => (),
            other => event!(
                Level::INFO,
                "field `video.display` must be \"vz\", \"default\", or \"none\" for VZ driver, got {other:?}"
            ),
        }

        if self.vfkit().is_none() {
            return Err(requirement("vfkit (install it with `brew install vfkit`)"));
        }
        Ok(())
    }

    async fn create_disk(&self) -> Result<()> {
        ensure_disk(&self.base).await
    }

    #[instrument(skip(self), fields(machine = %self.base.machine.name), err(Debug, level = Level::WARN))]
    async fn start(&self) -> Result<ExitReceiver> {
        if let Some(running) = self.running() {
            if !running.process.stopped() {
                bail!("vfkit is already running with pid {:?}", running.process.pid());
            }
        }

        raise_nofile_limit();
        let vfkit = self
            .vfkit()
            .ok_or_else(|| requirement("vfkit (install it with `brew install vfkit`)"))?;
        let base_is_iso = is_iso9660(&self.base.dir.base_disk()).await?;
        let rest_port = free_port()?;
        let args = self.vfkit_args(rest_port, base_is_iso)?;

        for port in self.base.vsock_ports() {
            match tokio::fs::remove_file(self.base.dir.vsock_sock(port)).await {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(e).context("remove stale vsock socket"),
            }
        }
        for mount in self.base.spec().mounts.iter() {
            tokio::fs::create_dir_all(expand_home(&mount.location)).await?;
        }

        let (stdout, stderr) = log_stdio(&self.base.dir.vmm_log())?;
        let mut cmd = Command::new(&vfkit);
        cmd.args(&args).stdout(stdout).stderr(stderr);
        event!(Level::INFO, ?vfkit, rest_port, "Starting vfkit");

        let (process, exit) = VmProcess::spawn("vfkit", cmd)?;
        *self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(Arc::new(Running { process, rest_port }));
        Ok(exit)
    }

    async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(running) = running else {
            event!(Level::DEBUG, "vz machine not running, nothing to stop");
            return Ok(());
        };
        if running.process.stopped() {
            return Ok(());
        }

        event!(Level::INFO, "Shutting down VZ");
        let request = Self::request_stop(running.rest_port).await;
        running
            .process
            .shutdown(request, self.base.timeouts.driver_stop)
            .await
    }

    fn dialer(&self) -> Result<Arc<dyn Dialer>> {
        let dir = &self.base.dir;
        Ok(Arc::new(SocketDialer::new(
            self.base
                .vsock_ports()
                .into_iter()
                .map(|port| (port, dir.vsock_sock(port))),
        )))
    }

    fn can_run_gui(&self) -> bool {
        self.gui_display()
    }

    async fn run_gui(&self) -> Result<()> {
        if !self.can_run_gui() {
            bail!(
                "RunGUI is not supported for the given driver '{}' and display '{}'",
                VmType::Vz,
                self.base.spec().video.display
            );
        }
        // vfkit opens the window itself, the console lives as long as it does:
        let running = self.running().ok_or(DriverError::NotRunning(VmType::Vz))?;
        running.process.exited().await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use meridian_rs::config::MeridianConfig;
    use meridian_rs::machine::Machine;
    use meridian_rs::spec::{Mount, Network, PortForward, VmSpec};
    use std::path::Path;

    fn driver(display: &str) -> VzDriver {
        let mut spec = VmSpec {
            vm_type: Some(VmType::Vz),
            cpus: Some(4),
            memory: Some("2GiB".into()),
            networks: vec![Network {
                mac_address: "52:55:55:01:02:03".into(),
                ..Default::default()
            }],
            mounts: vec![Mount {
                location: "/data/vm1".into(),
                mount_point: "/mnt/disk0".into(),
                writable: false,
            }],
            ..Default::default()
        };
        spec.video.display = display.to_string();
        spec.set_forward(PortForward::unix_to_vsock("/tmp/x.sock", 2222));
        let base = BaseDriver::new(
            Machine::new("vm1", spec),
            Path::new("/r/vms"),
            &MeridianConfig::default(),
        );
        VzDriver::new(base)
    }

    #[test]
    fn test_vfkit_args() {
        let d = driver("none");
        let args = d.vfkit_args(4242, false).unwrap().join(" ");
        assert!(args.starts_with("--cpus 4 --memory 2048 "), "{args}");
        assert!(args.contains("--restful-uri tcp://localhost:4242"));
        assert!(args.contains("virtio-blk,path=/r/vms/vm1/diff.img"));
        assert!(!args.contains("usb-mass-storage"));
        assert!(args.contains("virtio-net,nat,mac=52:55:55:01:02:03"));
        assert!(args.contains("virtio-fs,sharedDir=/data/vm1,mountTag=mount0,readonly"));
        assert!(args.contains("virtio-vsock,port=2222,socketURL=/r/vms/vm1/vsock-2222.sock,listen"));
        assert!(args.contains("virtio-vsock,port=10443,"));
        assert!(!args.contains("--gui"));
        assert!(!d.can_run_gui());

        let iso = d.vfkit_args(4242, true).unwrap().join(" ");
        assert!(iso.contains("usb-mass-storage,path=/r/vms/vm1/base.img,readonly"));
    }

    #[test]
    fn test_gui_devices() {
        let d = driver("default");
        assert!(d.can_run_gui());
        let args = d.vfkit_args(1, false).unwrap();
        assert!(args.iter().any(|a| a == "--gui"));
        assert!(args.iter().any(|a| a.starts_with("virtio-gpu,")));

        assert!(driver("vnc").vfkit_args(1, false).is_err());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let d = driver("none");
        d.stop().await.unwrap();
        let err = d.run_gui().await.unwrap_err();
        assert!(err.to_string().contains("RunGUI is not supported"));
    }
}
