//! Windows Subsystem for Linux driver.
//!
//! Each machine is imported as its own WSL distribution named
//! `meridian-<name>`, with the base image as root filesystem tarball. The
//! distribution stays up while a keep-alive `wsl.exe` child runs. WSL2
//! shares the host's loopback, so guest "vsock" ports are plain localhost
//! TCP ports.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{event, instrument, Level};

use meridian_rs::spec::{Arch, VmType};
use mdn_forward::Dialer;

use crate::cidata::GUEST_BINARY_ENTRY;
use crate::disk::ensure_base_disk;
use crate::process::{log_stdio, run_tool, VmProcess};
use crate::vsock::LoopbackDialer;
use crate::{BaseDriver, Driver, DriverError, ExitReceiver};

const WSL: &str = "wsl.exe";
const MIN_WINDOWS: &str = "Windows 10 build 19041 or later";

pub struct Wsl2Driver {
    base: BaseDriver,
    keepalive: Mutex<Option<Arc<VmProcess>>>,
}

fn requirement(requirement: impl Into<String>) -> DriverError {
    DriverError::Requirement {
        driver: VmType::Wsl2,
        requirement: requirement.into(),
    }
}

fn ensure_windows() -> Result<(), DriverError> {
    if cfg!(windows) {
        Ok(())
    } else {
        Err(requirement(MIN_WINDOWS))
    }
}

/// `wsl.exe` writes its own messages as UTF-16LE, while commands run inside
/// a distribution produce UTF-8.
pub fn decode_wsl_output(bytes: &[u8]) -> String {
    let looks_utf16 = bytes.len() >= 2
        && bytes.len() % 2 == 0
        && bytes.iter().skip(1).step_by(2).all(|b| *b == 0);
    if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

async fn wsl(args: &[&str]) -> Result<String> {
    let output = run_tool(Command::new(WSL).args(args)).await?;
    Ok(decode_wsl_output(&output))
}

impl Wsl2Driver {
    pub fn new(base: BaseDriver) -> Self {
        Wsl2Driver {
            base,
            keepalive: Mutex::new(None),
        }
    }

    pub fn distro_name(&self) -> String {
        format!("meridian-{}", self.base.machine.name)
    }

    async fn registered(&self) -> Result<bool> {
        let distro = self.distro_name();
        let list = wsl(&["--list", "--quiet"]).await?;
        Ok(list
            .lines()
            .map(|l| l.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
            .any(|l| l == distro))
    }

    async fn import(&self) -> Result<()> {
        let distro = self.distro_name();
        let install_dir = self.base.dir.path().join("wsl");
        tokio::fs::create_dir_all(&install_dir).await?;
        event!(Level::INFO, %distro, "Importing WSL distribution");
        wsl(&[
            "--import",
            &distro,
            &install_dir.to_string_lossy(),
            &self.base.dir.base_disk().to_string_lossy(),
            "--version",
            "2",
        ])
        .await
        .with_context(|| format!("import WSL distribution {distro}"))?;
        Ok(())
    }

    /// Shell script run as root inside the distribution on every boot. It
    /// applies the boot data directory the same way cloud-init would.
    pub fn boot_script(&self) -> String {
        let cidata = self.base.dir.cidata_dir();
        let user = &self.base.machine.name;
        let mut script = format!(
            "set -e\n\
             cidata=\"$(wslpath -u '{cidata}')\"\n\
             id -u {user} >/dev/null 2>&1 || useradd -m -u 1000 -s /bin/bash {user}\n\
             install -d -m 0700 -o {user} /home/{user}/.ssh\n\
             install -m 0600 -o {user} \"$cidata/ssh_authorized_keys\" /home/{user}/.ssh/authorized_keys\n\
             install -m 0755 \"$cidata/{GUEST_BINARY_ENTRY}\" /usr/local/bin/{GUEST_BINARY_ENTRY}\n",
            cidata = cidata.display(),
        );
        for (i, mount) in self.base.spec().mounts.iter().enumerate() {
            script.push_str(&format!(
                "mkdir -p '{point}' && (mountpoint -q '{point}' || mount --bind \"$(wslpath -u '{location}')\" '{point}') # mount{i}\n",
                point = mount.mount_point,
                location = mount.location,
            ));
        }
        script.push_str(&format!(
            "/usr/local/bin/{GUEST_BINARY_ENTRY} install --tcp-port {}\n",
            meridian_rs::api::GUEST_AGENT_VSOCK_PORT
        ));
        script
    }
}

#[async_trait]
impl Driver for Wsl2Driver {
    fn vm_type(&self) -> VmType {
        VmType::Wsl2
    }

    fn base(&self) -> &BaseDriver {
        &self.base
    }

    async fn validate(&self) -> Result<(), DriverError> {
        ensure_windows()?;
        let spec = self.base.spec();
        if spec.arch() != Arch::native() {
            return Err(DriverError::UnsupportedArch(spec.arch()));
        }
        if spec.firmware.legacy_bios || !spec.firmware.images.is_empty() {
            return Err(DriverError::Unsupported {
                driver: VmType::Wsl2,
                option: "firmware".to_string(),
            });
        }
        if !spec.audio.device.is_empty() {
            event!(
                Level::INFO,
                "field `audio.device` is ignored by the WSL2 driver, got {:?}",
                spec.audio.device
            );
        }
        Ok(())
    }

    async fn create_disk(&self) -> Result<()> {
        ensure_windows()?;
        ensure_base_disk(&self.base).await?;
        if !self.registered().await? {
            self.import().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(machine = %self.base.machine.name), err(Debug, level = Level::WARN))]
    async fn start(&self) -> Result<ExitReceiver> {
        ensure_windows()?;
        if !self.registered().await? {
            self.import().await?;
        }

        let distro = self.distro_name();
        wsl(&["-d", &distro, "-u", "root", "--", "bash", "-c", &self.boot_script()])
            .await
            .with_context(|| format!("boot WSL distribution {distro}"))?;

        let (stdout, stderr) = log_stdio(&self.base.dir.vmm_log())?;
        let mut cmd = Command::new(WSL);
        cmd.args(["-d", distro.as_str(), "-u", "root", "--", "sleep", "infinity"])
            .stdout(stdout)
            .stderr(stderr);
        let (process, exit) = VmProcess::spawn("wsl", cmd)?;
        *self
            .keepalive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(process));
        Ok(exit)
    }

    async fn stop(&self) -> Result<()> {
        ensure_windows()?;
        let distro = self.distro_name();
        let request = wsl(&["--terminate", &distro]).await.map(|_| ());

        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match keepalive {
            Some(process) => process.shutdown(request, self.base.timeouts.driver_stop).await,
            None => request,
        }
    }

    fn dialer(&self) -> Result<Arc<dyn Dialer>> {
        Ok(Arc::new(LoopbackDialer))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use meridian_rs::config::MeridianConfig;
    use meridian_rs::machine::Machine;
    use meridian_rs::spec::{Mount, VmSpec};
    use std::path::Path;

    fn driver() -> Wsl2Driver {
        let spec = VmSpec {
            vm_type: Some(VmType::Wsl2),
            mounts: vec![Mount {
                location: "C:\\data\\vm1".into(),
                mount_point: "/mnt/disk0".into(),
                writable: true,
            }],
            ..Default::default()
        };
        Wsl2Driver::new(BaseDriver::new(
            Machine::new("vm1", spec),
            Path::new("/r/vms"),
            &MeridianConfig::default(),
        ))
    }

    #[test]
    fn test_decode_wsl_output() {
        let utf16: Vec<u8> = "Ubuntu\r\nmeridian-vm1\r\n"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(decode_wsl_output(&utf16), "Ubuntu\r\nmeridian-vm1\r\n");
        assert_eq!(decode_wsl_output(b"plain"), "plain");
    }

    #[test]
    fn test_boot_script() {
        let d = driver();
        assert_eq!(d.distro_name(), "meridian-vm1");
        let script = d.boot_script();
        assert!(script.contains("wslpath -u '/r/vms/vm1/cidata'"));
        assert!(script.contains("useradd -m -u 1000 -s /bin/bash vm1"));
        assert!(script.contains("mount --bind"));
        assert!(script.contains("install --tcp-port 10443"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_requires_windows() {
        let d = driver();
        let err = d.validate().await.unwrap_err();
        assert!(err.to_string().contains("19041"));
        assert!(d.start().await.is_err());
        assert!(d.stop().await.is_err());
    }
}
