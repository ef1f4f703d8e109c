//! QEMU full-system driver.
//!
//! The command line is assembled from templated argument strings (see
//! [`QemuDriver::qemu_args`]); the `[backend] qemu_args` configuration is
//! appended and may use the same substitutions. A graceful stop goes
//! through the QMP socket, guest vsock ports are emulated with
//! virtio-serial ports backed by unix sockets.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{event, instrument, Level};

use meridian_rs::spec::{Arch, VmType};
use meridian_rs::util::expand_home;
use mdn_forward::Dialer;

use crate::disk::{ensure_disk, is_iso9660};
use crate::process::{find_binary, log_stdio, raise_nofile_limit, VmProcess};
use crate::vsock::SocketDialer;
use crate::{BaseDriver, Driver, DriverError, ExitReceiver};

const QMP_TIMEOUT: Duration = Duration::from_secs(10);

const AARCH64_FIRMWARE: &[&str] = &[
    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
    "/usr/local/share/qemu/edk2-aarch64-code.fd",
    "/usr/share/qemu/edk2-aarch64-code.fd",
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    "/usr/share/AAVMF/AAVMF_CODE.fd",
];

/// Arguments every machine gets. Values in braces are substituted.
#[rustfmt::skip]
const BASE_ARGS: &[&str] = &[
    "-name", "{name}",
    "-machine", "{machine},accel={accel}",
    "-cpu", "{cpu}",
    "-smp", "{cpus}",
    "-m", "{memory_mib}",
    "-drive", "if=virtio,format=raw,file={diff_disk}",
    "-drive", "if=virtio,format=raw,readonly=on,file={cidata_iso}",
    "-serial", "file:{serial_log}",
    "-qmp", "unix:{qmp_socket},server=on,wait=off",
    "-display", "{display}",
    "-device", "virtio-rng-pci",
    "-device", "virtio-serial-pci",
];

pub struct QemuDriver {
    base: BaseDriver,
    process: Mutex<Option<Arc<VmProcess>>>,
}

fn binary_arch(arch: Arch) -> &'static str {
    match arch {
        Arch::X86_64 => "x86_64",
        Arch::Aarch64 => "aarch64",
        Arch::Armv7l => "arm",
        Arch::Riscv64 => "riscv64",
    }
}

fn machine_type(arch: Arch) -> &'static str {
    match arch {
        Arch::X86_64 => "q35",
        Arch::Aarch64 | Arch::Armv7l | Arch::Riscv64 => "virt",
    }
}

/// Hardware acceleration available for a guest of `arch` on this host.
fn accelerator(arch: Arch) -> &'static str {
    if arch != Arch::native() {
        "tcg"
    } else if cfg!(target_os = "macos") {
        "hvf"
    } else if Path::new("/dev/kvm").exists() {
        "kvm"
    } else {
        "tcg"
    }
}

/// `net=` / `host=` options placing the user-mode network on the subnet of
/// a statically assigned address.
fn slirp_subnet(address: &str, gateway: &str) -> Option<String> {
    let (ip, prefix) = address.split_once('/')?;
    let ip: Ipv4Addr = ip.parse().ok()?;
    let prefix: u32 = prefix.parse().ok().filter(|p| *p <= 32)?;
    let gateway: Ipv4Addr = gateway.parse().ok()?;
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    Some(format!(",net={network}/{prefix},host={gateway}"))
}

/// Send one QMP command and wait for its `return`, skipping async events.
async fn qmp_execute<R, W>(
    lines: &mut tokio::io::Lines<BufReader<R>>,
    write: &mut W,
    command: &str,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut request = serde_json::json!({ "execute": command }).to_string();
    request.push('\n');
    write.write_all(request.as_bytes()).await?;

    loop {
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("QMP connection closed while waiting for `{command}`"))?;
        let reply: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse QMP reply {line:?}"))?;
        if reply.get("return").is_some() {
            return Ok(());
        }
        if let Some(error) = reply.get("error") {
            bail!("QMP command `{command}` failed: {error}");
        }
        event!(Level::TRACE, %line, "Ignoring QMP event");
    }
}

pub(crate) async fn qmp_powerdown(socket: &Path) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connect to QMP socket {socket:?}"))?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let greeting = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("QMP connection closed before greeting"))?;
    event!(Level::TRACE, %greeting, "QMP greeting");

    qmp_execute(&mut lines, &mut write, "qmp_capabilities").await?;
    qmp_execute(&mut lines, &mut write, "system_powerdown").await
}

impl QemuDriver {
    pub fn new(base: BaseDriver) -> Self {
        QemuDriver {
            base,
            process: Mutex::new(None),
        }
    }

    fn qemu_binary(&self) -> PathBuf {
        match self.base.backend.qemu_binary {
            Some(ref bin) => bin.clone(),
            None => PathBuf::from(format!(
                "qemu-system-{}",
                binary_arch(self.base.spec().arch())
            )),
        }
    }

    fn firmware(&self) -> Option<PathBuf> {
        let spec = self.base.spec();
        if spec.firmware.legacy_bios {
            return None;
        }
        if let Some(image) = spec.firmware.images.first() {
            return Some(expand_home(image));
        }
        match spec.arch() {
            Arch::Aarch64 => AARCH64_FIRMWARE
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file()),
            _ => None,
        }
    }

    fn substs(&self) -> Result<HashMap<String, String>> {
        let spec = self.base.spec();
        let dir = &self.base.dir;
        let accel = accelerator(spec.arch());
        let display = match spec.video.display.as_str() {
            "" | "none" => "none",
            other => other,
        };

        let mut substs = HashMap::new();
        substs.insert("name".to_string(), self.base.machine.name.clone());
        substs.insert("machine".to_string(), machine_type(spec.arch()).to_string());
        substs.insert("accel".to_string(), accel.to_string());
        substs.insert(
            "cpu".to_string(),
            if accel == "tcg" { "max" } else { "host" }.to_string(),
        );
        substs.insert("cpus".to_string(), spec.cpus().to_string());
        substs.insert(
            "memory_mib".to_string(),
            (spec.memory_bytes()? >> 20).to_string(),
        );
        substs.insert("display".to_string(), display.to_string());
        for (key, path) in [
            ("dir", dir.path().to_path_buf()),
            ("base_disk", dir.base_disk()),
            ("diff_disk", dir.diff_disk()),
            ("cidata_iso", dir.cidata_iso()),
            ("serial_log", dir.serial_log()),
            ("qmp_socket", dir.vmm_sock()),
        ] {
            substs.insert(key.to_string(), path.display().to_string());
        }
        Ok(substs)
    }

    /// Full QEMU command line.
    pub fn qemu_args(&self, base_is_iso: bool) -> Result<Vec<String>> {
        let spec = self.base.spec();
        let dir = &self.base.dir;
        let substs = self.substs()?;

        let mut args = BASE_ARGS
            .iter()
            .copied()
            .map(String::from)
            .collect::<Vec<_>>();

        if let Some(firmware) = self.firmware() {
            args.push("-bios".into());
            args.push(firmware.display().to_string());
        }
        if base_is_iso {
            args.extend(["-cdrom", "{base_disk}", "-boot", "once=d"].map(String::from));
        }

        for (i, network) in spec.networks.iter().enumerate() {
            let subnet = slirp_subnet(&network.address, &network.ip_gateway).unwrap_or_default();
            args.push("-netdev".into());
            args.push(format!("user,id=net{i}{subnet}"));
            args.push("-device".into());
            args.push(format!("virtio-net-pci,netdev=net{i},mac={}", network.mac_address));
        }

        for (i, mount) in spec.mounts.iter().enumerate() {
            let location = expand_home(&mount.location);
            let mut virtfs = format!(
                "local,path={},mount_tag=mount{i},security_model=mapped-xattr,id=mount{i}",
                location.display()
            );
            if !mount.writable {
                virtfs.push_str(",readonly=on");
            }
            args.push("-virtfs".into());
            args.push(virtfs);
        }

        for port in self.base.vsock_ports() {
            args.push("-chardev".into());
            args.push(format!(
                "socket,id=vsock{port},path={},server=on,wait=off",
                dir.vsock_sock(port).display()
            ));
            args.push("-device".into());
            args.push(format!("virtserialport,chardev=vsock{port},name=meridian.{port}"));
        }

        args.extend(self.base.backend.qemu_args.iter().cloned());

        args.iter()
            .map(|argstr| strfmt::strfmt(argstr, &substs))
            .collect::<Result<Vec<String>, strfmt::FmtError>>()
            .map_err(|format_error| {
                anyhow!("Failed to generate QEMU command line arguments: {format_error:?}")
            })
    }
}

#[async_trait]
impl Driver for QemuDriver {
    fn vm_type(&self) -> VmType {
        VmType::Qemu
    }

    fn base(&self) -> &BaseDriver {
        &self.base
    }

    async fn validate(&self) -> Result<(), DriverError> {
        let spec = self.base.spec();
        let binary = self.qemu_binary();
        let found = if binary.components().count() > 1 {
            binary.is_file()
        } else {
            find_binary(&binary.to_string_lossy(), &[]).is_some()
        };
        if !found {
            return Err(DriverError::Requirement {
                driver: VmType::Qemu,
                requirement: format!("{} in PATH", binary.display()),
            });
        }

        if spec.arch() == Arch::Aarch64 && self.firmware().is_none() {
            return Err(DriverError::Requirement {
                driver: VmType::Qemu,
                requirement: "UEFI firmware for aarch64 (edk2-aarch64-code.fd), \
                              or `firmware.images`"
                    .to_string(),
            });
        }
        if spec.firmware.images.len() > 1 {
            return Err(DriverError::Unsupported {
                driver: VmType::Qemu,
                option: "firmware.images (more than one)".to_string(),
            });
        }

        if !spec.audio.device.is_empty() && spec.audio.device != "none" {
            event!(
                Level::INFO,
                "field `audio.device` is ignored by the QEMU driver, got {:?}",
                spec.audio.device
            );
        }
        if accelerator(spec.arch()) == "tcg" {
            event!(
                Level::WARN,
                arch = %spec.arch(),
                "No hardware acceleration available, falling back to TCG emulation"
            );
        }
        Ok(())
    }

    async fn create_disk(&self) -> Result<()> {
        ensure_disk(&self.base).await
    }

    #[instrument(skip(self), fields(machine = %self.base.machine.name), err(Debug, level = Level::WARN))]
    async fn start(&self) -> Result<ExitReceiver> {
        raise_nofile_limit();
        let base_is_iso = is_iso9660(&self.base.dir.base_disk()).await?;
        let qemu_args = self.qemu_args(base_is_iso)?;

        for path in self
            .base
            .vsock_ports()
            .into_iter()
            .map(|port| self.base.dir.vsock_sock(port))
            .chain(std::iter::once(self.base.dir.vmm_sock()))
        {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(e).with_context(|| format!("remove stale socket {path:?}")),
            }
        }
        for mount in self.base.spec().mounts.iter() {
            tokio::fs::create_dir_all(expand_home(&mount.location)).await?;
        }

        let qemu_binary = self.qemu_binary();
        let (stdout, stderr) = log_stdio(&self.base.dir.vmm_log())?;
        let mut cmd = Command::new(&qemu_binary);
        cmd.args(&qemu_args)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        event!(Level::INFO, ?qemu_binary, ?qemu_args, "Launching QEMU process");

        let (process, exit) = VmProcess::spawn("QEMU", cmd)?;
        *self
            .process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(process));
        Ok(exit)
    }

    async fn stop(&self) -> Result<()> {
        let process = self
            .process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(process) = process else {
            return Ok(());
        };
        if process.stopped() {
            return Ok(());
        }

        event!(Level::INFO, pid = ?process.pid(), "Sending system_powerdown to QEMU");
        let request = match tokio::time::timeout(
            QMP_TIMEOUT,
            qmp_powerdown(&self.base.dir.vmm_sock()),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(anyhow!("QMP did not answer within {QMP_TIMEOUT:?}")),
        };
        process
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
}

#[cfg(test)]
mod test {
    use super::*;
    use meridian_rs::config::MeridianConfig;
    use meridian_rs::machine::Machine;
    use meridian_rs::spec::{Mount, Network, VmSpec};

    fn driver(config: &MeridianConfig) -> QemuDriver {
        let spec = VmSpec {
            vm_type: Some(VmType::Qemu),
            arch: Some(Arch::X86_64),
            cpus: Some(2),
            memory: Some("1GiB".into()),
            networks: vec![Network {
                mac_address: "52:55:55:0a:0b:0c".into(),
                address: "192.168.64.5/24".into(),
                ip_gateway: "192.168.64.1".into(),
                ..Default::default()
            }],
            mounts: vec![Mount {
                location: "/data/vm1".into(),
                mount_point: "/mnt/disk0".into(),
                writable: true,
            }],
            ..Default::default()
        };
        QemuDriver::new(BaseDriver::new(
            Machine::new("vm1", spec),
            Path::new("/r/vms"),
            config,
        ))
    }

    #[test]
    fn test_qemu_args() {
        let mut config = MeridianConfig::default();
        config.backend.qemu_args = vec!["-device".into(), "virtio-balloon,id={name}-balloon".into()];
        let d = driver(&config);
        let args = d.qemu_args(false).unwrap();
        let joined = args.join(" ");

        assert_eq!(d.qemu_binary(), PathBuf::from("qemu-system-x86_64"));
        assert!(joined.contains("-name vm1"));
        assert!(joined.contains("-machine q35,accel="));
        assert!(joined.contains("-smp 2 -m 1024"));
        assert!(joined.contains("file=/r/vms/vm1/diff.img"));
        assert!(joined.contains("-qmp unix:/r/vms/vm1/vmm.sock,server=on,wait=off"));
        assert!(joined.contains("-display none"));
        assert!(joined.contains(
            "user,id=net0,net=192.168.64.0/24,host=192.168.64.1"
        ));
        assert!(joined.contains("virtio-net-pci,netdev=net0,mac=52:55:55:0a:0b:0c"));
        assert!(joined.contains("local,path=/data/vm1,mount_tag=mount0"));
        assert!(joined.contains("virtserialport,chardev=vsock10443,name=meridian.10443"));
        assert!(!joined.contains("-cdrom"));
        assert_eq!(
            &args[args.len() - 2..],
            &["-device".to_string(), "virtio-balloon,id=vm1-balloon".to_string()]
        );

        let iso = d.qemu_args(true).unwrap().join(" ");
        assert!(iso.contains("-cdrom /r/vms/vm1/base.img"));
    }

    #[test]
    fn test_bad_template() {
        let mut config = MeridianConfig::default();
        config.backend.qemu_args = vec!["{no_such_key}".into()];
        let err = driver(&config).qemu_args(false).unwrap_err();
        assert!(err.to_string().contains("Failed to generate QEMU command line"));
    }

    #[test]
    fn test_slirp_subnet() {
        assert_eq!(
            slirp_subnet("10.1.2.3/16", "10.1.0.1").as_deref(),
            Some(",net=10.1.0.0/16,host=10.1.0.1")
        );
        assert_eq!(slirp_subnet("", ""), None);
        assert_eq!(slirp_subnet("10.1.2.3/40", "10.1.0.1"), None);
    }

    #[tokio::test]
    async fn test_qmp_powerdown() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("vmm.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let (read, mut write) = conn.into_split();
            let mut lines = BufReader::new(read).lines();
            write
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .await
                .unwrap();
            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                seen.push(req["execute"].as_str().unwrap().to_string());
                // An async event interleaved before the reply:
                write
                    .write_all(b"{\"event\": \"POWERDOWN\", \"timestamp\": {}}\n")
                    .await
                    .unwrap();
                write.write_all(b"{\"return\": {}}\n").await.unwrap();
            }
            seen
        });

        qmp_powerdown(&sock).await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["qmp_capabilities", "system_powerdown"]);
    }
}
