//! Declarative description of a virtual machine.
//!
//! A [`VmSpec`] is what a user submits on `Create` / `Run`. Most fields are
//! optional on input and filled in from the configured baseline template by
//! [`VmSpec::set_default`]; [`VmSpec::validate`] then checks that everything
//! a backend driver needs is present.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::api::GUEST_AGENT_VSOCK_PORT;
use crate::config::VmDefaults;

/// Locally administered OUI used for every generated MAC address.
pub const MAC_OUI: [u8; 3] = [0x52, 0x55, 0x55];

/// Mount point of the per-machine data directory inside the guest.
pub const DATA_MOUNT_POINT: &str = "/mnt/disk0";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Apple Virtualization.framework.
    #[default]
    Vz,
    /// Windows Subsystem for Linux, version 2.
    Wsl2,
    /// QEMU full-system emulation / KVM / HVF.
    Qemu,
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmType::Vz => write!(f, "vz"),
            VmType::Wsl2 => write!(f, "wsl2"),
            VmType::Qemu => write!(f, "qemu"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Os {
    #[default]
    Linux,
    Darwin,
    Windows,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Os::Linux => write!(f, "Linux"),
            Os::Darwin => write!(f, "Darwin"),
            Os::Windows => write!(f, "Windows"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "armv7l")]
    Armv7l,
    #[serde(rename = "riscv64")]
    Riscv64,
}

impl Arch {
    /// Architecture of the host this process runs on.
    pub fn native() -> Arch {
        match std::env::consts::ARCH {
            "aarch64" => Arch::Aarch64,
            "arm" => Arch::Armv7l,
            "riscv64" => Arch::Riscv64,
            _ => Arch::X86_64,
        }
    }

    /// Architecture name as used in guest binary release artifacts.
    pub fn go_name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "amd64",
            Arch::Aarch64 => "arm64",
            Arch::Armv7l => "arm",
            Arch::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
            Arch::Armv7l => write!(f, "armv7l"),
            Arch::Riscv64 => write!(f, "riscv64"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Nat,
    Bridged,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default)]
    pub mode: NetworkMode,
    /// Host interface to bridge onto, only meaningful for
    /// [`NetworkMode::Bridged`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_interface: Option<String>,
    #[serde(default)]
    pub mac_address: String,
    /// Assigned address in CIDR notation, e.g. `192.168.64.2/24`.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub ip_gateway: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Host directory. A leading `~` is expanded.
    pub location: String,
    /// Absolute path inside the guest.
    pub mount_point: String,
    #[serde(default)]
    pub writable: bool,
}

/// A single port-forward rule.
///
/// The far end is either a network address (`dst_addr`) or, when reached
/// through the backend's vsock dialer, a vsock port.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub src_proto: String,
    pub src_addr: String,
    #[serde(default)]
    pub dst_proto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsock_port: Option<u32>,
}

impl PortForward {
    /// Forward a host unix socket to a vsock port inside the guest.
    pub fn unix_to_vsock<P: AsRef<Path>>(socket: P, port: u32) -> Self {
        PortForward {
            src_proto: "unix".to_string(),
            src_addr: socket.as_ref().display().to_string(),
            dst_proto: "vsock".to_string(),
            dst_addr: None,
            vsock_port: Some(port),
        }
    }

    /// Canonical `proto://addr->proto://addr` string, used to de-duplicate
    /// rules.
    pub fn rule(&self) -> String {
        let dst = match (&self.vsock_port, &self.dst_addr) {
            (Some(port), _) => port.to_string(),
            (None, Some(addr)) => addr.clone(),
            (None, None) => String::new(),
        };
        format!(
            "{}://{}->{}://{}",
            self.src_proto, self.src_addr, self.dst_proto, dst
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Firmware {
    /// Disable UEFI.
    #[serde(default)]
    pub legacy_bios: bool,
    /// Custom UEFI images.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Audio {
    #[serde(default)]
    pub device: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Video {
    #[serde(default)]
    pub display: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    #[serde(default)]
    pub gui: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_type: Option<VmType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Os>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
    #[serde(default)]
    pub image: ImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    /// Human readable size, e.g. `4GiB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Human readable size of the writable disk, e.g. `60GiB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_forwards: Vec<PortForward>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub audio: Audio,
    #[serde(default)]
    pub video: Video,
}

impl VmSpec {
    pub fn vm_type(&self) -> VmType {
        self.vm_type.unwrap_or_default()
    }

    pub fn os(&self) -> Os {
        self.os.unwrap_or_default()
    }

    pub fn arch(&self) -> Arch {
        self.arch.unwrap_or_else(Arch::native)
    }

    pub fn cpus(&self) -> u32 {
        self.cpus.unwrap_or(1)
    }

    pub fn memory_bytes(&self) -> Result<u64> {
        match &self.memory {
            Some(m) => parse_size(m).with_context(|| format!("parse memory size {m:?}")),
            None => Ok(0),
        }
    }

    pub fn disk_bytes(&self) -> Result<u64> {
        match &self.disk {
            Some(d) => parse_size(d).with_context(|| format!("parse disk size {d:?}")),
            None => Ok(0),
        }
    }

    /// Fill every unset field from the baseline template, generate missing
    /// MAC addresses, and add the guest-agent forward and data mount.
    ///
    /// `guest_socket` is the host-side unix socket the guest agent gets
    /// forwarded to; `data_dir` is the host directory backing
    /// [`DATA_MOUNT_POINT`].
    pub fn set_default(&mut self, defaults: &VmDefaults, guest_socket: &Path, data_dir: &Path) {
        self.vm_type.get_or_insert(defaults.vm_type);
        self.os.get_or_insert(defaults.os);
        self.arch
            .get_or_insert_with(|| defaults.arch.unwrap_or_else(Arch::native));
        self.cpus.get_or_insert(defaults.cpus);
        if self.memory.is_none() {
            self.memory = Some(defaults.memory.clone());
        }
        if self.disk.is_none() {
            self.disk = Some(defaults.disk.clone());
        }
        if self.timezone.is_none() {
            self.timezone = defaults.timezone.clone();
        }
        if self.image.name.is_empty() {
            if let Some(ref image) = defaults.image {
                self.image.name = image.clone();
            }
        }
        if self.guest_version.is_none() {
            self.guest_version = defaults.guest_version.clone();
        }

        if self.networks.is_empty() {
            self.networks.push(Network::default());
        }
        for network in self.networks.iter_mut() {
            if network.mac_address.is_empty() {
                network.mac_address = gen_mac();
            }
        }

        self.set_forward(PortForward::unix_to_vsock(
            guest_socket,
            GUEST_AGENT_VSOCK_PORT,
        ));
        self.set_mount(Mount {
            location: data_dir.display().to_string(),
            mount_point: DATA_MOUNT_POINT.to_string(),
            writable: true,
        });
    }

    /// Check the fields every backend driver relies on.
    pub fn validate(&self) -> Result<()> {
        if self.arch.is_none() {
            bail!("field `arch` must be set");
        }
        if self.image.name.is_empty() {
            bail!("field `image.name` must be set");
        }
        if self.vm_type.is_none() {
            bail!("field `vmType` must be set");
        }
        match self.cpus {
            None => bail!("field `cpus` must be set"),
            Some(0) => bail!("field `cpus` must be greater than zero"),
            Some(_) => (),
        }
        if self.os.is_none() {
            bail!("field `os` must be set");
        }
        self.memory_bytes()?;
        self.disk_bytes()?;

        for (i, mount) in self.mounts.iter().enumerate() {
            if !mount.mount_point.starts_with('/') {
                bail!(
                    "field mounts[{i}] must be absolute, got {:?}",
                    mount.mount_point
                );
            }
        }
        for (i, forward) in self.port_forwards.iter().enumerate() {
            if forward.src_proto.is_empty() || forward.src_addr.is_empty() {
                bail!("field portForwards[{i}] needs a source protocol and address");
            }
            if forward.vsock_port.is_none() && forward.dst_addr.is_none() {
                bail!("field portForwards[{i}] needs either a destination address or a vsock port");
            }
        }
        Ok(())
    }

    /// Insert or replace a forward, keyed by its rule.
    pub fn set_forward(&mut self, forward: PortForward) {
        let rule = forward.rule();
        match self.port_forwards.iter_mut().find(|f| f.rule() == rule) {
            Some(existing) => *existing = forward,
            None => self.port_forwards.push(forward),
        }
    }

    pub fn remove_forward(&mut self, forwards: &[PortForward]) {
        self.port_forwards
            .retain(|f| !forwards.iter().any(|r| r.rule() == f.rule()));
    }

    /// Insert or replace a mount, keyed by its host location.
    pub fn set_mount(&mut self, mount: Mount) {
        match self
            .mounts
            .iter_mut()
            .find(|m| m.location == mount.location)
        {
            Some(existing) => *existing = mount,
            None => self.mounts.push(mount),
        }
    }
}

/// Generate a MAC address from the SHA-256 of a random UUID, prefixed with
/// [`MAC_OUI`].
pub fn gen_mac() -> String {
    let id = uuid::Uuid::new_v4();
    let sha = Sha256::digest(id.to_string().as_bytes());
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        MAC_OUI[0], MAC_OUI[1], MAC_OUI[2], sha[0], sha[1], sha[2]
    )
}

/// Parse a human readable size (`512M`, `4GiB`, `1.5g`) into bytes. All
/// units are binary.
pub fn parse_size(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (num, unit) = trimmed.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| anyhow!("invalid size {s:?}: no leading number"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        "p" | "pb" | "pib" => 1 << 50,
        other => bail!("invalid size {s:?}: unknown unit {other:?}"),
    };

    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn defaults() -> VmDefaults {
        VmDefaults {
            image: Some("ubuntu-24.04".to_string()),
            ..VmDefaults::default()
        }
    }

    #[test]
    fn test_gen_mac_prefix() {
        let mac = gen_mac();
        assert!(mac.starts_with("52:55:55:"), "{mac}");
        assert_eq!(mac.split(':').count(), 6);
        assert_ne!(gen_mac(), gen_mac());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4GiB").unwrap(), 4 << 30);
        assert_eq!(parse_size("4g").unwrap(), 4 << 30);
        assert_eq!(parse_size("1.5G").unwrap(), 3 << 29);
        assert_eq!(parse_size("100m").unwrap(), 100 << 20);
        assert!(parse_size("GiB").is_err());
        assert!(parse_size("4 parsecs").is_err());
    }

    #[test]
    fn test_rule_uses_vsock_port() {
        let f = PortForward::unix_to_vsock("/tmp/vm/vm1.sock", 10443);
        assert_eq!(f.rule(), "unix:///tmp/vm/vm1.sock->vsock://10443");

        let tcp = PortForward {
            src_proto: "tcp".into(),
            src_addr: "127.0.0.1:8080".into(),
            dst_proto: "tcp".into(),
            dst_addr: Some("192.168.64.2:80".into()),
            vsock_port: None,
        };
        assert_eq!(tcp.rule(), "tcp://127.0.0.1:8080->tcp://192.168.64.2:80");
    }

    #[test]
    fn test_set_default_fills_and_validates() {
        let mut spec = VmSpec::default();
        assert!(spec.validate().is_err());

        let sock = PathBuf::from("/home/u/.meridian/vms/vm1/vm1.sock");
        let data = PathBuf::from("/home/u/mdata/vm1");
        spec.set_default(&defaults(), &sock, &data);
        spec.validate().unwrap();

        assert_eq!(spec.networks.len(), 1);
        assert!(spec.networks[0].mac_address.starts_with("52:55:55"));
        assert_eq!(spec.port_forwards.len(), 1);
        assert_eq!(spec.port_forwards[0].vsock_port, Some(GUEST_AGENT_VSOCK_PORT));
        assert_eq!(spec.mounts[0].mount_point, DATA_MOUNT_POINT);

        // A second pass must not duplicate the forward or the mount, nor
        // regenerate MAC addresses:
        let mac = spec.networks[0].mac_address.clone();
        spec.set_default(&defaults(), &sock, &data);
        assert_eq!(spec.port_forwards.len(), 1);
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.networks[0].mac_address, mac);
    }

    #[test]
    fn test_validate_rejects_relative_mount() {
        let mut spec = VmSpec::default();
        spec.set_default(&defaults(), Path::new("/s.sock"), Path::new("/d"));
        spec.mounts.push(Mount {
            location: "/src".into(),
            mount_point: "relative/path".into(),
            writable: false,
        });
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn test_remove_forward() {
        let mut spec = VmSpec::default();
        let a = PortForward::unix_to_vsock("/a.sock", 1);
        let b = PortForward::unix_to_vsock("/b.sock", 2);
        spec.set_forward(a.clone());
        spec.set_forward(b.clone());
        spec.set_forward(a.clone());
        assert_eq!(spec.port_forwards.len(), 2);
        spec.remove_forward(&[a]);
        assert_eq!(spec.port_forwards, vec![b]);
    }
}
