//! Boot data disk generation.
//!
//! Every boot renders a fresh set of cloud-init style files (SSH keys,
//! per-NIC network config, mounts, timezone, environment) plus the embedded
//! guest agent binary, and writes them as one of:
//!
//! - an ISO9660 volume labeled `cidata` (the default),
//! - a plain directory (WSL2, which reads it through the shared filesystem),
//! - an APFS disk image populated via `hdiutil` attach/copy/detach (macOS
//!   guests).
//!
//! The instance id changes on every render so the guest re-processes its
//! network config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::{event, instrument, Level};

use meridian_rs::api::GUEST_AGENT_VSOCK_PORT;
use meridian_rs::image::{guest_binary_file_name, GuestBinary};
use meridian_rs::machine::{Machine, MachineDir};
use meridian_rs::spec::{Arch, Os, VmSpec, VmType};
use mdn_downloader::{Digest, Options};

use crate::process::{find_binary, run_tool};
use crate::sshkey::SshKeyMgr;
use crate::BaseDriver;

pub const VOLUME_LABEL: &str = "cidata";
pub const GUEST_BINARY_ENTRY: &str = "md-guest";
const DMG_VOLUME_NAME: &str = "Preboot";
const DMG_SIZE: &str = "100m";
const GUEST_UID: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDiskFormat {
    Iso,
    Dir,
    Dmg,
}

impl BootDiskFormat {
    pub fn for_spec(spec: &VmSpec) -> Self {
        match (spec.vm_type(), spec.os()) {
            (VmType::Wsl2, _) => BootDiskFormat::Dir,
            (_, Os::Darwin) => BootDiskFormat::Dmg,
            _ => BootDiskFormat::Iso,
        }
    }

    /// Where the guest agent binary goes inside the boot data.
    fn guest_binary_entry(&self) -> &'static str {
        match self {
            BootDiskFormat::Dmg => "usr/local/bin/md-guest",
            BootDiskFormat::Iso | BootDiskFormat::Dir => GUEST_BINARY_ENTRY,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EntrySource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// One file of the boot data, at a relative path.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: String,
    pub source: EntrySource,
}

impl Entry {
    pub fn bytes(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Entry {
            path: path.into(),
            source: EntrySource::Bytes(data.into()),
        }
    }

    pub fn file(path: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Entry {
            path: path.into(),
            source: EntrySource::File(file.into()),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub home: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NetworkArgs {
    pub interface: String,
    pub mac_address: String,
    pub address: String,
    pub gateway: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub tag: String,
    pub mount_point: String,
    pub fs_type: String,
    pub writable: bool,
}

/// Everything the rendered boot files are derived from.
#[derive(Serialize, Debug, Clone)]
pub struct TemplateArgs {
    pub name: String,
    pub iid: String,
    pub user: User,
    pub ssh_pub_keys: Vec<String>,
    pub mounts: Vec<MountArgs>,
    pub networks: Vec<NetworkArgs>,
    pub env: BTreeMap<String, String>,
    pub timezone: Option<String>,
    pub vm_type: VmType,
    pub vsock_port: u32,
}

impl TemplateArgs {
    pub fn new(machine: &Machine, ssh_pub_keys: Vec<String>) -> Self {
        let spec = &machine.spec;
        let mount_type = match spec.vm_type() {
            VmType::Qemu => "9p",
            VmType::Vz | VmType::Wsl2 => "virtiofs",
        };

        TemplateArgs {
            name: machine.name.clone(),
            iid: format!("iid-{}", chrono::Utc::now().timestamp()),
            user: User {
                name: machine.name.clone(),
                uid: GUEST_UID,
                home: format!("/home/{}", machine.name),
            },
            ssh_pub_keys,
            mounts: spec
                .mounts
                .iter()
                .enumerate()
                .map(|(i, m)| MountArgs {
                    tag: format!("mount{i}"),
                    mount_point: m.mount_point.clone(),
                    fs_type: mount_type.to_string(),
                    writable: m.writable,
                })
                .collect(),
            networks: spec
                .networks
                .iter()
                .enumerate()
                .map(|(i, n)| NetworkArgs {
                    interface: format!("eth{i}"),
                    mac_address: n.mac_address.clone(),
                    address: n.address.clone(),
                    gateway: n.ip_gateway.clone(),
                })
                .collect(),
            env: spec.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            timezone: spec.timezone.clone(),
            vm_type: spec.vm_type(),
            vsock_port: GUEST_AGENT_VSOCK_PORT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.name == "root" {
            bail!("field User must not be \"root\"");
        }
        if self.user.uid == 0 {
            bail!("field UID must not be 0");
        }
        if self.user.home.is_empty() {
            bail!("field Home must be set");
        }
        if self.ssh_pub_keys.is_empty() {
            bail!("field SSHPubKeys must be set");
        }
        for (i, m) in self.mounts.iter().enumerate() {
            if !m.mount_point.starts_with('/') {
                bail!("field mounts[{i}] must be absolute, got {:?}", m.mount_point);
            }
        }
        Ok(())
    }

    /// Validate, then render `meta-data`, `user-data` and `network-config`.
    pub fn render(&self) -> Result<Vec<Entry>> {
        self.validate()?;
        Ok(vec![
            Entry::bytes("meta-data", self.meta_data()?),
            Entry::bytes("user-data", self.user_data()?),
            Entry::bytes("network-config", self.network_config()?),
        ])
    }

    fn meta_data(&self) -> Result<String> {
        #[derive(Serialize)]
        #[serde(rename_all = "kebab-case")]
        struct MetaData<'a> {
            instance_id: &'a str,
            local_hostname: &'a str,
        }

        Ok(serde_yaml::to_string(&MetaData {
            instance_id: &self.iid,
            local_hostname: &self.name,
        })?)
    }

    fn user_data(&self) -> Result<String> {
        #[derive(Serialize)]
        struct CloudUser<'a> {
            name: &'a str,
            uid: u32,
            homedir: &'a str,
            shell: &'static str,
            sudo: &'static str,
            lock_passwd: bool,
            ssh_authorized_keys: &'a [String],
        }

        #[derive(Serialize)]
        struct WriteFile {
            path: &'static str,
            permissions: &'static str,
            content: String,
        }

        #[derive(Serialize)]
        struct UserData<'a> {
            users: Vec<CloudUser<'a>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            timezone: Option<&'a str>,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            mounts: Vec<[String; 4]>,
            write_files: Vec<WriteFile>,
            runcmd: Vec<String>,
        }

        let env: String = self
            .env
            .iter()
            .map(|(k, v)| format!("export {k}={v:?}\n"))
            .collect();

        let user_data = UserData {
            users: vec![CloudUser {
                name: &self.user.name,
                uid: self.user.uid,
                homedir: &self.user.home,
                shell: "/bin/bash",
                sudo: "ALL=(ALL) NOPASSWD:ALL",
                lock_passwd: true,
                ssh_authorized_keys: &self.ssh_pub_keys,
            }],
            timezone: self.timezone.as_deref(),
            mounts: self
                .mounts
                .iter()
                .map(|m| {
                    let mode = if m.writable { "rw" } else { "ro" };
                    let options = match m.fs_type.as_str() {
                        "9p" => format!("{mode},trans=virtio,version=9p2000.L,nofail"),
                        _ => format!("{mode},nofail"),
                    };
                    [m.tag.clone(), m.mount_point.clone(), m.fs_type.clone(), options]
                })
                .collect(),
            write_files: vec![
                WriteFile {
                    path: "/etc/profile.d/meridian.sh",
                    permissions: "0644",
                    content: env,
                },
                WriteFile {
                    path: "/etc/meridian/guest.env",
                    permissions: "0644",
                    content: format!(
                        "MERIDIAN_NAME={}\nMERIDIAN_VSOCK_PORT={}\n",
                        self.name, self.vsock_port
                    ),
                },
            ],
            runcmd: vec![
                format!(
                    "mkdir -p /mnt/{VOLUME_LABEL} && (mountpoint -q /mnt/{VOLUME_LABEL} || mount -o ro LABEL={VOLUME_LABEL} /mnt/{VOLUME_LABEL})"
                ),
                format!("install -m 0755 /mnt/{VOLUME_LABEL}/{GUEST_BINARY_ENTRY} /usr/local/bin/{GUEST_BINARY_ENTRY}"),
                format!("/usr/local/bin/{GUEST_BINARY_ENTRY} install --vsock-port {}", self.vsock_port),
            ],
        };

        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&user_data)?))
    }

    fn network_config(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Match<'a> {
            macaddress: &'a str,
        }

        #[derive(Serialize)]
        struct Route<'a> {
            to: &'static str,
            via: &'a str,
        }

        #[derive(Serialize)]
        struct Nameservers<'a> {
            addresses: Vec<&'a str>,
        }

        #[derive(Serialize)]
        struct Ethernet<'a> {
            #[serde(rename = "match")]
            matches: Match<'a>,
            #[serde(rename = "set-name")]
            set_name: &'a str,
            dhcp4: bool,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            addresses: Vec<&'a str>,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            routes: Vec<Route<'a>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            nameservers: Option<Nameservers<'a>>,
        }

        #[derive(Serialize)]
        struct NetworkConfig<'a> {
            version: u8,
            ethernets: BTreeMap<&'a str, Ethernet<'a>>,
        }

        let ethernets = self
            .networks
            .iter()
            .map(|n| {
                let static_addr = !n.address.is_empty();
                let has_gateway = !n.gateway.is_empty();
                let eth = Ethernet {
                    matches: Match {
                        macaddress: &n.mac_address,
                    },
                    set_name: &n.interface,
                    dhcp4: !static_addr,
                    addresses: if static_addr { vec![&n.address] } else { vec![] },
                    routes: if has_gateway {
                        vec![Route {
                            to: "default",
                            via: &n.gateway,
                        }]
                    } else {
                        vec![]
                    },
                    nameservers: has_gateway.then(|| Nameservers {
                        addresses: vec![&n.gateway],
                    }),
                };
                (n.interface.as_str(), eth)
            })
            .collect();

        Ok(serde_yaml::to_string(&NetworkConfig {
            version: 2,
            ethernets,
        })?)
    }
}

pub fn guest_binary_path(dir: &MachineDir, os: Os, arch: Arch) -> PathBuf {
    dir.bin_dir().join(guest_binary_file_name(os, arch))
}

/// Fetch the guest agent binary for the machine's OS and architecture into
/// its `bin/` directory.
#[instrument(skip(dir, binary, cache_dir), err(Debug, level = Level::WARN))]
pub async fn ensure_guest_binary(
    dir: &MachineDir,
    binary: Option<&GuestBinary>,
    os: Os,
    arch: Arch,
    cache_dir: Option<&Path>,
) -> Result<PathBuf> {
    let path = guest_binary_path(dir, os, arch);
    if tokio::fs::try_exists(&path).await? {
        return Ok(path);
    }

    let binary =
        binary.ok_or_else(|| anyhow!("unsupported arch: no guest binary for {os}/{arch}"))?;
    let expected: Option<Digest> = binary
        .digest
        .as_deref()
        .map(str::parse::<Digest>)
        .transpose()
        .context("invalid guest binary digest")?;

    let mut opts = Options::default()
        .with_description(format!("guest agent {} ({os}/{arch})", binary.version))
        .with_expected_digest(expected);
    if let Some(cache) = cache_dir {
        opts = opts.with_cache_dir(cache);
    }

    mdn_downloader::download(Some(path.as_path()), &binary.location, &opts)
        .await
        .with_context(|| format!("failed to download guest binary {:?}", binary.location))?;

    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(path)
}

/// Render and write the boot data for `base`'s machine. Returns the path of
/// the written ISO, directory, or disk image.
#[instrument(skip(base, keys), fields(machine = %base.machine.name), err(Debug, level = Level::WARN))]
pub async fn create_boot_disk(base: &BaseDriver, keys: &SshKeyMgr) -> Result<PathBuf> {
    let spec = base.spec();
    let pub_keys = keys
        .load_pub_keys()
        .await
        .context("load public key for vm")?;
    let args = TemplateArgs::new(&base.machine, pub_keys);
    let mut layout = args.render().context("build init disk template")?;

    let format = BootDiskFormat::for_spec(spec);
    let guest = guest_binary_path(&base.dir, spec.os(), spec.arch());
    if !tokio::fs::try_exists(&guest).await? {
        bail!(
            "unsupported arch: no guest binary for {}/{} at {guest:?}",
            spec.os(),
            spec.arch()
        );
    }
    layout.push(Entry::file(format.guest_binary_entry(), guest));

    tokio::fs::create_dir_all(base.dir.path()).await?;
    match format {
        BootDiskFormat::Iso => {
            let iso = base.dir.cidata_iso();
            event!(Level::INFO, path = ?iso, "write iso file");
            write_iso(&iso, VOLUME_LABEL, &layout).await?;
            Ok(iso)
        }
        BootDiskFormat::Dir => {
            layout.push(Entry::bytes(
                "ssh_authorized_keys",
                args.ssh_pub_keys.join("\n"),
            ));
            let dir = base.dir.cidata_dir();
            write_dir(&dir, &layout).await?;
            Ok(dir)
        }
        BootDiskFormat::Dmg => {
            let dmg = base.dir.cidata_dmg();
            event!(Level::INFO, path = ?dmg, "make boot disk file");
            write_dmg(&dmg, &layout).await?;
            Ok(dmg)
        }
    }
}

/// Write `layout` below `root` without clearing it first.
async fn write_content(root: &Path, layout: &[Entry]) -> Result<()> {
    for entry in layout {
        let target = root.join(&entry.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("mkdir {parent:?}"))?;
        }
        let written = match entry.source {
            EntrySource::Bytes(ref data) => tokio::fs::write(&target, data).await,
            EntrySource::File(ref file) => tokio::fs::copy(file, &target).await.map(|_| ()),
        };
        written.with_context(|| format!("write boot data entry {target:?}"))?;
        event!(Level::TRACE, path = %entry.path, "wrote boot data entry");
    }
    Ok(())
}

/// Replace `root` with a directory holding `layout`.
pub async fn write_dir(root: &Path, layout: &[Entry]) -> Result<()> {
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => return Err(e).with_context(|| format!("clean {root:?}")),
    }
    let mut sorted: Vec<&Entry> = layout.iter().collect();
    sorted.sort_by_key(|e| e.path.to_lowercase());
    tokio::fs::create_dir_all(root).await?;
    for entry in sorted {
        write_content(root, std::slice::from_ref(entry)).await?;
    }
    Ok(())
}

fn iso_command(iso: &Path, label: &str, staging: &Path) -> Result<tokio::process::Command> {
    if cfg!(target_os = "macos") {
        let mut cmd = tokio::process::Command::new("hdiutil");
        cmd.args(["makehybrid", "-iso", "-joliet", "-default-volume-name", label, "-o"])
            .arg(iso)
            .arg(staging);
        return Ok(cmd);
    }

    for tool in ["xorriso", "genisoimage", "mkisofs"] {
        if let Some(bin) = find_binary(tool, &[]) {
            let mut cmd = tokio::process::Command::new(bin);
            if tool == "xorriso" {
                cmd.args(["-as", "mkisofs"]);
            }
            cmd.args(["-V", label, "-J", "-R", "-o"])
                .arg(iso)
                .arg(staging);
            return Ok(cmd);
        }
    }
    bail!("no ISO9660 creation tool found (tried xorriso, genisoimage, mkisofs)")
}

/// Write `layout` as an ISO9660 volume with the given label.
pub async fn write_iso(iso: &Path, label: &str, layout: &[Entry]) -> Result<()> {
    let staging = iso.with_extension("staging");
    write_dir(&staging, layout).await?;

    match tokio::fs::remove_file(iso).await {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => return Err(e).with_context(|| format!("remove old {iso:?}")),
    }

    let res = match iso_command(iso, label, &staging) {
        Ok(mut cmd) => run_tool(&mut cmd).await.map(|_| ()),
        Err(e) => Err(e),
    };
    let _ = tokio::fs::remove_dir_all(&staging).await;
    res.with_context(|| format!("create iso {iso:?}"))
}

/// Create (once) an APFS disk image at `dmg`, attach it, copy `layout` in,
/// and detach it again.
pub async fn write_dmg(dmg: &Path, layout: &[Entry]) -> Result<()> {
    if !tokio::fs::try_exists(dmg).await? {
        run_tool(
            tokio::process::Command::new("hdiutil")
                .args(["create", "-size", DMG_SIZE, "-layout", "GPTSPUD", "-fs", "APFS"])
                .args(["-volname", DMG_VOLUME_NAME])
                .arg(dmg),
        )
        .await
        .context("create empty boot disk")?;
    }

    let mount_point = dmg.with_extension("mnt");
    tokio::fs::create_dir_all(&mount_point).await?;
    run_tool(
        tokio::process::Command::new("hdiutil")
            .arg("attach")
            .arg(dmg)
            .arg("-nobrowse")
            .arg("-mountpoint")
            .arg(&mount_point),
    )
    .await
    .context("attach boot disk")?;

    let res = write_content(&mount_point, layout).await;

    let detached = run_tool(
        tokio::process::Command::new("hdiutil")
            .arg("detach")
            .arg(&mount_point),
    )
    .await;
    if let Err(ref e) = detached {
        event!(Level::ERROR, ?mount_point, "detach boot disk: {e:#}");
    }
    res.and(detached.map(|_| ()))
}

#[cfg(test)]
mod test {
    use super::*;
    use meridian_rs::config::MeridianConfig;
    use meridian_rs::spec::{Mount, Network};

    fn machine(vm_type: VmType) -> Machine {
        let spec = VmSpec {
            vm_type: Some(vm_type),
            os: Some(Os::Linux),
            arch: Some(Arch::Aarch64),
            timezone: Some("Europe/Berlin".to_string()),
            mounts: vec![Mount {
                location: "/Users/me/mdata/vm1".to_string(),
                mount_point: "/mnt/disk0".to_string(),
                writable: true,
            }],
            networks: vec![Network {
                mac_address: "52:55:55:aa:bb:cc".to_string(),
                address: "192.168.64.2/24".to_string(),
                ip_gateway: "192.168.64.1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Machine::new("vm1", spec)
    }

    #[test]
    fn test_render() {
        let args = TemplateArgs::new(&machine(VmType::Vz), vec!["ssh-ed25519 AAAA".to_string()]);
        let layout = args.render().unwrap();
        let files: BTreeMap<&str, String> = layout
            .iter()
            .map(|e| match e.source {
                EntrySource::Bytes(ref b) => (e.path.as_str(), String::from_utf8(b.clone()).unwrap()),
                EntrySource::File(_) => unreachable!(),
            })
            .collect();

        assert!(files["meta-data"].contains("instance-id: iid-"));
        assert!(files["meta-data"].contains("local-hostname: vm1"));

        let user_data = &files["user-data"];
        assert!(user_data.starts_with("#cloud-config\n"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(user_data).unwrap();
        assert_eq!(parsed["users"][0]["name"].as_str(), Some("vm1"));
        assert_eq!(
            parsed["users"][0]["ssh_authorized_keys"][0].as_str(),
            Some("ssh-ed25519 AAAA")
        );
        assert_eq!(parsed["timezone"].as_str(), Some("Europe/Berlin"));
        assert_eq!(parsed["mounts"][0][2].as_str(), Some("virtiofs"));

        let net: serde_yaml::Value = serde_yaml::from_str(&files["network-config"]).unwrap();
        let eth0 = &net["ethernets"]["eth0"];
        assert_eq!(eth0["match"]["macaddress"].as_str(), Some("52:55:55:aa:bb:cc"));
        assert_eq!(eth0["addresses"][0].as_str(), Some("192.168.64.2/24"));
        assert_eq!(eth0["routes"][0]["via"].as_str(), Some("192.168.64.1"));
        assert_eq!(eth0["dhcp4"].as_bool(), Some(false));
    }

    #[test]
    fn test_validate() {
        let mut args = TemplateArgs::new(&machine(VmType::Vz), vec![]);
        assert!(args.validate().unwrap_err().to_string().contains("SSHPubKeys"));

        args.ssh_pub_keys.push("ssh-ed25519 AAAA".to_string());
        args.validate().unwrap();

        args.mounts[0].mount_point = "relative".to_string();
        assert!(args.validate().is_err());

        args.mounts.clear();
        args.user.name = "root".to_string();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_format_selection() {
        assert_eq!(
            BootDiskFormat::for_spec(&machine(VmType::Vz).spec),
            BootDiskFormat::Iso
        );
        assert_eq!(
            BootDiskFormat::for_spec(&machine(VmType::Wsl2).spec),
            BootDiskFormat::Dir
        );
        let mut darwin = machine(VmType::Vz);
        darwin.spec.os = Some(Os::Darwin);
        assert_eq!(BootDiskFormat::for_spec(&darwin.spec), BootDiskFormat::Dmg);
    }

    #[tokio::test]
    async fn test_create_boot_dir() {
        let root = tempfile::tempdir().unwrap();
        let base = BaseDriver::new(
            machine(VmType::Wsl2),
            &root.path().join("vms"),
            &MeridianConfig::default(),
        );
        let keys = SshKeyMgr::new(&root.path().join("config")).with_user_ssh_dir(None);

        // No guest binary downloaded yet:
        let err = create_boot_disk(&base, &keys).await.unwrap_err();
        assert!(format!("{err:#}").contains("unsupported arch"));

        let guest = guest_binary_path(&base.dir, Os::Linux, Arch::Aarch64);
        std::fs::create_dir_all(guest.parent().unwrap()).unwrap();
        std::fs::write(&guest, b"\x7fELF").unwrap();

        let out = create_boot_disk(&base, &keys).await.unwrap();
        assert_eq!(out, base.dir.cidata_dir());
        assert_eq!(std::fs::read(out.join(GUEST_BINARY_ENTRY)).unwrap(), b"\x7fELF");
        assert!(out.join("user-data").exists());
        let authorized = std::fs::read_to_string(out.join("ssh_authorized_keys")).unwrap();
        assert!(authorized.starts_with("ssh-ed25519 "));
    }

    #[tokio::test]
    async fn test_guest_binary_requires_catalog_entry() {
        let root = tempfile::tempdir().unwrap();
        let dir = MachineDir::new(root.path(), "vm1");
        let err = ensure_guest_binary(&dir, None, Os::Linux, Arch::Riscv64, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported arch"));
    }
}
