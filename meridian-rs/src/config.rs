use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::image::{GuestBinary, ImageSource};
use crate::spec::{Arch, Os, VmType};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MeridianConfig {
    pub daemon: DaemonConfig,
    pub timeouts: Timeouts,
    pub health: HealthConfig,
    pub defaults: VmDefaults,
    pub backend: BackendConfig,
    pub images: HashMap<String, ImageSource>,
    pub guest_binaries: Vec<GuestBinary>,
}

impl MeridianConfig {
    pub fn guest_binary(&self, os: Os, arch: Arch) -> Option<&GuestBinary> {
        self.guest_binaries
            .iter()
            .find(|b| b.os == os && b.arch == arch)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root of all persisted state (`vms/`, `images/`, `config/`).
    pub root_dir: PathBuf,

    /// Unix socket the daemon API listens on. Defaults to
    /// `<root_dir>/meridiand.sock`.
    pub api_socket: Option<PathBuf>,

    /// Host agent binary. Defaults to `meridian-vm` next to the running
    /// executable.
    pub host_agent_binary: Option<PathBuf>,

    /// Host directory holding every machine's data mount.
    pub data_root: PathBuf,

    /// Size of the self-heal worker pool.
    pub workers: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        DaemonConfig {
            root_dir: home.join(".meridian"),
            api_socket: None,
            host_agent_binary: None,
            data_root: home.join("mdata"),
            workers: 10,
        }
    }
}

impl DaemonConfig {
    pub fn vms_dir(&self) -> PathBuf {
        self.root_dir.join("vms")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root_dir.join("images")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root_dir.join("config")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join("cache")
    }

    pub fn api_socket(&self) -> PathBuf {
        self.api_socket
            .clone()
            .unwrap_or_else(|| self.root_dir.join("meridiand.sock"))
    }

    pub fn host_agent_binary(&self) -> PathBuf {
        if let Some(ref bin) = self.host_agent_binary {
            return bin.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("meridian-vm")))
            .unwrap_or_else(|| PathBuf::from("meridian-vm"))
    }
}

/// Tools the backend drivers shell out to.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    /// `vfkit` binary. Looked up in `PATH` and the Homebrew prefixes when
    /// unset.
    pub vfkit_binary: Option<PathBuf>,

    /// Defaults to `qemu-system-<arch>`.
    pub qemu_binary: Option<PathBuf>,

    pub qemu_img_binary: PathBuf,

    /// Additional QEMU arguments. These support the same template strings
    /// as the built-in arguments, e.g. `{name}` or `{diff_disk}`.
    pub qemu_args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            vfkit_binary: None,
            qemu_binary: None,
            qemu_img_binary: PathBuf::from("qemu-img"),
            qemu_args: Vec::new(),
        }
    }
}

/// Bounds on every wait in the machine lifecycle.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub start_health_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub start_health_timeout: Duration,
    /// How long `Stop` waits for an in-progress start to quiesce.
    #[serde(with = "humantime_serde")]
    pub stop_wait_starting: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_pid_wait: Duration,
    /// Hard deadline on the sandbox stop round-trip.
    #[serde(with = "humantime_serde")]
    pub stop_control: Duration,
    #[serde(with = "humantime_serde")]
    pub driver_stop: Duration,
    /// Bound on any single call over a machine's sandbox socket.
    #[serde(with = "humantime_serde")]
    pub sandbox_request: Duration,
    #[serde(with = "humantime_serde")]
    pub forward_retry: Duration,
    #[serde(with = "humantime_serde")]
    pub reinit_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub task_terminate_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            start_health_interval: Duration::from_secs(3),
            start_health_timeout: Duration::from_secs(120),
            stop_wait_starting: Duration::from_secs(300),
            stop_pid_wait: Duration::from_secs(180),
            stop_control: Duration::from_secs(30),
            driver_stop: Duration::from_secs(60),
            sandbox_request: Duration::from_secs(10),
            forward_retry: Duration::from_secs(15),
            reinit_interval: Duration::from_secs(10),
            task_terminate_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// A health check that takes longer than this counts as a failure.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive failures before a machine gets re-enqueued.
    pub failure_threshold: u32,
    /// Quiet period after a self-heal fired for a machine.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            failure_threshold: 6,
            backoff: Duration::from_secs(300),
        }
    }
}

/// Baseline template applied to every new machine spec.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VmDefaults {
    pub vm_type: VmType,
    pub os: Os,
    /// Defaults to the host architecture.
    pub arch: Option<Arch>,
    pub cpus: u32,
    pub memory: String,
    pub disk: String,
    pub timezone: Option<String>,
    pub image: Option<String>,
    pub guest_version: Option<String>,
}

impl Default for VmDefaults {
    fn default() -> Self {
        let vm_type = if cfg!(target_os = "macos") {
            VmType::Vz
        } else if cfg!(target_os = "windows") {
            VmType::Wsl2
        } else {
            VmType::Qemu
        };
        VmDefaults {
            vm_type,
            os: Os::Linux,
            arch: None,
            cpus: 2,
            memory: "4GiB".to_string(),
            disk: "60GiB".to_string(),
            timezone: None,
            image: None,
            guest_version: None,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<MeridianConfig, figment::Error> {
    let mut figment = Figment::new();

    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }

    figment
        .merge(Toml::file("meridian.toml"))
        .merge(Env::prefixed("MERIDIAN_").split("__"))
        .extract()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
root_dir = "/var/lib/meridian"
workers = 4

[timeouts]
start_health_timeout = "30s"
sandbox_request = "4s"

[health]
failure_threshold = 3

[backend]
qemu_args = ["-device", "virtio-balloon"]

[defaults]
cpus = 8
image = "ubuntu-24.04"

[images."ubuntu-24.04"]
os = "Linux"
arch = "aarch64"
location = "https://cloud-images.ubuntu.com/noble.img"
digest = "sha256:00"

[[guest_binaries]]
version = "v0.1.0"
os = "Linux"
arch = "aarch64"
location = "https://example.com/meridian-guest"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.daemon.root_dir, PathBuf::from("/var/lib/meridian"));
        assert_eq!(
            config.daemon.api_socket(),
            PathBuf::from("/var/lib/meridian/meridiand.sock")
        );
        assert_eq!(config.daemon.workers, 4);
        assert_eq!(config.timeouts.start_health_timeout, Duration::from_secs(30));
        assert_eq!(config.timeouts.sandbox_request, Duration::from_secs(4));
        // Untouched keys keep their defaults:
        assert_eq!(config.timeouts.stop_control, Duration::from_secs(30));
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.timeout, Duration::from_secs(3));
        assert_eq!(config.defaults.cpus, 8);
        assert_eq!(config.backend.qemu_img_binary, PathBuf::from("qemu-img"));
        assert_eq!(config.backend.qemu_args.len(), 2);
        assert_eq!(config.images["ubuntu-24.04"].arch, Arch::Aarch64);
        assert!(config.guest_binary(Os::Linux, Arch::Aarch64).is_some());
        assert!(config.guest_binary(Os::Linux, Arch::X86_64).is_none());
    }
}
