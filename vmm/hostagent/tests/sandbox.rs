use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tower::ServiceExt;

use meridian_rs::api::{routes, ErrorBody, ForwardRequest, GuestHealth, HealthStatus};
use meridian_rs::config::MeridianConfig;
use meridian_rs::machine::Machine;
use meridian_rs::spec::{PortForward, VmSpec, VmType};
use mdn_backend::cidata::guest_binary_path;
use mdn_backend::sshkey::SshKeyMgr;
use mdn_backend::{BaseDriver, Driver, DriverError, ExitReceiver};
use mdn_forward::{BoxStream, Dialer, Endpoint};
use mdn_hostagent::{server, HostAgent};

/// Answers every dial with a canned guest agent response.
struct GuestDialer;

#[async_trait]
impl Dialer for GuestDialer {
    async fn dial(&self, _target: &Endpoint) -> io::Result<BoxStream> {
        let (client, mut guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match guest.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = guest
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 7\r\n\r\nhealthy")
                .await;
        });
        Ok(Box::new(client))
    }
}

struct MockDriver {
    base: BaseDriver,
    exit: Mutex<Option<oneshot::Sender<anyhow::Error>>>,
    stopped: Mutex<bool>,
}

impl MockDriver {
    fn new(root: &Path) -> Arc<MockDriver> {
        let spec = VmSpec {
            vm_type: Some(VmType::Wsl2),
            ..Default::default()
        };
        let base = BaseDriver::new(
            Machine::new("vm1", spec),
            &root.join("vms"),
            &MeridianConfig::default(),
        );
        let spec = base.spec();
        let guest = guest_binary_path(&base.dir, spec.os(), spec.arch());
        std::fs::create_dir_all(guest.parent().unwrap()).unwrap();
        std::fs::write(&guest, b"\x7fELF").unwrap();

        Arc::new(MockDriver {
            base,
            exit: Mutex::new(None),
            stopped: Mutex::new(false),
        })
    }

    fn crash(&self) {
        let tx = self.exit.lock().unwrap().take().unwrap();
        tx.send(anyhow!("vmm crashed")).unwrap();
    }

    fn stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn vm_type(&self) -> VmType {
        VmType::Wsl2
    }

    fn base(&self) -> &BaseDriver {
        &self.base
    }

    async fn validate(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn create_disk(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<ExitReceiver> {
        let (tx, rx) = oneshot::channel();
        *self.exit.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        *self.stopped.lock().unwrap() = true;
        Ok(())
    }

    fn dialer(&self) -> Result<Arc<dyn Dialer>> {
        Ok(Arc::new(GuestDialer))
    }
}

fn agent(root: &Path) -> (Arc<MockDriver>, Arc<HostAgent>) {
    let driver = MockDriver::new(root);
    let keys = SshKeyMgr::new(&root.join("config")).with_user_ssh_dir(None);
    let agent = Arc::new(HostAgent::new(driver.clone(), keys));
    (driver, agent)
}

async fn call(agent: &Arc<HostAgent>, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap();
    let response = server::router(agent.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{path:?} never appeared");
}

#[tokio::test]
async fn healthz_reports_machine() {
    let root = tempfile::tempdir().unwrap();
    let (_driver, agent) = agent(root.path());

    let (status, body) = call(&agent, "GET", routes::HEALTHZ, None).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthStatus = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.name, "vm1");
    assert_eq!(health.vm_type, VmType::Wsl2);
    assert_eq!(health.pid, std::process::id());
    assert!(health.forwards.is_empty());
}

#[tokio::test]
async fn forward_add_and_remove() {
    let root = tempfile::tempdir().unwrap();
    let (_driver, agent) = agent(root.path());

    let req = serde_json::to_string(&ForwardRequest {
        forwards: vec![PortForward::unix_to_vsock(root.path().join("docker.sock"), 2375)],
    })
    .unwrap();

    let (status, body) = call(&agent, "POST", &routes::forward("vm1"), Some(req.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthStatus = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.forwards.len(), 1);
    assert!(root.path().join("docker.sock").exists());

    // Re-adding the same rule replaces it.
    let (status, _) = call(&agent, "POST", &routes::forward("vm1"), Some(req.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agent.forwards().len(), 1);

    let (status, body) = call(&agent, "DELETE", &routes::forward("vm1"), Some(req)).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthStatus = serde_json::from_slice(&body).unwrap();
    assert!(health.forwards.is_empty());
}

#[tokio::test]
async fn forward_rejects_bad_rules_and_other_machines() {
    let root = tempfile::tempdir().unwrap();
    let (_driver, agent) = agent(root.path());

    let good = serde_json::to_string(&ForwardRequest {
        forwards: vec![PortForward::unix_to_vsock(root.path().join("a.sock"), 2375)],
    })
    .unwrap();
    let (status, body) = call(&agent, "POST", &routes::forward("vm2"), Some(good)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let err: ErrorBody = serde_json::from_slice(&body).unwrap();
    assert!(err.error.contains("vm2"));

    let bad = serde_json::to_string(&ForwardRequest {
        forwards: vec![PortForward {
            src_proto: "carrier-pigeon".into(),
            src_addr: "coop".into(),
            dst_proto: "tcp".into(),
            dst_addr: Some("127.0.0.1:1".into()),
            vsock_port: None,
        }],
    })
    .unwrap();
    let (status, _) = call(&agent, "POST", &routes::forward("vm1"), Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(agent.forwards().is_empty());
}

#[tokio::test]
async fn stop_cancels_shutdown_token() {
    let root = tempfile::tempdir().unwrap();
    let (_driver, agent) = agent(root.path());
    let token = agent.shutdown_token();

    let (status, _) = call(&agent, "PUT", &routes::vm_stop("vm2"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!token.is_cancelled());

    let (status, _) = call(&agent, "PUT", &routes::vm_stop("vm1"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(token.is_cancelled());

    let (status, _) = call(&agent, "GET", "/api/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn guest_health_goes_through_dialer() {
    let root = tempfile::tempdir().unwrap();
    let (_driver, agent) = agent(root.path());

    let (status, body) = call(&agent, "GET", routes::GUEST_HEALTH, None).await;
    assert_eq!(status, StatusCode::OK);
    let health: GuestHealth = serde_json::from_slice(&body).unwrap();
    assert!(health.healthy, "{}", health.detail);
    assert_eq!(health.detail, "healthy");
}

#[tokio::test]
async fn run_until_stop_requested() {
    let root = tempfile::tempdir().unwrap();
    let (driver, agent) = agent(root.path());
    let dir = agent.dir().clone();

    let task = tokio::spawn(agent.clone().run());
    wait_for(&dir.sandbox_sock()).await;
    assert!(dir.pid_file().exists());
    assert!(dir.cidata_dir().join("user-data").exists());

    agent.request_stop();
    task.await.unwrap().unwrap();

    assert!(driver.stopped());
    assert!(!dir.pid_file().exists());
    assert!(!dir.sandbox_sock().exists());
}

#[tokio::test]
async fn run_fails_when_machine_exits() {
    let root = tempfile::tempdir().unwrap();
    let (driver, agent) = agent(root.path());
    let dir = agent.dir().clone();

    let task = tokio::spawn(agent.clone().run());
    wait_for(&dir.sandbox_sock()).await;

    driver.crash();
    let err = task.await.unwrap().unwrap_err();
    assert!(format!("{err:#}").contains("vmm crashed"));
    assert!(driver.stopped());
    assert!(!dir.pid_file().exists());
}
