//! Client side of the per-machine sandbox control socket.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixStream;
use tracing::{event, Level};

use meridian_rs::api::{routes, ErrorBody, ForwardRequest, GuestHealth, HealthStatus, MAX_ERROR_BODY};
use meridian_rs::machine::MachineDir;
use meridian_rs::spec::PortForward;

/// Commands the daemon sends to a machine's host agent.
#[async_trait]
pub trait SandboxControl: Send + Sync {
    async fn healthz(&self, dir: &MachineDir) -> Result<HealthStatus>;

    async fn forward(&self, dir: &MachineDir, forwards: &[PortForward]) -> Result<HealthStatus>;

    async fn unforward(&self, dir: &MachineDir, forwards: &[PortForward]) -> Result<HealthStatus>;

    /// Ask the host agent to stop the machine. Returns once the request was
    /// accepted, not once the machine is down.
    async fn stop(&self, dir: &MachineDir) -> Result<()>;

    async fn guest_health(&self, dir: &MachineDir) -> Result<GuestHealth>;
}

/// Talks HTTP/1.1 over `<machine dir>/sandbox.sock`. Every call, from
/// connect to the last body byte, is bounded by `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct UnixSandbox {
    timeout: Duration,
}

impl UnixSandbox {
    pub fn new(timeout: Duration) -> Self {
        UnixSandbox { timeout }
    }

    async fn request(
        &self,
        sock: &Path,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes> {
        match tokio::time::timeout(self.timeout, request(sock, method.clone(), path, body)).await {
            Ok(res) => res,
            Err(_) => bail!("{method} {path}: no answer from sandbox {sock:?} after {:?}", self.timeout),
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        sock: &Path,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T> {
        let body = body.map(serde_json::to_vec).transpose()?;
        let bytes = self.request(sock, method, path, body).await?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse response of {path}"))
    }
}

impl Default for UnixSandbox {
    fn default() -> Self {
        UnixSandbox::new(Duration::from_secs(10))
    }
}

async fn request(sock: &Path, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
    let stream = UnixStream::connect(sock)
        .await
        .with_context(|| format!("connect to sandbox {sock:?}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("sandbox HTTP handshake")?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            event!(Level::DEBUG, ?e, "sandbox connection closed");
        }
    });

    let mut builder = Request::builder()
        .method(method.clone())
        .uri(format!("http://sandbox{path}"))
        .header("host", "sandbox");
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let request = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

    let response = sender
        .send_request(request)
        .await
        .with_context(|| format!("{method} {path}"))?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();

    if !status.is_success() {
        let capped = &bytes[..bytes.len().min(MAX_ERROR_BODY)];
        let message = serde_json::from_slice::<ErrorBody>(capped)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(capped).into_owned());
        bail!("{method} {path}: HTTP {status}: {message}");
    }
    Ok(bytes)
}

#[async_trait]
impl SandboxControl for UnixSandbox {
    async fn healthz(&self, dir: &MachineDir) -> Result<HealthStatus> {
        self.request_json(&dir.sandbox_sock(), Method::GET, routes::HEALTHZ, None::<&()>).await
    }

    async fn forward(&self, dir: &MachineDir, forwards: &[PortForward]) -> Result<HealthStatus> {
        let body = ForwardRequest {
            forwards: forwards.to_vec(),
        };
        self.request_json(
            &dir.sandbox_sock(),
            Method::POST,
            &routes::forward(dir.name()),
            Some(&body),
        )
        .await
    }

    async fn unforward(&self, dir: &MachineDir, forwards: &[PortForward]) -> Result<HealthStatus> {
        let body = ForwardRequest {
            forwards: forwards.to_vec(),
        };
        self.request_json(
            &dir.sandbox_sock(),
            Method::DELETE,
            &routes::forward(dir.name()),
            Some(&body),
        )
        .await
    }

    async fn stop(&self, dir: &MachineDir) -> Result<()> {
        self.request(&dir.sandbox_sock(), Method::PUT, &routes::vm_stop(dir.name()), None).await?;
        Ok(())
    }

    async fn guest_health(&self, dir: &MachineDir) -> Result<GuestHealth> {
        self.request_json(
            &dir.sandbox_sock(),
            Method::GET,
            routes::GUEST_HEALTH,
            None::<&()>,
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Accept one connection and answer it with `response`, returning the
    /// raw request head.
    async fn serve_once(listener: UnixListener, response: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
        }
        stream.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    }

    #[tokio::test]
    async fn test_healthz_and_errors() {
        let root = tempfile::tempdir().unwrap();
        let dir = MachineDir::new(root.path(), "vm1");
        std::fs::create_dir_all(dir.path()).unwrap();

        let listener = UnixListener::bind(dir.sandbox_sock()).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 200 OK\r\ncontent-length: 63\r\n\r\n\
             {\"name\":\"vm1\",\"pid\":42,\"vmType\":\"qemu\",\"forwards\":[\"unix://x\"]}",
        ));
        let health = UnixSandbox::default().healthz(&dir).await.unwrap();
        assert!(server.await.unwrap().starts_with("GET /healthz HTTP/1.1"));
        assert_eq!(health.pid, 42);
        assert_eq!(health.forwards, vec!["unix://x"]);

        std::fs::remove_file(dir.sandbox_sock()).unwrap();
        let listener = UnixListener::bind(dir.sandbox_sock()).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 404 Not Found\r\ncontent-length: 19\r\n\r\n{\"error\":\"no such\"}",
        ));
        let err = UnixSandbox::default().stop(&dir).await.unwrap_err();
        assert!(server.await.unwrap().starts_with("PUT /api/v1/vm/stop/vm1"));
        let err = err.to_string();
        assert!(err.contains("404"), "{err}");
        assert!(err.contains("no such"), "{err}");
    }

    #[tokio::test]
    async fn test_no_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let dir = MachineDir::new(root.path(), "vm1");
        let err = UnixSandbox::default().guest_health(&dir).await.unwrap_err();
        assert!(format!("{err:#}").contains("connect to sandbox"));
    }

    #[tokio::test]
    async fn test_silent_sandbox_times_out() {
        let root = tempfile::tempdir().unwrap();
        let dir = MachineDir::new(root.path(), "vm1");
        std::fs::create_dir_all(dir.path()).unwrap();

        // Accepts the connection but never answers.
        let listener = UnixListener::bind(dir.sandbox_sock()).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(stream);
        });

        let sandbox = UnixSandbox::new(Duration::from_millis(200));
        let err = tokio::time::timeout(Duration::from_secs(5), sandbox.healthz(&dir))
            .await
            .expect("request is bounded")
            .unwrap_err();
        assert!(err.to_string().contains("no answer from sandbox"), "{err}");
        server.abort();
    }
}
