use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use meridian_rs::api::{GuestHealth, HealthStatus, MAX_ERROR_BODY};
use meridian_rs::machine::{remove_pid, save_pid, MachineDir, PID_REFRESH_INTERVAL};
use meridian_rs::spec::PortForward;
use mdn_backend::cidata;
use mdn_backend::sshkey::SshKeyMgr;
use mdn_backend::Driver;
use mdn_forward::{ForwardMgr, Rule};

/// Bound on dialing the guest agent and getting its answer.
const GUEST_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one machine: boots it through its driver, applies port forwards,
/// serves the sandbox control socket and keeps the PID file fresh.
pub struct HostAgent {
    driver: Arc<dyn Driver>,
    keys: SshKeyMgr,
    forwards: ForwardMgr,
    shutdown: CancellationToken,
}

impl HostAgent {
    pub fn new(driver: Arc<dyn Driver>, keys: SshKeyMgr) -> Self {
        let retry = driver.base().timeouts.forward_retry;
        HostAgent {
            driver,
            keys,
            forwards: ForwardMgr::new().with_retry(retry),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.driver.base().machine.name
    }

    pub fn dir(&self) -> &MachineDir {
        &self.driver.base().dir
    }

    pub fn forwards(&self) -> &ForwardMgr {
        &self.forwards
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            name: self.name().to_string(),
            pid: std::process::id(),
            vm_type: self.driver.vm_type(),
            forwards: self.forwards.keys(),
        }
    }

    /// Install (or replace) forwards. Every rule goes through the driver's
    /// dialer, so vsock targets reach into the guest.
    pub async fn forward(&self, forwards: &[PortForward]) -> Result<()> {
        let dialer = self.driver.dialer()?;
        for forward in forwards {
            let rule = forward.rule();
            self.forwards
                .add_by(&rule, Some(dialer.clone()))
                .await
                .with_context(|| format!("add forward {rule}"))?;
        }
        event!(Level::INFO, "{}", self.forwards);
        Ok(())
    }

    /// Remove forwards, returning how many were live.
    pub async fn unforward(&self, forwards: &[PortForward]) -> Result<usize> {
        let mut removed = 0;
        for forward in forwards {
            let rule: Rule = forward
                .rule()
                .parse()
                .with_context(|| format!("parse forward {}", forward.rule()))?;
            if self.forwards.remove(&rule.key()).await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Ask [`HostAgent::run`] to stop the machine and exit.
    pub fn request_stop(&self) {
        event!(Level::INFO, name = %self.name(), "Stop requested");
        self.shutdown.cancel();
    }

    /// Probe the in-guest agent's `/health`.
    pub async fn guest_health(&self) -> GuestHealth {
        match tokio::time::timeout(GUEST_CHECK_TIMEOUT, self.check_guest()).await {
            Ok(Ok(detail)) => GuestHealth {
                healthy: true,
                detail,
            },
            Ok(Err(e)) => GuestHealth {
                healthy: false,
                detail: format!("{e:#}"),
            },
            Err(_) => GuestHealth {
                healthy: false,
                detail: format!("guest agent did not answer within {GUEST_CHECK_TIMEOUT:?}"),
            },
        }
    }

    async fn check_guest(&self) -> Result<String> {
        let stream = self
            .driver
            .guest_agent_conn()
            .await
            .context("dial guest agent")?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("guest agent HTTP handshake")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                event!(Level::DEBUG, ?e, "guest agent connection closed");
            }
        });

        let request = Request::builder()
            .method("GET")
            .uri("http://guest/health")
            .header("host", "guest")
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        let body = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY)]).into_owned();

        if !status.is_success() {
            bail!("guest agent answered HTTP {status}: {body}");
        }
        Ok(body)
    }

    /// Serve the sandbox API on `listener` until a stop is requested.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        let token = self.shutdown.clone();
        axum::serve(listener, crate::server::router(self))
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .context("sandbox server")
    }

    /// Boot the machine and supervise it until it exits or is asked to
    /// stop. The PID file exists for exactly as long as this runs.
    #[instrument(skip(self), fields(name = %self.name()), err(Debug, level = Level::WARN))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let pid_file = self.dir().pid_file();
        save_pid(&pid_file, std::process::id()).await?;

        let res = self.clone().supervise().await;

        self.forwards.stop_all().await;
        if let Err(e) = remove_pid(&pid_file).await {
            event!(Level::WARN, "Failed to remove pid file: {e:#}");
        }
        let _ = tokio::fs::remove_file(self.dir().sandbox_sock()).await;
        res
    }

    async fn supervise(self: Arc<Self>) -> Result<()> {
        let base = self.driver.base();
        let dir = self.dir().clone();

        self.driver.validate().await?;
        self.driver.create_disk().await.context("create disk")?;
        cidata::create_boot_disk(base, &self.keys)
            .await
            .context("create boot disk")?;
        let mut exit = self.driver.start().await.context("start machine")?;
        event!(Level::INFO, vm_type = %self.driver.vm_type(), "Machine started");

        let sandbox_sock = dir.sandbox_sock();
        match tokio::fs::remove_file(&sandbox_sock).await {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(e).context("remove stale sandbox socket"),
        }
        let listener = UnixListener::bind(&sandbox_sock)
            .with_context(|| format!("bind sandbox socket {sandbox_sock:?}"))?;
        let server = tokio::spawn(self.clone().serve(listener));

        if let Err(e) = self.forward(&base.spec().port_forwards).await {
            event!(Level::WARN, "Failed to apply port forwards: {e:#}");
        }

        if base.spec().gui && self.driver.can_run_gui() {
            let agent = self.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.driver.run_gui().await {
                    event!(Level::WARN, "GUI exited with error: {e:#}");
                }
                agent.request_stop();
            });
        }

        let mut refresh = tokio::time::interval(PID_REFRESH_INTERVAL);
        refresh.tick().await;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let res = loop {
            #[rustfmt::skip]
            tokio::select! {
                _ = refresh.tick() => {
                    if let Err(e) = save_pid(&dir.pid_file(), std::process::id()).await {
                        event!(Level::WARN, "Failed to refresh pid file: {e:#}");
                    }
                }

                exited = &mut exit => {
                    let err = exited.unwrap_or_else(|_| anyhow!("driver dropped its exit channel"));
                    event!(Level::ERROR, "Machine exited: {err:#}");
                    break Err(err.context("machine exited"));
                }

                _ = self.shutdown.cancelled() => break Ok(()),

                _ = sigterm.recv() => {
                    event!(Level::INFO, "Received SIGTERM");
                    break Ok(());
                }

                _ = sigint.recv() => {
                    event!(Level::INFO, "Received SIGINT");
                    break Ok(());
                }
            }
        };

        self.shutdown.cancel();
        self.forwards.stop_all().await;
        if let Err(e) = self.driver.stop().await {
            event!(Level::ERROR, "Failed to stop machine: {e:#}");
        }
        match server.await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => event!(Level::WARN, "{e:#}"),
            Err(e) => event!(Level::WARN, ?e, "sandbox server task failed"),
        }
        res
    }
}
