use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use crate::dialer::{BoxStream, Dialer, DirectDialer};
use crate::rule::{Endpoint, Network, Rule, RuleError};

/// Back-off after a failed accept or dial.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(15);

/// Wildcard guest CID: accept from any context.
#[cfg(target_os = "linux")]
const VMADDR_CID_ANY: u32 = u32::MAX;

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<BoxStream> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                debug!("connection accepted: remote=[{peer}]");
                Ok(Box::new(stream))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(target_os = "linux")]
            Listener::Vsock(l) => {
                let (stream, peer) = l.accept().await?;
                debug!("vsock connection accepted: remote=[{peer:?}]");
                Ok(Box::new(stream))
            }
        }
    }
}

/// Splice two streams together until both directions reach EOF.
///
/// Returns the number of bytes copied from `a` to `b` and from `b` to `a`.
pub async fn bicopy<A, B>(mut a: A, mut b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy_bidirectional(&mut a, &mut b).await
}

/// A single bidirectional proxy from a bind endpoint to a forward endpoint.
pub struct Forwarder {
    rule: Rule,
    dialer: Arc<dyn Dialer>,
    retry: Duration,
    quit: CancellationToken,
}

impl Forwarder {
    /// Forwarding to vsock needs a backend `dialer`; everything else falls
    /// back to dialing the host directly.
    pub fn new(rule: Rule, dialer: Option<Arc<dyn Dialer>>) -> Result<Self, RuleError> {
        let dialer = match dialer {
            Some(d) => d,
            None if rule.forward.network == Network::Vsock => {
                return Err(RuleError::DialerRequired(rule.key()));
            }
            None => Arc::new(DirectDialer),
        };

        Ok(Forwarder {
            rule,
            dialer,
            retry: DEFAULT_RETRY,
            quit: CancellationToken::new(),
        })
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn bind_addr(&self) -> &Endpoint {
        &self.rule.bind
    }

    pub async fn listen(&self) -> Result<Listener> {
        let bind = &self.rule.bind;
        let listener = match bind.network {
            Network::Tcp => Listener::Tcp(
                TcpListener::bind(&bind.address)
                    .await
                    .with_context(|| format!("bind listener {bind}"))?,
            ),
            Network::Unix => {
                ensure_sock(Path::new(&bind.address)).await?;
                Listener::Unix(
                    UnixListener::bind(&bind.address)
                        .with_context(|| format!("bind listener {bind}"))?,
                )
            }
            Network::Vsock => listen_vsock(bind)?,
            Network::Udp => {
                bail!("listening on {bind} is not supported");
            }
        };
        info!("forwarder listen at: {bind}");
        Ok(listener)
    }

    /// Bind and serve until [`Forwarder::stop`] is called.
    pub async fn forward(&self) -> Result<()> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` and splice each of them to a newly
    /// dialed forward connection. Accept and dial errors back off and retry.
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        loop {
            #[rustfmt::skip]
            let accepted = tokio::select! {
                _ = self.quit.cancelled() => break,
                res = listener.accept() => res,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("forwarder: accepting connection [addr {}] with {e}", self.rule.bind);
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            #[rustfmt::skip]
            let dialed = tokio::select! {
                _ = self.quit.cancelled() => break,
                res = self.dialer.dial(&self.rule.forward) => res,
            };

            let remote = match dialed {
                Ok(remote) => remote,
                Err(e) => {
                    std::mem::drop(conn);
                    warn!("forwarder: dialing connection [addr {}] with {e}", self.rule.forward);
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            debug!("forward new connection: {} -> {}", self.rule.bind, self.rule.forward);
            let quit = self.quit.clone();
            let rule = self.rule.key();
            tokio::spawn(async move {
                #[rustfmt::skip]
                tokio::select! {
                    _ = quit.cancelled() => (),
                    res = bicopy(conn, remote) => match res {
                        Ok((up, down)) => debug!("connection on {rule} closed: {up} bytes up, {down} bytes down"),
                        Err(e) => debug!("connection on {rule} failed: {e}"),
                    },
                }
            });
        }

        info!("forwarder at {} stopped", self.rule.bind);
        Ok(())
    }

    /// Returns `true` if the forwarder was stopped while backing off.
    async fn backoff(&self) -> bool {
        #[rustfmt::skip]
        tokio::select! {
            _ = self.quit.cancelled() => true,
            _ = tokio::time::sleep(self.retry) => false,
        }
    }

    /// Stop accepting, tear down open connections and remove the socket
    /// file of a unix bind.
    pub fn stop(&self) {
        info!("stop forwarder: {}", self.rule.bind);
        self.quit.cancel();
        if self.rule.bind.network == Network::Unix {
            match std::fs::remove_file(&self.rule.bind.address) {
                Ok(()) => (),
                Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => debug!("remove socket {}: {e}", self.rule.bind.address),
            }
        }
    }

    pub fn stopped(&self) -> bool {
        self.quit.is_cancelled()
    }
}

#[cfg(target_os = "linux")]
fn listen_vsock(bind: &Endpoint) -> Result<Listener> {
    let port = bind.vsock_port()?;
    let addr = tokio_vsock::VsockAddr::new(VMADDR_CID_ANY, port);
    let listener = tokio_vsock::VsockListener::bind(addr)
        .with_context(|| format!("bind listener {bind}"))?;
    Ok(Listener::Vsock(listener))
}

#[cfg(not(target_os = "linux"))]
fn listen_vsock(bind: &Endpoint) -> Result<Listener> {
    bind.vsock_port()?;
    bail!("listening on {bind} needs AF_VSOCK, which this host does not have");
}

/// Make sure the parent directory exists and no stale socket is in the way.
async fn ensure_sock(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create socket directory {dir:?}"))?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("unlink stale socket {path:?}")),
    }
}
