//! Vsock-equivalent dialers.
//!
//! Hypervisors that expose guest vsock ports as host unix sockets (one per
//! port) are reached through [`SocketDialer`]; WSL2, which shares the
//! host's loopback, through [`LoopbackDialer`]. Anything that is not a vsock
//! target is dialed directly.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::{TcpStream, UnixStream};

use mdn_forward::{BoxStream, Dialer, DirectDialer, Endpoint, Network};

use crate::DriverError;

fn vsock_port(target: &Endpoint) -> io::Result<u32> {
    target
        .vsock_port()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

#[derive(Debug, Clone)]
pub struct SocketDialer {
    sockets: BTreeMap<u32, PathBuf>,
}

impl SocketDialer {
    pub fn new(sockets: impl IntoIterator<Item = (u32, PathBuf)>) -> Self {
        SocketDialer {
            sockets: sockets.into_iter().collect(),
        }
    }

    pub fn ports(&self) -> impl Iterator<Item = &u32> {
        self.sockets.keys()
    }
}

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial(&self, target: &Endpoint) -> io::Result<BoxStream> {
        if target.network != Network::Vsock {
            return DirectDialer.dial(target).await;
        }
        let port = vsock_port(target)?;
        let Some(socket) = self.sockets.get(&port) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                DriverError::NoSocketDevice(port),
            ));
        };
        tracing::event!(tracing::Level::DEBUG, port, ?socket, "connect to guest vsock port");
        Ok(Box::new(UnixStream::connect(socket).await?))
    }
}

/// Maps vsock port `P` to `127.0.0.1:P`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackDialer;

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, target: &Endpoint) -> io::Result<BoxStream> {
        if target.network != Network::Vsock {
            return DirectDialer.dial(target).await;
        }
        let port = u16::try_from(vsock_port(target)?).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("vsock port {} does not fit a TCP port", target.address),
            )
        })?;
        Ok(Box::new(TcpStream::connect(("127.0.0.1", port)).await?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_socket_dialer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock-10443.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let dialer = SocketDialer::new([(10443, path)]);

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"ok").await.unwrap();
        });

        let mut conn = dialer
            .dial(&Endpoint::new(Network::Vsock, "10443"))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();

        let err = dialer
            .dial(&Endpoint::new(Network::Vsock, "2222"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("no socket device"));
    }
}
