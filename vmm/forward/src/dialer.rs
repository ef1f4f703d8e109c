use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::rule::{Endpoint, Network};

/// A bidirectional byte stream, as returned by a [`Dialer`].
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// Opens connections to the forward side of a rule.
///
/// Backend drivers implement this to reach guest vsock ports.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Endpoint) -> io::Result<BoxStream>;
}

/// Dials TCP and unix sockets on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &Endpoint) -> io::Result<BoxStream> {
        match target.network {
            Network::Tcp => Ok(Box::new(TcpStream::connect(&target.address).await?)),
            Network::Unix => Ok(Box::new(UnixStream::connect(&target.address).await?)),
            Network::Udp | Network::Vsock => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot dial {target} directly"),
            )),
        }
    }
}
