use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;

use mdn_forward::{BoxStream, Dialer, Endpoint, ForwardMgr, Network, RuleError};

/// Stands in for a guest: every dial hands the far end of an in-memory pipe
/// to the test.
struct GuestDialer {
    peers: mpsc::UnboundedSender<DuplexStream>,
    dialed: Mutex<Vec<Endpoint>>,
    fail_first: AtomicUsize,
}

impl GuestDialer {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::failing(0)
    }

    fn failing(n: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = GuestDialer {
            peers: tx,
            dialed: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(n),
        };
        (Arc::new(dialer), rx)
    }
}

#[async_trait]
impl Dialer for GuestDialer {
    async fn dial(&self, target: &Endpoint) -> io::Result<BoxStream> {
        self.dialed.lock().unwrap().push(target.clone());
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "guest not up"));
        }
        let (host, guest) = tokio::io::duplex(4096);
        self.peers.send(guest).unwrap();
        Ok(Box::new(host))
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_tcp_to_vsock_roundtrip() {
    let (dialer, mut guests) = GuestDialer::new();
    let port = free_port();
    let mgr = ForwardMgr::new();
    mgr.add_by(
        &format!("tcp://127.0.0.1:{port}->vsock://40443"),
        Some(dialer.clone()),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut guest = guests.recv().await.unwrap();
    let mut buf = [0u8; 4];
    guest.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    guest.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(
        dialer.dialed.lock().unwrap().as_slice(),
        &[Endpoint::new(Network::Vsock, "40443")]
    );
    mgr.stop_all().await;
}

#[tokio::test]
async fn test_duplicate_rule_replaces_forwarder() {
    let (first, mut first_guests) = GuestDialer::new();
    let (second, mut second_guests) = GuestDialer::new();
    let port = free_port();
    let rule = format!("tcp://127.0.0.1:{port}->vsock://40443");

    let mgr = ForwardMgr::new();
    mgr.add_by(&rule, Some(first)).await.unwrap();
    // Rebinding the same port only works once the first listener is closed.
    mgr.add_by(&rule, Some(second)).await.unwrap();
    assert_eq!(mgr.keys(), vec![rule.clone()]);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut guest = second_guests.recv().await.unwrap();
    let mut buf = [0u8; 1];
    guest.read_exact(&mut buf).await.unwrap();
    assert!(first_guests.try_recv().is_err());

    assert!(mgr.remove(&rule).await);
    assert!(mgr.is_empty());
    assert!(!mgr.remove(&rule).await);
}

#[tokio::test]
async fn test_unix_bind_removes_socket_on_remove() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("run/vm1.sock");
    let (dialer, mut guests) = GuestDialer::new();

    let mgr = ForwardMgr::new();
    let rule = format!("unix://{}->vsock://10443", sock.display());
    mgr.add_by(&rule, Some(dialer)).await.unwrap();
    assert!(sock.exists());

    let mut client = UnixStream::connect(&sock).await.unwrap();
    client.write_all(b"GET /health").await.unwrap();
    let mut guest = guests.recv().await.unwrap();
    let mut buf = vec![0u8; 11];
    guest.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, b"GET /health");

    assert!(mgr.remove(&rule).await);
    assert!(!sock.exists());
}

#[tokio::test]
async fn test_dial_failure_backs_off_and_retries() {
    let (dialer, mut guests) = GuestDialer::failing(1);
    let port = free_port();
    let mgr = ForwardMgr::new().with_retry(Duration::from_millis(50));
    mgr.add_by(&format!("tcp://127.0.0.1:{port}->vsock://40443"), Some(dialer))
        .await
        .unwrap();

    // The first connection is dropped when the dial fails.
    let mut refused = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(refused.read(&mut buf).await.unwrap(), 0);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"y").await.unwrap();
    let mut guest = guests.recv().await.unwrap();
    guest.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"y");
    mgr.stop_all().await;
}

#[tokio::test]
async fn test_vsock_forward_requires_dialer() {
    let mgr = ForwardMgr::new();
    let err = mgr
        .add_by("tcp://127.0.0.1:0->vsock://40443", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RuleError>(),
        Some(RuleError::DialerRequired(_))
    ));
    assert!(mgr.is_empty());
    assert_eq!(mgr.to_string(), "total[0] forward rule: []");
}

#[tokio::test]
async fn test_vsock_bind_uses_vsock_listener() {
    let mgr = ForwardMgr::new();
    let rule = "vsock://2222->tcp://127.0.0.1:22";
    let res = mgr.add_by(rule, None).await;

    match res {
        // Hosts with AF_VSOCK serve the rule like any other.
        Ok(()) => {
            assert_eq!(mgr.keys(), vec![rule.to_string()]);
            assert!(mgr.remove(rule).await);
        }
        // Containers and hosts without the vsock module fail at bind time.
        Err(e) => {
            let msg = format!("{e:#}");
            assert!(msg.contains("vsock@2222"), "{msg}");
            assert!(!msg.contains("not supported"), "{msg}");
            assert!(mgr.is_empty());
        }
    }

    let err = mgr
        .add_by("vsock://nope->tcp://127.0.0.1:22", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RuleError>(),
        Some(RuleError::InvalidPort(_))
    ));
}
