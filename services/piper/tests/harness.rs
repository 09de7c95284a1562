//! Test harness for proxy integration tests.
//!
//! Provides helpers to spawn plaintext backends, a directory-backed proxy
//! listener and TLS clients on loopback.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use piper::proxy::tls::acceptor_from_pem;
use piper::{ConnectionEvent, EventLog, Listener, ListenerConfig, Resolver};

pub const WAIT: Duration = Duration::from_secs(5);

#[allow(dead_code)]
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

impl TestCert {
    pub fn localhost() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate certificate");
        Self {
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
            cert_der: cert.cert.der().to_vec(),
        }
    }
}

/// Plaintext backend. Answers `PING` with `PONG` and echoes anything else.
#[allow(dead_code)]
pub struct PingBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl PingBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let closed_clone = Arc::clone(&closed);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                let closed = Arc::clone(&closed_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                let reply: &[u8] = if &buf[..n] == b"PING" {
                                                    b"PONG"
                                                } else {
                                                    &buf[..n]
                                                };
                                                if stream.write_all(reply).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                    closed.fetch_add(1, Ordering::Relaxed);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            closed,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Wait until `n` backend connections have seen EOF or an error.
    pub async fn wait_closed(&self, n: u64) -> bool {
        tokio::time::timeout(WAIT, async {
            while self.closed_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for PingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running proxy listener plus its event stream.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub listener: Arc<Listener>,
    pub cert: TestCert,
    events: mpsc::Receiver<ConnectionEvent>,
    task: JoinHandle<()>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(resolver: Arc<dyn Resolver>) -> io::Result<Self> {
        Self::spawn_with(resolver, |_| {}).await
    }

    pub async fn spawn_with<F>(resolver: Arc<dyn Resolver>, tweak: F) -> io::Result<Self>
    where
        F: FnOnce(&mut ListenerConfig),
    {
        let cert = TestCert::localhost();
        let acceptor = acceptor_from_pem(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
            .map_err(io::Error::other)?;

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.connect_timeout = Some(Duration::from_secs(2));
        tweak(&mut config);

        let (events, rx) = EventLog::channel(1024);
        let listener = Listener::bind(config, acceptor, resolver, events)
            .await
            .map_err(io::Error::other)?;

        let listen_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        let run = Arc::clone(&listener);
        let task = tokio::spawn(async move {
            let _ = run.run().await;
        });

        Ok(Self {
            listen_addr,
            listener,
            cert,
            events: rx,
            task,
        })
    }

    pub async fn connect(&self) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        tls_client_connect(self.listen_addr, "localhost", &self.cert.cert_der).await
    }

    /// Collect events for `conn_id` until its `Closed` event arrives.
    pub async fn events_until_closed(&mut self, conn_id: u64) -> Vec<ConnectionEvent> {
        let mut collected = Vec::new();
        let result = tokio::time::timeout(WAIT, async {
            while let Some(event) = self.events.recv().await {
                if event.conn_id() != Some(conn_id) {
                    continue;
                }
                let done = matches!(event, ConnectionEvent::Closed { .. });
                collected.push(event);
                if done {
                    break;
                }
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "connection {conn_id} did not close in time; saw {collected:?}"
        );
        collected
    }

    pub fn stat(&self, pick: impl Fn(&piper::ListenerStats) -> &AtomicU64) -> u64 {
        pick(self.listener.stats()).load(Ordering::Relaxed)
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}

/// Read until the peer closes; returns what was read. Errors count as closed.
#[allow(dead_code)]
pub async fn read_until_closed<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}

/// A loopback port with nothing listening on it.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
