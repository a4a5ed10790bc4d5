//! In-process fake proxies and origins for network tests

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::error::{PoolError, Result};
use crate::models::{ProbeOutcome, ProtocolTag, ProxyIdentity};
use crate::proxy::probe::Prober;

/// Request line and host of a request seen by a fake server
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub target: String,
    pub host: Option<String>,
}

/// Canned response of a fake server
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Self-signed certificate for `localhost`
const LOCALHOST_CERT: &[u8] = include_bytes!("fixtures/localhost.cert.der");
const LOCALHOST_KEY: &[u8] = include_bytes!("fixtures/localhost.key.der");

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<SeenRequest> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&head).into_owned();
    let mut lines = text.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let host = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim().to_string());

    Some(SeenRequest {
        method,
        target,
        host,
    })
}

/// HTTP server answering every request with `handler`'s reply.
///
/// Accepts both origin-form and absolute-form targets, so it doubles as a
/// plain forwarding proxy that never forwards anything.
pub async fn spawn_http_server<F>(handler: F) -> SocketAddr
where
    F: Fn(&SeenRequest) -> Reply + Send + Sync + 'static,
{
    let (listener, addr) = bind().await;
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                serve_once(stream, handler.as_ref()).await;
            });
        }
    });

    addr
}

/// Like [`spawn_http_server`], behind TLS with the `localhost` certificate
pub async fn spawn_https_server<F>(handler: F) -> SocketAddr
where
    F: Fn(&SeenRequest) -> Reply + Send + Sync + 'static,
{
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(LOCALHOST_CERT.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(LOCALHOST_KEY.to_vec())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let (listener, addr) = bind().await;
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(stream).await else {
                    return;
                };
                serve_once(stream, handler.as_ref()).await;
            });
        }
    });

    addr
}

/// TLS client that trusts only the `localhost` test certificate
pub fn localhost_tls_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(LOCALHOST_CERT.to_vec()))
        .unwrap();
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

async fn serve_once<S, F>(mut stream: S, handler: &F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&SeenRequest) -> Reply,
{
    let Some(request) = read_head(&mut stream).await else {
        return;
    };
    let reply = handler(&request);
    tokio::time::sleep(reply.delay).await;
    let response = format!(
        "HTTP/1.1 {} Test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reply.body.len(),
        reply.body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Proxy that only understands `CONNECT host:port`
pub async fn spawn_connect_proxy() -> SocketAddr {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Some(request) = read_head(&mut client).await else {
                    return;
                };
                if request.method != "CONNECT" {
                    let _ = client
                        .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                        .await;
                    return;
                }
                let Ok(mut upstream) = TcpStream::connect(request.target.as_str()).await else {
                    let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                    return;
                };
                let _ = client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await;
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });

    addr
}

/// Minimal SOCKS4 server; SOCKS4a hostname requests are refused
pub async fn spawn_socks4_proxy() -> SocketAddr {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = socks4_session(&mut client).await;
            });
        }
    });

    addr
}

async fn socks4_session(client: &mut TcpStream) -> std::io::Result<()> {
    let mut request = [0u8; 8];
    client.read_exact(&mut request).await?;
    let port = u16::from_be_bytes([request[2], request[3]]);
    let ip = Ipv4Addr::new(request[4], request[5], request[6], request[7]);

    // user id, NUL terminated
    let mut byte = [0u8; 1];
    loop {
        client.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
    }

    const REJECTED: [u8; 8] = [0x00, 0x5B, 0, 0, 0, 0, 0, 0];
    if request[0] != 0x04 || request[1] != 0x01 || ip.octets()[..3] == [0, 0, 0] {
        client.write_all(&REJECTED).await?;
        return Ok(());
    }

    let mut upstream = match TcpStream::connect((ip, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            client.write_all(&REJECTED).await?;
            return Err(e);
        }
    };
    client.write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).await?;
    tokio::io::copy_bidirectional(client, &mut upstream).await?;
    Ok(())
}

/// Minimal no-auth SOCKS5 server supporting the CONNECT command
pub async fn spawn_socks5_proxy() -> SocketAddr {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = socks5_session(&mut client).await;
            });
        }
    });

    addr
}

async fn socks5_session(client: &mut TcpStream) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            client
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Err(e);
        }
    };
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(client, &mut upstream).await?;
    Ok(())
}

/// Raw TCP echo server
pub async fn spawn_tcp_echo() -> SocketAddr {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// WebSocket server that answers each text frame with `respond(text)`
pub async fn spawn_ws_server<F>(respond: F) -> SocketAddr
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (listener, addr) = bind().await;
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        if ws.send(Message::Text(respond(&text))).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Scripted prober for checker and scheduler tests
#[derive(Clone, Default)]
pub struct FakeProber {
    state: Arc<FakeProberState>,
}

#[derive(Default)]
struct FakeProberState {
    successes: Mutex<HashMap<ProtocolTag, Duration>>,
    tunnels: Mutex<HashSet<ProtocolTag>>,
    dead: Mutex<HashSet<String>>,
    cancel_on: Mutex<Option<ProtocolTag>>,
    delay: Mutex<Duration>,
    probed: Mutex<Vec<ProtocolTag>>,
    tunnel_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeProber {
    /// Every probe fails until configured otherwise
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(self, protocol: ProtocolTag, ping: Duration) -> Self {
        self.state.successes.lock().insert(protocol, ping);
        self
    }

    pub fn tunnel(self, protocol: ProtocolTag) -> Self {
        self.state.tunnels.lock().insert(protocol);
        self
    }

    /// Proxies at this IP fail every protocol
    pub fn dead(self, ip: &str) -> Self {
        self.state.dead.lock().insert(ip.to_string());
        self
    }

    pub fn cancel_on(self, protocol: ProtocolTag) -> Self {
        *self.state.cancel_on.lock() = Some(protocol);
        self
    }

    pub fn delay(self, delay: Duration) -> Self {
        *self.state.delay.lock() = delay;
        self
    }

    pub fn probed(&self) -> Vec<ProtocolTag> {
        self.state.probed.lock().clone()
    }

    pub fn tunnel_calls(&self) -> usize {
        self.state.tunnel_calls.load(Ordering::SeqCst)
    }

    /// Highest number of probes seen running at once
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(
        &self,
        proxy: &ProxyIdentity,
        protocol: ProtocolTag,
    ) -> Result<ProbeOutcome> {
        self.state.probed.lock().push(protocol);
        if *self.state.cancel_on.lock() == Some(protocol) {
            return Err(PoolError::Cancelled);
        }

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.state.delay.lock();
        tokio::time::sleep(delay).await;
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let ping = self.state.successes.lock().get(&protocol).copied();
        let dead = self.state.dead.lock().contains(&proxy.ip);
        Ok(match ping {
            Some(ping) if !dead => ProbeOutcome::Success { ping, geo: None },
            _ => ProbeOutcome::failure("scripted failure"),
        })
    }

    async fn probe_tunnel(
        &self,
        _proxy: &ProxyIdentity,
        protocol: ProtocolTag,
    ) -> Result<bool> {
        self.state
            .tunnel_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.state.tunnels.lock().contains(&protocol))
    }
}
