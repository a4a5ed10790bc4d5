//! Request probing through a proxy
//!
//! A probe sends one plain HTTP request through the proxy to an IP lookup
//! service and reports the round-trip time. Targets are tried in random
//! order until one answers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, trace};
use url::Url;

use crate::error::{PoolError, Result};
use crate::models::{GeoInfo, ProbeOutcome, ProtocolTag, ProxyIdentity};
use crate::proxy::geo::{parser_for_host, ResponseParser};
use crate::proxy::transport::{ProxyConnection, ProxyTransport};
use crate::proxy::tunnel::TunnelProbe;
use crate::shutdown::wait_for_shutdown;

const PROBE_USER_AGENT: &str = concat!("proxylist/", env!("CARGO_PKG_VERSION"));

/// URL a probe request is sent to
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    url: Url,
    tls: bool,
    host: String,
    port: u16,
    path_and_query: String,
    parser: Option<Arc<dyn ResponseParser>>,
}

impl ProbeTarget {
    /// Accepts `http://` and `https://` targets
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| PoolError::InvalidConfig(format!("invalid probe URL '{}': {}", raw, e)))?;

        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            _ => {
                return Err(PoolError::InvalidConfig(format!(
                    "probe URL must use http or https, got '{}'",
                    raw
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| PoolError::InvalidConfig(format!("probe URL has no host: '{}'", raw)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let parser = parser_for_host(&host);
        Ok(Self {
            url,
            tls,
            host,
            port,
            path_and_query,
            parser,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Stops the connection driver when the probe ends or is dropped on timeout
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Network checks run against a single proxy and protocol.
///
/// Both methods report ordinary network failures in their `Ok` value. An
/// `Err` is reserved for cancellation and must be propagated by callers.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, proxy: &ProxyIdentity, protocol: ProtocolTag) -> Result<ProbeOutcome>;

    async fn probe_tunnel(&self, proxy: &ProxyIdentity, protocol: ProtocolTag) -> Result<bool>;
}

/// Prober sending HTTP/1.1 GET requests through the proxy
pub struct HttpProber {
    targets: Vec<ProbeTarget>,
    timeout: Duration,
    require_ip_in_body: bool,
    tunnel: TunnelProbe,
    tls: TlsConnector,
    shutdown: Option<watch::Receiver<bool>>,
}

/// TLS client trusting the webpki root set
fn default_tls_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

impl HttpProber {
    pub fn new(
        targets: Vec<ProbeTarget>,
        timeout: Duration,
        require_ip_in_body: bool,
        tunnel: TunnelProbe,
    ) -> Self {
        Self {
            targets,
            timeout,
            require_ip_in_body,
            tunnel,
            tls: TlsConnector::from(Arc::new(default_tls_config())),
            shutdown: None,
        }
    }

    /// Replace the TLS client used for `https` targets
    pub fn with_tls_config(mut self, config: ClientConfig) -> Self {
        self.tls = TlsConnector::from(Arc::new(config));
        self
    }

    /// Abort in-flight probes with [`PoolError::Cancelled`] once shutdown is signalled
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Race `fut` against the shutdown signal
    async fn cancellable<F: std::future::Future>(&self, fut: F) -> Result<F::Output> {
        match self.shutdown.clone() {
            Some(mut rx) => tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut rx) => Err(PoolError::Cancelled),
                output = fut => Ok(output),
            },
            None => Ok(fut.await),
        }
    }

    /// One timed request; returns the body on a 2xx answer
    async fn fetch(
        &self,
        proxy: SocketAddr,
        protocol: ProtocolTag,
        target: &ProbeTarget,
    ) -> Result<String> {
        // Plain HTTP through an HTTP proxy takes the absolute URI. Everything
        // else is tunnelled to the target and sent in origin form.
        let (stream, uri) = if protocol == ProtocolTag::Http && !target.tls {
            (
                Box::new(ProxyTransport::connect_direct(proxy).await?) as Box<dyn ProxyConnection>,
                target.url.to_string(),
            )
        } else {
            let tunnel = ProxyTransport::connect(proxy, protocol, &target.host, target.port).await?;
            let stream = if target.tls {
                self.handshake_tls(tunnel, &target.host).await?
            } else {
                tunnel
            };
            (stream, target.path_and_query.clone())
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| PoolError::Probe(format!("handshake failed: {}", e)))?;
        let _conn_task = AbortOnDrop(tokio::spawn(async move {
            if let Err(e) = conn.await {
                trace!("Probe connection closed: {}", e);
            }
        }));

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, target.host_header())
            .header(USER_AGENT, PROBE_USER_AGENT)
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::Internal(format!("failed to build probe request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| PoolError::Probe(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PoolError::Probe(format!("status {}", status)));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PoolError::Probe(format!("body read failed: {}", e)))?
            .to_bytes();
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn handshake_tls(
        &self,
        stream: Box<dyn ProxyConnection>,
        host: &str,
    ) -> Result<Box<dyn ProxyConnection>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| PoolError::Probe(format!("invalid TLS server name: {}", host)))?;
        let tls = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| PoolError::Probe(format!("TLS handshake failed: {}", e)))?;
        Ok(Box::new(tls))
    }

    /// Accept or reject a response body
    fn verify(
        &self,
        proxy: &ProxyIdentity,
        target: &ProbeTarget,
        body: &str,
    ) -> std::result::Result<Option<GeoInfo>, String> {
        if body.trim().is_empty() {
            return Err("empty body".to_string());
        }

        let geo = target.parser.as_ref().and_then(|parser| parser.parse(body));

        if self.require_ip_in_body {
            let reported = geo.as_ref().and_then(|g| g.external_ip.as_deref());
            let matched = match reported {
                Some(ip) => ip == proxy.ip,
                None => body.contains(&proxy.ip),
            };
            if !matched {
                return Err("response does not carry the proxy IP".to_string());
            }
        }

        Ok(geo)
    }
}

#[async_trait]
impl Prober for HttpProber {
    #[instrument(skip_all, fields(proxy = %proxy, protocol = %protocol))]
    async fn probe(&self, proxy: &ProxyIdentity, protocol: ProtocolTag) -> Result<ProbeOutcome> {
        let addr = match proxy.socket_addr() {
            Ok(addr) => addr,
            Err(e) => return Ok(ProbeOutcome::failure(e.to_string())),
        };

        let mut order: Vec<&ProbeTarget> = self.targets.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        let mut last_error = String::from("no probe targets");
        for target in order {
            let started = Instant::now();
            let attempt = self
                .cancellable(timeout(self.timeout, self.fetch(addr, protocol, target)))
                .await?;

            let body = match attempt {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    last_error = format!("{}: {}", target.url, e);
                    continue;
                }
                Err(_) => {
                    last_error = format!("{}: timed out", target.url);
                    continue;
                }
            };
            let ping = started.elapsed();

            match self.verify(proxy, target, &body) {
                Ok(geo) => {
                    debug!(target = %target.url, ping_ms = ping.as_millis() as u64, "Probe succeeded");
                    return Ok(ProbeOutcome::Success { ping, geo });
                }
                Err(reason) => last_error = format!("{}: {}", target.url, reason),
            }
        }

        debug!("Probe failed: {}", last_error);
        Ok(ProbeOutcome::failure(last_error))
    }

    async fn probe_tunnel(&self, proxy: &ProxyIdentity, protocol: ProtocolTag) -> Result<bool> {
        let addr = match proxy.socket_addr() {
            Ok(addr) => addr,
            Err(_) => return Ok(false),
        };
        self.cancellable(self.tunnel.check(addr, protocol)).await
    }
}
