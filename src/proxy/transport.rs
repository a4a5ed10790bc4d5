//! Proxy transport layer for HTTP and SOCKS protocols
//!
//! Opens connections to a target host through a proxy under test.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};

use crate::error::{PoolError, Result};
use crate::models::ProtocolTag;

/// Upper bound for a CONNECT response head
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a raw TCP connection to the proxy itself.
    ///
    /// Used for plain HTTP proxying, where the request carries an absolute URI.
    pub async fn connect_direct(proxy: SocketAddr) -> Result<TcpStream> {
        TcpStream::connect(proxy)
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))
    }

    /// Connect to a target through the proxy with the given protocol
    #[instrument(skip_all, fields(proxy = %proxy, protocol = %protocol, target = %target_host))]
    pub async fn connect(
        proxy: SocketAddr,
        protocol: ProtocolTag,
        target_host: &str,
        target_port: u16,
    ) -> Result<Box<dyn ProxyConnection>> {
        match protocol {
            ProtocolTag::Http => Self::connect_http(proxy, target_host, target_port).await,
            ProtocolTag::Socks4 => Self::connect_socks4(proxy, target_host, target_port).await,
            ProtocolTag::Socks5 => Self::connect_socks5(proxy, target_host, target_port).await,
        }
    }

    /// Connect through HTTP CONNECT method
    async fn connect_http(
        proxy: SocketAddr,
        target_host: &str,
        target_port: u16,
    ) -> Result<Box<dyn ProxyConnection>> {
        let mut stream = Self::connect_direct(proxy).await?;

        let connect_request = Self::build_connect_request(target_host, target_port);
        stream
            .write_all(connect_request.as_bytes())
            .await
            .map_err(|e| PoolError::ConnectFailed(format!("Failed to send CONNECT: {}", e)))?;

        let head = Self::read_response_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or_default();
        if !is_success_status_line(status_line) {
            return Err(PoolError::ConnectFailed(if status_line.is_empty() {
                "empty response".to_string()
            } else {
                status_line.to_string()
            }));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(Box::new(stream))
    }

    /// Build HTTP CONNECT request
    fn build_connect_request(target_host: &str, target_port: u16) -> String {
        format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
            host = target_host,
            port = target_port
        )
    }

    /// Read up to the end of the response head, byte by byte so no tunnel payload is consumed
    async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];

        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_CONNECT_RESPONSE {
                return Err(PoolError::ConnectFailed("response head too large".to_string()));
            }
            let n = stream.read(&mut byte).await.map_err(|e| {
                PoolError::ConnectFailed(format!("Failed to read CONNECT response: {}", e))
            })?;
            if n == 0 {
                break;
            }
            head.push(byte[0]);
        }

        Ok(String::from_utf8_lossy(&head).into_owned())
    }

    /// Connect through SOCKS4 proxy
    async fn connect_socks4(
        proxy: SocketAddr,
        target_host: &str,
        target_port: u16,
    ) -> Result<Box<dyn ProxyConnection>> {
        // SOCKS4 carries only IPv4 addresses, so resolve locally
        let target_addr = resolve_ipv4(target_host, target_port).await?;

        let stream = Socks4Stream::connect(proxy, target_addr)
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("SOCKS4 connect failed: {}", e)))?;

        debug!("SOCKS4 connection established");
        Ok(Box::new(stream.into_inner()))
    }

    /// Connect through SOCKS5 proxy
    async fn connect_socks5(
        proxy: SocketAddr,
        target_host: &str,
        target_port: u16,
    ) -> Result<Box<dyn ProxyConnection>> {
        let stream = Socks5Stream::connect(proxy, (target_host, target_port))
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(Box::new(stream.into_inner()))
    }
}

fn is_success_status_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") && code.starts_with('2')
    )
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(SocketAddrV4::new(v4, port)),
            IpAddr::V6(_) => Err(PoolError::ProxyConnectionFailed(
                "SOCKS4 cannot reach IPv6 targets".to_string(),
            )),
        };
    }

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("DNS lookup failed: {}", e)))?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| {
            PoolError::ProxyConnectionFailed(format!("no IPv4 address for {}", host))
        })
}

/// Byte stream through a proxy: a raw tunnel, or TLS on top of one
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
