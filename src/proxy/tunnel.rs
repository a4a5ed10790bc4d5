//! WebSocket echo probe for tunnel capability
//!
//! Opens a WebSocket to an echo server through the proxy, sends a random
//! token and expects the same token back. Anything else means the proxy
//! cannot hold a bidirectional tunnel.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::error::{PoolError, Result};
use crate::models::ProtocolTag;
use crate::proxy::transport::ProxyTransport;

#[derive(Debug, Clone)]
pub struct TunnelProbe {
    echo_url: Url,
    timeout: Duration,
    heartbeat: Duration,
}

impl TunnelProbe {
    pub fn new(echo_url: Url, timeout: Duration, heartbeat: Duration) -> Self {
        Self {
            echo_url,
            timeout,
            heartbeat,
        }
    }

    /// True when the echo came back intact within the timeout
    pub async fn check(&self, proxy: SocketAddr, protocol: ProtocolTag) -> bool {
        match timeout(self.timeout, self.exchange(proxy, protocol)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(proxy = %proxy, protocol = %protocol, "Tunnel probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(proxy = %proxy, protocol = %protocol, "Tunnel probe timed out");
                false
            }
        }
    }

    async fn exchange(&self, proxy: SocketAddr, protocol: ProtocolTag) -> Result<()> {
        let host = self
            .echo_url
            .host_str()
            .ok_or_else(|| PoolError::InvalidConfig("echo URL has no host".into()))?;
        let port = self
            .echo_url
            .port_or_known_default()
            .ok_or_else(|| PoolError::InvalidConfig("echo URL has no port".into()))?;

        let stream = ProxyTransport::connect(proxy, protocol, host, port).await?;
        let (mut ws, _) = tokio_tungstenite::client_async_tls(self.echo_url.as_str(), stream)
            .await
            .map_err(|e| PoolError::TunnelError(format!("handshake failed: {}", e)))?;

        let token = format!("proxylist-{:016x}", rand::random::<u64>());
        ws.send(Message::Text(token.clone()))
            .await
            .map_err(|e| PoolError::TunnelError(format!("send failed: {}", e)))?;

        let mut heartbeat = interval(self.heartbeat.max(Duration::from_millis(10)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    ws.send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| PoolError::TunnelError(format!("heartbeat failed: {}", e)))?;
                }
                message = ws.next() => match message {
                    Some(Ok(Message::Text(text))) if text == token => {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                    Some(Ok(Message::Text(_))) => {
                        return Err(PoolError::TunnelError("echo does not match".into()));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(other)) => {
                        return Err(PoolError::TunnelError(format!(
                            "unexpected message kind: {:?}",
                            other
                        )));
                    }
                    Some(Err(e)) => return Err(PoolError::TunnelError(e.to_string())),
                    None => return Err(PoolError::TunnelError("connection closed".into())),
                },
            }
        }
    }
}
