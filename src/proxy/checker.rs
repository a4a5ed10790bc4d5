//! Per-proxy check across every configured protocol

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::models::{CheckOutcome, ProbeOutcome, ProtocolResult, ProtocolTag, ProxyIdentity};
use crate::proxy::gate::CheckGate;
use crate::proxy::probe::Prober;

/// Drives the prober over the configured protocols of one proxy.
///
/// Protocols run one after another in configured order, and every network
/// operation holds its own gate permit, so the gate capacity bounds the number
/// of outstanding probes in the whole process.
#[derive(Clone)]
pub struct ProxyChecker {
    prober: Arc<dyn Prober>,
    gate: CheckGate,
    protocols: Vec<ProtocolTag>,
    check_tunnel: bool,
}

impl ProxyChecker {
    pub fn new(
        prober: Arc<dyn Prober>,
        gate: CheckGate,
        protocols: Vec<ProtocolTag>,
        check_tunnel: bool,
    ) -> Self {
        Self {
            prober,
            gate,
            protocols,
            check_tunnel,
        }
    }

    pub fn gate(&self) -> &CheckGate {
        &self.gate
    }

    /// Check one proxy.
    ///
    /// A proxy that fails every protocol yields an inactive outcome, not an
    /// error. Only cancellation is returned as `Err`.
    #[instrument(skip_all, fields(proxy = %proxy))]
    pub async fn check(&self, proxy: &ProxyIdentity) -> Result<CheckOutcome> {
        let mut results = Vec::with_capacity(self.protocols.len());

        for &protocol in &self.protocols {
            let outcome = {
                let _permit = self.gate.acquire().await?;
                self.prober.probe(proxy, protocol).await?
            };

            let (ping, geo) = match outcome {
                ProbeOutcome::Success { ping, geo } => (ping, geo),
                ProbeOutcome::Failure { last_error } => {
                    debug!(protocol = %protocol, "Protocol unsupported: {}", last_error);
                    continue;
                }
            };

            let tunnel = if self.check_tunnel {
                let _permit = self.gate.acquire().await?;
                self.prober.probe_tunnel(proxy, protocol).await?
            } else {
                false
            };

            results.push(ProtocolResult {
                protocol,
                ping: ping.as_secs_f64(),
                tunnel,
                geo,
            });
        }

        let outcome = CheckOutcome::from_results(results, Utc::now());
        debug!(
            active = outcome.active,
            protocols = outcome.supported_protocols.len(),
            "Check finished"
        );
        Ok(outcome)
    }
}
