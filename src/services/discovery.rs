//! Candidate discovery
//!
//! Scrapes public listing pages for `ip ... port` pairs and stores every new
//! pair as a never-checked record.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use regex::Regex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::DiscoveryConfig;
use crate::error::{PoolError, Result};
use crate::models::ProxyIdentity;
use crate::repository::ProxyStore;
use crate::shutdown::wait_for_shutdown;

const DISCOVERY_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0";

const CANDIDATE_PATTERN: &str = r"(?P<ip>\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}).*?(?P<port>\d{2,5})";

/// Pulls `ip:port` candidates out of listing pages
#[derive(Debug, Clone)]
pub struct CandidateExtractor {
    regex: Regex,
}

impl CandidateExtractor {
    pub fn new() -> Result<Self> {
        let regex = Regex::new(CANDIDATE_PATTERN)
            .map_err(|e| PoolError::Internal(format!("candidate pattern: {}", e)))?;
        Ok(Self { regex })
    }

    /// Candidates of one page, deduplicated, in page order.
    ///
    /// The port is the first 2-5 digit run after the address on the same line,
    /// so markup between the two is skipped.
    pub fn extract(&self, page: &str) -> Vec<ProxyIdentity> {
        let mut seen = HashSet::new();

        self.regex
            .captures_iter(page)
            .filter_map(|caps| {
                let ip: Ipv4Addr = caps.name("ip")?.as_str().parse().ok()?;
                let port: u16 = caps.name("port")?.as_str().parse().ok()?;
                if port == 0 || ip.is_unspecified() {
                    return None;
                }
                Some(ProxyIdentity::new(ip.to_string(), port))
            })
            .filter(|identity| seen.insert(identity.clone()))
            .collect()
    }
}

/// Periodically scrapes the configured listing pages
pub struct DiscoveryService {
    store: Arc<dyn ProxyStore>,
    client: reqwest::Client,
    extractor: CandidateExtractor,
    config: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(store: Arc<dyn ProxyStore>, config: DiscoveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(DISCOVERY_USER_AGENT)
            .build()
            .map_err(|e| PoolError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            store,
            client,
            extractor: CandidateExtractor::new()?,
            config,
        })
    }

    /// Run discovery until shutdown (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.config.urls.is_empty() {
            info!("No listing pages configured, discovery disabled");
            return;
        }

        info!(
            "Starting discovery over {} pages with {}s period",
            self.config.urls.len(),
            self.config.parse_period.as_secs()
        );

        let mut ticker = interval(self.config.parse_period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.discover().await {
                        error!("Discovery run failed: {}", e);
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Discovery service shutting down");
                    break;
                }
            }
        }
    }

    /// Fetch every page once and store the new candidates
    pub async fn discover(&self) -> Result<usize> {
        let started = Instant::now();
        let pages = futures::stream::iter(self.config.urls.clone())
            .map(|url| async move {
                let page = self.fetch(&url).await;
                (url, page)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (url, page) in pages {
            match page {
                Ok(body) => {
                    let found = self.extractor.extract(&body);
                    if found.is_empty() {
                        warn!(url = %url, "Listing page yielded no candidates");
                    } else {
                        debug!(url = %url, found = found.len(), "Scraped listing page");
                    }
                    candidates.extend(found.into_iter().filter(|c| seen.insert(c.clone())));
                }
                Err(e) => warn!(url = %url, "Failed to fetch listing page: {}", e),
            }
        }

        let inserted = self.store.add_candidates(&candidates).await?;
        info!(
            found = candidates.len(),
            inserted,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Discovery run complete"
        );
        Ok(inserted)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PoolError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PoolError::Http(format!("status {}", status)));
        }

        response
            .text()
            .await
            .map_err(|e| PoolError::Http(e.to_string()))
    }
}
