//! HTTP reachability checks used to confirm a site came back after a fix.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProbeConfig;
use crate::error::{Error, Result};

// Pages WordPress serves with a 200 or 500 when it is actually broken.
const FAILURE_MARKERS: &[&str] = &[
    "There has been a critical error on this website",
    "Error establishing a database connection",
    "Briefly unavailable for scheduled maintenance",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResult {
    pub url: String,
    pub reachable: bool,
    pub status: Option<u16>,
    pub response_time_ms: u64,
    /// A WordPress error page marker found in the body.
    pub failure_marker: Option<String>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn healthy(&self) -> bool {
        self.reachable && self.failure_marker.is_none()
    }
}

pub trait SiteProbe: Send + Sync {
    fn check(&self, url: &str) -> ProbeResult;
}

pub fn site_url(scheme: &str, domain: &str) -> String {
    if domain.starts_with("http://") || domain.starts_with("https://") {
        return domain.to_string();
    }
    format!("{}://{}/", scheme.trim_end_matches("://"), domain.trim_matches('/'))
}

pub struct HttpSiteProbe {
    client: reqwest::blocking::Client,
}

impl HttpSiteProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wp-remedy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_config(cfg: &ProbeConfig) -> Result<Self> {
        Self::new(Duration::from_secs(cfg.timeout_secs.max(1)))
    }
}

pub(crate) fn find_failure_marker(body: &str) -> Option<String> {
    FAILURE_MARKERS
        .iter()
        .find(|m| body.contains(**m))
        .map(|m| m.to_string())
}

impl SiteProbe for HttpSiteProbe {
    fn check(&self, url: &str) -> ProbeResult {
        let started = Instant::now();
        let res = self.client.get(url).send();
        let elapsed = started.elapsed().as_millis() as u64;
        let res = match res {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %url, error = %e, "site probe failed");
                return ProbeResult {
                    url: url.to_string(),
                    reachable: false,
                    status: None,
                    response_time_ms: elapsed,
                    failure_marker: None,
                    error: Some(e.to_string()),
                };
            }
        };
        let status = res.status();
        let body = res.text().unwrap_or_default();
        let failure_marker = find_failure_marker(&body);
        debug!(url = %url, status = status.as_u16(), elapsed_ms = elapsed, "site probe");
        ProbeResult {
            url: url.to_string(),
            reachable: status.is_success() || status.is_redirection(),
            status: Some(status.as_u16()),
            response_time_ms: elapsed,
            error: (!status.is_success() && !status.is_redirection())
                .then(|| format!("HTTP status {status}")),
            failure_marker,
        }
    }
}
