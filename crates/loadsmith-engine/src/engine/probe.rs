//! Pre-run probe: one timed request that classifies the target's latency.

use crate::engine::target::Target;
use crate::error::SessionError;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, CONNECTION, SERVER};
use hyper::{Body, Client, Uri};
use serde::Serialize;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

/// Below this the target is considered fast.
pub const FAST_THRESHOLD: Duration = Duration::from_millis(100);
/// Above this the target is considered slow.
pub const SLOW_THRESHOLD: Duration = Duration::from_secs(1);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyBand {
    Fast,
    Normal,
    Slow,
}

impl LatencyBand {
    pub fn classify(latency: Duration) -> Self {
        if latency > SLOW_THRESHOLD {
            LatencyBand::Slow
        } else if latency < FAST_THRESHOLD {
            LatencyBand::Fast
        } else {
            LatencyBand::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: u16,
    pub latency: Duration,
    pub band: LatencyBand,
}

/// Single diagnostic request issued before any load starts.
pub struct TargetProbe {
    client: Client<HttpConnector, Body>,
    target: Target,
    path: String,
    timeout: Duration,
}

impl TargetProbe {
    pub fn new(target: Target, path: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            target,
            path: path.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Any response, whatever its status, counts as reachable.
    pub async fn probe(&self) -> Result<ProbeOutcome, SessionError> {
        let url = self.target.url_for(&self.path);
        let unreachable = |reason: String| SessionError::ProbeUnreachable {
            target: self.target.authority(),
            reason,
        };
        let uri: Uri = url
            .parse()
            .map_err(|_| SessionError::InvalidTarget(url.clone()))?;

        info!(target_addr = %self.target, path = %self.path, "Probing target");
        let start = Instant::now();
        let response = match timeout(self.timeout, self.client.get(uri)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(target_addr = %self.target, error = %e, "Probe failed");
                return Err(unreachable(e.to_string()));
            }
            Err(_) => {
                warn!(target_addr = %self.target, "Probe timed out");
                return Err(unreachable(format!(
                    "no response within {}ms",
                    self.timeout.as_millis()
                )));
            }
        };
        let latency = start.elapsed();
        let band = LatencyBand::classify(latency);

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string()
        };
        info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis() as u64,
            band = ?band,
            server = %header(SERVER),
            connection = %header(CONNECTION),
            "Target responded to probe"
        );

        Ok(ProbeOutcome {
            status: response.status().as_u16(),
            latency,
            band,
        })
    }
}
