//! Complete request/response load.
//!
//! A burst is `count` sequential round trips, reads (`GET`) or writes (`POST`
//! with a JSON body), separated by a jittered delay. Every round trip yields
//! exactly one observation; nothing is retried.

use crate::aggregator::{MetricsAggregator, ObservationRecord, ERROR_STATUS_THRESHOLD};
use crate::engine::pool::jitter;
use crate::engine::target::Target;
use crate::engine::weights::Strategy;
use crate::error::FailureKind;
use crate::metrics;
use crate::payload::PayloadProvider;
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use loadsmith_common::FloodConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `GET` against a read endpoint.
    Read,
    /// `POST` with a JSON body against a write endpoint.
    Write,
}

#[derive(Debug, Clone)]
pub struct FloodSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_delay: (Duration, Duration),
    pub write_delay: (Duration, Duration),
    pub query_probability: f64,
    pub bulk_probability: f64,
}

impl From<&FloodConfig> for FloodSettings {
    fn from(cfg: &FloodConfig) -> Self {
        let ms = Duration::from_millis;
        Self {
            read_timeout: ms(cfg.read_timeout_ms),
            write_timeout: ms(cfg.write_timeout_ms),
            read_delay: (ms(cfg.read_delay_ms.0), ms(cfg.read_delay_ms.1)),
            write_delay: (ms(cfg.write_delay_ms.0), ms(cfg.write_delay_ms.1)),
            query_probability: cfg.query_probability,
            bulk_probability: cfg.bulk_probability,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstTally {
    pub attempted: usize,
    pub succeeded: usize,
}

impl std::ops::AddAssign for BurstTally {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
    }
}

/// Issues complete request/response round trips and records each one.
pub struct FloodDispatcher {
    client: Client<HttpConnector, Body>,
    target: Target,
    read_endpoints: Vec<String>,
    write_endpoints: Vec<String>,
    settings: FloodSettings,
    payloads: Arc<dyn PayloadProvider>,
    aggregator: Arc<MetricsAggregator>,
    running: CancellationToken,
}

impl FloodDispatcher {
    pub fn new(
        target: Target,
        read_endpoints: Vec<String>,
        write_endpoints: Vec<String>,
        settings: FloodSettings,
        payloads: Arc<dyn PayloadProvider>,
        aggregator: Arc<MetricsAggregator>,
        running: CancellationToken,
    ) -> Self {
        Self {
            client: Client::new(),
            target,
            read_endpoints,
            write_endpoints,
            settings,
            payloads,
            aggregator,
            running,
        }
    }

    /// Runs `count` round trips of `kind`, stopping early once the session
    /// stops. Failures are recorded and never retried.
    pub async fn run_burst(
        &self,
        worker_id: usize,
        count: usize,
        kind: RequestKind,
        strategy: Strategy,
    ) -> BurstTally {
        let mut tally = BurstTally::default();
        for i in 0..count {
            if self.running.is_cancelled() {
                break;
            }
            tally.attempted += 1;
            if self.round_trip(worker_id, kind, strategy).await {
                tally.succeeded += 1;
            }
            if i + 1 < count {
                let (min, max) = match kind {
                    RequestKind::Read => self.settings.read_delay,
                    RequestKind::Write => self.settings.write_delay,
                };
                tokio::select! {
                    _ = self.running.cancelled() => break,
                    _ = sleep(jitter(min, max)) => {},
                }
            }
        }
        tally
    }

    /// One request, one record. Returns whether it succeeded.
    async fn round_trip(&self, worker_id: usize, kind: RequestKind, strategy: Strategy) -> bool {
        let (endpoint, request, limit) = match self.build_request(kind) {
            Ok(parts) => parts,
            Err((endpoint, failure)) => {
                self.record_failure(Duration::ZERO, &failure, 0, strategy, &endpoint);
                return false;
            }
        };
        metrics::REQUESTS_SENT
            .with_label_values(&[strategy.tag()])
            .inc();

        let start = Instant::now();
        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<(StatusCode, usize), hyper::Error>((status, body.len()))
        };
        let result = match timeout(limit, exchange).await {
            Ok(Ok((status, size))) if status.as_u16() < ERROR_STATUS_THRESHOLD => {
                Ok((status, size))
            }
            Ok(Ok((status, size))) => Err((FailureKind::Application(status.as_u16()), size)),
            Ok(Err(e)) => Err((FailureKind::Transport(e.to_string()), 0)),
            Err(_) => Err((FailureKind::Timeout, 0)),
        };
        let elapsed = start.elapsed();

        match result {
            Ok((status, size)) => {
                trace!(
                    worker = worker_id,
                    status = status.as_u16(),
                    endpoint = %endpoint,
                    "Round trip ok"
                );
                self.aggregator.add(ObservationRecord::success(
                    elapsed,
                    status.as_u16(),
                    size as u64,
                    strategy.tag(),
                    Some(&endpoint),
                ));
                true
            }
            Err((failure, size)) => {
                debug!(
                    worker = worker_id,
                    endpoint = %endpoint,
                    error = %failure.describe(),
                    "Round trip failed"
                );
                self.record_failure(elapsed, &failure, size as u64, strategy, &endpoint);
                false
            }
        }
    }

    fn record_failure(
        &self,
        elapsed: Duration,
        failure: &FailureKind,
        size: u64,
        strategy: Strategy,
        endpoint: &str,
    ) {
        metrics::REQUEST_FAILURES
            .with_label_values(&[strategy.tag()])
            .inc();
        self.aggregator.add(
            ObservationRecord::failure(elapsed, failure, strategy.tag(), Some(endpoint))
                .with_size(size),
        );
    }

    #[allow(clippy::type_complexity)]
    fn build_request(
        &self,
        kind: RequestKind,
    ) -> Result<(String, Request<Body>, Duration), (String, FailureKind)> {
        let mut rng = rand::thread_rng();
        let endpoints = match kind {
            RequestKind::Read => &self.read_endpoints,
            RequestKind::Write => &self.write_endpoints,
        };
        let endpoint = endpoints
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| "/".to_string());

        let mut builder = Request::builder();
        for (name, value) in self.payloads.random_headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let built = match kind {
            RequestKind::Read => {
                let mut url = self.target.url_for(&endpoint);
                if rng.gen_bool(self.settings.query_probability.clamp(0.0, 1.0)) {
                    let search = "x".repeat(rng.gen_range(10..=100));
                    url.push_str(&format!(
                        "?page={}&size={}&search={}",
                        rng.gen_range(1..=100),
                        rng.gen_range(1..=1000),
                        search
                    ));
                }
                builder
                    .method(Method::GET)
                    .uri(url)
                    .body(Body::empty())
                    .map(|req| (req, self.settings.read_timeout))
            }
            RequestKind::Write => {
                let mut payload = self.payloads.payload_for(&endpoint);
                if rng.gen_bool(self.settings.bulk_probability.clamp(0.0, 1.0)) {
                    inflate(&mut payload, &mut rng);
                }
                let body = match serde_json::to_vec(&payload) {
                    Ok(b) => Bytes::from(b),
                    Err(e) => return Err((endpoint, FailureKind::Transport(e.to_string()))),
                };
                builder
                    .method(Method::POST)
                    .uri(self.target.url_for(&endpoint))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .map(|req| (req, self.settings.write_timeout))
            }
        };

        match built {
            Ok((req, limit)) => Ok((endpoint, req, limit)),
            Err(e) => Err((endpoint, FailureKind::Transport(format!("invalid request: {}", e)))),
        }
    }
}

/// Pads a JSON object body with a bulk string and an item list.
fn inflate(payload: &mut Value, rng: &mut impl Rng) {
    if let Value::Object(map) = payload {
        let bulk = "x".repeat(rng.gen_range(1000..=10_000));
        let items: Vec<String> = (0..rng.gen_range(10..=100))
            .map(|j| format!("item_{}", j))
            .collect();
        map.insert("bulkData".to_string(), Value::String(bulk));
        map.insert("arrays".to_string(), json!(items));
    }
}
