//! Session controller.
//!
//! A [`Session`] probes the target once, turns the probe's latency band into
//! a one-time weight adjustment, primes the hold pool when a strategy needs
//! it, then runs `workers` sampling loops until the deadline, the request
//! budget, or an external stop. Every outcome lands in the session's own
//! [`MetricsAggregator`]; the final snapshot comes back in a
//! [`SessionReport`].

use crate::aggregator::{MetricsAggregator, ObservationRecord, Summary};
use crate::engine::flood::{FloodDispatcher, FloodSettings, RequestKind};
use crate::engine::pool::{jitter, ConnectionHoldPool, PoolSettings};
use crate::engine::probe::{LatencyBand, TargetProbe};
use crate::engine::target::Target;
use crate::engine::weights::{Strategy, StrategySampler, StrategyWeights};
use crate::error::SessionError;
use crate::payload::{PayloadProvider, SyntheticPayloads};
use loadsmith_common::Config;
use rand::Rng;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HTTP_BURST: RangeInclusive<usize> = 5..=15;
const POST_BURST: RangeInclusive<usize> = 3..=10;
const HOLD_SLOTS: RangeInclusive<usize> = 2..=5;
const HYBRID_UNITS: RangeInclusive<usize> = 5..=15;
const HYBRID_PAUSE: (Duration, Duration) = (Duration::from_millis(10), Duration::from_millis(500));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PoolStatus {
    /// No strategy in play needed held connections.
    Unused,
    Primed { established: usize },
    /// Priming failed; holding was disabled for the session.
    Exhausted { attempted: usize },
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub records: Vec<ObservationRecord>,
    pub summary: Summary,
    /// Weights after the probe adjustment (and pool fallback).
    pub weights: StrategyWeights,
    pub band: LatencyBand,
    pub probe_latency: Duration,
    pub pool_status: PoolStatus,
    pub elapsed: Duration,
    /// Workers still busy when the drain timeout ran out.
    pub workers_aborted: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct WorkerTally {
    slices: usize,
    units: u64,
}

/// Everything a worker loop reads; shared immutably.
struct WorkerContext {
    sampler: StrategySampler,
    flood: FloodDispatcher,
    pool: Arc<ConnectionHoldPool>,
    hold_enabled: bool,
    budget: Option<u64>,
    deadline: Option<Instant>,
    slice_pause: (Duration, Duration),
    running: CancellationToken,
}

pub struct Session {
    config: Config,
    target: Target,
    payloads: Arc<dyn PayloadProvider>,
    aggregator: Arc<MetricsAggregator>,
    running: CancellationToken,
}

impl Session {
    pub fn new(config: Config, payloads: Arc<dyn PayloadProvider>) -> Result<Self, SessionError> {
        config.validate()?;
        let target = Target::parse(&config.target.address)?;
        Ok(Self {
            config,
            target,
            payloads,
            aggregator: Arc::new(MetricsAggregator::new()),
            running: CancellationToken::new(),
        })
    }

    /// Session whose write bodies come from [`SyntheticPayloads`].
    pub fn with_synthetic_payloads(config: Config) -> Result<Self, SessionError> {
        let payloads = SyntheticPayloads::new(&config.target.write_endpoints);
        Self::new(config, Arc::new(payloads))
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Cancelling the returned token stops the session; workers finish their
    /// current slice and exit.
    pub fn stop_handle(&self) -> CancellationToken {
        self.running.clone()
    }

    pub async fn run(self) -> Result<SessionReport, SessionError> {
        let started = Instant::now();
        let cfg = &self.config;

        let probe = TargetProbe::new(self.target.clone(), cfg.target.probe_path.clone())
            .probe()
            .await?;

        let mut weights = StrategyWeights::from_config(&cfg.weights);
        weights.adjust_for(probe.band);
        info!(
            band = ?probe.band,
            http_flood = weights.get(Strategy::HttpFlood),
            post_flood = weights.get(Strategy::PostFlood),
            connection_hold = weights.get(Strategy::ConnectionHold),
            hybrid = weights.get(Strategy::Hybrid),
            "Strategy weights adjusted"
        );

        let deadline = cfg
            .session
            .duration_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let pool = Arc::new(ConnectionHoldPool::new(
            self.target.clone(),
            cfg.target.read_endpoints.clone(),
            PoolSettings::from(&cfg.pool),
            Arc::clone(&self.aggregator),
            &self.running,
            deadline,
        ));

        let mut pool_status = PoolStatus::Unused;
        if weights.get(Strategy::ConnectionHold) > 0.0 || weights.get(Strategy::Hybrid) > 0.0 {
            match pool.prime().await {
                Ok(established) => pool_status = PoolStatus::Primed { established },
                Err(SessionError::PoolExhausted { attempted }) => {
                    weights.set(Strategy::ConnectionHold, 0.0);
                    if weights.total() <= 0.0 {
                        pool.shutdown();
                        return Err(SessionError::PoolExhausted { attempted });
                    }
                    warn!(attempted, "Connection holding disabled for this session");
                    pool_status = PoolStatus::Exhausted { attempted };
                }
                Err(e) => return Err(e),
            }
        }

        let ms = Duration::from_millis;
        let ctx = Arc::new(WorkerContext {
            sampler: StrategySampler::new(&weights)?,
            flood: FloodDispatcher::new(
                self.target.clone(),
                cfg.target.read_endpoints.clone(),
                cfg.target.write_endpoints.clone(),
                FloodSettings::from(&cfg.flood),
                Arc::clone(&self.payloads),
                Arc::clone(&self.aggregator),
                self.running.clone(),
            ),
            pool: Arc::clone(&pool),
            hold_enabled: matches!(pool_status, PoolStatus::Primed { .. }),
            budget: cfg.session.requests_per_worker,
            deadline,
            slice_pause: (ms(cfg.session.slice_pause_ms.0), ms(cfg.session.slice_pause_ms.1)),
            running: self.running.clone(),
        });

        info!(
            target_addr = %self.target,
            workers = cfg.session.workers,
            duration_secs = ?cfg.session.duration_secs,
            requests_per_worker = ?cfg.session.requests_per_worker,
            "Session started"
        );
        let mut workers = JoinSet::new();
        for id in 0..cfg.session.workers {
            let ctx = Arc::clone(&ctx);
            workers.spawn(async move { ctx.run_worker(id).await });
        }

        let mut total = WorkerTally::default();
        let mut absorb = |tally: WorkerTally| {
            total.slices += tally.slices;
            total.units += tally.units;
        };

        let deadline_reached = async {
            match deadline {
                Some(d) => sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_reached);
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(tally)) => absorb(tally),
                    Some(Err(e)) => warn!(error = %e, "Worker task failed"),
                    None => {
                        debug!("All workers finished their budget");
                        break;
                    }
                },
                _ = self.running.cancelled() => {
                    info!("Stop signal received");
                    break;
                }
                _ = &mut deadline_reached => {
                    info!("Session duration elapsed");
                    break;
                }
            }
        }
        self.running.cancel();

        let drain_timeout = Duration::from_secs(cfg.session.drain_timeout_secs);
        let drained = timeout(drain_timeout, async {
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(tally) => absorb(tally),
                    Err(e) => warn!(error = %e, "Worker task failed"),
                }
            }
        })
        .await;
        let workers_aborted = if drained.is_err() {
            let stragglers = workers.len();
            warn!(stragglers, "Workers did not drain in time, aborting");
            workers.shutdown().await;
            stragglers
        } else {
            0
        };

        let closed = pool.shutdown();
        let records = self.aggregator.snapshot();
        let summary = Summary::from_records(&records);
        let elapsed = started.elapsed();
        info!(
            elapsed_secs = elapsed.as_secs_f64(),
            slices = total.slices,
            units = total.units,
            records = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            mean_response_time = summary.mean_response_time,
            pool_closed = closed,
            "Session finished"
        );

        Ok(SessionReport {
            records,
            summary,
            weights,
            band: probe.band,
            probe_latency: probe.latency,
            pool_status,
            elapsed,
            workers_aborted,
        })
    }
}

fn roll(range: RangeInclusive<usize>) -> usize {
    rand::thread_rng().gen_range(range)
}

impl WorkerContext {
    fn out_of_time(&self) -> bool {
        self.running.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn run_worker(&self, id: usize) -> WorkerTally {
        debug!(worker = id, "Worker started");
        let mut tally = WorkerTally::default();

        while !self.out_of_time() {
            let remaining = match self.budget {
                Some(budget) if tally.units >= budget => break,
                Some(budget) => Some(budget - tally.units),
                None => None,
            };

            let strategy = self.sampler.sample(&mut rand::thread_rng());
            tally.units += self.run_slice(id, strategy, remaining).await;
            tally.slices += 1;

            if self.budget.is_some_and(|b| tally.units >= b) {
                break;
            }
            let pause = jitter(self.slice_pause.0, self.slice_pause.1);
            tokio::select! {
                _ = self.running.cancelled() => break,
                _ = sleep(pause) => {},
            }
        }

        debug!(worker = id, slices = tally.slices, units = tally.units, "Worker finished");
        tally
    }

    /// Executes one bounded slice and returns how many units it consumed.
    async fn run_slice(&self, id: usize, strategy: Strategy, remaining: Option<u64>) -> u64 {
        let clip = |n: usize| match remaining {
            Some(r) => n.min(usize::try_from(r).unwrap_or(usize::MAX)),
            None => n,
        };
        debug!(worker = id, strategy = %strategy, "Slice started");

        match strategy {
            Strategy::HttpFlood => {
                let n = clip(roll(HTTP_BURST));
                let burst = self.flood.run_burst(id, n, RequestKind::Read, strategy).await;
                burst.attempted as u64
            }
            Strategy::PostFlood => {
                let n = clip(roll(POST_BURST));
                let burst = self.flood.run_burst(id, n, RequestKind::Write, strategy).await;
                burst.attempted as u64
            }
            Strategy::ConnectionHold => {
                let n = clip(roll(HOLD_SLOTS));
                let held = self.pool.hold(id, n, self.pool.hold_window(), strategy).await;
                debug!(
                    worker = id,
                    granted = held.granted,
                    fragments = held.fragments_sent,
                    replacements = held.replacements,
                    "Hold slice finished"
                );
                n as u64
            }
            Strategy::Hybrid => self.run_hybrid(id, clip(roll(HYBRID_UNITS))).await,
        }
    }

    /// Interleaves single reads, writes and (when the pool is usable) short holds.
    async fn run_hybrid(&self, id: usize, units: usize) -> u64 {
        let choices = if self.hold_enabled { 3 } else { 2 };
        let mut done = 0;
        for i in 0..units {
            if self.out_of_time() {
                break;
            }
            match roll(0..=choices - 1) {
                0 => {
                    self.flood
                        .run_burst(id, 1, RequestKind::Read, Strategy::Hybrid)
                        .await;
                }
                1 => {
                    self.flood
                        .run_burst(id, 1, RequestKind::Write, Strategy::Hybrid)
                        .await;
                }
                _ => {
                    let window = self.pool.hold_window() / 4;
                    self.pool.hold(id, 1, window, Strategy::Hybrid).await;
                }
            }
            done += 1;
            if i + 1 < units {
                tokio::select! {
                    _ = self.running.cancelled() => break,
                    _ = sleep(jitter(HYBRID_PAUSE.0, HYBRID_PAUSE.1)) => {},
                }
            }
        }
        done
    }
}
