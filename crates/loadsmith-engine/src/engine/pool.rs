//! Connection-hold pool: slow, never-completed HTTP requests.
//!
//! Each slot is a TCP connection that received a request line and a `Host`
//! header but never the terminating blank line. While a slot is held, one
//! more header line is trickled out per jittered interval so the peer keeps
//! waiting for the rest of the request.
//!
//! ## Slot lifecycle
//! `Init → Connecting → Established → Streaming → Closed`
//!
//! ## Capacity
//! The pool owns a semaphore with `target_size` permits. A slot exists only
//! while its task (or the idle list) holds a permit, so the number of open
//! connections never exceeds `target_size`. A slot that dies while its hold
//! window is still open is replaced by the same task after a short random
//! delay.
//!
//! ## Keep-alive
//! Once primed, the pool runs its own upkeep loop until [`ConnectionHoldPool::shutdown`].
//! Every fragment interval it writes one fragment to each parked slot, drops
//! the slots whose write fails and reopens connections for every free permit.
//! Upkeep traffic is counted in the Prometheus metrics, not in the session's
//! observations.

use crate::aggregator::{MetricsAggregator, ObservationRecord};
use crate::engine::target::Target;
use crate::engine::weights::Strategy;
use crate::error::{FailureKind, SessionError};
use crate::metrics;
use loadsmith_common::PoolConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Endpoint recorded for every hold-pool observation.
pub const HOLD_ENDPOINT: &str = "slow_connection";

const HEADER_FRAGMENTS: &[&str] = &[
    "User-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    "Accept-Language: en-us,en;q=0.5",
    "Accept-Encoding: gzip,deflate",
    "Accept-Charset: ISO-8859-1,utf-8;q=0.7,*;q=0.7",
    "Cache-Control: no-cache",
    "Connection: keep-alive",
];

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub target_size: usize,
    pub connect_timeout: Duration,
    pub fragment_interval: (Duration, Duration),
    pub hold_window: Duration,
    pub replenish_delay: (Duration, Duration),
}

impl From<&PoolConfig> for PoolSettings {
    fn from(cfg: &PoolConfig) -> Self {
        let ms = Duration::from_millis;
        Self {
            target_size: cfg.target_size,
            connect_timeout: ms(cfg.connect_timeout_ms),
            fragment_interval: (ms(cfg.fragment_interval_ms.0), ms(cfg.fragment_interval_ms.1)),
            hold_window: Duration::from_secs(cfg.hold_window_secs),
            replenish_delay: (ms(cfg.replenish_delay_ms.0), ms(cfg.replenish_delay_ms.1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Init,
    Connecting,
    Established,
    Streaming,
    Closed,
}

/// Increments the live-slot count for as long as a connection is open.
struct SlotGuard {
    live: Arc<AtomicUsize>,
}

impl SlotGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        metrics::HELD_CONNECTIONS.inc();
        Self { live }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        metrics::HELD_CONNECTIONS.dec();
    }
}

/// One held connection. Owned by exactly one pool task or by the idle list.
pub struct ConnectionSlot {
    id: u64,
    stream: TcpStream,
    header_index: usize,
    created: Instant,
    state: SlotState,
    _guard: SlotGuard,
}

impl ConnectionSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn headers_sent(&self) -> usize {
        self.header_index
    }

    /// Non-blocking fragment write used while the slot is parked. `Ok(false)`
    /// means the socket was not writable and nothing was sent.
    fn try_send_fragment(&mut self) -> io::Result<bool> {
        let fragment = fragment_at(self.header_index);
        match self.stream.try_write(fragment.as_bytes()) {
            Ok(n) if n == fragment.len() => {
                self.header_index += 1;
                metrics::FRAGMENTS_SENT.inc();
                Ok(true)
            }
            Ok(_) => Err(io::Error::new(io::ErrorKind::WriteZero, "send buffer full")),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn close(mut self) {
        self.state = SlotState::Closed;
        debug!(slot = self.id, headers = self.header_index, "Hold slot closed");
    }
}

/// Outcome of one `hold` slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoldTally {
    /// Slots the slice was granted (parked or newly permitted).
    pub granted: usize,
    pub fragments_sent: usize,
    pub replacements: usize,
}

impl std::ops::AddAssign for HoldTally {
    fn add_assign(&mut self, other: Self) {
        self.granted += other.granted;
        self.fragments_sent += other.fragments_sent;
        self.replacements += other.replacements;
    }
}

enum Lease {
    Parked(ConnectionSlot, OwnedSemaphorePermit),
    Fresh(OwnedSemaphorePermit),
}

pub struct ConnectionHoldPool {
    target: Target,
    paths: Vec<String>,
    settings: PoolSettings,
    aggregator: Arc<MetricsAggregator>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<(ConnectionSlot, OwnedSemaphorePermit)>>,
    live: Arc<AtomicUsize>,
    next_id: AtomicU64,
    deadline: Option<Instant>,
    shutdown: CancellationToken,
    keeping_alive: AtomicBool,
}

impl ConnectionHoldPool {
    /// `running` is the session signal; cancelling it also stops the pool.
    pub fn new(
        target: Target,
        paths: Vec<String>,
        settings: PoolSettings,
        aggregator: Arc<MetricsAggregator>,
        running: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        let paths = if paths.is_empty() {
            vec!["/".to_string()]
        } else {
            paths
        };
        Self {
            target,
            paths,
            permits: Arc::new(Semaphore::new(settings.target_size)),
            settings,
            aggregator,
            idle: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(0),
            deadline,
            shutdown: running.child_token(),
            keeping_alive: AtomicBool::new(false),
        }
    }

    pub fn target_size(&self) -> usize {
        self.settings.target_size
    }

    pub fn hold_window(&self) -> Duration {
        self.settings.hold_window
    }

    /// Connections currently open, parked or streaming.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.lock_idle().len()
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<(ConnectionSlot, OwnedSemaphorePermit)>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Fills the pool up to `target_size` and starts the keep-alive loop.
    /// Established slots are parked for later `hold` slices; failed attempts
    /// are recorded.
    pub async fn prime(self: &Arc<Self>) -> Result<usize, SessionError> {
        let (attempted, established) = self.fill(Some(Strategy::ConnectionHold)).await;
        if established == 0 {
            warn!(target_addr = %self.target, attempted, "Hold pool could not open any connection");
            return Err(SessionError::PoolExhausted { attempted });
        }
        info!(target_addr = %self.target, established, attempted, "Hold pool primed");
        self.start_keep_alive();
        Ok(established)
    }

    /// Opens a slot for every free permit and parks the ones that connect.
    /// Returns `(attempted, established)`.
    async fn fill(self: &Arc<Self>, strategy: Option<Strategy>) -> (usize, usize) {
        let mut attempts = JoinSet::new();
        while !self.closing() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let pool = Arc::clone(self);
            attempts.spawn(async move {
                if !pool.pause(pool.settings.replenish_delay).await {
                    return None;
                }
                pool.open_slot(strategy)
                    .await
                    .ok()
                    .map(|slot| (slot, permit))
            });
        }
        let attempted = attempts.len();

        let mut established = 0;
        while let Some(res) = attempts.join_next().await {
            if let Ok(Some(entry)) = res {
                established += 1;
                self.park(entry);
            }
        }
        (attempted, established)
    }

    fn start_keep_alive(self: &Arc<Self>) {
        if self.keeping_alive.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.keep_alive().await });
    }

    async fn keep_alive(self: Arc<Self>) {
        debug!(target_addr = %self.target, "Hold pool keep-alive started");
        while self.pause(self.settings.fragment_interval).await {
            let lost = self.refresh_idle();
            let (attempted, established) = self.fill(None).await;
            if lost > 0 || attempted > 0 {
                debug!(
                    lost,
                    attempted,
                    established,
                    live = self.live(),
                    "Hold pool replenished"
                );
            }
        }
        debug!(target_addr = %self.target, "Hold pool keep-alive stopped");
    }

    /// Trickles one fragment into every parked slot. Slots whose write fails
    /// are closed and their permits released.
    fn refresh_idle(&self) -> usize {
        let mut idle = self.lock_idle();
        let parked = std::mem::take(&mut *idle);
        let mut lost = 0;
        for (mut slot, permit) in parked {
            match slot.try_send_fragment() {
                Ok(_) => idle.push((slot, permit)),
                Err(e) => {
                    debug!(slot = slot.id, error = %e, "Parked slot lost");
                    slot.close();
                    lost += 1;
                }
            }
        }
        lost
    }

    /// Keeps up to `count` slots streaming for `window` (never past the
    /// session deadline). Parked slots are reused first; the request is
    /// trimmed when the pool is at capacity.
    pub async fn hold(
        self: &Arc<Self>,
        worker_id: usize,
        count: usize,
        window: Duration,
        strategy: Strategy,
    ) -> HoldTally {
        let mut until = Instant::now() + window;
        if let Some(deadline) = self.deadline {
            until = until.min(deadline);
        }

        let mut leases = Vec::with_capacity(count);
        {
            let mut idle = self.lock_idle();
            while leases.len() < count {
                match idle.pop() {
                    Some((slot, permit)) => leases.push(Lease::Parked(slot, permit)),
                    None => break,
                }
            }
        }
        while leases.len() < count {
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => leases.push(Lease::Fresh(permit)),
                Err(_) => break,
            }
        }
        if leases.is_empty() {
            debug!(worker = worker_id, "Hold pool at capacity, nothing to hold");
            return HoldTally::default();
        }

        let mut tally = HoldTally {
            granted: leases.len(),
            ..HoldTally::default()
        };
        debug!(worker = worker_id, slots = tally.granted, strategy = %strategy, "Holding connections");

        let mut tasks = JoinSet::new();
        for lease in leases {
            let pool = Arc::clone(self);
            tasks.spawn(async move { pool.run_slot(lease, until, strategy).await });
        }
        while let Some(res) = tasks.join_next().await {
            if let Ok(t) = res {
                tally += t;
            }
        }
        tally
    }

    /// Closes every parked slot and stops all streaming tasks.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let drained: Vec<_> = self.lock_idle().drain(..).collect();
        let closed = drained.len();
        for (slot, _permit) in drained {
            slot.close();
        }
        info!(closed, "Hold pool shut down");
        closed
    }

    async fn run_slot(&self, lease: Lease, until: Instant, strategy: Strategy) -> HoldTally {
        let (mut current, permit) = match lease {
            Lease::Parked(slot, permit) => (Some(slot), permit),
            Lease::Fresh(permit) => (None, permit),
        };
        let mut tally = HoldTally::default();
        let mut opened_any = current.is_some();

        while !self.closing() && Instant::now() < until {
            let mut slot = match current.take() {
                Some(slot) => slot,
                None => {
                    if !self.pause(self.settings.replenish_delay).await {
                        break;
                    }
                    match self.open_slot(Some(strategy)).await {
                        Ok(slot) => {
                            if opened_any {
                                tally.replacements += 1;
                            }
                            opened_any = true;
                            slot
                        }
                        Err(_) => continue,
                    }
                }
            };

            match self.stream_slot(&mut slot, until, strategy, &mut tally).await {
                Ok(()) => {
                    if self.closing() {
                        slot.close();
                    } else {
                        self.park((slot, permit));
                    }
                    return tally;
                }
                Err(_) => slot.close(),
            }
        }
        if let Some(slot) = current {
            slot.close();
        }
        tally
    }

    /// Returns `false` when the pool shut down during the pause.
    async fn pause(&self, (min, max): (Duration, Duration)) -> bool {
        let delay = jitter(min, max);
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    fn park(&self, (mut slot, permit): (ConnectionSlot, OwnedSemaphorePermit)) {
        let mut idle = self.lock_idle();
        if self.closing() {
            drop(idle);
            slot.close();
            return;
        }
        slot.state = SlotState::Established;
        idle.push((slot, permit));
    }

    /// Connects and sends the request preamble. Failures become observations
    /// only when `strategy` is set; upkeep reconnects pass `None`.
    async fn open_slot(&self, strategy: Option<Strategy>) -> Result<ConnectionSlot, FailureKind> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let authority = self.target.authority();

        debug!(slot = id, target_addr = %authority, "Opening hold slot");
        let connect = TcpStream::connect(&authority);
        let stream = match timeout(self.settings.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let failure = FailureKind::Transport(e.to_string());
                return Err(self.connect_failed(start, failure, strategy));
            }
            Err(_) => return Err(self.connect_failed(start, FailureKind::Timeout, strategy)),
        };

        let mut slot = ConnectionSlot {
            id,
            stream,
            header_index: 0,
            created: Instant::now(),
            state: SlotState::Connecting,
            _guard: SlotGuard::new(Arc::clone(&self.live)),
        };

        let path = self
            .paths
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "/".to_string());
        let preamble = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, authority);
        match timeout(
            self.settings.connect_timeout,
            slot.stream.write_all(preamble.as_bytes()),
        )
        .await
        {
            Ok(Ok(())) => {
                slot.state = SlotState::Established;
                debug!(slot = id, path = %path, "Hold slot established");
                Ok(slot)
            }
            Ok(Err(e)) => {
                let failure = FailureKind::Transport(e.to_string());
                slot.close();
                Err(self.connect_failed(start, failure, strategy))
            }
            Err(_) => {
                slot.close();
                Err(self.connect_failed(start, FailureKind::Timeout, strategy))
            }
        }
    }

    fn connect_failed(
        &self,
        start: Instant,
        failure: FailureKind,
        strategy: Option<Strategy>,
    ) -> FailureKind {
        metrics::CONNECT_FAILURES.inc();
        debug!(target_addr = %self.target, error = %failure.describe(), "Hold connect failed");
        if let Some(strategy) = strategy {
            self.aggregator.add(ObservationRecord::failure(
                start.elapsed(),
                &failure,
                strategy.tag(),
                Some(HOLD_ENDPOINT),
            ));
        }
        failure
    }

    /// Trickles header fragments until `until`, shutdown, or a send failure.
    async fn stream_slot(
        &self,
        slot: &mut ConnectionSlot,
        until: Instant,
        strategy: Strategy,
        tally: &mut HoldTally,
    ) -> Result<(), FailureKind> {
        slot.state = SlotState::Streaming;
        loop {
            let (min, max) = self.settings.fragment_interval;
            let wake = Instant::now() + jitter(min, max);
            if wake >= until {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {},
                    _ = tokio::time::sleep_until(until) => {},
                }
                return Ok(());
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(wake) => {},
            }

            let fragment = fragment_at(slot.header_index);
            slot.header_index += 1;

            match timeout(
                self.settings.connect_timeout,
                slot.stream.write_all(fragment.as_bytes()),
            )
            .await
            {
                Ok(Ok(())) => {
                    metrics::FRAGMENTS_SENT.inc();
                    tally.fragments_sent += 1;
                    self.aggregator.add(ObservationRecord::success(
                        slot.created.elapsed(),
                        200,
                        fragment.len() as u64,
                        strategy.tag(),
                        Some(HOLD_ENDPOINT),
                    ));
                }
                Ok(Err(e)) => {
                    let failure = FailureKind::Transport(e.to_string());
                    return Err(self.send_failed(slot, failure, strategy));
                }
                Err(_) => return Err(self.send_failed(slot, FailureKind::Timeout, strategy)),
            }
        }
    }

    fn send_failed(
        &self,
        slot: &ConnectionSlot,
        failure: FailureKind,
        strategy: Strategy,
    ) -> FailureKind {
        debug!(slot = slot.id, error = %failure.describe(), "Hold slot lost");
        self.aggregator.add(ObservationRecord::failure(
            slot.created.elapsed(),
            &failure,
            strategy.tag(),
            Some(HOLD_ENDPOINT),
        ));
        failure
    }
}

fn fragment_at(index: usize) -> String {
    format!("{}\r\n", HEADER_FRAGMENTS[index % HEADER_FRAGMENTS.len()])
}

pub(crate) fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
