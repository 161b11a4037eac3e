//! Round-trip latency sampling.
//!
//! The monitor sends a ping on a fixed interval and times the pong that
//! comes back. Only one ping is tracked at a time: a pong without a pending
//! ping is ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Default ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest accepted ping interval
pub const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of samples averaged
pub const DEFAULT_WINDOW_SIZE: usize = 4;

/// Something that can put a ping on the wire
pub trait PingSender: Send + Sync + 'static {
    /// Send one ping
    fn send_ping(&self);
}

/// Bounded FIFO of round-trip samples in milliseconds
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    /// Create an empty window holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest when full
    pub fn push(&mut self, round_trip_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(round_trip_ms);
    }

    /// Integer mean of the current samples, 0 when empty
    pub fn average_ms(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was recorded yet
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
struct MonitorState {
    window: LatencyWindow,
    pending_since: Option<Instant>,
}

fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodic ping sender and round-trip tracker
pub struct LatencyMonitor {
    interval: Duration,
    state: Arc<Mutex<MonitorState>>,
    sender: Arc<dyn PingSender>,
    task: Option<JoinHandle<()>>,
}

impl LatencyMonitor {
    /// Create a stopped monitor
    ///
    /// `interval` is raised to [`MIN_PING_INTERVAL`] if shorter.
    pub fn new(sender: Arc<dyn PingSender>, interval: Duration, window_size: usize) -> Self {
        Self {
            interval: interval.max(MIN_PING_INTERVAL),
            state: Arc::new(Mutex::new(MonitorState {
                window: LatencyWindow::new(window_size),
                pending_since: None,
            })),
            sender,
            task: None,
        }
    }

    /// Start pinging; no-op if already running
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        debug!(interval = ?self.interval, "Latency monitor started");
        let period = self.interval;
        let state = self.state.clone();
        let sender = self.sender.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                lock(&state).pending_since = Some(Instant::now());
                trace!("Sending ping");
                sender.send_ping();
            }
        }));
    }

    /// Stop pinging; samples are kept
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Latency monitor stopped");
        }
    }

    /// Stop and forget any pending ping
    pub fn destroy(&mut self) {
        self.stop();
        lock(&self.state).pending_since = None;
    }

    /// Whether the ping task is running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Record the pong for the pending ping
    pub fn record_pong(&self) {
        let mut state = lock(&self.state);
        match state.pending_since.take() {
            Some(sent_at) => {
                let round_trip = u64::try_from(sent_at.elapsed().as_millis()).unwrap_or(u64::MAX);
                state.window.push(round_trip);
                debug!(round_trip_ms = round_trip, average_ms = state.window.average_ms(), "Pong received");
            }
            None => trace!("Pong without pending ping ignored"),
        }
    }

    /// Mean round trip over the window in milliseconds, 0 when empty
    pub fn average_round_trip_ms(&self) -> u64 {
        lock(&self.state).window.average_ms()
    }

    /// Number of samples in the window
    pub fn sample_count(&self) -> usize {
        lock(&self.state).window.len()
    }

    /// Ping interval
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for LatencyMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
