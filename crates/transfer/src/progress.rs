use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Default sliding window of the speed estimate.
const SPEED_WINDOW: Duration = Duration::from_secs(5);
const SPEED_MAX_SAMPLES: usize = 100;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time copy of [`TransferProgressState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Plaintext bytes confirmed by storage (upload) or merged (download).
    pub bytes_acknowledged: u64,
    pub cipher_bytes_acknowledged: u64,
    pub slices_created: u32,
    pub slices_completed: u32,
    pub chunk_size: usize,
    pub parallelism: usize,
}

/// Per-transfer counters, shared by reference between pipeline stages.
///
/// All fields live behind one mutex; readers take snapshots.
#[derive(Debug, Default)]
pub struct TransferProgressState {
    inner: Mutex<ProgressSnapshot>,
}

impl TransferProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slice_created(&self) {
        lock(&self.inner).slices_created += 1;
    }

    pub fn slice_completed(&self, plain_bytes: u64, cipher_bytes: u64) {
        let mut s = lock(&self.inner);
        s.slices_completed += 1;
        s.bytes_acknowledged += plain_bytes;
        s.cipher_bytes_acknowledged += cipher_bytes;
    }

    pub fn record_controller(&self, chunk_size: usize, parallelism: usize) {
        let mut s = lock(&self.inner);
        s.chunk_size = chunk_size;
        s.parallelism = parallelism;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *lock(&self.inner)
    }
}

/// One entry of a transfer's progress stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressEvent {
    pub bytes_transferred: u64,
    pub is_error: bool,
    pub bytes_per_second: f64,
}

/// Publishes progress events to any number of watchers.
///
/// Only the latest event is retained; slow subscribers skip intermediate
/// values instead of buffering them.
pub struct ProgressReporter {
    tx: watch::Sender<ProgressEvent>,
    speed: SpeedCalculator,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressEvent::default());
        Self {
            tx,
            speed: SpeedCalculator::new(None, None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> ProgressEvent {
        *self.tx.borrow()
    }

    /// Publishes the cumulative byte count.
    pub fn report(&self, bytes_transferred: u64) {
        if self.tx.borrow().is_error {
            return;
        }
        self.speed.observe(bytes_transferred);
        self.tx.send_replace(ProgressEvent {
            bytes_transferred,
            is_error: false,
            bytes_per_second: self.speed.bytes_per_second(),
        });
    }

    /// Publishes a terminal error event. Later reports are ignored.
    pub fn report_error(&self, bytes_transferred: u64) {
        self.tx.send_replace(ProgressEvent {
            bytes_transferred,
            is_error: true,
            bytes_per_second: 0.0,
        });
    }

    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        self.speed.eta(remaining_bytes)
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

/// Transfer speed over a sliding window of cumulative byte counts.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
    window: Duration,
}

impl SpeedCalculator {
    /// Creates a calculator; defaults are a 5 s window and 100 samples.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: VecDeque::new(),
                max_samples: max_samples.unwrap_or(SPEED_MAX_SAMPLES).max(2),
                window: window.unwrap_or(SPEED_WINDOW),
            }),
        }
    }

    /// Records the cumulative total observed now.
    pub fn observe(&self, total_bytes: u64) {
        self.observe_at(Instant::now(), total_bytes);
    }

    fn observe_at(&self, now: Instant, total_bytes: u64) {
        let mut s = lock(&self.inner);
        s.samples.push_back((now, total_bytes));

        let window = s.window;
        while s
            .samples
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) > window)
        {
            s.samples.pop_front();
        }
        while s.samples.len() > s.max_samples {
            s.samples.pop_front();
        }
    }

    /// Average bytes/second across the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = lock(&self.inner);
        let (Some((t0, b0)), Some((t1, b1))) = (s.samples.front(), s.samples.back()) else {
            return 0.0;
        };
        let elapsed = t1.duration_since(*t0);
        if elapsed.is_zero() {
            return 0.0;
        }
        b1.saturating_sub(*b0) as f64 / elapsed.as_secs_f64()
    }

    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&self) {
        lock(&self.inner).samples.clear();
    }
}
