//! Throughput measurement and progress rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Shortest span a rate is computed over, so the first chunks of a transfer
/// don't report absurd speeds.
const MIN_RATE_SPAN: Duration = Duration::from_millis(50);

/// Sliding-window throughput meter.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    /// Create a meter averaging over `window`
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record `bytes` moved at `now`
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    /// Bytes per second over the window ending at `now`
    pub fn bytes_per_sec(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let Some(&(oldest, _)) = self.samples.front() else {
            return 0.0;
        };
        let total: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        let span = now.saturating_duration_since(oldest).max(MIN_RATE_SPAN);
        total as f64 / span.as_secs_f64()
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Decides when a progress update is worth emitting.
///
/// Emits when the integer percentage changes or when `interval` has elapsed
/// since the last emission, and always when forced (completion).
#[derive(Debug, Clone)]
pub struct ProgressGate {
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl ProgressGate {
    /// Create a gate with the given minimum spacing
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    /// Whether to emit an update for `percent` at `now`
    pub fn should_emit(&mut self, now: Instant, percent: u8, force: bool) -> bool {
        let percent_changed = self.last_percent != Some(percent);
        let interval_elapsed = self
            .last_emit
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);

        if force || percent_changed || interval_elapsed {
            self.last_emit = Some(now);
            self.last_percent = Some(percent);
            true
        } else {
            false
        }
    }
}

/// Computed progress figures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Integer percentage
    pub percent: u8,
    /// Sliding-window throughput
    pub bytes_per_sec: f64,
    /// Time remaining at the current rate
    pub eta: Option<Duration>,
}

/// Meter plus gate for one stream of bytes.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    meter: SpeedMeter,
    gate: ProgressGate,
}

impl ProgressTracker {
    /// Create a tracker
    #[must_use]
    pub fn new(window: Duration, interval: Duration) -> Self {
        Self {
            meter: SpeedMeter::new(window),
            gate: ProgressGate::new(interval),
        }
    }

    /// Record bytes moved just now
    pub fn record(&mut self, bytes: u64) {
        self.meter.record(Instant::now(), bytes);
    }

    /// Progress figures for `done` of `total`, if an update is due
    pub fn sample(&mut self, done: u64, total: u64, force: bool) -> Option<ProgressSample> {
        let now = Instant::now();
        let percent = percent(done, total);
        if !self.gate.should_emit(now, percent, force) {
            return None;
        }

        let bytes_per_sec = self.meter.bytes_per_sec(now);
        let remaining = total.saturating_sub(done);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if bytes_per_sec > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / bytes_per_sec))
        } else {
            None
        };

        Some(ProgressSample {
            percent,
            bytes_per_sec,
            eta,
        })
    }

    /// Forget measured throughput
    pub fn reset(&mut self) {
        self.meter.reset();
    }
}

/// Integer percentage of `done` over `total`; an empty total is complete.
#[must_use]
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

/// Human-readable throughput
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{bytes_per_sec:.2} B/s")
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.2} KiB/s", bytes_per_sec / 1024.0)
    } else if bytes_per_sec < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MiB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GiB/s", bytes_per_sec / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Human-readable time remaining
#[must_use]
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(duration) => {
            let seconds = duration.as_secs();
            if seconds < 60 {
                format!("{seconds}s")
            } else if seconds < 3600 {
                format!("{}m {}s", seconds / 60, seconds % 60)
            } else {
                format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
            }
        }
        None => "Calculating...".to_string(),
    }
}
