// Throughput and ETA estimation for display. Nothing here feeds back into
// transfer decisions.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::state::RunStatus;
use crate::util::human_bytes;

pub const NOT_AVAILABLE: &str = "Not available yet";
pub const DEFAULT_WINDOW: usize = 20;

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    bytes: u64,
    files: u64,
}

/// Windowed moving average over the last `window` samples of the run
/// counters. Sampling happens at the renderer's refresh interval.
#[derive(Debug)]
pub struct ThroughputEstimator {
    window: usize,
    samples: VecDeque<Sample>,
    latest: RunStatus,
}

impl ThroughputEstimator {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self { window, samples: VecDeque::with_capacity(window), latest: RunStatus::default() }
    }

    pub fn sample(&mut self, status: &RunStatus) {
        self.sample_at(Instant::now(), status);
    }

    pub fn sample_at(&mut self, at: Instant, status: &RunStatus) {
        if let Some(last) = self.samples.back()
            && (status.transferred_size_bytes < last.bytes || at < last.at)
        {
            // counters were reset or restored; old samples no longer apply
            self.samples.clear();
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            at,
            bytes: status.transferred_size_bytes,
            files: status.transferred_files,
        });
        self.latest = *status;
    }

    fn span(&self) -> Option<(Sample, Sample, f64)> {
        let first = *self.samples.front()?;
        let last = *self.samples.back()?;
        let secs = last.at.duration_since(first.at).as_secs_f64();
        if self.samples.len() < 2 || secs <= 0.0 {
            return None;
        }
        Some((first, last, secs))
    }

    pub fn bytes_per_sec(&self) -> Option<f64> {
        let (first, last, secs) = self.span()?;
        Some((last.bytes - first.bytes) as f64 / secs)
    }

    pub fn files_per_sec(&self) -> Option<f64> {
        let (first, last, secs) = self.span()?;
        Some(last.files.saturating_sub(first.files) as f64 / secs)
    }

    /// Remaining time at the current rate. `None` while the total is unknown
    /// or nothing has moved yet.
    pub fn eta(&self) -> Option<Duration> {
        if self.latest.total_size_bytes == 0 {
            return None;
        }
        let remaining = self.latest.remaining_bytes();
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let rate = self.bytes_per_sec()?;
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn speed_string(&self) -> String {
        if self.latest.total_size_bytes == 0 {
            return NOT_AVAILABLE.to_string();
        }
        match self.bytes_per_sec() {
            Some(rate) => format!("{}/s", human_bytes(rate.round() as u64)),
            None => NOT_AVAILABLE.to_string(),
        }
    }

    pub fn eta_string(&self) -> String {
        match self.eta() {
            Some(d) if d.is_zero() => "Done".to_string(),
            Some(d) => format!("{} remaining", format_duration(d)),
            None => NOT_AVAILABLE.to_string(),
        }
    }
}

/// Compact `1h 02m 03s` style rendering.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
