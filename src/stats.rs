use std::{
    io::Write,
    time::{Duration, Instant},
};

use crate::util;

/// Minimum time between two speed samples.
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Instantaneous transfer rate over the bytes received since the previous
/// sample.
pub struct SpeedSampler {
    last_time: Instant,
    last_bytes: u64,
}

impl SpeedSampler {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            last_time: now,
            last_bytes: 0,
        }
    }

    /// Returns bytes per second once at least [`SPEED_SAMPLE_INTERVAL`] has
    /// passed since the previous sample.
    pub fn sample(&mut self, received: u64) -> Option<f64> {
        self.sample_at(Instant::now(), received)
    }

    fn sample_at(&mut self, now: Instant, received: u64) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.last_time);
        if elapsed < SPEED_SAMPLE_INTERVAL {
            return None;
        }

        let rate = received.saturating_sub(self.last_bytes) as f64 / elapsed.as_secs_f64();
        self.last_time = now;
        self.last_bytes = received;
        Some(rate)
    }
}

impl Default for SpeedSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress of the stream currently being downloaded, as shown on a terminal.
#[derive(Default)]
pub struct TransferStats {
    pub label: String,
    pub received: u64,
    pub total: u64,
    pub bytes_per_sec: f64,
}

impl TransferStats {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.received as f64 * 100.0 / self.total as f64)
    }

    pub fn line(&self) -> String {
        let percent = self
            .percent()
            .map(|p| format!(" {:.1}%", p))
            .unwrap_or_default();
        format!(
            "{}: {} of {}{} ({})",
            self.label,
            util::format_bytes(self.received),
            if self.total == 0 {
                "?".to_string()
            } else {
                util::format_bytes(self.total)
            },
            percent,
            util::format_rate(self.bytes_per_sec),
        )
    }

    pub fn print(&self) {
        print!("\x1b[2K\r{}", self.line());
        let _ = std::io::stdout().lock().flush();
    }
}
