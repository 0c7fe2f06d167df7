//! Throughput metering and auto-parallelism
//!
//! The scheduler feeds observed bytes/sec samples into a bounded window and
//! derives its degree of parallelism from the mean:
//!
//! `auto = clamp(cpu_count * throughput_MiB_per_s, min, floor(cpu_count * factor))`
//!
//! With fewer than `min_samples` observations the meter assumes 1 MiB/s so a
//! cold scheduler starts conservatively instead of at the floor.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

const MIB: f64 = 1024.0 * 1024.0;

/// Tuning constants for the auto-parallelism formula. All load-bearing values
/// are exposed here rather than hidden in the implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelismHints {
    /// Lower bound for the derived degree of parallelism.
    pub min_parallelism: usize,
    /// Upper bound factor: `floor(cpu_count * cpu_factor)`.
    pub cpu_factor: f64,
    /// Mean assumed while the sample window is still warming up.
    pub assumed_bytes_per_sec: f64,
    /// Window size below which the assumption applies.
    pub min_samples: usize,
    /// Maximum retained samples.
    pub max_samples: usize,
}

impl Default for ParallelismHints {
    fn default() -> Self {
        Self {
            min_parallelism: 2,
            cpu_factor: 1.7,
            assumed_bytes_per_sec: MIB,
            min_samples: 10,
            max_samples: 20,
        }
    }
}

/// Sliding window of recent transfer-speed samples.
pub struct SpeedMeter {
    samples: Mutex<VecDeque<f64>>,
    hints: ParallelismHints,
}

impl SpeedMeter {
    pub fn new(hints: ParallelismHints) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            hints,
        }
    }

    pub fn hints(&self) -> &ParallelismHints {
        &self.hints
    }

    /// Records one bytes/sec observation, evicting the oldest beyond the
    /// window size.
    pub fn add_speed(&self, bytes_per_sec: f64) {
        if !bytes_per_sec.is_finite() || bytes_per_sec < 0.0 {
            return;
        }
        let mut samples = self.samples.lock().unwrap();
        if samples.len() >= self.hints.max_samples {
            samples.pop_front();
        }
        samples.push_back(bytes_per_sec);
    }

    /// Mean of the window, or the warm-up assumption when under-sampled.
    pub fn mean_bytes_per_sec(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        if samples.len() < self.hints.min_samples {
            return self.hints.assumed_bytes_per_sec;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    /// Degree of parallelism derived from current throughput.
    pub fn auto_parallelism(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let ceiling = ((cpus as f64) * self.hints.cpu_factor).floor() as usize;
        let ceiling = ceiling.max(self.hints.min_parallelism);
        let derived = ((cpus as f64) * (self.mean_bytes_per_sec() / MIB)) as usize;
        derived.clamp(self.hints.min_parallelism, ceiling)
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(ParallelismHints::default())
    }
}

/// Human-readable transfer rate, scaled to the largest binary unit that
/// keeps the value above one.
pub fn format_speed(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes_per_sec, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Time remaining as a compact clock string: `m:ss`, or `h:mm:ss` once the
/// estimate passes an hour.
pub fn format_eta(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
