//! Per-file download progress tracker with a time-windowed speed/ETA
//! estimate (spec.md §4.1 "a per-file download progress tracker").

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(5);
const MAX_SAMPLES: usize = 64;

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub loaded_bytes: u64,
    pub total_bytes: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self {
            loaded_bytes: 0,
            total_bytes: 0,
            samples: VecDeque::new(),
        }
    }
}

impl DownloadProgress {
    pub fn record(&mut self, loaded_bytes: u64, total_bytes: u64) {
        self.loaded_bytes = loaded_bytes;
        self.total_bytes = total_bytes;
        let now = Instant::now();
        self.samples.push_back((now, loaded_bytes));
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        while let Some(&(oldest, _)) = self.samples.front() {
            if now.duration_since(oldest) > WINDOW && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(percent, speed_bytes_per_sec, eta_secs)` computed from the oldest
    /// sample still within the rolling window versus the newest sample.
    pub fn snapshot(&self) -> (Option<f64>, Option<f64>, Option<f64>) {
        let percent = if self.total_bytes > 0 {
            Some(self.loaded_bytes as f64 / self.total_bytes as f64 * 100.0)
        } else {
            None
        };

        let (oldest, newest) = match (self.samples.front(), self.samples.back()) {
            (Some(o), Some(n)) if o.0 != n.0 => (o, n),
            _ => return (percent, None, None),
        };

        let elapsed = newest.0.duration_since(oldest.0).as_secs_f64();
        if elapsed <= 0.0 {
            return (percent, None, None);
        }
        let bytes_delta = newest.1.saturating_sub(oldest.1) as f64;
        let speed = bytes_delta / elapsed;
        let eta = if speed > 0.0 && self.total_bytes > self.loaded_bytes {
            Some((self.total_bytes - self.loaded_bytes) as f64 / speed)
        } else {
            None
        };
        (percent, Some(speed), eta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_computed_from_totals() {
        let mut progress = DownloadProgress::default();
        progress.record(50, 200);
        let (percent, _, _) = progress.snapshot();
        assert_eq!(percent, Some(25.0));
    }

    #[test]
    fn no_total_means_no_percent() {
        let progress = DownloadProgress::default();
        assert_eq!(progress.snapshot().0, None);
    }

    #[test]
    fn single_sample_has_no_speed() {
        let mut progress = DownloadProgress::default();
        progress.record(10, 100);
        assert_eq!(progress.snapshot().1, None);
    }
}
