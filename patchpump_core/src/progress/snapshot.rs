use std::time::Instant;

use serde::Serialize;

use crate::types::types::ProgressSample;

/// EMA smoothing factor. 0.3 = responsive but stable.
const EMA_ALPHA: f64 = 0.3;

/// Byte-level view of one download, as seen by the progress callback.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSnapshot {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub speed: f64,
    pub eta_secs: f64,
    pub done: bool,
}

impl DownloadSnapshot {
    pub fn empty() -> Self {
        Self {
            bytes_downloaded: 0,
            total_bytes: None,
            speed: 0.0,
            eta_secs: 0.0,
            done: false,
        }
    }

    /// Completion in `[0, 100]`; 0 while the total is unknown.
    pub fn percentage(&self) -> f32 {
        match self.total_bytes {
            Some(total) if total > 0 => {
                ((self.bytes_downloaded as f64 / total as f64) * 100.0).min(100.0) as f32
            }
            Some(_) if self.done => 100.0,
            _ => 0.0,
        }
    }

    /// Turns the snapshot into a `ProgressSample` labelled with `label`.
    pub fn to_sample(&self, label: &str) -> ProgressSample {
        let info = match self.total_bytes {
            Some(total) => format!(
                "{}: {} / {} ({}/s)",
                label,
                format_bytes(self.bytes_downloaded),
                format_bytes(total),
                format_bytes(self.speed as u64)
            ),
            None => format!(
                "{}: {} ({}/s)",
                label,
                format_bytes(self.bytes_downloaded),
                format_bytes(self.speed as u64)
            ),
        };
        ProgressSample::new(self.percentage(), info)
    }
}

/// Folds `(received, expected)` callbacks into `DownloadSnapshot`s with an
/// EMA-smoothed transfer speed.
pub struct SpeedTracker {
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
    speed: f64,
    last_update: Instant,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self {
            bytes_downloaded: 0,
            total_bytes: None,
            speed: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Record a cumulative byte count and return the updated snapshot.
    pub fn update(&mut self, received: u64, expected: Option<u64>) -> DownloadSnapshot {
        let now = Instant::now();
        let delta = received.saturating_sub(self.bytes_downloaded);
        self.bytes_downloaded = received;
        if expected.is_some() {
            self.total_bytes = expected;
        }

        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let instant_speed = delta as f64 / elapsed;
            self.speed = EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * self.speed;
            self.last_update = now;
        }

        self.snapshot()
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let remaining = self
            .total_bytes
            .map(|total| total.saturating_sub(self.bytes_downloaded))
            .unwrap_or(0);
        let eta = if self.speed > 0.0 {
            remaining as f64 / self.speed
        } else {
            0.0
        };
        DownloadSnapshot {
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
            speed: self.speed,
            eta_secs: eta,
            done: self.total_bytes == Some(self.bytes_downloaded),
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable byte formatting.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.00 GB");
    }

    #[test]
    fn tracker_reports_percentage_and_completion() {
        let mut tracker = SpeedTracker::new();
        let half = tracker.update(500, Some(1000));
        assert_eq!(half.percentage(), 50.0);
        assert!(!half.done);

        let full = tracker.update(1000, Some(1000));
        assert_eq!(full.percentage(), 100.0);
        assert!(full.done);
        assert_eq!(full.eta_secs, 0.0);
    }

    #[test]
    fn unknown_total_keeps_percentage_at_zero() {
        let mut tracker = SpeedTracker::new();
        let snap = tracker.update(4096, None);
        assert_eq!(snap.percentage(), 0.0);
        assert!(snap.to_sample("patch.bin").info.starts_with("patch.bin: 4.0 KB"));
    }

    #[test]
    fn sample_text_includes_totals() {
        let mut tracker = SpeedTracker::new();
        let sample = tracker.update(1024, Some(2048)).to_sample("data");
        assert_eq!(sample.percentage, 50.0);
        assert!(sample.info.contains("1.0 KB / 2.0 KB"));
    }
}
