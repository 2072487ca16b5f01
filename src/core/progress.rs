use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::events::UpdateKind;

/// Minimum spacing between two `Progress` records of one scan.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(150);

/// Scan-wide counters shared by all worker threads of one scan.
pub struct ProgressTracker {
    pub files_scanned: AtomicU64,
    pub dirs_scanned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub errors_count: AtomicU64,
    pub start_time: Instant,
    last_emit_ms: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            files_scanned: AtomicU64::new(0),
            dirs_scanned: AtomicU64::new(0),
            bytes_scanned: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            start_time: Instant::now(),
            last_emit_ms: AtomicU64::new(0),
        }
    }

    pub fn increment_files(&self) {
        self.files_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dirs(&self) {
        self.dirs_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_size(&self, size: u64) {
        self.bytes_scanned.fetch_add(size, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn files_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed < f64::EPSILON {
            return 0.0;
        }
        self.files_scanned.load(Ordering::Relaxed) as f64 / elapsed
    }

    /// Returns a `Progress` record if at least `PROGRESS_INTERVAL` has passed
    /// since the last one handed out. Only one thread wins each window.
    pub fn throttled_record(&self) -> Option<UpdateKind> {
        // Offset by one interval so the first window is open at t=0.
        let now_ms = self.elapsed().as_millis() as u64 + PROGRESS_INTERVAL.as_millis() as u64;
        let last = self.last_emit_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < PROGRESS_INTERVAL.as_millis() as u64 {
            return None;
        }
        self.last_emit_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .ok()?;
        Some(self.record())
    }

    pub fn record(&self) -> UpdateKind {
        let snapshot = self.snapshot();
        UpdateKind::Progress {
            files_scanned: snapshot.files_scanned,
            dirs_scanned: snapshot.dirs_scanned,
            bytes_scanned: snapshot.bytes_scanned,
            errors: snapshot.errors_count,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            dirs_scanned: self.dirs_scanned.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            errors_count: self.errors_count.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            files_per_second: self.files_per_second(),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side view of the latest counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub files_scanned: u64,
    pub dirs_scanned: u64,
    pub bytes_scanned: u64,
    pub errors_count: u64,
    pub elapsed: Duration,
    pub files_per_second: f64,
}
