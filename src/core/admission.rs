//! Per-volume admission control for scans.
//!
//! Process-wide: construct one scheduler at startup and share it by `Arc`
//! with every orchestrator. The limit is re-read on every wait iteration,
//! so a configuration change applies to waiters that are already blocked.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::config::settings::MAX_SCANS_PER_VOLUME;
use crate::error::ScanError;

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag shared by one scan's threads.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Opaque identifier of the storage volume a scan root lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeKey(pub String);

impl VolumeKey {
    /// Derive the key from the device the path lives on, falling back to the
    /// path's prefix/root component when no device can be queried.
    pub fn for_path(path: &Path) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = std::fs::metadata(path) {
                return VolumeKey(format!("dev:{}", meta.dev()));
            }
        }
        let anchor = path
            .components()
            .find_map(|c| match c {
                Component::Prefix(p) => Some(p.as_os_str().to_string_lossy().to_uppercase()),
                Component::RootDir => Some(String::from("/")),
                _ => None,
            })
            .unwrap_or_else(|| String::from("."));
        VolumeKey(format!("path:{}", anchor))
    }
}

impl std::fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct VolumeAdmissionScheduler {
    in_use: Mutex<HashMap<VolumeKey, usize>>,
    released: Condvar,
    limit: AtomicUsize,
}

impl VolumeAdmissionScheduler {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            in_use: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            limit: AtomicUsize::new(limit.clamp(1, MAX_SCANS_PER_VOLUME)),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit
            .store(limit.clamp(1, MAX_SCANS_PER_VOLUME), Ordering::Relaxed);
        self.released.notify_all();
    }

    pub fn in_use(&self, key: &VolumeKey) -> usize {
        let slots = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).copied().unwrap_or(0)
    }

    /// Block until a slot on `key` is free or `stop` fires.
    pub fn acquire(self: &Arc<Self>, key: &VolumeKey, stop: &StopToken) -> Result<Permit, ScanError> {
        let mut slots = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        let mut waited = false;
        loop {
            if stop.is_cancelled() {
                return Err(ScanError::AdmissionDenied {
                    volume: key.0.clone(),
                });
            }
            let used = slots.entry(key.clone()).or_insert(0);
            if *used < self.limit() {
                *used += 1;
                if waited {
                    tracing::debug!(volume = %key, "admission granted after wait");
                }
                return Ok(Permit {
                    scheduler: Arc::clone(self),
                    key: key.clone(),
                });
            }
            if !waited {
                tracing::debug!(volume = %key, limit = self.limit(), "waiting for volume slot");
                waited = true;
            }
            slots = self
                .released
                .wait_timeout(slots, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, key: &VolumeKey) {
        let mut slots = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(used) = slots.get_mut(key) {
            *used = used.saturating_sub(1);
            if *used == 0 {
                slots.remove(key);
            }
        }
        drop(slots);
        self.released.notify_one();
    }
}

/// A granted slot. Dropping it frees the slot and wakes one waiter.
#[derive(Debug)]
pub struct Permit {
    scheduler: Arc<VolumeAdmissionScheduler>,
    key: VolumeKey,
}

impl Permit {
    pub fn volume(&self) -> &VolumeKey {
        &self.key
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.scheduler.release(&self.key);
    }
}
