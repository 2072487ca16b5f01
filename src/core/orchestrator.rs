//! Consumer side of a scan: owns the tree, drains the update queue into it,
//! caches finished trees and keeps the treemap layout current.
//!
//! Everything here runs on one thread. The host calls `pump` from a fixed
//! interval timer; no call blocks on scanner threads except `reap` and
//! `shutdown`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::settings::Settings;
use crate::error::ScanError;
use crate::layout::engine::{LayoutEngine, LayoutParams, LayoutTile};
use crate::layout::treemap::Rect;
use crate::models::node::{Node, NodeId, ScanState};
use crate::models::tree_store::{IdAllocator, TreeStore};

use super::admission::{StopToken, VolumeAdmissionScheduler, VolumeKey};
use super::cache::{BuildStep, CacheKey, ResultCache, SnapshotBuilder, SNAPSHOT_SLICE};
use super::events::UpdateKind;
use super::progress::ProgressSnapshot;
use super::queue::{DrainBudget, UpdateQueue};
use super::reader::DirectoryReader;
use super::scanner::{ScanHandle, ScanRequest, Scanner};

/// Minimum spacing between layout rebuilds while a scan is running.
pub const LAYOUT_INTERVAL_SCANNING: Duration = Duration::from_millis(60);

/// Host timer cadence `pump` is designed for.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallState {
    Idle,
    Scanning,
    Done,
    Error,
    Canceled,
}

/// What one `pump` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub drained: usize,
    pub layout_rebuilt: bool,
    pub layout_complete: bool,
    pub cache_stored: bool,
    pub scan_active: bool,
}

pub struct ScanOrchestrator {
    settings: Settings,
    reader: Arc<dyn DirectoryReader>,
    admission: Arc<VolumeAdmissionScheduler>,
    cache: Arc<ResultCache>,
    queue: Arc<UpdateQueue>,
    ids: IdAllocator,
    store: Option<TreeStore>,
    cache_key: Option<CacheKey>,
    current: Option<ScanHandle>,
    retired: Vec<ScanHandle>,
    scan_active: bool,
    /// Node the running scan is rooted at.
    scan_root: NodeId,
    /// Size of a refreshed directory before its rescan began.
    refresh_baseline: Option<u64>,
    view: NodeId,
    viewport: Rect,
    layout: LayoutEngine,
    layout_dirty: bool,
    last_layout: Option<Instant>,
    cache_pending: bool,
    snapshot_builder: Option<SnapshotBuilder>,
    last_progress: ProgressSnapshot,
}

impl ScanOrchestrator {
    pub fn new(
        settings: Settings,
        reader: Arc<dyn DirectoryReader>,
        admission: Arc<VolumeAdmissionScheduler>,
        cache: Arc<ResultCache>,
    ) -> Self {
        let settings = settings.clamped();
        admission.set_limit(settings.max_concurrent_scans_per_volume);
        cache.configure(&settings);
        Self {
            settings,
            reader,
            admission,
            cache,
            queue: Arc::new(UpdateQueue::new()),
            ids: IdAllocator::new(),
            store: None,
            cache_key: None,
            current: None,
            retired: Vec::new(),
            scan_active: false,
            scan_root: NodeId::ROOT,
            refresh_baseline: None,
            view: NodeId::ROOT,
            viewport: Rect::new(0.0, 0.0, 1280.0, 800.0),
            layout: LayoutEngine::new(),
            layout_dirty: false,
            last_layout: None,
            cache_pending: false,
            snapshot_builder: None,
            last_progress: ProgressSnapshot::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Apply a configuration change without restarting anything.
    pub fn apply_settings(&mut self, settings: Settings) {
        let settings = settings.clamped();
        self.admission
            .set_limit(settings.max_concurrent_scans_per_volume);
        self.cache.configure(&settings);
        if !settings.cache_enabled {
            self.cache_pending = false;
            self.snapshot_builder = None;
        }
        self.settings = settings;
        self.layout_dirty = true;
    }

    /// Start scanning `root`, replacing the current tree. With `allow_cache`
    /// a recent result for the same root is shown instead of rescanning.
    pub fn start_scan(&mut self, root: impl AsRef<Path>, allow_cache: bool) -> Result<(), ScanError> {
        let root = root.as_ref().to_path_buf();
        self.retire_current();
        self.queue.begin_generation();
        self.snapshot_builder = None;
        self.cache_pending = false;
        self.refresh_baseline = None;
        self.scan_active = false;
        self.view = NodeId::ROOT;
        self.scan_root = NodeId::ROOT;
        self.layout.reset_auto_expand();
        self.layout_dirty = true;
        self.last_layout = None;
        self.last_progress = ProgressSnapshot::default();

        let key = CacheKey::new(&root, self.settings.top_files_per_directory);
        self.cache_key = Some(key.clone());

        if allow_cache && self.settings.cache_enabled {
            if let Some(snapshot) = self.cache.get(&key) {
                tracing::info!(root = %root.display(), nodes = snapshot.node_count(), "showing cached scan result");
                self.store = Some(TreeStore::from_snapshot(&snapshot, self.ids.clone()));
                return Ok(());
            }
        }

        self.store = Some(TreeStore::new(root.clone(), self.ids.clone()));
        self.launch(NodeId::ROOT, root)
    }

    /// Stop the running scan. Every directory not yet finished ends up
    /// `Canceled`.
    pub fn cancel_scan(&mut self) {
        if !self.scan_active {
            return;
        }
        self.retire_current();
        self.queue.begin_generation();
        self.snapshot_builder = None;
        if let Some(store) = self.store.as_mut() {
            let swept = store.cancel_incomplete();
            tracing::info!(swept, "scan cancelled");
        }
        self.finish_scan();
    }

    /// Rescan one directory in place. A running scan is cancelled first.
    pub fn refresh(&mut self, id: NodeId) -> Result<(), ScanError> {
        let path = {
            let store = self.store.as_ref().ok_or(ScanError::UnknownNode(id))?;
            let node = store.get(id).ok_or(ScanError::UnknownNode(id))?;
            if !node.is_directory || node.is_synthetic {
                return Err(ScanError::NotADirectory(id));
            }
            store.path_of(id).ok_or(ScanError::UnknownNode(id))?
        };

        if self.scan_active {
            self.cancel_scan();
        }
        self.queue.begin_generation();
        self.snapshot_builder = None;
        self.cache_pending = false;

        let Some(store) = self.store.as_mut() else {
            return Err(ScanError::UnknownNode(id));
        };
        let baseline = store.get(id).map_or(0, |n| n.total_bytes);
        store.detach_children(id);
        store.set_size(id, 0);
        self.refresh_baseline = Some(baseline);
        self.scan_root = id;
        self.layout_dirty = true;
        tracing::info!(path = %path.display(), "refreshing directory");
        self.launch(id, path)
    }

    pub fn navigate_to(&mut self, id: NodeId) -> Result<(), ScanError> {
        let store = self.store.as_ref().ok_or(ScanError::UnknownNode(id))?;
        let node = store.get(id).ok_or(ScanError::UnknownNode(id))?;
        if !node.is_directory || node.is_synthetic {
            return Err(ScanError::NotADirectory(id));
        }
        if self.view != id {
            self.view = id;
            self.layout_dirty = true;
            self.last_layout = None;
        }
        Ok(())
    }

    /// Move the view to its parent. Returns false at the root.
    pub fn navigate_up(&mut self) -> bool {
        let parent = self
            .store
            .as_ref()
            .and_then(|s| s.get(self.view))
            .map(|n| n.parent)
            .filter(|p| p.is_valid());
        match parent {
            Some(parent) => {
                self.view = parent;
                self.layout_dirty = true;
                self.last_layout = None;
                true
            }
            None => false,
        }
    }

    pub fn set_viewport(&mut self, viewport: Rect) {
        if self.viewport != viewport {
            self.viewport = viewport;
            self.layout_dirty = true;
            self.last_layout = None;
        }
    }

    /// One consumer tick: drain pending updates, notice scan completion,
    /// advance cache population and refresh the layout if needed.
    pub fn pump(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        self.reap_finished();

        report.drained = self.drain_updates();
        if report.drained > 0 {
            self.layout_dirty = true;
            tracing::trace!(drained = report.drained, pending = self.queue.len(), "drained updates");
        }

        if self.scan_active {
            let root_state = self
                .store
                .as_ref()
                .and_then(|s| s.get(self.scan_root))
                .map(|n| n.state);
            if root_state.is_some_and(ScanState::is_terminal) {
                self.finish_scan();
            }
        }

        report.cache_stored = self.advance_cache_build();
        let (rebuilt, complete) = self.update_layout();
        report.layout_rebuilt = rebuilt;
        report.layout_complete = complete;
        report.scan_active = self.scan_active;
        report
    }

    fn drain_updates(&mut self) -> usize {
        let Some(store) = self.store.as_mut() else {
            return 0;
        };
        let queue = Arc::clone(&self.queue);
        let last_progress = &mut self.last_progress;
        queue.drain(DrainBudget::for_activity(self.scan_active), |update| {
            match update.kind {
                UpdateKind::Progress {
                    files_scanned,
                    dirs_scanned,
                    bytes_scanned,
                    errors,
                } => {
                    last_progress.files_scanned = files_scanned;
                    last_progress.dirs_scanned = dirs_scanned;
                    last_progress.bytes_scanned = bytes_scanned;
                    last_progress.errors_count = errors;
                }
                kind => {
                    if !store.apply(&kind) {
                        tracing::trace!(?kind, "update for unknown node ignored");
                    }
                }
            }
        })
    }

    /// Bookkeeping once the scan root reached a terminal state (or the scan
    /// was cancelled from here).
    fn finish_scan(&mut self) {
        self.scan_active = false;
        if let Some(handle) = self.current.take() {
            self.last_progress.elapsed = handle.progress().elapsed();
            self.last_progress.files_per_second = handle.progress().files_per_second();
            self.retired.push(handle);
        }
        self.layout_dirty = true;

        let Some(store) = self.store.as_mut() else {
            return;
        };
        store.cancel_incomplete();
        let scan_state = store
            .get(self.scan_root)
            .map_or(ScanState::Canceled, |n| n.state);
        if let Some(baseline) = self.refresh_baseline.take() {
            let updated = store.get(self.scan_root).map_or(0, |n| n.total_bytes);
            store.propagate_delta(self.scan_root, updated as i64 - baseline as i64);
            // Ancestors now carry a partial subtree until it is rescanned.
            if scan_state == ScanState::Canceled {
                store.cancel_ancestors(self.scan_root);
            } else {
                store.settle_ancestors(self.scan_root);
            }
        }
        let root_state = store.root().state;
        self.cache_pending = scan_state == ScanState::Done
            && root_state == ScanState::Done
            && self.settings.cache_enabled
            && self.settings.cache_max_entries > 0;
        tracing::debug!(state = ?scan_state, root_state = ?root_state, "scan finished");
    }

    /// Returns true when a snapshot was stored this tick.
    fn advance_cache_build(&mut self) -> bool {
        if !self.cache_pending || self.scan_active || !self.queue.is_empty() {
            return false;
        }
        let (Some(store), Some(key)) = (self.store.as_ref(), self.cache_key.as_ref()) else {
            self.cache_pending = false;
            return false;
        };
        let generation = self.queue.generation();
        let builder = self
            .snapshot_builder
            .get_or_insert_with(|| SnapshotBuilder::new(generation, key.clone(), store));

        match builder.advance(store, generation, SNAPSHOT_SLICE) {
            BuildStep::Pending => false,
            BuildStep::Abandoned => {
                self.snapshot_builder = None;
                self.cache_pending = false;
                false
            }
            BuildStep::Complete(snapshot) => {
                let key = builder.key().clone();
                self.cache.put(key, snapshot);
                self.snapshot_builder = None;
                self.cache_pending = false;
                true
            }
        }
    }

    /// Returns (rebuilt, complete).
    fn update_layout(&mut self) -> (bool, bool) {
        let Some(store) = self.store.as_ref() else {
            return (false, true);
        };
        let throttled = self.scan_active
            && self
                .last_layout
                .is_some_and(|t| t.elapsed() < LAYOUT_INTERVAL_SCANNING);

        if self.layout_dirty && !throttled {
            let params = LayoutParams {
                scan_active: self.scan_active,
                thread_count: self.settings.scan_threads,
            };
            let complete = self.layout.layout(store, self.view, self.viewport, params);
            self.layout_dirty = false;
            self.last_layout = Some(Instant::now());
            return (true, complete);
        }
        if !self.layout.is_complete() {
            return (false, self.layout.resume(store));
        }
        (false, true)
    }

    fn launch(&mut self, root_id: NodeId, root_path: PathBuf) -> Result<(), ScanError> {
        let generation = self.queue.generation();
        let request = ScanRequest {
            volume: VolumeKey::for_path(&root_path),
            root_path,
            root_id,
            generation,
            top_k: self.settings.top_files_per_directory,
            thread_count: self.settings.scan_threads,
        };
        let scanner = Scanner::new(
            Arc::clone(&self.reader),
            Arc::clone(&self.queue),
            Arc::clone(&self.admission),
            self.ids.clone(),
        );

        if let Some(store) = self.store.as_mut() {
            store.set_state(root_id, ScanState::Queued);
        }
        match scanner.spawn(request, StopToken::new()) {
            Ok(handle) => {
                self.current = Some(handle);
                self.scan_root = root_id;
                self.scan_active = true;
                Ok(())
            }
            Err(e) => {
                tracing::error!("{}", e);
                if let Some(store) = self.store.as_mut() {
                    store.set_state(root_id, ScanState::Error);
                }
                Err(e)
            }
        }
    }

    fn retire_current(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.cancel();
            self.retired.push(handle);
        }
    }

    fn reap_finished(&mut self) {
        self.retired.retain_mut(|handle| {
            if handle.is_finished() {
                log_outcome(handle);
                false
            } else {
                true
            }
        });
    }

    /// Join every retired scan thread. Blocks until they exit.
    pub fn reap(&mut self) {
        for mut handle in self.retired.drain(..) {
            handle.cancel();
            log_outcome(&mut handle);
        }
    }

    /// Cancel the running scan and join all scan threads.
    pub fn shutdown(&mut self) {
        self.cancel_scan();
        self.retire_current();
        self.reap();
    }

    pub fn overall_state(&self) -> OverallState {
        if self.scan_active {
            return OverallState::Scanning;
        }
        match self.store.as_ref().map(|s| s.root().state) {
            Some(ScanState::Done) => OverallState::Done,
            Some(ScanState::Error) => OverallState::Error,
            Some(ScanState::Canceled) => OverallState::Canceled,
            _ => OverallState::Idle,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_active
    }

    pub fn generation(&self) -> u64 {
        self.queue.generation()
    }

    pub fn queue(&self) -> &Arc<UpdateQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn store(&self) -> Option<&TreeStore> {
        self.store.as_ref()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.store.as_ref()?.get(id)
    }

    pub fn name(&self, id: NodeId) -> &str {
        self.store.as_ref().map_or("", |s| s.name(id))
    }

    pub fn path_of(&self, id: NodeId) -> Option<PathBuf> {
        self.store.as_ref()?.path_of(id)
    }

    pub fn error_nodes(&self) -> Vec<NodeId> {
        self.store
            .as_ref()
            .map(|s| s.error_nodes())
            .unwrap_or_default()
    }

    pub fn view(&self) -> NodeId {
        self.view
    }

    pub fn tiles(&self) -> &[LayoutTile] {
        self.layout.tiles()
    }

    pub fn hit_test(&self, x: f32, y: f32) -> Option<&LayoutTile> {
        self.layout.hit_test(x, y)
    }

    pub fn layout_engine(&self) -> &LayoutEngine {
        &self.layout
    }

    /// Live counters while scanning, the final ones afterwards.
    pub fn progress(&self) -> ProgressSnapshot {
        match self.current.as_ref() {
            Some(handle) => handle.progress().snapshot(),
            None => self.last_progress.clone(),
        }
    }
}

fn log_outcome(handle: &mut ScanHandle) {
    match handle.join() {
        Some(Ok(bytes)) => {
            tracing::debug!(generation = handle.generation(), bytes, "scan thread exited")
        }
        Some(Err(e)) if e.is_cancellation() => {
            tracing::debug!(generation = handle.generation(), "scan thread stopped: {}", e)
        }
        Some(Err(e)) => tracing::warn!(generation = handle.generation(), "scan thread failed: {}", e),
        None => {}
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
