//! In-memory TTL + LRU cache of finished scans.
//!
//! Process-wide like the admission scheduler: one `ResultCache` is shared by
//! `Arc`. Entries are few (at most 16), so a recency-ordered list with
//! linear lookups is all that is needed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::settings::{Settings, MAX_CACHE_ENTRIES};
use crate::models::node::{Node, NodeId};
use crate::models::snapshot::ScanResultSnapshot;
use crate::models::tree_store::TreeStore;

/// Time slice given to snapshot building on each tick.
pub const SNAPSHOT_SLICE: Duration = Duration::from_micros(1200);

/// Elements copied between two clock checks.
const COPY_CHUNK: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub root: PathBuf,
    pub top_k: usize,
}

impl CacheKey {
    /// Normalise the root so different spellings of one directory share an
    /// entry: resolved if possible, trailing separators stripped.
    pub fn new(root: &Path, top_k: usize) -> Self {
        let resolved = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let mut text = resolved.to_string_lossy().to_string();
        while text.len() > 1 && (text.ends_with('/') || text.ends_with('\\')) {
            text.pop();
        }
        if cfg!(windows) {
            text = text.to_lowercase();
        }
        Self {
            root: PathBuf::from(text),
            top_k,
        }
    }
}

struct CacheEntry {
    key: CacheKey,
    snapshot: Arc<ScanResultSnapshot>,
    inserted_at: Instant,
    last_used_at: Instant,
}

struct CacheInner {
    /// Most recently used first.
    entries: VecDeque<CacheEntry>,
    ttl: Option<Duration>,
    max_entries: usize,
    enabled: bool,
}

impl CacheInner {
    fn purge_expired(&mut self, now: Instant) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let before = self.entries.len();
        self.entries
            .retain(|e| now.saturating_duration_since(e.inserted_at) <= ttl);
        let expired = before - self.entries.len();
        if expired > 0 {
            tracing::debug!(expired, "purged expired scan results");
        }
    }

    fn trim(&mut self) {
        while self.entries.len() > self.max_entries {
            if let Some(evicted) = self.entries.pop_back() {
                tracing::debug!(root = %evicted.key.root.display(), "evicted least recently used scan result");
            }
        }
    }
}

pub struct ResultCache {
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    /// `ttl_seconds == 0` keeps entries until they are evicted by capacity.
    pub fn new(ttl_seconds: u64, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: VecDeque::new(),
                ttl: ttl_from_seconds(ttl_seconds),
                max_entries: max_entries.min(MAX_CACHE_ENTRIES),
                enabled: true,
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let cache = Self::new(settings.cache_ttl_seconds, settings.cache_max_entries);
        cache.configure(settings);
        cache
    }

    /// Apply a live configuration change. Disabling the cache clears it.
    pub fn configure(&self, settings: &Settings) {
        let mut inner = self.lock();
        inner.ttl = ttl_from_seconds(settings.cache_ttl_seconds);
        inner.max_entries = settings.cache_max_entries.min(MAX_CACHE_ENTRIES);
        inner.enabled = settings.cache_enabled;
        if !inner.enabled {
            inner.entries.clear();
        }
        inner.trim();
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<ScanResultSnapshot>> {
        self.get_at(key, Instant::now())
    }

    /// Lookup as of `now`. A hit becomes the most recently used entry.
    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Arc<ScanResultSnapshot>> {
        let mut inner = self.lock();
        inner.purge_expired(now);
        let position = inner.entries.iter().position(|e| &e.key == key)?;
        let mut entry = inner.entries.remove(position)?;
        entry.last_used_at = now;
        let snapshot = Arc::clone(&entry.snapshot);
        inner.entries.push_front(entry);
        Some(snapshot)
    }

    pub fn put(&self, key: CacheKey, snapshot: ScanResultSnapshot) {
        self.put_at(key, snapshot, Instant::now());
    }

    pub fn put_at(&self, key: CacheKey, snapshot: ScanResultSnapshot, now: Instant) {
        let mut inner = self.lock();
        if !inner.enabled || inner.max_entries == 0 {
            return;
        }
        inner.purge_expired(now);
        inner.entries.retain(|e| e.key != key);
        tracing::debug!(
            root = %key.root.display(),
            top_k = key.top_k,
            nodes = snapshot.node_count(),
            "cached scan result"
        );
        inner.entries.push_front(CacheEntry {
            key,
            snapshot: Arc::new(snapshot),
            inserted_at: now,
            last_used_at: now,
        });
        inner.trim();
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.lock().entries.iter().map(|e| e.key.clone()).collect()
    }

    /// When the entry for `key` was last returned or inserted.
    pub fn last_used(&self, key: &CacheKey) -> Option<Instant> {
        self.lock()
            .entries
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.last_used_at)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ttl_from_seconds(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

#[derive(Debug)]
pub enum BuildStep {
    /// More ticks needed.
    Pending,
    /// A new generation started; the partial copy was thrown away.
    Abandoned,
    Complete(ScanResultSnapshot),
}

/// Copies a finished tree into a snapshot a slice at a time, so caching a
/// large tree never stalls the consumer for more than one slice.
pub struct SnapshotBuilder {
    generation: u64,
    key: CacheKey,
    nodes: Vec<Node>,
    children: Vec<NodeId>,
    done: bool,
}

impl SnapshotBuilder {
    pub fn new(generation: u64, key: CacheKey, store: &TreeStore) -> Self {
        Self {
            generation,
            key,
            nodes: Vec::with_capacity(store.nodes.len()),
            children: Vec::with_capacity(store.children.len()),
            done: false,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Node slots and child slots copied so far.
    pub fn copied(&self) -> (usize, usize) {
        (self.nodes.len(), self.children.len())
    }

    pub fn advance(&mut self, store: &TreeStore, current_generation: u64, slice: Duration) -> BuildStep {
        if current_generation != self.generation || self.done {
            return BuildStep::Abandoned;
        }
        let started = Instant::now();

        while self.nodes.len() < store.nodes.len() {
            let from = self.nodes.len();
            let to = (from + COPY_CHUNK).min(store.nodes.len());
            self.nodes.extend_from_slice(&store.nodes[from..to]);
            if started.elapsed() >= slice {
                return BuildStep::Pending;
            }
        }
        while self.children.len() < store.children.len() {
            let from = self.children.len();
            let to = (from + COPY_CHUNK).min(store.children.len());
            self.children.extend_from_slice(&store.children[from..to]);
            if started.elapsed() >= slice {
                return BuildStep::Pending;
            }
        }

        self.done = true;
        BuildStep::Complete(ScanResultSnapshot {
            root_path: store.root_path().to_path_buf(),
            nodes: std::mem::take(&mut self.nodes),
            children: std::mem::take(&mut self.children),
            names: store.names.clone(),
            synthetic: store.synthetic.iter().map(|(k, v)| (*k, *v)).collect(),
            next_id: store.ids().peek(),
            captured_at: chrono::Utc::now(),
        })
    }
}
