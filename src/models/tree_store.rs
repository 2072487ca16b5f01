use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::core::events::{FileEntry, Remainder, UpdateKind};

use super::node::{NameRef, Node, NodeId, ScanState};
use super::snapshot::ScanResultSnapshot;

const INITIAL_CHILD_CAPACITY: u32 = 4;

/// Hands out node ids for one tree. Cloned into every scanner thread so
/// records can name nodes before the consumer has materialised them.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: Arc<AtomicU32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU32::new(NodeId::ROOT.0 + 1)),
        }
    }

    pub fn next(&self) -> NodeId {
        NodeId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserve `count` consecutive ids and return the first.
    pub fn reserve(&self, count: u32) -> NodeId {
        NodeId(self.next.fetch_add(count, Ordering::Relaxed))
    }

    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    pub fn reset(&self, next: u32) {
        self.next.store(next.max(NodeId::ROOT.0 + 1), Ordering::Relaxed);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Arena-backed scan result. Nodes live in a dense table indexed by id and
/// reference their children through a slice of a shared append-only arena.
///
/// Owned and mutated only by the consumer thread.
pub struct TreeStore {
    root_path: PathBuf,
    pub(crate) nodes: Vec<Node>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) names: String,
    /// Directory id -> its remainder bucket id, kept across re-aggregation.
    pub(crate) synthetic: HashMap<NodeId, NodeId>,
    ids: IdAllocator,
}

impl TreeStore {
    pub fn new(root_path: PathBuf, ids: IdAllocator) -> Self {
        ids.reset(NodeId::ROOT.0 + 1);
        let mut store = Self {
            root_path,
            nodes: vec![Node::default(); 2],
            children: Vec::new(),
            names: String::new(),
            synthetic: HashMap::new(),
            ids,
        };
        let name = store.push_name(&display_name(&store.root_path));
        store.nodes[NodeId::ROOT.index()] = Node {
            id: NodeId::ROOT,
            parent: NodeId::INVALID,
            is_directory: true,
            state: ScanState::Queued,
            name,
            ..Node::default()
        };
        store
    }

    pub fn from_snapshot(snapshot: &ScanResultSnapshot, ids: IdAllocator) -> Self {
        ids.reset(snapshot.next_id);
        Self {
            root_path: snapshot.root_path.clone(),
            nodes: snapshot.nodes.clone(),
            children: snapshot.children.clone(),
            names: snapshot.names.clone(),
            synthetic: snapshot.synthetic.iter().copied().collect(),
            ids,
        }
    }

    /// One-pass copy. The orchestrator uses `SnapshotBuilder` to spread
    /// this over several ticks instead.
    pub fn snapshot(&self) -> ScanResultSnapshot {
        ScanResultSnapshot {
            root_path: self.root_path.clone(),
            nodes: self.nodes.clone(),
            children: self.children.clone(),
            names: self.names.clone(),
            synthetic: self.synthetic.iter().map(|(k, v)| (*k, *v)).collect(),
            next_id: self.ids.peek(),
            captured_at: chrono::Utc::now(),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn root(&self) -> &Node {
        &self.nodes[NodeId::ROOT.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).filter(|n| !n.is_vacant())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).filter(|n| !n.is_vacant())
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.get(id) {
            Some(node) if node.children_count > 0 => {
                let start = node.children_start as usize;
                &self.children[start..start + node.children_count as usize]
            }
            _ => &[],
        }
    }

    pub fn name(&self, id: NodeId) -> &str {
        match self.get(id) {
            Some(node) => {
                let start = node.name.start as usize;
                &self.names[start..start + node.name.len as usize]
            }
            None => "",
        }
    }

    /// Rebuild the on-disk path of a node from the parent chain. Synthetic
    /// buckets resolve to their directory.
    pub fn path_of(&self, id: NodeId) -> Option<PathBuf> {
        let mut node = self.get(id)?;
        if node.is_synthetic {
            node = self.get(node.parent)?;
        }
        let mut segments = Vec::new();
        while node.id != NodeId::ROOT {
            segments.push(self.name(node.id));
            node = self.get(node.parent)?;
        }
        let mut path = self.root_path.clone();
        for segment in segments.iter().rev() {
            path.push(segment);
        }
        Some(path)
    }

    /// Ancestors from the direct parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut current = self.get(id).map(|n| n.parent).unwrap_or_default();
        std::iter::from_fn(move || {
            let node = self.get(current)?;
            current = node.parent;
            Some(node.id)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_vacant())
    }

    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    pub fn error_nodes(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|n| n.state == ScanState::Error)
            .map(|n| n.id)
            .collect()
    }

    pub fn set_size(&mut self, id: NodeId, total_bytes: u64) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.total_bytes = total_bytes;
                true
            }
            None => false,
        }
    }

    pub fn set_state(&mut self, id: NodeId, state: ScanState) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.state = state;
                true
            }
            None => false,
        }
    }

    /// Add a signed delta to every ancestor of `id`.
    pub fn propagate_delta(&mut self, id: NodeId, delta: i64) {
        if delta == 0 {
            return;
        }
        let ancestors: Vec<NodeId> = self.ancestors(id).collect();
        for ancestor in ancestors {
            if let Some(node) = self.get_mut(ancestor) {
                node.total_bytes = node.total_bytes.saturating_add_signed(delta);
            }
        }
    }

    /// Mark every ancestor of `id` as `Canceled`. Used when a rescan below
    /// them stopped early, so their totals are no longer authoritative.
    pub fn cancel_ancestors(&mut self, id: NodeId) {
        let ancestors: Vec<NodeId> = self.ancestors(id).collect();
        for ancestor in ancestors {
            self.set_state(ancestor, ScanState::Canceled);
        }
    }

    /// Walk up from `id` marking ancestors `Done` for as long as every
    /// subdirectory of the ancestor has settled (`Done` or `Error`).
    pub fn settle_ancestors(&mut self, id: NodeId) {
        let ancestors: Vec<NodeId> = self.ancestors(id).collect();
        for ancestor in ancestors {
            let settled = self
                .children(ancestor)
                .iter()
                .filter_map(|child| self.get(*child))
                .filter(|n| n.is_directory && !n.is_synthetic)
                .all(|n| matches!(n.state, ScanState::Done | ScanState::Error));
            if !settled {
                break;
            }
            self.set_state(ancestor, ScanState::Done);
        }
    }

    /// Forget a directory's children. The old slice stays in the arena,
    /// abandoned; the removed nodes become unreachable.
    pub fn detach_children(&mut self, id: NodeId) {
        if let Some(node) = self.get_mut(id) {
            node.children_start = 0;
            node.children_count = 0;
            node.children_capacity = 0;
        }
    }

    /// Mark every directory that has not reached a terminal state as
    /// `Canceled`. Returns the number of nodes touched.
    pub fn cancel_incomplete(&mut self) -> usize {
        let mut touched = 0;
        for node in self.nodes.iter_mut().filter(|n| !n.is_vacant()) {
            if node.is_directory && !node.state.is_terminal() {
                node.state = ScanState::Canceled;
                touched += 1;
            }
        }
        touched
    }

    /// Apply one update record. Returns false when the record names a node
    /// this store does not know about.
    pub fn apply(&mut self, kind: &UpdateKind) -> bool {
        match kind {
            UpdateKind::AddChild {
                parent,
                id,
                name,
                is_directory,
                bytes,
            } => {
                let state = if *is_directory {
                    ScanState::Queued
                } else {
                    ScanState::Done
                };
                self.insert_child(*parent, *id, name, *is_directory, *bytes, state)
            }
            UpdateKind::UpdateSize { id, total_bytes } => self.set_size(*id, *total_bytes),
            UpdateKind::UpdateState { id, state } => self.set_state(*id, *state),
            UpdateKind::DirectoryFilesSummary {
                parent,
                files,
                other,
            } => self.apply_files_summary(*parent, files, *other),
            UpdateKind::Progress { .. } => false,
        }
    }

    /// Materialise a node and append it to its parent's children.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        id: NodeId,
        name: &str,
        is_directory: bool,
        bytes: u64,
        state: ScanState,
    ) -> bool {
        if !id.is_valid() || self.get(parent).is_none() {
            return false;
        }
        self.ensure_slot(id);
        let name = self.push_name(name);
        self.nodes[id.index()] = Node {
            id,
            parent,
            is_directory,
            state,
            name,
            total_bytes: bytes,
            ..Node::default()
        };
        self.reserve_children(parent, 1);
        self.push_child(parent, id);
        true
    }

    /// Materialise a directory's retained files plus its remainder bucket
    /// and append all of them to the directory in one batch.
    pub fn apply_files_summary(
        &mut self,
        parent: NodeId,
        files: &[FileEntry],
        other: Remainder,
    ) -> bool {
        if self.get(parent).is_none() {
            return false;
        }
        let bucket = if other.is_empty() {
            None
        } else {
            Some(*self.synthetic.entry(parent).or_insert_with(|| self.ids.next()))
        };
        let bucket_attached = bucket.is_some_and(|b| self.children(parent).contains(&b));
        let additional = files.len() + usize::from(bucket.is_some() && !bucket_attached);
        self.reserve_children(parent, additional as u32);

        for file in files {
            if !file.id.is_valid() {
                continue;
            }
            self.ensure_slot(file.id);
            let name = self.push_name(&file.name);
            self.nodes[file.id.index()] = Node {
                id: file.id,
                parent,
                state: ScanState::Done,
                name,
                total_bytes: file.bytes,
                ..Node::default()
            };
            self.push_child(parent, file.id);
        }

        if let Some(bucket) = bucket {
            self.ensure_slot(bucket);
            self.nodes[bucket.index()] = Node {
                id: bucket,
                parent,
                is_synthetic: true,
                state: ScanState::Done,
                total_bytes: other.bytes,
                aggregate_files: other.files,
                ..Node::default()
            };
            if !bucket_attached {
                self.push_child(parent, bucket);
            }
        }
        true
    }

    pub fn synthetic_bucket(&self, dir: NodeId) -> Option<NodeId> {
        self.synthetic.get(&dir).copied()
    }

    fn ensure_slot(&mut self, id: NodeId) {
        if self.nodes.len() <= id.index() {
            self.nodes.resize(id.index() + 1, Node::default());
        }
    }

    fn push_name(&mut self, name: &str) -> NameRef {
        let start = self.names.len() as u32;
        self.names.push_str(name);
        NameRef {
            start,
            len: name.len() as u32,
        }
    }

    /// Make room for `additional` more children, relocating the slice to the
    /// end of the arena with doubled capacity when it is full.
    fn reserve_children(&mut self, parent: NodeId, additional: u32) {
        let node = &self.nodes[parent.index()];
        let needed = node.children_count + additional;
        if needed <= node.children_capacity {
            return;
        }
        let mut capacity = node.children_capacity.max(INITIAL_CHILD_CAPACITY);
        while capacity < needed {
            capacity *= 2;
        }
        let old_start = node.children_start as usize;
        let old_end = old_start + node.children_count as usize;
        let new_start = self.children.len();
        self.children.extend_from_within(old_start..old_end);
        self.children.resize(new_start + capacity as usize, NodeId::INVALID);

        let node = &mut self.nodes[parent.index()];
        node.children_start = new_start as u32;
        node.children_capacity = capacity;
    }

    fn push_child(&mut self, parent: NodeId, child: NodeId) {
        let node = &mut self.nodes[parent.index()];
        let slot = (node.children_start + node.children_count) as usize;
        node.children_count += 1;
        self.children[slot] = child;
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
