//! Nested squarified treemap over the tree store.
//!
//! A build starts from the view node, lays out its children in the viewport
//! and queues every tile worth expanding in place. Queued expansions are
//! processed largest-area first under a time budget; whatever is left when
//! the budget runs out is resumed on the next call to `resume`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use smallvec::SmallVec;

use crate::core::top_k::TopK;
use crate::models::node::{NodeId, ScanState};
use crate::models::tree_store::TreeStore;

use super::treemap::{squarify, Rect};

pub const DEFAULT_MAX_ITEMS: usize = 600;
pub const MAX_ITEMS_CEILING: usize = 2400;
/// Remainder share of a node's weight that triggers doubling its item limit.
pub const AUTO_EXPAND_SHARE: f64 = 0.62;

const MIN_EXPAND_AREA: f32 = 3600.0;
const MIN_EXPAND_SIDE: f32 = 48.0;
const EXPAND_VIEWPORT_FRACTION: f32 = 0.10;
const HEADER_MIN: f32 = 20.0;
const HEADER_MAX: f32 = 44.0;
const HEADER_INCOMPLETE_EXTRA: f32 = 8.0;
const TILE_PADDING: f32 = 2.0;

/// Scan-dependent knobs for one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutParams {
    pub scan_active: bool,
    /// Upper bound on in-progress directories forced into view.
    pub thread_count: usize,
}

impl LayoutParams {
    pub fn time_budget(&self) -> Duration {
        if self.scan_active {
            Duration::from_millis(4)
        } else {
            Duration::from_millis(10)
        }
    }

    pub fn depth_cap(&self) -> u16 {
        if self.scan_active {
            8
        } else {
            10
        }
    }

    pub fn item_cap(&self) -> usize {
        if self.scan_active {
            1400
        } else {
            2600
        }
    }
}

/// Children folded into one tile because they did not make the cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainderTile {
    pub items: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutTile {
    /// The node drawn here. For a remainder tile, the directory whose
    /// children were folded.
    pub node: NodeId,
    pub depth: u16,
    pub rect: Rect,
    /// Label strip reserved at the top; non-zero only for expanded tiles.
    pub header: f32,
    pub remainder: Option<RemainderTile>,
}

impl LayoutTile {
    pub fn is_remainder(&self) -> bool {
        self.remainder.is_some()
    }

    pub fn is_expanded(&self) -> bool {
        self.header > 0.0
    }
}

/// A directory waiting to be laid out inside `rect`.
#[derive(Debug, Clone, Copy)]
struct Expansion {
    node: NodeId,
    rect: Rect,
    depth: u16,
    /// Area of the tile being expanded; larger goes first.
    area: f32,
    /// Tile that reserved a header for this expansion, if any.
    tile: Option<usize>,
}

impl PartialEq for Expansion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Expansion {}

impl PartialOrd for Expansion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expansion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.area
            .total_cmp(&other.area)
            .then_with(|| other.node.cmp(&self.node))
    }
}

enum Item {
    Node(NodeId),
    Remainder(RemainderTile),
}

#[derive(Default)]
pub struct LayoutEngine {
    max_items: HashMap<NodeId, usize>,
    auto_expanded: HashSet<NodeId>,
    tiles: Vec<LayoutTile>,
    pending: BinaryHeap<Expansion>,
    view: NodeId,
    viewport: Rect,
    params: Option<LayoutParams>,
}

impl LayoutEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from scratch for `view` inside `viewport`. Returns true when
    /// the build finished within its budget.
    pub fn layout(
        &mut self,
        store: &TreeStore,
        view: NodeId,
        viewport: Rect,
        params: LayoutParams,
    ) -> bool {
        self.tiles.clear();
        self.pending.clear();
        self.view = view;
        self.viewport = viewport;
        self.params = Some(params);
        if store.get(view).is_some() && viewport.area() > 0.0 {
            self.pending.push(Expansion {
                node: view,
                rect: viewport,
                depth: 0,
                area: viewport.area(),
                tile: None,
            });
        }
        self.run(store, params)
    }

    /// Continue an interrupted build with a fresh time budget.
    pub fn resume(&mut self, store: &TreeStore) -> bool {
        match self.params {
            Some(params) => self.run(store, params),
            None => true,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn tiles(&self) -> &[LayoutTile] {
        &self.tiles
    }

    pub fn view(&self) -> NodeId {
        self.view
    }

    /// Deepest tile containing the point.
    pub fn hit_test(&self, x: f32, y: f32) -> Option<&LayoutTile> {
        self.tiles.iter().rev().find(|t| t.rect.contains(x, y))
    }

    pub fn max_items_for(&self, node: NodeId) -> usize {
        self.max_items
            .get(&node)
            .copied()
            .unwrap_or(DEFAULT_MAX_ITEMS)
    }

    /// Forget every per-node item limit doubled so far.
    pub fn reset_auto_expand(&mut self) {
        self.max_items.clear();
        self.auto_expanded.clear();
    }

    fn run(&mut self, store: &TreeStore, params: LayoutParams) -> bool {
        let started = Instant::now();
        let budget = params.time_budget();

        while let Some(job) = self.pending.pop() {
            if self.tiles.len() >= params.item_cap() {
                // Out of items for good: drop the rest and give back their
                // reserved headers.
                self.clear_header(job.tile);
                while let Some(dropped) = self.pending.pop() {
                    self.clear_header(dropped.tile);
                }
                break;
            }
            if started.elapsed() >= budget {
                self.pending.push(job);
                tracing::trace!(pending = self.pending.len(), "layout budget exhausted");
                return false;
            }
            self.expand(store, job, params);
        }
        true
    }

    fn clear_header(&mut self, tile: Option<usize>) {
        if let Some(tile) = tile.and_then(|i| self.tiles.get_mut(i)) {
            tile.header = 0.0;
        }
    }

    fn expand(&mut self, store: &TreeStore, job: Expansion, params: LayoutParams) {
        let items = self.select_items(store, job.node, params);
        if items.is_empty() {
            return;
        }
        let weights: Vec<f64> = items.iter().map(|(w, _)| *w as f64).collect();
        let viewport_area = self.viewport.area();

        for placement in squarify(&weights, job.rect) {
            let (_, item) = &items[placement.index];
            let rect = placement.rect;
            let tile_index = self.tiles.len();
            match item {
                Item::Remainder(remainder) => self.tiles.push(LayoutTile {
                    node: job.node,
                    depth: job.depth,
                    rect,
                    header: 0.0,
                    remainder: Some(*remainder),
                }),
                Item::Node(id) => {
                    self.tiles.push(LayoutTile {
                        node: *id,
                        depth: job.depth,
                        rect,
                        header: 0.0,
                        remainder: None,
                    });
                    let Some(node) = store.get(*id) else {
                        continue;
                    };
                    let expandable = node.is_directory
                        && !node.is_synthetic
                        && node.has_children()
                        && rect.area() >= MIN_EXPAND_AREA
                        && rect.short_side() >= MIN_EXPAND_SIDE
                        && job.depth + 1 < params.depth_cap()
                        && viewport_area > 0.0
                        && rect.area() / viewport_area > EXPAND_VIEWPORT_FRACTION;
                    if !expandable {
                        continue;
                    }
                    let header = header_height(rect, node.state == ScanState::Done);
                    let interior = rect.split_top(header).1.inset(TILE_PADDING);
                    if interior.area() <= 0.0 {
                        continue;
                    }
                    self.tiles[tile_index].header = header;
                    self.pending.push(Expansion {
                        node: *id,
                        rect: interior,
                        depth: job.depth + 1,
                        area: rect.area(),
                        tile: Some(tile_index),
                    });
                }
            }
        }
    }

    /// Children of `node` as (weight, item), heaviest first. The lightest
    /// children beyond the node's item limit are folded into one remainder.
    fn select_items(&mut self, store: &TreeStore, node: NodeId, params: LayoutParams) -> Vec<(u64, Item)> {
        let children = store.children(node);
        if children.is_empty() {
            return Vec::new();
        }

        let forced: SmallVec<[NodeId; 16]> = if params.scan_active && node == self.view {
            children
                .iter()
                .copied()
                .filter(|id| {
                    store
                        .get(*id)
                        .is_some_and(|n| n.is_directory && n.state == ScanState::Scanning)
                })
                .take(params.thread_count.max(1))
                .collect()
        } else {
            SmallVec::new()
        };

        let room = params.item_cap().saturating_sub(self.tiles.len());
        // Keep a slot for the remainder tile when not every child fits.
        let room = if children.len() > room {
            room.saturating_sub(1)
        } else {
            room
        };
        let max_items = self.max_items_for(node);
        let mut selection = select(store, children, &forced, max_items.min(room));

        // Only a node cut short by its own limit may grow it; a remainder
        // forced by the global item cap says nothing about the node.
        let share = selection.remainder.bytes_weight as f64 / selection.total_weight.max(1) as f64;
        if max_items <= room
            && share >= AUTO_EXPAND_SHARE
            && !self.auto_expanded.contains(&node)
            && max_items < MAX_ITEMS_CEILING
        {
            let doubled = (max_items * 2).min(MAX_ITEMS_CEILING);
            self.auto_expanded.insert(node);
            self.max_items.insert(node, doubled);
            tracing::debug!(node = %node, max_items = doubled, share, "auto-expanding item limit");
            selection = select(store, children, &forced, doubled.min(room));
        }

        let mut items: Vec<(u64, Item)> = selection
            .kept
            .into_iter()
            .map(|(weight, id)| (weight, Item::Node(id)))
            .collect();
        if selection.remainder.items > 0 {
            items.push((
                selection.remainder.bytes_weight.max(1),
                Item::Remainder(RemainderTile {
                    items: selection.remainder.items,
                    bytes: selection.remainder.bytes,
                }),
            ));
        }
        // Heaviest first; equal weights by node id, the remainder last.
        items.sort_by(|a, b| {
            b.0.cmp(&a.0).then_with(|| match (&a.1, &b.1) {
                (Item::Node(x), Item::Node(y)) => x.cmp(y),
                (Item::Node(_), Item::Remainder(_)) => Ordering::Less,
                (Item::Remainder(_), Item::Node(_)) => Ordering::Greater,
                (Item::Remainder(_), Item::Remainder(_)) => Ordering::Equal,
            })
        });
        items
    }
}

struct Folding {
    items: u64,
    bytes: u64,
    bytes_weight: u64,
}

struct Selection {
    kept: Vec<(u64, NodeId)>,
    remainder: Folding,
    total_weight: u64,
}

fn weight_of(bytes: u64) -> u64 {
    bytes.max(1)
}

fn select(store: &TreeStore, children: &[NodeId], forced: &[NodeId], limit: usize) -> Selection {
    let mut top: TopK<NodeId, u64> = TopK::new(limit.saturating_sub(forced.len()));
    let mut kept = Vec::with_capacity(forced.len());
    let mut total_weight = 0u64;

    for id in children {
        let Some(node) = store.get(*id) else {
            continue;
        };
        let weight = weight_of(node.total_bytes);
        total_weight += weight;
        if forced.contains(id) {
            kept.push((weight, *id));
        } else {
            top.push(weight, *id, node.total_bytes);
        }
    }

    let (retained, folded) = top.into_sorted();
    let retained_bytes: u64 = retained.iter().map(|(_, _, bytes)| *bytes).sum();
    let kept_bytes: u64 = kept
        .iter()
        .filter_map(|(_, id)| store.get(*id))
        .map(|n| n.total_bytes)
        .sum();
    let all_bytes: u64 = children
        .iter()
        .filter_map(|id| store.get(*id))
        .map(|n| n.total_bytes)
        .sum();
    kept.extend(retained.into_iter().map(|(weight, id, _)| (weight, id)));

    Selection {
        kept,
        remainder: Folding {
            items: folded.count,
            bytes: all_bytes.saturating_sub(retained_bytes + kept_bytes),
            bytes_weight: folded.weight,
        },
        total_weight,
    }
}

fn header_height(rect: Rect, complete: bool) -> f32 {
    let mut header = (rect.height * 0.08).clamp(HEADER_MIN, HEADER_MAX - HEADER_INCOMPLETE_EXTRA);
    if !complete {
        header += HEADER_INCOMPLETE_EXTRA;
    }
    header.min(HEADER_MAX)
}
