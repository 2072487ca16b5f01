use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::{Node, NodeId};

/// Flattened, owned copy of a finished tree: the node table, the children
/// arena and the name arena, ready to be restored into a `TreeStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResultSnapshot {
    pub root_path: PathBuf,
    pub nodes: Vec<Node>,
    pub children: Vec<NodeId>,
    pub names: String,
    pub synthetic: Vec<(NodeId, NodeId)>,
    pub next_id: u32,
    pub captured_at: DateTime<Utc>,
}

impl ScanResultSnapshot {
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.is_vacant()).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.nodes
            .get(NodeId::ROOT.index())
            .map(|n| n.total_bytes)
            .unwrap_or(0)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.nodes.get(id.index()) {
            Some(node) if node.children_count > 0 => {
                let start = node.children_start as usize;
                &self.children[start..start + node.children_count as usize]
            }
            _ => &[],
        }
    }
}
