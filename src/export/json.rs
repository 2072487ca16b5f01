use std::path::Path;

use serde::Serialize;

use crate::models::node::{NodeId, ScanState};
use crate::models::tree_store::TreeStore;

#[derive(Debug, Serialize)]
pub struct ExportNode {
    pub name: String,
    pub bytes: u64,
    pub state: ScanState,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_synthetic: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub aggregate_files: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub aggregate_folders: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExportNode>,
}

#[derive(Debug, Serialize)]
pub struct ExportDocument {
    pub root_path: String,
    pub exported_at: chrono::DateTime<chrono::Utc>,
    pub node_count: usize,
    pub root: ExportNode,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Build the nested form of the tree rooted at `id`.
pub fn export_tree(store: &TreeStore, id: NodeId) -> Option<ExportNode> {
    let node = store.get(id)?;
    let mut children: Vec<ExportNode> = store
        .children(id)
        .iter()
        .filter_map(|child| export_tree(store, *child))
        .collect();
    children.sort_by(|a, b| b.bytes.cmp(&a.bytes));
    Some(ExportNode {
        name: store.name(id).to_string(),
        bytes: node.total_bytes,
        state: node.state,
        is_directory: node.is_directory,
        is_synthetic: node.is_synthetic,
        aggregate_files: node.aggregate_files,
        aggregate_folders: node.aggregate_folders,
        children,
    })
}

pub fn export_json(store: &TreeStore, output_path: &Path) -> anyhow::Result<()> {
    let root = export_tree(store, NodeId::ROOT)
        .ok_or_else(|| anyhow::anyhow!("tree has no root node"))?;
    let document = ExportDocument {
        root_path: store.root_path().to_string_lossy().to_string(),
        exported_at: chrono::Utc::now(),
        node_count: store.node_count(),
        root,
    };
    let json = serde_json::to_string_pretty(&document)?;
    std::fs::write(output_path, json)?;
    Ok(())
}
