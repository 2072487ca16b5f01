use std::fmt;

use serde::{Deserialize, Serialize};

/// Dense handle into the node table. `0` is never a valid node and the root
/// of a scan is always `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const INVALID: NodeId = NodeId(0);
    pub const ROOT: NodeId = NodeId(1);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScanState {
    #[default]
    NotStarted,
    Queued,
    Scanning,
    Done,
    Error,
    Canceled,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Done | ScanState::Error | ScanState::Canceled)
    }
}

/// Span inside the store's name arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NameRef {
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent: NodeId,
    pub is_directory: bool,
    /// "N more items" remainder bucket rather than a real entry.
    pub is_synthetic: bool,
    pub state: ScanState,
    pub name: NameRef,
    /// Own bytes for files, subtree sum for directories.
    pub total_bytes: u64,
    pub children_start: u32,
    pub children_count: u32,
    pub children_capacity: u32,
    pub aggregate_folders: u64,
    pub aggregate_files: u64,
}

impl Node {
    /// Vacant slots in the table have id 0.
    pub fn is_vacant(&self) -> bool {
        !self.id.is_valid()
    }

    pub fn has_children(&self) -> bool {
        self.children_count > 0
    }

    /// A directory's `total_bytes` is only authoritative once it is `Done`.
    pub fn is_complete(&self) -> bool {
        !self.is_directory || self.state == ScanState::Done
    }

    pub fn percentage(&self, total_size: u64) -> f64 {
        if total_size == 0 {
            return 0.0;
        }
        (self.total_bytes as f64 / total_size as f64) * 100.0
    }

    pub fn human_readable_size(&self) -> String {
        human_readable_size(self.total_bytes)
    }
}

pub fn human_readable_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
