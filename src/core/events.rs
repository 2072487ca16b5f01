use compact_str::CompactString;
use smallvec::SmallVec;

use crate::models::node::{NodeId, ScanState};

/// One retained file in a directory's top-K batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: NodeId,
    pub name: CompactString,
    pub bytes: u64,
}

/// Files folded out of the top-K batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Remainder {
    pub bytes: u64,
    pub files: u64,
}

impl Remainder {
    pub fn is_empty(&self) -> bool {
        self.files == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    AddChild {
        parent: NodeId,
        id: NodeId,
        name: CompactString,
        is_directory: bool,
        bytes: u64,
    },
    UpdateSize {
        id: NodeId,
        total_bytes: u64,
    },
    UpdateState {
        id: NodeId,
        state: ScanState,
    },
    DirectoryFilesSummary {
        parent: NodeId,
        files: SmallVec<[FileEntry; 8]>,
        other: Remainder,
    },
    Progress {
        files_scanned: u64,
        dirs_scanned: u64,
        bytes_scanned: u64,
        errors: u64,
    },
}

/// An update produced by a scanner thread, tagged with the generation it was
/// produced under. Consumed exactly once by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub generation: u64,
    pub kind: UpdateKind,
}

impl PendingUpdate {
    pub fn new(generation: u64, kind: UpdateKind) -> Self {
        Self { generation, kind }
    }

    pub fn state(generation: u64, id: NodeId, state: ScanState) -> Self {
        Self::new(generation, UpdateKind::UpdateState { id, state })
    }

    pub fn size(generation: u64, id: NodeId, total_bytes: u64) -> Self {
        Self::new(generation, UpdateKind::UpdateSize { id, total_bytes })
    }
}
