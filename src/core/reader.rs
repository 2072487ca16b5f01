use std::io;
use std::path::Path;

use compact_str::CompactString;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: CompactString,
    pub is_directory: bool,
    /// Symlinks, junctions and other reparse points are never descended.
    pub is_reparse_point: bool,
    pub size: u64,
}

impl DirEntryInfo {
    pub fn file(name: impl Into<CompactString>, size: u64) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
            is_reparse_point: false,
            size,
        }
    }

    pub fn directory(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
            is_reparse_point: false,
            size: 0,
        }
    }
}

pub type DirListing<'a> = Box<dyn Iterator<Item = io::Result<DirEntryInfo>> + Send + 'a>;

/// Directory enumeration capability. A failure to open the directory, or an
/// error item mid-listing, marks that directory as errored; it is never fatal
/// to the scan.
pub trait DirectoryReader: Send + Sync {
    fn list_directory<'a>(&'a self, path: &Path) -> io::Result<DirListing<'a>>;
}

/// Reads the local filesystem without following symlinks.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDirectoryReader;

impl DirectoryReader for FsDirectoryReader {
    fn list_directory<'a>(&'a self, path: &Path) -> io::Result<DirListing<'a>> {
        let entries = std::fs::read_dir(path)?;
        Ok(Box::new(entries.filter_map(|entry_result| {
            let entry = match entry_result {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let entry_path = entry.path();
            // An entry that vanished between readdir and stat is skipped,
            // not treated as a failure of the whole directory.
            let metadata = match std::fs::symlink_metadata(&entry_path) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::debug!(path = %entry_path.display(), error = %e, "skipping entry");
                    return None;
                }
            };
            let file_type = metadata.file_type();
            let is_reparse_point = file_type.is_symlink();
            let is_directory = file_type.is_dir();
            Some(Ok(DirEntryInfo {
                name: CompactString::from(entry.file_name().to_string_lossy()),
                is_directory,
                is_reparse_point,
                size: if is_directory { 0 } else { metadata.len() },
            }))
        })))
    }
}
