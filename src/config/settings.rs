use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MAX_TOP_FILES: usize = 4096;
pub const MAX_SCAN_THREADS: usize = 16;
pub const MAX_SCANS_PER_VOLUME: usize = 8;
pub const MAX_CACHE_TTL_SECONDS: u64 = 3600;
pub const MAX_CACHE_ENTRIES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Files kept individually per directory; the rest fold into one bucket.
    pub top_files_per_directory: usize,
    pub scan_threads: usize,
    pub max_concurrent_scans_per_volume: usize,
    pub cache_enabled: bool,
    /// 0 means entries never expire.
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let scan_threads = match detect_storage_type() {
            StorageType::SSD => 8,
            StorageType::HDD => 2,
            StorageType::Unknown => 4,
        };

        Self {
            top_files_per_directory: 100,
            scan_threads,
            max_concurrent_scans_per_volume: 2,
            cache_enabled: true,
            cache_ttl_seconds: 600,
            cache_max_entries: 8,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file. Missing keys take their defaults and
    /// out-of-range values are clamped.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(settings.clamped())
    }

    pub fn clamped(mut self) -> Self {
        self.top_files_per_directory = self.top_files_per_directory.min(MAX_TOP_FILES);
        self.scan_threads = self.scan_threads.clamp(1, MAX_SCAN_THREADS);
        self.max_concurrent_scans_per_volume = self
            .max_concurrent_scans_per_volume
            .clamp(1, MAX_SCANS_PER_VOLUME);
        self.cache_ttl_seconds = self.cache_ttl_seconds.min(MAX_CACHE_TTL_SECONDS);
        self.cache_max_entries = self.cache_max_entries.min(MAX_CACHE_ENTRIES);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    SSD,
    HDD,
    Unknown,
}

pub fn detect_storage_type() -> StorageType {
    #[cfg(target_os = "macos")]
    {
        detect_storage_type_macos()
    }
    #[cfg(target_os = "linux")]
    {
        detect_storage_type_linux()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        StorageType::Unknown
    }
}

#[cfg(target_os = "macos")]
fn detect_storage_type_macos() -> StorageType {
    use std::process::Command;

    let output = Command::new("system_profiler")
        .arg("SPStorageDataType")
        .output();

    match output {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout).to_lowercase();
            if text.contains("solid state") || text.contains("ssd") || text.contains("nvme") {
                StorageType::SSD
            } else if text.contains("rotational") || text.contains("hdd") {
                StorageType::HDD
            } else {
                StorageType::Unknown
            }
        }
        Err(_) => StorageType::Unknown,
    }
}

#[cfg(target_os = "linux")]
fn detect_storage_type_linux() -> StorageType {
    use std::fs;

    let entries = match fs::read_dir("/sys/block") {
        Ok(e) => e,
        Err(_) => return StorageType::Unknown,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if !name_str.starts_with("sd") && !name_str.starts_with("nvme") {
            continue;
        }

        let rotational_path = format!("/sys/block/{}/queue/rotational", name_str);
        if let Ok(val) = fs::read_to_string(&rotational_path) {
            return match val.trim() {
                "0" => StorageType::SSD,
                "1" => StorageType::HDD,
                _ => StorageType::Unknown,
            };
        }
    }

    StorageType::Unknown
}
