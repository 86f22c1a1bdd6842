//! File metadata records and the flag sets that travel with queries.

use std::time::{SystemTime, UNIX_EPOCH};

bitflags::bitflags! {
    /// Behavior switches for metadata queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        const NOFOLLOW_SYMLINKS = 1 << 0;
    }

    /// Behavior switches for copy-like operations (move, push).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CopyFlags: u32 {
        const OVERWRITE = 1 << 0;
        const NOFOLLOW_SYMLINKS = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    SymbolicLink,
    Special,
    #[default]
    Unknown,
}

/// A point in time with microsecond precision, as stored on file metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTime {
    pub sec: i64,
    pub usec: u32,
}

impl FileTime {
    pub fn new(sec: i64, usec: u32) -> Self {
        FileTime { sec, usec }
    }

    pub fn from_system(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => FileTime {
                sec: since.as_secs() as i64,
                usec: since.subsec_micros(),
            },
            Err(err) => {
                let before = err.duration();
                FileTime {
                    sec: -(before.as_secs() as i64),
                    usec: before.subsec_micros(),
                }
            }
        }
    }
}

/// Per-file operation permissions as reported to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub execute: bool,
    pub rename: bool,
    pub trash: bool,
}

/// A duplicable record of one file's attributes.
///
/// Everything optional may be absent when the producing backend does not
/// know it. The record carries no identity of its own; the cache and the
/// archive tree both key it by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub display_name: String,
    pub file_type: FileType,
    pub size: Option<u64>,
    pub is_symlink: bool,
    pub symlink_target: Option<String>,
    pub atime: Option<FileTime>,
    pub mtime: Option<FileTime>,
    pub ctime: Option<FileTime>,
    pub btime: Option<FileTime>,
    pub inode: Option<u64>,
    pub unix_mode: Option<u32>,
    pub access: Access,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, file_type: FileType) -> Self {
        let name = name.into();
        FileInfo {
            display_name: name.clone(),
            name,
            file_type,
            is_symlink: file_type == FileType::SymbolicLink,
            ..Default::default()
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        FileInfo::new(name, FileType::Directory)
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.file_type == FileType::Regular
    }

    /// Rename the record, keeping the display name in sync.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
        self.display_name = name.to_owned();
    }
}
