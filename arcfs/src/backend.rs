//! The capability surface a mounted backend exposes to the daemon.

use std::path::Path;

use crate::{
    attr::AttributeMatcher,
    error::Result,
    info::{CopyFlags, FileInfo, QueryFlags},
    job::Job,
};

/// Invoked with `(bytes_copied, total_bytes)` before a transfer starts and
/// after every block.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(u64, u64);

/// Static facts about a mounted filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub fs_type: String,
    pub read_only: bool,
}

/// One mounted filesystem. The daemon drives every backend through this
/// trait object, whether it wraps an archive, a local directory or a remote
/// protocol.
pub trait Filesystem: Send + Sync {
    fn query_info(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Result<FileInfo>;

    fn enumerate(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Result<Vec<FileInfo>>;

    fn open_for_read(&self, path: &str, job: &Job) -> Result<Box<dyn ReadHandle>>;

    /// Rename in place. Returns the renamed file's new path.
    fn set_display_name(&self, path: &str, display_name: &str, job: &Job) -> Result<String>;

    fn move_file(
        &self,
        source: &str,
        destination: &str,
        flags: CopyFlags,
        job: &Job,
    ) -> Result<()>;

    fn delete(&self, path: &str, job: &Job) -> Result<()>;

    fn make_directory(&self, path: &str, job: &Job) -> Result<()>;

    /// Copy a local file into the filesystem.
    fn push(
        &self,
        destination: &str,
        source: &Path,
        flags: CopyFlags,
        remove_source: bool,
        progress: Option<ProgressCallback<'_>>,
        job: &Job,
    ) -> Result<()>;

    fn query_fs_info(&self) -> FsInfo {
        FsInfo::default()
    }
}

/// An open file returned by [`Filesystem::open_for_read`].
pub trait ReadHandle: Send {
    /// Read the next content bytes; 0 at the end of the file.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    fn can_seek(&self) -> bool {
        false
    }

    fn close(self: Box<Self>) -> Result<()>;
}
