//! A mounted archive exposed as a filesystem.
//!
//! Metadata comes from an in-memory tree built at mount time; content reads
//! scan the archive sequentially. Every mutation is a full rewrite pass
//! into a temporary file that replaces the archive only when the pass
//! succeeded, so a failed or cancelled operation leaves the backing file
//! byte-identical.

mod session;
mod tree;

use std::{
    fs::{self, File, OpenOptions},
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    attr::AttributeMatcher,
    backend::{Filesystem, FsInfo, ProgressCallback, ReadHandle},
    codec::{Codec, EntryHeader, EntryKind, EntryTime, FilterCode, FormatCode, FORMAT_EMPTY},
    error::{Error, Result},
    info::{Access, CopyFlags, FileInfo, FileTime, FileType, QueryFlags},
    job::Job,
    mount::{self, MountSpec},
    BLOCK_SIZE,
};

use session::ArchiveSession;
use tree::ArchiveTree;

pub struct ArchiveBackend {
    path: PathBuf,
    codec: Arc<dyn Codec>,

    /// Serializes tree access; held briefly by readers and by the commit
    /// step of mutations, never across archive I/O.
    tree: Mutex<ArchiveTree>,

    /// Serializes mutations. Taken with `try_lock` only, so a second
    /// concurrent write fails fast instead of queueing.
    write_lock: Mutex<()>,

    format: FormatCode,
    filters: Vec<FilterCode>,
    writable: bool,
}

impl ArchiveBackend {
    /// Mount an archive described by `spec`.
    ///
    /// Without `create` the format and filter chain are probed from the
    /// file and writability is verified against the codec. With `create`
    /// an empty archive with the requested format is written first.
    pub fn mount(spec: &MountSpec, codec: Arc<dyn Codec>, job: &Job) -> Result<ArchiveBackend> {
        let options = mount::parse(spec)?;
        debug!("mounting {}", options.path.display());

        let (format, filters, writable) = match &options.create {
            Some(create) => (create.format, create.filters.clone(), true),
            None => Self::determine_format(codec.as_ref(), &options.path, job)?,
        };

        let root_info = root_info(&options.path, writable);
        let mut backend = ArchiveBackend {
            path: options.path,
            codec,
            tree: Mutex::new(ArchiveTree::new(root_info)),
            write_lock: Mutex::new(()),
            format,
            filters,
            writable,
        };

        if options.create.is_some() {
            backend.create_empty_archive(job)?;
        } else {
            backend.build_tree(job)?;
        }

        Ok(backend)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Probe the archive: detect format and filters from the first header,
    /// then check the codec can write that combination back.
    fn determine_format(
        codec: &dyn Codec,
        path: &Path,
        job: &Job,
    ) -> Result<(FormatCode, Vec<FilterCode>, bool)> {
        let mut session = ArchiveSession::read(codec, path, job);
        let _ = session.read_header();
        let format = session.format().unwrap_or(FORMAT_EMPTY);
        let filters = session.filters().unwrap_or_default();
        session.finish()?;

        if format == FORMAT_EMPTY {
            return Err(Error::NotMountable);
        }

        let writable = codec.can_write(format, &filters);
        debug!("detected format {format}, filters {filters:?}, writable: {writable}");

        Ok((format, filters, writable))
    }

    /// Create the backing file and write an empty archive into it.
    fn create_empty_archive(&self, job: &Job) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => Error::Exists,
                _ => err.into(),
            })?;

        let session = ArchiveSession::write(
            self.codec.as_ref(),
            &self.path,
            job,
            self.format,
            &self.filters,
        );
        let result = session.finish();
        if result.is_err() {
            let _ = fs::remove_file(&self.path);
        }
        result
    }

    /// One full header scan; every entry lands in the tree under its
    /// canonicalized path, with its ordinal as the reported inode.
    fn build_tree(&mut self, job: &Job) -> Result<()> {
        let mut session = ArchiveSession::read(self.codec.as_ref(), &self.path, job);
        let tree = self.tree.get_mut();

        let mut entry_index = 0u64;
        while let Some(header) = session.read_header() {
            if let Some(id) = tree.get(&header.path, true) {
                if id != tree.root() {
                    let name = tree.node(id).name.clone();
                    let info = entry_to_info(&header, &name, entry_index, self.writable);
                    tree.node_mut(id).info = Some(info);
                }
            }
            session.skip_data();
            entry_index += 1;
        }
        session.finish()?;

        tree.fixup();
        Ok(())
    }

    fn read_write_session(&self, job: &Job) -> ArchiveSession {
        ArchiveSession::read_write(
            self.codec.as_ref(),
            &self.path,
            job,
            self.format,
            &self.filters,
        )
    }

    pub fn query_info(
        &self,
        path: &str,
        _matcher: &AttributeMatcher,
        _flags: QueryFlags,
    ) -> Result<FileInfo> {
        let tree = self.tree.lock();
        let id = tree.find(path).ok_or(Error::NotFound)?;
        Ok(node_info(&tree, id).clone())
    }

    pub fn enumerate(
        &self,
        path: &str,
        _matcher: &AttributeMatcher,
        _flags: QueryFlags,
    ) -> Result<Vec<FileInfo>> {
        let tree = self.tree.lock();
        let id = tree.find(path).ok_or(Error::NotFound)?;

        if node_info(&tree, id).file_type != FileType::Directory {
            return Err(Error::NotDirectory);
        }

        Ok(tree
            .node(id)
            .children
            .iter()
            .map(|child| node_info(&tree, *child).clone())
            .collect())
    }

    /// Open one entry for sequential reading. The tree answers the
    /// existence check; a fresh session then scans the archive for the
    /// matching header and stays parked there as the handle.
    pub fn open_for_read(&self, path: &str, job: &Job) -> Result<Box<dyn ReadHandle>> {
        {
            let tree = self.tree.lock();
            let id = tree.find(path).ok_or(Error::NotFound)?;
            if node_info(&tree, id).file_type == FileType::Directory {
                return Err(Error::IsDirectory);
            }
        }

        let target = rel(path);
        let mut session = ArchiveSession::read(self.codec.as_ref(), &self.path, job);
        loop {
            match session.read_header() {
                Some(header) if header.path == target => {
                    debug!("open for read: {path}");
                    return Ok(Box::new(ArchiveReadHandle { session }));
                }
                Some(_) => session.skip_data(),
                None => break,
            }
        }

        if !session.in_error() {
            session.set_error(Error::NotFound);
        }
        match session.finish() {
            Err(err) => Err(err),
            Ok(()) => Err(Error::NotFound),
        }
    }

    /// Rename an entry within its directory. Returns the new path.
    pub fn set_display_name(&self, path: &str, display_name: &str, job: &Job) -> Result<String> {
        let _write = self.write_lock.try_lock().ok_or(Error::Busy)?;
        debug!("rename {path} to {display_name}");

        if display_name.is_empty() || display_name.contains('/') {
            return Err(Error::invalid_argument("Filename is invalid"));
        }
        if path == "/" {
            return Err(Error::NotSupported);
        }
        {
            let tree = self.tree.lock();
            tree.find(path).ok_or(Error::NotFound)?;
        }

        let parent = &path[..path.rfind('/').unwrap_or(0)];
        let new_path = format!("{parent}/{display_name}");
        if new_path == path {
            return Ok(new_path);
        }

        {
            let tree = self.tree.lock();
            if tree.find(&new_path).is_some() {
                return Err(Error::Exists);
            }
        }

        let source_rel = rel(path).to_owned();
        let target_rel = rel(&new_path).to_owned();

        let mut session = self.read_write_session(job);
        while let Some(mut header) = session.copy_prefix(Some(&source_rel), None) {
            header.path = format!("{target_rel}{}", &header.path[source_rel.len()..]);
            session.write_header(&header);
            session.copy_data();
        }

        if !session.in_error() {
            let mut tree = self.tree.lock();
            if let Some(id) = tree.find(path) {
                tree.node_mut(id).name = display_name.to_owned();
                if let Some(info) = tree.node_mut(id).info.as_mut() {
                    info.set_name(display_name);
                }
            }
        }

        session.finish()?;
        Ok(new_path)
    }

    pub fn move_file(
        &self,
        source: &str,
        destination: &str,
        flags: CopyFlags,
        job: &Job,
    ) -> Result<()> {
        let _write = self.write_lock.try_lock().ok_or(Error::Busy)?;
        debug!("move {source} to {destination}");

        if source == "/" {
            return Err(Error::NotSupported);
        }

        {
            let tree = self.tree.lock();
            let source_id = tree.find(source).ok_or(Error::NotFound)?;

            if source == destination {
                return Ok(());
            }

            if let Some(destination_id) = tree.find(destination) {
                if flags.contains(CopyFlags::OVERWRITE) {
                    if node_info(&tree, source_id).file_type == FileType::Directory
                        && node_info(&tree, destination_id).file_type == FileType::Directory
                    {
                        return Err(Error::WouldMerge);
                    }
                } else {
                    return Err(Error::Exists);
                }
            }
        }

        if !flags.contains(CopyFlags::NOFOLLOW_SYMLINKS) {
            warn!("symlinks are not followed when moving archive entries");
        }

        let source_rel = rel(source).to_owned();
        let target_rel = rel(destination).to_owned();

        let mut session = self.read_write_session(job);
        while let Some(header) = session.copy_prefix(Some(&target_rel), Some(&source_rel)) {
            if session::matches_prefix(&header.path, Some(&source_rel)) {
                let mut header = header;
                header.path = format!("{target_rel}{}", &header.path[source_rel.len()..]);
                session.write_header(&header);
                session.copy_data();
            } else {
                // An overwritten destination entry; drop it.
                session.skip_data();
            }
        }

        if !session.in_error() {
            let mut tree = self.tree.lock();
            if let Some(source_id) = tree.find(source) {
                let destination_id = match tree.find(destination) {
                    Some(id) => id,
                    None => tree
                        .get(&target_rel, true)
                        .expect("adding lookups cannot fail"),
                };
                let parent = tree
                    .node(destination_id)
                    .parent
                    .expect("destination is not the root");

                tree.detach(source_id);
                tree.remove_subtree(destination_id);
                tree.attach(source_id, parent);

                let name = basename(destination).to_owned();
                if let Some(info) = tree.node_mut(source_id).info.as_mut() {
                    info.set_name(&name);
                }
                tree.node_mut(source_id).name = name;
            }
        }

        session.finish()
    }

    pub fn delete(&self, path: &str, job: &Job) -> Result<()> {
        let _write = self.write_lock.try_lock().ok_or(Error::Busy)?;
        debug!("delete {path}");

        if path == "/" {
            return Err(Error::NotSupported);
        }
        {
            let tree = self.tree.lock();
            tree.find(path).ok_or(Error::NotFound)?;
        }

        let target_rel = rel(path).to_owned();
        let mut session = self.read_write_session(job);
        while session.copy_prefix(Some(&target_rel), None).is_some() {
            session.skip_data();
        }

        if !session.in_error() {
            let mut tree = self.tree.lock();
            if let Some(id) = tree.find(path) {
                tree.remove_subtree(id);
            }
        }

        session.finish()
    }

    pub fn make_directory(&self, path: &str, job: &Job) -> Result<()> {
        let _write = self.write_lock.try_lock().ok_or(Error::Busy)?;
        debug!("make directory {path}");

        {
            let tree = self.tree.lock();
            if tree.find(path).is_some() {
                return Err(Error::Exists);
            }
        }

        let target_rel = rel(path).to_owned();
        let mut session = self.read_write_session(job);
        session.copy_all();
        session.write_header(&EntryHeader {
            path: target_rel.clone(),
            kind: EntryKind::Directory,
            mode: 0o755,
            ..Default::default()
        });

        if !session.in_error() {
            let mut tree = self.tree.lock();
            tree.get(&target_rel, true);
            tree.fixup();
        }

        session.finish()
    }

    /// Copy a local file into the archive. The entry's metadata comes from
    /// the local file without following symlinks; content is streamed
    /// block by block with progress reported along the way.
    pub fn push(
        &self,
        destination: &str,
        source: &Path,
        flags: CopyFlags,
        remove_source: bool,
        mut progress: Option<ProgressCallback<'_>>,
        job: &Job,
    ) -> Result<()> {
        let _write = self.write_lock.try_lock().ok_or(Error::Busy)?;
        debug!("push {} to {destination}", source.display());

        let is_dir = fs::metadata(source)
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);

        {
            let tree = self.tree.lock();
            if let Some(id) = tree.find(destination) {
                if flags.contains(CopyFlags::OVERWRITE) {
                    if is_dir {
                        return if node_info(&tree, id).file_type == FileType::Directory {
                            Err(Error::WouldMerge)
                        } else {
                            Err(Error::WouldRecurse)
                        };
                    }
                } else {
                    return Err(Error::Exists);
                }
            }
        }

        if is_dir {
            return Err(Error::WouldRecurse);
        }

        if !flags.contains(CopyFlags::NOFOLLOW_SYMLINKS) {
            warn!("symlinks are not followed when pushing into an archive");
        }

        let target_rel = rel(destination).to_owned();
        let mut session = self.read_write_session(job);
        while session.copy_prefix(Some(&target_rel), None).is_some() {
            session.skip_data();
        }
        if session.in_error() {
            return session.finish();
        }

        let info = match local_file_info(source) {
            Ok(info) => info,
            Err(err) => {
                session.set_error(err);
                return session.finish();
            }
        };

        let header = info_to_entry(&target_rel, &info);
        session.write_header(&header);

        let total = header.size.unwrap_or(0);
        let mut copied = 0u64;
        if let Some(callback) = progress.as_mut() {
            callback(copied, total);
        }

        if info.file_type == FileType::Regular {
            match File::open(source) {
                Ok(mut stream) => {
                    let mut buffer = [0u8; BLOCK_SIZE];
                    loop {
                        let read_bytes = match stream.read(&mut buffer) {
                            Ok(count) => count,
                            Err(err) => {
                                session.set_error(err.into());
                                break;
                            }
                        };
                        if read_bytes == 0 {
                            break;
                        }

                        session.write_data(&buffer[..read_bytes]);
                        copied += read_bytes as u64;
                        if let Some(callback) = progress.as_mut() {
                            callback(copied, total);
                        }

                        if job.is_cancelled() {
                            session.set_error(Error::Cancelled);
                        }
                        if session.in_error() {
                            break;
                        }
                    }
                }
                Err(err) => session.set_error(err.into()),
            }
        }

        if !session.in_error() {
            let mut tree = self.tree.lock();
            if let Some(id) = tree.get(&target_rel, true) {
                let name = tree.node(id).name.clone();
                let mut stored = info;
                stored.set_name(&name);
                stored.access = access_for(self.writable);
                tree.node_mut(id).info = Some(stored);
            }
        }

        session.finish()?;

        if remove_source {
            fs::remove_file(source)?;
        }
        Ok(())
    }

    pub fn query_fs_info(&self) -> FsInfo {
        FsInfo {
            fs_type: "archive".to_owned(),
            read_only: !self.writable,
        }
    }
}

impl Filesystem for ArchiveBackend {
    fn query_info(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Result<FileInfo> {
        ArchiveBackend::query_info(self, path, matcher, flags)
    }

    fn enumerate(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Result<Vec<FileInfo>> {
        ArchiveBackend::enumerate(self, path, matcher, flags)
    }

    fn open_for_read(&self, path: &str, job: &Job) -> Result<Box<dyn ReadHandle>> {
        ArchiveBackend::open_for_read(self, path, job)
    }

    fn set_display_name(&self, path: &str, display_name: &str, job: &Job) -> Result<String> {
        ArchiveBackend::set_display_name(self, path, display_name, job)
    }

    fn move_file(
        &self,
        source: &str,
        destination: &str,
        flags: CopyFlags,
        job: &Job,
    ) -> Result<()> {
        ArchiveBackend::move_file(self, source, destination, flags, job)
    }

    fn delete(&self, path: &str, job: &Job) -> Result<()> {
        ArchiveBackend::delete(self, path, job)
    }

    fn make_directory(&self, path: &str, job: &Job) -> Result<()> {
        ArchiveBackend::make_directory(self, path, job)
    }

    fn push(
        &self,
        destination: &str,
        source: &Path,
        flags: CopyFlags,
        remove_source: bool,
        progress: Option<ProgressCallback<'_>>,
        job: &Job,
    ) -> Result<()> {
        ArchiveBackend::push(self, destination, source, flags, remove_source, progress, job)
    }

    fn query_fs_info(&self) -> FsInfo {
        ArchiveBackend::query_fs_info(self)
    }
}

/// Sequential, non-seekable reader over one archive entry.
struct ArchiveReadHandle {
    session: ArchiveSession,
}

impl ReadHandle for ArchiveReadHandle {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let count = self.session.read_data(buffer);
        match self.session.take_error() {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.session.finish()
    }
}

fn rel(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').find(|part| !part.is_empty()).unwrap_or("/")
}

fn node_info(tree: &ArchiveTree, id: tree::NodeId) -> &FileInfo {
    tree.node(id)
        .info
        .as_ref()
        .expect("tree node without info after fixup")
}

fn access_for(writable: bool) -> Access {
    Access {
        read: true,
        write: writable,
        delete: writable,
        execute: writable,
        rename: writable,
        trash: false,
    }
}

fn root_info(path: &Path, writable: bool) -> FileInfo {
    let mut info = FileInfo::directory("/");
    info.display_name = format!(
        "/ on {}",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    info.access = access_for(writable);
    info
}

fn entry_time_to_file_time(time: Option<EntryTime>) -> Option<FileTime> {
    time.map(|time| FileTime {
        sec: time.sec,
        usec: time.nsec / 1000,
    })
}

fn file_time_to_entry_time(time: Option<FileTime>) -> Option<EntryTime> {
    time.map(|time| EntryTime {
        sec: time.sec,
        nsec: time.usec * 1000,
    })
}

/// Build the info a tree node carries from one archive entry.
fn entry_to_info(header: &EntryHeader, name: &str, entry_index: u64, writable: bool) -> FileInfo {
    let file_type = match header.kind {
        EntryKind::Regular => FileType::Regular,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::SymbolicLink,
        EntryKind::CharDevice
        | EntryKind::BlockDevice
        | EntryKind::Fifo
        | EntryKind::Socket => FileType::Special,
        EntryKind::Unknown => {
            warn!("unknown entry type for {}", header.path);
            FileType::Special
        }
    };

    let mut info = FileInfo::new(name, file_type);
    if file_type == FileType::SymbolicLink {
        info.symlink_target = header.symlink_target.clone();
    }
    info.size = header.size;
    info.atime = entry_time_to_file_time(header.atime);
    info.mtime = entry_time_to_file_time(header.mtime);
    info.ctime = entry_time_to_file_time(header.ctime);
    info.btime = entry_time_to_file_time(header.btime);
    info.unix_mode = Some(header.mode);

    // The ordinal doubles as the inode, stable as long as the archive is.
    info.inode = Some(entry_index);
    info.access = access_for(writable);

    info
}

/// Build the archive entry header for a record pushed from local metadata.
fn info_to_entry(pathname: &str, info: &FileInfo) -> EntryHeader {
    let kind = match info.file_type {
        FileType::Regular => EntryKind::Regular,
        FileType::Directory => EntryKind::Directory,
        FileType::SymbolicLink => EntryKind::Symlink,
        FileType::Special => special_kind(info.unix_mode).unwrap_or_else(|| {
            warn!("unknown file mode for {pathname}");
            EntryKind::Regular
        }),
        FileType::Unknown => {
            warn!("unknown file type for {pathname}");
            EntryKind::Regular
        }
    };

    let size = match info.file_type {
        FileType::Regular => info.size.unwrap_or(0),
        _ => 0,
    };

    EntryHeader {
        path: pathname.to_owned(),
        kind,
        size: Some(size),
        mode: 0o644,
        atime: file_time_to_entry_time(info.atime),
        mtime: file_time_to_entry_time(info.mtime),
        ctime: file_time_to_entry_time(info.ctime),
        btime: file_time_to_entry_time(info.btime),
        symlink_target: info
            .symlink_target
            .as_ref()
            .map(|target| target.strip_prefix('/').unwrap_or(target).to_owned()),
    }
}

#[cfg(unix)]
fn special_kind(mode: Option<u32>) -> Option<EntryKind> {
    let mode = mode?;
    match mode & (libc::S_IFMT as u32) {
        m if m == libc::S_IFCHR as u32 => Some(EntryKind::CharDevice),
        m if m == libc::S_IFBLK as u32 => Some(EntryKind::BlockDevice),
        m if m == libc::S_IFIFO as u32 => Some(EntryKind::Fifo),
        m if m == libc::S_IFSOCK as u32 => Some(EntryKind::Socket),
        _ => None,
    }
}

#[cfg(not(unix))]
fn special_kind(_mode: Option<u32>) -> Option<EntryKind> {
    None
}

/// Metadata of the local file being pushed, symlinks not followed.
fn local_file_info(path: &Path) -> Result<FileInfo> {
    let metadata = fs::symlink_metadata(path)?;

    let file_type = if metadata.file_type().is_symlink() {
        FileType::SymbolicLink
    } else if metadata.is_dir() {
        FileType::Directory
    } else if metadata.is_file() {
        FileType::Regular
    } else {
        FileType::Special
    };

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut info = FileInfo::new(name, file_type);
    info.size = Some(metadata.len());
    info.atime = metadata.accessed().ok().map(FileTime::from_system);
    info.mtime = metadata.modified().ok().map(FileTime::from_system);
    info.btime = metadata.created().ok().map(FileTime::from_system);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        info.ctime = Some(FileTime {
            sec: metadata.ctime(),
            usec: (metadata.ctime_nsec() / 1000) as u32,
        });
        info.unix_mode = Some(metadata.mode());
    }

    if file_type == FileType::SymbolicLink {
        info.symlink_target = fs::read_link(path)
            .ok()
            .map(|target| target.to_string_lossy().into_owned());
    }

    Ok(info)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use crate::codec::test::{BoxCodec, FORMAT_BOX};

    const FILE_CONTENT: &[u8] = b"content of file\n";
    const FILE2_CONTENT: &[u8] = b"content of file2\n";
    const DIR2_FILE_CONTENT: &[u8] = b"content of dir2/file\n";

    fn write_entries(path: &Path, entries: &[(&str, EntryKind, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = BoxCodec
            .open_writer(Box::new(file), FORMAT_BOX, &[])
            .unwrap();
        for (entry_path, kind, data) in entries {
            writer
                .write_header(&EntryHeader {
                    path: (*entry_path).to_owned(),
                    kind: *kind,
                    size: Some(data.len() as u64),
                    mode: 0o644,
                    mtime: Some(EntryTime {
                        sec: 1700000000,
                        nsec: 123456789,
                    }),
                    ..Default::default()
                })
                .unwrap();
            writer.write_data(data).unwrap();
        }
        writer.finish().unwrap();
    }

    /// The standard fixture: a file, a second file, an empty directory and
    /// a file inside another directory that has no entry of its own.
    fn standard_archive(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("test.box");
        write_entries(
            &path,
            &[
                ("file", EntryKind::Regular, FILE_CONTENT),
                ("file2", EntryKind::Regular, FILE2_CONTENT),
                ("dir/", EntryKind::Directory, b""),
                ("dir2/file", EntryKind::Regular, DIR2_FILE_CONTENT),
            ],
        );
        path
    }

    fn mount_path(path: &Path) -> ArchiveBackend {
        let spec = MountSpec::new().with("file", path.to_str().unwrap());
        ArchiveBackend::mount(&spec, Arc::new(BoxCodec), &Job::new()).unwrap()
    }

    fn matcher() -> AttributeMatcher {
        AttributeMatcher::unrestricted()
    }

    fn info(backend: &ArchiveBackend, path: &str) -> FileInfo {
        backend
            .query_info(path, &matcher(), QueryFlags::empty())
            .unwrap()
    }

    fn child_names(backend: &ArchiveBackend, path: &str) -> Vec<String> {
        let mut names: Vec<String> = backend
            .enumerate(path, &matcher(), QueryFlags::empty())
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        names.sort();
        names
    }

    fn read_all(backend: &ArchiveBackend, path: &str) -> Vec<u8> {
        let mut handle = backend.open_for_read(path, &Job::new()).unwrap();
        assert!(!handle.can_seek());

        let mut out = Vec::new();
        let mut buffer = [0u8; 7];
        loop {
            let count = handle.read(&mut buffer).unwrap();
            if count == 0 {
                break;
            }
            out.extend_from_slice(&buffer[..count]);
        }
        handle.close().unwrap();
        out
    }

    #[test]
    fn mount_probes_format_and_writability() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        assert_eq!(backend.format, FORMAT_BOX);
        assert!(backend.filters.is_empty());
        assert!(backend.is_writable());
        assert!(!backend.query_fs_info().read_only);
    }

    #[test]
    fn mount_refuses_an_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.box");
        File::create(&path).unwrap();

        let spec = MountSpec::new().with("file", path.to_str().unwrap());
        let result = ArchiveBackend::mount(&spec, Arc::new(BoxCodec), &Job::new());

        assert!(matches!(result, Err(Error::NotMountable)));
    }

    #[test]
    fn mount_surfaces_probe_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.box");

        let spec = MountSpec::new().with("file", path.to_str().unwrap());
        let result = ArchiveBackend::mount(&spec, Arc::new(BoxCodec), &Job::new());

        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn mount_detects_unwritable_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filtered.box");

        // A filter code the codec refuses to write back, spelled by hand
        // since the writer cannot produce it either.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BOXF");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&(-1i32 as u32).to_le_bytes());
        bytes.push(0);
        let mut file = File::create(&path).unwrap();
        file.write_all(&bytes).unwrap();

        let backend = mount_path(&path);
        assert!(!backend.is_writable());
        assert_eq!(backend.filters, vec![-1]);
        assert!(backend.query_fs_info().read_only);

        // Per-file access booleans follow the writable flag.
        let root = info(&backend, "/");
        assert!(root.access.read);
        assert!(!root.access.write);
        assert!(!root.access.trash);
    }

    #[test]
    fn mount_create_produces_an_empty_mountable_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.box");

        let spec = MountSpec::new()
            .with("file", path.to_str().unwrap())
            .with("create", "1")
            .with("format", FORMAT_BOX.to_string());
        let backend = ArchiveBackend::mount(&spec, Arc::new(BoxCodec), &Job::new()).unwrap();
        assert!(backend.is_writable());
        assert!(child_names(&backend, "/").is_empty());
        drop(backend);

        let backend = mount_path(&path);
        assert!(child_names(&backend, "/").is_empty());
    }

    #[test]
    fn mount_create_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);

        let spec = MountSpec::new()
            .with("file", path.to_str().unwrap())
            .with("create", "1")
            .with("format", FORMAT_BOX.to_string());
        let result = ArchiveBackend::mount(&spec, Arc::new(BoxCodec), &Job::new());

        assert!(matches!(result, Err(Error::Exists)));
    }

    #[test]
    fn query_info_and_enumerate() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        assert_eq!(child_names(&backend, "/"), ["dir", "dir2", "file", "file2"]);
        assert_eq!(child_names(&backend, "/dir"), Vec::<String>::new());
        assert_eq!(child_names(&backend, "/dir2"), ["file"]);

        let file = info(&backend, "/file");
        assert_eq!(file.file_type, FileType::Regular);
        assert_eq!(file.size, Some(FILE_CONTENT.len() as u64));
        assert!(file.access.write);

        // dir2 has no entry of its own; fixup made it a directory.
        let dir2 = info(&backend, "/dir2");
        assert_eq!(dir2.file_type, FileType::Directory);

        assert!(matches!(
            backend.query_info("/nonexistent", &matcher(), QueryFlags::empty()),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            backend.enumerate("/file", &matcher(), QueryFlags::empty()),
            Err(Error::NotDirectory)
        ));
        assert!(matches!(
            backend.enumerate("/nonexistent", &matcher(), QueryFlags::empty()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn inodes_are_the_entry_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        assert_eq!(info(&backend, "/file").inode, Some(0));
        assert_eq!(info(&backend, "/file2").inode, Some(1));
        assert_eq!(info(&backend, "/dir").inode, Some(2));
        assert_eq!(info(&backend, "/dir2/file").inode, Some(3));
    }

    #[test]
    fn entry_times_come_back_in_microseconds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        let mtime = info(&backend, "/file").mtime.unwrap();
        assert_eq!(mtime.sec, 1700000000);
        assert_eq!(mtime.usec, 123456);
    }

    #[test]
    fn open_for_read_streams_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        assert_eq!(read_all(&backend, "/file"), FILE_CONTENT);
        assert_eq!(read_all(&backend, "/dir2/file"), DIR2_FILE_CONTENT);

        assert!(matches!(
            backend.open_for_read("/dir", &Job::new()),
            Err(Error::IsDirectory)
        ));
        assert!(matches!(
            backend.open_for_read("/nonexistent", &Job::new()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn concurrent_readers_get_their_own_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        let mut first = backend.open_for_read("/file", &Job::new()).unwrap();
        let mut second = backend.open_for_read("/file2", &Job::new()).unwrap();

        let mut buffer = [0u8; 4];
        first.read(&mut buffer).unwrap();
        second.read(&mut buffer).unwrap();
        first.close().unwrap();
        second.close().unwrap();
    }

    #[test]
    fn set_display_name_renames_entry_and_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let backend = mount_path(&path);

        let new_path = backend
            .set_display_name("/dir2", "renamed", &Job::new())
            .unwrap();
        assert_eq!(new_path, "/renamed");
        assert_eq!(child_names(&backend, "/"), ["dir", "file", "file2", "renamed"]);
        assert_eq!(read_all(&backend, "/renamed/file"), DIR2_FILE_CONTENT);
        drop(backend);

        // A fresh mount sees the renamed tree.
        let backend = mount_path(&path);
        assert_eq!(child_names(&backend, "/"), ["dir", "file", "file2", "renamed"]);
        assert_eq!(read_all(&backend, "/renamed/file"), DIR2_FILE_CONTENT);
    }

    #[test]
    fn set_display_name_to_the_same_name_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let before = fs::read(&path).unwrap();
        let backend = mount_path(&path);

        let new_path = backend
            .set_display_name("/file", "file", &Job::new())
            .unwrap();

        assert_eq!(new_path, "/file");
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn set_display_name_validations() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));
        let job = Job::new();

        assert!(matches!(
            backend.set_display_name("/file", "a/b", &job),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            backend.set_display_name("/file", "", &job),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            backend.set_display_name("/", "root", &job),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            backend.set_display_name("/nonexistent", "x", &job),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            backend.set_display_name("/file", "file2", &job),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn move_replaces_a_file_with_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.box");
        write_entries(
            &path,
            &[
                ("file", EntryKind::Regular, FILE_CONTENT),
                ("file2", EntryKind::Regular, FILE2_CONTENT),
                ("dir2/file", EntryKind::Regular, DIR2_FILE_CONTENT),
            ],
        );
        let backend = mount_path(&path);

        backend
            .move_file("/dir2", "/file2", CopyFlags::OVERWRITE, &Job::new())
            .unwrap();

        assert_eq!(child_names(&backend, "/"), ["file", "file2"]);
        assert!(info(&backend, "/file2").is_directory());
        assert_eq!(read_all(&backend, "/file2/file"), DIR2_FILE_CONTENT);
        drop(backend);

        let backend = mount_path(&path);
        assert_eq!(child_names(&backend, "/"), ["file", "file2"]);
        assert!(info(&backend, "/file2").is_directory());
        assert_eq!(read_all(&backend, "/file2/file"), DIR2_FILE_CONTENT);
    }

    #[test]
    fn move_to_itself_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let before = fs::read(&path).unwrap();
        let backend = mount_path(&path);

        backend
            .move_file("/file", "/file", CopyFlags::empty(), &Job::new())
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn move_validations() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));
        let job = Job::new();

        assert!(matches!(
            backend.move_file("/", "/x", CopyFlags::empty(), &job),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            backend.move_file("/nonexistent", "/x", CopyFlags::empty(), &job),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            backend.move_file("/file", "/file2", CopyFlags::empty(), &job),
            Err(Error::Exists)
        ));
        assert!(matches!(
            backend.move_file("/dir", "/dir2", CopyFlags::OVERWRITE, &job),
            Err(Error::WouldMerge)
        ));
    }

    #[test]
    fn move_into_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let backend = mount_path(&path);

        backend
            .move_file("/file", "/dir/moved", CopyFlags::empty(), &Job::new())
            .unwrap();

        assert_eq!(child_names(&backend, "/"), ["dir", "dir2", "file2"]);
        assert_eq!(child_names(&backend, "/dir"), ["moved"]);
        assert_eq!(read_all(&backend, "/dir/moved"), FILE_CONTENT);
    }

    #[test]
    fn delete_removes_a_whole_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let backend = mount_path(&path);

        backend.delete("/dir2", &Job::new()).unwrap();
        assert_eq!(child_names(&backend, "/"), ["dir", "file", "file2"]);
        drop(backend);

        let backend = mount_path(&path);
        assert_eq!(child_names(&backend, "/"), ["dir", "file", "file2"]);
    }

    #[test]
    fn delete_validations() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));
        let job = Job::new();

        assert!(matches!(backend.delete("/", &job), Err(Error::NotSupported)));
        assert!(matches!(
            backend.delete("/nonexistent", &job),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn cancelled_delete_leaves_the_archive_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let before = fs::read(&path).unwrap();
        let backend = mount_path(&path);

        let job = Job::new();
        job.cancel();
        let result = backend.delete("/file", &job);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn make_directory_appends_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let backend = mount_path(&path);

        backend.make_directory("/newdir", &Job::new()).unwrap();
        assert!(info(&backend, "/newdir").is_directory());
        drop(backend);

        let backend = mount_path(&path);
        assert!(info(&backend, "/newdir").is_directory());
        assert_eq!(
            child_names(&backend, "/"),
            ["dir", "dir2", "file", "file2", "newdir"]
        );

        assert!(matches!(
            backend.make_directory("/newdir", &Job::new()),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn push_adds_a_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let backend = mount_path(&path);

        let local = dir.path().join("local.txt");
        fs::write(&local, b"pushed bytes").unwrap();

        backend
            .push(
                "/pushed",
                &local,
                CopyFlags::NOFOLLOW_SYMLINKS,
                false,
                None,
                &Job::new(),
            )
            .unwrap();

        assert_eq!(read_all(&backend, "/pushed"), b"pushed bytes");
        assert!(local.exists());
        drop(backend);

        let backend = mount_path(&path);
        assert_eq!(read_all(&backend, "/pushed"), b"pushed bytes");
    }

    #[test]
    fn push_without_overwrite_fails_and_preserves_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let before = fs::read(&path).unwrap();
        let backend = mount_path(&path);

        let local = dir.path().join("local.txt");
        fs::write(&local, b"new content").unwrap();

        let result = backend.push(
            "/file",
            &local,
            CopyFlags::NOFOLLOW_SYMLINKS,
            false,
            None,
            &Job::new(),
        );

        assert!(matches!(result, Err(Error::Exists)));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn push_with_overwrite_replaces_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let backend = mount_path(&path);

        let local = dir.path().join("local.txt");
        fs::write(&local, b"new content").unwrap();

        backend
            .push(
                "/file",
                &local,
                CopyFlags::OVERWRITE | CopyFlags::NOFOLLOW_SYMLINKS,
                false,
                None,
                &Job::new(),
            )
            .unwrap();

        assert_eq!(read_all(&backend, "/file"), b"new content");
        assert_eq!(child_names(&backend, "/"), ["dir", "dir2", "file", "file2"]);
    }

    #[test]
    fn push_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        let local_dir = dir.path().join("subdir");
        fs::create_dir(&local_dir).unwrap();

        let result = backend.push(
            "/target",
            &local_dir,
            CopyFlags::NOFOLLOW_SYMLINKS,
            false,
            None,
            &Job::new(),
        );

        assert!(matches!(result, Err(Error::WouldRecurse)));
    }

    #[test]
    fn push_reports_progress_and_can_remove_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        let local = dir.path().join("local.txt");
        fs::write(&local, b"12345").unwrap();

        let mut reports = Vec::new();
        let mut callback = |copied, total| reports.push((copied, total));
        backend
            .push(
                "/pushed",
                &local,
                CopyFlags::NOFOLLOW_SYMLINKS,
                true,
                Some(&mut callback),
                &Job::new(),
            )
            .unwrap();

        assert_eq!(reports, [(0, 5), (5, 5)]);
        assert!(!local.exists());
    }

    #[test]
    fn concurrent_writes_fail_fast_with_busy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        // Simulates a delete still holding the write lock.
        let _in_flight = backend.write_lock.try_lock().unwrap();

        assert!(matches!(
            backend.make_directory("/newdir", &Job::new()),
            Err(Error::Busy)
        ));
        assert!(matches!(
            backend.delete("/file", &Job::new()),
            Err(Error::Busy)
        ));
        assert!(matches!(
            backend.push(
                "/x",
                Path::new("/nonexistent"),
                CopyFlags::empty(),
                false,
                None,
                &Job::new()
            ),
            Err(Error::Busy)
        ));
    }

    #[test]
    fn reads_are_not_blocked_by_the_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let backend = mount_path(&standard_archive(&dir));

        let _in_flight = backend.write_lock.try_lock().unwrap();

        assert_eq!(child_names(&backend, "/"), ["dir", "dir2", "file", "file2"]);
        assert_eq!(read_all(&backend, "/file"), FILE_CONTENT);
    }

    #[cfg(unix)]
    #[test]
    fn pushed_symlinks_keep_their_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = standard_archive(&dir);
        let backend = mount_path(&path);

        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/somewhere/else", &link).unwrap();

        backend
            .push(
                "/link",
                &link,
                CopyFlags::NOFOLLOW_SYMLINKS,
                false,
                None,
                &Job::new(),
            )
            .unwrap();
        drop(backend);

        let backend = mount_path(&path);
        let info = info(&backend, "/link");
        assert_eq!(info.file_type, FileType::SymbolicLink);
        assert!(info.is_symlink);
        assert_eq!(info.symlink_target.as_deref(), Some("somewhere/else"));
    }
}
