//! The cache wiring the daemon puts in front of a backend.
//!
//! Read queries consult the caches first and write their result back on a
//! miss. Write operations disable both caches for their duration and
//! invalidate affected paths before touching the backend, so a concurrent
//! reader can never re-populate stale data mid-write.

use std::path::Path;

use super::{EnumCache, InfoCache};
use crate::{
    attr::AttributeMatcher,
    backend::{Filesystem, FsInfo, ProgressCallback, ReadHandle},
    error::Result,
    info::{CopyFlags, FileInfo, QueryFlags},
    job::Job,
};

pub struct CacheLayer<F> {
    inner: F,
    info_cache: InfoCache,
    enum_cache: EnumCache,
}

impl<F: Filesystem> CacheLayer<F> {
    pub fn new(inner: F, info_cache: InfoCache, enum_cache: EnumCache) -> Self {
        CacheLayer {
            inner,
            info_cache,
            enum_cache,
        }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    /// The info cache may know the target's type and narrow the
    /// invalidation; its verdict feeds the enumeration cache.
    fn invalidate(&self, path: &str, maybe_dir: bool) {
        let maybe_dir = self.info_cache.invalidate(path, maybe_dir);
        self.enum_cache.invalidate(path, maybe_dir);
    }

    fn around_write<T>(&self, operation: impl FnOnce() -> Result<T>) -> Result<T> {
        self.info_cache.disable();
        self.enum_cache.disable();
        let result = operation();
        self.info_cache.enable();
        self.enum_cache.enable();
        result
    }
}

impl<F: Filesystem> Filesystem for CacheLayer<F> {
    fn query_info(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Result<FileInfo> {
        if let Some(info) = self.info_cache.find(path, matcher, flags) {
            return Ok(info);
        }

        let info = self.inner.query_info(path, matcher, flags)?;
        self.info_cache
            .insert(path.to_owned(), info.clone(), matcher.clone(), flags);
        Ok(info)
    }

    fn enumerate(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Result<Vec<FileInfo>> {
        if let Some((infos, _count)) = self.enum_cache.find(path, matcher, flags) {
            return Ok(infos);
        }

        // Reserve before the fetch; the stamp tells the commit whether a
        // write got in between.
        let stamp = self.enum_cache.insert(path.to_owned());
        let infos = self.inner.enumerate(path, matcher, flags)?;
        let count = infos.len();
        self.enum_cache
            .set(path, infos.clone(), matcher.clone(), flags, stamp, count);
        Ok(infos)
    }

    fn open_for_read(&self, path: &str, job: &Job) -> Result<Box<dyn ReadHandle>> {
        self.inner.open_for_read(path, job)
    }

    fn set_display_name(&self, path: &str, display_name: &str, job: &Job) -> Result<String> {
        self.around_write(|| {
            self.invalidate(path, true);
            self.inner.set_display_name(path, display_name, job)
        })
    }

    fn move_file(
        &self,
        source: &str,
        destination: &str,
        flags: CopyFlags,
        job: &Job,
    ) -> Result<()> {
        self.around_write(|| {
            self.invalidate(source, true);
            self.invalidate(destination, true);
            self.inner.move_file(source, destination, flags, job)
        })
    }

    fn delete(&self, path: &str, job: &Job) -> Result<()> {
        self.around_write(|| {
            self.invalidate(path, true);
            self.inner.delete(path, job)
        })
    }

    fn make_directory(&self, path: &str, job: &Job) -> Result<()> {
        self.around_write(|| {
            self.invalidate(path, true);
            self.inner.make_directory(path, job)
        })
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
        self.around_write(|| {
            self.invalidate(destination, false);
            self.inner
                .push(destination, source, flags, remove_source, progress, job)
        })
    }

    fn query_fs_info(&self) -> FsInfo {
        self.inner.query_fs_info()
    }
}
