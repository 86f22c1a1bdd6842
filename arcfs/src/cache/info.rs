//! Per-path metadata cache with LRU eviction and optional expiry.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use log::debug;
use parking_lot::Mutex;

use super::{
    dirname,
    list::{NodeId, PathList},
};
use crate::{
    attr::{AttributeMatcher, ATTR_STANDARD_IS_SYMLINK},
    info::{FileInfo, FileType, QueryFlags},
};

struct InfoEntry {
    info: FileInfo,
    matcher: AttributeMatcher,
    flags: QueryFlags,
    stamp: Instant,
    lru: NodeId,
    gc: NodeId,
}

/// Thread-safe cache of [`FileInfo`] records keyed by absolute path.
///
/// A `max_count` of 0 disables count-based eviction; a `max_time` of 0
/// disables expiry. Entries satisfy a lookup only when the stored matcher
/// covers the requested one, so a narrow query can reuse a wide one but
/// never the other way around.
pub struct InfoCache {
    inner: Mutex<Inner>,
}

struct Inner {
    max_count: usize,
    max_time: Option<Duration>,

    entries: HashMap<Arc<str>, InfoEntry>,
    lru: PathList,

    gc: PathList,
    gc_stamp: Instant,
    gc_interval: Duration,

    disable_depth: u32,
}

impl InfoCache {
    pub fn new(max_count: usize, max_time_sec: u64) -> Self {
        let max_time = (max_time_sec > 0).then(|| Duration::from_secs(max_time_sec));

        InfoCache {
            inner: Mutex::new(Inner {
                max_count,
                max_time,
                entries: HashMap::new(),
                lru: PathList::new(),
                gc: PathList::new(),
                gc_stamp: Instant::now(),
                gc_interval: max_time.map(|time| time / 2).unwrap_or(Duration::ZERO),
                disable_depth: 0,
            }),
        }
    }

    /// Store a record, replacing any previous one at the same path. Does
    /// nothing while the cache is disabled. May evict the least recently
    /// used entry.
    pub fn insert(
        &self,
        path: String,
        info: FileInfo,
        matcher: AttributeMatcher,
        flags: QueryFlags,
    ) {
        let mut inner = self.inner.lock();
        if inner.disable_depth > 0 {
            return;
        }

        debug!("info cache insert: {path}");

        inner.collect_garbage();
        inner.remove_entry(&path);

        let path: Arc<str> = path.into();
        let lru = inner.lru.push_tail(path.clone());
        let gc = inner.gc.push_tail(path.clone());
        inner.entries.insert(
            path,
            InfoEntry {
                info,
                matcher,
                flags,
                stamp: Instant::now(),
                lru,
                gc,
            },
        );

        inner.evict_lru();
    }

    /// Look up a record. Hits refresh the entry's LRU position and return a
    /// copy; the cache keeps the stored record.
    pub fn find(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Option<FileInfo> {
        let mut inner = self.inner.lock();
        inner.collect_garbage();

        let max_time = inner.max_time;
        let entry = inner.entries.get(path)?;
        if !is_entry_valid(entry, max_time, Some(matcher), flags) {
            return None;
        }

        debug!("info cache find: {path}");

        let lru = entry.lru;
        let info = entry.info.clone();
        let moved = inner.lru.move_to_tail(lru);
        inner
            .entries
            .get_mut(path)
            .expect("entry vanished under the lock")
            .lru = moved;

        Some(info)
    }

    /// Drop whatever a write to `path` may have made stale. When the target
    /// is (or may be) a directory every entry goes; for a plain file only
    /// the path and its parent go. Returns whether the target was treated
    /// as a non-file.
    pub fn invalidate(&self, path: &str, maybe_dir: bool) -> bool {
        let mut inner = self.inner.lock();

        debug!("info cache invalidate: {path}");

        inner.collect_garbage();

        let mut is_file = !maybe_dir;
        if maybe_dir {
            let max_time = inner.max_time;
            if let Some(entry) = inner.entries.get(path) {
                if is_entry_valid(entry, max_time, None, QueryFlags::empty()) {
                    is_file = entry.info.file_type == FileType::Regular;
                }
            }
        }

        if is_file {
            let parent = dirname(path).to_owned();
            inner.remove_entry(&parent);
            inner.remove_entry(path);
        } else {
            inner.remove_all();
        }

        !is_file
    }

    pub fn remove(&self, path: &str) {
        debug!("info cache remove: {path}");

        self.inner.lock().remove_entry(path);
    }

    pub fn remove_all(&self) {
        debug!("info cache remove all");

        self.inner.lock().remove_all();
    }

    /// Suspend insertion. Calls nest; each one must be paired with
    /// [`InfoCache::enable`].
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.disable_depth += 1;
    }

    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        assert!(
            inner.disable_depth > 0,
            "cache enabled more times than disabled"
        );
        inner.disable_depth -= 1;
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disable_depth > 0
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_entry_valid(
    entry: &InfoEntry,
    max_time: Option<Duration>,
    matcher: Option<&AttributeMatcher>,
    flags: QueryFlags,
) -> bool {
    if let Some(max_time) = max_time {
        if entry.stamp.elapsed() > max_time {
            return false;
        }
    }

    // A not-followed lookup of a non-symlink answers any flag combination,
    // provided the stored record can prove it is not a symlink.
    if entry.flags != flags {
        if entry.flags == QueryFlags::NOFOLLOW_SYMLINKS {
            if !entry.matcher.matches(ATTR_STANDARD_IS_SYMLINK) || entry.info.is_symlink {
                return false;
            }
        } else {
            return false;
        }
    }

    match matcher {
        Some(matcher) => matcher.subtract(&entry.matcher).is_none(),
        None => true,
    }
}

impl Inner {
    fn remove_entry(&mut self, path: &str) {
        if let Some(entry) = self.entries.remove(path) {
            self.lru.unlink(entry.lru);
            self.gc.unlink(entry.gc);
        }
    }

    fn remove_all(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.gc.clear();
        self.gc_stamp = Instant::now();
    }

    fn evict_lru(&mut self) {
        if self.max_count > 0 && self.lru.len() > self.max_count {
            if let Some(path) = self.lru.peek_head().cloned() {
                debug!("info cache evict: {path}");
                self.remove_entry(&path);
            }
        }
    }

    /// Amortized expiry sweep. The GC list is insertion ordered, so the
    /// sweep stops at the first entry that is still fresh.
    fn collect_garbage(&mut self) {
        let Some(max_time) = self.max_time else {
            return;
        };
        if self.gc_stamp.elapsed() <= self.gc_interval {
            return;
        }

        let now = Instant::now();
        while let Some(path) = self.gc.peek_head().cloned() {
            let expired = self
                .entries
                .get(path.as_ref())
                .map(|entry| now.duration_since(entry.stamp) > max_time)
                .unwrap_or(false);
            if !expired {
                break;
            }
            self.remove_entry(&path);
        }
        self.gc_stamp = now;
    }
}
