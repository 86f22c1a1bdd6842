//! Per-directory enumeration cache with size-adjusted LRU eviction.
//!
//! A committed listing weighs as much as it has children, so one huge
//! directory cannot monopolize the cache: the eviction victim is the bucket
//! head maximizing `weight x time-in-cache`.

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
    attr::AttributeMatcher,
    info::{FileInfo, QueryFlags},
};

const LRU_COUNT: usize = 5;

struct EnumBody {
    infos: Vec<FileInfo>,
    matcher: AttributeMatcher,
    flags: QueryFlags,
    count: usize,
}

struct EnumEntry {
    body: Option<EnumBody>,
    stamp: Instant,
    gc: NodeId,
    lru: Option<(usize, NodeId)>,
}

/// Thread-safe cache of directory listings keyed by absolute path.
///
/// Writing a listing is split in two so the producer never holds the lock
/// while it enumerates the backend: [`EnumCache::insert`] reserves a
/// placeholder and returns a stamp, [`EnumCache::set`] commits the body if
/// the placeholder with that exact stamp is still present.
pub struct EnumCache {
    inner: Mutex<Inner>,
}

struct Inner {
    max_count: usize,
    max_time: Option<Duration>,

    entries: HashMap<Arc<str>, EnumEntry>,
    lru: [PathList; LRU_COUNT],
    count: usize,

    gc: PathList,
    gc_stamp: Instant,
    gc_interval: Duration,

    disable_depth: u32,
}

impl EnumCache {
    pub fn new(max_count: usize, max_time_sec: u64) -> Self {
        let max_time = (max_time_sec > 0).then(|| Duration::from_secs(max_time_sec));

        EnumCache {
            inner: Mutex::new(Inner {
                max_count,
                max_time,
                entries: HashMap::new(),
                lru: std::array::from_fn(|_| PathList::new()),
                count: 0,
                gc: PathList::new(),
                gc_stamp: Instant::now(),
                gc_interval: max_time.map(|time| time / 2).unwrap_or(Duration::ZERO),
                disable_depth: 0,
            }),
        }
    }

    /// Reserve a placeholder for `path` and return the stamp the later
    /// commit must present. While the cache is disabled no placeholder is
    /// created and the returned stamp will never match.
    pub fn insert(&self, path: String) -> Instant {
        let stamp = Instant::now();

        let mut inner = self.inner.lock();
        if inner.disable_depth > 0 {
            return stamp;
        }

        debug!("enum cache insert: {path}");

        inner.collect_garbage();
        inner.remove_entry(&path);

        let path: Arc<str> = path.into();
        let gc = inner.gc.push_tail(path.clone());
        inner.entries.insert(
            path,
            EnumEntry {
                body: None,
                stamp,
                gc,
                lru: None,
            },
        );

        stamp
    }

    /// Commit a listing reserved by [`EnumCache::insert`]. The body is
    /// dropped when the placeholder is gone, the stamp is stale, or the
    /// listing alone would overflow the cache; a stale placeholder is
    /// removed along the way. Committing may evict other entries.
    pub fn set(
        &self,
        path: &str,
        infos: Vec<FileInfo>,
        matcher: AttributeMatcher,
        flags: QueryFlags,
        stamp: Instant,
        count: usize,
    ) {
        let mut inner = self.inner.lock();

        let stamp_matches = inner
            .entries
            .get(path)
            .map(|entry| entry.stamp == stamp && entry.body.is_none())
            .unwrap_or(false);
        if !stamp_matches {
            return;
        }

        if inner.max_count > 0 && count > inner.max_count {
            inner.remove_entry(path);
            return;
        }

        debug!("enum cache set: {path}");

        let key = inner
            .entries
            .get_key_value(path)
            .map(|(key, _)| key.clone())
            .expect("entry vanished under the lock");
        let bucket = bucket_for(count);
        let node = inner.lru[bucket].push_tail(key);

        let entry = inner
            .entries
            .get_mut(path)
            .expect("entry vanished under the lock");
        entry.body = Some(EnumBody {
            infos,
            matcher,
            flags,
            count,
        });
        entry.lru = Some((bucket, node));

        inner.count += count;
        inner.evict();
    }

    /// Look up a listing. Requires the exact flags it was stored with and a
    /// covering matcher. Hits refresh the entry within its bucket and
    /// return a deep copy plus the entry's weight.
    pub fn find(
        &self,
        path: &str,
        matcher: &AttributeMatcher,
        flags: QueryFlags,
    ) -> Option<(Vec<FileInfo>, usize)> {
        let mut inner = self.inner.lock();
        inner.collect_garbage();

        let max_time = inner.max_time;
        let entry = inner.entries.get(path)?;
        let body = entry.body.as_ref()?;

        if let Some(max_time) = max_time {
            if entry.stamp.elapsed() > max_time {
                return None;
            }
        }
        if body.flags != flags {
            return None;
        }
        if matcher.subtract(&body.matcher).is_some() {
            return None;
        }

        debug!("enum cache find: {path}");

        let (bucket, node) = entry.lru.expect("committed entry without a bucket");
        let result = (body.infos.clone(), body.count);

        let moved = inner.lru[bucket].move_to_tail(node);
        inner
            .entries
            .get_mut(path)
            .expect("entry vanished under the lock")
            .lru = Some((bucket, moved));

        Some(result)
    }

    /// Drop whatever a write to `path` may have made stale; everything when
    /// the target may be a directory, otherwise the path and its parent.
    pub fn invalidate(&self, path: &str, maybe_dir: bool) {
        let mut inner = self.inner.lock();

        debug!("enum cache invalidate: {path}");

        inner.collect_garbage();

        if maybe_dir {
            inner.remove_all();
        } else {
            let parent = dirname(path).to_owned();
            inner.remove_entry(&parent);
            inner.remove_entry(path);
        }
    }

    pub fn remove(&self, path: &str) {
        debug!("enum cache remove: {path}");

        self.inner.lock().remove_entry(path);
    }

    pub fn remove_all(&self) {
        debug!("enum cache remove all");

        self.inner.lock().remove_all();
    }

    /// Suspend insertion; each call pairs with [`EnumCache::enable`].
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

    /// Number of cached paths, placeholders included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of committed listings.
    pub fn weight(&self) -> usize {
        self.inner.lock().count
    }
}

/// Buckets grow by powers of four: 0..3 children in the first, then 4..15,
/// 16..63, 64..255, and everything heavier in the last.
fn bucket_for(count: usize) -> usize {
    let mut bucket = 0;
    let mut threshold = 4;
    while bucket + 1 < LRU_COUNT && count >= threshold {
        bucket += 1;
        threshold *= 4;
    }
    bucket
}

impl Inner {
    fn remove_entry(&mut self, path: &str) {
        if let Some(entry) = self.entries.remove(path) {
            if let Some((bucket, node)) = entry.lru {
                self.lru[bucket].unlink(node);
            }
            self.gc.unlink(entry.gc);
            if let Some(body) = entry.body {
                self.count -= body.count;
            }
        }
    }

    fn remove_all(&mut self) {
        self.entries.clear();
        for bucket in &mut self.lru {
            bucket.clear();
        }
        self.gc.clear();
        self.count = 0;
        self.gc_stamp = Instant::now();
    }

    /// Size-adjusted eviction: scan the head of every bucket and drop the
    /// one with the highest `weight x age` until the total weight fits.
    /// Stops when no bucket has a candidate.
    fn evict(&mut self) {
        if self.max_count == 0 {
            return;
        }

        let now = Instant::now();
        while self.count > self.max_count {
            let mut victim: Option<(Arc<str>, u128)> = None;

            for bucket in &self.lru {
                let Some(path) = bucket.peek_head() else {
                    continue;
                };
                let Some(entry) = self.entries.get(path.as_ref()) else {
                    continue;
                };
                let weight = entry.body.as_ref().map(|body| body.count).unwrap_or(0);
                let age = now.saturating_duration_since(entry.stamp).as_micros();
                let score = weight as u128 * age;

                if victim
                    .as_ref()
                    .map(|(_, best)| score > *best)
                    .unwrap_or(true)
                {
                    victim = Some((path.clone(), score));
                }
            }

            match victim {
                Some((path, _)) => {
                    debug!("enum cache evict: {path}");
                    self.remove_entry(&path);
                }
                None => break,
            }
        }
    }

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
