//! Metadata caches for backends whose round-trips are expensive.
//!
//! [`InfoCache`] keys single-file metadata by path, [`EnumCache`] keys whole
//! directory listings. Both are safe to share between worker threads and
//! never hold their lock across caller I/O; the enumeration cache splits its
//! insert into a reserve and a commit step for exactly that reason.

mod enumeration;
mod info;
mod layer;
mod list;

pub use enumeration::EnumCache;
pub use info::InfoCache;
pub use layer::CacheLayer;

/// Directory part of a path. The root is its own parent and a bare name
/// resolves to `.`, matching the daemon's path conventions.
pub(crate) fn dirname(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.starts_with('/') { "/" } else { "." };
    }

    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(position) => &trimmed[..position],
        None => ".",
    }
}
