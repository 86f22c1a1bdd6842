//! Caching and archive-mount core of a user-space filesystem daemon.
//!
//! Two subsystems live here. The metadata caches ([`InfoCache`],
//! [`EnumCache`], wired up by [`CacheLayer`]) accelerate repeated
//! traversals of backends whose round-trips are expensive. The
//! [`ArchiveBackend`] exposes a compressed archive as a mountable,
//! writable tree by streaming through an external [`Codec`].

#![deny(clippy::all)]

#[macro_use]
extern crate serde_derive;

pub mod archive;
pub mod attr;
pub mod backend;
pub mod cache;
pub mod codec;
mod error;
pub mod info;
mod job;
mod mount;

pub use archive::ArchiveBackend;
pub use attr::AttributeMatcher;
pub use backend::{Filesystem, FsInfo, ProgressCallback, ReadHandle};
pub use cache::{CacheLayer, EnumCache, InfoCache};
pub use codec::Codec;
pub use error::{Error, Result};
pub use info::{CopyFlags, FileInfo, FileType, QueryFlags};
pub use job::Job;
pub use mount::MountSpec;

// Block size of the archive copy loops, inherited from the streams the
// codecs were written against.
pub(crate) const BLOCK_SIZE: usize = 10240;
