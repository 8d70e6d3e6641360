//! # extent-cache - Sparse Extent Storage and Versioned Range Cache
//!
//! `extent-cache` keeps partial, non-contiguous knowledge of large remote
//! objects that are fetched by byte range. It merges newly fetched or written
//! ranges without disturbing valid data and serves range reads that fetch
//! only what is missing, coalescing duplicate concurrent fetches.
//!
//! ## Layers
//!
//! - [`extent`] - Half-open offset intervals, possibly unbounded above
//! - [`extent_map`] - Ordered maps of non-overlapping extents
//! - [`extent_buffer`] - Aliasable, cursor-bearing views over shared bytes
//! - [`extent_buffer_map`] - Sparse buffer maps with overlap-resolving insertion
//! - [`streamer`] - Rendering sparse maps as contiguous bytes
//! - [`cache`] - The versioned, concurrency-coordinating buffer cache
//!
//! ## Quick Start
//!
//! ```rust
//! use extent_cache::{BufferCache, BufferCacheBuilder, Extent, ExtentBuffer, Fetched, Result};
//!
//! # fn main() -> Result<()> {
//! let cache: BufferCache<u64> = BufferCacheBuilder::new().fill_byte(b' ').build();
//!
//! // The backing store: any closure from extent to bytes
//! let fetch = |wanted: &Extent| -> anyhow::Result<Fetched<u64>> {
//!     let bytes = vec![b'x'; wanted.len() as usize];
//!     Ok(Fetched { version: 7, buffer: ExtentBuffer::wrap(wanted.start(), bytes)? })
//! };
//!
//! let read = cache.read(&7, &Extent::bounded(100, 104)?, fetch)?;
//! assert_eq!(read.buffer.to_vec(), b"xxxx");
//!
//! // Cached now: no fetch needed
//! assert!(cache.is_cached(&7, &Extent::bounded(100, 104)?, true));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ BufferCache<V>                                │
//! │   version -> ExtentBufferMap + policy info    │
//! │   (version, extent) -> in-flight fetch        │
//! ├───────────────────────────────────────────────┤
//! │ ExtentBufferStreamer (render / stream / chunk)│
//! ├───────────────────────────────────────────────┤
//! │ ExtentBufferMap = ExtentMap<ExtentBuffer>     │
//! ├───────────────────────────────────────────────┤
//! │ ExtentBuffer (view over Arc'd storage)        │
//! ├───────────────────────────────────────────────┤
//! │ Extent / ExtentEnd / BufferableExtent         │
//! └───────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod extent;
pub mod extent_buffer;
pub mod extent_buffer_map;
pub mod extent_map;
pub mod streamer;

pub use cache::{
    BufferCache, BufferCacheBuilder, CacheStats, Fetched, Fetcher, PolicyInfo, PolicyMerge,
    Provenance, ReadResult,
};
pub use config::CacheConfig;
pub use error::{CacheError, Result, SharedError};
pub use extent::{BufferableExtent, Extent, ExtentEnd, HasExtent, MAX_BUFFER_LEN, MAX_OFFSET};
pub use extent_buffer::ExtentBuffer;
pub use extent_buffer_map::ExtentBufferMap;
pub use extent_map::ExtentMap;
pub use streamer::{Chunks, ExtentBufferStreamer};
