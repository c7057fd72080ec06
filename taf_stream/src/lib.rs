//! Streaming access to TAF asset files.
//!
//! [StreamingLoader] keeps a file open and serves random-access chunk reads
//! through a bounded, access-counted cache; [LoaderHandle] shares a loader
//! between consumers while a weak registry allows diagnostics to enumerate
//! live loaders without extending their lifetime. [ChunkedWriter] produces
//! the streaming-oriented files the loader consumes.
pub mod loader;
pub mod writer;

pub use loader::{live_loaders, CacheStats, ChunkReadError, LoaderHandle, StreamingLoader};
pub use writer::{ChunkWriteError, ChunkedWriter};
