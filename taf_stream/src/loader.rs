//! Random-access chunk loading with a bounded, access-counted cache.
//!
//! A [StreamingLoader] keeps its file open and reads chunks on demand; the
//! header and directory are parsed once at open and payloads are never read
//! ahead of a request. Two independent mutexes guard the file handle and
//! the cache; they are never held at the same time, so a slow disk read
//! never blocks cache hits on other threads.
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, Weak};

use log::{debug, trace};
use thiserror::Error;

use taf_lib::error::LoadError;
use taf_lib::taf::{read_header_and_directory, ChunkEntry, TafHeader};
use taf_lib::ChunkType;

/// Default cache bound in bytes.
pub const DEFAULT_CACHE_LIMIT: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChunkReadError {
    #[error("loader is closed")]
    Closed,

    #[error("chunk index {index} out of range for {count} chunks")]
    OutOfRange { index: usize, count: usize },

    #[error("no chunk named {name:?}")]
    NotFound { name: String },

    #[error("short read for chunk {index}: expected {expected} bytes")]
    ShortRead { index: usize, expected: u64 },

    #[error("error reading chunk data")]
    Io(#[from] std::io::Error),
}

/// A snapshot of the cache counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub loaded_count: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct CachedChunk {
    data: Vec<u8>,
    access_count: u64,
}

#[derive(Debug, Default)]
struct ChunkCache {
    entries: HashMap<usize, CachedChunk>,
    bytes: u64,
    hits: u64,
    misses: u64,
}

/// An open TAF file serving random-access chunk reads.
///
/// The directory is immutable after open; [close](Self::close) drops the
/// file handle and cached payloads but keeps the directory for
/// [chunk_info](Self::chunk_info) queries.
#[derive(Debug)]
pub struct StreamingLoader {
    path: PathBuf,
    header: TafHeader,
    directory: Vec<ChunkEntry>,
    cache_limit: u64,
    file: Mutex<Option<File>>,
    cache: Mutex<ChunkCache>,
}

impl StreamingLoader {
    /// Opens `path`, validating the header and directory but reading no
    /// payload bytes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        Self::open_with_cache_limit(path, DEFAULT_CACHE_LIMIT)
    }

    /// [open](Self::open) with a non-default cache bound.
    pub fn open_with_cache_limit<P: AsRef<Path>>(
        path: P,
        cache_limit: u64,
    ) -> Result<Self, LoadError> {
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        let (header, directory) = read_header_and_directory(&mut file, file_size)?;
        debug!(
            "opened {:?}: {} chunks, {} bytes",
            path.as_ref(),
            directory.len(),
            file_size
        );

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            header,
            directory,
            cache_limit,
            file: Mutex::new(Some(file)),
            cache: Mutex::new(ChunkCache::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &TafHeader {
        &self.header
    }

    pub fn directory(&self) -> &[ChunkEntry] {
        &self.directory
    }

    /// Drops the file handle and cached payloads. Concurrent loads fail
    /// with [ChunkReadError::Closed] from their next lock acquisition.
    pub fn close(&self) {
        *self.file.lock().unwrap() = None;
        let mut cache = self.cache.lock().unwrap();
        cache.entries.clear();
        cache.bytes = 0;
    }

    /// The directory entry at `index`, answered without touching the file.
    pub fn chunk_info(&self, index: usize) -> Option<&ChunkEntry> {
        self.directory.get(index)
    }

    pub fn chunk_info_by_name(&self, name: &str) -> Option<&ChunkEntry> {
        self.index_by_name(name).map(|i| &self.directory[i])
    }

    fn index_by_name(&self, name: &str) -> Option<usize> {
        self.directory.iter().position(|e| e.name == name)
    }

    /// Returns a copy of the payload bytes for chunk `index`, consulting
    /// the cache first.
    pub fn load_chunk(&self, index: usize) -> Result<Vec<u8>, ChunkReadError> {
        let entry = self
            .directory
            .get(index)
            .ok_or(ChunkReadError::OutOfRange {
                index,
                count: self.directory.len(),
            })?
            .clone();

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.entries.get_mut(&index) {
                cached.access_count += 1;
                let data = cached.data.clone();
                cache.hits += 1;
                trace!("chunk {index} served from cache");
                return Ok(data);
            }
        }

        // File lock held only for the seek + read.
        let data = {
            let mut guard = self.file.lock().unwrap();
            let file = guard.as_mut().ok_or(ChunkReadError::Closed)?;
            file.seek(SeekFrom::Start(entry.offset))?;
            let mut data = vec![0u8; entry.size as usize];
            file.read_exact(&mut data).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    ChunkReadError::ShortRead {
                        index,
                        expected: entry.size,
                    }
                } else {
                    e.into()
                }
            })?;
            data
        };

        let mut cache = self.cache.lock().unwrap();
        cache.misses += 1;
        cache.bytes += data.len() as u64;
        cache.entries.insert(
            index,
            CachedChunk {
                data: data.clone(),
                access_count: 1,
            },
        );
        self.evict_over_limit(&mut cache);
        Ok(data)
    }

    /// Least-accessed-first eviction; among equal access counts the highest
    /// chunk index goes first, so long-lived low chunks survive a linear
    /// scan of the tail.
    fn evict_over_limit(&self, cache: &mut ChunkCache) {
        while cache.bytes > self.cache_limit {
            let victim = cache
                .entries
                .iter()
                .min_by_key(|(index, chunk)| (chunk.access_count, std::cmp::Reverse(**index)))
                .map(|(index, _)| *index);
            let Some(victim) = victim else {
                break;
            };
            if let Some(removed) = cache.entries.remove(&victim) {
                cache.bytes -= removed.data.len() as u64;
                debug!(
                    "evicted chunk {victim} ({} bytes, {} accesses)",
                    removed.data.len(),
                    removed.access_count
                );
            }
        }
    }

    /// Loads the chunk whose directory name is `name`.
    pub fn load_chunk_by_name(&self, name: &str) -> Result<Vec<u8>, ChunkReadError> {
        let index = self
            .index_by_name(name)
            .ok_or_else(|| ChunkReadError::NotFound {
                name: name.to_string(),
            })?;
        self.load_chunk(index)
    }

    /// The first AUDI chunk, used as out-of-band metadata for streaming
    /// audio assets.
    pub fn load_metadata(&self) -> Result<Vec<u8>, ChunkReadError> {
        let index = self
            .directory
            .iter()
            .position(|e| e.tag == ChunkType::Audio)
            .ok_or_else(|| ChunkReadError::NotFound {
                name: "AUDI".to_string(),
            })?;
        self.load_chunk(index)
    }

    /// Loads each index in order, populating the cache.
    pub fn preload_chunks(&self, indices: &[usize]) -> Result<(), ChunkReadError> {
        for &index in indices {
            self.load_chunk(index)?;
        }
        Ok(())
    }

    /// Drops cached payloads; the hit/miss counters keep their lifetime
    /// totals.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().unwrap();
        cache.entries.clear();
        cache.bytes = 0;
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().unwrap();
        CacheStats {
            loaded_count: cache.entries.len(),
            bytes: cache.bytes,
            hits: cache.hits,
            misses: cache.misses,
        }
    }
}

#[derive(Default)]
struct HandleRegistry {
    next_id: u64,
    loaders: HashMap<u64, Weak<StreamingLoader>>,
}

static HANDLE_REGISTRY: LazyLock<Mutex<HandleRegistry>> =
    LazyLock::new(|| Mutex::new(HandleRegistry::default()));

/// Shared ownership of a [StreamingLoader].
///
/// Handles keep the loader alive; the process-wide registry holds only weak
/// back-references and is never consulted while the last handle drops.
#[derive(Debug, Clone)]
pub struct LoaderHandle {
    id: u64,
    loader: Arc<StreamingLoader>,
}

impl LoaderHandle {
    /// Opens `path` and registers the loader for [live_loaders]
    /// enumeration under a fresh id.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let loader = Arc::new(StreamingLoader::open(path)?);
        let mut registry = HANDLE_REGISTRY.lock().unwrap();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.loaders.insert(id, Arc::downgrade(&loader));
        Ok(Self { id, loader })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::ops::Deref for LoaderHandle {
    type Target = StreamingLoader;

    fn deref(&self) -> &StreamingLoader {
        &self.loader
    }
}

/// Loaders still alive through at least one handle. Dead registry slots are
/// pruned as a side effect.
pub fn live_loaders() -> Vec<(u64, Arc<StreamingLoader>)> {
    let mut registry = HANDLE_REGISTRY.lock().unwrap();
    registry.loaders.retain(|_, weak| weak.strong_count() > 0);
    registry
        .loaders
        .iter()
        .filter_map(|(id, weak)| weak.upgrade().map(|loader| (*id, loader)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use taf_lib::Taf;

    /// A saved asset with `count` payload chunks of `chunk_size` bytes.
    fn streaming_fixture(count: usize, chunk_size: usize) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = crate::writer::ChunkedWriter::begin(file.path()).unwrap();
        for index in 0..count {
            writer
                .add_audio_chunk(vec![index as u8; chunk_size], index as u32)
                .unwrap();
        }
        writer.finalize().unwrap();
        file
    }

    #[test]
    fn open_reads_no_payloads_and_serves_chunks() {
        let file = streaming_fixture(4, 100);
        let loader = StreamingLoader::open(file.path()).unwrap();

        assert_eq!(4, loader.directory().len());
        assert_eq!(CacheStats::default(), loader.cache_stats());

        let data = loader.load_chunk(2).unwrap();
        assert_eq!(vec![2u8; 100], data);
        assert_eq!(100, loader.chunk_info(2).unwrap().size);
        assert!(loader.chunk_info(9).is_none());
    }

    #[test]
    fn hits_and_misses_are_counted() {
        let file = streaming_fixture(3, 50);
        let loader = StreamingLoader::open(file.path()).unwrap();

        loader.load_chunk(0).unwrap();
        loader.load_chunk(0).unwrap();
        loader.load_chunk(1).unwrap();

        let stats = loader.cache_stats();
        assert_eq!(1, stats.hits);
        assert_eq!(2, stats.misses);
        assert_eq!(2, stats.loaded_count);
        assert_eq!(100, stats.bytes);
    }

    #[test]
    fn load_by_name_and_not_found() {
        let file = streaming_fixture(3, 10);
        let loader = StreamingLoader::open(file.path()).unwrap();

        assert_eq!(vec![1u8; 10], loader.load_chunk_by_name("chunk_0001").unwrap());
        assert!(matches!(
            loader.load_chunk_by_name("chunk_0042"),
            Err(ChunkReadError::NotFound { .. })
        ));
    }

    #[test]
    fn metadata_is_first_audi_chunk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = crate::writer::ChunkedWriter::begin(file.path()).unwrap();
        writer.add_audio_chunk(vec![9; 16], 0).unwrap();
        writer.add_metadata_chunk(vec![7; 32], "graph").unwrap();
        writer.finalize().unwrap();

        let loader = StreamingLoader::open(file.path()).unwrap();
        assert_eq!(vec![7u8; 32], loader.load_metadata().unwrap());
    }

    #[test]
    fn cache_bound_and_least_accessed_eviction() {
        // 10 chunks of 1000 bytes against a 5000 byte bound, the eviction
        // scenario at 1/1000 scale.
        let file = streaming_fixture(10, 1000);
        let loader = StreamingLoader::open_with_cache_limit(file.path(), 5000).unwrap();

        // First pass: everything misses, the cache retains chunks 0..5.
        for index in 0..8 {
            loader.load_chunk(index).unwrap();
            assert!(loader.cache_stats().bytes <= 5000);
        }
        // Second pass over the retained head: all hits.
        for _ in 0..10 {
            for index in 0..5 {
                loader.load_chunk(index).unwrap();
            }
        }

        let stats = loader.cache_stats();
        assert_eq!(8, stats.misses);
        assert_eq!(50, stats.hits);
        assert_eq!(5, stats.loaded_count);
        assert_eq!(5000, stats.bytes);
    }

    #[test]
    fn preload_and_clear_cache() {
        let file = streaming_fixture(4, 20);
        let loader = StreamingLoader::open(file.path()).unwrap();

        loader.preload_chunks(&[0, 1, 2]).unwrap();
        assert_eq!(3, loader.cache_stats().loaded_count);

        loader.clear_cache();
        let stats = loader.cache_stats();
        assert_eq!(0, stats.loaded_count);
        assert_eq!(0, stats.bytes);
        // Lifetime counters survive the clear.
        assert_eq!(3, stats.misses);
    }

    #[test]
    fn close_fails_later_loads() {
        let file = streaming_fixture(2, 10);
        let loader = StreamingLoader::open(file.path()).unwrap();
        loader.load_chunk(0).unwrap();
        loader.close();

        assert!(matches!(
            loader.load_chunk(1),
            Err(ChunkReadError::Closed)
        ));
        // Directory queries still answer from memory.
        assert_eq!(10, loader.chunk_info(1).unwrap().size);
    }

    #[test]
    fn taf_assets_also_stream() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut asset = Taf::new();
        asset.add_chunk(taf_lib::ChunkType::Script, b"on_spawn()".to_vec(), "boot");
        asset.save_to_file(file.path()).unwrap();

        let loader = StreamingLoader::open(file.path()).unwrap();
        assert_eq!(b"on_spawn()".to_vec(), loader.load_chunk_by_name("boot").unwrap());
    }

    #[test]
    fn handles_share_and_registry_prunes() {
        let file = streaming_fixture(2, 10);
        let handle = LoaderHandle::create(file.path()).unwrap();
        let second = handle.clone();

        assert!(live_loaders().iter().any(|(id, _)| *id == handle.id()));
        second.load_chunk(0).unwrap();
        assert_eq!(1, handle.cache_stats().misses);

        let id = handle.id();
        drop(handle);
        drop(second);
        assert!(!live_loaders().iter().any(|(entry_id, _)| *entry_id == id));
    }
}
