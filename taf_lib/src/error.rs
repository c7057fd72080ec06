//! Error types for container, overlay, and payload operations.
use thiserror::Error;

use crate::ChunkType;

/// Errors surfaced by [Taf::load](crate::Taf::load) and
/// [Tafo::load](crate::Tafo::load).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("header validation failed: {reason}; first bytes: {first_bytes:02X?}")]
    Validation {
        reason: String,
        first_bytes: Vec<u8>,
    },

    #[error(
        "directory entry {name:?} out of bounds: offset {offset} + size {size} > file size {file_size}"
    )]
    EntryOutOfBounds {
        name: String,
        offset: u64,
        size: u64,
        file_size: u64,
    },

    #[error(
        "checksum mismatch for chunk {name:?} at offset {offset}: stored {stored:08X}, computed {computed:08X}"
    )]
    Checksum {
        name: String,
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("error reading data")]
    Io(#[from] std::io::Error),

    #[error("error parsing data")]
    Binrw(#[from] binrw::Error),
}

/// Errors surfaced by [Taf::save](crate::Taf::save) and
/// [Tafo::save](crate::Tafo::save).
#[derive(Debug, Error)]
pub enum SaveError {
    #[error(
        "chunk bookkeeping out of sync: header count {header_count}, directory {directory_len}, payloads {payload_count}"
    )]
    Integrity {
        header_count: u32,
        directory_len: usize,
        payload_count: usize,
    },

    #[error("stream position {actual} does not match expected offset {expected}")]
    OffsetDrift { expected: u64, actual: u64 },

    #[error("error writing data")]
    Io(#[from] std::io::Error),

    #[error("error writing data")]
    Binrw(#[from] binrw::Error),
}

/// Errors surfaced while applying a [Tafo](crate::Tafo) to an asset.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("overlay does not target this asset: {reason}")]
    NotTargeted { reason: String },

    #[error("asset has no {0:?} chunk")]
    MissingChunk(ChunkType),

    #[error("no shader with name hash {hash:#018X}")]
    ShaderNotFound { hash: u64 },

    #[error("vertex index {index} out of range for {count} vertices")]
    VertexOutOfRange { index: u32, count: u32 },

    #[error("operation data too small: need {needed} bytes, have {actual}")]
    DataTooSmall { needed: usize, actual: usize },

    #[error("operation data window {offset}+{size} outside blob of {blob_len} bytes")]
    BadDataWindow {
        offset: u64,
        size: u64,
        blob_len: usize,
    },

    #[error("attribute size {0} is not one of 4, 8, 12, or 16")]
    BadAttributeSize(u32),

    #[error(
        "write of {size} bytes at offset {offset} would overrun payload of {payload_len} bytes"
    )]
    PayloadOverrun {
        offset: usize,
        size: usize,
        payload_len: usize,
    },

    #[error("error parsing chunk payload")]
    Binrw(#[from] binrw::Error),
}
