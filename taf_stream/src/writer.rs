//! Two-pass writer for streaming-oriented TAF files.
//!
//! Directory entries and checksums accumulate as chunks arrive while the
//! payload bytes are buffered; nothing hits the disk until
//! [finalize](ChunkedWriter::finalize) computes the final layout and writes
//! header, directory, and payloads in one pass.
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use binrw::BinWrite;
use log::debug;
use thiserror::Error;

use taf_lib::taf::{ChunkEntry, TafHeader, ENTRY_SIZE, HEADER_SIZE};
use taf_lib::ChunkType;

#[derive(Debug, Error)]
pub enum ChunkWriteError {
    #[error("writer already finalized")]
    Finalized,

    #[error("stream position {actual} does not match expected offset {expected}")]
    OffsetDrift { expected: u64, actual: u64 },

    #[error("error writing data")]
    Io(#[from] std::io::Error),

    #[error("error writing data")]
    Binrw(#[from] binrw::Error),
}

/// Writes a TAF file whose chunks arrive incrementally, for consumption by
/// the streaming loader. Unlike [Taf](taf_lib::Taf), repeated tags are
/// allowed; streaming files hold one CHKO chunk per audio block.
pub struct ChunkedWriter {
    writer: BufWriter<File>,
    header: TafHeader,
    directory: Vec<ChunkEntry>,
    payloads: Vec<Vec<u8>>,
    header_written: bool,
}

impl ChunkedWriter {
    /// Creates the output file and an empty directory. The header carries
    /// the streaming-chunks feature bit.
    pub fn begin<P: AsRef<Path>>(path: P) -> Result<Self, ChunkWriteError> {
        let writer = BufWriter::new(File::create(path)?);
        let mut header = TafHeader::new();
        header.feature_flags.set_streaming_chunks(true);
        Ok(Self {
            writer,
            header,
            directory: Vec::new(),
            payloads: Vec::new(),
            header_written: false,
        })
    }

    fn add_chunk(
        &mut self,
        tag: ChunkType,
        bytes: Vec<u8>,
        name: &str,
    ) -> Result<(), ChunkWriteError> {
        if self.header_written {
            return Err(ChunkWriteError::Finalized);
        }
        // Offsets stay zero until finalize lays the file out.
        self.directory.push(ChunkEntry::new(tag, &bytes, name));
        self.payloads.push(bytes);
        self.header.chunk_count = self.directory.len() as u32;
        Ok(())
    }

    /// Appends the out-of-band metadata payload (an AUDI chunk).
    pub fn add_metadata_chunk(&mut self, bytes: Vec<u8>, name: &str) -> Result<(), ChunkWriteError> {
        self.add_chunk(ChunkType::Audio, bytes, name)
    }

    /// Appends one streaming audio block as a CHKO chunk.
    pub fn add_audio_chunk(&mut self, bytes: Vec<u8>, index: u32) -> Result<(), ChunkWriteError> {
        self.add_chunk(ChunkType::AudioChunk, bytes, &format!("chunk_{index:04}"))
    }

    /// Computes the final layout and writes header, directory, and buffered
    /// payloads. Re-entry is rejected.
    pub fn finalize(&mut self) -> Result<(), ChunkWriteError> {
        if self.header_written {
            return Err(ChunkWriteError::Finalized);
        }

        let data_start = HEADER_SIZE + self.directory.len() as u64 * ENTRY_SIZE;
        let mut offset = data_start;
        for entry in &mut self.directory {
            entry.offset = offset;
            offset += entry.size;
        }
        self.header.total_size = offset;

        self.header.write_le(&mut self.writer)?;
        self.check_position(HEADER_SIZE)?;
        for entry in &self.directory {
            entry.write_le(&mut self.writer)?;
        }
        self.check_position(data_start)?;
        for (entry, payload) in self.directory.iter().zip(&self.payloads) {
            self.writer.write_all(payload)?;
            let expected = entry.offset + entry.size;
            let actual = self.writer.stream_position()?;
            if actual != expected {
                return Err(ChunkWriteError::OffsetDrift { expected, actual });
            }
        }
        self.writer.flush()?;

        self.header_written = true;
        debug!(
            "finalized streaming file: {} chunks, {} bytes",
            self.directory.len(),
            self.header.total_size
        );
        Ok(())
    }

    fn check_position(&mut self, expected: u64) -> Result<(), ChunkWriteError> {
        let actual = self.writer.stream_position()?;
        if actual != expected {
            return Err(ChunkWriteError::OffsetDrift { expected, actual });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taf_lib::taf::feature;
    use taf_lib::Taf;

    use crate::loader::StreamingLoader;

    #[test]
    fn written_file_is_a_valid_taf() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = ChunkedWriter::begin(file.path()).unwrap();
        writer.add_metadata_chunk(vec![1; 64], "graph").unwrap();
        writer.add_audio_chunk(vec![2; 128], 0).unwrap();
        writer.add_audio_chunk(vec![3; 128], 1).unwrap();
        writer.finalize().unwrap();

        // Full-validation load checks every offset and CRC.
        let asset = Taf::load_from_file_safe(file.path()).unwrap();
        assert!(asset.has_feature(feature::STREAMING_CHUNKS));

        let loader = StreamingLoader::open(file.path()).unwrap();
        assert_eq!(3, loader.directory().len());
        assert_eq!(vec![2u8; 128], loader.load_chunk(1).unwrap());
        assert_eq!(vec![3u8; 128], loader.load_chunk_by_name("chunk_0001").unwrap());

        let data_start = HEADER_SIZE + 3 * ENTRY_SIZE;
        assert_eq!(data_start, loader.directory()[0].offset);
        assert_eq!(data_start + 64, loader.directory()[1].offset);
        assert_eq!(data_start + 64 + 128, loader.directory()[2].offset);
    }

    #[test]
    fn finalize_is_guarded() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = ChunkedWriter::begin(file.path()).unwrap();
        writer.add_audio_chunk(vec![0; 16], 0).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(writer.finalize(), Err(ChunkWriteError::Finalized)));
        assert!(matches!(
            writer.add_audio_chunk(vec![0; 16], 1),
            Err(ChunkWriteError::Finalized)
        ));
    }

    #[test]
    fn empty_streaming_file_round_trips() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = ChunkedWriter::begin(file.path()).unwrap();
        writer.finalize().unwrap();

        let loader = StreamingLoader::open(file.path()).unwrap();
        assert_eq!(0, loader.directory().len());
        assert_eq!(HEADER_SIZE, loader.header().total_size);
    }
}
