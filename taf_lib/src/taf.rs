//! The TAF chunked asset container: fixed header, chunk directory, CRC32
//! validation, and the save/load state machine.
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bilge::prelude::*;
use binrw::{BinRead, BinReaderExt, BinWrite, NullString};
use indexmap::IndexMap;
use log::{debug, warn};

use crate::error::{LoadError, SaveError};
use crate::hash::crc32;
use crate::{shdr, ChunkType};

/// Size of [TafHeader] on disk in bytes.
pub const HEADER_SIZE: u64 = 320;
/// Size of a [ChunkEntry] on disk in bytes.
pub const ENTRY_SIZE: u64 = 64;

/// Container format version written by this library.
pub const VERSION: (u16, u16, u16) = (1, 0, 0);

/// Quantized coordinates carry this many units per world unit.
pub const QUANT_SCALE: f64 = 128000.0;

pub(crate) const MAX_VERSION_MAJOR: u16 = 100;
pub(crate) const MAX_VERSION_MINOR: u16 = 100;
pub(crate) const MAX_VERSION_PATCH: u16 = 1000;
const MAX_CHUNK_COUNT: u32 = 1000;

/// Raw feature masks for [Taf::has_feature] and overlay targeting.
pub mod feature {
    pub const QUANTIZED_COORDS: u64 = 1 << 0;
    pub const HASH_BASED_NAMES: u64 = 1 << 1;
    pub const MESH_SHADERS: u64 = 1 << 2;
    pub const EMBEDDED_SPIRV: u64 = 1 << 3;
    pub const STREAMING_AUDIO: u64 = 1 << 4;
    pub const SDF_FONTS: u64 = 1 << 5;
    pub const STREAMING_CHUNKS: u64 = 1 << 6;
}

/// Capability bits consulted by consumers and by overlay targeting.
///
/// The quantized coordinate bit also selects the overlay engine's vertex
/// attribute offsets, see [geom::color_offset](crate::geom::color_offset).
#[bitsize(64)]
#[derive(DebugBits, FromBits, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[br(map = u64::into)]
#[bw(map = |&x| u64::from(x))]
pub struct FeatureFlags {
    pub quantized_coords: bool,
    pub hash_based_names: bool,
    pub mesh_shaders: bool,
    pub embedded_spirv: bool,
    pub streaming_audio: bool,
    pub sdf_fonts: bool,
    pub streaming_chunks: bool,
    pub reserved: u57,
}

/// Fixed-size metadata at the start of every TAF file.
///
/// The magic is kept as a plain field rather than a binrw magic so header
/// validation can report the bytes actually found.
#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct TafHeader {
    /// `TAF!` for master assets.
    pub magic: [u8; 4],
    pub version_major: u16,
    pub version_minor: u16,
    pub version_patch: u16,
    /// 0 for master assets, 1 for overlays.
    pub asset_type: u16,
    pub feature_flags: FeatureFlags,
    pub chunk_count: u32,
    pub dependency_count: u32,
    pub ai_model_count: u32,
    /// Size of the whole file, valid only after a save.
    pub total_size: u64,
    /// World bounds quantized to 1/128000 of a unit.
    pub bounds_min: [i64; 3],
    pub bounds_max: [i64; 3],
    /// Creation time in seconds since the Unix epoch.
    pub created: u64,
    #[br(map = |x: NullString| x.to_string())]
    #[bw(map = |x: &String| NullString::from(x.as_str()))]
    #[brw(pad_size_to = 64)]
    pub creator: String,
    #[br(map = |x: NullString| x.to_string())]
    #[bw(map = |x: &String| NullString::from(x.as_str()))]
    #[brw(pad_size_to = 128)]
    pub description: String,
    pub reserved: [u8; 32],
}

impl TafHeader {
    pub fn new() -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            created,
            ..Default::default()
        }
    }

    pub fn version(&self) -> (u16, u16, u16) {
        (self.version_major, self.version_minor, self.version_patch)
    }
}

impl Default for TafHeader {
    fn default() -> Self {
        Self {
            magic: *b"TAF!",
            version_major: VERSION.0,
            version_minor: VERSION.1,
            version_patch: VERSION.2,
            asset_type: 0,
            feature_flags: FeatureFlags::from(0u64),
            chunk_count: 0,
            dependency_count: 0,
            ai_model_count: 0,
            total_size: 0,
            bounds_min: [0; 3],
            bounds_max: [0; 3],
            created: 0,
            creator: String::new(),
            description: String::new(),
            reserved: [0; 32],
        }
    }
}

/// A chunk directory entry.
#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct ChunkEntry {
    pub tag: ChunkType,
    pub flags: u32,
    /// Zero until assigned by the save layout walk.
    pub offset: u64,
    pub size: u64,
    /// CRC32 of the payload bytes.
    pub checksum: u32,
    /// Debugging name, not used for addressing.
    #[br(map = |x: NullString| x.to_string())]
    #[bw(map = |x: &String| NullString::from(x.as_str()))]
    #[brw(pad_size_to = 32)]
    pub name: String,
    pub reserved: [u8; 4],
}

impl ChunkEntry {
    /// Builds an entry for `bytes` with a zero offset; a save layout walk
    /// assigns the real offset.
    pub fn new(tag: ChunkType, bytes: &[u8], name: &str) -> Self {
        Self {
            tag,
            flags: 0,
            offset: 0,
            size: bytes.len() as u64,
            checksum: crc32(bytes),
            name: truncated(name, 31),
            reserved: [0; 4],
        }
    }
}

/// An in-memory TAF asset: header, chunk directory, and owned payloads.
///
/// Chunks accumulate in insertion order; file offsets are computed only
/// during [save](Self::save).
#[derive(Debug, Clone)]
pub struct Taf {
    pub header: TafHeader,
    pub directory: Vec<ChunkEntry>,
    chunks: IndexMap<ChunkType, Vec<u8>>,
}

impl Default for Taf {
    fn default() -> Self {
        Self::new()
    }
}

impl Taf {
    pub fn new() -> Self {
        Self {
            header: TafHeader::new(),
            directory: Vec::new(),
            chunks: IndexMap::new(),
        }
    }

    /// Sets the creator string, truncated to 63 bytes.
    pub fn set_creator(&mut self, creator: &str) {
        self.header.creator = truncated(creator, 63);
    }

    /// Sets the description string, truncated to 127 bytes.
    pub fn set_description(&mut self, description: &str) {
        self.header.description = truncated(description, 127);
    }

    pub fn set_feature_flags(&mut self, flags: FeatureFlags) {
        self.header.feature_flags = flags;
    }

    /// Exact-mask membership test against the raw feature bits.
    pub fn has_feature(&self, mask: u64) -> bool {
        u64::from(self.header.feature_flags) & mask == mask
    }

    /// Quantizes world-space bounds into the header's fixed-point vectors.
    pub fn set_world_bounds(&mut self, min: [f64; 3], max: [f64; 3]) {
        self.header.bounds_min = min.map(|v| (v * QUANT_SCALE) as i64);
        self.header.bounds_max = max.map(|v| (v * QUANT_SCALE) as i64);
    }

    /// Stores `bytes` under `tag`, replacing any prior payload with the same
    /// tag, and keeps the directory entry's size and checksum current. The
    /// entry's offset stays zero until [save](Self::save).
    pub fn add_chunk(&mut self, tag: ChunkType, bytes: Vec<u8>, name: &str) {
        let new_entry = ChunkEntry::new(tag, &bytes, name);
        if let Some(entry) = self.directory.iter_mut().find(|e| e.tag == tag) {
            *entry = new_entry;
        } else {
            self.directory.push(new_entry);
        }
        self.chunks.insert(tag, bytes);
        self.header.chunk_count = self.directory.len() as u32;
    }

    pub fn has_chunk(&self, tag: ChunkType) -> bool {
        self.chunks.contains_key(&tag)
    }

    pub fn remove_chunk(&mut self, tag: ChunkType) -> Option<Vec<u8>> {
        self.directory.retain(|e| e.tag != tag);
        let removed = self.chunks.shift_remove(&tag);
        self.header.chunk_count = self.directory.len() as u32;
        removed
    }

    pub fn chunk_data(&self, tag: ChunkType) -> Option<&[u8]> {
        self.chunks.get(&tag).map(|b| b.as_slice())
    }

    pub fn chunk_data_mut(&mut self, tag: ChunkType) -> Option<&mut Vec<u8>> {
        self.chunks.get_mut(&tag)
    }

    /// Tags present, in insertion order.
    pub fn chunk_types(&self) -> Vec<ChunkType> {
        self.chunks.keys().copied().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.directory.len()
    }

    /// The size the file will have after a save.
    pub fn file_size(&self) -> u64 {
        HEADER_SIZE
            + self.directory.len() as u64 * ENTRY_SIZE
            + self.directory.iter().map(|e| e.size).sum::<u64>()
    }

    /// Serializes and stores a geometry payload under `GEOM`.
    pub fn add_geometry(&mut self, geometry: &crate::geom::Geometry, name: &str) -> binrw::BinResult<()> {
        self.add_chunk(ChunkType::Geometry, geometry.to_bytes()?, name);
        Ok(())
    }

    /// Serializes and stores a material payload under `MTRL`.
    pub fn add_materials(
        &mut self,
        materials: &crate::mtrl::MaterialPayload,
        name: &str,
    ) -> binrw::BinResult<()> {
        self.add_chunk(ChunkType::Material, materials.to_bytes()?, name);
        Ok(())
    }

    /// Serializes and stores a shader payload under `SHDR`.
    pub fn add_shaders(
        &mut self,
        shaders: &crate::shdr::ShaderPayload,
        name: &str,
    ) -> binrw::BinResult<()> {
        self.add_chunk(ChunkType::Shader, shaders.to_bytes()?, name);
        Ok(())
    }

    /// Builds and stores an audio graph payload under `AUDI`.
    pub fn add_audio_graph(
        &mut self,
        builder: &crate::audi::AudioGraphBuilder,
        name: &str,
    ) -> binrw::BinResult<()> {
        self.add_chunk(ChunkType::Audio, builder.build()?, name);
        Ok(())
    }

    /// Serializes and stores a font payload under `FONT`.
    pub fn add_font(&mut self, font: &crate::fnt::FontPayload, name: &str) -> binrw::BinResult<()> {
        self.add_chunk(ChunkType::Font, font.to_bytes()?, name);
        Ok(())
    }

    /// Recomputes every directory entry's size and checksum from the current
    /// payload bytes and re-synchronizes the chunk count. Used after in-place
    /// payload mutation (overlay application).
    pub fn refresh_directory(&mut self) {
        for entry in &mut self.directory {
            if let Some(bytes) = self.chunks.get(&entry.tag) {
                entry.size = bytes.len() as u64;
                entry.checksum = crc32(bytes);
            }
        }
        self.header.chunk_count = self.directory.len() as u32;
    }

    /// Serializes the asset: header, directory, then payloads in directory
    /// order. Offsets are assigned in a single layout walk; the stream
    /// position is verified after every write.
    pub fn save<W: Write + Seek>(&self, writer: &mut W) -> Result<(), SaveError> {
        if self.header.chunk_count as usize != self.directory.len()
            || self.directory.len() != self.chunks.len()
        {
            return Err(SaveError::Integrity {
                header_count: self.header.chunk_count,
                directory_len: self.directory.len(),
                payload_count: self.chunks.len(),
            });
        }

        let data_start = HEADER_SIZE + self.directory.len() as u64 * ENTRY_SIZE;

        let mut header = self.header.clone();
        let mut directory = self.directory.clone();
        let mut offset = data_start;
        for entry in &mut directory {
            entry.offset = offset;
            offset += entry.size;
        }
        header.total_size = offset;

        header.write_le(writer)?;
        check_position(writer, HEADER_SIZE)?;

        for entry in &directory {
            entry.write_le(writer)?;
        }
        check_position(writer, data_start)?;

        for entry in &directory {
            let bytes = self
                .chunks
                .get(&entry.tag)
                .expect("directory entry without payload");
            writer.write_all(bytes)?;
            check_position(writer, entry.offset + entry.size)?;

            if entry.tag == ChunkType::Shader {
                match shdr::first_blob_magic(bytes) {
                    Some(shdr::SPIRV_MAGIC) => {
                        debug!("shader chunk {:?}: SPIR-V magic OK", entry.name)
                    }
                    Some(word) => warn!(
                        "shader chunk {:?}: first blob starts with {word:#010X}, expected {:#010X}",
                        entry.name,
                        shdr::SPIRV_MAGIC
                    ),
                    None => warn!("shader chunk {:?}: too small to hold a blob", entry.name),
                }
            }
        }

        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SaveError> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut writer)
    }

    /// Reads and fully validates an asset: header sanity, directory bounds,
    /// and a CRC32 check of every payload. A checksum mismatch invalidates
    /// the whole load.
    pub fn load<R: Read + Seek>(reader: &mut R) -> Result<Self, LoadError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let (header, directory) = read_header_and_directory(reader, file_size)?;

        let mut chunks = IndexMap::with_capacity(directory.len());
        for entry in &directory {
            reader.seek(SeekFrom::Start(entry.offset))?;
            let mut bytes = vec![0u8; entry.size as usize];
            reader.read_exact(&mut bytes)?;
            let computed = crc32(&bytes);
            if computed != entry.checksum {
                return Err(LoadError::Checksum {
                    name: entry.name.clone(),
                    offset: entry.offset,
                    stored: entry.checksum,
                    computed,
                });
            }
            chunks.insert(entry.tag, bytes);
        }

        Ok(Self {
            header,
            directory,
            chunks,
        })
    }

    /// Reads `path` fully into memory and validates it as [load](Self::load).
    pub fn load_from_file_safe<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        Self::load(&mut Cursor::new(bytes))
    }
}

/// Reads and validates the header and chunk directory without touching any
/// payload. Shared with the streaming loader.
pub fn read_header_and_directory<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
) -> Result<(TafHeader, Vec<ChunkEntry>), LoadError> {
    if file_size < HEADER_SIZE {
        return Err(validation_error(
            reader,
            format!("file of {file_size} bytes is smaller than the {HEADER_SIZE} byte header"),
        ));
    }

    let header: TafHeader = reader.read_le()?;
    if header.magic != *b"TAF!" {
        return Err(validation_error(
            reader,
            format!("bad magic {:02X?}", header.magic),
        ));
    }
    if header.version_major > MAX_VERSION_MAJOR
        || header.version_minor > MAX_VERSION_MINOR
        || header.version_patch > MAX_VERSION_PATCH
    {
        return Err(validation_error(
            reader,
            format!("implausible version {:?}", header.version()),
        ));
    }
    if header.chunk_count > MAX_CHUNK_COUNT {
        return Err(validation_error(
            reader,
            format!("implausible chunk count {}", header.chunk_count),
        ));
    }
    if header.total_size != file_size {
        return Err(validation_error(
            reader,
            format!(
                "declared size {} does not match file size {file_size}",
                header.total_size
            ),
        ));
    }

    let mut directory = Vec::with_capacity(header.chunk_count as usize);
    for _ in 0..header.chunk_count {
        let entry: ChunkEntry = reader.read_le()?;
        if entry.offset >= file_size
            || entry
                .offset
                .checked_add(entry.size)
                .is_none_or(|end| end > file_size)
        {
            return Err(LoadError::EntryOutOfBounds {
                name: entry.name,
                offset: entry.offset,
                size: entry.size,
                file_size,
            });
        }
        directory.push(entry);
    }

    Ok((header, directory))
}

pub(crate) fn validation_error<R: Read + Seek>(reader: &mut R, reason: String) -> LoadError {
    let mut first_bytes = vec![0u8; 16];
    let read = reader
        .seek(SeekFrom::Start(0))
        .and_then(|_| reader.read(&mut first_bytes))
        .unwrap_or(0);
    first_bytes.truncate(read);
    LoadError::Validation { reason, first_bytes }
}

pub(crate) fn check_position<W: Seek>(writer: &mut W, expected: u64) -> Result<(), SaveError> {
    let actual = writer.stream_position()?;
    if actual != expected {
        return Err(SaveError::OffsetDrift { expected, actual });
    }
    Ok(())
}

/// Truncates to at most `max_bytes` without splitting a UTF-8 sequence.
pub(crate) fn truncated(s: &str, max_bytes: usize) -> String {
    let mut end = max_bytes.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save_to_vec(asset: &Taf) -> Vec<u8> {
        let mut writer = Cursor::new(Vec::new());
        asset.save(&mut writer).unwrap();
        writer.into_inner()
    }

    #[test]
    fn empty_asset_round_trip() {
        let mut asset = Taf::new();
        asset.set_creator("Taffy");
        asset.set_description("test");

        let bytes = save_to_vec(&asset);
        assert_eq!(HEADER_SIZE as usize, bytes.len());

        let loaded = Taf::load(&mut Cursor::new(bytes)).unwrap();
        assert_eq!("Taffy", loaded.header.creator);
        assert_eq!("test", loaded.header.description);
        assert_eq!(0, loaded.chunk_count());
    }

    #[test]
    fn single_chunk_round_trip() {
        let mut asset = Taf::new();
        let payload: Vec<u8> = (0..=255).collect();
        asset.add_chunk(ChunkType::Script, payload.clone(), "bytes");

        let bytes = save_to_vec(&asset);
        assert_eq!(
            HEADER_SIZE as usize + ENTRY_SIZE as usize + payload.len(),
            bytes.len()
        );

        let loaded = Taf::load(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(Some(payload.as_slice()), loaded.chunk_data(ChunkType::Script));
        assert_eq!(asset.directory[0].checksum, loaded.directory[0].checksum);
    }

    #[test]
    fn chunk_entry_byte_layout() {
        use hexlit::hex;

        let entry = ChunkEntry::new(ChunkType::Script, b"123456789", "check");
        let mut writer = Cursor::new(Vec::new());
        entry.write_le(&mut writer).unwrap();
        assert_eq!(
            hex!(
                53435054 00000000 0000000000000000 0900000000000000 2639F4CB
                636865636B000000 0000000000000000 0000000000000000 0000000000000000
                00000000
            )
            .to_vec(),
            writer.into_inner()
        );
    }

    #[test]
    fn crc_matches_payload_after_add() {
        let mut asset = Taf::new();
        asset.add_chunk(ChunkType::Physics, b"123456789".to_vec(), "check");
        assert_eq!(0xCBF43926, asset.directory[0].checksum);
    }

    #[test]
    fn layout_is_monotonic() {
        let mut asset = Taf::new();
        asset.add_chunk(ChunkType::Geometry, vec![1; 100], "a");
        asset.add_chunk(ChunkType::Material, vec![2; 17], "b");
        asset.add_chunk(ChunkType::Script, vec![3; 64], "c");

        let bytes = save_to_vec(&asset);
        let loaded = Taf::load(&mut Cursor::new(bytes)).unwrap();

        let data_start = HEADER_SIZE + 3 * ENTRY_SIZE;
        assert_eq!(data_start, loaded.directory[0].offset);
        assert_eq!(data_start + 100, loaded.directory[1].offset);
        assert_eq!(data_start + 117, loaded.directory[2].offset);
        assert_eq!(data_start + 181, loaded.header.total_size);
        assert_eq!(loaded.header.total_size, asset.file_size());
    }

    #[test]
    fn replacing_a_chunk_keeps_one_entry() {
        let mut asset = Taf::new();
        asset.add_chunk(ChunkType::Script, vec![0; 8], "first");
        asset.add_chunk(ChunkType::Script, vec![1; 16], "second");
        assert_eq!(1, asset.chunk_count());
        assert_eq!(16, asset.directory[0].size);
        assert_eq!("second", asset.directory[0].name);
    }

    #[test]
    fn remove_chunk_resyncs_count() {
        let mut asset = Taf::new();
        asset.add_chunk(ChunkType::Script, vec![0; 8], "a");
        asset.add_chunk(ChunkType::Physics, vec![1; 8], "b");
        assert!(asset.remove_chunk(ChunkType::Script).is_some());
        assert_eq!(1, asset.header.chunk_count);
        assert!(!asset.has_chunk(ChunkType::Script));
    }

    #[test]
    fn bad_magic_reports_first_bytes() {
        let asset = Taf::new();
        let mut bytes = save_to_vec(&asset);
        bytes[0..4].copy_from_slice(b"NOPE");

        match Taf::load(&mut Cursor::new(bytes)) {
            Err(LoadError::Validation { first_bytes, .. }) => {
                assert_eq!(b"NOPE", &first_bytes[0..4]);
                assert_eq!(16, first_bytes.len());
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_file_fails_validation() {
        let asset = Taf::new();
        let mut bytes = save_to_vec(&asset);
        bytes.truncate(100);
        assert!(matches!(
            Taf::load(&mut Cursor::new(bytes)),
            Err(LoadError::Validation { .. })
        ));
    }

    #[test]
    fn size_mismatch_fails_validation() {
        let mut asset = Taf::new();
        asset.add_chunk(ChunkType::Script, vec![7; 32], "pad");
        let mut bytes = save_to_vec(&asset);
        bytes.push(0);
        assert!(matches!(
            Taf::load(&mut Cursor::new(bytes)),
            Err(LoadError::Validation { .. })
        ));
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        let mut asset = Taf::new();
        asset.add_chunk(ChunkType::Script, vec![7; 32], "payload");
        let mut bytes = save_to_vec(&asset);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Taf::load(&mut Cursor::new(bytes)),
            Err(LoadError::Checksum { .. })
        ));
    }

    #[test]
    fn inconsistent_bookkeeping_fails_save() {
        let mut asset = Taf::new();
        asset.add_chunk(ChunkType::Script, vec![7; 32], "payload");
        asset.header.chunk_count = 2;
        let mut writer = Cursor::new(Vec::new());
        assert!(matches!(
            asset.save(&mut writer),
            Err(SaveError::Integrity { .. })
        ));
    }

    #[test]
    fn feature_mask_membership() {
        let mut asset = Taf::new();
        let mut flags = FeatureFlags::from(0u64);
        flags.set_quantized_coords(true);
        flags.set_hash_based_names(true);
        asset.set_feature_flags(flags);

        assert!(asset.has_feature(feature::QUANTIZED_COORDS));
        assert!(asset.has_feature(feature::QUANTIZED_COORDS | feature::HASH_BASED_NAMES));
        assert!(!asset.has_feature(feature::MESH_SHADERS));
        assert!(!asset.has_feature(feature::QUANTIZED_COORDS | feature::MESH_SHADERS));
    }

    #[test]
    fn world_bounds_quantized() {
        let mut asset = Taf::new();
        asset.set_world_bounds([-1.0, 0.0, 0.5], [1.0, 2.0, 4.25]);
        assert_eq!([-128000, 0, 64000], asset.header.bounds_min);
        assert_eq!([128000, 256000, 544000], asset.header.bounds_max);
    }

    #[test]
    fn creator_truncates_at_63_bytes() {
        let mut asset = Taf::new();
        asset.set_creator(&"x".repeat(100));
        assert_eq!(63, asset.header.creator.len());
        // Still serializes into the fixed 64-byte field.
        let bytes = save_to_vec(&asset);
        assert_eq!(HEADER_SIZE as usize, bytes.len());
    }
}
