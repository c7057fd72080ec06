//! A library for reading and writing TAF asset containers and TAFO overlays.
//!
//! A TAF file packages the subsystems of an interactive asset — geometry for
//! mesh-shader pipelines, embedded SPIR-V modules, PBR materials, SDF font
//! atlases, and a node-graph audio payload — as tagged, CRC-verified chunks
//! behind a fixed header and directory. A [Tafo] overlay describes
//! non-destructive edits (shader swaps, vertex attribute patches, geometry
//! transforms) applied to an asset in memory.
//!
//! Chunk payload layouts live in their own modules: [geom], [shdr], [mtrl],
//! [audi], and [fnt]. All on-disk integers are little-endian and all records
//! are packed without implicit padding.
use std::io::{Cursor, Read, Seek, Write};

use binrw::{BinRead, BinReaderExt, BinResult, BinWrite};

pub mod audi;
pub mod error;
pub mod fnt;
pub mod geom;
pub mod hash;
pub mod mtrl;
pub mod shdr;
pub mod taf;
pub mod tafo;

pub use taf::Taf;
pub use tafo::Tafo;

/// Chunk type tags, the little-endian FourCC of four ASCII bytes.
#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[brw(repr(u32))]
#[repr(u32)]
pub enum ChunkType {
    Geometry = u32::from_le_bytes(*b"GEOM"),
    Material = u32::from_le_bytes(*b"MTRL"),
    Shader = u32::from_le_bytes(*b"SHDR"),
    Texture = u32::from_le_bytes(*b"TXTR"),
    Animation = u32::from_le_bytes(*b"ANIM"),
    Script = u32::from_le_bytes(*b"SCPT"),
    Physics = u32::from_le_bytes(*b"PHYS"),
    Audio = u32::from_le_bytes(*b"AUDI"),
    Font = u32::from_le_bytes(*b"FONT"),
    Overlay = u32::from_le_bytes(*b"OVRL"),
    /// Streaming audio data chunks emitted by the chunked writer.
    AudioChunk = u32::from_le_bytes(*b"CHKO"),
    Fractal = u32::from_le_bytes(*b"FRAC"),
    Particle = u32::from_le_bytes(*b"PART"),
    VectorUi = u32::from_le_bytes(*b"SVGU"),
    Dependency = u32::from_le_bytes(*b"DEPS"),
}

impl ChunkType {
    /// The raw FourCC value.
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// The four ASCII bytes of the tag, for diagnostics.
    pub const fn tag_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }
}

macro_rules! payload_read_impl {
    ($($type_name:path),*) => {
        $(
            impl $type_name {
                pub fn read<R: Read + Seek>(reader: &mut R) -> BinResult<Self> {
                    reader.read_le()
                }

                pub fn from_bytes<B: AsRef<[u8]>>(bytes: B) -> BinResult<Self> {
                    Self::read(&mut Cursor::new(bytes))
                }
            }
        )*
    };
}

payload_read_impl!(
    geom::Geometry,
    mtrl::MaterialPayload,
    audi::AudioPayload,
    fnt::FontPayload
);

macro_rules! payload_write_impl {
    ($($type_name:path),*) => {
        $(
            impl $type_name {
                pub fn write<W: Write + Seek>(&self, writer: &mut W) -> BinResult<()> {
                    self.write_le(writer)
                }

                pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
                    let mut writer = Cursor::new(Vec::new());
                    self.write_le(&mut writer)?;
                    Ok(writer.into_inner())
                }
            }
        )*
    };
}

payload_write_impl!(geom::Geometry, mtrl::MaterialPayload, fnt::FontPayload);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tags_are_ascii_fourcc() {
        assert_eq!(*b"GEOM", ChunkType::Geometry.tag_bytes());
        assert_eq!(*b"CHKO", ChunkType::AudioChunk.tag_bytes());
        assert_eq!(u32::from_le_bytes(*b"AUDI"), ChunkType::Audio.tag());
    }
}
