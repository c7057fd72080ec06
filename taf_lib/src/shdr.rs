//! Embedded SPIR-V shader modules.
//!
//! The payload is a count header, one descriptor per shader, then all
//! SPIR-V blobs concatenated in descriptor order. Validation here stops at
//! the magic word and 4-byte alignment; nothing inspects the module beyond
//! that.
use std::io::{Cursor, Read, Seek, Write};

use binrw::{BinRead, BinResult, BinWrite};
use thiserror::Error;

use crate::hash::hash_name;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x07230203;

/// Size of the payload's count header in bytes.
pub const SHADER_HEADER_SIZE: usize = 8;
/// Size of a [ShaderDescriptor] on disk in bytes.
pub const SHADER_DESCRIPTOR_SIZE: usize = 40;

#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u32))]
pub enum ShaderStage {
    Vertex = 0,
    Fragment = 1,
    Geometry = 2,
    Compute = 3,
    MeshShader = 4,
    TaskShader = 5,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct ShaderDescriptor {
    pub name_hash: u64,
    pub entry_point_hash: u64,
    pub stage: ShaderStage,
    /// Size of this shader's SPIR-V blob in bytes, always a multiple of 4.
    pub spirv_size: u32,
    /// Mesh-shader output caps, zero for other stages.
    pub max_vertices_out: u32,
    pub max_primitives_out: u32,
    pub workgroup_size: u32,
    pub reserved: u32,
}

#[derive(Debug, Error)]
pub enum AddShaderError {
    #[error("SPIR-V module of {0} bytes is too small")]
    TooSmall(usize),

    #[error("SPIR-V module size {0} is not a multiple of 4")]
    Alignment(usize),

    #[error("SPIR-V module starts with {0:#010X}, expected 0x07230203")]
    Magic(u32),
}

/// A shader chunk payload: descriptors plus one blob per descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShaderPayload {
    pub descriptors: Vec<ShaderDescriptor>,
    /// SPIR-V blobs in descriptor order.
    pub blobs: Vec<Vec<u8>>,
}

impl ShaderPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a shader after checking the SPIR-V magic and alignment.
    pub fn add_shader(
        &mut self,
        name: &str,
        entry_point: &str,
        stage: ShaderStage,
        spirv: Vec<u8>,
    ) -> Result<(), AddShaderError> {
        validate_spirv(&spirv)?;
        self.descriptors.push(ShaderDescriptor {
            name_hash: hash_name(name),
            entry_point_hash: hash_name(entry_point),
            stage,
            spirv_size: spirv.len() as u32,
            max_vertices_out: 0,
            max_primitives_out: 0,
            workgroup_size: 0,
            reserved: 0,
        });
        self.blobs.push(spirv);
        Ok(())
    }

    /// Index of the descriptor whose name hashes to `hash`.
    pub fn index_by_hash(&self, hash: u64) -> Option<usize> {
        self.descriptors.iter().position(|d| d.name_hash == hash)
    }

    pub fn read<R: Read + Seek>(reader: &mut R) -> BinResult<Self> {
        let count = u32::read_le(reader)?;
        let _reserved = u32::read_le(reader)?;

        let mut descriptors = Vec::with_capacity(count as usize);
        for _ in 0..count {
            descriptors.push(ShaderDescriptor::read_le(reader)?);
        }

        let mut blobs = Vec::with_capacity(count as usize);
        for descriptor in &descriptors {
            let mut blob = vec![0u8; descriptor.spirv_size as usize];
            reader.read_exact(&mut blob)?;
            blobs.push(blob);
        }

        Ok(Self { descriptors, blobs })
    }

    pub fn from_bytes<B: AsRef<[u8]>>(bytes: B) -> BinResult<Self> {
        Self::read(&mut Cursor::new(bytes))
    }

    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> BinResult<()> {
        (self.descriptors.len() as u32).write_le(writer)?;
        0u32.write_le(writer)?;
        for descriptor in &self.descriptors {
            descriptor.write_le(writer)?;
        }
        for blob in &self.blobs {
            writer.write_all(blob)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut writer = Cursor::new(Vec::new());
        self.write(&mut writer)?;
        Ok(writer.into_inner())
    }
}

pub(crate) fn validate_spirv(spirv: &[u8]) -> Result<(), AddShaderError> {
    if spirv.len() < 4 {
        return Err(AddShaderError::TooSmall(spirv.len()));
    }
    if spirv.len() % 4 != 0 {
        return Err(AddShaderError::Alignment(spirv.len()));
    }
    let magic = u32::from_le_bytes([spirv[0], spirv[1], spirv[2], spirv[3]]);
    if magic != SPIRV_MAGIC {
        return Err(AddShaderError::Magic(magic));
    }
    Ok(())
}

/// The first word of the first blob in a raw shader payload, read at the
/// offset the descriptor table implies. Used as a write-time diagnostic.
pub fn first_blob_magic(payload: &[u8]) -> Option<u32> {
    let count = u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?) as usize;
    let blob_start = SHADER_HEADER_SIZE + count * SHADER_DESCRIPTOR_SIZE;
    let word = payload.get(blob_start..blob_start + 4)?;
    Some(u32::from_le_bytes(word.try_into().ok()?))
}
