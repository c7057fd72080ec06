//! PBR material records.
use binrw::{binrw, BinRead, BinWrite, NullString};

use crate::taf::truncated;

/// Size of the payload's count header in bytes.
pub const MATERIAL_HEADER_SIZE: usize = 8;
/// Size of a [MaterialRecord] on disk in bytes.
pub const MATERIAL_RECORD_SIZE: usize = 100;

/// Texture slot value for "no texture bound".
pub const NO_TEXTURE: u32 = u32::MAX;

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct MaterialRecord {
    #[br(map = |x: NullString| x.to_string())]
    #[bw(map = |x: &String| NullString::from(x.as_str()))]
    #[brw(pad_size_to = 32)]
    pub name: String,
    pub albedo: [f32; 4],
    pub emission: [f32; 3],
    pub metallic: f32,
    pub roughness: f32,
    pub normal_intensity: f32,
    pub alpha_cutoff: f32,
    /// Texture indices into the asset's texture table, [NO_TEXTURE] when
    /// absent: albedo, normal, metallic-roughness, emission, occlusion.
    pub albedo_texture: u32,
    pub normal_texture: u32,
    pub metallic_roughness_texture: u32,
    pub emission_texture: u32,
    pub occlusion_texture: u32,
    pub flags: u32,
}

impl MaterialRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: truncated(name, 31),
            ..Default::default()
        }
    }
}

impl Default for MaterialRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            albedo: [1.0, 1.0, 1.0, 1.0],
            emission: [0.0, 0.0, 0.0],
            metallic: 0.0,
            roughness: 1.0,
            normal_intensity: 1.0,
            alpha_cutoff: 0.5,
            albedo_texture: NO_TEXTURE,
            normal_texture: NO_TEXTURE,
            metallic_roughness_texture: NO_TEXTURE,
            emission_texture: NO_TEXTURE,
            occlusion_texture: NO_TEXTURE,
            flags: 0,
        }
    }
}

/// A material chunk payload.
#[binrw]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaterialPayload {
    #[br(temp)]
    #[bw(calc = materials.len() as u32)]
    material_count: u32,
    #[br(temp)]
    #[bw(calc = 0)]
    reserved: u32,
    #[br(count = material_count)]
    pub materials: Vec<MaterialRecord>,
}

impl MaterialPayload {
    pub fn material(&self, name: &str) -> Option<&MaterialRecord> {
        self.materials.iter().find(|m| m.name == name)
    }
}
