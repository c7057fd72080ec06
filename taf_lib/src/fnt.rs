//! SDF font atlases: glyph metrics, kerning pairs, and an R8 distance
//! field texture.
use binrw::{BinRead, BinWrite};

/// Size of [FontHeader] on disk in bytes.
pub const FONT_HEADER_SIZE: usize = 64;
/// Size of a [Glyph] on disk in bytes.
pub const GLYPH_SIZE: usize = 40;
/// Size of a [KerningPair] on disk in bytes.
pub const KERNING_PAIR_SIZE: usize = 12;

#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u32))]
pub enum AtlasFormat {
    /// One byte per texel.
    R8 = 0,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct FontHeader {
    pub glyph_count: u32,
    pub atlas_width: u32,
    pub atlas_height: u32,
    pub texture_format: AtlasFormat,
    /// Distance field range in pixels.
    pub sdf_range: f32,
    /// Size the glyphs were rasterized at, in pixels.
    pub font_size: f32,
    pub ascent: f32,
    pub descent: f32,
    pub line_height: f32,
    pub first_codepoint: u32,
    pub last_codepoint: u32,
    pub kerning_pair_count: u32,
    /// Section offsets relative to the start of the payload.
    pub glyph_offset: u32,
    pub kerning_offset: u32,
    pub texture_offset: u32,
    pub reserved: u32,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct Glyph {
    pub codepoint: u32,
    /// Atlas UV rect.
    pub uv_min: [f32; 2],
    pub uv_max: [f32; 2],
    /// Rendered quad size in pixels.
    pub size: [f32; 2],
    pub bearing: [f32; 2],
    pub advance: f32,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct KerningPair {
    pub first: u32,
    pub second: u32,
    pub adjust: f32,
}

/// A font chunk payload.
#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct FontPayload {
    pub header: FontHeader,
    #[br(count = header.glyph_count)]
    pub glyphs: Vec<Glyph>,
    #[br(count = header.kerning_pair_count)]
    pub kerning: Vec<KerningPair>,
    /// R8 distance field texels, `atlas_width * atlas_height` bytes.
    #[br(count = header.atlas_width as usize * header.atlas_height as usize)]
    pub atlas: Vec<u8>,
}

impl FontPayload {
    /// Builds a payload, computing the header's counts, codepoint range, and
    /// section offsets.
    pub fn new(
        mut header: FontHeader,
        glyphs: Vec<Glyph>,
        kerning: Vec<KerningPair>,
        atlas: Vec<u8>,
    ) -> Self {
        header.glyph_count = glyphs.len() as u32;
        header.kerning_pair_count = kerning.len() as u32;
        header.first_codepoint = glyphs.iter().map(|g| g.codepoint).min().unwrap_or(0);
        header.last_codepoint = glyphs.iter().map(|g| g.codepoint).max().unwrap_or(0);
        header.glyph_offset = FONT_HEADER_SIZE as u32;
        header.kerning_offset = header.glyph_offset + (glyphs.len() * GLYPH_SIZE) as u32;
        header.texture_offset =
            header.kerning_offset + (kerning.len() * KERNING_PAIR_SIZE) as u32;
        Self {
            header,
            glyphs,
            kerning,
            atlas,
        }
    }

    pub fn glyph(&self, codepoint: u32) -> Option<&Glyph> {
        self.glyphs.iter().find(|g| g.codepoint == codepoint)
    }

    /// Horizontal adjustment for the pair, zero when no pair is recorded.
    pub fn kerning(&self, first: u32, second: u32) -> f32 {
        self.kerning
            .iter()
            .find(|k| k.first == first && k.second == second)
            .map(|k| k.adjust)
            .unwrap_or(0.0)
    }
}
