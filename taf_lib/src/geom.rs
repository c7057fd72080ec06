//! Geometry payloads for traditional and mesh-shader pipelines.
//!
//! A payload is a fixed header, a dense vertex array of
//! `vertex_count * vertex_stride` bytes, and an optional u32 index array.
//! The vertex format bitmask is a hint to consumers; the authoritative
//! layout is whatever the producer packed into `vertex_stride` bytes.
use bilge::prelude::*;
use binrw::{BinRead, BinWrite};

/// Size of [GeometryHeader] on disk in bytes.
pub const GEOMETRY_HEADER_SIZE: usize = 96;

/// Byte offset of the float position within a vertex, fixed by convention.
pub const POSITION_OFFSET: usize = 0;
/// Byte offset of the float normal within a vertex, fixed by convention.
pub const NORMAL_OFFSET: usize = 12;

/// Byte offset of the RGBA color attribute within a vertex.
///
/// Quantized positions occupy 24 bytes ([i64; 3]) followed by a 12-byte
/// normal; float positions occupy 12. Overlays patching colors must branch
/// on the asset's quantized coordinate feature flag exactly like this.
pub const fn color_offset(quantized: bool) -> usize {
    if quantized {
        36
    } else {
        24
    }
}

/// Byte offset of the UV attribute within a vertex, after the 16-byte color.
pub const fn uv_offset(quantized: bool) -> usize {
    color_offset(quantized) + 16
}

/// Attribute presence hints for consumers.
#[bitsize(32)]
#[derive(DebugBits, FromBits, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[br(map = u32::into)]
#[bw(map = |&x| u32::from(x))]
pub struct VertexFormat {
    pub position_3d: bool,
    pub position_2d: bool,
    pub normal: bool,
    pub tangent: bool,
    pub tex_coord0: bool,
    pub tex_coord1: bool,
    pub color: bool,
    pub bone_indices: bool,
    pub bone_weights: bool,
    pub custom0: bool,
    pub custom1: bool,
    pub custom2: bool,
    pub custom3: bool,
    pub reserved: u19,
}

#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u32))]
pub enum RenderMode {
    Traditional = 0,
    MeshShader = 1,
}

#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u32))]
pub enum PrimitiveType {
    Triangles = 0,
    Lines = 1,
    Points = 2,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct GeometryHeader {
    pub vertex_count: u32,
    pub index_count: u32,
    /// Bytes per vertex in the dense array.
    pub vertex_stride: u32,
    pub vertex_format: VertexFormat,
    /// Bounds in quantized units (1/128000 of a world unit).
    pub bounds_min: [i64; 3],
    pub bounds_max: [i64; 3],
    pub lod_distance: f32,
    pub lod_level: u32,
    pub render_mode: RenderMode,
    /// Mesh-shader output caps, meaningful when
    /// [render_mode](Self::render_mode) is [RenderMode::MeshShader].
    pub max_vertices_out: u32,
    pub max_primitives_out: u32,
    pub workgroup_size: u32,
    pub primitive_type: PrimitiveType,
    pub reserved: u32,
}

impl Default for GeometryHeader {
    fn default() -> Self {
        Self {
            vertex_count: 0,
            index_count: 0,
            vertex_stride: 0,
            vertex_format: VertexFormat::from(0u32),
            bounds_min: [0; 3],
            bounds_max: [0; 3],
            lod_distance: 0.0,
            lod_level: 0,
            render_mode: RenderMode::Traditional,
            max_vertices_out: 64,
            max_primitives_out: 126,
            workgroup_size: 32,
            primitive_type: PrimitiveType::Triangles,
            reserved: 0,
        }
    }
}

/// A geometry chunk payload.
#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct Geometry {
    pub header: GeometryHeader,
    /// `vertex_count * vertex_stride` bytes laid out by the producer.
    #[br(count = header.vertex_count as usize * header.vertex_stride as usize)]
    pub vertices: Vec<u8>,
    #[br(count = header.index_count)]
    pub indices: Vec<u32>,
}

impl Geometry {
    /// Builds a payload from raw vertex bytes, fixing up the header counts.
    pub fn new(mut header: GeometryHeader, vertices: Vec<u8>, indices: Vec<u32>) -> Self {
        header.vertex_count = if header.vertex_stride == 0 {
            0
        } else {
            (vertices.len() / header.vertex_stride as usize) as u32
        };
        header.index_count = indices.len() as u32;
        Self {
            header,
            vertices,
            indices,
        }
    }

    /// The vertex at `index` as a byte slice of `vertex_stride` bytes.
    pub fn vertex(&self, index: u32) -> Option<&[u8]> {
        let stride = self.header.vertex_stride as usize;
        let start = index as usize * stride;
        self.vertices.get(start..start + stride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_layout() {
        let geometry = Geometry::new(GeometryHeader::default(), Vec::new(), Vec::new());
        let bytes = geometry.to_bytes().unwrap();
        assert_eq!(GEOMETRY_HEADER_SIZE, bytes.len());
    }

    #[test]
    fn payload_round_trip() {
        let header = GeometryHeader {
            vertex_stride: 76,
            vertex_format: {
                let mut format = VertexFormat::from(0u32);
                format.set_position_3d(true);
                format.set_normal(true);
                format.set_color(true);
                format
            },
            ..Default::default()
        };
        let vertices = vec![0xAB; 3 * 76];
        let indices = vec![0, 1, 2];
        let geometry = Geometry::new(header, vertices, indices);

        let bytes = geometry.to_bytes().unwrap();
        assert_eq!(GEOMETRY_HEADER_SIZE + 3 * 76 + 12, bytes.len());

        let loaded = Geometry::from_bytes(&bytes).unwrap();
        assert_eq!(geometry, loaded);
        assert_eq!(3, loaded.header.vertex_count);
        assert_eq!(76, loaded.vertex(2).unwrap().len());
        assert!(loaded.vertex(3).is_none());
    }

    #[test]
    fn attribute_offset_policy() {
        assert_eq!(24, color_offset(false));
        assert_eq!(36, color_offset(true));
        assert_eq!(40, uv_offset(false));
        assert_eq!(52, uv_offset(true));
    }
}
