//! The TAFO overlay format: non-destructive edits applied to an existing
//! asset in memory.
//!
//! An overlay is a header, a list of target-asset records, a list of typed
//! operations, and a data blob addressed by each operation's
//! `(data_offset, data_size)` window. Operations apply in declaration
//! order; geometry transforms therefore compose left to right.
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use binrw::{BinRead, BinReaderExt, BinWrite, NullString};
use glam::{Mat3, Mat4, Vec3};
use log::warn;

use crate::error::{ApplyError, LoadError, SaveError};
use crate::geom::{color_offset, uv_offset, GeometryHeader, GEOMETRY_HEADER_SIZE, NORMAL_OFFSET, POSITION_OFFSET};
use crate::shdr::ShaderPayload;
use crate::taf::{
    check_position, feature, truncated, validation_error, Taf, MAX_VERSION_MAJOR,
    MAX_VERSION_MINOR, MAX_VERSION_PATCH, VERSION,
};
use crate::ChunkType;

/// Size of [TafoHeader] on disk in bytes.
pub const TAFO_HEADER_SIZE: u64 = 64;
/// Size of a [TargetAsset] on disk in bytes.
pub const TARGET_SIZE: u64 = 176;
/// Size of an [Operation] on disk in bytes.
pub const OPERATION_SIZE: u64 = 40;

/// Size of [TransformationData] on disk in bytes.
pub const TRANSFORMATION_DATA_SIZE: usize = 76;
/// Size of an [AttributeModification] on disk in bytes.
pub const ATTRIBUTE_MODIFICATION_SIZE: usize = 32;

/// [TransformationData] flag: apply the matrix to positions.
pub const TRANSFORM_POSITIONS: u32 = 1 << 0;
/// [TransformationData] flag: apply the linear part to normals and
/// re-normalize.
pub const TRANSFORM_NORMALS: u32 = 1 << 1;

/// Vertex index or count meaning "every vertex".
pub const ALL_VERTICES: u32 = u32::MAX;

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct TafoHeader {
    /// `TAFO`.
    pub magic: [u8; 4],
    pub version_major: u16,
    pub version_minor: u16,
    pub version_patch: u16,
    /// Always 1; overlays are not master assets.
    pub asset_type: u16,
    /// Raw feature mask the target asset must carry.
    pub feature_flags: u64,
    pub operation_count: u32,
    pub target_count: u32,
    pub total_size: u64,
    pub reserved: [u8; 28],
}

impl Default for TafoHeader {
    fn default() -> Self {
        Self {
            magic: *b"TAFO",
            version_major: VERSION.0,
            version_minor: VERSION.1,
            version_patch: VERSION.2,
            asset_type: 1,
            feature_flags: feature::HASH_BASED_NAMES,
            operation_count: 0,
            target_count: 0,
            total_size: 0,
            reserved: [0; 28],
        }
    }
}

/// A record naming an asset the overlay may be applied to.
#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct TargetAsset {
    #[br(map = |x: NullString| x.to_string())]
    #[bw(map = |x: &String| NullString::from(x.as_str()))]
    #[brw(pad_size_to = 128)]
    pub path: String,
    /// Zero until resolved at application time; path-hash matching is
    /// reserved for a future revision.
    pub target_hash: u64,
    /// Semver requirement string, e.g. `>=1.0`.
    #[br(map = |x: NullString| x.to_string())]
    #[bw(map = |x: &String| NullString::from(x.as_str()))]
    #[brw(pad_size_to = 32)]
    pub version_req: String,
    pub required_features: u64,
}

/// Operation type tags. The numeric values are part of the format.
#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u32))]
pub enum OverlayOp {
    ChunkReplace = 0,
    ShaderReplace = 1,
    VertexColorChange = 2,
    MaterialReplace = 3,
    GeometryModify = 4,
    VertexPositionChange = 5,
    VertexAttributeChange = 6,
    GeometryTransform = 7,
    GeometryScale = 8,
    GeometryRotate = 9,
    GeometryTranslate = 10,
    UvModification = 11,
    NormalRecalculation = 12,
    VertexSubset = 13,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct Operation {
    pub op_type: OverlayOp,
    pub target_chunk: ChunkType,
    /// Name hash of the targeted object, or a vertex index reinterpreted
    /// for per-vertex operations.
    pub target_hash: u64,
    pub replacement_hash: u64,
    /// Window into the overlay's data blob.
    pub data_offset: u64,
    pub data_size: u64,
}

#[derive(Debug, BinRead, Clone, Copy, PartialEq, Eq)]
#[br(repr(u32))]
pub enum AttributeOp {
    Replace = 0,
    Add = 1,
    Multiply = 2,
    Normalize = 3,
}

/// A patch to one vertex attribute, or the same attribute of every vertex.
#[derive(Debug, BinRead, Clone, PartialEq)]
pub struct AttributeModification {
    pub attribute_offset: u32,
    /// 4, 8, 12, or 16 bytes.
    pub attribute_size: u32,
    /// [ALL_VERTICES] applies to every vertex.
    pub vertex_index: u32,
    pub operation: AttributeOp,
    pub values: [f32; 4],
}

impl AttributeModification {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ATTRIBUTE_MODIFICATION_SIZE);
        bytes.extend_from_slice(&self.attribute_offset.to_le_bytes());
        bytes.extend_from_slice(&self.attribute_size.to_le_bytes());
        bytes.extend_from_slice(&self.vertex_index.to_le_bytes());
        bytes.extend_from_slice(&(self.operation as u32).to_le_bytes());
        for v in self.values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }
}

/// A row-major affine transform over a vertex range.
#[derive(Debug, BinRead, Clone, PartialEq)]
pub struct TransformationData {
    pub matrix: [f32; 16],
    pub flags: u32,
    pub start: u32,
    /// [ALL_VERTICES] covers the whole vertex array.
    pub count: u32,
}

impl TransformationData {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TRANSFORMATION_DATA_SIZE);
        for v in self.matrix {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.start.to_le_bytes());
        bytes.extend_from_slice(&self.count.to_le_bytes());
        bytes
    }
}

#[derive(Debug, BinRead, Clone, PartialEq)]
struct UvModificationData {
    u: f32,
    v: f32,
    flip_u: u32,
    flip_v: u32,
}

impl UvModificationData {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.u.to_le_bytes());
        bytes.extend_from_slice(&self.v.to_le_bytes());
        bytes.extend_from_slice(&self.flip_u.to_le_bytes());
        bytes.extend_from_slice(&self.flip_v.to_le_bytes());
        bytes
    }
}

#[derive(Debug, BinRead, Clone, PartialEq)]
struct VertexSubsetData {
    start: u32,
    count: u32,
    modification: AttributeModification,
}

impl VertexSubsetData {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + ATTRIBUTE_MODIFICATION_SIZE);
        bytes.extend_from_slice(&self.start.to_le_bytes());
        bytes.extend_from_slice(&self.count.to_le_bytes());
        bytes.extend_from_slice(&self.modification.to_bytes());
        bytes
    }
}

/// An in-memory TAFO overlay.
#[derive(Debug, Clone, Default)]
pub struct Tafo {
    pub header: TafoHeader,
    pub targets: Vec<TargetAsset>,
    pub operations: Vec<Operation>,
    /// Operation data blob; each operation addresses a window of it.
    pub data: Vec<u8>,
}

impl Tafo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an asset this overlay is meant for. The target hash stays
    /// zero until resolved at application time.
    pub fn add_target_asset(&mut self, path: &str, version_req: &str) {
        self.targets.push(TargetAsset {
            path: truncated(path, 127),
            target_hash: 0,
            version_req: truncated(version_req, 31),
            required_features: self.header.feature_flags,
        });
        self.header.target_count = self.targets.len() as u32;
    }

    fn push_op(
        &mut self,
        op_type: OverlayOp,
        target_chunk: ChunkType,
        target_hash: u64,
        replacement_hash: u64,
        data: &[u8],
    ) {
        let data_offset = self.data.len() as u64;
        self.data.extend_from_slice(data);
        self.operations.push(Operation {
            op_type,
            target_chunk,
            target_hash,
            replacement_hash,
            data_offset,
            data_size: data.len() as u64,
        });
        self.header.operation_count = self.operations.len() as u32;
    }

    /// Replaces the SPIR-V blob of the shader whose name hashes to
    /// `target_hash`.
    pub fn add_shader_replacement(
        &mut self,
        target_hash: u64,
        replacement_hash: u64,
        spirv: &[u8],
    ) {
        self.push_op(
            OverlayOp::ShaderReplace,
            ChunkType::Shader,
            target_hash,
            replacement_hash,
            spirv,
        );
    }

    pub fn add_vertex_color_change(&mut self, vertex_index: u32, rgba: [f32; 4]) {
        let mut data = Vec::with_capacity(16);
        for v in rgba {
            data.extend_from_slice(&v.to_le_bytes());
        }
        self.push_op(
            OverlayOp::VertexColorChange,
            ChunkType::Geometry,
            vertex_index as u64,
            0,
            &data,
        );
    }

    fn push_transform(&mut self, op_type: OverlayOp, matrix: Mat4, flags: u32, start: u32, count: u32) {
        let data = TransformationData {
            // Stored row-major.
            matrix: matrix.transpose().to_cols_array(),
            flags,
            start,
            count,
        };
        self.push_op(op_type, ChunkType::Geometry, 0, 0, &data.to_bytes());
    }

    pub fn add_scale_operation(&mut self, scale: Vec3, start: u32, count: u32) {
        self.push_transform(
            OverlayOp::GeometryScale,
            Mat4::from_scale(scale),
            TRANSFORM_POSITIONS,
            start,
            count,
        );
    }

    /// Rotation about `axis` by `angle` radians (the Rodrigues form).
    pub fn add_rotation_operation(&mut self, axis: Vec3, angle: f32, start: u32, count: u32) {
        self.push_transform(
            OverlayOp::GeometryRotate,
            Mat4::from_axis_angle(axis, angle),
            TRANSFORM_POSITIONS | TRANSFORM_NORMALS,
            start,
            count,
        );
    }

    pub fn add_translation_operation(&mut self, offset: Vec3, start: u32, count: u32) {
        self.push_transform(
            OverlayOp::GeometryTranslate,
            Mat4::from_translation(offset),
            TRANSFORM_POSITIONS,
            start,
            count,
        );
    }

    pub fn add_vertex_position_change(&mut self, vertex_index: u32, position: Vec3) {
        let modification = AttributeModification {
            attribute_offset: POSITION_OFFSET as u32,
            attribute_size: 12,
            vertex_index,
            operation: AttributeOp::Replace,
            values: [position.x, position.y, position.z, 0.0],
        };
        self.push_op(
            OverlayOp::VertexPositionChange,
            ChunkType::Geometry,
            vertex_index as u64,
            0,
            &modification.to_bytes(),
        );
    }

    pub fn add_normal_change(&mut self, vertex_index: u32, normal: Vec3, normalize: bool) {
        let modification = AttributeModification {
            attribute_offset: NORMAL_OFFSET as u32,
            attribute_size: 12,
            vertex_index,
            operation: if normalize {
                AttributeOp::Normalize
            } else {
                AttributeOp::Replace
            },
            values: [normal.x, normal.y, normal.z, 0.0],
        };
        self.push_op(
            OverlayOp::VertexAttributeChange,
            ChunkType::Geometry,
            vertex_index as u64,
            0,
            &modification.to_bytes(),
        );
    }

    /// A general attribute patch; the offset is taken verbatim.
    pub fn add_attribute_change(
        &mut self,
        vertex_index: u32,
        attribute_offset: u32,
        attribute_size: u32,
        operation: AttributeOp,
        values: [f32; 4],
    ) {
        let modification = AttributeModification {
            attribute_offset,
            attribute_size,
            vertex_index,
            operation,
            values,
        };
        self.push_op(
            OverlayOp::VertexAttributeChange,
            ChunkType::Geometry,
            vertex_index as u64,
            0,
            &modification.to_bytes(),
        );
    }

    /// Overwrites a vertex's UV. Set flips replace the coordinate with
    /// `1.0 - value` before writing.
    pub fn add_uv_modification(
        &mut self,
        vertex_index: u32,
        u: f32,
        v: f32,
        flip_u: bool,
        flip_v: bool,
    ) {
        let data = UvModificationData {
            u,
            v,
            flip_u: flip_u as u32,
            flip_v: flip_v as u32,
        };
        self.push_op(
            OverlayOp::UvModification,
            ChunkType::Geometry,
            vertex_index as u64,
            0,
            &data.to_bytes(),
        );
    }

    /// Writes `rgba` into every vertex of `[start, start + count)`.
    pub fn add_subset_color_change(&mut self, start: u32, count: u32, rgba: [f32; 4]) {
        let data = VertexSubsetData {
            start,
            count,
            modification: AttributeModification {
                // Rewritten from the target's feature flags at apply time.
                attribute_offset: color_offset(false) as u32,
                attribute_size: 16,
                vertex_index: ALL_VERTICES,
                operation: AttributeOp::Replace,
                values: rgba,
            },
        };
        self.push_op(
            OverlayOp::VertexSubset,
            ChunkType::Geometry,
            start as u64,
            0,
            &data.to_bytes(),
        );
    }

    /// Wholesale replacement of the payload under `tag`.
    pub fn add_chunk_replacement(&mut self, tag: ChunkType, bytes: &[u8]) {
        self.push_op(OverlayOp::ChunkReplace, tag, 0, 0, bytes);
    }

    pub fn add_material_replacement(&mut self, bytes: &[u8]) {
        self.push_op(OverlayOp::MaterialReplace, ChunkType::Material, 0, 0, bytes);
    }

    pub fn add_geometry_modify(&mut self, bytes: &[u8]) {
        self.push_op(OverlayOp::GeometryModify, ChunkType::Geometry, 0, 0, bytes);
    }

    /// The size the file will have after a save.
    pub fn file_size(&self) -> u64 {
        TAFO_HEADER_SIZE
            + self.targets.len() as u64 * TARGET_SIZE
            + self.operations.len() as u64 * OPERATION_SIZE
            + self.data.len() as u64
    }

    pub fn save<W: Write + Seek>(&self, writer: &mut W) -> Result<(), SaveError> {
        let mut header = self.header.clone();
        header.target_count = self.targets.len() as u32;
        header.operation_count = self.operations.len() as u32;
        header.total_size = self.file_size();

        header.write_le(writer)?;
        check_position(writer, TAFO_HEADER_SIZE)?;
        for target in &self.targets {
            target.write_le(writer)?;
        }
        for operation in &self.operations {
            operation.write_le(writer)?;
        }
        check_position(
            writer,
            TAFO_HEADER_SIZE
                + self.targets.len() as u64 * TARGET_SIZE
                + self.operations.len() as u64 * OPERATION_SIZE,
        )?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SaveError> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut writer)
    }

    pub fn load<R: Read + Seek>(reader: &mut R) -> Result<Self, LoadError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        if file_size < TAFO_HEADER_SIZE {
            return Err(validation_error(
                reader,
                format!(
                    "file of {file_size} bytes is smaller than the {TAFO_HEADER_SIZE} byte overlay header"
                ),
            ));
        }

        let header: TafoHeader = reader.read_le()?;
        if header.magic != *b"TAFO" {
            return Err(validation_error(
                reader,
                format!("bad overlay magic {:02X?}", header.magic),
            ));
        }
        if header.version_major > MAX_VERSION_MAJOR
            || header.version_minor > MAX_VERSION_MINOR
            || header.version_patch > MAX_VERSION_PATCH
        {
            return Err(validation_error(
                reader,
                format!(
                    "implausible version {}.{}.{}",
                    header.version_major, header.version_minor, header.version_patch
                ),
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
        let fixed_size = TAFO_HEADER_SIZE
            + header.target_count as u64 * TARGET_SIZE
            + header.operation_count as u64 * OPERATION_SIZE;
        if fixed_size > file_size {
            return Err(validation_error(
                reader,
                format!(
                    "{} targets and {} operations do not fit in {file_size} bytes",
                    header.target_count, header.operation_count
                ),
            ));
        }

        let mut targets = Vec::with_capacity(header.target_count as usize);
        for _ in 0..header.target_count {
            targets.push(TargetAsset::read_le(reader)?);
        }
        let mut operations = Vec::with_capacity(header.operation_count as usize);
        for _ in 0..header.operation_count {
            operations.push(Operation::read_le(reader)?);
        }

        let mut data = vec![0u8; (file_size - fixed_size) as usize];
        reader.read_exact(&mut data)?;

        for (index, operation) in operations.iter().enumerate() {
            if operation
                .data_offset
                .checked_add(operation.data_size)
                .is_none_or(|end| end > data.len() as u64)
            {
                return Err(validation_error(
                    reader,
                    format!(
                        "operation {index} window {}+{} outside {} byte data blob",
                        operation.data_offset,
                        operation.data_size,
                        data.len()
                    ),
                ));
            }
        }

        Ok(Self {
            header,
            targets,
            operations,
            data,
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        Self::load(&mut Cursor::new(bytes))
    }

    /// Whether this overlay may be applied to `asset`: the asset must carry
    /// the overlay's required capabilities and the overlay's major version
    /// must not exceed the engine's.
    pub fn targets_asset(&self, asset: &Taf) -> bool {
        asset.has_feature(self.header.feature_flags) && self.header.version_major <= VERSION.0
    }

    /// Applies every operation in declaration order, then recomputes the
    /// asset's directory checksums so it is ready for resave.
    pub fn apply(&self, asset: &mut Taf) -> Result<(), ApplyError> {
        if !self.targets_asset(asset) {
            return Err(ApplyError::NotTargeted {
                reason: format!(
                    "asset flags lack required mask {:#X} or overlay version {} is too new",
                    self.header.feature_flags, self.header.version_major
                ),
            });
        }
        let quantized = asset.has_feature(feature::QUANTIZED_COORDS);

        for operation in &self.operations {
            let data = self.operation_data(operation)?;
            let payload = asset
                .chunk_data_mut(operation.target_chunk)
                .ok_or(ApplyError::MissingChunk(operation.target_chunk))?;

            match operation.op_type {
                OverlayOp::ShaderReplace => apply_shader_replace(
                    payload,
                    operation.target_hash,
                    operation.replacement_hash,
                    data,
                )?,
                OverlayOp::VertexColorChange => {
                    apply_vertex_color(payload, operation.target_hash as u32, data, quantized)?
                }
                OverlayOp::VertexPositionChange | OverlayOp::VertexAttributeChange => {
                    let modification = read_record::<AttributeModification>(
                        data,
                        ATTRIBUTE_MODIFICATION_SIZE,
                    )?;
                    apply_attribute(payload, &modification)?
                }
                OverlayOp::GeometryTransform
                | OverlayOp::GeometryScale
                | OverlayOp::GeometryRotate
                | OverlayOp::GeometryTranslate => {
                    let transform =
                        read_record::<TransformationData>(data, TRANSFORMATION_DATA_SIZE)?;
                    apply_transform(payload, &transform)?
                }
                OverlayOp::UvModification => {
                    apply_uv(payload, operation.target_hash as u32, data, quantized)?
                }
                OverlayOp::NormalRecalculation => {
                    warn!("normal recalculation requested; treated as a no-op");
                }
                OverlayOp::VertexSubset => apply_subset(payload, data, quantized)?,
                OverlayOp::ChunkReplace
                | OverlayOp::MaterialReplace
                | OverlayOp::GeometryModify => {
                    *payload = data.to_vec();
                }
            }
        }

        asset.refresh_directory();
        Ok(())
    }

    fn operation_data(&self, operation: &Operation) -> Result<&[u8], ApplyError> {
        let start = operation.data_offset as usize;
        self.data
            .get(start..start + operation.data_size as usize)
            .ok_or(ApplyError::BadDataWindow {
                offset: operation.data_offset,
                size: operation.data_size,
                blob_len: self.data.len(),
            })
    }
}

fn read_record<T>(data: &[u8], needed: usize) -> Result<T, ApplyError>
where
    for<'a> T: BinRead<Args<'a> = ()>,
{
    if data.len() < needed {
        return Err(ApplyError::DataTooSmall {
            needed,
            actual: data.len(),
        });
    }
    T::read_le(&mut Cursor::new(data)).map_err(Into::into)
}

fn geometry_header(payload: &[u8]) -> Result<GeometryHeader, ApplyError> {
    GeometryHeader::read_le(&mut Cursor::new(payload)).map_err(Into::into)
}

fn write_bytes(payload: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ApplyError> {
    let end = offset + bytes.len();
    if end > payload.len() {
        return Err(ApplyError::PayloadOverrun {
            offset,
            size: bytes.len(),
            payload_len: payload.len(),
        });
    }
    payload[offset..end].copy_from_slice(bytes);
    Ok(())
}

fn read_floats(payload: &[u8], offset: usize, count: usize) -> Result<Vec<f32>, ApplyError> {
    let end = offset + count * 4;
    let bytes = payload
        .get(offset..end)
        .ok_or(ApplyError::PayloadOverrun {
            offset,
            size: count * 4,
            payload_len: payload.len(),
        })?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn write_floats(payload: &mut [u8], offset: usize, values: &[f32]) -> Result<(), ApplyError> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    write_bytes(payload, offset, &bytes)
}

fn apply_shader_replace(
    payload: &mut Vec<u8>,
    target_hash: u64,
    replacement_hash: u64,
    spirv: &[u8],
) -> Result<(), ApplyError> {
    let mut shaders = ShaderPayload::from_bytes(payload.as_slice())?;
    let index = shaders
        .index_by_hash(target_hash)
        .ok_or(ApplyError::ShaderNotFound { hash: target_hash })?;

    shaders.blobs[index] = spirv.to_vec();
    shaders.descriptors[index].spirv_size = spirv.len() as u32;
    if replacement_hash != 0 {
        shaders.descriptors[index].name_hash = replacement_hash;
    }
    // Rewrite the whole payload so later blobs shift accordingly.
    *payload = shaders.to_bytes()?;
    Ok(())
}

fn apply_vertex_color(
    payload: &mut [u8],
    vertex: u32,
    data: &[u8],
    quantized: bool,
) -> Result<(), ApplyError> {
    if data.len() < 16 {
        return Err(ApplyError::DataTooSmall {
            needed: 16,
            actual: data.len(),
        });
    }
    let header = geometry_header(payload)?;
    if vertex >= header.vertex_count {
        return Err(ApplyError::VertexOutOfRange {
            index: vertex,
            count: header.vertex_count,
        });
    }
    let offset = GEOMETRY_HEADER_SIZE
        + vertex as usize * header.vertex_stride as usize
        + color_offset(quantized);
    write_bytes(payload, offset, &data[..16])
}

fn apply_attribute(
    payload: &mut [u8],
    modification: &AttributeModification,
) -> Result<(), ApplyError> {
    if !matches!(modification.attribute_size, 4 | 8 | 12 | 16) {
        return Err(ApplyError::BadAttributeSize(modification.attribute_size));
    }
    let header = geometry_header(payload)?;
    let attribute_offset = modification.attribute_offset as usize;

    let range = if modification.vertex_index == ALL_VERTICES {
        0..header.vertex_count
    } else {
        if modification.vertex_index >= header.vertex_count {
            return Err(ApplyError::VertexOutOfRange {
                index: modification.vertex_index,
                count: header.vertex_count,
            });
        }
        modification.vertex_index..modification.vertex_index + 1
    };

    for vertex in range {
        apply_attribute_at(payload, &header, vertex, attribute_offset, modification)?;
    }
    Ok(())
}

fn apply_attribute_at(
    payload: &mut [u8],
    header: &GeometryHeader,
    vertex: u32,
    attribute_offset: usize,
    modification: &AttributeModification,
) -> Result<(), ApplyError> {
    let component_count = modification.attribute_size as usize / 4;
    let offset =
        GEOMETRY_HEADER_SIZE + vertex as usize * header.vertex_stride as usize + attribute_offset;
    let values = &modification.values[..component_count];

    match modification.operation {
        AttributeOp::Replace => write_floats(payload, offset, values),
        AttributeOp::Add => {
            let current = read_floats(payload, offset, component_count)?;
            let summed: Vec<f32> = current.iter().zip(values).map(|(a, b)| a + b).collect();
            write_floats(payload, offset, &summed)
        }
        AttributeOp::Multiply => {
            let current = read_floats(payload, offset, component_count)?;
            let scaled: Vec<f32> = current.iter().zip(values).map(|(a, b)| a * b).collect();
            write_floats(payload, offset, &scaled)
        }
        AttributeOp::Normalize => {
            let length = values.iter().map(|v| v * v).sum::<f32>().sqrt();
            if length > 0.0 {
                let normalized: Vec<f32> = values.iter().map(|v| v / length).collect();
                write_floats(payload, offset, &normalized)
            } else {
                warn!("normalize of a zero-length attribute, writing unchanged values");
                write_floats(payload, offset, values)
            }
        }
    }
}

fn apply_transform(payload: &mut [u8], transform: &TransformationData) -> Result<(), ApplyError> {
    let header = geometry_header(payload)?;
    let matrix = Mat4::from_cols_array(&transform.matrix).transpose();
    let normal_matrix = Mat3::from_mat4(matrix);

    let start = transform.start.min(header.vertex_count);
    let end = if transform.count == ALL_VERTICES {
        header.vertex_count
    } else {
        transform
            .start
            .saturating_add(transform.count)
            .min(header.vertex_count)
    };

    for vertex in start..end {
        let base = GEOMETRY_HEADER_SIZE + vertex as usize * header.vertex_stride as usize;
        if transform.flags & TRANSFORM_POSITIONS != 0 {
            let p = read_floats(payload, base + POSITION_OFFSET, 3)?;
            let p = matrix.transform_point3(Vec3::new(p[0], p[1], p[2]));
            write_floats(payload, base + POSITION_OFFSET, &p.to_array())?;
        }
        if transform.flags & TRANSFORM_NORMALS != 0 {
            let n = read_floats(payload, base + NORMAL_OFFSET, 3)?;
            let n = normal_matrix * Vec3::new(n[0], n[1], n[2]);
            let n = if n.length_squared() > 0.0 { n.normalize() } else { n };
            write_floats(payload, base + NORMAL_OFFSET, &n.to_array())?;
        }
    }
    Ok(())
}

fn apply_uv(
    payload: &mut [u8],
    vertex: u32,
    data: &[u8],
    quantized: bool,
) -> Result<(), ApplyError> {
    let uv: UvModificationData = read_record(data, 16)?;
    let header = geometry_header(payload)?;
    if vertex >= header.vertex_count {
        return Err(ApplyError::VertexOutOfRange {
            index: vertex,
            count: header.vertex_count,
        });
    }
    let u = if uv.flip_u != 0 { 1.0 - uv.u } else { uv.u };
    let v = if uv.flip_v != 0 { 1.0 - uv.v } else { uv.v };
    let offset = GEOMETRY_HEADER_SIZE
        + vertex as usize * header.vertex_stride as usize
        + uv_offset(quantized);
    write_floats(payload, offset, &[u, v])
}

fn apply_subset(payload: &mut [u8], data: &[u8], quantized: bool) -> Result<(), ApplyError> {
    let subset: VertexSubsetData = read_record(data, 8 + ATTRIBUTE_MODIFICATION_SIZE)?;
    if !matches!(subset.modification.attribute_size, 4 | 8 | 12 | 16) {
        return Err(ApplyError::BadAttributeSize(subset.modification.attribute_size));
    }
    let header = geometry_header(payload)?;
    // Color patches follow the same offset policy as VertexColorChange.
    let attribute_offset = if subset.modification.attribute_size == 16 {
        color_offset(quantized)
    } else {
        subset.modification.attribute_offset as usize
    };

    let end = if subset.count == ALL_VERTICES {
        header.vertex_count
    } else {
        subset
            .start
            .saturating_add(subset.count)
            .min(header.vertex_count)
    };
    for vertex in subset.start.min(header.vertex_count)..end {
        apply_attribute_at(
            payload,
            &header,
            vertex,
            attribute_offset,
            &subset.modification,
        )?;
    }
    Ok(())
}
