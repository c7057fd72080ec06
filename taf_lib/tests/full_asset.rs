//! End-to-end exercise of a complete asset: every payload kind, a save and
//! validated reload, and an overlay pass over the result.
use std::io::Cursor;

use taf_lib::audi::{AudioGraphBuilder, AudioPayload, NodeType};
use taf_lib::fnt::{AtlasFormat, FontHeader, FontPayload, Glyph, KerningPair};
use taf_lib::geom::{Geometry, GeometryHeader, GEOMETRY_HEADER_SIZE};
use taf_lib::hash::hash_name;
use taf_lib::mtrl::{MaterialPayload, MaterialRecord};
use taf_lib::shdr::{ShaderPayload, ShaderStage, SPIRV_MAGIC};
use taf_lib::taf::{feature, FeatureFlags, ENTRY_SIZE, HEADER_SIZE};
use taf_lib::{ChunkType, Taf, Tafo};

fn spirv_stub(words: usize) -> Vec<u8> {
    let mut blob = SPIRV_MAGIC.to_le_bytes().to_vec();
    blob.extend((1..words as u32).flat_map(|w| w.to_le_bytes()));
    blob
}

/// Position (12), normal (12), color (16): a 40-byte float vertex.
fn quad_geometry() -> Geometry {
    let mut vertices = Vec::new();
    for (x, y) in [(0.0f32, 0.0f32), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
        for value in [x, y, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0] {
            vertices.extend_from_slice(&value.to_le_bytes());
        }
    }
    let header = GeometryHeader {
        vertex_stride: 40,
        ..Default::default()
    };
    Geometry::new(header, vertices, vec![0, 1, 2, 0, 2, 3])
}

fn build_asset() -> Taf {
    let mut asset = Taf::new();
    asset.set_creator("Taffy");
    asset.set_description("integration fixture");
    asset.set_world_bounds([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]);
    let mut flags = FeatureFlags::from(0u64);
    flags.set_hash_based_names(true);
    flags.set_embedded_spirv(true);
    flags.set_sdf_fonts(true);
    asset.set_feature_flags(flags);

    asset.add_geometry(&quad_geometry(), "quad").unwrap();

    let mut glow = MaterialRecord::new("lantern_glow");
    glow.emission = [4.0, 3.2, 1.1];
    let materials = MaterialPayload {
        materials: vec![MaterialRecord::new("flat_stone"), glow],
    };
    asset.add_materials(&materials, "surfaces").unwrap();

    let mut shaders = ShaderPayload::new();
    shaders
        .add_shader("quad_vertex", "main", ShaderStage::Vertex, spirv_stub(8))
        .unwrap();
    shaders
        .add_shader(
            "data_driven_fragment_shader",
            "main",
            ShaderStage::Fragment,
            spirv_stub(16),
        )
        .unwrap();
    asset.add_shaders(&shaders, "pipeline").unwrap();

    let mut graph = AudioGraphBuilder::new(48000);
    let osc = graph.add_node(NodeType::Oscillator, "hum", [0.0, 0.0], 1, 1);
    let amp = graph.add_node(NodeType::Amplifier, "out", [100.0, 0.0], 2, 1);
    graph
        .add_parameter(osc, "frequency", 440.0, 20.0, 20000.0, 2.0, 0)
        .unwrap();
    graph.connect(osc, 0, amp, 0, 1.0).unwrap();
    graph.add_wavetable("hum_cycle", &[0.0, 0.5, 0.0, -0.5], 1, 110.0, 0, 3);
    asset.add_audio_graph(&graph, "ambience").unwrap();

    let font = FontPayload::new(
        FontHeader {
            glyph_count: 0,
            atlas_width: 8,
            atlas_height: 8,
            texture_format: AtlasFormat::R8,
            sdf_range: 4.0,
            font_size: 32.0,
            ascent: 26.0,
            descent: -6.0,
            line_height: 38.0,
            first_codepoint: 0,
            last_codepoint: 0,
            kerning_pair_count: 0,
            glyph_offset: 0,
            kerning_offset: 0,
            texture_offset: 0,
            reserved: 0,
        },
        vec![Glyph {
            codepoint: 'A' as u32,
            uv_min: [0.0, 0.0],
            uv_max: [0.25, 0.25],
            size: [14.0, 18.0],
            bearing: [1.0, 15.0],
            advance: 16.0,
        }],
        vec![KerningPair {
            first: 'A' as u32,
            second: 'V' as u32,
            adjust: -1.5,
        }],
        vec![0x80; 64],
    );
    asset.add_font(&font, "ui_font").unwrap();

    asset
}

fn save_to_vec(asset: &Taf) -> Vec<u8> {
    let mut writer = Cursor::new(Vec::new());
    asset.save(&mut writer).unwrap();
    writer.into_inner()
}

#[test]
fn full_asset_survives_save_and_load() {
    let asset = build_asset();
    let bytes = save_to_vec(&asset);

    let expected_size = HEADER_SIZE
        + 5 * ENTRY_SIZE
        + asset.directory.iter().map(|e| e.size).sum::<u64>();
    assert_eq!(expected_size, bytes.len() as u64);
    assert_eq!(expected_size, asset.file_size());

    let loaded = Taf::load(&mut Cursor::new(bytes)).unwrap();
    assert_eq!("Taffy", loaded.header.creator);
    assert_eq!("integration fixture", loaded.header.description);
    assert_eq!([-128000, -128000, -128000], loaded.header.bounds_min);
    assert_eq!(5, loaded.chunk_count());
    assert!(loaded.has_feature(feature::HASH_BASED_NAMES | feature::EMBEDDED_SPIRV));

    // Payload maps match byte for byte, directory entries except offsets.
    for tag in asset.chunk_types() {
        assert_eq!(asset.chunk_data(tag), loaded.chunk_data(tag), "{tag:?}");
    }
    for (original, reloaded) in asset.directory.iter().zip(&loaded.directory) {
        assert_eq!(original.tag, reloaded.tag);
        assert_eq!(original.size, reloaded.size);
        assert_eq!(original.checksum, reloaded.checksum);
        assert_eq!(original.name, reloaded.name);
    }

    // Typed payloads parse back out of the reloaded container.
    let audio =
        AudioPayload::from_bytes(loaded.chunk_data(ChunkType::Audio).unwrap()).unwrap();
    assert_eq!(2, audio.nodes.len());
    assert_eq!(hash_name("frequency"), audio.parameters[0].name_hash);
    let font = FontPayload::from_bytes(loaded.chunk_data(ChunkType::Font).unwrap()).unwrap();
    assert_eq!(-1.5, font.kerning('A' as u32, 'V' as u32));
}

#[test]
fn overlay_pass_over_a_loaded_asset() {
    let bytes = save_to_vec(&build_asset());
    let mut asset = Taf::load(&mut Cursor::new(bytes)).unwrap();

    let mut overlay = Tafo::new();
    overlay.add_target_asset("fixtures/quad.taf", ">=1.0");
    overlay.add_shader_replacement(
        hash_name("data_driven_fragment_shader"),
        hash_name("tuned_fragment"),
        &spirv_stub(64),
    );
    overlay.add_subset_color_change(0, 2, [1.0, 0.0, 0.0, 1.0]);

    // Round-trip the overlay through its own file form first.
    let mut writer = Cursor::new(Vec::new());
    overlay.save(&mut writer).unwrap();
    let overlay = Tafo::load(&mut Cursor::new(writer.into_inner())).unwrap();

    overlay.apply(&mut asset).unwrap();

    let shaders =
        ShaderPayload::from_bytes(asset.chunk_data(ChunkType::Shader).unwrap()).unwrap();
    let index = shaders.index_by_hash(hash_name("tuned_fragment")).unwrap();
    assert_eq!(256, shaders.descriptors[index].spirv_size);

    // Colors of the first two vertices went red; float layout puts them 24
    // bytes into each 40-byte vertex.
    let geometry = asset.chunk_data(ChunkType::Geometry).unwrap();
    for vertex in 0..2usize {
        let offset = GEOMETRY_HEADER_SIZE + vertex * 40 + 24;
        let color: Vec<f32> = geometry[offset..offset + 16]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(vec![1.0, 0.0, 0.0, 1.0], color, "vertex {vertex}");
    }

    // The mutated asset saves and validates again.
    let resaved = save_to_vec(&asset);
    assert!(Taf::load(&mut Cursor::new(resaved)).is_ok());
}
