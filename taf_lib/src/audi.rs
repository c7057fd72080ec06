//! Node-graph audio payloads: typed DSP nodes, connections, parameter
//! blocks, embedded wavetables, and streaming descriptors.
//!
//! The payload is assembled by [AudioGraphBuilder], which emits sections in
//! a fixed order after the header: nodes, connections, parameters,
//! wavetable descriptors + sample bytes, streaming descriptors + audio
//! bytes. Descriptor offsets are relative to the start of the payload and
//! are computed at emission time. Evaluation of the graph is the consumer's
//! concern.
use std::io::{Cursor, Seek, Write};

use binrw::{BinRead, BinResult, BinWrite};
use thiserror::Error;

use crate::hash::hash_name;

/// Size of [AudioHeader] on disk in bytes.
pub const AUDIO_HEADER_SIZE: usize = 40;
/// Size of a [Node] on disk in bytes.
pub const NODE_SIZE: usize = 40;
/// Size of a [Connection] on disk in bytes.
pub const CONNECTION_SIZE: usize = 20;
/// Size of a [Parameter] on disk in bytes.
pub const PARAMETER_SIZE: usize = 28;
/// Size of a [Wavetable] descriptor on disk in bytes.
pub const WAVETABLE_SIZE: usize = 48;
/// Size of a [StreamingAudio] descriptor on disk in bytes.
pub const STREAMING_SIZE: usize = 52;

/// Node type tags. The numeric values are part of the format.
#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u32))]
pub enum NodeType {
    // Generators.
    Oscillator = 0,
    WaveTablePlayer = 1,
    NoiseGenerator = 2,
    Sampler = 3,
    StreamingSampler = 4,
    // Processors.
    Filter = 10,
    Amplifier = 11,
    Envelope = 12,
    Lfo = 13,
    Delay = 14,
    Reverb = 15,
    Distortion = 16,
    Compressor = 17,
    // Utility.
    Mixer = 20,
    Splitter = 21,
    Math = 22,
    // Game-aware inputs.
    GameState = 30,
    Proximity = 31,
    CombatIntensity = 32,
    // Control.
    PatternPlayer = 40,
    Parameter = 41,
    Random = 42,
    // Custom.
    VmNode = 100,
}

#[derive(Debug, BinRead, BinWrite, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u32))]
pub enum StreamingFormat {
    Pcm = 0,
    Float = 1,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct AudioHeader {
    pub node_count: u32,
    pub connection_count: u32,
    pub pattern_count: u32,
    /// Number of wavetable descriptors.
    pub sample_count: u32,
    pub parameter_count: u32,
    pub sample_rate: u32,
    /// Pattern ticks per second.
    pub tick_rate: f32,
    pub streaming_count: u32,
    pub reserved: [u32; 2],
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct Node {
    /// Unique within the graph; the id connections reference.
    pub id: u32,
    pub node_type: NodeType,
    pub name_hash: u64,
    /// Editor position, ignored at runtime.
    pub position: [f32; 2],
    pub input_count: u32,
    pub output_count: u32,
    /// Window into the flat parameter array.
    pub param_offset: u32,
    pub param_count: u32,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct Connection {
    pub source_node: u32,
    pub source_output: u32,
    pub dest_node: u32,
    pub dest_input: u32,
    /// Edge gain in [0, 1]. Zero marks an edge that is present but gated
    /// off, used for parameter connections latched at load.
    pub strength: f32,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct Parameter {
    pub name_hash: u64,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    /// Response curve exponent: 1.0 linear, 2.0 exponential.
    pub curve: f32,
    pub flags: u32,
}

impl Parameter {
    /// Maps a normalized input through the response curve.
    pub fn map_normalized(&self, x: f32) -> f32 {
        self.min + (self.max - self.min) * x.powf(self.curve)
    }
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct Wavetable {
    pub name_hash: u64,
    /// Total stored sample values, across channels.
    pub sample_count: u32,
    pub channel_count: u32,
    /// Bits per stored sample: 8, 16, 24, or 32.
    pub bit_depth: u32,
    /// Byte offset of the sample data from the start of the audio payload.
    pub data_offset: u64,
    pub data_size: u64,
    pub base_frequency: f32,
    pub loop_start: u32,
    pub loop_end: u32,
}

#[derive(Debug, BinRead, BinWrite, Clone, PartialEq)]
pub struct StreamingAudio {
    pub name_hash: u64,
    pub sample_rate: u32,
    pub channel_count: u32,
    pub bit_depth: u32,
    /// Total frames per channel.
    pub total_samples: u64,
    /// Frames per streaming chunk.
    pub samples_per_chunk: u32,
    pub chunk_count: u32,
    /// Byte offset of the first chunk from the start of the audio payload.
    pub data_offset: u64,
    pub format: StreamingFormat,
    pub reserved: u32,
}

impl StreamingAudio {
    /// Bytes covered by one streaming chunk.
    pub fn chunk_stride(&self) -> u64 {
        self.samples_per_chunk as u64 * (self.bit_depth as u64 / 8) * self.channel_count as u64
    }
}

/// A parsed audio chunk payload.
///
/// Wavetable and streaming bytes stay in the raw payload; slice them out
/// with [wavetable_data](Self::wavetable_data) against the same buffer the
/// payload was parsed from.
#[derive(Debug, BinRead, Clone, PartialEq)]
pub struct AudioPayload {
    pub header: AudioHeader,
    #[br(count = header.node_count)]
    pub nodes: Vec<Node>,
    #[br(count = header.connection_count)]
    pub connections: Vec<Connection>,
    #[br(count = header.parameter_count)]
    pub parameters: Vec<Parameter>,
    #[br(count = header.sample_count)]
    pub wavetables: Vec<Wavetable>,
    #[br(count = header.streaming_count)]
    pub streams: Vec<StreamingAudio>,
}

impl AudioPayload {
    /// The parameter window of `node`.
    pub fn node_parameters(&self, node: &Node) -> &[Parameter] {
        let start = node.param_offset as usize;
        &self.parameters[start..start + node.param_count as usize]
    }

    /// The sample bytes of `wavetable` within the raw payload buffer.
    pub fn wavetable_data<'a>(&self, wavetable: &Wavetable, payload: &'a [u8]) -> Option<&'a [u8]> {
        let start = wavetable.data_offset as usize;
        payload.get(start..start + wavetable.data_size as usize)
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no node with id {0}")]
    UnknownNode(u32),

    #[error("output {output} out of range for node {node} with {count} outputs")]
    OutputOutOfRange { node: u32, output: u32, count: u32 },

    #[error("input {input} out of range for node {node} with {count} inputs")]
    InputOutOfRange { node: u32, input: u32, count: u32 },
}

/// Assembles an audio payload: nodes, connections, parameters, and embedded
/// sample data.
#[derive(Debug, Default)]
pub struct AudioGraphBuilder {
    sample_rate: u32,
    tick_rate: f32,
    nodes: Vec<Node>,
    /// Parameters per node, flattened into disjoint windows at build time.
    node_params: Vec<Vec<Parameter>>,
    connections: Vec<Connection>,
    wavetables: Vec<(Wavetable, Vec<u8>)>,
    streams: Vec<(StreamingAudio, Vec<u8>)>,
}

impl AudioGraphBuilder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            tick_rate: 60.0,
            ..Default::default()
        }
    }

    pub fn set_tick_rate(&mut self, ticks_per_second: f32) {
        self.tick_rate = ticks_per_second;
    }

    /// Adds a node and returns its id.
    pub fn add_node(
        &mut self,
        node_type: NodeType,
        name: &str,
        position: [f32; 2],
        input_count: u32,
        output_count: u32,
    ) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            id,
            node_type,
            name_hash: hash_name(name),
            position,
            input_count,
            output_count,
            param_offset: 0,
            param_count: 0,
        });
        self.node_params.push(Vec::new());
        id
    }

    pub fn add_parameter(
        &mut self,
        node: u32,
        name: &str,
        default: f32,
        min: f32,
        max: f32,
        curve: f32,
        flags: u32,
    ) -> Result<(), GraphError> {
        let params = self
            .node_params
            .get_mut(node as usize)
            .ok_or(GraphError::UnknownNode(node))?;
        params.push(Parameter {
            name_hash: hash_name(name),
            default,
            min,
            max,
            curve,
            flags,
        });
        Ok(())
    }

    /// Connects `source`'s output to `dest`'s input. Strength is clamped to
    /// [0, 1]; zero keeps the edge but gates it off.
    pub fn connect(
        &mut self,
        source: u32,
        output: u32,
        dest: u32,
        input: u32,
        strength: f32,
    ) -> Result<(), GraphError> {
        let source_node = self
            .nodes
            .get(source as usize)
            .ok_or(GraphError::UnknownNode(source))?;
        if output >= source_node.output_count {
            return Err(GraphError::OutputOutOfRange {
                node: source,
                output,
                count: source_node.output_count,
            });
        }
        let dest_node = self
            .nodes
            .get(dest as usize)
            .ok_or(GraphError::UnknownNode(dest))?;
        if input >= dest_node.input_count {
            return Err(GraphError::InputOutOfRange {
                node: dest,
                input,
                count: dest_node.input_count,
            });
        }
        self.connections.push(Connection {
            source_node: source,
            source_output: output,
            dest_node: dest,
            dest_input: input,
            strength: strength.clamp(0.0, 1.0),
        });
        Ok(())
    }

    /// Embeds a wavetable, converting float samples to 16-bit signed
    /// storage: clamp to [-1, 1], scale by 32767, truncate.
    pub fn add_wavetable(
        &mut self,
        name: &str,
        samples: &[f32],
        channel_count: u32,
        base_frequency: f32,
        loop_start: u32,
        loop_end: u32,
    ) {
        let bytes: Vec<u8> = samples
            .iter()
            .flat_map(|s| (((s.clamp(-1.0, 1.0)) * 32767.0) as i16).to_le_bytes())
            .collect();
        self.wavetables.push((
            Wavetable {
                name_hash: hash_name(name),
                sample_count: samples.len() as u32,
                channel_count,
                bit_depth: 16,
                data_offset: 0,
                data_size: bytes.len() as u64,
                base_frequency,
                loop_start,
                loop_end,
            },
            bytes,
        ));
    }

    /// Embeds pre-encoded streaming audio split into fixed-size chunks.
    pub fn add_streaming(
        &mut self,
        name: &str,
        sample_rate: u32,
        channel_count: u32,
        bit_depth: u32,
        samples_per_chunk: u32,
        format: StreamingFormat,
        data: Vec<u8>,
    ) {
        let bytes_per_frame = (bit_depth as u64 / 8) * channel_count as u64;
        let total_samples = if bytes_per_frame == 0 {
            0
        } else {
            data.len() as u64 / bytes_per_frame
        };
        let chunk_count = if samples_per_chunk == 0 {
            0
        } else {
            total_samples.div_ceil(samples_per_chunk as u64) as u32
        };
        self.streams.push((
            StreamingAudio {
                name_hash: hash_name(name),
                sample_rate,
                channel_count,
                bit_depth,
                total_samples,
                samples_per_chunk,
                chunk_count,
                data_offset: 0,
                format,
                reserved: 0,
            },
            data,
        ));
    }

    /// Emits the payload bytes. Parameter windows and data offsets are
    /// resolved here, with full knowledge of preceding section sizes.
    pub fn build(&self) -> BinResult<Vec<u8>> {
        let mut nodes = self.nodes.clone();
        let mut parameters = Vec::new();
        for (node, params) in nodes.iter_mut().zip(&self.node_params) {
            node.param_offset = parameters.len() as u32;
            node.param_count = params.len() as u32;
            parameters.extend(params.iter().cloned());
        }

        let wavetable_desc_start = AUDIO_HEADER_SIZE
            + nodes.len() * NODE_SIZE
            + self.connections.len() * CONNECTION_SIZE
            + parameters.len() * PARAMETER_SIZE;
        let wavetable_data_start = wavetable_desc_start + self.wavetables.len() * WAVETABLE_SIZE;

        let mut wavetables = Vec::with_capacity(self.wavetables.len());
        let mut offset = wavetable_data_start as u64;
        for (descriptor, bytes) in &self.wavetables {
            let mut descriptor = descriptor.clone();
            descriptor.data_offset = offset;
            offset += bytes.len() as u64;
            wavetables.push(descriptor);
        }

        let streaming_desc_start = offset as usize;
        let mut streams = Vec::with_capacity(self.streams.len());
        offset += (self.streams.len() * STREAMING_SIZE) as u64;
        for (descriptor, bytes) in &self.streams {
            let mut descriptor = descriptor.clone();
            descriptor.data_offset = offset;
            offset += bytes.len() as u64;
            streams.push(descriptor);
        }
        debug_assert_eq!(
            streaming_desc_start,
            wavetable_data_start
                + self
                    .wavetables
                    .iter()
                    .map(|(_, b)| b.len())
                    .sum::<usize>()
        );

        let header = AudioHeader {
            node_count: nodes.len() as u32,
            connection_count: self.connections.len() as u32,
            pattern_count: 0,
            sample_count: wavetables.len() as u32,
            parameter_count: parameters.len() as u32,
            sample_rate: self.sample_rate,
            tick_rate: self.tick_rate,
            streaming_count: streams.len() as u32,
            reserved: [0; 2],
        };

        let mut writer = Cursor::new(Vec::new());
        header.write_le(&mut writer)?;
        write_section(&mut writer, &nodes)?;
        write_section(&mut writer, &self.connections)?;
        write_section(&mut writer, &parameters)?;
        write_section(&mut writer, &wavetables)?;
        for (_, bytes) in &self.wavetables {
            writer.write_all(bytes)?;
        }
        write_section(&mut writer, &streams)?;
        for (_, bytes) in &self.streams {
            writer.write_all(bytes)?;
        }
        Ok(writer.into_inner())
    }
}

fn write_section<W, T>(writer: &mut W, items: &[T]) -> BinResult<()>
where
    W: Write + Seek,
    for<'a> T: BinWrite<Args<'a> = ()>,
{
    for item in items {
        item.write_le(writer)?;
    }
    Ok(())
}
