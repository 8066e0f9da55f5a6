//! The program binary codec.
//!
//! A program is immutable after load. Deserialization validates every
//! structural invariant and verifies a salted SHA-256 content hash; any
//! violation fails the load and yields no partial graph.

use chord_native::PrimitiveType;
use chord_primitives::{Guid, SHA256_BYTE_COUNT, sha256};
use thiserror::Error;

use crate::graph::{
    ArrayNode, BoolConstantNode, DoubleConstantNode, FloatConstantNode, GraphInputNode,
    GraphOutputNode, InputNodeRef, IntConstantNode, NativeModuleCallNode, OutputNodeRef,
    ProcessorNodeRef, ProgramGraph, StringConstantNode,
};
use crate::reader::{BinaryReader, OutOfBounds};

pub const PROGRAM_HEADER_MAGIC: &[u8; 12] = b"CHORDPROGRAM";
pub const PROGRAM_VERSION: u32 = 0;

/// Appended to the payload before hashing.
pub const PROGRAM_HASH_SALT: [u8; 16] = [
    0x8b, 0xe1, 0x53, 0x2f, 0x41, 0x16, 0xc9, 0x8d, 0x1a, 0x2a, 0xb4, 0x3c, 0x0b, 0x34, 0xae, 0xdf,
];

const HEADER_BYTE_COUNT: usize = PROGRAM_HEADER_MAGIC.len() + 4 + SHA256_BYTE_COUNT;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ProgramLoadError {
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,
    #[error("bad header magic")]
    BadMagic,
    #[error("unsupported program version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid program property")]
    InvalidProperty,
    #[error("invalid node type tag {0}")]
    InvalidNodeType(u8),
    #[error("invalid node reference")]
    InvalidNodeReference,
    #[error("invalid node value")]
    InvalidValue,
    #[error("native module call references an undeclared native library")]
    UndeclaredNativeLibrary,
    #[error("program payload has trailing bytes")]
    TrailingBytes,
    #[error("content hash mismatch")]
    HashMismatch,
}

impl From<OutOfBounds> for ProgramLoadError {
    fn from(_: OutOfBounds) -> Self {
        Self::UnexpectedEndOfStream
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProgramVariantProperties {
    pub sample_rate: i32,
    pub input_channel_count: i32,
    pub output_channel_count: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum EffectActivationMode {
    /// The effect stage is always active.
    Always = 0,
    /// The effect stage activates when a voice is live or an input sample's
    /// magnitude exceeds the activation threshold.
    Threshold = 1,
}

impl EffectActivationMode {
    const COUNT: u32 = 2;
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct InstrumentProperties {
    pub max_voices: u32,
    pub effect_activation_mode: EffectActivationMode,
    pub effect_activation_threshold: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NativeLibraryDependency {
    pub id: Guid,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
}

/// Serialized node type tags, in wire order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum SerializedNodeType {
    Input = 0,
    Output = 1,
    FloatConstant = 2,
    DoubleConstant = 3,
    IntConstant = 4,
    BoolConstant = 5,
    StringConstant = 6,
    Array = 7,
    NativeModuleCall = 8,
    GraphInput = 9,
    GraphOutput = 10,
}

impl SerializedNodeType {
    const COUNT: usize = 11;

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Input),
            1 => Some(Self::Output),
            2 => Some(Self::FloatConstant),
            3 => Some(Self::DoubleConstant),
            4 => Some(Self::IntConstant),
            5 => Some(Self::BoolConstant),
            6 => Some(Self::StringConstant),
            7 => Some(Self::Array),
            8 => Some(Self::NativeModuleCall),
            9 => Some(Self::GraphInput),
            10 => Some(Self::GraphOutput),
            _ => None,
        }
    }
}

/// Pre-resolved location of a serialized node: its type plus its index in
/// the per-type pool. Computed from the node-type list alone, so references
/// resolve before the referenced node is materialized.
#[derive(Clone, Copy)]
enum NodeSlot {
    Input(u32),
    Output(u32),
    Processor(ProcessorNodeRef),
}

#[derive(Debug, PartialEq)]
pub struct Program {
    variant_properties: ProgramVariantProperties,
    instrument_properties: InstrumentProperties,
    native_library_dependencies: Vec<NativeLibraryDependency>,
    graph: ProgramGraph,
}

impl Program {
    pub fn variant_properties(&self) -> &ProgramVariantProperties {
        &self.variant_properties
    }

    pub fn instrument_properties(&self) -> &InstrumentProperties {
        &self.instrument_properties
    }

    pub fn native_library_dependencies(&self) -> &[NativeLibraryDependency] {
        &self.native_library_dependencies
    }

    pub fn graph(&self) -> &ProgramGraph {
        &self.graph
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, ProgramLoadError> {
        let mut reader = BinaryReader::new(bytes);

        let magic = reader.read_bytes(PROGRAM_HEADER_MAGIC.len())?;
        if magic != PROGRAM_HEADER_MAGIC {
            return Err(ProgramLoadError::BadMagic);
        }
        let version = reader.read_u32()?;
        if version != PROGRAM_VERSION {
            return Err(ProgramLoadError::UnsupportedVersion(version));
        }
        let content_hash: [u8; SHA256_BYTE_COUNT] = reader
            .read_bytes(SHA256_BYTE_COUNT)?
            .try_into()
            .expect("read SHA256_BYTE_COUNT bytes");

        let native_library_dependency_count = reader.read_u32()?;
        let mut native_library_dependencies =
            Vec::with_capacity(native_library_dependency_count.min(1024) as usize);
        for _ in 0..native_library_dependency_count {
            let id_bytes: [u8; Guid::BYTE_COUNT] = reader
                .read_bytes(Guid::BYTE_COUNT)?
                .try_into()
                .expect("read Guid::BYTE_COUNT bytes");
            native_library_dependencies.push(NativeLibraryDependency {
                id: Guid::from_bytes(id_bytes),
                major_version: reader.read_u32()?,
                minor_version: reader.read_u32()?,
                patch_version: reader.read_u32()?,
            });
        }

        let variant_properties = ProgramVariantProperties {
            sample_rate: reader.read_i32()?,
            input_channel_count: reader.read_i32()?,
            output_channel_count: reader.read_i32()?,
        };
        if variant_properties.sample_rate < 0
            || variant_properties.input_channel_count < 0
            || variant_properties.output_channel_count < 0
        {
            return Err(ProgramLoadError::InvalidProperty);
        }

        let max_voices = reader.read_i32()?;
        let effect_activation_mode = reader.read_u32()?;
        let effect_activation_threshold = reader.read_f64()?;
        if max_voices < 0
            || effect_activation_mode >= EffectActivationMode::COUNT
            || !(effect_activation_threshold >= 0.0)
        {
            return Err(ProgramLoadError::InvalidProperty);
        }
        let instrument_properties = InstrumentProperties {
            max_voices: max_voices as u32,
            effect_activation_mode: if effect_activation_mode == 0 {
                EffectActivationMode::Always
            } else {
                EffectActivationMode::Threshold
            },
            effect_activation_threshold,
        };

        let node_count = reader.read_u32()?;

        // First pass: read node types and count nodes per type
        let mut node_types = Vec::with_capacity(node_count.min(65_536) as usize);
        let mut node_counts = [0u32; SerializedNodeType::COUNT];
        for _ in 0..node_count {
            let tag = reader.read_u8()?;
            let node_type =
                SerializedNodeType::from_tag(tag).ok_or(ProgramLoadError::InvalidNodeType(tag))?;
            node_types.push(node_type);
            node_counts[node_type as usize] += 1;
        }

        // Pre-resolve every node reference: with per-type counts known, each
        // global index maps to a typed slot before any node is filled in
        let mut node_slots = Vec::with_capacity(node_types.len());
        let mut next_type_indices = [0u32; SerializedNodeType::COUNT];
        for &node_type in &node_types {
            let type_index = next_type_indices[node_type as usize];
            next_type_indices[node_type as usize] += 1;
            node_slots.push(match node_type {
                SerializedNodeType::Input => NodeSlot::Input(type_index),
                SerializedNodeType::Output => NodeSlot::Output(type_index),
                SerializedNodeType::FloatConstant => {
                    NodeSlot::Processor(ProcessorNodeRef::FloatConstant(type_index))
                }
                SerializedNodeType::DoubleConstant => {
                    NodeSlot::Processor(ProcessorNodeRef::DoubleConstant(type_index))
                }
                SerializedNodeType::IntConstant => {
                    NodeSlot::Processor(ProcessorNodeRef::IntConstant(type_index))
                }
                SerializedNodeType::BoolConstant => {
                    NodeSlot::Processor(ProcessorNodeRef::BoolConstant(type_index))
                }
                SerializedNodeType::StringConstant => {
                    NodeSlot::Processor(ProcessorNodeRef::StringConstant(type_index))
                }
                SerializedNodeType::Array => {
                    NodeSlot::Processor(ProcessorNodeRef::Array(type_index))
                }
                SerializedNodeType::NativeModuleCall => {
                    NodeSlot::Processor(ProcessorNodeRef::NativeModuleCall(type_index))
                }
                SerializedNodeType::GraphInput => {
                    NodeSlot::Processor(ProcessorNodeRef::GraphInput(type_index))
                }
                SerializedNodeType::GraphOutput => {
                    NodeSlot::Processor(ProcessorNodeRef::GraphOutput(type_index))
                }
            });
        }

        let mut graph = ProgramGraph::default();
        graph
            .input_nodes
            .resize_with(node_counts[SerializedNodeType::Input as usize] as usize, Default::default);
        graph
            .output_nodes
            .resize_with(node_counts[SerializedNodeType::Output as usize] as usize, Default::default);

        let resolve_processor = |index: u32| -> Result<ProcessorNodeRef, ProgramLoadError> {
            match node_slots.get(index as usize) {
                Some(NodeSlot::Processor(processor)) => Ok(*processor),
                _ => Err(ProgramLoadError::InvalidNodeReference),
            }
        };

        // Second pass: fill per-node payloads
        for node_index in 0..node_types.len() {
            match node_types[node_index] {
                SerializedNodeType::Input => {}
                SerializedNodeType::Output => {
                    let NodeSlot::Output(output_index) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let connection_count = reader.read_u32()?;
                    let mut connections = Vec::with_capacity(connection_count.min(65_536) as usize);
                    for _ in 0..connection_count {
                        let input_node_index = reader.read_u32()?;
                        let input_ref =
                            connect_input(&mut graph, &node_slots, input_node_index, output_index)?;
                        connections.push(input_ref);
                    }
                    graph.output_nodes[output_index as usize].connections = connections;
                }
                SerializedNodeType::FloatConstant => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let output_node_index = reader.read_u32()?;
                    let value = reader.read_f32()?;
                    let output = attach_output(&mut graph, &node_slots, output_node_index, processor)?;
                    graph.float_constant_nodes.push(FloatConstantNode { value, output });
                }
                SerializedNodeType::DoubleConstant => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let output_node_index = reader.read_u32()?;
                    let value = reader.read_f64()?;
                    let output = attach_output(&mut graph, &node_slots, output_node_index, processor)?;
                    graph.double_constant_nodes.push(DoubleConstantNode { value, output });
                }
                SerializedNodeType::IntConstant => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let output_node_index = reader.read_u32()?;
                    let value = reader.read_i32()?;
                    let output = attach_output(&mut graph, &node_slots, output_node_index, processor)?;
                    graph.int_constant_nodes.push(IntConstantNode { value, output });
                }
                SerializedNodeType::BoolConstant => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let output_node_index = reader.read_u32()?;
                    let value = reader.read_u8()?;
                    if value > 1 {
                        return Err(ProgramLoadError::InvalidValue);
                    }
                    let output = attach_output(&mut graph, &node_slots, output_node_index, processor)?;
                    graph.bool_constant_nodes.push(BoolConstantNode {
                        value: value != 0,
                        output,
                    });
                }
                SerializedNodeType::StringConstant => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let output_node_index = reader.read_u32()?;
                    let length = reader.read_u32()?;
                    let mut value = Vec::with_capacity(length.min(65_536) as usize);
                    for _ in 0..length {
                        value.push(reader.read_u32()?);
                    }
                    let output = attach_output(&mut graph, &node_slots, output_node_index, processor)?;
                    graph.string_constant_nodes.push(StringConstantNode { value, output });
                }
                SerializedNodeType::Array => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let element_count = reader.read_u32()?;
                    let mut elements = Vec::with_capacity(element_count.min(65_536) as usize);
                    for _ in 0..element_count {
                        let element_node_index = reader.read_u32()?;
                        elements.push(attach_input(
                            &mut graph,
                            &node_slots,
                            element_node_index,
                            processor,
                        )?);
                    }
                    let output_node_index = reader.read_u32()?;
                    let output = attach_output(&mut graph, &node_slots, output_node_index, processor)?;
                    graph.array_nodes.push(ArrayNode { elements, output });
                }
                SerializedNodeType::NativeModuleCall => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let library_id_bytes: [u8; Guid::BYTE_COUNT] = reader
                        .read_bytes(Guid::BYTE_COUNT)?
                        .try_into()
                        .expect("read Guid::BYTE_COUNT bytes");
                    let module_id_bytes: [u8; Guid::BYTE_COUNT] = reader
                        .read_bytes(Guid::BYTE_COUNT)?
                        .try_into()
                        .expect("read Guid::BYTE_COUNT bytes");
                    let input_count = reader.read_u32()?;
                    let output_count = reader.read_u32()?;
                    let upsample_factor = reader.read_i32()?;
                    if upsample_factor <= 0 {
                        return Err(ProgramLoadError::InvalidValue);
                    }

                    let native_library_id = Guid::from_bytes(library_id_bytes);
                    if !native_library_dependencies
                        .iter()
                        .any(|dependency| dependency.id == native_library_id)
                    {
                        return Err(ProgramLoadError::UndeclaredNativeLibrary);
                    }

                    let mut inputs = Vec::with_capacity(input_count.min(65_536) as usize);
                    for _ in 0..input_count {
                        let input_node_index = reader.read_u32()?;
                        inputs.push(attach_input(&mut graph, &node_slots, input_node_index, processor)?);
                    }
                    let mut outputs = Vec::with_capacity(output_count.min(65_536) as usize);
                    for _ in 0..output_count {
                        let output_node_index = reader.read_u32()?;
                        outputs.push(attach_output(
                            &mut graph,
                            &node_slots,
                            output_node_index,
                            processor,
                        )?);
                    }

                    graph.native_module_call_nodes.push(NativeModuleCallNode {
                        native_library_id,
                        native_module_id: Guid::from_bytes(module_id_bytes),
                        upsample_factor,
                        inputs,
                        outputs,
                    });
                }
                SerializedNodeType::GraphInput => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let output_node_index = reader.read_u32()?;
                    let output = attach_output(&mut graph, &node_slots, output_node_index, processor)?;
                    graph.graph_input_nodes.push(GraphInputNode { output });
                }
                SerializedNodeType::GraphOutput => {
                    let NodeSlot::Processor(processor) = node_slots[node_index] else {
                        unreachable!();
                    };
                    let input_node_index = reader.read_u32()?;
                    let input = attach_input(&mut graph, &node_slots, input_node_index, processor)?;
                    graph.graph_output_nodes.push(GraphOutputNode { input });
                }
            }
        }

        // Every Input must be owned and connected; every Output must be owned
        if graph
            .input_nodes
            .iter()
            .any(|node| node.processor.is_none() || node.connection.is_none())
            || graph.output_nodes.iter().any(|node| node.processor.is_none())
        {
            return Err(ProgramLoadError::InvalidNodeReference);
        }

        // Channel and voice-to-effect tables
        let input_channel_count = variant_properties.input_channel_count as usize;
        let output_channel_count = variant_properties.output_channel_count as usize;

        if read_present_flag(&mut reader)? {
            let mut channels = Vec::with_capacity(input_channel_count);
            for _ in 0..input_channel_count {
                let node_index = reader.read_u32()?;
                let node = resolve_processor(node_index)?;
                if !matches!(node, ProcessorNodeRef::GraphInput(_)) {
                    return Err(ProgramLoadError::InvalidNodeReference);
                }
                channels.push(node);
            }
            graph.input_channels_float = Some(channels);
        }

        if read_present_flag(&mut reader)? {
            let mut channels = Vec::with_capacity(input_channel_count);
            for _ in 0..input_channel_count {
                let node_index = reader.read_u32()?;
                let node = resolve_processor(node_index)?;
                if !matches!(node, ProcessorNodeRef::GraphInput(_)) {
                    return Err(ProgramLoadError::InvalidNodeReference);
                }
                channels.push(node);
            }
            graph.input_channels_double = Some(channels);
        }

        let mut output_channels = Vec::with_capacity(output_channel_count);
        for _ in 0..output_channel_count {
            let node_index = reader.read_u32()?;
            let node = resolve_processor(node_index)?;
            if !matches!(node, ProcessorNodeRef::GraphOutput(_)) {
                return Err(ProgramLoadError::InvalidNodeReference);
            }
            output_channels.push(node);
        }
        graph.output_channels = output_channels;

        if read_present_flag(&mut reader)? {
            let node_index = reader.read_u32()?;
            let node = resolve_processor(node_index)?;
            if !matches!(node, ProcessorNodeRef::GraphOutput(_)) {
                return Err(ProgramLoadError::InvalidNodeReference);
            }
            graph.voice_remain_active = Some(node);
        }

        if read_present_flag(&mut reader)? {
            let node_index = reader.read_u32()?;
            let node = resolve_processor(node_index)?;
            if !matches!(node, ProcessorNodeRef::GraphOutput(_)) {
                return Err(ProgramLoadError::InvalidNodeReference);
            }
            graph.effect_remain_active = Some(node);
        }

        let voice_to_effect_count = reader.read_u32()?;
        let mut voice_to_effect_primitive_types =
            Vec::with_capacity(voice_to_effect_count.min(65_536) as usize);
        for _ in 0..voice_to_effect_count {
            let tag = reader.read_u8()?;
            let primitive_type =
                PrimitiveType::from_tag(tag).ok_or(ProgramLoadError::InvalidValue)?;
            if primitive_type == PrimitiveType::String {
                return Err(ProgramLoadError::InvalidValue);
            }
            voice_to_effect_primitive_types.push(primitive_type);
        }
        graph.voice_to_effect_primitive_types = voice_to_effect_primitive_types;

        let mut voice_to_effect_outputs = Vec::with_capacity(voice_to_effect_count.min(65_536) as usize);
        for _ in 0..voice_to_effect_count {
            let node_index = reader.read_u32()?;
            let node = resolve_processor(node_index)?;
            if !matches!(node, ProcessorNodeRef::GraphOutput(_)) {
                return Err(ProgramLoadError::InvalidNodeReference);
            }
            voice_to_effect_outputs.push(node);
        }
        graph.voice_to_effect_outputs = voice_to_effect_outputs;

        let mut voice_to_effect_inputs = Vec::with_capacity(voice_to_effect_count.min(65_536) as usize);
        for _ in 0..voice_to_effect_count {
            let node_index = reader.read_u32()?;
            let node = resolve_processor(node_index)?;
            if !matches!(node, ProcessorNodeRef::GraphInput(_)) {
                return Err(ProgramLoadError::InvalidNodeReference);
            }
            voice_to_effect_inputs.push(node);
        }
        graph.voice_to_effect_inputs = voice_to_effect_inputs;

        if read_present_flag(&mut reader)? {
            let voice_graph_count = reader.read_u32()?;
            let mut voice_graph = Vec::with_capacity(voice_graph_count.min(65_536) as usize);
            for _ in 0..voice_graph_count {
                let node_index = reader.read_u32()?;
                voice_graph.push(resolve_processor(node_index)?);
            }
            graph.voice_graph = Some(voice_graph);
        }

        if read_present_flag(&mut reader)? {
            let effect_graph_count = reader.read_u32()?;
            let mut effect_graph = Vec::with_capacity(effect_graph_count.min(65_536) as usize);
            for _ in 0..effect_graph_count {
                let node_index = reader.read_u32()?;
                effect_graph.push(resolve_processor(node_index)?);
            }
            graph.effect_graph = Some(effect_graph);
        }

        if !reader.is_at_end() {
            return Err(ProgramLoadError::TrailingBytes);
        }

        // Verify the content hash over payload-plus-salt
        let payload = &bytes[HEADER_BYTE_COUNT..];
        let mut hash_input = Vec::with_capacity(payload.len() + PROGRAM_HASH_SALT.len());
        hash_input.extend_from_slice(payload);
        hash_input.extend_from_slice(&PROGRAM_HASH_SALT);
        if sha256(&hash_input) != content_hash {
            return Err(ProgramLoadError::HashMismatch);
        }

        Ok(Self {
            variant_properties,
            instrument_properties,
            native_library_dependencies,
            graph,
        })
    }
}

fn read_present_flag(reader: &mut BinaryReader) -> Result<bool, ProgramLoadError> {
    let flag = reader.read_u8()?;
    if flag > 1 {
        return Err(ProgramLoadError::InvalidValue);
    }
    Ok(flag != 0)
}

/// Claims the Input node at global index `input_node_index` for `processor`.
/// Fails if the index is not an unclaimed Input node.
fn attach_input(
    graph: &mut ProgramGraph,
    node_slots: &[NodeSlot],
    input_node_index: u32,
    processor: ProcessorNodeRef,
) -> Result<InputNodeRef, ProgramLoadError> {
    let Some(NodeSlot::Input(input_index)) = node_slots.get(input_node_index as usize) else {
        return Err(ProgramLoadError::InvalidNodeReference);
    };
    let input_node = &mut graph.input_nodes[*input_index as usize];
    if input_node.processor.is_some() {
        return Err(ProgramLoadError::InvalidNodeReference);
    }
    input_node.processor = Some(processor);
    Ok(InputNodeRef(*input_index))
}

/// Claims the Output node at global index `output_node_index` for `processor`.
fn attach_output(
    graph: &mut ProgramGraph,
    node_slots: &[NodeSlot],
    output_node_index: u32,
    processor: ProcessorNodeRef,
) -> Result<OutputNodeRef, ProgramLoadError> {
    let Some(NodeSlot::Output(output_index)) = node_slots.get(output_node_index as usize) else {
        return Err(ProgramLoadError::InvalidNodeReference);
    };
    let output_node = &mut graph.output_nodes[*output_index as usize];
    if output_node.processor.is_some() {
        return Err(ProgramLoadError::InvalidNodeReference);
    }
    output_node.processor = Some(processor);
    Ok(OutputNodeRef(*output_index))
}

/// Connects the Input node at global index `input_node_index` to the Output
/// node at pool index `output_index`. Fails if the input is already
/// connected.
fn connect_input(
    graph: &mut ProgramGraph,
    node_slots: &[NodeSlot],
    input_node_index: u32,
    output_index: u32,
) -> Result<InputNodeRef, ProgramLoadError> {
    let Some(NodeSlot::Input(input_index)) = node_slots.get(input_node_index as usize) else {
        return Err(ProgramLoadError::InvalidNodeReference);
    };
    let input_node = &mut graph.input_nodes[*input_index as usize];
    if input_node.connection.is_some() {
        return Err(ProgramLoadError::InvalidNodeReference);
    }
    input_node.connection = Some(OutputNodeRef(output_index));
    Ok(InputNodeRef(*input_index))
}
