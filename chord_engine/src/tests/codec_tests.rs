//! Program codec coverage: loading, validation and hash verification.

use crate::graph::ProcessorNodeRef;
use crate::program::{Program, ProgramLoadError};
use crate::tests::utils::{ProgramBytes, add_constant_voice_program, int_constant_program};

#[test]
fn load_hash_roundtrip() {
    let bytes = int_constant_program(42);
    let program = Program::deserialize(&bytes).expect("program loads");

    let graph = program.graph();
    assert_eq!(graph.output_channels.len(), 1);

    // The single output channel resolves to the IntConstant's value
    let graph_output = graph.graph_output_node(graph.output_channels[0]);
    let connection = graph.input_node(graph_output.input).connection();
    let producer = graph.output_node(connection).processor();
    assert!(matches!(producer, ProcessorNodeRef::IntConstant(_)));
    assert_eq!(graph.int_constant_node(producer).value, 42);

    assert_eq!(program.variant_properties().output_channel_count, 1);
    assert_eq!(program.instrument_properties().max_voices, 1);
}

#[test]
fn reloaded_graph_is_isomorphic() {
    let bytes = add_constant_voice_program(2.0, 4);
    let program = Program::deserialize(&bytes).expect("program loads");
    let graph = program.graph();

    assert_eq!(graph.input_nodes.len(), 3);
    assert_eq!(graph.output_nodes.len(), 3);
    assert_eq!(graph.float_constant_nodes.len(), 1);
    assert_eq!(graph.native_module_call_nodes.len(), 1);
    assert_eq!(graph.graph_input_nodes.len(), 1);
    assert_eq!(graph.graph_output_nodes.len(), 1);

    // The module call consumes the graph input and the constant, in order
    let call = &graph.native_module_call_nodes[0];
    assert_eq!(call.inputs.len(), 2);
    assert_eq!(call.outputs.len(), 1);
    let first_producer = graph
        .output_node(graph.input_node(call.inputs[0]).connection())
        .processor();
    assert!(matches!(first_producer, ProcessorNodeRef::GraphInput(_)));
    let second_producer = graph
        .output_node(graph.input_node(call.inputs[1]).connection())
        .processor();
    assert_eq!(graph.float_constant_node(second_producer).value, 2.0);
}

#[test]
fn corrupted_payload_fails_hash_verification() {
    let mut bytes = int_constant_program(42);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    // The mutated byte corrupts the voice-graph node index before hashing
    // is even reached
    assert!(Program::deserialize(&bytes).is_err());

    let mut bytes = int_constant_program(42);
    // Corrupt the stored hash itself
    bytes[20] ^= 0x01;
    assert_eq!(
        Program::deserialize(&bytes),
        Err(ProgramLoadError::HashMismatch)
    );
}

#[test]
fn truncated_stream_fails() {
    let bytes = int_constant_program(42);
    for length in [0, 8, 40, bytes.len() - 1] {
        assert_eq!(
            Program::deserialize(&bytes[..length]),
            Err(ProgramLoadError::UnexpectedEndOfStream)
        );
    }
}

#[test]
fn bad_magic_and_version_fail() {
    let mut bytes = int_constant_program(42);
    bytes[0] = b'X';
    assert_eq!(Program::deserialize(&bytes), Err(ProgramLoadError::BadMagic));

    let mut bytes = int_constant_program(42);
    bytes[12] = 9;
    assert_eq!(
        Program::deserialize(&bytes),
        Err(ProgramLoadError::UnsupportedVersion(9))
    );
}

#[test]
fn trailing_bytes_fail() {
    let mut bytes = int_constant_program(42);
    bytes.push(0);
    assert_eq!(
        Program::deserialize(&bytes),
        Err(ProgramLoadError::TrailingBytes)
    );
}

#[test]
fn invalid_node_type_tag_fails() {
    // A single node with tag 11 (one past GraphOutput)
    let mut program = ProgramBytes::new();
    program.standard_header(0, 0, 1);
    program.u32(1).u8(11);
    assert_eq!(
        Program::deserialize(&program.finish()),
        Err(ProgramLoadError::InvalidNodeType(11))
    );
}

#[test]
fn bool_constant_value_out_of_range_fails() {
    // Nodes: Output, BoolConstant with value 2
    let mut program = ProgramBytes::new();
    program.standard_header(0, 0, 1);
    program.u32(2).u8(1).u8(5);
    program.u32(0); // Output: no connections
    program.u32(0).u8(2); // BoolConstant: output node 0, invalid value
    assert_eq!(
        Program::deserialize(&program.finish()),
        Err(ProgramLoadError::InvalidValue)
    );
}

#[test]
fn double_attachment_fails() {
    // Two IntConstants claiming the same Output node
    let mut program = ProgramBytes::new();
    program.standard_header(0, 0, 1);
    program.u32(3).u8(1).u8(4).u8(4);
    program.u32(0); // Output: no connections
    program.u32(0).i32(1); // IntConstant -> output 0
    program.u32(0).i32(2); // IntConstant -> output 0 again
    assert_eq!(
        Program::deserialize(&program.finish()),
        Err(ProgramLoadError::InvalidNodeReference)
    );
}

#[test]
fn unconnected_input_fails() {
    // An Input owned by a GraphOutput but connected to no Output
    let mut program = ProgramBytes::new();
    program.standard_header(0, 0, 1);
    program.u32(2).u8(0).u8(10);
    program.u32(0); // GraphOutput: input node 0
    assert_eq!(
        Program::deserialize(&program.finish()),
        Err(ProgramLoadError::InvalidNodeReference)
    );
}

#[test]
fn undeclared_native_library_fails() {
    // A NativeModuleCall with no dependency list entries
    let mut program = ProgramBytes::new();
    program.standard_header(0, 0, 1);
    program.u32(1).u8(8);
    program.raw(&[0x77; 16]);
    program.raw(&[0x78; 16]);
    program.u32(0).u32(0).i32(1);
    assert_eq!(
        Program::deserialize(&program.finish()),
        Err(ProgramLoadError::UndeclaredNativeLibrary)
    );
}
