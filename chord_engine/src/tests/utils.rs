//! Shared fixtures: an in-process native library and program serializers.

use std::ffi::c_void;

use chord_native::{
    DataType, MemoryRequirement, ModuleParameterDirection, NativeLibrary, NativeLibraryVersion,
    NativeModule, NativeModuleArguments, NativeModuleContext, NativeModuleParameter,
    NativeModuleSignature, PrimitiveType, RuntimeMutability,
};
use chord_primitives::sha256;

use crate::program::{PROGRAM_HASH_SALT, PROGRAM_HEADER_MAGIC, PROGRAM_VERSION};

pub const TEST_LIBRARY_ID: [u8; 16] = [0xaa; 16];
pub const ADD_CONSTANT_MODULE_ID: [u8; 16] = [0x01; 16];

const INPUT_NAME: &[u32] = &['i' as u32, 'n' as u32, 0];
const AMOUNT_NAME: &[u32] = &['a' as u32, 'm' as u32, 't' as u32, 0];
const RESULT_NAME: &[u32] = &['o' as u32, 'u' as u32, 't' as u32, 0];
const MODULE_NAME: &[u32] = &['a' as u32, 'd' as u32, 'd' as u32, 0];
const LIBRARY_NAME: &[u32] = &['t' as u32, 'e' as u32, 's' as u32, 't' as u32, 0];

/// result[i] = in[i] + amount, preserving the input's constant state.
unsafe extern "C" fn add_constant_invoke(
    _context: *const NativeModuleContext,
    arguments: *const NativeModuleArguments,
    _scratch_memory: *mut u8,
    _scratch_memory_size: usize,
) {
    unsafe {
        let arguments = &*arguments;
        assert_eq!(arguments.argument_count, 3);
        let slots = std::slice::from_raw_parts_mut(arguments.arguments, arguments.argument_count);

        let input = slots[0].float_buffer_in;
        let amount = slots[1].float_constant_in;
        let output = slots[2].float_buffer_out;

        let sample_count = output.sample_count as usize;
        let destination = std::slice::from_raw_parts_mut(output.samples, sample_count);
        if input.is_constant {
            destination.fill(*input.samples + amount);
        } else {
            let source = std::slice::from_raw_parts(input.samples, sample_count);
            for (destination_sample, &source_sample) in destination.iter_mut().zip(source) {
                *destination_sample = source_sample + amount;
            }
        }

        slots[2].float_buffer_out.is_constant = input.is_constant;
    }
}

unsafe extern "C" fn add_constant_initialize_voice(
    _context: *const NativeModuleContext,
    _arguments: *const NativeModuleArguments,
    scratch_memory_requirement_out: *mut MemoryRequirement,
) -> *mut c_void {
    unsafe {
        *scratch_memory_requirement_out = MemoryRequirement {
            size: 128,
            alignment: 64,
        };
    }
    std::ptr::null_mut()
}

/// Owns the descriptor storage a test library points into; the registry deep
/// copies everything during registration.
pub struct TestNativeLibrary {
    _parameters: Box<[NativeModuleParameter]>,
    _modules: Box<[NativeModule]>,
    _module_pointers: Box<[*const NativeModule]>,
    pub library: NativeLibrary,
}

pub fn add_constant_library() -> TestNativeLibrary {
    let buffer_type = |direction, mutability| NativeModuleParameter {
        direction,
        name: std::ptr::null(),
        data_type: DataType {
            runtime_mutability: mutability,
            primitive_type: PrimitiveType::Float,
            upsample_factor: 1,
            is_array: false,
        },
        disallow_buffer_sharing: false,
    };

    let mut parameters = vec![
        buffer_type(ModuleParameterDirection::In, RuntimeMutability::Variable),
        buffer_type(ModuleParameterDirection::In, RuntimeMutability::Constant),
        buffer_type(ModuleParameterDirection::Out, RuntimeMutability::Variable),
    ]
    .into_boxed_slice();
    parameters[0].name = INPUT_NAME.as_ptr();
    parameters[1].name = AMOUNT_NAME.as_ptr();
    parameters[2].name = RESULT_NAME.as_ptr();

    let modules = vec![NativeModule {
        id: ADD_CONSTANT_MODULE_ID,
        signature: NativeModuleSignature {
            name: MODULE_NAME.as_ptr(),
            parameters: parameters.as_ptr(),
            parameter_count: parameters.len(),
            return_parameter_index: 2,
        },
        has_side_effects: false,
        always_runtime: false,
        prepare: None,
        initialize_voice: Some(add_constant_initialize_voice),
        deinitialize_voice: None,
        set_voice_active: None,
        invoke_compile_time: None,
        invoke: Some(add_constant_invoke),
    }]
    .into_boxed_slice();

    let module_pointers: Box<[*const NativeModule]> =
        modules.iter().map(std::ptr::from_ref).collect();

    let library = NativeLibrary {
        id: TEST_LIBRARY_ID,
        version: NativeLibraryVersion {
            major: 1,
            minor: 0,
            patch: 0,
        },
        name: LIBRARY_NAME.as_ptr(),
        initialize: None,
        deinitialize: None,
        initialize_voice: None,
        deinitialize_voice: None,
        native_modules: module_pointers.as_ptr(),
        native_module_count: module_pointers.len(),
        optimization_rules: std::ptr::null(),
        optimization_rule_count: 0,
    };

    TestNativeLibrary {
        _parameters: parameters,
        _modules: modules,
        _module_pointers: module_pointers,
        library,
    }
}

/// Serializes program bytes in wire order; `finish` patches the header hash.
pub struct ProgramBytes {
    bytes: Vec<u8>,
}

impl ProgramBytes {
    pub fn new() -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PROGRAM_HEADER_MAGIC);
        bytes.extend_from_slice(&PROGRAM_VERSION.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 32]);
        Self { bytes }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Variant properties, instrument properties and an empty dependency
    /// list in one call.
    pub fn standard_header(
        &mut self,
        input_channel_count: i32,
        output_channel_count: i32,
        max_voices: i32,
    ) -> &mut Self {
        self.u32(0) // no native library dependencies
            .i32(48_000)
            .i32(input_channel_count)
            .i32(output_channel_count)
            .i32(max_voices)
            .u32(0) // effect activation mode: always
            .f64(0.0)
    }

    pub fn finish(mut self) -> Vec<u8> {
        let payload_start = PROGRAM_HEADER_MAGIC.len() + 4 + 32;
        let mut hash_input = self.bytes[payload_start..].to_vec();
        hash_input.extend_from_slice(&PROGRAM_HASH_SALT);
        let hash = sha256(&hash_input);
        self.bytes[PROGRAM_HEADER_MAGIC.len() + 4..payload_start].copy_from_slice(&hash);
        self.bytes
    }
}

/// `IntConstant(value)` wired to a single graph output channel via the voice
/// graph.
///
/// Nodes: 0 Input, 1 Output, 2 IntConstant, 3 GraphOutput.
pub fn int_constant_program(value: i32) -> Vec<u8> {
    let mut program = ProgramBytes::new();
    program.standard_header(0, 1, 1);
    program.u32(4).u8(0).u8(1).u8(4).u8(10);
    // Output: one connection, to Input 0
    program.u32(1).u32(0);
    // IntConstant: output node 1, value
    program.u32(1).i32(value);
    // GraphOutput: input node 0
    program.u32(0);
    // No float/double input channels
    program.u8(0).u8(0);
    // Output channels: GraphOutput at node 3
    program.u32(3);
    // No voice/effect remain-active, no voice-to-effect channels
    program.u8(0).u8(0).u32(0);
    // Voice graph: [3]; no effect graph
    program.u8(1).u32(1).u32(3).u8(0);
    program.finish()
}

/// `FloatConstant(value)` to one output channel via the voice graph.
///
/// Nodes: 0 Input, 1 Output, 2 FloatConstant, 3 GraphOutput.
pub fn constant_voice_program(value: f32, max_voices: i32) -> Vec<u8> {
    let mut program = ProgramBytes::new();
    program.standard_header(0, 1, max_voices);
    program.u32(4).u8(0).u8(1).u8(2).u8(10);
    program.u32(1).u32(0);
    program.u32(1).f32(value);
    program.u32(0);
    program.u8(0).u8(0);
    program.u32(3);
    program.u8(0).u8(0).u32(0);
    program.u8(1).u32(1).u32(3).u8(0);
    program.finish()
}

fn library_dependency(program: &mut ProgramBytes) {
    program.u32(1);
    program.raw(&TEST_LIBRARY_ID);
    program.u32(1).u32(0).u32(0);
}

/// One float input channel through the `add` module into one output channel,
/// all in the voice graph.
///
/// Nodes: 0-2 Input, 3-5 Output, 6 FloatConstant, 7 NativeModuleCall,
/// 8 GraphInput, 9 GraphOutput.
pub fn add_constant_voice_program(amount: f32, max_voices: i32) -> Vec<u8> {
    let mut program = ProgramBytes::new();
    library_dependency(&mut program);
    program
        .i32(48_000)
        .i32(1)
        .i32(1)
        .i32(max_voices)
        .u32(0)
        .f64(0.0);
    program.u32(10);
    for node_type in [0u8, 0, 0, 1, 1, 1, 2, 8, 9, 10] {
        program.u8(node_type);
    }
    // Outputs: GraphInput out -> Input 0; FloatConstant out -> Input 1;
    // module out -> Input 2
    program.u32(1).u32(0);
    program.u32(1).u32(1);
    program.u32(1).u32(2);
    // FloatConstant: output node 4, value
    program.u32(4).f32(amount);
    // NativeModuleCall: ids, 2 inputs, 1 output, upsample 1
    program.raw(&TEST_LIBRARY_ID);
    program.raw(&ADD_CONSTANT_MODULE_ID);
    program.u32(2).u32(1).i32(1);
    program.u32(0).u32(1);
    program.u32(5);
    // GraphInput: output node 3; GraphOutput: input node 2
    program.u32(3);
    program.u32(2);
    // Float input channels: [8]; no double channels
    program.u8(1).u32(8).u8(0);
    // Output channels: [9]
    program.u32(9);
    program.u8(0).u8(0).u32(0);
    program.u8(1).u32(1).u32(9).u8(0);
    program.finish()
}

/// Constant voices summed into a voice-to-effect channel, with the effect
/// stage adding `effect_amount` before the output channel.
///
/// Nodes: 0-3 Input, 4-7 Output, 8-9 FloatConstant, 10 NativeModuleCall,
/// 11 GraphInput, 12-13 GraphOutput.
pub fn effect_program(voice_value: f32, effect_amount: f32, max_voices: i32) -> Vec<u8> {
    let mut program = ProgramBytes::new();
    library_dependency(&mut program);
    program
        .i32(48_000)
        .i32(0)
        .i32(1)
        .i32(max_voices)
        .u32(0)
        .f64(0.0);
    program.u32(14);
    for node_type in [0u8, 0, 0, 0, 1, 1, 1, 1, 2, 2, 8, 9, 10, 10] {
        program.u8(node_type);
    }
    // Outputs: voice constant -> Input 0; effect graph input -> Input 1;
    // effect amount -> Input 2; effect module -> Input 3
    program.u32(1).u32(0);
    program.u32(1).u32(1);
    program.u32(1).u32(2);
    program.u32(1).u32(3);
    // Voice and effect-amount constants
    program.u32(4).f32(voice_value);
    program.u32(6).f32(effect_amount);
    // Effect NativeModuleCall
    program.raw(&TEST_LIBRARY_ID);
    program.raw(&ADD_CONSTANT_MODULE_ID);
    program.u32(2).u32(1).i32(1);
    program.u32(1).u32(2);
    program.u32(7);
    // GraphInput (voice-to-effect): output node 5
    program.u32(5);
    // GraphOutputs: voice out (input 0), effect out (input 3)
    program.u32(0);
    program.u32(3);
    // No input channels
    program.u8(0).u8(0);
    // Output channels: effect GraphOutput at node 13
    program.u32(13);
    // No remain-active outputs
    program.u8(0).u8(0);
    // One voice-to-effect channel: float, voice output 12 -> effect input 11
    program.u32(1).u8(0).u32(12).u32(11);
    // Voice graph: [12]; effect graph: [13]
    program.u8(1).u32(1).u32(12);
    program.u8(1).u32(1).u32(13);
    program.finish()
}
