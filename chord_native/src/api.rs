//! The C ABI shared between the engine and native libraries.
//!
//! Plugins export a single symbol:
//!
//! ```c
//! void ListNativeLibraries(void* context, void (*callback)(void* context, const NativeLibrary*));
//! ```
//!
//! and invoke the callback once per library they provide. The engine deep
//! copies every descriptor during the callback; nothing handed to the
//! callback needs to outlive it.
//!
//! Strings are UTF-32 encoded. Descriptor names are null-terminated; string
//! arguments carry explicit lengths. Bool buffers pack 8 samples per byte,
//! LSB-first.

use std::ffi::c_void;

/// Number of id bytes for libraries and modules.
pub const ID_BYTE_COUNT: usize = 16;

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ModuleParameterDirection {
    In = 0,
    Out = 1,
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PrimitiveType {
    Float = 0,
    Double = 1,
    Int = 2,
    Bool = 3,
    String = 4,
}

impl PrimitiveType {
    /// Decodes a serialized primitive-type tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Float),
            1 => Some(Self::Double),
            2 => Some(Self::Int),
            3 => Some(Self::Bool),
            4 => Some(Self::String),
            _ => None,
        }
    }
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RuntimeMutability {
    /// The value is fixed at compile time and embedded into the argument.
    Constant = 0,
    /// Constant if every input it depends on is constant.
    DependentConstant = 1,
    /// A per-sample buffer.
    Variable = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DataType {
    pub runtime_mutability: RuntimeMutability,
    pub primitive_type: PrimitiveType,
    pub upsample_factor: i32,
    pub is_array: bool,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeModuleParameter {
    pub direction: ModuleParameterDirection,
    /// Null-terminated UTF-32.
    pub name: *const u32,
    pub data_type: DataType,
    /// If true, this parameter's buffer memory is never shared with a
    /// parameter of the opposite direction.
    pub disallow_buffer_sharing: bool,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeModuleSignature {
    /// Null-terminated UTF-32.
    pub name: *const u32,
    pub parameters: *const NativeModuleParameter,
    pub parameter_count: usize,
    pub return_parameter_index: i32,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryRequirement {
    pub size: usize,
    pub alignment: usize,
}

impl MemoryRequirement {
    pub const fn none() -> Self {
        Self {
            size: 0,
            alignment: 1,
        }
    }
}

// Buffer and constant-array descriptors visible to plugins. Input and output
// variants share one layout; only the pointer mutability differs.

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputString {
    pub value: *const u32,
    pub length: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputFloatConstantArray {
    pub elements: *const f32,
    pub count: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputDoubleConstantArray {
    pub elements: *const f64,
    pub count: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputIntConstantArray {
    pub elements: *const i32,
    pub count: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputBoolConstantArray {
    pub elements: *const bool,
    pub count: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputStringConstantArray {
    pub elements: *const InputString,
    pub count: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputFloatBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *const f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputDoubleBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *const f64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputIntBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *const i32,
}

/// Bool samples are bit-packed into 32-bit words.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputBoolBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *const i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OutputFloatBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *mut f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OutputDoubleBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *mut f64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OutputIntBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *mut i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OutputBoolBuffer {
    pub sample_count: i32,
    pub is_constant: bool,
    pub samples: *mut i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputFloatBufferArray {
    pub count: usize,
    pub elements: *const InputFloatBuffer,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputDoubleBufferArray {
    pub count: usize,
    pub elements: *const InputDoubleBuffer,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputIntBufferArray {
    pub count: usize,
    pub elements: *const InputIntBuffer,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputBoolBufferArray {
    pub count: usize,
    pub elements: *const InputBoolBuffer,
}

/// One argument slot, in declaration order. Which field is live is determined
/// by the corresponding parameter's direction and data type.
#[repr(C)]
#[derive(Clone, Copy)]
pub union NativeModuleArgument {
    pub float_constant_in: f32,
    pub float_constant_array_in: InputFloatConstantArray,
    pub float_buffer_in: InputFloatBuffer,
    pub float_buffer_out: OutputFloatBuffer,
    pub float_buffer_array_in: InputFloatBufferArray,

    pub double_constant_in: f64,
    pub double_constant_array_in: InputDoubleConstantArray,
    pub double_buffer_in: InputDoubleBuffer,
    pub double_buffer_out: OutputDoubleBuffer,
    pub double_buffer_array_in: InputDoubleBufferArray,

    pub int_constant_in: i32,
    pub int_constant_array_in: InputIntConstantArray,
    pub int_buffer_in: InputIntBuffer,
    pub int_buffer_out: OutputIntBuffer,
    pub int_buffer_array_in: InputIntBufferArray,

    pub bool_constant_in: bool,
    pub bool_constant_array_in: InputBoolConstantArray,
    pub bool_buffer_in: InputBoolBuffer,
    pub bool_buffer_out: OutputBoolBuffer,
    pub bool_buffer_array_in: InputBoolBufferArray,

    pub string_constant_in: InputString,
    pub string_constant_array_in: InputStringConstantArray,
}

impl NativeModuleArgument {
    /// An argument with no live field yet.
    pub const fn zeroed() -> Self {
        Self {
            double_constant_in: 0.0,
        }
    }
}

#[repr(C)]
pub struct NativeModuleArguments {
    pub arguments: *mut NativeModuleArgument,
    pub argument_count: usize,
}

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReportingSeverity {
    Warning = 0,
    Error = 1,
}

/// Reporting callback. `message` is a null-terminated UTF-32 string.
pub type ReportFn =
    unsafe extern "C" fn(context: *mut c_void, severity: ReportingSeverity, message: *const u32);

#[repr(C)]
pub struct NativeModuleContext {
    /// The native library's context. Always available.
    pub native_library_context: *mut c_void,
    /// The native library's voice context. Available once the voice exists.
    pub native_library_voice_context: *mut c_void,
    /// The native module's voice context. Available after voice initialization.
    pub voice_context: *mut c_void,

    pub sample_rate: i32,
    pub input_channel_count: i32,
    pub output_channel_count: i32,
    pub upsample_factor: i32,
    pub is_compile_time: bool,

    pub reporting_context: *mut c_void,
    pub report: Option<ReportFn>,
}

/// Called before a module is inserted into a graph; validates arguments and
/// reports latency.
pub type NativeModulePrepare = unsafe extern "C" fn(
    context: *const NativeModuleContext,
    arguments: *const NativeModuleArguments,
    latency_out: *mut i32,
) -> bool;

/// Called per voice at program initialization. Returns the module's voice
/// context and reports its scratch-memory requirement.
pub type NativeModuleInitializeVoice = unsafe extern "C" fn(
    context: *const NativeModuleContext,
    arguments: *const NativeModuleArguments,
    scratch_memory_requirement_out: *mut MemoryRequirement,
) -> *mut c_void;

pub type NativeModuleDeinitializeVoice =
    unsafe extern "C" fn(context: *const NativeModuleContext);

/// Called when the owning voice toggles between active and inactive. State
/// such as filter memories and delay lines should be reset on activation.
pub type NativeModuleSetVoiceActive =
    unsafe extern "C" fn(context: *const NativeModuleContext, voice_active: bool);

pub type NativeModuleInvokeCompileTime = unsafe extern "C" fn(
    context: *const NativeModuleContext,
    arguments: *const NativeModuleArguments,
);

pub type NativeModuleInvoke = unsafe extern "C" fn(
    context: *const NativeModuleContext,
    arguments: *const NativeModuleArguments,
    scratch_memory: *mut u8,
    scratch_memory_size: usize,
);

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeModule {
    pub id: [u8; ID_BYTE_COUNT],
    pub signature: NativeModuleSignature,

    /// If true, this module is never deduplicated or optimized away.
    pub has_side_effects: bool,
    /// If true, this module is never invoked at compile time.
    pub always_runtime: bool,

    pub prepare: Option<NativeModulePrepare>,
    pub initialize_voice: Option<NativeModuleInitializeVoice>,
    pub deinitialize_voice: Option<NativeModuleDeinitializeVoice>,
    pub set_voice_active: Option<NativeModuleSetVoiceActive>,
    pub invoke_compile_time: Option<NativeModuleInvokeCompileTime>,
    pub invoke: Option<NativeModuleInvoke>,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NativeLibraryVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Called when a native library is loaded. Optionally returns a context.
pub type NativeLibraryInitialize = unsafe extern "C" fn() -> *mut c_void;
pub type NativeLibraryDeinitialize = unsafe extern "C" fn(context: *mut c_void);
/// Called when a voice is created. Optionally returns a voice context.
pub type NativeLibraryInitializeVoice = unsafe extern "C" fn(context: *mut c_void) -> *mut c_void;
pub type NativeLibraryDeinitializeVoice =
    unsafe extern "C" fn(context: *mut c_void, voice_context: *mut c_void);

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeLibrary {
    pub id: [u8; ID_BYTE_COUNT],
    pub version: NativeLibraryVersion,
    /// Null-terminated UTF-32.
    pub name: *const u32,

    pub initialize: Option<NativeLibraryInitialize>,
    pub deinitialize: Option<NativeLibraryDeinitialize>,
    pub initialize_voice: Option<NativeLibraryInitializeVoice>,
    pub deinitialize_voice: Option<NativeLibraryDeinitializeVoice>,

    pub native_modules: *const *const NativeModule,
    pub native_module_count: usize,

    /// Compile-time only; the runtime discards these.
    pub optimization_rules: *const c_void,
    pub optimization_rule_count: usize,
}

pub type ListNativeLibrariesCallback =
    unsafe extern "C" fn(context: *mut c_void, native_library: *const NativeLibrary);

/// The entry point every plugin binary exports as `ListNativeLibraries`.
pub type ListNativeLibrariesFn =
    unsafe extern "C" fn(context: *mut c_void, callback: ListNativeLibrariesCallback);

/// Name of the exported entry-point symbol.
pub const LIST_NATIVE_LIBRARIES_SYMBOL: &[u8] = b"ListNativeLibraries";

/// Length of a null-terminated UTF-32 string.
///
/// # Safety
///
/// `string` must point to a valid null-terminated UTF-32 sequence.
pub unsafe fn null_terminated_string_length(string: *const u32) -> usize {
    let mut length = 0;
    // SAFETY: caller guarantees a terminator exists.
    unsafe {
        while *string.add(length) != 0 {
            length += 1;
        }
    }
    length
}
