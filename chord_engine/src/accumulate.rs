//! Block-wise summation of per-voice outputs into destination buffers, plus
//! the remain-active scan and host channel conversions.

use chord_native::PrimitiveType;

use crate::buffers::{
    BUFFER_CONSTANT_VALUE_BYTE_COUNT, BufferHandle, BufferInfo, BufferManager, TaskId,
};
use crate::processor::{InputChannelBuffer, OutputChannelBuffer};
use crate::stage::{BufferOrConstant, ProgramStageTaskManager};

/// Element type of an accumulable voice output.
pub trait AccumulateElement: Copy + std::ops::AddAssign + num_traits::Zero {
    fn constant_value(output: BufferOrConstant) -> Self;
}

impl AccumulateElement for f32 {
    fn constant_value(output: BufferOrConstant) -> Self {
        match output {
            BufferOrConstant::Float(value) => value,
            _ => panic!("voice output is not a float constant"),
        }
    }
}

impl AccumulateElement for f64 {
    fn constant_value(output: BufferOrConstant) -> Self {
        match output {
            BufferOrConstant::Double(value) => value,
            _ => panic!("voice output is not a double constant"),
        }
    }
}

impl AccumulateElement for i32 {
    fn constant_value(output: BufferOrConstant) -> Self {
        match output {
            BufferOrConstant::Int(value) => value,
            _ => panic!("voice output is not an int constant"),
        }
    }
}

/// The constant fast path applies when every active voice started at sample
/// zero and every buffer-typed voice output is itself constant.
fn can_accumulate_outputs_as_constant(
    voices: &[ProgramStageTaskManager],
    active_voice_indices: &[usize],
    voice_sample_offsets: &[usize],
    buffer_manager: &BufferManager,
    output_index: usize,
) -> bool {
    for &voice_index in active_voice_indices {
        if voice_sample_offsets[voice_index] != 0 {
            return false;
        }
        if let BufferOrConstant::Buffer(buffer_handle) =
            voices[voice_index].get_output(output_index)
        {
            buffer_manager.start_buffer_read(buffer_handle, TaskId::none());
            let is_constant = buffer_manager.get_buffer(buffer_handle).is_constant;
            buffer_manager.finish_buffer_read(buffer_handle, TaskId::none());
            if !is_constant {
                return false;
            }
        }
    }
    true
}

fn accumulate_outputs_as_constant<T: AccumulateElement>(
    voices: &[ProgramStageTaskManager],
    active_voice_indices: &[usize],
    buffer_manager: &BufferManager,
    output_index: usize,
    buffer: BufferInfo,
) {
    let mut result = T::zero();
    for &voice_index in active_voice_indices {
        match voices[voice_index].get_output(output_index) {
            BufferOrConstant::Buffer(buffer_handle) => {
                buffer_manager.start_buffer_read(buffer_handle, TaskId::none());
                let output_buffer = buffer_manager.get_buffer(buffer_handle);
                debug_assert!(output_buffer.is_constant);
                // SAFETY: a constant buffer's value slot is always readable.
                result += unsafe { *output_buffer.memory.cast::<T>() };
                buffer_manager.finish_buffer_read(buffer_handle, TaskId::none());
            }
            output => result += T::constant_value(output),
        }
    }

    // Replicate across the destination's constant region
    let element_count = BUFFER_CONSTANT_VALUE_BYTE_COUNT / size_of::<T>();
    // SAFETY: every buffer covers at least the constant region.
    let destination = unsafe { std::slice::from_raw_parts_mut(buffer.memory.cast::<T>(), element_count) };
    destination.fill(result);
}

fn accumulate_outputs_as_non_constant<T: AccumulateElement>(
    voices: &[ProgramStageTaskManager],
    active_voice_indices: &[usize],
    voice_sample_offsets: &[usize],
    buffer_manager: &BufferManager,
    output_index: usize,
    buffer: BufferInfo,
    sample_count: usize,
) {
    // SAFETY: the destination buffer holds at least sample_count elements.
    let buffer_samples =
        unsafe { std::slice::from_raw_parts_mut(buffer.memory.cast::<T>(), sample_count) };

    for (position, &voice_index) in active_voice_indices.iter().enumerate() {
        let voice_sample_offset = voice_sample_offsets[voice_index];
        let voice_sample_count = sample_count - voice_sample_offset;
        let is_first_voice = position == 0;

        // The first voice is copied rather than accumulated, so zero out the
        // samples before its trigger point
        if is_first_voice {
            buffer_samples[..voice_sample_offset].fill(T::zero());
        }
        let destination = &mut buffer_samples[voice_sample_offset..];

        match voices[voice_index].get_output(output_index) {
            BufferOrConstant::Buffer(buffer_handle) => {
                buffer_manager.start_buffer_read(buffer_handle, TaskId::none());
                let output_buffer = buffer_manager.get_buffer(buffer_handle);
                if output_buffer.is_constant {
                    // SAFETY: a constant buffer's value slot is readable.
                    let constant_value = unsafe { *output_buffer.memory.cast::<T>() };
                    if is_first_voice {
                        destination.fill(constant_value);
                    } else {
                        for sample in destination.iter_mut() {
                            *sample += constant_value;
                        }
                    }
                } else {
                    // SAFETY: the voice output holds at least
                    // voice_sample_count elements.
                    let source = unsafe {
                        std::slice::from_raw_parts(
                            output_buffer.memory.cast::<T>(),
                            voice_sample_count,
                        )
                    };
                    if is_first_voice {
                        destination.copy_from_slice(source);
                    } else {
                        for (sample, &value) in destination.iter_mut().zip(source) {
                            *sample += value;
                        }
                    }
                }
                buffer_manager.finish_buffer_read(buffer_handle, TaskId::none());
            }
            output => {
                let constant_value = T::constant_value(output);
                if is_first_voice {
                    destination.fill(constant_value);
                } else {
                    for sample in destination.iter_mut() {
                        *sample += constant_value;
                    }
                }
            }
        }
    }
}

/// Sums the given output across all active voices into the destination
/// buffer. With no active voices the destination becomes a constant zero;
/// when every contribution is constant and offset-free the sum itself is
/// written as a constant.
pub fn accumulate_voice_outputs(
    voices: &[ProgramStageTaskManager],
    active_voice_indices: &[usize],
    voice_sample_offsets: &[usize],
    buffer_manager: &BufferManager,
    output_index: usize,
    buffer_handle: BufferHandle,
    sample_count: usize,
) {
    buffer_manager.start_buffer_write(buffer_handle, TaskId::none());
    let buffer = buffer_manager.get_buffer(buffer_handle);

    if active_voice_indices.is_empty() {
        // SAFETY: every buffer covers at least the constant region.
        unsafe {
            std::ptr::write_bytes(buffer.memory, 0, BUFFER_CONSTANT_VALUE_BYTE_COUNT);
        }
        buffer_manager.set_buffer_constant(buffer_handle, true);
    } else {
        let as_constant = can_accumulate_outputs_as_constant(
            voices,
            active_voice_indices,
            voice_sample_offsets,
            buffer_manager,
            output_index,
        );
        match buffer.primitive_type {
            PrimitiveType::Float => {
                if as_constant {
                    accumulate_outputs_as_constant::<f32>(
                        voices,
                        active_voice_indices,
                        buffer_manager,
                        output_index,
                        buffer,
                    );
                } else {
                    accumulate_outputs_as_non_constant::<f32>(
                        voices,
                        active_voice_indices,
                        voice_sample_offsets,
                        buffer_manager,
                        output_index,
                        buffer,
                        sample_count,
                    );
                }
            }
            PrimitiveType::Double => {
                if as_constant {
                    accumulate_outputs_as_constant::<f64>(
                        voices,
                        active_voice_indices,
                        buffer_manager,
                        output_index,
                        buffer,
                    );
                } else {
                    accumulate_outputs_as_non_constant::<f64>(
                        voices,
                        active_voice_indices,
                        voice_sample_offsets,
                        buffer_manager,
                        output_index,
                        buffer,
                        sample_count,
                    );
                }
            }
            PrimitiveType::Int => {
                if as_constant {
                    accumulate_outputs_as_constant::<i32>(
                        voices,
                        active_voice_indices,
                        buffer_manager,
                        output_index,
                        buffer,
                    );
                } else {
                    accumulate_outputs_as_non_constant::<i32>(
                        voices,
                        active_voice_indices,
                        voice_sample_offsets,
                        buffer_manager,
                        output_index,
                        buffer,
                        sample_count,
                    );
                }
            }
            PrimitiveType::Bool | PrimitiveType::String => {
                panic!("bool and string voice outputs cannot be accumulated")
            }
        }
        buffer_manager.set_buffer_constant(buffer_handle, as_constant);
    }

    buffer_manager.finish_buffer_write(buffer_handle, TaskId::none());
}

/// Scans a bool buffer for the stage's remain-active result.
///
/// The remain-active output reports the first possible moment a stage can
/// stop processing: a single false bit makes the result false even if later
/// bits are true again.
pub fn process_remain_active_output(buffer: BufferInfo, sample_count: usize) -> bool {
    debug_assert_eq!(buffer.primitive_type, PrimitiveType::Bool);

    let byte_count = sample_count.div_ceil(8);
    // SAFETY: the buffer holds at least this many packed sample bytes.
    let byte_values = unsafe { std::slice::from_raw_parts(buffer.memory, byte_count.max(1)) };

    if buffer.is_constant {
        return byte_values[0] & 1 != 0;
    }

    let full_byte_count = sample_count / 8;
    for &byte in &byte_values[..full_byte_count] {
        if byte != 0xff {
            return false;
        }
    }

    if byte_count == full_byte_count {
        return true;
    }

    let partial_value = byte_values[full_byte_count];
    let valid_bit_count = sample_count - full_byte_count * 8;

    // A single 0 bit means false, so mask the invalid bits with 1
    let value = partial_value | (0xffu8 << valid_bit_count);
    value == 0xff
}

/// Whether an input channel's block contains a sample loud enough to wake
/// the effect stage.
pub fn should_activate_effect(
    input: &InputChannelBuffer,
    effect_activation_threshold: f64,
    sample_count: usize,
) -> bool {
    match input {
        InputChannelBuffer::Float32(samples) => samples[..sample_count]
            .iter()
            .any(|&value| f64::from(value.abs()) > effect_activation_threshold),
        InputChannelBuffer::Float64(samples) => samples[..sample_count]
            .iter()
            .any(|&value| value.abs() > effect_activation_threshold),
    }
}

fn splat_into_output(output: &mut OutputChannelBuffer, sample_count: usize, value: f64) {
    match output {
        OutputChannelBuffer::Float32(samples) => samples[..sample_count].fill(value as f32),
        OutputChannelBuffer::Float64(samples) => samples[..sample_count].fill(value),
    }
}

pub fn fill_output_channel_zero(output: &mut OutputChannelBuffer, sample_count: usize) {
    splat_into_output(output, sample_count, 0.0);
}

pub fn fill_output_channel_constant(
    output: &mut OutputChannelBuffer,
    sample_count: usize,
    source: BufferOrConstant,
    buffer_manager: &BufferManager,
) {
    let value = match source {
        BufferOrConstant::Float(value) => f64::from(value),
        BufferOrConstant::Double(value) => value,
        BufferOrConstant::Buffer(buffer_handle) => {
            let buffer = buffer_manager.get_buffer(buffer_handle);
            debug_assert!(buffer.is_constant);
            match buffer.primitive_type {
                // SAFETY: a constant buffer's value slot is readable.
                PrimitiveType::Float => f64::from(unsafe { *buffer.memory.cast::<f32>() }),
                PrimitiveType::Double => unsafe { *buffer.memory.cast::<f64>() },
                _ => panic!("output channels must be float or double"),
            }
        }
        _ => panic!("output channels must be float or double"),
    };
    splat_into_output(output, sample_count, value);
}

/// Copies a non-constant source buffer into a host output channel,
/// converting between f32 and f64 as needed.
pub fn fill_output_channel_buffer(
    output: &mut OutputChannelBuffer,
    source_buffer: BufferInfo,
    sample_count: usize,
) {
    debug_assert!(!source_buffer.is_constant);
    match output {
        OutputChannelBuffer::Float32(samples) => {
            let destination = &mut samples[..sample_count];
            match source_buffer.primitive_type {
                PrimitiveType::Float => {
                    // SAFETY: the source holds at least sample_count elements.
                    let source = unsafe {
                        std::slice::from_raw_parts(source_buffer.memory.cast::<f32>(), sample_count)
                    };
                    destination.copy_from_slice(source);
                }
                PrimitiveType::Double => {
                    // SAFETY: as above.
                    let source = unsafe {
                        std::slice::from_raw_parts(source_buffer.memory.cast::<f64>(), sample_count)
                    };
                    for (destination_sample, &source_sample) in destination.iter_mut().zip(source) {
                        *destination_sample = source_sample as f32;
                    }
                }
                _ => panic!("output channels must be float or double"),
            }
        }
        OutputChannelBuffer::Float64(samples) => {
            let destination = &mut samples[..sample_count];
            match source_buffer.primitive_type {
                PrimitiveType::Float => {
                    // SAFETY: as above.
                    let source = unsafe {
                        std::slice::from_raw_parts(source_buffer.memory.cast::<f32>(), sample_count)
                    };
                    for (destination_sample, &source_sample) in destination.iter_mut().zip(source) {
                        *destination_sample = f64::from(source_sample);
                    }
                }
                PrimitiveType::Double => {
                    // SAFETY: as above.
                    let source = unsafe {
                        std::slice::from_raw_parts(source_buffer.memory.cast::<f64>(), sample_count)
                    };
                    destination.copy_from_slice(source);
                }
                _ => panic!("output channels must be float or double"),
            }
        }
    }
}
