//! Accumulation and remain-active scan coverage.

use chord_native::PrimitiveType;

use crate::accumulate::{accumulate_voice_outputs, process_remain_active_output};
use crate::buffers::{BufferHandle, BufferManager};

fn bool_buffer(manager: &mut BufferManager, sample_count: usize) -> BufferHandle {
    let handle = manager.add_buffer(PrimitiveType::Bool, sample_count, 1);
    manager.initialize_buffer_concurrency();
    manager.allocate_buffers();
    handle
}

fn write_bytes(manager: &BufferManager, handle: BufferHandle, bytes: &[u8]) {
    let memory = manager.get_buffer(handle).memory;
    // SAFETY: the buffer covers at least these bytes.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), memory, bytes.len()) };
}

#[test]
fn no_active_voices_yield_a_constant_zero() {
    let mut manager = BufferManager::new();
    let handle = manager.add_buffer(PrimitiveType::Float, 64, 1);
    manager.initialize_buffer_concurrency();
    manager.allocate_buffers();

    // Dirty the buffer first so the zero fill is observable
    let memory = manager.get_buffer(handle).memory;
    unsafe { std::ptr::write_bytes(memory, 0xff, 64) };

    accumulate_voice_outputs(&[], &[], &[], &manager, 0, handle, 64);

    let buffer = manager.get_buffer(handle);
    assert!(buffer.is_constant);
    let constant = unsafe { *buffer.memory.cast::<f32>() };
    assert_eq!(constant, 0.0);
}

#[test]
fn remain_active_all_ones_is_true() {
    let mut manager = BufferManager::new();
    let handle = bool_buffer(&mut manager, 13);
    // 13 samples: one full byte plus five valid bits
    write_bytes(&manager, handle, &[0xff, 0x1f]);
    assert!(process_remain_active_output(manager.get_buffer(handle), 13));
}

#[test]
fn remain_active_single_zero_bit_is_false() {
    let mut manager = BufferManager::new();
    let handle = bool_buffer(&mut manager, 13);
    // Bit 10 (bit 2 of the second byte) is zero; later bits are one again
    write_bytes(&manager, handle, &[0xff, 0x1b]);
    assert!(!process_remain_active_output(manager.get_buffer(handle), 13));

    write_bytes(&manager, handle, &[0xfe, 0x1f]);
    assert!(!process_remain_active_output(manager.get_buffer(handle), 13));
}

#[test]
fn remain_active_invalid_trailing_bits_are_ignored() {
    let mut manager = BufferManager::new();
    let handle = bool_buffer(&mut manager, 13);
    // The three invalid high bits of the second byte are zero; they must
    // not make the result false
    write_bytes(&manager, handle, &[0xff, 0b0001_1111]);
    assert!(process_remain_active_output(manager.get_buffer(handle), 13));
}

#[test]
fn remain_active_sub_byte_buffer() {
    let mut manager = BufferManager::new();
    let handle = bool_buffer(&mut manager, 5);
    write_bytes(&manager, handle, &[0b0001_1111]);
    assert!(process_remain_active_output(manager.get_buffer(handle), 5));

    write_bytes(&manager, handle, &[0b0001_0111]);
    assert!(!process_remain_active_output(manager.get_buffer(handle), 5));
}

#[test]
fn remain_active_constant_buffer_reads_the_low_bit() {
    let mut manager = BufferManager::new();
    let handle = bool_buffer(&mut manager, 64);
    write_bytes(&manager, handle, &[0x01]);
    manager.set_buffer_constant(handle, true);
    assert!(process_remain_active_output(manager.get_buffer(handle), 64));

    write_bytes(&manager, handle, &[0xfe]);
    assert!(!process_remain_active_output(manager.get_buffer(handle), 64));
}
