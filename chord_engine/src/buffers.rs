//! Logical buffers and the memory-sharing allocator.
//!
//! Buffers are registered up front, annotated with producer/consumer tasks
//! and pairwise concurrency, and then assigned physical memory in one pass.
//! Memory is shared wherever lifetimes and usage patterns permit:
//!
//! 1. Within a task, an output may reuse the memory of an input consumed by
//!    only that task, provided both iterate at the same stride.
//! 2. Across tasks, buffers that are never live at the same time may share
//!    one allocation.
//!
//! With the `buffer_guards` feature enabled, every read and write is
//! bracketed by checks that detect over-writes, stale reads and sharing
//! violations. In release builds the bracket calls compile away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chord_native::{
    InputBoolBuffer, InputDoubleBuffer, InputFloatBuffer, InputIntBuffer, PrimitiveType,
};
use chord_primitives::{AlignedMemory, MAX_SIMD_ALIGNMENT, align_int, is_aligned_int};

#[cfg(feature = "buffer_guards")]
use std::sync::atomic::AtomicUsize;

/// Bytes at the front of every buffer that hold the authoritative value when
/// the buffer is constant, replicated as needed.
pub const BUFFER_CONSTANT_VALUE_BYTE_COUNT: usize = 64;

#[cfg(feature = "buffer_guards")]
const BUFFER_GUARD_BYTE_COUNT: usize = align_int(64, MAX_SIMD_ALIGNMENT);
#[cfg(feature = "buffer_guards")]
const BUFFER_GUARD_MEMORY_BYTE: u8 = 0xcd;

/// Opaque identifier for a logical buffer registered with the manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferHandle(pub(crate) u32);

/// Identity of a task for producer/consumer bookkeeping. Derived from the
/// task's address; only compared, never dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(usize);

impl TaskId {
    pub fn from_ptr<T>(task: *const T) -> Self {
        Self(task as usize)
    }

    /// Anonymous task identity used by engine-internal buffer operations.
    pub fn none() -> Self {
        Self(0)
    }
}

pub fn primitive_type_bit_count(primitive_type: PrimitiveType) -> usize {
    match primitive_type {
        PrimitiveType::Float => size_of::<f32>() * 8,
        PrimitiveType::Double => size_of::<f64>() * 8,
        PrimitiveType::Int => size_of::<i32>() * 8,
        PrimitiveType::Bool => 1,
        PrimitiveType::String => panic!("string is not a buffer type"),
    }
}

/// Bool buffers pack 8 samples per byte; surplus trailing bits are unused.
pub fn calculate_buffer_byte_count(
    primitive_type: PrimitiveType,
    non_upsampled_sample_count: usize,
    upsample_factor: i32,
) -> usize {
    let element_bit_count = primitive_type_bit_count(primitive_type);
    align_int(
        (non_upsampled_sample_count * upsample_factor as usize * element_bit_count + 7) / 8,
        MAX_SIMD_ALIGNMENT,
    )
}

struct BufferData {
    primitive_type: PrimitiveType,
    upsample_factor: i32,
    byte_count: usize,
    is_constant: AtomicBool,
    memory: *mut u8,
    shared_memory_index: usize,

    output_task_for_sharing: Option<TaskId>,
    input_task_for_sharing: Option<TaskId>,
    input_task_usage_count: usize,
    is_shared_as_output: bool,
    is_shared_as_input: bool,
}

/// Snapshot of a buffer's descriptor and current state.
#[derive(Clone, Copy)]
pub struct BufferInfo {
    pub primitive_type: PrimitiveType,
    pub upsample_factor: i32,
    pub byte_count: usize,
    pub is_constant: bool,
    pub memory: *mut u8,
}

struct SharedBufferMemory {
    memory: *mut u8,
    #[cfg_attr(not(feature = "buffer_guards"), allow(dead_code))]
    byte_count: usize,
    #[cfg(feature = "buffer_guards")]
    write_task: AtomicUsize,
    #[cfg(feature = "buffer_guards")]
    read_task: AtomicUsize,
    #[cfg(feature = "buffer_guards")]
    read_count: AtomicUsize,
}

/// Assigns buffers to memory groups; all buffers in a group reuse one
/// physical block.
struct GroupManager {
    buffer_group_indices: Vec<Option<usize>>,
    groups: Vec<Vec<usize>>,
}

impl GroupManager {
    fn new(buffer_count: usize) -> Self {
        Self {
            buffer_group_indices: vec![None; buffer_count],
            groups: Vec::new(),
        }
    }

    fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn buffer_group_index(&self, buffer_index: usize) -> Option<usize> {
        self.buffer_group_indices[buffer_index]
    }

    fn create_group(&mut self) -> usize {
        self.groups.push(Vec::new());
        self.groups.len() - 1
    }

    fn add_buffer_to_group(&mut self, group_index: usize, buffer_index: usize) {
        debug_assert!(self.buffer_group_indices[buffer_index].is_none());
        self.groups[group_index].push(buffer_index);
        self.buffer_group_indices[buffer_index] = Some(group_index);
    }

    fn can_merge_groups(
        &self,
        destination_group_index: usize,
        source_group_index: usize,
        mut may_share: impl FnMut(usize, usize) -> bool,
    ) -> bool {
        self.groups[destination_group_index].iter().all(|&a| {
            self.groups[source_group_index]
                .iter()
                .all(|&b| may_share(a, b))
        })
    }

    fn merge_groups(&mut self, destination_group_index: usize, source_group_index: usize) {
        if destination_group_index == source_group_index {
            return;
        }
        let moved = std::mem::take(&mut self.groups[source_group_index]);
        for &buffer_index in &moved {
            self.buffer_group_indices[buffer_index] = Some(destination_group_index);
        }
        self.groups[destination_group_index].extend(moved);
    }
}

pub struct BufferManager {
    buffers: Vec<BufferData>,
    input_float_buffer_arrays: Vec<Box<[InputFloatBuffer]>>,
    input_double_buffer_arrays: Vec<Box<[InputDoubleBuffer]>>,
    input_int_buffer_arrays: Vec<Box<[InputIntBuffer]>>,
    input_bool_buffer_arrays: Vec<Box<[InputBoolBuffer]>>,
    /// Symmetric N×N matrix; true entries may never share memory.
    buffer_concurrency_matrix: Vec<bool>,
    shared_memory_entries: Vec<SharedBufferMemory>,
    buffer_memory: Option<AlignedMemory>,
    #[cfg(feature = "buffer_guards")]
    processing_sample_count: AtomicUsize,
}

// SAFETY: buffer contents are raw bytes whose access is synchronized by the
// task graph's ordering guarantees; the manager's own runtime state is
// atomic.
unsafe impl Send for BufferManager {}
unsafe impl Sync for BufferManager {}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            input_float_buffer_arrays: Vec::new(),
            input_double_buffer_arrays: Vec::new(),
            input_int_buffer_arrays: Vec::new(),
            input_bool_buffer_arrays: Vec::new(),
            buffer_concurrency_matrix: Vec::new(),
            shared_memory_entries: Vec::new(),
            buffer_memory: None,
            #[cfg(feature = "buffer_guards")]
            processing_sample_count: AtomicUsize::new(0),
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn add_buffer(
        &mut self,
        primitive_type: PrimitiveType,
        non_upsampled_sample_count: usize,
        upsample_factor: i32,
    ) -> BufferHandle {
        debug_assert!(upsample_factor >= 1);
        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(BufferData {
            primitive_type,
            upsample_factor,
            byte_count: calculate_buffer_byte_count(
                primitive_type,
                non_upsampled_sample_count,
                upsample_factor,
            ),
            is_constant: AtomicBool::new(false),
            memory: std::ptr::null_mut(),
            shared_memory_index: usize::MAX,
            output_task_for_sharing: None,
            input_task_for_sharing: None,
            input_task_usage_count: 0,
            is_shared_as_output: false,
            is_shared_as_input: false,
        });
        handle
    }

    /// Records the unique producing task, permitting within-task
    /// output/input sharing for this buffer.
    pub fn set_buffer_output_task_for_sharing(&mut self, handle: BufferHandle, task: TaskId) {
        self.buffers[handle.0 as usize].output_task_for_sharing = Some(task);
    }

    /// Accumulates a consumer; the first sharing-eligible consumer is
    /// recorded for within-task sharing.
    pub fn add_buffer_input_task(
        &mut self,
        handle: BufferHandle,
        task: TaskId,
        can_share_with_output: bool,
    ) {
        let buffer = &mut self.buffers[handle.0 as usize];
        buffer.input_task_usage_count += 1;
        if can_share_with_output && buffer.input_task_for_sharing.is_none() {
            buffer.input_task_for_sharing = Some(task);
        }
    }

    pub fn get_buffer(&self, handle: BufferHandle) -> BufferInfo {
        let buffer = &self.buffers[handle.0 as usize];
        BufferInfo {
            primitive_type: buffer.primitive_type,
            upsample_factor: buffer.upsample_factor,
            byte_count: buffer.byte_count,
            is_constant: buffer.is_constant.load(Ordering::Relaxed),
            memory: buffer.memory,
        }
    }

    /// Runtime state setter; ordering is piggybacked on the task graph's
    /// release/acquire protocol.
    pub fn set_buffer_constant(&self, handle: BufferHandle, is_constant: bool) {
        self.buffers[handle.0 as usize]
            .is_constant
            .store(is_constant, Ordering::Relaxed);
    }

    pub fn add_float_buffer_array(&mut self, count: usize) -> *mut InputFloatBuffer {
        let array = vec![
            InputFloatBuffer {
                sample_count: 0,
                is_constant: false,
                samples: std::ptr::null(),
            };
            count
        ]
        .into_boxed_slice();
        let pointer = array.as_ptr().cast_mut();
        self.input_float_buffer_arrays.push(array);
        pointer
    }

    pub fn add_double_buffer_array(&mut self, count: usize) -> *mut InputDoubleBuffer {
        let array = vec![
            InputDoubleBuffer {
                sample_count: 0,
                is_constant: false,
                samples: std::ptr::null(),
            };
            count
        ]
        .into_boxed_slice();
        let pointer = array.as_ptr().cast_mut();
        self.input_double_buffer_arrays.push(array);
        pointer
    }

    pub fn add_int_buffer_array(&mut self, count: usize) -> *mut InputIntBuffer {
        let array = vec![
            InputIntBuffer {
                sample_count: 0,
                is_constant: false,
                samples: std::ptr::null(),
            };
            count
        ]
        .into_boxed_slice();
        let pointer = array.as_ptr().cast_mut();
        self.input_int_buffer_arrays.push(array);
        pointer
    }

    pub fn add_bool_buffer_array(&mut self, count: usize) -> *mut InputBoolBuffer {
        let array = vec![
            InputBoolBuffer {
                sample_count: 0,
                is_constant: false,
                samples: std::ptr::null(),
            };
            count
        ]
        .into_boxed_slice();
        let pointer = array.as_ptr().cast_mut();
        self.input_bool_buffer_arrays.push(array);
        pointer
    }

    /// Allocates the concurrency matrix. Call after every buffer has been
    /// registered.
    pub fn initialize_buffer_concurrency(&mut self) {
        self.buffer_concurrency_matrix = vec![false; self.buffers.len() * self.buffers.len()];
    }

    /// Marks a pair as simultaneously live, so they may never share memory.
    pub fn set_buffers_concurrent(&mut self, handle_a: BufferHandle, handle_b: BufferHandle) {
        let count = self.buffers.len();
        debug_assert_eq!(self.buffer_concurrency_matrix.len(), count * count);
        self.buffer_concurrency_matrix[handle_a.0 as usize * count + handle_b.0 as usize] = true;
        self.buffer_concurrency_matrix[handle_b.0 as usize * count + handle_a.0 as usize] = true;
    }

    pub fn set_buffer_concurrent_with_all(&mut self, handle: BufferHandle) {
        for other in 0..self.buffers.len() as u32 {
            self.set_buffers_concurrent(handle, BufferHandle(other));
        }
    }

    pub fn are_buffers_concurrent(&self, handle_a: BufferHandle, handle_b: BufferHandle) -> bool {
        self.buffer_concurrency_matrix
            [handle_a.0 as usize * self.buffers.len() + handle_b.0 as usize]
    }

    fn can_buffers_share_memory_within_task(&self, buffer_index_a: usize, buffer_index_b: usize) -> bool {
        let buffer_a = &self.buffers[buffer_index_a];
        let buffer_b = &self.buffers[buffer_index_b];

        // Only share within a task if the iteration step size is identical,
        // i.e. one sample of output is written per sample of input consumed
        primitive_type_bit_count(buffer_a.primitive_type)
            == primitive_type_bit_count(buffer_b.primitive_type)
            && buffer_a.upsample_factor == buffer_b.upsample_factor
    }

    fn can_buffers_share_memory_across_tasks(&self, buffer_index_a: usize, buffer_index_b: usize) -> bool {
        let buffer_a = &self.buffers[buffer_index_a];
        let buffer_b = &self.buffers[buffer_index_b];

        // Note: over-allocating would also work, so this could be relaxed to
        // allow differing sizes; for now require an exact match
        if buffer_a.byte_count != buffer_b.byte_count {
            return false;
        }

        // Memory can be shared as long as the two buffers are never in use
        // at the same time
        !self.buffer_concurrency_matrix[buffer_index_a * self.buffers.len() + buffer_index_b]
    }

    /// Assigns physical memory to every buffer, sharing wherever the sharing
    /// relations permit.
    pub fn allocate_buffers(&mut self) {
        let buffer_count = self.buffers.len();
        let mut group_manager = GroupManager::new(buffer_count);

        // Within-task fusion: collect the input buffers eligible for sharing
        // in each consuming task. A buffer qualifies when it is produced by a
        // task and consumed, shareably, by exactly one task. Buffers not
        // produced by tasks (e.g. graph inputs) can branch in untracked ways
        // and never qualify.
        let mut shareable_task_input_buffers: HashMap<TaskId, Vec<usize>> = HashMap::new();
        for (buffer_index, buffer) in self.buffers.iter().enumerate() {
            if buffer.input_task_usage_count == 1
                && buffer.input_task_for_sharing.is_some()
                && buffer.output_task_for_sharing.is_some()
            {
                shareable_task_input_buffers
                    .entry(buffer.input_task_for_sharing.expect("checked above"))
                    .or_default()
                    .push(buffer_index);
            }
        }

        // Pair each output buffer with at most one eligible input of its
        // producing task
        for buffer_index in 0..buffer_count {
            let Some(output_task) = self.buffers[buffer_index].output_task_for_sharing else {
                continue;
            };
            let Some(shareable_input_buffers) = shareable_task_input_buffers.get_mut(&output_task)
            else {
                continue;
            };

            let mut paired_input = None;
            for (position, &input_buffer_index) in shareable_input_buffers.iter().enumerate() {
                if self.can_buffers_share_memory_within_task(buffer_index, input_buffer_index) {
                    paired_input = Some((position, input_buffer_index));
                    break;
                }
            }
            let Some((position, input_buffer_index)) = paired_input else {
                continue;
            };

            self.buffers[buffer_index].is_shared_as_output = true;
            self.buffers[input_buffer_index].is_shared_as_input = true;

            // An input can be shared at most once per task
            shareable_input_buffers.remove(position);

            let group_index = match group_manager.buffer_group_index(buffer_index) {
                Some(group_index) => group_index,
                None => {
                    let group_index = group_manager.create_group();
                    group_manager.add_buffer_to_group(group_index, buffer_index);
                    group_index
                }
            };
            match group_manager.buffer_group_index(input_buffer_index) {
                None => group_manager.add_buffer_to_group(group_index, input_buffer_index),
                Some(input_group_index) => {
                    group_manager.merge_groups(group_index, input_group_index)
                }
            }
        }

        // Singleton groups for everything unpaired
        for buffer_index in 0..buffer_count {
            if group_manager.buffer_group_index(buffer_index).is_none() {
                let group_index = group_manager.create_group();
                group_manager.add_buffer_to_group(group_index, buffer_index);
            }
        }

        // Across-task reuse: greedily merge each group into the first
        // compatible later group. Merging lower-into-higher lets the merged
        // result be re-examined as iteration continues.
        for group_index in 0..group_manager.group_count() {
            for other_group_index in group_index + 1..group_manager.group_count() {
                if group_manager.can_merge_groups(other_group_index, group_index, |a, b| {
                    self.can_buffers_share_memory_across_tasks(a, b)
                }) {
                    group_manager.merge_groups(other_group_index, group_index);
                    break;
                }
            }
        }

        // Lay out one physical block per non-empty group
        let mut shared_memory_count = 0;
        let mut total_byte_count = 0;
        for group_index in 0..group_manager.group_count() {
            let members = &group_manager.groups[group_index];
            let Some(&first_buffer_index) = members.first() else {
                continue;
            };
            let group_byte_count = self.buffers[first_buffer_index].byte_count;
            for &buffer_index in members {
                assert_eq!(self.buffers[buffer_index].byte_count, group_byte_count);
            }
            debug_assert!(is_aligned_int(group_byte_count, MAX_SIMD_ALIGNMENT));
            total_byte_count += group_byte_count;
            #[cfg(feature = "buffer_guards")]
            {
                total_byte_count += BUFFER_GUARD_BYTE_COUNT;
            }
            shared_memory_count += 1;
        }

        let buffer_memory = AlignedMemory::new(total_byte_count, MAX_SIMD_ALIGNMENT);
        let mut shared_memory_entries = Vec::with_capacity(shared_memory_count);

        let mut total_byte_offset = 0;
        for group_index in 0..group_manager.group_count() {
            let members = &group_manager.groups[group_index];
            let Some(&first_buffer_index) = members.first() else {
                continue;
            };
            let group_byte_count = self.buffers[first_buffer_index].byte_count;
            let memory = if group_byte_count == 0 {
                std::ptr::null_mut()
            } else {
                buffer_memory
                    .offset_ptr(total_byte_offset)
                    .expect("group offset is within the slab")
            };
            let shared_memory_index = shared_memory_entries.len();
            shared_memory_entries.push(SharedBufferMemory {
                memory,
                byte_count: group_byte_count,
                #[cfg(feature = "buffer_guards")]
                write_task: AtomicUsize::new(0),
                #[cfg(feature = "buffer_guards")]
                read_task: AtomicUsize::new(0),
                #[cfg(feature = "buffer_guards")]
                read_count: AtomicUsize::new(0),
            });
            total_byte_offset += group_byte_count;
            #[cfg(feature = "buffer_guards")]
            {
                total_byte_offset += BUFFER_GUARD_BYTE_COUNT;
            }

            for &buffer_index in members {
                let buffer = &mut self.buffers[buffer_index];
                buffer.memory = memory;
                buffer.shared_memory_index = shared_memory_index;
            }
        }

        debug_assert_eq!(total_byte_offset, total_byte_count);
        self.shared_memory_entries = shared_memory_entries;
        self.buffer_memory = Some(buffer_memory);
    }

    /// Index of the shared-memory group backing a buffer. Buffers with equal
    /// indices alias one physical block.
    pub fn buffer_shared_memory_index(&self, handle: BufferHandle) -> usize {
        self.buffers[handle.0 as usize].shared_memory_index
    }

    pub fn shared_memory_count(&self) -> usize {
        self.shared_memory_entries.len()
    }
}

#[cfg(feature = "buffer_guards")]
impl BufferManager {
    /// Records the block's sample count for guard-offset computation.
    pub fn begin_processing(&self, sample_count: usize) {
        self.processing_sample_count
            .store(sample_count, Ordering::Relaxed);
    }

    pub fn end_processing(&self) {
        self.processing_sample_count.store(0, Ordering::Relaxed);
        for shared_memory in &self.shared_memory_entries {
            assert_eq!(shared_memory.write_task.load(Ordering::Relaxed), 0);
            assert_eq!(shared_memory.read_task.load(Ordering::Relaxed), 0);
            assert_eq!(shared_memory.read_count.load(Ordering::Relaxed), 0);
        }
    }

    fn guard_range(&self, buffer: &BufferData, shared_memory: &SharedBufferMemory) -> (usize, usize) {
        let guard_offset = calculate_buffer_byte_count(
            buffer.primitive_type,
            self.processing_sample_count.load(Ordering::Relaxed),
            buffer.upsample_factor,
        );
        (guard_offset, shared_memory.byte_count + BUFFER_GUARD_BYTE_COUNT)
    }

    pub fn start_buffer_write(&self, handle: BufferHandle, task: TaskId) {
        let buffer = &self.buffers[handle.0 as usize];
        if buffer.is_shared_as_output {
            assert_eq!(Some(task), buffer.output_task_for_sharing);
        }

        let shared_memory = &self.shared_memory_entries[buffer.shared_memory_index];
        assert!(
            shared_memory
                .write_task
                .compare_exchange(0, task.0, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        );
        let read_task = shared_memory.read_task.load(Ordering::Relaxed);
        let read_count = shared_memory.read_count.load(Ordering::Relaxed);

        if buffer.is_shared_as_output {
            // The output shares memory with an input of the same task, so
            // that task may be reading it
            assert!(read_task == task.0 || read_task == 0);
            assert!(read_count <= 1);
        } else {
            assert_eq!(read_task, 0);
            assert_eq!(read_count, 0);
        }

        // Fill the trailing guard bytes so over-writes are detectable
        let (guard_offset, guard_end) = self.guard_range(buffer, shared_memory);
        // SAFETY: the guard range lies within this group's slab region.
        unsafe {
            std::ptr::write_bytes(
                shared_memory.memory.add(guard_offset),
                BUFFER_GUARD_MEMORY_BYTE,
                guard_end - guard_offset,
            );
        }
    }

    pub fn finish_buffer_write(&self, handle: BufferHandle, task: TaskId) {
        let buffer = &self.buffers[handle.0 as usize];
        if buffer.is_shared_as_output {
            assert_eq!(Some(task), buffer.output_task_for_sharing);
        }

        let shared_memory = &self.shared_memory_entries[buffer.shared_memory_index];
        assert!(
            shared_memory
                .write_task
                .compare_exchange(task.0, 0, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        );
        let read_task = shared_memory.read_task.load(Ordering::Relaxed);
        let read_count = shared_memory.read_count.load(Ordering::Relaxed);

        if buffer.is_shared_as_output {
            assert!(read_task == task.0 || read_task == 0);
            assert!(read_count <= 1);
        } else {
            assert_eq!(read_task, 0);
            assert_eq!(read_count, 0);
        }

        // The guard bytes must be intact
        let (guard_offset, guard_end) = self.guard_range(buffer, shared_memory);
        for byte_index in guard_offset..guard_end {
            // SAFETY: the guard range lies within this group's slab region.
            let byte = unsafe { *shared_memory.memory.add(byte_index) };
            assert_eq!(byte, BUFFER_GUARD_MEMORY_BYTE, "buffer guard overwrite");
        }
    }

    pub fn start_buffer_read(&self, handle: BufferHandle, task: TaskId) {
        let buffer = &self.buffers[handle.0 as usize];
        if buffer.is_shared_as_input {
            assert_eq!(Some(task), buffer.input_task_for_sharing);
        }

        let shared_memory = &self.shared_memory_entries[buffer.shared_memory_index];
        let write_task = shared_memory.write_task.load(Ordering::Relaxed);
        let old_read_count = shared_memory.read_count.fetch_add(1, Ordering::Relaxed);

        if buffer.is_shared_as_input {
            // The input shares memory with an output of the same task, so
            // that task may be writing it and nothing else may read it
            assert!(write_task == task.0 || write_task == 0);
            assert_eq!(old_read_count, 0);
            assert!(
                shared_memory
                    .read_task
                    .compare_exchange(0, task.0, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            );
        } else {
            // Nothing may be writing it, but it may already be being read
            // (read_task is unused in this case)
            assert_eq!(write_task, 0);
            assert_eq!(shared_memory.read_task.load(Ordering::Relaxed), 0);
        }
    }

    pub fn finish_buffer_read(&self, handle: BufferHandle, task: TaskId) {
        let buffer = &self.buffers[handle.0 as usize];
        if buffer.is_shared_as_input {
            assert_eq!(Some(task), buffer.input_task_for_sharing);
        }

        let shared_memory = &self.shared_memory_entries[buffer.shared_memory_index];
        let write_task = shared_memory.write_task.load(Ordering::Relaxed);
        let old_read_count = shared_memory.read_count.fetch_sub(1, Ordering::Relaxed);
        assert_ne!(old_read_count, 0);

        if buffer.is_shared_as_input {
            assert!(write_task == task.0 || write_task == 0);
            assert_eq!(old_read_count, 1);
            assert!(
                shared_memory
                    .read_task
                    .compare_exchange(task.0, 0, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            );
        } else {
            assert_eq!(write_task, 0);
            assert_eq!(shared_memory.read_task.load(Ordering::Relaxed), 0);
        }
    }
}

#[cfg(not(feature = "buffer_guards"))]
impl BufferManager {
    #[inline(always)]
    pub fn begin_processing(&self, _sample_count: usize) {}

    #[inline(always)]
    pub fn end_processing(&self) {}

    #[inline(always)]
    pub fn start_buffer_write(&self, _handle: BufferHandle, _task: TaskId) {}

    #[inline(always)]
    pub fn finish_buffer_write(&self, _handle: BufferHandle, _task: TaskId) {}

    #[inline(always)]
    pub fn start_buffer_read(&self, _handle: BufferHandle, _task: TaskId) {}

    #[inline(always)]
    pub fn finish_buffer_read(&self, _handle: BufferHandle, _task: TaskId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_counts_round_up_to_simd_alignment() {
        assert_eq!(calculate_buffer_byte_count(PrimitiveType::Float, 128, 1), 512);
        assert_eq!(calculate_buffer_byte_count(PrimitiveType::Float, 1, 1), 64);
        assert_eq!(calculate_buffer_byte_count(PrimitiveType::Double, 128, 2), 2048);
        // 128 bool samples pack into 16 bytes, aligned up
        assert_eq!(calculate_buffer_byte_count(PrimitiveType::Bool, 128, 1), 64);
        assert_eq!(calculate_buffer_byte_count(PrimitiveType::Bool, 1, 1), 64);
        assert_eq!(calculate_buffer_byte_count(PrimitiveType::Int, 0, 1), 0);
    }

    #[test]
    fn constant_state_is_runtime_mutable() {
        let mut manager = BufferManager::new();
        let handle = manager.add_buffer(PrimitiveType::Float, 64, 1);
        manager.initialize_buffer_concurrency();
        manager.allocate_buffers();

        assert!(!manager.get_buffer(handle).is_constant);
        manager.set_buffer_constant(handle, true);
        assert!(manager.get_buffer(handle).is_constant);
    }
}
