//! Deduplicated storage for constant values handed to native modules.
//!
//! Identical constant arrays share an allocation, identical strings share a
//! code-point array, and identical constant-fill buffers (one per primitive
//! and value) share a SIMD-aligned memory block. The manager retains
//! ownership of all deduplicated storage; returned pointers are stable for
//! its lifetime.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use chord_native::{
    InputBoolBuffer, InputBoolConstantArray, InputDoubleBuffer, InputDoubleConstantArray,
    InputFloatBuffer, InputFloatConstantArray, InputIntBuffer, InputIntConstantArray, InputString,
    InputStringConstantArray,
};
use chord_primitives::{AlignedMemory, MAX_SIMD_ALIGNMENT};

use crate::graph::{ProcessorNodeRef, ProgramGraph};

/// Hashable element of a constant array. Floats hash by bit pattern; the
/// bucket's linear re-check resolves collisions, so bitwise equality is all
/// that's needed.
trait ArrayElement: Copy + PartialEq {
    fn write_hash(&self, hasher: &mut DefaultHasher);
}

impl ArrayElement for f32 {
    fn write_hash(&self, hasher: &mut DefaultHasher) {
        self.to_bits().hash(hasher);
    }
}

impl ArrayElement for f64 {
    fn write_hash(&self, hasher: &mut DefaultHasher) {
        self.to_bits().hash(hasher);
    }
}

impl ArrayElement for i32 {
    fn write_hash(&self, hasher: &mut DefaultHasher) {
        self.hash(hasher);
    }
}

impl ArrayElement for bool {
    fn write_hash(&self, hasher: &mut DefaultHasher) {
        self.hash(hasher);
    }
}

/// Per-hash candidate lists. Multiple distinct arrays may share a hash, so
/// each bucket is re-checked linearly.
type ArrayBuckets<T> = HashMap<u64, Vec<Box<[T]>>>;

fn hash_elements<T: ArrayElement>(elements: &[T]) -> u64 {
    let mut hasher = DefaultHasher::new();
    elements.len().hash(&mut hasher);
    for element in elements {
        element.write_hash(&mut hasher);
    }
    hasher.finish()
}

fn ensure_array<T: ArrayElement>(buckets: &mut ArrayBuckets<T>, elements: Vec<T>) -> (*const T, usize) {
    let key = hash_elements(&elements);
    let candidates = buckets.entry(key).or_default();

    for existing in candidates.iter() {
        if existing.as_ref() == elements.as_slice() {
            return (existing.as_ptr(), existing.len());
        }
    }

    let new_array = elements.into_boxed_slice();
    let result = (new_array.as_ptr(), new_array.len());
    candidates.push(new_array);
    result
}

pub struct ConstantManager {
    strings: HashMap<u64, Vec<Box<[u32]>>>,
    float_constant_arrays: ArrayBuckets<f32>,
    double_constant_arrays: ArrayBuckets<f64>,
    int_constant_arrays: ArrayBuckets<i32>,
    bool_constant_arrays: ArrayBuckets<bool>,
    string_constant_arrays: HashMap<u64, Vec<Box<[InputString]>>>,
    constant_float_buffer_memory: HashMap<u32, AlignedMemory>,
    constant_double_buffer_memory: HashMap<u64, AlignedMemory>,
    constant_int_buffer_memory: HashMap<i32, AlignedMemory>,
    constant_bool_buffer_memory: HashMap<bool, AlignedMemory>,
}

// SAFETY: the manager's raw pointers reference its own heap allocations,
// which are stable and immutable once created.
unsafe impl Send for ConstantManager {}
unsafe impl Sync for ConstantManager {}

impl ConstantManager {
    pub fn new() -> Self {
        Self {
            strings: HashMap::new(),
            float_constant_arrays: HashMap::new(),
            double_constant_arrays: HashMap::new(),
            int_constant_arrays: HashMap::new(),
            bool_constant_arrays: HashMap::new(),
            string_constant_arrays: HashMap::new(),
            constant_float_buffer_memory: HashMap::new(),
            constant_double_buffer_memory: HashMap::new(),
            constant_int_buffer_memory: HashMap::new(),
            constant_bool_buffer_memory: HashMap::new(),
        }
    }

    /// Interns a UTF-32 string. The returned pointer is stable across the
    /// manager's lifetime.
    pub fn ensure_string(&mut self, code_points: &[u32]) -> InputString {
        let mut hasher = DefaultHasher::new();
        code_points.hash(&mut hasher);
        let candidates = self.strings.entry(hasher.finish()).or_default();

        for existing in candidates.iter() {
            if existing.as_ref() == code_points {
                return InputString {
                    value: existing.as_ptr(),
                    length: existing.len(),
                };
            }
        }

        let new_string: Box<[u32]> = code_points.into();
        let result = InputString {
            value: new_string.as_ptr(),
            length: new_string.len(),
        };
        candidates.push(new_string);
        result
    }

    pub fn ensure_float_constant_array(
        &mut self,
        graph: &ProgramGraph,
        array_node: ProcessorNodeRef,
    ) -> InputFloatConstantArray {
        let values = collect_array_values(graph, array_node, |graph, node| {
            graph.float_constant_node(node).value
        });
        let (elements, count) = ensure_array(&mut self.float_constant_arrays, values);
        InputFloatConstantArray { elements, count }
    }

    pub fn ensure_double_constant_array(
        &mut self,
        graph: &ProgramGraph,
        array_node: ProcessorNodeRef,
    ) -> InputDoubleConstantArray {
        let values = collect_array_values(graph, array_node, |graph, node| {
            graph.double_constant_node(node).value
        });
        let (elements, count) = ensure_array(&mut self.double_constant_arrays, values);
        InputDoubleConstantArray { elements, count }
    }

    pub fn ensure_int_constant_array(
        &mut self,
        graph: &ProgramGraph,
        array_node: ProcessorNodeRef,
    ) -> InputIntConstantArray {
        let values = collect_array_values(graph, array_node, |graph, node| {
            graph.int_constant_node(node).value
        });
        let (elements, count) = ensure_array(&mut self.int_constant_arrays, values);
        InputIntConstantArray { elements, count }
    }

    pub fn ensure_bool_constant_array(
        &mut self,
        graph: &ProgramGraph,
        array_node: ProcessorNodeRef,
    ) -> InputBoolConstantArray {
        let values = collect_array_values(graph, array_node, |graph, node| {
            graph.bool_constant_node(node).value
        });
        let (elements, count) = ensure_array(&mut self.bool_constant_arrays, values);
        InputBoolConstantArray { elements, count }
    }

    /// Strings need extra logic: elements intern through [`Self::ensure_string`]
    /// first, then the array of interned descriptors is itself deduplicated.
    pub fn ensure_string_constant_array(
        &mut self,
        graph: &ProgramGraph,
        array_node: ProcessorNodeRef,
    ) -> InputStringConstantArray {
        let node = graph.array_node(array_node);
        let mut hasher = DefaultHasher::new();
        node.elements.len().hash(&mut hasher);
        let mut elements = Vec::with_capacity(node.elements.len());
        for &element in &node.elements {
            let connection = graph.input_node(element).connection();
            let processor = graph.output_node(connection).processor();
            let value = &graph.string_constant_node(processor).value;
            value.hash(&mut hasher);
            elements.push(self.ensure_string(value));
        }

        let candidates = self.string_constant_arrays.entry(hasher.finish()).or_default();
        for existing in candidates.iter() {
            // Interning makes equal strings pointer-identical
            if existing.len() == elements.len()
                && existing
                    .iter()
                    .zip(&elements)
                    .all(|(a, b)| a.value == b.value && a.length == b.length)
            {
                return InputStringConstantArray {
                    elements: existing.as_ptr(),
                    count: existing.len(),
                };
            }
        }

        let new_array = elements.into_boxed_slice();
        let result = InputStringConstantArray {
            elements: new_array.as_ptr(),
            count: new_array.len(),
        };
        candidates.push(new_array);
        result
    }

    /// A constant-fill buffer: a SIMD-aligned block containing the value
    /// replicated enough for any upsampled constant access.
    pub fn ensure_float_constant_buffer(&mut self, value: f32) -> InputFloatBuffer {
        let memory = self
            .constant_float_buffer_memory
            .entry(value.to_bits())
            .or_insert_with(|| fill_constant_memory(&value.to_ne_bytes()));
        InputFloatBuffer {
            sample_count: 0,
            is_constant: true,
            samples: memory.as_ptr().cast(),
        }
    }

    pub fn ensure_double_constant_buffer(&mut self, value: f64) -> InputDoubleBuffer {
        let memory = self
            .constant_double_buffer_memory
            .entry(value.to_bits())
            .or_insert_with(|| fill_constant_memory(&value.to_ne_bytes()));
        InputDoubleBuffer {
            sample_count: 0,
            is_constant: true,
            samples: memory.as_ptr().cast(),
        }
    }

    pub fn ensure_int_constant_buffer(&mut self, value: i32) -> InputIntBuffer {
        let memory = self
            .constant_int_buffer_memory
            .entry(value)
            .or_insert_with(|| fill_constant_memory(&value.to_ne_bytes()));
        InputIntBuffer {
            sample_count: 0,
            is_constant: true,
            samples: memory.as_ptr().cast(),
        }
    }

    /// Bool constants fill whole words: all-ones for true so any bit read
    /// yields the value.
    pub fn ensure_bool_constant_buffer(&mut self, value: bool) -> InputBoolBuffer {
        let memory = self
            .constant_bool_buffer_memory
            .entry(value)
            .or_insert_with(|| fill_constant_memory(&[if value { 0xff } else { 0x00 }]));
        InputBoolBuffer {
            sample_count: 0,
            is_constant: true,
            samples: memory.as_ptr().cast(),
        }
    }
}

fn collect_array_values<T>(
    graph: &ProgramGraph,
    array_node: ProcessorNodeRef,
    value_of: impl Fn(&ProgramGraph, ProcessorNodeRef) -> T,
) -> Vec<T> {
    let node = graph.array_node(array_node);
    node.elements
        .iter()
        .map(|&element| {
            let connection = graph.input_node(element).connection();
            value_of(graph, graph.output_node(connection).processor())
        })
        .collect()
}

fn fill_constant_memory(pattern: &[u8]) -> AlignedMemory {
    let memory = AlignedMemory::new(MAX_SIMD_ALIGNMENT, MAX_SIMD_ALIGNMENT);
    // SAFETY: freshly allocated, no other access yet.
    let bytes = unsafe { memory.as_slice_mut() };
    for chunk in bytes.chunks_exact_mut(pattern.len()) {
        chunk.copy_from_slice(pattern);
    }
    memory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_interned() {
        let mut manager = ConstantManager::new();
        let a = manager.ensure_string(&[104, 105]);
        let b = manager.ensure_string(&[104, 105]);
        let c = manager.ensure_string(&[104, 111]);
        assert_eq!(a.value, b.value);
        assert_eq!(a.length, 2);
        assert_ne!(a.value, c.value);
    }

    #[test]
    fn constant_buffers_share_memory_per_value() {
        let mut manager = ConstantManager::new();
        let a = manager.ensure_float_constant_buffer(1.5);
        let b = manager.ensure_float_constant_buffer(1.5);
        let c = manager.ensure_float_constant_buffer(2.5);
        assert_eq!(a.samples, b.samples);
        assert_ne!(a.samples, c.samples);
        assert!(a.is_constant);
        assert_eq!(a.sample_count, 0);

        // The replicated value covers the whole SIMD-aligned block
        let values =
            unsafe { std::slice::from_raw_parts(a.samples, MAX_SIMD_ALIGNMENT / size_of::<f32>()) };
        assert!(values.iter().all(|&v| v == 1.5));
    }

    #[test]
    fn bool_constant_buffers_fill_whole_words() {
        let mut manager = ConstantManager::new();
        let buffer = manager.ensure_bool_constant_buffer(true);
        let word = unsafe { *buffer.samples };
        assert_eq!(word, -1);
    }
}
