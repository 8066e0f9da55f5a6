#![allow(clippy::new_without_default)]
//! # Chord Engine
//!
//! Runtime execution machinery for pre-compiled Chord programs. A program
//! encodes a directed acyclic graph of native-module calls plus constants,
//! arrays, channel I/O and voice/effect separation. The engine loads the
//! program, lays out buffer memory with maximal sharing, and executes the
//! graph every audio block across a fixed pool of worker threads.
//!
//! The top-level entry point is [`processor::ProgramProcessor`]; everything
//! else is the machinery underneath it:
//!
//! - [`program`]: the on-disk codec and the immutable program graph
//! - [`buffers`]: logical buffers and the memory-sharing allocator
//! - [`executor`] and [`task_graph`]: the work-stealing worker pool and the
//!   static dependency graph driving each block
//! - [`stage`]: wires one voice or effect stage into executable tasks
//! - [`voice_allocator`] and [`accumulate`]: voice slot management and
//!   per-block output summation
//!
//! All memory is provisioned at construction; the per-block path performs no
//! heap allocation.

pub mod accumulate;
pub mod buffers;
pub mod constants;
pub mod executor;
pub mod graph;
pub mod processor;
pub mod program;
pub mod reader;
pub mod stage;
pub mod task_graph;
pub mod voice_allocator;

#[cfg(test)]
mod tests;
