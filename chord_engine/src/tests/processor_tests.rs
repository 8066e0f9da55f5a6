//! End-to-end processing through the program processor.

use std::sync::Arc;

use chord_native::NativeLibraryRegistry;

use crate::executor::{TaskExecutor, TaskExecutorSettings};
use crate::processor::{
    InputChannelBuffer, OutputChannelBuffer, ProgramProcessor, ProgramProcessorSettings,
    VoiceTrigger,
};
use crate::program::Program;
use crate::tests::utils::{
    add_constant_library, add_constant_voice_program, constant_voice_program, effect_program,
};

const BLOCK: usize = 64;

fn make_processor(program_bytes: &[u8], registry: NativeLibraryRegistry) -> ProgramProcessor {
    let executor = Arc::new(TaskExecutor::new(&TaskExecutorSettings {
        thread_count: 4,
        ..Default::default()
    }));
    let program = Program::deserialize(program_bytes).expect("program loads");
    ProgramProcessor::new(
        executor,
        Arc::new(registry),
        &program,
        &ProgramProcessorSettings {
            buffer_sample_count: BLOCK,
        },
        Arc::new(|severity, message| panic!("unexpected report: {severity:?} {message}")),
    )
}

fn empty_registry() -> NativeLibraryRegistry {
    NativeLibraryRegistry::with_libraries(Vec::<&chord_native::NativeLibrary>::new())
}

fn trigger(sample_index: usize) -> VoiceTrigger {
    VoiceTrigger { sample_index }
}

#[test]
fn constant_voices_sum_on_the_fast_path() {
    let mut processor = make_processor(&constant_voice_program(1.5, 2), empty_registry());

    let mut samples = vec![0.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[trigger(0), trigger(0)]);

    // Two active voices, both constant 1.5, both at offset zero
    assert!(samples.iter().all(|&sample| sample == 3.0));
    assert_eq!(processor.active_voice_count(), 2);

    // Voices persist into the next block without new triggers
    let mut samples = vec![0.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[]);
    assert!(samples.iter().all(|&sample| sample == 3.0));
}

#[test]
fn triggered_voice_starts_at_its_sample_offset() {
    let mut processor = make_processor(&constant_voice_program(1.5, 2), empty_registry());

    let mut samples = vec![9.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[trigger(8)]);

    assert!(samples[..8].iter().all(|&sample| sample == 0.0));
    assert!(samples[8..].iter().all(|&sample| sample == 1.5));
}

#[test]
fn no_active_voices_produce_silence() {
    let mut processor = make_processor(&constant_voice_program(1.5, 2), empty_registry());

    let mut samples = vec![7.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[]);
    assert!(samples.iter().all(|&sample| sample == 0.0));
}

#[test]
fn zero_sample_block_leaves_outputs_unchanged() {
    let mut processor = make_processor(&constant_voice_program(1.5, 2), empty_registry());

    let mut samples = vec![7.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(0, &[], &mut outputs, &[]);
    assert!(samples.iter().all(|&sample| sample == 7.0));
}

#[test]
fn native_module_processes_input_channels() {
    let library = add_constant_library();
    let registry = NativeLibraryRegistry::with_libraries([&library.library]);
    let mut processor = make_processor(&add_constant_voice_program(2.0, 1), registry);

    let input = vec![0.25f32; BLOCK];
    let mut samples = vec![0.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(
        BLOCK,
        &[InputChannelBuffer::Float32(&input)],
        &mut outputs,
        &[trigger(0)],
    );

    assert!(samples.iter().all(|&sample| sample == 2.25));
}

#[test]
fn double_output_channels_convert_from_float_sources() {
    let mut processor = make_processor(&constant_voice_program(0.5, 2), empty_registry());

    let mut samples = vec![0.0f64; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float64(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[trigger(0)]);
    assert!(samples.iter().all(|&sample| sample == 0.5));
}

#[test]
fn effect_stage_processes_accumulated_voices() {
    let library = add_constant_library();
    let registry = NativeLibraryRegistry::with_libraries([&library.library]);
    let mut processor = make_processor(&effect_program(1.5, 1.0, 2), registry);

    let mut samples = vec![0.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[trigger(0), trigger(0)]);

    // Two constant voices accumulate to 3.0; the effect adds 1.0
    assert!(samples.iter().all(|&sample| sample == 4.0));
}

#[test]
fn always_active_effect_runs_without_voices() {
    let library = add_constant_library();
    let registry = NativeLibraryRegistry::with_libraries([&library.library]);
    let mut processor = make_processor(&effect_program(1.5, 1.0, 2), registry);

    let mut samples = vec![0.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[]);

    // The voice sum is a constant zero; the effect still adds its offset
    assert!(samples.iter().all(|&sample| sample == 1.0));
}

#[test]
fn oldest_voice_recycles_when_all_slots_are_busy() {
    let mut processor = make_processor(&constant_voice_program(1.0, 2), empty_registry());

    let mut samples = vec![0.0f32; BLOCK];
    let mut outputs = [OutputChannelBuffer::Float32(&mut samples)];
    processor.process(BLOCK, &[], &mut outputs, &[trigger(0), trigger(0), trigger(0)]);

    // Three triggers into two slots: still two active voices
    assert_eq!(processor.active_voice_count(), 2);
    assert!(samples.iter().all(|&sample| sample == 2.0));
}
