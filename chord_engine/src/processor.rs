//! Top-level per-block orchestration.
//!
//! Construction wires the whole pipeline: host input buffers → per-voice
//! stages → voice-to-effect accumulation → effect stage → output-channel
//! conversion, declares cross-stage buffer concurrency, allocates buffer
//! memory, and builds the static task graph that drives each block. All
//! memory is provisioned here; `process` performs no heap allocation.

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};

use chord_native::{NativeLibraryRegistry, PrimitiveType, ReportingSeverity};
use chord_primitives::AlignedMemory;

use crate::accumulate;
use crate::buffers::{BufferHandle, BufferManager, TaskId};
use crate::constants::ConstantManager;
use crate::executor::TaskExecutor;
use crate::graph::ProcessorNodeRef;
use crate::program::{EffectActivationMode, InstrumentProperties, Program};
use crate::stage::{BufferOrConstant, ProgramStageTaskManager, ReportHandler, ScratchSlice};
use crate::task_graph::{StaticTaskGraph, TaskCompleter};
use crate::voice_allocator::{ActivatedVoice, VoiceAllocator};

/// One host-provided input channel for a block.
pub enum InputChannelBuffer<'a> {
    Float32(&'a [f32]),
    Float64(&'a [f64]),
}

/// One host output channel, receiving processed samples.
pub enum OutputChannelBuffer<'a> {
    Float32(&'a mut [f32]),
    Float64(&'a mut [f64]),
}

/// A voice trigger event, sample-accurate within the block.
#[derive(Clone, Copy, Debug)]
pub struct VoiceTrigger {
    pub sample_index: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct ProgramProcessorSettings {
    /// Maximum samples per block; every buffer is sized for this.
    pub buffer_sample_count: usize,
}

/// Callback receiving warnings and errors from native modules, forwarded to
/// the host.
pub type ProcessorReportHandler = Arc<dyn Fn(ReportingSeverity, &str) + Send + Sync>;

/// Where an output channel's samples come from.
#[derive(Clone, Copy)]
enum OutputSource {
    /// Output `index` of the effect stage.
    Effect(usize),
    /// A direct voice-sum accumulation buffer.
    VoiceAccumulation(BufferHandle),
    /// No stage feeds this channel; it is zero-filled.
    Silence,
}

struct EffectData {
    stage: ProgramStageTaskManager,
    voice_to_effect_buffers: Vec<BufferHandle>,
}

/// Per-block state written on the host thread before the task graph runs
/// and read by tasks while it runs.
struct BlockData {
    sample_count: usize,
    inputs: *const InputChannelBuffer<'static>,
    input_count: usize,
    outputs: *mut OutputChannelBuffer<'static>,
    output_count: usize,
    /// Active voices this block, oldest first.
    active_voices: Vec<usize>,
    /// Trigger offset per voice slot; zero for voices active before the
    /// block.
    voice_sample_offsets: Vec<usize>,
    activated_voices: Vec<ActivatedVoice>,
    deactivated_voices: Vec<usize>,
    effect_should_be_active: bool,
}

struct ProcessorCore {
    executor: Arc<TaskExecutor>,
    // Keeps the native module descriptors the stages point into alive
    _registry: Arc<NativeLibraryRegistry>,
    buffer_manager: BufferManager,
    // Stages hold pointers into the constant manager's storage
    _constant_manager: ConstantManager,
    buffer_sample_count: usize,
    instrument: InstrumentProperties,
    voices: Vec<ProgramStageTaskManager>,
    effect: Option<EffectData>,
    voice_allocator: Mutex<VoiceAllocator>,
    input_channel_buffers_float: Option<Vec<BufferHandle>>,
    input_channel_buffers_double: Option<Vec<BufferHandle>>,
    output_sources: Vec<OutputSource>,
    block: UnsafeCell<BlockData>,
    task_graph: StaticTaskGraph,
    _scratch_allocations: Vec<AlignedMemory>,
    thread_scratch: Vec<ScratchSlice>,
}

// SAFETY: the per-block cell is written by the host thread strictly before
// the task graph runs and read by tasks strictly before it completes; the
// host blocks until the graph drains before touching it again.
unsafe impl Send for ProcessorCore {}
unsafe impl Sync for ProcessorCore {}

/// Pointer to the pinned processor core, captured by task-graph closures.
#[derive(Clone, Copy)]
struct CorePtr(*const ProcessorCore);

// SAFETY: the core is boxed (address-stable) and outlives the task graph
// that holds these pointers.
unsafe impl Send for CorePtr {}
unsafe impl Sync for CorePtr {}

impl CorePtr {
    fn get(&self) -> &ProcessorCore {
        // SAFETY: see the Send/Sync justification above.
        unsafe { &*self.0 }
    }
}

/// Executes a loaded program block by block.
pub struct ProgramProcessor {
    core: Box<ProcessorCore>,
}

// SAFETY: the core is heap-pinned; moving the processor between blocks does
// not move it.
unsafe impl Send for ProgramProcessor {}

impl ProgramProcessor {
    pub fn new(
        executor: Arc<TaskExecutor>,
        registry: Arc<NativeLibraryRegistry>,
        program: &Program,
        settings: &ProgramProcessorSettings,
        report_handler: ProcessorReportHandler,
    ) -> Self {
        assert!(settings.buffer_sample_count > 0);
        let buffer_sample_count = settings.buffer_sample_count;

        let graph = program.graph();
        let variant = program.variant_properties();
        let instrument = *program.instrument_properties();
        let input_channel_count = variant.input_channel_count as usize;
        let output_channel_count = variant.output_channel_count as usize;

        let mut buffer_manager = BufferManager::new();
        let mut constant_manager = ConstantManager::new();

        // Host-facing input buffers, shared by every stage
        let input_channel_buffers_float = graph.input_channels_float.as_ref().map(|_| {
            (0..input_channel_count)
                .map(|_| buffer_manager.add_buffer(PrimitiveType::Float, buffer_sample_count, 1))
                .collect::<Vec<_>>()
        });
        let input_channel_buffers_double = graph.input_channels_double.as_ref().map(|_| {
            (0..input_channel_count)
                .map(|_| buffer_manager.add_buffer(PrimitiveType::Double, buffer_sample_count, 1))
                .collect::<Vec<_>>()
        });

        let stage_reporter = |handler: &ProcessorReportHandler| -> ReportHandler {
            let handler = handler.clone();
            Box::new(move |severity, message| handler(severity, message))
        };

        // One stage per voice slot
        let mut voices = Vec::new();
        if let Some(voice_graph) = &graph.voice_graph {
            let root_nodes = graph.find_graph_root_nodes(voice_graph);
            let native_module_call_node_count = count_native_module_calls(graph, &root_nodes);
            for _ in 0..instrument.max_voices {
                voices.push(ProgramStageTaskManager::new(
                    &registry,
                    stage_reporter(&report_handler),
                    program,
                    true,
                    &mut constant_manager,
                    &mut buffer_manager,
                    buffer_sample_count,
                    input_channel_buffers_float.as_deref(),
                    input_channel_buffers_double.as_deref(),
                    None,
                    native_module_call_node_count,
                    &root_nodes,
                ));
            }
        }

        // The effect stage plus its accumulation buffers
        let effect = graph.effect_graph.as_ref().map(|effect_graph| {
            let voice_to_effect_buffers: Vec<BufferHandle> = graph
                .voice_to_effect_primitive_types
                .iter()
                .map(|&primitive_type| {
                    buffer_manager.add_buffer(primitive_type, buffer_sample_count, 1)
                })
                .collect();

            let root_nodes = graph.find_graph_root_nodes(effect_graph);
            let native_module_call_node_count = count_native_module_calls(graph, &root_nodes);
            let stage = ProgramStageTaskManager::new(
                &registry,
                stage_reporter(&report_handler),
                program,
                false,
                &mut constant_manager,
                &mut buffer_manager,
                buffer_sample_count,
                input_channel_buffers_float.as_deref(),
                input_channel_buffers_double.as_deref(),
                Some(&voice_to_effect_buffers),
                native_module_call_node_count,
                &root_nodes,
            );

            EffectData {
                stage,
                voice_to_effect_buffers,
            }
        });

        // Without an effect, per-channel accumulation buffers receive the
        // direct voice sums
        let mut voice_accumulation_buffers: Vec<BufferHandle> = Vec::new();
        if effect.is_none() && !voices.is_empty() {
            for output_index in 0..output_channel_count {
                let primitive_type = match voices[0].resolved_output(output_index) {
                    BufferOrConstant::Buffer(handle) => {
                        buffer_manager.get_buffer(handle).primitive_type
                    }
                    BufferOrConstant::Float(_) => PrimitiveType::Float,
                    BufferOrConstant::Double(_) => PrimitiveType::Double,
                    _ => panic!("output channels must be float or double"),
                };
                voice_accumulation_buffers.push(buffer_manager.add_buffer(
                    primitive_type,
                    buffer_sample_count,
                    1,
                ));
            }
        }

        let output_sources: Vec<OutputSource> = (0..output_channel_count)
            .map(|output_index| {
                if effect.is_some() {
                    OutputSource::Effect(output_index)
                } else if !voices.is_empty() {
                    OutputSource::VoiceAccumulation(voice_accumulation_buffers[output_index])
                } else {
                    OutputSource::Silence
                }
            })
            .collect();

        // Declare cross-stage concurrency, then assign physical memory
        buffer_manager.initialize_buffer_concurrency();

        if let Some(handles) = &input_channel_buffers_float {
            for &handle in handles {
                buffer_manager.set_buffer_concurrent_with_all(handle);
            }
        }
        if let Some(handles) = &input_channel_buffers_double {
            for &handle in handles {
                buffer_manager.set_buffer_concurrent_with_all(handle);
            }
        }

        let voice_graph_nodes: &[ProcessorNodeRef] =
            graph.voice_graph.as_deref().unwrap_or(&[]);
        for (voice_index, voice) in voices.iter().enumerate() {
            voice.declare_buffer_concurrency(&mut buffer_manager, graph, voice_graph_nodes);
            for other_voice in &voices[voice_index + 1..] {
                voice.declare_buffer_concurrency_with_other(&mut buffer_manager, other_voice);
            }
        }

        if let Some(effect_data) = &effect {
            let effect_graph_nodes: &[ProcessorNodeRef] =
                graph.effect_graph.as_deref().unwrap_or(&[]);
            effect_data
                .stage
                .declare_buffer_concurrency(&mut buffer_manager, graph, effect_graph_nodes);
            for voice in &voices {
                voice.declare_buffer_concurrency_with_other(&mut buffer_manager, &effect_data.stage);
            }

            // Accumulation buffers are concurrent with each other and with
            // each voice's corresponding output buffer
            declare_accumulation_concurrency(
                &mut buffer_manager,
                &voices,
                &effect_data.voice_to_effect_buffers,
            );
        }
        if !voice_accumulation_buffers.is_empty() {
            declare_accumulation_concurrency(
                &mut buffer_manager,
                &voices,
                &voice_accumulation_buffers,
            );
        }

        buffer_manager.allocate_buffers();
        log::debug!(
            "allocated {} shared memory groups for {} buffers ({} voices, effect: {})",
            buffer_manager.shared_memory_count(),
            buffer_manager.buffer_count(),
            voices.len(),
            effect.is_some(),
        );

        // Per-thread scratch memory, sized for the widest stage requirement
        let mut scratch_size = 0;
        let mut scratch_alignment = chord_primitives::MAX_SIMD_ALIGNMENT;
        for stage in voices.iter().chain(effect.as_ref().map(|e| &e.stage)) {
            let requirement = stage.scratch_memory_requirement();
            scratch_size = scratch_size.max(requirement.size);
            scratch_alignment = scratch_alignment.max(requirement.alignment);
        }
        let mut scratch_allocations = Vec::with_capacity(executor.thread_count());
        let mut thread_scratch = Vec::with_capacity(executor.thread_count());
        for _ in 0..executor.thread_count() {
            let allocation = AlignedMemory::new(scratch_size, scratch_alignment);
            thread_scratch.push(ScratchSlice {
                ptr: allocation.as_mut_ptr(),
                len: allocation.len(),
            });
            scratch_allocations.push(allocation);
        }

        let max_voices = instrument.max_voices as usize;
        let has_voices = !voices.is_empty();
        let has_effect = effect.is_some();
        let voice_to_effect_count = effect
            .as_ref()
            .map_or(0, |effect_data| effect_data.voice_to_effect_buffers.len());

        let mut core = Box::new(ProcessorCore {
            executor,
            _registry: registry,
            buffer_manager,
            _constant_manager: constant_manager,
            buffer_sample_count,
            instrument,
            voices,
            effect,
            voice_allocator: Mutex::new(VoiceAllocator::new(max_voices)),
            input_channel_buffers_float,
            input_channel_buffers_double,
            output_sources,
            block: UnsafeCell::new(BlockData {
                sample_count: 0,
                inputs: std::ptr::null(),
                input_count: 0,
                outputs: std::ptr::null_mut(),
                output_count: 0,
                active_voices: Vec::with_capacity(max_voices),
                voice_sample_offsets: vec![0; max_voices],
                activated_voices: Vec::with_capacity(max_voices),
                deactivated_voices: Vec::with_capacity(max_voices),
                effect_should_be_active: false,
            }),
            task_graph: StaticTaskGraph::new(),
            _scratch_allocations: scratch_allocations,
            thread_scratch,
        });

        // The core is now pinned, so the task graph's closures can capture
        // its address
        let core_ptr = CorePtr(std::ptr::from_ref(core.as_ref()));
        core.task_graph = build_task_graph(
            core_ptr,
            has_voices,
            max_voices,
            has_effect,
            voice_to_effect_count,
            output_channel_count,
        );

        Self { core }
    }

    /// Runs one audio block. Returns when every output channel has been
    /// written.
    pub fn process(
        &mut self,
        sample_count: usize,
        inputs: &[InputChannelBuffer<'_>],
        outputs: &mut [OutputChannelBuffer<'_>],
        voice_triggers: &[VoiceTrigger],
    ) {
        // Only shared access to the core from here on: the task graph holds
        // raw pointers into it for the duration of the run
        let core = self.core.as_ref();
        assert!(sample_count <= core.buffer_sample_count);
        assert_eq!(outputs.len(), core.output_sources.len());
        let input_channel_count = core
            .input_channel_buffers_float
            .as_ref()
            .map_or(0, Vec::len)
            .max(core.input_channel_buffers_double.as_ref().map_or(0, Vec::len));
        assert!(inputs.len() >= input_channel_count);
        if sample_count == 0 {
            return;
        }

        let has_voices = !core.voices.is_empty();
        let effect_was_active = core
            .effect
            .as_ref()
            .is_some_and(|effect| effect.stage.is_active());

        // Allocate voice slots for this block's triggers
        {
            let mut allocator = core.voice_allocator.lock().expect("voice allocator mutex");
            allocator.begin_block_voice_allocation();
            if has_voices {
                for trigger in voice_triggers {
                    debug_assert!(trigger.sample_index < sample_count);
                    allocator.trigger_voice(trigger.sample_index);
                }
            }

            // Snapshot the block state for the worker tasks
            // SAFETY: no block is in flight, so the host thread has
            // exclusive access to the cell.
            let block = unsafe { &mut *core.block.get() };
            block.sample_count = sample_count;
            block.inputs = inputs.as_ptr() as *const InputChannelBuffer<'static>;
            block.input_count = inputs.len();
            block.outputs = outputs.as_mut_ptr() as *mut OutputChannelBuffer<'static>;
            block.output_count = outputs.len();
            block.active_voices.clear();
            block
                .active_voices
                .extend_from_slice(allocator.active_voice_indices());
            block.activated_voices.clear();
            block
                .activated_voices
                .extend_from_slice(allocator.activated_voices());
            block.deactivated_voices.clear();
            block
                .deactivated_voices
                .extend_from_slice(allocator.deactivated_voice_indices());
            block.voice_sample_offsets.fill(0);
            for activated in &block.activated_voices {
                block.voice_sample_offsets[activated.voice_index] = activated.sample_index;
            }

            block.effect_should_be_active = match &core.effect {
                None => false,
                Some(_) => match core.instrument.effect_activation_mode {
                    EffectActivationMode::Always => true,
                    EffectActivationMode::Threshold => {
                        effect_was_active
                            || !block.active_voices.is_empty()
                            || inputs.iter().any(|input| {
                                accumulate::should_activate_effect(
                                    input,
                                    core.instrument.effect_activation_threshold,
                                    sample_count,
                                )
                            })
                    }
                },
            };
        }

        core.buffer_manager.begin_processing(sample_count);
        core.task_graph.run_and_wait(&core.executor);
        core.buffer_manager.end_processing();

        // Retire voices and the effect based on their remain-active outputs
        {
            // SAFETY: the task graph has drained; the host thread has
            // exclusive access again.
            let block = unsafe { &mut *core.block.get() };
            let mut allocator = core.voice_allocator.lock().expect("voice allocator mutex");
            for &voice_index in &block.active_voices {
                let voice = &core.voices[voice_index];
                if !voice.should_remain_active() {
                    allocator.deactivate_voice(voice_index);
                    voice.set_active(false);
                }
            }
        }
        if let Some(effect) = &core.effect {
            if effect.stage.is_active() && !effect.stage.should_remain_active() {
                effect.stage.set_active(false);
            }
        }
    }

    pub fn buffer_sample_count(&self) -> usize {
        self.core.buffer_sample_count
    }

    pub fn active_voice_count(&self) -> usize {
        self.core
            .voice_allocator
            .lock()
            .expect("voice allocator mutex")
            .active_voice_indices()
            .len()
    }
}

fn count_native_module_calls(
    graph: &crate::graph::ProgramGraph,
    root_nodes: &[ProcessorNodeRef],
) -> usize {
    let mut count = 0;
    graph.iterate_graph_topological(root_nodes, |node| {
        if matches!(node, ProcessorNodeRef::NativeModuleCall(_)) {
            count += 1;
        }
    });
    count
}

/// Marks accumulation buffers concurrent with each other and with the voice
/// output buffers feeding them.
fn declare_accumulation_concurrency(
    buffer_manager: &mut BufferManager,
    voices: &[ProgramStageTaskManager],
    accumulation_buffers: &[BufferHandle],
) {
    for voice in voices {
        debug_assert_eq!(voice.output_count(), accumulation_buffers.len());
        for (output_index, &accumulation_buffer) in accumulation_buffers.iter().enumerate() {
            if let BufferOrConstant::Buffer(output_buffer) = voice.resolved_output(output_index) {
                buffer_manager.set_buffers_concurrent(output_buffer, accumulation_buffer);
            }
            for &other_accumulation_buffer in &accumulation_buffers[output_index + 1..] {
                buffer_manager.set_buffers_concurrent(accumulation_buffer, other_accumulation_buffer);
            }
        }
    }
    if voices.is_empty() {
        for (index, &buffer_a) in accumulation_buffers.iter().enumerate() {
            for &buffer_b in &accumulation_buffers[index + 1..] {
                buffer_manager.set_buffers_concurrent(buffer_a, buffer_b);
            }
        }
    }
}

fn build_task_graph(
    core_ptr: CorePtr,
    has_voices: bool,
    max_voices: usize,
    has_effect: bool,
    voice_to_effect_count: usize,
    output_channel_count: usize,
) -> StaticTaskGraph {
    let mut task_graph = StaticTaskGraph::new();

    let begin_block_task = task_graph.add_task(move || core_ptr.get().begin_block());

    let voice_task = if has_voices {
        let get_count_core = core_ptr;
        let run_core = core_ptr;
        let task = task_graph.add_tasks_with_count_and_completer(
            max_voices,
            move || get_count_core.get().block_data().active_voices.len(),
            move |sub_task_index, completer| run_core.get().run_voice(sub_task_index, completer),
        );
        task_graph.add_dependency(begin_block_task, task);
        Some(task)
    } else {
        None
    };

    let effect_task = if has_effect {
        // Accumulate each voice-to-effect channel, then run the effect
        let mut accumulation_tasks = Vec::with_capacity(voice_to_effect_count);
        for channel_index in 0..voice_to_effect_count {
            let task = task_graph
                .add_task(move || core_ptr.get().accumulate_voice_to_effect(channel_index));
            match voice_task {
                Some(voice_task) => task_graph.add_dependency(voice_task, task),
                None => task_graph.add_dependency(begin_block_task, task),
            }
            accumulation_tasks.push(task);
        }

        let task = task_graph
            .add_task_with_completer(move |completer| core_ptr.get().run_effect(completer));
        if accumulation_tasks.is_empty() {
            match voice_task {
                Some(voice_task) => task_graph.add_dependency(voice_task, task),
                None => task_graph.add_dependency(begin_block_task, task),
            }
        } else {
            for &accumulation_task in &accumulation_tasks {
                task_graph.add_dependency(accumulation_task, task);
            }
        }
        Some(task)
    } else {
        None
    };

    for channel_index in 0..output_channel_count {
        let conversion_task =
            task_graph.add_task(move || core_ptr.get().convert_output_channel(channel_index));

        if let Some(effect_task) = effect_task {
            task_graph.add_dependency(effect_task, conversion_task);
        } else if has_voices {
            // Direct voice sums: accumulate this channel, then convert
            let accumulation_task = task_graph
                .add_task(move || core_ptr.get().accumulate_channel_output(channel_index));
            task_graph.add_dependency(
                voice_task.expect("voice task exists when has_voices"),
                accumulation_task,
            );
            task_graph.add_dependency(accumulation_task, conversion_task);
        } else {
            task_graph.add_dependency(begin_block_task, conversion_task);
        }
    }

    task_graph.finalize_tasks();
    task_graph
}

impl ProcessorCore {
    /// # Safety contract
    ///
    /// Block data is written by the host thread before the task graph runs;
    /// tasks only read it (and only the host mutates it again after the
    /// graph drains).
    fn block_data(&self) -> &BlockData {
        // SAFETY: see above.
        unsafe { &*self.block.get() }
    }

    fn begin_block(&self) {
        let block = self.block_data();
        // SAFETY: host channel slices outlive the block.
        let inputs = unsafe { std::slice::from_raw_parts(block.inputs, block.input_count) };

        if let Some(handles) = &self.input_channel_buffers_float {
            for (channel_index, &handle) in handles.iter().enumerate() {
                self.buffer_manager.start_buffer_write(handle, TaskId::none());
                let buffer = self.buffer_manager.get_buffer(handle);
                // SAFETY: the buffer holds at least sample_count floats.
                let destination = unsafe {
                    std::slice::from_raw_parts_mut(buffer.memory.cast::<f32>(), block.sample_count)
                };
                match &inputs[channel_index] {
                    InputChannelBuffer::Float32(samples) => {
                        destination.copy_from_slice(&samples[..block.sample_count]);
                    }
                    InputChannelBuffer::Float64(samples) => {
                        for (destination_sample, &source_sample) in
                            destination.iter_mut().zip(*samples)
                        {
                            *destination_sample = source_sample as f32;
                        }
                    }
                }
                self.buffer_manager.set_buffer_constant(handle, false);
                self.buffer_manager.finish_buffer_write(handle, TaskId::none());
            }
        }
        if let Some(handles) = &self.input_channel_buffers_double {
            for (channel_index, &handle) in handles.iter().enumerate() {
                self.buffer_manager.start_buffer_write(handle, TaskId::none());
                let buffer = self.buffer_manager.get_buffer(handle);
                // SAFETY: the buffer holds at least sample_count doubles.
                let destination = unsafe {
                    std::slice::from_raw_parts_mut(buffer.memory.cast::<f64>(), block.sample_count)
                };
                match &inputs[channel_index] {
                    InputChannelBuffer::Float32(samples) => {
                        for (destination_sample, &source_sample) in
                            destination.iter_mut().zip(*samples)
                        {
                            *destination_sample = f64::from(source_sample);
                        }
                    }
                    InputChannelBuffer::Float64(samples) => {
                        destination.copy_from_slice(&samples[..block.sample_count]);
                    }
                }
                self.buffer_manager.set_buffer_constant(handle, false);
                self.buffer_manager.finish_buffer_write(handle, TaskId::none());
            }
        }

        // Kick voice activity transitions: deactivations first so a stolen
        // voice resets before its reactivation. A voice stolen before its
        // first block ran was never activated, so its stage is still
        // inactive and must not be toggled.
        for &voice_index in &block.deactivated_voices {
            let voice = &self.voices[voice_index];
            if voice.is_active() {
                voice.set_active(false);
            }
        }
        for activated in &block.activated_voices {
            self.voices[activated.voice_index].set_active(true);
        }

        if let Some(effect) = &self.effect {
            if effect.stage.is_active() != block.effect_should_be_active {
                effect.stage.set_active(block.effect_should_be_active);
            }
        }
    }

    fn run_voice(&self, sub_task_index: usize, completer: TaskCompleter) {
        let block = self.block_data();
        let voice_index = block.active_voices[sub_task_index];
        self.voices[voice_index].process(
            &self.executor,
            &self.buffer_manager,
            block.sample_count,
            &self.thread_scratch,
            completer,
        );
    }

    fn accumulate_voice_to_effect(&self, channel_index: usize) {
        let block = self.block_data();
        let effect = self.effect.as_ref().expect("effect accumulation requires an effect");
        accumulate::accumulate_voice_outputs(
            &self.voices,
            &block.active_voices,
            &block.voice_sample_offsets,
            &self.buffer_manager,
            channel_index,
            effect.voice_to_effect_buffers[channel_index],
            block.sample_count,
        );
    }

    fn accumulate_channel_output(&self, channel_index: usize) {
        let block = self.block_data();
        let OutputSource::VoiceAccumulation(buffer_handle) = self.output_sources[channel_index]
        else {
            panic!("channel accumulation without an accumulation buffer");
        };
        accumulate::accumulate_voice_outputs(
            &self.voices,
            &block.active_voices,
            &block.voice_sample_offsets,
            &self.buffer_manager,
            channel_index,
            buffer_handle,
            block.sample_count,
        );
    }

    fn run_effect(&self, completer: TaskCompleter) {
        let block = self.block_data();
        let effect = self.effect.as_ref().expect("effect task requires an effect");
        if effect.stage.is_active() {
            effect.stage.process(
                &self.executor,
                &self.buffer_manager,
                block.sample_count,
                &self.thread_scratch,
                completer,
            );
        } else {
            // An inactive effect produces silence; nothing to run
            completer.complete_task();
        }
    }

    fn convert_output_channel(&self, channel_index: usize) {
        let block = self.block_data();
        // SAFETY: host channel slices outlive the block, and each conversion
        // task touches exactly one channel.
        let output = unsafe { &mut *block.outputs.add(channel_index) };
        let sample_count = block.sample_count;

        match self.output_sources[channel_index] {
            OutputSource::Silence => accumulate::fill_output_channel_zero(output, sample_count),
            OutputSource::Effect(output_index) => {
                let effect = self.effect.as_ref().expect("effect output source");
                if !effect.stage.is_active() {
                    accumulate::fill_output_channel_zero(output, sample_count);
                    return;
                }
                match effect.stage.get_output(output_index) {
                    BufferOrConstant::Buffer(buffer_handle) => {
                        self.copy_buffer_to_output(buffer_handle, output, sample_count);
                    }
                    constant => accumulate::fill_output_channel_constant(
                        output,
                        sample_count,
                        constant,
                        &self.buffer_manager,
                    ),
                }
            }
            OutputSource::VoiceAccumulation(buffer_handle) => {
                self.copy_buffer_to_output(buffer_handle, output, sample_count);
            }
        }
    }

    fn copy_buffer_to_output(
        &self,
        buffer_handle: BufferHandle,
        output: &mut OutputChannelBuffer<'_>,
        sample_count: usize,
    ) {
        self.buffer_manager.start_buffer_read(buffer_handle, TaskId::none());
        let buffer = self.buffer_manager.get_buffer(buffer_handle);
        if buffer.is_constant {
            accumulate::fill_output_channel_constant(
                output,
                sample_count,
                BufferOrConstant::Buffer(buffer_handle),
                &self.buffer_manager,
            );
        } else {
            accumulate::fill_output_channel_buffer(output, buffer, sample_count);
        }
        self.buffer_manager.finish_buffer_read(buffer_handle, TaskId::none());
    }
}
