//! Wires one stage (a voice instance or the effect) into executable tasks.
//!
//! Construction walks the stage's graph in topological order, resolving
//! every output node to either a literal constant or a buffer reserved from
//! the buffer manager, and builds one task per native-module call with its
//! argument list fully wired. Per-block execution resets the atomic
//! predecessor counts and drives the tasks through the executor; the task
//! that writes the last graph output computes the stage's remain-active
//! state and fires the stage's completion.

use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::ffi::c_void;
#[cfg(debug_assertions)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicUsize, Ordering};

use chord_native::{
    InputBoolBufferArray, InputDoubleBufferArray, InputFloatBufferArray, InputIntBufferArray,
    MemoryRequirement, ModuleParameterDirection, NativeLibrary, NativeLibraryRegistry,
    NativeModule, NativeModuleArgument, NativeModuleArguments, NativeModuleContext,
    NativeModuleParameter, PrimitiveType, ReportingSeverity, RuntimeMutability,
    null_terminated_string_length,
};
use chord_primitives::is_aligned_ptr;
use smallvec::SmallVec;

use crate::accumulate;
use crate::buffers::{BufferHandle, BufferManager, TaskId};
use crate::constants::ConstantManager;
use crate::executor::{Task, TaskExecutor, current_task_thread_index};
use crate::graph::{OutputNodeRef, ProcessorNodeRef, ProgramGraph};
use crate::program::Program;
use crate::task_graph::TaskCompleter;

/// What a graph output node resolved to: a literal constant or a runtime
/// buffer.
#[derive(Clone, Copy, Debug)]
pub enum BufferOrConstant {
    Buffer(BufferHandle),
    Float(f32),
    Double(f64),
    Int(i32),
    Bool(bool),
}

/// Receives warnings and errors reported by native modules during
/// processing.
pub type ReportHandler = Box<dyn Fn(ReportingSeverity, &str) + Send + Sync>;

/// One worker thread's scratch memory.
#[derive(Clone, Copy)]
pub struct ScratchSlice {
    pub ptr: *mut u8,
    pub len: usize,
}

// SAFETY: a scratch slice is exclusively owned by the worker thread running
// a task for the duration of that task.
unsafe impl Send for ScratchSlice {}
unsafe impl Sync for ScratchSlice {}

/// All buffer descriptor variants in the plugin ABI share this layout; the
/// per-block initializers write through these field pointers regardless of
/// primitive type or direction.
#[repr(C)]
struct RawBufferDescriptor {
    sample_count: i32,
    is_constant: bool,
    samples: *mut u8,
}

struct SampleCountInitializer {
    sample_count: *mut i32,
    upsample_factor: i32,
}

struct SamplesInitializer {
    buffer_handle: BufferHandle,
    samples: *mut *mut u8,
    is_constant: *mut bool,
}

struct IsConstantResolver {
    buffer_handle: BufferHandle,
    is_constant: *mut bool,
}

struct NativeLibraryEntry {
    library: *const NativeLibrary,
    context: *mut c_void,
    voice_context: *mut c_void,
}

/// Unique task identity for buffer-sharing bookkeeping. Stable across moves
/// of the task storage, unlike the task's address.
fn next_task_id() -> TaskId {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    TaskId::from_ptr(NEXT.fetch_add(1, Ordering::Relaxed) as *const u8)
}

struct NativeModuleCallTask {
    task: Task,
    task_id: TaskId,
    node: ProcessorNodeRef,
    native_library_entry_index: usize,
    native_module: *const NativeModule,
    upsample_factor: i32,
    /// Boxed so the initializer pointers into the argument storage stay
    /// valid when the task itself moves.
    arguments: Box<[NativeModuleArgument]>,
    /// Mutable view of the argument storage, captured while the storage was
    /// exclusively borrowed; modules write output state through it.
    arguments_ptr: *mut NativeModuleArgument,
    sample_count_initializers: Vec<SampleCountInitializer>,
    samples_initializers: Vec<SamplesInitializer>,
    is_constant_resolvers: Vec<IsConstantResolver>,
    input_buffer_handles: Vec<BufferHandle>,
    output_buffer_handles: Vec<BufferHandle>,
    voice_context: *mut c_void,
    scratch_memory_requirement: MemoryRequirement,
    writes_to_graph_output: bool,
    successor_task_indices: SmallVec<[usize; 4]>,
    predecessor_count: usize,
    remaining_predecessor_count: AtomicUsize,
}

struct ProcessContext {
    executor: *const TaskExecutor,
    buffer_manager: *const BufferManager,
    sample_count: usize,
    thread_scratch: *const ScratchSlice,
    thread_scratch_count: usize,
    on_complete: Option<TaskCompleter>,
}

pub struct ProgramStageTaskManager {
    report_handler: ReportHandler,
    sample_rate: i32,
    input_channel_count: i32,
    output_channel_count: i32,
    native_libraries: Vec<NativeLibraryEntry>,
    native_module_call_tasks: Box<[NativeModuleCallTask]>,
    root_task_indices: Vec<usize>,
    tasks_with_set_voice_active: Vec<usize>,
    outputs: Vec<Option<BufferOrConstant>>,
    remain_active_output: Option<BufferOrConstant>,
    output_task_count: usize,
    remaining_output_task_count: AtomicUsize,
    scratch_memory_requirement: MemoryRequirement,
    active: Cell<bool>,
    remain_active_result: Cell<bool>,
    process_context: UnsafeCell<Option<ProcessContext>>,
    #[cfg(debug_assertions)]
    outputs_published: AtomicBool,
}

// SAFETY: the mutable cells are written under the stage's execution
// protocol: the process context is set before root tasks are enqueued and
// taken by the single task that completes the stage; per-task argument
// storage is only written by the one worker running that task; activity and
// remain-active cells are touched outside of (or strictly ordered against)
// block execution.
unsafe impl Send for ProgramStageTaskManager {}
unsafe impl Sync for ProgramStageTaskManager {}

impl ProgramStageTaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: &NativeLibraryRegistry,
        report_handler: ReportHandler,
        program: &Program,
        is_voice_graph: bool,
        constant_manager: &mut ConstantManager,
        buffer_manager: &mut BufferManager,
        buffer_sample_count: usize,
        input_channel_buffers_float: Option<&[BufferHandle]>,
        input_channel_buffers_double: Option<&[BufferHandle]>,
        voice_to_effect_input_buffers: Option<&[BufferHandle]>,
        native_module_call_node_count: usize,
        root_nodes: &[ProcessorNodeRef],
    ) -> Self {
        let graph = program.graph();
        let variant = program.variant_properties();
        let input_channel_count = variant.input_channel_count as usize;

        // Maps each resolved output node to the buffer or constant feeding
        // its consumers
        let mut output_values: HashMap<OutputNodeRef, BufferOrConstant> = HashMap::new();

        if let Some(channels) = &graph.input_channels_float {
            let handles = input_channel_buffers_float.expect("float input channel buffers");
            for channel_index in 0..input_channel_count {
                let output = graph.graph_input_node(channels[channel_index]).output;
                output_values.insert(output, BufferOrConstant::Buffer(handles[channel_index]));
            }
        }
        if let Some(channels) = &graph.input_channels_double {
            let handles = input_channel_buffers_double.expect("double input channel buffers");
            for channel_index in 0..input_channel_count {
                let output = graph.graph_input_node(channels[channel_index]).output;
                output_values.insert(output, BufferOrConstant::Buffer(handles[channel_index]));
            }
        }
        if !is_voice_graph {
            if let Some(handles) = voice_to_effect_input_buffers {
                for (node, &handle) in graph.voice_to_effect_inputs.iter().zip(handles) {
                    let output = graph.graph_input_node(*node).output;
                    output_values.insert(output, BufferOrConstant::Buffer(handle));
                }
            }
        }

        let output_count = if is_voice_graph && graph.effect_graph.is_some() {
            graph.voice_to_effect_outputs.len()
        } else {
            variant.output_channel_count as usize
        };
        let mut outputs: Vec<Option<BufferOrConstant>> = vec![None; output_count];
        let mut remain_active_output = None;

        let mut tasks: Vec<NativeModuleCallTask> = Vec::with_capacity(native_module_call_node_count);
        let mut task_indices_from_nodes: HashMap<ProcessorNodeRef, usize> =
            HashMap::with_capacity(native_module_call_node_count);
        let mut native_libraries: Vec<NativeLibraryEntry> = Vec::new();

        graph.iterate_graph_topological(root_nodes, |node| match node {
            ProcessorNodeRef::FloatConstant(_) => {
                let constant = graph.float_constant_node(node);
                output_values.insert(constant.output, BufferOrConstant::Float(constant.value));
            }
            ProcessorNodeRef::DoubleConstant(_) => {
                let constant = graph.double_constant_node(node);
                output_values.insert(constant.output, BufferOrConstant::Double(constant.value));
            }
            ProcessorNodeRef::IntConstant(_) => {
                let constant = graph.int_constant_node(node);
                output_values.insert(constant.output, BufferOrConstant::Int(constant.value));
            }
            ProcessorNodeRef::BoolConstant(_) => {
                let constant = graph.bool_constant_node(node);
                output_values.insert(constant.output, BufferOrConstant::Bool(constant.value));
            }
            // Strings and arrays embed directly into arguments as needed
            ProcessorNodeRef::StringConstant(_) | ProcessorNodeRef::Array(_) => {}
            ProcessorNodeRef::NativeModuleCall(_) => {
                let task_index = tasks.len();
                tasks.push(initialize_native_module_call_task(
                    graph,
                    registry,
                    constant_manager,
                    buffer_manager,
                    buffer_sample_count,
                    node,
                    &mut output_values,
                    &mut native_libraries,
                ));
                task_indices_from_nodes.insert(node, task_index);
            }
            ProcessorNodeRef::GraphInput(_) => {
                debug_assert!(
                    output_values.contains_key(&graph.graph_input_node(node).output),
                    "graph input was not mapped to a buffer"
                );
            }
            ProcessorNodeRef::GraphOutput(_) => {
                let input = graph.graph_output_node(node).input;
                let value = output_values[&graph.input_node(input).connection()];
                if Some(node) == graph.voice_remain_active || Some(node) == graph.effect_remain_active
                {
                    debug_assert!(remain_active_output.is_none());
                    remain_active_output = Some(value);
                } else {
                    outputs[graph.graph_output_index(node)] = Some(value);
                }
            }
        });

        assert_eq!(tasks.len(), native_module_call_node_count);

        // Build task dependencies from the graph's edges
        let mut output_task_count = 0;
        for task_index in 0..tasks.len() {
            let node = tasks[task_index].node;
            let mut successors: SmallVec<[usize; 4]> = SmallVec::new();
            let mut writes_to_graph_output = false;

            for &output in &graph.native_module_call_node(node).outputs {
                graph.for_each_connected_native_module_call(output, &mut |successor_node| {
                    let successor_task_index = task_indices_from_nodes[&successor_node];
                    if !successors.contains(&successor_task_index) {
                        successors.push(successor_task_index);
                    }
                });

                if !writes_to_graph_output {
                    writes_to_graph_output =
                        graph.output_node(output).connections().iter().any(|&input| {
                            matches!(
                                graph.input_node(input).processor(),
                                ProcessorNodeRef::GraphOutput(_)
                            )
                        });
                }
            }

            for &successor_task_index in &successors {
                tasks[successor_task_index].predecessor_count += 1;
            }
            tasks[task_index].successor_task_indices = successors;
            tasks[task_index].writes_to_graph_output = writes_to_graph_output;
            if writes_to_graph_output {
                output_task_count += 1;
            }
        }

        let root_task_indices: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.predecessor_count == 0)
            .map(|(task_index, _)| task_index)
            .collect();

        let mut native_module_call_tasks = tasks.into_boxed_slice();

        // Initialize the voice context of each unique native library
        for entry in &mut native_libraries {
            // SAFETY: library descriptors outlive the stage via the registry.
            let library = unsafe { &*entry.library };
            if let Some(initialize_voice) = library.initialize_voice {
                // SAFETY: hook per the plugin ABI.
                entry.voice_context = unsafe { initialize_voice(entry.context) };
            }
        }

        // Then the voice context of each native module, tracking the widest
        // scratch-memory requirement across all tasks
        let mut scratch_memory_requirement = MemoryRequirement::none();
        let mut tasks_with_set_voice_active = Vec::new();
        for (task_index, task) in native_module_call_tasks.iter_mut().enumerate() {
            // SAFETY: module descriptors outlive the stage via the registry.
            let module = unsafe { &*task.native_module };
            if let Some(initialize_voice) = module.initialize_voice {
                let entry = &native_libraries[task.native_library_entry_index];
                // The reporting callback is bound per block; none is
                // available during construction
                let context = build_native_module_context(
                    variant.sample_rate,
                    variant.input_channel_count,
                    variant.output_channel_count,
                    entry,
                    std::ptr::null_mut(),
                    task.upsample_factor,
                    std::ptr::null_mut(),
                    None,
                );
                // Non-constant argument buffers are null at this point
                let arguments = NativeModuleArguments {
                    arguments: task.arguments.as_mut_ptr(),
                    argument_count: task.arguments.len(),
                };
                // SAFETY: hook per the plugin ABI; the requirement out-param
                // is a valid local.
                task.voice_context = unsafe {
                    initialize_voice(&context, &arguments, &mut task.scratch_memory_requirement)
                };

                debug_assert!(
                    task.scratch_memory_requirement.size == 0
                        || task.scratch_memory_requirement.alignment.is_power_of_two()
                );
                scratch_memory_requirement.size = scratch_memory_requirement
                    .size
                    .max(task.scratch_memory_requirement.size);
                scratch_memory_requirement.alignment = scratch_memory_requirement
                    .alignment
                    .max(task.scratch_memory_requirement.alignment);
            }

            if module.set_voice_active.is_some() {
                tasks_with_set_voice_active.push(task_index);
            }
        }

        Self {
            report_handler,
            sample_rate: variant.sample_rate,
            input_channel_count: variant.input_channel_count,
            output_channel_count: variant.output_channel_count,
            native_libraries,
            native_module_call_tasks,
            root_task_indices,
            tasks_with_set_voice_active,
            outputs,
            remain_active_output,
            output_task_count,
            remaining_output_task_count: AtomicUsize::new(0),
            scratch_memory_requirement,
            active: Cell::new(false),
            remain_active_result: Cell::new(false),
            process_context: UnsafeCell::new(None),
            #[cfg(debug_assertions)]
            outputs_published: AtomicBool::new(false),
        }
    }

    pub fn scratch_memory_requirement(&self) -> MemoryRequirement {
        self.scratch_memory_requirement
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Toggles the stage's voice-active state, notifying every module that
    /// declared a hook: in forward order when activating, reverse order when
    /// deactivating.
    pub fn set_active(&self, active: bool) {
        assert_ne!(self.active.get(), active, "the state change must be real");

        for position in 0..self.tasks_with_set_voice_active.len() {
            let index = if active {
                position
            } else {
                self.tasks_with_set_voice_active.len() - position - 1
            };
            let task = &self.native_module_call_tasks[self.tasks_with_set_voice_active[index]];
            let entry = &self.native_libraries[task.native_library_entry_index];
            let context = build_native_module_context(
                self.sample_rate,
                self.input_channel_count,
                self.output_channel_count,
                entry,
                task.voice_context,
                task.upsample_factor,
                std::ptr::from_ref(self).cast_mut().cast(),
                Some(report_callback_static),
            );
            // SAFETY: module descriptors outlive the stage via the registry.
            let module = unsafe { &*task.native_module };
            let set_voice_active = module.set_voice_active.expect("hook was recorded");
            // SAFETY: hook per the plugin ABI.
            unsafe { set_voice_active(&context, active) };
        }

        self.active.set(active);
    }

    /// Kicks off this stage's tasks for one block. `on_complete` fires on
    /// whichever worker thread finishes the stage's last output task.
    pub fn process(
        &self,
        executor: &TaskExecutor,
        buffer_manager: &BufferManager,
        sample_count: usize,
        thread_scratch: &[ScratchSlice],
        on_complete: TaskCompleter,
    ) {
        // SAFETY: no block is in flight for this stage, so nothing else
        // accesses the context.
        let process_context = unsafe { &mut *self.process_context.get() };
        assert!(process_context.is_none(), "a block is already in flight");
        *process_context = Some(ProcessContext {
            executor: std::ptr::from_ref(executor),
            buffer_manager: std::ptr::from_ref(buffer_manager),
            sample_count,
            thread_scratch: thread_scratch.as_ptr(),
            thread_scratch_count: thread_scratch.len(),
            on_complete: Some(on_complete),
        });

        #[cfg(debug_assertions)]
        self.outputs_published.store(false, Ordering::Relaxed);

        // A stage whose outputs are all constants has no tasks to run
        if self.native_module_call_tasks.is_empty() {
            self.process_remain_active_output();
            #[cfg(debug_assertions)]
            self.outputs_published.store(true, Ordering::Release);
            // SAFETY: as above; tasks have not been enqueued.
            let context = unsafe { &mut *self.process_context.get() }
                .take()
                .expect("context was just set");
            if let Some(on_complete) = context.on_complete {
                on_complete.complete_task();
            }
            return;
        }

        debug_assert!(self.output_task_count > 0, "tasks exist but none writes an output");

        for (task_index, task) in self.native_module_call_tasks.iter().enumerate() {
            // Relaxed: nothing is published here, we are only preparing the
            // dependency counts
            task.remaining_predecessor_count
                .store(task.predecessor_count, Ordering::Relaxed);
            task.task.initialize(
                run_task_trampoline,
                std::ptr::from_ref(self).cast(),
                task_index,
                0,
            );
        }

        self.remaining_output_task_count
            .store(self.output_task_count, Ordering::Relaxed);

        for &task_index in &self.root_task_indices {
            // SAFETY: tasks live as long as the stage, which outlives the
            // block.
            unsafe { executor.enqueue_task(&self.native_module_call_tasks[task_index].task) };
        }
    }

    /// The resolved output value without the publication check. Only for
    /// wiring during processor construction.
    pub(crate) fn resolved_output(&self, output_index: usize) -> BufferOrConstant {
        self.outputs[output_index].expect("stage outputs are resolved at construction")
    }

    /// The resolved buffer or constant behind a stage output. Valid once the
    /// stage's completion has fired for the block.
    pub fn get_output(&self, output_index: usize) -> BufferOrConstant {
        #[cfg(debug_assertions)]
        debug_assert!(self.outputs_published.load(Ordering::Relaxed));
        self.outputs[output_index].expect("stage outputs are resolved at construction")
    }

    /// Whether the stage must process another block. Valid once the stage's
    /// completion has fired for the block.
    pub fn should_remain_active(&self) -> bool {
        #[cfg(debug_assertions)]
        debug_assert!(self.outputs_published.load(Ordering::Relaxed));
        self.remain_active_result.get()
    }

    fn run_task(&self, task_index: usize) {
        let task = &self.native_module_call_tasks[task_index];
        // SAFETY: the context is set for the whole block; only the completing
        // task takes it, strictly after every other task has finished.
        let context = unsafe { &*self.process_context.get() }
            .as_ref()
            .expect("a block is in flight");
        // SAFETY: context pointers outlive the block.
        let buffer_manager = unsafe { &*context.buffer_manager };
        let executor = unsafe { &*context.executor };

        for &buffer_handle in &task.input_buffer_handles {
            buffer_manager.start_buffer_read(buffer_handle, task.task_id);
        }
        for &buffer_handle in &task.output_buffer_handles {
            buffer_manager.start_buffer_write(buffer_handle, task.task_id);
        }

        // Resolve the per-block argument fields
        for initializer in &task.sample_count_initializers {
            // SAFETY: initializer pointers target this task's argument
            // storage, exclusively ours while the task runs.
            unsafe {
                *initializer.sample_count =
                    (context.sample_count * initializer.upsample_factor as usize) as i32;
            }
        }
        for initializer in &task.samples_initializers {
            let buffer = buffer_manager.get_buffer(initializer.buffer_handle);
            // SAFETY: as above.
            unsafe {
                *initializer.samples = buffer.memory;
                *initializer.is_constant = buffer.is_constant;
            }
        }
        // Output buffers always start out marked non-constant; the module
        // must opt back in every block
        for resolver in &task.is_constant_resolvers {
            // SAFETY: as above.
            unsafe { *resolver.is_constant = false };
        }

        let entry = &self.native_libraries[task.native_library_entry_index];
        let module_context = build_native_module_context(
            self.sample_rate,
            self.input_channel_count,
            self.output_channel_count,
            entry,
            task.voice_context,
            task.upsample_factor,
            std::ptr::from_ref(self).cast_mut().cast(),
            Some(report_callback_static),
        );
        let arguments = NativeModuleArguments {
            arguments: task.arguments_ptr,
            argument_count: task.arguments.len(),
        };

        // Grab this thread's scratch memory
        let thread_index = current_task_thread_index().expect("running on an executor worker");
        debug_assert!(thread_index < context.thread_scratch_count);
        // SAFETY: the scratch slice array outlives the block.
        let scratch = unsafe { *context.thread_scratch.add(thread_index) };
        assert!(scratch.len >= task.scratch_memory_requirement.size);
        if task.scratch_memory_requirement.size > 0 {
            assert!(is_aligned_ptr(scratch.ptr, task.scratch_memory_requirement.alignment));
        }

        // SAFETY: module descriptors outlive the stage via the registry.
        let module = unsafe { &*task.native_module };
        let invoke = module.invoke.expect("runtime modules provide invoke");
        // SAFETY: the arguments were wired to live buffer memory above.
        unsafe {
            invoke(
                &module_context,
                &arguments,
                scratch.ptr,
                task.scratch_memory_requirement.size,
            );
        }

        // Clear sample counts and pointers; they must not dangle into calls
        // where buffers aren't available
        for initializer in &task.sample_count_initializers {
            // SAFETY: as above.
            unsafe { *initializer.sample_count = 0 };
        }
        for initializer in &task.samples_initializers {
            // SAFETY: as above.
            unsafe { *initializer.samples = std::ptr::null_mut() };
        }

        // Publish the constant state the module left on each output
        for resolver in &task.is_constant_resolvers {
            // SAFETY: as above.
            let is_constant = unsafe { *resolver.is_constant };
            buffer_manager.set_buffer_constant(resolver.buffer_handle, is_constant);
        }

        for &buffer_handle in &task.input_buffer_handles {
            buffer_manager.finish_buffer_read(buffer_handle, task.task_id);
        }
        for &buffer_handle in &task.output_buffer_handles {
            buffer_manager.finish_buffer_write(buffer_handle, task.task_id);
        }

        // Kick off successor tasks
        for &successor_task_index in &task.successor_task_indices {
            let successor = &self.native_module_call_tasks[successor_task_index];
            let pre_decrement_count = successor
                .remaining_predecessor_count
                .fetch_sub(1, Ordering::Release);
            debug_assert!(pre_decrement_count >= 1);
            if pre_decrement_count == 1 {
                // SAFETY: tasks live as long as the stage.
                unsafe { executor.enqueue_task(&successor.task) };
            }
        }

        // Fire the stage's completion once every output has been written
        if task.writes_to_graph_output {
            let pre_decrement_count = self
                .remaining_output_task_count
                .fetch_sub(1, Ordering::Release);
            debug_assert!(pre_decrement_count >= 1);
            if pre_decrement_count == 1 {
                // Throwaway acquire load republishes the other output tasks'
                // writes on this thread
                let remaining = self.remaining_output_task_count.load(Ordering::Acquire);
                debug_assert_eq!(remaining, 0);

                self.process_remain_active_output();
                #[cfg(debug_assertions)]
                self.outputs_published.store(true, Ordering::Release);

                // SAFETY: every other task of this stage has finished, so
                // this is the only access.
                let context = unsafe { &mut *self.process_context.get() }
                    .take()
                    .expect("a block is in flight");
                if let Some(on_complete) = context.on_complete {
                    on_complete.complete_task();
                }
            }
        }
    }

    fn process_remain_active_output(&self) {
        // SAFETY: called while the context is set, before it is taken.
        let context = unsafe { &*self.process_context.get() }
            .as_ref()
            .expect("a block is in flight");

        let result = match self.remain_active_output {
            // With no remain-active output the stage always stays active
            // (only supported for effect stages; voices turn themselves off)
            None => true,
            Some(BufferOrConstant::Bool(value)) => value,
            Some(BufferOrConstant::Buffer(buffer_handle)) => {
                // SAFETY: the buffer manager outlives the block.
                let buffer_manager = unsafe { &*context.buffer_manager };
                accumulate::process_remain_active_output(
                    buffer_manager.get_buffer(buffer_handle),
                    context.sample_count,
                )
            }
            Some(_) => panic!("remain-active output must be a bool"),
        };
        self.remain_active_result.set(result);
    }

    /// Declares which of this stage's buffers may be live simultaneously.
    ///
    /// Stage outputs are pairwise concurrent (an output produced from
    /// another output must not reuse its memory). Buffers of two tasks are
    /// concurrent when neither task is reachable from the other, or when
    /// both are (mutual reachability means a cycle, whose buffers must not
    /// be reused mid-cycle). All buffers within one task are concurrent.
    pub fn declare_buffer_concurrency(
        &self,
        buffer_manager: &mut BufferManager,
        graph: &ProgramGraph,
        stage_nodes: &[ProcessorNodeRef],
    ) {
        for output_index_a in 0..self.outputs.len() {
            let Some(BufferOrConstant::Buffer(buffer_handle_a)) = self.outputs[output_index_a]
            else {
                continue;
            };
            for output in &self.outputs[output_index_a + 1..] {
                if let Some(BufferOrConstant::Buffer(buffer_handle_b)) = output {
                    buffer_manager.set_buffers_concurrent(buffer_handle_a, *buffer_handle_b);
                }
            }
            if let Some(BufferOrConstant::Buffer(remain_active_handle)) = self.remain_active_output
            {
                buffer_manager.set_buffers_concurrent(buffer_handle_a, remain_active_handle);
            }
        }

        let root_nodes = graph.find_graph_root_nodes(stage_nodes);
        let reachability = graph.graph_node_reachability(&root_nodes);

        for task_index_a in 0..self.native_module_call_tasks.len() {
            let task_a = &self.native_module_call_tasks[task_index_a];

            for initializer_index_a in 0..task_a.samples_initializers.len() {
                for initializer_index_b in
                    initializer_index_a + 1..task_a.samples_initializers.len()
                {
                    buffer_manager.set_buffers_concurrent(
                        task_a.samples_initializers[initializer_index_a].buffer_handle,
                        task_a.samples_initializers[initializer_index_b].buffer_handle,
                    );
                }
            }

            for task_b in &self.native_module_call_tasks[task_index_a + 1..] {
                let a_to_b = reachability.contains(&(task_a.node, task_b.node));
                let b_to_a = reachability.contains(&(task_b.node, task_a.node));
                let are_tasks_concurrent = a_to_b == b_to_a;
                if are_tasks_concurrent {
                    for initializer_a in &task_a.samples_initializers {
                        for initializer_b in &task_b.samples_initializers {
                            buffer_manager.set_buffers_concurrent(
                                initializer_a.buffer_handle,
                                initializer_b.buffer_handle,
                            );
                        }
                    }
                }
            }
        }
    }

    /// Marks every buffer of this stage concurrent with every buffer of
    /// `other`. Used to separate voices from each other and from the effect.
    pub fn declare_buffer_concurrency_with_other(
        &self,
        buffer_manager: &mut BufferManager,
        other: &ProgramStageTaskManager,
    ) {
        for task_a in self.native_module_call_tasks.iter() {
            for initializer_a in &task_a.samples_initializers {
                for task_b in other.native_module_call_tasks.iter() {
                    for initializer_b in &task_b.samples_initializers {
                        buffer_manager.set_buffers_concurrent(
                            initializer_a.buffer_handle,
                            initializer_b.buffer_handle,
                        );
                    }
                }
            }
        }
    }
}

impl Drop for ProgramStageTaskManager {
    fn drop(&mut self) {
        for task in self.native_module_call_tasks.iter().rev() {
            // SAFETY: module descriptors outlive the stage via the registry.
            let module = unsafe { &*task.native_module };
            if let Some(deinitialize_voice) = module.deinitialize_voice {
                let entry = &self.native_libraries[task.native_library_entry_index];
                let context = build_native_module_context(
                    self.sample_rate,
                    self.input_channel_count,
                    self.output_channel_count,
                    entry,
                    task.voice_context,
                    task.upsample_factor,
                    std::ptr::null_mut(),
                    None,
                );
                // SAFETY: paired with the initialize_voice call at build.
                unsafe { deinitialize_voice(&context) };
            }
        }

        for entry in self.native_libraries.iter().rev() {
            // SAFETY: library descriptors outlive the stage via the registry.
            let library = unsafe { &*entry.library };
            if let Some(deinitialize_voice) = library.deinitialize_voice {
                // SAFETY: paired with the initialize_voice call at build.
                unsafe { deinitialize_voice(entry.context, entry.voice_context) };
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_native_module_context(
    sample_rate: i32,
    input_channel_count: i32,
    output_channel_count: i32,
    entry: &NativeLibraryEntry,
    voice_context: *mut c_void,
    upsample_factor: i32,
    reporting_context: *mut c_void,
    report: Option<chord_native::ReportFn>,
) -> NativeModuleContext {
    NativeModuleContext {
        native_library_context: entry.context,
        native_library_voice_context: entry.voice_context,
        voice_context,
        sample_rate,
        input_channel_count,
        output_channel_count,
        upsample_factor,
        is_compile_time: false,
        reporting_context,
        report,
    }
}

unsafe extern "C" fn report_callback_static(
    context: *mut c_void,
    severity: ReportingSeverity,
    message: *const u32,
) {
    // SAFETY: the context is the stage, alive for the whole block.
    let stage = unsafe { &*context.cast::<ProgramStageTaskManager>() };
    let message = if message.is_null() {
        String::new()
    } else {
        // SAFETY: messages are null-terminated UTF-32 per the ABI.
        let length = unsafe { null_terminated_string_length(message) };
        let code_points = unsafe { std::slice::from_raw_parts(message, length) };
        code_points
            .iter()
            .map(|&c| char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    };
    (stage.report_handler)(severity, &message);
}

unsafe fn run_task_trampoline(context: *const (), task_index: usize, _argument1: usize) {
    // SAFETY: the context is the stage, alive for the whole block.
    let stage = unsafe { &*context.cast::<ProgramStageTaskManager>() };
    stage.run_task(task_index);
}

#[allow(clippy::too_many_arguments)]
fn initialize_native_module_call_task(
    graph: &ProgramGraph,
    registry: &NativeLibraryRegistry,
    constant_manager: &mut ConstantManager,
    buffer_manager: &mut BufferManager,
    buffer_sample_count: usize,
    node: ProcessorNodeRef,
    output_values: &mut HashMap<OutputNodeRef, BufferOrConstant>,
    native_libraries: &mut Vec<NativeLibraryEntry>,
) -> NativeModuleCallTask {
    let call_node = graph.native_module_call_node(node);

    // The program's dependencies were validated before load, so these are
    // hard assertions rather than recoverable errors
    let (library, library_context) = registry
        .try_get(call_node.native_library_id)
        .expect("native library not found");

    // SAFETY: the registry owns this many module pointers.
    let modules =
        unsafe { std::slice::from_raw_parts(library.native_modules, library.native_module_count) };
    let native_module = *modules
        .iter()
        .find(|&&module| {
            // SAFETY: module pointers are valid for the registry's lifetime.
            chord_primitives::Guid::from_bytes(unsafe { (*module).id })
                == call_node.native_module_id
        })
        .expect("native module not found");

    let native_library_entry_index = match native_libraries
        .iter()
        .position(|entry| std::ptr::eq(entry.library, library))
    {
        Some(index) => index,
        None => {
            native_libraries.push(NativeLibraryEntry {
                library,
                context: library_context,
                voice_context: std::ptr::null_mut(),
            });
            native_libraries.len() - 1
        }
    };

    // SAFETY: the signature declares this many parameters.
    let parameters = unsafe {
        let module = &*native_module;
        std::slice::from_raw_parts(module.signature.parameters, module.signature.parameter_count)
    };

    let mut task = NativeModuleCallTask {
        task: Task::new(),
        task_id: next_task_id(),
        node,
        native_library_entry_index,
        native_module,
        upsample_factor: call_node.upsample_factor,
        arguments: vec![NativeModuleArgument::zeroed(); parameters.len()].into_boxed_slice(),
        arguments_ptr: std::ptr::null_mut(),
        sample_count_initializers: Vec::new(),
        samples_initializers: Vec::new(),
        is_constant_resolvers: Vec::new(),
        input_buffer_handles: Vec::new(),
        output_buffer_handles: Vec::new(),
        voice_context: std::ptr::null_mut(),
        scratch_memory_requirement: MemoryRequirement::none(),
        writes_to_graph_output: false,
        successor_task_indices: SmallVec::new(),
        predecessor_count: 0,
        remaining_predecessor_count: AtomicUsize::new(0),
    };
    task.arguments_ptr = task.arguments.as_mut_ptr();

    // Map the module's declared parameters onto the node's connections
    let mut input_index = 0;
    let mut output_index = 0;
    for (parameter_index, parameter) in parameters.iter().enumerate() {
        match parameter.direction {
            ModuleParameterDirection::In => {
                build_native_module_input_argument(
                    graph,
                    constant_manager,
                    buffer_manager,
                    &mut task,
                    parameter_index,
                    parameter,
                    call_node.inputs[input_index],
                    output_values,
                );
                input_index += 1;
            }
            ModuleParameterDirection::Out => {
                build_native_module_output_argument(
                    buffer_manager,
                    buffer_sample_count,
                    &mut task,
                    parameter_index,
                    parameter,
                    call_node.outputs[output_index],
                    output_values,
                );
                output_index += 1;
            }
        }
    }

    task
}

#[allow(clippy::too_many_arguments)]
fn build_native_module_input_argument(
    graph: &ProgramGraph,
    constant_manager: &mut ConstantManager,
    buffer_manager: &mut BufferManager,
    task: &mut NativeModuleCallTask,
    argument_index: usize,
    parameter: &NativeModuleParameter,
    input: crate::graph::InputNodeRef,
    output_values: &HashMap<OutputNodeRef, BufferOrConstant>,
) {
    let upstream_output = graph.input_node(input).connection();
    let upstream_processor = graph.output_node(upstream_output).processor();
    let argument = std::ptr::from_mut(&mut task.arguments[argument_index]);

    if parameter.data_type.runtime_mutability == RuntimeMutability::Constant {
        // The constant embeds directly into the argument
        if parameter.data_type.is_array {
            debug_assert!(matches!(upstream_processor, ProcessorNodeRef::Array(_)));
            // SAFETY: writing the union field selected by the parameter type.
            unsafe {
                match parameter.data_type.primitive_type {
                    PrimitiveType::Float => {
                        (*argument).float_constant_array_in =
                            constant_manager.ensure_float_constant_array(graph, upstream_processor);
                    }
                    PrimitiveType::Double => {
                        (*argument).double_constant_array_in = constant_manager
                            .ensure_double_constant_array(graph, upstream_processor);
                    }
                    PrimitiveType::Int => {
                        (*argument).int_constant_array_in =
                            constant_manager.ensure_int_constant_array(graph, upstream_processor);
                    }
                    PrimitiveType::Bool => {
                        (*argument).bool_constant_array_in =
                            constant_manager.ensure_bool_constant_array(graph, upstream_processor);
                    }
                    PrimitiveType::String => {
                        (*argument).string_constant_array_in = constant_manager
                            .ensure_string_constant_array(graph, upstream_processor);
                    }
                }
            }
        } else {
            // SAFETY: writing the union field selected by the parameter type.
            unsafe {
                match parameter.data_type.primitive_type {
                    PrimitiveType::Float => {
                        (*argument).float_constant_in =
                            graph.float_constant_node(upstream_processor).value;
                    }
                    PrimitiveType::Double => {
                        (*argument).double_constant_in =
                            graph.double_constant_node(upstream_processor).value;
                    }
                    PrimitiveType::Int => {
                        (*argument).int_constant_in =
                            graph.int_constant_node(upstream_processor).value;
                    }
                    PrimitiveType::Bool => {
                        (*argument).bool_constant_in =
                            graph.bool_constant_node(upstream_processor).value;
                    }
                    PrimitiveType::String => {
                        (*argument).string_constant_in = constant_manager
                            .ensure_string(&graph.string_constant_node(upstream_processor).value);
                    }
                }
            }
        }
        return;
    }

    // Buffer parameters: a constant upstream resolves to fixed constant-fill
    // memory; a buffer upstream links to the already-assigned handle
    // (topological order guarantees it exists)
    let upsample_factor = parameter.data_type.upsample_factor;
    if parameter.data_type.is_array {
        debug_assert!(matches!(upstream_processor, ProcessorNodeRef::Array(_)));
        let array_node = graph.array_node(upstream_processor);
        let element_count = array_node.elements.len();

        // Reserve the descriptor array, then wire each element like an
        // individual buffer input
        let elements: *mut RawBufferDescriptor = match parameter.data_type.primitive_type {
            PrimitiveType::Float => buffer_manager.add_float_buffer_array(element_count).cast(),
            PrimitiveType::Double => buffer_manager.add_double_buffer_array(element_count).cast(),
            PrimitiveType::Int => buffer_manager.add_int_buffer_array(element_count).cast(),
            PrimitiveType::Bool => buffer_manager.add_bool_buffer_array(element_count).cast(),
            PrimitiveType::String => panic!("string buffer arrays are not supported"),
        };

        for element_index in 0..element_count {
            let element_output = graph.input_node(array_node.elements[element_index]).connection();
            // SAFETY: element descriptors are stable buffer-manager storage.
            let descriptor = unsafe { elements.add(element_index) };
            let buffer_handle = initialize_buffer_or_constant(
                constant_manager,
                task,
                element_output,
                output_values,
                descriptor,
                upsample_factor,
                parameter.data_type.primitive_type,
            );
            if let Some(buffer_handle) = buffer_handle {
                buffer_manager.add_buffer_input_task(
                    buffer_handle,
                    task.task_id,
                    !parameter.disallow_buffer_sharing,
                );
            }
        }

        // SAFETY: writing the union field selected by the parameter type;
        // all buffer-array variants share one layout.
        unsafe {
            match parameter.data_type.primitive_type {
                PrimitiveType::Float => {
                    (*argument).float_buffer_array_in = InputFloatBufferArray {
                        count: element_count,
                        elements: elements.cast(),
                    };
                }
                PrimitiveType::Double => {
                    (*argument).double_buffer_array_in = InputDoubleBufferArray {
                        count: element_count,
                        elements: elements.cast(),
                    };
                }
                PrimitiveType::Int => {
                    (*argument).int_buffer_array_in = InputIntBufferArray {
                        count: element_count,
                        elements: elements.cast(),
                    };
                }
                PrimitiveType::Bool => {
                    (*argument).bool_buffer_array_in = InputBoolBufferArray {
                        count: element_count,
                        elements: elements.cast(),
                    };
                }
                PrimitiveType::String => unreachable!(),
            }
        }
    } else {
        let descriptor: *mut RawBufferDescriptor = argument.cast();
        let buffer_handle = initialize_buffer_or_constant(
            constant_manager,
            task,
            upstream_output,
            output_values,
            descriptor,
            upsample_factor,
            parameter.data_type.primitive_type,
        );
        if let Some(buffer_handle) = buffer_handle {
            buffer_manager.add_buffer_input_task(
                buffer_handle,
                task.task_id,
                !parameter.disallow_buffer_sharing,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_native_module_output_argument(
    buffer_manager: &mut BufferManager,
    buffer_sample_count: usize,
    task: &mut NativeModuleCallTask,
    argument_index: usize,
    parameter: &NativeModuleParameter,
    output: OutputNodeRef,
    output_values: &mut HashMap<OutputNodeRef, BufferOrConstant>,
) {
    assert!(!parameter.data_type.is_array, "output parameters are not arrays");

    let upsample_factor = task.upsample_factor * parameter.data_type.upsample_factor;
    let buffer_handle = buffer_manager.add_buffer(
        parameter.data_type.primitive_type,
        buffer_sample_count,
        upsample_factor,
    );

    if !parameter.disallow_buffer_sharing {
        buffer_manager.set_buffer_output_task_for_sharing(buffer_handle, task.task_id);
    }

    output_values.insert(output, BufferOrConstant::Buffer(buffer_handle));

    let descriptor: *mut RawBufferDescriptor =
        std::ptr::from_mut(&mut task.arguments[argument_index]).cast();
    register_buffer_descriptor(task, buffer_handle, descriptor, upsample_factor, true);
}

/// Wires one buffer descriptor. A constant upstream writes the descriptor
/// immediately from constant-fill memory and returns `None`; a buffer
/// upstream registers the per-block initializers and returns its handle.
#[allow(clippy::too_many_arguments)]
fn initialize_buffer_or_constant(
    constant_manager: &mut ConstantManager,
    task: &mut NativeModuleCallTask,
    upstream_output: OutputNodeRef,
    output_values: &HashMap<OutputNodeRef, BufferOrConstant>,
    descriptor: *mut RawBufferDescriptor,
    upsample_factor: i32,
    primitive_type: PrimitiveType,
) -> Option<BufferHandle> {
    let value = output_values[&upstream_output];
    match value {
        BufferOrConstant::Buffer(buffer_handle) => {
            register_buffer_descriptor(task, buffer_handle, descriptor, upsample_factor, false);
            Some(buffer_handle)
        }
        BufferOrConstant::Float(constant) => {
            debug_assert_eq!(primitive_type, PrimitiveType::Float);
            let buffer = constant_manager.ensure_float_constant_buffer(constant);
            // SAFETY: the descriptor slot has this variant's layout.
            unsafe { descriptor.cast::<chord_native::InputFloatBuffer>().write(buffer) };
            None
        }
        BufferOrConstant::Double(constant) => {
            debug_assert_eq!(primitive_type, PrimitiveType::Double);
            let buffer = constant_manager.ensure_double_constant_buffer(constant);
            // SAFETY: the descriptor slot has this variant's layout.
            unsafe { descriptor.cast::<chord_native::InputDoubleBuffer>().write(buffer) };
            None
        }
        BufferOrConstant::Int(constant) => {
            debug_assert_eq!(primitive_type, PrimitiveType::Int);
            let buffer = constant_manager.ensure_int_constant_buffer(constant);
            // SAFETY: the descriptor slot has this variant's layout.
            unsafe { descriptor.cast::<chord_native::InputIntBuffer>().write(buffer) };
            None
        }
        BufferOrConstant::Bool(constant) => {
            debug_assert_eq!(primitive_type, PrimitiveType::Bool);
            let buffer = constant_manager.ensure_bool_constant_buffer(constant);
            // SAFETY: the descriptor slot has this variant's layout.
            unsafe { descriptor.cast::<chord_native::InputBoolBuffer>().write(buffer) };
            None
        }
    }
}

fn register_buffer_descriptor(
    task: &mut NativeModuleCallTask,
    buffer_handle: BufferHandle,
    descriptor: *mut RawBufferDescriptor,
    upsample_factor: i32,
    is_output: bool,
) {
    // SAFETY: the descriptor targets stable storage (boxed argument slices
    // or buffer-manager-owned arrays).
    unsafe {
        task.sample_count_initializers.push(SampleCountInitializer {
            sample_count: &raw mut (*descriptor).sample_count,
            upsample_factor,
        });
        task.samples_initializers.push(SamplesInitializer {
            buffer_handle,
            samples: &raw mut (*descriptor).samples,
            is_constant: &raw mut (*descriptor).is_constant,
        });
        if is_output {
            task.is_constant_resolvers.push(IsConstantResolver {
                buffer_handle,
                is_constant: &raw mut (*descriptor).is_constant,
            });
            task.output_buffer_handles.push(buffer_handle);
        } else {
            task.input_buffer_handles.push(buffer_handle);
        }
    }
}
