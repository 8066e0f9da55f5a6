//! A declarative task graph with dependencies, built once and run every
//! block.
//!
//! Tasks either execute inline, defer completion to a [`TaskCompleter`]
//! (for externally-synchronized work), or fan out into sub-tasks; a fan-out
//! node is done only when all of its sub-tasks complete.
//!
//! Ordering protocol: predecessors publish their writes with a release
//! `fetch_sub` on the successor's predecessor count; the successor's body
//! republishes them with a throwaway acquire load on entry. Sub-task and
//! leaf counts follow the same pattern. Counters that publish nothing are
//! relaxed.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::executor::{Task, TaskExecutor};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskHandle(usize);

/// Completes a deferred task. Handed to task callables that return without
/// completing; some external event must later call [`Self::complete_task`],
/// which resumes the dependency bookkeeping on the calling thread.
pub struct TaskCompleter {
    graph: *const StaticTaskGraph,
    task_index: usize,
}

// SAFETY: the completer only carries an index and a pointer to the graph,
// which outlives the run by contract; completion itself is thread-safe.
unsafe impl Send for TaskCompleter {}

impl TaskCompleter {
    pub fn complete_task(self) {
        // SAFETY: the graph outlives the run that handed this completer out.
        let graph = unsafe { &*self.graph };
        graph.complete_task(self.task_index);
    }
}

enum TaskExecute {
    Plain(Box<dyn Fn() + Send + Sync>),
    WithCompleter(Box<dyn Fn(TaskCompleter) + Send + Sync>),
    SubTask(Box<dyn Fn(usize) + Send + Sync>),
    SubTaskWithCompleter(Box<dyn Fn(usize, TaskCompleter) + Send + Sync>),
}

struct TaskDefinition {
    execute: TaskExecute,
    max_sub_task_count: usize,
    get_sub_task_count: Option<Box<dyn Fn() -> usize + Send + Sync>>,
    successor_task_indices: Vec<usize>,
    predecessor_task_count: usize,
}

struct TaskRuntime {
    task: Task,
    remaining_predecessor_count: AtomicUsize,
    remaining_sub_task_count: AtomicUsize,
    sub_tasks: Box<[Task]>,
}

pub struct StaticTaskGraph {
    task_definitions: Vec<TaskDefinition>,
    task_runtimes: Vec<TaskRuntime>,
    root_task_indices: Vec<usize>,
    leaf_task_count: usize,
    remaining_leaf_task_count: AtomicUsize,
    task_executor: AtomicPtr<TaskExecutor>,
    completed: Mutex<bool>,
    completed_condvar: Condvar,
}

impl StaticTaskGraph {
    pub fn new() -> Self {
        Self {
            task_definitions: Vec::new(),
            task_runtimes: Vec::new(),
            root_task_indices: Vec::new(),
            leaf_task_count: 0,
            remaining_leaf_task_count: AtomicUsize::new(0),
            task_executor: AtomicPtr::new(std::ptr::null_mut()),
            completed: Mutex::new(true),
            completed_condvar: Condvar::new(),
        }
    }

    fn push_definition(&mut self, definition: TaskDefinition) -> TaskHandle {
        assert!(self.task_runtimes.is_empty(), "the graph is already finalized");
        let handle = TaskHandle(self.task_definitions.len());
        self.task_definitions.push(definition);
        handle
    }

    pub fn add_task(&mut self, execute: impl Fn() + Send + Sync + 'static) -> TaskHandle {
        self.push_definition(TaskDefinition {
            execute: TaskExecute::Plain(Box::new(execute)),
            max_sub_task_count: 0,
            get_sub_task_count: None,
            successor_task_indices: Vec::new(),
            predecessor_task_count: 0,
        })
    }

    /// Completion is deferred until the callable's completer is invoked.
    pub fn add_task_with_completer(
        &mut self,
        execute: impl Fn(TaskCompleter) + Send + Sync + 'static,
    ) -> TaskHandle {
        self.push_definition(TaskDefinition {
            execute: TaskExecute::WithCompleter(Box::new(execute)),
            max_sub_task_count: 0,
            get_sub_task_count: None,
            successor_task_indices: Vec::new(),
            predecessor_task_count: 0,
        })
    }

    /// Fan-out with a fixed sub-task count.
    pub fn add_tasks(
        &mut self,
        sub_task_count: usize,
        execute: impl Fn(usize) + Send + Sync + 'static,
    ) -> TaskHandle {
        self.push_definition(TaskDefinition {
            execute: TaskExecute::SubTask(Box::new(execute)),
            max_sub_task_count: sub_task_count,
            get_sub_task_count: Some(Box::new(move || sub_task_count)),
            successor_task_indices: Vec::new(),
            predecessor_task_count: 0,
        })
    }

    /// Fan-out with a sub-task count resolved when the task runs.
    pub fn add_tasks_with_count(
        &mut self,
        max_sub_task_count: usize,
        get_sub_task_count: impl Fn() -> usize + Send + Sync + 'static,
        execute: impl Fn(usize) + Send + Sync + 'static,
    ) -> TaskHandle {
        self.push_definition(TaskDefinition {
            execute: TaskExecute::SubTask(Box::new(execute)),
            max_sub_task_count,
            get_sub_task_count: Some(Box::new(get_sub_task_count)),
            successor_task_indices: Vec::new(),
            predecessor_task_count: 0,
        })
    }

    /// Fan-out with a fixed sub-task count and per-sub-task deferred
    /// completion.
    pub fn add_tasks_with_completer(
        &mut self,
        sub_task_count: usize,
        execute: impl Fn(usize, TaskCompleter) + Send + Sync + 'static,
    ) -> TaskHandle {
        self.push_definition(TaskDefinition {
            execute: TaskExecute::SubTaskWithCompleter(Box::new(execute)),
            max_sub_task_count: sub_task_count,
            get_sub_task_count: Some(Box::new(move || sub_task_count)),
            successor_task_indices: Vec::new(),
            predecessor_task_count: 0,
        })
    }

    /// Fan-out with a runtime-resolved sub-task count and per-sub-task
    /// deferred completion.
    pub fn add_tasks_with_count_and_completer(
        &mut self,
        max_sub_task_count: usize,
        get_sub_task_count: impl Fn() -> usize + Send + Sync + 'static,
        execute: impl Fn(usize, TaskCompleter) + Send + Sync + 'static,
    ) -> TaskHandle {
        self.push_definition(TaskDefinition {
            execute: TaskExecute::SubTaskWithCompleter(Box::new(execute)),
            max_sub_task_count,
            get_sub_task_count: Some(Box::new(get_sub_task_count)),
            successor_task_indices: Vec::new(),
            predecessor_task_count: 0,
        })
    }

    pub fn add_dependency(&mut self, predecessor: TaskHandle, successor: TaskHandle) {
        assert!(self.task_runtimes.is_empty(), "the graph is already finalized");
        self.task_definitions[predecessor.0]
            .successor_task_indices
            .push(successor.0);
        self.task_definitions[successor.0].predecessor_task_count += 1;
    }

    /// Computes the root list and leaf count and allocates runtime state.
    pub fn finalize_tasks(&mut self) {
        assert!(!self.task_definitions.is_empty());
        assert!(self.root_task_indices.is_empty());
        assert!(self.task_runtimes.is_empty());

        self.task_runtimes = self
            .task_definitions
            .iter()
            .map(|definition| TaskRuntime {
                task: Task::new(),
                remaining_predecessor_count: AtomicUsize::new(0),
                remaining_sub_task_count: AtomicUsize::new(0),
                sub_tasks: (0..definition.max_sub_task_count).map(|_| Task::new()).collect(),
            })
            .collect();

        for (task_index, definition) in self.task_definitions.iter().enumerate() {
            if definition.predecessor_task_count == 0 {
                self.root_task_indices.push(task_index);
            }
            if definition.successor_task_indices.is_empty() {
                self.leaf_task_count += 1;
            }
        }

        // Not a full cycle-detection test, but catches the degenerate case
        assert!(
            !self.root_task_indices.is_empty(),
            "no root tasks detected, this indicates a cycle"
        );
    }

    /// Enqueues the root tasks; the graph drains asynchronously on the
    /// executor's workers. The graph and executor must outlive the run; use
    /// [`Self::wait`] to block until it completes.
    pub fn run(&self, task_executor: &TaskExecutor) {
        assert!(!self.task_runtimes.is_empty(), "the graph was not finalized");
        assert!(self.task_executor.load(Ordering::Relaxed).is_null(), "already running");

        *self.completed.lock().expect("completion mutex") = false;
        self.task_executor.store(
            std::ptr::from_ref(task_executor).cast_mut(),
            Ordering::Release,
        );
        self.remaining_leaf_task_count
            .store(self.leaf_task_count, Ordering::Relaxed);

        for (task_index, definition) in self.task_definitions.iter().enumerate() {
            let runtime = &self.task_runtimes[task_index];
            runtime.task.initialize(
                run_task_trampoline,
                std::ptr::from_ref(self).cast(),
                task_index,
                0,
            );
            // Relaxed: nothing is published here, we are only preparing the
            // dependency counts
            runtime
                .remaining_predecessor_count
                .store(definition.predecessor_task_count, Ordering::Relaxed);
        }

        for &task_index in &self.root_task_indices {
            // SAFETY: runtimes live as long as the graph, which outlives the
            // run by contract.
            unsafe { task_executor.enqueue_task(&self.task_runtimes[task_index].task) };
        }
    }

    /// Blocks until every leaf task has completed.
    pub fn wait(&self) {
        let mut completed = self.completed.lock().expect("completion mutex");
        while !*completed {
            completed = self
                .completed_condvar
                .wait(completed)
                .expect("completion mutex");
        }
    }

    pub fn run_and_wait(&self, task_executor: &TaskExecutor) {
        self.run(task_executor);
        self.wait();
    }

    fn executor(&self) -> &TaskExecutor {
        let executor = self.task_executor.load(Ordering::Acquire);
        assert!(!executor.is_null(), "the graph is not running");
        // SAFETY: the executor outlives the run by contract.
        unsafe { &*executor }
    }

    fn run_task(&self, task_index: usize) {
        let definition = &self.task_definitions[task_index];
        let runtime = &self.task_runtimes[task_index];

        // Throwaway acquire load: publishes all writes released by our
        // predecessors' count decrements to this thread
        let remaining_predecessor_count =
            runtime.remaining_predecessor_count.load(Ordering::Acquire);
        debug_assert_eq!(remaining_predecessor_count, 0);

        if let Some(get_sub_task_count) = &definition.get_sub_task_count {
            let sub_task_count = get_sub_task_count();
            assert!(sub_task_count <= definition.max_sub_task_count);
            if sub_task_count == 0 {
                // No sub-tasks to run; kick off successors immediately
                self.decrement_successor_predecessor_counts(task_index);
            } else {
                runtime
                    .remaining_sub_task_count
                    .store(sub_task_count, Ordering::Relaxed);
                for sub_task_index in 0..sub_task_count {
                    let sub_task = &runtime.sub_tasks[sub_task_index];
                    sub_task.initialize(
                        run_sub_task_trampoline,
                        std::ptr::from_ref(self).cast(),
                        task_index,
                        sub_task_index,
                    );
                    // SAFETY: sub-tasks live as long as the graph.
                    unsafe { self.executor().enqueue_task(sub_task) };
                }
            }
        } else {
            match &definition.execute {
                TaskExecute::Plain(execute) => {
                    execute();
                    self.decrement_successor_predecessor_counts(task_index);
                }
                TaskExecute::WithCompleter(execute) => {
                    execute(TaskCompleter {
                        graph: self,
                        task_index,
                    });
                }
                _ => unreachable!("fan-out execute without a sub-task count"),
            }
        }
    }

    fn run_sub_task(&self, task_index: usize, sub_task_index: usize) {
        let definition = &self.task_definitions[task_index];
        match &definition.execute {
            TaskExecute::SubTask(execute) => {
                execute(sub_task_index);
                self.decrement_remaining_sub_task_count(task_index);
            }
            TaskExecute::SubTaskWithCompleter(execute) => {
                execute(
                    sub_task_index,
                    TaskCompleter {
                        graph: self,
                        task_index,
                    },
                );
            }
            _ => unreachable!("sub-task execute on a non-fan-out task"),
        }
    }

    fn decrement_successor_predecessor_counts(&self, task_index: usize) {
        let definition = &self.task_definitions[task_index];
        for &successor_task_index in &definition.successor_task_indices {
            let pre_decrement_count = self.task_runtimes[successor_task_index]
                .remaining_predecessor_count
                .fetch_sub(1, Ordering::Release);
            debug_assert!(pre_decrement_count >= 1);
            if pre_decrement_count == 1 {
                // SAFETY: runtimes live as long as the graph.
                unsafe {
                    self.executor()
                        .enqueue_task(&self.task_runtimes[successor_task_index].task)
                };
            }
        }

        if definition.successor_task_indices.is_empty() {
            let pre_decrement_count = self
                .remaining_leaf_task_count
                .fetch_sub(1, Ordering::Release);
            debug_assert!(pre_decrement_count >= 1);
            if pre_decrement_count == 1 {
                // Clearing the executor pointer signals global completion
                self.task_executor
                    .store(std::ptr::null_mut(), Ordering::Release);
                *self.completed.lock().expect("completion mutex") = true;
                self.completed_condvar.notify_all();
            }
        }
    }

    fn decrement_remaining_sub_task_count(&self, task_index: usize) {
        let runtime = &self.task_runtimes[task_index];
        let pre_decrement_count = runtime
            .remaining_sub_task_count
            .fetch_sub(1, Ordering::Release);
        debug_assert!(pre_decrement_count >= 1);
        if pre_decrement_count == 1 {
            // Throwaway acquire load so the other sub-task threads' writes
            // are visible when we kick off successors from this thread
            let remaining_sub_task_count =
                runtime.remaining_sub_task_count.load(Ordering::Acquire);
            debug_assert_eq!(remaining_sub_task_count, 0);

            self.decrement_successor_predecessor_counts(task_index);
        }
    }

    fn complete_task(&self, task_index: usize) {
        if self.task_definitions[task_index].get_sub_task_count.is_some() {
            self.decrement_remaining_sub_task_count(task_index);
        } else {
            self.decrement_successor_predecessor_counts(task_index);
        }
    }
}

unsafe fn run_task_trampoline(context: *const (), task_index: usize, _argument1: usize) {
    // SAFETY: the context is the graph, alive for the whole run.
    let graph = unsafe { &*context.cast::<StaticTaskGraph>() };
    graph.run_task(task_index);
}

unsafe fn run_sub_task_trampoline(context: *const (), task_index: usize, sub_task_index: usize) {
    // SAFETY: the context is the graph, alive for the whole run.
    let graph = unsafe { &*context.cast::<StaticTaskGraph>() };
    graph.run_sub_task(task_index, sub_task_index);
}
