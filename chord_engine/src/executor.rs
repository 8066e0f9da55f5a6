//! The worker pool.
//!
//! One bounded MPMC queue per worker thread. Enqueues round-robin across the
//! queues with a bounded number of non-blocking attempts before falling back
//! to a blocking push; workers try their own queue first and then steal from
//! every other queue before blocking on their own.
//!
//! Tasks are externally owned, must outlive their execution, and carry a
//! move-only callable: the worker moves the callable out before invoking it,
//! so the task is reusable (and may be re-initialized) from inside its own
//! execution.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// A task callable: a function pointer plus context words. This shape keeps
/// per-block task rebinding free of heap allocation on the audio path.
#[derive(Clone, Copy)]
pub struct TaskFunction {
    pub function: unsafe fn(*const (), usize, usize),
    pub context: *const (),
    pub argument0: usize,
    pub argument1: usize,
}

/// An executable unit owned by the caller. Initialize before enqueueing;
/// executing moves the callable out, leaving the task reusable.
pub struct Task {
    execute: Cell<Option<TaskFunction>>,
}

// SAFETY: a task's callable cell is only touched by one thread at a time --
// the initializer before enqueue, then the single worker that dequeued it.
// The dependency protocol of the callers establishes this exclusivity.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub const fn new() -> Self {
        Self {
            execute: Cell::new(None),
        }
    }

    pub fn initialize(
        &self,
        function: unsafe fn(*const (), usize, usize),
        context: *const (),
        argument0: usize,
        argument1: usize,
    ) {
        self.execute.set(Some(TaskFunction {
            function,
            context,
            argument0,
            argument1,
        }));
    }

    pub fn is_initialized(&self) -> bool {
        let function = self.execute.get();
        function.is_some()
    }

    fn take(&self) -> Option<TaskFunction> {
        self.execute.take()
    }
}

#[derive(Clone, Copy)]
struct TaskPtr(*const Task);

// SAFETY: the pointee is externally owned and outlives its execution by
// contract; the Task itself synchronizes hand-off.
unsafe impl Send for TaskPtr {}

#[derive(Clone, Default)]
pub struct TaskExecutorSettings {
    /// Worker thread count; 0 selects the hardware concurrency.
    pub thread_count: usize,
    /// Per-thread queue capacity; 0 selects a default.
    pub queue_capacity: usize,
    pub initialize_task_thread: Option<Arc<dyn Fn() + Send + Sync>>,
    pub deinitialize_task_thread: Option<Arc<dyn Fn() + Send + Sync>>,
}

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const TRY_PUSH_ATTEMPT_COUNT: usize = 20;

thread_local! {
    static CURRENT_TASK_THREAD_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the executor worker thread we are currently running on, if any.
/// Used to select per-thread scratch memory.
pub fn current_task_thread_index() -> Option<usize> {
    CURRENT_TASK_THREAD_INDEX.with(Cell::get)
}

pub struct TaskExecutor {
    // Taken (and dropped) on shutdown; disconnection wakes blocked workers
    queue_senders: Option<Vec<Sender<TaskPtr>>>,
    threads: Vec<JoinHandle<()>>,
    next_enqueue_base_thread_index: AtomicUsize,
}

impl TaskExecutor {
    pub fn new(settings: &TaskExecutorSettings) -> Self {
        let thread_count = if settings.thread_count == 0 {
            std::thread::available_parallelism().map_or(1, |count| count.get())
        } else {
            settings.thread_count
        };
        let queue_capacity = if settings.queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            settings.queue_capacity
        };

        let mut queue_senders = Vec::with_capacity(thread_count);
        let mut queue_receivers = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let (sender, receiver) = bounded::<TaskPtr>(queue_capacity);
            queue_senders.push(sender);
            queue_receivers.push(receiver);
        }

        let mut threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            let receivers = queue_receivers.clone();
            let initialize = settings.initialize_task_thread.clone();
            let deinitialize = settings.deinitialize_task_thread.clone();
            threads.push(std::thread::spawn(move || {
                task_thread_entry_point(thread_index, &receivers, initialize, deinitialize);
            }));
        }
        log::debug!("task executor started {thread_count} worker threads");

        Self {
            queue_senders: Some(queue_senders),
            threads,
            next_enqueue_base_thread_index: AtomicUsize::new(0),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Hands a task to the pool.
    ///
    /// # Safety
    ///
    /// `task` must be initialized, must stay alive until its callable has
    /// run, and must not be concurrently re-initialized before the worker
    /// moves its callable out.
    pub unsafe fn enqueue_task(&self, task: *const Task) {
        debug_assert!(unsafe { (*task).is_initialized() }, "the task was not initialized");

        let queue_senders = self
            .queue_senders
            .as_ref()
            .expect("the executor is shutting down");
        let task_ptr = TaskPtr(task);
        let base_thread_index = self
            .next_enqueue_base_thread_index
            .fetch_add(1, Ordering::Relaxed);

        for attempt in 0..TRY_PUSH_ATTEMPT_COUNT {
            let queue = &queue_senders[(base_thread_index + attempt) % queue_senders.len()];
            match queue.try_send(task_ptr) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => unreachable!("workers outlive the executor"),
            }
        }

        // Every attempted queue was full; block on the base queue
        queue_senders[base_thread_index % queue_senders.len()]
            .send(task_ptr)
            .expect("workers outlive the executor");
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        // Disconnect the queues so blocked workers wake and exit
        self.queue_senders = None;
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn task_thread_entry_point(
    thread_index: usize,
    queue_receivers: &[Receiver<TaskPtr>],
    initialize: Option<Arc<dyn Fn() + Send + Sync>>,
    deinitialize: Option<Arc<dyn Fn() + Send + Sync>>,
) {
    CURRENT_TASK_THREAD_INDEX.with(|current| current.set(Some(thread_index)));

    if let Some(initialize) = &initialize {
        initialize();
    }

    let thread_count = queue_receivers.len();
    loop {
        // First try to quickly acquire a task, checking our own queue and
        // then stealing from the others
        let mut task = None;
        for attempt in 0..thread_count {
            let mut dequeue_thread_index = thread_index + attempt;
            if dequeue_thread_index >= thread_count {
                dequeue_thread_index -= thread_count;
            }
            if let Ok(stolen) = queue_receivers[dequeue_thread_index].try_recv() {
                task = Some(stolen);
                break;
            }
        }

        let task = match task {
            Some(task) => task,
            // Nothing available anywhere; wait on our own queue. An error
            // here signals that the executor is shutting down.
            None => match queue_receivers[thread_index].recv() {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        // Move the callable out so the task is in a fully released state by
        // the time its execution function runs
        // SAFETY: the task outlives its execution by contract.
        let function = unsafe { (*task.0).take() }.expect("the task was not initialized");
        // SAFETY: the callable's context contract is the initializer's.
        unsafe { (function.function)(function.context, function.argument0, function.argument1) };
    }

    if let Some(deinitialize) = &deinitialize {
        deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    unsafe fn store_true(context: *const (), _argument0: usize, _argument1: usize) {
        let flag = unsafe { &*context.cast::<AtomicBool>() };
        flag.store(true, Ordering::Release);
    }

    #[test]
    fn executes_an_enqueued_task() {
        let executor = TaskExecutor::new(&TaskExecutorSettings {
            thread_count: 2,
            ..Default::default()
        });

        let flag = Box::new(AtomicBool::new(false));
        let task = Box::new(Task::new());
        task.initialize(store_true, std::ptr::from_ref(flag.as_ref()).cast(), 0, 0);
        unsafe { executor.enqueue_task(std::ptr::from_ref(task.as_ref())) };

        while !flag.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        assert!(!task.is_initialized());
    }

    #[test]
    fn thread_callbacks_run_on_each_worker() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        {
            let started = started.clone();
            let stopped = stopped.clone();
            let executor = TaskExecutor::new(&TaskExecutorSettings {
                thread_count: 3,
                initialize_task_thread: Some(Arc::new(move || {
                    started.fetch_add(1, Ordering::Relaxed);
                })),
                deinitialize_task_thread: Some(Arc::new(move || {
                    stopped.fetch_add(1, Ordering::Relaxed);
                })),
                ..Default::default()
            });
            assert_eq!(executor.thread_count(), 3);
        }
        assert_eq!(started.load(Ordering::Relaxed), 3);
        assert_eq!(stopped.load(Ordering::Relaxed), 3);
    }
}
