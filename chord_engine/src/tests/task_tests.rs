//! Static-task-graph scheduling coverage.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::executor::{TaskExecutor, TaskExecutorSettings};
use crate::task_graph::StaticTaskGraph;

fn executor(thread_count: usize) -> TaskExecutor {
    TaskExecutor::new(&TaskExecutorSettings {
        thread_count,
        ..Default::default()
    })
}

#[test]
fn fan_in_observes_predecessor_writes() {
    let executor = executor(4);
    let cells: Arc<[AtomicUsize; 3]> = Arc::new(std::array::from_fn(|_| AtomicUsize::new(0)));
    let observed_sum = Arc::new(AtomicUsize::new(0));

    let mut graph = StaticTaskGraph::new();
    let mut leaves = Vec::new();
    for cell_index in 0..3 {
        let cells = cells.clone();
        leaves.push(graph.add_task(move || {
            // Relaxed is enough: the graph's dependency edges publish
            cells[cell_index].store(cell_index + 1, Ordering::Relaxed);
        }));
    }
    let join = {
        let cells = cells.clone();
        let observed_sum = observed_sum.clone();
        graph.add_task(move || {
            let sum: usize = cells.iter().map(|cell| cell.load(Ordering::Relaxed)).sum();
            observed_sum.store(sum, Ordering::Relaxed);
        })
    };
    for leaf in leaves {
        graph.add_dependency(leaf, join);
    }
    graph.finalize_tasks();

    graph.run_and_wait(&executor);
    assert_eq!(observed_sum.load(Ordering::Relaxed), 6);
}

#[test]
fn sub_tasks_all_run_before_successors() {
    let executor = executor(4);
    const SUB_TASK_COUNT: usize = 16;
    let completed = Arc::new(AtomicUsize::new(0));
    let observed_at_join = Arc::new(AtomicUsize::new(0));

    let mut graph = StaticTaskGraph::new();
    let fan_out = {
        let completed = completed.clone();
        graph.add_tasks(SUB_TASK_COUNT, move |_sub_task_index| {
            completed.fetch_add(1, Ordering::Relaxed);
        })
    };
    let join = {
        let completed = completed.clone();
        let observed_at_join = observed_at_join.clone();
        graph.add_task(move || {
            observed_at_join.store(completed.load(Ordering::Relaxed), Ordering::Relaxed);
        })
    };
    graph.add_dependency(fan_out, join);
    graph.finalize_tasks();

    graph.run_and_wait(&executor);
    assert_eq!(observed_at_join.load(Ordering::Relaxed), SUB_TASK_COUNT);
}

#[test]
fn runtime_sub_task_count_of_zero_skips_to_successors() {
    let executor = executor(2);
    let ran = Arc::new(AtomicUsize::new(0));
    let successor_ran = Arc::new(AtomicUsize::new(0));

    let mut graph = StaticTaskGraph::new();
    let fan_out = {
        let ran = ran.clone();
        graph.add_tasks_with_count(
            8,
            || 0,
            move |_sub_task_index| {
                ran.fetch_add(1, Ordering::Relaxed);
            },
        )
    };
    let successor = {
        let successor_ran = successor_ran.clone();
        graph.add_task(move || {
            successor_ran.fetch_add(1, Ordering::Relaxed);
        })
    };
    graph.add_dependency(fan_out, successor);
    graph.finalize_tasks();

    graph.run_and_wait(&executor);
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    assert_eq!(successor_ran.load(Ordering::Relaxed), 1);
}

#[test]
fn deferred_completion_gates_successors() {
    let executor = executor(2);
    let (completer_sender, completer_receiver) = crossbeam_channel::bounded(1);
    let successor_ran = Arc::new(AtomicUsize::new(0));

    let mut graph = StaticTaskGraph::new();
    let deferred = graph.add_task_with_completer(move |completer| {
        // Return without completing; the external thread finishes the task
        completer_sender.send(completer).expect("completer handoff");
    });
    let successor = {
        let successor_ran = successor_ran.clone();
        graph.add_task(move || {
            successor_ran.fetch_add(1, Ordering::Relaxed);
        })
    };
    graph.add_dependency(deferred, successor);
    graph.finalize_tasks();

    let external = std::thread::spawn(move || {
        let completer = completer_receiver.recv().expect("completer arrives");
        std::thread::sleep(std::time::Duration::from_millis(10));
        completer.complete_task();
    });

    graph.run_and_wait(&executor);
    external.join().expect("external thread");
    assert_eq!(successor_ran.load(Ordering::Relaxed), 1);
}

#[test]
fn graphs_are_reusable_across_runs() {
    let executor = executor(3);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut graph = StaticTaskGraph::new();
    let first = {
        let counter = counter.clone();
        graph.add_task(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };
    let second = {
        let counter = counter.clone();
        graph.add_task(move || {
            counter.fetch_add(10, Ordering::Relaxed);
        })
    };
    graph.add_dependency(first, second);
    graph.finalize_tasks();

    for _ in 0..5 {
        graph.run_and_wait(&executor);
    }
    assert_eq!(counter.load(Ordering::Relaxed), 55);
}

#[test]
fn sub_tasks_with_completers_complete_independently() {
    let executor = executor(4);
    const SUB_TASK_COUNT: usize = 4;
    let successor_ran = Arc::new(AtomicUsize::new(0));

    let mut graph = StaticTaskGraph::new();
    let fan_out = graph.add_tasks_with_completer(SUB_TASK_COUNT, |_sub_task_index, completer| {
        completer.complete_task();
    });
    let successor = {
        let successor_ran = successor_ran.clone();
        graph.add_task(move || {
            successor_ran.fetch_add(1, Ordering::Relaxed);
        })
    };
    graph.add_dependency(fan_out, successor);
    graph.finalize_tasks();

    graph.run_and_wait(&executor);
    assert_eq!(successor_ran.load(Ordering::Relaxed), 1);
}
