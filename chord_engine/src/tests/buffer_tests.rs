//! Buffer-manager sharing and concurrency coverage.

use chord_native::PrimitiveType;

use crate::buffers::{BufferManager, TaskId};

fn task_id(value: usize) -> TaskId {
    TaskId::from_ptr(value as *const u8)
}

#[test]
fn equal_buffers_share_memory_when_not_concurrent() {
    let mut manager = BufferManager::new();
    let a = manager.add_buffer(PrimitiveType::Float, 128, 1);
    let b = manager.add_buffer(PrimitiveType::Float, 128, 1);
    manager.initialize_buffer_concurrency();
    manager.allocate_buffers();

    assert_eq!(manager.get_buffer(a).memory, manager.get_buffer(b).memory);
    assert_eq!(
        manager.buffer_shared_memory_index(a),
        manager.buffer_shared_memory_index(b)
    );
    assert_eq!(manager.shared_memory_count(), 1);
}

#[test]
fn differing_upsample_factors_do_not_share() {
    let mut manager = BufferManager::new();
    let a = manager.add_buffer(PrimitiveType::Float, 128, 1);
    let b = manager.add_buffer(PrimitiveType::Float, 128, 2);
    manager.initialize_buffer_concurrency();
    manager.allocate_buffers();

    // The byte counts differ, so the buffers land in separate groups
    assert_ne!(manager.get_buffer(a).memory, manager.get_buffer(b).memory);
    assert_eq!(manager.shared_memory_count(), 2);
}

#[test]
fn concurrent_buffers_do_not_share() {
    let mut manager = BufferManager::new();
    let a = manager.add_buffer(PrimitiveType::Float, 128, 1);
    let b = manager.add_buffer(PrimitiveType::Float, 128, 1);
    manager.initialize_buffer_concurrency();
    manager.set_buffers_concurrent(a, b);
    manager.allocate_buffers();

    assert_ne!(manager.get_buffer(a).memory, manager.get_buffer(b).memory);
}

#[test]
fn within_task_sharing_pairs_an_output_with_its_input() {
    // A is produced by task 0 and consumed, shareably, only by task 1;
    // B is produced by task 1. Marking A and B concurrent rules out
    // across-task sharing, so any sharing must be the within-task pairing.
    let mut manager = BufferManager::new();
    let a = manager.add_buffer(PrimitiveType::Float, 64, 1);
    let b = manager.add_buffer(PrimitiveType::Float, 64, 1);
    manager.set_buffer_output_task_for_sharing(a, task_id(0x10));
    manager.add_buffer_input_task(a, task_id(0x20), true);
    manager.set_buffer_output_task_for_sharing(b, task_id(0x20));
    manager.initialize_buffer_concurrency();
    manager.set_buffers_concurrent(a, b);
    manager.allocate_buffers();

    assert_eq!(manager.get_buffer(a).memory, manager.get_buffer(b).memory);
}

#[test]
fn within_task_sharing_respects_consumer_opt_out() {
    let mut manager = BufferManager::new();
    let a = manager.add_buffer(PrimitiveType::Float, 64, 1);
    let b = manager.add_buffer(PrimitiveType::Float, 64, 1);
    manager.set_buffer_output_task_for_sharing(a, task_id(0x10));
    manager.add_buffer_input_task(a, task_id(0x20), false);
    manager.set_buffer_output_task_for_sharing(b, task_id(0x20));
    manager.initialize_buffer_concurrency();
    manager.set_buffers_concurrent(a, b);
    manager.allocate_buffers();

    assert_ne!(manager.get_buffer(a).memory, manager.get_buffer(b).memory);
}

#[test]
fn within_task_sharing_requires_a_single_consumer() {
    let mut manager = BufferManager::new();
    let a = manager.add_buffer(PrimitiveType::Float, 64, 1);
    let b = manager.add_buffer(PrimitiveType::Float, 64, 1);
    manager.set_buffer_output_task_for_sharing(a, task_id(0x10));
    manager.add_buffer_input_task(a, task_id(0x20), true);
    manager.add_buffer_input_task(a, task_id(0x30), true);
    manager.set_buffer_output_task_for_sharing(b, task_id(0x20));
    manager.initialize_buffer_concurrency();
    manager.set_buffers_concurrent(a, b);
    manager.allocate_buffers();

    assert_ne!(manager.get_buffer(a).memory, manager.get_buffer(b).memory);
}

#[test]
fn within_task_sharing_requires_matching_stride() {
    // Same byte count but different upsample factors: a 64-sample 2x buffer
    // and a 128-sample 1x buffer both span 512 bytes, yet iterate at
    // different strides and must not fuse
    let mut manager = BufferManager::new();
    let a = manager.add_buffer(PrimitiveType::Float, 128, 1);
    let b = manager.add_buffer(PrimitiveType::Float, 64, 2);
    manager.set_buffer_output_task_for_sharing(a, task_id(0x10));
    manager.add_buffer_input_task(a, task_id(0x20), true);
    manager.set_buffer_output_task_for_sharing(b, task_id(0x20));
    manager.initialize_buffer_concurrency();
    manager.set_buffers_concurrent(a, b);
    manager.allocate_buffers();

    assert_ne!(manager.get_buffer(a).memory, manager.get_buffer(b).memory);
}

#[test]
fn group_count_never_exceeds_buffer_count() {
    let mut manager = BufferManager::new();
    let handles: Vec<_> = (0..12)
        .map(|index| {
            manager.add_buffer(
                if index % 2 == 0 {
                    PrimitiveType::Float
                } else {
                    PrimitiveType::Double
                },
                64 * (1 + index % 3),
                1,
            )
        })
        .collect();
    manager.initialize_buffer_concurrency();
    for pair in handles.chunks(2) {
        manager.set_buffers_concurrent(pair[0], pair[1]);
    }
    manager.allocate_buffers();

    assert!(manager.shared_memory_count() <= handles.len());
}

#[test]
fn buffers_in_one_group_are_never_concurrent() {
    let mut manager = BufferManager::new();
    let handles: Vec<_> = (0..8)
        .map(|_| manager.add_buffer(PrimitiveType::Float, 64, 1))
        .collect();
    manager.initialize_buffer_concurrency();
    // An arbitrary pattern of conflicts
    manager.set_buffers_concurrent(handles[0], handles[1]);
    manager.set_buffers_concurrent(handles[2], handles[3]);
    manager.set_buffers_concurrent(handles[0], handles[4]);
    manager.set_buffers_concurrent(handles[5], handles[6]);
    manager.allocate_buffers();

    for &a in &handles {
        for &b in &handles {
            if a != b && manager.buffer_shared_memory_index(a) == manager.buffer_shared_memory_index(b)
            {
                assert!(!manager.are_buffers_concurrent(a, b));
            }
        }
    }
}
