//! Contract tests verifying the memory_manager API and its allocator invariants.

use core_types::Value;
use memory_manager::{
    AllocationEffort, ExecutableAllocator, ExecutableMemoryHandle, ObjectHeap, OwnerTag,
    PropertyAttributes, ALLOCATION_GRANULE,
};

fn allocate(allocator: &ExecutableAllocator, size: usize) -> ExecutableMemoryHandle {
    allocator
        .allocate(size, OwnerTag::Other("contract"), AllocationEffort::MaySucceed)
        .expect("pool should have room")
}

fn assert_conservation(allocator: &ExecutableAllocator, reserved: usize) {
    let stats = allocator.statistics();
    assert_eq!(stats.bytes_reserved, reserved);
    assert!(stats.bytes_allocated <= stats.bytes_committed);
    assert!(stats.bytes_committed <= stats.bytes_reserved);
}

/// Scenario: 100, 200 and 50 bytes, free the second, then 150 bytes reuses its space.
#[test]
fn contract_freed_range_is_reused() {
    let allocator = ExecutableAllocator::initialize(1024).unwrap();
    let first = allocate(&allocator, 100);
    let second = allocate(&allocator, 200);
    let third = allocate(&allocator, 50);
    assert_eq!(allocator.statistics().bytes_allocated, 128 + 224 + 64);

    let freed_start = second.start();
    drop(second);

    let fourth = allocate(&allocator, 150);
    assert_eq!(fourth.start(), freed_start);
    assert_eq!(allocator.statistics().bytes_allocated, 128 + 64 + 160);

    drop((first, third, fourth));
    assert_eq!(allocator.statistics().bytes_allocated, 0);
}

#[test]
fn contract_live_handles_never_overlap() {
    let allocator = ExecutableAllocator::initialize(64 * 1024).unwrap();
    let mut live: Vec<ExecutableMemoryHandle> = Vec::new();

    // Deterministic churn: allocate varied sizes, free every third handle.
    for round in 0..120usize {
        let size = 1 + (round * 37) % 700;
        live.push(allocate(&allocator, size));
        if round % 3 == 2 {
            live.remove(round % live.len());
        }
    }

    for (i, a) in live.iter().enumerate() {
        assert_eq!(a.size_in_bytes() % ALLOCATION_GRANULE, 0);
        assert!(allocator.contains(a.start()));
        for b in &live[i + 1..] {
            assert!(
                a.end() <= b.start() || b.end() <= a.start(),
                "{a:?} overlaps {b:?}"
            );
        }
    }
}

#[test]
fn contract_statistics_are_conserved() {
    let allocator = ExecutableAllocator::initialize(32 * 1024).unwrap();
    let reserved = allocator.statistics().bytes_reserved;
    assert_conservation(&allocator, reserved);

    let mut handles = Vec::new();
    for size in [10, 5000, 64, 4096, 900] {
        handles.push(allocate(&allocator, size));
        assert_conservation(&allocator, reserved);
    }
    while let Some(handle) = handles.pop() {
        drop(handle);
        assert_conservation(&allocator, reserved);
    }
    assert_eq!(allocator.statistics().bytes_committed, 0);
}

#[test]
fn contract_memory_pressure_tracks_usage() {
    let allocator = ExecutableAllocator::initialize(4096).unwrap();
    let reserved = allocator.statistics().bytes_reserved;
    let _most = allocate(&allocator, reserved / 4 * 3);
    // allocated / available = 3
    assert!((allocator.memory_pressure() - 3.0).abs() < f64::EPSILON);
}

#[test]
fn contract_handle_bytes_are_writable() {
    let allocator = ExecutableAllocator::initialize(4096).unwrap();
    let mut handle = allocate(&allocator, 64);
    handle.write(0, &[0xCC; 64]).unwrap();
    assert!(handle.as_slice().iter().all(|&b| b == 0xCC));
    assert_eq!(handle.owner(), OwnerTag::Other("contract"));
}

#[test]
fn contract_object_heap_read_only_property() {
    let mut heap = ObjectHeap::new();
    let obj = heap.allocate_object(None);
    heap.put_direct(obj, "k".into(), Value::Smi(1), PropertyAttributes::READ_ONLY);
    let slot = heap.lookup_property(obj, "k").unwrap();
    assert!(!slot.entry.attributes.writable);
    assert_eq!(slot.value, Value::Smi(1));
}
