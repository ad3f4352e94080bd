//! Integration tests for the `bitmap_pool` package.
//!
//! These tests exercise the public API end to end: filling pools to capacity, growth, the
//! checked usage contract, size-class routing and both iteration modes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitmap_pool::{
    Error, FixedLayoutAllocator, FixedTypeAllocator, GeneralPurposeAllocator, GrowthPolicy,
    IterationMode, SlotHandle,
};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
    lifetime: u32,
}

#[test]
fn every_capacity_fills_then_grows_or_returns_unbound() {
    for capacity in (8..=128).step_by(8) {
        let mut fixed = FixedTypeAllocator::<u32>::builder()
            .capacity(capacity)
            .growth_policy(GrowthPolicy::Fixed)
            .build()
            .unwrap();

        let mut growing = FixedTypeAllocator::<u32>::builder()
            .capacity(capacity)
            .build()
            .unwrap();

        for _ in 0..capacity {
            assert!(fixed.allocate().unwrap().is_bound());
            assert!(growing.allocate().unwrap().is_bound());
        }

        assert_eq!(fixed.len(), capacity);
        assert_eq!(growing.len(), capacity);

        assert!(!fixed.allocate().unwrap().is_bound());
        assert_eq!(fixed.capacity(), capacity);

        assert!(growing.allocate().unwrap().is_bound());
        assert_eq!(growing.capacity(), capacity * 2);
    }
}

#[test]
fn freed_slot_is_clear_before_next_allocation() {
    let mut pool = FixedTypeAllocator::<u64>::builder()
        .capacity(8)
        .growth_policy(GrowthPolicy::Fixed)
        .build()
        .unwrap();

    let mut handles = (0..8_u64)
        .map(|value| pool.insert(value).unwrap())
        .collect::<Vec<_>>();

    let freed_index = handles[3].index();
    pool.free(&mut handles[3]).unwrap();

    assert!(!pool.is_occupied(freed_index));

    let replacement = pool.insert(0xDEAD_BEEF).unwrap();

    assert!(replacement.is_bound());
    assert_eq!(replacement.index(), freed_index);
    assert_eq!(*pool.get(&replacement).unwrap(), 0xDEAD_BEEF);
}

#[test]
fn double_free_is_a_contract_violation() {
    let mut pool = FixedTypeAllocator::<u64>::new().unwrap();

    let mut handle = pool.insert(1).unwrap();
    let mut copy = handle;

    pool.free(&mut handle).unwrap();

    let error = pool.free(&mut copy).unwrap_err();
    assert!(error.is_contract_violation());
    assert!(matches!(error, Error::DoubleFree { .. }));
}

#[test]
fn growth_preserves_every_value() {
    let mut pool = FixedTypeAllocator::<Particle>::builder()
        .capacity(64)
        .build()
        .unwrap();

    let handles = (0..1000_u32)
        .map(|n| {
            pool.insert(Particle {
                lifetime: n,
                ..Particle::default()
            })
            .unwrap()
        })
        .collect::<Vec<_>>();

    assert_eq!(pool.capacity(), 1024);
    assert_eq!(pool.len(), 1000);

    for (n, handle) in (0..1000_u32).zip(&handles) {
        assert_eq!(pool.get(handle).unwrap().lifetime, n);
    }
}

#[test]
fn out_of_range_free_does_not_mutate() {
    let mut pool = FixedTypeAllocator::<u64>::builder()
        .capacity(16)
        .build()
        .unwrap();

    for value in 0..5 {
        pool.insert(value).unwrap();
    }

    let occupancy_before = (0..16).map(|index| pool.is_occupied(index)).collect::<Vec<_>>();

    let mut handle = SlotHandle::from_parts(pool.pool_id(), 16);
    let error = pool.free(&mut handle).unwrap_err();

    assert!(matches!(
        error,
        Error::OutOfBounds {
            index: 16,
            capacity: 16
        }
    ));
    assert_eq!(pool.len(), 5);
    assert_eq!(
        (0..16).map(|index| pool.is_occupied(index)).collect::<Vec<_>>(),
        occupancy_before
    );
}

#[test]
fn size_class_routing() {
    let mut allocator = GeneralPurposeAllocator::new().unwrap();

    let handle = allocator.insert([1_u8; 20]).unwrap();

    assert_eq!(allocator.class_for::<[u8; 20]>().unwrap(), 32);
    assert_eq!(
        handle.pool_id(),
        Some(allocator.class_pool(32).unwrap().pool_id())
    );

    assert!(matches!(
        allocator.insert([0_u8; 300]),
        Err(Error::SizeClassExhausted { size: 300, .. })
    ));
}

#[test]
fn active_iteration_visits_exactly_the_live_objects() {
    let mut pool = FixedTypeAllocator::<u32>::builder()
        .capacity(16)
        .build()
        .unwrap();

    let mut handles = (0..10).map(|n| pool.insert(n).unwrap()).collect::<Vec<_>>();

    pool.free(&mut handles[2]).unwrap();
    pool.free(&mut handles[5]).unwrap();

    let mut visits = 0;
    pool.for_each(IterationMode::Active, |_| visits += 1)
        .unwrap();

    assert_eq!(visits, 8);
}

#[test]
fn iteration_modes_agree_when_packed() {
    let mut pool = FixedTypeAllocator::<u32>::builder()
        .capacity(32)
        .build()
        .unwrap();

    for n in 0..32 {
        pool.insert(n * n).unwrap();
    }

    let mut active = Vec::new();
    pool.for_each(IterationMode::Active, |n| active.push(*n))
        .unwrap();

    let mut fast = Vec::new();
    pool.for_each(IterationMode::Fast, |n| fast.push(*n))
        .unwrap();

    assert_eq!(active, fast);
}

#[test]
fn particle_simulation() {
    let growths = Arc::new(AtomicUsize::new(0));

    let mut particles = FixedTypeAllocator::<Particle>::builder()
        .on_grow({
            let growths = Arc::clone(&growths);
            move || {
                growths.fetch_add(1, Ordering::Relaxed);
            }
        })
        .build()
        .unwrap();

    let mut handles = (0..4096)
        .map(|_| {
            let handle = particles.allocate().unwrap();
            let particle = particles.get_mut(&handle).unwrap();
            particle.velocity = [1.0, 2.0, 3.0];
            particle.lifetime = 3;
            handle
        })
        .collect::<Vec<_>>();

    // 1024 -> 2048 -> 4096
    assert_eq!(growths.load(Ordering::Relaxed), 2);
    assert!(particles.is_full());

    // Every other particle expires early.
    for handle in handles.iter_mut().step_by(2) {
        particles.free(handle).unwrap();
    }

    for _ in 0..3 {
        particles
            .for_each(IterationMode::Active, |particle| {
                for axis in 0..3 {
                    particle.position[axis] += particle.velocity[axis];
                }
                particle.lifetime -= 1;
            })
            .unwrap();
    }

    assert_eq!(particles.len(), 2048);

    for handle in handles.iter().skip(1).step_by(2) {
        let particle = particles.get(handle).unwrap();
        assert_eq!(particle.position, [3.0, 6.0, 9.0]);
        assert_eq!(particle.lifetime, 0);
    }
}

#[test]
fn general_purpose_mixed_workload() {
    #[derive(Default)]
    struct Node {
        id: u64,
        neighbors: [u32; 10],
    }

    let mut allocator = GeneralPurposeAllocator::builder()
        .capacity(8)
        .build()
        .unwrap();

    assert_eq!(allocator.class_for::<Node>().unwrap(), 64);

    let mut nodes = Vec::new();
    let mut counters = Vec::new();

    for id in 0..100_u64 {
        let node = allocator.allocate::<Node>().unwrap();

        // SAFETY: The handle was issued for a Node just now.
        unsafe {
            let node_ref = allocator.get_mut(&node).unwrap();
            node_ref.id = id;
            node_ref.neighbors[0] = u32::try_from(id).unwrap();
        }

        nodes.push(node);
        counters.push(allocator.insert(id * 2).unwrap());
    }

    assert_eq!(allocator.len(), 200);
    assert_eq!(allocator.class_pool(64).unwrap().len(), 100);
    assert_eq!(allocator.class_pool(8).unwrap().len(), 100);

    for (id, (node, counter)) in (0..100_u64).zip(nodes.iter().zip(&counters)) {
        // SAFETY: Both handles are live and were issued for these types.
        unsafe {
            assert_eq!(allocator.get(node).unwrap().id, id);
            assert_eq!(*allocator.get(counter).unwrap(), id * 2);
        }
    }

    for handle in &mut nodes {
        // SAFETY: The handle is live and was issued for a Node.
        unsafe { allocator.delete(handle) }.unwrap();
    }

    for handle in &mut counters {
        // SAFETY: The handle is live and was issued for a u64.
        unsafe { allocator.delete(handle) }.unwrap();
    }

    assert!(allocator.is_empty());
}

#[test]
fn fixed_layout_pool_hands_out_resolvable_slots() {
    let mut pool =
        FixedLayoutAllocator::new(std::alloc::Layout::new::<[u64; 2]>(), 8, GrowthPolicy::Doubling)
            .unwrap();

    let first = pool.claim().unwrap().unwrap();
    assert_eq!(first.index(), 0);
    assert!(!first.grew());

    let slot = pool.slot_ptr(first.index()).unwrap().cast::<[u64; 2]>();

    // SAFETY: The slot was just claimed and is sized and aligned for a [u64; 2].
    unsafe {
        slot.write([11, 22]);
    }

    let handle = SlotHandle::<[u64; 2]>::from_parts(pool.pool_id(), first.index());

    // SAFETY: The slot holds the [u64; 2] written above.
    assert_eq!(unsafe { pool.get(&handle) }.unwrap(), &[11, 22]);

    pool.release(first.index()).unwrap();
    assert!(pool.is_empty());
}
