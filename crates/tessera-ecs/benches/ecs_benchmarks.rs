//! Storage-core benchmarks: entity churn, archetype transitions, and
//! deferred flush throughput.
//!
//! Run with: `cargo bench --bench ecs_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tessera_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    world: World,
    position: EntityId,
    velocity: EntityId,
    health: EntityId,
}

fn setup() -> Fixture {
    let mut world = World::new();
    let position = world.new_component("position", 16, 8);
    let velocity = world.new_component("velocity", 16, 8);
    let health = world.new_component("health", 4, 4);
    Fixture {
        world,
        position,
        velocity,
        health,
    }
}

fn set_bytes(world: &mut World, e: EntityId, c: EntityId, bytes: &[u8]) {
    unsafe {
        world
            .set_ptr(e, c, bytes.as_ptr(), bytes.len())
            .expect("benchmark component set");
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// Spawn N entities with two components each.
fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");
    for count in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut fixture = setup();
                let pos = [0u8; 16];
                for _ in 0..count {
                    let e = fixture.world.new_id();
                    set_bytes(&mut fixture.world, e, fixture.position, &pos);
                    set_bytes(&mut fixture.world, e, fixture.velocity, &pos);
                }
                black_box(fixture.world.entity_count())
            });
        });
    }
    group.finish();
}

/// Add/remove a third component, bouncing rows between two tables.
fn bench_archetype_transition(c: &mut Criterion) {
    let mut fixture = setup();
    let pos = [0u8; 16];
    let entities: Vec<EntityId> = (0..1_000)
        .map(|_| {
            let e = fixture.world.new_id();
            set_bytes(&mut fixture.world, e, fixture.position, &pos);
            e
        })
        .collect();

    c.bench_function("add_remove_1000", |b| {
        b.iter(|| {
            for &e in &entities {
                fixture.world.add(e, fixture.health).unwrap();
            }
            for &e in &entities {
                fixture.world.remove(e, fixture.health).unwrap();
            }
        });
    });
}

/// Read every position through the dense component iterator.
fn bench_iteration(c: &mut Criterion) {
    let mut fixture = setup();
    let pos = [7u8; 16];
    for _ in 0..10_000 {
        let e = fixture.world.new_id();
        set_bytes(&mut fixture.world, e, fixture.position, &pos);
    }

    c.bench_function("iter_component_10000", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for (_, ptr) in fixture.world.iter_component(fixture.position) {
                sum += unsafe { *ptr } as u64;
            }
            black_box(sum)
        });
    });
}

/// Queue and flush a batch of deferred sets.
fn bench_deferred_flush(c: &mut Criterion) {
    let mut fixture = setup();
    let entities: Vec<EntityId> = (0..1_000).map(|_| fixture.world.new_id()).collect();
    let pos = [1u8; 16];

    c.bench_function("deferred_set_flush_1000", |b| {
        b.iter(|| {
            fixture.world.defer_begin();
            for &e in &entities {
                set_bytes(&mut fixture.world, e, fixture.position, &pos);
            }
            fixture.world.defer_end();
        });
    });
}

criterion_group!(
    benches,
    bench_spawn,
    bench_archetype_transition,
    bench_iteration,
    bench_deferred_flush
);
criterion_main!(benches);
