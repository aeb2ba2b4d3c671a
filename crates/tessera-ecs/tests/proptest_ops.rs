//! Property tests: random mutation sequences applied directly and applied
//! through one defer scope must converge to the same final world state.
//!
//! The only sanctioned divergence is the add-then-delete discard rule, which
//! is observable solely as "the entity never existed in an intermediate
//! state" -- final states still agree because the entity ends up dead either
//! way.

use std::ptr;

use proptest::prelude::*;
use tessera_ecs::prelude::*;

const ENTITY_POOL: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    AddHp(usize),
    AddArmor(usize),
    SetHp(usize, u64),
    SetArmor(usize, u32),
    RemoveHp(usize),
    RemoveArmor(usize),
    Clear(usize),
    Delete(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..ENTITY_POOL).prop_map(Op::AddHp),
        (0..ENTITY_POOL).prop_map(Op::AddArmor),
        (0..ENTITY_POOL, any::<u64>()).prop_map(|(i, v)| Op::SetHp(i, v)),
        (0..ENTITY_POOL, any::<u32>()).prop_map(|(i, v)| Op::SetArmor(i, v)),
        (0..ENTITY_POOL).prop_map(Op::RemoveHp),
        (0..ENTITY_POOL).prop_map(Op::RemoveArmor),
        (0..ENTITY_POOL).prop_map(Op::Clear),
        (0..ENTITY_POOL).prop_map(Op::Delete),
    ]
}

struct Fixture {
    world: World,
    hp: EntityId,
    armor: EntityId,
    entities: Vec<EntityId>,
}

fn setup() -> Fixture {
    let mut world = World::new();
    let hp = world.new_component("hp", 8, 8);
    let armor = world.new_component("armor", 4, 4);
    let entities = (0..ENTITY_POOL).map(|_| world.new_id()).collect();
    Fixture {
        world,
        hp,
        armor,
        entities,
    }
}

fn apply(fixture: &mut Fixture, ops: &[Op]) {
    let Fixture {
        world,
        hp,
        armor,
        entities,
    } = fixture;
    for op in ops {
        // Ops targeting dead entities fail; both application modes swallow
        // the failure the same way.
        let _ = match *op {
            Op::AddHp(i) => world.add(entities[i], *hp),
            Op::AddArmor(i) => world.add(entities[i], *armor),
            Op::SetHp(i, v) => unsafe {
                world
                    .set_ptr(entities[i], *hp, &v as *const u64 as *const u8, 8)
                    .map(|_| ())
            },
            Op::SetArmor(i, v) => unsafe {
                world
                    .set_ptr(entities[i], *armor, &v as *const u32 as *const u8, 4)
                    .map(|_| ())
            },
            Op::RemoveHp(i) => world.remove(entities[i], *hp),
            Op::RemoveArmor(i) => world.remove(entities[i], *armor),
            Op::Clear(i) => world.clear(entities[i]),
            Op::Delete(i) => world.delete(entities[i]),
        };
    }
}

fn snapshot(fixture: &Fixture) -> Vec<(bool, Option<Vec<EntityId>>, Option<u64>, Option<u32>)> {
    fixture
        .entities
        .iter()
        .map(|&e| {
            let alive = fixture.world.is_alive(e);
            let type_ = fixture.world.type_of(e).map(<[EntityId]>::to_vec);
            let hp = fixture
                .world
                .get(e, fixture.hp)
                .map(|p| unsafe { ptr::read(p as *const u64) });
            let armor = fixture
                .world
                .get(e, fixture.armor)
                .map(|p| unsafe { ptr::read(p as *const u32) });
            (alive, type_, hp, armor)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn direct_and_deferred_converge(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut direct = setup();
        apply(&mut direct, &ops);

        let mut deferred = setup();
        deferred.world.defer_begin();
        apply(&mut deferred, &ops);
        deferred.world.defer_end();

        prop_assert_eq!(snapshot(&direct), snapshot(&deferred));
    }

    #[test]
    fn deferred_batches_in_chunks_converge(
        ops in prop::collection::vec(op_strategy(), 0..40),
        chunk in 1..8usize,
    ) {
        let mut direct = setup();
        apply(&mut direct, &ops);

        let mut chunked = setup();
        for batch in ops.chunks(chunk) {
            chunked.world.defer_begin();
            apply(&mut chunked, batch);
            chunked.world.defer_end();
        }

        prop_assert_eq!(snapshot(&direct), snapshot(&chunked));
    }

    #[test]
    fn liveness_is_consistent_after_random_ops(
        ops in prop::collection::vec(op_strategy(), 0..60),
    ) {
        let mut fixture = setup();
        apply(&mut fixture, &ops);

        for &e in &fixture.entities {
            let alive = fixture.world.is_alive(e);
            prop_assert!(fixture.world.exists(e));
            if !alive {
                prop_assert!(fixture.world.type_of(e).is_none());
                prop_assert!(fixture.world.get(e, fixture.hp).is_none());
            }
            // has() agrees with get() for data components.
            prop_assert_eq!(
                fixture.world.has(e, fixture.hp),
                fixture.world.get(e, fixture.hp).is_some()
            );
        }
    }
}
