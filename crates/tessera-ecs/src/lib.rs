//! Tessera ECS -- archetype storage core for an Entity-Component-System
//! runtime.
//!
//! The crate is a data store: it associates typed component values with
//! opaque 64-bit entity ids, groups entities by their exact component
//! composition into columnar *tables*, and keeps transitions between tables
//! cheap through a cached graph of add/remove edges. Components are
//! registered at runtime with a size and alignment, optionally carrying
//! erased lifecycle hooks (ctor/dtor/copy/move); queries, systems and
//! scheduling live in downstream crates that consume this surface.
//!
//! Mutations issued while a defer scope is open are recorded in a
//! per-writer log and replayed in order when the scope closes, which is how
//! hosted runtimes mutate safely during iteration.
//!
//! # Quick Start
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! let mut world = World::new();
//! let position = world.new_component("position", 8, 4);
//!
//! let entity = world.new_id();
//! let value: [i32; 2] = [3, 4];
//! unsafe {
//!     world
//!         .set_ptr(entity, position, value.as_ptr() as *const u8, 8)
//!         .unwrap();
//! }
//!
//! assert!(world.has(entity, position));
//! let ptr = world.get(entity, position).unwrap();
//! assert_eq!(unsafe { *(ptr as *const [i32; 2]) }, [3, 4]);
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod component;
pub mod entity;
pub(crate) mod graph;
pub(crate) mod sparse;
#[allow(unsafe_code)]
pub(crate) mod stage;
#[allow(unsafe_code)]
pub mod table;
#[allow(unsafe_code)]
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

use crate::entity::EntityId;

/// Errors produced by world operations.
///
/// Only recoverable, user-visible failures surface here. Invariant
/// violations and precondition breaches (null ids, size mismatches) panic:
/// the data model is too intertwined to unwind from a corrupt partial
/// mutation.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity is not alive: its generation is stale or it was deleted.
    #[error("entity {entity:?} is not alive (stale or deleted)")]
    NotAlive { entity: EntityId },

    /// The id does not resolve to a registered component.
    #[error("id {id:?} is not a registered component")]
    NotAComponent { id: EntityId },

    /// Data access on a component without a data column (a tag).
    #[error("component {id:?} carries no data (tag)")]
    InvalidComponent { id: EntityId },

    /// Lifecycle hooks conflict with a previously installed set.
    #[error("lifecycle hooks for {component:?} disagree with the installed set")]
    InconsistentComponentAction { component: EntityId },

    /// The operation is not legal in the current world state.
    #[error("invalid operation: {what}")]
    InvalidOperation { what: &'static str },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{Component, Lifecycle, Name};
    pub use crate::entity::{
        EntityId, COMPONENT, CORE, DISABLED, MODULE, NAME, SCOPE, WILDCARD,
    };
    pub use crate::table::{TableFlags, TableId};
    pub use crate::world::World;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use crate::prelude::*;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set_u64(world: &mut World, e: EntityId, c: EntityId, value: u64) {
        unsafe {
            world
                .set_ptr(e, c, &value as *const u64 as *const u8, 8)
                .unwrap();
        }
    }

    fn get_u64(world: &World, e: EntityId, c: EntityId) -> Option<u64> {
        world
            .get(e, c)
            .map(|ptr| unsafe { ptr::read(ptr as *const u64) })
    }

    // -- bootstrap -----------------------------------------------------------

    #[test]
    fn bootstrap_register_add_delete() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        world.set_lifecycle(c, Lifecycle::default()).unwrap();

        let e = world.new_id();
        world.add(e, c).unwrap();
        assert!(world.has(e, c));

        world.delete(e).unwrap();
        assert!(!world.is_alive(e));
    }

    #[test]
    fn builtins_are_named_and_scoped() {
        let world = World::new();
        assert_eq!(world.name_of(COMPONENT), Some("Component"));
        assert_eq!(world.lookup_child(CORE, "Component"), Some(COMPONENT));
        assert_eq!(world.lookup_child(CORE, "Wildcard"), Some(WILDCARD));
        assert!(world.has(MODULE, EntityId::role(SCOPE, CORE)));
    }

    // -- set / get round-trip ------------------------------------------------

    #[test]
    fn set_get_roundtrip() {
        #[derive(Clone, Copy, PartialEq, Debug)]
        struct Pos {
            x: i32,
            y: i32,
        }

        let mut world = World::new();
        let pos = world.new_component("position", 8, 4);
        let e = world.new_id();

        let value = Pos { x: 3, y: 4 };
        unsafe {
            world
                .set_ptr(e, pos, &value as *const Pos as *const u8, 8)
                .unwrap();
        }
        let got = unsafe { ptr::read(world.get(e, pos).unwrap() as *const Pos) };
        assert_eq!(got, Pos { x: 3, y: 4 });
    }

    #[test]
    fn has_agrees_with_get_for_data_components() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        let other = world.new_component("other", 8, 8);

        let e = world.new_id();
        set_u64(&mut world, e, c, 1);

        assert_eq!(world.has(e, c), world.get(e, c).is_some());
        assert_eq!(world.has(e, other), world.get(e, other).is_some());
    }

    // -- archetype transitions -----------------------------------------------

    #[test]
    fn add_remove_returns_to_original_type() {
        let mut world = World::new();
        let t1 = world.new_tag("t1");
        let t2 = world.new_tag("t2");

        let e = world.new_id();
        world.add(e, t1).unwrap();
        let type_a = world.type_of(e).unwrap().to_vec();

        world.add(e, t2).unwrap();
        let type_b = world.type_of(e).unwrap().to_vec();
        assert_ne!(type_a, type_b);

        world.remove(e, t2).unwrap();
        assert_eq!(world.type_of(e).unwrap(), type_a.as_slice());
    }

    #[test]
    fn permuted_id_lists_reach_one_table() {
        let mut world = World::new();
        let a = world.new_tag("a");
        let b = world.new_tag("b");
        let c = world.new_tag("c");

        let tables_before = world.table_count();
        let e1 = world.spawn(&[a, b, c]);
        let e2 = world.spawn(&[c, a, b]);
        let e3 = world.spawn(&[b, c, a, a]);

        assert_eq!(world.type_of(e1), world.type_of(e2));
        assert_eq!(world.type_of(e2), world.type_of(e3));
        // One archetype for the set, plus the intermediate single- and
        // double-tag tables from the stepwise adds.
        assert!(world.table_count() > tables_before);
        let t1 = world.type_of(e1).unwrap();
        assert_eq!(t1, &[a, b, c][..]);
    }

    // -- lifecycle hooks -----------------------------------------------------

    #[test]
    fn lifecycle_hooks_fire_once_per_transition() {
        static CTOR: AtomicUsize = AtomicUsize::new(0);
        static DTOR: AtomicUsize = AtomicUsize::new(0);
        static MOVE: AtomicUsize = AtomicUsize::new(0);

        unsafe fn ctor(ptr: *mut u8, size: usize, count: usize) {
            CTOR.fetch_add(count, Ordering::SeqCst);
            ptr::write_bytes(ptr, 0, size * count);
        }
        unsafe fn dtor(_ptr: *mut u8, _size: usize, count: usize) {
            DTOR.fetch_add(count, Ordering::SeqCst);
        }
        unsafe fn move_fn(dst: *mut u8, src: *mut u8, size: usize, count: usize) {
            MOVE.fetch_add(count, Ordering::SeqCst);
            ptr::copy_nonoverlapping(src, dst, size * count);
        }

        let mut world = World::new();
        let s = world.new_component("s", 8, 8);
        let other = world.new_tag("other");
        world
            .set_lifecycle(
                s,
                Lifecycle {
                    ctor: Some(ctor),
                    dtor: Some(dtor),
                    copy: None,
                    move_: Some(move_fn),
                },
            )
            .unwrap();

        let e = world.new_id();
        world.add(e, s).unwrap();
        assert_eq!(CTOR.load(Ordering::SeqCst), 1);
        assert_eq!(DTOR.load(Ordering::SeqCst), 0);

        // Cross-table move: the value is relocated, not re-created.
        world.add(e, other).unwrap();
        assert_eq!(MOVE.load(Ordering::SeqCst), 1);
        assert_eq!(CTOR.load(Ordering::SeqCst), 1);
        assert_eq!(DTOR.load(Ordering::SeqCst), 0);

        world.delete(e).unwrap();
        assert_eq!(CTOR.load(Ordering::SeqCst), 1);
        assert_eq!(DTOR.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn conflicting_lifecycle_install_fails() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        world.set_lifecycle(c, Lifecycle::of::<u64>()).unwrap();
        let err = world.set_lifecycle(c, Lifecycle::default()).unwrap_err();
        assert!(matches!(err, EcsError::InconsistentComponentAction { .. }));
    }

    #[test]
    fn copy_hook_clones_on_set() {
        let mut world = World::new();
        let c = world.new_component(
            "label",
            std::mem::size_of::<Name>(),
            std::mem::align_of::<Name>(),
        );
        world.set_lifecycle(c, Lifecycle::of::<Name>()).unwrap();

        let e = world.new_id();
        let original = Name::new("hello");
        unsafe {
            world
                .set_ptr(
                    e,
                    c,
                    &original as *const Name as *const u8,
                    std::mem::size_of::<Name>(),
                )
                .unwrap();
        }
        // The column owns a clone; the original is still valid.
        assert_eq!(original.value, "hello");
        let stored = unsafe { &*(world.get(e, c).unwrap() as *const Name) };
        assert_eq!(stored.value, "hello");
        drop(original);

        // Overwrite destroys the old clone and stores a new one.
        let replacement = Name::new("bye");
        unsafe {
            world
                .set_ptr(
                    e,
                    c,
                    &replacement as *const Name as *const u8,
                    std::mem::size_of::<Name>(),
                )
                .unwrap();
        }
        let stored = unsafe { &*(world.get(e, c).unwrap() as *const Name) };
        assert_eq!(stored.value, "bye");
    }

    // -- deferred ops --------------------------------------------------------

    #[test]
    fn deferred_ops_apply_on_scope_exit() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        let e = world.new_id();

        world.defer_begin();
        set_u64(&mut world, e, c, 9);
        assert!(!world.has(e, c), "deferred set must not apply early");
        world.defer_end();

        assert_eq!(get_u64(&world, e, c), Some(9));
    }

    #[test]
    fn deferred_add_then_delete_discards() {
        static CTOR: AtomicUsize = AtomicUsize::new(0);
        static DTOR: AtomicUsize = AtomicUsize::new(0);

        unsafe fn ctor(ptr: *mut u8, size: usize, count: usize) {
            CTOR.fetch_add(count, Ordering::SeqCst);
            ptr::write_bytes(ptr, 0, size * count);
        }
        unsafe fn dtor(_ptr: *mut u8, _size: usize, count: usize) {
            DTOR.fetch_add(count, Ordering::SeqCst);
        }

        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        world
            .set_lifecycle(
                c,
                Lifecycle {
                    ctor: Some(ctor),
                    dtor: Some(dtor),
                    copy: None,
                    move_: None,
                },
            )
            .unwrap();

        let e = world.new_id();
        world.defer_begin();
        world.add(e, c).unwrap();
        world.delete(e).unwrap();
        world.defer_end();

        assert!(!world.is_alive(e));
        assert_eq!(CTOR.load(Ordering::SeqCst), 0, "no component constructed");
        assert_eq!(DTOR.load(Ordering::SeqCst), 0, "no component destructed");
    }

    #[test]
    fn nested_defer_flushes_at_outermost_exit() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        let e = world.new_id();

        world.defer_begin();
        world.defer_begin();
        set_u64(&mut world, e, c, 5);
        world.defer_end();
        assert!(!world.has(e, c), "inner exit must not flush");
        world.defer_end();
        assert_eq!(get_u64(&world, e, c), Some(5));
    }

    #[test]
    fn deferred_spawn_lands_with_scope() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        let parent = world.new_id();

        world.set_scope(parent);
        world.defer_begin();
        let child = world.spawn(&[c]);
        assert!(world.is_alive(child), "id is allocated at enqueue time");
        assert!(!world.has(child, c));
        world.defer_end();
        world.set_scope(EntityId::NULL);

        assert!(world.has(child, c));
        assert!(world.has(child, EntityId::role(SCOPE, parent)));
    }

    #[test]
    fn iteration_parks_ops_until_merge() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);
        let e = world.new_id();

        world.iteration_begin();
        assert!(matches!(
            world.add(e, c),
            Err(EcsError::InvalidOperation { .. })
        ));

        world.defer_begin();
        world.add(e, c).unwrap();
        world.defer_end();
        assert!(!world.has(e, c), "parked until the merge barrier");
        world.iteration_end();

        assert!(world.has(e, c));
    }

    // -- generation recycling ------------------------------------------------

    #[test]
    fn generation_recycling() {
        let mut world = World::new();
        let e1 = world.new_id();
        world.delete(e1).unwrap();
        let e2 = world.new_id();

        assert_eq!(e1.index(), e2.index());
        assert!(e2.generation() > e1.generation());
        assert!(world.is_alive(e2));
        assert!(!world.is_alive(e1));
        assert!(world.exists(e1));
    }

    // -- storage invariants --------------------------------------------------

    #[test]
    fn column_lengths_agree_with_entities() {
        let mut world = World::new();
        let a = world.new_component("a", 8, 8);
        let b = world.new_component("b", 4, 4);

        let mut spawned = Vec::new();
        for i in 0..100u64 {
            let e = world.spawn(&[a, b]);
            set_u64(&mut world, e, a, i);
            spawned.push(e);
        }
        for e in spawned.iter().step_by(3) {
            world.delete(*e).unwrap();
        }

        for table in &world.store.tables {
            for column_index in 0..table.column_count() {
                let id = table.type_()[column_index];
                if world
                    .component_info(id)
                    .map_or(false, |info| info.size > 0)
                {
                    // Every data column is exactly as long as the entity
                    // column.
                    let rows = table.count();
                    for row in 0..rows {
                        assert!(table.get_ptr(id, row).is_some());
                    }
                    assert!(table.get_ptr(id, rows).is_none());
                }
            }
        }
    }

    #[test]
    fn values_survive_swap_deletes() {
        let mut world = World::new();
        let c = world.new_component("c", 8, 8);

        let entities: Vec<EntityId> = (0..10u64)
            .map(|i| {
                let e = world.new_id();
                set_u64(&mut world, e, c, i * 11);
                e
            })
            .collect();

        world.delete(entities[0]).unwrap();
        world.delete(entities[4]).unwrap();
        world.delete(entities[9]).unwrap();

        for (i, e) in entities.iter().enumerate() {
            if matches!(i, 0 | 4 | 9) {
                assert!(!world.is_alive(*e));
            } else {
                assert_eq!(get_u64(&world, *e, c), Some(i as u64 * 11));
            }
        }
    }
}
