//! Component descriptors and lifecycle hooks.
//!
//! A component is an entity that carries a [`Component`] row describing its
//! size and alignment. The descriptor itself is stored in table columns like
//! any other component data; this module only defines the payload types, the
//! erased lifecycle hooks, and the two-tier hook registry (flat array for
//! ids below [`HI_COMPONENT_ID`], hash map above).
//!
//! # Safety
//!
//! Lifecycle hooks are function pointers over erased bytes. The table code
//! upholds their calling contract: `ctor` constructs into uninitialized
//! slots, `copy` and `move` write into uninitialized destinations, and a
//! slot consumed by `move` is treated as uninitialized afterwards (its
//! destructor never runs).
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs.

use std::collections::HashMap;
use std::ptr;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, HI_COMPONENT_ID};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component payloads
// ---------------------------------------------------------------------------

/// Descriptor payload of the builtin `Component` component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Component {
    /// Size of one value in bytes. Zero marks a tag.
    pub size: usize,
    /// Alignment of a value in bytes.
    pub align: usize,
}

impl Component {
    /// Descriptor for a concrete Rust type.
    pub fn of<T>() -> Self {
        Self {
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }
}

/// Payload of the builtin `Name` component. Owns its string, so it carries
/// the full ctor/dtor/copy/move hook set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Name {
    pub value: String,
}

impl Name {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle hooks
// ---------------------------------------------------------------------------

/// Construct or destruct `count` values of `size` bytes starting at `ptr`.
pub type Xtor = unsafe fn(ptr: *mut u8, size: usize, count: usize);

/// Clone `count` values from `src` into uninitialized slots at `dst`.
pub type CopyFn = unsafe fn(dst: *mut u8, src: *const u8, size: usize, count: usize);

/// Relocate `count` values from `src` into uninitialized slots at `dst`.
/// The sources are uninitialized afterwards; their destructors never run.
pub type MoveFn = unsafe fn(dst: *mut u8, src: *mut u8, size: usize, count: usize);

/// Per-component lifecycle callbacks. All hooks are optional; absent hooks
/// fall back to bitwise copies and no-op destruction.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifecycle {
    pub ctor: Option<Xtor>,
    pub dtor: Option<Xtor>,
    pub copy: Option<CopyFn>,
    pub move_: Option<MoveFn>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("ctor", &self.ctor.is_some())
            .field("dtor", &self.dtor.is_some())
            .field("copy", &self.copy.is_some())
            .field("move", &self.move_.is_some())
            .finish()
    }
}

/// Zero-initializing constructor substituted when hooks are installed
/// without a `ctor`, so later hooks never see uninitialized memory. Only
/// sound for types whose all-zero bit pattern is a valid value.
pub(crate) unsafe fn ctor_zero(ptr: *mut u8, size: usize, count: usize) {
    ptr::write_bytes(ptr, 0, size * count);
}

impl Lifecycle {
    /// Hooks for a concrete Rust type: `ctor` writes `T::default()`, `dtor`
    /// drops in place, `copy` clones into uninitialized slots, and `move_`
    /// relocates values, leaving the sources uninitialized.
    pub fn of<T: Clone + Default>() -> Self {
        unsafe fn ctor<T: Default>(ptr: *mut u8, size: usize, count: usize) {
            debug_assert_eq!(size, std::mem::size_of::<T>());
            let base = ptr as *mut T;
            for i in 0..count {
                ptr::write(base.add(i), T::default());
            }
        }

        unsafe fn dtor<T>(ptr: *mut u8, size: usize, count: usize) {
            debug_assert_eq!(size, std::mem::size_of::<T>());
            let base = ptr as *mut T;
            for i in 0..count {
                ptr::drop_in_place(base.add(i));
            }
        }

        unsafe fn copy<T: Clone>(dst: *mut u8, src: *const u8, size: usize, count: usize) {
            debug_assert_eq!(size, std::mem::size_of::<T>());
            let dst = dst as *mut T;
            let src = src as *const T;
            for i in 0..count {
                ptr::write(dst.add(i), (*src.add(i)).clone());
            }
        }

        unsafe fn move_impl<T>(dst: *mut u8, src: *mut u8, size: usize, count: usize) {
            debug_assert_eq!(size, std::mem::size_of::<T>());
            let dst = dst as *mut T;
            let src = src as *mut T;
            for i in 0..count {
                ptr::write(dst.add(i), ptr::read(src.add(i)));
            }
        }

        Self {
            ctor: Some(ctor::<T>),
            dtor: Some(dtor::<T>),
            copy: Some(copy::<T>),
            move_: Some(move_impl::<T>),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ctor.is_none() && self.dtor.is_none() && self.copy.is_none() && self.move_.is_none()
    }
}

// ---------------------------------------------------------------------------
// LifecycleRegistry
// ---------------------------------------------------------------------------

/// Two-tier store of installed lifecycle hooks: a flat array for the low
/// component-id pool, a hash map for everything else. Lookup is one branch.
pub(crate) struct LifecycleRegistry {
    lo: Vec<Option<Lifecycle>>,
    hi: HashMap<u64, Lifecycle>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self {
            lo: vec![None; HI_COMPONENT_ID as usize],
            hi: HashMap::new(),
        }
    }

    /// Installed hooks for a component, if any.
    pub fn get(&self, component: EntityId) -> Option<Lifecycle> {
        debug_assert!(!component.is_role());
        let raw = component.to_raw();
        if raw < HI_COMPONENT_ID {
            self.lo[raw as usize]
        } else {
            self.hi.get(&raw).copied()
        }
    }

    /// Install hooks for a component. Re-installing is allowed only with an
    /// identical hook set; anything else corrupts tables that already cached
    /// the previous set.
    ///
    /// If `dtor`, `copy` or `move_` is given without a `ctor`, a
    /// zero-initializing ctor is substituted. Returns whether the hooks were
    /// newly installed.
    pub fn install(&mut self, component: EntityId, hooks: Lifecycle) -> Result<bool, EcsError> {
        if let Some(existing) = self.get(component) {
            if existing != self.completed(hooks) {
                return Err(EcsError::InconsistentComponentAction { component });
            }
            return Ok(false);
        }

        let hooks = self.completed(hooks);
        let raw = component.to_raw();
        if raw < HI_COMPONENT_ID {
            self.lo[raw as usize] = Some(hooks);
        } else {
            self.hi.insert(raw, hooks);
        }
        Ok(true)
    }

    fn completed(&self, mut hooks: Lifecycle) -> Lifecycle {
        if hooks.ctor.is_none()
            && (hooks.dtor.is_some() || hooks.copy.is_some() || hooks.move_.is_some())
        {
            hooks.ctor = Some(ctor_zero);
        }
        hooks
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NAME;

    #[test]
    fn descriptor_of_type() {
        let info = Component::of::<u64>();
        assert_eq!(info.size, 8);
        assert_eq!(info.align, 8);
        assert_eq!(Component::of::<()>().size, 0);
    }

    #[test]
    fn generated_hooks_roundtrip_a_string() {
        use std::mem::MaybeUninit;

        let lc = Lifecycle::of::<Name>();
        let size = std::mem::size_of::<Name>();

        let src = Name::new("widget");
        let mut slot: MaybeUninit<Name> = MaybeUninit::uninit();
        #[allow(unsafe_code)]
        let cloned = unsafe {
            (lc.copy.unwrap())(slot.as_mut_ptr() as *mut u8, &src as *const Name as *const u8, size, 1);
            slot.assume_init()
        };
        assert_eq!(cloned.value, "widget");
        assert_eq!(src.value, "widget");

        let mut donor = Name::new("donor");
        let mut dst: MaybeUninit<Name> = MaybeUninit::uninit();
        #[allow(unsafe_code)]
        let moved = unsafe {
            (lc.move_.unwrap())(
                dst.as_mut_ptr() as *mut u8,
                &mut donor as *mut Name as *mut u8,
                size,
                1,
            );
            // The donor slot is uninitialized now; forget it so its dtor
            // does not run twice.
            std::mem::forget(donor);
            dst.assume_init()
        };
        assert_eq!(moved.value, "donor");
    }

    #[test]
    fn install_is_idempotent_for_identical_hooks() {
        let mut reg = LifecycleRegistry::new();
        let lc = Lifecycle::of::<Name>();
        reg.install(NAME, lc).unwrap();
        reg.install(NAME, lc).unwrap();
        assert_eq!(reg.get(NAME), Some(lc));
    }

    #[test]
    fn conflicting_install_is_rejected() {
        let mut reg = LifecycleRegistry::new();
        reg.install(NAME, Lifecycle::of::<Name>()).unwrap();
        let err = reg.install(NAME, Lifecycle::default()).unwrap_err();
        assert!(matches!(
            err,
            EcsError::InconsistentComponentAction { component } if component == NAME
        ));
    }

    #[test]
    fn missing_ctor_is_substituted() {
        unsafe fn count_dtor(_ptr: *mut u8, _size: usize, _count: usize) {}

        let mut reg = LifecycleRegistry::new();
        let hooks = Lifecycle {
            dtor: Some(count_dtor),
            ..Lifecycle::default()
        };
        reg.install(NAME, hooks).unwrap();
        let installed = reg.get(NAME).unwrap();
        assert!(installed.ctor.is_some());
    }

    #[test]
    fn high_ids_use_the_hash_tier() {
        let mut reg = LifecycleRegistry::new();
        let hi_id = EntityId::from_raw(HI_COMPONENT_ID + 10);
        reg.install(hi_id, Lifecycle::of::<Name>()).unwrap();
        assert!(reg.get(hi_id).is_some());
        assert!(reg.get(EntityId::from_raw(HI_COMPONENT_ID + 11)).is_none());
    }
}
