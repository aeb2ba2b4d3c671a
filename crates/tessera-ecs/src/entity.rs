//! Entity identifiers.
//!
//! An [`EntityId`] is a 64-bit opaque handle. For a plain entity the low 32
//! bits are the *index* (the slot in the entity index) and the next 24 bits
//! are the *generation*, bumped every time the index is recycled so that
//! stale handles miss immediately.
//!
//! When the top bit is set the id is *role-encoded*: the bits between the
//! role flag and the index name a role entity (a relation kind such as
//! [`SCOPE`]), and the low 32 bits name the related entity. Role-encoded ids
//! never enter the entity index; they only appear as elements of a table
//! type, where they sort and hash by their numeric value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Low 32 bits: the index portion of a plain id, or the related entity of a
/// role-encoded id.
pub const INDEX_MASK: u64 = 0xFFFF_FFFF;

/// Bits 32..56: the generation counter of a plain id.
pub const GENERATION_MASK: u64 = 0xFF_FFFF << 32;

/// Top bit: marks a role-encoded id.
pub const ROLE_FLAG: u64 = 1 << 63;

/// Component ids below this bound live in the registry's flat array and are
/// handed out by `new_component_id`; ids at or above it go to the hash map.
pub const HI_COMPONENT_ID: u64 = 256;

/// First id handed out by `new_component_id`. Everything below is reserved
/// for builtins.
pub const FIRST_USER_COMPONENT_ID: u64 = 32;

/// First id handed out by `new_id`.
pub const FIRST_USER_ENTITY_ID: u64 = 384;

/// Ids at or below this are builtin and set the `HAS_BUILTINS` table flag.
pub const LAST_BUILTIN_ID: u64 = 8;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A 64-bit entity handle. See the module docs for the bit layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// The null id. Never alive; used as "no entity" in scopes and payloads.
    pub const NULL: Self = Self(0);

    /// Construct from an index and a generation.
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64 & 0xFF_FFFF) << 32) | index as u64)
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion. Only meaningful for plain (non-role) ids.
    #[inline]
    pub const fn generation(self) -> u32 {
        ((self.0 & GENERATION_MASK) >> 32) as u32
    }

    /// Same index, different generation.
    #[inline]
    pub const fn with_generation(self, generation: u32) -> Self {
        Self((self.0 & !GENERATION_MASK) | ((generation as u64 & 0xFF_FFFF) << 32))
    }

    /// The id with its generation bits cleared.
    #[inline]
    pub const fn stripped(self) -> Self {
        Self(self.0 & !GENERATION_MASK)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether the role flag is set.
    #[inline]
    pub const fn is_role(self) -> bool {
        self.0 & ROLE_FLAG != 0
    }

    /// Synthesize a role-encoded id `role(kind, target)`.
    #[inline]
    pub const fn role(kind: EntityId, target: EntityId) -> Self {
        Self(ROLE_FLAG | ((kind.0 as u32 as u64) << 32) | target.0 as u32 as u64)
    }

    /// The role entity of a role-encoded id, or `None` for plain ids.
    #[inline]
    pub fn role_of(self) -> Option<EntityId> {
        if self.is_role() {
            Some(Self((self.0 & !ROLE_FLAG) >> 32))
        } else {
            None
        }
    }

    /// The id masked down to its low 32 bits: the related entity of a
    /// role-encoded id, or the index of a plain id.
    #[inline]
    pub const fn masked(self) -> EntityId {
        Self(self.0 & INDEX_MASK)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(role) = self.role_of() {
            write!(f, "EntityId({}|{})", role.0, self.masked().0)
        } else {
            write!(f, "EntityId({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(role) = self.role_of() {
            write!(f, "{}|{}", role.0, self.masked().0)
        } else {
            write!(f, "{}v{}", self.index(), self.generation())
        }
    }
}

// ---------------------------------------------------------------------------
// Builtin ids
// ---------------------------------------------------------------------------

/// The `Component` component: carries size and alignment for every
/// registered component, including itself.
pub const COMPONENT: EntityId = EntityId(1);

/// The `Name` component: a display name with full lifecycle hooks.
pub const NAME: EntityId = EntityId(2);

/// Tag marking module entities.
pub const MODULE: EntityId = EntityId(3);

/// Tag marking disabled entities.
pub const DISABLED: EntityId = EntityId(4);

/// Wildcard target for role-encoded matching.
pub const WILDCARD: EntityId = EntityId(5);

/// Role used to encode the parent scope of an entity.
pub const SCOPE: EntityId = EntityId(6);

/// The builtin core module: parent scope of every builtin.
pub const CORE: EntityId = EntityId(7);

/// The root module entity.
pub const ROOT_MODULE: EntityId = EntityId(8);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_generation_roundtrip() {
        let id = EntityId::new(42, 7);
        assert_eq!(id.index(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
    }

    #[test]
    fn generation_is_masked_to_24_bits() {
        let id = EntityId::new(1, 0xFFFF_FFFF);
        assert_eq!(id.generation(), 0xFF_FFFF);
        assert!(!id.is_role());
    }

    #[test]
    fn role_encoding() {
        let parent = EntityId::new(900, 3);
        let id = EntityId::role(SCOPE, parent);
        assert!(id.is_role());
        assert_eq!(id.role_of(), Some(SCOPE));
        // The generation of the target is not preserved; only the low bits.
        assert_eq!(id.masked(), EntityId::from_raw(900));
    }

    #[test]
    fn plain_id_has_no_role() {
        assert_eq!(EntityId::new(5, 0).role_of(), None);
    }

    #[test]
    fn stripped_clears_generation_only() {
        let id = EntityId::new(77, 12);
        assert_eq!(id.stripped(), EntityId::new(77, 0));
    }

    #[test]
    fn ids_sort_numerically() {
        let mut ids = vec![EntityId::role(SCOPE, CORE), NAME, COMPONENT, MODULE];
        ids.sort();
        assert_eq!(ids[0], COMPONENT);
        assert_eq!(ids[1], NAME);
        assert_eq!(ids[2], MODULE);
        assert!(ids[3].is_role());
    }

    #[test]
    fn serde_roundtrip() {
        let id = EntityId::new(3, 1);
        let json = serde_json::to_string(&id).unwrap();
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
