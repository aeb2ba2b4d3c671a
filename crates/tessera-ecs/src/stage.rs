//! The stage: a per-writer deferred command log.
//!
//! While a defer scope is open (depth > 0), mutations append a [`DeferOp`]
//! instead of touching storage. Closing the outermost scope replays the
//! queue in enqueue order against the immediate path. `Set`/`Mut` payload
//! bytes are cloned into owned, properly aligned buffers at enqueue time so
//! the caller's value need not outlive the call.
//!
//! This is synchronous batching, not an async mechanism: there is no
//! suspension point anywhere.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs.

use std::alloc::{self, Layout};
use std::ptr;

use crate::entity::EntityId;
use crate::table::TableId;

// ---------------------------------------------------------------------------
// OwnedPayload
// ---------------------------------------------------------------------------

/// A heap buffer holding one cloned component value for a deferred op.
///
/// Dropping the buffer releases the allocation but does not destruct the
/// value; the flush either consumes the value via the component's move hook
/// or destructs it explicitly before discarding the op.
pub(crate) struct OwnedPayload {
    ptr: *mut u8,
    layout: Layout,
}

#[allow(unsafe_code)]
unsafe impl Send for OwnedPayload {}

impl OwnedPayload {
    /// Allocate an uninitialized buffer for `size` bytes at `align`.
    pub fn alloc(size: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(size, align.max(1)).expect("invalid payload layout");
        let ptr = if size > 0 {
            #[allow(unsafe_code)]
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            ptr
        } else {
            ptr::null_mut()
        };
        Self { ptr, layout }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for OwnedPayload {
    fn drop(&mut self) {
        if self.layout.size() > 0 && !self.ptr.is_null() {
            #[allow(unsafe_code)]
            unsafe {
                alloc::dealloc(self.ptr, self.layout);
            }
        }
    }
}

impl std::fmt::Debug for OwnedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedPayload")
            .field("size", &self.layout.size())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DeferOp
// ---------------------------------------------------------------------------

/// What a deferred op does when replayed.
#[derive(Debug)]
pub(crate) enum DeferKind {
    /// Entity creation: replays as `Add` over the captured component list.
    /// The fresh id was allocated at enqueue time and is stable.
    New { components: Vec<EntityId> },
    Add { component: EntityId },
    Remove { component: EntityId },
    /// Replays as an assign that consumes the cloned payload and marks the
    /// column dirty.
    Set {
        component: EntityId,
        size: usize,
        value: OwnedPayload,
    },
    /// Like `Set` but without the modified notification.
    Mut {
        component: EntityId,
        size: usize,
        value: OwnedPayload,
    },
    Modified { component: EntityId },
    Delete,
    Clear,
}

/// One deferred mutation, capturing everything needed for replay.
#[derive(Debug)]
pub(crate) struct DeferOp {
    pub entity: EntityId,
    /// Scope current at enqueue time; applied by `New` replay.
    pub scope: EntityId,
    pub kind: DeferKind,
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Per-writer mutation context: defer depth, op queue, and current scope.
///
/// The world owns two stages: the main stage, used at rest, and a temporary
/// stage used while an external iteration context is active. The temporary
/// stage parks its queue in `merge_queue` between defer scopes so the whole
/// iteration's ops replay together at the merge barrier.
pub(crate) struct Stage {
    /// Defer depth. Ops append to the queue whenever this is nonzero.
    pub defer: i32,
    pub queue: Vec<DeferOp>,
    /// Parked ops awaiting the iteration merge barrier.
    pub merge_queue: Vec<DeferOp>,
    /// Current parent entity; null when no scope is set.
    pub scope: EntityId,
    /// Cached table for `{role(SCOPE, scope)}`; where scope-only entities
    /// land.
    pub scope_table: Option<TableId>,
}

impl Stage {
    pub fn new() -> Self {
        Self {
            defer: 0,
            queue: Vec::new(),
            merge_queue: Vec::new(),
            scope: EntityId::NULL,
            scope_table: None,
        }
    }

    pub fn push(&mut self, entity: EntityId, kind: DeferKind) {
        let scope = self.scope;
        self.queue.push(DeferOp {
            entity,
            scope,
            kind,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
