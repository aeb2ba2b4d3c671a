//! Columnar table (archetype) storage.
//!
//! A [`Table`] holds every entity whose component set is exactly the table's
//! canonical sorted type. Data-bearing components occupy a prefix of the
//! type (component ids are issued from a reserved low range, so they sort
//! before tags and role ids); each prefix position owns a [`Column`], a
//! type-erased densely packed buffer.
//!
//! Row operations run the per-component lifecycle hooks cached on the
//! table. Tables without ctor/dtor hooks take fast paths that reduce every
//! row move to bitwise copies.
//!
//! # Safety
//!
//! Columns store erased bytes in manually managed allocations. The
//! invariants are upheld by [`Table`] and the world: every column access
//! uses the size, alignment and hooks the column was created with, a `ctor`
//! runs before `copy`/`move` touch a slot, and moved-from slots hold values
//! whose destructor is a no-op.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr;

use bitflags::bitflags;

use crate::component::{Component, Lifecycle};
use crate::entity::EntityId;
use crate::sparse::SparseSet;
use crate::world::Record;

// ---------------------------------------------------------------------------
// TableId, flags, events
// ---------------------------------------------------------------------------

/// Identifies a table within the world's table arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub(crate) u32);

impl TableId {
    /// The root table: empty type, anchor for first-step edges.
    pub(crate) const ROOT: TableId = TableId(0);

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Cached facts about a table's type, recomputed when lifecycle hooks
    /// change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TableFlags: u32 {
        /// Type contains a builtin id.
        const HAS_BUILTINS = 1 << 0;
        /// Type contains the `Component` component (descriptor rows).
        const HAS_COMPONENT_DATA = 1 << 4;
        /// Type contains the `Disabled` tag.
        const IS_DISABLED = 1 << 6;
        const HAS_CTORS = 1 << 7;
        const HAS_DTORS = 1 << 8;
        const HAS_COPY = 1 << 9;
        const HAS_MOVE = 1 << 10;
    }
}

impl TableFlags {
    const LIFECYCLE: TableFlags = TableFlags::HAS_CTORS.union(TableFlags::HAS_DTORS);

    /// Whether row operations must run hooks instead of the bitwise fast
    /// path.
    #[inline]
    pub fn is_complex(self) -> bool {
        self.intersects(Self::LIFECYCLE)
    }
}

/// Events delivered to tables via [`Table::notify`].
#[derive(Debug, Clone, Copy)]
pub enum TableEvent {
    /// Lifecycle hooks changed for a component; refresh cached hook records
    /// and flag bits.
    ComponentInfoChanged,
}

/// Cached graph transition for one id at one table.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TableEdge {
    pub add: Option<TableId>,
    pub remove: Option<TableId>,
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A densely packed, type-erased array of component values of one type.
pub struct Column {
    data: *mut u8,
    len: usize,
    cap: usize,
    size: usize,
    align: usize,
}

// Columns hold raw bytes; the world enforces single-writer access.
#[allow(unsafe_code)]
unsafe impl Send for Column {}
#[allow(unsafe_code)]
unsafe impl Sync for Column {}

impl Column {
    fn new(size: usize, align: usize) -> Self {
        assert!(size == 0 || align > 0, "data column with zero alignment");
        Self {
            data: ptr::null_mut(),
            len: 0,
            cap: 0,
            size,
            align,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn layout(&self, cap: usize) -> Layout {
        Layout::from_size_align(self.size * cap, self.align).expect("column layout overflow")
    }

    #[inline]
    fn ptr_at(&self, row: usize) -> *mut u8 {
        debug_assert!(row < self.len);
        if self.size == 0 {
            // Tag or ZST: dangling but aligned.
            return self.align.max(1) as *mut u8;
        }
        #[allow(unsafe_code)]
        unsafe {
            self.data.add(row * self.size)
        }
    }

    /// Append `to_add` slots, growing the allocation if needed. When growth
    /// reallocates and a `move_` hook exists, old values are relocated into
    /// the new buffer through the hook instead of bitwise.
    ///
    /// New slots are constructed only when `construct` is set and a `ctor`
    /// hook exists; otherwise they are raw bytes the caller must fill.
    ///
    /// Returns `true` if the allocation changed.
    fn grow(&mut self, to_add: usize, min_cap: usize, lc: Option<&Lifecycle>, construct: bool) -> bool {
        let new_len = self.len + to_add;
        if self.size == 0 {
            self.len = new_len;
            return false;
        }

        let needed = new_len.max(min_cap);
        let reallocs = needed > self.cap;

        if reallocs {
            let mut new_cap = if self.cap == 0 { 4 } else { self.cap * 2 };
            while new_cap < needed {
                new_cap *= 2;
            }
            let new_layout = self.layout(new_cap);

            let move_hook = lc.and_then(|lc| lc.move_).filter(|_| self.len > 0);
            #[allow(unsafe_code)]
            unsafe {
                if let Some(move_fn) = move_hook {
                    // Relocate old values into the fresh buffer through the
                    // move hook; the old buffer is then raw bytes.
                    let new_data = alloc::alloc(new_layout);
                    if new_data.is_null() {
                        alloc::handle_alloc_error(new_layout);
                    }
                    move_fn(new_data, self.data, self.size, self.len);

                    alloc::dealloc(self.data, self.layout(self.cap));
                    self.data = new_data;
                    self.cap = new_cap;

                    if construct && to_add > 0 {
                        if let Some(ctor) = lc.and_then(|lc| lc.ctor) {
                            let tail = new_data.add(self.len * self.size);
                            ctor(tail, self.size, to_add);
                        }
                    }
                    self.len = new_len;
                    return true;
                }

                let new_data = if self.cap == 0 {
                    alloc::alloc(new_layout)
                } else {
                    alloc::realloc(self.data, self.layout(self.cap), new_layout.size())
                };
                if new_data.is_null() {
                    alloc::handle_alloc_error(new_layout);
                }
                self.data = new_data;
                self.cap = new_cap;
            }
        }

        if construct && to_add > 0 {
            if let Some(ctor) = lc.and_then(|lc| lc.ctor) {
                #[allow(unsafe_code)]
                unsafe {
                    let first_new = self.data.add(self.len * self.size);
                    ctor(first_new, self.size, to_add);
                }
            }
        }
        self.len = new_len;

        reallocs
    }

    /// Swap-remove the value at `row`, moving the last value into the gap.
    ///
    /// With `destruct` the removed value is destroyed first; without it the
    /// slot is assumed already consumed (by a cross-table move) and is
    /// overwritten as raw bytes.
    fn swap_remove(&mut self, row: usize, lc: Option<&Lifecycle>, destruct: bool) {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        if self.size == 0 {
            self.len = last;
            return;
        }

        let dst = self.ptr_at(row);
        #[allow(unsafe_code)]
        unsafe {
            if destruct {
                if let Some(dtor) = lc.and_then(|lc| lc.dtor) {
                    dtor(dst, self.size, 1);
                }
            }
            if row != last {
                let src = self.ptr_at(last);
                match lc.and_then(|lc| lc.move_) {
                    Some(move_fn) => move_fn(dst, src, self.size, 1),
                    None => ptr::copy_nonoverlapping(src, dst, self.size),
                }
            }
        }
        self.len = last;
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        // Values were destructed by the owning table; only the buffer is
        // released here.
        if self.size > 0 && self.cap > 0 {
            #[allow(unsafe_code)]
            unsafe {
                alloc::dealloc(self.data, self.layout(self.cap));
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Storage bucket for all entities of one exact type.
pub struct Table {
    id: TableId,
    /// Canonical sorted type. Tables with equal types are identical.
    type_: Box<[EntityId]>,
    /// Length of the data-bearing prefix of `type_`.
    column_count: usize,
    entities: Vec<EntityId>,
    /// One column per data-bearing prefix position; empty until the first
    /// mutation that needs a data row.
    columns: Vec<Column>,
    /// Per-column cached lifecycle hooks, parallel to `columns`.
    lc: Vec<Option<Lifecycle>>,
    pub(crate) edges: HashMap<u64, TableEdge>,
    pub(crate) flags: TableFlags,
    /// Monitor counters: `[0]` counts row changes, `[i + 1]` column `i`
    /// writes. Allocated when a monitor attaches.
    dirty_state: Option<Box<[i32]>>,
    /// Bumped on column reallocation so downstream caches can detect stale
    /// pointers.
    alloc_count: u32,
}

impl Table {
    pub(crate) fn new(id: TableId, type_: Box<[EntityId]>, column_count: usize) -> Self {
        Self {
            id,
            type_,
            column_count,
            entities: Vec::new(),
            columns: Vec::new(),
            lc: Vec::new(),
            edges: HashMap::new(),
            flags: TableFlags::empty(),
            dirty_state: None,
            alloc_count: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[inline]
    pub fn type_(&self) -> &[EntityId] {
        &self.type_
    }

    #[inline]
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    #[inline]
    pub fn flags(&self) -> TableFlags {
        self.flags
    }

    #[inline]
    pub fn alloc_count(&self) -> u32 {
        self.alloc_count
    }

    /// Position of `id` in the type, or `None`.
    #[inline]
    pub fn type_index_of(&self, id: EntityId) -> Option<usize> {
        self.type_.iter().position(|&t| t == id)
    }

    pub(crate) fn data_ready(&self) -> bool {
        self.columns.len() == self.column_count
    }

    /// Initialize columns from resolved descriptors, one per data-bearing
    /// prefix position. Idempotent.
    pub(crate) fn ensure_data(&mut self, layouts: &[(Component, Option<Lifecycle>)]) {
        if self.data_ready() {
            return;
        }
        debug_assert_eq!(layouts.len(), self.column_count);

        self.columns = layouts
            .iter()
            .map(|(info, _)| Column::new(info.size, info.align))
            .collect();
        self.lc = layouts.iter().map(|(_, lc)| *lc).collect();
        self.refresh_flags();
    }

    /// Re-cache lifecycle hooks after a registry change.
    pub(crate) fn refresh_lifecycle(&mut self, resolved: &[Option<Lifecycle>]) {
        if !self.data_ready() || self.column_count == 0 {
            return;
        }
        debug_assert_eq!(resolved.len(), self.column_count);
        self.lc.copy_from_slice(resolved);
        self.refresh_flags();
    }

    fn refresh_flags(&mut self) {
        self.flags &= !(TableFlags::HAS_CTORS
            | TableFlags::HAS_DTORS
            | TableFlags::HAS_COPY
            | TableFlags::HAS_MOVE);
        for lc in self.lc.iter().flatten() {
            if lc.ctor.is_some() {
                self.flags |= TableFlags::HAS_CTORS;
            }
            if lc.dtor.is_some() {
                self.flags |= TableFlags::HAS_DTORS;
            }
            if lc.copy.is_some() {
                self.flags |= TableFlags::HAS_COPY;
            }
            if lc.move_.is_some() {
                self.flags |= TableFlags::HAS_MOVE;
            }
        }
    }

    fn mark_dirty_index(&mut self, index: usize) {
        if let Some(state) = self.dirty_state.as_deref_mut() {
            state[index] += 1;
        }
    }

    /// Bump the write counter of a component's column. No-op unless a
    /// monitor attached dirty state.
    pub fn mark_dirty(&mut self, component: EntityId) {
        if self.dirty_state.is_some() {
            if let Some(index) = self.type_index_of(component) {
                if index < self.column_count {
                    self.mark_dirty_index(index + 1);
                }
            }
        }
    }

    /// Monitor counters, allocated on first access: one row counter plus
    /// one per data column.
    pub fn dirty_state(&mut self) -> &[i32] {
        if self.dirty_state.is_none() {
            self.dirty_state = Some(vec![0; self.column_count + 1].into_boxed_slice());
        }
        self.dirty_state.as_deref().unwrap()
    }

    pub fn notify(&mut self, event: TableEvent, resolved: &[Option<Lifecycle>]) {
        match event {
            TableEvent::ComponentInfoChanged => self.refresh_lifecycle(resolved),
        }
    }

    // -- row operations -----------------------------------------------------

    /// Append a row for `entity`, extending every data column by one slot.
    /// Slots are constructed when `construct` is set and the table has
    /// hooks; otherwise they are raw and the caller fills them.
    ///
    /// Returns the new row index. Columns must be initialized (see
    /// [`ensure_data`](Self::ensure_data)) unless the table has none.
    pub(crate) fn append(&mut self, entity: EntityId, construct: bool) -> usize {
        debug_assert!(self.data_ready());

        let row = self.entities.len();
        let was_full = self.entities.len() == self.entities.capacity();
        self.entities.push(entity);
        if was_full {
            self.alloc_count += 1;
        }
        self.mark_dirty_index(0);

        let complex = self.flags.is_complex();
        for i in 0..self.columns.len() {
            let lc = if complex { self.lc[i] } else { None };
            self.columns[i].grow(1, 0, lc.as_ref(), construct);
        }
        row
    }

    /// Bulk-append `count` rows, optionally populating entity ids. Slots are
    /// constructed. Returns the first new row index.
    pub(crate) fn append_n(&mut self, count: usize, ids: Option<&[EntityId]>) -> usize {
        debug_assert!(self.data_ready());

        let first = self.entities.len();
        match ids {
            Some(ids) => {
                debug_assert_eq!(ids.len(), count);
                self.entities.extend_from_slice(ids);
            }
            None => self.entities.extend(std::iter::repeat(EntityId::NULL).take(count)),
        }

        let min_cap = self.entities.len();
        for i in 0..self.columns.len() {
            let lc = self.lc[i];
            self.columns[i].grow(count, min_cap, lc.as_ref(), true);
        }

        self.mark_dirty_index(0);
        self.alloc_count += 1;
        first
    }

    /// Preallocate room for `count` rows without adding any.
    pub(crate) fn set_size(&mut self, count: usize) {
        if self.entities.len() >= count {
            return;
        }
        self.entities.reserve(count - self.entities.len());
        for i in 0..self.columns.len() {
            let lc = self.lc[i];
            self.columns[i].grow(0, count, lc.as_ref(), true);
        }
        self.alloc_count += 1;
    }

    /// Swap-remove the row, fixing the entity-index record of whichever
    /// entity was moved into the gap (its watched flag is preserved).
    ///
    /// With `destruct` the removed row's values are destroyed; without it
    /// they are assumed already consumed by a cross-table move.
    pub(crate) fn delete(&mut self, index: &mut SparseSet<Record>, row: usize, destruct: bool) {
        let last = self.entities.len() - 1;
        debug_assert!(row <= last);

        let moved = self.entities[last];
        self.entities.swap_remove(row);

        if row != last {
            if let Some(record) = index.get_any_mut(moved) {
                debug_assert_eq!(record.table, Some(self.id));
                let encoded = row as i32 + 1;
                record.row = if record.row < 0 { -encoded } else { encoded };
            }
        }

        self.mark_dirty_index(0);

        let complex = self.flags.is_complex();
        for i in 0..self.columns.len() {
            let lc = if complex { self.lc[i] } else { None };
            self.columns[i].swap_remove(row, lc.as_ref(), destruct);
        }
    }

    // -- data access --------------------------------------------------------

    /// Pointer to the value of `component` at `row`, or `None` when the
    /// component has no column here (absent, or a tag).
    pub fn get_ptr(&self, component: EntityId, row: usize) -> Option<*const u8> {
        let index = self.type_[..self.column_count]
            .iter()
            .position(|&t| t == component)?;
        let column = self.columns.get(index)?;
        if column.size == 0 || row >= column.len {
            return None;
        }
        Some(column.ptr_at(row) as *const u8)
    }

    /// Mutable variant of [`get_ptr`](Self::get_ptr).
    pub fn get_ptr_mut(&mut self, component: EntityId, row: usize) -> Option<*mut u8> {
        let index = self.type_[..self.column_count]
            .iter()
            .position(|&t| t == component)?;
        let column = self.columns.get(index)?;
        if column.size == 0 || row >= column.len {
            return None;
        }
        Some(column.ptr_at(row))
    }

    /// Destroy every row's values in place, leaving the columns empty.
    /// Entity-index records are not touched; callers own that bookkeeping.
    pub(crate) fn clear_rows(&mut self) {
        for (i, column) in self.columns.iter_mut().enumerate() {
            if column.size > 0 && column.len > 0 {
                if let Some(dtor) = self.lc[i].as_ref().and_then(|lc| lc.dtor) {
                    #[allow(unsafe_code)]
                    unsafe {
                        dtor(column.ptr_at(0), column.size, column.len);
                    }
                }
            }
            column.len = 0;
        }
        self.entities.clear();
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.clear_rows();
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("type", &self.type_)
            .field("column_count", &self.column_count)
            .field("count", &self.entities.len())
            .field("flags", &self.flags)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cross-table move
// ---------------------------------------------------------------------------

#[inline]
fn ctor_column(column: &mut Column, lc: Option<&Lifecycle>, row: usize) {
    if column.size == 0 {
        return;
    }
    if let Some(ctor) = lc.and_then(|lc| lc.ctor) {
        #[allow(unsafe_code)]
        unsafe {
            ctor(column.ptr_at(row), column.size, 1);
        }
    }
}

#[inline]
fn dtor_column(column: &mut Column, lc: Option<&Lifecycle>, row: usize) {
    if column.size == 0 {
        return;
    }
    if let Some(dtor) = lc.and_then(|lc| lc.dtor) {
        #[allow(unsafe_code)]
        unsafe {
            dtor(column.ptr_at(row), column.size, 1);
        }
    }
}

/// Move a row's values between two tables by walking both sorted types.
///
/// Shared components transfer via `move_` (same entity) or `copy`
/// (different entities), with a bitwise fallback; components present only in
/// the destination are constructed; components present only in the source
/// are destructed. When neither table has hooks, every shared component is
/// a plain `memcpy`.
pub(crate) fn move_row(
    dst: &mut Table,
    dst_row: usize,
    src: &mut Table,
    src_row: usize,
    same_entity: bool,
) {
    debug_assert!(dst.data_ready() && src.data_ready());

    if !(dst.flags | src.flags).is_complex() {
        fast_move(dst, dst_row, src, src_row);
        return;
    }

    let dst_count = dst.column_count;
    let src_count = src.column_count;
    let mut i_dst = 0;
    let mut i_src = 0;

    while i_dst < dst_count && i_src < src_count {
        let dst_id = dst.type_[i_dst];
        let src_id = src.type_[i_src];

        if dst_id == src_id {
            let size = dst.columns[i_dst].size;
            if size > 0 {
                let lc = dst.lc[i_dst];
                let to = dst.columns[i_dst].ptr_at(dst_row);
                let from = src.columns[i_src].ptr_at(src_row);
                #[allow(unsafe_code)]
                unsafe {
                    if same_entity {
                        // A same-entity transfer consumes the source slot;
                        // copy would leave it owning the value twice.
                        match lc.as_ref().and_then(|lc| lc.move_) {
                            Some(move_fn) => move_fn(to, from as *mut u8, size, 1),
                            None => ptr::copy_nonoverlapping(from, to, size),
                        }
                    } else {
                        match lc.as_ref().and_then(|lc| lc.copy) {
                            Some(copy_fn) => copy_fn(to, from, size, 1),
                            None => ptr::copy_nonoverlapping(from, to, size),
                        }
                    }
                }
            }
        } else if dst_id < src_id {
            let lc = dst.lc[i_dst];
            ctor_column(&mut dst.columns[i_dst], lc.as_ref(), dst_row);
        } else {
            let lc = src.lc[i_src];
            dtor_column(&mut src.columns[i_src], lc.as_ref(), src_row);
        }

        if dst_id <= src_id {
            i_dst += 1;
        }
        if dst_id >= src_id {
            i_src += 1;
        }
    }

    while i_dst < dst_count {
        let lc = dst.lc[i_dst];
        ctor_column(&mut dst.columns[i_dst], lc.as_ref(), dst_row);
        i_dst += 1;
    }
    while i_src < src_count {
        let lc = src.lc[i_src];
        dtor_column(&mut src.columns[i_src], lc.as_ref(), src_row);
        i_src += 1;
    }
}

fn fast_move(dst: &mut Table, dst_row: usize, src: &mut Table, src_row: usize) {
    let dst_count = dst.column_count;
    let src_count = src.column_count;
    let mut i_dst = 0;
    let mut i_src = 0;

    while i_dst < dst_count && i_src < src_count {
        let dst_id = dst.type_[i_dst];
        let src_id = src.type_[i_src];

        if dst_id == src_id {
            let size = dst.columns[i_dst].size;
            if size > 0 {
                #[allow(unsafe_code)]
                unsafe {
                    ptr::copy_nonoverlapping(
                        src.columns[i_src].ptr_at(src_row),
                        dst.columns[i_dst].ptr_at(dst_row),
                        size,
                    );
                }
            }
        }

        if dst_id <= src_id {
            i_dst += 1;
        }
        if dst_id >= src_id {
            i_src += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
