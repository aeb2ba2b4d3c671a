//! The [`World`]: owner of the entity index, the table graph, the lifecycle
//! registry and the stages, and home of the public operation surface.
//!
//! All mutations funnel through a defer guard: when the active stage's
//! defer depth is zero the operation applies immediately, otherwise it is
//! recorded and replayed when the outermost defer scope closes. The world
//! also owns a temporary stage used while an external iteration context is
//! active (`in_progress`); ops recorded there are parked and replayed at the
//! iteration merge barrier.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs.

use std::ptr;

use tracing::{debug, trace_span, warn};

use crate::component::{Component, Lifecycle, LifecycleRegistry, Name};
use crate::entity::{
    EntityId, COMPONENT, CORE, DISABLED, FIRST_USER_COMPONENT_ID, FIRST_USER_ENTITY_ID,
    HI_COMPONENT_ID, MODULE, NAME, ROOT_MODULE, SCOPE, WILDCARD,
};
use crate::graph::{type_has, TableStore};
use crate::sparse::SparseSet;
use crate::stage::{DeferKind, DeferOp, Stage};
use crate::table::{move_row, TableEvent, TableId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Entity-index payload: where an entity lives.
///
/// `row` is one-based and sign-encoded: negative means the entity is
/// *watched* (observed by an external query); the absolute value minus one
/// is the row index. Zero (or minus one when watched) with `table == None`
/// means the entity is live but holds no components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Record {
    pub table: Option<TableId>,
    pub row: i32,
}

impl Record {
    #[cfg(test)]
    pub(crate) fn set(&mut self, table: Option<TableId>, row: usize, watched: bool) {
        self.table = table;
        self.row = row_to_record(row, watched);
    }
}

/// Decode a record row into `(row index, watched)`.
#[inline]
pub(crate) fn record_to_row(encoded: i32) -> (usize, bool) {
    let watched = encoded < 0;
    let row = if encoded == 0 {
        0
    } else {
        encoded.unsigned_abs() as usize - 1
    };
    (row, watched)
}

/// Encode a row index and watched flag into a record row.
#[inline]
pub(crate) fn row_to_record(row: usize, watched: bool) -> i32 {
    let encoded = row as i32 + 1;
    if watched {
        -encoded
    } else {
        encoded
    }
}

/// Decoded entity location used by the mutation paths.
#[derive(Clone, Copy)]
struct EntityInfo {
    table: Option<TableId>,
    row: usize,
    watched: bool,
}

/// Which of the world's two stages an operation runs against.
#[derive(Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Main,
    Temp,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The top-level ECS storage container.
pub struct World {
    pub(crate) entity_index: SparseSet<Record>,
    pub(crate) store: TableStore,
    pub(crate) lifecycle: LifecycleRegistry,
    stage: Stage,
    temp_stage: Stage,
    pub(crate) in_progress: bool,
    /// Next id from the reserved low component pool.
    last_component_id: u64,
}

impl World {
    /// Create a world and bootstrap the builtin components.
    pub fn new() -> Self {
        let mut world = Self {
            entity_index: SparseSet::new(),
            store: TableStore::new(),
            lifecycle: LifecycleRegistry::new(),
            stage: Stage::new(),
            temp_stage: Stage::new(),
            in_progress: false,
            last_component_id: 0,
        };
        world.bootstrap();
        world
    }

    // -- bootstrap ----------------------------------------------------------

    /// Manually construct the table holding `Component` and `Name` rows,
    /// then register the builtins through the normal paths. The first table
    /// cannot go through descriptor resolution because the descriptors it
    /// stores are the ones being created.
    fn bootstrap(&mut self) {
        let span = trace_span!("bootstrap");
        let _enter = span.enter();

        let type_ = [COMPONENT, NAME, EntityId::role(SCOPE, CORE)];
        let table = self.table_find_or_create(&type_);

        let layouts = [
            (Component::of::<Component>(), None),
            (Component::of::<Name>(), None),
        ];
        self.store.get_mut(table).ensure_data(&layouts);
        self.store
            .get_mut(table)
            .set_size(FIRST_USER_COMPONENT_ID as usize);

        self.bootstrap_component(table, COMPONENT, "Component", Component::of::<Component>());
        self.bootstrap_component(table, NAME, "Name", Component::of::<Name>());

        self.last_component_id = FIRST_USER_COMPONENT_ID;
        self.entity_index.set_max_id(FIRST_USER_ENTITY_ID);

        // Install Name's hooks before any name is assigned, so every string
        // in column storage is cloned rather than aliased.
        self.set_lifecycle(NAME, Lifecycle::of::<Name>())
            .expect("fresh world accepts Name hooks");

        let previous = self.set_scope(CORE);
        for (id, name) in [
            (MODULE, "Module"),
            (DISABLED, "Disabled"),
            (WILDCARD, "Wildcard"),
            (SCOPE, "Scope"),
        ] {
            self.bootstrap_tag(id, name);
        }

        self.set_name(ROOT_MODULE, "tessera")
            .expect("bootstrap name");
        self.add(ROOT_MODULE, MODULE).expect("bootstrap module tag");
        self.set_name(CORE, "core").expect("bootstrap name");
        self.add(CORE, MODULE).expect("bootstrap module tag");
        self.add(CORE, EntityId::role(SCOPE, ROOT_MODULE))
            .expect("bootstrap scope");

        self.set_scope(previous);
    }

    /// Insert one builtin component row, writing descriptor and name bytes
    /// directly into the bootstrap table's columns.
    fn bootstrap_component(&mut self, table: TableId, entity: EntityId, name: &str, info: Component) {
        let row = self.store.get_mut(table).append(entity, false);
        let record = self.entity_index.get_or_create(entity);
        record.table = Some(table);
        record.row = row_to_record(row, false);

        let info_slot = self
            .store
            .get_mut(table)
            .get_ptr_mut(COMPONENT, row)
            .expect("bootstrap table has a Component column");
        let name_slot = self
            .store
            .get_mut(table)
            .get_ptr_mut(NAME, row)
            .expect("bootstrap table has a Name column");
        #[allow(unsafe_code)]
        unsafe {
            ptr::write(info_slot as *mut Component, info);
            ptr::write(name_slot as *mut Name, Name::new(name));
        }
    }

    fn bootstrap_tag(&mut self, id: EntityId, name: &str) {
        self.set_name(id, name).expect("bootstrap tag name");
        let scope = self.get_scope();
        self.add(id, EntityId::role(SCOPE, scope))
            .expect("bootstrap tag scope");
    }

    // -- id allocation ------------------------------------------------------

    /// Issue a fresh entity id. The id is live immediately.
    pub fn new_id(&mut self) -> EntityId {
        self.entity_index.new_id()
    }

    /// Issue an id from the reserved low component pool, falling back to
    /// regular ids once the pool is exhausted.
    pub fn new_component_id(&mut self) -> EntityId {
        if self.last_component_id >= HI_COMPONENT_ID {
            self.new_id()
        } else {
            let id = self.last_component_id;
            self.last_component_id += 1;
            EntityId::from_raw(id)
        }
    }

    /// Register a component: a low-pool id carrying a descriptor row and a
    /// name.
    pub fn new_component(&mut self, name: &str, size: usize, align: usize) -> EntityId {
        let id = self.new_component_id();
        let info = Component { size, align };
        #[allow(unsafe_code)]
        let registered = unsafe {
            self.set_ptr(
                id,
                COMPONENT,
                &info as *const Component as *const u8,
                std::mem::size_of::<Component>(),
            )
        };
        registered.expect("component descriptor registration");
        self.set_name(id, name).expect("component name");
        id
    }

    /// Register a tag: a low-pool id with a name but no descriptor row.
    pub fn new_tag(&mut self, name: &str) -> EntityId {
        let id = self.new_component_id();
        self.set_name(id, name).expect("tag name");
        id
    }

    /// Create an entity with the given components. Under a nonzero scope
    /// the entity also receives `role(SCOPE, parent)`.
    pub fn spawn(&mut self, components: &[EntityId]) -> EntityId {
        let entity = self.new_id();
        let which = self.current_stage();
        if self.defer_new(which, entity, components) {
            return entity;
        }
        assert!(
            !self.in_progress,
            "immediate spawn while iteration is in progress"
        );

        let scope = self.stage_of(which).scope;
        if components.is_empty() {
            // Scope-only creation lands straight in the cached scope table.
            if let Some(table) = self.stage_of(which).scope_table {
                if !scope.is_null() && table != TableId::ROOT {
                    self.new_entity(entity, false, table);
                }
            }
        } else {
            for &component in components {
                self.add_immediate(entity, component)
                    .expect("fresh entity is alive");
            }
            if !scope.is_null() {
                self.add_immediate(entity, EntityId::role(SCOPE, scope))
                    .expect("fresh entity is alive");
            }
        }

        self.flush_stage(which);
        entity
    }

    // -- liveness and reads --------------------------------------------------

    /// Generation-strict liveness check.
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entity_index.is_alive(entity)
    }

    /// Whether the entity's index has ever been issued, live or dead.
    pub fn exists(&self, entity: EntityId) -> bool {
        self.entity_index.exists(entity)
    }

    /// The entity's component composition, or `None` when the entity is not
    /// alive or holds no components.
    pub fn type_of(&self, entity: EntityId) -> Option<&[EntityId]> {
        let record = self.entity_index.get(entity)?;
        let table = record.table?;
        Some(self.store.get(table).type_())
    }

    /// Whether the entity's type contains `component`. A role-encoded probe
    /// with a wildcard target matches any id carrying that role.
    pub fn has(&self, entity: EntityId, component: EntityId) -> bool {
        self.type_of(entity)
            .map_or(false, |type_| type_has(type_, component))
    }

    /// Pointer to the entity's value of `component`, or `None` when absent
    /// or when `component` is a tag. The pointer is invalidated by any
    /// mutation of the entity's table.
    pub fn get(&self, entity: EntityId, component: EntityId) -> Option<*const u8> {
        let record = self.entity_index.get(entity)?;
        let table = record.table?;
        let (row, _) = record_to_row(record.row);
        self.store.get(table).get_ptr(component, row)
    }

    /// The entity's display name, if it has one.
    pub fn name_of(&self, entity: EntityId) -> Option<&str> {
        let ptr = self.get(entity, NAME)?;
        #[allow(unsafe_code)]
        unsafe {
            Some((*(ptr as *const Name)).value.as_str())
        }
    }

    /// Find a named entity scoped under `parent`.
    pub fn lookup_child(&self, parent: EntityId, name: &str) -> Option<EntityId> {
        let probe = EntityId::role(SCOPE, parent);
        for table in &self.store.tables {
            if !type_has(table.type_(), probe) {
                continue;
            }
            for row in 0..table.count() {
                if let Some(ptr) = table.get_ptr(NAME, row) {
                    #[allow(unsafe_code)]
                    let value = unsafe { &(*(ptr as *const Name)).value };
                    if value == name {
                        return Some(table.entities()[row]);
                    }
                }
            }
        }
        None
    }

    /// Enumerate `(entity, value pointer)` for every entity whose type
    /// contains `component`, in dense table order. The pointer is null when
    /// `component` is a tag.
    pub fn iter_component(&self, component: EntityId) -> ComponentIter<'_> {
        ComponentIter {
            world: self,
            component,
            table: 0,
            row: 0,
        }
    }

    /// Number of tables, root included.
    pub fn table_count(&self) -> usize {
        self.store.len()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entity_index.count()
    }

    // -- mutations ----------------------------------------------------------

    /// Add `component` to the entity's type, moving its row to the
    /// neighboring table. Adding a component the entity already has leaves
    /// table, row and values untouched.
    pub fn add(&mut self, entity: EntityId, component: EntityId) -> Result<(), EcsError> {
        assert!(!component.is_null(), "add with null component id");
        self.guard_immediate()?;
        let which = self.current_stage();
        if self.defer_add(which, entity, component) {
            return Ok(());
        }
        let result = self.add_immediate(entity, component);
        self.flush_stage(which);
        result
    }

    /// Remove `component` from the entity's type. Removing an absent
    /// component is a no-op.
    pub fn remove(&mut self, entity: EntityId, component: EntityId) -> Result<(), EcsError> {
        assert!(!component.is_null(), "remove with null component id");
        self.guard_immediate()?;
        let which = self.current_stage();
        if self.defer_remove(which, entity, component) {
            return Ok(());
        }
        let result = self.remove_immediate(entity, component);
        self.flush_stage(which);
        result
    }

    /// Remove every component from the entity, leaving it live and empty.
    pub fn clear(&mut self, entity: EntityId) -> Result<(), EcsError> {
        assert!(!entity.is_null(), "clear with null entity id");
        self.guard_immediate()?;
        let which = self.current_stage();
        if self.defer_simple(which, entity, DeferKind::Clear) {
            return Ok(());
        }
        let result = (|| {
            let info = self.ensure_info(entity)?;
            self.commit(entity, info, TableId::ROOT);
            Ok(())
        })();
        self.flush_stage(which);
        result
    }

    /// Delete the entity: remove its row, destruct its values, bump its
    /// generation so stale handles miss.
    pub fn delete(&mut self, entity: EntityId) -> Result<(), EcsError> {
        assert!(!entity.is_null(), "delete with null entity id");
        self.guard_immediate()?;
        let which = self.current_stage();
        if self.defer_simple(which, entity, DeferKind::Delete) {
            return Ok(());
        }
        let result = match self.entity_index.remove(entity) {
            Some(record) => {
                if let Some(table) = record.table {
                    let (row, _) = record_to_row(record.row);
                    self.store
                        .get_mut(table)
                        .delete(&mut self.entity_index, row, true);
                }
                Ok(())
            }
            None => Err(EcsError::NotAlive { entity }),
        };
        self.flush_stage(which);
        result
    }

    /// Mutable pointer to the entity's value of `component`, adding the
    /// component first when absent. Returns `(pointer, was_added)`.
    pub fn get_mut(
        &mut self,
        entity: EntityId,
        component: EntityId,
    ) -> Result<(*mut u8, bool), EcsError> {
        let which = self.current_stage();
        if let Some(result) =
            self.defer_assign(which, AssignKind::Mut, entity, component, 0, ptr::null())?
        {
            return Ok(result);
        }
        if let Err(error) = self.guard_immediate() {
            self.flush_stage(which);
            return Err(error);
        }
        let result = self.get_mutable(entity, component);
        self.flush_stage(which);
        result
    }

    /// Write `size` bytes as the entity's value of `component`, adding the
    /// component first when absent. A null `entity` allocates a fresh id.
    /// If the component has a `copy` hook it clones from the caller's
    /// value, which stays owned by the caller; otherwise the bytes are
    /// copied verbatim.
    ///
    /// # Safety
    ///
    /// `value` must point to `size` readable bytes holding a valid value of
    /// the component's type, and `size` must equal the registered size.
    #[allow(unsafe_code)]
    pub unsafe fn set_ptr(
        &mut self,
        entity: EntityId,
        component: EntityId,
        value: *const u8,
        size: usize,
    ) -> Result<EntityId, EcsError> {
        assert!(!value.is_null(), "set_ptr with null value");
        let entity = if entity.is_null() {
            self.new_id()
        } else {
            entity
        };
        let which = self.current_stage();
        if self
            .defer_assign(which, AssignKind::Set, entity, component, size, value)?
            .is_some()
        {
            return Ok(entity);
        }
        if let Err(error) = self.guard_immediate() {
            self.flush_stage(which);
            return Err(error);
        }
        let result = self.assign_ptr(entity, component, size, value, false);
        self.flush_stage(which);
        result.map(|_| entity)
    }

    /// Assign the entity's name.
    pub fn set_name(&mut self, entity: EntityId, value: &str) -> Result<(), EcsError> {
        let name = Name::new(value);
        #[allow(unsafe_code)]
        let result = unsafe {
            self.set_ptr(
                entity,
                NAME,
                &name as *const Name as *const u8,
                std::mem::size_of::<Name>(),
            )
        };
        // The copy hook cloned the string; `name` stays ours to drop.
        result.map(|_| ())
    }

    /// Signal that the entity's value of `component` was written through a
    /// previously obtained pointer; bumps the column's dirty counter.
    pub fn modified(&mut self, entity: EntityId, component: EntityId) -> Result<(), EcsError> {
        self.guard_immediate()?;
        let which = self.current_stage();
        if self.defer_simple(which, entity, DeferKind::Modified { component }) {
            return Ok(());
        }
        let result = (|| {
            let info = self.get_info(entity).ok_or(EcsError::NotAlive { entity })?;
            if let Some(table) = info.table {
                self.store.get_mut(table).mark_dirty(component);
            }
            Ok(())
        })();
        self.flush_stage(which);
        result
    }

    /// Install lifecycle hooks for a component. Installing a second,
    /// different hook set for the same component fails; tables that already
    /// cached the hooks are refreshed.
    pub fn set_lifecycle(
        &mut self,
        component: EntityId,
        hooks: Lifecycle,
    ) -> Result<(), EcsError> {
        let info = self
            .component_info(component)
            .ok_or(EcsError::NotAComponent { id: component })?;
        if info.size == 0 {
            return Err(EcsError::InvalidComponent { id: component });
        }

        if !self.lifecycle.install(component, hooks)? {
            return Ok(());
        }

        // Refresh every table that stores this component.
        for index in 0..self.store.len() {
            let table_id = TableId(index as u32);
            let contains = {
                let table = self.store.get(table_id);
                table.column_count() > 0
                    && table.data_ready()
                    && table
                        .type_()
                        .iter()
                        .any(|&id| self.component_id_from_id(id) == Some(component))
            };
            if !contains {
                continue;
            }
            let resolved: Vec<Option<Lifecycle>> = {
                let table = self.store.get(table_id);
                table.type_()[..table.column_count()]
                    .iter()
                    .map(|&id| {
                        self.component_id_from_id(id)
                            .and_then(|real| self.lifecycle.get(real))
                    })
                    .collect()
            };
            self.store
                .get_mut(table_id)
                .notify(TableEvent::ComponentInfoChanged, &resolved);
        }
        Ok(())
    }

    /// Preallocate the entity index for `count` user entities.
    pub fn dim(&mut self, count: usize) {
        self.entity_index.set_size(count + HI_COMPONENT_ID as usize);
    }

    /// Mark the entity as observed by an external query. The flag rides the
    /// record's row sign and survives row moves.
    pub fn set_watched(&mut self, entity: EntityId) {
        if let Some(record) = self.entity_index.get_mut(entity) {
            if record.row > 0 {
                record.row = -record.row;
            } else if record.row == 0 {
                record.row = -1;
            }
        }
    }

    // -- scope ---------------------------------------------------------------

    /// Install `parent` as the current scope, returning the previous one.
    /// Entities created through [`spawn`](Self::spawn) while a scope is set
    /// receive `role(SCOPE, parent)`.
    pub fn set_scope(&mut self, parent: EntityId) -> EntityId {
        let table = if parent.is_null() {
            Some(TableId::ROOT)
        } else {
            Some(self.traverse_add(Some(TableId::ROOT), EntityId::role(SCOPE, parent)))
        };
        let stage = self.stage_mut_of(self.current_stage());
        let previous = stage.scope;
        stage.scope = parent;
        stage.scope_table = table;
        previous
    }

    /// The current scope, or the null id.
    pub fn get_scope(&self) -> EntityId {
        self.stage_of(self.current_stage()).scope
    }

    // -- defer scopes and iteration contexts ---------------------------------

    /// Open a defer scope: mutations until the matching
    /// [`defer_end`](Self::defer_end) are queued instead of applied.
    pub fn defer_begin(&mut self) {
        match self.current_stage() {
            StageKind::Main => self.stage.defer += 1,
            StageKind::Temp => {
                self.temp_stage.defer += 1;
                if self.temp_stage.defer == 1 {
                    // Resume the queue parked at the previous scope exit so
                    // the whole iteration merges as one batch.
                    self.temp_stage.queue = std::mem::take(&mut self.temp_stage.merge_queue);
                }
            }
        }
    }

    /// Close a defer scope. Closing the outermost scope replays the queue
    /// in enqueue order (or parks it until the merge barrier while an
    /// iteration is in progress).
    pub fn defer_end(&mut self) {
        match self.current_stage() {
            StageKind::Main => self.flush_stage(StageKind::Main),
            StageKind::Temp => {
                self.temp_stage.defer -= 1;
                if self.temp_stage.defer == 0 {
                    self.temp_stage.merge_queue = std::mem::take(&mut self.temp_stage.queue);
                }
            }
        }
    }

    /// Whether mutations are currently being deferred.
    pub fn is_deferred(&self) -> bool {
        self.stage_of(self.current_stage()).defer > 0
    }

    /// Enter an external iteration context: mutations must defer, and ops
    /// recorded until [`iteration_end`](Self::iteration_end) replay at the
    /// merge barrier.
    pub fn iteration_begin(&mut self) {
        assert!(!self.in_progress, "iteration already in progress");
        self.in_progress = true;
    }

    /// Leave the iteration context and replay parked ops.
    pub fn iteration_end(&mut self) {
        assert!(self.in_progress, "no iteration in progress");
        self.in_progress = false;
        let parked = std::mem::take(&mut self.temp_stage.merge_queue);
        if !parked.is_empty() {
            self.replay(parked);
        }
    }

    // -- component metadata ---------------------------------------------------

    /// Resolved descriptor for an id: for a role-encoded id, the role
    /// entity's descriptor wins, then the masked entity's.
    pub fn component_info(&self, id: EntityId) -> Option<Component> {
        let read = |e: EntityId| -> Option<Component> {
            let ptr = self.get(e, COMPONENT)?;
            #[allow(unsafe_code)]
            Some(unsafe { *(ptr as *const Component) })
        };
        if let Some(role) = id.role_of() {
            return read(role).or_else(|| read(id.masked()));
        }
        read(id)
    }

    /// The component entity an id resolves to, or `None` when the id does
    /// not denote a component.
    pub fn component_id_from_id(&self, id: EntityId) -> Option<EntityId> {
        let is_component = |e: EntityId| self.get(e, COMPONENT).is_some();
        if let Some(role) = id.role_of() {
            if is_component(role) {
                return Some(role);
            }
            let masked = id.masked();
            return is_component(masked).then_some(masked);
        }
        is_component(id).then_some(id)
    }

    // -- internal: info, commit, moves ---------------------------------------

    fn get_info(&self, entity: EntityId) -> Option<EntityInfo> {
        let record = self.entity_index.get(entity)?;
        let (row, watched) = record_to_row(record.row);
        Some(EntityInfo {
            table: record.table,
            row,
            watched,
        })
    }

    /// Location of a live entity, pairing ids that were never issued (fixed
    /// builtin ids, low-pool component ids). Stale generations fail.
    fn ensure_info(&mut self, entity: EntityId) -> Result<EntityInfo, EcsError> {
        if self.entity_index.is_alive(entity) {
            return Ok(self.get_info(entity).expect("alive entity has a record"));
        }
        if self.entity_index.exists(entity) {
            return Err(EcsError::NotAlive { entity });
        }
        self.entity_index.get_or_create(entity);
        Ok(EntityInfo {
            table: None,
            row: 0,
            watched: false,
        })
    }

    fn add_immediate(&mut self, entity: EntityId, component: EntityId) -> Result<(), EcsError> {
        let info = self.ensure_info(entity)?;
        let dst = self.traverse_add(info.table, component);
        self.commit(entity, info, dst);
        Ok(())
    }

    fn remove_immediate(&mut self, entity: EntityId, component: EntityId) -> Result<(), EcsError> {
        let info = self.ensure_info(entity)?;
        let dst = self.traverse_remove(info.table, component);
        self.commit(entity, info, dst);
        Ok(())
    }

    /// Move the entity to `dst`. A destination of the root table unlands
    /// the entity: its row is destroyed and the record points nowhere.
    fn commit(&mut self, entity: EntityId, info: EntityInfo, dst: TableId) {
        if info.table == Some(dst) {
            return;
        }
        match info.table {
            Some(src) => {
                if dst == TableId::ROOT {
                    self.store
                        .get_mut(src)
                        .delete(&mut self.entity_index, info.row, true);
                    if let Some(record) = self.entity_index.get_mut(entity) {
                        record.table = None;
                        record.row = if info.watched { -1 } else { 0 };
                    }
                } else {
                    self.move_entity(entity, info.watched, src, info.row, dst);
                }
            }
            None => {
                if dst != TableId::ROOT {
                    self.new_entity(entity, info.watched, dst);
                }
            }
        }
    }

    fn new_entity(&mut self, entity: EntityId, watched: bool, dst: TableId) -> usize {
        self.table_ensure_data(dst);
        let row = self.store.get_mut(dst).append(entity, true);
        let record = self.entity_index.get_or_create(entity);
        record.table = Some(dst);
        record.row = row_to_record(row, watched);
        row
    }

    fn move_entity(
        &mut self,
        entity: EntityId,
        watched: bool,
        src: TableId,
        src_row: usize,
        dst: TableId,
    ) -> usize {
        self.table_ensure_data(dst);

        let World {
            ref mut store,
            ref mut entity_index,
            ..
        } = *self;
        let (src_table, dst_table) = store.pair_mut(src, dst);

        let dst_row = dst_table.append(entity, false);
        if let Some(record) = entity_index.get_mut(entity) {
            record.table = Some(dst);
            record.row = row_to_record(dst_row, watched);
        }

        move_row(dst_table, dst_row, src_table, src_row, true);
        src_table.delete(entity_index, src_row, false);

        dst_row
    }

    fn get_mutable(
        &mut self,
        entity: EntityId,
        component: EntityId,
    ) -> Result<(*mut u8, bool), EcsError> {
        let info = self
            .component_info(component)
            .ok_or(EcsError::NotAComponent { id: component })?;
        if info.size == 0 {
            return Err(EcsError::InvalidComponent { id: component });
        }

        let location = self.ensure_info(entity)?;
        if let Some(table) = location.table {
            if let Some(ptr) = self.store.get_mut(table).get_ptr_mut(component, location.row) {
                return Ok((ptr, false));
            }
        }

        self.add_immediate(entity, component)?;
        let location = self.get_info(entity).expect("entity paired by add");
        let table = location.table.expect("entity landed after add");
        let ptr = self
            .store
            .get_mut(table)
            .get_ptr_mut(component, location.row)
            .expect("data column present after add");
        Ok((ptr, true))
    }

    /// Write a value into the entity's slot for `component`, via the
    /// component's move or copy hook when installed, bitwise otherwise.
    #[allow(unsafe_code)]
    unsafe fn assign_ptr(
        &mut self,
        entity: EntityId,
        component: EntityId,
        size: usize,
        value: *const u8,
        is_move: bool,
    ) -> Result<(), EcsError> {
        let info = self
            .component_info(component)
            .ok_or(EcsError::NotAComponent { id: component })?;
        assert_eq!(
            size, info.size,
            "value size does not match the registered component size"
        );
        let hooks = self
            .component_id_from_id(component)
            .and_then(|real| self.lifecycle.get(real));

        let (dst, _added) = self.get_mutable(entity, component)?;
        match hooks {
            Some(lc) => {
                // The slot holds a constructed value whenever hooks are
                // installed; destroy it before writing the new one.
                if let Some(dtor) = lc.dtor {
                    dtor(dst, size, 1);
                }
                if is_move {
                    match lc.move_ {
                        Some(move_fn) => move_fn(dst, value as *mut u8, size, 1),
                        None => ptr::copy_nonoverlapping(value, dst, size),
                    }
                } else {
                    match lc.copy {
                        Some(copy_fn) => copy_fn(dst, value, size, 1),
                        None => ptr::copy_nonoverlapping(value, dst, size),
                    }
                }
            }
            None => ptr::copy_nonoverlapping(value, dst, size),
        }

        let location = self.get_info(entity).expect("assigned entity is alive");
        if let Some(table) = location.table {
            self.store.get_mut(table).mark_dirty(component);
        }
        Ok(())
    }

    // -- internal: stages and the deferred path ------------------------------

    #[inline]
    fn current_stage(&self) -> StageKind {
        if self.in_progress {
            StageKind::Temp
        } else {
            StageKind::Main
        }
    }

    fn stage_of(&self, which: StageKind) -> &Stage {
        match which {
            StageKind::Main => &self.stage,
            StageKind::Temp => &self.temp_stage,
        }
    }

    fn stage_mut_of(&mut self, which: StageKind) -> &mut Stage {
        match which {
            StageKind::Main => &mut self.stage,
            StageKind::Temp => &mut self.temp_stage,
        }
    }

    /// Immediate structural mutations are illegal while an iteration is in
    /// progress; they must go through a defer scope. Checked before the
    /// defer guard so no depth is left dangling on the error path.
    fn guard_immediate(&self) -> Result<(), EcsError> {
        if self.in_progress && self.temp_stage.defer == 0 {
            return Err(EcsError::InvalidOperation {
                what: "immediate mutation while iteration is in progress",
            });
        }
        Ok(())
    }

    /// Defer guard: queue the op and report `true` when a defer scope is
    /// open, otherwise open the implicit per-op scope and report `false`.
    /// The immediate path closes it again via [`flush_stage`].
    fn defer_guard(&mut self, which: StageKind, entity: EntityId, kind: DeferKind) -> bool {
        let stage = self.stage_mut_of(which);
        if stage.defer > 0 {
            stage.push(entity, kind);
            true
        } else {
            stage.defer += 1;
            false
        }
    }

    fn defer_add(&mut self, which: StageKind, entity: EntityId, component: EntityId) -> bool {
        self.defer_guard(which, entity, DeferKind::Add { component })
    }

    fn defer_remove(&mut self, which: StageKind, entity: EntityId, component: EntityId) -> bool {
        self.defer_guard(which, entity, DeferKind::Remove { component })
    }

    fn defer_simple(&mut self, which: StageKind, entity: EntityId, kind: DeferKind) -> bool {
        self.defer_guard(which, entity, kind)
    }

    fn defer_new(&mut self, which: StageKind, entity: EntityId, components: &[EntityId]) -> bool {
        let stage = self.stage_mut_of(which);
        if stage.defer > 0 {
            stage.push(
                entity,
                DeferKind::New {
                    components: components.to_vec(),
                },
            );
            true
        } else {
            stage.defer += 1;
            false
        }
    }

    /// Defer guard for `Set`/`Mut`: clones the payload through the
    /// component's ctor and copy hooks into an owned buffer. For `Mut`
    /// without a source value, the entity's current value (if any) seeds
    /// the clone. Returns the queued buffer pointer and the `was_added`
    /// flag, or `None` when not deferring.
    #[allow(unsafe_code)]
    fn defer_assign(
        &mut self,
        which: StageKind,
        kind: AssignKind,
        entity: EntityId,
        component: EntityId,
        size: usize,
        value: *const u8,
    ) -> Result<Option<(*mut u8, bool)>, EcsError> {
        if self.stage_of(which).defer == 0 {
            self.stage_mut_of(which).defer += 1;
            return Ok(None);
        }

        let info = self
            .component_info(component)
            .ok_or(EcsError::NotAComponent { id: component })?;
        if info.size == 0 {
            return Err(EcsError::InvalidComponent { id: component });
        }
        let size = if size == 0 { info.size } else { size };
        assert_eq!(
            size, info.size,
            "value size does not match the registered component size"
        );

        let hooks = self
            .component_id_from_id(component)
            .and_then(|real| self.lifecycle.get(real));

        let seed = if value.is_null() {
            self.get(entity, component).unwrap_or(ptr::null())
        } else {
            value
        };
        let was_added = seed.is_null();

        let mut payload = crate::stage::OwnedPayload::alloc(size, info.align);
        unsafe {
            if !seed.is_null() {
                match hooks.and_then(|lc| lc.copy) {
                    Some(copy) => copy(payload.as_mut_ptr(), seed, size, 1),
                    None => ptr::copy_nonoverlapping(seed, payload.as_mut_ptr(), size),
                }
            } else if let Some(ctor) = hooks.and_then(|lc| lc.ctor) {
                // No source value: hand the caller a default-constructed one.
                ctor(payload.as_mut_ptr(), size, 1);
            }
        }

        let out = payload.as_mut_ptr();
        let op_kind = match kind {
            AssignKind::Set => DeferKind::Set {
                component,
                size,
                value: payload,
            },
            AssignKind::Mut => DeferKind::Mut {
                component,
                size,
                value: payload,
            },
        };
        self.stage_mut_of(which).push(entity, op_kind);
        Ok(Some((out, was_added)))
    }

    /// Close the implicit per-op defer scope; at depth zero, replay the
    /// queue.
    fn flush_stage(&mut self, which: StageKind) {
        let stage = self.stage_mut_of(which);
        debug_assert!(stage.defer > 0, "unbalanced defer scope");
        stage.defer -= 1;
        if stage.defer == 0 {
            let ops = std::mem::take(&mut stage.queue);
            if !ops.is_empty() {
                self.replay(ops);
            }
        }
    }

    /// Replay deferred ops in enqueue order against the immediate path.
    ///
    /// Ops targeting an entity that a `Delete` in the same batch kills are
    /// discarded, as are ops whose entity died in an earlier batch (not
    /// alive, but its index still exists). The delete itself still applies.
    /// This is what makes an add-then-delete pair safe: the entity is never
    /// observed in an intermediate state and no component value is
    /// constructed just to be destroyed.
    fn replay(&mut self, ops: Vec<DeferOp>) {
        let mut doomed: std::collections::HashSet<u64> = std::collections::HashSet::new();
        for op in &ops {
            if matches!(op.kind, DeferKind::Delete) {
                doomed.insert(op.entity.to_raw());
            }
        }

        for op in ops {
            let entity = op.entity;
            let dies_in_batch =
                !matches!(op.kind, DeferKind::Delete) && doomed.contains(&entity.to_raw());
            if dies_in_batch
                || (!entity.is_null()
                    && !self.entity_index.is_alive(entity)
                    && self.entity_index.exists(entity))
            {
                debug!(?entity, "discarding deferred op for dead entity");
                self.discard_op(op);
                continue;
            }

            match op.kind {
                DeferKind::New { components } => {
                    for component in components {
                        if let Err(error) = self.add(entity, component) {
                            warn!(?entity, ?component, %error, "deferred add failed");
                        }
                    }
                    if !op.scope.is_null() {
                        let scoped = EntityId::role(SCOPE, op.scope);
                        if let Err(error) = self.add(entity, scoped) {
                            warn!(?entity, %error, "deferred scope add failed");
                        }
                    }
                }
                DeferKind::Add { component } => {
                    if let Err(error) = self.add(entity, component) {
                        warn!(?entity, ?component, %error, "deferred add failed");
                    }
                }
                DeferKind::Remove { component } => {
                    if let Err(error) = self.remove(entity, component) {
                        warn!(?entity, ?component, %error, "deferred remove failed");
                    }
                }
                DeferKind::Modified { component } => {
                    if let Err(error) = self.modified(entity, component) {
                        warn!(?entity, ?component, %error, "deferred modified failed");
                    }
                }
                DeferKind::Delete => {
                    if let Err(error) = self.delete(entity) {
                        warn!(?entity, %error, "deferred delete failed");
                    }
                }
                DeferKind::Clear => {
                    if let Err(error) = self.clear(entity) {
                        warn!(?entity, %error, "deferred clear failed");
                    }
                }
                DeferKind::Set {
                    component,
                    size,
                    value,
                }
                | DeferKind::Mut {
                    component,
                    size,
                    value,
                } => {
                    // The replay consumes the cloned payload via the move
                    // hook; the buffer itself is freed when `value` drops.
                    #[allow(unsafe_code)]
                    let result = unsafe {
                        self.assign_ptr(entity, component, size, value.as_ptr(), true)
                    };
                    if let Err(error) = result {
                        warn!(?entity, ?component, %error, "deferred assign failed");
                        self.destruct_payload(component, size, value);
                    }
                }
            }
        }
    }

    /// Balance the enqueue-time construction of a payload that will never
    /// be consumed.
    fn discard_op(&mut self, op: DeferOp) {
        match op.kind {
            DeferKind::Set {
                component,
                size,
                value,
            }
            | DeferKind::Mut {
                component,
                size,
                value,
            } => self.destruct_payload(component, size, value),
            _ => {}
        }
    }

    fn destruct_payload(&mut self, component: EntityId, size: usize, mut value: crate::stage::OwnedPayload) {
        let hooks = self
            .component_id_from_id(component)
            .and_then(|real| self.lifecycle.get(real));
        if let Some(dtor) = hooks.and_then(|lc| lc.dtor) {
            #[allow(unsafe_code)]
            unsafe {
                dtor(value.as_mut_ptr(), size, 1);
            }
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entity_index.count())
            .field("tables", &self.store.len())
            .finish()
    }
}

/// Which assign flavor a deferred op records.
#[derive(Clone, Copy)]
enum AssignKind {
    Set,
    Mut,
}

// ---------------------------------------------------------------------------
// ComponentIter
// ---------------------------------------------------------------------------

/// Iterator over `(entity, value pointer)` rows of every table whose type
/// contains a component. See [`World::iter_component`].
pub struct ComponentIter<'w> {
    world: &'w World,
    component: EntityId,
    table: usize,
    row: usize,
}

impl<'w> Iterator for ComponentIter<'w> {
    type Item = (EntityId, *const u8);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.table >= self.world.store.len() {
                return None;
            }
            let table = self.world.store.get(TableId(self.table as u32));
            if !type_has(table.type_(), self.component) || self.row >= table.count() {
                self.table += 1;
                self.row = 0;
                continue;
            }
            let entity = table.entities()[self.row];
            let ptr = table
                .get_ptr(self.component, self.row)
                .unwrap_or(ptr::null());
            self.row += 1;
            return Some((entity, ptr));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
