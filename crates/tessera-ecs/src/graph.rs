//! The table graph: a lattice of archetypes linked by add/remove edges.
//!
//! Tables are keyed by their canonical sorted type. Two caches cooperate:
//! the per-table edge map answers "where does adding (or removing) this id
//! lead" in one hop, and the type→table map makes independent edge paths
//! converge on a single table per type. The root table (empty type) anchors
//! all first-step edges and is created with the world.

use std::collections::HashMap;

use crate::component::{Component, Lifecycle};
use crate::entity::{EntityId, COMPONENT, DISABLED, LAST_BUILTIN_ID, NAME};
use crate::table::{Table, TableFlags, TableId};
use crate::world::World;

// ---------------------------------------------------------------------------
// TableStore
// ---------------------------------------------------------------------------

/// Arena of tables plus the type→table index.
pub(crate) struct TableStore {
    pub(crate) tables: Vec<Table>,
    map: HashMap<Box<[EntityId]>, TableId>,
}

impl TableStore {
    /// Create the store with the pre-made root table.
    pub fn new() -> Self {
        let root = Table::new(TableId::ROOT, Box::new([]), 0);
        let mut map = HashMap::new();
        map.insert(Vec::new().into_boxed_slice(), TableId::ROOT);
        Self {
            tables: vec![root],
            map,
        }
    }

    #[inline]
    pub fn get(&self, id: TableId) -> &Table {
        &self.tables[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id.index()]
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn lookup(&self, type_: &[EntityId]) -> Option<TableId> {
        self.map.get(type_).copied()
    }

    /// Distinct mutable borrows of two tables.
    pub fn pair_mut(&mut self, a: TableId, b: TableId) -> (&mut Table, &mut Table) {
        assert_ne!(a, b, "pair_mut requires distinct tables");
        let (ai, bi) = (a.index(), b.index());
        if ai < bi {
            let (left, right) = self.tables.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = self.tables.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }
}

/// Canonicalize an id list: drop nulls, sort ascending, de-duplicate.
pub(crate) fn normalize_type(ids: &[EntityId]) -> Vec<EntityId> {
    let mut out: Vec<EntityId> = ids.iter().copied().filter(|id| !id.is_null()).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Whether a type contains an id. A role-encoded probe whose target is the
/// wildcard matches any element carrying that role; everything else matches
/// by exact numeric value.
pub(crate) fn type_has(type_: &[EntityId], id: EntityId) -> bool {
    if let Some(role) = id.role_of() {
        if id.masked() == crate::entity::WILDCARD.masked() {
            return type_
                .iter()
                .any(|&t| t.role_of() == Some(role));
        }
    }
    type_.iter().any(|&t| t == id)
}

// ---------------------------------------------------------------------------
// Graph operations (need world context to resolve component descriptors)
// ---------------------------------------------------------------------------

impl World {
    /// Find the unique table for an id list, creating it on first miss. The
    /// input may be unsorted and contain duplicates.
    pub(crate) fn table_find_or_create(&mut self, ids: &[EntityId]) -> TableId {
        let type_ = normalize_type(ids);
        if type_.is_empty() {
            return TableId::ROOT;
        }
        if let Some(id) = self.store.lookup(&type_) {
            return id;
        }
        self.create_table(type_)
    }

    fn create_table(&mut self, type_: Vec<EntityId>) -> TableId {
        assert!(
            !self.in_progress,
            "cannot create a table while iteration is in progress"
        );

        let column_count = self.data_column_count(&type_);
        let id = TableId(self.store.tables.len() as u32);
        let mut table = Table::new(id, type_.clone().into_boxed_slice(), column_count);

        // Self-edges for own components, plus type-derived flags.
        for &e in &type_ {
            if !e.is_role() && e.to_raw() <= LAST_BUILTIN_ID {
                table.flags |= TableFlags::HAS_BUILTINS;
            }
            if e == DISABLED {
                table.flags |= TableFlags::IS_DISABLED;
            }
            if e == COMPONENT {
                table.flags |= TableFlags::HAS_COMPONENT_DATA;
            }
            table.edges.entry(e.to_raw()).or_default().add = Some(id);
        }

        tracing::debug!(table = id.0, column_count, "new table");

        self.store.map.insert(type_.into_boxed_slice(), id);
        self.store.tables.push(table);
        id
    }

    /// Length of the data-bearing prefix of a type. Components cluster at
    /// the start because component ids come from the reserved low pool;
    /// `Component` and `Name` are special-cased so the check works during
    /// bootstrap.
    fn data_column_count(&self, type_: &[EntityId]) -> usize {
        let mut count = 0;
        for (i, &id) in type_.iter().enumerate() {
            if id == COMPONENT || id == NAME || self.component_info(id).is_some() {
                count = i + 1;
            }
        }
        count
    }

    /// Follow (or build) the add edge: the table whose type is
    /// `node.type ∪ {id}`. The edge is cached on both endpoints, the
    /// destination recording the reverse `remove` edge.
    pub(crate) fn traverse_add(&mut self, node: Option<TableId>, id: EntityId) -> TableId {
        let node = node.unwrap_or(TableId::ROOT);
        let raw = id.to_raw();

        if let Some(next) = self
            .store
            .get(node)
            .edges
            .get(&raw)
            .and_then(|edge| edge.add)
        {
            return next;
        }

        let mut with: Vec<EntityId> = self.store.get(node).type_().to_vec();
        with.push(id);
        let next = self.table_find_or_create(&with);

        self.store.get_mut(node).edges.entry(raw).or_default().add = Some(next);
        if next != node {
            let back = self.store.get_mut(next).edges.entry(raw).or_default();
            if back.remove.is_none() {
                back.remove = Some(node);
            }
        }
        next
    }

    /// Follow (or build) the remove edge: the table whose type is
    /// `node.type \ {id}`. The destination records the reverse `add` edge.
    pub(crate) fn traverse_remove(&mut self, node: Option<TableId>, id: EntityId) -> TableId {
        let node = node.unwrap_or(TableId::ROOT);
        let raw = id.to_raw();

        if let Some(next) = self
            .store
            .get(node)
            .edges
            .get(&raw)
            .and_then(|edge| edge.remove)
        {
            return next;
        }

        let without: Vec<EntityId> = self
            .store
            .get(node)
            .type_()
            .iter()
            .copied()
            .filter(|&t| t != id)
            .collect();
        let next = self.table_find_or_create(&without);

        self.store.get_mut(node).edges.entry(raw).or_default().remove = Some(next);
        if next != node {
            let back = self.store.get_mut(next).edges.entry(raw).or_default();
            if back.add.is_none() {
                back.add = Some(node);
            }
        }
        next
    }

    /// Resolved `(descriptor, hooks)` for each data column of a table.
    pub(crate) fn column_layouts(&self, table: TableId) -> Vec<(Component, Option<Lifecycle>)> {
        let t = self.store.get(table);
        let prefix: Vec<EntityId> = t.type_()[..t.column_count()].to_vec();
        prefix
            .iter()
            .map(|&id| {
                let info = self.component_info(id).unwrap_or_default();
                let lc = self
                    .component_id_from_id(id)
                    .and_then(|real| self.lifecycle.get(real));
                (info, lc)
            })
            .collect()
    }

    /// Initialize a table's columns if they are not ready yet.
    pub(crate) fn table_ensure_data(&mut self, table: TableId) {
        if self.store.get(table).data_ready() {
            return;
        }
        let layouts = self.column_layouts(table);
        self.store.get_mut(table).ensure_data(&layouts);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{SCOPE, WILDCARD};

    #[test]
    fn normalize_sorts_and_dedups() {
        let a = EntityId::from_raw(40);
        let b = EntityId::from_raw(41);
        let c = EntityId::from_raw(42);
        assert_eq!(
            normalize_type(&[c, a, b, a, EntityId::NULL]),
            vec![a, b, c]
        );
        assert!(normalize_type(&[]).is_empty());
    }

    #[test]
    fn type_has_exact_and_wildcard() {
        let parent = EntityId::from_raw(500);
        let other = EntityId::from_raw(501);
        let type_ = normalize_type(&[EntityId::from_raw(40), EntityId::role(SCOPE, parent)]);

        assert!(type_has(&type_, EntityId::from_raw(40)));
        assert!(type_has(&type_, EntityId::role(SCOPE, parent)));
        assert!(!type_has(&type_, EntityId::role(SCOPE, other)));
        assert!(type_has(&type_, EntityId::role(SCOPE, WILDCARD)));
        assert!(!type_has(
            &type_,
            EntityId::role(EntityId::from_raw(99), WILDCARD)
        ));
    }

    #[test]
    fn pair_mut_returns_disjoint_tables() {
        let mut store = TableStore::new();
        store
            .tables
            .push(Table::new(TableId(1), Box::new([EntityId::from_raw(40)]), 1));
        let (a, b) = store.pair_mut(TableId(0), TableId(1));
        assert_eq!(a.id(), TableId(0));
        assert_eq!(b.id(), TableId(1));
    }
}
