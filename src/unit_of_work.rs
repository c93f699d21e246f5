//! Pending-mutation tracking and the ordered commit.
//!
//! Three insertion-ordered schedules (insert, update, delete) plus a
//! join-table schedule for many-to-many link rows. Scheduling walks cascade
//! edges; commit orders records along the owning-side dependency graph:
//! deletes run dependents-first, inserts run prerequisites-first, updates
//! keep scheduling order. A cycle among inserts is split on a nullable
//! foreign key (insert NULL now, patch after the partner lands); with no
//! nullable edge the cycle is unresolvable.

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::executor;
use crate::expr::Expression;
use crate::identity::IdentityCache;
use crate::metadata::{MetadataRegistry, RelationKind};
use crate::query::build;
use crate::query::plan::{Action, QueryPlan};
use crate::record::{Record, Relation};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;

/// One pending link row: `owner` relates to `target` through `relation`.
/// A delete entry with no target clears every link of the owner.
#[derive(Debug, Clone)]
struct LinkEntry {
    owner: Record,
    relation: String,
    target: Option<Record>,
}

#[derive(Default)]
pub struct UnitOfWork {
    inserts: Vec<Record>,
    updates: Vec<Record>,
    deletes: Vec<Record>,
    link_inserts: Vec<LinkEntry>,
    link_deletes: Vec<LinkEntry>,
}

fn scheduled(list: &[Record], record: &Record) -> bool {
    list.iter().any(|r| r.same_as(record))
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.link_inserts.is_empty()
            && self.link_deletes.is_empty()
    }

    pub fn clear(&mut self) {
        self.inserts.clear();
        self.updates.clear();
        self.deletes.clear();
        self.link_inserts.clear();
        self.link_deletes.clear();
    }

    /// Schedules an INSERT. No-op for persisted or already-scheduled
    /// records. Declared column defaults fill uninitialised fields, and
    /// persist-cascades pull related records into the schedule.
    pub fn schedule_insert(&mut self, registry: &MetadataRegistry, record: &Record) -> Result<()> {
        if record.is_persisted() || scheduled(&self.inserts, record) {
            return Ok(());
        }
        let desc = registry.get(&record.type_id())?;
        for (field, column) in &desc.columns {
            if column.fk_relation.is_none() && !record.has_field(field) {
                if let Some(default) = &column.default {
                    record.set(field.clone(), default.clone());
                }
            }
        }
        self.inserts.push(record.clone());

        for (field, relation) in &desc.relations {
            match record.relation(field) {
                Relation::One(target) => {
                    if relation.cascade.persist {
                        self.schedule_insert(registry, &target)?;
                    }
                }
                Relation::Many(targets) => {
                    for target in &targets {
                        if relation.cascade.persist {
                            self.schedule_insert(registry, target)?;
                        }
                        if relation.kind == RelationKind::ManyToMany {
                            self.link_inserts.push(LinkEntry {
                                owner: record.clone(),
                                relation: field.clone(),
                                target: Some(target.clone()),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Schedules an UPDATE. No-op unless the record is persisted and its
    /// extract differs from the snapshot.
    pub fn schedule_update(&mut self, registry: &MetadataRegistry, record: &Record) -> Result<()> {
        if !record.is_persisted() || scheduled(&self.updates, record) {
            return Ok(());
        }
        let desc = registry.get(&record.type_id())?;
        if !registry.is_dirty(&desc, record) {
            return Ok(());
        }
        self.updates.push(record.clone());
        Ok(())
    }

    /// Schedules a DELETE. No-op unless persisted. Remove-cascades walk
    /// loaded relations; many-to-many link rows of the owner are always
    /// cleared.
    pub fn schedule_delete(&mut self, registry: &MetadataRegistry, record: &Record) -> Result<()> {
        if !record.is_persisted() || scheduled(&self.deletes, record) {
            return Ok(());
        }
        let desc = registry.get(&record.type_id())?;
        self.deletes.push(record.clone());

        for (field, relation) in &desc.relations {
            if relation.kind == RelationKind::ManyToMany {
                self.link_deletes.push(LinkEntry {
                    owner: record.clone(),
                    relation: field.clone(),
                    target: None,
                });
            }
            if !relation.cascade.remove {
                continue;
            }
            match record.relation(field) {
                Relation::One(target) => self.schedule_delete(registry, &target)?,
                Relation::Many(targets) => {
                    for target in &targets {
                        self.schedule_delete(registry, target)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Commits in three passes: deletes (dependents first), inserts
    /// (prerequisites first), updates (scheduling order); then join-table
    /// deletes and inserts. Schedules are cleared only on success, so a
    /// failed flush can be retried.
    pub async fn commit(
        &mut self,
        driver: &Driver,
        registry: &MetadataRegistry,
        identity: &IdentityCache,
    ) -> Result<()> {
        let delete_order = {
            let edges = owning_edges(registry, &self.deletes)?;
            let forward = build_graph(self.deletes.len(), &edges, false);
            if petgraph::algo::toposort(&forward, None).is_err() {
                return Err(Error::CascadeCycle(
                    "cyclic owning relations among scheduled deletes".into(),
                ));
            }
            // Walking the reversed graph puts the FK holders first while
            // keeping scheduling-order ties.
            let reversed = build_graph(self.deletes.len(), &edges, true);
            stable_post_order(&reversed, self.deletes.len())
        };
        for index in delete_order {
            let record = self.deletes[index].clone();
            let desc = registry.get(&record.type_id())?;
            executor::execute_delete(driver, registry, identity, &desc, &record).await?;
        }

        let edges = owning_edges(registry, &self.inserts)?;
        let (insert_order, deferred) = ordered_with_split(&self.inserts, edges)?;
        for index in insert_order {
            let record = self.inserts[index].clone();
            let desc = registry.get(&record.type_id())?;
            executor::execute_insert(driver, registry, identity, &desc, &record).await?;
        }
        // Patch the foreign keys whose edges were split to break a cycle.
        for edge in deferred {
            let owner = self.inserts[edge.owner].clone();
            let target = self.inserts[edge.target].clone();
            let desc = registry.get(&owner.type_id())?;
            let target_desc = registry.get(&target.type_id())?;
            let mut plan = QueryPlan::new(Action::Update, desc.table.clone());
            plan.values.insert(
                edge.fk_column.clone(),
                registry.pk_value(&target_desc, &target),
            );
            plan.where_clause = Some(Expression::and().and_eq(
                desc.primary_key_column(),
                registry.pk_value(&desc, &owner),
            ));
            executor::run_plan(driver, &plan).await?;
            owner.mark_persisted(registry.extract(&desc, &owner));
        }

        for record in self.updates.clone() {
            let desc = registry.get(&record.type_id())?;
            executor::execute_update(driver, registry, identity, &desc, &record).await?;
        }

        for entry in self.link_deletes.clone() {
            self.run_link_delete(driver, registry, &entry).await?;
        }
        for entry in self.link_inserts.clone() {
            self.run_link_insert(driver, registry, &entry).await?;
        }

        self.clear();
        Ok(())
    }

    async fn run_link_delete(
        &self,
        driver: &Driver,
        registry: &MetadataRegistry,
        entry: &LinkEntry,
    ) -> Result<()> {
        let desc = registry.get(&entry.owner.type_id())?;
        let (table, owner_fk, inverse_fk) = link_parts(registry, &entry.owner, &entry.relation)?;
        let owner_pk = registry.pk_value(&desc, &entry.owner);
        let mut expr = Expression::and().and_eq(owner_fk, owner_pk);
        if let Some(target) = &entry.target {
            let target_desc = registry.get(&target.type_id())?;
            expr = expr.and_eq(inverse_fk, registry.pk_value(&target_desc, target));
        }
        let plan = build::delete_where_plan(table, expr);
        executor::run_plan(driver, &plan).await?;
        Ok(())
    }

    async fn run_link_insert(
        &self,
        driver: &Driver,
        registry: &MetadataRegistry,
        entry: &LinkEntry,
    ) -> Result<()> {
        let desc = registry.get(&entry.owner.type_id())?;
        let target = entry.target.as_ref().ok_or_else(|| {
            Error::invalid(format!(
                "link insert for `{}.{}` has no target",
                desc.type_id, entry.relation
            ))
        })?;
        let target_desc = registry.get(&target.type_id())?;
        let (table, owner_fk, inverse_fk) = link_parts(registry, &entry.owner, &entry.relation)?;
        let plan = build::insert_values_plan(
            table,
            [
                (owner_fk, registry.pk_value(&desc, &entry.owner)),
                (inverse_fk, registry.pk_value(&target_desc, target)),
            ],
        );
        executor::run_plan(driver, &plan).await?;
        Ok(())
    }
}

fn link_parts(
    registry: &MetadataRegistry,
    owner: &Record,
    relation_field: &str,
) -> Result<(String, String, String)> {
    let desc = registry.get(&owner.type_id())?;
    let join_table = desc
        .get_relation(relation_field)
        .and_then(|r| r.join_table.as_ref())
        .ok_or_else(|| {
            Error::invalid(format!(
                "`{}.{relation_field}` is not a join-table relation",
                desc.type_id
            ))
        })?;
    Ok((
        join_table.name.clone(),
        join_table.owner_fk.clone(),
        join_table.inverse_fk.clone(),
    ))
}

/// One owning-side dependency: `owner`'s FK points at `target`, so `target`
/// must be inserted first (and deleted last).
#[derive(Debug, Clone)]
struct OwningEdge {
    owner: usize,
    target: usize,
    fk_column: String,
    nullable: bool,
}

fn owning_edges(registry: &MetadataRegistry, records: &[Record]) -> Result<Vec<OwningEdge>> {
    let mut edges = vec![];
    for (i, record) in records.iter().enumerate() {
        let desc = registry.get(&record.type_id())?;
        for (field, relation) in &desc.relations {
            let jc = match &relation.join_column {
                Some(jc) => jc,
                None => continue,
            };
            if let Relation::One(target) = record.relation(field) {
                if let Some(j) = records.iter().position(|r| r.same_as(&target)) {
                    if i != j {
                        edges.push(OwningEdge {
                            owner: i,
                            target: j,
                            fk_column: jc.name.clone(),
                            nullable: jc.nullable,
                        });
                    }
                }
            }
        }
    }
    Ok(edges)
}

/// Orders records topologically (prerequisites first); ties break in
/// scheduling order via a depth-first post-order walk started from each node
/// in turn. On a cycle, nullable-FK edges are dropped one at a time
/// (recorded for post-insert patching) until the graph is a DAG; a cycle
/// with no nullable edge is unresolvable.
fn ordered_with_split(
    records: &[Record],
    mut edges: Vec<OwningEdge>,
) -> Result<(Vec<usize>, Vec<OwningEdge>)> {
    let mut deferred = vec![];
    loop {
        let graph = build_graph(records.len(), &edges, false);
        if petgraph::algo::toposort(&graph, None).is_ok() {
            break;
        }
        let splittable = edges.iter().position(|e| e.nullable);
        match splittable {
            Some(at) => deferred.push(edges.remove(at)),
            None => {
                return Err(Error::CascadeCycle(
                    "owning relations form a cycle with no nullable foreign key; \
                     break it with persist-then-update"
                        .into(),
                ))
            }
        }
    }

    let graph = build_graph(records.len(), &edges, false);
    Ok((stable_post_order(&graph, records.len()), deferred))
}

/// Depth-first post-order started from each node in turn: prerequisites
/// come out first, unrelated nodes keep their scheduling order.
fn stable_post_order(graph: &DiGraph<(), ()>, nodes: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(nodes);
    let mut dfs = DfsPostOrder::empty(graph);
    for i in 0..nodes {
        dfs.move_to(NodeIndex::new(i));
        while let Some(node) = dfs.next(graph) {
            order.push(node.index());
        }
    }
    order
}

fn build_graph(nodes: usize, edges: &[OwningEdge], reversed: bool) -> DiGraph<(), ()> {
    let mut graph = DiGraph::<(), ()>::new();
    for _ in 0..nodes {
        graph.add_node(());
    }
    for edge in edges {
        let (a, b) = if reversed {
            (edge.target, edge.owner)
        } else {
            (edge.owner, edge.target)
        };
        graph.add_edge(NodeIndex::new(a), NodeIndex::new(b), ());
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Cascade, ColumnDescriptor, EntityDescriptor, Fetch, JoinColumn};
    use crate::value::Value;

    fn user_descriptor() -> EntityDescriptor {
        EntityDescriptor::declare("User", "users")
            .alias("user")
            .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
            .column("username", ColumnDescriptor::new("username", "varchar"))
            .column(
                "status",
                ColumnDescriptor::new("status", "varchar").default_value("active"),
            )
            .one_to_one(
                "profile",
                "Profile",
                JoinColumn::new("profile_id", "id"),
                Fetch::Lazy,
                Cascade::ALL,
            )
    }

    fn profile_descriptor() -> EntityDescriptor {
        EntityDescriptor::declare("Profile", "profiles")
            .alias("profile")
            .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
            .column("bio", ColumnDescriptor::new("bio", "varchar"))
    }

    fn registry() -> MetadataRegistry {
        let registry = MetadataRegistry::new();
        registry.register(user_descriptor);
        registry.register(profile_descriptor);
        registry
    }

    #[test]
    fn schedule_insert_applies_defaults_and_cascades() {
        let registry = registry();
        let mut uow = UnitOfWork::new();
        let user = Record::new("User");
        user.set("username", "neo");
        let profile = Record::new("Profile");
        profile.set("bio", "Chosen");
        user.set_related("profile", Some(profile.clone()));

        uow.schedule_insert(&registry, &user).unwrap();
        assert_eq!(uow.inserts.len(), 2);
        assert!(uow.inserts[0].same_as(&user));
        assert!(uow.inserts[1].same_as(&profile));
        assert_eq!(user.get("status"), Value::from("active"));
    }

    #[test]
    fn schedule_insert_is_idempotent() {
        let registry = registry();
        let mut uow = UnitOfWork::new();
        let user = Record::new("User");
        user.set("username", "neo");
        uow.schedule_insert(&registry, &user).unwrap();
        uow.schedule_insert(&registry, &user).unwrap();
        assert_eq!(uow.inserts.len(), 1);
    }

    #[test]
    fn persisted_records_are_not_rescheduled_for_insert() {
        let registry = registry();
        let desc = registry.get("Profile").unwrap();
        let mut uow = UnitOfWork::new();
        let profile = Record::new("Profile");
        profile.set("id", 1).set("bio", "done");
        profile.mark_persisted(registry.extract(&desc, &profile));
        uow.schedule_insert(&registry, &profile).unwrap();
        assert!(uow.inserts.is_empty());
    }

    #[test]
    fn clean_records_are_not_scheduled_for_update() {
        let registry = registry();
        let desc = registry.get("Profile").unwrap();
        let mut uow = UnitOfWork::new();
        let profile = Record::new("Profile");
        profile.set("id", 1).set("bio", "same");
        profile.mark_persisted(registry.extract(&desc, &profile));
        uow.schedule_update(&registry, &profile).unwrap();
        assert!(uow.updates.is_empty());
        profile.set("bio", "different");
        uow.schedule_update(&registry, &profile).unwrap();
        assert_eq!(uow.updates.len(), 1);
    }

    #[test]
    fn insert_order_puts_prerequisites_first() {
        let registry = registry();
        let user = Record::new("User");
        let profile = Record::new("Profile");
        user.set_related("profile", Some(profile.clone()));
        // User scheduled before profile, but the profile must insert first.
        let records = vec![user.clone(), profile.clone()];
        let edges = owning_edges(&registry, &records).unwrap();
        let (order, deferred) = ordered_with_split(&records, edges).unwrap();
        assert_eq!(order, vec![1, 0]);
        assert!(deferred.is_empty());
    }

    #[test]
    fn a_nullable_cycle_splits_instead_of_failing() {
        fn left() -> EntityDescriptor {
            EntityDescriptor::declare("Left", "lefts")
                .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
                .one_to_one(
                    "right",
                    "Right",
                    JoinColumn::new("right_id", "id"),
                    Fetch::Lazy,
                    Cascade::ALL,
                )
        }
        fn right() -> EntityDescriptor {
            EntityDescriptor::declare("Right", "rights")
                .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
                .one_to_one(
                    "left",
                    "Left",
                    JoinColumn::new("left_id", "id"),
                    Fetch::Lazy,
                    Cascade::ALL,
                )
        }
        let registry = MetadataRegistry::new();
        registry.register(left);
        registry.register(right);

        let a = Record::new("Left");
        let b = Record::new("Right");
        a.set_related("right", Some(b.clone()));
        b.set_related("left", Some(a.clone()));
        let records = vec![a, b];
        let edges = owning_edges(&registry, &records).unwrap();
        let (order, deferred) = ordered_with_split(&records, edges).unwrap();
        assert_eq!(order.len(), 2);
        assert_eq!(deferred.len(), 1);
    }

    #[test]
    fn a_non_nullable_cycle_is_a_cascade_cycle() {
        fn left() -> EntityDescriptor {
            EntityDescriptor::declare("Left", "lefts")
                .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
                .one_to_one(
                    "right",
                    "Right",
                    JoinColumn::new("right_id", "id").not_null(),
                    Fetch::Lazy,
                    Cascade::ALL,
                )
        }
        fn right() -> EntityDescriptor {
            EntityDescriptor::declare("Right", "rights")
                .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
                .one_to_one(
                    "left",
                    "Left",
                    JoinColumn::new("left_id", "id").not_null(),
                    Fetch::Lazy,
                    Cascade::ALL,
                )
        }
        let registry = MetadataRegistry::new();
        registry.register(left);
        registry.register(right);

        let a = Record::new("Left");
        let b = Record::new("Right");
        a.set_related("right", Some(b.clone()));
        b.set_related("left", Some(a.clone()));
        let records = vec![a, b];
        let edges = owning_edges(&registry, &records).unwrap();
        assert!(matches!(
            ordered_with_split(&records, edges),
            Err(Error::CascadeCycle(_))
        ));
    }
}
