//! The public façade: one manager per database session.
//!
//! Reads flow registry → select builder → renderer → driver → hydrator,
//! grouping result rows on the root primary-key boundary. Writes are
//! scheduled into the unit of work and land on `flush`. A manager is
//! single-threaded cooperative; open a second manager on a second session
//! for interleaved work.

use crate::driver::{Driver, Row, RowStream};
use crate::error::{Error, Result};
use crate::expr::Expression;
use crate::hydrate::Hydrator;
use crate::identity::IdentityCache;
use crate::metadata::{EntityDescriptor, MetadataRegistry};
use crate::query::build::{self, Criteria, Options};
use crate::query::plan::{Join, JoinKind};
use crate::query::render::render;
use crate::record::{Loader, LoaderKey, Record, Relation};
use crate::unit_of_work::UnitOfWork;
use crate::value::Value;
use futures::stream::LocalBoxStream;
use futures::StreamExt;
use std::cell::RefCell;
use std::rc::Rc;

pub struct EntityManager {
    driver: Driver,
    registry: Rc<MetadataRegistry>,
    identity: IdentityCache,
    uow: RefCell<UnitOfWork>,
}

impl EntityManager {
    pub fn new(driver: Driver, registry: Rc<MetadataRegistry>) -> Self {
        Self {
            driver,
            registry,
            identity: IdentityCache::new(),
            uow: RefCell::new(UnitOfWork::new()),
        }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    /// First record matching the criteria, with eager joins applied per
    /// `options`. A scalar criteria is a primary-key lookup and
    /// short-circuits through the identity cache.
    pub async fn find_by(
        &self,
        type_id: &str,
        criteria: impl Into<Criteria>,
        options: Options,
    ) -> Result<Option<Record>> {
        let criteria = criteria.into();
        if let Criteria::Id(id) = &criteria {
            if options.joins.is_empty() {
                if let Some(hit) = self.identity.get(type_id, id) {
                    return Ok(Some(hit));
                }
            }
        }
        let desc = self.registry.get(type_id)?;
        let rows = self.run_select(&desc, &criteria, &options).await?;
        let hydrator = Hydrator::new(&self.registry, &self.identity);
        let key_column = group_key_column(&desc);

        let mut rows = rows.into_iter();
        let first = match rows.next() {
            Some(row) => row,
            None => return Ok(None),
        };
        let record = hydrator.hydrate(&desc, &first)?;
        let key = first.get(&key_column).cloned();
        for row in rows {
            if row.get(&key_column).cloned() != key {
                break;
            }
            hydrator.hydrate_relations(&record, &desc, &row)?;
        }
        Ok(Some(record))
    }

    /// Every record matching the criteria, one per root-pk row group.
    pub async fn find_all(
        &self,
        type_id: &str,
        criteria: impl Into<Criteria>,
        options: Options,
    ) -> Result<Vec<Record>> {
        let desc = self.registry.get(type_id)?;
        let rows = self.run_select(&desc, &criteria.into(), &options).await?;
        self.group_and_hydrate(&desc, rows)
    }

    /// Lazy, single-pass stream of all records of a type.
    pub fn stream_all<'a>(
        &'a self,
        type_id: &str,
        options: Options,
    ) -> Result<LocalBoxStream<'a, Result<Record>>> {
        self.stream_by(type_id, Criteria::None, options)
    }

    /// Lazy, single-pass stream of the records matching the criteria,
    /// grouping rows on the primary-key boundary as they arrive.
    pub fn stream_by<'a>(
        &'a self,
        type_id: &str,
        criteria: impl Into<Criteria>,
        options: Options,
    ) -> Result<LocalBoxStream<'a, Result<Record>>> {
        let desc = self.registry.get(type_id)?;
        let plan = build::select_plan(&self.registry, &desc, &criteria.into(), &options)?;
        let (sql, params) = render(&plan, self.driver.kind())?;
        let mut statement = self.driver.prepare(&sql);
        statement.bind_all(params.clone());
        debug!("streaming `{sql}` with {params:?}");
        let rows = statement.fetch().map_err(|e| Error::db(&sql, e))?;
        let key_column = group_key_column(&desc);

        let state = StreamState {
            manager: self,
            desc,
            rows,
            sql,
            key_column,
            pending: None,
            done: false,
        };
        Ok(futures::stream::unfold(state, |state| next_group(state)).boxed_local())
    }

    /// Number of records matching the criteria. `COUNT(*)`, or
    /// `COUNT(DISTINCT pk)` when the options ask for distinct.
    pub async fn count_by(
        &self,
        type_id: &str,
        criteria: impl Into<Criteria>,
        options: Options,
    ) -> Result<i64> {
        let desc = self.registry.get(type_id)?;
        let plan = build::count_plan(&self.registry, &desc, &criteria.into(), &options)?;
        let (sql, params) = render(&plan, self.driver.kind())?;
        let mut statement = self.driver.prepare(&sql);
        statement.bind_all(params.clone());
        let row = statement
            .fetch_one()
            .await
            .map_err(|e| Error::db(&sql, e))?;
        debug!("query `{sql}` with {params:?}");
        let count = row
            .and_then(|r| r.get("count").cloned())
            .and_then(|v| v.coerce("int").ok())
            .and_then(|v| v.as_int())
            .ok_or_else(|| Error::hydration("count query returned no `count` column"))?;
        Ok(count)
    }

    /// Schedules a record for insertion at the next flush.
    pub fn persist(&self, record: &Record) -> Result<()> {
        self.uow.borrow_mut().schedule_insert(&self.registry, record)
    }

    pub fn persist_all<'r>(&self, records: impl IntoIterator<Item = &'r Record>) -> Result<()> {
        let mut uow = self.uow.borrow_mut();
        for record in records {
            uow.schedule_insert(&self.registry, record)?;
        }
        Ok(())
    }

    /// Schedules a dirty record for update at the next flush.
    pub fn update(&self, record: &Record) -> Result<()> {
        self.uow.borrow_mut().schedule_update(&self.registry, record)
    }

    pub fn update_all<'r>(&self, records: impl IntoIterator<Item = &'r Record>) -> Result<()> {
        let mut uow = self.uow.borrow_mut();
        for record in records {
            uow.schedule_update(&self.registry, record)?;
        }
        Ok(())
    }

    /// Schedules a record for deletion at the next flush.
    pub fn delete(&self, record: &Record) -> Result<()> {
        self.uow.borrow_mut().schedule_delete(&self.registry, record)
    }

    pub fn delete_all<'r>(&self, records: impl IntoIterator<Item = &'r Record>) -> Result<()> {
        let mut uow = self.uow.borrow_mut();
        for record in records {
            uow.schedule_delete(&self.registry, record)?;
        }
        Ok(())
    }

    /// Commits every pending mutation. On failure the schedules stay in
    /// place and the flush can be retried.
    pub async fn flush(&self) -> Result<()> {
        let mut uow = self.uow.borrow_mut();
        uow.commit(&self.driver, &self.registry, &self.identity).await
    }

    /// Materialises a lazy relation, memoising the result on the record.
    /// Loaded relations return as-is.
    pub async fn load_relation(&self, record: &Record, field: &str) -> Result<Relation> {
        let state = record.relation(field);
        if state.is_loaded() {
            return Ok(state);
        }
        let desc = self.registry.get(&record.type_id())?;
        let relation = desc.get_relation(field).ok_or_else(|| {
            Error::invalid(format!(
                "`{}` has no relation field `{field}`",
                desc.type_id
            ))
        })?;
        let loaded = match state {
            Relation::Unloaded(loader) => self.run_loader(&loader, relation.is_many()).await?,
            // An unset slot on a fresh record has nothing to load.
            Relation::Unset => {
                if relation.is_many() {
                    Relation::Many(vec![])
                } else {
                    Relation::Null
                }
            }
            loaded => loaded,
        };
        record.set_relation(field.to_owned(), loaded.clone());
        Ok(loaded)
    }

    /// Single target of a relation, loading it on first access.
    pub async fn fetch_related(&self, record: &Record, field: &str) -> Result<Option<Record>> {
        match self.load_relation(record, field).await? {
            Relation::One(target) => Ok(Some(target)),
            _ => Ok(None),
        }
    }

    /// Targets of a to-many relation, loading them on first access.
    pub async fn fetch_related_many(&self, record: &Record, field: &str) -> Result<Vec<Record>> {
        match self.load_relation(record, field).await? {
            Relation::Many(targets) => Ok(targets),
            _ => Ok(vec![]),
        }
    }

    async fn run_loader(&self, loader: &Loader, many: bool) -> Result<Relation> {
        match &loader.key {
            LoaderKey::Pk(id) => {
                let found = self
                    .find_by(&loader.target_type, id.clone(), Options::default())
                    .await?;
                Ok(found.map(Relation::One).unwrap_or(Relation::Null))
            }
            LoaderKey::Field { column, value } => {
                let criteria = Criteria::Fields(vec![(column.clone(), value.clone())]);
                if many {
                    let records = self
                        .find_all(&loader.target_type, criteria, Options::default())
                        .await?;
                    Ok(Relation::Many(records))
                } else {
                    let found = self
                        .find_by(&loader.target_type, criteria, Options::default())
                        .await?;
                    Ok(found.map(Relation::One).unwrap_or(Relation::Null))
                }
            }
            LoaderKey::JoinTable {
                table,
                owner_fk,
                inverse_fk,
                owner_pk,
            } => {
                let target = self.registry.get(&loader.target_type)?;
                let link_alias = format!("{}_link", target.alias);
                let mut plan =
                    build::select_plan(&self.registry, &target, &Criteria::None, &Options::default())?;
                plan.joins.push(Join {
                    kind: JoinKind::Inner,
                    table: table.clone(),
                    alias: link_alias.clone(),
                    on: vec![(
                        format!("{link_alias}.{inverse_fk}"),
                        format!("{}.{}", target.alias, target.primary_key_column()),
                    )],
                });
                plan.where_clause = Some(
                    Expression::and().and_eq(format!("{link_alias}.{owner_fk}"), owner_pk.clone()),
                );
                let (sql, params) = render(&plan, self.driver.kind())?;
                let mut statement = self.driver.prepare(&sql);
                statement.bind_all(params.clone());
                let rows = statement
                    .fetch_all()
                    .await
                    .map_err(|e| Error::db(&sql, e))?;
                debug!("query `{sql}` with {params:?} returned {} rows", rows.len());
                Ok(Relation::Many(self.group_and_hydrate(&target, rows)?))
            }
        }
    }

    /// Re-selects a record by primary key, overwriting its column fields and
    /// snapshot with the database state. Returns false when the row is gone.
    pub async fn refresh(&self, record: &Record) -> Result<bool> {
        let desc = self.registry.get(&record.type_id())?;
        let pk = self.registry.pk_value(&desc, record);
        if pk.is_null() {
            return Err(Error::MissingIdentifier {
                entity: desc.type_id.clone(),
                op: "refresh",
            });
        }
        let rows = self
            .run_select(&desc, &Criteria::Id(pk), &Options::default())
            .await?;
        let row = match rows.into_iter().next() {
            Some(row) => row,
            None => return Ok(false),
        };
        for (field, column) in &desc.columns {
            if let Some(cell) = row.get(&desc.aliased(&column.name)) {
                record.set(field.clone(), cell.clone().coerce(&column.sql_type)?);
            }
        }
        record.mark_persisted(self.registry.extract(&desc, record));
        Ok(true)
    }

    /// Whether this manager's identity cache canonically holds the record.
    pub fn contains(&self, record: &Record) -> bool {
        let desc = match self.registry.get(&record.type_id()) {
            Ok(desc) => desc,
            Err(_) => return false,
        };
        let pk = self.registry.pk_value(&desc, record);
        self.identity
            .get(&desc.type_id, &pk)
            .map(|hit| hit.same_as(record))
            .unwrap_or(false)
    }

    /// Drops the identity cache and every pending schedule.
    pub fn clear(&self) {
        self.identity.clear_all();
        self.uow.borrow_mut().clear();
    }

    async fn run_select(
        &self,
        desc: &EntityDescriptor,
        criteria: &Criteria,
        options: &Options,
    ) -> Result<Vec<Row>> {
        let plan = build::select_plan(&self.registry, desc, criteria, options)?;
        let (sql, params) = render(&plan, self.driver.kind())?;
        let mut statement = self.driver.prepare(&sql);
        statement.bind_all(params.clone());
        let rows = statement
            .fetch_all()
            .await
            .map_err(|e| Error::db(&sql, e))?;
        debug!("query `{sql}` with {params:?} returned {} rows", rows.len());
        Ok(rows)
    }

    fn group_and_hydrate(&self, desc: &EntityDescriptor, rows: Vec<Row>) -> Result<Vec<Record>> {
        let hydrator = Hydrator::new(&self.registry, &self.identity);
        let key_column = group_key_column(desc);
        let mut out: Vec<Record> = vec![];
        let mut current_key: Option<Value> = None;
        for row in rows {
            let key = row.get(&key_column).cloned();
            if current_key.is_some() && key == current_key {
                if let Some(record) = out.last() {
                    hydrator.hydrate_relations(record, desc, &row)?;
                }
            } else {
                out.push(hydrator.hydrate(desc, &row)?);
                current_key = key;
            }
        }
        Ok(out)
    }
}

fn group_key_column(desc: &EntityDescriptor) -> String {
    format!("{}_{}", desc.alias, desc.primary_key_column())
}

struct StreamState<'a> {
    manager: &'a EntityManager,
    desc: Rc<EntityDescriptor>,
    rows: RowStream,
    sql: String,
    key_column: String,
    pending: Option<Row>,
    done: bool,
}

/// Pulls the next pk-bounded row group off the wire and hydrates it.
async fn next_group(mut state: StreamState<'_>) -> Option<(Result<Record>, StreamState<'_>)> {
    if state.done {
        return None;
    }
    let manager = state.manager;
    let desc = state.desc.clone();
    let key_column = state.key_column.clone();

    let first = match state.pending.take() {
        Some(row) => row,
        None => match state.rows.next().await {
            Some(Ok(row)) => row,
            Some(Err(e)) => {
                state.done = true;
                let err = Error::db(&state.sql, e);
                return Some((Err(err), state));
            }
            None => return None,
        },
    };

    let hydrator = Hydrator::new(&manager.registry, &manager.identity);
    let record = match hydrator.hydrate(&desc, &first) {
        Ok(record) => record,
        Err(e) => {
            state.done = true;
            return Some((Err(e), state));
        }
    };
    let key = first.get(&key_column).cloned();

    loop {
        match state.rows.next().await {
            Some(Ok(row)) => {
                if row.get(&key_column).cloned() == key {
                    if let Err(e) = hydrator.hydrate_relations(&record, &desc, &row) {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                } else {
                    state.pending = Some(row);
                    break;
                }
            }
            Some(Err(e)) => {
                state.done = true;
                let err = Error::db(&state.sql, e);
                return Some((Err(err), state));
            }
            None => {
                state.done = true;
                break;
            }
        }
    }
    Some((Ok(record), state))
}
