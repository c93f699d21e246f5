//! Descriptor registry: the single consumer of per-type polymorphism.
//!
//! Entity declarations are registered as plain functions (usually the
//! [`EntityDefinition`] trait's `descriptor`). `get` finalises a declaration
//! on first use: validation, synthetic foreign-key columns, memoisation.
//! An optional external cache can short-circuit the parse; on a miss the
//! registry always re-parses from the registered source.

use crate::error::{Error, Result};
use crate::metadata::{ColumnDescriptor, EntityDescriptor, RelationKind};
use crate::record::{LoaderKey, Record, Relation};
use crate::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// Compile-time entity declaration, registered at module init.
pub trait EntityDefinition {
    const TYPE_ID: &'static str;
    fn descriptor() -> EntityDescriptor;
}

/// Pluggable external descriptor cache. Keys are `type_id` strings; the
/// payload serialises with serde, so storage is opaque to the core.
pub trait DescriptorCache {
    fn get(&self, key: &str) -> Option<EntityDescriptor>;
    fn set(&self, key: &str, descriptor: &EntityDescriptor, ttl: Option<Duration>);
    fn clear(&self, key: &str);
}

type DescriptorSource = fn() -> EntityDescriptor;

#[derive(Default)]
pub struct MetadataRegistry {
    sources: RefCell<HashMap<String, DescriptorSource>>,
    parsed: RefCell<HashMap<String, Rc<EntityDescriptor>>>,
    external: Option<Box<dyn DescriptorCache>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: Box<dyn DescriptorCache>) -> Self {
        Self {
            sources: RefCell::new(HashMap::new()),
            parsed: RefCell::new(HashMap::new()),
            external: Some(cache),
        }
    }

    pub fn register(&self, source: DescriptorSource) {
        let declared = source();
        self.sources
            .borrow_mut()
            .insert(declared.type_id.clone(), source);
    }

    pub fn register_entity<T: EntityDefinition>(&self) {
        self.sources
            .borrow_mut()
            .insert(T::TYPE_ID.to_owned(), T::descriptor);
    }

    pub fn known_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.sources.borrow().keys().cloned().collect();
        types.sort();
        types
    }

    /// Drops memoised descriptors; sources stay registered.
    pub fn clear(&self) {
        self.parsed.borrow_mut().clear();
    }

    /// Finalised descriptor for `type_id`, parsed at most once.
    pub fn get(&self, type_id: &str) -> Result<Rc<EntityDescriptor>> {
        if let Some(desc) = self.parsed.borrow().get(type_id) {
            return Ok(desc.clone());
        }
        if let Some(cache) = &self.external {
            if let Some(desc) = cache.get(type_id) {
                let desc = Rc::new(desc);
                self.parsed
                    .borrow_mut()
                    .insert(type_id.to_owned(), desc.clone());
                return Ok(desc);
            }
        }
        let desc = self.parse(type_id)?;
        if let Some(cache) = &self.external {
            cache.set(type_id, &desc, None);
        }
        let desc = Rc::new(desc);
        self.parsed
            .borrow_mut()
            .insert(type_id.to_owned(), desc.clone());
        Ok(desc)
    }

    fn parse(&self, type_id: &str) -> Result<EntityDescriptor> {
        let source = *self
            .sources
            .borrow()
            .get(type_id)
            .ok_or_else(|| Error::UnknownEntity(type_id.to_owned()))?;
        self.finalise(source())
    }

    fn finalise(&self, mut desc: EntityDescriptor) -> Result<EntityDescriptor> {
        if desc.table.is_empty() {
            return Err(Error::invalid(format!(
                "`{}` declares no backing table",
                desc.type_id
            )));
        }
        if desc.alias.is_empty() {
            desc.alias = desc.type_id.to_lowercase();
        }
        let pk_count = desc.columns.values().filter(|c| c.primary_key).count();
        if pk_count == 0 {
            return Err(Error::invalid(format!(
                "`{}` declares no primary key column",
                desc.type_id
            )));
        }
        if pk_count > 1 {
            return Err(Error::invalid(format!(
                "`{}` declares more than one primary key column",
                desc.type_id
            )));
        }

        for (field, relation) in &desc.relations {
            if desc.columns.contains_key(field) {
                return Err(Error::invalid(format!(
                    "`{}` declares `{field}` as both a column and a relation",
                    desc.type_id
                )));
            }
            let shape_ok = match relation.kind {
                RelationKind::OneToOne => {
                    relation.join_column.is_some() != relation.mapped_by.is_some()
                }
                RelationKind::ManyToOne => {
                    relation.join_column.is_some() && relation.mapped_by.is_none()
                }
                RelationKind::OneToMany => {
                    relation.mapped_by.is_some() && relation.join_column.is_none()
                }
                RelationKind::ManyToMany => relation.join_table.is_some(),
            };
            if !shape_ok {
                return Err(Error::invalid(format!(
                    "relation `{}.{field}` has an inconsistent owning/inverse declaration",
                    desc.type_id
                )));
            }
            if let Some(mapped_by) = &relation.mapped_by {
                self.check_mapped_by(&desc.type_id, field, &relation.target_type, mapped_by)?;
            }
        }

        // Owning-side join columns become (or annotate) real columns.
        let owning: Vec<(String, crate::metadata::JoinColumn, String)> = desc
            .relations
            .iter()
            .filter_map(|(field, rel)| {
                rel.join_column
                    .clone()
                    .map(|jc| (field.clone(), jc, rel.target_type.clone()))
            })
            .collect();
        for (field, join_column, target_type) in owning {
            let existing = desc
                .columns
                .iter()
                .find(|(_, c)| c.name == join_column.name)
                .map(|(logical, _)| logical.clone());
            if let Some(logical) = existing {
                if let Some(column) = desc.columns.get_mut(&logical) {
                    column.fk_relation = Some(field);
                }
            } else {
                let sql_type =
                    self.referenced_sql_type(&target_type, &join_column.referenced_column);
                let mut column = ColumnDescriptor::new(join_column.name.clone(), sql_type);
                column.nullable = join_column.nullable;
                column.fk_relation = Some(field);
                desc.columns.insert(join_column.name.clone(), column);
            }
        }
        Ok(desc)
    }

    /// The inverse side must point at an owning relation on the target.
    fn check_mapped_by(
        &self,
        type_id: &str,
        field: &str,
        target_type: &str,
        mapped_by: &str,
    ) -> Result<()> {
        let sources = self.sources.borrow();
        let target = sources
            .get(target_type)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "relation `{type_id}.{field}` maps by `{mapped_by}` on unregistered type `{target_type}`"
                ))
            })?();
        match target.relations.get(mapped_by) {
            Some(owning) if owning.join_column.is_some() => Ok(()),
            _ => Err(Error::invalid(format!(
                "relation `{type_id}.{field}` maps by `{target_type}.{mapped_by}`, \
                 which is not an owning relation"
            ))),
        }
    }

    /// SQL type of the referenced column, for synthesised FK columns.
    fn referenced_sql_type(&self, target_type: &str, referenced_column: &str) -> String {
        self.sources
            .borrow()
            .get(target_type)
            .map(|source| source())
            .and_then(|target| {
                target
                    .columns
                    .values()
                    .find(|c| c.name == referenced_column)
                    .map(|c| c.sql_type.clone())
            })
            .unwrap_or_else(|| "int".to_owned())
    }

    /// Reads the declared columns out of a record, keyed by physical column
    /// name. Foreign-key columns read through the owning relation slot.
    pub fn extract(&self, desc: &EntityDescriptor, record: &Record) -> IndexMap<String, Value> {
        let mut out = IndexMap::with_capacity(desc.columns.len());
        for (field, column) in &desc.columns {
            let value = match &column.fk_relation {
                Some(relation_field) => self.fk_value(desc, record, relation_field, field),
                None => record.get(field),
            };
            out.insert(column.name.clone(), value);
        }
        out
    }

    /// Extract used before INSERT: a database-generated primary key is left
    /// out so the backend can assign it.
    pub fn extract_for_insert(
        &self,
        desc: &EntityDescriptor,
        record: &Record,
    ) -> IndexMap<String, Value> {
        let mut out = self.extract(desc, record);
        if desc.primary_key_generated() {
            out.shift_remove(desc.primary_key_column());
        }
        out
    }

    fn fk_value(
        &self,
        desc: &EntityDescriptor,
        record: &Record,
        relation_field: &str,
        column_field: &str,
    ) -> Value {
        let relation = match desc.relations.get(relation_field) {
            Some(r) => r,
            None => return record.get(column_field),
        };
        match record.relation(relation_field) {
            Relation::One(target) => {
                let referenced = relation
                    .join_column
                    .as_ref()
                    .map(|jc| jc.referenced_column.clone())
                    .unwrap_or_else(|| "id".to_owned());
                let logical = self
                    .get(&relation.target_type)
                    .ok()
                    .and_then(|target_desc| {
                        target_desc
                            .columns
                            .iter()
                            .find(|(_, c)| c.name == referenced)
                            .map(|(l, _)| l.clone())
                    })
                    .unwrap_or(referenced);
                target.get(&logical)
            }
            Relation::Unloaded(loader) => match loader.key {
                LoaderKey::Pk(value) => value,
                _ => record.get(column_field),
            },
            Relation::Null => Value::Null,
            Relation::Unset | Relation::Many(_) => record.get(column_field),
        }
    }

    /// A record is dirty when its current extract differs from the snapshot.
    pub fn is_dirty(&self, desc: &EntityDescriptor, record: &Record) -> bool {
        match record.snapshot() {
            Some(snapshot) => snapshot != self.extract(desc, record),
            None => true,
        }
    }

    /// Primary key value of a record, `Null` when unset.
    pub fn pk_value(&self, desc: &EntityDescriptor, record: &Record) -> Value {
        record.get(desc.primary_key_field())
    }
}
