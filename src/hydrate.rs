//! Row-to-record hydration.
//!
//! Rows follow the aliased contract: root columns arrive as
//! `{alias}_{column}`, joined relation columns as `{alias}__{field}_{column}`.
//! Hydration is identity-mapped: a primary key already in the cache returns
//! the existing handle, with only multi-valued relations updated from the
//! extra row.

use crate::driver::Row;
use crate::error::{Error, Result};
use crate::identity::IdentityCache;
use crate::metadata::{EntityDescriptor, MetadataRegistry, RelationKind};
use crate::record::{Loader, LoaderKey, Record, Relation};
use crate::value::Value;

pub struct Hydrator<'a> {
    registry: &'a MetadataRegistry,
    identity: &'a IdentityCache,
}

impl<'a> Hydrator<'a> {
    pub fn new(registry: &'a MetadataRegistry, identity: &'a IdentityCache) -> Self {
        Self { registry, identity }
    }

    /// Reconstructs one record from a row. Additional rows belonging to the
    /// same root primary key go through [`Hydrator::hydrate_relations`].
    pub fn hydrate(&self, desc: &EntityDescriptor, row: &Row) -> Result<Record> {
        self.hydrate_aliased(desc, row, &desc.alias)
    }

    /// Grafts another row of the same root record onto its multi-valued
    /// relations, deduplicating children by target primary key.
    pub fn hydrate_relations(
        &self,
        record: &Record,
        desc: &EntityDescriptor,
        row: &Row,
    ) -> Result<()> {
        self.hydrate_relations_aliased(record, desc, row, &desc.alias)
    }

    fn hydrate_aliased(&self, desc: &EntityDescriptor, row: &Row, alias: &str) -> Result<Record> {
        let pk = self.row_pk(desc, row, alias)?;

        if let Some(existing) = self.identity.get(&desc.type_id, &pk) {
            self.hydrate_relations_aliased(&existing, desc, row, alias)?;
            return Ok(existing);
        }

        let record = Record::new(desc.type_id.clone());
        for (field, column) in &desc.columns {
            if let Some(cell) = row.get(&format!("{alias}_{}", column.name)) {
                record.set(field.clone(), cell.clone().coerce(&column.sql_type)?);
            }
        }

        for (field, relation) in &desc.relations {
            let state = self.relation_state(desc, row, alias, field, relation, &pk)?;
            record.set_relation(field.clone(), state);
        }

        record.mark_persisted(self.registry.extract(desc, &record));
        self.identity.set(&desc.type_id, &pk, &record);
        Ok(record)
    }

    fn row_pk(&self, desc: &EntityDescriptor, row: &Row, alias: &str) -> Result<Value> {
        let key = format!("{alias}_{}", desc.primary_key_column());
        let cell = row.get(&key).ok_or_else(|| {
            Error::hydration(format!("row is missing the key column `{key}`"))
        })?;
        let sql_type = desc
            .primary_key()
            .map(|(_, c)| c.sql_type.clone())
            .unwrap_or_else(|| "int".to_owned());
        let pk = cell.clone().coerce(&sql_type)?;
        if pk.is_null() {
            return Err(Error::hydration(format!("row carries a null `{key}`")));
        }
        Ok(pk)
    }

    /// Picks the relation hydrator by kind, fetch outcome (were the target's
    /// cells joined into this row?) and row data.
    fn relation_state(
        &self,
        desc: &EntityDescriptor,
        row: &Row,
        alias: &str,
        field: &str,
        relation: &crate::metadata::RelationDescriptor,
        local_pk: &Value,
    ) -> Result<Relation> {
        let rel_alias = format!("{alias}__{field}");
        let prefix = format!("{rel_alias}_");
        let joined = row.keys().any(|k| k.starts_with(&prefix));
        let target = self.registry.get(&relation.target_type)?;

        if joined {
            if cells_all_null(row, &prefix) {
                return Ok(if relation.is_many() {
                    Relation::Many(vec![])
                } else {
                    Relation::Null
                });
            }
            let child = self.hydrate_aliased(&target, row, &rel_alias)?;
            return Ok(if relation.is_many() {
                Relation::Many(vec![child])
            } else {
                Relation::One(child)
            });
        }

        let state = match relation.kind {
            RelationKind::OneToOne | RelationKind::ManyToOne => {
                match &relation.join_column {
                    Some(jc) => {
                        // Owning side: the FK cell seeds the loader.
                        match row.get(&format!("{alias}_{}", jc.name)) {
                            None => Relation::Unset,
                            Some(cell) if cell.is_null() => Relation::Null,
                            Some(cell) => Relation::Unloaded(Loader {
                                target_type: relation.target_type.clone(),
                                key: LoaderKey::Pk(cell.clone()),
                            }),
                        }
                    }
                    None => {
                        let column = self.owning_fk_column(desc, field, relation, &target)?;
                        Relation::Unloaded(Loader {
                            target_type: relation.target_type.clone(),
                            key: LoaderKey::Field {
                                column,
                                value: local_pk.clone(),
                            },
                        })
                    }
                }
            }
            RelationKind::OneToMany => {
                let column = self.owning_fk_column(desc, field, relation, &target)?;
                Relation::Unloaded(Loader {
                    target_type: relation.target_type.clone(),
                    key: LoaderKey::Field {
                        column,
                        value: local_pk.clone(),
                    },
                })
            }
            RelationKind::ManyToMany => {
                let jt = relation.join_table.as_ref().ok_or_else(|| {
                    Error::invalid(format!(
                        "relation `{}.{field}` declares no join table",
                        desc.type_id
                    ))
                })?;
                Relation::Unloaded(Loader {
                    target_type: relation.target_type.clone(),
                    key: LoaderKey::JoinTable {
                        table: jt.name.clone(),
                        owner_fk: jt.owner_fk.clone(),
                        inverse_fk: jt.inverse_fk.clone(),
                        owner_pk: local_pk.clone(),
                    },
                })
            }
        };
        Ok(state)
    }

    /// Physical FK column on the target's owning relation (`mapped_by`).
    fn owning_fk_column(
        &self,
        desc: &EntityDescriptor,
        field: &str,
        relation: &crate::metadata::RelationDescriptor,
        target: &EntityDescriptor,
    ) -> Result<String> {
        relation
            .mapped_by
            .as_deref()
            .and_then(|mapped_by| target.get_relation(mapped_by))
            .and_then(|owning| owning.join_column.as_ref())
            .map(|jc| jc.name.clone())
            .ok_or_else(|| {
                Error::invalid(format!(
                    "relation `{}.{field}` maps by a non-owning relation",
                    desc.type_id
                ))
            })
    }

    fn hydrate_relations_aliased(
        &self,
        record: &Record,
        desc: &EntityDescriptor,
        row: &Row,
        alias: &str,
    ) -> Result<()> {
        for (field, relation) in &desc.relations {
            if !relation.is_many() {
                continue;
            }
            let rel_alias = format!("{alias}__{field}");
            let prefix = format!("{rel_alias}_");
            if !row.keys().any(|k| k.starts_with(&prefix)) {
                continue;
            }
            if cells_all_null(row, &prefix) {
                continue;
            }
            let target = self.registry.get(&relation.target_type)?;
            let child = self.hydrate_aliased(&target, row, &rel_alias)?;
            let child_pk = self.registry.pk_value(&target, &child);

            let mut children = match record.relation(field) {
                Relation::Many(existing) => existing,
                _ => vec![],
            };
            let already_there = children
                .iter()
                .any(|c| self.registry.pk_value(&target, c) == child_pk);
            if !already_there {
                children.push(child);
            }
            record.set_relation(field.clone(), Relation::Many(children));
        }
        Ok(())
    }
}

/// A row is "empty" for a relation iff every one of its aliased cells is null.
fn cells_all_null(row: &Row, prefix: &str) -> bool {
    row.iter()
        .filter(|(k, _)| k.starts_with(prefix))
        .all(|(_, v)| v.is_null())
}
