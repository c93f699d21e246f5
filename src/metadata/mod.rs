//! Entity descriptors: the parsed, immutable view of one record type.
//!
//! A descriptor is declared with the builder API (the Rust stand-in for
//! attribute annotations), registered into the [`registry::MetadataRegistry`]
//! and finalised there: the registry validates the declaration, materialises
//! synthetic foreign-key columns and memoises the result.

use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod registry;

pub use registry::{DescriptorCache, EntityDefinition, MetadataRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fetch {
    Lazy,
    Eager,
}

/// Which operations propagate across a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cascade {
    pub persist: bool,
    pub remove: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        persist: false,
        remove: false,
    };
    pub const PERSIST: Cascade = Cascade {
        persist: true,
        remove: false,
    };
    pub const REMOVE: Cascade = Cascade {
        persist: false,
        remove: true,
    };
    pub const ALL: Cascade = Cascade {
        persist: true,
        remove: true,
    };
}

/// Foreign-key column on the owning side of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumn {
    pub name: String,
    pub referenced_column: String,
    pub nullable: bool,
}

impl JoinColumn {
    pub fn new(name: impl Into<String>, referenced_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced_column: referenced_column.into(),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Link table carrying a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    pub name: String,
    pub owner_fk: String,
    pub inverse_fk: String,
}

impl JoinTable {
    pub fn new(
        name: impl Into<String>,
        owner_fk: impl Into<String>,
        inverse_fk: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner_fk: owner_fk.into(),
            inverse_fk: inverse_fk.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub kind: RelationKind,
    pub target_type: String,
    pub fetch: Fetch,
    pub cascade: Cascade,
    /// Inverse side: the owning relation field on the target type.
    pub mapped_by: Option<String>,
    pub join_column: Option<JoinColumn>,
    pub join_table: Option<JoinTable>,
}

impl RelationDescriptor {
    /// The owning side carries the foreign-key column.
    pub fn is_owning(&self) -> bool {
        self.join_column.is_some()
    }

    pub fn is_many(&self) -> bool {
        matches!(self.kind, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Physical column name.
    pub name: String,
    pub sql_type: String,
    pub length: Option<u32>,
    pub nullable: bool,
    pub default: Option<Value>,
    pub primary_key: bool,
    /// Value assigned by the database on insert.
    pub generated: bool,
    /// Set when this column is the foreign key of the named relation field.
    pub fk_relation: Option<String>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            length: None,
            nullable: true,
            default: None,
            primary_key: false,
            generated: false,
            fk_relation: None,
        }
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// Descriptor of one record type. Immutable once produced by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub type_id: String,
    pub table: String,
    /// Short prefix namespacing this entity's columns in result rows.
    pub alias: String,
    /// Logical field name to column, in declaration order.
    pub columns: IndexMap<String, ColumnDescriptor>,
    pub relations: IndexMap<String, RelationDescriptor>,
}

impl EntityDescriptor {
    /// Starts a declaration. The alias defaults to the lowercased type name.
    pub fn declare(type_id: impl Into<String>, table: impl Into<String>) -> EntityDescriptor {
        let type_id = type_id.into();
        let alias = type_id.to_lowercase();
        EntityDescriptor {
            type_id,
            table: table.into(),
            alias,
            columns: IndexMap::new(),
            relations: IndexMap::new(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn column(mut self, field: impl Into<String>, column: ColumnDescriptor) -> Self {
        self.columns.insert(field.into(), column);
        self
    }

    fn relation(mut self, field: impl Into<String>, relation: RelationDescriptor) -> Self {
        self.relations.insert(field.into(), relation);
        self
    }

    pub fn one_to_one(
        self,
        field: impl Into<String>,
        target_type: impl Into<String>,
        join_column: JoinColumn,
        fetch: Fetch,
        cascade: Cascade,
    ) -> Self {
        self.relation(
            field,
            RelationDescriptor {
                kind: RelationKind::OneToOne,
                target_type: target_type.into(),
                fetch,
                cascade,
                mapped_by: None,
                join_column: Some(join_column),
                join_table: None,
            },
        )
    }

    pub fn one_to_one_mapped(
        self,
        field: impl Into<String>,
        target_type: impl Into<String>,
        mapped_by: impl Into<String>,
        fetch: Fetch,
        cascade: Cascade,
    ) -> Self {
        self.relation(
            field,
            RelationDescriptor {
                kind: RelationKind::OneToOne,
                target_type: target_type.into(),
                fetch,
                cascade,
                mapped_by: Some(mapped_by.into()),
                join_column: None,
                join_table: None,
            },
        )
    }

    pub fn many_to_one(
        self,
        field: impl Into<String>,
        target_type: impl Into<String>,
        join_column: JoinColumn,
        fetch: Fetch,
        cascade: Cascade,
    ) -> Self {
        self.relation(
            field,
            RelationDescriptor {
                kind: RelationKind::ManyToOne,
                target_type: target_type.into(),
                fetch,
                cascade,
                mapped_by: None,
                join_column: Some(join_column),
                join_table: None,
            },
        )
    }

    pub fn one_to_many(
        self,
        field: impl Into<String>,
        target_type: impl Into<String>,
        mapped_by: impl Into<String>,
        fetch: Fetch,
        cascade: Cascade,
    ) -> Self {
        self.relation(
            field,
            RelationDescriptor {
                kind: RelationKind::OneToMany,
                target_type: target_type.into(),
                fetch,
                cascade,
                mapped_by: Some(mapped_by.into()),
                join_column: None,
                join_table: None,
            },
        )
    }

    pub fn many_to_many(
        self,
        field: impl Into<String>,
        target_type: impl Into<String>,
        join_table: JoinTable,
        fetch: Fetch,
        cascade: Cascade,
    ) -> Self {
        self.relation(
            field,
            RelationDescriptor {
                kind: RelationKind::ManyToMany,
                target_type: target_type.into(),
                fetch,
                cascade,
                mapped_by: None,
                join_column: None,
                join_table: Some(join_table),
            },
        )
    }

    /// Logical name and descriptor of the primary key column.
    pub fn primary_key(&self) -> Option<(&str, &ColumnDescriptor)> {
        self.columns
            .iter()
            .find(|(_, c)| c.primary_key)
            .map(|(name, c)| (name.as_str(), c))
    }

    pub fn primary_key_field(&self) -> &str {
        self.primary_key().map(|(name, _)| name).unwrap_or("id")
    }

    /// Physical name of the primary key column.
    pub fn primary_key_column(&self) -> &str {
        self.primary_key()
            .map(|(_, c)| c.name.as_str())
            .unwrap_or("id")
    }

    pub fn primary_key_generated(&self) -> bool {
        self.primary_key().map(|(_, c)| c.generated).unwrap_or(false)
    }

    pub fn get_column(&self, field: &str) -> Option<&ColumnDescriptor> {
        self.columns.get(field)
    }

    pub fn get_relation(&self, field: &str) -> Option<&RelationDescriptor> {
        self.relations.get(field)
    }

    /// Maps a logical field name to the physical column, falling back to the
    /// name itself for names that are already physical.
    pub fn column_name<'a>(&'a self, field: &'a str) -> &'a str {
        self.columns
            .get(field)
            .map(|c| c.name.as_str())
            .unwrap_or(field)
    }

    /// The alias a joined relation's columns carry in result rows.
    pub fn relation_alias(&self, field: &str) -> String {
        format!("{}__{}", self.alias, field)
    }

    /// The aliased result-row key of one of this entity's columns.
    pub fn aliased(&self, column: &str) -> String {
        format!("{}_{}", self.alias, column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_builds_ordered_columns() {
        let desc = EntityDescriptor::declare("User", "users")
            .alias("user")
            .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
            .column("username", ColumnDescriptor::new("username", "varchar").length(255))
            .column("email", ColumnDescriptor::new("email", "varchar"));
        assert_eq!(
            desc.columns.keys().collect::<Vec<_>>(),
            vec!["id", "username", "email"]
        );
        assert_eq!(desc.primary_key_field(), "id");
        assert!(desc.primary_key_generated());
        assert_eq!(desc.aliased("email"), "user_email");
        assert_eq!(desc.relation_alias("profile"), "user__profile");
    }

    #[test]
    fn owning_side_is_the_join_column_side() {
        let desc = EntityDescriptor::declare("User", "users")
            .column("id", ColumnDescriptor::new("id", "int").primary_key())
            .one_to_one(
                "profile",
                "Profile",
                JoinColumn::new("profile_id", "id"),
                Fetch::Eager,
                Cascade::ALL,
            )
            .one_to_many("posts", "Post", "author", Fetch::Lazy, Cascade::NONE);
        assert!(desc.get_relation("profile").unwrap().is_owning());
        assert!(!desc.get_relation("posts").unwrap().is_owning());
        assert!(desc.get_relation("posts").unwrap().is_many());
    }
}
