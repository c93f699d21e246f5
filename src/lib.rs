//! # datamapper
//!
//! A data-mapper runtime: declarative entity descriptors map record types to
//! relational tables and back.
//!
//! ## Design
//!
//! Descriptors are declared per type and registered into a
//! [`MetadataRegistry`]; the registry is the only consumer of per-type
//! polymorphism. Reads build a structured [`query::QueryPlan`] from the
//! descriptor, render it through the driver's quoting rules, and hydrate the
//! aliased result rows back into identity-mapped [`Record`] graphs, with
//! relations either joined eagerly or left behind lazy loaders. Writes are
//! tracked in a unit of work that propagates cascades and commits deletes,
//! inserts and updates in relational dependency order.
//!
//! ```ignore
//! let registry = Rc::new(MetadataRegistry::new());
//! registry.register(user_descriptor);
//!
//! let driver = Driver::connect("sqlite://app.db?mode=rwc", 1).await?;
//! let manager = EntityManager::new(driver, registry);
//!
//! let user = Record::new("User");
//! user.set("username", "neo").set("email", "neo@matrix.io");
//! manager.persist(&user)?;
//! manager.flush().await?;
//!
//! let found = manager.find_by("User", 1, Options::default()).await?;
//! ```

#[macro_use]
extern crate log;

pub mod driver;
pub mod error;
mod executor;
pub mod expr;
pub mod hydrate;
pub mod identity;
pub mod manager;
pub mod metadata;
pub mod query;
pub mod record;
pub mod unit_of_work;
pub mod value;

pub use driver::{Driver, Kind, Row};
pub use error::{DriverError, Error, Result};
pub use expr::Expression;
pub use manager::EntityManager;
pub use metadata::{
    Cascade, ColumnDescriptor, DescriptorCache, EntityDefinition, EntityDescriptor, Fetch,
    JoinColumn, JoinTable, MetadataRegistry, RelationKind,
};
pub use query::{Criteria, Options};
pub use record::{Loader, LoaderKey, Record, Relation};
pub use value::Value;
