//! Executors: a scheduled record becomes a plan, the plan becomes SQL, the
//! SQL runs, and the record's identity state is brought up to date.

use crate::driver::{Driver, Exec};
use crate::error::{Error, Result};
use crate::identity::IdentityCache;
use crate::metadata::{EntityDescriptor, MetadataRegistry};
use crate::query::build;
use crate::query::plan::QueryPlan;
use crate::query::render::render;
use crate::record::Record;

/// Renders and runs one plan, logging the statement at debug level.
pub(crate) async fn run_plan(driver: &Driver, plan: &QueryPlan) -> Result<Exec> {
    let (sql, params) = render(plan, driver.kind())?;
    let mut statement = driver.prepare(&sql);
    statement.bind_all(params.clone());
    let exec = statement
        .execute()
        .await
        .map_err(|e| Error::db(&sql, e))?;
    debug!("executed `{sql}` with {params:?}");
    Ok(exec)
}

/// INSERT one record. A database-generated primary key is read back and
/// written to the record before it enters the identity cache.
pub(crate) async fn execute_insert(
    driver: &Driver,
    registry: &MetadataRegistry,
    identity: &IdentityCache,
    desc: &EntityDescriptor,
    record: &Record,
) -> Result<()> {
    let plan = build::insert_plan(registry, desc, record);
    let exec = run_plan(driver, &plan).await?;
    if desc.primary_key_generated() && registry.pk_value(desc, record).is_null() {
        match exec.last_insert_id {
            Some(id) => {
                record.set(desc.primary_key_field().to_owned(), id);
            }
            None => warn!(
                "insert into `{}` returned no generated key; the record keeps a null id",
                desc.table
            ),
        }
    }
    record.mark_persisted(registry.extract(desc, record));
    identity.set(&desc.type_id, &registry.pk_value(desc, record), record);
    Ok(())
}

/// UPDATE one record; refreshes the snapshot and the cache entry.
pub(crate) async fn execute_update(
    driver: &Driver,
    registry: &MetadataRegistry,
    identity: &IdentityCache,
    desc: &EntityDescriptor,
    record: &Record,
) -> Result<()> {
    let pk = registry.pk_value(desc, record);
    if pk.is_null() {
        return Err(Error::MissingIdentifier {
            entity: desc.type_id.clone(),
            op: "update",
        });
    }
    let plan = build::update_plan(registry, desc, record);
    run_plan(driver, &plan).await?;
    record.mark_persisted(registry.extract(desc, record));
    identity.set(&desc.type_id, &pk, record);
    Ok(())
}

/// DELETE one record; evicts it from the cache and clears its state.
pub(crate) async fn execute_delete(
    driver: &Driver,
    registry: &MetadataRegistry,
    identity: &IdentityCache,
    desc: &EntityDescriptor,
    record: &Record,
) -> Result<()> {
    let pk = registry.pk_value(desc, record);
    if pk.is_null() {
        return Err(Error::MissingIdentifier {
            entity: desc.type_id.clone(),
            op: "delete",
        });
    }
    let plan = build::delete_plan(registry, desc, record);
    run_plan(driver, &plan).await?;
    identity.clear(&desc.type_id, &pk);
    record.mark_removed();
    Ok(())
}
