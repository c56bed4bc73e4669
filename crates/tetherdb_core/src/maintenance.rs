//! Whole-store maintenance.
//!
//! Every operation here needs the store closed in this process and fails
//! with `InvalidState` while any handle has it open.

use crate::config::{StoreConfiguration, StoreLocation};
use crate::engine::{self, Session};
use crate::error::{CoreError, CoreResult};
use crate::handle;
use serde::Serialize;
use std::io;
use tracing::info;

/// Summary of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    /// Table name.
    pub name: String,
    /// Number of rows.
    pub rows: usize,
    /// Column names in index order.
    pub columns: Vec<String>,
    /// Primary key column, if any.
    pub primary_key: Option<String>,
}

/// Summary of a closed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    /// Display form of the location.
    pub location: String,
    /// Latest committed version.
    pub version: u64,
    /// Stamped schema version.
    pub schema_version: Option<u64>,
    /// Tables, ordered by name.
    pub tables: Vec<TableSummary>,
}

/// Deletes a closed store. Returns true if anything was removed.
///
/// # Errors
///
/// Returns `InvalidState` if the store is open.
pub fn delete_store(config: &StoreConfiguration) -> CoreResult<bool> {
    let removed = engine::delete(config)?;
    if removed {
        info!(location = %config.location(), "store deleted");
    }
    Ok(removed)
}

/// Rewrites a closed store's commit log as one snapshot record. Returns the
/// log size before and after.
///
/// # Errors
///
/// Returns `InvalidState` if the store is open.
pub fn compact_store(config: &StoreConfiguration) -> CoreResult<(u64, u64)> {
    let (before, after) = engine::compact(config)?;
    info!(location = %config.location(), before, after, "store compacted");
    Ok((before, after))
}

/// Runs the configured migration on a closed store without opening a
/// handle. Returns true if a migration ran.
///
/// # Errors
///
/// Returns `InvalidArgument` if the configuration has no migration,
/// `InvalidState` if the store is open, `IoFailure` if a file store does
/// not exist, and `Migration` or `SchemaMismatch` if migrating fails.
pub fn migrate_store(config: &StoreConfiguration) -> CoreResult<bool> {
    if config.migration().is_none() {
        return Err(CoreError::invalid_argument("configuration has no migration"));
    }
    if engine::is_open(config.location()) {
        return Err(CoreError::invalid_state(format!(
            "cannot migrate {} while it is open",
            config.location()
        )));
    }
    if let StoreLocation::File(path) = config.location() {
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )
            .into());
        }
    }
    let mut session = Session::open(config)?;
    let migrated = handle::migrate(&mut session, config);
    session.close();
    migrated
}

/// Describes a closed store.
///
/// # Errors
///
/// Returns `InvalidState` if the store is open.
pub fn inspect_store(config: &StoreConfiguration) -> CoreResult<StoreSummary> {
    let state = engine::read_state(config)?;
    Ok(StoreSummary {
        location: config.location().to_string(),
        version: state.version().as_u64(),
        schema_version: state.schema_version(),
        tables: state
            .tables()
            .map(|table| TableSummary {
                name: table.name().to_string(),
                rows: table.len(),
                columns: table.spec().columns.iter().map(|c| c.name.clone()).collect(),
                primary_key: table.spec().primary_key.clone(),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::schema::{ObjectSchema, Property, PropertyType, StaticSchemaMediator};
    use crate::ErrorKind;
    use tetherdb_storage::InMemoryBackend;

    fn mediator(with_age: bool) -> StaticSchemaMediator {
        let mut person = ObjectSchema::builder("Person")
            .property("id", PropertyType::Integer)
            .property("name", PropertyType::Text);
        if with_age {
            person = person.property("age", PropertyType::Integer);
        }
        StaticSchemaMediator::new(vec![person.primary_key("id").build().unwrap()]).unwrap()
    }

    fn v1(name: &str, buffer: &InMemoryBackend) -> StoreConfiguration {
        StoreConfiguration::builder()
            .in_memory_backend(name, buffer.clone())
            .schema_version(1)
            .mediator(mediator(false))
            .build()
            .unwrap()
    }

    fn v2(name: &str, buffer: &InMemoryBackend) -> StoreConfiguration {
        StoreConfiguration::builder()
            .in_memory_backend(name, buffer.clone())
            .schema_version(2)
            .mediator(mediator(true))
            .migration_fn(|ctx, _, _| {
                ctx.add_property(
                    "Person",
                    &Property {
                        name: "age".into(),
                        kind: PropertyType::Integer,
                        nullable: false,
                    },
                )?;
                for row in ctx.rows("Person")? {
                    ctx.set("Person", row, "age", 42)?;
                }
                Ok(())
            })
            .build()
            .unwrap()
    }

    fn seed(config: &StoreConfiguration) {
        let handle = Handle::open(config).unwrap();
        handle
            .execute_transaction(|h| h.create_object_with_primary_key("Person", 1).map(drop))
            .unwrap();
    }

    #[test]
    fn maintenance_requires_closed_store() {
        let buffer = InMemoryBackend::new();
        let config = v1("maintenance-open", &buffer);
        let handle = Handle::open(&config).unwrap();
        assert_eq!(compact_store(&config).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(delete_store(&config).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(inspect_store(&config).unwrap_err().kind(), ErrorKind::InvalidState);
        handle.close().unwrap();
        assert!(compact_store(&config).is_ok());
    }

    #[test]
    fn migrate_store_runs_the_migration() {
        let buffer = InMemoryBackend::new();
        seed(&v1("maintenance-migrate", &buffer));

        let config = v2("maintenance-migrate", &buffer);
        assert!(migrate_store(&config).unwrap());
        assert!(!migrate_store(&config).unwrap());

        let handle = Handle::open(&config).unwrap();
        let person = handle.find("Person", 1).unwrap().unwrap();
        assert_eq!(person.get("age").unwrap(), crate::Value::Integer(42));
    }

    #[test]
    fn migrate_store_needs_a_migration() {
        let buffer = InMemoryBackend::new();
        let err = migrate_store(&v1("maintenance-no-migration", &buffer)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn opening_migrates_too() {
        let buffer = InMemoryBackend::new();
        seed(&v1("maintenance-open-migrate", &buffer));
        let handle = Handle::open(&v2("maintenance-open-migrate", &buffer)).unwrap();
        assert_eq!(handle.schema_version(), Some(2));
    }

    #[test]
    fn compaction_keeps_contents() {
        let buffer = InMemoryBackend::new();
        let config = v1("maintenance-compact", &buffer);
        seed(&config);
        let before = inspect_store(&config).unwrap();
        let (old_size, new_size) = compact_store(&config).unwrap();
        assert!(new_size <= old_size);
        let after = inspect_store(&config).unwrap();
        assert_eq!(before, after);
        assert_eq!(after.tables[0].rows, 1);
    }

    #[test]
    fn delete_removes_contents() {
        let buffer = InMemoryBackend::new();
        let config = v1("maintenance-delete", &buffer);
        seed(&config);
        assert!(delete_store(&config).unwrap());
        assert!(!delete_store(&config).unwrap());
        let summary = inspect_store(&config).unwrap();
        assert!(summary.tables.is_empty());
        assert_eq!(summary.version, 0);
    }
}
