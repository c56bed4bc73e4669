//! Schema migration.
//!
//! When a store's stamped schema version is older than the configured one,
//! the configured [`Migration`] runs inside a write transaction before the
//! schema is validated. It reshapes tables through a [`MigrationContext`];
//! afterwards the new version is stamped in the same transaction, so a
//! failing migration leaves the store untouched.
//!
//! ```rust,ignore
//! let config = StoreConfiguration::builder()
//!     .directory(dir)
//!     .schema_version(2)
//!     .mediator(mediator)
//!     .migration_fn(|ctx, old, _new| {
//!         if old < 2 {
//!             ctx.add_property("Person", &Property { /* ... */ })?;
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//! ```

use crate::engine::{Cell, ColumnSpec, Session};
use crate::error::{CoreError, CoreResult};
use crate::schema::{table_name_for, Property, SchemaMediator};
use crate::types::RowId;
use crate::value::Value;

/// Moves a store from one schema version to another.
pub trait Migration: Send + Sync {
    /// Migrates from `old_version` to `new_version`.
    ///
    /// # Errors
    ///
    /// Any error aborts the migration and rolls back its changes.
    fn migrate(
        &self,
        ctx: &mut MigrationContext<'_>,
        old_version: u64,
        new_version: u64,
    ) -> CoreResult<()>;
}

/// A [`Migration`] backed by a closure.
pub struct FnMigration<F>(F);

impl<F> FnMigration<F>
where
    F: Fn(&mut MigrationContext<'_>, u64, u64) -> CoreResult<()> + Send + Sync,
{
    /// Wraps `migrate`.
    pub fn new(migrate: F) -> Self {
        Self(migrate)
    }
}

impl<F> Migration for FnMigration<F>
where
    F: Fn(&mut MigrationContext<'_>, u64, u64) -> CoreResult<()> + Send + Sync,
{
    fn migrate(
        &self,
        ctx: &mut MigrationContext<'_>,
        old_version: u64,
        new_version: u64,
    ) -> CoreResult<()> {
        (self.0)(ctx, old_version, new_version)
    }
}

/// Operations available to a migration.
///
/// Tables are addressed by class name; the context maps them to table
/// names the same way the schema mediator does.
pub struct MigrationContext<'a> {
    session: &'a mut Session,
    mediator: &'a dyn SchemaMediator,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(session: &'a mut Session, mediator: &'a dyn SchemaMediator) -> Self {
        Self { session, mediator }
    }

    /// Returns true if the store has a table for `class_name`.
    #[must_use]
    pub fn has_class(&self, class_name: &str) -> bool {
        self.session.state().table(&table_name_for(class_name)).is_some()
    }

    /// Creates the table for `class_name` from its current schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the class is unknown or already exists.
    pub fn create_class(&mut self, class_name: &str) -> CoreResult<()> {
        let spec = self.mediator.require_schema(class_name)?.table_spec();
        self.session.create_table(spec)
    }

    /// Drops the table of `class_name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing or still linked
    /// from another table.
    pub fn remove_class(&mut self, class_name: &str) -> CoreResult<()> {
        self.session.drop_table(&table_name_for(class_name))
    }

    /// Adds a property column to `class_name`. Existing rows receive the
    /// type's default.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing or the column
    /// exists.
    pub fn add_property(&mut self, class_name: &str, property: &Property) -> CoreResult<()> {
        self.session
            .add_column(&table_name_for(class_name), property.column_spec())
    }

    /// Adds a raw column to `class_name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing or the column
    /// exists.
    pub fn add_column(&mut self, class_name: &str, column: ColumnSpec) -> CoreResult<()> {
        self.session.add_column(&table_name_for(class_name), column)
    }

    /// Removes a property column from `class_name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a missing or primary key column.
    pub fn remove_property(&mut self, class_name: &str, property: &str) -> CoreResult<()> {
        self.session
            .remove_column(&table_name_for(class_name), property)
    }

    /// IDs of every row of `class_name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table is missing.
    pub fn rows(&self, class_name: &str) -> CoreResult<Vec<RowId>> {
        Ok(self
            .session
            .state()
            .require_table(&table_name_for(class_name))?
            .row_ids()
            .collect())
    }

    fn column(&self, class_name: &str, property: &str) -> CoreResult<(String, usize)> {
        let table = table_name_for(class_name);
        let index = self
            .session
            .state()
            .require_table(&table)?
            .column_index(property)
            .ok_or_else(|| {
                CoreError::invalid_argument(format!("{class_name} has no field '{property}'"))
            })?;
        Ok((table, index))
    }

    /// Reads a scalar field.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a missing row or field, or a reference
    /// field.
    pub fn get(&self, class_name: &str, row: RowId, property: &str) -> CoreResult<Value> {
        let (table, column) = self.column(class_name, property)?;
        match self.session.get_cell(&table, row, column)? {
            Cell::Value(v) => Ok(v.clone()),
            _ => Err(CoreError::invalid_argument(format!(
                "{class_name}.{property} is a reference field"
            ))),
        }
    }

    /// Writes a scalar field.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a missing row or field, or a value of
    /// the wrong type.
    pub fn set(
        &mut self,
        class_name: &str,
        row: RowId,
        property: &str,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let (table, column) = self.column(class_name, property)?;
        self.session
            .set_cell(&table, row, column, Cell::Value(value.into()))
    }

    /// Deletes a row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the row is missing.
    pub fn delete(&mut self, class_name: &str, row: RowId) -> CoreResult<()> {
        self.session.delete_row(&table_name_for(class_name), row)
    }
}

/// Runs `migration` on `session`, which must be inside a write transaction,
/// and stamps `new_version`.
pub(crate) fn run(
    migration: &dyn Migration,
    session: &mut Session,
    mediator: &dyn SchemaMediator,
    old_version: u64,
    new_version: u64,
) -> CoreResult<()> {
    let mut ctx = MigrationContext::new(session, mediator);
    migration
        .migrate(&mut ctx, old_version, new_version)
        .map_err(|e| match e {
            CoreError::MigrationFailed { .. } => e,
            other => CoreError::migration_failed(format!(
                "{old_version} -> {new_version}: {other}"
            )),
        })?;
    session.set_schema_version(new_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfiguration;
    use crate::schema::{ObjectSchema, PropertyType, StaticSchemaMediator};
    use tetherdb_storage::InMemoryBackend;

    fn mediator() -> StaticSchemaMediator {
        StaticSchemaMediator::new(vec![ObjectSchema::builder("Person")
            .property("id", PropertyType::Integer)
            .property("name", PropertyType::Text)
            .primary_key("id")
            .build()
            .unwrap()])
        .unwrap()
    }

    fn session(name: &str) -> Session {
        let cfg = StoreConfiguration::builder()
            .in_memory_backend(name, InMemoryBackend::new())
            .mediator(mediator())
            .build()
            .unwrap();
        let mut session = Session::open(&cfg).unwrap();
        session.begin_write().unwrap();
        session
    }

    #[test]
    fn closures_migrate() {
        let mut session = session("migration-closure");
        let mediator = mediator();
        let migration = FnMigration::new(|ctx, old, new| {
            assert_eq!((old, new), (0, 1));
            ctx.create_class("Person")?;
            ctx.add_property(
                "Person",
                &Property {
                    name: "age".into(),
                    kind: PropertyType::Integer,
                    nullable: false,
                },
            )
        });
        run(&migration, &mut session, &mediator, 0, 1).unwrap();
        assert_eq!(session.schema_version(), Some(1));
        let table = session.state().table("class_Person").unwrap();
        assert_eq!(table.column_index("age"), Some(2));
    }

    #[test]
    fn context_reads_and_writes_fields() {
        let mut session = session("migration-fields");
        let mediator = mediator();
        let mut ctx = MigrationContext::new(&mut session, &mediator);
        ctx.create_class("Person").unwrap();
        assert!(ctx.has_class("Person"));
        drop(ctx);
        let row = session
            .add_empty_row_with_key("class_Person", crate::PrimaryKey::Integer(3))
            .unwrap();

        let mut ctx = MigrationContext::new(&mut session, &mediator);
        ctx.set("Person", row, "name", "Ada").unwrap();
        assert_eq!(ctx.get("Person", row, "name").unwrap(), Value::from("Ada"));
        assert_eq!(ctx.rows("Person").unwrap(), vec![row]);
        assert!(ctx.get("Person", row, "missing").is_err());
        ctx.delete("Person", row).unwrap();
        assert!(ctx.rows("Person").unwrap().is_empty());
    }

    #[test]
    fn failures_are_wrapped() {
        let mut session = session("migration-failure");
        let mediator = mediator();
        let migration = FnMigration::new(|_, _, _| Err(CoreError::invalid_argument("boom")));
        let err = run(&migration, &mut session, &mediator, 1, 2).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Migration);
        assert!(err.to_string().contains("boom"));
        assert_eq!(session.schema_version(), None);
    }
}
