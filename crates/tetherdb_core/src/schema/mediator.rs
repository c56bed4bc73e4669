//! The schema mediator capability and its static implementation.

use super::{ColumnInfo, ObjectSchema, PropertyType};
use crate::engine::{Cell, Session, StoreState};
use crate::error::{CoreError, CoreResult};
use crate::object::{Field, ObjectData};
use crate::types::RowId;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Maps model classes onto tables.
///
/// Implementors supply the set of [`ObjectSchema`]s; the provided methods
/// derive tables from them, validate existing tables, and copy scalar
/// fields between detached objects and rows.
pub trait SchemaMediator: Send + Sync {
    /// Names of every model class, in a stable order.
    fn model_classes(&self) -> Vec<String>;

    /// Schema of `class_name`.
    fn object_schema(&self, class_name: &str) -> Option<&ObjectSchema>;

    /// Returns the schema of `class_name` or `InvalidArgument`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the class is not registered.
    fn require_schema(&self, class_name: &str) -> CoreResult<&ObjectSchema> {
        self.object_schema(class_name).ok_or_else(|| {
            CoreError::invalid_argument(format!("{class_name} is not part of the schema"))
        })
    }

    /// Name of the table backing `class_name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the class is not registered.
    fn table_name_for(&self, class_name: &str) -> CoreResult<String> {
        Ok(self.require_schema(class_name)?.table_name())
    }

    /// Validates the table of `class_name`, creating it when it is missing.
    ///
    /// Creating a table requires `session` to be in a write transaction.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if the table exists with different columns,
    /// and `InvalidState` if it is missing outside a write transaction.
    fn validate_or_create_schema(
        &self,
        class_name: &str,
        session: &mut Session,
    ) -> CoreResult<ColumnInfo> {
        let schema = self.require_schema(class_name)?;
        let expected = schema.table_spec();

        if session.state().table(&expected.name).is_none() {
            if !session.is_in_write() {
                return Err(CoreError::invalid_state(format!(
                    "table for {class_name} is missing and no write transaction is active"
                )));
            }
            session.create_table(expected.clone())?;
        }

        let location = session.location_name();
        let table = session.state().require_table(&expected.name)?;
        let actual = table.spec();
        let mismatch = |message: String| CoreError::schema_mismatch(location.clone(), message);

        if actual.columns.len() != expected.columns.len() {
            return Err(mismatch(format!(
                "{class_name}: store has {} fields, schema declares {}",
                actual.columns.len(),
                expected.columns.len()
            )));
        }
        let mut indices = BTreeMap::new();
        for column in &expected.columns {
            let index = table.column_index(&column.name).ok_or_else(|| {
                mismatch(format!("{class_name}: field '{}' is missing", column.name))
            })?;
            let found = &actual.columns[index];
            if found.column_type != column.column_type {
                return Err(mismatch(format!(
                    "{class_name}.{}: stored as {:?}, declared as {:?}",
                    column.name, found.column_type, column.column_type
                )));
            }
            if found.nullable != column.nullable {
                return Err(mismatch(format!(
                    "{class_name}.{}: nullability differs",
                    column.name
                )));
            }
            indices.insert(column.name.clone(), index);
        }
        if actual.primary_key != expected.primary_key {
            return Err(mismatch(format!(
                "{class_name}: primary key is {:?} in the store, {:?} in the schema",
                actual.primary_key, expected.primary_key
            )));
        }

        let primary_key = schema.primary_key().and_then(|pk| indices.get(pk).copied());
        Ok(ColumnInfo::new(
            class_name.to_string(),
            expected.name,
            indices,
            primary_key,
        ))
    }

    /// Copies the scalar fields of `source` into `row`.
    ///
    /// A field that is absent or holds a reference receives the type's
    /// default, or `Null` when the property is nullable. The primary key is
    /// skipped; it is set when the row is created.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a value does not match its property.
    fn copy_fields(
        &self,
        info: &ColumnInfo,
        source: &ObjectData,
        session: &mut Session,
        row: RowId,
    ) -> CoreResult<()> {
        let schema = self.require_schema(info.class_name())?;
        for property in schema.properties() {
            if property.kind.is_reference() || schema.primary_key() == Some(property.name.as_str())
            {
                continue;
            }
            let value = match source.field(&property.name) {
                Some(Field::Value(v)) => v.clone(),
                _ => default_value(&property.kind, property.nullable),
            };
            let column = info.require(&property.name)?;
            session.set_cell(info.table_name(), row, column, Cell::Value(value))?;
        }
        Ok(())
    }

    /// Copies the scalar fields of `row` into `target`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the row does not exist.
    fn extract_fields(
        &self,
        info: &ColumnInfo,
        state: &StoreState,
        row: RowId,
        target: &mut ObjectData,
    ) -> CoreResult<()> {
        let schema = self.require_schema(info.class_name())?;
        for property in schema.properties() {
            if property.kind.is_reference() {
                continue;
            }
            let column = info.require(&property.name)?;
            if let Cell::Value(v) = state.cell(info.table_name(), row, column)? {
                target.set_field(&property.name, Field::Value(v.clone()));
            }
        }
        Ok(())
    }
}

/// Default a missing scalar receives.
#[must_use]
pub(crate) fn default_value(kind: &PropertyType, nullable: bool) -> Value {
    if nullable {
        return Value::Null;
    }
    match kind {
        PropertyType::Bool => Value::Bool(false),
        PropertyType::Integer => Value::Integer(0),
        PropertyType::Double => Value::Double(0.0),
        PropertyType::Text => Value::Text(String::new()),
        PropertyType::Bytes => Value::Bytes(Vec::new()),
        PropertyType::Object(_) | PropertyType::List(_) => Value::Null,
    }
}

/// A schema mediator over an explicit, statically registered set of
/// schemas.
#[derive(Clone)]
pub struct StaticSchemaMediator {
    schemas: BTreeMap<String, ObjectSchema>,
}

impl StaticSchemaMediator {
    /// Registers `schemas`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for duplicate class names or references to
    /// classes that are not registered.
    pub fn new(schemas: Vec<ObjectSchema>) -> CoreResult<Self> {
        let mut map = BTreeMap::new();
        for schema in schemas {
            let name = schema.class_name().to_string();
            if map.insert(name.clone(), schema).is_some() {
                return Err(CoreError::invalid_argument(format!(
                    "class {name} is registered twice"
                )));
            }
        }
        for schema in map.values() {
            for property in schema.properties() {
                if let Some(target) = property.kind.target_class() {
                    if !map.contains_key(target) {
                        return Err(CoreError::invalid_argument(format!(
                            "{}.{} references unregistered class {target}",
                            schema.class_name(),
                            property.name
                        )));
                    }
                }
            }
        }
        Ok(Self { schemas: map })
    }
}

impl SchemaMediator for StaticSchemaMediator {
    fn model_classes(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    fn object_schema(&self, class_name: &str) -> Option<&ObjectSchema> {
        self.schemas.get(class_name)
    }
}

impl fmt::Debug for StaticSchemaMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSchemaMediator")
            .field("classes", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}
