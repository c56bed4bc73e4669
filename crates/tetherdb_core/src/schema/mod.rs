//! Object schemas and the schema mediator.
//!
//! An [`ObjectSchema`] describes one model class: its properties, their
//! types and an optional primary key. A [`SchemaMediator`] turns a set of
//! object schemas into tables and moves scalar fields between detached
//! objects and table rows. Reference fields (links and lists) are handled by
//! the materializer, not the mediator.

mod mediator;

pub use mediator::{SchemaMediator, StaticSchemaMediator};

pub(crate) use mediator::default_value;

use crate::engine::{ColumnSpec, ColumnType, TableSpec};
use crate::error::{CoreError, CoreResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Prefix of every table that backs a model class.
pub const TABLE_PREFIX: &str = "class_";

/// Returns the table name backing `class_name`.
#[must_use]
pub fn table_name_for(class_name: &str) -> String {
    format!("{TABLE_PREFIX}{class_name}")
}

/// Type of a property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyType {
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Integer,
    /// Double precision float.
    Double,
    /// UTF-8 string.
    Text,
    /// Byte string.
    Bytes,
    /// Single reference to an object of the named class.
    Object(String),
    /// Ordered list of references to objects of the named class.
    List(String),
}

impl PropertyType {
    /// Returns true for reference-typed properties.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Object(_) | Self::List(_))
    }

    /// Returns the class a reference property points at.
    #[must_use]
    pub fn target_class(&self) -> Option<&str> {
        match self {
            Self::Object(class) | Self::List(class) => Some(class),
            _ => None,
        }
    }

    /// Returns the column type used to store this property.
    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Bool => ColumnType::Bool,
            Self::Integer => ColumnType::Integer,
            Self::Double => ColumnType::Double,
            Self::Text => ColumnType::Text,
            Self::Bytes => ColumnType::Bytes,
            Self::Object(class) => ColumnType::Link(table_name_for(class)),
            Self::List(class) => ColumnType::LinkList(table_name_for(class)),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Integer => f.write_str("integer"),
            Self::Double => f.write_str("double"),
            Self::Text => f.write_str("text"),
            Self::Bytes => f.write_str("bytes"),
            Self::Object(class) => write!(f, "object<{class}>"),
            Self::List(class) => write!(f, "list<{class}>"),
        }
    }
}

/// A single property of an object schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Property {
    /// Property name, also used as the column name.
    pub name: String,
    /// Property type.
    pub kind: PropertyType,
    /// Whether the property may hold `Null`.
    pub nullable: bool,
}

impl Property {
    /// Column definition for this property.
    #[must_use]
    pub fn column_spec(&self) -> ColumnSpec {
        ColumnSpec {
            name: self.name.clone(),
            column_type: self.kind.column_type(),
            nullable: self.nullable,
        }
    }
}

/// Schema of one model class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectSchema {
    class_name: String,
    properties: Vec<Property>,
    primary_key: Option<String>,
}

impl ObjectSchema {
    /// Starts building the schema of `class_name`.
    #[must_use]
    pub fn builder(class_name: impl Into<String>) -> ObjectSchemaBuilder {
        ObjectSchemaBuilder {
            class_name: class_name.into(),
            properties: Vec::new(),
            primary_key: None,
        }
    }

    /// Class name.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Name of the backing table.
    #[must_use]
    pub fn table_name(&self) -> String {
        table_name_for(&self.class_name)
    }

    /// All properties, in declaration order.
    #[must_use]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Name of the primary key property, if declared.
    #[must_use]
    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    /// The primary key property, if declared.
    #[must_use]
    pub fn primary_key_property(&self) -> Option<&Property> {
        self.primary_key.as_deref().and_then(|pk| self.property(pk))
    }

    /// Table definition derived from this schema.
    #[must_use]
    pub fn table_spec(&self) -> TableSpec {
        TableSpec {
            name: self.table_name(),
            columns: self.properties.iter().map(Property::column_spec).collect(),
            primary_key: self.primary_key.clone(),
        }
    }
}

/// Builder for [`ObjectSchema`].
#[derive(Debug)]
#[must_use]
pub struct ObjectSchemaBuilder {
    class_name: String,
    properties: Vec<Property>,
    primary_key: Option<String>,
}

impl ObjectSchemaBuilder {
    /// Adds a required property.
    pub fn property(mut self, name: impl Into<String>, kind: PropertyType) -> Self {
        // Reference properties are always nullable: a link may be unset.
        let nullable = matches!(kind, PropertyType::Object(_));
        self.properties.push(Property {
            name: name.into(),
            kind,
            nullable,
        });
        self
    }

    /// Adds a nullable scalar property.
    pub fn nullable_property(mut self, name: impl Into<String>, kind: PropertyType) -> Self {
        self.properties.push(Property {
            name: name.into(),
            nullable: !matches!(kind, PropertyType::List(_)),
            kind,
        });
        self
    }

    /// Declares `name` as the primary key.
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }

    /// Validates and builds the schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty class name, duplicate property
    /// names, or a primary key that is missing, nullable, or not an integer
    /// or text property.
    pub fn build(self) -> CoreResult<ObjectSchema> {
        if self.class_name.is_empty() {
            return Err(CoreError::invalid_argument("class name must not be empty"));
        }
        let mut seen = HashMap::new();
        for property in &self.properties {
            if property.name.is_empty() {
                return Err(CoreError::invalid_argument(format!(
                    "{}: property name must not be empty",
                    self.class_name
                )));
            }
            if seen.insert(property.name.as_str(), ()).is_some() {
                return Err(CoreError::invalid_argument(format!(
                    "{}: duplicate property '{}'",
                    self.class_name, property.name
                )));
            }
        }
        if let Some(pk) = &self.primary_key {
            let property = self
                .properties
                .iter()
                .find(|p| &p.name == pk)
                .ok_or_else(|| {
                    CoreError::invalid_argument(format!(
                        "{}: primary key '{pk}' is not a property",
                        self.class_name
                    ))
                })?;
            if !matches!(property.kind, PropertyType::Integer | PropertyType::Text) {
                return Err(CoreError::invalid_argument(format!(
                    "{}: primary key '{pk}' must be an integer or text property, not {}",
                    self.class_name, property.kind
                )));
            }
            if property.nullable {
                return Err(CoreError::invalid_argument(format!(
                    "{}: primary key '{pk}' must not be nullable",
                    self.class_name
                )));
            }
        }
        Ok(ObjectSchema {
            class_name: self.class_name,
            properties: self.properties,
            primary_key: self.primary_key,
        })
    }
}

/// Column positions of one class in its table, as validated at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    class_name: String,
    table_name: String,
    indices: BTreeMap<String, usize>,
    primary_key: Option<usize>,
}

impl ColumnInfo {
    pub(crate) fn new(
        class_name: String,
        table_name: String,
        indices: BTreeMap<String, usize>,
        primary_key: Option<usize>,
    ) -> Self {
        Self {
            class_name,
            table_name,
            indices,
            primary_key,
        }
    }

    /// Class name.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Backing table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Column index of `property`.
    #[must_use]
    pub fn index_of(&self, property: &str) -> Option<usize> {
        self.indices.get(property).copied()
    }

    /// Column index of `property`, or `InvalidArgument` if the class has no
    /// such property.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown property.
    pub fn require(&self, property: &str) -> CoreResult<usize> {
        self.index_of(property).ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "{} has no property '{property}'",
                self.class_name
            ))
        })
    }

    /// Column index of the primary key, if declared.
    #[must_use]
    pub fn primary_key_index(&self) -> Option<usize> {
        self.primary_key
    }
}

/// Column information for every class of a configuration.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndices {
    by_class: HashMap<String, ColumnInfo>,
}

impl ColumnIndices {
    pub(crate) fn insert(&mut self, info: ColumnInfo) {
        self.by_class.insert(info.class_name.clone(), info);
    }

    /// Column information of `class_name`.
    #[must_use]
    pub fn get(&self, class_name: &str) -> Option<&ColumnInfo> {
        self.by_class.get(class_name)
    }

    /// Column information of `class_name`, or `InvalidArgument` if the class
    /// is not part of the schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown class.
    pub fn require(&self, class_name: &str) -> CoreResult<&ColumnInfo> {
        self.get(class_name).ok_or_else(|| {
            CoreError::invalid_argument(format!("{class_name} is not part of the schema"))
        })
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_class.len()
    }

    /// Returns true if no classes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_validates_primary_key() {
        let err = ObjectSchema::builder("Person")
            .property("score", PropertyType::Double)
            .primary_key("score")
            .build()
            .unwrap_err();
        assert!(err.is_usage_error());

        let err = ObjectSchema::builder("Person")
            .property("id", PropertyType::Integer)
            .primary_key("missing")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("missing"));

        let err = ObjectSchema::builder("Person")
            .nullable_property("id", PropertyType::Text)
            .primary_key("id")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("nullable"));
    }

    #[test]
    fn builder_rejects_duplicates() {
        let err = ObjectSchema::builder("Dog")
            .property("name", PropertyType::Text)
            .property("name", PropertyType::Integer)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn table_spec_maps_references() {
        let schema = ObjectSchema::builder("Person")
            .property("id", PropertyType::Integer)
            .property("dog", PropertyType::Object("Dog".into()))
            .property("friends", PropertyType::List("Person".into()))
            .primary_key("id")
            .build()
            .unwrap();

        let spec = schema.table_spec();
        assert_eq!(spec.name, "class_Person");
        assert_eq!(spec.primary_key.as_deref(), Some("id"));
        assert_eq!(spec.columns[1].column_type, ColumnType::Link("class_Dog".into()));
        assert!(spec.columns[1].nullable);
        assert_eq!(
            spec.columns[2].column_type,
            ColumnType::LinkList("class_Person".into())
        );
        assert!(!spec.columns[2].nullable);
    }
}
