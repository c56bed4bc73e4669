//! Detached and managed objects.
//!
//! An [`Object`] is an in-memory object graph node with no connection to a
//! store. Objects are shared by reference: cloning an `Object` yields
//! another reference to the same node, so graphs can contain shared
//! sub-objects and cycles. Identity, not field equality, is what the
//! materializer memoizes on.
//!
//! A [`ManagedObject`] is a view of one row through a handle.
//!
//! Cyclic detached graphs keep themselves alive; call
//! [`Object::clear_references`] on a node to break a cycle you no longer
//! need.

mod managed;

pub use managed::{ManagedObject, ObjectKind};

use crate::value::Value;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Contents of a detached object field.
#[derive(Clone)]
pub enum Field {
    /// Scalar value.
    Value(Value),
    /// Single reference.
    Link(Option<Object>),
    /// Ordered references.
    List(Vec<Object>),
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v:?}"),
            Self::Link(None) => f.write_str("Link(None)"),
            Self::Link(Some(o)) => write!(f, "Link({})", o.identity()),
            Self::List(items) => f
                .debug_list()
                .entries(items.iter().map(Object::identity))
                .finish(),
        }
    }
}

/// Fields of a detached object.
#[derive(Debug, Clone)]
pub struct ObjectData {
    class_name: String,
    fields: BTreeMap<String, Field>,
}

impl ObjectData {
    /// Creates empty data of `class_name`.
    #[must_use]
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Class name.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Field named `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Sets a field.
    pub fn set_field(&mut self, name: &str, field: Field) {
        self.fields.insert(name.to_string(), field);
    }

    /// All fields, ordered by name.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> + '_ {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Stable identity of a detached object for the duration of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

/// A detached object.
///
/// # Example
///
/// ```rust
/// use tetherdb_core::{Object, Value};
///
/// let owner = Object::new("Person").with("id", 1).with("name", "Ada");
/// let dog = Object::new("Dog").with("name", "Rex");
/// dog.set_link("owner", Some(&owner));
/// owner.set_link("dog", Some(&dog));
///
/// let back = owner.link("dog").unwrap().link("owner").unwrap();
/// assert!(back.ptr_eq(&owner));
/// assert_eq!(back.get("name"), Some(Value::from("Ada")));
/// ```
#[derive(Clone)]
pub struct Object {
    inner: Arc<RwLock<ObjectData>>,
}

impl Object {
    /// Creates an empty object of `class_name`.
    #[must_use]
    pub fn new(class_name: impl Into<String>) -> Self {
        Self::from_data(ObjectData::new(class_name))
    }

    /// Wraps existing data.
    #[must_use]
    pub fn from_data(data: ObjectData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Sets a scalar field and returns the object.
    #[must_use]
    pub fn with(self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Class name.
    #[must_use]
    pub fn class_name(&self) -> String {
        self.inner.read().class_name.clone()
    }

    /// Identity of this node.
    #[must_use]
    pub fn identity(&self) -> ObjectId {
        ObjectId(Arc::as_ptr(&self.inner) as usize)
    }

    /// Returns true if both references point at the same node.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Scalar field `name`. `None` if unset or a reference field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.inner.read().fields.get(name) {
            Some(Field::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Sets scalar field `name`.
    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.inner.write().set_field(name, Field::Value(value.into()));
    }

    /// Linked object in field `name`.
    #[must_use]
    pub fn link(&self, name: &str) -> Option<Object> {
        match self.inner.read().fields.get(name) {
            Some(Field::Link(link)) => link.clone(),
            _ => None,
        }
    }

    /// Sets link field `name`.
    pub fn set_link(&self, name: &str, target: Option<&Object>) {
        self.inner
            .write()
            .set_field(name, Field::Link(target.cloned()));
    }

    /// Objects in list field `name`.
    #[must_use]
    pub fn list(&self, name: &str) -> Vec<Object> {
        match self.inner.read().fields.get(name) {
            Some(Field::List(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Replaces list field `name`.
    pub fn set_list(&self, name: &str, items: Vec<Object>) {
        self.inner.write().set_field(name, Field::List(items));
    }

    /// Appends to list field `name`, creating it if needed.
    pub fn push(&self, name: &str, item: &Object) {
        let mut data = self.inner.write();
        match data.fields.get_mut(name) {
            Some(Field::List(items)) => items.push(item.clone()),
            _ => data.set_field(name, Field::List(vec![item.clone()])),
        }
    }

    /// Returns true if field `name` has been set.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.inner.read().fields.contains_key(name)
    }

    /// Clears every link and list field.
    pub fn clear_references(&self) {
        self.inner
            .write()
            .fields
            .retain(|_, field| matches!(field, Field::Value(_)));
    }

    /// Copy of the current fields.
    #[must_use]
    pub fn snapshot(&self) -> ObjectData {
        self.inner.read().clone()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ObjectData> {
        self.inner.read()
    }

    pub(crate) fn replace(&self, data: ObjectData) {
        *self.inner.write() = data;
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.read();
        let mut s = f.debug_struct(&data.class_name);
        s.field("id", &self.identity());
        for (name, field) in &data.fields {
            s.field(name, field);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity() {
        let a = Object::new("Person").with("name", "a");
        let b = a.clone();
        b.set("name", "b");
        assert!(a.ptr_eq(&b));
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.get("name"), Some(Value::from("b")));

        let c = Object::new("Person").with("name", "b");
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn lists_and_links() {
        let a = Object::new("Person");
        let b = Object::new("Person");
        a.push("friends", &b);
        a.push("friends", &a);
        assert_eq!(a.list("friends").len(), 2);
        assert!(a.list("friends")[1].ptr_eq(&a));

        a.set_link("best", Some(&b));
        assert!(a.link("best").unwrap().ptr_eq(&b));
        a.clear_references();
        assert!(a.link("best").is_none());
        assert!(a.list("friends").is_empty());
    }

    #[test]
    fn debug_survives_cycles() {
        let a = Object::new("Person").with("id", 1);
        a.set_link("self_ref", Some(&a));
        let text = format!("{a:?}");
        assert!(text.contains("Person"));
        a.clear_references();
    }

    #[test]
    fn reference_fields_are_not_values() {
        let a = Object::new("Person");
        a.set_link("dog", None);
        assert!(a.has_field("dog"));
        assert_eq!(a.get("dog"), None);
    }
}
