//! Copying object graphs into and out of a store.
//!
//! Copy-in walks a detached graph depth-first and creates (or, in update
//! mode, overwrites) one row per distinct detached object. Copy-out walks
//! rows depth-first and produces one detached object per distinct row, up to
//! a depth limit. Both memoize on identity for the duration of one call, so
//! cycles terminate and shared references stay shared.
//!
//! # Example
//!
//! ```rust,ignore
//! let ada = Object::new("Person").with("id", 1).with("name", "Ada");
//! ada.push("friends", &ada);
//!
//! let managed = handle.execute_transaction(|h| h.copy_to_store(&ada))?;
//! let copy = handle.copy_from_store(&managed)?;
//! assert!(copy.list("friends")[0].ptr_eq(&copy));
//! ```

mod identity;

use crate::engine::{Cell, Session, StoreState};
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::object::{Field, ManagedObject, Object, ObjectData, ObjectKind};
use crate::schema::{default_value, ColumnIndices, PropertyType, SchemaMediator};
use crate::types::RowId;
use identity::{CopyInCache, CopyOutCache, Visit};
use std::sync::Arc;

/// Depth used when copying out without a limit.
pub const UNBOUNDED_DEPTH: i32 = i32::MAX;

/// Copy-in and copy-out of object graphs.
pub struct GraphMaterializer;

impl GraphMaterializer {
    /// Copies the graph reachable from each of `sources` into the store.
    ///
    /// One identity cache is shared by the whole batch. With
    /// `update_existing`, objects whose primary key is already stored
    /// overwrite the stored row instead of failing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a transaction,
    /// `PrimaryKeyConstraintViolation` for a taken key without
    /// `update_existing`, and `InvalidArgument` for an unknown class, a
    /// reference to the wrong class, or `update_existing` on a root class
    /// without a primary key.
    pub fn materialize_all(
        handle: &Handle,
        sources: &[Object],
        update_existing: bool,
    ) -> CoreResult<Vec<ManagedObject>> {
        handle.inner.check_open()?;
        if !handle.is_in_transaction() {
            return Err(CoreError::invalid_state(
                "copying objects into the store requires an active transaction",
            ));
        }
        let mut session = handle.inner.session();
        let mut copy = CopyIn {
            session: &mut session,
            columns: handle.inner.columns(),
            mediator: handle.inner.mediator(),
            update_existing,
            cache: CopyInCache::default(),
        };
        let mut rows = Vec::with_capacity(sources.len());
        for source in sources {
            let class_name = source.class_name();
            let row = copy.materialize(source, true)?;
            rows.push((class_name, row));
        }
        tracing::trace!(objects = copy.cache.len(), "copied graph into store");
        drop(session);
        Ok(rows
            .into_iter()
            .map(|(class_name, row)| handle.managed(&class_name, row, ObjectKind::Typed))
            .collect())
    }

    /// Copies the graph reachable from `source` into the store.
    ///
    /// # Errors
    ///
    /// See [`materialize_all`](Self::materialize_all).
    pub fn materialize(handle: &Handle, source: &Object, update_existing: bool) -> CoreResult<ManagedObject> {
        let mut managed = Self::materialize_all(handle, std::slice::from_ref(source), update_existing)?;
        managed
            .pop()
            .ok_or_else(|| CoreError::invalid_state("copy produced no object"))
    }

    /// Copies each of `objects` out of the store, following at most
    /// `max_depth` references from each root. One identity cache is shared
    /// by the whole batch.
    ///
    /// Depth 0 copies scalars only; link fields come back empty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a negative depth, a deleted object, a
    /// dynamic object, or an object of another handle.
    pub fn extract_all(handle: &Handle, objects: &[ManagedObject], max_depth: i32) -> CoreResult<Vec<Object>> {
        if max_depth < 0 {
            return Err(CoreError::invalid_argument(format!(
                "max depth must be non-negative, got {max_depth}"
            )));
        }
        handle.inner.check_open()?;
        for object in objects {
            if object.kind() == ObjectKind::Dynamic {
                return Err(CoreError::invalid_argument(
                    "dynamic objects cannot be copied out of the store",
                ));
            }
            if !Arc::ptr_eq(object.handle(), &handle.inner) {
                return Err(CoreError::invalid_argument(
                    "object belongs to a different handle",
                ));
            }
            if !object.is_valid() {
                return Err(CoreError::invalid_argument(format!(
                    "{} {} has been deleted",
                    object.class_name(),
                    object.row_id()
                )));
            }
        }

        let session = handle.inner.session();
        let mut copy = CopyOut {
            state: session.state(),
            columns: handle.inner.columns(),
            mediator: handle.inner.mediator(),
            cache: CopyOutCache::default(),
        };
        objects
            .iter()
            .map(|object| copy.extract(object.class_name(), object.row_id(), max_depth))
            .collect()
    }

    /// Copies `object` out of the store.
    ///
    /// # Errors
    ///
    /// See [`extract_all`](Self::extract_all).
    pub fn extract(handle: &Handle, object: &ManagedObject, max_depth: i32) -> CoreResult<Object> {
        let mut copies = Self::extract_all(handle, std::slice::from_ref(object), max_depth)?;
        copies
            .pop()
            .ok_or_else(|| CoreError::invalid_state("copy produced no object"))
    }
}

struct CopyIn<'a> {
    session: &'a mut Session,
    columns: &'a ColumnIndices,
    mediator: &'a dyn SchemaMediator,
    update_existing: bool,
    cache: CopyInCache,
}

impl CopyIn<'_> {
    fn materialize(&mut self, source: &Object, root: bool) -> CoreResult<RowId> {
        if let Some(row) = self.cache.get(source) {
            return Ok(row);
        }
        let data = source.snapshot();
        let class_name = data.class_name();
        let (columns, mediator) = (self.columns, self.mediator);
        let schema = mediator.require_schema(class_name)?;
        let info = columns.require(class_name)?;
        let table = info.table_name();

        let row = match schema.primary_key_property() {
            Some(pk) => {
                let key = match data.field(&pk.name) {
                    Some(Field::Value(v)) => v.clone(),
                    _ => default_value(&pk.kind, false),
                }
                .to_primary_key()
                .ok_or_else(|| {
                    CoreError::invalid_argument(format!(
                        "{class_name}.{} must hold an integer or text key",
                        pk.name
                    ))
                })?;
                match self.session.find_by_primary_key(table, &key)? {
                    Some(existing) if self.update_existing => existing,
                    Some(_) => return Err(CoreError::primary_key_violation(class_name, &key)),
                    None => self.session.add_empty_row_with_key(table, key)?,
                }
            }
            None if self.update_existing && root => {
                return Err(CoreError::invalid_argument(format!(
                    "{class_name} has no primary key; updating existing objects needs one"
                )))
            }
            None => self.session.add_empty_row(table)?,
        };
        self.cache.insert(source, row);

        mediator.copy_fields(info, &data, self.session, row)?;

        for property in schema.properties() {
            let column = info.require(&property.name)?;
            let cell = match &property.kind {
                PropertyType::Object(target) => match data.field(&property.name) {
                    Some(Field::Link(Some(child))) => {
                        Self::check_class(class_name, &property.name, target, child)?;
                        Cell::Link(Some(self.materialize(child, false)?))
                    }
                    _ => Cell::Link(None),
                },
                PropertyType::List(target) => match data.field(&property.name) {
                    Some(Field::List(items)) => {
                        let mut rows = Vec::with_capacity(items.len());
                        for item in items {
                            Self::check_class(class_name, &property.name, target, item)?;
                            rows.push(self.materialize(item, false)?);
                        }
                        Cell::List(rows)
                    }
                    _ => Cell::List(Vec::new()),
                },
                _ => continue,
            };
            self.session.set_cell(table, row, column, cell)?;
        }
        Ok(row)
    }

    fn check_class(class_name: &str, field: &str, target: &str, child: &Object) -> CoreResult<()> {
        let child_class = child.class_name();
        if child_class != target {
            return Err(CoreError::invalid_argument(format!(
                "{class_name}.{field} holds a {child_class}, expected {target}"
            )));
        }
        Ok(())
    }
}

struct CopyOut<'a> {
    state: &'a StoreState,
    columns: &'a ColumnIndices,
    mediator: &'a dyn SchemaMediator,
    cache: CopyOutCache,
}

impl CopyOut<'_> {
    fn extract(&mut self, class_name: &str, row: RowId, remaining: i32) -> CoreResult<Object> {
        let (state, columns, mediator) = (self.state, self.columns, self.mediator);
        let info = columns.require(class_name)?;
        let object = match self.cache.visit(info.table_name(), row, class_name, remaining) {
            Visit::Done(object) => return Ok(object),
            Visit::Fill(object) => object,
        };

        let mut data = ObjectData::new(class_name);
        mediator.extract_fields(info, state, row, &mut data)?;

        let schema = mediator.require_schema(class_name)?;
        for property in schema.properties() {
            let Some(target) = property.kind.target_class() else {
                continue;
            };
            let column = info.require(&property.name)?;
            let field = match state.cell(info.table_name(), row, column)? {
                Cell::Link(link) => {
                    let child = match link {
                        Some(child) if remaining > 0 => Some(self.extract(target, *child, remaining - 1)?),
                        _ => None,
                    };
                    Field::Link(child)
                }
                Cell::List(rows) => {
                    let mut items = Vec::new();
                    if remaining > 0 {
                        items.reserve(rows.len());
                        for child in rows {
                            items.push(self.extract(target, *child, remaining - 1)?);
                        }
                    }
                    Field::List(items)
                }
                Cell::Value(_) => continue,
            };
            data.set_field(&property.name, field);
        }
        object.replace(data);
        Ok(object)
    }
}

impl Handle {
    /// Copies a detached graph into the store. Requires an active
    /// transaction.
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::materialize_all`].
    pub fn copy_to_store(&self, object: &Object) -> CoreResult<ManagedObject> {
        GraphMaterializer::materialize(self, object, false)
    }

    /// Copies a detached graph into the store, overwriting stored objects
    /// with the same primary key.
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::materialize_all`].
    pub fn copy_to_store_or_update(&self, object: &Object) -> CoreResult<ManagedObject> {
        GraphMaterializer::materialize(self, object, true)
    }

    /// Copies several detached graphs with one shared identity cache.
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::materialize_all`].
    pub fn copy_to_store_all(&self, objects: &[Object]) -> CoreResult<Vec<ManagedObject>> {
        GraphMaterializer::materialize_all(self, objects, false)
    }

    /// Update-mode variant of [`copy_to_store_all`](Self::copy_to_store_all).
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::materialize_all`].
    pub fn copy_to_store_or_update_all(&self, objects: &[Object]) -> CoreResult<Vec<ManagedObject>> {
        GraphMaterializer::materialize_all(self, objects, true)
    }

    /// Copies detached graphs in without returning managed objects.
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::materialize_all`].
    pub fn insert(&self, objects: &[Object]) -> CoreResult<()> {
        GraphMaterializer::materialize_all(self, objects, false).map(drop)
    }

    /// Update-mode variant of [`insert`](Self::insert).
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::materialize_all`].
    pub fn insert_or_update(&self, objects: &[Object]) -> CoreResult<()> {
        GraphMaterializer::materialize_all(self, objects, true).map(drop)
    }

    /// Copies a managed object and everything reachable from it out of the
    /// store.
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::extract_all`].
    pub fn copy_from_store(&self, object: &ManagedObject) -> CoreResult<Object> {
        GraphMaterializer::extract(self, object, UNBOUNDED_DEPTH)
    }

    /// Copies a managed object out, following at most `max_depth`
    /// references.
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::extract_all`].
    pub fn copy_from_store_with_depth(&self, object: &ManagedObject, max_depth: i32) -> CoreResult<Object> {
        GraphMaterializer::extract(self, object, max_depth)
    }

    /// Copies several managed objects out with one shared identity cache.
    ///
    /// # Errors
    ///
    /// See [`GraphMaterializer::extract_all`].
    pub fn copy_from_store_all(&self, objects: &[ManagedObject], max_depth: i32) -> CoreResult<Vec<Object>> {
        GraphMaterializer::extract_all(self, objects, max_depth)
    }
}
