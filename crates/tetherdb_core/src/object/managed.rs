use crate::engine::Cell;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleInner;
use crate::schema::{ColumnInfo, PropertyType};
use crate::types::{PrimaryKey, RowId};
use crate::value::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// How a managed object may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A typed object, eligible for copy-out.
    Typed,
    /// A reflective view, readable and writable but never copied out.
    Dynamic,
}

/// An object backed by a row of the store, seen through one handle.
///
/// Reads observe the handle's snapshot, or its open transaction. Writes
/// require an active transaction. A managed object becomes invalid when its
/// row is deleted or its handle closes.
#[derive(Clone)]
pub struct ManagedObject {
    handle: Arc<HandleInner>,
    class_name: String,
    row: RowId,
    kind: ObjectKind,
    _not_send: PhantomData<*const ()>,
}

impl ManagedObject {
    pub(crate) fn new(handle: Arc<HandleInner>, class_name: &str, row: RowId, kind: ObjectKind) -> Self {
        Self {
            handle,
            class_name: class_name.to_string(),
            row,
            kind,
            _not_send: PhantomData,
        }
    }

    /// Class name.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Row backing this object.
    #[must_use]
    pub fn row_id(&self) -> RowId {
        self.row
    }

    /// Typed or dynamic.
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Returns true if the handle is open and the row still exists.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        let Ok(info) = self.info() else {
            return false;
        };
        self.handle
            .session()
            .state()
            .table(info.table_name())
            .is_some_and(|table| table.contains(self.row))
    }

    /// Returns true if `other` is the same row seen through the same handle.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
            && self.class_name == other.class_name
            && self.row == other.row
    }

    pub(crate) fn handle(&self) -> &Arc<HandleInner> {
        &self.handle
    }

    fn info(&self) -> CoreResult<&ColumnInfo> {
        self.handle.columns().require(&self.class_name)
    }

    fn ensure_valid(&self) -> CoreResult<&ColumnInfo> {
        self.handle.check_open()?;
        if !self.is_valid() {
            return Err(CoreError::invalid_state(format!(
                "{} {} has been deleted",
                self.class_name, self.row
            )));
        }
        self.info()
    }

    fn property_kind(&self, field: &str) -> CoreResult<PropertyType> {
        let schema = self.handle.mediator().require_schema(&self.class_name)?;
        schema
            .property(field)
            .map(|p| p.kind.clone())
            .ok_or_else(|| {
                CoreError::invalid_argument(format!("{} has no property '{field}'", self.class_name))
            })
    }

    fn read_cell(&self, field: &str) -> CoreResult<Cell> {
        let info = self.ensure_valid()?;
        let column = info.require(field)?;
        let session = self.handle.session();
        session.get_cell(info.table_name(), self.row, column).cloned()
    }

    fn write_cell(&self, field: &str, cell: Cell) -> CoreResult<()> {
        let info = self.ensure_valid()?;
        let column = info.require(field)?;
        self.handle
            .session()
            .set_cell(info.table_name(), self.row, column, cell)
    }

    fn target(&self, field: &str, row: RowId) -> CoreResult<Self> {
        let kind = self.property_kind(field)?;
        let class = kind.target_class().ok_or_else(|| {
            CoreError::invalid_argument(format!("{}.{field} is not a reference", self.class_name))
        })?;
        Ok(Self::new(Arc::clone(&self.handle), class, row, self.kind))
    }

    fn check_target(&self, field: &str, target: &Self) -> CoreResult<RowId> {
        if !Arc::ptr_eq(&self.handle, &target.handle) {
            return Err(CoreError::invalid_argument(
                "cannot link objects that belong to different handles",
            ));
        }
        let kind = self.property_kind(field)?;
        if kind.target_class() != Some(target.class_name.as_str()) {
            return Err(CoreError::invalid_argument(format!(
                "{}.{field} cannot hold a {}",
                self.class_name, target.class_name
            )));
        }
        Ok(target.row)
    }

    /// Reads scalar field `field`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a deleted object or closed handle, and
    /// `InvalidArgument` for an unknown or reference field.
    pub fn get(&self, field: &str) -> CoreResult<Value> {
        match self.read_cell(field)? {
            Cell::Value(v) => Ok(v),
            _ => Err(CoreError::invalid_argument(format!(
                "{}.{field} is a reference field",
                self.class_name
            ))),
        }
    }

    /// Writes scalar field `field`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a transaction, and `InvalidArgument`
    /// for a value that does not match the field.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> CoreResult<()> {
        self.write_cell(field, Cell::Value(value.into()))
    }

    /// Primary key value, if the class declares one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a deleted object or closed handle.
    pub fn primary_key(&self) -> CoreResult<Option<PrimaryKey>> {
        let info = self.ensure_valid()?;
        let Some(pk) = self.handle.mediator().require_schema(&self.class_name)?.primary_key() else {
            return Ok(None);
        };
        let column = info.require(pk)?;
        let session = self.handle.session();
        match session.get_cell(info.table_name(), self.row, column)? {
            Cell::Value(v) => Ok(v.to_primary_key()),
            _ => Ok(None),
        }
    }

    /// Object linked from `field`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `field` is not a link.
    pub fn link(&self, field: &str) -> CoreResult<Option<Self>> {
        match self.read_cell(field)? {
            Cell::Link(target) => target.map(|row| self.target(field, row)).transpose(),
            _ => Err(CoreError::invalid_argument(format!(
                "{}.{field} is not a link",
                self.class_name
            ))),
        }
    }

    /// Points `field` at `target`, or clears it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a transaction, and `InvalidArgument`
    /// for a target of the wrong class or handle.
    pub fn set_link(&self, field: &str, target: Option<&Self>) -> CoreResult<()> {
        let row = target.map(|t| self.check_target(field, t)).transpose()?;
        self.write_cell(field, Cell::Link(row))
    }

    /// Objects in list `field`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `field` is not a list.
    pub fn list(&self, field: &str) -> CoreResult<Vec<Self>> {
        match self.read_cell(field)? {
            Cell::List(rows) => rows.into_iter().map(|row| self.target(field, row)).collect(),
            _ => Err(CoreError::invalid_argument(format!(
                "{}.{field} is not a list",
                self.class_name
            ))),
        }
    }

    /// Replaces list `field`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a transaction, and `InvalidArgument`
    /// for an item of the wrong class or handle.
    pub fn set_list(&self, field: &str, items: &[Self]) -> CoreResult<()> {
        let rows = items
            .iter()
            .map(|item| self.check_target(field, item))
            .collect::<CoreResult<Vec<_>>>()?;
        self.write_cell(field, Cell::List(rows))
    }

    /// Appends to list `field`.
    ///
    /// # Errors
    ///
    /// See [`set_list`](Self::set_list).
    pub fn push(&self, field: &str, item: &Self) -> CoreResult<()> {
        let row = self.check_target(field, item)?;
        let mut rows = match self.read_cell(field)? {
            Cell::List(rows) => rows,
            _ => {
                return Err(CoreError::invalid_argument(format!(
                    "{}.{field} is not a list",
                    self.class_name
                )))
            }
        };
        rows.push(row);
        self.write_cell(field, Cell::List(rows))
    }

    /// Deletes the object. Links to it are cleared.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a transaction or if already deleted.
    pub fn delete(&self) -> CoreResult<()> {
        let info = self.ensure_valid()?;
        self.handle.session().delete_row(info.table_name(), self.row)
    }
}

impl PartialEq for ManagedObject {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObject")
            .field("class", &self.class_name)
            .field("row", &self.row)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
