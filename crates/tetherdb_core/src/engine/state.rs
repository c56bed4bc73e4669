//! In-memory table model and the operations that mutate it.
//!
//! A [`StoreState`] is an immutable-once-published view of every table at one
//! version. Tables sit behind `Arc` so a write transaction only clones the
//! tables it touches. Every mutation is expressed as an [`Op`]; the same
//! `apply` path runs for live writes and for commit log replay, so replay
//! reproduces exactly what was committed.

use crate::error::{CoreError, CoreResult};
use crate::types::{PrimaryKey, RowId, Version};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Boolean.
    Bool,
    /// Signed integer.
    Integer,
    /// Double.
    Double,
    /// Text.
    Text,
    /// Bytes.
    Bytes,
    /// Link to a row of the named table.
    Link(String),
    /// Ordered list of links to rows of the named table.
    LinkList(String),
}

impl ColumnType {
    /// Target table of a link column.
    #[must_use]
    pub fn target_table(&self) -> Option<&str> {
        match self {
            Self::Link(t) | Self::LinkList(t) => Some(t),
            _ => None,
        }
    }
}

/// Definition of one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Storage type.
    pub column_type: ColumnType,
    /// Whether scalar cells may hold `Null`, or links may be unset.
    pub nullable: bool,
}

impl ColumnSpec {
    /// Cell a fresh row receives for this column.
    #[must_use]
    pub fn default_cell(&self) -> Cell {
        match &self.column_type {
            ColumnType::Link(_) => Cell::Link(None),
            ColumnType::LinkList(_) => Cell::List(Vec::new()),
            _ if self.nullable => Cell::Value(Value::Null),
            ColumnType::Bool => Cell::Value(Value::Bool(false)),
            ColumnType::Integer => Cell::Value(Value::Integer(0)),
            ColumnType::Double => Cell::Value(Value::Double(0.0)),
            ColumnType::Text => Cell::Value(Value::Text(String::new())),
            ColumnType::Bytes => Cell::Value(Value::Bytes(Vec::new())),
        }
    }

    fn accepts(&self, cell: &Cell) -> bool {
        match (&self.column_type, cell) {
            (ColumnType::Link(_), Cell::Link(_)) | (ColumnType::LinkList(_), Cell::List(_)) => true,
            (column_type, Cell::Value(Value::Null)) if column_type.target_table().is_none() => {
                self.nullable
            }
            (ColumnType::Bool, Cell::Value(Value::Bool(_)))
            | (ColumnType::Integer, Cell::Value(Value::Integer(_)))
            | (ColumnType::Double, Cell::Value(Value::Double(_)))
            | (ColumnType::Text, Cell::Value(Value::Text(_)))
            | (ColumnType::Bytes, Cell::Value(Value::Bytes(_))) => true,
            _ => false,
        }
    }
}

/// Definition of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Columns in index order.
    pub columns: Vec<ColumnSpec>,
    /// Name of the primary key column.
    pub primary_key: Option<String>,
}

/// Contents of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    /// Scalar value.
    Value(Value),
    /// Single link.
    Link(Option<RowId>),
    /// Link list.
    List(Vec<RowId>),
}

/// A table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    /// Cells in column order.
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Cell at `column`.
    #[must_use]
    pub fn cell(&self, column: usize) -> Option<&Cell> {
        self.cells.get(column)
    }
}

/// A table: its definition, rows and primary key index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    spec: TableSpec,
    rows: BTreeMap<RowId, Row>,
    next_row_id: u64,
    #[serde(skip)]
    pk_index: BTreeMap<PrimaryKey, RowId>,
}

impl Table {
    fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            rows: BTreeMap::new(),
            next_row_id: 0,
            pk_index: BTreeMap::new(),
        }
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Table definition.
    #[must_use]
    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row with the given ID.
    #[must_use]
    pub fn row(&self, id: RowId) -> Option<&Row> {
        self.rows.get(&id)
    }

    /// Returns true if the row exists.
    #[must_use]
    pub fn contains(&self, id: RowId) -> bool {
        self.rows.contains_key(&id)
    }

    /// Row IDs in ascending order.
    pub fn row_ids(&self) -> impl Iterator<Item = RowId> + '_ {
        self.rows.keys().copied()
    }

    /// Looks up a row by primary key.
    #[must_use]
    pub fn find(&self, key: &PrimaryKey) -> Option<RowId> {
        self.pk_index.get(key).copied()
    }

    /// Index of the column named `name`.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.spec.columns.iter().position(|c| c.name == name)
    }

    /// Index of the primary key column.
    #[must_use]
    pub fn primary_key_column(&self) -> Option<usize> {
        self.spec
            .primary_key
            .as_deref()
            .and_then(|pk| self.column_index(pk))
    }

    fn next_row_id(&self) -> RowId {
        RowId(self.next_row_id)
    }

    fn rebuild_index(&mut self) -> CoreResult<()> {
        self.pk_index.clear();
        let Some(pk) = self.primary_key_column() else {
            return Ok(());
        };
        for (id, row) in &self.rows {
            let key = row.cells.get(pk).and_then(cell_key).ok_or_else(|| {
                CoreError::log_corruption(format!("{}: {id} has no usable primary key", self.spec.name))
            })?;
            self.pk_index.insert(key, *id);
        }
        Ok(())
    }

    fn key_matches_column(&self, key: &PrimaryKey) -> bool {
        let Some(pk) = self.primary_key_column() else {
            return false;
        };
        matches!(
            (&self.spec.columns[pk].column_type, key),
            (ColumnType::Integer, PrimaryKey::Integer(_)) | (ColumnType::Text, PrimaryKey::Text(_))
        )
    }

    fn nullify_links_to(&mut self, target: &str, removed: Option<RowId>) {
        let columns: Vec<usize> = self
            .spec
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.column_type.target_table() == Some(target))
            .map(|(i, _)| i)
            .collect();
        if columns.is_empty() {
            return;
        }
        let hit = |id: &RowId| removed.map_or(true, |r| r == *id);
        for row in self.rows.values_mut() {
            for &col in &columns {
                match &mut row.cells[col] {
                    Cell::Link(link) => {
                        if link.as_ref().is_some_and(hit) {
                            *link = None;
                        }
                    }
                    Cell::List(list) => list.retain(|id| !hit(id)),
                    Cell::Value(_) => {}
                }
            }
        }
    }
}

fn cell_key(cell: &Cell) -> Option<PrimaryKey> {
    match cell {
        Cell::Value(v) => v.to_primary_key(),
        _ => None,
    }
}

/// A single logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Create a table.
    CreateTable(TableSpec),
    /// Drop a table.
    DropTable {
        /// Table name.
        table: String,
    },
    /// Append a column to a table.
    AddColumn {
        /// Table name.
        table: String,
        /// New column.
        column: ColumnSpec,
    },
    /// Remove a column from a table.
    RemoveColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Insert a row with default cells and an optional primary key.
    InsertRow {
        /// Table name.
        table: String,
        /// Assigned row ID.
        row: RowId,
        /// Primary key value.
        key: Option<PrimaryKey>,
    },
    /// Overwrite one cell.
    SetCell {
        /// Table name.
        table: String,
        /// Row ID.
        row: RowId,
        /// Column index.
        column: usize,
        /// New contents.
        cell: Cell,
    },
    /// Delete a row and clear every link pointing at it.
    DeleteRow {
        /// Table name.
        table: String,
        /// Row ID.
        row: RowId,
    },
    /// Delete every row of a table.
    ClearTable {
        /// Table name.
        table: String,
    },
    /// Stamp the schema version.
    SetSchemaVersion(u64),
}

/// Every table of a store at one version.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    version: Version,
    schema_version: Option<u64>,
    tables: BTreeMap<String, Arc<Table>>,
}

impl StoreState {
    pub(crate) fn from_snapshot(
        version: Version,
        schema_version: Option<u64>,
        tables: Vec<Table>,
    ) -> CoreResult<Self> {
        let mut map = BTreeMap::new();
        for mut table in tables {
            table.rebuild_index()?;
            map.insert(table.spec.name.clone(), Arc::new(table));
        }
        Ok(Self {
            version,
            schema_version,
            tables: map,
        })
    }

    pub(crate) fn to_snapshot(&self) -> Vec<Table> {
        self.tables.values().map(|t| Table::clone(t)).collect()
    }

    /// Committed version this state reflects.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Stamped schema version, or `None` for a store that was never
    /// initialized.
    #[must_use]
    pub fn schema_version(&self) -> Option<u64> {
        self.schema_version
    }

    /// Table named `name`.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(AsRef::as_ref)
    }

    /// All tables, ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &Table> + '_ {
        self.tables.values().map(AsRef::as_ref)
    }

    /// Table names, ordered.
    pub fn table_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.tables.keys().map(String::as_str)
    }

    /// Returns the table or `InvalidArgument`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table does not exist.
    pub fn require_table(&self, name: &str) -> CoreResult<&Table> {
        self.table(name)
            .ok_or_else(|| CoreError::invalid_argument(format!("no table named '{name}'")))
    }

    /// Returns the cell at (`table`, `row`, `column`).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table, row or column does not exist.
    pub fn cell(&self, table: &str, row: RowId, column: usize) -> CoreResult<&Cell> {
        let t = self.require_table(table)?;
        let r = t
            .row(row)
            .ok_or_else(|| CoreError::invalid_argument(format!("{table}: {row} does not exist")))?;
        r.cell(column).ok_or_else(|| {
            CoreError::invalid_argument(format!("{table}: no column at index {column}"))
        })
    }

    /// Row ID the next insert into `table` will receive.
    pub(crate) fn next_row_id(&self, table: &str) -> CoreResult<RowId> {
        Ok(self.require_table(table)?.next_row_id())
    }

    fn table_mut(&mut self, name: &str) -> CoreResult<&mut Table> {
        self.tables
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| CoreError::invalid_argument(format!("no table named '{name}'")))
    }

    fn referencing_tables(&self, target: &str) -> Vec<String> {
        self.tables
            .values()
            .filter(|t| {
                t.spec
                    .columns
                    .iter()
                    .any(|c| c.column_type.target_table() == Some(target))
            })
            .map(|t| t.spec.name.clone())
            .collect()
    }

    /// Applies one operation. On error the state is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for operations on missing tables, rows or
    /// columns and for type mismatches, and `PrimaryKeyConstraintViolation`
    /// for duplicate keys.
    pub fn apply(&mut self, op: &Op) -> CoreResult<()> {
        match op {
            Op::CreateTable(spec) => self.create_table(spec),
            Op::DropTable { table } => self.drop_table(table),
            Op::AddColumn { table, column } => self.add_column(table, column),
            Op::RemoveColumn { table, column } => self.remove_column(table, column),
            Op::InsertRow { table, row, key } => self.insert_row(table, *row, key.as_ref()),
            Op::SetCell {
                table,
                row,
                column,
                cell,
            } => self.set_cell(table, *row, *column, cell),
            Op::DeleteRow { table, row } => self.delete_row(table, *row),
            Op::ClearTable { table } => self.clear_table(table),
            Op::SetSchemaVersion(v) => {
                self.schema_version = Some(*v);
                Ok(())
            }
        }
    }

    fn create_table(&mut self, spec: &TableSpec) -> CoreResult<()> {
        if self.tables.contains_key(&spec.name) {
            return Err(CoreError::invalid_argument(format!(
                "table '{}' already exists",
                spec.name
            )));
        }
        let table = Table::new(spec.clone());
        if let Some(pk) = &spec.primary_key {
            let column = table
                .column_index(pk)
                .map(|i| &spec.columns[i])
                .ok_or_else(|| {
                    CoreError::invalid_argument(format!(
                        "{}: primary key column '{pk}' does not exist",
                        spec.name
                    ))
                })?;
            if column.nullable
                || !matches!(column.column_type, ColumnType::Integer | ColumnType::Text)
            {
                return Err(CoreError::invalid_argument(format!(
                    "{}: primary key column '{pk}' must be a non-null integer or text",
                    spec.name
                )));
            }
        }
        self.tables.insert(spec.name.clone(), Arc::new(table));
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> CoreResult<()> {
        self.require_table(name)?;
        if let Some(other) = self
            .referencing_tables(name)
            .into_iter()
            .find(|t| t != name)
        {
            return Err(CoreError::invalid_argument(format!(
                "table '{name}' is still linked from '{other}'"
            )));
        }
        self.tables.remove(name);
        Ok(())
    }

    fn add_column(&mut self, table: &str, column: &ColumnSpec) -> CoreResult<()> {
        let t = self.require_table(table)?;
        if t.column_index(&column.name).is_some() {
            return Err(CoreError::invalid_argument(format!(
                "{table}: column '{}' already exists",
                column.name
            )));
        }
        let t = self.table_mut(table)?;
        let default = column.default_cell();
        for row in t.rows.values_mut() {
            row.cells.push(default.clone());
        }
        t.spec.columns.push(column.clone());
        Ok(())
    }

    fn remove_column(&mut self, table: &str, column: &str) -> CoreResult<()> {
        let t = self.require_table(table)?;
        let index = t.column_index(column).ok_or_else(|| {
            CoreError::invalid_argument(format!("{table}: no column named '{column}'"))
        })?;
        if t.primary_key_column() == Some(index) {
            return Err(CoreError::invalid_argument(format!(
                "{table}: cannot remove primary key column '{column}'"
            )));
        }
        let t = self.table_mut(table)?;
        t.spec.columns.remove(index);
        for row in t.rows.values_mut() {
            row.cells.remove(index);
        }
        Ok(())
    }

    fn insert_row(&mut self, table: &str, row: RowId, key: Option<&PrimaryKey>) -> CoreResult<()> {
        let t = self.require_table(table)?;
        if row.0 < t.next_row_id {
            return Err(CoreError::invalid_argument(format!(
                "{table}: {row} was already allocated"
            )));
        }
        let pk = t.primary_key_column();
        match (pk, key) {
            (Some(_), None) => {
                return Err(CoreError::invalid_argument(format!(
                    "{table} has a primary key; rows must be created with one"
                )))
            }
            (None, Some(_)) => {
                return Err(CoreError::invalid_argument(format!(
                    "{table} has no primary key"
                )))
            }
            (Some(_), Some(key)) => {
                if !t.key_matches_column(key) {
                    return Err(CoreError::invalid_argument(format!(
                        "{table}: primary key {key} has the wrong type"
                    )));
                }
                if t.find(key).is_some() {
                    return Err(CoreError::primary_key_violation(table, key));
                }
            }
            (None, None) => {}
        }

        let t = self.table_mut(table)?;
        let mut cells: Vec<Cell> = t.spec.columns.iter().map(ColumnSpec::default_cell).collect();
        if let (Some(pk), Some(key)) = (pk, key) {
            cells[pk] = Cell::Value(Value::from(key.clone()));
            t.pk_index.insert(key.clone(), row);
        }
        t.rows.insert(row, Row { cells });
        t.next_row_id = row.0 + 1;
        Ok(())
    }

    fn set_cell(&mut self, table: &str, row: RowId, column: usize, cell: &Cell) -> CoreResult<()> {
        let t = self.require_table(table)?;
        let spec = t.spec.columns.get(column).ok_or_else(|| {
            CoreError::invalid_argument(format!("{table}: no column at index {column}"))
        })?;
        if !t.contains(row) {
            return Err(CoreError::invalid_argument(format!("{table}: {row} does not exist")));
        }
        if !spec.accepts(cell) {
            return Err(CoreError::invalid_argument(format!(
                "{table}.{}: value does not match column type {:?}",
                spec.name, spec.column_type
            )));
        }
        if let Some(target) = spec.column_type.target_table() {
            let target_table = self.require_table(target)?;
            let missing = match cell {
                Cell::Link(Some(id)) => (!target_table.contains(*id)).then_some(*id),
                Cell::List(ids) => ids.iter().copied().find(|id| !target_table.contains(*id)),
                _ => None,
            };
            if let Some(id) = missing {
                return Err(CoreError::invalid_argument(format!(
                    "{table}.{}: link target {target}/{id} does not exist",
                    spec.name
                )));
            }
        }

        let is_pk = t.primary_key_column() == Some(column);
        let mut key_change = None;
        if is_pk {
            let new_key = cell_key(cell).ok_or_else(|| {
                CoreError::invalid_argument(format!("{table}: primary key must not be null"))
            })?;
            match t.find(&new_key) {
                Some(existing) if existing != row => {
                    return Err(CoreError::primary_key_violation(table, &new_key));
                }
                Some(_) => {}
                None => {
                    let old_key = t.rows.get(&row).and_then(|r| cell_key(&r.cells[column]));
                    key_change = Some((old_key, new_key));
                }
            }
        }

        let t = self.table_mut(table)?;
        if let Some((old_key, new_key)) = key_change {
            if let Some(old) = old_key {
                t.pk_index.remove(&old);
            }
            t.pk_index.insert(new_key, row);
        }
        if let Some(r) = t.rows.get_mut(&row) {
            r.cells[column] = cell.clone();
        }
        Ok(())
    }

    fn delete_row(&mut self, table: &str, row: RowId) -> CoreResult<()> {
        let t = self.require_table(table)?;
        if !t.contains(row) {
            return Err(CoreError::invalid_argument(format!("{table}: {row} does not exist")));
        }
        let referencing = self.referencing_tables(table);
        let t = self.table_mut(table)?;
        if let Some(removed) = t.rows.remove(&row) {
            if let Some(key) = t.primary_key_column().and_then(|pk| cell_key(&removed.cells[pk])) {
                t.pk_index.remove(&key);
            }
        }
        for name in referencing {
            self.table_mut(&name)?.nullify_links_to(table, Some(row));
        }
        Ok(())
    }

    fn clear_table(&mut self, table: &str) -> CoreResult<()> {
        self.require_table(table)?;
        let referencing = self.referencing_tables(table);
        let t = self.table_mut(table)?;
        t.rows.clear();
        t.pk_index.clear();
        for name in referencing {
            self.table_mut(&name)?.nullify_links_to(table, None);
        }
        Ok(())
    }
}
