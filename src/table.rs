/// Reactive Tables Table Implementation
///
/// A Table is a collection of typed columns sharing one row-index space.
/// Every mutation is published synchronously on the table's update bus.
///
/// # Examples
///
/// ```
/// use reactive_tables::{ColumnType, ColumnValue, ReactiveTable, Schema, Table};
///
/// let schema = Schema::new(vec![
///     ("id".to_string(), ColumnType::Int32),
///     ("name".to_string(), ColumnType::String),
/// ]);
/// let mut table = Table::new("users".to_string(), schema).unwrap();
///
/// let row = table.add_row();
/// table.set_value(row, "name", ColumnValue::String("Alice".to_string())).unwrap();
///
/// assert_eq!(table.row_count(), 1);
/// assert_eq!(table.get_value(row, "name").unwrap().as_string(), Some("Alice"));
/// assert!(table.get_value(row, "id").unwrap().is_null());
/// ```

use crate::column::{Column, ColumnType, ColumnValue};
use crate::error::{Error, Result};
use crate::rows::RowManager;
use crate::update::{self, Observer, Publisher, SubscriptionId, TableUpdate, UpdateBus};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Schema definition with column names and types.
///
/// # Examples
///
/// ```
/// use reactive_tables::{Schema, ColumnType};
///
/// let schema = Schema::new(vec![
///     ("id".to_string(), ColumnType::Int64),
///     ("email".to_string(), ColumnType::String),
/// ])
/// .with_unique("id");
///
/// assert_eq!(schema.len(), 2);
/// assert_eq!(schema.column_index("email"), Some(1));
/// assert!(schema.is_unique("id"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    columns: Vec<(String, ColumnType)>,
    unique: Vec<String>,
}

impl Schema {
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Schema {
            columns,
            unique: Vec::new(),
        }
    }

    /// Declare a unique index on a column.
    pub fn with_unique(mut self, column: &str) -> Self {
        if !self.unique.iter().any(|c| c == column) {
            self.unique.push(column.to_string());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(n, _)| n == name)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.columns.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn is_unique(&self, name: &str) -> bool {
        self.unique.iter().any(|c| c == name)
    }

    /// Check for repeated column names and unique indexes on unknown columns.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (name, _) in &self.columns {
            if !seen.insert(name.as_str()) {
                return Err(Error::DuplicateColumn(name.clone()));
            }
        }
        for name in &self.unique {
            if !seen.contains(name.as_str()) {
                return Err(Error::UnknownColumn(name.clone()));
            }
        }
        Ok(())
    }
}

/// Read access and subscription shared by base and derived tables.
///
/// Rows are addressed by row index; `row_at` and `position_of` translate
/// between row indices and dense positions `0..row_count()`.
pub trait ReactiveTable {
    fn name(&self) -> &str;

    fn schema(&self) -> &Schema;

    fn row_count(&self) -> usize;

    /// Read a field. Empty fields and rows that are not live read as `Null`.
    fn get_value(&self, row: usize, column: &str) -> Result<ColumnValue>;

    fn row_at(&self, position: usize) -> Option<usize>;

    fn position_of(&self, row: usize) -> Option<usize>;

    /// Live row indices in position order.
    fn row_indices(&self) -> Vec<usize>;

    fn subscribe(&mut self, observer: Observer) -> SubscriptionId;

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;

    /// Send the events rebuilding the current state to `observer` only.
    fn replay_rows(&self, observer: &mut dyn FnMut(&dyn ReactiveTable, &TableUpdate));

    fn contains_row(&self, row: usize) -> bool {
        self.position_of(row).is_some()
    }

    /// Get all non-empty values of a row keyed by column name.
    fn get_row(&self, row: usize) -> Result<HashMap<String, ColumnValue>> {
        if !self.contains_row(row) {
            return Err(Error::RowNotFound(row));
        }
        let mut values = HashMap::new();
        for name in self.schema().column_names() {
            let value = self.get_value(row, name)?;
            if !value.is_null() {
                values.insert(name.to_string(), value);
            }
        }
        Ok(values)
    }
}

/// Root table owning its columns.
///
/// # Examples
///
/// ```
/// use reactive_tables::{ColumnType, ColumnValue, ReactiveTable, Schema, Table, TableUpdate};
/// use std::cell::RefCell;
/// use std::collections::HashMap;
/// use std::rc::Rc;
///
/// let schema = Schema::new(vec![("score".to_string(), ColumnType::Float64)]);
/// let mut table = Table::new("scores".to_string(), schema).unwrap();
///
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let sink = seen.clone();
/// table.subscribe(Box::new(move |_, update| sink.borrow_mut().push(update.clone())));
///
/// let mut row = HashMap::new();
/// row.insert("score".to_string(), ColumnValue::Float64(95.5));
/// let index = table.append_row(row).unwrap();
///
/// assert_eq!(
///     *seen.borrow(),
///     vec![TableUpdate::Add(index), TableUpdate::update(index, "score")]
/// );
/// ```
pub struct Table {
    name: String,
    schema: Schema,
    columns: Vec<Column>,
    rows: RowManager,
    bus: UpdateBus,
}

impl Table {
    pub fn new(name: String, schema: Schema) -> Result<Self> {
        schema.validate()?;
        let columns = schema
            .columns()
            .map(|(col_name, ty)| {
                if schema.is_unique(col_name) {
                    Column::new_unique(col_name.to_string(), ty)
                } else {
                    Column::new(col_name.to_string(), ty)
                }
            })
            .collect();

        Ok(Table {
            name,
            schema,
            columns,
            rows: RowManager::new(),
            bus: UpdateBus::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of attached observers
    pub fn subscriber_count(&self) -> usize {
        self.bus.len()
    }

    fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::UnknownColumn(name.to_string()))
    }

    fn column_mut(&mut self, name: &str) -> Result<&mut Column> {
        self.columns
            .iter_mut()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::UnknownColumn(name.to_string()))
    }

    /// Allocate a row (lowest recycled index first) and publish `Add`.
    pub fn add_row(&mut self) -> usize {
        let row = self.rows.allocate();
        self.publish(TableUpdate::Add(row));
        row
    }

    /// Create a row with a specific index and publish `Add`.
    pub fn add_row_at(&mut self, row: usize) -> Result<()> {
        self.rows.claim(row)?;
        self.publish(TableUpdate::Add(row));
        Ok(())
    }

    /// Store a value and publish `Update(row, column)`.
    pub fn set_value(&mut self, row: usize, column: &str, value: ColumnValue) -> Result<()> {
        if !self.rows.contains(row) {
            // Report a bad column before a bad row
            self.column(column)?;
            return Err(Error::RowNotFound(row));
        }
        self.column_mut(column)?.set(row, value)?;
        self.publish(TableUpdate::update(row, column));
        Ok(())
    }

    /// Empty a field and publish `Update(row, column)`.
    ///
    /// Returns the value the field held. Clearing an empty field still
    /// publishes, like rewriting an unchanged value.
    pub fn clear_value(&mut self, row: usize, column: &str) -> Result<Option<ColumnValue>> {
        if !self.rows.contains(row) {
            self.column(column)?;
            return Err(Error::RowNotFound(row));
        }
        let old = self.column_mut(column)?.clear(row);
        self.publish(TableUpdate::update(row, column));
        Ok(old)
    }

    /// Delete a row, clearing its fields, and publish `Delete`.
    ///
    /// Returns the values the row held.
    pub fn delete_row(&mut self, row: usize) -> Result<HashMap<String, ColumnValue>> {
        self.rows.release(row)?;
        let mut removed = HashMap::new();
        for column in self.columns.iter_mut() {
            if let Some(value) = column.clear(row) {
                removed.insert(column.name().to_string(), value);
            }
        }
        self.publish(TableUpdate::Delete(row));
        Ok(removed)
    }

    /// Add a row and set its values, in schema order.
    ///
    /// All values are checked before the row is created, so a failing call
    /// publishes nothing.
    pub fn append_row(&mut self, values: HashMap<String, ColumnValue>) -> Result<usize> {
        for (name, value) in &values {
            let column = self.column(name)?;
            column.check_type(value)?;
            if column.is_unique() && column.find(value).is_some() {
                return Err(Error::DuplicateKey(name.clone()));
            }
        }

        let row = self.add_row();
        let names: Vec<String> = self.schema.column_names().iter().map(|c| c.to_string()).collect();
        let mut values = values;
        for name in names {
            if let Some(value) = values.remove(&name) {
                self.set_value(row, &name, value)?;
            }
        }
        Ok(row)
    }

    /// Find the first row whose column holds `value`.
    ///
    /// Unique columns answer from their index; others are scanned.
    pub fn find_row(&self, column: &str, value: &ColumnValue) -> Result<Option<usize>> {
        let col = self.column(column)?;
        if col.is_unique() {
            return Ok(col.find(value));
        }
        Ok(self.rows.iter().find(|&row| col.get_ref(row) == Some(value)))
    }

    /// Export the live rows, in position order, as a JSON array of objects.
    pub fn to_json(&self) -> Result<String> {
        let rows: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|row| {
                let obj: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .map(|col| (col.name().to_string(), value_to_json(&col.get(row))))
                    .collect();
                serde_json::Value::Object(obj)
            })
            .collect();

        Ok(serde_json::to_string_pretty(&rows)?)
    }
}

fn value_to_json(value: &ColumnValue) -> serde_json::Value {
    use serde_json::Value;

    match value {
        ColumnValue::Int16(n) => Value::from(*n),
        ColumnValue::Int32(n) => Value::from(*n),
        ColumnValue::Int64(n) => Value::from(*n),
        ColumnValue::Byte(n) => Value::from(*n),
        ColumnValue::Float32(f) => serde_json::Number::from_f64(*f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnValue::Float64(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnValue::Bool(b) => Value::Bool(*b),
        ColumnValue::Null => Value::Null,
        // Text-like and exact types keep their canonical string form
        other => Value::String(other.to_string()),
    }
}

impl ReactiveTable for Table {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn get_value(&self, row: usize, column: &str) -> Result<ColumnValue> {
        Ok(self.column(column)?.get(row))
    }

    fn row_at(&self, position: usize) -> Option<usize> {
        self.rows.row_at(position)
    }

    fn position_of(&self, row: usize) -> Option<usize> {
        self.rows.position_of(row)
    }

    fn row_indices(&self) -> Vec<usize> {
        self.rows.iter().collect()
    }

    fn subscribe(&mut self, observer: Observer) -> SubscriptionId {
        self.bus.subscribe(observer)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    fn replay_rows(&self, observer: &mut dyn FnMut(&dyn ReactiveTable, &TableUpdate)) {
        update::replay(self, observer)
    }
}

impl Publisher for Table {
    fn bus_mut(&mut self) -> &mut UpdateBus {
        &mut self.bus
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("columns", &self.schema.column_names())
            .field("rows", &self.rows.len())
            .finish()
    }
}
