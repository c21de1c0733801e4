/// Incremental group-by aggregation over a reactive table.
///
/// An [`AggregatedTable`] subscribes to a source table and keeps one output
/// row (a bucket) per distinct combination of grouping-column values. Each
/// bucket carries one accumulator per declared aggregate. Source events are
/// folded in as they arrive; nothing is ever recomputed from scratch.
///
/// Output rows are addressed by bucket slot. Slots are handed out in the
/// order groups first appear and are never reused, so a consumer holding a
/// slot keeps pointing at the same group until it disappears. Positions
/// enumerate the live slots in ascending order.
///
/// # Event order
///
/// For one source event the aggregated table emits, in order:
/// - `Add(slot)` and one `Update` per grouping column when a group appears
/// - `Update(slot, grouping column)` when an existing group gains a row by a
///   group change
/// - one `Update(slot, aggregate)` per affected aggregate
/// - `Delete(slot)` when the last member leaves a group
///
/// Rewriting a grouping column without changing the group only refreshes
/// aggregates that read that column; the others cannot have changed, so they
/// emit nothing.
///
/// # Examples
///
/// ```
/// use reactive_tables::{AggregateKind, AggregatedTable, ColumnType, ColumnValue, ReactiveTable, Schema, Table};
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let schema = Schema::new(vec![
///     ("desk".to_string(), ColumnType::String),
///     ("qty".to_string(), ColumnType::Int64),
/// ]);
/// let trades = Rc::new(RefCell::new(Table::new("trades".to_string(), schema).unwrap()));
///
/// let by_desk = AggregatedTable::builder("by_desk")
///     .group_by("desk")
///     .aggregate("total", "qty", AggregateKind::Sum)
///     .build(&trades)
///     .unwrap();
///
/// {
///     let mut t = trades.borrow_mut();
///     for (desk, qty) in [("rates", 5), ("fx", 2), ("rates", 7)] {
///         let row = t.add_row();
///         t.set_value(row, "desk", ColumnValue::String(desk.to_string())).unwrap();
///         t.set_value(row, "qty", ColumnValue::Int64(qty)).unwrap();
///     }
/// }
///
/// let agg = by_desk.borrow();
/// let rates = agg.find_group(&[ColumnValue::String("rates".to_string())]).unwrap();
/// assert_eq!(agg.row_count(), 2);
/// assert_eq!(agg.get_value(rates, "total").unwrap(), ColumnValue::Int64(12));
/// ```

mod accumulator;

pub use accumulator::{Accumulator, AggregateKind, Average, Count, Extremum, Sum};

use crate::column::{ColumnType, ColumnValue, ValueKey};
use crate::diagnostics::{log_diagnostics, Diagnostics};
use crate::error::{Error, Result};
use crate::indexed::IndexedDictionary;
use crate::rows::RowManager;
use crate::table::{ReactiveTable, Schema};
use crate::update::{self, Observer, Publisher, SubscriptionId, TableUpdate, UpdateBus};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Grouping-column values of one source row, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupByKey(Vec<ValueKey>);

impl GroupByKey {
    pub fn new(values: Vec<ColumnValue>) -> Self {
        GroupByKey(values.into_iter().map(ValueKey::new).collect())
    }

    pub fn value(&self, index: usize) -> Option<&ColumnValue> {
        self.0.get(index).map(|k| k.value())
    }

    pub fn values(&self) -> impl Iterator<Item = &ColumnValue> {
        self.0.iter().map(|k| k.value())
    }
}

struct AggregateColumn {
    name: String,
    source_column: String,
    source_type: ColumnType,
    kind: AggregateKind,
}

struct Bucket {
    members: usize,
    accumulators: Vec<Box<dyn Accumulator>>,
}

/// What one source row currently contributes.
struct SourceRow {
    key: GroupByKey,
    /// Value folded into each aggregate, in declaration order
    contributions: Vec<ColumnValue>,
}

/// Declares the grouping and aggregate columns of an [`AggregatedTable`].
pub struct AggregatedTableBuilder {
    name: String,
    group_by: Vec<String>,
    aggregates: Vec<(String, String, AggregateKind)>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
}

impl AggregatedTableBuilder {
    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by.push(column.into());
        self
    }

    /// Add an output column `name` folding `source_column` with `kind`.
    pub fn aggregate(
        mut self,
        name: impl Into<String>,
        source_column: impl Into<String>,
        kind: AggregateKind,
    ) -> Self {
        self.aggregates.push((name.into(), source_column.into(), kind));
        self
    }

    /// Sink for errors raised while handling source events.
    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Validate the declaration, attach to `source` and fold in its current rows.
    pub fn build<T>(self, source: &Rc<RefCell<T>>) -> Result<Rc<RefCell<AggregatedTable>>>
    where
        T: ReactiveTable + ?Sized + 'static,
    {
        let mut columns = Vec::new();
        let mut group_columns: Vec<String> = Vec::new();
        let mut aggregates = Vec::new();
        {
            let src = source.borrow();
            let src_schema = src.schema();

            for column in self.group_by {
                if group_columns.contains(&column) {
                    return Err(Error::DuplicateGroupColumn(column));
                }
                let ty = src_schema
                    .column_type(&column)
                    .ok_or_else(|| Error::UnknownColumn(column.clone()))?;
                columns.push((column.clone(), ty));
                group_columns.push(column);
            }

            for (name, source_column, kind) in self.aggregates {
                let source_type = src_schema
                    .column_type(&source_column)
                    .ok_or_else(|| Error::UnknownColumn(source_column.clone()))?;
                let output = kind.output_type(source_type).ok_or_else(|| Error::InvalidAggregate {
                    name: name.clone(),
                    column: source_column.clone(),
                    reason: format!("{:?} is not defined for {:?} values", kind, source_type),
                })?;
                columns.push((name.clone(), output));
                aggregates.push(AggregateColumn {
                    name,
                    source_column,
                    source_type,
                    kind,
                });
            }
        }

        let schema = Schema::new(columns);
        schema.validate()?;

        let diagnostics = self.diagnostics.unwrap_or_else(log_diagnostics);
        let table = Rc::new(RefCell::new(AggregatedTable {
            name: self.name,
            schema,
            group_columns,
            aggregates,
            groups: IndexedDictionary::new(),
            positions: RowManager::new(),
            source_rows: HashMap::new(),
            bus: UpdateBus::new(),
            detach: None,
            diagnostics: diagnostics.clone(),
        }));

        let weak = Rc::downgrade(&table);
        let id = source.borrow_mut().subscribe(Box::new(move |src, update| {
            if let Some(agg) = weak.upgrade() {
                let result = agg.borrow_mut().on_source_update(src, update);
                if let Err(err) = result {
                    diagnostics.error(agg.borrow().name(), &err);
                }
            }
        }));

        let weak_source = Rc::downgrade(source);
        table.borrow_mut().detach = Some(Box::new(move || {
            if let Some(src) = weak_source.upgrade() {
                src.borrow_mut().unsubscribe(id);
            }
        }));

        let mut failure = None;
        source.borrow().replay_rows(&mut |src, update| {
            if failure.is_none() {
                failure = table.borrow_mut().on_source_update(src, update).err();
            }
        });
        if let Some(err) = failure {
            table.borrow_mut().dispose();
            return Err(err);
        }

        Ok(table)
    }
}

/// Group-by view over a source table, itself a [`ReactiveTable`].
pub struct AggregatedTable {
    name: String,
    schema: Schema,
    group_columns: Vec<String>,
    aggregates: Vec<AggregateColumn>,
    groups: IndexedDictionary<GroupByKey, Bucket>,
    positions: RowManager,
    source_rows: HashMap<usize, SourceRow>,
    bus: UpdateBus,
    detach: Option<Box<dyn FnOnce()>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl AggregatedTable {
    pub fn builder(name: impl Into<String>) -> AggregatedTableBuilder {
        AggregatedTableBuilder {
            name: name.into(),
            group_by: Vec::new(),
            aggregates: Vec::new(),
            diagnostics: None,
        }
    }

    pub fn group_columns(&self) -> &[String] {
        &self.group_columns
    }

    /// Slot of the group with the given grouping values, if it exists.
    pub fn find_group(&self, values: &[ColumnValue]) -> Option<usize> {
        self.groups.slot_of(&GroupByKey::new(values.to_vec()))
    }

    /// Number of source rows in the group at `slot`.
    pub fn member_count(&self, slot: usize) -> usize {
        self.groups.get_at(slot).map_or(0, |b| b.members)
    }

    /// Stop following the source. Must not be called from inside a source event.
    pub fn dispose(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.detach.is_none()
    }

    /// Report a handler failure through the injected sink.
    pub fn report(&self, err: &Error) {
        self.diagnostics.error(&self.name, err);
    }

    fn on_source_update(&mut self, source: &dyn ReactiveTable, update: &TableUpdate) -> Result<()> {
        match update {
            TableUpdate::Add(row) => self.on_add(source, *row),
            TableUpdate::Delete(row) => self.on_delete(*row),
            TableUpdate::Update { row, column } => self.on_update(source, *row, column),
        }
    }

    fn key_for(&self, source: &dyn ReactiveTable, row: usize) -> Result<GroupByKey> {
        let values = self
            .group_columns
            .iter()
            .map(|column| source.get_value(row, column))
            .collect::<Result<Vec<_>>>()?;
        Ok(GroupByKey::new(values))
    }

    fn read_contributions(&self, source: &dyn ReactiveTable, row: usize) -> Result<Vec<ColumnValue>> {
        self.aggregates
            .iter()
            .map(|agg| source.get_value(row, &agg.source_column))
            .collect()
    }

    fn on_add(&mut self, source: &dyn ReactiveTable, row: usize) -> Result<()> {
        if self.source_rows.contains_key(&row) {
            return Err(Error::RowExists(row));
        }
        let key = self.key_for(source, row)?;
        let contributions = self.read_contributions(source, row)?;
        let (slot, _) = self.enter_group(key.clone(), &contributions)?;
        self.source_rows.insert(row, SourceRow { key, contributions });
        self.publish_aggregates(slot);
        Ok(())
    }

    fn on_delete(&mut self, row: usize) -> Result<()> {
        let state = self.source_rows.remove(&row).ok_or(Error::RowNotFound(row))?;
        let (slot, removed) = self.leave_group(row, &state)?;
        if !removed {
            self.publish_aggregates(slot);
        }
        Ok(())
    }

    fn on_update(&mut self, source: &dyn ReactiveTable, row: usize, column: &str) -> Result<()> {
        let is_group = self.group_columns.iter().any(|g| g == column);
        let feeds_aggregate = self.aggregates.iter().any(|a| a.source_column == column);
        if !is_group && !feeds_aggregate {
            return Ok(());
        }
        let current_key = match self.source_rows.get(&row) {
            Some(state) => state.key.clone(),
            None => return Err(Error::RowNotFound(row)),
        };

        if is_group {
            let new_key = self.key_for(source, row)?;
            if new_key != current_key {
                return self.move_row(source, row, column, new_key);
            }
        }

        let slot = self.groups.slot_of(&current_key).ok_or(Error::RowNotFound(row))?;
        for index in 0..self.aggregates.len() {
            if self.aggregates[index].source_column == column {
                self.process_value(source, row, slot, index)?;
                let name = self.aggregates[index].name.clone();
                self.publish(TableUpdate::update(slot, name));
            }
        }
        Ok(())
    }

    /// A grouping value changed: leave the old group, join the new one.
    fn move_row(
        &mut self,
        source: &dyn ReactiveTable,
        row: usize,
        column: &str,
        new_key: GroupByKey,
    ) -> Result<()> {
        let state = self.source_rows.remove(&row).ok_or(Error::RowNotFound(row))?;
        let (old_slot, removed) = self.leave_group(row, &state)?;
        if !removed {
            self.publish_aggregates(old_slot);
        }

        let contributions = self.read_contributions(source, row)?;
        let (slot, created) = self.enter_group(new_key.clone(), &contributions)?;
        self.source_rows.insert(
            row,
            SourceRow {
                key: new_key,
                contributions,
            },
        );
        if !created {
            self.publish(TableUpdate::update(slot, column));
        }
        self.publish_aggregates(slot);
        Ok(())
    }

    /// Add a row's contributions to a group, creating the group if needed.
    ///
    /// Returns the slot and whether the group was created.
    fn enter_group(&mut self, key: GroupByKey, contributions: &[ColumnValue]) -> Result<(usize, bool)> {
        let (slot, created) = match self.groups.slot_of(&key) {
            Some(slot) => (slot, false),
            None => {
                let bucket = Bucket {
                    members: 0,
                    accumulators: self
                        .aggregates
                        .iter()
                        .map(|agg| agg.kind.accumulator(agg.source_type))
                        .collect(),
                };
                let slot = self.groups.try_insert(key, bucket, &self.name)?;
                self.positions.claim(slot)?;
                (slot, true)
            }
        };

        if let Some(bucket) = self.groups.get_at_mut(slot) {
            bucket.members += 1;
            for (acc, value) in bucket.accumulators.iter_mut().zip(contributions) {
                acc.add_value(value);
            }
        }

        if created {
            self.publish(TableUpdate::Add(slot));
            for column in self.group_columns.clone() {
                self.publish(TableUpdate::update(slot, column));
            }
        }
        Ok((slot, created))
    }

    /// Retire a row's contributions, destroying the group if it empties.
    ///
    /// Returns the slot and whether the group was removed.
    fn leave_group(&mut self, row: usize, state: &SourceRow) -> Result<(usize, bool)> {
        let slot = self.groups.slot_of(&state.key).ok_or(Error::RowNotFound(row))?;
        let bucket = self.groups.get_at_mut(slot).ok_or(Error::RowNotFound(row))?;
        bucket.members -= 1;
        for (acc, value) in bucket.accumulators.iter_mut().zip(&state.contributions) {
            acc.remove_value(value);
        }

        if bucket.members > 0 {
            return Ok((slot, false));
        }
        self.groups.remove(&state.key);
        self.positions.release(slot)?;
        self.publish(TableUpdate::Delete(slot));
        Ok((slot, true))
    }

    /// Replace a row's contribution to one aggregate with its current value.
    fn process_value(
        &mut self,
        source: &dyn ReactiveTable,
        row: usize,
        slot: usize,
        index: usize,
    ) -> Result<()> {
        let value = source.get_value(row, &self.aggregates[index].source_column)?;
        let state = self.source_rows.get_mut(&row).ok_or(Error::RowNotFound(row))?;
        let old = std::mem::replace(&mut state.contributions[index], value.clone());

        let bucket = self.groups.get_at_mut(slot).ok_or(Error::RowNotFound(row))?;
        let acc = &mut bucket.accumulators[index];
        acc.remove_value(&old);
        acc.add_value(&value);
        Ok(())
    }

    fn publish_aggregates(&mut self, slot: usize) {
        let names: Vec<String> = self.aggregates.iter().map(|a| a.name.clone()).collect();
        for name in names {
            self.publish(TableUpdate::update(slot, name));
        }
    }
}

impl ReactiveTable for AggregatedTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn row_count(&self) -> usize {
        self.groups.len()
    }

    fn get_value(&self, row: usize, column: &str) -> Result<ColumnValue> {
        if let Some(index) = self.group_columns.iter().position(|g| g == column) {
            return Ok(self
                .groups
                .key_at(row)
                .and_then(|key| key.value(index))
                .cloned()
                .unwrap_or(ColumnValue::Null));
        }
        if let Some(index) = self.aggregates.iter().position(|a| a.name == column) {
            return Ok(self
                .groups
                .get_at(row)
                .map(|bucket| bucket.accumulators[index].current_value())
                .unwrap_or(ColumnValue::Null));
        }
        Err(Error::UnknownColumn(column.to_string()))
    }

    fn row_at(&self, position: usize) -> Option<usize> {
        self.positions.row_at(position)
    }

    fn position_of(&self, row: usize) -> Option<usize> {
        self.positions.position_of(row)
    }

    fn row_indices(&self) -> Vec<usize> {
        self.positions.iter().collect()
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

impl Publisher for AggregatedTable {
    fn bus_mut(&mut self) -> &mut UpdateBus {
        &mut self.bus
    }
}

impl Drop for AggregatedTable {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for AggregatedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatedTable")
            .field("name", &self.name)
            .field("group_columns", &self.group_columns)
            .field("groups", &self.groups.len())
            .finish()
    }
}
