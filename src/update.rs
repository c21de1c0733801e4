/// Update Bus - synchronous change notification for reactive tables
///
/// Every table owns an [`UpdateBus`]: an ordered list of observers that are
/// invoked, in subscription order, on the mutator's call stack before the
/// mutating call returns. Observers receive a shared reference to the table
/// that changed so they can read the new state.
///
/// # Event contract
///
/// - `Add(row)` is delivered exactly once for a row before any `Update` or
///   `Delete` naming it.
/// - `Delete(row)` is terminal until the row index is handed out again.
/// - `Update { row, column }` means the field has a new value; read it back
///   through [`ReactiveTable::get_value`].
///
/// # Reentrancy
///
/// Dispatch is not reentrant-protected. A handler only sees `&dyn
/// ReactiveTable`, so it cannot mutate the publishing table through the
/// reference it is given; reaching the same table through another shared
/// handle while it is publishing panics on the `RefCell` borrow.

use crate::table::ReactiveTable;

/// A structured change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableUpdate {
    Add(usize),
    Update { row: usize, column: String },
    Delete(usize),
}

impl TableUpdate {
    pub fn update(row: usize, column: impl Into<String>) -> Self {
        TableUpdate::Update {
            row,
            column: column.into(),
        }
    }

    /// Returns the row index this event refers to
    pub fn row(&self) -> usize {
        match self {
            TableUpdate::Add(row) | TableUpdate::Delete(row) => *row,
            TableUpdate::Update { row, .. } => *row,
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            TableUpdate::Update { column, .. } => Some(column),
            _ => None,
        }
    }
}

/// Token returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

/// A subscriber callback.
pub type Observer = Box<dyn FnMut(&dyn ReactiveTable, &TableUpdate)>;

/// Ordered list of observers attached to one table.
#[derive(Default)]
pub struct UpdateBus {
    observers: Vec<(SubscriptionId, Observer)>,
    next_id: SubscriptionId,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Observer) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Remove an observer. Returns false if the token was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// Implemented by tables that own an update bus.
pub(crate) trait Publisher: ReactiveTable + Sized {
    fn bus_mut(&mut self) -> &mut UpdateBus;

    /// Deliver an event to every observer in subscription order.
    fn publish(&mut self, update: TableUpdate) {
        let mut observers = std::mem::take(&mut self.bus_mut().observers);
        for (_, observer) in observers.iter_mut() {
            observer(&*self, &update);
        }
        let bus = self.bus_mut();
        // Keep anything subscribed while the list was detached
        observers.append(&mut bus.observers);
        bus.observers = observers;
    }
}

/// Synthesize the events that rebuild `table`'s current state.
///
/// Emits, per live row in position order, `Add(row)` followed by one
/// `Update` for every column holding a value. Only `observer` sees them.
pub fn replay(table: &dyn ReactiveTable, observer: &mut dyn FnMut(&dyn ReactiveTable, &TableUpdate)) {
    let columns: Vec<String> = table
        .schema()
        .column_names()
        .iter()
        .map(|c| c.to_string())
        .collect();

    for row in table.row_indices() {
        observer(table, &TableUpdate::Add(row));
        for column in &columns {
            let has_value = table
                .get_value(row, column)
                .map(|v| !v.is_null())
                .unwrap_or(false);
            if has_value {
                observer(table, &TableUpdate::update(row, column.as_str()));
            }
        }
    }
}
