/// Cross-thread table mirroring.
///
/// A [`TableSynchronizer`] follows a source table and turns every event into
/// an owned [`TableAction`] that replays the change on a destination table.
/// Actions carry a snapshot of the new value, so they are `Send` and can be
/// applied on whichever thread owns the destination. Where they run is
/// decided by a [`Marshaller`]:
///
/// - [`ImmediateMarshaller`] applies them on the caller's stack
/// - [`QueueMarshaller`] pushes them onto a FIFO drained by a [`DispatchQueue`]
/// - [`DispatchThread`] owns a destination table on a dedicated thread
///
/// Destination rows use the source's row indices, so the mirrored table can
/// be addressed exactly like the source. One source feeds one FIFO, which
/// keeps its events in production order.

use crate::diagnostics::{log_diagnostics, Diagnostics};
use crate::error::{Error, Result};
use crate::table::{ReactiveTable, Table};
use crate::update::TableUpdate;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A change to apply to a destination table.
pub type TableAction = Box<dyn FnOnce(&mut Table) -> Result<()> + Send>;

/// Decides the execution context of posted actions.
///
/// Implementations must run the actions posted from one source in order.
pub trait Marshaller {
    fn post(&self, action: TableAction);
}

/// Cooperative stop flag shared between a loop and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Applies actions synchronously to a table on the current thread.
pub struct ImmediateMarshaller {
    target: Rc<RefCell<Table>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl ImmediateMarshaller {
    pub fn new(target: Rc<RefCell<Table>>) -> Self {
        ImmediateMarshaller {
            target,
            diagnostics: log_diagnostics(),
        }
    }

    pub fn with_diagnostics(target: Rc<RefCell<Table>>, diagnostics: Arc<dyn Diagnostics>) -> Self {
        ImmediateMarshaller { target, diagnostics }
    }
}

impl Marshaller for ImmediateMarshaller {
    fn post(&self, action: TableAction) {
        let result = action(&mut *self.target.borrow_mut());
        if let Err(err) = result {
            self.diagnostics.error("synchronizer", &err);
        }
    }
}

/// Sending half of a dispatch queue. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct QueueMarshaller {
    sender: Sender<TableAction>,
}

impl Marshaller for QueueMarshaller {
    fn post(&self, action: TableAction) {
        // A closed queue means the destination is gone; the action is moot.
        let _ = self.sender.send(action);
    }
}

/// Receiving half of a dispatch queue, drained by the destination's thread.
pub struct DispatchQueue {
    receiver: Receiver<TableAction>,
    diagnostics: Arc<dyn Diagnostics>,
}

/// Create a connected marshaller and queue.
pub fn dispatch_queue(diagnostics: Arc<dyn Diagnostics>) -> (QueueMarshaller, DispatchQueue) {
    let (sender, receiver) = mpsc::channel();
    (QueueMarshaller { sender }, DispatchQueue { receiver, diagnostics })
}

impl DispatchQueue {
    fn apply(&self, table: &mut Table, action: TableAction) {
        if let Err(err) = action(table) {
            self.diagnostics.error("synchronizer", &err);
        }
    }

    /// Apply every action already queued. Returns how many ran.
    pub fn pump(&self, table: &mut Table) -> usize {
        let mut applied = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(action) => {
                    self.apply(table, action);
                    applied += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return applied,
            }
        }
    }

    /// Apply actions as they arrive until `stop` is raised or every sender is gone.
    ///
    /// The stop flag is checked at least once per `poll`. Actions queued when
    /// the stop is observed are still applied.
    pub fn run_until(&self, table: &mut Table, stop: &StopSignal, poll: Duration) {
        while !stop.is_raised() {
            match self.receiver.recv_timeout(poll) {
                Ok(action) => self.apply(table, action),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
        self.pump(table);
    }
}

/// A thread owning one destination table fed by a dispatch queue.
pub struct DispatchThread<R> {
    marshaller: QueueMarshaller,
    stop: StopSignal,
    handle: JoinHandle<Result<R>>,
}

impl<R: Send + 'static> DispatchThread<R> {
    const POLL: Duration = Duration::from_millis(20);

    /// Start the thread. `factory` builds the destination table on it, and
    /// `finish` turns the final table into the value returned by `join`.
    pub fn spawn<F, G>(factory: F, finish: G, diagnostics: Arc<dyn Diagnostics>) -> Result<Self>
    where
        F: FnOnce() -> Result<Table> + Send + 'static,
        G: FnOnce(&Table) -> R + Send + 'static,
    {
        let (marshaller, queue) = dispatch_queue(diagnostics);
        let stop = StopSignal::new();
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("table-dispatch".to_string())
            .spawn(move || {
                let mut table = factory()?;
                queue.run_until(&mut table, &thread_stop, Self::POLL);
                Ok(finish(&table))
            })?;

        Ok(DispatchThread {
            marshaller,
            stop,
            handle,
        })
    }

    pub fn marshaller(&self) -> QueueMarshaller {
        self.marshaller.clone()
    }

    /// Apply what is queued, stop the thread and return `finish`'s value.
    pub fn join(self) -> Result<R> {
        self.stop.raise();
        self.handle
            .join()
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::Other, "dispatch thread panicked")))?
    }
}

fn snapshot(source: &dyn ReactiveTable, update: &TableUpdate) -> Result<TableAction> {
    let action: TableAction = match update {
        TableUpdate::Add(row) => {
            let row = *row;
            Box::new(move |t: &mut Table| t.add_row_at(row))
        }
        TableUpdate::Update { row, column } => {
            let row = *row;
            let column = column.clone();
            let value = source.get_value(row, &column)?;
            if value.is_null() {
                Box::new(move |t: &mut Table| t.clear_value(row, &column).map(|_| ()))
            } else {
                Box::new(move |t: &mut Table| t.set_value(row, &column, value))
            }
        }
        TableUpdate::Delete(row) => {
            let row = *row;
            Box::new(move |t: &mut Table| t.delete_row(row).map(|_| ()))
        }
    };
    Ok(action)
}

/// Mirrors a source table's events through a marshaller.
pub struct TableSynchronizer {
    detach: Option<Box<dyn FnOnce()>>,
}

impl TableSynchronizer {
    /// Follow `source`, first posting its current rows, then every change.
    pub fn attach<T, M>(source: &Rc<RefCell<T>>, marshaller: M) -> Self
    where
        T: ReactiveTable + ?Sized + 'static,
        M: Marshaller + 'static,
    {
        Self::attach_with(source, marshaller, log_diagnostics())
    }

    pub fn attach_with<T, M>(
        source: &Rc<RefCell<T>>,
        marshaller: M,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self
    where
        T: ReactiveTable + ?Sized + 'static,
        M: Marshaller + 'static,
    {
        let marshaller = Rc::new(marshaller);

        {
            let src = source.borrow();
            src.replay_rows(&mut |table, update| match snapshot(table, update) {
                Ok(action) => marshaller.post(action),
                Err(err) => diagnostics.error("synchronizer", &err),
            });
        }

        let forward = marshaller.clone();
        let id = source.borrow_mut().subscribe(Box::new(move |table, update| {
            match snapshot(table, update) {
                Ok(action) => forward.post(action),
                Err(err) => diagnostics.error("synchronizer", &err),
            }
        }));

        let weak_source = Rc::downgrade(source);
        TableSynchronizer {
            detach: Some(Box::new(move || {
                if let Some(src) = weak_source.upgrade() {
                    src.borrow_mut().unsubscribe(id);
                }
            })),
        }
    }

    /// Stop mirroring. Already posted actions still run.
    pub fn dispose(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.detach.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnType, ColumnValue};
    use crate::table::Schema;
    use std::collections::HashMap;

    fn schema() -> Schema {
        Schema::new(vec![
            ("id".to_string(), ColumnType::Int32),
            ("price".to_string(), ColumnType::Float64),
        ])
    }

    fn new_table(name: &str) -> Rc<RefCell<Table>> {
        Rc::new(RefCell::new(Table::new(name.to_string(), schema()).unwrap()))
    }

    fn snapshot_rows(table: &dyn ReactiveTable) -> Vec<(usize, HashMap<String, ColumnValue>)> {
        table
            .row_indices()
            .into_iter()
            .map(|row| (row, table.get_row(row).unwrap()))
            .collect()
    }

    #[test]
    fn test_add_update_delete_are_mirrored() {
        let source = new_table("source");
        let target = new_table("target");
        let _sync = TableSynchronizer::attach(&source, ImmediateMarshaller::new(target.clone()));

        let (a, b) = {
            let mut s = source.borrow_mut();
            let a = s.add_row();
            s.set_value(a, "id", ColumnValue::Int32(1)).unwrap();
            let b = s.add_row();
            s.set_value(b, "price", ColumnValue::Float64(2.5)).unwrap();
            (a, b)
        };
        assert_eq!(target.borrow().row_count(), 2);
        assert_eq!(target.borrow().get_value(a, "id").unwrap(), ColumnValue::Int32(1));
        assert_eq!(target.borrow().get_value(b, "price").unwrap(), ColumnValue::Float64(2.5));

        source.borrow_mut().set_value(a, "id", ColumnValue::Int32(7)).unwrap();
        assert_eq!(target.borrow().get_value(a, "id").unwrap(), ColumnValue::Int32(7));

        source.borrow_mut().delete_row(a).unwrap();
        assert_eq!(target.borrow().row_count(), 1);
        assert_eq!(snapshot_rows(&*target.borrow()), snapshot_rows(&*source.borrow()));
    }

    #[test]
    fn test_cleared_field_is_mirrored() {
        let source = new_table("source");
        let target = new_table("target");
        let diagnostics = Arc::new(crate::diagnostics::RecordingDiagnostics::default());
        let _sync = TableSynchronizer::attach_with(
            &source,
            ImmediateMarshaller::with_diagnostics(target.clone(), diagnostics.clone()),
            diagnostics.clone(),
        );

        let row = source.borrow_mut().add_row();
        source.borrow_mut().set_value(row, "price", ColumnValue::Float64(9.5)).unwrap();
        source.borrow_mut().clear_value(row, "price").unwrap();

        assert!(target.borrow().get_value(row, "price").unwrap().is_null());
        assert!(diagnostics.errors().is_empty());
    }

    #[test]
    fn test_attach_replays_existing_rows() {
        let source = new_table("source");
        {
            let mut s = source.borrow_mut();
            for i in 0..3 {
                let row = s.add_row();
                s.set_value(row, "id", ColumnValue::Int32(i)).unwrap();
            }
            s.delete_row(1).unwrap();
        }
        let target = new_table("target");
        let _sync = TableSynchronizer::attach(&source, ImmediateMarshaller::new(target.clone()));

        assert_eq!(target.borrow().row_indices(), vec![0, 2]);
        assert_eq!(snapshot_rows(&*target.borrow()), snapshot_rows(&*source.borrow()));
    }

    #[test]
    fn test_dispose_stops_mirroring() {
        let source = new_table("source");
        let target = new_table("target");
        let mut sync = TableSynchronizer::attach(&source, ImmediateMarshaller::new(target.clone()));
        source.borrow_mut().add_row();

        sync.dispose();
        assert!(sync.is_disposed());
        source.borrow_mut().add_row();
        assert_eq!(target.borrow().row_count(), 1);
        assert_eq!(source.borrow().subscriber_count(), 0);
    }

    #[test]
    fn test_queue_marshaller_defers_until_pumped() {
        let source = new_table("source");
        let (marshaller, queue) = dispatch_queue(log_diagnostics());
        let _sync = TableSynchronizer::attach(&source, marshaller);

        let row = source.borrow_mut().add_row();
        source.borrow_mut().set_value(row, "price", ColumnValue::Float64(1.0)).unwrap();
        source.borrow_mut().set_value(row, "price", ColumnValue::Float64(2.0)).unwrap();

        let mut target = Table::new("target".to_string(), schema()).unwrap();
        assert_eq!(target.row_count(), 0);
        assert_eq!(queue.pump(&mut target), 3);
        assert_eq!(target.get_value(row, "price").unwrap(), ColumnValue::Float64(2.0));
        assert_eq!(queue.pump(&mut target), 0);
    }

    #[test]
    fn test_dispatch_thread_mirrors_in_order() {
        let source = new_table("source");
        let thread = DispatchThread::spawn(
            || Table::new("mirror".to_string(), schema()),
            |table: &Table| {
                table
                    .row_indices()
                    .into_iter()
                    .map(|row| table.get_value(row, "id").unwrap())
                    .collect::<Vec<_>>()
            },
            log_diagnostics(),
        )
        .unwrap();
        let mut sync = TableSynchronizer::attach(&source, thread.marshaller());

        {
            let mut s = source.borrow_mut();
            for i in 0..100 {
                let row = s.add_row();
                s.set_value(row, "id", ColumnValue::Int32(i)).unwrap();
                s.set_value(row, "id", ColumnValue::Int32(i * 10)).unwrap();
            }
            for row in (0..100).step_by(2) {
                s.delete_row(row).unwrap();
            }
        }
        sync.dispose();

        let ids = thread.join().unwrap();
        let expected: Vec<ColumnValue> = (0..100)
            .filter(|i| i % 2 == 1)
            .map(|i| ColumnValue::Int32(i * 10))
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_every_type_crosses_threads() {
        use crate::column::Decimal;
        use chrono::TimeZone;

        let values = vec![
            ("a".to_string(), ColumnValue::Int16(-3)),
            ("b".to_string(), ColumnValue::Int32(70_000)),
            ("c".to_string(), ColumnValue::Int64(-1 << 40)),
            ("d".to_string(), ColumnValue::Float32(1.5)),
            ("e".to_string(), ColumnValue::Float64(-0.125)),
            ("f".to_string(), ColumnValue::String("text".to_string())),
            ("g".to_string(), ColumnValue::Bool(false)),
            ("h".to_string(), ColumnValue::Decimal(Decimal::new(-995, 1))),
            ("i".to_string(), ColumnValue::DateTime(chrono::Utc.with_ymd_and_hms(2001, 9, 9, 1, 46, 40).unwrap())),
            ("j".to_string(), ColumnValue::Duration(chrono::Duration::seconds(90))),
            ("k".to_string(), ColumnValue::Uuid(uuid::Uuid::from_u128(42))),
            ("l".to_string(), ColumnValue::Byte(7)),
            ("m".to_string(), ColumnValue::Char(0x263A)),
        ];
        let schema = Schema::new(
            values
                .iter()
                .filter_map(|(name, value)| value.column_type().map(|ty| (name.clone(), ty)))
                .collect(),
        );
        assert_eq!(schema.len(), values.len());

        let source = Rc::new(RefCell::new(Table::new("source".to_string(), schema.clone()).unwrap()));
        let thread = DispatchThread::spawn(
            move || Table::new("mirror".to_string(), schema),
            |table: &Table| table.get_row(0).unwrap(),
            log_diagnostics(),
        )
        .unwrap();
        let _sync = TableSynchronizer::attach(&source, thread.marshaller());

        {
            let mut s = source.borrow_mut();
            let row = s.add_row();
            for (name, value) in &values {
                s.set_value(row, name, value.clone()).unwrap();
            }
        }

        let mirrored = thread.join().unwrap();
        assert_eq!(mirrored, values.into_iter().collect::<HashMap<_, _>>());
    }

    #[test]
    fn test_failed_action_is_reported() {
        let target = new_table("target");
        let diagnostics = Arc::new(crate::diagnostics::RecordingDiagnostics::default());
        let marshaller = ImmediateMarshaller::with_diagnostics(target.clone(), diagnostics.clone());

        marshaller.post(Box::new(|t: &mut Table| t.delete_row(3).map(|_| ())));
        assert_eq!(diagnostics.errors(), vec!["error [synchronizer] Row 3 not found".to_string()]);
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.is_raised());
        stop.raise();
        assert!(other.is_raised());
    }
}
