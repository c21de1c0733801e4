/// Publishes a table's update stream as frames on a byte stream.
///
/// On setup the encoder writes one `Add` frame per live row, carrying the
/// row's current mapped values inline, so a new peer starts from the full
/// current state. It then writes one frame per event:
/// - `Add(row)` becomes `Add { row_id, fields }` with whatever values are set
/// - `Update(row, column)` becomes a one-field `Update` if the column is
///   mapped, with no value when the field was emptied
/// - `Delete(row)` becomes `Delete { row_id }`
///
/// The first write failure marks the encoder broken: the writer is dropped,
/// the failure is reported and later events are ignored.

use super::config::FieldMapping;
use super::frame::{write_frame, FieldValue, WireRecord, WireValue};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::table::ReactiveTable;
use crate::update::TableUpdate;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::Arc;

struct EncoderState {
    writer: Option<Box<dyn Write>>,
    mapping: FieldMapping,
    diagnostics: Arc<dyn Diagnostics>,
    frames: u64,
    error: Option<Error>,
}

impl EncoderState {
    fn record_for(&self, table: &dyn ReactiveTable, update: &TableUpdate) -> Result<Option<WireRecord>> {
        Ok(match update {
            TableUpdate::Add(row) => {
                let mut fields = Vec::new();
                for (column, field_id) in self.mapping.columns() {
                    if let Some(value) = WireValue::from_column(&table.get_value(*row, column)?) {
                        fields.push(FieldValue::set(field_id, value));
                    }
                }
                Some(WireRecord::Add {
                    row_id: *row as u64,
                    fields,
                })
            }
            TableUpdate::Update { row, column } => {
                let Some(field_id) = self.mapping.field_id(column) else {
                    return Ok(None);
                };
                Some(WireRecord::Update {
                    row_id: *row as u64,
                    fields: vec![FieldValue::from_column(field_id, &table.get_value(*row, column)?)],
                })
            }
            TableUpdate::Delete(row) => Some(WireRecord::Delete { row_id: *row as u64 }),
        })
    }

    fn handle(&mut self, table: &dyn ReactiveTable, update: &TableUpdate) {
        if self.writer.is_none() {
            return;
        }
        let result = match self.record_for(table, update) {
            Ok(Some(record)) => self.write(&[record]),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.fail(err);
        }
    }

    fn write(&mut self, records: &[WireRecord]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::NotConnected, "encoder closed")))?;
        write_frame(writer, records)?;
        writer.flush()?;
        self.frames += 1;
        Ok(())
    }

    fn fail(&mut self, err: Error) {
        if err.is_disconnect() {
            self.diagnostics.info("encoder", &format!("peer went away: {}", err));
        } else {
            self.diagnostics.error("encoder", &err);
        }
        self.writer = None;
        self.error = Some(err);
    }
}

/// A table subscription that writes frames to a stream.
pub struct TableEncoder {
    state: Rc<RefCell<EncoderState>>,
    detach: Option<Box<dyn FnOnce()>>,
}

impl TableEncoder {
    /// Replay `table` into `writer`, then follow its updates.
    ///
    /// Fails if the mapping is invalid for the table or the replay cannot be
    /// written; in both cases nothing stays subscribed.
    pub fn setup<W, T>(
        writer: W,
        table: &Rc<RefCell<T>>,
        mapping: FieldMapping,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<TableEncoder>
    where
        W: Write + 'static,
        T: ReactiveTable + ?Sized + 'static,
    {
        mapping.validate()?;
        mapping.check_schema(table.borrow().schema())?;

        let state = Rc::new(RefCell::new(EncoderState {
            writer: Some(Box::new(writer)),
            mapping,
            diagnostics,
            frames: 0,
            error: None,
        }));

        {
            let source = table.borrow();
            let mut st = state.borrow_mut();
            // Add frames already carry every value, so replayed updates are redundant
            source.replay_rows(&mut |src, update| {
                if let TableUpdate::Add(_) = update {
                    st.handle(src, update);
                }
            });
            if let Some(err) = st.error.take() {
                return Err(err);
            }
        }

        let sink = state.clone();
        let id = table
            .borrow_mut()
            .subscribe(Box::new(move |src, update| sink.borrow_mut().handle(src, update)));

        let weak = Rc::downgrade(table);
        Ok(TableEncoder {
            state,
            detach: Some(Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    table.borrow_mut().unsubscribe(id);
                }
            })),
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.state.borrow().frames
    }

    /// True once a write has failed or the encoder was disposed.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().writer.is_none()
    }

    /// The failure that broke the encoder, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.state.borrow_mut().error.take()
    }

    /// Unsubscribe and release the stream. Must not be called from inside a
    /// table event.
    pub fn dispose(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
        let mut state = self.state.borrow_mut();
        if let Some(mut writer) = state.writer.take() {
            // Best effort; the stream is being released anyway
            let _ = writer.flush();
        }
    }
}

impl Drop for TableEncoder {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An in-memory byte sink that can be read while an encoder writes to it.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything written so far.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnType, ColumnValue};
    use crate::diagnostics::{log_diagnostics, RecordingDiagnostics};
    use crate::table::{Schema, Table};
    use crate::wire::frame::{FrameRead, FrameReader};
    use std::io::Cursor;

    fn quotes() -> Rc<RefCell<Table>> {
        let schema = Schema::new(vec![
            ("symbol".to_string(), ColumnType::String),
            ("bid".to_string(), ColumnType::Float64),
            ("internal".to_string(), ColumnType::Int32),
        ]);
        Rc::new(RefCell::new(Table::new("quotes".to_string(), schema).unwrap()))
    }

    fn mapping() -> FieldMapping {
        FieldMapping::new().with_field("symbol", 1).with_field("bid", 2)
    }

    fn read_all(bytes: Vec<u8>) -> Vec<WireRecord> {
        let mut reader = FrameReader::new(Cursor::new(bytes), 1 << 20);
        let mut records = Vec::new();
        while let FrameRead::Frame(mut frame) = reader.next_frame().unwrap() {
            records.append(&mut frame);
        }
        records
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_setup_replays_rows_with_inline_values() {
        let table = quotes();
        let row = {
            let mut t = table.borrow_mut();
            let row = t.add_row();
            t.set_value(row, "symbol", ColumnValue::String("XYZ".to_string())).unwrap();
            t.set_value(row, "internal", ColumnValue::Int32(5)).unwrap();
            row
        };

        let buffer = SharedBuffer::new();
        let encoder = TableEncoder::setup(buffer.clone(), &table, mapping(), log_diagnostics()).unwrap();
        assert_eq!(encoder.frames_written(), 1);
        assert_eq!(
            read_all(buffer.take()),
            vec![WireRecord::Add {
                row_id: row as u64,
                fields: vec![FieldValue::set(1, WireValue::String("XYZ".to_string()))],
            }]
        );
    }

    #[test]
    fn test_live_events_become_frames() {
        let table = quotes();
        let buffer = SharedBuffer::new();
        let _encoder = TableEncoder::setup(buffer.clone(), &table, mapping(), log_diagnostics()).unwrap();

        let row = {
            let mut t = table.borrow_mut();
            let row = t.add_row();
            t.set_value(row, "bid", ColumnValue::Float64(1.25)).unwrap();
            t.set_value(row, "internal", ColumnValue::Int32(1)).unwrap();
            t.delete_row(row).unwrap();
            row as u64
        };

        assert_eq!(
            read_all(buffer.take()),
            vec![
                WireRecord::Add { row_id: row, fields: vec![] },
                WireRecord::Update {
                    row_id: row,
                    fields: vec![FieldValue::set(2, WireValue::Float64(1.25))],
                },
                WireRecord::Delete { row_id: row },
            ]
        );
    }

    #[test]
    fn test_emptied_field_is_sent_without_value() {
        let table = quotes();
        let row = {
            let mut t = table.borrow_mut();
            let row = t.add_row();
            t.set_value(row, "bid", ColumnValue::Float64(3.0)).unwrap();
            row as u64
        };
        let buffer = SharedBuffer::new();
        let _encoder = TableEncoder::setup(buffer.clone(), &table, mapping(), log_diagnostics()).unwrap();
        buffer.take();

        table.borrow_mut().clear_value(row as usize, "bid").unwrap();
        table.borrow_mut().clear_value(row as usize, "internal").unwrap();
        assert_eq!(
            read_all(buffer.take()),
            vec![WireRecord::Update { row_id: row, fields: vec![FieldValue::clear(2)] }]
        );
    }

    #[test]
    fn test_write_failure_breaks_encoder() {
        let table = quotes();
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let encoder = TableEncoder::setup(BrokenPipe, &table, mapping(), diagnostics.clone()).unwrap();

        table.borrow_mut().add_row();
        assert!(encoder.is_closed());
        assert!(encoder.take_error().unwrap().is_disconnect());
        // Disconnects are not errors
        assert!(diagnostics.errors().is_empty());

        table.borrow_mut().add_row();
        assert_eq!(encoder.frames_written(), 0);
    }

    #[test]
    fn test_setup_rejects_bad_mapping() {
        let table = quotes();
        let bad = FieldMapping::new().with_field("nope", 1);
        assert!(matches!(
            TableEncoder::setup(SharedBuffer::new(), &table, bad, log_diagnostics()),
            Err(Error::UnknownColumn(_))
        ));

        table.borrow_mut().add_row();
        let failed = TableEncoder::setup(BrokenPipe, &table, mapping(), log_diagnostics());
        assert!(failed.is_err());
        assert_eq!(table.borrow().subscriber_count(), 0);
    }

    #[test]
    fn test_dispose_unsubscribes() {
        let table = quotes();
        let buffer = SharedBuffer::new();
        let mut encoder = TableEncoder::setup(buffer.clone(), &table, mapping(), log_diagnostics()).unwrap();
        assert_eq!(table.borrow().subscriber_count(), 1);

        encoder.dispose();
        assert!(encoder.is_closed());
        assert_eq!(table.borrow().subscriber_count(), 0);
        table.borrow_mut().add_row();
        assert!(buffer.is_empty());
    }
}
