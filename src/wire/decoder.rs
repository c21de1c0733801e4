/// Applies a replication stream to a local table.
///
/// Remote row ids are mapped to local rows allocated on `Add`; the mapping is
/// dropped on `Delete`. A field sent without a value is emptied. Anything that cannot be applied (an unknown field id,
/// a value of the wrong type, a row id the peer never added) is a fatal
/// protocol error for the stream.

use super::config::DecoderConfig;
use super::frame::{FieldValue, FrameRead, FrameReader, WireRecord};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::sync::StopSignal;
use crate::table::{ReactiveTable, Table};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct TableDecoder {
    config: DecoderConfig,
    rows: HashMap<u64, usize>,
    stop: StopSignal,
    frames: u64,
}

impl TableDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        TableDecoder {
            config,
            rows: HashMap::new(),
            stop: StopSignal::new(),
            frames: 0,
        }
    }

    /// Raising the signal makes [`run`](Self::run) return at its next poll.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Local row currently standing for a remote row id.
    pub fn local_row(&self, remote: u64) -> Option<usize> {
        self.rows.get(&remote).copied()
    }

    pub fn remote_row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    pub fn apply_record(&mut self, table: &mut Table, record: WireRecord) -> Result<()> {
        match record {
            WireRecord::Add { row_id, fields } => {
                if self.rows.contains_key(&row_id) {
                    return Err(Error::DuplicateRemoteRow(row_id));
                }
                let row = table.add_row();
                self.rows.insert(row_id, row);
                self.apply_fields(table, row, fields)
            }
            WireRecord::Update { row_id, fields } => {
                let row = self.local_row(row_id).ok_or(Error::UnknownRemoteRow(row_id))?;
                self.apply_fields(table, row, fields)
            }
            WireRecord::Delete { row_id } => {
                let row = self.rows.remove(&row_id).ok_or(Error::UnknownRemoteRow(row_id))?;
                table.delete_row(row)?;
                Ok(())
            }
        }
    }

    fn apply_fields(&self, table: &mut Table, row: usize, fields: Vec<FieldValue>) -> Result<()> {
        for field in fields {
            let column = self
                .config
                .fields
                .column(field.field_id)
                .ok_or(Error::UnknownFieldId(field.field_id))?;
            match field.value {
                Some(value) => table.set_value(row, column, value.into_column()?)?,
                None => {
                    table.clear_value(row, column)?;
                }
            }
        }
        Ok(())
    }

    /// Read frames into `table` until the stream closes or the stop signal
    /// is raised.
    ///
    /// The reader should time out periodically (`WouldBlock`/`TimedOut`) so
    /// the stop signal is noticed.
    pub fn run<R: Read>(&mut self, reader: R, table: &mut Table) -> Result<()> {
        self.config.fields.check_schema(table.schema())?;
        let mut frames = FrameReader::new(reader, self.config.max_frame_len);
        while !self.stop.is_raised() {
            match frames.next_frame()? {
                FrameRead::Frame(records) => {
                    for record in records {
                        self.apply_record(table, record)?;
                    }
                    self.frames += 1;
                }
                FrameRead::Idle => {}
                FrameRead::Closed => break,
            }
        }
        Ok(())
    }

    /// Decode `reader` on a dedicated thread.
    ///
    /// `factory` builds the destination table on that thread; `finish` maps
    /// the final table to the value returned by [`DecoderHandle::dispose`].
    pub fn setup<R, F, G, Out>(
        config: DecoderConfig,
        reader: R,
        factory: F,
        finish: G,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<DecoderHandle<Out>>
    where
        R: Read + Send + 'static,
        F: FnOnce() -> Result<Table> + Send + 'static,
        G: FnOnce(&Table, &TableDecoder) -> Out + Send + 'static,
        Out: Send + 'static,
    {
        let mut decoder = TableDecoder::new(config);
        let stop = decoder.stop_signal();

        let handle = thread::Builder::new()
            .name("table-decoder".to_string())
            .spawn(move || {
                let mut table = factory()?;
                match decoder.run(reader, &mut table) {
                    Ok(()) => {
                        diagnostics.info(
                            "decoder",
                            &format!("stream finished after {} frames", decoder.frames_read()),
                        );
                        Ok(finish(&table, &decoder))
                    }
                    Err(err) => {
                        if err.is_disconnect() {
                            diagnostics.info("decoder", &format!("peer went away: {}", err));
                        } else {
                            diagnostics.error("decoder", &err);
                        }
                        Err(err)
                    }
                }
            })?;

        Ok(DecoderHandle { stop, handle })
    }

    /// Connect to a publishing peer and decode its stream on a thread.
    pub fn connect<A, F, G, Out>(
        addr: A,
        config: DecoderConfig,
        factory: F,
        finish: G,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<DecoderHandle<Out>>
    where
        A: ToSocketAddrs,
        F: FnOnce() -> Result<Table> + Send + 'static,
        G: FnOnce(&Table, &TableDecoder) -> Out + Send + 'static,
        Out: Send + 'static,
    {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(config.poll_interval))?;
        if let Ok(peer) = stream.peer_addr() {
            diagnostics.info("decoder", &format!("connected to {}", peer));
        }
        Self::setup(config, stream, factory, finish, diagnostics)
    }
}

/// A decoder running on its own thread.
pub struct DecoderHandle<Out> {
    stop: StopSignal,
    handle: JoinHandle<Result<Out>>,
}

impl<Out> DecoderHandle<Out> {
    /// Ask the thread to stop at its next poll.
    pub fn stop(&self) {
        self.stop.raise();
    }

    /// True once the stream has ended or failed.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread. Does not stop it; call [`stop`](Self::stop) first
    /// to end a stream that is still open.
    pub fn join(self) -> Result<Out> {
        self.handle
            .join()
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::Other, "decoder thread panicked")))?
    }

    /// Stop the thread and return what `finish` produced.
    pub fn dispose(self) -> Result<Out> {
        self.stop();
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateKind, AggregatedTable};
    use crate::column::{ColumnType, ColumnValue, Decimal};
    use crate::diagnostics::{log_diagnostics, RecordingDiagnostics};
    use crate::sync::{ImmediateMarshaller, TableSynchronizer};
    use crate::table::Schema;
    use crate::wire::config::FieldMapping;
    use crate::wire::encoder::{SharedBuffer, TableEncoder};
    use crate::wire::frame::{encode_frame, WireValue};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;
    use uuid::Uuid;

    fn all_types_schema() -> Schema {
        Schema::new(vec![
            ("i16".to_string(), ColumnType::Int16),
            ("i32".to_string(), ColumnType::Int32),
            ("i64".to_string(), ColumnType::Int64),
            ("f32".to_string(), ColumnType::Float32),
            ("f64".to_string(), ColumnType::Float64),
            ("text".to_string(), ColumnType::String),
            ("flag".to_string(), ColumnType::Bool),
            ("amount".to_string(), ColumnType::Decimal),
            ("at".to_string(), ColumnType::DateTime),
            ("span".to_string(), ColumnType::Duration),
            ("id".to_string(), ColumnType::Uuid),
            ("byte".to_string(), ColumnType::Byte),
            ("ch".to_string(), ColumnType::Char),
        ])
    }

    fn sample_values() -> Vec<(&'static str, ColumnValue)> {
        vec![
            ("i16", ColumnValue::Int16(-7)),
            ("i32", ColumnValue::Int32(1 << 20)),
            ("i64", ColumnValue::Int64(i64::MIN)),
            ("f32", ColumnValue::Float32(0.5)),
            ("f64", ColumnValue::Float64(-2.75)),
            ("text", ColumnValue::String("héllo".to_string())),
            ("flag", ColumnValue::Bool(true)),
            ("amount", ColumnValue::Decimal(Decimal::new(12345, 2))),
            ("at", ColumnValue::DateTime(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap())),
            ("span", ColumnValue::Duration(chrono::Duration::milliseconds(-2500))),
            ("id", ColumnValue::Uuid(Uuid::from_u128(0x1234_5678_9abc_def0))),
            ("byte", ColumnValue::Byte(255)),
            ("ch", ColumnValue::Char('Z' as u16)),
        ]
    }

    fn new_table(name: &str) -> Table {
        Table::new(name.to_string(), all_types_schema()).unwrap()
    }

    fn decoder_for(schema: &Schema) -> TableDecoder {
        TableDecoder::new(DecoderConfig::new(&FieldMapping::for_schema(schema)).unwrap())
    }

    #[test]
    fn test_every_type_survives_the_wire() {
        let source = Rc::new(RefCell::new(new_table("source")));
        let mapping = FieldMapping::for_schema(source.borrow().schema());
        let buffer = SharedBuffer::new();
        let _encoder = TableEncoder::setup(buffer.clone(), &source, mapping, log_diagnostics()).unwrap();

        let row = {
            let mut t = source.borrow_mut();
            let row = t.add_row();
            for (column, value) in sample_values() {
                t.set_value(row, column, value).unwrap();
            }
            row
        };

        let mut local = new_table("local");
        let mut decoder = decoder_for(local.schema());
        decoder.run(Cursor::new(buffer.take()), &mut local).unwrap();

        let local_row = decoder.local_row(row as u64).unwrap();
        for (column, value) in sample_values() {
            assert_eq!(local.get_value(local_row, column).unwrap(), value, "column {}", column);
        }
        assert_eq!(decoder.frames_read(), 1 + sample_values().len() as u64);
    }

    #[test]
    fn test_delete_and_reuse_of_remote_ids() {
        let mut local = new_table("local");
        let mut decoder = decoder_for(local.schema());

        decoder
            .apply_record(&mut local, WireRecord::Add { row_id: 40, fields: vec![] })
            .unwrap();
        decoder.apply_record(&mut local, WireRecord::Delete { row_id: 40 }).unwrap();
        assert_eq!(local.row_count(), 0);
        assert_eq!(decoder.local_row(40), None);

        // A deleted remote id may be added again
        decoder
            .apply_record(
                &mut local,
                WireRecord::Add {
                    row_id: 40,
                    fields: vec![FieldValue::set(2, WireValue::Int32(3))],
                },
            )
            .unwrap();
        let row = decoder.local_row(40).unwrap();
        assert_eq!(local.get_value(row, "i32").unwrap(), ColumnValue::Int32(3));

        decoder
            .apply_record(
                &mut local,
                WireRecord::Update { row_id: 40, fields: vec![FieldValue::clear(2)] },
            )
            .unwrap();
        assert!(local.get_value(row, "i32").unwrap().is_null());
        assert!(matches!(
            decoder.apply_record(
                &mut local,
                WireRecord::Update { row_id: 40, fields: vec![FieldValue::clear(404)] },
            ),
            Err(Error::UnknownFieldId(404))
        ));
    }

    #[test]
    fn test_protocol_violations_are_errors() {
        let mut local = new_table("local");
        let mut decoder = decoder_for(local.schema());

        assert!(matches!(
            decoder.apply_record(&mut local, WireRecord::Update { row_id: 1, fields: vec![] }),
            Err(Error::UnknownRemoteRow(1))
        ));
        assert!(matches!(
            decoder.apply_record(&mut local, WireRecord::Delete { row_id: 2 }),
            Err(Error::UnknownRemoteRow(2))
        ));

        decoder
            .apply_record(&mut local, WireRecord::Add { row_id: 5, fields: vec![] })
            .unwrap();
        assert!(matches!(
            decoder.apply_record(&mut local, WireRecord::Add { row_id: 5, fields: vec![] }),
            Err(Error::DuplicateRemoteRow(5))
        ));

        let unknown_field = WireRecord::Update {
            row_id: 5,
            fields: vec![FieldValue::set(999, WireValue::Bool(false))],
        };
        assert!(matches!(
            decoder.apply_record(&mut local, unknown_field),
            Err(Error::UnknownFieldId(999))
        ));

        // Field 1 is the Int16 column
        let wrong_type = WireRecord::Update {
            row_id: 5,
            fields: vec![FieldValue::set(1, WireValue::String("x".to_string()))],
        };
        assert!(matches!(
            decoder.apply_record(&mut local, wrong_type),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_run_rejects_mapping_for_other_schema() {
        let mut local = new_table("local");
        let mapping = FieldMapping::new().with_field("missing", 1);
        let mut decoder = TableDecoder::new(DecoderConfig::new(&mapping).unwrap());
        assert!(matches!(
            decoder.run(Cursor::new(Vec::new()), &mut local),
            Err(Error::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_setup_runs_on_thread_and_reports_failure() {
        let schema = all_types_schema();
        let config = DecoderConfig::new(&FieldMapping::for_schema(&schema)).unwrap();

        let mut good = encode_frame(&[WireRecord::Add {
            row_id: 1,
            fields: vec![FieldValue::set(7, WireValue::Bool(true))],
        }])
        .unwrap();
        good.extend(encode_frame(&[WireRecord::Add { row_id: 2, fields: vec![] }]).unwrap());

        let handle = TableDecoder::setup(
            config.clone(),
            Cursor::new(good),
            || Ok(new_table("local")),
            |table: &Table, decoder: &TableDecoder| (table.row_count(), decoder.remote_row_count()),
            log_diagnostics(),
        )
        .unwrap();
        assert_eq!(handle.join().unwrap(), (2, 2));

        let bad = encode_frame(&[WireRecord::Delete { row_id: 77 }]).unwrap();
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let handle = TableDecoder::setup(
            config,
            Cursor::new(bad),
            || Ok(new_table("local")),
            |table: &Table, _: &TableDecoder| table.row_count(),
            diagnostics.clone(),
        )
        .unwrap();
        assert!(matches!(handle.join(), Err(Error::UnknownRemoteRow(77))));
        assert_eq!(diagnostics.errors(), vec!["error [decoder] Unknown remote row 77".to_string()]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(i32),
        Set(usize, i32),
        ClearName(usize),
        Delete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<i32>().prop_map(Op::Add),
            (any::<usize>(), any::<i32>()).prop_map(|(i, v)| Op::Set(i, v)),
            any::<usize>().prop_map(Op::ClearName),
            any::<usize>().prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_decoded_table_matches_source(ops in prop::collection::vec(op(), 1..60)) {
            let schema = Schema::new(vec![
                ("qty".to_string(), ColumnType::Int32),
                ("name".to_string(), ColumnType::String),
            ]);
            let source = Rc::new(RefCell::new(Table::new("source".to_string(), schema.clone()).unwrap()));

            // Part of the history exists before the encoder attaches
            let (before, after) = ops.split_at(ops.len() / 2);
            let apply = |ops: &[Op]| {
                let mut t = source.borrow_mut();
                for op in ops {
                    let rows = t.row_indices();
                    match op {
                        Op::Add(v) => {
                            let row = t.add_row();
                            t.set_value(row, "qty", ColumnValue::Int32(*v)).unwrap();
                            t.set_value(row, "name", ColumnValue::String(format!("n{}", v))).unwrap();
                        }
                        Op::Set(i, v) if !rows.is_empty() => {
                            t.set_value(rows[i % rows.len()], "qty", ColumnValue::Int32(*v)).unwrap();
                        }
                        Op::ClearName(i) if !rows.is_empty() => {
                            t.clear_value(rows[i % rows.len()], "name").unwrap();
                        }
                        Op::Delete(i) if !rows.is_empty() => {
                            t.delete_row(rows[i % rows.len()]).unwrap();
                        }
                        _ => {}
                    }
                }
            };

            apply(before);
            let buffer = SharedBuffer::new();
            let _encoder = TableEncoder::setup(
                buffer.clone(),
                &source,
                FieldMapping::for_schema(&schema),
                log_diagnostics(),
            ).unwrap();
            apply(after);

            let mut local = Table::new("local".to_string(), schema.clone()).unwrap();
            let mut decoder = decoder_for(&schema);
            decoder.run(Cursor::new(buffer.take()), &mut local).unwrap();

            let src = source.borrow();
            prop_assert_eq!(local.row_count(), src.row_count());
            prop_assert_eq!(decoder.remote_row_count(), src.row_count());
            for row in src.row_indices() {
                let local_row = decoder.local_row(row as u64);
                prop_assert!(local_row.is_some());
                prop_assert_eq!(local.get_row(local_row.unwrap()).unwrap(), src.get_row(row).unwrap());
            }
        }
    }

    #[derive(Debug, Clone)]
    enum GroupOp {
        Add(i32, i32, i64),
        SetValue(usize, i32),
        SetGroup(usize, i32),
        ClearValue(usize),
        Delete(usize),
    }

    fn group_op() -> impl Strategy<Value = GroupOp> {
        prop_oneof![
            (0..3i32, -50..50i32, -10_000..10_000i64).prop_map(|(g, v, c)| GroupOp::Add(g, v, c)),
            (any::<usize>(), -50..50i32).prop_map(|(i, v)| GroupOp::SetValue(i, v)),
            (any::<usize>(), 0..3i32).prop_map(|(i, g)| GroupOp::SetGroup(i, g)),
            any::<usize>().prop_map(GroupOp::ClearValue),
            any::<usize>().prop_map(GroupOp::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_aggregated_replicas_follow_source(ops in prop::collection::vec(group_op(), 1..50)) {
            let schema = Schema::new(vec![
                ("g".to_string(), ColumnType::Int32),
                ("v".to_string(), ColumnType::Int32),
                ("amount".to_string(), ColumnType::Decimal),
            ]);
            let source = Rc::new(RefCell::new(Table::new("source".to_string(), schema).unwrap()));
            let agg = AggregatedTable::builder("by_g")
                .group_by("g")
                .aggregate("count", "v", AggregateKind::Count)
                .aggregate("sum", "v", AggregateKind::Sum)
                .aggregate("min", "v", AggregateKind::Min)
                .aggregate("max", "v", AggregateKind::Max)
                .aggregate("amount", "amount", AggregateKind::Sum)
                .build(&source)
                .unwrap();
            let agg_schema = agg.borrow().schema().clone();

            let diagnostics = Arc::new(RecordingDiagnostics::default());
            let mirror = Rc::new(RefCell::new(Table::new("mirror".to_string(), agg_schema.clone()).unwrap()));
            let _sync = TableSynchronizer::attach_with(
                &agg,
                ImmediateMarshaller::with_diagnostics(mirror.clone(), diagnostics.clone()),
                diagnostics.clone(),
            );
            let mapping = FieldMapping::for_schema(&agg_schema);
            let buffer = SharedBuffer::new();
            let _encoder = TableEncoder::setup(buffer.clone(), &agg, mapping.clone(), diagnostics.clone()).unwrap();

            for op in ops {
                let mut t = source.borrow_mut();
                let live = t.row_indices();
                let pick = |i: usize| live.get(i % live.len().max(1)).copied();
                match op {
                    GroupOp::Add(g, v, cents) => {
                        let row = t.add_row();
                        t.set_value(row, "g", ColumnValue::Int32(g)).unwrap();
                        t.set_value(row, "v", ColumnValue::Int32(v)).unwrap();
                        let amount = Decimal::new(cents as i128, cents.rem_euclid(3) as u8);
                        t.set_value(row, "amount", ColumnValue::Decimal(amount)).unwrap();
                    }
                    GroupOp::SetValue(i, v) => if let Some(row) = pick(i) {
                        t.set_value(row, "v", ColumnValue::Int32(v)).unwrap();
                    },
                    GroupOp::SetGroup(i, g) => if let Some(row) = pick(i) {
                        t.set_value(row, "g", ColumnValue::Int32(g)).unwrap();
                    },
                    GroupOp::ClearValue(i) => if let Some(row) = pick(i) {
                        t.clear_value(row, "v").unwrap();
                    },
                    GroupOp::Delete(i) => if let Some(row) = pick(i) {
                        t.delete_row(row).unwrap();
                    },
                }
            }

            let mut remote = Table::new("remote".to_string(), agg_schema.clone()).unwrap();
            let mut decoder = TableDecoder::new(DecoderConfig::new(&mapping).unwrap());
            decoder.run(Cursor::new(buffer.take()), &mut remote).unwrap();

            prop_assert!(diagnostics.errors().is_empty());
            let a = agg.borrow();
            let m = mirror.borrow();
            prop_assert_eq!(m.row_indices(), a.row_indices());
            prop_assert_eq!(remote.row_count(), a.row_count());
            for slot in a.row_indices() {
                let expected = a.get_row(slot).unwrap();
                prop_assert_eq!(&m.get_row(slot).unwrap(), &expected);
                let local = decoder.local_row(slot as u64);
                prop_assert!(local.is_some());
                prop_assert_eq!(&remote.get_row(local.unwrap()).unwrap(), &expected);
            }
        }
    }
}
