/// Reactive Tables - in-memory columnar tables that publish their changes
///
/// Tables hold typed columns and notify subscribers of every add, update and
/// delete, in order. On top of that stream the crate builds incrementally
/// maintained group-by aggregations, cross-thread mirrors and a binary
/// replication protocol over TCP.

pub mod error;
pub mod column;
pub mod rows;
pub mod update;
pub mod table;
pub mod indexed;
pub mod aggregate;
pub mod diagnostics;
pub mod sync;
pub mod wire;

pub use error::{Error, Result};
pub use column::{Column, ColumnType, ColumnValue, Decimal, ValueKey};
pub use rows::RowManager;
pub use update::{replay, Observer, SubscriptionId, TableUpdate, UpdateBus};
pub use table::{ReactiveTable, Schema, Table};
pub use indexed::IndexedDictionary;
pub use aggregate::{
    Accumulator, AggregateKind, AggregatedTable, AggregatedTableBuilder, GroupByKey,
};
pub use diagnostics::{log_diagnostics, Diagnostics, LogDiagnostics};
pub use sync::{
    dispatch_queue, DispatchQueue, DispatchThread, ImmediateMarshaller, Marshaller, QueueMarshaller,
    StopSignal, TableAction, TableSynchronizer,
};
pub use wire::{DecoderConfig, FieldMapping, TableDecoder, TableEncoder};

// TCP server - only when server feature is enabled
#[cfg(feature = "server")]
pub mod server;
