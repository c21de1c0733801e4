/// Replication Example
///
/// This example demonstrates:
/// - Publishing a table over TCP with a shared field mapping
/// - A decoder thread rebuilding the table on the other end
/// - Remote rows mapped onto locally allocated rows

use reactive_tables::wire::SharedBuffer;
use reactive_tables::{
    log_diagnostics, ColumnType, ColumnValue, DecoderConfig, FieldMapping, ReactiveTable, Result,
    Schema, Table, TableDecoder, TableEncoder,
};
use std::cell::RefCell;
use std::io::Write;
use std::net::TcpListener;
use std::rc::Rc;

fn schema() -> Schema {
    Schema::new(vec![
        ("order_id".to_string(), ColumnType::Int64),
        ("side".to_string(), ColumnType::String),
        ("qty".to_string(), ColumnType::Int32),
    ])
    .with_unique("order_id")
}

fn main() -> Result<()> {
    println!("=== Reactive Tables Replication Example ===\n");

    let mapping = FieldMapping::new()
        .with_field("order_id", 1)
        .with_field("side", 2)
        .with_field("qty", 3);
    println!("Field mapping:\n{}\n", mapping.to_json()?);

    let orders = Rc::new(RefCell::new(Table::new("orders".to_string(), schema())?));
    let first = {
        let mut o = orders.borrow_mut();
        let row = o.add_row();
        o.set_value(row, "order_id", ColumnValue::Int64(1001))?;
        o.set_value(row, "side", ColumnValue::String("buy".to_string()))?;
        o.set_value(row, "qty", ColumnValue::Int32(100))?;
        row
    };

    // 1. Listen, and start a decoder that connects to us
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let decoder = TableDecoder::connect(
        addr,
        DecoderConfig::new(&mapping)?,
        || Table::new("replica".to_string(), schema()),
        |replica: &Table, _: &TableDecoder| replica.to_json(),
        log_diagnostics(),
    )?;
    let (mut socket, peer) = listener.accept()?;
    println!("1. Decoder connected from {}", peer);

    // 2. Encode into a buffer, then ship the buffered frames to the socket
    let buffer = SharedBuffer::new();
    let mut encoder = TableEncoder::setup(buffer.clone(), &orders, mapping, log_diagnostics())?;
    {
        let mut o = orders.borrow_mut();
        o.set_value(first, "qty", ColumnValue::Int32(80))?;
        let row = o.add_row();
        o.set_value(row, "order_id", ColumnValue::Int64(1002))?;
        o.set_value(row, "side", ColumnValue::String("sell".to_string()))?;
    }
    println!("2. Sending {} frames", encoder.frames_written());
    socket.write_all(&buffer.take())?;
    encoder.dispose();

    // 3. Closing the socket ends the stream; the decoder returns the replica
    drop(socket);
    let replica = decoder.join()??;
    println!("3. Replica:\n{}", replica);

    println!("\n=== Example Complete ===");
    Ok(())
}
