/// Cross-Thread Mirroring Example
///
/// This example demonstrates:
/// - A dispatch thread owning a destination table
/// - Mirroring a source table's current rows and live changes onto it
/// - Reading the mirrored result back when the thread is joined

use reactive_tables::{
    log_diagnostics, ColumnType, ColumnValue, DispatchThread, ReactiveTable, Result, Schema, Table,
    TableSynchronizer,
};
use std::cell::RefCell;
use std::rc::Rc;

fn schema() -> Schema {
    Schema::new(vec![
        ("symbol".to_string(), ColumnType::String),
        ("bid".to_string(), ColumnType::Float64),
        ("ask".to_string(), ColumnType::Float64),
    ])
}

fn main() -> Result<()> {
    println!("=== Reactive Tables Mirroring Example ===\n");

    let quotes = Rc::new(RefCell::new(Table::new("quotes".to_string(), schema())?));
    {
        let mut q = quotes.borrow_mut();
        for (symbol, bid, ask) in [("EURUSD", 1.0841, 1.0843), ("USDJPY", 151.20, 151.23)] {
            let row = q.add_row();
            q.set_value(row, "symbol", ColumnValue::String(symbol.to_string()))?;
            q.set_value(row, "bid", ColumnValue::Float64(bid))?;
            q.set_value(row, "ask", ColumnValue::Float64(ask))?;
        }
    }

    // 1. Start the thread that owns the mirror
    println!("1. Starting dispatch thread...");
    let thread = DispatchThread::spawn(
        || Table::new("mirror".to_string(), schema()),
        |mirror: &Table| {
            mirror
                .row_indices()
                .into_iter()
                .filter_map(|row| mirror.get_row(row).ok())
                .collect::<Vec<_>>()
        },
        log_diagnostics(),
    )?;

    // 2. Attach: existing rows are replayed first
    println!("2. Attaching synchronizer...");
    let mut sync = TableSynchronizer::attach(&quotes, thread.marshaller());

    // 3. Live changes follow in order
    println!("3. Ticking quotes...");
    {
        let mut q = quotes.borrow_mut();
        q.set_value(0, "bid", ColumnValue::Float64(1.0845))?;
        q.set_value(0, "ask", ColumnValue::Float64(1.0847))?;
        q.delete_row(1)?;
        let row = q.add_row();
        q.set_value(row, "symbol", ColumnValue::String("GBPUSD".to_string()))?;
    }

    sync.dispose();
    let mirrored = thread.join()?;

    println!("\n4. Mirror contents:");
    for row in &mirrored {
        let symbol = row.get("symbol").map(|v| v.to_string()).unwrap_or_default();
        let bid = row.get("bid").map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        let ask = row.get("ask").map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        println!("   {:<8} bid={} ask={}", symbol, bid, ask);
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
