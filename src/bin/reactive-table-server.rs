/// Reactive table replication server
///
/// Publishes a demo `trades` table that ticks twice a second. Every client
/// receives its own per-symbol summary, aggregated incrementally from the
/// shared trades table and streamed as length-prefixed frames.

use reactive_tables::server::{ServerConfig, TcpServer};
use reactive_tables::{
    log_diagnostics, AggregateKind, AggregatedTable, ColumnType, ColumnValue, Diagnostics, ReactiveTable, Result,
    Schema, Table,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;

const SYMBOLS: [&str; 4] = ["AAPL", "MSFT", "NVDA", "TSLA"];

fn demo_trades() -> Result<Rc<RefCell<Table>>> {
    let schema = Schema::new(vec![
        ("symbol".to_string(), ColumnType::String),
        ("price".to_string(), ColumnType::Float64),
        ("qty".to_string(), ColumnType::Int64),
    ]);
    let mut trades = Table::new("trades".to_string(), schema)?;
    for (i, symbol) in SYMBOLS.iter().enumerate() {
        let row = trades.add_row();
        trades.set_value(row, "symbol", ColumnValue::String(symbol.to_string()))?;
        trades.set_value(row, "price", ColumnValue::Float64(100.0 + 10.0 * i as f64))?;
        trades.set_value(row, "qty", ColumnValue::Int64(10))?;
    }
    Ok(Rc::new(RefCell::new(trades)))
}

/// Book a new trade and retire the oldest once the table holds 32 rows.
fn tick(trades: &Rc<RefCell<Table>>, n: u64) -> Result<()> {
    let mut t = trades.borrow_mut();
    let symbol = SYMBOLS[(n % SYMBOLS.len() as u64) as usize];
    let row = t.add_row();
    t.set_value(row, "symbol", ColumnValue::String(symbol.to_string()))?;
    t.set_value(row, "price", ColumnValue::Float64(100.0 + (n % 17) as f64 * 0.5))?;
    t.set_value(row, "qty", ColumnValue::Int64(1 + (n % 5) as i64))?;
    if t.len() > 32 {
        if let Some(oldest) = t.row_at(0) {
            t.delete_row(oldest)?;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = ServerConfig::from_env()?;
    let diagnostics = log_diagnostics();

    LocalSet::new()
        .run_until(async move {
            let trades = demo_trades()?;

            let ticker = trades.clone();
            let tick_diagnostics = diagnostics.clone();
            tokio::task::spawn_local(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(500));
                for n in 0u64.. {
                    interval.tick().await;
                    if let Err(err) = tick(&ticker, n) {
                        tick_diagnostics.error("ticker", &err);
                    }
                }
            });

            let mut server = TcpServer::new(config.clone(), diagnostics);
            if let Some(mapping) = config.load_mapping()? {
                server = server.with_mapping(mapping);
            }
            let listener = server.bind().await?;

            let source = trades.clone();
            server
                .serve(
                    listener,
                    move |session| {
                        let summary = AggregatedTable::builder(format!("summary-{}", session.id))
                            .group_by("symbol")
                            .aggregate("trades", "qty", AggregateKind::Count)
                            .aggregate("volume", "qty", AggregateKind::Sum)
                            .aggregate("avg_price", "price", AggregateKind::Average)
                            .aggregate("high", "price", AggregateKind::Max)
                            .build(&source)?;
                        Ok(summary as Rc<RefCell<dyn ReactiveTable>>)
                    },
                    async {
                        let _ = tokio::signal::ctrl_c().await;
                    },
                )
                .await
        })
        .await
}
