/// Incremental Aggregation Example
///
/// This example demonstrates:
/// - Grouping a table by a column with Count, Sum, Average, Min and Max
/// - Watching the aggregated table's own update stream
/// - Groups moving, shrinking and disappearing as source rows change

use reactive_tables::{
    AggregateKind, AggregatedTable, ColumnType, ColumnValue, ReactiveTable, Result, Schema, Table,
    TableUpdate,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

fn print_groups(stats: &AggregatedTable) -> Result<()> {
    for slot in stats.row_indices() {
        println!(
            "   {:<8} count={} sum={} avg={:.2} min={} max={}",
            stats.get_value(slot, "name")?,
            stats.get_value(slot, "count")?,
            stats.get_value(slot, "sum")?,
            stats.get_value(slot, "average")?.as_f64().unwrap_or(0.0),
            stats.get_value(slot, "min")?,
            stats.get_value(slot, "max")?,
        );
    }
    println!();
    Ok(())
}

fn main() -> Result<()> {
    println!("=== Reactive Tables Grouped Scores Example ===\n");

    // 1. Create the source table
    let schema = Schema::new(vec![
        ("name".to_string(), ColumnType::String),
        ("value".to_string(), ColumnType::Int32),
    ]);
    let scores = Rc::new(RefCell::new(Table::new("scores".to_string(), schema)?));

    // 2. Declare the aggregation
    let stats = AggregatedTable::builder("stats")
        .group_by("name")
        .aggregate("count", "value", AggregateKind::Count)
        .aggregate("sum", "value", AggregateKind::Sum)
        .aggregate("average", "value", AggregateKind::Average)
        .aggregate("min", "value", AggregateKind::Min)
        .aggregate("max", "value", AggregateKind::Max)
        .build(&scores)?;

    stats.borrow_mut().subscribe(Box::new(|table, update| match update {
        TableUpdate::Add(slot) => println!("   + group {}", slot),
        TableUpdate::Update { row, column } => {
            if let Ok(value) = table.get_value(*row, column) {
                println!("   ~ group {} {} = {}", row, column, value);
            }
        }
        TableUpdate::Delete(slot) => println!("   - group {}", slot),
    }));

    // 3. Insert rows
    println!("1. Inserting scores...");
    let mut rows = Vec::new();
    for (name, value) in [
        ("Mendel", 42),
        ("Marie", 43),
        ("Mendel", 44),
        ("Marie", 45),
        ("Mendel", 46),
        ("Marie", 45),
    ] {
        let mut row = HashMap::new();
        row.insert("name".to_string(), ColumnValue::String(name.to_string()));
        row.insert("value".to_string(), ColumnValue::Int32(value));
        rows.push(scores.borrow_mut().append_row(row)?);
    }
    println!();
    print_groups(&stats.borrow())?;

    // 4. Move a row to another group
    println!("2. Renaming one of Mendel's rows to Ada...");
    scores
        .borrow_mut()
        .set_value(rows[0], "name", ColumnValue::String("Ada".to_string()))?;
    println!();
    print_groups(&stats.borrow())?;

    // 5. Delete the only member of a group
    println!("3. Deleting Ada's row...");
    scores.borrow_mut().delete_row(rows[0])?;
    println!();
    print_groups(&stats.borrow())?;

    println!("=== Example Complete ===");
    Ok(())
}
