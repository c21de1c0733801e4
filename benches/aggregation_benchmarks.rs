use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reactive_tables::wire::SharedBuffer;
use reactive_tables::*;
use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

fn trades() -> Rc<RefCell<Table>> {
    let schema = Schema::new(vec![
        ("desk".to_string(), ColumnType::Int32),
        ("qty".to_string(), ColumnType::Int64),
        ("price".to_string(), ColumnType::Float64),
    ]);
    Rc::new(RefCell::new(Table::new("trades".to_string(), schema).unwrap()))
}

fn fill(table: &Rc<RefCell<Table>>, size: usize) {
    let mut t = table.borrow_mut();
    for i in 0..size {
        let row = t.add_row();
        t.set_value(row, "desk", ColumnValue::Int32((i % 16) as i32)).unwrap();
        t.set_value(row, "qty", ColumnValue::Int64(i as i64)).unwrap();
        t.set_value(row, "price", ColumnValue::Float64(i as f64 * 0.25)).unwrap();
    }
}

fn bench_table_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_insert");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let table = trades();
                fill(&table, black_box(size));
            });
        });
    }
    group.finish();
}

fn bench_aggregated_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregated_insert");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let table = trades();
                let _agg = AggregatedTable::builder("by_desk")
                    .group_by("desk")
                    .aggregate("count", "qty", AggregateKind::Count)
                    .aggregate("total", "qty", AggregateKind::Sum)
                    .aggregate("avg_price", "price", AggregateKind::Average)
                    .aggregate("high", "price", AggregateKind::Max)
                    .build(&table)
                    .unwrap();
                fill(&table, black_box(size));
            });
        });
    }
    group.finish();
}

fn bench_aggregated_update(c: &mut Criterion) {
    let table = trades();
    fill(&table, 10000);
    let _agg = AggregatedTable::builder("by_desk")
        .group_by("desk")
        .aggregate("low", "price", AggregateKind::Min)
        .aggregate("high", "price", AggregateKind::Max)
        .build(&table)
        .unwrap();

    let mut n = 0usize;
    c.bench_function("aggregated_update_min_max", |b| {
        b.iter(|| {
            n = (n + 7919) % 10000;
            table
                .borrow_mut()
                .set_value(n, "price", ColumnValue::Float64(black_box(n as f64)))
                .unwrap();
        });
    });
}

fn bench_replication(c: &mut Criterion) {
    let mut group = c.benchmark_group("replication");

    for size in [100, 1000].iter() {
        let table = trades();
        fill(&table, *size);
        let mapping = FieldMapping::for_schema(table.borrow().schema());

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let buffer = SharedBuffer::new();
                let _encoder =
                    TableEncoder::setup(buffer.clone(), &table, mapping.clone(), log_diagnostics()).unwrap();

                let schema = table.borrow().schema().clone();
                let mut replica = Table::new("replica".to_string(), schema).unwrap();
                let mut decoder = TableDecoder::new(DecoderConfig::new(&mapping).unwrap());
                decoder.run(Cursor::new(buffer.take()), &mut replica).unwrap();
                black_box(replica.len())
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_table_insert,
    bench_aggregated_insert,
    bench_aggregated_update,
    bench_replication
);
criterion_main!(benches);
