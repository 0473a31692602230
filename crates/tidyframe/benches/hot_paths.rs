use criterion::{Criterion, black_box, criterion_group, criterion_main};
use polars::df;
use tidyframe::{Registry, SummariseGroups, Table, broadcast_to, call, col, lit, verbs};

fn large_grouped_table() -> Table {
    let table = Table::new(
        df! {
            "g" => (0..10_000).map(|n| n % 100).collect::<Vec<i32>>(),
            "x" => (0..10_000).collect::<Vec<i32>>(),
            "y" => (0..10_000).map(|n| f64::from(n) * 0.5).collect::<Vec<f64>>(),
        }
        .unwrap(),
    );
    table.group_by(&["g"], true).unwrap()
}

fn bench_group_by(c: &mut Criterion) {
    let table = Table::new(large_grouped_table().ungroup().into_frame());

    c.bench_function("group_by_100_groups", |b| {
        b.iter(|| black_box(&table).group_by(&["g"], true).unwrap())
    });
}

fn bench_expand_aggregate(c: &mut Criterion) {
    let registry = Registry::with_builtins();
    let table = large_grouped_table();
    let totals = registry
        .dispatch_call("sum", &table.get_column("x").unwrap(), &[])
        .unwrap();

    c.bench_function("broadcast_aggregate_to_rows", |b| {
        b.iter(|| broadcast_to(black_box(&totals), table.height(), table.grouping()).unwrap())
    });
}

fn bench_mutate(c: &mut Criterion) {
    let registry = Registry::with_builtins();
    let table = large_grouped_table();
    let columns = [
        ("dx", col("x") - call("mean", [col("x")])),
        ("big", col("y").gt(lit(100.0))),
    ];

    c.bench_function("mutate_grouped", |b| {
        b.iter(|| verbs::mutate(black_box(&table), &columns, &registry).unwrap())
    });
}

fn bench_summarise(c: &mut Criterion) {
    let registry = Registry::with_builtins();
    let table = large_grouped_table();
    let columns = [
        ("total", call("sum", [col("x")])),
        ("spread", call("sd", [col("y")])),
    ];

    c.bench_function("summarise_grouped", |b| {
        b.iter(|| {
            verbs::summarise(
                black_box(&table),
                &columns,
                SummariseGroups::Drop,
                &registry,
            )
            .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_group_by,
    bench_expand_aggregate,
    bench_mutate,
    bench_summarise
);
criterion_main!(benches);
