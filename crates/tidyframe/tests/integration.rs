//! Black-box integration tests for tidyframe
//!
//! These tests run whole verb pipelines against grouped, row-wise and plain
//! tables.

use polars::prelude::*;
use tidyframe::{
    AggregatedResult, FunctionKind, GroupOptions, GroupOrder, Implementation, OperandKind,
    Registry, ScalarValue, SummariseGroups, Table, TidyError, Value, broadcast_pair, broadcast_to, call,
    col, if_else, lit, n, values, verbs,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scores() -> Table {
    Table::new(
        df! {
            "g" => &[1, 1, 2, 2],
            "x" => &[10, 20, 30, 40],
            "name" => &["a", "b", "c", "d"],
        }
        .unwrap(),
    )
}

fn ints(series: &Series) -> Vec<Option<i64>> {
    series
        .cast(&DataType::Int64)
        .unwrap()
        .i64()
        .unwrap()
        .into_iter()
        .collect()
}

fn floats(series: &Series) -> Vec<Option<f64>> {
    series
        .cast(&DataType::Float64)
        .unwrap()
        .f64()
        .unwrap()
        .into_iter()
        .collect()
}

fn strings(series: &Series) -> Vec<String> {
    series
        .str()
        .unwrap()
        .into_iter()
        .map(|s| s.unwrap_or("NA").to_string())
        .collect()
}

// ============ Aggregate-to-row ============

#[test]
fn sum_per_group_then_back_to_rows() {
    init();
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let x = table.get_column("x").unwrap();

    let totals = registry.dispatch_call("sum", &x, &[]).unwrap();
    let agg = totals.as_aggregated().unwrap();
    assert_eq!(agg.key_names(), &["g".to_string()]);
    assert_eq!(ints(agg.values()), vec![Some(30), Some(70)]);
    let key = agg.index()[1].clone();
    assert_eq!(agg.get(&key), Some(ScalarValue::Int(70)));

    let rows = broadcast_to(&totals, table.height(), table.grouping()).unwrap();
    assert_eq!(
        ints(&rows.to_series().unwrap()),
        vec![Some(30), Some(30), Some(70), Some(70)]
    );
}

#[test]
fn mutate_broadcasts_group_summaries() {
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let out = verbs::mutate(
        &table,
        &[
            ("share", col("x") / call("sum", [col("x")])),
            ("size", n()),
            ("pct", col("share") * lit(100)),
        ],
        &registry,
    )
    .unwrap();
    assert_eq!(
        floats(&out.pull("share").unwrap()),
        vec![Some(1.0 / 3.0), Some(2.0 / 3.0), Some(3.0 / 7.0), Some(4.0 / 7.0)]
    );
    let pct = floats(&out.pull("pct").unwrap());
    assert!((pct[3].unwrap() - 400.0 / 7.0).abs() < 1e-9);
    assert_eq!(
        ints(&out.pull("size").unwrap()),
        vec![Some(2), Some(2), Some(2), Some(2)]
    );
    assert!(out.is_grouped());
    // input untouched
    assert_eq!(table.width(), 3);
}

#[test]
fn mutate_follows_row_order_of_interleaved_groups() {
    let registry = Registry::with_builtins();
    let table = Table::new(df! { "g" => &["b", "a", "b", "a"], "x" => &[1, 2, 3, 4] }.unwrap())
        .group_by(&["g"], true)
        .unwrap();
    let out = verbs::mutate(
        &table,
        &[("total", call("sum", [col("x")])), ("run", call("cumsum", [col("x")]))],
        &registry,
    )
    .unwrap();
    assert_eq!(
        ints(&out.pull("total").unwrap()),
        vec![Some(4), Some(6), Some(4), Some(6)]
    );
    assert_eq!(
        ints(&out.pull("run").unwrap()),
        vec![Some(1), Some(2), Some(4), Some(6)]
    );
}

// ============ Filter ============

#[test]
fn filter_against_group_mean() {
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let out = verbs::filter(
        &table,
        &[col("x").gt(call("mean", [col("x")]))],
        &registry,
    )
    .unwrap();
    assert_eq!(strings(&out.pull("name").unwrap()), vec!["b", "d"]);
    assert_eq!(out.grouping().unwrap().sizes(), vec![1, 1]);
}

#[test]
fn filter_combines_conditions_and_drops_nulls() {
    let registry = Registry::with_builtins();
    let table = Table::new(df! { "x" => &[Some(1), None, Some(3), Some(4)] }.unwrap());
    let out = verbs::filter(
        &table,
        &[col("x").gt(lit(1)), col("x").lt(lit(4))],
        &registry,
    )
    .unwrap();
    assert_eq!(ints(&out.pull("x").unwrap()), vec![Some(3)]);

    let err = verbs::filter(&table, &[col("x")], &registry).unwrap_err();
    assert!(matches!(err, TidyError::TypeError { .. }));
}

#[test]
fn filter_rowwise_keeps_one_group_per_row() {
    let registry = Registry::with_builtins();
    let table = scores().row_wise(&["name"]).unwrap();
    let out = verbs::filter(&table, &[col("x").gt_eq(lit(20))], &registry).unwrap();
    assert!(out.is_rowwise());
    assert_eq!(out.grouping().unwrap().sizes(), vec![1, 1, 1]);
    assert_eq!(out.group_vars(), vec!["name".to_string()]);
}

// ============ Summarise ============

#[test]
fn summarise_drops_last_group_level() {
    init();
    let registry = Registry::with_builtins();
    let table = Table::new(
        df! {
            "a" => &[1, 1, 1, 2],
            "b" => &["x", "x", "y", "y"],
            "v" => &[1.0, 2.0, 3.0, 4.0],
        }
        .unwrap(),
    )
    .group_by(&["a", "b"], true)
    .unwrap();
    let out = verbs::summarise(
        &table,
        &[("m", call("mean", [col("v")])), ("twice", col("m") * lit(2))],
        SummariseGroups::DropLast,
        &registry,
    )
    .unwrap();
    assert_eq!(
        out.column_names(),
        vec!["a".to_string(), "b".to_string(), "m".to_string(), "twice".to_string()]
    );
    assert_eq!(floats(&out.pull("m").unwrap()), vec![Some(1.5), Some(3.0), Some(4.0)]);
    assert_eq!(floats(&out.pull("twice").unwrap()), vec![Some(3.0), Some(6.0), Some(8.0)]);
    assert_eq!(out.group_vars(), vec!["a".to_string()]);
    assert_eq!(out.grouping().unwrap().sizes(), vec![2, 1]);
}

#[test]
fn summarise_multi_row_results_keep_groups() {
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let out = verbs::summarise(
        &table,
        &[("x", call("rev", [col("x")])), ("total", call("sum", [col("x")]))],
        SummariseGroups::DropLast,
        &registry,
    )
    .unwrap();
    assert_eq!(ints(&out.pull("g").unwrap()), vec![Some(1), Some(1), Some(2), Some(2)]);
    assert_eq!(
        ints(&out.pull("x").unwrap()),
        vec![Some(20), Some(10), Some(40), Some(30)]
    );
    assert_eq!(
        ints(&out.pull("total").unwrap()),
        vec![Some(30), Some(30), Some(70), Some(70)]
    );
    assert_eq!(out.group_vars(), vec!["g".to_string()]);
}

#[test]
fn summarise_rejects_mismatched_sizes() {
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let err = verbs::summarise(
        &table,
        &[("x", col("x")), ("y", values(Series::new("y".into(), &[1, 2, 3])))],
        SummariseGroups::Drop,
        &registry,
    )
    .unwrap_err();
    assert!(matches!(err, TidyError::RecycleLength { .. }));
}

#[test]
fn summarise_ungrouped_gives_one_row() {
    let registry = Registry::with_builtins();
    let out = verbs::summarise(
        &scores(),
        &[("total", call("sum", [col("x")])), ("rows", n())],
        SummariseGroups::DropLast,
        &registry,
    )
    .unwrap();
    assert_eq!(out.height(), 1);
    assert_eq!(ints(&out.pull("total").unwrap()), vec![Some(100)]);
    assert_eq!(ints(&out.pull("rows").unwrap()), vec![Some(4)]);
}

#[test]
fn summarise_keeps_unobserved_factor_levels() {
    let registry = Registry::with_builtins();
    let table = Table::new(df! { "f" => &["lo", "lo"], "x" => &[1, 2] }.unwrap())
        .with_factor("f", &["lo", "hi"])
        .unwrap()
        .group_by(&["f"], false)
        .unwrap();
    let out = verbs::summarise(
        &table,
        &[("n", n()), ("total", call("sum", [col("x")]))],
        SummariseGroups::Drop,
        &registry,
    )
    .unwrap();
    assert_eq!(strings(&out.pull("f").unwrap()), vec!["lo", "hi"]);
    assert_eq!(ints(&out.pull("n").unwrap()), vec![Some(2), Some(0)]);
    assert_eq!(ints(&out.pull("total").unwrap()), vec![Some(3), Some(0)]);
}

fn dates(series: &Series) -> Vec<Option<i32>> {
    assert_eq!(series.dtype(), &DataType::Date);
    series.to_physical_repr().i32().unwrap().into_iter().collect()
}

#[test]
fn date_keys_survive_summarise() {
    let registry = Registry::with_builtins();
    let d = Series::new("d".into(), &[19000i32, 19000, 19001])
        .cast(&DataType::Date)
        .unwrap();
    let frame = DataFrame::new(vec![
        Column::from(d),
        Column::new("f".into(), &["lo", "lo", "lo"]),
        Column::new("x".into(), &[1, 2, 3]),
    ])
    .unwrap();

    let table = Table::new(frame.clone()).group_by(&["d"], true).unwrap();
    let keys = verbs::group_keys(&table).unwrap();
    assert_eq!(dates(&keys.pull("d").unwrap()), vec![Some(19000), Some(19001)]);
    let out = verbs::summarise(
        &table,
        &[("s", call("sum", [col("x")]))],
        SummariseGroups::Drop,
        &registry,
    )
    .unwrap();
    assert_eq!(dates(&out.pull("d").unwrap()), vec![Some(19000), Some(19001)]);
    assert_eq!(ints(&out.pull("s").unwrap()), vec![Some(3), Some(3)]);

    // an unobserved level leaves a group with no row to copy the date from
    let crossed = Table::new(frame)
        .with_factor("f", &["lo", "hi"])
        .unwrap()
        .group_by(&["d", "f"], false)
        .unwrap();
    let keys = verbs::group_keys(&crossed).unwrap();
    assert_eq!(
        dates(&keys.pull("d").unwrap()),
        vec![Some(19000), Some(19000), Some(19001), Some(19001)]
    );
    assert_eq!(strings(&keys.pull("f").unwrap()), vec!["lo", "hi", "lo", "hi"]);
}

// ============ Row-wise ============

#[test]
fn rowwise_aggregate_uses_override() {
    let registry = Registry::with_builtins();
    let table = scores().row_wise(&[]).unwrap();
    let out = verbs::mutate(&table, &[("s", call("sum", [col("x")]))], &registry).unwrap();
    assert_eq!(ints(&out.pull("s").unwrap()), ints(&out.pull("x").unwrap()));
}

#[test]
fn rowwise_aggregate_without_override_is_an_error() {
    let mut registry = Registry::new();
    registry
        .register(
            "total",
            FunctionKind::Aggregate,
            OperandKind::Array,
            Implementation::vector(|s, _| Ok(s.head(Some(1)))),
        )
        .unwrap();
    let table = scores().row_wise(&[]).unwrap();
    let err = verbs::mutate(&table, &[("s", call("total", [col("x")]))], &registry).unwrap_err();
    assert!(matches!(err, TidyError::RowwiseNotSupported { .. }));
}

// ============ Broadcasting ============

#[test]
fn grouped_columns_from_different_keys_do_not_mix() {
    let table = scores();
    let by_g = table.group_by(&["g"], true).unwrap().get_column("x").unwrap();
    let by_name = table.group_by(&["name"], true).unwrap().get_column("x").unwrap();
    let err = broadcast_pair(&by_g, &by_name).unwrap_err();
    assert!(matches!(err, TidyError::IncompatibleGrouper { .. }));
}

#[test]
fn grouped_self_broadcast_grows_size_one_groups() {
    let table = Table::new(df! { "a" => &[1, 2] }.unwrap())
        .group_by(&["a"], true)
        .unwrap();
    let out = table
        .set_column("b", Value::Array(Series::new("b".into(), &[1, 2])))
        .unwrap();
    assert_eq!(ints(&out.pull("a").unwrap()), vec![Some(1), Some(1), Some(2), Some(2)]);
    assert_eq!(ints(&out.pull("b").unwrap()), vec![Some(1), Some(2), Some(1), Some(2)]);
    assert_eq!(out.grouping().unwrap().sizes(), vec![2, 2]);
}

#[test]
fn aggregate_from_another_grouping_is_rejected() {
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let other = scores().group_by(&["name"], true).unwrap();
    let foreign = registry
        .dispatch_call("sum", &other.get_column("x").unwrap(), &[])
        .unwrap();
    let err = broadcast_to(&foreign, table.height(), table.grouping()).unwrap_err();
    assert!(matches!(err, TidyError::IncompatibleAggregate { .. }));
}

#[test]
fn if_else_over_groups() {
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let out = verbs::mutate(
        &table,
        &[(
            "top",
            if_else(
                col("x").eq(call("max", [col("x")])),
                lit("top"),
                lit("rest"),
            ),
        )],
        &registry,
    )
    .unwrap();
    assert_eq!(strings(&out.pull("top").unwrap()), vec!["rest", "top", "rest", "top"]);
}

// ============ Table verbs ============

#[test]
fn select_adds_missing_group_keys() {
    let table = scores().group_by(&["g"], true).unwrap();
    let out = verbs::select(&table, &["name"]).unwrap();
    assert_eq!(out.column_names(), vec!["g".to_string(), "name".to_string()]);
}

#[test]
fn rename_updates_group_vars() {
    let table = scores().group_by(&["g"], true).unwrap();
    let out = verbs::rename(&table, &[("g", "group")]).unwrap();
    assert_eq!(verbs::group_vars(&out), vec!["group".to_string()]);
    assert!(out.has_column("group"));
    assert!(matches!(
        verbs::rename(&table, &[("nope", "x2")]),
        Err(TidyError::ColumnNotFound(_))
    ));
}

#[test]
fn arrange_is_stable_with_nulls_last() {
    let table = Table::new(
        df! {
            "k" => &[Some(2), None, Some(1), Some(2)],
            "id" => &[1, 2, 3, 4],
        }
        .unwrap(),
    )
    .group_by(&["k"], true)
    .unwrap();
    let out = verbs::arrange(&table, &[("k", false)]).unwrap();
    assert_eq!(ints(&out.pull("id").unwrap()), vec![Some(3), Some(1), Some(4), Some(2)]);
    let desc = verbs::arrange(&table, &[("k", true)]).unwrap();
    assert_eq!(ints(&desc.pull("id").unwrap()), vec![Some(1), Some(4), Some(3), Some(2)]);
    assert_eq!(verbs::group_rows(&out), vec![vec![0], vec![1, 2], vec![3]]);
}

#[test]
fn group_information() {
    let table = scores().group_by(&["g"], true).unwrap();
    assert_eq!(verbs::n_groups(&table), 2);
    assert_eq!(verbs::group_size(&table), vec![2, 2]);
    assert_eq!(verbs::group_indices(&table), vec![0, 0, 1, 1]);
    assert_eq!(verbs::group_rows(&table), vec![vec![0, 1], vec![2, 3]]);
    let keys = verbs::group_keys(&table).unwrap();
    assert_eq!(ints(&keys.pull("g").unwrap()), vec![Some(1), Some(2)]);

    let plain = scores();
    assert_eq!(verbs::n_groups(&plain), 1);
    assert_eq!(verbs::group_size(&plain), vec![4]);
}

#[test]
fn first_appearance_order_is_configurable() {
    let table = Table::new(df! { "g" => &["b", "a", "b"] }.unwrap());
    let sorted = verbs::group_by(&table, &["g"], GroupOptions::new()).unwrap();
    let appearance = verbs::group_by(
        &table,
        &["g"],
        GroupOptions::new().with_order(GroupOrder::FirstAppearance),
    )
    .unwrap();
    let first = |t: &Table| strings(&verbs::group_keys(t).unwrap().pull("g").unwrap());
    assert_eq!(first(&sorted), vec!["a", "b"]);
    assert_eq!(first(&appearance), vec!["b", "a"]);
}

#[test]
fn partial_ungroup_keeps_remaining_keys() {
    let table = scores().group_by(&["g", "name"], true).unwrap();
    let out = verbs::ungroup(&table, &["name"]).unwrap();
    assert_eq!(out.group_vars(), vec!["g".to_string()]);
    assert!(verbs::ungroup(&out, &[]).unwrap().grouping().is_none());
}

#[test]
fn table_dispatch_per_column() {
    let registry = Registry::with_builtins();
    let table = Table::new(df! { "g" => &[1, 1, 2], "x" => &[1, 2, 3], "y" => &[4, 5, 6] }.unwrap())
        .group_by(&["g"], true)
        .unwrap();
    let out = registry
        .dispatch_call("max", &Value::Table(table), &[])
        .unwrap();
    let out = out.as_table().unwrap();
    assert_eq!(ints(&out.pull("x").unwrap()), vec![Some(2), Some(3)]);
    assert_eq!(ints(&out.pull("y").unwrap()), vec![Some(5), Some(6)]);
}

#[test]
fn aggregated_results_are_keyed() {
    let registry = Registry::with_builtins();
    let table = scores().group_by(&["g"], true).unwrap();
    let totals = registry
        .dispatch_call("sum", &table.get_column("x").unwrap(), &[])
        .unwrap();
    let two = Value::Scalar(ScalarValue::Int(2));
    let doubled = tidyframe::ops::binary(tidyframe::BinOp::Mul, &totals, &two).unwrap();
    let agg: &AggregatedResult = doubled.as_aggregated().unwrap();
    assert_eq!(ints(agg.values()), vec![Some(60), Some(140)]);
}

#[test]
fn group_slices_and_dropped_columns() {
    let table = scores().group_by(&["g"], true).unwrap();
    let second = table.group_slice(1).unwrap();
    assert!(!second.is_grouped());
    assert_eq!(strings(&second.pull("name").unwrap()), vec!["c", "d"]);

    let slim = table.drop_column("name").unwrap();
    assert_eq!(slim.column_names(), vec!["g".to_string(), "x".to_string()]);
    assert_eq!(slim.grouping().unwrap().sizes(), vec![2, 2]);
    assert!(matches!(
        table.drop_column("nope"),
        Err(TidyError::ColumnNotFound(_))
    ));
}
