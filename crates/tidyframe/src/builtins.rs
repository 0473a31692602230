//! Builtin functions registered by [`Registry::with_builtins`].
//!
//! Aggregates take `na_rm` as their first argument (default false): with
//! nulls present and `na_rm` false they return null.

use polars::prelude::*;
use polars_ops::series::RoundMode;

use crate::dispatch::{FunctionKind, Implementation, Registration, Registry, VectorFn};
use crate::error::{Result, TidyError};
use crate::ops::evaluate;
use crate::value::{GroupedColumn, OperandKind, ScalarValue, Value};

const VALUE: &str = "value";

/// Evaluate `build(col("value"))` over a single vector.
fn with_expr(series: &Series, build: impl FnOnce(Expr) -> Expr) -> Result<Series> {
    evaluate(vec![series.clone().with_name(VALUE.into())], build(col(VALUE)))
}

fn scalar_arg<'a>(args: &'a [Value], at: usize, function: &str) -> Result<Option<&'a ScalarValue>> {
    match args.get(at) {
        None => Ok(None),
        Some(Value::Scalar(s)) => Ok(Some(s)),
        Some(other) => Err(TidyError::ArgError(format!(
            "argument {} of `{function}()` must be a scalar, got {}",
            at + 1,
            other.kind()
        ))),
    }
}

fn na_rm(args: &[Value], function: &str) -> Result<bool> {
    match scalar_arg(args, 0, function)? {
        None | Some(ScalarValue::Null) => Ok(false),
        Some(s) => s.as_bool().ok_or_else(|| {
            TidyError::ArgError(format!("`na_rm` of `{function}()` must be TRUE or FALSE"))
        }),
    }
}

fn int_arg(args: &[Value], at: usize, function: &str, default: i64) -> Result<i64> {
    match scalar_arg(args, at, function)? {
        None => Ok(default),
        Some(s) => s.as_i64().ok_or_else(|| {
            TidyError::ArgError(format!(
                "argument {} of `{function}()` must be a whole number",
                at + 1
            ))
        }),
    }
}

fn aggregate<F>(function: &'static str, build: F) -> VectorFn
where
    F: Fn(Expr) -> Expr + Send + Sync + 'static,
{
    std::sync::Arc::new(move |series: &Series, args: &[Value]| {
        let out = with_expr(series, &build)?;
        if series.null_count() > 0 && !na_rm(args, function)? {
            return Ok(Series::full_null(VALUE.into(), 1, out.dtype()));
        }
        Ok(out)
    })
}

/// Aggregates see their input with nulls dropped when `na_rm` is set.
fn aggregate_dropping<F>(function: &'static str, build: F) -> VectorFn
where
    F: Fn(Expr) -> Expr + Send + Sync + 'static,
{
    aggregate(function, move |e| build(e.drop_nulls()))
}

/// Positional picks never turn into null because of other nulls; `na_rm`
/// only skips them.
fn positional<F>(function: &'static str, build: F) -> VectorFn
where
    F: Fn(Expr) -> Expr + Send + Sync + 'static,
{
    std::sync::Arc::new(move |series: &Series, args: &[Value]| {
        let drop = na_rm(args, function)?;
        with_expr(series, |e| build(if drop { e.drop_nulls() } else { e }))
    })
}

fn transform<F>(build: F) -> VectorFn
where
    F: Fn(Expr, &[Value]) -> Result<Expr> + Send + Sync + 'static,
{
    std::sync::Arc::new(move |series: &Series, args: &[Value]| {
        let expr = build(col(VALUE), args)?;
        with_expr(series, |_| expr)
    })
}

/// Row-wise override: each row is its own group, so the aggregate is
/// computed per row and the result stays row-aligned.
fn rowwise(f: VectorFn) -> Implementation {
    Implementation::operand(move |operand: &Value, args: &[Value]| {
        let Value::Grouped(column) = operand else {
            return Err(TidyError::type_error(
                "row-wise column",
                operand.kind().to_string(),
            ));
        };
        let grouping = column.grouping();
        let mut parts = Vec::with_capacity(grouping.n_groups());
        for group in 0..grouping.n_groups() {
            parts.push(f(&column.group_values(group)?, args)?);
        }
        let mut idx = vec![0 as IdxSize; grouping.n_rows()];
        for (g, rows) in grouping.group_index().values().enumerate() {
            for &row in rows {
                idx[row as usize] = g as IdxSize;
            }
        }
        let stacked = crate::dispatch::concat(parts, column.values())?;
        let values = stacked.take(&IdxCa::from_vec(PlSmallStr::EMPTY, idx))?;
        Ok(Value::Grouped(GroupedColumn::new(values, grouping.clone())?))
    })
}

fn define_aggregate(registry: &mut Registry, name: &str, f: VectorFn) {
    registry.define(
        name,
        FunctionKind::Aggregate,
        OperandKind::Array,
        Registration::new(Implementation::Vector(f.clone())),
    );
    registry.define(
        name,
        FunctionKind::Aggregate,
        OperandKind::RowwiseColumn,
        Registration::new(rowwise(f)),
    );
}

fn define(registry: &mut Registry, name: &str, kind: FunctionKind, f: VectorFn) {
    registry.define(
        name,
        kind,
        OperandKind::Array,
        Registration::new(Implementation::Vector(f)),
    );
}

pub(crate) fn register_builtins(registry: &mut Registry) {
    define_aggregate(registry, "sum", aggregate_dropping("sum", |e| e.sum()));
    define_aggregate(registry, "mean", aggregate_dropping("mean", |e| e.mean()));
    define_aggregate(registry, "median", aggregate_dropping("median", |e| e.median()));
    define_aggregate(registry, "min", aggregate_dropping("min", |e| e.min()));
    define_aggregate(registry, "max", aggregate_dropping("max", |e| e.max()));
    define_aggregate(registry, "sd", aggregate_dropping("sd", |e| e.std(1)));
    define_aggregate(registry, "var", aggregate_dropping("var", |e| e.var(1)));
    define_aggregate(registry, "first", positional("first", |e| e.first()));
    define_aggregate(registry, "last", positional("last", |e| e.last()));
    // counts never turn into null
    define_aggregate(
        registry,
        "length",
        std::sync::Arc::new(|series: &Series, _: &[Value]| {
            with_expr(series, |e| e.len().cast(DataType::Int64))
        }),
    );
    define_aggregate(
        registry,
        "n_distinct",
        std::sync::Arc::new(|series: &Series, args: &[Value]| {
            let drop = na_rm(args, "n_distinct")?;
            with_expr(series, |e| {
                let e = if drop { e.drop_nulls() } else { e };
                e.n_unique().cast(DataType::Int64)
            })
        }),
    );

    let kind = FunctionKind::Transform;
    define(registry, "cumsum", kind, transform(|e, _| Ok(e.cum_sum(false))));
    define(registry, "cummax", kind, transform(|e, _| Ok(e.cum_max(false))));
    define(registry, "cummin", kind, transform(|e, _| Ok(e.cum_min(false))));
    define(registry, "abs", kind, transform(|e, _| Ok(e.abs())));
    define(
        registry,
        "round",
        kind,
        transform(|e, args| {
            let digits = int_arg(args, 0, "round", 0)?;
            let digits = u32::try_from(digits).map_err(|_| {
                TidyError::ArgError(format!("`round()` digits must be >= 0, got {digits}"))
            })?;
            Ok(e.round(digits, RoundMode::HalfToEven))
        }),
    );
    define(
        registry,
        "lag",
        kind,
        transform(|e, args| Ok(e.shift(lit(int_arg(args, 0, "lag", 1)?)))),
    );
    define(
        registry,
        "lead",
        kind,
        transform(|e, args| Ok(e.shift(lit(-int_arg(args, 0, "lead", 1)?)))),
    );
    define(registry, "is_na", kind, transform(|e, _| Ok(e.is_null())));
    define(
        registry,
        "rank",
        kind,
        transform(|e, _| {
            let options = RankOptions {
                method: RankMethod::Average,
                descending: false,
            };
            Ok(e.rank(options, None))
        }),
    );

    let kind = FunctionKind::Apply;
    define(registry, "rev", kind, transform(|e, _| Ok(e.reverse())));
    define(registry, "unique", kind, transform(|e, _| Ok(e.unique_stable())));

    log::debug!("registered {} builtin functions", registry.function_names().len());
}
