//! Arithmetic, comparison and logical operators over the operand union.
//!
//! Operands are aligned by [`broadcast_pair`], evaluated as Polars
//! expressions over a frame of the aligned vectors, then re-tagged with the
//! operands' shape.

use std::fmt;

use polars::prelude::*;

use crate::broadcast::{Broadcasted, broadcast_pair};
use crate::error::{Result, TidyError};
use crate::value::{GroupedColumn, ScalarValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Always floating point
    Div,
    /// Result takes the sign of the divisor
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&",
            BinOp::Or => "|",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

const LEFT: &str = "left";
const RIGHT: &str = "right";
const OUT: &str = "value";

/// Evaluate `expr` over equal-length named vectors.
pub(crate) fn evaluate(columns: Vec<Series>, expr: Expr) -> Result<Series> {
    let columns: Vec<Column> = columns.into_iter().map(Column::from).collect();
    let frame = DataFrame::new(columns)?;
    let out = frame.lazy().select([expr.alias(OUT)]).collect()?;
    Ok(out.column(OUT)?.as_materialized_series().clone())
}

/// Apply a binary operator, broadcasting the operands first.
pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    reject_table(left)?;
    reject_table(right)?;
    let aligned = broadcast_pair(left, right)?;
    let n = row_count(&[&aligned.left, &aligned.right]);
    let l = materialize(&aligned.left, LEFT, n)?;
    let r = materialize(&aligned.right, RIGHT, n)?;

    let (a, b) = (col(LEFT), col(RIGHT));
    let expr = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a.cast(DataType::Float64) / b.cast(DataType::Float64),
        BinOp::Mod => ((a % b.clone()) + b.clone()) % b,
        BinOp::Eq => a.eq(b),
        BinOp::Ne => a.neq(b),
        BinOp::Lt => a.lt(b),
        BinOp::Le => a.lt_eq(b),
        BinOp::Gt => a.gt(b),
        BinOp::Ge => a.gt_eq(b),
        BinOp::And => a.cast(DataType::Boolean).and(b.cast(DataType::Boolean)),
        BinOp::Or => a.cast(DataType::Boolean).or(b.cast(DataType::Boolean)),
    };
    let values = evaluate(vec![l, r], expr)?;
    log::trace!("binary {op}: {} values", values.len());
    retag(&aligned, values)
}

pub fn unary(op: UnaryOp, value: &Value) -> Result<Value> {
    reject_table(value)?;
    let n = row_count(&[value]);
    let v = materialize(value, LEFT, n)?;
    let expr = match op {
        UnaryOp::Neg => lit(0) - col(LEFT),
        UnaryOp::Not => col(LEFT).not(),
    };
    let values = evaluate(vec![v], expr)?;
    reshape_like(value, values)
}

/// Vectorised `if cond { yes } else { no }`; a null condition gives null.
pub fn if_else(cond: &Value, yes: &Value, no: &Value) -> Result<Value> {
    reject_table(cond)?;
    reject_table(yes)?;
    reject_table(no)?;
    let (c, y, _) = broadcast_pair(cond, yes)?.into_parts();
    let (c, n, _) = broadcast_pair(&c, no)?.into_parts();
    let aligned = broadcast_pair(&c, &y)?;
    let (c, y) = (&aligned.left, &aligned.right);

    let rows = row_count(&[c, y, &n]);
    let columns = vec![
        materialize(c, "cond", rows)?,
        materialize(y, "yes", rows)?,
        materialize(&n, "no", rows)?,
    ];
    if columns[0].dtype() != &DataType::Boolean && columns[0].dtype() != &DataType::Null {
        return Err(TidyError::type_error(
            "logical condition",
            columns[0].dtype().to_string(),
        ));
    }
    let expr = when(col("cond").is_null())
        .then(lit(NULL))
        .when(col("cond"))
        .then(col("yes"))
        .otherwise(col("no"));
    let values = evaluate(columns, expr)?;

    let tagged = Broadcasted {
        left: c.clone(),
        right: n,
        grouping: aligned.grouping.clone(),
    };
    retag(&tagged, values)
}

fn reject_table(value: &Value) -> Result<()> {
    match value {
        Value::Table(_) => Err(TidyError::type_error("column-like operand", "table")),
        _ => Ok(()),
    }
}

fn row_count(values: &[&Value]) -> usize {
    values.iter().filter_map(|v| v.len()).max().unwrap_or(1)
}

fn materialize(value: &Value, name: &str, n: usize) -> Result<Series> {
    let series = match value {
        Value::Scalar(s) => s.to_series(name, n),
        other => other.to_series()?.with_name(name.into()),
    };
    if series.len() != n {
        return Err(TidyError::recycle(value.label(), series.len(), n));
    }
    Ok(series)
}

/// Give computed values the shape of the aligned operands.
fn retag(aligned: &Broadcasted, values: Series) -> Result<Value> {
    if let Some(grouping) = &aligned.grouping {
        return Ok(Value::Grouped(GroupedColumn::new(values, grouping.clone())?));
    }
    match (&aligned.left, &aligned.right) {
        (Value::Aggregated(a), _) | (_, Value::Aggregated(a)) => {
            Ok(Value::Aggregated(a.with_values(values)?))
        }
        (Value::Scalar(_), Value::Scalar(_)) => scalar_of(&values),
        (Value::Column(_), _) | (_, Value::Column(_)) => Ok(Value::Column(values)),
        _ => Ok(Value::Array(values)),
    }
}

fn reshape_like(value: &Value, values: Series) -> Result<Value> {
    match value {
        Value::Scalar(_) => scalar_of(&values),
        Value::Array(_) => Ok(Value::Array(values)),
        Value::Column(_) => Ok(Value::Column(values)),
        Value::Grouped(g) => Ok(Value::Grouped(GroupedColumn::new(
            values,
            g.grouping().clone(),
        )?)),
        Value::Aggregated(a) => Ok(Value::Aggregated(a.with_values(values)?)),
        Value::Table(_) => Err(TidyError::type_error("column-like operand", "table")),
    }
}

fn scalar_of(values: &Series) -> Result<Value> {
    Ok(Value::Scalar(ScalarValue::from_any(&values.get(0)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;

    fn array(values: &[i64]) -> Value {
        Value::Array(Series::new("x".into(), values))
    }

    fn floats(value: &Value) -> Vec<Option<f64>> {
        value
            .to_series()
            .unwrap()
            .cast(&DataType::Float64)
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn scalar_arithmetic_stays_scalar() {
        let out = binary(
            BinOp::Add,
            &Value::Scalar(ScalarValue::Int(2)),
            &Value::Scalar(ScalarValue::Int(3)),
        )
        .unwrap();
        assert!(matches!(out, Value::Scalar(ScalarValue::Int(5))));
    }

    #[test]
    fn division_is_floating_point() {
        let out = binary(BinOp::Div, &array(&[1, 3]), &Value::Scalar(ScalarValue::Int(2))).unwrap();
        assert_eq!(floats(&out), vec![Some(0.5), Some(1.5)]);
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        let out = binary(BinOp::Mod, &array(&[-7, 7]), &Value::Scalar(ScalarValue::Int(3))).unwrap();
        assert_eq!(floats(&out), vec![Some(2.0), Some(1.0)]);
    }

    #[test]
    fn grouped_minus_aggregate_is_grouped() {
        let table = Table::new(df! { "g" => &[1, 1, 2], "x" => &[1, 3, 10] }.unwrap())
            .group_by(&["g"], true)
            .unwrap();
        let x = table.get_column("x").unwrap();
        let grouping = table.grouping().unwrap();
        let means = crate::value::AggregatedResult::from_grouping(
            grouping,
            Series::new("m".into(), &[2.0, 10.0]),
        )
        .unwrap();
        let out = binary(BinOp::Sub, &x, &Value::Aggregated(means)).unwrap();
        assert!(matches!(out, Value::Grouped(_)));
        assert_eq!(floats(&out), vec![Some(-1.0), Some(1.0), Some(0.0)]);
    }

    #[test]
    fn if_else_null_condition_gives_null() {
        let cond = Value::Array(Series::new("c".into(), &[Some(true), None, Some(false)]));
        let out = if_else(&cond, &array(&[1, 2, 3]), &Value::Scalar(ScalarValue::Int(0))).unwrap();
        assert_eq!(floats(&out), vec![Some(1.0), None, Some(0.0)]);
    }

    #[test]
    fn unary_keeps_shape() {
        let out = unary(UnaryOp::Neg, &array(&[1, -2])).unwrap();
        assert!(matches!(out, Value::Array(_)));
        assert_eq!(floats(&out), vec![Some(-1.0), Some(2.0)]);
        let not = unary(UnaryOp::Not, &Value::Scalar(ScalarValue::Bool(true))).unwrap();
        assert!(matches!(not, Value::Scalar(ScalarValue::Bool(false))));
    }
}
