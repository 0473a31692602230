//! Evaluates [`Expr`] trees against a table.

use indexmap::IndexMap;
use polars::prelude::*;

use crate::dispatch::Registry;
use crate::error::{Result, TidyError};
use crate::expr::Expr;
use crate::ops;
use crate::table::Table;
use crate::value::{AggregatedResult, ScalarValue, Value};

/// Evaluation context: the data an expression sees
pub struct EvalContext<'a> {
    pub table: &'a Table,
    pub registry: &'a Registry,
    /// Values produced earlier in the same verb; they shadow table columns
    pub overlay: Option<&'a IndexMap<String, Value>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(table: &'a Table, registry: &'a Registry) -> Self {
        Self {
            table,
            registry,
            overlay: None,
        }
    }

    pub fn with_overlay(mut self, overlay: &'a IndexMap<String, Value>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Resolve a column reference; grouped tables give grouped columns.
    pub fn column(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.overlay.and_then(|o| o.get(name)) {
            return Ok(value.clone());
        }
        self.table.get_column(name)
    }

    /// Group sizes, one per group; the row count for an ungrouped table.
    pub fn group_sizes(&self) -> Result<Value> {
        match self.table.grouping() {
            None => Ok(Value::Scalar(ScalarValue::Int(self.table.height() as i64))),
            Some(grouping) => {
                let sizes: Vec<i64> = grouping.sizes().into_iter().map(|s| s as i64).collect();
                let values = Series::new("n".into(), sizes);
                Ok(Value::Aggregated(AggregatedResult::from_grouping(
                    grouping, values,
                )?))
            }
        }
    }
}

pub fn eval(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value> {
    match expr {
        Expr::Col(name) => ctx.column(name),
        Expr::Lit(value) => Ok(Value::Scalar(value.clone())),
        Expr::Values(series) => Ok(Value::Array(series.clone())),
        Expr::Call { function, args } => eval_call(function, args, ctx),
        Expr::BinaryOp(lhs, op, rhs) => {
            let l = eval(lhs, ctx)?;
            let r = eval(rhs, ctx)?;
            ops::binary(*op, &l, &r)
        }
        Expr::UnaryOp(op, operand) => ops::unary(*op, &eval(operand, ctx)?),
        Expr::IfElse {
            condition,
            yes,
            no,
        } => {
            let c = eval(condition, ctx)?;
            let y = eval(yes, ctx)?;
            let n = eval(no, ctx)?;
            ops::if_else(&c, &y, &n)
        }
        Expr::N => ctx.group_sizes(),
    }
}

fn eval_call(function: &str, args: &[Expr], ctx: &EvalContext<'_>) -> Result<Value> {
    let Some((operand, rest)) = args.split_first() else {
        return Err(TidyError::ArgError(format!(
            "`{function}()` needs an operand"
        )));
    };
    let operand = eval(operand, ctx)?;
    let rest = rest
        .iter()
        .map(|arg| eval(arg, ctx))
        .collect::<Result<Vec<_>>>()?;
    ctx.registry.dispatch_call(function, &operand, &rest)
}
