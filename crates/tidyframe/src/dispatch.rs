//! Function dispatch over the operand union.
//!
//! A [`Registry`] maps a function name to its [`FunctionKind`] and, per
//! [`OperandKind`], one [`Registration`]. Resolution tries the exact operand
//! kind, then its ancestors (nearest first). Tables with no table-level
//! registration are dispatched column by column.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use polars::prelude::*;

use crate::error::{Result, TidyError};
use crate::grouping::GroupingDescriptor;
use crate::table::{NameRepair, Table};
use crate::value::{AggregatedResult, GroupedColumn, OperandKind, ScalarValue, Value};

/// How a function's output relates to its input's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    /// Same row count as the input, applied per group
    Transform,
    /// One value per group
    Aggregate,
    /// Whole vector (or whole group) in, any length out
    Apply,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionKind::Transform => "transform",
            FunctionKind::Aggregate => "aggregate",
            FunctionKind::Apply => "apply",
        };
        f.write_str(name)
    }
}

/// Per-vector function: receives one vector (or one group's values).
pub type VectorFn = Arc<dyn Fn(&Series, &[Value]) -> Result<Series> + Send + Sync + 'static>;

/// Whole-operand function: receives the operand unchanged.
pub type OperandFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static>;

/// Runs before the implementation and may rewrite the operand and arguments.
pub type PreHook =
    Arc<dyn Fn(Value, Vec<Value>) -> Result<(Value, Vec<Value>)> + Send + Sync + 'static>;

/// Runs on the result, seeing the (pre-processed) operand and arguments.
pub type PostHook = Arc<dyn Fn(Value, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static>;

#[derive(Clone)]
pub enum Implementation {
    /// Run per group; the dispatcher reassembles results per the function kind
    Vector(VectorFn),
    /// Type-specific override; the result is returned as is
    Operand(OperandFn),
}

impl Implementation {
    pub fn vector<F>(f: F) -> Self
    where
        F: Fn(&Series, &[Value]) -> Result<Series> + Send + Sync + 'static,
    {
        Implementation::Vector(Arc::new(f))
    }

    pub fn operand<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Implementation::Operand(Arc::new(f))
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Implementation::Vector(_) => f.write_str("Implementation::Vector"),
            Implementation::Operand(_) => f.write_str("Implementation::Operand"),
        }
    }
}

/// An implementation plus optional hooks.
#[derive(Clone)]
pub struct Registration {
    implementation: Implementation,
    pre: Option<PreHook>,
    post: Option<PostHook>,
}

impl Registration {
    pub fn new(implementation: Implementation) -> Self {
        Self {
            implementation,
            pre: None,
            post: None,
        }
    }

    pub fn with_pre<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Result<(Value, Vec<Value>)> + Send + Sync + 'static,
    {
        self.pre = Some(Arc::new(hook));
        self
    }

    pub fn with_post<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(hook));
        self
    }

    pub fn implementation(&self) -> &Implementation {
        &self.implementation
    }
}

impl From<Implementation> for Registration {
    fn from(implementation: Implementation) -> Self {
        Self::new(implementation)
    }
}

#[derive(Clone)]
struct FunctionEntry {
    kind: FunctionKind,
    impls: HashMap<OperandKind, Registration>,
}

/// Registered functions, constructed once and passed by reference.
#[derive(Default, Clone)]
pub struct Registry {
    functions: HashMap<String, FunctionEntry>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the builtin aggregates, transforms and applies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtins::register_builtins(&mut registry);
        registry
    }

    /// Register `registration` for `operand`.
    ///
    /// A function has one kind; registering another kind under the same name
    /// fails. Re-registering an operand kind replaces the previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        kind: FunctionKind,
        operand: OperandKind,
        registration: impl Into<Registration>,
    ) -> Result<()> {
        let name = name.into();
        if let Some(entry) = self.functions.get(&name)
            && entry.kind != kind
        {
            return Err(TidyError::KindConflict {
                function: name,
                existing: entry.kind.to_string(),
                requested: kind.to_string(),
            });
        }
        self.define(name, kind, operand, registration.into());
        Ok(())
    }

    /// Register the same implementation for several operand kinds.
    pub fn register_all(
        &mut self,
        name: impl Into<String>,
        kind: FunctionKind,
        operands: &[OperandKind],
        registration: impl Into<Registration>,
    ) -> Result<()> {
        let name = name.into();
        let registration = registration.into();
        for &operand in operands {
            self.register(name.clone(), kind, operand, registration.clone())?;
        }
        Ok(())
    }

    pub(crate) fn define(
        &mut self,
        name: impl Into<String>,
        kind: FunctionKind,
        operand: OperandKind,
        registration: Registration,
    ) {
        let entry = self
            .functions
            .entry(name.into())
            .or_insert_with(|| FunctionEntry {
                kind,
                impls: HashMap::new(),
            });
        entry.kind = kind;
        entry.impls.insert(operand, registration);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> Option<FunctionKind> {
        self.functions.get(name).map(|e| e.kind)
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Find the registration serving `operand`, returning the kind it was
    /// registered under.
    pub fn resolve(
        &self,
        name: &str,
        operand: OperandKind,
    ) -> Result<(FunctionKind, OperandKind, &Registration)> {
        let entry = self
            .functions
            .get(name)
            .ok_or_else(|| TidyError::UnknownFunction(name.to_string()))?;
        if let Some(registration) = entry.impls.get(&operand) {
            return Ok((entry.kind, operand, registration));
        }
        // An aggregate must not silently reduce one-row groups.
        if entry.kind == FunctionKind::Aggregate && operand == OperandKind::RowwiseColumn {
            return Err(TidyError::RowwiseNotSupported {
                function: name.to_string(),
            });
        }
        for &ancestor in operand.ancestors() {
            if let Some(registration) = entry.impls.get(&ancestor) {
                return Ok((entry.kind, ancestor, registration));
            }
        }
        Err(TidyError::NoImplementation {
            function: name.to_string(),
            operand,
        })
    }

    /// Call `name` on `operand` with extra arguments.
    pub fn dispatch_call(&self, name: &str, operand: &Value, args: &[Value]) -> Result<Value> {
        let kind = operand.kind();
        let resolved = match self.resolve(name, kind) {
            Ok(resolved) => resolved,
            Err(TidyError::NoImplementation { .. }) if kind.is_table() => {
                if let Value::Table(table) = operand {
                    return self.dispatch_columns(name, table, args);
                }
                return Err(TidyError::NoImplementation {
                    function: name.to_string(),
                    operand: kind,
                });
            }
            Err(err) => return Err(err),
        };
        let (function_kind, matched, registration) = resolved;
        log::debug!("dispatch `{name}()` on {kind}: {function_kind} registered for {matched}");

        let (operand, args) = match &registration.pre {
            Some(pre) => pre(operand.clone(), args.to_vec())?,
            None => (operand.clone(), args.to_vec()),
        };
        let result = match &registration.implementation {
            Implementation::Operand(f) => f(&operand, &args)?,
            Implementation::Vector(f) => run_vector(name, function_kind, f, &operand, &args)?,
        };
        match &registration.post {
            Some(post) => post(result, &operand, &args),
            None => Ok(result),
        }
    }

    /// Dispatch per non-key column of a table and reassemble the results.
    fn dispatch_columns(&self, name: &str, table: &Table, args: &[Value]) -> Result<Value> {
        let keys = table.group_vars();
        let mut results = Vec::new();
        for column in table.column_names() {
            if keys.contains(&column) {
                continue;
            }
            let value = table.get_column(&column)?;
            results.push((column, self.dispatch_call(name, &value, args)?));
        }
        log::debug!(
            "dispatch `{name}()` over {} columns of a {}",
            results.len(),
            table.kind()
        );

        let Some(grouping) = table.grouping() else {
            return Table::from_columns(results, NameRepair::CheckUnique).map(Value::Table);
        };
        if results
            .iter()
            .all(|(_, v)| matches!(v, Value::Aggregated(_) | Value::Scalar(_)))
        {
            let sizes = vec![1; grouping.n_groups()];
            return reassemble(table, &grouping.reshaped(&sizes), results, false);
        }
        // row-aligned results stay on the table's own rows
        if results.iter().all(|(_, v)| match v {
            Value::Grouped(g) => g.grouping().same_partition(grouping),
            _ => true,
        }) {
            let mut out = table.select_columns(&keys)?;
            for (column, value) in results {
                out = out.set_column(&column, value)?;
            }
            return Ok(Value::Table(out));
        }
        let reshaped = results.iter().find_map(|(_, v)| match v {
            Value::Grouped(g) if !g.grouping().same_partition(grouping) => {
                Some(g.grouping().clone())
            }
            _ => None,
        });
        match reshaped {
            Some(target) => reassemble(table, &target, results, true),
            None => Err(TidyError::ArgError(format!(
                "results of `{name}()` cannot be reassembled into a table"
            ))),
        }
    }
}

/// Build a table whose rows follow `target` (same keys and group order as
/// the table's grouping, any group sizes). Key columns are repeated per row.
fn reassemble(
    table: &Table,
    target: &GroupingDescriptor,
    results: Vec<(String, Value)>,
    keep_grouping: bool,
) -> Result<Value> {
    let Some(grouping) = table.grouping() else {
        return Err(TidyError::ArgError("reassembly needs a grouped table".into()));
    };
    let group_rows: Vec<IdxSize> = target
        .group_index()
        .values()
        .enumerate()
        .flat_map(|(g, rows)| std::iter::repeat_n(g as IdxSize, rows.len()))
        .collect();
    let idx = IdxCa::from_vec(PlSmallStr::EMPTY, group_rows);

    let mut columns = Vec::with_capacity(results.len() + grouping.keys().len());
    for key in grouping.key_columns(table.frame())? {
        columns.push(key.take(&idx)?);
    }
    let target = Arc::new(target.clone());
    for (name, value) in results {
        let aligned = crate::broadcast::broadcast_to(&value, target.n_rows(), Some(&target))?;
        columns.push(Column::from(aligned.to_series()?.with_name(name.as_str().into())));
    }
    let data = DataFrame::new(columns)?;
    let grouping = keep_grouping.then_some(target);
    Ok(Value::Table(Table::from_parts(
        data,
        grouping,
        table.levels().clone(),
    )))
}

fn run_vector(
    name: &str,
    kind: FunctionKind,
    f: &VectorFn,
    operand: &Value,
    args: &[Value],
) -> Result<Value> {
    match operand {
        Value::Scalar(s) => {
            let out = f(&s.to_series("", 1), args)?;
            match (kind, out.len()) {
                (_, 1) => Ok(Value::Scalar(ScalarValue::from_any(&out.get(0)?))),
                (FunctionKind::Aggregate, n) => Err(not_one_value(name, n)),
                _ => Ok(Value::Array(out)),
            }
        }
        Value::Array(s) | Value::Column(s) => {
            let out = f(s, args)?;
            match kind {
                FunctionKind::Aggregate => single(name, &out),
                FunctionKind::Transform => {
                    let out = conform_length(name, out, s.len())?;
                    Ok(match operand {
                        Value::Column(_) => Value::Column(out),
                        _ => Value::Array(out),
                    })
                }
                FunctionKind::Apply if out.len() == s.len() => Ok(match operand {
                    Value::Column(_) => Value::Column(out),
                    _ => Value::Array(out),
                }),
                FunctionKind::Apply => Ok(Value::Array(out)),
            }
        }
        Value::Aggregated(a) => {
            let out = f(a.values(), args)?;
            match kind {
                FunctionKind::Aggregate => single(name, &out),
                FunctionKind::Transform => {
                    let out = conform_length(name, out, a.len())?;
                    Ok(Value::Aggregated(a.with_values(out)?))
                }
                FunctionKind::Apply if out.len() == a.len() => {
                    Ok(Value::Aggregated(a.with_values(out)?))
                }
                FunctionKind::Apply => Ok(Value::Array(out)),
            }
        }
        Value::Grouped(g) => run_grouped(name, kind, f, g, args),
        Value::Table(_) => Err(TidyError::NoImplementation {
            function: name.to_string(),
            operand: operand.kind(),
        }),
    }
}

fn run_grouped(
    name: &str,
    kind: FunctionKind,
    f: &VectorFn,
    column: &GroupedColumn,
    args: &[Value],
) -> Result<Value> {
    let grouping = column.grouping();
    let mut parts = Vec::with_capacity(grouping.n_groups());
    for group in 0..grouping.n_groups() {
        parts.push(f(&column.group_values(group)?, args)?);
    }

    match kind {
        FunctionKind::Aggregate => {
            if let Some(bad) = parts.iter().find(|p| p.len() != 1) {
                return Err(not_one_value(name, bad.len()));
            }
            let values = concat(parts, column.values())?;
            Ok(Value::Aggregated(AggregatedResult::from_grouping(
                grouping, values,
            )?))
        }
        FunctionKind::Transform => {
            let sizes = grouping.sizes();
            let mut parts_fit = Vec::with_capacity(parts.len());
            for (part, &size) in parts.into_iter().zip(&sizes) {
                parts_fit.push(conform_length(name, part, size)?);
            }
            // concatenated in group order; scatter back to row order
            let mut offsets = Vec::with_capacity(sizes.len());
            let mut offset = 0;
            for &size in &sizes {
                offsets.push(offset);
                offset += size;
            }
            let mut idx = vec![0 as IdxSize; grouping.n_rows()];
            for (g, rows) in grouping.group_index().values().enumerate() {
                for (i, &row) in rows.iter().enumerate() {
                    idx[row as usize] = (offsets[g] + i) as IdxSize;
                }
            }
            let stacked = concat(parts_fit, column.values())?;
            let values = stacked.take(&IdxCa::from_vec(PlSmallStr::EMPTY, idx))?;
            Ok(Value::Grouped(GroupedColumn::new(values, grouping.clone())?))
        }
        FunctionKind::Apply => {
            if parts.iter().all(|p| p.len() == 1) {
                let values = concat(parts, column.values())?;
                return Ok(Value::Aggregated(AggregatedResult::from_grouping(
                    grouping, values,
                )?));
            }
            if grouping.is_rowwise() {
                return Err(TidyError::ArgError(format!(
                    "`{name}()` must return one value per row of a row-wise column"
                )));
            }
            let sizes: Vec<usize> = parts.iter().map(|s| s.len()).collect();
            let reshaped = Arc::new(grouping.reshaped(&sizes));
            let values = concat(parts, column.values())?;
            Ok(Value::Grouped(GroupedColumn::new(values, reshaped)?))
        }
    }
}

/// Stack per-group results. With no groups, an empty vector of the input's
/// type.
pub(crate) fn concat(parts: Vec<Series>, like: &Series) -> Result<Series> {
    let mut parts = parts.into_iter();
    let Some(mut out) = parts.next() else {
        return Ok(like.clear());
    };
    for part in parts {
        let part = if part.dtype() == out.dtype() {
            part
        } else if out.dtype() == &DataType::Null {
            out = out.cast(part.dtype())?;
            part
        } else {
            part.cast(out.dtype())?
        };
        out.append(&part)?;
    }
    Ok(out)
}

fn single(name: &str, out: &Series) -> Result<Value> {
    if out.len() != 1 {
        return Err(not_one_value(name, out.len()));
    }
    Ok(Value::Scalar(ScalarValue::from_any(&out.get(0)?)))
}

fn conform_length(name: &str, out: Series, n: usize) -> Result<Series> {
    match out.len() {
        len if len == n => Ok(out),
        1 => Ok(out.new_from_index(0, n)),
        len => Err(TidyError::recycle(format!("{name}()"), len, n)),
    }
}

fn not_one_value(name: &str, got: usize) -> TidyError {
    TidyError::ArgError(format!(
        "aggregate `{name}()` must return a single value, got {got}"
    ))
}
