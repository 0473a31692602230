//! Table verbs: each takes a table by reference and returns a new one.

use indexmap::IndexMap;
use polars::prelude::*;

use crate::broadcast::broadcast_to;
use crate::dispatch::Registry;
use crate::error::{Result, TidyError};
use crate::eval::{EvalContext, eval};
use crate::expr::Expr;
use crate::grouping::{GroupKey, GroupOptions, GroupingDescriptor};
use crate::ops::{self, BinOp};
use crate::table::{NameRepair, Table};
use crate::value::Value;

/// Grouping of a `summarise` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummariseGroups {
    /// Drop the last grouping key; all keys are kept when a group produced
    /// several rows
    #[default]
    DropLast,
    Drop,
    Keep,
    Rowwise,
}

pub fn group_by(table: &Table, keys: &[&str], options: GroupOptions) -> Result<Table> {
    table.group_by_with(keys, options)
}

/// Remove `keys` from the grouping; all of it when `keys` is empty.
pub fn ungroup(table: &Table, keys: &[&str]) -> Result<Table> {
    let Some(grouping) = table.grouping() else {
        return Ok(table.clone());
    };
    if keys.is_empty() || grouping.is_rowwise() {
        return Ok(table.ungroup());
    }
    let remaining: Vec<&str> = grouping
        .keys()
        .iter()
        .map(String::as_str)
        .filter(|k| !keys.contains(k))
        .collect();
    if remaining.is_empty() {
        return Ok(table.ungroup());
    }
    table.group_by_with(&remaining, grouping.options())
}

pub fn rowwise(table: &Table, keys: &[&str]) -> Result<Table> {
    table.row_wise(keys)
}

/// Keep rows where every condition holds. Null counts as false.
pub fn filter(table: &Table, conditions: &[Expr], registry: &Registry) -> Result<Table> {
    let ctx = EvalContext::new(table, registry);
    let mut combined: Option<Value> = None;
    for condition in conditions {
        let value = eval(condition, &ctx)?;
        combined = Some(match combined {
            None => value,
            Some(acc) => ops::binary(BinOp::And, &acc, &value)?,
        });
    }
    let Some(combined) = combined else {
        return Ok(table.clone());
    };

    let mask = broadcast_to(&combined, table.height(), table.grouping())?.to_series()?;
    let mask = match mask.dtype() {
        DataType::Boolean => mask,
        DataType::Null => mask.cast(&DataType::Boolean)?,
        other => return Err(TidyError::type_error("logical condition", other.to_string())),
    };
    let keep: Vec<IdxSize> = mask
        .bool()?
        .into_iter()
        .enumerate()
        .filter_map(|(row, v)| (v == Some(true)).then_some(row as IdxSize))
        .collect();
    log::debug!("filter kept {} of {} rows", keep.len(), table.height());
    table.take_rows(&keep)
}

/// Add or replace columns; later expressions see earlier results.
pub fn mutate(table: &Table, columns: &[(&str, Expr)], registry: &Registry) -> Result<Table> {
    let mut out = table.clone();
    for (name, expr) in columns {
        let value = eval(expr, &EvalContext::new(&out, registry))?;
        out = out.set_column(name, value)?;
    }
    Ok(out)
}

/// One row per group (or per result row), keys first.
pub fn summarise(
    table: &Table,
    columns: &[(&str, Expr)],
    groups: SummariseGroups,
    registry: &Registry,
) -> Result<Table> {
    let keys = table.group_vars();
    let mut results: IndexMap<String, Value> = IndexMap::new();
    for (name, expr) in columns {
        if keys.iter().any(|k| k.as_str() == *name) {
            return Err(TidyError::ArgError(format!(
                "column `{name}` can't be modified because it's a grouping variable"
            )));
        }
        let value = eval(expr, &EvalContext::new(table, registry).with_overlay(&results))?;
        if let Value::Table(_) = value {
            return Err(TidyError::type_error("column-like result", "table"));
        }
        results.insert(name.to_string(), value);
    }

    let Some(grouping) = table.grouping() else {
        let named: Vec<(String, Value)> = results.into_iter().collect();
        let out = Table::from_columns(named, NameRepair::CheckUnique)?;
        return match groups {
            SummariseGroups::Rowwise => out.row_wise(&[]),
            _ => Ok(out),
        };
    };

    // per group: indices into each result, then a common row count
    let mut sources = Vec::with_capacity(results.len());
    for (name, value) in &results {
        sources.push((name.clone(), per_group(name, value, grouping)?));
    }
    let mut sizes = Vec::with_capacity(grouping.n_groups());
    for g in 0..grouping.n_groups() {
        let mut common: Option<usize> = None;
        for (name, (_, idx)) in &sources {
            let size = idx[g].len();
            match common {
                _ if size == 1 => {}
                None => common = Some(size),
                Some(c) if c == size => {}
                Some(c) => return Err(TidyError::recycle(name.as_str(), size, c)),
            }
        }
        sizes.push(common.unwrap_or(1));
    }

    let mut columns = Vec::with_capacity(keys.len() + sources.len());
    let key_rows: Vec<IdxSize> = sizes
        .iter()
        .enumerate()
        .flat_map(|(g, &size)| std::iter::repeat_n(g as IdxSize, size))
        .collect();
    let key_idx = IdxCa::from_vec(PlSmallStr::EMPTY, key_rows);
    for key in grouping.key_columns(table.frame())? {
        columns.push(key.take(&key_idx)?);
    }
    for (name, (source, idx)) in sources {
        let mut gather = Vec::new();
        for (rows, &size) in idx.iter().zip(&sizes) {
            if rows.len() == size {
                gather.extend_from_slice(rows);
            } else if let Some(&first) = rows.first() {
                gather.extend(std::iter::repeat_n(first, size));
            }
        }
        let values = source.take(&IdxCa::from_vec(PlSmallStr::EMPTY, gather))?;
        columns.push(Column::from(values.with_name(name.as_str().into())));
    }
    let data = DataFrame::new(columns)?;

    let mut levels = table.levels().clone();
    levels.retain(|name, _| keys.contains(name));
    let out = Table::from_parts(data, None, levels);

    let multi_row = sizes.iter().any(|&s| s != 1);
    let regroup_by: Vec<&str> = match groups {
        SummariseGroups::Drop => Vec::new(),
        SummariseGroups::Rowwise => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            return out.row_wise(&keys);
        }
        SummariseGroups::Keep => keys.iter().map(String::as_str).collect(),
        SummariseGroups::DropLast if grouping.is_rowwise() || multi_row => {
            keys.iter().map(String::as_str).collect()
        }
        SummariseGroups::DropLast => keys[..keys.len().saturating_sub(1)]
            .iter()
            .map(String::as_str)
            .collect(),
    };
    if regroup_by.is_empty() {
        return Ok(out);
    }
    if groups == SummariseGroups::DropLast {
        log::info!(
            "`summarise()` has grouped output by {regroup_by:?}. You can override using the `.groups` argument."
        );
    }
    out.group_by_with(&regroup_by, grouping.options())
}

/// For each group of `grouping`, the positions in the result's values that
/// belong to it.
fn per_group(
    name: &str,
    value: &Value,
    grouping: &GroupingDescriptor,
) -> Result<(Series, Vec<Vec<IdxSize>>)> {
    let n_groups = grouping.n_groups();
    match value {
        Value::Scalar(s) => Ok((s.to_series(name, 1), vec![vec![0]; n_groups])),
        Value::Array(s) | Value::Column(s) => {
            let all: Vec<IdxSize> = (0..s.len() as IdxSize).collect();
            Ok((s.clone(), vec![all; n_groups]))
        }
        Value::Aggregated(a) => {
            let mut idx = Vec::with_capacity(n_groups);
            for key in grouping.group_keys() {
                let pos = a.index().iter().position(|k| k == key).ok_or_else(|| {
                    TidyError::IncompatibleAggregate {
                        expected_keys: grouping.keys().to_vec(),
                        expected: n_groups,
                        got_keys: a.key_names().to_vec(),
                        got: a.len(),
                        detail: format!("; group {key} missing"),
                    }
                })?;
                idx.push(vec![pos as IdxSize]);
            }
            Ok((a.values().clone(), idx))
        }
        Value::Grouped(g) => {
            let own = g.grouping();
            let mut idx = Vec::with_capacity(n_groups);
            for key in grouping.group_keys() {
                idx.push(rows_for(own, key, grouping)?);
            }
            Ok((g.values().clone(), idx))
        }
        Value::Table(_) => Err(TidyError::type_error("column-like result", "table")),
    }
}

fn rows_for(own: &GroupingDescriptor, key: &GroupKey, target: &GroupingDescriptor) -> Result<Vec<IdxSize>> {
    if own.keys() != target.keys() {
        return Err(TidyError::IncompatibleGrouper {
            left: target.keys().to_vec(),
            right: own.keys().to_vec(),
            reason: "different group keys".into(),
        });
    }
    own.position(key)
        .map(|pos| own.rows(pos).to_vec())
        .ok_or_else(|| TidyError::IncompatibleGrouper {
            left: target.keys().to_vec(),
            right: own.keys().to_vec(),
            reason: format!("group {key} missing on the right"),
        })
}

/// Keep columns in the given order; missing grouping keys are added first.
pub fn select(table: &Table, names: &[&str]) -> Result<Table> {
    let mut wanted: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let missing: Vec<String> = table
        .group_vars()
        .into_iter()
        .filter(|k| !wanted.contains(k))
        .collect();
    if !missing.is_empty() {
        log::info!("Adding missing grouping variables: {missing:?}");
        wanted.splice(0..0, missing);
    }
    table.select_columns(&wanted)
}

/// Rename by `(old, new)` pairs.
pub fn rename(table: &Table, renames: &[(&str, &str)]) -> Result<Table> {
    let renames: Vec<(String, String)> = renames
        .iter()
        .map(|(old, new)| (old.to_string(), new.to_string()))
        .collect();
    table.rename_columns(&renames)
}

/// Stable sort by `(column, descending)` pairs, nulls last. Groups are
/// ignored for ordering and rebuilt afterwards.
pub fn arrange(table: &Table, by: &[(&str, bool)]) -> Result<Table> {
    if by.is_empty() {
        return Ok(table.clone());
    }
    let mut names = Vec::with_capacity(by.len());
    for (name, _) in by {
        if !table.has_column(name) {
            return Err(TidyError::ColumnNotFound(name.to_string()));
        }
        names.push(name.to_string());
    }
    let descending: Vec<bool> = by.iter().map(|(_, d)| *d).collect();
    let opts = SortMultipleOptions::new()
        .with_order_descending_multi(descending)
        .with_maintain_order(true)
        .with_nulls_last(true);
    let sorted = table.frame().clone().lazy().sort(&names, opts).collect()?;
    table.with_frame(sorted)
}

pub fn pull(table: &Table, name: &str) -> Result<Series> {
    table.pull(name)
}

/// One row per group with the key values.
pub fn group_keys(table: &Table) -> Result<Table> {
    match table.grouping() {
        Some(grouping) if !grouping.keys().is_empty() => {
            let columns = grouping.key_columns(table.frame())?;
            Ok(Table::from_parts(
                DataFrame::new(columns)?,
                None,
                table.levels().clone(),
            ))
        }
        _ => Ok(Table::empty()),
    }
}

/// Row positions of each group.
pub fn group_rows(table: &Table) -> Vec<Vec<IdxSize>> {
    match table.grouping() {
        Some(grouping) => grouping.group_index().values().cloned().collect(),
        None => vec![(0..table.height() as IdxSize).collect()],
    }
}

/// Group position (0-based) of every row.
pub fn group_indices(table: &Table) -> Vec<usize> {
    match table.grouping() {
        Some(grouping) => grouping.group_ids(),
        None => vec![0; table.height()],
    }
}

pub fn group_size(table: &Table) -> Vec<usize> {
    match table.grouping() {
        Some(grouping) => grouping.sizes(),
        None => vec![table.height()],
    }
}

pub fn n_groups(table: &Table) -> usize {
    table.grouping().map_or(1, |g| g.n_groups())
}

pub fn group_vars(table: &Table) -> Vec<String> {
    table.group_vars()
}
