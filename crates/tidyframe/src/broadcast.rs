//! Broadcast engine: aligns two differently shaped operands.
//!
//! Two distinct alignment problems meet here:
//! - recycling: a shorter plain vector is repeated to fill a longer one
//!   (length 1, or an exact divisor of the target);
//! - aggregate-to-row expansion: a value per group is replicated across
//!   every row of its group.
//!
//! Every mismatch is an error. Nothing is padded or truncated.

use std::sync::Arc;

use polars::prelude::*;

use crate::error::{Result, TidyError};
use crate::grouping::GroupingDescriptor;
use crate::table::Table;
use crate::value::{AggregatedResult, GroupedColumn, Value};

/// Both operands of a pair, aligned, plus the grouping of the result.
#[derive(Debug, Clone)]
pub struct Broadcasted {
    pub left: Value,
    pub right: Value,
    pub grouping: Option<Arc<GroupingDescriptor>>,
}

impl Broadcasted {
    fn new(left: Value, right: Value, grouping: Option<Arc<GroupingDescriptor>>) -> Self {
        Self {
            left,
            right,
            grouping,
        }
    }

    pub fn into_parts(self) -> (Value, Value, Option<Arc<GroupingDescriptor>>) {
        (self.left, self.right, self.grouping)
    }
}

/// Operand shape as far as alignment is concerned.
enum Shape<'a> {
    Scalar,
    Plain(usize),
    Grouped(&'a Arc<GroupingDescriptor>),
    Aggregated(&'a AggregatedResult),
}

fn shape(value: &Value) -> Shape<'_> {
    match value {
        Value::Scalar(_) => Shape::Scalar,
        Value::Array(s) | Value::Column(s) => Shape::Plain(s.len()),
        Value::Grouped(g) => Shape::Grouped(g.grouping()),
        Value::Aggregated(a) => Shape::Aggregated(a),
        Value::Table(t) => match t.grouping() {
            Some(g) => Shape::Grouped(g),
            None => Shape::Plain(t.height()),
        },
    }
}

/// Align two operands to a common shape.
pub fn broadcast_pair(left: &Value, right: &Value) -> Result<Broadcasted> {
    match (shape(left), shape(right)) {
        (Shape::Scalar, _) | (_, Shape::Scalar) => {
            let grouping = left.grouping().or(right.grouping()).cloned();
            Ok(Broadcasted::new(left.clone(), right.clone(), grouping))
        }
        (Shape::Grouped(lg), Shape::Grouped(rg)) => {
            lg.check_compatible(rg)?;
            // A table side keeps its rows; the column side moves.
            if matches!(right, Value::Table(_)) && !matches!(left, Value::Table(_)) {
                let l = conform_grouped(left, rg)?;
                Ok(Broadcasted::new(l, right.clone(), Some(rg.clone())))
            } else {
                let r = conform_grouped(right, lg)?;
                Ok(Broadcasted::new(left.clone(), r, Some(lg.clone())))
            }
        }
        (Shape::Grouped(g), _) => {
            let r = conform_grouped(right, g)?;
            Ok(Broadcasted::new(left.clone(), r, Some(g.clone())))
        }
        (_, Shape::Grouped(g)) => {
            let l = conform_grouped(left, g)?;
            Ok(Broadcasted::new(l, right.clone(), Some(g.clone())))
        }
        (Shape::Aggregated(la), Shape::Aggregated(ra)) => {
            let r = align_aggregate(ra, la)?;
            Ok(Broadcasted::new(left.clone(), Value::Aggregated(r), None))
        }
        (Shape::Aggregated(a), Shape::Plain(_)) => {
            let r = recycle_plain(right, a.len())?;
            Ok(Broadcasted::new(left.clone(), r, None))
        }
        (Shape::Plain(_), Shape::Aggregated(a)) => {
            let l = recycle_plain(left, a.len())?;
            Ok(Broadcasted::new(l, right.clone(), None))
        }
        (Shape::Plain(lm), Shape::Plain(rm)) => {
            if lm == rm {
                Ok(Broadcasted::new(left.clone(), right.clone(), None))
            } else if lm > rm {
                let r = recycle_plain(right, lm)?;
                Ok(Broadcasted::new(left.clone(), r, None))
            } else {
                let l = recycle_plain(left, rm)?;
                Ok(Broadcasted::new(l, right.clone(), None))
            }
        }
    }
}

/// Stretch `value` to exactly `target_rows` rows, following `grouping` when
/// one is given.
///
/// Scalars are materialised; the result is a column (grouped when a
/// grouping is given) or, for table values, a table.
pub fn broadcast_to(
    value: &Value,
    target_rows: usize,
    grouping: Option<&Arc<GroupingDescriptor>>,
) -> Result<Value> {
    if let Some(g) = grouping {
        debug_assert_eq!(g.n_rows(), target_rows);
    }
    match value {
        Value::Scalar(s) => tag(s.to_series("", target_rows), grouping),
        Value::Array(s) => {
            let series = recycle(s, target_rows, grouping.map(Arc::as_ref))?;
            match grouping {
                None => Ok(Value::Array(series)),
                Some(_) => tag(series, grouping),
            }
        }
        Value::Column(s) => {
            let series = recycle(s, target_rows, grouping.map(Arc::as_ref))?;
            tag(series, grouping)
        }
        Value::Grouped(g) => match grouping {
            Some(target) => tag(realign(g, target)?, grouping),
            None if g.values().len() == target_rows => Ok(Value::Column(g.values().clone())),
            None => Err(TidyError::recycle(
                g.values().name().as_str(),
                g.values().len(),
                target_rows,
            )),
        },
        Value::Aggregated(a) => match grouping {
            Some(target) => tag(expand_aggregate(a, target)?, grouping),
            None => tag(recycle(a.values(), target_rows, None)?, None),
        },
        Value::Table(t) => {
            let mut columns = Vec::with_capacity(t.width());
            for column in t.frame().get_columns() {
                let series = column.as_materialized_series();
                columns.push(Column::from(recycle(series, target_rows, None)?));
            }
            Ok(Value::Table(Table::new(DataFrame::new(columns)?)))
        }
    }
}

/// Grow `base` so that `value` fits it.
///
/// Only size-1 groups (or a one-row ungrouped table) are grown; each such
/// row is repeated as many times as the value needs for that group. Every
/// other shape is returned unchanged and left to [`broadcast_to`] to accept
/// or reject.
pub fn broadcast_base(base: &Table, value: &Value) -> Result<Table> {
    let m = match value.len() {
        Some(m) if m > 1 => m,
        _ => return Ok(base.clone()),
    };
    if matches!(value, Value::Aggregated(_) | Value::Table(_)) {
        return Ok(base.clone());
    }

    let Some(grouping) = base.grouping() else {
        if base.height() == 1 && base.width() > 0 && !matches!(value, Value::Grouped(_)) {
            log::debug!("broadcast_base: one-row table grown to {m} rows");
            return base.take_rows(&vec![0; m]);
        }
        return Ok(base.clone());
    };

    let sizes = grouping.sizes();
    let wanted: Vec<usize> = match value {
        Value::Grouped(v) => {
            let theirs = v.grouping();
            if !grouping.is_rowwise() && grouping.keys() != theirs.keys() {
                return Err(TidyError::IncompatibleGrouper {
                    left: grouping.keys().to_vec(),
                    right: theirs.keys().to_vec(),
                    reason: "different group keys".into(),
                });
            }
            let mut wanted = Vec::with_capacity(sizes.len());
            for (key, rows) in grouping.group_index() {
                let size = theirs
                    .position(key)
                    .map(|pos| theirs.rows(pos).len())
                    .ok_or_else(|| TidyError::IncompatibleGrouper {
                        left: grouping.keys().to_vec(),
                        right: theirs.keys().to_vec(),
                        reason: format!("group {key} missing on the right"),
                    })?;
                wanted.push(if rows.len() == 1 { size } else { rows.len() });
            }
            wanted
        }
        _ => sizes.iter().map(|&s| if s == 1 { m } else { s }).collect(),
    };
    if wanted == sizes {
        return Ok(base.clone());
    }

    let group_ids = grouping.group_ids();
    let mut gather = Vec::with_capacity(wanted.iter().sum());
    for (row, &g) in group_ids.iter().enumerate() {
        let times = if sizes[g] == 1 { wanted[g] } else { 1 };
        gather.extend(std::iter::repeat_n(row as IdxSize, times));
    }
    log::debug!(
        "broadcast_base: size-1 groups grown, {} -> {} rows",
        base.height(),
        gather.len()
    );
    base.take_rows(&gather)
}

fn tag(series: Series, grouping: Option<&Arc<GroupingDescriptor>>) -> Result<Value> {
    match grouping {
        Some(g) => Ok(Value::Grouped(GroupedColumn::new(series, g.clone())?)),
        None => Ok(Value::Column(series)),
    }
}

fn gather(series: &Series, idx: Vec<IdxSize>) -> Result<Series> {
    Ok(series.take(&IdxCa::from_vec(PlSmallStr::EMPTY, idx))?)
}

/// Recycle a plain vector of length M to `n` rows.
fn recycle(series: &Series, n: usize, grouping: Option<&GroupingDescriptor>) -> Result<Series> {
    let m = series.len();
    let name = series.name().as_str();
    if m == 1 && n != 1 {
        log::debug!("recycle: length-1 `{name}` replicated to {n}");
        return gather(series, vec![0; n]);
    }
    if m == 0 {
        return if n == 0 {
            Ok(series.clone())
        } else {
            Err(TidyError::recycle(name, m, n))
        };
    }

    if m == n {
        return Ok(series.clone());
    }

    if let Some(g) = grouping {
        let sizes: Vec<usize> = g.sizes().into_iter().filter(|&s| s > 0).collect();
        if sizes.iter().all(|&s| s == m) {
            log::debug!("recycle: `{name}` tiled within each of {} groups", sizes.len());
            let mut idx = vec![0 as IdxSize; n];
            for rows in g.group_index().values() {
                for (i, &r) in rows.iter().enumerate() {
                    idx[r as usize] = i as IdxSize;
                }
            }
            return gather(series, idx);
        }
        if n % m == 0 && sizes.iter().all(|&s| s == n / m) {
            log::debug!("recycle: `{name}` tiled across {n} grouped rows");
            return gather(series, (0..n).map(|r| (r % m) as IdxSize).collect());
        }
        return Err(TidyError::recycle(name, m, n));
    }

    if n % m == 0 {
        log::debug!("recycle: `{name}` tiled {} times", n / m);
        return gather(series, (0..n).map(|r| (r % m) as IdxSize).collect());
    }
    Err(TidyError::recycle(name, m, n))
}

/// Recycle a plain operand (vector or ungrouped table) to `n` rows.
fn recycle_plain(value: &Value, n: usize) -> Result<Value> {
    match value {
        Value::Table(t) if t.height() == n => Ok(value.clone()),
        Value::Table(t) if t.height() == 1 => Ok(Value::Table(t.take_rows(&vec![0; n])?)),
        Value::Table(t) => Err(TidyError::recycle("<table>", t.height(), n)),
        _ => broadcast_to(value, n, None),
    }
}

/// Bring an operand onto a grouped target's rows.
fn conform_grouped(value: &Value, target: &Arc<GroupingDescriptor>) -> Result<Value> {
    match value {
        Value::Table(t) => match t.grouping() {
            Some(own) => {
                own.check_compatible(target)?;
                if own.same_partition(target) {
                    Ok(value.clone())
                } else {
                    Err(TidyError::IncompatibleGrouper {
                        left: target.keys().to_vec(),
                        right: own.keys().to_vec(),
                        reason: "grouped tables place group rows differently".into(),
                    })
                }
            }
            None => recycle_plain(value, target.n_rows()),
        },
        _ => broadcast_to(value, target.n_rows(), Some(target)),
    }
}

/// Move grouped values onto `target`'s row placement, group by group.
fn realign(values: &GroupedColumn, target: &GroupingDescriptor) -> Result<Series> {
    let own = values.grouping();
    target.check_compatible(own)?;
    if target.same_partition(own) && same_row_order(target, own) {
        return Ok(values.values().clone());
    }
    let mut idx = vec![0 as IdxSize; target.n_rows()];
    for (key, rows) in target.group_index() {
        // presence checked by check_compatible
        let Some(pos) = own.position(key) else {
            continue;
        };
        for (&to, &from) in rows.iter().zip(own.rows(pos)) {
            idx[to as usize] = from;
        }
    }
    log::debug!("realign: grouped values moved onto target row placement");
    gather(values.values(), idx)
}

fn same_row_order(a: &GroupingDescriptor, b: &GroupingDescriptor) -> bool {
    a.group_index()
        .iter()
        .all(|(key, rows)| b.group_index().get(key) == Some(rows))
}

/// Replicate each group's aggregated value across that group's rows.
fn expand_aggregate(agg: &AggregatedResult, grouping: &GroupingDescriptor) -> Result<Series> {
    let mismatch = |detail: String| TidyError::IncompatibleAggregate {
        expected_keys: grouping.keys().to_vec(),
        expected: grouping.n_groups(),
        got_keys: agg.key_names().to_vec(),
        got: agg.len(),
        detail,
    };
    if agg.key_names() != grouping.keys() || agg.len() != grouping.n_groups() {
        return Err(mismatch(String::new()));
    }
    let mut idx = vec![0 as IdxSize; grouping.n_rows()];
    for (pos, key) in agg.index().iter().enumerate() {
        let group = grouping
            .position(key)
            .ok_or_else(|| mismatch(format!("; group {key} is not a group of the target")))?;
        for &row in grouping.rows(group) {
            idx[row as usize] = pos as IdxSize;
        }
    }
    log::debug!(
        "expand_aggregate: {} group values -> {} rows",
        agg.len(),
        grouping.n_rows()
    );
    gather(agg.values(), idx)
}

/// Reorder `agg` to follow the key order of `target`.
fn align_aggregate(agg: &AggregatedResult, target: &AggregatedResult) -> Result<AggregatedResult> {
    let mismatch = |detail: String| TidyError::IncompatibleAggregate {
        expected_keys: target.key_names().to_vec(),
        expected: target.len(),
        got_keys: agg.key_names().to_vec(),
        got: agg.len(),
        detail,
    };
    if agg.key_names() != target.key_names() || agg.len() != target.len() {
        return Err(mismatch(String::new()));
    }
    if agg.index() == target.index() {
        return Ok(agg.clone());
    }
    let mut idx = Vec::with_capacity(target.len());
    for key in target.index() {
        let pos = agg
            .index()
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| mismatch(format!("; group {key} missing")))?;
        idx.push(pos as IdxSize);
    }
    let values = gather(agg.values(), idx)?;
    AggregatedResult::new(
        target.key_names().to_vec(),
        Arc::from(target.index()),
        values,
    )
}
