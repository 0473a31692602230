//! Table container: a Polars frame plus an optional grouping descriptor.
//!
//! Tables are values. Every operation returns a new table; the frame's
//! column buffers are reference counted, so a clone shares storage until a
//! column is replaced.

use std::sync::Arc;

use polars::prelude::*;

use crate::broadcast::{broadcast_base, broadcast_to};
use crate::error::{Result, TidyError};
use crate::grouping::{FactorLevels, GroupOptions, GroupingDescriptor};
use crate::value::{GroupedColumn, OperandKind, Value};

/// Separator between a nested table's name and its sub-columns.
pub const NEST_SEP: char = '$';

/// Name-repair policy applied by [`Table::from_columns`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameRepair {
    /// No repair. Duplicates still fail, the engine cannot store them.
    Minimal,
    /// Fail on empty or duplicated names
    #[default]
    CheckUnique,
    /// Suffix empty or duplicated names with `...<position>`
    Unique,
    /// Make names syntactic, then unique
    Universal,
}

/// Apply a name-repair policy.
pub fn repair_names(names: &[String], repair: NameRepair) -> Result<Vec<String>> {
    match repair {
        NameRepair::Minimal | NameRepair::CheckUnique => {
            let mut dups = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let empty = repair == NameRepair::CheckUnique && name.is_empty();
                if (empty || names[..i].contains(name)) && !dups.contains(name) {
                    dups.push(name.clone());
                }
            }
            if dups.is_empty() {
                Ok(names.to_vec())
            } else {
                Err(TidyError::NameNonUnique(dups))
            }
        }
        NameRepair::Unique => Ok(make_unique(names)),
        NameRepair::Universal => {
            let syntactic: Vec<String> = names.iter().map(|n| make_syntactic(n)).collect();
            Ok(make_unique(&syntactic))
        }
    }
}

fn strip_position_suffix(name: &str) -> &str {
    match name.rfind("...") {
        Some(at)
            if at + 3 < name.len() && name[at + 3..].chars().all(|c| c.is_ascii_digit()) =>
        {
            &name[..at]
        }
        _ => name,
    }
}

fn make_unique(names: &[String]) -> Vec<String> {
    let stripped: Vec<&str> = names.iter().map(|n| strip_position_suffix(n)).collect();
    stripped
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let duplicated = stripped.iter().filter(|other| *other == name).count() > 1;
            if name.is_empty() || duplicated {
                format!("{name}...{}", i + 1)
            } else {
                (*name).to_string()
            }
        })
        .collect()
}

fn make_syntactic(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '.'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit() || c == '_') {
        out.insert(0, '.');
    }
    out
}

#[derive(Debug, Clone)]
pub struct Table {
    data: DataFrame,
    grouping: Option<Arc<GroupingDescriptor>>,
    levels: FactorLevels,
}

impl Table {
    pub fn new(data: DataFrame) -> Self {
        Self {
            data,
            grouping: None,
            levels: FactorLevels::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(DataFrame::empty())
    }

    /// Build a table from named values, recycling each to a common length.
    pub fn from_columns(columns: Vec<(String, Value)>, repair: NameRepair) -> Result<Self> {
        let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
        let names = repair_names(&names, repair)?;
        let mut table = Self::empty();
        for (name, (_, value)) in names.iter().zip(columns) {
            table = table.set_column(name, value)?;
        }
        Ok(table)
    }

    pub(crate) fn from_parts(
        data: DataFrame,
        grouping: Option<Arc<GroupingDescriptor>>,
        levels: FactorLevels,
    ) -> Self {
        Self {
            data,
            grouping,
            levels,
        }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.data
    }

    pub fn into_frame(self) -> DataFrame {
        self.data
    }

    pub fn height(&self) -> usize {
        self.data.height()
    }

    pub fn width(&self) -> usize {
        self.data.width()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.data
            .get_column_names()
            .into_iter()
            .map(|n| n.to_string())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.data.column(name).is_ok()
    }

    pub fn grouping(&self) -> Option<&Arc<GroupingDescriptor>> {
        self.grouping.as_ref()
    }

    pub fn levels(&self) -> &FactorLevels {
        &self.levels
    }

    /// Grouping key columns (row-wise identity columns for row-wise tables).
    pub fn group_vars(&self) -> Vec<String> {
        self.grouping
            .as_ref()
            .map(|g| g.keys().to_vec())
            .unwrap_or_default()
    }

    pub fn is_grouped(&self) -> bool {
        self.grouping.as_ref().is_some_and(|g| !g.is_rowwise())
    }

    pub fn is_rowwise(&self) -> bool {
        self.grouping.as_ref().is_some_and(|g| g.is_rowwise())
    }

    pub fn kind(&self) -> OperandKind {
        match &self.grouping {
            None => OperandKind::Table,
            Some(g) if g.is_rowwise() => OperandKind::RowwiseTable,
            Some(_) => OperandKind::GroupedTable,
        }
    }

    /// Declare a string column as a factor with ordered `levels`.
    pub fn with_factor(&self, name: &str, levels: &[&str]) -> Result<Table> {
        let column = self
            .data
            .column(name)
            .map_err(|_| TidyError::ColumnNotFound(name.to_string()))?;
        let strings = column.as_materialized_series().str().map_err(|_| {
            TidyError::type_error("string column for a factor", column.dtype().to_string())
        })?;
        for value in strings.into_iter().flatten() {
            if !levels.contains(&value) {
                return Err(TidyError::ArgError(format!(
                    "value `{value}` of `{name}` is not one of the levels {levels:?}"
                )));
            }
        }
        let mut out = self.clone();
        out.levels.insert(
            name.to_string(),
            levels.iter().map(|l| l.to_string()).collect(),
        );
        if out.group_vars().iter().any(|k| k == name) {
            out.regroup()?;
        }
        Ok(out)
    }

    /// Assign `value` to column `name`, broadcasting it to the table's rows.
    ///
    /// A table value is flattened into `name$col` columns. If the value needs
    /// more rows than a size-1 group (or a one-row table) has, those rows are
    /// replicated first.
    pub fn set_column(&self, name: &str, value: impl Into<Value>) -> Result<Table> {
        let value = value.into();
        if let Value::Table(sub) = value {
            let mut out = self.drop_if_present(name)?;
            for column in sub.frame().get_columns() {
                let nested = format!("{name}{NEST_SEP}{}", column.name());
                let sub_value = Value::Column(column.as_materialized_series().clone());
                out = out.set_column(&nested, sub_value)?;
            }
            return Ok(out);
        }

        let base = self.drop_nested(name)?;
        let base = broadcast_base(&base, &value)?;
        let target_rows = if base.width() == 0 {
            value.len().unwrap_or(1)
        } else {
            base.height()
        };
        let aligned = broadcast_to(&value, target_rows, base.grouping())?;
        let series = aligned.to_series()?.with_name(name.into());
        base.with_series(series)
    }

    /// Look up a column; grouped tables yield grouped columns.
    ///
    /// A name with no exact match is tried as a nesting prefix and returns
    /// the sub-table of its `name$*` columns.
    pub fn get_column(&self, name: &str) -> Result<Value> {
        if let Ok(column) = self.data.column(name) {
            let series = column.as_materialized_series().clone();
            return match &self.grouping {
                Some(g) => Ok(Value::Grouped(GroupedColumn::new(series, g.clone())?)),
                None => Ok(Value::Column(series)),
            };
        }
        let nested = self.nested_columns(name);
        if nested.is_empty() {
            return Err(TidyError::ColumnNotFound(name.to_string()));
        }
        let prefix_len = name.len() + NEST_SEP.len_utf8();
        let columns: Vec<Column> = nested
            .into_iter()
            .map(|c| {
                let short = PlSmallStr::from(&c.name().as_str()[prefix_len..]);
                c.clone().with_name(short)
            })
            .collect();
        Ok(Value::Table(Table::new(DataFrame::new(columns)?)))
    }

    /// A plain column, ignoring grouping.
    pub fn pull(&self, name: &str) -> Result<Series> {
        self.data
            .column(name)
            .map(|c| c.as_materialized_series().clone())
            .map_err(|_| TidyError::ColumnNotFound(name.to_string()))
    }

    pub fn group_by(&self, keys: &[&str], drop_unobserved: bool) -> Result<Table> {
        let options = GroupOptions::new().with_drop_unobserved(drop_unobserved);
        self.group_by_with(keys, options)
    }

    pub fn group_by_with(&self, keys: &[&str], options: GroupOptions) -> Result<Table> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let grouping = GroupingDescriptor::build(&self.data, &keys, options, &self.levels)?;
        Ok(Self::from_parts(
            self.data.clone(),
            Some(Arc::new(grouping)),
            self.levels.clone(),
        ))
    }

    pub fn row_wise(&self, keys: &[&str]) -> Result<Table> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        if let Some(missing) = keys.iter().find(|k| !self.has_column(k)) {
            return Err(TidyError::ColumnNotFound(missing.clone()));
        }
        let grouping = GroupingDescriptor::rowwise(self.height(), &keys);
        Ok(Self::from_parts(
            self.data.clone(),
            Some(Arc::new(grouping)),
            self.levels.clone(),
        ))
    }

    pub fn ungroup(&self) -> Table {
        Self::from_parts(self.data.clone(), None, self.levels.clone())
    }

    /// Remove a column, or every column nested under `name`.
    pub fn drop_column(&self, name: &str) -> Result<Table> {
        if !self.has_column(name) && self.nested_columns(name).is_empty() {
            return Err(TidyError::ColumnNotFound(name.to_string()));
        }
        if self.group_vars().iter().any(|k| k == name) {
            return Err(TidyError::ArgError(format!(
                "cannot remove grouping variable `{name}`"
            )));
        }
        self.drop_if_present(name)
    }

    /// Keep only `names`, in that order. A name may be a nesting prefix.
    ///
    /// Grouping keys must be among the kept columns.
    pub fn select_columns(&self, names: &[String]) -> Result<Table> {
        let mut columns: Vec<Column> = Vec::with_capacity(names.len());
        for name in names {
            let found: Vec<&Column> = match self.data.column(name) {
                Ok(column) => vec![column],
                Err(_) => self.nested_columns(name),
            };
            if found.is_empty() {
                return Err(TidyError::ColumnNotFound(name.clone()));
            }
            for column in found {
                if !columns.iter().any(|c| c.name() == column.name()) {
                    columns.push(column.clone());
                }
            }
        }
        if let Some(key) = self
            .group_vars()
            .into_iter()
            .find(|k| !columns.iter().any(|c| c.name().as_str() == k))
        {
            return Err(TidyError::ArgError(format!(
                "grouping variable `{key}` must be selected"
            )));
        }
        self.replace_columns(columns)
    }

    /// Rename columns by `(old, new)` pairs. An `old` nesting prefix renames
    /// every column under it; grouping keys and factor levels follow.
    pub fn rename_columns(&self, renames: &[(String, String)]) -> Result<Table> {
        let mut names = self.column_names();
        let mut grouping = self.grouping.as_deref().cloned();
        let mut levels = self.levels.clone();
        for (old, new) in renames {
            let prefix = format!("{old}{NEST_SEP}");
            let mut hit = false;
            for name in names.iter_mut() {
                let renamed = if *name == *old {
                    new.clone()
                } else if let Some(rest) = name.strip_prefix(prefix.as_str()) {
                    format!("{new}{NEST_SEP}{rest}")
                } else {
                    continue;
                };
                if let Some(lv) = levels.remove(name.as_str()) {
                    levels.insert(renamed.clone(), lv);
                }
                *name = renamed;
                hit = true;
            }
            if !hit {
                return Err(TidyError::ColumnNotFound(old.clone()));
            }
            grouping = grouping.map(|g| g.renamed(old, new));
        }
        let names = repair_names(&names, NameRepair::CheckUnique)?;

        let columns: Vec<Column> = self
            .data
            .get_columns()
            .iter()
            .zip(&names)
            .map(|(c, name)| c.clone().with_name(name.as_str().into()))
            .collect();
        let data = if columns.is_empty() {
            DataFrame::empty()
        } else {
            DataFrame::new(columns)?
        };
        Ok(Self::from_parts(data, grouping.map(Arc::new), levels))
    }

    /// Rows at `idx`, in that order; the grouping is rebuilt over them.
    pub fn take_rows(&self, idx: &[IdxSize]) -> Result<Table> {
        let data = self
            .data
            .take(&IdxCa::from_vec(PlSmallStr::EMPTY, idx.to_vec()))?;
        self.with_frame(data)
    }

    /// Ungrouped sub-table holding the rows of one group.
    pub fn group_slice(&self, group: usize) -> Result<Table> {
        let rows = match &self.grouping {
            Some(g) => g.rows(group).to_vec(),
            None => (0..self.height() as IdxSize).collect(),
        };
        let data = self.data.take(&IdxCa::from_vec(PlSmallStr::EMPTY, rows))?;
        Ok(Self::from_parts(data, None, self.levels.clone()))
    }

    /// Replace the frame, rebuilding the grouping over its rows.
    pub(crate) fn with_frame(&self, data: DataFrame) -> Result<Table> {
        let mut levels = self.levels.clone();
        levels.retain(|name, _| data.column(name).is_ok());
        let grouping = match &self.grouping {
            Some(g) => Some(Arc::new(g.rebuild(&data, &levels)?)),
            None => None,
        };
        Ok(Self::from_parts(data, grouping, levels))
    }

    fn regroup(&mut self) -> Result<()> {
        if let Some(g) = &self.grouping {
            self.grouping = Some(Arc::new(g.rebuild(&self.data, &self.levels)?));
        }
        Ok(())
    }

    fn with_series(&self, series: Series) -> Result<Table> {
        let name = series.name().to_string();
        let mut data = self.data.clone();
        data.with_column(Column::from(series))?;
        let mut levels = self.levels.clone();
        levels.remove(&name);
        let mut out = Self::from_parts(data, self.grouping.clone(), levels);
        if out.group_vars().contains(&name) {
            log::debug!("grouping variable `{name}` replaced, regrouping");
            out.regroup()?;
        }
        Ok(out)
    }

    fn nested_columns(&self, name: &str) -> Vec<&Column> {
        let prefix = format!("{name}{NEST_SEP}");
        self.data
            .get_columns()
            .iter()
            .filter(|c| c.name().starts_with(prefix.as_str()))
            .collect()
    }

    fn drop_nested(&self, name: &str) -> Result<Table> {
        let nested: Vec<String> = self
            .nested_columns(name)
            .into_iter()
            .map(|c| c.name().to_string())
            .collect();
        if nested.is_empty() {
            return Ok(self.clone());
        }
        let keep: Vec<Column> = self
            .data
            .get_columns()
            .iter()
            .filter(|c| !nested.iter().any(|n| n == c.name().as_str()))
            .cloned()
            .collect();
        self.replace_columns(keep)
    }

    fn drop_if_present(&self, name: &str) -> Result<Table> {
        let out = self.drop_nested(name)?;
        if !out.has_column(name) {
            return Ok(out);
        }
        let keep: Vec<Column> = out
            .data
            .get_columns()
            .iter()
            .filter(|c| c.name().as_str() != name)
            .cloned()
            .collect();
        out.replace_columns(keep)
    }

    /// Swap in a new column set over the same rows.
    pub(crate) fn replace_columns(&self, columns: Vec<Column>) -> Result<Table> {
        let data = if columns.is_empty() {
            DataFrame::empty()
        } else {
            DataFrame::new(columns)?
        };
        let mut levels = self.levels.clone();
        levels.retain(|name, _| data.column(name).is_ok());
        Ok(Self::from_parts(data, self.grouping.clone(), levels))
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        let same_grouping = match (&self.grouping, &other.grouping) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_partition(b),
            _ => false,
        };
        same_grouping
            && self.column_names() == other.column_names()
            && self.data.equals_missing(&other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn check_unique_rejects_duplicates() {
        let err = repair_names(&names(&["a", "b", "a"]), NameRepair::CheckUnique).unwrap_err();
        assert!(matches!(err, TidyError::NameNonUnique(d) if d == vec!["a".to_string()]));
    }

    #[test]
    fn unique_repair_suffixes_positions() {
        let repaired = repair_names(&names(&["a", "b", "a", ""]), NameRepair::Unique).unwrap();
        assert_eq!(repaired, names(&["a...1", "b", "a...3", "...4"]));
    }

    #[test]
    fn universal_repair_makes_names_syntactic() {
        let repaired = repair_names(&names(&["a b", "1x", "a.b"]), NameRepair::Universal).unwrap();
        assert_eq!(repaired, names(&["a.b...1", ".1x", "a.b...3"]));
    }

    #[test]
    fn set_column_recycles_scalar() {
        let table = Table::new(df! { "x" => &[1, 2, 3] }.unwrap());
        let out = table.set_column("y", ScalarValue::Int(5)).unwrap();
        let y = out.pull("y").unwrap();
        assert_eq!(y.i64().unwrap().into_no_null_iter().collect::<Vec<_>>(), vec![5, 5, 5]);
        // input untouched
        assert_eq!(table.width(), 1);
    }

    #[test]
    fn nested_table_round_trip() {
        let sub = Table::new(df! { "x" => &[1] }.unwrap());
        let table = Table::empty().set_column("y", sub.clone()).unwrap();
        assert_eq!(table.column_names(), names(&["y$x"]));
        let back = table.get_column("y").unwrap();
        assert_eq!(back.as_table().unwrap(), &sub);
    }

    #[test]
    fn missing_column_is_reported() {
        let table = Table::new(df! { "x" => &[1] }.unwrap());
        assert!(matches!(
            table.get_column("nope"),
            Err(TidyError::ColumnNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn replacing_group_key_regroups() {
        let table = Table::new(df! { "g" => &[1, 1, 2], "x" => &[1, 2, 3] }.unwrap())
            .group_by(&["g"], true)
            .unwrap();
        let out = table.set_column("g", ScalarValue::Int(7)).unwrap();
        assert_eq!(out.grouping().unwrap().n_groups(), 1);
        assert_eq!(out.grouping().unwrap().sizes(), vec![3]);
    }

    #[test]
    fn rename_follows_grouping_and_nesting() {
        let table = Table::new(df! { "g" => &[1, 2], "p$a" => &[3, 4] }.unwrap())
            .group_by(&["g"], true)
            .unwrap();
        let renames = vec![("g".to_string(), "k".to_string()), ("p".to_string(), "q".to_string())];
        let out = table.rename_columns(&renames).unwrap();
        assert_eq!(out.column_names(), names(&["k", "q$a"]));
        assert_eq!(out.group_vars(), names(&["k"]));
        assert!(matches!(
            table.rename_columns(&[("g".to_string(), "p$a".to_string())]),
            Err(TidyError::NameNonUnique(_))
        ));
    }

    #[test]
    fn select_requires_group_keys() {
        let table = Table::new(df! { "g" => &[1, 2], "x" => &[3, 4] }.unwrap())
            .group_by(&["g"], true)
            .unwrap();
        assert!(table.select_columns(&names(&["x"])).is_err());
        let out = table.select_columns(&names(&["x", "g"])).unwrap();
        assert_eq!(out.column_names(), names(&["x", "g"]));
        assert!(out.is_grouped());
    }

    #[test]
    fn factor_values_must_be_levels() {
        let table = Table::new(df! { "f" => &["a", "z"] }.unwrap());
        assert!(table.with_factor("f", &["a", "b"]).is_err());
        assert!(table.with_factor("f", &["a", "z"]).is_ok());
    }
}
