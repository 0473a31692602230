//! Runtime values: the closed operand union seen by broadcasting and dispatch.

use std::fmt;
use std::sync::Arc;

use polars::prelude::*;

use crate::error::{Result, TidyError};
use crate::grouping::{GroupKey, GroupingDescriptor};
use crate::table::Table;

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl ScalarValue {
    pub(crate) fn from_any(av: &AnyValue<'_>) -> Self {
        match av {
            AnyValue::Null => ScalarValue::Null,
            AnyValue::Boolean(b) => ScalarValue::Bool(*b),
            AnyValue::Int8(v) => ScalarValue::Int(i64::from(*v)),
            AnyValue::Int16(v) => ScalarValue::Int(i64::from(*v)),
            AnyValue::Int32(v) => ScalarValue::Int(i64::from(*v)),
            AnyValue::Int64(v) => ScalarValue::Int(*v),
            AnyValue::UInt8(v) => ScalarValue::Int(i64::from(*v)),
            AnyValue::UInt16(v) => ScalarValue::Int(i64::from(*v)),
            AnyValue::UInt32(v) => ScalarValue::Int(i64::from(*v)),
            AnyValue::UInt64(v) => match i64::try_from(*v) {
                Ok(v) => ScalarValue::Int(v),
                Err(_) => ScalarValue::Float(*v as f64),
            },
            AnyValue::Float32(v) => ScalarValue::Float(f64::from(*v)),
            AnyValue::Float64(v) => ScalarValue::Float(*v),
            AnyValue::String(s) => ScalarValue::String((*s).to_string()),
            AnyValue::StringOwned(s) => ScalarValue::String(s.to_string()),
            other => ScalarValue::String(other.to_string()),
        }
    }

    /// Repeat the scalar `n` times.
    pub fn to_series(&self, name: &str, n: usize) -> Series {
        let name = PlSmallStr::from(name);
        match self {
            ScalarValue::String(v) => Series::new(name, vec![v.as_str(); n]),
            ScalarValue::Int(v) => Series::new(name, vec![*v; n]),
            ScalarValue::Float(v) => Series::new(name, vec![*v; n]),
            ScalarValue::Bool(v) => Series::new(name, vec![*v; n]),
            ScalarValue::Null => Series::full_null(name, n, &DataType::Null),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(v) => Some(*v),
            ScalarValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int(i64::from(v))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::String(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::String(v)
    }
}

/// Runtime type tag of a [`Value`], the key of dispatch registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Scalar,
    Array,
    Column,
    GroupedColumn,
    RowwiseColumn,
    AggregatedResult,
    Table,
    GroupedTable,
    RowwiseTable,
}

impl OperandKind {
    /// Capability chain searched, nearest first, when no registration
    /// matches this kind exactly.
    pub fn ancestors(self) -> &'static [OperandKind] {
        use OperandKind::*;
        match self {
            Scalar => &[Array],
            Array => &[],
            Column => &[Array],
            GroupedColumn => &[Column, Array],
            RowwiseColumn => &[GroupedColumn, Column, Array],
            AggregatedResult => &[Column, Array],
            Table => &[],
            GroupedTable => &[Table],
            RowwiseTable => &[GroupedTable, Table],
        }
    }

    pub fn is_rowwise(self) -> bool {
        matches!(self, OperandKind::RowwiseColumn | OperandKind::RowwiseTable)
    }

    pub fn is_table(self) -> bool {
        matches!(
            self,
            OperandKind::Table | OperandKind::GroupedTable | OperandKind::RowwiseTable
        )
    }
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperandKind::Scalar => "scalar",
            OperandKind::Array => "array",
            OperandKind::Column => "column",
            OperandKind::GroupedColumn => "grouped column",
            OperandKind::RowwiseColumn => "row-wise column",
            OperandKind::AggregatedResult => "aggregated result",
            OperandKind::Table => "table",
            OperandKind::GroupedTable => "grouped table",
            OperandKind::RowwiseTable => "row-wise table",
        };
        f.write_str(name)
    }
}

/// N row-level values understood per group.
#[derive(Debug, Clone)]
pub struct GroupedColumn {
    values: Series,
    grouping: Arc<GroupingDescriptor>,
}

impl GroupedColumn {
    pub fn new(values: Series, grouping: Arc<GroupingDescriptor>) -> Result<Self> {
        if values.len() != grouping.n_rows() {
            return Err(TidyError::recycle(
                values.name().as_str(),
                values.len(),
                grouping.n_rows(),
            ));
        }
        Ok(Self { values, grouping })
    }

    pub fn values(&self) -> &Series {
        &self.values
    }

    pub fn grouping(&self) -> &Arc<GroupingDescriptor> {
        &self.grouping
    }

    pub fn into_values(self) -> Series {
        self.values
    }

    /// The values of one group, in row order.
    pub fn group_values(&self, group: usize) -> Result<Series> {
        let rows = self.grouping.rows(group).to_vec();
        Ok(self.values.take(&IdxCa::from_vec(PlSmallStr::EMPTY, rows))?)
    }
}

/// One value per group, indexed by group key.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    key_names: Vec<String>,
    index: Arc<[GroupKey]>,
    values: Series,
}

impl AggregatedResult {
    pub fn new(key_names: Vec<String>, index: Arc<[GroupKey]>, values: Series) -> Result<Self> {
        if values.len() != index.len() {
            return Err(TidyError::recycle(
                values.name().as_str(),
                values.len(),
                index.len(),
            ));
        }
        Ok(Self {
            key_names,
            index,
            values,
        })
    }

    /// Aggregated values in the group order of `grouping`.
    pub fn from_grouping(grouping: &GroupingDescriptor, values: Series) -> Result<Self> {
        let index: Arc<[GroupKey]> = grouping.group_keys().cloned().collect();
        Self::new(grouping.keys().to_vec(), index, values)
    }

    pub fn key_names(&self) -> &[String] {
        &self.key_names
    }

    pub fn index(&self) -> &[GroupKey] {
        &self.index
    }

    pub fn values(&self) -> &Series {
        &self.values
    }

    pub fn into_values(self) -> Series {
        self.values
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Value for one group key.
    pub fn get(&self, key: &GroupKey) -> Option<ScalarValue> {
        let pos = self.index.iter().position(|k| k == key)?;
        self.values.get(pos).ok().map(|av| ScalarValue::from_any(&av))
    }

    pub(crate) fn with_values(&self, values: Series) -> Result<Self> {
        Self::new(self.key_names.clone(), self.index.clone(), values)
    }
}

/// An operand: anything an expression can evaluate to.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(ScalarValue),
    /// Bare values with no table provenance
    Array(Series),
    /// A plain (ungrouped) table column
    Column(Series),
    Grouped(GroupedColumn),
    Aggregated(AggregatedResult),
    Table(Table),
}

impl Value {
    pub fn kind(&self) -> OperandKind {
        match self {
            Value::Scalar(_) => OperandKind::Scalar,
            Value::Array(_) => OperandKind::Array,
            Value::Column(_) => OperandKind::Column,
            Value::Grouped(g) if g.grouping().is_rowwise() => OperandKind::RowwiseColumn,
            Value::Grouped(_) => OperandKind::GroupedColumn,
            Value::Aggregated(_) => OperandKind::AggregatedResult,
            Value::Table(t) => t.kind(),
        }
    }

    /// Number of values, `None` for scalars.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Scalar(_) => None,
            Value::Array(s) | Value::Column(s) => Some(s.len()),
            Value::Grouped(g) => Some(g.values().len()),
            Value::Aggregated(a) => Some(a.len()),
            Value::Table(t) => Some(t.height()),
        }
    }

    /// Grouping carried by the value, if any.
    pub fn grouping(&self) -> Option<&Arc<GroupingDescriptor>> {
        match self {
            Value::Grouped(g) => Some(g.grouping()),
            Value::Table(t) => t.grouping(),
            _ => None,
        }
    }

    /// Name used in error messages.
    pub fn label(&self) -> String {
        match self {
            Value::Scalar(s) => format!("{s:?}"),
            Value::Array(s) | Value::Column(s) => s.name().to_string(),
            Value::Grouped(g) => g.values().name().to_string(),
            Value::Aggregated(a) => a.values().name().to_string(),
            Value::Table(_) => "<table>".to_string(),
        }
    }

    /// Row-level values of a non-table operand (scalars become length 1).
    pub fn to_series(&self) -> Result<Series> {
        match self {
            Value::Scalar(s) => Ok(s.to_series("", 1)),
            Value::Array(s) | Value::Column(s) => Ok(s.clone()),
            Value::Grouped(g) => Ok(g.values().clone()),
            Value::Aggregated(a) => Ok(a.values().clone()),
            Value::Table(_) => Err(TidyError::type_error("column-like value", "table")),
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_aggregated(&self) -> Option<&AggregatedResult> {
        match self {
            Value::Aggregated(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_grouped(&self) -> Option<&GroupedColumn> {
        match self {
            Value::Grouped(g) => Some(g),
            _ => None,
        }
    }
}

impl From<ScalarValue> for Value {
    fn from(v: ScalarValue) -> Self {
        Value::Scalar(v)
    }
}

impl From<Series> for Value {
    fn from(s: Series) -> Self {
        Value::Array(s)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

impl From<GroupedColumn> for Value {
    fn from(g: GroupedColumn) -> Self {
        Value::Grouped(g)
    }
}

impl From<AggregatedResult> for Value {
    fn from(a: AggregatedResult) -> Self {
        Value::Aggregated(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_repeats_to_series() {
        let s = ScalarValue::Int(7).to_series("x", 3);
        assert_eq!(s.len(), 3);
        assert_eq!(s.i64().unwrap().get(2), Some(7));
        let nulls = ScalarValue::Null.to_series("x", 2);
        assert_eq!(nulls.null_count(), 2);
    }

    #[test]
    fn large_unsigned_values_do_not_wrap() {
        let big = ScalarValue::from_any(&AnyValue::UInt64(u64::MAX));
        assert_eq!(big, ScalarValue::Float(u64::MAX as f64));
        let small = ScalarValue::from_any(&AnyValue::UInt64(42));
        assert_eq!(small, ScalarValue::Int(42));
    }

    #[test]
    fn rowwise_column_chain_reaches_array() {
        let chain = OperandKind::RowwiseColumn.ancestors();
        assert_eq!(
            chain,
            &[
                OperandKind::GroupedColumn,
                OperandKind::Column,
                OperandKind::Array
            ]
        );
        assert!(OperandKind::Table.ancestors().is_empty());
    }

    #[test]
    fn aggregated_length_must_match_index() {
        let index: Arc<[GroupKey]> = Arc::from(Vec::<GroupKey>::new());
        let err = AggregatedResult::new(vec!["g".into()], index, Series::new("v".into(), &[1]))
            .unwrap_err();
        assert!(matches!(err, TidyError::RecycleLength { from: 1, to: 0, .. }));
    }
}
