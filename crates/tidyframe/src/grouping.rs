//! Grouping descriptors: group keys plus the row partition they induce.
//!
//! A descriptor never owns column data. It records which key columns formed
//! the groups and, per group key, the ordered row positions that belong to
//! it. Row positions across groups partition `[0, n_rows)`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use polars::prelude::*;

use crate::error::{Result, TidyError};

/// Declared factor levels, by column name.
pub type FactorLevels = BTreeMap<String, Arc<[String]>>;

/// One component of a group key.
#[derive(Debug, Clone)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    /// Physical value of a date, datetime, duration or time
    Temporal(i64),
    /// A factor level: ordered by `code`, displayed as `label`
    Level { code: u32, label: String },
}

impl KeyValue {
    pub(crate) fn from_any(av: &AnyValue<'_>) -> Self {
        match av {
            AnyValue::Null => KeyValue::Null,
            AnyValue::Boolean(b) => KeyValue::Bool(*b),
            AnyValue::Int8(v) => KeyValue::Int(i64::from(*v)),
            AnyValue::Int16(v) => KeyValue::Int(i64::from(*v)),
            AnyValue::Int32(v) => KeyValue::Int(i64::from(*v)),
            AnyValue::Int64(v) => KeyValue::Int(*v),
            AnyValue::UInt8(v) => KeyValue::UInt(u64::from(*v)),
            AnyValue::UInt16(v) => KeyValue::UInt(u64::from(*v)),
            AnyValue::UInt32(v) => KeyValue::UInt(u64::from(*v)),
            AnyValue::UInt64(v) => KeyValue::UInt(*v),
            AnyValue::Float32(v) => KeyValue::Float(f64::from(*v)),
            AnyValue::Float64(v) => KeyValue::Float(*v),
            AnyValue::String(s) => KeyValue::Str((*s).to_string()),
            AnyValue::StringOwned(s) => KeyValue::Str(s.to_string()),
            AnyValue::Date(v) => KeyValue::Temporal(i64::from(*v)),
            AnyValue::Datetime(v, _, _) | AnyValue::DatetimeOwned(v, _, _) => {
                KeyValue::Temporal(*v)
            }
            AnyValue::Duration(v, _) => KeyValue::Temporal(*v),
            AnyValue::Time(v) => KeyValue::Temporal(*v),
            other => KeyValue::Str(other.to_string()),
        }
    }

    pub(crate) fn to_any(&self) -> AnyValue<'_> {
        match self {
            KeyValue::Null => AnyValue::Null,
            KeyValue::Bool(b) => AnyValue::Boolean(*b),
            KeyValue::Int(v) => AnyValue::Int64(*v),
            KeyValue::UInt(v) => AnyValue::UInt64(*v),
            KeyValue::Float(v) => AnyValue::Float64(*v),
            KeyValue::Str(s) => AnyValue::String(s.as_str()),
            KeyValue::Temporal(v) => AnyValue::Int64(*v),
            KeyValue::Level { label, .. } => AnyValue::String(label.as_str()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            KeyValue::Bool(_) => 0,
            KeyValue::Int(_) | KeyValue::UInt(_) | KeyValue::Float(_) | KeyValue::Temporal(_) => 1,
            KeyValue::Str(_) => 2,
            KeyValue::Level { .. } => 3,
            KeyValue::Null => 4,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            KeyValue::Null => 0,
            KeyValue::Bool(_) => 1,
            KeyValue::Int(_) => 2,
            KeyValue::UInt(_) => 3,
            KeyValue::Float(_) => 4,
            KeyValue::Str(_) => 5,
            KeyValue::Level { .. } => 6,
            KeyValue::Temporal(_) => 7,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            KeyValue::Int(v) => *v as f64,
            KeyValue::UInt(v) => *v as f64,
            KeyValue::Float(v) => *v,
            KeyValue::Temporal(v) => *v as f64,
            _ => f64::NAN,
        }
    }
}

// -0.0 and 0.0 share a group, as do all NaNs.
fn canonical_bits(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            KeyValue::Null => {}
            KeyValue::Bool(b) => b.hash(state),
            KeyValue::Int(v) => v.hash(state),
            KeyValue::UInt(v) => v.hash(state),
            KeyValue::Float(v) => canonical_bits(*v).hash(state),
            KeyValue::Str(s) => s.hash(state),
            KeyValue::Temporal(v) => v.hash(state),
            KeyValue::Level { code, label } => {
                code.hash(state);
                label.hash(state);
            }
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Nulls sort last, as in R.
impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_rank = self.rank().cmp(&other.rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        let by_value = match (self, other) {
            (KeyValue::Null, KeyValue::Null) => Ordering::Equal,
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::UInt(a), KeyValue::UInt(b)) => a.cmp(b),
            (KeyValue::Float(a), KeyValue::Float(b)) => {
                f64::from_bits(canonical_bits(*a)).total_cmp(&f64::from_bits(canonical_bits(*b)))
            }
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            (KeyValue::Temporal(a), KeyValue::Temporal(b)) => a.cmp(b),
            (
                KeyValue::Level { code: a, label: la },
                KeyValue::Level { code: b, label: lb },
            ) => a.cmp(b).then_with(|| la.cmp(lb)),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        };
        by_value.then_with(|| self.tag().cmp(&other.tag()))
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => write!(f, "NA"),
            KeyValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::UInt(v) => write!(f, "{v}"),
            KeyValue::Float(v) => write!(f, "{v}"),
            KeyValue::Str(s) => write!(f, "{s}"),
            KeyValue::Temporal(v) => write!(f, "{v}"),
            KeyValue::Level { label, .. } => write!(f, "{label}"),
        }
    }
}

/// The tuple of key values identifying one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(pub Vec<KeyValue>);

impl GroupKey {
    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    fn row(row: usize) -> Self {
        GroupKey(vec![KeyValue::UInt(row as u64)])
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Iteration order of groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupOrder {
    /// Ascending key order, nulls last; factor keys follow level order
    #[default]
    Sorted,
    /// Order in which each key combination first appears in the data
    FirstAppearance,
}

/// Options controlling how a grouping descriptor is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupOptions {
    /// Drop factor-level combinations that have no rows
    pub drop_unobserved: bool,
    pub order: GroupOrder,
}

impl GroupOptions {
    pub fn new() -> Self {
        Self {
            drop_unobserved: true,
            order: GroupOrder::Sorted,
        }
    }

    pub fn with_drop_unobserved(mut self, drop: bool) -> Self {
        self.drop_unobserved = drop;
        self
    }

    pub fn with_order(mut self, order: GroupOrder) -> Self {
        self.order = order;
        self
    }
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Group keys plus the per-group row membership of a table.
#[derive(Debug, Clone)]
pub struct GroupingDescriptor {
    keys: Vec<String>,
    groups: IndexMap<GroupKey, Vec<IdxSize>>,
    rowwise: bool,
    n_rows: usize,
    options: GroupOptions,
}

impl GroupingDescriptor {
    /// Build a keyed grouping from the key columns of `frame`.
    pub fn build(
        frame: &DataFrame,
        keys: &[String],
        options: GroupOptions,
        levels: &FactorLevels,
    ) -> Result<Self> {
        let key_series = keys
            .iter()
            .map(|name| {
                frame
                    .column(name)
                    .map(|c| c.as_materialized_series().clone())
                    .map_err(|_| TidyError::ColumnNotFound(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let key_levels: Vec<Option<&Arc<[String]>>> =
            keys.iter().map(|name| levels.get(name)).collect();

        let n_rows = frame.height();
        let mut groups: IndexMap<GroupKey, Vec<IdxSize>> = IndexMap::new();
        for row in 0..n_rows {
            let mut key = Vec::with_capacity(keys.len());
            for (series, lv) in key_series.iter().zip(&key_levels) {
                let av = series.get(row)?;
                key.push(match lv {
                    Some(lv) => level_key(&av, lv),
                    None => KeyValue::from_any(&av),
                });
            }
            groups.entry(GroupKey(key)).or_default().push(row as IdxSize);
        }

        if !options.drop_unobserved && key_levels.iter().any(Option::is_some) {
            add_unobserved(&mut groups, &key_levels);
        }
        if options.order == GroupOrder::Sorted {
            groups.sort_keys();
        }

        log::debug!(
            "grouped {} rows by {:?} into {} groups",
            n_rows,
            keys,
            groups.len()
        );
        Ok(Self {
            keys: keys.to_vec(),
            groups,
            rowwise: false,
            n_rows,
            options,
        })
    }

    /// One group per row; `keys` are retained as identity columns only.
    pub fn rowwise(n_rows: usize, keys: &[String]) -> Self {
        let groups = (0..n_rows)
            .map(|row| (GroupKey::row(row), vec![row as IdxSize]))
            .collect();
        Self {
            keys: keys.to_vec(),
            groups,
            rowwise: true,
            n_rows,
            options: GroupOptions::new().with_order(GroupOrder::FirstAppearance),
        }
    }

    /// Rebuild this descriptor (same keys and options) over a new frame.
    pub(crate) fn rebuild(&self, frame: &DataFrame, levels: &FactorLevels) -> Result<Self> {
        if self.rowwise {
            Ok(Self::rowwise(frame.height(), &self.keys))
        } else {
            Self::build(frame, &self.keys, self.options, levels)
        }
    }

    /// Same keys and group order, group `i` now holding `sizes[i]`
    /// consecutive rows.
    pub(crate) fn reshaped(&self, sizes: &[usize]) -> Self {
        let mut next: IdxSize = 0;
        let groups = self
            .groups
            .keys()
            .zip(sizes)
            .map(|(key, &size)| {
                let rows = (next..next + size as IdxSize).collect();
                next += size as IdxSize;
                (key.clone(), rows)
            })
            .collect();
        Self {
            keys: self.keys.clone(),
            groups,
            rowwise: self.rowwise && sizes.iter().all(|&s| s == 1),
            n_rows: sizes.iter().sum(),
            options: self.options,
        }
    }

    pub(crate) fn renamed(&self, old: &str, new: &str) -> Self {
        let mut out = self.clone();
        for key in &mut out.keys {
            if key == old {
                *key = new.to_string();
            }
        }
        out
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_rowwise(&self) -> bool {
        self.rowwise
    }

    pub fn options(&self) -> GroupOptions {
        self.options
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_index(&self) -> &IndexMap<GroupKey, Vec<IdxSize>> {
        &self.groups
    }

    pub fn group_keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.groups.values().map(Vec::len).collect()
    }

    pub fn rows(&self, group: usize) -> &[IdxSize] {
        self.groups
            .get_index(group)
            .map(|(_, rows)| rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn position(&self, key: &GroupKey) -> Option<usize> {
        self.groups.get_index_of(key)
    }

    /// Group position of every row.
    pub fn group_ids(&self) -> Vec<usize> {
        let mut ids = vec![0; self.n_rows];
        for (g, rows) in self.groups.values().enumerate() {
            for &r in rows {
                ids[r as usize] = g;
            }
        }
        ids
    }

    /// Same keys and, per key, the same set of rows (group order ignored).
    pub fn same_partition(&self, other: &Self) -> bool {
        if self.keys != other.keys
            || self.rowwise != other.rowwise
            || self.n_rows != other.n_rows
            || self.groups.len() != other.groups.len()
        {
            return false;
        }
        self.groups.iter().all(|(key, rows)| {
            other.groups.get(key).is_some_and(|theirs| {
                let mut a = rows.clone();
                let mut b = theirs.clone();
                a.sort_unstable();
                b.sort_unstable();
                a == b
            })
        })
    }

    /// Check that `other` describes the same groups with the same sizes.
    pub fn check_compatible(&self, other: &Self) -> Result<()> {
        let incompatible = |reason: String| TidyError::IncompatibleGrouper {
            left: self.keys.clone(),
            right: other.keys.clone(),
            reason,
        };
        if self.rowwise != other.rowwise {
            return Err(incompatible("row-wise vs keyed grouping".into()));
        }
        if !self.rowwise && self.keys != other.keys {
            return Err(incompatible("different group keys".into()));
        }
        if self.groups.len() != other.groups.len() {
            return Err(incompatible(format!(
                "{} groups vs {} groups",
                self.groups.len(),
                other.groups.len()
            )));
        }
        for (key, rows) in &self.groups {
            match other.groups.get(key) {
                None => return Err(incompatible(format!("group {key} missing on the right"))),
                Some(theirs) if theirs.len() != rows.len() => {
                    return Err(incompatible(format!(
                        "group {key} has size {} vs {}",
                        rows.len(),
                        theirs.len()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// One column per grouping key, one row per group.
    ///
    /// Key values are taken from each group's first row. Only when some
    /// group is empty (an unobserved factor level) are they rebuilt from the
    /// group keys.
    pub fn key_columns(&self, frame: &DataFrame) -> Result<Vec<Column>> {
        let first_rows: Option<Vec<IdxSize>> = self
            .groups
            .values()
            .map(|rows| rows.first().copied())
            .collect();
        let mut out = Vec::with_capacity(self.keys.len());
        for (k, name) in self.keys.iter().enumerate() {
            let source = frame
                .column(name)
                .map_err(|_| TidyError::ColumnNotFound(name.clone()))?
                .as_materialized_series();
            let series = match &first_rows {
                Some(idx) => source.take(&IdxCa::from_vec(PlSmallStr::EMPTY, idx.clone()))?,
                None => {
                    let values: Vec<AnyValue<'_>> =
                        self.groups.keys().map(|key| key.0[k].to_any()).collect();
                    // temporal keys hold their physical value
                    let physical = source.dtype().to_physical();
                    Series::from_any_values_and_dtype(
                        name.as_str().into(),
                        &values,
                        &physical,
                        false,
                    )?
                    .cast(source.dtype())?
                }
            };
            out.push(Column::from(series));
        }
        Ok(out)
    }
}

fn level_key(av: &AnyValue<'_>, levels: &[String]) -> KeyValue {
    let label = match av {
        AnyValue::Null => return KeyValue::Null,
        AnyValue::String(s) => (*s).to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        other => other.to_string(),
    };
    match levels.iter().position(|l| *l == label) {
        Some(code) => KeyValue::Level {
            code: code as u32,
            label,
        },
        None => KeyValue::Null,
    }
}

/// Add empty groups for every factor-level combination, crossed with the
/// observed combinations of the non-factor keys.
fn add_unobserved(
    groups: &mut IndexMap<GroupKey, Vec<IdxSize>>,
    key_levels: &[Option<&Arc<[String]>>],
) {
    let mut observed_rest: Vec<Vec<KeyValue>> = Vec::new();
    let mut seen = HashSet::new();
    for key in groups.keys() {
        let rest: Vec<KeyValue> = key
            .0
            .iter()
            .zip(key_levels)
            .filter(|(_, lv)| lv.is_none())
            .map(|(v, _)| v.clone())
            .collect();
        if seen.insert(rest.clone()) {
            observed_rest.push(rest);
        }
    }

    let mut combos: Vec<Vec<KeyValue>> = vec![Vec::new()];
    for levels in key_levels.iter().flatten() {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                levels.iter().enumerate().map(move |(code, label)| {
                    let mut next = prefix.clone();
                    next.push(KeyValue::Level {
                        code: code as u32,
                        label: label.clone(),
                    });
                    next
                })
            })
            .collect();
    }

    for rest in &observed_rest {
        for combo in &combos {
            let mut rest_iter = rest.iter();
            let mut combo_iter = combo.iter();
            let key = key_levels
                .iter()
                .filter_map(|lv| {
                    if lv.is_some() {
                        combo_iter.next().cloned()
                    } else {
                        rest_iter.next().cloned()
                    }
                })
                .collect();
            groups.entry(GroupKey(key)).or_default();
        }
    }
}
