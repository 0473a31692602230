//! tidyframe - dplyr-style verbs over Polars dataframes
//!
//! Grouped tables, aggregate-to-row broadcasting and per-operand function
//! dispatch, with R's recycling and NA rules.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tidyframe::{Registry, SummariseGroups, Table, call, col, lit, verbs};
//!
//! let registry = Registry::with_builtins();
//! let table = Table::new(df)
//!     .group_by(&["g"], true)?;
//!
//! // summaries broadcast back to their group
//! let centered = verbs::mutate(
//!     &table,
//!     &[("dx", col("x") - call("mean", [col("x")]))],
//!     &registry,
//! )?;
//!
//! let kept = verbs::filter(&centered, &[col("dx").gt(lit(0))], &registry)?;
//! let totals = verbs::summarise(
//!     &kept,
//!     &[("total", call("sum", [col("x")]))],
//!     SummariseGroups::DropLast,
//!     &registry,
//! )?;
//! ```
//!
//! ## Operands
//!
//! - scalar, bare array, plain column
//! - grouped column (N rows + grouping), row-wise column
//! - aggregated result (one value per group, keyed)
//! - table, grouped table, row-wise table
//!
//! See [`broadcast`] for how two operands are aligned and [`dispatch`] for
//! how a function is picked per operand kind.

pub mod broadcast;
mod builtins;
pub mod dispatch;
mod error;
pub mod eval;
pub mod expr;
pub mod grouping;
pub mod ops;
mod table;
mod value;
pub mod verbs;

// ============ Primary Public API ============

pub use broadcast::{Broadcasted, broadcast_base, broadcast_pair, broadcast_to};
pub use dispatch::{FunctionKind, Implementation, Registration, Registry};
pub use error::{Result, TidyError};
pub use eval::EvalContext;
pub use expr::{Expr, call, col, if_else, lit, n, values};
pub use grouping::{GroupKey, GroupOptions, GroupOrder, GroupingDescriptor, KeyValue};
pub use ops::{BinOp, UnaryOp};
pub use table::{NEST_SEP, NameRepair, Table, repair_names};
pub use value::{AggregatedResult, GroupedColumn, OperandKind, ScalarValue, Value};
pub use verbs::SummariseGroups;
