//! Error taxonomy shared by the table container, broadcast engine and dispatch layer.

use polars::prelude::PolarsError;
use thiserror::Error;

use crate::value::OperandKind;

#[derive(Error, Debug)]
pub enum TidyError {
    #[error("Column `{0}` not found")]
    ColumnNotFound(String),

    #[error("Incompatible groupers: {left:?} vs {right:?} ({reason})")]
    IncompatibleGrouper {
        left: Vec<String>,
        right: Vec<String>,
        reason: String,
    },

    #[error(
        "Aggregated result with {got} group(s) keyed by {got_keys:?} does not match {expected} group(s) keyed by {expected_keys:?}{detail}"
    )]
    IncompatibleAggregate {
        expected_keys: Vec<String>,
        expected: usize,
        got_keys: Vec<String>,
        got: usize,
        detail: String,
    },

    #[error("Can't recycle `{name}` of size {from} to size {to}")]
    RecycleLength {
        name: String,
        from: usize,
        to: usize,
    },

    #[error("`{function}()` is an aggregate with no row-wise implementation")]
    RowwiseNotSupported { function: String },

    #[error("Names must be unique, duplicated: {0:?}")]
    NameNonUnique(Vec<String>),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("No implementation of `{function}()` for {operand}")]
    NoImplementation {
        function: String,
        operand: OperandKind,
    },

    #[error("`{function}()` is registered as {existing}, cannot register it as {requested}")]
    KindConflict {
        function: String,
        existing: String,
        requested: String,
    },

    #[error("Type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("Argument error: {0}")]
    ArgError(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),
}

impl TidyError {
    pub(crate) fn recycle(name: impl Into<String>, from: usize, to: usize) -> Self {
        TidyError::RecycleLength {
            name: name.into(),
            from,
            to,
        }
    }

    pub(crate) fn type_error(expected: impl Into<String>, got: impl Into<String>) -> Self {
        TidyError::TypeError {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TidyError>;
