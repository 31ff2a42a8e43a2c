use thiserror::Error;

/// Errors raised while building programs or evaluating queries.
///
/// Construction-time errors (schema, capacity) abort before anything is
/// registered; evaluation-time errors never leave partially committed
/// state behind.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A predicate was used with an arity different from its registered one.
    #[error("arity mismatch for predicate `{name}`: expected {expected}, found {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    /// A rule mentions more distinct variables than the variable id space holds.
    #[error("rule has too many variables (limit {limit})")]
    TooManyVariables { limit: usize },

    /// A tuple is wider than the fixed row representation.
    #[error("tuple width {width} exceeds the row representation limit {limit}")]
    RowWidthExceeded { width: usize, limit: usize },

    /// Adornments are bitmasks over at most 8 argument positions.
    #[error("adorned evaluation supports arity up to 8, predicate has arity {arity}")]
    ArityTooLargeForAdornment { arity: usize },

    /// No more predicate identifiers can be allocated.
    #[error("predicate identifier space exhausted")]
    PredicateIdsExhausted,

    /// The evaluation would require a pattern the engine does not implement.
    /// Reported explicitly instead of silently producing wrong results.
    #[error("unsupported evaluation pattern: {0}")]
    UnsupportedPattern(&'static str),

    /// A rule or literal could not be parsed.
    #[error("cannot parse rule: {0}")]
    Parse(String),

    /// Head literals must be IDB.
    #[error("predicate in head cannot be EDB")]
    EdbHead,

    /// Head literals cannot be negated.
    #[error("head literal cannot be negated")]
    NegatedHead,
}

pub type Result<T> = std::result::Result<T, Error>;
