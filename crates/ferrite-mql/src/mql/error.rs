//! Error types for the query and aggregation engine

use std::fmt;

use thiserror::Error;

/// Operator categories held by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorCategory {
    /// Query predicates (`$eq`, `$in`, ...)
    Query,
    /// Expression operators (`$add`, `$cond`, ...)
    Expression,
    /// Accumulators (`$sum`, `$push`, ...)
    Accumulator,
    /// Pipeline stages (`$match`, `$group`, ...)
    Pipeline,
    /// Projection operators (`$slice`, `$elemMatch`)
    Projection,
    /// Window functions (`$rank`, `$shift`, ...)
    Window,
}

impl OperatorCategory {
    /// All categories, in registry order
    pub const ALL: [OperatorCategory; 6] = [
        Self::Query,
        Self::Expression,
        Self::Accumulator,
        Self::Pipeline,
        Self::Projection,
        Self::Window,
    ];

    /// Lower-case name used in messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Expression => "expression",
            Self::Accumulator => "accumulator",
            Self::Pipeline => "pipeline",
            Self::Projection => "projection",
            Self::Window => "window",
        }
    }
}

impl fmt::Display for OperatorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query and aggregation errors
#[derive(Debug, Error)]
pub enum MqlError {
    /// Malformed pipeline stage
    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    /// Malformed expression
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// Malformed query criteria
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Malformed projection
    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    /// Operator not registered in the category it was used from
    #[error("Unknown {category} operator: {name}")]
    UnknownOperator {
        /// Category searched
        category: OperatorCategory,
        /// Operator name as written
        name: String,
    },

    /// Operator name does not look like `$name`
    #[error("Invalid operator name: {0}")]
    InvalidOperatorName(String),

    /// Operator registered twice in the same category
    #[error("Operator {name} is already registered in category {category}")]
    DuplicateOperator {
        /// Category registered into
        category: OperatorCategory,
        /// Operator name
        name: String,
    },

    /// Operator applied to a value of the wrong type
    #[error("Type error: {0}")]
    Type(String),

    /// Feature used without the option it depends on
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    /// User-supplied callable failed
    #[error("Script error: {0}")]
    Script(String),
}

impl MqlError {
    /// Shorthand for an unknown operator error
    pub fn unknown(category: OperatorCategory, name: impl Into<String>) -> Self {
        Self::UnknownOperator {
            category,
            name: name.into(),
        }
    }

    /// True for errors raised while validating input shape
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidStage(_)
                | Self::InvalidExpression(_)
                | Self::InvalidQuery(_)
                | Self::InvalidProjection(_)
        )
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, MqlError>;
