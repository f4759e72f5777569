use thiserror::Error;

/// Error surface returned by the planner.
///
/// `Display` renders exactly the wire-compatible string: callers may match on
/// `starts_with("unsupported: ")` to distinguish rejected constructs from
/// catalog/internal failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PlannerError {
    /// Build the `unsupported: <reason>` contract string.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        PlannerError::Unsupported(reason.into())
    }

    pub fn catalog(reason: impl Into<String>) -> Self {
        PlannerError::Catalog(reason.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        PlannerError::Malformed(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        PlannerError::Internal(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, PlannerError>;
