use std::fmt;

/// Configuration error returned by processor and server builders.
///
/// Configuration problems are programmer errors: they are raised synchronously
/// at build/configure time and are never retried. Validation happens field by
/// field; a builder that returns `Ok` has accepted every field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field value is outside its accepted type/range.
    InvalidValue {
        /// Name of the offending configuration field
        field: &'static str,
        /// Human-readable explanation of the constraint that was violated
        reason: String,
    },
    /// A required field was left unset and has no usable default.
    MissingField {
        /// Name of the missing configuration field
        field: &'static str,
    },
    /// Two or more fields are individually valid but mutually inconsistent.
    Conflict {
        /// Explanation of the conflicting combination
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid value for '{field}': {reason}")
            }
            ConfigError::MissingField { field } => {
                write!(f, "missing required configuration field '{field}'")
            }
            ConfigError::Conflict { reason } => {
                write!(f, "conflicting configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
