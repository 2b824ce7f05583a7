use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    /// A required field is missing or empty.
    MissingField(&'static str),
    /// A field violates a length or range bound.
    OutOfBounds {
        field: &'static str,
        detail: String,
    },
    /// The record timestamp falls outside the accepted window.
    TimestampOutOfRange(String),
    /// A file-descriptor state transition is not legal.
    IllegalTransition { from: &'static str, to: &'static str },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::MissingField(field) => {
                write!(f, "missing required field: {field}")
            }
            ModelError::OutOfBounds { field, detail } => {
                write!(f, "field {field} out of bounds: {detail}")
            }
            ModelError::TimestampOutOfRange(ts) => {
                write!(f, "timestamp out of accepted window: {ts}")
            }
            ModelError::IllegalTransition { from, to } => {
                write!(f, "illegal file state transition: {from} -> {to}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
