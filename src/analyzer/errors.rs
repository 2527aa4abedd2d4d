use thiserror::Error;

use crate::concept_catalog::errors::SchemaError;

pub type TransformResult<T> = Result<T, TransformError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    /// A surface name does not resolve, or an atomic-ref expression reaches
    /// outside the atoms local to its context.
    #[error("reference error: {message}")]
    Reference { message: String },

    /// Structural violation in the tree being transformed.
    #[error("tree error: {message}")]
    Tree { message: String },

    #[error("invalid expression mix of aggregates and non-aggregates")]
    AggregateMix,

    #[error("{operation} applied to concept '{concept}' without any search configuration")]
    SearchConfiguration {
        operation: String,
        concept: String,
        hint: String,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl TransformError {
    pub fn reference(message: impl Into<String>) -> TransformError {
        TransformError::Reference {
            message: message.into(),
        }
    }

    pub fn tree(message: impl Into<String>) -> TransformError {
        TransformError::Tree {
            message: message.into(),
        }
    }
}
