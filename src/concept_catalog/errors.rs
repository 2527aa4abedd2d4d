use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("malformed schema name '{name}'")]
    MalformedName { name: String },

    #[error("{kind} '{name}' not found in schema")]
    NotFound { kind: &'static str, name: String },

    #[error("'{name}' is not a {expected}")]
    WrongKind { name: String, expected: &'static str },

    #[error("concept '{concept}' has no pointer '{pointer}'")]
    UnknownPointer { concept: String, pointer: String },

    #[error("link '{link}' has no property '{property}'")]
    UnknownProperty { link: String, property: String },

    #[error("concepts {left} and {right} share no common ancestor")]
    NoCommonAncestor { left: String, right: String },
}
