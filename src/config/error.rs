// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Configuration error types

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is required but not set")]
    MissingRequired { key: String },

    #[error("{key}='{value}' rejected: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key} failed to parse: {message}")]
    ParseError { key: String, message: String },
}
