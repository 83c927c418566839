// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for configuration loading and validation.

/// All errors that can occur while assembling the service configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An environment variable or file field failed to parse.
    #[error("invalid value for `{key}`: {details}")]
    InvalidValue {
        /// The configuration key that failed to parse.
        key: String,
        /// Parser output describing the failure.
        details: String,
    },

    /// A configuration file could not be read or decoded.
    #[error("failed to load configuration file `{path}`: {details}")]
    FileError {
        /// Path of the offending file.
        path: String,
        /// I/O or decoder output describing the failure.
        details: String,
    },

    /// A cross-field validation rule was violated.
    #[error("invalid configuration: {details}")]
    Validation {
        /// Description of the violated rule.
        details: String,
    },
}
