// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use miette::Diagnostic;

/// Errors that can occur while loading or validating the balancer
/// configuration.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// A collection of errors that occurred during validation of the
    /// configuration.
    #[error("Invalid configuration: {errors:?}")]
    #[diagnostic(code(pvelb_config::invalid_configuration))]
    InvalidConfiguration {
        /// A list of errors that occurred during validation.
        #[related]
        errors: Vec<Error>,
    },

    /// An error that occurred while reading the configuration file.
    #[error("File read error for `{path}`: {details}")]
    #[diagnostic(code(pvelb_config::file_read_error))]
    FileReadError {
        /// The path of the file that could not be read.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// An error that occurred while deserializing the configuration.
    #[error("YAML deserialization error: {details}")]
    #[diagnostic(code(pvelb_config::deserialization_error))]
    DeserializationError {
        /// A description of the error that occurred.
        details: String,
    },

    /// A guest exclusion entry could not be parsed.
    #[error("Invalid guest exclusion entry `{entry}`: {details}")]
    #[diagnostic(code(pvelb_config::invalid_exclusion))]
    InvalidExclusion {
        /// The entry as written in the configuration.
        entry: String,
        /// Why the entry was rejected.
        details: String,
    },

    /// A numeric option is outside its permitted range.
    #[error("`{option}` is out of range: got {value}, expected {expected}")]
    #[diagnostic(code(pvelb_config::out_of_range))]
    OutOfRange {
        /// The dotted path of the offending option.
        option: String,
        /// The value found in the configuration.
        value: f64,
        /// A description of the permitted range.
        expected: String,
    },

    /// A node id is listed in more than one group.
    #[error("Node `{node}` is listed in groups `{first}` and `{second}`")]
    #[diagnostic(code(pvelb_config::ambiguous_group))]
    AmbiguousGroup {
        /// The node id in question.
        node: String,
        /// The first group that claims the node.
        first: String,
        /// The second group that claims the node.
        second: String,
    },

    /// A required option is missing or empty.
    #[error("`{option}` is required {context}")]
    #[diagnostic(code(pvelb_config::missing_option))]
    MissingOption {
        /// The dotted path of the missing option.
        option: String,
        /// The condition under which the option is required.
        context: String,
    },
}
