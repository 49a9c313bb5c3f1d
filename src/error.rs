//! Error types for protorun
//!
//! Each layer owns one error enum. Persistence errors are fatal for a run,
//! execution errors fail the current step (and with it the protocol), and
//! validation errors mean a step was never started.

use thiserror::Error;

use crate::object::ObjectId;

/// Errors raised by the object store.
#[derive(Error, Debug)]
pub enum MapperError {
    #[error("Object {0} not found")]
    NotFound(ObjectId),

    #[error("Class '{0}' is not registered")]
    ClassNotFound(String),

    #[error("Corrupted object tree: {0}")]
    Corruption(String),

    #[error("Object of class '{0}' has not been stored yet")]
    NotStored(String),

    #[error("Object {0} is already stored")]
    AlreadyStored(ObjectId),

    #[error("Invalid field key '{0}': keys must be non-empty and contain no '.'")]
    InvalidKey(String),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// Errors raised by the work of a single step.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("Missing files: {}", .0.join(" "))]
    MissingFiles(Vec<String>),

    #[error("Process returned with code {code}, command: {command}")]
    ProgramFailed { command: String, code: i32 },

    #[error("Execution failed {source}, command: {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Invalid arguments for '{function}': {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while running a protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Step {index} ('{step}') cannot run: {reason}")]
    Validation {
        index: usize,
        step: String,
        reason: String,
    },

    #[error("Protocol failed at step {index} ('{step}'): {source}")]
    Execution {
        index: usize,
        step: String,
        #[source]
        source: ExecutionError,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] MapperError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No step is waiting for approval")]
    NoWaitingStep,

    #[error("Protocol stopped before step {0}")]
    Stopped(usize),

    #[error("Invalid protocol object: {0}")]
    Invalid(String),

    #[error("Project doesn't exist in '{0}'")]
    ProjectNotFound(String),
}

/// Errors raised while loading the engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors raised while loading a pipeline definition.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to read pipeline file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid pipeline: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_message() {
        let err = ExecutionError::MissingFiles(vec!["a.txt".into(), "b.txt".into()]);
        assert_eq!(err.to_string(), "Missing files: a.txt b.txt");
    }

    #[test]
    fn test_program_failed_message() {
        let err = ExecutionError::ProgramFailed {
            command: "false".into(),
            code: 1,
        };
        assert_eq!(err.to_string(), "Process returned with code 1, command: false");
    }

    #[test]
    fn test_protocol_error_wraps_mapper_error() {
        let err: ProtocolError = MapperError::NotFound(7).into();
        assert!(matches!(err, ProtocolError::Persistence(MapperError::NotFound(7))));
        assert!(err.to_string().contains("Object 7 not found"));
    }
}
