//! Custom error types for the controller.
//!
//! This module defines the primary error type, `LabError`, together with the narrower
//! `CommandError` (failures of a single routed command) and `DeviceError` (failures of the
//! device I/O collaborator). Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify what went wrong in the routing pipeline.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidMessage`**: an inbound record could not be deserialized into an envelope.
//!   Recovered by the router and reported to the outbox.
//! - **`InvalidCommand`**: a command name or its arguments did not resolve against a
//!   command table. Recovered locally and reported to the outbox.
//! - **`Resolution`**: an attached device reported an identity that does not map onto a
//!   known driver.
//! - **`Resource`**: the device handle could not be opened or the first identity query failed.
//! - **`Config`**: configuration could not be loaded.
//! - **`Configuration`**: a loaded configuration failed validation.
//! - **`Task`**: a spawned task panicked or did not stop within its grace period.
//! - **`ShutdownFailed`**: one or more tasks failed while the service was stopping.
//!
//! By using `#[from]`, `LabError` can be created from the lower level error types,
//! so `?` works across the module boundaries.

use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Controller-level failure.
#[derive(Error, Debug)]
pub enum LabError {
    /// Inbound record is not a valid envelope
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A controller command failed to resolve or bind
    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] CommandError),

    /// Identity names no registered driver
    #[error("Unknown instrument type '{kind}' reported by {resource}")]
    Resolution {
        /// Model prefix from the identity reply
        kind: String,
        /// Locator that answered
        resource: String,
    },

    /// Opening or identifying a device failed
    #[error("Resource '{resource}' unavailable: {source}")]
    Resource {
        /// Locator that failed
        resource: String,
        /// Underlying device failure
        #[source]
        source: DeviceError,
    },

    /// Figment could not load the layered configuration
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Loaded configuration failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Transport read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A spawned task panicked or outlived its grace period
    #[error("Task '{task}' failed: {reason}")]
    Task {
        /// Task name, or the instrument id for executors
        task: String,
        /// What went wrong
        reason: String,
    },

    /// Every failure collected while stopping
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<LabError>),
}

impl From<serde_json::Error> for LabError {
    fn from(value: serde_json::Error) -> Self {
        LabError::InvalidMessage(value.to_string())
    }
}

/// Failure of a single command against a command table.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// No table entry by that name
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Arguments did not bind to the parameter list
    #[error("bad arguments for '{command}': {reason}")]
    BadArguments {
        /// Command being bound
        command: String,
        /// First mismatch found
        reason: String,
    },

    /// Device I/O failed mid-command
    #[error("device error: {0}")]
    Device(String),

    /// Handler-specific failure
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// True for errors that stem from how the command was addressed or called,
    /// as opposed to errors raised while it ran.
    pub fn is_invocation_error(&self) -> bool {
        matches!(
            self,
            CommandError::UnknownCommand(_) | CommandError::BadArguments { .. }
        )
    }
}

impl From<DeviceError> for CommandError {
    fn from(value: DeviceError) -> Self {
        CommandError::Device(value.to_string())
    }
}

/// An error that can occur when interacting with a device session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    /// No device at that locator
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Device refused or dropped the session
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No reply within the I/O timeout
    #[error("Read timed out after {0} ms")]
    Timeout(u64),

    /// Write did not reach the device
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Reply bytes were not a usable line
    #[error("Malformed response: {0}")]
    Malformed(String),
}
