//! Device I/O collaborator interface.
//!
//! The routing engine never talks to hardware directly. It opens a [`DeviceSession`] through a
//! [`ResourceManager`] (VISA-style resource locators such as `"ASRL2::INSTR"` or `"SIM::1"`)
//! and only ever writes terminated messages and reads terminated replies.
//!
//! Implementations:
//! - [`sim::SimResourceManager`] - in-memory SCPI-like devices for tests and demos

pub mod sim;

use crate::error::DeviceError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Query used to identify an instrument on first contact.
pub const IDENTITY_QUERY: &str = "*IDN?";

/// Per-session I/O settings.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    /// Read termination characters; a read ends on the last one
    pub read_terminator: String,
    /// Appended to every write
    pub write_terminator: String,
    /// Low level I/O timeout
    pub io_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_terminator: "\n".to_string(),
            write_terminator: "\r\n".to_string(),
            io_timeout: Duration::from_millis(10),
        }
    }
}

impl SessionOptions {
    /// Byte a read stops at.
    pub fn read_delimiter(&self) -> u8 {
        self.read_terminator.bytes().last().unwrap_or(b'\n')
    }
}

/// An open connection to one instrument.
#[async_trait]
pub trait DeviceSession: Send {
    /// Resource locator this session was opened on.
    fn resource(&self) -> &str;

    /// Write a message; the session appends the write terminator.
    async fn write(&mut self, message: &[u8]) -> Result<(), DeviceError>;

    /// Read until the read delimiter. The delimiter is not part of the result.
    async fn read(&mut self) -> Result<Bytes, DeviceError>;

    /// Write then read.
    async fn query(&mut self, message: &str) -> Result<String, DeviceError> {
        self.write(message.as_bytes()).await?;
        let reply = self.read().await?;
        String::from_utf8(reply.to_vec()).map_err(|e| DeviceError::Malformed(e.to_string()))
    }

    /// Ask the instrument who it is.
    async fn query_identity(&mut self) -> Result<String, DeviceError> {
        self.query(IDENTITY_QUERY).await
    }
}

/// Opens device sessions by resource locator.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Open a fresh session on `resource`.
    async fn open(
        &self,
        resource: &str,
        options: &SessionOptions,
    ) -> Result<Box<dyn DeviceSession>, DeviceError>;
}
