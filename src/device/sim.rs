//! Simulated resource manager.
//!
//! Provides in-memory instruments that speak a small SCPI dialect, so the controller can run
//! end to end without hardware:
//!
//! - `*IDN?` answers the configured identity string
//! - `HEADER value` stores `value` under `HEADER`
//! - `HEADER?` answers the stored value (or `ERROR` if nothing was stored)
//!
//! Every session opened on the same locator shares one device state, and every write is
//! logged for test verification.
//!
//! # Example
//!
//! ```
//! use lab_control::device::sim::{SimDevice, SimResourceManager};
//! use lab_control::device::{DeviceSession, ResourceManager, SessionOptions};
//!
//! # tokio_test::block_on(async {
//! let rm = SimResourceManager::new()
//!     .with_device("SIM::1", SimDevice::new("PowerSupply-4321").with_register("VOLT", "0.00"));
//! let mut session = rm.open("SIM::1", &SessionOptions::default()).await.unwrap();
//! assert_eq!(session.query_identity().await.unwrap(), "PowerSupply-4321");
//! # })
//! ```

use super::{DeviceSession, ResourceManager, SessionOptions, IDENTITY_QUERY};
use crate::error::DeviceError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Reply to a query nothing was stored for.
pub const ERROR_REPLY: &str = "ERROR";

/// Configuration and live state of one simulated instrument.
#[derive(Clone, Debug)]
pub struct SimDevice {
    identity: String,
    registers: HashMap<String, String>,
    latency: Duration,
    offline: bool,
    pending: VecDeque<u8>,
    writes: Vec<String>,
    opens: usize,
}

impl SimDevice {
    /// New device answering `identity` to `*IDN?`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            registers: HashMap::new(),
            latency: Duration::ZERO,
            offline: false,
            pending: VecDeque::new(),
            writes: Vec::new(),
            opens: 0,
        }
    }

    /// Preload a register value.
    pub fn with_register(mut self, header: &str, value: impl Into<String>) -> Self {
        self.registers.insert(header.to_uppercase(), value.into());
        self
    }

    /// Delay applied to every read and write.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every `open` fail.
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    fn handle_write(&mut self, message: &str, read_terminator: &str) {
        let message = message.trim();
        self.writes.push(message.to_string());

        if let Some(header) = message.strip_suffix('?') {
            let reply = if message.eq_ignore_ascii_case(IDENTITY_QUERY) {
                self.identity.clone()
            } else {
                self.registers
                    .get(&header.trim().to_uppercase())
                    .cloned()
                    .unwrap_or_else(|| ERROR_REPLY.to_string())
            };
            self.pending.extend(reply.bytes());
            self.pending.extend(read_terminator.bytes());
        } else if let Some((header, value)) = message.split_once(char::is_whitespace) {
            self.registers
                .insert(header.to_uppercase(), value.trim().to_string());
        }
    }

    fn take_line(&mut self, delimiter: u8) -> Option<Bytes> {
        let end = self.pending.iter().position(|b| *b == delimiter)?;
        let mut line = BytesMut::with_capacity(end);
        for _ in 0..end {
            if let Some(byte) = self.pending.pop_front() {
                line.extend_from_slice(&[byte]);
            }
        }
        self.pending.pop_front();
        // Drop the rest of a multi-byte terminator such as "\r\n"
        while line.last().is_some_and(|b| b.is_ascii_whitespace()) {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }
}

/// Resource manager backed by [`SimDevice`]s.
#[derive(Clone, Default)]
pub struct SimResourceManager {
    devices: Arc<Mutex<HashMap<String, Arc<Mutex<SimDevice>>>>>,
}

impl SimResourceManager {
    /// Manager with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under `resource`.
    pub fn with_device(self, resource: impl Into<String>, device: SimDevice) -> Self {
        self.add_device(resource, device);
        self
    }

    /// Register a device under `resource`, replacing any previous one.
    pub fn add_device(&self, resource: impl Into<String>, device: SimDevice) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(resource.into(), Arc::new(Mutex::new(device)));
        }
    }

    /// Parse `LOCATOR=IDENTITY` specs, e.g. `"ASRL2::INSTR=PowerSupply-4321"`.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, DeviceError> {
        let manager = Self::new();
        for spec in specs {
            let spec = spec.as_ref();
            let (resource, identity) = spec
                .split_once('=')
                .filter(|(r, i)| !r.trim().is_empty() && !i.trim().is_empty())
                .ok_or_else(|| {
                    DeviceError::Malformed(format!("expected LOCATOR=IDENTITY, got '{spec}'"))
                })?;
            manager.add_device(resource.trim(), SimDevice::new(identity.trim()));
        }
        Ok(manager)
    }

    /// Whether a device answers at `resource`.
    pub fn contains(&self, resource: &str) -> bool {
        self.devices
            .lock()
            .map(|devices| devices.contains_key(resource))
            .unwrap_or(false)
    }

    /// Every message written to `resource`, oldest first.
    pub fn writes(&self, resource: &str) -> Vec<String> {
        self.with_state(resource, |device| device.writes.clone())
            .unwrap_or_default()
    }

    /// Current value of a register.
    pub fn register(&self, resource: &str, header: &str) -> Option<String> {
        self.with_state(resource, |device| {
            device.registers.get(&header.to_uppercase()).cloned()
        })
        .flatten()
    }

    /// Number of sessions opened on `resource`.
    pub fn open_count(&self, resource: &str) -> usize {
        self.with_state(resource, |device| device.opens)
            .unwrap_or(0)
    }

    fn device(&self, resource: &str) -> Option<Arc<Mutex<SimDevice>>> {
        self.devices.lock().ok()?.get(resource).cloned()
    }

    fn with_state<T>(&self, resource: &str, f: impl FnOnce(&SimDevice) -> T) -> Option<T> {
        let device = self.device(resource)?;
        let state = device.lock().ok()?;
        Some(f(&state))
    }
}

#[async_trait]
impl ResourceManager for SimResourceManager {
    async fn open(
        &self,
        resource: &str,
        options: &SessionOptions,
    ) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let device = self
            .device(resource)
            .ok_or_else(|| DeviceError::NotFound(resource.to_string()))?;
        {
            let mut state = device
                .lock()
                .map_err(|_| DeviceError::ConnectionFailed(resource.to_string()))?;
            if state.offline {
                return Err(DeviceError::ConnectionFailed(format!(
                    "{resource} is offline"
                )));
            }
            state.opens += 1;
        }
        tracing::debug!(resource, "Opened simulated session");
        Ok(Box::new(SimSession {
            resource: resource.to_string(),
            device,
            options: options.clone(),
        }))
    }
}

/// Session on a simulated device.
pub struct SimSession {
    resource: String,
    device: Arc<Mutex<SimDevice>>,
    options: SessionOptions,
}

impl SimSession {
    fn latency(&self) -> Duration {
        self.device
            .lock()
            .map(|device| device.latency)
            .unwrap_or_default()
    }

    fn poisoned(&self) -> DeviceError {
        DeviceError::ConnectionFailed(format!("{} state poisoned", self.resource))
    }
}

#[async_trait]
impl DeviceSession for SimSession {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, message: &[u8]) -> Result<(), DeviceError> {
        sleep(self.latency()).await;
        let framed = format!(
            "{}{}",
            String::from_utf8_lossy(message),
            self.options.write_terminator
        );
        let mut device = self.device.lock().map_err(|_| self.poisoned())?;
        device.handle_write(&framed, &self.options.read_terminator);
        Ok(())
    }

    async fn read(&mut self) -> Result<Bytes, DeviceError> {
        sleep(self.latency()).await;
        let delimiter = self.options.read_delimiter();
        let line = {
            let mut device = self.device.lock().map_err(|_| self.poisoned())?;
            device.take_line(delimiter)
        };
        match line {
            Some(line) => Ok(line),
            None => {
                // Nothing will ever arrive on a simulated bus; behave like a read timeout.
                sleep(self.options.io_timeout).await;
                Err(DeviceError::Timeout(
                    u64::try_from(self.options.io_timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }
}
