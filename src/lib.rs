//! # Lab Control Core Library
//!
//! Command routing and per-instrument execution for remotely operated lab instruments.
//! A controller receives command envelopes from a message transport, classifies them as
//! self-directed or instrument-directed, stages them per station, and feeds each instrument's
//! executor, which runs its commands strictly one at a time with a timeout. Every result and
//! diagnostic ends up in a shared outbox drained by the outbound transport.
//!
//! ## Crate Structure
//!
//! - **`envelope`**: the routed `Envelope` and the `QueueEntry`/`Reply` pair that travels to
//!   executors.
//! - **`outbox`**: bounded many-producer, single-drain sink of `Record`s.
//! - **`device`**: `ResourceManager`/`DeviceSession` traits for device I/O, plus the
//!   simulated backend in `device::sim`.
//! - **`command`**: `CommandTable`, explicit name → handler tables with argument binding.
//! - **`driver`**: base instrument commands and the `PowerSupply`/`VNA` drivers.
//! - **`executor`**: per-instrument inbox and single-flight execution loop.
//! - **`registry`** and **`station`**: instrument ownership and station staging queues.
//! - **`router`**: `ControllerRouter` with `route_one`, `dispatch_all` and `attach`.
//! - **`transport`**: JSON-lines binding of the inbound queue and the outbox.
//! - **`service`**: wires everything into a running controller.
//! - **`config`**, **`tracing_setup`**, **`error`**: configuration, logging and errors.

pub mod command;
pub mod config;
pub mod device;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod outbox;
pub mod registry;
pub mod router;
pub mod service;
pub mod station;
pub mod tracing_setup;
pub mod transport;

pub use envelope::{Envelope, QueueEntry, Reply};
pub use error::{CommandError, DeviceError, LabError, LabResult};
pub use executor::{ExecutorHandle, ExecutorState, InstrumentId};
pub use outbox::{Outbox, OutboxDrain, Record};
pub use router::{ControllerRouter, InboundSender, RouteOutcome, RouterSettings};
pub use service::ControllerService;
