//! Routed command envelopes and execution queue entries.
//!
//! An [`Envelope`] is what the transport hands the controller: a target id, a command name
//! and its arguments. Once the router has resolved the target it becomes a [`QueueEntry`],
//! the unit that travels through a station queue into an executor inbox.
//!
//! # Wire format
//!
//! ```json
//! {"id": "4321", "cmd": "set_voltage", "args": [1.5], "kwargs": {}}
//! ```
//!
//! `args` and `kwargs` may be omitted and default to empty.

use crate::error::LabError;
use crate::outbox::Record;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::oneshot;

/// Value produced by a completed command.
pub type CommandOutput = Value;

/// Formatter turning a command result into an outbox record.
pub type RecordFormatter = Box<dyn FnOnce(&CommandOutput) -> Record + Send>;

/// One routed command request. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "id")]
    target_id: String,
    #[serde(rename = "cmd")]
    command: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope addressed to `target_id`.
    pub fn new(
        target_id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            command: command.into(),
            args,
            kwargs,
        }
    }

    /// Deserialize an envelope from a raw transport record.
    pub fn from_slice(raw: &[u8]) -> Result<Self, LabError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Serialize to the wire representation.
    pub fn to_vec(&self) -> Result<Vec<u8>, LabError> {
        serde_json::to_vec(self).map_err(LabError::from)
    }

    /// Controller id or instrument id.
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Command name.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Positional arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Keyword arguments.
    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Convert into an execution entry. Transport-originated entries never carry a reply.
    pub fn into_entry(self) -> QueueEntry {
        QueueEntry {
            command: self.command,
            args: self.args,
            kwargs: self.kwargs,
            reply: None,
        }
    }
}

/// Continuation run when a command completes successfully.
pub enum Reply {
    /// Hand the raw result to an awaiting caller.
    Caller(oneshot::Sender<CommandOutput>),
    /// Render the result into an outbox record.
    Record(RecordFormatter),
    /// Complete silently.
    Discard,
}

impl Reply {
    /// Build a record continuation from a closure.
    pub fn record<F>(formatter: F) -> Self
    where
        F: FnOnce(&CommandOutput) -> Record + Send + 'static,
    {
        Reply::Record(Box::new(formatter))
    }

    /// Build a caller continuation and the receiver the caller awaits.
    pub fn caller() -> (Self, oneshot::Receiver<CommandOutput>) {
        let (tx, rx) = oneshot::channel();
        (Reply::Caller(tx), rx)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Caller(_) => f.write_str("Reply::Caller"),
            Reply::Record(_) => f.write_str("Reply::Record"),
            Reply::Discard => f.write_str("Reply::Discard"),
        }
    }
}

/// A command waiting in a station queue or executor inbox.
#[derive(Debug)]
pub struct QueueEntry {
    /// Command name
    pub command: String,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
    /// Where the result goes; `None` drops it
    pub reply: Option<Reply>,
}

impl QueueEntry {
    /// Entry with positional arguments only.
    pub fn new(command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            command: command.into(),
            args,
            kwargs: Map::new(),
            reply: None,
        }
    }

    /// Route the result to `reply`.
    pub fn with_reply(mut self, reply: Reply) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Reply-free copy of the addressing part, used for inspection.
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            command: self.command.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

/// Inspectable view of a queued entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntrySummary {
    /// Command name
    pub command: String,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
}

/// Render `args kwargs` the way invalid-command records show them.
pub fn describe_call(args: &[Value], kwargs: &Map<String, Value>) -> String {
    format!(
        "{} {}",
        Value::Array(args.to_vec()),
        Value::Object(kwargs.clone())
    )
}
