//! Shared result/log sink.
//!
//! Every executor and the router append [`Record`]s here for delivery outward. The outbox is a
//! bounded many-producer channel with exactly one consumer, the [`OutboxDrain`]:
//!
//! ```text
//! Executor 1 ──┐
//! Executor 2 ──┼──> Outbox (bounded mpsc) ──> OutboxDrain ──> outbound transport
//! Router     ──┘
//! ```
//!
//! `push` never suspends. When the channel is full the record is dropped and counted, so a
//! stalled transport cannot stall instrument execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A human- or machine-readable result destined for the outbound transport.
///
/// Serializes as a bare JSON string or as a nested JSON value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    /// Human-readable status line
    Text(String),
    /// Structured result, e.g. a method listing
    Data(Value),
}

impl Record {
    /// Text record.
    pub fn text(message: impl Into<String>) -> Self {
        Record::Text(message.into())
    }

    /// Text content, if this is a text record.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Record::Text(text) => Some(text),
            Record::Data(_) => None,
        }
    }
}

impl From<String> for Record {
    fn from(value: String) -> Self {
        Record::Text(value)
    }
}

impl From<&str> for Record {
    fn from(value: &str) -> Self {
        Record::Text(value.to_string())
    }
}

impl From<Value> for Record {
    fn from(value: Value) -> Self {
        Record::Data(value)
    }
}

/// Producer side of the outbox. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Record>,
    dropped: Arc<AtomicU64>,
}

/// Single consumer side of the outbox.
#[derive(Debug)]
pub struct OutboxDrain {
    rx: mpsc::Receiver<Record>,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` undelivered records.
    pub fn channel(capacity: usize) -> (Outbox, OutboxDrain) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Outbox {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            OutboxDrain { rx },
        )
    }

    /// Append a record. Returns `false` if it had to be dropped.
    pub fn push(&self, record: impl Into<Record>) -> bool {
        match self.tx.try_send(record.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(record = ?record, "Outbox full, dropping record");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Outbox drain closed, dropping record");
                false
            }
        }
    }

    /// Records dropped because the drain was full or gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl OutboxDrain {
    /// Take every record currently queued without waiting.
    pub fn drain(&mut self) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.rx.len());
        while let Ok(record) = self.rx.try_recv() {
            records.push(record);
        }
        records
    }

    /// Wait for the next record. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    /// Records waiting to be drained.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drain_returns_records_in_order() {
        let (outbox, mut drain) = Outbox::channel(8);
        assert!(outbox.push("first"));
        assert!(outbox.push(json!({"k": 1})));
        assert_eq!(drain.len(), 2);

        let records = drain.drain();
        assert_eq!(
            records,
            vec![Record::text("first"), Record::Data(json!({"k": 1}))]
        );
        assert!(drain.is_empty());
        assert!(drain.drain().is_empty());
    }

    #[test]
    fn full_outbox_drops_and_counts() {
        let (outbox, mut drain) = Outbox::channel(1);
        assert!(outbox.push("kept"));
        assert!(!outbox.push("lost"));
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(drain.drain(), vec![Record::text("kept")]);
    }

    #[test]
    fn records_serialize_as_bare_values() {
        assert_eq!(
            serde_json::to_string(&Record::text("4321 / idn: x")).unwrap(),
            r#""4321 / idn: x""#
        );
        assert_eq!(
            serde_json::to_string(&Record::Data(json!({"a": {"b": 1}}))).unwrap(),
            r#"{"a":{"b":1}}"#
        );
    }

    #[tokio::test]
    async fn recv_ends_when_producers_are_gone() {
        let (outbox, mut drain) = Outbox::channel(4);
        outbox.push("last");
        drop(outbox);
        assert_eq!(drain.recv().await, Some(Record::text("last")));
        assert_eq!(drain.recv().await, None);
    }
}
