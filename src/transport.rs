//! Transport binding.
//!
//! The routing engine is transport agnostic: raw records go in through an
//! [`InboundSender`] and [`Record`]s come out of the [`OutboxDrain`]. This module binds both
//! ends to byte streams carrying one JSON document per line:
//!
//! - [`spawn_line_reader`] feeds each non-blank line of any `AsyncBufRead` to the router
//! - [`spawn_outbound_pump`] serializes every record and hands it to a [`RecordSink`]
//!
//! [`LineSink`] writes lines to any `AsyncWrite` (stdout in the binary); [`ChannelSink`]
//! delivers them in process, which is what the integration tests use.

use crate::error::{LabError, LabResult};
use crate::outbox::{OutboxDrain, Record};
use crate::router::InboundSender;
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Destination for serialized outbound records.
#[async_trait]
pub trait RecordSink: Send {
    /// Deliver one serialized record.
    async fn send(&mut self, line: String) -> LabResult<()>;
}

/// Writes one record per line.
pub struct LineSink<W> {
    writer: W,
}

impl<W> LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// The wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> RecordSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, line: String) -> LabResult<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Delivers serialized records over an in-process channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    /// Sink plus the receiver its records arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn send(&mut self, line: String) -> LabResult<()> {
        self.tx
            .send(line)
            .map_err(|_| LabError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
    }
}

/// Serialize a record the way it travels on the wire.
pub fn encode_record(record: &Record) -> LabResult<String> {
    Ok(serde_json::to_string(record)?)
}

/// Read lines until EOF or shutdown, pushing each non-blank one to the router.
///
/// Lines are forwarded as raw bytes; a line that is not valid UTF-8 or not valid JSON is the
/// router's to report, and reading carries on with the next one.
///
/// Resolves to the number of lines forwarded.
pub fn spawn_line_reader<R>(
    mut reader: R,
    inbound: InboundSender,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<LabResult<u64>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Survives a cancelled read_until; only a finished line is taken out of it.
        let mut buf = Vec::new();
        let mut forwarded = 0;
        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                read = reader.read_until(b'\n', &mut buf) => {
                    let at_eof = read? == 0;
                    let mut line = std::mem::take(&mut buf);
                    while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                        line.pop();
                    }
                    if !line.iter().all(u8::is_ascii_whitespace) {
                        if !inbound.push(line) {
                            tracing::warn!("Router gone, stopping line reader");
                            break;
                        }
                        forwarded += 1;
                    }
                    if at_eof {
                        tracing::debug!(forwarded, "Inbound stream closed");
                        break;
                    }
                }
            }
        }
        Ok(forwarded)
    })
}

/// Forward every outbox record to `sink` until all producers are gone.
///
/// Resolves to the number of records delivered. A failing sink ends the pump.
pub fn spawn_outbound_pump<S>(mut drain: OutboxDrain, mut sink: S) -> JoinHandle<LabResult<u64>>
where
    S: RecordSink + 'static,
{
    tokio::spawn(async move {
        let mut delivered = 0;
        while let Some(record) = drain.recv().await {
            let line = match encode_record(&record) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to encode record, skipping");
                    continue;
                }
            };
            sink.send(line).await?;
            delivered += 1;
        }
        tracing::debug!(delivered, "Outbox closed, outbound pump finished");
        Ok(delivered)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn line_sink_writes_one_record_per_line() {
        let mut sink = LineSink::new(Vec::new());
        sink.send(encode_record(&Record::text("4321 / idn: PowerSupply-4321")).unwrap())
            .await
            .unwrap();
        sink.send(encode_record(&Record::Data(json!({"a": 1}))).unwrap())
            .await
            .unwrap();
        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(written, "\"4321 / idn: PowerSupply-4321\"\n{\"a\":1}\n");
    }

    #[tokio::test]
    async fn pump_delivers_until_producers_are_gone() {
        let (outbox, drain) = Outbox::channel(8);
        let (sink, mut rx) = ChannelSink::new();
        let pump = spawn_outbound_pump(drain, sink);

        outbox.push("one");
        outbox.push(json!({"two": 2}));
        drop(outbox);

        assert_eq!(pump.await.unwrap().unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), "\"one\"");
        assert_eq!(rx.recv().await.unwrap(), "{\"two\":2}");
    }

    #[tokio::test]
    async fn reader_skips_blank_lines_and_stops_at_eof() {
        let input: &[u8] = b"{\"id\":\"controller\",\"cmd\":\"status\"}\n\n   \nnot json\n";
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let inbound = InboundSender::from_channel(tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = spawn_line_reader(input, inbound, shutdown_rx);
        assert_eq!(reader.await.unwrap().unwrap(), 2);
        assert_eq!(&rx.recv().await.unwrap()[..], b"{\"id\":\"controller\",\"cmd\":\"status\"}");
        assert_eq!(&rx.recv().await.unwrap()[..], b"not json");
    }

    #[tokio::test]
    async fn reader_forwards_invalid_utf8_and_keeps_reading() {
        let input: &[u8] = b"\xff\xfe garbage\r\n{\"id\":\"4321\",\"cmd\":\"idn\"}";
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = spawn_line_reader(input, InboundSender::from_channel(tx), shutdown_rx);
        assert_eq!(reader.await.unwrap().unwrap(), 2);
        assert_eq!(&rx.recv().await.unwrap()[..], b"\xff\xfe garbage");
        assert_eq!(&rx.recv().await.unwrap()[..], b"{\"id\":\"4321\",\"cmd\":\"idn\"}");
    }

    #[tokio::test]
    async fn reader_stops_on_shutdown() {
        let (client, server) = tokio::io::duplex(64);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader = spawn_line_reader(tokio::io::BufReader::new(server), InboundSender::from_channel(tx), shutdown_rx);

        shutdown_tx.send(true).unwrap();
        let forwarded = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, 0);
        drop(client);
    }
}
