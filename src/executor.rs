//! Per-instrument command executor.
//!
//! Each attached instrument owns one executor: an inbox of [`QueueEntry`]s and a task that runs
//! them strictly in submission order, one at a time. One physical instrument cannot execute two
//! commands concurrently; independent executors give full parallelism across instruments.
//!
//! ## State machine
//!
//! ```text
//!        submit            run_one
//! IDLE ─────────> RUNNING ─────────> IDLE
//!                    │ timeout
//!                    └────────────> TIMED_OUT ──> IDLE
//! (any) ── stop() ──> STOPPED
//! ```
//!
//! The executor is split in two halves, the same way the instrument manager keeps a handle
//! apart from the task that owns the instrument:
//!
//! - [`ExecutorHandle`] - cloneable, used by the router to `submit`, inspect and `stop`
//! - [`ExecutorWorker`] - owns the device session and command table, runs `run_forever`
//!
//! The worker sleeps on a [`Notify`] while the inbox is empty and is woken exactly when an
//! entry is submitted.

use crate::command::{CommandTable, Handler, MethodInfo};
use crate::device::DeviceSession;
use crate::envelope::{describe_call, CommandOutput, EntrySummary, QueueEntry, Reply};
use crate::error::CommandError;
use crate::outbox::{Outbox, Record};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Instrument identifier, e.g. `"4321"`.
pub type InstrumentId = String;

/// Lifecycle state of an executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// Waiting for work
    Idle,
    /// A command is in flight
    Running,
    /// The last command hit the timeout; back to `Idle` on the next one
    TimedOut,
    /// Terminal
    Stopped,
}

/// Executor tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorOptions {
    /// Upper bound for one suspending command
    pub timeout: Duration,
    /// Append a record to the outbox when a command times out
    pub report_timeouts: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            report_timeouts: true,
        }
    }
}

/// Outcome counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Commands that finished normally
    pub completed: u64,
    /// Invalid invocations and handler errors
    pub failed: u64,
    /// Commands cancelled by the timeout
    pub timed_out: u64,
}

struct Shared {
    id: InstrumentId,
    inbox: Mutex<VecDeque<QueueEntry>>,
    wake: Notify,
    busy: AtomicBool,
    state: watch::Sender<ExecutorState>,
    stop: watch::Sender<bool>,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl Shared {
    fn inbox(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        // A poisoned inbox still holds valid entries; keep going with it.
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop(&self) -> Option<QueueEntry> {
        self.inbox().pop_front()
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// `Stopped` is terminal.
    fn set_state(&self, next: ExecutorState) {
        self.state.send_if_modified(|current| {
            if *current == ExecutorState::Stopped || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn halt(&self) {
        self.stop.send_replace(true);
        self.state.send_replace(ExecutorState::Stopped);
        self.busy.store(false, Ordering::SeqCst);
        self.inbox().clear();
    }
}

/// Everything a command handler may touch while it runs.
pub struct InstrumentContext {
    id: InstrumentId,
    kind: String,
    session: Box<dyn DeviceSession>,
    outbox: Outbox,
    shared: Arc<Shared>,
    methods: Vec<MethodInfo>,
}

impl InstrumentContext {
    /// Instrument id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Driver type name, e.g. `"PowerSupply"`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The instrument's open device session.
    pub fn session(&mut self) -> &mut dyn DeviceSession {
        self.session.as_mut()
    }

    /// Append a record to the outbox.
    pub fn report(&self, record: impl Into<Record>) {
        self.outbox.push(record);
    }

    /// Queue a follow-up command behind everything already in this instrument's inbox.
    pub fn enqueue(&self, entry: QueueEntry) {
        ExecutorHandle {
            shared: Arc::clone(&self.shared),
        }
        .submit(entry);
    }

    /// Exposed commands of this instrument.
    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }
}

/// Cloneable, non-owning handle to an executor.
#[derive(Clone)]
pub struct ExecutorHandle {
    shared: Arc<Shared>,
}

impl ExecutorHandle {
    /// Instrument id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Append to the inbox and wake the worker. Never fails; entries submitted after `stop`
    /// are discarded.
    pub fn submit(&self, entry: QueueEntry) {
        if self.shared.is_stopped() {
            tracing::debug!(
                instrument_id = %self.shared.id,
                command = %entry.command,
                "Executor stopped, discarding entry"
            );
            return;
        }
        self.shared.inbox().push_back(entry);
        self.shared.wake.notify_one();
    }

    /// Stop the executor: cancels in-flight work and discards the inbox.
    pub fn stop(&self) {
        if !self.shared.is_stopped() {
            tracing::info!(instrument_id = %self.shared.id, "Stopping executor");
        }
        self.shared.halt();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ExecutorState> {
        self.shared.state.subscribe()
    }

    /// True while a command is being run, including any suspension.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Entries waiting in the inbox.
    pub fn inbox_len(&self) -> usize {
        self.shared.inbox().len()
    }

    /// Copy of the queued entries, oldest first.
    pub fn inbox_snapshot(&self) -> Vec<EntrySummary> {
        self.shared.inbox().iter().map(QueueEntry::summary).collect()
    }

    /// Snapshot of the outcome counters.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            timed_out: self.shared.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// The half of an executor that runs commands.
pub struct ExecutorWorker {
    shared: Arc<Shared>,
    ctx: InstrumentContext,
    table: CommandTable<InstrumentContext>,
    options: ExecutorOptions,
}

/// Build an executor bound to one instrument.
pub fn new_executor(
    id: impl Into<InstrumentId>,
    kind: impl Into<String>,
    session: Box<dyn DeviceSession>,
    table: CommandTable<InstrumentContext>,
    outbox: Outbox,
    options: ExecutorOptions,
) -> (ExecutorHandle, ExecutorWorker) {
    let id = id.into();
    let (state, _) = watch::channel(ExecutorState::Idle);
    let (stop, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        id: id.clone(),
        inbox: Mutex::new(VecDeque::new()),
        wake: Notify::new(),
        busy: AtomicBool::new(false),
        state,
        stop,
        completed: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        timed_out: AtomicU64::new(0),
    });
    let ctx = InstrumentContext {
        id,
        kind: kind.into(),
        session,
        outbox,
        shared: Arc::clone(&shared),
        methods: table.methods(),
    };
    (
        ExecutorHandle {
            shared: Arc::clone(&shared),
        },
        ExecutorWorker {
            shared,
            ctx,
            table,
            options,
        },
    )
}

impl ExecutorWorker {
    /// Handle sharing this worker's inbox and state.
    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run `run_forever` on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run_forever())
    }

    /// Perpetual loop: run the oldest entry, or sleep until one is submitted, until stopped.
    pub async fn run_forever(mut self) {
        let mut stop_rx = self.shared.stop.subscribe();
        tracing::debug!(instrument_id = %self.ctx.id, "Executor started");

        while !self.shared.is_stopped() {
            match self.shared.pop() {
                Some(entry) => {
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        _ = self.run_one(entry) => {}
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        _ = self.shared.wake.notified() => {}
                    }
                }
            }
        }

        self.shared.halt();
        tracing::debug!(instrument_id = %self.ctx.id, "Executor stopped");
    }

    /// Run everything currently queued, including follow-ups queued along the way.
    pub async fn process_pending(&mut self) {
        while let Some(entry) = self.shared.pop() {
            if self.shared.is_stopped() {
                break;
            }
            self.run_one(entry).await;
        }
    }

    /// Run a single entry to completion, failure or timeout.
    pub async fn run_one(&mut self, entry: QueueEntry) {
        self.shared.busy.store(true, Ordering::SeqCst);
        self.shared.set_state(ExecutorState::Running);

        let QueueEntry {
            command,
            args,
            kwargs,
            reply,
        } = entry;
        tracing::trace!(instrument_id = %self.ctx.id, command = %command, "Running command");

        match self.table.resolve(&command, &args, &kwargs) {
            Err(err) => self.fail(&command, &args, &kwargs, &err),
            Ok((Handler::Sync(handler), bound)) => match handler(&mut self.ctx, bound) {
                Ok(()) => self.complete(reply, Value::Null),
                Err(err) => self.fail(&command, &args, &kwargs, &err),
            },
            Ok((Handler::Async(handler), bound)) => {
                let limit = self.options.timeout;
                match tokio::time::timeout(limit, handler(&mut self.ctx, bound)).await {
                    Ok(Ok(output)) => self.complete(reply, output),
                    Ok(Err(err)) => self.fail(&command, &args, &kwargs, &err),
                    Err(_) => self.time_out(&command, limit),
                }
            }
        }

        self.shared.busy.store(false, Ordering::SeqCst);
        self.shared.set_state(ExecutorState::Idle);
    }

    fn complete(&self, reply: Option<Reply>, output: CommandOutput) {
        self.shared.completed.fetch_add(1, Ordering::Relaxed);
        match reply {
            Some(Reply::Caller(tx)) => {
                if tx.send(output).is_err() {
                    tracing::debug!(instrument_id = %self.ctx.id, "Reply receiver dropped");
                }
            }
            Some(Reply::Record(format)) => self.ctx.report(format(&output)),
            Some(Reply::Discard) | None => {}
        }
    }

    fn fail(&self, command: &str, args: &[Value], kwargs: &Map<String, Value>, err: &CommandError) {
        self.shared.failed.fetch_add(1, Ordering::Relaxed);
        if err.is_invocation_error() {
            tracing::warn!(instrument_id = %self.ctx.id, command, error = %err, "Invalid command");
            self.ctx.report(format!(
                "Invalid command: {} {} {}",
                self.ctx.id,
                command,
                describe_call(args, kwargs)
            ));
        } else {
            tracing::error!(instrument_id = %self.ctx.id, command, error = %err, "Command failed");
            self.ctx
                .report(format!("{} / {}: error: {}", self.ctx.id, command, err));
        }
    }

    fn time_out(&self, command: &str, limit: Duration) {
        self.shared.timed_out.fetch_add(1, Ordering::Relaxed);
        self.shared.set_state(ExecutorState::TimedOut);
        tracing::warn!(
            instrument_id = %self.ctx.id,
            command,
            timeout_ms = limit.as_millis() as u64,
            "Command timed out, cancelled"
        );
        if self.options.report_timeouts {
            self.ctx.report(format!(
                "{} / {}: timed out after {:?}",
                self.ctx.id, command, limit
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BoundArgs, CommandSpec, Param, ParamKind};
    use crate::device::sim::{SimDevice, SimResourceManager};
    use crate::device::{ResourceManager, SessionOptions};
    use crate::outbox::OutboxDrain;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use serde_json::json;

    const MSG: &[Param] = &[Param::required("msg", ParamKind::Str)];
    const PERIOD: &[Param] = &[Param::required("period", ParamKind::Float)];

    fn note(ctx: &mut InstrumentContext, args: BoundArgs) -> Result<(), CommandError> {
        ctx.report(format!("note {}", args.str("msg")?));
        Ok(())
    }

    fn nap(
        ctx: &mut InstrumentContext,
        args: BoundArgs,
    ) -> BoxFuture<'_, Result<CommandOutput, CommandError>> {
        async move {
            let period = args.f64("period")?;
            tokio::time::sleep(Duration::from_secs_f64(period)).await;
            Ok(json!(format!("{} slept", ctx.id())))
        }
        .boxed()
    }

    fn table() -> CommandTable<InstrumentContext> {
        CommandTable::new()
            .with(CommandSpec::sync("note", MSG, "Report a note", note))
            .with(CommandSpec::suspending("nap", PERIOD, "Sleep", nap))
    }

    async fn executor(timeout: Duration) -> (ExecutorHandle, ExecutorWorker, OutboxDrain) {
        let rm = SimResourceManager::new().with_device("SIM::1", SimDevice::new("Test-1"));
        let session = rm.open("SIM::1", &SessionOptions::default()).await.unwrap();
        let (outbox, drain) = Outbox::channel(64);
        let options = ExecutorOptions {
            timeout,
            report_timeouts: true,
        };
        let (handle, worker) = new_executor("1", "Test", session, table(), outbox, options);
        (handle, worker, drain)
    }

    #[tokio::test]
    async fn submit_queues_in_order_without_running() {
        let (handle, _worker, _drain) = executor(Duration::from_secs(1)).await;
        handle.submit(QueueEntry::new("note", vec![json!("a")]));
        handle.submit(QueueEntry::new("note", vec![json!("b")]));

        let queued: Vec<_> = handle
            .inbox_snapshot()
            .into_iter()
            .map(|e| e.args[0].clone())
            .collect();
        assert_eq!(queued, vec![json!("a"), json!("b")]);
        assert_eq!(handle.state(), ExecutorState::Idle);
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn invalid_command_is_reported_and_next_entry_runs() {
        let (handle, mut worker, mut drain) = executor(Duration::from_secs(1)).await;
        handle.submit(QueueEntry::new("explode", vec![json!(1)]));
        handle.submit(QueueEntry::new("note", vec![]));
        handle.submit(QueueEntry::new("note", vec![json!("ok")]));
        worker.process_pending().await;

        let records = drain.drain();
        assert_eq!(
            records,
            vec![
                Record::text("Invalid command: 1 explode [1] {}"),
                Record::text("Invalid command: 1 note [] {}"),
                Record::text("note ok"),
            ]
        );
        assert_eq!(handle.stats().failed, 2);
        assert_eq!(handle.stats().completed, 1);
        assert_eq!(handle.state(), ExecutorState::Idle);
    }

    #[tokio::test]
    async fn async_result_reaches_caller() {
        let (handle, mut worker, _drain) = executor(Duration::from_secs(1)).await;
        let (reply, rx) = Reply::caller();
        handle.submit(QueueEntry::new("nap", vec![json!(0.0)]).with_reply(reply));
        worker.process_pending().await;
        assert_eq!(rx.await.unwrap(), json!("1 slept"));
    }

    #[tokio::test]
    async fn timeout_cancels_without_reply_and_returns_to_idle() {
        let (handle, mut worker, mut drain) = executor(Duration::from_millis(20)).await;
        let (reply, rx) = Reply::caller();
        handle.submit(QueueEntry::new("nap", vec![json!(5.0)]).with_reply(reply));
        handle.submit(QueueEntry::new("note", vec![json!("after")]));

        let mut states = handle.subscribe_state();
        worker.process_pending().await;

        assert!(rx.await.is_err(), "timed out command must not reply");
        assert_eq!(handle.state(), ExecutorState::Idle);
        assert!(!handle.is_busy());
        assert_eq!(handle.stats().timed_out, 1);
        assert!(states.has_changed().unwrap());

        let records = drain.drain();
        assert_eq!(records.len(), 2);
        assert!(records[0].as_text().unwrap().contains("timed out"));
        assert_eq!(records[1], Record::text("note after"));
    }

    #[tokio::test]
    async fn run_forever_wakes_on_submit_and_stop_discards_inbox() {
        let (handle, worker, mut drain) = executor(Duration::from_secs(5)).await;
        let task = worker.spawn();

        handle.submit(QueueEntry::new("note", vec![json!("woke")]));
        let record = tokio::time::timeout(Duration::from_secs(1), drain.recv())
            .await
            .unwrap();
        assert_eq!(record, Some(Record::text("note woke")));

        // Occupy the executor, then queue behind it and stop.
        handle.submit(QueueEntry::new("nap", vec![json!(10.0)]));
        handle.submit(QueueEntry::new("note", vec![json!("never")]));
        let mut states = handle.subscribe_state();
        states
            .wait_for(|s| *s == ExecutorState::Running)
            .await
            .unwrap();

        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.state(), ExecutorState::Stopped);
        assert_eq!(handle.inbox_len(), 0);
        assert!(!handle.is_busy());
        handle.submit(QueueEntry::new("note", vec![json!("late")]));
        assert_eq!(handle.inbox_len(), 0);
        assert!(drain.drain().is_empty());
    }

    #[tokio::test]
    async fn follow_up_entries_queue_behind_existing_ones() {
        fn chain(ctx: &mut InstrumentContext, _args: BoundArgs) -> Result<(), CommandError> {
            ctx.enqueue(QueueEntry::new("note", vec![json!("follow-up")]));
            Ok(())
        }
        let rm = SimResourceManager::new().with_device("SIM::1", SimDevice::new("Test-1"));
        let session = rm.open("SIM::1", &SessionOptions::default()).await.unwrap();
        let (outbox, mut drain) = Outbox::channel(8);
        let table = table().with(CommandSpec::sync("chain", &[], "Chain", chain));
        let (handle, mut worker) =
            new_executor("1", "Test", session, table, outbox, ExecutorOptions::default());

        handle.submit(QueueEntry::new("chain", vec![]));
        handle.submit(QueueEntry::new("note", vec![json!("queued first")]));
        worker.process_pending().await;

        assert_eq!(
            drain.drain(),
            vec![Record::text("note queued first"), Record::text("note follow-up")]
        );
    }
}
