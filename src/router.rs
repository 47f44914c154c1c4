//! Controller router.
//!
//! The router owns the inbound queue, the ownership registry, the station queues and every
//! executor it attached. It moves commands through three stages:
//!
//! ```text
//! InboundSender ──> inbound queue ──route_one──> station queue ──dispatch_all──> executor inbox
//!                                      │
//!                                      └──> controller command table (self-directed envelopes)
//! ```
//!
//! Nothing that happens while routing propagates out of the router: malformed envelopes,
//! unknown commands and failed attachments are reported to the outbox, unknown targets follow
//! the configured [`UnknownTargetPolicy`].

use crate::command::{
    methods_to_value, BoundArgs, CommandSpec, CommandTable, Handler, MethodInfo, Param, ParamKind,
};
use crate::config::{ControllerConfig, UnknownTargetPolicy};
use crate::device::{ResourceManager, SessionOptions};
use crate::driver::{parse_identity, DriverRegistry};
use crate::envelope::{describe_call, CommandOutput, EntrySummary, Envelope};
use crate::error::{CommandError, DeviceError, LabError, LabResult};
use crate::executor::{new_executor, ExecutorOptions, ExecutorWorker, InstrumentId};
use crate::outbox::Outbox;
use crate::registry::{InstrumentInfo, Registry, RegistryEntry};
use crate::station::StationQueues;
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Cloneable producer for the router's inbound queue. Never blocks.
#[derive(Clone, Debug)]
pub struct InboundSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl InboundSender {
    pub(crate) fn from_channel(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue one raw transport record. Returns `false` once the router is gone.
    pub fn push(&self, raw: impl Into<Bytes>) -> bool {
        self.tx.send(raw.into()).is_ok()
    }

    /// Serialize and queue an envelope.
    pub fn push_envelope(&self, envelope: &Envelope) -> LabResult<bool> {
        Ok(self.push(envelope.to_vec()?))
    }
}

/// What `route_one` did with a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The inbound queue was empty
    Idle,
    /// The record was not a valid envelope
    Malformed,
    /// A self-directed command was handled (or rejected)
    Controller {
        /// Controller command name
        command: String,
    },
    /// Staged on the owning station's queue
    Queued {
        /// Target instrument
        instrument_id: InstrumentId,
        /// Station now holding the entry
        station: String,
    },
    /// Addressed to an instrument this controller does not own
    UnknownTarget {
        /// Id nobody owns
        instrument_id: InstrumentId,
    },
}

/// Router tuning, usually derived from [`ControllerConfig`].
#[derive(Clone, Debug)]
pub struct RouterSettings {
    /// Target id of self-directed envelopes
    pub controller_id: String,
    /// What happens to envelopes for ids nobody owns
    pub unknown_target_policy: UnknownTargetPolicy,
    /// Spawn each executor on attach; otherwise `run` spawns it
    pub autostart_executors: bool,
    /// Passed to every executor
    pub executor: ExecutorOptions,
    /// Options for every device session the router opens
    pub session: SessionOptions,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

impl RouterSettings {
    /// Settings for `config`; executors start on attach.
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            controller_id: config.application.controller_id.clone(),
            unknown_target_policy: config.router.unknown_target_policy,
            autostart_executors: true,
            executor: config.executor_options(),
            session: config.session_options(),
        }
    }
}

/// Routes envelopes to instruments and runs controller commands.
pub struct ControllerRouter {
    settings: RouterSettings,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    registry: Registry,
    stations: StationQueues,
    outbox: Outbox,
    resources: Arc<dyn ResourceManager>,
    drivers: DriverRegistry,
    table: CommandTable<ControllerRouter>,
    tasks: Vec<(InstrumentId, JoinHandle<()>)>,
    idle_workers: HashMap<InstrumentId, ExecutorWorker>,
}

impl ControllerRouter {
    /// Create a router and the sender feeding its inbound queue.
    pub fn new(
        settings: RouterSettings,
        resources: Arc<dyn ResourceManager>,
        drivers: DriverRegistry,
        outbox: Outbox,
    ) -> (Self, InboundSender) {
        let (tx, inbound) = mpsc::unbounded_channel();
        let router = Self {
            settings,
            inbound,
            registry: Registry::new(),
            stations: StationQueues::new(),
            outbox,
            resources,
            drivers,
            table: controller_table(),
            tasks: Vec::new(),
            idle_workers: HashMap::new(),
        };
        (router, InboundSender::from_channel(tx))
    }

    /// Id self-directed envelopes carry.
    pub fn controller_id(&self) -> &str {
        &self.settings.controller_id
    }

    /// Ownership registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Staged entries, per station.
    pub fn stations(&self) -> &StationQueues {
        &self.stations
    }

    /// Inspectable copy of a station queue.
    pub fn station_snapshot(&self, station: &str) -> Vec<(InstrumentId, EntrySummary)> {
        self.stations.snapshot(station)
    }

    /// Handle one inbound message, if any, without waiting.
    pub async fn route_one(&mut self) -> RouteOutcome {
        match self.inbound.try_recv() {
            Ok(raw) => self.route_message(&raw).await,
            Err(_) => RouteOutcome::Idle,
        }
    }

    /// Route everything currently in the inbound queue. Returns how many messages were handled.
    pub async fn route_pending(&mut self) -> usize {
        let mut routed = 0;
        while self.route_one().await != RouteOutcome::Idle {
            routed += 1;
        }
        routed
    }

    /// Classify one raw record.
    pub async fn route_message(&mut self, raw: &[u8]) -> RouteOutcome {
        let envelope = match Envelope::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "Dropping malformed envelope");
                self.outbox.push(err.to_string());
                return RouteOutcome::Malformed;
            }
        };

        if envelope.target_id() == self.settings.controller_id {
            let command = envelope.command().to_string();
            self.run_controller_command(envelope).await;
            return RouteOutcome::Controller { command };
        }

        let Some(station) = self.registry.station_of(envelope.target_id()) else {
            let instrument_id = envelope.target_id().to_string();
            match self.settings.unknown_target_policy {
                UnknownTargetPolicy::Drop => {
                    tracing::debug!(
                        instrument_id = %instrument_id,
                        command = %envelope.command(),
                        "Unknown target, dropping envelope"
                    );
                }
                UnknownTargetPolicy::Report => {
                    tracing::info!(instrument_id = %instrument_id, "Unknown target");
                    self.outbox.push(format!(
                        "Unknown instrument: {} {}",
                        instrument_id,
                        envelope.command()
                    ));
                }
            }
            return RouteOutcome::UnknownTarget { instrument_id };
        };

        let station = station.to_string();
        let instrument_id = envelope.target_id().to_string();
        tracing::trace!(
            instrument_id = %instrument_id,
            station = %station,
            command = %envelope.command(),
            "Staging command"
        );
        self.stations
            .push(&station, instrument_id.clone(), envelope.into_entry());
        RouteOutcome::Queued {
            instrument_id,
            station,
        }
    }

    async fn run_controller_command(&mut self, envelope: Envelope) {
        let command = envelope.command();
        let result = match self
            .table
            .resolve(command, envelope.args(), envelope.kwargs())
        {
            Err(err) => Err(err),
            Ok((Handler::Sync(handler), bound)) => handler(self, bound).map(|()| Value::Null),
            Ok((Handler::Async(handler), bound)) => handler(self, bound).await,
        };

        match result {
            Ok(_) => {}
            Err(err) if err.is_invocation_error() => {
                tracing::warn!(command, error = %err, "Invalid controller command");
                self.outbox.push(format!(
                    "Invalid command: {} {} {}",
                    self.settings.controller_id,
                    command,
                    describe_call(envelope.args(), envelope.kwargs())
                ));
            }
            Err(err) => {
                tracing::error!(command, error = %err, "Controller command failed");
                self.outbox
                    .push(format!("{} / {}: {}", self.settings.controller_id, command, err));
            }
        }
    }

    /// Move staged entries into executor inboxes.
    ///
    /// Stations are visited once each in creation order; every entry present when a station
    /// is visited is submitted. Returns the number of entries moved.
    pub fn dispatch_all(&mut self) -> usize {
        let mut moved = 0;
        for index in 0..self.stations.names().len() {
            let station = self.stations.names()[index].clone();
            for (instrument_id, entry) in self.stations.take(&station) {
                match self.registry.executor(&instrument_id) {
                    Some(handle) => {
                        handle.submit(entry);
                        moved += 1;
                    }
                    None => {
                        tracing::warn!(
                            instrument_id = %instrument_id,
                            station = %station,
                            "Registry entry vanished, dropping staged command"
                        );
                    }
                }
            }
        }
        moved
    }

    /// Open a device, identify it and bring up its executor.
    pub async fn attach(&mut self, resource: &str, station: &str) -> LabResult<InstrumentId> {
        let unavailable = |source: DeviceError| LabError::Resource {
            resource: resource.to_string(),
            source,
        };

        let identity = {
            let mut first_contact = self
                .resources
                .open(resource, &self.settings.session)
                .await
                .map_err(unavailable)?;
            first_contact.query_identity().await.map_err(unavailable)?
        };

        let (kind, id) = parse_identity(&identity).ok_or_else(|| LabError::Resolution {
            kind: identity.trim().to_string(),
            resource: resource.to_string(),
        })?;
        let table = self.drivers.build(kind).ok_or_else(|| LabError::Resolution {
            kind: kind.to_string(),
            resource: resource.to_string(),
        })?;
        let (kind, id) = (kind.to_string(), id.to_string());

        let session = self
            .resources
            .open(resource, &self.settings.session)
            .await
            .map_err(unavailable)?;
        let (handle, worker) = new_executor(
            id.clone(),
            kind.clone(),
            session,
            table,
            self.outbox.clone(),
            self.settings.executor.clone(),
        );

        let entry = RegistryEntry {
            handle,
            info: InstrumentInfo {
                station: station.to_string(),
                resource: resource.to_string(),
                kind: kind.clone(),
            },
            attached_at: Utc::now(),
        };
        if let Some(previous) = self.registry.register(id.clone(), entry) {
            tracing::info!(
                instrument_id = %id,
                old_station = %previous.info.station,
                station,
                "Instrument re-registered, stopping previous executor"
            );
            previous.handle.stop();
            self.idle_workers.remove(&id);
        }
        self.stations.ensure(station);

        if self.settings.autostart_executors {
            self.tasks.push((id.clone(), worker.spawn()));
        } else {
            self.idle_workers.insert(id.clone(), worker);
        }

        tracing::info!(instrument_id = %id, kind = %kind, station, resource, "Instrument attached");
        self.outbox.push(format!(
            "{} / create_interface: {} ({}) [{}] @ {}",
            self.settings.controller_id, kind, id, station, resource
        ));
        Ok(id)
    }

    /// Attached instruments, sorted by id.
    pub fn list_instruments(&self) -> BTreeMap<InstrumentId, InstrumentInfo> {
        self.registry.list()
    }

    /// The controller's exposed operations.
    pub fn list_methods(&self) -> Vec<MethodInfo> {
        self.table.methods()
    }

    /// Take an executor that was attached without being started.
    pub fn take_worker(&mut self, id: &str) -> Option<ExecutorWorker> {
        self.idle_workers.remove(id)
    }

    /// Spawn every executor that was attached without being started.
    fn start_idle_executors(&mut self) -> usize {
        let workers: Vec<_> = self.idle_workers.drain().collect();
        let started = workers.len();
        for (id, worker) in workers {
            self.tasks.push((id, worker.spawn()));
        }
        started
    }

    /// Perpetual routing loop: wait for inbound records, route them, dispatch.
    ///
    /// Executors attached without being started are started here, both the ones present
    /// when the loop begins and any attached while it runs.
    ///
    /// Returns after `shutdown` flips to `true`, once every executor has stopped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, grace: Duration) -> LabResult<()> {
        let started = self.start_idle_executors();
        tracing::info!(controller_id = %self.settings.controller_id, started, "Router started");

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                raw = self.inbound.recv() => match raw {
                    Some(raw) => {
                        self.route_message(&raw).await;
                        self.route_pending().await;
                        self.start_idle_executors();
                        self.dispatch_all();
                    }
                    None => break,
                },
            }
        }

        self.shutdown(grace).await
    }

    /// Stop every executor and wait for their tasks, each bounded by `grace`.
    pub async fn shutdown(&mut self, grace: Duration) -> LabResult<()> {
        for handle in self.registry.handles() {
            handle.stop();
        }
        self.idle_workers.clear();

        let mut errors = Vec::new();
        for (id, task) in self.tasks.drain(..) {
            let abort = task.abort_handle();
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {
                    tracing::debug!(instrument_id = %id, "Executor shut down");
                }
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    tracing::error!(instrument_id = %id, error = %err, "Executor task panicked");
                    errors.push(LabError::Task {
                        task: id,
                        reason: err.to_string(),
                    });
                }
                Err(_) => {
                    tracing::warn!(instrument_id = %id, ?grace, "Executor shutdown timed out, aborting");
                    abort.abort();
                    errors.push(LabError::Task {
                        task: id,
                        reason: format!("did not stop within {grace:?}"),
                    });
                }
            }
        }

        tracing::info!(controller_id = %self.settings.controller_id, "Router stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LabError::ShutdownFailed(errors))
        }
    }
}

// ---------------------------------------------------------------------------
// Controller commands
// ---------------------------------------------------------------------------

const ATTACH: &[Param] = &[
    Param::required("resource_name", ParamKind::Str),
    Param::required("station_name", ParamKind::Str),
];

fn controller_table() -> CommandTable<ControllerRouter> {
    CommandTable::new()
        .with(CommandSpec::suspending(
            "create_interface",
            ATTACH,
            "Attach the instrument at `resource_name` to station `station_name`",
            create_interface,
        ))
        .with(
            CommandSpec::suspending("attach", ATTACH, "Alias of create_interface", create_interface)
                .internal(),
        )
        .with(CommandSpec::sync(
            "list_instruments",
            &[],
            "List attached instruments with their station, resource and type",
            list_instruments,
        ))
        .with(CommandSpec::sync(
            "list_methods",
            &[],
            "List the controller's commands",
            list_methods,
        ))
        .with(CommandSpec::sync(
            "list_stations",
            &[],
            "List stations and the instruments they contain",
            list_stations,
        ))
        .with(CommandSpec::sync(
            "status",
            &[],
            "Report executor state and counters per instrument",
            status,
        ))
}

fn create_interface(
    router: &mut ControllerRouter,
    args: BoundArgs,
) -> BoxFuture<'_, Result<CommandOutput, CommandError>> {
    async move {
        let resource = args.str("resource_name")?;
        let station = args.str("station_name")?;
        let id = router
            .attach(resource, station)
            .await
            .map_err(|e| CommandError::Failed(e.to_string()))?;
        Ok(Value::String(id))
    }
    .boxed()
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Failed(e.to_string()))
}

fn list_instruments(router: &mut ControllerRouter, _args: BoundArgs) -> Result<(), CommandError> {
    let listing = to_value(router.list_instruments())?;
    router.outbox.push(listing);
    Ok(())
}

fn list_methods(router: &mut ControllerRouter, _args: BoundArgs) -> Result<(), CommandError> {
    router.outbox.push(methods_to_value(&router.list_methods()));
    Ok(())
}

fn list_stations(router: &mut ControllerRouter, _args: BoundArgs) -> Result<(), CommandError> {
    let mut listing = Map::new();
    for station in router.stations.names() {
        listing.insert(station.clone(), to_value(router.registry.ids_in(station))?);
    }
    router.outbox.push(Value::Object(listing));
    Ok(())
}

fn status(router: &mut ControllerRouter, _args: BoundArgs) -> Result<(), CommandError> {
    let mut report = Map::new();
    for (id, entry) in router.registry.entries() {
        let stats = entry.handle.stats();
        let state = to_value(entry.handle.state())?;
        report.insert(
            id.to_string(),
            json!({
                "station": entry.info.station,
                "attached_at": entry.attached_at.to_rfc3339(),
                "state": state,
                "busy": entry.handle.is_busy(),
                "inbox": entry.handle.inbox_len(),
                "completed": stats.completed,
                "failed": stats.failed,
                "timed_out": stats.timed_out,
            }),
        );
    }
    router.outbox.push(Value::Object(report));
    Ok(())
}
