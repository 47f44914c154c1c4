//! Controller service wiring.
//!
//! Brings a whole controller up from a [`ControllerConfig`]:
//!
//! 1. creates the outbox and the router
//! 2. attaches every configured instrument (failures are logged and reported, not fatal)
//! 3. spawns the router loop and the outbound pump
//!
//! Inbound byte streams are bound with [`ControllerService::spawn_reader`]; anything else
//! can push raw records through [`ControllerService::inbound`].
//!
//! Shutdown is best effort: every task gets a bounded grace period and the errors of the
//! ones that failed are collected into [`LabError::ShutdownFailed`].

use crate::config::ControllerConfig;
use crate::device::ResourceManager;
use crate::driver::DriverRegistry;
use crate::error::{LabError, LabResult};
use crate::outbox::Outbox;
use crate::router::{ControllerRouter, InboundSender, RouterSettings};
use crate::transport::{spawn_line_reader, spawn_outbound_pump, RecordSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// A running controller.
pub struct ControllerService {
    inbound: InboundSender,
    shutdown_tx: watch::Sender<bool>,
    grace: Duration,
    router_task: JoinHandle<LabResult<()>>,
    pump_task: JoinHandle<LabResult<u64>>,
    reader_tasks: Vec<JoinHandle<LabResult<u64>>>,
}

impl ControllerService {
    /// Validate `config`, attach its instruments and start routing.
    pub async fn start<S>(
        config: ControllerConfig,
        resources: Arc<dyn ResourceManager>,
        drivers: DriverRegistry,
        sink: S,
    ) -> LabResult<Self>
    where
        S: RecordSink + 'static,
    {
        config.validate().map_err(LabError::Configuration)?;

        let (outbox, drain) = Outbox::channel(config.outbox.capacity);
        let (mut router, inbound) = ControllerRouter::new(
            RouterSettings::from_config(&config),
            resources,
            drivers,
            outbox.clone(),
        );

        for instrument in &config.instruments {
            if let Err(err) = router.attach(&instrument.resource, &instrument.station).await {
                tracing::error!(
                    resource = %instrument.resource,
                    station = %instrument.station,
                    error = %err,
                    "Failed to attach configured instrument"
                );
                outbox.push(format!(
                    "{} / create_interface: {}",
                    config.application.controller_id, err
                ));
            }
        }
        // Only the router and its executors may keep the outbox open.
        drop(outbox);

        let grace = config.shutdown_timeout();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router_task = tokio::spawn(router.run(shutdown_rx, grace));
        let pump_task = spawn_outbound_pump(drain, sink);

        tracing::info!(
            name = %config.application.name,
            controller_id = %config.application.controller_id,
            instruments = config.instruments.len(),
            "Controller service started"
        );

        Ok(Self {
            inbound,
            shutdown_tx,
            grace,
            router_task,
            pump_task,
            reader_tasks: Vec::new(),
        })
    }

    /// Producer for raw inbound records.
    pub fn inbound(&self) -> InboundSender {
        self.inbound.clone()
    }

    /// Feed the router from a line-oriented byte stream.
    pub fn spawn_reader<R>(&mut self, reader: R)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let task = spawn_line_reader(reader, self.inbound.clone(), self.shutdown_tx.subscribe());
        self.reader_tasks.push(task);
    }

    /// Wait until every reader has reached end of input.
    pub async fn wait_for_readers(&mut self) -> LabResult<u64> {
        let mut forwarded = 0;
        for task in &mut self.reader_tasks {
            forwarded += join_result("reader", task.await)?;
        }
        self.reader_tasks.clear();
        Ok(forwarded)
    }

    /// Stop routing, stop every executor and flush the outbox.
    pub async fn shutdown(self) -> LabResult<()> {
        tracing::info!("Controller service shutting down");
        self.shutdown_tx.send_replace(true);

        let mut errors = Vec::new();

        for task in self.reader_tasks {
            if let Err(err) = await_task("reader", task, self.grace).await {
                errors.push(err);
            }
        }

        // The router bounds each executor by `grace` itself.
        match self.router_task.await {
            Ok(Ok(())) => {}
            Ok(Err(LabError::ShutdownFailed(inner))) => errors.extend(inner),
            Ok(Err(err)) => errors.push(err),
            Err(err) if err.is_cancelled() => {}
            Err(err) => errors.push(LabError::Task {
                task: "router".to_string(),
                reason: err.to_string(),
            }),
        }

        // Every producer is gone now; the pump ends once it has delivered the rest.
        if let Err(err) = await_task("outbound pump", self.pump_task, self.grace).await {
            errors.push(err);
        }

        if errors.is_empty() {
            tracing::info!("Controller service stopped");
            Ok(())
        } else {
            Err(LabError::ShutdownFailed(errors))
        }
    }
}

fn join_result(task: &str, result: Result<LabResult<u64>, JoinError>) -> LabResult<u64> {
    match result {
        Ok(inner) => inner,
        Err(err) if err.is_cancelled() => Ok(0),
        Err(err) => Err(LabError::Task {
            task: task.to_string(),
            reason: err.to_string(),
        }),
    }
}

async fn await_task(task: &str, handle: JoinHandle<LabResult<u64>>, grace: Duration) -> LabResult<u64> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(result) => join_result(task, result),
        Err(_) => {
            tracing::warn!(task, ?grace, "Task did not stop in time, aborting");
            abort.abort();
            Err(LabError::Task {
                task: task.to_string(),
                reason: format!("did not stop within {grace:?}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentDefinition;
    use crate::device::sim::{SimDevice, SimResourceManager};
    use crate::transport::ChannelSink;

    fn config_with(instruments: &[(&str, &str)]) -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.instruments = instruments
            .iter()
            .map(|(resource, station)| InstrumentDefinition {
                resource: resource.to_string(),
                station: station.to_string(),
            })
            .collect();
        config
    }

    #[tokio::test]
    async fn configured_instruments_are_attached_at_start() {
        let rm = SimResourceManager::new().with_device("SIM::1", SimDevice::new("PowerSupply-4321"));
        let (sink, mut rx) = ChannelSink::new();
        let service = ControllerService::start(
            config_with(&[("SIM::1", "bench_A"), ("SIM::9", "bench_A")]),
            Arc::new(rm),
            DriverRegistry::builtin(),
            sink,
        )
        .await
        .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            "\"controller / create_interface: PowerSupply (4321) [bench_A] @ SIM::1\""
        );
        assert!(rx
            .recv()
            .await
            .unwrap()
            .starts_with("\"controller / create_interface: Resource 'SIM::9' unavailable"));

        service.shutdown().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = ControllerConfig::default();
        config.outbox.capacity = 0;
        let (sink, _rx) = ChannelSink::new();
        let result = ControllerService::start(
            config,
            Arc::new(SimResourceManager::new()),
            DriverRegistry::builtin(),
            sink,
        )
        .await;
        assert!(matches!(result, Err(LabError::Configuration(_))));
    }
}
