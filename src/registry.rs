//! Ownership registry.
//!
//! Maps every attached instrument id to its executor handle, station and resource locator,
//! and every station to the ids it contains. Entries live for the lifetime of the process;
//! re-registering an id replaces the previous entry and moves the id to its new station.

use crate::executor::{ExecutorHandle, InstrumentId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Operator-facing description of an attached instrument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstrumentInfo {
    /// Owning station
    pub station: String,
    /// Locator the instrument was opened from
    #[serde(rename = "resource_name")]
    pub resource: String,
    /// Driver name, e.g. `PowerSupply`
    #[serde(rename = "type")]
    pub kind: String,
}

/// One registry entry.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Executor serving the instrument
    pub handle: ExecutorHandle,
    /// What `list_instruments` reports
    pub info: InstrumentInfo,
    /// When `attach` registered it
    pub attached_at: DateTime<Utc>,
}

/// Instrument id → entry, station → ids.
#[derive(Default)]
pub struct Registry {
    instruments: HashMap<InstrumentId, RegistryEntry>,
    stations: HashMap<String, Vec<InstrumentId>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry` under `id`, returning the entry it replaced.
    pub fn register(&mut self, id: InstrumentId, entry: RegistryEntry) -> Option<RegistryEntry> {
        let previous = self.instruments.remove(&id);
        if let Some(old) = &previous {
            if let Some(ids) = self.stations.get_mut(&old.info.station) {
                ids.retain(|existing| existing != &id);
            }
        }

        self.stations
            .entry(entry.info.station.clone())
            .or_default()
            .push(id.clone());
        self.instruments.insert(id, entry);
        previous
    }

    /// Entry for `id`.
    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.instruments.get(id)
    }

    /// Handle of the executor owning `id`.
    pub fn executor(&self, id: &str) -> Option<&ExecutorHandle> {
        self.get(id).map(|entry| &entry.handle)
    }

    /// Station owning `id`.
    pub fn station_of(&self, id: &str) -> Option<&str> {
        self.get(id).map(|entry| entry.info.station.as_str())
    }

    /// Ids attached to `station`, in attach order.
    pub fn ids_in(&self, station: &str) -> &[InstrumentId] {
        self.stations.get(station).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All instruments, sorted by id.
    pub fn list(&self) -> BTreeMap<InstrumentId, InstrumentInfo> {
        self.instruments
            .iter()
            .map(|(id, entry)| (id.clone(), entry.info.clone()))
            .collect()
    }

    /// Every executor handle, in no particular order.
    pub fn handles(&self) -> impl Iterator<Item = &ExecutorHandle> {
        self.instruments.values().map(|entry| &entry.handle)
    }

    /// `(id, handle)` pairs, sorted by id.
    pub fn entries(&self) -> BTreeMap<&str, &RegistryEntry> {
        self.instruments
            .iter()
            .map(|(id, entry)| (id.as_str(), entry))
            .collect()
    }

    /// Attached instrument count.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// True before the first attach.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTable;
    use crate::device::sim::{SimDevice, SimResourceManager};
    use crate::device::{ResourceManager, SessionOptions};
    use crate::executor::{new_executor, ExecutorOptions};
    use crate::outbox::Outbox;

    async fn entry(id: &str, station: &str) -> RegistryEntry {
        let rm = SimResourceManager::new().with_device("SIM::1", SimDevice::new("Test-1"));
        let session = rm.open("SIM::1", &SessionOptions::default()).await.unwrap();
        let (outbox, _drain) = Outbox::channel(4);
        let (handle, _worker) = new_executor(
            id,
            "Test",
            session,
            CommandTable::new(),
            outbox,
            ExecutorOptions::default(),
        );
        RegistryEntry {
            handle,
            info: InstrumentInfo {
                station: station.to_string(),
                resource: "SIM::1".to_string(),
                kind: "Test".to_string(),
            },
            attached_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn registers_and_looks_up() {
        let mut registry = Registry::new();
        assert!(registry.register("4321".into(), entry("4321", "bench_A").await).is_none());
        assert!(registry.register("1234".into(), entry("1234", "bench_A").await).is_none());

        assert_eq!(registry.station_of("4321"), Some("bench_A"));
        assert_eq!(registry.ids_in("bench_A"), &["4321".to_string(), "1234".to_string()]);
        assert!(registry.executor("9999").is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list().keys().collect::<Vec<_>>(), vec!["1234", "4321"]);
    }

    #[tokio::test]
    async fn re_registration_moves_the_id() {
        let mut registry = Registry::new();
        registry.register("4321".into(), entry("4321", "bench_A").await);
        let previous = registry
            .register("4321".into(), entry("4321", "bench_B").await)
            .unwrap();

        assert_eq!(previous.info.station, "bench_A");
        assert_eq!(registry.station_of("4321"), Some("bench_B"));
        assert!(registry.ids_in("bench_A").is_empty());
        assert_eq!(registry.ids_in("bench_B"), &["4321".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn info_serializes_with_wire_names() {
        let info = InstrumentInfo {
            station: "bench_A".into(),
            resource: "ASRL2::INSTR".into(),
            kind: "PowerSupply".into(),
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            serde_json::json!({"station": "bench_A", "resource_name": "ASRL2::INSTR", "type": "PowerSupply"})
        );
    }
}
