//! Station queues.
//!
//! Staging FIFOs of `(instrument id, entry)` pairs, one per station, created implicitly the
//! first time a station is named. Stations are always visited in creation order.

use crate::envelope::{EntrySummary, QueueEntry};
use crate::executor::InstrumentId;
use std::collections::{HashMap, VecDeque};

/// Entries staged for one station.
pub type StationBatch = VecDeque<(InstrumentId, QueueEntry)>;

/// One staging FIFO per station.
#[derive(Default)]
pub struct StationQueues {
    order: Vec<String>,
    queues: HashMap<String, StationBatch>,
}

impl StationQueues {
    /// No stations yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the station queue if it does not exist yet.
    pub fn ensure(&mut self, station: &str) {
        if !self.queues.contains_key(station) {
            self.order.push(station.to_string());
            self.queues.insert(station.to_string(), VecDeque::new());
        }
    }

    /// Stage `entry` for `id`, creating the station queue on first use.
    pub fn push(&mut self, station: &str, id: InstrumentId, entry: QueueEntry) {
        self.ensure(station);
        if let Some(queue) = self.queues.get_mut(station) {
            queue.push_back((id, entry));
        }
    }

    /// Take everything currently staged for `station`.
    pub fn take(&mut self, station: &str) -> StationBatch {
        self.queues
            .get_mut(station)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Station names in creation order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Entries staged for `station`.
    pub fn len(&self, station: &str) -> usize {
        self.queues.get(station).map_or(0, VecDeque::len)
    }

    /// Entries staged across all stations.
    pub fn total_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// True when no station has anything staged.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Inspectable copy of a station's queue.
    pub fn snapshot(&self, station: &str) -> Vec<(InstrumentId, EntrySummary)> {
        self.queues
            .get(station)
            .map(|queue| {
                queue
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.summary()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
