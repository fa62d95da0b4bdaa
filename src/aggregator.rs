use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::AggregateError;
use crate::models::domain::{Flow, FlowKey, Host, HostId, PacketRecord};
use crate::models::dto::GraphSnapshot;

/// Owned host/flow graph state driven by a single writer.
///
/// Bounded variants (LRU, TTL) can be substituted behind this trait without
/// touching the ingest pipeline.
pub trait GraphState: Send {
    /// Folds one record into the graph without materialising a snapshot.
    fn ingest(&mut self, record: &PacketRecord) -> Result<FlowKey, AggregateError>;

    /// Materialises and caches the current state.
    fn publish(&mut self) -> Arc<GraphSnapshot>;

    fn snapshot(&self) -> Arc<GraphSnapshot>;

    fn reset(&mut self);

    fn apply(&mut self, record: PacketRecord) -> Result<Arc<GraphSnapshot>, AggregateError> {
        self.ingest(&record)?;
        Ok(self.publish())
    }
}

/// Unbounded aggregator: hosts and flows are never evicted.
#[derive(Debug, Default)]
pub struct Aggregator {
    hosts: Vec<Host>,
    host_index: HashMap<Arc<str>, usize>,
    flows: Vec<Flow>,
    flow_index: HashMap<FlowKey, usize>,
    last_host_id: u64,
    // survives reset so published snapshots keep ordering
    version: u64,
    dropped: u64,
    faulted: Option<String>,
    published: Arc<GraphSnapshot>,
    dirty: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty aggregator whose snapshots continue after `version`.
    pub fn resume_from(version: u64) -> Self {
        Self {
            version: version + 1,
            dirty: true,
            ..Self::default()
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Records rejected as malformed since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    fn resolve_host(&mut self, address: &str) -> Result<usize, AggregateError> {
        if let Some(&index) = self.host_index.get(address) {
            return Ok(index);
        }
        let next = self
            .last_host_id
            .checked_add(1)
            .ok_or_else(|| self.fault("host id counter exhausted".into()))?;
        if self.hosts.len() as u64 != self.last_host_id {
            let reason = format!(
                "host id counter at {} but {} hosts are known",
                self.last_host_id,
                self.hosts.len()
            );
            return Err(self.fault(reason));
        }

        let address: Arc<str> = Arc::from(address);
        self.last_host_id = next;
        self.hosts.push(Host {
            id: HostId(next),
            address: address.clone(),
            packet_count: 0,
            byte_count: 0,
        });
        let index = self.hosts.len() - 1;
        self.host_index.insert(address, index);
        debug!(id = next, address = %self.hosts[index].address, "new host");
        Ok(index)
    }

    fn fault(&mut self, reason: String) -> AggregateError {
        warn!(%reason, "aggregator invariant violated");
        self.faulted = Some(reason.clone());
        AggregateError::Invariant(reason)
    }

    fn touch_host(&mut self, index: usize, length: u64) {
        let host = &mut self.hosts[index];
        host.packet_count = host.packet_count.saturating_add(1);
        host.byte_count = host.byte_count.saturating_add(length);
    }

    fn materialize(&self) -> GraphSnapshot {
        GraphSnapshot {
            version: self.version,
            hosts: self.hosts.clone(),
            flows: self.flows.clone(),
        }
    }
}

impl GraphState for Aggregator {
    fn ingest(&mut self, record: &PacketRecord) -> Result<FlowKey, AggregateError> {
        if let Some(reason) = &self.faulted {
            return Err(AggregateError::Faulted(reason.clone()));
        }
        if let Err(err) = record.validate() {
            self.dropped += 1;
            return Err(err.into());
        }

        let source = self.resolve_host(&record.source_addr)?;
        let dest = self.resolve_host(&record.dest_addr)?;
        self.touch_host(source, record.length);
        // self-traffic is one record, counted once
        if dest != source {
            self.touch_host(dest, record.length);
        }

        let key = FlowKey::new(self.hosts[source].id, self.hosts[dest].id, record.protocol);
        let index = match self.flow_index.get(&key) {
            Some(&index) => index,
            None => {
                self.flows.push(Flow {
                    source_host_id: key.source,
                    dest_host_id: key.dest,
                    protocol: key.protocol,
                    packet_count: 0,
                    byte_count: 0,
                    last_timestamp_ms: 0.0,
                });
                self.flow_index.insert(key, self.flows.len() - 1);
                self.flows.len() - 1
            }
        };
        let flow = &mut self.flows[index];
        flow.packet_count = flow.packet_count.saturating_add(1);
        flow.byte_count = flow.byte_count.saturating_add(record.length);
        // latest observed wins, even when records arrive out of order
        flow.last_timestamp_ms = record.timestamp * 1000.0;

        self.version += 1;
        self.dirty = true;
        Ok(key)
    }

    fn publish(&mut self) -> Arc<GraphSnapshot> {
        if self.dirty {
            self.published = Arc::new(self.materialize());
            self.dirty = false;
        }
        self.published.clone()
    }

    fn snapshot(&self) -> Arc<GraphSnapshot> {
        if self.dirty {
            Arc::new(self.materialize())
        } else {
            self.published.clone()
        }
    }

    fn reset(&mut self) {
        let version = self.version + 1;
        let dropped = self.dropped;
        *self = Aggregator {
            version,
            dropped,
            dirty: true,
            ..Aggregator::default()
        };
    }
}
