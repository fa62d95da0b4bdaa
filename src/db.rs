use multimap::MultiMap;

use crate::models::domain::{FlowKey, PacketRecord};
use crate::models::dto::DetailedPacket;

/// Recent packets per flow, kept for drill-down requests.
#[derive(Debug)]
pub struct PacketStore {
    entries: MultiMap<FlowKey, DetailedPacket>,
    limit: usize,
    next_id: u64,
}

impl PacketStore {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: MultiMap::new(),
            limit: limit.max(1),
            next_id: 0,
        }
    }

    pub fn store_event(&mut self, key: FlowKey, record: &PacketRecord) {
        self.next_id += 1;
        self.entries
            .insert(key, DetailedPacket::from_record(self.next_id, record));
        if let Some(packets) = self.entries.get_vec_mut(&key) {
            if packets.len() > self.limit {
                let excess = packets.len() - self.limit;
                packets.drain(..excess);
            }
        }
    }

    /// Both directions of the conversation: `key` first, then its reverse.
    pub fn packets_for(&self, key: FlowKey) -> Vec<DetailedPacket> {
        let mut packets = self.entries.get_vec(&key).cloned().unwrap_or_default();
        let reverse = key.reversed();
        if reverse != key {
            if let Some(replies) = self.entries.get_vec(&reverse) {
                packets.extend(replies.iter().cloned());
            }
        }
        packets
    }

    pub fn len(&self) -> usize {
        self.entries.iter_all().map(|(_, packets)| packets.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
