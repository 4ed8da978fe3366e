//! Flow table.
//!
//! Keyed by the canonical endpoint tuple (`endpoint.rs`) rather than raw
//! source/destination order, so canonicalization lives in one shared
//! place instead of being duplicated at each call site.

use crate::endpoint::CanonicalEndpoints;
use crate::error::Error;
use crate::hash_table::Table;
use crate::memcap::Memcap;
use crate::packet::{tcp_flags, Packet, IPPROTO_TCP};
use crate::aging::AgingQueue;

/// Rough accounting unit charged against `FlowMaxMem`; the entry itself
/// is fixed-size, so this is just `size_of::<FlowEntry>()` rounded up
/// for bookkeeping overhead.
const FLOW_ENTRY_BYTES: usize = 128;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlowEntry {
    pub version: u8,
    pub protocol: u8,
    pub srcaddr_a: crate::ip::IpAddress,
    pub port_a: u16,
    pub srcaddr_b: crate::ip::IpAddress,
    pub port_b: u16,
    pub octet_count: u64,
    pub packet_count: u64,
    pub fin_count: u64,
    pub syn_count: u64,
    pub rst_count: u64,
    pub psh_count: u64,
    pub ack_count: u64,
    pub urg_count: u64,
    pub ece_count: u64,
    pub cwr_count: u64,
    pub time_start: u64,
    pub time_end: u64,
}

impl FlowEntry {
    fn new(endpoints: &CanonicalEndpoints, now: u64) -> Self {
        Self {
            version: endpoints.version,
            protocol: endpoints.protocol,
            srcaddr_a: endpoints.addr_a,
            port_a: endpoints.port_a,
            srcaddr_b: endpoints.addr_b,
            port_b: endpoints.port_b,
            time_start: now,
            time_end: now,
            ..Default::default()
        }
    }

    fn update(&mut self, pkt: &impl Packet, now: u64) {
        self.octet_count = self.octet_count.saturating_add(pkt.paysize() as u64);
        self.packet_count += 1;
        self.time_end = now;

        if pkt.protocol() == IPPROTO_TCP {
            let flags = pkt.tcpflags();
            if flags & tcp_flags::FIN != 0 {
                self.fin_count += 1;
            }
            if flags & tcp_flags::SYN != 0 {
                self.syn_count += 1;
            }
            if flags & tcp_flags::RST != 0 {
                self.rst_count += 1;
            }
            if flags & tcp_flags::PSH != 0 {
                self.psh_count += 1;
            }
            if flags & tcp_flags::ACK != 0 {
                self.ack_count += 1;
            }
            if flags & tcp_flags::URG != 0 {
                self.urg_count += 1;
            }
            if flags & tcp_flags::ECE != 0 {
                self.ece_count += 1;
            }
            if flags & tcp_flags::CWR != 0 {
                self.cwr_count += 1;
            }
        }
    }
}

pub struct FlowTable {
    table: Table<FlowEntry>,
    queue: AgingQueue<Vec<u8>>,
    memcap: Memcap,
}

impl FlowTable {
    pub fn new(buckets: usize, memcap_budget: usize, age_limit: u64) -> Self {
        Self {
            table: Table::with_buckets(buckets),
            queue: AgingQueue::new(age_limit),
            memcap: Memcap::new(memcap_budget),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, endpoints: &CanonicalEndpoints) -> Option<&FlowEntry> {
        self.table.get(&endpoints.to_bytes())
    }

    /// Get-or-create the entry for this packet's flow, then update its
    /// counters. Eviction (`sweep_expired`) is the pipeline driver's job,
    /// run once per packet after all tables have been touched.
    pub fn process_packet(&mut self, pkt: &impl Packet, now: u64) -> Result<(), Error> {
        let (endpoints, _direction) = CanonicalEndpoints::from_packet(pkt);
        let key = endpoints.to_bytes();

        if self.table.get(&key).is_some() {
            self.queue.bump(&key, now);
        } else {
            self.memcap.reserve(FLOW_ENTRY_BYTES)?;
            let entry = FlowEntry::new(&endpoints, now);
            if self.table.insert(key.clone(), entry).is_err() {
                self.memcap.release(FLOW_ENTRY_BYTES);
                return Err(Error::Fatal("flow key collision".to_string()));
            }
            self.queue.insert(key.clone(), now);
        }

        let entry = self.table.get_mut(&key).expect("present by construction");
        entry.update(pkt, now);
        Ok(())
    }

    pub fn sweep_expired(&mut self, now: u64) {
        let table = &mut self.table;
        let memcap = &self.memcap;
        self.queue.sweep(now, |key| {
            if table.remove(key).is_some() {
                memcap.release(FLOW_ENTRY_BYTES);
            }
        });
    }

    /// Deadline of the entry a sweep would expire next, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.next_deadline()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.table.iter().map(|(_, v)| v)
    }

    /// Drains every entry (releasing its memcap charge) and destroys the
    /// table and memcap. Used on shutdown.
    pub fn destroy(mut self) -> Result<(), Error> {
        let keys: Vec<Vec<u8>> = self.table.iter().map(|(k, _)| k.to_vec()).collect();
        for key in &keys {
            if self.table.remove(key).is_some() {
                self.memcap.release(FLOW_ENTRY_BYTES);
            }
            self.queue.delete(key);
        }
        self.table.destroy();
        self.memcap.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpAddress;
    use crate::packet::{DecodedPacket, IPPROTO_TCP};

    fn pkt(src: IpAddress, sport: u16, dst: IpAddress, dport: u16, flags: u8) -> DecodedPacket {
        DecodedPacket {
            version: 4,
            srcaddr: src,
            dstaddr: dst,
            srcport: sport,
            dstport: dport,
            protocol: IPPROTO_TCP,
            identification: 0,
            fragment_offset: 0,
            more_fragments: false,
            tcpflags: flags,
            seq: 0,
            ack: 0,
            win: 0,
            payload: vec![0; 40],
        }
    }

    #[test]
    fn both_directions_accumulate_into_one_entry_p1() {
        let mut table = FlowTable::new(8, 1 << 20, 300);
        let a = IpAddress::V4([10, 0, 0, 5]);
        let b = IpAddress::V4([10, 0, 0, 9]);

        table.process_packet(&pkt(a, 1111, b, 80, tcp_flags::SYN), 0).unwrap();
        table.process_packet(&pkt(b, 80, a, 1111, tcp_flags::SYN | tcp_flags::ACK), 0).unwrap();

        assert_eq!(table.len(), 1);
        let (endpoints, _) = CanonicalEndpoints::from_packet(&pkt(a, 1111, b, 80, 0));
        let entry = table.get(&endpoints).expect("entry exists");
        assert_eq!(entry.packet_count, 2);
        assert_eq!(entry.syn_count, 2);
        assert_eq!(entry.ack_count, 1);
    }

    #[test]
    fn packet_count_never_zero_while_entry_exists() {
        let mut table = FlowTable::new(8, 1 << 20, 300);
        let a = IpAddress::V4([10, 0, 0, 1]);
        let b = IpAddress::V4([10, 0, 0, 2]);
        table.process_packet(&pkt(a, 1, b, 2, tcp_flags::SYN), 0).unwrap();
        for entry in table.iter() {
            assert!(entry.packet_count >= 1);
            assert!(entry.time_end >= entry.time_start);
        }
    }

    #[test]
    fn sweep_evicts_and_releases_memcap() {
        let mut table = FlowTable::new(8, 1 << 20, 60);
        let a = IpAddress::V4([10, 0, 0, 1]);
        let b = IpAddress::V4([10, 0, 0, 2]);
        table.process_packet(&pkt(a, 1, b, 2, tcp_flags::SYN), 0).unwrap();
        assert_eq!(table.memcap.allocated(), FLOW_ENTRY_BYTES);
        table.sweep_expired(61);
        assert!(table.is_empty());
        assert_eq!(table.memcap.allocated(), 0);
    }
}
