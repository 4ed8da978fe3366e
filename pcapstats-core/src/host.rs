//! Host table. Keyed by a single address; every packet touches two
//! entries (source side → tx, destination side → rx).

use crate::error::Error;
use crate::hash_table::Table;
use crate::ip::IpAddress;
use crate::memcap::Memcap;
use crate::packet::Packet;
use crate::aging::AgingQueue;

const HOST_ENTRY_BYTES: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct HostEntry {
    pub address: IpAddress,
    pub version: u8,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_octets: u64,
    pub tx_octets: u64,
}

impl HostEntry {
    fn new(address: IpAddress, version: u8) -> Self {
        Self { address, version, rx_packets: 0, tx_packets: 0, rx_octets: 0, tx_octets: 0 }
    }
}

fn key_bytes(addr: &IpAddress) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 16);
    buf.push(addr.version());
    buf.extend_from_slice(addr.octets());
    buf
}

pub struct HostTable {
    table: Table<HostEntry>,
    queue: AgingQueue<Vec<u8>>,
    memcap: Memcap,
}

impl HostTable {
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

    pub fn get(&self, address: &IpAddress) -> Option<&HostEntry> {
        self.table.get(&key_bytes(address))
    }

    fn touch(&mut self, address: IpAddress, version: u8, now: u64) -> Result<(), Error> {
        let key = key_bytes(&address);
        if self.table.get(&key).is_some() {
            self.queue.bump(&key, now);
        } else {
            self.memcap.reserve(HOST_ENTRY_BYTES)?;
            let entry = HostEntry::new(address, version);
            if self.table.insert(key.clone(), entry).is_err() {
                self.memcap.release(HOST_ENTRY_BYTES);
                return Err(Error::Fatal("host key collision".to_string()));
            }
            self.queue.insert(key, now);
        }
        Ok(())
    }

    /// Records one packet against both its source and destination hosts.
    pub fn process_packet(&mut self, pkt: &impl Packet, now: u64) -> Result<(), Error> {
        let version = pkt.version();
        let paysize = pkt.paysize() as u64;

        self.touch(pkt.srcaddr(), version, now)?;
        let src_key = key_bytes(&pkt.srcaddr());
        let src = self.table.get_mut(&src_key).expect("just touched");
        src.tx_packets += 1;
        src.tx_octets = src.tx_octets.saturating_add(paysize);

        self.touch(pkt.dstaddr(), version, now)?;
        let dst_key = key_bytes(&pkt.dstaddr());
        let dst = self.table.get_mut(&dst_key).expect("just touched");
        dst.rx_packets += 1;
        dst.rx_octets = dst.rx_octets.saturating_add(paysize);

        Ok(())
    }

    pub fn sweep_expired(&mut self, now: u64) {
        let table = &mut self.table;
        let memcap = &self.memcap;
        self.queue.sweep(now, |key| {
            if table.remove(key).is_some() {
                memcap.release(HOST_ENTRY_BYTES);
            }
        });
    }

    /// Deadline of the entry a sweep would expire next, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.next_deadline()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostEntry> {
        self.table.iter().map(|(_, v)| v)
    }

    /// Drains every entry (releasing its memcap charge) and destroys the
    /// table and memcap. Used on shutdown.
    pub fn destroy(mut self) -> Result<(), Error> {
        let keys: Vec<Vec<u8>> = self.table.iter().map(|(k, _)| k.to_vec()).collect();
        for key in &keys {
            if self.table.remove(key).is_some() {
                self.memcap.release(HOST_ENTRY_BYTES);
            }
            self.queue.delete(key);
        }
        self.table.destroy();
        self.memcap.destroy()
    }
}
