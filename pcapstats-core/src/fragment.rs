//! IP fragment reassembler.
//!
//! Fragment coverage is tracked as a sorted, merged list of byte ranges:
//! reassembly is complete exactly when that list collapses to the single
//! range `[0, total_length)`. Overlap policy is `first`: bytes already
//! covered are never overwritten by a later, overlapping fragment.

use crate::aging::AgingQueue;
use crate::error::Error;
use crate::hash_table::Table;
use crate::ip::IpAddress;
use crate::memcap::Memcap;
use crate::packet::{DecodedPacket, Packet};

const MAX_DATAGRAM_V4: u32 = 65535;
/// RFC 2675 jumbogram ceiling. The 13-bit fragment offset field itself
/// can't address a datagram this large over the wire, but the bound is
/// kept distinct from the v4 constant.
const MAX_DATAGRAM_V6: u32 = u32::MAX;

const BUCKET_OVERHEAD_BYTES: usize = 128;

/// Fragment overlap policy (`FragModel` config keyword). Only `first` is
/// implemented; unknown values are a config-time error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapModel {
    First,
}

impl std::str::FromStr for OverlapModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "first" => Ok(OverlapModel::First),
            other => Err(Error::Config(format!("unknown FragModel '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub srcaddr: IpAddress,
    pub dstaddr: IpAddress,
    pub identification: u32,
    pub protocol: u8,
}

impl FragmentKey {
    pub fn from_packet(pkt: &impl Packet) -> Self {
        Self {
            srcaddr: pkt.srcaddr(),
            dstaddr: pkt.dstaddr(),
            identification: pkt.identification(),
            protocol: pkt.protocol(),
        }
    }

    /// Canonical byte-wise key for `Table`. A leading version tag
    /// disambiguates the otherwise variable-width address octets.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 32 + 4 + 1);
        buf.push(self.srcaddr.version());
        buf.extend_from_slice(self.srcaddr.octets());
        buf.extend_from_slice(self.dstaddr.octets());
        buf.extend_from_slice(&self.identification.to_be_bytes());
        buf.push(self.protocol);
        buf
    }
}

/// First-fragment-only header fields, carried forward so the reassembled
/// datagram can still report a transport header once coverage completes.
#[derive(Debug, Clone, Default)]
struct CarriedHeader {
    srcport: u16,
    dstport: u16,
    tcpflags: u8,
    seq: u32,
    ack: u32,
    win: u16,
}

struct FragmentBucket {
    key: FragmentKey,
    version: u8,
    covered: Vec<(u32, u32)>,
    buffer: Vec<u8>,
    total_length: Option<u32>,
    header: Option<CarriedHeader>,
    reserved_bytes: usize,
}

impl FragmentBucket {
    fn new(key: FragmentKey, version: u8) -> Self {
        Self {
            key,
            version,
            covered: Vec::new(),
            buffer: Vec::new(),
            total_length: None,
            header: None,
            reserved_bytes: 0,
        }
    }

    fn is_complete(&self) -> bool {
        match self.total_length {
            Some(total) => self.covered.as_slice() == [(0, total)],
            None => false,
        }
    }

    /// Merge `[start, end)` into the covered-range set, returning the
    /// gaps (subranges not already covered) that the caller should
    /// actually copy bytes into.
    fn merge_covered(&mut self, start: u32, end: u32) -> Vec<(u32, u32)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        for &(cs, ce) in self.covered.iter() {
            if ce <= cursor {
                continue;
            }
            if cs >= end {
                break;
            }
            if cs > cursor {
                gaps.push((cursor, cs.min(end)));
            }
            cursor = cursor.max(ce);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }

        self.covered.push((start, end));
        self.covered.sort_unstable_by_key(|&(s, _)| s);
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.covered.len());
        for &(s, e) in &self.covered {
            if let Some(last) = merged.last_mut() {
                let (_, last_end): &mut (u32, u32) = last;
                if s <= *last_end {
                    *last_end = (*last_end).max(e);
                    continue;
                }
            }
            merged.push((s, e));
        }
        self.covered = merged;
        gaps
    }
}

pub struct FragmentReassembler {
    table: Table<FragmentBucket>,
    queue: AgingQueue<Vec<u8>>,
    memcap: Memcap,
    model: OverlapModel,
}

impl FragmentReassembler {
    pub fn new(buckets: usize, memcap_budget: usize, age_limit: u64, model: OverlapModel) -> Self {
        Self {
            table: Table::with_buckets(buckets),
            queue: AgingQueue::new(age_limit),
            memcap: Memcap::new(memcap_budget),
            model,
        }
    }

    pub fn model(&self) -> OverlapModel {
        self.model
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Feed one fragment into the reassembler. Returns `Ok(Some(packet))`
    /// the moment a datagram completes, `Ok(None)` if more fragments are
    /// still outstanding, and `Err` for malformed input or a budget
    /// refusal (the fragment is dropped in either case).
    pub fn process(&mut self, pkt: &DecodedPacket, now: u64) -> Result<Option<DecodedPacket>, Error> {
        if !pkt.is_fragment() {
            return Ok(None);
        }

        let key = FragmentKey::from_packet(pkt);
        let key_bytes = key.to_bytes();
        let offset = pkt.fragment_offset();
        let max_len = if pkt.version() == 4 { MAX_DATAGRAM_V4 } else { MAX_DATAGRAM_V6 };

        let end = offset.checked_add(pkt.paysize() as u32).ok_or(Error::MalformedPacket(
            "fragment offset overflow".to_string(),
        ))?;
        if end > max_len {
            self.evict(&key_bytes);
            return Err(Error::FragmentOverlap);
        }

        if self.table.get(&key_bytes).is_none() {
            self.memcap.reserve(BUCKET_OVERHEAD_BYTES)?;
            let bucket = FragmentBucket::new(key.clone(), pkt.version());
            if self.table.insert(key_bytes.clone(), bucket).is_err() {
                self.memcap.release(BUCKET_OVERHEAD_BYTES);
                return Err(Error::Fatal("fragment bucket key collision".to_string()));
            }
            self.table.get_mut(&key_bytes).expect("just inserted").reserved_bytes = BUCKET_OVERHEAD_BYTES;
            self.queue.insert(key_bytes.clone(), now);
        } else {
            self.queue.bump(&key_bytes, now);
        }

        let bucket = self.table.get_mut(&key_bytes).expect("present by construction");

        if offset == 0 {
            bucket.header = Some(CarriedHeader {
                srcport: pkt.srcport(),
                dstport: pkt.dstport(),
                tcpflags: pkt.tcpflags(),
                seq: pkt.seq(),
                ack: pkt.ack(),
                win: pkt.win(),
            });
        }
        if !pkt.more_fragments() {
            bucket.total_length = Some(end);
        }

        let gaps = bucket.merge_covered(offset, end);
        let growth: usize = gaps.iter().map(|&(s, e)| (e - s) as usize).sum();
        if growth > 0 {
            if let Err(e) = self.memcap.reserve(growth) {
                self.evict(&key_bytes);
                return Err(e);
            }
            let bucket = self.table.get_mut(&key_bytes).expect("present");
            bucket.reserved_bytes += growth;
            if bucket.buffer.len() < end as usize {
                bucket.buffer.resize(end as usize, 0);
            }
            for (gs, ge) in gaps {
                let src_start = (gs - offset) as usize;
                let src_end = (ge - offset) as usize;
                bucket.buffer[gs as usize..ge as usize].copy_from_slice(&pkt.payload()[src_start..src_end]);
            }
        }

        let bucket = self.table.get(&key_bytes).expect("present");
        if !bucket.is_complete() {
            return Ok(None);
        }

        let bucket = self.table.remove(&key_bytes).expect("present");
        self.queue.delete(&key_bytes);
        self.memcap.release(bucket.reserved_bytes);

        let header = bucket.header.unwrap_or_default();
        Ok(Some(DecodedPacket {
            version: bucket.version,
            srcaddr: bucket.key.srcaddr,
            dstaddr: bucket.key.dstaddr,
            srcport: header.srcport,
            dstport: header.dstport,
            protocol: bucket.key.protocol,
            identification: bucket.key.identification,
            fragment_offset: 0,
            more_fragments: false,
            tcpflags: header.tcpflags,
            seq: header.seq,
            ack: header.ack,
            win: header.win,
            payload: bucket.buffer,
        }))
    }

    fn evict(&mut self, key_bytes: &[u8]) {
        if let Some(bucket) = self.table.remove(key_bytes) {
            self.memcap.release(bucket.reserved_bytes);
        }
        self.queue.delete(&key_bytes.to_vec());
    }

    /// Expire incomplete datagrams whose deadline has passed.
    pub fn sweep_expired(&mut self, now: u64) {
        let table = &mut self.table;
        let memcap = &self.memcap;
        self.queue.sweep(now, |key| {
            if let Some(bucket) = table.remove(key) {
                memcap.release(bucket.reserved_bytes);
            }
        });
    }

    /// Deadline of the bucket a sweep would expire next, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.next_deadline()
    }

    /// Drains every incomplete bucket (releasing its memcap charge) and
    /// destroys the table and memcap. Used on shutdown.
    pub fn destroy(mut self) -> Result<(), Error> {
        let keys: Vec<Vec<u8>> = self.table.iter().map(|(k, _)| k.to_vec()).collect();
        for key in &keys {
            if let Some(bucket) = self.table.remove(key) {
                self.memcap.release(bucket.reserved_bytes);
            }
            self.queue.delete(key);
        }
        self.table.destroy();
        self.memcap.destroy()
    }
}
