//! Pipeline driver: decode → defragment → TCP track → flow/host record →
//! sweep.
//!
//! Table ownership is `Arc<Mutex<_>>` uniformly, whether or not a
//! background sweeper is running: an uncontended lock is cheap, and it
//! keeps a single code path for both concurrency modes rather than two
//! parallel `Pipeline` implementations.

use crate::config::Config;
use crate::error::Error;
use crate::flow::FlowTable;
use crate::fragment::FragmentReassembler;
use crate::hexdump;
use crate::host::HostTable;
use crate::packet::{decode_ethernet, DecodedPacket, Packet};
use crate::sweeper::{BackgroundSweeper, SharedTables};
use crate::tcp::SessionTable;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

const TABLE_BUCKETS: usize = 4096;

fn wall_clock_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Running counters. Per-packet errors are absorbed and counted here;
/// they never propagate out of `Pipeline::handle`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketStats {
    pub received: u64,
    pub malformed: u64,
    pub fragments_pending: u64,
    pub fragments_reassembled: u64,
    pub fragment_overlap_violations: u64,
    pub tcp_accepted: u64,
    pub tcp_rejected: u64,
    pub alloc_budget_exceeded: u64,
}

pub struct Pipeline {
    fragments: Arc<Mutex<FragmentReassembler>>,
    sessions: Arc<Mutex<SessionTable>>,
    flows: Arc<Mutex<FlowTable>>,
    hosts: Arc<Mutex<HostTable>>,
    /// `Some` only in background-sweeper mode; its presence is also what
    /// tells `handle` to skip the inline sweep at the end of every
    /// packet, since the sweeper thread owns that job instead.
    sweeper: Option<BackgroundSweeper>,
    hexdump_enabled: bool,
    stats: PacketStats,
}

impl Pipeline {
    pub fn new(config: &Config) -> Self {
        let fragments = Arc::new(Mutex::new(FragmentReassembler::new(
            TABLE_BUCKETS,
            config.frag_max_mem,
            config.frag_age_limit,
            config.frag_model,
        )));
        let sessions = Arc::new(Mutex::new(SessionTable::new(TABLE_BUCKETS, config.flow_age_limit)));
        let flows =
            Arc::new(Mutex::new(FlowTable::new(TABLE_BUCKETS, config.flow_max_mem, config.flow_age_limit)));
        let hosts =
            Arc::new(Mutex::new(HostTable::new(TABLE_BUCKETS, config.host_max_mem, config.host_age_limit)));

        let sweeper = config.background_sweeper.then(|| {
            let shared = SharedTables {
                fragments: fragments.clone(),
                sessions: sessions.clone(),
                flows: flows.clone(),
                hosts: hosts.clone(),
            };
            BackgroundSweeper::spawn(shared, wall_clock_now)
        });

        Self { fragments, sessions, flows, hosts, sweeper, hexdump_enabled: false, stats: PacketStats::default() }
    }

    pub fn set_hexdump_enabled(&mut self, enabled: bool) {
        self.hexdump_enabled = enabled;
    }

    pub fn stats(&self) -> PacketStats {
        self.stats
    }

    pub fn flows(&self) -> MutexGuard<'_, FlowTable> {
        self.flows.lock().expect("flow table lock poisoned")
    }

    pub fn hosts(&self) -> MutexGuard<'_, HostTable> {
        self.hosts.lock().expect("host table lock poisoned")
    }

    /// Feed one raw Ethernet frame through the full pipeline.
    pub fn handle(&mut self, frame: &[u8], now: u64) {
        self.stats.received += 1;

        let Some(decoded) = decode_ethernet(frame) else {
            self.stats.malformed += 1;
            trace!("malformed frame, {} bytes", frame.len());
            return;
        };

        if self.hexdump_enabled {
            debug!("\n{}", hexdump::format(decoded.payload()));
        }

        let packet = match self.reassemble(&decoded, now) {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                self.count_error(&e);
                return;
            }
        };

        if packet.protocol() == crate::packet::IPPROTO_TCP {
            let outcome = self.sessions.lock().expect("session table lock poisoned").process_packet(&packet, now);
            if let Some(outcome) = outcome {
                match outcome {
                    crate::tcp::Outcome::Accepted => self.stats.tcp_accepted += 1,
                    crate::tcp::Outcome::Rejected => self.stats.tcp_rejected += 1,
                }
            }
        }

        if let Err(e) = self.flows.lock().expect("flow table lock poisoned").process_packet(&packet, now) {
            self.count_error(&e);
        }
        if let Err(e) = self.hosts.lock().expect("host table lock poisoned").process_packet(&packet, now) {
            self.count_error(&e);
        }

        if self.sweeper.is_none() {
            self.flows.lock().expect("flow table lock poisoned").sweep_expired(now);
            self.hosts.lock().expect("host table lock poisoned").sweep_expired(now);
            self.fragments.lock().expect("fragment table lock poisoned").sweep_expired(now);
            self.sessions.lock().expect("session table lock poisoned").sweep_expired(now);
        }
    }

    fn reassemble(&mut self, decoded: &DecodedPacket, now: u64) -> Result<Option<DecodedPacket>, Error> {
        if !decoded.is_fragment() {
            return Ok(Some(decoded.clone()));
        }
        let mut fragments = self.fragments.lock().expect("fragment table lock poisoned");
        match fragments.process(decoded, now) {
            Ok(Some(reassembled)) => {
                self.stats.fragments_reassembled += 1;
                Ok(Some(reassembled))
            }
            Ok(None) => {
                self.stats.fragments_pending += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn count_error(&mut self, error: &Error) {
        match error {
            Error::AllocBudgetExceeded { .. } => {
                self.stats.alloc_budget_exceeded += 1;
                warn!("{error}");
            }
            Error::FragmentOverlap => {
                self.stats.fragment_overlap_violations += 1;
            }
            Error::MalformedPacket(_) => {
                self.stats.malformed += 1;
            }
            other => warn!("{other}"),
        }
    }

    /// Clean teardown: stop the background sweeper (if any), then drain
    /// and destroy each table. A table whose memcap still shows an
    /// outstanding allocation after its own drain fails to destroy,
    /// which would indicate an accounting bug rather than a legitimate
    /// shutdown state.
    pub fn shutdown(mut self) -> Result<(), Error> {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown();
        }

        fn unwrap_table<T>(name: &'static str, arc: Arc<Mutex<T>>) -> Result<T, Error> {
            Arc::try_unwrap(arc)
                .map_err(|_| Error::Fatal(format!("{name} table still shared at shutdown")))?
                .into_inner()
                .map_err(|_| Error::Fatal(format!("{name} table lock poisoned at shutdown")))
        }

        let fragments = unwrap_table("fragment", self.fragments)?;
        let sessions = unwrap_table("session", self.sessions)?;
        let flows = unwrap_table("flow", self.flows)?;
        let hosts = unwrap_table("host", self.hosts)?;

        sessions.destroy();
        fragments.destroy()?;
        flows.destroy()?;
        hosts.destroy()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_ipv4_udp(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 14];
        f[12] = 0x08;
        f[13] = 0x00;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        let total_len = (20 + 8 + payload.len()) as u16;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[9] = crate::packet::IPPROTO_UDP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        udp[2..4].copy_from_slice(&53u16.to_be_bytes());
        udp.extend_from_slice(payload);
        f.extend(ip);
        f.extend(udp);
        f
    }

    #[test]
    fn counts_received_and_updates_flow_host_tables() {
        let config = Config::default();
        let mut pipeline = Pipeline::new(&config);
        let frame = eth_ipv4_udp([10, 0, 0, 1], [10, 0, 0, 2], b"hello");
        pipeline.handle(&frame, 0);
        assert_eq!(pipeline.stats().received, 1);
        assert_eq!(pipeline.stats().malformed, 0);
        assert_eq!(pipeline.flows().len(), 1);
        assert_eq!(pipeline.hosts().len(), 2);
    }

    #[test]
    fn malformed_frame_is_counted_and_does_not_touch_tables() {
        let config = Config::default();
        let mut pipeline = Pipeline::new(&config);
        pipeline.handle(&[0u8; 4], 0);
        assert_eq!(pipeline.stats().malformed, 1);
        assert!(pipeline.flows().is_empty());
    }

    #[test]
    fn shutdown_drains_and_destroys_every_table() {
        let config = Config::default();
        let mut pipeline = Pipeline::new(&config);
        let frame = eth_ipv4_udp([10, 0, 0, 1], [10, 0, 0, 2], b"hello");
        pipeline.handle(&frame, 0);
        assert_eq!(pipeline.flows().len(), 1);
        assert_eq!(pipeline.hosts().len(), 2);

        pipeline.shutdown().expect("clean shutdown drains every reservation");
    }

    #[test]
    fn background_sweeper_mode_still_tracks_and_expires_flows() {
        let mut config = Config::default();
        config.background_sweeper = true;
        config.flow_age_limit = 1;
        let mut pipeline = Pipeline::new(&config);
        let frame = eth_ipv4_udp([10, 0, 0, 1], [10, 0, 0, 2], b"hello");
        pipeline.handle(&frame, 0);
        assert_eq!(pipeline.flows().len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(1200));
        assert!(pipeline.flows().is_empty());

        pipeline.shutdown().expect("clean shutdown drains every reservation");
    }
}
