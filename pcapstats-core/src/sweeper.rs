//! Optional background sweeper: a dedicated thread that performs aging
//! expiry so the pipeline thread never has to pay for it inline. One
//! coarse lock per table, rather than a single table-wide mutex plus a
//! separate time-queue mutex: the pipeline thread and the sweeper each
//! take a table's lock across their own compound operation (lookup then
//! mutate, or expire), so a sweeper-expired entry is never observed by
//! the pipeline afterwards.

use crate::flow::FlowTable;
use crate::fragment::FragmentReassembler;
use crate::host::HostTable;
use crate::tcp::SessionTable;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Backstop poll interval used when every table is empty and there is no
/// deadline to wait for.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// The four mutable tables shared between the pipeline thread and the
/// sweeper thread. Each table is behind its own mutex, so the sweeper
/// never holds more than one table locked at a time.
#[derive(Clone)]
pub struct SharedTables {
    pub fragments: Arc<Mutex<FragmentReassembler>>,
    pub sessions: Arc<Mutex<SessionTable>>,
    pub flows: Arc<Mutex<FlowTable>>,
    pub hosts: Arc<Mutex<HostTable>>,
}

impl SharedTables {
    fn earliest_deadline(&self) -> Option<u64> {
        [
            self.fragments.lock().expect("fragment table lock poisoned").next_deadline(),
            self.sessions.lock().expect("session table lock poisoned").next_deadline(),
            self.flows.lock().expect("flow table lock poisoned").next_deadline(),
            self.hosts.lock().expect("host table lock poisoned").next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn sweep_all(&self, now: u64) {
        self.fragments.lock().expect("fragment table lock poisoned").sweep_expired(now);
        self.sessions.lock().expect("session table lock poisoned").sweep_expired(now);
        self.flows.lock().expect("flow table lock poisoned").sweep_expired(now);
        self.hosts.lock().expect("host table lock poisoned").sweep_expired(now);
    }
}

/// Dedicated thread that blocks on a condition variable until the
/// earliest outstanding deadline across all four tables, or until woken
/// early by `shutdown`.
pub struct BackgroundSweeper {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundSweeper {
    /// `now_fn` is the sweeper's clock; production code supplies the
    /// wall clock, tests supply a fixed or stepped value.
    pub fn spawn(tables: SharedTables, now_fn: impl Fn() -> u64 + Send + 'static) -> Self {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shutdown = shutdown.clone();

        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*thread_shutdown;
            let mut guard = lock.lock().expect("sweeper shutdown lock poisoned");
            loop {
                if *guard {
                    return;
                }

                let now = now_fn();
                tables.sweep_all(now);

                let wait = match tables.earliest_deadline() {
                    Some(deadline) if deadline > now => Duration::from_secs(deadline - now),
                    Some(_) => Duration::from_millis(0),
                    None => IDLE_POLL,
                };

                let (woken, _timeout_result) =
                    cvar.wait_timeout(guard, wait).expect("sweeper condvar wait poisoned");
                guard = woken;
            }
        });

        Self { shutdown, handle: Some(handle) }
    }

    /// Wake the sweeper and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else { return };
        {
            let (lock, cvar) = &*self.shutdown;
            *lock.lock().expect("sweeper shutdown lock poisoned") = true;
            cvar.notify_one();
        }
        let _ = handle.join();
    }
}

impl Drop for BackgroundSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fragment::OverlapModel;

    fn tables(age_limit: u64) -> SharedTables {
        let config = Config::default();
        SharedTables {
            fragments: Arc::new(Mutex::new(FragmentReassembler::new(
                8,
                config.frag_max_mem,
                age_limit,
                OverlapModel::First,
            ))),
            sessions: Arc::new(Mutex::new(SessionTable::new(8, age_limit))),
            flows: Arc::new(Mutex::new(FlowTable::new(8, config.flow_max_mem, age_limit))),
            hosts: Arc::new(Mutex::new(HostTable::new(8, config.host_max_mem, age_limit))),
        }
    }

    #[test]
    fn sweeper_expires_entries_without_pipeline_thread_involvement() {
        use crate::ip::IpAddress;
        use crate::packet::{tcp_flags, DecodedPacket, IPPROTO_TCP};

        let shared = tables(1);
        {
            let mut flows = shared.flows.lock().unwrap();
            let pkt = DecodedPacket {
                version: 4,
                srcaddr: IpAddress::V4([10, 0, 0, 1]),
                dstaddr: IpAddress::V4([10, 0, 0, 2]),
                srcport: 1,
                dstport: 2,
                protocol: IPPROTO_TCP,
                identification: 0,
                fragment_offset: 0,
                more_fragments: false,
                tcpflags: tcp_flags::SYN,
                seq: 0,
                ack: 0,
                win: 0,
                payload: Vec::new(),
            };
            flows.process_packet(&pkt, 0).unwrap();
        }
        assert_eq!(shared.flows.lock().unwrap().len(), 1);

        let now = Arc::new(Mutex::new(0u64));
        let now_for_thread = now.clone();
        let sweeper = BackgroundSweeper::spawn(shared.clone(), move || *now_for_thread.lock().unwrap());

        *now.lock().unwrap() = 10;
        // The sweeper's first wait_timeout runs out at t=1s (the flow's
        // deadline); give it time to wake on its own and re-sweep with
        // the updated clock before we shut it down.
        std::thread::sleep(Duration::from_millis(1100));
        sweeper.shutdown();

        assert!(shared.flows.lock().unwrap().is_empty());
    }
}
