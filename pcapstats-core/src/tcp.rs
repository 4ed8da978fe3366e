//! TCP session tracker.
//!
//! `FIN_WAIT_1`'s ACK handling is an ordinary match over the next state
//! rather than an implicit successor-state increment, so it doesn't
//! depend on enum declaration order. `SYN_RCVD` is intentionally a
//! no-op transition target: the SYN+ACK response is implied by the
//! CLOSED→SYN_RCVD transition already recording `isn`/`una`/`nxt`.
//!
//! Sessions carry an aging backstop reusing the flow age limit, on top
//! of destruction on both-CLOSED convergence, so a half-open session
//! can't grow the session table without bound. There is no memcap
//! accounting for sessions.

use crate::aging::AgingQueue;
use crate::endpoint::{CanonicalEndpoints, Direction};
use crate::hash_table::Table;
use crate::packet::{tcp_flags, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
}

/// One endpoint's view of a TCP session.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub state: State,
    pub isn: u32,
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self { state: State::Closed, isn: 0, una: 0, nxt: 0, wnd: 0 }
    }
}

/// One observed segment, as presented to `process`.
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub win: u16,
    pub flags: u8,
    /// Payload length plus one for SYN and one for FIN.
    pub len: u32,
}

impl Segment {
    pub fn from_packet(pkt: &impl Packet) -> Self {
        let mut len = pkt.paysize() as u32;
        if pkt.tcpflags() & tcp_flags::SYN != 0 {
            len += 1;
        }
        if pkt.tcpflags() & tcp_flags::FIN != 0 {
            len += 1;
        }
        Self { seq: pkt.seq(), ack: pkt.ack(), win: pkt.win(), flags: pkt.tcpflags(), len }
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}
fn seq_eq(a: u32, b: u32) -> bool {
    a == b
}
fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}
fn seq_between(x: u32, lo: u32, hi: u32) -> bool {
    seq_geq(x, lo) && seq_leq(x, hi)
}

/// `snd` is the endpoint that sent `seg`; `rcv` is the endpoint that
/// received it.
pub fn process(snd: &mut Endpoint, rcv: &mut Endpoint, seg: &Segment) -> Outcome {
    if seg.flags & tcp_flags::RST != 0 {
        let acceptable = if rcv.state == State::SynSent {
            seg.ack == rcv.una.wrapping_add(1)
        } else {
            seq_between(seg.seq, rcv.una.wrapping_add(1), rcv.una.wrapping_add(rcv.wnd as u32).wrapping_add(1))
        };
        if acceptable {
            rcv.state = State::Closed;
            snd.state = State::Closed;
            return Outcome::Accepted;
        }
        return Outcome::Rejected;
    }

    match rcv.state {
        State::Closed => {
            if seg.flags & tcp_flags::ACK != 0 {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::SYN == 0 {
                return Outcome::Rejected;
            }
            snd.isn = seg.seq;
            snd.una = seg.seq;
            snd.nxt = seg.seq.wrapping_add(seg.len);
            snd.state = State::SynSent;

            rcv.wnd = seg.win;
            rcv.state = State::SynRcvd;
            Outcome::Accepted
        }

        State::SynSent => {
            if seg.flags & tcp_flags::ACK != 0 {
                if !seq_between(seg.ack, rcv.una, rcv.nxt) {
                    return Outcome::Rejected;
                }
                if seg.flags & tcp_flags::SYN != 0 {
                    if snd.state == State::Established {
                        return Outcome::Rejected;
                    }
                    snd.isn = seg.seq;
                    snd.una = seg.seq;
                    snd.state = State::SynSent;
                }
                snd.nxt = seg.seq.wrapping_add(seg.len);
                rcv.una = seg.ack;
                rcv.wnd = seg.win;
                rcv.state = State::Established;
                Outcome::Accepted
            } else if seg.flags & tcp_flags::SYN != 0 {
                snd.isn = seg.seq;
                snd.una = seg.seq;
                snd.nxt = seg.seq.wrapping_add(seg.len);
                snd.state = State::SynSent;

                rcv.wnd = seg.win;
                rcv.state = State::SynRcvd;
                Outcome::Accepted
            } else {
                Outcome::Rejected
            }
        }

        // Inert by design; see module doc comment.
        State::SynRcvd => Outcome::Rejected,

        State::Established => {
            let window_hi = snd.una.wrapping_add(snd.wnd as u32).wrapping_add(1);
            if !seq_between(seg.seq, snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if !seq_between(seg.seq.wrapping_add(seg.len), snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::SYN != 0 {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::ACK != 0 {
                if !seq_between(seg.ack, rcv.una, rcv.nxt) {
                    return Outcome::Rejected;
                }
                rcv.una = seg.ack;
                rcv.wnd = seg.win;
            }
            if seg.flags & tcp_flags::FIN != 0 {
                rcv.state = State::CloseWait;
                snd.state = State::FinWait1;
            }
            snd.una = seg.seq;
            snd.nxt = seg.seq.wrapping_add(seg.len);
            Outcome::Accepted
        }

        State::FinWait1 => {
            let window_hi = snd.una.wrapping_add(snd.wnd as u32).wrapping_add(1);
            if !seq_between(seg.seq, snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if !seq_between(seg.seq.wrapping_add(seg.len), snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::SYN != 0 {
                return Outcome::Rejected;
            }

            let fin_seen = seg.flags & tcp_flags::FIN != 0;
            let mut next_rcv_state = rcv.state;
            if fin_seen {
                next_rcv_state = State::Closing;
                snd.state = State::LastAck;
            }
            if seg.flags & tcp_flags::ACK != 0 {
                if !seq_eq(seg.ack, rcv.nxt) {
                    return Outcome::Rejected;
                }
                next_rcv_state = if fin_seen { State::TimeWait } else { State::FinWait2 };
                rcv.una = seg.ack;
                rcv.wnd = seg.win;
            }
            rcv.state = next_rcv_state;

            snd.una = seg.seq;
            snd.nxt = seg.seq.wrapping_add(seg.len);
            Outcome::Accepted
        }

        State::FinWait2 => {
            let window_hi = snd.una.wrapping_add(snd.wnd as u32).wrapping_add(1);
            if !seq_between(seg.seq, snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if !seq_between(seg.seq.wrapping_add(seg.len), snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::ACK != 0 && !seq_eq(seg.ack, rcv.nxt) {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::SYN != 0 {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::FIN != 0 {
                rcv.state = State::TimeWait;
                snd.state = State::LastAck;
            }
            snd.una = seg.seq;
            snd.nxt = seg.seq.wrapping_add(seg.len);
            rcv.una = seg.ack;
            rcv.wnd = seg.win;
            Outcome::Accepted
        }

        State::TimeWait => Outcome::Rejected,

        State::Closing => {
            let window_hi = snd.una.wrapping_add(snd.wnd as u32).wrapping_add(1);
            if !seq_between(seg.seq, snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if !seq_between(seg.seq.wrapping_add(seg.len), snd.una, window_hi) {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::SYN != 0 {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::ACK != 0 && !seq_eq(seg.ack, rcv.nxt) {
                return Outcome::Rejected;
            }
            snd.una = seg.seq;
            snd.nxt = seg.seq.wrapping_add(seg.len);
            rcv.state = State::TimeWait;
            Outcome::Accepted
        }

        State::CloseWait => {
            if !seq_eq(seg.seq, snd.nxt) {
                return Outcome::Rejected;
            }
            if seg.len != 0 {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::ACK == 0 || !seq_between(seg.ack, rcv.una, rcv.nxt) {
                return Outcome::Rejected;
            }
            rcv.una = seg.ack;
            rcv.wnd = seg.win;
            Outcome::Accepted
        }

        State::LastAck => {
            if !seq_eq(seg.seq, snd.nxt) {
                return Outcome::Rejected;
            }
            if seg.flags & tcp_flags::ACK != 0 && !seq_eq(seg.ack, rcv.nxt) {
                return Outcome::Rejected;
            }
            rcv.state = State::Closed;
            snd.state = State::Closed;
            Outcome::Accepted
        }
    }
}

/// A tracked session: two endpoints aligned to the canonical "a"/"b"
/// slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct Session {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl Session {
    fn both_closed(&self) -> bool {
        self.a.state == State::Closed && self.b.state == State::Closed
    }
}

/// Table of in-progress TCP sessions, keyed by the same canonical tuple
/// the flow table uses.
pub struct SessionTable {
    table: Table<Session>,
    queue: AgingQueue<Vec<u8>>,
}

impl SessionTable {
    pub fn new(buckets: usize, age_limit: u64) -> Self {
        Self { table: Table::with_buckets(buckets), queue: AgingQueue::new(age_limit) }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Feed one TCP packet through the session tracker, creating a
    /// session on first contact. Returns the processing outcome, or
    /// `None` if the packet isn't TCP.
    pub fn process_packet(&mut self, pkt: &impl Packet, now: u64) -> Option<Outcome> {
        if pkt.protocol() != crate::packet::IPPROTO_TCP {
            return None;
        }
        let (endpoints, direction) = CanonicalEndpoints::from_packet(pkt);
        let key = endpoints.to_bytes();

        if self.table.get(&key).is_none() {
            self.table.insert(key.clone(), Session::default()).ok();
            self.queue.insert(key.clone(), now);
        } else {
            self.queue.bump(&key, now);
        }

        let session = self.table.get_mut(&key).expect("present by construction");
        let seg = Segment::from_packet(pkt);
        let outcome = match direction {
            Direction::FromA => process(&mut session.a, &mut session.b, &seg),
            Direction::FromB => process(&mut session.b, &mut session.a, &seg),
        };

        if session.both_closed() {
            self.table.remove(&key);
            self.queue.delete(&key);
        }

        Some(outcome)
    }

    pub fn sweep_expired(&mut self, now: u64) {
        let table = &mut self.table;
        self.queue.sweep(now, |key| {
            table.remove(key);
        });
    }

    /// Deadline of the session a sweep would expire next, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.next_deadline()
    }

    /// Drains every in-progress session and destroys the table. Sessions
    /// carry no memcap accounting, so there is nothing to fail on.
    pub fn destroy(mut self) {
        let keys: Vec<Vec<u8>> = self.table.iter().map(|(k, _)| k.to_vec()).collect();
        for key in &keys {
            self.table.remove(key);
            self.queue.delete(key);
        }
        self.table.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (Endpoint, Endpoint) {
        let mut client = Endpoint::default();
        let mut server = Endpoint::default();
        // Client SYN
        let syn = Segment { seq: 100, ack: 0, win: 4096, flags: tcp_flags::SYN, len: 1 };
        assert_eq!(process(&mut client, &mut server, &syn), Outcome::Accepted);
        assert_eq!(client.state, State::SynSent);
        assert_eq!(server.state, State::SynRcvd);

        // Server SYN+ACK
        let synack = Segment { seq: 500, ack: 101, win: 8192, flags: tcp_flags::SYN | tcp_flags::ACK, len: 1 };
        assert_eq!(process(&mut server, &mut client, &synack), Outcome::Accepted);
        assert_eq!(server.state, State::SynSent);
        assert_eq!(client.state, State::Established);

        // Client ACK
        let ack = Segment { seq: 101, ack: 501, win: 4096, flags: tcp_flags::ACK, len: 0 };
        assert_eq!(process(&mut client, &mut server, &ack), Outcome::Accepted);
        assert_eq!(server.state, State::Established);

        (client, server)
    }

    #[test]
    fn two_way_handshake_reaches_established() {
        let (client, server) = established_pair();
        assert_eq!(client.state, State::Established);
        assert_eq!(server.state, State::Established);
    }

    #[test]
    fn graceful_close_converges_to_closed() {
        let (mut client, mut server) = established_pair();

        let fin = Segment { seq: 101, ack: 501, win: 4096, flags: tcp_flags::FIN | tcp_flags::ACK, len: 1 };
        assert_eq!(process(&mut client, &mut server, &fin), Outcome::Accepted);
        assert_eq!(client.state, State::FinWait1);
        assert_eq!(server.state, State::CloseWait);

        let ack = Segment { seq: 501, ack: 102, win: 8192, flags: tcp_flags::ACK, len: 0 };
        assert_eq!(process(&mut server, &mut client, &ack), Outcome::Accepted);
        assert_eq!(client.state, State::FinWait2);

        let server_fin = Segment { seq: 501, ack: 102, win: 8192, flags: tcp_flags::FIN | tcp_flags::ACK, len: 1 };
        assert_eq!(process(&mut server, &mut client, &server_fin), Outcome::Accepted);
        assert_eq!(client.state, State::TimeWait);
        assert_eq!(server.state, State::LastAck);

        let last_ack = Segment { seq: 102, ack: 502, win: 4096, flags: tcp_flags::ACK, len: 0 };
        assert_eq!(process(&mut client, &mut server, &last_ack), Outcome::Accepted);
        assert_eq!(server.state, State::Closed);
        assert_eq!(client.state, State::Closed);
    }

    #[test]
    fn rst_in_window_tears_down_session() {
        let (mut client, mut server) = established_pair();
        let rst = Segment { seq: 101, ack: 501, win: 4096, flags: tcp_flags::RST, len: 0 };
        assert_eq!(process(&mut client, &mut server, &rst), Outcome::Accepted);
        assert_eq!(client.state, State::Closed);
        assert_eq!(server.state, State::Closed);
    }

    #[test]
    fn rst_out_of_window_is_rejected_p6() {
        let (mut client, mut server) = established_pair();
        let rst = Segment { seq: 999_999, ack: 501, win: 4096, flags: tcp_flags::RST, len: 0 };
        assert_eq!(process(&mut client, &mut server, &rst), Outcome::Rejected);
        assert_eq!(client.state, State::Established);
        assert_eq!(server.state, State::Established);
    }

    #[test]
    fn syn_inside_established_window_is_rejected() {
        let (mut client, mut server) = established_pair();
        let syn = Segment { seq: 101, ack: 501, win: 4096, flags: tcp_flags::SYN | tcp_flags::ACK, len: 1 };
        assert_eq!(process(&mut client, &mut server, &syn), Outcome::Rejected);
        assert_eq!(client.state, State::Established);
    }

    #[test]
    fn session_table_destroys_session_on_mutual_close() {
        let mut table = SessionTable::new(8, 300);
        let src = crate::ip::IpAddress::V4([10, 0, 0, 1]);
        let dst = crate::ip::IpAddress::V4([10, 0, 0, 2]);

        let mk = |srcaddr, srcport, dstaddr, dstport, seq, ack, flags, win| crate::packet::DecodedPacket {
            version: 4,
            srcaddr,
            dstaddr,
            srcport,
            dstport,
            protocol: crate::packet::IPPROTO_TCP,
            identification: 0,
            fragment_offset: 0,
            more_fragments: false,
            tcpflags: flags,
            seq,
            ack,
            win,
            payload: Vec::new(),
        };

        table.process_packet(&mk(src, 1111, dst, 80, 100, 0, tcp_flags::SYN, 4096), 0);
        assert_eq!(table.len(), 1);
        table.process_packet(&mk(dst, 80, src, 1111, 500, 101, tcp_flags::SYN | tcp_flags::ACK, 8192), 0);
        table.process_packet(&mk(src, 1111, dst, 80, 101, 501, tcp_flags::ACK, 4096), 0);

        table.process_packet(&mk(src, 1111, dst, 80, 101, 501, tcp_flags::FIN | tcp_flags::ACK, 4096), 0);
        table.process_packet(&mk(dst, 80, src, 1111, 501, 102, tcp_flags::ACK, 8192), 0);
        table.process_packet(&mk(dst, 80, src, 1111, 501, 102, tcp_flags::FIN | tcp_flags::ACK, 8192), 0);
        table.process_packet(&mk(src, 1111, dst, 80, 102, 502, tcp_flags::ACK, 4096), 0);

        assert!(table.is_empty());
    }
}
