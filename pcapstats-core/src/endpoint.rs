//! Canonical endpoint-tuple keying shared by the flow table and the TCP
//! session table: the endpoint with the numerically greater address
//! occupies the "a" slot, with port as a tiebreak.

use crate::ip::{ip_compare, IpAddress};
use crate::packet::Packet;
use std::cmp::Ordering;

/// Which canonical slot sent the packet this tuple was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    FromA,
    FromB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalEndpoints {
    pub version: u8,
    pub protocol: u8,
    pub addr_a: IpAddress,
    pub port_a: u16,
    pub addr_b: IpAddress,
    pub port_b: u16,
}

impl CanonicalEndpoints {
    /// Derive the canonical tuple and the direction bit for `pkt`.
    /// Ties in address (same host, different ports) break on port number
    /// so the ordering is still total.
    pub fn from_packet(pkt: &impl Packet) -> (Self, Direction) {
        let (src_addr, src_port) = (pkt.srcaddr(), pkt.srcport());
        let (dst_addr, dst_port) = (pkt.dstaddr(), pkt.dstport());

        let src_is_a = match ip_compare(&src_addr, &dst_addr) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => src_port >= dst_port,
        };

        let (endpoints, direction) = if src_is_a {
            (
                Self {
                    version: pkt.version(),
                    protocol: pkt.protocol(),
                    addr_a: src_addr,
                    port_a: src_port,
                    addr_b: dst_addr,
                    port_b: dst_port,
                },
                Direction::FromA,
            )
        } else {
            (
                Self {
                    version: pkt.version(),
                    protocol: pkt.protocol(),
                    addr_a: dst_addr,
                    port_a: dst_port,
                    addr_b: src_addr,
                    port_b: src_port,
                },
                Direction::FromB,
            )
        };
        (endpoints, direction)
    }

    /// Canonical byte-wise key for `Table`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 1 + 2 * (1 + 16 + 2));
        buf.push(self.version);
        buf.push(self.protocol);
        buf.push(self.addr_a.version());
        buf.extend_from_slice(self.addr_a.octets());
        buf.extend_from_slice(&self.port_a.to_be_bytes());
        buf.push(self.addr_b.version());
        buf.extend_from_slice(self.addr_b.octets());
        buf.extend_from_slice(&self.port_b.to_be_bytes());
        buf
    }
}
