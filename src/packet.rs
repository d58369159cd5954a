use std::net::Ipv4Addr;

use etherparse::{Ipv4HeaderSlice, SlicedPacket, TransportSlice};

/// A decrypted tunnel payload parsed far enough to route it: a raw IPv4
/// datagram and its destination address. Only IPv4 is carried inside the
/// tunnel; anything else fails to parse and is dropped by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
    dst: Ipv4Addr,
}

impl Packet {
    pub fn parse(bytes: Vec<u8>) -> Option<Self> {
        if bytes.first().map(|b| b >> 4) != Some(4) {
            return None;
        }
        let header = Ipv4HeaderSlice::from_slice(&bytes).ok()?;
        let dst = header.destination_addr();

        Some(Self { bytes, dst })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn dst(&self) -> Ipv4Addr {
        self.dst
    }

    /// Destination transport port, for tunneling a packet out to its
    /// real endpoint. Zero when the transport header is absent or not
    /// port-based.
    pub fn dst_port(&self) -> u16 {
        let Ok(sliced) = SlicedPacket::from_ip(&self.bytes) else {
            return 0;
        };
        match sliced.transport {
            Some(TransportSlice::Udp(udp)) => udp.destination_port(),
            Some(TransportSlice::Tcp(tcp)) => tcp.destination_port(),
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
