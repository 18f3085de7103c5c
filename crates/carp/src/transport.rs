//! Boundary between the engine and whatever puts packets on the wire.

use crate::error::TransportError;
use crate::packet::Advertisement;
use crate::types::{Balancing, Family, MacAddr};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Where an advertisement leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Egress {
    pub family: Family,
    /// Index of the parent (physical) interface
    pub carpdev: u32,
    /// Index of the coordinator interface
    pub ifindex: u32,
    /// IPv4 destination, the multicast group unless a unicast peer is set
    pub peer: Ipv4Addr,
    /// Source link-layer address of the coordinator
    pub lladdr: MacAddr,
    pub balancing: Balancing,
}

/// Transport adapter.
///
/// Implementations frame, checksum and transmit. Sends are best effort and
/// never block; failures feed the send error hysteresis.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    fn send_advertisement(&mut self, egress: &Egress, advert: &Advertisement) -> Result<(), TransportError>;

    /// Broadcast a gratuitous ARP for `addr` from `lladdr` on the parent link.
    fn send_gratuitous_arp(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv4Addr);

    /// Multicast an unsolicited neighbour advertisement for `addr`.
    fn send_neighbor_advert(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv6Addr, router: bool);
}

/// A frame captured by [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Advertisement(Egress, Advertisement),
    GratuitousArp(u32, MacAddr, Ipv4Addr),
    NeighborAdvert(u32, MacAddr, Ipv6Addr, bool),
}

/// Transport that keeps everything it is asked to send.
///
/// Used by simulations wiring several engines together.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Vec<Sent>,
    fail_with: Option<fn() -> TransportError>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every advertisement send fail with the given error
    pub fn fail_with(&mut self, err: Option<fn() -> TransportError>) {
        self.fail_with = err;
    }

    pub fn sent(&self) -> &[Sent] {
        &self.sent
    }

    pub fn take(&mut self) -> Vec<Sent> {
        std::mem::take(&mut self.sent)
    }

    pub fn advertisements(&self) -> impl Iterator<Item = &Advertisement> {
        self.sent.iter().filter_map(|s| match s {
            Sent::Advertisement(_, adv) => Some(adv),
            _ => None,
        })
    }
}

impl Transport for RecordingTransport {
    fn send_advertisement(&mut self, egress: &Egress, advert: &Advertisement) -> Result<(), TransportError> {
        if let Some(err) = self.fail_with {
            return Err(err());
        }
        let mut adv = *advert;
        adv.set_checksum();
        self.sent.push(Sent::Advertisement(*egress, adv));
        Ok(())
    }

    fn send_gratuitous_arp(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv4Addr) {
        self.sent.push(Sent::GratuitousArp(carpdev, lladdr, addr));
    }

    fn send_neighbor_advert(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv6Addr, router: bool) {
        self.sent.push(Sent::NeighborAdvert(carpdev, lladdr, addr, router));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn egress() -> Egress {
        Egress {
            family: Family::V4,
            carpdev: 2,
            ifindex: 10,
            peer: crate::types::CARP_GROUP_V4,
            lladdr: [0, 0, 0x5e, 0, 1, 1],
            balancing: Balancing::None,
        }
    }

    #[test]
    fn test_recording_transport_checksums_and_records() {
        let mut transport = RecordingTransport::new();
        let adv = Advertisement::new(1, 1, 0, 0);

        transport.send_advertisement(&egress(), &adv).unwrap();
        transport.send_gratuitous_arp(2, [0, 0, 0x5e, 0, 1, 1], "192.0.2.1".parse().unwrap());

        assert_eq!(transport.sent().len(), 2);
        let sent = transport.advertisements().next().unwrap();
        assert!(sent.verify_checksum());

        assert_eq!(transport.take().len(), 2);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_recording_transport_failure_injection() {
        let mut transport = RecordingTransport::new();
        transport.fail_with(Some(|| TransportError::NoBuffers));

        let err = transport
            .send_advertisement(&egress(), &Advertisement::new(1, 1, 0, 0))
            .unwrap_err();
        assert!(matches!(err, TransportError::NoBuffers));
        assert!(transport.sent().is_empty());
    }
}
