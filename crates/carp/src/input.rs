//! Transport-layer checks on received advertisements.
//!
//! Everything here runs before the engine looks at the CARP header: TTL,
//! lengths and the checksum. Failures are counted and the packet dropped.

use crate::packet::{Advertisement, CARP_HEADER_LEN, checksum_ok};
use crate::stats::CarpStats;
use crate::types::CARP_DFLTTL;
use std::net::Ipv4Addr;

const IPV4_MIN_HEADER: usize = 20;

/// Why a frame was dropped before reaching a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// TTL or hop limit is not 255
    BadTtl,
    /// IP header length invalid or payload shorter than a CARP header
    BadLength,
    /// Truncated before the IP header could be read
    HeaderDrop,
    BadChecksum,
}

impl Rejection {
    pub fn count(self, stats: &CarpStats) {
        match self {
            Rejection::BadTtl => stats.badttl.inc(),
            Rejection::BadLength => stats.badlen.inc(),
            Rejection::HeaderDrop => stats.hdrops.inc(),
            Rejection::BadChecksum => stats.badsum.inc(),
        };
    }
}

/// Fields of an IPv4 header the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Info {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    /// Header length in bytes, from the IHL field
    pub header_len: usize,
}

impl Ipv4Info {
    /// Read the fixed part of an IPv4 header
    pub fn peek(packet: &[u8]) -> Result<Self, Rejection> {
        if packet.len() < IPV4_MIN_HEADER {
            return Err(Rejection::HeaderDrop);
        }
        Ok(Self {
            src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
            ttl: packet[8],
            header_len: ((packet[0] & 0x0f) as usize) << 2,
        })
    }

    pub fn is_multicast(&self) -> bool {
        self.dst.is_multicast()
    }
}

/// Validate a full IPv4 datagram and decode its advertisement.
pub fn validate_v4(packet: &[u8], info: &Ipv4Info) -> Result<Advertisement, Rejection> {
    if info.ttl != CARP_DFLTTL {
        return Err(Rejection::BadTtl);
    }
    if info.header_len < IPV4_MIN_HEADER || info.header_len > packet.len() {
        return Err(Rejection::BadLength);
    }
    let end = info.header_len + CARP_HEADER_LEN;
    if end > packet.len() {
        return Err(Rejection::BadLength);
    }

    let carp = &packet[info.header_len..end];
    if !checksum_ok(carp) {
        return Err(Rejection::BadChecksum);
    }
    Advertisement::parse(carp).map_err(|_| Rejection::BadLength)
}

/// Validate the CARP payload of an IPv6 packet.
///
/// IPv6 raw sockets strip the fixed header, so the hop limit comes from
/// ancillary data.
pub fn validate_v6(hop_limit: u8, payload: &[u8]) -> Result<Advertisement, Rejection> {
    if hop_limit != CARP_DFLTTL {
        return Err(Rejection::BadTtl);
    }
    if payload.len() < CARP_HEADER_LEN {
        return Err(Rejection::BadLength);
    }

    let carp = &payload[..CARP_HEADER_LEN];
    if !checksum_ok(carp) {
        return Err(Rejection::BadChecksum);
    }
    Advertisement::parse(carp).map_err(|_| Rejection::BadLength)
}

/// Build an IPv4 datagram around an advertisement.
///
/// Used by simulations feeding one engine's output into another.
pub fn ipv4_datagram(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, advert: &Advertisement) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + CARP_HEADER_LEN;
    let mut packet = Vec::with_capacity(total);
    packet.push(0x45);
    packet.push(0);
    packet.extend_from_slice(&(total as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0x40, 0]);
    packet.push(ttl);
    packet.push(crate::types::IPPROTO_CARP);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());

    let checksum = crate::packet::internet_checksum(&packet);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());

    packet.extend_from_slice(&advert.encode());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CARP_GROUP_V4;

    fn datagram(ttl: u8) -> Vec<u8> {
        let advert = Advertisement::new(7, 1, 0, 0);
        ipv4_datagram(Ipv4Addr::new(192, 0, 2, 2), CARP_GROUP_V4, ttl, &advert)
    }

    #[test]
    fn test_valid_datagram() {
        let packet = datagram(255);
        let info = Ipv4Info::peek(&packet).unwrap();
        assert!(info.is_multicast());
        assert_eq!(info.header_len, 20);

        let advert = validate_v4(&packet, &info).unwrap();
        assert_eq!(advert.vhid, 7);
    }

    #[test]
    fn test_ttl_and_length() {
        let packet = datagram(64);
        let info = Ipv4Info::peek(&packet).unwrap();
        assert_eq!(validate_v4(&packet, &info), Err(Rejection::BadTtl));

        let packet = datagram(255);
        let info = Ipv4Info::peek(&packet).unwrap();
        assert_eq!(validate_v4(&packet[..40], &info), Err(Rejection::BadLength));

        assert_eq!(Ipv4Info::peek(&packet[..10]), Err(Rejection::HeaderDrop));

        let mut short_ihl = packet.clone();
        short_ihl[0] = 0x44;
        let info = Ipv4Info::peek(&short_ihl).unwrap();
        assert_eq!(validate_v4(&short_ihl, &info), Err(Rejection::BadLength));
    }

    #[test]
    fn test_checksum_covers_carp_header() {
        let mut packet = datagram(255);
        packet[20 + 5] ^= 0xff;
        let info = Ipv4Info::peek(&packet).unwrap();
        assert_eq!(validate_v4(&packet, &info), Err(Rejection::BadChecksum));
    }

    #[test]
    fn test_v6_payload() {
        let bytes = Advertisement::new(3, 1, 0, 0).encode();
        assert_eq!(validate_v6(255, &bytes).unwrap().vhid, 3);
        assert_eq!(validate_v6(1, &bytes), Err(Rejection::BadTtl));
        assert_eq!(validate_v6(255, &bytes[..20]), Err(Rejection::BadLength));
    }

    #[test]
    fn test_rejection_counters() {
        let stats = CarpStats::new();
        Rejection::BadTtl.count(&stats);
        Rejection::BadChecksum.count(&stats);
        Rejection::HeaderDrop.count(&stats);
        let snap = stats.snapshot();
        assert_eq!((snap.badttl, snap.badsum, snap.hdrops), (1, 1, 1));
    }
}
