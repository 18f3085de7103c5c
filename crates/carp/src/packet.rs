//! CARP advertisement format and parsing.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  |     VHID      |    AdvSkew    |    AuthLen    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Demote     |    AdvBase    |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (1)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (2)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        SHA-1 HMAC (1)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             ...                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        SHA-1 HMAC (5)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum covers the CARP header only, there is no pseudo-header.

use crate::types::{CARP_ADVERTISEMENT, CARP_AUTHLEN, CARP_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the advertisement on the wire
pub const CARP_HEADER_LEN: usize = 36;

/// Size of the SHA-1 HMAC digest
pub const CARP_DIGEST_LEN: usize = 20;

/// Offset of the checksum field
const CHECKSUM_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("advertisement too short: {0} bytes")]
    TooShort(usize),
}

/// A decoded CARP advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    /// Protocol version (high nibble of the first byte)
    pub version: u8,

    /// Message type (low nibble of the first byte)
    pub kind: u8,

    pub vhid: u8,

    pub advskew: u8,

    /// Authentication length in 32-bit words
    pub authlen: u8,

    /// Sender's demotion count, clamped to a byte
    pub demote: u8,

    /// Base interval in seconds
    pub advbase: u8,

    pub checksum: u16,

    /// Replay counter
    pub counter: u64,

    /// SHA-1 HMAC over the counter
    pub digest: [u8; CARP_DIGEST_LEN],
}

impl Advertisement {
    /// Create an unauthenticated advertisement (counter and digest zero)
    pub fn new(vhid: u8, advbase: u8, advskew: u8, demote: u8) -> Self {
        Self {
            version: CARP_VERSION,
            kind: CARP_ADVERTISEMENT,
            vhid,
            advskew,
            authlen: CARP_AUTHLEN,
            demote,
            advbase,
            checksum: 0,
            counter: 0,
            digest: [0; CARP_DIGEST_LEN],
        }
    }

    /// Parse an advertisement from the CARP payload.
    ///
    /// Version and type are not checked here, the engine counts those.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < CARP_HEADER_LEN {
            return Err(PacketError::TooShort(data.len()));
        }

        let mut counter = [0u8; 8];
        counter.copy_from_slice(&data[8..16]);
        let mut digest = [0u8; CARP_DIGEST_LEN];
        digest.copy_from_slice(&data[16..CARP_HEADER_LEN]);

        Ok(Self {
            version: data[0] >> 4,
            kind: data[0] & 0x0F,
            vhid: data[1],
            advskew: data[2],
            authlen: data[3],
            demote: data[4],
            advbase: data[5],
            checksum: u16::from_be_bytes([data[6], data[7]]),
            counter: u64::from_be_bytes(counter),
            digest,
        })
    }

    /// Serialize with the checksum field as stored
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CARP_HEADER_LEN);

        buf.put_u8((self.version << 4) | (self.kind & 0x0F));
        buf.put_u8(self.vhid);
        buf.put_u8(self.advskew);
        buf.put_u8(self.authlen);
        buf.put_u8(self.demote);
        buf.put_u8(self.advbase);
        buf.put_u16(self.checksum);
        buf.put_u64(self.counter);
        buf.put_slice(&self.digest);

        buf.freeze()
    }

    /// Serialize with a freshly computed checksum
    pub fn encode(&self) -> Bytes {
        let mut pkt = *self;
        pkt.set_checksum();
        pkt.to_bytes()
    }

    /// Checksum over the header with the checksum field zeroed
    pub fn calculate_checksum(&self) -> u16 {
        let mut pkt = *self;
        pkt.checksum = 0;
        internet_checksum(&pkt.to_bytes())
    }

    pub fn set_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.calculate_checksum() == self.checksum
    }
}

/// Returns true when the checksum of `data` (stored checksum included) is valid.
pub fn checksum_ok(data: &[u8]) -> bool {
    data.len() > CHECKSUM_OFFSET + 1 && internet_checksum(data) == 0
}

/// RFC 1071 internet checksum
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_serialize_parse() {
        let mut adv = Advertisement::new(5, 1, 100, 3);
        adv.counter = 0x0102_0304_0506_0708;
        adv.digest = [0xAB; CARP_DIGEST_LEN];

        let bytes = adv.encode();
        assert_eq!(bytes.len(), CARP_HEADER_LEN);
        assert_eq!(bytes[0], 0x21);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let parsed = Advertisement::parse(&bytes).unwrap();
        assert_eq!(parsed.vhid, 5);
        assert_eq!(parsed.advbase, 1);
        assert_eq!(parsed.advskew, 100);
        assert_eq!(parsed.demote, 3);
        assert_eq!(parsed.authlen, CARP_AUTHLEN);
        assert_eq!(parsed.counter, adv.counter);
        assert!(parsed.verify_checksum());
        assert!(checksum_ok(&bytes));
    }

    #[test]
    fn test_corrupted_checksum_detected() {
        let adv = Advertisement::new(9, 1, 0, 0);
        let mut bytes = adv.encode().to_vec();
        bytes[2] ^= 0x40;

        assert!(!checksum_ok(&bytes));
        let parsed = Advertisement::parse(&bytes).unwrap();
        assert!(!parsed.verify_checksum());
    }

    #[test]
    fn test_short_payload_rejected() {
        let err = Advertisement::parse(&[0x21; 20]).unwrap_err();
        assert_eq!(err, PacketError::TooShort(20));
    }

    #[test]
    fn test_internet_checksum_odd_length() {
        // 0x0102 + 0x0300 = 0x0402, complemented
        assert_eq!(internet_checksum(&[1, 2, 3]), !0x0402);
    }
}
