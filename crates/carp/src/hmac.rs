//! SHA-1 HMAC authentication of advertisements.
//!
//! The inner hash is primed once per key or address change with the
//! protocol version and type, the real link-layer address (leader only,
//! when it differs from the virtual one), the vhid and every owned address
//! in ascending order. Two contexts are kept: one over all addresses and
//! one that leaves IPv6 link-local addresses out, so peers which cannot
//! see our scoped addresses still verify. Finalizing mixes in the 64-bit
//! replay counter.

use crate::packet::CARP_DIGEST_LEN;
use crate::types::{CARP_ADVERTISEMENT, CARP_KEY_LEN, CARP_VERSION, MacAddr};
use sha1::{Digest, Sha1};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HMAC_BLOCK: usize = 64;
const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5c;

/// Which precomputed context to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacContext {
    /// Every owned address
    Orig,
    /// IPv6 link-local addresses left out; used for sending
    NoV6LinkLocal,
}

impl HmacContext {
    pub const ALL: [HmacContext; 2] = [HmacContext::Orig, HmacContext::NoV6LinkLocal];

    fn index(self) -> usize {
        match self {
            HmacContext::Orig => 0,
            HmacContext::NoV6LinkLocal => 1,
        }
    }
}

/// Material the inner contexts are primed with
#[derive(Debug, Clone, Copy)]
pub struct AuthInput<'a> {
    pub key: &'a [u8; CARP_KEY_LEN],
    pub vhid: u8,
    /// Link-layer address to bind into the digest
    pub lladdr: Option<MacAddr>,
    pub addrs: &'a [IpAddr],
}

/// Precomputed HMAC state of one virtual host
#[derive(Clone)]
pub struct Authenticator {
    contexts: [Sha1; 2],
    opad: [u8; HMAC_BLOCK],
}

impl Authenticator {
    /// Prime both contexts.
    pub fn prepare(input: &AuthInput<'_>) -> Self {
        let mut pad = [0u8; HMAC_BLOCK];
        pad[..CARP_KEY_LEN].copy_from_slice(input.key);
        for b in pad.iter_mut() {
            *b ^= IPAD;
        }

        let mut v4: Vec<Ipv4Addr> = input
            .addrs
            .iter()
            .filter_map(|a| match a {
                IpAddr::V4(a) => Some(*a),
                IpAddr::V6(_) => None,
            })
            .collect();
        v4.sort_unstable();
        v4.dedup();

        let mut v6: Vec<Ipv6Addr> = input
            .addrs
            .iter()
            .filter_map(|a| match a {
                IpAddr::V6(a) => Some(*a),
                IpAddr::V4(_) => None,
            })
            .collect();
        v6.sort_unstable();
        v6.dedup();

        let mut seed = Sha1::new();
        seed.update(pad);
        seed.update([CARP_VERSION, CARP_ADVERTISEMENT]);

        let contexts = HmacContext::ALL.map(|ctx| {
            let mut sha = seed.clone();
            if let Some(lladdr) = input.lladdr {
                sha.update(lladdr);
            }
            sha.update([input.vhid]);
            for addr in &v4 {
                sha.update(addr.octets());
            }
            for addr in &v6 {
                if ctx == HmacContext::NoV6LinkLocal && is_link_local(addr) {
                    continue;
                }
                sha.update(addr.octets());
            }
            sha
        });

        for b in pad.iter_mut() {
            *b ^= IPAD ^ OPAD;
        }

        Self { contexts, opad: pad }
    }

    /// Compute the digest for a replay counter
    pub fn generate(&self, ctx: HmacContext, counter: u64) -> [u8; CARP_DIGEST_LEN] {
        let mut inner = self.contexts[ctx.index()].clone();
        inner.update(counter.to_be_bytes());
        let md = inner.finalize();

        let mut outer = Sha1::new();
        outer.update(self.opad);
        outer.update(md);

        let mut out = [0u8; CARP_DIGEST_LEN];
        out.copy_from_slice(&outer.finalize());
        out
    }

    /// Accept the digest if either context reproduces it
    pub fn verify(&self, counter: u64, digest: &[u8; CARP_DIGEST_LEN]) -> bool {
        HmacContext::ALL
            .iter()
            .any(|ctx| timingsafe_eq(&self.generate(*ctx, counter), digest))
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        let key = [0u8; CARP_KEY_LEN];
        Self::prepare(&AuthInput {
            key: &key,
            vhid: 0,
            lladdr: None,
            addrs: &[],
        })
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Compare without an early exit.
fn timingsafe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    std::hint::black_box(diff) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> [u8; CARP_KEY_LEN] {
        let mut k = [0u8; CARP_KEY_LEN];
        k[..s.len()].copy_from_slice(s.as_bytes());
        k
    }

    fn prepare(k: &[u8; CARP_KEY_LEN], vhid: u8, addrs: &[IpAddr]) -> Authenticator {
        Authenticator::prepare(&AuthInput {
            key: k,
            vhid,
            lladdr: None,
            addrs,
        })
    }

    #[test]
    fn test_generate_verify() {
        let k = key("secret");
        let addrs: Vec<IpAddr> = vec!["192.0.2.1".parse().unwrap()];
        let auth = prepare(&k, 5, &addrs);

        let digest = auth.generate(HmacContext::NoV6LinkLocal, 42);
        assert!(auth.verify(42, &digest));
        assert!(!auth.verify(43, &digest));
    }

    #[test]
    fn test_address_order_is_canonical() {
        let k = key("k");
        let a: Vec<IpAddr> = vec![
            "192.0.2.9".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
        ];
        let b: Vec<IpAddr> = vec![
            "2001:db8::1".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
            "192.0.2.9".parse().unwrap(),
        ];

        let da = prepare(&k, 7, &a).generate(HmacContext::Orig, 1);
        let db = prepare(&k, 7, &b).generate(HmacContext::Orig, 1);
        assert_eq!(da, db);
    }

    #[test]
    fn test_link_local_only_in_orig_context() {
        let k = key("k");
        let with_ll: Vec<IpAddr> = vec!["fe80::1".parse().unwrap(), "2001:db8::1".parse().unwrap()];
        let without_ll: Vec<IpAddr> = vec!["2001:db8::1".parse().unwrap()];

        let peer = prepare(&k, 3, &with_ll);
        let local = prepare(&k, 3, &without_ll);

        // a peer that cannot see our link-local address still verifies
        let digest = peer.generate(HmacContext::NoV6LinkLocal, 9);
        assert!(local.verify(9, &digest));

        assert_ne!(
            peer.generate(HmacContext::Orig, 9),
            local.generate(HmacContext::Orig, 9)
        );
    }

    #[test]
    fn test_key_vhid_and_lladdr_are_bound() {
        let addrs: Vec<IpAddr> = vec!["192.0.2.1".parse().unwrap()];
        let base = prepare(&key("one"), 1, &addrs).generate(HmacContext::Orig, 5);

        assert_ne!(base, prepare(&key("two"), 1, &addrs).generate(HmacContext::Orig, 5));
        assert_ne!(base, prepare(&key("one"), 2, &addrs).generate(HmacContext::Orig, 5));

        let k = key("one");
        let bound = Authenticator::prepare(&AuthInput {
            key: &k,
            vhid: 1,
            lladdr: Some([0, 1, 2, 3, 4, 5]),
            addrs: &addrs,
        });
        assert_ne!(base, bound.generate(HmacContext::Orig, 5));
    }

    #[test]
    fn test_timingsafe_eq() {
        assert!(timingsafe_eq(b"abc", b"abc"));
        assert!(!timingsafe_eq(b"abc", b"abd"));
        assert!(!timingsafe_eq(b"abc", b"ab"));
    }
}
