//! Protocol counters.

use crate::types::VhostState;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for state transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    /// From state
    pub from: String,
    /// To state
    pub to: String,
}

/// Engine-wide CARP counters.
///
/// Cloning shares the underlying counters.
#[derive(Clone, Default)]
pub struct CarpStats {
    /// IPv4 advertisements received
    pub ipackets: Counter,
    /// IPv6 advertisements received
    pub ipackets6: Counter,
    /// Received on an interface that cannot carry CARP
    pub badif: Counter,
    /// TTL or hop limit other than 255
    pub badttl: Counter,
    /// IP header or payload shorter than a CARP header
    pub hdrops: Counter,
    pub badsum: Counter,
    pub badver: Counter,
    /// Length mismatch
    pub badlen: Counter,
    /// HMAC mismatch
    pub badauth: Counter,
    /// No matching virtual host, or host not running
    pub badvhid: Counter,
    /// Looped or duplicated replay counter
    pub replays: Counter,
    pub opackets: Counter,
    pub opackets6: Counter,
    /// Send failed for lack of buffers
    pub onomem: Counter,
    /// Backup to master promotions
    pub preempt: Counter,
    pub transitions: Family<TransitionLabels, Counter>,
}

/// Plain copy of the counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ipackets: u64,
    pub ipackets6: u64,
    pub badif: u64,
    pub badttl: u64,
    pub hdrops: u64,
    pub badsum: u64,
    pub badver: u64,
    pub badlen: u64,
    pub badauth: u64,
    pub badvhid: u64,
    pub replays: u64,
    pub opackets: u64,
    pub opackets6: u64,
    pub onomem: u64,
    pub preempt: u64,
}

impl CarpStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every counter under the `carp_` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let sub = registry.sub_registry_with_prefix("carp");

        sub.register("ipackets", "IPv4 advertisements received", self.ipackets.clone());
        sub.register("ipackets6", "IPv6 advertisements received", self.ipackets6.clone());
        sub.register("badif", "Advertisements received on an ineligible interface", self.badif.clone());
        sub.register("badttl", "Advertisements with a TTL other than 255", self.badttl.clone());
        sub.register("hdrops", "Advertisements shorter than the header", self.hdrops.clone());
        sub.register("badsum", "Advertisements with a bad checksum", self.badsum.clone());
        sub.register("badver", "Advertisements with a bad version", self.badver.clone());
        sub.register("badlen", "Advertisements with a bad length", self.badlen.clone());
        sub.register("badauth", "Advertisements failing authentication", self.badauth.clone());
        sub.register("badvhid", "Advertisements for an unknown vhid", self.badvhid.clone());
        sub.register("replays", "Looped or duplicated advertisements", self.replays.clone());
        sub.register("opackets", "IPv4 advertisements sent", self.opackets.clone());
        sub.register("opackets6", "IPv6 advertisements sent", self.opackets6.clone());
        sub.register("onomem", "Sends failed for lack of buffers", self.onomem.clone());
        sub.register("preempt", "Backup to master transitions", self.preempt.clone());
        sub.register("transitions", "Virtual host state transitions", self.transitions.clone());
    }

    pub(crate) fn record_transition(&self, from: VhostState, to: VhostState) {
        self.transitions
            .get_or_create(&TransitionLabels {
                from: from.to_string(),
                to: to.to_string(),
            })
            .inc();
    }

    /// Number of recorded transitions between two states
    pub fn transitions_between(&self, from: VhostState, to: VhostState) -> u64 {
        self.transitions
            .get_or_create(&TransitionLabels {
                from: from.to_string(),
                to: to.to_string(),
            })
            .get()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ipackets: self.ipackets.get(),
            ipackets6: self.ipackets6.get(),
            badif: self.badif.get(),
            badttl: self.badttl.get(),
            hdrops: self.hdrops.get(),
            badsum: self.badsum.get(),
            badver: self.badver.get(),
            badlen: self.badlen.get(),
            badauth: self.badauth.get(),
            badvhid: self.badvhid.get(),
            replays: self.replays.get(),
            opackets: self.opackets.get(),
            opackets6: self.opackets6.get(),
            onomem: self.onomem.get(),
            preempt: self.preempt.get(),
        }
    }
}

impl std::fmt::Debug for CarpStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_clones_share_counters() {
        let stats = CarpStats::new();
        let other = stats.clone();
        other.badauth.inc();
        other.opackets.inc_by(3);

        let snap = stats.snapshot();
        assert_eq!(snap.badauth, 1);
        assert_eq!(snap.opackets, 3);
        assert_eq!(snap.ipackets, 0);
    }

    #[test]
    fn test_register_and_encode() {
        let stats = CarpStats::new();
        let mut registry = Registry::default();
        stats.register(&mut registry);

        stats.replays.inc();
        stats.record_transition(VhostState::Backup, VhostState::Master);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("carp_replays_total 1"));
        assert!(buffer.contains("carp_transitions_total{from=\"BACKUP\",to=\"MASTER\"} 1"));
        assert_eq!(stats.transitions_between(VhostState::Backup, VhostState::Master), 1);
    }
}
