//! Replay counter of one virtual host.
//!
//! Outgoing counters start at a random seed and advance once per
//! advertisement round. An incoming counter is rejected when it falls in
//! the range this host has emitted itself (our own packet came back) or
//! when it repeats the last counter accepted from a peer.

use rand::RngExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    Fresh,
    /// One of our own advertisements
    Looped,
    /// Same counter as the last accepted advertisement
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayGuard {
    seed: Option<u64>,
    emitted: u64,
    last_accepted: Option<u64>,
}

impl ReplayGuard {
    /// Counter for the next advertisement round.
    pub fn next_counter(&mut self) -> u64 {
        let seed = *self.seed.get_or_insert_with(|| rand::rng().random::<u64>());
        self.emitted += 1;
        seed.wrapping_add(self.emitted)
    }

    /// Counter of the most recent round, if any was sent.
    pub fn current(&self) -> Option<u64> {
        self.seed.map(|seed| seed.wrapping_add(self.emitted))
    }

    pub fn check(&self, counter: u64) -> ReplayVerdict {
        if let Some(seed) = self.seed {
            let distance = counter.wrapping_sub(seed);
            if distance >= 1 && distance <= self.emitted {
                return ReplayVerdict::Looped;
            }
        }
        if self.last_accepted == Some(counter) {
            return ReplayVerdict::Duplicate;
        }
        ReplayVerdict::Fresh
    }

    pub fn accept(&mut self, counter: u64) {
        self.last_accepted = Some(counter);
    }

    #[cfg(test)]
    pub(crate) fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_advances_per_round() {
        let mut guard = ReplayGuard::with_seed(100);
        assert_eq!(guard.current(), Some(100));
        assert_eq!(guard.next_counter(), 101);
        assert_eq!(guard.next_counter(), 102);
        assert_eq!(guard.current(), Some(102));
    }

    #[test]
    fn test_unseeded_guard_seeds_on_first_send() {
        let mut guard = ReplayGuard::default();
        assert_eq!(guard.current(), None);
        let first = guard.next_counter();
        assert_eq!(guard.current(), Some(first));
        assert_eq!(guard.check(first), ReplayVerdict::Looped);
    }

    #[test]
    fn test_own_counters_are_looped() {
        let mut guard = ReplayGuard::with_seed(u64::MAX - 1);
        let a = guard.next_counter();
        let b = guard.next_counter();
        assert_eq!(b, 0);
        assert_eq!(guard.check(a), ReplayVerdict::Looped);
        assert_eq!(guard.check(b), ReplayVerdict::Looped);
        assert_eq!(guard.check(1), ReplayVerdict::Fresh);
        assert_eq!(guard.check(u64::MAX - 1), ReplayVerdict::Fresh);
    }

    #[test]
    fn test_duplicate_peer_counter() {
        let mut guard = ReplayGuard::default();
        assert_eq!(guard.check(77), ReplayVerdict::Fresh);
        guard.accept(77);
        assert_eq!(guard.check(77), ReplayVerdict::Duplicate);
        assert_eq!(guard.check(78), ReplayVerdict::Fresh);
    }
}
