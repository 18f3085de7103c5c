//! Virtual host entries and the election rules they follow.
//!
//! Timings are compared as `(seconds, microseconds)` pairs where the skew
//! contributes `skew / 256` of a second. A numerically smaller timing is a
//! more eager (better) master.

use crate::hmac::Authenticator;
use crate::replay::ReplayGuard;
use crate::timer::{TimerHandle, TimerKind};
use crate::types::{Balancing, MacAddr, VhostState};
use std::time::Duration;

/// One virtual identity owned by a coordinator
#[derive(Debug, Clone)]
pub struct VhostEntry {
    pub(crate) vhid: u8,
    pub(crate) advskew: u8,
    pub(crate) state: VhostState,
    /// First entry of its coordinator
    pub(crate) leader: bool,
    pub(crate) enaddr: MacAddr,
    pub(crate) replay: ReplayGuard,
    pub(crate) auth: Authenticator,
    timers: [Option<TimerHandle>; 3],
}

impl VhostEntry {
    pub fn new(vhid: u8, advskew: u8, leader: bool) -> Self {
        Self {
            vhid,
            advskew,
            state: VhostState::Init,
            leader,
            enaddr: [0; 6],
            replay: ReplayGuard::default(),
            auth: Authenticator::default(),
            timers: [None; 3],
        }
    }

    pub fn vhid(&self) -> u8 {
        self.vhid
    }

    pub fn advskew(&self) -> u8 {
        self.advskew
    }

    pub fn state(&self) -> VhostState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn enaddr(&self) -> MacAddr {
        self.enaddr
    }

    pub(crate) fn timer(&self, kind: TimerKind) -> Option<TimerHandle> {
        self.timers[kind.slot()]
    }

    pub(crate) fn set_timer(&mut self, kind: TimerKind, handle: Option<TimerHandle>) -> Option<TimerHandle> {
        std::mem::replace(&mut self.timers[kind.slot()], handle)
    }

    pub(crate) fn is_pending(&self, kind: TimerKind) -> bool {
        self.timers[kind.slot()].is_some()
    }
}

/// Advertisement timing as a comparable `(seconds, microseconds)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timing {
    pub secs: u64,
    pub micros: u64,
}

impl Timing {
    pub fn new(advbase: u8, advskew: u8) -> Self {
        Self {
            secs: advbase as u64,
            micros: skew_micros(advskew),
        }
    }
}

fn skew_micros(advskew: u8) -> u64 {
    advskew as u64 * 1_000_000 / 256
}

/// Delay between two advertisements of a master
pub fn advertisement_interval(advbase: u8, advskew: u8) -> Duration {
    if advbase == 0 && advskew == 0 {
        return Duration::from_micros(1_000_000 / 256);
    }
    Duration::from_secs(advbase as u64) + Duration::from_micros(skew_micros(advskew))
}

/// How long a backup waits before assuming the master is gone.
///
/// Three base intervals plus one skew; with a zero base the skew is tripled.
pub fn master_down_interval(advbase: u8, advskew: u8) -> Duration {
    match (advbase, advskew) {
        (0, 0) => Duration::from_micros(3 * 1_000_000 / 256),
        (0, skew) => Duration::from_micros(3 * skew_micros(skew)),
        (base, skew) => Duration::from_secs(3 * base as u64) + Duration::from_micros(skew_micros(skew)),
    }
}

/// Virtual MAC of a vhid: 00:00:5e:00:01:<vhid>.
///
/// The leader of an IP balancing coordinator uses the multicast variant.
pub fn virtual_mac(vhid: u8, leader: bool, balancing: Balancing) -> MacAddr {
    let first = if leader && balancing == Balancing::Ip { 1 } else { 0 };
    [first, 0x00, 0x5e, 0x00, 0x01, vhid]
}

/// Our side of an election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalView {
    pub advbase: u8,
    pub advskew: u8,
    pub demote: u8,
    pub preempt: bool,
}

/// What the peer advertised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    pub advbase: u8,
    pub advskew: u8,
    pub demote: u8,
}

/// Outcome of an authenticated advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to do
    Ignore,
    /// Master steps down to backup
    Yield,
    /// Backup takes over now
    TakeOver,
    /// Backup restarts its master-down timer
    KeepWaiting,
}

/// Decide how an entry in `state` reacts to a peer advertisement.
pub fn evaluate(state: VhostState, local: LocalView, peer: PeerView) -> Verdict {
    let ours = Timing::new(local.advbase, local.advskew);
    let theirs = Timing::new(peer.advbase, peer.advskew);

    match state {
        VhostState::Init => Verdict::Ignore,
        VhostState::Master => {
            // Yield to an equal or more eager master, unless it is demoted
            // further than we are.
            if (ours >= theirs && peer.demote <= local.demote) || peer.demote < local.demote {
                Verdict::Yield
            } else {
                Verdict::Ignore
            }
        }
        VhostState::Backup => {
            if local.preempt && ours < theirs && peer.demote >= local.demote {
                return Verdict::TakeOver;
            }
            if peer.demote > local.demote {
                return Verdict::TakeOver;
            }
            // The master would time out anyway: it is slower than our
            // master-down wait.
            if local.advbase > 0 {
                let wait = Timing {
                    secs: 3 * local.advbase as u64,
                    micros: skew_micros(local.advskew),
                };
                if wait < theirs {
                    return Verdict::TakeOver;
                }
            }
            Verdict::KeepWaiting
        }
    }
}
