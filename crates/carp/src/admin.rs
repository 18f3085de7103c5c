//! Administrative requests.
//!
//! A [`CarpRequest`] carries every field an operator may change in one go.
//! The whole request is validated before any of it is applied, so a bad
//! field leaves the previous configuration intact.

use crate::coordinator::{Ctx, GroupCoordinator};
use crate::error::{CarpError, Result};
use crate::timer::TimerKind;
use crate::types::{Balancing, CARP_GROUP_V4, CARP_KEY_LEN, CARP_MAX_SKEW, CARP_MAXNODES, VhostState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// One virtual host of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhidConfig {
    pub vhid: u8,
    #[serde(default)]
    pub advskew: u8,
}

impl VhidConfig {
    pub fn new(vhid: u8, advskew: u8) -> Self {
        Self { vhid, advskew }
    }
}

/// Caller privilege for requests touching the shared key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Unprivileged,
    Privileged,
}

/// Set request. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarpRequest {
    /// Parent interface name
    pub carpdev: Option<String>,
    pub vhids: Option<Vec<VhidConfig>>,
    pub advbase: Option<u32>,
    pub balancing: Option<Balancing>,
    pub key: Option<[u8; CARP_KEY_LEN]>,
    /// Unicast peer. The unspecified address restores the multicast group.
    pub peer: Option<Ipv4Addr>,
    /// Force every entry to this state
    pub state: Option<VhostState>,
}

impl CarpRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn carpdev(mut self, name: &str) -> Self {
        self.carpdev = Some(name.to_string());
        self
    }

    pub fn vhids(mut self, vhids: &[VhidConfig]) -> Self {
        self.vhids = Some(vhids.to_vec());
        self
    }

    pub fn vhid(self, vhid: u8, advskew: u8) -> Self {
        self.vhids(&[VhidConfig::new(vhid, advskew)])
    }

    pub fn advbase(mut self, advbase: u32) -> Self {
        self.advbase = Some(advbase);
        self
    }

    pub fn balancing(mut self, balancing: Balancing) -> Self {
        self.balancing = Some(balancing);
        self
    }

    pub fn key(mut self, key: [u8; CARP_KEY_LEN]) -> Self {
        self.key = Some(key);
        self
    }

    pub fn passphrase(self, passphrase: &str) -> Self {
        self.key(key_from_passphrase(passphrase))
    }

    pub fn peer(mut self, peer: Ipv4Addr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn state(mut self, state: VhostState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Zero padded key from a passphrase. Longer passphrases are truncated.
pub fn key_from_passphrase(passphrase: &str) -> [u8; CARP_KEY_LEN] {
    let mut key = [0u8; CARP_KEY_LEN];
    let bytes = passphrase.as_bytes();
    let len = bytes.len().min(CARP_KEY_LEN);
    key[..len].copy_from_slice(&bytes[..len]);
    key
}

/// Per-vhid part of a status reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VhostStatus {
    pub vhid: u8,
    pub advskew: u8,
    pub state: VhostState,
}

/// Reply to a get request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarpStatus {
    pub carpdev: Option<String>,
    /// State of the leader entry
    pub state: VhostState,
    pub vhids: Vec<VhostStatus>,
    pub advbase: u8,
    pub balancing: Balancing,
    /// All zero for unprivileged callers
    #[serde(skip)]
    pub key: [u8; CARP_KEY_LEN],
    pub peer: Ipv4Addr,
    pub demote: i32,
}

impl CarpStatus {
    pub(crate) fn from_coordinator(sc: &GroupCoordinator, carpdev: Option<String>, privilege: Privilege) -> Self {
        let key = match privilege {
            Privilege::Privileged => *sc.key(),
            Privilege::Unprivileged => [0; CARP_KEY_LEN],
        };
        Self {
            carpdev,
            state: sc.leader_state(),
            vhids: sc
                .entries()
                .iter()
                .filter(|e| e.vhid() != 0)
                .map(|e| VhostStatus {
                    vhid: e.vhid(),
                    advskew: e.advskew(),
                    state: e.state(),
                })
                .collect(),
            advbase: sc.advbase(),
            balancing: sc.balancing(),
            key,
            peer: sc.peer(),
            demote: sc.own_demotion(),
        }
    }
}

/// Check a vhid list and return it sorted as `(vhid, skew)` pairs.
///
/// An empty list yields `None`: there is nothing to change.
pub(crate) fn validate_vhids(vhids: &[VhidConfig]) -> Result<Option<Vec<(u8, u8)>>> {
    if vhids.is_empty() {
        return Ok(None);
    }
    if vhids.len() > CARP_MAXNODES {
        return Err(CarpError::TooManyVhids {
            count: vhids.len(),
            max: CARP_MAXNODES,
        });
    }

    let mut seen = BTreeSet::new();
    for cfg in vhids {
        if cfg.vhid == 0 {
            return Err(CarpError::invalid("vhid 0 is reserved"));
        }
        if cfg.advskew > CARP_MAX_SKEW {
            return Err(CarpError::SkewOutOfRange {
                vhid: cfg.vhid,
                skew: cfg.advskew,
            });
        }
        if !seen.insert(cfg.vhid) {
            return Err(CarpError::DuplicateVhid(cfg.vhid));
        }
    }

    let mut sorted: Vec<(u8, u8)> = vhids.iter().map(|c| (c.vhid, c.advskew)).collect();
    sorted.sort_unstable_by_key(|&(vhid, _)| vhid);
    Ok(Some(sorted))
}

pub(crate) fn validate_advbase(advbase: u32) -> Result<u8> {
    u8::try_from(advbase).map_err(|_| CarpError::invalid(format!("advbase {advbase} out of range")))
}

/// Balancing mode after a vhid list change
fn balancing_default(count: usize, requested: Balancing, current: Balancing) -> Balancing {
    if count <= 1 {
        Balancing::None
    } else if requested == Balancing::None && current == Balancing::None {
        Balancing::Ip
    } else {
        requested
    }
}

/// A request after validation
#[derive(Debug, Clone, Default)]
pub(crate) struct ValidatedRequest {
    pub vhids: Option<Vec<(u8, u8)>>,
    pub advbase: Option<u8>,
    pub balancing: Option<Balancing>,
    pub key: Option<[u8; CARP_KEY_LEN]>,
    pub peer: Option<Ipv4Addr>,
    pub state: Option<VhostState>,
}

impl GroupCoordinator {
    /// Move onto a new parent link. Eligibility is checked by the caller.
    pub(crate) fn attach(&mut self, carpdev: u32, ctx: &mut Ctx<'_>) {
        if self.carpdev() == Some(carpdev) {
            return;
        }
        if self.carpdev().is_some() {
            self.detach(ctx);
        }
        self.set_carpdev(Some(carpdev));
        if !self.addresses().is_empty() {
            self.set_up_flag(true);
        }
        info!(iface = %self.name(), carpdev, "attached to parent");
        self.set_enaddr(ctx);
        self.carpdev_state(ctx);
    }

    /// Apply everything but the parent change of a validated request.
    pub(crate) fn apply(&mut self, req: ValidatedRequest, ctx: &mut Ctx<'_>) {
        if let Some(peer) = req.peer {
            self.set_peer(if peer.is_unspecified() { CARP_GROUP_V4 } else { peer });
        }

        if let Some(key) = req.key {
            self.set_key(key);
        }
        if let Some(advbase) = req.advbase {
            self.set_advbase(advbase);
        }

        let mut balancing = req.balancing;
        if let Some(vhids) = req.vhids {
            let current: Vec<u8> = self.vhids().iter().map(|&(v, _)| v).collect();
            let wanted: Vec<u8> = vhids.iter().map(|&(v, _)| v).collect();
            if current != wanted {
                let requested = balancing.unwrap_or(self.balancing());
                balancing = Some(balancing_default(vhids.len(), requested, self.balancing()));
                debug!(iface = %self.name(), ?wanted, "rebuilding virtual hosts");
                self.rebuild_vhosts(&vhids, ctx);
            } else {
                self.set_skews(&vhids);
            }
        }

        if let Some(balancing) = balancing
            && balancing != self.balancing()
        {
            info!(iface = %self.name(), %balancing, "balancing mode changed");
            self.set_balancing(balancing);
            self.set_enaddr(ctx);
            self.update_lsmask();
        }

        self.hmac_prepare();
        self.setrun_all(None, ctx);

        // forced last so a promotion advertises under the new key; a vhid
        // still in INIT is left for setrun once the interface is ready
        if let Some(state) = req.state
            && self.leader_state() != VhostState::Init
            && state != self.leader_state()
        {
            self.force_state(state, ctx);
        }
    }

    /// Administrative state change.
    ///
    /// MASTER promotes every entry directly; BACKUP stops advertising and
    /// lets the master-down timers run.
    pub(crate) fn force_state(&mut self, state: VhostState, ctx: &mut Ctx<'_>) {
        match state {
            VhostState::Backup => {
                for idx in 0..self.entries().len() {
                    self.cancel_timer(idx, TimerKind::Advertisement, ctx);
                }
                self.set_state_all(VhostState::Backup, ctx);
                self.setrun_all(None, ctx);
            }
            VhostState::Master => {
                for idx in 0..self.entries().len() {
                    self.master_down(idx, ctx);
                }
            }
            VhostState::Init => {}
        }
    }
}
