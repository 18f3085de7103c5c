//! Group coordinator: one CARP interface and its virtual hosts.
//!
//! Entries are kept sorted by vhid; the first one is the leader. Every
//! operation runs inside the engine's exclusion domain and reaches the
//! outside world through a [`Ctx`].

use crate::demote::{DemotionCounter, InterfaceGroups, effective_demotion};
use crate::engine::ParentInterface;
use crate::error::TransportError;
use crate::hmac::{AuthInput, Authenticator, HmacContext};
use crate::packet::Advertisement;
use crate::replay::ReplayVerdict;
use crate::stats::CarpStats;
use crate::timer::{CoordinatorKey, Scheduler, TimerHandle, TimerId, TimerKind};
use crate::transport::{Egress, Transport};
use crate::types::{
    Balancing, CARP_BOW_OUT, CARP_DFLTINTV, CARP_GROUP_V4, CARP_IFGROUP, CARP_KEY_LEN, CARP_VERSION, CarpOptions,
    Family, IFGROUP_ALL, LinkState, MacAddr, VhostState,
};
use crate::vhost::{
    LocalView, PeerView, Verdict, VhostEntry, advertisement_interval, evaluate, master_down_interval, virtual_mac,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use tracing::{debug, info, warn};

/// Services an operation may use besides the coordinator itself
pub(crate) struct Ctx<'a> {
    pub transport: &'a mut dyn Transport,
    pub scheduler: &'a mut dyn Scheduler,
    pub stats: &'a CarpStats,
    pub options: &'a CarpOptions,
    pub groups: &'a mut InterfaceGroups,
    pub parents: &'a BTreeMap<u32, ParentInterface>,
    /// Set when every master on every link should advertise now
    pub send_all: bool,
}

pub struct GroupCoordinator {
    pub(crate) key: CoordinatorKey,
    name: String,
    ifindex: u32,
    carpdev: Option<u32>,
    entries: Vec<VhostEntry>,
    /// Bumped whenever the entry set is rebuilt
    epoch: u64,
    carp_key: [u8; CARP_KEY_LEN],
    peer: Ipv4Addr,
    advbase: u8,
    balancing: Balancing,
    lsmask: u32,
    lscount: u32,
    addrs: Vec<IpAddr>,
    naddrs: usize,
    naddrs6: usize,
    lladdr: MacAddr,
    curlladdr: MacAddr,
    realmac: bool,
    up: bool,
    running: bool,
    suppress: bool,
    bow_out: bool,
    demote: DemotionCounter,
    sendad_errors: i32,
    sendad_success: i32,
    delayed_arp: i32,
    groups: Vec<String>,
    link_state: LinkState,
    ierrors: u64,
    oerrors: u64,
    auth_log: DefaultDirectRateLimiter,
}

impl GroupCoordinator {
    pub(crate) fn new(key: CoordinatorKey, name: &str, ifindex: u32) -> Self {
        Self {
            key,
            name: name.to_string(),
            ifindex,
            carpdev: None,
            entries: vec![VhostEntry::new(0, 0, true)],
            epoch: 1,
            carp_key: [0; CARP_KEY_LEN],
            peer: CARP_GROUP_V4,
            advbase: CARP_DFLTINTV,
            balancing: Balancing::None,
            lsmask: 0,
            lscount: 0,
            addrs: Vec::new(),
            naddrs: 0,
            naddrs6: 0,
            lladdr: [0; 6],
            curlladdr: [0; 6],
            realmac: false,
            up: false,
            running: false,
            suppress: false,
            bow_out: false,
            demote: DemotionCounter::default(),
            sendad_errors: 0,
            sendad_success: 0,
            delayed_arp: -1,
            groups: vec![CARP_IFGROUP.to_string()],
            link_state: LinkState::Invalid,
            ierrors: 0,
            oerrors: 0,
            auth_log: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn carpdev(&self) -> Option<u32> {
        self.carpdev
    }

    pub fn entries(&self) -> &[VhostEntry] {
        &self.entries
    }

    pub fn entry(&self, vhid: u8) -> Option<&VhostEntry> {
        self.entries.iter().find(|e| e.vhid() == vhid)
    }

    pub(crate) fn entry_index(&self, vhid: u8) -> Option<usize> {
        self.entries.iter().position(|e| e.vhid() == vhid)
    }

    pub fn state_of(&self, vhid: u8) -> Option<VhostState> {
        self.entry(vhid).map(|e| e.state())
    }

    pub fn leader_state(&self) -> VhostState {
        self.entries.first().map(|e| e.state()).unwrap_or(VhostState::Init)
    }

    /// Vhids and skews in ascending vhid order, placeholder excluded
    pub fn vhids(&self) -> Vec<(u8, u8)> {
        self.entries
            .iter()
            .filter(|e| e.vhid() != 0)
            .map(|e| (e.vhid(), e.advskew()))
            .collect()
    }

    pub fn key(&self) -> &[u8; CARP_KEY_LEN] {
        &self.carp_key
    }

    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    pub fn advbase(&self) -> u8 {
        self.advbase
    }

    pub fn balancing(&self) -> Balancing {
        self.balancing
    }

    /// `(load_mask, load_count)`
    pub fn load_mask(&self) -> (u32, u32) {
        (self.lsmask, self.lscount)
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addrs
    }

    pub fn lladdr(&self) -> MacAddr {
        self.lladdr
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_up_and_running(&self) -> bool {
        self.up && self.running
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress
    }

    pub fn own_demotion(&self) -> i32 {
        self.demote.get()
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    /// `(input errors, output errors)`
    pub fn errors(&self) -> (u64, u64) {
        (self.ierrors, self.oerrors)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn set_carpdev(&mut self, carpdev: Option<u32>) {
        self.carpdev = carpdev;
    }

    pub(crate) fn set_peer(&mut self, peer: Ipv4Addr) {
        self.peer = peer;
    }

    pub(crate) fn set_advbase(&mut self, advbase: u8) {
        self.advbase = advbase;
    }

    pub(crate) fn set_balancing(&mut self, balancing: Balancing) {
        self.balancing = balancing;
    }

    pub(crate) fn set_up_flag(&mut self, up: bool) {
        self.up = up;
    }

    pub(crate) fn set_key(&mut self, key: [u8; CARP_KEY_LEN]) {
        self.carp_key = key;
    }

    pub(crate) fn set_lladdr_raw(&mut self, lladdr: MacAddr) {
        self.lladdr = lladdr;
    }

    pub(crate) fn lladdr_changed(&self) -> bool {
        self.lladdr != self.curlladdr
    }

    /// Demotion advertised by this coordinator
    pub(crate) fn demotion(&self, groups: &InterfaceGroups) -> u8 {
        effective_demotion(self.demote, groups, &self.groups)
    }

    fn parent<'p>(&self, parents: &'p BTreeMap<u32, ParentInterface>) -> Option<&'p ParentInterface> {
        self.carpdev.and_then(|idx| parents.get(&idx))
    }

    fn timer_id(&self, vhid: u8, kind: TimerKind) -> TimerId {
        TimerId {
            coordinator: self.key,
            epoch: self.epoch,
            vhid,
            kind,
        }
    }

    fn arm(&mut self, idx: usize, kind: TimerKind, after: std::time::Duration, ctx: &mut Ctx<'_>) {
        let id = self.timer_id(self.entries[idx].vhid(), kind);
        let entry = &mut self.entries[idx];
        if let Some(old) = entry.set_timer(kind, None) {
            ctx.scheduler.cancel(&old);
        }
        let handle = ctx.scheduler.arm(id, after);
        entry.set_timer(kind, Some(handle));
    }

    pub(crate) fn cancel_timer(&mut self, idx: usize, kind: TimerKind, ctx: &mut Ctx<'_>) {
        if let Some(old) = self.entries[idx].set_timer(kind, None) {
            ctx.scheduler.cancel(&old);
        }
    }

    pub(crate) fn cancel_all_timers(&mut self, ctx: &mut Ctx<'_>) {
        for idx in 0..self.entries.len() {
            for kind in [TimerKind::Advertisement, TimerKind::MasterDownV4, TimerKind::MasterDownV6] {
                self.cancel_timer(idx, kind, ctx);
            }
        }
    }

    /// Clear the slot of a fired timer. False if the handle is stale.
    pub(crate) fn claim_timer(&mut self, idx: usize, handle: &TimerHandle) -> bool {
        let entry = &mut self.entries[idx];
        if entry.timer(handle.id.kind) != Some(*handle) {
            return false;
        }
        entry.set_timer(handle.id.kind, None);
        true
    }

    /// Recompute both authentication contexts of every entry.
    pub(crate) fn hmac_prepare(&mut self) {
        for entry in &mut self.entries {
            let lladdr = (!self.realmac && entry.is_leader() && self.lladdr != entry.enaddr()).then_some(self.lladdr);
            entry.auth = Authenticator::prepare(&AuthInput {
                key: &self.carp_key,
                vhid: entry.vhid(),
                lladdr,
                addrs: &self.addrs,
            });
        }
    }

    pub(crate) fn set_state(&mut self, idx: usize, state: VhostState, ctx: &mut Ctx<'_>) {
        let entry = &mut self.entries[idx];
        let old = entry.state;
        if old == state {
            return;
        }
        entry.state = state;

        if old == VhostState::Init || state == VhostState::Init {
            info!(iface = %self.name, vhid = entry.vhid(), from = %old, to = %state, "state transition");
        } else {
            warn!(iface = %self.name, vhid = entry.vhid(), from = %old, to = %state, "state transition");
        }
        ctx.stats.record_transition(old, state);

        self.update_lsmask();
        self.update_link_state();
    }

    pub(crate) fn set_state_all(&mut self, state: VhostState, ctx: &mut Ctx<'_>) {
        for idx in 0..self.entries.len() {
            self.set_state(idx, state, ctx);
        }
    }

    pub(crate) fn update_lsmask(&mut self) {
        if self.balancing == Balancing::None {
            return;
        }
        let mut mask = 0u32;
        let mut count = 0u32;
        for entry in &self.entries {
            if entry.state().is_master() && count < u32::BITS {
                mask |= 1 << count;
            }
            count += 1;
        }
        self.lsmask = mask;
        self.lscount = count;
    }

    fn update_link_state(&mut self) {
        let link_state = if self.entries.iter().any(|e| e.state().is_master()) {
            LinkState::Up
        } else if self.entries.iter().any(|e| e.state() == VhostState::Backup) {
            LinkState::Down
        } else {
            LinkState::Invalid
        };
        if link_state != self.link_state {
            debug!(iface = %self.name, ?link_state, "link state changed");
            self.link_state = link_state;
        }
    }

    /// Arm an entry according to its state.
    ///
    /// Without a family, the master-down timers of every configured or
    /// already pending family are restarted.
    pub(crate) fn setrun(&mut self, idx: usize, family: Option<Family>, ctx: &mut Ctx<'_>) {
        let parents = ctx.parents;
        let Some(parent) = self.parent(parents) else {
            self.running = false;
            self.set_state_all(VhostState::Init, ctx);
            return;
        };
        self.realmac = parent.lladdr == self.lladdr;

        let entry = &self.entries[idx];
        if self.up && entry.vhid() > 0 && (self.naddrs > 0 || self.naddrs6 > 0) && !self.suppress {
            self.running = true;
        } else {
            self.running = false;
            return;
        }

        match entry.state() {
            VhostState::Init => {
                self.set_state(idx, VhostState::Backup, ctx);
                self.setrun(idx, None, ctx);
            }
            VhostState::Backup => {
                self.cancel_timer(idx, TimerKind::Advertisement, ctx);
                let entry = &self.entries[idx];
                let wait = master_down_interval(self.advbase, entry.advskew());
                let (arm_v4, arm_v6) = match family {
                    Some(Family::V4) => (true, false),
                    Some(Family::V6) => (false, true),
                    None => (
                        self.naddrs > 0 || entry.is_pending(TimerKind::MasterDownV4),
                        self.naddrs6 > 0 || entry.is_pending(TimerKind::MasterDownV6),
                    ),
                };
                if entry.is_leader() {
                    self.delayed_arp = -1;
                }
                if arm_v4 {
                    self.arm(idx, TimerKind::MasterDownV4, wait, ctx);
                }
                if arm_v6 {
                    self.arm(idx, TimerKind::MasterDownV6, wait, ctx);
                }
            }
            VhostState::Master => {
                let interval = advertisement_interval(self.advbase, entry.advskew());
                self.arm(idx, TimerKind::Advertisement, interval, ctx);
            }
        }
    }

    pub(crate) fn setrun_all(&mut self, family: Option<Family>, ctx: &mut Ctx<'_>) {
        for idx in 0..self.entries.len() {
            self.setrun(idx, family, ctx);
        }
    }

    /// Master-down timer expired, or forced promotion.
    pub(crate) fn master_down(&mut self, idx: usize, ctx: &mut Ctx<'_>) {
        match self.entries[idx].state() {
            VhostState::Init => {
                info!(iface = %self.name, vhid = self.entries[idx].vhid(), "master_down event in INIT state");
            }
            VhostState::Master => {}
            VhostState::Backup => {
                self.cancel_timer(idx, TimerKind::MasterDownV4, ctx);
                self.cancel_timer(idx, TimerKind::MasterDownV6, ctx);
                self.set_state(idx, VhostState::Master, ctx);
                self.send_ad(idx, ctx);
                if self.balancing == Balancing::None && self.entries[idx].is_leader() {
                    self.send_arp(ctx);
                    // announce once more for slow L3 switches
                    self.delayed_arp = 2;
                    self.send_na(ctx);
                }
                self.setrun(idx, None, ctx);
                ctx.stats.preempt.inc();
            }
        }
    }

    fn egress(&self, family: Family, carpdev: u32) -> Egress {
        Egress {
            family,
            carpdev,
            ifindex: self.ifindex,
            peer: self.peer,
            lladdr: self.lladdr,
            balancing: self.balancing,
        }
    }

    /// Send one advertisement round for an entry and rearm its timer.
    pub(crate) fn send_ad(&mut self, idx: usize, ctx: &mut Ctx<'_>) {
        // stopped without a bow-out, e.g. the last address went away
        if !self.running {
            return;
        }
        let (advbase, advskew) = if self.bow_out {
            (CARP_BOW_OUT, CARP_BOW_OUT)
        } else {
            (self.advbase, self.entries[idx].advskew())
        };
        let interval = advertisement_interval(advbase, advskew);

        let parents = ctx.parents;
        let Some(carpdev) = self.parent(parents).map(|p| p.index) else {
            self.oerrors += 1;
            if !self.bow_out {
                self.arm(idx, TimerKind::Advertisement, interval, ctx);
            }
            return;
        };

        let demote = self.demotion(ctx.groups);
        let entry = &mut self.entries[idx];
        let mut advert = Advertisement::new(entry.vhid(), advbase, advskew, demote);
        advert.counter = entry.replay.next_counter();
        advert.digest = entry.auth.generate(HmacContext::NoV6LinkLocal, advert.counter);
        let leader = entry.is_leader();

        if self.naddrs > 0 {
            ctx.stats.opackets.inc();
            let result = ctx.transport.send_advertisement(&self.egress(Family::V4, carpdev), &advert);
            self.record_send(result, Family::V4, ctx);

            if leader {
                if self.delayed_arp > 0 {
                    self.delayed_arp -= 1;
                }
                if self.delayed_arp == 0 {
                    self.send_arp(ctx);
                    self.delayed_arp = -1;
                }
            }
        }

        if self.naddrs6 > 0 {
            ctx.stats.opackets6.inc();
            let result = ctx.transport.send_advertisement(&self.egress(Family::V6, carpdev), &advert);
            self.record_send(result, Family::V6, ctx);
        }

        if !self.bow_out {
            self.arm(idx, TimerKind::Advertisement, interval, ctx);
        }
    }

    /// Feed a send result into the demotion hysteresis.
    fn record_send(&mut self, result: Result<(), TransportError>, family: Family, ctx: &mut Ctx<'_>) {
        let failed = match result {
            Ok(()) => false,
            // a unicast peer that is down is not our failure
            Err(TransportError::HostDown) if family == Family::V4 && !self.peer.is_multicast() => false,
            Err(TransportError::NoBuffers) => {
                ctx.stats.onomem.inc();
                true
            }
            Err(err) => {
                debug!(iface = %self.name, %family, error = %err, "advertisement send failed");
                true
            }
        };

        let threshold = 3 * self.entries.len() as i32;
        if failed {
            self.oerrors += 1;
            if self.sendad_errors < i32::MAX {
                self.sendad_errors += 1;
            }
            if self.sendad_errors == threshold {
                self.demote_adj(1, "> snderrors", ctx);
            }
            self.sendad_success = 0;
        } else if self.sendad_errors >= threshold {
            self.sendad_success += 1;
            if self.sendad_success >= threshold {
                self.demote_adj(-1, "< snderrors", ctx);
                self.sendad_errors = 0;
            }
        } else {
            self.sendad_errors = 0;
        }
    }

    /// Advertise from every MASTER entry.
    pub(crate) fn send_ad_masters(&mut self, ctx: &mut Ctx<'_>) {
        for idx in 0..self.entries.len() {
            if self.entries[idx].state().is_master() {
                self.send_ad(idx, ctx);
            }
        }
    }

    pub(crate) fn send_arp(&mut self, ctx: &mut Ctx<'_>) {
        let Some(carpdev) = self.carpdev else {
            return;
        };
        for addr in &self.addrs {
            if let IpAddr::V4(v4) = addr {
                ctx.transport.send_gratuitous_arp(carpdev, self.lladdr, *v4);
            }
        }
    }

    pub(crate) fn send_na(&mut self, ctx: &mut Ctx<'_>) {
        let Some(carpdev) = self.carpdev else {
            return;
        };
        for addr in &self.addrs {
            if let IpAddr::V6(v6) = addr {
                ctx.transport.send_neighbor_advert(carpdev, self.lladdr, *v6, ctx.options.ipv6_router);
            }
        }
    }

    /// Adjust our own demotion and that of every group we are in.
    pub(crate) fn demote_adj(&mut self, adj: i32, reason: &str, ctx: &mut Ctx<'_>) {
        self.demote.adjust(adj);
        for group in &self.groups {
            if group == IFGROUP_ALL {
                continue;
            }
            let (before, after) = ctx.groups.adjust(group, adj);
            if before == 0 && after > 0 {
                ctx.send_all = true;
            }
            warn!(iface = %self.name, group = %group, adj, demote = after, reason, "demotion adjusted");
        }
    }

    pub(crate) fn join_group(&mut self, group: &str, ctx: &mut Ctx<'_>) {
        if self.groups.iter().any(|g| g == group) {
            return;
        }
        ctx.groups.ensure(group);
        let demote = self.demote.get();
        if demote > 0 {
            ctx.groups.adjust(group, demote);
        }
        self.groups.push(group.to_string());
    }

    pub(crate) fn leave_group(&mut self, group: &str, ctx: &mut Ctx<'_>) {
        let Some(pos) = self.groups.iter().position(|g| g == group) else {
            return;
        };
        let demote = self.demote.get();
        if demote > 0 {
            ctx.groups.adjust(group, -demote);
        }
        self.groups.remove(pos);
    }

    fn log_rejection(&self, vhid: u8, reason: &str) {
        if self.auth_log.check().is_ok() {
            info!(iface = %self.name, vhid, reason, "advertisement rejected");
        }
    }

    /// Process an advertisement that matched entry `idx`.
    pub(crate) fn receive(&mut self, idx: usize, family: Family, advert: &Advertisement, ctx: &mut Ctx<'_>) {
        let vhid = self.entries[idx].vhid();

        if advert.version != CARP_VERSION {
            ctx.stats.badver.inc();
            self.ierrors += 1;
            self.log_rejection(vhid, "invalid version");
            return;
        }

        if !self.entries[idx].auth.verify(advert.counter, &advert.digest) {
            ctx.stats.badauth.inc();
            self.ierrors += 1;
            self.log_rejection(vhid, "incorrect hash");
            return;
        }

        match self.entries[idx].replay.check(advert.counter) {
            ReplayVerdict::Fresh => {}
            verdict => {
                ctx.stats.replays.inc();
                let simplex = self.parent(ctx.parents).is_some_and(|p| p.simplex);
                if simplex {
                    ctx.stats.badauth.inc();
                    self.ierrors += 1;
                    if self.auth_log.check().is_ok() {
                        warn!(iface = %self.name, vhid, ?verdict, "replay or network loop detected");
                    }
                } else {
                    debug!(iface = %self.name, vhid, ?verdict, "ignoring echoed advertisement");
                }
                return;
            }
        }
        self.entries[idx].replay.accept(advert.counter);

        let local = LocalView {
            advbase: self.advbase,
            advskew: self.entries[idx].advskew(),
            demote: self.demotion(ctx.groups),
            preempt: ctx.options.preempt,
        };
        let peer = PeerView {
            advbase: advert.advbase,
            advskew: advert.advskew,
            demote: advert.demote,
        };

        match evaluate(self.entries[idx].state(), local, peer) {
            Verdict::Ignore => {}
            Verdict::Yield => {
                debug!(iface = %self.name, vhid, "more eager master seen, stepping down");
                self.cancel_timer(idx, TimerKind::Advertisement, ctx);
                self.set_state(idx, VhostState::Backup, ctx);
                self.setrun(idx, None, ctx);
            }
            Verdict::TakeOver => {
                debug!(iface = %self.name, vhid, "taking over from peer");
                self.master_down(idx, ctx);
            }
            Verdict::KeepWaiting => self.setrun(idx, Some(family), ctx),
        }
    }

    /// Derive virtual MACs and adopt the leader's unless one was set by hand.
    pub(crate) fn set_enaddr(&mut self, ctx: &mut Ctx<'_>) {
        let attached = self.carpdev.is_some();
        let balancing = self.balancing;
        for entry in &mut self.entries {
            entry.enaddr = if entry.vhid() != 0 && attached {
                virtual_mac(entry.vhid(), entry.is_leader(), balancing)
            } else {
                [0; 6]
            };
        }

        let Some(leader) = self.entries.first().map(|e| e.enaddr()) else {
            return;
        };
        if self.lladdr[1..5] == leader[1..5] || self.lladdr == [0; 6] {
            self.lladdr = leader;
        }

        if self.lladdr != self.curlladdr {
            self.curlladdr = self.lladdr;
            self.hmac_prepare();
            self.set_state_all(VhostState::Init, ctx);
            self.setrun_all(None, ctx);
        }
    }

    /// Replace the entry set. `vhids` must already be validated and sorted.
    pub(crate) fn rebuild_vhosts(&mut self, vhids: &[(u8, u8)], ctx: &mut Ctx<'_>) {
        self.cancel_all_timers(ctx);
        self.epoch += 1;
        self.entries = vhids
            .iter()
            .enumerate()
            .map(|(i, &(vhid, skew))| VhostEntry::new(vhid, skew, i == 0))
            .collect();
        self.set_enaddr(ctx);
        self.set_state_all(VhostState::Init, ctx);
        self.update_lsmask();
        self.update_link_state();
    }

    /// Update skews of existing entries
    pub(crate) fn set_skews(&mut self, vhids: &[(u8, u8)]) {
        for &(vhid, skew) in vhids {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.vhid() == vhid) {
                entry.advskew = skew;
            }
        }
    }

    /// Recount addresses after one was added or removed.
    pub(crate) fn addr_updated(&mut self, ctx: &mut Ctx<'_>) {
        let naddrs = self.addrs.iter().filter(|a| a.is_ipv4()).count();
        let naddrs6 = self.addrs.iter().filter(|a| a.is_ipv6()).count();

        if naddrs != self.naddrs || naddrs6 != self.naddrs6 {
            self.naddrs = naddrs;
            self.naddrs6 = naddrs6;
        }
        if naddrs == 0 && naddrs6 == 0 {
            self.up = false;
            self.set_state_all(VhostState::Init, ctx);
        } else {
            self.hmac_prepare();
        }
        self.setrun_all(None, ctx);
    }

    pub(crate) fn add_address(&mut self, addr: IpAddr, ctx: &mut Ctx<'_>) {
        self.up = true;
        if addr.is_unspecified() {
            self.setrun_all(None, ctx);
            return;
        }
        if self.addrs.contains(&addr) {
            return;
        }
        let first_of_family = match addr {
            IpAddr::V4(_) => self.naddrs == 0,
            IpAddr::V6(_) => self.naddrs6 == 0,
        };
        if first_of_family {
            self.set_state_all(VhostState::Init, ctx);
        }
        self.addrs.push(addr);
        self.addr_updated(ctx);
    }

    pub(crate) fn remove_address(&mut self, addr: IpAddr, ctx: &mut Ctx<'_>) -> bool {
        let Some(pos) = self.addrs.iter().position(|a| *a == addr) else {
            return false;
        };
        self.addrs.remove(pos);
        self.addr_updated(ctx);
        true
    }

    /// React to the parent link going away or coming back.
    pub(crate) fn carpdev_state(&mut self, ctx: &mut Ctx<'_>) {
        let parents = ctx.parents;
        let Some(parent) = self.parent(parents) else {
            return;
        };
        let suppressed = self.suppress;

        if !parent.up || !parent.link_up {
            self.running = false;
            self.cancel_all_timers(ctx);
            self.set_state_all(VhostState::Init, ctx);
            self.suppress = true;
            self.setrun_all(None, ctx);
            if !suppressed {
                self.demote_adj(1, "carpdev", ctx);
            }
        } else if suppressed {
            self.set_state_all(VhostState::Init, ctx);
            self.suppress = false;
            self.setrun_all(None, ctx);
            self.demote_adj(-1, "carpdev", ctx);
        }
    }

    /// Leave the parent link.
    pub(crate) fn detach(&mut self, ctx: &mut Ctx<'_>) {
        self.cancel_all_timers(ctx);

        let demote = self.demote.get();
        if demote != 0 {
            self.demote_adj(-demote, "detach", ctx);
        }
        self.suppress = false;
        self.sendad_errors = 0;

        self.set_state_all(VhostState::Init, ctx);
        self.up = false;
        self.setrun_all(None, ctx);
        self.carpdev = None;
    }

    /// Administrative up or down.
    ///
    /// Going down from a running state sends a final bow-out advertisement
    /// from every master so backups take over at once.
    pub(crate) fn set_up(&mut self, up: bool, ctx: &mut Ctx<'_>) {
        self.up = up;
        let leader = self.leader_state();

        if leader != VhostState::Init && !up {
            self.cancel_all_timers(ctx);
            self.up = true;
            self.bow_out = true;
            self.send_ad_masters(ctx);
            self.bow_out = false;
            self.up = false;
            self.set_state_all(VhostState::Init, ctx);
            self.setrun_all(None, ctx);
        } else if leader == VhostState::Init && up {
            self.setrun_all(None, ctx);
        }
    }

    /// Packets for `dst` belong to us at the link layer.
    pub fn accepts_ether(&self, dst: &MacAddr) -> bool {
        self.is_up_and_running()
            && (self.leader_state().is_master() || self.balancing.is_ip_based())
            && *dst == self.lladdr
    }

    /// Whether locally originated traffic may leave through this interface.
    pub fn may_transmit(&self) -> bool {
        self.balancing != Balancing::None || self.leader_state().is_master()
    }

    /// Load balancing filter: true when another host owns this flow.
    pub fn should_drop(&self, src: IpAddr, dst: IpAddr, l3_multicast: bool) -> bool {
        if self.balancing == Balancing::None || l3_multicast {
            return false;
        }

        let fold = match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => u32::from(s) ^ u32::from(d),
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let (s, d) = (s.octets(), d.octets());
                (0..4).fold(0u32, |acc, i| {
                    let word = |o: &[u8; 16]| u32::from_be_bytes([o[i * 4], o[i * 4 + 1], o[i * 4 + 2], o[i * 4 + 3]]);
                    acc ^ word(&s) ^ word(&d)
                })
            }
            _ => return false,
        };

        if self.lscount == 0 {
            return true;
        }
        let bucket = fold % self.lscount;
        bucket >= u32::BITS || self.lsmask & (1 << bucket) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CarpStats;
    use crate::timer::ManualScheduler;
    use crate::transport::{MockTransport, RecordingTransport, Sent};

    struct Fixture {
        transport: RecordingTransport,
        scheduler: ManualScheduler,
        stats: CarpStats,
        options: CarpOptions,
        groups: InterfaceGroups,
        parents: BTreeMap<u32, ParentInterface>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut parents = BTreeMap::new();
            parents.insert(2, ParentInterface::ethernet("eth0", 2, [2, 0, 0, 0, 0, 1]));
            Self {
                transport: RecordingTransport::new(),
                scheduler: ManualScheduler::new(),
                stats: CarpStats::new(),
                options: CarpOptions::default(),
                groups: InterfaceGroups::new(),
                parents,
            }
        }

        fn ctx(&mut self) -> Ctx<'_> {
            Ctx {
                transport: &mut self.transport,
                scheduler: &mut self.scheduler,
                stats: &self.stats,
                options: &self.options,
                groups: &mut self.groups,
                parents: &self.parents,
                send_all: false,
            }
        }
    }

    fn key() -> CoordinatorKey {
        CoordinatorKey { index: 0, generation: 1 }
    }

    /// Attached, keyed coordinator with one IPv4 address
    fn running(fx: &mut Fixture, vhids: &[(u8, u8)]) -> GroupCoordinator {
        let mut sc = GroupCoordinator::new(key(), "carp0", 100);
        let mut ctx = fx.ctx();
        sc.set_carpdev(Some(2));
        let mut k = [0u8; CARP_KEY_LEN];
        k[0] = b'k';
        sc.set_key(k);
        sc.rebuild_vhosts(vhids, &mut ctx);
        sc.add_address("192.0.2.1".parse().unwrap(), &mut ctx);
        sc
    }

    #[test]
    fn test_new_coordinator_defaults() {
        let sc = GroupCoordinator::new(key(), "carp0", 100);
        assert_eq!(sc.advbase(), CARP_DFLTINTV);
        assert_eq!(sc.peer(), CARP_GROUP_V4);
        assert_eq!(sc.leader_state(), VhostState::Init);
        assert!(sc.vhids().is_empty());
        assert_eq!(sc.groups(), &["carp".to_string()]);
    }

    #[test]
    fn test_address_brings_entries_to_backup() {
        let mut fx = Fixture::new();
        let sc = running(&mut fx, &[(5, 0)]);

        assert!(sc.is_up_and_running());
        assert_eq!(sc.state_of(5), Some(VhostState::Backup));
        assert_eq!(sc.link_state(), LinkState::Down);
        assert_eq!(fx.scheduler.pending(), 1);
        assert_eq!(fx.scheduler.next_deadline(), Some(std::time::Duration::from_secs(3)));
        assert_eq!(sc.lladdr(), [0, 0, 0x5e, 0, 1, 5]);
    }

    #[test]
    fn test_master_down_promotes_and_announces() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        let mut ctx = fx.ctx();

        sc.master_down(0, &mut ctx);
        assert_eq!(sc.state_of(5), Some(VhostState::Master));
        assert_eq!(sc.link_state(), LinkState::Up);
        drop(ctx);

        let sent = fx.transport.sent();
        assert!(matches!(sent[0], Sent::Advertisement(..)));
        assert!(sent.iter().any(|s| matches!(s, Sent::GratuitousArp(2, _, _))));
        assert_eq!(fx.stats.snapshot().preempt, 1);
        assert_eq!(fx.stats.snapshot().opackets, 1);
        // only the advertisement timer is left
        assert_eq!(fx.scheduler.pending(), 1);
    }

    #[test]
    fn test_delayed_arp_after_two_advertisements() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        let mut ctx = fx.ctx();
        sc.master_down(0, &mut ctx);
        sc.send_ad(0, &mut ctx);
        sc.send_ad(0, &mut ctx);
        sc.send_ad(0, &mut ctx);
        drop(ctx);

        let arps = fx
            .transport
            .sent()
            .iter()
            .filter(|s| matches!(s, Sent::GratuitousArp(..)))
            .count();
        assert_eq!(arps, 2);
    }

    #[test]
    fn test_bow_out_on_down() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        let mut ctx = fx.ctx();
        sc.master_down(0, &mut ctx);
        sc.set_up(false, &mut ctx);
        drop(ctx);

        let last = fx.transport.advertisements().last().copied().unwrap();
        assert_eq!(last.advbase, CARP_BOW_OUT);
        assert_eq!(last.advskew, CARP_BOW_OUT);
        assert_eq!(sc.state_of(5), Some(VhostState::Init));
        assert!(!sc.is_up());
        assert_eq!(fx.scheduler.pending(), 0);
    }

    #[test]
    fn test_load_mask_tracks_masters() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(1, 0), (2, 0), (3, 0)]);
        sc.set_balancing(Balancing::Ip);
        let mut ctx = fx.ctx();
        sc.update_lsmask();
        assert_eq!(sc.load_mask(), (0, 3));

        sc.master_down(0, &mut ctx);
        sc.master_down(2, &mut ctx);
        assert_eq!(sc.load_mask(), (0b101, 3));
    }

    #[test]
    fn test_should_drop_uses_bucket() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(1, 0), (2, 0)]);
        sc.set_balancing(Balancing::Ip);
        let mut ctx = fx.ctx();
        sc.update_lsmask();
        sc.master_down(0, &mut ctx);

        // 10.0.0.1 ^ 10.0.0.2 = 3, bucket 1 (not ours)
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(sc.should_drop(src, "10.0.0.2".parse().unwrap(), false));
        // 10.0.0.1 ^ 10.0.0.3 = 2, bucket 0 (ours)
        assert!(!sc.should_drop(src, "10.0.0.3".parse().unwrap(), false));
        // multicast traffic is never filtered
        assert!(!sc.should_drop(src, "10.0.0.2".parse().unwrap(), true));
    }

    #[test]
    fn test_send_error_hysteresis() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        let mut failing = MockTransport::new();
        failing
            .expect_send_advertisement()
            .times(3)
            .returning(|_, _| Err(TransportError::NoBuffers));

        let mut ctx = Ctx {
            transport: &mut failing,
            scheduler: &mut fx.scheduler,
            stats: &fx.stats,
            options: &fx.options,
            groups: &mut fx.groups,
            parents: &fx.parents,
            send_all: false,
        };
        for _ in 0..3 {
            sc.send_ad(0, &mut ctx);
        }
        assert_eq!(sc.own_demotion(), 1);
        assert_eq!(ctx.groups.get("carp"), 1);
        assert!(ctx.send_all);

        let mut ok = MockTransport::new();
        ok.expect_send_advertisement().times(3).returning(|_, _| Ok(()));
        ctx.transport = &mut ok;
        sc.send_ad(0, &mut ctx);
        sc.send_ad(0, &mut ctx);
        assert_eq!(sc.own_demotion(), 1);
        sc.send_ad(0, &mut ctx);
        assert_eq!(sc.own_demotion(), 0);
        assert_eq!(ctx.groups.get("carp"), 0);
        assert_eq!(fx.stats.snapshot().onomem, 3);
    }

    #[test]
    fn test_unicast_host_down_is_not_an_error() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        sc.set_peer("192.0.2.50".parse().unwrap());
        let mut mock = MockTransport::new();
        mock.expect_send_advertisement()
            .times(3)
            .returning(|_, _| Err(TransportError::HostDown));

        let mut ctx = Ctx {
            transport: &mut mock,
            scheduler: &mut fx.scheduler,
            stats: &fx.stats,
            options: &fx.options,
            groups: &mut fx.groups,
            parents: &fx.parents,
            send_all: false,
        };
        for _ in 0..3 {
            sc.send_ad(0, &mut ctx);
        }
        assert_eq!(sc.own_demotion(), 0);
        assert_eq!(sc.errors().1, 0);
    }

    #[test]
    fn test_parent_link_loss_suppresses() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);

        if let Some(p) = fx.parents.get_mut(&2) {
            p.link_up = false;
        }
        let mut ctx = fx.ctx();
        sc.carpdev_state(&mut ctx);
        assert!(sc.is_suppressed());
        assert!(!sc.is_running());
        assert_eq!(sc.state_of(5), Some(VhostState::Init));
        assert_eq!(sc.own_demotion(), 1);
        drop(ctx);

        if let Some(p) = fx.parents.get_mut(&2) {
            p.link_up = true;
        }
        let mut ctx = fx.ctx();
        sc.carpdev_state(&mut ctx);
        assert!(!sc.is_suppressed());
        assert_eq!(sc.state_of(5), Some(VhostState::Backup));
        assert_eq!(sc.own_demotion(), 0);
    }

    #[test]
    fn test_removing_last_address_goes_init() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        let mut ctx = fx.ctx();
        assert!(sc.remove_address("192.0.2.1".parse().unwrap(), &mut ctx));
        assert_eq!(sc.state_of(5), Some(VhostState::Init));
        assert!(!sc.is_up());
        assert!(!sc.remove_address("192.0.2.1".parse().unwrap(), &mut ctx));
    }

    #[test]
    fn test_group_membership_carries_demotion() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        let mut ctx = fx.ctx();
        sc.demote_adj(2, "test", &mut ctx);
        sc.join_group("uplink", &mut ctx);
        assert_eq!(ctx.groups.get("uplink"), 2);
        sc.leave_group("uplink", &mut ctx);
        assert_eq!(ctx.groups.get("uplink"), 0);
        assert_eq!(sc.demotion(ctx.groups), 2);
    }

    #[test]
    fn test_detach_undoes_demotion() {
        let mut fx = Fixture::new();
        let mut sc = running(&mut fx, &[(5, 0)]);
        let mut ctx = fx.ctx();
        sc.demote_adj(3, "test", &mut ctx);
        sc.detach(&mut ctx);
        assert_eq!(sc.own_demotion(), 0);
        assert_eq!(ctx.groups.get("carp"), 0);
        assert_eq!(sc.carpdev(), None);
        assert!(!sc.is_running());
        drop(ctx);
        assert_eq!(fx.scheduler.pending(), 0);
    }
}
