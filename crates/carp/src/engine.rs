//! The CARP engine.
//!
//! Owns every coordinator, the parent interfaces they attach to, the
//! interface group demotion counters and the protocol counters. All state
//! changes go through `&mut self`, which makes the engine its own exclusion
//! domain; wrap it in one lock to share it between tasks.

use crate::admin::{CarpRequest, CarpStatus, Privilege, ValidatedRequest, validate_advbase, validate_vhids};
use crate::coordinator::{Ctx, GroupCoordinator};
use crate::demote::InterfaceGroups;
use crate::error::{CarpError, Result};
use crate::input::{self, Ipv4Info};
use crate::packet::Advertisement;
use crate::stats::CarpStats;
use crate::timer::{CoordinatorKey, ManualScheduler, Scheduler, TimerHandle, TimerKind};
use crate::transport::Transport;
use crate::types::{CARP_IFGROUP, CarpOptions, Family, MacAddr, VhostState};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, trace};

/// A physical link coordinators can attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentInterface {
    pub name: String,
    pub index: u32,
    pub lladdr: MacAddr,
    /// Administratively up
    pub up: bool,
    /// Carrier present
    pub link_up: bool,
    pub multicast: bool,
    pub ethernet: bool,
    /// Does not hear its own transmissions
    pub simplex: bool,
}

impl ParentInterface {
    /// An up, multicast capable ethernet link
    pub fn ethernet(name: &str, index: u32, lladdr: MacAddr) -> Self {
        Self {
            name: name.to_string(),
            index,
            lladdr,
            up: true,
            link_up: true,
            multicast: true,
            ethernet: true,
            simplex: true,
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    coordinator: Option<GroupCoordinator>,
}

pub struct CarpEngine<S: Scheduler, T: Transport> {
    options: CarpOptions,
    stats: CarpStats,
    scheduler: S,
    transport: T,
    parents: BTreeMap<u32, ParentInterface>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    names: HashMap<String, CoordinatorKey>,
    groups: InterfaceGroups,
    /// Set while every master is being asked to advertise
    sending_all: bool,
    next_ifindex: u32,
}

impl<S: Scheduler, T: Transport> CarpEngine<S, T> {
    pub fn new(options: CarpOptions, scheduler: S, transport: T) -> Self {
        let mut groups = InterfaceGroups::new();
        groups.ensure(CARP_IFGROUP);
        Self {
            options,
            stats: CarpStats::new(),
            scheduler,
            transport,
            parents: BTreeMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            names: HashMap::new(),
            groups,
            sending_all: false,
            next_ifindex: 1,
        }
    }

    pub fn options(&self) -> &CarpOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: CarpOptions) {
        self.options = options;
    }

    pub fn stats(&self) -> &CarpStats {
        &self.stats
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn groups(&self) -> &InterfaceGroups {
        &self.groups
    }

    pub fn coordinator(&self, name: &str) -> Option<&GroupCoordinator> {
        self.names.get(name).and_then(|key| self.get(*key))
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &GroupCoordinator> {
        self.slots.iter().filter_map(|s| s.coordinator.as_ref())
    }

    pub fn parent(&self, name: &str) -> Option<&ParentInterface> {
        self.parents.values().find(|p| p.name == name)
    }

    /// Name of the first coordinator attached to a parent link
    pub fn coordinator_on(&self, parent: &str) -> Option<&str> {
        let index = self.parent(parent)?.index;
        self.siblings(index)
            .first()
            .and_then(|key| self.get(*key))
            .map(|sc| sc.name())
    }

    fn get(&self, key: CoordinatorKey) -> Option<&GroupCoordinator> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.coordinator.as_ref())
    }

    fn keys(&self) -> Vec<CoordinatorKey> {
        self.coordinators().map(|sc| sc.key).collect()
    }

    fn lookup(&self, name: &str) -> Result<CoordinatorKey> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| CarpError::NoSuchInterface(name.to_string()))
    }

    fn parent_index(&self, name: &str) -> Result<u32> {
        self.parent(name)
            .map(|p| p.index)
            .ok_or_else(|| CarpError::NoSuchInterface(name.to_string()))
    }

    /// Coordinators on one parent link, ordered by leader vhid
    fn siblings(&self, carpdev: u32) -> Vec<CoordinatorKey> {
        let mut found: Vec<(u8, u32, CoordinatorKey)> = self
            .coordinators()
            .filter(|sc| sc.carpdev() == Some(carpdev))
            .map(|sc| (sc.entries().first().map(|e| e.vhid()).unwrap_or(0), sc.ifindex(), sc.key))
            .collect();
        found.sort_unstable();
        found.into_iter().map(|(_, _, key)| key).collect()
    }

    /// Run `f` on a coordinator with the engine's services at hand.
    ///
    /// Returns `None` for a stale key.
    fn with_coordinator<R>(
        &mut self,
        key: CoordinatorKey,
        f: impl FnOnce(&mut GroupCoordinator, &mut Ctx<'_>) -> R,
    ) -> Option<R> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let sc = slot.coordinator.as_mut()?;
        let mut ctx = Ctx {
            transport: &mut self.transport,
            scheduler: &mut self.scheduler,
            stats: &self.stats,
            options: &self.options,
            groups: &mut self.groups,
            parents: &self.parents,
            send_all: false,
        };
        let out = f(sc, &mut ctx);
        if ctx.send_all {
            self.send_all();
        }
        Some(out)
    }

    fn with_named<R>(&mut self, name: &str, f: impl FnOnce(&mut GroupCoordinator, &mut Ctx<'_>) -> R) -> Result<R> {
        let key = self.lookup(name)?;
        self.with_coordinator(key, f)
            .ok_or_else(|| CarpError::NoSuchInterface(name.to_string()))
    }

    /// Advertise from every master on every ethernet link.
    fn send_all(&mut self) {
        if self.sending_all {
            return;
        }
        self.sending_all = true;
        debug!("advertising from every master");
        for key in self.keys() {
            let eligible = self.get(key).is_some_and(|sc| {
                sc.is_up_and_running()
                    && sc
                        .carpdev()
                        .and_then(|idx| self.parents.get(&idx))
                        .is_some_and(|p| p.ethernet)
            });
            if eligible {
                self.with_coordinator(key, |sc, ctx| sc.send_ad_masters(ctx));
            }
        }
        self.sending_all = false;
    }

    // Interfaces

    pub fn create_coordinator(&mut self, name: &str) -> Result<()> {
        if self.names.contains_key(name) || self.parent(name).is_some() {
            return Err(CarpError::AlreadyExists(name.to_string()));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let ifindex = self.next_ifindex;
        self.next_ifindex += 1;

        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let key = CoordinatorKey {
            index,
            generation: slot.generation,
        };
        slot.coordinator = Some(GroupCoordinator::new(key, name, ifindex));
        self.names.insert(name.to_string(), key);
        self.groups.ensure(CARP_IFGROUP);

        info!(iface = %name, ifindex, "coordinator created");
        Ok(())
    }

    /// Tear a coordinator down, cancelling its timers first
    pub fn destroy_coordinator(&mut self, name: &str) -> Result<()> {
        let key = self.lookup(name)?;
        self.with_coordinator(key, |sc, ctx| {
            sc.detach(ctx);
            for group in sc.groups().to_vec() {
                sc.leave_group(&group, ctx);
            }
        });

        self.names.remove(name);
        if let Some(slot) = self.slots.get_mut(key.index as usize) {
            slot.coordinator = None;
            self.free.push(key.index);
        }
        info!(iface = %name, "coordinator destroyed");
        Ok(())
    }

    pub fn register_interface(&mut self, parent: ParentInterface) -> Result<()> {
        if self.parents.contains_key(&parent.index)
            || self.parent(&parent.name).is_some()
            || self.names.contains_key(&parent.name)
        {
            return Err(CarpError::AlreadyExists(parent.name));
        }
        debug!(iface = %parent.name, index = parent.index, "parent interface registered");
        self.parents.insert(parent.index, parent);
        Ok(())
    }

    /// Parent link went up/down or lost carrier.
    pub fn set_parent_state(&mut self, name: &str, up: bool, link_up: bool) -> Result<()> {
        let index = self.parent_index(name)?;
        if let Some(parent) = self.parents.get_mut(&index) {
            parent.up = up;
            parent.link_up = link_up;
        }
        debug!(iface = %name, up, link_up, "parent state changed");
        for key in self.siblings(index) {
            self.with_coordinator(key, |sc, ctx| sc.carpdev_state(ctx));
        }
        Ok(())
    }

    /// Forget a parent link, detaching everything on it.
    pub fn remove_interface(&mut self, name: &str) -> Result<()> {
        let index = self.parent_index(name)?;
        for key in self.siblings(index) {
            self.with_coordinator(key, |sc, ctx| sc.detach(ctx));
        }
        self.parents.remove(&index);
        info!(iface = %name, "parent interface removed");
        Ok(())
    }

    fn check_eligible(&self, index: u32) -> Result<()> {
        let Some(parent) = self.parents.get(&index) else {
            return Err(CarpError::NoSuchInterface(index.to_string()));
        };
        if !parent.multicast {
            return Err(CarpError::NotMulticastCapable(parent.name.clone()));
        }
        if !parent.ethernet {
            return Err(CarpError::UnsupportedInterface(parent.name.clone()));
        }
        Ok(())
    }

    fn check_vhid_clash(&self, key: CoordinatorKey, carpdev: u32, vhids: &[u8]) -> Result<()> {
        for sc in self.coordinators() {
            if sc.key == key || sc.carpdev() != Some(carpdev) {
                continue;
            }
            if let Some(vhid) = vhids.iter().find(|v| sc.entry(**v).is_some()) {
                return Err(CarpError::DuplicateVhid(*vhid));
            }
        }
        Ok(())
    }

    /// Attach a coordinator to a parent link
    pub fn set_carpdev(&mut self, name: &str, parent: &str) -> Result<()> {
        let key = self.lookup(name)?;
        let index = self.parent_index(parent)?;
        self.check_eligible(index)?;

        let vhids: Vec<u8> = self
            .get(key)
            .map(|sc| sc.vhids().iter().map(|&(v, _)| v).collect())
            .unwrap_or_default();
        self.check_vhid_clash(key, index, &vhids)?;

        self.with_named(name, |sc, ctx| sc.attach(index, ctx))
    }

    pub fn detach(&mut self, name: &str) -> Result<()> {
        self.with_named(name, |sc, ctx| sc.detach(ctx))
    }

    // Addresses and flags

    pub fn add_address(&mut self, name: &str, addr: IpAddr) -> Result<()> {
        let key = self.lookup(name)?;
        if self.get(key).and_then(|sc| sc.carpdev()).is_none() {
            return Err(CarpError::NoParentInterface(name.to_string()));
        }
        self.with_named(name, |sc, ctx| sc.add_address(addr, ctx))?;
        debug!(iface = %name, %addr, "address added");
        Ok(())
    }

    pub fn remove_address(&mut self, name: &str, addr: IpAddr) -> Result<()> {
        if !self.with_named(name, |sc, ctx| sc.remove_address(addr, ctx))? {
            return Err(CarpError::invalid(format!("{addr} is not configured on {name}")));
        }
        debug!(iface = %name, %addr, "address removed");
        Ok(())
    }

    /// Set a custom link-layer address
    pub fn set_lladdr(&mut self, name: &str, lladdr: MacAddr) -> Result<()> {
        self.with_named(name, |sc, ctx| {
            sc.set_lladdr_raw(lladdr);
            if sc.lladdr_changed() {
                sc.set_enaddr(ctx);
            }
        })
    }

    pub fn set_up(&mut self, name: &str) -> Result<()> {
        self.with_named(name, |sc, ctx| sc.set_up(true, ctx))
    }

    /// Administrative down, bowing out of every mastership
    pub fn set_down(&mut self, name: &str) -> Result<()> {
        self.with_named(name, |sc, ctx| sc.set_up(false, ctx))
    }

    // Configuration

    /// Apply a configuration request.
    ///
    /// Everything is validated first; on error nothing has changed.
    pub fn set_request(&mut self, name: &str, req: &CarpRequest, privilege: Privilege) -> Result<()> {
        if privilege != Privilege::Privileged {
            return Err(CarpError::PermissionDenied);
        }
        let key = self.lookup(name)?;

        let carpdev = match &req.carpdev {
            Some(parent) => {
                let index = self.parent_index(parent)?;
                self.check_eligible(index)?;
                Some(index)
            }
            None => None,
        };
        let vhids = match &req.vhids {
            Some(list) => validate_vhids(list)?,
            None => None,
        };
        let advbase = req.advbase.map(validate_advbase).transpose()?;

        let current = self.get(key).map(|sc| (sc.carpdev(), sc.vhids())).unwrap_or_default();
        if let Some(target) = carpdev.or(current.0) {
            let ids: Vec<u8> = vhids.as_ref().unwrap_or(&current.1).iter().map(|&(v, _)| v).collect();
            self.check_vhid_clash(key, target, &ids)?;
        }

        if let Some(index) = carpdev {
            self.with_coordinator(key, |sc, ctx| sc.attach(index, ctx));
        }
        let validated = ValidatedRequest {
            vhids,
            advbase,
            balancing: req.balancing,
            key: req.key,
            peer: req.peer,
            state: req.state,
        };
        self.with_named(name, |sc, ctx| sc.apply(validated, ctx))?;

        info!(iface = %name, "configuration updated");
        Ok(())
    }

    /// Current configuration. The key is zeroed for unprivileged callers.
    pub fn get_request(&self, name: &str, privilege: Privilege) -> Result<CarpStatus> {
        let key = self.lookup(name)?;
        let sc = self
            .get(key)
            .ok_or_else(|| CarpError::NoSuchInterface(name.to_string()))?;
        let carpdev = sc
            .carpdev()
            .and_then(|idx| self.parents.get(&idx))
            .map(|p| p.name.clone());
        Ok(CarpStatus::from_coordinator(sc, carpdev, privilege))
    }

    pub fn force_state(&mut self, name: &str, state: VhostState) -> Result<()> {
        self.set_request(name, &CarpRequest::new().state(state), Privilege::Privileged)
    }

    // Groups and demotion

    pub fn join_group(&mut self, name: &str, group: &str) -> Result<()> {
        if group.is_empty() {
            return Err(CarpError::invalid("empty group name"));
        }
        self.with_named(name, |sc, ctx| sc.join_group(group, ctx))
    }

    pub fn leave_group(&mut self, name: &str, group: &str) -> Result<()> {
        self.with_named(name, |sc, ctx| sc.leave_group(group, ctx))
    }

    /// Adjust the demotion of one coordinator and its groups
    pub fn demote(&mut self, name: &str, adj: i32, reason: &str) -> Result<()> {
        self.with_named(name, |sc, ctx| sc.demote_adj(adj, reason, ctx))
    }

    /// Operator adjustment of a group's demotion counter.
    ///
    /// Returns the new value. A demoted group advertises at once from every
    /// master in it so peers take over quickly.
    pub fn set_group_demote(&mut self, group: &str, adj: i32) -> Result<i32> {
        let value = self
            .groups
            .try_adjust_bounded(group, adj)
            .ok_or_else(|| CarpError::invalid(format!("demotion of group {group} out of range")))?;
        info!(group = %group, adj, demote = value, "group demotion set");

        if value > 0 {
            let members: Vec<CoordinatorKey> = self
                .coordinators()
                .filter(|sc| sc.is_up_and_running() && sc.groups().iter().any(|g| g == group))
                .map(|sc| sc.key)
                .collect();
            for key in members {
                self.with_coordinator(key, |sc, ctx| sc.send_ad_masters(ctx));
            }
        }
        Ok(value)
    }

    // Data path

    fn eligible_v4(&self, ifname: &str, multicast: bool) -> bool {
        if self.names.contains_key(ifname) {
            return true;
        }
        self.parent(ifname)
            .is_some_and(|p| p.ethernet && (multicast || !self.siblings(p.index).is_empty()))
    }

    /// A raw IPv4 datagram carrying CARP arrived on `ifname`.
    pub fn input_v4(&mut self, ifname: &str, packet: &[u8]) {
        self.stats.ipackets.inc();
        if !self.options.allow {
            return;
        }

        let info = match Ipv4Info::peek(packet) {
            Ok(info) => info,
            Err(rejection) => {
                rejection.count(&self.stats);
                return;
            }
        };

        if !self.eligible_v4(ifname, info.is_multicast()) {
            self.stats.badif.inc();
            debug!(iface = %ifname, "packet received on non-carp interface");
            return;
        }

        match input::validate_v4(packet, &info) {
            Ok(advert) => self.deliver(ifname, Family::V4, &advert, info.is_multicast()),
            Err(rejection) => {
                rejection.count(&self.stats);
                debug!(iface = %ifname, src = %info.src, ?rejection, "advertisement dropped");
            }
        }
    }

    /// The CARP payload of an IPv6 packet arrived on `ifname`.
    pub fn input_v6(&mut self, ifname: &str, hop_limit: u8, payload: &[u8]) {
        self.stats.ipackets6.inc();
        if !self.options.allow {
            return;
        }

        if !self.names.contains_key(ifname) {
            self.stats.badif.inc();
            debug!(iface = %ifname, "packet received on non-carp interface");
            return;
        }

        match input::validate_v6(hop_limit, payload) {
            Ok(advert) => self.deliver(ifname, Family::V6, &advert, true),
            Err(rejection) => {
                rejection.count(&self.stats);
                debug!(iface = %ifname, ?rejection, "advertisement dropped");
            }
        }
    }

    /// Hand a validated advertisement to the coordinator owning its vhid.
    pub fn deliver(&mut self, ifname: &str, family: Family, advert: &Advertisement, multicast: bool) {
        let carpdev = match self.names.get(ifname) {
            // the parent went away while the packet was in flight
            Some(key) => match self.get(*key).and_then(|sc| sc.carpdev()) {
                Some(index) => index,
                None => return,
            },
            None => match self.parent(ifname) {
                Some(parent) => parent.index,
                None => {
                    self.stats.badif.inc();
                    return;
                }
            },
        };

        let mut target = None;
        for key in self.siblings(carpdev) {
            let Some(sc) = self.get(key) else {
                continue;
            };
            if family == Family::V4 && multicast != sc.peer().is_multicast() {
                continue;
            }
            if let Some(idx) = sc.entry_index(advert.vhid) {
                target = Some((key, idx));
                break;
            }
        }

        let Some((key, idx)) = target.filter(|(key, _)| self.get(*key).is_some_and(|sc| sc.is_up_and_running()))
        else {
            self.stats.badvhid.inc();
            trace!(iface = %ifname, vhid = advert.vhid, "no running virtual host for vhid");
            return;
        };
        self.with_coordinator(key, |sc, ctx| sc.receive(idx, family, advert, ctx));
    }

    /// A timer armed through the scheduler fired.
    pub fn on_expire(&mut self, handle: TimerHandle) {
        let id = handle.id;
        let fired = self.with_coordinator(id.coordinator, |sc, ctx| {
            if id.epoch != sc.epoch() {
                return false;
            }
            let Some(idx) = sc.entry_index(id.vhid) else {
                return false;
            };
            if !sc.claim_timer(idx, &handle) {
                return false;
            }
            match id.kind {
                TimerKind::Advertisement => sc.send_ad(idx, ctx),
                TimerKind::MasterDownV4 | TimerKind::MasterDownV6 => sc.master_down(idx, ctx),
            }
            true
        });
        if fired != Some(true) {
            trace!(vhid = id.vhid, kind = ?id.kind, "stale timer ignored");
        }
    }

    /// Name of the coordinator on `parent` that owns frames sent to `dst`
    pub fn accepts_ether(&self, parent: &str, dst: &MacAddr) -> Option<&str> {
        let index = self.parent(parent)?.index;
        self.siblings(index)
            .into_iter()
            .filter_map(|key| self.get(key))
            .find(|sc| sc.accepts_ether(dst))
            .map(|sc| sc.name())
    }

    /// Whether the load balancing filter rejects this flow on `name`
    pub fn should_drop(&self, name: &str, src: IpAddr, dst: IpAddr, link_multicast: bool) -> bool {
        self.coordinator(name)
            .is_some_and(|sc| sc.should_drop(src, dst, link_multicast))
    }

    pub fn may_transmit(&self, name: &str) -> bool {
        self.coordinator(name).is_some_and(|sc| sc.may_transmit())
    }

    pub fn is_master(&self, name: &str) -> bool {
        self.coordinator(name)
            .is_some_and(|sc| sc.leader_state().is_master())
    }

    // Queries

    pub fn state_of(&self, name: &str, vhid: u8) -> Option<VhostState> {
        self.coordinator(name).and_then(|sc| sc.state_of(vhid))
    }

    /// `(load_mask, load_count)` of a coordinator
    pub fn load_mask(&self, name: &str) -> Option<(u32, u32)> {
        self.coordinator(name).map(|sc| sc.load_mask())
    }

    /// Demotion counter of an interface group
    pub fn demote_count(&self, group: &str) -> i32 {
        self.groups.get(group)
    }
}

impl<T: Transport> CarpEngine<ManualScheduler, T> {
    /// Virtual time
    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    /// Fire every timer due within `by`, in deadline order.
    ///
    /// Returns the number of timers fired.
    pub fn advance(&mut self, by: Duration) -> usize {
        let until = self.scheduler.now() + by;
        let mut fired = 0;
        while let Some(handle) = self.scheduler.pop_due(until) {
            self.on_expire(handle);
            fired += 1;
        }
        self.scheduler.set_now(until);
        fired
    }

    /// Fire the next pending timer, if any
    pub fn step(&mut self) -> Option<Duration> {
        let deadline = self.scheduler.next_deadline()?;
        let handle = self.scheduler.pop_due(deadline)?;
        self.on_expire(handle);
        Some(deadline)
    }
}
