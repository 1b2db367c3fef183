//! Group table: membership, join policies, classes and fanout resolution.
//!
//! Groups are fixed slots keyed by gid. Control-plane mutation happens
//! under a per-group lock; the data plane reads the per-class member
//! bitmasks and the computation pointer lock-free (atomics plus an
//! `ArcSwap` snapshot, so a swapped-out computation stays valid for
//! evaluators still inside their batch and is finalized when the last
//! reference drops).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Deserialize;

use pfq_common::{Statistics, ANY_GROUP, CLASS_DEFAULT_MASK, MAX_CLASS, MAX_GID, MAX_ID};

use crate::error::{PfqError, Result};
use crate::lang::{Computation, Fanout, FanoutKind};
use crate::stats::Counters;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Group access policy, fixed by the first non-`Undefined` joiner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    /// Accept whatever policy the group has (or defer fixing it).
    #[default]
    Undefined,
    /// Exactly one member.
    Priv,
    /// Joiners must belong to the creator's process.
    Restricted,
    /// Any endpoint may join.
    Shared,
}

// ---------------------------------------------------------------------------
// Group Slot
// ---------------------------------------------------------------------------

struct GroupCtrl {
    used: bool,
    policy: GroupPolicy,
    /// Endpoint that created the group.
    owner: Option<usize>,
    /// Creator's process id (restricted-policy admission).
    pid: u32,
    /// Per-endpoint class membership masks.
    members: [u16; MAX_ID],
}

impl GroupCtrl {
    const fn empty() -> Self {
        GroupCtrl {
            used: false,
            policy: GroupPolicy::Undefined,
            owner: None,
            pid: 0,
            members: [0; MAX_ID],
        }
    }

    fn member_count(&self) -> usize {
        self.members.iter().filter(|&&m| m != 0).count()
    }
}

/// VLAN filter table: 4096 vids plus the untagged pseudo-entry.
const VLAN_TABLE_LEN: usize = 4097;

struct Group {
    ctrl: Mutex<GroupCtrl>,
    /// Per-class endpoint bitmasks, read lock-free by the data plane.
    classes: [AtomicU64; MAX_CLASS],
    computation: ArcSwapOption<Computation>,
    /// Interfaces captured at group granularity (bit = ifindex).
    devs: AtomicU64,
    vlan_enabled: AtomicBool,
    vlan_admit: Box<[AtomicBool]>,
    stats: Counters,
}

impl Group {
    fn new(cpus: usize) -> Self {
        Group {
            ctrl: Mutex::new(GroupCtrl::empty()),
            classes: std::array::from_fn(|_| AtomicU64::new(0)),
            computation: ArcSwapOption::empty(),
            devs: AtomicU64::new(0),
            vlan_enabled: AtomicBool::new(false),
            vlan_admit: (0..VLAN_TABLE_LEN).map(|_| AtomicBool::new(false)).collect(),
            stats: Counters::new(cpus),
        }
    }

    /// Rebuild the per-class atomics from the membership table. Called
    /// under the ctrl lock.
    fn publish_classes(&self, ctrl: &GroupCtrl) {
        for class in 0..MAX_CLASS {
            let mut mask = 0u64;
            for (sock, &m) in ctrl.members.iter().enumerate() {
                if m & (1 << class) != 0 {
                    mask |= 1 << sock;
                }
            }
            self.classes[class].store(mask, Ordering::Release);
        }
    }

    /// Tear the slot down once the last member left.
    fn dispose(&self, ctrl: &mut GroupCtrl) {
        *ctrl = GroupCtrl::empty();
        for class in &self.classes {
            class.store(0, Ordering::Release);
        }
        self.computation.store(None);
        self.devs.store(0, Ordering::Release);
        self.vlan_enabled.store(false, Ordering::Release);
        for slot in self.vlan_admit.iter() {
            slot.store(false, Ordering::Relaxed);
        }
        self.stats.reset();
    }
}

// ---------------------------------------------------------------------------
// Fanout Resolution
// ---------------------------------------------------------------------------

/// Deterministic selection of the `hash`-th set bit of `mask`.
fn select_member(mask: u64, hash: u32) -> u64 {
    let n = mask.count_ones();
    if n == 0 {
        return 0;
    }
    let mut m = mask;
    for _ in 0..(hash % n) {
        m &= m - 1;
    }
    m & m.wrapping_neg()
}

// ---------------------------------------------------------------------------
// Group Table
// ---------------------------------------------------------------------------

pub struct GroupTable {
    groups: Vec<Group>,
}

impl GroupTable {
    pub fn new(cpus: usize) -> Self {
        GroupTable {
            groups: (0..MAX_GID).map(|_| Group::new(cpus)).collect(),
        }
    }

    fn group(&self, gid: usize) -> Result<&Group> {
        self.groups
            .get(gid)
            .ok_or_else(|| PfqError::invalid(format!("gid {} out of range", gid)))
    }

    fn used_group(&self, gid: usize) -> Result<&Group> {
        let group = self.group(gid)?;
        if !group.ctrl.lock().used {
            return Err(PfqError::NotFound(format!("group {}", gid)));
        }
        Ok(group)
    }

    /// Join `sock` to a group. `gid == ANY_GROUP` picks the smallest free
    /// gid. Joining a group the endpoint is already in is idempotent (the
    /// class mask is extended). Returns the gid joined.
    pub fn join(
        &self,
        gid: i32,
        sock: usize,
        class_mask: u16,
        policy: GroupPolicy,
        pid: u32,
    ) -> Result<usize> {
        let class_mask = if class_mask == 0 {
            CLASS_DEFAULT_MASK
        } else {
            class_mask
        };

        let gid = if gid == ANY_GROUP {
            self.first_free_gid()?
        } else {
            usize::try_from(gid)
                .ok()
                .filter(|&g| g < MAX_GID)
                .ok_or_else(|| PfqError::invalid(format!("bad gid {}", gid)))?
        };

        let group = self.group(gid)?;
        let mut ctrl = group.ctrl.lock();

        if !ctrl.used {
            ctrl.used = true;
            ctrl.policy = policy;
            ctrl.owner = Some(sock);
            ctrl.pid = pid;
        } else {
            let rejoining = ctrl.members[sock] != 0;

            // an undefined group adopts the first concrete policy request
            if ctrl.policy == GroupPolicy::Undefined && policy != GroupPolicy::Undefined {
                ctrl.policy = policy;
            } else if policy != GroupPolicy::Undefined && policy != ctrl.policy {
                return Err(PfqError::AccessDenied);
            }

            match ctrl.policy {
                GroupPolicy::Priv => {
                    if !rejoining {
                        return Err(PfqError::Busy);
                    }
                }
                GroupPolicy::Restricted => {
                    if ctrl.pid != pid {
                        return Err(PfqError::AccessDenied);
                    }
                }
                GroupPolicy::Shared | GroupPolicy::Undefined => {}
            }
        }

        ctrl.members[sock] |= class_mask;
        group.publish_classes(&ctrl);
        Ok(gid)
    }

    fn first_free_gid(&self) -> Result<usize> {
        for (gid, group) in self.groups.iter().enumerate() {
            if !group.ctrl.lock().used {
                return Ok(gid);
            }
        }
        Err(PfqError::NoMemory)
    }

    /// Remove `sock` from every class of the group. Disposes the group
    /// (finalizing its computation) when the last member leaves.
    pub fn leave(&self, gid: usize, sock: usize) -> Result<()> {
        let group = self.used_group(gid)?;
        let mut ctrl = group.ctrl.lock();
        if ctrl.members[sock] == 0 {
            return Err(PfqError::AccessDenied);
        }
        ctrl.members[sock] = 0;
        if ctrl.member_count() == 0 {
            group.dispose(&mut ctrl);
        } else {
            group.publish_classes(&ctrl);
        }
        Ok(())
    }

    /// Remove `sock` from every group it joined (endpoint close).
    pub fn leave_all(&self, sock: usize) {
        for gid in 0..MAX_GID {
            let _ = self.leave(gid, sock);
        }
    }

    pub fn is_member(&self, gid: usize, sock: usize) -> bool {
        self.groups
            .get(gid)
            .map(|g| {
                let ctrl = g.ctrl.lock();
                ctrl.used && ctrl.members[sock] != 0
            })
            .unwrap_or(false)
    }

    /// Bitmask of gids the endpoint belongs to.
    pub fn groups_mask(&self, sock: usize) -> u64 {
        let mut mask = 0u64;
        for (gid, group) in self.groups.iter().enumerate() {
            let ctrl = group.ctrl.lock();
            if ctrl.used && ctrl.members[sock] != 0 {
                mask |= 1 << gid;
            }
        }
        mask
    }

    // -----------------------------------------------------------------------
    // Computation
    // -----------------------------------------------------------------------

    /// Atomically install a freshly compiled computation. The previous one
    /// stays valid for in-flight evaluators and is finalized when the last
    /// reference drops. Caller must be a member.
    pub fn set_computation(&self, gid: usize, sock: usize, comp: Computation) -> Result<()> {
        let group = self.used_group(gid)?;
        if !self.is_member(gid, sock) {
            return Err(PfqError::AccessDenied);
        }
        group.computation.store(Some(Arc::new(comp)));
        Ok(())
    }

    /// Data-plane snapshot of the group's computation.
    pub fn computation(&self, gid: usize) -> Option<Arc<Computation>> {
        self.groups.get(gid).and_then(|g| g.computation.load_full())
    }

    // -----------------------------------------------------------------------
    // Capture Bindings
    // -----------------------------------------------------------------------

    pub fn bind_dev(&self, gid: usize, sock: usize, ifindex: i32) -> Result<()> {
        let group = self.used_group(gid)?;
        if !self.is_member(gid, sock) {
            return Err(PfqError::AccessDenied);
        }
        if !(0..64).contains(&ifindex) {
            return Err(PfqError::invalid(format!("ifindex {} out of range", ifindex)));
        }
        group.devs.fetch_or(1 << ifindex, Ordering::AcqRel);
        Ok(())
    }

    pub fn unbind_dev(&self, gid: usize, sock: usize, ifindex: i32) -> Result<()> {
        let group = self.used_group(gid)?;
        if !self.is_member(gid, sock) {
            return Err(PfqError::AccessDenied);
        }
        if !(0..64).contains(&ifindex) {
            return Err(PfqError::invalid(format!("ifindex {} out of range", ifindex)));
        }
        group.devs.fetch_and(!(1 << ifindex), Ordering::AcqRel);
        Ok(())
    }

    /// Data plane: does this group capture from `ifindex`?
    pub fn captures(&self, gid: usize, ifindex: i32) -> bool {
        if !(0..64).contains(&ifindex) {
            return false;
        }
        self.groups
            .get(gid)
            .map(|g| g.devs.load(Ordering::Acquire) & (1 << ifindex) != 0)
            .unwrap_or(false)
    }

    /// Gids that are live and capture from `ifindex`.
    pub fn capturing_groups(&self, ifindex: i32) -> Vec<usize> {
        (0..MAX_GID)
            .filter(|&gid| self.captures(gid, ifindex))
            .collect()
    }

    // -----------------------------------------------------------------------
    // VLAN Filters
    // -----------------------------------------------------------------------

    pub fn vlan_filters_enable(&self, gid: usize, sock: usize, enabled: bool) -> Result<()> {
        let group = self.used_group(gid)?;
        if !self.is_member(gid, sock) {
            return Err(PfqError::AccessDenied);
        }
        group.vlan_enabled.store(enabled, Ordering::Release);
        if !enabled {
            for slot in group.vlan_admit.iter() {
                slot.store(false, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn vlan_set_filter(&self, gid: usize, sock: usize, vid: u16, admit: bool) -> Result<()> {
        let group = self.used_group(gid)?;
        if !self.is_member(gid, sock) {
            return Err(PfqError::AccessDenied);
        }
        if !group.vlan_enabled.load(Ordering::Acquire) {
            return Err(PfqError::invalid("vlan filters are not enabled"));
        }
        let vid = vid as usize;
        if vid >= VLAN_TABLE_LEN {
            return Err(PfqError::invalid(format!("vid {} out of range", vid)));
        }
        group.vlan_admit[vid].store(admit, Ordering::Release);
        Ok(())
    }

    /// Data plane: whether the group's vlan filter admits this frame.
    /// `None` means untagged.
    pub fn vlan_admits(&self, gid: usize, vid: Option<u16>) -> bool {
        let group = match self.groups.get(gid) {
            Some(g) => g,
            None => return false,
        };
        if !group.vlan_enabled.load(Ordering::Acquire) {
            return true;
        }
        let idx = match vid {
            Some(v) => (v & pfq_common::VLAN_VID_MASK) as usize,
            None => pfq_common::VLAN_UNTAGGED as usize,
        };
        group.vlan_admit[idx].load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Fanout + Stats
    // -----------------------------------------------------------------------

    /// Resolve a fanout decision into an endpoint bitmask.
    pub fn resolve_fanout(&self, gid: usize, fanout: &Fanout) -> u64 {
        let group = match self.groups.get(gid) {
            Some(g) => g,
            None => return 0,
        };
        match fanout.kind {
            FanoutKind::Drop | FanoutKind::Sink => 0,
            FanoutKind::Copy | FanoutKind::Steer => {
                let mut mask = 0u64;
                for class in 0..MAX_CLASS {
                    if fanout.class_mask & (1 << class) != 0 {
                        mask |= group.classes[class].load(Ordering::Acquire);
                    }
                }
                if fanout.kind == FanoutKind::Steer {
                    select_member(mask, fanout.hash)
                } else {
                    mask
                }
            }
        }
    }

    /// Group counters (data plane).
    pub fn counters(&self, gid: usize) -> Option<&Counters> {
        self.groups.get(gid).map(|g| &g.stats)
    }

    /// Control plane: counter snapshot, membership required.
    pub fn stats(&self, gid: usize, sock: usize) -> Result<Statistics> {
        let group = self.used_group(gid)?;
        if !self.is_member(gid, sock) {
            return Err(PfqError::AccessDenied);
        }
        Ok(group.stats.snapshot())
    }
}
