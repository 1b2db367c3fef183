//! Batch scratch state for the Rx path.
//!
//! Each received batch carries a garbage-collected buffer log: one entry
//! per packet recording the forwarding plan the computation emitted
//! (target devices, kernel handback, clone budget). Batches are scratch —
//! executed or dropped at the batch boundary, never persisted. The
//! per-CPU `GcBatch` keeps the packet buffers alive until the lazy
//! forwarding sweep has run.

use std::sync::Arc;

use pfq_common::GC_LOG_LEN;

use crate::skbuff::SkBuff;

// ---------------------------------------------------------------------------
// Per-Packet Forwarding Log
// ---------------------------------------------------------------------------

/// Forwarding plan for one packet.
#[derive(Clone, Copy, Debug)]
pub struct GcLog {
    devs: [(i32, i32); GC_LOG_LEN],
    num_devs: usize,
    /// Hand the packet back to the kernel stack as well.
    pub to_kernel: bool,
    /// Forwards still owed; the sweep uses it to decide clone vs move.
    pub xmit_todo: usize,
}

impl GcLog {
    pub fn new() -> Self {
        GcLog {
            devs: [(0, 0); GC_LOG_LEN],
            num_devs: 0,
            to_kernel: false,
            xmit_todo: 0,
        }
    }

    pub fn clear(&mut self) {
        self.num_devs = 0;
        self.to_kernel = false;
        self.xmit_todo = 0;
    }

    /// Record a forwarding target. Returns `false` when the log is full
    /// (the forward is silently dropped, as in the bridge path).
    pub fn push(&mut self, ifindex: i32, hw_queue: i32) -> bool {
        if self.num_devs >= GC_LOG_LEN {
            return false;
        }
        self.devs[self.num_devs] = (ifindex, hw_queue);
        self.num_devs += 1;
        self.xmit_todo += 1;
        true
    }

    pub fn num_devs(&self) -> usize {
        self.num_devs
    }

    pub fn targets(&self) -> &[(i32, i32)] {
        &self.devs[..self.num_devs]
    }

    /// How many forwards of this packet go to `ifindex`.
    pub fn count_dev(&self, ifindex: i32) -> usize {
        self.targets().iter().filter(|(d, _)| *d == ifindex).count()
    }
}

impl Default for GcLog {
    fn default() -> Self {
        GcLog::new()
    }
}

// ---------------------------------------------------------------------------
// Batch Scratch
// ---------------------------------------------------------------------------

/// One batch entry: the buffer plus its forwarding plan.
pub struct GcSlot {
    pub skb: Arc<SkBuff>,
    pub log: GcLog,
}

/// Per-CPU batch scratch. Bounded by the engine batch length.
pub struct GcBatch {
    slots: Vec<GcSlot>,
    capacity: usize,
}

impl GcBatch {
    pub fn new(capacity: usize) -> Self {
        GcBatch {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Add a packet with an empty log. Returns its batch index, or `None`
    /// when the batch is full.
    pub fn push(&mut self, skb: Arc<SkBuff>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        self.slots.push(GcSlot {
            skb,
            log: GcLog::new(),
        });
        Some(self.slots.len() - 1)
    }

    pub fn slot(&self, idx: usize) -> &GcSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut GcSlot {
        &mut self.slots[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &GcSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GcSlot> {
        self.slots.iter_mut()
    }

    /// Drain the batch, yielding the buffers for recycling.
    pub fn drain(&mut self) -> impl Iterator<Item = Arc<SkBuff>> + '_ {
        self.slots.drain(..).map(|s| s.skb)
    }
}

// ---------------------------------------------------------------------------
// Lazy Forwarding Targets
// ---------------------------------------------------------------------------

/// Devices referenced by a batch, with per-device forward totals. The
/// sweep visits each device once, batching its forwards under one
/// transmit lock.
#[derive(Debug, Default)]
pub struct LazyTargets {
    devs: Vec<(i32, usize)>,
}

impl LazyTargets {
    /// Aggregate the logs of a batch.
    pub fn collect(batch: &GcBatch) -> Self {
        let mut devs: Vec<(i32, usize)> = Vec::new();
        for slot in batch.iter() {
            for &(ifindex, _) in slot.log.targets() {
                match devs.iter_mut().find(|(d, _)| *d == ifindex) {
                    Some((_, cnt)) => *cnt += 1,
                    None => devs.push((ifindex, 1)),
                }
            }
        }
        LazyTargets { devs }
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, usize)> + '_ {
        self.devs.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.devs.is_empty()
    }
}
