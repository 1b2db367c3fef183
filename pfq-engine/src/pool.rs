//! Per-CPU skbuff pools.
//!
//! A pool is a lock-free single-producer/single-consumer ring of buffer
//! handles that keeps allocator traffic off the hot path. The Rx path of a
//! CPU pushes spent capture buffers and pops fresh ones; the Tx path has
//! its own ring. Correctness relies on the per-CPU partitioning: exactly
//! one thread pops and one thread pushes any given ring.
//!
//! A buffer is recycled only while its reference count is below 2 — a
//! buffer still held by an in-flight forward must not be handed out again.
//! Buffers that do not fit (full ring, pools disabled) go back to the OS
//! allocator and are counted, never leaked and never blocked on.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::skbuff::SkBuff;
use crate::stats::PoolCounters;

// ---------------------------------------------------------------------------
// SPSC Ring
// ---------------------------------------------------------------------------

/// One SPSC recycler ring.
pub struct SkbPool {
    slots: Box<[UnsafeCell<Option<Arc<SkBuff>>>]>,
    /// Producer index: advanced by `push` with a release store.
    p_idx: AtomicUsize,
    /// Consumer index: advanced by `pop` with a release store.
    c_idx: AtomicUsize,
}

// SAFETY: slot contents are only touched by the single producer (the slot
// at `p_idx`, empty by invariant) and the single consumer (the slot at
// `c_idx`, published by the producer's release store). The per-CPU
// partitioning guarantees one thread per side.
unsafe impl Send for SkbPool {}
unsafe impl Sync for SkbPool {}

impl SkbPool {
    /// One slot is kept empty to distinguish full from empty, so the pool
    /// holds at most `size - 1` buffers.
    pub fn new(size: usize) -> Self {
        assert!(size >= 2, "skbuff pool needs at least two slots");
        let slots = (0..size).map(|_| UnsafeCell::new(None)).collect();
        SkbPool {
            slots,
            p_idx: AtomicUsize::new(0),
            c_idx: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn next(&self, i: usize) -> usize {
        let n = i + 1;
        if n == self.slots.len() {
            0
        } else {
            n
        }
    }

    /// Take a recycled buffer, if one is available and idle.
    ///
    /// Returns `None` when the ring is empty or when the head buffer is
    /// still referenced elsewhere (its turn will come around again).
    pub fn pop(&self) -> Option<Arc<SkBuff>> {
        let c = self.c_idx.load(Ordering::Relaxed);
        let p = self.p_idx.load(Ordering::Acquire);
        if c == p {
            return None;
        }

        // SAFETY: c != p, so this slot was published by the producer and
        // is owned by the consumer side until c_idx advances.
        let slot = unsafe { &mut *self.slots[c].get() };
        if let Some(skb) = slot.as_ref() {
            if Arc::strong_count(skb) >= 2 {
                return None;
            }
        }
        debug_assert!(slot.is_some(), "skbuff pool slot lost its buffer");

        let skb = slot.take();
        self.c_idx.store(self.next(c), Ordering::Release);
        skb
    }

    /// Return a buffer to the ring. On a full ring the buffer is released
    /// to the allocator (dropped) and `false` is returned.
    pub fn push(&self, skb: Arc<SkBuff>) -> bool {
        let p = self.p_idx.load(Ordering::Relaxed);
        let c = self.c_idx.load(Ordering::Acquire);
        let n = self.next(p);
        if n == c {
            drop(skb);
            return false;
        }

        // SAFETY: n != c, so this slot is empty and owned by the producer
        // side until p_idx advances.
        let slot = unsafe { &mut *self.slots[p].get() };
        debug_assert!(slot.is_none(), "skbuff pool slot already occupied");
        *slot = Some(skb);
        self.p_idx.store(n, Ordering::Release);
        true
    }

    /// Drop every buffer in the ring. Only called with the data plane
    /// quiescent (pool disable, engine shutdown).
    pub fn flush(&self) -> usize {
        let mut freed = 0;
        let mut c = self.c_idx.load(Ordering::Relaxed);
        let p = self.p_idx.load(Ordering::Acquire);
        while c != p {
            // SAFETY: same ownership argument as `pop`; refcounts are not
            // consulted because dropping an Arc only decrements.
            let slot = unsafe { &mut *self.slots[c].get() };
            if slot.take().is_some() {
                freed += 1;
            }
            c = self.next(c);
        }
        self.c_idx.store(c, Ordering::Release);
        freed
    }

    /// Buffers currently held (approximate under concurrency).
    pub fn len(&self) -> usize {
        let p = self.p_idx.load(Ordering::Acquire);
        let c = self.c_idx.load(Ordering::Acquire);
        (p + self.slots.len() - c) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Per-CPU Pool Set
// ---------------------------------------------------------------------------

/// Which side of a CPU's pool pair to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    Rx,
    Tx,
}

struct CpuPools {
    rx: SkbPool,
    tx: SkbPool,
}

/// All per-CPU pools plus the runtime enable switch and memory counters.
pub struct PoolSet {
    enabled: AtomicBool,
    cpus: Box<[CpuPools]>,
    capacity: usize,
    pub stats: PoolCounters,
}

impl PoolSet {
    /// `pool_size` slots per ring, buffers of `capacity` payload bytes.
    pub fn new(cpus: usize, pool_size: usize, capacity: usize) -> Self {
        let cpus = cpus.max(1);
        let pools = (0..cpus)
            .map(|_| CpuPools {
                rx: SkbPool::new(pool_size),
                tx: SkbPool::new(pool_size),
            })
            .collect();
        PoolSet {
            enabled: AtomicBool::new(true),
            cpus: pools,
            capacity,
            stats: PoolCounters::new(cpus),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toggle recycling at runtime. Disabling drains every per-CPU ring;
    /// the caller quiesces the data plane first.
    pub fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::Relaxed);
        if !value {
            for (cpu, pools) in self.cpus.iter().enumerate() {
                let freed = pools.rx.flush() + pools.tx.flush();
                self.stats.os_free.add(cpu, freed as u64);
            }
        }
    }

    fn ring(&self, cpu: usize, kind: PoolKind) -> &SkbPool {
        let pools = &self.cpus[cpu % self.cpus.len()];
        match kind {
            PoolKind::Rx => &pools.rx,
            PoolKind::Tx => &pools.tx,
        }
    }

    /// Get a writable buffer: recycled when possible, freshly allocated
    /// otherwise. The buffer comes back reset.
    pub fn alloc(&self, cpu: usize, kind: PoolKind) -> Arc<SkBuff> {
        if self.is_enabled() {
            if let Some(mut skb) = self.ring(cpu, kind).pop() {
                self.stats.pool_pop.inc(cpu);
                // pop only returns buffers with a single holder
                if let Some(inner) = Arc::get_mut(&mut skb) {
                    inner.reset();
                    return skb;
                }
            }
        }
        self.stats.os_alloc.inc(cpu);
        Arc::new(SkBuff::with_capacity(self.capacity))
    }

    /// Hand a buffer back for recycling. Falls through to the allocator
    /// when pools are disabled, the ring is full, or the buffer has the
    /// wrong geometry.
    pub fn release(&self, cpu: usize, kind: PoolKind, skb: Arc<SkBuff>) {
        if self.is_enabled() && skb.capacity() == self.capacity {
            if self.ring(cpu, kind).push(skb) {
                self.stats.pool_push.inc(cpu);
                return;
            }
        }
        self.stats.os_free.inc(cpu);
    }
}
