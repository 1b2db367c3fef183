//! Sparse per-CPU counters.
//!
//! Data-plane counters are written from the CPU that owns the packet and
//! only summed on the (cold) read path, so each CPU gets its own padded
//! cell and writes are relaxed. Control-path updates go through cell 0.

use std::sync::atomic::{AtomicU64, Ordering};

use pfq_common::{PoolStats, Statistics};

/// Pad each counter cell to its own cache line pair to keep cross-CPU
/// false sharing off the hot path.
#[repr(C, align(128))]
struct Cell(AtomicU64);

/// A single per-CPU counter.
pub struct Sparse {
    cells: Box<[Cell]>,
}

impl Sparse {
    pub fn new(cpus: usize) -> Self {
        let cells = (0..cpus.max(1)).map(|_| Cell(AtomicU64::new(0))).collect();
        Sparse { cells }
    }

    #[inline]
    pub fn inc(&self, cpu: usize) {
        self.add(cpu, 1);
    }

    #[inline]
    pub fn add(&self, cpu: usize, n: u64) {
        let cell = &self.cells[cpu % self.cells.len()];
        cell.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Sum across all CPUs. Relaxed: the caller sees a value at least as
    /// large as any update that happened-before the read.
    pub fn read(&self) -> u64 {
        self.cells.iter().map(|c| c.0.load(Ordering::Relaxed)).sum()
    }

    pub fn reset(&self) {
        for cell in self.cells.iter() {
            cell.0.store(0, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Counter Sets
// ---------------------------------------------------------------------------

/// The per-endpoint / per-group / global counter set.
pub struct Counters {
    pub recv: Sparse,
    pub lost: Sparse,
    pub drop: Sparse,
    pub sent: Sparse,
    pub disc: Sparse,
    pub frwd: Sparse,
    pub kern: Sparse,
}

impl Counters {
    pub fn new(cpus: usize) -> Self {
        Counters {
            recv: Sparse::new(cpus),
            lost: Sparse::new(cpus),
            drop: Sparse::new(cpus),
            sent: Sparse::new(cpus),
            disc: Sparse::new(cpus),
            frwd: Sparse::new(cpus),
            kern: Sparse::new(cpus),
        }
    }

    pub fn snapshot(&self) -> Statistics {
        Statistics {
            recv: self.recv.read(),
            lost: self.lost.read(),
            drop: self.drop.read(),
            sent: self.sent.read(),
            disc: self.disc.read(),
            frwd: self.frwd.read(),
            kern: self.kern.read(),
        }
    }

    pub fn reset(&self) {
        self.recv.reset();
        self.lost.reset();
        self.drop.reset();
        self.sent.reset();
        self.disc.reset();
        self.frwd.reset();
        self.kern.reset();
    }
}

/// Skbuff pool memory counters.
pub struct PoolCounters {
    pub os_alloc: Sparse,
    pub os_free: Sparse,
    pub pool_pop: Sparse,
    pub pool_push: Sparse,
}

impl PoolCounters {
    pub fn new(cpus: usize) -> Self {
        PoolCounters {
            os_alloc: Sparse::new(cpus),
            os_free: Sparse::new(cpus),
            pool_pop: Sparse::new(cpus),
            pool_push: Sparse::new(cpus),
        }
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            os_alloc: self.os_alloc.read(),
            os_free: self.os_free.read(),
            pool_pop: self.pool_pop.read(),
            pool_push: self.pool_push.read(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_sums_across_cells() {
        let s = Sparse::new(4);
        s.inc(0);
        s.inc(1);
        s.add(3, 40);
        assert_eq!(s.read(), 42);
        s.reset();
        assert_eq!(s.read(), 0);
    }

    #[test]
    fn out_of_range_cpu_wraps() {
        let s = Sparse::new(2);
        s.inc(7);
        assert_eq!(s.read(), 1);
    }

    #[test]
    fn counters_snapshot() {
        let c = Counters::new(2);
        c.recv.add(0, 3);
        c.lost.inc(1);
        let snap = c.snapshot();
        assert_eq!(snap.recv, 3);
        assert_eq!(snap.lost, 1);
        assert_eq!(snap.drop, 0);
    }
}
