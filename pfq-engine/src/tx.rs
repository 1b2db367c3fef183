//! Tx engine: batched, time-scheduled transmission.
//!
//! A Tx queue is drained either synchronously (user-context flush) or by a
//! dedicated worker thread pinned to a CPU. The drain claims the next
//! double-buffer half, walks its records, and transmits in batches with
//! `xmit_more` set on all but the last frame so devices can coalesce
//! doorbells. Records scheduled in the future are waited for with a
//! cooperative busy-wait that polls the stop flag between packets; on
//! interruption the outcome keeps the count of packets already sent.
//!
//! Also hosts the lazy forwarding sweep that executes a batch's GC log
//! grouped by device at the Rx batch boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error};

use crate::dev::{DeviceTable, TxError};
use crate::dispatch::{GcBatch, LazyTargets};
use crate::error::{PfqError, Result};
use crate::pool::{PoolKind, PoolSet};
use crate::ring::TxRing;
use crate::skbuff::SkBuff;

/// Wall-clock nanoseconds (Tx schedules are absolute timestamps).
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[inline]
fn should_stop(stop: Option<&AtomicBool>) -> bool {
    stop.map_or(false, |s| s.load(Ordering::Acquire))
}

/// Busy-wait until `ts`, yielding cooperatively. Returns the reached time
/// and whether the wait was interrupted.
fn wait_until(ts: u64, stop: Option<&AtomicBool>) -> (u64, bool) {
    let mut now = now_ns();
    while now < ts {
        if should_stop(stop) {
            return (now, true);
        }
        std::hint::spin_loop();
        now = now_ns();
    }
    (now, false)
}

// ---------------------------------------------------------------------------
// Batch Transmit
// ---------------------------------------------------------------------------

/// Result of one transmit attempt over a batch prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchXmit {
    /// Frames accepted by the device, from the front of the batch.
    pub sent: usize,
    /// Frames consumed and discarded (device down), after `sent`.
    pub dropped: usize,
}

/// Transmit a batch under the device's queue lock, `xmit_more` on all but
/// the last frame. Stops at the first congested frame (the remainder stays
/// in the batch); a downed device consumes and drops the remainder.
pub fn xmit_batch(
    devices: &DeviceTable,
    ifindex: i32,
    hw_queue: i32,
    skbs: &[Arc<SkBuff>],
) -> Result<BatchXmit> {
    let dev = devices.get(ifindex)?;
    let lock = devices.tx_lock(ifindex)?;
    let _guard = lock.lock();

    let mut out = BatchXmit::default();
    let last = skbs.len().saturating_sub(1);
    for (i, skb) in skbs.iter().enumerate() {
        match dev.xmit(skb.data(), hw_queue, i != last) {
            Ok(()) => out.sent += 1,
            Err(TxError::Busy) => break,
            Err(TxError::Down) => {
                out.dropped = skbs.len() - out.sent;
                break;
            }
        }
    }
    Ok(out)
}

/// Retry a batch to completion, recycling buffers as they are consumed.
/// Returns `(sent, disc, interrupted)`; on interruption the unsent tail
/// has been recycled and counted.
fn flush_batch(
    batch: &mut Vec<Arc<SkBuff>>,
    devices: &DeviceTable,
    ifindex: i32,
    hw_queue: i32,
    pools: &PoolSet,
    cpu: usize,
    stop: Option<&AtomicBool>,
) -> (usize, usize, bool) {
    let mut sent = 0;
    let mut disc = 0;

    while !batch.is_empty() {
        if should_stop(stop) {
            disc += batch.len();
            for skb in batch.drain(..) {
                pools.release(cpu, PoolKind::Tx, skb);
            }
            return (sent, disc, true);
        }

        let attempt = match xmit_batch(devices, ifindex, hw_queue, batch) {
            Ok(a) => a,
            Err(_) => {
                // device vanished mid-drain: discard the rest
                disc += batch.len();
                for skb in batch.drain(..) {
                    pools.release(cpu, PoolKind::Tx, skb);
                }
                return (sent, disc, false);
            }
        };

        let consumed = attempt.sent + attempt.dropped;
        for skb in batch.drain(..consumed) {
            pools.release(cpu, PoolKind::Tx, skb);
        }
        sent += attempt.sent;
        disc += attempt.dropped;

        if consumed == 0 {
            thread::yield_now();
        }
    }
    (sent, disc, false)
}

// ---------------------------------------------------------------------------
// Queue Drain
// ---------------------------------------------------------------------------

/// Accounting for one queue drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxDrain {
    pub sent: usize,
    pub disc: usize,
    pub interrupted: bool,
}

impl TxDrain {
    /// The signed ABI encoding (`~sent` when interrupted).
    pub fn encode(&self) -> i64 {
        pfq_common::encode_tx_result(self.sent, self.interrupted)
    }
}

/// Shared context for queue drains.
pub struct TxDrainCtx<'a> {
    pub devices: &'a DeviceTable,
    pub pools: &'a PoolSet,
    pub cpu: usize,
    pub batch_len: usize,
    pub maxlen: usize,
    /// Stop flag of the driving thread (`None` for user-context flush).
    pub stop: Option<&'a AtomicBool>,
    /// User-context flush: the claimed half is force-published.
    pub user_driven: bool,
}

/// Drain one Tx queue half: claim the swap, walk the records, transmit in
/// scheduled batches. All accounting (including the unread tail on
/// interruption) is in the returned `TxDrain`.
pub fn queue_xmit(
    ring: &TxRing,
    ifindex: i32,
    hw_queue: i32,
    ctx: &TxDrainCtx<'_>,
) -> Result<TxDrain> {
    // claim the next swap generation
    let swap = ring.claim();
    if ctx.user_driven {
        ring.force_publish(swap);
    } else {
        while !ring.published(swap) {
            if should_stop(ctx.stop) {
                return Err(PfqError::Interrupted);
            }
            std::hint::spin_loop();
        }
    }

    let mut out = TxDrain::default();
    let mut batch: Vec<Arc<SkBuff>> = Vec::with_capacity(ctx.batch_len);
    let mut records = ring.records(swap);
    let mut now = now_ns();

    while let Some(record) = records.next() {
        let ts = record.nsec;

        // flush when the batch is full or the next packet is scheduled
        // ahead of now
        if batch.len() >= ctx.batch_len || (!batch.is_empty() && ts > now) {
            let (sent, disc, interrupted) = flush_batch(
                &mut batch,
                ctx.devices,
                ifindex,
                hw_queue,
                ctx.pools,
                ctx.cpu,
                ctx.stop,
            );
            out.sent += sent;
            out.disc += disc;
            if interrupted {
                out.interrupted = true;
                out.disc += 1; // the record in hand
                break;
            }
        }

        if ts > now {
            let (reached, interrupted) = wait_until(ts, ctx.stop);
            now = reached;
            if interrupted {
                out.interrupted = true;
                out.disc += 1;
                break;
            }
        }

        let mut skb = ctx.pools.alloc(ctx.cpu, PoolKind::Tx);
        {
            let inner = Arc::get_mut(&mut skb)
                .expect("pool buffers are exclusively owned");
            let len = record.payload.len().min(ctx.maxlen);
            inner.put(len).copy_from_slice(&record.payload[..len]);
            inner.hw_queue = hw_queue.max(0) as u16;
        }
        batch.push(skb);
    }

    // records left unread (after interruption) are discarded
    out.disc += records.count();

    if !batch.is_empty() {
        let (sent, disc, interrupted) = flush_batch(
            &mut batch,
            ctx.devices,
            ifindex,
            hw_queue,
            ctx.pools,
            ctx.cpu,
            ctx.stop,
        );
        out.sent += sent;
        out.disc += disc;
        out.interrupted |= interrupted;
    }

    ring.clear(swap);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Lazy Forwarding Sweep
// ---------------------------------------------------------------------------

/// Accounting for one lazy forwarding sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LazyExec {
    pub sent: usize,
    pub aborted: usize,
}

/// Execute the batch's forwarding log, grouped by device. Each device is
/// visited once; all its forwards go out under one lock acquisition with
/// `xmit_more` cleared only on the device's last frame.
pub fn lazy_xmit_exec(batch: &mut GcBatch, devices: &DeviceTable) -> LazyExec {
    let mut out = LazyExec::default();
    let targets = LazyTargets::collect(batch);

    for (ifindex, total) in targets.iter() {
        let dev = match devices.get(ifindex) {
            Ok(d) => d,
            Err(_) => {
                out.aborted += total;
                continue;
            }
        };
        let lock = match devices.tx_lock(ifindex) {
            Ok(l) => l,
            Err(_) => {
                out.aborted += total;
                continue;
            }
        };
        let _guard = lock.lock();

        let mut sent_dev = 0usize;
        for i in 0..batch.len() {
            let (num, hw_queue) = {
                let log = &batch.slot(i).log;
                let num = log.count_dev(ifindex);
                let queue = log
                    .targets()
                    .iter()
                    .find(|(d, _)| *d == ifindex)
                    .map(|&(_, q)| q)
                    .unwrap_or(pfq_common::ANY_QUEUE);
                (num, queue)
            };
            if num == 0 {
                continue;
            }

            for _ in 0..num {
                sent_dev += 1;
                let more = sent_dev != total;
                let slot = batch.slot_mut(i);
                slot.log.xmit_todo = slot.log.xmit_todo.saturating_sub(1);
                match dev.xmit(slot.skb.data(), hw_queue, more) {
                    Ok(()) => out.sent += 1,
                    Err(_) => out.aborted += 1,
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tx Worker Threads
// ---------------------------------------------------------------------------

/// A dedicated drain thread bound to one Tx queue, optionally pinned to a
/// CPU core. Stopped (and joined) on drop.
pub struct TxThread {
    handle: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl TxThread {
    /// `drain` is called in a loop with the thread's stop flag; it returns
    /// whether it did any work (idle threads back off briefly).
    pub fn spawn<F>(name: String, cpu: Option<usize>, mut drain: F) -> Result<Self>
    where
        F: FnMut(&AtomicBool) -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Some(core) = cpu {
                    if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                        debug!(thread = %name, core, "pinned Tx thread");
                    }
                }
                while !flag.load(Ordering::Acquire) {
                    if !drain(&flag) {
                        thread::sleep(Duration::from_micros(50));
                    }
                }
                debug!(thread = %name, "Tx thread stopped");
            })
            .map_err(|e| {
                error!(error = %e, "spawning Tx thread failed");
                PfqError::NoMemory
            })?;

        Ok(TxThread {
            handle: Some(handle),
            stop,
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for TxThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::MemDevice;
    use crate::ring::{tx_ring_bytes, SharedRegion, TxRing};

    fn setup() -> (DeviceTable, Arc<MemDevice>, PoolSet) {
        let devices = DeviceTable::new();
        let dev = MemDevice::new("sink0");
        devices.register(dev.clone()).unwrap();
        let pools = PoolSet::new(1, 64, 2048);
        (devices, dev, pools)
    }

    fn tx_ring() -> TxRing {
        let region = Arc::new(SharedRegion::alloc(tx_ring_bytes(8192)).unwrap());
        TxRing::new(region, 0, 8192)
    }

    fn skbs(n: usize) -> Vec<Arc<SkBuff>> {
        (0..n)
            .map(|i| {
                let mut skb = SkBuff::with_capacity(64);
                skb.fill(&[i as u8; 8], 1, 0);
                Arc::new(skb)
            })
            .collect()
    }

    #[test]
    fn batch_sets_xmit_more_on_all_but_last() {
        let (devices, dev, _pools) = setup();
        let batch = skbs(3);
        let out = xmit_batch(&devices, 1, -1, &batch).unwrap();
        assert_eq!(out.sent, 3);

        let frames = dev.frames();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].1);
        assert!(frames[1].1);
        assert!(!frames[2].1, "last frame clears xmit_more");
    }

    #[test]
    fn batch_stops_at_congestion() {
        let (devices, dev, _pools) = setup();
        dev.congest_after(2);
        let batch = skbs(4);
        let out = xmit_batch(&devices, 1, -1, &batch).unwrap();
        assert_eq!(out.sent, 2);
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn batch_drops_remainder_when_down() {
        let (devices, dev, _pools) = setup();
        dev.set_up(false);
        let batch = skbs(3);
        let out = xmit_batch(&devices, 1, -1, &batch).unwrap();
        assert_eq!(out.sent, 0);
        assert_eq!(out.dropped, 3);
    }

    #[test]
    fn user_driven_drain_sends_everything() {
        let (devices, dev, pools) = setup();
        let ring = tx_ring();
        ring.produce([
            (b"alpha".as_slice(), 0u64),
            (b"beta".as_slice(), 0u64),
            (b"gamma".as_slice(), 0u64),
        ])
        .unwrap();

        let ctx = TxDrainCtx {
            devices: &devices,
            pools: &pools,
            cpu: 0,
            batch_len: 2,
            maxlen: 1514,
            stop: None,
            user_driven: true,
        };
        let out = queue_xmit(&ring, 1, -1, &ctx).unwrap();
        assert_eq!(out.sent, 3);
        assert_eq!(out.disc, 0);
        assert!(!out.interrupted);
        assert_eq!(out.encode(), 3);

        let frames = dev.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].0, b"alpha");
        assert_eq!(frames[2].0, b"gamma");
    }

    #[test]
    fn drain_honours_scheduled_timestamps() {
        let (devices, dev, pools) = setup();
        let ring = tx_ring();

        let deadline = now_ns() + 3_000_000; // 3ms ahead
        ring.produce([(b"sched".as_slice(), deadline)]).unwrap();

        let ctx = TxDrainCtx {
            devices: &devices,
            pools: &pools,
            cpu: 0,
            batch_len: 8,
            maxlen: 1514,
            stop: None,
            user_driven: true,
        };
        let out = queue_xmit(&ring, 1, -1, &ctx).unwrap();
        assert_eq!(out.sent, 1);
        assert!(
            now_ns() >= deadline,
            "transmit must not happen before the scheduled time"
        );
        assert_eq!(dev.frame_count(), 1);
    }

    #[test]
    fn drain_counts_unsent_as_disc_when_down() {
        let (devices, dev, pools) = setup();
        dev.set_up(false);
        let ring = tx_ring();
        ring.produce([(b"a".as_slice(), 0u64), (b"b".as_slice(), 0u64)])
            .unwrap();

        let ctx = TxDrainCtx {
            devices: &devices,
            pools: &pools,
            cpu: 0,
            batch_len: 8,
            maxlen: 1514,
            stop: None,
            user_driven: true,
        };
        let out = queue_xmit(&ring, 1, -1, &ctx).unwrap();
        assert_eq!(out.sent, 0);
        assert_eq!(out.disc, 2);
    }

    #[test]
    fn interrupted_drain_abandons_pending_work() {
        let (devices, dev, pools) = setup();
        let ring = tx_ring();

        let stop = AtomicBool::new(false);
        // first record immediate, second scheduled far in the future
        ring.produce([
            (b"now".as_slice(), 0u64),
            (b"later".as_slice(), now_ns() + 60_000_000_000),
        ])
        .unwrap();
        stop.store(true, Ordering::Release);

        let ctx = TxDrainCtx {
            devices: &devices,
            pools: &pools,
            cpu: 0,
            batch_len: 8,
            maxlen: 1514,
            stop: Some(&stop),
            user_driven: true,
        };
        let out = queue_xmit(&ring, 1, -1, &ctx).unwrap();
        assert!(out.interrupted);
        assert_eq!(out.sent, 0, "the stop request pre-empts the flush");
        assert_eq!(out.disc, 2, "both records are abandoned and counted");
        assert_eq!(out.encode(), pfq_common::encode_tx_result(0, true));
        assert_eq!(dev.frame_count(), 0);
    }

    #[test]
    fn batched_drain_flushes_by_batch_len() {
        let (devices, dev, pools) = setup();
        let ring = tx_ring();
        ring.produce((0..5).map(|_| (b"x".as_slice(), 0u64))).unwrap();

        let ctx = TxDrainCtx {
            devices: &devices,
            pools: &pools,
            cpu: 0,
            batch_len: 2,
            maxlen: 1514,
            stop: None,
            user_driven: true,
        };
        let out = queue_xmit(&ring, 1, -1, &ctx).unwrap();
        assert_eq!(out.sent, 5);

        // doorbell pattern: batches of 2,2,1 -> more flags t,f,t,f,f
        let more: Vec<bool> = dev.frames().iter().map(|(_, m)| *m).collect();
        assert_eq!(more, vec![true, false, true, false, false]);
    }

    #[test]
    fn thread_mode_claim_interrupts_on_stop() {
        let (devices, _dev, pools) = setup();
        let ring = tx_ring();
        let stop = AtomicBool::new(true);

        let ctx = TxDrainCtx {
            devices: &devices,
            pools: &pools,
            cpu: 0,
            batch_len: 8,
            maxlen: 1514,
            stop: Some(&stop),
            user_driven: false,
        };
        // nothing published: the claim wait must bail out
        assert_eq!(queue_xmit(&ring, 1, -1, &ctx).unwrap_err(), PfqError::Interrupted);
    }

    #[test]
    fn lazy_exec_groups_by_device_and_clears_more_on_last() {
        let devices = DeviceTable::new();
        let d1 = MemDevice::new("fwd0");
        let d2 = MemDevice::new("fwd1");
        devices.register(d1.clone()).unwrap();
        devices.register(d2.clone()).unwrap();

        let mut batch = GcBatch::new(4);
        let a = batch
            .push(Arc::new({
                let mut s = SkBuff::with_capacity(64);
                s.fill(b"pkt-a", 1, 0);
                s
            }))
            .unwrap();
        let b = batch
            .push(Arc::new({
                let mut s = SkBuff::with_capacity(64);
                s.fill(b"pkt-b", 1, 0);
                s
            }))
            .unwrap();

        batch.slot_mut(a).log.push(1, -1);
        batch.slot_mut(a).log.push(2, -1);
        batch.slot_mut(b).log.push(1, -1);

        let out = lazy_xmit_exec(&mut batch, &devices);
        assert_eq!(out.sent, 3);
        assert_eq!(out.aborted, 0);

        let f1 = d1.frames();
        assert_eq!(f1.len(), 2);
        assert!(f1[0].1, "first of two on fwd0 keeps xmit_more");
        assert!(!f1[1].1, "last on fwd0 clears xmit_more");

        let f2 = d2.frames();
        assert_eq!(f2.len(), 1);
        assert!(!f2[0].1);
    }

    #[test]
    fn lazy_exec_counts_unknown_device() {
        let devices = DeviceTable::new();
        let mut batch = GcBatch::new(2);
        let a = batch.push(Arc::new(SkBuff::with_capacity(64))).unwrap();
        batch.slot_mut(a).log.push(9, -1);

        let out = lazy_xmit_exec(&mut batch, &devices);
        assert_eq!(out.sent, 0);
        assert_eq!(out.aborted, 1);
    }

    #[test]
    fn tx_thread_runs_and_stops() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = counter.clone();
        let thread = TxThread::spawn("pfq-tx-test".into(), None, move |_stop| {
            seen.fetch_add(1, Ordering::Relaxed);
            true
        })
        .unwrap();

        while counter.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        drop(thread); // stops and joins
        let settled = counter.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(counter.load(Ordering::Relaxed), settled);
    }
}
