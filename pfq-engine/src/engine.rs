//! Engine facade: endpoint table, control surface and the Rx data plane.
//!
//! Control operations are synchronous request/response calls validating
//! their preconditions and failing with a typed error; they never touch
//! the hot path locks. The Rx entry point (`receive`) runs on whichever
//! CPU the driver hook delivers packets on: per-CPU scratch batch, per-CPU
//! buffer pools, lock-free group/ring reads.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info};

use pfq_common::{PoolStats, Statistics, MAX_ID, NO_KTHREAD};

use crate::dev::DeviceTable;
use crate::dispatch::GcBatch;
use crate::error::{PfqError, Result};
use crate::group::{GroupPolicy, GroupTable};
use crate::lang::compile::{compile, FunctionDescr};
use crate::lang::symtable::SymbolTable;
use crate::lang::QBuff;
use crate::pool::{PoolKind, PoolSet};
use crate::ring::RxPacket;
use crate::socket::{Sock, SockParams};
use crate::stats::Counters;
use crate::tx::{lazy_xmit_exec, now_ns, queue_xmit, TxDrain, TxDrainCtx, TxThread};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Engine-wide tunables, normally taken from the configuration file.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Hardware contexts served by the data plane (0 = auto-detect).
    pub cpus: usize,
    /// Rx/Tx batch length.
    pub batch_len: usize,
    /// Default capture length for fresh endpoints.
    pub default_caplen: usize,
    /// Default Rx ring slots for fresh endpoints.
    pub default_rx_slots: usize,
    /// Skbuff pool ring size (slots per CPU per direction).
    pub pool_size: usize,
    /// Whether buffer recycling starts enabled.
    pub pool_enabled: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            cpus: 0,
            batch_len: pfq_common::DEFAULT_BATCH_LEN,
            default_caplen: pfq_common::DEFAULT_MAXLEN,
            default_rx_slots: 1024,
            pool_size: 1024,
            pool_enabled: true,
        }
    }
}

/// One raw frame handed in by the capture hook.
#[derive(Clone, Copy, Debug)]
pub struct RawPacket<'a> {
    pub data: &'a [u8],
    pub if_index: i32,
    pub hw_queue: u16,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    pub devices: DeviceTable,
    pub groups: GroupTable,
    pub pools: PoolSet,
    socks: Vec<ArcSwapOption<Sock>>,
    scratch: Vec<Mutex<GcBatch>>,
    symtab: SymbolTable,
    pub global: Counters,
    settings: EngineSettings,
    /// Self-reference handed to Tx threads (never keeps the engine alive).
    weak: Weak<Engine>,
    /// Serializes open/close id allocation.
    ctl: Mutex<()>,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        let cpus = if settings.cpus == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            settings.cpus
        };
        let settings = EngineSettings { cpus, ..settings };

        let pools = PoolSet::new(cpus, settings.pool_size, settings.default_caplen.max(pfq_common::DEFAULT_MAXLEN));
        pools.set_enabled(settings.pool_enabled);

        info!(
            cpus,
            batch_len = settings.batch_len,
            pool_size = settings.pool_size,
            "engine initialized"
        );

        Arc::new_cyclic(|weak| Engine {
            devices: DeviceTable::new(),
            groups: GroupTable::new(cpus),
            pools,
            socks: (0..MAX_ID).map(|_| ArcSwapOption::empty()).collect(),
            scratch: (0..cpus)
                .map(|_| Mutex::new(GcBatch::new(settings.batch_len)))
                .collect(),
            symtab: SymbolTable::with_defaults(),
            global: Counters::new(cpus),
            settings,
            weak: weak.clone(),
            ctl: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn symtab(&self) -> &SymbolTable {
        &self.symtab
    }

    fn sock(&self, id: usize) -> Result<Arc<Sock>> {
        self.socks
            .get(id)
            .and_then(|slot| slot.load_full())
            .ok_or(PfqError::NotEnabled)
    }

    // -----------------------------------------------------------------------
    // Endpoint Lifecycle
    // -----------------------------------------------------------------------

    /// Open an endpoint for the calling process.
    pub fn open(&self, policy: GroupPolicy, tx_slots: usize) -> Result<usize> {
        self.open_from(policy, tx_slots, std::process::id())
    }

    /// Control-surface entry: open an endpoint on behalf of `pid`. A
    /// non-`Undefined` policy joins a fresh group immediately.
    pub fn open_from(&self, policy: GroupPolicy, tx_slots: usize, pid: u32) -> Result<usize> {
        let _ctl = self.ctl.lock();

        let id = self
            .socks
            .iter()
            .position(|slot| slot.load().is_none())
            .ok_or(PfqError::NoMemory)?;

        let params = SockParams::new(
            self.settings.default_caplen,
            self.settings.default_rx_slots,
            tx_slots.max(1),
        );
        let sock = Arc::new(Sock::new(id, pid, params, self.settings.cpus));
        self.socks[id].store(Some(sock));

        if policy != GroupPolicy::Undefined {
            if let Err(e) = self
                .groups
                .join(pfq_common::ANY_GROUP, id, 0, policy, pid)
            {
                self.socks[id].store(None);
                return Err(e);
            }
        }

        debug!(id, ?policy, "endpoint opened");
        Ok(id)
    }

    /// Close an endpoint: leave every group, tear down rings, free the id.
    pub fn close(&self, id: usize) -> Result<()> {
        let sock = self.sock(id)?;
        let _ctl = self.ctl.lock();

        self.groups.leave_all(id);
        if sock.is_enabled() {
            let _ = sock.disable();
        }
        self.socks[id].store(None);
        debug!(id, "endpoint closed");
        Ok(())
    }

    /// Allocate rings and spawn the bound Tx threads.
    pub fn enable(&self, id: usize) -> Result<()> {
        let sock = self.sock(id)?;
        sock.enable()?;

        for (queue, binding) in sock.thread_driven_queues() {
            let engine = self.weak.clone();
            let sock_ref = sock.clone();
            let cpu = binding.cpu.max(0) as usize;
            let name = format!("pfq-tx-{}-{}", id, queue);

            let thread = TxThread::spawn(name, Some(cpu), move |stop| {
                Self::tx_drain_once(&engine, &sock_ref, queue, cpu, Some(stop))
            })?;
            sock.attach_tx_thread(queue, thread);
        }
        Ok(())
    }

    pub fn disable(&self, id: usize) -> Result<()> {
        self.sock(id)?.disable()
    }

    pub fn is_enabled(&self, id: usize) -> Result<bool> {
        Ok(self.sock(id)?.is_enabled())
    }

    pub fn mem_addr(&self, id: usize) -> Result<Option<usize>> {
        Ok(self.sock(id)?.mem_addr())
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    pub fn set_caplen(&self, id: usize, caplen: usize) -> Result<()> {
        self.sock(id)?.set_caplen(caplen)
    }

    pub fn caplen(&self, id: usize) -> Result<usize> {
        Ok(self.sock(id)?.params().caplen)
    }

    pub fn set_rx_slots(&self, id: usize, slots: usize) -> Result<()> {
        self.sock(id)?.set_rx_slots(slots)
    }

    pub fn rx_slots(&self, id: usize) -> Result<usize> {
        Ok(self.sock(id)?.params().rx_slots)
    }

    pub fn set_tx_slots(&self, id: usize, slots: usize) -> Result<()> {
        self.sock(id)?.set_tx_slots(slots)
    }

    pub fn tx_slots(&self, id: usize) -> Result<usize> {
        Ok(self.sock(id)?.params().tx_slots)
    }

    pub fn maxlen(&self, id: usize) -> Result<usize> {
        Ok(self.sock(id)?.params().maxlen)
    }

    pub fn rx_slot_size(&self, id: usize) -> Result<usize> {
        Ok(self.sock(id)?.rx_slot_size())
    }

    pub fn timestamp_enable(&self, id: usize, enabled: bool) -> Result<()> {
        self.sock(id)?.set_tstamp(enabled);
        Ok(())
    }

    pub fn timestamp_enabled(&self, id: usize) -> Result<bool> {
        Ok(self.sock(id)?.params().tstamp)
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    pub fn join_group(
        &self,
        id: usize,
        gid: i32,
        class_mask: u16,
        policy: GroupPolicy,
    ) -> Result<usize> {
        let sock = self.sock(id)?;
        self.groups.join(gid, id, class_mask, policy, sock.pid)
    }

    pub fn leave_group(&self, id: usize, gid: usize) -> Result<()> {
        self.sock(id)?;
        self.groups.leave(gid, id)
    }

    /// Lowest gid the endpoint belongs to, `-1` when none.
    pub fn group_id(&self, id: usize) -> Result<i32> {
        let mask = self.groups_mask(id)?;
        Ok(if mask == 0 {
            -1
        } else {
            mask.trailing_zeros() as i32
        })
    }

    pub fn groups_mask(&self, id: usize) -> Result<u64> {
        self.sock(id)?;
        Ok(self.groups.groups_mask(id))
    }

    pub fn groups_of(&self, id: usize) -> Result<Vec<i32>> {
        let mask = self.groups_mask(id)?;
        Ok((0..64).filter(|g| mask & (1 << g) != 0).collect())
    }

    /// Compile and atomically install a group computation.
    pub fn set_computation(
        &self,
        id: usize,
        gid: usize,
        descrs: &[FunctionDescr],
        entry_point: usize,
    ) -> Result<()> {
        self.sock(id)?;
        let comp = compile(descrs, entry_point, &self.symtab)?;
        self.groups.set_computation(gid, id, comp)
    }

    // -----------------------------------------------------------------------
    // Capture Bindings
    // -----------------------------------------------------------------------

    /// Add a device to the capture set of every group the endpoint is in.
    pub fn bind(&self, id: usize, dev_name: &str) -> Result<()> {
        let sock = self.sock(id)?;
        let ifindex = self.devices.ifindex(dev_name)?;
        let gids = self.groups_of(id)?;
        if gids.is_empty() {
            return Err(PfqError::invalid("endpoint has not joined any group"));
        }
        for gid in gids {
            self.groups.bind_dev(gid as usize, id, ifindex)?;
        }
        sock.bound_devs.fetch_or(1 << ifindex, Ordering::AcqRel);
        Ok(())
    }

    pub fn unbind(&self, id: usize, dev_name: &str) -> Result<()> {
        let sock = self.sock(id)?;
        let ifindex = self.devices.ifindex(dev_name)?;
        for gid in self.groups_of(id)? {
            self.groups.unbind_dev(gid as usize, id, ifindex)?;
        }
        sock.bound_devs.fetch_and(!(1 << ifindex), Ordering::AcqRel);
        Ok(())
    }

    pub fn bind_group(&self, id: usize, gid: usize, dev_name: &str) -> Result<()> {
        self.sock(id)?;
        let ifindex = self.devices.ifindex(dev_name)?;
        self.groups.bind_dev(gid, id, ifindex)
    }

    pub fn unbind_group(&self, id: usize, gid: usize, dev_name: &str) -> Result<()> {
        self.sock(id)?;
        let ifindex = self.devices.ifindex(dev_name)?;
        self.groups.unbind_dev(gid, id, ifindex)
    }

    // -----------------------------------------------------------------------
    // VLAN Filters
    // -----------------------------------------------------------------------

    pub fn vlan_filters_enable(&self, id: usize, gid: usize, enabled: bool) -> Result<()> {
        self.sock(id)?;
        self.groups.vlan_filters_enable(gid, id, enabled)
    }

    pub fn vlan_set_filter(&self, id: usize, gid: usize, vid: u16) -> Result<()> {
        self.sock(id)?;
        self.groups.vlan_set_filter(gid, id, vid, true)
    }

    pub fn vlan_reset_filter(&self, id: usize, gid: usize, vid: u16) -> Result<()> {
        self.sock(id)?;
        self.groups.vlan_set_filter(gid, id, vid, false)
    }

    // -----------------------------------------------------------------------
    // Tx Control
    // -----------------------------------------------------------------------

    /// Bind the endpoint's next Tx queue to a device and driving CPU
    /// (`NO_KTHREAD` = drained by `tx_queue_flush`).
    pub fn bind_tx(&self, id: usize, dev_name: &str, cpu: i32) -> Result<usize> {
        let sock = self.sock(id)?;
        let ifindex = self.devices.ifindex(dev_name)?;
        sock.bind_tx(ifindex, cpu)
    }

    /// User-context drain of one Tx queue.
    pub fn tx_queue_flush(&self, id: usize, queue: usize) -> Result<TxDrain> {
        let sock = self.sock(id)?;
        let binding = sock.tx_binding(queue)?;
        if binding.cpu != NO_KTHREAD {
            // a dedicated thread owns this queue
            return Ok(TxDrain::default());
        }
        let ring = sock.tx_ring(queue)?;
        let ctx = TxDrainCtx {
            devices: &self.devices,
            pools: &self.pools,
            cpu: 0,
            batch_len: self.settings.batch_len,
            maxlen: sock.params().maxlen,
            stop: None,
            user_driven: true,
        };
        let out = queue_xmit(&ring, binding.ifindex, binding.hw_queue, &ctx)?;
        self.account_tx(&sock, 0, &out);
        Ok(out)
    }

    /// Copy payloads into a Tx queue's next half (user-side producer).
    pub fn tx_inject<'a>(
        &self,
        id: usize,
        queue: usize,
        packets: impl IntoIterator<Item = (&'a [u8], u64)>,
    ) -> Result<usize> {
        self.sock(id)?.tx_inject(queue, packets)
    }

    pub fn egress_bind(&self, id: usize, dev_name: &str, hw_queue: i32) -> Result<()> {
        let sock = self.sock(id)?;
        let ifindex = self.devices.ifindex(dev_name)?;
        sock.egress_bind(ifindex, hw_queue);
        Ok(())
    }

    pub fn egress_unbind(&self, id: usize) -> Result<()> {
        self.sock(id)?.egress_unbind();
        Ok(())
    }

    /// One drain pass for a thread-driven queue. Returns whether any work
    /// was done (the thread backs off otherwise).
    fn tx_drain_once(
        engine: &Weak<Engine>,
        sock: &Arc<Sock>,
        queue: usize,
        cpu: usize,
        stop: Option<&std::sync::atomic::AtomicBool>,
    ) -> bool {
        let engine = match engine.upgrade() {
            Some(e) => e,
            None => return false,
        };
        let ring = match sock.tx_ring(queue) {
            Ok(r) => r,
            Err(_) => return false,
        };
        if !ring.pending() {
            return false;
        }
        let binding = match sock.tx_binding(queue) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let ctx = TxDrainCtx {
            devices: &engine.devices,
            pools: &engine.pools,
            cpu,
            batch_len: engine.settings.batch_len,
            maxlen: sock.params().maxlen,
            stop,
            user_driven: false,
        };
        match queue_xmit(&ring, binding.ifindex, binding.hw_queue, &ctx) {
            Ok(out) => {
                engine.account_tx(sock, cpu, &out);
                out.sent > 0 || out.disc > 0
            }
            Err(_) => false,
        }
    }

    fn account_tx(&self, sock: &Sock, cpu: usize, out: &TxDrain) {
        sock.stats.sent.add(cpu, out.sent as u64);
        sock.stats.disc.add(cpu, out.disc as u64);
        self.global.sent.add(cpu, out.sent as u64);
        self.global.disc.add(cpu, out.disc as u64);
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn stats(&self, id: usize) -> Result<Statistics> {
        Ok(self.sock(id)?.stats.snapshot())
    }

    pub fn group_stats(&self, id: usize, gid: usize) -> Result<Statistics> {
        self.sock(id)?;
        self.groups.stats(gid, id)
    }

    pub fn global_stats(&self) -> Statistics {
        self.global.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pools.stats.snapshot()
    }

    pub fn pool_enable(&self, enabled: bool) {
        self.pools.set_enabled(enabled);
    }

    // -----------------------------------------------------------------------
    // Rx Consumer Side
    // -----------------------------------------------------------------------

    /// Wait until Rx data is published or the timeout elapses. Returns the
    /// backlog. `timeout_ms == 0` is a non-blocking probe.
    pub fn poll(&self, id: usize, timeout_ms: u64) -> Result<u64> {
        let sock = self.sock(id)?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let backlog = sock.rx_ring().map(|r| r.backlog()).unwrap_or(0);
            if backlog > 0 || Instant::now() >= deadline {
                return Ok(backlog);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain published Rx slots (consumer side), waiting up to
    /// `timeout_ms` for the first one. Requires the endpoint enabled.
    pub fn read(&self, id: usize, timeout_ms: u64) -> Result<Vec<RxPacket>> {
        let sock = self.sock(id)?;
        let ring = sock.rx_ring().ok_or(PfqError::NotEnabled)?;

        if ring.backlog() == 0 && timeout_ms > 0 {
            self.poll(id, timeout_ms)?;
        }

        let mut out = Vec::new();
        while out.len() < ring.slots() {
            match ring.pop() {
                Some(pkt) => out.push(pkt),
                None => break,
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Rx Data Plane
    // -----------------------------------------------------------------------

    /// Capture-hook entry: ingest raw frames on `cpu`. Frames are copied
    /// into pool buffers, batched through the group computations, fanned
    /// out to member endpoints and lazily forwarded at the batch boundary.
    pub fn receive<'a>(&self, cpu: usize, frames: impl IntoIterator<Item = RawPacket<'a>>) {
        let cpu = cpu % self.settings.cpus;
        let mut batch = self.scratch[cpu].lock();

        for frame in frames {
            if batch.is_full() {
                self.process_batch(cpu, &mut batch);
            }
            let mut skb = self.pools.alloc(cpu, PoolKind::Rx);
            {
                let inner = Arc::get_mut(&mut skb)
                    .expect("pool buffers are exclusively owned");
                inner.fill(frame.data, frame.if_index, frame.hw_queue);
                inner.tstamp_ns = now_ns();
            }
            batch.push(skb);
        }

        // batches are scratch: always executed at the boundary
        self.process_batch(cpu, &mut batch);
    }

    fn process_batch(&self, cpu: usize, batch: &mut GcBatch) {
        if batch.is_empty() {
            return;
        }

        for idx in 0..batch.len() {
            let (if_index, vid) = {
                let skb = &batch.slot(idx).skb;
                (skb.if_index, skb.vlan_id())
            };

            for gid in self.groups.capturing_groups(if_index) {
                let counters = match self.groups.counters(gid) {
                    Some(c) => c,
                    None => continue,
                };
                counters.recv.inc(cpu);

                if !self.groups.vlan_admits(gid, vid) {
                    counters.drop.inc(cpu);
                    self.global.drop.inc(cpu);
                    continue;
                }

                let computation = self.groups.computation(gid);
                let (fanout, to_kernel) = {
                    let slot = batch.slot_mut(idx);
                    let mut qb = QBuff::new(&slot.skb, &mut slot.log);
                    if let Some(comp) = computation.as_deref() {
                        comp.eval(&mut qb);
                    }
                    (qb.fanout, qb.to_kernel)
                };

                if to_kernel {
                    counters.kern.inc(cpu);
                    self.global.kern.inc(cpu);
                }

                match fanout.kind {
                    crate::lang::FanoutKind::Drop => {
                        counters.drop.inc(cpu);
                        self.global.drop.inc(cpu);
                    }
                    crate::lang::FanoutKind::Sink => {}
                    _ => {
                        let mask = self.groups.resolve_fanout(gid, &fanout);
                        self.deliver_mask(cpu, batch, idx, gid, mask);
                    }
                }
            }
        }

        // execute the batch forwarding log, grouped by device
        let fwd = lazy_xmit_exec(batch, &self.devices);
        self.global.frwd.add(cpu, fwd.sent as u64);
        self.global.disc.add(cpu, fwd.aborted as u64);

        // recycle the batch buffers
        let spent: Vec<_> = batch.drain().collect();
        for skb in spent {
            self.pools.release(cpu, PoolKind::Rx, skb);
        }
    }

    fn deliver_mask(&self, cpu: usize, batch: &mut GcBatch, idx: usize, gid: usize, mask: u64) {
        let counters = self.groups.counters(gid);
        let mut egress: Vec<(i32, i32)> = Vec::new();

        for sock_id in 0..MAX_ID {
            if mask & (1 << sock_id) == 0 {
                continue;
            }
            let sock = match self.socks[sock_id].load_full() {
                Some(s) => s,
                None => continue,
            };

            let skb = &batch.slot(idx).skb;
            let ts = if sock.params().tstamp { skb.tstamp_ns } else { 0 };
            if sock.deliver(skb, gid as u16, ts) {
                sock.stats.recv.inc(cpu);
                self.global.recv.inc(cpu);
                if let Some(e) = sock.egress() {
                    egress.push(e);
                }
            } else {
                sock.stats.lost.inc(cpu);
                self.global.lost.inc(cpu);
                if let Some(c) = counters {
                    c.lost.inc(cpu);
                }
            }
        }

        // egress mirror: delivered packets are also forwarded
        for (ifindex, hw_queue) in egress {
            batch.slot_mut(idx).log.push(ifindex, hw_queue);
        }
    }
}
