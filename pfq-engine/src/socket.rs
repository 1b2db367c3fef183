//! Endpoint state: parameters, rings and Tx bindings.
//!
//! A `Sock` is one user endpoint. Its capture parameters are mutable only
//! while the endpoint is disabled; `enable` maps the shared region and
//! builds the Rx ring plus the Tx rings in it, after which the geometry
//! is frozen until `disable` tears everything down again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use pfq_common::{
    rx_slot_size, DEFAULT_MAXLEN, MAX_TX_QUEUES, NO_KTHREAD,
};

use crate::error::{PfqError, Result};
use crate::ring::{rx_ring_bytes, tx_ring_bytes, RxRing, SharedRegion, TxRing};
use crate::stats::Counters;
use crate::tx::TxThread;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Capture/transmit parameters, frozen while the endpoint is enabled.
#[derive(Clone, Copy, Debug)]
pub struct SockParams {
    pub caplen: usize,
    pub rx_slots: usize,
    pub tx_slots: usize,
    /// Read-only derived bound (device MTU + Ethernet header).
    pub maxlen: usize,
    pub tstamp: bool,
}

impl SockParams {
    pub fn new(caplen: usize, rx_slots: usize, tx_slots: usize) -> Self {
        SockParams {
            caplen,
            rx_slots,
            tx_slots,
            maxlen: DEFAULT_MAXLEN,
            tstamp: false,
        }
    }
}

/// A Tx queue binding: egress device, hardware queue and driving CPU
/// (`NO_KTHREAD` = drained by user-context flush).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxBinding {
    pub ifindex: i32,
    pub hw_queue: i32,
    pub cpu: i32,
}

struct TxQueueSlot {
    binding: Mutex<Option<TxBinding>>,
    ring: ArcSwapOption<TxRing>,
    thread: Mutex<Option<TxThread>>,
}

impl TxQueueSlot {
    fn new() -> Self {
        TxQueueSlot {
            binding: Mutex::new(None),
            ring: ArcSwapOption::empty(),
            thread: Mutex::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

pub struct Sock {
    pub id: usize,
    /// Owning process (restricted-group admission).
    pub pid: u32,
    params: Mutex<SockParams>,
    enabled: AtomicBool,
    mem: Mutex<Option<Arc<SharedRegion>>>,
    rx: ArcSwapOption<RxRing>,
    tx: [TxQueueSlot; MAX_TX_QUEUES],
    /// Egress mirror binding: delivered packets are also forwarded here.
    egress: Mutex<Option<(i32, i32)>>,
    /// Interfaces this endpoint's `bind` calls have added (bit = ifindex).
    pub bound_devs: AtomicU64,
    pub stats: Counters,
}

impl Sock {
    pub fn new(id: usize, pid: u32, params: SockParams, cpus: usize) -> Self {
        Sock {
            id,
            pid,
            params: Mutex::new(params),
            enabled: AtomicBool::new(false),
            mem: Mutex::new(None),
            rx: ArcSwapOption::empty(),
            tx: std::array::from_fn(|_| TxQueueSlot::new()),
            egress: Mutex::new(None),
            bound_devs: AtomicU64::new(0),
            stats: Counters::new(cpus),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn params(&self) -> SockParams {
        *self.params.lock()
    }

    // -----------------------------------------------------------------------
    // Parameter Setters (fail with Busy while enabled)
    // -----------------------------------------------------------------------

    fn set_param(&self, apply: impl FnOnce(&mut SockParams) -> Result<()>) -> Result<()> {
        if self.is_enabled() {
            return Err(PfqError::Busy);
        }
        apply(&mut self.params.lock())
    }

    pub fn set_caplen(&self, caplen: usize) -> Result<()> {
        self.set_param(|p| {
            if caplen == 0 || caplen > p.maxlen {
                return Err(PfqError::invalid(format!(
                    "caplen {} out of range (maxlen {})",
                    caplen, p.maxlen
                )));
            }
            p.caplen = caplen;
            Ok(())
        })
    }

    pub fn set_rx_slots(&self, slots: usize) -> Result<()> {
        self.set_param(|p| {
            if !slots.is_power_of_two() {
                return Err(PfqError::invalid("rx_slots must be a power of two"));
            }
            p.rx_slots = slots;
            Ok(())
        })
    }

    pub fn set_tx_slots(&self, slots: usize) -> Result<()> {
        self.set_param(|p| {
            if slots == 0 {
                return Err(PfqError::invalid("tx_slots must be positive"));
            }
            p.tx_slots = slots;
            Ok(())
        })
    }

    /// Timestamping may be toggled at any time; it only affects what the
    /// producer writes into new slots.
    pub fn set_tstamp(&self, enabled: bool) {
        self.params.lock().tstamp = enabled;
    }

    /// Rx slot size under the current parameters.
    pub fn rx_slot_size(&self) -> usize {
        rx_slot_size(self.params.lock().caplen)
    }

    // -----------------------------------------------------------------------
    // Enable / Disable
    // -----------------------------------------------------------------------

    /// Map the shared region and build the rings. Fails with
    /// `AlreadyExists` when already enabled.
    pub fn enable(&self) -> Result<()> {
        if self.is_enabled() {
            return Err(PfqError::AlreadyExists);
        }
        let p = self.params();

        let rx_bytes = rx_ring_bytes(p.rx_slots, p.caplen);
        let tx_half = p.tx_slots * pfq_common::tx_record_size(p.maxlen);
        let total = rx_bytes + MAX_TX_QUEUES * tx_ring_bytes(tx_half);

        let region = Arc::new(SharedRegion::alloc(total)?);
        let rx = RxRing::new(region.clone(), 0, p.rx_slots, p.caplen);

        let mut offset = rx_bytes;
        for slot in &self.tx {
            let ring = TxRing::new(region.clone(), offset, tx_half);
            slot.ring.store(Some(Arc::new(ring)));
            offset += tx_ring_bytes(tx_half);
        }

        self.rx.store(Some(Arc::new(rx)));
        *self.mem.lock() = Some(region);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Tear down: stop Tx threads, unpublish the rings, unmap the region.
    pub fn disable(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(PfqError::NotEnabled);
        }
        self.enabled.store(false, Ordering::Release);

        for slot in &self.tx {
            if let Some(thread) = slot.thread.lock().take() {
                thread.stop();
                drop(thread); // joins
            }
            slot.ring.store(None);
        }
        self.rx.store(None);
        *self.mem.lock() = None;
        Ok(())
    }

    /// Base address of the mapped region, when enabled.
    pub fn mem_addr(&self) -> Option<usize> {
        self.mem.lock().as_ref().map(|r| r.addr())
    }

    // -----------------------------------------------------------------------
    // Rx
    // -----------------------------------------------------------------------

    /// Data-plane handle to the Rx ring (absent while disabled).
    pub fn rx_ring(&self) -> Option<Arc<RxRing>> {
        self.rx.load_full()
    }

    /// Deliver one packet into the Rx ring. `false` means lost (ring full
    /// or endpoint not enabled).
    pub fn deliver(&self, skb: &crate::skbuff::SkBuff, gid: u16, tstamp_ns: u64) -> bool {
        match self.rx.load_full() {
            Some(ring) => ring.push(skb, gid, tstamp_ns),
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Tx Bindings
    // -----------------------------------------------------------------------

    /// Bind the next free Tx queue to `(ifindex, cpu)`. Returns the queue
    /// index. Fails with `Busy` once enabled.
    pub fn bind_tx(&self, ifindex: i32, cpu: i32) -> Result<usize> {
        if self.is_enabled() {
            return Err(PfqError::Busy);
        }
        for (idx, slot) in self.tx.iter().enumerate() {
            let mut binding = slot.binding.lock();
            if binding.is_none() {
                *binding = Some(TxBinding {
                    ifindex,
                    hw_queue: pfq_common::ANY_QUEUE,
                    cpu,
                });
                return Ok(idx);
            }
        }
        Err(PfqError::NoMemory)
    }

    pub fn tx_binding(&self, index: usize) -> Result<TxBinding> {
        self.tx
            .get(index)
            .ok_or_else(|| PfqError::invalid(format!("tx queue {} out of range", index)))?
            .binding
            .lock()
            .ok_or_else(|| PfqError::invalid(format!("tx queue {} is not bound", index)))
    }

    pub fn tx_ring(&self, index: usize) -> Result<Arc<TxRing>> {
        self.tx
            .get(index)
            .ok_or_else(|| PfqError::invalid(format!("tx queue {} out of range", index)))?
            .ring
            .load_full()
            .ok_or(PfqError::NotEnabled)
    }

    /// Queue indices bound to a driving CPU (thread-drained).
    pub fn thread_driven_queues(&self) -> Vec<(usize, TxBinding)> {
        self.tx
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.binding
                    .lock()
                    .filter(|b| b.cpu != NO_KTHREAD)
                    .map(|b| (i, b))
            })
            .collect()
    }

    /// Install the drain thread for a queue (engine-side, after enable).
    pub fn attach_tx_thread(&self, index: usize, thread: TxThread) {
        if let Some(slot) = self.tx.get(index) {
            *slot.thread.lock() = Some(thread);
        }
    }

    /// Copy user payloads into the next Tx half of a bound queue.
    pub fn tx_inject<'a>(
        &self,
        index: usize,
        packets: impl IntoIterator<Item = (&'a [u8], u64)>,
    ) -> Result<usize> {
        self.tx_ring(index)?.produce(packets)
    }

    // -----------------------------------------------------------------------
    // Egress Mirror
    // -----------------------------------------------------------------------

    pub fn egress_bind(&self, ifindex: i32, hw_queue: i32) {
        *self.egress.lock() = Some((ifindex, hw_queue));
    }

    pub fn egress_unbind(&self) {
        *self.egress.lock() = None;
    }

    pub fn egress(&self) -> Option<(i32, i32)> {
        *self.egress.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skbuff::SkBuff;

    fn sock() -> Sock {
        Sock::new(0, 42, SockParams::new(1514, 1024, 64), 1)
    }

    #[test]
    fn setters_fail_busy_when_enabled() {
        let s = sock();
        s.set_caplen(128).unwrap();
        s.set_rx_slots(256).unwrap();
        s.set_tx_slots(128).unwrap();
        assert_eq!(s.params().caplen, 128);

        s.enable().unwrap();
        assert_eq!(s.set_caplen(64).unwrap_err(), PfqError::Busy);
        assert_eq!(s.set_rx_slots(64).unwrap_err(), PfqError::Busy);
        assert_eq!(s.set_tx_slots(64).unwrap_err(), PfqError::Busy);

        s.disable().unwrap();
        s.set_caplen(64).unwrap();
        assert_eq!(s.params().caplen, 64);
    }

    #[test]
    fn enable_maps_region_and_disable_unmaps() {
        let s = sock();
        assert_eq!(s.mem_addr(), None);

        s.enable().unwrap();
        assert!(s.is_enabled());
        assert!(s.mem_addr().is_some());
        assert!(s.rx_ring().is_some());
        assert_eq!(s.enable().unwrap_err(), PfqError::AlreadyExists);

        s.disable().unwrap();
        assert!(!s.is_enabled());
        assert_eq!(s.mem_addr(), None);
        assert!(s.rx_ring().is_none());
        assert_eq!(s.disable().unwrap_err(), PfqError::NotEnabled);
    }

    #[test]
    fn slot_size_tracks_caplen() {
        let s = sock();
        s.set_caplen(64).unwrap();
        assert_eq!(s.rx_slot_size(), rx_slot_size(64));
    }

    #[test]
    fn invalid_parameters_rejected() {
        let s = sock();
        assert!(s.set_caplen(0).is_err());
        assert!(s.set_caplen(DEFAULT_MAXLEN + 1).is_err());
        assert!(s.set_rx_slots(1000).is_err(), "must be a power of two");
        assert!(s.set_tx_slots(0).is_err());
    }

    #[test]
    fn delivery_requires_enable() {
        let s = sock();
        let mut skb = SkBuff::with_capacity(64);
        skb.fill(b"data", 1, 0);

        assert!(!s.deliver(&skb, 0, 0), "disabled endpoint loses packets");

        s.enable().unwrap();
        assert!(s.deliver(&skb, 3, 99));
        let pkt = s.rx_ring().unwrap().pop().unwrap();
        assert_eq!(pkt.hdr.gid, 3);
        assert_eq!(pkt.payload, b"data");
    }

    #[test]
    fn tx_bind_allocates_queues_in_order() {
        let s = sock();
        assert_eq!(s.bind_tx(1, NO_KTHREAD).unwrap(), 0);
        assert_eq!(s.bind_tx(2, 0).unwrap(), 1);
        assert_eq!(s.tx_binding(0).unwrap().ifindex, 1);
        assert_eq!(s.tx_binding(1).unwrap().cpu, 0);
        assert!(s.tx_binding(2).is_err(), "unbound queue");
        assert_eq!(s.thread_driven_queues().len(), 1);

        s.enable().unwrap();
        assert_eq!(s.bind_tx(1, NO_KTHREAD).unwrap_err(), PfqError::Busy);
    }

    #[test]
    fn tx_inject_needs_enabled_ring() {
        let s = sock();
        s.bind_tx(1, NO_KTHREAD).unwrap();
        assert_eq!(
            s.tx_inject(0, [(b"x".as_slice(), 0u64)]).unwrap_err(),
            PfqError::NotEnabled
        );

        s.enable().unwrap();
        assert_eq!(s.tx_inject(0, [(b"x".as_slice(), 0u64)]).unwrap(), 1);
        assert!(s.tx_ring(0).unwrap().pending());
    }

    #[test]
    fn egress_mirror_binding() {
        let s = sock();
        assert_eq!(s.egress(), None);
        s.egress_bind(2, -1);
        assert_eq!(s.egress(), Some((2, -1)));
        s.egress_unbind();
        assert_eq!(s.egress(), None);
    }
}
