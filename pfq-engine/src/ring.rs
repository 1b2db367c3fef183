//! Shared-memory Rx and Tx rings.
//!
//! Both rings live inside one `mmap`ed region per endpoint so a user-space
//! consumer can map the same pages. The Rx ring is single-producer
//! (engine) / single-consumer (user); slot publication goes through a
//! per-slot commit word written last with release ordering. The Tx ring is
//! double-buffered: the user fills one half while the engine drains the
//! other, with two free-running swap counters arbitrating the handover.
//!
//! All raw-pointer access to the shared region is confined to this module.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{bytes_of, pod_read_unaligned};
use pfq_common::{
    align8, rx_slot_size, Pkthdr, PkthdrTx, RxQueueHdr, TxQueueHdr,
};

use crate::error::{PfqError, Result};
use crate::skbuff::SkBuff;

// ---------------------------------------------------------------------------
// Shared Region
// ---------------------------------------------------------------------------

/// Anonymous shared mapping backing an endpoint's rings. Page-aligned and
/// zero-filled by the kernel; unmapped on drop.
pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is plain memory; all concurrent access goes through
// the ring types, which implement their own synchronization.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn alloc(len: usize) -> Result<Self> {
        let len = len.max(1);
        // SAFETY: plain anonymous mapping; checked for MAP_FAILED below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PfqError::NoMemory);
        }
        Ok(SharedRegion {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Base address of the mapping, observable through the control surface.
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        // SAFETY: offset validated against the mapping length by callers.
        unsafe { self.ptr.add(offset) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Bytes needed by an Rx ring with the given geometry.
pub fn rx_ring_bytes(slots: usize, caplen: usize) -> usize {
    std::mem::size_of::<RxQueueHdr>() + slots * rx_slot_size(caplen)
}

/// Bytes needed by a Tx ring (header plus two halves).
pub fn tx_ring_bytes(half_size: usize) -> usize {
    align8(std::mem::size_of::<TxQueueHdr>()) + 2 * half_size
}

// ---------------------------------------------------------------------------
// Rx Ring
// ---------------------------------------------------------------------------

/// A packet copied out of an Rx ring slot by the consumer side.
#[derive(Debug, Clone)]
pub struct RxPacket {
    pub hdr: Pkthdr,
    pub payload: Vec<u8>,
}

/// SPSC Rx ring over a shared region. `slots` must be a power of two.
pub struct RxRing {
    region: Arc<SharedRegion>,
    base: usize,
    slots: u64,
    mask: u64,
    slot_size: usize,
    caplen: usize,
}

// SAFETY: interior mutation is mediated by the producer/consumer index
// atomics and the per-slot commit word.
unsafe impl Send for RxRing {}
unsafe impl Sync for RxRing {}

impl RxRing {
    pub fn new(region: Arc<SharedRegion>, offset: usize, slots: usize, caplen: usize) -> Self {
        assert!(slots.is_power_of_two(), "rx_slots must be a power of two");
        assert!(offset + rx_ring_bytes(slots, caplen) <= region.len());
        RxRing {
            base: offset,
            slots: slots as u64,
            mask: (slots - 1) as u64,
            slot_size: rx_slot_size(caplen),
            caplen,
            region,
        }
    }

    #[inline]
    fn producer(&self) -> &AtomicU64 {
        // SAFETY: the region starts with an RxQueueHdr at `base`; the word
        // is 8-aligned (mmap is page-aligned, offsets are 8-aligned).
        unsafe { &*(self.region.at(self.base) as *const AtomicU64) }
    }

    #[inline]
    fn consumer(&self) -> &AtomicU64 {
        unsafe { &*(self.region.at(self.base + 8) as *const AtomicU64) }
    }

    #[inline]
    fn slot_ptr(&self, index: u64) -> *mut u8 {
        let off = self.base
            + std::mem::size_of::<RxQueueHdr>()
            + ((index & self.mask) as usize) * self.slot_size;
        self.region.at(off)
    }

    #[inline]
    fn commit_word(&self, slot: *mut u8) -> &AtomicU32 {
        // SAFETY: commit sits at an 8k+24 offset inside an aligned slot.
        unsafe { &*(slot.add(std::mem::offset_of!(Pkthdr, commit)) as *const AtomicU32) }
    }

    pub fn caplen(&self) -> usize {
        self.caplen
    }

    pub fn slots(&self) -> usize {
        self.slots as usize
    }

    /// Published-but-unconsumed slot count.
    pub fn backlog(&self) -> u64 {
        let p = self.producer().load(Ordering::Acquire);
        let c = self.consumer().load(Ordering::Acquire);
        p.wrapping_sub(c)
    }

    /// Producer side: copy a captured frame into the next slot.
    ///
    /// Returns `false` when the ring is full; the caller accounts the
    /// packet as `lost`.
    pub fn push(&self, skb: &SkBuff, gid: u16, tstamp_ns: u64) -> bool {
        let p = self.producer().load(Ordering::Relaxed);
        let c = self.consumer().load(Ordering::Acquire);
        if p.wrapping_sub(c) >= self.slots {
            return false;
        }

        let slot = self.slot_ptr(p);
        let caplen = skb.len().min(self.caplen);

        let hdr = Pkthdr {
            caplen: caplen as u16,
            len: skb.len() as u16,
            _pad: 0,
            tstamp_ns,
            if_index: skb.if_index,
            hw_queue: skb.hw_queue,
            gid,
            commit: 0,
            _pad2: 0,
        };

        // SAFETY: the slot belongs to the producer until the commit word is
        // published; bounds follow from the geometry checked in `new`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes_of(&hdr).as_ptr(),
                slot,
                std::mem::size_of::<Pkthdr>(),
            );
            std::ptr::copy_nonoverlapping(
                skb.data().as_ptr(),
                slot.add(std::mem::size_of::<Pkthdr>()),
                caplen,
            );
        }

        // Publish: commit carries the slot sequence so a consumer at index
        // c accepts only commit == c + 1 (stale laps never match).
        self.commit_word(slot)
            .store((p as u32).wrapping_add(1), Ordering::Release);
        self.producer().store(p.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side: copy out the next published slot, if any.
    pub fn pop(&self) -> Option<RxPacket> {
        let c = self.consumer().load(Ordering::Relaxed);
        let slot = self.slot_ptr(c);
        let committed = self.commit_word(slot).load(Ordering::Acquire);
        if committed != (c as u32).wrapping_add(1) {
            return None;
        }

        // SAFETY: the commit word guarantees the producer finished this
        // slot; the producer will not reuse it until `consumer` advances.
        let (hdr, payload) = unsafe {
            let hdr_bytes =
                std::slice::from_raw_parts(slot, std::mem::size_of::<Pkthdr>());
            let hdr: Pkthdr = pod_read_unaligned(hdr_bytes);
            let payload = std::slice::from_raw_parts(
                slot.add(std::mem::size_of::<Pkthdr>()),
                hdr.caplen as usize,
            )
            .to_vec();
            (hdr, payload)
        };

        self.consumer().store(c.wrapping_add(1), Ordering::Release);
        Some(RxPacket { hdr, payload })
    }
}

// ---------------------------------------------------------------------------
// Tx Ring
// ---------------------------------------------------------------------------

/// One record read out of a Tx half by the drain side.
pub struct TxRecord<'a> {
    pub nsec: u64,
    pub payload: &'a [u8],
}

/// Double-buffered Tx ring over a shared region.
pub struct TxRing {
    region: Arc<SharedRegion>,
    base: usize,
    half_size: usize,
}

unsafe impl Send for TxRing {}
unsafe impl Sync for TxRing {}

impl TxRing {
    pub fn new(region: Arc<SharedRegion>, offset: usize, half_size: usize) -> Self {
        assert!(offset + tx_ring_bytes(half_size) <= region.len());
        TxRing {
            base: offset,
            half_size,
            region,
        }
    }

    #[inline]
    fn prod(&self) -> &AtomicU32 {
        // SAFETY: TxQueueHdr sits 8-aligned at `base`.
        unsafe { &*(self.region.at(self.base) as *const AtomicU32) }
    }

    #[inline]
    fn cons(&self) -> &AtomicU32 {
        unsafe { &*(self.region.at(self.base + 4) as *const AtomicU32) }
    }

    pub fn half_size(&self) -> usize {
        self.half_size
    }

    fn half_base(&self, swap: u32) -> usize {
        self.base
            + align8(std::mem::size_of::<TxQueueHdr>())
            + ((swap & 1) as usize) * self.half_size
    }

    /// Whether a published half is waiting to be drained.
    pub fn pending(&self) -> bool {
        self.prod().load(Ordering::Acquire) != self.cons().load(Ordering::Acquire)
    }

    /// Producer side: fill the next half with `(payload, nsec)` records and
    /// publish it. Fails with `Busy` while the previously published half
    /// has not been claimed (back-pressure). A drain thread may pre-claim
    /// the next generation and spin, leaving `cons` ahead of `prod`; that
    /// state still accepts a publish.
    pub fn produce<'a>(
        &self,
        packets: impl IntoIterator<Item = (&'a [u8], u64)>,
    ) -> Result<usize> {
        let p = self.prod().load(Ordering::Acquire);
        let c = self.cons().load(Ordering::Acquire);
        if p.wrapping_sub(c) as i32 > 0 {
            return Err(PfqError::Busy);
        }

        let half = self.half_base(p.wrapping_add(1));
        let mut off = 0usize;
        let mut written = 0usize;

        for (payload, nsec) in packets {
            let record = pfq_common::tx_record_size(payload.len());
            // keep room for the terminating header
            if off + record + std::mem::size_of::<PkthdrTx>() > self.half_size {
                break;
            }
            let hdr = PkthdrTx {
                len: payload.len() as u16,
                _pad: 0,
                _pad2: 0,
                nsec,
            };
            // SAFETY: off + record fits in this half; the half is owned by
            // the producer until `prod` is published.
            unsafe {
                let dst = self.region.at(half + off);
                std::ptr::copy_nonoverlapping(
                    bytes_of(&hdr).as_ptr(),
                    dst,
                    std::mem::size_of::<PkthdrTx>(),
                );
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    dst.add(std::mem::size_of::<PkthdrTx>()),
                    payload.len(),
                );
            }
            off += record;
            written += 1;
        }

        // length-0 terminator
        let term = PkthdrTx::default();
        // SAFETY: the loop above reserved space for the terminator.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes_of(&term).as_ptr(),
                self.region.at(half + off),
                std::mem::size_of::<PkthdrTx>(),
            );
        }

        self.prod().store(p.wrapping_add(1), Ordering::Release);
        Ok(written)
    }

    /// Drain side: claim the next swap generation.
    pub fn claim(&self) -> u32 {
        self.cons().fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Whether the user has published up to `swap` (thread-driven drain
    /// spins on this).
    pub fn published(&self, swap: u32) -> bool {
        self.prod().load(Ordering::Acquire).wrapping_sub(swap) as i32 >= 0
    }

    /// User-driven drain: flip `prod` forward so the claimed half counts
    /// as published (the caller is the producer).
    pub fn force_publish(&self, swap: u32) {
        self.prod().store(swap, Ordering::Release);
    }

    /// Iterate the records of the claimed half, stopping at the length-0
    /// terminator or the end of the half.
    pub fn records(&self, swap: u32) -> TxRecordIter<'_> {
        TxRecordIter {
            ring: self,
            half: self.half_base(swap),
            off: 0,
        }
    }

    /// Clear the claimed half after a drain (terminator at the head).
    pub fn clear(&self, swap: u32) {
        let term = PkthdrTx::default();
        // SAFETY: the drain side owns the half for this swap generation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes_of(&term).as_ptr(),
                self.region.at(self.half_base(swap)),
                std::mem::size_of::<PkthdrTx>(),
            );
        }
    }
}

pub struct TxRecordIter<'a> {
    ring: &'a TxRing,
    half: usize,
    off: usize,
}

impl<'a> Iterator for TxRecordIter<'a> {
    type Item = TxRecord<'a>;

    fn next(&mut self) -> Option<TxRecord<'a>> {
        let hdr_size = std::mem::size_of::<PkthdrTx>();
        if self.off + hdr_size > self.ring.half_size {
            return None;
        }
        // SAFETY: bounds checked above; the drain side owns the half.
        let hdr: PkthdrTx = unsafe {
            pod_read_unaligned(std::slice::from_raw_parts(
                self.ring.region.at(self.half + self.off),
                hdr_size,
            ))
        };
        if hdr.len == 0 {
            return None;
        }
        let len = hdr.len as usize;
        if self.off + pfq_common::tx_record_size(len) > self.ring.half_size {
            // corrupted length; stop rather than overrun the half
            return None;
        }
        // SAFETY: record bounds validated against the half size.
        let payload = unsafe {
            std::slice::from_raw_parts(
                self.ring.region.at(self.half + self.off + hdr_size),
                len,
            )
        };
        self.off += pfq_common::tx_record_size(len);
        Some(TxRecord {
            nsec: hdr.nsec,
            payload,
        })
    }
}
