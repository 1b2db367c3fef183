//! Shared ABI types between the pfq engine and user-space ring consumers.
//!
//! This crate is `no_std` compatible so it can be used from minimal ring
//! readers mapped against the engine's shared memory. All types are
//! `repr(C)` with explicit padding for a stable, `Pod`-safe ABI across the
//! engine/consumer boundary. Integers are host-endian in shared memory and
//! little-endian when persisted.

#![no_std]

#[cfg(test)]
extern crate std;

use bytemuck::{Pod, Zeroable};

// ---------------------------------------------------------------------------
// Engine Bounds
// ---------------------------------------------------------------------------

/// Maximum number of endpoints (socket ids).
pub const MAX_ID: usize = 64;

/// Maximum number of groups (gids).
pub const MAX_GID: usize = 64;

/// Number of fanout classes per group.
pub const MAX_CLASS: usize = 16;

/// Default fanout class mask (class 0).
pub const CLASS_DEFAULT_MASK: u16 = 1;

/// Fanout class mask selecting every class.
pub const CLASS_ANY_MASK: u16 = u16::MAX;

/// Tx queues per endpoint.
pub const MAX_TX_QUEUES: usize = 4;

/// Argument slots per functional node.
pub const MAX_FUN_ARGS: usize = 8;

/// Maximum inline size of a single argument slot, in bytes.
pub const ARG_INLINE_MAX: usize = 64;

/// Symbol name bound for functional descriptors.
pub const SYMBOL_LEN: usize = 64;

/// Maximum forwarding targets recorded in a per-packet GC log entry.
pub const GC_LOG_LEN: usize = 16;

/// Default Rx/Tx batch length.
pub const DEFAULT_BATCH_LEN: usize = 32;

/// Default maximum capture length (MTU + Ethernet header).
pub const DEFAULT_MAXLEN: usize = 1514;

/// Join request wildcard: pick the smallest free gid.
pub const ANY_GROUP: i32 = -1;

/// Tx binding wildcard: the queue is drained in user context, no thread.
pub const NO_KTHREAD: i32 = -1;

/// Hardware queue wildcard: let the device pick.
pub const ANY_QUEUE: i32 = -1;

// ---------------------------------------------------------------------------
// Protocol Constants
// ---------------------------------------------------------------------------

/// Ethernet header size.
pub const ETH_HLEN: usize = 14;

/// Minimum IPv4 header size (no options).
pub const IP_HLEN: usize = 20;

/// EtherType for IPv4.
pub const ETH_P_IP: u16 = 0x0800;

/// EtherType for 802.1Q VLAN tagging.
pub const ETH_P_8021Q: u16 = 0x8100;

/// IP protocol numbers.
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// VLAN id mask within the TCI field.
pub const VLAN_VID_MASK: u16 = 0x0fff;

/// Pseudo-vid admitting untagged frames through a vlan filter.
pub const VLAN_UNTAGGED: u16 = 0x1000;

// ---------------------------------------------------------------------------
// Rx Ring ABI
// ---------------------------------------------------------------------------

/// Per-slot packet header in the shared Rx ring.
///
/// Field order is part of the ABI. `commit` is the publication sentinel:
/// the producer writes it last (release ordering) with the slot sequence
/// number; a consumer at index `c` accepts the slot once `commit == c + 1`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Pkthdr {
    /// Captured length (bytes stored in the slot payload).
    pub caplen: u16,
    /// Original frame length on the wire.
    pub len: u16,
    pub _pad: u32,
    /// Capture timestamp, monotonic nanoseconds (0 when disabled).
    pub tstamp_ns: u64,
    /// Receiving interface index.
    pub if_index: i32,
    /// Hardware queue the frame arrived on.
    pub hw_queue: u16,
    /// Group that delivered the frame.
    pub gid: u16,
    /// Publication sentinel, written last with release ordering.
    pub commit: u32,
    pub _pad2: u32,
}

/// Shared Rx ring header: producer/consumer indices ahead of the slots.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct RxQueueHdr {
    /// Next slot index the engine will fill (free-running).
    pub producer: u64,
    /// Next slot index the consumer will read (free-running).
    pub consumer: u64,
}

/// Round `n` up to 8-byte alignment.
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Rx slot size for a given capture length.
pub const fn rx_slot_size(caplen: usize) -> usize {
    align8(caplen + core::mem::size_of::<Pkthdr>())
}

// ---------------------------------------------------------------------------
// Tx Ring ABI
// ---------------------------------------------------------------------------

/// Per-packet header in a Tx ring half. The payload follows inline, padded
/// to 8 bytes. A header with `len == 0` terminates the half.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PkthdrTx {
    /// Payload length in bytes.
    pub len: u16,
    pub _pad: u16,
    pub _pad2: u32,
    /// Desired transmit time, nanoseconds since the epoch (0 = immediately).
    pub nsec: u64,
}

/// Shared Tx ring header: double-buffer swap counters.
///
/// `prod` counts halves published by the user; `cons` counts halves claimed
/// by the drain side. The half being drained for swap generation `s` is
/// `s & 1`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct TxQueueHdr {
    pub prod: u32,
    pub cons: u32,
}

/// Bytes occupied by one Tx record with the given payload length.
pub const fn tx_record_size(len: usize) -> usize {
    core::mem::size_of::<PkthdrTx>() + align8(len)
}

// ---------------------------------------------------------------------------
// Computation Wire Format
// ---------------------------------------------------------------------------

/// Functional descriptor kind tags.
pub const FUN_MONADIC: u32 = 0;
pub const FUN_HIGH_ORDER: u32 = 1;
pub const FUN_PREDICATE: u32 = 2;
pub const FUN_COMBINATOR: u32 = 3;

/// Child index wildcard: no child.
pub const FUN_NO_INDEX: i32 = -1;

/// One erased argument slot of a functional descriptor.
///
/// Scalars up to 8 bytes are stored by value in `value`; larger arguments
/// and arrays travel out-of-line (`value` is an address in the submitting
/// address space). `nelem > 0` marks an array of `nelem` elements of
/// `size` bytes each.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ArgDescr {
    pub value: u64,
    pub size: u32,
    pub nelem: u32,
}

/// Wire-format descriptor of one functional node.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FunctionalDescr {
    /// One of `FUN_MONADIC`, `FUN_HIGH_ORDER`, `FUN_PREDICATE`,
    /// `FUN_COMBINATOR`.
    pub kind: u32,
    /// NUL-padded symbol name.
    pub symbol: [u8; SYMBOL_LEN],
    pub _pad: u32,
    pub arg: [ArgDescr; MAX_FUN_ARGS],
    /// Left child (predicate for high-order nodes), `FUN_NO_INDEX` if absent.
    pub l_index: i32,
    /// Right child, `FUN_NO_INDEX` if absent.
    pub r_index: i32,
}

impl Default for FunctionalDescr {
    fn default() -> Self {
        FunctionalDescr {
            kind: FUN_MONADIC,
            symbol: [0; SYMBOL_LEN],
            _pad: 0,
            arg: [ArgDescr::default(); MAX_FUN_ARGS],
            l_index: FUN_NO_INDEX,
            r_index: FUN_NO_INDEX,
        }
    }
}

/// Header of a submitted computation: `size` descriptors follow.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ComputationDescr {
    pub size: u32,
    pub entry_point: u32,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counter snapshot returned by `stats` / `group_stats`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Statistics {
    /// Packets delivered into an Rx ring.
    pub recv: u64,
    /// Packets lost to a full (or absent) Rx ring.
    pub lost: u64,
    /// Packets discarded by the computation.
    pub drop: u64,
    /// Packets transmitted by the Tx engine.
    pub sent: u64,
    /// Packets discarded on the Tx path (congestion, interruption).
    pub disc: u64,
    /// Packets lazily forwarded to devices.
    pub frwd: u64,
    /// Packets handed back to the kernel stack.
    pub kern: u64,
}

/// Skbuff pool counter snapshot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PoolStats {
    /// Buffers allocated from the OS allocator.
    pub os_alloc: u64,
    /// Buffers released to the OS allocator.
    pub os_free: u64,
    /// Buffers recycled out of a pool.
    pub pool_pop: u64,
    /// Buffers recycled into a pool.
    pub pool_push: u64,
}

// ---------------------------------------------------------------------------
// Maybe-u64 Property Encoding
// ---------------------------------------------------------------------------

/// ABI encoding of an absent property value.
pub const NOTHING: u64 = 0;

const JUST_TAG: u64 = 1 << 63;

/// Encode a present property value (low 63 bits).
pub const fn just(v: u64) -> u64 {
    JUST_TAG | (v & !JUST_TAG)
}

/// Whether an encoded property value is present.
pub const fn is_just(v: u64) -> bool {
    v & JUST_TAG != 0
}

/// Decode a present property value.
pub const fn from_just(v: u64) -> u64 {
    v & !JUST_TAG
}

/// Decode an encoded property value into an option.
pub const fn maybe(v: u64) -> Option<u64> {
    if is_just(v) {
        Some(from_just(v))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tx Result Encoding
// ---------------------------------------------------------------------------

/// Collapse a Tx drain outcome into the signed ABI integer: `sent` when the
/// drain ran to completion, `~sent` (= `-(sent + 1)`) when it was
/// interrupted by a signal or a stop request.
pub const fn encode_tx_result(sent: usize, interrupted: bool) -> i64 {
    if interrupted {
        !(sent as i64)
    } else {
        sent as i64
    }
}

/// Split the signed ABI integer back into `(sent, interrupted)`.
pub const fn decode_tx_result(raw: i64) -> (usize, bool) {
    if raw < 0 {
        (!raw as usize, true)
    } else {
        (raw as usize, false)
    }
}

// ---------------------------------------------------------------------------
// Layout Assertions
// ---------------------------------------------------------------------------

const _: () = assert!(core::mem::size_of::<Pkthdr>() == 32);
const _: () = assert!(core::mem::size_of::<PkthdrTx>() == 16);
const _: () = assert!(core::mem::size_of::<RxQueueHdr>() == 16);
const _: () = assert!(core::mem::size_of::<TxQueueHdr>() == 8);
const _: () = assert!(core::mem::size_of::<ArgDescr>() == 16);
const _: () = assert!(core::mem::size_of::<FunctionalDescr>() == 208);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_size_is_aligned() {
        assert_eq!(rx_slot_size(64), 96);
        assert_eq!(rx_slot_size(1514), align8(1514 + 32));
        assert_eq!(rx_slot_size(0) % 8, 0);
    }

    #[test]
    fn tx_record_padding() {
        assert_eq!(tx_record_size(0), 16);
        assert_eq!(tx_record_size(1), 24);
        assert_eq!(tx_record_size(8), 24);
        assert_eq!(tx_record_size(9), 32);
    }

    #[test]
    fn maybe_roundtrip() {
        assert_eq!(maybe(NOTHING), None);
        assert_eq!(maybe(just(0)), Some(0));
        assert_eq!(maybe(just(42)), Some(42));
        assert!(is_just(just(u64::MAX)));
        assert_eq!(from_just(just(7)), 7);
    }

    #[test]
    fn tx_result_roundtrip() {
        assert_eq!(encode_tx_result(0, false), 0);
        assert_eq!(encode_tx_result(5, false), 5);
        assert_eq!(encode_tx_result(0, true), -1);
        assert_eq!(encode_tx_result(5, true), -6);
        assert_eq!(decode_tx_result(5), (5, false));
        assert_eq!(decode_tx_result(-6), (5, true));
        assert_eq!(decode_tx_result(-1), (0, true));
    }

    #[test]
    fn commit_offset_is_stable() {
        assert_eq!(core::mem::offset_of!(Pkthdr, commit), 24);
        assert_eq!(core::mem::offset_of!(Pkthdr, tstamp_ns), 8);
    }
}
