//! Built-in functional primitives.
//!
//! Evaluation functions are plain `fn` pointers over the node and the
//! per-packet monad. Stateful primitives keep their accumulator in the
//! node's atomic cell; derived state built at `init` time (the bloom
//! bitset) lives in a spare argument slot.

use std::sync::atomic::Ordering;

use pfq_common::{CLASS_ANY_MASK, VLAN_UNTAGGED};

use crate::error::{PfqError, Result};
use crate::lang::args::ArgSig;
use crate::lang::symtable::{Category, SymbolEntry};
use crate::lang::{CombKind, FanoutKind, Flow, HighOrderKind, Node, NodeFun, QBuff};
use crate::skbuff::mix;

const SIG_NONE: &[ArgSig] = &[];
const SIG_I32: &[ArgSig] = &[ArgSig::Scalar(4)];
const SIG_U16: &[ArgSig] = &[ArgSig::Scalar(2)];
const SIG_U32: &[ArgSig] = &[ArgSig::Scalar(4)];
const SIG_U64: &[ArgSig] = &[ArgSig::Scalar(8)];
const SIG_VIDS: &[ArgSig] = &[ArgSig::Array(2)];
const SIG_BLOOM: &[ArgSig] = &[ArgSig::Scalar(4), ArgSig::Array(4)];

// ---------------------------------------------------------------------------
// Steering
// ---------------------------------------------------------------------------

#[inline]
fn steer(qb: &mut QBuff<'_>, hash: Option<u32>) -> Flow {
    match hash {
        Some(h) => {
            qb.fanout.kind = FanoutKind::Steer;
            qb.fanout.hash = h;
            Flow::Next
        }
        None => {
            qb.fanout.kind = FanoutKind::Drop;
            Flow::Stop
        }
    }
}

fn steer_ip(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    steer(qb, qb.skb.ip_hash())
}

fn steer_flow(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    steer(qb, qb.skb.flow_hash())
}

fn steer_mac(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    steer(qb, qb.skb.mac_hash())
}

fn steer_vlan(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    steer(qb, qb.skb.vlan_id().map(|vid| mix(vid as u32)))
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[inline]
fn filter(qb: &mut QBuff<'_>, keep: bool) -> Flow {
    if keep {
        Flow::Next
    } else {
        qb.fanout.kind = FanoutKind::Drop;
        Flow::Stop
    }
}

fn filter_ip(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    filter(qb, qb.skb.is_ipv4())
}

fn filter_udp(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    filter(qb, qb.skb.ip_proto() == Some(pfq_common::IPPROTO_UDP))
}

fn filter_tcp(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    filter(qb, qb.skb.ip_proto() == Some(pfq_common::IPPROTO_TCP))
}

fn filter_vlan(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    filter(qb, qb.skb.vlan_id().is_some())
}

/// Admit only the vlan ids listed in the argument; `VLAN_UNTAGGED` in the
/// list admits untagged frames.
fn vlan_id_filter(node: &Node, qb: &mut QBuff<'_>) -> Flow {
    let vids = node.arg(0).slice::<u16>();
    let admit = match qb.skb.vlan_id() {
        Some(vid) => vids.contains(&vid),
        None => vids.contains(&VLAN_UNTAGGED),
    };
    filter(qb, admit)
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

fn forward(node: &Node, qb: &mut QBuff<'_>) -> Flow {
    let if_index = node.arg(0).get::<i32>();
    qb.log.push(if_index, pfq_common::ANY_QUEUE);
    Flow::Next
}

/// Forward to the device and consume the packet: no socket delivery.
fn bridge(node: &Node, qb: &mut QBuff<'_>) -> Flow {
    let if_index = node.arg(0).get::<i32>();
    qb.log.push(if_index, pfq_common::ANY_QUEUE);
    qb.fanout.kind = FanoutKind::Sink;
    Flow::Stop
}

fn sink(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    qb.fanout.kind = FanoutKind::Sink;
    Flow::Stop
}

fn drop_fn(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    qb.fanout.kind = FanoutKind::Drop;
    Flow::Stop
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

fn id(_: &Node, _: &mut QBuff<'_>) -> Flow {
    Flow::Next
}

fn dummy(node: &Node, _: &mut QBuff<'_>) -> Flow {
    let _ = node.arg(0).get::<i32>();
    Flow::Next
}

fn counter(node: &Node, _: &mut QBuff<'_>) -> Flow {
    node.state.fetch_add(1, Ordering::Relaxed);
    Flow::Next
}

fn counter_init(node: &mut Node) -> Result<()> {
    let initial = node.args[0].get::<u64>();
    *node.state.get_mut() = initial;
    Ok(())
}

fn class(node: &Node, qb: &mut QBuff<'_>) -> Flow {
    let mask = node.arg(0).get::<u16>();
    if mask != 0 {
        qb.fanout.class_mask = mask;
    }
    Flow::Next
}

fn broadcast(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    qb.fanout.kind = FanoutKind::Copy;
    qb.fanout.class_mask = CLASS_ANY_MASK;
    Flow::Next
}

fn mark(node: &Node, qb: &mut QBuff<'_>) -> Flow {
    qb.state = node.arg(0).get::<u32>();
    Flow::Next
}

fn kernel(_: &Node, qb: &mut QBuff<'_>) -> Flow {
    qb.to_kernel = true;
    Flow::Next
}

// ---------------------------------------------------------------------------
// Bloom
// ---------------------------------------------------------------------------

/// Derived bitset slot index (past the two declared arguments).
const BLOOM_STATE_ARG: usize = 2;

#[inline]
fn bloom_bits(m: u32, addr: u32) -> (usize, usize) {
    let h1 = mix(addr) & (m - 1);
    let h2 = mix(addr.rotate_left(16) ^ 0x9e37_79b9) & (m - 1);
    (h1 as usize, h2 as usize)
}

/// Build the bitset from the address list once, ahead of the first packet.
fn bloom_init(node: &mut Node) -> Result<()> {
    let m = node.args[0].get::<u32>();
    if !m.is_power_of_two() || m < 8 {
        return Err(PfqError::invalid("bloom filter size must be a power of two >= 8"));
    }
    let mut bits = vec![0u8; (m as usize) / 8];
    let addrs: Vec<u32> = node.args[1].slice::<u32>().to_vec();
    for addr in addrs {
        let (b1, b2) = bloom_bits(m, addr);
        bits[b1 / 8] |= 1 << (b1 % 8);
        bits[b2 / 8] |= 1 << (b2 % 8);
    }
    node.args[BLOOM_STATE_ARG].store_bytes(bits, 0);
    Ok(())
}

fn bloom_fini(node: &mut Node) {
    node.args[BLOOM_STATE_ARG].store_bytes(Vec::new(), 0);
}

#[inline]
fn bloom_member(node: &Node, addr: Option<u32>) -> bool {
    let m = node.arg(0).get::<u32>();
    let bits = node.arg(BLOOM_STATE_ARG);
    match addr {
        Some(a) if m >= 8 => {
            let (b1, b2) = bloom_bits(m, a);
            let set = |b: usize| bits.slice::<u8>().get(b / 8).map_or(false, |v| v & (1 << (b % 8)) != 0);
            set(b1) && set(b2)
        }
        _ => false,
    }
}

fn bloom_src(node: &Node, qb: &mut QBuff<'_>) -> Flow {
    filter(qb, bloom_member(node, qb.skb.ip_src()))
}

fn bloom_dst(node: &Node, qb: &mut QBuff<'_>) -> Flow {
    filter(qb, bloom_member(node, qb.skb.ip_dst()))
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

fn is_ip(_: &Node, qb: &QBuff<'_>) -> bool {
    qb.skb.is_ipv4()
}

fn is_udp(_: &Node, qb: &QBuff<'_>) -> bool {
    qb.skb.ip_proto() == Some(pfq_common::IPPROTO_UDP)
}

fn is_tcp(_: &Node, qb: &QBuff<'_>) -> bool {
    qb.skb.ip_proto() == Some(pfq_common::IPPROTO_TCP)
}

fn is_icmp(_: &Node, qb: &QBuff<'_>) -> bool {
    qb.skb.ip_proto() == Some(pfq_common::IPPROTO_ICMP)
}

fn has_vlan(_: &Node, qb: &QBuff<'_>) -> bool {
    qb.skb.vlan_id().is_some()
}

fn is_flow(_: &Node, qb: &QBuff<'_>) -> bool {
    qb.skb.ports().is_some()
}

fn has_mark(node: &Node, qb: &QBuff<'_>) -> bool {
    qb.state == node.arg(0).get::<u32>()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

fn ip_tos(_: &Node, qb: &QBuff<'_>) -> Option<u64> {
    qb.skb.ip_tos().map(u64::from)
}

fn ip_ttl(_: &Node, qb: &QBuff<'_>) -> Option<u64> {
    qb.skb.ip_ttl().map(u64::from)
}

fn ip_tot_len(_: &Node, qb: &QBuff<'_>) -> Option<u64> {
    qb.skb.ip_tot_len().map(u64::from)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

fn entry(
    symbol: &'static str,
    category: Category,
    fun: NodeFun,
    signature: &'static [ArgSig],
) -> SymbolEntry {
    SymbolEntry {
        symbol,
        category,
        fun,
        signature,
        init: None,
        fini: None,
    }
}

/// The built-in primitive set.
pub fn default_symbols() -> Vec<SymbolEntry> {
    use Category::*;
    use NodeFun::*;

    let mut counter_entry = entry("counter", Misc, Monadic(counter), SIG_U64);
    counter_entry.init = Some(counter_init);

    let mut bloom_src_entry = entry("bloom_src", Bloom, Monadic(bloom_src), SIG_BLOOM);
    bloom_src_entry.init = Some(bloom_init);
    bloom_src_entry.fini = Some(bloom_fini);

    let mut bloom_dst_entry = entry("bloom_dst", Bloom, Monadic(bloom_dst), SIG_BLOOM);
    bloom_dst_entry.init = Some(bloom_init);
    bloom_dst_entry.fini = Some(bloom_fini);

    vec![
        // steering
        entry("steer_ip", Steering, Monadic(steer_ip), SIG_NONE),
        entry("steer_flow", Steering, Monadic(steer_flow), SIG_NONE),
        entry("steer_mac", Steering, Monadic(steer_mac), SIG_NONE),
        entry("steer_vlan", Steering, Monadic(steer_vlan), SIG_NONE),
        // filters
        entry("ip", Filter, Monadic(filter_ip), SIG_NONE),
        entry("udp", Filter, Monadic(filter_udp), SIG_NONE),
        entry("tcp", Filter, Monadic(filter_tcp), SIG_NONE),
        entry("vlan", Filter, Monadic(filter_vlan), SIG_NONE),
        // vlan
        entry("vlan_id_filter", Vlan, Monadic(vlan_id_filter), SIG_VIDS),
        // forwarding
        entry("forward", Forward, Monadic(forward), SIG_I32),
        entry("bridge", Forward, Monadic(bridge), SIG_I32),
        entry("sink", Forward, Monadic(sink), SIG_NONE),
        entry("drop", Forward, Monadic(drop_fn), SIG_NONE),
        // misc
        entry("id", Misc, Monadic(id), SIG_NONE),
        entry("dummy", Misc, Monadic(dummy), SIG_I32),
        counter_entry,
        entry("class", Misc, Monadic(class), SIG_U16),
        entry("broadcast", Misc, Monadic(broadcast), SIG_NONE),
        entry("mark", Misc, Monadic(mark), SIG_U32),
        entry("kernel", Misc, Monadic(kernel), SIG_NONE),
        // bloom
        bloom_src_entry,
        bloom_dst_entry,
        // predicates
        entry("is_ip", Category::Predicate, NodeFun::Predicate(is_ip), SIG_NONE),
        entry("is_udp", Category::Predicate, NodeFun::Predicate(is_udp), SIG_NONE),
        entry("is_tcp", Category::Predicate, NodeFun::Predicate(is_tcp), SIG_NONE),
        entry("is_icmp", Category::Predicate, NodeFun::Predicate(is_icmp), SIG_NONE),
        entry("has_vlan", Category::Predicate, NodeFun::Predicate(has_vlan), SIG_NONE),
        entry("is_flow", Category::Predicate, NodeFun::Predicate(is_flow), SIG_NONE),
        entry("has_mark", Category::Predicate, NodeFun::Predicate(has_mark), SIG_U32),
        // combinators
        entry("or", Category::Combinator, NodeFun::Combinator(CombKind::Or), SIG_NONE),
        entry("and", Category::Combinator, NodeFun::Combinator(CombKind::And), SIG_NONE),
        entry("xor", Category::Combinator, NodeFun::Combinator(CombKind::Xor), SIG_NONE),
        // properties
        entry("ip_tos", Category::Property, NodeFun::Property(ip_tos), SIG_NONE),
        entry("ip_ttl", Category::Property, NodeFun::Property(ip_ttl), SIG_NONE),
        entry("ip_tot_len", Category::Property, NodeFun::Property(ip_tot_len), SIG_NONE),
        // high-order
        entry(
            "conditional",
            Category::HighOrder,
            NodeFun::HighOrder(HighOrderKind::Conditional),
            SIG_NONE,
        ),
        entry("when", Category::HighOrder, NodeFun::HighOrder(HighOrderKind::When), SIG_NONE),
        entry(
            "unless",
            Category::HighOrder,
            NodeFun::HighOrder(HighOrderKind::Unless),
            SIG_NONE,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::GcLog;
    use crate::lang::args::ArgSlot;
    use crate::skbuff::{build_udp_frame, SkBuff};
    use std::sync::atomic::AtomicU64;

    fn node_with(fun: NodeFun, args: Vec<ArgSlot>) -> Node {
        let mut slots: [ArgSlot; pfq_common::MAX_FUN_ARGS] = Default::default();
        for (i, a) in args.into_iter().enumerate() {
            slots[i] = a;
        }
        Node {
            fun,
            symbol: "test",
            args: slots,
            state: AtomicU64::new(0),
            init: None,
            fini: None,
            initialized: false,
            next: None,
            left: None,
            right: None,
        }
    }

    fn udp_skb() -> SkBuff {
        let mut skb = SkBuff::with_capacity(2048);
        skb.fill(
            &build_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 4000, 5000, b"pay"),
            1,
            0,
        );
        skb
    }

    #[test]
    fn steer_flow_sets_hash() {
        let skb = udp_skb();
        let mut log = GcLog::new();
        let mut qb = QBuff::new(&skb, &mut log);
        let node = node_with(NodeFun::Monadic(steer_flow), vec![]);

        assert_eq!(steer_flow(&node, &mut qb), Flow::Next);
        assert_eq!(qb.fanout.kind, FanoutKind::Steer);
        assert_eq!(qb.fanout.hash, skb.flow_hash().unwrap());
    }

    #[test]
    fn steer_on_non_ip_drops() {
        let mut skb = SkBuff::with_capacity(64);
        skb.fill(&[0u8; 14], 1, 0);
        let mut log = GcLog::new();
        let mut qb = QBuff::new(&skb, &mut log);
        let node = node_with(NodeFun::Monadic(steer_ip), vec![]);

        assert_eq!(steer_ip(&node, &mut qb), Flow::Stop);
        assert_eq!(qb.fanout.kind, FanoutKind::Drop);
    }

    #[test]
    fn filters_keep_matching_packets() {
        let skb = udp_skb();
        let mut log = GcLog::new();
        let mut qb = QBuff::new(&skb, &mut log);
        let node = node_with(NodeFun::Monadic(filter_udp), vec![]);

        assert_eq!(filter_udp(&node, &mut qb), Flow::Next);
        assert_eq!(qb.fanout.kind, FanoutKind::Copy);

        let tcp_node = node_with(NodeFun::Monadic(filter_tcp), vec![]);
        assert_eq!(filter_tcp(&tcp_node, &mut qb), Flow::Stop);
        assert_eq!(qb.fanout.kind, FanoutKind::Drop);
    }

    #[test]
    fn counter_accumulates_from_initial() {
        let mut node = node_with(
            NodeFun::Monadic(counter),
            vec![ArgSlot::scalar(100u64)],
        );
        counter_init(&mut node).unwrap();

        let skb = udp_skb();
        let mut log = GcLog::new();
        let mut qb = QBuff::new(&skb, &mut log);
        counter(&node, &mut qb);
        counter(&node, &mut qb);
        assert_eq!(node.state.load(Ordering::Relaxed), 102);
    }

    #[test]
    fn mark_and_has_mark() {
        let skb = udp_skb();
        let mut log = GcLog::new();
        let mut qb = QBuff::new(&skb, &mut log);

        let set = node_with(NodeFun::Monadic(mark), vec![ArgSlot::scalar(22u32)]);
        mark(&set, &mut qb);
        assert_eq!(qb.state, 22);

        let probe = node_with(
            NodeFun::Predicate(has_mark),
            vec![ArgSlot::scalar(22u32)],
        );
        assert!(has_mark(&probe, &qb));

        let probe_other = node_with(
            NodeFun::Predicate(has_mark),
            vec![ArgSlot::scalar(23u32)],
        );
        assert!(!has_mark(&probe_other, &qb));
    }

    #[test]
    fn forward_appends_to_log() {
        let skb = udp_skb();
        let mut log = GcLog::new();
        let mut qb = QBuff::new(&skb, &mut log);
        let node = node_with(NodeFun::Monadic(forward), vec![ArgSlot::scalar(3i32)]);

        assert_eq!(forward(&node, &mut qb), Flow::Next);
        assert_eq!(qb.log.num_devs(), 1);
        assert_eq!(qb.log.count_dev(3), 1);
    }

    #[test]
    fn bloom_membership() {
        let members = [u32::from_be_bytes([10, 0, 0, 1]), u32::from_be_bytes([10, 0, 0, 7])];
        let mut node = node_with(
            NodeFun::Monadic(bloom_src),
            vec![ArgSlot::scalar(1024u32), ArgSlot::array(&members)],
        );
        bloom_init(&mut node).unwrap();

        let skb = udp_skb(); // src 10.0.0.1
        let mut log = GcLog::new();
        let mut qb = QBuff::new(&skb, &mut log);
        assert_eq!(bloom_src(&node, &mut qb), Flow::Next);

        // destination 10.0.0.2 is not a member
        let mut qb2 = QBuff::new(&skb, &mut log);
        assert_eq!(bloom_dst(&node, &mut qb2), Flow::Stop);

        bloom_fini(&mut node);
        assert!(node.args[BLOOM_STATE_ARG].is_empty());
    }

    #[test]
    fn bloom_init_rejects_bad_size() {
        let mut node = node_with(
            NodeFun::Monadic(bloom_src),
            vec![ArgSlot::scalar(100u32), ArgSlot::array(&[1u32])],
        );
        assert!(bloom_init(&mut node).is_err());
    }

    #[test]
    fn vlan_filter_admits_untagged_when_listed() {
        let skb = udp_skb(); // untagged
        let mut log = GcLog::new();

        let node = node_with(
            NodeFun::Monadic(vlan_id_filter),
            vec![ArgSlot::array(&[22u16, VLAN_UNTAGGED])],
        );
        let mut qb = QBuff::new(&skb, &mut log);
        assert_eq!(vlan_id_filter(&node, &mut qb), Flow::Next);

        let strict = node_with(
            NodeFun::Monadic(vlan_id_filter),
            vec![ArgSlot::array(&[22u16])],
        );
        let mut qb2 = QBuff::new(&skb, &mut log);
        assert_eq!(vlan_id_filter(&strict, &mut qb2), Flow::Stop);
    }

    #[test]
    fn properties_on_udp_frame() {
        let skb = udp_skb();
        let mut log = GcLog::new();
        let qb = QBuff::new(&skb, &mut log);
        let node = node_with(NodeFun::Property(ip_ttl), vec![]);
        assert_eq!(ip_ttl(&node, &qb), Some(64));
        assert_eq!(ip_tos(&node, &qb), Some(0));
        assert!(ip_tot_len(&node, &qb).unwrap() > 28);
    }
}
