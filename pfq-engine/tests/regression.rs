//! Control-surface regression suite.
//!
//! Exercises the engine facade the way a user-space binding would: open,
//! parameter discipline, group membership policies, vlan filters, Tx
//! bindings and the end-to-end capture scenarios.

use std::sync::Arc;

use rand::Rng;

use pfq_common::{ANY_GROUP, NO_KTHREAD};
use pfq_engine::dev::MemDevice;
use pfq_engine::lang::args::ArgSlot;
use pfq_engine::lang::compile::FunctionDescr;
use pfq_engine::{Engine, EngineSettings, GroupPolicy, PfqError, RawPacket};

const PID_A: u32 = 1000;
const PID_B: u32 = 2000;

fn engine() -> Arc<Engine> {
    let engine = Engine::new(EngineSettings {
        cpus: 2,
        ..EngineSettings::default()
    });
    engine.devices.register(MemDevice::new("eth0")).unwrap();
    engine.devices.register(MemDevice::new("lo")).unwrap();
    engine
}

fn open(engine: &Arc<Engine>, policy: GroupPolicy) -> usize {
    engine.open_from(policy, 64, PID_A).unwrap()
}

fn udp_frame(sport: u16, dport: u16) -> Vec<u8> {
    pfq_engine::skbuff::build_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], sport, dport, b"payload")
}

// ---------------------------------------------------------------------------
// Endpoint Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn open_close() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);

    e.close(id).unwrap();
    assert_eq!(e.caplen(id).unwrap_err(), PfqError::NotEnabled);
}

#[test]
fn enable_disable() {
    let e = engine();
    assert!(e.enable(0).is_err());
    assert!(e.disable(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);

    e.enable(id).unwrap();
    assert!(e.mem_addr(id).unwrap().is_some());

    e.disable(id).unwrap();
    assert_eq!(e.mem_addr(id).unwrap(), None);
}

#[test]
fn enabled() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);
    assert!(!e.is_enabled(id).unwrap());
    e.enable(id).unwrap();
    assert!(e.is_enabled(id).unwrap());
}

#[test]
fn timestamp() {
    let e = engine();
    assert!(e.timestamp_enable(0, true).is_err());
    assert!(e.timestamp_enabled(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    e.timestamp_enable(id, true).unwrap();
    assert!(e.timestamp_enabled(id).unwrap());
}

#[test]
fn caplen() {
    let e = engine();
    assert!(e.set_caplen(0, 64).is_err());
    assert!(e.caplen(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    e.set_caplen(id, 128).unwrap();
    assert_eq!(e.caplen(id).unwrap(), 128);

    e.enable(id).unwrap();
    assert_eq!(e.set_caplen(id, 64).unwrap_err(), PfqError::Busy);
    e.disable(id).unwrap();

    e.set_caplen(id, 64).unwrap();
    assert_eq!(e.caplen(id).unwrap(), 64);
}

#[test]
fn maxlen() {
    let e = engine();
    assert!(e.maxlen(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    assert_eq!(e.maxlen(id).unwrap(), 1514);
}

#[test]
fn rx_slots() {
    let e = engine();
    assert!(e.set_rx_slots(0, 16).is_err());
    assert!(e.rx_slots(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    e.set_rx_slots(id, 1024).unwrap();
    assert_eq!(e.rx_slots(id).unwrap(), 1024);

    e.enable(id).unwrap();
    assert_eq!(e.set_rx_slots(id, 4096).unwrap_err(), PfqError::Busy);
    e.disable(id).unwrap();

    e.set_rx_slots(id, 4096).unwrap();
    assert_eq!(e.rx_slots(id).unwrap(), 4096);
}

#[test]
fn rx_slot_size() {
    let e = engine();
    assert!(e.rx_slot_size(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    e.set_caplen(id, 64).unwrap();
    let hdr = std::mem::size_of::<pfq_common::Pkthdr>();
    assert_eq!(e.rx_slot_size(id).unwrap(), 64 + hdr);
}

#[test]
fn tx_slots() {
    let e = engine();
    assert!(e.set_tx_slots(0, 16).is_err());
    assert!(e.tx_slots(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    e.set_tx_slots(id, 1024).unwrap();
    assert_eq!(e.tx_slots(id).unwrap(), 1024);

    e.enable(id).unwrap();
    assert_eq!(e.set_tx_slots(id, 4096).unwrap_err(), PfqError::Busy);
    e.disable(id).unwrap();

    e.set_tx_slots(id, 4096).unwrap();
    assert_eq!(e.tx_slots(id).unwrap(), 4096);
}

// ---------------------------------------------------------------------------
// Capture Bindings
// ---------------------------------------------------------------------------

#[test]
fn bind_device() {
    let e = engine();
    assert!(e.bind(0, "eth0").is_err());

    let id = open(&e, GroupPolicy::Shared);
    assert!(matches!(
        e.bind(id, "unknown").unwrap_err(),
        PfqError::NotFound(_)
    ));
    e.bind(id, "eth0").unwrap();

    // not a member of group 11
    assert!(e.bind_group(id, 11, "eth0").is_err());
}

#[test]
fn unbind_device() {
    let e = engine();
    assert!(e.unbind(0, "eth0").is_err());

    let id = open(&e, GroupPolicy::Shared);
    assert!(matches!(
        e.unbind(id, "unknown").unwrap_err(),
        PfqError::NotFound(_)
    ));
    e.bind(id, "eth0").unwrap();
    e.unbind(id, "eth0").unwrap();

    assert!(e.unbind_group(id, 11, "eth0").is_err());
}

#[test]
fn poll() {
    let e = engine();
    assert!(e.poll(0, 10).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    assert_eq!(e.poll(id, 0).unwrap(), 0);
}

#[test]
fn read() {
    let e = engine();
    assert!(e.read(0, 10).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    assert_eq!(e.read(id, 10).unwrap_err(), PfqError::NotEnabled);

    e.enable(id).unwrap();
    assert!(e.read(id, 10).unwrap().is_empty());
    assert_eq!(e.stats(id).unwrap().recv, 0);
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[test]
fn stats() {
    let e = engine();
    assert!(e.stats(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    let s = e.stats(id).unwrap();
    assert_eq!(s.recv, 0);
    assert_eq!(s.lost, 0);
    assert_eq!(s.drop, 0);
}

#[test]
fn group_stats() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);

    assert!(e.group_stats(id, 11).is_err());

    e.join_group(id, 11, 0, GroupPolicy::Undefined).unwrap();

    let s = e.group_stats(id, 11).unwrap();
    assert_eq!(s.recv, 0);
    assert_eq!(s.lost, 0);
    assert_eq!(s.drop, 0);
}

#[test]
fn my_group_stats() {
    for policy in [GroupPolicy::Priv, GroupPolicy::Restricted, GroupPolicy::Shared] {
        let e = engine();
        let id = open(&e, policy);
        let gid = e.group_id(id).unwrap();
        assert!(gid >= 0);

        let s = e.group_stats(id, gid as usize).unwrap();
        assert_eq!(s.recv, 0);
        assert_eq!(s.lost, 0);
        assert_eq!(s.drop, 0);
    }
}

#[test]
fn groups_mask() {
    let e = engine();
    assert!(e.groups_mask(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    assert_eq!(e.groups_mask(id).unwrap(), 0);
    assert!(e.groups_of(id).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Group Membership
// ---------------------------------------------------------------------------

#[test]
fn join_restricted() {
    let e = engine();
    let x = open(&e, GroupPolicy::Restricted);
    let y = open(&e, GroupPolicy::Undefined);

    let gid = e.group_id(x).unwrap();
    assert_eq!(
        e.join_group(y, gid, 0, GroupPolicy::Restricted).unwrap(),
        gid as usize
    );
}

#[test]
fn join_deferred() {
    let e = engine();
    let x = open(&e, GroupPolicy::Undefined);

    e.join_group(x, 22, 0, GroupPolicy::Undefined).unwrap();
    e.join_group(x, 22, 0, GroupPolicy::Undefined).unwrap();

    // another endpoint joins the same deferred group
    let y = open(&e, GroupPolicy::Undefined);
    assert_eq!(e.join_group(y, 22, 0, GroupPolicy::Undefined).unwrap(), 22);
}

#[test]
fn join_restricted_process() {
    let e = engine();
    let x = e.open_from(GroupPolicy::Restricted, 64, PID_A).unwrap();
    let z = e.open_from(GroupPolicy::Shared, 64, PID_A).unwrap();

    // endpoint owned by another process
    let y = e.open_from(GroupPolicy::Undefined, 64, PID_B).unwrap();

    let shared_gid = e.group_id(z).unwrap();
    assert_eq!(
        e.join_group(y, shared_gid, 0, GroupPolicy::Undefined).unwrap(),
        shared_gid as usize
    );

    let restricted_gid = e.group_id(x).unwrap();
    assert_eq!(
        e.join_group(y, restricted_gid, 0, GroupPolicy::Undefined)
            .unwrap_err(),
        PfqError::AccessDenied
    );
}

#[test]
fn join_private() {
    let e = engine();
    let x = open(&e, GroupPolicy::Priv);
    let y = open(&e, GroupPolicy::Undefined);
    let gid = e.group_id(x).unwrap();

    for policy in [
        GroupPolicy::Restricted,
        GroupPolicy::Shared,
        GroupPolicy::Priv,
        GroupPolicy::Undefined,
    ] {
        assert!(
            e.join_group(y, gid, 0, policy).is_err(),
            "private group must reject {:?}",
            policy
        );
    }
}

#[test]
fn join_restricted_policies() {
    for (policy, ok) in [
        (GroupPolicy::Restricted, true),
        (GroupPolicy::Shared, false),
        (GroupPolicy::Priv, false),
        (GroupPolicy::Undefined, true),
    ] {
        let e = engine();
        let x = open(&e, GroupPolicy::Restricted);
        let y = open(&e, GroupPolicy::Undefined);
        let gid = e.group_id(x).unwrap();

        let result = e.join_group(y, gid, 0, policy);
        assert_eq!(result.is_ok(), ok, "restricted group, joiner {:?}", policy);
    }
}

#[test]
fn join_shared_policies() {
    for (policy, ok) in [
        (GroupPolicy::Restricted, false),
        (GroupPolicy::Shared, true),
        (GroupPolicy::Priv, false),
        (GroupPolicy::Undefined, true),
    ] {
        let e = engine();
        let x = open(&e, GroupPolicy::Shared);
        let y = open(&e, GroupPolicy::Undefined);
        let gid = e.group_id(x).unwrap();

        let result = e.join_group(y, gid, 0, policy);
        assert_eq!(result.is_ok(), ok, "shared group, joiner {:?}", policy);
    }
}

#[test]
fn join_public() {
    let e = engine();
    assert!(e.join_group(0, 12, 0, GroupPolicy::Undefined).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    assert_eq!(e.join_group(id, 0, 0, GroupPolicy::Undefined).unwrap(), 0);
    assert_eq!(
        e.join_group(id, ANY_GROUP, 0, GroupPolicy::Undefined).unwrap(),
        1
    );
    assert_eq!(e.groups_of(id).unwrap(), vec![0, 1]);
}

#[test]
fn leave_group() {
    let e = engine();
    assert!(e.leave_group(0, 12).is_err());

    let id = open(&e, GroupPolicy::Shared); // auto-joins gid 0
    assert_eq!(e.join_group(id, 22, 0, GroupPolicy::Undefined).unwrap(), 22);

    e.leave_group(id, 22).unwrap();
    assert_eq!(e.group_id(id).unwrap(), 0);
    assert_eq!(e.groups_of(id).unwrap(), vec![0]);

    // the left group's stats are no longer reachable
    assert!(e.group_stats(id, 22).is_err());
}

#[test]
fn gid() {
    let e = engine();
    assert!(e.group_id(0).is_err());

    let id = open(&e, GroupPolicy::Undefined);
    assert_eq!(e.group_id(id).unwrap(), -1);
}

// ---------------------------------------------------------------------------
// VLAN Filters
// ---------------------------------------------------------------------------

#[test]
fn vlan_enable() {
    let e = engine();
    let id = open(&e, GroupPolicy::Priv);
    let gid = e.group_id(id).unwrap() as usize;

    e.vlan_filters_enable(id, gid, true).unwrap();
    e.vlan_filters_enable(id, gid, false).unwrap();
}

#[test]
fn vlan_filt() {
    let e = engine();
    let id = open(&e, GroupPolicy::Priv);
    let gid = e.group_id(id).unwrap() as usize;

    assert!(e.vlan_set_filter(id, gid, 22).is_err());
    assert!(e.vlan_reset_filter(id, gid, 22).is_err());

    e.vlan_filters_enable(id, gid, true).unwrap();
    e.vlan_set_filter(id, gid, 22).unwrap();
    e.vlan_reset_filter(id, gid, 22).unwrap();

    e.vlan_filters_enable(id, gid, false).unwrap();
    assert!(e.vlan_set_filter(id, gid, 22).is_err());
}

// ---------------------------------------------------------------------------
// Tx Control
// ---------------------------------------------------------------------------

#[test]
fn bind_tx() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);
    e.bind_tx(id, "lo", NO_KTHREAD).unwrap();
    assert!(matches!(
        e.bind_tx(id, "unknown", NO_KTHREAD).unwrap_err(),
        PfqError::NotFound(_)
    ));
}

#[test]
fn tx_thread() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);
    e.bind_tx(id, "lo", NO_KTHREAD).unwrap();
    e.enable(id).unwrap();
}

#[test]
fn tx_queue_flush() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);
    assert!(e.tx_queue_flush(id, 0).is_err(), "queue not bound");

    e.bind_tx(id, "lo", NO_KTHREAD).unwrap();
    e.enable(id).unwrap();
    let out = e.tx_queue_flush(id, 0).unwrap();
    assert_eq!(out.sent, 0);
}

#[test]
fn egress_bind() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);
    e.egress_bind(id, "lo", -1).unwrap();
    assert!(matches!(
        e.egress_bind(id, "unknown", -1).unwrap_err(),
        PfqError::NotFound(_)
    ));
}

#[test]
fn egress_unbind() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);
    e.egress_unbind(id).unwrap();
}

// ---------------------------------------------------------------------------
// Computations
// ---------------------------------------------------------------------------

#[test]
fn set_computation_unknown_symbol() {
    let e = engine();
    let id = open(&e, GroupPolicy::Shared);
    let gid = e.group_id(id).unwrap() as usize;

    assert!(matches!(
        e.set_computation(id, gid, &[FunctionDescr::fun("nope")], 0)
            .unwrap_err(),
        PfqError::Invalid(_)
    ));
}

#[test]
fn set_computation_requires_membership() {
    let e = engine();
    let member = open(&e, GroupPolicy::Shared);
    let outsider = open(&e, GroupPolicy::Undefined);
    let gid = e.group_id(member).unwrap() as usize;

    assert_eq!(
        e.set_computation(outsider, gid, &[FunctionDescr::fun("id")], 0)
            .unwrap_err(),
        PfqError::AccessDenied
    );
}

// ---------------------------------------------------------------------------
// End-To-End Scenarios
// ---------------------------------------------------------------------------

/// S1: enable exposes memory, stats start clean.
#[test]
fn scenario_enable_mem_and_clean_stats() {
    let e = engine();
    let id = open(&e, GroupPolicy::Undefined);
    e.set_rx_slots(id, 1024).unwrap();
    e.enable(id).unwrap();

    assert!(e.mem_addr(id).unwrap().is_some());
    let s = e.stats(id).unwrap();
    assert_eq!((s.recv, s.lost, s.drop), (0, 0, 0));
}

/// S7: steer_flow >-> class keeps a flow on one member and spreads
/// distinct flows across both.
#[test]
fn scenario_flow_steering_fanout() {
    let e = engine();
    let a = e.open_from(GroupPolicy::Shared, 64, PID_A).unwrap();
    let b = e.open_from(GroupPolicy::Undefined, 64, PID_A).unwrap();
    e.join_group(b, 0, 1, GroupPolicy::Shared).unwrap();
    e.bind(a, "eth0").unwrap();
    e.enable(a).unwrap();
    e.enable(b).unwrap();

    e.set_computation(
        a,
        0,
        &[
            FunctionDescr::fun("steer_flow"),
            FunctionDescr::fun("class").with_arg(ArgSlot::scalar(1u16)),
        ],
        0,
    )
    .unwrap();

    // identical 5-tuple: every packet lands on the same member
    let flow = udp_frame(5000, 6000);
    e.receive(
        0,
        (0..16).map(|_| RawPacket {
            data: &flow,
            if_index: 1,
            hw_queue: 0,
        }),
    );
    let got_a = e.read(a, 0).unwrap().len();
    let got_b = e.read(b, 0).unwrap().len();
    assert_eq!(got_a + got_b, 16);
    assert!(
        got_a == 0 || got_b == 0,
        "a single flow must stay in one bucket"
    );

    // random flows: both members see traffic with overwhelming probability
    let mut rng = rand::thread_rng();
    let flows: Vec<Vec<u8>> = (0..128)
        .map(|_| udp_frame(rng.gen_range(1024..65000), rng.gen_range(1024..65000)))
        .collect();
    e.receive(
        0,
        flows.iter().map(|f| RawPacket {
            data: f,
            if_index: 1,
            hw_queue: 0,
        }),
    );
    assert!(!e.read(a, 0).unwrap().is_empty(), "member a starved");
    assert!(!e.read(b, 0).unwrap().is_empty(), "member b starved");
}

/// Captured payloads are truncated to caplen but report the wire length.
#[test]
fn scenario_caplen_truncation() {
    let e = engine();
    let id = open(&e, GroupPolicy::Shared);
    e.set_caplen(id, 32).unwrap();
    e.bind(id, "eth0").unwrap();
    e.enable(id).unwrap();

    let frame = udp_frame(1, 2);
    e.receive(
        0,
        [RawPacket {
            data: &frame,
            if_index: 1,
            hw_queue: 0,
        }],
    );

    let pkts = e.read(id, 0).unwrap();
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].hdr.caplen, 32);
    assert_eq!(pkts[0].hdr.len as usize, frame.len());
    assert_eq!(pkts[0].payload, &frame[..32]);
}

/// Full Rx ring loses packets and counts them, preserving order.
#[test]
fn scenario_ring_overflow_counts_lost() {
    let e = engine();
    let id = open(&e, GroupPolicy::Shared);
    e.set_rx_slots(id, 8).unwrap();
    e.bind(id, "eth0").unwrap();
    e.enable(id).unwrap();

    let frame = udp_frame(1, 2);
    e.receive(
        0,
        (0..12).map(|_| RawPacket {
            data: &frame,
            if_index: 1,
            hw_queue: 0,
        }),
    );

    let s = e.stats(id).unwrap();
    assert_eq!(s.recv, 8);
    assert_eq!(s.lost, 4);
    assert_eq!(e.read(id, 0).unwrap().len(), 8);
}

/// Timestamping is off by default and populated when enabled.
#[test]
fn scenario_timestamping() {
    let e = engine();
    let id = open(&e, GroupPolicy::Shared);
    e.bind(id, "eth0").unwrap();
    e.enable(id).unwrap();

    let frame = udp_frame(1, 2);
    e.receive(
        0,
        [RawPacket {
            data: &frame,
            if_index: 1,
            hw_queue: 0,
        }],
    );
    assert_eq!(e.read(id, 0).unwrap()[0].hdr.tstamp_ns, 0);

    e.timestamp_enable(id, true).unwrap();
    e.receive(
        0,
        [RawPacket {
            data: &frame,
            if_index: 1,
            hw_queue: 0,
        }],
    );
    assert!(e.read(id, 0).unwrap()[0].hdr.tstamp_ns > 0);
}
