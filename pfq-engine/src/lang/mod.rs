//! The in-engine packet computation language.
//!
//! A computation is a linked array of functional nodes evaluated once per
//! packet. Monadic nodes transform the per-packet monad (fanout decision,
//! mark, forwarding log) and chain through `next`; predicates and
//! combinators form boolean trees consumed by high-order nodes, which
//! dispatch between two continuations; properties produce optional 64-bit
//! values.
//!
//! Chain linking discipline: `next` points at the following function node
//! (monadic or high-order) in descriptor order. A high-order node
//! evaluates its `l_index` predicate and continues either with `next` or
//! by jumping to `r_index`; a branch that needs to terminate ends at a
//! node with no successor or at a stopping action. Submitting compilers
//! lay out branch bodies accordingly.
//!
//! Evaluation is pure for a fixed packet and tree, apart from the per-node
//! accumulator cell (`counter` and friends) and the per-packet log.

pub mod args;
pub mod compile;
pub mod primitives;
pub mod symtable;

use std::sync::atomic::AtomicU64;

use pfq_common::CLASS_DEFAULT_MASK;

use crate::dispatch::GcLog;
use crate::error::Result;
use crate::skbuff::SkBuff;

use args::ArgSlot;

// ---------------------------------------------------------------------------
// Fanout Decision
// ---------------------------------------------------------------------------

/// What the computation decided to do with a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanoutKind {
    /// Deliver to every member of the selected classes.
    Copy,
    /// Deliver to exactly one member, selected by `hash`.
    Steer,
    /// Discard, counted against the group.
    Drop,
    /// Consume silently: no fanout, no drop accounting.
    Sink,
}

/// Fanout decision accumulated while the chain runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fanout {
    pub kind: FanoutKind,
    /// Bitmask over the group's fanout classes.
    pub class_mask: u16,
    /// Steering hash (meaningful for `Steer`).
    pub hash: u32,
}

impl Default for Fanout {
    fn default() -> Self {
        Fanout {
            kind: FanoutKind::Copy,
            class_mask: CLASS_DEFAULT_MASK,
            hash: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-Packet Monad
// ---------------------------------------------------------------------------

/// Mutable per-packet evaluation context threaded through the chain.
pub struct QBuff<'a> {
    pub skb: &'a SkBuff,
    /// User mark, readable through the `has_mark` predicate.
    pub state: u32,
    pub fanout: Fanout,
    /// Also hand the packet back to the kernel stack.
    pub to_kernel: bool,
    /// Per-packet forwarding log, executed at the batch boundary.
    pub log: &'a mut GcLog,
}

impl<'a> QBuff<'a> {
    pub fn new(skb: &'a SkBuff, log: &'a mut GcLog) -> Self {
        QBuff {
            skb,
            state: 0,
            fanout: Fanout::default(),
            to_kernel: false,
            log,
        }
    }
}

/// Chain continuation returned by monadic nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the node's successor.
    Next,
    /// The decision is final; stop walking the chain.
    Stop,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

pub type MonadicFn = fn(&Node, &mut QBuff<'_>) -> Flow;
pub type PredicateFn = fn(&Node, &QBuff<'_>) -> bool;
pub type PropertyFn = fn(&Node, &QBuff<'_>) -> Option<u64>;
pub type InitFn = fn(&mut Node) -> Result<()>;
pub type FiniFn = fn(&mut Node);

/// Boolean combinators over two predicate children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombKind {
    Or,
    And,
    Xor,
}

/// High-order dispatch behavior.
///
/// `When` continues with `next` (the body) while the predicate holds and
/// jumps to `r_index` (the join point past the body) otherwise.
/// `Unless` is the mirror image. `Conditional` jumps to `r_index` (the
/// then-branch) when the predicate holds and falls through to `next`
/// (the else-branch) otherwise; branches do not rejoin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HighOrderKind {
    Conditional,
    When,
    Unless,
}

/// The evaluable payload of a node.
#[derive(Clone, Copy)]
pub enum NodeFun {
    Monadic(MonadicFn),
    Predicate(PredicateFn),
    Property(PropertyFn),
    Combinator(CombKind),
    HighOrder(HighOrderKind),
}

/// One compiled functional node.
pub struct Node {
    pub fun: NodeFun,
    pub symbol: &'static str,
    pub args: [ArgSlot; pfq_common::MAX_FUN_ARGS],
    /// Accumulator cell for stateful primitives. Atomic because the
    /// computation is shared across evaluating CPUs.
    pub state: AtomicU64,
    pub init: Option<InitFn>,
    pub fini: Option<FiniFn>,
    pub initialized: bool,
    /// Successor in the function chain.
    pub next: Option<usize>,
    /// Left child (predicate operand).
    pub left: Option<usize>,
    /// Right child (predicate operand or branch target).
    pub right: Option<usize>,
}

impl Node {
    #[inline]
    pub fn arg(&self, i: usize) -> &ArgSlot {
        &self.args[i]
    }
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

/// A compiled, initialized computation. Shared read-only by evaluators;
/// `fini` hooks run in reverse init order when the last reference drops.
pub struct Computation {
    pub(crate) nodes: Vec<Node>,
    pub(crate) entry: usize,
    pub(crate) init_order: Vec<usize>,
}

impl Computation {
    pub fn entry_point(&self) -> usize {
        self.entry
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    /// Evaluate the chain for one packet. The outcome is left in `qb`.
    pub fn eval(&self, qb: &mut QBuff<'_>) {
        let mut idx = Some(self.entry);
        let mut steps = 0usize;

        while let Some(i) = idx {
            steps += 1;
            debug_assert!(
                steps <= self.nodes.len(),
                "computation walk visited more nodes than exist"
            );

            let node = &self.nodes[i];
            idx = match node.fun {
                NodeFun::Monadic(f) => match f(node, qb) {
                    Flow::Next => node.next,
                    Flow::Stop => None,
                },
                NodeFun::HighOrder(kind) => {
                    let holds = node
                        .left
                        .map(|l| self.eval_predicate(l, qb))
                        .unwrap_or(false);
                    match kind {
                        HighOrderKind::When => {
                            if holds {
                                node.next
                            } else {
                                node.right
                            }
                        }
                        HighOrderKind::Unless | HighOrderKind::Conditional => {
                            if holds {
                                node.right
                            } else {
                                node.next
                            }
                        }
                    }
                }
                // validation keeps predicates/properties out of the chain
                _ => None,
            };
        }
    }

    /// Evaluate a predicate subtree.
    pub fn eval_predicate(&self, idx: usize, qb: &QBuff<'_>) -> bool {
        let node = &self.nodes[idx];
        match node.fun {
            NodeFun::Predicate(f) => f(node, qb),
            NodeFun::Combinator(kind) => {
                let l = node
                    .left
                    .map(|i| self.eval_predicate(i, qb))
                    .unwrap_or(false);
                let r = node
                    .right
                    .map(|i| self.eval_predicate(i, qb))
                    .unwrap_or(false);
                match kind {
                    CombKind::Or => l || r,
                    CombKind::And => l && r,
                    CombKind::Xor => l ^ r,
                }
            }
            _ => false,
        }
    }

    /// Evaluate a property node.
    pub fn eval_property(&self, idx: usize, qb: &QBuff<'_>) -> Option<u64> {
        match self.nodes[idx].fun {
            NodeFun::Property(f) => f(&self.nodes[idx], qb),
            _ => None,
        }
    }
}

impl Drop for Computation {
    fn drop(&mut self) {
        // fini in reverse init order, only for nodes that were initialized
        for &i in self.init_order.clone().iter().rev() {
            let node = &mut self.nodes[i];
            if node.initialized {
                if let Some(fini) = node.fini {
                    fini(node);
                }
                node.initialized = false;
            }
        }
    }
}
