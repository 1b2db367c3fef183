//! Computation submission: descriptor validation, linking and lifecycle.
//!
//! A submission is a flat array of descriptors plus an entry point. The
//! compiler resolves every symbol against the registry, checks argument
//! shapes against declared signatures, kind-checks and range-checks the
//! child indices, rejects cyclic layouts, links the function chain and
//! runs each reachable node's `init` hook exactly once. `fini` hooks run
//! in reverse order when the computation is dropped.

use std::sync::atomic::AtomicU64;

use pfq_common::{
    FUN_COMBINATOR, FUN_HIGH_ORDER, FUN_MONADIC, FUN_NO_INDEX, FUN_PREDICATE, MAX_FUN_ARGS,
    SYMBOL_LEN,
};

use crate::error::{PfqError, Result};
use crate::lang::args::ArgSlot;
use crate::lang::symtable::SymbolTable;
use crate::lang::{Computation, Node, NodeFun};

// ---------------------------------------------------------------------------
// Submission Descriptors
// ---------------------------------------------------------------------------

/// Descriptor kind. The first four map one-to-one onto the wire tags;
/// `Property` is reachable only through in-process submissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionalKind {
    Monadic,
    HighOrder,
    Predicate,
    Combinator,
    Property,
}

impl FunctionalKind {
    pub fn from_wire(tag: u32) -> Option<Self> {
        match tag {
            FUN_MONADIC => Some(FunctionalKind::Monadic),
            FUN_HIGH_ORDER => Some(FunctionalKind::HighOrder),
            FUN_PREDICATE => Some(FunctionalKind::Predicate),
            FUN_COMBINATOR => Some(FunctionalKind::Combinator),
            _ => None,
        }
    }

    /// Whether nodes of this kind run in the function chain.
    fn is_functional(self) -> bool {
        matches!(self, FunctionalKind::Monadic | FunctionalKind::HighOrder)
    }

    /// Whether nodes of this kind may appear in a predicate tree.
    fn is_boolean(self) -> bool {
        matches!(self, FunctionalKind::Predicate | FunctionalKind::Combinator)
    }
}

/// In-process descriptor of one functional node.
#[derive(Clone, Debug)]
pub struct FunctionDescr {
    pub kind: FunctionalKind,
    pub symbol: String,
    pub args: Vec<ArgSlot>,
    pub left: i32,
    pub right: i32,
}

impl FunctionDescr {
    pub fn new(kind: FunctionalKind, symbol: impl Into<String>) -> Self {
        FunctionDescr {
            kind,
            symbol: symbol.into(),
            args: Vec::new(),
            left: FUN_NO_INDEX,
            right: FUN_NO_INDEX,
        }
    }

    /// A monadic chain node.
    pub fn fun(symbol: impl Into<String>) -> Self {
        FunctionDescr::new(FunctionalKind::Monadic, symbol)
    }

    /// A leaf predicate.
    pub fn pred(symbol: impl Into<String>) -> Self {
        FunctionDescr::new(FunctionalKind::Predicate, symbol)
    }

    /// A combinator over two predicate children.
    pub fn comb(symbol: impl Into<String>, left: i32, right: i32) -> Self {
        let mut d = FunctionDescr::new(FunctionalKind::Combinator, symbol);
        d.left = left;
        d.right = right;
        d
    }

    /// A high-order node dispatching on the predicate at `pred`.
    pub fn hfun(symbol: impl Into<String>, pred: i32) -> Self {
        let mut d = FunctionDescr::new(FunctionalKind::HighOrder, symbol);
        d.left = pred;
        d
    }

    /// A property node (in-process only).
    pub fn prop(symbol: impl Into<String>) -> Self {
        FunctionDescr::new(FunctionalKind::Property, symbol)
    }

    pub fn with_arg(mut self, arg: ArgSlot) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_right(mut self, right: i32) -> Self {
        self.right = right;
        self
    }
}

// ---------------------------------------------------------------------------
// Validation + Linking
// ---------------------------------------------------------------------------

fn check_index(raw: i32, len: usize) -> Result<Option<usize>> {
    if raw == FUN_NO_INDEX {
        return Ok(None);
    }
    let idx = usize::try_from(raw)
        .map_err(|_| PfqError::invalid(format!("negative child index {}", raw)))?;
    if idx >= len {
        return Err(PfqError::invalid(format!(
            "child index {} out of range (size {})",
            idx, len
        )));
    }
    Ok(Some(idx))
}

fn kind_matches(kind: FunctionalKind, fun: &NodeFun) -> bool {
    matches!(
        (kind, fun),
        (FunctionalKind::Monadic, NodeFun::Monadic(_))
            | (FunctionalKind::HighOrder, NodeFun::HighOrder(_))
            | (FunctionalKind::Predicate, NodeFun::Predicate(_))
            | (FunctionalKind::Combinator, NodeFun::Combinator(_))
            | (FunctionalKind::Property, NodeFun::Property(_))
    )
}

/// Validate and verify a predicate subtree rooted at `idx`.
fn check_predicate_tree(
    descrs: &[FunctionDescr],
    idx: usize,
    on_path: &mut Vec<bool>,
) -> Result<()> {
    if on_path[idx] {
        return Err(PfqError::invalid("cycle in predicate tree"));
    }
    if !descrs[idx].kind.is_boolean() {
        return Err(PfqError::invalid(format!(
            "node {} ({}) is not a predicate",
            idx, descrs[idx].symbol
        )));
    }
    on_path[idx] = true;
    if descrs[idx].kind == FunctionalKind::Combinator {
        let left = check_index(descrs[idx].left, descrs.len())?
            .ok_or_else(|| PfqError::invalid("combinator without left child"))?;
        let right = check_index(descrs[idx].right, descrs.len())?
            .ok_or_else(|| PfqError::invalid("combinator without right child"))?;
        check_predicate_tree(descrs, left, on_path)?;
        check_predicate_tree(descrs, right, on_path)?;
    }
    on_path[idx] = false;
    Ok(())
}

/// Walk the function chain from `entry` detecting cycles (tri-color DFS:
/// rejoining diamonds are fine, a gray successor is a loop). `next` edges
/// are strictly forward, so cycles can only enter through backward branch
/// targets.
fn check_chain(
    descrs: &[FunctionDescr],
    next: &[Option<usize>],
    entry: usize,
) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color = vec![Color::White; descrs.len()];
    let mut stack = vec![(entry, false)];

    while let Some((i, leaving)) = stack.pop() {
        if leaving {
            color[i] = Color::Black;
            continue;
        }
        if color[i] != Color::White {
            continue;
        }
        if !descrs[i].kind.is_functional() {
            return Err(PfqError::invalid(format!(
                "node {} ({}) cannot appear in the function chain",
                i, descrs[i].symbol
            )));
        }

        color[i] = Color::Gray;
        stack.push((i, true));

        let mut succs = [None, None];
        succs[0] = next[i];
        if descrs[i].kind == FunctionalKind::HighOrder {
            succs[1] = check_index(descrs[i].right, descrs.len())?;
        }
        for succ in succs.into_iter().flatten() {
            match color[succ] {
                Color::Gray => {
                    return Err(PfqError::invalid("cycle in computation chain"))
                }
                Color::White => stack.push((succ, false)),
                Color::Black => {}
            }
        }
    }
    Ok(())
}

/// Compile a submission into an initialized `Computation`.
pub fn compile(
    descrs: &[FunctionDescr],
    entry_point: usize,
    table: &SymbolTable,
) -> Result<Computation> {
    if descrs.is_empty() {
        return Err(PfqError::invalid("empty computation"));
    }
    if entry_point >= descrs.len() {
        return Err(PfqError::invalid(format!(
            "entry point {} out of range (size {})",
            entry_point,
            descrs.len()
        )));
    }
    if !descrs[entry_point].kind.is_functional() {
        return Err(PfqError::invalid("entry point is not a function node"));
    }

    // resolve symbols and validate arguments
    let mut resolved = Vec::with_capacity(descrs.len());
    for (i, d) in descrs.iter().enumerate() {
        if d.symbol.len() >= SYMBOL_LEN {
            return Err(PfqError::invalid(format!("symbol name too long at {}", i)));
        }
        let entry = table
            .lookup(&d.symbol)
            .ok_or_else(|| PfqError::invalid(format!("unknown symbol '{}'", d.symbol)))?;
        if !kind_matches(d.kind, &entry.fun) {
            return Err(PfqError::invalid(format!(
                "symbol '{}' does not match descriptor kind {:?}",
                d.symbol, d.kind
            )));
        }

        if d.args.len() > MAX_FUN_ARGS {
            return Err(PfqError::invalid(format!("too many arguments at {}", i)));
        }
        for (j, sig) in entry.signature.iter().enumerate() {
            let slot = d
                .args
                .get(j)
                .ok_or_else(|| PfqError::invalid(format!(
                    "missing argument {} for '{}'",
                    j, d.symbol
                )))?;
            if !sig.admits(slot) {
                return Err(PfqError::invalid(format!(
                    "argument {} of '{}' does not match its signature",
                    j, d.symbol
                )));
            }
            if !slot.fits_inline() {
                return Err(PfqError::invalid(format!(
                    "argument {} of '{}' exceeds the inline bound",
                    j, d.symbol
                )));
            }
        }
        for (j, slot) in d.args.iter().enumerate().skip(entry.signature.len()) {
            if !slot.is_empty() {
                return Err(PfqError::invalid(format!(
                    "unexpected argument {} for '{}'",
                    j, d.symbol
                )));
            }
        }
        resolved.push(entry);
    }

    // kind-check children
    for (i, d) in descrs.iter().enumerate() {
        match d.kind {
            FunctionalKind::Combinator => {
                let mut on_path = vec![false; descrs.len()];
                check_predicate_tree(descrs, i, &mut on_path)?;
            }
            FunctionalKind::HighOrder => {
                let pred = check_index(d.left, descrs.len())?
                    .ok_or_else(|| PfqError::invalid("high-order node without predicate"))?;
                let mut on_path = vec![false; descrs.len()];
                check_predicate_tree(descrs, pred, &mut on_path)?;
                if let Some(r) = check_index(d.right, descrs.len())? {
                    if !descrs[r].kind.is_functional() {
                        return Err(PfqError::invalid(
                            "high-order branch target is not a function node",
                        ));
                    }
                }
            }
            _ => {
                if d.left != FUN_NO_INDEX || d.right != FUN_NO_INDEX {
                    return Err(PfqError::invalid(format!(
                        "node {} ({}) does not take children",
                        i, d.symbol
                    )));
                }
            }
        }
    }

    // sequential linking: each function node chains to the next function
    // node in descriptor order, skipping predicate trees
    let mut next: Vec<Option<usize>> = vec![None; descrs.len()];
    for i in 0..descrs.len() {
        if !descrs[i].kind.is_functional() {
            continue;
        }
        next[i] = (i + 1..descrs.len()).find(|&j| descrs[j].kind.is_functional());
    }

    check_chain(descrs, &next, entry_point)?;

    // build the node array
    let mut nodes: Vec<Node> = Vec::with_capacity(descrs.len());
    for (i, d) in descrs.iter().enumerate() {
        let entry = resolved[i];
        let mut slots: [ArgSlot; MAX_FUN_ARGS] = Default::default();
        for (j, a) in d.args.iter().enumerate() {
            slots[j] = a.clone();
        }
        nodes.push(Node {
            fun: entry.fun,
            symbol: entry.symbol,
            args: slots,
            state: AtomicU64::new(0),
            init: entry.init,
            fini: entry.fini,
            initialized: false,
            next: next[i],
            left: check_index(d.left, descrs.len())?,
            right: check_index(d.right, descrs.len())?,
        });
    }

    // reachable set in deterministic preorder: function chain plus the
    // predicate trees hanging off it
    let mut order: Vec<usize> = Vec::new();
    let mut seen = vec![false; nodes.len()];
    let mut stack = vec![entry_point];
    while let Some(i) = stack.pop() {
        if seen[i] {
            continue;
        }
        seen[i] = true;
        order.push(i);
        // push in reverse preference so preorder reads left-to-right
        if let Some(n) = nodes[i].next {
            stack.push(n);
        }
        if let Some(r) = nodes[i].right {
            stack.push(r);
        }
        if let Some(l) = nodes[i].left {
            stack.push(l);
        }
    }

    let mut comp = Computation {
        nodes,
        entry: entry_point,
        init_order: order.clone(),
    };

    // init pass; on failure unwind the already-initialized prefix
    for (pos, &i) in order.iter().enumerate() {
        let node = &mut comp.nodes[i];
        if let Some(init) = node.init {
            if let Err(e) = init(node) {
                for &j in order[..pos].iter().rev() {
                    let n = &mut comp.nodes[j];
                    if n.initialized {
                        if let Some(fini) = n.fini {
                            fini(n);
                        }
                        n.initialized = false;
                    }
                }
                comp.init_order.clear();
                return Err(e);
            }
        }
        node.initialized = true;
    }

    Ok(comp)
}
