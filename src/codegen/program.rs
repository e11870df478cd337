//! Lowering from the expression graph to straight-line programs.
//!
//! Each entry point (derivative, Jacobian, helper export) gets its own
//! [`Program`]: an ordered list of assignment statements over a scratch
//! buffer `tmp` and the output buffer `out`. User helpers occupy slots
//! `0..H` of `tmp`; common subexpressions (any non-leaf node the entry
//! point reaches through more than one edge) get the slots after that.
//! Statement emission is a deterministic depth-first walk, so the same
//! system always lowers to the same program.

use std::collections::{HashMap, HashSet};

use crate::expr::{ExprArena, ExprId, Node};

/// Where a statement stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// `tmp[slot]`
    Temp(usize),
    /// `out[index]`
    Out(usize),
}

/// What a statement computes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StmtRoot {
    Expr(ExprId),
    /// Direct copy of a scratch slot, used by the helper-export entry point.
    Temp(usize),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Stmt {
    pub target: Target,
    pub root: StmtRoot,
}

#[derive(Debug)]
pub(crate) struct Program {
    pub stmts: Vec<Stmt>,
    /// Scratch buffer length: helper slots plus CSE slots.
    pub n_slots: usize,
    slot_of: HashMap<ExprId, usize>,
}

impl Program {
    /// CSE slot for a node, if it has one. Helper references are handled
    /// separately by the renderer and the statement roots.
    pub(crate) fn slot_of(&self, id: ExprId) -> Option<usize> {
        self.slot_of.get(&id).copied()
    }

    /// Split the statement list into runs of at most `chunk_size`.
    pub(crate) fn chunks(&self, chunk_size: usize) -> impl Iterator<Item = &[Stmt]> {
        self.stmts.chunks(chunk_size)
    }
}

/// Lower one entry point. `outputs` pairs an `out` index with its root
/// expression; every user helper is computed first regardless of whether
/// the outputs reference it, so the scratch buffer layout is identical
/// across entry points.
pub(crate) fn lower(
    arena: &ExprArena,
    helpers: &[ExprId],
    outputs: &[(usize, StmtRoot)],
) -> Program {
    let mut uses: HashMap<ExprId, usize> = HashMap::new();
    for &root in helpers {
        count_uses(arena, root, &mut uses);
    }
    for &(_, root) in outputs {
        if let StmtRoot::Expr(id) = root {
            count_uses(arena, id, &mut uses);
        }
    }

    // Shared non-leaf nodes get CSE slots after the helper slots, in
    // arena order (a dependency order, and stable across runs).
    let mut shared: Vec<ExprId> = uses
        .iter()
        .filter(|&(&id, &n)| n >= 2 && !arena.node(id).is_leaf())
        .map(|(&id, _)| id)
        .collect();
    shared.sort();
    let slot_of: HashMap<ExprId, usize> = shared
        .iter()
        .enumerate()
        .map(|(j, &id)| (id, helpers.len() + j))
        .collect();
    let n_slots = helpers.len() + shared.len();

    let mut emitter = Emitter {
        arena,
        helpers,
        slot_of: &slot_of,
        stmts: Vec::new(),
        helper_done: vec![false; helpers.len()],
        temp_done: HashSet::new(),
    };
    for h in 0..helpers.len() {
        emitter.emit_helper(h);
    }
    for &(index, root) in outputs {
        if let StmtRoot::Expr(id) = root {
            emitter.ensure_deps(id);
        }
        emitter.stmts.push(Stmt {
            target: Target::Out(index),
            root,
        });
    }

    Program {
        stmts: emitter.stmts,
        n_slots,
        slot_of,
    }
}

/// Count how many edges reach each node from `root`, including the root
/// edge itself. Nodes are descended into once; later encounters only
/// bump the count.
fn count_uses(arena: &ExprArena, root: ExprId, uses: &mut HashMap<ExprId, usize>) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let count = uses.entry(id).or_insert(0);
        *count += 1;
        if *count == 1 {
            let (a, b) = arena.node(id).children();
            if let Some(a) = a {
                stack.push(a);
            }
            if let Some(b) = b {
                stack.push(b);
            }
        }
    }
}

struct Emitter<'a> {
    arena: &'a ExprArena,
    helpers: &'a [ExprId],
    slot_of: &'a HashMap<ExprId, usize>,
    stmts: Vec<Stmt>,
    helper_done: Vec<bool>,
    temp_done: HashSet<ExprId>,
}

impl Emitter<'_> {
    /// Emit the statements every boundary node of `id`'s rendering needs:
    /// helper references and CSE-slotted descendants.
    fn ensure_deps(&mut self, id: ExprId) {
        match self.arena.node(id) {
            Node::Helper(h) => self.emit_helper(h),
            node => {
                if self.slot_of.contains_key(&id) {
                    self.emit_temp(id);
                } else {
                    let (a, b) = node.children();
                    if let Some(a) = a {
                        self.ensure_deps(a);
                    }
                    if let Some(b) = b {
                        self.ensure_deps(b);
                    }
                }
            }
        }
    }

    fn emit_helper(&mut self, h: usize) {
        if self.helper_done[h] {
            return;
        }
        let def = self.helpers[h];
        self.ensure_deps(def);
        self.stmts.push(Stmt {
            target: Target::Temp(h),
            root: StmtRoot::Expr(def),
        });
        self.helper_done[h] = true;
    }

    fn emit_temp(&mut self, id: ExprId) {
        if self.temp_done.contains(&id) {
            return;
        }
        let (a, b) = self.arena.node(id).children();
        if let Some(a) = a {
            self.ensure_deps(a);
        }
        if let Some(b) = b {
            self.ensure_deps(b);
        }
        self.stmts.push(Stmt {
            target: Target::Temp(self.slot_of[&id]),
            root: StmtRoot::Expr(id),
        });
        self.temp_done.insert(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_subexpression_gets_one_slot() {
        // out0 = sin(y0*y1), out1 = cos(y0*y1): y0*y1 computed once
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let y1 = arena.state(1);
        let prod = arena.mul(y0, y1);
        let s = arena.sin(prod);
        let c = arena.cos(prod);
        let program = lower(
            &arena,
            &[],
            &[(0, StmtRoot::Expr(s)), (1, StmtRoot::Expr(c))],
        );
        assert_eq!(program.n_slots, 1);
        assert_eq!(program.slot_of(prod), Some(0));
        // temp statement first, then the two outputs
        assert_eq!(program.stmts.len(), 3);
        assert_eq!(program.stmts[0].target, Target::Temp(0));
    }

    #[test]
    fn leaves_never_get_slots() {
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let a = arena.sin(y0);
        let b = arena.cos(y0);
        let program = lower(
            &arena,
            &[],
            &[(0, StmtRoot::Expr(a)), (1, StmtRoot::Expr(b))],
        );
        assert_eq!(program.n_slots, 0);
    }

    #[test]
    fn helpers_emitted_before_outputs() {
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let def = arena.exp(y0);
        let h0 = arena.helper_ref(0);
        let out = arena.mul(h0, h0);
        let program = lower(&arena, &[def], &[(0, StmtRoot::Expr(out))]);
        assert_eq!(program.stmts.len(), 2);
        assert_eq!(program.stmts[0].target, Target::Temp(0));
        assert_eq!(program.stmts[1].target, Target::Out(0));
        assert_eq!(program.n_slots, 1);
    }

    #[test]
    fn chunking_splits_statement_stream() {
        let mut arena = ExprArena::new();
        let mut outputs = Vec::new();
        let mut roots = Vec::new();
        for i in 0..5 {
            let y = arena.state(i);
            let e = arena.sin(y);
            roots.push(e);
        }
        for (i, &r) in roots.iter().enumerate() {
            outputs.push((i, StmtRoot::Expr(r)));
        }
        let program = lower(&arena, &[], &outputs);
        let chunks: Vec<_> = program.chunks(2).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[2].len(), 1);
    }
}
