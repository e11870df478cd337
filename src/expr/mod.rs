//! Interned symbolic expression arena.
//!
//! Expressions form a shared directed acyclic graph: identical
//! sub-expressions are the *same* node, not copies. Nodes are stored by
//! index in an arena and deduplicated through a content map, which makes
//! common-subexpression detection an O(1) lookup and guarantees that a
//! child id is always smaller than its parent id, so arena order is a
//! topological order of the graph.

mod diff;

pub(crate) use diff::{diff, helper_derivatives};

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Handle to a node inside an [`ExprArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub(crate) u32);

impl ExprId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    /// `base.powf(exponent)`
    Pow,
}

impl BinOp {
    /// Evaluate with the exact f64 operation the generated code uses, so
    /// the interpreted and compiled paths round identically.
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Pow => a.powf(b),
        }
    }
}

/// Unary function calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Abs,
}

impl Func {
    pub fn eval(self, x: f64) -> f64 {
        match self {
            Func::Sin => x.sin(),
            Func::Cos => x.cos(),
            Func::Tan => x.tan(),
            Func::Exp => x.exp(),
            Func::Ln => x.ln(),
            Func::Sqrt => x.sqrt(),
            Func::Abs => x.abs(),
        }
    }

    /// The `f64` method name emitted by the code generator.
    pub(crate) fn method_name(self) -> &'static str {
        match self {
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Exp => "exp",
            Func::Ln => "ln",
            Func::Sqrt => "sqrt",
            Func::Abs => "abs",
        }
    }
}

/// A single expression node. The variant set is closed so the evaluator
/// and the code generator are total functions over it.
#[derive(Clone, Copy, Debug)]
pub enum Node {
    Const(f64),
    Time,
    State(usize),
    Param(usize),
    Helper(usize),
    Neg(ExprId),
    Binary(BinOp, ExprId, ExprId),
    Call(Func, ExprId),
}

// Normalize -0.0 to 0.0 so constants hash and compare bitwise.
fn const_bits(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else {
        v.to_bits()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        use Node::*;
        match (self, other) {
            (Const(a), Const(b)) => const_bits(*a) == const_bits(*b),
            (Time, Time) => true,
            (State(a), State(b)) => a == b,
            (Param(a), Param(b)) => a == b,
            (Helper(a), Helper(b)) => a == b,
            (Neg(a), Neg(b)) => a == b,
            (Binary(op, a, b), Binary(oq, c, d)) => op == oq && a == c && b == d,
            (Call(f, a), Call(g, b)) => f == g && a == b,
            _ => false,
        }
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use Node::*;
        match self {
            Const(v) => {
                0u8.hash(state);
                const_bits(*v).hash(state);
            }
            Time => 1u8.hash(state),
            State(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Param(i) => {
                3u8.hash(state);
                i.hash(state);
            }
            Helper(i) => {
                4u8.hash(state);
                i.hash(state);
            }
            Neg(a) => {
                5u8.hash(state);
                a.hash(state);
            }
            Binary(op, a, b) => {
                6u8.hash(state);
                op.hash(state);
                a.hash(state);
                b.hash(state);
            }
            Call(f, a) => {
                7u8.hash(state);
                f.hash(state);
                a.hash(state);
            }
        }
    }
}

impl Node {
    /// Leaf nodes never get a CSE temporary of their own.
    pub(crate) fn is_leaf(&self) -> bool {
        matches!(
            self,
            Node::Const(_) | Node::Time | Node::State(_) | Node::Param(_) | Node::Helper(_)
        )
    }

    pub(crate) fn children(&self) -> (Option<ExprId>, Option<ExprId>) {
        match *self {
            Node::Neg(a) | Node::Call(_, a) => (Some(a), None),
            Node::Binary(_, a, b) => (Some(a), Some(b)),
            _ => (None, None),
        }
    }
}

/// The shared node table. Construction goes through the smart
/// constructors below, which intern every node and apply a handful of
/// algebraic folds (x+0, x*1, x*0, constant folding) so that derived
/// Jacobians stay compact.
#[derive(Debug, Clone, Default)]
pub struct ExprArena {
    nodes: Vec<Node>,
    interner: HashMap<Node, ExprId>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ExprId) -> bool {
        id.index() < self.nodes.len()
    }

    pub fn node(&self, id: ExprId) -> Node {
        self.nodes[id.index()]
    }

    fn intern(&mut self, node: Node) -> ExprId {
        if let Some(&id) = self.interner.get(&node) {
            return id;
        }
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.interner.insert(node, id);
        id
    }

    pub fn constant(&mut self, v: f64) -> ExprId {
        self.intern(Node::Const(v))
    }

    pub fn time(&mut self) -> ExprId {
        self.intern(Node::Time)
    }

    pub fn state(&mut self, i: usize) -> ExprId {
        self.intern(Node::State(i))
    }

    pub fn param(&mut self, i: usize) -> ExprId {
        self.intern(Node::Param(i))
    }

    pub fn helper_ref(&mut self, i: usize) -> ExprId {
        self.intern(Node::Helper(i))
    }

    pub(crate) fn const_value(&self, id: ExprId) -> Option<f64> {
        match self.node(id) {
            Node::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_zero(&self, id: ExprId) -> bool {
        self.const_value(id) == Some(0.0)
    }

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        match self.node(a) {
            Node::Const(v) => self.constant(-v),
            Node::Neg(inner) => inner,
            _ => self.intern(Node::Neg(a)),
        }
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.const_value(a), self.const_value(b)) {
            (Some(0.0), _) => b,
            (_, Some(0.0)) => a,
            (Some(x), Some(y)) => self.constant(x + y),
            _ => self.intern(Node::Binary(BinOp::Add, a, b)),
        }
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if a == b {
            return self.constant(0.0);
        }
        match (self.const_value(a), self.const_value(b)) {
            (_, Some(0.0)) => a,
            (Some(x), Some(y)) => self.constant(x - y),
            _ => self.intern(Node::Binary(BinOp::Sub, a, b)),
        }
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.const_value(a), self.const_value(b)) {
            (Some(0.0), _) | (_, Some(0.0)) => self.constant(0.0),
            (Some(1.0), _) => b,
            (_, Some(1.0)) => a,
            (Some(x), Some(y)) => self.constant(x * y),
            _ => self.intern(Node::Binary(BinOp::Mul, a, b)),
        }
    }

    pub fn div(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.const_value(a), self.const_value(b)) {
            (Some(0.0), _) => self.constant(0.0),
            (_, Some(1.0)) => a,
            (Some(x), Some(y)) if y != 0.0 => self.constant(x / y),
            _ => self.intern(Node::Binary(BinOp::Div, a, b)),
        }
    }

    pub fn pow(&mut self, base: ExprId, exponent: ExprId) -> ExprId {
        match (self.const_value(base), self.const_value(exponent)) {
            (_, Some(1.0)) => base,
            (_, Some(0.0)) => self.constant(1.0),
            (Some(x), Some(y)) => self.constant(x.powf(y)),
            _ => self.intern(Node::Binary(BinOp::Pow, base, exponent)),
        }
    }

    pub fn call(&mut self, func: Func, a: ExprId) -> ExprId {
        match self.node(a) {
            Node::Const(v) => self.constant(func.eval(v)),
            _ => self.intern(Node::Call(func, a)),
        }
    }

    pub fn sin(&mut self, a: ExprId) -> ExprId {
        self.call(Func::Sin, a)
    }

    pub fn cos(&mut self, a: ExprId) -> ExprId {
        self.call(Func::Cos, a)
    }

    pub fn tan(&mut self, a: ExprId) -> ExprId {
        self.call(Func::Tan, a)
    }

    pub fn exp(&mut self, a: ExprId) -> ExprId {
        self.call(Func::Exp, a)
    }

    pub fn ln(&mut self, a: ExprId) -> ExprId {
        self.call(Func::Ln, a)
    }

    pub fn sqrt(&mut self, a: ExprId) -> ExprId {
        self.call(Func::Sqrt, a)
    }

    pub fn abs(&mut self, a: ExprId) -> ExprId {
        self.call(Func::Abs, a)
    }
}
