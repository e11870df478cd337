//! Symbolic differentiation over the arena.
//!
//! Derivatives are taken with respect to a single state variable.
//! Helper references differentiate through a precomputed table of helper
//! derivatives, which is what lets helpers depend on earlier helpers and
//! still produce a correct Jacobian via the chain rule.

use std::collections::HashMap;

use super::{BinOp, ExprArena, ExprId, Func, Node};

/// d(expr)/d(y_state), given `helper_derivs[h][state]` for every helper
/// `h` that may appear in `expr`. New nodes are interned into `arena`;
/// `memo` caches results within one differentiation pass.
pub(crate) fn diff(
    arena: &mut ExprArena,
    id: ExprId,
    state: usize,
    helper_derivs: &[Vec<ExprId>],
    memo: &mut HashMap<ExprId, ExprId>,
) -> ExprId {
    if let Some(&d) = memo.get(&id) {
        return d;
    }
    let d = match arena.node(id) {
        Node::Const(_) | Node::Time | Node::Param(_) => arena.constant(0.0),
        Node::State(i) => arena.constant(if i == state { 1.0 } else { 0.0 }),
        Node::Helper(h) => helper_derivs[h][state],
        Node::Neg(a) => {
            let da = diff(arena, a, state, helper_derivs, memo);
            arena.neg(da)
        }
        Node::Binary(BinOp::Add, a, b) => {
            let da = diff(arena, a, state, helper_derivs, memo);
            let db = diff(arena, b, state, helper_derivs, memo);
            arena.add(da, db)
        }
        Node::Binary(BinOp::Sub, a, b) => {
            let da = diff(arena, a, state, helper_derivs, memo);
            let db = diff(arena, b, state, helper_derivs, memo);
            arena.sub(da, db)
        }
        Node::Binary(BinOp::Mul, a, b) => {
            let da = diff(arena, a, state, helper_derivs, memo);
            let db = diff(arena, b, state, helper_derivs, memo);
            let left = arena.mul(da, b);
            let right = arena.mul(a, db);
            arena.add(left, right)
        }
        Node::Binary(BinOp::Div, a, b) => {
            // (da*b - a*db) / b^2
            let da = diff(arena, a, state, helper_derivs, memo);
            let db = diff(arena, b, state, helper_derivs, memo);
            let left = arena.mul(da, b);
            let right = arena.mul(a, db);
            let num = arena.sub(left, right);
            let den = arena.mul(b, b);
            arena.div(num, den)
        }
        Node::Binary(BinOp::Pow, base, exponent) => {
            let dbase = diff(arena, base, state, helper_derivs, memo);
            match arena.node(exponent) {
                // c * base^(c-1) * dbase for a constant exponent
                Node::Const(c) => {
                    let cm1 = arena.constant(c - 1.0);
                    let pow = arena.pow(base, cm1);
                    let coeff = arena.constant(c);
                    let scaled = arena.mul(coeff, pow);
                    arena.mul(scaled, dbase)
                }
                // base^e * (de*ln(base) + e*dbase/base)
                _ => {
                    let de = diff(arena, exponent, state, helper_derivs, memo);
                    let ln = arena.ln(base);
                    let left = arena.mul(de, ln);
                    let ratio = arena.div(dbase, base);
                    let right = arena.mul(exponent, ratio);
                    let inner = arena.add(left, right);
                    let pow = arena.pow(base, exponent);
                    arena.mul(pow, inner)
                }
            }
        }
        Node::Call(func, a) => {
            let da = diff(arena, a, state, helper_derivs, memo);
            let outer = match func {
                Func::Sin => arena.cos(a),
                Func::Cos => {
                    let s = arena.sin(a);
                    arena.neg(s)
                }
                Func::Tan => {
                    // 1 / cos^2
                    let c = arena.cos(a);
                    let c2 = arena.mul(c, c);
                    let one = arena.constant(1.0);
                    arena.div(one, c2)
                }
                Func::Exp => arena.exp(a),
                Func::Ln => {
                    let one = arena.constant(1.0);
                    arena.div(one, a)
                }
                Func::Sqrt => {
                    let s = arena.sqrt(a);
                    let two = arena.constant(2.0);
                    let den = arena.mul(two, s);
                    let one = arena.constant(1.0);
                    arena.div(one, den)
                }
                Func::Abs => {
                    // sign(a), undefined at zero like the numeric kernel
                    let abs = arena.abs(a);
                    arena.div(a, abs)
                }
            };
            arena.mul(outer, da)
        }
    };
    memo.insert(id, d);
    d
}

/// Derivative table for an ordered helper list: `result[h][k]` is
/// d(helper_h)/d(y_k). Helpers may only reference earlier helpers, so
/// each row is differentiated against the rows already built.
pub(crate) fn helper_derivatives(
    arena: &mut ExprArena,
    helper_exprs: &[ExprId],
    dim: usize,
) -> Vec<Vec<ExprId>> {
    let mut table: Vec<Vec<ExprId>> = Vec::with_capacity(helper_exprs.len());
    for &expr in helper_exprs {
        let mut row = Vec::with_capacity(dim);
        for k in 0..dim {
            let mut memo = HashMap::new();
            row.push(diff(arena, expr, k, &table, &mut memo));
        }
        table.push(row);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(arena: &mut ExprArena, id: ExprId, state: usize) -> ExprId {
        let mut memo = HashMap::new();
        diff(arena, id, state, &[], &mut memo)
    }

    fn eval(arena: &ExprArena, id: ExprId, t: f64, y: &[f64]) -> f64 {
        match arena.node(id) {
            Node::Const(v) => v,
            Node::Time => t,
            Node::State(i) => y[i],
            Node::Param(_) | Node::Helper(_) => unreachable!(),
            Node::Neg(a) => -eval(arena, a, t, y),
            Node::Binary(op, a, b) => op.eval(eval(arena, a, t, y), eval(arena, b, t, y)),
            Node::Call(f, a) => f.eval(eval(arena, a, t, y)),
        }
    }

    #[test]
    fn linear_term() {
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let k = arena.constant(3.0);
        let expr = arena.mul(k, y0);
        let d0 = d(&mut arena, expr, 0);
        assert_eq!(arena.const_value(d0), Some(3.0));
        let d1 = d(&mut arena, expr, 1);
        assert_eq!(arena.const_value(d1), Some(0.0));
    }

    #[test]
    fn product_rule() {
        // d/dy0 (y0 * y1) = y1
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let y1 = arena.state(1);
        let expr = arena.mul(y0, y1);
        let d0 = d(&mut arena, expr, 0);
        assert_eq!(d0, y1);
    }

    #[test]
    fn chain_rule_through_sin() {
        // d/dy0 sin(2*y0) = 2*cos(2*y0), checked numerically
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let two = arena.constant(2.0);
        let inner = arena.mul(two, y0);
        let expr = arena.sin(inner);
        let dexpr = d(&mut arena, expr, 0);
        let at = 0.7;
        let got = eval(&arena, dexpr, 0.0, &[at]);
        assert!((got - 2.0 * (2.0 * at).cos()).abs() < 1e-12);
    }

    #[test]
    fn constant_power_rule() {
        // d/dy0 y0^3 = 3*y0^2
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let three = arena.constant(3.0);
        let expr = arena.pow(y0, three);
        let dexpr = d(&mut arena, expr, 0);
        let got = eval(&arena, dexpr, 0.0, &[2.0]);
        assert!((got - 12.0).abs() < 1e-12);
    }

    #[test]
    fn helper_chain() {
        // h0 = y0^2, h1 = sin(h0); d(h1)/dy0 = cos(y0^2) * 2*y0
        let mut arena = ExprArena::new();
        let y0 = arena.state(0);
        let two = arena.constant(2.0);
        let h0_expr = arena.pow(y0, two);
        let h0 = arena.helper_ref(0);
        let h1_expr = arena.sin(h0);
        let table = helper_derivatives(&mut arena, &[h0_expr, h1_expr], 1);
        assert_eq!(table.len(), 2);
        // substitute h0's definition to evaluate numerically
        let expanded = substitute_helpers(&mut arena, table[1][0], &[h0_expr]);
        let at = 0.9_f64;
        let got = eval(&arena, expanded, 0.0, &[at]);
        let want = (at * at).cos() * 2.0 * at;
        assert!((got - want).abs() < 1e-12);
    }

    fn substitute_helpers(arena: &mut ExprArena, id: ExprId, defs: &[ExprId]) -> ExprId {
        match arena.node(id) {
            Node::Helper(h) => substitute_helpers(arena, defs[h], defs),
            Node::Neg(a) => {
                let a = substitute_helpers(arena, a, defs);
                arena.neg(a)
            }
            Node::Binary(op, a, b) => {
                let a = substitute_helpers(arena, a, defs);
                let b = substitute_helpers(arena, b, defs);
                match op {
                    BinOp::Add => arena.add(a, b),
                    BinOp::Sub => arena.sub(a, b),
                    BinOp::Mul => arena.mul(a, b),
                    BinOp::Div => arena.div(a, b),
                    BinOp::Pow => arena.pow(a, b),
                }
            }
            Node::Call(f, a) => {
                let a = substitute_helpers(arena, a, defs);
                arena.call(f, a)
            }
            _ => id,
        }
    }
}
