//! Interpreted evaluation of a symbolic system.
//!
//! Walks the expression arena directly, honoring the same calling
//! contract as a compiled module. Every arithmetic step goes through
//! the exact `f64` operations the generated code uses, so the two paths
//! agree to floating rounding.

use std::sync::Arc;

use crate::error::OdeJitError;
use crate::expr::{ExprId, Node};
use crate::model::ODESystem;

/// Stand-in for a compiled module when native compilation is
/// unavailable or disabled.
#[derive(Debug, Clone)]
pub struct FallbackEvaluator {
    system: Arc<ODESystem>,
}

impl FallbackEvaluator {
    pub fn new(system: Arc<ODESystem>) -> Self {
        Self { system }
    }

    pub fn dim(&self) -> usize {
        self.system.dim()
    }

    pub fn n_params(&self) -> usize {
        self.system.n_params()
    }

    /// Evaluate dy/dt into `out`.
    pub fn rhs(&self, t: f64, y: &[f64], p: &[f64], out: &mut [f64]) -> Result<(), OdeJitError> {
        self.check_buffers(y, p, out.len(), self.system.dim())?;
        let helpers = self.helper_values(t, y, p);
        for (i, &eq) in self.system.equations().iter().enumerate() {
            out[i] = self.eval(eq, t, y, p, &helpers);
        }
        Ok(())
    }

    /// Evaluate the dense row-major Jacobian into `out`; returns false
    /// if the system carries no Jacobian entries.
    pub fn jacobian(
        &self,
        t: f64,
        y: &[f64],
        p: &[f64],
        out: &mut [f64],
    ) -> Result<bool, OdeJitError> {
        if !self.system.has_jacobian() {
            return Ok(false);
        }
        let dim = self.system.dim();
        self.check_buffers(y, p, out.len(), dim * dim)?;
        out.fill(0.0);
        let helpers = self.helper_values(t, y, p);
        for entry in self.system.jacobian() {
            out[entry.row * dim + entry.col] = self.eval(entry.expr, t, y, p, &helpers);
        }
        Ok(true)
    }

    /// Evaluate the helper values into `out`; returns false if the
    /// system has no helpers.
    pub fn helpers(
        &self,
        t: f64,
        y: &[f64],
        p: &[f64],
        out: &mut [f64],
    ) -> Result<bool, OdeJitError> {
        if self.system.n_helpers() == 0 {
            return Ok(false);
        }
        self.check_buffers(y, p, out.len(), self.system.n_helpers())?;
        let helpers = self.helper_values(t, y, p);
        out.copy_from_slice(&helpers);
        Ok(true)
    }

    /// Helper slots in definition order; helper i only ever reads slots
    /// below i, which validation guarantees.
    fn helper_values(&self, t: f64, y: &[f64], p: &[f64]) -> Vec<f64> {
        let defs = self.system.helpers();
        let mut buf = vec![0.0; defs.len()];
        for (h, &def) in defs.iter().enumerate() {
            buf[h] = self.eval(def, t, y, p, &buf);
        }
        buf
    }

    fn eval(&self, id: ExprId, t: f64, y: &[f64], p: &[f64], helpers: &[f64]) -> f64 {
        match self.system.arena().node(id) {
            Node::Const(v) => v,
            Node::Time => t,
            Node::State(i) => y[i],
            Node::Param(i) => p[i],
            Node::Helper(h) => helpers[h],
            Node::Neg(a) => -self.eval(a, t, y, p, helpers),
            Node::Binary(op, a, b) => op.eval(
                self.eval(a, t, y, p, helpers),
                self.eval(b, t, y, p, helpers),
            ),
            Node::Call(f, a) => f.eval(self.eval(a, t, y, p, helpers)),
        }
    }

    fn check_buffers(
        &self,
        y: &[f64],
        p: &[f64],
        out_len: usize,
        expected_out: usize,
    ) -> Result<(), OdeJitError> {
        if y.len() != self.system.dim() {
            return Err(OdeJitError::DimensionMismatch {
                expected: self.system.dim(),
                got: y.len(),
            });
        }
        if p.len() != self.system.n_params() {
            return Err(OdeJitError::ParameterCountMismatch {
                expected: self.system.n_params(),
                got: p.len(),
            });
        }
        if out_len != expected_out {
            return Err(OdeJitError::DimensionMismatch {
                expected: expected_out,
                got: out_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ODESystemBuilder;
    use approx::assert_relative_eq;

    #[test]
    fn evaluates_linear_decay() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let k = b.param("k");
        let prod = b.mul(k, y);
        let rhs = b.neg(prod);
        b.equation(rhs);
        let system = Arc::new(b.build().unwrap());
        let ev = FallbackEvaluator::new(system);
        let mut out = [0.0];
        ev.rhs(0.0, &[2.0], &[0.5], &mut out).unwrap();
        assert_relative_eq!(out[0], -1.0);
    }

    #[test]
    fn helper_chain_evaluates_in_order() {
        // h0 = y0^2, h1 = sin(h0), dy/dt = h1
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let two = b.constant(2.0);
        let sq = b.pow(y, two);
        let h0 = b.helper(sq);
        let s = b.sin(h0);
        let h1 = b.helper(s);
        b.equation(h1);
        let system = Arc::new(b.build().unwrap());
        let ev = FallbackEvaluator::new(system);

        let mut out = [0.0];
        ev.rhs(0.0, &[1.5], &[], &mut out).unwrap();
        assert_relative_eq!(out[0], (1.5_f64 * 1.5).sin());

        let mut h = [0.0, 0.0];
        assert!(ev.helpers(0.0, &[1.5], &[], &mut h).unwrap());
        assert_relative_eq!(h[0], 2.25);
        assert_relative_eq!(h[1], 2.25_f64.sin());
    }

    #[test]
    fn sparse_jacobian_reads_as_dense() {
        // dy0/dt = y1, dy1/dt = -y0
        let mut b = ODESystemBuilder::new();
        let y0 = b.y(0);
        let y1 = b.y(1);
        let m = b.neg(y0);
        b.equation(y1);
        b.equation(m);
        let system = Arc::new(b.build().unwrap());
        let ev = FallbackEvaluator::new(system);
        let mut jac = [f64::NAN; 4];
        assert!(ev.jacobian(0.0, &[0.3, 0.7], &[], &mut jac).unwrap());
        assert_relative_eq!(jac[0], 0.0);
        assert_relative_eq!(jac[1], 1.0);
        assert_relative_eq!(jac[2], -1.0);
        assert_relative_eq!(jac[3], 0.0);
    }

    #[test]
    fn buffer_shape_is_checked() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        b.equation(y);
        let system = Arc::new(b.build().unwrap());
        let ev = FallbackEvaluator::new(system);
        let mut out = [0.0];
        assert!(matches!(
            ev.rhs(0.0, &[1.0, 2.0], &[], &mut out),
            Err(OdeJitError::DimensionMismatch { expected: 1, got: 2 })
        ));
        assert!(matches!(
            ev.rhs(0.0, &[1.0], &[3.0], &mut out),
            Err(OdeJitError::ParameterCountMismatch { expected: 0, got: 1 })
        ));
    }
}
