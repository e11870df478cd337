//! Symbolic ODE model definition.
//!
//! An [`ODESystemBuilder`] collects helper definitions, equations and
//! optional Jacobian entries as interned expressions, then `build()`
//! validates the whole model and freezes it into an immutable
//! [`ODESystem`]. Everything here runs before any code generation or
//! compiler invocation.

mod validation;

use std::path::PathBuf;

use crate::error::ValidationError;
use crate::expr::{helper_derivatives, ExprArena, ExprId, Func};

use validation::Validator;

/// Default number of statements per generated chunk function.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// One sparse Jacobian entry: d(equation `row`)/d(y `col`).
#[derive(Debug, Clone, Copy)]
pub struct JacobianEntry {
    pub row: usize,
    pub col: usize,
    pub expr: ExprId,
}

/// Builder for an [`ODESystem`]. All expression construction goes
/// through the builder so every handle belongs to one arena.
#[derive(Debug, Default)]
pub struct ODESystemBuilder {
    arena: ExprArena,
    params: Vec<String>,
    helpers: Vec<ExprId>,
    equations: Vec<ExprId>,
    jacobian: Vec<(usize, usize, ExprId)>,
    dim_override: Option<usize>,
    chunk_size: usize,
    opt_level: u8,
    extra_flags: Vec<String>,
    cache_dir: Option<PathBuf>,
    fallback: bool,
    derive_jacobian: bool,
}

impl ODESystemBuilder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            opt_level: 2,
            fallback: true,
            derive_jacobian: true,
            ..Self::default()
        }
    }

    // --- symbols ---

    /// Register a named parameter and return a reference to it.
    /// Parameters are bound to values at integration time, not here.
    pub fn param(&mut self, name: impl Into<String>) -> ExprId {
        let index = self.params.len();
        self.params.push(name.into());
        self.arena.param(index)
    }

    /// Reference to state variable `y(i)`.
    pub fn y(&mut self, i: usize) -> ExprId {
        self.arena.state(i)
    }

    /// Reference to the independent variable.
    pub fn t(&mut self) -> ExprId {
        self.arena.time()
    }

    pub fn constant(&mut self, v: f64) -> ExprId {
        self.arena.constant(v)
    }

    /// Define the next helper and return a reference to it. Helpers are
    /// evaluated in definition order and may reference earlier helpers.
    pub fn helper(&mut self, expr: ExprId) -> ExprId {
        let index = self.helpers.len();
        self.helpers.push(expr);
        self.arena.helper_ref(index)
    }

    /// Raw reference to helper `i`. Resolution is checked at build time.
    pub fn helper_ref(&mut self, i: usize) -> ExprId {
        self.arena.helper_ref(i)
    }

    // --- arithmetic ---

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        self.arena.neg(a)
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.arena.add(a, b)
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.arena.sub(a, b)
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.arena.mul(a, b)
    }

    pub fn div(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.arena.div(a, b)
    }

    pub fn pow(&mut self, base: ExprId, exponent: ExprId) -> ExprId {
        self.arena.pow(base, exponent)
    }

    pub fn call(&mut self, func: Func, a: ExprId) -> ExprId {
        self.arena.call(func, a)
    }

    pub fn sin(&mut self, a: ExprId) -> ExprId {
        self.arena.sin(a)
    }

    pub fn cos(&mut self, a: ExprId) -> ExprId {
        self.arena.cos(a)
    }

    pub fn tan(&mut self, a: ExprId) -> ExprId {
        self.arena.tan(a)
    }

    pub fn exp(&mut self, a: ExprId) -> ExprId {
        self.arena.exp(a)
    }

    pub fn ln(&mut self, a: ExprId) -> ExprId {
        self.arena.ln(a)
    }

    pub fn sqrt(&mut self, a: ExprId) -> ExprId {
        self.arena.sqrt(a)
    }

    pub fn abs(&mut self, a: ExprId) -> ExprId {
        self.arena.abs(a)
    }

    // --- system shape ---

    /// Append the right-hand side for the next state variable.
    pub fn equation(&mut self, expr: ExprId) -> &mut Self {
        self.equations.push(expr);
        self
    }

    /// Supply one Jacobian entry. Positions not supplied are zero.
    /// Supplying any entry disables symbolic derivation.
    pub fn jacobian_entry(&mut self, row: usize, col: usize, expr: ExprId) -> &mut Self {
        self.jacobian.push((row, col, expr));
        self
    }

    /// Assert the system dimension; build fails if it disagrees with the
    /// number of equations.
    pub fn dim(&mut self, n: usize) -> &mut Self {
        self.dim_override = Some(n);
        self
    }

    // --- control parameters ---

    pub fn chunk_size(&mut self, size: usize) -> &mut Self {
        self.chunk_size = size;
        self
    }

    pub fn opt_level(&mut self, level: u8) -> &mut Self {
        self.opt_level = level;
        self
    }

    pub fn extra_flags(&mut self, flags: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.extra_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn cache_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Whether the interpreted evaluator may stand in when native
    /// compilation fails. Defaults to true.
    pub fn fallback(&mut self, enabled: bool) -> &mut Self {
        self.fallback = enabled;
        self
    }

    /// Whether to derive the Jacobian symbolically when no entries are
    /// supplied. Defaults to true.
    pub fn derive_jacobian(&mut self, enabled: bool) -> &mut Self {
        self.derive_jacobian = enabled;
        self
    }

    /// Validate the model and freeze it.
    pub fn build(mut self) -> Result<ODESystem, ValidationError> {
        if self.chunk_size == 0 {
            return Err(ValidationError::InvalidChunkSize);
        }
        if self.equations.is_empty() {
            return Err(ValidationError::EmptySystem);
        }
        let dim = self.equations.len();
        if let Some(declared) = self.dim_override {
            if declared != dim {
                return Err(ValidationError::DimensionMismatch {
                    declared,
                    equations: dim,
                });
            }
        }

        let validator = Validator::new(&self.arena, dim, self.params.len());
        validator.validate(&self.helpers, &self.equations, &self.jacobian)?;

        let mut jacobian: Vec<JacobianEntry> = self
            .jacobian
            .iter()
            .map(|&(row, col, expr)| JacobianEntry { row, col, expr })
            .collect();
        if jacobian.is_empty() && self.derive_jacobian {
            jacobian = derive_jacobian(&mut self.arena, &self.helpers, &self.equations);
        }
        // Deterministic entry order regardless of how the user supplied them.
        jacobian.sort_by_key(|e| (e.row, e.col));

        Ok(ODESystem {
            arena: self.arena,
            params: self.params,
            helpers: self.helpers,
            equations: self.equations,
            jacobian,
            chunk_size: self.chunk_size,
            opt_level: self.opt_level,
            extra_flags: self.extra_flags,
            cache_dir: self.cache_dir,
            fallback: self.fallback,
        })
    }
}

/// Full symbolic Jacobian with the helper chain rule: the derivative of
/// helper i accumulates the derivatives of every earlier helper it
/// references. Structural zeros are dropped.
fn derive_jacobian(
    arena: &mut ExprArena,
    helpers: &[ExprId],
    equations: &[ExprId],
) -> Vec<JacobianEntry> {
    let dim = equations.len();
    let table = helper_derivatives(arena, helpers, dim);
    let mut entries = Vec::new();
    for (row, &eq) in equations.iter().enumerate() {
        for col in 0..dim {
            let mut memo = std::collections::HashMap::new();
            let d = crate::expr::diff(arena, eq, col, &table, &mut memo);
            if !arena.is_zero(d) {
                entries.push(JacobianEntry { row, col, expr: d });
            }
        }
    }
    entries
}

/// A validated, immutable symbolic ODE system.
#[derive(Debug)]
pub struct ODESystem {
    arena: ExprArena,
    params: Vec<String>,
    helpers: Vec<ExprId>,
    equations: Vec<ExprId>,
    jacobian: Vec<JacobianEntry>,
    chunk_size: usize,
    opt_level: u8,
    extra_flags: Vec<String>,
    cache_dir: Option<PathBuf>,
    fallback: bool,
}

impl ODESystem {
    pub fn dim(&self) -> usize {
        self.equations.len()
    }

    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    pub fn n_helpers(&self) -> usize {
        self.helpers.len()
    }

    pub fn has_jacobian(&self) -> bool {
        !self.jacobian.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn opt_level(&self) -> u8 {
        self.opt_level
    }

    pub fn extra_flags(&self) -> &[String] {
        &self.extra_flags
    }

    pub fn cache_dir(&self) -> Option<&PathBuf> {
        self.cache_dir.as_ref()
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback
    }

    pub(crate) fn arena(&self) -> &ExprArena {
        &self.arena
    }

    pub(crate) fn helpers(&self) -> &[ExprId] {
        &self.helpers
    }

    pub(crate) fn equations(&self) -> &[ExprId] {
        &self.equations
    }

    pub fn jacobian(&self) -> &[JacobianEntry] {
        &self.jacobian
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_minimal_system() {
        // dy/dt = -y
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let rhs = b.neg(y);
        b.equation(rhs);
        let system = b.build().unwrap();
        assert_eq!(system.dim(), 1);
        assert_eq!(system.n_params(), 0);
        assert!(system.has_jacobian());
    }

    #[test]
    fn derived_jacobian_drops_structural_zeros() {
        // dy0/dt = y1, dy1/dt = -y0: four positions, two nonzero
        let mut b = ODESystemBuilder::new();
        let y0 = b.y(0);
        let y1 = b.y(1);
        let m = b.neg(y0);
        b.equation(y1);
        b.equation(m);
        let system = b.build().unwrap();
        assert_eq!(system.jacobian().len(), 2);
        let positions: Vec<_> = system.jacobian().iter().map(|e| (e.row, e.col)).collect();
        assert_eq!(positions, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn user_jacobian_disables_derivation() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let rhs = b.neg(y);
        let minus_one = b.constant(-1.0);
        b.equation(rhs);
        b.jacobian_entry(0, 0, minus_one);
        let system = b.build().unwrap();
        assert_eq!(system.jacobian().len(), 1);
    }

    #[test]
    fn derive_jacobian_can_be_disabled() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let rhs = b.neg(y);
        b.equation(rhs);
        b.derive_jacobian(false);
        let system = b.build().unwrap();
        assert!(!system.has_jacobian());
    }

    #[test]
    fn empty_system_rejected() {
        let b = ODESystemBuilder::new();
        assert!(matches!(b.build(), Err(ValidationError::EmptySystem)));
    }

    #[test]
    fn dimension_override_must_agree() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        b.equation(y);
        b.dim(3);
        assert!(matches!(
            b.build(),
            Err(ValidationError::DimensionMismatch {
                declared: 3,
                equations: 1
            })
        ));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        b.equation(y);
        b.chunk_size(0);
        assert!(matches!(b.build(), Err(ValidationError::InvalidChunkSize)));
    }

    #[test]
    fn out_of_range_state_rejected() {
        let mut b = ODESystemBuilder::new();
        let bad = b.y(5);
        b.equation(bad);
        assert!(matches!(
            b.build(),
            Err(ValidationError::UndefinedStateVariable { index: 5, dim: 1, .. })
        ));
    }

    #[test]
    fn helper_forward_reference_rejected() {
        let mut b = ODESystemBuilder::new();
        let forward = b.helper_ref(0);
        b.helper(forward); // helper 0 referencing helper 0
        let y = b.y(0);
        b.equation(y);
        assert!(matches!(
            b.build(),
            Err(ValidationError::UnresolvedHelper { index: 0, available: 0, .. })
        ));
    }

    #[test]
    fn duplicate_jacobian_entry_rejected() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let one = b.constant(1.0);
        b.equation(y);
        b.jacobian_entry(0, 0, one);
        b.jacobian_entry(0, 0, one);
        assert!(matches!(
            b.build(),
            Err(ValidationError::DuplicateJacobianEntry { row: 0, col: 0 })
        ));
    }

    #[test]
    fn jacobian_entry_out_of_shape_rejected() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let one = b.constant(1.0);
        b.equation(y);
        b.jacobian_entry(0, 2, one);
        assert!(matches!(
            b.build(),
            Err(ValidationError::JacobianOutOfBounds { row: 0, col: 2, dim: 1 })
        ));
    }

    #[test]
    fn non_finite_constant_rejected() {
        let mut b = ODESystemBuilder::new();
        let inf = b.constant(f64::INFINITY);
        b.equation(inf);
        assert!(matches!(
            b.build(),
            Err(ValidationError::NonFiniteConstant { .. })
        ));
    }

    #[test]
    fn helper_chain_jacobian_matches_hand_written() {
        // h0 = y0*y1, dy0/dt = h0, so J = [[y1, y0], ...]
        let mut b = ODESystemBuilder::new();
        let y0 = b.y(0);
        let y1 = b.y(1);
        let prod = b.mul(y0, y1);
        let h0 = b.helper(prod);
        b.equation(h0);
        b.equation(y0);
        let system = b.build().unwrap();
        let entries = system.jacobian();
        assert!(entries.iter().any(|e| e.row == 0 && e.col == 0));
        assert!(entries.iter().any(|e| e.row == 0 && e.col == 1));
        assert!(entries.iter().any(|e| e.row == 1 && e.col == 0));
    }
}
