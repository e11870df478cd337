//! Pipeline orchestration and time stepping.
//!
//! [`Integrator::new`] runs generate → compile-or-reuse → load and wraps
//! the result in an [`Evaluator`]; when native compilation fails and the
//! system allows it, the interpreted evaluator stands in with the same
//! contract. The integrator itself is a conventional stateful solver
//! object: set an initial value, optionally set parameters, then ask for
//! states at increasing times.

use std::env;
use std::sync::Arc;

use diffsol::{Bdf, OdeBuilder, OdeSolverMethod, OdeSolverState};

use crate::codegen::CodeGenerator;
use crate::compile::{ArtifactCache, NativeModule};
use crate::error::OdeJitError;
use crate::interpret::FallbackEvaluator;
use crate::model::ODESystem;
use crate::{M, T, V};

const RTOL: f64 = 1e-6;
const ATOL: f64 = 1e-8;

/// Runtime capability switch between the compiled and interpreted
/// evaluation paths. Both honor the same buffer contract.
pub trait Evaluator {
    fn dim(&self) -> usize;
    fn n_params(&self) -> usize;
    /// Write dy/dt into `dydt`.
    fn rhs(&self, t: f64, y: &[f64], p: &[f64], dydt: &mut [f64]) -> Result<(), OdeJitError>;
    /// Write the dense row-major Jacobian into `jac`; returns false when
    /// no Jacobian is available.
    fn jacobian(&self, t: f64, y: &[f64], p: &[f64], jac: &mut [f64]) -> Result<bool, OdeJitError>;
}

impl Evaluator for NativeModule {
    fn dim(&self) -> usize {
        self.dim()
    }

    fn n_params(&self) -> usize {
        self.n_params()
    }

    fn rhs(&self, t: f64, y: &[f64], p: &[f64], dydt: &mut [f64]) -> Result<(), OdeJitError> {
        NativeModule::rhs(self, t, y, p, dydt)
    }

    fn jacobian(&self, t: f64, y: &[f64], p: &[f64], jac: &mut [f64]) -> Result<bool, OdeJitError> {
        NativeModule::jacobian(self, t, y, p, jac)
    }
}

impl Evaluator for FallbackEvaluator {
    fn dim(&self) -> usize {
        self.dim()
    }

    fn n_params(&self) -> usize {
        self.n_params()
    }

    fn rhs(&self, t: f64, y: &[f64], p: &[f64], dydt: &mut [f64]) -> Result<(), OdeJitError> {
        FallbackEvaluator::rhs(self, t, y, p, dydt)
    }

    fn jacobian(&self, t: f64, y: &[f64], p: &[f64], jac: &mut [f64]) -> Result<bool, OdeJitError> {
        FallbackEvaluator::jacobian(self, t, y, p, jac)
    }
}

enum Backend {
    Compiled(NativeModule),
    Fallback(FallbackEvaluator),
}

impl Backend {
    fn as_evaluator(&self) -> &dyn Evaluator {
        match self {
            Backend::Compiled(m) => m,
            Backend::Fallback(f) => f,
        }
    }
}

#[derive(Debug, Clone)]
enum Status {
    Uninitialized,
    Ready { t: f64, y: Vec<f64> },
    Failed { t: f64, y: Vec<f64>, reason: String },
}

/// Default cache location when the system does not name one.
pub fn default_cache_dir() -> std::path::PathBuf {
    env::temp_dir().join("odejit")
}

/// A stateful forward-time integrator over a validated system.
pub struct Integrator {
    system: Arc<ODESystem>,
    backend: Arc<Backend>,
    params: Vec<f64>,
    status: Status,
}

impl Integrator {
    /// Compile the system and load the resulting module. When
    /// compilation fails (compiler missing, compiler rejected the
    /// source) and the system has the fallback enabled, the interpreted
    /// evaluator is selected instead; a module that compiled but does
    /// not honor the export contract is always fatal.
    pub fn new(system: ODESystem) -> Result<Self, OdeJitError> {
        let system = Arc::new(system);
        let backend = match compile_backend(&system) {
            Ok(module) => Backend::Compiled(module),
            Err(e) if e.recoverable_by_fallback() && system.fallback_enabled() => {
                log::warn!("native compilation failed, using the interpreted evaluator: {e}");
                Backend::Fallback(FallbackEvaluator::new(system.clone()))
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            system,
            backend: Arc::new(backend),
            params: Vec::new(),
            status: Status::Uninitialized,
        })
    }

    /// Skip compilation entirely and use the interpreted evaluator.
    pub fn interpreted(system: ODESystem) -> Self {
        let system = Arc::new(system);
        let backend = Backend::Fallback(FallbackEvaluator::new(system.clone()));
        Self {
            system,
            backend: Arc::new(backend),
            params: Vec::new(),
            status: Status::Uninitialized,
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(*self.backend, Backend::Compiled(_))
    }

    /// Set the state at time `t0`, resetting any previous trajectory or
    /// failure.
    pub fn set_initial_value(&mut self, y0: &[f64], t0: f64) -> Result<(), OdeJitError> {
        if y0.len() != self.system.dim() {
            return Err(OdeJitError::DimensionMismatch {
                expected: self.system.dim(),
                got: y0.len(),
            });
        }
        self.status = Status::Ready {
            t: t0,
            y: y0.to_vec(),
        };
        Ok(())
    }

    /// Bind values to the declared parameters. May be called before or
    /// after `set_initial_value`, and between `integrate` calls.
    pub fn set_parameters(&mut self, p: &[f64]) -> Result<(), OdeJitError> {
        if p.len() != self.system.n_params() {
            return Err(OdeJitError::ParameterCountMismatch {
                expected: self.system.n_params(),
                got: p.len(),
            });
        }
        self.params = p.to_vec();
        Ok(())
    }

    /// Current time, once initialized.
    pub fn t(&self) -> Option<f64> {
        match &self.status {
            Status::Uninitialized => None,
            Status::Ready { t, .. } | Status::Failed { t, .. } => Some(*t),
        }
    }

    /// Current state, once initialized.
    pub fn y(&self) -> Option<&[f64]> {
        match &self.status {
            Status::Uninitialized => None,
            Status::Ready { y, .. } | Status::Failed { y, .. } => Some(y),
        }
    }

    /// Whether the last `integrate` call reached its target.
    pub fn successful(&self) -> Result<bool, OdeJitError> {
        match &self.status {
            Status::Uninitialized => Err(OdeJitError::Uninitialized),
            Status::Ready { .. } => Ok(true),
            Status::Failed { .. } => Ok(false),
        }
    }

    /// Reason for the last stepper failure, if any.
    pub fn failure(&self) -> Option<&str> {
        match &self.status {
            Status::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Advance to time `t` and return the state there. Time only moves
    /// forward: a target before the current time is an error, the
    /// current time returns the current state. A numerical stepper
    /// failure does not raise; it marks the integrator failed, leaves
    /// the last reached state current, and `successful()` reports it.
    pub fn integrate(&mut self, t: f64) -> Result<V, OdeJitError> {
        let (t0, y0) = match &self.status {
            Status::Uninitialized => return Err(OdeJitError::Uninitialized),
            Status::Ready { t, y } => (*t, y.clone()),
            // Failed is sticky until a new initial value resets it.
            Status::Failed { y, .. } => return Ok(V::from_vec(y.clone())),
        };
        if t < t0 {
            return Err(OdeJitError::BackwardsIntegration {
                current: t0,
                requested: t,
            });
        }
        if t == t0 {
            return Ok(V::from_vec(y0));
        }
        if self.params.len() != self.system.n_params() {
            return Err(OdeJitError::ParameterCountMismatch {
                expected: self.system.n_params(),
                got: self.params.len(),
            });
        }

        let dim = self.system.dim();
        let rhs_backend = self.backend.clone();
        let rhs = move |x: &V, p: &V, t: T, dydt: &mut V| {
            let result = rhs_backend
                .as_evaluator()
                .rhs(t, x.as_slice(), p.as_slice(), dydt.as_mut_slice());
            if result.is_err() {
                dydt.as_mut_slice().fill(f64::NAN);
            }
        };
        let jac_backend = self.backend.clone();
        let jac_action = move |x: &V, p: &V, t: T, v: &V, out: &mut V| {
            jacobian_action(jac_backend.as_evaluator(), x, p, t, v, out);
        };
        let init_y = y0.clone();
        let init = move |_p: &V, _t: T| V::from_vec(init_y.clone());

        let problem = OdeBuilder::new()
            .t0(t0)
            .rtol(RTOL)
            .atol(vec![ATOL; dim])
            .p(self.params.clone())
            .build_ode::<M, _, _, _>(rhs, jac_action, init)
            .map_err(|e| OdeJitError::Solver(e.to_string()))?;

        let mut solver = Bdf::default();
        let state = OdeSolverState::new(&problem, &solver)
            .map_err(|e| OdeJitError::Solver(e.to_string()))?;
        solver.set_problem(state, &problem);
        while solver.state().unwrap().t < t {
            if let Err(e) = solver.step() {
                let reason = e.to_string();
                let state = solver.state().unwrap();
                log::warn!("stepper failed at t = {}: {reason}", state.t);
                let last = state.y.as_slice().to_vec();
                self.status = Status::Failed {
                    t: state.t,
                    y: last.clone(),
                    reason,
                };
                return Ok(V::from_vec(last));
            }
        }
        let y = solver
            .interpolate(t)
            .map_err(|e| OdeJitError::Solver(e.to_string()))?;
        self.status = Status::Ready {
            t,
            y: y.as_slice().to_vec(),
        };
        Ok(y)
    }
}

/// out = J(x)·v, using the evaluator's Jacobian when it has one and a
/// forward difference of the right-hand side otherwise.
fn jacobian_action(evaluator: &dyn Evaluator, x: &V, p: &V, t: T, v: &V, out: &mut V) {
    let dim = evaluator.dim();
    let mut jac = vec![0.0; dim * dim];
    match evaluator.jacobian(t, x.as_slice(), p.as_slice(), &mut jac) {
        Ok(true) => {
            for i in 0..dim {
                let mut acc = 0.0;
                for j in 0..dim {
                    acc += jac[i * dim + j] * v[j];
                }
                out[i] = acc;
            }
        }
        Ok(false) => {
            let vnorm = v.norm();
            if vnorm == 0.0 {
                out.as_mut_slice().fill(0.0);
                return;
            }
            let eps = f64::EPSILON.sqrt() * (1.0 + x.norm()) / vnorm;
            let shifted: Vec<f64> = x
                .as_slice()
                .iter()
                .zip(v.as_slice())
                .map(|(xi, vi)| xi + eps * vi)
                .collect();
            let mut f0 = vec![0.0; dim];
            let mut f1 = vec![0.0; dim];
            let ok = evaluator
                .rhs(t, x.as_slice(), p.as_slice(), &mut f0)
                .and_then(|()| evaluator.rhs(t, &shifted, p.as_slice(), &mut f1));
            if ok.is_err() {
                out.as_mut_slice().fill(f64::NAN);
                return;
            }
            for i in 0..dim {
                out[i] = (f1[i] - f0[i]) / eps;
            }
        }
        Err(_) => out.as_mut_slice().fill(f64::NAN),
    }
}

fn compile_backend(system: &Arc<ODESystem>) -> Result<NativeModule, OdeJitError> {
    let generated = CodeGenerator::new(system).generate();
    log::debug!(
        "generated {} bytes of source for a {}-dimensional system",
        generated.source.len(),
        generated.dim
    );
    let cache_root = system
        .cache_dir()
        .cloned()
        .unwrap_or_else(default_cache_dir);
    let cache = ArtifactCache::open(cache_root)?;
    let artifact = cache.compile_or_reuse(&generated, system)?;
    NativeModule::load(&artifact.module_path, &generated, system.n_helpers())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ODESystemBuilder;
    use approx::assert_relative_eq;

    fn decay() -> ODESystem {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let rhs = b.neg(y);
        b.equation(rhs);
        b.build().unwrap()
    }

    #[test]
    fn uninitialized_use_is_an_error() {
        let mut integrator = Integrator::interpreted(decay());
        assert!(matches!(
            integrator.integrate(1.0),
            Err(OdeJitError::Uninitialized)
        ));
        assert!(matches!(
            integrator.successful(),
            Err(OdeJitError::Uninitialized)
        ));
        assert!(integrator.t().is_none());
        assert!(integrator.y().is_none());
    }

    #[test]
    fn backwards_target_is_an_error() {
        let mut integrator = Integrator::interpreted(decay());
        integrator.set_initial_value(&[1.0], 2.0).unwrap();
        assert!(matches!(
            integrator.integrate(1.0),
            Err(OdeJitError::BackwardsIntegration {
                current,
                requested,
            }) if current == 2.0 && requested == 1.0
        ));
    }

    #[test]
    fn current_time_returns_current_state() {
        let mut integrator = Integrator::interpreted(decay());
        integrator.set_initial_value(&[0.5], 1.0).unwrap();
        let y = integrator.integrate(1.0).unwrap();
        assert_relative_eq!(y[0], 0.5);
        assert!(integrator.successful().unwrap());
    }

    #[test]
    fn interpreted_decay_reaches_exp_minus_one() {
        let mut integrator = Integrator::interpreted(decay());
        assert!(!integrator.is_compiled());
        integrator.set_initial_value(&[1.0], 0.0).unwrap();
        let y = integrator.integrate(1.0).unwrap();
        assert_relative_eq!(y[0], (-1.0_f64).exp(), max_relative = 1e-4);
        assert!(integrator.successful().unwrap());
        assert_eq!(integrator.t(), Some(1.0));
    }

    #[test]
    fn wrong_initial_dimension_rejected() {
        let mut integrator = Integrator::interpreted(decay());
        assert!(matches!(
            integrator.set_initial_value(&[1.0, 2.0], 0.0),
            Err(OdeJitError::DimensionMismatch { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn wrong_parameter_count_rejected() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let k = b.param("k");
        let prod = b.mul(k, y);
        let rhs = b.neg(prod);
        b.equation(rhs);
        let system = b.build().unwrap();
        let mut integrator = Integrator::interpreted(system);
        assert!(matches!(
            integrator.set_parameters(&[0.1, 0.2]),
            Err(OdeJitError::ParameterCountMismatch { expected: 1, got: 2 })
        ));
        // parameters never bound at all is also caught
        integrator.set_initial_value(&[1.0], 0.0).unwrap();
        assert!(matches!(
            integrator.integrate(1.0),
            Err(OdeJitError::ParameterCountMismatch { expected: 1, got: 0 })
        ));
    }

    #[test]
    fn stepwise_accumulation_matches_direct() {
        let mut one = Integrator::interpreted(decay());
        one.set_initial_value(&[1.0], 0.0).unwrap();
        one.integrate(0.5).unwrap();
        let y_stepped = one.integrate(1.0).unwrap();

        let mut two = Integrator::interpreted(decay());
        two.set_initial_value(&[1.0], 0.0).unwrap();
        let y_direct = two.integrate(1.0).unwrap();

        assert_relative_eq!(y_stepped[0], y_direct[0], max_relative = 1e-6);
    }
}
