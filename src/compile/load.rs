//! Dynamic loading of compiled modules.

use libloading::{Library, Symbol};
use std::path::Path;

use crate::codegen::GeneratedSource;
use crate::error::OdeJitError;

/// Calling contract shared by every exported entry point.
pub(crate) type RawOdeFn = unsafe extern "C" fn(f64, *const f64, *const f64, *mut f64);

/// A loaded module with its entry points resolved.
///
/// The function pointers are only valid while the library is alive, so
/// both are owned together and the pointers never escape this struct;
/// callers go through the slice-checked wrappers.
pub struct NativeModule {
    rhs: RawOdeFn,
    jac: Option<RawOdeFn>,
    helpers: Option<RawOdeFn>,
    dim: usize,
    n_params: usize,
    n_helpers: usize,
    _lib: Library,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("dim", &self.dim)
            .field("has_jacobian", &self.jac.is_some())
            .field("has_helpers", &self.helpers.is_some())
            .finish()
    }
}

impl NativeModule {
    /// Load a compiled module and resolve the symbols the generator
    /// declared. A missing symbol, or an `ode_dim` that disagrees with
    /// the model, means the module does not honor the generator's
    /// contract; that is a fatal error and never falls back.
    pub fn load(
        path: &Path,
        generated: &GeneratedSource,
        n_helpers: usize,
    ) -> Result<Self, OdeJitError> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| OdeJitError::Internal(format!("failed to load compiled module: {e}")))?;

        let reported_dim = unsafe {
            let dim_fn: Symbol<unsafe extern "C" fn() -> usize> = lib
                .get(b"ode_dim")
                .map_err(|_| OdeJitError::Link {
                    symbol: "ode_dim".to_string(),
                })?;
            dim_fn()
        };
        if reported_dim != generated.dim {
            return Err(OdeJitError::Internal(format!(
                "loaded module reports dimension {reported_dim}, expected {}",
                generated.dim
            )));
        }

        let rhs = resolve(&lib, "ode_rhs")?;
        let jac = if generated.has_jacobian {
            Some(resolve(&lib, "ode_jac")?)
        } else {
            None
        };
        let helpers = if generated.has_helpers {
            Some(resolve(&lib, "ode_helpers")?)
        } else {
            None
        };

        log::debug!(
            "loaded module from {} (dim {}, jacobian: {}, helpers: {})",
            path.display(),
            generated.dim,
            jac.is_some(),
            helpers.is_some()
        );

        Ok(Self {
            rhs,
            jac,
            helpers,
            dim: generated.dim,
            n_params: generated.n_params,
            n_helpers,
            _lib: lib,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn has_jacobian(&self) -> bool {
        self.jac.is_some()
    }

    pub fn has_helpers(&self) -> bool {
        self.helpers.is_some()
    }

    /// Evaluate dy/dt into `out`.
    pub fn rhs(&self, t: f64, y: &[f64], p: &[f64], out: &mut [f64]) -> Result<(), OdeJitError> {
        self.check_buffers(y, p, out.len(), self.dim)?;
        unsafe { (self.rhs)(t, y.as_ptr(), p.as_ptr(), out.as_mut_ptr()) };
        Ok(())
    }

    /// Evaluate the dense row-major Jacobian into `out`; returns false
    /// if the module exports no Jacobian.
    pub fn jacobian(
        &self,
        t: f64,
        y: &[f64],
        p: &[f64],
        out: &mut [f64],
    ) -> Result<bool, OdeJitError> {
        let Some(jac) = self.jac else {
            return Ok(false);
        };
        self.check_buffers(y, p, out.len(), self.dim * self.dim)?;
        unsafe { jac(t, y.as_ptr(), p.as_ptr(), out.as_mut_ptr()) };
        Ok(true)
    }

    /// Evaluate the helper values into `out`; returns false if the
    /// module exports no helpers.
    pub fn helpers(
        &self,
        t: f64,
        y: &[f64],
        p: &[f64],
        out: &mut [f64],
    ) -> Result<bool, OdeJitError> {
        let Some(helpers) = self.helpers else {
            return Ok(false);
        };
        self.check_buffers(y, p, out.len(), self.n_helpers)?;
        unsafe { helpers(t, y.as_ptr(), p.as_ptr(), out.as_mut_ptr()) };
        Ok(true)
    }

    fn check_buffers(
        &self,
        y: &[f64],
        p: &[f64],
        out_len: usize,
        expected_out: usize,
    ) -> Result<(), OdeJitError> {
        if y.len() != self.dim {
            return Err(OdeJitError::DimensionMismatch {
                expected: self.dim,
                got: y.len(),
            });
        }
        if p.len() != self.n_params {
            return Err(OdeJitError::ParameterCountMismatch {
                expected: self.n_params,
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

fn resolve(lib: &Library, name: &str) -> Result<RawOdeFn, OdeJitError> {
    let symbol: Symbol<RawOdeFn> = unsafe { lib.get(name.as_bytes()) }.map_err(|_| {
        OdeJitError::Link {
            symbol: name.to_string(),
        }
    })?;
    Ok(*symbol)
}
