//! odejit compiles symbolic ODE systems to native code and integrates
//! them.
//!
//! A system is described once as interned expressions — equations,
//! optional helpers and optional Jacobian entries — and then run through
//! a pipeline: validate, generate Rust source, compile it with an
//! external `rustc` into a dynamic library, cache the artifact by
//! content hash, load the exported entry points and drive them with an
//! adaptive BDF stepper. When no working compiler is available the same
//! system runs on an interpreted evaluator with the identical contract.
//!
//! ```no_run
//! use odejit::prelude::*;
//!
//! // dy/dt = -k * y
//! let mut builder = ODESystemBuilder::new();
//! let k = builder.param("k");
//! let y = builder.y(0);
//! let ky = builder.mul(k, y);
//! let rhs = builder.neg(ky);
//! builder.equation(rhs);
//! let system = builder.build()?;
//!
//! let mut integrator = Integrator::new(system)?;
//! integrator.set_parameters(&[0.5])?;
//! integrator.set_initial_value(&[1.0], 0.0)?;
//! let y1 = integrator.integrate(1.0)?;
//! println!("y(1) = {}", y1[0]);
//! # Ok::<(), odejit::OdeJitError>(())
//! ```

pub mod codegen;
pub mod compile;
pub mod error;
pub mod expr;
pub mod integrator;
pub mod interpret;
pub mod model;

/// Scalar type used throughout.
pub type T = f64;
/// Vector type used throughout.
pub type V = nalgebra::DVector<f64>;
/// Matrix type used by the stepper.
pub type M = nalgebra::DMatrix<f64>;

pub use codegen::{CodeGenerator, GeneratedSource};
pub use compile::{ArtifactCache, ArtifactMeta, CompiledArtifact, NativeModule};
pub use error::{OdeJitError, ValidationError};
pub use expr::{BinOp, ExprArena, ExprId, Func, Node};
pub use integrator::{default_cache_dir, Evaluator, Integrator};
pub use interpret::FallbackEvaluator;
pub use model::{JacobianEntry, ODESystem, ODESystemBuilder, DEFAULT_CHUNK_SIZE};

pub mod prelude {
    pub use crate::error::{OdeJitError, ValidationError};
    pub use crate::integrator::{Evaluator, Integrator};
    pub use crate::interpret::FallbackEvaluator;
    pub use crate::model::{ODESystem, ODESystemBuilder};
}
