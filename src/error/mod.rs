//! Error types for model validation, compilation, loading and integration.

use thiserror::Error;

/// Errors detected while finalizing a symbolic model.
///
/// All of these are raised before any code is generated or any compiler
/// is invoked.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A state variable reference `y(i)` with `i` outside `0..n`
    #[error("{context} references state variable y({index}), but the system has dimension {dim}")]
    UndefinedStateVariable {
        index: usize,
        dim: usize,
        context: String,
    },

    /// A parameter reference outside the declared parameter list
    #[error("{context} references parameter {index}, but only {declared} parameters are declared")]
    UndefinedParameter {
        index: usize,
        declared: usize,
        context: String,
    },

    /// A helper reference that points at itself, forward, or out of range
    #[error("{context} references helper {index}, which is not defined at that point (helpers available: {available})")]
    UnresolvedHelper {
        index: usize,
        available: usize,
        context: String,
    },

    /// A Jacobian entry outside the n-by-n shape
    #[error("Jacobian entry ({row}, {col}) is outside the {dim}x{dim} system")]
    JacobianOutOfBounds { row: usize, col: usize, dim: usize },

    /// The same Jacobian position given twice
    #[error("Jacobian entry ({row}, {col}) is defined twice")]
    DuplicateJacobianEntry { row: usize, col: usize },

    /// A non-finite literal in an expression
    #[error("non-finite constant {value} in {context}")]
    NonFiniteConstant { value: f64, context: String },

    /// The system has no equations
    #[error("the system has no equations")]
    EmptySystem,

    /// Declared dimension disagrees with the number of equations
    #[error("declared dimension {declared} does not match the number of equations ({equations})")]
    DimensionMismatch { declared: usize, equations: usize },

    /// Chunk size of zero
    #[error("chunk size must be at least 1")]
    InvalidChunkSize,

    /// An expression handle from a different builder
    #[error("{context} contains an expression handle that does not belong to this system")]
    ForeignExpression { context: String },
}

/// Errors for the compile-and-integrate pipeline.
#[derive(Debug, Error)]
pub enum OdeJitError {
    /// Malformed symbolic model, detected before compilation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The external compiler exited with a nonzero status
    #[error("native compilation failed:\n{diagnostics}")]
    Compilation { diagnostics: String },

    /// An expected exported symbol was missing after a successful compile.
    ///
    /// This indicates a generator/loader contract mismatch and is never
    /// recovered from.
    #[error("compiled module is missing expected symbol `{symbol}`")]
    Link { symbol: String },

    /// Filesystem or subprocess failure around the artifact cache
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A supplied state vector does not match the system dimension
    #[error("dimension mismatch: expected a vector of length {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A supplied parameter vector does not match the declared parameters
    #[error("parameter count mismatch: the system declares {expected} parameters, got {got}")]
    ParameterCountMismatch { expected: usize, got: usize },

    /// `integrate` called with a target time before the current time
    #[error("target time {requested} is before the current time {current}; cannot integrate backwards")]
    BackwardsIntegration { current: f64, requested: f64 },

    /// `integrate` or `successful` called before `set_initial_value`
    #[error("the integrator has no initial value; call set_initial_value first")]
    Uninitialized,

    /// Failure reported by the numerical stepper
    #[error("stepper failure: {0}")]
    Solver(String),

    /// Internal consistency violation (generator bug, not a user error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl OdeJitError {
    /// Whether the fallback evaluator is allowed to stand in after this
    /// error. Only compiler-side failures are recoverable; a missing
    /// symbol after a successful compile is a bug and always fatal.
    pub fn recoverable_by_fallback(&self) -> bool {
        matches!(self, Self::Compilation { .. } | Self::Io(_))
    }
}
