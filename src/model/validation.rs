//! Pre-compilation model validation.
//!
//! Walks every expression root (helpers in order, equations, Jacobian
//! entries) and rejects unresolved symbol references, non-finite
//! constants and malformed Jacobian shapes. Nothing past this point
//! can fail for model-shape reasons.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::expr::{ExprArena, ExprId, Node};

pub(crate) struct Validator<'a> {
    arena: &'a ExprArena,
    dim: usize,
    n_params: usize,
}

impl<'a> Validator<'a> {
    pub(crate) fn new(arena: &'a ExprArena, dim: usize, n_params: usize) -> Self {
        Self {
            arena,
            dim,
            n_params,
        }
    }

    pub(crate) fn validate(
        &self,
        helpers: &[ExprId],
        equations: &[ExprId],
        jacobian: &[(usize, usize, ExprId)],
    ) -> Result<(), ValidationError> {
        // Helper i may only reference helpers 0..i.
        for (i, &expr) in helpers.iter().enumerate() {
            self.check_root(expr, i, &format!("helper {i}"))?;
        }
        for (i, &expr) in equations.iter().enumerate() {
            self.check_root(expr, helpers.len(), &format!("equation {i}"))?;
        }
        let mut seen = HashSet::new();
        for &(row, col, expr) in jacobian {
            if row >= self.dim || col >= self.dim {
                return Err(ValidationError::JacobianOutOfBounds {
                    row,
                    col,
                    dim: self.dim,
                });
            }
            if !seen.insert((row, col)) {
                return Err(ValidationError::DuplicateJacobianEntry { row, col });
            }
            self.check_root(expr, helpers.len(), &format!("Jacobian entry ({row}, {col})"))?;
        }
        Ok(())
    }

    /// Depth-first walk over the shared graph; each node is visited once.
    fn check_root(
        &self,
        root: ExprId,
        available_helpers: usize,
        context: &str,
    ) -> Result<(), ValidationError> {
        if !self.arena.contains(root) {
            return Err(ValidationError::ForeignExpression {
                context: context.to_string(),
            });
        }
        let mut stack = vec![root];
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            match self.arena.node(id) {
                Node::Const(v) => {
                    if !v.is_finite() {
                        return Err(ValidationError::NonFiniteConstant {
                            value: v,
                            context: context.to_string(),
                        });
                    }
                }
                Node::Time => {}
                Node::State(i) => {
                    if i >= self.dim {
                        return Err(ValidationError::UndefinedStateVariable {
                            index: i,
                            dim: self.dim,
                            context: context.to_string(),
                        });
                    }
                }
                Node::Param(i) => {
                    if i >= self.n_params {
                        return Err(ValidationError::UndefinedParameter {
                            index: i,
                            declared: self.n_params,
                            context: context.to_string(),
                        });
                    }
                }
                Node::Helper(i) => {
                    if i >= available_helpers {
                        return Err(ValidationError::UnresolvedHelper {
                            index: i,
                            available: available_helpers,
                            context: context.to_string(),
                        });
                    }
                }
                node => {
                    let (a, b) = node.children();
                    if let Some(a) = a {
                        stack.push(a);
                    }
                    if let Some(b) = b {
                        stack.push(b);
                    }
                }
            }
        }
        Ok(())
    }
}
