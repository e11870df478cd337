//! Rust source emission for a validated system.
//!
//! The generated translation unit is dependency-free: plain `f64`
//! arithmetic plus `std` math methods, chunked into small functions so
//! large systems do not produce one enormous body, with fixed
//! `extern "C"` dispatchers as the only public surface:
//!
//! - `ode_rhs(t, y, p, out)` writes dy/dt into `out[0..n]`
//! - `ode_jac(t, y, p, out)` zero-fills and writes the dense row-major
//!   n*n Jacobian (only emitted when the system has Jacobian entries)
//! - `ode_helpers(t, y, p, out)` exports the helper values (only emitted
//!   when helpers exist)
//! - `ode_dim()` reports the dimension as a loader sanity check
//!
//! Emission is purely a function of the system: the same model yields
//! byte-identical source on every call.

mod program;

use crate::expr::{BinOp, ExprId, Node};
use crate::model::ODESystem;

use program::{lower, Program, Stmt, StmtRoot, Target};

/// Output of [`CodeGenerator::generate`]: the source text plus what the
/// loader should expect to find in the compiled module.
#[derive(Debug, Clone)]
pub struct GeneratedSource {
    pub source: String,
    pub dim: usize,
    pub n_params: usize,
    pub has_jacobian: bool,
    pub has_helpers: bool,
}

pub struct CodeGenerator<'a> {
    system: &'a ODESystem,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(system: &'a ODESystem) -> Self {
        Self { system }
    }

    pub fn generate(&self) -> GeneratedSource {
        let system = self.system;
        let dim = system.dim();
        let arena = system.arena();
        let helpers = system.helpers();
        let chunk_size = system.chunk_size();

        let rhs_outputs: Vec<(usize, StmtRoot)> = system
            .equations()
            .iter()
            .enumerate()
            .map(|(i, &e)| (i, StmtRoot::Expr(e)))
            .collect();
        let rhs = lower(arena, helpers, &rhs_outputs);

        let jac = if system.has_jacobian() {
            let outputs: Vec<(usize, StmtRoot)> = system
                .jacobian()
                .iter()
                .map(|e| (e.row * dim + e.col, StmtRoot::Expr(e.expr)))
                .collect();
            Some(lower(arena, helpers, &outputs))
        } else {
            None
        };

        let helper_export = if helpers.is_empty() {
            None
        } else {
            let outputs: Vec<(usize, StmtRoot)> =
                (0..helpers.len()).map(|h| (h, StmtRoot::Temp(h))).collect();
            Some(lower(arena, helpers, &outputs))
        };

        let mut src = String::new();
        src.push_str("// Generated by odejit; do not edit.\n");
        src.push_str("#![allow(unused_variables, unused_mut, dead_code)]\n\n");
        src.push_str(&format!("const DIM: usize = {dim};\n"));
        src.push_str(&format!("const N_PARAMS: usize = {};\n\n", system.n_params()));
        src.push_str("#[no_mangle]\npub extern \"C\" fn ode_dim() -> usize {\n    DIM\n}\n\n");

        self.emit_entry(&mut src, "rhs", "ode_rhs", &rhs, "DIM", false, chunk_size);
        if let Some(ref jac) = jac {
            self.emit_entry(&mut src, "jac", "ode_jac", jac, "DIM * DIM", true, chunk_size);
        }
        if let Some(ref program) = helper_export {
            let n = helpers.len();
            let out_len = format!("{n}usize");
            self.emit_entry(&mut src, "helpers", "ode_helpers", program, &out_len, false, chunk_size);
        }

        GeneratedSource {
            source: src,
            dim,
            n_params: system.n_params(),
            has_jacobian: jac.is_some(),
            has_helpers: helper_export.is_some(),
        }
    }

    /// One dispatcher plus its chunk functions.
    fn emit_entry(
        &self,
        src: &mut String,
        prefix: &str,
        export: &str,
        program: &Program,
        out_len: &str,
        zero_fill: bool,
        chunk_size: usize,
    ) {
        let n_chunks = program.chunks(chunk_size).count().max(1);
        src.push_str("#[no_mangle]\n");
        src.push_str(&format!(
            "pub unsafe extern \"C\" fn {export}(t: f64, y: *const f64, p: *const f64, out: *mut f64) {{\n"
        ));
        src.push_str("    let y = std::slice::from_raw_parts(y, DIM);\n");
        src.push_str("    let p = std::slice::from_raw_parts(p, N_PARAMS);\n");
        src.push_str(&format!(
            "    let out = std::slice::from_raw_parts_mut(out, {out_len});\n"
        ));
        if zero_fill {
            src.push_str("    for v in out.iter_mut() {\n        *v = 0.0;\n    }\n");
        }
        src.push_str(&format!("    let mut tmp = [0.0_f64; {}];\n", program.n_slots));
        for k in 0..n_chunks {
            src.push_str(&format!("    {prefix}_chunk_{k}(t, y, p, &mut tmp, out);\n"));
        }
        src.push_str("}\n\n");

        let mut chunks: Vec<&[Stmt]> = program.chunks(chunk_size).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for (k, chunk) in chunks.iter().enumerate() {
            src.push_str(&format!(
                "fn {prefix}_chunk_{k}(t: f64, y: &[f64], p: &[f64], tmp: &mut [f64], out: &mut [f64]) {{\n"
            ));
            for stmt in *chunk {
                src.push_str("    ");
                src.push_str(&self.render_stmt(program, stmt));
                src.push_str("\n");
            }
            src.push_str("}\n\n");
        }
    }

    fn render_stmt(&self, program: &Program, stmt: &Stmt) -> String {
        let lhs = match stmt.target {
            Target::Temp(slot) => format!("tmp[{slot}]"),
            Target::Out(index) => format!("out[{index}]"),
        };
        let rhs = match stmt.root {
            StmtRoot::Temp(slot) => format!("tmp[{slot}]"),
            StmtRoot::Expr(id) => {
                // A statement defining a CSE slot must expand its own
                // node rather than read the slot it is about to write.
                let skip_own_slot = matches!(
                    (stmt.target, program.slot_of(id)),
                    (Target::Temp(s), Some(slot)) if s == slot
                );
                self.render_expr(program, id, !skip_own_slot)
            }
        };
        format!("{lhs} = {rhs};")
    }

    fn render_expr(&self, program: &Program, id: ExprId, allow_slot: bool) -> String {
        if allow_slot {
            if let Some(slot) = program.slot_of(id) {
                return format!("tmp[{slot}]");
            }
        }
        match self.system.arena().node(id) {
            Node::Const(v) => format!("{v:?}_f64"),
            Node::Time => "t".to_string(),
            Node::State(i) => format!("y[{i}]"),
            Node::Param(i) => format!("p[{i}]"),
            Node::Helper(h) => format!("tmp[{h}]"),
            Node::Neg(a) => format!("(-{})", self.render_expr(program, a, true)),
            Node::Binary(BinOp::Pow, a, b) => format!(
                "({}).powf({})",
                self.render_expr(program, a, true),
                self.render_expr(program, b, true)
            ),
            Node::Binary(op, a, b) => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Pow => unreachable!(),
                };
                format!(
                    "({} {sym} {})",
                    self.render_expr(program, a, true),
                    self.render_expr(program, b, true)
                )
            }
            Node::Call(f, a) => format!(
                "({}).{}()",
                self.render_expr(program, a, true),
                f.method_name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ODESystemBuilder;

    fn decay_system() -> ODESystem {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let rhs = b.neg(y);
        b.equation(rhs);
        b.build().unwrap()
    }

    #[test]
    fn generation_is_deterministic() {
        let system = decay_system();
        let a = CodeGenerator::new(&system).generate();
        let b = CodeGenerator::new(&system).generate();
        assert_eq!(a.source, b.source);
    }

    #[test]
    fn exports_follow_system_shape() {
        let system = decay_system();
        let generated = CodeGenerator::new(&system).generate();
        assert!(generated.has_jacobian);
        assert!(!generated.has_helpers);
        assert!(generated.source.contains("pub unsafe extern \"C\" fn ode_rhs"));
        assert!(generated.source.contains("pub unsafe extern \"C\" fn ode_jac"));
        assert!(!generated.source.contains("ode_helpers"));
        assert!(generated.source.contains("ode_dim"));
    }

    #[test]
    fn rhs_of_linear_decay() {
        let system = decay_system();
        let generated = CodeGenerator::new(&system).generate();
        assert!(generated.source.contains("out[0] = (-y[0]);"));
    }

    #[test]
    fn jacobian_dispatcher_zero_fills() {
        let system = decay_system();
        let generated = CodeGenerator::new(&system).generate();
        let jac_fn = generated
            .source
            .split("fn ode_jac")
            .nth(1)
            .expect("ode_jac present");
        assert!(jac_fn.contains("*v = 0.0;"));
    }

    #[test]
    fn chunk_size_one_emits_one_function_per_statement() {
        let mut b = ODESystemBuilder::new();
        let y0 = b.y(0);
        let y1 = b.y(1);
        let m = b.neg(y0);
        b.equation(y1);
        b.equation(m);
        b.chunk_size(1);
        b.derive_jacobian(false);
        let system = b.build().unwrap();
        let generated = CodeGenerator::new(&system).generate();
        assert!(generated.source.contains("fn rhs_chunk_0"));
        assert!(generated.source.contains("fn rhs_chunk_1"));
    }

    #[test]
    fn helpers_become_scratch_slots() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let e = b.exp(y);
        let h = b.helper(e);
        let rhs = b.neg(h);
        b.equation(rhs);
        b.derive_jacobian(false);
        let system = b.build().unwrap();
        let generated = CodeGenerator::new(&system).generate();
        assert!(generated.has_helpers);
        assert!(generated.source.contains("tmp[0] = (y[0]).exp();"));
        assert!(generated.source.contains("out[0] = (-tmp[0]);"));
        assert!(generated.source.contains("pub unsafe extern \"C\" fn ode_helpers"));
    }

    #[test]
    fn constants_render_with_f64_suffix() {
        let mut b = ODESystemBuilder::new();
        let y = b.y(0);
        let k = b.constant(2.5);
        let rhs = b.mul(k, y);
        b.equation(rhs);
        b.derive_jacobian(false);
        let system = b.build().unwrap();
        let generated = CodeGenerator::new(&system).generate();
        assert!(generated.source.contains("2.5_f64"));
    }
}
