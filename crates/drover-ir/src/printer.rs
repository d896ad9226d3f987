//! Deterministic text emission for DVL programs.
//!
//! The printer's output is the on-disk artifact format between pipeline
//! stages; [`crate::parser`] must accept everything emitted here so that a
//! stage's output reparses to an equivalent in-memory program.

use crate::ast::*;
use std::fmt::Write;

/// Emit a whole program as text.
pub fn print_program(program: &Program) -> String {
    let mut out = String::new();
    for decl in &program.decls {
        match decl {
            Decl::Global(g) => {
                let _ = writeln!(out, "var {}{}: {};", attrs(&g.attributes), g.name, g.ty);
            }
            Decl::Const(c) => {
                let _ = writeln!(out, "const {}{}: {};", attrs(&c.attributes), c.name, c.ty);
            }
            Decl::Axiom(e) => {
                let _ = writeln!(out, "axiom {};", print_expr(e));
            }
            Decl::Procedure(p) => {
                let _ = writeln!(
                    out,
                    "procedure {}{}({});",
                    attrs(&p.attributes),
                    p.name,
                    typed_vars(&p.params)
                );
                if !p.modifies.is_empty() {
                    let _ = writeln!(out, "  modifies {};", p.modifies.join(", "));
                }
                for r in &p.requires {
                    let _ = writeln!(out, "  requires {};", print_expr(r));
                }
                for e in &p.ensures {
                    let _ = writeln!(out, "  ensures {};", print_expr(e));
                }
            }
            Decl::Implementation(imp) => {
                let _ = writeln!(
                    out,
                    "implementation {}{}({})",
                    attrs(&imp.attributes),
                    imp.name,
                    typed_vars(&imp.params)
                );
                out.push_str("{\n");
                for local in &imp.locals {
                    let _ = writeln!(out, "  var {}: {};", local.name, local.ty);
                }
                for block in &imp.blocks {
                    let _ = writeln!(out, "  {}:", block.label);
                    for cmd in &block.cmds {
                        let _ = writeln!(out, "    {}", print_cmd(cmd));
                    }
                    match &block.transfer {
                        Transfer::Goto(labels) => {
                            let _ = writeln!(out, "    goto {};", labels.join(", "));
                        }
                        Transfer::Return => {
                            out.push_str("    return;\n");
                        }
                    }
                }
                out.push_str("}\n");
            }
        }
        out.push('\n');
    }
    out
}

fn attrs(attributes: &[Attribute]) -> String {
    let mut out = String::new();
    for attr in attributes {
        out.push_str("{:");
        out.push_str(&attr.name);
        for (i, p) in attr.params.iter().enumerate() {
            if i == 0 {
                out.push(' ');
            } else {
                out.push_str(", ");
            }
            match p {
                AttrParam::Int(n) => {
                    let _ = write!(out, "{n}");
                }
                AttrParam::Str(s) => {
                    let _ = write!(out, "\"{s}\"");
                }
            }
        }
        out.push_str("} ");
    }
    out
}

fn typed_vars(vars: &[TypedVar]) -> String {
    vars.iter()
        .map(|v| format!("{}: {}", v.name, v.ty))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Emit one command (with trailing semicolon).
pub fn print_cmd(cmd: &Cmd) -> String {
    match cmd {
        Cmd::Assign { target, value } => match target {
            AssignTarget::Var(name) => format!("{name} := {};", print_expr(value)),
            AssignTarget::MapEntry { map, index } => {
                format!("{map}[{}] := {};", print_expr(index), print_expr(value))
            }
        },
        Cmd::Call { callee, args } => {
            let args = args.iter().map(print_expr).collect::<Vec<_>>().join(", ");
            format!("call {callee}({args});")
        }
        Cmd::Assert {
            attributes,
            condition,
        } => format!("assert {}{};", attrs(attributes), print_expr(condition)),
        Cmd::Assume { condition } => format!("assume {};", print_expr(condition)),
        Cmd::Havoc { var } => format!("havoc {var};"),
    }
}

fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Implies => 1,
        BinOp::Or => 2,
        BinOp::And => 3,
        BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
        BinOp::Add | BinOp::Sub => 5,
        BinOp::Mul | BinOp::Div => 6,
    }
}

fn op_text(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Eq => "==",
        BinOp::Neq => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::And => "&&",
        BinOp::Or => "||",
        BinOp::Implies => "==>",
    }
}

/// Emit an expression with minimal parenthesization.
pub fn print_expr(expr: &Expr) -> String {
    print_expr_prec(expr, 0)
}

fn print_expr_prec(expr: &Expr, parent: u8) -> String {
    match expr {
        Expr::IntLit(n) => {
            if *n < 0 {
                format!("({n})")
            } else {
                n.to_string()
            }
        }
        Expr::BoolLit(b) => b.to_string(),
        Expr::Ident(name) => name.clone(),
        Expr::Select { map, index } => {
            format!("{}[{}]", print_expr_prec(map, 7), print_expr(index))
        }
        Expr::Unary { op, operand } => {
            let op_text = match op {
                UnOp::Not => "!",
                UnOp::Neg => "-",
            };
            let text = format!("{op_text}{}", print_expr_prec(operand, 7));
            // Indexing binds tighter than unary operators.
            if parent >= 7 {
                format!("({text})")
            } else {
                text
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let prec = precedence(*op);
            // Implication is right-associative, relational operators do not
            // associate at all, everything else is left-associative.
            let (lp, rp) = match op {
                BinOp::Implies => (prec + 1, prec),
                BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    (prec + 1, prec + 1)
                }
                _ => (prec, prec + 1),
            };
            let text = format!(
                "{} {} {}",
                print_expr_prec(lhs, lp),
                op_text(*op),
                print_expr_prec(rhs, rp)
            );
            if prec < parent {
                format!("({text})")
            } else {
                text
            }
        }
        Expr::Ite { cond, then, els } => {
            let text = format!(
                "if {} then {} else {}",
                print_expr(cond),
                print_expr(then),
                print_expr(els)
            );
            if parent > 0 {
                format!("({text})")
            } else {
                text
            }
        }
        Expr::PointerArith { ptr, index, scale } => format!(
            "$pa({}, {}, {})",
            print_expr(ptr),
            print_expr(index),
            print_expr(scale)
        ),
        Expr::AllTrue(map) => format!("$all({map})"),
        Expr::NoneTrue(map) => format!("$none({map})"),
    }
}
