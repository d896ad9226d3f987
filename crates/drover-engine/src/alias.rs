//! Pointer alias resolution.
//!
//! Lock-acquire sites and shared-memory accesses reference pointers through
//! chains of local assignments and `$pa(p, i, s)` arithmetic. This module
//! walks those chains backward, within a single implementation, to a
//! canonical `base + offset` form. Only compile-time-constant index/scale
//! pairs fold; a symbolic index, or an identifier assigned more than once,
//! aborts resolution and the caller must treat the access as unidentified
//! (every concurrent access to the target region is then reported).

use drover_ir::ast::{AssignTarget, BinOp, Cmd, Expr, Implementation, UnOp};
use std::collections::HashMap;

/// Canonical form of a pointer expression: a root plus a folded byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Root identifier, or `None` for an absolute (literal) address.
    pub base: Option<String>,
    pub offset: i64,
}

impl ResolvedAddress {
    pub fn absolute(offset: i64) -> Self {
        Self { base: None, offset }
    }

    pub fn rooted(base: &str, offset: i64) -> Self {
        Self {
            base: Some(base.to_string()),
            offset,
        }
    }
}

const MAX_CHAIN_DEPTH: usize = 64;

/// Evaluate a compile-time-constant integer expression, or `None`.
pub fn const_eval(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::IntLit(n) => Some(*n),
        Expr::Unary {
            op: UnOp::Neg,
            operand,
        } => const_eval(operand).map(|n| -n),
        Expr::Binary { op, lhs, rhs } => {
            let l = const_eval(lhs)?;
            let r = const_eval(rhs)?;
            match op {
                BinOp::Add => Some(l.wrapping_add(r)),
                BinOp::Sub => Some(l.wrapping_sub(r)),
                BinOp::Mul => Some(l.wrapping_mul(r)),
                BinOp::Div if r != 0 => Some(l / r),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Resolver over one implementation's straight-line assignment chains.
pub struct PointerResolver<'a> {
    imp: &'a Implementation,
    assignments: HashMap<&'a str, Vec<&'a Expr>>,
}

impl<'a> PointerResolver<'a> {
    pub fn new(imp: &'a Implementation) -> Self {
        let mut assignments: HashMap<&str, Vec<&Expr>> = HashMap::new();
        for cmd in imp.cmds() {
            if let Cmd::Assign {
                target: AssignTarget::Var(name),
                value,
            } = cmd
            {
                assignments.entry(name.as_str()).or_default().push(value);
            }
        }
        Self { imp, assignments }
    }

    /// Resolve `expr` to canonical `base + offset` form.
    pub fn resolve(&self, expr: &Expr) -> Option<ResolvedAddress> {
        self.resolve_depth(expr, 0)
    }

    fn is_root(&self, name: &str) -> bool {
        // Formal parameters and anything never assigned locally (globals,
        // constants) are resolution roots.
        self.imp.params.iter().any(|p| p.name == name) || !self.assignments.contains_key(name)
    }

    fn resolve_depth(&self, expr: &Expr, depth: usize) -> Option<ResolvedAddress> {
        if depth > MAX_CHAIN_DEPTH {
            return None;
        }
        match expr {
            Expr::IntLit(n) => Some(ResolvedAddress::absolute(*n)),
            Expr::Ident(name) => {
                if self.is_root(name) {
                    return Some(ResolvedAddress::rooted(name, 0));
                }
                let chain = self.assignments.get(name.as_str())?;
                // More than one assignment to the identifier makes the chain
                // ambiguous; abort and let the caller treat the access
                // conservatively.
                if chain.len() != 1 {
                    return None;
                }
                self.resolve_depth(chain[0], depth + 1)
            }
            Expr::PointerArith { ptr, index, scale } => {
                // Symbolic index/scale pairs are intentionally not folded.
                let index = const_eval(index)?;
                let scale = const_eval(scale)?;
                let inner = self.resolve_depth(ptr, depth + 1)?;
                Some(ResolvedAddress {
                    base: inner.base,
                    offset: inner.offset.wrapping_add(index.wrapping_mul(scale)),
                })
            }
            Expr::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
            } => {
                let delta = const_eval(rhs)?;
                let inner = self.resolve_depth(lhs, depth + 1)?;
                Some(ResolvedAddress {
                    base: inner.base,
                    offset: inner.offset.wrapping_add(delta),
                })
            }
            _ => None,
        }
    }
}

/// One-shot resolution helper.
pub fn resolve(imp: &Implementation, expr: &Expr) -> Option<ResolvedAddress> {
    PointerResolver::new(imp).resolve(expr)
}
