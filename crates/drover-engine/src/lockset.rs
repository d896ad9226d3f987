//! Lockset instrumentation.
//!
//! For every concurrent entry point this pass builds an instrumented region:
//! a clone of the entry point body (plus per-entry-point clones of its
//! transitive callees) in which every `mutex_lock`/`mutex_unlock` site is
//! replaced by a call to the entry point's current-lockset updater
//! `_UPDATE_CLS_$<ep>`. The current lockset is one boolean per canonical
//! lock per entry point; the memory locksets live with the race
//! instrumentation, whose checking variant decides their shape.

use crate::context::{self, AnalysisContext};
use crate::locks::{self, Lock, MUTEX_LOCK, MUTEX_UNLOCK, UNIDENTIFIED_LOCK};
use crate::region::{self, region_name};
use crate::shared;
use drover_ir::ast::{
    AssignTarget, AttrParam, Attribute, Block, Cmd, Decl, Expr, Implementation, Procedure,
    Transfer, Type, TypedVar,
};
use drover_ir::Program;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LocksetError {
    #[error("entry point '{entry_point}' has no implementation in the program")]
    MissingImplementation { entry_point: String },
}

/// Current-lockset variable of one lock for one entry point.
pub fn cls_var(lock_name: &str, ep: &str) -> String {
    format!("CLS_{lock_name}_${ep}")
}

pub fn updater_name(ep: &str) -> String {
    format!("_UPDATE_CLS_${ep}")
}

pub const ENTRY_POINT_ATTR: &str = "entry_point";

fn lock_actual(locks: &[Lock], imp: &Implementation, arg: Option<&Expr>) -> Expr {
    let id = match arg {
        Some(arg) => locks::identify(locks, imp, arg),
        None => UNIDENTIFIED_LOCK,
    };
    match locks.iter().find(|l| l.id == id) {
        Some(lock) => Expr::ident(&lock.name),
        None => Expr::IntLit(UNIDENTIFIED_LOCK),
    }
}

/// Replace mutex acquire/release sites with updater calls and retarget
/// callee names through `rename`.
fn rewrite_calls(
    imp: &mut Implementation,
    locks: &[Lock],
    updater: &str,
    rename: &HashMap<String, String>,
) {
    let identities = imp.clone();
    for block in &mut imp.blocks {
        for cmd in &mut block.cmds {
            let Cmd::Call { callee, args } = cmd else {
                continue;
            };
            match callee.as_str() {
                MUTEX_LOCK | MUTEX_UNLOCK => {
                    let held = callee == MUTEX_LOCK;
                    let lock = lock_actual(locks, &identities, args.first());
                    *callee = updater.to_string();
                    *args = vec![lock, Expr::BoolLit(held)];
                }
                other => {
                    if let Some(target) = rename.get(other) {
                        *callee = target.clone();
                    }
                }
            }
        }
    }
}

fn updater_decls(ep: &str, locks: &[Lock]) -> (Procedure, Implementation) {
    let name = updater_name(ep);
    let params = vec![
        TypedVar::new("lock", Type::Int),
        TypedVar::new("isLocked", Type::Bool),
    ];
    let mut proc = Procedure::new(&name, params.clone());
    let mut cmds = Vec::with_capacity(locks.len());
    for lock in locks {
        let var = cls_var(&lock.name, ep);
        proc.modifies.push(var.clone());
        cmds.push(Cmd::Assign {
            target: AssignTarget::Var(var.clone()),
            value: Expr::ite(
                Expr::eq(Expr::ident("lock"), Expr::ident(&lock.name)),
                Expr::ident("isLocked"),
                Expr::ident(&var),
            ),
        });
    }
    let imp = Implementation {
        name,
        attributes: Vec::new(),
        params,
        locals: Vec::new(),
        blocks: vec![Block::new("$entry", cmds, Transfer::Return)],
    };
    (proc, imp)
}

fn entry_point_attr(ep: &str) -> Attribute {
    Attribute {
        name: ENTRY_POINT_ATTR.to_string(),
        params: vec![AttrParam::Str(ep.to_string())],
    }
}

/// Instrument every concurrent entry point of the driver in place.
pub fn instrument(program: &mut Program, ctx: &AnalysisContext) -> Result<(), LocksetError> {
    locks::declare_lock_constants(program, &ctx.locks);

    let entry_points: Vec<String> = ctx
        .driver
        .concurrent_entry_points()
        .map(|ep| ep.name.clone())
        .collect();

    for ep in &entry_points {
        if program.implementation(ep).is_none() {
            return Err(LocksetError::MissingImplementation {
                entry_point: ep.clone(),
            });
        }
        debug!(entry_point = %ep, "building instrumented region");

        let updater = updater_name(ep);
        let mut rename: HashMap<String, String> = HashMap::new();
        let helpers: Vec<String> = context::reachable_implementations(program, ep)
            .into_iter()
            .filter(|name| name != ep)
            .collect();
        for helper in &helpers {
            rename.insert(helper.clone(), format!("{helper}${ep}"));
        }

        // Accesses of the whole closure determine the region contract.
        let accessed = shared::reachable_accessed_regions(program, ep);

        let mut new_decls: Vec<Decl> = Vec::new();

        let (updater_proc, updater_imp) = updater_decls(ep, &ctx.locks);
        new_decls.push(Decl::Procedure(updater_proc));
        new_decls.push(Decl::Implementation(updater_imp));

        for lock in &ctx.locks {
            program.add_global(&cls_var(&lock.name, ep), Type::Bool);
        }

        for helper in &helpers {
            // Reachability guarantees the body exists.
            let Some(original) = program.implementation(helper) else {
                continue;
            };
            let mut clone = original.clone();
            clone.name = rename[helper].clone();
            rewrite_calls(&mut clone, &ctx.locks, &updater, &rename);
            if let Some(proc) = program.procedure(helper) {
                let mut proc = proc.clone();
                proc.name = clone.name.clone();
                for lock in &ctx.locks {
                    proc.modifies.push(cls_var(&lock.name, ep));
                }
                new_decls.push(Decl::Procedure(proc));
            }
            new_decls.push(Decl::Implementation(clone));
        }

        let Some(original) = program.implementation(ep) else {
            continue;
        };
        let mut body = original.clone();
        body.name = region_name(ep);
        body.attributes.push(entry_point_attr(ep));
        region::install_header(&mut body);
        region::drop_noop_intrinsics(&mut body);
        rewrite_calls(&mut body, &ctx.locks, &updater, &rename);

        let mut proc = Procedure::new(&body.name, body.params.clone());
        proc.attributes.push(entry_point_attr(ep));
        for lock in &ctx.locks {
            let var = cls_var(&lock.name, ep);
            proc.modifies.push(var.clone());
            // Each entry point starts with an empty current lockset.
            proc.requires.push(Expr::not(Expr::ident(&var)));
        }
        for mem in accessed.keys() {
            proc.modifies.push(mem.clone());
        }
        new_decls.push(Decl::Procedure(proc));
        new_decls.push(Decl::Implementation(body));

        program.decls.extend(new_decls);
    }

    Ok(())
}
