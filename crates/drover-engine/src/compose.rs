//! Pairwise region composition.
//!
//! Builds the `check$<A>$<B>` composite that drives one instrumented region
//! after the other under a shared set of unified formals. Self-pairs are
//! materialized by duplicating the entry point ahead of instrumentation, so
//! by the time a pair is composed its two sides always carry distinct names
//! and distinct per-entry-point state.

use crate::driver::DeviceDriver;
use crate::pairing::EntryPointPair;
use crate::region::region_name;
use drover_ir::ast::{
    AttrParam, Attribute, Block, Cmd, Decl, Expr, Implementation, Procedure, Transfer, TypedVar,
};
use drover_ir::Program;
use indexmap::IndexSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("instrumented region '{name}' is missing from the program")]
    MissingRegion { name: String },
}

pub const PAIR_ATTR: &str = "entry_pair";
pub const CHECKER_BLOCK: &str = "$checker";

/// Suffix given to the duplicated side of a self-pair.
pub const DUPLICATE_SUFFIX: &str = "$2";

/// Composite name for a pair: `check$<A>$<B>`, or `check$<A>$any` for a
/// merged group.
pub fn composite_name(pair: &EntryPointPair) -> String {
    match pair.checkers.as_slice() {
        [single] => format!("check${}${}", pair.logger, single),
        _ => format!("check${}$any", pair.logger),
    }
}

/// Pure renaming clone of a region implementation.
pub fn rename(region: &Implementation, name: &str) -> Implementation {
    let mut clone = region.clone();
    clone.name = name.to_string();
    clone
}

/// Materialize the second side of a self-pair as a fresh entry point
/// `<ep>$2`, cloning the body and registering it with the driver under the
/// same kernel role. Instrumentation then treats it like any other entry
/// point, giving the two sides disjoint lockset state.
pub fn duplicate_entry_point(
    program: &mut Program,
    driver: &mut DeviceDriver,
    ep: &str,
) -> Result<String, ComposeError> {
    let dup = format!("{ep}{DUPLICATE_SUFFIX}");
    if program.implementation(&dup).is_some() {
        return Ok(dup);
    }
    let Some(original) = program.implementation(ep) else {
        return Err(ComposeError::MissingRegion {
            name: ep.to_string(),
        });
    };
    program.decls.push(Decl::Implementation(rename(original, &dup)));
    if let Some(proc) = program.procedure(ep) {
        let mut proc = proc.clone();
        proc.name = dup.clone();
        program.decls.push(Decl::Procedure(proc));
    }
    if let Some(entry) = driver.entry_point(ep) {
        let mut entry = entry.clone();
        entry.name = dup.clone();
        driver.entry_points.push(entry);
    }
    Ok(dup)
}

fn region_proc<'a>(program: &'a Program, ep: &str) -> Result<&'a Procedure, ComposeError> {
    let name = region_name(ep);
    program
        .procedure(&name)
        .filter(|_| program.implementation(&name).is_some())
        .ok_or(ComposeError::MissingRegion { name })
}

/// Formals the kernel hands identically to every entry point it registered:
/// the init routine's own formals. Only these may share a composite slot.
fn shared_init_formals(program: &Program, init: &str) -> Vec<TypedVar> {
    program
        .implementation(init)
        .map(|imp| imp.params.clone())
        .or_else(|| program.procedure(init).map(|p| p.params.clone()))
        .unwrap_or_default()
}

/// Compose one pair into its `check$<A>$<B>` composite, returning the
/// composite's name.
///
/// A checker parameter shares the composite formal at its position only
/// when name and type agree and the formal traces back to the init
/// routine's own parameter list (the kernel passes that object to both
/// sides); anything else gets a fresh suffixed formal, so same-typed
/// formals denoting unrelated objects are never aliased. Contracts and
/// modifies sets of both sides are merged, deduplicated, onto the
/// composite.
pub fn compose_pair(
    program: &mut Program,
    pair: &EntryPointPair,
    init: &str,
) -> Result<String, ComposeError> {
    let name = composite_name(pair);
    if program.implementation(&name).is_some() {
        return Ok(name);
    }

    let init_formals = shared_init_formals(program, init);
    let logger = region_proc(program, &pair.logger)?;
    let mut params: Vec<TypedVar> = logger.params.clone();
    let logger_args: Vec<Expr> = params.iter().map(|p| Expr::ident(&p.name)).collect();
    let mut requires: Vec<Expr> = logger.requires.clone();
    let mut modifies: IndexSet<String> = logger.modifies.iter().cloned().collect();
    let logger_call = Cmd::Call {
        callee: region_name(&pair.logger),
        args: logger_args,
    };

    let mut checker_calls: Vec<Cmd> = Vec::new();
    for (k, checker) in pair.checkers.iter().enumerate() {
        let proc = region_proc(program, checker)?;
        let mut args = Vec::with_capacity(proc.params.len());
        for (i, param) in proc.params.iter().enumerate() {
            match params.get(i) {
                Some(unified)
                    if unified.ty == param.ty
                        && unified.name == param.name
                        && init_formals
                            .iter()
                            .any(|f| f.name == param.name && f.ty == param.ty) =>
                {
                    args.push(Expr::ident(&unified.name));
                }
                _ => {
                    let fresh = format!("{}${}", param.name, k + 2);
                    params.push(TypedVar::new(&fresh, param.ty));
                    args.push(Expr::ident(&fresh));
                }
            }
        }
        for req in &proc.requires {
            if !requires.contains(req) {
                requires.push(req.clone());
            }
        }
        modifies.extend(proc.modifies.iter().cloned());
        checker_calls.push(Cmd::Call {
            callee: region_name(checker),
            args,
        });
    }

    let blocks = match checker_calls.len() {
        1 => vec![Block::new(
            CHECKER_BLOCK,
            vec![logger_call, checker_calls.remove(0)],
            Transfer::Return,
        )],
        _ => {
            let labels: Vec<String> = (0..checker_calls.len())
                .map(|i| format!("$case{i}"))
                .collect();
            let mut blocks = vec![Block::new(
                CHECKER_BLOCK,
                vec![logger_call],
                Transfer::Goto(labels.clone()),
            )];
            for (label, call) in labels.iter().zip(checker_calls) {
                blocks.push(Block::new(label, vec![call], Transfer::Return));
            }
            blocks
        }
    };

    let mut pair_attr_params = vec![AttrParam::Str(pair.logger.clone())];
    pair_attr_params.extend(pair.checkers.iter().map(|c| AttrParam::Str(c.clone())));
    let attributes = vec![
        Attribute::flag(PAIR_ATTR),
        Attribute {
            name: "pair".to_string(),
            params: pair_attr_params,
        },
    ];

    let mut proc = Procedure::new(&name, params.clone());
    proc.attributes = attributes.clone();
    proc.requires = requires;
    proc.modifies = modifies.into_iter().collect();
    program.decls.push(Decl::Procedure(proc));
    program.decls.push(Decl::Implementation(Implementation {
        name: name.clone(),
        attributes,
        params,
        locals: Vec::new(),
        blocks,
    }));
    Ok(name)
}
