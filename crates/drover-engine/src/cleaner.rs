//! Model cleaning.
//!
//! Between stages the program accumulates regions, clones, and state the
//! next stage no longer needs. The cleaner slices the declaration list down
//! to what is reachable from a set of root implementations, removes empty
//! forwarding blocks by retargeting their predecessors, drops unreachable
//! blocks, and shrinks the driver's access-count maps to the accesses that
//! survived. Every pass is idempotent.

use crate::context;
use crate::driver::DeviceDriver;
use crate::region::region_name;
use crate::shared;
use drover_ir::ast::{AssignTarget, Cmd, Decl, Implementation, Program, Transfer};
use std::collections::HashSet;
use tracing::debug;

/// Remove blocks that merely forward to a single successor, then drop any
/// block no longer reachable from the entry block.
pub fn clean_blocks(imp: &mut Implementation) {
    loop {
        let Some(pos) = imp.blocks.iter().skip(1).position(|b| {
            b.cmds.is_empty()
                && matches!(&b.transfer, Transfer::Goto(ls) if ls.len() == 1 && ls[0] != b.label)
        }) else {
            break;
        };
        let removed = imp.blocks.remove(pos + 1);
        let target = match removed.transfer {
            Transfer::Goto(mut labels) => labels.remove(0),
            Transfer::Return => continue,
        };
        for block in &mut imp.blocks {
            if let Transfer::Goto(labels) = &mut block.transfer {
                for label in labels.iter_mut() {
                    if *label == removed.label {
                        *label = target.clone();
                    }
                }
                labels.dedup();
            }
        }
    }

    // Unreachable-block sweep.
    let Some(entry) = imp.blocks.first().map(|b| b.label.clone()) else {
        return;
    };
    let mut reachable: HashSet<String> = HashSet::new();
    let mut worklist = vec![entry];
    while let Some(label) = worklist.pop() {
        if !reachable.insert(label.clone()) {
            continue;
        }
        if let Some(block) = imp.block(&label) {
            for succ in block.successors() {
                if !reachable.contains(succ) {
                    worklist.push(succ.clone());
                }
            }
        }
    }
    imp.blocks.retain(|b| reachable.contains(&b.label));
}

fn used_idents(program: &Program, kept_impls: &HashSet<String>) -> HashSet<String> {
    let mut used: HashSet<String> = HashSet::new();
    let record = |name: &str, used: &mut HashSet<String>| {
        used.insert(name.to_string());
    };

    for imp in program.implementations() {
        if !kept_impls.contains(&imp.name) {
            continue;
        }
        for cmd in imp.cmds() {
            match cmd {
                Cmd::Assign { target, value } => {
                    record(target.base_name(), &mut used);
                    if let AssignTarget::MapEntry { index, .. } = target {
                        index.visit_idents(&mut |n| {
                            used.insert(n.to_string());
                        });
                    }
                    value.visit_idents(&mut |n| {
                        used.insert(n.to_string());
                    });
                }
                Cmd::Call { callee, args } => {
                    record(callee, &mut used);
                    for arg in args {
                        arg.visit_idents(&mut |n| {
                            used.insert(n.to_string());
                        });
                    }
                }
                Cmd::Assert { condition, .. } | Cmd::Assume { condition } => {
                    condition.visit_idents(&mut |n| {
                        used.insert(n.to_string());
                    });
                }
                Cmd::Havoc { var } => record(var, &mut used),
            }
        }
    }

    // Contracts of surviving procedures reference more state.
    for proc in program.procedures() {
        if !kept_impls.contains(&proc.name) && !used.contains(&proc.name) {
            continue;
        }
        for name in &proc.modifies {
            used.insert(name.clone());
        }
        for expr in proc.requires.iter().chain(proc.ensures.iter()) {
            expr.visit_idents(&mut |n| {
                used.insert(n.to_string());
            });
        }
    }
    used
}

/// Slice the program down to the declarations reachable from `roots`.
pub fn slice(program: &mut Program, roots: &[String]) {
    let mut kept_impls: HashSet<String> = HashSet::new();
    for root in roots {
        kept_impls.extend(context::reachable_implementations(program, root));
    }
    let used = used_idents(program, &kept_impls);

    let before = program.decls.len();
    program.decls.retain(|decl| match decl {
        Decl::Implementation(imp) => kept_impls.contains(&imp.name),
        Decl::Procedure(proc) => kept_impls.contains(&proc.name) || used.contains(&proc.name),
        Decl::Global(g) => used.contains(&g.name),
        Decl::Const(c) => used.contains(&c.name),
        Decl::Axiom(expr) => {
            let mut all_used = true;
            expr.visit_idents(&mut |n| all_used &= used.contains(n));
            all_used
        }
    });
    debug!(
        removed = before - program.decls.len(),
        remaining = program.decls.len(),
        "sliced program"
    );
}

/// Full cleaning pass: slice to `roots`, then tidy every surviving block
/// list.
pub fn clean(program: &mut Program, roots: &[String]) {
    slice(program, roots);
    for imp in program.implementations_mut() {
        clean_blocks(imp);
    }
}

/// Recompute each entry point's region access counts from the current
/// program, dropping entries whose accesses were sliced away.
pub fn shrink_access_maps(driver: &mut DeviceDriver, program: &Program) {
    for ep in &mut driver.entry_points {
        let root = if program.implementation(&region_name(&ep.name)).is_some() {
            region_name(&ep.name)
        } else {
            ep.name.clone()
        };
        let counts = shared::reachable_accessed_regions(program, &root);
        ep.read_accesses = counts
            .iter()
            .filter(|(_, c)| c.reads > 0)
            .map(|(m, c)| (m.clone(), c.reads))
            .collect();
        ep.write_accesses = counts
            .iter()
            .filter(|(_, c)| c.writes > 0)
            .map(|(m, c)| (m.clone(), c.writes))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_ir::parse;

    const FORWARDING: &str = "\
implementation f()\n{\n\
$entry:\n  goto $skip;\n\
$skip:\n  goto $end;\n\
$dead:\n  goto $end;\n\
$end:\n  return;\n\
}\n";

    #[test]
    fn forwarding_and_dead_blocks_disappear() {
        let program = parse(FORWARDING, "t.dvl").unwrap();
        let mut imp = program.implementations().next().unwrap().clone();
        clean_blocks(&mut imp);
        let labels: Vec<_> = imp.blocks.iter().map(|b| b.label.clone()).collect();
        assert_eq!(labels, ["$entry", "$end"]);
        assert_eq!(imp.blocks[0].successors(), ["$end"]);
    }

    #[test]
    fn block_cleaning_is_idempotent() {
        let program = parse(FORWARDING, "t.dvl").unwrap();
        let mut once = program.implementations().next().unwrap().clone();
        clean_blocks(&mut once);
        let mut twice = once.clone();
        clean_blocks(&mut twice);
        assert_eq!(once, twice);
    }

    const SLICEABLE: &str = "\
var used: int;\n\
var unused: int;\n\
const lock$1: int;\n\
axiom lock$1 == 1;\n\
const lock$2: int;\n\
axiom lock$2 == 2;\n\
procedure helper(x: int);\n\
implementation root()\n{\n\
$entry:\n  used := lock$1;\n  call helper(used);\n  return;\n}\n\
implementation orphan()\n{\n\
$entry:\n  unused := lock$2;\n  return;\n}\n";

    #[test]
    fn slicing_keeps_only_the_reachable_world() {
        let mut program = parse(SLICEABLE, "t.dvl").unwrap();
        slice(&mut program, &["root".to_string()]);
        assert!(program.implementation("root").is_some());
        assert!(program.implementation("orphan").is_none());
        assert!(program.procedure("helper").is_some());
        assert!(program.global("used").is_some());
        assert!(program.global("unused").is_none());
        let consts: Vec<_> = program.constants().map(|c| c.name.clone()).collect();
        assert_eq!(consts, ["lock$1"]);
        let axioms = program
            .decls
            .iter()
            .filter(|d| matches!(d, Decl::Axiom(_)))
            .count();
        assert_eq!(axioms, 1);
    }

    #[test]
    fn slicing_is_idempotent() {
        let mut program = parse(SLICEABLE, "t.dvl").unwrap();
        slice(&mut program, &["root".to_string()]);
        let once = program.clone();
        slice(&mut program, &["root".to_string()]);
        assert_eq!(program, once);
    }
}
