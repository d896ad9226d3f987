//! Instrumentation regions.
//!
//! An instrumentation region is an entry-point implementation prepared for
//! the lockset and race passes: a dedicated `$header` block ahead of the
//! original entry block (the landing site for seeded predicates), natural
//! loop headers discovered through dominance (the landing sites for loop
//! invariants), and no-op lowering intrinsics dropped.

use drover_ir::ast::{Attribute, Block, Cmd, Expr, Implementation, Transfer};
use std::collections::{HashMap, HashSet};

pub const HEADER_LABEL: &str = "$header";

/// Suffix appended to an entry point's name for its instrumented region.
pub const REGION_SUFFIX: &str = "$instrumented";

pub fn region_name(entry_point: &str) -> String {
    format!("{entry_point}{REGION_SUFFIX}")
}

/// Lowering intrinsics that move bytes we model through `$M.` maps anyway.
fn is_noop_intrinsic(callee: &str) -> bool {
    callee.starts_with("$memcpy") || callee.starts_with("$memset") || callee.starts_with("$memmove")
}

/// Insert an empty `$header` block jumping to the original entry block.
/// Idempotent: a region that already starts with `$header` is left alone.
pub fn install_header(imp: &mut Implementation) {
    if imp.blocks.first().map(|b| b.label.as_str()) == Some(HEADER_LABEL) {
        return;
    }
    let Some(entry) = imp.blocks.first().map(|b| b.label.clone()) else {
        return;
    };
    imp.blocks.insert(
        0,
        Block::new(HEADER_LABEL, Vec::new(), Transfer::Goto(vec![entry])),
    );
}

/// Drop calls to no-op lowering intrinsics throughout the region.
pub fn drop_noop_intrinsics(imp: &mut Implementation) {
    for block in &mut imp.blocks {
        block
            .cmds
            .retain(|cmd| !matches!(cmd, Cmd::Call { callee, .. } if is_noop_intrinsic(callee)));
    }
}

/// Insert a candidate invariant at the head of `label`'s block.
pub fn add_invariant(imp: &mut Implementation, label: &str, condition: Expr) {
    if let Some(block) = imp.block_mut(label) {
        block.cmds.insert(
            0,
            Cmd::Assert {
                attributes: vec![Attribute::flag("candidate")],
                condition,
            },
        );
    }
}

/// Remove the contiguous predicate prefix of `label`'s block, undoing
/// [`add_invariant`] seeding.
pub fn remove_invariants(imp: &mut Implementation, label: &str) {
    if let Some(block) = imp.block_mut(label) {
        let prefix = block.cmds.iter().take_while(|c| c.is_predicate()).count();
        block.cmds.drain(..prefix);
    }
}

/// Labels of the natural-loop headers of the region, in block order. A block
/// `h` is a loop header when some edge `n -> h` exists with `h` dominating
/// `n`.
pub fn loop_headers(imp: &Implementation) -> Vec<String> {
    let n = imp.blocks.len();
    if n == 0 {
        return Vec::new();
    }
    let index: HashMap<&str, usize> = imp
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.label.as_str(), i))
        .collect();
    let succs: Vec<Vec<usize>> = imp
        .blocks
        .iter()
        .map(|b| {
            b.successors()
                .iter()
                .filter_map(|l| index.get(l.as_str()).copied())
                .collect()
        })
        .collect();
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (from, ss) in succs.iter().enumerate() {
        for &to in ss {
            preds[to].push(from);
        }
    }

    // Iterative dominator sets; the first block is the entry.
    let full: HashSet<usize> = (0..n).collect();
    let mut dom: Vec<HashSet<usize>> = vec![full; n];
    dom[0] = HashSet::from([0]);
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..n {
            let mut new: Option<HashSet<usize>> = None;
            for &p in &preds[i] {
                new = Some(match new {
                    None => dom[p].clone(),
                    Some(acc) => acc.intersection(&dom[p]).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(i);
            if new != dom[i] {
                dom[i] = new;
                changed = true;
            }
        }
    }

    let mut headers = Vec::new();
    for (from, ss) in succs.iter().enumerate() {
        for &to in ss {
            if dom[from].contains(&to) && !headers.contains(&to) {
                headers.push(to);
            }
        }
    }
    headers.sort_unstable();
    headers
        .into_iter()
        .map(|i| imp.blocks[i].label.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_ir::parse;

    fn imp_of(src: &str) -> Implementation {
        parse(src, "t.dvl")
            .unwrap()
            .implementations()
            .next()
            .unwrap()
            .clone()
    }

    const LOOPY: &str = "\
implementation f(n: int)\n{\n\
var i: int;\n\
$entry:\n  i := 0;\n  goto $head;\n\
$head:\n  goto $body, $exit;\n\
$body:\n  i := i + 1;\n  goto $head;\n\
$exit:\n  return;\n\
}\n";

    #[test]
    fn header_installation_is_idempotent() {
        let mut imp = imp_of(LOOPY);
        install_header(&mut imp);
        install_header(&mut imp);
        assert_eq!(imp.blocks[0].label, HEADER_LABEL);
        assert_eq!(imp.blocks[0].successors(), ["$entry"]);
        assert_eq!(imp.blocks.iter().filter(|b| b.label == HEADER_LABEL).count(), 1);
    }

    #[test]
    fn finds_natural_loop_header() {
        let imp = imp_of(LOOPY);
        assert_eq!(loop_headers(&imp), ["$head"]);
    }

    #[test]
    fn straight_line_region_has_no_headers() {
        let imp = imp_of("implementation f()\n{\n$entry:\n  return;\n}\n");
        assert!(loop_headers(&imp).is_empty());
    }

    #[test]
    fn invariant_seeding_round_trips() {
        let mut imp = imp_of(LOOPY);
        add_invariant(&mut imp, "$head", Expr::eq(Expr::ident("i"), Expr::ident("i")));
        add_invariant(&mut imp, "$head", Expr::BoolLit(true));
        assert_eq!(imp.block("$head").unwrap().cmds.len(), 2);
        remove_invariants(&mut imp, "$head");
        assert!(imp.block("$head").unwrap().cmds.is_empty());
    }

    #[test]
    fn memcpy_family_calls_are_dropped() {
        let mut imp = imp_of(
            "implementation f(p: int)\n{\n\
             $entry:\n  call $memcpy.i8(p, p, 4);\n  call mutex_lock(p);\n  return;\n}\n",
        );
        drop_noop_intrinsics(&mut imp);
        let calls: Vec<_> = imp
            .cmds()
            .filter_map(|c| match c {
                Cmd::Call { callee, .. } => Some(callee.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(calls, ["mutex_lock"]);
    }
}
