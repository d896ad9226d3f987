//! Shared-state analysis.
//!
//! Global map variables whose name carries the `$M.` prefix are the abstract
//! shared memory regions of the driver under analysis. This module discovers
//! them and computes, per implementation, which regions it reads and writes
//! and how often.

use drover_ir::ast::{AssignTarget, Cmd, Expr, Implementation, Program};
use indexmap::IndexMap;

/// Naming convention for shared memory regions in lowered driver code.
pub const MEMORY_REGION_PREFIX: &str = "$M.";

/// One abstract shared global: a name plus its element type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: String,
    pub ty: drover_ir::ast::Type,
}

/// Read/write access counts of one implementation against one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounts {
    pub reads: usize,
    pub writes: usize,
}

impl AccessCounts {
    pub fn total(&self) -> usize {
        self.reads + self.writes
    }
}

pub fn is_memory_region(name: &str) -> bool {
    name.starts_with(MEMORY_REGION_PREFIX)
}

/// Discover every shared memory region declared in the program, in
/// declaration order.
pub fn memory_regions(program: &Program) -> IndexMap<String, MemoryRegion> {
    let mut regions = IndexMap::new();
    for global in program.globals() {
        if is_memory_region(&global.name) {
            regions.insert(
                global.name.clone(),
                MemoryRegion {
                    name: global.name.clone(),
                    ty: global.ty,
                },
            );
        }
    }
    regions
}

fn count_reads(expr: &Expr, counts: &mut IndexMap<String, AccessCounts>) {
    if let Expr::Select { map, .. } = expr {
        if let Some(name) = map.as_ident() {
            if is_memory_region(name) {
                counts.entry(name.to_string()).or_default().reads += 1;
            }
        }
    }
    match expr {
        Expr::Select { map, index } => {
            count_reads(map, counts);
            count_reads(index, counts);
        }
        Expr::Unary { operand, .. } => count_reads(operand, counts),
        Expr::Binary { lhs, rhs, .. } => {
            count_reads(lhs, counts);
            count_reads(rhs, counts);
        }
        Expr::Ite { cond, then, els } => {
            count_reads(cond, counts);
            count_reads(then, counts);
            count_reads(els, counts);
        }
        Expr::PointerArith { ptr, index, scale } => {
            count_reads(ptr, counts);
            count_reads(index, counts);
            count_reads(scale, counts);
        }
        _ => {}
    }
}

/// Count the region accesses of one implementation. Regions it never touches
/// have no entry.
pub fn accessed_regions(imp: &Implementation) -> IndexMap<String, AccessCounts> {
    let mut counts: IndexMap<String, AccessCounts> = IndexMap::new();
    for cmd in imp.cmds() {
        match cmd {
            Cmd::Assign { target, value } => {
                if let AssignTarget::MapEntry { map, index } = target {
                    if is_memory_region(map) {
                        counts.entry(map.clone()).or_default().writes += 1;
                    }
                    count_reads(index, &mut counts);
                }
                count_reads(value, &mut counts);
            }
            Cmd::Call { args, .. } => {
                for arg in args {
                    count_reads(arg, &mut counts);
                }
            }
            Cmd::Assert { condition, .. } | Cmd::Assume { condition } => {
                count_reads(condition, &mut counts);
            }
            Cmd::Havoc { .. } => {}
        }
    }
    counts
}

/// True when the implementation touches any shared region at all.
pub fn is_racing(imp: &Implementation) -> bool {
    !accessed_regions(imp).is_empty()
}

/// Regions accessed by `root` or any implementation transitively reachable
/// from it through call commands.
pub fn reachable_accessed_regions(
    program: &Program,
    root: &str,
) -> IndexMap<String, AccessCounts> {
    let mut combined: IndexMap<String, AccessCounts> = IndexMap::new();
    for name in crate::context::reachable_implementations(program, root) {
        if let Some(imp) = program.implementation(&name) {
            for (region, counts) in accessed_regions(imp) {
                let entry = combined.entry(region).or_default();
                entry.reads += counts.reads;
                entry.writes += counts.writes;
            }
        }
    }
    combined
}
