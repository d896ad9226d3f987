//! Analysis context.
//!
//! Immutable tables shared by every pipeline stage: the driver model, the
//! discovered memory regions, the canonical locks, and call-graph queries
//! over the current program.

use crate::driver::DeviceDriver;
use crate::locks::Lock;
use crate::shared::{self, MemoryRegion};
use drover_ir::ast::{Cmd, Program};
use indexmap::{IndexMap, IndexSet};

/// Everything the instrumentation stages need to know about the driver
/// beyond the program text itself. Built once per pipeline run and treated
/// as read-only thereafter.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub driver: DeviceDriver,
    pub memory_regions: IndexMap<String, MemoryRegion>,
    pub locks: Vec<Lock>,
}

impl AnalysisContext {
    pub fn new(program: &Program, driver: DeviceDriver) -> Self {
        let memory_regions = shared::memory_regions(program);
        let locks = crate::locks::abstract_locks(program, driver.init_entry_point());
        Self {
            driver,
            memory_regions,
            locks,
        }
    }

    pub fn lock(&self, name: &str) -> Option<&Lock> {
        self.locks.iter().find(|l| l.name == name)
    }
}

/// Direct callees of one implementation, in call order, deduplicated.
pub fn direct_callees(program: &Program, name: &str) -> IndexSet<String> {
    let mut callees = IndexSet::new();
    if let Some(imp) = program.implementation(name) {
        for cmd in imp.cmds() {
            if let Cmd::Call { callee, .. } = cmd {
                callees.insert(callee.clone());
            }
        }
    }
    callees
}

/// Implementations transitively reachable from `root` through call commands,
/// including `root` itself when it exists. Callees without an implementation
/// body (declared-only procedures) do not appear.
pub fn reachable_implementations(program: &Program, root: &str) -> IndexSet<String> {
    let mut reached = IndexSet::new();
    let mut worklist = vec![root.to_string()];
    while let Some(name) = worklist.pop() {
        if program.implementation(&name).is_none() || !reached.insert(name.clone()) {
            continue;
        }
        for callee in direct_callees(program, &name) {
            if !reached.contains(&callee) {
                worklist.push(callee);
            }
        }
    }
    reached
}
