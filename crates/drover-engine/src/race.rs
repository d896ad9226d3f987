//! Race instrumentation.
//!
//! Runs in two steps. `instrument_accesses` (per entry point, before
//! composition) inserts a `_LOG_<KIND>_LS_<M>_$<ep>(ptr)` call ahead of every
//! shared-region access and declares the matching `_CHECK_` procedure.
//! `instrument_pair` (per composed pair) picks an [`AccessTracker`] for the
//! requested variant, declares the race-state globals, gives the logger
//! side's `_LOG_` procedures their logging bodies, rewrites the checker
//! side's calls to the `_CHECK_` procedures, and fills those with
//! `{:race_checking}` asserts realizing the log-then-check protocol.

use crate::context::{self, AnalysisContext};
use crate::region::region_name;
use crate::shared;
use drover_ir::ast::{
    AssignTarget, AttrParam, Attribute, Block, Cmd, Decl, Expr, Implementation, Procedure,
    Transfer, Type, TypedVar,
};
use drover_ir::Program;
use indexmap::IndexSet;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Race-checking instrumentation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RaceCheckingVariant {
    /// Per-offset access and lockset maps.
    Normal,
    /// One nondeterministically watched offset per region; flat state.
    #[default]
    Watchdog,
}

impl fmt::Display for RaceCheckingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceCheckingVariant::Normal => write!(f, "normal"),
            RaceCheckingVariant::Watchdog => write!(f, "watchdog"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub fn tag(self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        }
    }

    fn caps(self) -> &'static str {
        match self {
            AccessKind::Read => "READ",
            AccessKind::Write => "WRITE",
        }
    }
}

pub const TRACKING_VAR: &str = "TRACKING";
pub const RACE_CHECKING_ATTR: &str = "race_checking";
pub const ACCESS_ATTR: &str = "access";
const LOG_FLAG: &str = "log_access";
const CHECK_FLAG: &str = "check_access";
const PTR_PARAM: &str = "ptr";

pub fn write_occurred_var(mem: &str) -> String {
    format!("WRITE_HAS_OCCURRED_{mem}")
}

pub fn read_occurred_var(mem: &str) -> String {
    format!("READ_HAS_OCCURRED_{mem}")
}

pub fn watched_offset_var(mem: &str) -> String {
    format!("WATCHED_ACCESS_OFFSET_{mem}")
}

/// Memory-lockset variable of one lock for one shared region.
pub fn ls_var(lock_name: &str, mem: &str) -> String {
    format!("LS_{lock_name}_{mem}")
}

pub fn log_proc_name(kind: AccessKind, mem: &str, ep: &str) -> String {
    format!("_LOG_{}_LS_{}_${}", kind.caps(), mem, ep)
}

pub fn check_proc_name(kind: AccessKind, mem: &str, ep: &str) -> String {
    format!("_CHECK_{}_LS_{}_${}", kind.caps(), mem, ep)
}

fn access_attr(kind: AccessKind, mem: &str, ep: &str) -> Attribute {
    Attribute {
        name: ACCESS_ATTR.to_string(),
        params: vec![
            AttrParam::Str(kind.tag().to_string()),
            AttrParam::Str(mem.to_string()),
            AttrParam::Str(ep.to_string()),
        ],
    }
}

/// Decode an `{:access kind mem ep}` attribute from a procedure.
pub fn decode_access(proc: &Procedure) -> Option<(AccessKind, String, String)> {
    let attr = proc.attributes.iter().find(|a| a.name == ACCESS_ATTR)?;
    match attr.params.as_slice() {
        [AttrParam::Str(kind), AttrParam::Str(mem), AttrParam::Str(ep)] => {
            let kind = match kind.as_str() {
                "read" => AccessKind::Read,
                "write" => AccessKind::Write,
                _ => return None,
            };
            Some((kind, mem.clone(), ep.clone()))
        }
        _ => None,
    }
}

fn collect_reads(expr: &Expr, out: &mut Vec<(String, Expr)>) {
    if let Expr::Select { map, index } = expr {
        if let Some(name) = map.as_ident() {
            if shared::is_memory_region(name) {
                out.push((name.to_string(), (**index).clone()));
            }
        }
    }
    match expr {
        Expr::Select { map, index } => {
            collect_reads(map, out);
            collect_reads(index, out);
        }
        Expr::Unary { operand, .. } => collect_reads(operand, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_reads(lhs, out);
            collect_reads(rhs, out);
        }
        Expr::Ite { cond, then, els } => {
            collect_reads(cond, out);
            collect_reads(then, out);
            collect_reads(els, out);
        }
        Expr::PointerArith { ptr, index, scale } => {
            collect_reads(ptr, out);
            collect_reads(index, out);
            collect_reads(scale, out);
        }
        _ => {}
    }
}

/// Insert access-logging calls ahead of every shared-region access reachable
/// from each instrumented region, and declare the log/check procedure pairs.
pub fn instrument_accesses(program: &mut Program, ctx: &AnalysisContext) {
    let mut declared: IndexSet<(AccessKind, String, String)> = IndexSet::new();

    let entry_points: Vec<String> = ctx
        .driver
        .concurrent_entry_points()
        .map(|ep| ep.name.clone())
        .collect();

    for ep in &entry_points {
        let members = context::reachable_implementations(program, &region_name(ep));
        for member in members {
            let Some(imp) = program.implementation_mut(&member) else {
                continue;
            };
            for block in &mut imp.blocks {
                let mut cmds = Vec::with_capacity(block.cmds.len());
                for cmd in block.cmds.drain(..) {
                    let mut reads = Vec::new();
                    let mut writes = Vec::new();
                    match &cmd {
                        Cmd::Assign { target, value } => {
                            if let AssignTarget::MapEntry { map, index } = target {
                                if shared::is_memory_region(map) {
                                    writes.push((map.clone(), index.clone()));
                                }
                                collect_reads(index, &mut reads);
                            }
                            collect_reads(value, &mut reads);
                        }
                        Cmd::Call { args, .. } => {
                            for arg in args {
                                collect_reads(arg, &mut reads);
                            }
                        }
                        Cmd::Assert { condition, .. } | Cmd::Assume { condition } => {
                            collect_reads(condition, &mut reads);
                        }
                        Cmd::Havoc { .. } => {}
                    }
                    for (mem, index) in reads {
                        declared.insert((AccessKind::Read, mem.clone(), ep.clone()));
                        cmds.push(Cmd::Call {
                            callee: log_proc_name(AccessKind::Read, &mem, ep),
                            args: vec![index],
                        });
                    }
                    for (mem, index) in writes {
                        declared.insert((AccessKind::Write, mem.clone(), ep.clone()));
                        cmds.push(Cmd::Call {
                            callee: log_proc_name(AccessKind::Write, &mem, ep),
                            args: vec![index],
                        });
                    }
                    cmds.push(cmd);
                }
                block.cmds = cmds;
            }
        }
    }

    for (kind, mem, ep) in declared {
        let params = vec![TypedVar::new(PTR_PARAM, Type::Int)];
        let mut log = Procedure::new(&log_proc_name(kind, &mem, &ep), params.clone());
        log.attributes.push(Attribute::flag(LOG_FLAG));
        log.attributes.push(access_attr(kind, &mem, &ep));
        program.decls.push(Decl::Procedure(log));

        let mut check = Procedure::new(&check_proc_name(kind, &mem, &ep), params);
        check.attributes.push(Attribute::flag(CHECK_FLAG));
        check.attributes.push(access_attr(kind, &mem, &ep));
        program.decls.push(Decl::Procedure(check));
    }
}

/// Strategy seam between the two race-checking variants: how race state is
/// declared, logged, checked, and constrained at composite entry.
trait AccessTracker {
    fn declare_state(&self, program: &mut Program, mems: &[String], locks: &[String]);
    fn log_cmds(
        &self,
        kind: AccessKind,
        mem: &str,
        ep: &str,
        locks: &[String],
    ) -> (Vec<String>, Vec<Cmd>);
    fn check_assert(&self, kind: AccessKind, mem: &str, ep: &str, locks: &[String]) -> Cmd;
    fn entry_requires(&self, mems: &[String], locks: &[String]) -> Vec<Expr>;
}

struct WatchdogTracker;
struct NormalTracker;

fn race_assert_attrs(kind: AccessKind, mem: &str) -> Vec<Attribute> {
    vec![
        Attribute::flag(RACE_CHECKING_ATTR),
        Attribute {
            name: ACCESS_ATTR.to_string(),
            params: vec![
                AttrParam::Str(kind.tag().to_string()),
                AttrParam::Str(mem.to_string()),
            ],
        },
    ]
}

/// `true` entries that a conflicting check must find: some lock held by the
/// checker whose memory lockset survived the logger's accesses.
fn protection(locks: &[String], ep: &str, ls_of: impl Fn(&str) -> Expr) -> Expr {
    Expr::any(
        locks
            .iter()
            .map(|l| Expr::and(ls_of(l), Expr::ident(&crate::lockset::cls_var(l, ep))))
            .collect(),
    )
}

impl AccessTracker for WatchdogTracker {
    fn declare_state(&self, program: &mut Program, mems: &[String], locks: &[String]) {
        if program.global(TRACKING_VAR).is_none() {
            program.add_global(TRACKING_VAR, Type::Bool);
        }
        for mem in mems {
            for var in [write_occurred_var(mem), read_occurred_var(mem)] {
                if program.global(&var).is_none() {
                    program.add_global(&var, Type::Bool);
                }
            }
            let watched = watched_offset_var(mem);
            if program.global(&watched).is_none() {
                program.add_global(&watched, Type::Int);
            }
            for lock in locks {
                let ls = ls_var(lock, mem);
                if program.global(&ls).is_none() {
                    program.add_global(&ls, Type::Bool);
                }
            }
        }
    }

    fn log_cmds(
        &self,
        kind: AccessKind,
        mem: &str,
        ep: &str,
        locks: &[String],
    ) -> (Vec<String>, Vec<Cmd>) {
        let guard = Expr::and(
            Expr::ident(TRACKING_VAR),
            Expr::eq(Expr::ident(&watched_offset_var(mem)), Expr::ident(PTR_PARAM)),
        );
        let occurred = match kind {
            AccessKind::Write => write_occurred_var(mem),
            AccessKind::Read => read_occurred_var(mem),
        };
        let mut modifies = vec![occurred.clone()];
        let mut cmds = vec![Cmd::Assign {
            target: AssignTarget::Var(occurred.clone()),
            value: Expr::ite(guard.clone(), Expr::BoolLit(true), Expr::ident(&occurred)),
        }];
        for lock in locks {
            let ls = ls_var(lock, mem);
            let cls = crate::lockset::cls_var(lock, ep);
            cmds.push(Cmd::Assign {
                target: AssignTarget::Var(ls.clone()),
                value: Expr::ite(
                    guard.clone(),
                    Expr::and(Expr::ident(&ls), Expr::ident(&cls)),
                    Expr::ident(&ls),
                ),
            });
            modifies.push(ls);
        }
        (modifies, cmds)
    }

    fn check_assert(&self, kind: AccessKind, mem: &str, ep: &str, locks: &[String]) -> Cmd {
        // A write conflicts with any logged access; a read only with writes.
        let conflicting = match kind {
            AccessKind::Write => Expr::or(
                Expr::ident(&write_occurred_var(mem)),
                Expr::ident(&read_occurred_var(mem)),
            ),
            AccessKind::Read => Expr::ident(&write_occurred_var(mem)),
        };
        let antecedent = Expr::and(
            Expr::and(
                Expr::ident(TRACKING_VAR),
                Expr::eq(Expr::ident(&watched_offset_var(mem)), Expr::ident(PTR_PARAM)),
            ),
            conflicting,
        );
        let consequent = protection(locks, ep, |l| Expr::ident(&ls_var(l, mem)));
        Cmd::Assert {
            attributes: race_assert_attrs(kind, mem),
            condition: Expr::implies(antecedent, consequent),
        }
    }

    fn entry_requires(&self, mems: &[String], locks: &[String]) -> Vec<Expr> {
        let mut requires = Vec::new();
        for mem in mems {
            requires.push(Expr::not(Expr::ident(&write_occurred_var(mem))));
            requires.push(Expr::not(Expr::ident(&read_occurred_var(mem))));
            // Memory locksets start full; logging intersects them down.
            for lock in locks {
                requires.push(Expr::ident(&ls_var(lock, mem)));
            }
        }
        requires
    }
}

impl AccessTracker for NormalTracker {
    fn declare_state(&self, program: &mut Program, mems: &[String], locks: &[String]) {
        for mem in mems {
            for var in [write_occurred_var(mem), read_occurred_var(mem)] {
                if program.global(&var).is_none() {
                    program.add_global(&var, Type::MapIntBool);
                }
            }
            for lock in locks {
                let ls = ls_var(lock, mem);
                if program.global(&ls).is_none() {
                    program.add_global(&ls, Type::MapIntBool);
                }
            }
        }
    }

    fn log_cmds(
        &self,
        kind: AccessKind,
        mem: &str,
        ep: &str,
        locks: &[String],
    ) -> (Vec<String>, Vec<Cmd>) {
        let occurred = match kind {
            AccessKind::Write => write_occurred_var(mem),
            AccessKind::Read => read_occurred_var(mem),
        };
        let ptr = Expr::ident(PTR_PARAM);
        let mut modifies = vec![occurred.clone()];
        let mut cmds = vec![Cmd::Assign {
            target: AssignTarget::MapEntry {
                map: occurred,
                index: ptr.clone(),
            },
            value: Expr::BoolLit(true),
        }];
        for lock in locks {
            let ls = ls_var(lock, mem);
            let cls = crate::lockset::cls_var(lock, ep);
            cmds.push(Cmd::Assign {
                target: AssignTarget::MapEntry {
                    map: ls.clone(),
                    index: ptr.clone(),
                },
                value: Expr::and(
                    Expr::select(Expr::ident(&ls), ptr.clone()),
                    Expr::ident(&cls),
                ),
            });
            modifies.push(ls);
        }
        (modifies, cmds)
    }

    fn check_assert(&self, kind: AccessKind, mem: &str, ep: &str, locks: &[String]) -> Cmd {
        let ptr = Expr::ident(PTR_PARAM);
        let write = Expr::select(Expr::ident(&write_occurred_var(mem)), ptr.clone());
        let conflicting = match kind {
            AccessKind::Write => Expr::or(
                write,
                Expr::select(Expr::ident(&read_occurred_var(mem)), ptr.clone()),
            ),
            AccessKind::Read => write,
        };
        let consequent = protection(locks, ep, |l| {
            Expr::select(Expr::ident(&ls_var(l, mem)), ptr.clone())
        });
        Cmd::Assert {
            attributes: race_assert_attrs(kind, mem),
            condition: Expr::implies(conflicting, consequent),
        }
    }

    fn entry_requires(&self, mems: &[String], locks: &[String]) -> Vec<Expr> {
        let mut requires = Vec::new();
        for mem in mems {
            requires.push(Expr::NoneTrue(write_occurred_var(mem)));
            requires.push(Expr::NoneTrue(read_occurred_var(mem)));
            for lock in locks {
                requires.push(Expr::AllTrue(ls_var(lock, mem)));
            }
        }
        requires
    }
}

fn tracker(variant: RaceCheckingVariant) -> &'static dyn AccessTracker {
    match variant {
        RaceCheckingVariant::Normal => &NormalTracker,
        RaceCheckingVariant::Watchdog => &WatchdogTracker,
    }
}

fn body_impl(name: &str, cmds: Vec<Cmd>) -> Implementation {
    Implementation {
        name: name.to_string(),
        attributes: Vec::new(),
        params: vec![TypedVar::new(PTR_PARAM, Type::Int)],
        locals: Vec::new(),
        blocks: vec![Block::new("$entry", cmds, Transfer::Return)],
    }
}

/// Rewrite the checker side's access calls from the `_LOG_` flavor to the
/// `_CHECK_` flavor. Runs right after composition, before the pair program
/// is sliced, so the `_CHECK_` declarations stay reachable.
pub fn rewrite_checker_calls(program: &mut Program, checkers: &[String]) {
    let mut renames: Vec<(String, String)> = Vec::new();
    for proc in program.procedures() {
        let Some((kind, mem, ep)) = decode_access(proc) else {
            continue;
        };
        if proc.has_attribute(LOG_FLAG) && checkers.contains(&ep) {
            renames.push((proc.name.clone(), check_proc_name(kind, &mem, &ep)));
        }
    }
    for imp in program.implementations_mut() {
        for block in &mut imp.blocks {
            for cmd in &mut block.cmds {
                if let Cmd::Call { callee, .. } = cmd {
                    if let Some((_, to)) = renames.iter().find(|(from, _)| from == callee) {
                        *callee = to.clone();
                    }
                }
            }
        }
    }
}

/// Instrument one composed pair for race checking.
///
/// `logger` and `checkers` are the entry-point names of the two sides;
/// `composite` is the pair-checking procedure whose contract receives the
/// race-state seeds. Assumes [`rewrite_checker_calls`] already ran.
pub fn instrument_pair(
    program: &mut Program,
    variant: RaceCheckingVariant,
    logger: &str,
    checkers: &[String],
    composite: &str,
) {
    let tracker = tracker(variant);
    debug!(%variant, logger, "instrumenting pair for race checking");

    let locks: Vec<String> = program
        .constants()
        .filter(|c| c.attributes.iter().any(|a| a.name == "lock"))
        .map(|c| c.name.clone())
        .collect();
    let mems: Vec<String> = shared::memory_regions(program).keys().cloned().collect();

    tracker.declare_state(program, &mems, &locks);

    let mut log_bodies: Vec<(String, Vec<String>, Vec<Cmd>)> = Vec::new();
    let mut check_bodies: Vec<(String, Cmd)> = Vec::new();
    for proc in program.procedures() {
        let Some((kind, mem, ep)) = decode_access(proc) else {
            continue;
        };
        if proc.has_attribute(LOG_FLAG) && ep == logger {
            let (modifies, cmds) = tracker.log_cmds(kind, &mem, &ep, &locks);
            log_bodies.push((proc.name.clone(), modifies, cmds));
        } else if proc.has_attribute(CHECK_FLAG) && checkers.contains(&ep) {
            check_bodies.push((proc.name.clone(), tracker.check_assert(kind, &mem, &ep, &locks)));
        }
    }

    let mut composite_modifies: IndexSet<String> = IndexSet::new();
    for (name, modifies, cmds) in log_bodies {
        composite_modifies.extend(modifies.iter().cloned());
        if let Some(proc) = program.procedure_mut(&name) {
            proc.modifies = modifies;
        }
        program.decls.push(Decl::Implementation(body_impl(&name, cmds)));
    }
    for (name, assert) in check_bodies {
        program
            .decls
            .push(Decl::Implementation(body_impl(&name, vec![assert])));
    }

    if let Some(proc) = program.procedure_mut(composite) {
        proc.requires.extend(tracker.entry_requires(&mems, &locks));
        for var in composite_modifies {
            if !proc.modifies.contains(&var) {
                proc.modifies.push(var);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceDriver;

    const SRC: &str = "\
var $M.counter: [int]int;\n\
implementation drv_init(dev: int)\n{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_init(l);\n\
  return;\n\
}\n\
implementation drv_irq(dev: int)\n{\n\
var l: int;\n\
$entry:\n\
  l := $pa(dev, 1, 8);\n\
  call mutex_lock(l);\n\
  $M.counter[dev] := $M.counter[dev] + 1;\n\
  call mutex_unlock(l);\n\
  return;\n\
}\n";

    fn stage_a() -> Program {
        let mut program = drover_ir::parse(SRC, "t.dvl").unwrap();
        let driver =
            DeviceDriver::parse("<m>\nprobe::drv_init\nirq::drv_irq\n</>\n").unwrap();
        let ctx = AnalysisContext::new(&program, driver);
        crate::lockset::instrument(&mut program, &ctx).unwrap();
        instrument_accesses(&mut program, &ctx);
        program
    }

    #[test]
    fn access_calls_precede_the_access() {
        let program = stage_a();
        let region = program.implementation("drv_irq$instrumented").unwrap();
        let callees: Vec<_> = region
            .cmds()
            .filter_map(|c| match c {
                Cmd::Call { callee, .. } => Some(callee.clone()),
                _ => None,
            })
            .collect();
        assert!(callees.contains(&"_LOG_READ_LS_$M.counter_$drv_irq".to_string()));
        assert!(callees.contains(&"_LOG_WRITE_LS_$M.counter_$drv_irq".to_string()));
        // Both flavors are declared, neither has a body yet.
        assert!(program.procedure("_CHECK_WRITE_LS_$M.counter_$drv_irq").is_some());
        assert!(program
            .implementation("_LOG_WRITE_LS_$M.counter_$drv_irq")
            .is_none());
    }

    #[test]
    fn watchdog_pair_instrumentation_builds_protocol_state() {
        let mut program = stage_a();
        // Composite stand-in; composition proper is exercised elsewhere.
        program
            .decls
            .push(Decl::Procedure(Procedure::new("check$drv_irq$drv_irq", vec![])));
        instrument_pair(
            &mut program,
            RaceCheckingVariant::Watchdog,
            "drv_irq",
            &[],
            "check$drv_irq$drv_irq",
        );
        assert!(program.global(TRACKING_VAR).is_some());
        assert!(program.global("WRITE_HAS_OCCURRED_$M.counter").is_some());
        assert!(program.global("WATCHED_ACCESS_OFFSET_$M.counter").is_some());
        assert_eq!(
            program.global("LS_lock$1_$M.counter").unwrap().ty,
            Type::Bool
        );
        assert!(program
            .implementation("_LOG_WRITE_LS_$M.counter_$drv_irq")
            .is_some());
        let composite = program.procedure("check$drv_irq$drv_irq").unwrap();
        assert!(composite
            .requires
            .contains(&Expr::not(Expr::ident("WRITE_HAS_OCCURRED_$M.counter"))));
        assert!(composite
            .requires
            .contains(&Expr::ident("LS_lock$1_$M.counter")));
    }

    #[test]
    fn normal_variant_uses_map_state() {
        let mut program = stage_a();
        program
            .decls
            .push(Decl::Procedure(Procedure::new("check$x$y", vec![])));
        instrument_pair(
            &mut program,
            RaceCheckingVariant::Normal,
            "drv_irq",
            &[],
            "check$x$y",
        );
        assert_eq!(
            program.global("WRITE_HAS_OCCURRED_$M.counter").unwrap().ty,
            Type::MapIntBool
        );
        assert!(program.global(TRACKING_VAR).is_none());
        let composite = program.procedure("check$x$y").unwrap();
        assert!(composite
            .requires
            .contains(&Expr::NoneTrue("WRITE_HAS_OCCURRED_$M.counter".into())));
        assert!(composite
            .requires
            .contains(&Expr::AllTrue("LS_lock$1_$M.counter".into())));
    }

    #[test]
    fn checker_side_calls_are_rewritten_to_checks() {
        let mut program = stage_a();
        program
            .decls
            .push(Decl::Procedure(Procedure::new("check$a$b", vec![])));
        rewrite_checker_calls(&mut program, &["drv_irq".to_string()]);
        instrument_pair(
            &mut program,
            RaceCheckingVariant::Watchdog,
            "drv_other",
            &["drv_irq".to_string()],
            "check$a$b",
        );
        let region = program.implementation("drv_irq$instrumented").unwrap();
        let callees: Vec<_> = region
            .cmds()
            .filter_map(|c| match c {
                Cmd::Call { callee, .. } => Some(callee.clone()),
                _ => None,
            })
            .collect();
        assert!(callees.contains(&"_CHECK_WRITE_LS_$M.counter_$drv_irq".to_string()));
        assert!(!callees.contains(&"_LOG_WRITE_LS_$M.counter_$drv_irq".to_string()));
        // The check body is a single race assert.
        let check = program
            .implementation("_CHECK_WRITE_LS_$M.counter_$drv_irq")
            .unwrap();
        assert!(matches!(
            &check.blocks[0].cmds[0],
            Cmd::Assert { attributes, .. }
                if attributes.iter().any(|a| a.name == RACE_CHECKING_ATTR)
        ));
    }
}
