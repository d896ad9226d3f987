//! Lock abstraction.
//!
//! Each `mutex_init` call site inside the init entry point creates one
//! canonical lock. A `mutex_lock`/`mutex_unlock` actual in any entry point is
//! identified with a canonical lock by resolving both pointers to their
//! `base + offset` form: the offsets must agree, and the bases must be the
//! same global, the same absolute address, or formal parameters at the same
//! position of their respective implementations. Entry points all receive the
//! driver context through the same parameter slots, so positional matching is
//! what makes a lock identity hold across entry points.

use crate::alias::{PointerResolver, ResolvedAddress};
use drover_ir::ast::{
    Attribute, Cmd, ConstDecl, Decl, Expr, Implementation, Program, Type,
};
use tracing::warn;

pub const MUTEX_INIT: &str = "mutex_init";
pub const MUTEX_LOCK: &str = "mutex_lock";
pub const MUTEX_UNLOCK: &str = "mutex_unlock";

/// Id reported for an acquire/release whose pointer could not be identified
/// with any canonical lock. It matches no lock, so the acquire contributes no
/// protection.
pub const UNIDENTIFIED_LOCK: i64 = -1;

/// Where a canonical lock lives, in resolved form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOrigin {
    /// Offset from a formal parameter, identified by parameter position.
    Param { index: usize, offset: i64 },
    /// Offset from a global or constant.
    Global { base: String, offset: i64 },
    /// A literal address.
    Absolute { offset: i64 },
}

/// One canonical lock of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub id: i64,
    /// Symbolic constant name, `lock$<id>`.
    pub name: String,
    pub origin: LockOrigin,
}

impl Lock {
    fn new(id: i64, origin: LockOrigin) -> Self {
        Self {
            id,
            name: format!("lock${id}"),
            origin,
        }
    }

    pub fn matches(&self, origin: &LockOrigin) -> bool {
        self.origin == *origin
    }
}

fn classify(imp: &Implementation, resolved: &ResolvedAddress) -> LockOrigin {
    match &resolved.base {
        None => LockOrigin::Absolute {
            offset: resolved.offset,
        },
        Some(base) => match imp.params.iter().position(|p| &p.name == base) {
            Some(index) => LockOrigin::Param {
                index,
                offset: resolved.offset,
            },
            None => LockOrigin::Global {
                base: base.clone(),
                offset: resolved.offset,
            },
        },
    }
}

/// Discover the canonical locks from the init entry point's `mutex_init`
/// sites. Ids are assigned in call order starting from 1; duplicate init
/// sites on the same address collapse to one lock.
pub fn abstract_locks(program: &Program, init: &str) -> Vec<Lock> {
    let mut locks: Vec<Lock> = Vec::new();
    let Some(imp) = program.implementation(init) else {
        return locks;
    };
    let resolver = PointerResolver::new(imp);
    for cmd in imp.cmds() {
        let Cmd::Call { callee, args } = cmd else {
            continue;
        };
        if callee != MUTEX_INIT {
            continue;
        }
        let Some(arg) = args.first() else {
            warn!(init, "mutex_init call without arguments; skipping");
            continue;
        };
        let Some(resolved) = resolver.resolve(arg) else {
            warn!(init, "unresolvable mutex_init pointer; lock left abstract");
            continue;
        };
        let origin = classify(imp, &resolved);
        if locks.iter().any(|l| l.matches(&origin)) {
            continue;
        }
        let id = locks.len() as i64 + 1;
        locks.push(Lock::new(id, origin));
    }
    locks
}

/// Identify the canonical lock behind an acquire/release actual inside `imp`,
/// or [`UNIDENTIFIED_LOCK`] when resolution fails or no lock matches.
pub fn identify(locks: &[Lock], imp: &Implementation, arg: &Expr) -> i64 {
    let resolver = PointerResolver::new(imp);
    let Some(resolved) = resolver.resolve(arg) else {
        warn!(imp = %imp.name, "unresolvable lock pointer treated as unidentified");
        return UNIDENTIFIED_LOCK;
    };
    let origin = classify(imp, &resolved);
    locks
        .iter()
        .find(|l| l.matches(&origin))
        .map(|l| l.id)
        .unwrap_or(UNIDENTIFIED_LOCK)
}

/// Declare one `{:lock}` constant per canonical lock, each pinned to its id
/// by an axiom. Declarations land ahead of existing ones so the lockset
/// globals that follow can reference them.
pub fn declare_lock_constants(program: &mut Program, locks: &[Lock]) {
    let mut decls = Vec::with_capacity(locks.len() * 2);
    for lock in locks {
        decls.push(Decl::Const(ConstDecl {
            name: lock.name.clone(),
            ty: Type::Int,
            attributes: vec![Attribute::flag("lock")],
        }));
        decls.push(Decl::Axiom(Expr::eq(
            Expr::ident(&lock.name),
            Expr::IntLit(lock.id),
        )));
    }
    decls.extend(std::mem::take(&mut program.decls));
    program.decls = decls;
}
