//! Bounded explicit-state evaluation of composed checking programs.
//!
//! The evaluator enumerates the unconstrained scalars of the program (entry
//! formals, never-assigned globals, unpinned constants) over a finite
//! integer domain built from the program's own literals plus one fresh value
//! per symbol, seeds the constrained globals from the entry procedure's
//! `requires` clauses, and then walks every path through the block graph,
//! inlining calls up to a bound. `{:race_checking}` assert violations are
//! collected as races; blown budgets degrade the verdict instead of
//! aborting.

use crate::{CheckError, CheckLimits, Checker, RaceError, VerificationOutcome};
use drover_ir::ast::{
    AssignTarget, AttrParam, BinOp, Cmd, Decl, Expr, Implementation, Program, Transfer, Type,
    TypedVar, UnOp,
};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
struct MapVal<T: Copy + PartialEq> {
    default: T,
    entries: BTreeMap<i64, T>,
}

impl<T: Copy + PartialEq> MapVal<T> {
    fn uniform(default: T) -> Self {
        Self {
            default,
            entries: BTreeMap::new(),
        }
    }

    fn get(&self, index: i64) -> T {
        self.entries.get(&index).copied().unwrap_or(self.default)
    }

    fn set(&mut self, index: i64, value: T) {
        self.entries.insert(index, value);
    }

    fn all(&self, expected: T) -> bool {
        self.default == expected && self.entries.values().all(|v| *v == expected)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Bool(bool),
    MapInt(MapVal<i64>),
    MapBool(MapVal<bool>),
}

impl Value {
    fn default_of(ty: Type) -> Value {
        match ty {
            Type::Int => Value::Int(0),
            Type::Bool => Value::Bool(false),
            Type::MapIntInt => Value::MapInt(MapVal::uniform(0)),
            Type::MapIntBool => Value::MapBool(MapVal::uniform(false)),
        }
    }

    fn as_int(&self, context: &str) -> Result<i64, CheckError> {
        match self {
            Value::Int(n) => Ok(*n),
            _ => Err(CheckError::TypeMismatch {
                context: context.to_string(),
            }),
        }
    }

    fn as_bool(&self, context: &str) -> Result<bool, CheckError> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(CheckError::TypeMismatch {
                context: context.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct State {
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
}

impl State {
    fn get(&self, name: &str) -> Result<&Value, CheckError> {
        if let Some(frame) = self.frames.last() {
            if let Some(v) = frame.get(name) {
                return Ok(v);
            }
        }
        self.globals.get(name).ok_or(CheckError::UnknownIdent {
            name: name.to_string(),
        })
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Value, CheckError> {
        let in_frame = self.frames.last().is_some_and(|f| f.contains_key(name));
        if in_frame {
            return self
                .frames
                .last_mut()
                .and_then(|f| f.get_mut(name))
                .ok_or_else(|| CheckError::UnknownIdent {
                    name: name.to_string(),
                });
        }
        self.globals.get_mut(name).ok_or_else(|| CheckError::UnknownIdent {
            name: name.to_string(),
        })
    }

    fn set(&mut self, name: &str, value: Value) -> Result<(), CheckError> {
        *self.get_mut(name)? = value;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Budget {
    Time,
    States,
    Steps,
}

/// One unconstrained scalar to enumerate.
#[derive(Debug, Clone)]
struct NondetSymbol {
    name: String,
    ty: Type,
    in_frame: bool,
}

/// The shipped verification backend: a bounded explicit-state evaluator.
#[derive(Debug, Default)]
pub struct ExplicitChecker;

struct Evaluator<'a> {
    program: &'a Program,
    limits: &'a CheckLimits,
    deadline: Option<Instant>,
    steps: usize,
    states: usize,
    tripped: Option<Budget>,
    inline_cutoff: bool,
    violations: Vec<RaceError>,
}

fn const_value(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::IntLit(n) => Some(*n),
        Expr::Unary {
            op: UnOp::Neg,
            operand,
        } => const_value(operand).map(|n| -n),
        _ => None,
    }
}

fn race_error_of(attributes: &[drover_ir::ast::Attribute]) -> Option<RaceError> {
    attributes
        .iter()
        .any(|a| a.name == "race_checking")
        .then(|| {
            let (access, region) = attributes
                .iter()
                .find(|a| a.name == "access")
                .and_then(|a| match a.params.as_slice() {
                    [AttrParam::Str(kind), AttrParam::Str(mem), ..] => {
                        Some((kind.clone(), mem.clone()))
                    }
                    _ => None,
                })
                .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
            RaceError { access, region }
        })
}

impl<'a> Evaluator<'a> {
    fn new(program: &'a Program, limits: &'a CheckLimits) -> Self {
        Self {
            program,
            limits,
            deadline: limits.timeout.map(|t| Instant::now() + t),
            steps: 0,
            states: 0,
            tripped: None,
            inline_cutoff: false,
            violations: Vec::new(),
        }
    }

    fn step(&mut self) {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            self.tripped.get_or_insert(Budget::Steps);
        }
        if self.steps % 1024 == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() > deadline {
                    self.tripped.get_or_insert(Budget::Time);
                }
            }
        }
    }

    fn fork(&mut self) {
        self.states += 1;
        if self.states > self.limits.max_states {
            self.tripped.get_or_insert(Budget::States);
        }
    }

    fn report(&mut self, race: RaceError) {
        if !self.violations.contains(&race) {
            self.violations.push(race);
        }
    }

    fn eval(&self, state: &State, expr: &Expr) -> Result<Value, CheckError> {
        match expr {
            Expr::IntLit(n) => Ok(Value::Int(*n)),
            Expr::BoolLit(b) => Ok(Value::Bool(*b)),
            Expr::Ident(name) => state.get(name).cloned(),
            Expr::Select { map, index } => {
                let index = self.eval(state, index)?.as_int("map index")?;
                match self.eval(state, map)? {
                    Value::MapInt(m) => Ok(Value::Int(m.get(index))),
                    Value::MapBool(m) => Ok(Value::Bool(m.get(index))),
                    _ => Err(CheckError::TypeMismatch {
                        context: "map select".to_string(),
                    }),
                }
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(state, operand)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!v.as_bool("negation")?)),
                    UnOp::Neg => Ok(Value::Int(-v.as_int("arithmetic negation")?)),
                }
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(state, *op, lhs, rhs),
            Expr::Ite { cond, then, els } => {
                if self.eval(state, cond)?.as_bool("conditional")? {
                    self.eval(state, then)
                } else {
                    self.eval(state, els)
                }
            }
            Expr::PointerArith { ptr, index, scale } => {
                let p = self.eval(state, ptr)?.as_int("pointer base")?;
                let i = self.eval(state, index)?.as_int("pointer index")?;
                let s = self.eval(state, scale)?.as_int("pointer scale")?;
                Ok(Value::Int(p.wrapping_add(i.wrapping_mul(s))))
            }
            Expr::AllTrue(name) => match state.get(name)? {
                Value::MapBool(m) => Ok(Value::Bool(m.all(true))),
                _ => Err(CheckError::TypeMismatch {
                    context: format!("$all({name})"),
                }),
            },
            Expr::NoneTrue(name) => match state.get(name)? {
                Value::MapBool(m) => Ok(Value::Bool(m.all(false))),
                _ => Err(CheckError::TypeMismatch {
                    context: format!("$none({name})"),
                }),
            },
        }
    }

    fn eval_binary(
        &self,
        state: &State,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Value, CheckError> {
        // Short-circuiting forms first.
        match op {
            BinOp::And => {
                return Ok(Value::Bool(
                    self.eval(state, lhs)?.as_bool("conjunction")?
                        && self.eval(state, rhs)?.as_bool("conjunction")?,
                ))
            }
            BinOp::Or => {
                return Ok(Value::Bool(
                    self.eval(state, lhs)?.as_bool("disjunction")?
                        || self.eval(state, rhs)?.as_bool("disjunction")?,
                ))
            }
            BinOp::Implies => {
                return Ok(Value::Bool(
                    !self.eval(state, lhs)?.as_bool("implication")?
                        || self.eval(state, rhs)?.as_bool("implication")?,
                ))
            }
            _ => {}
        }
        let l = self.eval(state, lhs)?;
        let r = self.eval(state, rhs)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(l == r)),
            BinOp::Neq => Ok(Value::Bool(l != r)),
            _ => {
                let l = l.as_int("arithmetic operand")?;
                let r = r.as_int("arithmetic operand")?;
                match op {
                    BinOp::Add => Ok(Value::Int(l.wrapping_add(r))),
                    BinOp::Sub => Ok(Value::Int(l.wrapping_sub(r))),
                    BinOp::Mul => Ok(Value::Int(l.wrapping_mul(r))),
                    BinOp::Div => {
                        if r == 0 {
                            Err(CheckError::TypeMismatch {
                                context: "division by zero".to_string(),
                            })
                        } else {
                            Ok(Value::Int(l / r))
                        }
                    }
                    BinOp::Lt => Ok(Value::Bool(l < r)),
                    BinOp::Le => Ok(Value::Bool(l <= r)),
                    BinOp::Gt => Ok(Value::Bool(l > r)),
                    BinOp::Ge => Ok(Value::Bool(l >= r)),
                    _ => unreachable!("logical operators handled above"),
                }
            }
        }
    }

    fn havoc_states(
        &mut self,
        state: State,
        name: &str,
        ty: Type,
        domain: &[i64],
    ) -> Result<Vec<State>, CheckError> {
        match ty {
            Type::Bool => {
                let mut t = state.clone();
                t.set(name, Value::Bool(true))?;
                self.fork();
                let mut f = state;
                f.set(name, Value::Bool(false))?;
                Ok(vec![t, f])
            }
            Type::Int => {
                let mut out = Vec::with_capacity(domain.len());
                for v in domain {
                    self.fork();
                    let mut s = state.clone();
                    s.set(name, Value::Int(*v))?;
                    out.push(s);
                }
                Ok(out)
            }
            Type::MapIntInt => {
                let mut s = state;
                s.set(name, Value::MapInt(MapVal::uniform(0)))?;
                Ok(vec![s])
            }
            Type::MapIntBool => {
                let mut s = state;
                s.set(name, Value::MapBool(MapVal::uniform(false)))?;
                Ok(vec![s])
            }
        }
    }

    fn type_of(&self, state: &State, name: &str) -> Result<Type, CheckError> {
        match state.get(name)? {
            Value::Int(_) => Ok(Type::Int),
            Value::Bool(_) => Ok(Type::Bool),
            Value::MapInt(_) => Ok(Type::MapIntInt),
            Value::MapBool(_) => Ok(Type::MapIntBool),
        }
    }

    fn exec_cmd(
        &mut self,
        imp: &Implementation,
        cmd: &Cmd,
        states: Vec<State>,
        stack: &mut Vec<String>,
        domain: &[i64],
    ) -> Result<Vec<State>, CheckError> {
        let mut out = Vec::with_capacity(states.len());
        for mut state in states {
            if self.tripped.is_some() {
                break;
            }
            self.step();
            match cmd {
                Cmd::Assign { target, value } => {
                    let value = self.eval(&state, value)?;
                    match target {
                        AssignTarget::Var(name) => state.set(name, value)?,
                        AssignTarget::MapEntry { map, index } => {
                            let index = self.eval(&state, index)?.as_int("map index")?;
                            match (state.get_mut(map)?, value) {
                                (Value::MapInt(m), Value::Int(v)) => m.set(index, v),
                                (Value::MapBool(m), Value::Bool(v)) => m.set(index, v),
                                _ => {
                                    return Err(CheckError::TypeMismatch {
                                        context: format!("assignment to {map}"),
                                    })
                                }
                            }
                        }
                    }
                    out.push(state);
                }
                Cmd::Assume { condition } => {
                    if self.eval(&state, condition)?.as_bool("assume")? {
                        out.push(state);
                    }
                }
                Cmd::Assert {
                    attributes,
                    condition,
                } => {
                    if !self.eval(&state, condition)?.as_bool("assert")? {
                        let race = race_error_of(attributes).unwrap_or_else(|| RaceError {
                            access: "assert".to_string(),
                            region: imp.name.clone(),
                        });
                        self.report(race);
                    }
                    out.push(state);
                }
                Cmd::Havoc { var } => {
                    let ty = self.type_of(&state, var)?;
                    out.extend(self.havoc_states(state, var, ty, domain)?);
                }
                Cmd::Call { callee, args } => {
                    out.extend(self.exec_call(callee, args, state, stack, domain)?);
                }
            }
        }
        Ok(out)
    }

    fn exec_call(
        &mut self,
        callee: &str,
        args: &[Expr],
        mut state: State,
        stack: &mut Vec<String>,
        domain: &[i64],
    ) -> Result<Vec<State>, CheckError> {
        let Some(imp) = self.program.implementation(callee) else {
            // Bodyless procedure: havoc whatever it declares to modify.
            let mut states = vec![state];
            if let Some(proc) = self.program.procedure(callee) {
                for var in proc.modifies.clone() {
                    let mut next = Vec::new();
                    for s in states {
                        let ty = self.type_of(&s, &var)?;
                        next.extend(self.havoc_states(s, &var, ty, domain)?);
                    }
                    states = next;
                }
            }
            return Ok(states);
        };
        let depth = stack.iter().filter(|n| n.as_str() == callee).count();
        if depth >= self.limits.inline_bound {
            self.inline_cutoff = true;
            debug!(callee, "inline bound reached; call skipped");
            return Ok(vec![state]);
        }

        let mut frame = HashMap::new();
        for (param, arg) in imp.params.iter().zip(args) {
            frame.insert(param.name.clone(), self.eval(&state, arg)?);
        }
        for local in &imp.locals {
            frame.insert(local.name.clone(), Value::default_of(local.ty));
        }
        state.frames.push(frame);
        stack.push(callee.to_string());
        let mut returned = self.run_impl(imp, state, stack, domain)?;
        stack.pop();
        for state in &mut returned {
            state.frames.pop();
        }
        Ok(returned)
    }

    fn run_impl(
        &mut self,
        imp: &Implementation,
        state: State,
        stack: &mut Vec<String>,
        domain: &[i64],
    ) -> Result<Vec<State>, CheckError> {
        let Some(entry) = imp.blocks.first() else {
            return Ok(vec![state]);
        };
        let mut returned = Vec::new();
        let mut work: Vec<(String, State)> = vec![(entry.label.clone(), state)];
        while let Some((label, state)) = work.pop() {
            if self.tripped.is_some() {
                break;
            }
            let Some(block) = imp.block(&label) else {
                return Err(CheckError::UnknownIdent { name: label });
            };
            let mut states = vec![state];
            for cmd in &block.cmds {
                states = self.exec_cmd(imp, cmd, states, stack, domain)?;
                if states.is_empty() {
                    break;
                }
            }
            match &block.transfer {
                Transfer::Return => returned.extend(states),
                Transfer::Goto(targets) => {
                    for state in states {
                        for (i, target) in targets.iter().enumerate() {
                            if i + 1 == targets.len() {
                                work.push((target.clone(), state));
                                break;
                            }
                            self.fork();
                            work.push((target.clone(), state.clone()));
                        }
                    }
                }
            }
        }
        Ok(returned)
    }
}

struct Setup {
    base: State,
    nondet: Vec<NondetSymbol>,
    leftover_requires: Vec<Expr>,
    domain: Vec<i64>,
}

fn assigned_names(program: &Program) -> HashMap<String, ()> {
    let mut assigned = HashMap::new();
    for imp in program.implementations() {
        for cmd in imp.cmds() {
            match cmd {
                Cmd::Assign { target, .. } => {
                    assigned.insert(target.base_name().to_string(), ());
                }
                Cmd::Havoc { var } => {
                    assigned.insert(var.clone(), ());
                }
                _ => {}
            }
        }
    }
    assigned
}

fn pinned_constants(program: &Program) -> HashMap<String, i64> {
    let mut pinned = HashMap::new();
    for decl in &program.decls {
        let Decl::Axiom(Expr::Binary {
            op: BinOp::Eq,
            lhs,
            rhs,
        }) = decl
        else {
            continue;
        };
        match (lhs.as_ident(), const_value(rhs), const_value(lhs), rhs.as_ident()) {
            (Some(name), Some(value), _, _) | (_, _, Some(value), Some(name)) => {
                pinned.insert(name.to_string(), value);
            }
            _ => {}
        }
    }
    pinned
}

fn build_setup(program: &Program, entry: &Implementation) -> Result<Setup, CheckError> {
    let mut domain = program.int_literal_pool();
    if domain.is_empty() {
        domain.push(0);
    }
    let fresh_base = domain.iter().max().copied().unwrap_or(0) + 101;
    let mut next_fresh = fresh_base;

    let mut globals: HashMap<String, Value> = HashMap::new();
    let pinned = pinned_constants(program);
    for constant in program.constants() {
        let value = match pinned.get(&constant.name) {
            Some(v) => Value::Int(*v),
            None => {
                // Rigid but unconstrained: a distinct synthetic value.
                let v = next_fresh;
                next_fresh += 1;
                domain.push(v);
                Value::Int(v)
            }
        };
        globals.insert(constant.name.clone(), value);
    }

    // Directed seeding from the entry contract.
    let mut determined: HashMap<String, Value> = HashMap::new();
    let mut leftover_requires = Vec::new();
    let requires = program
        .procedure(&entry.name)
        .map(|p| p.requires.clone())
        .unwrap_or_default();
    for req in requires {
        match &req {
            Expr::Ident(name) => {
                determined.insert(name.clone(), Value::Bool(true));
            }
            Expr::Unary {
                op: UnOp::Not,
                operand,
            } if operand.as_ident().is_some() => {
                let name = operand.as_ident().map(str::to_string).unwrap_or_default();
                determined.insert(name, Value::Bool(false));
            }
            Expr::AllTrue(name) => {
                determined.insert(name.clone(), Value::MapBool(MapVal::uniform(true)));
            }
            Expr::NoneTrue(name) => {
                determined.insert(name.clone(), Value::MapBool(MapVal::uniform(false)));
            }
            Expr::Binary {
                op: BinOp::Eq,
                lhs,
                rhs,
            } if lhs.as_ident().is_some() && const_value(rhs).is_some() => {
                let name = lhs.as_ident().map(str::to_string).unwrap_or_default();
                let value = const_value(rhs).unwrap_or_default();
                determined.insert(name, Value::Int(value));
            }
            _ => leftover_requires.push(req),
        }
    }

    let assigned = assigned_names(program);
    let mut nondet = Vec::new();
    for global in program.globals() {
        if let Some(value) = determined.remove(&global.name) {
            globals.insert(global.name.clone(), value);
            continue;
        }
        if global.ty.is_map() || assigned.contains_key(&global.name) {
            globals.insert(global.name.clone(), Value::default_of(global.ty));
            continue;
        }
        // Never written, never constrained: enumerate.
        globals.insert(global.name.clone(), Value::default_of(global.ty));
        if global.ty == Type::Int {
            domain.push(next_fresh);
            next_fresh += 1;
        }
        nondet.push(NondetSymbol {
            name: global.name.clone(),
            ty: global.ty,
            in_frame: false,
        });
    }

    let mut frame = HashMap::new();
    for TypedVar { name, ty } in &entry.params {
        frame.insert(name.clone(), Value::default_of(*ty));
        if *ty == Type::Int {
            domain.push(next_fresh);
            next_fresh += 1;
        }
        nondet.push(NondetSymbol {
            name: name.clone(),
            ty: *ty,
            in_frame: true,
        });
    }
    for local in &entry.locals {
        frame.insert(local.name.clone(), Value::default_of(local.ty));
    }

    domain.sort_unstable();
    domain.dedup();

    Ok(Setup {
        base: State {
            globals,
            frames: vec![frame],
        },
        nondet,
        leftover_requires,
        domain,
    })
}

impl Checker for ExplicitChecker {
    fn check(
        &self,
        program: &Program,
        entry: &str,
        limits: &CheckLimits,
    ) -> Result<VerificationOutcome, CheckError> {
        let Some(entry_imp) = program.implementation(entry) else {
            return Err(CheckError::MissingEntry {
                name: entry.to_string(),
            });
        };
        let setup = build_setup(program, entry_imp)?;
        let mut evaluator = Evaluator::new(program, limits);

        // Enumerate the unconstrained scalars, depth first.
        let mut pending: Vec<State> = vec![setup.base];
        for symbol in &setup.nondet {
            let mut next = Vec::new();
            for state in pending {
                if evaluator.tripped.is_some() {
                    break;
                }
                let values: Vec<Value> = match symbol.ty {
                    Type::Bool => vec![Value::Bool(false), Value::Bool(true)],
                    Type::Int => setup.domain.iter().map(|v| Value::Int(*v)).collect(),
                    _ => vec![Value::default_of(symbol.ty)],
                };
                for value in values {
                    let mut s = state.clone();
                    evaluator.fork();
                    if symbol.in_frame {
                        if let Some(frame) = s.frames.last_mut() {
                            frame.insert(symbol.name.clone(), value);
                        }
                    } else {
                        s.globals.insert(symbol.name.clone(), value);
                    }
                    next.push(s);
                }
            }
            pending = next;
        }
        debug!(initial_states = pending.len(), "enumeration finished");

        let mut stack = Vec::new();
        'states: for state in pending {
            if evaluator.tripped.is_some() {
                break;
            }
            for req in &setup.leftover_requires {
                if !evaluator.eval(&state, req)?.as_bool("requires")? {
                    continue 'states;
                }
            }
            evaluator.run_impl(entry_imp, state, &mut stack, &setup.domain)?;
        }

        if !evaluator.violations.is_empty() {
            return Ok(VerificationOutcome::Errors(evaluator.violations));
        }
        Ok(match evaluator.tripped {
            Some(Budget::Time) => VerificationOutcome::TimedOut,
            Some(Budget::States) => VerificationOutcome::OutOfMemory,
            Some(Budget::Steps) => VerificationOutcome::Inconclusive,
            None if evaluator.inline_cutoff => VerificationOutcome::Inconclusive,
            None => VerificationOutcome::Verified,
        })
    }
}
