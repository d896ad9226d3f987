//! AST for the drover verification language.
//!
//! The shape mirrors the Boogie subset the pipeline needs: a flat list of
//! top-level declarations, implementations as labelled block lists, and a
//! small expression language with the pointer-arithmetic builtin
//! `$pa(p, i, s) == p + i * s`.

use std::fmt;

/// A DVL type. Maps are always integer-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Int,
    Bool,
    /// `[int]int`
    MapIntInt,
    /// `[int]bool`
    MapIntBool,
}

impl Type {
    pub fn is_map(self) -> bool {
        matches!(self, Type::MapIntInt | Type::MapIntBool)
    }

    /// Element type of a map type; identity for scalars.
    pub fn element(self) -> Type {
        match self {
            Type::MapIntInt => Type::Int,
            Type::MapIntBool => Type::Bool,
            other => other,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Bool => write!(f, "bool"),
            Type::MapIntInt => write!(f, "[int]int"),
            Type::MapIntBool => write!(f, "[int]bool"),
        }
    }
}

/// A `{:name}` or `{:name <lit>}` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub params: Vec<AttrParam>,
}

impl Attribute {
    pub fn flag(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    pub fn with_int(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            params: vec![AttrParam::Int(value)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrParam {
    Int(i64),
    Str(String),
}

/// Binary operators, grouped by the printer's precedence climbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Implies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// DVL expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit(i64),
    BoolLit(bool),
    Ident(String),
    /// `m[index]`
    Select {
        map: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `if c then t else e`
    Ite {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    /// Pointer arithmetic builtin: `$pa(ptr, index, scale)`.
    PointerArith {
        ptr: Box<Expr>,
        index: Box<Expr>,
        scale: Box<Expr>,
    },
    /// `$all(m)`: every entry of the boolean map is true.
    AllTrue(String),
    /// `$none(m)`: every entry of the boolean map is false.
    NoneTrue(String),
}

impl Expr {
    pub fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    pub fn not(e: Expr) -> Expr {
        Expr::Unary {
            op: UnOp::Not,
            operand: Box::new(e),
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Eq, lhs, rhs)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::And, lhs, rhs)
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Or, lhs, rhs)
    }

    pub fn implies(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Implies, lhs, rhs)
    }

    pub fn ite(cond: Expr, then: Expr, els: Expr) -> Expr {
        Expr::Ite {
            cond: Box::new(cond),
            then: Box::new(then),
            els: Box::new(els),
        }
    }

    pub fn select(map: Expr, index: Expr) -> Expr {
        Expr::Select {
            map: Box::new(map),
            index: Box::new(index),
        }
    }

    /// Disjunction of `exprs`, or `false` when empty.
    pub fn any(exprs: Vec<Expr>) -> Expr {
        let mut it = exprs.into_iter();
        match it.next() {
            None => Expr::BoolLit(false),
            Some(first) => it.fold(first, Expr::or),
        }
    }

    /// The identifier this expression names, if it is a bare identifier.
    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Expr::Ident(name) => Some(name),
            _ => None,
        }
    }

    /// Walk all identifiers mentioned in this expression.
    pub fn visit_idents(&self, f: &mut impl FnMut(&str)) {
        match self {
            Expr::IntLit(_) | Expr::BoolLit(_) => {}
            Expr::Ident(name) => f(name),
            Expr::Select { map, index } => {
                map.visit_idents(f);
                index.visit_idents(f);
            }
            Expr::Unary { operand, .. } => operand.visit_idents(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit_idents(f);
                rhs.visit_idents(f);
            }
            Expr::Ite { cond, then, els } => {
                cond.visit_idents(f);
                then.visit_idents(f);
                els.visit_idents(f);
            }
            Expr::PointerArith { ptr, index, scale } => {
                ptr.visit_idents(f);
                index.visit_idents(f);
                scale.visit_idents(f);
            }
            Expr::AllTrue(name) | Expr::NoneTrue(name) => f(name),
        }
    }

    /// Structurally rename identifiers via `rename`.
    pub fn rename_idents(&self, rename: &impl Fn(&str) -> String) -> Expr {
        match self {
            Expr::IntLit(_) | Expr::BoolLit(_) => self.clone(),
            Expr::Ident(name) => Expr::Ident(rename(name)),
            Expr::Select { map, index } => Expr::Select {
                map: Box::new(map.rename_idents(rename)),
                index: Box::new(index.rename_idents(rename)),
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.rename_idents(rename)),
            },
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(lhs.rename_idents(rename)),
                rhs: Box::new(rhs.rename_idents(rename)),
            },
            Expr::Ite { cond, then, els } => Expr::Ite {
                cond: Box::new(cond.rename_idents(rename)),
                then: Box::new(then.rename_idents(rename)),
                els: Box::new(els.rename_idents(rename)),
            },
            Expr::PointerArith { ptr, index, scale } => Expr::PointerArith {
                ptr: Box::new(ptr.rename_idents(rename)),
                index: Box::new(index.rename_idents(rename)),
                scale: Box::new(scale.rename_idents(rename)),
            },
            Expr::AllTrue(name) => Expr::AllTrue(rename(name)),
            Expr::NoneTrue(name) => Expr::NoneTrue(rename(name)),
        }
    }
}

/// Assignment target: a scalar variable or one map entry.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Var(String),
    MapEntry { map: String, index: Expr },
}

impl AssignTarget {
    /// Name of the variable ultimately written.
    pub fn base_name(&self) -> &str {
        match self {
            AssignTarget::Var(name) => name,
            AssignTarget::MapEntry { map, .. } => map,
        }
    }
}

/// Straight-line commands within a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    Assert {
        attributes: Vec<Attribute>,
        condition: Expr,
    },
    Assume {
        condition: Expr,
    },
    Havoc {
        var: String,
    },
}

impl Cmd {
    pub fn is_predicate(&self) -> bool {
        matches!(self, Cmd::Assert { .. } | Cmd::Assume { .. })
    }
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Goto(Vec<String>),
    Return,
}

/// A labelled block: commands plus a terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: String,
    pub cmds: Vec<Cmd>,
    pub transfer: Transfer,
}

impl Block {
    pub fn new(label: &str, cmds: Vec<Cmd>, transfer: Transfer) -> Self {
        Self {
            label: label.to_string(),
            cmds,
            transfer,
        }
    }

    pub fn successors(&self) -> &[String] {
        match &self.transfer {
            Transfer::Goto(labels) => labels,
            Transfer::Return => &[],
        }
    }
}

/// A typed formal parameter or local variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedVar {
    pub name: String,
    pub ty: Type,
}

impl TypedVar {
    pub fn new(name: &str, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

/// A procedure declaration: signature plus contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub params: Vec<TypedVar>,
    pub modifies: Vec<String>,
    pub requires: Vec<Expr>,
    pub ensures: Vec<Expr>,
}

impl Procedure {
    pub fn new(name: &str, params: Vec<TypedVar>) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            params,
            modifies: Vec::new(),
            requires: Vec::new(),
            ensures: Vec::new(),
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }
}

/// A procedure body: locals plus a block list. The first block is the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Implementation {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub params: Vec<TypedVar>,
    pub locals: Vec<TypedVar>,
    pub blocks: Vec<Block>,
}

impl Implementation {
    pub fn block(&self, label: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn block_mut(&mut self, label: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.label == label)
    }

    /// All commands of all blocks in block order.
    pub fn cmds(&self) -> impl Iterator<Item = &Cmd> {
        self.blocks.iter().flat_map(|b| b.cmds.iter())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }
}

/// A global variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVar {
    pub name: String,
    pub ty: Type,
    pub attributes: Vec<Attribute>,
}

/// A symbolic constant declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstDecl {
    pub name: String,
    pub ty: Type,
    pub attributes: Vec<Attribute>,
}

/// Top-level declarations.
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Global(GlobalVar),
    Const(ConstDecl),
    Axiom(Expr),
    Procedure(Procedure),
    Implementation(Implementation),
}

/// A DVL program: an ordered list of top-level declarations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub decls: Vec<Decl>,
}

impl Program {
    pub fn globals(&self) -> impl Iterator<Item = &GlobalVar> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Global(g) => Some(g),
            _ => None,
        })
    }

    pub fn constants(&self) -> impl Iterator<Item = &ConstDecl> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Const(c) => Some(c),
            _ => None,
        })
    }

    pub fn procedures(&self) -> impl Iterator<Item = &Procedure> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Procedure(p) => Some(p),
            _ => None,
        })
    }

    pub fn implementations(&self) -> impl Iterator<Item = &Implementation> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Implementation(i) => Some(i),
            _ => None,
        })
    }

    pub fn implementations_mut(&mut self) -> impl Iterator<Item = &mut Implementation> {
        self.decls.iter_mut().filter_map(|d| match d {
            Decl::Implementation(i) => Some(i),
            _ => None,
        })
    }

    pub fn implementation(&self, name: &str) -> Option<&Implementation> {
        self.implementations().find(|i| i.name == name)
    }

    pub fn implementation_mut(&mut self, name: &str) -> Option<&mut Implementation> {
        self.implementations_mut().find(|i| i.name == name)
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures().find(|p| p.name == name)
    }

    pub fn procedure_mut(&mut self, name: &str) -> Option<&mut Procedure> {
        self.decls.iter_mut().find_map(|d| match d {
            Decl::Procedure(p) if p.name == name => Some(p),
            _ => None,
        })
    }

    pub fn global(&self, name: &str) -> Option<&GlobalVar> {
        self.globals().find(|g| g.name == name)
    }

    pub fn add_global(&mut self, name: &str, ty: Type) {
        self.decls.push(Decl::Global(GlobalVar {
            name: name.to_string(),
            ty,
            attributes: Vec::new(),
        }));
    }

    /// Every integer literal appearing anywhere in the program. The backend
    /// uses this as the finite address domain for unconstrained integers.
    pub fn int_literal_pool(&self) -> Vec<i64> {
        let mut pool = Vec::new();
        fn walk(expr: &Expr, pool: &mut Vec<i64>) {
            match expr {
                Expr::IntLit(n) => {
                    if !pool.contains(n) {
                        pool.push(*n);
                    }
                }
                Expr::BoolLit(_) | Expr::Ident(_) | Expr::AllTrue(_) | Expr::NoneTrue(_) => {}
                Expr::Select { map, index } => {
                    walk(map, pool);
                    walk(index, pool);
                }
                Expr::Unary { operand, .. } => walk(operand, pool),
                Expr::Binary { lhs, rhs, .. } => {
                    walk(lhs, pool);
                    walk(rhs, pool);
                }
                Expr::Ite { cond, then, els } => {
                    walk(cond, pool);
                    walk(then, pool);
                    walk(els, pool);
                }
                Expr::PointerArith { ptr, index, scale } => {
                    walk(ptr, pool);
                    walk(index, pool);
                    walk(scale, pool);
                }
            }
        }
        for decl in &self.decls {
            match decl {
                Decl::Axiom(e) => walk(e, &mut pool),
                Decl::Procedure(p) => {
                    for e in p.requires.iter().chain(p.ensures.iter()) {
                        walk(e, &mut pool);
                    }
                }
                Decl::Implementation(imp) => {
                    for cmd in imp.cmds() {
                        match cmd {
                            Cmd::Assign { target, value } => {
                                if let AssignTarget::MapEntry { index, .. } = target {
                                    walk(index, &mut pool);
                                }
                                walk(value, &mut pool);
                            }
                            Cmd::Call { args, .. } => {
                                for a in args {
                                    walk(a, &mut pool);
                                }
                            }
                            Cmd::Assert { condition, .. } | Cmd::Assume { condition } => {
                                walk(condition, &mut pool)
                            }
                            Cmd::Havoc { .. } => {}
                        }
                    }
                }
                Decl::Global(_) | Decl::Const(_) => {}
            }
        }
        pool.sort_unstable();
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_of_empty_is_false() {
        assert_eq!(Expr::any(vec![]), Expr::BoolLit(false));
    }

    #[test]
    fn any_of_folds_left() {
        let e = Expr::any(vec![Expr::ident("a"), Expr::ident("b"), Expr::ident("c")]);
        let ab = Expr::or(Expr::ident("a"), Expr::ident("b"));
        assert_eq!(e, Expr::or(ab, Expr::ident("c")));
    }

    #[test]
    fn literal_pool_is_sorted_and_deduplicated() {
        let mut program = Program::default();
        program.decls.push(Decl::Implementation(Implementation {
            name: "f".into(),
            attributes: vec![],
            params: vec![],
            locals: vec![],
            blocks: vec![Block::new(
                "$entry",
                vec![
                    Cmd::Assign {
                        target: AssignTarget::Var("x".into()),
                        value: Expr::binary(BinOp::Add, Expr::IntLit(4), Expr::IntLit(4)),
                    },
                    Cmd::Assume {
                        condition: Expr::eq(Expr::ident("x"), Expr::IntLit(1)),
                    },
                ],
                Transfer::Return,
            )],
        }));
        assert_eq!(program.int_literal_pool(), vec![1, 4]);
    }

    #[test]
    fn rename_idents_reaches_map_selects() {
        let e = Expr::select(Expr::ident("m"), Expr::ident("p"));
        let renamed = e.rename_idents(&|n| format!("{n}$1"));
        assert_eq!(renamed, Expr::select(Expr::ident("m$1"), Expr::ident("p$1")));
    }
}
