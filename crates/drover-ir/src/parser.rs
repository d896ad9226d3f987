#![allow(clippy::result_large_err)]

//! pest-based parser for DVL source text.
//!
//! The grammar lives in `grammar.pest`. Pest handles tokenisation and the
//! expression precedence layering; the walkers here turn the rule pairs into
//! the [`crate::ast`] types and add the checks the grammar cannot express:
//! type-name validation and duplicate-declaration detection. Stage artifacts
//! are persisted as text between pipeline stages, so the grammar accepts
//! everything [`crate::printer`] emits (plus arbitrary whitespace and `//`
//! comments).

use pest::Parser as _;
use pest_derive::Parser;

use std::collections::HashSet;

use crate::ast::{
    AssignTarget, AttrParam, Attribute, BinOp, Block, Cmd, ConstDecl, Decl, Expr, GlobalVar,
    Implementation, Procedure, Program, Transfer, Type, TypedVar, UnOp,
};
use crate::errors::ParseError;

#[derive(Parser)]
#[grammar = "grammar.pest"]
struct DvlParser;

type Pair<'a> = pest::iterators::Pair<'a, Rule>;

/// Source text plus the filename carried into diagnostics.
struct Ctx<'a> {
    source: &'a str,
    filename: &'a str,
}

impl Ctx<'_> {
    fn named_source(&self) -> miette::NamedSource<String> {
        miette::NamedSource::new(self.filename.to_string(), self.source.to_string())
    }
}

fn span_of(pair: &Pair<'_>) -> miette::SourceSpan {
    let span = pair.as_span();
    (span.start(), span.end() - span.start()).into()
}

/// Parse a DVL program. `filename` is used in diagnostics only.
pub fn parse(source: &str, filename: &str) -> Result<Program, ParseError> {
    let ctx = Ctx { source, filename };
    let mut pairs = DvlParser::parse(Rule::program, source).map_err(|e| {
        let (start, end) = match e.location {
            pest::error::InputLocation::Pos(pos) => (pos, pos + 1),
            pest::error::InputLocation::Span((start, end)) => (start, end),
        };
        ParseError::Syntax {
            message: e.variant.message().into_owned(),
            span: (start, end.saturating_sub(start)).into(),
            src: ctx.named_source(),
        }
    })?;

    let mut program = Program::default();
    let mut values = HashSet::new();
    let mut procedures = HashSet::new();
    let mut implementations = HashSet::new();
    for decl in pairs.next().unwrap().into_inner() {
        let span = span_of(&decl);
        match decl.as_rule() {
            Rule::var_decl => {
                let (name, ty, attributes) = parse_typed_decl(&ctx, decl)?;
                check_unique(&ctx, &mut values, &name, span)?;
                program.decls.push(Decl::Global(GlobalVar {
                    name,
                    ty,
                    attributes,
                }));
            }
            Rule::const_decl => {
                let (name, ty, attributes) = parse_typed_decl(&ctx, decl)?;
                check_unique(&ctx, &mut values, &name, span)?;
                program.decls.push(Decl::Const(ConstDecl {
                    name,
                    ty,
                    attributes,
                }));
            }
            Rule::axiom_decl => {
                let expr = parse_expr(&ctx, decl.into_inner().next().unwrap())?;
                program.decls.push(Decl::Axiom(expr));
            }
            Rule::procedure_decl => {
                let procedure = parse_procedure(&ctx, decl)?;
                check_unique(&ctx, &mut procedures, &procedure.name, span)?;
                program.decls.push(Decl::Procedure(procedure));
            }
            Rule::implementation_decl => {
                let imp = parse_implementation(&ctx, decl)?;
                check_unique(&ctx, &mut implementations, &imp.name, span)?;
                program.decls.push(Decl::Implementation(imp));
            }
            Rule::EOI => {}
            rule => unreachable!("top-level rule {rule:?}"),
        }
    }
    Ok(program)
}

fn check_unique(
    ctx: &Ctx<'_>,
    seen: &mut HashSet<String>,
    name: &str,
    span: miette::SourceSpan,
) -> Result<(), ParseError> {
    if !seen.insert(name.to_string()) {
        return Err(ParseError::Duplicate {
            name: name.to_string(),
            span,
            src: ctx.named_source(),
        });
    }
    Ok(())
}

/// Shared shape of `var` and `const` declarations.
fn parse_typed_decl(
    ctx: &Ctx<'_>,
    pair: Pair<'_>,
) -> Result<(String, Type, Vec<Attribute>), ParseError> {
    let mut attributes = Vec::new();
    let mut name = String::new();
    let mut ty = Type::Int;
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::attribute => attributes.push(parse_attribute(item)),
            Rule::ident => name = item.as_str().to_string(),
            Rule::ty => ty = parse_type(ctx, item)?,
            rule => unreachable!("declaration rule {rule:?}"),
        }
    }
    Ok((name, ty, attributes))
}

fn parse_type(ctx: &Ctx<'_>, pair: Pair<'_>) -> Result<Type, ParseError> {
    match pair.as_str() {
        "int" => Ok(Type::Int),
        "bool" => Ok(Type::Bool),
        "[int]int" => Ok(Type::MapIntInt),
        "[int]bool" => Ok(Type::MapIntBool),
        found => Err(ParseError::UnknownType {
            found: found.to_string(),
            span: span_of(&pair),
            src: ctx.named_source(),
        }),
    }
}

fn parse_attribute(pair: Pair<'_>) -> Attribute {
    let mut inner = pair.into_inner();
    let name = inner.next().unwrap().as_str().to_string();
    let params = inner
        .map(|param| {
            let lit = param.into_inner().next().unwrap();
            match lit.as_rule() {
                Rule::str_lit => {
                    let quoted = lit.as_str();
                    AttrParam::Str(quoted[1..quoted.len() - 1].to_string())
                }
                Rule::int_lit => AttrParam::Int(lit.as_str().parse().unwrap_or(0)),
                rule => unreachable!("attribute parameter rule {rule:?}"),
            }
        })
        .collect();
    Attribute { name, params }
}

fn parse_params(ctx: &Ctx<'_>, pair: Pair<'_>) -> Result<Vec<TypedVar>, ParseError> {
    pair.into_inner()
        .map(|param| {
            let mut inner = param.into_inner();
            let name = inner.next().unwrap().as_str().to_string();
            let ty = parse_type(ctx, inner.next().unwrap())?;
            Ok(TypedVar { name, ty })
        })
        .collect()
}

fn parse_procedure(ctx: &Ctx<'_>, pair: Pair<'_>) -> Result<Procedure, ParseError> {
    let mut procedure = Procedure::new("", Vec::new());
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::attribute => procedure.attributes.push(parse_attribute(item)),
            Rule::ident => procedure.name = item.as_str().to_string(),
            Rule::params => procedure.params = parse_params(ctx, item)?,
            Rule::modifies_clause => procedure
                .modifies
                .extend(item.into_inner().map(|id| id.as_str().to_string())),
            Rule::requires_clause => {
                let expr = parse_expr(ctx, item.into_inner().next().unwrap())?;
                procedure.requires.push(expr);
            }
            Rule::ensures_clause => {
                let expr = parse_expr(ctx, item.into_inner().next().unwrap())?;
                procedure.ensures.push(expr);
            }
            rule => unreachable!("procedure rule {rule:?}"),
        }
    }
    Ok(procedure)
}

fn parse_implementation(ctx: &Ctx<'_>, pair: Pair<'_>) -> Result<Implementation, ParseError> {
    let mut imp = Implementation {
        name: String::new(),
        attributes: Vec::new(),
        params: Vec::new(),
        locals: Vec::new(),
        blocks: Vec::new(),
    };
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::attribute => imp.attributes.push(parse_attribute(item)),
            Rule::ident => imp.name = item.as_str().to_string(),
            Rule::params => imp.params = parse_params(ctx, item)?,
            Rule::local_decl => {
                let mut inner = item.into_inner();
                let name = inner.next().unwrap().as_str().to_string();
                let ty = parse_type(ctx, inner.next().unwrap())?;
                imp.locals.push(TypedVar { name, ty });
            }
            Rule::block => imp.blocks.push(parse_block(ctx, item)?),
            rule => unreachable!("implementation rule {rule:?}"),
        }
    }
    Ok(imp)
}

fn parse_block(ctx: &Ctx<'_>, pair: Pair<'_>) -> Result<Block, ParseError> {
    let mut inner = pair.into_inner();
    let label = inner.next().unwrap().as_str().to_string();
    let mut cmds = Vec::new();
    let mut transfer = Transfer::Return;
    for item in inner {
        match item.as_rule() {
            Rule::goto_transfer => {
                transfer =
                    Transfer::Goto(item.into_inner().map(|id| id.as_str().to_string()).collect())
            }
            Rule::return_transfer => transfer = Transfer::Return,
            _ => cmds.push(parse_cmd(ctx, item)?),
        }
    }
    Ok(Block {
        label,
        cmds,
        transfer,
    })
}

fn parse_cmd(ctx: &Ctx<'_>, pair: Pair<'_>) -> Result<Cmd, ParseError> {
    match pair.as_rule() {
        Rule::call_cmd => {
            let mut inner = pair.into_inner();
            let callee = inner.next().unwrap().as_str().to_string();
            let mut args = Vec::new();
            if let Some(list) = inner.next() {
                for arg in list.into_inner() {
                    args.push(parse_expr(ctx, arg)?);
                }
            }
            Ok(Cmd::Call { callee, args })
        }
        Rule::assert_cmd => {
            let mut attributes = Vec::new();
            let mut condition = Expr::BoolLit(true);
            for item in pair.into_inner() {
                match item.as_rule() {
                    Rule::attribute => attributes.push(parse_attribute(item)),
                    Rule::expr => condition = parse_expr(ctx, item)?,
                    rule => unreachable!("assert rule {rule:?}"),
                }
            }
            Ok(Cmd::Assert {
                attributes,
                condition,
            })
        }
        Rule::assume_cmd => Ok(Cmd::Assume {
            condition: parse_expr(ctx, pair.into_inner().next().unwrap())?,
        }),
        Rule::havoc_cmd => Ok(Cmd::Havoc {
            var: pair.into_inner().next().unwrap().as_str().to_string(),
        }),
        Rule::assign_cmd => {
            let mut inner = pair.into_inner();
            let mut target = inner.next().unwrap().into_inner();
            let value = parse_expr(ctx, inner.next().unwrap())?;
            let name = target.next().unwrap().as_str().to_string();
            let target = match target.next() {
                Some(index) => AssignTarget::MapEntry {
                    map: name,
                    index: parse_expr(ctx, index.into_inner().next().unwrap())?,
                },
                None => AssignTarget::Var(name),
            };
            Ok(Cmd::Assign { target, value })
        }
        rule => unreachable!("command rule {rule:?}"),
    }
}

fn parse_expr(ctx: &Ctx<'_>, pair: Pair<'_>) -> Result<Expr, ParseError> {
    match pair.as_rule() {
        Rule::expr | Rule::paren_expr => parse_expr(ctx, pair.into_inner().next().unwrap()),
        Rule::implies_expr => {
            let mut inner = pair.into_inner();
            let lhs = parse_expr(ctx, inner.next().unwrap())?;
            match inner.next() {
                // The grammar rule is right-recursive, so ==> associates
                // to the right.
                Some(rhs) => Ok(Expr::implies(lhs, parse_expr(ctx, rhs)?)),
                None => Ok(lhs),
            }
        }
        Rule::or_expr => fold_chain(ctx, pair, |_| BinOp::Or),
        Rule::and_expr => fold_chain(ctx, pair, |_| BinOp::And),
        Rule::rel_expr => {
            let mut inner = pair.into_inner();
            let lhs = parse_expr(ctx, inner.next().unwrap())?;
            let Some(op) = inner.next() else {
                return Ok(lhs);
            };
            let rhs = parse_expr(ctx, inner.next().unwrap())?;
            let op = match op.as_str() {
                "==" => BinOp::Eq,
                "!=" => BinOp::Neq,
                "<=" => BinOp::Le,
                ">=" => BinOp::Ge,
                "<" => BinOp::Lt,
                ">" => BinOp::Gt,
                other => unreachable!("relational operator {other}"),
            };
            Ok(Expr::binary(op, lhs, rhs))
        }
        Rule::add_expr => fold_chain(ctx, pair, |op| match op {
            "+" => BinOp::Add,
            _ => BinOp::Sub,
        }),
        Rule::mul_expr => fold_chain(ctx, pair, |op| match op {
            "*" => BinOp::Mul,
            _ => BinOp::Div,
        }),
        Rule::unary_expr => {
            let mut inner = pair.into_inner();
            let first = inner.next().unwrap();
            if first.as_rule() == Rule::unary_op {
                let op = match first.as_str() {
                    "!" => UnOp::Not,
                    _ => UnOp::Neg,
                };
                let operand = parse_expr(ctx, inner.next().unwrap())?;
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                })
            } else {
                parse_expr(ctx, first)
            }
        }
        Rule::postfix_expr => {
            let mut inner = pair.into_inner();
            let mut expr = parse_expr(ctx, inner.next().unwrap())?;
            for index in inner {
                expr = Expr::select(expr, parse_expr(ctx, index.into_inner().next().unwrap())?);
            }
            Ok(expr)
        }
        Rule::int_lit => {
            let value = pair.as_str().parse().map_err(|_| ParseError::Syntax {
                message: format!("integer literal '{}' out of range", pair.as_str()),
                span: span_of(&pair),
                src: ctx.named_source(),
            })?;
            Ok(Expr::IntLit(value))
        }
        Rule::bool_lit => Ok(Expr::BoolLit(pair.as_str() == "true")),
        Rule::ident => Ok(Expr::Ident(pair.as_str().to_string())),
        Rule::ite_expr => {
            let mut inner = pair.into_inner();
            let cond = parse_expr(ctx, inner.next().unwrap())?;
            let then = parse_expr(ctx, inner.next().unwrap())?;
            let els = parse_expr(ctx, inner.next().unwrap())?;
            Ok(Expr::ite(cond, then, els))
        }
        Rule::pa_expr => {
            let mut inner = pair.into_inner();
            let ptr = parse_expr(ctx, inner.next().unwrap())?;
            let index = parse_expr(ctx, inner.next().unwrap())?;
            let scale = parse_expr(ctx, inner.next().unwrap())?;
            Ok(Expr::PointerArith {
                ptr: Box::new(ptr),
                index: Box::new(index),
                scale: Box::new(scale),
            })
        }
        Rule::all_expr => Ok(Expr::AllTrue(
            pair.into_inner().next().unwrap().as_str().to_string(),
        )),
        Rule::none_expr => Ok(Expr::NoneTrue(
            pair.into_inner().next().unwrap().as_str().to_string(),
        )),
        rule => unreachable!("expression rule {rule:?}"),
    }
}

/// Left-fold a `lhs (op rhs)*` chain where pest captured the operators.
fn fold_chain(
    ctx: &Ctx<'_>,
    pair: Pair<'_>,
    to_op: impl Fn(&str) -> BinOp,
) -> Result<Expr, ParseError> {
    let mut inner = pair.into_inner();
    let mut expr = parse_expr(ctx, inner.next().unwrap())?;
    while let Some(next) = inner.next() {
        // `||` and `&&` chains carry no operator pair; add/mul chains do.
        let (op, rhs) = match next.as_rule() {
            Rule::add_op | Rule::mul_op => (to_op(next.as_str()), inner.next().unwrap()),
            _ => (to_op(""), next),
        };
        expr = Expr::binary(op, expr, parse_expr(ctx, rhs)?);
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        parse(src, "test.dvl").expect("parse")
    }

    #[test]
    fn parses_globals_and_constants() {
        let program = parse_ok(
            "var {:lock} CLS: [int]bool;\n\
             var $M.counter: [int]int;\n\
             const WATCHED_ACCESS_OFFSET_$M.counter: int;\n",
        );
        let globals: Vec<_> = program.globals().collect();
        assert_eq!(globals.len(), 2);
        assert_eq!(globals[0].name, "CLS");
        assert_eq!(globals[0].ty, Type::MapIntBool);
        assert!(globals[0].attributes.iter().any(|a| a.name == "lock"));
        let constants: Vec<_> = program.constants().collect();
        assert_eq!(constants[0].name, "WATCHED_ACCESS_OFFSET_$M.counter");
        assert_eq!(constants[0].ty, Type::Int);
    }

    #[test]
    fn parses_procedure_contract() {
        let program = parse_ok(
            "procedure mutex_lock(l: int);\n\
             modifies CLS, $M.counter;\n\
             requires l > 0;\n\
             ensures CLS[l];\n",
        );
        let p = program.procedure("mutex_lock").expect("procedure");
        assert_eq!(p.params, vec![TypedVar::new("l", Type::Int)]);
        assert_eq!(
            p.modifies,
            vec!["CLS".to_string(), "$M.counter".to_string()]
        );
        assert_eq!(p.requires.len(), 1);
        assert_eq!(
            p.ensures[0],
            Expr::select(Expr::ident("CLS"), Expr::ident("l"))
        );
    }

    #[test]
    fn parses_implementation_blocks() {
        let program = parse_ok(
            "implementation drv_probe(dev: int)\n\
             {\n\
             var p: int;\n\
             $entry:\n\
               p := $pa(dev, 1, 4);\n\
               call mutex_lock(p);\n\
               goto $exit;\n\
             $exit:\n\
               $M.counter[p] := $M.counter[p] + 1;\n\
               return;\n\
             }\n",
        );
        let imp = program.implementation("drv_probe").expect("implementation");
        assert_eq!(imp.locals, vec![TypedVar::new("p", Type::Int)]);
        assert_eq!(imp.blocks.len(), 2);
        assert_eq!(imp.blocks[0].label, "$entry");
        assert_eq!(imp.blocks[0].transfer, Transfer::Goto(vec!["$exit".into()]));
        assert_eq!(imp.blocks[1].transfer, Transfer::Return);
        match &imp.blocks[1].cmds[0] {
            Cmd::Assign { target, .. } => {
                assert_eq!(target.base_name(), "$M.counter");
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn implication_is_right_associative() {
        let program = parse_ok("axiom a ==> b ==> c;\n");
        let axiom = match &program.decls[0] {
            Decl::Axiom(e) => e.clone(),
            other => panic!("expected axiom, got {other:?}"),
        };
        let bc = Expr::implies(Expr::ident("b"), Expr::ident("c"));
        assert_eq!(axiom, Expr::implies(Expr::ident("a"), bc));
    }

    #[test]
    fn equality_does_not_swallow_an_implication_arrow() {
        let program = parse_ok("axiom x == 1 ==> y == 2;\n");
        let axiom = match &program.decls[0] {
            Decl::Axiom(e) => e.clone(),
            other => panic!("expected axiom, got {other:?}"),
        };
        assert_eq!(
            axiom,
            Expr::implies(
                Expr::eq(Expr::ident("x"), Expr::IntLit(1)),
                Expr::eq(Expr::ident("y"), Expr::IntLit(2)),
            )
        );
    }

    #[test]
    fn keyword_prefixed_identifiers_stay_identifiers() {
        let program = parse_ok(
            "implementation f(callback: int)\n\
             {\n\
             $entry:\n\
               callback := callback + 1;\n\
               return;\n\
             }\n",
        );
        let imp = program.implementation("f").expect("implementation");
        assert_eq!(imp.params[0].name, "callback");
        match &imp.blocks[0].cmds[0] {
            Cmd::Assign { target, .. } => assert_eq!(target.base_name(), "callback"),
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let err = parse("var x: float;\n", "test.dvl").unwrap_err();
        match err {
            ParseError::UnknownType { found, .. } => assert_eq!(found, "float"),
            other => panic!("expected unknown type error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_global_declarations() {
        let err = parse(
            "var $M.counter: [int]int;\nvar $M.counter: [int]int;\n",
            "test.dvl",
        )
        .unwrap_err();
        match err {
            ParseError::Duplicate { name, .. } => assert_eq!(name, "$M.counter"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_implementations() {
        let err = parse(
            "implementation f()\n{\n$entry:\n  return;\n}\n\
             implementation f()\n{\n$entry:\n  return;\n}\n",
            "test.dvl",
        )
        .unwrap_err();
        match err {
            ParseError::Duplicate { name, .. } => assert_eq!(name, "f"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn a_procedure_and_its_implementation_may_share_a_name() {
        let program = parse_ok(
            "procedure f(x: int);\n\
             implementation f(x: int)\n\
             {\n\
             $entry:\n\
               return;\n\
             }\n",
        );
        assert!(program.procedure("f").is_some());
        assert!(program.implementation("f").is_some());
    }

    #[test]
    fn parses_assert_attributes() {
        let program = parse_ok(
            "implementation f(p: int)\n\
             {\n\
             $entry:\n\
               assert {:access \"write\", \"$M.counter\"} p > 0;\n\
               return;\n\
             }\n",
        );
        let imp = program.implementation("f").expect("implementation");
        match &imp.blocks[0].cmds[0] {
            Cmd::Assert { attributes, .. } => {
                assert_eq!(attributes[0].name, "access");
                assert_eq!(
                    attributes[0].params,
                    vec![
                        AttrParam::Str("write".into()),
                        AttrParam::Str("$M.counter".into())
                    ]
                );
            }
            other => panic!("expected assert, got {other:?}"),
        }
    }

    #[test]
    fn reports_syntax_errors_with_a_span() {
        let err = parse("implementation {\n", "broken.dvl").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { .. }));
    }
}
