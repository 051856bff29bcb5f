extern crate nom;

use std::cell::RefCell;
use std::str::FromStr;

use crate::*;

/*
 * Textual format for loop-nest functions, used by tests and the dot tool:
 *
 *   function @name {
 *     mayalias A, P;
 *     region {
 *       do i1 = 0, 99, 1 {
 *         A[i1][0] = B[2 * i1 + %n] + %t;
 *         call helper(A[i1][0]);
 *         if { %t = A[i1][1]; } else { goto done; }
 *       }
 *       done:
 *     }
 *   }
 *
 * Induction variables are written iN where N is the 1-based nesting level;
 * scalars and blobs are %name; subscripts are affine forms over IVs, blobs
 * and integers. This is a context-sensitive parser in the same shape as a
 * textual-IR parser: we parse straight into the arena inside Function and
 * intern symbols and blobs as they appear.
 */

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed HIR text near \"{near}\"")]
    Syntax { near: String },
    #[error("loop nest deeper than {} levels", MAX_LOOP_NEST_LEVEL)]
    TooDeep,
    #[error("induction variable i{found} declared at nesting level {expected}")]
    LevelMismatch { expected: u32, found: u32 },
    #[error("loop stride must be positive, got {stride}")]
    BadStride { stride: i64 },
}

struct Context {
    function: RefCell<Function>,
}

/*
 * Top level parse function.
 */
pub fn parse(text: &str) -> Result<Function, ParseError> {
    let context = Context {
        function: RefCell::new(Function::new(String::new())),
    };
    let (rest, _) = parse_function(text, &context).map_err(|_| ParseError::Syntax {
        near: snippet(text),
    })?;
    let (rest, _) =
        nom::character::complete::multispace0::<_, nom::error::Error<&str>>(rest).unwrap();
    if !rest.is_empty() {
        return Err(ParseError::Syntax {
            near: snippet(rest),
        });
    }
    let function = context.function.into_inner();
    validate(&function)?;
    Ok(function)
}

fn snippet(text: &str) -> String {
    text.trim_start().chars().take(24).collect()
}

/*
 * Structural checks the grammar itself cannot express: loop levels must
 * match their nesting depth, strides must be positive, and nests must fit
 * in the fixed engine capacity.
 */
fn validate(function: &Function) -> Result<(), ParseError> {
    for root in function.roots.iter() {
        for n in function.subtree_nodes(*root) {
            if let Node::Loop { level, stride, .. } = function.nodes[n.idx()] {
                let expected = function.enclosing_loops(n).len() as u32;
                if expected as usize > MAX_LOOP_NEST_LEVEL {
                    return Err(ParseError::TooDeep);
                }
                if level != expected {
                    return Err(ParseError::LevelMismatch {
                        expected,
                        found: level,
                    });
                }
                if stride < 1 {
                    return Err(ParseError::BadStride { stride });
                }
            }
        }
    }
    Ok(())
}

type PResult<'a, T> = nom::IResult<&'a str, T>;

fn ws(text: &str) -> PResult<'_, &str> {
    nom::character::complete::multispace0(text)
}

fn keyword<'a>(text: &'a str, word: &'static str) -> PResult<'a, &'a str> {
    let (text, _) = ws(text)?;
    nom::bytes::complete::tag(word)(text)
}

fn identifier(text: &str) -> PResult<'_, &str> {
    let (text, _) = ws(text)?;
    nom::combinator::recognize(nom::sequence::pair(
        nom::character::complete::alpha1,
        nom::multi::many0(nom::branch::alt((
            nom::character::complete::alphanumeric1,
            nom::bytes::complete::tag("_"),
        ))),
    ))(text)
}

fn integer(text: &str) -> PResult<'_, i64> {
    let (text, _) = ws(text)?;
    let (text, neg) = nom::combinator::opt(nom::bytes::complete::tag("-"))(text)?;
    let (text, digits) = nom::character::complete::digit1(text)?;
    let value = i64::from_str(digits).expect("Digits always parse as an integer.");
    Ok((text, if neg.is_some() { -value } else { value }))
}

/// IV names are iN; everything else alphabetic is an array name.
fn iv_level(name: &str) -> Option<u32> {
    let rest = name.strip_prefix('i')?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let level = u32::from_str(rest).ok()?;
    if level >= 1 && level as usize <= MAX_LOOP_NEST_LEVEL {
        Some(level)
    } else {
        None
    }
}

/*
 * Affine expression syntax, kept symbolic until an enclosing statement
 * fully parses. Blob terms are recorded by name and only interned when the
 * expression is materialized into a reference.
 */
#[derive(Debug, Clone, Default)]
struct ExprSyntax {
    ivs: Vec<(u32, i64)>,
    blobs: Vec<(String, i64)>,
    constant: i64,
}

#[derive(Debug, Clone)]
enum RefSyntax {
    Memory { name: String, subs: Vec<ExprSyntax> },
    Scalar { name: String },
}

fn parse_expr(text: &str) -> PResult<'_, ExprSyntax> {
    let mut expr = ExprSyntax::default();
    let (text, first) = parse_term(text)?;
    add_term(&mut expr, first, 1);
    let mut text = text;
    loop {
        let op: PResult<'_, &str> = nom::branch::alt((
            |t| keyword(t, "+"),
            |t| keyword(t, "-"),
        ))(text);
        match op {
            Ok((rest, op)) => {
                let (rest, term) = parse_term(rest)?;
                add_term(&mut expr, term, if op == "+" { 1 } else { -1 });
                text = rest;
            }
            Err(_) => break,
        }
    }
    Ok((text, expr))
}

#[derive(Debug, Clone)]
enum TermSyntax {
    Iv(u32, i64),
    Blob(String, i64),
    Const(i64),
}

fn add_term(expr: &mut ExprSyntax, term: TermSyntax, sign: i64) {
    match term {
        TermSyntax::Iv(level, coeff) => expr.ivs.push((level, sign * coeff)),
        TermSyntax::Blob(name, coeff) => expr.blobs.push((name, sign * coeff)),
        TermSyntax::Const(c) => expr.constant += sign * c,
    }
}

fn parse_term(text: &str) -> PResult<'_, TermSyntax> {
    // A term is INT, INT * atom, or atom.
    if let Ok((text, coeff)) = integer(text) {
        if let Ok((text, _)) = keyword(text, "*") {
            let (text, atom) = parse_atom(text)?;
            return Ok((
                text,
                match atom {
                    TermSyntax::Iv(level, _) => TermSyntax::Iv(level, coeff),
                    TermSyntax::Blob(name, _) => TermSyntax::Blob(name, coeff),
                    TermSyntax::Const(_) => {
                        panic!("Atoms are never constants.")
                    }
                },
            ));
        }
        return Ok((text, TermSyntax::Const(coeff)));
    }
    parse_atom(text)
}

fn parse_atom(text: &str) -> PResult<'_, TermSyntax> {
    let (text, _) = ws(text)?;
    if let Ok((text, _)) = nom::bytes::complete::tag::<_, _, nom::error::Error<&str>>("%")(text) {
        let (text, name) = identifier(text)?;
        return Ok((text, TermSyntax::Blob(name.to_string(), 1)));
    }
    let (text, name) = identifier(text)?;
    match iv_level(name) {
        Some(level) => Ok((text, TermSyntax::Iv(level, 1))),
        None => Err(nom::Err::Error(nom::error::Error::new(
            text,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn parse_ref(text: &str) -> PResult<'_, RefSyntax> {
    let (text, _) = ws(text)?;
    if let Ok((text, _)) = nom::bytes::complete::tag::<_, _, nom::error::Error<&str>>("%")(text) {
        let (text, name) = identifier(text)?;
        return Ok((
            text,
            RefSyntax::Scalar {
                name: name.to_string(),
            },
        ));
    }
    let (text, name) = identifier(text)?;
    if iv_level(name).is_some() {
        // IVs are not references.
        return Err(nom::Err::Error(nom::error::Error::new(
            text,
            nom::error::ErrorKind::Tag,
        )));
    }
    let (text, subs) = nom::multi::many0(|t| {
        let (t, _) = keyword(t, "[")?;
        let (t, expr) = parse_expr(t)?;
        let (t, _) = keyword(t, "]")?;
        Ok((t, expr))
    })(text)?;
    Ok((
        text,
        RefSyntax::Memory {
            name: name.to_string(),
            subs,
        },
    ))
}

/*
 * Materialization: intern symbols and blobs, build canonical expressions,
 * and hang the references (plus their blob sub-references) off an
 * instruction node.
 */
fn materialize_expr(function: &mut Function, syntax: &ExprSyntax) -> (CanonExpr, Vec<(BlobID, Symbase)>) {
    let mut expr = CanonExpr::from_const(syntax.constant);
    for (level, coeff) in syntax.ivs.iter() {
        expr.add_iv(*level, *coeff);
    }
    let mut used_blobs = vec![];
    for (name, coeff) in syntax.blobs.iter() {
        let symbase = function.intern_symbol(name, SymbolKind::Scalar);
        let blob = function.intern_blob(symbase);
        expr.add_blob(blob, *coeff);
        used_blobs.push((blob, symbase));
    }
    (expr, used_blobs)
}

fn materialize_ref(function: &mut Function, node: NodeID, syntax: &RefSyntax, is_lval: bool) -> RefID {
    match syntax {
        RefSyntax::Scalar { name } => {
            let symbase = function.intern_symbol(name, SymbolKind::Scalar);
            function.new_ref(DDRef {
                node,
                symbase,
                is_lval,
                kind: RefKind::Scalar,
            })
        }
        RefSyntax::Memory { name, subs } => {
            let symbase = function.intern_symbol(name, SymbolKind::Array);
            let mut subscripts = vec![];
            let mut blob_bases = vec![];
            for sub in subs.iter() {
                let (expr, used) = materialize_expr(function, sub);
                subscripts.push(expr);
                blob_bases.extend(used);
            }
            let mem = function.new_ref(DDRef {
                node,
                symbase,
                is_lval,
                kind: RefKind::Memory {
                    subscripts,
                    blobs: vec![],
                },
            });
            let mut blob_refs = vec![];
            for (_, blob_symbase) in blob_bases {
                blob_refs.push(function.new_ref(DDRef {
                    node,
                    symbase: blob_symbase,
                    is_lval: false,
                    kind: RefKind::Blob { parent: mem },
                }));
            }
            if let RefKind::Memory { blobs, .. } = &mut function.refs[mem.idx()].kind {
                *blobs = blob_refs;
            }
            mem
        }
    }
}

fn parse_function<'a>(text: &'a str, context: &Context) -> PResult<'a, ()> {
    let (text, _) = keyword(text, "function")?;
    let (text, _) = keyword(text, "@")?;
    let (text, name) = identifier(text)?;
    context.function.borrow_mut().name = name.to_string();
    let (text, _) = keyword(text, "{")?;
    let (text, _) = nom::multi::many0(|t| parse_mayalias(t, context))(text)?;
    let (text, roots) = nom::multi::many1(|t| parse_region(t, context))(text)?;
    context.function.borrow_mut().roots = roots;
    let (text, _) = keyword(text, "}")?;
    Ok((text, ()))
}

fn parse_mayalias<'a>(text: &'a str, context: &Context) -> PResult<'a, ()> {
    let (text, _) = keyword(text, "mayalias")?;
    let (text, first) = identifier(text)?;
    let (text, _) = keyword(text, ",")?;
    let (text, second) = identifier(text)?;
    let (text, _) = keyword(text, ";")?;
    let mut function = context.function.borrow_mut();
    let a = function.intern_symbol(first, SymbolKind::Array);
    let b = function.intern_symbol(second, SymbolKind::Array);
    function.may_alias.push((a, b));
    Ok((text, ()))
}

fn parse_region<'a>(text: &'a str, context: &Context) -> PResult<'a, NodeID> {
    let (text, _) = keyword(text, "region")?;
    let (text, _) = keyword(text, "{")?;
    let (text, children) = nom::multi::many0(|t| parse_stmt(t, context, 0))(text)?;
    let (text, _) = keyword(text, "}")?;
    let mut function = context.function.borrow_mut();
    let region = function.new_node(Node::Region {
        children: children.clone(),
    });
    for child in children {
        function.set_parent(child, region);
    }
    Ok((text, region))
}

fn parse_stmt<'a>(text: &'a str, context: &Context, depth: u32) -> PResult<'a, NodeID> {
    nom::branch::alt((
        |t| parse_loop(t, context, depth),
        |t| parse_if(t, context, depth),
        |t| parse_switch(t, context, depth),
        |t| parse_call(t, context),
        |t| parse_goto(t, context),
        |t| parse_label(t, context),
        |t| parse_assignment(t, context),
    ))(text)
}

fn parse_loop<'a>(text: &'a str, context: &Context, depth: u32) -> PResult<'a, NodeID> {
    let (text, _) = keyword(text, "do")?;
    let (text, iv_name) = identifier(text)?;
    let level = match iv_level(iv_name) {
        Some(level) => level,
        // Leave the level check to validate(); 0 never matches a depth.
        None => 0,
    };
    let (text, _) = keyword(text, "=")?;
    let (text, lower) = parse_expr(text)?;
    let (text, _) = keyword(text, ",")?;
    let (text, upper) = parse_expr(text)?;
    let (text, _) = keyword(text, ",")?;
    let (text, stride) = integer(text)?;
    let (text, _) = keyword(text, "{")?;
    let (text, children) = nom::multi::many0(|t| parse_stmt(t, context, depth + 1))(text)?;
    let (text, _) = keyword(text, "}")?;
    let mut function = context.function.borrow_mut();
    let (lower, _) = materialize_expr(&mut *function, &lower);
    let (upper, _) = materialize_expr(&mut *function, &upper);
    let node = function.new_node(Node::Loop {
        level,
        lower,
        upper,
        stride,
        children: children.clone(),
    });
    for child in children {
        function.set_parent(child, node);
    }
    Ok((text, node))
}

fn parse_if<'a>(text: &'a str, context: &Context, depth: u32) -> PResult<'a, NodeID> {
    let (text, _) = keyword(text, "if")?;
    let (text, _) = keyword(text, "{")?;
    let (text, then_children) = nom::multi::many0(|t| parse_stmt(t, context, depth))(text)?;
    let (text, _) = keyword(text, "}")?;
    let (text, else_children) = match keyword(text, "else") {
        Ok((text, _)) => {
            let (text, _) = keyword(text, "{")?;
            let (text, children) = nom::multi::many0(|t| parse_stmt(t, context, depth))(text)?;
            let (text, _) = keyword(text, "}")?;
            (text, children)
        }
        Err(_) => (text, vec![]),
    };
    let mut function = context.function.borrow_mut();
    let node = function.new_node(Node::If {
        then_children: then_children.clone(),
        else_children: else_children.clone(),
    });
    for child in then_children.into_iter().chain(else_children) {
        function.set_parent(child, node);
    }
    Ok((text, node))
}

fn parse_switch<'a>(text: &'a str, context: &Context, depth: u32) -> PResult<'a, NodeID> {
    let (text, _) = keyword(text, "switch")?;
    let (text, _) = keyword(text, "{")?;
    let (text, cases) = nom::multi::many1(|t| {
        let (t, _) = keyword(t, "case")?;
        let (t, _) = keyword(t, "{")?;
        let (t, children) = nom::multi::many0(|u| parse_stmt(u, context, depth))(t)?;
        let (t, _) = keyword(t, "}")?;
        Ok((t, children))
    })(text)?;
    let (text, _) = keyword(text, "}")?;
    let mut function = context.function.borrow_mut();
    let node = function.new_node(Node::Switch {
        cases: cases.clone(),
    });
    for case in cases {
        for child in case {
            function.set_parent(child, node);
        }
    }
    Ok((text, node))
}

fn parse_call<'a>(text: &'a str, context: &Context) -> PResult<'a, NodeID> {
    let (text, _) = keyword(text, "call")?;
    let (text, callee) = identifier(text)?;
    let (text, _) = keyword(text, "(")?;
    let (text, args) = nom::multi::separated_list0(|t| keyword(t, ","), parse_ref)(text)?;
    let (text, _) = keyword(text, ")")?;
    let (text, _) = keyword(text, ";")?;
    let mut function = context.function.borrow_mut();
    let node = function.new_node(Node::Inst {
        op: InstOp::Call {
            callee: callee.to_string(),
        },
        refs: vec![],
    });
    let refs: Vec<RefID> = args
        .iter()
        .map(|arg| materialize_ref(&mut *function, node, arg, false))
        .collect();
    if let Node::Inst { refs: node_refs, .. } = &mut function.nodes[node.idx()] {
        *node_refs = refs;
    }
    Ok((text, node))
}

fn parse_goto<'a>(text: &'a str, context: &Context) -> PResult<'a, NodeID> {
    let (text, _) = keyword(text, "goto")?;
    let (text, target) = identifier(text)?;
    let (text, _) = keyword(text, ";")?;
    let node = context.function.borrow_mut().new_node(Node::Goto {
        target: target.to_string(),
    });
    Ok((text, node))
}

fn parse_label<'a>(text: &'a str, context: &Context) -> PResult<'a, NodeID> {
    let (text, name) = identifier(text)?;
    let (text, _) = keyword(text, ":")?;
    let node = context.function.borrow_mut().new_node(Node::Label {
        name: name.to_string(),
    });
    Ok((text, node))
}

fn parse_assignment<'a>(text: &'a str, context: &Context) -> PResult<'a, NodeID> {
    let (text, lhs) = parse_ref(text)?;
    let (text, _) = keyword(text, "=")?;
    let (text, rhs) = nom::multi::separated_list1(
        |t| keyword(t, "+"),
        |t| {
            let rhs_ref = parse_ref(t);
            match rhs_ref {
                Ok((t, r)) => Ok((t, Some(r))),
                // Integer literals on the right-hand side carry no
                // dependence information; accept and drop them.
                Err(_) => integer(t).map(|(t, _)| (t, None)),
            }
        },
    )(text)?;
    let (text, _) = keyword(text, ";")?;
    let mut function = context.function.borrow_mut();
    let node = function.new_node(Node::Inst {
        op: InstOp::Assign,
        refs: vec![],
    });
    let mut refs = vec![materialize_ref(&mut *function, node, &lhs, true)];
    for arg in rhs.iter().flatten() {
        refs.push(materialize_ref(&mut *function, node, arg, false));
    }
    if let Node::Inst { refs: node_refs, .. } = &mut function.nodes[node.idx()] {
        *node_refs = refs;
    }
    Ok((text, node))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_two_level_nest() {
        let function = parse(
            "function @kernel {
               region {
                 do i1 = 0, 99, 1 {
                   do i2 = 0, 99, 1 {
                     A[i1][i2 + 1] = B[i1][i2] + %t0;
                   }
                 }
               }
             }",
        )
        .unwrap();
        assert_eq!(function.name, "kernel");
        assert_eq!(function.roots.len(), 1);
        assert_eq!(function.refs.len(), 3);
        let lhs = &function.refs[0];
        assert!(lhs.is_lval && lhs.is_memory());
        assert_eq!(function.ref_string(RefID::new(0)), "A[i1][i2 + 1]");
        assert_eq!(function.ref_string(RefID::new(2)), "%t0");
        let region = function.roots[0];
        assert_eq!(function.descendant_loops(region).len(), 2);
    }

    #[test]
    fn blob_subscripts_create_sub_references() {
        let function = parse(
            "function @f {
               region {
                 do i1 = 0, 9, 1 {
                   A[i1 + %n] = 1;
                 }
               }
             }",
        )
        .unwrap();
        // The memory ref plus one blob ref for %n.
        assert_eq!(function.refs.len(), 2);
        let mem = &function.refs[0];
        let blob = &function.refs[1];
        assert_eq!(mem.blob_refs(), &[RefID::new(1)]);
        assert!(matches!(blob.kind, RefKind::Blob { parent } if parent == RefID::new(0)));
        assert!(!blob.is_lval);
        assert!(mem.subscripts()[0].has_blobs());
    }

    #[test]
    fn mayalias_declarations() {
        let function = parse(
            "function @f {
               mayalias A, P;
               region {
                 A[0] = P[0];
               }
             }",
        )
        .unwrap();
        assert_eq!(function.may_alias.len(), 1);
        let oracle = AliasOracle::new();
        let (a, p) = function.may_alias[0];
        assert!(oracle.alias(&function, a, p).may_alias());
    }

    #[test]
    fn control_constructs() {
        let function = parse(
            "function @f {
               region {
                 do i1 = 0, 9, 1 {
                   if { A[i1] = 1; } else { A[i1] = 2; }
                   switch { case { B[i1] = 1; } case { goto out; } }
                 }
                 out:
               }
             }",
        )
        .unwrap();
        let region = function.roots[0];
        let kinds: Vec<bool> = function
            .subtree_nodes(region)
            .iter()
            .map(|n| matches!(function.nodes[n.idx()], Node::Label { .. }))
            .collect();
        assert!(kinds.iter().any(|k| *k));
    }

    #[test]
    fn rejects_mismatched_levels() {
        let err = parse(
            "function @f {
               region {
                 do i2 = 0, 9, 1 {
                   A[i2] = 1;
                 }
               }
             }",
        )
        .unwrap_err();
        assert_eq!(
            err,
            ParseError::LevelMismatch {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn rejects_bad_stride() {
        let err = parse(
            "function @f {
               region {
                 do i1 = 0, 9, 0 {
                   A[i1] = 1;
                 }
               }
             }",
        )
        .unwrap_err();
        assert_eq!(err, ParseError::BadStride { stride: 0 });
    }
}
