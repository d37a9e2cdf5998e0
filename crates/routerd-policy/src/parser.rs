//! Policy source parser
//!
//! Parses the declarative policy language into [`PolicyStatement`]
//! ASTs:
//!
//! ```text
//! policy-statement P {
//!   term T1 {
//!     from { protocol: "ospf"; network4 <= 10.0.0.0/8; }
//!     to   { protocol: "bgp"; }
//!     then { localpref = 200; accept; }
//!   }
//! }
//! ```
//!
//! Section ordering `from -> to -> then` is enforced by the grammar. A
//! bare policy body (statements with no term wrapper) parses as one
//! unnamed term, usable as a `CALL` subroutine.

use nom::branch::alt;
use nom::bytes::complete::{is_not, take_while, take_while1};
use nom::character::complete::{char as nchar, multispace1};
use nom::combinator::{fail, not, opt, recognize};
use nom::multi::{many0, many1};
use nom::sequence::pair;
use nom::IResult;

use crate::ast::{BinOp, Node, PolicyStatement, Term};
use crate::element::{ArithOp, CmpOp, Element};
use crate::error::{PolicyError, PolicyResult};

type PResult<'a, T> = IResult<&'a str, T>;

/// Whitespace and `//` comments.
fn sp(input: &str) -> PResult<'_, ()> {
    let (input, _) = many0(alt((
        multispace1,
        recognize(pair(nom::bytes::complete::tag("//"), opt(is_not("\n")))),
    )))(input)?;
    Ok((input, ()))
}

fn ws<'a, O>(
    mut inner: impl FnMut(&'a str) -> PResult<'a, O>,
) -> impl FnMut(&'a str) -> PResult<'a, O> {
    move |input| {
        let (input, _) = sp(input)?;
        inner(input)
    }
}

fn ident(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
    ))(input)
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, ()> {
    move |input| {
        let (rest, id) = ws(ident)(input)?;
        if id == kw {
            Ok((rest, ()))
        } else {
            fail(input)
        }
    }
}

fn quoted(input: &str) -> PResult<'_, String> {
    let (input, _) = nchar('"')(input)?;
    let (input, body) = opt(is_not("\""))(input)?;
    let (input, _) = nchar('"')(input)?;
    Ok((input, body.unwrap_or("").to_string()))
}

/// A bare value token: addresses, prefixes, numbers, booleans.
fn value_token(input: &str) -> PResult<'_, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '/' | '-'))(input)
}

/// Classify a bare token as a literal, most specific first.
fn classify_literal(token: &str) -> Option<Element> {
    if token.contains('/') {
        if let Ok(net) = token.parse() {
            return Some(Element::Ipv4Net(net));
        }
        if let Ok(net) = token.parse() {
            return Some(Element::Ipv6Net(net));
        }
        return None;
    }
    if token.contains(':') {
        return token.parse().ok().map(Element::Ipv6);
    }
    if token.contains('.') {
        return token.parse().ok().map(Element::Ipv4);
    }
    match token {
        "true" => return Some(Element::Bool(true)),
        "false" => return Some(Element::Bool(false)),
        _ => {}
    }
    if let Ok(v) = token.parse::<u32>() {
        return Some(Element::U32(v));
    }
    if let Ok(v) = token.parse::<i32>() {
        return Some(Element::I32(v));
    }
    token.parse::<u64>().ok().map(Element::U64)
}

/// An operand: quoted string, literal, or identifier (variable or named
/// set, resolved at codegen).
fn operand(input: &str) -> PResult<'_, Node> {
    let (input, _) = sp(input)?;
    if let Ok((rest, s)) = quoted(input) {
        return Ok((rest, Node::Literal(Element::Str(s))));
    }
    let (rest, token) = value_token(input)?;
    match classify_literal(token) {
        Some(lit) => Ok((rest, Node::Literal(lit))),
        None => {
            // Not a literal: take it as an identifier instead.
            let (rest, id) = ident(input)?;
            Ok((rest, Node::Var(id.to_string())))
        }
    }
}

fn binop(input: &str) -> PResult<'_, BinOp> {
    use nom::bytes::complete::tag;
    alt((
        nom::combinator::value(BinOp::Eq, tag("==")),
        nom::combinator::value(BinOp::Ne, tag("!=")),
        nom::combinator::value(BinOp::Cmp(CmpOp::Le), tag("<=")),
        nom::combinator::value(BinOp::Cmp(CmpOp::Ge), tag(">=")),
        nom::combinator::value(BinOp::Cmp(CmpOp::Lt), tag("<")),
        nom::combinator::value(BinOp::Cmp(CmpOp::Gt), tag(">")),
        nom::combinator::value(BinOp::Arith(ArithOp::Add), tag("+")),
        nom::combinator::value(BinOp::Arith(ArithOp::Sub), tag("-")),
        nom::combinator::value(BinOp::Arith(ArithOp::Mul), tag("*")),
        nom::combinator::value(BinOp::Arith(ArithOp::Div), tag("/")),
        nom::combinator::value(BinOp::Arith(ArithOp::Mod), tag("%")),
    ))(input)
}

fn expr(input: &str) -> PResult<'_, Node> {
    let (input, lhs) = operand(input)?;
    let (input, op) = opt(ws(binop))(input)?;
    match op {
        None => Ok((input, lhs)),
        Some(op) => {
            let (input, rhs) = operand(input)?;
            Ok((
                input,
                Node::Bin {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            ))
        }
    }
}

fn protocol_spec(input: &str) -> PResult<'_, Node> {
    let (input, _) = keyword("protocol")(input)?;
    let (input, _) = ws(nchar(':'))(input)?;
    let (input, name) = ws(quoted)(input)?;
    let (input, _) = ws(nchar(';'))(input)?;
    Ok((input, Node::ProtocolSpec(name)))
}

fn accept_stmt(input: &str) -> PResult<'_, Node> {
    let (input, _) = keyword("accept")(input)?;
    let (input, _) = ws(nchar(';'))(input)?;
    Ok((input, Node::Accept))
}

fn reject_stmt(input: &str) -> PResult<'_, Node> {
    let (input, _) = keyword("reject")(input)?;
    let (input, _) = ws(nchar(';'))(input)?;
    Ok((input, Node::Reject))
}

fn assign_stmt(input: &str) -> PResult<'_, Node> {
    let (input, var) = ws(ident)(input)?;
    let (input, _) = ws(nchar('='))(input)?;
    // `==` is a comparison, not an assignment.
    let (input, _) = not(nchar('='))(input)?;
    let (input, value) = expr(input)?;
    let (input, _) = ws(nchar(';'))(input)?;
    Ok((
        input,
        Node::Assign {
            var: var.to_string(),
            value: Box::new(value),
        },
    ))
}

fn predicate_stmt(input: &str) -> PResult<'_, Node> {
    let (input, e) = expr(input)?;
    let (input, _) = ws(nchar(';'))(input)?;
    Ok((input, e))
}

fn statement(input: &str) -> PResult<'_, Node> {
    alt((protocol_spec, accept_stmt, reject_stmt, assign_stmt, predicate_stmt))(input)
}

fn section<'a>(name: &'static str) -> impl FnMut(&'a str) -> PResult<'a, Vec<Node>> {
    move |input| {
        let (input, _) = keyword(name)(input)?;
        let (input, _) = ws(nchar('{'))(input)?;
        let (input, stmts) = many0(statement)(input)?;
        let (input, _) = ws(nchar('}'))(input)?;
        Ok((input, stmts))
    }
}

fn term(input: &str) -> PResult<'_, Term> {
    let (input, _) = keyword("term")(input)?;
    let (input, name) = ws(ident)(input)?;
    let (input, _) = ws(nchar('{'))(input)?;
    let (input, from) = opt(section("from"))(input)?;
    let (input, to) = opt(section("to"))(input)?;
    let (input, then) = opt(section("then"))(input)?;
    let (input, _) = ws(nchar('}'))(input)?;
    Ok((
        input,
        Term {
            name: name.to_string(),
            from: from.unwrap_or_default(),
            to: to.unwrap_or_default(),
            then: then.unwrap_or_default(),
        },
    ))
}

fn policy_statement(input: &str) -> PResult<'_, PolicyStatement> {
    let (input, _) = keyword("policy-statement")(input)?;
    let (input, name) = ws(ident)(input)?;
    let (input, _) = ws(nchar('{'))(input)?;

    if let Ok((input, terms)) = many1(term)(input) {
        let (input, _) = ws(nchar('}'))(input)?;
        return Ok((
            input,
            PolicyStatement {
                name: name.to_string(),
                terms,
            },
        ));
    }

    // Bare body: predicates and actions with no term wrapper.
    let (input, stmts) = many0(statement)(input)?;
    let (input, _) = ws(nchar('}'))(input)?;
    let mut bare = Term::default();
    for stmt in stmts {
        match stmt {
            Node::Assign { .. } | Node::Accept | Node::Reject => bare.then.push(stmt),
            other => bare.from.push(other),
        }
    }
    Ok((
        input,
        PolicyStatement {
            name: name.to_string(),
            terms: vec![bare],
        },
    ))
}

/// Parse a whole configuration fragment into policy statements.
pub fn parse_policies(input: &str) -> PolicyResult<Vec<PolicyStatement>> {
    let to_err = |rest: &str| PolicyError::Parse {
        near: rest.chars().take(32).collect(),
        message: "expected policy-statement".to_string(),
    };

    let (rest, policies) = many0(policy_statement)(input).map_err(|e| match e {
        nom::Err::Error(e) | nom::Err::Failure(e) => to_err(e.input),
        nom::Err::Incomplete(_) => to_err(""),
    })?;
    let (rest, _) = sp(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| to_err(rest))?;
    if !rest.is_empty() {
        return Err(to_err(rest));
    }
    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_policy() {
        let src = r#"
            // redistribute OSPF into BGP
            policy-statement ospf-to-bgp {
                term t1 {
                    from { protocol: "ospf"; network4 <= 10.0.0.0/8; }
                    to   { protocol: "bgp"; }
                    then { localpref = 200; accept; }
                }
            }
        "#;
        let policies = parse_policies(src).unwrap();
        assert_eq!(policies.len(), 1);
        let p = &policies[0];
        assert_eq!(p.name, "ospf-to-bgp");
        assert_eq!(p.terms.len(), 1);

        let t = &p.terms[0];
        assert_eq!(t.name, "t1");
        assert_eq!(t.from_protocols(), vec!["ospf"]);
        assert_eq!(t.to_protocol(), Some("bgp"));
        assert_eq!(t.then.len(), 2);
        assert!(matches!(t.then[1], Node::Accept));
    }

    #[test]
    fn test_section_order_enforced() {
        let src = r#"
            policy-statement backwards {
                term t1 {
                    then { accept; }
                    from { protocol: "ospf"; }
                }
            }
        "#;
        assert!(parse_policies(src).is_err());
    }

    #[test]
    fn test_multiple_terms() {
        let src = r#"
            policy-statement multi {
                term a { from { metric == 1; } then { reject; } }
                term b { then { accept; } }
            }
        "#;
        let policies = parse_policies(src).unwrap();
        assert_eq!(policies[0].terms.len(), 2);
        assert!(policies[0].terms[1].from.is_empty());
    }

    #[test]
    fn test_bare_subroutine() {
        let src = r#"
            policy-statement is-private {
                network4 <= private-nets;
                accept;
            }
        "#;
        let policies = parse_policies(src).unwrap();
        assert!(policies[0].is_subroutine());
        let t = &policies[0].terms[0];
        assert_eq!(t.from.len(), 1);
        assert_eq!(t.then.len(), 1);
    }

    #[test]
    fn test_literals_classified() {
        let src = r#"
            policy-statement lits {
                term t {
                    from {
                        network4 == 192.0.2.0/24;
                        nexthop4 == 192.0.2.1;
                        metric == 5;
                        aspath != "65001 65002";
                    }
                    then { metric = metric + 1; accept; }
                }
            }
        "#;
        let policies = parse_policies(src).unwrap();
        let t = &policies[0].terms[0];
        assert_eq!(t.from.len(), 4);
        match &t.from[0] {
            Node::Bin { op: BinOp::Eq, rhs, .. } => {
                assert!(matches!(**rhs, Node::Literal(Element::Ipv4Net(_))));
            }
            other => panic!("unexpected node {other:?}"),
        }
        match &t.then[0] {
            Node::Assign { var, value } => {
                assert_eq!(var, "metric");
                assert!(matches!(
                    **value,
                    Node::Bin {
                        op: BinOp::Arith(ArithOp::Add),
                        ..
                    }
                ));
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_policies("policy-statement {").is_err());
        assert!(parse_policies("nonsense").is_err());
        // Well-formed followed by garbage.
        assert!(parse_policies("policy-statement p { } trailing").is_err());
    }
}
