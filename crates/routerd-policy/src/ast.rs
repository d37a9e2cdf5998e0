//! Policy language AST
//!
//! A tagged sum type rather than a visitor hierarchy: code generation
//! is an exhaustive match over [`Node`], so adding a construct without
//! handling it everywhere is a compile error.

use crate::element::{ArithOp, CmpOp, Element};

/// Binary operators as they appear in policy source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Cmp(CmpOp),
    Arith(ArithOp),
}

impl BinOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Cmp(c) => c.name(),
            BinOp::Arith(a) => a.name(),
        }
    }
}

/// One expression or statement node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal value.
    Literal(Element),
    /// Variable reference, resolved against the VarMap at codegen.
    Var(String),
    /// Named set reference, resolved against the SetMap at codegen.
    SetRef(String),
    /// Binary expression.
    Bin {
        op: BinOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    /// `var = expr` in a then block.
    Assign { var: String, value: Box<Node> },
    /// `protocol: "name"` in a from or to block.
    ProtocolSpec(String),
    /// `accept;`
    Accept,
    /// `reject;`
    Reject,
}

/// A term: ordered from / to / then sections.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Term {
    pub name: String,
    pub from: Vec<Node>,
    pub to: Vec<Node>,
    pub then: Vec<Node>,
}

impl Term {
    /// The source protocol named in the from block, if any. At most one
    /// is legal; the second is a compile error caught by codegen.
    pub fn from_protocols(&self) -> Vec<&str> {
        self.from
            .iter()
            .filter_map(|n| match n {
                Node::ProtocolSpec(p) => Some(p.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The destination protocol named in the to block, if any.
    pub fn to_protocol(&self) -> Option<&str> {
        self.to.iter().find_map(|n| match n {
            Node::ProtocolSpec(p) => Some(p.as_str()),
            _ => None,
        })
    }
}

/// A `policy-statement` block. A bare body (statements with no term
/// wrapper) parses as one unnamed term and is usable as a subroutine.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStatement {
    pub name: String,
    pub terms: Vec<Term>,
}

impl PolicyStatement {
    /// True for bodies usable as `CALL` subroutines.
    pub fn is_subroutine(&self) -> bool {
        self.terms.len() == 1 && self.terms[0].name.is_empty()
    }
}
