//! Compiled policy code
//!
//! Code generators emit an ASCII instruction stream, one op per line.
//! The stream is the unit handed between the compiler and the protocols
//! (it survives logging and IPC untouched); [`Program::assemble`]
//! parses it once at configuration time and the VM executes the
//! assembled form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::element::{ArithOp, CmpOp, ElemType, Element};
use crate::error::{PolicyError, PolicyResult};
use crate::varmap::VarId;

/// Which filter bank a [`Code`] object targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterStage {
    Import,
    ExportSourceMatch,
    Export,
}

impl FilterStage {
    pub fn name(&self) -> &'static str {
        match self {
            FilterStage::Import => "import",
            FilterStage::ExportSourceMatch => "export-sourcematch",
            FilterStage::Export => "export",
        }
    }
}

/// (protocol, stage) a code fragment is destined for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target {
    pub protocol: String,
    pub stage: FilterStage,
}

impl Target {
    pub fn new(protocol: &str, stage: FilterStage) -> Target {
        Target {
            protocol: protocol.to_string(),
            stage,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.stage.name())
    }
}

/// One VM instruction. `Display`/`FromStr` round-trip the ASCII form.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Push(Element),
    Load(VarId),
    Store(VarId),
    Eq,
    Ne,
    Cmp(CmpOp),
    Arith(ArithOp),
    OnFalseExit,
    Accept,
    Reject,
    NextTerm,
    NextPolicy,
    TermStart(String),
    TermEnd,
    PolicyStart(String),
    PolicyEnd,
    Call(String),
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Push(e) => write!(f, "PUSH {} {}", e.elem_type().name(), e),
            Instr::Load(id) => write!(f, "LOAD {id}"),
            Instr::Store(id) => write!(f, "STORE {id}"),
            Instr::Eq => write!(f, "=="),
            Instr::Ne => write!(f, "!="),
            Instr::Cmp(op) => write!(f, "{}", op.name()),
            Instr::Arith(op) => write!(f, "{}", op.name()),
            Instr::OnFalseExit => write!(f, "ONFALSE_EXIT"),
            Instr::Accept => write!(f, "ACCEPT"),
            Instr::Reject => write!(f, "REJECT"),
            Instr::NextTerm => write!(f, "NEXT_TERM"),
            Instr::NextPolicy => write!(f, "NEXT_POLICY"),
            Instr::TermStart(name) => write!(f, "TERM_START {name}"),
            Instr::TermEnd => write!(f, "TERM_END"),
            Instr::PolicyStart(name) => write!(f, "POLICY_START {name}"),
            Instr::PolicyEnd => write!(f, "POLICY_END"),
            Instr::Call(name) => write!(f, "CALL {name}"),
        }
    }
}

impl FromStr for Instr {
    type Err = PolicyError;

    fn from_str(line: &str) -> PolicyResult<Instr> {
        let bad = || PolicyError::BadInstruction(line.to_string());
        let mut parts = line.splitn(2, ' ');
        let op = parts.next().ok_or_else(bad)?;
        let rest = parts.next().unwrap_or("");

        Ok(match op {
            "PUSH" => {
                let mut parts = rest.splitn(2, ' ');
                let ty = parts.next().and_then(ElemType::from_name).ok_or_else(bad)?;
                let value = parts.next().ok_or_else(bad)?;
                Instr::Push(Element::parse(ty, value)?)
            }
            "LOAD" => Instr::Load(rest.trim().parse().map_err(|_| bad())?),
            "STORE" => Instr::Store(rest.trim().parse().map_err(|_| bad())?),
            "==" => Instr::Eq,
            "!=" => Instr::Ne,
            "<" => Instr::Cmp(CmpOp::Lt),
            "<=" => Instr::Cmp(CmpOp::Le),
            ">" => Instr::Cmp(CmpOp::Gt),
            ">=" => Instr::Cmp(CmpOp::Ge),
            "+" => Instr::Arith(ArithOp::Add),
            "-" => Instr::Arith(ArithOp::Sub),
            "*" => Instr::Arith(ArithOp::Mul),
            "/" => Instr::Arith(ArithOp::Div),
            "%" => Instr::Arith(ArithOp::Mod),
            "ONFALSE_EXIT" => Instr::OnFalseExit,
            "ACCEPT" => Instr::Accept,
            "REJECT" => Instr::Reject,
            "NEXT_TERM" => Instr::NextTerm,
            "NEXT_POLICY" => Instr::NextPolicy,
            "TERM_START" => Instr::TermStart(rest.trim().to_string()),
            "TERM_END" => Instr::TermEnd,
            "POLICY_START" => Instr::PolicyStart(rest.trim().to_string()),
            "POLICY_END" => Instr::PolicyEnd,
            "CALL" => Instr::Call(rest.trim().to_string()),
            _ => return Err(bad()),
        })
    }
}

/// An assembled instruction stream ready for execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    instrs: Vec<Instr>,
}

impl Program {
    /// Parse an ASCII stream, one op per line. Blank lines are skipped.
    pub fn assemble(text: &str) -> PolicyResult<Program> {
        let mut instrs = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            instrs.push(line.parse()?);
        }
        Ok(Program { instrs })
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in &self.instrs {
            writeln!(f, "{i}")?;
        }
        Ok(())
    }
}

/// A compiled code fragment for one target.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub target: Option<Target>,
    /// ASCII instruction stream.
    pub code: String,
    /// Subroutine name -> instruction stream, for `CALL`.
    pub subroutines: BTreeMap<String, String>,
    /// Named sets the code references (recompile triggers).
    pub referenced_sets: BTreeSet<String>,
    /// Tag ID -> is this a redistribution tag? Non-redist tags mark
    /// protocol-to-self exports the RIB must not loop back.
    pub tags: BTreeMap<u32, bool>,
}

impl Code {
    pub fn new(target: Target) -> Code {
        Code {
            target: Some(target),
            ..Default::default()
        }
    }

    /// Append another fragment for the same target.
    pub fn append(&mut self, other: &Code) {
        debug_assert_eq!(self.target, other.target);
        self.code.push_str(&other.code);
        for (k, v) in &other.subroutines {
            self.subroutines.insert(k.clone(), v.clone());
        }
        self.referenced_sets
            .extend(other.referenced_sets.iter().cloned());
        self.tags.extend(other.tags.iter());
    }

    /// Redistribution tags only (excludes protocol-to-self tags).
    pub fn redist_tags(&self) -> BTreeSet<u32> {
        self.tags
            .iter()
            .filter_map(|(tag, redist)| redist.then_some(*tag))
            .collect()
    }
}
