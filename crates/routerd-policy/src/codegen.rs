//! Code generation
//!
//! Turns [`PolicyStatement`] ASTs into ASCII instruction streams.
//! Compilation is an exhaustive match over [`Node`]; there is no
//! visitor layer. The import generator compiles the full term chain for
//! one protocol; the export generator compiles destination-side terms
//! whose source membership was reduced to a policy tag by the source
//! match pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::ast::{BinOp, Node, PolicyStatement, Term};
use crate::code::{Code, FilterStage, Instr, Target};
use crate::element::Element;
use crate::error::{PolicyError, PolicyResult};
use crate::set_map::SetMap;
use crate::varmap::{var, VarAccess, VarMap};

/// Sections of a term, for statement legality checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Match,
    Action,
}

/// Emission state shared by the generators.
pub(crate) struct Emitter<'a> {
    varmap: &'a VarMap,
    set_map: &'a SetMap,
    /// Known subroutine policies: name -> compiled stream.
    subroutines: &'a BTreeMap<String, String>,
    /// Protocol whose variable map resolves names.
    protocol: String,
    out: String,
    used_sets: BTreeSet<String>,
    used_subroutines: BTreeSet<String>,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(
        varmap: &'a VarMap,
        set_map: &'a SetMap,
        subroutines: &'a BTreeMap<String, String>,
        protocol: &str,
    ) -> Emitter<'a> {
        Emitter {
            varmap,
            set_map,
            subroutines,
            protocol: protocol.to_string(),
            out: String::new(),
            used_sets: BTreeSet::new(),
            used_subroutines: BTreeSet::new(),
        }
    }

    pub(crate) fn emit(&mut self, instr: Instr) {
        writeln!(self.out, "{instr}").expect("write to string");
    }

    /// Postfix-emit an expression.
    pub(crate) fn emit_expr(&mut self, node: &Node) -> PolicyResult<()> {
        match node {
            Node::Literal(e) => self.emit(Instr::Push(e.clone())),
            Node::Var(name) => self.emit_name(name)?,
            Node::SetRef(name) => self.emit_set(name)?,
            Node::Bin { op, lhs, rhs } => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.emit(match op {
                    BinOp::Eq => Instr::Eq,
                    BinOp::Ne => Instr::Ne,
                    BinOp::Cmp(c) => Instr::Cmp(*c),
                    BinOp::Arith(a) => Instr::Arith(*a),
                });
            }
            Node::Assign { .. } | Node::ProtocolSpec(_) | Node::Accept | Node::Reject => {
                return Err(PolicyError::Execution(format!(
                    "statement {node:?} in expression position"
                )))
            }
        }
        Ok(())
    }

    /// Resolve a bare name: protocol variable, then named set, then
    /// subroutine policy.
    fn emit_name(&mut self, name: &str) -> PolicyResult<()> {
        if let Ok(def) = self.varmap.lookup(&self.protocol, name) {
            self.emit(Instr::Load(def.id));
            return Ok(());
        }
        if self.set_map.contains(name) {
            return self.emit_set(name);
        }
        if self.subroutines.contains_key(name) {
            self.used_subroutines.insert(name.to_string());
            self.emit(Instr::Call(name.to_string()));
            return Ok(());
        }
        Err(PolicyError::UnknownVariable(
            name.to_string(),
            self.protocol.clone(),
        ))
    }

    fn emit_set(&mut self, name: &str) -> PolicyResult<()> {
        let set = self.set_map.lookup(name)?.clone();
        self.used_sets.insert(name.to_string());
        self.emit(Instr::Push(set));
        Ok(())
    }

    /// Emit one statement of a term section.
    fn emit_statement(&mut self, node: &Node, section: Section) -> PolicyResult<()> {
        match (node, section) {
            (Node::ProtocolSpec(p), Section::Match) => {
                // Membership test against the originating protocol.
                self.emit(Instr::Load(var::PROTOCOL));
                self.emit(Instr::Push(Element::Str(p.clone())));
                self.emit(Instr::Eq);
                self.emit(Instr::OnFalseExit);
            }
            (Node::Accept, Section::Action) => self.emit(Instr::Accept),
            (Node::Reject, Section::Action) => self.emit(Instr::Reject),
            (Node::Assign { var, value }, Section::Action) => {
                let def = self.varmap.lookup(&self.protocol, var)?;
                if def.access != VarAccess::ReadWrite {
                    return Err(PolicyError::ReadOnlyVariable(var.clone()));
                }
                let id = def.id;
                self.emit_expr(value)?;
                self.emit(Instr::Store(id));
            }
            (expr, Section::Match) => {
                self.emit_expr(expr)?;
                self.emit(Instr::OnFalseExit);
            }
            (node, Section::Action) => {
                return Err(PolicyError::Execution(format!(
                    "predicate {node:?} in action section"
                )))
            }
        }
        Ok(())
    }

    /// Emit the match sections and actions of one term. `skip_from`
    /// omits the whole from block - used for export terms whose source
    /// membership was already reduced to a policy tag.
    pub(crate) fn emit_term_body(&mut self, term: &Term, skip_from: bool) -> PolicyResult<()> {
        if !skip_from {
            for node in &term.from {
                self.emit_statement(node, Section::Match)?;
            }
        }
        for node in &term.to {
            if matches!(node, Node::ProtocolSpec(_)) {
                // Destination protocol selects the code target; nothing
                // to test at run time.
                continue;
            }
            self.emit_statement(node, Section::Match)?;
        }
        for node in &term.then {
            self.emit_statement(node, Section::Action)?;
        }
        Ok(())
    }

    pub(crate) fn finish(self, mut code: Code) -> Code {
        code.code.push_str(&self.out);
        code.referenced_sets.extend(self.used_sets);
        for name in &self.used_subroutines {
            if let Some(stream) = self.subroutines.get(name) {
                code.subroutines.insert(name.clone(), stream.clone());
            }
        }
        code
    }
}

/// Compile a subroutine policy body to a bare stream (no code target).
pub(crate) fn compile_subroutine(
    policy: &PolicyStatement,
    varmap: &VarMap,
    set_map: &SetMap,
    protocol: &str,
) -> PolicyResult<String> {
    let empty = BTreeMap::new();
    let mut em = Emitter::new(varmap, set_map, &empty, protocol);
    for term in &policy.terms {
        em.emit(Instr::TermStart(policy.name.clone()));
        em.emit_term_body(term, false)?;
        em.emit(Instr::TermEnd);
    }
    // A subroutine falling through rejects: callers test for an
    // explicit accept.
    em.emit(Instr::Reject);
    Ok(em.out)
}

/// Compile the import filter chain for one protocol.
pub fn compile_import(
    policies: &[PolicyStatement],
    varmap: &VarMap,
    set_map: &SetMap,
    subroutines: &BTreeMap<String, String>,
    protocol: &str,
) -> PolicyResult<Code> {
    let mut code = Code::new(Target::new(protocol, FilterStage::Import));
    for policy in policies {
        let mut em = Emitter::new(varmap, set_map, subroutines, protocol);
        em.emit(Instr::PolicyStart(policy.name.clone()));
        for term in &policy.terms {
            em.emit(Instr::TermStart(term.name.clone()));
            em.emit_term_body(term, false)?;
            em.emit(Instr::TermEnd);
        }
        em.emit(Instr::PolicyEnd);
        code = em.finish(code);
    }
    Ok(code)
}

/// What the source match pass learned about one term.
#[derive(Debug, Clone)]
pub struct TermTag {
    pub policy: String,
    pub term: String,
    /// Allocated tag, when the from block referenced another protocol.
    pub tag: Option<u32>,
    pub source_protocol: Option<String>,
    pub dest_protocol: String,
    /// The source protocol's tag universe when the tag was allocated.
    pub universe: BTreeSet<u32>,
}

/// Compile the export-side code, one [`Code`] per destination protocol.
///
/// Terms whose source membership was tagged test the tag; untagged
/// terms evaluate their from block inline.
pub fn compile_export(
    policies: &[PolicyStatement],
    term_tags: &[TermTag],
    varmap: &VarMap,
    set_map: &SetMap,
    subroutines: &BTreeMap<String, String>,
) -> PolicyResult<Vec<Code>> {
    let mut by_dest: BTreeMap<String, Code> = BTreeMap::new();

    for policy in policies {
        for term in &policy.terms {
            let info = term_tags
                .iter()
                .find(|t| t.policy == policy.name && t.term == term.name)
                .ok_or_else(|| {
                    PolicyError::Execution(format!(
                        "term `{}` missing from source match results",
                        term.name
                    ))
                })?;

            let dest = info.dest_protocol.clone();
            let mut em = Emitter::new(varmap, set_map, subroutines, &dest);
            em.emit(Instr::TermStart(term.name.clone()));
            if let Some(tag) = info.tag {
                // Route must carry this term's source tag...
                em.emit(Instr::Load(var::POLICYTAGS));
                em.emit(Instr::Push(Element::U32(tag)));
                em.emit(Instr::Cmp(crate::element::CmpOp::Le));
                em.emit(Instr::OnFalseExit);
                // ...and no tags outside the source protocol's
                // universe: policytags <= universe.
                em.emit(Instr::Load(var::POLICYTAGS));
                em.emit(Instr::Push(Element::U32Set(info.universe.clone())));
                em.emit(Instr::Cmp(crate::element::CmpOp::Le));
                em.emit(Instr::OnFalseExit);
                em.emit_term_body(term, true)?;
            } else {
                em.emit_term_body(term, false)?;
            }
            em.emit(Instr::TermEnd);

            let code = by_dest
                .entry(dest.clone())
                .or_insert_with(|| Code::new(Target::new(&dest, FilterStage::Export)));
            if let Some(tag) = info.tag {
                let redist = info.source_protocol.as_deref() != Some(dest.as_str());
                code.tags.insert(tag, redist);
            }
            *code = em.finish(std::mem::take(code));
        }
    }

    Ok(by_dest.into_values().collect())
}
