//! Source match code generation
//!
//! The first of the two export compilation passes. It walks every
//! export policy and, for each term whose from block names a source
//! protocol, allocates a policy tag and generates code for that
//! protocol's source-match filter: test the remaining from predicates,
//! then add the tag to the route's `policytags` set.
//!
//! Tag IDs are allocated monotonically from `tagstart`. The generator
//! keeps a per-protocol running set of allocated tags, so the tag set
//! of any route stays a subset of its originating protocol's tag
//! universe. That subset property is enforced at run time by generated
//! code: every tagged term tests `policytags <= universe` with
//! `ONFALSE_EXIT` before adding its tag, and the export side repeats
//! the test before acting on the tag.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::ast::{Node, PolicyStatement};
use crate::code::{Code, FilterStage, Instr, Target};
use crate::codegen::{Emitter, TermTag};
use crate::element::{ArithOp, CmpOp, Element};
use crate::error::{PolicyError, PolicyResult};
use crate::set_map::SetMap;
use crate::varmap::{var, VarMap};

/// Result of the source match pass.
#[derive(Debug)]
pub struct SourceMatchResult {
    /// One code fragment per source protocol.
    pub codes: Vec<Code>,
    /// Per-term tag assignments, input to the export generator.
    pub term_tags: Vec<TermTag>,
    /// Tag universe per source protocol.
    pub protocol_tags: BTreeMap<String, BTreeSet<u32>>,
    /// First tag available after this compilation.
    pub next_tag: u32,
}

pub struct SourceMatchCodeGenerator<'a> {
    varmap: &'a VarMap,
    set_map: &'a SetMap,
    subroutines: &'a BTreeMap<String, String>,
    currtag: u32,
}

impl<'a> SourceMatchCodeGenerator<'a> {
    pub fn new(
        tagstart: u32,
        varmap: &'a VarMap,
        set_map: &'a SetMap,
        subroutines: &'a BTreeMap<String, String>,
    ) -> SourceMatchCodeGenerator<'a> {
        SourceMatchCodeGenerator {
            varmap,
            set_map,
            subroutines,
            currtag: tagstart,
        }
    }

    pub fn generate(mut self, policies: &[PolicyStatement]) -> PolicyResult<SourceMatchResult> {
        let mut codes: BTreeMap<String, Code> = BTreeMap::new();
        let mut term_tags = Vec::new();
        let mut protocol_tags: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();

        for policy in policies {
            for term in &policy.terms {
                let protos = term.from_protocols();
                if protos.len() > 1 {
                    return Err(PolicyError::ProtoRedefined(term.name.clone()));
                }
                let dest = term.to_protocol().ok_or_else(|| {
                    PolicyError::NoProtoSpec(format!("{} (no destination)", term.name))
                })?;

                let Some(source) = protos.first().copied() else {
                    // No source protocol: the export code evaluates the
                    // from block inline, no tag needed.
                    term_tags.push(TermTag {
                        policy: policy.name.clone(),
                        term: term.name.clone(),
                        tag: None,
                        source_protocol: None,
                        dest_protocol: dest.to_string(),
                        universe: BTreeSet::new(),
                    });
                    continue;
                };

                let tag = self.currtag;
                self.currtag += 1;
                let universe = {
                    let tags = protocol_tags.entry(source.to_string()).or_default();
                    tags.insert(tag);
                    tags.clone()
                };
                debug!(policy = %policy.name, term = %term.name, source, tag, "allocated policy tag");

                let mut em = Emitter::new(self.varmap, self.set_map, self.subroutines, source);
                em.emit(Instr::TermStart(term.name.clone()));
                for node in &term.from {
                    if matches!(node, Node::ProtocolSpec(_)) {
                        continue;
                    }
                    em.emit_expr(node)?;
                    em.emit(Instr::OnFalseExit);
                }
                // The route's tags must stay within the originating
                // protocol's universe: policytags <= universe.
                em.emit(Instr::Load(var::POLICYTAGS));
                em.emit(Instr::Push(Element::U32Set(universe.clone())));
                em.emit(Instr::Cmp(CmpOp::Le));
                em.emit(Instr::OnFalseExit);
                // policytags := policytags + tag
                em.emit(Instr::Load(var::POLICYTAGS));
                em.emit(Instr::Push(Element::U32(tag)));
                em.emit(Instr::Arith(ArithOp::Add));
                em.emit(Instr::Store(var::POLICYTAGS));
                em.emit(Instr::TermEnd);

                let code = codes.entry(source.to_string()).or_insert_with(|| {
                    Code::new(Target::new(source, FilterStage::ExportSourceMatch))
                });
                let redist = source != dest;
                code.tags.insert(tag, redist);
                *code = em.finish(std::mem::take(code));

                term_tags.push(TermTag {
                    policy: policy.name.clone(),
                    term: term.name.clone(),
                    tag: Some(tag),
                    source_protocol: Some(source.to_string()),
                    dest_protocol: dest.to_string(),
                    universe,
                });
            }
        }

        Ok(SourceMatchResult {
            codes: codes.into_values().collect(),
            term_tags,
            protocol_tags,
            next_tag: self.currtag,
        })
    }

    /// The next tag that would be allocated.
    pub fn next_tag(&self) -> u32 {
        self.currtag
    }
}
