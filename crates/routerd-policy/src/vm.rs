//! The policy stack VM
//!
//! Executes an assembled [`Program`] against a route presented as a
//! [`VarRW`]. The instruction set has no backward branches, so every
//! program terminates in at most `instrs * call-depth` steps.
//!
//! # Term semantics
//!
//! Writes are buffered per term and flushed when the term completes
//! (`TERM_END`, `NEXT_TERM`, `NEXT_POLICY`) or the policy accepts. A
//! failed predicate (`ONFALSE_EXIT` on false) or a runtime type
//! mismatch abandons the term: the buffer is discarded and the route
//! flows on unmodified by that term. A policy that runs to completion
//! without an explicit outcome accepts.

use std::collections::BTreeMap;

use tracing::trace;

use crate::code::{Instr, Program};
use crate::element::Element;
use crate::error::{PolicyError, PolicyResult};
use crate::varmap::VarId;
use crate::varrw::VarRW;

/// Final disposition of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Reject,
}

/// `CALL` recursion bound; generated code never nests this deep.
const MAX_CALL_DEPTH: usize = 16;

pub struct StackVm<'a> {
    subroutines: &'a BTreeMap<String, Program>,
}

impl<'a> StackVm<'a> {
    pub fn new(subroutines: &'a BTreeMap<String, Program>) -> StackVm<'a> {
        StackVm { subroutines }
    }

    /// Run `program` to an outcome, applying accepted modifications to
    /// `varrw`.
    pub fn run(&self, program: &Program, varrw: &mut dyn VarRW) -> PolicyResult<Outcome> {
        self.run_depth(program, varrw, 0)
    }

    fn run_depth(
        &self,
        program: &Program,
        varrw: &mut dyn VarRW,
        depth: usize,
    ) -> PolicyResult<Outcome> {
        if depth > MAX_CALL_DEPTH {
            return Err(PolicyError::Execution("CALL depth exceeded".into()));
        }

        let instrs = program.instrs();
        let mut stack: Vec<Element> = Vec::new();
        let mut writes: Vec<(VarId, Element)> = Vec::new();
        let mut pc = 0usize;

        while pc < instrs.len() {
            let instr = &instrs[pc];
            pc += 1;
            match instr {
                Instr::PolicyStart(_) | Instr::PolicyEnd => {
                    stack.clear();
                }
                Instr::TermStart(name) => {
                    trace!(term = %name, "term start");
                    stack.clear();
                    writes.clear();
                }
                Instr::TermEnd => {
                    flush(varrw, &mut writes)?;
                    stack.clear();
                }
                Instr::NextTerm => {
                    flush(varrw, &mut writes)?;
                    pc = skip_to_term_end(instrs, pc);
                }
                Instr::NextPolicy => {
                    flush(varrw, &mut writes)?;
                    pc = skip_to_policy_end(instrs, pc);
                }
                Instr::Accept => {
                    flush(varrw, &mut writes)?;
                    return Ok(Outcome::Accept);
                }
                Instr::Reject => {
                    // Route is dropped; buffered writes die with it.
                    return Ok(Outcome::Reject);
                }
                Instr::Push(e) => stack.push(e.clone()),
                Instr::Load(id) => match read(varrw, &writes, *id) {
                    Some(e) => stack.push(e),
                    None => {
                        // Unknown variable: the term cannot match.
                        pc = fail_term(instrs, pc, &mut stack, &mut writes);
                    }
                },
                Instr::Store(id) => {
                    let value = pop(&mut stack)?;
                    writes.push((*id, value));
                }
                Instr::OnFalseExit => {
                    let cond = pop(&mut stack)?;
                    match cond.as_bool() {
                        Some(true) => {}
                        _ => {
                            pc = fail_term(instrs, pc, &mut stack, &mut writes);
                        }
                    }
                }
                Instr::Eq | Instr::Ne | Instr::Cmp(_) | Instr::Arith(_) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    let result = match instr {
                        Instr::Eq => lhs.op_eq(&rhs).map(Element::Bool),
                        Instr::Ne => lhs.op_eq(&rhs).map(|b| Element::Bool(!b)),
                        Instr::Cmp(op) => lhs.op_cmp(*op, &rhs).map(Element::Bool),
                        Instr::Arith(op) => lhs.op_arith(*op, &rhs),
                        _ => unreachable!(),
                    };
                    match result {
                        Ok(value) => stack.push(value),
                        Err(PolicyError::TypeMismatch { op, lhs, rhs }) => {
                            trace!(op, lhs, rhs, "type mismatch fails term");
                            pc = fail_term(instrs, pc, &mut stack, &mut writes);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Instr::Call(name) => {
                    let sub = self
                        .subroutines
                        .get(name)
                        .ok_or_else(|| PolicyError::UnknownSubroutine(name.clone()))?;
                    let outcome = self.run_depth(sub, varrw, depth + 1)?;
                    stack.push(Element::Bool(outcome == Outcome::Accept));
                }
            }
        }

        // Ran off the end without an explicit outcome.
        flush(varrw, &mut writes)?;
        Ok(Outcome::Accept)
    }

}

/// Abandon the current term: discard its writes and resume after its
/// `TERM_END`.
fn fail_term(
    instrs: &[Instr],
    pc: usize,
    stack: &mut Vec<Element>,
    writes: &mut Vec<(VarId, Element)>,
) -> usize {
    writes.clear();
    stack.clear();
    skip_to_term_end(instrs, pc)
}

fn pop(stack: &mut Vec<Element>) -> PolicyResult<Element> {
    stack
        .pop()
        .ok_or_else(|| PolicyError::Execution("stack underflow".into()))
}

fn read(varrw: &dyn VarRW, writes: &[(VarId, Element)], id: VarId) -> Option<Element> {
    // A read inside a term sees the term's own earlier writes.
    writes
        .iter()
        .rev()
        .find(|(wid, _)| *wid == id)
        .map(|(_, e)| e.clone())
        .or_else(|| varrw.read(id))
}

fn flush(varrw: &mut dyn VarRW, writes: &mut Vec<(VarId, Element)>) -> PolicyResult<()> {
    for (id, value) in writes.drain(..) {
        varrw.write(id, value)?;
    }
    Ok(())
}

/// Position just past the next `TERM_END` (or the end of the stream).
fn skip_to_term_end(instrs: &[Instr], mut pc: usize) -> usize {
    while pc < instrs.len() {
        pc += 1;
        if matches!(instrs[pc - 1], Instr::TermEnd) {
            return pc;
        }
    }
    pc
}

/// Position just past the next `POLICY_END` (or the end of the stream).
fn skip_to_policy_end(instrs: &[Instr], mut pc: usize) -> usize {
    while pc < instrs.len() {
        pc += 1;
        if matches!(instrs[pc - 1], Instr::PolicyEnd) {
            return pc;
        }
    }
    pc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElemType;
    use crate::varmap::var;
    use crate::varrw::TestVarRW;

    fn route() -> TestVarRW {
        let mut vrw = TestVarRW::new();
        vrw.set(var::METRIC, Element::U32(10))
            .set(var::LOCALPREF, Element::U32(100))
            .set(
                var::NETWORK4,
                Element::parse(ElemType::Ipv4Net, "10.3.0.0/16").unwrap(),
            )
            .set(
                var::POLICYTAGS,
                Element::parse(ElemType::U32Set, "{}").unwrap(),
            );
        vrw
    }

    fn run(text: &str, vrw: &mut TestVarRW) -> Outcome {
        let program = Program::assemble(text).unwrap();
        let subs = BTreeMap::new();
        StackVm::new(&subs).run(&program, vrw).unwrap()
    }

    #[test]
    fn test_accept_with_assignment() {
        let mut vrw = route();
        let outcome = run(
            "POLICY_START p\n\
             TERM_START t\n\
             PUSH u32 200\n\
             STORE 8\n\
             ACCEPT\n\
             TERM_END\n\
             POLICY_END\n",
            &mut vrw,
        );
        assert_eq!(outcome, Outcome::Accept);
        assert_eq!(vrw.get(var::LOCALPREF), Some(&Element::U32(200)));
    }

    #[test]
    fn test_onfalse_exit_skips_term() {
        let mut vrw = route();
        let outcome = run(
            "POLICY_START p\n\
             TERM_START t1\n\
             LOAD 7\n\
             PUSH u32 99\n\
             ==\n\
             ONFALSE_EXIT\n\
             PUSH u32 1\n\
             STORE 8\n\
             REJECT\n\
             TERM_END\n\
             TERM_START t2\n\
             ACCEPT\n\
             TERM_END\n\
             POLICY_END\n",
            &mut vrw,
        );
        assert_eq!(outcome, Outcome::Accept);
        // t1 failed its predicate: its store never landed.
        assert_eq!(vrw.get(var::LOCALPREF), Some(&Element::U32(100)));
    }

    #[test]
    fn test_default_accept() {
        let mut vrw = route();
        let outcome = run(
            "POLICY_START p\n\
             TERM_START t\n\
             LOAD 7\n\
             PUSH u32 99\n\
             ==\n\
             ONFALSE_EXIT\n\
             REJECT\n\
             TERM_END\n\
             POLICY_END\n",
            &mut vrw,
        );
        assert_eq!(outcome, Outcome::Accept);
    }

    #[test]
    fn test_type_mismatch_fails_term_only() {
        let mut vrw = route();
        let outcome = run(
            "POLICY_START p\n\
             TERM_START t1\n\
             PUSH u32 5\n\
             STORE 8\n\
             LOAD 7\n\
             PUSH str oops\n\
             +\n\
             ONFALSE_EXIT\n\
             REJECT\n\
             TERM_END\n\
             TERM_START t2\n\
             ACCEPT\n\
             TERM_END\n\
             POLICY_END\n",
            &mut vrw,
        );
        assert_eq!(outcome, Outcome::Accept);
        // The mismatching term's earlier store was discarded.
        assert_eq!(vrw.get(var::LOCALPREF), Some(&Element::U32(100)));
    }

    #[test]
    fn test_term_reads_own_writes() {
        let mut vrw = route();
        run(
            "POLICY_START p\n\
             TERM_START t\n\
             PUSH u32 200\n\
             STORE 8\n\
             LOAD 8\n\
             PUSH u32 1\n\
             +\n\
             STORE 8\n\
             ACCEPT\n\
             TERM_END\n\
             POLICY_END\n",
            &mut vrw,
        );
        assert_eq!(vrw.get(var::LOCALPREF), Some(&Element::U32(201)));
    }

    #[test]
    fn test_tag_insert_flow() {
        // Source-match tagging shape: policytags := policytags + tag.
        let mut vrw = route();
        run(
            "POLICY_START sm\n\
             TERM_START t\n\
             LOAD 0\n\
             PUSH u32 42\n\
             +\n\
             STORE 0\n\
             TERM_END\n\
             POLICY_END\n",
            &mut vrw,
        );
        assert_eq!(
            vrw.get(var::POLICYTAGS),
            Some(&Element::parse(ElemType::U32Set, "{42}").unwrap())
        );
    }

    #[test]
    fn test_next_policy_skips() {
        let mut vrw = route();
        let outcome = run(
            "POLICY_START p1\n\
             TERM_START t\n\
             NEXT_POLICY\n\
             REJECT\n\
             TERM_END\n\
             TERM_START unreached\n\
             REJECT\n\
             TERM_END\n\
             POLICY_END\n\
             POLICY_START p2\n\
             TERM_START t\n\
             ACCEPT\n\
             TERM_END\n\
             POLICY_END\n",
            &mut vrw,
        );
        assert_eq!(outcome, Outcome::Accept);
    }

    #[test]
    fn test_call_subroutine() {
        let mut subs = BTreeMap::new();
        subs.insert(
            "is-small".to_string(),
            Program::assemble(
                "TERM_START sub\n\
                 LOAD 7\n\
                 PUSH u32 100\n\
                 <\n\
                 ONFALSE_EXIT\n\
                 ACCEPT\n\
                 TERM_END\n\
                 REJECT\n",
            )
            .unwrap(),
        );
        let program = Program::assemble(
            "POLICY_START p\n\
             TERM_START t\n\
             CALL is-small\n\
             ONFALSE_EXIT\n\
             REJECT\n\
             TERM_END\n\
             POLICY_END\n",
        )
        .unwrap();

        let mut vrw = route();
        let outcome = StackVm::new(&subs).run(&program, &mut vrw).unwrap();
        // metric 10 < 100: subroutine accepts, so the term rejects.
        assert_eq!(outcome, Outcome::Reject);
    }

    #[test]
    fn test_unknown_subroutine_errors() {
        let program = Program::assemble("CALL nope\n").unwrap();
        let subs = BTreeMap::new();
        let mut vrw = route();
        let err = StackVm::new(&subs).run(&program, &mut vrw).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownSubroutine(_)));
    }
}
