//! Compiled filter holder
//!
//! One [`PolicyFilter`] per (protocol, stage). Reconfiguration is
//! transactional: a stream that fails to assemble leaves the running
//! program untouched, so a bad configuration push never interrupts
//! route flow.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::code::{Code, Program};
use crate::error::PolicyResult;
use crate::varrw::VarRW;
use crate::vm::{Outcome, StackVm};

#[derive(Default)]
pub struct PolicyFilter {
    program: Program,
    subroutines: BTreeMap<String, Program>,
    /// Tag table from the installed code (tag -> is-redist).
    tags: BTreeMap<u32, bool>,
}

impl PolicyFilter {
    pub fn new() -> PolicyFilter {
        PolicyFilter::default()
    }

    /// Install a new code object. On assembly failure the previous
    /// program is retained and the error returned.
    pub fn configure(&mut self, code: &Code) -> PolicyResult<()> {
        let program = match Program::assemble(&code.code) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "filter configuration rejected, retaining previous program");
                return Err(e);
            }
        };
        let mut subroutines = BTreeMap::new();
        for (name, stream) in &code.subroutines {
            match Program::assemble(stream) {
                Ok(p) => {
                    subroutines.insert(name.clone(), p);
                }
                Err(e) => {
                    warn!(subroutine = %name, error = %e, "filter configuration rejected");
                    return Err(e);
                }
            }
        }
        self.program = program;
        self.subroutines = subroutines;
        self.tags = code.tags.clone();
        Ok(())
    }

    /// Remove the installed program; routes flow unfiltered (accept).
    pub fn reset(&mut self) {
        *self = PolicyFilter::default();
    }

    pub fn is_configured(&self) -> bool {
        !self.program.is_empty()
    }

    /// Evaluate a route. An unconfigured filter accepts.
    pub fn acceptance(&self, varrw: &mut dyn VarRW) -> PolicyResult<Outcome> {
        if self.program.is_empty() {
            return Ok(Outcome::Accept);
        }
        StackVm::new(&self.subroutines).run(&self.program, varrw)
    }

    /// Redistribution tags of the installed code.
    pub fn redist_tags(&self) -> BTreeSet<u32> {
        self.tags
            .iter()
            .filter_map(|(t, redist)| redist.then_some(*t))
            .collect()
    }

    /// Is `tag` marked non-redistributable (protocol-to-self export)?
    pub fn is_non_redist_tag(&self, tag: u32) -> bool {
        self.tags.get(&tag) == Some(&false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{FilterStage, Target};
    use crate::element::Element;
    use crate::varmap::var;
    use crate::varrw::TestVarRW;

    fn code(text: &str) -> Code {
        let mut c = Code::new(Target::new("bgp", FilterStage::Import));
        c.code = text.to_string();
        c
    }

    fn route() -> TestVarRW {
        let mut vrw = TestVarRW::new();
        vrw.set(var::METRIC, Element::U32(10));
        vrw
    }

    #[test]
    fn test_unconfigured_accepts() {
        let filter = PolicyFilter::new();
        assert_eq!(filter.acceptance(&mut route()).unwrap(), Outcome::Accept);
    }

    #[test]
    fn test_configure_and_run() {
        let mut filter = PolicyFilter::new();
        filter
            .configure(&code(
                "POLICY_START p\nTERM_START t\nREJECT\nTERM_END\nPOLICY_END\n",
            ))
            .unwrap();
        assert_eq!(filter.acceptance(&mut route()).unwrap(), Outcome::Reject);
    }

    #[test]
    fn test_bad_configure_retains_previous() {
        let mut filter = PolicyFilter::new();
        filter
            .configure(&code(
                "POLICY_START p\nTERM_START t\nREJECT\nTERM_END\nPOLICY_END\n",
            ))
            .unwrap();

        // Malformed stream: the old program must stay in force.
        assert!(filter.configure(&code("FROB 1\n")).is_err());
        assert_eq!(filter.acceptance(&mut route()).unwrap(), Outcome::Reject);
    }

}
