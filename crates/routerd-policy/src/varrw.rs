//! VarRW - the route-as-variable-map interface
//!
//! A route-like object implements [`VarRW`] to be evaluated by the VM.
//! The RIB wraps its route entries in adapters before presentation; the
//! VM only ever sees reads and writes by variable ID.

use std::collections::BTreeMap;

use crate::element::Element;
use crate::error::{PolicyError, PolicyResult};
use crate::varmap::VarId;

pub trait VarRW {
    /// Read a variable. `None` for unknown IDs, which the VM treats as
    /// a term non-match.
    fn read(&self, id: VarId) -> Option<Element>;

    /// Write a variable.
    fn write(&mut self, id: VarId, value: Element) -> PolicyResult<()>;
}

/// Map-backed VarRW for tests and standalone evaluation.
#[derive(Debug, Clone, Default)]
pub struct TestVarRW {
    values: BTreeMap<VarId, Element>,
    writes: Vec<(VarId, Element)>,
}

impl TestVarRW {
    pub fn new() -> TestVarRW {
        TestVarRW::default()
    }

    pub fn set(&mut self, id: VarId, value: Element) -> &mut Self {
        self.values.insert(id, value);
        self
    }

    pub fn get(&self, id: VarId) -> Option<&Element> {
        self.values.get(&id)
    }

    /// Every write the VM performed, in order.
    pub fn writes(&self) -> &[(VarId, Element)] {
        &self.writes
    }
}

impl VarRW for TestVarRW {
    fn read(&self, id: VarId) -> Option<Element> {
        self.values.get(&id).cloned()
    }

    fn write(&mut self, id: VarId, value: Element) -> PolicyResult<()> {
        if !self.values.contains_key(&id) {
            return Err(PolicyError::Execution(format!("write to unknown var {id}")));
        }
        self.values.insert(id, value.clone());
        self.writes.push((id, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varmap::var;

    #[test]
    fn test_read_write() {
        let mut vrw = TestVarRW::new();
        vrw.set(var::METRIC, Element::U32(10));

        assert_eq!(vrw.read(var::METRIC), Some(Element::U32(10)));
        assert_eq!(vrw.read(var::LOCALPREF), None);

        vrw.write(var::METRIC, Element::U32(20)).unwrap();
        assert_eq!(vrw.read(var::METRIC), Some(Element::U32(20)));
        assert_eq!(vrw.writes().len(), 1);

        assert!(vrw.write(var::LOCALPREF, Element::U32(1)).is_err());
    }
}
