//! Per-protocol variable maps
//!
//! Each protocol registers the variables its routes expose to policy:
//! name -> (id, element type, access). IDs at or above zero are the
//! well-known variables every protocol provides; negative IDs are
//! per-protocol extensions.

use std::collections::BTreeMap;

use crate::element::ElemType;
use crate::error::{PolicyError, PolicyResult};

/// Variable identifier used by `LOAD`/`STORE`.
pub type VarId = i32;

/// Well-known variable IDs.
pub mod var {
    use super::VarId;

    pub const POLICYTAGS: VarId = 0;
    pub const PROTOCOL: VarId = 1;
    pub const NETWORK4: VarId = 2;
    pub const NETWORK6: VarId = 3;
    pub const NEXTHOP4: VarId = 4;
    pub const NEXTHOP6: VarId = 5;
    pub const ASPATH: VarId = 6;
    pub const METRIC: VarId = 7;
    pub const LOCALPREF: VarId = 8;
    pub const MED: VarId = 9;

    /// First ID available to per-protocol extensions (extensions count
    /// downward from -1; this bound is for well-known growth).
    pub const MAX_WELL_KNOWN: VarId = 32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAccess {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct VarDef {
    pub id: VarId,
    pub elem_type: ElemType,
    pub access: VarAccess,
}

/// name -> definition, per protocol.
#[derive(Debug, Clone, Default)]
pub struct VarMap {
    protocols: BTreeMap<String, BTreeMap<String, VarDef>>,
}

impl VarMap {
    pub fn new() -> VarMap {
        VarMap::default()
    }

    /// A map pre-populated with the well-known variables for `protocol`.
    pub fn with_defaults(protocols: &[&str]) -> VarMap {
        let mut vm = VarMap::new();
        for p in protocols {
            vm.add_defaults(p);
        }
        vm
    }

    /// Register the well-known variable set for one protocol.
    pub fn add_defaults(&mut self, protocol: &str) {
        use ElemType as T;
        use VarAccess::{ReadOnly, ReadWrite};
        let defs: &[(&str, VarId, T, VarAccess)] = &[
            ("policytags", var::POLICYTAGS, T::U32Set, ReadWrite),
            ("protocol", var::PROTOCOL, T::Str, ReadOnly),
            ("network4", var::NETWORK4, T::Ipv4Net, ReadOnly),
            ("network6", var::NETWORK6, T::Ipv6Net, ReadOnly),
            ("nexthop4", var::NEXTHOP4, T::Ipv4, ReadWrite),
            ("nexthop6", var::NEXTHOP6, T::Ipv6, ReadWrite),
            ("aspath", var::ASPATH, T::AsPath, ReadWrite),
            ("metric", var::METRIC, T::U32, ReadWrite),
            ("localpref", var::LOCALPREF, T::U32, ReadWrite),
            ("med", var::MED, T::U32, ReadWrite),
        ];
        for (name, id, ty, access) in defs {
            self.add_variable(
                protocol,
                name,
                VarDef {
                    id: *id,
                    elem_type: *ty,
                    access: *access,
                },
            );
        }
    }

    pub fn add_variable(&mut self, protocol: &str, name: &str, def: VarDef) {
        self.protocols
            .entry(protocol.to_string())
            .or_default()
            .insert(name.to_string(), def);
    }

    pub fn lookup(&self, protocol: &str, name: &str) -> PolicyResult<&VarDef> {
        self.protocols
            .get(protocol)
            .and_then(|vars| vars.get(name))
            .ok_or_else(|| PolicyError::UnknownVariable(name.to_string(), protocol.to_string()))
    }

    pub fn has_protocol(&self, protocol: &str) -> bool {
        self.protocols.contains_key(protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_lookup() {
        let vm = VarMap::with_defaults(&["ospf", "bgp"]);
        let def = vm.lookup("ospf", "network4").unwrap();
        assert_eq!(def.id, var::NETWORK4);
        assert_eq!(def.elem_type, ElemType::Ipv4Net);
        assert_eq!(def.access, VarAccess::ReadOnly);

        assert!(vm.lookup("ospf", "no_such").is_err());
        assert!(vm.lookup("rip", "network4").is_err());
    }

    #[test]
    fn test_protocol_extension_negative_id() {
        let mut vm = VarMap::with_defaults(&["ospf"]);
        vm.add_variable(
            "ospf",
            "ospf-area",
            VarDef {
                id: -1,
                elem_type: ElemType::U32,
                access: VarAccess::ReadOnly,
            },
        );
        assert_eq!(vm.lookup("ospf", "ospf-area").unwrap().id, -1);
    }
}
