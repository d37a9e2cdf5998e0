//! Named set registry
//!
//! Policies reference sets (`network4 <= private-nets`) by name; the
//! registry resolves those names at compile time. Code objects record
//! which sets they referenced so a set update knows which targets to
//! recompile.

use std::collections::BTreeMap;

use crate::element::Element;
use crate::error::{PolicyError, PolicyResult};

#[derive(Debug, Clone, Default)]
pub struct SetMap {
    sets: BTreeMap<String, Element>,
}

impl SetMap {
    pub fn new() -> SetMap {
        SetMap::default()
    }

    /// Install or replace a named set. The element must be a set type.
    pub fn update_set(&mut self, name: &str, set: Element) -> PolicyResult<()> {
        match set {
            Element::U32Set(_) | Element::Ipv4NetSet(_) | Element::Ipv6NetSet(_) => {
                self.sets.insert(name.to_string(), set);
                Ok(())
            }
            other => Err(PolicyError::Execution(format!(
                "`{name}` is not a set type: {}",
                other.elem_type()
            ))),
        }
    }

    pub fn delete_set(&mut self, name: &str) -> bool {
        self.sets.remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> PolicyResult<&Element> {
        self.sets
            .get(name)
            .ok_or_else(|| PolicyError::UnknownSet(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }
}
