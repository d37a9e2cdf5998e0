//! Top-level compilation pipeline
//!
//! Takes parsed policy statements plus the variable and set maps and
//! produces [`Code`] objects for every affected (protocol, stage)
//! target. Export compilation is the two-pass flow: source match
//! (tag allocation) feeding the export generator.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::ast::PolicyStatement;
use crate::code::Code;
use crate::codegen::{self, compile_subroutine};
use crate::error::PolicyResult;
use crate::set_map::SetMap;
use crate::varmap::VarMap;

/// Everything export compilation produced.
pub struct ExportCompilation {
    /// Source-match code, one per source protocol.
    pub source_match: Vec<Code>,
    /// Export code, one per destination protocol.
    pub export: Vec<Code>,
    /// Tag universe per source protocol. The same universes are
    /// embedded in the generated subset checks.
    pub protocol_tags: BTreeMap<String, BTreeSet<u32>>,
    /// First tag free after this compilation.
    pub next_tag: u32,
}

pub struct PolicyCompiler<'a> {
    varmap: &'a VarMap,
    set_map: &'a SetMap,
}

impl<'a> PolicyCompiler<'a> {
    pub fn new(varmap: &'a VarMap, set_map: &'a SetMap) -> PolicyCompiler<'a> {
        PolicyCompiler { varmap, set_map }
    }

    /// Compile subroutine bodies (bare policies) for `CALL` resolution.
    /// Subroutine variables resolve against `protocol`'s map.
    pub fn compile_subroutines(
        &self,
        policies: &[PolicyStatement],
        protocol: &str,
    ) -> PolicyResult<BTreeMap<String, String>> {
        let mut subs = BTreeMap::new();
        for p in policies.iter().filter(|p| p.is_subroutine()) {
            subs.insert(
                p.name.clone(),
                compile_subroutine(p, self.varmap, self.set_map, protocol)?,
            );
        }
        Ok(subs)
    }

    /// Compile the import filter for one protocol. Subroutine policies
    /// in `policies` compile into the code's subroutine table; the rest
    /// compile in order into the instruction stream.
    pub fn compile_import(&self, policies: &[PolicyStatement], protocol: &str) -> PolicyResult<Code> {
        let subs = self.compile_subroutines(policies, protocol)?;
        let main: Vec<PolicyStatement> = policies
            .iter()
            .filter(|p| !p.is_subroutine())
            .cloned()
            .collect();
        let code = codegen::compile_import(&main, self.varmap, self.set_map, &subs, protocol)?;
        info!(protocol, policies = main.len(), "compiled import filter");
        Ok(code)
    }

    /// Two-pass export compilation. `tagstart` is the first tag ID this
    /// run may allocate; callers thread `next_tag` through successive
    /// compilations to keep IDs unique for the process lifetime.
    pub fn compile_export(
        &self,
        policies: &[PolicyStatement],
        tagstart: u32,
    ) -> PolicyResult<ExportCompilation> {
        let main: Vec<PolicyStatement> = policies
            .iter()
            .filter(|p| !p.is_subroutine())
            .cloned()
            .collect();

        // Subroutines in export code resolve per destination protocol;
        // compile them lazily against each dest in pass 2. The source
        // match pass only needs their names.
        let mut sub_names = BTreeMap::new();
        for p in policies.iter().filter(|p| p.is_subroutine()) {
            sub_names.insert(p.name.clone(), String::new());
        }

        let sm = crate::source_match::SourceMatchCodeGenerator::new(
            tagstart,
            self.varmap,
            self.set_map,
            &sub_names,
        )
        .generate(&main)?;

        // Pass 2: per-destination export code. Compile subroutines for
        // each destination protocol that appears.
        let dests: BTreeSet<String> = sm
            .term_tags
            .iter()
            .map(|t| t.dest_protocol.clone())
            .collect();
        let mut subs = BTreeMap::new();
        for dest in &dests {
            for p in policies.iter().filter(|p| p.is_subroutine()) {
                subs.insert(
                    p.name.clone(),
                    compile_subroutine(p, self.varmap, self.set_map, dest)?,
                );
            }
        }

        let export =
            codegen::compile_export(&main, &sm.term_tags, self.varmap, self.set_map, &subs)?;
        info!(
            tags = sm.next_tag - tagstart,
            source_targets = sm.codes.len(),
            export_targets = export.len(),
            "compiled export filters"
        );

        Ok(ExportCompilation {
            source_match: sm.codes,
            export,
            protocol_tags: sm.protocol_tags,
            next_tag: sm.next_tag,
        })
    }
}
