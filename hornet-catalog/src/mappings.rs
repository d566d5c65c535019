//! Statement-parameter to procedure-parameter mappings.
//!
//! The query-estimate conflict checker compares the concrete values bound to
//! primary-key predicates. Those values live in the procedure's parameter
//! set; this table records, per statement invocation, which procedure
//! parameter (and array offset, for array-typed parameters) feeds each
//! statement parameter.

use hashbrown::HashMap;

use hornet_common::ids::StmtId;

/// One statement-parameter binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterMapping {
    /// The mapped statement.
    pub stmt: StmtId,
    /// Which invocation of the statement inside the procedure this mapping
    /// applies to; `None` applies to every invocation.
    pub stmt_counter: Option<u32>,
    /// Position inside the statement's parameter list.
    pub stmt_param: usize,
    /// Position inside the procedure's parameter list.
    pub proc_param: usize,
    /// Offset into the procedure parameter when it is array-typed.
    pub array_offset: Option<usize>,
}

/// Lookup table over all declared mappings.
#[derive(Debug, Default)]
pub struct ParameterMappings {
    by_param: HashMap<(StmtId, usize), Vec<ParameterMapping>>,
}

impl ParameterMappings {
    /// Registers one mapping.
    pub fn insert(&mut self, mapping: ParameterMapping) {
        self.by_param
            .entry((mapping.stmt, mapping.stmt_param))
            .or_default()
            .push(mapping);
    }

    /// Resolves the mapping for a statement parameter at a concrete
    /// statement invocation.
    ///
    /// An exact counter match wins; a counter-agnostic mapping is the
    /// fallback.
    #[must_use]
    pub fn resolve(
        &self,
        stmt: StmtId,
        stmt_counter: u32,
        stmt_param: usize,
    ) -> Option<&ParameterMapping> {
        let candidates = self.by_param.get(&(stmt, stmt_param))?;
        candidates
            .iter()
            .find(|mapping| mapping.stmt_counter == Some(stmt_counter))
            .or_else(|| {
                candidates
                    .iter()
                    .find(|mapping| mapping.stmt_counter.is_none())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{ParameterMapping, ParameterMappings};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn exact_counter_match_beats_counter_agnostic() {
        let mut mappings = ParameterMappings::default();
        mappings.insert(ParameterMapping {
            stmt: 1,
            stmt_counter: None,
            stmt_param: 0,
            proc_param: 5,
            array_offset: None,
        });
        mappings.insert(ParameterMapping {
            stmt: 1,
            stmt_counter: Some(2),
            stmt_param: 0,
            proc_param: 7,
            array_offset: Some(2),
        });

        let exact = mappings.resolve(1, 2, 0).expect("mapping must resolve");
        assert_that!(exact.proc_param, eq(7_usize));
        let fallback = mappings.resolve(1, 0, 0).expect("mapping must resolve");
        assert_that!(fallback.proc_param, eq(5_usize));
    }

    #[rstest]
    fn unknown_parameter_resolves_to_none() {
        let mappings = ParameterMappings::default();
        assert_that!(mappings.resolve(9, 0, 0).is_none(), eq(true));
    }
}
