//! Program compilation
//!
//! A program is the union of policy rules and learned rules compiled
//! against the schema: range-restriction checks, derived-predicate
//! registration, and stratification for negation. Compilation never
//! mutates the kernel's active program; the caller swaps in the result
//! only on success.

use crate::error::{NerdError, Result};
use crate::kernel::schema::SchemaSet;
use crate::kernel::types::Rule;
use ahash::AHashMap;
use std::sync::Arc;

/// A compiled, stratified rule program
#[derive(Debug, Default)]
pub struct Program {
    /// All rules in source order
    pub rules: Vec<Rule>,
    /// Rules grouped by stratum, lowest first
    pub strata: Vec<Vec<Rule>>,
}

impl Program {
    /// Compile rules against a schema.
    ///
    /// Registers every rule head as a derived predicate, then requires
    /// every body predicate to be declared, checks range restriction,
    /// and stratifies. A negation cycle is a compile error.
    pub fn compile(rules: Vec<Rule>, schema: &mut SchemaSet) -> Result<Program> {
        // Heads first so rules may reference each other in either order.
        for rule in &rules {
            schema.register_derived(&rule.head.predicate, rule.head.arity())?;
        }

        for rule in &rules {
            if !rule.is_range_restricted() {
                return Err(NerdError::Compile(format!(
                    "rule is not range-restricted: {rule}"
                )));
            }
            for atom in &rule.body {
                if !schema.is_declared(&atom.predicate) {
                    return Err(NerdError::Compile(format!(
                        "undeclared predicate {} in body of: {rule}",
                        atom.predicate
                    )));
                }
            }
        }

        let strata = stratify(&rules)?;

        Ok(Program { rules, strata })
    }

    /// Number of strata
    pub fn stratum_count(&self) -> usize {
        self.strata.len()
    }
}

/// Assign each rule to a stratum such that a rule's negated body
/// predicates are fully computed in strictly lower strata. Iterates to a
/// fixpoint; a stratum number exceeding the predicate count means the
/// negation dependency graph is cyclic.
fn stratify(rules: &[Rule]) -> Result<Vec<Vec<Rule>>> {
    let mut stratum: AHashMap<Arc<str>, usize> = AHashMap::new();
    for rule in rules {
        stratum.entry(rule.head.predicate.clone()).or_insert(0);
    }
    let bound = stratum.len().max(1);

    let mut changed = true;
    while changed {
        changed = false;
        for rule in rules {
            let mut required = 0usize;
            for atom in &rule.body {
                let dep = stratum.get(&atom.predicate).copied().unwrap_or(0);
                let need = if atom.negated { dep + 1 } else { dep };
                required = required.max(need);
            }
            let current = stratum
                .get_mut(&rule.head.predicate)
                .expect("head registered above");
            if required > *current {
                if required > bound {
                    return Err(NerdError::Compile(format!(
                        "negation cycle through predicate {}",
                        rule.head.predicate
                    )));
                }
                *current = required;
                changed = true;
            }
        }
    }

    let max_stratum = stratum.values().copied().max().unwrap_or(0);
    let mut strata: Vec<Vec<Rule>> = vec![Vec::new(); max_stratum + 1];
    for rule in rules {
        let s = stratum[&rule.head.predicate];
        strata[s].push(rule.clone());
    }
    Ok(strata)
}
