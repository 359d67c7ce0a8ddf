//! Semi-naive bottom-up evaluation
//!
//! Evaluates a compiled program to fixpoint over a base fact store,
//! stratum by stratum:
//!
//! 1. **Delta tracking**: each iteration only joins through facts that
//!    were new in the previous iteration
//! 2. **Indexing**: per-predicate and (predicate, first-arg) indexes
//! 3. **Negation**: negated atoms are checked against the accumulated
//!    facts of lower strata, which stratification guarantees are final
//! 4. **Parallel application**: rules within a stratum may be applied in
//!    parallel with rayon

use crate::error::{NerdError, Result};
use crate::kernel::program::Program;
use crate::kernel::store::FactStore;
use crate::kernel::types::{Atom, Fact, Rule, Substitution, Term, Value};
use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use std::sync::Arc;

/// Index for fast fact lookups during evaluation
#[derive(Debug, Default)]
struct FactIndex {
    by_predicate: AHashMap<Arc<str>, Vec<Fact>>,
    by_first_arg: AHashMap<(Arc<str>, Value), Vec<Fact>>,
}

impl FactIndex {
    fn new() -> Self {
        Self::default()
    }

    fn index_fact(&mut self, fact: &Fact) {
        self.by_predicate
            .entry(fact.predicate.clone())
            .or_default()
            .push(fact.clone());
        if let Some(first) = fact.args.first() {
            self.by_first_arg
                .entry((fact.predicate.clone(), first.clone()))
                .or_default()
                .push(fact.clone());
        }
    }

    fn lookup(&self, atom: &Atom) -> &[Fact] {
        if let Some(Term::Constant(v)) = atom.terms.first() {
            if let Some(facts) = self
                .by_first_arg
                .get(&(atom.predicate.clone(), v.clone()))
            {
                return facts;
            }
            // constant first arg with no index entry matches nothing
            return &[];
        }
        self.by_predicate
            .get(&atom.predicate)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn any_match(&self, atom: &Atom) -> bool {
        self.lookup(atom)
            .iter()
            .any(|fact| match_atom(atom, fact).is_some())
    }
}

/// Match a (possibly partially-ground) atom against a ground fact. `_`
/// matches anything without binding; repeated `_` need not agree.
fn match_atom(atom: &Atom, fact: &Fact) -> Option<Substitution> {
    if atom.predicate != fact.predicate || atom.terms.len() != fact.args.len() {
        return None;
    }
    let mut sub = Substitution::new();
    for (term, arg) in atom.terms.iter().zip(fact.args.iter()) {
        match term {
            Term::Variable(v) if v == "_" => {}
            Term::Variable(v) => {
                if let Some(bound) = sub.get(v) {
                    if bound != arg {
                        return None;
                    }
                } else {
                    sub.bind(v.clone(), arg.clone());
                }
            }
            Term::Constant(c) => {
                if !c.coerces_equal(arg) {
                    return None;
                }
            }
        }
    }
    Some(sub)
}

/// Semi-naive evaluator over a compiled program
pub struct Evaluator {
    parallel: bool,
    max_iterations: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator {
            parallel: true,
            max_iterations: 10_000,
        }
    }
}

impl Evaluator {
    /// Create an evaluator; `parallel` enables rayon rule application
    pub fn new(parallel: bool) -> Self {
        Evaluator {
            parallel,
            ..Default::default()
        }
    }

    /// Run the program to fixpoint over `base`, returning the derived
    /// facts (base facts are not repeated in the result).
    pub fn evaluate(&self, program: &Program, base: &FactStore) -> Result<FactStore> {
        let mut accumulated: AHashSet<Fact> = base.iter().cloned().collect();
        let mut derived = FactStore::new();

        for stratum in &program.strata {
            self.evaluate_stratum(stratum, &mut accumulated, &mut derived)?;
        }

        Ok(derived)
    }

    fn evaluate_stratum(
        &self,
        rules: &[Rule],
        accumulated: &mut AHashSet<Fact>,
        derived: &mut FactStore,
    ) -> Result<()> {
        let (fact_rules, derivation_rules): (Vec<_>, Vec<_>) =
            rules.iter().partition(|r| r.is_fact());

        let mut index = FactIndex::new();
        for fact in accumulated.iter() {
            index.index_fact(fact);
        }

        let mut delta: Vec<Fact> = Vec::new();

        // bodiless rules contribute their heads immediately
        for rule in &fact_rules {
            if let Some(fact) = rule.head.to_fact() {
                if accumulated.insert(fact.clone()) {
                    index.index_fact(&fact);
                    derived.insert(fact.clone());
                    delta.push(fact);
                }
            }
        }

        if derivation_rules.is_empty() {
            return Ok(());
        }

        // first round is naive: every atom may read the full index
        let first = self.apply_rules(&derivation_rules, &index, None);
        for fact in first {
            if accumulated.insert(fact.clone()) {
                index.index_fact(&fact);
                derived.insert(fact.clone());
                delta.push(fact);
            }
        }

        for _ in 0..self.max_iterations {
            if delta.is_empty() {
                return Ok(());
            }
            let mut delta_index = FactIndex::new();
            for fact in &delta {
                delta_index.index_fact(fact);
            }

            let produced = self.apply_rules(&derivation_rules, &index, Some(&delta_index));

            let mut next_delta = Vec::new();
            for fact in produced {
                if accumulated.insert(fact.clone()) {
                    index.index_fact(&fact);
                    derived.insert(fact.clone());
                    next_delta.push(fact);
                }
            }
            delta = next_delta;
        }

        Err(NerdError::Compile(format!(
            "fixpoint did not converge within {} iterations",
            self.max_iterations
        )))
    }

    fn apply_rules(
        &self,
        rules: &[&Rule],
        index: &FactIndex,
        delta: Option<&FactIndex>,
    ) -> Vec<Fact> {
        if self.parallel && rules.len() > 1 {
            rules
                .par_iter()
                .map(|rule| apply_single_rule(rule, index, delta))
                .reduce(Vec::new, |mut a, b| {
                    a.extend(b);
                    a
                })
        } else {
            let mut out = Vec::new();
            for rule in rules {
                out.extend(apply_single_rule(rule, index, delta));
            }
            out
        }
    }
}

/// Apply one rule. With a delta index, each positive body position takes
/// a turn reading the delta while the others read the full index, which
/// is the semi-naive restriction to derivations that involve at least
/// one new fact.
fn apply_single_rule(rule: &Rule, index: &FactIndex, delta: Option<&FactIndex>) -> Vec<Fact> {
    let positives: Vec<&Atom> = rule.body.iter().filter(|a| !a.negated).collect();
    let negatives: Vec<&Atom> = rule.body.iter().filter(|a| a.negated).collect();

    if positives.is_empty() {
        // purely negative bodies are rejected before compile; nothing to do
        return Vec::new();
    }

    let delta_positions: Vec<Option<usize>> = match delta {
        Some(_) => (0..positives.len()).map(Some).collect(),
        None => vec![None],
    };

    let mut results = Vec::new();
    for delta_pos in delta_positions {
        let mut substitutions = vec![Substitution::new()];

        for (pos, atom) in positives.iter().enumerate() {
            let use_delta = delta_pos == Some(pos);
            let source = if use_delta {
                delta.expect("delta position implies delta index")
            } else {
                index
            };

            let mut next = Vec::new();
            for sub in &substitutions {
                let partial = atom.apply_substitution(sub);
                for fact in source.lookup(&partial) {
                    if let Some(new_sub) = match_atom(&partial, fact) {
                        if let Some(merged) = sub.merge(&new_sub) {
                            next.push(merged);
                        }
                    }
                }
            }
            substitutions = next;
            if substitutions.is_empty() {
                break;
            }
        }

        'subs: for sub in substitutions {
            for negated in &negatives {
                let ground = negated.apply_substitution(&sub);
                if index.any_match(&ground) {
                    continue 'subs;
                }
            }
            if let Some(fact) = rule.head.apply_substitution(&sub).to_fact() {
                results.push(fact);
            }
        }
    }

    results
}
