//! Fact store with copy-on-write cloning
//!
//! Facts are indexed per predicate behind `Arc<Vec<Fact>>` entries, so a
//! clone of the store shares every untouched predicate bucket with the
//! original. Mutation replaces only the touched bucket. Ground facts are
//! deduplicated by canonical text form.

use crate::kernel::types::{Atom, Fact, Term};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

/// Deduplicating, predicate-indexed fact store
#[derive(Debug, Clone, Default)]
pub struct FactStore {
    by_predicate: AHashMap<Arc<str>, Arc<Vec<Fact>>>,
    keys: AHashSet<String>,
}

impl FactStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fact. Returns false if an equal fact was already present.
    pub fn insert(&mut self, fact: Fact) -> bool {
        let key = fact.canonical();
        if !self.keys.insert(key) {
            return false;
        }
        let bucket = self
            .by_predicate
            .entry(fact.predicate.clone())
            .or_insert_with(|| Arc::new(Vec::new()));
        Arc::make_mut(bucket).push(fact);
        true
    }

    /// Insert many facts; returns how many were new.
    pub fn insert_all(&mut self, facts: impl IntoIterator<Item = Fact>) -> usize {
        facts.into_iter().filter(|f| self.insert(f.clone())).count()
    }

    /// Whether an equal fact is present
    pub fn contains(&self, fact: &Fact) -> bool {
        self.keys.contains(&fact.canonical())
    }

    /// All facts of a predicate
    pub fn get(&self, predicate: &str) -> &[Fact] {
        self.by_predicate
            .get(predicate)
            .map(|b| b.as_slice())
            .unwrap_or(&[])
    }

    /// Remove every fact of a predicate; returns how many were removed.
    pub fn retract_predicate(&mut self, predicate: &str) -> usize {
        match self.by_predicate.remove(predicate) {
            Some(bucket) => {
                for fact in bucket.iter() {
                    self.keys.remove(&fact.canonical());
                }
                bucket.len()
            }
            None => 0,
        }
    }

    /// Remove facts whose predicate matches and whose first `k` args
    /// equal the pattern's `k` args (k = pattern arg count). A zero-arg
    /// pattern removes the whole predicate.
    pub fn retract_prefix(&mut self, pattern: &Fact) -> usize {
        if pattern.args.is_empty() {
            return self.retract_predicate(&pattern.predicate);
        }
        let Some(bucket) = self.by_predicate.get_mut(&pattern.predicate) else {
            return 0;
        };
        let keys = &mut self.keys;
        let before = bucket.len();
        Arc::make_mut(bucket).retain(|fact| {
            let matches = fact.args.len() >= pattern.args.len()
                && fact
                    .args
                    .iter()
                    .zip(pattern.args.iter())
                    .all(|(a, p)| a.coerces_equal(p));
            if matches {
                keys.remove(&fact.canonical());
            }
            !matches
        });
        let removed = before - bucket.len();
        if bucket.is_empty() {
            self.by_predicate.remove(&pattern.predicate);
        }
        removed
    }

    /// Facts matching a query pattern: predicate and arity must match,
    /// constants filter under numeric/text normalization, variables are
    /// wildcards.
    pub fn query(&self, pattern: &Atom) -> Vec<Fact> {
        let bucket = self.get(&pattern.predicate);
        if pattern.terms.is_empty() {
            return bucket.to_vec();
        }
        bucket
            .iter()
            .filter(|fact| Self::matches(fact, pattern))
            .cloned()
            .collect()
    }

    fn matches(fact: &Fact, pattern: &Atom) -> bool {
        if fact.args.len() != pattern.terms.len() {
            return false;
        }
        fact.args
            .iter()
            .zip(pattern.terms.iter())
            .all(|(arg, term)| match term {
                Term::Variable(_) => true,
                Term::Constant(v) => arg.coerces_equal(v),
            })
    }

    /// Iterate every fact grouped by predicate
    pub fn iter_predicates(&self) -> impl Iterator<Item = (&Arc<str>, &[Fact])> {
        self.by_predicate.iter().map(|(p, b)| (p, b.as_slice()))
    }

    /// Iterate every fact
    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.by_predicate.values().flat_map(|b| b.iter())
    }

    /// Total fact count
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.by_predicate.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::Value;

    #[test]
    fn test_insert_dedups_by_canonical_form() {
        let mut store = FactStore::new();
        let f = Fact::binary("edge", Value::Int(1), Value::Int(2));
        assert!(store.insert(f.clone()));
        assert!(!store.insert(f));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_query_with_wildcards() {
        let mut store = FactStore::new();
        store.insert(Fact::binary("edge", Value::Int(1), Value::Int(2)));
        store.insert(Fact::binary("edge", Value::Int(1), Value::Int(3)));
        store.insert(Fact::binary("edge", Value::Int(2), Value::Int(3)));

        let pat = Atom::new(
            "edge",
            vec![Term::constant(Value::Int(1)), Term::var("Y")],
        );
        assert_eq!(store.query(&pat).len(), 2);

        // bare pattern equals zero-constant pattern
        let bare = Atom::new("edge", vec![]);
        let wild = Atom::new("edge", vec![Term::var("X"), Term::var("Y")]);
        assert_eq!(store.query(&bare).len(), store.query(&wild).len());
    }

    #[test]
    fn test_query_numeric_normalization() {
        let mut store = FactStore::new();
        store.insert(Fact::unary("reading", Value::Float(3.0)));

        let pat = Atom::new("reading", vec![Term::constant(Value::Int(3))]);
        assert_eq!(store.query(&pat).len(), 1);
    }

    #[test]
    fn test_retract_prefix() {
        let mut store = FactStore::new();
        store.insert(Fact::new(
            "registered_tool",
            vec![
                Value::string("lint"),
                Value::string("/bin/lint"),
                Value::name("/all"),
            ],
        ));
        store.insert(Fact::new(
            "registered_tool",
            vec![
                Value::string("fmt"),
                Value::string("/bin/fmt"),
                Value::name("/all"),
            ],
        ));

        let removed = store.retract_prefix(&Fact::unary(
            "registered_tool",
            Value::string("lint"),
        ));
        assert_eq!(removed, 1);
        assert_eq!(store.get("registered_tool").len(), 1);
        assert_eq!(
            store.get("registered_tool")[0].args[0],
            Value::string("fmt")
        );
    }

    #[test]
    fn test_clone_is_cow() {
        let mut store = FactStore::new();
        store.insert(Fact::unary("node", Value::Int(1)));

        let mut clone = store.clone();
        clone.insert(Fact::unary("node", Value::Int(2)));

        assert_eq!(store.get("node").len(), 1);
        assert_eq!(clone.get("node").len(), 2);
    }
}
