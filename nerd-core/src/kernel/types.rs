//! Core deductive data structures
//!
//! This module defines the fundamental types for the kernel:
//! - Values (typed constants: names, strings, integers, floats)
//! - Terms (variables and constants)
//! - Atoms (predicates with terms)
//! - Rules (Horn clauses with stratified negation)
//! - Facts (ground atoms) and substitutions
//!
//! Design principles:
//! - Arc-based for zero-copy sharing
//! - Structural equality; floats compared by bit pattern
//! - Canonical text form is the dedup key for ground facts

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A typed constant in a fact or rule.
///
/// Name constants carry their leading slash (`/read_file`); the slash is
/// part of the symbol text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Name constant, e.g. `/read_file`
    Name(Arc<str>),
    /// String constant
    Str(Arc<str>),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
}

impl Value {
    /// Create a name constant; a missing leading slash is added.
    pub fn name(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        if s.starts_with('/') {
            Value::Name(Arc::from(s))
        } else {
            Value::Name(Arc::from(format!("/{s}").into_boxed_str()))
        }
    }

    /// Create a string constant
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Arc::from(s.into().into_boxed_str()))
    }

    /// The symbol text of a name constant, if this is one
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Value::Name(n) => Some(n),
            _ => None,
        }
    }

    /// The text of a string constant, if this is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer, if this is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Equality under query normalization: integer widths are already
    /// 64-bit, an integral float equals the same integer, and names and
    /// strings cross-compare on exact text only.
    pub fn coerces_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                b.fract() == 0.0 && b.is_finite() && *b == *a as f64
            }
            (Value::Name(a), Value::Str(b)) | (Value::Str(b), Value::Name(a)) => {
                a.as_ref() == b.as_ref()
            }
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Name(a), Value::Name(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Name(n) => {
                0u8.hash(state);
                n.hash(state);
            }
            Value::Str(s) => {
                1u8.hash(state);
                s.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Name(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{:?}", s.as_ref()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
        }
    }
}

/// A term in a rule or query pattern (variable or constant)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// Variable (uppercase initial or `_`)
    Variable(String),
    /// Constant value
    Constant(Value),
}

impl Term {
    /// Create a variable term
    pub fn var(name: impl Into<String>) -> Self {
        Term::Variable(name.into())
    }

    /// Create a constant term
    pub fn constant(value: Value) -> Self {
        Term::Constant(value)
    }

    /// Check if term is a variable
    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }

    /// Check if term is the anonymous hole `_`
    pub fn is_hole(&self) -> bool {
        matches!(self, Term::Variable(v) if v == "_")
    }

    /// Get variable name if this is a variable
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Term::Variable(name) => Some(name),
            _ => None,
        }
    }

    /// Get constant value if this is a constant
    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Term::Constant(val) => Some(val),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Variable(name) => write!(f, "{name}"),
            Term::Constant(v) => write!(f, "{v}"),
        }
    }
}

/// An atom (predicate applied to terms), possibly negated inside a body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    /// Predicate name
    pub predicate: Arc<str>,
    /// Terms (arguments)
    pub terms: Vec<Term>,
    /// Whether this is a negated body atom
    pub negated: bool,
}

impl Atom {
    /// Create a new positive atom
    pub fn new(predicate: impl Into<String>, terms: Vec<Term>) -> Self {
        Atom {
            predicate: Arc::from(predicate.into().into_boxed_str()),
            terms,
            negated: false,
        }
    }

    /// Create a negated atom
    pub fn negated(predicate: impl Into<String>, terms: Vec<Term>) -> Self {
        Atom {
            predicate: Arc::from(predicate.into().into_boxed_str()),
            terms,
            negated: true,
        }
    }

    /// Get the arity (number of terms)
    pub fn arity(&self) -> usize {
        self.terms.len()
    }

    /// Get all variables in this atom
    pub fn variables(&self) -> Vec<&str> {
        self.terms.iter().filter_map(|t| t.as_variable()).collect()
    }

    /// Check if atom is ground (no variables)
    pub fn is_ground(&self) -> bool {
        self.terms.iter().all(|t| t.as_constant().is_some())
    }

    /// Apply substitution to get a new atom
    pub fn apply_substitution(&self, sub: &Substitution) -> Atom {
        Atom {
            predicate: self.predicate.clone(),
            terms: self.terms.iter().map(|t| sub.apply_to_term(t)).collect(),
            negated: self.negated,
        }
    }

    /// Convert to a ground fact; None if any term is still a variable
    pub fn to_fact(&self) -> Option<Fact> {
        if !self.is_ground() {
            return None;
        }
        let args: Vec<Value> = self
            .terms
            .iter()
            .filter_map(|t| t.as_constant().cloned())
            .collect();
        Some(Fact::from_parts(self.predicate.clone(), args))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "!")?;
        }
        write!(f, "{}(", self.predicate)?;
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{term}")?;
        }
        write!(f, ")")
    }
}

/// A rule: head :- body. Facts are rules with an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Head of the rule (consequent)
    pub head: Atom,
    /// Body of the rule (antecedents)
    pub body: Vec<Atom>,
}

impl Rule {
    /// Create a new rule
    pub fn new(head: Atom, body: Vec<Atom>) -> Self {
        Rule { head, body }
    }

    /// Create a fact rule (empty body)
    pub fn fact(head: Atom) -> Self {
        Rule::new(head, vec![])
    }

    /// Check if this is a fact (empty body)
    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
    }

    /// Range restriction: every variable in the head and in any negated
    /// body atom must appear in a positive body atom.
    pub fn is_range_restricted(&self) -> bool {
        let positive_vars: std::collections::HashSet<_> = self
            .body
            .iter()
            .filter(|a| !a.negated)
            .flat_map(|a| a.variables())
            .collect();

        let head_ok = self
            .head
            .variables()
            .iter()
            .all(|v| positive_vars.contains(v));

        let negated_ok = self
            .body
            .iter()
            .filter(|a| a.negated)
            .flat_map(|a| a.variables())
            .all(|v| v == "_" || positive_vars.contains(v));

        head_ok && negated_ok
    }

    /// Predicates this rule reads, split into (positive, negated)
    pub fn dependencies(&self) -> (Vec<Arc<str>>, Vec<Arc<str>>) {
        let mut pos = Vec::new();
        let mut neg = Vec::new();
        for atom in &self.body {
            if atom.negated {
                neg.push(atom.predicate.clone());
            } else {
                pos.push(atom.predicate.clone());
            }
        }
        (pos, neg)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.head)?;
        if !self.body.is_empty() {
            write!(f, " :- ")?;
            for (i, atom) in self.body.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{atom}")?;
            }
        }
        write!(f, ".")
    }
}

/// A ground fact over a declared predicate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fact {
    /// Predicate symbol
    pub predicate: Arc<str>,
    /// Argument values
    pub args: Arc<[Value]>,
}

impl Fact {
    /// Create a new fact
    pub fn new(predicate: impl Into<String>, args: Vec<Value>) -> Self {
        Fact {
            predicate: Arc::from(predicate.into().into_boxed_str()),
            args: Arc::from(args.into_boxed_slice()),
        }
    }

    /// Create from an already-shared predicate
    pub fn from_parts(predicate: Arc<str>, args: Vec<Value>) -> Self {
        Fact {
            predicate,
            args: Arc::from(args.into_boxed_slice()),
        }
    }

    /// Create a unary fact
    pub fn unary(predicate: impl Into<String>, arg: Value) -> Self {
        Self::new(predicate, vec![arg])
    }

    /// Create a binary fact
    pub fn binary(predicate: impl Into<String>, arg1: Value, arg2: Value) -> Self {
        Self::new(predicate, vec![arg1, arg2])
    }

    /// The arity of this fact
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Canonical text form `pred(a1, …, an).` used as the dedup key
    /// and as the wire format.
    pub fn canonical(&self) -> String {
        format!("{self}")
    }

    /// Convert to a ground atom
    pub fn to_atom(&self) -> Atom {
        Atom {
            predicate: self.predicate.clone(),
            terms: self
                .args
                .iter()
                .map(|v| Term::Constant(v.clone()))
                .collect(),
            negated: false,
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ").")
    }
}

/// Variable binding produced during unification
#[derive(Debug, Clone, Default)]
pub struct Substitution {
    bindings: HashMap<String, Value>,
}

impl Substitution {
    /// Create an empty substitution
    pub fn new() -> Self {
        Substitution {
            bindings: HashMap::new(),
        }
    }

    /// Add a binding
    pub fn bind(&mut self, variable: String, value: Value) {
        self.bindings.insert(variable, value);
    }

    /// Get binding for a variable
    pub fn get(&self, variable: &str) -> Option<&Value> {
        self.bindings.get(variable)
    }

    /// Apply substitution to a term
    pub fn apply_to_term(&self, term: &Term) -> Term {
        match term {
            Term::Variable(name) => {
                if let Some(value) = self.bindings.get(name) {
                    Term::Constant(value.clone())
                } else {
                    term.clone()
                }
            }
            Term::Constant(_) => term.clone(),
        }
    }

    /// Merge two substitutions (None if a shared variable disagrees)
    pub fn merge(&self, other: &Substitution) -> Option<Substitution> {
        let mut result = self.clone();
        for (var, val) in &other.bindings {
            if let Some(existing) = result.bindings.get(var) {
                if existing != val {
                    return None;
                }
            } else {
                result.bindings.insert(var.clone(), val.clone());
            }
        }
        Some(result)
    }

    /// Check if substitution is empty
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
