//! Strict predicate schema
//!
//! Every ground fact asserted into the kernel must match a declaration:
//! predicate symbol, arity, and per-argument type tags. Redeclarations
//! must match the original. Rule-head predicates that are not declared
//! are auto-registered at compile time as derived predicates so rules
//! may define new vocabulary while ground assertion stays strict.

use crate::error::{NerdError, Result};
use crate::kernel::types::{Fact, Value};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Argument type tag in a predicate declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    /// Name constant (`/foo`)
    Name,
    /// String constant
    Str,
    /// 64-bit integer
    Int,
    /// 64-bit float
    Float,
    /// Any constant (used for derived predicates)
    Any,
}

impl ArgType {
    fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ArgType::Any, _)
                | (ArgType::Name, Value::Name(_))
                | (ArgType::Str, Value::Str(_))
                | (ArgType::Int, Value::Int(_))
                | (ArgType::Float, Value::Float(_))
        )
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgType::Name => write!(f, "name"),
            ArgType::Str => write!(f, "string"),
            ArgType::Int => write!(f, "int"),
            ArgType::Float => write!(f, "float"),
            ArgType::Any => write!(f, "any"),
        }
    }
}

/// One predicate declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Predicate symbol
    pub predicate: Arc<str>,
    /// Ordered argument types
    pub args: Vec<ArgType>,
    /// True when registered automatically for a rule head
    pub derived: bool,
}

impl Declaration {
    /// Arity of the declared predicate
    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

/// The set of predicate declarations the kernel enforces
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    decls: AHashMap<Arc<str>, Declaration>,
}

impl SchemaSet {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a predicate. A redeclaration must match the existing
    /// declaration exactly or `SchemaMismatch` is returned.
    pub fn declare(&mut self, predicate: impl Into<String>, args: Vec<ArgType>) -> Result<()> {
        let predicate: Arc<str> = Arc::from(predicate.into().into_boxed_str());
        let decl = Declaration {
            predicate: predicate.clone(),
            args,
            derived: false,
        };
        if let Some(existing) = self.decls.get(&predicate) {
            if existing.derived {
                // an explicit declaration upgrades a derived registration
                self.decls.insert(predicate, decl);
                return Ok(());
            }
            if existing.args != decl.args {
                return Err(NerdError::SchemaMismatch {
                    predicate: predicate.to_string(),
                    reason: format!(
                        "redeclaration with {} args does not match existing {}",
                        decl.args.len(),
                        existing.args.len()
                    ),
                });
            }
            return Ok(());
        }
        self.decls.insert(predicate, decl);
        Ok(())
    }

    /// Register a derived predicate discovered in a rule head. No-op if
    /// the predicate is declared; mismatched arity on an existing derived
    /// registration is an error.
    pub fn register_derived(&mut self, predicate: &Arc<str>, arity: usize) -> Result<()> {
        if let Some(existing) = self.decls.get(predicate) {
            if existing.arity() != arity {
                return Err(NerdError::SchemaMismatch {
                    predicate: predicate.to_string(),
                    reason: format!(
                        "rule head arity {} does not match declared arity {}",
                        arity,
                        existing.arity()
                    ),
                });
            }
            return Ok(());
        }
        self.decls.insert(
            predicate.clone(),
            Declaration {
                predicate: predicate.clone(),
                args: vec![ArgType::Any; arity],
                derived: true,
            },
        );
        Ok(())
    }

    /// Whether a predicate is declared (explicitly or as derived)
    pub fn is_declared(&self, predicate: &str) -> bool {
        self.decls.contains_key(predicate)
    }

    /// Look up a declaration
    pub fn get(&self, predicate: &str) -> Option<&Declaration> {
        self.decls.get(predicate)
    }

    /// Validate a ground fact against the schema
    pub fn validate(&self, fact: &Fact) -> Result<()> {
        let decl = self
            .decls
            .get(&fact.predicate)
            .ok_or_else(|| NerdError::UndeclaredPredicate(fact.predicate.to_string()))?;

        if decl.arity() != fact.arity() {
            return Err(NerdError::SchemaMismatch {
                predicate: fact.predicate.to_string(),
                reason: format!(
                    "arity {} does not match declared arity {}",
                    fact.arity(),
                    decl.arity()
                ),
            });
        }

        for (i, (ty, value)) in decl.args.iter().zip(fact.args.iter()).enumerate() {
            if !ty.accepts(value) {
                return Err(NerdError::SchemaMismatch {
                    predicate: fact.predicate.to_string(),
                    reason: format!("argument {i} expected {ty}, got {value}"),
                });
            }
        }

        Ok(())
    }

    /// Number of declarations
    pub fn len(&self) -> usize {
        self.decls.len()
    }

    /// Whether the schema is empty
    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undeclared_rejected() {
        let schema = SchemaSet::new();
        let fact = Fact::unary("mystery", Value::Int(1));
        assert!(matches!(
            schema.validate(&fact),
            Err(NerdError::UndeclaredPredicate(_))
        ));
    }

    #[test]
    fn test_arity_and_type_checks() {
        let mut schema = SchemaSet::new();
        schema
            .declare("edge", vec![ArgType::Name, ArgType::Int])
            .unwrap();

        let ok = Fact::binary("edge", Value::name("/a"), Value::Int(3));
        assert!(schema.validate(&ok).is_ok());

        let wrong_arity = Fact::unary("edge", Value::name("/a"));
        assert!(matches!(
            schema.validate(&wrong_arity),
            Err(NerdError::SchemaMismatch { .. })
        ));

        let wrong_type = Fact::binary("edge", Value::Int(1), Value::Int(3));
        assert!(matches!(
            schema.validate(&wrong_type),
            Err(NerdError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_redeclare_must_match() {
        let mut schema = SchemaSet::new();
        schema.declare("f", vec![ArgType::Str]).unwrap();
        assert!(schema.declare("f", vec![ArgType::Str]).is_ok());
        assert!(schema.declare("f", vec![ArgType::Int]).is_err());
        assert!(schema.declare("f", vec![ArgType::Str, ArgType::Str]).is_err());
    }

    #[test]
    fn test_derived_upgrade() {
        let mut schema = SchemaSet::new();
        let pred: Arc<str> = Arc::from("derived_view");
        schema.register_derived(&pred, 2).unwrap();
        assert!(schema.is_declared("derived_view"));

        // explicit declaration replaces the Any/Any registration
        schema
            .declare("derived_view", vec![ArgType::Str, ArgType::Int])
            .unwrap();
        assert_eq!(
            schema.get("derived_view").unwrap().args,
            vec![ArgType::Str, ArgType::Int]
        );

        // arity conflict on derived registration
        assert!(schema.register_derived(&pred, 3).is_err());
    }

    #[test]
    fn test_any_accepts_everything() {
        let mut schema = SchemaSet::new();
        schema.declare("blob", vec![ArgType::Any]).unwrap();
        for v in [
            Value::name("/x"),
            Value::string("s"),
            Value::Int(1),
            Value::Float(0.5),
        ] {
            assert!(schema.validate(&Fact::unary("blob", v)).is_ok());
        }
    }
}
