//! Hot-load safety checks
//!
//! Two guard families run before any rule reaches the compiler:
//!
//! - **Negation holes**: a textual scan rejects rules whose negated atoms
//!   contain the anonymous hole `_`, naming the offending pattern.
//! - **Infinite-loop risk**: rules deriving `next_action` from premises
//!   that are always true would fire on every evaluation forever; four
//!   hazard shapes are rejected.

use crate::error::{NerdError, Result};
use crate::kernel::types::{Rule, Term, Value};
use once_cell::sync::Lazy;
use regex::Regex;

/// Predicates that are true in essentially every kernel snapshot. A
/// `next_action` rule gated only on one of these never stops firing.
pub const UBIQUITOUS_PREDICATES: &[&str] = &[
    "current_time",
    "entry_point",
    "current_phase",
    "build_system",
    "system_startup",
    "northstar_defined",
];

/// Atoms that mark the start-of-run state
const SYSTEM_START_ATOMS: &[&str] = &["/system_startup", "/start", "/init", "/boot"];

static NEGATED_ATOM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:!|\bnot\s+)([a-z][a-z0-9_]*)\(([^)]*)\)").expect("static pattern")
});

/// Textually scan rule text for negated atoms containing anonymous
/// holes. Runs in addition to range restriction, before parsing.
pub fn check_negation_holes(rule_text: &str) -> Result<()> {
    for caps in NEGATED_ATOM.captures_iter(rule_text) {
        let args = &caps[2];
        let has_hole = args.split(',').any(|a| {
            let a = a.trim();
            a == "_" || (a.starts_with('_') && a.len() > 1 && a.chars().all(|c| c == '_'))
        });
        if has_hole {
            return Err(NerdError::UnsafeNegation(format!(
                "negated atom !{}({}) contains an anonymous hole",
                &caps[1], args
            )));
        }
    }
    Ok(())
}

/// Reject `next_action` rules that would fire unconditionally.
pub fn check_infinite_loop_risk(rule: &Rule) -> Result<()> {
    if rule.head.predicate.as_ref() != "next_action" {
        return Ok(());
    }

    // 1. bodiless rule whose head argument is a system-start atom
    if rule.body.is_empty() {
        let starts_system = rule.head.terms.iter().any(|t| {
            matches!(
                t,
                Term::Constant(Value::Name(n)) if SYSTEM_START_ATOMS.contains(&n.as_ref())
            )
        });
        if starts_system {
            return Err(NerdError::InfiniteLoopRisk(format!(
                "bodiless next_action rule anchored on a system-start atom: {rule}"
            )));
        }
        return Ok(());
    }

    // 2. single body atom over a ubiquitous predicate
    if rule.body.len() == 1
        && UBIQUITOUS_PREDICATES.contains(&rule.body[0].predicate.as_ref())
    {
        return Err(NerdError::InfiniteLoopRisk(format!(
            "next_action gated only on ubiquitous predicate {}: {rule}",
            rule.body[0].predicate
        )));
    }

    // 3. idle-pattern body with at most two predicates
    if rule.body.len() <= 2 && rule.body.iter().any(is_idle_atom) {
        return Err(NerdError::InfiniteLoopRisk(format!(
            "next_action gated on an idle pattern: {rule}"
        )));
    }

    // 4. body is solely negated atoms
    if rule.body.iter().all(|a| a.negated) {
        return Err(NerdError::InfiniteLoopRisk(format!(
            "next_action body is purely negative: {rule}"
        )));
    }

    Ok(())
}

// `*_state(/idle)`, `*_status(/idle)`, and any literal `/idle` argument
// all collapse to the same check: an `/idle` name constant in the atom.
fn is_idle_atom(atom: &crate::kernel::types::Atom) -> bool {
    atom.terms
        .iter()
        .any(|t| matches!(t, Term::Constant(Value::Name(n)) if n.as_ref() == "/idle"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::parser::parse_rule_text;

    #[test]
    fn test_negated_hole_rejected() {
        let text = "safe(X) :- node(X), !edge(X, _).";
        let err = check_negation_holes(text).unwrap_err();
        assert!(err.to_string().contains("edge"));

        assert!(check_negation_holes("safe(X) :- node(X), !edge(X, Y).").is_ok());
        assert!(check_negation_holes("safe(X) :- edge(X, _).").is_ok());
    }

    #[test]
    fn test_not_spelling_also_scanned() {
        let text = "safe(X) :- node(X), not edge(_, X).";
        assert!(check_negation_holes(text).is_err());
    }

    #[test]
    fn test_ubiquitous_single_atom_rejected() {
        let rule = parse_rule_text("next_action(/foo) :- current_time(T).").unwrap();
        let err = check_infinite_loop_risk(&rule).unwrap_err();
        assert!(err.to_string().contains("infinite loop risk"));
        assert!(err.to_string().contains("current_time"));
    }

    #[test]
    fn test_system_start_bodiless_rejected() {
        let rule = parse_rule_text("next_action(/system_startup).").unwrap();
        assert!(check_infinite_loop_risk(&rule).is_err());

        let ok = parse_rule_text("next_action(/plan).").unwrap();
        assert!(check_infinite_loop_risk(&ok).is_ok());
    }

    #[test]
    fn test_idle_pattern_rejected() {
        let rule =
            parse_rule_text("next_action(/work) :- shard_state(/idle).").unwrap();
        assert!(check_infinite_loop_risk(&rule).is_err());

        // three-predicate body with idle is allowed through this clause
        let rule = parse_rule_text(
            "next_action(/work) :- shard_state(/idle), task(T), assigned(T, W).",
        )
        .unwrap();
        assert!(check_infinite_loop_risk(&rule).is_ok());
    }

    #[test]
    fn test_purely_negative_body_rejected() {
        let rule =
            parse_rule_text("next_action(/retry) :- !done(X), !failed(X).").unwrap();
        assert!(check_infinite_loop_risk(&rule).is_err());
    }

    #[test]
    fn test_non_next_action_heads_pass() {
        let rule = parse_rule_text("status(/ok) :- current_time(T).").unwrap();
        assert!(check_infinite_loop_risk(&rule).is_ok());
    }
}
