//! Parser for the rule and fact wire format
//!
//! One rule or ground fact per logical line:
//!
//! ```text
//! permitted(/read_file).
//! panic_state(Id, "forbidden") :- projected_action(Id, /read_file, "secret.txt").
//! lonely(X) :- node(X), !edge(X, X).
//! ```
//!
//! Name constants are `/`-prefixed, strings are double-quoted, numbers are
//! 64-bit integers or floats, variables start with an uppercase letter or
//! `_`. Negation is written `!atom(...)` (the `not atom(...)` spelling is
//! also accepted).

use crate::error::{NerdError, Result};
use crate::kernel::types::{Atom, Fact, Rule, Term, Value};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, multispace0, none_of, one_of, satisfy},
    combinator::{map, opt, recognize, verify},
    multi::{fold_many0, many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_lowercase()),
        many0(satisfy(|c| c.is_ascii_alphanumeric() || c == '_')),
    ))(input)
}

fn variable(input: &str) -> IResult<&str, Term> {
    map(
        recognize(pair(
            satisfy(|c| c.is_ascii_uppercase() || c == '_'),
            many0(satisfy(|c| c.is_ascii_alphanumeric() || c == '_')),
        )),
        |v: &str| Term::Variable(v.to_string()),
    )(input)
}

fn name_constant(input: &str) -> IResult<&str, Value> {
    map(
        recognize(preceded(
            char('/'),
            many0(satisfy(|c| {
                c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '/'
            })),
        )),
        Value::name,
    )(input)
}

fn escape_char(input: &str) -> IResult<&str, char> {
    preceded(
        char('\\'),
        alt((
            map(char('n'), |_| '\n'),
            map(char('t'), |_| '\t'),
            map(char('r'), |_| '\r'),
            one_of("\"\\"),
        )),
    )(input)
}

fn string_constant(input: &str) -> IResult<&str, Value> {
    map(
        delimited(
            char('"'),
            fold_many0(
                alt((none_of("\\\""), escape_char)),
                String::new,
                |mut acc, c| {
                    acc.push(c);
                    acc
                },
            ),
            char('"'),
        ),
        Value::string,
    )(input)
}

fn number_constant(input: &str) -> IResult<&str, Value> {
    let (rest, text) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
    )))(input)?;

    if text.contains('.') {
        let f: f64 = text.parse().map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Float))
        })?;
        Ok((rest, Value::Float(f)))
    } else {
        let i: i64 = text.parse().map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Digit))
        })?;
        Ok((rest, Value::Int(i)))
    }
}

fn term(input: &str) -> IResult<&str, Term> {
    alt((
        map(name_constant, Term::Constant),
        map(string_constant, Term::Constant),
        map(number_constant, Term::Constant),
        variable,
    ))(input)
}

fn atom_body(input: &str) -> IResult<&str, Atom> {
    let (input, predicate) = ident(input)?;
    let (input, terms) = opt(delimited(
        preceded(multispace0, char('(')),
        separated_list0(
            preceded(multispace0, char(',')),
            preceded(multispace0, term),
        ),
        preceded(multispace0, char(')')),
    ))(input)?;

    Ok((input, Atom::new(predicate, terms.unwrap_or_default())))
}

fn body_atom(input: &str) -> IResult<&str, Atom> {
    let (input, neg) = opt(alt((
        map(char('!'), |_| ()),
        map(terminated(tag("not"), char(' ')), |_| ()),
    )))(input)?;
    let (input, mut atom) = preceded(multispace0, atom_body)(input)?;
    if neg.is_some() {
        atom.negated = true;
    }
    Ok((input, atom))
}

fn rule(input: &str) -> IResult<&str, Rule> {
    let (input, head) = preceded(multispace0, atom_body)(input)?;
    let (input, body) = opt(preceded(
        preceded(multispace0, tag(":-")),
        separated_list0(
            preceded(multispace0, char(',')),
            preceded(multispace0, body_atom),
        ),
    ))(input)?;
    let (input, _) = preceded(multispace0, char('.'))(input)?;
    let (input, _) = multispace0(input)?;

    Ok((input, Rule::new(head, body.unwrap_or_default())))
}

fn full<'a, O>(
    mut parser: impl FnMut(&'a str) -> IResult<&'a str, O>,
    input: &'a str,
) -> Result<O> {
    match parser(input) {
        Ok((rest, out)) if rest.trim().is_empty() => Ok(out),
        Ok((rest, _)) => Err(NerdError::Parse(format!(
            "trailing input at {:?} in {:?}",
            rest.trim(),
            input.trim()
        ))),
        Err(e) => Err(NerdError::Parse(format!("{e} in {:?}", input.trim()))),
    }
}

/// Parse a single rule (or bodiless fact rule) from text.
pub fn parse_rule_text(input: &str) -> Result<Rule> {
    full(rule, input)
}

/// Parse a ground fact in wire format, e.g. `edge(/a, "s", 3).`
pub fn parse_fact_text(input: &str) -> Result<Fact> {
    let parsed = parse_rule_text(input)?;
    if !parsed.is_fact() {
        return Err(NerdError::Parse(format!(
            "expected a ground fact, got a rule: {}",
            input.trim()
        )));
    }
    parsed.head.to_fact().ok_or_else(|| {
        NerdError::Parse(format!("fact contains variables: {}", input.trim()))
    })
}

/// Parse a multi-line rule source: one rule or fact per logical line,
/// `#` comments and blank lines skipped.
pub fn parse_rules_text(input: &str) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rules.push(parse_rule_text(line)?);
    }
    Ok(rules)
}

/// Parse a query pattern: a bare predicate name or `pred(a1, …, an)`
/// where each argument is a constant or a variable. The trailing dot is
/// optional.
pub fn parse_query_pattern(input: &str) -> Result<Atom> {
    let trimmed = input.trim().trim_end_matches('.');
    let bare = verify(ident, |s: &str| !s.is_empty());
    if full(bare, trimmed).is_ok() {
        return Ok(Atom::new(trimmed, vec![]));
    }
    full(atom_body, trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ground_fact() {
        let fact = parse_fact_text("edge(/a, \"s\", 3).").unwrap();
        assert_eq!(fact.predicate.as_ref(), "edge");
        assert_eq!(fact.args[0], Value::name("/a"));
        assert_eq!(fact.args[1], Value::string("s"));
        assert_eq!(fact.args[2], Value::Int(3));
    }

    #[test]
    fn test_fact_wire_round_trip() {
        let text = "predicate(/a, \"s\", 3).";
        let fact = parse_fact_text(text).unwrap();
        assert_eq!(fact.canonical(), text);
        let again = parse_fact_text(&fact.canonical()).unwrap();
        assert_eq!(fact, again);
    }

    #[test]
    fn test_parse_rule_with_negation() {
        let rule =
            parse_rule_text("lonely(X) :- node(X), !edge(X, X).").unwrap();
        assert_eq!(rule.body.len(), 2);
        assert!(!rule.body[0].negated);
        assert!(rule.body[1].negated);

        let alt = parse_rule_text("lonely(X) :- node(X), not edge(X, X).").unwrap();
        assert_eq!(rule, alt);
    }

    #[test]
    fn test_parse_floats_and_negatives() {
        let fact = parse_fact_text("reading(-4, 2.5).").unwrap();
        assert_eq!(fact.args[0], Value::Int(-4));
        assert_eq!(fact.args[1], Value::Float(2.5));
    }

    #[test]
    fn test_parse_string_escapes() {
        let fact = parse_fact_text(r#"msg("a \"b\" \n c")."#).unwrap();
        assert_eq!(fact.args[0], Value::string("a \"b\" \n c"));
    }

    #[test]
    fn test_nullary_atom() {
        let rule = parse_rule_text("system_startup.").unwrap();
        assert!(rule.is_fact());
        assert_eq!(rule.head.arity(), 0);

        let rule = parse_rule_text("ready() :- system_startup.").unwrap();
        assert_eq!(rule.body.len(), 1);
    }

    #[test]
    fn test_reject_rule_as_fact() {
        assert!(parse_fact_text("a(X) :- b(X).").is_err());
        assert!(parse_fact_text("a(X).").is_err());
    }

    #[test]
    fn test_reject_garbage() {
        assert!(parse_rule_text("invalid rule :--.").is_err());
        assert!(parse_rule_text("missing_dot(X) :- b(X)").is_err());
        assert!(parse_rule_text("a(X). trailing").is_err());
    }

    #[test]
    fn test_query_pattern_bare_and_full() {
        let bare = parse_query_pattern("permitted").unwrap();
        assert_eq!(bare.predicate.as_ref(), "permitted");
        assert!(bare.terms.is_empty());

        let pat = parse_query_pattern("edge(A, \"x\", 3)").unwrap();
        assert_eq!(pat.terms.len(), 3);
        assert!(pat.terms[0].is_variable());

        let dotted = parse_query_pattern("permitted(/read_file).").unwrap();
        assert_eq!(dotted.terms.len(), 1);
    }

    #[test]
    fn test_multi_line_source() {
        let rules = parse_rules_text(
            r#"
            # facts
            user("alice").
            admin("alice").

            can_access(U) :- user(U), admin(U).
            "#,
        )
        .unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules[0].is_fact());
        assert!(!rules[2].is_fact());
    }
}
