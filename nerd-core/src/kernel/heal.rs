//! Startup self-healing of the learned-rules file
//!
//! Each non-comment line of `learned.mg` that looks like a rule or ground
//! fact is parsed, schema-validated, and checked against the hot-load
//! guards. A line that fails any check is rewritten in place as two
//! lines: a `# SELF-HEALED: <reason>` marker and the commented-out
//! original. The file is rewritten atomically (temp file + rename), and
//! healing an already-healed file is a no-op.

use crate::error::Result;
use crate::kernel::parser::parse_rule_text;
use crate::kernel::safety::{check_infinite_loop_risk, check_negation_holes};
use crate::kernel::schema::SchemaSet;
use crate::kernel::types::Rule;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Outcome of a self-healing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    /// Lines that parsed and validated
    pub kept: usize,
    /// Lines rewritten as `# SELF-HEALED`
    pub healed: usize,
}

impl HealReport {
    /// Whether the pass changed the file
    pub fn changed(&self) -> bool {
        self.healed > 0
    }
}

/// Validate one learned line against the schema and the hot-load guards.
pub fn validate_learned_line(line: &str, schema: &SchemaSet) -> Result<Rule> {
    check_negation_holes(line)?;
    let rule = parse_rule_text(line)?;
    check_infinite_loop_risk(&rule)?;

    if rule.is_fact() {
        if let Some(fact) = rule.head.to_fact() {
            schema.validate(&fact)?;
        }
    } else {
        for atom in &rule.body {
            if !schema.is_declared(&atom.predicate) {
                return Err(crate::error::NerdError::UndeclaredPredicate(
                    atom.predicate.to_string(),
                ));
            }
        }
    }

    Ok(rule)
}

/// Self-heal a learned-rules file. Returns the surviving rules and a
/// report. A missing file is an empty success.
pub fn self_heal_file(path: &Path, schema: &SchemaSet) -> Result<(Vec<Rule>, HealReport)> {
    if !path.exists() {
        return Ok((Vec::new(), HealReport::default()));
    }

    let content = std::fs::read_to_string(path)?;
    let mut rules = Vec::new();
    let mut report = HealReport::default();
    let mut out = String::with_capacity(content.len());

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
            out.push('\n');
            continue;
        }

        match validate_learned_line(trimmed, schema) {
            Ok(rule) => {
                rules.push(rule);
                report.kept += 1;
                out.push_str(line);
                out.push('\n');
            }
            Err(e) => {
                warn!(line = trimmed, error = %e, "self-healing learned rule");
                report.healed += 1;
                out.push_str(&format!("# SELF-HEALED: {e}\n# {trimmed}\n"));
            }
        }
    }

    if report.changed() {
        write_atomic(path, &out)?;
        info!(
            path = %path.display(),
            kept = report.kept,
            healed = report.healed,
            "rewrote learned rules file"
        );
    }

    Ok((rules, report))
}

/// Append one rule line to the learned file, creating parents as needed.
pub fn append_learned_rule(path: &Path, rule_text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", rule_text.trim())?;
    Ok(())
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
