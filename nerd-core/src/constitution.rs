//! Constitutional safety gate
//!
//! A fixed list of named rules evaluated against every action request
//! before execution. Any matching rule aborts the action with a
//! constitutional violation; the rule set is fixed at startup.

use crate::action::{ActionRequest, ActionType};
use crate::error::{NerdError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// Path fragments that mark repository and agent state
pub const CRITICAL_MARKERS: &[&str] = &[".git", ".nerd"];

/// Infrastructure path prefixes treated as critical
pub const CRITICAL_PREFIXES: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// Commands allowed to run as the first token of an `exec_cmd` segment
pub const DEFAULT_BINARY_ALLOWLIST: &[&str] = &[
    "ls", "cat", "grep", "find", "echo", "pwd", "head", "tail", "wc", "sort",
    "uniq", "cut", "sed", "awk", "diff", "which", "env", "date", "mkdir",
    "touch", "cp", "mv", "rm", "chmod", "git", "go", "gofmt", "cargo",
    "rustc", "rustfmt", "python", "python3", "pip", "npm", "node", "make",
    "test", "true",
];

static FIXED_DANGERS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"git reset --hard").expect("static pattern"),
            "git reset --hard discards work",
        ),
        (
            Regex::new(r"terraform destroy").expect("static pattern"),
            "terraform destroy tears down infrastructure",
        ),
        (
            Regex::new(r"\bdd\s+if=").expect("static pattern"),
            "dd over a device",
        ),
        (
            Regex::new(r"\bmkfs\.").expect("static pattern"),
            "mkfs formats a filesystem",
        ),
        (
            Regex::new(r"(?i)format c:").expect("static pattern"),
            "format c: wipes a drive",
        ),
    ]
});

static SECRET_SIGNALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\.env\b|id_rsa|id_ed25519|\.ssh/|\.aws/credentials|api[_-]?key|secret)")
        .expect("static pattern")
});

static NETWORK_TOOLS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(curl|wget|nc|ncat|scp|sftp|rsync)\b").expect("static pattern")
});

/// Whitespace-normalize a command: tabs become spaces, runs of spaces
/// collapse, the result is trimmed. Whitespace expansion must not bypass
/// the dangerous-command check.
pub fn normalize_command(cmd: &str) -> String {
    cmd.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Matches any of the shell command separators `&&`, `;`, `|`.
static SEGMENT_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&&|;|\|").expect("static pattern"));

fn split_segments(normalized: &str) -> regex::Split<'_, '_> {
    SEGMENT_SEPARATOR.split(normalized)
}

/// Check a command for destructive patterns. Flag reordering and
/// splitting (`rm -r -f`, `rm -fr`, `rm --recursive`) must not bypass
/// the check. Returns the reason when the command is dangerous.
pub fn is_dangerous_command(cmd: &str) -> Option<String> {
    let normalized = normalize_command(cmd);

    for (pattern, reason) in FIXED_DANGERS.iter() {
        if pattern.is_match(&normalized) {
            return Some((*reason).to_string());
        }
    }

    // per-segment flag analysis so `x && rm -rf /` is still caught
    for segment in split_segments(&normalized) {
        let mut tokens = segment.split_whitespace();
        let Some(program) = tokens.next() else {
            continue;
        };
        let flags: Vec<&str> = tokens.clone().filter(|t| t.starts_with('-')).collect();
        let has_flag = |short: char, long: &str| {
            flags.iter().any(|f| {
                if let Some(body) = f.strip_prefix("--") {
                    body.eq_ignore_ascii_case(long)
                } else {
                    f[1..].chars().any(|c| c.eq_ignore_ascii_case(&short))
                }
            })
        };

        match program {
            "rm" => {
                if has_flag('r', "recursive") || has_flag('f', "force") {
                    return Some("recursive or forced rm".to_string());
                }
            }
            "chmod" => {
                if has_flag('r', "recursive")
                    && segment.split_whitespace().any(|t| t == "777")
                {
                    return Some("recursive world-writable chmod".to_string());
                }
            }
            "chown" => {
                if has_flag('r', "recursive") {
                    return Some("recursive chown".to_string());
                }
            }
            _ => {}
        }
    }

    None
}

/// Check a path for critical markers and infrastructure prefixes.
/// Matching is textual `contains` after trimming; `..`, double slashes
/// and case folding are not normalized here.
pub fn critical_prefix(path: &str) -> Option<&'static str> {
    let path = path.trim();
    CRITICAL_MARKERS
        .iter()
        .chain(CRITICAL_PREFIXES.iter())
        .find(|m| path.contains(*m))
        .copied()
}

type CheckFn = Arc<dyn Fn(&ActionRequest) -> Option<String> + Send + Sync>;

/// One named constitution rule
#[derive(Clone)]
pub struct ConstitutionRule {
    /// Rule name, reported on violation
    pub name: &'static str,
    /// What the rule protects against
    pub description: &'static str,
    check: CheckFn,
}

impl ConstitutionRule {
    fn new(
        name: &'static str,
        description: &'static str,
        check: impl Fn(&ActionRequest) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        ConstitutionRule {
            name,
            description,
            check: Arc::new(check),
        }
    }
}

/// The fixed safety prelude over action requests
pub struct Constitution {
    rules: Vec<ConstitutionRule>,
}

impl Constitution {
    /// The standard rule set
    pub fn new() -> Self {
        Self::with_allowlist(DEFAULT_BINARY_ALLOWLIST.iter().map(|s| s.to_string()))
    }

    /// The standard rule set with a custom binary allow-list
    pub fn with_allowlist(allowed: impl IntoIterator<Item = String>) -> Self {
        let allowed: Arc<Vec<String>> = Arc::new(allowed.into_iter().collect());

        let rules = vec![
            ConstitutionRule::new(
                "destructive_command",
                "rejects commands that destroy data or infrastructure",
                |req| {
                    if req.action != ActionType::ExecCmd {
                        return None;
                    }
                    is_dangerous_command(&req.target)
                },
            ),
            ConstitutionRule::new(
                "secret_exfiltration",
                "rejects commands that combine secret material with network tools",
                |req| {
                    if req.action != ActionType::ExecCmd {
                        return None;
                    }
                    let normalized = normalize_command(&req.target);
                    if SECRET_SIGNALS.is_match(&normalized)
                        && NETWORK_TOOLS.is_match(&normalized)
                    {
                        Some("secret material referenced alongside a network tool".to_string())
                    } else {
                        None
                    }
                },
            ),
            ConstitutionRule::new(
                "path_traversal",
                "rejects file mutations that climb out of the workspace",
                |req| {
                    if !req.action.is_mutating() {
                        return None;
                    }
                    let target = req.target.trim();
                    if target.contains("../") || target.starts_with("..") {
                        Some(format!("path escapes the workspace: {target}"))
                    } else {
                        None
                    }
                },
            ),
            ConstitutionRule::new(
                "system_file_modification",
                "rejects mutations of repository state and system paths",
                |req| {
                    if !req.action.is_mutating() {
                        return None;
                    }
                    critical_prefix(&req.target)
                        .map(|p| format!("critical path {p} in {}", req.target.trim()))
                },
            ),
            ConstitutionRule::new(
                "binary_allowlist",
                "rejects commands whose program is not allow-listed",
                move |req| {
                    if req.action != ActionType::ExecCmd {
                        return None;
                    }
                    let normalized = normalize_command(&req.target);
                    for segment in split_segments(&normalized) {
                        if let Some(program) = segment.split_whitespace().next() {
                            let base = program.rsplit('/').next().unwrap_or(program);
                            if !allowed.iter().any(|a| a == base) {
                                return Some(format!("binary not allow-listed: {program}"));
                            }
                        }
                    }
                    None
                },
            ),
        ];

        Constitution { rules }
    }

    /// Run every rule; the first match aborts with a constitutional
    /// violation.
    pub fn check(&self, request: &ActionRequest) -> Result<()> {
        for rule in &self.rules {
            if let Some(reason) = (rule.check)(request) {
                return Err(NerdError::Constitutional {
                    rule: rule.name.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// The rule names, in evaluation order
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }
}

impl Default for Constitution {
    fn default() -> Self {
        Self::new()
    }
}
