//! Post-execution validators
//!
//! Validators run after a handler returns, ordered by priority
//! ascending. Each declares which action types it can validate; overall
//! success requires every applicable validator to verify.

use crate::action::{ActionRequest, ActionResult, ActionType};
use crate::kernel::parser::parse_rules_text;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Outcome of one validator
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether the validator accepted the result
    pub verified: bool,
    /// Confidence in the verdict, 0.0 to 1.0
    pub confidence: f64,
    /// Method the validator used
    pub method: String,
    /// Rejection detail, when not verified
    pub error: Option<String>,
    /// Free-form detail entries
    pub details: HashMap<String, String>,
}

impl ValidationResult {
    /// A passing result
    pub fn verified(method: impl Into<String>, confidence: f64) -> Self {
        ValidationResult {
            verified: true,
            confidence,
            method: method.into(),
            error: None,
            details: HashMap::new(),
        }
    }

    /// A failing result
    pub fn rejected(method: impl Into<String>, error: impl Into<String>) -> Self {
        ValidationResult {
            verified: false,
            confidence: 1.0,
            method: method.into(),
            error: Some(error.into()),
            details: HashMap::new(),
        }
    }

    /// Attach a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A post-action validator
pub trait Validator: Send + Sync {
    /// Validator name, used in failure reports
    fn name(&self) -> &str;

    /// Ordering priority; lower runs earlier
    fn priority(&self) -> u32;

    /// Whether this validator applies to an action type
    fn can_validate(&self, action: ActionType) -> bool;

    /// Validate a request/result pair
    fn validate(&self, request: &ActionRequest, result: &ActionResult) -> ValidationResult;
}

/// Checks that the target's parent directory exists and is a directory
pub struct DirectoryValidator;

impl Validator for DirectoryValidator {
    fn name(&self) -> &str {
        "directory"
    }

    fn priority(&self) -> u32 {
        5
    }

    fn can_validate(&self, action: ActionType) -> bool {
        matches!(action, ActionType::WriteFile | ActionType::EditFile)
    }

    fn validate(&self, request: &ActionRequest, _result: &ActionResult) -> ValidationResult {
        let path = Path::new(&request.target);
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => return ValidationResult::verified("parent-dir", 1.0),
        };
        if parent.is_dir() {
            ValidationResult::verified("parent-dir", 1.0)
        } else {
            ValidationResult::rejected(
                "parent-dir",
                format!("parent directory missing: {}", parent.display()),
            )
        }
    }
}

/// Parses written files by extension; unrecognized extensions skip
pub struct SyntaxValidator;

impl SyntaxValidator {
    fn check_content(extension: &str, content: &str) -> Option<Result<(), String>> {
        match extension {
            "json" => Some(
                serde_json::from_str::<serde_json::Value>(content)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
            ),
            "toml" => Some(
                toml::from_str::<toml::Value>(content)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
            ),
            "yaml" | "yml" => Some(
                serde_yaml::from_str::<serde_yaml::Value>(content)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
            ),
            "mg" => Some(
                parse_rules_text(content)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
            ),
            "go" => Some(Self::check_go(content)),
            _ => None,
        }
    }

    // lightweight structural check; full Go parsing is out of scope
    fn check_go(content: &str) -> Result<(), String> {
        if !content
            .lines()
            .any(|l| l.trim_start().starts_with("package "))
        {
            return Err("missing package clause".to_string());
        }
        let mut depth: i64 = 0;
        for c in content.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return Err("unbalanced braces".to_string());
            }
        }
        if depth != 0 {
            return Err("unbalanced braces".to_string());
        }
        Ok(())
    }
}

impl Validator for SyntaxValidator {
    fn name(&self) -> &str {
        "syntax"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_validate(&self, action: ActionType) -> bool {
        matches!(action, ActionType::WriteFile | ActionType::EditFile)
    }

    fn validate(&self, request: &ActionRequest, _result: &ActionResult) -> ValidationResult {
        let path = Path::new(&request.target);
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return ValidationResult::verified("syntax-skip", 0.5);
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                return ValidationResult::rejected("syntax", format!("unreadable: {e}"))
            }
        };
        match Self::check_content(extension, &content) {
            None => ValidationResult::verified("syntax-skip", 0.5)
                .with_detail("extension", extension),
            Some(Ok(())) => ValidationResult::verified("syntax", 0.9),
            Some(Err(e)) => ValidationResult::rejected("syntax", e),
        }
    }
}

/// Configuration for the paranoid file validator
#[derive(Debug, Clone)]
pub struct ParanoidConfig {
    /// Maximum age of the file's mtime
    pub max_mtime_age: Duration,
    /// Inclusive size bounds
    pub min_size: u64,
    /// Inclusive size bounds
    pub max_size: u64,
    /// Expected SHA-256 of the content, when known
    pub expected_hash: Option<String>,
    /// Re-read after a bounded delay to detect concurrent modification
    pub double_read: bool,
    /// Delay between the two reads
    pub double_read_delay: Duration,
    /// Sample the content at this many evenly-spaced offsets (0 = off)
    pub sample_points: usize,
}

impl Default for ParanoidConfig {
    fn default() -> Self {
        ParanoidConfig {
            max_mtime_age: Duration::from_secs(30),
            min_size: 0,
            max_size: 64 * 1024 * 1024,
            expected_hash: None,
            double_read: false,
            double_read_delay: Duration::from_millis(50),
            sample_points: 0,
        }
    }
}

/// Existence, freshness, size, hash and stability checks on the target
pub struct ParanoidFileValidator {
    config: ParanoidConfig,
}

impl ParanoidFileValidator {
    /// Create with the default configuration
    pub fn new() -> Self {
        Self::with_config(ParanoidConfig::default())
    }

    /// Create with an explicit configuration
    pub fn with_config(config: ParanoidConfig) -> Self {
        ParanoidFileValidator { config }
    }

    fn hash_of(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("{:x}", hasher.finalize())
    }
}

impl Default for ParanoidFileValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for ParanoidFileValidator {
    fn name(&self) -> &str {
        "paranoid-file"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn can_validate(&self, action: ActionType) -> bool {
        matches!(action, ActionType::WriteFile | ActionType::EditFile)
    }

    fn validate(&self, request: &ActionRequest, _result: &ActionResult) -> ValidationResult {
        let path = Path::new(&request.target);

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                return ValidationResult::rejected(
                    "paranoid-exists",
                    format!("file missing after write: {e}"),
                )
            }
        };

        if let Ok(mtime) = metadata.modified() {
            let age = SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            if age > self.config.max_mtime_age {
                return ValidationResult::rejected(
                    "paranoid-mtime",
                    format!("stale mtime: {age:?} old"),
                );
            }
        }

        let size = metadata.len();
        if size < self.config.min_size || size > self.config.max_size {
            return ValidationResult::rejected(
                "paranoid-size",
                format!("size {size} outside [{}, {}]", self.config.min_size, self.config.max_size),
            );
        }

        let content = match std::fs::read(path) {
            Ok(c) => c,
            Err(e) => {
                return ValidationResult::rejected("paranoid-read", e.to_string())
            }
        };

        if let Some(expected) = &self.config.expected_hash {
            let actual = Self::hash_of(&content);
            if &actual != expected {
                return ValidationResult::rejected(
                    "paranoid-hash",
                    format!("hash mismatch: expected {expected}, got {actual}"),
                )
                .with_detail("actual_hash", actual);
            }
        }

        if self.config.double_read {
            std::thread::sleep(self.config.double_read_delay);
            match std::fs::read(path) {
                Ok(second) if second == content => {}
                Ok(_) => {
                    return ValidationResult::rejected(
                        "paranoid-double-read",
                        "content changed between reads",
                    )
                }
                Err(e) => {
                    return ValidationResult::rejected("paranoid-double-read", e.to_string())
                }
            }
        }

        if self.config.sample_points > 0 && !content.is_empty() {
            let step = (content.len() / self.config.sample_points).max(1);
            let mut sampled = 0usize;
            for offset in (0..content.len()).step_by(step) {
                // touching the byte is the check; a torn mapping or
                // truncated read would have failed above
                std::hint::black_box(content[offset]);
                sampled += 1;
            }
            debug!(sampled, "content sampling complete");
        }

        ValidationResult::verified("paranoid", 0.99)
    }
}

/// Ordered set of validators applied after every action
pub struct ValidatorSet {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorSet {
    /// The standard set: directory, syntax, paranoid-file
    pub fn standard() -> Self {
        let mut set = ValidatorSet { validators: vec![] };
        set.register(Box::new(DirectoryValidator));
        set.register(Box::new(SyntaxValidator));
        set.register(Box::new(ParanoidFileValidator::new()));
        set
    }

    /// An empty set
    pub fn empty() -> Self {
        ValidatorSet { validators: vec![] }
    }

    /// Register a validator, keeping the set ordered by priority
    pub fn register(&mut self, validator: Box<dyn Validator>) {
        self.validators.push(validator);
        self.validators.sort_by_key(|v| v.priority());
    }

    /// Run every applicable validator in priority order. Succeeds iff
    /// all applicable validators verified; the first rejection is
    /// returned.
    pub fn validate_all(
        &self,
        request: &ActionRequest,
        result: &ActionResult,
    ) -> Result<Vec<ValidationResult>, ValidationResult> {
        let mut results = Vec::new();
        for validator in &self.validators {
            if !validator.can_validate(request.action) {
                continue;
            }
            let outcome = validator.validate(request, result);
            if !outcome.verified {
                return Err(outcome);
            }
            results.push(outcome);
        }
        Ok(results)
    }
}
