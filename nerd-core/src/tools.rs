//! Registry of generated tool binaries
//!
//! Tools are external binaries associated with a shard affinity. Their
//! registration is mirrored into the kernel as facts
//! (`registered_tool/3`, `tool_registered/2`, `tool_hash/2`,
//! `tool_capability/2`) so the symbolic layer can reason about the
//! action vocabulary it grew at runtime.

use crate::action::{ActionRequest, ActionType};
use crate::error::{NerdError, Result};
use crate::kernel::types::{Fact, Value};
use crate::kernel::Kernel;
use crate::vstore::{ActionHandler, VirtualStore, ENV_ALLOWLIST};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};

/// A registered tool
#[derive(Debug, Clone)]
pub struct Tool {
    /// Tool name (fact key)
    pub name: String,
    /// Binary path or command name
    pub command: String,
    /// Shard affinity in atom form (`/all`, `/coder`, …)
    pub shard_affinity: String,
    /// Human description
    pub description: String,
    /// Capability tags mirrored as `tool_capability` facts
    pub capabilities: Vec<String>,
    /// SHA-256 of the binary (or of the command text)
    pub hash: String,
    /// Registration time, UTC epoch seconds
    pub registered_at: i64,
    /// How many times the tool has been executed
    pub execute_count: u64,
}

/// A tool definition from the bundled manifest
#[derive(Debug, Clone, Deserialize)]
pub struct StaticToolDef {
    /// Tool name
    pub name: String,
    /// Manifest category
    #[serde(default)]
    pub category: String,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Binary path or command name
    pub command: String,
    /// Raw affinity; normalized to atom form at registration
    #[serde(default = "default_affinity")]
    pub shard_affinity: String,
}

fn default_affinity() -> String {
    "all".to_string()
}

#[derive(Debug, Deserialize)]
struct ToolManifest {
    #[serde(default)]
    tool: Vec<StaticToolDef>,
}

/// Normalize an affinity to atom form: `/`-prefixed, lowercased, with a
/// trailing `Shard` suffix stripped (`CoderShard` → `/coder`).
pub fn normalize_affinity(raw: &str) -> String {
    let stripped = raw.trim().trim_start_matches('/');
    let stripped = stripped.strip_suffix("Shard").unwrap_or(stripped);
    format!("/{}", stripped.to_lowercase())
}

const TOOL_FACT_PREDICATES: &[&str] = &[
    "registered_tool",
    "tool_registered",
    "tool_hash",
    "tool_capability",
];

/// The tool registry
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Tool>>,
    kernel: Arc<Kernel>,
}

impl ToolRegistry {
    /// Create a registry bound to a kernel
    pub fn new(kernel: Arc<Kernel>) -> Arc<Self> {
        Arc::new(ToolRegistry {
            tools: RwLock::new(HashMap::new()),
            kernel,
        })
    }

    /// Register a tool and assert its facts. A command that looks like a
    /// path must point at an existing file.
    pub fn register(
        &self,
        name: impl Into<String>,
        command: impl Into<String>,
        shard_affinity: &str,
        description: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Result<()> {
        let name = name.into();
        let command = command.into();

        let looks_like_path = command.contains('/') || command.contains('\\');
        if looks_like_path && !Path::new(&command).is_file() {
            return Err(NerdError::ToolNotFound(format!(
                "binary path does not exist: {command}"
            )));
        }

        let hash = match std::fs::read(&command) {
            Ok(bytes) => hex_digest(&bytes),
            Err(_) => hex_digest(command.as_bytes()),
        };

        let tool = Tool {
            name: name.clone(),
            command,
            shard_affinity: normalize_affinity(shard_affinity),
            description: description.into(),
            capabilities,
            hash,
            registered_at: chrono::Utc::now().timestamp(),
            execute_count: 0,
        };

        let mut facts = vec![
            Fact::new(
                "registered_tool",
                vec![
                    Value::string(&tool.name),
                    Value::string(&tool.command),
                    Value::name(&tool.shard_affinity),
                ],
            ),
            Fact::binary(
                "tool_registered",
                Value::string(&tool.name),
                Value::Int(tool.registered_at),
            ),
            Fact::binary(
                "tool_hash",
                Value::string(&tool.name),
                Value::string(&tool.hash),
            ),
        ];
        for capability in &tool.capabilities {
            facts.push(Fact::binary(
                "tool_capability",
                Value::string(&tool.name),
                Value::string(capability),
            ));
        }

        self.tools.write().insert(name.clone(), tool);
        self.kernel.assert_batch(facts)?;
        info!(tool = %name, "tool registered");
        Ok(())
    }

    /// Remove a tool and retract only its facts (prefix-matched by the
    /// tool name); other tools' facts are untouched.
    pub fn unregister(&self, name: &str) -> Result<()> {
        if self.tools.write().remove(name).is_none() {
            return Err(NerdError::ToolNotFound(name.to_string()));
        }
        for predicate in TOOL_FACT_PREDICATES {
            self.kernel
                .retract_fact(&Fact::unary(*predicate, Value::string(name)));
        }
        self.kernel.evaluate()?;
        info!(tool = %name, "tool unregistered");
        Ok(())
    }

    /// Look up a tool by name
    pub fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.read().get(name).cloned()
    }

    /// Registered tool count
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Execute a tool. JSON-looking input is passed as one argument;
    /// anything else is whitespace-split. Returns combined
    /// stdout/stderr; subprocess failure carries the partial output.
    pub async fn execute(&self, name: &str, input: &str) -> Result<String> {
        let command = {
            let mut tools = self.tools.write();
            let tool = tools
                .get_mut(name)
                .ok_or_else(|| NerdError::ToolNotFound(name.to_string()))?;
            tool.execute_count += 1;
            tool.command.clone()
        };

        let trimmed = input.trim();
        let args: Vec<String> = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            vec![trimmed.to_string()]
        } else if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split_whitespace().map(String::from).collect()
        };

        let mut process = tokio::process::Command::new(&command);
        process
            .args(&args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(var) {
                process.env(var, value);
            }
        }

        let output = process.output().await.map_err(|e| {
            NerdError::ToolExecutionFailed {
                tool: name.to_string(),
                reason: format!("spawn failed: {e}"),
                output: String::new(),
            }
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(NerdError::ToolExecutionFailed {
                tool: name.to_string(),
                reason: format!("exit status {}", output.status.code().unwrap_or(-1)),
                output: combined,
            })
        }
    }

    /// Rehydrate tools from a directory of compiled binaries: every
    /// non-directory entry, extension stripped, becomes a tool. Returns
    /// the success count alongside the collected failures.
    pub fn restore_from_dir(&self, dir: &Path) -> Result<(usize, Vec<String>)> {
        let mut restored = 0;
        let mut errors = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    errors.push(format!("unreadable entry: {e}"));
                    continue;
                }
            };
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                errors.push(format!("unnameable entry: {}", path.display()));
                continue;
            };

            match self.register(
                &name,
                path.to_string_lossy().into_owned(),
                "all",
                "restored from compiled directory",
                Vec::new(),
            ) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(tool = %name, error = %e, "restoration failed");
                    errors.push(format!("{name}: {e}"));
                }
            }
        }

        Ok((restored, errors))
    }

    /// Rehydrate tools from static manifest definitions
    pub fn restore_from_manifest(&self, defs: &[StaticToolDef]) -> (usize, Vec<String>) {
        let mut restored = 0;
        let mut errors = Vec::new();
        for def in defs {
            match self.register(
                &def.name,
                &def.command,
                &def.shard_affinity,
                &def.description,
                if def.category.is_empty() {
                    Vec::new()
                } else {
                    vec![def.category.clone()]
                },
            ) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(tool = %def.name, error = %e, "manifest restoration failed");
                    errors.push(format!("{}: {e}", def.name));
                }
            }
        }
        (restored, errors)
    }

    /// Parse a TOML tool manifest (`[[tool]]` tables)
    pub fn load_manifest(path: &Path) -> Result<Vec<StaticToolDef>> {
        let text = std::fs::read_to_string(path)?;
        let manifest: ToolManifest = toml::from_str(&text)
            .map_err(|e| NerdError::Parse(format!("tool manifest: {e}")))?;
        Ok(manifest.tool)
    }

    /// Register the `tool_exec` handler on a virtual store: the request
    /// target is the tool name, the `input` payload entry its input.
    pub fn register_exec_handler(self: &Arc<Self>, vstore: &VirtualStore) {
        let registry = self.clone();
        let handler: ActionHandler = Arc::new(move |request: ActionRequest| {
            let registry = registry.clone();
            Box::pin(async move {
                let input = request
                    .payload
                    .get("input")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                match registry.execute(&request.target, &input).await {
                    Ok(output) => Ok(crate::action::ActionResult::ok(output)),
                    Err(NerdError::ToolExecutionFailed {
                        tool,
                        reason,
                        output,
                    }) => {
                        let mut result = crate::action::ActionResult::failed(format!(
                            "{tool}: {reason}"
                        ));
                        result.output = output;
                        Ok(result)
                    }
                    Err(e) => Err(e),
                }
            })
        });
        vstore.register_handler(ActionType::ToolExec, handler);
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (Arc<ToolRegistry>, Arc<Kernel>) {
        let kernel = Arc::new(Kernel::new());
        (ToolRegistry::new(kernel.clone()), kernel)
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn test_normalize_affinity() {
        assert_eq!(normalize_affinity("all"), "/all");
        assert_eq!(normalize_affinity("/all"), "/all");
        assert_eq!(normalize_affinity("CoderShard"), "/coder");
        assert_eq!(normalize_affinity("Research"), "/research");
    }

    #[tokio::test]
    async fn test_register_asserts_facts() {
        let (registry, kernel) = registry();
        registry
            .register("echoer", "echo", "all", "echoes input", vec!["text".into()])
            .unwrap();

        assert_eq!(kernel.query("registered_tool").unwrap().len(), 1);
        assert_eq!(kernel.query("tool_registered").unwrap().len(), 1);
        assert_eq!(kernel.query("tool_hash").unwrap().len(), 1);
        assert_eq!(kernel.query("tool_capability").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_missing_binary_path() {
        let (registry, _kernel) = registry();
        let err = registry
            .register("ghost", "/no/such/binary", "all", "", vec![])
            .unwrap_err();
        assert!(matches!(err, NerdError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_unregister_retracts_only_named_tool() {
        let (registry, kernel) = registry();
        registry
            .register("alpha", "echo", "all", "", vec!["a".into()])
            .unwrap();
        registry
            .register("beta", "echo", "all", "", vec!["b".into()])
            .unwrap();

        registry.unregister("alpha").unwrap();

        let remaining = kernel.query("registered_tool").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].args[0], Value::string("beta"));
        assert_eq!(kernel.query("tool_capability").unwrap().len(), 1);
        assert!(registry.get_tool("alpha").is_none());
    }

    #[tokio::test]
    async fn test_register_unregister_round_trip() {
        let (registry, kernel) = registry();
        let before: usize = TOOL_FACT_PREDICATES
            .iter()
            .map(|p| kernel.query(p).unwrap().len())
            .sum();

        registry
            .register("temp", "echo", "all", "", vec!["x".into()])
            .unwrap();
        registry.unregister("temp").unwrap();

        let after: usize = TOOL_FACT_PREDICATES
            .iter()
            .map(|p| kernel.query(p).unwrap().len())
            .sum();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_execute_splits_plain_input() {
        let (registry, _kernel) = registry();
        registry
            .register("echoer", "echo", "all", "", vec![])
            .unwrap();
        let output = registry.execute("echoer", "hello world").await.unwrap();
        assert_eq!(output.trim(), "hello world");

        assert_eq!(registry.get_tool("echoer").unwrap().execute_count, 1);
    }

    #[tokio::test]
    async fn test_execute_passes_json_as_single_arg() {
        let (registry, _kernel) = registry();
        registry
            .register("echoer", "echo", "all", "", vec![])
            .unwrap();
        let output = registry
            .execute("echoer", r#"{"a": 1, "b": 2}"#)
            .await
            .unwrap();
        assert_eq!(output.trim(), r#"{"a": 1, "b": 2}"#);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let (registry, _kernel) = registry();
        let err = registry.execute("nope", "").await.unwrap_err();
        assert!(matches!(err, NerdError::ToolNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_failure_carries_partial_output() {
        let (registry, _kernel) = registry();
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "failing.sh", "#!/bin/sh\necho partial\nexit 3\n");
        registry
            .register("failing", script.to_string_lossy(), "all", "", vec![])
            .unwrap();

        let err = registry.execute("failing", "").await.unwrap_err();
        match err {
            NerdError::ToolExecutionFailed { output, reason, .. } => {
                assert!(output.contains("partial"));
                assert!(reason.contains("3"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_restore_from_dir() {
        let (registry, kernel) = registry();
        let dir = TempDir::new().unwrap();
        write_script(&dir, "mytool.exe", "#!/bin/sh\necho tool\n");
        write_script(&dir, "other", "#!/bin/sh\necho other\n");
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let (restored, errors) = registry.restore_from_dir(dir.path()).unwrap();
        assert_eq!(restored, 2);
        assert!(errors.is_empty());

        let tool = registry.get_tool("mytool").unwrap();
        assert_eq!(tool.shard_affinity, "/all");

        let facts = kernel.query("registered_tool(\"mytool\", C, A)").unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].args[2], Value::name("/all"));
        assert_eq!(kernel.query("tool_registered(\"mytool\", T)").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_from_manifest() {
        let (registry, _kernel) = registry();
        let defs = vec![
            StaticToolDef {
                name: "fmt".into(),
                category: "format".into(),
                description: "formats code".into(),
                command: "echo".into(),
                shard_affinity: "CoderShard".into(),
            },
            StaticToolDef {
                name: "broken".into(),
                category: String::new(),
                description: String::new(),
                command: "/no/such/path".into(),
                shard_affinity: "all".into(),
            },
        ];
        let (restored, errors) = registry.restore_from_manifest(&defs);
        assert_eq!(restored, 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(registry.get_tool("fmt").unwrap().shard_affinity, "/coder");
    }

    #[test]
    fn test_load_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tools.toml");
        std::fs::write(
            &path,
            r#"
[[tool]]
name = "fmt"
command = "echo"
shard_affinity = "CoderShard"
description = "formats code"

[[tool]]
name = "lint"
command = "echo"
"#,
        )
        .unwrap();

        let defs = ToolRegistry::load_manifest(&path).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[1].shard_affinity, "all");
    }
}
