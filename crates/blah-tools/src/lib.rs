//! Uniform tool runtime: built-in tools executed in-process plus tools
//! exported by externally-spawned servers, dispatched by name through one
//! table. Every tool carries a permission operation; the engine consults
//! policy with it before any execution.

mod shell;

use anyhow::{Result, anyhow};
use blah_core::{McpServerConfig, Op};
use blah_mcp::McpClient;
use glob::Pattern;
use ignore::WalkBuilder;
use serde::Serialize;
use serde_json::{Value, json};
pub use shell::{CommandOutput, CommandRunner, SystemShell};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const LIST_FILES_DEFAULT_LIMIT: u64 = 200;
const LIST_FILES_MAX_LIMIT: u64 = 1_000;
const GREP_MAX_FILES: usize = 300;
const GREP_MAX_MATCHES: usize = 200;
const EXEC_DEFAULT_TIMEOUT_MS: u64 = 30_000;
const EXEC_MIN_TIMEOUT_MS: u64 = 100;
const EXEC_MAX_TIMEOUT_MS: u64 = 120_000;

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("path escapes the working directory")]
    PathEscape,
    #[error("invalid tool input: {0}")]
    InvalidInput(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub permission: Op,
}

struct ExternalTool {
    client: Arc<McpClient>,
    remote_name: String,
    spec: ToolSpec,
}

#[derive(Default)]
struct ExternalTable {
    clients: Vec<Arc<McpClient>>,
    tools: BTreeMap<String, ExternalTool>,
}

pub struct ToolRuntime {
    runner: Arc<dyn CommandRunner + Send + Sync>,
    external: Mutex<ExternalTable>,
}

impl Default for ToolRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRuntime {
    /// Built-in tools only.
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemShell))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner + Send + Sync>) -> Self {
        Self {
            runner,
            external: Mutex::new(ExternalTable::default()),
        }
    }

    /// Spawn every enabled server from config, binding its tools under
    /// `mcp.<server>.<tool>`. Returns one warning line per server that
    /// failed to come up; the runtime stays usable either way.
    pub fn connect_servers(&self, servers: &BTreeMap<String, McpServerConfig>) -> Vec<String> {
        let mut warnings = Vec::new();
        for (name, config) in servers {
            if !config.enabled {
                continue;
            }
            match self.add_server(name, config) {
                Ok(count) if count == 0 => {
                    warnings.push(format!("tool server '{name}' advertises no tools"));
                }
                Ok(_) => {}
                Err(err) => warnings.push(format!("tool server '{name}' failed: {err}")),
            }
        }
        warnings
    }

    pub fn add_server(&self, name: &str, config: &McpServerConfig) -> Result<usize> {
        let client = Arc::new(McpClient::spawn(name, config)?);
        let listed = client.list_tools()?;
        let mut table = self
            .external
            .lock()
            .map_err(|_| anyhow!("tool table poisoned"))?;
        let count = listed.len();
        for tool in listed {
            let bound_name = format!("mcp.{name}.{}", tool.name);
            let permission = if tool.read_only { Op::Read } else { Op::Exec };
            table.tools.insert(
                bound_name.clone(),
                ExternalTool {
                    client: Arc::clone(&client),
                    remote_name: tool.name,
                    spec: ToolSpec {
                        name: bound_name,
                        description: tool.description,
                        schema: tool.schema,
                        permission,
                    },
                },
            );
        }
        table.clients.push(client);
        Ok(count)
    }

    pub fn list_tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = builtin_specs();
        if let Ok(table) = self.external.lock() {
            specs.extend(table.tools.values().map(|tool| tool.spec.clone()));
        }
        specs
    }

    /// The permission operation a tool action is classified under. Unknown
    /// names fall back to `exec`, the most heavily gated operation.
    pub fn permission_for(&self, name: &str) -> Op {
        match name {
            "read_file" | "list_files" | "grep" => Op::Read,
            "write_file" => Op::Write,
            "exec" => Op::Exec,
            _ => {
                if let Ok(table) = self.external.lock()
                    && let Some(tool) = table.tools.get(name)
                {
                    return tool.spec.permission;
                }
                Op::Exec
            }
        }
    }

    pub fn execute_tool(&self, name: &str, input: Value, cwd: &Path) -> Result<Value> {
        match name {
            "read_file" => run_read_file(&input, cwd),
            "write_file" => run_write_file(&input, cwd),
            "list_files" => run_list_files(&input, cwd),
            "grep" => run_grep(&input, cwd),
            "exec" => run_exec(self.runner.as_ref(), &input, cwd),
            _ => {
                let (client, remote_name) = {
                    let table = self
                        .external
                        .lock()
                        .map_err(|_| anyhow!("tool table poisoned"))?;
                    let tool = table
                        .tools
                        .get(name)
                        .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
                    (Arc::clone(&tool.client), tool.remote_name.clone())
                };
                client.call_tool(&remote_name, input)
            }
        }
    }

    /// Terminate every tool-server subprocess concurrently and clear the
    /// binding table. Safe to call more than once.
    pub fn close(&self) {
        let clients = {
            let Ok(mut table) = self.external.lock() else {
                return;
            };
            table.tools.clear();
            std::mem::take(&mut table.clients)
        };
        let handles: Vec<_> = clients
            .into_iter()
            .map(|client| thread::spawn(move || client.shutdown()))
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read a UTF-8 file relative to the working directory.".to_string(),
            schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
            permission: Op::Read,
        },
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write a file, creating missing parent directories.".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
            permission: Op::Write,
        },
        ToolSpec {
            name: "list_files".to_string(),
            description: "List files matching a glob under the working directory.".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "default": "**/*"},
                    "limit": {"type": "integer", "default": LIST_FILES_DEFAULT_LIMIT,
                              "maximum": LIST_FILES_MAX_LIMIT}
                }
            }),
            permission: Op::Read,
        },
        ToolSpec {
            name: "grep".to_string(),
            description: "Search file contents with a case-insensitive regex.".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "glob": {"type": "string", "default": "**/*"}
                },
                "required": ["pattern"]
            }),
            permission: Op::Read,
        },
        ToolSpec {
            name: "exec".to_string(),
            description: "Run a shell command in the working directory.".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeoutMs": {"type": "integer", "default": EXEC_DEFAULT_TIMEOUT_MS,
                                  "minimum": EXEC_MIN_TIMEOUT_MS, "maximum": EXEC_MAX_TIMEOUT_MS}
                },
                "required": ["command"]
            }),
            permission: Op::Exec,
        },
    ]
}

// ── Built-in handlers ────────────────────────────────────────────────────

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("'{field}' must be a string")).into())
}

/// Lexically resolve `raw` against `cwd` and reject anything that escapes
/// it. Purely lexical: runs before any I/O.
fn resolve_within(cwd: &Path, raw: &str) -> Result<PathBuf> {
    let base = lexical_normalize(cwd);
    let resolved = lexical_normalize(&cwd.join(raw));
    if resolved.starts_with(&base) {
        Ok(resolved)
    } else {
        Err(ToolError::PathEscape.into())
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn run_read_file(input: &Value, cwd: &Path) -> Result<Value> {
    let path = require_str(input, "path")?;
    let full = resolve_within(cwd, path)?;
    let content = fs::read_to_string(&full)?;
    Ok(json!({"path": path, "content": content}))
}

fn run_write_file(input: &Value, cwd: &Path) -> Result<Value> {
    let path = require_str(input, "path")?;
    let content = require_str(input, "content")?;
    let full = resolve_within(cwd, path)?;
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full, content)?;
    Ok(json!({"path": path, "bytes": content.len()}))
}

fn workspace_files(cwd: &Path) -> Vec<String> {
    let mut builder = WalkBuilder::new(cwd);
    builder.hidden(false);
    builder.follow_links(false);
    builder.git_ignore(true);
    builder.git_global(false);
    builder.require_git(false);

    let mut files = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(cwd) else {
            continue;
        };
        if rel.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    files.dedup();
    files
}

fn run_list_files(input: &Value, cwd: &Path) -> Result<Value> {
    let pattern = input
        .get("pattern")
        .and_then(|v| v.as_str())
        .unwrap_or("**/*");
    let limit = match input.get("limit") {
        None | Some(Value::Null) => LIST_FILES_DEFAULT_LIMIT,
        Some(v) => v
            .as_u64()
            .filter(|n| (1..=LIST_FILES_MAX_LIMIT).contains(n))
            .ok_or_else(|| {
                ToolError::InvalidInput(format!(
                    "'limit' must be an integer in [1, {LIST_FILES_MAX_LIMIT}]"
                ))
            })?,
    };
    let compiled = Pattern::new(pattern)
        .map_err(|err| ToolError::InvalidInput(format!("invalid glob '{pattern}': {err}")))?;

    let matches: Vec<String> = workspace_files(cwd)
        .into_iter()
        .filter(|rel| compiled.matches(rel))
        .collect();
    let total = matches.len();
    let files: Vec<&String> = matches.iter().take(limit as usize).collect();
    Ok(json!({"files": files, "total": total}))
}

fn run_grep(input: &Value, cwd: &Path) -> Result<Value> {
    let pattern = require_str(input, "pattern")?;
    let glob_pattern = input
        .get("glob")
        .and_then(|v| v.as_str())
        .unwrap_or("**/*");
    let compiled_glob = Pattern::new(glob_pattern)
        .map_err(|err| ToolError::InvalidInput(format!("invalid glob '{glob_pattern}': {err}")))?;
    let regex = regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| ToolError::InvalidInput(format!("invalid regex '{pattern}': {err}")))?;

    let mut matches = Vec::new();
    let mut scanned = 0usize;
    'files: for rel in workspace_files(cwd) {
        if !compiled_glob.matches(&rel) {
            continue;
        }
        if scanned >= GREP_MAX_FILES {
            break;
        }
        scanned += 1;
        let Ok(content) = fs::read_to_string(cwd.join(&rel)) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(json!({"file": rel, "line": idx + 1, "text": line}));
                if matches.len() >= GREP_MAX_MATCHES {
                    break 'files;
                }
            }
        }
    }
    Ok(json!({"pattern": pattern, "matches": matches}))
}

fn run_exec(runner: &dyn CommandRunner, input: &Value, cwd: &Path) -> Result<Value> {
    let command = require_str(input, "command")?;
    let timeout_ms = match input.get("timeoutMs") {
        None | Some(Value::Null) => EXEC_DEFAULT_TIMEOUT_MS,
        Some(v) => v
            .as_u64()
            .filter(|n| (EXEC_MIN_TIMEOUT_MS..=EXEC_MAX_TIMEOUT_MS).contains(n))
            .ok_or_else(|| {
                ToolError::InvalidInput(format!(
                    "'timeoutMs' must be an integer in [{EXEC_MIN_TIMEOUT_MS}, {EXEC_MAX_TIMEOUT_MS}]"
                ))
            })?,
    };
    let output = runner.run(command, cwd, Duration::from_millis(timeout_ms))?;
    Ok(json!({
        "command": command,
        "exitCode": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
    }))
}
