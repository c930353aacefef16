//! Client for externally-spawned tool servers spoken to over stdio with
//! newline-delimited JSON-RPC 2.0 frames.
//!
//! Lifecycle per server: spawn the subprocess, `initialize` handshake,
//! `notifications/initialized`, `tools/list`, then any number of
//! `tools/call` round-trips. One connection per server; calls are
//! serialized by the client's internal mutex.

use anyhow::{Result, anyhow};
use blah_core::McpServerConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(thiserror::Error, Debug)]
pub enum McpError {
    #[error("tool server '{server}' failed: {message}")]
    ToolFailed { server: String, message: String },
    #[error("tool server '{0}' is closed")]
    Closed(String),
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn call(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One tool advertised by a server's `tools/list`.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub read_only: bool,
}

// ── Client ───────────────────────────────────────────────────────────────

struct Connection {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: i64,
}

pub struct McpClient {
    name: String,
    conn: Mutex<Option<Connection>>,
}

impl McpClient {
    /// Spawn the configured server and run the handshake.
    pub fn spawn(name: &str, config: &McpServerConfig) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (key, value) in &config.env {
            command.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .map_err(|err| anyhow!("failed to spawn tool server '{name}': {err}"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("tool server '{name}' has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("tool server '{name}' has no stdout"))?;

        let client = Self {
            name: name.to_string(),
            conn: Mutex::new(Some(Connection {
                child,
                stdin,
                reader: BufReader::new(stdout),
                next_id: 1,
            })),
        };
        client.initialize()?;
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {
                    "name": "blah-code",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {},
            }),
        )?;
        self.notify("notifications/initialized", json!({}))?;
        Ok(())
    }

    pub fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let result = self.request("tools/list", json!({}))?;
        Ok(parse_tool_listing(&result))
    }

    /// Call a tool by its server-side (un-prefixed) name. Non-object
    /// arguments default to `{}`.
    pub fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        let arguments = if arguments.is_object() {
            arguments
        } else {
            json!({})
        };
        let result = self.request(
            "tools/call",
            json!({"name": tool, "arguments": arguments}),
        )?;
        if result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(McpError::ToolFailed {
                server: self.name.clone(),
                message: decode_tool_result(&result)
                    .as_str()
                    .unwrap_or("tool reported an error")
                    .to_string(),
            }
            .into());
        }
        Ok(decode_tool_result(&result))
    }

    fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("tool server '{}' lock poisoned", self.name))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| McpError::Closed(self.name.clone()))?;
        let id = conn.next_id;
        conn.next_id += 1;
        let frame = serde_json::to_string(&JsonRpcRequest::call(id, method, params))?;
        writeln!(conn.stdin, "{frame}")?;
        conn.stdin.flush()?;

        let response = read_response(&mut conn.reader, id)
            .map_err(|err| anyhow!("tool server '{}': {err}", self.name))?;
        if let Some(error) = response.error {
            return Err(McpError::ToolFailed {
                server: self.name.clone(),
                message: error.message,
            }
            .into());
        }
        response
            .result
            .ok_or_else(|| anyhow!("tool server '{}' returned an empty response", self.name))
    }

    fn notify(&self, method: &str, params: Value) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("tool server '{}' lock poisoned", self.name))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| McpError::Closed(self.name.clone()))?;
        let frame = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        writeln!(conn.stdin, "{frame}")?;
        conn.stdin.flush()?;
        Ok(())
    }

    /// Terminate the subprocess. Idempotent; errors are suppressed.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.conn.lock()
            && let Some(mut conn) = guard.take()
        {
            let _ = conn.child.kill();
            let _ = conn.child.wait();
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read frames until the one answering `id` arrives, skipping server
/// notifications and stale responses.
fn read_response<R: BufRead>(reader: &mut R, id: i64) -> Result<JsonRpcResponse> {
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Err(anyhow!("connection closed before response {id}"));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
            continue;
        };
        if response.id == Some(id) && (response.result.is_some() || response.error.is_some()) {
            return Ok(response);
        }
    }
}

fn parse_tool_listing(result: &Value) -> Vec<McpToolInfo> {
    result
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?.to_string();
                    Some(McpToolInfo {
                        name,
                        description: entry
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        schema: entry
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object"})),
                        read_only: entry
                            .get("annotations")
                            .and_then(|a| a.get("readOnlyHint"))
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Response decoding: prefer `structuredContent`, else concatenate textual
/// content items (JSON-stringifying anything non-text), else stringify the
/// whole result.
fn decode_tool_result(result: &Value) -> Value {
    if let Some(structured) = result.get("structuredContent") {
        return structured.clone();
    }
    if let Some(items) = result.get("content").and_then(|v| v.as_array()) {
        let parts: Vec<String> = items
            .iter()
            .map(|item| {
                if item.get("type").and_then(|v| v.as_str()) == Some("text") {
                    item.get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                } else {
                    serde_json::to_string(item).unwrap_or_default()
                }
            })
            .collect();
        return Value::String(parts.join("\n"));
    }
    json!({ "output": result.to_string() })
}
