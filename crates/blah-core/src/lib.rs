use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_STEPS: usize = 8;
pub const API_KEY_ENV: &str = "BLAH_CODE_API_KEY";
pub const ENDPOINT_ENV: &str = "BLAH_CODE_ENDPOINT";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("missing credentials: set {API_KEY_ENV} or run `blah login`")]
    MissingCredentials,
}

// ── Paths ────────────────────────────────────────────────────────────────

pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .map(PathBuf::from)
}

/// `<home>/.blah-code`, overridable for tests via `BLAH_CODE_HOME`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BLAH_CODE_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".blah-code")
}

pub fn db_path() -> PathBuf {
    data_dir().join("sessions.db")
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn credentials_path() -> PathBuf {
    data_dir().join("credentials.json")
}

/// Resolve the provider API key: environment first, credentials file second.
pub fn resolve_api_key() -> Option<String> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        let key = key.trim().to_string();
        if !key.is_empty() {
            return Some(key);
        }
    }
    let raw = fs::read_to_string(credentials_path()).ok()?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    value
        .get("apiKey")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn model_endpoint() -> String {
    std::env::var(ENDPOINT_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
}

/// Short unique session id: the first half of a UUIDv7, which keeps ids
/// time-sortable while staying readable in logs and URLs.
pub fn short_session_id() -> String {
    Uuid::now_v7().simple().to_string()[..16].to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Permission vocabulary ────────────────────────────────────────────────

/// The four permission operations every tool action is classified under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Read,
    Write,
    Exec,
    Network,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Read => "read",
            Op::Write => "write",
            Op::Exec => "exec",
            Op::Network => "network",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Ask => "ask",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule the user asked to append to the working policy while resolving an
/// `ask` prompt. Applies to the run's policy snapshot only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RememberRule {
    pub key: String,
    pub pattern: String,
    pub decision: Decision,
}

// ── Conversation transcript ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of the transcript handed to the model. Not persisted; the event
/// log is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
}

impl AgentMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

// ── Event model ──────────────────────────────────────────────────────────

/// The closed set of event kinds the runtime emits. Stored as a snake_case
/// kind string plus a JSON payload so old logs survive newer binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted {
        model_id: String,
    },
    AssistantDelta {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        done: bool,
    },
    Assistant {
        text: String,
    },
    ToolCall {
        tool: String,
        arguments: Value,
    },
    ToolResult {
        tool: String,
        result: Value,
    },
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: Uuid,
        op: Op,
        tool: String,
        target: String,
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    PermissionResolved {
        request_id: Uuid,
        decision: Decision,
        remember: Option<RememberRule>,
    },
    RunFinished,
    RunFailed {
        message: String,
        kind: String,
    },
    ModelTimeout {
        message: String,
    },
    Error {
        message: String,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Checkpoint {
        checkpoint_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Revert {
        checkpoint_id: String,
    },
    User {
        prompt: String,
    },
}

impl AgentEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AgentEvent::RunStarted { .. } => "run_started",
            AgentEvent::AssistantDelta { .. } => "assistant_delta",
            AgentEvent::Assistant { .. } => "assistant",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::PermissionRequest { .. } => "permission_request",
            AgentEvent::PermissionResolved { .. } => "permission_resolved",
            AgentEvent::RunFinished => "run_finished",
            AgentEvent::RunFailed { .. } => "run_failed",
            AgentEvent::ModelTimeout { .. } => "model_timeout",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Done { .. } => "done",
            AgentEvent::Checkpoint { .. } => "checkpoint",
            AgentEvent::Revert { .. } => "revert",
            AgentEvent::User { .. } => "user",
        }
    }

    /// Split into the `(kind, payload)` pair the store persists.
    pub fn to_parts(&self) -> (String, Value) {
        let kind = self.kind_name().to_string();
        let payload = serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(Value::take))
            .unwrap_or_else(|| serde_json::json!({}));
        (kind, payload)
    }
}

/// A persisted, append-only event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub session_id: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: i64,
}

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cooperative cancellation flag shared across threads. Cancellation shows
/// up downstream as an error whose message contains `cancel`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub model: String,
    pub timeout: TimeoutConfig,
    pub logging: LoggingConfig,
    pub daemon: DaemonConfig,
    /// Raw permission policy map; normalized by the policy engine at startup.
    pub permission: Value,
    pub mcp: BTreeMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    pub model_ms: u64,
    pub approval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            model_ms: 60_000,
            approval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub print: bool,
    pub retain: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            print: false,
            retain: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub attach_url: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4517,
            attach_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct McpServerConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

impl AppConfig {
    /// Config discovery precedence, relative to `workspace`.
    pub fn candidate_paths(workspace: &Path) -> Vec<PathBuf> {
        vec![
            workspace.join("blah-code.json"),
            workspace.join(".blah-code.json"),
            data_dir().join("config.json"),
        ]
    }

    /// Load the first config file found, or defaults when none exists.
    /// Unknown fields are ignored; malformed JSON or out-of-range values
    /// fail fast.
    pub fn load(workspace: &Path) -> Result<Self> {
        for path in Self::candidate_paths(workspace) {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let cfg: AppConfig = serde_json::from_str(&raw).map_err(|err| {
                CoreError::InvalidConfig(format!("{}: {err}", path.display()))
            })?;
            cfg.validate()?;
            return Ok(cfg);
        }
        let mut cfg = Self::default();
        cfg.model = DEFAULT_MODEL.to_string();
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1_000..=600_000).contains(&self.timeout.model_ms) {
            return Err(CoreError::InvalidConfig(format!(
                "timeout.modelMs {} outside [1000, 600000]",
                self.timeout.model_ms
            ))
            .into());
        }
        if !(1_000..=3_600_000).contains(&self.timeout.approval_ms) {
            return Err(CoreError::InvalidConfig(format!(
                "timeout.approvalMs {} outside [1000, 3600000]",
                self.timeout.approval_ms
            ))
            .into());
        }
        if self.daemon.port == 0 {
            return Err(CoreError::InvalidConfig("daemon.port must be non-zero".to_string()).into());
        }
        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(CoreError::InvalidConfig(format!(
                    "logging.level '{other}' not one of debug|info|warn|error"
                ))
                .into());
            }
        }
        for (name, server) in &self.mcp {
            if server.enabled && server.command.trim().is_empty() {
                return Err(CoreError::InvalidConfig(format!(
                    "mcp.{name}.command must not be empty"
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn model_id(&self) -> &str {
        if self.model.trim().is_empty() {
            DEFAULT_MODEL
        } else {
            &self.model
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_round_trips_through_parts() {
        let event = AgentEvent::Assistant {
            text: "final answer".to_string(),
        };
        let (kind, payload) = event.to_parts();
        assert_eq!(kind, "assistant");
        assert_eq!(payload, json!({"text": "final answer"}));
    }

    #[test]
    fn unit_variant_has_empty_payload() {
        let (kind, payload) = AgentEvent::RunFinished.to_parts();
        assert_eq!(kind, "run_finished");
        assert_eq!(payload, json!({}));
    }

    #[test]
    fn done_reason_is_omitted_when_absent() {
        let (_, payload) = AgentEvent::Done { reason: None }.to_parts();
        assert_eq!(payload, json!({}));
        let (_, payload) = AgentEvent::Done {
            reason: Some("max_steps".to_string()),
        }
        .to_parts();
        assert_eq!(payload, json!({"reason": "max_steps"}));
    }

    #[test]
    fn permission_events_serialize_with_snake_case_kind() {
        let event = AgentEvent::PermissionResolved {
            request_id: Uuid::now_v7(),
            decision: Decision::Allow,
            remember: Some(RememberRule {
                key: "exec".to_string(),
                pattern: "git status".to_string(),
                decision: Decision::Allow,
            }),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["kind"], "permission_resolved");
        assert_eq!(value["payload"]["decision"], "allow");
        assert_eq!(value["payload"]["remember"]["pattern"], "git status");
    }

    #[test]
    fn short_session_ids_are_unique_and_short() {
        let a = short_session_id();
        let b = short_session_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn config_defaults_when_no_file_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.model_id(), DEFAULT_MODEL);
        assert_eq!(cfg.timeout.model_ms, 60_000);
        assert_eq!(cfg.daemon.port, 4517);
    }

    #[test]
    fn config_ignores_unknown_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("blah-code.json"),
            r#"{"model": "test-model", "futureKnob": true}"#,
        )
        .expect("write config");
        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.model, "test-model");
    }

    #[test]
    fn malformed_config_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("blah-code.json"), "{not json").expect("write config");
        let err = AppConfig::load(dir.path()).expect_err("should fail");
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn out_of_range_timeout_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(".blah-code.json"),
            r#"{"timeout": {"modelMs": 50}}"#,
        )
        .expect("write config");
        let err = AppConfig::load(dir.path()).expect_err("should fail");
        assert!(err.to_string().contains("timeout.modelMs"));
    }

    #[test]
    fn dotted_config_is_found_after_plain() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(".blah-code.json"),
            r#"{"model": "dotted"}"#,
        )
        .expect("write dotted");
        fs::write(
            dir.path().join("blah-code.json"),
            r#"{"model": "plain"}"#,
        )
        .expect("write plain");
        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.model, "plain");
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
