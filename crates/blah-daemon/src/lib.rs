//! The blah-code daemon: HTTP surface over the session store, tool
//! runtime, policy value, and approval broker. Every request is handled on
//! its own thread; a panicking handler answers 500 and the daemon keeps
//! serving.

mod approvals;
mod logs;
mod sse;

pub use approvals::{ApprovalBroker, PendingRequest};
pub use logs::Logger;
pub use sse::SsePump;

use anyhow::{Context, Result, anyhow};
use blah_agent::{PermissionPrompt, Resolution, RunOptions, StepEngine};
use blah_core::{
    AgentEvent, AppConfig, CancelToken, CoreError, DEFAULT_MAX_STEPS, Decision, RememberRule,
    model_endpoint, resolve_api_key,
};
use blah_llm::{HttpModelTransport, ModelTransport};
use blah_policy::Policy;
use blah_store::Store;
use blah_tools::ToolRuntime;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use uuid::Uuid;

const DEFAULT_LOG_LINES: usize = 100;
const DEFAULT_SESSION_LIMIT: u64 = 50;

/// Where the daemon keeps its durable state.
pub struct DaemonPaths {
    pub db: PathBuf,
    pub logs: PathBuf,
}

impl Default for DaemonPaths {
    fn default() -> Self {
        Self {
            db: blah_core::db_path(),
            logs: blah_core::logs_dir(),
        }
    }
}

struct DaemonState {
    config: AppConfig,
    cwd: PathBuf,
    store: Store,
    tools: Arc<ToolRuntime>,
    policy: RwLock<Policy>,
    broker: ApprovalBroker,
    runs: Mutex<HashMap<String, Vec<(u64, CancelToken)>>>,
    next_run_id: AtomicU64,
    transport: Option<Arc<dyn ModelTransport + Send + Sync>>,
    logger: Logger,
}

pub struct Daemon {
    state: Arc<DaemonState>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

enum Reply {
    Json(u16, Value),
    Sse(Vec<blah_core::EventRecord>, blah_store::Subscription),
}

fn ok(body: Value) -> Reply {
    Reply::Json(200, body)
}

fn bad_request(message: impl std::fmt::Display) -> Reply {
    Reply::Json(400, json!({ "error": message.to_string() }))
}

fn not_found() -> Reply {
    Reply::Json(404, json!({ "error": "not found" }))
}

fn internal(message: impl std::fmt::Display) -> Reply {
    Reply::Json(500, json!({ "error": message.to_string() }))
}

impl Daemon {
    /// Build the daemon. An unparseable permission policy in config fails
    /// here, before anything starts serving.
    pub fn new(cwd: PathBuf, config: AppConfig, paths: DaemonPaths) -> Result<Self> {
        config.validate()?;
        let policy = Policy::normalize(Policy::from_value(&config.permission)?);
        let store = Store::new(&paths.db)?;
        let logger = Logger::open(&paths.logs, &config.logging)?;
        let tools = Arc::new(ToolRuntime::new());
        for warning in tools.connect_servers(&config.mcp) {
            logger.warn(&warning);
        }
        let broker = ApprovalBroker::new(Duration::from_millis(config.timeout.approval_ms));
        Ok(Self {
            state: Arc::new(DaemonState {
                config,
                cwd,
                store,
                tools,
                policy: RwLock::new(policy),
                broker,
                runs: Mutex::new(HashMap::new()),
                next_run_id: AtomicU64::new(1),
                transport: None,
                logger,
            }),
        })
    }

    /// Replace the per-request HTTP transport with a fixed one. Used by
    /// tests and embedders.
    pub fn with_transport(mut self, transport: Arc<dyn ModelTransport + Send + Sync>) -> Self {
        let state = Arc::get_mut(&mut self.state)
            .expect("with_transport must be called before the daemon starts");
        state.transport = Some(transport);
        self
    }

    /// Serve on the configured host/port in the current thread.
    pub fn serve(&self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.daemon.host, self.state.config.daemon.port
        );
        let server =
            Server::http(&addr).map_err(|err| anyhow!("failed to bind {addr}: {err}"))?;
        self.state.logger.info(&format!("daemon listening on {addr}"));
        accept_loop(Arc::clone(&self.state), server);
        Ok(())
    }

    /// Terminate tool-server subprocesses. Idempotent; used on shutdown
    /// paths.
    pub fn close(&self) {
        self.state.tools.close();
    }

    /// Bind an ephemeral listener and serve on a background thread.
    /// Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        let server = Server::http("127.0.0.1:0")
            .map_err(|err| anyhow!("failed to bind ephemeral port: {err}"))?;
        let addr = server
            .server_addr()
            .to_ip()
            .context("listener has no ip address")?;
        let state = Arc::clone(&self.state);
        thread::spawn(move || accept_loop(state, server));
        Ok(addr)
    }
}

fn accept_loop(state: Arc<DaemonState>, server: Server) {
    for request in server.incoming_requests() {
        let state = Arc::clone(&state);
        thread::spawn(move || handle(state, request));
    }
}

fn handle(state: Arc<DaemonState>, mut request: Request) {
    let reply = std::panic::catch_unwind(AssertUnwindSafe(|| route(&state, &mut request)))
        .unwrap_or_else(|_| {
            state.logger.error("request handler panicked");
            internal("internal error")
        });
    match reply {
        Reply::Json(status, body) => {
            let response = Response::from_string(body.to_string())
                .with_status_code(StatusCode(status))
                .with_header(json_header());
            if request.respond(response).is_err() {
                state.logger.debug("client disconnected during response");
            }
        }
        Reply::Sse(snapshot, subscription) => {
            // Take over the socket: tiny_http buffers streamed bodies, so
            // frames are written and flushed by hand.
            let response = Response::empty(StatusCode(200))
                .with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"text/event-stream"[..])
                        .expect("header"),
                )
                .with_header(
                    Header::from_bytes(&b"Cache-Control"[..], &b"no-cache"[..])
                        .expect("header"),
                );
            let mut stream = request.upgrade("sse", response);
            let pump = SsePump::new(subscription);
            let _ = pump.run(&mut stream, snapshot);
            state.logger.debug("event stream closed");
        }
    }
}

fn json_header() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).expect("header")
}

fn route(state: &Arc<DaemonState>, request: &mut Request) -> Reply {
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url.as_str(), ""),
    };
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let method = request.method().clone();

    match (&method, segments.as_slice()) {
        (Method::Get, ["health"]) => ok(json!({"status": "ok"})),
        (Method::Get, ["v1", "status"]) => handle_status(state),
        (Method::Get, ["v1", "logs"]) => {
            let lines = query_param(query, "lines")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_LOG_LINES);
            ok(json!({
                "path": state.logger.path().to_string_lossy(),
                "lines": state.logger.tail(lines),
            }))
        }
        (Method::Get, ["v1", "tools"]) => {
            let specs = state.tools.list_tool_specs();
            ok(json!({ "tools": specs }))
        }
        (Method::Get, ["v1", "permissions", "rules"]) => {
            let policy = state.policy.read().expect("policy lock").to_value();
            ok(json!({ "policy": policy }))
        }
        (Method::Post, ["v1", "permissions", "rules"]) => {
            with_body(request, |state, body| handle_set_rules(state, body), state)
        }
        (Method::Post, ["v1", "sessions"]) => match state.store.create_session() {
            Ok(id) => ok(json!({ "sessionId": id })),
            Err(err) => internal(err),
        },
        (Method::Get, ["v1", "sessions"]) => {
            let limit = query_param(query, "limit")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_SESSION_LIMIT);
            match state.store.list_sessions(limit) {
                Ok(sessions) => ok(json!({ "sessions": sessions })),
                Err(err) => internal(err),
            }
        }
        (Method::Patch, ["v1", "sessions", id]) => {
            let id = id.to_string();
            with_body(request, move |state, body| {
                let Some(name) = body.get("name").and_then(|v| v.as_str()) else {
                    return bad_request("'name' must be a string");
                };
                match state.store.update_session_name(&id, name) {
                    Ok(true) => ok(json!({"success": true})),
                    Ok(false) => not_found(),
                    Err(err) => internal(err),
                }
            }, state)
        }
        (Method::Post, ["v1", "sessions", id, "prompt"]) => {
            let id = id.to_string();
            with_body(request, move |state, body| handle_prompt(state, &id, body), state)
        }
        (Method::Get, ["v1", "sessions", id, "events"]) => {
            match state.store.session_exists(id) {
                Ok(true) => match state.store.list_events(id) {
                    Ok(events) => ok(json!(events)),
                    Err(err) => internal(err),
                },
                Ok(false) => not_found(),
                Err(err) => internal(err),
            }
        }
        (Method::Get, ["v1", "sessions", id, "events", "stream"]) => {
            match state.store.session_exists(id) {
                Ok(true) => match state.store.subscribe_with_snapshot(id) {
                    Ok((snapshot, subscription)) => Reply::Sse(snapshot, subscription),
                    Err(err) => internal(err),
                },
                Ok(false) => not_found(),
                Err(err) => internal(err),
            }
        }
        (Method::Get, ["v1", "sessions", id, "permissions"]) => {
            match state.store.session_exists(id) {
                Ok(true) => ok(json!(state.broker.list(id))),
                Ok(false) => not_found(),
                Err(err) => internal(err),
            }
        }
        (Method::Post, ["v1", "sessions", id, "permissions", request_id, "reply"]) => {
            let id = id.to_string();
            let request_id = request_id.to_string();
            with_body(request, move |state, body| {
                handle_permission_reply(state, &id, &request_id, body)
            }, state)
        }
        (Method::Post, ["v1", "sessions", id, "cancel"]) => {
            match state.store.session_exists(id) {
                Ok(true) => {
                    let runs = state.runs.lock().expect("run registry");
                    if let Some(tokens) = runs.get(*id) {
                        for (_, token) in tokens {
                            token.cancel();
                        }
                    }
                    ok(json!({"success": true}))
                }
                Ok(false) => not_found(),
                Err(err) => internal(err),
            }
        }
        (Method::Post, ["v1", "sessions", id, "checkpoint"]) => {
            let id = id.to_string();
            with_body(request, move |state, body| {
                match state.store.session_exists(&id) {
                    Ok(true) => {}
                    Ok(false) => return not_found(),
                    Err(err) => return internal(err),
                }
                let checkpoint_id = Uuid::now_v7();
                let event = AgentEvent::Checkpoint {
                    checkpoint_id,
                    name: body.get("name").and_then(|v| v.as_str()).map(String::from),
                    summary: body
                        .get("summary")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                };
                match state.store.append_event(&id, &event) {
                    Ok(_) => ok(json!({ "checkpointId": checkpoint_id })),
                    Err(err) => internal(err),
                }
            }, state)
        }
        (Method::Post, ["v1", "sessions", id, "revert"]) => {
            let id = id.to_string();
            with_body(request, move |state, body| {
                match state.store.session_exists(&id) {
                    Ok(true) => {}
                    Ok(false) => return not_found(),
                    Err(err) => return internal(err),
                }
                let Some(checkpoint_id) = body.get("checkpointId").and_then(|v| v.as_str())
                else {
                    return bad_request("'checkpointId' must be a string");
                };
                let event = AgentEvent::Revert {
                    checkpoint_id: checkpoint_id.to_string(),
                };
                match state.store.append_event(&id, &event) {
                    Ok(_) => ok(json!({"success": true})),
                    Err(err) => internal(err),
                }
            }, state)
        }
        _ => not_found(),
    }
}

/// Parse the request body as a JSON object (empty body reads as `{}`) and
/// hand it to the handler; malformed JSON is a 400.
fn with_body<F>(request: &mut Request, handler: F, state: &Arc<DaemonState>) -> Reply
where
    F: FnOnce(&Arc<DaemonState>, Value) -> Reply,
{
    let mut raw = String::new();
    if request.as_reader().read_to_string(&mut raw).is_err() {
        return bad_request("unreadable request body");
    }
    let body = if raw.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) if value.is_object() => value,
            Ok(_) => return bad_request("request body must be a JSON object"),
            Err(err) => return bad_request(format!("malformed JSON body: {err}")),
        }
    };
    handler(state, body)
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn handle_status(state: &Arc<DaemonState>) -> Reply {
    let active: Vec<String> = {
        let runs = state.runs.lock().expect("run registry");
        runs.iter()
            .filter(|(_, tokens)| !tokens.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    };
    ok(json!({
        "mode": "daemon",
        "cwd": state.cwd.to_string_lossy(),
        "modelId": state.config.model_id(),
        "apiKeyPresent": resolve_api_key().is_some(),
        "activeSessions": active,
        "dbPath": state.store.db_path().to_string_lossy(),
        "logPath": state.logger.path().to_string_lossy(),
        "daemonHealthy": true,
    }))
}

fn handle_set_rules(state: &Arc<DaemonState>, body: Value) -> Reply {
    let Some(raw) = body.get("policy") else {
        return bad_request("'policy' is required");
    };
    let policy = match Policy::from_value(raw) {
        Ok(policy) => Policy::normalize(policy),
        Err(err) => return bad_request(err),
    };
    let value = policy.to_value();
    *state.policy.write().expect("policy lock") = policy;
    ok(json!({"success": true, "policy": value}))
}

fn handle_permission_reply(
    state: &Arc<DaemonState>,
    session_id: &str,
    request_id: &str,
    body: Value,
) -> Reply {
    let Ok(request_id) = Uuid::parse_str(request_id) else {
        return bad_request("invalid request id");
    };
    let decision = match body.get("decision").and_then(|v| v.as_str()) {
        Some("allow") => Decision::Allow,
        Some("deny") => Decision::Deny,
        _ => return bad_request("'decision' must be \"allow\" or \"deny\""),
    };
    let remember = match body.get("remember") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let (Some(key), Some(pattern)) = (
                value.get("key").and_then(|v| v.as_str()),
                value.get("pattern").and_then(|v| v.as_str()),
            ) else {
                return bad_request("'remember' needs string 'key' and 'pattern'");
            };
            let rule_decision = match value.get("decision").and_then(|v| v.as_str()) {
                None => decision,
                Some("allow") => Decision::Allow,
                Some("deny") => Decision::Deny,
                Some("ask") => Decision::Ask,
                Some(other) => {
                    return bad_request(format!("invalid remember decision '{other}'"));
                }
            };
            Some(RememberRule {
                key: key.to_string(),
                pattern: pattern.to_string(),
                decision: rule_decision,
            })
        }
    };
    let resolved = state.broker.reply(
        session_id,
        request_id,
        Resolution { decision, remember },
    );
    if resolved {
        ok(json!({"success": true}))
    } else {
        not_found()
    }
}

fn handle_prompt(state: &Arc<DaemonState>, session_id: &str, body: Value) -> Reply {
    match state.store.session_exists(session_id) {
        Ok(true) => {}
        Ok(false) => return not_found(),
        Err(err) => return internal(err),
    }
    let Some(prompt) = body.get("prompt").and_then(|v| v.as_str()) else {
        return bad_request("'prompt' must be a string");
    };
    let api_key = resolve_api_key();
    if state.transport.is_none() && api_key.is_none() {
        return bad_request(CoreError::MissingCredentials);
    }
    let model_id = body
        .get("modelId")
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| state.config.model_id())
        .to_string();
    let timeout_ms = body
        .get("timeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(state.config.timeout.model_ms);

    if state
        .store
        .append_event(
            session_id,
            &AgentEvent::User {
                prompt: prompt.to_string(),
            },
        )
        .is_err()
    {
        return internal("failed to record prompt");
    }

    // Per-run policy snapshot; `remember` rules amend the run's copy only.
    let policy = state.policy.read().expect("policy lock").clone();
    let cancel = CancelToken::new();
    let run_id = state.next_run_id.fetch_add(1, Ordering::SeqCst);
    state
        .runs
        .lock()
        .expect("run registry")
        .entry(session_id.to_string())
        .or_default()
        .push((run_id, cancel.clone()));

    let transport: Arc<dyn ModelTransport + Send + Sync> = match &state.transport {
        Some(transport) => Arc::clone(transport),
        None => Arc::new(HttpModelTransport::new(
            model_endpoint(),
            api_key.unwrap_or_default(),
        )),
    };

    let sink = |event: AgentEvent| {
        if let Err(err) = state.store.append_event(session_id, &event) {
            state.logger.error(&format!("event append failed: {err}"));
        }
    };
    let resolver = |prompt: &PermissionPrompt| {
        let rx = state.broker.enqueue(session_id, prompt);
        state
            .broker
            .await_resolution(session_id, prompt.request_id, rx)
    };

    state
        .logger
        .info(&format!("run started session={session_id} model={model_id}"));
    let result = StepEngine::new(transport.as_ref())
        .with_tools(Arc::clone(&state.tools))
        .on_event(&sink)
        .on_permission_request(&resolver)
        .run(RunOptions {
            prompt: prompt.to_string(),
            model_id,
            cwd: state.cwd.clone(),
            max_steps: DEFAULT_MAX_STEPS,
            policy,
            timeout_ms: Some(timeout_ms),
            cancel: Some(cancel),
        });

    {
        let mut runs = state.runs.lock().expect("run registry");
        if let Some(tokens) = runs.get_mut(session_id) {
            tokens.retain(|(id, _)| *id != run_id);
            if tokens.is_empty() {
                runs.remove(session_id);
            }
        }
    }

    match result {
        Ok(outcome) => {
            state
                .logger
                .info(&format!("run finished session={session_id}"));
            ok(json!({"output": outcome.text, "policy": outcome.policy.to_value()}))
        }
        Err(err) => {
            state
                .logger
                .error(&format!("run failed session={session_id}: {err}"));
            internal(format!("run failed: {err} (see session {session_id} events)"))
        }
    }
}
