//! The agent step engine: the bounded per-prompt loop that alternates model
//! completions with tool executions.
//!
//! Each step calls the transport, tries to extract a tool invocation from
//! the reply, gates it through the permission policy (suspending on `ask`
//! when a resolver is attached), executes it, and folds the result into the
//! next turn. A reply with no tool call is the terminal answer. The engine
//! owns no durable state; it emits lifecycle events into whatever sink the
//! caller wires up.

mod parser;

use anyhow::Result;
use blah_core::{
    AgentEvent, AgentMessage, CancelToken, DEFAULT_MAX_STEPS, Decision, Op, RememberRule,
};
use blah_llm::{CompletionRequest, ModelTransport, StreamDelta, ToolDescriptor};
use blah_policy::{Policy, append_rule, evaluate};
use blah_tools::{ToolRuntime, ToolSpec};
pub use parser::{ParsedToolCall, extract_tool_call};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// A permission question raised while the loop is suspended on `ask`.
#[derive(Debug, Clone)]
pub struct PermissionPrompt {
    pub request_id: Uuid,
    pub op: Op,
    pub tool: String,
    pub target: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: Decision,
    pub remember: Option<RememberRule>,
}

impl Resolution {
    pub fn deny() -> Self {
        Self {
            decision: Decision::Deny,
            remember: None,
        }
    }

    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            remember: None,
        }
    }
}

pub type EventSink<'a> = &'a (dyn Fn(AgentEvent) + Sync);
pub type PermissionResolver<'a> = &'a (dyn Fn(&PermissionPrompt) -> Resolution + Sync);

pub struct RunOptions {
    pub prompt: String,
    pub model_id: String,
    pub cwd: PathBuf,
    pub max_steps: usize,
    pub policy: Policy,
    pub timeout_ms: Option<u64>,
    pub cancel: Option<CancelToken>,
}

impl RunOptions {
    pub fn new(prompt: impl Into<String>, model_id: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: model_id.into(),
            cwd,
            max_steps: DEFAULT_MAX_STEPS,
            policy: Policy::normalize(Policy::default()),
            timeout_ms: None,
            cancel: None,
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub text: String,
    pub messages: Vec<AgentMessage>,
    /// The working policy, including any rules remembered during the run.
    pub policy: Policy,
}

pub struct StepEngine<'a> {
    transport: &'a (dyn ModelTransport + Sync),
    tools: Option<Arc<ToolRuntime>>,
    on_event: Option<EventSink<'a>>,
    on_permission: Option<PermissionResolver<'a>>,
}

impl<'a> StepEngine<'a> {
    pub fn new(transport: &'a (dyn ModelTransport + Sync)) -> Self {
        Self {
            transport,
            tools: None,
            on_event: None,
            on_permission: None,
        }
    }

    /// Borrow a shared tool runtime. Without one the engine creates a
    /// built-ins-only runtime for the run and closes it on exit.
    pub fn with_tools(mut self, tools: Arc<ToolRuntime>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn on_event(mut self, sink: EventSink<'a>) -> Self {
        self.on_event = Some(sink);
        self
    }

    pub fn on_permission_request(mut self, resolver: PermissionResolver<'a>) -> Self {
        self.on_permission = Some(resolver);
        self
    }

    pub fn run(&self, opts: RunOptions) -> Result<RunOutcome> {
        let (tools, owned) = match &self.tools {
            Some(tools) => (Arc::clone(tools), false),
            None => (Arc::new(ToolRuntime::new()), true),
        };
        let result = self.run_inner(&tools, opts);
        if owned {
            tools.close();
        }
        result
    }

    fn run_inner(&self, tools: &ToolRuntime, opts: RunOptions) -> Result<RunOutcome> {
        let specs = tools.list_tool_specs();
        let descriptors: Vec<ToolDescriptor> = specs
            .iter()
            .map(|spec| ToolDescriptor {
                name: spec.name.clone(),
                description: spec.description.clone(),
                schema: spec.schema.clone(),
            })
            .collect();

        let mut messages = vec![
            AgentMessage::system(system_preamble(&specs)),
            AgentMessage::user(&opts.prompt),
        ];
        let mut policy = opts.policy.clone();

        self.emit(AgentEvent::RunStarted {
            model_id: opts.model_id.clone(),
        });

        for _step in 0..opts.max_steps {
            let request = CompletionRequest {
                messages: messages.clone(),
                model_id: opts.model_id.clone(),
                tools: descriptors.clone(),
                timeout_ms: opts.timeout_ms,
            };
            let mut sink = |delta: StreamDelta| {
                self.emit(AgentEvent::AssistantDelta {
                    text: delta.text,
                    done: delta.done,
                });
            };
            let completion =
                match self
                    .transport
                    .complete(&request, opts.cancel.as_ref(), Some(&mut sink))
                {
                    Ok(completion) => completion,
                    Err(err) => {
                        let message = err.to_string();
                        let kind = classify_failure(&message);
                        if kind == "timeout" {
                            self.emit(AgentEvent::ModelTimeout {
                                message: message.clone(),
                            });
                        } else {
                            self.emit(AgentEvent::Error {
                                message: message.clone(),
                            });
                        }
                        self.emit(AgentEvent::RunFailed {
                            message,
                            kind: kind.to_string(),
                        });
                        return Err(err);
                    }
                };

            let text = completion.text;
            let Some(call) = extract_tool_call(&text) else {
                // Terminal assistant answer.
                messages.push(AgentMessage::assistant(&text));
                self.emit(AgentEvent::Assistant { text: text.clone() });
                self.emit(AgentEvent::RunFinished);
                self.emit(AgentEvent::Done { reason: None });
                return Ok(RunOutcome {
                    text,
                    messages,
                    policy,
                });
            };

            let target = summarize_target(&call.tool, &call.arguments);
            let op = tools.permission_for(&call.tool);
            let subject = format!("tool.{}", call.tool);
            let mut decision = evaluate(&policy, op, Some(&subject), Some(&target));

            if decision == Decision::Ask
                && let Some(resolver) = self.on_permission
            {
                let prompt = PermissionPrompt {
                    request_id: Uuid::now_v7(),
                    op,
                    tool: call.tool.clone(),
                    target: target.clone(),
                    args: call.arguments.clone(),
                };
                self.emit(AgentEvent::PermissionRequest {
                    request_id: prompt.request_id,
                    op,
                    tool: prompt.tool.clone(),
                    target: prompt.target.clone(),
                    args: prompt.args.clone(),
                });
                let resolution = resolver(&prompt);
                if let Some(rule) = &resolution.remember {
                    policy = append_rule(&policy, &rule.key, &rule.pattern, rule.decision);
                }
                self.emit(AgentEvent::PermissionResolved {
                    request_id: prompt.request_id,
                    decision: resolution.decision,
                    remember: resolution.remember.clone(),
                });
                decision = resolution.decision;
            }

            if decision != Decision::Allow {
                let message = format!("Permission {decision} for {}", call.tool);
                messages.push(AgentMessage::tool(
                    json!({"tool": &call.tool, "ok": false, "error": &message}).to_string(),
                ));
                self.emit(AgentEvent::Error { message });
                continue;
            }

            self.emit(AgentEvent::ToolCall {
                tool: call.tool.clone(),
                arguments: call.arguments.clone(),
            });
            match tools.execute_tool(&call.tool, call.arguments.clone(), &opts.cwd) {
                Ok(result) => {
                    messages.push(AgentMessage::assistant(
                        json!({
                            "type": "tool_call",
                            "tool": &call.tool,
                            "arguments": &call.arguments,
                        })
                        .to_string(),
                    ));
                    messages.push(AgentMessage::tool(
                        json!({"tool": &call.tool, "ok": true, "result": &result}).to_string(),
                    ));
                    self.emit(AgentEvent::ToolResult {
                        tool: call.tool,
                        result,
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    messages.push(AgentMessage::tool(
                        json!({"tool": &call.tool, "ok": false, "error": &message}).to_string(),
                    ));
                    self.emit(AgentEvent::Error { message });
                }
            }
        }

        self.emit(AgentEvent::Done {
            reason: Some("max_steps".to_string()),
        });
        Ok(RunOutcome {
            text: "Stopped: max steps reached".to_string(),
            messages,
            policy,
        })
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(sink) = self.on_event {
            sink(event);
        }
    }
}

/// The human-readable target a permission decision applies to.
fn summarize_target(tool: &str, args: &Value) -> String {
    match tool {
        "exec" => args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        "read_file" | "write_file" => args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => serde_json::to_string(args).unwrap_or_default(),
    }
}

fn classify_failure(message: &str) -> &'static str {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("timeout") {
        "timeout"
    } else if lowered.contains("cancel") {
        "cancelled"
    } else {
        "error"
    }
}

fn system_preamble(specs: &[ToolSpec]) -> String {
    let mut listing = String::new();
    for spec in specs {
        listing.push_str(&format!(
            "- {}: {} (input schema: {})\n",
            spec.name, spec.description, spec.schema
        ));
    }
    format!(
        "You are a coding agent operating on the user's machine. You may \
         invoke tools to inspect and modify the working directory.\n\
         \n\
         To invoke a tool, reply with EXACTLY one JSON object and no other \
         prose:\n\
         {{\"type\":\"tool_call\",\"tool\":<name>,\"arguments\":<object>}}\n\
         \n\
         Each tool result arrives as a tool message on the next turn. When \
         you have the final answer, reply with plain text instead of a tool \
         call.\n\
         \n\
         Available tools:\n{listing}"
    )
}
