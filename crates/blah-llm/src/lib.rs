//! Abstract streaming completion over a remote model provider.
//!
//! The engine depends only on [`ModelTransport`]; the concrete provider is
//! an external collaborator. Contract the engine assumes: the final text
//! comes back on success, deltas are forwarded zero or more times along the
//! way, a timeout fails with a message containing `timeout`, and
//! cancellation fails promptly with a message containing `cancel`.

use anyhow::{Result, anyhow};
use blah_core::{AgentMessage, CancelToken};
use serde::Serialize;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader};
use std::time::Duration;

/// Tool metadata forwarded to the provider alongside the transcript.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<AgentMessage>,
    pub model_id: String,
    pub tools: Vec<ToolDescriptor>,
    pub timeout_ms: Option<u64>,
}

/// One streamed chunk. Providers may send incremental pieces or cumulative
/// prefixes; consumers must not assume either form.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDelta {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
}

pub type DeltaSink<'a> = &'a mut dyn FnMut(StreamDelta);

pub trait ModelTransport {
    fn complete(
        &self,
        request: &CompletionRequest,
        cancel: Option<&CancelToken>,
        on_delta: Option<DeltaSink<'_>>,
    ) -> Result<Completion>;
}

// ── HTTP implementation ──────────────────────────────────────────────────

/// Blocking client for an OpenAI-style `chat/completions` endpoint with
/// `stream: true`. Deltas are parsed off the SSE body line by line and
/// handed to the sink as they arrive; cancellation is checked between
/// chunks.
pub struct HttpModelTransport {
    endpoint: String,
    api_key: String,
}

impl HttpModelTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

impl ModelTransport for HttpModelTransport {
    fn complete(
        &self,
        request: &CompletionRequest,
        cancel: Option<&CancelToken>,
        mut on_delta: Option<DeltaSink<'_>>,
    ) -> Result<Completion> {
        if let Some(token) = cancel
            && token.is_cancelled()
        {
            return Err(anyhow!("model call cancelled before send"));
        }

        let timeout_ms = request.timeout_ms.unwrap_or(60_000);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;

        let mut payload = json!({
            "model": &request.model_id,
            "messages": &request.messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": &tool.name,
                                "description": &tool.description,
                                "parameters": &tool.schema,
                            }
                        })
                    })
                    .collect(),
            );
        }

        let response = client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| classify_send_error(err, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("model API error {status}: {body}"));
        }

        let mut reader = BufReader::new(response);
        let mut accumulated = String::new();
        let mut raw_body = String::new();
        let mut parsed_any = false;
        let mut line = String::new();
        loop {
            if let Some(token) = cancel
                && token.is_cancelled()
            {
                return Err(anyhow!("model call cancelled"));
            }
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|err| classify_read_error(err, cancel, timeout_ms))?;
            if read == 0 {
                break;
            }
            raw_body.push_str(&line);
            let trimmed = line.trim();
            let Some(chunk) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let chunk = chunk.trim();
            if chunk == "[DONE]" {
                if let Some(sink) = on_delta.as_mut() {
                    sink(StreamDelta {
                        text: String::new(),
                        done: true,
                    });
                }
                break;
            }
            let Ok(value) = serde_json::from_str::<Value>(chunk) else {
                continue;
            };
            if let Some(content) = delta_content(&value) {
                parsed_any = true;
                accumulated.push_str(content);
                if let Some(sink) = on_delta.as_mut() {
                    sink(StreamDelta {
                        text: content.to_string(),
                        done: false,
                    });
                }
            } else if let Some(content) = message_content(&value) {
                // Some providers answer a stream request with one complete
                // message frame.
                parsed_any = true;
                accumulated.push_str(content);
            }
        }

        if parsed_any {
            return Ok(Completion { text: accumulated });
        }
        let text = message_content(&serde_json::from_str::<Value>(raw_body.trim())?)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("unexpected model payload: no message content"))?;
        Ok(Completion { text })
    }
}

fn delta_content(value: &Value) -> Option<&str> {
    value
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
}

fn message_content(value: &Value) -> Option<&str> {
    value
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
}

fn classify_send_error(err: reqwest::Error, timeout_ms: u64) -> anyhow::Error {
    if err.is_timeout() {
        anyhow!("model response timeout after {timeout_ms}ms")
    } else {
        anyhow!("model request failed: {err}")
    }
}

fn classify_read_error(
    err: std::io::Error,
    cancel: Option<&CancelToken>,
    timeout_ms: u64,
) -> anyhow::Error {
    if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
        return anyhow!("model call cancelled");
    }
    let text = err.to_string();
    if text.to_ascii_lowercase().contains("timed out") {
        anyhow!("model response timeout after {timeout_ms}ms")
    } else {
        anyhow!("model stream failed: {text}")
    }
}
