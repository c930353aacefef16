//! Scripted mock model server for tests: a raw TCP listener that answers
//! `chat/completions`-shaped requests with queued scenarios, including
//! SSE-streamed deltas. Each incoming request pops one scenario; an empty
//! queue echoes the prompt back.

use serde_json::Value;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A scripted response the mock server should return next.
#[derive(Debug, Clone)]
pub enum Scenario {
    /// A complete (non-streamed) text response.
    Text(String),
    /// An SSE stream of content deltas; the final text is their
    /// concatenation.
    Stream { deltas: Vec<String> },
    /// An HTTP error status with an empty JSON body.
    HttpError(u16),
    /// Accept the connection, then stall without responding.
    StallMs(u64),
}

pub struct MockModelServer {
    pub endpoint: String,
    addr: SocketAddr,
    queue: Arc<Mutex<VecDeque<Scenario>>>,
    stopping: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockModelServer {
    pub fn push(&self, scenario: Scenario) {
        self.queue.lock().expect("scenario queue").push_back(scenario);
    }

    pub fn push_many(&self, scenarios: impl IntoIterator<Item = Scenario>) {
        self.queue
            .lock()
            .expect("scenario queue")
            .extend(scenarios);
    }
}

impl Drop for MockModelServer {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        // A throwaway connection unblocks the accept loop so it can see
        // the stop flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Start the mock server on a random local port.
pub fn start_mock_model_server() -> MockModelServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock model server");
    let addr = listener.local_addr().expect("mock addr");
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let stopping = Arc::new(AtomicBool::new(false));

    let handle = thread::spawn({
        let queue = Arc::clone(&queue);
        let stopping = Arc::clone(&stopping);
        move || {
            for stream in listener.incoming() {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else {
                    break;
                };
                let scenario = queue.lock().expect("scenario queue").pop_front();
                let _ = serve_one(stream, scenario);
            }
        }
    });

    MockModelServer {
        endpoint: format!("http://{addr}/chat/completions"),
        addr,
        queue,
        stopping,
        handle: Some(handle),
    }
}

fn serve_one(stream: TcpStream, scenario: Option<Scenario>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let body = read_request(&mut reader)?;
    let mut stream = stream;

    match scenario {
        Some(Scenario::HttpError(code)) => respond(&mut stream, code, "application/json", "{}"),
        Some(Scenario::StallMs(ms)) => {
            thread::sleep(Duration::from_millis(ms));
            Ok(())
        }
        Some(Scenario::Stream { deltas }) => {
            let mut payload = String::new();
            for delta in &deltas {
                let frame = serde_json::json!({
                    "choices": [{"delta": {"content": delta}}]
                });
                payload.push_str(&format!("data: {frame}\n\n"));
            }
            payload.push_str("data: [DONE]\n\n");
            respond(&mut stream, 200, "text/event-stream", &payload)
        }
        Some(Scenario::Text(text)) => {
            respond(&mut stream, 200, "application/json", &completion_body(&text))
        }
        None => {
            let prompt = last_user_content(&body).unwrap_or_else(|| "test".to_string());
            let text = format!("Mock response: {prompt}");
            respond(&mut stream, 200, "application/json", &completion_body(&text))
        }
    }
}

/// Consume the request head, then exactly Content-Length body bytes.
fn read_request(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    Ok(body)
}

fn respond(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Error",
    };
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

fn completion_body(text: &str) -> String {
    serde_json::json!({
        "choices": [{
            "finish_reason": "stop",
            "message": {"content": text}
        }]
    })
    .to_string()
}

fn last_user_content(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let messages = value.pointer("/messages")?.as_array()?;
    Some(messages.last()?.pointer("/content")?.as_str()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(endpoint: &str) -> serde_json::Value {
        let client = reqwest::blocking::Client::new();
        client
            .post(endpoint)
            .json(&serde_json::json!({
                "messages": [{"role": "user", "content": "probe"}]
            }))
            .send()
            .expect("request")
            .json()
            .expect("json")
    }

    #[test]
    fn scripted_text_response() {
        let mock = start_mock_model_server();
        mock.push(Scenario::Text("hello world".to_string()));
        let body = post(&mock.endpoint);
        assert_eq!(body["choices"][0]["message"]["content"], "hello world");
    }

    #[test]
    fn scenarios_pop_in_order() {
        let mock = start_mock_model_server();
        mock.push_many([
            Scenario::Text("first".to_string()),
            Scenario::Text("second".to_string()),
        ]);
        assert_eq!(post(&mock.endpoint)["choices"][0]["message"]["content"], "first");
        assert_eq!(post(&mock.endpoint)["choices"][0]["message"]["content"], "second");
    }

    #[test]
    fn empty_queue_echoes_the_prompt() {
        let mock = start_mock_model_server();
        let body = post(&mock.endpoint);
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "Mock response: probe"
        );
    }

    #[test]
    fn streamed_scenario_produces_sse_frames() {
        let mock = start_mock_model_server();
        mock.push(Scenario::Stream {
            deltas: vec!["a".to_string(), "b".to_string()],
        });
        let client = reqwest::blocking::Client::new();
        let text = client
            .post(&mock.endpoint)
            .json(&serde_json::json!({"messages": []}))
            .send()
            .expect("request")
            .text()
            .expect("body");
        assert!(text.contains("data: "));
        assert!(text.contains("[DONE]"));
    }

    #[test]
    fn drop_shuts_down_cleanly() {
        let mock = start_mock_model_server();
        mock.push(Scenario::Text("unused".to_string()));
        // Joins the accept loop; hanging here is the failure mode.
        drop(mock);
    }
}
