//! Per-session registry of in-flight permission requests. A run thread
//! enqueues a request and blocks on its channel; an HTTP reply (or the
//! auto-deny timer) resolves it. Each request resolves exactly once:
//! `reply` removes the entry before sending, and an expired entry rejects
//! later replies.

use blah_agent::{PermissionPrompt, Resolution};
use blah_core::{Op, now_millis};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub request_id: Uuid,
    pub op: Op,
    pub tool: String,
    pub target: String,
    pub args: Value,
    pub created_at: i64,
}

struct Entry {
    request: PendingRequest,
    tx: Sender<Resolution>,
}

pub struct ApprovalBroker {
    timeout: Duration,
    sessions: Mutex<HashMap<String, HashMap<Uuid, Entry>>>,
}

impl ApprovalBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, session_id: &str, prompt: &PermissionPrompt) -> Receiver<Resolution> {
        let (tx, rx) = channel();
        let entry = Entry {
            request: PendingRequest {
                request_id: prompt.request_id,
                op: prompt.op,
                tool: prompt.tool.clone(),
                target: prompt.target.clone(),
                args: prompt.args.clone(),
                created_at: now_millis(),
            },
            tx,
        };
        self.sessions
            .lock()
            .expect("approval registry")
            .entry(session_id.to_string())
            .or_default()
            .insert(prompt.request_id, entry);
        rx
    }

    /// Block until an explicit reply lands or the auto-deny window closes.
    /// On timeout the entry is removed first, so a racing reply either won
    /// (its resolution is drained here) or gets a not-found.
    pub fn await_resolution(
        &self,
        session_id: &str,
        request_id: Uuid,
        rx: Receiver<Resolution>,
    ) -> Resolution {
        match rx.recv_timeout(self.timeout) {
            Ok(resolution) => resolution,
            Err(_) => {
                self.remove(session_id, request_id);
                rx.try_recv().unwrap_or_else(|_| Resolution::deny())
            }
        }
    }

    pub fn list(&self, session_id: &str) -> Vec<PendingRequest> {
        let sessions = self.sessions.lock().expect("approval registry");
        let mut requests: Vec<PendingRequest> = sessions
            .get(session_id)
            .map(|entries| entries.values().map(|e| e.request.clone()).collect())
            .unwrap_or_default();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Resolve a pending request. Returns false when the request is
    /// unknown (already resolved, expired, or never enqueued).
    pub fn reply(&self, session_id: &str, request_id: Uuid, resolution: Resolution) -> bool {
        let entry = {
            let mut sessions = self.sessions.lock().expect("approval registry");
            let Some(entries) = sessions.get_mut(session_id) else {
                return false;
            };
            let entry = entries.remove(&request_id);
            if entries.is_empty() {
                sessions.remove(session_id);
            }
            entry
        };
        match entry {
            Some(entry) => entry.tx.send(resolution).is_ok(),
            None => false,
        }
    }

    fn remove(&self, session_id: &str, request_id: Uuid) {
        let mut sessions = self.sessions.lock().expect("approval registry");
        if let Some(entries) = sessions.get_mut(session_id) {
            entries.remove(&request_id);
            if entries.is_empty() {
                sessions.remove(session_id);
            }
        }
    }
}
