//! Durable session/event store over embedded SQLite, plus the per-session
//! listener registry that fans appended events out to live subscribers.
//!
//! Events are append-only. Within a session, `(created_at, id)` totally
//! orders the log and matches emission order; listeners observe events in
//! exactly that order because notification happens under the same lock that
//! serializes appends.

use anyhow::Result;
use blah_core::{AgentEvent, EventRecord, now_millis, short_session_id};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        name TEXT
     );
     CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_events_session_time
        ON events(session_id, created_at);",
)];

const LIST_SESSIONS_MAX: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: i64,
    pub last_event_at: Option<i64>,
    pub event_count: i64,
}

struct ListenerEntry {
    id: u64,
    tx: Sender<EventRecord>,
}

type ListenerMap = HashMap<String, Vec<ListenerEntry>>;

/// A live tail on one session's event stream. Dropping it deregisters the
/// listener.
pub struct Subscription {
    session_id: String,
    listener_id: u64,
    rx: Receiver<EventRecord>,
    listeners: Arc<Mutex<ListenerMap>>,
}

impl Subscription {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<EventRecord> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<EventRecord> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut map) = self.listeners.lock()
            && let Some(entries) = map.get_mut(&self.session_id)
        {
            entries.retain(|entry| entry.id != self.listener_id);
            if entries.is_empty() {
                map.remove(&self.session_id);
            }
        }
    }
}

pub struct Store {
    db_path: PathBuf,
    listeners: Arc<Mutex<ListenerMap>>,
    next_listener_id: AtomicU64,
}

impl Store {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
        };
        store.init_db()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn db(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
             );",
        )?;
        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, now_millis()],
                )?;
            }
        }
        ensure_name_column(&conn)?;
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub fn create_session(&self) -> Result<String> {
        let conn = self.db()?;
        loop {
            let id = short_session_id();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions (id, created_at) VALUES (?1, ?2)",
                params![id, now_millis()],
            )?;
            if inserted == 1 {
                return Ok(id);
            }
        }
    }

    pub fn session_exists(&self, id: &str) -> Result<bool> {
        let conn = self.db()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM sessions WHERE id = ?1",
            [id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionSummary>> {
        let conn = self.db()?;
        let summary = conn
            .query_row(
                "SELECT s.id, s.name, s.created_at,
                        MAX(e.created_at) AS last_event_at,
                        COUNT(e.id) AS event_count
                 FROM sessions s
                 LEFT JOIN events e ON e.session_id = s.id
                 WHERE s.id = ?1
                 GROUP BY s.id",
                [id],
                row_to_summary,
            )
            .optional()?;
        Ok(summary)
    }

    /// Summaries ordered by most recent activity (last event, else
    /// creation). `limit` is clamped to `[1, 500]`.
    pub fn list_sessions(&self, limit: u64) -> Result<Vec<SessionSummary>> {
        let limit = limit.clamp(1, LIST_SESSIONS_MAX);
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.name, s.created_at,
                    MAX(e.created_at) AS last_event_at,
                    COUNT(e.id) AS event_count
             FROM sessions s
             LEFT JOIN events e ON e.session_id = s.id
             GROUP BY s.id
             ORDER BY COALESCE(MAX(e.created_at), s.created_at) DESC, s.id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_summary)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Trims the name; empty names are a no-op. Returns whether the session
    /// exists.
    pub fn update_session_name(&self, id: &str, name: &str) -> Result<bool> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return self.session_exists(id);
        }
        let conn = self.db()?;
        let changed = conn.execute(
            "UPDATE sessions SET name = ?1 WHERE id = ?2",
            params![trimmed, id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_last_session_id(&self) -> Result<Option<String>> {
        Ok(self.list_sessions(1)?.into_iter().next().map(|s| s.id))
    }

    // ── Events ───────────────────────────────────────────────────────────

    /// Append is the sole mutation path. The listener-registry lock doubles
    /// as the write lock so that notification order equals append order and
    /// snapshot subscriptions cannot race an in-flight append.
    pub fn append_event(&self, session_id: &str, event: &AgentEvent) -> Result<EventRecord> {
        let (kind, payload) = event.to_parts();
        self.append_raw(session_id, &kind, &payload)
    }

    pub fn append_raw(&self, session_id: &str, kind: &str, payload: &Value) -> Result<EventRecord> {
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| anyhow::anyhow!("listener registry poisoned"))?;

        let created_at = now_millis();
        let payload_text = serde_json::to_string(payload)?;
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO events (session_id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, kind, payload_text, created_at],
        )?;
        let record = EventRecord {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            created_at,
        };

        // Row is durable; notify. Unbounded senders never block, and a
        // subscriber whose receiver is gone is pruned here.
        if let Some(entries) = listeners.get_mut(session_id) {
            entries.retain(|entry| entry.tx.send(record.clone()).is_ok());
            if entries.is_empty() {
                listeners.remove(session_id);
            }
        }
        Ok(record)
    }

    /// Full ordered log for a session. A malformed stored payload never
    /// fails the listing; it surfaces as `{"raw": <text>}`.
    pub fn list_events(&self, session_id: &str) -> Result<Vec<EventRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, kind, payload, created_at
             FROM events WHERE session_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([session_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, session_id, kind, payload_text, created_at) = row?;
            let payload = serde_json::from_str(&payload_text)
                .unwrap_or_else(|_| serde_json::json!({ "raw": payload_text }));
            out.push(EventRecord {
                id,
                session_id,
                kind,
                payload,
                created_at,
            });
        }
        Ok(out)
    }

    // ── Fan-out ──────────────────────────────────────────────────────────

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let mut map = self.listeners.lock().expect("listener registry");
        self.register_locked(&mut map, session_id)
    }

    /// Atomically snapshot the current log and register a live listener:
    /// no event can land between the snapshot and the subscription.
    pub fn subscribe_with_snapshot(
        &self,
        session_id: &str,
    ) -> Result<(Vec<EventRecord>, Subscription)> {
        let mut map = self
            .listeners
            .lock()
            .map_err(|_| anyhow::anyhow!("listener registry poisoned"))?;
        let snapshot = self.list_events(session_id)?;
        let subscription = self.register_locked(&mut map, session_id);
        Ok((snapshot, subscription))
    }

    fn register_locked(&self, map: &mut ListenerMap, session_id: &str) -> Subscription {
        let (tx, rx) = channel();
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        map.entry(session_id.to_string())
            .or_default()
            .push(ListenerEntry { id: listener_id, tx });
        Subscription {
            session_id: session_id.to_string(),
            listener_id,
            rx,
            listeners: Arc::clone(&self.listeners),
        }
    }
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        last_event_at: row.get(3)?,
        event_count: row.get(4)?,
    })
}

/// Legacy stores predate the `name` column; add it idempotently.
fn ensure_name_column(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(sessions)")?;
    let columns = stmt.query_map([], |r| r.get::<_, String>(1))?;
    for column in columns {
        if column? == "name" {
            return Ok(());
        }
    }
    conn.execute("ALTER TABLE sessions ADD COLUMN name TEXT", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blah_core::AgentEvent;
    use serde_json::json;
    use std::thread;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(&dir.path().join("sessions.db")).expect("store");
        (dir, store)
    }

    fn assistant(text: &str) -> AgentEvent {
        AgentEvent::Assistant {
            text: text.to_string(),
        }
    }

    #[test]
    fn create_and_get_session_round_trip() {
        let (_dir, store) = temp_store();
        let id = store.create_session().expect("create");
        let summary = store.get_session(&id).expect("get").expect("present");
        assert_eq!(summary.id, id);
        assert!(summary.created_at > 0);
        assert_eq!(summary.event_count, 0);
        assert!(summary.last_event_at.is_none());
    }

    #[test]
    fn append_then_list_preserves_payload_and_order() {
        let (_dir, store) = temp_store();
        let id = store.create_session().expect("create");
        store.append_event(&id, &assistant("one")).expect("append");
        store
            .append_event(
                &id,
                &AgentEvent::ToolResult {
                    tool: "list_files".to_string(),
                    result: json!({"files": [], "total": 0}),
                },
            )
            .expect("append");
        let events = store.list_events(&id).expect("list");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "assistant");
        assert_eq!(events[0].payload, json!({"text": "one"}));
        assert_eq!(events[1].kind, "tool_result");
        assert_eq!(events[1].payload["result"]["total"], 0);
        assert!(
            (events[0].created_at, events[0].id) < (events[1].created_at, events[1].id),
            "log must be totally ordered"
        );
    }

    #[test]
    fn malformed_payload_surfaces_as_raw() {
        let (_dir, store) = temp_store();
        let id = store.create_session().expect("create");
        // Corrupt a row by hand; listing must not fail.
        let conn = store.db().expect("conn");
        conn.execute(
            "INSERT INTO events (session_id, kind, payload, created_at) VALUES (?1, 'assistant', 'not json{', ?2)",
            params![id, now_millis()],
        )
        .expect("insert corrupt row");
        let events = store.list_events(&id).expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({"raw": "not json{"}));
    }

    #[test]
    fn session_ordering_follows_last_activity() {
        let (_dir, store) = temp_store();
        let a = store.create_session().expect("a");
        thread::sleep(Duration::from_millis(3));
        let b = store.create_session().expect("b");
        thread::sleep(Duration::from_millis(6));
        store.append_event(&a, &assistant("wake up")).expect("append");

        let sessions = store.list_sessions(10).expect("list");
        assert_eq!(sessions[0].id, a, "A has the most recent activity");
        assert_eq!(sessions[1].id, b);
        assert_eq!(store.get_last_session_id().expect("last"), Some(a));
    }

    #[test]
    fn list_sessions_clamps_limit() {
        let (_dir, store) = temp_store();
        for _ in 0..3 {
            store.create_session().expect("create");
        }
        assert_eq!(store.list_sessions(0).expect("list").len(), 1);
        assert_eq!(store.list_sessions(9999).expect("list").len(), 3);
    }

    #[test]
    fn rename_trims_and_ignores_empty() {
        let (_dir, store) = temp_store();
        let id = store.create_session().expect("create");
        assert!(store.update_session_name(&id, "  build fix  ").expect("rename"));
        assert_eq!(
            store.get_session(&id).expect("get").expect("some").name,
            Some("build fix".to_string())
        );
        assert!(store.update_session_name(&id, "   ").expect("noop"));
        assert_eq!(
            store.get_session(&id).expect("get").expect("some").name,
            Some("build fix".to_string())
        );
        assert!(!store.update_session_name("missing", "x").expect("unknown"));
    }

    #[test]
    fn subscriber_sees_events_in_append_order() {
        let (_dir, store) = temp_store();
        let id = store.create_session().expect("create");
        let sub = store.subscribe(&id);
        for i in 0..5 {
            store
                .append_event(&id, &assistant(&format!("m{i}")))
                .expect("append");
        }
        let mut seen = Vec::new();
        while let Some(record) = sub.try_recv() {
            seen.push(record.payload["text"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn snapshot_subscription_misses_nothing_and_duplicates_nothing() {
        let (_dir, store) = temp_store();
        let id = store.create_session().expect("create");
        store.append_event(&id, &assistant("before")).expect("append");
        let (snapshot, sub) = store.subscribe_with_snapshot(&id).expect("subscribe");
        assert_eq!(snapshot.len(), 1);
        store.append_event(&id, &assistant("after")).expect("append");
        let live = sub.recv_timeout(Duration::from_secs(1)).expect("live event");
        assert_eq!(live.payload["text"], "after");
        assert!(sub.try_recv().is_none(), "no duplicate of the snapshot row");
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let (_dir, store) = temp_store();
        let id = store.create_session().expect("create");
        let sub = store.subscribe(&id);
        drop(sub);
        // Appending after the drop must not error or leak the listener.
        store.append_event(&id, &assistant("x")).expect("append");
        assert!(store.listeners.lock().expect("lock").is_empty());
    }

    #[test]
    fn concurrent_appends_keep_total_order() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let id = store.create_session().expect("create");
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(thread::spawn(move || {
                for i in 0..10 {
                    store
                        .append_event(&id, &assistant(&format!("t{t}-{i}")))
                        .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        let events = store.list_events(&id).expect("list");
        assert_eq!(events.len(), 40);
        let mut keys: Vec<(i64, i64)> = events.iter().map(|e| (e.created_at, e.id)).collect();
        let sorted = {
            let mut copy = keys.clone();
            copy.sort();
            copy
        };
        assert_eq!(keys, sorted);
        keys.dedup();
        assert_eq!(keys.len(), 40, "ordering keys must be unique");
    }

    #[test]
    fn legacy_store_gains_name_column() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("sessions.db");
        {
            let conn = Connection::open(&db).expect("open");
            conn.execute_batch(
                "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL);
                 INSERT INTO schema_migrations (version, applied_at) VALUES (1, 0);
                 CREATE TABLE sessions (id TEXT PRIMARY KEY, created_at INTEGER NOT NULL);
                 CREATE TABLE events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                 );
                 INSERT INTO sessions (id, created_at) VALUES ('legacy1', 42);",
            )
            .expect("legacy schema");
        }
        // Opening twice proves idempotence.
        let store = Store::new(&db).expect("first open");
        drop(store);
        let store = Store::new(&db).expect("second open");
        assert!(store.update_session_name("legacy1", "named").expect("rename"));
        let summary = store.get_session("legacy1").expect("get").expect("some");
        assert_eq!(summary.name, Some("named".to_string()));
        assert_eq!(summary.created_at, 42);
    }
}
