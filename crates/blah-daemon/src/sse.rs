//! SSE framing over the store's listener channel. The daemon takes over
//! the client socket and pumps frames directly: one `snapshot` frame up
//! front, an `update` frame per appended event, and a `heartbeat` frame
//! while idle. Each frame is flushed immediately; the pump ends (and the
//! subscriber deregisters) when the client side goes away.

use blah_core::{EventRecord, now_millis};
use blah_store::Subscription;
use serde_json::json;
use std::io::Write;
use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct SsePump {
    subscription: Subscription,
    heartbeat: Duration,
}

impl SsePump {
    pub fn new(subscription: Subscription) -> Self {
        Self::with_heartbeat(subscription, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat(subscription: Subscription, heartbeat: Duration) -> Self {
        Self {
            subscription,
            heartbeat,
        }
    }

    /// Pump frames until the writer fails (client disconnect). The first
    /// frame replays the snapshot taken atomically with the subscription,
    /// so late events are never replayed and none are missed.
    pub fn run(self, writer: &mut dyn Write, snapshot: Vec<EventRecord>) -> std::io::Result<()> {
        write_frame(writer, "snapshot", &json!({ "events": snapshot }))?;
        loop {
            match self.subscription.recv_timeout(self.heartbeat) {
                Some(record) => write_frame(writer, "update", &json!({ "event": record }))?,
                None => write_frame(writer, "heartbeat", &json!({ "ts": now_millis() }))?,
            }
        }
    }
}

pub fn write_frame(
    writer: &mut dyn Write,
    event: &str,
    data: &serde_json::Value,
) -> std::io::Result<()> {
    write!(writer, "event: {event}\ndata: {data}\n\n")?;
    writer.flush()
}
