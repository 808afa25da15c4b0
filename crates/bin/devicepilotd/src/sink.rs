//! Log sink: renders every status event as a structured log line.

use devicepilot_app::ports::StatusSink;
use devicepilot_domain::event::StatusEvent;

pub struct LogSink;

impl StatusSink for LogSink {
    fn present(&self, event: &StatusEvent) {
        match serde_json::to_string(&event.payload) {
            Ok(payload) => tracing::info!(
                target: "devicepilotd::status",
                event_id = %event.id,
                topic = ?event.topic(),
                %payload,
                "status"
            ),
            Err(err) => tracing::warn!(event_id = %event.id, %err, "unserializable status event"),
        }
    }
}
