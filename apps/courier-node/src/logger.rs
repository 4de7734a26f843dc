use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One captured tracing event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub at_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Lifted out of `fields` so a single message's history can be queried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

struct Ring {
    records: VecDeque<LogRecord>,
    capacity: usize,
    evicted: u64,
}

/// Bounded in-memory journal of recent events, served on `/logs`.
pub struct LogBuffer {
    ring: Mutex<Ring>,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                records: VecDeque::with_capacity(capacity),
                capacity,
                evicted: 0,
            }),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, record: LogRecord) {
        let mut ring = self.ring();
        while ring.records.len() >= ring.capacity {
            ring.records.pop_front();
            ring.evicted += 1;
        }
        ring.records.push_back(record);
    }

    /// Up to `limit` newest records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogRecord> {
        let ring = self.ring();
        let skip = ring.records.len().saturating_sub(limit);
        ring.records.iter().skip(skip).cloned().collect()
    }

    /// Up to `limit` newest records about `message_id`, oldest first.
    pub fn for_message(&self, message_id: &str, limit: usize) -> Vec<LogRecord> {
        let ring = self.ring();
        let mut out: Vec<_> = ring
            .records
            .iter()
            .rev()
            .filter(|r| r.message_id.as_deref() == Some(message_id))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Records pushed out by newer ones since startup.
    pub fn evicted(&self) -> u64 {
        self.ring().evicted
    }
}

/// Feeds every event into a [`LogBuffer`].
pub struct LogBufferLayer {
    buffer: Arc<LogBuffer>,
}

impl LogBufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let meta = event.metadata();
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        self.buffer.record(LogRecord {
            at_ms,
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: fields.message,
            message_id: fields.message_id,
            fields: fields.rest,
        });
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    message_id: Option<String>,
    rest: BTreeMap<String, String>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "message_id" => self.message_id = Some(value),
            name => {
                self.rest.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    // Display-wrapped ids (`%id`) arrive here.
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let mut out = String::new();
        let _ = write!(out, "{value:?}");
        self.put(field, out);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tracing_subscriber::layer::SubscriberExt;

    use super::{LogBuffer, LogBufferLayer, LogRecord};

    fn record(message: &str, message_id: Option<&str>) -> LogRecord {
        LogRecord {
            at_ms: 0,
            level: "INFO".into(),
            target: "courier".into(),
            message: message.into(),
            message_id: message_id.map(Into::into),
            fields: BTreeMap::new(),
        }
    }

    fn messages(records: Vec<LogRecord>) -> Vec<String> {
        records.into_iter().map(|r| r.message).collect()
    }

    #[test]
    fn full_journal_evicts_oldest() {
        let buffer = LogBuffer::with_capacity(2);
        for message in ["submitted", "claimed", "acknowledged"] {
            buffer.record(record(message, None));
        }
        assert_eq!(messages(buffer.recent(10)), vec!["claimed", "acknowledged"]);
        assert_eq!(messages(buffer.recent(1)), vec!["acknowledged"]);
        assert_eq!(buffer.evicted(), 1);
    }

    #[test]
    fn history_of_one_message_keeps_order() {
        let buffer = LogBuffer::with_capacity(8);
        buffer.record(record("submitted", Some("m-1")));
        buffer.record(record("submitted", Some("m-2")));
        buffer.record(record("claimed", Some("m-1")));
        buffer.record(record("retry scheduled", Some("m-1")));

        assert_eq!(
            messages(buffer.for_message("m-1", 10)),
            vec!["submitted", "claimed", "retry scheduled"]
        );
        assert_eq!(
            messages(buffer.for_message("m-1", 2)),
            vec!["claimed", "retry scheduled"]
        );
        assert!(buffer.for_message("m-9", 10).is_empty());
    }

    #[test]
    fn layer_lifts_message_id_out_of_fields() {
        let buffer = Arc::new(LogBuffer::with_capacity(8));
        let subscriber =
            tracing_subscriber::registry().with(LogBufferLayer::new(Arc::clone(&buffer)));
        tracing::subscriber::with_default(subscriber, || {
            let id = "m-1";
            tracing::warn!(message_id = %id, attempts = 3, "retries exhausted");
        });

        let records = buffer.recent(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, "WARN");
        assert_eq!(records[0].message, "retries exhausted");
        assert_eq!(records[0].message_id.as_deref(), Some("m-1"));
        assert_eq!(records[0].fields.get("attempts").map(String::as_str), Some("3"));
        assert!(!records[0].fields.contains_key("message_id"));
    }
}
