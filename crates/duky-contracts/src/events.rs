use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Keys the writer owns. A payload cannot replace them.
pub const ENVELOPE_KEYS: [&str; 4] = ["type", "session_id", "seq", "ts"];

/// Inline `data:` strings longer than this are replaced by a short marker.
pub const INLINE_DATA_LIMIT: usize = 256;

/// Session activity log at `<session>/events.jsonl`.
///
/// Each line carries `type`, `session_id`, a per-session `seq` and `ts`,
/// followed by the payload. Generation payloads often hold `data:` image
/// URLs; those are shortened before writing. Reopening a session continues
/// the sequence where the file left off. Clones share one lock and counter,
/// so slot workers can log from their own threads.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<SessionLog>,
}

#[derive(Debug)]
struct SessionLog {
    path: PathBuf,
    session_id: String,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let path = path.into();
        let next_seq = count_lines(&path);
        Self {
            inner: Arc::new(SessionLog {
                path,
                session_id: session_id.into(),
                next_seq: Mutex::new(next_seq),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // The sequence number is taken under the same lock as the append so
        // file order and `seq` agree.
        let mut next_seq = self
            .inner
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("seq".to_string(), Value::from(*next_seq));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            if ENVELOPE_KEYS.contains(&key.as_str()) {
                continue;
            }
            event.insert(key, shorten_inline_data(value));
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        *next_seq += 1;

        Ok(Value::Object(event))
    }

    /// For callers whose outcome must not depend on the log, such as slot
    /// workers. A failed write goes to stderr.
    pub fn emit_best_effort(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            eprintln!(
                "session {}: could not log {event_type}: {err:#}",
                self.inner.session_id
            );
        }
    }
}

/// Every parseable event in file order.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect())
}

/// Event `type` values in file order. Unparseable lines are skipped.
pub fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
    Ok(read_events(path)?
        .iter()
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect())
}

fn shorten_inline_data(value: Value) -> Value {
    match value {
        Value::String(text) if text.starts_with("data:") && text.len() > INLINE_DATA_LIMIT => {
            let mime = text
                .trim_start_matches("data:")
                .split([';', ','])
                .next()
                .unwrap_or_default()
                .to_string();
            Value::String(format!("data-url {mime} ({} chars)", text.len()))
        }
        Value::Array(items) => Value::Array(items.into_iter().map(shorten_inline_data).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, shorten_inline_data(value)))
                .collect(),
        ),
        other => other,
    }
}

fn count_lines(path: &Path) -> u64 {
    std::fs::read_to_string(path)
        .map(|raw| raw.lines().filter(|line| !line.trim().is_empty()).count() as u64)
        .unwrap_or(0)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
