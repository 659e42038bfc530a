use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::state::ToolKey;

/// Audit record for one successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationLogEntry {
    #[serde(rename = "appId")]
    pub app_id: ToolKey,
    #[serde(rename = "preGenState")]
    pub pre_gen_state: Value,
    #[serde(rename = "thumbnailUrl")]
    pub thumbnail_url: String,
    pub credits_used: u64,
    pub api_model_used: String,
    pub generation_count: u64,
    pub input_prompt: String,
}

/// Append-only writer for `generations.jsonl`.
#[derive(Debug, Clone)]
pub struct GenerationLogWriter {
    path: PathBuf,
    session_id: String,
}

impl GenerationLogWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &GenerationLogEntry) -> anyhow::Result<Map<String, Value>> {
        let mut payload = Map::new();
        payload.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        if let Value::Object(fields) = serde_json::to_value(entry)? {
            payload.extend(fields);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        use std::io::Write;
        file.write_all(serde_json::to_string(&payload)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(payload)
    }

    pub fn read_all(&self) -> anyhow::Result<Vec<GenerationLogEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<GenerationLogEntry>(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{GenerationLogEntry, GenerationLogWriter};
    use crate::tools::state::ToolKey;

    #[test]
    fn record_appends_entry_with_wire_names() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = GenerationLogWriter::new(temp.path().join("generations.jsonl"), "s-1");
        let entry = GenerationLogEntry {
            app_id: ToolKey::AvatarCreator,
            pre_gen_state: json!({"tool": "avatar-creator"}),
            thumbnail_url: "https://cdn/x.png".to_string(),
            credits_used: 2,
            api_model_used: "gemini-3-pro-image-preview".to_string(),
            generation_count: 1,
            input_prompt: "Áo dài".to_string(),
        };

        let payload = writer.record(&entry)?;
        assert_eq!(payload["appId"], json!("avatar-creator"));
        assert_eq!(payload["session_id"], json!("s-1"));
        assert!(payload.get("ts").and_then(Value::as_str).is_some());

        writer.record(&entry)?;
        assert_eq!(writer.read_all()?, vec![entry.clone(), entry]);
        Ok(())
    }

    #[test]
    fn missing_log_reads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = GenerationLogWriter::new(temp.path().join("none.jsonl"), "s-1");
        assert!(writer.read_all()?.is_empty());
        Ok(())
    }
}
