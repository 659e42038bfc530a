use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;
use uuid::Uuid;

use crate::tools::state::ToolKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub batch_id: String,
    pub tool: ToolKey,
    pub created_at: String,
    pub settings: Map<String, Value>,
    pub prompt: String,
    pub prompt_diff: Option<Vec<String>>,
    pub settings_diff: Option<Map<String, Value>>,
    #[serde(default)]
    pub outputs: Vec<Map<String, Value>>,
    #[serde(default)]
    pub failures: Vec<Map<String, Value>>,
}

/// Per-session record of every dispatched batch, saved as `history.json`.
///
/// Each batch is diffed against the previous batch of the same tool so a
/// reader can see what changed between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryManifest {
    #[serde(skip)]
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub batches: Vec<BatchEntry>,
}

impl HistoryManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            batches: Vec::new(),
        }
    }

    /// Loads `path`, or starts a fresh manifest when it is missing or
    /// unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let parsed = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<HistoryManifest>(&raw).ok());
        match parsed {
            Some(mut manifest) => {
                manifest.path = path;
                manifest
            }
            None => Self::new(path),
        }
    }

    pub fn add_batch(
        &mut self,
        tool: ToolKey,
        settings: Map<String, Value>,
        prompt: String,
    ) -> BatchEntry {
        let prev = self.batches.iter().rev().find(|entry| entry.tool == tool);
        let entry = BatchEntry {
            batch_id: format!("b{}", self.batches.len() + 1),
            tool,
            created_at: now_utc_iso(),
            prompt_diff: prev.map(|entry| prompt_diff(&entry.prompt, &prompt)),
            settings_diff: prev.map(|entry| settings_diff(&entry.settings, &settings)),
            settings,
            prompt,
            outputs: Vec::new(),
            failures: Vec::new(),
        };
        self.batches.push(entry.clone());
        entry
    }

    pub fn add_output(&mut self, batch_id: &str, output: Map<String, Value>) {
        if let Some(entry) = self.batch_mut(batch_id) {
            entry.outputs.push(output);
        }
    }

    pub fn add_failure(&mut self, batch_id: &str, failure: Map<String, Value>) {
        if let Some(entry) = self.batch_mut(batch_id) {
            entry.failures.push(failure);
        }
    }

    pub fn total_outputs(&self) -> u64 {
        self.batches.iter().map(|entry| entry.outputs.len() as u64).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.batches.iter().map(|entry| entry.failures.len() as u64).sum()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn batch_mut(&mut self, batch_id: &str) -> Option<&mut BatchEntry> {
        self.batches
            .iter_mut()
            .find(|entry| entry.batch_id == batch_id)
    }
}

fn prompt_diff(prev: &str, curr: &str) -> Vec<String> {
    TextDiff::from_lines(prev, curr)
        .unified_diff()
        .header("prev", "curr")
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

fn settings_diff(prev: &Map<String, Value>, curr: &Map<String, Value>) -> Map<String, Value> {
    let keys: BTreeSet<&String> = prev.keys().chain(curr.keys()).collect();
    let mut diff = Map::new();
    for key in keys {
        let left = prev.get(key);
        let right = curr.get(key);
        if left != right {
            let mut row = Map::new();
            row.insert("from".to_string(), left.cloned().unwrap_or(Value::Null));
            row.insert("to".to_string(), right.cloned().unwrap_or(Value::Null));
            diff.insert(key.clone(), Value::Object(row));
        }
    }
    diff
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub fn history_path(session_dir: &Path) -> PathBuf {
    session_dir.join("history.json")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::HistoryManifest;
    use crate::tools::state::ToolKey;

    fn settings(ratio: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("aspect_ratio".to_string(), json!(ratio));
        map
    }

    #[test]
    fn batches_roundtrip_with_diffs_per_tool() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("history.json");
        let mut manifest = HistoryManifest::new(&path);

        manifest.add_batch(ToolKey::PosterCreator, settings("1:1"), "A".to_string());
        manifest.add_batch(ToolKey::FreeGeneration, settings("1:1"), "free".to_string());
        let third = manifest.add_batch(ToolKey::PosterCreator, settings("9:16"), "B".to_string());

        let mut output = Map::new();
        output.insert("url".to_string(), json!("https://cdn/1.png"));
        manifest.add_output(&third.batch_id, output);
        manifest.save()?;

        let loaded = HistoryManifest::load(&path);
        assert_eq!(loaded.session_id, manifest.session_id);
        assert_eq!(loaded.batches.len(), 3);
        assert!(loaded.batches[1].prompt_diff.is_none());
        let diff = loaded.batches[2].settings_diff.clone().unwrap_or_default();
        assert_eq!(diff["aspect_ratio"]["to"], json!("9:16"));
        assert_eq!(loaded.total_outputs(), 1);
        Ok(())
    }

    #[test]
    fn unreadable_file_starts_fresh() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("history.json");
        std::fs::write(&path, "not json")?;
        let manifest = HistoryManifest::load(&path);
        assert!(manifest.batches.is_empty());
        assert_eq!(manifest.path, path);
        Ok(())
    }
}
