use serde::{Deserialize, Serialize};

use super::state::{ToolKey, ToolState};

/// Settings embedded into generated images so a downloaded file can restore
/// the configuration that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    pub view_id: ToolKey,
    pub state: ToolState,
}

impl SettingsSnapshot {
    /// Captures the pre-generation state with output fields cleared.
    pub fn capture(state: &ToolState) -> Self {
        Self {
            view_id: state.tool,
            state: state.sanitized(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let snapshot: Self = serde_json::from_str(raw)?;
        if snapshot.view_id != snapshot.state.tool {
            anyhow::bail!(
                "snapshot view '{}' does not match state tool '{}'",
                snapshot.view_id,
                snapshot.state.tool
            );
        }
        Ok(snapshot)
    }

    /// State to load back into the tool named by `view_id`.
    pub fn restore(&self) -> ToolState {
        self.state.sanitized()
    }
}
