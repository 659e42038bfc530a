use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Global model tier switch. It picks the backing models and the per-image
/// credit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVersion {
    V2,
    #[default]
    V3,
}

impl ModelVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V2 => "v2",
            Self::V3 => "v3",
        }
    }

    pub fn image_model(self) -> &'static str {
        match self {
            Self::V2 => "gemini-2.5-flash-image",
            Self::V3 => "gemini-3-pro-image-preview",
        }
    }

    pub fn text_model(self) -> &'static str {
        match self {
            Self::V2 => "gemini-2.5-flash",
            Self::V3 => "gemini-3-pro-preview",
        }
    }

    /// Key into the credit table.
    pub fn credit_key(self) -> &'static str {
        match self {
            Self::V2 => "image-v2",
            Self::V3 => "image-v3",
        }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVersion {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "v2" | "2" => Ok(Self::V2),
            "v3" | "3" => Ok(Self::V3),
            other => Err(format!("unknown model version '{other}' (expected v2 or v3)")),
        }
    }
}
