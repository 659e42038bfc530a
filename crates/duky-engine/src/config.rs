use std::path::Path;

use duky_contracts::models::ModelVersion;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_KIE_API_BASE: &str = "https://api.kie.ai/api/v1";
pub const DEFAULT_STARTING_CREDITS: u64 = 100;
pub const DEFAULT_ACCOUNT: &str = "guest";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Runtime settings for one engine session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub model_version: ModelVersion,
    /// Explicit image model; `None` follows `model_version`.
    pub image_model: Option<String>,
    pub text_model: Option<String>,
    pub enable_image_metadata: bool,
    pub starting_credits: u64,
    pub account: String,
    pub gemini_api_key: Option<String>,
    pub gemini_api_base: String,
    pub kie_api_base: String,
    pub kie_api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_version: ModelVersion::default(),
            image_model: None,
            text_model: None,
            enable_image_metadata: true,
            starting_credits: DEFAULT_STARTING_CREDITS,
            account: DEFAULT_ACCOUNT.to_string(),
            gemini_api_key: None,
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            kie_api_base: DEFAULT_KIE_API_BASE.to_string(),
            kie_api_key: None,
        }
    }
}

impl EngineConfig {
    /// Reads the process environment after loading `.env` from the session
    /// directory and then the working directory. Variables already set in
    /// the process are never overridden.
    pub fn from_env(session_dir: Option<&Path>) -> Result<Self, ConfigError> {
        if !cfg!(test) {
            if let Some(dir) = session_dir {
                dotenvy::from_path(dir.join(".env")).ok();
            }
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let model_version = match get("DUKY_MODEL_VERSION") {
            Some(raw) => raw
                .parse::<ModelVersion>()
                .map_err(|err| ConfigError::InvalidValue("DUKY_MODEL_VERSION".to_string(), err))?,
            None => defaults.model_version,
        };
        let enable_image_metadata = match get("DUKY_ENABLE_IMAGE_METADATA") {
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "DUKY_ENABLE_IMAGE_METADATA".to_string(),
                    format!("'{raw}' is not a boolean"),
                )
            })?,
            None => defaults.enable_image_metadata,
        };
        let starting_credits = match get("DUKY_STARTING_CREDITS") {
            Some(raw) => raw.parse::<u64>().map_err(|err| {
                ConfigError::InvalidValue("DUKY_STARTING_CREDITS".to_string(), err.to_string())
            })?,
            None => defaults.starting_credits,
        };

        Ok(Self {
            model_version,
            image_model: get("DUKY_IMAGE_MODEL"),
            text_model: get("DUKY_TEXT_MODEL"),
            enable_image_metadata,
            starting_credits,
            account: get("DUKY_ACCOUNT").unwrap_or(defaults.account),
            gemini_api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            gemini_api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gemini_api_base),
            kie_api_base: get("KIE_API_BASE")
                .or_else(|| get("KIE_API_URL"))
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.kie_api_base),
            kie_api_key: get("KIE_API_KEY"),
        })
    }

    pub fn effective_image_model(&self) -> String {
        self.image_model
            .clone()
            .unwrap_or_else(|| self.model_version.image_model().to_string())
    }

    pub fn effective_text_model(&self) -> String {
        self.text_model
            .clone()
            .unwrap_or_else(|| self.model_version.text_model().to_string())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use duky_contracts::models::ModelVersion;

    use super::{ConfigError, EngineConfig, DEFAULT_KIE_API_BASE};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() -> anyhow::Result<()> {
        let config = EngineConfig::from_lookup(lookup(&[]))?;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.effective_image_model(), "gemini-3-pro-image-preview");
        assert_eq!(config.kie_api_base, DEFAULT_KIE_API_BASE);
        Ok(())
    }

    #[test]
    fn values_are_parsed_and_trimmed() -> anyhow::Result<()> {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DUKY_MODEL_VERSION", "v2"),
            ("DUKY_ENABLE_IMAGE_METADATA", "off"),
            ("DUKY_STARTING_CREDITS", " 7 "),
            ("GOOGLE_API_KEY", "g-key"),
            ("GEMINI_API_BASE", "http://localhost:9000/"),
        ]))?;
        assert_eq!(config.model_version, ModelVersion::V2);
        assert!(!config.enable_image_metadata);
        assert_eq!(config.starting_credits, 7);
        assert_eq!(config.gemini_api_key.as_deref(), Some("g-key"));
        assert_eq!(config.gemini_api_base, "http://localhost:9000");
        assert_eq!(config.effective_text_model(), "gemini-2.5-flash");
        Ok(())
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = EngineConfig::from_lookup(lookup(&[("DUKY_STARTING_CREDITS", "lots")]));
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue(key, _)) if key == "DUKY_STARTING_CREDITS"
        ));
    }
}
