use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Resolves `requested` for `capability`, falling back to the first
    /// registered model that has it. The reason for a fallback is kept so
    /// the plan preview can show it.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        if let Some(name) = requested {
            if let Some(model) = self.registry.ensure(name, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(name.to_string()),
                    fallback_reason: None,
                });
            }
        }

        let fallback_reason = match requested {
            Some(name) => format!("Model '{name}' cannot serve '{capability}'; using default."),
            None => "No model specified; using default.".to_string(),
        };
        let model = self
            .registry
            .by_capability(capability)
            .into_iter()
            .next()
            .ok_or_else(|| format!("No models available for capability '{capability}'."))?;
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::super::{ModelRegistry, ModelSpec};
    use super::ModelSelector;

    fn spec(name: &str, capabilities: &[&str]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: "dryrun".to_string(),
            capabilities: capabilities.iter().map(|item| item.to_string()).collect(),
            credit_key: None,
        }
    }

    #[test]
    fn falls_back_with_reason() -> Result<(), String> {
        let mut models = IndexMap::new();
        models.insert("img-a".to_string(), spec("img-a", &["image"]));
        models.insert("txt-a".to_string(), spec("txt-a", &["text"]));
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(models))));

        let selection = selector.select(Some("txt-a"), "image")?;
        assert_eq!(selection.model.name, "img-a");
        assert_eq!(selection.requested.as_deref(), Some("txt-a"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Model 'txt-a' cannot serve 'image'; using default.")
        );

        let direct = selector.select(Some("img-a"), "image")?;
        assert!(direct.fallback_reason.is_none());
        Ok(())
    }

    #[test]
    fn errors_when_capability_missing() {
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(IndexMap::new()))));
        assert!(selector.select(None, "video").is_err());
    }

    #[test]
    fn default_registry_serves_every_tier() {
        let registry = ModelRegistry::new(None);
        assert!(registry.ensure("gemini-3-pro-image-preview", "image").is_some());
        assert!(registry.ensure("gemini-2.5-flash", "text").is_some());
        assert!(registry.ensure("kling/ai-avatar-standard", "lip-sync").is_some());
    }
}
