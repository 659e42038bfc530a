use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub credit_key: Option<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        self.get(name)
            .filter(|model| model.supports(capability))
            .cloned()
    }
}

// Insertion order is the fallback order for `ModelSelector`.
fn default_models() -> IndexMap<String, ModelSpec> {
    let rows: [(&str, &str, &[&str], Option<&str>); 10] = [
        ("gemini-3-pro-image-preview", "gemini", &["image", "edit"], Some("image-v3")),
        ("gemini-2.5-flash-image", "gemini", &["image", "edit"], Some("image-v2")),
        ("gemini-3-pro-preview", "gemini", &["text", "vision"], None),
        ("gemini-2.5-flash", "gemini", &["text", "vision"], None),
        ("dryrun-image-1", "dryrun", &["image", "edit"], Some("image-v2")),
        ("dryrun-text-1", "dryrun", &["text"], None),
        ("grok-imagine/text-to-video", "kie", &["video"], None),
        ("grok-imagine/image-to-video", "kie", &["video", "image-to-video"], None),
        ("kling/ai-avatar-standard", "kie", &["video", "lip-sync"], None),
        ("veo3_fast", "kie", &["video", "image-to-video"], None),
    ];

    rows.into_iter()
        .map(|(name, provider, capabilities, credit_key)| {
            (
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider: provider.to_string(),
                    capabilities: capabilities.iter().map(|item| item.to_string()).collect(),
                    credit_key: credit_key.map(str::to_string),
                },
            )
        })
        .collect()
}
