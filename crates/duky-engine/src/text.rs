//! Text-model helpers: prompt enhancement, avatar concept analysis and the
//! prompt-from-image steps. Enhancement, concept analysis and context
//! adaptation degrade to a usable default when the model call fails.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use duky_contracts::events::EventWriter;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::prompt::interpolation::{
    adapt_instruction, analysis_instruction, interpolate_instruction, parse_source_analysis,
    SourceAnalysis,
};
use crate::providers::gemini::{
    generate_content_endpoint, inline_image_part, missing_key_error, post_with_transport_retries,
    response_json_or_error,
};
use crate::util::{error_chain_text, map_object, truncate_text};

const ENHANCED_PROMPT_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub model: String,
    pub instruction: String,
    /// The user text the instruction is about.
    pub subject: String,
    pub images: Vec<String>,
    /// Ask the model for a JSON document instead of prose.
    pub json_output: bool,
}

pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &TextRequest) -> Result<String>;
}

#[derive(Default)]
pub struct TextProviderRegistry {
    providers: BTreeMap<String, Box<dyn TextProvider>>,
}

impl TextProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: TextProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn TextProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }
}

pub fn default_text_registry(config: &EngineConfig) -> TextProviderRegistry {
    let mut providers = TextProviderRegistry::new();
    providers.register(DryrunTextProvider);
    providers.register(GeminiTextProvider::new(
        config.gemini_api_base.clone(),
        config.gemini_api_key.clone(),
    ));
    providers
}

/// Offline text model. Prose requests append a fixed quality phrase to the
/// subject; JSON requests get an analysis with no categories.
pub struct DryrunTextProvider;

impl TextProvider for DryrunTextProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &TextRequest) -> Result<String> {
        if request.json_output {
            return Ok(json!({
                "categories": [],
                "mainPrompt": "Ảnh chụp chân thực, ánh sáng tự nhiên, bố cục cân đối",
                "suggestions": ["Tranh màu nước", "Phong cách anime"],
            })
            .to_string());
        }
        let subject = request.subject.trim();
        if subject.is_empty() {
            bail!("dryrun text provider received an empty subject");
        }
        Ok(format!("{subject}, ảnh chất lượng cao, chi tiết sắc nét, ánh sáng chuyên nghiệp"))
    }
}

pub struct GeminiTextProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiTextProvider {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key,
            http: HttpClient::new(),
        }
    }
}

impl TextProvider for GeminiTextProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, request: &TextRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(missing_key_error());
        };
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        for src in &request.images {
            parts.push(inline_image_part(&self.http, src)?);
        }
        parts.push(json!({ "text": request.instruction }));
        let mut payload = json!({ "contents": [{ "role": "user", "parts": parts }] });
        if request.json_output {
            payload["generationConfig"] = json!({ "responseMimeType": "application/json" });
        }

        let endpoint = generate_content_endpoint(&self.api_base, &request.model);
        let response = post_with_transport_retries(&self.http, &endpoint, api_key, &payload)?;
        let body = response_json_or_error(response)?;
        let text = response_text(&body);
        if text.trim().is_empty() {
            bail!("Gemini returned no text");
        }
        Ok(text)
    }
}

fn response_text(body: &Value) -> String {
    body.get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn enhance_instruction(prompt: &str) -> String {
    format!(
        "Bạn là chuyên gia viết prompt cho mô hình tạo ảnh. Viết lại prompt sau thành một mô tả chi tiết, \
         rõ ràng về chủ thể, bối cảnh, ánh sáng và bố cục. Giữ nguyên ý định và ngôn ngữ của người dùng. \
         Chỉ trả về prompt đã viết lại, không giải thích.\n\nPrompt: \"{prompt}\""
    )
}

/// Rewrites `prompt` with the text model. Any failure keeps the original
/// prompt and records a `prompt_enhance_failed` event.
pub fn enhance_prompt(
    provider: &dyn TextProvider,
    model: &str,
    prompt: &str,
    events: &EventWriter,
) -> String {
    let original = prompt.trim();
    if original.is_empty() {
        return String::new();
    }
    let request = TextRequest {
        model: model.to_string(),
        instruction: enhance_instruction(original),
        subject: original.to_string(),
        images: Vec::new(),
        json_output: false,
    };
    let result = provider
        .complete(&request)
        .map(|text| clean_enhanced(&text))
        .and_then(|text| {
            if text.is_empty() {
                bail!("enhanced prompt was empty");
            }
            Ok(text)
        });
    match result {
        Ok(enhanced) => {
            events.emit_best_effort(
                "prompt_enhanced",
                map_object(json!({
                    "provider": provider.name(),
                    "model": model,
                    "original": original,
                    "enhanced": enhanced,
                })),
            );
            enhanced
        }
        Err(err) => {
            events.emit_best_effort(
                "prompt_enhance_failed",
                map_object(json!({
                    "provider": provider.name(),
                    "model": model,
                    "error": error_chain_text(&err, 512),
                })),
            );
            original.to_string()
        }
    }
}

fn clean_enhanced(text: &str) -> String {
    let trimmed = text.trim().trim_matches('"').trim();
    truncate_text(trimmed, ENHANCED_PROMPT_MAX_CHARS)
}

/// Asks the text model which idea categories suit the portrait. Returns
/// only known category names; failures yield an empty list and an
/// `analysis_failed` event so the caller can fall back to every category.
pub fn analyze_avatar_concepts(
    provider: &dyn TextProvider,
    model: &str,
    image: &str,
    categories: &[&str],
    events: &EventWriter,
) -> Vec<String> {
    let instruction = format!(
        "Phân tích người trong ảnh (độ tuổi, giới tính, phong cách) và chọn từ 1 đến 3 danh mục ý tưởng avatar \
         phù hợp nhất trong danh sách sau: {}. Trả về một mảng JSON chỉ gồm tên danh mục, ví dụ [\"{}\"].",
        categories.join(", "),
        categories.first().copied().unwrap_or_default()
    );
    let request = TextRequest {
        model: model.to_string(),
        instruction,
        subject: String::new(),
        images: vec![image.to_string()],
        json_output: true,
    };
    let result = provider
        .complete(&request)
        .and_then(|raw| parse_category_list(&raw));
    match result {
        Ok(names) => names
            .into_iter()
            .filter(|name| categories.contains(&name.as_str()))
            .collect(),
        Err(err) => {
            events.emit_best_effort(
                "analysis_failed",
                map_object(json!({
                    "provider": provider.name(),
                    "model": model,
                    "error": error_chain_text(&err, 512),
                })),
            );
            Vec::new()
        }
    }
}

/// Describes `image` as a reusable prompt plus variation ideas. Failures
/// are returned to the caller after an `analysis_failed` event.
pub fn analyze_source_image(
    provider: &dyn TextProvider,
    model: &str,
    image: &str,
    expert: bool,
    events: &EventWriter,
) -> Result<SourceAnalysis> {
    let request = TextRequest {
        model: model.to_string(),
        instruction: analysis_instruction(expert),
        subject: String::new(),
        images: vec![image.to_string()],
        json_output: true,
    };
    let result = provider
        .complete(&request)
        .and_then(|raw| parse_source_analysis(&raw));
    if let Err(err) = &result {
        events.emit_best_effort(
            "analysis_failed",
            map_object(json!({
                "provider": provider.name(),
                "model": model,
                "expert": expert,
                "error": error_chain_text(err, 512),
            })),
        );
    }
    result
}

/// Merges the user's notes into `base`. Errors propagate.
pub fn interpolate_prompts(
    provider: &dyn TextProvider,
    model: &str,
    base: &str,
    notes: &str,
) -> Result<String> {
    let request = TextRequest {
        model: model.to_string(),
        instruction: interpolate_instruction(base, notes),
        subject: format!("{}, {}", base.trim(), notes.trim()),
        images: Vec::new(),
        json_output: false,
    };
    let merged = clean_enhanced(&provider.complete(&request)?);
    if merged.is_empty() {
        bail!("prompt merge returned no text");
    }
    Ok(merged)
}

/// Rewrites `base` to fit the reference `image`. Any failure keeps `base`
/// and records a `prompt_adapt_failed` event.
pub fn adapt_prompt_to_context(
    provider: &dyn TextProvider,
    model: &str,
    image: &str,
    base: &str,
    events: &EventWriter,
) -> String {
    let request = TextRequest {
        model: model.to_string(),
        instruction: adapt_instruction(base),
        subject: base.trim().to_string(),
        images: vec![image.to_string()],
        json_output: false,
    };
    let result = provider
        .complete(&request)
        .map(|text| clean_enhanced(&text))
        .and_then(|text| {
            if text.is_empty() {
                bail!("adapted prompt was empty");
            }
            Ok(text)
        });
    result.unwrap_or_else(|err| {
        events.emit_best_effort(
            "prompt_adapt_failed",
            map_object(json!({
                "provider": provider.name(),
                "model": model,
                "error": error_chain_text(&err, 512),
            })),
        );
        base.trim().to_string()
    })
}

/// Accepts `["a","b"]` or `{"categories": [...]}`, optionally wrapped in a
/// markdown code fence.
fn parse_category_list(raw: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    let value: Value =
        serde_json::from_str(unfenced).context("category analysis was not valid JSON")?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("categories") {
            Some(Value::Array(items)) => items,
            _ => bail!("category analysis JSON has no categories array"),
        },
        _ => bail!("category analysis JSON has an unexpected shape"),
    };
    Ok(items
        .iter()
        .filter_map(Value::as_str)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect())
}
