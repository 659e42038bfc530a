use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use duky_contracts::errors::{GenerationError, UpstreamCode};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use super::{load_image_input, GeneratedImage, ImageProvider, ImageRequest};
use crate::util::{parse_data_url, truncate_text};

const REQUEST_TIMEOUT_S: f64 = 90.0;
const TRANSPORT_RETRIES: usize = 2;
const RETRY_BACKOFF_S: f64 = 1.2;

/// Image generation over the Gemini `generateContent` endpoint.
pub struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http: HttpClient::new(),
        }
    }

    fn build_parts(&self, request: &ImageRequest) -> Result<Vec<Value>> {
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        for src in &request.images {
            parts.push(inline_image_part(&self.http, src)?);
        }
        parts.push(json!({ "text": request.prompt }));
        Ok(parts)
    }

    pub(crate) fn build_payload(parts: Vec<Value>, aspect_ratio: Option<&str>) -> Value {
        let mut generation_config = Map::new();
        generation_config.insert(
            "responseModalities".to_string(),
            Value::Array(vec![Value::String("IMAGE".to_string())]),
        );
        if let Some(ratio) = aspect_ratio {
            generation_config.insert("imageConfig".to_string(), json!({ "aspectRatio": ratio }));
        }
        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
            "safetySettings": default_safety_settings(),
        })
    }

    fn fetch_hosted(&self, url: &str) -> Result<GeneratedImage> {
        let (mime_type, bytes) = load_image_input(&self.http, url)?;
        Ok(GeneratedImage {
            bytes,
            mime_type,
            source_url: Some(url.to_string()).filter(|value| !value.starts_with("data:")),
        })
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(missing_key_error());
        };
        let endpoint = generate_content_endpoint(&self.api_base, &request.model);
        let payload = Self::build_payload(self.build_parts(request)?, request.aspect_ratio.as_deref());
        let response = post_with_transport_retries(&self.http, &endpoint, api_key, &payload)?;
        let body = response_json_or_error(response)?;

        match extract_image(&body)? {
            ExtractedImage::Hosted(url) => self.fetch_hosted(&url),
            ExtractedImage::Inline(image) => Ok(image),
        }
    }
}

pub(crate) fn generate_content_endpoint(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{}/{}:generateContent", api_base.trim_end_matches('/'), model_path)
}

pub(crate) fn inline_image_part(http: &HttpClient, src: &str) -> Result<Value> {
    let (mime, bytes) = load_image_input(http, src)?;
    Ok(json!({
        "inlineData": {
            "mimeType": mime,
            "data": BASE64.encode(bytes),
        }
    }))
}

pub(crate) fn missing_key_error() -> anyhow::Error {
    anyhow::Error::new(GenerationError::Upstream {
        code: UpstreamCode::InternalError,
        message: "Hệ thống đang gặp lỗi cấu hình. Vui lòng thử lại sau.".to_string(),
        details: Some("GEMINI_API_KEY or GOOGLE_API_KEY not configured".to_string()),
    })
}

pub(crate) fn post_with_transport_retries(
    http: &HttpClient,
    endpoint: &str,
    api_key: &str,
    payload: &Value,
) -> Result<HttpResponse> {
    let mut attempt = 0;
    loop {
        let response = http
            .post(endpoint)
            .query(&[("key", api_key)])
            .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_S))
            .json(payload)
            .send();
        match response {
            Ok(ok) => return Ok(ok),
            Err(raw) => {
                let retryable = raw.is_timeout() || raw.is_connect() || raw.is_request();
                if !retryable || attempt >= TRANSPORT_RETRIES {
                    return Err(anyhow::Error::new(GenerationError::Transport(format!(
                        "Gemini request failed after {} attempt(s): {raw}",
                        attempt + 1
                    ))));
                }
                attempt += 1;
                thread::sleep(Duration::from_secs_f64(RETRY_BACKOFF_S * attempt as f64));
            }
        }
    }
}

fn default_safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "OFF",
        })
    })
    .collect()
}

pub(crate) fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .context("Gemini response body read failed")?;
    if !status.is_success() {
        let err = GenerationError::from_upstream_body(status.as_u16(), &body);
        return Err(anyhow::Error::new(remap_key_errors(err)));
    }
    serde_json::from_str(&body).context("Gemini returned invalid JSON payload")
}

fn remap_key_errors(err: GenerationError) -> GenerationError {
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("api key not valid") {
        return GenerationError::Upstream {
            code: UpstreamCode::InternalError,
            message: "Hệ thống đang gặp lỗi key. Vui lòng thử lại sau.".to_string(),
            details: Some(truncate_text(&err.to_string(), 256)),
        };
    }
    err
}

#[derive(Debug, PartialEq)]
enum ExtractedImage {
    Hosted(String),
    Inline(GeneratedImage),
}

/// A top-level `imageUrl` (set by hosting proxies) wins over inline data.
/// Otherwise the first inline image part is used. A response with only text
/// is a refusal.
fn extract_image(body: &Value) -> Result<ExtractedImage> {
    if let Some(url) = body
        .get("imageUrl")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        if let Some((mime_type, bytes)) = parse_data_url(url) {
            return Ok(ExtractedImage::Inline(GeneratedImage {
                bytes,
                mime_type,
                source_url: None,
            }));
        }
        return Ok(ExtractedImage::Hosted(url.to_string()));
    }

    if let Some(reason) = body
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Err(anyhow::Error::new(GenerationError::Upstream {
            code: UpstreamCode::SafetyViolation,
            message: String::new(),
            details: Some(reason.to_string()),
        }));
    }

    let candidates = body
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut texts = Vec::new();
    let mut finish_reason = None;
    for candidate in &candidates {
        if finish_reason.is_none() {
            finish_reason = candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object);
            if let Some(inline) = inline {
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .context("Gemini image base64 decode failed")?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string();
                return Ok(ExtractedImage::Inline(GeneratedImage {
                    bytes,
                    mime_type,
                    source_url: None,
                }));
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                texts.push(text.trim().to_string());
            }
        }
    }

    let code = match finish_reason.as_deref() {
        Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("IMAGE_SAFETY") => {
            UpstreamCode::SafetyViolation
        }
        Some("IMAGE_OTHER") | Some("OTHER") | Some("MAX_TOKENS") => UpstreamCode::GenerationFailed,
        _ => UpstreamCode::ModelRefusal,
    };
    let text = texts.join(" ");
    let text = if text.trim().is_empty() {
        "No text response received.".to_string()
    } else {
        truncate_text(&text, 512)
    };
    Err(anyhow::Error::new(GenerationError::Upstream {
        code,
        message: format!("The AI model responded with text instead of an image: \"{text}\""),
        details: finish_reason,
    }))
}

#[cfg(test)]
mod tests {
    use duky_contracts::errors::{classify, FailureKind, UpstreamCode};
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_carries_modalities_ratio_and_safety() {
        let payload = GeminiProvider::build_payload(vec![json!({"text": "mèo"})], Some("3:4"));
        assert_eq!(payload["generationConfig"]["responseModalities"], json!(["IMAGE"]));
        assert_eq!(payload["generationConfig"]["imageConfig"]["aspectRatio"], json!("3:4"));
        assert_eq!(payload["safetySettings"].as_array().map(Vec::len), Some(4));

        let without = GeminiProvider::build_payload(vec![], None);
        assert!(without["generationConfig"].get("imageConfig").is_none());
    }

    #[test]
    fn hosted_url_wins_over_inline_data() -> anyhow::Result<()> {
        let body = json!({
            "imageUrl": "https://cdn.example/out.png",
            "candidates": [{"content": {"parts": [{"inlineData": {"mimeType": "image/png", "data": "AAAA"}}]}}]
        });
        assert_eq!(
            extract_image(&body)?,
            ExtractedImage::Hosted("https://cdn.example/out.png".to_string())
        );
        Ok(())
    }

    #[test]
    fn first_inline_part_is_decoded() -> anyhow::Result<()> {
        let body = json!({
            "candidates": [{"content": {"parts": [
                {"text": "Here you go"},
                {"inline_data": {"mime_type": "image/jpeg", "data": BASE64.encode(b"jpg")}}
            ]}}]
        });
        match extract_image(&body)? {
            ExtractedImage::Inline(image) => {
                assert_eq!(image.mime_type, "image/jpeg");
                assert_eq!(image.bytes, b"jpg");
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn text_only_answer_is_a_typed_refusal() {
        let body = json!({
            "candidates": [{"finishReason": "STOP", "content": {"parts": [{"text": "Tôi không thể"}]}}]
        });
        let err = match extract_image(&body) {
            Err(err) => err,
            Ok(other) => panic!("unexpected {other:?}"),
        };
        let classified = classify(&err);
        assert_eq!(classified.kind(), FailureKind::Upstream(UpstreamCode::ModelRefusal));
        assert!(classified.user_message().contains("Tôi không thể"));
    }

    #[test]
    fn blocked_prompt_is_a_safety_violation() {
        let body = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let kind = extract_image(&body).map_err(|err| classify(&err).kind());
        assert_eq!(
            kind.err(),
            Some(FailureKind::Upstream(UpstreamCode::SafetyViolation))
        );
    }

    #[test]
    fn missing_key_reports_configuration_error() {
        let provider = GeminiProvider::new("http://127.0.0.1:9", None);
        let request = ImageRequest {
            tool: duky_contracts::tools::ToolKey::FreeGeneration,
            model: "gemini-2.5-flash-image".to_string(),
            prompt: "x".to_string(),
            images: Vec::new(),
            aspect_ratio: None,
            remove_watermark: false,
        };
        let err = match provider.generate(&request) {
            Err(err) => classify(&err),
            Ok(_) => panic!("generation without a key must fail"),
        };
        assert_eq!(err.kind(), FailureKind::Upstream(UpstreamCode::InternalError));
        assert_eq!(
            err.user_message(),
            "Hệ thống đang gặp lỗi cấu hình. Vui lòng thử lại sau."
        );
    }

    #[test]
    fn invalid_key_body_is_remapped() {
        let err = remap_key_errors(GenerationError::from_upstream_body(
            400,
            r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#,
        ));
        assert_eq!(err.user_message(), "Hệ thống đang gặp lỗi key. Vui lòng thử lại sau.");
    }

    #[test]
    fn endpoint_accepts_prefixed_model_names() {
        assert_eq!(
            generate_content_endpoint("https://api.example/v1beta/", "models/gemini-2.5-flash-image"),
            "https://api.example/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
    }
}
