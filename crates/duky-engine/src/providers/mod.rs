use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use duky_contracts::tools::ToolKey;
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::prompt::aspect::parse_ratio;
use crate::util::{mime_for_extension, parse_data_url};

pub(crate) mod gemini;

pub use gemini::GeminiProvider;

/// One image generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub tool: ToolKey,
    pub model: String,
    pub prompt: String,
    /// `data:` URLs, remote URLs or local paths, in prompt order.
    pub images: Vec<String>,
    /// API ratio such as `9:16`; `None` lets the model decide.
    pub aspect_ratio: Option<String>,
    pub remove_watermark: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Set when the backend answered with a hosted URL instead of bytes.
    pub source_url: Option<String>,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(config: &EngineConfig) -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(GeminiProvider::new(
        config.gemini_api_base.clone(),
        config.gemini_api_key.clone(),
    ));
    providers
}

/// Offline provider: a flat PNG whose colour is derived from the prompt.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        if request.prompt.trim().is_empty() {
            bail!("dryrun provider received an empty prompt");
        }
        let (width, height) = dryrun_dims(request.aspect_ratio.as_deref());
        let (r, g, b) = color_from_prompt(&request.prompt, request.images.len() as u64);
        let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("dryrun PNG encode failed")?;
        Ok(GeneratedImage {
            bytes: out.into_inner(),
            mime_type: "image/png".to_string(),
            source_url: None,
        })
    }
}

fn dryrun_dims(aspect_ratio: Option<&str>) -> (u32, u32) {
    const LONG_SIDE: f64 = 256.0;
    let Some((w, h)) = aspect_ratio.and_then(parse_ratio) else {
        return (256, 256);
    };
    let (w, h) = (w as f64, h as f64);
    if w >= h {
        (LONG_SIDE as u32, ((LONG_SIDE * h / w).round() as u32).max(1))
    } else {
        (((LONG_SIDE * w / h).round() as u32).max(1), LONG_SIDE as u32)
    }
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Loads an input image as `(mime, bytes)` from a data URL, remote URL or
/// local path.
pub(crate) fn load_image_input(http: &HttpClient, src: &str) -> Result<(String, Vec<u8>)> {
    let trimmed = src.trim();
    if trimmed.starts_with("data:") {
        return parse_data_url(trimmed).context("invalid image data URL");
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let response = http
            .get(trimmed)
            .send()
            .with_context(|| format!("failed to fetch image {trimmed}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("failed to fetch image {trimmed}: HTTP {}", status.as_u16());
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "image/png".to_string());
        let bytes = response
            .bytes()
            .with_context(|| format!("failed reading image body {trimmed}"))?;
        return Ok((mime, bytes.to_vec()));
    }
    let path = Path::new(trimmed);
    let bytes =
        std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default();
    Ok((mime_for_extension(ext).to_string(), bytes))
}

/// Request record kept in the history manifest. Image payloads are reduced
/// to a short description so the manifest stays small.
pub fn request_summary(request: &ImageRequest) -> Map<String, Value> {
    let images: Vec<String> = request
        .images
        .iter()
        .map(|src| {
            if src.starts_with("data:") {
                format!("data-url ({} chars)", src.len())
            } else {
                src.clone()
            }
        })
        .collect();
    match json!({
        "tool": request.tool,
        "model": request.model,
        "aspect_ratio": request.aspect_ratio,
        "remove_watermark": request.remove_watermark,
        "images": images,
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use duky_contracts::tools::ToolKey;

    use super::*;

    fn request(prompt: &str, ratio: Option<&str>) -> ImageRequest {
        ImageRequest {
            tool: ToolKey::FreeGeneration,
            model: "dryrun-image-1".to_string(),
            prompt: prompt.to_string(),
            images: Vec::new(),
            aspect_ratio: ratio.map(str::to_string),
            remove_watermark: false,
        }
    }

    #[test]
    fn dryrun_output_follows_aspect_ratio() -> anyhow::Result<()> {
        let out = DryrunProvider.generate(&request("con mèo", Some("9:16")))?;
        assert_eq!(out.mime_type, "image/png");
        let decoded = image::load_from_memory(&out.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (144, 256));
        Ok(())
    }

    #[test]
    fn dryrun_is_deterministic_per_prompt() -> anyhow::Result<()> {
        let a = DryrunProvider.generate(&request("a", None))?;
        let b = DryrunProvider.generate(&request("a", None))?;
        let c = DryrunProvider.generate(&request("b", None))?;
        assert_eq!(a, b);
        assert_ne!(a.bytes, c.bytes);
        assert!(DryrunProvider.generate(&request("  ", None)).is_err());
        Ok(())
    }

    #[test]
    fn registry_lists_default_providers() {
        let registry = default_provider_registry(&EngineConfig::default());
        assert_eq!(registry.names(), vec!["dryrun".to_string(), "gemini".to_string()]);
        assert!(registry.get("kie").is_none());
    }

    #[test]
    fn local_path_inputs_are_read_with_mime() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("input.jpg");
        std::fs::write(&path, b"jpeg")?;
        let (mime, bytes) = load_image_input(&HttpClient::new(), &path.to_string_lossy())?;
        assert_eq!(mime, "image/jpeg");
        assert_eq!(bytes, b"jpeg");
        Ok(())
    }
}
