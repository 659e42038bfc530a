//! Video generation through the kie.ai task API: model selection, task
//! creation, status polling and the per-image task board.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use duky_contracts::errors::{GenerationError, UpstreamCode};
use duky_contracts::events::EventWriter;
use duky_contracts::tools::{VideoStatus, VideoTaskBoard};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::gallery::ObjectStorage;
use crate::util::{error_chain_text, map_object, parse_data_url, short_id, truncate_text};

pub const TEXT_TO_VIDEO_MODEL: &str = "grok-imagine/text-to-video";
pub const IMAGE_TO_VIDEO_MODEL: &str = "grok-imagine/image-to-video";
pub const LIP_SYNC_MODEL: &str = "kling/ai-avatar-standard";
/// Veo model used whenever reference images are attached.
pub const VEO_REFERENCE_MODEL: &str = "veo3_fast";
pub const DEFAULT_ASPECT_RATIO: &str = "2:3";
const VEO_DEFAULT_RATIO: &str = "16:9";
const VEO_RATIOS: [&str; 3] = ["1:1", "16:9", "9:16"];

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// 600 polls at 5 s is 50 minutes.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 600;
const REQUEST_TIMEOUT_S: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    #[default]
    Normal,
    Fast,
}

impl VideoMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Fast => "fast",
        }
    }
}

/// A packaged video app: fixed model settings plus an optional prompt
/// template filled from user inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAppConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: VideoMode,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VideoTaskParams {
    pub prompt: String,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    /// Explicit model; `None` picks one from the inputs.
    pub model: Option<String>,
    pub mode: VideoMode,
    pub aspect_ratio: Option<String>,
}

impl VideoTaskParams {
    /// Board key: the animated image, or a stable id for text-only jobs.
    pub fn source_key(&self) -> String {
        match self.image_url.as_deref() {
            Some(url) => url.to_string(),
            None => format!("text:{}", short_id(&self.prompt, 0)),
        }
    }
}

/// Replaces every `{{key}}` with the matching input. Strings are inserted
/// verbatim, other JSON values in their compact form.
pub fn render_prompt_template(template: &str, inputs: &Map<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in inputs {
        let replacement = match value {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), &replacement);
    }
    rendered
}

/// Maps app inputs onto task parameters. `image_urls` arrays contribute
/// their first entry.
pub fn params_from_app(app: &VideoAppConfig, inputs: &Map<String, Value>) -> VideoTaskParams {
    let input_str = |key: &str| {
        inputs
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let prompt = match app.prompt_template.as_deref() {
        Some(template) if !template.trim().is_empty() => render_prompt_template(template, inputs),
        _ => input_str("prompt").unwrap_or_default(),
    };
    let image_url = input_str("image_url").or_else(|| {
        inputs
            .get("image_urls")
            .and_then(Value::as_array)
            .and_then(|urls| urls.iter().find_map(Value::as_str))
            .map(str::to_string)
    });
    VideoTaskParams {
        prompt,
        image_url,
        audio_url: input_str("audio_url"),
        model: app.model.clone().filter(|model| !model.trim().is_empty()),
        mode: app.mode,
        aspect_ratio: Some(
            app.aspect_ratio
                .clone()
                .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string()),
        ),
    }
}

/// Uploads inline `data:` inputs so the task API receives fetchable URLs.
pub fn resolve_inputs(
    inputs: &Map<String, Value>,
    storage: &dyn ObjectStorage,
) -> Result<Map<String, Value>> {
    let mut resolved = Map::new();
    for (key, value) in inputs {
        let value = match value {
            Value::String(text) => Value::String(upload_if_inline(text, storage)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => upload_if_inline(text, storage).map(Value::String),
                        other => Ok(other.clone()),
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            other => other.clone(),
        };
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

fn upload_if_inline(text: &str, storage: &dyn ObjectStorage) -> Result<String> {
    if !text.trim_start().starts_with("data:") {
        return Ok(text.to_string());
    }
    let (mime, bytes) = parse_data_url(text).context("invalid data URL in video inputs")?;
    storage.upload(&bytes, &mime)
}

/// Image and audio pick lip sync, an image alone picks image-to-video,
/// anything else text-to-video.
pub fn select_model(params: &VideoTaskParams) -> String {
    if let Some(model) = params.model.as_deref() {
        return model.to_string();
    }
    match (params.image_url.is_some(), params.audio_url.is_some()) {
        (true, true) => LIP_SYNC_MODEL,
        (true, false) => IMAGE_TO_VIDEO_MODEL,
        _ => TEXT_TO_VIDEO_MODEL,
    }
    .to_string()
}

pub fn is_veo_model(model: &str) -> bool {
    model.contains("veo")
}

/// Model-specific `input` object for a task.
pub fn task_input(model: &str, params: &VideoTaskParams) -> Value {
    let mut input = map_object(json!({
        "prompt": params.prompt,
        "mode": params.mode.as_str(),
    }));
    let ratio = params
        .aspect_ratio
        .clone()
        .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string());
    if model == LIP_SYNC_MODEL {
        input.insert("image_url".to_string(), json!(params.image_url));
        input.insert("audio_url".to_string(), json!(params.audio_url));
    } else if is_veo_model(model) {
        input.insert("aspect_ratio".to_string(), json!(ratio));
        if let Some(url) = params.image_url.as_deref() {
            input.insert("image_urls".to_string(), json!([url]));
        }
    } else if model == IMAGE_TO_VIDEO_MODEL {
        input.insert("image_urls".to_string(), json!([params.image_url]));
        input.insert("index".to_string(), json!(0));
    } else {
        input.insert("aspect_ratio".to_string(), json!(ratio));
    }
    Value::Object(input)
}

/// Veo jobs use their own endpoint and body shape; reference images force
/// the fast Veo model and an unsupported ratio falls back to 16:9.
pub fn create_task_request(
    api_base: &str,
    model: &str,
    input: &Value,
    callback_url: Option<&str>,
) -> (String, Value) {
    if !is_veo_model(model) {
        return (
            format!("{api_base}/jobs/createTask"),
            json!({ "model": model, "callBackUrl": callback_url, "input": input }),
        );
    }
    let ratio = input
        .get("aspect_ratio")
        .and_then(Value::as_str)
        .filter(|ratio| VEO_RATIOS.contains(ratio))
        .unwrap_or(VEO_DEFAULT_RATIO);
    let image_urls = input
        .get("image_urls")
        .and_then(Value::as_array)
        .filter(|urls| !urls.is_empty());
    let veo_model = if image_urls.is_some() {
        VEO_REFERENCE_MODEL
    } else {
        model
    };
    let mut body = map_object(json!({
        "prompt": input.get("prompt").and_then(Value::as_str).unwrap_or_default(),
        "model": veo_model,
        "callBackUrl": callback_url,
        "aspect_ratio": ratio,
        "enableTranslation": true,
    }));
    if let Some(urls) = image_urls {
        body.insert("imageUrls".to_string(), Value::Array(urls.clone()));
        body.insert("generationType".to_string(), json!("REFERENCE_2_VIDEO"));
    }
    (format!("{api_base}/veo/generate"), Value::Object(body))
}

/// Status vocabulary of the task API folded into [`VideoStatus`].
pub fn normalize_status(raw: &str) -> VideoStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "success" | "succeeded" => VideoStatus::Done,
        "failed" | "fail" | "error" => VideoStatus::Error,
        "processing" | "running" | "generating" => VideoStatus::Processing,
        _ => VideoStatus::Queued,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub task_id: String,
    pub status: VideoStatus,
    pub video_url: Option<String>,
    pub error: Option<String>,
    pub progress: u8,
}

/// Reads a `recordInfo` body. A result URL anywhere in the payload means
/// the task is done regardless of the reported state.
pub fn parse_status(task_id: &str, body: &Value) -> TaskStatus {
    let info = body
        .get("data")
        .filter(|data| data.is_object())
        .unwrap_or(body);
    let text = |key: &str| {
        info.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let raw_status = text("status").or_else(|| text("state")).unwrap_or_default();
    let mut status = normalize_status(&raw_status);

    let result_urls = result_urls(info.get("resultJson"));
    let video_url = result_urls
        .into_iter()
        .next()
        .or_else(|| text("videoUrl"))
        .or_else(|| text("url"))
        .or_else(|| {
            if status == VideoStatus::Done {
                text("result")
            } else {
                None
            }
        });
    if video_url.is_some() {
        status = VideoStatus::Done;
    }

    let error = if status == VideoStatus::Error {
        text("failMsg")
            .or_else(|| text("errorMsg"))
            .or_else(|| text("error"))
            .or_else(|| text("msg"))
    } else {
        None
    };
    let progress = info
        .get("progress")
        .and_then(Value::as_f64)
        .map(|value| value.clamp(0.0, 100.0).round() as u8)
        .unwrap_or(if status == VideoStatus::Done { 100 } else { 0 });

    TaskStatus {
        task_id: task_id.to_string(),
        status,
        video_url,
        error,
        progress,
    }
}

/// `resultJson` arrives as an encoded string or, from some endpoints, as an
/// object.
fn result_urls(raw: Option<&Value>) -> Vec<String> {
    let parsed = match raw {
        Some(Value::String(text)) => serde_json::from_str::<Value>(text).ok(),
        Some(value @ Value::Object(_)) => Some(value.clone()),
        _ => None,
    };
    parsed
        .as_ref()
        .and_then(|value| value.get("resultUrls"))
        .and_then(Value::as_array)
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn task_id_from_response(body: &Value) -> Option<String> {
    let data = body.get("data");
    [
        body.get("task_id"),
        body.get("taskId"),
        data.and_then(|data| data.get("task_id")),
        data.and_then(|data| data.get("taskId")),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_str)
    .map(str::to_string)
}

pub trait VideoTaskApi: Send + Sync {
    /// Creates a task and returns its id.
    fn create_task(&self, model: &str, input: &Value) -> Result<String>;
    fn check_status(&self, task_id: &str) -> Result<TaskStatus>;
}

pub struct KieVideoClient {
    api_base: String,
    api_key: Option<String>,
    callback_url: Option<String>,
    http: HttpClient,
}

impl KieVideoClient {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            callback_url: None,
            http: HttpClient::new(),
        }
    }

    pub fn with_callback_url(mut self, url: Option<String>) -> Self {
        self.callback_url = url;
        self
    }

    fn api_key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(key) => Ok(key),
            None => Err(anyhow::Error::new(GenerationError::Upstream {
                code: UpstreamCode::InternalError,
                message: "Hệ thống đang gặp lỗi cấu hình. Vui lòng thử lại sau.".to_string(),
                details: Some("KIE_API_KEY not configured".to_string()),
            })),
        }
    }
}

impl VideoTaskApi for KieVideoClient {
    fn create_task(&self, model: &str, input: &Value) -> Result<String> {
        let api_key = self.api_key()?;
        let (endpoint, body) =
            create_task_request(&self.api_base, model, input, self.callback_url.as_deref());
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .json(&body)
            .send()
            .map_err(|err| GenerationError::Transport(format!("kie.ai request failed: {err}")))?;
        let payload = kie_json_or_error(response)?;
        match task_id_from_response(&payload) {
            Some(task_id) => Ok(task_id),
            None => bail!(
                "kie.ai response did not contain task_id: {}",
                truncate_text(&payload.to_string(), 256)
            ),
        }
    }

    fn check_status(&self, task_id: &str) -> Result<TaskStatus> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .get(format!("{}/jobs/recordInfo", self.api_base))
            .query(&[("taskId", task_id)])
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .send()
            .map_err(|err| GenerationError::Transport(format!("kie.ai status check failed: {err}")))?;
        let payload = kie_json_or_error(response)?;
        Ok(parse_status(task_id, &payload))
    }
}

/// The API reports some failures with HTTP 200 and a non-200 `code` field.
fn kie_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response.text().context("kie.ai response body read failed")?;
    if !status.is_success() {
        return Err(GenerationError::from_upstream_body(status.as_u16(), &body).into());
    }
    let payload: Value = serde_json::from_str(&body).context("kie.ai returned invalid JSON")?;
    if let Some(code) = payload.get("code").and_then(Value::as_u64) {
        if code != 200 {
            let message = payload
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("kie.ai request failed");
            return Err(GenerationError::from_upstream_body(
                u16::try_from(code).unwrap_or(500),
                &json!({ "error": message, "code": code }).to_string(),
            )
            .into());
        }
    }
    Ok(payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` polls until the task settles.
    pub max_attempts: Option<u32>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

pub enum PollUpdate<'a> {
    Status(&'a TaskStatus),
    /// A status check failed; polling carries on.
    CheckFailed(&'a anyhow::Error),
}

/// Waits `interval` before each status check until the task finishes.
/// Returns the video URL; a failed task or an exhausted attempt budget is
/// an error.
pub fn poll_until_complete<F>(
    api: &dyn VideoTaskApi,
    task_id: &str,
    options: PollOptions,
    mut on_progress: F,
) -> Result<String>
where
    F: FnMut(PollUpdate<'_>),
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        if let Some(max) = options.max_attempts {
            if attempts > max {
                bail!(GenerationError::Upstream {
                    code: UpstreamCode::GenerationFailed,
                    message: format!(
                        "Video task {task_id} timed out after {} status checks",
                        max
                    ),
                    details: None,
                });
            }
        }
        if !options.interval.is_zero() {
            thread::sleep(options.interval);
        }
        let status = match api.check_status(task_id) {
            Ok(status) => status,
            Err(err) => {
                on_progress(PollUpdate::CheckFailed(&err));
                continue;
            }
        };
        on_progress(PollUpdate::Status(&status));
        match status.status {
            VideoStatus::Done => {
                return match status.video_url {
                    Some(url) => Ok(url),
                    None => bail!("Video URL not found in response for task {task_id}"),
                };
            }
            VideoStatus::Error => {
                bail!(GenerationError::Upstream {
                    code: UpstreamCode::GenerationFailed,
                    message: status.error.unwrap_or_else(|| "Task failed".to_string()),
                    details: Some(format!("task {task_id}")),
                });
            }
            VideoStatus::Queued | VideoStatus::Processing => {}
        }
    }
}

/// Creates one video task and tracks it on `board` until it settles.
pub fn run_video_task(
    api: &dyn VideoTaskApi,
    board: &Mutex<VideoTaskBoard>,
    params: &VideoTaskParams,
    options: PollOptions,
    events: &EventWriter,
) -> Result<String> {
    let source = params.source_key();
    lock(board).enqueue(&source)?;
    let model = select_model(params);
    let input = task_input(&model, params);

    let task_id = match api.create_task(&model, &input) {
        Ok(task_id) => task_id,
        Err(err) => {
            return Err(settle_failure(board, &source, None, &model, err, events));
        }
    };
    lock(board).attach_task_id(&source, &task_id);
    events.emit_best_effort(
        "video_task_created",
        map_object(json!({
            "source": display_source(&source),
            "task_id": task_id,
            "model": model,
            "input": input,
        })),
    );

    let result = poll_until_complete(api, &task_id, options, |update| match update {
        PollUpdate::Status(status) => {
            if !status.status.is_terminal() {
                lock(board).mark_progress(&source, status.status, status.progress);
            }
            events.emit_best_effort(
                "video_progress",
                map_object(json!({
                    "task_id": task_id,
                    "status": status.status,
                    "progress": status.progress,
                })),
            );
        }
        PollUpdate::CheckFailed(err) => {
            events.emit_best_effort(
                "video_progress",
                map_object(json!({
                    "task_id": task_id,
                    "poll_error": error_chain_text(err, 512),
                })),
            );
        }
    });

    match result {
        Ok(url) => {
            lock(board).complete(&source, &url);
            events.emit_best_effort(
                "video_finished",
                map_object(json!({
                    "source": display_source(&source),
                    "task_id": task_id,
                    "model": model,
                    "status": VideoStatus::Done,
                    "video_url": url,
                })),
            );
            Ok(url)
        }
        Err(err) => Err(settle_failure(board, &source, Some(&task_id), &model, err, events)),
    }
}

fn settle_failure(
    board: &Mutex<VideoTaskBoard>,
    source: &str,
    task_id: Option<&str>,
    model: &str,
    err: anyhow::Error,
    events: &EventWriter,
) -> anyhow::Error {
    let message = error_chain_text(&err, 512);
    lock(board).fail(source, &message);
    events.emit_best_effort(
        "video_finished",
        map_object(json!({
            "source": display_source(source),
            "task_id": task_id,
            "model": model,
            "status": VideoStatus::Error,
            "error": message,
        })),
    );
    err
}

fn display_source(source: &str) -> String {
    if source.starts_with("data:") {
        format!("data-url ({} chars)", source.len())
    } else {
        source.to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::anyhow;
    use duky_contracts::events::read_event_types;

    use super::*;
    use crate::gallery::LocalGallery;

    /// Replays a fixed sequence of status checks.
    struct ScriptedApi {
        created: Mutex<Vec<(String, Value)>>,
        checks: Mutex<VecDeque<Result<TaskStatus, String>>>,
    }

    impl ScriptedApi {
        fn new(checks: Vec<Result<TaskStatus, String>>) -> Self {
            Self {
                created: Mutex::new(Vec::new()),
                checks: Mutex::new(checks.into()),
            }
        }
    }

    impl VideoTaskApi for ScriptedApi {
        fn create_task(&self, model: &str, input: &Value) -> Result<String> {
            lock(&self.created).push((model.to_string(), input.clone()));
            Ok("task-1".to_string())
        }

        fn check_status(&self, _task_id: &str) -> Result<TaskStatus> {
            match lock(&self.checks).pop_front() {
                Some(Ok(status)) => Ok(status),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Ok(status(VideoStatus::Processing, None, 50)),
            }
        }
    }

    fn status(status: VideoStatus, url: Option<&str>, progress: u8) -> TaskStatus {
        TaskStatus {
            task_id: "task-1".to_string(),
            status,
            video_url: url.map(str::to_string),
            error: None,
            progress,
        }
    }

    fn fast() -> PollOptions {
        PollOptions {
            interval: Duration::ZERO,
            max_attempts: Some(10),
        }
    }

    #[test]
    fn model_follows_inputs() {
        let mut params = VideoTaskParams::default();
        assert_eq!(select_model(&params), TEXT_TO_VIDEO_MODEL);
        params.image_url = Some("https://cdn/a.png".to_string());
        assert_eq!(select_model(&params), IMAGE_TO_VIDEO_MODEL);
        params.audio_url = Some("https://cdn/a.mp3".to_string());
        assert_eq!(select_model(&params), LIP_SYNC_MODEL);
        params.model = Some("veo3".to_string());
        assert_eq!(select_model(&params), "veo3");
    }

    #[test]
    fn inputs_are_shaped_per_model() {
        let params = VideoTaskParams {
            prompt: "gió thổi".to_string(),
            image_url: Some("https://cdn/a.png".to_string()),
            aspect_ratio: Some("9:16".to_string()),
            ..VideoTaskParams::default()
        };
        let grok = task_input(IMAGE_TO_VIDEO_MODEL, &params);
        assert_eq!(grok["image_urls"], json!(["https://cdn/a.png"]));
        assert_eq!(grok["index"], json!(0));
        assert!(grok.get("aspect_ratio").is_none());

        let veo = task_input("veo3", &params);
        assert_eq!(veo["aspect_ratio"], json!("9:16"));

        let text = task_input(TEXT_TO_VIDEO_MODEL, &VideoTaskParams::default());
        assert_eq!(text["aspect_ratio"], json!(DEFAULT_ASPECT_RATIO));
        assert_eq!(text["mode"], json!("normal"));
    }

    #[test]
    fn veo_requests_use_their_own_endpoint() {
        let input = json!({"prompt": "p", "aspect_ratio": "2:3", "image_urls": ["https://cdn/a.png"]});
        let (endpoint, body) = create_task_request("https://api.kie.ai/api/v1", "veo3", &input, None);
        assert_eq!(endpoint, "https://api.kie.ai/api/v1/veo/generate");
        assert_eq!(body["model"], json!(VEO_REFERENCE_MODEL));
        assert_eq!(body["aspect_ratio"], json!("16:9"));
        assert_eq!(body["generationType"], json!("REFERENCE_2_VIDEO"));

        let (endpoint, body) =
            create_task_request("https://api.kie.ai/api/v1", TEXT_TO_VIDEO_MODEL, &input, Some("https://cb"));
        assert!(endpoint.ends_with("/jobs/createTask"));
        assert_eq!(body["callBackUrl"], json!("https://cb"));
        assert_eq!(body["input"], input);
    }

    #[test]
    fn status_bodies_are_normalized() {
        let done = parse_status(
            "t",
            &json!({"code": 200, "data": {"state": "success", "resultJson": "{\"resultUrls\":[\"https://cdn/v.mp4\"]}"}}),
        );
        assert_eq!(done.status, VideoStatus::Done);
        assert_eq!(done.video_url.as_deref(), Some("https://cdn/v.mp4"));
        assert_eq!(done.progress, 100);

        let implied = parse_status("t", &json!({"status": "waiting", "videoUrl": "https://cdn/x.mp4"}));
        assert_eq!(implied.status, VideoStatus::Done);

        let failed = parse_status("t", &json!({"data": {"state": "fail", "failMsg": "nsfw"}}));
        assert_eq!(failed.status, VideoStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("nsfw"));

        let running = parse_status("t", &json!({"data": {"status": "RUNNING", "progress": 42.4}}));
        assert_eq!((running.status, running.progress), (VideoStatus::Processing, 42));
        assert_eq!(normalize_status("whatever"), VideoStatus::Queued);
    }

    #[test]
    fn task_id_is_found_at_any_level() {
        assert_eq!(task_id_from_response(&json!({"data": {"taskId": "a"}})).as_deref(), Some("a"));
        assert_eq!(task_id_from_response(&json!({"task_id": "b"})).as_deref(), Some("b"));
        assert_eq!(task_id_from_response(&json!({"data": {}})), None);
    }

    #[test]
    fn polling_survives_check_errors_and_returns_url() -> anyhow::Result<()> {
        let api = ScriptedApi::new(vec![
            Ok(status(VideoStatus::Queued, None, 0)),
            Err("timeout".to_string()),
            Ok(status(VideoStatus::Done, Some("https://cdn/v.mp4"), 100)),
        ]);
        let mut failures = 0;
        let url = poll_until_complete(&api, "task-1", fast(), |update| {
            if let PollUpdate::CheckFailed(_) = update {
                failures += 1;
            }
        })?;
        assert_eq!(url, "https://cdn/v.mp4");
        assert_eq!(failures, 1);
        Ok(())
    }

    #[test]
    fn polling_stops_at_the_attempt_budget() {
        let api = ScriptedApi::new(Vec::new());
        let options = PollOptions {
            interval: Duration::ZERO,
            max_attempts: Some(3),
        };
        let mut ticks = 0;
        let result = poll_until_complete(&api, "task-1", options, |_| ticks += 1);
        assert!(result.is_err());
        assert_eq!(ticks, 3);
    }

    #[test]
    fn failed_task_reports_upstream_message() {
        let mut failed = status(VideoStatus::Error, None, 0);
        failed.error = Some("nội dung bị chặn".to_string());
        let api = ScriptedApi::new(vec![Ok(failed)]);
        let err = match poll_until_complete(&api, "task-1", fast(), |_| {}) {
            Err(err) => err,
            Ok(url) => panic!("unexpected url {url}"),
        };
        assert_eq!(
            duky_contracts::errors::classify(&err).user_message(),
            "nội dung bị chặn"
        );
    }

    #[test]
    fn run_tracks_the_board_and_emits_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = EventWriter::new(temp.path().join("events.jsonl"), "s-1");
        let board = Mutex::new(VideoTaskBoard::new());
        let api = ScriptedApi::new(vec![
            Ok(status(VideoStatus::Processing, None, 30)),
            Ok(status(VideoStatus::Done, Some("https://cdn/v.mp4"), 100)),
        ]);
        let params = VideoTaskParams {
            prompt: "sóng biển".to_string(),
            image_url: Some("https://cdn/a.png".to_string()),
            ..VideoTaskParams::default()
        };
        let url = run_video_task(&api, &board, &params, fast(), &events)?;
        assert_eq!(url, "https://cdn/v.mp4");

        let board = lock(&board);
        let task = board.get("https://cdn/a.png").cloned();
        let task = task.unwrap_or_else(|| panic!("task missing"));
        assert_eq!(task.status, VideoStatus::Done);
        assert_eq!(task.task_id.as_deref(), Some("task-1"));
        assert_eq!(lock(&api.created)[0].0, IMAGE_TO_VIDEO_MODEL);
        assert_eq!(
            read_event_types(events.path())?,
            vec![
                "video_task_created".to_string(),
                "video_progress".to_string(),
                "video_progress".to_string(),
                "video_finished".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn app_template_and_inline_uploads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gallery = LocalGallery::open(temp.path())?;
        let app = VideoAppConfig {
            id: "dance".to_string(),
            name: "Nhảy".to_string(),
            model: None,
            mode: VideoMode::Fast,
            aspect_ratio: None,
            prompt_template: Some("{{subject}} nhảy theo điệu {{style}}".to_string()),
        };
        let inputs = map_object(json!({
            "subject": "Cô gái",
            "style": "dân vũ",
            "image_urls": ["data:image/png;base64,iVBORw0K"],
        }));
        let resolved = resolve_inputs(&inputs, &gallery)?;
        let params = params_from_app(&app, &resolved);
        assert_eq!(params.prompt, "Cô gái nhảy theo điệu dân vũ");
        assert_eq!(params.aspect_ratio.as_deref(), Some(DEFAULT_ASPECT_RATIO));
        let image = params.image_url.unwrap_or_default();
        assert!(image.contains("uploads") && image.ends_with(".png"));
        assert!(resolve_inputs(&map_object(json!({"a": "data:broken"})), &gallery).is_err());
        Ok(())
    }
}
