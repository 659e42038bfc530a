use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes the generation backend attaches to structured failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamCode {
    ModelRefusal,
    SafetyViolation,
    QuotaExceeded,
    InsufficientCredits,
    InternalError,
    BadRequest,
    GenerationFailed,
    ServerBusy,
}

impl UpstreamCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelRefusal => "MODEL_REFUSAL",
            Self::SafetyViolation => "SAFETY_VIOLATION",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::InsufficientCredits => "INSUFFICIENT_CREDITS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::GenerationFailed => "GENERATION_FAILED",
            Self::ServerBusy => "SERVER_BUSY",
        }
    }

    /// Accepts the backend's own codes plus the Google API status names
    /// that show up when the image API answers directly.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MODEL_REFUSAL" => Some(Self::ModelRefusal),
            "SAFETY_VIOLATION" | "SAFETY" => Some(Self::SafetyViolation),
            "QUOTA_EXCEEDED" | "RESOURCE_EXHAUSTED" => Some(Self::QuotaExceeded),
            "INSUFFICIENT_CREDITS" => Some(Self::InsufficientCredits),
            "INTERNAL_ERROR" | "INTERNAL" => Some(Self::InternalError),
            "BAD_REQUEST" | "INVALID_ARGUMENT" | "FAILED_PRECONDITION" => Some(Self::BadRequest),
            "GENERATION_FAILED" => Some(Self::GenerationFailed),
            "SERVER_BUSY" | "UNAVAILABLE" | "DEADLINE_EXCEEDED" => Some(Self::ServerBusy),
            _ => None,
        }
    }

    fn from_http_status(status: u16) -> Self {
        match status {
            400 | 404 | 413 | 422 => Self::BadRequest,
            402 => Self::InsufficientCredits,
            429 => Self::QuotaExceeded,
            502..=504 => Self::ServerBusy,
            500..=599 => Self::InternalError,
            _ => Self::GenerationFailed,
        }
    }
}

/// Failure of one generation request, carried structurally from the API
/// boundary to the slot that displays it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("insufficient credits: {message}")]
    InsufficientCredits { message: String },

    #[error("{message} ({})", .code.as_str())]
    Upstream {
        code: UpstreamCode,
        message: String,
        details: Option<String>,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    Internal(String),
}

/// Serializable tag of a [`GenerationError`], stored on failed slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum FailureKind {
    InsufficientCredits,
    Upstream(UpstreamCode),
    Validation,
    Transport,
    Internal,
}

impl GenerationError {
    pub fn insufficient_credits(message: impl Into<String>) -> Self {
        Self::InsufficientCredits {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InsufficientCredits { .. } => FailureKind::InsufficientCredits,
            Self::Upstream { code, .. } => FailureKind::Upstream(*code),
            Self::Validation(_) => FailureKind::Validation,
            Self::Transport(_) => FailureKind::Transport,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn is_insufficient_credits(&self) -> bool {
        matches!(self, Self::InsufficientCredits { .. })
    }

    /// Text shown on an error card or banner.
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientCredits { .. } => {
                "Bạn đã hết Credit. Vui lòng nạp thêm để tiếp tục.".to_string()
            }
            Self::Upstream { code, message, .. } => {
                if message.trim().is_empty() {
                    default_upstream_message(*code).to_string()
                } else {
                    message.trim().to_string()
                }
            }
            Self::Validation(message) => message.clone(),
            Self::Transport(_) => {
                "Không thể kết nối tới máy chủ AI. Vui lòng thử lại sau.".to_string()
            }
            Self::Internal(message) => {
                format!("Đã xảy ra lỗi không mong muốn từ AI. Chi tiết: {message}")
            }
        }
    }

    /// Maps a non-success HTTP response into a typed error.
    ///
    /// Bodies shaped `{error, code, details}` win. Google style bodies
    /// `{error: {message, status}}` are understood too. Anything else falls
    /// back to the HTTP status.
    pub fn from_upstream_body(status: u16, body: &str) -> Self {
        if let Some(parsed) = parse_structured_body(body) {
            return parsed;
        }
        let code = UpstreamCode::from_http_status(status);
        let message = truncate(body.trim(), 512);
        if code == UpstreamCode::InsufficientCredits {
            return Self::insufficient_credits(message);
        }
        Self::Upstream {
            code,
            message: format!("request failed ({status}): {message}"),
            details: None,
        }
    }
}

fn default_upstream_message(code: UpstreamCode) -> &'static str {
    match code {
        UpstreamCode::ModelRefusal => "AI từ chối tạo ảnh với yêu cầu này.",
        UpstreamCode::SafetyViolation => "Yêu cầu vi phạm chính sách an toàn nội dung.",
        UpstreamCode::QuotaExceeded => "Hệ thống đang quá tải hạn mức. Vui lòng thử lại sau.",
        UpstreamCode::InsufficientCredits => "Bạn đã hết Credit.",
        UpstreamCode::InternalError => "Hệ thống gặp lỗi nội bộ. Vui lòng thử lại sau.",
        UpstreamCode::BadRequest => "Yêu cầu không hợp lệ.",
        UpstreamCode::GenerationFailed => "Tạo ảnh thất bại.",
        UpstreamCode::ServerBusy => "Máy chủ đang bận. Vui lòng thử lại sau.",
    }
}

fn parse_structured_body(body: &str) -> Option<GenerationError> {
    let start = body.find('{')?;
    let payload: Value = serde_json::from_str(&body[start..]).ok()?;
    let obj = payload.as_object()?;

    let (message, code_raw, details) = match obj.get("error")? {
        Value::String(message) => (
            message.clone(),
            obj.get("code").and_then(code_text),
            obj.get("details").map(details_text),
        ),
        Value::Object(inner) => (
            inner
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            inner
                .get("status")
                .and_then(code_text)
                .or_else(|| inner.get("code").and_then(code_text)),
            inner.get("details").map(details_text),
        ),
        _ => return None,
    };

    let code = code_raw
        .as_deref()
        .and_then(UpstreamCode::parse)
        .unwrap_or(UpstreamCode::InternalError);
    if code == UpstreamCode::InsufficientCredits {
        return Some(GenerationError::insufficient_credits(message));
    }
    Some(GenerationError::Upstream {
        code,
        message,
        details,
    })
}

fn code_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => number
            .as_u64()
            .map(|status| UpstreamCode::from_http_status(status as u16).as_str().to_string()),
        _ => None,
    }
}

fn details_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

const LEGACY_CREDIT_MARKERS: [&str; 2] = ["hết Credit", "Insufficient credits"];

/// Recovers a [`GenerationError`] from an arbitrary error chain.
///
/// A typed error anywhere in the chain is returned as is. Otherwise a JSON
/// body embedded in a message is parsed. Matching the legacy credit message
/// text is the last resort before treating the failure as internal.
pub fn classify(err: &anyhow::Error) -> GenerationError {
    for cause in err.chain() {
        if let Some(typed) = cause.downcast_ref::<GenerationError>() {
            return typed.clone();
        }
    }
    for cause in err.chain() {
        if let Some(parsed) = parse_structured_body(&cause.to_string()) {
            return parsed;
        }
    }
    let text = format!("{err:#}");
    if LEGACY_CREDIT_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
    {
        return GenerationError::insufficient_credits(text);
    }
    GenerationError::Internal(truncate(&text, 512))
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn typed_error_survives_context_layers() {
        let err = anyhow::Error::new(GenerationError::Upstream {
            code: UpstreamCode::SafetyViolation,
            message: "blocked".to_string(),
            details: None,
        })
        .context("slot 2 failed");
        let classified = classify(&err);
        assert_eq!(
            classified.kind(),
            FailureKind::Upstream(UpstreamCode::SafetyViolation)
        );
    }

    #[test]
    fn structured_body_sets_code() {
        let err = GenerationError::from_upstream_body(
            400,
            r#"{"error":"Hết lượt","code":"INSUFFICIENT_CREDITS","details":"balance=0"}"#,
        );
        assert!(err.is_insufficient_credits());

        let err = GenerationError::from_upstream_body(
            429,
            r#"{"error":{"code":429,"message":"Quota hit","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert_eq!(err.kind(), FailureKind::Upstream(UpstreamCode::QuotaExceeded));
        assert_eq!(err.user_message(), "Quota hit");
    }

    #[test]
    fn http_status_is_the_fallback() {
        let err = GenerationError::from_upstream_body(402, "payment required");
        assert!(err.is_insufficient_credits());
        let err = GenerationError::from_upstream_body(503, "<html>busy</html>");
        assert_eq!(err.kind(), FailureKind::Upstream(UpstreamCode::ServerBusy));
    }

    #[test]
    fn legacy_message_text_is_last_resort() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("Bạn đã hết Credit rồi"));
        let err = err.context("generate").unwrap_err();
        assert!(classify(&err).is_insufficient_credits());

        let err = anyhow::anyhow!("socket closed");
        assert_eq!(classify(&err).kind(), FailureKind::Internal);
    }

    #[test]
    fn failure_kind_serializes_with_code() -> anyhow::Result<()> {
        let encoded = serde_json::to_value(FailureKind::Upstream(UpstreamCode::ModelRefusal))?;
        assert_eq!(
            encoded,
            serde_json::json!({"kind": "upstream", "code": "MODEL_REFUSAL"})
        );
        Ok(())
    }
}
