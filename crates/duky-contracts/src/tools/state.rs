use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{FailureKind, GenerationError};

pub const MAX_INPUT_IMAGES: usize = 4;
pub const HISTORY_LIMIT: usize = 40;
/// Upper bound for `image_count` on the count-driven tools.
pub const MAX_IMAGE_COUNT: u32 = 4;
/// Styles or studio templates one batch may pick.
pub const MAX_STYLE_PICKS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKey {
    PosterCreator,
    AvatarCreator,
    FreeGeneration,
    SwapStyle,
    TemplateComposer,
    ImageInterpolation,
    KhmerPhotoMerge,
    StudioGenerator,
}

impl ToolKey {
    pub const ALL: [ToolKey; 8] = [
        Self::PosterCreator,
        Self::AvatarCreator,
        Self::FreeGeneration,
        Self::SwapStyle,
        Self::TemplateComposer,
        Self::ImageInterpolation,
        Self::KhmerPhotoMerge,
        Self::StudioGenerator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PosterCreator => "poster-creator",
            Self::AvatarCreator => "avatar-creator",
            Self::FreeGeneration => "free-generation",
            Self::SwapStyle => "swap-style",
            Self::TemplateComposer => "template-composer",
            Self::ImageInterpolation => "image-interpolation",
            Self::KhmerPhotoMerge => "khmer-photo-merge",
            Self::StudioGenerator => "studio-generator",
        }
    }
}

impl fmt::Display for ToolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim();
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == wanted)
            .ok_or_else(|| format!("unknown tool '{wanted}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Idle,
    Configuring,
    Analyzing,
    Generating,
    Results,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Analyzing => "analyzing",
            Self::Generating => "generating",
            Self::Results => "results",
        }
    }

    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        self == next
            || matches!(
                (self, next),
                (Idle, Configuring)
                    | (Configuring, Analyzing)
                    | (Configuring, Generating)
                    | (Analyzing, Generating)
                    | (Analyzing, Configuring)
                    | (Generating, Results)
                    | (Generating, Configuring)
                    | (Results, Configuring)
            )
    }
}

/// User-facing options shared by every tool. Tool specific fields such as
/// the poster domain or headline live in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOptions {
    pub aspect_ratio: String,
    pub remove_watermark: bool,
    pub notes: String,
    pub image_count: u32,
    pub style: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            aspect_ratio: "1:1".to_string(),
            remove_watermark: false,
            notes: String::new(),
            image_count: 1,
            style: None,
            extra: Map::new(),
        }
    }
}

impl ToolOptions {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn extra_bool(&self, key: &str) -> bool {
        self.extra.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_extra(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }

    pub fn checked_image_count(&self) -> Result<usize, GenerationError> {
        if !(1..=MAX_IMAGE_COUNT).contains(&self.image_count) {
            return Err(GenerationError::Validation(format!(
                "image count must be between 1 and {MAX_IMAGE_COUNT}, got {}",
                self.image_count
            )));
        }
        Ok(self.image_count as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SlotStatus {
    Pending,
    Done { url: String },
    Failed { error: String, failure: FailureKind },
}

/// One requested image. Slots replace the old pair of parallel
/// `generatedImages`/`generationErrors` arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSlot {
    pub id: String,
    pub label: String,
    pub status: SlotStatus,
}

impl GenerationSlot {
    pub fn url(&self) -> Option<&str> {
        match &self.status {
            SlotStatus::Done { url } => Some(url.as_str()),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, SlotStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalImage {
    pub label: String,
    pub url: String,
}

/// Counts reported when a batch settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTally {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub tool: ToolKey,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub options: ToolOptions,
    #[serde(default)]
    pub slots: Vec<GenerationSlot>,
    #[serde(default)]
    pub historical_images: Vec<HistoricalImage>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(skip)]
    epoch: u64,
}

impl ToolState {
    pub fn new(tool: ToolKey) -> Self {
        Self {
            tool,
            stage: Stage::Idle,
            inputs: Vec::new(),
            options: ToolOptions::default(),
            slots: Vec::new(),
            historical_images: Vec::new(),
            error: None,
            epoch: 0,
        }
    }

    /// Token of the current generation attempt. Results carrying an older
    /// token are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn add_input(&mut self, url: impl Into<String>) -> Result<(), GenerationError> {
        if self.inputs.len() >= MAX_INPUT_IMAGES {
            return Err(GenerationError::Validation(format!(
                "at most {MAX_INPUT_IMAGES} input images are allowed"
            )));
        }
        self.inputs.push(url.into());
        if self.stage == Stage::Idle {
            self.stage = Stage::Configuring;
        }
        Ok(())
    }

    pub fn remove_input(&mut self, index: usize) -> Option<String> {
        if index < self.inputs.len() {
            Some(self.inputs.remove(index))
        } else {
            None
        }
    }

    pub fn transition(&mut self, next: Stage) -> Result<(), GenerationError> {
        if !self.stage.can_transition_to(next) {
            return Err(GenerationError::Validation(format!(
                "cannot move from {} to {}",
                self.stage.as_str(),
                next.as_str()
            )));
        }
        self.stage = next;
        Ok(())
    }

    /// Opens a new attempt with one pending slot per label and returns its
    /// epoch. Idle and results stages pass through `configuring` first.
    pub fn begin_generation(&mut self, labels: &[String]) -> Result<u64, GenerationError> {
        if labels.is_empty() {
            return Err(GenerationError::Validation(
                "nothing to generate".to_string(),
            ));
        }
        if self.stage == Stage::Generating {
            return Err(GenerationError::Validation(
                "a batch is already generating".to_string(),
            ));
        }
        if matches!(self.stage, Stage::Idle | Stage::Results) {
            self.transition(Stage::Configuring)?;
        }
        self.transition(Stage::Generating)?;

        self.epoch += 1;
        let epoch = self.epoch;
        self.error = None;
        self.slots = labels
            .iter()
            .enumerate()
            .map(|(idx, label)| GenerationSlot {
                id: format!("e{epoch}-s{idx}"),
                label: label.clone(),
                status: SlotStatus::Pending,
            })
            .collect();
        Ok(epoch)
    }

    /// Stores a finished image in its slot. Returns `false` when the result
    /// belongs to a cancelled or superseded attempt and was dropped.
    pub fn resolve_slot(&mut self, epoch: u64, index: usize, url: impl Into<String>) -> bool {
        if !self.accepts(epoch) {
            return false;
        }
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        let url = url.into();
        slot.status = SlotStatus::Done { url: url.clone() };
        let label = slot.label.clone();
        self.push_history(label, url);
        true
    }

    pub fn fail_slot(&mut self, epoch: u64, index: usize, err: &GenerationError) -> bool {
        if !self.accepts(epoch) {
            return false;
        }
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        slot.status = SlotStatus::Failed {
            error: err.user_message(),
            failure: err.kind(),
        };
        true
    }

    /// Settles the attempt once no slot is pending.
    ///
    /// Any success lands on `results` with no error. Zero successes land on
    /// `results` with an error, except a batch refused purely for credits,
    /// which returns to `configuring` without a banner.
    pub fn complete_generation(&mut self, epoch: u64) -> Option<BatchTally> {
        if !self.accepts(epoch) || self.slots.iter().any(GenerationSlot::is_pending) {
            return None;
        }
        let requested = self.slots.len();
        let succeeded = self.slots.iter().filter(|slot| slot.url().is_some()).count();
        let failed = requested - succeeded;

        if succeeded > 0 {
            self.stage = Stage::Results;
            self.error = None;
        } else if self.slots.iter().all(|slot| {
            matches!(
                slot.status,
                SlotStatus::Failed {
                    failure: FailureKind::InsufficientCredits,
                    ..
                }
            )
        }) {
            self.stage = Stage::Configuring;
            self.error = None;
        } else {
            self.stage = Stage::Results;
            self.error = Some(self.first_failure_message());
        }

        Some(BatchTally {
            requested,
            succeeded,
            failed,
            stage: self.stage,
        })
    }

    /// Reopens one finished slot while the rest of the batch stays on screen.
    /// Returns the new epoch and the image the slot showed before.
    pub fn begin_regeneration(&mut self, index: usize) -> Result<(u64, String), GenerationError> {
        if self.stage != Stage::Results {
            return Err(GenerationError::Validation(format!(
                "only a settled batch can be regenerated, the tool is {}",
                self.stage.as_str()
            )));
        }
        let source = self
            .slots
            .get(index)
            .and_then(GenerationSlot::url)
            .map(str::to_string)
            .ok_or_else(|| {
                GenerationError::Validation(format!("slot {index} has no image to regenerate"))
            })?;
        self.transition(Stage::Configuring)?;
        self.transition(Stage::Generating)?;

        self.epoch += 1;
        self.error = None;
        self.slots[index].status = SlotStatus::Pending;
        Ok((self.epoch, source))
    }

    /// Writes the regenerated image, or puts `source` back on failure, and
    /// returns to `results`. Stale epochs are ignored.
    pub fn settle_regeneration(
        &mut self,
        epoch: u64,
        index: usize,
        source: &str,
        outcome: Result<&str, &GenerationError>,
    ) -> bool {
        if !self.accepts(epoch) {
            return false;
        }
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        match outcome {
            Ok(url) => {
                slot.status = SlotStatus::Done {
                    url: url.to_string(),
                };
                let label = slot.label.clone();
                self.push_history(label, url);
            }
            Err(err) => {
                slot.status = SlotStatus::Done {
                    url: source.to_string(),
                };
                self.error = if err.is_insufficient_credits() {
                    None
                } else {
                    Some(err.user_message())
                };
            }
        }
        self.stage = Stage::Results;
        true
    }

    /// Rolls the tool back to `configuring`. Results still in flight are
    /// dropped on arrival because the epoch moves on.
    pub fn cancel(&mut self) {
        if matches!(self.stage, Stage::Generating | Stage::Analyzing) {
            self.epoch += 1;
            self.stage = Stage::Configuring;
            self.slots.clear();
        }
    }

    /// Index-stable view of the slots: an empty string for anything not done.
    pub fn generated_images(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| slot.url().unwrap_or_default().to_string())
            .collect()
    }

    pub fn push_history(&mut self, label: impl Into<String>, url: impl Into<String>) {
        self.historical_images.push(HistoricalImage {
            label: label.into(),
            url: url.into(),
        });
        if self.historical_images.len() > HISTORY_LIMIT {
            let overflow = self.historical_images.len() - HISTORY_LIMIT;
            self.historical_images.drain(..overflow);
        }
    }

    /// Copy with the transient output fields cleared, as embedded in images.
    pub fn sanitized(&self) -> ToolState {
        ToolState {
            tool: self.tool,
            stage: Stage::Configuring,
            inputs: self.inputs.clone(),
            options: self.options.clone(),
            slots: Vec::new(),
            historical_images: Vec::new(),
            error: None,
            epoch: 0,
        }
    }

    fn accepts(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.stage == Stage::Generating
    }

    fn first_failure_message(&self) -> String {
        self.slots
            .iter()
            .find_map(|slot| match &slot.status {
                SlotStatus::Failed { error, .. } => Some(error.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "Tạo ảnh thất bại.".to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::UpstreamCode;

    fn labels(count: usize) -> Vec<String> {
        (0..count).map(|idx| format!("Ảnh {}", idx + 1)).collect()
    }

    fn upstream_failure() -> GenerationError {
        GenerationError::Upstream {
            code: UpstreamCode::GenerationFailed,
            message: "no image".to_string(),
            details: None,
        }
    }

    #[test]
    fn slots_keep_requested_length_while_resolving() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::FreeGeneration);
        let epoch = state.begin_generation(&labels(4))?;
        assert_eq!(state.generated_images(), vec![""; 4]);

        assert!(state.resolve_slot(epoch, 2, "https://cdn/2.png"));
        assert_eq!(state.generated_images().len(), 4);
        assert!(state.fail_slot(epoch, 0, &upstream_failure()));
        assert_eq!(state.generated_images(), vec!["", "", "https://cdn/2.png", ""]);
        assert!(state.complete_generation(epoch).is_none());
        Ok(())
    }

    #[test]
    fn partial_success_lands_on_results_without_error() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::PosterCreator);
        let epoch = state.begin_generation(&labels(3))?;
        state.resolve_slot(epoch, 1, "u1");
        state.fail_slot(epoch, 0, &upstream_failure());
        state.fail_slot(epoch, 2, &upstream_failure());

        let tally = state.complete_generation(epoch).ok_or_else(|| anyhow::anyhow!("unsettled"))?;
        assert_eq!((tally.succeeded, tally.failed), (1, 2));
        assert_eq!(state.stage, Stage::Results);
        assert!(state.error.is_none());
        Ok(())
    }

    #[test]
    fn total_failure_sets_error_but_credit_refusal_does_not() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::SwapStyle);
        let epoch = state.begin_generation(&labels(2))?;
        state.fail_slot(epoch, 0, &upstream_failure());
        state.fail_slot(epoch, 1, &GenerationError::insufficient_credits("0 left"));
        state.complete_generation(epoch);
        assert_eq!(state.stage, Stage::Results);
        assert_eq!(state.error.as_deref(), Some("no image"));

        let epoch = state.begin_generation(&labels(2))?;
        for idx in 0..2 {
            state.fail_slot(epoch, idx, &GenerationError::insufficient_credits("0 left"));
        }
        state.complete_generation(epoch);
        assert_eq!(state.stage, Stage::Configuring);
        assert!(state.error.is_none());
        Ok(())
    }

    #[test]
    fn cancel_discards_late_results() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::AvatarCreator);
        let epoch = state.begin_generation(&labels(2))?;
        state.cancel();
        assert_eq!(state.stage, Stage::Configuring);
        assert!(!state.resolve_slot(epoch, 0, "late.png"));
        assert!(state.historical_images.is_empty());

        let next = state.begin_generation(&labels(1))?;
        assert!(next > epoch);
        assert!(!state.resolve_slot(epoch, 0, "late.png"));
        assert!(state.resolve_slot(next, 0, "fresh.png"));
        Ok(())
    }

    #[test]
    fn lifecycle_rejects_skipping_stages() {
        let mut state = ToolState::new(ToolKey::StudioGenerator);
        assert!(state.transition(Stage::Results).is_err());
        assert!(state.transition(Stage::Configuring).is_ok());
        assert!(state.transition(Stage::Results).is_err());
        assert!(state.transition(Stage::Analyzing).is_ok());
        assert!(state.transition(Stage::Generating).is_ok());
        assert!(state.begin_generation(&labels(1)).is_err());
    }

    #[test]
    fn inputs_are_capped_at_four() {
        let mut state = ToolState::new(ToolKey::ImageInterpolation);
        for idx in 0..MAX_INPUT_IMAGES {
            assert!(state.add_input(format!("data:image/png;base64,{idx}")).is_ok());
        }
        assert_eq!(state.stage, Stage::Configuring);
        assert!(state.add_input("one-too-many").is_err());
        assert_eq!(state.remove_input(0).as_deref(), Some("data:image/png;base64,0"));
    }

    #[test]
    fn image_count_outside_one_to_four_is_rejected() {
        let mut options = ToolOptions::default();
        assert_eq!(options.checked_image_count().ok(), Some(1));
        options.image_count = MAX_IMAGE_COUNT;
        assert_eq!(options.checked_image_count().ok(), Some(4));
        for bad in [0, MAX_IMAGE_COUNT + 1, 200] {
            options.image_count = bad;
            assert!(matches!(
                options.checked_image_count(),
                Err(GenerationError::Validation(_))
            ));
        }
    }

    #[test]
    fn regeneration_touches_only_its_slot() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::FreeGeneration);
        let first = state.begin_generation(&labels(3))?;
        for idx in 0..3 {
            state.resolve_slot(first, idx, format!("u{idx}"));
        }
        state.complete_generation(first);

        let (epoch, source) = state.begin_regeneration(1)?;
        assert!(epoch > first);
        assert_eq!(source, "u1");
        assert_eq!(state.stage, Stage::Generating);
        assert_eq!(state.generated_images(), vec!["u0", "", "u2"]);
        assert!(!state.resolve_slot(first, 1, "stale"));

        assert!(state.settle_regeneration(epoch, 1, &source, Ok("u1-new")));
        assert_eq!(state.stage, Stage::Results);
        assert_eq!(state.generated_images(), vec!["u0", "u1-new", "u2"]);
        assert_eq!(
            state.historical_images.last().map(|item| item.url.as_str()),
            Some("u1-new")
        );
        assert!(!state.settle_regeneration(epoch, 1, &source, Ok("twice")));
        Ok(())
    }

    #[test]
    fn failed_regeneration_restores_the_previous_image() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::PosterCreator);
        let first = state.begin_generation(&labels(2))?;
        state.resolve_slot(first, 0, "u0");
        state.fail_slot(first, 1, &upstream_failure());
        state.complete_generation(first);

        assert!(state.begin_regeneration(1).is_err());
        let (epoch, source) = state.begin_regeneration(0)?;
        assert!(state.settle_regeneration(epoch, 0, &source, Err(&upstream_failure())));
        assert_eq!(state.stage, Stage::Results);
        assert_eq!(state.generated_images(), vec!["u0", ""]);
        assert_eq!(state.error.as_deref(), Some("no image"));
        Ok(())
    }

    #[test]
    fn regeneration_needs_a_settled_batch() {
        let mut state = ToolState::new(ToolKey::FreeGeneration);
        assert!(state.begin_regeneration(0).is_err());
        state.stage = Stage::Configuring;
        assert!(state.begin_regeneration(0).is_err());
    }

    #[test]
    fn history_is_bounded() {
        let mut state = ToolState::new(ToolKey::FreeGeneration);
        for idx in 0..HISTORY_LIMIT + 5 {
            state.push_history("x", format!("u{idx}"));
        }
        assert_eq!(state.historical_images.len(), HISTORY_LIMIT);
        assert_eq!(state.historical_images[0].url, "u5");
    }

    #[test]
    fn sanitized_clears_transient_fields_and_keeps_options() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::PosterCreator);
        state.options.set_extra("domain", "Công nghệ");
        state.add_input("data:image/png;base64,AAAA")?;
        let epoch = state.begin_generation(&labels(1))?;
        state.resolve_slot(epoch, 0, "u");
        state.complete_generation(epoch);

        let clean = state.sanitized();
        assert_eq!(clean.stage, Stage::Configuring);
        assert!(clean.slots.is_empty() && clean.historical_images.is_empty());
        assert_eq!(clean.options.extra_str("domain"), Some("Công nghệ"));

        let encoded = serde_json::to_value(&clean)?;
        assert_eq!(encoded["tool"], json!("poster-creator"));
        assert_eq!(encoded["options"]["domain"], json!("Công nghệ"));
        Ok(())
    }
}
