use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use duky_contracts::errors::{classify, GenerationError};
use duky_contracts::events::{EventPayload, EventWriter};
use duky_contracts::lightbox::Lightbox;
use duky_contracts::models::{ModelSelection, ModelSelector, ModelSpec, ModelVersion};
use duky_contracts::runs::generation_log::GenerationLogWriter;
use duky_contracts::runs::history::{history_path, HistoryManifest};
use duky_contracts::runs::summary::{write_summary, SessionSummary};
use duky_contracts::tools::{
    Stage, ToolKey, ToolState, VideoTask, VideoTaskBoard, MAX_STYLE_PICKS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Map, Value};

use crate::config::EngineConfig;
use crate::credits::{CreditBalance, CreditTable, LocalCreditAccount};
use crate::dispatch::{
    dispatch_batch, regenerate_slot, BatchItem, BatchOutcome, BatchPlan, Capabilities,
    RegenerationOutcome,
};
use crate::gallery::LocalGallery;
use crate::metadata::extract_settings;
use crate::pool::Concurrency;
use crate::prompt::aspect::api_aspect_ratio;
use crate::prompt::avatar::{
    avatar_prompt, category_names, expand_random_ideas, planned_idea_count, random_marker_count,
    selected_ideas, style_reference_prompt, validate_selection, AVATAR_WORKERS,
};
use crate::prompt::free::{
    free_aspect_ratio, free_prompt, swap_style_items, swap_style_prompt, CUSTOM_REFERENCE,
};
use crate::prompt::interpolation::{edit_prompt, SourceAnalysis};
use crate::prompt::khmer::{khmer_fallback_prompt, khmer_prompt, khmer_template_prompt};
use crate::prompt::poster::{build_poster_prompt, poster_images, PosterOptions};
use crate::prompt::studio::{studio_fallback_prompt, studio_prompt};
use crate::prompt::template::{composition_images, outfit_composition_prompt, MAX_OUTFITS};
use crate::providers::{default_provider_registry, ImageProvider, ImageProviderRegistry};
use crate::session::ToolSession;
use crate::text::{
    adapt_prompt_to_context, analyze_avatar_concepts, analyze_source_image, default_text_registry,
    enhance_prompt, interpolate_prompts, TextProvider, TextProviderRegistry,
};
use crate::util::{map_object, now_utc_iso};
use crate::video::{
    params_from_app, resolve_inputs, run_video_task, KieVideoClient, PollOptions,
    VideoAppConfig, VideoTaskApi, VideoTaskParams,
};

const DRYRUN_TEXT_MODEL: &str = "dryrun-text-1";
const DEFAULT_STUDIO_NAME: &str = "Studio chuyên nghiệp";

/// What a tool's planner hands back to `generate`.
enum Planned {
    Ready(BatchPlan),
    /// Refused before any paid call was made.
    Refused { required: u64, available: u64 },
    /// The user cancelled during analysis.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanPreview {
    pub tool: ToolKey,
    pub images: usize,
    pub model: String,
    pub provider: String,
    pub credits_per_image: u64,
    pub total_credits: u64,
    pub credits_available: u64,
    pub fallback_reason: Option<String>,
}

impl PlanPreview {
    pub fn affordable(&self) -> bool {
        self.credits_available >= self.total_credits
    }
}

/// One working session: providers, credit account, gallery and the
/// session's log files under `session_dir`.
pub struct DukyEngine {
    session_dir: PathBuf,
    session_id: String,
    config: EngineConfig,
    events: EventWriter,
    model_selector: ModelSelector,
    providers: ImageProviderRegistry,
    text_providers: TextProviderRegistry,
    credit_table: CreditTable,
    credits: LocalCreditAccount,
    gallery: LocalGallery,
    generation_log: GenerationLogWriter,
    history: Mutex<HistoryManifest>,
    summary_path: PathBuf,
    started_at: String,
    video_api: Box<dyn VideoTaskApi>,
    video_board: Mutex<VideoTaskBoard>,
    poll_options: PollOptions,
    persist_gallery: bool,
    rng: StdRng,
}

impl DukyEngine {
    pub fn new(session_dir: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        let session_dir = session_dir.into();
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("failed to create {}", session_dir.display()))?;
        let session_id = session_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("session-rs")
            .to_string();
        let events = EventWriter::new(session_dir.join("events.jsonl"), session_id.clone());
        let credits = LocalCreditAccount::open(
            session_dir.join("credits.json"),
            &config.account,
            config.starting_credits,
        )?;
        let history_file = history_path(&session_dir);
        let history = if history_file.exists() {
            HistoryManifest::load(&history_file)
        } else {
            HistoryManifest::new(&history_file)
        };

        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": session_dir.to_string_lossy().to_string(),
                "model_version": config.model_version,
                "image_model": config.effective_image_model(),
                "metadata": config.enable_image_metadata,
            })),
        )?;

        Ok(Self {
            gallery: LocalGallery::open(&session_dir)?,
            generation_log: GenerationLogWriter::new(
                session_dir.join("generations.jsonl"),
                session_id.clone(),
            ),
            summary_path: session_dir.join("summary.json"),
            started_at: now_utc_iso(),
            model_selector: ModelSelector::new(None),
            providers: default_provider_registry(&config),
            text_providers: default_text_registry(&config),
            credit_table: CreditTable::load(),
            video_api: Box::new(KieVideoClient::new(
                config.kie_api_base.clone(),
                config.kie_api_key.clone(),
            )),
            video_board: Mutex::new(VideoTaskBoard::new()),
            poll_options: PollOptions::default(),
            persist_gallery: true,
            rng: StdRng::from_entropy(),
            history: Mutex::new(history),
            credits,
            events,
            session_id,
            session_dir,
            config,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn gallery(&self) -> &LocalGallery {
        &self.gallery
    }

    pub fn credits(&self) -> &LocalCreditAccount {
        &self.credits
    }

    pub fn credit_table(&self) -> &CreditTable {
        &self.credit_table
    }

    pub fn register_image_provider<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers.register(provider);
    }

    pub fn register_text_provider<P: TextProvider + 'static>(&mut self, provider: P) {
        self.text_providers.register(provider);
    }

    pub fn set_video_api(&mut self, api: Box<dyn VideoTaskApi>) {
        self.video_api = api;
    }

    pub fn set_poll_options(&mut self, options: PollOptions) {
        self.poll_options = options;
    }

    /// With persistence off, results come back as inline `data:` URLs.
    pub fn set_persist_gallery(&mut self, persist: bool) {
        self.persist_gallery = persist;
    }

    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn resolve_image_model(&self) -> Result<ModelSelection> {
        let requested = self.config.effective_image_model();
        self.model_selector
            .select(Some(&requested), "image")
            .map_err(|err| anyhow!(err))
    }

    /// Text model paired with the image model. Offline image models get the
    /// offline text model unless one is configured explicitly.
    pub fn resolve_text_model(&self, image: &ModelSpec) -> Result<ModelSelection> {
        let requested = match self.config.text_model.clone() {
            Some(model) => model,
            None if image.provider == "dryrun" => DRYRUN_TEXT_MODEL.to_string(),
            None => self.config.model_version.text_model().to_string(),
        };
        self.model_selector
            .select(Some(&requested), "text")
            .map_err(|err| anyhow!(err))
    }

    /// Price tier follows the model actually used, not the global switch.
    fn billing_version(model: &ModelSpec) -> ModelVersion {
        match model.credit_key.as_deref() {
            Some("image-v3") => ModelVersion::V3,
            _ => ModelVersion::V2,
        }
    }

    /// Try-on always bills the v3 tier.
    fn tool_billing(tool: ToolKey, model: &ModelSpec) -> ModelVersion {
        if tool == ToolKey::TemplateComposer {
            ModelVersion::V3
        } else {
            Self::billing_version(model)
        }
    }

    /// Try-on runs on the v3 image model; offline models are kept so tests
    /// and dry runs stay offline.
    fn tool_model(&self, tool: ToolKey, selected: ModelSpec) -> Result<ModelSpec> {
        if tool != ToolKey::TemplateComposer || selected.provider == "dryrun" {
            return Ok(selected);
        }
        self.model_selector
            .select(Some(ModelVersion::V3.image_model()), "image")
            .map(|selection| selection.model)
            .map_err(|err| anyhow!(err))
    }

    fn capabilities(&self, model: &ModelSpec) -> Result<Capabilities<'_>> {
        Ok(Capabilities {
            images: self.image_provider(model)?,
            credits: &self.credits,
            credit_table: &self.credit_table,
            gallery: &self.gallery,
            generation_log: Some(&self.generation_log),
            history: Some(&self.history),
            events: &self.events,
            embed_metadata: self.config.enable_image_metadata,
            persist_gallery: self.persist_gallery,
        })
    }

    /// Credit gate for tools that spend text-model calls before the batch.
    fn credit_precheck(
        &self,
        tool: ToolKey,
        version: ModelVersion,
        count: usize,
    ) -> Result<Option<Planned>> {
        let required = self.credit_table.batch_cost(version, count);
        let available = self.credits.available()?;
        let allowed = self.credits.check(required)?;
        self.events.emit_best_effort(
            "credit_check",
            map_object(json!({
                "tool": tool,
                "required": required,
                "available": available,
                "ok": allowed,
                "before_analysis": true,
            })),
        );
        Ok((!allowed).then_some(Planned::Refused {
            required,
            available,
        }))
    }

    fn image_provider(&self, model: &ModelSpec) -> Result<&dyn ImageProvider> {
        self.providers.get(&model.provider).ok_or_else(|| {
            anyhow!(
                "no image provider registered for '{}' (model {})",
                model.provider,
                model.name
            )
        })
    }

    fn text_provider(&self, model: &ModelSpec) -> Result<&dyn TextProvider> {
        self.text_providers.get(&model.provider).ok_or_else(|| {
            anyhow!(
                "no text provider registered for '{}' (model {})",
                model.provider,
                model.name
            )
        })
    }

    /// Cost and model for the batch the current settings would start.
    pub fn preview_plan(&self, state: &ToolState) -> Result<PlanPreview> {
        let selection = self.resolve_image_model()?;
        let model = self.tool_model(state.tool, selection.model)?;
        let images = planned_count(state);
        let version = Self::tool_billing(state.tool, &model);
        let preview = PlanPreview {
            tool: state.tool,
            images,
            credits_per_image: self.credit_table.per_image_cost(version),
            total_credits: self.credit_table.batch_cost(version, images),
            credits_available: self.credits.available()?,
            model: model.name,
            provider: model.provider,
            fallback_reason: selection.fallback_reason,
        };
        self.events.emit_best_effort(
            "plan_preview",
            map_object(json!({
                "tool": preview.tool,
                "images": preview.images,
                "model": preview.model,
                "provider": preview.provider,
                "total_credits": preview.total_credits,
                "credits_available": preview.credits_available,
                "fallback_reason": preview.fallback_reason,
            })),
        );
        Ok(preview)
    }

    /// Builds the tool's batch from the session state and runs it.
    pub fn generate(&mut self, session: &ToolSession) -> Result<BatchOutcome> {
        let state = session.snapshot();
        let model = self.tool_model(state.tool, self.resolve_image_model()?.model)?;
        let planned = match state.tool {
            ToolKey::PosterCreator => Planned::Ready(poster_plan(&state, &model)?),
            ToolKey::FreeGeneration => Planned::Ready(self.free_plan(&state, &model)?),
            ToolKey::SwapStyle => Planned::Ready(swap_style_plan(&state, &model)?),
            ToolKey::AvatarCreator => self.avatar_plan(session, &model)?,
            ToolKey::TemplateComposer => Planned::Ready(template_plan(&state, &model)?),
            ToolKey::ImageInterpolation => self.interpolation_plan(&state, &model)?,
            ToolKey::KhmerPhotoMerge => Planned::Ready(khmer_plan(&state, &model)?),
            ToolKey::StudioGenerator => Planned::Ready(studio_plan(&state, &model)?),
        };
        let plan = match planned {
            Planned::Ready(plan) => plan,
            Planned::Refused {
                required,
                available,
            } => {
                return Ok(BatchOutcome::InsufficientCredits {
                    required,
                    available,
                })
            }
            Planned::Cancelled => {
                return Ok(BatchOutcome::Cancelled {
                    epoch: session.read(ToolState::epoch),
                    discarded: 0,
                })
            }
        };
        dispatch_batch(session, &plan, &self.capabilities(&model)?)
    }

    /// Edits the image in slot `index` with `prompt`, charging one image.
    /// The other slots keep their results.
    pub fn regenerate_slot(
        &self,
        session: &ToolSession,
        index: usize,
        prompt: &str,
    ) -> Result<RegenerationOutcome> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(
                GenerationError::Validation("Vui lòng nhập yêu cầu chỉnh sửa.".to_string()).into(),
            );
        }
        let state = session.snapshot();
        let Some((label, source)) = state
            .slots
            .get(index)
            .and_then(|slot| slot.url().map(|url| (slot.label.clone(), url.to_string())))
        else {
            return Err(GenerationError::Validation(format!(
                "slot {index} has no image to regenerate"
            ))
            .into());
        };
        let model = self.tool_model(state.tool, self.resolve_image_model()?.model)?;
        let item = BatchItem {
            label,
            prompt: edit_prompt(prompt, state.options.remove_watermark),
            images: vec![source],
            aspect_ratio: None,
            remove_watermark: state.options.remove_watermark,
            fallback_prompt: None,
        };
        let plan = BatchPlan {
            tool: state.tool,
            items: vec![item],
            concurrency: Concurrency::FanOut,
            model_version: Self::tool_billing(state.tool, &model),
            model_name: model.name.clone(),
            input_prompt: prompt.to_string(),
        };
        regenerate_slot(session, index, &plan, &self.capabilities(&model)?)
    }

    /// Describes the source image of a prompt-from-image session and stores
    /// the result under `generated_prompt` and `prompt_suggestions`. `None`
    /// means the user cancelled meanwhile.
    pub fn analyze_source(
        &self,
        session: &ToolSession,
        expert: bool,
    ) -> Result<Option<SourceAnalysis>> {
        let state = session.snapshot();
        let Some(source) = state.inputs.first().cloned() else {
            return Err(GenerationError::Validation("Vui lòng tải lên ảnh gốc.".to_string()).into());
        };
        let image_model = self.resolve_image_model()?.model;
        let text_model = self.resolve_text_model(&image_model)?.model;
        let provider = self.text_provider(&text_model)?;
        let analyzed = self.while_analyzing(session, || {
            analyze_source_image(provider, &text_model.name, &source, expert, &self.events)
        })?;
        match analyzed {
            None => Ok(None),
            Some(Ok(analysis)) => {
                session.update(|state| {
                    state
                        .options
                        .set_extra("generated_prompt", analysis.main_prompt.clone());
                    state
                        .options
                        .set_extra("prompt_suggestions", json!(analysis.suggestions));
                    state.error = None;
                });
                Ok(Some(analysis))
            }
            Some(Err(err)) => {
                let message = classify(&err).user_message();
                session.update(|state| state.error = Some(message));
                Err(err)
            }
        }
    }

    fn free_plan(&self, state: &ToolState, model: &ModelSpec) -> Result<BatchPlan> {
        let raw_prompt = state.options.notes.trim();
        if raw_prompt.is_empty() {
            return Err(GenerationError::Validation("Vui lòng nhập prompt.".to_string()).into());
        }
        let count = state.options.checked_image_count()?;
        let prompt = if state.options.extra_bool("enhance_prompt") {
            let text_model = self.resolve_text_model(model)?.model;
            enhance_prompt(
                self.text_provider(&text_model)?,
                &text_model.name,
                raw_prompt,
                &self.events,
            )
        } else {
            raw_prompt.to_string()
        };
        let has_images = !state.inputs.is_empty();
        let item = BatchItem {
            label: String::new(),
            prompt: free_prompt(&prompt, has_images, state.options.remove_watermark),
            images: state.inputs.clone(),
            aspect_ratio: free_aspect_ratio(&state.options.aspect_ratio, has_images),
            remove_watermark: state.options.remove_watermark,
            fallback_prompt: None,
        };
        Ok(BatchPlan {
            tool: state.tool,
            items: numbered(item, count, "Ảnh"),
            concurrency: Concurrency::FanOut,
            model_version: Self::billing_version(model),
            model_name: model.name.clone(),
            input_prompt: prompt,
        })
    }

    fn avatar_plan(&mut self, session: &ToolSession, model: &ModelSpec) -> Result<Planned> {
        let state = session.snapshot();
        let Some(portrait) = state.inputs.first().cloned() else {
            return Err(GenerationError::Validation(
                "Vui lòng tải lên ảnh chân dung.".to_string(),
            )
            .into());
        };
        let options = &state.options;
        let style_image = options.extra_str("style_image").map(str::to_string);

        let (items, input_prompt) = if let Some(style_image) = style_image {
            let item = BatchItem {
                label: "Theo ảnh phong cách".to_string(),
                prompt: style_reference_prompt(&options.notes, options.remove_watermark),
                images: vec![portrait, style_image],
                aspect_ratio: api_aspect_ratio(&options.aspect_ratio),
                remove_watermark: options.remove_watermark,
                fallback_prompt: None,
            };
            (vec![item], "style-reference".to_string())
        } else {
            let selected = selected_ideas(&state);
            validate_selection(&selected)?;
            let suggested = if random_marker_count(&selected) > 0 {
                let version = Self::billing_version(model);
                let count = planned_idea_count(&selected);
                if let Some(refused) = self.credit_precheck(state.tool, version, count)? {
                    return Ok(refused);
                }
                match self.analyze_portrait(session, model, &portrait)? {
                    Some(found) => found,
                    None => return Ok(Planned::Cancelled),
                }
            } else {
                Vec::new()
            };
            let ideas = expand_random_ideas(&selected, &suggested, &mut self.rng);
            let items = ideas
                .iter()
                .map(|idea| BatchItem {
                    label: idea.clone(),
                    prompt: avatar_prompt(idea, &options.notes, options.remove_watermark),
                    images: vec![portrait.clone()],
                    aspect_ratio: api_aspect_ratio(&options.aspect_ratio),
                    remove_watermark: options.remove_watermark,
                    fallback_prompt: None,
                })
                .collect();
            (items, ideas.join(", "))
        };

        Ok(Planned::Ready(BatchPlan {
            tool: state.tool,
            items,
            concurrency: Concurrency::Pool(AVATAR_WORKERS),
            model_version: Self::billing_version(model),
            model_name: model.name.clone(),
            input_prompt,
        }))
    }

    /// One edit of the reference image. The stored prompt is merged with the
    /// user's notes and fitted to the reference; both text calls run only
    /// after the credit gate passes.
    fn interpolation_plan(&self, state: &ToolState, model: &ModelSpec) -> Result<Planned> {
        let options = &state.options;
        let Some(base) = options.extra_str("generated_prompt").map(str::to_string) else {
            return Err(GenerationError::Validation(
                "Vui lòng phân tích ảnh để tạo prompt trước.".to_string(),
            )
            .into());
        };
        let explicit_reference = options.extra_str("reference_image").map(str::to_string);
        let Some(reference) = explicit_reference
            .clone()
            .or_else(|| state.inputs.first().cloned())
        else {
            return Err(GenerationError::Validation("Vui lòng tải lên ảnh gốc.".to_string()).into());
        };
        let version = Self::billing_version(model);
        if let Some(refused) = self.credit_precheck(state.tool, version, 1)? {
            return Ok(refused);
        }

        let notes = options.notes.trim();
        let prompt = if explicit_reference.is_none() && notes.is_empty() {
            base
        } else {
            let text_model = self.resolve_text_model(model)?.model;
            let provider = self.text_provider(&text_model)?;
            let merged = if notes.is_empty() {
                base
            } else {
                interpolate_prompts(provider, &text_model.name, &base, notes)?
            };
            adapt_prompt_to_context(provider, &text_model.name, &reference, &merged, &self.events)
        };

        let item = BatchItem {
            label: "Kết quả".to_string(),
            prompt: edit_prompt(&prompt, options.remove_watermark),
            images: vec![reference],
            aspect_ratio: api_aspect_ratio(&options.aspect_ratio),
            remove_watermark: options.remove_watermark,
            fallback_prompt: None,
        };
        Ok(Planned::Ready(BatchPlan {
            tool: state.tool,
            items: vec![item],
            concurrency: Concurrency::FanOut,
            model_version: version,
            model_name: model.name.clone(),
            input_prompt: prompt,
        }))
    }

    /// Concept analysis for random avatar ideas. `None` means the user
    /// cancelled meanwhile.
    fn analyze_portrait(
        &self,
        session: &ToolSession,
        model: &ModelSpec,
        portrait: &str,
    ) -> Result<Option<Vec<String>>> {
        let text_model = self.resolve_text_model(model)?.model;
        let provider = self.text_provider(&text_model)?;
        let categories = category_names();
        self.while_analyzing(session, || {
            analyze_avatar_concepts(
                provider,
                &text_model.name,
                portrait,
                &categories,
                &self.events,
            )
        })
    }

    /// Runs `work` with the tool in `analyzing`, then returns it to
    /// `configuring`. `None` means the attempt was cancelled meanwhile.
    fn while_analyzing<T>(&self, session: &ToolSession, work: impl FnOnce() -> T) -> Result<Option<T>> {
        let epoch = session.update(|state| -> Result<u64, GenerationError> {
            if matches!(state.stage, Stage::Idle | Stage::Results) {
                state.transition(Stage::Configuring)?;
            }
            state.transition(Stage::Analyzing)?;
            Ok(state.epoch())
        })?;

        let out = work();

        let still_ours = session.update(|state| {
            if state.epoch() != epoch || state.stage != Stage::Analyzing {
                return false;
            }
            state.stage = Stage::Configuring;
            true
        });
        Ok(still_ours.then_some(out))
    }

    /// Reads settings embedded in a generated PNG.
    pub fn restore_settings(&self, image_bytes: &[u8]) -> Result<Option<ToolState>> {
        Ok(extract_settings(image_bytes)?.map(|snapshot| snapshot.restore()))
    }

    pub fn generate_video(&self, params: &VideoTaskParams) -> Result<String> {
        run_video_task(
            self.video_api.as_ref(),
            &self.video_board,
            params,
            self.poll_options,
            &self.events,
        )
    }

    /// Runs a packaged video app. Inline inputs are uploaded first.
    pub fn run_video_app(&self, app: &VideoAppConfig, inputs: &Map<String, Value>) -> Result<String> {
        let resolved = resolve_inputs(inputs, &self.gallery)?;
        self.generate_video(&params_from_app(app, &resolved))
    }

    pub fn video_tasks(&self) -> Vec<VideoTask> {
        match self.video_board.lock() {
            Ok(board) => board.tasks().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().tasks().cloned().collect(),
        }
    }

    pub fn lightbox(&self, state: &ToolState) -> Result<Lightbox> {
        let model = self.resolve_image_model()?.model.name;
        Ok(Lightbox::from_state(state, Some(&model)))
    }

    pub fn finish(&mut self) -> Result<SessionSummary> {
        let (total_batches, total_images, total_failures) = {
            let history = match self.history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            history.save()?;
            (
                history.batches.len() as u64,
                history.total_outputs(),
                history.total_failures(),
            )
        };
        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_batches,
            total_images,
            total_failures,
            credits_spent: self.credits.spent()?,
            credits_remaining: self.credits.available()?,
        };
        write_summary(&self.summary_path, &summary, None)?;
        self.events.emit(
            "session_finished",
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
                "total_images": total_images,
                "credits_remaining": summary.credits_remaining,
            })),
        )?;
        Ok(summary)
    }
}

fn poster_plan(state: &ToolState, model: &ModelSpec) -> Result<BatchPlan> {
    if state.inputs.is_empty() {
        return Err(GenerationError::Validation(
            "Vui lòng tải lên ít nhất 1 ảnh sản phẩm.".to_string(),
        )
        .into());
    }
    let count = state.options.checked_image_count()?;
    let opts = PosterOptions::from_state(state);
    let item = BatchItem {
        label: String::new(),
        prompt: build_poster_prompt(&opts),
        images: poster_images(state),
        aspect_ratio: opts.api_aspect_ratio(),
        remove_watermark: state.options.remove_watermark,
        fallback_prompt: None,
    };
    let input_prompt = if opts.product_description.is_empty() {
        opts.notes.clone()
    } else {
        opts.product_description.clone()
    };
    Ok(BatchPlan {
        tool: state.tool,
        items: numbered(item, count, &format!("Style: {} - Variation", opts.style)),
        concurrency: Concurrency::FanOut,
        model_version: DukyEngine::billing_version(model),
        model_name: model.name.clone(),
        input_prompt,
    })
}

fn swap_style_plan(state: &ToolState, model: &ModelSpec) -> Result<BatchPlan> {
    let Some(content) = state.inputs.first().cloned() else {
        return Err(GenerationError::Validation("Vui lòng tải lên ảnh gốc.".to_string()).into());
    };
    let options = &state.options;
    let style_image = options.extra_str("style_image").map(str::to_string);
    let styles = swap_style_items(
        &string_list(options.extra.get("selected_styles")),
        style_image.is_some(),
        options.extra_bool("convert_to_real"),
    );
    if styles.is_empty() {
        return Err(
            GenerationError::Validation("Vui lòng chọn ít nhất 1 phong cách.".to_string()).into(),
        );
    }
    if styles.len() > MAX_STYLE_PICKS {
        return Err(GenerationError::Validation(format!(
            "Chỉ được chọn tối đa {MAX_STYLE_PICKS} phong cách."
        ))
        .into());
    }
    let items = styles
        .iter()
        .map(|style| {
            let mut images = vec![content.clone()];
            if style == CUSTOM_REFERENCE {
                images.extend(style_image.clone());
            }
            BatchItem {
                label: style.clone(),
                prompt: swap_style_prompt(style, &options.notes, options.remove_watermark),
                images,
                aspect_ratio: api_aspect_ratio(&options.aspect_ratio),
                remove_watermark: options.remove_watermark,
                fallback_prompt: None,
            }
        })
        .collect();
    Ok(BatchPlan {
        tool: state.tool,
        items,
        concurrency: Concurrency::FanOut,
        model_version: DukyEngine::billing_version(model),
        model_name: model.name.clone(),
        input_prompt: styles.join(", "),
    })
}

/// Try-on: `inputs[0]` is the model photo, the rest are outfits.
fn template_plan(state: &ToolState, model: &ModelSpec) -> Result<BatchPlan> {
    let Some((model_photo, outfits)) = state.inputs.split_first() else {
        return Err(
            GenerationError::Validation("Vui lòng tải lên ảnh mẫu (model).".to_string()).into(),
        );
    };
    if outfits.is_empty() {
        return Err(GenerationError::Validation(
            "Vui lòng tải lên ít nhất 1 ảnh trang phục.".to_string(),
        )
        .into());
    }
    if outfits.len() > MAX_OUTFITS {
        return Err(GenerationError::Validation(format!(
            "Chỉ được tải lên tối đa {MAX_OUTFITS} ảnh trang phục."
        ))
        .into());
    }
    let count = state.options.checked_image_count()?;
    let options = &state.options;
    let item = BatchItem {
        label: String::new(),
        prompt: outfit_composition_prompt(
            outfits.len(),
            &options.notes,
            &options.aspect_ratio,
            options.remove_watermark,
        ),
        images: composition_images(model_photo, outfits),
        aspect_ratio: api_aspect_ratio(&options.aspect_ratio),
        remove_watermark: options.remove_watermark,
        fallback_prompt: None,
    };
    Ok(BatchPlan {
        tool: state.tool,
        items: numbered(item, count, "Ảnh"),
        concurrency: Concurrency::FanOut,
        model_version: DukyEngine::tool_billing(state.tool, model),
        model_name: model.name.clone(),
        input_prompt: options.notes.trim().to_string(),
    })
}

/// `inputs[0]` is the person (the woman for a couple), `inputs[1]` the man.
fn khmer_plan(state: &ToolState, model: &ModelSpec) -> Result<BatchPlan> {
    if state.inputs.is_empty() {
        return Err(
            GenerationError::Validation("Vui lòng tải lên ảnh chân dung.".to_string()).into(),
        );
    }
    let options = &state.options;
    let couple = state.inputs.len() > 1;
    let template = khmer_template_prompt(options.extra_str("khmer_template"));
    let aspect = &options.aspect_ratio;
    let item = BatchItem {
        label: "Khmer".to_string(),
        prompt: khmer_prompt(&template, &options.notes, aspect, options.remove_watermark, couple),
        images: state.inputs.iter().take(2).cloned().collect(),
        aspect_ratio: api_aspect_ratio(aspect),
        remove_watermark: options.remove_watermark,
        fallback_prompt: Some(khmer_fallback_prompt(
            &template,
            &options.notes,
            aspect,
            options.remove_watermark,
            couple,
        )),
    };
    Ok(BatchPlan {
        tool: state.tool,
        items: vec![item],
        concurrency: Concurrency::FanOut,
        model_version: DukyEngine::billing_version(model),
        model_name: model.name.clone(),
        input_prompt: template,
    })
}

/// One face-swap image per selected studio template.
fn studio_plan(state: &ToolState, model: &ModelSpec) -> Result<BatchPlan> {
    if state.inputs.is_empty() {
        return Err(
            GenerationError::Validation("Vui lòng tải lên ảnh chân dung.".to_string()).into(),
        );
    }
    let options = &state.options;
    let scenes = studio_templates(state);
    if scenes.is_empty() {
        return Err(GenerationError::Validation("Vui lòng chọn ít nhất 1 mẫu.".to_string()).into());
    }
    if scenes.len() > MAX_STYLE_PICKS {
        return Err(GenerationError::Validation(format!(
            "Chỉ được chọn tối đa {MAX_STYLE_PICKS} mẫu."
        ))
        .into());
    }
    let style = options.extra_str("studio_name").unwrap_or(DEFAULT_STUDIO_NAME);
    let couple = state.inputs.len() > 1;
    let aspect = &options.aspect_ratio;
    let items = scenes
        .iter()
        .enumerate()
        .map(|(idx, scene)| BatchItem {
            label: format!("Mẫu {}", idx + 1),
            prompt: studio_prompt(style, scene, &options.notes, aspect, options.remove_watermark, couple),
            images: state.inputs.iter().take(2).cloned().collect(),
            aspect_ratio: api_aspect_ratio(aspect),
            remove_watermark: options.remove_watermark,
            fallback_prompt: Some(studio_fallback_prompt(
                style,
                scene,
                &options.notes,
                aspect,
                options.remove_watermark,
                couple,
            )),
        })
        .collect();
    Ok(BatchPlan {
        tool: state.tool,
        items,
        concurrency: Concurrency::FanOut,
        model_version: DukyEngine::billing_version(model),
        model_name: model.name.clone(),
        input_prompt: style.to_string(),
    })
}

fn studio_templates(state: &ToolState) -> Vec<String> {
    string_list(state.options.extra.get("selected_templates"))
        .into_iter()
        .map(|scene| scene.trim().to_string())
        .filter(|scene| !scene.is_empty())
        .collect()
}

/// Slot count the current settings would produce, before any random idea
/// is drawn.
pub fn planned_count(state: &ToolState) -> usize {
    let options = &state.options;
    match state.tool {
        ToolKey::AvatarCreator if options.extra_str("style_image").is_some() => 1,
        ToolKey::AvatarCreator => planned_idea_count(&selected_ideas(state)),
        ToolKey::SwapStyle => swap_style_items(
            &string_list(options.extra.get("selected_styles")),
            options.extra_str("style_image").is_some(),
            options.extra_bool("convert_to_real"),
        )
        .len(),
        ToolKey::StudioGenerator => studio_templates(state).len(),
        ToolKey::ImageInterpolation | ToolKey::KhmerPhotoMerge => 1,
        ToolKey::PosterCreator | ToolKey::FreeGeneration | ToolKey::TemplateComposer => {
            options.image_count as usize
        }
    }
}

fn numbered(item: BatchItem, count: usize, prefix: &str) -> Vec<BatchItem> {
    (1..=count)
        .map(|idx| BatchItem {
            label: format!("{prefix} {idx}"),
            ..item.clone()
        })
        .collect()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
