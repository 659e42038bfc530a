//! Batch generation: credit gate, fan-out or pooled workers, and slot
//! updates keyed by the attempt epoch. Single-slot regeneration shares the
//! same gate and per-image pipeline.

use std::sync::Mutex;

use anyhow::Result;
use duky_contracts::errors::{classify, FailureKind, GenerationError, UpstreamCode};
use duky_contracts::events::EventWriter;
use duky_contracts::models::ModelVersion;
use duky_contracts::runs::generation_log::{GenerationLogEntry, GenerationLogWriter};
use duky_contracts::runs::history::HistoryManifest;
use duky_contracts::tools::{BatchTally, SettingsSnapshot, ToolKey};
use serde_json::{json, Value};

use crate::credits::{CreditBalance, CreditTable};
use crate::gallery::{GalleryImage, GallerySink};
use crate::metadata::embed_settings;
use crate::pool::{drain_queue, Concurrency};
use crate::prompt::avatar::MAX_IDEAS;
use crate::providers::{request_summary, ImageProvider, ImageRequest};
use crate::session::ToolSession;
use crate::util::{map_object, truncate_text};

/// Everything a batch needs from the outside world.
pub struct Capabilities<'a> {
    pub images: &'a dyn ImageProvider,
    pub credits: &'a dyn CreditBalance,
    pub credit_table: &'a CreditTable,
    pub gallery: &'a dyn GallerySink,
    pub generation_log: Option<&'a GenerationLogWriter>,
    pub history: Option<&'a Mutex<HistoryManifest>>,
    pub events: &'a EventWriter,
    pub embed_metadata: bool,
    pub persist_gallery: bool,
}

/// Largest batch any tool plans.
pub const MAX_BATCH_ITEMS: usize = MAX_IDEAS;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub label: String,
    pub prompt: String,
    pub images: Vec<String>,
    pub aspect_ratio: Option<String>,
    pub remove_watermark: bool,
    /// Sent once more when the model answers the first prompt with text.
    pub fallback_prompt: Option<String>,
}

impl BatchItem {
    pub fn new(label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            prompt: prompt.into(),
            images: Vec::new(),
            aspect_ratio: None,
            remove_watermark: false,
            fallback_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub tool: ToolKey,
    pub items: Vec<BatchItem>,
    pub concurrency: Concurrency,
    pub model_version: ModelVersion,
    pub model_name: String,
    /// Prompt recorded in the generation log and history.
    pub input_prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// The credit gate refused the batch; nothing was sent and the tool
    /// state is unchanged.
    InsufficientCredits { required: u64, available: u64 },
    /// Every slot settled.
    Settled {
        epoch: u64,
        tally: BatchTally,
        /// Index-stable URLs, empty for failed slots.
        urls: Vec<String>,
    },
    /// The attempt was cancelled while in flight.
    Cancelled { epoch: u64, discarded: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegenerationOutcome {
    /// Refused before anything changed.
    InsufficientCredits { required: u64, available: u64 },
    Resolved { epoch: u64, url: String },
    /// The slot kept its previous image.
    Failed { epoch: u64, error: GenerationError },
    /// Superseded while in flight; the result was dropped.
    Cancelled { epoch: u64 },
}

enum SlotOutput {
    Done {
        url: String,
        credits_left: u64,
        log_error: Option<String>,
    },
    Failed(GenerationError),
    /// Not started because the attempt was already abandoned.
    Skipped,
}

pub fn dispatch_batch(
    session: &ToolSession,
    plan: &BatchPlan,
    caps: &Capabilities<'_>,
) -> Result<BatchOutcome> {
    if plan.items.is_empty() {
        return Err(GenerationError::Validation("nothing to generate".to_string()).into());
    }
    if plan.items.len() > MAX_BATCH_ITEMS {
        return Err(GenerationError::Validation(format!(
            "a batch holds at most {MAX_BATCH_ITEMS} images, got {}",
            plan.items.len()
        ))
        .into());
    }
    let count = plan.items.len();
    let per_image = caps.credit_table.per_image_cost(plan.model_version);
    if let Some((required, available)) = credit_gate(plan, count, caps)? {
        return Ok(BatchOutcome::InsufficientCredits {
            required,
            available,
        });
    }

    let snapshot = session.read(SettingsSnapshot::capture);
    let labels: Vec<String> = plan.items.iter().map(|item| item.label.clone()).collect();
    let epoch = session.update(|state| state.begin_generation(&labels))?;
    let workers = plan.concurrency.workers(count);
    caps.events.emit_best_effort(
        "batch_started",
        map_object(json!({
            "tool": plan.tool,
            "epoch": epoch,
            "count": count,
            "workers": workers,
            "model": plan.model_name,
            "model_version": plan.model_version,
        })),
    );

    let batch_id = caps.history.map(|history| {
        let settings = serde_json::to_value(&snapshot.state.options)
            .map(map_object)
            .unwrap_or_default();
        lock(history)
            .add_batch(plan.tool, settings, plan.input_prompt.clone())
            .batch_id
    });
    let pre_gen_state = serde_json::to_value(&snapshot.state).unwrap_or(Value::Null);

    let work = |idx: usize, item: &BatchItem| -> SlotOutput {
        if session.read(|state| state.epoch()) != epoch {
            return SlotOutput::Skipped;
        }
        match produce_slot(idx, item, plan, caps, &snapshot, &pre_gen_state, per_image) {
            Ok(output) => output,
            Err(err) => SlotOutput::Failed(classify(&err)),
        }
    };

    let mut discarded = 0usize;
    drain_queue(
        plan.items.iter().collect(),
        workers,
        |idx, item| work(idx, item),
        |idx, output| match output {
            SlotOutput::Done {
                url,
                credits_left,
                log_error,
            } => {
                if session.update(|state| state.resolve_slot(epoch, idx, url.clone())) {
                    caps.events.emit_best_effort(
                        "slot_resolved",
                        map_object(json!({
                            "tool": plan.tool,
                            "epoch": epoch,
                            "index": idx,
                            "url": display_url(&url),
                            "credits_left": credits_left,
                            "log_error": log_error,
                        })),
                    );
                    if let (Some(history), Some(batch_id)) = (caps.history, batch_id.as_deref()) {
                        let mut output = output_summary(plan, &plan.items[idx]);
                        output.insert("url".to_string(), json!(display_url(&url)));
                        lock(history).add_output(batch_id, output);
                    }
                } else {
                    discarded += 1;
                    emit_discarded(caps.events, plan.tool, epoch, idx, "stale");
                }
            }
            SlotOutput::Failed(err) => {
                if session.update(|state| state.fail_slot(epoch, idx, &err)) {
                    caps.events.emit_best_effort(
                        "slot_failed",
                        map_object(json!({
                            "tool": plan.tool,
                            "epoch": epoch,
                            "index": idx,
                            "failure": err.kind(),
                            "message": err.user_message(),
                            "error": truncate_text(&err.to_string(), 512),
                        })),
                    );
                    if let (Some(history), Some(batch_id)) = (caps.history, batch_id.as_deref()) {
                        lock(history).add_failure(
                            batch_id,
                            map_object(json!({
                                "label": plan.items[idx].label,
                                "failure": err.kind(),
                                "message": err.user_message(),
                            })),
                        );
                    }
                } else {
                    discarded += 1;
                    emit_discarded(caps.events, plan.tool, epoch, idx, "stale");
                }
            }
            SlotOutput::Skipped => {
                discarded += 1;
                emit_discarded(caps.events, plan.tool, epoch, idx, "cancelled");
            }
        },
    )?;

    if let Some(history) = caps.history {
        lock(history).save()?;
    }

    let settled = session.update(|state| {
        state
            .complete_generation(epoch)
            .map(|tally| (tally, state.generated_images(), state.error.clone()))
    });
    let outcome = match settled {
        Some((tally, urls, error)) => {
            caps.events.emit_best_effort(
                "batch_finished",
                map_object(json!({
                    "tool": plan.tool,
                    "epoch": epoch,
                    "requested": tally.requested,
                    "succeeded": tally.succeeded,
                    "failed": tally.failed,
                    "stage": tally.stage.as_str(),
                    "error": error,
                })),
            );
            BatchOutcome::Settled { epoch, tally, urls }
        }
        None => {
            caps.events.emit_best_effort(
                "batch_finished",
                map_object(json!({
                    "tool": plan.tool,
                    "epoch": epoch,
                    "cancelled": true,
                    "discarded": discarded,
                })),
            );
            BatchOutcome::Cancelled { epoch, discarded }
        }
    };
    Ok(outcome)
}

/// Replaces the image in one settled slot. `plan` carries exactly one item
/// describing the new request; the other slots are left alone.
pub fn regenerate_slot(
    session: &ToolSession,
    index: usize,
    plan: &BatchPlan,
    caps: &Capabilities<'_>,
) -> Result<RegenerationOutcome> {
    let [item] = plan.items.as_slice() else {
        return Err(GenerationError::Validation(format!(
            "regeneration sends one image, got {}",
            plan.items.len()
        ))
        .into());
    };
    let per_image = caps.credit_table.per_image_cost(plan.model_version);
    if let Some((required, available)) = credit_gate(plan, 1, caps)? {
        return Ok(RegenerationOutcome::InsufficientCredits {
            required,
            available,
        });
    }

    let snapshot = session.read(SettingsSnapshot::capture);
    let (epoch, source) = session.update(|state| state.begin_regeneration(index))?;
    caps.events.emit_best_effort(
        "regeneration_started",
        map_object(json!({
            "tool": plan.tool,
            "epoch": epoch,
            "index": index,
            "source": display_url(&source),
            "model": plan.model_name,
        })),
    );
    let pre_gen_state = serde_json::to_value(&snapshot.state).unwrap_or(Value::Null);

    let output = produce_slot(index, item, plan, caps, &snapshot, &pre_gen_state, per_image)
        .unwrap_or_else(|err| SlotOutput::Failed(classify(&err)));
    let outcome = match output {
        SlotOutput::Done {
            url,
            credits_left,
            log_error,
        } => {
            let settled = session
                .update(|state| state.settle_regeneration(epoch, index, &source, Ok(url.as_str())));
            if settled {
                caps.events.emit_best_effort(
                    "slot_regenerated",
                    map_object(json!({
                        "tool": plan.tool,
                        "epoch": epoch,
                        "index": index,
                        "url": display_url(&url),
                        "credits_left": credits_left,
                        "log_error": log_error,
                    })),
                );
                if let Some(history) = caps.history {
                    let settings = serde_json::to_value(&snapshot.state.options)
                        .map(map_object)
                        .unwrap_or_default();
                    let mut guard = lock(history);
                    let batch_id = guard
                        .add_batch(plan.tool, settings, plan.input_prompt.clone())
                        .batch_id;
                    let mut output = output_summary(plan, item);
                    output.insert("url".to_string(), json!(display_url(&url)));
                    output.insert("replaces".to_string(), json!(display_url(&source)));
                    guard.add_output(&batch_id, output);
                    guard.save()?;
                }
                RegenerationOutcome::Resolved { epoch, url }
            } else {
                emit_discarded(caps.events, plan.tool, epoch, index, "stale");
                RegenerationOutcome::Cancelled { epoch }
            }
        }
        SlotOutput::Failed(error) => {
            let settled = session
                .update(|state| state.settle_regeneration(epoch, index, &source, Err(&error)));
            if settled {
                caps.events.emit_best_effort(
                    "slot_failed",
                    map_object(json!({
                        "tool": plan.tool,
                        "epoch": epoch,
                        "index": index,
                        "regeneration": true,
                        "failure": error.kind(),
                        "message": error.user_message(),
                        "error": truncate_text(&error.to_string(), 512),
                    })),
                );
                RegenerationOutcome::Failed { epoch, error }
            } else {
                emit_discarded(caps.events, plan.tool, epoch, index, "stale");
                RegenerationOutcome::Cancelled { epoch }
            }
        }
        SlotOutput::Skipped => RegenerationOutcome::Cancelled { epoch },
    };
    Ok(outcome)
}

/// Emits `credit_check` and returns `(required, available)` when the
/// balance cannot cover `count` images.
fn credit_gate(
    plan: &BatchPlan,
    count: usize,
    caps: &Capabilities<'_>,
) -> Result<Option<(u64, u64)>> {
    let required = caps.credit_table.batch_cost(plan.model_version, count);
    let available = caps.credits.available()?;
    let allowed = caps.credits.check(required)?;
    caps.events.emit_best_effort(
        "credit_check",
        map_object(json!({
            "tool": plan.tool,
            "required": required,
            "available": available,
            "ok": allowed,
        })),
    );
    Ok((!allowed).then_some((required, available)))
}

fn image_request(plan: &BatchPlan, item: &BatchItem, prompt: &str) -> ImageRequest {
    ImageRequest {
        tool: plan.tool,
        model: plan.model_name.clone(),
        prompt: prompt.to_string(),
        images: item.images.clone(),
        aspect_ratio: item.aspect_ratio.clone(),
        remove_watermark: item.remove_watermark,
    }
}

fn output_summary(plan: &BatchPlan, item: &BatchItem) -> serde_json::Map<String, Value> {
    let mut output = request_summary(&image_request(plan, item, ""));
    output.insert("label".to_string(), json!(item.label));
    output
}

fn is_text_answer(err: &anyhow::Error) -> bool {
    classify(err).kind() == FailureKind::Upstream(UpstreamCode::ModelRefusal)
}

/// Generate, embed settings, charge, store and log one image.
fn produce_slot(
    idx: usize,
    item: &BatchItem,
    plan: &BatchPlan,
    caps: &Capabilities<'_>,
    snapshot: &SettingsSnapshot,
    pre_gen_state: &Value,
    per_image: u64,
) -> Result<SlotOutput> {
    let generated = match caps.images.generate(&image_request(plan, item, &item.prompt)) {
        Ok(generated) => generated,
        Err(err) => match item.fallback_prompt.as_deref() {
            Some(fallback) if is_text_answer(&err) => {
                caps.events.emit_best_effort(
                    "fallback_prompt_used",
                    map_object(json!({
                        "tool": plan.tool,
                        "index": idx,
                        "error": truncate_text(&err.to_string(), 512),
                    })),
                );
                caps.images.generate(&image_request(plan, item, fallback))?
            }
            _ => return Err(err),
        },
    };
    let bytes = match embed_settings(&generated.bytes, snapshot, caps.embed_metadata) {
        Ok(bytes) => bytes,
        Err(err) => {
            caps.events.emit_best_effort(
                "metadata_embed_failed",
                map_object(json!({
                    "tool": plan.tool,
                    "index": idx,
                    "error": format!("{err:#}"),
                })),
            );
            generated.bytes.clone()
        }
    };

    let credits_left = match caps.credits.charge(per_image) {
        Ok(left) => left,
        Err(err) => return Ok(SlotOutput::Failed(err)),
    };

    let stored = caps.gallery.add_images(
        &[GalleryImage {
            tool: plan.tool,
            label: item.label.clone(),
            bytes,
            mime_type: generated.mime_type.clone(),
        }],
        caps.persist_gallery,
    )?;
    let url = stored
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::Internal(format!("gallery returned no URL for slot {idx}")))?;

    let log_error = caps.generation_log.and_then(|log| {
        log.record(&GenerationLogEntry {
            app_id: plan.tool,
            pre_gen_state: pre_gen_state.clone(),
            thumbnail_url: display_url(&url),
            credits_used: per_image,
            api_model_used: plan.model_name.clone(),
            generation_count: 1,
            input_prompt: plan.input_prompt.clone(),
        })
        .err()
        .map(|err| err.to_string())
    });

    Ok(SlotOutput::Done {
        url,
        credits_left,
        log_error,
    })
}

fn emit_discarded(events: &EventWriter, tool: ToolKey, epoch: u64, idx: usize, reason: &str) {
    events.emit_best_effort(
        "result_discarded",
        map_object(json!({
            "tool": tool,
            "epoch": epoch,
            "index": idx,
            "reason": reason,
        })),
    );
}

/// Inline payloads are shortened for logs.
fn display_url(url: &str) -> String {
    if url.starts_with("data:") {
        format!("data-url ({} chars)", url.len())
    } else {
        url.to_string()
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
    use std::sync::Mutex;

    use anyhow::bail;
    use duky_contracts::errors::{FailureKind, GenerationError, UpstreamCode};
    use duky_contracts::events::{read_event_types, EventWriter};
    use duky_contracts::models::ModelVersion;
    use duky_contracts::runs::generation_log::GenerationLogWriter;
    use duky_contracts::runs::history::HistoryManifest;
    use duky_contracts::tools::{SlotStatus, Stage, ToolKey, ToolState};

    use super::*;
    use crate::credits::{CreditTable, LocalCreditAccount};
    use crate::gallery::LocalGallery;
    use crate::metadata::extract_settings;
    use crate::providers::{DryrunProvider, GeneratedImage};

    /// Prompts containing `fail` are refused; everything else is drawn by
    /// the dryrun provider.
    struct Scripted;

    impl ImageProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
            if request.prompt.contains("fail") {
                bail!(GenerationError::Upstream {
                    code: UpstreamCode::SafetyViolation,
                    message: "blocked".to_string(),
                    details: None,
                });
            }
            DryrunProvider.generate(request)
        }
    }

    /// Answers with text unless the prompt asks for the plain version.
    struct TextFirst;

    impl ImageProvider for TextFirst {
        fn name(&self) -> &str {
            "text-first"
        }

        fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
            if !request.prompt.starts_with("plain") {
                bail!(GenerationError::Upstream {
                    code: UpstreamCode::ModelRefusal,
                    message: "I can describe it instead".to_string(),
                    details: None,
                });
            }
            DryrunProvider.generate(request)
        }
    }

    /// Returns a PNG signature followed by a broken chunk.
    struct BrokenPng;

    impl ImageProvider for BrokenPng {
        fn name(&self) -> &str {
            "broken-png"
        }

        fn generate(&self, _request: &ImageRequest) -> Result<GeneratedImage> {
            let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
            bytes.extend_from_slice(&[0, 0, 0]);
            Ok(GeneratedImage {
                bytes,
                mime_type: "image/png".to_string(),
                source_url: None,
            })
        }
    }

    /// Cancels the session from inside the first request.
    struct CancelsMidway(ToolSession);

    impl ImageProvider for CancelsMidway {
        fn name(&self) -> &str {
            "cancels"
        }

        fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
            self.0.cancel();
            DryrunProvider.generate(request)
        }
    }

    /// Approves the gate but refuses every charge.
    struct EmptyWallet;

    impl CreditBalance for EmptyWallet {
        fn available(&self) -> Result<u64> {
            Ok(100)
        }

        fn charge(&self, _cost: u64) -> Result<u64, GenerationError> {
            Err(GenerationError::insufficient_credits("Insufficient credits"))
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        events: EventWriter,
        gallery: LocalGallery,
        account: LocalCreditAccount,
        log: GenerationLogWriter,
        history: Mutex<HistoryManifest>,
        table: CreditTable,
    }

    impl Fixture {
        fn new(balance: u64) -> anyhow::Result<Self> {
            let temp = tempfile::tempdir()?;
            Ok(Self {
                events: EventWriter::new(temp.path().join("events.jsonl"), "s-test"),
                gallery: LocalGallery::open(temp.path())?,
                account: LocalCreditAccount::open(temp.path().join("credits.json"), "guest", balance)?,
                log: GenerationLogWriter::new(temp.path().join("generations.jsonl"), "s-test"),
                history: Mutex::new(HistoryManifest::new(temp.path().join("history.json"))),
                table: CreditTable::embedded(),
                _temp: temp,
            })
        }

        fn caps<'a>(&'a self, images: &'a dyn ImageProvider) -> Capabilities<'a> {
            self.caps_with(images, &self.account)
        }

        fn caps_with<'a>(
            &'a self,
            images: &'a dyn ImageProvider,
            credits: &'a dyn CreditBalance,
        ) -> Capabilities<'a> {
            Capabilities {
                images,
                credits,
                credit_table: &self.table,
                gallery: &self.gallery,
                generation_log: Some(&self.log),
                history: Some(&self.history),
                events: &self.events,
                embed_metadata: true,
                persist_gallery: true,
            }
        }
    }

    fn plan(prompts: &[&str], concurrency: Concurrency) -> BatchPlan {
        BatchPlan {
            tool: ToolKey::FreeGeneration,
            items: prompts
                .iter()
                .enumerate()
                .map(|(idx, prompt)| BatchItem {
                    label: format!("Ảnh {}", idx + 1),
                    prompt: prompt.to_string(),
                    images: Vec::new(),
                    aspect_ratio: Some("1:1".to_string()),
                    remove_watermark: false,
                    fallback_prompt: None,
                })
                .collect(),
            concurrency,
            model_version: ModelVersion::V2,
            model_name: "dryrun-image-1".to_string(),
            input_prompt: "con mèo".to_string(),
        }
    }

    fn configured_session() -> ToolSession {
        let mut state = ToolState::new(ToolKey::FreeGeneration);
        state.stage = Stage::Configuring;
        state.options.notes = "con mèo".to_string();
        ToolSession::new(state)
    }

    #[test]
    fn all_successes_fill_every_slot_and_charge_each() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let session = configured_session();
        let outcome = dispatch_batch(
            &session,
            &plan(&["a", "b", "c"], Concurrency::FanOut),
            &fixture.caps(&Scripted),
        )?;
        let BatchOutcome::Settled { tally, urls, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!((tally.succeeded, tally.failed), (3, 0));
        assert_eq!(urls.len(), 3);
        assert!(urls.iter().all(|url| !url.is_empty()));
        assert_eq!(fixture.account.available()?, 7);
        assert_eq!(fixture.log.read_all()?.len(), 3);

        let restored = extract_settings(&std::fs::read(&urls[0])?)?;
        assert_eq!(restored.map(|snapshot| snapshot.state.options.notes), Some("con mèo".to_string()));

        let state = session.snapshot();
        assert_eq!(state.stage, Stage::Results);
        assert_eq!(state.historical_images.len(), 3);
        Ok(())
    }

    #[test]
    fn credit_gate_refusal_leaves_state_untouched() -> anyhow::Result<()> {
        let fixture = Fixture::new(1)?;
        let session = configured_session();
        let before = session.snapshot();
        let outcome = dispatch_batch(
            &session,
            &plan(&["a", "b"], Concurrency::FanOut),
            &fixture.caps(&Scripted),
        )?;
        assert_eq!(
            outcome,
            BatchOutcome::InsufficientCredits {
                required: 2,
                available: 1
            }
        );
        assert_eq!(session.snapshot(), before);
        assert_eq!(read_event_types(fixture.events.path())?, vec!["credit_check".to_string()]);
        Ok(())
    }

    #[test]
    fn partial_success_keeps_slot_positions() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let session = configured_session();
        let outcome = dispatch_batch(
            &session,
            &plan(&["a", "fail", "c"], Concurrency::Pool(2)),
            &fixture.caps(&Scripted),
        )?;
        let BatchOutcome::Settled { tally, urls, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!((tally.requested, tally.succeeded, tally.failed), (3, 2, 1));
        assert!(urls[1].is_empty() && !urls[0].is_empty() && !urls[2].is_empty());

        let state = session.snapshot();
        assert_eq!(state.stage, Stage::Results);
        assert_eq!(state.error, None);
        assert!(matches!(
            &state.slots[1].status,
            SlotStatus::Failed { failure: FailureKind::Upstream(UpstreamCode::SafetyViolation), .. }
        ));
        Ok(())
    }

    #[test]
    fn total_failure_shows_an_error_banner() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let session = configured_session();
        dispatch_batch(
            &session,
            &plan(&["fail", "fail"], Concurrency::FanOut),
            &fixture.caps(&Scripted),
        )?;
        let state = session.snapshot();
        assert_eq!(state.stage, Stage::Results);
        assert_eq!(state.error.as_deref(), Some("blocked"));
        assert_eq!(state.generated_images(), vec![String::new(), String::new()]);
        Ok(())
    }

    #[test]
    fn credit_only_failures_return_to_configuring() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let session = configured_session();
        dispatch_batch(
            &session,
            &plan(&["a", "b"], Concurrency::FanOut),
            &fixture.caps_with(&Scripted, &EmptyWallet),
        )?;
        let state = session.snapshot();
        assert_eq!(state.stage, Stage::Configuring);
        assert_eq!(state.error, None);
        Ok(())
    }

    #[test]
    fn cancelled_batch_discards_late_results() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let session = configured_session();
        let provider = CancelsMidway(session.clone());
        let outcome = dispatch_batch(
            &session,
            &plan(&["a", "b"], Concurrency::Pool(1)),
            &fixture.caps(&provider),
        )?;
        assert!(matches!(outcome, BatchOutcome::Cancelled { discarded: 2, .. }));

        let state = session.snapshot();
        assert_eq!(state.stage, Stage::Configuring);
        assert!(state.slots.is_empty());
        assert!(state.historical_images.is_empty());
        let types = read_event_types(fixture.events.path())?;
        assert_eq!(types.iter().filter(|kind| *kind == "result_discarded").count(), 2);
        Ok(())
    }

    #[test]
    fn empty_plan_is_rejected() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let err = match dispatch_batch(
            &configured_session(),
            &plan(&[], Concurrency::FanOut),
            &fixture.caps(&Scripted),
        ) {
            Err(err) => err,
            Ok(outcome) => panic!("unexpected {outcome:?}"),
        };
        assert_eq!(classify(&err).kind(), FailureKind::Validation);
        Ok(())
    }

    #[test]
    fn oversized_plan_is_rejected_before_any_work() -> anyhow::Result<()> {
        let fixture = Fixture::new(1000)?;
        let session = configured_session();
        let prompts = vec!["a"; MAX_BATCH_ITEMS + 1];
        let batch = plan(&prompts, Concurrency::FanOut);
        let err = match dispatch_batch(&session, &batch, &fixture.caps(&Scripted)) {
            Err(err) => err,
            Ok(outcome) => panic!("unexpected {outcome:?}"),
        };
        assert_eq!(classify(&err).kind(), FailureKind::Validation);
        assert_eq!(fixture.account.available()?, 1000);
        assert_eq!(session.snapshot().stage, Stage::Configuring);
        Ok(())
    }

    #[test]
    fn text_answer_is_retried_with_the_fallback_prompt() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let session = configured_session();
        let mut batch = plan(&["fancy", "fancy"], Concurrency::FanOut);
        batch.items[0].fallback_prompt = Some("plain fancy".to_string());

        let outcome = dispatch_batch(&session, &batch, &fixture.caps(&TextFirst))?;
        let BatchOutcome::Settled { tally, urls, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!((tally.succeeded, tally.failed), (1, 1));
        assert!(!urls[0].is_empty() && urls[1].is_empty());
        assert_eq!(fixture.account.available()?, 9);
        let types = read_event_types(fixture.events.path())?;
        assert_eq!(types.iter().filter(|kind| *kind == "fallback_prompt_used").count(), 1);
        Ok(())
    }

    #[test]
    fn unembeddable_image_is_kept_and_reported() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let session = configured_session();
        let outcome = dispatch_batch(
            &session,
            &plan(&["a"], Concurrency::FanOut),
            &fixture.caps(&BrokenPng),
        )?;
        let BatchOutcome::Settled { tally, urls, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!(tally.succeeded, 1);
        assert_eq!(std::fs::read(&urls[0])?.len(), 11);

        let events = duky_contracts::events::read_events(fixture.events.path())?;
        let failed = events
            .iter()
            .find(|row| row["type"] == "metadata_embed_failed")
            .ok_or_else(|| anyhow::anyhow!("no metadata_embed_failed event"))?;
        assert_eq!(failed["index"], 0);
        assert!(failed["error"].as_str().is_some_and(|text| !text.is_empty()));
        Ok(())
    }

    fn settled_session(fixture: &Fixture) -> anyhow::Result<(ToolSession, Vec<String>)> {
        let session = configured_session();
        let outcome = dispatch_batch(
            &session,
            &plan(&["a", "b", "c"], Concurrency::FanOut),
            &fixture.caps(&Scripted),
        )?;
        let BatchOutcome::Settled { urls, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        Ok((session, urls))
    }

    #[test]
    fn regeneration_replaces_one_slot_and_charges_one_image() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let (session, before) = settled_session(&fixture)?;
        let mut single = plan(&["b, warmer light"], Concurrency::FanOut);
        single.items[0].images = vec![before[1].clone()];

        let outcome = regenerate_slot(&session, 1, &single, &fixture.caps(&Scripted))?;
        let RegenerationOutcome::Resolved { url, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        let after = session.snapshot();
        assert_eq!(after.stage, Stage::Results);
        assert_eq!(
            after.generated_images(),
            vec![before[0].clone(), url.clone(), before[2].clone()]
        );
        assert_ne!(url, before[1]);
        assert_eq!(fixture.account.available()?, 6);
        assert_eq!(fixture.log.read_all()?.len(), 4);
        let types = read_event_types(fixture.events.path())?;
        assert!(types.contains(&"slot_regenerated".to_string()));
        Ok(())
    }

    #[test]
    fn failed_regeneration_keeps_the_old_image() -> anyhow::Result<()> {
        let fixture = Fixture::new(10)?;
        let (session, before) = settled_session(&fixture)?;

        let single = plan(&["fail"], Concurrency::FanOut);
        let outcome = regenerate_slot(&session, 0, &single, &fixture.caps(&Scripted))?;
        assert!(matches!(outcome, RegenerationOutcome::Failed { .. }));
        let after = session.snapshot();
        assert_eq!(after.stage, Stage::Results);
        assert_eq!(after.generated_images(), before);
        assert_eq!(after.error.as_deref(), Some("blocked"));
        assert_eq!(fixture.account.available()?, 7);
        Ok(())
    }

    #[test]
    fn regeneration_without_credits_changes_nothing() -> anyhow::Result<()> {
        let fixture = Fixture::new(3)?;
        let (session, _) = settled_session(&fixture)?;
        let before = session.snapshot();

        let single = plan(&["c2"], Concurrency::FanOut);
        let outcome = regenerate_slot(&session, 2, &single, &fixture.caps(&Scripted))?;
        assert_eq!(
            outcome,
            RegenerationOutcome::InsufficientCredits {
                required: 1,
                available: 0
            }
        );
        assert_eq!(session.snapshot(), before);
        Ok(())
    }
}
