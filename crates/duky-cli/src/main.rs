use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Args, Parser, Subcommand};
use duky_contracts::models::ModelVersion;
use duky_contracts::tools::{SlotStatus, Stage, ToolKey, ToolOptions, ToolState};
use duky_engine::credits::CreditBalance;
use duky_engine::dispatch::{BatchOutcome, RegenerationOutcome};
use duky_engine::prompt::avatar::RANDOM_CONCEPT;
use duky_engine::session::ToolSession;
use duky_engine::video::{VideoMode, VideoTaskParams};
use duky_engine::{DukyEngine, EngineConfig};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "duky-rs", version, about = "Duky AI generation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Poster(PosterArgs),
    Avatar(AvatarArgs),
    Free(FreeArgs),
    SwapStyle(SwapStyleArgs),
    Template(TemplateArgs),
    Interpolate(InterpolateArgs),
    Khmer(KhmerArgs),
    Studio(StudioArgs),
    Restore(RestoreArgs),
    Video(VideoArgs),
    Credits(CreditsArgs),
    Gallery(GalleryArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Session directory for gallery, logs and the credit ledger.
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    model_version: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    no_metadata: bool,
}

#[derive(Debug, Args)]
struct CommonToolArgs {
    #[arg(long, default_value = "1:1")]
    aspect_ratio: String,
    #[arg(long, default_value = "")]
    notes: String,
    #[arg(long)]
    remove_watermark: bool,
    /// 1-based slot to edit once the batch settles.
    #[arg(long, requires = "refine")]
    refine_slot: Option<usize>,
    /// Edit instruction for `--refine-slot`.
    #[arg(long)]
    refine: Option<String>,
}

#[derive(Debug, Args)]
struct PosterArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    /// Product images, up to four.
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    background: Option<String>,
    #[arg(long)]
    lighting: Option<String>,
    #[arg(long)]
    angle: Option<String>,
    #[arg(long)]
    poster_type: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    environment: Option<String>,
    #[arg(long)]
    headline: Option<String>,
    #[arg(long)]
    subheadline: Option<String>,
    #[arg(long)]
    cta: Option<String>,
    #[arg(long)]
    color_scheme: Option<String>,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    text_effect: Option<PathBuf>,
    #[arg(long)]
    secondary_object: Option<PathBuf>,
    #[arg(long)]
    advanced_styling: bool,
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=4))]
    count: u32,
}

#[derive(Debug, Args)]
struct AvatarArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    #[arg(long)]
    portrait: PathBuf,
    #[arg(long = "idea")]
    ideas: Vec<String>,
    /// Number of random ideas to add.
    #[arg(long, default_value_t = 0)]
    random: usize,
    #[arg(long)]
    style_image: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FreeArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    #[arg(long)]
    prompt: String,
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=4))]
    count: u32,
    #[arg(long)]
    enhance: bool,
}

#[derive(Debug, Args)]
struct SwapStyleArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    #[arg(long)]
    image: PathBuf,
    #[arg(long = "style")]
    styles: Vec<String>,
    #[arg(long)]
    style_image: Option<PathBuf>,
    #[arg(long)]
    to_real: bool,
}

#[derive(Debug, Args)]
struct TemplateArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    /// Photo of the person who wears the outfits.
    #[arg(long)]
    model_photo: PathBuf,
    #[arg(long = "outfit", required = true)]
    outfits: Vec<PathBuf>,
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=4))]
    count: u32,
}

#[derive(Debug, Args)]
struct InterpolateArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    /// Image the prompt is read from.
    #[arg(long)]
    source: PathBuf,
    /// Image to edit; defaults to the source.
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    expert: bool,
}

#[derive(Debug, Args)]
struct KhmerArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    /// One portrait, or the woman then the man for a couple.
    #[arg(long = "portrait", required = true, num_args = 1..=2)]
    portraits: Vec<PathBuf>,
    #[arg(long)]
    template: Option<String>,
}

#[derive(Debug, Args)]
struct StudioArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[command(flatten)]
    common: CommonToolArgs,
    #[arg(long = "portrait", required = true, num_args = 1..=2)]
    portraits: Vec<PathBuf>,
    #[arg(long)]
    studio: Option<String>,
    #[arg(long = "scene", required = true)]
    scenes: Vec<String>,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Args)]
struct VideoArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long, default_value = "")]
    prompt: String,
    /// Local file or URL of the image to animate.
    #[arg(long)]
    image: Option<String>,
    #[arg(long)]
    audio: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    fast: bool,
}

#[derive(Debug, Args)]
struct CreditsArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    deposit: Option<u64>,
}

#[derive(Debug, Args)]
struct GalleryArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("duky-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Poster(args) => run_poster(args),
        Command::Avatar(args) => run_avatar(args),
        Command::Free(args) => run_free(args),
        Command::SwapStyle(args) => run_swap_style(args),
        Command::Template(args) => run_template(args),
        Command::Interpolate(args) => run_interpolate(args),
        Command::Khmer(args) => run_khmer(args),
        Command::Studio(args) => run_studio(args),
        Command::Restore(args) => run_restore(args),
        Command::Video(args) => run_video(args),
        Command::Credits(args) => run_credits(args),
        Command::Gallery(args) => run_gallery(args),
    }
}

fn open_engine(args: &SessionArgs) -> Result<DukyEngine> {
    let mut config = EngineConfig::from_env(Some(&args.out))?;
    if let Some(raw) = args.model_version.as_deref() {
        config.model_version = raw.parse::<ModelVersion>().map_err(anyhow::Error::msg)?;
    }
    if args.image_model.is_some() {
        config.image_model = args.image_model.clone();
    }
    if args.text_model.is_some() {
        config.text_model = args.text_model.clone();
    }
    if args.no_metadata {
        config.enable_image_metadata = false;
    }
    DukyEngine::new(&args.out, config)
}

fn base_options(common: &CommonToolArgs) -> ToolOptions {
    ToolOptions {
        aspect_ratio: common.aspect_ratio.clone(),
        remove_watermark: common.remove_watermark,
        notes: common.notes.clone(),
        ..ToolOptions::default()
    }
}

fn new_state(tool: ToolKey, options: ToolOptions, inputs: &[PathBuf]) -> Result<ToolState> {
    let mut state = ToolState::new(tool);
    state.options = options;
    for path in inputs {
        state.add_input(path_text(path)?)?;
    }
    if state.stage == Stage::Idle {
        state.transition(Stage::Configuring)?;
    }
    Ok(state)
}

fn path_text(path: &Path) -> Result<String> {
    if !path.exists() {
        bail!("input image not found: {}", path.display());
    }
    Ok(path.to_string_lossy().into_owned())
}

fn set_optional(options: &mut ToolOptions, key: &str, value: &Option<String>) {
    if let Some(value) = value.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        options.set_extra(key, value);
    }
}

fn set_optional_path(options: &mut ToolOptions, key: &str, path: &Option<PathBuf>) -> Result<()> {
    if let Some(path) = path {
        options.set_extra(key, path_text(path)?);
    }
    Ok(())
}

fn run_poster(args: PosterArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    options.image_count = args.count;
    options.style = args.style.clone();
    set_optional(&mut options, "domain", &args.domain);
    set_optional(&mut options, "background_style", &args.background);
    set_optional(&mut options, "lighting_style", &args.lighting);
    set_optional(&mut options, "product_angle", &args.angle);
    set_optional(&mut options, "poster_type", &args.poster_type);
    set_optional(&mut options, "product_description", &args.description);
    set_optional(&mut options, "environment_description", &args.environment);
    set_optional(&mut options, "headline", &args.headline);
    set_optional(&mut options, "subheadline", &args.subheadline);
    set_optional(&mut options, "cta", &args.cta);
    set_optional(&mut options, "color_scheme", &args.color_scheme);
    set_optional_path(&mut options, "reference_image", &args.reference)?;
    set_optional_path(&mut options, "text_effect_image", &args.text_effect)?;
    set_optional_path(&mut options, "secondary_object_image", &args.secondary_object)?;
    let include_text = [&args.headline, &args.subheadline, &args.cta]
        .iter()
        .any(|value| value.is_some());
    options.set_extra("include_text", include_text);
    options.set_extra("advanced_styling", args.advanced_styling);

    let state = new_state(ToolKey::PosterCreator, options, &args.images)?;
    run_tool(&args.session, &args.common, state)
}

fn run_avatar(args: AvatarArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    let mut ideas = args.ideas.clone();
    ideas.extend(std::iter::repeat(RANDOM_CONCEPT.to_string()).take(args.random));
    options.set_extra("selected_ideas", json!(ideas));
    set_optional_path(&mut options, "style_image", &args.style_image)?;
    let state = new_state(ToolKey::AvatarCreator, options, &[args.portrait.clone()])?;
    run_tool(&args.session, &args.common, state)
}

fn run_free(args: FreeArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    options.notes = args.prompt.clone();
    options.image_count = args.count;
    options.set_extra("enhance_prompt", args.enhance);
    let state = new_state(ToolKey::FreeGeneration, options, &args.images)?;
    run_tool(&args.session, &args.common, state)
}

fn run_swap_style(args: SwapStyleArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    options.set_extra("selected_styles", json!(args.styles));
    options.set_extra("convert_to_real", args.to_real);
    set_optional_path(&mut options, "style_image", &args.style_image)?;
    let state = new_state(ToolKey::SwapStyle, options, &[args.image.clone()])?;
    run_tool(&args.session, &args.common, state)
}

fn run_template(args: TemplateArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    options.image_count = args.count;
    let mut inputs = vec![args.model_photo.clone()];
    inputs.extend(args.outfits.iter().cloned());
    let state = new_state(ToolKey::TemplateComposer, options, &inputs)?;
    run_tool(&args.session, &args.common, state)
}

fn run_interpolate(args: InterpolateArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    set_optional_path(&mut options, "reference_image", &args.reference)?;
    let state = new_state(ToolKey::ImageInterpolation, options, &[args.source.clone()])?;
    let engine = open_engine(&args.session)?;
    print_preview(&engine, &state)?;
    let session = ToolSession::new(state);
    let Some(analysis) = engine.analyze_source(&session, args.expert)? else {
        println!("Đã huỷ.");
        return Ok(1);
    };
    println!("Prompt: {}", analysis.main_prompt);
    for suggestion in &analysis.suggestions {
        println!("  gợi ý: {suggestion}");
    }
    run_session(engine, &args.common, session)
}

fn run_khmer(args: KhmerArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    set_optional(&mut options, "khmer_template", &args.template);
    let state = new_state(ToolKey::KhmerPhotoMerge, options, &args.portraits)?;
    run_tool(&args.session, &args.common, state)
}

fn run_studio(args: StudioArgs) -> Result<i32> {
    let mut options = base_options(&args.common);
    set_optional(&mut options, "studio_name", &args.studio);
    options.set_extra("selected_templates", json!(args.scenes));
    let state = new_state(ToolKey::StudioGenerator, options, &args.portraits)?;
    run_tool(&args.session, &args.common, state)
}

fn run_tool(session_args: &SessionArgs, common: &CommonToolArgs, state: ToolState) -> Result<i32> {
    let engine = open_engine(session_args)?;
    print_preview(&engine, &state)?;
    run_session(engine, common, ToolSession::new(state))
}

fn print_preview(engine: &DukyEngine, state: &ToolState) -> Result<()> {
    let preview = engine.preview_plan(state)?;
    println!(
        "{}: {} image(s) with {} ({} credits, {} available)",
        state.tool, preview.images, preview.model, preview.total_credits, preview.credits_available
    );
    if let Some(reason) = preview.fallback_reason.as_deref() {
        println!("Note: {reason}");
    }
    Ok(())
}

fn run_session(mut engine: DukyEngine, common: &CommonToolArgs, session: ToolSession) -> Result<i32> {
    let mut result = engine.generate(&session);
    if let (Ok(BatchOutcome::Settled { .. }), Some(slot), Some(prompt)) =
        (&result, common.refine_slot, common.refine.as_deref())
    {
        if let Err(err) = refine_slot(&engine, &session, slot, prompt) {
            result = Err(err);
        }
    }
    let summary = engine.finish()?;
    let code = match result? {
        BatchOutcome::InsufficientCredits {
            required,
            available,
        } => {
            println!("Bạn đã hết Credit: cần {required}, còn {available}.");
            2
        }
        BatchOutcome::Cancelled { .. } => {
            println!("Đã huỷ.");
            1
        }
        BatchOutcome::Settled { tally, .. } => {
            let state = session.snapshot();
            for (idx, slot) in state.slots.iter().enumerate() {
                match &slot.status {
                    SlotStatus::Done { url } => println!("[{}] {} -> {url}", idx + 1, slot.label),
                    SlotStatus::Failed { error, .. } => {
                        println!("[{}] {} failed: {error}", idx + 1, slot.label)
                    }
                    SlotStatus::Pending => println!("[{}] {} pending", idx + 1, slot.label),
                }
            }
            if let Some(error) = state.error.as_deref() {
                println!("{error}");
            }
            println!(
                "{}/{} succeeded, {} credits left",
                tally.succeeded, tally.requested, summary.credits_remaining
            );
            if tally.succeeded > 0 {
                0
            } else {
                1
            }
        }
    };
    Ok(code)
}

fn refine_slot(engine: &DukyEngine, session: &ToolSession, slot: usize, prompt: &str) -> Result<()> {
    let Some(index) = slot.checked_sub(1) else {
        bail!("--refine-slot counts from 1");
    };
    match engine.regenerate_slot(session, index, prompt)? {
        RegenerationOutcome::Resolved { url, .. } => println!("[{slot}] edited -> {url}"),
        RegenerationOutcome::Failed { error, .. } => {
            println!("[{slot}] edit failed: {}", error.user_message())
        }
        RegenerationOutcome::InsufficientCredits {
            required,
            available,
        } => println!("Bạn đã hết Credit: cần {required}, còn {available}."),
        RegenerationOutcome::Cancelled { .. } => println!("[{slot}] edit discarded"),
    }
    Ok(())
}

fn run_restore(args: RestoreArgs) -> Result<i32> {
    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;
    match duky_engine::metadata::extract_settings(&bytes)? {
        Some(snapshot) => {
            let state = snapshot.restore();
            println!("{}", serde_json::to_string_pretty(&json!({
                "viewId": snapshot.view_id,
                "state": state,
            }))?);
            Ok(0)
        }
        None => {
            println!("No settings embedded in {}", args.image.display());
            Ok(1)
        }
    }
}

fn run_video(args: VideoArgs) -> Result<i32> {
    let mut engine = open_engine(&args.session)?;
    let image_url = args.image.as_deref().map(media_input).transpose()?;
    let audio_url = args.audio.as_deref().map(media_input).transpose()?;
    let inputs = serde_json::Map::from_iter(
        [
            ("prompt", Some(args.prompt.clone())),
            ("image_url", image_url),
            ("audio_url", audio_url),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key.to_string(), Value::String(value)))),
    );
    let uploaded = duky_engine::video::resolve_inputs(&inputs, engine.gallery())?;
    let text = |key: &str| uploaded.get(key).and_then(Value::as_str).map(str::to_string);
    let params = VideoTaskParams {
        prompt: args.prompt.clone(),
        image_url: text("image_url"),
        audio_url: text("audio_url"),
        model: args.model.clone(),
        mode: if args.fast {
            VideoMode::Fast
        } else {
            VideoMode::Normal
        },
        aspect_ratio: args.aspect_ratio.clone(),
    };
    let result = engine.generate_video(&params);
    engine.finish()?;
    println!("Video ready: {}", result?);
    Ok(0)
}

/// URLs pass through; local files become `data:` URLs for upload.
fn media_input(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") || trimmed.starts_with("data:") {
        return Ok(trimmed.to_string());
    }
    let path = Path::new(trimmed);
    let bytes =
        std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "image/png",
    };
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn run_credits(args: CreditsArgs) -> Result<i32> {
    let engine = open_engine(&args.session)?;
    if let Some(amount) = args.deposit {
        let balance = engine.credits().deposit(amount)?;
        println!("Deposited {amount}; balance {balance}");
    }
    println!("Balance: {}", engine.credits().available()?);
    println!("Spent: {}", engine.credits().spent()?);
    for version in [ModelVersion::V2, ModelVersion::V3] {
        println!(
            "{version}: {} credit(s) per image",
            engine.credit_table().per_image_cost(version)
        );
    }
    Ok(0)
}

fn run_gallery(args: GalleryArgs) -> Result<i32> {
    let engine = open_engine(&args.session)?;
    let entries = engine.gallery().list()?;
    for entry in &entries {
        println!("{}  {}  {}  {}", entry.created_at, entry.tool, entry.label, entry.url);
    }
    println!("{} image(s)", entries.len());
    if let Some(dest) = args.export.as_deref() {
        let written = engine.gallery().export(dest)?;
        println!("Exported {} file(s) to {}", written.len(), dest.display());
    }
    Ok(0)
}
