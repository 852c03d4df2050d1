use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ab_glyph::{FontVec, PxScale};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Datelike, Utc};
use cinevision_contracts::artifacts::{
    artifact_id, batch_id, ArtifactMetadata, AspectRatio, GeneratedArtifact, Pipeline,
};
use cinevision_contracts::catalog::DEFAULT_IMAGE_MODEL;
use cinevision_contracts::events::EventWriter;
use cinevision_contracts::gallery::ArtifactStore;
use cinevision_contracts::prompts::{
    fallback_prompt, fill_showcase_template, COMPOSITE_SYSTEM_INSTRUCTION,
    DESKTOP_MOCKUP_TEMPLATE, IMAGE_SYSTEM_INSTRUCTION, PHONE_MOCKUP_TEMPLATE, RENDER_PROTOCOL,
    SOCIAL_NOTE_TEMPLATE,
};
use image::imageops::FilterType;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use rand::Rng;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Text model used for cinematic prompt synthesis.
pub const DEFAULT_TEXT_MODEL: &str = "gemini-3-pro-preview";

const MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Generation backends
// ---------------------------------------------------------------------------

/// The external generation service boundary: prompt synthesis, image
/// synthesis, and image-to-image composite synthesis.
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn generate_prompt(&self, subject: &str, source: &str, pipeline: Pipeline) -> Result<String>;

    fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        model_id: &str,
    ) -> Result<Vec<u8>>;

    fn generate_composite(
        &self,
        reference_png: &[u8],
        prompt: &str,
        aspect_ratio: AspectRatio,
        model_id: &str,
    ) -> Result<Vec<u8>>;
}

pub fn resolve_backend(name: &str) -> Result<Arc<dyn GenerationBackend>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "gemini" => Ok(Arc::new(GeminiBackend::new())),
        "dryrun" => Ok(Arc::new(DryrunBackend)),
        other => bail!("unknown generation backend '{other}'"),
    }
}

/// Offline backend producing deterministic artifacts: prompts come from the
/// local fallback template, images are solid-color panels keyed by a digest
/// of the prompt text.
pub struct DryrunBackend;

impl GenerationBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_prompt(&self, subject: &str, source: &str, pipeline: Pipeline) -> Result<String> {
        Ok(fallback_prompt(subject, source, pipeline))
    }

    fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        _model_id: &str,
    ) -> Result<Vec<u8>> {
        let (width, height) = dryrun_dims(aspect_ratio);
        let (r, g, b) = color_from_prompt(prompt, b"image");
        encode_panel_png(width, height, Rgb([r, g, b]))
    }

    fn generate_composite(
        &self,
        reference_png: &[u8],
        prompt: &str,
        aspect_ratio: AspectRatio,
        _model_id: &str,
    ) -> Result<Vec<u8>> {
        let (width, height) = dryrun_dims(aspect_ratio);
        let mut hasher = Sha256::new();
        hasher.update(reference_png);
        hasher.update(prompt.as_bytes());
        let digest = hasher.finalize();
        encode_panel_png(width, height, Rgb([digest[0], digest[1], digest[2]]))
    }
}

fn dryrun_dims(aspect_ratio: AspectRatio) -> (u32, u32) {
    match aspect_ratio {
        AspectRatio::Vertical => (90, 160),
        AspectRatio::Ultrawide => (210, 90),
        AspectRatio::Portrait => (96, 128),
        AspectRatio::Wide => (160, 90),
        AspectRatio::Square => (96, 96),
    }
}

fn encode_panel_png(width: u32, height: u32, color: Rgb<u8>) -> Result<Vec<u8>> {
    let mut panel = RgbImage::new(width, height);
    for pixel in panel.pixels_mut() {
        *pixel = color;
    }
    let mut bytes = Vec::new();
    panel
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode panel image")?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str, salt: &[u8]) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Live backend speaking the generateContent protocol over HTTP.
pub struct GeminiBackend {
    api_base: String,
    http: HttpClient,
}

impl GeminiBackend {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn post_generate(&self, model: &str, payload: &Value) -> Result<Value> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Duration::from_secs(90))
            .json(payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        response_json_or_error("Gemini", response)
    }

    fn extract_text(payload: &Value) -> Result<String> {
        let text = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| {
                parts
                    .iter()
                    .find_map(|part| part.get("text").and_then(Value::as_str))
            })
            .unwrap_or_default()
            .trim()
            .to_string();
        if text.is_empty() {
            bail!("empty response from prompt engine");
        }
        Ok(text)
    }

    fn extract_image(payload: &Value) -> Result<Vec<u8>> {
        let Some(candidate) = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
        else {
            bail!("API returned no candidates");
        };
        if candidate.get("finishReason").and_then(Value::as_str) == Some("SAFETY") {
            bail!("generation blocked by safety filters");
        }
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in &parts {
            let data = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(|inline| inline.get("data"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !data.is_empty() {
                return BASE64
                    .decode(data.as_bytes())
                    .context("image base64 decode failed");
            }
        }
        if parts
            .iter()
            .any(|part| part.get("text").and_then(Value::as_str).is_some())
        {
            bail!("the model returned text instead of an image");
        }
        bail!("no image data returned from API");
    }
}

impl Default for GeminiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_prompt(&self, subject: &str, source: &str, pipeline: Pipeline) -> Result<String> {
        let input = json!({
            "subject": subject,
            "source_material": source,
            "pipeline_choice": pipeline.as_str(),
        });
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{
                    "text": format!(
                        "Execute protocol for: {input}. Return ONLY the raw prompt string starting with /imagine prompt:"
                    ),
                }],
            }],
            "systemInstruction": { "parts": [{ "text": RENDER_PROTOCOL }] },
            "generationConfig": { "temperature": 0.8 },
        });
        let response = self.post_generate(DEFAULT_TEXT_MODEL, &payload)?;
        Self::extract_text(&response)
    }

    fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        model_id: &str,
    ) -> Result<Vec<u8>> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "systemInstruction": { "parts": [{ "text": IMAGE_SYSTEM_INSTRUCTION }] },
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": {
                    "aspectRatio": aspect_ratio.as_str(),
                    "imageSize": "4K",
                },
            },
        });
        let response = self.post_generate(model_id, &payload)?;
        Self::extract_image(&response)
    }

    fn generate_composite(
        &self,
        reference_png: &[u8],
        prompt: &str,
        aspect_ratio: AspectRatio,
        model_id: &str,
    ) -> Result<Vec<u8>> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(reference_png) } },
                    { "text": prompt },
                ],
            }],
            "systemInstruction": { "parts": [{ "text": COMPOSITE_SYSTEM_INSTRUCTION }] },
            "generationConfig": {
                "imageConfig": { "aspectRatio": aspect_ratio.as_str() },
            },
        });
        let response = self.post_generate(model_id, &payload)?;
        Self::extract_image(&response)
    }
}

// ---------------------------------------------------------------------------
// Failure classification and retry pacing
// ---------------------------------------------------------------------------

/// Raised when the image service keeps reporting quota exhaustion after the
/// retry budget is spent. Detect with [`is_quota_exhausted`].
#[derive(Debug, Clone, Copy)]
pub struct QuotaExceeded;

impl std::fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("daily generation quota exceeded, try again later")
    }
}

impl std::error::Error for QuotaExceeded {}

pub fn is_quota_exhausted(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<QuotaExceeded>().is_some())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimit,
    Safety,
    InvalidRequest,
    Overloaded,
    Transient,
    Other,
}

pub fn classify_failure(err: &anyhow::Error) -> FailureClass {
    if is_retryable_transport_error(err) {
        return FailureClass::Transient;
    }
    let text = error_chain_text(err, 512).to_ascii_lowercase();
    if text.contains("(429)") || text.contains("quota") || text.contains("resource_exhausted") {
        FailureClass::RateLimit
    } else if text.contains("safety") || text.contains("prohibited_content") {
        FailureClass::Safety
    } else if text.contains("(400)") || text.contains("invalid_argument") {
        FailureClass::InvalidRequest
    } else if text.contains("(500)")
        || text.contains("(503)")
        || text.contains("overloaded")
        || text.contains("unavailable")
        || text.contains("internal error")
    {
        FailureClass::Overloaded
    } else {
        FailureClass::Other
    }
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

/// Every delay the client and orchestrator sleep on. Defaults carry the
/// production values; `instant()` zeroes them so tests run immediately.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    /// Base of the exponential prompt backoff (1s, 2s between attempts).
    pub prompt_backoff_base: Duration,
    /// Flat delay between generic image retry attempts.
    pub image_flat_backoff: Duration,
    /// Base of the rate-limit backoff (doubles per attempt: 6s, 12s).
    pub quota_backoff_base: Duration,
    /// Base of the composite overload backoff (doubles per attempt: 4s, 8s).
    pub overload_backoff_base: Duration,
    /// Pause between sequential render tasks.
    pub inter_task_delay: Duration,
    /// Shorter pause after a failed task before moving on.
    pub failure_pause: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            prompt_backoff_base: Duration::from_secs(1),
            image_flat_backoff: Duration::from_secs(2),
            quota_backoff_base: Duration::from_secs(3),
            overload_backoff_base: Duration::from_secs(2),
            inter_task_delay: Duration::from_millis(1500),
            failure_pause: Duration::from_secs(1),
        }
    }
}

impl PacingConfig {
    pub fn instant() -> Self {
        Self {
            prompt_backoff_base: Duration::ZERO,
            image_flat_backoff: Duration::ZERO,
            quota_backoff_base: Duration::ZERO,
            overload_backoff_base: Duration::ZERO,
            inter_task_delay: Duration::ZERO,
            failure_pause: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Generation client (retry wrapper)
// ---------------------------------------------------------------------------

/// Wraps a backend with the bounded-retry policies, isolating transient
/// service failures from the orchestrator.
#[derive(Clone)]
pub struct GenerationClient {
    backend: Arc<dyn GenerationBackend>,
    pacing: PacingConfig,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn GenerationBackend>, pacing: PacingConfig) -> Self {
        Self { backend, pacing }
    }

    pub fn backend_name(&self) -> String {
        self.backend.name().to_string()
    }

    /// Up to three attempts with exponential backoff; exhaustion falls back
    /// to the deterministic local template, so the caller always receives a
    /// usable prompt string.
    pub fn generate_prompt(&self, subject: &str, source: &str, pipeline: Pipeline) -> String {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.backend.generate_prompt(subject, source, pipeline) {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) | Err(_) => {
                    if attempt < MAX_ATTEMPTS {
                        thread::sleep(self.pacing.prompt_backoff_base * (1u32 << (attempt - 1)));
                    }
                }
            }
        }
        fallback_prompt(subject, source, pipeline)
    }

    /// Up to three attempts. Rate-limit failures back off 6s/12s and
    /// exhaust into the distinguished [`QuotaExceeded`] condition; safety
    /// and malformed-request failures are never retried; everything else
    /// retries on a flat 2s delay and re-raises the underlying error.
    ///
    /// 21:9 is requested as 16:9 (the service has no native ultrawide);
    /// callers keep the logical ratio on the stored artifact.
    pub fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        model_id: &str,
    ) -> Result<Vec<u8>> {
        let cleaned = clean_image_prompt(prompt);
        let effective = aspect_ratio.effective();
        let mut attempt = 0u32;
        loop {
            match self.backend.generate_image(&cleaned, effective, model_id) {
                Ok(bytes) => return Ok(bytes),
                Err(err) => match classify_failure(&err) {
                    FailureClass::RateLimit => {
                        attempt += 1;
                        if attempt >= MAX_ATTEMPTS {
                            return Err(anyhow::Error::new(QuotaExceeded));
                        }
                        thread::sleep(self.pacing.quota_backoff_base * (1u32 << attempt));
                    }
                    FailureClass::Safety => return Err(err),
                    FailureClass::InvalidRequest => {
                        return Err(err.context("configuration error: model parameters mismatch"))
                    }
                    _ => {
                        attempt += 1;
                        if attempt >= MAX_ATTEMPTS {
                            return Err(err);
                        }
                        thread::sleep(self.pacing.image_flat_backoff);
                    }
                },
            }
        }
    }

    /// Up to three attempts, retrying only on server-overload signals with
    /// a doubling backoff (4s, 8s). Other failures are non-transient and
    /// propagate immediately.
    pub fn generate_composite(
        &self,
        reference_png: &[u8],
        prompt: &str,
        aspect_ratio: AspectRatio,
        model_id: &str,
    ) -> Result<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            match self
                .backend
                .generate_composite(reference_png, prompt, aspect_ratio, model_id)
            {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    let class = classify_failure(&err);
                    if class != FailureClass::Overloaded && class != FailureClass::Transient {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                    thread::sleep(self.pacing.overload_backoff_base * (1u32 << attempt));
                }
            }
        }
    }
}

/// Strips prompt-engine decoration before submission: the `/imagine prompt:`
/// marker, `--ar/--style/--s` flags, and `+` separators. The appended
/// `--seed N` uniqueness token is kept intact.
fn clean_image_prompt(prompt: &str) -> String {
    let stripped = strip_marker(prompt, "/imagine prompt:");
    let replaced = stripped.replace('+', ",");
    let mut out: Vec<&str> = Vec::new();
    let mut tokens = replaced.split_whitespace();
    while let Some(token) = tokens.next() {
        if matches!(token, "--ar" | "--style" | "--s") {
            tokens.next();
            continue;
        }
        out.push(token);
    }
    out.join(" ")
}

fn strip_marker(text: &str, marker: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let marker = marker.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find(&marker) {
        let start = cursor + found;
        out.push_str(&text[cursor..start]);
        cursor = start + marker.len();
    }
    out.push_str(&text[cursor..]);
    out
}

// ---------------------------------------------------------------------------
// Generation orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutMode {
    All,
    Single,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub subject: String,
    pub source: String,
    pub mode: FanOutMode,
    pub pipeline: Option<Pipeline>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTaskSpec {
    pub pipeline: Pipeline,
    pub aspect_ratio: AspectRatio,
    pub label: String,
}

/// Deterministic task list for one generation request: two orientations per
/// selected pipeline, in pipeline order.
pub fn build_render_plan(mode: FanOutMode, pipeline: Option<Pipeline>) -> Vec<RenderTaskSpec> {
    let pipelines: Vec<Pipeline> = match mode {
        FanOutMode::All => Pipeline::ALL.to_vec(),
        FanOutMode::Single => pipeline.into_iter().collect(),
    };
    let mut tasks = Vec::with_capacity(pipelines.len() * 2);
    for selected in pipelines {
        tasks.push(RenderTaskSpec {
            pipeline: selected,
            aspect_ratio: AspectRatio::Vertical,
            label: format!("Pipeline {selected} Vertical"),
        });
        tasks.push(RenderTaskSpec {
            pipeline: selected,
            aspect_ratio: AspectRatio::Ultrawide,
            label: format!("Pipeline {selected} Wide"),
        });
    }
    tasks
}

/// One prompt computation shared by both orientations of a pipeline. The
/// thread is joined once and the result memoized; a panicked thread falls
/// back to the local template.
struct PromptCell {
    handle: Option<thread::JoinHandle<String>>,
    resolved: Option<String>,
}

impl PromptCell {
    fn resolve(&mut self, fallback: impl FnOnce() -> String) -> (String, bool) {
        if let Some(text) = &self.resolved {
            return (text.clone(), false);
        }
        let text = match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| fallback()),
            None => fallback(),
        };
        self.resolved = Some(text.clone());
        (text, true)
    }
}

/// Sequences one user generation request into ordered prompt+image tasks,
/// persisting every success immediately so partial results survive later
/// failures. Image calls are strictly serialized with a fixed pause between
/// tasks; the external service is rate-limited and bursts get rejected.
pub struct VisionEngine {
    store: ArtifactStore,
    events: EventWriter,
    client: GenerationClient,
    pacing: PacingConfig,
    image_model: String,
    seed_source: Box<dyn FnMut() -> u32 + Send>,
    session: Vec<GeneratedArtifact>,
}

impl VisionEngine {
    pub fn new(
        gallery_path: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        backend: Arc<dyn GenerationBackend>,
        image_model: Option<String>,
    ) -> Result<Self> {
        let gallery_path = gallery_path.into();
        if let Some(parent) = gallery_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let events = EventWriter::new(events_path.into(), session_id);
        let pacing = PacingConfig::default();
        let client = GenerationClient::new(backend, pacing);

        events.emit(
            "session_started",
            map_object(json!({
                "gallery": gallery_path.to_string_lossy().to_string(),
                "backend": client.backend_name(),
            })),
        )?;

        Ok(Self {
            store: ArtifactStore::new(gallery_path),
            events,
            client,
            pacing,
            image_model: image_model.unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            seed_source: Box::new(|| rand::thread_rng().gen_range(0..100_000)),
            session: Vec::new(),
        })
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self.client = GenerationClient::new(self.client.backend.clone(), pacing);
        self
    }

    pub fn with_seed_source(mut self, seed_source: Box<dyn FnMut() -> u32 + Send>) -> Self {
        self.seed_source = seed_source;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn client(&self) -> &GenerationClient {
        &self.client
    }

    pub fn image_model(&self) -> &str {
        &self.image_model
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Artifacts produced by the most recent run, in task order.
    pub fn session_artifacts(&self) -> &[GeneratedArtifact] {
        &self.session
    }

    /// Runs one generation request to completion. Per-task failures are
    /// reported through `on_status` and the event log, then the run moves
    /// on; the returned list holds only the artifacts that succeeded, each
    /// already persisted to the store.
    ///
    /// There is no mid-run cancellation; a subsequent call replaces the
    /// session list. Runs cannot interleave on one engine (`&mut self`).
    pub fn generate(
        &mut self,
        request: &GenerateRequest,
        on_status: &mut dyn FnMut(&str),
    ) -> Result<Vec<GeneratedArtifact>> {
        let subject = request.subject.trim().to_string();
        let source = request.source.trim().to_string();
        if subject.is_empty() || source.is_empty() {
            self.events.emit(
                "generation_rejected",
                map_object(json!({ "reason": "missing subject or source" })),
            )?;
            return Ok(Vec::new());
        }
        if request.mode == FanOutMode::Single && request.pipeline.is_none() {
            self.events.emit(
                "generation_rejected",
                map_object(json!({ "reason": "single mode without pipeline" })),
            )?;
            return Ok(Vec::new());
        }

        self.session.clear();
        let plan = build_render_plan(request.mode, request.pipeline);
        let total = plan.len();

        match request.mode {
            FanOutMode::All => on_status("Synthesizing All Visual Echoes..."),
            FanOutMode::Single => {
                if let Some(selected) = request.pipeline {
                    on_status(&format!("Synthesizing Pipeline {selected}..."));
                }
            }
        }
        self.events.emit(
            "generation_started",
            map_object(json!({
                "subject": &subject,
                "source": &source,
                "tasks": total,
                "model": &self.image_model,
            })),
        )?;

        let batch_ts = timestamp_millis();
        let batch = batch_id(batch_ts);

        // Prompt computations fire immediately and independently; the task
        // loop joins each one the first time its pipeline comes up.
        let mut prompt_cells: indexmap::IndexMap<Pipeline, PromptCell> = indexmap::IndexMap::new();
        for task in &plan {
            if prompt_cells.contains_key(&task.pipeline) {
                continue;
            }
            let client = self.client.clone();
            let thread_subject = subject.clone();
            let thread_source = source.clone();
            let selected = task.pipeline;
            let handle = thread::spawn(move || {
                client.generate_prompt(&thread_subject, &thread_source, selected)
            });
            prompt_cells.insert(
                selected,
                PromptCell {
                    handle: Some(handle),
                    resolved: None,
                },
            );
        }

        for (index, task) in plan.iter().enumerate() {
            let (prompt, first_resolve) = match prompt_cells.get_mut(&task.pipeline) {
                Some(cell) => {
                    cell.resolve(|| fallback_prompt(&subject, &source, task.pipeline))
                }
                None => (fallback_prompt(&subject, &source, task.pipeline), true),
            };
            if first_resolve {
                self.events.emit(
                    "prompt_resolved",
                    map_object(json!({
                        "pipeline": task.pipeline.as_str(),
                        "prompt": truncate_text(&prompt, 256),
                    })),
                )?;
            }

            on_status(&format!(
                "Rendering {} ({}/{})...",
                task.label,
                index + 1,
                total
            ));
            self.events.emit(
                "render_started",
                map_object(json!({
                    "label": &task.label,
                    "index": index,
                    "aspect_ratio": task.aspect_ratio.as_str(),
                })),
            )?;

            let seed = (self.seed_source)() % 100_000;
            let task_prompt = format!("{prompt} --seed {seed}");

            let outcome = self
                .client
                .generate_image(&task_prompt, task.aspect_ratio, &self.image_model)
                .and_then(|bytes| {
                    let artifact = GeneratedArtifact {
                        id: artifact_id(task.pipeline, task.aspect_ratio, batch_ts, index),
                        image_data: BASE64.encode(bytes),
                        aspect_ratio: task.aspect_ratio,
                        prompt: prompt.clone(),
                        created_at: batch_ts,
                        model_id: self.image_model.clone(),
                        pipeline: Some(task.pipeline),
                        batch_id: batch.clone(),
                        metadata: Some(ArtifactMetadata {
                            subject_name: Some(subject.clone()),
                            source_name: Some(source.clone()),
                            theme_color: None,
                            display_name: None,
                        }),
                    };
                    // Partial progress must survive later failures: the
                    // session list and the store are updated before the
                    // next task starts.
                    self.session.push(artifact.clone());
                    self.store
                        .put(&artifact)
                        .context("failed to persist artifact")?;
                    Ok(artifact)
                });

            match outcome {
                Ok(artifact) => {
                    self.events.emit(
                        "artifact_created",
                        map_object(json!({
                            "artifact_id": &artifact.id,
                            "pipeline": task.pipeline.as_str(),
                            "aspect_ratio": artifact.aspect_ratio.as_str(),
                            "digest": short_digest(&artifact.image_data),
                        })),
                    )?;
                    if index + 1 < total {
                        thread::sleep(self.pacing.inter_task_delay);
                    }
                }
                Err(err) => {
                    on_status(&format!("Error on {}, skipping...", task.label));
                    self.events.emit(
                        "render_failed",
                        map_object(json!({
                            "label": &task.label,
                            "error": error_chain_text(&err, 512),
                            "quota_exhausted": is_quota_exhausted(&err),
                        })),
                    )?;
                    if index + 1 < total {
                        thread::sleep(self.pacing.failure_pause);
                    }
                }
            }
        }

        self.events.emit(
            "generation_finished",
            map_object(json!({
                "batch_id": &batch,
                "persisted": self.session.len(),
                "failed": total - self.session.len(),
            })),
        )?;

        Ok(self.session.clone())
    }
}

// ---------------------------------------------------------------------------
// Showcase renderer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Mockup,
    Poster,
}

/// A derived showcase image; not persisted to the gallery.
#[derive(Debug, Clone)]
pub struct RenderedAsset {
    pub kind: AssetKind,
    pub label: String,
    pub image_data: String,
    pub resolution: AspectRatio,
}

impl RenderedAsset {
    pub fn file_stem(&self) -> String {
        self.label.split_whitespace().collect::<Vec<_>>().join("_")
    }
}

/// Produces the orientation-appropriate device mockup plus the social-note
/// poster for one base artifact. A failed template is logged and skipped;
/// the returned subset may be empty.
pub fn render_showcase_assets(
    client: &GenerationClient,
    artifact: &GeneratedArtifact,
    serial: &str,
    model_id: &str,
) -> Result<Vec<RenderedAsset>> {
    let reference = decode_image_data(&artifact.image_data)?;
    let jobs: [(AssetKind, &str, &str); 2] = if artifact.aspect_ratio.is_wide() {
        [
            (AssetKind::Mockup, "Desktop Setup (Ultrawide)", DESKTOP_MOCKUP_TEMPLATE),
            (AssetKind::Poster, "Social Media Note", SOCIAL_NOTE_TEMPLATE),
        ]
    } else {
        [
            (AssetKind::Mockup, "Phone Mockup (3:4)", PHONE_MOCKUP_TEMPLATE),
            (AssetKind::Poster, "Social Media Note", SOCIAL_NOTE_TEMPLATE),
        ]
    };

    let mut assets = Vec::new();
    for (kind, label, template) in jobs {
        let prompt = fill_showcase_template(template, artifact, serial);
        match client.generate_composite(&reference, &prompt, AspectRatio::Portrait, model_id) {
            Ok(bytes) => assets.push(RenderedAsset {
                kind,
                label: label.to_string(),
                image_data: BASE64.encode(bytes),
                resolution: AspectRatio::Portrait,
            }),
            Err(err) => {
                eprintln!(
                    "showcase render failed for {label}: {}",
                    error_chain_text(&err, 256)
                );
            }
        }
    }
    Ok(assets)
}

// ---------------------------------------------------------------------------
// Watermark compositing
// ---------------------------------------------------------------------------

/// Bitmap/font inputs for the watermark overlay. Absent pieces are skipped,
/// so a bare `WatermarkAssets::empty()` still produces the gradient band.
pub struct WatermarkAssets {
    pub wordmark: Option<RgbaImage>,
    pub icons: Vec<RgbaImage>,
    pub font: Option<FontVec>,
}

impl WatermarkAssets {
    pub fn empty() -> Self {
        Self {
            wordmark: None,
            icons: Vec::new(),
            font: None,
        }
    }

    /// Loads `wordmark.png`, the platform icon set, and `font.ttf` from an
    /// assets directory, tolerating missing files.
    pub fn load(dir: &Path) -> Self {
        let load_image = |name: &str| -> Option<RgbaImage> {
            image::open(dir.join(name)).ok().map(|img| img.to_rgba8())
        };
        let icons = ["apple.png", "android.png", "harmonyos.png", "badge-4k.png"]
            .iter()
            .filter_map(|name| load_image(name))
            .collect();
        let font = fs::read(dir.join("font.ttf"))
            .ok()
            .and_then(|bytes| FontVec::try_from_vec(bytes).ok());
        Self {
            wordmark: load_image("wordmark.png"),
            icons,
            font,
        }
    }
}

/// Draws the branded footer onto a copy of the source image at native
/// resolution: bottom gradient band, centered wordmark, platform icon row,
/// and the serial/copyright line. Pure 2D compositing; identical inputs and
/// assets yield identical bytes.
pub fn apply_watermark(
    png_bytes: &[u8],
    serial: &str,
    assets: &WatermarkAssets,
) -> Result<Vec<u8>> {
    let mut canvas = image::load_from_memory(png_bytes)
        .context("watermark source decode failed")?
        .to_rgba8();
    let (width, height) = canvas.dimensions();
    let width_f = width as f32;
    let height_f = height as f32;

    draw_footer_gradient(&mut canvas);

    if let Some(wordmark) = &assets.wordmark {
        let target_height = (width_f * 0.07).max(1.0);
        let scale = target_height / wordmark.height().max(1) as f32;
        let scaled = image::imageops::resize(
            wordmark,
            ((wordmark.width() as f32 * scale).max(1.0)) as u32,
            target_height as u32,
            FilterType::Triangle,
        );
        let center_y = height_f - width_f * 0.08;
        let x = (width_f / 2.0 - scaled.width() as f32 / 2.0) as i64;
        let y = (center_y - scaled.height() as f32 / 2.0) as i64;
        blit_tinted(&mut canvas, &scaled, x, y, 1.0);
    }

    if !assets.icons.is_empty() {
        let icon_size = (width_f * 0.028).max(1.0) as u32;
        let spacing = width_f * 0.045;
        let row_width = spacing * (assets.icons.len() as f32 - 1.0);
        let icons_y = height_f - width_f * 0.045;
        let mut current_x = width_f / 2.0 - row_width / 2.0;
        for icon in &assets.icons {
            let scaled = image::imageops::resize(icon, icon_size, icon_size, FilterType::Triangle);
            let x = (current_x - icon_size as f32 / 2.0) as i64;
            let y = (icons_y - icon_size as f32 / 2.0) as i64;
            blit_tinted(&mut canvas, &scaled, x, y, 0.9);
            current_x += spacing;
        }
    }

    if let Some(font) = &assets.font {
        let line = format!("{serial} • {} ALL RIGHTS RESERVED", Utc::now().year());
        let scale = PxScale::from((width_f * 0.0095).max(6.0));
        let (text_width, text_height) = text_size(scale, font, &line);
        let x = (width_f / 2.0 - text_width as f32 / 2.0) as i32;
        let y = (height_f - width_f * 0.018 - text_height as f32 / 2.0) as i32;
        draw_text_mut(
            &mut canvas,
            Rgba([255, 255, 255, 90]),
            x,
            y,
            scale,
            font,
            &line,
        );
    }

    let mut out = Vec::new();
    canvas
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .context("failed to encode watermarked image")?;
    Ok(out)
}

/// Three-stop black fade over the bottom 22% of the canvas.
fn draw_footer_gradient(canvas: &mut RgbaImage) {
    let (width, height) = canvas.dimensions();
    let band = (height as f32 * 0.22).max(1.0);
    let start = height as f32 - band;
    for y in start as u32..height {
        let t = ((y as f32 - start) / band).clamp(0.0, 1.0);
        let alpha = if t < 0.3 {
            0.25 * (t / 0.3)
        } else {
            0.25 + (0.7 - 0.25) * ((t - 0.3) / 0.7)
        };
        for x in 0..width {
            let pixel = canvas.get_pixel_mut(x, y);
            for channel in 0..3 {
                pixel[channel] = (pixel[channel] as f32 * (1.0 - alpha)) as u8;
            }
        }
    }
}

/// Blits a sprite recolored to white, using its alpha channel as the mask.
fn blit_tinted(canvas: &mut RgbaImage, sprite: &RgbaImage, x: i64, y: i64, opacity: f32) {
    let (canvas_width, canvas_height) = canvas.dimensions();
    for (sx, sy, pixel) in sprite.enumerate_pixels() {
        let tx = x + sx as i64;
        let ty = y + sy as i64;
        if tx < 0 || ty < 0 || tx >= canvas_width as i64 || ty >= canvas_height as i64 {
            continue;
        }
        let alpha = (pixel[3] as f32 / 255.0) * opacity;
        if alpha <= 0.0 {
            continue;
        }
        let target = canvas.get_pixel_mut(tx as u32, ty as u32);
        for channel in 0..3 {
            target[channel] =
                (target[channel] as f32 * (1.0 - alpha) + 255.0 * alpha).min(255.0) as u8;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Decodes an artifact payload, tolerating a `data:image/...;base64,` prefix
/// on records imported from old browser-era snapshots.
pub fn decode_image_data(data: &str) -> Result<Vec<u8>> {
    let trimmed = data.trim();
    let encoded = match trimmed.find(";base64,") {
        Some(pos) if trimmed.starts_with("data:") => &trimmed[pos + ";base64,".len()..],
        _ => trimmed,
    };
    BASE64
        .decode(encoded.as_bytes())
        .context("artifact image payload is not valid base64")
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn short_digest(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}
