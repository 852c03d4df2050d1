use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use cinevision_contracts::artifacts::{GeneratedArtifact, Pipeline};
use cinevision_contracts::gallery::{export_snapshot, import_snapshot, ArtifactStore};
use cinevision_engine::{
    apply_watermark, decode_image_data, error_chain_text, non_empty_env, render_showcase_assets,
    resolve_backend, FanOutMode, GenerateRequest, GenerationClient, PacingConfig, RenderedAsset,
    VisionEngine, WatermarkAssets,
};
use clap::{Parser, Subcommand, ValueEnum};
use indexmap::IndexMap;
use rand::Rng;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const GALLERY_FOLDER_NAME: &str = "Cinematic_Vision_Gallery";
const HISTORY_FILE_NAME: &str = "cve_history.json";
const SERIAL_PREFIX: &str = "SMJN";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Parser)]
#[command(name = "cinevision", version, about = "Cinematic character artwork toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Render artwork for a subject across one or all pipelines.
    Generate(GenerateArgs),
    /// Render showcase assets for one artifact into a directory.
    Showcase(ShowcaseArgs),
    /// Package one artifact with its showcase assets into a ZIP bundle.
    Bundle(BundleArgs),
    /// Package a whole batch, one folder per variant, into a ZIP.
    Collection(CollectionArgs),
    /// Export the full gallery as a ZIP archive.
    Export(ExportArgs),
    /// Write the gallery history to a JSON backup file.
    Backup(BackupArgs),
    /// Import a JSON backup file into the gallery.
    Import(ImportArgs),
    /// Upload the gallery and history snapshot to the cloud drive.
    Sync(SyncArgs),
    /// List the stored artifacts, newest first.
    History(HistoryArgs),
    /// Delete one artifact by id.
    Delete(DeleteArgs),
    /// Delete every stored artifact.
    Clear(ClearArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    All,
    Single,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    source: String,
    #[arg(long, value_enum, default_value = "all")]
    mode: ModeArg,
    #[arg(long)]
    pipeline: Option<Pipeline>,
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "gemini")]
    backend: String,
}

#[derive(Debug, Parser)]
struct ShowcaseArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
    #[arg(long, default_value = "showcase")]
    out_dir: PathBuf,
    #[arg(long)]
    serial: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "gemini")]
    backend: String,
}

#[derive(Debug, Parser)]
struct BundleArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "assets")]
    assets: PathBuf,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "gemini")]
    backend: String,
}

#[derive(Debug, Parser)]
struct CollectionArgs {
    #[arg(long)]
    batch: String,
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "assets")]
    assets: PathBuf,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "gemini")]
    backend: String,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct BackupArgs {
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ImportArgs {
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Parser)]
struct SyncArgs {
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
}

#[derive(Debug, Parser)]
struct DeleteArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
}

#[derive(Debug, Parser)]
struct ClearArgs {
    #[arg(long, default_value = "gallery.json")]
    gallery: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("cinevision error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Showcase(args) => run_showcase(args),
        Command::Bundle(args) => run_bundle(args),
        Command::Collection(args) => run_collection(args),
        Command::Export(args) => run_export(args),
        Command::Backup(args) => run_backup(args),
        Command::Import(args) => run_import(args),
        Command::Sync(args) => run_sync(args),
        Command::History(args) => run_history(args),
        Command::Delete(args) => run_delete(args),
        Command::Clear(args) => run_clear(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let backend = resolve_backend(&args.backend)?;
    let events = args
        .events
        .clone()
        .unwrap_or_else(|| default_events_path(&args.gallery));
    let mut engine = VisionEngine::new(&args.gallery, events, backend, args.model.clone())?;

    let request = GenerateRequest {
        subject: args.subject.clone(),
        source: args.source.clone(),
        mode: match args.mode {
            ModeArg::All => FanOutMode::All,
            ModeArg::Single => FanOutMode::Single,
        },
        pipeline: args.pipeline,
    };
    let artifacts = engine.generate(&request, &mut |status| println!("{status}"))?;

    if artifacts.is_empty() {
        println!("No artifacts were rendered.");
    } else {
        for artifact in &artifacts {
            println!(
                "Rendered {} ({} {})",
                artifact.id,
                artifact.pipeline.map(|p| p.as_str()).unwrap_or("-"),
                artifact.aspect_ratio
            );
        }
    }
    let history = engine.store().get_all()?;
    println!(
        "Session complete: {} new, {} total in gallery.",
        artifacts.len(),
        history.len()
    );
    Ok(0)
}

fn run_showcase(args: ShowcaseArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let Some(artifact) = store.get(&args.id)? else {
        bail!("artifact '{}' not found in {}", args.id, args.gallery.display());
    };
    let client = GenerationClient::new(resolve_backend(&args.backend)?, PacingConfig::default());
    let serial = args
        .serial
        .clone()
        .unwrap_or_else(|| random_serial(Utc::now().year()));
    let model = args
        .model
        .clone()
        .unwrap_or_else(|| artifact.model_id.clone());

    println!("Preparing showcase assets for {} ({serial})...", artifact.id);
    let assets = render_showcase_assets(&client, &artifact, &serial, &model)?;
    if assets.is_empty() {
        println!("No showcase assets were produced.");
        return Ok(0);
    }

    fs::create_dir_all(&args.out_dir)?;
    for asset in &assets {
        let path = args.out_dir.join(format!("{}.png", asset.file_stem()));
        fs::write(&path, decode_image_data(&asset.image_data)?)?;
        println!("Wrote {} ({})", path.display(), asset.label);
    }
    Ok(0)
}

fn run_bundle(args: BundleArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let Some(artifact) = store.get(&args.id)? else {
        bail!("artifact '{}' not found in {}", args.id, args.gallery.display());
    };
    let client = GenerationClient::new(resolve_backend(&args.backend)?, PacingConfig::default());
    let serial = random_serial(Utc::now().year());
    let model = args
        .model
        .clone()
        .unwrap_or_else(|| artifact.model_id.clone());

    println!("Preparing download package for {}...", artifact.id);
    let assets = render_showcase_assets(&client, &artifact, &serial, &model)?;
    let watermark_assets = WatermarkAssets::load(&args.assets);
    let original = apply_watermark(
        &decode_image_data(&artifact.image_data)?,
        &serial,
        &watermark_assets,
    )?;

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("Bundle_{}.zip", artifact.id)));
    build_bundle_archive(&artifact, &original, &assets, &out)?;
    println!("Wrote {}", out.display());
    Ok(0)
}

fn run_collection(args: CollectionArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let artifacts: Vec<GeneratedArtifact> = store
        .get_all()?
        .into_iter()
        .filter(|artifact| artifact.batch_key() == args.batch)
        .collect();
    if artifacts.is_empty() {
        bail!("no artifacts found for batch '{}'", args.batch);
    }

    let client = GenerationClient::new(resolve_backend(&args.backend)?, PacingConfig::default());
    let watermark_assets = WatermarkAssets::load(&args.assets);
    let year = Utc::now().year();

    println!("Packaging {} variant(s)...", artifacts.len());
    let mut entries = Vec::new();
    for artifact in &artifacts {
        let serial = random_serial(year);
        let model = args
            .model
            .clone()
            .unwrap_or_else(|| artifact.model_id.clone());
        let assets = render_showcase_assets(&client, artifact, &serial, &model)?;
        let original = apply_watermark(
            &decode_image_data(&artifact.image_data)?,
            &serial,
            &watermark_assets,
        )?;
        entries.push((artifact.clone(), original, assets));
    }

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("Collection_{}.zip", args.batch)));
    build_collection_archive(&args.batch, &entries, &out)?;
    println!("Wrote {}", out.display());
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let artifacts = store.get_all()?;
    if artifacts.is_empty() {
        println!("Gallery is empty, nothing to export.");
        return Ok(0);
    }
    let out = args.out.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "CVE_Gallery_Archive_{}.zip",
            Utc::now().format("%Y-%m-%d")
        ))
    });
    let mut last_reported = 0u8;
    build_gallery_archive(&artifacts, &out, &mut |percent| {
        if percent >= last_reported + 10 || percent == 100 {
            println!("Packaging... {percent}%");
            last_reported = percent;
        }
    })?;
    println!("Wrote {} ({} artifacts)", out.display(), artifacts.len());
    Ok(0)
}

fn run_backup(args: BackupArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let artifacts = store.get_all()?;
    let out = args.out.clone().unwrap_or_else(|| {
        PathBuf::from(format!("CVE_Backup_{}.json", Utc::now().format("%Y-%m-%d")))
    });
    fs::write(&out, export_snapshot(&artifacts)?)?;
    println!("Wrote {} ({} artifacts)", out.display(), artifacts.len());
    Ok(0)
}

fn run_import(args: ImportArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let imported = import_snapshot(&store, &raw).context("failed to parse backup file")?;
    println!("Successfully imported {imported} items.");
    Ok(0)
}

fn run_sync(args: SyncArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let artifacts = store.get_all()?;
    if artifacts.is_empty() {
        println!("Gallery is empty, nothing to sync.");
        return Ok(0);
    }
    let client = DriveClient::authenticate()?;
    client.export_gallery(&artifacts, &mut |current, total| {
        println!("Uploading {current}/{total}...");
    })?;
    client.save_snapshot(&export_snapshot(&artifacts)?)?;
    println!("Synced {} artifacts and history snapshot.", artifacts.len());
    Ok(0)
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let artifacts = store.get_all()?;
    if artifacts.is_empty() {
        println!("Gallery is empty.");
        return Ok(0);
    }
    for artifact in &artifacts {
        let created = DateTime::from_timestamp_millis(artifact.created_at)
            .map(|when| when.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| artifact.created_at.to_string());
        println!(
            "{}  {}  {:>5}  {}  {}",
            artifact.id,
            artifact.pipeline.map(|p| p.as_str()).unwrap_or("-"),
            artifact.aspect_ratio.as_str(),
            created,
            artifact.batch_key()
        );
    }
    println!("{} artifact(s).", artifacts.len());
    Ok(0)
}

fn run_delete(args: DeleteArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    if store.delete(&args.id)? {
        println!("Deleted {}.", args.id);
        Ok(0)
    } else {
        println!("No artifact with id {}.", args.id);
        Ok(1)
    }
}

fn run_clear(args: ClearArgs) -> Result<i32> {
    let store = ArtifactStore::new(&args.gallery);
    let count = store.get_all()?.len();
    store.clear()?;
    println!("Cleared {count} artifact(s).");
    Ok(0)
}

fn default_events_path(gallery: &Path) -> PathBuf {
    gallery
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| parent.join("events.jsonl"))
        .unwrap_or_else(|| PathBuf::from("events.jsonl"))
}

fn random_serial(year: i32) -> String {
    format!(
        "{SERIAL_PREFIX}-{year}-{}",
        rand::thread_rng().gen_range(1000..10000)
    )
}

fn batch_serial(year: i32, counter: usize) -> String {
    format!("{SERIAL_PREFIX}-{year}-{counter:04}")
}

// ---------------------------------------------------------------------------
// Archive building
// ---------------------------------------------------------------------------

fn zip_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(5))
}

fn archive_entry_name(index: usize, artifact: &GeneratedArtifact) -> String {
    let pipe = artifact
        .pipeline
        .map(|pipeline| format!("_{pipeline}"))
        .unwrap_or_default();
    format!(
        "IMG_{:03}{pipe}_{}_{}.png",
        index + 1,
        artifact.aspect_ratio.orientation_word(),
        artifact.created_at
    )
}

/// Packs the gallery into one ZIP, oldest first, with deterministic
/// collision-free entry names. Progress percentages never decrease.
fn build_gallery_archive(
    artifacts: &[GeneratedArtifact],
    out: &Path,
    on_progress: &mut dyn FnMut(u8),
) -> Result<()> {
    let mut sorted = artifacts.to_vec();
    sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let file = fs::File::create(out)
        .with_context(|| format!("failed to create archive {}", out.display()))?;
    let mut writer = ZipWriter::new(file);
    let total = sorted.len().max(1);
    for (index, artifact) in sorted.iter().enumerate() {
        writer.start_file(
            format!(
                "{GALLERY_FOLDER_NAME}/{}",
                archive_entry_name(index, artifact)
            ),
            zip_options(),
        )?;
        writer.write_all(&decode_image_data(&artifact.image_data)?)?;
        on_progress((((index + 1) * 100) / total) as u8);
    }
    writer.finish()?;
    Ok(())
}

fn build_bundle_archive(
    artifact: &GeneratedArtifact,
    watermarked_original: &[u8],
    assets: &[RenderedAsset],
    out: &Path,
) -> Result<()> {
    let file = fs::File::create(out)
        .with_context(|| format!("failed to create archive {}", out.display()))?;
    let mut writer = ZipWriter::new(file);
    let folder = format!("Bundle_{}", artifact.id);

    writer.start_file(format!("{folder}/Original_{}.png", artifact.id), zip_options())?;
    writer.write_all(watermarked_original)?;

    for asset in assets {
        writer.start_file(format!("{folder}/{}.png", asset.file_stem()), zip_options())?;
        writer.write_all(&decode_image_data(&asset.image_data)?)?;
    }
    writer.finish()?;
    Ok(())
}

fn build_collection_archive(
    batch_key: &str,
    entries: &[(GeneratedArtifact, Vec<u8>, Vec<RenderedAsset>)],
    out: &Path,
) -> Result<()> {
    let file = fs::File::create(out)
        .with_context(|| format!("failed to create archive {}", out.display()))?;
    let mut writer = ZipWriter::new(file);
    let root = format!("Collection_{batch_key}");

    for (artifact, original, assets) in entries {
        let folder = format!(
            "{root}/{}_{}",
            artifact
                .pipeline
                .map(|pipeline| pipeline.as_str())
                .unwrap_or("Default"),
            artifact.aspect_ratio.orientation_word()
        );
        writer.start_file(format!("{folder}/Original.png"), zip_options())?;
        writer.write_all(original)?;
        for asset in assets {
            writer.start_file(format!("{folder}/{}.png", asset.file_stem()), zip_options())?;
            writer.write_all(&decode_image_data(&asset.image_data)?)?;
        }
    }
    writer.finish()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Cloud drive sync
// ---------------------------------------------------------------------------

/// Drive-v3-style client. Uploads are idempotent (skip when a same-named
/// file already exists in the target folder); the history snapshot is a
/// single named JSON file upserted on every sync.
struct DriveClient {
    http: HttpClient,
    api_base: String,
    upload_base: String,
    access_token: String,
}

impl DriveClient {
    fn authenticate() -> Result<Self> {
        let access_token =
            non_empty_env("DRIVE_ACCESS_TOKEN").context("DRIVE_ACCESS_TOKEN not set")?;
        Ok(Self {
            http: HttpClient::new(),
            api_base: non_empty_env("DRIVE_API_BASE")
                .unwrap_or_else(|| "https://www.googleapis.com/drive/v3".to_string()),
            upload_base: non_empty_env("DRIVE_UPLOAD_BASE")
                .unwrap_or_else(|| "https://www.googleapis.com/upload/drive/v3".to_string()),
            access_token,
        })
    }

    fn find_file(
        &self,
        name: &str,
        mime_type: Option<&str>,
        parent: Option<&str>,
    ) -> Result<Option<String>> {
        let mut query = format!("name = '{}' and trashed = false", escape_drive_query(name));
        if let Some(mime_type) = mime_type {
            query.push_str(&format!(" and mimeType = '{mime_type}'"));
        }
        if let Some(parent) = parent {
            query.push_str(&format!(" and '{parent}' in parents"));
        }
        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .query(&[("q", query.as_str()), ("fields", "files(id, name)")])
            .bearer_auth(&self.access_token)
            .send()
            .context("drive file lookup failed")?;
        let payload = drive_json_or_error(response)?;
        Ok(payload
            .get("files")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn ensure_folder(&self, name: &str, parent: Option<&str>) -> Result<String> {
        if let Some(existing) = self.find_file(name, Some(FOLDER_MIME), parent)? {
            return Ok(existing);
        }
        let mut metadata = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }
        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .query(&[("fields", "id")])
            .bearer_auth(&self.access_token)
            .json(&metadata)
            .send()
            .with_context(|| format!("drive folder create failed ({name})"))?;
        let payload = drive_json_or_error(response)?;
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("drive folder create returned no id ({name})"))
    }

    /// Returns `false` when the upload was skipped because the file already
    /// exists in the folder.
    fn upload_file(
        &self,
        folder_id: &str,
        name: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<bool> {
        if self.find_file(name, None, Some(folder_id))?.is_some() {
            return Ok(false);
        }
        let metadata = json!({ "name": name, "parents": [folder_id] });
        let form = MultipartForm::new()
            .part(
                "metadata",
                MultipartPart::text(metadata.to_string()).mime_str("application/json")?,
            )
            .part(
                "file",
                MultipartPart::bytes(bytes)
                    .file_name(name.to_string())
                    .mime_str(mime_type)?,
            );
        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .query(&[("uploadType", "multipart")])
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .with_context(|| format!("drive upload failed ({name})"))?;
        drive_json_or_error(response)?;
        Ok(true)
    }

    /// Upserts the single named history snapshot: overwrite when present,
    /// create otherwise.
    fn save_snapshot(&self, payload: &str) -> Result<()> {
        let existing = self.find_file(HISTORY_FILE_NAME, None, None)?;
        let metadata = json!({ "name": HISTORY_FILE_NAME, "mimeType": "application/json" });
        let form = MultipartForm::new()
            .part(
                "metadata",
                MultipartPart::text(metadata.to_string()).mime_str("application/json")?,
            )
            .part(
                "file",
                MultipartPart::text(payload.to_string()).mime_str("application/json")?,
            );
        let request = match existing {
            Some(file_id) => self
                .http
                .patch(format!("{}/files/{file_id}", self.upload_base))
                .query(&[("uploadType", "multipart")]),
            None => self
                .http
                .post(format!("{}/files", self.upload_base))
                .query(&[("uploadType", "multipart")]),
        };
        let response = request
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .context("drive snapshot upsert failed")?;
        drive_json_or_error(response)?;
        Ok(())
    }

    /// Batch export: one serial-named subfolder per batch under the fixed
    /// gallery root, each group sorted by pipeline then aspect ratio.
    /// Individual upload failures are logged and skipped.
    fn export_gallery(
        &self,
        artifacts: &[GeneratedArtifact],
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let root_id = self.ensure_folder(GALLERY_FOLDER_NAME, None)?;
        let groups = group_artifacts_by_batch(artifacts);
        let year = Utc::now().year();
        let total = artifacts.len();
        let mut count = 0usize;

        for (group_index, group) in groups.values().enumerate() {
            let serial = batch_serial(year, group_index + 1);
            let folder_id = self.ensure_folder(&serial, Some(&root_id))?;

            let mut sorted = group.clone();
            sort_batch_group(&mut sorted);
            for artifact in &sorted {
                count += 1;
                on_progress(count, total);
                let name = remote_file_name(&serial, artifact);
                let bytes = match decode_image_data(&artifact.image_data) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        eprintln!("skipping {name}: {}", error_chain_text(&err, 256));
                        continue;
                    }
                };
                match self.upload_file(&folder_id, &name, bytes, "image/png") {
                    Ok(true) => {}
                    Ok(false) => println!("Skipping {name}, already exists."),
                    Err(err) => {
                        eprintln!("failed to upload {name}: {}", error_chain_text(&err, 256));
                    }
                }
            }
        }
        Ok(())
    }
}

fn drive_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .context("drive response body read failed")?;
    if !status.is_success() {
        bail!("drive request failed ({code}): {}", truncate_body(&body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("drive returned invalid JSON payload")
}

fn truncate_body(body: &str) -> String {
    body.chars().take(512).collect()
}

fn escape_drive_query(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Insertion-ordered grouping by batch key, preserving gallery order.
fn group_artifacts_by_batch(
    artifacts: &[GeneratedArtifact],
) -> IndexMap<String, Vec<GeneratedArtifact>> {
    let mut groups: IndexMap<String, Vec<GeneratedArtifact>> = IndexMap::new();
    for artifact in artifacts {
        groups
            .entry(artifact.batch_key().to_string())
            .or_default()
            .push(artifact.clone());
    }
    groups
}

fn sort_batch_group(group: &mut [GeneratedArtifact]) {
    group.sort_by(|a, b| {
        pipeline_order(a.pipeline)
            .cmp(&pipeline_order(b.pipeline))
            .then_with(|| a.aspect_ratio.as_str().cmp(b.aspect_ratio.as_str()))
    });
}

fn pipeline_order(pipeline: Option<Pipeline>) -> u8 {
    match pipeline {
        None => 0,
        Some(Pipeline::A) => 1,
        Some(Pipeline::B) => 2,
        Some(Pipeline::C) => 3,
    }
}

/// `SMJN-2026-0001_PipelineB_9x16.png`
fn remote_file_name(serial: &str, artifact: &GeneratedArtifact) -> String {
    let pipe = artifact
        .pipeline
        .map(|pipeline| format!("_Pipeline{pipeline}"))
        .unwrap_or_default();
    let ratio = artifact.aspect_ratio.as_str().replace(':', "x");
    format!("{serial}{pipe}_{ratio}.png")
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use cinevision_contracts::artifacts::{AspectRatio, GeneratedArtifact, Pipeline};

    use super::*;

    fn artifact(
        id: &str,
        pipeline: Option<Pipeline>,
        ratio: AspectRatio,
        created_at: i64,
        batch: &str,
    ) -> GeneratedArtifact {
        GeneratedArtifact {
            id: id.to_string(),
            image_data: BASE64.encode(format!("payload of {id}")),
            aspect_ratio: ratio,
            prompt: "prompt".to_string(),
            created_at,
            model_id: "model".to_string(),
            pipeline,
            batch_id: batch.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn archive_entry_names_are_deterministic() {
        let first = artifact("A-v-7-0", Some(Pipeline::A), AspectRatio::Vertical, 7, "CID-7");
        let second = artifact("A-w-7-1", Some(Pipeline::A), AspectRatio::Ultrawide, 7, "CID-7");
        assert_eq!(archive_entry_name(0, &first), "IMG_001_A_Vert_7.png");
        assert_eq!(archive_entry_name(1, &second), "IMG_002_A_Wide_7.png");

        let bare = artifact("X-v-9-0", None, AspectRatio::Vertical, 9, "");
        assert_eq!(archive_entry_name(2, &bare), "IMG_003_Vert_9.png");
    }

    #[test]
    fn gallery_archive_contains_every_artifact_with_monotone_progress() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("gallery.zip");
        let artifacts = vec![
            artifact("B-v-2-0", Some(Pipeline::B), AspectRatio::Vertical, 2, "CID-2"),
            artifact("A-v-1-0", Some(Pipeline::A), AspectRatio::Vertical, 1, "CID-1"),
        ];

        let mut reported = Vec::new();
        build_gallery_archive(&artifacts, &out, &mut |percent| reported.push(percent))?;

        assert!(reported.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(reported.last(), Some(&100));

        let mut archive = zip::ZipArchive::new(fs::File::open(&out)?)?;
        let names: Vec<String> = (0..archive.len())
            .map(|index| archive.by_index(index).map(|entry| entry.name().to_string()))
            .collect::<Result<_, _>>()?;
        // Oldest first: the timestamp-1 artifact takes sequence 001.
        assert_eq!(
            names,
            vec![
                "Cinematic_Vision_Gallery/IMG_001_A_Vert_1.png",
                "Cinematic_Vision_Gallery/IMG_002_B_Vert_2.png",
            ]
        );
        Ok(())
    }

    #[test]
    fn bundle_archive_layout() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("bundle.zip");
        let base = artifact("B-w-5-1", Some(Pipeline::B), AspectRatio::Ultrawide, 5, "CID-5");
        let assets = vec![RenderedAsset {
            kind: cinevision_engine::AssetKind::Poster,
            label: "Social Media Note".to_string(),
            image_data: BASE64.encode(b"poster"),
            resolution: AspectRatio::Portrait,
        }];

        build_bundle_archive(&base, b"original bytes", &assets, &out)?;

        let mut archive = zip::ZipArchive::new(fs::File::open(&out)?)?;
        let names: Vec<String> = (0..archive.len())
            .map(|index| archive.by_index(index).map(|entry| entry.name().to_string()))
            .collect::<Result<_, _>>()?;
        assert_eq!(
            names,
            vec![
                "Bundle_B-w-5-1/Original_B-w-5-1.png",
                "Bundle_B-w-5-1/Social_Media_Note.png",
            ]
        );
        Ok(())
    }

    #[test]
    fn collection_archive_groups_variants_into_folders() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("collection.zip");
        let entries = vec![
            (
                artifact("A-v-5-0", Some(Pipeline::A), AspectRatio::Vertical, 5, "CID-5"),
                b"one".to_vec(),
                Vec::new(),
            ),
            (
                artifact("A-w-5-1", Some(Pipeline::A), AspectRatio::Ultrawide, 5, "CID-5"),
                b"two".to_vec(),
                Vec::new(),
            ),
        ];

        build_collection_archive("CID-5", &entries, &out)?;

        let mut archive = zip::ZipArchive::new(fs::File::open(&out)?)?;
        let names: Vec<String> = (0..archive.len())
            .map(|index| archive.by_index(index).map(|entry| entry.name().to_string()))
            .collect::<Result<_, _>>()?;
        assert_eq!(
            names,
            vec![
                "Collection_CID-5/A_Vert/Original.png",
                "Collection_CID-5/A_Wide/Original.png",
            ]
        );
        Ok(())
    }

    #[test]
    fn batch_groups_sort_by_pipeline_then_ratio() {
        let mut group = vec![
            artifact("C-v-1-4", Some(Pipeline::C), AspectRatio::Vertical, 1, "CID-1"),
            artifact("A-w-1-1", Some(Pipeline::A), AspectRatio::Ultrawide, 1, "CID-1"),
            artifact("A-v-1-0", Some(Pipeline::A), AspectRatio::Vertical, 1, "CID-1"),
            artifact("B-v-1-2", Some(Pipeline::B), AspectRatio::Vertical, 1, "CID-1"),
        ];
        sort_batch_group(&mut group);
        let ids: Vec<&str> = group.iter().map(|item| item.id.as_str()).collect();
        // Within a pipeline, "21:9" sorts before "9:16" by plain string order.
        assert_eq!(ids, vec!["A-w-1-1", "A-v-1-0", "B-v-1-2", "C-v-1-4"]);
    }

    #[test]
    fn grouping_preserves_batch_order_and_falls_back_to_id() {
        let artifacts = vec![
            artifact("A-v-2-0", Some(Pipeline::A), AspectRatio::Vertical, 2, "CID-2"),
            artifact("legacy", None, AspectRatio::Vertical, 1, ""),
            artifact("A-w-2-1", Some(Pipeline::A), AspectRatio::Ultrawide, 2, "CID-2"),
        ];
        let groups = group_artifacts_by_batch(&artifacts);
        let keys: Vec<&str> = groups.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["CID-2", "legacy"]);
        assert_eq!(groups["CID-2"].len(), 2);
    }

    #[test]
    fn serial_formats() {
        assert_eq!(batch_serial(2026, 3), "SMJN-2026-0003");
        let serial = random_serial(2026);
        assert!(serial.starts_with("SMJN-2026-"));
        let digits = serial.rsplit('-').next().unwrap_or_default();
        assert_eq!(digits.len(), 4);
        assert!(digits.chars().all(|ch| ch.is_ascii_digit()));
    }

    #[test]
    fn remote_file_names_replace_ratio_separator() {
        let wide = artifact("B-w-1-1", Some(Pipeline::B), AspectRatio::Ultrawide, 1, "CID-1");
        assert_eq!(
            remote_file_name("SMJN-2026-0001", &wide),
            "SMJN-2026-0001_PipelineB_21x9.png"
        );
        let bare = artifact("legacy", None, AspectRatio::Vertical, 1, "");
        assert_eq!(
            remote_file_name("SMJN-2026-0001", &bare),
            "SMJN-2026-0001_9x16.png"
        );
    }

    #[test]
    fn drive_query_escaping() {
        assert_eq!(
            escape_drive_query("it's a 'test'"),
            "it\\'s a \\'test\\'"
        );
    }

    #[test]
    fn default_events_path_sits_next_to_the_gallery() {
        assert_eq!(
            default_events_path(Path::new("/data/run/gallery.json")),
            PathBuf::from("/data/run/events.jsonl")
        );
        assert_eq!(
            default_events_path(Path::new("gallery.json")),
            PathBuf::from("events.jsonl")
        );
    }
}
