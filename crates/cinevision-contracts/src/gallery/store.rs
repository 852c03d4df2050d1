use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::artifacts::GeneratedArtifact;

/// File-backed artifact store: one JSON object keyed by artifact id.
///
/// Every mutation is a whole-file rewrite, so concurrent writers converge
/// through upsert semantics; there is no locking beyond per-write atomicity.
/// A missing or unreadable file reads as an empty gallery.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    path: PathBuf,
}

impl ArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put(&self, artifact: &GeneratedArtifact) -> anyhow::Result<()> {
        let mut records = read_json_object(&self.path).unwrap_or_default();
        records.insert(artifact.id.clone(), serde_json::to_value(artifact)?);
        write_json_object(&self.path, &records)
    }

    pub fn put_all(&self, artifacts: &[GeneratedArtifact]) -> anyhow::Result<()> {
        if artifacts.is_empty() {
            return Ok(());
        }
        let mut records = read_json_object(&self.path).unwrap_or_default();
        for artifact in artifacts {
            records.insert(artifact.id.clone(), serde_json::to_value(artifact)?);
        }
        write_json_object(&self.path, &records)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<GeneratedArtifact>> {
        let records = read_json_object(&self.path).unwrap_or_default();
        let Some(value) = records.get(id) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value.clone())?))
    }

    /// All artifacts, newest first by creation instant.
    pub fn get_all(&self) -> anyhow::Result<Vec<GeneratedArtifact>> {
        let records = read_json_object(&self.path).unwrap_or_default();
        let mut artifacts = Vec::with_capacity(records.len());
        for value in records.values() {
            artifacts.push(serde_json::from_value::<GeneratedArtifact>(value.clone())?);
        }
        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(artifacts)
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let mut records = read_json_object(&self.path).unwrap_or_default();
        let removed = records.remove(id).is_some();
        if removed {
            write_json_object(&self.path, &records)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        write_json_object(&self.path, &Map::new())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
