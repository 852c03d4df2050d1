use anyhow::{bail, Context};
use serde_json::Value;

use crate::artifacts::GeneratedArtifact;
use crate::gallery::store::ArtifactStore;

/// Serializes the full artifact list as a JSON array suitable for backup
/// files and remote history snapshots.
pub fn export_snapshot(artifacts: &[GeneratedArtifact]) -> anyhow::Result<String> {
    Ok(serde_json::to_string(artifacts)?)
}

/// Parses a backup payload. The top-level value must be a JSON array and
/// every entry must parse; malformed input yields an error and no records.
pub fn parse_snapshot(raw: &str) -> anyhow::Result<Vec<GeneratedArtifact>> {
    let value: Value = serde_json::from_str(raw).context("backup payload is not valid JSON")?;
    if !value.is_array() {
        bail!("backup payload must be a JSON array");
    }
    serde_json::from_value(value).context("backup payload contains malformed artifact records")
}

/// Parses and bulk-upserts a backup payload into the store. All-or-nothing:
/// a parse failure writes nothing.
pub fn import_snapshot(store: &ArtifactStore, raw: &str) -> anyhow::Result<usize> {
    let artifacts = parse_snapshot(raw)?;
    store.put_all(&artifacts)?;
    Ok(artifacts.len())
}

#[cfg(test)]
mod tests {
    use crate::artifacts::{ArtifactMetadata, AspectRatio, GeneratedArtifact, Pipeline};

    use super::*;

    fn artifact(id: &str, created_at: i64) -> GeneratedArtifact {
        GeneratedArtifact {
            id: id.to_string(),
            image_data: "aGVsbG8=".to_string(),
            aspect_ratio: AspectRatio::Ultrawide,
            prompt: "prompt text".to_string(),
            created_at,
            model_id: "model".to_string(),
            pipeline: Some(Pipeline::B),
            batch_id: format!("CID-{created_at}"),
            metadata: Some(ArtifactMetadata {
                subject_name: Some("Subject".to_string()),
                source_name: Some("Source".to_string()),
                theme_color: None,
                display_name: None,
            }),
        }
    }

    #[test]
    fn snapshot_round_trip_reproduces_artifact_set() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = ArtifactStore::new(temp.path().join("source.json"));
        source.put_all(&[artifact("B-v-1-0", 1), artifact("B-w-1-1", 1)])?;

        let raw = export_snapshot(&source.get_all()?)?;

        let target = ArtifactStore::new(temp.path().join("target.json"));
        let imported = import_snapshot(&target, &raw)?;
        assert_eq!(imported, 2);
        assert_eq!(target.get_all()?, source.get_all()?);
        Ok(())
    }

    #[test]
    fn non_array_payload_is_rejected_without_writes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path().join("gallery.json"));

        let err = import_snapshot(&store, "{\"id\": \"A-v-1-0\"}").unwrap_err();
        assert!(err.to_string().contains("JSON array"));
        assert!(store.get_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn malformed_entry_writes_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path().join("gallery.json"));

        let raw = "[{\"id\": \"A-v-1-0\"}]";
        assert!(import_snapshot(&store, raw).is_err());
        assert!(store.get_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(parse_snapshot("not json").is_err());
    }
}
