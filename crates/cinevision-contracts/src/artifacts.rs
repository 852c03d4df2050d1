use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the three fixed stylistic presets applied to prompt synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pipeline {
    A,
    B,
    C,
}

impl Pipeline {
    pub const ALL: [Pipeline; 3] = [Pipeline::A, Pipeline::B, Pipeline::C];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::A => "A",
            Pipeline::B => "B",
            Pipeline::C => "C",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Pipeline::A => "Pipeline A: Static Truth",
            Pipeline::B => "Pipeline B: Kinetic Burst",
            Pipeline::C => "Pipeline C: Resonance Aftermath",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Pipeline::A => "Introspective portrait, emotional depth, schematic overlays.",
            Pipeline::B => "High speed action, motion blur, dynamic angles.",
            Pipeline::C => "Epic environmental scale, volumetric fog, colossal outlines.",
        }
    }

    /// Lighting descriptor substituted into showcase templates.
    pub fn lighting(&self) -> &'static str {
        match self {
            Pipeline::A => "soft studio",
            Pipeline::B => "high contrast neon",
            Pipeline::C => "dramatic volumetric",
        }
    }

    /// Theme color used when the artifact metadata does not carry one.
    pub fn theme_color(&self) -> &'static str {
        match self {
            Pipeline::A => "gold",
            Pipeline::B => "red",
            Pipeline::C => "blue",
        }
    }

    /// Style fragment for the local fallback prompt template.
    pub fn style_fragment(&self) -> &'static str {
        match self {
            Pipeline::A => {
                "Extreme facial close-up, emotional depth, rim light, rembrandt lighting, \
                 translucent visual echo overlay"
            }
            Pipeline::B => {
                "Low-angle wide shot, action pose, motion trail, high contrast chiaroscuro, \
                 speed lines"
            }
            Pipeline::C => {
                "Extreme wide shot, epic scale, volumetric fog, environmental atmosphere, \
                 colossal silhouette"
            }
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pipeline {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Pipeline::A),
            "B" => Ok(Pipeline::B),
            "C" => Ok(Pipeline::C),
            other => Err(anyhow::anyhow!("unknown pipeline '{other}'")),
        }
    }
}

/// Logical aspect ratio of a generated artifact.
///
/// The stored ratio is a display value; `effective()` yields the ratio
/// actually sent to the generation service (21:9 is not natively supported
/// and is requested as 16:9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "9:16")]
    Vertical,
    #[serde(rename = "21:9")]
    Ultrawide,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "16:9")]
    Wide,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Vertical => "9:16",
            AspectRatio::Ultrawide => "21:9",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Wide => "16:9",
            AspectRatio::Square => "1:1",
        }
    }

    pub fn effective(&self) -> AspectRatio {
        match self {
            AspectRatio::Ultrawide => AspectRatio::Wide,
            other => *other,
        }
    }

    /// Single-letter orientation tag used in artifact ids.
    pub fn orientation_tag(&self) -> &'static str {
        match self {
            AspectRatio::Ultrawide => "w",
            _ => "v",
        }
    }

    /// Orientation word used in archive entry names.
    pub fn orientation_word(&self) -> &'static str {
        match self {
            AspectRatio::Ultrawide => "Wide",
            _ => "Vert",
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, AspectRatio::Ultrawide)
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "9:16" => Ok(AspectRatio::Vertical),
            "21:9" => Ok(AspectRatio::Ultrawide),
            "3:4" => Ok(AspectRatio::Portrait),
            "16:9" => Ok(AspectRatio::Wide),
            "1:1" => Ok(AspectRatio::Square),
            other => Err(anyhow::anyhow!("unknown aspect ratio '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A persisted generated image plus its generation metadata.
///
/// `image_data` is the base64-encoded PNG payload, treated as opaque.
/// Artifacts are immutable once persisted; the store replaces whole records
/// keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedArtifact {
    pub id: String,
    pub image_data: String,
    pub aspect_ratio: AspectRatio,
    pub prompt: String,
    pub created_at: i64,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
    #[serde(default)]
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactMetadata>,
}

impl GeneratedArtifact {
    /// Key used to group artifacts into export batches. Records imported
    /// from old snapshots may predate batch ids; they fall back to their
    /// own id and form single-artifact groups.
    pub fn batch_key(&self) -> &str {
        if self.batch_id.is_empty() {
            &self.id
        } else {
            &self.batch_id
        }
    }
}

/// `{pipeline}-{v|w}-{batch_ts}-{task_index}`
pub fn artifact_id(pipeline: Pipeline, ratio: AspectRatio, batch_ts: i64, index: usize) -> String {
    format!(
        "{}-{}-{}-{}",
        pipeline.as_str(),
        ratio.orientation_tag(),
        batch_ts,
        index
    )
}

pub fn batch_id(batch_ts: i64) -> String {
    format!("CID-{batch_ts}")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn aspect_ratio_serializes_as_ratio_literal() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_value(AspectRatio::Vertical)?, json!("9:16"));
        assert_eq!(serde_json::to_value(AspectRatio::Ultrawide)?, json!("21:9"));
        let parsed: AspectRatio = serde_json::from_value(json!("21:9"))?;
        assert_eq!(parsed, AspectRatio::Ultrawide);
        Ok(())
    }

    #[test]
    fn ultrawide_maps_to_wide_for_generation() {
        assert_eq!(AspectRatio::Ultrawide.effective(), AspectRatio::Wide);
        assert_eq!(AspectRatio::Vertical.effective(), AspectRatio::Vertical);
        assert_eq!(AspectRatio::Ultrawide.orientation_tag(), "w");
        assert_eq!(AspectRatio::Vertical.orientation_tag(), "v");
    }

    #[test]
    fn artifact_id_layout() {
        assert_eq!(
            artifact_id(Pipeline::B, AspectRatio::Vertical, 1700000000000, 0),
            "B-v-1700000000000-0"
        );
        assert_eq!(
            artifact_id(Pipeline::B, AspectRatio::Ultrawide, 1700000000000, 1),
            "B-w-1700000000000-1"
        );
    }

    #[test]
    fn artifact_round_trips_with_camel_case_fields() -> anyhow::Result<()> {
        let artifact = GeneratedArtifact {
            id: "A-v-1-0".to_string(),
            image_data: "aGVsbG8=".to_string(),
            aspect_ratio: AspectRatio::Vertical,
            prompt: "prompt".to_string(),
            created_at: 1,
            model_id: "model".to_string(),
            pipeline: Some(Pipeline::A),
            batch_id: "CID-1".to_string(),
            metadata: Some(ArtifactMetadata {
                subject_name: Some("Subject".to_string()),
                ..ArtifactMetadata::default()
            }),
        };
        let value = serde_json::to_value(&artifact)?;
        assert_eq!(value["aspectRatio"], json!("9:16"));
        assert_eq!(value["createdAt"], json!(1));
        assert_eq!(value["modelId"], json!("model"));
        assert_eq!(value["batchId"], json!("CID-1"));
        assert_eq!(value["metadata"]["subjectName"], json!("Subject"));
        // Absent optional fields are omitted, not serialized as null.
        assert_eq!(value["metadata"].get("themeColor"), None::<&Value>);
        let back: GeneratedArtifact = serde_json::from_value(value)?;
        assert_eq!(back, artifact);
        Ok(())
    }

    #[test]
    fn batch_key_falls_back_to_own_id() {
        let mut artifact = GeneratedArtifact {
            id: "A-v-1-0".to_string(),
            image_data: String::new(),
            aspect_ratio: AspectRatio::Vertical,
            prompt: String::new(),
            created_at: 1,
            model_id: String::new(),
            pipeline: None,
            batch_id: String::new(),
            metadata: None,
        };
        assert_eq!(artifact.batch_key(), "A-v-1-0");
        artifact.batch_id = "CID-1".to_string();
        assert_eq!(artifact.batch_key(), "CID-1");
    }
}
