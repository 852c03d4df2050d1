use crate::artifacts::{GeneratedArtifact, Pipeline};

/// System instruction driving cinematic prompt synthesis. The protocol asks
/// the text model to translate a subject/source/pipeline triple into a
/// physically-grounded render prompt; the response must be the raw prompt
/// string only.
pub const RENDER_PROTOCOL: &str = r#"{
  "system_meta_protocol": {
    "engine_name": "Cinematic Vision Computing Protocol",
    "version": "2.1",
    "output_target": "Midjourney V6 / Stable Diffusion XL",
    "core_philosophy": "Transforming 2D vector concepts into 3D physical realities through optical simulation."
  },
  "role_definition": {
    "identity": "Visual Computation Engine (Unreal Engine 5.3 Logic)",
    "primary_directive": "Render Hyper-Narrative Movie Posters by converting semantic inputs into physical rendering instructions.",
    "cognitive_mode": [
      "De-anthropomorphized Tool",
      "Physics Engine Simulator",
      "Cinematic Lighting Director"
    ]
  },
  "global_constraints": {
    "negative_prompt_injection": [
      "solid color silhouettes",
      "flat vector art",
      "cartoon cell shading",
      "text overlays inside image area",
      "low resolution textures",
      "stiff poses"
    ],
    "quality_assurance": {
      "resolution": "8k",
      "render_engine": "Octane Render",
      "optical_standard": "Physically Based Rendering (PBR)"
    }
  },
  "workflow_logic": {
    "step_1_analysis": {
      "action": "Extract Color DNA & Subject Topology",
      "instruction": "Identify the subject's canonical color palette and convert colors into materials (e.g., Red -> Anodized Aluminum, Black -> Matte Carbon Fiber)."
    },
    "step_2_visual_echo_construction": {
      "definition": "The 'silhouette' must be redefined as a 'Translucent Visual Echo' or 'Optical Afterimage'.",
      "layer_properties": {
        "opacity": "30-60% variable",
        "lighting_interaction": "Must allow Volumetric Lighting to pass through, creating internal glow rather than a hard block."
      }
    },
    "step_3_scene_integration": {
      "action": "Merge Subject and Echo",
      "method": "Use 'Depth of Field' and 'Atmospheric Perspective' to blend the visual echo into the background, ensuring no sharp vector edges remain."
    }
  },
  "rendering_pipelines": {
    "pipeline_A_static_truth": {
      "theme": "Introspective/Portrait",
      "composition": "Extreme Facial Close-up emphasizing emotional depth (85mm portrait lens) + Background Echo",
      "lighting_setup": "Rembrandt Lighting + Rim Light"
    },
    "pipeline_B_kinetic_burst": {
      "theme": "Action/Speed",
      "composition": "Low-angle Wide Shot (24mm lens) + Motion Trail",
      "lighting_setup": "High Contrast Chiaroscuro"
    },
    "pipeline_C_resonance_aftermath": {
      "theme": "Epic/Environmental",
      "composition": "Extreme Wide Shot + Atmospheric Shadow",
      "lighting_setup": "Global Illumination + Volumetric Fog"
    }
  },
  "prompt_template_generator": {
    "structure": "/imagine prompt: [Subject Description with Material Physics] + [Visual Echo Description with Texture & Light] + [Environment & Atmosphere] + [Camera & Render Tags] --ar 9:16 --style raw --s 750"
  }
}"#;

/// System instruction for direct image synthesis requests.
pub const IMAGE_SYSTEM_INSTRUCTION: &str = "You are a visual rendering engine. You DO NOT speak. \
You ONLY generate images based on the provided prompts. Do not offer descriptions or confirmations.";

/// System instruction for image-to-image showcase synthesis.
pub const COMPOSITE_SYSTEM_INSTRUCTION: &str = "You are a professional product photographer and \
graphic designer. You generate high-fidelity product mockups and lifestyle shots based on the \
provided input image. Ensure the input image is clearly visible on the screens/surfaces as requested.";

pub const WATERMARK_INSTRUCTION: &str = r#"
CRITICAL BRANDING INSTRUCTION:
You MUST integrate the brand name "雪沐江南" (Xue Mu Jiang Nan) into the image composition.
Style: Elegant, handwritten Chinese calligraphy or modern minimalist typography.
Placement: Subtly embedded in the corner, on a tag, or as a holographic overlay.
Icons: Include small, stylized icons representing "Apple", "Android", and "HarmonyOS" near the branding to indicate cross-platform compatibility."#;

pub const PHONE_MOCKUP_TEMPLATE: &str = r#"The input image is the digital wallpaper design.
Generate a professional product photography shot of an **iPhone 15 Pro Max** displaying the PROVIDED INPUT IMAGE on its screen.

Setting: The phone is resting on a dark, premium texture surface (like carbon fiber or slate).
Screen: The screen is ACTIVE and GLOWING, vividly showing the provided anime artwork. Ensure the artwork fits the screen perfectly.
Lighting: Cinematic, moody ${env.lighting}, casting sleek reflections on the phone's glass bezel.
Background: Shallow depth of field, hinting at a high-tech or gamer lifestyle environment.
Style: Apple Commercial Aesthetic, 8K, Unreal Engine 5 render style.
${watermarkInstruction}"#;

pub const DESKTOP_MOCKUP_TEMPLATE: &str = r#"The input image is the digital wallpaper design.
Generate a High-End Lifestyle Desk Setup Photography shot.

Subject: A premium desk setup featuring an **ultrawide curved monitor** as the centerpiece.
Content: The monitor MUST be displaying the PROVIDED INPUT IMAGE (the cinematic wallpaper) edge to edge, clearly and vividly.
Props: A mechanical keyboard, a subtle ${themeColor} ambient light strip, and a coffee cup.
Atmosphere: Cozy, tech-focused, expensive.
Focus: Sharp focus on the vivid digital art on the screen, with a creamy bokeh background.
${watermarkInstruction}"#;

pub const SOCIAL_NOTE_TEMPLATE: &str = r#"The input image is the main visual art.
Generate a Social Media Promo Poster / Magazine Layout.

Composition: Use the PROVIDED INPUT IMAGE as the central heroic visual.
Overlay minimal, trendy typography on top or bottom (not covering the face/main action).
Text to include conceptually: "${batchId}", "${entityName}".
Style: Trendy graphic design, high-saturation, poster design, e-commerce listing style.
Tags visible: #${universeName} #${charName}
${watermarkInstruction}"#;

/// Deterministic local prompt used when the prompt service is unreachable.
/// Keyed only by pipeline identity; no network dependency.
pub fn fallback_prompt(subject: &str, source: &str, pipeline: Pipeline) -> String {
    format!(
        "/imagine prompt: {subject} from {source}, {style}, hyper-realistic, 8k, Octane Render, \
         cinematic lighting --ar 9:16 --style raw --s 750",
        style = pipeline.style_fragment()
    )
}

/// Substitutes showcase template placeholders from artifact metadata.
///
/// Fallback literals when metadata is absent: subject "Character", display
/// name falls back to the subject, source "CinematicVision", and the
/// pipeline's theme color / lighting descriptor.
pub fn fill_showcase_template(
    template: &str,
    artifact: &GeneratedArtifact,
    serial: &str,
) -> String {
    let pipeline = artifact.pipeline.unwrap_or(Pipeline::A);
    let metadata = artifact.metadata.clone().unwrap_or_default();

    let theme_color = metadata
        .theme_color
        .unwrap_or_else(|| pipeline.theme_color().to_string());
    let subject = metadata
        .subject_name
        .unwrap_or_else(|| "Subject".to_string());
    let display_name = metadata
        .display_name
        .unwrap_or_else(|| {
            if subject == "Subject" {
                "Character".to_string()
            } else {
                subject.clone()
            }
        });
    let source = metadata
        .source_name
        .unwrap_or_else(|| "CinematicVision".to_string());

    template
        .replace("${env.lighting}", pipeline.lighting())
        .replace("${themeColor}", &theme_color)
        .replace("${batchId}", serial)
        .replace("${entityName}", &display_name)
        .replace("${universeName}", &source)
        .replace("${charName}", &subject)
        .replace("${watermarkInstruction}", WATERMARK_INSTRUCTION)
}

#[cfg(test)]
mod tests {
    use crate::artifacts::{ArtifactMetadata, AspectRatio};

    use super::*;

    fn artifact(pipeline: Pipeline, metadata: Option<ArtifactMetadata>) -> GeneratedArtifact {
        GeneratedArtifact {
            id: "A-v-1-0".to_string(),
            image_data: String::new(),
            aspect_ratio: AspectRatio::Vertical,
            prompt: String::new(),
            created_at: 1,
            model_id: "model".to_string(),
            pipeline: Some(pipeline),
            batch_id: "CID-1".to_string(),
            metadata,
        }
    }

    #[test]
    fn fallback_prompt_is_pipeline_keyed() {
        let prompt = fallback_prompt("Uzumaki Naruto", "火影忍者", Pipeline::B);
        assert!(prompt.starts_with("/imagine prompt: Uzumaki Naruto from 火影忍者"));
        assert!(prompt.contains("motion trail"));
        let other = fallback_prompt("Uzumaki Naruto", "火影忍者", Pipeline::C);
        assert!(other.contains("volumetric fog"));
        assert_ne!(prompt, other);
    }

    #[test]
    fn fill_substitutes_every_placeholder() {
        let metadata = ArtifactMetadata {
            subject_name: Some("Luffy".to_string()),
            source_name: Some("One Piece".to_string()),
            theme_color: Some("crimson".to_string()),
            display_name: None,
        };
        for template in [
            PHONE_MOCKUP_TEMPLATE,
            DESKTOP_MOCKUP_TEMPLATE,
            SOCIAL_NOTE_TEMPLATE,
        ] {
            let filled =
                fill_showcase_template(template, &artifact(Pipeline::B, Some(metadata.clone())), "SMJN-2026-0001");
            assert!(!filled.contains("${"), "unfilled placeholder in: {filled}");
        }
    }

    #[test]
    fn fill_falls_back_to_pipeline_theme_and_literals() {
        let filled = fill_showcase_template(
            SOCIAL_NOTE_TEMPLATE,
            &artifact(Pipeline::C, None),
            "SMJN-2026-0002",
        );
        assert!(filled.contains("#CinematicVision"));
        assert!(filled.contains("#Subject"));
        assert!(filled.contains("\"Character\""));
        assert!(filled.contains("SMJN-2026-0002"));

        let desk = fill_showcase_template(
            DESKTOP_MOCKUP_TEMPLATE,
            &artifact(Pipeline::C, None),
            "SMJN-2026-0002",
        );
        assert!(desk.contains("blue ambient light strip"));
    }

    #[test]
    fn lighting_descriptor_follows_pipeline() {
        let filled = fill_showcase_template(
            PHONE_MOCKUP_TEMPLATE,
            &artifact(Pipeline::B, None),
            "SMJN-2026-0003",
        );
        assert!(filled.contains("high contrast neon"));
    }
}
