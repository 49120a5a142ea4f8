//! Visual generation agent
//!
//! Fire-and-forget scene illustration. The agent takes an `ImageRequest`,
//! renders through the [`ImageModel`] seam (expected 5-15 s), uploads the
//! bytes through [`MediaStore`], and returns an `ImageResult` with the
//! public URL. It is never on the critical path: the orchestrator invokes it
//! only from detached tasks.
//!
//! Failure semantics: any error yields `{status: "failed", error}`; a
//! missing backend yields `{status: "skipped"}`. Neither ever surfaces to
//! the primary stream.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::Agent;
use crate::Result;

/// Prompt scaffold for culturally grounded imagery.
const PROMPT_TEMPLATE: &str = "Oral tradition illustration, {scene}, in the \
style of contemporary African art, warm earth tones, vibrant colors, \
cultural authenticity, {culture} visual elements, digital painting, \
storytelling scene, detailed, beautiful";

const NEGATIVE_PROMPT: &str = "stereotypical, offensive, caricature, \
Western-centric, colonial imagery, unrealistic skin tones, cartoonish, low \
quality, blurry, text, watermark";

/// Seam over the image-generation backend.
#[async_trait]
pub trait ImageModel: Send + Sync {
    /// Render one PNG for the prompt.
    async fn generate_png(
        &self,
        prompt: &str,
        negative_prompt: &str,
        aspect_ratio: &str,
    ) -> Result<Vec<u8>>;
}

/// Seam over the media object store.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Upload PNG bytes and return a public URL.
    async fn upload_png(&self, object_name: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Asynchronous scene illustrator.
pub struct VisualAgent {
    model: Option<Arc<dyn ImageModel>>,
    media: Option<Arc<dyn MediaStore>>,
}

impl VisualAgent {
    pub fn new(model: Option<Arc<dyn ImageModel>>, media: Option<Arc<dyn MediaStore>>) -> Self {
        Self { model, media }
    }

    /// Generate and upload one image, returning its URL.
    async fn generate_image(
        &self,
        scene_description: &str,
        culture: &str,
        aspect_ratio: &str,
    ) -> Result<Option<String>> {
        let (Some(model), Some(media)) = (&self.model, &self.media) else {
            warn!("image backend not configured, skipping generation");
            return Ok(None);
        };

        let prompt = PROMPT_TEMPLATE
            .replace("{scene}", scene_description)
            .replace("{culture}", culture);

        let scene_preview: String = scene_description.chars().take(80).collect();
        info!(scene = %scene_preview, culture, "generating image");

        let bytes = model
            .generate_png(&prompt, NEGATIVE_PROMPT, aspect_ratio)
            .await?;

        let object_name = format!("generated/{}.png", Uuid::new_v4().simple());
        let url = media.upload_png(&object_name, bytes).await?;

        info!(object = %object_name, "image generated and uploaded");
        Ok(Some(url))
    }
}

#[async_trait]
impl Agent for VisualAgent {
    fn name(&self) -> &'static str {
        "visual"
    }

    fn output_schema(&self) -> Option<&'static str> {
        Some("ImageResult")
    }

    /// `ImageRequest` in, `ImageResult` out; errors become statuses, never
    /// propagated failures.
    async fn execute(&self, input: Value) -> Result<Value> {
        let scene = input
            .get("scene_description")
            .and_then(Value::as_str)
            .unwrap_or("");
        let culture = input.get("culture").and_then(Value::as_str).unwrap_or("African");
        let aspect_ratio = input
            .get("aspect_ratio")
            .and_then(Value::as_str)
            .unwrap_or("16:9");

        match self.generate_image(scene, culture, aspect_ratio).await {
            Ok(Some(url)) => Ok(json!({ "status": "success", "url": url })),
            Ok(None) => Ok(json!({
                "status": "skipped",
                "error": "Image generation unavailable"
            })),
            Err(e) => {
                warn!(%e, "image generation failed");
                Ok(json!({
                    "status": "failed",
                    "error": e.to_string()
                }))
            }
        }
    }
}
