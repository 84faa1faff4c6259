use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, Loader, ModelLike, Precision, StableDiffusionLoader};
use std::sync::Arc;

use crate::stable_diffusion::StableDiffusionVariant;

/// Model id loaded when none is given.
pub const DEFAULT_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    StableDiffusion,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION") || name_upper.contains("STABLE_DIFFUSION") {
            Some(ModelType::StableDiffusion)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    StableDiffusion(StableDiffusionVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        match ModelType::from_name(model_name)? {
            ModelType::StableDiffusion => {
                let name_upper = model_name.to_uppercase();
                Some(ModelVariant::StableDiffusion(
                    if name_upper.contains("2-1") || name_upper.contains("2.1") {
                        StableDiffusionVariant::V2_1
                    } else {
                        // v1-5 and anything unrecognised
                        StableDiffusionVariant::V1_5
                    },
                ))
            }
        }
    }
}

/// Everything a loader needs to know about what to fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSource {
    pub model_id: String,
    pub variant: ModelVariant,
    pub precision: Precision,
    pub use_flash_attn: bool,
}

impl ModelSource {
    pub fn from_model_id(model_id: &str) -> Result<Self> {
        ModelType::from_name(model_id)
            .ok_or_else(|| anyhow!("Unsupported model type: {}", model_id))?;
        let variant = ModelVariant::from_name(model_id)
            .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_id))?;
        Ok(Self {
            model_id: model_id.to_string(),
            variant,
            precision: Precision::default(),
            use_flash_attn: false,
        })
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_flash_attn(mut self, use_flash_attn: bool) -> Self {
        self.use_flash_attn = use_flash_attn;
        self
    }
}

/// Load a model based on its source, dispatching to the matching loader
pub async fn load_model(
    source: ModelSource,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    info!(
        "Loading model: {} (variant: {:?}, precision: {}, device: {})",
        source.model_id, source.variant, source.precision, device_map
    );

    match source.variant {
        ModelVariant::StableDiffusion(_) => {
            let model = StableDiffusionLoader::load(source, api, device_map).await?;
            Ok(Arc::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_stable_diffusion_generations() {
        assert_eq!(
            ModelVariant::from_name(DEFAULT_MODEL_ID),
            Some(ModelVariant::StableDiffusion(StableDiffusionVariant::V1_5))
        );
        assert_eq!(
            ModelVariant::from_name("stabilityai/stable-diffusion-2-1"),
            Some(ModelVariant::StableDiffusion(StableDiffusionVariant::V2_1))
        );
        assert_eq!(
            ModelVariant::from_name("someone/my_stable_diffusion_finetune"),
            Some(ModelVariant::StableDiffusion(StableDiffusionVariant::V1_5))
        );
    }

    #[test]
    fn rejects_other_model_families() {
        assert_eq!(ModelType::from_name("black-forest-labs/FLUX.1-schnell"), None);
        let err = ModelSource::from_model_id("openai/clip-vit-base-patch32").unwrap_err();
        assert!(err.to_string().contains("Unsupported model type"));
    }

    #[test]
    fn source_builder_sets_options() {
        let source = ModelSource::from_model_id(DEFAULT_MODEL_ID)
            .unwrap()
            .with_precision(Precision::F32)
            .with_flash_attn(true);
        assert_eq!(source.model_id, DEFAULT_MODEL_ID);
        assert_eq!(source.precision, Precision::F32);
        assert!(source.use_flash_attn);
    }
}
