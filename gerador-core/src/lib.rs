pub mod cache;
pub mod device_map;
pub mod error;
pub mod generate;
pub mod loader;
mod loader_factory;
pub mod precision;
mod util;

mod stable_diffusion;

pub use cache::ModelCache;
pub use device_map::*;
pub use error::GenerationError;
pub use generate::{
    check_size, check_steps, generate, validate_prompt, validate_request, GeneratedImage,
    MAX_IMAGE_SIDE, MAX_STEPS,
};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use precision::Precision;
use serde::{Deserialize, Serialize};
pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionModel, StableDiffusionVariant};
pub(crate) use util::*;
pub use util::{encode_png, PNG_FILE_NAME, PNG_MIME_TYPE};

/// A single text-to-image request. Only `prompt` is required; every other
/// field falls back to the model's defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// A loaded pipeline that maps one request to one image.
pub trait ModelLike: Send + Sync {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}
