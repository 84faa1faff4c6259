use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    check_size, check_steps, select_best_device, tensor_to_image, DeviceMap, GenerationRequest,
    Loader, ModelLike, ModelSource, ModelVariant,
};

pub const DEFAULT_STEPS: usize = 50;
pub const DEFAULT_GUIDANCE: f64 = 7.5;

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;
const END_OF_TEXT: &str = "<|endoftext|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVariant {
    V1_5,
    V2_1,
}

impl StableDiffusionVariant {
    fn config(self) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        }
    }

    fn tokenizer_repo(self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "openai/clip-vit-base-patch32",
        }
    }
}

/// Picks the half precision export of a component when loading in f16.
fn safetensors_file(stem: &str, dtype: DType) -> String {
    if dtype == DType::F16 {
        format!("{stem}.fp16.safetensors")
    } else {
        format!("{stem}.safetensors")
    }
}

/// Pads `tokens` to `max_len` with `pad_id`. Longer sequences are cut to
/// `max_len` and keep `eos_id` as their last token.
fn fit_tokens(mut tokens: Vec<u32>, max_len: usize, eos_id: u32, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        warn!(
            "prompt is {} tokens long, truncating to {max_len}",
            tokens.len()
        );
        tokens.truncate(max_len);
        if let Some(last) = tokens.last_mut() {
            *last = eos_id;
        }
    }
    tokens.resize(max_len, pad_id);
    tokens
}

/// Standard normal latents. A seed draws them from a seeded host RNG so the
/// same seed gives the same latents on every backend, CPU included.
fn initial_noise(
    seed: Option<u64>,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let Some(seed) = seed else {
        return Ok(Tensor::randn(0f32, 1f32, shape, device)?);
    };
    let (b, c, h, w) = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let noise: Vec<f32> = (0..b * c * h * w)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(noise, shape, device)?)
}

pub struct StableDiffusionModel {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    fn tokenize(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let tokens = fit_tokens(tokens, max_len, self.eos_id, self.pad_id);
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// CLIP embeddings for the prompt, preceded by the unconditional ones when
    /// classifier-free guidance is on.
    fn text_embeddings(&self, prompt: &str, uncond_prompt: &str, guided: bool) -> Result<Tensor> {
        let text_embeddings = self.text_model.forward(&self.tokenize(prompt)?)?;
        let text_embeddings = if guided {
            let uncond_embeddings = self.text_model.forward(&self.tokenize(uncond_prompt)?)?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };
        Ok(text_embeddings.to_dtype(self.dtype)?)
    }
}

impl ModelLike for StableDiffusionModel {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        let width = request.width.unwrap_or(self.config.width);
        let height = request.height.unwrap_or(self.config.height);
        check_size(width, height)?;
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        check_steps(steps)?;
        let guidance = request.guidance.unwrap_or(DEFAULT_GUIDANCE);
        let guided = guidance > 1.0;

        let text_embeddings = self.text_embeddings(
            &request.prompt,
            request.negative_prompt.as_deref().unwrap_or(""),
            guided,
        )?;

        let mut scheduler = self.config.build_scheduler(steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = initial_noise(
            request.seed,
            (1, LATENT_CHANNELS, height / 8, width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if guided {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * guidance)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!("denoising step {}/{}", index + 1, timesteps.len());
        }

        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        info!("decoded image");

        // [-1, 1] -> [0, 255]
        let images = ((images / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;

        tensor_to_image(&images.i(0)?)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(source: ModelSource, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion(variant) = source.variant;

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = source.precision.resolve(&device);
        let config = variant.config();
        let repo = api.model(source.model_id.clone());

        // --- Tokenizer ---
        let tokenizer_filename = api
            .model(variant.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let vocab = tokenizer.get_vocab(true);
        let pad_token = config.clip.pad_with.as_deref().unwrap_or(END_OF_TEXT);
        let pad_id = *vocab
            .get(pad_token)
            .with_context(|| format!("tokenizer has no padding token {pad_token}"))?;
        let eos_id = *vocab
            .get(END_OF_TEXT)
            .with_context(|| format!("tokenizer has no {END_OF_TEXT} token"))?;

        // --- CLIP text encoder, always evaluated in f32 ---
        info!("loading CLIP text encoder");
        let clip_weights = repo
            .get(&safetensors_file("text_encoder/model", dtype))
            .await
            .context("failed to get CLIP weights")?;
        let text_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, &device, DType::F32)
                .context("failed to load CLIP text encoder")?;

        // --- UNet ---
        info!("loading UNet");
        let unet_weights = repo
            .get(&safetensors_file("unet/diffusion_pytorch_model", dtype))
            .await
            .context("failed to get UNet weights")?;
        let unet = config
            .build_unet(
                unet_weights,
                &device,
                LATENT_CHANNELS,
                source.use_flash_attn,
                dtype,
            )
            .context("failed to load UNet")?;

        // --- VAE ---
        info!("loading VAE");
        let vae_weights = repo
            .get(&safetensors_file("vae/diffusion_pytorch_model", dtype))
            .await
            .context("failed to get VAE weights")?;
        let vae = config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load VAE")?;

        info!("loaded {} on {device:?} as {dtype:?}", source.model_id);

        Ok(StableDiffusionModel {
            device,
            dtype,
            config,
            tokenizer,
            pad_id,
            eos_id,
            text_model,
            unet,
            vae,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_uses_fp16_exports() {
        assert_eq!(
            safetensors_file("unet/diffusion_pytorch_model", DType::F16),
            "unet/diffusion_pytorch_model.fp16.safetensors"
        );
        assert_eq!(
            safetensors_file("text_encoder/model", DType::F32),
            "text_encoder/model.safetensors"
        );
    }

    #[test]
    fn short_prompts_are_padded() {
        let tokens = fit_tokens(vec![49406, 320, 49407], 77, 49407, 0);
        assert_eq!(tokens.len(), 77);
        assert_eq!(&tokens[..3], &[49406, 320, 49407]);
        assert!(tokens[3..].iter().all(|&t| t == 0));
    }

    #[test]
    fn exact_length_prompts_are_untouched() {
        let tokens: Vec<u32> = (0..77).collect();
        assert_eq!(fit_tokens(tokens.clone(), 77, 49407, 0), tokens);
    }

    #[test]
    fn long_prompts_end_with_end_of_text() {
        let tokens: Vec<u32> = (0..78).collect();
        let fitted = fit_tokens(tokens, 77, 49407, 0);
        assert_eq!(fitted.len(), 77);
        assert_eq!(&fitted[..76], &(0..76).collect::<Vec<u32>>()[..]);
        assert_eq!(fitted[76], 49407);
    }

    #[test]
    fn seeded_noise_is_reproducible_on_cpu() {
        let shape = (1, LATENT_CHANNELS, 8, 8);
        let a = initial_noise(Some(42), shape, &Device::Cpu).unwrap();
        let b = initial_noise(Some(42), shape, &Device::Cpu).unwrap();
        let c = initial_noise(Some(7), shape, &Device::Cpu).unwrap();
        assert_eq!(a.dims4().unwrap(), shape);
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b.flatten_all().unwrap().to_vec1::<f32>().unwrap());
        assert_ne!(a, c.flatten_all().unwrap().to_vec1::<f32>().unwrap());
    }

    #[test]
    fn unseeded_noise_has_requested_shape() {
        let noise = initial_noise(None, (1, LATENT_CHANNELS, 4, 6), &Device::Cpu).unwrap();
        assert_eq!(noise.dims4().unwrap(), (1, LATENT_CHANNELS, 4, 6));
    }

    #[test]
    fn variant_configs_have_expected_defaults() {
        let v1_5 = StableDiffusionVariant::V1_5.config();
        assert_eq!((v1_5.width, v1_5.height), (512, 512));
        assert_eq!(v1_5.clip.max_position_embeddings, 77);

        let v2_1 = StableDiffusionVariant::V2_1.config();
        assert_eq!((v2_1.width, v2_1.height), (768, 768));
    }
}
