use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;

use crate::{
    select_best_device, tensor_to_image, DeviceMap, GenerationRequest, Loader, ModelLike,
};

/// Scale factor between VAE latents and image space for the SDXL autoencoder.
const VAE_SCALE: f64 = 0.13025;

/// Attention slice size used on accelerators to keep peak memory down.
const SLICED_ATTENTION_SIZE: usize = 128;

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const CLIP2_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

pub struct SdxlModel {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    tokenizer_2: Tokenizer,
    text_model: clip::ClipTextTransformer,
    text_model_2: clip::ClipTextTransformer,
    autoencoder: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl SdxlModel {
    /// Encodes a prompt pair through one CLIP text encoder, padded to the
    /// encoder's context length. With guidance active the unconditional
    /// embedding is stacked in front of the conditional one.
    fn encode_with(
        &self,
        tokenizer: &Tokenizer,
        text_model: &clip::ClipTextTransformer,
        clip_config: &clip::Config,
        prompt: &str,
        negative_prompt: &str,
        use_guide_scale: bool,
    ) -> Result<Tensor> {
        let encode = |text: &str| -> Result<Tensor> {
            let tokens = prompt_token_ids(tokenizer, clip_config, text)?;
            let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            Ok(text_model.forward(&tokens)?)
        };

        let text_embeddings = encode(prompt)?;
        if !use_guide_scale {
            return Ok(text_embeddings);
        }
        let uncond_embeddings = encode(negative_prompt)?;
        Ok(Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?)
    }

    /// Concatenated embeddings from both SDXL text encoders.
    fn embed_prompts(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guide_scale: bool,
    ) -> Result<Tensor> {
        let clip2_config = self
            .config
            .clip2
            .as_ref()
            .context("SDXL config is missing the second text encoder")?;
        let emb = self.encode_with(
            &self.tokenizer,
            &self.text_model,
            &self.config.clip,
            prompt,
            negative_prompt,
            use_guide_scale,
        )?;
        let emb_2 = self.encode_with(
            &self.tokenizer_2,
            &self.text_model_2,
            clip2_config,
            prompt,
            negative_prompt,
            use_guide_scale,
        )?;
        Ok(Tensor::cat(&[emb, emb_2], D::Minus1)?.to_dtype(self.dtype)?)
    }
}

impl ModelLike for SdxlModel {
    fn run(&self, request: &GenerationRequest, seed: u32) -> Result<Vec<DynamicImage>> {
        // Guidance at exactly 1.0 degenerates to the unguided forward pass.
        let use_guide_scale = request.guidance_scale > 1.0;

        let text_embeddings =
            self.embed_prompts(&request.prompt, &request.negative_prompt, use_guide_scale)?;

        let mut scheduler = self.config.build_scheduler(request.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latent_height = request.height / 8;
        let latent_width = request.width / 8;

        let mut images = Vec::with_capacity(request.num_outputs);
        for idx in 0..request.num_outputs {
            // Per-sample seed offset keeps batch images distinct while the
            // whole batch stays reproducible from the resolved seed.
            let latents = latent_noise(
                &self.device,
                seed as u64 + idx as u64,
                latent_height,
                latent_width,
            )?
            .to_dtype(self.dtype)?;
            let mut latents = (latents * scheduler.init_noise_sigma())?;

            for &timestep in &timesteps {
                let latent_model_input = if use_guide_scale {
                    Tensor::cat(&[&latents, &latents], 0)?
                } else {
                    latents.clone()
                };
                let latent_model_input =
                    scheduler.scale_model_input(latent_model_input, timestep)?;
                let noise_pred =
                    self.unet
                        .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
                let noise_pred = if use_guide_scale {
                    let chunks = noise_pred.chunk(2, 0)?;
                    let (uncond, text) = (&chunks[0], &chunks[1]);
                    (uncond + ((text - uncond)? * request.guidance_scale)?)?
                } else {
                    noise_pred
                };
                latents = scheduler.step(&noise_pred, timestep, &latents)?;
            }

            let decoded = self.autoencoder.decode(&(&latents / VAE_SCALE)?)?;
            let decoded = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?
                .clamp(0f32, 1f32)?
                .to_device(&Device::Cpu)?;
            let decoded = (decoded * 255.)?.to_dtype(DType::U8)?;
            images.push(tensor_to_image(&decoded.i(0)?)?);
            tracing::debug!(sample = idx + 1, total = request.num_outputs, "decoded sample");
        }

        Ok(images)
    }
}

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Model = SdxlModel;

    async fn load(model_id: String, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        // Configure device and precision.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            DType::F16
        };
        let fp16_weights = dtype == DType::F16;
        // Attention slicing only pays off when the weights sit in
        // accelerator memory.
        let sliced_attention_size = if device.is_cpu() {
            None
        } else {
            Some(SLICED_ATTENTION_SIZE)
        };
        let config = StableDiffusionConfig::sdxl(sliced_attention_size, None, None);

        tracing::info!(model = %model_id, device = ?device, dtype = ?dtype, "loading pipeline");
        let repo = api.repo(hf_hub::Repo::model(model_id));

        // --- Tokenizers for the two text encoders ---
        let tokenizer_filename = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let tokenizer_2_filename = api
            .model(CLIP2_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get second CLIP tokenizer")?;
        let tokenizer_2 = Tokenizer::from_file(tokenizer_2_filename)
            .map_err(Error::msg)
            .context("failed to load second CLIP tokenizer")?;

        // --- Text encoders ---
        let clip_weights = repo
            .get(&weight_file("text_encoder/model.safetensors", fp16_weights))
            .await
            .context("failed to get text encoder weights")?;
        let text_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, &device, DType::F32)
                .context("failed to build text encoder")?;
        let clip2_config = config
            .clip2
            .as_ref()
            .context("SDXL config is missing the second text encoder")?;
        let clip2_weights = repo
            .get(&weight_file("text_encoder_2/model.safetensors", fp16_weights))
            .await
            .context("failed to get second text encoder weights")?;
        let text_model_2 = stable_diffusion::build_clip_transformer(
            clip2_config,
            clip2_weights,
            &device,
            DType::F32,
        )
        .context("failed to build second text encoder")?;

        // --- Autoencoder ---
        let vae_weights = repo
            .get(&weight_file(
                "vae/diffusion_pytorch_model.safetensors",
                fp16_weights,
            ))
            .await
            .context("failed to get autoencoder weights")?;
        let autoencoder = config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to build autoencoder")?;

        // --- UNet ---
        let unet_weights = repo
            .get(&weight_file(
                "unet/diffusion_pytorch_model.safetensors",
                fp16_weights,
            ))
            .await
            .context("failed to get UNet weights")?;
        let unet = config
            .build_unet(
                unet_weights,
                &device,
                4,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .context("failed to build UNet")?;

        tracing::info!("pipeline loaded");
        Ok(SdxlModel {
            device,
            dtype,
            config,
            tokenizer,
            tokenizer_2,
            text_model,
            text_model_2,
            autoencoder,
            unet,
        })
    }
}

/// Tokenizes a prompt and pads it to the text encoder's context length.
/// Prompts that exceed the context length are rejected rather than
/// silently truncated.
fn prompt_token_ids(
    tokenizer: &Tokenizer,
    clip_config: &clip::Config,
    text: &str,
) -> Result<Vec<u32>> {
    let pad_token = clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
    let pad_id = *tokenizer
        .get_vocab(true)
        .get(pad_token)
        .with_context(|| format!("pad token {pad_token:?} missing from tokenizer vocab"))?;
    let mut tokens = tokenizer
        .encode(text, true)
        .map_err(Error::msg)?
        .get_ids()
        .to_vec();
    if tokens.len() > clip_config.max_position_embeddings {
        anyhow::bail!(
            "the prompt is too long, {} tokens > maximum of {}",
            tokens.len(),
            clip_config.max_position_embeddings
        );
    }
    tokens.resize(clip_config.max_position_embeddings, pad_id);
    Ok(tokens)
}

/// Draws the initial latent noise for one sample. Accelerator backends take
/// the seed through the device RNG; the CPU backend cannot be seeded that
/// way, so there the noise comes from a dedicated seeded RNG.
fn latent_noise(
    device: &Device,
    seed: u64,
    latent_height: usize,
    latent_width: usize,
) -> Result<Tensor> {
    let shape = (1, 4, latent_height, latent_width);
    if device.is_cpu() {
        let mut rng = StdRng::seed_from_u64(seed);
        let samples: Vec<f32> = (0..4 * latent_height * latent_width)
            .map(|_| rng.sample(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(samples, shape, device)?)
    } else {
        device.set_seed(seed)?;
        Ok(Tensor::randn(0f32, 1f32, shape, device)?)
    }
}

/// Maps a repo-relative weight path to its fp16 variant when running at
/// reduced precision.
fn weight_file(name: &str, fp16: bool) -> String {
    if fp16 {
        name.replace(".safetensors", ".fp16.safetensors")
    } else {
        name.to_string()
    }
}
