use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gerador_core::{load_model, DeviceMap, ModelCache, ModelSource, Precision, DEFAULT_MODEL_ID};
use hf_hub::api::tokio::Api;
use tokio::{self, net::TcpListener};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod error;
mod page;

use app::{build_router, AppState, GenerationDefaults};

/// Loaded pipeline, shared by every request for the life of the process.
static MODEL: ModelCache = ModelCache::new();

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Gerador image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Hugging Face model id to load
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Weight precision: auto, f16 or f32
    #[arg(long, default_value_t = Precision::Auto)]
    precision: Precision,

    /// Use flash attention in the UNet (requires the `flash-attn` feature)
    #[arg(long)]
    use_flash_attn: bool,

    /// Default number of denoising steps
    #[arg(long)]
    steps: Option<usize>,

    /// Default classifier-free guidance scale
    #[arg(long)]
    guidance: Option<f64>,

    /// Default image width, a multiple of 8
    #[arg(long)]
    width: Option<usize>,

    /// Default image height, a multiple of 8
    #[arg(long)]
    height: Option<usize>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let source = ModelSource::from_model_id(&args.model)?
        .with_precision(args.precision)
        .with_flash_attn(args.use_flash_attn);
    let device_map = DeviceMap::from_cpu_flag(args.cpu);
    let api = Api::new().context("failed to create hf hub API")?;

    // Load failures are fatal: nothing is served without a model.
    let model = MODEL
        .get_or_load(|| load_model(source, api, device_map))
        .await
        .context("failed to load model")?;

    let defaults = GenerationDefaults {
        width: args.width,
        height: args.height,
        steps: args.steps,
        guidance: args.guidance,
    };
    let app = build_router(AppState::new(Arc::clone(&model), defaults)?);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args() {
        let args = Args::parse_from(["gerador-server"]);
        assert_eq!(args.model, "runwayml/stable-diffusion-v1-5");
        assert_eq!(args.precision, Precision::Auto);
        assert_eq!(args.port, 8000);
        assert!(!args.cpu);
        assert_eq!(args.steps, None);
    }

    #[test]
    fn parses_overrides() {
        let args = Args::parse_from([
            "gerador-server",
            "--cpu",
            "--precision",
            "f32",
            "--steps",
            "20",
            "--width",
            "256",
            "--port",
            "9000",
        ]);
        assert!(args.cpu);
        assert_eq!(args.precision, Precision::F32);
        assert_eq!(args.steps, Some(20));
        assert_eq!(args.width, Some(256));
        assert_eq!(args.port, 9000);
    }
}
