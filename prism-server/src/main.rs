use anyhow::Result;
use clap::Parser;
use hf_hub::api::tokio::Api;
use prism_core::{
    BoxedModel, DeviceMap, LoadFn, Loader, ModelHandle, SdxlLoader,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tracing_subscriber::EnvFilter;

mod app;

use app::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Prism text-to-image demo server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model to serve
    #[arg(long, default_value = "stabilityai/stable-diffusion-xl-base-1.0")]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 7860)]
    port: u16,

    /// Maximum number of requests processed or queued concurrently
    #[arg(long, default_value_t = 10)]
    max_threads: usize,

    /// Do not expose the API self-description route
    #[arg(long)]
    hide_api: bool,
}

/// Loader capability backed by the Hugging Face hub.
fn hub_loader(api: Api, model_id: String, device_map: DeviceMap) -> LoadFn {
    Box::new(move || {
        let api = api.clone();
        let model_id = model_id.clone();
        Box::pin(async move {
            let model = SdxlLoader::load(model_id, api, device_map).await?;
            Ok(Arc::new(model) as BoxedModel)
        })
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };

    let load = hub_loader(Api::new()?, args.model.clone(), device_map);
    let state = Arc::new(AppState::new(ModelHandle::empty(), load));

    // Warm the model before accepting traffic. A failure here is logged and
    // retried on the first request instead of killing the process.
    if let Err(e) = state.preload().await {
        tracing::warn!("model preload failed, will retry on first request: {e}");
    }

    let app = app::router(Arc::clone(&state), !args.hide_api)
        .layer(GlobalConcurrencyLimitLayer::new(args.max_threads));

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
