use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{Error, GenerationRequest, GenerationResult, ModelLike};

pub type BoxedModel = Arc<dyn ModelLike>;
pub type LoadFuture = Pin<Box<dyn Future<Output = anyhow::Result<BoxedModel>> + Send>>;
pub type LoadFn = Box<dyn Fn() -> LoadFuture + Send + Sync>;

/// Lock-guarded, lazily initialized slot for the loaded pipeline.
///
/// The mutex is held across the load future, so concurrent requests that all
/// find the slot empty trigger exactly one load attempt and the rest wait for
/// its outcome. A failed load leaves the slot empty; the next request retries.
/// Generation itself runs outside the lock.
pub struct ModelHandle {
    slot: Mutex<Option<BoxedModel>>,
}

impl ModelHandle {
    pub fn empty() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn preloaded(model: BoxedModel) -> Self {
        Self {
            slot: Mutex::new(Some(model)),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Returns the loaded model, running `load` first if the slot is empty.
    pub async fn get_or_load<F>(&self, load: F) -> Result<BoxedModel, Error>
    where
        F: FnOnce() -> LoadFuture,
    {
        let mut slot = self.slot.lock().await;
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }
        match load().await {
            Ok(model) => {
                *slot = Some(Arc::clone(&model));
                Ok(model)
            }
            Err(e) => {
                tracing::error!("model load failed: {e:#}");
                Err(Error::ModelLoad(format!("{e:#}")))
            }
        }
    }

    /// The inference adapter: ensures a model is loaded, resolves the seed,
    /// and runs the pipeline on a blocking thread. Pipeline errors come back
    /// as [`Error::Generation`] with the original message; there is no retry
    /// and no partial result.
    pub async fn generate<F>(
        &self,
        request: GenerationRequest,
        load: F,
    ) -> Result<GenerationResult, Error>
    where
        F: FnOnce() -> LoadFuture,
    {
        let model = self.get_or_load(load).await?;
        let seed = request.resolve_seed();
        tracing::info!(
            seed,
            num_outputs = request.num_outputs,
            prompt = %request.prompt.chars().take(50).collect::<String>(),
            "generating images"
        );
        let images = tokio::task::spawn_blocking(move || model.run(&request, seed))
            .await
            .map_err(|e| Error::Generation(e.to_string()))?
            .map_err(|e| {
                tracing::error!("image generation failed: {e:#}");
                Error::Generation(format!("{e:#}"))
            })?;
        tracing::info!(count = images.len(), "generation finished");
        Ok(GenerationResult { images, seed })
    }
}
