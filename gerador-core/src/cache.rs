use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::OnceCell;
use tracing::info;

use crate::ModelLike;

/// Process-wide slot holding the loaded pipeline.
///
/// The loader runs at most once, even when several callers race on the first
/// access. A failed load leaves the slot empty so the error reaches the caller.
pub struct ModelCache {
    model: OnceCell<Arc<dyn ModelLike>>,
}

impl ModelCache {
    pub const fn new() -> Self {
        Self {
            model: OnceCell::const_new(),
        }
    }

    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<Arc<dyn ModelLike>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ModelLike>>>,
    {
        let model = self
            .model
            .get_or_try_init(|| async move {
                info!("model not cached yet, loading");
                load().await
            })
            .await?;
        Ok(Arc::clone(model))
    }

    #[cfg(test)]
    fn get(&self) -> Option<Arc<dyn ModelLike>> {
        self.model.get().cloned()
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}
