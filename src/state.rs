use std::sync::Arc;

use crate::{
    backend::BackendModel,
    errors::FallbackError,
    fallback::{FallbackModel, FallbackOptions},
    metrics::FallbackMetrics,
};

#[derive(Clone)]
pub struct AppState {
    pub model: FallbackModel,
    pub metrics: Arc<FallbackMetrics>,
}

impl AppState {
    pub fn new(
        models: Vec<Arc<dyn BackendModel>>,
        options: FallbackOptions,
    ) -> Result<Self, FallbackError> {
        let metrics = FallbackMetrics::new()
            .map(Arc::new)
            .map_err(|error| FallbackError::Metrics(error.to_string()))?;
        let model = FallbackModel::new(models, options.with_metrics(metrics.clone()))?;
        Ok(Self { model, metrics })
    }
}
