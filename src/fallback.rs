use std::{collections::HashSet, env, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, BackendModel, BackendStream},
    classifier::{always_retry, retryable_by_status, ErrorHook, RetryPredicate},
    errors::FallbackError,
    forwarder,
    metrics::FallbackMetrics,
    models::{GenerateRequest, GenerateResponse},
    selection::SelectionState,
};

pub const DEFAULT_MODEL_RESET_INTERVAL: Duration = Duration::from_secs(3 * 60);

#[derive(Clone)]
pub struct FallbackOptions {
    pub on_error: Option<ErrorHook>,
    pub should_retry_this_error: RetryPredicate,
    pub retry_after_output: bool,
    pub model_reset_interval: Option<Duration>,
    pub metrics: Option<Arc<FallbackMetrics>>,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            on_error: None,
            should_retry_this_error: always_retry(),
            retry_after_output: false,
            model_reset_interval: Some(DEFAULT_MODEL_RESET_INTERVAL),
            metrics: None,
        }
    }
}

impl fmt::Debug for FallbackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackOptions")
            .field("on_error", &self.on_error.is_some())
            .field("retry_after_output", &self.retry_after_output)
            .field("model_reset_interval", &self.model_reset_interval)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl FallbackOptions {
    pub fn from_env() -> Self {
        let retry_after_output = env::var("FALLBACK_RETRY_AFTER_OUTPUT")
            .ok()
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let reset_secs = env::var("FALLBACK_MODEL_RESET_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_MODEL_RESET_INTERVAL.as_secs());
        let should_retry_this_error = match env::var("FALLBACK_RETRY_POLICY").as_deref() {
            Ok("status") => retryable_by_status(),
            _ => always_retry(),
        };

        Self {
            on_error: None,
            should_retry_this_error,
            retry_after_output,
            model_reset_interval: (reset_secs > 0).then(|| Duration::from_secs(reset_secs)),
            metrics: None,
        }
    }

    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BackendError, &str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BackendError) -> bool + Send + Sync + 'static,
    {
        self.should_retry_this_error = Arc::new(predicate);
        self
    }

    pub fn with_retry_after_output(mut self, enabled: bool) -> Self {
        self.retry_after_output = enabled;
        self
    }

    pub fn with_model_reset_interval(mut self, interval: Option<Duration>) -> Self {
        self.model_reset_interval = interval;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FallbackMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Clone)]
pub struct FallbackModel {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    models: Vec<Arc<dyn BackendModel>>,
    selection: SelectionState,
    options: FallbackOptions,
}

#[derive(Debug)]
pub(crate) struct CallAttempt {
    attempted: HashSet<usize>,
}

impl CallAttempt {
    fn new() -> Self {
        Self {
            attempted: HashSet::new(),
        }
    }
}

impl fmt::Debug for FallbackModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self
            .shared
            .models
            .iter()
            .map(|model| model.model_id())
            .collect::<Vec<_>>();
        f.debug_struct("FallbackModel")
            .field("models", &ids)
            .field("current_model_index", &self.current_model_index())
            .field("options", &self.shared.options)
            .finish()
    }
}

impl FallbackModel {
    pub fn new(
        models: Vec<Arc<dyn BackendModel>>,
        options: FallbackOptions,
    ) -> Result<Self, FallbackError> {
        if models.is_empty() {
            return Err(FallbackError::NoModels);
        }

        let selection = SelectionState::new(models.len());
        Ok(Self {
            shared: Arc::new(Shared {
                models,
                selection,
                options,
            }),
        })
    }

    pub fn models(&self) -> &[Arc<dyn BackendModel>] {
        &self.shared.models
    }

    pub fn current_model_index(&self) -> usize {
        self.shared.selection.current()
    }

    pub fn set_current_model_index(&self, index: usize) {
        self.shared.selection.set(index);
    }

    pub fn retry_after_output(&self) -> bool {
        self.shared.options.retry_after_output
    }

    pub fn model_reset_interval(&self) -> Option<Duration> {
        self.shared.options.model_reset_interval
    }
}

impl Shared {
    fn current_model(&self) -> &dyn BackendModel {
        self.models[self.selection.current()].as_ref()
    }

    fn check_reset(&self) {
        if self.selection.reset_if_due(self.options.model_reset_interval) {
            if let Some(metrics) = self.metrics() {
                metrics.observe_selection_reset();
            }
        }
    }

    pub(crate) fn metrics(&self) -> Option<&FallbackMetrics> {
        self.options.metrics.as_deref()
    }

    pub(crate) fn retry_after_output(&self) -> bool {
        self.options.retry_after_output
    }

    pub(crate) fn should_retry(&self, error: &BackendError) -> bool {
        (self.options.should_retry_this_error)(error)
    }

    pub(crate) fn model_id(&self, index: usize) -> &str {
        self.models[index].model_id()
    }

    /// Returns `true` once every backend has failed within this call; the
    /// cursor is then left on the primary backend.
    pub(crate) fn fail_over(
        &self,
        attempt: &mut CallAttempt,
        index: usize,
        error: &BackendError,
    ) -> bool {
        let model = &self.models[index];
        warn!(
            backend = %model.model_id(),
            provider = %model.provider(),
            index,
            error = %error,
            "backend failed, failing over"
        );
        if let Some(hook) = &self.options.on_error {
            hook(error, model.model_id());
        }
        if let Some(metrics) = self.metrics() {
            metrics.observe_failover(model.model_id());
        }

        attempt.attempted.insert(index);
        let next = self.selection.advance_from(index);
        if attempt.attempted.len() >= self.models.len() {
            self.selection.set(0);
            if let Some(metrics) = self.metrics() {
                metrics.observe_exhaustion();
            }
            warn!(
                attempted = attempt.attempted.len(),
                error = %error,
                "all backends failed"
            );
            return true;
        }

        debug!(next, backend = %self.model_id(next), "retrying with next backend");
        false
    }

    pub(crate) async fn acquire(
        &self,
        request: &GenerateRequest,
        attempt: &mut CallAttempt,
    ) -> Result<(usize, BackendStream), BackendError> {
        loop {
            let index = self.selection.current();
            match self.models[index].stream(request.clone()).await {
                Ok(handle) => {
                    debug!(backend = %self.model_id(index), index, "stream acquired");
                    return Ok((index, handle));
                }
                Err(error) => {
                    if !self.should_retry(&error) || self.fail_over(attempt, index, &error) {
                        return Err(error);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BackendModel for FallbackModel {
    fn model_id(&self) -> &str {
        self.shared.current_model().model_id()
    }

    fn provider(&self) -> &str {
        self.shared.current_model().provider()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, BackendError> {
        let shared = &self.shared;
        shared.check_reset();
        let mut attempt = CallAttempt::new();

        loop {
            let index = shared.selection.current();
            match shared.models[index].generate(request.clone()).await {
                Ok(response) => {
                    debug!(backend = %shared.model_id(index), index, "generate completed");
                    return Ok(response);
                }
                Err(error) => {
                    if !shared.should_retry(&error) || shared.fail_over(&mut attempt, index, &error)
                    {
                        return Err(error);
                    }
                }
            }
        }
    }

    async fn stream(&self, request: GenerateRequest) -> Result<BackendStream, BackendError> {
        self.shared.check_reset();
        let mut attempt = CallAttempt::new();
        let (index, handle) = self.shared.acquire(&request, &mut attempt).await?;
        Ok(forwarder::forward(
            self.shared.clone(),
            request,
            attempt,
            index,
            handle,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::backend::mock::{as_models, MockBackend};

    fn failing(id: &str, message: &str) -> Arc<MockBackend> {
        Arc::new(
            MockBackend::named(id).failing_generate(BackendError::Unavailable(message.to_owned())),
        )
    }

    fn healthy(id: &str) -> Arc<MockBackend> {
        Arc::new(MockBackend::named(id))
    }

    #[test]
    fn empty_model_list_is_rejected() {
        let error = FallbackModel::new(Vec::new(), FallbackOptions::default())
            .expect_err("no models should fail");
        assert_eq!(error, FallbackError::NoModels);
        assert_eq!(error.to_string(), "No models available");
    }

    #[test]
    fn identity_proxies_current_backend() {
        let models = [healthy("model1"), healthy("model2")];
        let fallback = FallbackModel::new(as_models(&models), FallbackOptions::default())
            .expect("fallback builds");
        assert_eq!(fallback.model_id(), "model1");
        assert_eq!(fallback.provider(), "provider-model1");

        fallback.set_current_model_index(1);
        assert_eq!(fallback.model_id(), "model2");
        assert_eq!(fallback.provider(), "provider-model2");
    }

    #[test]
    fn options_are_exposed() {
        let fallback = FallbackModel::new(
            as_models(&[healthy("model1")]),
            FallbackOptions::default()
                .with_retry_after_output(true)
                .with_model_reset_interval(Some(Duration::from_secs(120))),
        )
        .expect("fallback builds");
        assert!(fallback.retry_after_output());
        assert_eq!(fallback.model_reset_interval(), Some(Duration::from_secs(120)));
        assert_eq!(
            FallbackOptions::default().model_reset_interval,
            Some(DEFAULT_MODEL_RESET_INTERVAL)
        );
    }

    #[tokio::test]
    async fn failover_reports_each_error_in_order() {
        let models = [failing("A", "x"), failing("B", "y"), healthy("C")];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let fallback = FallbackModel::new(
            as_models(&models),
            FallbackOptions::default().with_on_error(move |error, model_id| {
                sink.lock()
                    .expect("hook lock")
                    .push((error.clone(), model_id.to_owned()));
            }),
        )
        .expect("fallback builds");

        let response = fallback
            .generate(GenerateRequest::user("ok"))
            .await
            .expect("third backend succeeds");

        assert_eq!(response.content, "Response from C: ok");
        assert_eq!(fallback.current_model_index(), 2);
        let seen = seen.lock().expect("hook lock").clone();
        assert_eq!(
            seen,
            vec![
                (BackendError::Unavailable("x".to_owned()), "A".to_owned()),
                (BackendError::Unavailable("y".to_owned()), "B".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn wraps_around_from_last_backend() {
        let models = [
            healthy("model1"),
            failing("model2", "overloaded"),
            failing("model3", "overloaded"),
        ];
        let fallback = FallbackModel::new(as_models(&models), FallbackOptions::default())
            .expect("fallback builds");
        fallback.set_current_model_index(2);

        let response = fallback
            .generate(GenerateRequest::user("hi"))
            .await
            .expect("wraps to first backend");

        assert_eq!(response.content, "Response from model1: hi");
        assert_eq!(models[2].generate_calls(), 1);
        assert_eq!(models[1].generate_calls(), 0);
        assert_eq!(fallback.current_model_index(), 0);
    }

    #[tokio::test]
    async fn exhaustion_and_failovers_are_counted() {
        let metrics = Arc::new(FallbackMetrics::new().expect("metrics register"));
        let models = [failing("model1", "down"), failing("model2", "down")];
        let fallback = FallbackModel::new(
            as_models(&models),
            FallbackOptions::default().with_metrics(metrics.clone()),
        )
        .expect("fallback builds");

        fallback
            .generate(GenerateRequest::user("hi"))
            .await
            .expect_err("every backend fails");

        let rendered = metrics.render().expect("metrics render");
        assert!(rendered.contains("fallback_failovers_total{backend=\"model1\"} 1"));
        assert!(rendered.contains("fallback_failovers_total{backend=\"model2\"} 1"));
        assert!(rendered.contains("fallback_exhaustions_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_reset_is_counted() {
        let metrics = Arc::new(FallbackMetrics::new().expect("metrics register"));
        let fallback = FallbackModel::new(
            as_models(&[healthy("model1"), healthy("model2")]),
            FallbackOptions::default()
                .with_model_reset_interval(Some(Duration::from_secs(60)))
                .with_metrics(metrics.clone()),
        )
        .expect("fallback builds");
        fallback.set_current_model_index(1);

        tokio::time::advance(Duration::from_secs(61)).await;
        fallback
            .generate(GenerateRequest::user("hi"))
            .await
            .expect("primary serves");

        assert_eq!(fallback.current_model_index(), 0);
        let rendered = metrics.render().expect("metrics render");
        assert!(rendered.contains("fallback_selection_resets_total 1"));
    }
}
