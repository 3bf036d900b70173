pub mod backend;
pub mod classifier;
pub mod errors;
pub mod fallback;
mod forwarder;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod selection;
pub mod state;

use std::{env, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use backend::{mock::MockBackend, BackendModel};
use fallback::FallbackOptions;
use tracing::info;

pub use backend::{BackendError, BackendStream};
pub use errors::FallbackError;
pub use fallback::FallbackModel;
pub use models::{GenerateRequest, GenerateResponse, StreamPart};

pub fn build_state() -> Result<state::AppState, FallbackError> {
    let names = env::var("GATEWAY_BACKENDS").unwrap_or_else(|_| "mock-a,mock-b".to_owned());
    let backends = names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| Arc::new(MockBackend::named(name)) as Arc<dyn BackendModel>)
        .collect::<Vec<_>>();

    let options = FallbackOptions::from_env();
    info!(
        backends = %names,
        retry_after_output = options.retry_after_output,
        reset_interval_secs = options.model_reset_interval.map(|interval| interval.as_secs()),
        "fallback model configured"
    );
    state::AppState::new(backends, options)
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .with_state(state)
}
