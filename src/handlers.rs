use std::{
    convert::Infallible,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    backend::BackendModel,
    errors::{error_envelope, AppError},
    models::{ChatCompletionsRequest, ChatCompletionsResponse, Delta, GenerateRequest, StreamPart},
    state::AppState,
};

const BACKEND_HEADER: &str = "x-backend-model";

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionsRequest>,
) -> Response {
    let stream = request.stream;
    let response = match process_chat_completions(state.clone(), request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    state.metrics.observe_request(stream, response.status().as_u16());
    response
}

async fn process_chat_completions(
    state: AppState,
    request: ChatCompletionsRequest,
) -> Result<Response, AppError> {
    let stream = request.stream;
    let requested_model = request.model.clone();
    let generate = request.into_generate().map_err(AppError::BadRequest)?;
    info!(
        request_id = %generate.request_id,
        requested_model = %requested_model.as_deref().unwrap_or_default(),
        stream,
        messages = generate.messages.len(),
        "chat request accepted"
    );

    if stream {
        stream_completion(state, generate).await
    } else {
        one_shot_completion(state, generate).await
    }
}

async fn one_shot_completion(
    state: AppState,
    request: GenerateRequest,
) -> Result<Response, AppError> {
    let created = unix_timestamp();
    let response_id = format!("chatcmpl-{}", Uuid::new_v4());

    let generated = state.model.generate(request).await?;
    let served_by = state.model.model_id().to_owned();

    let payload =
        ChatCompletionsResponse::completion(response_id, created, served_by.clone(), generated);
    let mut response = Json(payload).into_response();
    apply_header(response.headers_mut(), BACKEND_HEADER, &served_by);
    Ok(response)
}

// Chunks carry whichever backend is selected when they are sent; the
// backend can change mid-stream, so no x-backend-model header is set.
async fn stream_completion(
    state: AppState,
    request: GenerateRequest,
) -> Result<Response, AppError> {
    let created = unix_timestamp();
    let response_id = format!("chatcmpl-{}", Uuid::new_v4());
    let mut parts = state.model.stream(request).await?;
    let model = state.model.clone();

    let outbound = async_stream::stream! {
        let chunk = |delta: Delta, finish: Option<String>| {
            let served_by = model.model_id();
            json_event(ChatCompletionsResponse::chunk(
                &response_id,
                created,
                served_by,
                delta,
                finish,
            ))
        };
        let mut emitted_role = false;
        while let Some(next) = parts.next().await {
            let error = match next {
                Ok(StreamPart::Start) => {
                    if !emitted_role {
                        emitted_role = true;
                        yield Ok::<Event, Infallible>(chunk(Delta::role(), None));
                    }
                    continue;
                }
                Ok(StreamPart::TextDelta { text }) => {
                    if !emitted_role {
                        emitted_role = true;
                        yield Ok::<Event, Infallible>(chunk(Delta::role(), None));
                    }
                    yield Ok::<Event, Infallible>(chunk(Delta::text(text), None));
                    continue;
                }
                Ok(StreamPart::Finish { reason, usage }) => {
                    info!(
                        backend = %model.model_id(),
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        total_tokens = usage.total_tokens,
                        "stream usage summary"
                    );
                    yield Ok::<Event, Infallible>(chunk(Delta::default(), Some(reason)));
                    continue;
                }
                Ok(StreamPart::Error { error }) | Err(error) => error,
            };

            warn!(error = %error, "backend stream error");
            let envelope = error_envelope("backend_error", error.to_string());
            yield Ok::<Event, Infallible>(Event::default().data(envelope.to_string()));
            break;
        }

        yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response())
}

fn apply_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(header_name, header_value);
}

fn json_event<T: serde::Serialize>(payload: T) -> Event {
    match serde_json::to_string(&payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => Event::default().data(
            error_envelope("server_error", format!("serialization error: {error}")).to_string(),
        ),
    }
}

fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}
