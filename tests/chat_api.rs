use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use llm_fallback_gateway::{
    backend::mock::{as_models, MockBackend, StreamFault},
    build_app,
    fallback::FallbackOptions,
    state::AppState,
    BackendError,
};
use tower::util::ServiceExt;

fn app_with(backends: &[Arc<MockBackend>]) -> Router {
    let state = AppState::new(as_models(backends), FallbackOptions::default())
        .expect("state builds");
    build_app(state)
}

fn chat_request(body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request build")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    String::from_utf8(bytes.to_vec()).expect("response body should be UTF-8")
}

fn overloaded(id: &str) -> Arc<MockBackend> {
    Arc::new(
        MockBackend::named(id).failing_generate(BackendError::Unavailable("overloaded".to_owned())),
    )
}

#[tokio::test]
async fn rejects_empty_message_list() {
    let app = app_with(&[Arc::new(MockBackend::named("model1"))]);

    let response = app
        .oneshot(chat_request(r#"{"messages":[]}"#))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn one_shot_fails_over_and_records_metric() {
    let app = app_with(&[overloaded("model1"), Arc::new(MockBackend::named("model2"))]);

    let response = app
        .clone()
        .oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"hello"}],"stream":false}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-backend-model")
            .and_then(|value| value.to_str().ok()),
        Some("model2")
    );
    let body = body_text(response).await;
    assert!(body.contains("\"chat.completion\""));
    assert!(body.contains("Response from model2: hello"));

    let metrics = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("metrics request");
    let rendered = body_text(metrics).await;
    assert!(rendered.contains("fallback_failovers_total{backend=\"model1\"} 1"));
}

#[tokio::test]
async fn exhausted_backends_map_to_bad_gateway() {
    let app = app_with(&[overloaded("model1"), overloaded("model2")]);

    let response = app
        .oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"hello"}]}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_text(response).await;
    assert!(body.contains("backend_error"));
}

#[tokio::test]
async fn stream_is_served_by_fallback_backend() {
    let first = Arc::new(
        MockBackend::named("model1")
            .with_token_delay(Duration::ZERO)
            .failing_acquire(BackendError::Timeout("connect".to_owned())),
    );
    let second = Arc::new(MockBackend::named("model2").with_token_delay(Duration::ZERO));
    let app = app_with(&[first, second]);

    let response = app
        .oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"hello"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("\"chat.completion.chunk\""));
    assert!(body.contains("\"model\":\"model2\""));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.contains("[DONE]"));
}

#[tokio::test]
async fn stream_response_has_no_backend_header() {
    let app = app_with(&[Arc::new(
        MockBackend::named("model1").with_token_delay(Duration::ZERO),
    )]);

    let response = app
        .oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"hello"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-backend-model").is_none());
}

#[tokio::test]
async fn stream_error_after_output_becomes_error_event() {
    let first = Arc::new(
        MockBackend::named("model1")
            .with_token_delay(Duration::ZERO)
            .with_stream_fault(StreamFault::Raise {
                after_parts: 2,
                error: BackendError::Unavailable("connection reset".to_owned()),
            }),
    );
    let second = Arc::new(MockBackend::named("model2").with_token_delay(Duration::ZERO));
    let app = app_with(&[first, second.clone()]);

    let response = app
        .oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"hello"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    let body = body_text(response).await;
    assert!(body.contains("connection reset"));
    assert!(body.contains("[DONE]"));
    assert_eq!(second.stream_calls(), 0);
}

#[tokio::test]
async fn refused_stream_failover_is_counted() {
    let first = Arc::new(
        MockBackend::named("model1")
            .with_token_delay(Duration::ZERO)
            .with_stream_fault(StreamFault::Raise {
                after_parts: 2,
                error: BackendError::Unavailable("connection reset".to_owned()),
            }),
    );
    let app = app_with(&[first, Arc::new(MockBackend::named("model2"))]);

    let response = app
        .clone()
        .oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"hello"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");
    body_text(response).await;

    let metrics = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("metrics request");
    let rendered = body_text(metrics).await;
    assert!(rendered.contains("fallback_output_refusals_total{backend=\"model1\"} 1"));
}
