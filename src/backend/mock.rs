use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::backend::{BackendError, BackendModel, BackendStream};
use crate::models::{GenerateRequest, GenerateResponse, StreamPart, Usage};

#[derive(Debug, Clone)]
pub enum StreamFault {
    ErrorPart { after_parts: usize, error: BackendError },
    Raise { after_parts: usize, error: BackendError },
}

impl StreamFault {
    fn after_parts(&self) -> usize {
        match self {
            Self::ErrorPart { after_parts, .. } | Self::Raise { after_parts, .. } => *after_parts,
        }
    }

    fn into_item(self) -> Result<StreamPart, BackendError> {
        match self {
            Self::ErrorPart { error, .. } => Ok(StreamPart::Error { error }),
            Self::Raise { error, .. } => Err(error),
        }
    }
}

#[derive(Debug)]
pub struct MockBackend {
    model_id: String,
    provider: String,
    token_delay: Duration,
    emit_start: bool,
    generate_failure: Option<BackendError>,
    acquire_failure: Option<BackendError>,
    stream_fault: Option<StreamFault>,
    generate_calls: Arc<AtomicUsize>,
    stream_calls: Arc<AtomicUsize>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            model_id: "mock-backend".to_owned(),
            provider: "mock".to_owned(),
            token_delay: Duration::from_millis(35),
            emit_start: true,
            generate_failure: None,
            acquire_failure: None,
            stream_fault: None,
            generate_calls: Arc::new(AtomicUsize::new(0)),
            stream_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockBackend {
    pub fn named(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self {
            provider: format!("provider-{model_id}"),
            model_id,
            ..Self::default()
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn without_start(mut self) -> Self {
        self.emit_start = false;
        self
    }

    pub fn failing_generate(mut self, error: BackendError) -> Self {
        self.generate_failure = Some(error);
        self
    }

    pub fn failing_acquire(mut self, error: BackendError) -> Self {
        self.acquire_failure = Some(error);
        self
    }

    pub fn with_stream_fault(mut self, fault: StreamFault) -> Self {
        self.stream_fault = Some(fault);
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn script(&self, request: &GenerateRequest) -> Vec<StreamPart> {
        let content = render_response(&self.model_id, request);
        let usage = estimate_usage(request, &content);
        let mut parts = Vec::new();
        if self.emit_start {
            parts.push(StreamPart::Start);
        }
        parts.extend(split_for_stream(&content).into_iter().map(StreamPart::text));
        parts.push(StreamPart::Finish {
            reason: "stop".to_owned(),
            usage,
        });
        parts
    }
}

#[async_trait]
impl BackendModel for MockBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, BackendError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.generate_failure {
            return Err(error.clone());
        }

        let content = render_response(&self.model_id, &request);
        let usage = estimate_usage(&request, &content);

        Ok(GenerateResponse {
            content,
            finish_reason: "stop".to_owned(),
            usage,
        })
    }

    async fn stream(&self, request: GenerateRequest) -> Result<BackendStream, BackendError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.acquire_failure {
            return Err(error.clone());
        }

        let mut parts = self.script(&request);
        let fault = self.stream_fault.clone();
        if let Some(fault) = &fault {
            parts.truncate(fault.after_parts());
        }
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for part in parts {
                if tx.send(Ok(part)).await.is_err() {
                    return;
                }
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }

            if let Some(fault) = fault {
                let _ = tx.send(fault.into_item()).await;
            }
        });

        debug!(backend = %self.model_id, "stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }
}

pub fn as_models(backends: &[Arc<MockBackend>]) -> Vec<Arc<dyn BackendModel>> {
    backends
        .iter()
        .map(|backend| backend.clone() as Arc<dyn BackendModel>)
        .collect()
}

fn render_response(model_id: &str, request: &GenerateRequest) -> String {
    let prompt = request.last_user_prompt().unwrap_or("hello");
    format!("Response from {model_id}: {prompt}")
}

fn estimate_usage(request: &GenerateRequest, completion: &str) -> Usage {
    let prompt_tokens = request
        .messages
        .iter()
        .map(|message| rough_token_estimate(&message.content))
        .sum::<u32>();
    let completion_tokens = rough_token_estimate(completion);
    Usage::new(prompt_tokens, completion_tokens)
}

fn rough_token_estimate(text: &str) -> u32 {
    if text.trim().is_empty() {
        return 0;
    }
    text.split_whitespace().count() as u32
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}
