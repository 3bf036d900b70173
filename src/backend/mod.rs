pub mod mock;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::{GenerateRequest, GenerateResponse, StreamPart};

pub type BackendStream = BoxStream<'static, Result<StreamPart, BackendError>>;

/// One interchangeable model endpoint.
///
/// `stream` either fails before producing anything, or returns a handle that
/// may still end abnormally (an `Err` item or a `StreamPart::Error`) after
/// yielding some parts.
#[async_trait]
pub trait BackendModel: Send + Sync {
    fn model_id(&self) -> &str;
    fn provider(&self) -> &str;
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, BackendError>;
    async fn stream(&self, request: GenerateRequest) -> Result<BackendStream, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("the operation was aborted")]
    Aborted,
}

impl BackendError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
