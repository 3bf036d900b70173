use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, BackendStream},
    fallback::{CallAttempt, Shared},
    models::{GenerateRequest, StreamPart},
};

enum Failure {
    Part(BackendError),
    Raised(BackendError),
}

impl Failure {
    fn error(&self) -> &BackendError {
        match self {
            Self::Part(error) | Self::Raised(error) => error,
        }
    }

    fn into_item(self) -> Result<StreamPart, BackendError> {
        match self {
            Self::Part(error) => Ok(StreamPart::Error { error }),
            Self::Raised(error) => Err(error),
        }
    }
}

pub(crate) fn forward(
    shared: Arc<Shared>,
    request: GenerateRequest,
    mut attempt: CallAttempt,
    mut index: usize,
    mut handle: BackendStream,
) -> BackendStream {
    let outbound = async_stream::stream! {
        let mut emitted_start = false;
        let mut emitted_any_output = false;

        loop {
            let mut failure = None;
            while let Some(next) = handle.next().await {
                match next {
                    Ok(StreamPart::Error { error }) => {
                        failure = Some(Failure::Part(error));
                        break;
                    }
                    Ok(StreamPart::Start) if emitted_start => {}
                    Ok(part) => {
                        emitted_start |= matches!(part, StreamPart::Start);
                        let finished = matches!(part, StreamPart::Finish { .. });
                        emitted_any_output |= part.is_output();
                        yield Ok::<StreamPart, BackendError>(part);
                        if finished {
                            break;
                        }
                    }
                    Err(error) => {
                        failure = Some(Failure::Raised(error));
                        break;
                    }
                }
            }

            let Some(failure) = failure else {
                debug!(backend = %shared.model_id(index), index, "stream completed");
                break;
            };

            let error = failure.error();
            if error.is_abort() {
                debug!(backend = %shared.model_id(index), "backend stream aborted");
                break;
            }
            if !shared.should_retry(error) {
                yield failure.into_item();
                break;
            }
            if emitted_any_output && !shared.retry_after_output() {
                warn!(
                    backend = %shared.model_id(index),
                    error = %error,
                    "stream failed after output, not retrying"
                );
                if let Some(metrics) = shared.metrics() {
                    metrics.observe_output_refusal(shared.model_id(index));
                }
                yield failure.into_item();
                break;
            }
            if shared.fail_over(&mut attempt, index, error) {
                yield failure.into_item();
                break;
            }

            drop(std::mem::replace(&mut handle, stream::empty().boxed()));
            match shared.acquire(&request, &mut attempt).await {
                Ok((next_index, next_handle)) => {
                    index = next_index;
                    handle = next_handle;
                }
                Err(error) => {
                    yield Err(error);
                    break;
                }
            }
        }
    };

    outbound.boxed()
}
