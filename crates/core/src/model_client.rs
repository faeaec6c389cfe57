use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use market_agent_model::{
    AssistantMessage, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tracing::Instrument;

use crate::retry::RetryPolicy;

pub(crate) type ProviderError = Box<dyn ModelProviderError>;
type SendRequestResult = Result<ModelClientResponse, ProviderError>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
pub(crate) type DeltaFn = Arc<dyn Fn(&str) + Send + Sync>;
#[rustfmt::skip]
type HandlerFn = Arc<
    dyn Fn(&ModelRequest, DeltaFn) -> BoxedSendRequestFuture + Send + Sync
>;

/// A wrapper around a model provider that aggregates streamed responses
/// into whole messages and provides a type-erased interface for the other
/// modules.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
}

impl ModelClient {
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // We have to erase the type `P`, since `ModelClient` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn =
            Arc::new(move |req: &ModelRequest, on_delta: DeltaFn| {
                let fut = provider.send_request(req);
                Box::pin(
                    async move {
                        let resp_or_err = fut.await;
                        handle_response::<P>(resp_or_err, on_delta).await
                    }
                    .instrument(trace_span!("model client req")),
                )
            });
        Self { handler_fn }
    }

    /// Sends a request once and returns the aggregated response.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when the returned future is dropped.
    #[inline]
    pub fn send_request(
        &self,
        req: &ModelRequest,
        on_delta: DeltaFn,
    ) -> BoxedSendRequestFuture {
        trace!("sending a request: {req:?}");
        (self.handler_fn)(req, on_delta)
    }

    /// Sends a request, retrying retryable failures as configured by
    /// `policy`.
    ///
    /// A response that fails after streaming part of its text is not
    /// retried, `on_delta` sees each piece of the answer at most once.
    pub async fn send_request_with_retry(
        &self,
        req: &ModelRequest,
        policy: &RetryPolicy,
        on_delta: DeltaFn,
    ) -> SendRequestResult {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0;
        let operation = || {
            attempts += 1;
            let attempt = attempts;
            let streamed = Arc::new(AtomicBool::new(false));
            let attempt_on_delta: DeltaFn = {
                let streamed = Arc::clone(&streamed);
                let on_delta = Arc::clone(&on_delta);
                Arc::new(move |delta: &str| {
                    streamed.store(true, Ordering::Relaxed);
                    on_delta(delta);
                })
            };
            let fut = self.send_request(req, attempt_on_delta);
            async move {
                fut.await.map_err(|err| {
                    // A partly streamed answer is never replayed.
                    if streamed.load(Ordering::Relaxed) {
                        debug!("not retrying, the answer was partly streamed");
                        return backoff::Error::permanent(err);
                    }
                    if err.kind().is_retryable() && attempt < max_attempts {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        };
        let notify = |err: ProviderError, delay: Duration| {
            warn!("model request failed ({err}), retrying in {delay:?}");
        };
        backoff::future::retry_notify(policy.backoff(), operation, notify).await
    }
}

/// A completely received response from the model client.
#[derive(Clone, Debug)]
pub struct ModelClientResponse {
    /// The aggregated message, including its tool calls.
    pub message: AssistantMessage,
    /// The reason the model finished generating.
    pub finish_reason: Option<ModelFinishReason>,
}

async fn handle_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
    on_delta: DeltaFn,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            debug!("got an error: {err:?}");
            return Err(Box::new(err));
        }
    };

    let mut message = AssistantMessage::default();
    let mut finish_reason = None;

    trace!("start receiving events");

    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) => {
                debug!("got an error while streaming: {err:?}");
                return Err(Box::new(err));
            }
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::MessageDelta(delta) => {
                on_delta(&delta);
                message.content.push_str(&delta);
            }
            ModelResponseEvent::ToolCall(req) => {
                message.tool_calls.push(req);
            }
            ModelResponseEvent::Completed(reason) => {
                finish_reason = Some(reason);
            }
        }
    }

    trace!("finished a request");

    Ok(ModelClientResponse {
        message,
        finish_reason,
    })
}
