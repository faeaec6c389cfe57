use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use market_agent_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
    ToolCallRequest,
};
use pin_project_lite::pin_project;
use serde_json::Value;

use crate::Error;
use crate::io::{Sse, SseError};
use crate::proto::{ChatCompletionChunk, ToolCall};

struct PartialState {
    sse: Sse,
    id: Option<String>,
    // Tool calls arrive in fragments keyed by `index`, they are only complete
    // once the stream has finished.
    tool_calls: Vec<ToolCall>,
    finished: bool,
    finish_reason: Option<ModelFinishReason>,
    // Events ready to be handed out once the stream has finished.
    trailing_events: VecDeque<ModelResponseEvent>,
}

impl PartialState {
    fn finish(&mut self) {
        self.finished = true;
        let tool_calls = std::mem::take(&mut self.tool_calls);
        self.trailing_events.extend(
            tool_calls
                .into_iter()
                .map(create_tool_call_request)
                .map(ModelResponseEvent::ToolCall),
        );
        let has_tool_calls = !self.trailing_events.is_empty();
        let reason = match self.finish_reason.take() {
            Some(reason) => reason,
            None if has_tool_calls => ModelFinishReason::ToolCalls,
            None => ModelFinishReason::Stop,
        };
        self.trailing_events
            .push_back(ModelResponseEvent::Completed(reason));
    }
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl OpenAIResponse {
    #[inline]
    pub fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            id: None,
            tool_calls: Default::default(),
            finished: false,
            finish_reason: None,
            trailing_events: Default::default(),
        };
        Self {
            next_event_fut: Some(Box::pin(next_event(partial_state))),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        *this.next_event_fut = Some(Box::pin(next_event(partial_state)));
        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(mut partial_state: PartialState) -> NextEvent {
    loop {
        if partial_state.finished {
            let event = partial_state.trailing_events.pop_front();
            return Ok((event, partial_state));
        }

        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                partial_state.finish();
                continue;
            }
            Err(SseError::ChunksError(err)) => {
                return Err(Error::new(
                    format!("response stream broke off: {}", err.0),
                    ErrorKind::Unavailable,
                ));
            }
            Err(err) => {
                return Err(Error::new(format!("{err:?}"), ErrorKind::Other));
            }
        };
        trace!("got sse event: {sse_event}");
        if sse_event == "[DONE]" {
            partial_state.finish();
            continue;
        }

        let mut chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event)
            .map_err(|err| Error::new(format!("{err}"), ErrorKind::Other))?;
        if partial_state.id.get_or_insert_with(|| chunk.id.clone()) != &chunk.id
        {
            return Err(Error::new("chunk id mismatch", ErrorKind::Other));
        }

        let Some(choice) = chunk.choices.pop() else {
            continue;
        };

        if let Some(tool_calls) = choice.delta.tool_calls {
            merge_tool_calls(&mut partial_state.tool_calls, tool_calls);
        }
        if let Some(finish_reason) = choice.finish_reason {
            partial_state.finish_reason = Some(match finish_reason.as_str() {
                "tool_calls" => ModelFinishReason::ToolCalls,
                "length" => ModelFinishReason::Length,
                _ => ModelFinishReason::Stop,
            });
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                return Ok((
                    Some(ModelResponseEvent::MessageDelta(content)),
                    partial_state,
                ));
            }
        }
    }
}

fn merge_tool_calls(partials: &mut Vec<ToolCall>, fragments: Vec<ToolCall>) {
    for fragment in fragments {
        let Some(partial) = partials
            .iter_mut()
            .find(|t| fragment.index.is_some() && t.index == fragment.index)
        else {
            partials.push(fragment);
            continue;
        };
        if let Some(id) = fragment.id {
            partial.id.get_or_insert_default().push_str(&id);
        }
        if let Some(ty) = fragment.r#type {
            partial.r#type.get_or_insert_default().push_str(&ty);
        }
        let Some(function) = fragment.function else {
            continue;
        };
        match partial.function {
            Some(ref mut partial_func) => {
                if let Some(name) = function.name {
                    partial_func.name.get_or_insert_default().push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    partial_func
                        .arguments
                        .get_or_insert_default()
                        .push_str(&arguments);
                }
            }
            None => partial.function = Some(function),
        }
    }
}

fn create_tool_call_request(tool_call: ToolCall) -> ToolCallRequest {
    let (name, arguments) = match tool_call.function {
        Some(function) => (function.name, function.arguments),
        None => (None, None),
    };
    // Malformed arguments are passed on as a string, the tool executor
    // reports them back to the model as invalid input.
    let arguments = match arguments.as_deref().map(str::trim) {
        None | Some("") => Value::Object(Default::default()),
        Some(raw) => serde_json::from_str(raw)
            .unwrap_or_else(|_| Value::String(raw.to_owned())),
    };
    ToolCallRequest::new(
        tool_call.id.unwrap_or_default(),
        name.unwrap_or_default(),
        arguments,
    )
}
