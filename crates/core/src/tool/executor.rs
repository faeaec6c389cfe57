use std::collections::BTreeMap;
use std::future::ready;
use std::pin::Pin;

use futures_util::future::join_all;
use market_agent_model::{ModelTool, ToolCallRequest, ToolCallResult};
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

use crate::tool::{Error, ToolObject, ToolResult};

/// An executor that handles tool call requests from the model.
pub struct Executor {
    tools: BTreeMap<String, Box<dyn ToolObject>>,
}

impl Executor {
    pub fn with_tools(tools: Vec<Box<dyn ToolObject>>) -> Self {
        let mut tool_map = BTreeMap::new();
        for tool in tools {
            let name = tool.name().to_owned();
            if tool_map.insert(name, tool).is_some() {
                warn!("a tool was registered twice, keeping the last one");
            }
        }
        Self { tools: tool_map }
    }

    /// Returns the definitions of all tools, sorted by name.
    #[inline]
    pub fn definitions(&self) -> Vec<ModelTool> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    /// Spawns every request on the runtime. The requests run concurrently,
    /// their results are collected with [`Batch::join`].
    pub fn dispatch(&self, requests: &[ToolCallRequest]) -> Batch {
        let span = debug_span!("tool executor");
        let _enter = span.enter();

        let mut entries = Vec::with_capacity(requests.len());
        for req in requests {
            let fut: Pin<Box<dyn Future<Output = ToolResult> + Send>> =
                match self.tools.get(&req.name) {
                    Some(tool) => {
                        trace!(
                            "spawning a tool ({}) with args: {:?}",
                            req.id, req.arguments
                        );
                        tool.execute(req.arguments.clone())
                    }
                    None => {
                        warn!("tool not found: {}", req.name);
                        Box::pin(ready(Err(Error::unknown_tool(&req.name))))
                    }
                };
            let handle = tokio::spawn(fut.instrument(debug_span!(
                "tool execute",
                tool = %req.name,
                id = %req.id
            )));
            entries.push(Entry {
                request: req.clone(),
                handle,
            });
        }
        Batch { entries }
    }
}

struct Entry {
    request: ToolCallRequest,
    handle: JoinHandle<ToolResult>,
}

/// The running tool calls of one assistant message.
///
/// Dropping a batch aborts the calls that are still running.
pub struct Batch {
    entries: Vec<Entry>,
}

/// The outcome of one tool call.
#[derive(Debug)]
pub struct Completed {
    pub request: ToolCallRequest,
    pub result: ToolResult,
}

impl Completed {
    /// Renders the outcome as a message for the model. Errors become their
    /// textual description.
    pub fn to_message(&self) -> ToolCallResult {
        let content = match &self.result {
            Ok(content) => content.clone(),
            Err(err) => err.to_string(),
        };
        ToolCallResult {
            id: self.request.id.clone(),
            content,
        }
    }
}

impl Batch {
    /// Waits for every call and returns the outcomes in request order,
    /// regardless of completion order.
    pub async fn join(mut self) -> Vec<Completed> {
        let results =
            join_all(self.entries.iter_mut().map(|e| &mut e.handle)).await;
        std::mem::take(&mut self.entries)
            .into_iter()
            .zip(results)
            .map(|(entry, joined)| {
                let result = joined.unwrap_or_else(|err| {
                    Err(join_error(&entry.request.name, err))
                });
                Completed {
                    request: entry.request,
                    result,
                }
            })
            .collect()
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        for entry in &self.entries {
            if !entry.handle.is_finished() {
                debug!("aborting tool call {}", entry.request.id);
                entry.handle.abort();
            }
        }
    }
}

fn join_error(name: &str, err: JoinError) -> Error {
    let reason = if err.is_panic() {
        format!("Tool `{name}` failed unexpectedly")
    } else {
        format!("Tool `{name}` was cancelled")
    };
    error!("{reason}: {err}");
    Error::execution_error().with_reason(reason)
}
