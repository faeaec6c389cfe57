use std::sync::{Arc, Mutex};
use std::time::Duration;

use market_agent_model::{ModelMessage, Role};
use market_agent_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::tool::{Error as ToolError, Tool, ToolResult};
use crate::{AgentBuilder, AgentEvent, Conversation, ErrorKind, RetryPolicy};

static QUERY_SCHEMA: Value = Value::Null;

#[derive(Deserialize)]
struct QueryInput {
    query: String,
}

/// Answers after a fixed delay, or fails when `fail` is set.
struct FakeTool {
    name: &'static str,
    delay: Duration,
    fail: bool,
}

impl FakeTool {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            delay: Duration::from_millis(1),
            fail: false,
        }
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Tool for FakeTool {
    type Input = QueryInput;

    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "A fake tool"
    }

    fn parameter_schema(&self) -> &Value {
        &QUERY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let name = self.name;
        let delay = self.delay;
        let fail = self.fail;
        async move {
            tokio::time::sleep(delay).await;
            if fail {
                return Err(ToolError::execution_error().with_reason(format!(
                    "Error accessing {name}: connection reset"
                )));
            }
            Ok(format!("{name} result for {}", input.query))
        }
    }
}

fn system_prompt() -> String {
    "You are a financial assistant.".to_owned()
}

fn roles(conversation: &Conversation) -> Vec<Role> {
    conversation.messages().iter().map(|m| m.role()).collect()
}

fn tool_results(conversation: &Conversation) -> Vec<(String, String)> {
    conversation
        .messages()
        .iter()
        .filter_map(|m| match m {
            ModelMessage::Tool(result) => {
                Some((result.id.clone(), result.content.clone()))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_single_system_message_across_turns() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::text("Hello!"));
    model_provider.add_response(PresetResponse::text("Still here."));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_system_prompt(system_prompt)
        .build();
    let cancel = CancellationToken::new();
    let mut conversation = Conversation::new();

    let answer = agent.run(&mut conversation, "Hi", &cancel).await.unwrap();
    assert_eq!(answer, "Hello!");
    let answer = agent
        .run(&mut conversation, "Are you there?", &cancel)
        .await
        .unwrap();
    assert_eq!(answer, "Still here.");

    assert_eq!(
        roles(&conversation),
        [
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant
        ]
    );
    for req in model_provider.requests() {
        let systems = req
            .messages
            .iter()
            .filter(|m| m.role() == Role::System)
            .count();
        assert_eq!(systems, 1);
        assert_eq!(req.messages[0].role(), Role::System);
    }
}

#[tokio::test]
async fn test_failing_tool_does_not_abort_the_turn() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call(
            "call_aapl",
            "polygon_financials_tool",
            json!({ "query": "AAPL" }),
        ),
    ]));
    model_provider.add_response(PresetResponse::text(
        "Sorry, I couldn't fetch the AAPL price right now.",
    ));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_system_prompt(system_prompt)
        .with_tool(FakeTool::new("polygon_financials_tool").failing())
        .build();
    let mut conversation = Conversation::new();
    let answer = agent
        .run(
            &mut conversation,
            "What is AAPL trading at?",
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(answer, "Sorry, I couldn't fetch the AAPL price right now.");
    assert_eq!(
        roles(&conversation),
        [
            Role::System,
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Assistant
        ]
    );
    let results = tool_results(&conversation);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "call_aapl");
    assert!(!results[0].1.is_empty());
    assert!(results[0].1.contains("Error accessing"));

    // The second request already carries the tool result.
    let requests = model_provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.last().map(|m| m.role()), Some(Role::Tool));
    assert_eq!(requests[1].tools.len(), 1);
}

#[tokio::test]
async fn test_tool_results_follow_request_order() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::MessageDelta("Let me look both up.".to_owned()),
        PresetEvent::tool_call(
            "call_1",
            "retriever_tool",
            json!({ "query": "dividend policy" }),
        ),
        PresetEvent::tool_call(
            "call_2",
            "tavily_search_tool",
            json!({ "query": "AAPL news" }),
        ),
    ]));
    model_provider.add_response(PresetResponse::text("Here is a summary."));

    let agent = AgentBuilder::with_model_provider(model_provider)
        // The first tool finishes last.
        .with_tool(
            FakeTool::new("retriever_tool")
                .with_delay(Duration::from_millis(50)),
        )
        .with_tool(FakeTool::new("tavily_search_tool"))
        .build();
    let mut conversation = Conversation::new();
    agent
        .run(&mut conversation, "Summarize", &CancellationToken::new())
        .await
        .unwrap();

    let results = tool_results(&conversation);
    assert_eq!(
        results,
        [
            (
                "call_1".to_owned(),
                "retriever_tool result for dividend policy".to_owned()
            ),
            (
                "call_2".to_owned(),
                "tavily_search_tool result for AAPL news".to_owned()
            ),
        ]
    );
    let ModelMessage::Assistant(msg) = &conversation.messages()[1] else {
        panic!("expected an assistant message");
    };
    assert_eq!(msg.content, "Let me look both up.");
    assert_eq!(msg.tool_calls.len(), 2);
}

#[tokio::test]
async fn test_unknown_tool_is_reported_to_the_model() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call("call_1", "stock_oracle", json!({})),
    ]));
    model_provider.add_response(PresetResponse::text("I can't do that."));

    let agent = AgentBuilder::with_model_provider(model_provider).build();
    let mut conversation = Conversation::new();
    let answer = agent
        .run(&mut conversation, "Predict TSLA", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(answer, "I can't do that.");
    let results = tool_results(&conversation);
    assert_eq!(results[0].1, "Unknown tool `stock_oracle`");
}

#[tokio::test]
async fn test_iteration_limit() {
    let mut model_provider = TestModelProvider::default();
    for idx in 0..3 {
        model_provider.add_response(PresetResponse::with_events([
            PresetEvent::tool_call(
                format!("call_{idx}"),
                "tavily_search_tool",
                json!({ "query": "again" }),
            ),
        ]));
    }

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_tool(FakeTool::new("tavily_search_tool"))
        .with_max_iterations(2)
        .build();
    let mut conversation = Conversation::new();
    let err = agent
        .run(&mut conversation, "Loop forever", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IterationLimit);
    assert_eq!(model_provider.requests().len(), 2);
    // Every request in the conversation has its result.
    assert_eq!(
        roles(&conversation),
        [
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Assistant,
            Role::Tool
        ]
    );
}

#[tokio::test]
async fn test_cancel_while_running_tools() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call(
            "call_1",
            "retriever_tool",
            json!({ "query": "slow" }),
        ),
    ]));
    model_provider.add_response(PresetResponse::text("Done."));

    let started = Arc::new(tokio::sync::Notify::new());
    let agent = AgentBuilder::with_model_provider(model_provider)
        .with_tool(
            FakeTool::new("retriever_tool").with_delay(Duration::from_secs(60)),
        )
        .on_event({
            let started = Arc::clone(&started);
            move |event| {
                if matches!(event, AgentEvent::ToolCall(_)) {
                    started.notify_one();
                }
            }
        })
        .build();

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            started.notified().await;
            cancel.cancel();
        })
    };
    let mut conversation = Conversation::new();
    let err = agent
        .run(&mut conversation, "Search", &cancel)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    // No assistant message without its results.
    assert_eq!(roles(&conversation), [Role::User]);

    // The conversation can be resumed.
    let answer = agent
        .run(&mut conversation, "Never mind", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(answer, "Done.");
    assert_eq!(
        roles(&conversation),
        [Role::User, Role::User, Role::Assistant]
    );
}

#[tokio::test]
async fn test_cancel_while_awaiting_model() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::text("Too late."));
    model_provider.set_delay(Duration::from_secs(60));

    let agent = AgentBuilder::with_model_provider(model_provider).build();
    let cancel = CancellationToken::new();
    let mut conversation = Conversation::new();
    let run = agent.run(&mut conversation, "Hello", &cancel);
    let cancel_later = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, cancel_later);

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(roles(&conversation), [Role::User]);
}

#[tokio::test]
async fn test_retry_model_failures() {
    let mut model_provider = TestModelProvider::default();
    model_provider
        .add_response(PresetResponse::text("Recovered.").with_failures(2));

    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: None,
        })
        .build();
    let answer = agent
        .run(&mut Conversation::new(), "Hi", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(answer, "Recovered.");
    assert_eq!(model_provider.requests().len(), 3);
}

#[tokio::test]
async fn test_model_failure_ends_the_turn() {
    // An empty script fails with a non-retryable error.
    let model_provider = TestModelProvider::default();
    let agent = AgentBuilder::with_model_provider(model_provider.clone())
        .with_retry_policy(RetryPolicy::no_retry())
        .build();
    let err = agent
        .run(&mut Conversation::new(), "Hi", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Model);
    assert_eq!(
        err.model_error_kind(),
        Some(market_agent_model::ErrorKind::Other)
    );
    assert_eq!(model_provider.requests().len(), 1);
}

#[tokio::test]
async fn test_events() {
    let mut model_provider = TestModelProvider::default();
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call(
            "call_1",
            "polygon_financials_tool",
            json!({ "query": "MSFT" }),
        ),
    ]));
    model_provider.add_response(PresetResponse::with_events([
        PresetEvent::MessageDelta("MSFT ".to_owned()),
        PresetEvent::MessageDelta("looks fine.".to_owned()),
    ]));

    let events = Arc::new(Mutex::new(vec![]));
    let agent = AgentBuilder::with_model_provider(model_provider)
        .with_tool(FakeTool::new("polygon_financials_tool"))
        .on_event({
            let events = Arc::clone(&events);
            move |event| events.lock().unwrap().push(event)
        })
        .build();
    agent
        .run(&mut Conversation::new(), "MSFT?", &CancellationToken::new())
        .await
        .unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], AgentEvent::ToolCall(req) if req.id == "call_1"));
    assert!(matches!(
        &events[1],
        AgentEvent::ToolResult { is_error: false, result }
            if result.content == "polygon_financials_tool result for MSFT"
    ));
    assert_eq!(events[2], AgentEvent::MessageDelta("MSFT ".to_owned()));
    assert_eq!(events[3], AgentEvent::MessageDelta("looks fine.".to_owned()));
}
