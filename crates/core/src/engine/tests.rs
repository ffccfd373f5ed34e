use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use supercli_model::{ModelMessage, ToolCallRequest};
use supercli_session::{Content, Role, Session, SessionStore};
use supercli_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::tool::{Error as ToolError, Tool, ToolResult};
use crate::{EngineBuilder, EngineError, EngineState, TurnContext, TurnEnd};

static EMPTY_SCHEMA: LazyLock<Value> =
    LazyLock::new(|| json!({ "type": "object" }));

#[derive(Deserialize)]
struct PathInput {
    path: String,
}

/// Reads files below a root directory.
struct ReadFile(PathBuf);

impl Tool for ReadFile {
    type Input = PathInput;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a file"
    }

    fn parameter_schema(&self) -> &Value {
        &EMPTY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let path = self.0.join(input.path);
        async move { Ok(tokio::fs::read_to_string(path).await?) }
    }
}

/// Sleeps, then answers with a fixed output or error.
struct Delayed {
    name: &'static str,
    delay: Duration,
    result: ToolResult,
}

impl Tool for Delayed {
    type Input = Value;

    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "A tool for testing"
    }

    fn parameter_schema(&self) -> &Value {
        &EMPTY_SCHEMA
    }

    fn execute(
        &self,
        _input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let delay = self.delay;
        let result = self.result.clone();
        async move {
            sleep(delay).await;
            result
        }
    }
}

fn call(id: &str, name: &str, arguments: Value) -> PresetEvent {
    PresetEvent::ToolCall(ToolCallRequest {
        id: id.to_owned(),
        name: name.to_owned(),
        arguments,
    })
}

fn text(delta: &str) -> PresetEvent {
    PresetEvent::MessageDelta(delta.to_owned())
}

#[tokio::test]
async fn test_simple_reply_is_persisted() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([
        text("Hi! "),
        text("How can I help?"),
    ]));

    let transcript = Arc::new(Mutex::new(String::new()));
    let engine = EngineBuilder::with_model_provider(provider)
        .system_prompt("Be brief.")
        .on_transcript({
            let transcript = Arc::clone(&transcript);
            move |delta| transcript.lock().unwrap().push_str(delta)
        })
        .build();

    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session).with_store(&store);
    let outcome = engine.run_turn(&mut ctx, "hello").await.unwrap();

    assert_eq!(outcome.end, TurnEnd::Completed);
    assert_eq!(outcome.tool_rounds, 0);
    assert_eq!(*transcript.lock().unwrap(), "Hi! How can I help?");
    assert_eq!(engine.state(), EngineState::Idle);

    assert_eq!(session.len(), 2);
    assert_eq!(session.messages()[0].role, Role::User);
    assert_eq!(session.messages()[1].text(), "Hi! How can I help?");
    assert!(session.messages()[1].tokens > 0);
    assert!(session.usage.prompt_tokens > 0);
    assert!(session.usage.completion_tokens > 0);

    assert_eq!(store.load(session.id).unwrap(), session);
}

#[tokio::test]
async fn test_tool_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "buy milk").unwrap();

    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([call(
        "call_0",
        "read_file",
        json!({ "path": "notes.txt" }),
    )]));
    provider.add_assistant_response_step(PresetResponse::with_text(
        "Your notes say: buy milk",
    ));

    let engine = EngineBuilder::with_model_provider(provider.clone())
        .with_tool(ReadFile(dir.path().to_owned()))
        .build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    let outcome = engine
        .run_turn(&mut ctx, "what's in my notes?")
        .await
        .unwrap();
    assert_eq!(outcome.tool_rounds, 1);

    let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(session.messages()[1].tool_calls().len(), 1);
    assert_eq!(
        session.messages()[2].content,
        Content::ToolResult {
            call_id: "call_0".to_owned(),
            output: "buy milk".to_owned(),
            is_error: false,
        }
    );
    assert!(session.messages()[3].text().contains("buy milk"));

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert!(requests[1].messages.iter().any(|msg| matches!(
        msg,
        ModelMessage::Tool(result) if result.content == "buy milk"
    )));
}

#[tokio::test]
async fn test_tool_error_is_relayed_and_turn_continues() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([call(
        "call_0",
        "run_command",
        json!({ "command": "sleep 100" }),
    )]));
    provider.add_assistant_response_step(PresetResponse::with_text(
        "The command timed out.",
    ));

    let engine = EngineBuilder::with_model_provider(provider.clone())
        .with_tool(Delayed {
            name: "run_command",
            delay: Duration::ZERO,
            result: Err(
                ToolError::timeout().with_reason("timed out after 30s")
            ),
        })
        .build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    let outcome = engine.run_turn(&mut ctx, "run it").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Completed);

    let Content::ToolResult {
        output, is_error, ..
    } = &session.messages()[2].content
    else {
        panic!("expected a tool result");
    };
    assert!(is_error);
    assert!(output.starts_with("Timeout"));
    assert_eq!(session.len(), 4);
}

#[tokio::test]
async fn test_unknown_tool_is_relayed() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([call(
        "call_0",
        "launch_rocket",
        json!({}),
    )]));
    provider.add_assistant_response_step(PresetResponse::with_text("Sorry."));

    let engine = EngineBuilder::with_model_provider(provider).build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    engine.run_turn(&mut ctx, "go").await.unwrap();
    assert!(session.messages()[2].text().starts_with("Tool not found"));
}

#[tokio::test]
async fn test_consecutive_failures_abort_turn() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([
        call("call_0", "broken", json!({})),
        call("call_1", "broken", json!({})),
    ]));
    provider.add_assistant_response_step(PresetResponse::with_events([call(
        "call_2",
        "broken",
        json!({}),
    )]));

    let engine = EngineBuilder::with_model_provider(provider)
        .with_tool(Delayed {
            name: "broken",
            delay: Duration::ZERO,
            result: Err(ToolError::execution_error()),
        })
        .build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    let err = engine.run_turn(&mut ctx, "try").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ToolExecutionLimitExceeded { failures: 3 }
    ));
    // Every call still got its result.
    assert_eq!(session.len(), 6);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_results_keep_call_order() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([
        call("call_a", "list_directory", json!({ "path": "." })),
        call("call_b", "get_current_directory", json!({})),
    ]));
    provider.add_assistant_response_step(PresetResponse::with_text("Done."));

    let engine = EngineBuilder::with_model_provider(provider)
        .with_tool(Delayed {
            name: "list_directory",
            delay: Duration::from_millis(200),
            result: Ok("[FILE] a.txt".to_owned()),
        })
        .with_tool(Delayed {
            name: "get_current_directory",
            delay: Duration::from_millis(10),
            result: Ok("/work".to_owned()),
        })
        .build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    let start = Instant::now();
    engine.run_turn(&mut ctx, "where am I?").await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(300));

    let ids: Vec<_> = session
        .messages()
        .iter()
        .filter_map(|msg| msg.result_call_id())
        .collect();
    assert_eq!(ids, ["call_a", "call_b"]);
}

#[tokio::test]
async fn test_tool_loop_cap() {
    let mut provider = TestModelProvider::default();
    for i in 0..3 {
        provider.add_assistant_response_step(PresetResponse::with_events([
            call(&format!("call_{i}"), "noop", json!({})),
        ]));
    }

    let engine = EngineBuilder::with_model_provider(provider)
        .with_tool(Delayed {
            name: "noop",
            delay: Duration::ZERO,
            result: Ok("ok".to_owned()),
        })
        .max_tool_rounds(2)
        .build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    let err = engine.run_turn(&mut ctx, "loop").await.unwrap_err();
    assert!(matches!(err, EngineError::ToolLoopExceeded { rounds: 2 }));
    // user + 2 rounds of (call, result), the third call was never recorded.
    assert_eq!(session.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_tools_answers_every_call() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([
        call("fast", "quick", json!({})),
        call("slow", "slow", json!({})),
    ]));

    let engine = EngineBuilder::with_model_provider(provider)
        .with_tool(Delayed {
            name: "quick",
            delay: Duration::from_millis(1),
            result: Ok("done".to_owned()),
        })
        .with_tool(Delayed {
            name: "slow",
            delay: Duration::from_secs(60),
            result: Ok("never".to_owned()),
        })
        .build();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    });

    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session).with_cancel(cancel);
    let outcome = engine.run_turn(&mut ctx, "go").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Cancelled);
    assert_eq!(engine.state(), EngineState::Idle);

    assert_eq!(session.len(), 4);
    assert_eq!(session.messages()[2].text(), "done");
    assert_eq!(
        session.messages()[3].content,
        Content::ToolResult {
            call_id: "slow".to_owned(),
            output: "Cancelled".to_owned(),
            is_error: true,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_stream_keeps_partial_text() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(PresetResponse::with_events([
        text("Let me think"),
        PresetEvent::Hang,
    ]));

    let cancel = CancellationToken::new();
    let engine = EngineBuilder::with_model_provider(provider)
        .on_transcript({
            let cancel = cancel.clone();
            move |_| cancel.cancel()
        })
        .build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session).with_cancel(cancel);
    let outcome = engine.run_turn(&mut ctx, "think").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Cancelled);

    assert_eq!(session.len(), 2);
    assert_eq!(session.messages()[1].text(), "Let me think");
    assert!(session.messages()[1].incomplete);
}

#[tokio::test]
async fn test_provider_error_keeps_history() {
    let mut provider = TestModelProvider::default();
    provider.add_assistant_response_step(
        PresetResponse::with_text("unreachable")
            .with_failures(0)
            .with_failure_kind(supercli_model::ErrorKind::Auth),
    );
    let engine = EngineBuilder::with_model_provider(provider).build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    let err = engine.run_turn(&mut ctx, "hello").await.unwrap_err();
    assert!(err.needs_login());
    assert_eq!(session.len(), 1);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_compress_with_summary() {
    let mut provider = TestModelProvider::default();
    for i in 0..3 {
        provider.add_assistant_response_step(PresetResponse::with_text(
            format!("answer {i}"),
        ));
    }
    provider.add_assistant_response_step(PresetResponse::with_text(
        "The user asked three questions.",
    ));

    let engine = EngineBuilder::with_model_provider(provider.clone()).build();
    let mut session = Session::new();
    let mut ctx = TurnContext::new(&mut session);
    for i in 0..3 {
        engine
            .run_turn(&mut ctx, format!("question {i}"))
            .await
            .unwrap();
    }
    assert_eq!(ctx.session.len(), 6);

    let summarized = engine.compress(&mut ctx, 2).await.unwrap();
    assert_eq!(summarized, 4);
    assert_eq!(session.len(), 3);
    assert_eq!(session.messages()[0].role, Role::System);
    assert!(session.messages()[0].text().contains("three questions"));
    assert_eq!(session.messages()[1].text(), "question 2");

    // The summary request carried no tools and only the summarized prefix.
    let summary_request = provider.requests().pop().unwrap();
    assert!(summary_request.tools.is_empty());
    assert_eq!(summary_request.messages.len(), 6);
}
