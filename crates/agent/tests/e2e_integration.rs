//! End-to-end integration tests for the Aegis agent runtime.
//!
//! These tests wire a real bus, real session stores and one or more agent
//! loops together, then drive them the way an embedding process would: by
//! publishing turns and waiting for the terminal event.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aegis_agent::{AgentClient, AgentLoop, AgentLoopConfig};
use aegis_core::agent::AgentConfig;
use aegis_core::bus::{EventBus, EventFilter};
use aegis_core::error::{Error, ProviderError, ToolError};
use aegis_core::event::{Event, EventPayload, Topic, TraceContext};
use aegis_core::message::{Message, Role};
use aegis_core::provider::{Generation, Provider};
use aegis_core::session::SessionStore;
use aegis_core::tool::{Tool, ToolCall, ToolRegistry};
use aegis_store::{InMemorySessionStore, SqliteSessionStore};
use async_trait::async_trait;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Mock Providers ───────────────────────────────────────────────────────

/// Decides each round from the history it is shown, like a real model would.
struct ReactiveProvider<F> {
    decide: F,
    calls: AtomicUsize,
}

impl<F> ReactiveProvider<F>
where
    F: Fn(&[Message]) -> Result<Generation, ProviderError> + Send + Sync,
{
    fn new(decide: F) -> Arc<Self> {
        Arc::new(Self {
            decide,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Provider for ReactiveProvider<F>
where
    F: Fn(&[Message]) -> Result<Generation, ProviderError> + Send + Sync,
{
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn generate(&self, history: &[Message]) -> Result<Generation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.decide)(history)
    }
}

fn last_user_message(history: &[Message]) -> &str {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

/// Remembers names from earlier user messages, so recall depends on hydration.
fn name_recall(history: &[Message]) -> Result<Generation, ProviderError> {
    let last = last_user_message(history);
    if let Some(name) = last.strip_prefix("My name is ") {
        return Ok(Generation::text(format!("Hello {name}")));
    }
    if last == "What is my name?" {
        let remembered = history
            .iter()
            .filter(|m| m.role == Role::User)
            .find_map(|m| m.content.strip_prefix("My name is "));
        return Ok(Generation::text(match remembered {
            Some(name) => format!("Your name is {name}"),
            None => "I don't know your name".to_string(),
        }));
    }
    Ok(Generation::text("ok"))
}

// ── Mock Tools ───────────────────────────────────────────────────────────

/// Writes files under a sandbox directory.
struct FsWriteTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs.write"
    }

    fn description(&self) -> &str {
        "Write text content to a file"
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'path'".into()))?;
        let content = arguments["content"].as_str().unwrap_or_default();
        tokio::fs::write(self.root.join(path), content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "fs.write".into(),
                reason: e.to_string(),
            })?;
        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }
}

/// Sleeps for `delay` before answering with its own name.
struct DelayedTool {
    name: &'static str,
    delay: Duration,
}

#[async_trait]
impl Tool for DelayedTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Answers after a fixed delay"
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<String, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(format!("{} finished", self.name))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

async fn start_agent(
    bus: &EventBus,
    agent: AgentConfig,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    store: Option<Arc<dyn SessionStore>>,
) -> AgentLoop {
    let mut config = AgentLoopConfig::new(agent, provider, bus.clone()).with_tools(tools);
    config.store = store;
    let agent = AgentLoop::new(config);
    agent.start().await.unwrap();
    agent
}

fn record(bus: &EventBus, filter: EventFilter) -> Arc<Mutex<Vec<Arc<Event>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(filter, move |event| {
        sink.lock().unwrap().push(event);
        async { Ok(()) }
    });
    seen
}

// ── E2E: Tool invocation ─────────────────────────────────────────────────

#[tokio::test]
async fn e2e_fs_write_then_done() {
    let sandbox = TempDir::new().unwrap();
    let bus = EventBus::new();
    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(FsWriteTool {
        root: sandbox.path().to_path_buf(),
    }));

    let provider = ReactiveProvider::new(|history: &[Message]| {
        let last = history.last().unwrap();
        if last.role == Role::Tool && last.content.starts_with("Wrote") {
            return Ok(Generation::text("Done"));
        }
        Ok(Generation::tool_calls(vec![ToolCall::new(
            "call_fs_write",
            "fs.write",
            serde_json::json!({ "path": "hello.txt", "content": "Hello Aegis" }),
        )]))
    });
    let _agent = start_agent(
        &bus,
        AgentConfig::new("aegis"),
        provider.clone(),
        tools,
        None,
    )
    .await;

    let client = AgentClient::new(bus, TIMEOUT);
    let reply = client
        .send("aegis", "Write 'Hello Aegis' to hello.txt", None)
        .await
        .unwrap();

    assert_eq!(reply, "Done");
    assert_eq!(provider.calls(), 2);
    let written = std::fs::read_to_string(sandbox.path().join("hello.txt")).unwrap();
    assert_eq!(written, "Hello Aegis");
}

// ── E2E: Crash recovery ──────────────────────────────────────────────────

#[tokio::test]
async fn e2e_session_recovered_after_store_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sessions.db").display().to_string();

    // First process: introduce ourselves, then shut everything down.
    let session_id = {
        let bus = EventBus::new();
        let store = Arc::new(SqliteSessionStore::new(&db_path).await.unwrap());
        let session = store.create("aegis", None).await.unwrap();
        let agent = start_agent(
            &bus,
            AgentConfig::new("aegis"),
            ReactiveProvider::new(name_recall),
            Arc::new(ToolRegistry::new()),
            Some(store.clone()),
        )
        .await;

        let client = AgentClient::new(bus.clone(), TIMEOUT);
        let reply = client
            .send("aegis", "My name is Logan", Some(session.id.clone()))
            .await
            .unwrap();
        assert_eq!(reply, "Hello Logan");

        agent.stop();
        bus.close();
        store.close().await;
        session.id
    };

    // Second process: fresh bus, fresh loop, same database file.
    let bus = EventBus::new();
    let store = Arc::new(SqliteSessionStore::new(&db_path).await.unwrap());
    let agent = start_agent(
        &bus,
        AgentConfig::new("aegis"),
        ReactiveProvider::new(name_recall),
        Arc::new(ToolRegistry::new()),
        Some(store.clone()),
    )
    .await;

    let client = AgentClient::new(bus, TIMEOUT);
    let reply = client
        .send("aegis", "What is my name?", Some(session_id.clone()))
        .await
        .unwrap();
    assert_eq!(reply, "Your name is Logan");

    let stored = store.get(&session_id).await.unwrap().unwrap();
    let contents: Vec<&str> = stored.history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["My name is Logan", "Hello Logan", "What is my name?", "Your name is Logan"]
    );
    assert_eq!(agent.session_id().await.as_deref(), Some(session_id.as_str()));
}

#[tokio::test]
async fn e2e_without_session_nothing_is_remembered() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sessions.db").display().to_string();
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(&db_path).await.unwrap());

    let bus = EventBus::new();
    let _agent = start_agent(
        &bus,
        AgentConfig::new("aegis"),
        ReactiveProvider::new(name_recall),
        Arc::new(ToolRegistry::new()),
        Some(store.clone()),
    )
    .await;
    let client = AgentClient::new(bus, TIMEOUT);
    client.send("aegis", "My name is Logan", None).await.unwrap();

    assert!(store.list_by_agent("aegis").await.unwrap().is_empty());
}

// ── Properties ───────────────────────────────────────────────────────────

#[tokio::test]
async fn every_turn_gets_exactly_one_terminal_event() {
    let bus = EventBus::new();
    let provider = ReactiveProvider::new(|history: &[Message]| match last_user_message(history) {
        "fail" => Err(ProviderError::ApiError {
            status_code: 500,
            message: "upstream exploded".into(),
        }),
        "loop" => Ok(Generation::tool_calls(vec![ToolCall::new(
            "c",
            "missing",
            serde_json::json!({}),
        )])),
        _ => Ok(Generation::text("fine")),
    });
    let _agent = start_agent(
        &bus,
        AgentConfig::new("aegis"),
        provider,
        Arc::new(ToolRegistry::new()),
        None,
    )
    .await;
    let terminals = record(
        &bus,
        EventFilter::all().topics([Topic::AgentComplete, Topic::AgentError]),
    );

    let mut turns = Vec::new();
    for text in ["hello", "fail", "loop", "hello again"] {
        let turn = Event::new(EventPayload::turn(text, None), TraceContext::root()).to_agent("aegis");
        bus.publish(turn.clone()).await.unwrap();
        turns.push(turn);
    }

    let terminals = terminals.lock().unwrap();
    assert_eq!(terminals.len(), turns.len());
    for turn in &turns {
        let replies: Vec<_> = terminals
            .iter()
            .filter(|t| t.trace.is_child_of(&turn.trace))
            .collect();
        assert_eq!(replies.len(), 1, "turn {:?}", turn.payload);
    }
}

#[tokio::test]
async fn endless_tool_calls_stop_after_ten_rounds() {
    let bus = EventBus::new();
    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(DelayedTool {
        name: "noop",
        delay: Duration::ZERO,
    }));
    let provider = ReactiveProvider::new(|_history: &[Message]| {
        Ok(Generation::tool_calls(vec![ToolCall::new(
            "c",
            "noop",
            serde_json::json!({}),
        )]))
    });
    let agent = start_agent(
        &bus,
        AgentConfig::new("aegis"),
        provider.clone(),
        tools,
        None,
    )
    .await;

    let client = AgentClient::new(bus, TIMEOUT);
    match client.send("aegis", "never stop", None).await {
        Err(Error::AgentFailed(message)) => assert_eq!(message, "Max iterations reached"),
        other => panic!("expected agent.error, got {other:?}"),
    }
    assert_eq!(provider.calls(), 10);
    assert_eq!(agent.stats().tool_calls, 10);
}

#[tokio::test]
async fn tool_results_follow_request_order_not_latency() {
    let bus = EventBus::new();
    let store = Arc::new(InMemorySessionStore::new());
    let session = store.create("aegis", None).await.unwrap();
    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(DelayedTool {
        name: "slow",
        delay: Duration::from_millis(50),
    }));
    tools.register(Arc::new(DelayedTool {
        name: "fast",
        delay: Duration::ZERO,
    }));

    let provider = ReactiveProvider::new(|history: &[Message]| {
        if history.last().is_some_and(|m| m.role == Role::Tool) {
            return Ok(Generation::text("both done"));
        }
        Ok(Generation::tool_calls(vec![
            ToolCall::new("call_x", "slow", serde_json::json!({})),
            ToolCall::new("call_y", "fast", serde_json::json!({})),
        ]))
    });
    let agent = start_agent(
        &bus,
        AgentConfig::new("aegis"),
        provider,
        tools,
        Some(store.clone()),
    )
    .await;

    let client = AgentClient::new(bus, TIMEOUT);
    let reply = client
        .send("aegis", "run both", Some(session.id.clone()))
        .await
        .unwrap();
    assert_eq!(reply, "both done");

    for history in [
        store.get(&session.id).await.unwrap().unwrap().history,
        agent.history().await,
    ] {
        let x = history.iter().position(|m| m.tool_call_id.as_deref() == Some("call_x"));
        let y = history.iter().position(|m| m.tool_call_id.as_deref() == Some("call_y"));
        assert!(x.unwrap() < y.unwrap());
        assert_eq!(history[x.unwrap()].content, "slow finished");
    }
}

#[tokio::test]
async fn topic_only_filter_sees_every_complete_and_no_error() {
    let bus = EventBus::new();
    let provider = ReactiveProvider::new(|history: &[Message]| match last_user_message(history) {
        "fail" => Err(ProviderError::Timeout("no answer".into())),
        _ => Ok(Generation::text("fine")),
    });
    let _agent = start_agent(
        &bus,
        AgentConfig::new("aegis"),
        provider,
        Arc::new(ToolRegistry::new()),
        None,
    )
    .await;
    let completes = record(&bus, EventFilter::all().topic(Topic::AgentComplete));

    let client = AgentClient::new(bus.clone(), TIMEOUT);
    client.send("aegis", "one", None).await.unwrap();
    assert!(client.send("aegis", "fail", None).await.is_err());
    client.send("aegis", "two", None).await.unwrap();
    // Completes that were never addressed to anyone still match on topic alone.
    bus.publish(Event::new(EventPayload::complete("broadcast"), TraceContext::root()))
        .await
        .unwrap();

    let completes = completes.lock().unwrap();
    assert_eq!(completes.len(), 3);
    assert!(completes.iter().all(|e| e.topic() == Topic::AgentComplete));
}

// ── E2E: Multiple agents ─────────────────────────────────────────────────

#[tokio::test]
async fn agents_on_one_bus_keep_separate_histories() {
    let bus = EventBus::new();
    let alpha = start_agent(
        &bus,
        AgentConfig::new("alpha"),
        ReactiveProvider::new(|_h: &[Message]| Ok(Generation::text("from alpha"))),
        Arc::new(ToolRegistry::new()),
        None,
    )
    .await;
    let beta = start_agent(
        &bus,
        AgentConfig::new("beta"),
        ReactiveProvider::new(|_h: &[Message]| Ok(Generation::text("from beta"))),
        Arc::new(ToolRegistry::new()),
        None,
    )
    .await;

    let client = AgentClient::new(bus, TIMEOUT).with_caller_id("tester");
    let (a, b) = tokio::join!(
        client.send("alpha", "hi alpha", None),
        client.send("beta", "hi beta", None),
    );
    assert_eq!(a.unwrap(), "from alpha");
    assert_eq!(b.unwrap(), "from beta");

    let alpha_history = alpha.history().await;
    let beta_history = beta.history().await;
    assert_eq!(alpha_history.len(), 3);
    assert_eq!(beta_history.len(), 3);
    assert_eq!(alpha_history[1].content, "hi alpha");
    assert_eq!(beta_history[1].content, "hi beta");
}
